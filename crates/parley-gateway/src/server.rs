//! TLS push server.
//!
//! Owns every live long-lived socket. Each accepted connection gets a
//! reader task, a writer task, and a supervising future. The writer is
//! the only thing that touches the socket's write half; everything
//! destined for the client — heartbeat pings included — goes through
//! the connection's bounded outbound channel.

use std::fs::File;
use std::io::BufReader as StdBufReader;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use bytes::Bytes;
use socket2::{SockRef, TcpKeepalive};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, watch};
use tokio::time::timeout;
use tokio_rustls::TlsAcceptor;
use tokio_rustls::rustls::pki_types::PrivateKeyDer;
use tokio_rustls::rustls::{self, version};
use tracing::{debug, error, info, trace, warn};

use crate::events::ConnectionEvent;

pub const PING_FRAME: &[u8] = b"_PING_\n";
pub const PONG_FRAME: &[u8] = b"_PONG_\n";

const PING_INTERVAL: Duration = Duration::from_secs(10);
/// Read deadline. Expiry is benign for the reader; the transport
/// keepalive is authoritative for death detection.
const PING_TIMEOUT: Duration = Duration::from_secs(5);
const WRITE_TIMEOUT: Duration = Duration::from_secs(5);
/// How long a freshly accepted client has to send its identity line.
const IDENTIFY_TIMEOUT: Duration = Duration::from_secs(5);

/// Outbound frames queued per connection before pushes get dropped.
const OUTBOUND_CAPACITY: usize = 10;

/// Identity line cap. Generous enough for any phone identifier; the
/// original protocol truncated at 8 bytes, which silently cut full
/// numbers short.
const MAX_IDENTITY_LEN: usize = 32;

const KEEPALIVE_IDLE: Duration = Duration::from_secs(60);
const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(10);
const KEEPALIVE_PROBES: u32 = 5;

/// Server certificate and key are loaded from fixed paths.
pub const CERTIFICATE_FILE: &str = "server.crt";
pub const KEY_FILE: &str = "server.key";

/// Accept loop. Returns on shutdown signal; in-flight connections are
/// torn down by their own tasks once their sockets die. TLS config
/// load failure and bind failure are the only fatal errors.
pub async fn run(
    port: u16,
    connection_tx: mpsc::Sender<ConnectionEvent>,
    mut shutdown: watch::Receiver<bool>,
) -> Result<()> {
    let tls_config = load_tls_config(CERTIFICATE_FILE, KEY_FILE)?;
    let acceptor = TlsAcceptor::from(Arc::new(tls_config));

    let listener = TcpListener::bind(("0.0.0.0", port))
        .await
        .with_context(|| format!("failed to bind push listener on port {port}"))?;
    info!(port, "push server listening");

    let active = Arc::new(AtomicUsize::new(0));

    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                info!("shutdown signal received, push listener closing");
                break;
            }
            accepted = listener.accept() => {
                let (stream, peer) = match accepted {
                    Ok(pair) => pair,
                    Err(e) => {
                        error!(error = %e, "accept failed");
                        continue;
                    }
                };

                if let Err(e) = configure_keepalive(&stream) {
                    warn!(%peer, error = %e, "failed to configure keepalive");
                    continue;
                }

                let acceptor = acceptor.clone();
                let connection_tx = connection_tx.clone();
                let active = Arc::clone(&active);
                let shutdown = shutdown.clone();
                tokio::spawn(async move {
                    let tls_stream = match acceptor.accept(stream).await {
                        Ok(s) => s,
                        Err(e) => {
                            warn!(%peer, error = %e, "tls handshake failed");
                            return;
                        }
                    };
                    handle_connection(tls_stream, peer, connection_tx, active, shutdown).await;
                });
            }
        }
    }

    info!("push server stopped");
    Ok(())
}

fn configure_keepalive(stream: &tokio::net::TcpStream) -> std::io::Result<()> {
    let keepalive = TcpKeepalive::new()
        .with_time(KEEPALIVE_IDLE)
        .with_interval(KEEPALIVE_INTERVAL)
        .with_retries(KEEPALIVE_PROBES);
    SockRef::from(stream).set_tcp_keepalive(&keepalive)
}

fn load_tls_config(cert_path: &str, key_path: &str) -> Result<rustls::ServerConfig> {
    let certs = rustls_pemfile::certs(&mut StdBufReader::new(
        File::open(cert_path)
            .with_context(|| format!("failed to open certificate file {cert_path}"))?,
    ))
    .collect::<std::result::Result<Vec<_>, _>>()
    .context("failed to parse server certificate")?;

    let key: PrivateKeyDer<'static> = rustls_pemfile::private_key(&mut StdBufReader::new(
        File::open(key_path).with_context(|| format!("failed to open key file {key_path}"))?,
    ))
    .context("failed to parse server key")?
    .ok_or_else(|| anyhow!("no private key found in {key_path}"))?;

    let config = rustls::ServerConfig::builder_with_protocol_versions(&[
        &version::TLS13,
        &version::TLS12,
    ])
    .with_no_client_auth()
    .with_single_cert(certs, key)
    .context("invalid certificate/key pair")?;

    Ok(config)
}

/// Identify the client, register it, then run the reader/writer pair
/// until one of them signals the stop channel.
async fn handle_connection<S>(
    stream: S,
    peer: SocketAddr,
    connection_tx: mpsc::Sender<ConnectionEvent>,
    active: Arc<AtomicUsize>,
    mut shutdown: watch::Receiver<bool>,
) where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (read_half, write_half) = tokio::io::split(stream);
    let mut reader = BufReader::new(read_half);

    // first read: one framed identifier under a deadline
    let mut line = String::new();
    let phonenumber = match timeout(IDENTIFY_TIMEOUT, reader.read_line(&mut line)).await {
        Ok(Ok(n)) if n > 0 => {
            let identity = line.trim();
            if identity.is_empty() || identity.len() > MAX_IDENTITY_LEN {
                warn!(%peer, "invalid identity line, closing");
                return;
            }
            identity.to_string()
        }
        Ok(_) => {
            warn!(%peer, "connection closed before identifying");
            return;
        }
        Err(_) => {
            warn!(%peer, "client failed to identify in time, closing");
            return;
        }
    };
    info!(%peer, phonenumber, "connection accepted");

    let (outbound_tx, outbound_rx) = mpsc::channel::<Bytes>(OUTBOUND_CAPACITY);
    if connection_tx
        .send(ConnectionEvent::Connected {
            phonenumber: phonenumber.clone(),
            sender: outbound_tx.clone(),
        })
        .await
        .is_err()
    {
        warn!(phonenumber, "connection event queue closed, dropping connection");
        return;
    }

    active.fetch_add(1, Ordering::Relaxed);

    let (stop_tx, mut stop_rx) = mpsc::channel::<()>(2);
    let reader_task = tokio::spawn(run_reader(
        reader,
        phonenumber.clone(),
        outbound_tx,
        connection_tx.clone(),
        stop_tx.clone(),
    ));
    let writer_task = tokio::spawn(run_writer(
        write_half,
        phonenumber.clone(),
        outbound_rx,
        connection_tx,
        stop_tx,
    ));

    // supervisor: a dying task or the process shutdown signal tears
    // the session down; aborting the tasks drops the socket halves
    tokio::select! {
        _ = stop_rx.recv() => {}
        _ = shutdown.changed() => {
            debug!(phonenumber, "shutdown signal, closing connection");
        }
    }
    reader_task.abort();
    writer_task.abort();
    active.fetch_sub(1, Ordering::Relaxed);
    info!(%peer, phonenumber, "connection closed");
}

/// Reader half of the heartbeat. Read-deadline expiry is logged and
/// tolerated; EOF and I/O errors end the session.
async fn run_reader<R>(
    mut reader: BufReader<R>,
    phonenumber: String,
    outbound: mpsc::Sender<Bytes>,
    connection_tx: mpsc::Sender<ConnectionEvent>,
    stop_tx: mpsc::Sender<()>,
) where
    R: AsyncRead + Unpin + Send,
{
    let mut line = String::new();
    loop {
        line.clear();
        match timeout(PING_TIMEOUT, reader.read_line(&mut line)).await {
            Err(_) => {
                trace!(phonenumber, "read deadline passed");
                continue;
            }
            Ok(Ok(0)) => {
                debug!(phonenumber, "client closed connection");
                break;
            }
            Ok(Err(e)) => {
                debug!(phonenumber, error = %e, "read failed");
                break;
            }
            Ok(Ok(_)) => match line.trim_end_matches(['\r', '\n']) {
                "_PING_" => {
                    if outbound.try_send(Bytes::from_static(PONG_FRAME)).is_err() {
                        debug!(phonenumber, "outbound channel busy, pong dropped");
                    }
                }
                "_PONG_" => {
                    trace!(phonenumber, "pong received");
                }
                _ => {}
            },
        }
    }

    let _ = connection_tx
        .send(ConnectionEvent::Disconnected {
            phonenumber: phonenumber.clone(),
        })
        .await;
    let _ = stop_tx.send(()).await;
    debug!(phonenumber, "connection reader exiting");
}

/// Writer half of the heartbeat: pings every [`PING_INTERVAL`] and
/// drains the outbound channel. Any write failure is fatal for the
/// session.
async fn run_writer<W>(
    mut writer: W,
    phonenumber: String,
    mut outbound: mpsc::Receiver<Bytes>,
    connection_tx: mpsc::Sender<ConnectionEvent>,
    stop_tx: mpsc::Sender<()>,
) where
    W: AsyncWrite + Unpin + Send,
{
    let mut ticker = tokio::time::interval(PING_INTERVAL);
    // the immediate first tick would ping before the client settles
    ticker.tick().await;

    loop {
        let written = tokio::select! {
            frame = outbound.recv() => match frame {
                Some(frame) => write_frame(&mut writer, &frame).await,
                None => {
                    debug!(phonenumber, "outbound channel closed");
                    break;
                }
            },
            _ = ticker.tick() => write_frame(&mut writer, PING_FRAME).await,
        };

        if let Err(e) = written {
            debug!(phonenumber, error = %e, "write failed");
            let _ = connection_tx
                .send(ConnectionEvent::Disconnected {
                    phonenumber: phonenumber.clone(),
                })
                .await;
            break;
        }
    }

    let _ = stop_tx.send(()).await;
    debug!(phonenumber, "connection writer exiting");
}

async fn write_frame<W>(writer: &mut W, frame: &[u8]) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    timeout(WRITE_TIMEOUT, async {
        writer.write_all(frame).await?;
        writer.flush().await
    })
    .await
    .map_err(|_| std::io::Error::new(std::io::ErrorKind::TimedOut, "write deadline exceeded"))?
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    fn stop_channel() -> (mpsc::Sender<()>, mpsc::Receiver<()>) {
        mpsc::channel(2)
    }

    #[tokio::test]
    async fn reader_answers_ping_with_pong() {
        let (mut client, server) = tokio::io::duplex(256);
        let (outbound_tx, mut outbound_rx) = mpsc::channel::<Bytes>(OUTBOUND_CAPACITY);
        let (conn_tx, mut conn_rx) = mpsc::channel(4);
        let (stop_tx, mut stop_rx) = stop_channel();

        let (server_read, _server_write) = tokio::io::split(server);
        let reader = tokio::spawn(run_reader(
            BufReader::new(server_read),
            "111".into(),
            outbound_tx,
            conn_tx,
            stop_tx,
        ));

        client.write_all(PING_FRAME).await.unwrap();
        let pong = outbound_rx.recv().await.unwrap();
        assert_eq!(&pong[..], PONG_FRAME);

        // client goes away: reader emits a disconnect and signals stop
        drop(client);

        match conn_rx.recv().await.unwrap() {
            ConnectionEvent::Disconnected { phonenumber } => assert_eq!(phonenumber, "111"),
            _ => panic!("expected a disconnect event"),
        }
        assert!(stop_rx.recv().await.is_some());
        reader.await.unwrap();
    }

    #[tokio::test]
    async fn reader_tolerates_pong_and_unknown_lines() {
        let (mut client, server) = tokio::io::duplex(256);
        let (outbound_tx, mut outbound_rx) = mpsc::channel::<Bytes>(OUTBOUND_CAPACITY);
        let (conn_tx, mut conn_rx) = mpsc::channel(4);
        let (stop_tx, _stop_rx) = stop_channel();

        let (server_read, _server_write) = tokio::io::split(server);
        let reader = tokio::spawn(run_reader(
            BufReader::new(server_read),
            "111".into(),
            outbound_tx,
            conn_tx,
            stop_tx,
        ));

        client.write_all(PONG_FRAME).await.unwrap();
        client.write_all(b"garbage\n").await.unwrap();
        drop(client);

        // neither line produced an outbound frame; the only event is
        // the final disconnect
        match conn_rx.recv().await.unwrap() {
            ConnectionEvent::Disconnected { .. } => {}
            _ => panic!("expected a disconnect event"),
        }
        assert!(outbound_rx.try_recv().is_err());
        reader.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn reader_survives_read_deadline_expiry() {
        let (mut client, server) = tokio::io::duplex(256);
        let (outbound_tx, mut outbound_rx) = mpsc::channel::<Bytes>(OUTBOUND_CAPACITY);
        let (conn_tx, mut conn_rx) = mpsc::channel(4);
        let (stop_tx, _stop_rx) = stop_channel();

        let (server_read, _server_write) = tokio::io::split(server);
        let reader = tokio::spawn(run_reader(
            BufReader::new(server_read),
            "111".into(),
            outbound_tx,
            conn_tx,
            stop_tx,
        ));

        // several silent deadline windows pass; the reader keeps going
        tokio::time::sleep(PING_TIMEOUT * 3).await;
        assert!(conn_rx.try_recv().is_err(), "quiet reader must not disconnect");

        client.write_all(PING_FRAME).await.unwrap();
        let pong = outbound_rx.recv().await.unwrap();
        assert_eq!(&pong[..], PONG_FRAME);

        drop(client);
        match conn_rx.recv().await.unwrap() {
            ConnectionEvent::Disconnected { .. } => {}
            _ => panic!("expected a disconnect event"),
        }
        reader.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn writer_pings_on_the_interval() {
        let (mut client, server) = tokio::io::duplex(256);
        let (_outbound_tx, outbound_rx) = mpsc::channel::<Bytes>(OUTBOUND_CAPACITY);
        let (conn_tx, _conn_rx) = mpsc::channel(4);
        let (stop_tx, _stop_rx) = stop_channel();

        let (_server_read, server_write) = tokio::io::split(server);
        let writer = tokio::spawn(run_writer(
            server_write,
            "111".into(),
            outbound_rx,
            conn_tx,
            stop_tx,
        ));

        tokio::time::sleep(PING_INTERVAL + Duration::from_millis(100)).await;
        let mut buf = [0u8; PING_FRAME.len()];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, PING_FRAME);

        writer.abort();
    }

    #[tokio::test]
    async fn writer_forwards_outbound_frames() {
        let (mut client, server) = tokio::io::duplex(256);
        let (outbound_tx, outbound_rx) = mpsc::channel::<Bytes>(OUTBOUND_CAPACITY);
        let (conn_tx, _conn_rx) = mpsc::channel(4);
        let (stop_tx, _stop_rx) = stop_channel();

        let (_server_read, server_write) = tokio::io::split(server);
        let writer = tokio::spawn(run_writer(
            server_write,
            "111".into(),
            outbound_rx,
            conn_tx,
            stop_tx,
        ));

        outbound_tx
            .send(Bytes::from_static(b"NEW_MESSAGE|{}"))
            .await
            .unwrap();

        let mut buf = [0u8; 14];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"NEW_MESSAGE|{}");

        writer.abort();
    }

    #[tokio::test]
    async fn writer_emits_disconnect_on_write_failure() {
        let (client, server) = tokio::io::duplex(16);
        let (outbound_tx, outbound_rx) = mpsc::channel::<Bytes>(OUTBOUND_CAPACITY);
        let (conn_tx, mut conn_rx) = mpsc::channel(4);
        let (stop_tx, mut stop_rx) = stop_channel();

        // peer is gone entirely: writes fail immediately
        drop(client);

        let (_server_read, server_write) = tokio::io::split(server);
        let writer = tokio::spawn(run_writer(
            server_write,
            "111".into(),
            outbound_rx,
            conn_tx,
            stop_tx,
        ));

        outbound_tx
            .send(Bytes::from_static(b"NEW_MESSAGE|{}"))
            .await
            .unwrap();

        match conn_rx.recv().await.unwrap() {
            ConnectionEvent::Disconnected { phonenumber } => assert_eq!(phonenumber, "111"),
            _ => panic!("expected a disconnect event"),
        }
        assert!(stop_rx.recv().await.is_some());
        writer.await.unwrap();
    }
}
