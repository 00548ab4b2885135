//! Parley server binary: loads configuration from the environment,
//! wires the store, cache, event bus, and OTP service together, then
//! runs the REST API server and the TLS push server until a shutdown
//! signal arrives.

use std::process;
use std::sync::Arc;

use anyhow::Result;
use axum::http::{HeaderValue, Method};
use tokio::signal;
use tokio::sync::watch;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use parley_api::otp::{OtpConfig, OtpService};
use parley_api::state::ApiState;
use parley_cache::DynamicShardedCache;
use parley_db::Database;
use parley_gateway::events::{self, EventBus};
use parley_gateway::registry::ConnectionRegistry;

const CACHE_MIN_SHARDS: usize = 4;
const CACHE_MAX_SHARDS: usize = 16;

/// Startup configuration. Every field is required; anything missing
/// is fatal before either server binds.
struct Config {
    tcp_port: u16,
    rest_api_port: u16,
    jwt_secret: String,
    database_uri: String,
    twilio_account_sid: String,
    twilio_auth_token: String,
    verify_service_sid: String,
    otp_channel: String,
}

impl Config {
    fn from_env() -> Self {
        Self {
            tcp_port: required_port("TCP_PORT"),
            rest_api_port: required_port("REST_API_PORT"),
            jwt_secret: required_env("ACCESS_TOKEN_SECRET"),
            database_uri: required_env("DATABASE_URI"),
            twilio_account_sid: required_env("TWILIO_ACCOUNT_SID"),
            twilio_auth_token: required_env("TWILIO_AUTH_TOKEN"),
            verify_service_sid: required_env("VERIFY_SERVICE_SID"),
            otp_channel: required_env("CHANNEL"),
        }
    }
}

fn required_env(name: &str) -> String {
    match std::env::var(name) {
        Ok(value) if !value.is_empty() => value,
        _ => {
            error!("required environment variable {name} not set");
            process::exit(1);
        }
    }
}

fn required_port(name: &str) -> u16 {
    match required_env(name).parse() {
        Ok(port) => port,
        Err(_) => {
            error!("environment variable {name} is not a valid port");
            process::exit(1);
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "parley=debug,tower_http=info".into()),
        )
        .init();

    let config = Config::from_env();

    let db = match Database::connect(&config.database_uri).await {
        Ok(db) => db,
        Err(e) => {
            error!(error = %e, "failed to connect to database");
            process::exit(1);
        }
    };

    // shared infrastructure; consumers start before either server
    // accepts traffic
    let registry = Arc::new(ConnectionRegistry::new());
    let (bus, bus_handles) = events::start(Arc::clone(&registry), db.clone());
    let cache = DynamicShardedCache::new(CACHE_MIN_SHARDS, CACHE_MAX_SHARDS);
    let otp = OtpService::new(OtpConfig {
        account_sid: config.twilio_account_sid,
        auth_token: config.twilio_auth_token,
        verify_service_sid: config.verify_service_sid,
        channel: config.otp_channel,
    });

    let api_state = Arc::new(ApiState {
        db,
        jwt_secret: config.jwt_secret,
        otp: otp.clone(),
        cache: Arc::clone(&cache),
        message_events: bus.messages.clone(),
        group_events: bus.groups.clone(),
    });
    let app = parley_api::router(api_state)
        .layer(build_cors_layer())
        .layer(TraceLayer::new_for_http());

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let mut push_server = tokio::spawn(parley_gateway::server::run(
        config.tcp_port,
        bus.connections.clone(),
        shutdown_rx.clone(),
    ));

    let rest_listener =
        match tokio::net::TcpListener::bind(("0.0.0.0", config.rest_api_port)).await {
            Ok(listener) => listener,
            Err(e) => {
                error!(error = %e, "failed to bind rest listener");
                process::exit(1);
            }
        };
    info!(port = config.rest_api_port, "rest server listening");

    let mut rest_shutdown = shutdown_rx.clone();
    let mut rest_server = tokio::spawn(async move {
        axum::serve(rest_listener, app)
            .with_graceful_shutdown(async move {
                let _ = rest_shutdown.changed().await;
            })
            .await
    });

    // run until a signal arrives or a server dies on startup
    tokio::select! {
        _ = shutdown_signal() => {
            info!("shutdown signal received");
        }
        result = &mut push_server => {
            match result {
                Ok(Err(e)) => error!(error = %e, "push server failed"),
                Err(e) => error!(error = %e, "push server task panicked"),
                Ok(Ok(())) => error!("push server stopped unexpectedly"),
            }
            process::exit(1);
        }
        result = &mut rest_server => {
            match result {
                Ok(Err(e)) => error!(error = %e, "rest server failed"),
                Err(e) => error!(error = %e, "rest server task panicked"),
                Ok(Ok(())) => error!("rest server stopped unexpectedly"),
            }
            process::exit(1);
        }
    }

    // 1. stop accepting: both listeners observe the signal; in-flight
    //    push connections are closed by their supervisors
    let _ = shutdown_tx.send(true);
    match rest_server.await {
        Ok(Ok(())) => info!("rest server stopped"),
        Ok(Err(e)) => error!(error = %e, "rest server failed during shutdown"),
        Err(e) => error!(error = %e, "rest server task failed during shutdown"),
    }
    match push_server.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => error!(error = %e, "push server failed during shutdown"),
        Err(e) => error!(error = %e, "push server task failed during shutdown"),
    }

    // 2. stop the background monitors
    otp.stop_sweeper();
    cache.stop_monitoring();

    // 3. close the event queues — connection, message, group — then
    //    wait for the consumers to drain
    let EventBus {
        messages,
        groups,
        connections,
    } = bus;
    drop(connections);
    drop(messages);
    drop(groups);
    bus_handles.wait().await;

    info!("shutdown complete");
    Ok(())
}

/// CORS for browser clients: localhost dev origins by default, more
/// via the PARLEY_CORS_ORIGINS env var (comma-separated list of
/// origins, e.g. "http://192.168.1.5:5173,https://chat.example.com").
fn build_cors_layer() -> CorsLayer {
    let mut origins: Vec<HeaderValue> = vec![
        HeaderValue::from_static("http://localhost"),
        HeaderValue::from_static("http://localhost:5173"),
    ];

    if let Ok(extra) = std::env::var("PARLEY_CORS_ORIGINS") {
        for raw in extra.split(',') {
            let trimmed = raw.trim();
            if trimmed.is_empty() {
                continue;
            }
            match trimmed.parse::<HeaderValue>() {
                Ok(value) => origins.push(value),
                Err(_) => warn!(origin = trimmed, "ignoring invalid CORS origin"),
            }
        }
    }

    CorsLayer::new()
        .allow_origin(AllowOrigin::list(origins))
        .allow_methods([
            Method::GET,
            Method::POST,
            Method::PUT,
            Method::DELETE,
            Method::OPTIONS,
        ])
        .allow_headers(tower_http::cors::Any)
        .allow_credentials(false)
}

async fn shutdown_signal() {
    let ctrl_c = signal::ctrl_c();

    #[cfg(unix)]
    {
        let mut sigterm = match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(sigterm) => sigterm,
            Err(e) => {
                error!(error = %e, "failed to install SIGTERM handler");
                let _ = ctrl_c.await;
                return;
            }
        };
        tokio::select! {
            _ = ctrl_c => {}
            _ = sigterm.recv() => {}
        }
    }

    #[cfg(not(unix))]
    {
        let _ = ctrl_c.await;
    }
}
