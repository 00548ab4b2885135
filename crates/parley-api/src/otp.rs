//! OTP issuance and verification against the Twilio Verify API.
//!
//! The provider is opaque: a verification check comes back approved,
//! failed, or expired. A local side-cache remembers in-flight
//! verifications per phonenumber so repeated send requests inside the
//! validity window don't hammer the provider; a background sweeper
//! prunes entries once they lapse.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde::Deserialize;
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// How long a sent OTP stays valid (and resends stay debounced).
const OTP_VALIDITY: Duration = Duration::from_secs(600);
const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

const VERIFY_BASE_URL: &str = "https://verify.twilio.com/v2/Services";

#[derive(Debug, Clone)]
pub struct OtpConfig {
    pub account_sid: String,
    pub auth_token: String,
    pub verify_service_sid: String,
    pub channel: String,
}

#[derive(Debug, thiserror::Error)]
pub enum OtpError {
    #[error("incorrect otp")]
    Incorrect,
    #[error("otp expired")]
    Expired,
    #[error("otp not approved")]
    NotApproved,
    #[error("verification service error: {0}")]
    Service(String),
}

#[derive(Clone)]
pub struct OtpService {
    inner: Arc<OtpInner>,
}

struct OtpInner {
    config: OtpConfig,
    client: reqwest::Client,
    /// phonenumber → moment the current OTP was sent
    pending: Mutex<HashMap<String, Instant>>,
    stop_tx: watch::Sender<bool>,
    stopped: AtomicBool,
}

#[derive(Deserialize)]
struct VerificationCheckResponse {
    status: String,
}

impl OtpService {
    /// Build the service and spawn its sweeper task.
    pub fn new(config: OtpConfig) -> Self {
        let (stop_tx, stop_rx) = watch::channel(false);
        let service = Self {
            inner: Arc::new(OtpInner {
                config,
                client: reqwest::Client::new(),
                pending: Mutex::new(HashMap::new()),
                stop_tx,
                stopped: AtomicBool::new(false),
            }),
        };

        let sweeper = service.clone();
        tokio::spawn(sweeper.run_sweeper(stop_rx));
        info!("otp service started");
        service
    }

    /// Stop the sweeper. Idempotent; the channel is signalled at most
    /// once.
    pub fn stop_sweeper(&self) {
        if !self.inner.stopped.swap(true, Ordering::SeqCst) {
            let _ = self.inner.stop_tx.send(true);
        }
    }

    /// Ask the provider to deliver an OTP. A phonenumber with an OTP
    /// still in flight is debounced, not re-sent.
    pub async fn send_otp(&self, phonenumber: &str) -> Result<(), OtpError> {
        if self.debounced(phonenumber) {
            debug!(phonenumber, "otp already in flight, resend debounced");
            return Ok(());
        }

        let url = format!(
            "{VERIFY_BASE_URL}/{}/Verifications",
            self.inner.config.verify_service_sid
        );
        let response = self
            .inner
            .client
            .post(url)
            .basic_auth(
                &self.inner.config.account_sid,
                Some(&self.inner.config.auth_token),
            )
            .form(&[
                ("To", phonenumber),
                ("Channel", self.inner.config.channel.as_str()),
            ])
            .send()
            .await
            .map_err(|e| OtpError::Service(e.to_string()))?;

        if !response.status().is_success() {
            return Err(OtpError::Service(format!(
                "verification request failed with status {}",
                response.status()
            )));
        }

        self.inner
            .pending
            .lock()
            .expect("otp pending lock poisoned")
            .insert(phonenumber.to_string(), Instant::now());
        Ok(())
    }

    /// Check a submitted code. Success clears the in-flight entry so
    /// the number can request a fresh OTP immediately.
    pub async fn verify_otp(&self, phonenumber: &str, code: &str) -> Result<(), OtpError> {
        let url = format!(
            "{VERIFY_BASE_URL}/{}/VerificationCheck",
            self.inner.config.verify_service_sid
        );
        let response = self
            .inner
            .client
            .post(url)
            .basic_auth(
                &self.inner.config.account_sid,
                Some(&self.inner.config.auth_token),
            )
            .form(&[("To", phonenumber), ("Code", code)])
            .send()
            .await
            .map_err(|e| OtpError::Service(e.to_string()))?;

        let check: VerificationCheckResponse = response
            .json()
            .await
            .map_err(|e| OtpError::Service(e.to_string()))?;

        match check.status.as_str() {
            "approved" => {
                self.inner
                    .pending
                    .lock()
                    .expect("otp pending lock poisoned")
                    .remove(phonenumber);
                Ok(())
            }
            "failed" => Err(OtpError::Incorrect),
            "expired" => Err(OtpError::Expired),
            other => {
                warn!(status = other, "unexpected verification status");
                Err(OtpError::NotApproved)
            }
        }
    }

    fn debounced(&self, phonenumber: &str) -> bool {
        let pending = self
            .inner
            .pending
            .lock()
            .expect("otp pending lock poisoned");
        pending
            .get(phonenumber)
            .is_some_and(|sent_at| sent_at.elapsed() < OTP_VALIDITY)
    }

    fn sweep(&self) {
        let mut pending = self
            .inner
            .pending
            .lock()
            .expect("otp pending lock poisoned");
        pending.retain(|_, sent_at| sent_at.elapsed() < OTP_VALIDITY);
    }

    async fn run_sweeper(self, mut stop_rx: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(SWEEP_INTERVAL);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = ticker.tick() => self.sweep(),
                _ = stop_rx.changed() => {
                    debug!("otp sweeper stopped");
                    return;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn service() -> OtpService {
        OtpService::new(OtpConfig {
            account_sid: "AC0".into(),
            auth_token: "token".into(),
            verify_service_sid: "VA0".into(),
            channel: "sms".into(),
        })
    }

    #[tokio::test]
    async fn fresh_numbers_are_not_debounced() {
        let service = service();
        assert!(!service.debounced("9876543210"));
        service.stop_sweeper();
    }

    #[tokio::test]
    async fn in_flight_numbers_are_debounced_until_swept() {
        let service = service();
        service
            .inner
            .pending
            .lock()
            .unwrap()
            .insert("9876543210".into(), Instant::now());
        assert!(service.debounced("9876543210"));

        // an entry past validity is dropped by the sweep
        if let Some(past) = Instant::now().checked_sub(OTP_VALIDITY * 2) {
            service
                .inner
                .pending
                .lock()
                .unwrap()
                .insert("111".into(), past);
            service.sweep();
            assert!(!service.inner.pending.lock().unwrap().contains_key("111"));
        }
        assert!(service.debounced("9876543210"), "live entries survive the sweep");
        service.stop_sweeper();
    }

    #[tokio::test]
    async fn stop_sweeper_is_idempotent() {
        let service = service();
        service.stop_sweeper();
        service.stop_sweeper();
    }
}
