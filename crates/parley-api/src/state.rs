use std::sync::Arc;

use parley_cache::DynamicShardedCache;
use parley_db::Database;
use parley_gateway::events::{GroupEvent, MessageEvent};
use tokio::sync::mpsc;
use tracing::warn;

use crate::otp::OtpService;

pub type AppState = Arc<ApiState>;

/// Everything the handlers share: the store, the message cache, the
/// OTP verifier, the signing secret, and the event bus producers.
pub struct ApiState {
    pub db: Database,
    pub jwt_secret: String,
    pub otp: OtpService,
    pub cache: Arc<DynamicShardedCache>,
    pub message_events: mpsc::Sender<MessageEvent>,
    pub group_events: mpsc::Sender<GroupEvent>,
}

impl ApiState {
    /// Hand an event to the message consumer. A closed queue only
    /// happens during shutdown; the request that produced the event
    /// already committed, so this is logged rather than surfaced.
    pub async fn emit_message_event(&self, event: MessageEvent) {
        if self.message_events.send(event).await.is_err() {
            warn!("message event queue closed, event dropped");
        }
    }

    pub async fn emit_group_event(&self, event: GroupEvent) {
        if self.group_events.send(event).await.is_err() {
            warn!("group event queue closed, event dropped");
        }
    }
}
