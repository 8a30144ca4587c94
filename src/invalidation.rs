//! Cross-process invalidation over pub/sub.
//!
//! Every write or delete that reaches the remote tier publishes an
//! [`InvalidationMessage`]. Each cache instance subscribes to the channel
//! and removes the named key from its local tier.
//!
//! ```text
//! Process A: cache.set("k")          Process B: local tier holds "k"
//!   ↓                                  ↑
//! PUBLISH coord-kit:invalidate {origin: A, key: "k"}  → B removes "k"
//! ```

use crate::backend::{ChannelEvent, MessageHandler};
use crate::error::Result;
use crate::local::LocalTier;
use crate::observability::CacheMetrics;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Channel carrying invalidation messages.
pub const INVALIDATION_CHANNEL: &str = "coord-kit:invalidate";

/// A key was overwritten or deleted in the remote tier.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvalidationMessage {
    #[serde(rename = "origin_machine_id")]
    pub origin: String,
    pub key: String,
}

impl InvalidationMessage {
    pub fn new(origin: impl Into<String>, key: impl Into<String>) -> Self {
        InvalidationMessage {
            origin: origin.into(),
            key: key.into(),
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

/// Applies received invalidations to one local tier.
pub struct InvalidationListener {
    machine_id: String,
    self_notify: bool,
    local: Arc<LocalTier>,
    metrics: Arc<dyn CacheMetrics>,
}

impl InvalidationListener {
    pub fn new(
        machine_id: impl Into<String>,
        self_notify: bool,
        local: Arc<LocalTier>,
        metrics: Arc<dyn CacheMetrics>,
    ) -> Self {
        InvalidationListener {
            machine_id: machine_id.into(),
            self_notify,
            local,
            metrics,
        }
    }

    /// Handle one channel event. Never blocks.
    pub fn handle(&self, event: ChannelEvent) {
        match event {
            ChannelEvent::Message(bytes) => match InvalidationMessage::decode(&bytes) {
                Ok(message) => self.apply(message),
                Err(e) => warn!(
                    "⚠ Malformed invalidation message ({} bytes) ignored: {}",
                    bytes.len(),
                    e
                ),
            },
            ChannelEvent::Lagged(missed) => {
                warn!(
                    "⚠ Missed {} invalidation messages, clearing local tier ({} entries)",
                    missed,
                    self.local.len()
                );
                self.local.clear();
            }
        }
    }

    fn apply(&self, message: InvalidationMessage) {
        if message.origin == self.machine_id && !self.self_notify {
            return;
        }

        self.local.remove(&message.key);
        self.metrics.record_invalidation(&message.key);
        debug!(
            "✓ Local entry {} invalidated by {}",
            message.key, message.origin
        );
    }

    pub fn into_handler(self: Arc<Self>) -> MessageHandler {
        Arc::new(move |event| self.handle(event))
    }
}
