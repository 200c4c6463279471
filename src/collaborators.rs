//! External collaborator seams
//!
//! The transports behind these traits (WebSocket fan-out, the AI matching
//! service, the user directory) live outside the core. Everything here is
//! best-effort from the core's perspective: notification failures are
//! logged, never propagated into a lifecycle transaction.

use std::sync::Mutex;

use async_trait::async_trait;
use tracing::debug;

use crate::error::CoreResult;
use crate::opcode::OpCode;

/// Out-of-band event fan-out (WebSocket publish, message bus, ...).
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn publish(&self, topic: &str, payload: serde_json::Value) -> CoreResult<()>;
}

/// AI matching service: proposes a concrete recipient for a drift letter.
#[async_trait]
pub trait AiMatcher: Send + Sync {
    async fn propose_recipient(&self, letter_ref: &str) -> CoreResult<Option<OpCode>>;
}

/// User directory: resolves the resident behind an OP-Code for delivery
/// notifications.
#[async_trait]
pub trait UserDirectory: Send + Sync {
    async fn lookup_by_op_code(&self, op_code: &OpCode) -> CoreResult<Option<String>>;
}

/// Notifier that only traces; the default when no transport is wired up.
#[derive(Default)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn publish(&self, topic: &str, payload: serde_json::Value) -> CoreResult<()> {
        debug!(topic, %payload, "notification");
        Ok(())
    }
}

/// Matcher stub that never proposes; drift letters stay pending.
#[derive(Default)]
pub struct NullMatcher;

#[async_trait]
impl AiMatcher for NullMatcher {
    async fn propose_recipient(&self, _letter_ref: &str) -> CoreResult<Option<OpCode>> {
        Ok(None)
    }
}

/// Directory stub with no residents.
#[derive(Default)]
pub struct NullDirectory;

#[async_trait]
impl UserDirectory for NullDirectory {
    async fn lookup_by_op_code(&self, _op_code: &OpCode) -> CoreResult<Option<String>> {
        Ok(None)
    }
}

/// Captures published notifications for assertions in tests.
#[derive(Default)]
pub struct RecordingNotifier {
    published: Mutex<Vec<(String, serde_json::Value)>>,
}

impl RecordingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn published(&self) -> Vec<(String, serde_json::Value)> {
        self.published.lock().map(|p| p.clone()).unwrap_or_default()
    }

    pub fn topics(&self) -> Vec<String> {
        self.published()
            .into_iter()
            .map(|(topic, _)| topic)
            .collect()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn publish(&self, topic: &str, payload: serde_json::Value) -> CoreResult<()> {
        if let Ok(mut published) = self.published.lock() {
            published.push((topic.to_string(), payload));
        }
        Ok(())
    }
}
