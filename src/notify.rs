//! Single user-facing notification channel.

use serde::Serialize;
use tokio::sync::broadcast;
use tracing::{error, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Success,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Notification {
    pub severity: Severity,
    pub message: String,
}

/// Fan-out of notifications to whoever listens; also mirrored to the log.
#[derive(Debug, Clone)]
pub struct Notifier {
    tx: broadcast::Sender<Notification>,
}

impl Default for Notifier {
    fn default() -> Self {
        Self::new()
    }
}

impl Notifier {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(64);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Notification> {
        self.tx.subscribe()
    }

    pub fn success(&self, message: impl Into<String>) {
        self.send(Severity::Success, message.into());
    }

    pub fn error(&self, message: impl Into<String>) {
        self.send(Severity::Error, message.into());
    }

    fn send(&self, severity: Severity, message: String) {
        match severity {
            Severity::Success => info!(target: "cashumints::notify", "{message}"),
            Severity::Error => error!(target: "cashumints::notify", "{message}"),
        }
        // Nobody listening is fine.
        let _ = self.tx.send(Notification { severity, message });
    }
}
