use serde::Serialize;
use serde_json::Value;
use tokio::sync::broadcast;

const EVENT_CAPACITY: usize = 64;

/// Notifications pushed down to whatever front end is attached.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(tag = "event", content = "payload", rename_all = "kebab-case")]
pub enum ShellEvent {
    WorkerStarted,
    WorkerStopped {
        code: Option<i32>,
        unexpected: bool,
    },
    DownloadProgress(Value),
    DownloadComplete(Value),
    UpdateAvailable,
    UpdateDownloaded,
    /// Needs user action; front ends show it as a blocking dialog.
    FatalError {
        title: String,
        message: String,
    },
}

impl ShellEvent {
    pub fn name(&self) -> &'static str {
        match self {
            ShellEvent::WorkerStarted => "worker-started",
            ShellEvent::WorkerStopped { .. } => "worker-stopped",
            ShellEvent::DownloadProgress(_) => "download-progress",
            ShellEvent::DownloadComplete(_) => "download-complete",
            ShellEvent::UpdateAvailable => "update-available",
            ShellEvent::UpdateDownloaded => "update-downloaded",
            ShellEvent::FatalError { .. } => "fatal-error",
        }
    }
}

/// Fan-out of [`ShellEvent`]s. Subscribers only see events emitted after
/// they subscribed.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<ShellEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(EVENT_CAPACITY);
        Self { tx }
    }

    pub fn emit(&self, event: ShellEvent) {
        tracing::debug!(event = event.name(), "emit");
        // No subscribers is not an error.
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ShellEvent> {
        self.tx.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
