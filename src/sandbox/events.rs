use tokio::sync::broadcast;

/// Lifecycle events for observability hooks (logging, metrics, UIs).
///
/// The manager emits these; it never consumes them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SandboxEvent {
    Created {
        task_id: String,
        container_name: String,
    },
    Destroyed {
        task_id: String,
        container_name: String,
    },
    Error {
        task_id: String,
        message: String,
    },
    /// An existing container was adopted after a restart or resume.
    Recovered {
        task_id: String,
        container_name: String,
    },
}

impl SandboxEvent {
    pub fn task_id(&self) -> &str {
        match self {
            Self::Created { task_id, .. }
            | Self::Destroyed { task_id, .. }
            | Self::Error { task_id, .. }
            | Self::Recovered { task_id, .. } => task_id,
        }
    }
}

/// Fan-out channel for [`SandboxEvent`]s.
pub struct EventBus {
    tx: broadcast::Sender<SandboxEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SandboxEvent> {
        self.tx.subscribe()
    }

    /// Silently drops the event if nobody is listening.
    pub fn emit(&self, event: SandboxEvent) {
        let _ = self.tx.send(event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(64)
    }
}
