use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use serde::Serialize;
use tracing::trace;

/// Typed payloads delivered to the embedding host.
///
/// Stream data is lossily UTF-8 decoded; the host's message-passing layer
/// only carries text.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SessionEvent {
    Stdout { id: String, data: String },
    Stderr { id: String, data: String },
    Exit { id: String, code: i32, signal: String },
    Error { id: String, message: String },
    GuestConnection { id: String, connected: bool },
}

impl SessionEvent {
    pub fn id(&self) -> &str {
        match self {
            Self::Stdout { id, .. }
            | Self::Stderr { id, .. }
            | Self::Exit { id, .. }
            | Self::Error { id, .. }
            | Self::GuestConnection { id, .. } => id,
        }
    }
}

/// Where session events go. The embedding application registers one sink;
/// tests register a recording one.
#[async_trait]
pub trait EventSink: Send + Sync {
    async fn deliver(&self, event: SessionEvent);
}

/// Single registration surface between the supervisor and its host.
/// Events raised while no sink is registered are dropped, not buffered.
#[derive(Default)]
pub struct EventBridge {
    sink: RwLock<Option<Arc<dyn EventSink>>>,
}

impl EventBridge {
    pub fn register(&self, sink: Arc<dyn EventSink>) {
        *self.sink.write().expect("event sink lock poisoned") = Some(sink);
    }

    pub fn unregister(&self) {
        *self.sink.write().expect("event sink lock poisoned") = None;
    }

    pub(crate) async fn emit(&self, event: SessionEvent) {
        let sink = self
            .sink
            .read()
            .expect("event sink lock poisoned")
            .clone();
        match sink {
            Some(sink) => sink.deliver(event).await,
            None => trace!(?event, "No event sink registered, dropping event"),
        }
    }
}
