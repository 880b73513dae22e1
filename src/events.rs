//! Event emission hooks.
//!
//! The resolver announces interesting moments (currently the start of
//! every certificate resolution) to an optional handler supplied by the
//! surrounding system. A handler error aborts the handshake, which lets
//! deployments veto handshakes before any storage or CA work happens.

use async_trait::async_trait;
use thiserror::Error;

/// Event emitted at the start of every certificate resolution, carrying
/// the serialized client hello as `client_hello`.
pub const TLS_GET_CERTIFICATE: &str = "tls_get_certificate";

/// An emitted event.
#[derive(Debug, Clone)]
pub struct Event {
    /// Event identifier, e.g. [`TLS_GET_CERTIFICATE`].
    pub id: &'static str,

    /// Structured event payload.
    pub payload: serde_json::Value,
}

/// Error returned by an event handler to abort the handshake.
#[derive(Debug, Error)]
#[error("{message}")]
pub struct EventError {
    /// The handler's reason.
    pub message: String,
}

impl EventError {
    /// Create an event error with the given message.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// Receives resolver events.
#[async_trait]
pub trait EventHandler: Send + Sync {
    /// Handle one event; an error aborts the operation that emitted it.
    async fn handle(&self, event: Event) -> Result<(), EventError>;
}
