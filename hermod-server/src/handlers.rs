//! Event-handler traits and the forward-request record.
//!
//! Handlers are observers owned by the embedding process; the core calls
//! them and never blocks on them.

use hermod_wire::Message;

/// Observer for inbound user messages.
pub trait MessageHandler: Send + Sync {
    /// Fired for every data message read from a live connection. `msg`
    /// carries sender metadata stamped by the server.
    fn on_message(&self, conn_id: &str, msg: &Message);
}

/// Observer for surfaced errors.
pub trait ErrorHandler: Send + Sync {
    /// Fired on any surfaced error. `service`, `username` and `conn_id` are
    /// empty when not yet known (e.g. handshake failures).
    fn on_error(&self, service: &str, username: &str, conn_id: &str, err: &dyn std::error::Error);
}

/// A client's request that the server relay a message to another user,
/// possibly in a different service. Consumed by an external dispatcher.
#[derive(Clone, Debug)]
pub struct ForwardRequest {
    /// Originating username.
    pub sender: String,
    /// Originating service.
    pub sender_service: String,
    /// Target username.
    pub receiver: String,
    /// Target service.
    pub receiver_service: String,
    /// The message to relay.
    pub message: Message,
}
