//! Per-service configuration and its external reader.

use std::sync::Arc;

use crate::cache::MessageCache;
use crate::handlers::{ErrorHandler, MessageHandler};

/// Everything a [`crate::ServiceCenter`] needs to serve one service.
#[derive(Clone)]
pub struct ServiceConfig {
    /// Messages at or above this size go through the digest/cache path.
    /// Zero disables size-based digests.
    pub digest_threshold: usize,
    /// Messages strictly larger than this are deflated on the wire.
    pub compress_threshold: usize,
    /// Whether data frames to this service's clients are encrypted.
    pub encrypt: bool,
    /// Header keys allowed to appear in digest notifications.
    pub digest_fields: Vec<String>,
    /// Per-user live connection cap. Zero means unlimited.
    pub max_conns_per_user: usize,
    /// Backing store for undelivered messages.
    pub cache: Arc<dyn MessageCache>,
    /// Inbound-message observer.
    pub message_handler: Option<Arc<dyn MessageHandler>>,
    /// Error observer.
    pub error_handler: Option<Arc<dyn ErrorHandler>>,
}

impl ServiceConfig {
    /// A config with production-shaped defaults around the given cache.
    pub fn new(cache: Arc<dyn MessageCache>) -> Self {
        Self {
            digest_threshold:   1024,
            compress_threshold: 512,
            encrypt:            true,
            digest_fields:      Vec::new(),
            max_conns_per_user: 0,
            cache,
            message_handler:    None,
            error_handler:      None,
        }
    }
}

/// External lookup from service name to its configuration.
///
/// Returning `None` closes the connection that asked for the service.
pub trait ServiceConfigReader: Send + Sync {
    /// Resolve `service` to its config.
    fn read_config(&self, service: &str) -> Option<ServiceConfig>;
}
