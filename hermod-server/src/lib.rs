//! Server runtime for the hermod message bus.
//!
//! The [`MessageCenter`] owns the listener and a registry of per-service
//! [`ServiceCenter`]s. Each accepted TCP connection goes through the
//! authenticated handshake ([`auth`]), is promoted to a session connection,
//! and registered in its service's live-user table. Outbound sends fan out
//! to live connections and fall back to the [`MessageCache`] with digest
//! notifications for large messages or offline users.

#![deny(unsafe_code)]

pub mod auth;
pub mod cache;
pub mod center;
pub mod config;
pub mod handlers;
pub mod msgcenter;

pub use auth::{AuthError, AuthedConn, Authenticator, HandshakeError, auth_conn};
pub use cache::{CacheError, MemoryCache, MessageCache};
pub use center::{CenterError, ServiceCenter};
pub use config::{ServiceConfig, ServiceConfigReader};
pub use handlers::{ErrorHandler, ForwardRequest, MessageHandler};
pub use msgcenter::{CenterHandle, MessageCenter};

/// Service and user names travel inside colon-joined cache keys and
/// line-oriented logs, so both characters are banned outright.
pub(crate) fn valid_identifier(name: &str) -> bool {
    !name.is_empty() && !name.contains(':') && !name.contains('\n')
}

#[cfg(test)]
mod tests {
    use super::valid_identifier;

    #[test]
    fn identifier_validation() {
        assert!(valid_identifier("user-1"));
        assert!(valid_identifier("svc.prod"));
        assert!(!valid_identifier(""));
        assert!(!valid_identifier("a:b"));
        assert!(!valid_identifier("a\nb"));
    }
}
