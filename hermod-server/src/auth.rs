//! Server-side handshake entry: key exchange, then credential
//! authentication, bounded by a single timeout.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use rsa::RsaPrivateKey;
use tokio::io::{AsyncRead, AsyncWrite};

use hermod_proto::cmdio::{CmdIoError, CommandIo, Side};
use hermod_proto::keyex::{self, KeyExchangeError};
use hermod_wire::command::{CMD_AUTH, CMD_AUTHOK, CMD_BYE, Command};

use crate::valid_identifier;

// ─── External authenticator ──────────────────────────────────────────────────

/// Backend failure while checking credentials.
#[derive(Clone, Debug)]
pub struct AuthError {
    /// Backend-supplied description.
    pub message: String,
}

impl AuthError {
    /// Wrap a backend error message.
    pub fn new(message: impl Into<String>) -> Self {
        Self { message: message.into() }
    }
}

impl fmt::Display for AuthError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "authenticator: {}", self.message)
    }
}

impl std::error::Error for AuthError {}

/// External credential checker. Both `Ok(false)` and `Err` reject the
/// connection.
pub trait Authenticator: Send + Sync {
    /// Check `token` for `username` in `service`.
    fn authenticate(&self, service: &str, username: &str, token: &str)
        -> Result<bool, AuthError>;
}

// ─── Handshake error ─────────────────────────────────────────────────────────

/// Why a connection never made it past the handshake. All fatal; the socket
/// is closed.
#[derive(Debug)]
pub enum HandshakeError {
    /// Key exchange failed.
    KeyExchange(KeyExchangeError),
    /// Command I/O failed during the credential phase.
    CmdIo(CmdIoError),
    /// The first command was not a well-formed AUTH.
    BadAuthCommand,
    /// Service or username failed identifier validation.
    BadIdentifier(String),
    /// The authenticator said no.
    Rejected,
    /// The authenticator backend itself failed.
    Backend(AuthError),
    /// The whole handshake exceeded its deadline.
    Timeout,
}

impl fmt::Display for HandshakeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::KeyExchange(e)   => write!(f, "{e}"),
            Self::CmdIo(e)         => write!(f, "{e}"),
            Self::BadAuthCommand   => write!(f, "malformed AUTH command"),
            Self::BadIdentifier(s) => write!(f, "bad identifier: {s:?}"),
            Self::Rejected         => write!(f, "credentials rejected"),
            Self::Backend(e)       => write!(f, "{e}"),
            Self::Timeout          => write!(f, "handshake timed out"),
        }
    }
}

impl std::error::Error for HandshakeError {}

impl From<KeyExchangeError> for HandshakeError {
    fn from(e: KeyExchangeError) -> Self { Self::KeyExchange(e) }
}

impl From<CmdIoError> for HandshakeError {
    fn from(e: CmdIoError) -> Self { Self::CmdIo(e) }
}

// ─── Entry ───────────────────────────────────────────────────────────────────

/// A connection that survived both handshake phases but is not yet
/// registered in a service center.
pub struct AuthedConn {
    /// The service the client authenticated into.
    pub service: String,
    /// The authenticated username.
    pub username: String,
    pub(crate) cmdio: Arc<CommandIo>,
}

/// Run key exchange and credential authentication on a fresh stream.
///
/// `timeout` covers both phases; expiry drops (and thereby closes) the
/// stream.
pub async fn auth_conn<S>(
    stream:  S,
    privkey: &RsaPrivateKey,
    auth:    &dyn Authenticator,
    timeout: Duration,
) -> Result<AuthedConn, HandshakeError>
where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    match tokio::time::timeout(timeout, handshake(stream, privkey, auth)).await {
        Ok(result) => result,
        Err(_) => Err(HandshakeError::Timeout),
    }
}

async fn handshake<S>(
    mut stream: S,
    privkey:    &RsaPrivateKey,
    auth:       &dyn Authenticator,
) -> Result<AuthedConn, HandshakeError>
where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    let keys = keyex::server_key_exchange(privkey, &mut stream).await?;
    let cmdio = Arc::new(CommandIo::new(stream, &keys, Side::Server));

    let cmd = cmdio.read_command().await?;
    if cmd.opcode != CMD_AUTH || cmd.params.len() < 3 {
        reject(&cmdio).await;
        return Err(HandshakeError::BadAuthCommand);
    }
    let service = cmd.params[0].clone();
    let username = cmd.params[1].clone();
    let token = &cmd.params[2];

    for name in [&service, &username] {
        if !valid_identifier(name) {
            reject(&cmdio).await;
            return Err(HandshakeError::BadIdentifier(name.clone()));
        }
    }

    match auth.authenticate(&service, &username, token) {
        Ok(true) => {
            cmdio.write_command(&Command::new(CMD_AUTHOK), false, true).await?;
            tracing::info!(service = %service, username = %username, "connection authenticated");
            Ok(AuthedConn { service, username, cmdio })
        }
        Ok(false) => {
            reject(&cmdio).await;
            Err(HandshakeError::Rejected)
        }
        Err(e) => {
            reject(&cmdio).await;
            Err(HandshakeError::Backend(e))
        }
    }
}

/// Optional rejection frame, then FIN. Errors here are moot.
async fn reject(cmdio: &CommandIo) {
    let _ = cmdio.write_command(&Command::new(CMD_BYE), false, true).await;
    cmdio.shutdown().await;
}
