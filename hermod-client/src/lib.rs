//! Client connection library for the hermod message bus.
//!
//! [`dial`] runs the two-phase handshake (key exchange + credential auth)
//! over any byte stream and returns a [`ClientConn`]:
//!
//! ```rust,no_run
//! # async fn demo(pubkey: rsa::RsaPublicKey) -> Result<(), Box<dyn std::error::Error>> {
//! use std::time::Duration;
//! use hermod_client::dial;
//!
//! let stream = tokio::net::TcpStream::connect("127.0.0.1:9981").await?;
//! let conn = dial(stream, &pubkey, "svc", "alice", "token", Duration::from_secs(10)).await?;
//!
//! let msg = conn.read_message().await?;
//! println!("got {} byte(s)", msg.body.len());
//! # Ok(())
//! # }
//! ```

#![deny(unsafe_code)]

use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::AtomicBool;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use rsa::RsaPublicKey;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;

use hermod_proto::cmdio::{CmdIoError, CommandIo, Side};
use hermod_proto::conn::{
    CommandProcessor, ConnError, ConnSettings, MsgConnection, ProcessError, ProcessFuture,
};
use hermod_proto::keyex::{self, KeyExchangeError};
use hermod_wire::Message;
use hermod_wire::command::{self, Command};

// ─── Digest ──────────────────────────────────────────────────────────────────

/// A digest notification: the server cached a message instead of (or in
/// addition to) delivering it, and this is its summary.
#[derive(Clone, Debug, PartialEq)]
pub struct Digest {
    /// Cache id to pass to [`ClientConn::request_message`].
    pub msg_id: String,
    /// Size of the cached message in bytes.
    pub size: usize,
    /// Whitelist-filtered headers plus any sender-supplied extras.
    pub info: BTreeMap<String, String>,
}

// ─── Error ───────────────────────────────────────────────────────────────────

/// Why [`dial`] failed.
#[derive(Debug)]
pub enum DialError {
    /// Key exchange failed (wrong pinned key, version mismatch, tamper…).
    KeyExchange(KeyExchangeError),
    /// Transport failure during the credential phase.
    CmdIo(CmdIoError),
    /// The server rejected the credentials.
    Rejected,
    /// The handshake did not finish within the deadline.
    Timeout,
}

impl fmt::Display for DialError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::KeyExchange(e) => write!(f, "{e}"),
            Self::CmdIo(e)       => write!(f, "{e}"),
            Self::Rejected       => write!(f, "credentials rejected by server"),
            Self::Timeout        => write!(f, "handshake timed out"),
        }
    }
}

impl std::error::Error for DialError {}

impl From<KeyExchangeError> for DialError {
    fn from(e: KeyExchangeError) -> Self { Self::KeyExchange(e) }
}

impl From<CmdIoError> for DialError {
    fn from(e: CmdIoError) -> Self { Self::CmdIo(e) }
}

// ─── Client-side processor ───────────────────────────────────────────────────

type DigestSlot = Arc<StdMutex<Option<mpsc::Sender<Digest>>>>;

/// Interprets server-pushed control commands: DIGEST notifications, FWD
/// deliveries, SETTING updates. Everything else recognized is ignored for
/// forward compatibility.
struct ClientProcessor {
    service:   String,
    digest_tx: DigestSlot,
    settings:  Arc<StdMutex<ConnSettings>>,
}

impl ClientProcessor {
    async fn handle_digest(&self, cmd: Command) -> Result<(), ProcessError> {
        let tx = self.digest_tx.lock().expect("digest slot lock").clone();
        let Some(tx) = tx else {
            // Nobody subscribed; the digest is dropped on the floor.
            return Ok(());
        };

        if cmd.params.len() < 2 {
            return Err(ProcessError::BadPeer("DIGEST needs [size, msg_id]".into()));
        }
        let size: usize = cmd.params[0]
            .parse()
            .map_err(|_| ProcessError::BadPeer(format!("bad DIGEST size {:?}", cmd.params[0])))?;

        let digest = Digest {
            msg_id: cmd.params[1].clone(),
            size,
            info: cmd.message.map(|m| m.header).unwrap_or_default(),
        };
        tx.send(digest)
            .await
            .map_err(|_| ProcessError::Internal("digest channel closed".into()))
    }

    fn handle_forward(&self, cmd: Command) -> Result<Message, ProcessError> {
        let sender = cmd
            .params
            .first()
            .ok_or_else(|| ProcessError::BadPeer("FWD without sender".into()))?
            .clone();

        let mut msg = cmd.message.unwrap_or_default();
        msg.sender = Some(sender);
        msg.sender_service = Some(
            cmd.params
                .get(1)
                .cloned()
                .unwrap_or_else(|| self.service.clone()),
        );
        msg.id = cmd.params.get(2).cloned();
        Ok(msg)
    }
}

impl CommandProcessor for ClientProcessor {
    fn process_command(&self, cmd: Command) -> ProcessFuture<'_> {
        Box::pin(async move {
            match cmd.opcode {
                command::CMD_DIGEST => {
                    self.handle_digest(cmd).await?;
                    Ok(None)
                }
                command::CMD_FWD => Ok(Some(self.handle_forward(cmd)?)),
                command::CMD_SETTING => {
                    match ConnSettings::from_params(&cmd.params) {
                        Some(new) => {
                            *self.settings.lock().expect("settings lock") = new;
                            Ok(None)
                        }
                        None => Err(ProcessError::BadPeer("malformed SETTING".into())),
                    }
                }
                op if command::known_opcode(op) => Ok(None),
                op => Err(ProcessError::BadPeer(format!("unknown opcode {op}"))),
            }
        })
    }
}

// ─── ClientConn ──────────────────────────────────────────────────────────────

/// An authenticated client session.
pub struct ClientConn {
    conn:      Arc<MsgConnection>,
    settings:  Arc<StdMutex<ConnSettings>>,
    digest_tx: DigestSlot,
}

impl fmt::Debug for ClientConn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientConn")
            .field("service", &self.conn.service())
            .finish()
    }
}

impl ClientConn {
    /// The service this connection belongs to.
    pub fn service(&self) -> &str { self.conn.service() }

    /// The authenticated username.
    pub fn username(&self) -> &str { self.conn.username() }

    /// Process-unique connection id.
    pub fn uniq_id(&self) -> &str { self.conn.uniq_id() }

    /// Block until the next inbound message. Relayed messages carry sender
    /// metadata; EOF is an error.
    pub async fn read_message(&self) -> Result<Message, ConnError> {
        self.conn.read_message().await
    }

    /// Send a data message, deciding compression from the current
    /// compress threshold and encryption from the session settings.
    pub async fn send_message(&self, msg: &Message) -> Result<(), CmdIoError> {
        let settings = self.settings.lock().expect("settings lock").clone();
        let compress = settings.should_compress(msg.size());
        self.conn.write_message(msg, compress, settings.encrypt).await
    }

    /// Send a data message with explicit flags.
    pub async fn write_message(
        &self,
        msg:      &Message,
        compress: bool,
        encrypt:  bool,
    ) -> Result<(), CmdIoError> {
        self.conn.write_message(msg, compress, encrypt).await
    }

    /// Install the channel digest notifications are delivered on.
    pub fn set_digest_channel(&self, tx: mpsc::Sender<Digest>) {
        *self.digest_tx.lock().expect("digest slot lock") = Some(tx);
    }

    /// Negotiate new connection settings; stores them locally and pushes a
    /// SETTING command to the server.
    pub async fn configure(
        &self,
        digest_threshold:   usize,
        compress_threshold: usize,
        encrypt:            bool,
        digest_fields:      Vec<String>,
    ) -> Result<(), CmdIoError> {
        self.conn
            .configure(ConnSettings { digest_threshold, compress_threshold, encrypt, digest_fields })
            .await
    }

    /// Toggle this connection's eligibility for direct delivery. While
    /// invisible the server falls back to cache + digest.
    pub async fn set_visibility(&self, visible: bool) -> Result<(), CmdIoError> {
        let flag = if visible { "1" } else { "0" };
        self.conn
            .write_command(
                &Command::with_params(command::CMD_SET_VISIBILITY, vec![flag.into()]),
                false,
                true,
            )
            .await
    }

    /// Ask the server for the full message behind a digest id. The reply
    /// arrives through [`ClientConn::read_message`]; a cache miss reads as
    /// an empty message with a `status: miss` header.
    pub async fn request_message(&self, id: &str) -> Result<(), CmdIoError> {
        self.conn
            .write_command(
                &Command::with_params(command::CMD_MSG_RETRIEVE, vec![id.into()]),
                false,
                true,
            )
            .await
    }

    /// Ask the server to relay `msg` to another user. `receiver_service`
    /// may be omitted when it equals this connection's own service.
    pub async fn forward_request(
        &self,
        receiver:         &str,
        receiver_service: Option<&str>,
        msg:              &Message,
    ) -> Result<(), CmdIoError> {
        let mut params = vec![receiver.to_owned()];
        if let Some(service) = receiver_service {
            if !service.is_empty() && service != self.service() {
                params.push(service.to_owned());
            }
        }
        let settings = self.settings.lock().expect("settings lock").clone();
        let cmd = Command {
            opcode:  command::CMD_FWD_REQ,
            params,
            message: Some(Message {
                header: msg.header.clone(),
                body:   msg.body.clone(),
                ..Message::default()
            }),
            ack_id:  None,
        };
        self.conn
            .write_command(&cmd, settings.should_compress(msg.size()), settings.encrypt)
            .await
    }

    /// Orderly close: BYE, socket shutdown, reader cancellation.
    pub async fn close(&self) {
        self.conn.close().await;
    }
}

// ─── dial ────────────────────────────────────────────────────────────────────

/// Run the client side of the handshake over `stream`, pinning `pubkey`,
/// then authenticate as `username` in `service`.
pub async fn dial<S>(
    stream:   S,
    pubkey:   &RsaPublicKey,
    service:  &str,
    username: &str,
    token:    &str,
    timeout:  Duration,
) -> Result<ClientConn, DialError>
where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    match tokio::time::timeout(timeout, handshake(stream, pubkey, service, username, token)).await {
        Ok(result) => result,
        Err(_) => Err(DialError::Timeout),
    }
}

async fn handshake<S>(
    mut stream: S,
    pubkey:     &RsaPublicKey,
    service:    &str,
    username:   &str,
    token:      &str,
) -> Result<ClientConn, DialError>
where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    let keys = keyex::client_key_exchange(pubkey, &mut stream).await?;
    let cmdio = Arc::new(CommandIo::new(stream, &keys, Side::Client));

    let auth = Command::with_params(
        command::CMD_AUTH,
        vec![service.to_owned(), username.to_owned(), token.to_owned()],
    );
    cmdio.write_command(&auth, false, true).await?;

    let reply = cmdio.read_command().await?;
    if reply.opcode != command::CMD_AUTHOK {
        return Err(DialError::Rejected);
    }
    tracing::debug!(service, username, "authenticated");

    let settings = Arc::new(StdMutex::new(ConnSettings::default()));
    let digest_tx: DigestSlot = Arc::new(StdMutex::new(None));
    let processor = Arc::new(ClientProcessor {
        service:   service.to_owned(),
        digest_tx: digest_tx.clone(),
        settings:  settings.clone(),
    });

    let conn = MsgConnection::new(
        cmdio,
        service,
        username,
        processor,
        settings.clone(),
        Arc::new(AtomicBool::new(true)),
    );

    Ok(ClientConn { conn, settings, digest_tx })
}
