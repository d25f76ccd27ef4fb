//! [`MsgConnection`] — the per-peer session connection.
//!
//! A background reader task demultiplexes the inbound stream: DATA frames
//! land in a bounded message channel, BYE ends the session, and every other
//! control command is dispatched to the [`CommandProcessor`] installed by
//! the owning side (client or server).

use std::fmt;
use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::Mutex as StdMutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;

use hermod_wire::command::{self, Command};
use hermod_wire::Message;

use crate::cmdio::{CmdIoError, CommandIo};
use crate::frame::FrameError;

/// Capacity of the per-connection inbound message channel. A stalled
/// consumer blocks the reader, which propagates to the peer via TCP flow
/// control.
pub const INBOUND_CAPACITY: usize = 1024;

// ─── Settings ────────────────────────────────────────────────────────────────

/// Per-connection delivery settings, kept in sync with the peer through
/// SETTING commands.
#[derive(Clone, Debug)]
pub struct ConnSettings {
    /// Messages at or above this size go through the digest/cache path.
    /// Zero disables size-based digests.
    pub digest_threshold: usize,
    /// Messages strictly larger than this are deflated. Zero disables
    /// compression.
    pub compress_threshold: usize,
    /// Whether data frames are encrypted.
    pub encrypt: bool,
    /// Header keys allowed to appear in digest notifications.
    pub digest_fields: Vec<String>,
}

impl Default for ConnSettings {
    fn default() -> Self {
        Self {
            digest_threshold:   0,
            compress_threshold: 512,
            encrypt:            true,
            digest_fields:      Vec::new(),
        }
    }
}

impl ConnSettings {
    /// Encode as SETTING command params.
    pub fn to_params(&self) -> Vec<String> {
        let mut params = vec![
            self.digest_threshold.to_string(),
            self.compress_threshold.to_string(),
            if self.encrypt { "1".into() } else { "0".into() },
        ];
        params.extend(self.digest_fields.iter().cloned());
        params
    }

    /// Decode from SETTING command params.
    pub fn from_params(params: &[String]) -> Option<Self> {
        if params.len() < 3 {
            return None;
        }
        Some(Self {
            digest_threshold:   params[0].parse().ok()?,
            compress_threshold: params[1].parse().ok()?,
            encrypt:            params[2] == "1",
            digest_fields:      params[3..].to_vec(),
        })
    }

    /// Whether a message of `size` bytes should be compressed.
    pub fn should_compress(&self, size: usize) -> bool {
        self.compress_threshold > 0 && size > self.compress_threshold
    }

    /// Whether a message of `size` bytes should take the digest path.
    pub fn wants_digest(&self, size: usize) -> bool {
        self.digest_threshold > 0 && size >= self.digest_threshold
    }
}

// ─── Errors ──────────────────────────────────────────────────────────────────

/// Outcome of [`CommandProcessor::process_command`] when something went
/// wrong.
#[derive(Debug)]
pub enum ProcessError {
    /// The peer sent a recognized opcode with malformed params. Reported
    /// and dropped; the session survives.
    BadPeer(String),
    /// Local failure while handling the command (cache, downstream write to
    /// another connection, …). Reported; the session survives.
    Internal(String),
    /// Unrecoverable transport failure; the reader shuts the session down.
    Fatal(CmdIoError),
}

/// Errors surfaced by [`MsgConnection::read_message`].
#[derive(Debug)]
pub enum ConnError {
    /// The peer ended the session (BYE or clean EOF).
    Eof,
    /// Non-fatal peer protocol fault; subsequent reads continue.
    Peer(String),
    /// Non-fatal local fault while processing a control command.
    Internal(String),
    /// Fatal transport failure.
    CmdIo(CmdIoError),
    /// The connection was closed locally.
    Closed,
}

impl ConnError {
    /// Whether this error ends the session.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, Self::Peer(_) | Self::Internal(_))
    }
}

impl fmt::Display for ConnError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Eof         => write!(f, "connection closed by peer"),
            Self::Peer(e)     => write!(f, "peer fault: {e}"),
            Self::Internal(e) => write!(f, "internal: {e}"),
            Self::CmdIo(e)    => write!(f, "{e}"),
            Self::Closed      => write!(f, "connection closed locally"),
        }
    }
}

impl std::error::Error for ConnError {}

// ─── Processor hook ──────────────────────────────────────────────────────────

/// Future type returned by [`CommandProcessor::process_command`].
pub type ProcessFuture<'a> =
    Pin<Box<dyn Future<Output = Result<Option<Message>, ProcessError>> + Send + 'a>>;

/// Control-command hook installed at connection construction.
///
/// The client and the server install different implementations. Returning
/// `Ok(Some(msg))` injects `msg` into the connection's inbound channel (the
/// FWD path); `Ok(None)` means the command was fully consumed.
pub trait CommandProcessor: Send + Sync {
    /// Handle one non-DATA, non-BYE command.
    fn process_command(&self, cmd: Command) -> ProcessFuture<'_>;
}

// ─── MsgConnection ───────────────────────────────────────────────────────────

/// A live, authenticated session connection.
///
/// Lifetime matches the TCP connection; [`MsgConnection::close`] (or drop)
/// tears down the socket and the inbound channel.
pub struct MsgConnection {
    service:  String,
    username: String,
    id:       String,
    cmdio:    Arc<CommandIo>,
    inbound:  Mutex<mpsc::Receiver<Result<Message, ConnError>>>,
    settings: Arc<StdMutex<ConnSettings>>,
    visible:  Arc<AtomicBool>,
    reader:   StdMutex<Option<JoinHandle<()>>>,
}

impl MsgConnection {
    /// Promote a key-exchanged, authenticated stream into a session
    /// connection and start its background reader.
    pub fn new(
        cmdio:     Arc<CommandIo>,
        service:   impl Into<String>,
        username:  impl Into<String>,
        processor: Arc<dyn CommandProcessor>,
        settings:  Arc<StdMutex<ConnSettings>>,
        visible:   Arc<AtomicBool>,
    ) -> Arc<Self> {
        let mut raw = [0u8; 16];
        getrandom::getrandom(&mut raw).expect("getrandom");

        let (tx, rx) = mpsc::channel(INBOUND_CAPACITY);
        let conn = Arc::new(Self {
            service:  service.into(),
            username: username.into(),
            id:       hex::encode(raw),
            cmdio:    cmdio.clone(),
            inbound:  Mutex::new(rx),
            settings,
            visible,
            reader:   StdMutex::new(None),
        });

        let handle = tokio::spawn(reader_loop(cmdio, processor, tx));
        *conn.reader.lock().expect("reader handle lock") = Some(handle);
        conn
    }

    /// The service this connection authenticated into.
    pub fn service(&self) -> &str { &self.service }

    /// The authenticated username.
    pub fn username(&self) -> &str { &self.username }

    /// Process-unique connection id.
    pub fn uniq_id(&self) -> &str { &self.id }

    /// Snapshot of the current settings.
    pub fn settings(&self) -> ConnSettings {
        self.settings.lock().expect("settings lock").clone()
    }

    /// Whether the connection is currently eligible for direct delivery.
    pub fn is_visible(&self) -> bool {
        self.visible.load(Ordering::Relaxed)
    }

    /// Block until the next inbound data message (or error). A closed
    /// channel reads as EOF.
    pub async fn read_message(&self) -> Result<Message, ConnError> {
        let mut inbound = self.inbound.lock().await;
        inbound.recv().await.unwrap_or(Err(ConnError::Eof))
    }

    /// Wrap `msg` in a DATA command and write it.
    pub async fn write_message(
        &self,
        msg:      &Message,
        compress: bool,
        encrypt:  bool,
    ) -> Result<(), CmdIoError> {
        self.cmdio
            .write_command(&Command::data(msg.clone()), compress, encrypt)
            .await
    }

    /// Write an arbitrary control command on this connection.
    pub async fn write_command(
        &self,
        cmd:      &Command,
        compress: bool,
        encrypt:  bool,
    ) -> Result<(), CmdIoError> {
        self.cmdio.write_command(cmd, compress, encrypt).await
    }

    /// Store new settings locally and push them to the peer as a SETTING
    /// command.
    pub async fn configure(&self, new: ConnSettings) -> Result<(), CmdIoError> {
        let cmd = Command::with_params(command::CMD_SETTING, new.to_params());
        *self.settings.lock().expect("settings lock") = new;
        self.cmdio.write_command(&cmd, false, true).await
    }

    /// Orderly local close: best-effort BYE, socket shutdown, reader
    /// cancellation.
    pub async fn close(&self) {
        let _ = self
            .cmdio
            .write_command(&Command::new(command::CMD_BYE), false, false)
            .await;
        self.cmdio.shutdown().await;
        if let Some(handle) = self.reader.lock().expect("reader handle lock").take() {
            handle.abort();
        }
    }
}

impl Drop for MsgConnection {
    fn drop(&mut self) {
        if let Some(handle) = self.reader.lock().expect("reader handle lock").take() {
            handle.abort();
        }
    }
}

impl fmt::Debug for MsgConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MsgConnection({}/{}, id={})", self.service, self.username, self.id)
    }
}

// ─── Reader task ─────────────────────────────────────────────────────────────

fn is_clean_eof(err: &CmdIoError) -> bool {
    matches!(
        err,
        CmdIoError::Frame(FrameError::Io(e)) if e.kind() == io::ErrorKind::UnexpectedEof
    )
}

async fn reader_loop(
    cmdio:     Arc<CommandIo>,
    processor: Arc<dyn CommandProcessor>,
    tx:        mpsc::Sender<Result<Message, ConnError>>,
) {
    loop {
        match cmdio.read_command().await {
            Ok(cmd) => match cmd.opcode {
                command::CMD_DATA => {
                    let msg = cmd.message.unwrap_or_default();
                    if tx.send(Ok(msg)).await.is_err() {
                        break;
                    }
                }
                command::CMD_BYE => {
                    let _ = tx.send(Err(ConnError::Eof)).await;
                    break;
                }
                _ => match processor.process_command(cmd).await {
                    Ok(None) => {}
                    Ok(Some(msg)) => {
                        if tx.send(Ok(msg)).await.is_err() {
                            break;
                        }
                    }
                    Err(ProcessError::BadPeer(e)) => {
                        tracing::warn!("dropping malformed control command: {e}");
                        let _ = tx.send(Err(ConnError::Peer(e))).await;
                    }
                    Err(ProcessError::Internal(e)) => {
                        let _ = tx.send(Err(ConnError::Internal(e))).await;
                    }
                    Err(ProcessError::Fatal(e)) => {
                        let _ = tx.send(Err(ConnError::CmdIo(e))).await;
                        break;
                    }
                },
            },
            Err(e) => {
                let err = if is_clean_eof(&e) { ConnError::Eof } else { ConnError::CmdIo(e) };
                let _ = tx.send(Err(err)).await;
                break;
            }
        }
    }
    cmdio.shutdown().await;
}
