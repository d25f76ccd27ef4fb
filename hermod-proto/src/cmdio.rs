//! [`CommandIo`] — structured commands on top of the frame codec.
//!
//! The write path serializes, optionally deflates, optionally seals with
//! the session's send-direction cipher, and writes one frame. The read
//! path reverses. A per-direction `tokio::sync::Mutex` keeps concurrent
//! writers from interleaving frames and makes the background reader the
//! sole consumer of the read half.
//!
//! Acknowledgements: commands written through [`CommandIo::write_command_acked`]
//! carry a fresh correlation id and the NEEDACK frame flag; the read path
//! answers inbound NEEDACK frames synchronously and resolves pending waits
//! when the matching ACK arrives.

use std::collections::HashMap;
use std::fmt;
use std::io::{self, Read};
use std::sync::Mutex as StdMutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::{Mutex, oneshot};

use hermod_crypto::{CryptoError, FrameCipher, KeySet};
use hermod_wire::command::{CMD_ACK, Command};
use hermod_wire::{Deserializable, Serializable, deserialize};

use crate::frame::{self, FLAG_COMPRESS, FLAG_ENCRYPT, FLAG_NEEDACK, FrameError};

// ─── Error ───────────────────────────────────────────────────────────────────

/// Failures on the command I/O layer. Apart from [`CmdIoError::AckTimeout`]
/// (a write-side condition), all of these poison the connection.
#[derive(Debug)]
pub enum CmdIoError {
    /// Framing violation.
    Frame(FrameError),
    /// Decryption or authentication failure.
    Crypto(CryptoError),
    /// The decrypted payload did not decode as a command.
    Decode(deserialize::Error),
    /// Deflate/inflate failure.
    Compress(io::Error),
    /// No ACK arrived within the allotted wait.
    AckTimeout,
}

impl fmt::Display for CmdIoError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Frame(e)    => write!(f, "{e}"),
            Self::Crypto(e)   => write!(f, "{e}"),
            Self::Decode(e)   => write!(f, "command decode: {e}"),
            Self::Compress(e) => write!(f, "compression: {e}"),
            Self::AckTimeout  => write!(f, "timed out waiting for ACK"),
        }
    }
}

impl std::error::Error for CmdIoError {}

impl From<FrameError> for CmdIoError {
    fn from(e: FrameError) -> Self { Self::Frame(e) }
}

impl From<CryptoError> for CmdIoError {
    fn from(e: CryptoError) -> Self { Self::Crypto(e) }
}

impl From<deserialize::Error> for CmdIoError {
    fn from(e: deserialize::Error) -> Self { Self::Decode(e) }
}

// ─── CommandIo ───────────────────────────────────────────────────────────────

/// Which end of the connection this `CommandIo` serves. Selects the
/// send/receive direction of the key set.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Side {
    /// Client endpoint: seals with client-direction keys.
    Client,
    /// Server endpoint: seals with server-direction keys.
    Server,
}

struct WriteHalf {
    io:     Box<dyn AsyncWrite + Send + Unpin>,
    cipher: FrameCipher,
}

struct ReadHalf {
    io:     Box<dyn AsyncRead + Send + Unpin>,
    cipher: FrameCipher,
}

/// Serializes [`Command`]s onto a framed, optionally encrypted stream.
pub struct CommandIo {
    writer:       Mutex<WriteHalf>,
    reader:       Mutex<ReadHalf>,
    pending_acks: StdMutex<HashMap<String, oneshot::Sender<()>>>,
    ack_counter:  AtomicU64,
    ceiling:      usize,
}

impl CommandIo {
    /// Wrap an established, key-exchanged stream.
    pub fn new<S>(stream: S, keys: &KeySet, side: Side) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let (read_io, write_io) = tokio::io::split(stream);
        let (seal, open) = match side {
            Side::Client => (
                FrameCipher::new(&keys.client_key, &keys.client_mac_key, &keys.client_iv),
                FrameCipher::new(&keys.server_key, &keys.server_mac_key, &keys.server_iv),
            ),
            Side::Server => (
                FrameCipher::new(&keys.server_key, &keys.server_mac_key, &keys.server_iv),
                FrameCipher::new(&keys.client_key, &keys.client_mac_key, &keys.client_iv),
            ),
        };
        Self {
            writer: Mutex::new(WriteHalf { io: Box::new(write_io), cipher: seal }),
            reader: Mutex::new(ReadHalf { io: Box::new(read_io), cipher: open }),
            pending_acks: StdMutex::new(HashMap::new()),
            ack_counter: AtomicU64::new(0),
            ceiling: frame::DEFAULT_FRAME_CEILING,
        }
    }

    /// Serialize and write one command. The compression decision belongs to
    /// the caller; this layer only applies it.
    pub async fn write_command(
        &self,
        cmd:      &Command,
        compress: bool,
        encrypt:  bool,
    ) -> Result<(), CmdIoError> {
        let mut payload = cmd.to_bytes();
        let mut flags = 0u8;

        if compress {
            payload = deflate(&payload).map_err(CmdIoError::Compress)?;
            flags |= FLAG_COMPRESS;
        }
        if cmd.ack_id.is_some() {
            flags |= FLAG_NEEDACK;
        }

        let mut writer = self.writer.lock().await;
        if encrypt {
            payload = writer.cipher.seal(&payload);
            flags |= FLAG_ENCRYPT;
        }
        frame::write_frame(&mut writer.io, flags, &payload, self.ceiling).await?;
        Ok(())
    }

    /// Write a command that requires acknowledgement, waiting up to `wait`
    /// for the peer's ACK.
    pub async fn write_command_acked(
        &self,
        mut cmd:  Command,
        compress: bool,
        encrypt:  bool,
        wait:     Duration,
    ) -> Result<(), CmdIoError> {
        let id = format!("c-{}", self.ack_counter.fetch_add(1, Ordering::Relaxed));
        cmd.ack_id = Some(id.clone());

        let (tx, rx) = oneshot::channel();
        self.pending_acks.lock().expect("ack table lock").insert(id.clone(), tx);

        if let Err(e) = self.write_command(&cmd, compress, encrypt).await {
            self.pending_acks.lock().expect("ack table lock").remove(&id);
            return Err(e);
        }

        match tokio::time::timeout(wait, rx).await {
            Ok(Ok(())) => Ok(()),
            _ => {
                self.pending_acks.lock().expect("ack table lock").remove(&id);
                Err(CmdIoError::AckTimeout)
            }
        }
    }

    /// Read the next command.
    ///
    /// ACK frames are consumed internally; NEEDACK frames are answered
    /// before the command is returned. Commands with unknown opcodes are
    /// returned as-is — policy belongs to the caller.
    pub async fn read_command(&self) -> Result<Command, CmdIoError> {
        loop {
            let (flags, mut payload) = {
                let mut reader = self.reader.lock().await;
                let (flags, mut payload) = frame::read_frame(&mut reader.io, self.ceiling).await?;
                if flags & FLAG_ENCRYPT != 0 {
                    payload = reader.cipher.open(&payload)?;
                }
                (flags, payload)
            };

            if flags & FLAG_COMPRESS != 0 {
                payload = inflate(&payload).map_err(CmdIoError::Compress)?;
            }
            let cmd = Command::from_bytes(&payload)?;

            if cmd.opcode == CMD_ACK {
                if let Some(id) = cmd.params.first() {
                    if let Some(tx) = self.pending_acks.lock().expect("ack table lock").remove(id) {
                        let _ = tx.send(());
                    }
                }
                continue;
            }

            if flags & FLAG_NEEDACK != 0 {
                match &cmd.ack_id {
                    Some(id) => {
                        let ack = Command::with_params(CMD_ACK, vec![id.clone()]);
                        self.write_command(&ack, false, flags & FLAG_ENCRYPT != 0).await?;
                    }
                    None => tracing::warn!("peer sent NEEDACK frame without a correlation id"),
                }
            }

            return Ok(cmd);
        }
    }

    /// Shut the write half down (sends FIN on TCP). Read side unblocks when
    /// the peer closes in turn.
    pub async fn shutdown(&self) {
        let mut writer = self.writer.lock().await;
        let _ = writer.io.shutdown().await;
    }
}

// ─── Compression ─────────────────────────────────────────────────────────────

fn deflate(data: &[u8]) -> io::Result<Vec<u8>> {
    let mut out = Vec::new();
    flate2::read::ZlibEncoder::new(data, flate2::Compression::default())
        .read_to_end(&mut out)?;
    Ok(out)
}

fn inflate(data: &[u8]) -> io::Result<Vec<u8>> {
    let mut out = Vec::new();
    flate2::read::ZlibDecoder::new(data).read_to_end(&mut out)?;
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deflate_inflate_roundtrip() {
        let data: Vec<u8> = b"aaaaaaaaaabbbbbbbbbbcccccccccc".repeat(20);
        let packed = deflate(&data).unwrap();
        assert!(packed.len() < data.len());
        assert_eq!(inflate(&packed).unwrap(), data);
    }

    #[test]
    fn inflate_garbage_errors() {
        assert!(inflate(&[0xde, 0xad, 0xbe, 0xef]).is_err());
    }
}
