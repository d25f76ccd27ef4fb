//! The [`Command`] record and the protocol opcode table.

use crate::deserialize::{self, Buffer, Deserializable};
use crate::message::Message;
use crate::serialize::Serializable;

// ─── Opcodes ─────────────────────────────────────────────────────────────────

/// Carry a data [`Message`] to the peer.
pub const CMD_DATA: u16 = 0;
/// Credential authentication request: `params = [service, username, token]`.
pub const CMD_AUTH: u16 = 1;
/// Authentication accepted.
pub const CMD_AUTHOK: u16 = 2;
/// Acknowledge a NEEDACK frame: `params = [ack_id]`.
pub const CMD_ACK: u16 = 3;
/// Orderly connection teardown.
pub const CMD_BYE: u16 = 4;
/// Mark the connection invisible for direct delivery.
pub const CMD_INVIS: u16 = 5;
/// Mark the connection visible again.
pub const CMD_VIS: u16 = 6;
/// Reserved digest-mode toggle; recognized but currently a no-op.
pub const CMD_DIGEST_MODE: u16 = 7;
/// Digest notification: `params = [size, msg_id]`, optional info header.
pub const CMD_DIGEST: u16 = 8;
/// Server-to-client relayed message: `params = [sender, sender_service?, id?]`.
pub const CMD_FWD: u16 = 9;
/// Client request to relay a message: `params = [receiver, receiver_service?]`.
pub const CMD_FWD_REQ: u16 = 10;
/// Client request for a cached message: `params = [id]`.
pub const CMD_MSG_RETRIEVE: u16 = 11;
/// Visibility update: `params = ["1"]` or `["0"]`.
pub const CMD_SET_VISIBILITY: u16 = 12;
/// Connection settings push:
/// `params = [digest_threshold, compress_threshold, encrypt, digest_fields…]`.
pub const CMD_SETTING: u16 = 13;

/// Highest opcode the protocol currently defines.
pub const CMD_MAX: u16 = CMD_SETTING;

/// True when `opcode` is inside the known table. Commands with opcodes
/// outside it still decode (policy is the caller's), but processors report
/// them as a peer-implementation error.
pub fn known_opcode(opcode: u16) -> bool {
    opcode <= CMD_MAX
}

// ─── Command ─────────────────────────────────────────────────────────────────

const FIELD_PARAMS:  u8 = 1 << 0;
const FIELD_MESSAGE: u8 = 1 << 1;
const FIELD_ACK_ID:  u8 = 1 << 2;

/// A protocol command: an opcode, short string parameters, and an optional
/// carried [`Message`].
///
/// `ack_id` is the acknowledgement correlation id; it is present exactly on
/// commands sent in NEEDACK frames and echoed back as `params[0]` of the
/// corresponding [`CMD_ACK`].
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Command {
    /// Operation selector; see the `CMD_*` constants.
    pub opcode: u16,
    /// Positional string parameters. Empty for most DATA traffic.
    pub params: Vec<String>,
    /// Optional carried message.
    pub message: Option<Message>,
    /// Acknowledgement correlation id, when the sender requested an ACK.
    pub ack_id: Option<String>,
}

impl Command {
    /// A bare command with no params or message.
    pub fn new(opcode: u16) -> Self {
        Self { opcode, ..Self::default() }
    }

    /// A command carrying `params`.
    pub fn with_params(opcode: u16, params: Vec<String>) -> Self {
        Self { opcode, params, ..Self::default() }
    }

    /// A DATA command wrapping `msg`.
    pub fn data(msg: Message) -> Self {
        Self { opcode: CMD_DATA, message: Some(msg), ..Self::default() }
    }

    /// Equality by opcode, params and message *content* (the message
    /// comparison ignores transport metadata).
    pub fn eq_content(&self, other: &Command) -> bool {
        if self.opcode != other.opcode || self.params != other.params {
            return false;
        }
        match (&self.message, &other.message) {
            (None, None) => true,
            (Some(a), Some(b)) => a.eq_content(b),
            _ => false,
        }
    }
}

impl Serializable for Command {
    fn serialize(&self, buf: &mut impl Extend<u8>) {
        self.opcode.serialize(buf);

        let mut fields = 0u8;
        if !self.params.is_empty()  { fields |= FIELD_PARAMS; }
        if self.message.is_some()   { fields |= FIELD_MESSAGE; }
        if self.ack_id.is_some()    { fields |= FIELD_ACK_ID; }
        fields.serialize(buf);

        if !self.params.is_empty() {
            (self.params.len() as u32).serialize(buf);
            for p in &self.params {
                p.serialize(buf);
            }
        }
        if let Some(msg) = &self.message {
            msg.serialize(buf);
        }
        if let Some(id) = &self.ack_id {
            id.serialize(buf);
        }
    }
}

impl Deserializable for Command {
    fn deserialize(buf: Buffer) -> deserialize::Result<Self> {
        let opcode = u16::deserialize(buf)?;
        let fields = u8::deserialize(buf)?;

        let mut params = Vec::new();
        if fields & FIELD_PARAMS != 0 {
            let count = u32::deserialize(buf)?;
            params.reserve(count as usize);
            for _ in 0..count {
                params.push(String::deserialize(buf)?);
            }
        }

        let message = if fields & FIELD_MESSAGE != 0 {
            Some(Message::deserialize(buf)?)
        } else {
            None
        };

        let ack_id = if fields & FIELD_ACK_ID != 0 {
            Some(String::deserialize(buf)?)
        } else {
            None
        };

        Ok(Self { opcode, params, message, ack_id })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bare_command_roundtrip() {
        let cmd = Command::new(CMD_BYE);
        let decoded = Command::from_bytes(&cmd.to_bytes()).unwrap();
        assert_eq!(decoded, cmd);
    }

    #[test]
    fn unknown_opcode_still_decodes() {
        let cmd = Command::with_params(999, vec!["future".into()]);
        let decoded = Command::from_bytes(&cmd.to_bytes()).unwrap();
        assert_eq!(decoded.opcode, 999);
        assert!(!known_opcode(decoded.opcode));
    }

    #[test]
    fn ack_id_roundtrip() {
        let mut cmd = Command::data(Message::with_body(b"hi".to_vec()));
        cmd.ack_id = Some("c-17".into());
        let decoded = Command::from_bytes(&cmd.to_bytes()).unwrap();
        assert_eq!(decoded.ack_id.as_deref(), Some("c-17"));
    }

    #[test]
    fn truncated_command_is_eof() {
        let cmd = Command::with_params(CMD_AUTH, vec!["svc".into(), "user".into(), "tok".into()]);
        let bytes = cmd.to_bytes();
        let err = Command::from_bytes(&bytes[..bytes.len() - 3]).unwrap_err();
        assert_eq!(err, deserialize::Error::UnexpectedEof);
    }
}
