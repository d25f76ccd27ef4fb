//! The [`Message`] record — what users of the bus actually exchange.

use std::collections::BTreeMap;

use crate::deserialize::{self, Buffer, Deserializable};
use crate::serialize::Serializable;

const FIELD_HEADER: u8 = 1 << 0;
const FIELD_BODY:   u8 = 1 << 1;

/// A user-visible message: a small string-to-string header map plus an
/// opaque body.
///
/// The header is a `BTreeMap` so the encoding is canonical — the same
/// message always serializes to the same bytes regardless of insertion
/// order.
///
/// `sender`, `sender_service` and `id` are transport-assigned metadata:
/// the receiving side fills them in from the surrounding command, and they
/// are never written to the wire or persisted as part of the message.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Message {
    /// Application headers.
    pub header: BTreeMap<String, String>,
    /// Opaque payload.
    pub body: Vec<u8>,

    /// Username of the originating user, when relayed.
    pub sender: Option<String>,
    /// Service of the originating user, when relayed across services.
    pub sender_service: Option<String>,
    /// Cache id, when the message was (or can be) retrieved from the cache.
    pub id: Option<String>,
}

impl Message {
    /// A message with the given body and no headers.
    pub fn with_body(body: impl Into<Vec<u8>>) -> Self {
        Self { body: body.into(), ..Self::default() }
    }

    /// Content equality: header and body only, ignoring transport metadata.
    pub fn eq_content(&self, other: &Message) -> bool {
        self.header == other.header && self.body == other.body
    }

    /// Approximate wire size used for digest/compress threshold decisions:
    /// the byte length of every header key and value plus the body length.
    pub fn size(&self) -> usize {
        let header: usize = self.header.iter().map(|(k, v)| k.len() + v.len()).sum();
        header + self.body.len()
    }

    /// True when the message carries neither headers nor a body.
    pub fn is_empty(&self) -> bool {
        self.header.is_empty() && self.body.is_empty()
    }
}

impl Serializable for Message {
    fn serialize(&self, buf: &mut impl Extend<u8>) {
        let mut fields = 0u8;
        if !self.header.is_empty() { fields |= FIELD_HEADER; }
        if !self.body.is_empty()   { fields |= FIELD_BODY; }
        fields.serialize(buf);

        if !self.header.is_empty() {
            (self.header.len() as u32).serialize(buf);
            for (k, v) in &self.header {
                k.serialize(buf);
                v.serialize(buf);
            }
        }
        if !self.body.is_empty() {
            self.body.serialize(buf);
        }
    }
}

impl Deserializable for Message {
    fn deserialize(buf: Buffer) -> deserialize::Result<Self> {
        let fields = u8::deserialize(buf)?;

        let mut header = BTreeMap::new();
        if fields & FIELD_HEADER != 0 {
            let count = u32::deserialize(buf)?;
            for _ in 0..count {
                let k = String::deserialize(buf)?;
                let v = String::deserialize(buf)?;
                header.insert(k, v);
            }
        }

        let body = if fields & FIELD_BODY != 0 {
            Vec::<u8>::deserialize(buf)?
        } else {
            Vec::new()
        };

        Ok(Self { header, body, ..Self::default() })
    }
}
