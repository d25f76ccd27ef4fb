//! Wire data model for the hermod message bus.
//!
//! | Module          | Contents                                              |
//! |-----------------|-------------------------------------------------------|
//! | [`message`]     | [`Message`] — header map + opaque body                |
//! | [`command`]     | [`Command`] — opcode, params, optional message        |
//! | [`serialize`]   | [`Serializable`] trait and primitive impls            |
//! | [`deserialize`] | [`Deserializable`] trait, [`Cursor`] buffer           |
//!
//! The encoding is field-tagged with omit-if-empty: a one-byte field bitmap
//! precedes the optional parts of every record, so an empty header, body or
//! param list costs nothing on the wire. Strings and byte blobs use a
//! length-prefixed, 4-byte-aligned layout.
//!
//! This crate is sans-IO: it never touches a socket.

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod command;
pub mod deserialize;
pub mod message;
pub mod serialize;

pub use command::Command;
pub use deserialize::{Cursor, Deserializable};
pub use message::Message;
pub use serialize::Serializable;
