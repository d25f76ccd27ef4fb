//! Connection protocol for the hermod message bus.
//!
//! This crate handles everything between a raw byte stream and a
//! [`MsgConnection`]:
//! * Length-prefixed framing with per-frame compress/encrypt/ack flags
//! * The RSA-authenticated DH key exchange
//! * Command serialization on top of frames ([`CommandIo`])
//! * The per-peer session connection with its background reader
//!
//! It is transport-agnostic above `AsyncRead + AsyncWrite`: bring your own
//! TCP stream (or an in-memory duplex in tests).

#![deny(unsafe_code)]

pub mod cmdio;
pub mod conn;
pub mod frame;
pub mod keyex;

pub use cmdio::{CmdIoError, CommandIo, Side};
pub use conn::{CommandProcessor, ConnError, ConnSettings, MsgConnection, ProcessError, ProcessFuture};
pub use keyex::{KeyExchangeError, PROTOCOL_VERSION, client_key_exchange, server_key_exchange};
