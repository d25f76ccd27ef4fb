//! RSA-authenticated DH key exchange.
//!
//! # Flow
//!
//! ```text
//! server → client   version byte
//! client → server   version byte
//! server → client   nonce_s ‖ g_s ‖ sign(priv, nonce_s ‖ g_s)
//! client → server   nonce_c ‖ g_c ‖ HMAC(confirm_key, g_s ‖ g_c)
//! ```
//!
//! Both sides then derive the same [`KeySet`] from the shared secret and
//! the two nonces. Every failure is fatal; there is no retry inside the
//! handshake.
//!
//! The step functions are sans-IO and independently testable; the two
//! `*_key_exchange` drivers run them over an async stream using the frame
//! codec (flags always zero during the handshake).

use std::fmt;
use std::io;

use hmac::{Hmac, Mac};
use rsa::{RsaPrivateKey, RsaPublicKey};
use sha2::Sha256;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use hermod_crypto::{CryptoError, DH_LEN, DhSecret, KeySet, dh_generate, dh_shared, identity};

use crate::frame::{self, FrameError};

/// First byte each side sends; a mismatch aborts the handshake.
pub const PROTOCOL_VERSION: u8 = 1;

const NONCE_LEN: usize = 32;
const MAC_LEN: usize = 32;

// ─── Error ───────────────────────────────────────────────────────────────────

/// Errors that abort the handshake.
#[derive(Debug)]
pub enum KeyExchangeError {
    /// Peer speaks a different protocol version.
    Version {
        /// The version byte the peer sent.
        got: u8,
    },
    /// The server's identity signature did not verify against the pinned key.
    Signature,
    /// The client's confirmation MAC did not verify.
    Mac,
    /// A handshake payload had the wrong shape.
    Malformed,
    /// A DH public value was degenerate.
    BadPublic,
    /// Frame-level failure (includes short read / EOF).
    Frame(FrameError),
    /// Raw stream failure during the version exchange.
    Io(io::Error),
}

impl fmt::Display for KeyExchangeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Version { got } => write!(f, "protocol version mismatch: peer sent {got}"),
            Self::Signature       => write!(f, "server identity signature rejected"),
            Self::Mac             => write!(f, "handshake confirmation MAC mismatch"),
            Self::Malformed       => write!(f, "malformed handshake payload"),
            Self::BadPublic       => write!(f, "degenerate DH public value"),
            Self::Frame(e)        => write!(f, "{e}"),
            Self::Io(e)           => write!(f, "handshake I/O: {e}"),
        }
    }
}

impl std::error::Error for KeyExchangeError {}

impl From<FrameError> for KeyExchangeError {
    fn from(e: FrameError) -> Self { Self::Frame(e) }
}

impl From<io::Error> for KeyExchangeError {
    fn from(e: io::Error) -> Self { Self::Io(e) }
}

impl From<CryptoError> for KeyExchangeError {
    fn from(e: CryptoError) -> Self {
        match e {
            CryptoError::Signature      => Self::Signature,
            CryptoError::BadPublicValue => Self::BadPublic,
            CryptoError::MacMismatch    => Self::Mac,
            _                           => Self::Malformed,
        }
    }
}

// ─── Sans-IO steps ───────────────────────────────────────────────────────────

/// Server-side state between hello and finish.
struct ServerState {
    nonce:  [u8; NONCE_LEN],
    secret: DhSecret,
    public: [u8; DH_LEN],
}

/// Build the server hello: `nonce_s ‖ g_s ‖ signature(nonce_s ‖ g_s)`.
fn server_hello(privkey: &RsaPrivateKey) -> Result<(Vec<u8>, ServerState), KeyExchangeError> {
    let mut nonce = [0u8; NONCE_LEN];
    getrandom::getrandom(&mut nonce).expect("getrandom");
    let (secret, public) = dh_generate();

    let mut payload = Vec::with_capacity(NONCE_LEN + DH_LEN + 256);
    payload.extend_from_slice(&nonce);
    payload.extend_from_slice(&public);
    let signature = identity::sign(privkey, &payload)?;
    payload.extend_from_slice(&signature);

    Ok((payload, ServerState { nonce, secret, public }))
}

/// Verify the hello with the pinned key and build the client response:
/// `nonce_c ‖ g_c ‖ HMAC(confirm_key, g_s ‖ g_c)`.
fn client_respond(
    pubkey: &RsaPublicKey,
    hello:  &[u8],
) -> Result<(Vec<u8>, KeySet), KeyExchangeError> {
    if hello.len() <= NONCE_LEN + DH_LEN {
        return Err(KeyExchangeError::Malformed);
    }
    let signed = &hello[..NONCE_LEN + DH_LEN];
    let signature = &hello[NONCE_LEN + DH_LEN..];
    identity::verify(pubkey, signed, signature).map_err(|_| KeyExchangeError::Signature)?;

    let nonce_server: [u8; NONCE_LEN] = hello[..NONCE_LEN].try_into().expect("fixed slice");
    let server_public = &hello[NONCE_LEN..NONCE_LEN + DH_LEN];

    let (secret, public) = dh_generate();
    let shared = dh_shared(&secret, server_public)?;

    let mut nonce_client = [0u8; NONCE_LEN];
    getrandom::getrandom(&mut nonce_client).expect("getrandom");

    let confirm_key = KeySet::confirm_key(&shared, &nonce_server, &nonce_client);
    let mut mac = Hmac::<Sha256>::new_from_slice(&confirm_key)
        .expect("hmac accepts any key length");
    mac.update(server_public);
    mac.update(&public);
    let tag: [u8; MAC_LEN] = mac.finalize().into_bytes().into();

    let mut payload = Vec::with_capacity(NONCE_LEN + DH_LEN + MAC_LEN);
    payload.extend_from_slice(&nonce_client);
    payload.extend_from_slice(&public);
    payload.extend_from_slice(&tag);

    Ok((payload, KeySet::derive(&shared, &nonce_server, &nonce_client)))
}

/// Verify the client response and derive the key set.
fn server_finish(state: &ServerState, response: &[u8]) -> Result<KeySet, KeyExchangeError> {
    if response.len() != NONCE_LEN + DH_LEN + MAC_LEN {
        return Err(KeyExchangeError::Malformed);
    }
    let nonce_client: [u8; NONCE_LEN] = response[..NONCE_LEN].try_into().expect("fixed slice");
    let client_public = &response[NONCE_LEN..NONCE_LEN + DH_LEN];
    let tag = &response[NONCE_LEN + DH_LEN..];

    let shared = dh_shared(&state.secret, client_public)?;

    let confirm_key = KeySet::confirm_key(&shared, &state.nonce, &nonce_client);
    let mut mac = Hmac::<Sha256>::new_from_slice(&confirm_key)
        .expect("hmac accepts any key length");
    mac.update(&state.public);
    mac.update(client_public);
    mac.verify_slice(tag).map_err(|_| KeyExchangeError::Mac)?;

    Ok(KeySet::derive(&shared, &state.nonce, &nonce_client))
}

// ─── Async drivers ───────────────────────────────────────────────────────────

/// Run the server side of the handshake over `stream`.
pub async fn server_key_exchange<S>(
    privkey: &RsaPrivateKey,
    stream:  &mut S,
) -> Result<KeySet, KeyExchangeError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    stream.write_all(&[PROTOCOL_VERSION]).await?;
    stream.flush().await?;
    let mut version = [0u8; 1];
    stream.read_exact(&mut version).await?;
    if version[0] != PROTOCOL_VERSION {
        return Err(KeyExchangeError::Version { got: version[0] });
    }

    let (hello, state) = server_hello(privkey)?;
    frame::write_frame(stream, 0, &hello, frame::DEFAULT_FRAME_CEILING).await?;

    let (_, response) = frame::read_frame(stream, frame::DEFAULT_FRAME_CEILING).await?;
    server_finish(&state, &response)
}

/// Run the client side of the handshake over `stream`, pinning `pubkey`.
pub async fn client_key_exchange<S>(
    pubkey: &RsaPublicKey,
    stream: &mut S,
) -> Result<KeySet, KeyExchangeError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut version = [0u8; 1];
    stream.read_exact(&mut version).await?;
    if version[0] != PROTOCOL_VERSION {
        return Err(KeyExchangeError::Version { got: version[0] });
    }
    stream.write_all(&[PROTOCOL_VERSION]).await?;
    stream.flush().await?;

    let (_, hello) = frame::read_frame(stream, frame::DEFAULT_FRAME_CEILING).await?;
    let (response, keys) = client_respond(pubkey, &hello)?;
    frame::write_frame(stream, 0, &response, frame::DEFAULT_FRAME_CEILING).await?;
    Ok(keys)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn keypair() -> (RsaPrivateKey, RsaPublicKey) {
        let privkey = RsaPrivateKey::new(&mut rand::thread_rng(), 2048).unwrap();
        let pubkey = privkey.to_public_key();
        (privkey, pubkey)
    }

    #[test]
    fn steps_agree_on_keys() {
        let (privkey, pubkey) = keypair();
        let (hello, state) = server_hello(&privkey).unwrap();
        let (response, client_keys) = client_respond(&pubkey, &hello).unwrap();
        let server_keys = server_finish(&state, &response).unwrap();
        assert!(server_keys == client_keys);
    }

    #[test]
    fn wrong_pinned_key_fails_signature() {
        let (privkey, _) = keypair();
        let (_, other_pub) = keypair();
        let (hello, _) = server_hello(&privkey).unwrap();
        assert!(matches!(
            client_respond(&other_pub, &hello),
            Err(KeyExchangeError::Signature)
        ));
    }

    #[test]
    fn tampered_response_fails_mac() {
        let (privkey, pubkey) = keypair();
        let (hello, state) = server_hello(&privkey).unwrap();
        let (mut response, _) = client_respond(&pubkey, &hello).unwrap();
        response[NONCE_LEN + 3] ^= 0x40; // flip a bit of g_c
        assert!(matches!(
            server_finish(&state, &response),
            Err(KeyExchangeError::Mac)
        ));
    }

    #[test]
    fn short_payloads_are_malformed() {
        let (privkey, pubkey) = keypair();
        assert!(matches!(
            client_respond(&pubkey, &[0u8; 16]),
            Err(KeyExchangeError::Malformed)
        ));
        let (_, state) = server_hello(&privkey).unwrap();
        assert!(matches!(
            server_finish(&state, &[0u8; 16]),
            Err(KeyExchangeError::Malformed)
        ));
    }
}
