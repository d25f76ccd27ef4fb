//! Cryptographic primitives for the hermod message bus.
//!
//! Provides:
//! - [`KeySet`] — per-direction symmetric key material derived from a
//!   completed handshake
//! - [`FrameCipher`] — AES-256-CTR + HMAC-SHA256 encrypt-then-MAC for frame
//!   payloads
//! - 2048-bit MODP Diffie-Hellman (group 14) helpers
//! - RSA server-identity signing/verification (PKCS#1 v1.5 over SHA-256)
//! - `sha256!` hash macro

#![deny(unsafe_code)]

pub mod cipher;
pub mod dh;
pub mod identity;
mod keyset;
mod sha;

pub use cipher::FrameCipher;
pub use dh::{DH_LEN, DhSecret, dh_generate, dh_shared};
pub use keyset::KeySet;

// ─── Error ───────────────────────────────────────────────────────────────────

/// Errors surfaced by the primitives in this crate.
#[derive(Clone, Debug, PartialEq)]
pub enum CryptoError {
    /// A frame's authentication tag did not verify.
    MacMismatch,
    /// Ciphertext shorter than the mandatory tag.
    TruncatedCiphertext,
    /// An RSA signature failed to verify, or signing itself failed.
    Signature,
    /// A DH public value was outside the acceptable range `(1, p-1)`.
    BadPublicValue,
}

impl std::fmt::Display for CryptoError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::MacMismatch         => write!(f, "frame MAC mismatch"),
            Self::TruncatedCiphertext => write!(f, "ciphertext shorter than its tag"),
            Self::Signature           => write!(f, "RSA signature failure"),
            Self::BadPublicValue      => write!(f, "DH public value out of range"),
        }
    }
}

impl std::error::Error for CryptoError {}
