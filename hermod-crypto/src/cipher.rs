//! [`FrameCipher`] — authenticated encryption for one traffic direction.
//!
//! Encrypt-then-MAC: AES-256-CTR over a continuous keystream, HMAC-SHA256
//! tag over each frame's ciphertext. Frames must be opened in the order
//! they were sealed (the per-connection write lock and the single reader
//! task guarantee that).

use aes::Aes256;
use ctr::Ctr128BE;
use ctr::cipher::{KeyIvInit, StreamCipher};
use hmac::{Hmac, Mac};
use sha2::Sha256;

use crate::CryptoError;

type Aes256Ctr = Ctr128BE<Aes256>;
type HmacSha256 = Hmac<Sha256>;

/// Byte length of the per-frame authentication tag.
pub const TAG_LEN: usize = 32;

/// Stateful cipher for one direction of a connection.
///
/// Each endpoint builds two: one from its send-direction material to seal,
/// one from the receive direction to open.
pub struct FrameCipher {
    cipher: Aes256Ctr,
    mac_key: [u8; 32],
}

impl FrameCipher {
    /// Build a cipher from one direction's key material.
    pub fn new(key: &[u8; 32], mac_key: &[u8; 32], iv: &[u8; 16]) -> Self {
        Self {
            cipher: Aes256Ctr::new(key.into(), iv.into()),
            mac_key: *mac_key,
        }
    }

    fn tag(&self, ciphertext: &[u8]) -> [u8; TAG_LEN] {
        let mut mac = HmacSha256::new_from_slice(&self.mac_key)
            .expect("hmac accepts any key length");
        mac.update(ciphertext);
        mac.finalize().into_bytes().into()
    }

    /// Encrypt `plaintext` and append the authentication tag.
    pub fn seal(&mut self, plaintext: &[u8]) -> Vec<u8> {
        let mut out = Vec::with_capacity(plaintext.len() + TAG_LEN);
        out.extend_from_slice(plaintext);
        self.cipher.apply_keystream(&mut out);
        let tag = self.tag(&out);
        out.extend_from_slice(&tag);
        out
    }

    /// Verify and decrypt a sealed frame payload.
    ///
    /// Verification happens before any keystream is consumed, so a tampered
    /// frame leaves the cipher state untouched.
    pub fn open(&mut self, sealed: &[u8]) -> Result<Vec<u8>, CryptoError> {
        if sealed.len() < TAG_LEN {
            return Err(CryptoError::TruncatedCiphertext);
        }
        let (ciphertext, tag) = sealed.split_at(sealed.len() - TAG_LEN);

        let mut mac = HmacSha256::new_from_slice(&self.mac_key)
            .expect("hmac accepts any key length");
        mac.update(ciphertext);
        mac.verify_slice(tag).map_err(|_| CryptoError::MacMismatch)?;

        let mut out = ciphertext.to_vec();
        self.cipher.apply_keystream(&mut out);
        Ok(out)
    }
}
