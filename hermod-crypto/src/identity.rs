//! RSA server identity: PKCS#1 v1.5 signatures over SHA-256.
//!
//! The server proves possession of its private key during the handshake;
//! clients pin the matching public key.

use rsa::{Pkcs1v15Sign, RsaPrivateKey, RsaPublicKey};
use sha2::Sha256;

use crate::CryptoError;
use crate::sha256;

/// Sign `data` with the server's identity key.
pub fn sign(privkey: &RsaPrivateKey, data: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let digest = sha256!(data);
    privkey
        .sign(Pkcs1v15Sign::new::<Sha256>(), &digest)
        .map_err(|_| CryptoError::Signature)
}

/// Verify a signature produced by [`sign`] against the pinned public key.
pub fn verify(pubkey: &RsaPublicKey, data: &[u8], signature: &[u8]) -> Result<(), CryptoError> {
    let digest = sha256!(data);
    pubkey
        .verify(Pkcs1v15Sign::new::<Sha256>(), &digest, signature)
        .map_err(|_| CryptoError::Signature)
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
    fn sign_verify_roundtrip() {
        let (privkey, pubkey) = keypair();
        let sig = sign(&privkey, b"handshake transcript").unwrap();
        verify(&pubkey, b"handshake transcript", &sig).unwrap();
    }

    #[test]
    fn wrong_key_rejected() {
        let (privkey, _) = keypair();
        let (_, other_pub) = keypair();
        let sig = sign(&privkey, b"handshake transcript").unwrap();
        assert_eq!(
            verify(&other_pub, b"handshake transcript", &sig),
            Err(CryptoError::Signature)
        );
    }

    #[test]
    fn altered_data_rejected() {
        let (privkey, pubkey) = keypair();
        let sig = sign(&privkey, b"handshake transcript").unwrap();
        assert_eq!(
            verify(&pubkey, b"handshake transcripT", &sig),
            Err(CryptoError::Signature)
        );
    }
}
