//! Diffie-Hellman over the 2048-bit MODP group (RFC 3526, group 14).

use num_bigint::BigUint;
use num_traits::One;

use crate::CryptoError;

/// Byte length of a public value and of the shared secret.
pub const DH_LEN: usize = 256;

/// RFC 3526 group 14 prime (2048 bits), generator 2.
const MODP_2048: &str = "\
FFFFFFFFFFFFFFFFC90FDAA22168C234C4C6628B80DC1CD129024E088A67CC74\
020BBEA63B139B22514A08798E3404DDEF9519B3CD3A431B302B0A6DF25F1437\
4FE1356D6D51C245E485B576625E7EC6F44C42E9A637ED6B0BFF5CB6F406B7ED\
EE386BFB5A899FA5AE9F24117C4B1FE649286651ECE45B3DC2007CB8A163BF05\
98DA48361C55D39A69163FA8FD24CF5F83655D23DCA3AD961C62F356208552BB\
9ED529077096966D670C354E4ABC9804F1746C08CA18217C32905E462E36CE3B\
E39E772C180E86039B2783A2EC07A28FB5C55DF06F4C52C9DE2BCBF695581718\
3995497CEA956AE515D2261898FA051015728E5A8AACAA68FFFFFFFFFFFFFFFF";

fn prime() -> BigUint {
    BigUint::parse_bytes(MODP_2048.as_bytes(), 16).expect("group prime parses")
}

/// A private DH exponent. Kept opaque; only the shared-secret computation
/// consumes it.
pub struct DhSecret {
    exponent: BigUint,
}

fn to_fixed(value: &BigUint) -> [u8; DH_LEN] {
    let bytes = value.to_bytes_be();
    let mut out = [0u8; DH_LEN];
    out[DH_LEN - bytes.len()..].copy_from_slice(&bytes);
    out
}

/// Generate a fresh keypair: `(secret, g^secret mod p)`.
pub fn dh_generate() -> (DhSecret, [u8; DH_LEN]) {
    let mut raw = [0u8; 32];
    getrandom::getrandom(&mut raw).expect("getrandom");
    let exponent = BigUint::from_bytes_be(&raw);
    let public = BigUint::from(2u32).modpow(&exponent, &prime());
    (DhSecret { exponent }, to_fixed(&public))
}

/// Compute the shared secret `peer^secret mod p`.
///
/// Public values outside `(1, p-1)` are rejected; accepting them would let
/// a peer force a degenerate secret.
pub fn dh_shared(secret: &DhSecret, peer_public: &[u8]) -> Result<[u8; DH_LEN], CryptoError> {
    let p = prime();
    let peer = BigUint::from_bytes_be(peer_public);
    let one = BigUint::one();
    if peer <= one || peer >= &p - &one {
        return Err(CryptoError::BadPublicValue);
    }
    Ok(to_fixed(&peer.modpow(&secret.exponent, &p)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn both_sides_agree() {
        let (sec_a, pub_a) = dh_generate();
        let (sec_b, pub_b) = dh_generate();
        let shared_a = dh_shared(&sec_a, &pub_b).unwrap();
        let shared_b = dh_shared(&sec_b, &pub_a).unwrap();
        assert_eq!(shared_a, shared_b);
    }

    #[test]
    fn fresh_pairs_differ() {
        let (_, pub_a) = dh_generate();
        let (_, pub_b) = dh_generate();
        assert_ne!(pub_a, pub_b);
    }

    #[test]
    fn degenerate_publics_rejected() {
        let (sec, _) = dh_generate();
        assert_eq!(dh_shared(&sec, &[0u8]), Err(CryptoError::BadPublicValue));
        assert_eq!(dh_shared(&sec, &[1u8]), Err(CryptoError::BadPublicValue));

        let p_minus_1 = {
            let p = BigUint::parse_bytes(MODP_2048.as_bytes(), 16).unwrap();
            (p - 1u32).to_bytes_be()
        };
        assert_eq!(dh_shared(&sec, &p_minus_1), Err(CryptoError::BadPublicValue));
    }
}
