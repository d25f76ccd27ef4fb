//! [`KeySet`] — the symmetric key material both endpoints hold after a
//! successful handshake.

use pbkdf2::pbkdf2_hmac;
use sha2::Sha256;

/// PBKDF2 round count for key derivation.
const KDF_ROUNDS: u32 = 4096;

/// Total derived material: two cipher keys, two MAC keys, two IVs.
const OKM_LEN: usize = 32 + 32 + 32 + 32 + 16 + 16;

/// Per-direction symmetric keys plus MAC/IV material.
///
/// `client_*` protects client→server traffic, `server_*` the reverse.
/// Both sides derive the same set from the shared DH secret and the two
/// handshake nonces; `PartialEq` exists so tests can assert that.
#[derive(Clone, PartialEq, Eq)]
pub struct KeySet {
    /// AES-256 key for client→server frames.
    pub client_key: [u8; 32],
    /// AES-256 key for server→client frames.
    pub server_key: [u8; 32],
    /// HMAC-SHA256 key for client→server frames.
    pub client_mac_key: [u8; 32],
    /// HMAC-SHA256 key for server→client frames.
    pub server_mac_key: [u8; 32],
    /// Initial CTR block for client→server traffic.
    pub client_iv: [u8; 16],
    /// Initial CTR block for server→client traffic.
    pub server_iv: [u8; 16],
}

impl KeySet {
    /// Derive the full key set from the DH shared secret and both nonces.
    ///
    /// Deterministic: equal inputs on both endpoints yield byte-identical
    /// sets.
    pub fn derive(secret: &[u8], nonce_server: &[u8; 32], nonce_client: &[u8; 32]) -> Self {
        let mut salt = Vec::with_capacity(64);
        salt.extend_from_slice(nonce_server);
        salt.extend_from_slice(nonce_client);

        let mut okm = [0u8; OKM_LEN];
        pbkdf2_hmac::<Sha256>(secret, &salt, KDF_ROUNDS, &mut okm);

        let mut set = Self {
            client_key:     [0u8; 32],
            server_key:     [0u8; 32],
            client_mac_key: [0u8; 32],
            server_mac_key: [0u8; 32],
            client_iv:      [0u8; 16],
            server_iv:      [0u8; 16],
        };
        set.client_key.copy_from_slice(&okm[..32]);
        set.server_key.copy_from_slice(&okm[32..64]);
        set.client_mac_key.copy_from_slice(&okm[64..96]);
        set.server_mac_key.copy_from_slice(&okm[96..128]);
        set.client_iv.copy_from_slice(&okm[128..144]);
        set.server_iv.copy_from_slice(&okm[144..160]);
        set
    }

    /// Derive the handshake-confirmation MAC key (used for the client's
    /// proof over `g_s ‖ g_c` before the full set is trusted).
    pub fn confirm_key(secret: &[u8], nonce_server: &[u8; 32], nonce_client: &[u8; 32]) -> [u8; 32] {
        let mut salt = Vec::with_capacity(64 + 7);
        salt.extend_from_slice(nonce_server);
        salt.extend_from_slice(nonce_client);
        salt.extend_from_slice(b"confirm");

        let mut key = [0u8; 32];
        pbkdf2_hmac::<Sha256>(secret, &salt, KDF_ROUNDS, &mut key);
        key
    }
}

impl std::fmt::Debug for KeySet {
    // Key material stays out of logs.
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "KeySet(..)")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn derivation_is_deterministic() {
        let secret = [7u8; 256];
        let ns = [1u8; 32];
        let nc = [2u8; 32];
        assert_eq!(KeySet::derive(&secret, &ns, &nc), KeySet::derive(&secret, &ns, &nc));
    }

    #[test]
    fn different_nonces_diverge() {
        let secret = [7u8; 256];
        let a = KeySet::derive(&secret, &[1u8; 32], &[2u8; 32]);
        let b = KeySet::derive(&secret, &[1u8; 32], &[3u8; 32]);
        assert!(a != b);
    }

    #[test]
    fn directions_get_distinct_keys() {
        let set = KeySet::derive(&[9u8; 64], &[4u8; 32], &[5u8; 32]);
        assert_ne!(set.client_key, set.server_key);
        assert_ne!(set.client_mac_key, set.server_mac_key);
    }

    #[test]
    fn confirm_key_differs_from_set_material() {
        let secret = [7u8; 256];
        let ns = [1u8; 32];
        let nc = [2u8; 32];
        let set = KeySet::derive(&secret, &ns, &nc);
        let confirm = KeySet::confirm_key(&secret, &ns, &nc);
        assert_ne!(confirm, set.client_key);
        assert_ne!(confirm, set.client_mac_key);
    }
}
