use std::sync::OnceLock;

use rsa::{RsaPrivateKey, RsaPublicKey};

use hermod_proto::keyex::{self, KeyExchangeError};

fn server_key() -> &'static RsaPrivateKey {
    static KEY: OnceLock<RsaPrivateKey> = OnceLock::new();
    KEY.get_or_init(|| RsaPrivateKey::new(&mut rand::thread_rng(), 2048).unwrap())
}

fn other_key() -> &'static RsaPrivateKey {
    static KEY: OnceLock<RsaPrivateKey> = OnceLock::new();
    KEY.get_or_init(|| RsaPrivateKey::new(&mut rand::thread_rng(), 2048).unwrap())
}

#[tokio::test]
async fn exchange_yields_identical_key_sets() {
    let privkey = server_key().clone();
    let pubkey = privkey.to_public_key();

    let (mut server_stream, mut client_stream) = tokio::io::duplex(16 * 1024);

    let server = tokio::spawn(async move {
        keyex::server_key_exchange(&privkey, &mut server_stream).await
    });
    let client = tokio::spawn(async move {
        keyex::client_key_exchange(&pubkey, &mut client_stream).await
    });

    let server_keys = server.await.unwrap().expect("server side");
    let client_keys = client.await.unwrap().expect("client side");
    assert!(server_keys == client_keys, "key sets must be byte-identical");
}

#[tokio::test]
async fn mismatched_pinned_key_fails_both_sides() {
    let privkey = server_key().clone();
    let wrong_pub: RsaPublicKey = other_key().to_public_key();

    let (mut server_stream, mut client_stream) = tokio::io::duplex(16 * 1024);

    let server = tokio::spawn(async move {
        keyex::server_key_exchange(&privkey, &mut server_stream).await
    });
    let client = tokio::spawn(async move {
        let result = keyex::client_key_exchange(&wrong_pub, &mut client_stream).await;
        // Client closes on verification failure.
        drop(client_stream);
        result
    });

    let client_err = client.await.unwrap().unwrap_err();
    assert!(matches!(client_err, KeyExchangeError::Signature), "got {client_err}");

    let server_err = server.await.unwrap().unwrap_err();
    assert!(matches!(server_err, KeyExchangeError::Frame(_)), "got {server_err}");
}

#[tokio::test]
async fn version_mismatch_is_fatal() {
    use tokio::io::AsyncWriteExt;

    let privkey = server_key().clone();
    let (mut server_stream, mut client_stream) = tokio::io::duplex(1024);

    let server = tokio::spawn(async move {
        keyex::server_key_exchange(&privkey, &mut server_stream).await
    });

    // Impersonate a client speaking a future protocol version.
    let client = tokio::spawn(async move {
        use tokio::io::AsyncReadExt;
        let mut version = [0u8; 1];
        client_stream.read_exact(&mut version).await.unwrap();
        client_stream.write_all(&[9]).await.unwrap();
        client_stream
    });

    let err = server.await.unwrap().unwrap_err();
    assert!(matches!(err, KeyExchangeError::Version { got: 9 }));
    drop(client.await.unwrap());
}
