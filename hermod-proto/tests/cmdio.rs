use std::sync::Arc;
use std::time::Duration;

use hermod_crypto::KeySet;
use hermod_proto::cmdio::{CmdIoError, CommandIo, Side};
use hermod_wire::command::{self, Command};
use hermod_wire::Message;

fn test_keys() -> KeySet {
    KeySet::derive(&[42u8; 64], &[1u8; 32], &[2u8; 32])
}

fn io_pair() -> (Arc<CommandIo>, Arc<CommandIo>) {
    let keys = test_keys();
    let (client_stream, server_stream) = tokio::io::duplex(64 * 1024);
    let client = Arc::new(CommandIo::new(client_stream, &keys, Side::Client));
    let server = Arc::new(CommandIo::new(server_stream, &keys, Side::Server));
    (client, server)
}

fn sample_command() -> Command {
    let mut msg = Message::with_body(b"a body that deflates: aaaaaaaaaaaaaaaaaaaaaaaa".to_vec());
    msg.header.insert("from".into(), "test".into());
    Command::data(msg)
}

#[tokio::test]
async fn roundtrip_all_flag_combinations() {
    let (client, server) = io_pair();
    let cmd = sample_command();

    for (compress, encrypt) in [(false, false), (true, false), (false, true), (true, true)] {
        client.write_command(&cmd, compress, encrypt).await.unwrap();
        let got = server.read_command().await.unwrap();
        assert!(got.eq_content(&cmd), "compress={compress} encrypt={encrypt}");
    }
}

#[tokio::test]
async fn both_directions_roundtrip_encrypted() {
    let (client, server) = io_pair();

    let ping = Command::with_params(command::CMD_MSG_RETRIEVE, vec!["m1".into()]);
    client.write_command(&ping, false, true).await.unwrap();
    assert!(server.read_command().await.unwrap().eq_content(&ping));

    let pong = Command::data(Message::with_body(b"cached".to_vec()));
    server.write_command(&pong, false, true).await.unwrap();
    assert!(client.read_command().await.unwrap().eq_content(&pong));
}

#[tokio::test]
async fn unknown_opcode_is_returned_as_is() {
    let (client, server) = io_pair();
    let cmd = Command::with_params(4242, vec!["?".into()]);
    client.write_command(&cmd, false, true).await.unwrap();
    let got = server.read_command().await.unwrap();
    assert_eq!(got.opcode, 4242);
}

#[tokio::test]
async fn acked_write_resolves_when_peer_reads() {
    let (client, server) = io_pair();

    // The peer's read loop answers NEEDACK frames before returning the
    // command; our own read loop consumes the ACK and resolves the wait.
    let peer = tokio::spawn(async move {
        let cmd = server.read_command().await.unwrap();
        assert!(cmd.ack_id.is_some());
        server
    });
    let ack_pump = client.clone();
    tokio::spawn(async move {
        let _ = ack_pump.read_command().await;
    });

    client
        .write_command_acked(sample_command(), false, true, Duration::from_secs(5))
        .await
        .unwrap();

    let _server = peer.await.unwrap();
}

#[tokio::test]
async fn acked_write_times_out_without_reader() {
    let (client, _server) = io_pair();
    let err = client
        .write_command_acked(sample_command(), false, false, Duration::from_millis(50))
        .await
        .unwrap_err();
    assert!(matches!(err, CmdIoError::AckTimeout));
}

#[tokio::test]
async fn tampered_ciphertext_is_fatal() {
    use hermod_proto::frame;

    let keys = test_keys();
    let (client_stream, mut raw_server) = tokio::io::duplex(64 * 1024);
    let client = CommandIo::new(client_stream, &keys, Side::Client);

    client.write_command(&sample_command(), false, true).await.unwrap();

    // Corrupt the sealed payload and feed it back through a fresh reader.
    let (flags, mut payload) =
        frame::read_frame(&mut raw_server, frame::DEFAULT_FRAME_CEILING).await.unwrap();
    payload[0] ^= 0xff;

    let (mut attacker, victim_stream) = tokio::io::duplex(64 * 1024);
    let victim = CommandIo::new(victim_stream, &keys, Side::Server);
    frame::write_frame(&mut attacker, flags, &payload, frame::DEFAULT_FRAME_CEILING)
        .await
        .unwrap();

    let err = victim.read_command().await.unwrap_err();
    assert!(matches!(err, CmdIoError::Crypto(_)));
}
