use std::collections::BTreeMap;

use hermod_wire::command::{self, Command};
use hermod_wire::{Deserializable, Message, Serializable};

// ── Primitive round-trips ─────────────────────────────────────────────────────

#[test]
fn roundtrip_u16() {
    for v in [0u16, 1, 13, u16::MAX] {
        let bytes = v.to_bytes();
        assert_eq!(u16::from_bytes(&bytes).unwrap(), v);
    }
}

#[test]
fn roundtrip_u32() {
    for v in [0u32, 1, 1024, u32::MAX] {
        let bytes = v.to_bytes();
        assert_eq!(u32::from_bytes(&bytes).unwrap(), v);
    }
}

// ── String / bytes ────────────────────────────────────────────────────────────

#[test]
fn roundtrip_empty_string() {
    let s = String::new();
    assert_eq!(String::from_bytes(&s.to_bytes()).unwrap(), s);
}

#[test]
fn roundtrip_short_string() {
    let s = "user-3".to_owned();
    let bytes = s.to_bytes();
    assert_eq!(bytes.len() % 4, 0, "must be 4-byte aligned");
    assert_eq!(String::from_bytes(&bytes).unwrap(), s);
}

#[test]
fn roundtrip_long_bytes() {
    // >253 bytes triggers the 4-byte length header path
    let v: Vec<u8> = (0..300).map(|i| i as u8).collect();
    let bytes = v.clone().to_bytes();
    assert_eq!(bytes.len() % 4, 0);
    assert_eq!(Vec::<u8>::from_bytes(&bytes).unwrap(), v);
}

// ── Messages ──────────────────────────────────────────────────────────────────

fn sample_message() -> Message {
    let mut header = BTreeMap::new();
    header.insert("aaa".to_owned(), "hello".to_owned());
    header.insert("aa".to_owned(), "hell".to_owned());
    Message { header, body: vec![0xde, 0xad, 0xbe, 0xef], ..Message::default() }
}

#[test]
fn roundtrip_message() {
    let msg = sample_message();
    let decoded = Message::from_bytes(&msg.to_bytes()).unwrap();
    assert!(decoded.eq_content(&msg));
}

#[test]
fn roundtrip_header_only_message() {
    let mut msg = Message::default();
    msg.header.insert("k".into(), "v".into());
    let decoded = Message::from_bytes(&msg.to_bytes()).unwrap();
    assert!(decoded.eq_content(&msg));
    assert!(decoded.body.is_empty());
}

// ── Commands ──────────────────────────────────────────────────────────────────

#[test]
fn roundtrip_every_opcode_shape() {
    let shapes = vec![
        Command::new(command::CMD_BYE),
        Command::new(command::CMD_AUTHOK),
        Command::with_params(command::CMD_AUTH,
            vec!["svc".into(), "alice".into(), "token".into()]),
        Command::with_params(command::CMD_ACK, vec!["c-1".into()]),
        Command::with_params(command::CMD_SET_VISIBILITY, vec!["0".into()]),
        Command::with_params(command::CMD_MSG_RETRIEVE, vec!["m0011".into()]),
        Command::data(sample_message()),
        Command {
            opcode: command::CMD_DIGEST,
            params: vec!["2048".into(), "m77".into()],
            message: Some(sample_message()),
            ack_id: None,
        },
        Command {
            opcode: command::CMD_FWD_REQ,
            params: vec!["bob".into(), "other-svc".into()],
            message: Some(sample_message()),
            ack_id: Some("c-9".into()),
        },
    ];

    for cmd in shapes {
        let decoded = Command::from_bytes(&cmd.to_bytes()).unwrap();
        assert!(decoded.eq_content(&cmd), "round-trip changed {:?}", cmd.opcode);
        assert_eq!(decoded.ack_id, cmd.ack_id);
    }
}

#[test]
fn eq_content_ignores_transport_metadata() {
    let mut relayed = sample_message();
    relayed.sender = Some("alice".into());
    relayed.sender_service = Some("svc".into());

    let a = Command::data(relayed);
    let b = Command::data(sample_message());
    assert!(a.eq_content(&b));
}

#[test]
fn eq_content_detects_body_change() {
    let a = Command::data(Message::with_body(b"one".to_vec()));
    let b = Command::data(Message::with_body(b"two".to_vec()));
    assert!(!a.eq_content(&b));
}
