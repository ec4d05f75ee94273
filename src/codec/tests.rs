//! MQTT v5.0 codec tests

#![allow(clippy::field_reassign_with_default)]

use bytes::{Bytes, BytesMut};
use pretty_assertions::assert_eq;

use crate::codec::{read_variable_int, write_variable_int, Decoder, Encoder};
use crate::protocol::{
    ConnAck, Connect, DecodeError, Disconnect, Packet, Properties, PubAck, Publish, QoS,
    ReasonCode, SubAck, Subscribe, Subscription, SubscriptionOptions, UnsubAck,
};

fn encode_packet(packet: &Packet) -> BytesMut {
    let mut buf = BytesMut::new();
    Encoder::new().encode(packet, &mut buf).unwrap();
    buf
}

fn decode_packet(buf: &[u8]) -> Result<Packet, DecodeError> {
    match Decoder::new().decode(buf)? {
        Some((packet, _)) => Ok(packet),
        None => Err(DecodeError::InsufficientData),
    }
}

// ============================================================================
// Primitives
// ============================================================================

#[test]
fn test_variable_int_boundaries() {
    for (value, expected_len) in [(0u32, 1usize), (127, 1), (128, 2), (16_383, 2), (16_384, 3)] {
        let mut buf = BytesMut::new();
        let written = write_variable_int(&mut buf, value).unwrap();
        assert_eq!(written, expected_len);
        assert_eq!(read_variable_int(&buf).unwrap(), (value, expected_len));
    }
}

#[test]
fn test_variable_int_too_long() {
    let buf = [0xFF, 0xFF, 0xFF, 0xFF, 0x01];
    assert_eq!(
        read_variable_int(&buf),
        Err(DecodeError::InvalidRemainingLength)
    );
}

// ============================================================================
// CONNECT / CONNACK
// ============================================================================

#[test]
fn test_connect_with_credentials_and_vpn() {
    let mut properties = Properties::default();
    properties.session_expiry_interval = Some(0);
    properties
        .user_properties
        .push(("vpn".to_string(), "tms".to_string()));

    let packet = Packet::Connect(Box::new(Connect {
        client_id: "railbus-test".to_string(),
        clean_start: true,
        keep_alive: 30,
        username: Some("operator".to_string()),
        password: Some(Bytes::from_static(b"secret")),
        properties,
    }));

    let encoded = encode_packet(&packet);
    assert_eq!(encoded[0], 0x10);
    let decoded = decode_packet(&encoded).unwrap();
    assert_eq!(packet, decoded);

    if let Packet::Connect(connect) = decoded {
        assert_eq!(connect.properties.user_property("vpn"), Some("tms"));
    }
}

#[test]
fn test_connack_skips_unmodelled_properties() {
    // CONNACK with Topic Alias Maximum, Wildcard Subscription Available and
    // Server Keep Alive; only the keep alive is retained
    let buf = [
        0x20, 0x0B, 0x00, 0x00, 0x08, 0x22, 0x00, 0x0A, 0x28, 0x01, 0x13, 0x00, 0x1E,
    ];
    let packet = decode_packet(&buf).unwrap();
    match packet {
        Packet::ConnAck(ack) => {
            assert_eq!(ack.reason_code, ReasonCode::Success);
            assert!(!ack.session_present);
            assert_eq!(ack.properties.server_keep_alive, Some(30));
        }
        other => panic!("expected CONNACK, got {:?}", other),
    }
}

#[test]
fn test_connack_rejection_reason() {
    let mut properties = Properties::default();
    properties.reason_string = Some("bad credentials".to_string());
    let packet = Packet::ConnAck(ConnAck {
        session_present: false,
        reason_code: ReasonCode::BadUserNameOrPassword,
        properties,
    });

    let decoded = decode_packet(&encode_packet(&packet)).unwrap();
    assert_eq!(packet, decoded);
}

#[test]
fn test_connack_unknown_property_rejected() {
    let buf = [0x20, 0x05, 0x00, 0x00, 0x02, 0x7F, 0x00];
    assert_eq!(decode_packet(&buf), Err(DecodeError::InvalidPropertyId(0x7F)));
}

// ============================================================================
// PUBLISH / PUBACK
// ============================================================================

#[test]
fn test_publish_carries_content_type_and_correlation() {
    let mut properties = Properties::default();
    properties.content_type = Some("application/json".to_string());
    properties.correlation_data = Some(Bytes::from_static(b"req-42"));

    let packet = Packet::Publish(Publish {
        topic: "tms/train/departed/origin/12345".to_string(),
        payload: Bytes::from_static(br#"{"id":12345}"#),
        properties,
        ..Default::default()
    });

    let decoded = decode_packet(&encode_packet(&packet)).unwrap();
    assert_eq!(packet, decoded);
}

#[test]
fn test_publish_qos1_packet_id() {
    let packet = Packet::Publish(Publish {
        qos: QoS::AtLeastOnce,
        topic: "tms/alerts".to_string(),
        packet_id: Some(7),
        payload: Bytes::from_static(b"late"),
        ..Default::default()
    });

    let decoded = decode_packet(&encode_packet(&packet)).unwrap();
    assert_eq!(packet, decoded);
}

#[test]
fn test_publish_rejects_wildcard_topic() {
    let packet = Packet::Publish(Publish {
        topic: "tms/#".to_string(),
        ..Default::default()
    });
    assert!(matches!(
        decode_packet(&encode_packet(&packet)),
        Err(DecodeError::MalformedPacket(_))
    ));
}

#[test]
fn test_puback_short_form() {
    let encoded = encode_packet(&Packet::PubAck(PubAck::new(9)));
    assert_eq!(&encoded[..], &[0x40, 0x02, 0x00, 0x09]);
    assert_eq!(
        decode_packet(&encoded).unwrap(),
        Packet::PubAck(PubAck::new(9))
    );
}

// ============================================================================
// SUBSCRIBE / SUBACK / UNSUBACK
// ============================================================================

#[test]
fn test_subscribe_options_byte() {
    let packet = Packet::Subscribe(Subscribe {
        packet_id: 3,
        subscriptions: vec![Subscription {
            filter: "tms/train/#".to_string(),
            options: SubscriptionOptions {
                qos: QoS::AtMostOnce,
                no_local: true,
            },
        }],
        properties: Properties::default(),
    });

    let encoded = encode_packet(&packet);
    assert_eq!(encoded[0], 0x82);
    assert_eq!(*encoded.last().unwrap(), 0x04);
    assert_eq!(decode_packet(&encoded).unwrap(), packet);
}

#[test]
fn test_suback_with_failure_code() {
    let packet = Packet::SubAck(SubAck {
        packet_id: 3,
        reason_codes: vec![ReasonCode::Success, ReasonCode::TopicFilterInvalid],
        properties: Properties::default(),
    });

    match decode_packet(&encode_packet(&packet)).unwrap() {
        Packet::SubAck(ack) => {
            assert!(!ack.reason_codes[0].is_error());
            assert!(ack.reason_codes[1].is_error());
        }
        other => panic!("expected SUBACK, got {:?}", other),
    }
}

#[test]
fn test_unsuback_roundtrip() {
    let packet = Packet::UnsubAck(UnsubAck {
        packet_id: 4,
        reason_codes: vec![ReasonCode::NoSubscriptionExisted],
        properties: Properties::default(),
    });
    assert_eq!(decode_packet(&encode_packet(&packet)).unwrap(), packet);
}

// ============================================================================
// DISCONNECT / PING / framing
// ============================================================================

#[test]
fn test_disconnect_normal_is_two_bytes() {
    let encoded = encode_packet(&Packet::Disconnect(Disconnect::default()));
    assert_eq!(&encoded[..], &[0xE0, 0x00]);
}

#[test]
fn test_disconnect_with_reason() {
    let packet = Packet::Disconnect(Disconnect {
        reason_code: ReasonCode::ServerShuttingDown,
        properties: Properties::default(),
    });
    assert_eq!(decode_packet(&encode_packet(&packet)).unwrap(), packet);
}

#[test]
fn test_partial_packet_returns_none() {
    let encoded = encode_packet(&Packet::Publish(Publish {
        topic: "tms/train".to_string(),
        payload: Bytes::from_static(b"hello"),
        ..Default::default()
    }));

    let decoder = Decoder::new();
    assert!(decoder.decode(&encoded[..encoded.len() - 1]).unwrap().is_none());
    let (_, consumed) = decoder.decode(&encoded).unwrap().unwrap();
    assert_eq!(consumed, encoded.len());
}

#[test]
fn test_two_packets_in_one_buffer() {
    let mut buf = encode_packet(&Packet::PingResp);
    buf.extend_from_slice(&encode_packet(&Packet::PingReq));

    let decoder = Decoder::new();
    let (first, used) = decoder.decode(&buf).unwrap().unwrap();
    assert_eq!(first, Packet::PingResp);
    let (second, _) = decoder.decode(&buf[used..]).unwrap().unwrap();
    assert_eq!(second, Packet::PingReq);
}

#[test]
fn test_packet_size_limit() {
    let encoded = encode_packet(&Packet::Publish(Publish {
        topic: "t".to_string(),
        payload: Bytes::from(vec![0u8; 64]),
        ..Default::default()
    }));
    let decoder = Decoder::new().with_max_packet_size(16);
    assert_eq!(decoder.decode(&encoded), Err(DecodeError::PacketTooLarge));
}
