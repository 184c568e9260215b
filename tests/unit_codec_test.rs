// tests/unit_codec_test.rs

//! Wire codec behavior: framing, fault classification, and passthrough.

use bytes::{BufMut, Bytes, BytesMut};
use llrpd::core::DecodeError;
use llrpd::core::protocol::{
    ConnectionAttemptStatus, Inbound, LlrpCodec, LlrpMessage, LlrpStatus, MessageBody,
    ProtocolVersion, ReaderEvent, StatusCode, Timestamp,
};
use tokio_util::codec::{Decoder, Encoder};

fn encode(message: LlrpMessage) -> BytesMut {
    let mut buf = BytesMut::new();
    LlrpCodec.encode(message, &mut buf).unwrap();
    buf
}

fn decode_one(buf: &mut BytesMut) -> Inbound {
    LlrpCodec
        .decode(buf)
        .unwrap()
        .expect("a complete frame was buffered")
}

/// Builds a raw frame with full control over the header fields.
fn raw_frame(version: u8, msg_type: u16, message_id: u32, body: &[u8]) -> BytesMut {
    let mut buf = BytesMut::new();
    buf.put_u16((u16::from(version) << 10) | (msg_type & 0x03FF));
    buf.put_u32((10 + body.len()) as u32);
    buf.put_u32(message_id);
    buf.extend_from_slice(body);
    buf
}

#[tokio::test]
async fn test_connection_attempt_notification_round_trip() {
    let message = LlrpMessage::new(
        ProtocolVersion::V1_0_1,
        17,
        MessageBody::ReaderEventNotification {
            timestamp: Timestamp::Utc(1_700_000_000_000_000),
            event: ReaderEvent::ConnectionAttempt(
                ConnectionAttemptStatus::FailedClientConnectionExists,
            ),
        },
    );
    let mut buf = encode(message.clone());
    assert_eq!(decode_one(&mut buf), Inbound::Message(message));
    assert!(buf.is_empty());
}

#[tokio::test]
async fn test_error_message_round_trip_preserves_description() {
    let message = LlrpMessage::new(
        ProtocolVersion::V1_1,
        42,
        MessageBody::ErrorMessage {
            status: LlrpStatus::new(
                StatusCode::MUnsupportedVersion,
                "unsupported protocol version 7 in message 42",
            ),
        },
    );
    let mut buf = encode(message.clone());
    assert_eq!(decode_one(&mut buf), Inbound::Message(message));
}

#[tokio::test]
async fn test_uptime_timestamp_is_distinguished_from_utc() {
    let message = LlrpMessage::new(
        ProtocolVersion::V1_0_1,
        3,
        MessageBody::ReaderEventNotification {
            timestamp: Timestamp::Uptime(123_456),
            event: ReaderEvent::ConnectionClose,
        },
    );
    let mut buf = encode(message.clone());
    match decode_one(&mut buf) {
        Inbound::Message(decoded) => match decoded.body {
            MessageBody::ReaderEventNotification { timestamp, .. } => {
                assert_eq!(timestamp, Timestamp::Uptime(123_456));
            }
            other => panic!("unexpected body {other:?}"),
        },
        other => panic!("unexpected item {other:?}"),
    }
}

#[tokio::test]
async fn test_unsupported_version_is_classified() {
    let mut buf = raw_frame(7, 62, 9, &[]);
    assert_eq!(
        decode_one(&mut buf),
        Inbound::Malformed(DecodeError::UnsupportedVersion {
            version: 7,
            message_id: 9,
        })
    );
}

#[tokio::test]
async fn test_unknown_message_type_is_classified() {
    let mut buf = raw_frame(1, 500, 10, &[]);
    assert_eq!(
        decode_one(&mut buf),
        Inbound::Malformed(DecodeError::UnsupportedMessageType {
            msg_type: 500,
            message_id: 10,
        })
    );
}

#[tokio::test]
async fn test_trailing_bytes_in_keepalive_are_a_parameter_error() {
    let mut buf = raw_frame(1, 62, 11, b"\x00");
    match decode_one(&mut buf) {
        Inbound::Malformed(DecodeError::ParameterError {
            msg_type: 62,
            message_id: 11,
            ..
        }) => {}
        other => panic!("unexpected item {other:?}"),
    }
}

#[tokio::test]
async fn test_truncated_status_parameter_is_a_parameter_error() {
    // ERROR_MESSAGE whose LLRPStatus parameter declares more bytes than
    // the frame carries.
    let mut body = BytesMut::new();
    body.put_u16(287);
    body.put_u16(12); // declares 12, frame only has 4
    let mut buf = raw_frame(1, 100, 12, &body);
    match decode_one(&mut buf) {
        Inbound::Malformed(DecodeError::ParameterError { msg_type: 100, .. }) => {}
        other => panic!("unexpected item {other:?}"),
    }
}

#[tokio::test]
async fn test_partial_frame_waits_for_more_data() {
    let full = encode(LlrpMessage::new(
        ProtocolVersion::V1_0_1,
        5,
        MessageBody::Keepalive,
    ));
    let mut buf = BytesMut::from(&full[..6]);
    assert!(LlrpCodec.decode(&mut buf).unwrap().is_none());

    buf.extend_from_slice(&full[6..]);
    match decode_one(&mut buf) {
        Inbound::Message(m) => assert_eq!(m.body, MessageBody::Keepalive),
        other => panic!("unexpected item {other:?}"),
    }
}

#[tokio::test]
async fn test_unusable_length_field_is_fatal() {
    let mut buf = BytesMut::new();
    buf.put_u16(1 << 10 | 62);
    buf.put_u32(4); // below the header size: the frame boundary is lost
    buf.put_u32(1);
    assert!(LlrpCodec.decode(&mut buf).is_err());
}

#[tokio::test]
async fn test_unmodeled_message_passes_through_opaquely() {
    let payload = Bytes::from_static(b"\x01\x02\x03\x04");
    let message = LlrpMessage::new(
        ProtocolVersion::V1_1,
        88,
        MessageBody::Other {
            msg_type: 20, // ADD_ROSPEC
            payload: payload.clone(),
        },
    );
    let mut buf = encode(message);
    match decode_one(&mut buf) {
        Inbound::Message(decoded) => {
            assert_eq!(decoded.message_id, 88);
            assert_eq!(decoded.version, ProtocolVersion::V1_1);
            assert_eq!(
                decoded.body,
                MessageBody::Other {
                    msg_type: 20,
                    payload,
                }
            );
        }
        other => panic!("unexpected item {other:?}"),
    }
}

#[tokio::test]
async fn test_version_negotiation_messages_round_trip() {
    let request = LlrpMessage::new(
        ProtocolVersion::V1_1,
        1,
        MessageBody::SetProtocolVersion {
            version: ProtocolVersion::V1_1,
        },
    );
    let mut buf = encode(request.clone());
    assert_eq!(decode_one(&mut buf), Inbound::Message(request));

    let response = LlrpMessage::new(
        ProtocolVersion::V1_0_1,
        2,
        MessageBody::GetSupportedVersionResponse {
            current: ProtocolVersion::V1_0_1,
            supported: ProtocolVersion::V1_1,
            status: LlrpStatus::success(),
        },
    );
    let mut buf = encode(response.clone());
    assert_eq!(decode_one(&mut buf), Inbound::Message(response));
}

#[tokio::test]
async fn test_two_frames_in_one_buffer_decode_sequentially() {
    let mut buf = encode(LlrpMessage::new(
        ProtocolVersion::V1_0_1,
        1,
        MessageBody::Keepalive,
    ));
    buf.extend_from_slice(&encode(LlrpMessage::new(
        ProtocolVersion::V1_0_1,
        2,
        MessageBody::KeepaliveAck,
    )));

    match decode_one(&mut buf) {
        Inbound::Message(m) => assert_eq!(m.message_id, 1),
        other => panic!("unexpected item {other:?}"),
    }
    match decode_one(&mut buf) {
        Inbound::Message(m) => assert_eq!(m.message_id, 2),
        other => panic!("unexpected item {other:?}"),
    }
    assert!(buf.is_empty());
}
