// src/core/protocol/codec.rs

//! Implements the LLRP binary framing and the corresponding `Encoder` and
//! `Decoder` for network communication.
//!
//! A frame is a 10-byte header (3 reserved bits, 3 version bits, 10 type
//! bits, a u32 total length, a u32 message id) followed by the message body.
//! Decoding never fails the stream for a malformed frame whose length field
//! is sound: such frames are consumed whole and surfaced as
//! [`Inbound::Malformed`] so the session can answer with an error reply and
//! keep the connection open. Only an unusable length field, which loses the
//! frame boundary, is a fatal stream error.

use crate::core::errors::{DecodeError, LlrpError};
use crate::core::protocol::messages::{is_known_message_type, type_codes};
use crate::core::protocol::{
    ConnectionAttemptStatus, LlrpMessage, LlrpStatus, MessageBody, ProtocolVersion, ReaderEvent,
    StatusCode, Timestamp,
};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

/// The fixed LLRP frame header size in bytes.
pub const HEADER_LEN: usize = 10;

// Frames larger than this are treated as a framing breakdown.
const MAX_FRAME_LEN: usize = 4 * 1024 * 1024;

// TLV parameter type codes.
const PARAM_UTC_TIMESTAMP: u16 = 128;
const PARAM_UPTIME: u16 = 129;
const PARAM_READER_EVENT_NOTIFICATION_DATA: u16 = 246;
const PARAM_CONNECTION_ATTEMPT_EVENT: u16 = 256;
const PARAM_CONNECTION_CLOSE_EVENT: u16 = 257;
const PARAM_LLRP_STATUS: u16 = 287;

const TLV_HEADER_LEN: usize = 4;

/// One decoded item from the wire: either a well-formed message or a
/// classified decode fault for a frame that was consumed but not understood.
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    Message(LlrpMessage),
    Malformed(DecodeError),
}

/// A `tokio_util::codec` implementation for LLRP frames.
#[derive(Debug, Default)]
pub struct LlrpCodec;

impl Encoder<LlrpMessage> for LlrpCodec {
    type Error = LlrpError;

    fn encode(&mut self, item: LlrpMessage, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let body = encode_body(&item.body);
        let total = HEADER_LEN + body.len();
        if total > MAX_FRAME_LEN {
            return Err(LlrpError::Internal(format!(
                "outgoing frame of {total} bytes exceeds the frame size limit"
            )));
        }

        dst.reserve(total);
        let hdr = (u16::from(item.version.as_u8()) << 10) | (item.msg_type() & 0x03FF);
        dst.put_u16(hdr);
        dst.put_u32(total as u32);
        dst.put_u32(item.message_id);
        dst.extend_from_slice(&body);
        Ok(())
    }
}

impl Decoder for LlrpCodec {
    type Item = Inbound;
    type Error = LlrpError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() < HEADER_LEN {
            return Ok(None);
        }

        let hdr = u16::from_be_bytes([src[0], src[1]]);
        let total = u32::from_be_bytes([src[2], src[3], src[4], src[5]]) as usize;

        // A length field below the header size or above the cap means the
        // frame boundary is lost; the stream cannot be resynchronized.
        if total < HEADER_LEN || total > MAX_FRAME_LEN {
            return Err(LlrpError::Transport(format!(
                "unusable frame length field {total}"
            )));
        }
        if src.len() < total {
            src.reserve(total - src.len());
            return Ok(None);
        }

        let mut frame = src.split_to(total);
        frame.advance(2 + 4);
        let message_id = frame.get_u32();
        let raw_version = ((hdr >> 10) & 0x07) as u8;
        let msg_type = hdr & 0x03FF;
        let body = frame.freeze();

        let Some(version) = ProtocolVersion::from_u8(raw_version) else {
            return Ok(Some(Inbound::Malformed(DecodeError::UnsupportedVersion {
                version: raw_version,
                message_id,
            })));
        };

        if !is_known_message_type(msg_type) {
            return Ok(Some(Inbound::Malformed(
                DecodeError::UnsupportedMessageType {
                    msg_type,
                    message_id,
                },
            )));
        }

        match decode_body(msg_type, &body) {
            Ok(decoded) => Ok(Some(Inbound::Message(LlrpMessage::new(
                version, message_id, decoded,
            )))),
            Err(detail) => Ok(Some(Inbound::Malformed(DecodeError::ParameterError {
                msg_type,
                message_id,
                detail,
            }))),
        }
    }
}

// --- Body encoding ---

fn encode_body(body: &MessageBody) -> BytesMut {
    let mut buf = BytesMut::new();
    match body {
        MessageBody::Keepalive
        | MessageBody::KeepaliveAck
        | MessageBody::CloseConnection
        | MessageBody::GetSupportedVersion => {}
        MessageBody::CloseConnectionResponse { status }
        | MessageBody::ErrorMessage { status }
        | MessageBody::SetProtocolVersionResponse { status } => {
            encode_llrp_status(status, &mut buf);
        }
        MessageBody::ReaderEventNotification { timestamp, event } => {
            let mut data = BytesMut::new();
            encode_timestamp(timestamp, &mut data);
            encode_reader_event(event, &mut data);
            encode_tlv(PARAM_READER_EVENT_NOTIFICATION_DATA, &data, &mut buf);
        }
        MessageBody::GetSupportedVersionResponse {
            current,
            supported,
            status,
        } => {
            buf.put_u8(current.as_u8());
            buf.put_u8(supported.as_u8());
            encode_llrp_status(status, &mut buf);
        }
        MessageBody::SetProtocolVersion { version } => {
            buf.put_u8(version.as_u8());
        }
        MessageBody::Other { payload, .. } => {
            buf.extend_from_slice(payload);
        }
    }
    buf
}

fn encode_tlv(param_type: u16, contents: &[u8], dst: &mut BytesMut) {
    dst.put_u16(param_type & 0x03FF);
    dst.put_u16((TLV_HEADER_LEN + contents.len()) as u16);
    dst.extend_from_slice(contents);
}

fn encode_timestamp(ts: &Timestamp, dst: &mut BytesMut) {
    let (param_type, micros) = match ts {
        Timestamp::Utc(v) => (PARAM_UTC_TIMESTAMP, *v),
        Timestamp::Uptime(v) => (PARAM_UPTIME, *v),
    };
    let mut contents = BytesMut::with_capacity(8);
    contents.put_u64(micros);
    encode_tlv(param_type, &contents, dst);
}

fn encode_reader_event(event: &ReaderEvent, dst: &mut BytesMut) {
    match event {
        ReaderEvent::ConnectionAttempt(status) => {
            let mut contents = BytesMut::with_capacity(2);
            contents.put_u16(status.as_u16());
            encode_tlv(PARAM_CONNECTION_ATTEMPT_EVENT, &contents, dst);
        }
        ReaderEvent::ConnectionClose => {
            encode_tlv(PARAM_CONNECTION_CLOSE_EVENT, &[], dst);
        }
    }
}

fn encode_llrp_status(status: &LlrpStatus, dst: &mut BytesMut) {
    let desc = status.description.as_bytes();
    let mut contents = BytesMut::with_capacity(4 + desc.len());
    contents.put_u16(status.code.as_u16());
    contents.put_u16(desc.len() as u16);
    contents.extend_from_slice(desc);
    encode_tlv(PARAM_LLRP_STATUS, &contents, dst);
}

// --- Body decoding ---

fn decode_body(msg_type: u16, body: &Bytes) -> Result<MessageBody, String> {
    match msg_type {
        type_codes::KEEPALIVE => expect_empty(body, MessageBody::Keepalive),
        type_codes::KEEPALIVE_ACK => expect_empty(body, MessageBody::KeepaliveAck),
        type_codes::CLOSE_CONNECTION => expect_empty(body, MessageBody::CloseConnection),
        type_codes::GET_SUPPORTED_VERSION => expect_empty(body, MessageBody::GetSupportedVersion),
        type_codes::CLOSE_CONNECTION_RESPONSE => {
            let (status, rest) = decode_llrp_status(body)?;
            expect_consumed(rest)?;
            Ok(MessageBody::CloseConnectionResponse { status })
        }
        type_codes::ERROR_MESSAGE => {
            let (status, rest) = decode_llrp_status(body)?;
            expect_consumed(rest)?;
            Ok(MessageBody::ErrorMessage { status })
        }
        type_codes::SET_PROTOCOL_VERSION_RESPONSE => {
            let (status, rest) = decode_llrp_status(body)?;
            expect_consumed(rest)?;
            Ok(MessageBody::SetProtocolVersionResponse { status })
        }
        type_codes::SET_PROTOCOL_VERSION => {
            if body.len() != 1 {
                return Err(format!(
                    "SET_PROTOCOL_VERSION body must be 1 byte, got {}",
                    body.len()
                ));
            }
            let version = ProtocolVersion::from_u8(body[0])
                .ok_or_else(|| format!("requested protocol version {} is unknown", body[0]))?;
            Ok(MessageBody::SetProtocolVersion { version })
        }
        type_codes::GET_SUPPORTED_VERSION_RESPONSE => {
            if body.len() < 2 {
                return Err("GET_SUPPORTED_VERSION_RESPONSE body is truncated".to_string());
            }
            let current = ProtocolVersion::from_u8(body[0])
                .ok_or_else(|| format!("current version {} is unknown", body[0]))?;
            let supported = ProtocolVersion::from_u8(body[1])
                .ok_or_else(|| format!("supported version {} is unknown", body[1]))?;
            let (status, rest) = decode_llrp_status(&body.slice(2..))?;
            expect_consumed(rest)?;
            Ok(MessageBody::GetSupportedVersionResponse {
                current,
                supported,
                status,
            })
        }
        type_codes::READER_EVENT_NOTIFICATION => {
            let (param_type, contents, rest) = decode_tlv(body)?;
            expect_consumed(rest)?;
            if param_type != PARAM_READER_EVENT_NOTIFICATION_DATA {
                return Err(format!(
                    "expected ReaderEventNotificationData parameter, got type {param_type}"
                ));
            }
            decode_notification_data(&contents)
        }
        other => Ok(MessageBody::Other {
            msg_type: other,
            payload: body.clone(),
        }),
    }
}

fn decode_notification_data(contents: &Bytes) -> Result<MessageBody, String> {
    let (ts_type, ts_contents, rest) = decode_tlv(contents)?;
    if ts_contents.len() != 8 {
        return Err(format!(
            "timestamp parameter must be 8 bytes, got {}",
            ts_contents.len()
        ));
    }
    let micros = u64::from_be_bytes(
        ts_contents[..8]
            .try_into()
            .map_err(|_| "timestamp parameter is truncated".to_string())?,
    );
    let timestamp = match ts_type {
        PARAM_UTC_TIMESTAMP => Timestamp::Utc(micros),
        PARAM_UPTIME => Timestamp::Uptime(micros),
        other => return Err(format!("expected a timestamp parameter, got type {other}")),
    };

    let (ev_type, ev_contents, rest) = decode_tlv(&rest)?;
    expect_consumed(rest)?;
    let event = match ev_type {
        PARAM_CONNECTION_ATTEMPT_EVENT => {
            if ev_contents.len() != 2 {
                return Err("ConnectionAttemptEvent parameter must be 2 bytes".to_string());
            }
            let raw = u16::from_be_bytes([ev_contents[0], ev_contents[1]]);
            let status = ConnectionAttemptStatus::from_u16(raw)
                .ok_or_else(|| format!("unknown connection attempt status {raw}"))?;
            ReaderEvent::ConnectionAttempt(status)
        }
        PARAM_CONNECTION_CLOSE_EVENT => {
            if !ev_contents.is_empty() {
                return Err("ConnectionCloseEvent parameter must be empty".to_string());
            }
            ReaderEvent::ConnectionClose
        }
        other => return Err(format!("unrecognized reader event parameter type {other}")),
    };

    Ok(MessageBody::ReaderEventNotification { timestamp, event })
}

/// Splits one TLV parameter off the front of `buf`, returning its type, its
/// contents, and the remainder of the buffer.
fn decode_tlv(buf: &Bytes) -> Result<(u16, Bytes, Bytes), String> {
    if buf.len() < TLV_HEADER_LEN {
        return Err("parameter header is truncated".to_string());
    }
    let param_type = u16::from_be_bytes([buf[0], buf[1]]) & 0x03FF;
    let param_len = u16::from_be_bytes([buf[2], buf[3]]) as usize;
    if param_len < TLV_HEADER_LEN || param_len > buf.len() {
        return Err(format!(
            "parameter of type {param_type} declares length {param_len} but {} bytes remain",
            buf.len()
        ));
    }
    let contents = buf.slice(TLV_HEADER_LEN..param_len);
    let rest = buf.slice(param_len..);
    Ok((param_type, contents, rest))
}

fn decode_llrp_status(buf: &Bytes) -> Result<(LlrpStatus, Bytes), String> {
    let (param_type, contents, rest) = decode_tlv(buf)?;
    if param_type != PARAM_LLRP_STATUS {
        return Err(format!(
            "expected LLRPStatus parameter, got type {param_type}"
        ));
    }
    if contents.len() < 4 {
        return Err("LLRPStatus parameter is truncated".to_string());
    }
    let raw_code = u16::from_be_bytes([contents[0], contents[1]]);
    let code = StatusCode::from_u16(raw_code)
        .ok_or_else(|| format!("unknown status code {raw_code}"))?;
    let desc_len = u16::from_be_bytes([contents[2], contents[3]]) as usize;
    if contents.len() < 4 + desc_len {
        return Err("LLRPStatus description is truncated".to_string());
    }
    let description = String::from_utf8(contents.slice(4..4 + desc_len).to_vec())
        .map_err(|_| "LLRPStatus description is not valid UTF-8".to_string())?;
    Ok((LlrpStatus { code, description }, rest))
}

fn expect_empty(body: &Bytes, decoded: MessageBody) -> Result<MessageBody, String> {
    if body.is_empty() {
        Ok(decoded)
    } else {
        Err(format!("unexpected {} trailing bytes", body.len()))
    }
}

fn expect_consumed(rest: Bytes) -> Result<(), String> {
    if rest.is_empty() {
        Ok(())
    } else {
        Err(format!("unexpected {} trailing bytes", rest.len()))
    }
}
