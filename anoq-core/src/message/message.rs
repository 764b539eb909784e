//! Transport-level messages: everything that crosses a TCP connection.

use std::hash::{Hash, Hasher};

use anyhow::{anyhow, Context};

use crate::{
    message::{
        body::OverlayMessage, ByteReader, DecodeError, FromBytes, MessageBodyType, ToBytes,
    },
    NodeId, Opcode, Record, UTILITY_NODE_ID,
};

/// The number of bytes in the frame size header.
pub const FRAME_SIZE_HEADER_LEN: usize = 8;

/// The 16-bit tag in front of every serialised transport message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum MessageType {
    /// An [`OverlayTransportMessage`]; plain overlay messages are always
    /// wrapped before they are sent.
    Overlay = 0,
    Ping = 1,
    Aggregation = 2,
    QueryRequest = 3,
    SignatureRequest = 4,
    SignatureResponse = 5,
}

impl MessageType {
    fn try_from_tag(tag: u16) -> Result<Self, DecodeError> {
        match tag {
            0 => Ok(Self::Overlay),
            1 => Ok(Self::Ping),
            2 => Ok(Self::Aggregation),
            3 => Ok(Self::QueryRequest),
            4 => Ok(Self::SignatureRequest),
            5 => Ok(Self::SignatureResponse),
            other => Err(anyhow!("unknown message type {}", other)),
        }
    }
}

/// A transport message, tagged by [`MessageType`] on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message<R> {
    Overlay(OverlayTransportMessage<R>),
    Ping(PingMessage),
    Aggregation(AggregationMessage<R>),
    QueryRequest(QueryRequest),
    SignatureRequest(SignatureRequest),
    SignatureResponse(SignatureResponse),
}

impl<R> Message<R> {
    pub fn message_type(&self) -> MessageType {
        match self {
            Message::Overlay(_) => MessageType::Overlay,
            Message::Ping(_) => MessageType::Ping,
            Message::Aggregation(_) => MessageType::Aggregation,
            Message::QueryRequest(_) => MessageType::QueryRequest,
            Message::SignatureRequest(_) => MessageType::SignatureRequest,
            Message::SignatureResponse(_) => MessageType::SignatureResponse,
        }
    }
}

impl<R: Record> ToBytes for Message<R> {
    fn buffer_length(&self) -> usize {
        2 + match self {
            Message::Overlay(message) => message.buffer_length(),
            Message::Ping(message) => message.buffer_length(),
            Message::Aggregation(message) => message.buffer_length(),
            Message::QueryRequest(message) => message.buffer_length(),
            Message::SignatureRequest(message) => message.buffer_length(),
            Message::SignatureResponse(message) => message.buffer_length(),
        }
    }

    fn to_bytes(&self, buffer: &mut Vec<u8>) {
        (self.message_type() as u16).to_bytes(buffer);
        match self {
            Message::Overlay(message) => message.to_bytes(buffer),
            Message::Ping(message) => message.to_bytes(buffer),
            Message::Aggregation(message) => message.to_bytes(buffer),
            Message::QueryRequest(message) => message.to_bytes(buffer),
            Message::SignatureRequest(message) => message.to_bytes(buffer),
            Message::SignatureResponse(message) => message.to_bytes(buffer),
        }
    }
}

impl<R: Record> FromBytes for Message<R> {
    fn from_bytes(reader: &mut ByteReader<'_>) -> Result<Self, DecodeError> {
        let tag = u16::from_bytes(reader).context("cannot read message type")?;
        match MessageType::try_from_tag(tag)? {
            MessageType::Overlay => Ok(Message::Overlay(
                OverlayTransportMessage::from_bytes(reader)
                    .context("invalid overlay transport message")?,
            )),
            MessageType::Ping => Ok(Message::Ping(
                PingMessage::from_bytes(reader).context("invalid ping message")?,
            )),
            MessageType::Aggregation => Ok(Message::Aggregation(
                AggregationMessage::from_bytes(reader).context("invalid aggregation message")?,
            )),
            MessageType::QueryRequest => Ok(Message::QueryRequest(
                QueryRequest::from_bytes(reader).context("invalid query request")?,
            )),
            MessageType::SignatureRequest => Ok(Message::SignatureRequest(
                SignatureRequest::from_bytes(reader).context("invalid signature request")?,
            )),
            MessageType::SignatureResponse => Ok(Message::SignatureResponse(
                SignatureResponse::from_bytes(reader).context("invalid signature response")?,
            )),
        }
    }
}

/// The per-round envelope exchanged between overlay peers.
///
/// `is_final_message` marks the last message of the sender's round; the
/// receiver uses it to know that it may advance its own round.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OverlayTransportMessage<R> {
    pub sender_id: NodeId,
    pub sender_round: i32,
    pub is_final_message: bool,
    pub body: OverlayMessage<R>,
}

impl<R: Record> ToBytes for OverlayTransportMessage<R> {
    fn buffer_length(&self) -> usize {
        4 + 4 + 1 + self.body.tagged_buffer_length()
    }

    fn to_bytes(&self, buffer: &mut Vec<u8>) {
        self.sender_id.to_bytes(buffer);
        self.sender_round.to_bytes(buffer);
        self.is_final_message.to_bytes(buffer);
        self.body.tagged_to_bytes(buffer);
    }
}

impl<R: Record> FromBytes for OverlayTransportMessage<R> {
    fn from_bytes(reader: &mut ByteReader<'_>) -> Result<Self, DecodeError> {
        let sender_id = NodeId::from_bytes(reader).context("cannot parse sender id")?;
        let sender_round = i32::from_bytes(reader).context("cannot parse sender round")?;
        let is_final_message = bool::from_bytes(reader).context("cannot parse final flag")?;
        let body = OverlayMessage::tagged_from_bytes(reader).context("invalid overlay body")?;
        Ok(Self {
            sender_id,
            sender_round,
            is_final_message,
            body,
        })
    }
}

/// A liveness probe, or the response to one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PingMessage {
    pub sender_id: NodeId,
    pub is_response: bool,
}

impl ToBytes for PingMessage {
    fn buffer_length(&self) -> usize {
        4 + 1
    }

    fn to_bytes(&self, buffer: &mut Vec<u8>) {
        self.sender_id.to_bytes(buffer);
        self.is_response.to_bytes(buffer);
    }
}

impl FromBytes for PingMessage {
    fn from_bytes(reader: &mut ByteReader<'_>) -> Result<Self, DecodeError> {
        let sender_id = NodeId::from_bytes(reader).context("cannot parse sender id")?;
        let is_response = bool::from_bytes(reader).context("cannot parse response flag")?;
        Ok(Self {
            sender_id,
            is_response,
        })
    }
}

/// An intermediate or final query result travelling up the aggregation tree.
///
/// Equality and hashing ignore the sender: the utility votes on results by
/// comparing `(query, value, contributor count)`, no matter which group root
/// reported them.
#[derive(Debug, Clone)]
pub struct AggregationMessage<R> {
    pub sender_id: NodeId,
    pub query_num: i32,
    pub num_contributors: i32,
    pub value: R,
}

impl<R: PartialEq> PartialEq for AggregationMessage<R> {
    fn eq(&self, other: &Self) -> bool {
        self.query_num == other.query_num
            && self.num_contributors == other.num_contributors
            && self.value == other.value
    }
}

impl<R: Eq> Eq for AggregationMessage<R> {}

impl<R: Hash> Hash for AggregationMessage<R> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.query_num.hash(state);
        self.num_contributors.hash(state);
        self.value.hash(state);
    }
}

impl<R: Record> ToBytes for AggregationMessage<R> {
    fn buffer_length(&self) -> usize {
        4 + 4 + 4 + 2 + self.value.buffer_length()
    }

    fn to_bytes(&self, buffer: &mut Vec<u8>) {
        self.sender_id.to_bytes(buffer);
        self.query_num.to_bytes(buffer);
        self.num_contributors.to_bytes(buffer);
        (MessageBodyType::AggregationValue as u16).to_bytes(buffer);
        self.value.to_bytes(buffer);
    }
}

impl<R: Record> FromBytes for AggregationMessage<R> {
    fn from_bytes(reader: &mut ByteReader<'_>) -> Result<Self, DecodeError> {
        let sender_id = NodeId::from_bytes(reader).context("cannot parse sender id")?;
        let query_num = i32::from_bytes(reader).context("cannot parse query number")?;
        let num_contributors =
            i32::from_bytes(reader).context("cannot parse contributor count")?;
        let tag = u16::from_bytes(reader).context("cannot read body type")?;
        if tag != MessageBodyType::AggregationValue as u16 {
            return Err(anyhow!("aggregation message with body type {}", tag));
        }
        let value = R::from_bytes(reader).context("cannot parse aggregation value")?;
        Ok(Self {
            sender_id,
            query_num,
            num_contributors,
            value,
        })
    }
}

/// A query issued by the utility, broadcast to every client.
///
/// The select/filter/aggregate opcodes name entries in the application's
/// data-source function tables; the argument buffers are opaque here and
/// deserialised by the application.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryRequest {
    pub query_number: i32,
    pub select_function_opcode: Opcode,
    pub filter_function_opcode: Opcode,
    pub aggregate_function_opcode: Opcode,
    pub select_serialized_args: Vec<u8>,
    pub filter_serialized_args: Vec<u8>,
    pub aggregate_serialized_args: Vec<u8>,
}

impl ToBytes for QueryRequest {
    fn buffer_length(&self) -> usize {
        4 + 3 * 4
            + self.select_serialized_args.buffer_length()
            + self.filter_serialized_args.buffer_length()
            + self.aggregate_serialized_args.buffer_length()
    }

    fn to_bytes(&self, buffer: &mut Vec<u8>) {
        self.query_number.to_bytes(buffer);
        self.select_function_opcode.to_bytes(buffer);
        self.filter_function_opcode.to_bytes(buffer);
        self.aggregate_function_opcode.to_bytes(buffer);
        self.select_serialized_args.to_bytes(buffer);
        self.filter_serialized_args.to_bytes(buffer);
        self.aggregate_serialized_args.to_bytes(buffer);
    }
}

impl FromBytes for QueryRequest {
    fn from_bytes(reader: &mut ByteReader<'_>) -> Result<Self, DecodeError> {
        Ok(Self {
            query_number: i32::from_bytes(reader).context("cannot parse query number")?,
            select_function_opcode: Opcode::from_bytes(reader)
                .context("cannot parse select opcode")?,
            filter_function_opcode: Opcode::from_bytes(reader)
                .context("cannot parse filter opcode")?,
            aggregate_function_opcode: Opcode::from_bytes(reader)
                .context("cannot parse aggregate opcode")?,
            select_serialized_args: Vec::from_bytes(reader)
                .context("cannot parse select args")?,
            filter_serialized_args: Vec::from_bytes(reader)
                .context("cannot parse filter args")?,
            aggregate_serialized_args: Vec::from_bytes(reader)
                .context("cannot parse aggregate args")?,
        })
    }
}

/// A client's request that the utility blindly sign its value tuple. The
/// body is the blinded tuple, opaque to everyone but the requester.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignatureRequest {
    pub sender_id: NodeId,
    pub blinded_message: Vec<u8>,
}

/// The utility's blind signature over a [`SignatureRequest`] body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignatureResponse {
    pub sender_id: NodeId,
    pub blind_signature: Vec<u8>,
}

macro_rules! impl_byte_body_message {
    ($name:ident, $field:ident) => {
        impl ToBytes for $name {
            fn buffer_length(&self) -> usize {
                4 + 2 + self.$field.buffer_length()
            }

            fn to_bytes(&self, buffer: &mut Vec<u8>) {
                self.sender_id.to_bytes(buffer);
                (MessageBodyType::Bytes as u16).to_bytes(buffer);
                self.$field.to_bytes(buffer);
            }
        }

        impl FromBytes for $name {
            fn from_bytes(reader: &mut ByteReader<'_>) -> Result<Self, DecodeError> {
                let sender_id = NodeId::from_bytes(reader).context("cannot parse sender id")?;
                let tag = u16::from_bytes(reader).context("cannot read body type")?;
                if tag != MessageBodyType::Bytes as u16 {
                    return Err(anyhow!(concat!(
                        stringify!($name),
                        " with a non-byte body"
                    )));
                }
                let $field = Vec::from_bytes(reader).context("cannot parse byte body")?;
                Ok(Self { sender_id, $field })
            }
        }
    };
}

impl_byte_body_message!(SignatureRequest, blinded_message);
impl_byte_body_message!(SignatureResponse, blind_signature);

/// Encodes a batch of messages into one frame:
/// `size (8B) || num_messages (8B) || (type (2B) || payload)*`.
///
/// Frames addressed to the utility omit the count header (`include_count =
/// false`): the utility only ever receives one message per frame.
pub fn encode_frame<R: Record>(messages: &[Message<R>], include_count: bool) -> Vec<u8> {
    let payload_len = messages
        .iter()
        .map(ToBytes::buffer_length)
        .sum::<usize>()
        + if include_count { 8 } else { 0 };
    let mut buffer = Vec::with_capacity(FRAME_SIZE_HEADER_LEN + payload_len);
    (payload_len as u64).to_bytes(&mut buffer);
    if include_count {
        (messages.len() as u64).to_bytes(&mut buffer);
    }
    for message in messages {
        message.to_bytes(&mut buffer);
    }
    buffer
}

/// Decodes the payload of a frame (everything after the size header).
pub fn decode_frame_payload<R: Record>(
    payload: &[u8],
    has_count: bool,
) -> Result<Vec<Message<R>>, DecodeError> {
    let mut reader = ByteReader::new(payload);
    let count = if has_count {
        u64::from_bytes(&mut reader).context("cannot read message count")? as usize
    } else {
        1
    };
    let mut messages = Vec::with_capacity(count.min(1024));
    for i in 0..count {
        messages.push(
            Message::from_bytes(&mut reader).with_context(|| format!("invalid message {}", i))?,
        );
    }
    if reader.remaining() > 0 {
        return Err(anyhow!("{} trailing bytes in frame", reader.remaining()));
    }
    Ok(messages)
}

/// Whether frames to this destination carry a count header.
pub fn frame_has_count(destination: NodeId) -> bool {
    destination != UTILITY_NODE_ID
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::MessageBody;
    use std::sync::Arc;

    fn overlay_transport(final_message: bool) -> Message<i64> {
        Message::Overlay(OverlayTransportMessage {
            sender_id: 2,
            sender_round: 7,
            is_final_message: final_message,
            body: OverlayMessage::new(
                1,
                5,
                Some(Arc::new(MessageBody::AggregationValue(99i64))),
            ),
        })
    }

    #[test]
    fn message_tags() {
        let ping = Message::<i64>::Ping(PingMessage {
            sender_id: 0,
            is_response: false,
        });
        let mut buf = Vec::new();
        ping.to_bytes(&mut buf);
        assert_eq!(&buf[..2], &[1u8, 0]);
    }

    #[test]
    fn frame_round_trip_with_count() {
        let messages = vec![
            overlay_transport(false),
            Message::Ping(PingMessage {
                sender_id: 4,
                is_response: true,
            }),
        ];
        let frame = encode_frame(&messages, true);

        let (size_header, payload) = frame.split_at(FRAME_SIZE_HEADER_LEN);
        let size = u64::from_le_bytes(size_header.try_into().unwrap()) as usize;
        assert_eq!(size, payload.len());

        let parsed = decode_frame_payload::<i64>(payload, true).unwrap();
        assert_eq!(parsed, messages);
    }

    #[test]
    fn utility_frame_has_no_count() {
        let message = Message::<i64>::Aggregation(AggregationMessage {
            sender_id: 3,
            query_num: 0,
            num_contributors: 7,
            value: 21,
        });
        let frame = encode_frame(std::slice::from_ref(&message), false);
        let payload = &frame[FRAME_SIZE_HEADER_LEN..];
        let parsed = decode_frame_payload::<i64>(payload, false).unwrap();
        assert_eq!(parsed, vec![message]);
    }

    #[test]
    fn aggregation_equality_ignores_sender() {
        let a = AggregationMessage {
            sender_id: 1,
            query_num: 2,
            num_contributors: 3,
            value: 10i64,
        };
        let mut b = a.clone();
        b.sender_id = 6;
        assert_eq!(a, b);
        b.num_contributors = 4;
        assert_ne!(a, b);
    }

    #[test]
    fn query_request_round_trip() {
        let request = Message::<i64>::QueryRequest(QueryRequest {
            query_number: 11,
            select_function_opcode: 0,
            filter_function_opcode: 1,
            aggregate_function_opcode: 2,
            select_serialized_args: vec![1, 2, 3],
            filter_serialized_args: vec![],
            aggregate_serialized_args: vec![9],
        });
        let mut buf = Vec::new();
        request.to_bytes(&mut buf);
        let parsed = Message::<i64>::from_bytes(&mut ByteReader::new(&buf)).unwrap();
        assert_eq!(parsed, request);
    }

    #[test]
    fn signature_round_trip() {
        let request = Message::<i64>::SignatureRequest(SignatureRequest {
            sender_id: 5,
            blinded_message: vec![0xab; 256],
        });
        let mut buf = Vec::new();
        request.to_bytes(&mut buf);
        assert_eq!(buf.len(), request.buffer_length());
        let parsed = Message::<i64>::from_bytes(&mut ByteReader::new(&buf)).unwrap();
        assert_eq!(parsed, request);
    }

    #[test]
    fn truncated_frame_fails() {
        let frame = encode_frame(&[overlay_transport(true)], true);
        let payload = &frame[FRAME_SIZE_HEADER_LEN..];
        assert!(decode_frame_payload::<i64>(&payload[..payload.len() - 1], true).is_err());
    }
}
