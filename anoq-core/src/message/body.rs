//! Overlay messages and the polymorphic bodies they enclose.

use std::sync::Arc;

use anyhow::{anyhow, Context};

use crate::{
    message::{
        AgreementValue, ByteReader, DecodeError, FromBytes, SignedValue, ToBytes,
        ValueContribution,
    },
    NodeId, Record,
};

/// The 16-bit tag in front of every serialised [`MessageBody`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum MessageBodyType {
    Overlay = 0,
    PathOverlay = 1,
    AggregationValue = 2,
    ValueContribution = 3,
    SignedValue = 4,
    AgreementValue = 5,
    Bytes = 6,
}

impl MessageBodyType {
    fn try_from_tag(tag: u16) -> Result<Self, DecodeError> {
        match tag {
            0 => Ok(Self::Overlay),
            1 => Ok(Self::PathOverlay),
            2 => Ok(Self::AggregationValue),
            3 => Ok(Self::ValueContribution),
            4 => Ok(Self::SignedValue),
            5 => Ok(Self::AgreementValue),
            6 => Ok(Self::Bytes),
            other => Err(anyhow!("unknown message body type {}", other)),
        }
    }
}

/// A payload enclosed in an [`OverlayMessage`].
///
/// The original design expressed this as a class hierarchy with a type tag
/// for deserialization; here it is a single enum and all dispatch is a
/// `match`. The `Bytes` variant stands in for any body that is currently
/// envelope-encrypted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageBody<R> {
    /// Another overlay message: one layer of an onion, or a source-routed
    /// message being forwarded.
    Overlay(OverlayMessage<R>),
    /// An aggregation intermediate value (only used inside
    /// `AggregationMessage`, but part of the body grammar).
    AggregationValue(R),
    ValueContribution(ValueContribution<R>),
    SignedValue(SignedValue<R>),
    AgreementValue(AgreementValue<R>),
    /// An opaque, envelope-encrypted body.
    Bytes(Vec<u8>),
}

impl<R> MessageBody<R> {
    pub fn body_type(&self) -> MessageBodyType {
        match self {
            MessageBody::Overlay(message) if message.remaining_path.is_empty() => {
                MessageBodyType::Overlay
            }
            MessageBody::Overlay(_) => MessageBodyType::PathOverlay,
            MessageBody::AggregationValue(_) => MessageBodyType::AggregationValue,
            MessageBody::ValueContribution(_) => MessageBodyType::ValueContribution,
            MessageBody::SignedValue(_) => MessageBodyType::SignedValue,
            MessageBody::AgreementValue(_) => MessageBodyType::AgreementValue,
            MessageBody::Bytes(_) => MessageBodyType::Bytes,
        }
    }
}

impl<R: Record> ToBytes for MessageBody<R> {
    fn buffer_length(&self) -> usize {
        2 + match self {
            MessageBody::Overlay(message) => message.fields_buffer_length(),
            MessageBody::AggregationValue(value) => value.buffer_length(),
            MessageBody::ValueContribution(contribution) => contribution.buffer_length(),
            MessageBody::SignedValue(signed) => signed.buffer_length(),
            MessageBody::AgreementValue(agreement) => agreement.buffer_length(),
            MessageBody::Bytes(bytes) => bytes.buffer_length(),
        }
    }

    fn to_bytes(&self, buffer: &mut Vec<u8>) {
        (self.body_type() as u16).to_bytes(buffer);
        match self {
            MessageBody::Overlay(message) => message.fields_to_bytes(buffer),
            MessageBody::AggregationValue(value) => value.to_bytes(buffer),
            MessageBody::ValueContribution(contribution) => contribution.to_bytes(buffer),
            MessageBody::SignedValue(signed) => signed.to_bytes(buffer),
            MessageBody::AgreementValue(agreement) => agreement.to_bytes(buffer),
            MessageBody::Bytes(bytes) => bytes.to_bytes(buffer),
        }
    }
}

impl<R: Record> FromBytes for MessageBody<R> {
    fn from_bytes(reader: &mut ByteReader<'_>) -> Result<Self, DecodeError> {
        let tag = u16::from_bytes(reader).context("cannot read body type")?;
        match MessageBodyType::try_from_tag(tag)? {
            tag @ (MessageBodyType::Overlay | MessageBodyType::PathOverlay) => Ok(
                MessageBody::Overlay(OverlayMessage::fields_from_bytes(reader, tag)?),
            ),
            MessageBodyType::AggregationValue => Ok(MessageBody::AggregationValue(
                R::from_bytes(reader).context("invalid aggregation value body")?,
            )),
            MessageBodyType::ValueContribution => Ok(MessageBody::ValueContribution(
                ValueContribution::from_bytes(reader).context("invalid contribution body")?,
            )),
            MessageBodyType::SignedValue => Ok(MessageBody::SignedValue(
                SignedValue::from_bytes(reader).context("invalid signed value body")?,
            )),
            MessageBodyType::AgreementValue => Ok(MessageBody::AgreementValue(
                AgreementValue::from_bytes(reader).context("invalid agreement value body")?,
            )),
            MessageBodyType::Bytes => Ok(MessageBody::Bytes(
                Vec::from_bytes(reader).context("invalid byte body")?,
            )),
        }
    }
}

/// The payload of an overlay transport message: one hop's view of a message
/// travelling the gossip overlay.
///
/// When `remaining_path` is non-empty, the message is source-routed (the
/// original's `PathOverlayMessage`) and serialises under the `PathOverlay`
/// tag; `destination` is always the next hop and the head of
/// `remaining_path` the hop after that. The enclosed body is shared by
/// reference: relaying a message does not copy its payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OverlayMessage<R> {
    pub query_num: i32,
    pub destination: NodeId,
    pub is_encrypted: bool,
    /// True if this message should be sent out on every round, regardless
    /// of its destination.
    pub flood: bool,
    pub remaining_path: Vec<NodeId>,
    pub body: Option<Arc<MessageBody<R>>>,
}

impl<R> OverlayMessage<R> {
    pub fn new(query_num: i32, destination: NodeId, body: Option<Arc<MessageBody<R>>>) -> Self {
        Self {
            query_num,
            destination,
            is_encrypted: false,
            flood: false,
            remaining_path: Vec::new(),
            body,
        }
    }

    /// A source-routed message: the first path entry becomes the next
    /// destination, the rest stays as the remaining path.
    ///
    /// # Panics
    /// Panics if `path` is empty.
    pub fn with_path(query_num: i32, path: &[NodeId], body: Option<Arc<MessageBody<R>>>) -> Self {
        let mut message = Self::new(query_num, path[0], body);
        message.remaining_path = path[1..].to_vec();
        message
    }

    /// The empty message a node sends when it has nothing to say in a
    /// round, so its gossip target can still advance.
    pub fn dummy(query_num: i32, destination: NodeId) -> Self {
        let mut message = Self::new(query_num, destination, None);
        message.flood = true;
        message
    }

    /// Pops the head of the remaining path into `destination`. Returns
    /// false if there was no path left to pop.
    pub fn pop_next_hop(&mut self) -> bool {
        if self.remaining_path.is_empty() {
            return false;
        }
        self.destination = self.remaining_path.remove(0);
        true
    }
}

impl<R: Record> OverlayMessage<R> {
    fn fields_buffer_length(&self) -> usize {
        4 + 4
            + 1
            + 1
            + if self.remaining_path.is_empty() {
                0
            } else {
                self.remaining_path.buffer_length()
            }
            + 1
            + self.body.as_ref().map_or(0, |body| body.buffer_length())
    }

    fn fields_to_bytes(&self, buffer: &mut Vec<u8>) {
        self.query_num.to_bytes(buffer);
        self.destination.to_bytes(buffer);
        self.is_encrypted.to_bytes(buffer);
        self.flood.to_bytes(buffer);
        if !self.remaining_path.is_empty() {
            self.remaining_path.to_bytes(buffer);
        }
        match &self.body {
            Some(body) => {
                true.to_bytes(buffer);
                body.to_bytes(buffer);
            }
            None => false.to_bytes(buffer),
        }
    }

    fn fields_from_bytes(
        reader: &mut ByteReader<'_>,
        tag: MessageBodyType,
    ) -> Result<Self, DecodeError> {
        let query_num = i32::from_bytes(reader).context("cannot parse query number")?;
        let destination = NodeId::from_bytes(reader).context("cannot parse destination")?;
        let is_encrypted = bool::from_bytes(reader).context("cannot parse encrypted flag")?;
        let flood = bool::from_bytes(reader).context("cannot parse flood flag")?;
        let remaining_path = if tag == MessageBodyType::PathOverlay {
            Vec::from_bytes(reader).context("cannot parse remaining path")?
        } else {
            Vec::new()
        };
        let body = if bool::from_bytes(reader).context("cannot parse body presence flag")? {
            Some(Arc::new(
                MessageBody::from_bytes(reader).context("cannot parse enclosed body")?,
            ))
        } else {
            None
        };
        Ok(Self {
            query_num,
            destination,
            is_encrypted,
            flood,
            remaining_path,
            body,
        })
    }

    pub(crate) fn tagged_buffer_length(&self) -> usize {
        2 + self.fields_buffer_length()
    }

    pub(crate) fn tagged_to_bytes(&self, buffer: &mut Vec<u8>) {
        let tag = if self.remaining_path.is_empty() {
            MessageBodyType::Overlay
        } else {
            MessageBodyType::PathOverlay
        };
        (tag as u16).to_bytes(buffer);
        self.fields_to_bytes(buffer);
    }

    /// Parses a tagged body that must be an overlay message (plain or
    /// source-routed).
    pub(crate) fn tagged_from_bytes(reader: &mut ByteReader<'_>) -> Result<Self, DecodeError> {
        let tag = u16::from_bytes(reader).context("cannot read body type")?;
        match MessageBodyType::try_from_tag(tag)? {
            tag @ (MessageBodyType::Overlay | MessageBodyType::PathOverlay) => {
                Self::fields_from_bytes(reader, tag)
            }
            other => Err(anyhow!(
                "expected an overlay message body, found {:?}",
                other
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{ByteObject, Signature};
    use crate::message::ValueTuple;

    fn contribution() -> ValueContribution<i64> {
        ValueContribution::new(
            ValueTuple {
                query_num: 5,
                value: 123,
                proxies: vec![1, 3, 4],
            },
            Signature::from_slice(&[0x5a; 256]).unwrap(),
        )
    }

    #[test]
    fn plain_overlay_round_trip() {
        let message = OverlayMessage::new(
            5,
            3,
            Some(Arc::new(MessageBody::ValueContribution(contribution()))),
        );
        let body = MessageBody::Overlay(message);

        let mut buf = Vec::new();
        body.to_bytes(&mut buf);
        assert_eq!(buf.len(), body.buffer_length());
        assert_eq!(&buf[..2], &[0u8, 0]);

        let parsed = MessageBody::<i64>::from_bytes(&mut ByteReader::new(&buf)).unwrap();
        assert_eq!(parsed, body);
    }

    #[test]
    fn path_overlay_uses_its_own_tag() {
        let message = OverlayMessage::<i64>::with_path(2, &[4, 6, 1], None);
        assert_eq!(message.destination, 4);
        assert_eq!(message.remaining_path, vec![6, 1]);

        let body = MessageBody::Overlay(message);
        let mut buf = Vec::new();
        body.to_bytes(&mut buf);
        assert_eq!(&buf[..2], &[1u8, 0]);

        let parsed = MessageBody::<i64>::from_bytes(&mut ByteReader::new(&buf)).unwrap();
        assert_eq!(parsed, body);
    }

    #[test]
    fn pop_next_hop_walks_the_path() {
        let mut message = OverlayMessage::<i64>::with_path(2, &[4, 6, 1], None);
        assert!(message.pop_next_hop());
        assert_eq!(message.destination, 6);
        assert!(message.pop_next_hop());
        assert_eq!(message.destination, 1);
        assert!(message.remaining_path.is_empty());
        assert!(!message.pop_next_hop());
    }

    #[test]
    fn nested_onion_layers_round_trip() {
        let inner = OverlayMessage::new(
            1,
            2,
            Some(Arc::new(MessageBody::ValueContribution(contribution()))),
        );
        let outer = OverlayMessage::new(1, 5, Some(Arc::new(MessageBody::Overlay(inner))));
        let body = MessageBody::Overlay(outer);

        let mut buf = Vec::new();
        body.to_bytes(&mut buf);
        let parsed = MessageBody::<i64>::from_bytes(&mut ByteReader::new(&buf)).unwrap();
        assert_eq!(parsed, body);
    }

    #[test]
    fn dummy_message_has_no_body() {
        let message = OverlayMessage::<i64>::dummy(9, 4);
        assert!(message.flood);
        let body = MessageBody::Overlay(message);
        let mut buf = Vec::new();
        body.to_bytes(&mut buf);
        let parsed = MessageBody::<i64>::from_bytes(&mut ByteReader::new(&buf)).unwrap();
        assert_eq!(parsed, body);
    }

    #[test]
    fn unknown_body_tag_is_rejected() {
        let mut buf = Vec::new();
        99u16.to_bytes(&mut buf);
        assert!(MessageBody::<i64>::from_bytes(&mut ByteReader::new(&buf)).is_err());
    }
}
