//! The messages of the query protocol.
//!
//! Two layers make up the message taxonomy:
//!
//! - **Transport messages** ([`Message`]) are what actually crosses a TCP
//!   connection: overlay transport envelopes, pings, aggregation results,
//!   query requests and the blind-signature request/response pair. Each is
//!   tagged with a 16-bit [`MessageType`].
//! - **Message bodies** ([`MessageBody`]) are the polymorphic payloads that
//!   ride inside overlay messages, tagged with a 16-bit [`MessageBodyType`]
//!   so that onion layers can be peeled and deserialised without knowing the
//!   payload type in advance.
//!
//! Serialization is by hand (see [`traits`]): little-endian fixed-width
//! integers, 64-bit length prefixes on sequences, and a leading tag on every
//! polymorphic value.

mod body;
#[allow(clippy::module_inception)]
mod message;
pub(crate) mod traits;
mod value;

pub use self::{
    body::{MessageBody, MessageBodyType, OverlayMessage},
    message::{
        decode_frame_payload, encode_frame, frame_has_count, AggregationMessage, Message,
        MessageType, OverlayTransportMessage, PingMessage, QueryRequest, SignatureRequest,
        SignatureResponse, FRAME_SIZE_HEADER_LEN,
    },
    traits::{ByteReader, FromBytes, ToBytes},
    value::{AgreementValue, SignedValue, ValueContribution, ValueTuple},
};

/// An error that signals a failure to parse a received message.
///
/// Kept deliberately generic so the sender of a malformed message learns
/// nothing about what exactly was rejected.
pub type DecodeError = anyhow::Error;
