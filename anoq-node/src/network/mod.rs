//! The network seam between the protocol state machines and the transport.
//!
//! The state machines never see sockets: they call [`Network`] and the
//! messenger does the rest. Sends are fire-and-forget; an `Err` means the
//! peer is already known to be dead, which the protocol treats as a
//! permanent failure for the current query. Production uses
//! [`TcpMessenger`]; tests plug in an in-memory implementation.

mod messenger;

pub use self::messenger::{spawn_listener, TcpMessenger};

use thiserror::Error;

use anoq_core::{
    message::{
        AggregationMessage, OverlayTransportMessage, PingMessage, QueryRequest, SignatureRequest,
        SignatureResponse,
    },
    NodeId, Record,
};

#[derive(Error, Debug)]
pub enum NetworkError {
    #[error("peer {0} is unreachable")]
    PeerUnreachable(NodeId),
    #[error("no address known for node {0}")]
    UnknownPeer(NodeId),
}

/// Everything a protocol state machine can ask of the transport.
pub trait Network<R: Record> {
    /// Sends one round's batch of overlay messages to the gossip target.
    /// The caller has already marked the last message as final.
    fn send_batch(
        &mut self,
        messages: Vec<OverlayTransportMessage<R>>,
        destination: NodeId,
    ) -> Result<(), NetworkError>;

    fn send_ping(&mut self, ping: PingMessage, destination: NodeId) -> Result<(), NetworkError>;

    fn send_aggregation(
        &mut self,
        message: AggregationMessage<R>,
        destination: NodeId,
    ) -> Result<(), NetworkError>;

    /// Client → utility: request a blind signature.
    fn send_signature_request(&mut self, request: SignatureRequest) -> Result<(), NetworkError>;

    /// Utility → client: deliver a blind signature.
    fn send_signature_response(
        &mut self,
        response: SignatureResponse,
        destination: NodeId,
    ) -> Result<(), NetworkError>;

    /// Utility → client: broadcast one query.
    fn send_query_request(
        &mut self,
        request: QueryRequest,
        destination: NodeId,
    ) -> Result<(), NetworkError>;
}
