//! TCP transport: length-framed messages over one lazily opened connection
//! per peer.
//!
//! Outbound: the first send to a peer spawns a writer task that connects
//! and drains a channel of pre-serialised frames. A connect or write
//! failure makes the task drop its receiver, so the *next* send observes a
//! closed channel and reports the peer dead: the same
//! detect-failure-on-send discipline the protocol's ping probing relies on.
//!
//! Inbound: a listener task accepts connections and spawns one reader task
//! per connection, which parses frames and forwards the contained messages
//! to the node's event loop over a single mpsc channel. Senders are
//! identified by the `sender_id` fields inside the messages, not by the
//! connection (outbound connections are write-only).

use std::{
    collections::{hash_map::Entry, HashMap},
    marker::PhantomData,
    net::SocketAddr,
};

use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{TcpListener, TcpStream},
    sync::mpsc,
    task::JoinHandle,
};
use tracing::{debug, trace, warn};

use anoq_core::{
    message::{
        decode_frame_payload, encode_frame, frame_has_count, AggregationMessage, Message,
        OverlayTransportMessage, PingMessage, QueryRequest, SignatureRequest, SignatureResponse,
        FRAME_SIZE_HEADER_LEN,
    },
    NodeId, Record, UTILITY_NODE_ID,
};

use crate::network::{Network, NetworkError};

/// Frames larger than this are treated as a protocol violation and close
/// the connection.
const MAX_FRAME_LEN: u64 = 64 * 1024 * 1024;

/// The production [`Network`] implementation.
pub struct TcpMessenger<R> {
    local_id: NodeId,
    addresses: HashMap<NodeId, SocketAddr>,
    peers: HashMap<NodeId, mpsc::UnboundedSender<Vec<u8>>>,
    _record: PhantomData<fn() -> R>,
}

impl<R: Record> TcpMessenger<R> {
    /// `addresses` must contain every peer this node will ever talk to,
    /// including the utility under [`UTILITY_NODE_ID`].
    pub fn new(local_id: NodeId, addresses: HashMap<NodeId, SocketAddr>) -> Self {
        Self {
            local_id,
            addresses,
            peers: HashMap::new(),
            _record: PhantomData,
        }
    }

    fn send_frame(&mut self, frame: Vec<u8>, destination: NodeId) -> Result<(), NetworkError> {
        let sender = match self.peers.entry(destination) {
            Entry::Occupied(entry) => entry.into_mut(),
            Entry::Vacant(entry) => {
                let address = *self
                    .addresses
                    .get(&destination)
                    .ok_or(NetworkError::UnknownPeer(destination))?;
                entry.insert(spawn_writer(self.local_id, destination, address))
            }
        };
        if sender.send(frame).is_err() {
            // The writer task died on a connect or write error.
            self.peers.remove(&destination);
            return Err(NetworkError::PeerUnreachable(destination));
        }
        Ok(())
    }

    fn send_one(&mut self, message: Message<R>, destination: NodeId) -> Result<(), NetworkError> {
        let frame = encode_frame(std::slice::from_ref(&message), frame_has_count(destination));
        self.send_frame(frame, destination)
    }
}

impl<R: Record> Network<R> for TcpMessenger<R> {
    fn send_batch(
        &mut self,
        messages: Vec<OverlayTransportMessage<R>>,
        destination: NodeId,
    ) -> Result<(), NetworkError> {
        let messages: Vec<Message<R>> = messages.into_iter().map(Message::Overlay).collect();
        let frame = encode_frame(&messages, frame_has_count(destination));
        self.send_frame(frame, destination)
    }

    fn send_ping(&mut self, ping: PingMessage, destination: NodeId) -> Result<(), NetworkError> {
        self.send_one(Message::Ping(ping), destination)
    }

    fn send_aggregation(
        &mut self,
        message: AggregationMessage<R>,
        destination: NodeId,
    ) -> Result<(), NetworkError> {
        self.send_one(Message::Aggregation(message), destination)
    }

    fn send_signature_request(&mut self, request: SignatureRequest) -> Result<(), NetworkError> {
        self.send_one(Message::SignatureRequest(request), UTILITY_NODE_ID)
    }

    fn send_signature_response(
        &mut self,
        response: SignatureResponse,
        destination: NodeId,
    ) -> Result<(), NetworkError> {
        self.send_one(Message::SignatureResponse(response), destination)
    }

    fn send_query_request(
        &mut self,
        request: QueryRequest,
        destination: NodeId,
    ) -> Result<(), NetworkError> {
        self.send_one(Message::QueryRequest(request), destination)
    }
}

fn spawn_writer(
    local_id: NodeId,
    destination: NodeId,
    address: SocketAddr,
) -> mpsc::UnboundedSender<Vec<u8>> {
    let (tx, mut rx) = mpsc::unbounded_channel::<Vec<u8>>();
    tokio::spawn(async move {
        let mut stream = match TcpStream::connect(address).await {
            Ok(stream) => stream,
            Err(e) => {
                debug!(local_id, destination, %address, "connect failed: {}", e);
                return;
            }
        };
        while let Some(frame) = rx.recv().await {
            if let Err(e) = stream.write_all(&frame).await {
                debug!(local_id, destination, "write failed: {}", e);
                return;
            }
            trace!(local_id, destination, bytes = frame.len(), "frame written");
        }
    });
    tx
}

/// Binds `port` and forwards every message received on any accepted
/// connection into `messages`. `frames_have_count` is true on client nodes
/// and false on the utility (whose frames carry a single message and no
/// count header).
pub async fn spawn_listener<R: Record>(
    port: u16,
    messages: mpsc::Sender<Message<R>>,
    frames_have_count: bool,
) -> std::io::Result<JoinHandle<()>> {
    let listener = TcpListener::bind(SocketAddr::from(([0, 0, 0, 0], port))).await?;
    Ok(tokio::spawn(async move {
        loop {
            let (stream, peer_address) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    warn!("accept failed: {}", e);
                    continue;
                }
            };
            trace!(%peer_address, "accepted connection");
            let messages = messages.clone();
            tokio::spawn(async move {
                if let Err(e) = read_frames(stream, messages, frames_have_count).await {
                    debug!(%peer_address, "connection closed: {}", e);
                }
            });
        }
    }))
}

async fn read_frames<R: Record>(
    mut stream: TcpStream,
    messages: mpsc::Sender<Message<R>>,
    frames_have_count: bool,
) -> anyhow::Result<()> {
    let mut size_header = [0u8; FRAME_SIZE_HEADER_LEN];
    loop {
        stream.read_exact(&mut size_header).await?;
        let frame_len = u64::from_le_bytes(size_header);
        if frame_len > MAX_FRAME_LEN {
            anyhow::bail!("oversized frame of {} bytes", frame_len);
        }
        let mut payload = vec![0u8; frame_len as usize];
        stream.read_exact(&mut payload).await?;
        // A frame that fails to parse closes the connection; anything
        // already parsed from earlier frames stands.
        let parsed = decode_frame_payload::<R>(&payload, frames_have_count)?;
        for message in parsed {
            if messages.send(message).await.is_err() {
                // Node shut down.
                return Ok(());
            }
        }
    }
}
