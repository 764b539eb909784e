//! Test fixtures: an in-memory [`Network`] and a deterministic cluster
//! harness that runs whole queries without sockets or real time.

use std::{
    collections::{HashMap, HashSet},
    time::{Duration, Instant},
};

use anoq_core::{
    common::ProtocolParams,
    crypto::CryptoEngine,
    data_source::DataSource,
    message::{
        AggregationMessage, Message, OverlayTransportMessage, PingMessage, QueryRequest,
        SignatureRequest, SignatureResponse,
    },
    testutils as core_testutils, NodeId, UTILITY_NODE_ID,
};

use crate::{
    client::ClientNode,
    network::{Network, NetworkError},
    server::ServerNode,
};

/// A [`Network`] that records every send. Sends to peers in `dead_peers`
/// fail, the way a send to a crashed process eventually does over TCP.
pub struct InMemoryNetwork<R> {
    pub local_id: NodeId,
    pub sent: Vec<(NodeId, Message<R>)>,
    pub dead_peers: HashSet<NodeId>,
}

impl<R> InMemoryNetwork<R> {
    pub fn new(local_id: NodeId) -> Self {
        Self {
            local_id,
            sent: Vec::new(),
            dead_peers: HashSet::new(),
        }
    }

    /// Drains everything sent so far, in send order.
    pub fn take_sent(&mut self) -> Vec<(NodeId, Message<R>)> {
        std::mem::take(&mut self.sent)
    }

    /// The single aggregation message sent so far.
    ///
    /// # Panics
    /// Panics if anything other than exactly one aggregation was sent.
    pub fn single_aggregation(&mut self) -> (NodeId, AggregationMessage<R>) {
        let mut aggregations: Vec<_> = self
            .take_sent()
            .into_iter()
            .filter_map(|(destination, message)| match message {
                Message::Aggregation(aggregation) => Some((destination, aggregation)),
                _ => None,
            })
            .collect();
        assert_eq!(aggregations.len(), 1, "expected exactly one aggregation");
        aggregations.pop().unwrap()
    }

    fn push(&mut self, destination: NodeId, message: Message<R>) -> Result<(), NetworkError> {
        if self.dead_peers.contains(&destination) {
            return Err(NetworkError::PeerUnreachable(destination));
        }
        self.sent.push((destination, message));
        Ok(())
    }
}

impl<R: anoq_core::Record> Network<R> for InMemoryNetwork<R> {
    fn send_batch(
        &mut self,
        messages: Vec<OverlayTransportMessage<R>>,
        destination: NodeId,
    ) -> Result<(), NetworkError> {
        if self.dead_peers.contains(&destination) {
            return Err(NetworkError::PeerUnreachable(destination));
        }
        for message in messages {
            self.sent.push((destination, Message::Overlay(message)));
        }
        Ok(())
    }

    fn send_ping(&mut self, ping: PingMessage, destination: NodeId) -> Result<(), NetworkError> {
        self.push(destination, Message::Ping(ping))
    }

    fn send_aggregation(
        &mut self,
        message: AggregationMessage<R>,
        destination: NodeId,
    ) -> Result<(), NetworkError> {
        self.push(destination, Message::Aggregation(message))
    }

    fn send_signature_request(&mut self, request: SignatureRequest) -> Result<(), NetworkError> {
        self.push(UTILITY_NODE_ID, Message::SignatureRequest(request))
    }

    fn send_signature_response(
        &mut self,
        response: SignatureResponse,
        destination: NodeId,
    ) -> Result<(), NetworkError> {
        self.push(destination, Message::SignatureResponse(response))
    }

    fn send_query_request(
        &mut self,
        request: QueryRequest,
        destination: NodeId,
    ) -> Result<(), NetworkError> {
        self.push(destination, Message::QueryRequest(request))
    }
}

/// A data source whose select function always yields `value` and whose
/// aggregate is integer summation.
pub fn sum_data_source_with_value(value: i64) -> DataSource<i64> {
    DataSource::new()
        .with_select(0, move |_| value)
        .with_filter(0, |_, _| true)
        .with_aggregate(0, |values, _| values.iter().sum())
}

/// A summation data source for tests that never run select.
pub fn sum_data_source() -> DataSource<i64> {
    sum_data_source_with_value(0)
}

/// A query using the summation opcodes with no arguments.
pub fn sum_query(query_number: i32) -> QueryRequest {
    QueryRequest {
        query_number,
        select_function_opcode: 0,
        filter_function_opcode: 0,
        aggregate_function_opcode: 0,
        select_serialized_args: Vec::new(),
        filter_serialized_args: Vec::new(),
        aggregate_serialized_args: Vec::new(),
    }
}

/// A whole cluster (`n` clients plus the utility) wired over in-memory
/// networks and driven by explicit message pumping and virtual time.
pub struct TestCluster {
    pub params: ProtocolParams,
    pub clients: Vec<ClientNode<i64, InMemoryNetwork<i64>>>,
    pub server: ServerNode<i64, InMemoryNetwork<i64>>,
    pub down: HashSet<NodeId>,
    /// Rogue clients trust a fake utility key; their signature requests
    /// are answered by these fake utilities instead of the real server,
    /// so they participate fully but carry utility signatures nobody else
    /// accepts.
    rogue_utilities: HashMap<NodeId, CryptoEngine>,
}

impl TestCluster {
    /// A cluster where client `i` contributes the value `values[i]`.
    pub fn new(values: &[i64]) -> Self {
        let n = values.len() as i32;
        let params = ProtocolParams::new(n);
        let clients = core_testutils::crypto_engines(n)
            .into_iter()
            .zip(values)
            .enumerate()
            .map(|(id, (crypto, value))| {
                ClientNode::new(
                    id as NodeId,
                    params,
                    crypto,
                    InMemoryNetwork::new(id as NodeId),
                    sum_data_source_with_value(*value),
                )
            })
            .collect();
        let server = ServerNode::new(
            params,
            core_testutils::utility_engine(n),
            InMemoryNetwork::new(UTILITY_NODE_ID),
        );
        Self {
            params,
            clients,
            server,
            down: HashSet::new(),
            rogue_utilities: HashMap::new(),
        }
    }

    /// Marks a client as crashed: it handles nothing, and sends to it fail.
    pub fn take_down(&mut self, id: NodeId) {
        self.down.insert(id);
        for client in &mut self.clients {
            client.engine_mut().network_mut().dead_peers.insert(id);
        }
        self.server.network_mut().dead_peers.insert(id);
    }

    /// Turns a client into a rogue contributor: it runs the protocol
    /// normally, but its contribution carries a utility signature that no
    /// honest proxy will accept.
    pub fn make_rogue(&mut self, id: NodeId, value: i64) {
        let n = self.params.num_nodes;
        let fake_utility_key = core_testutils::keys::test_key(
            core_testutils::keys::UTILITY_KEY_INDEX + 1 + id as usize,
        );
        let mut keys = core_testutils::public_key_map(n);
        keys.insert(UTILITY_NODE_ID, fake_utility_key.to_public_key());
        let crypto =
            CryptoEngine::from_keys(core_testutils::keys::test_key(id as usize).clone(), keys)
                .expect("engine construction");
        self.clients[id as usize] = ClientNode::new(
            id,
            self.params,
            crypto,
            InMemoryNetwork::new(id),
            sum_data_source_with_value(value),
        );

        let fake_utility = CryptoEngine::from_keys(
            fake_utility_key.clone(),
            HashMap::from([(UTILITY_NODE_ID, fake_utility_key.to_public_key())]),
        )
        .expect("engine construction");
        self.rogue_utilities.insert(id, fake_utility);
    }

    fn deliver(&mut self, destination: NodeId, message: Message<i64>) {
        if self.down.contains(&destination) {
            return;
        }
        // A rogue's signature request never reaches the real server; its
        // fake utility answers instead.
        if destination == UTILITY_NODE_ID {
            if let Message::SignatureRequest(request) = &message {
                if let Some(fake_utility) = self.rogue_utilities.get(&request.sender_id) {
                    let blind_signature = fake_utility
                        .sign_blinded(&request.blinded_message)
                        .expect("fake blind signing");
                    let response = Message::SignatureResponse(SignatureResponse {
                        sender_id: UTILITY_NODE_ID,
                        blind_signature,
                    });
                    self.clients[request.sender_id as usize].handle_message(response);
                    return;
                }
            }
        }
        if destination == UTILITY_NODE_ID {
            self.server.handle_message(message);
        } else {
            self.clients[destination as usize].handle_message(message);
        }
    }

    /// Delivers every message currently in flight; returns true if there
    /// were any.
    pub fn pump(&mut self) -> bool {
        let mut in_flight: Vec<(NodeId, Message<i64>)> = Vec::new();
        for client in &mut self.clients {
            in_flight.extend(client.engine_mut().network_mut().take_sent());
        }
        in_flight.extend(self.server.network_mut().take_sent());
        let delivered = !in_flight.is_empty();
        for (destination, message) in in_flight {
            self.deliver(destination, message);
        }
        delivered
    }

    /// The earliest timer deadline anywhere in the cluster.
    fn next_deadline(&self) -> Option<Instant> {
        self.clients
            .iter()
            .enumerate()
            .filter(|(id, _)| !self.down.contains(&(*id as NodeId)))
            .filter_map(|(_, client)| client.engine().next_deadline())
            .chain(self.server.next_deadline())
            .min()
    }

    /// Runs the given query to completion: pumps messages until quiet,
    /// then advances virtual time to the next deadline, and repeats.
    ///
    /// # Panics
    /// Panics if the query does not finish within `max_steps` virtual
    /// timer steps.
    pub fn run_query(&mut self, query: QueryRequest, max_steps: usize) {
        self.server.start_query(query);
        for _ in 0..max_steps {
            while self.pump() {}
            if self.server.query_finished() {
                return;
            }
            let deadline = self
                .next_deadline()
                .expect("cluster is idle but the query has not finished");
            let now = deadline + Duration::from_millis(1);
            for (id, client) in self.clients.iter_mut().enumerate() {
                if !self.down.contains(&(id as NodeId)) {
                    client.fire_due_timers(now);
                }
            }
            self.server.fire_due_timers(now);
        }
        panic!("query did not finish within {} timer steps", max_steps);
    }
}
