//! The client node: owns the data source and the protocol engine, and
//! routes incoming messages to the right engine entry point.

use std::time::Instant;

use anyhow::Context;
use tokio::{sync::mpsc, time::sleep_until};
use tracing::{debug, info, warn};

use anoq_core::{
    common::ProtocolParams,
    crypto::CryptoEngine,
    data_source::DataSource,
    message::{AggregationMessage, Message, OverlayTransportMessage, QueryRequest},
    overlay::{aggregation_group_for, gossip_target},
    NodeId, Record,
};

use crate::{
    network::{spawn_listener, Network, TcpMessenger},
    protocol::ProtocolEngine,
    settings::{ClientList, Settings},
};

pub struct ClientNode<R: Record, N> {
    id: NodeId,
    params: ProtocolParams,
    data_source: DataSource<R>,
    engine: ProtocolEngine<R, N>,
}

impl<R: Record, N: Network<R>> ClientNode<R, N> {
    pub fn new(
        id: NodeId,
        params: ProtocolParams,
        crypto: CryptoEngine,
        network: N,
        data_source: DataSource<R>,
    ) -> Self {
        Self {
            id,
            params,
            data_source,
            engine: ProtocolEngine::new(id, params, crypto, network),
        }
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn engine(&self) -> &ProtocolEngine<R, N> {
        &self.engine
    }

    pub fn engine_mut(&mut self) -> &mut ProtocolEngine<R, N> {
        &mut self.engine
    }

    /// Fires any expired engine timers.
    pub fn fire_due_timers(&mut self, now: Instant) {
        self.engine.fire_due_timers(now, &self.data_source);
    }

    /// Routes one received message.
    pub fn handle_message(&mut self, message: Message<R>) {
        match message {
            Message::QueryRequest(request) => self.handle_query_request(request),
            Message::Overlay(transport) => self.handle_overlay_transport(transport),
            Message::Aggregation(aggregation) => self.handle_aggregation(aggregation),
            Message::Ping(ping) => self.engine.handle_ping_message(ping),
            Message::SignatureResponse(response) => self
                .engine
                .handle_signature_response(response, &self.data_source),
            Message::SignatureRequest(_) => {
                warn!(
                    id = self.id,
                    "received a signature request, which only the server can handle"
                );
            }
        }
    }

    /// Runs the query's select and filter functions; a record that passes
    /// both enters the protocol.
    fn handle_query_request(&mut self, request: QueryRequest) {
        let Some(record) = self.data_source.select(
            request.select_function_opcode,
            &request.select_serialized_args,
        ) else {
            warn!(
                id = self.id,
                opcode = request.select_function_opcode,
                "no select function registered; ignoring the query"
            );
            return;
        };
        match self.data_source.filter(
            request.filter_function_opcode,
            &record,
            &request.filter_serialized_args,
        ) {
            Some(true) => self.engine.start_query(request, record),
            Some(false) => {
                debug!(
                    id = self.id,
                    query = request.query_number,
                    "filter rejected the selected record; not contributing"
                );
            }
            None => {
                warn!(
                    id = self.id,
                    opcode = request.filter_function_opcode,
                    "no filter function registered; ignoring the query"
                );
            }
        }
    }

    /// Admits an overlay message only if it really belongs on the edge
    /// `sender → self` of its claimed round, then orders it relative to
    /// our own progress: buffer what is early, drop what is late.
    fn handle_overlay_transport(&mut self, transport: OverlayTransportMessage<R>) {
        let expected_target = gossip_target(
            transport.sender_id,
            transport.sender_round,
            self.params.num_nodes,
        );
        if expected_target != self.id {
            warn!(
                id = self.id,
                sender = transport.sender_id,
                "rejected an overlay message with the wrong gossip target"
            );
            return;
        }
        let current_query = self.engine.current_query_num();
        let message_query = transport.body.query_num;
        if message_query > current_query {
            // For a query we have not heard of yet; keep it until the
            // query-start message arrives.
            self.engine.buffer_future_overlay_message(transport);
        } else if message_query < current_query {
            warn!(
                id = self.id,
                sender = transport.sender_id,
                message_query,
                "discarded an obsolete overlay message"
            );
        } else if transport.sender_round == self.engine.current_overlay_round() {
            self.engine
                .handle_overlay_message(transport, &self.data_source);
        } else if transport.sender_round > self.engine.current_overlay_round() {
            self.engine.buffer_future_overlay_message(transport);
        } else {
            debug!(
                id = self.id,
                sender = transport.sender_id,
                sender_round = transport.sender_round,
                round = self.engine.current_overlay_round(),
                "rejected an overlay message as too old"
            );
        }
    }

    /// Aggregation messages only make sense from our own reduction
    /// subtree; early ones are buffered until AGGREGATE starts.
    fn handle_aggregation(&mut self, message: AggregationMessage<R>) {
        let groups = self.params.num_aggregation_groups;
        let n = self.params.num_nodes;
        if aggregation_group_for(message.sender_id, groups, n)
            != aggregation_group_for(self.id, groups, n)
        {
            return;
        }
        if self.engine.is_in_aggregate_phase() {
            self.engine
                .handle_aggregation_message(message, &self.data_source);
        } else if message.query_num == self.engine.current_query_num() {
            self.engine.buffer_future_aggregation_message(message);
        } else {
            warn!(
                id = self.id,
                sender = message.sender_id,
                query = message.query_num,
                "rejected an aggregation message with the wrong query number"
            );
        }
    }
}

/// Builds a client from its settings and runs it until the process is
/// stopped. The application supplies the data source.
pub async fn run_client<R: Record>(
    settings: &Settings,
    data_source: DataSource<R>,
) -> anyhow::Result<()> {
    let setup = &settings.setup;
    let id = setup
        .client_id
        .context("client_id is required to run a client")?;
    let client_list = ClientList::load(&setup.client_list_file)?;
    let num_clients = client_list.num_clients();
    let params = ProtocolParams::new(num_clients);
    let crypto = CryptoEngine::from_files(
        &setup.private_key_file,
        &setup.key_paths(num_clients),
    )?;
    let messenger = TcpMessenger::new(id, client_list.addresses_with_utility(setup.server_port));

    let (messages_tx, mut messages_rx) = mpsc::channel::<Message<R>>(1024);
    spawn_listener(setup.client_port, messages_tx, true)
        .await
        .context("could not bind the client port")?;
    info!(id, num_clients, port = setup.client_port, "client listening");

    let mut node = ClientNode::new(id, params, crypto, messenger, data_source);
    loop {
        let deadline = node.engine().next_deadline();
        tokio::select! {
            received = messages_rx.recv() => match received {
                Some(message) => node.handle_message(message),
                None => break,
            },
            _ = sleep_until(tokio::time::Instant::from_std(
                deadline.unwrap_or_else(Instant::now),
            )), if deadline.is_some() => {
                node.fire_due_timers(Instant::now());
            }
        }
    }
    Ok(())
}
