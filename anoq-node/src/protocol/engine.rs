//! The per-client query protocol engine.
//!
//! One engine instance tracks one client's progress through the phases
//! IDLE → SETUP → SHUFFLE → AGREEMENT → AGGREGATE of a single query. It is
//! synchronous and single-threaded: the node's event loop feeds it
//! messages and timer expirations one at a time.
//!
//! Rounds advance when the round's final message arrives from the
//! predecessor, or on timeout. Phase transitions happen at fixed round
//! numbers derived from the cluster size, so honest nodes change phases in
//! lockstep without further coordination.

use std::{
    collections::HashSet,
    sync::Arc,
    time::{Duration, Instant},
};

use tracing::{debug, error, trace, warn};

use anoq_core::{
    common::ProtocolParams,
    crypto::CryptoEngine,
    data_source::DataSource,
    message::{
        AggregationMessage, MessageBody, OverlayMessage, OverlayTransportMessage, PingMessage,
        QueryRequest, SignatureRequest, SignatureResponse, SignedValue, ValueContribution,
        ValueTuple,
    },
    overlay::{find_paths, gossip_predecessor, gossip_target, pick_proxies},
    NodeId, Record,
};

use crate::{
    network::Network,
    protocol::{AggregationState, AgreementState},
    timers::{TimerHandle, Timers},
};

/// The maximum time any client waits for a message in an overlay round.
pub const OVERLAY_ROUND_TIMEOUT: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolPhase {
    Idle,
    Setup,
    Shuffle,
    Agreement,
    Aggregate,
}

/// Events delivered by the timer list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerEvent {
    RoundTimeout,
}

pub struct ProtocolEngine<R: Record, N> {
    id: NodeId,
    params: ProtocolParams,
    phase: ProtocolPhase,
    /// The current overlay round; −1 before the first round of a query.
    overlay_round: i32,
    /// True once this node has entered the aggregate phase and the overlay
    /// should not advance any further.
    is_last_round: bool,
    /// Peers that failed to accept a connection or a write this query.
    failed_ids: HashSet<NodeId>,
    ping_response_from_predecessor: bool,
    timers: Timers<TimerEvent>,
    round_timer: Option<TimerHandle>,

    /// Overlay messages received for a round (or query) we have not
    /// reached yet.
    future_overlay_messages: Vec<OverlayTransportMessage<R>>,
    /// Aggregation messages received before this node entered AGGREGATE.
    future_aggregation_messages: Vec<AggregationMessage<R>>,
    /// Messages held until some round's gossip edge points at their
    /// destination.
    waiting_messages: Vec<OverlayMessage<R>>,
    /// Messages generated by the protocol in the current round.
    outgoing_messages: Vec<OverlayMessage<R>>,

    current_query: Option<QueryRequest>,
    my_contribution: Option<ValueTuple<R>>,
    /// Contributions received as a proxy during SHUFFLE. Keyed by value
    /// *and* utility signature, so duplicates collapse while identical
    /// measurements from different contributors (distinct proxy sets)
    /// coexist.
    proxy_values: HashSet<Arc<ValueContribution<R>>>,
    agreement: Option<AgreementState<R>>,
    agreement_start_round: i32,
    /// The subset of `proxy_values` accepted by Crusader Agreement.
    accepted_proxy_values: HashSet<Arc<ValueContribution<R>>>,
    aggregation: Option<AggregationState<R>>,

    crypto: CryptoEngine,
    network: N,
}

impl<R: Record, N: Network<R>> ProtocolEngine<R, N> {
    pub fn new(id: NodeId, params: ProtocolParams, crypto: CryptoEngine, network: N) -> Self {
        Self {
            id,
            params,
            phase: ProtocolPhase::Idle,
            overlay_round: -1,
            is_last_round: false,
            failed_ids: HashSet::new(),
            ping_response_from_predecessor: false,
            timers: Timers::new(),
            round_timer: None,
            future_overlay_messages: Vec::new(),
            future_aggregation_messages: Vec::new(),
            waiting_messages: Vec::new(),
            outgoing_messages: Vec::new(),
            current_query: None,
            my_contribution: None,
            proxy_values: HashSet::new(),
            agreement: None,
            agreement_start_round: 0,
            accepted_proxy_values: HashSet::new(),
            aggregation: None,
            crypto,
            network,
        }
    }

    pub fn phase(&self) -> ProtocolPhase {
        self.phase
    }

    pub fn is_in_overlay_phase(&self) -> bool {
        matches!(self.phase, ProtocolPhase::Shuffle | ProtocolPhase::Agreement)
    }

    pub fn is_in_aggregate_phase(&self) -> bool {
        self.phase == ProtocolPhase::Aggregate
    }

    /// The query this engine is currently working on, or −1 when idle.
    pub fn current_query_num(&self) -> i32 {
        self.my_contribution
            .as_ref()
            .map_or(-1, |tuple| tuple.query_num)
    }

    pub fn current_overlay_round(&self) -> i32 {
        self.overlay_round
    }

    pub fn failed_ids(&self) -> &HashSet<NodeId> {
        &self.failed_ids
    }

    pub fn accepted_proxy_values(&self) -> &HashSet<Arc<ValueContribution<R>>> {
        &self.accepted_proxy_values
    }

    #[cfg(test)]
    pub(crate) fn proxy_value_count(&self) -> usize {
        self.proxy_values.len()
    }

    pub fn network_mut(&mut self) -> &mut N {
        &mut self.network
    }

    /// The earliest pending timer deadline, for the event loop to sleep
    /// until.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.timers.next_deadline()
    }

    /// Fires the expired timer, if any. At most one timer is ever pending
    /// (the round timeout), and firing it re-arms it, so this pops a single
    /// expiration; the event loop calls again if the next deadline has
    /// also passed.
    pub fn fire_due_timers(&mut self, now: Instant, data_source: &DataSource<R>) {
        if let Some(event) = self.timers.pop_expired(now) {
            match event {
                TimerEvent::RoundTimeout => self.handle_round_timeout(data_source),
            }
        }
    }

    /// Starts responding to a query with the given record: picks proxies,
    /// builds the value tuple, and sends it to the utility for blind
    /// signing (SETUP).
    pub fn start_query(&mut self, request: QueryRequest, contributed_data: R) {
        self.overlay_round = -1;
        self.is_last_round = false;
        self.ping_response_from_predecessor = false;
        self.cancel_round_timer();
        self.proxy_values.clear();
        self.accepted_proxy_values.clear();
        self.failed_ids.clear();
        self.waiting_messages.clear();
        self.outgoing_messages.clear();
        self.crypto.cancel_blind();

        let proxies = pick_proxies(self.id, self.params.num_aggregation_groups, self.params.num_nodes);
        trace!(id = self.id, ?proxies, "chose proxies");
        let tuple = ValueTuple {
            query_num: request.query_number,
            value: contributed_data,
            proxies,
        };

        self.aggregation = Some(AggregationState::new(self.id, self.params));
        self.agreement = Some(AgreementState::new(
            self.id,
            self.params,
            request.query_number,
        ));
        self.phase = ProtocolPhase::Setup;

        let blinded = match self.crypto.blind(&tuple) {
            Ok(blinded) => blinded,
            Err(e) => {
                error!(id = self.id, "could not blind the value tuple: {}", e);
                self.phase = ProtocolPhase::Idle;
                return;
            }
        };
        self.my_contribution = Some(tuple);
        self.current_query = Some(request);

        let request = SignatureRequest {
            sender_id: self.id,
            blinded_message: blinded,
        };
        if self.network.send_signature_request(request).is_err() {
            error!(id = self.id, "the utility is unreachable; abandoning the query");
            self.phase = ProtocolPhase::Idle;
        }
    }

    /// SETUP → SHUFFLE: unblind the utility's signature and multicast the
    /// now-signed contribution to the proxy set.
    pub fn handle_signature_response(
        &mut self,
        message: SignatureResponse,
        data_source: &DataSource<R>,
    ) {
        if self.phase != ProtocolPhase::Setup {
            warn!(
                id = self.id,
                "dropped a signature response outside of SETUP"
            );
            return;
        }
        let Some(tuple) = self.my_contribution.clone() else {
            return;
        };
        let signature = match self.crypto.unblind(&tuple, &message.blind_signature) {
            Ok(signature) => signature,
            Err(e) => {
                error!(id = self.id, "could not unblind the utility signature: {}", e);
                self.phase = ProtocolPhase::Idle;
                return;
            }
        };
        let contribution = Arc::new(ValueContribution::new(tuple, signature));
        debug!(id = self.id, "finished with Setup");
        self.phase = ProtocolPhase::Shuffle;
        self.encrypted_multicast_to_proxies(contribution, data_source);
    }

    /// Builds one onion per proxy over node-disjoint paths starting at
    /// round 0, then ends round −1 so the onions go out at the start of
    /// round 0.
    fn encrypted_multicast_to_proxies(
        &mut self,
        contribution: Arc<ValueContribution<R>>,
        data_source: &DataSource<R>,
    ) {
        let query_num = contribution.tuple.query_num;
        if contribution.tuple.proxies.contains(&self.id) {
            // Our own share of the multicast never touches the network.
            self.proxy_values.insert(contribution.clone());
        }
        let other_proxies: Vec<NodeId> = contribution
            .tuple
            .proxies
            .iter()
            .copied()
            .filter(|proxy| *proxy != self.id)
            .collect();
        let paths = find_paths(self.id, &other_proxies, self.params.num_nodes, 0);
        trace!(id = self.id, ?paths, "picked proxy paths");
        for path in paths {
            let payload = Arc::new(MessageBody::ValueContribution((*contribution).clone()));
            match self.crypto.build_onion(&path, payload, query_num) {
                Ok(onion) => self.outgoing_messages.push(onion),
                Err(e) => error!(id = self.id, "could not build an onion: {}", e),
            }
        }
        self.end_overlay_round(data_source);
    }

    /// Ends the current overlay round: applies any phase transition due at
    /// this round, then advances the round counter and transmits the next
    /// batch.
    pub fn end_overlay_round(&mut self, data_source: &DataSource<R>) {
        if self.phase == ProtocolPhase::Shuffle
            && self.overlay_round >= self.params.shuffle_rounds()
        {
            debug!(id = self.id, "finished with Shuffle");
            self.multicast_signed_values();
            self.agreement_start_round = self.overlay_round;
            self.phase = ProtocolPhase::Agreement;
        } else if self.phase == ProtocolPhase::Agreement
            && self.overlay_round
                >= self.agreement_start_round + self.params.agreement_phase2_rounds()
            && self
                .agreement
                .as_ref()
                .is_some_and(AgreementState::is_phase_1_finished)
        {
            debug!(id = self.id, "finished phase 2 of Agreement");
            if let Some(agreement) = self.agreement.as_mut() {
                self.accepted_proxy_values = agreement.finish_phase_2();
            }
            self.phase = ProtocolPhase::Aggregate;
            self.start_aggregate_phase(data_source);
        } else if self.phase == ProtocolPhase::Agreement
            && self.overlay_round
                >= self.agreement_start_round + self.params.agreement_phase1_rounds()
            && !self
                .agreement
                .as_ref()
                .is_some_and(AgreementState::is_phase_1_finished)
        {
            debug!(id = self.id, "finished phase 1 of Agreement");
            let accept_messages = match self.agreement.as_mut() {
                Some(agreement) => agreement.finish_phase_1(self.overlay_round, &self.crypto),
                None => Vec::new(),
            };
            self.outgoing_messages.extend(accept_messages);
        }

        self.common_end_overlay_round(data_source);
    }

    /// SHUFFLE → AGREEMENT: sign every contribution received as a proxy
    /// and multicast the signature to the contribution's other proxies.
    fn multicast_signed_values(&mut self) {
        let query_num = self.current_query_num();
        for proxy_value in &self.proxy_values {
            let signature = self.crypto.sign_contribution(proxy_value);
            let signed_value =
                SignedValue::with_signature(proxy_value.clone(), self.id, signature);

            let other_proxies: Vec<NodeId> = proxy_value
                .tuple
                .proxies
                .iter()
                .copied()
                .filter(|proxy| *proxy != self.id)
                .collect();
            // We send before we receive, so these paths start in the next
            // round.
            let paths = find_paths(
                self.id,
                &other_proxies,
                self.params.num_nodes,
                self.overlay_round + 1,
            );
            for path in paths {
                let mut message = OverlayMessage::with_path(
                    query_num,
                    &path,
                    Some(Arc::new(MessageBody::SignedValue(signed_value.clone()))),
                );
                let final_hop = *path.last().expect("paths are never empty");
                if let Err(e) = self.crypto.envelope_encrypt(&mut message, final_hop) {
                    error!(id = self.id, "could not encrypt a signed value: {}", e);
                    continue;
                }
                self.outgoing_messages.push(message);
            }
        }
    }

    fn common_end_overlay_round(&mut self, data_source: &DataSource<R>) {
        self.cancel_round_timer();
        // If the last round is ending, the only thing left is to stop the
        // timeout.
        if self.is_last_round {
            return;
        }

        self.overlay_round += 1;
        self.ping_response_from_predecessor = false;
        self.send_overlay_message_batch();

        self.round_timer = Some(
            self.timers
                .register(OVERLAY_ROUND_TIMEOUT, TimerEvent::RoundTimeout),
        );

        let predecessor = gossip_predecessor(self.id, self.overlay_round, self.params.num_nodes);
        if !self.failed_ids.contains(&predecessor) {
            // Whether this ping goes through is the most common way dead
            // peers get noticed.
            let ping = PingMessage {
                sender_id: self.id,
                is_response: false,
            };
            if self.network.send_ping(ping, predecessor).is_err() {
                debug!(id = self.id, predecessor, "detected that a peer is down");
                self.failed_ids.insert(predecessor);
            }
        }

        // Messages for this round may have arrived while we were still in
        // the previous one.
        let query_num = self.current_query_num();
        let round = self.overlay_round;
        let mut arrived = Vec::new();
        self.future_overlay_messages.retain(|message| {
            if message.sender_round == round && message.body.query_num == query_num {
                arrived.push(message.clone());
                false
            } else {
                true
            }
        });
        // Handling those can advance the round underneath us; if it did,
        // our own early-end check below is already stale.
        let round_before = self.overlay_round;
        for message in arrived {
            self.handle_overlay_message(message, data_source);
        }
        if round_before == self.overlay_round && self.failed_ids.contains(&predecessor) {
            trace!(
                id = self.id,
                predecessor,
                "ending round early, predecessor is dead"
            );
            self.end_overlay_round(data_source);
        }
    }

    /// Sends every waiting or just-generated message whose destination is
    /// this round's gossip target, or a dummy if there are none.
    fn send_overlay_message_batch(&mut self) {
        let comm_target = gossip_target(self.id, self.overlay_round, self.params.num_nodes);
        let mut batch: Vec<OverlayTransportMessage<R>> = Vec::new();

        let mut still_waiting = Vec::new();
        for message in self.waiting_messages.drain(..) {
            if message.destination == comm_target {
                batch.push(OverlayTransportMessage {
                    sender_id: self.id,
                    sender_round: self.overlay_round,
                    is_final_message: false,
                    body: message,
                });
            } else {
                still_waiting.push(message);
            }
        }
        self.waiting_messages = still_waiting;

        for message in self.outgoing_messages.drain(..) {
            if message.flood || message.destination == comm_target {
                batch.push(OverlayTransportMessage {
                    sender_id: self.id,
                    sender_round: self.overlay_round,
                    is_final_message: false,
                    body: message,
                });
            } else {
                self.waiting_messages.push(message);
            }
        }

        if batch.is_empty() {
            // An empty round still needs a message, or the target could
            // never advance.
            trace!(id = self.id, comm_target, "sending a dummy message");
            batch.push(OverlayTransportMessage {
                sender_id: self.id,
                sender_round: self.overlay_round,
                is_final_message: true,
                body: OverlayMessage::dummy(self.current_query_num(), comm_target),
            });
        } else {
            batch.last_mut().unwrap().is_final_message = true;
        }
        if self.network.send_batch(batch, comm_target).is_err() {
            debug!(id = self.id, comm_target, "detected that a peer is down");
            self.failed_ids.insert(comm_target);
        }
    }

    /// Processes one overlay transport message addressed to this node for
    /// the current round.
    pub fn handle_overlay_message(
        &mut self,
        message: OverlayTransportMessage<R>,
        data_source: &DataSource<R>,
    ) {
        if self.is_in_overlay_phase() {
            self.cancel_round_timer();
            self.round_timer = Some(
                self.timers
                    .register(OVERLAY_ROUND_TIMEOUT, TimerEvent::RoundTimeout),
            );
        }
        let mut overlay = message.body;
        if !overlay.remaining_path.is_empty() {
            // A source-routed message still in transit. Its body is
            // encrypted for the path's final hop, so it is forwarded
            // untouched.
            overlay.pop_next_hop();
            self.waiting_messages.push(overlay);
        } else {
            // With no path left, an encrypted body is encrypted for us:
            // either we are the destination, or this is our layer of an
            // onion.
            if overlay.is_encrypted {
                if let Err(e) = self.crypto.envelope_decrypt(&mut overlay) {
                    warn!(id = self.id, "could not decrypt an overlay message: {}", e);
                    overlay.body = None;
                }
            }
            if let Some(body) = overlay.body.clone() {
                match &*body {
                    // One onion layer peeled; the inner message waits for
                    // the round that reaches its destination.
                    MessageBody::Overlay(inner) => self.waiting_messages.push(inner.clone()),
                    _ if overlay.destination == self.id => match self.phase {
                        ProtocolPhase::Shuffle => self.handle_shuffle_phase_message(&body),
                        ProtocolPhase::Agreement => {
                            if let Some(agreement) = self.agreement.as_mut() {
                                agreement.handle_message(&body, &self.crypto);
                            }
                        }
                        _ => warn!(
                            id = self.id,
                            phase = ?self.phase,
                            "dropped an overlay payload outside SHUFFLE/AGREEMENT"
                        ),
                    },
                    // Addressed to someone else: a stray we have no use
                    // for.
                    _ => {}
                }
            }
        }

        if message.is_final_message && self.is_in_overlay_phase() {
            self.end_overlay_round(data_source);
        }
    }

    /// A proxy accepting a contribution during SHUFFLE: right query, valid
    /// utility signature, duplicates collapse.
    fn handle_shuffle_phase_message(&mut self, body: &MessageBody<R>) {
        match body {
            MessageBody::ValueContribution(contribution) => {
                if contribution.tuple.query_num != self.current_query_num() {
                    warn!(
                        id = self.id,
                        query_num = contribution.tuple.query_num,
                        "rejected a proxy value with the wrong query number"
                    );
                    return;
                }
                if !self
                    .crypto
                    .verify_utility(&contribution.tuple, &contribution.utility_signature)
                {
                    warn!(
                        id = self.id,
                        "rejected a proxy value with a bad utility signature"
                    );
                    return;
                }
                trace!(id = self.id, "received a proxy value");
                self.proxy_values.insert(Arc::new(contribution.clone()));
            }
            _ => {
                warn!(
                    id = self.id,
                    "rejected a shuffle message that was not a contribution"
                );
            }
        }
    }

    /// AGREEMENT → AGGREGATE.
    fn start_aggregate_phase(&mut self, data_source: &DataSource<R>) {
        // Done with the overlay; nothing to time out any more.
        self.cancel_round_timer();
        if let Some(aggregation) = self.aggregation.as_mut() {
            aggregation.initialize(&self.failed_ids);
        }
        // A leaf has no children to wait for and reports immediately.
        self.send_aggregate_if_done(data_source);
        if self.is_in_aggregate_phase() {
            let buffered = std::mem::take(&mut self.future_aggregation_messages);
            for message in buffered {
                self.handle_aggregation_message(message, data_source);
            }
        }
        self.is_last_round = true;
    }

    pub fn handle_aggregation_message(
        &mut self,
        message: AggregationMessage<R>,
        data_source: &DataSource<R>,
    ) {
        let Some(query) = self.current_query.clone() else {
            return;
        };
        if let Some(aggregation) = self.aggregation.as_mut() {
            aggregation.handle_message(&message, data_source, &query);
        }
        self.send_aggregate_if_done(data_source);
    }

    fn send_aggregate_if_done(&mut self, data_source: &DataSource<R>) {
        let Some(query) = self.current_query.clone() else {
            return;
        };
        let done = self
            .aggregation
            .as_ref()
            .is_some_and(AggregationState::done_receiving_from_children);
        if !done {
            return;
        }
        if let Some(aggregation) = self.aggregation.as_ref() {
            if let Err(e) = aggregation.compute_and_send(
                &self.accepted_proxy_values,
                data_source,
                &query,
                &mut self.network,
            ) {
                warn!(id = self.id, "could not report the aggregate: {}", e);
            }
        }
        self.phase = ProtocolPhase::Idle;
        debug!(id = self.id, "finished with Aggregate");
    }

    /// Liveness probing: answer requests, remember responses from the
    /// current predecessor.
    pub fn handle_ping_message(&mut self, message: PingMessage) {
        if !message.is_response {
            trace!(id = self.id, from = message.sender_id, "replying to a ping");
            let reply = PingMessage {
                sender_id: self.id,
                is_response: true,
            };
            if self.network.send_ping(reply, message.sender_id).is_err() {
                self.failed_ids.insert(message.sender_id);
            }
        } else if message.sender_id
            == gossip_predecessor(self.id, self.overlay_round, self.params.num_nodes)
        {
            self.ping_response_from_predecessor = true;
        }
    }

    /// No message arrived within the round budget. A predecessor that
    /// recently answered a ping gets more time; otherwise the round is
    /// abandoned.
    pub fn handle_round_timeout(&mut self, data_source: &DataSource<R>) {
        if self.ping_response_from_predecessor {
            self.ping_response_from_predecessor = false;
            let predecessor =
                gossip_predecessor(self.id, self.overlay_round, self.params.num_nodes);
            trace!(
                id = self.id,
                round = self.overlay_round,
                predecessor,
                "still waiting, predecessor is alive"
            );
            self.round_timer = Some(
                self.timers
                    .register(OVERLAY_ROUND_TIMEOUT, TimerEvent::RoundTimeout),
            );
            let ping = PingMessage {
                sender_id: self.id,
                is_response: false,
            };
            if self.network.send_ping(ping, predecessor).is_err() {
                debug!(
                    id = self.id,
                    predecessor, "predecessor went down after answering a ping"
                );
                self.failed_ids.insert(predecessor);
            }
        } else {
            debug!(
                id = self.id,
                round = self.overlay_round,
                "timed out waiting for an overlay message"
            );
            self.end_overlay_round(data_source);
        }
    }

    /// Stores an overlay message for a future round or query.
    pub fn buffer_future_overlay_message(&mut self, message: OverlayTransportMessage<R>) {
        self.future_overlay_messages.push(message);
    }

    /// Stores an aggregation message until this node reaches AGGREGATE.
    pub fn buffer_future_aggregation_message(&mut self, message: AggregationMessage<R>) {
        self.future_aggregation_messages.push(message);
    }

    fn cancel_round_timer(&mut self) {
        if let Some(handle) = self.round_timer.take() {
            self.timers.cancel(handle);
        }
    }
}
