//! The utility: issues queries, answers blind-signing requests, and votes
//! on the results reported by the aggregation-tree roots.

use std::{
    cmp::Reverse,
    collections::{BinaryHeap, BTreeMap, HashSet},
    time::{Duration, Instant},
};

use anyhow::Context;
use tokio::{sync::mpsc, time::sleep_until};
use tracing::{debug, error, info, trace, warn};

use anoq_core::{
    common::ProtocolParams,
    crypto::CryptoEngine,
    message::{AggregationMessage, Message, QueryRequest, SignatureRequest, SignatureResponse},
    NodeId, Record, UTILITY_NODE_ID,
};

use crate::{
    network::{spawn_listener, Network, TcpMessenger},
    settings::{ClientList, Settings},
    timers::{TimerHandle, Timers},
};

/// The maximum time the utility is willing to wait on one network round
/// trip.
pub const NETWORK_ROUNDTRIP_TIMEOUT: Duration = Duration::from_millis(100);

/// Runs when a query completes, with the voted result (or `None` if the
/// query failed).
pub type QueryCallback<R> = Box<dyn FnMut(i32, Option<&R>) + Send>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerTimerEvent {
    QueryTimeout,
}

/// Orders queued queries by query number (lowest first via `Reverse`).
struct QueuedQuery(QueryRequest);

impl PartialEq for QueuedQuery {
    fn eq(&self, other: &Self) -> bool {
        self.0.query_number == other.0.query_number
    }
}
impl Eq for QueuedQuery {}
impl PartialOrd for QueuedQuery {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for QueuedQuery {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.0.query_number.cmp(&other.0.query_number)
    }
}

pub struct ServerNode<R: Record, N> {
    params: ProtocolParams,
    crypto: CryptoEngine,
    network: N,
    timers: Timers<ServerTimerEvent>,
    query_timer: Option<TimerHandle>,
    /// Budget for a whole query, armed when the query starts.
    query_timeout: Duration,
    /// Budget between two result messages once results are flowing.
    next_result_timeout: Duration,

    query_num: i32,
    query_finished: bool,
    /// This query's results in arrival order; the multiset for voting.
    curr_query_results: Vec<AggregationMessage<R>>,
    /// Clients already given a blind signature this query.
    curr_query_meters_signed: HashSet<NodeId>,
    /// Voted results of all finished queries, indexed by query number.
    all_query_results: Vec<Option<AggregationMessage<R>>>,
    query_callbacks: BTreeMap<u32, QueryCallback<R>>,
    next_callback_id: u32,
    pending_batch_queries: BinaryHeap<Reverse<QueuedQuery>>,
}

impl<R: Record, N: Network<R>> ServerNode<R, N> {
    pub fn new(params: ProtocolParams, crypto: CryptoEngine, network: N) -> Self {
        let rounds = params.rounds_for_query() as u32;
        // The per-result budget degenerates to zero when every node is its
        // own aggregation group, so clamp it to one round trip.
        let result_rounds = params.aggregation_tree_depth().max(1) as u32;
        Self {
            params,
            crypto,
            network,
            timers: Timers::new(),
            query_timer: None,
            query_timeout: NETWORK_ROUNDTRIP_TIMEOUT * rounds,
            next_result_timeout: NETWORK_ROUNDTRIP_TIMEOUT * result_rounds,
            query_num: -1,
            query_finished: true,
            curr_query_results: Vec::new(),
            curr_query_meters_signed: HashSet::new(),
            all_query_results: Vec::new(),
            query_callbacks: BTreeMap::new(),
            next_callback_id: 0,
            pending_batch_queries: BinaryHeap::new(),
        }
    }

    pub fn network_mut(&mut self) -> &mut N {
        &mut self.network
    }

    /// The voted result of a completed query, if the query succeeded.
    pub fn query_result(&self, query_num: i32) -> Option<&R> {
        self.all_query_results
            .get(query_num as usize)
            .and_then(Option::as_ref)
            .map(|result| &result.value)
    }

    /// How many records contributed to a completed query's result.
    pub fn query_contributors(&self, query_num: i32) -> Option<i32> {
        self.all_query_results
            .get(query_num as usize)
            .and_then(Option::as_ref)
            .map(|result| result.num_contributors)
    }

    pub fn query_finished(&self) -> bool {
        self.query_finished
    }

    /// Registers a callback to run at the end of every query; returns an
    /// id for [`deregister_query_callback`](Self::deregister_query_callback).
    pub fn register_query_callback(&mut self, callback: QueryCallback<R>) -> u32 {
        let id = self.next_callback_id;
        self.next_callback_id += 1;
        self.query_callbacks.insert(id, callback);
        id
    }

    pub fn deregister_query_callback(&mut self, id: u32) -> bool {
        self.query_callbacks.remove(&id).is_some()
    }

    /// Broadcasts one query to every client and arms the query timeout.
    /// Must not be called while a query is still in progress.
    pub fn start_query(&mut self, query: QueryRequest) {
        self.curr_query_meters_signed.clear();
        self.curr_query_results.clear();
        self.query_num = query.query_number;
        self.query_finished = false;
        info!(query = self.query_num, "starting query");
        for client in 0..self.params.num_nodes {
            if self
                .network
                .send_query_request(query.clone(), client)
                .is_err()
            {
                debug!(client, "client unreachable at query start");
            }
        }
        self.arm_query_timer(self.query_timeout);
    }

    /// Enqueues a batch of queries and starts the lowest-numbered one;
    /// the rest follow serially as their predecessors finish.
    pub fn start_queries(&mut self, queries: Vec<QueryRequest>) {
        if queries.is_empty() {
            return;
        }
        for query in queries {
            self.pending_batch_queries.push(Reverse(QueuedQuery(query)));
        }
        if let Some(Reverse(QueuedQuery(first))) = self.pending_batch_queries.pop() {
            self.start_query(first);
        }
    }

    pub fn handle_message(&mut self, message: Message<R>) {
        match message {
            Message::SignatureRequest(request) => self.handle_signature_request(request),
            Message::Aggregation(aggregation) => self.handle_aggregation_message(aggregation),
            Message::Overlay(_) => warn!("server ignoring an overlay transport message"),
            Message::Ping(_) => warn!("server ignoring a ping message"),
            Message::QueryRequest(_) => warn!("server ignoring a query request"),
            Message::SignatureResponse(_) => warn!("server ignoring a signature response"),
        }
    }

    /// Blindly signs a client's value tuple, at most once per client per
    /// query.
    fn handle_signature_request(&mut self, request: SignatureRequest) {
        if self.curr_query_meters_signed.contains(&request.sender_id) {
            warn!(
                client = request.sender_id,
                "refused a second blind signature this query"
            );
            return;
        }
        let blind_signature = match self.crypto.sign_blinded(&request.blinded_message) {
            Ok(signature) => signature,
            Err(e) => {
                error!(client = request.sender_id, "blind signing failed: {}", e);
                return;
            }
        };
        let response = SignatureResponse {
            sender_id: UTILITY_NODE_ID,
            blind_signature,
        };
        if self
            .network
            .send_signature_response(response, request.sender_id)
            .is_err()
        {
            debug!(client = request.sender_id, "client unreachable for signature response");
            return;
        }
        self.curr_query_meters_signed.insert(request.sender_id);
    }

    /// Collects one result from an aggregation-group root. The query
    /// finishes early once every group has reported; otherwise each result
    /// re-arms a shorter timer for the next one.
    fn handle_aggregation_message(&mut self, message: AggregationMessage<R>) {
        if message.query_num != self.query_num {
            warn!(
                sender = message.sender_id,
                query = message.query_num,
                "dropped a result for the wrong query"
            );
            return;
        }
        trace!(sender = message.sender_id, "received an aggregation result");
        self.curr_query_results.push(message);
        self.cancel_query_timer();
        if !self.query_finished
            && self.curr_query_results.len() > 2 * self.params.failures_tolerated as usize
        {
            self.end_query();
        }
        if !self.query_finished {
            self.arm_query_timer(self.next_result_timeout);
        }
    }

    /// Picks the first result (in arrival order) reported identically by
    /// at least `failures_tolerated + 1` group roots, records it, and
    /// starts the next batched query if one is pending.
    fn end_query(&mut self) {
        let quorum = self.params.result_quorum();
        let winner = self
            .curr_query_results
            .iter()
            .find(|result| {
                self.curr_query_results
                    .iter()
                    .filter(|other| other == result)
                    .count()
                    >= quorum
            })
            .cloned();
        self.curr_query_results.clear();

        let index = self.query_num as usize;
        if self.all_query_results.len() <= index {
            self.all_query_results.resize(index + 1, None);
        }
        match &winner {
            Some(result) => {
                info!(
                    query = self.query_num,
                    contributors = result.num_contributors,
                    "query finished"
                );
                self.all_query_results[index] = Some(result.clone());
            }
            None => {
                error!(
                    query = self.query_num,
                    "query failed: no result reached the vote threshold by the timeout"
                );
            }
        }
        self.query_finished = true;
        self.cancel_query_timer();

        let value = winner.as_ref().map(|result| &result.value);
        for callback in self.query_callbacks.values_mut() {
            callback(self.query_num, value);
        }

        if let Some(Reverse(QueuedQuery(next))) = self.pending_batch_queries.pop() {
            self.start_query(next);
        }
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.timers.next_deadline()
    }

    /// Fires the expired timer, if any. Only one query timer is ever
    /// pending, so this pops a single expiration.
    pub fn fire_due_timers(&mut self, now: Instant) {
        if let Some(event) = self.timers.pop_expired(now) {
            match event {
                ServerTimerEvent::QueryTimeout => {
                    debug!(
                        query = self.query_num,
                        results = self.curr_query_results.len(),
                        "query timed out"
                    );
                    self.end_query();
                }
            }
        }
    }

    fn arm_query_timer(&mut self, timeout: Duration) {
        self.cancel_query_timer();
        self.query_timer = Some(self.timers.register(timeout, ServerTimerEvent::QueryTimeout));
    }

    fn cancel_query_timer(&mut self) {
        if let Some(handle) = self.query_timer.take() {
            self.timers.cancel(handle);
        }
    }
}

/// Commands the application can feed to a running server.
pub enum ServerCommand<R> {
    StartQuery(QueryRequest),
    StartQueries(Vec<QueryRequest>),
    RegisterCallback(QueryCallback<R>),
}

/// Builds the utility from its settings and runs it until the command
/// channel closes and all queries have finished.
pub async fn run_server<R: Record>(
    settings: &Settings,
    mut commands: mpsc::Receiver<ServerCommand<R>>,
) -> anyhow::Result<()> {
    let setup = &settings.setup;
    let client_list = ClientList::load(&setup.client_list_file)?;
    let num_clients = client_list.num_clients();
    let params = ProtocolParams::new(num_clients);
    let crypto = CryptoEngine::from_files(
        &setup.private_key_file,
        &setup.key_paths(num_clients),
    )?;
    let messenger = TcpMessenger::new(
        UTILITY_NODE_ID,
        client_list.addresses_with_utility(setup.server_port),
    );

    let (messages_tx, mut messages_rx) = mpsc::channel::<Message<R>>(1024);
    spawn_listener(setup.server_port, messages_tx, false)
        .await
        .context("could not bind the server port")?;
    info!(num_clients, port = setup.server_port, "utility listening");

    let mut server = ServerNode::new(params, crypto, messenger);
    let mut commands_open = true;
    loop {
        if !commands_open && server.query_finished() {
            break;
        }
        let deadline = server.next_deadline();
        tokio::select! {
            command = commands.recv(), if commands_open => match command {
                Some(ServerCommand::StartQuery(query)) => server.start_query(query),
                Some(ServerCommand::StartQueries(queries)) => server.start_queries(queries),
                Some(ServerCommand::RegisterCallback(callback)) => {
                    server.register_query_callback(callback);
                }
                None => commands_open = false,
            },
            received = messages_rx.recv() => match received {
                Some(message) => server.handle_message(message),
                None => break,
            },
            _ = sleep_until(tokio::time::Instant::from_std(
                deadline.unwrap_or_else(Instant::now),
            )), if deadline.is_some() => {
                server.fire_due_timers(Instant::now());
            }
        }
    }
    Ok(())
}
