//! Whole-protocol tests: clusters of real engines wired over in-memory
//! networks, driven by explicit message pumping and virtual time.

use std::sync::{Arc, Mutex};

use anoq_core::{
    message::{Message, MessageBody, OverlayMessage, OverlayTransportMessage, SignatureResponse},
    testutils::{crypto_engines, dummy_contribution, signed_contribution, utility_engine, value_tuple},
    UTILITY_NODE_ID,
};

use crate::{
    protocol::ProtocolEngine,
    testutils::{sum_data_source, sum_query, InMemoryNetwork, TestCluster},
};

const MAX_TIMER_STEPS: usize = 400;

#[test]
fn sum_query_over_seven_clients() {
    // Seven clients contribute their own ids; the sum is 21 from 7
    // contributors.
    let mut cluster = TestCluster::new(&[0, 1, 2, 3, 4, 5, 6]);
    cluster.run_query(sum_query(0), MAX_TIMER_STEPS);
    assert_eq!(cluster.server.query_result(0), Some(&21));
    assert_eq!(cluster.server.query_contributors(0), Some(7));
}

#[test]
fn crashed_client_is_detected_and_excluded() {
    let mut cluster = TestCluster::new(&[0, 1, 2, 3, 4, 5, 6]);
    cluster.take_down(3);
    cluster.run_query(sum_query(0), MAX_TIMER_STEPS);

    // Client 3's own contribution is gone, and so is client 2's: every
    // multicast path shares the first hop gossip_target(src, 0), and for
    // client 2 that hop *is* the dead node. Everything else survives, the
    // remaining six complete the query, and the quorum agrees.
    assert_eq!(cluster.server.query_result(0), Some(&(0 + 1 + 4 + 5 + 6)));
    assert_eq!(cluster.server.query_contributors(0), Some(5));
    assert!(
        cluster
            .clients
            .iter()
            .enumerate()
            .filter(|(id, _)| *id != 3)
            .any(|(_, client)| client.engine().failed_ids().contains(&3)),
        "someone should have noticed that client 3 is down"
    );
}

#[test]
fn forged_utility_signature_is_excluded_from_the_result() {
    // Client 2 runs the protocol but its contribution is signed by a key
    // that is not the utility's; every proxy drops it.
    let mut cluster = TestCluster::new(&[0, 1, 2, 3, 4, 5, 6]);
    cluster.make_rogue(2, 2);
    cluster.run_query(sum_query(0), MAX_TIMER_STEPS);

    assert_eq!(cluster.server.query_result(0), Some(&19));
    assert_eq!(cluster.server.query_contributors(0), Some(6));
}

#[test]
fn bogus_contributions_from_a_tolerated_minority_do_not_move_the_result() {
    // Two rogues push large bogus values; the voted result is the honest
    // aggregate.
    let mut cluster = TestCluster::new(&[0, 1, 2, 3, 4, 5, 6]);
    cluster.make_rogue(1, 1_000_000);
    cluster.make_rogue(4, -1_000_000);
    cluster.run_query(sum_query(0), MAX_TIMER_STEPS);

    assert_eq!(cluster.server.query_result(0), Some(&(0 + 2 + 3 + 5 + 6)));
    assert_eq!(cluster.server.query_contributors(0), Some(5));
}

#[test]
fn five_node_cluster_completes() {
    // N = 5 is prime but smaller than 2*FT + 1 = 7 groups; the empty
    // groups must not stop the query.
    let mut cluster = TestCluster::new(&[10, 20, 30, 40, 50]);
    cluster.run_query(sum_query(0), MAX_TIMER_STEPS);
    assert_eq!(cluster.server.query_result(0), Some(&150));
    assert_eq!(cluster.server.query_contributors(0), Some(5));
}

#[test]
fn batched_queries_run_lowest_number_first() {
    let mut cluster = TestCluster::new(&[0, 1, 2, 3, 4, 5, 6]);
    let finished: Arc<Mutex<Vec<i32>>> = Arc::new(Mutex::new(Vec::new()));
    let finished_order = finished.clone();
    cluster
        .server
        .register_query_callback(Box::new(move |query_num, _| {
            finished_order.lock().unwrap().push(query_num);
        }));

    cluster
        .server
        .start_queries(vec![sum_query(7), sum_query(3), sum_query(5)]);
    for _ in 0..MAX_TIMER_STEPS {
        while cluster.pump() {}
        if finished.lock().unwrap().len() == 3 {
            break;
        }
        // No deadline means the batch is over (or something is wrong, and
        // the assertions below will say so).
        let now = match cluster
            .clients
            .iter()
            .filter_map(|client| client.engine().next_deadline())
            .chain(cluster.server.next_deadline())
            .min()
        {
            Some(deadline) => deadline + std::time::Duration::from_millis(1),
            None => break,
        };
        for client in &mut cluster.clients {
            client.fire_due_timers(now);
        }
        cluster.server.fire_due_timers(now);
    }

    assert_eq!(*finished.lock().unwrap(), vec![3, 5, 7]);
    for query_num in [3, 5, 7] {
        assert_eq!(cluster.server.query_result(query_num), Some(&21));
    }
}

#[test]
fn identical_records_with_distinct_contributors_both_count() {
    // Clients 0 and 1 contribute the same measurement; both must survive
    // deduplication and both must be aggregated.
    let mut cluster = TestCluster::new(&[9, 9, 2, 3, 4, 5, 6]);
    cluster.run_query(sum_query(0), MAX_TIMER_STEPS);
    assert_eq!(cluster.server.query_result(0), Some(&(9 + 9 + 2 + 3 + 4 + 5 + 6)));
    assert_eq!(cluster.server.query_contributors(0), Some(7));
}

/// Drives a lone engine through SETUP into SHUFFLE against a real utility
/// engine, so shuffle-phase acceptance can be probed directly.
fn engine_in_shuffle() -> ProtocolEngine<i64, InMemoryNetwork<i64>> {
    let params = anoq_core::common::ProtocolParams::new(7);
    let crypto = crypto_engines(7).into_iter().nth(3).unwrap();
    let utility = utility_engine(7);
    let data_source = sum_data_source();

    let mut engine = ProtocolEngine::new(3, params, crypto, InMemoryNetwork::new(3));
    engine.start_query(sum_query(0), 3);

    let sent = engine.network_mut().take_sent();
    let blinded = match &sent[..] {
        [(UTILITY_NODE_ID, Message::SignatureRequest(request))] => request.blinded_message.clone(),
        other => panic!("expected a signature request, got {:?}", other.len()),
    };
    let response = SignatureResponse {
        sender_id: UTILITY_NODE_ID,
        blind_signature: utility.sign_blinded(&blinded).unwrap(),
    };
    engine.handle_signature_response(response, &data_source);
    assert!(engine.is_in_overlay_phase());
    engine
}

#[test]
fn shuffle_accepts_valid_and_drops_forged_contributions() {
    let mut engine = engine_in_shuffle();
    let data_source = sum_data_source();
    // With 7 nodes every client proxies for everyone, including itself.
    assert_eq!(engine.proxy_value_count(), 1);

    // A forged contribution: syntactically fine, but its utility
    // signature verifies under nobody's key.
    let forged = OverlayTransportMessage {
        sender_id: 2,
        sender_round: 0,
        is_final_message: false,
        body: OverlayMessage::new(
            0,
            3,
            Some(Arc::new(MessageBody::ValueContribution(dummy_contribution(
                0,
                99i64,
                (0..7).collect(),
            )))),
        ),
    };
    engine.handle_overlay_message(forged, &data_source);
    assert_eq!(engine.proxy_value_count(), 1);

    // The real thing from client 2.
    let mut client2 = crypto_engines(7).into_iter().nth(2).unwrap();
    let utility = utility_engine(7);
    let contribution =
        signed_contribution(&mut client2, &utility, value_tuple(0, 2i64, (0..7).collect()));
    let valid = OverlayTransportMessage {
        sender_id: 2,
        sender_round: 0,
        is_final_message: false,
        body: OverlayMessage::new(
            0,
            3,
            Some(Arc::new(MessageBody::ValueContribution(contribution.clone()))),
        ),
    };
    engine.handle_overlay_message(valid, &data_source);
    assert_eq!(engine.proxy_value_count(), 2);

    // Delivering the same contribution again changes nothing.
    let duplicate = OverlayTransportMessage {
        sender_id: 2,
        sender_round: 0,
        is_final_message: false,
        body: OverlayMessage::new(
            0,
            3,
            Some(Arc::new(MessageBody::ValueContribution(contribution))),
        ),
    };
    engine.handle_overlay_message(duplicate, &data_source);
    assert_eq!(engine.proxy_value_count(), 2);
}

#[test]
fn wrong_query_number_is_rejected_in_shuffle() {
    let mut engine = engine_in_shuffle();
    let data_source = sum_data_source();

    let mut client2 = crypto_engines(7).into_iter().nth(2).unwrap();
    let utility = utility_engine(7);
    let stale = signed_contribution(&mut client2, &utility, value_tuple(5, 2i64, (0..7).collect()));
    let transport = OverlayTransportMessage {
        sender_id: 2,
        sender_round: 0,
        is_final_message: false,
        body: OverlayMessage::new(
            5,
            3,
            Some(Arc::new(MessageBody::ValueContribution(stale)))),
    };
    engine.handle_overlay_message(transport, &data_source);
    assert_eq!(engine.proxy_value_count(), 1);
}
