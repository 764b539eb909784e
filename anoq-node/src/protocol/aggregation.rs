//! Binary-tree reduction of accepted values toward the utility.
//!
//! Each node combines the intermediate results of its (up to two) tree
//! children with its own accepted proxy values, then reports one value and
//! a contributor count to its parent. Group roots report to the utility.
//! The contributor count is conserved: a parent's count is the sum of its
//! children's counts plus its own accepted values.

use std::{collections::HashSet, sync::Arc};

use tracing::{trace, warn};

use anoq_core::{
    common::ProtocolParams,
    data_source::DataSource,
    message::{AggregationMessage, QueryRequest, ValueContribution},
    overlay::{aggregation_tree_children, aggregation_tree_parent},
    NodeId, Record,
};

use crate::network::{Network, NetworkError};

#[derive(Debug)]
pub struct AggregationState<R> {
    node_id: NodeId,
    params: ProtocolParams,
    initialized: bool,
    children_needed: i32,
    children_received_from: i32,
    /// The combined value and contributor count received from children so
    /// far.
    intermediate: Option<(R, i32)>,
}

impl<R: Record> AggregationState<R> {
    pub fn new(node_id: NodeId, params: ProtocolParams) -> Self {
        Self {
            node_id,
            params,
            initialized: false,
            children_needed: 0,
            children_received_from: 0,
            intermediate: None,
        }
    }

    /// Computes how many children this node still expects, given the peers
    /// already known to have failed. Called when the aggregate phase
    /// starts.
    pub fn initialize(&mut self, failed_ids: &HashSet<NodeId>) {
        let (left, right) = aggregation_tree_children(
            self.node_id,
            self.params.num_aggregation_groups,
            self.params.num_nodes,
        );
        self.children_needed = [left, right]
            .into_iter()
            .flatten()
            .filter(|child| !failed_ids.contains(child))
            .count() as i32;
        self.children_received_from = 0;
        self.intermediate = None;
        self.initialized = true;
        trace!(
            node_id = self.node_id,
            children_needed = self.children_needed,
            "aggregation initialized"
        );
    }

    pub fn done_receiving_from_children(&self) -> bool {
        self.initialized && self.children_received_from >= self.children_needed
    }

    /// Folds one child's intermediate result into ours.
    pub fn handle_message(
        &mut self,
        message: &AggregationMessage<R>,
        data_source: &DataSource<R>,
        query: &QueryRequest,
    ) {
        self.intermediate = match self.intermediate.take() {
            None => Some((message.value.clone(), message.num_contributors)),
            Some((value, count)) => {
                let combined = data_source.aggregate(
                    query.aggregate_function_opcode,
                    &[value.clone(), message.value.clone()],
                    &query.aggregate_serialized_args,
                );
                match combined {
                    Some(combined) => Some((combined, count + message.num_contributors)),
                    None => {
                        warn!(
                            opcode = query.aggregate_function_opcode,
                            "no aggregate function registered; dropping child value"
                        );
                        Some((value, count))
                    }
                }
            }
        };
        self.children_received_from += 1;
    }

    /// Combines the intermediate value with every accepted proxy value and
    /// sends the result to the tree parent (possibly the utility).
    ///
    /// A node with nothing to report still sends a zero-contributor
    /// message, so its parent can tell "empty" from "failed".
    pub fn compute_and_send<N: Network<R>>(
        &self,
        accepted_values: &HashSet<Arc<ValueContribution<R>>>,
        data_source: &DataSource<R>,
        query: &QueryRequest,
        network: &mut N,
    ) -> Result<(), NetworkError> {
        let mut values: Vec<R> = Vec::with_capacity(accepted_values.len() + 1);
        let mut num_contributors = accepted_values.len() as i32;
        if let Some((value, count)) = &self.intermediate {
            values.push(value.clone());
            num_contributors += count;
        }
        values.extend(
            accepted_values
                .iter()
                .map(|contribution| contribution.tuple.value.clone()),
        );

        let Some(result) = data_source.aggregate(
            query.aggregate_function_opcode,
            &values,
            &query.aggregate_serialized_args,
        ) else {
            warn!(
                opcode = query.aggregate_function_opcode,
                "no aggregate function registered; no result to report"
            );
            return Ok(());
        };

        let parent = aggregation_tree_parent(
            self.node_id,
            self.params.num_aggregation_groups,
            self.params.num_nodes,
        );
        trace!(
            node_id = self.node_id,
            parent,
            num_contributors,
            "reporting aggregate"
        );
        network.send_aggregation(
            AggregationMessage {
                sender_id: self.node_id,
                query_num: query.query_number,
                num_contributors,
                value: result,
            },
            parent,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutils::{sum_data_source, sum_query, InMemoryNetwork};
    use anoq_core::{testutils::dummy_contribution, UTILITY_NODE_ID};

    fn params() -> ProtocolParams {
        // 23 nodes, 7 groups: group 0 is {0, 1, 2, 3} with 0 as its root.
        ProtocolParams::new(23)
    }

    fn child_message(sender_id: NodeId, value: i64, num_contributors: i32) -> AggregationMessage<i64> {
        AggregationMessage {
            sender_id,
            query_num: 0,
            num_contributors,
            value,
        }
    }

    #[test]
    fn contributor_counts_are_conserved() {
        let data_source = sum_data_source();
        let query = sum_query(0);
        let mut state = AggregationState::new(0, params());
        state.initialize(&HashSet::new());
        assert!(!state.done_receiving_from_children());

        state.handle_message(&child_message(1, 10, 3), &data_source, &query);
        state.handle_message(&child_message(2, 5, 2), &data_source, &query);
        assert!(state.done_receiving_from_children());

        let accepted = HashSet::from([Arc::new(dummy_contribution(0, 4i64, vec![0]))]);
        let mut network = InMemoryNetwork::new(0);
        state
            .compute_and_send(&accepted, &data_source, &query, &mut network)
            .unwrap();

        let (destination, sent) = network.single_aggregation();
        assert_eq!(destination, UTILITY_NODE_ID);
        assert_eq!(sent.value, 10 + 5 + 4);
        assert_eq!(sent.num_contributors, 3 + 2 + 1);
    }

    #[test]
    fn failed_children_are_not_waited_for() {
        let mut state = AggregationState::new(0, params());
        state.initialize(&HashSet::from([1]));
        assert!(!state.done_receiving_from_children());
        state.handle_message(&child_message(2, 1, 1), &sum_data_source(), &sum_query(0));
        assert!(state.done_receiving_from_children());
    }

    #[test]
    fn leaves_are_immediately_done() {
        // Node 3 is a leaf of group 0 ({0,1,2,3}: children of 3 are out of range).
        let mut state = AggregationState::new(3, params());
        state.initialize(&HashSet::new());
        assert!(state.done_receiving_from_children());
    }

    #[test]
    fn empty_accepted_set_still_reports_zero_contributors() {
        let data_source = sum_data_source();
        let query = sum_query(0);
        let mut state = AggregationState::new(3, params());
        state.initialize(&HashSet::new());

        let mut network = InMemoryNetwork::new(3);
        state
            .compute_and_send(&HashSet::new(), &data_source, &query, &mut network)
            .unwrap();
        let (destination, sent) = network.single_aggregation();
        assert_eq!(destination, 1);
        assert_eq!(sent.num_contributors, 0);
        assert_eq!(sent.value, 0);
    }
}
