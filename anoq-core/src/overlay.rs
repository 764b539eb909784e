//! Overlay routing: the per-round gossip permutation, node-disjoint path
//! construction, proxy selection and the aggregation tree.
//!
//! All functions here are pure. In round `r` of an `N`-node overlay, node
//! `i` sends to `(i + 2^(r mod N−1)) mod N` and receives from the inverse.
//! Adding a constant is a bijection, so every node has exactly one inbound
//! and one outbound peer per round; because `N` is an odd prime the offset
//! is never `0 mod N` (no node talks to itself) and by Fermat's little
//! theorem the offsets cycle with a period dividing `N − 1`.

use std::collections::{HashMap, HashSet, VecDeque};

use tracing::warn;

use crate::{common::log2_ceil, NodeId, UTILITY_NODE_ID};

fn mod_pow2(exponent: i64, modulus: i64) -> i64 {
    let mut result = 1i64;
    let mut base = 2i64 % modulus;
    let mut exponent = exponent;
    while exponent > 0 {
        if exponent & 1 == 1 {
            result = result * base % modulus;
        }
        base = base * base % modulus;
        exponent >>= 1;
    }
    result
}

/// The gossip offset of `round`: `2^(round mod N−1) mod N`.
pub fn round_offset(round: i32, num_nodes: i32) -> i32 {
    let n = num_nodes as i64;
    if n <= 2 {
        return 1;
    }
    let exponent = (round as i64).rem_euclid(n - 1);
    mod_pow2(exponent, n) as i32
}

/// The node `id` sends to in `round`.
pub fn gossip_target(id: NodeId, round: i32, num_nodes: i32) -> NodeId {
    (id + round_offset(round, num_nodes)).rem_euclid(num_nodes)
}

/// The node `id` receives from in `round`; the inverse of
/// [`gossip_target`].
pub fn gossip_predecessor(id: NodeId, round: i32, num_nodes: i32) -> NodeId {
    (id - round_offset(round, num_nodes)).rem_euclid(num_nodes)
}

/// The bounds `(start, len)` of an aggregation group: groups partition
/// `[0, N)` into `num_groups` contiguous, balanced blocks. Groups can be
/// empty when there are more groups than nodes.
fn group_bounds(group: i32, num_groups: i32, num_nodes: i32) -> (NodeId, i32) {
    let base = num_nodes / num_groups;
    let rem = num_nodes % num_groups;
    if group < rem {
        (group * (base + 1), base + 1)
    } else {
        (rem * (base + 1) + (group - rem) * base, base)
    }
}

/// The aggregation group `id` belongs to.
pub fn aggregation_group_for(id: NodeId, num_groups: i32, num_nodes: i32) -> i32 {
    let base = num_nodes / num_groups;
    let rem = num_nodes % num_groups;
    let split = rem * (base + 1);
    if id < split {
        id / (base + 1)
    } else {
        rem + (id - split) / base
    }
}

/// Deterministically selects `id`'s proxy set: one member of every
/// non-empty aggregation group, so the contribution lands in every
/// reduction subtree.
pub fn pick_proxies(id: NodeId, num_groups: i32, num_nodes: i32) -> Vec<NodeId> {
    let mut proxies = Vec::with_capacity(num_groups.min(num_nodes) as usize);
    for group in 0..num_groups {
        let (start, len) = group_bounds(group, num_groups, num_nodes);
        if len == 0 {
            continue;
        }
        proxies.push(start + (id + group).rem_euclid(len));
    }
    proxies
}

/// The parent of `id` in the aggregation tree, which is the utility for
/// each group's root. Groups lay their members out as a binary heap in id
/// order.
pub fn aggregation_tree_parent(id: NodeId, num_groups: i32, num_nodes: i32) -> NodeId {
    let group = aggregation_group_for(id, num_groups, num_nodes);
    let (start, _) = group_bounds(group, num_groups, num_nodes);
    let index = id - start;
    if index == 0 {
        UTILITY_NODE_ID
    } else {
        start + (index - 1) / 2
    }
}

/// The children of `id` in the aggregation tree, if any.
pub fn aggregation_tree_children(
    id: NodeId,
    num_groups: i32,
    num_nodes: i32,
) -> (Option<NodeId>, Option<NodeId>) {
    let group = aggregation_group_for(id, num_groups, num_nodes);
    let (start, len) = group_bounds(group, num_groups, num_nodes);
    let index = id - start;
    let child = |child_index: i32| (child_index < len).then(|| start + child_index);
    (child(2 * index + 1), child(2 * index + 2))
}

/// Finds a route through the round-indexed gossip graph to each
/// destination, starting with the send `src` makes in `starting_round`.
///
/// Every returned path begins with `gossip_target(src, starting_round)`
/// (in that round `src` has no other outbound edge) and ends with the
/// destination. A message follows a path by waiting at each node until the
/// round whose gossip edge points at the next node. Paths are pairwise
/// interior-disjoint (the shared first hop is not an interior node), so no
/// relay between the first hop and a destination sees two of the same
/// sender's messages.
///
/// Destinations equal to `src` are skipped, as is any destination that
/// cannot be reached within the shuffle-phase round budget (which does not
/// happen for prime cluster sizes; the guard only keeps a malformed call
/// from looping).
pub fn find_paths(
    src: NodeId,
    destinations: &[NodeId],
    num_nodes: i32,
    starting_round: i32,
) -> Vec<Vec<NodeId>> {
    let log2n = log2_ceil(num_nodes);
    let budget = 2 * log2n + log2n * log2n + 1;
    let horizon = starting_round + 1 + budget;
    let first_hop = gossip_target(src, starting_round, num_nodes);

    let mut used_interiors: HashSet<NodeId> = HashSet::new();
    let mut paths = Vec::with_capacity(destinations.len());

    for &destination in destinations {
        if destination == src {
            continue;
        }
        if destination == first_hop {
            paths.push(vec![first_hop]);
            continue;
        }
        match search_path(
            first_hop,
            destination,
            src,
            num_nodes,
            starting_round,
            horizon,
            &used_interiors,
        ) {
            Some(path) => {
                used_interiors.extend(&path[1..path.len() - 1]);
                paths.push(path);
            }
            None => {
                warn!(
                    src,
                    destination, "no disjoint overlay path found within the round budget"
                );
            }
        }
    }
    paths
}

/// Breadth-first search over `(node, round)` states. In each round a
/// message can be held where it is or forwarded along that round's gossip
/// edge; interior nodes already claimed by another path are off limits.
fn search_path(
    first_hop: NodeId,
    destination: NodeId,
    src: NodeId,
    num_nodes: i32,
    starting_round: i32,
    horizon: i32,
    used_interiors: &HashSet<NodeId>,
) -> Option<Vec<NodeId>> {
    let start = (first_hop, starting_round + 1);
    let mut parents: HashMap<(NodeId, i32), (NodeId, i32)> = HashMap::new();
    let mut visited: HashSet<(NodeId, i32)> = HashSet::from([start]);
    let mut queue: VecDeque<(NodeId, i32)> = VecDeque::from([start]);

    while let Some(state) = queue.pop_front() {
        let (node, round) = state;
        if node == destination {
            return Some(reconstruct(state, start, &parents));
        }
        if round >= horizon {
            continue;
        }
        let hop = gossip_target(node, round, num_nodes);
        let hop_allowed =
            hop == destination || !(used_interiors.contains(&hop) || hop == src || hop == first_hop);
        for next in [(node, round + 1), (hop, round + 1)] {
            let is_hold = next.0 == node;
            if (is_hold || hop_allowed) && visited.insert(next) {
                parents.insert(next, state);
                queue.push_back(next);
            }
        }
    }
    None
}

fn reconstruct(
    end: (NodeId, i32),
    start: (NodeId, i32),
    parents: &HashMap<(NodeId, i32), (NodeId, i32)>,
) -> Vec<NodeId> {
    let mut nodes = vec![end.0];
    let mut state = end;
    while state != start {
        state = parents[&state];
        if *nodes.last().unwrap() != state.0 {
            nodes.push(state.0);
        }
    }
    nodes.reverse();
    nodes
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gossip_target_is_a_bijection() {
        for n in [5, 7, 11, 13] {
            for round in 0..2 * n {
                let targets: HashSet<NodeId> =
                    (0..n).map(|id| gossip_target(id, round, n)).collect();
                assert_eq!(targets.len(), n as usize, "round {} of n={}", round, n);
                for id in 0..n {
                    assert_ne!(gossip_target(id, round, n), id);
                    assert_eq!(
                        gossip_predecessor(gossip_target(id, round, n), round, n),
                        id
                    );
                }
            }
        }
    }

    #[test]
    fn offsets_cycle_with_fermat_period() {
        // 2^(N-1) ≡ 1 (mod N) for prime N, so round N-1 looks like round 0.
        for n in [5, 7, 11] {
            assert_eq!(round_offset(n - 1, n), round_offset(0, n));
        }
    }

    /// Replays the hold-or-forward delivery process to check that a path is
    /// actually traversable starting from the given round.
    fn delivery_rounds(path: &[NodeId], src: NodeId, starting_round: i32, n: i32) -> Option<i32> {
        assert_eq!(path[0], gossip_target(src, starting_round, n));
        let mut position = 0;
        let mut round = starting_round + 1;
        let budget = {
            let log2n = log2_ceil(n);
            2 * log2n + log2n * log2n + 1
        };
        while position < path.len() - 1 && round <= starting_round + 1 + budget {
            if gossip_target(path[position], round, n) == path[position + 1] {
                position += 1;
            }
            round += 1;
        }
        (position == path.len() - 1).then_some(round)
    }

    #[test]
    fn paths_are_disjoint_and_traversable() {
        for n in [7, 11, 13] {
            for src in 0..n {
                let destinations: Vec<NodeId> = (0..n).filter(|d| *d != src).collect();
                let paths = find_paths(src, &destinations, n, 0);
                assert_eq!(paths.len(), destinations.len(), "src {} of n={}", src, n);

                let mut seen_interiors: HashSet<NodeId> = HashSet::new();
                for (path, destination) in paths.iter().zip(&destinations) {
                    assert_eq!(*path.last().unwrap(), *destination);
                    assert!(delivery_rounds(path, src, 0, n).is_some());
                    for interior in &path[1..path.len() - 1] {
                        assert!(
                            seen_interiors.insert(*interior),
                            "interior {} reused (n={}, src={})",
                            interior,
                            n,
                            src
                        );
                        assert_ne!(*interior, src);
                    }
                }
            }
        }
    }

    #[test]
    fn paths_can_start_at_any_round() {
        let paths = find_paths(3, &[0, 5, 6], 7, 9);
        assert_eq!(paths.len(), 3);
        for path in &paths {
            assert_eq!(path[0], gossip_target(3, 9, 7));
        }
    }

    #[test]
    fn proxies_cover_every_nonempty_group() {
        // 7 nodes, 7 groups: every node is a proxy.
        let proxies = pick_proxies(2, 7, 7);
        assert_eq!(proxies.len(), 7);
        let distinct: HashSet<NodeId> = proxies.iter().copied().collect();
        assert_eq!(distinct.len(), 7);

        // 5 nodes but 2*FT+1 = 7 groups: the two empty groups are skipped.
        let proxies = pick_proxies(0, 7, 5);
        assert_eq!(proxies.len(), 5);
        for (group, proxy) in proxies.iter().enumerate() {
            assert_eq!(aggregation_group_for(*proxy, 7, 5), group as i32);
        }
    }

    #[test]
    fn proxies_stay_in_their_group() {
        let (num_groups, n) = (7, 23);
        for id in 0..n {
            for (group, proxy) in pick_proxies(id, num_groups, n).iter().enumerate() {
                assert_eq!(aggregation_group_for(*proxy, num_groups, n), group as i32);
            }
        }
    }

    #[test]
    fn aggregation_tree_is_consistent() {
        let (num_groups, n) = (7, 23);
        let mut roots = 0;
        for id in 0..n {
            let parent = aggregation_tree_parent(id, num_groups, n);
            if parent == UTILITY_NODE_ID {
                roots += 1;
            } else {
                let (left, right) = aggregation_tree_children(parent, num_groups, n);
                assert!(left == Some(id) || right == Some(id));
                assert_eq!(
                    aggregation_group_for(parent, num_groups, n),
                    aggregation_group_for(id, num_groups, n)
                );
            }
            let (left, right) = aggregation_tree_children(id, num_groups, n);
            for child in [left, right].into_iter().flatten() {
                assert_eq!(aggregation_tree_parent(child, num_groups, n), id);
            }
        }
        assert_eq!(roots, num_groups);
    }

    #[test]
    fn singleton_groups_have_leaf_roots() {
        // n = 7 with 7 groups: everyone reports straight to the utility.
        for id in 0..7 {
            assert_eq!(aggregation_tree_parent(id, 7, 7), UTILITY_NODE_ID);
            assert_eq!(aggregation_tree_children(id, 7, 7), (None, None));
        }
    }
}
