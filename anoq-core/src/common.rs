//! Protocol-wide parameters derived from the cluster size.

use crate::NodeId;

/// Ceiling of the base-2 logarithm of `n`.
///
/// # Panics
/// Panics if `n < 1`.
pub fn log2_ceil(n: i32) -> i32 {
    assert!(n >= 1, "log2_ceil of a non-positive number");
    (32 - ((n - 1) as u32).leading_zeros()) as i32
}

/// Primality test by trial division. The cluster sizes this system runs at
/// are small enough that nothing cleverer is warranted.
pub fn is_prime(n: i32) -> bool {
    if n < 2 {
        return false;
    }
    if n % 2 == 0 {
        return n == 2;
    }
    let mut d = 3;
    while d * d <= n {
        if n % d == 0 {
            return false;
        }
        d += 2;
    }
    true
}

/// The parameters every protocol state machine derives from the cluster size.
///
/// Computed once at start-up and passed by value wherever needed; the number
/// of tolerated failures is not a global.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProtocolParams {
    /// The number of clients in the network. Must be prime; the settings
    /// loader rejects non-prime client lists before this is ever built.
    pub num_nodes: i32,
    /// Ceiling of log2 of the number of nodes.
    pub log2n: i32,
    /// The number of Byzantine failures the protocol tolerates,
    /// `ceil(log2(num_nodes))`.
    pub failures_tolerated: i32,
    /// The number of aggregation groups, `2 * failures_tolerated + 1`.
    pub num_aggregation_groups: i32,
}

impl ProtocolParams {
    pub fn new(num_nodes: i32) -> Self {
        let log2n = log2_ceil(num_nodes);
        Self {
            num_nodes,
            log2n,
            failures_tolerated: log2n,
            num_aggregation_groups: 2 * log2n + 1,
        }
    }

    /// The number of overlay rounds the shuffle phase lasts.
    pub fn shuffle_rounds(&self) -> i32 {
        2 * self.failures_tolerated + self.log2n * self.log2n + 1
    }

    /// The number of overlay rounds after which phase 1 of agreement ends,
    /// counted from the round agreement started in.
    pub fn agreement_phase1_rounds(&self) -> i32 {
        2 * self.failures_tolerated + self.log2n * self.log2n + 1
    }

    /// The number of overlay rounds after which phase 2 of agreement ends,
    /// counted from the round agreement started in.
    pub fn agreement_phase2_rounds(&self) -> i32 {
        4 * self.failures_tolerated + 2 * self.log2n * self.log2n + 2
    }

    /// An upper bound on the number of overlay rounds a whole query takes,
    /// used by the utility to size its query timeout.
    pub fn rounds_for_query(&self) -> i32 {
        6 * self.failures_tolerated
            + 3 * self.log2n * self.log2n
            + 3
            + self.aggregation_tree_depth()
    }

    /// The depth of the aggregation reduction tree.
    pub fn aggregation_tree_depth(&self) -> i32 {
        let groups = self.num_aggregation_groups.min(self.num_nodes);
        log2_ceil((self.num_nodes + groups - 1) / groups)
    }

    /// The number of distinct signatures that make a `SignedValue`
    /// acceptable in the agreement phase: `log2n + 1`.
    pub fn accept_threshold(&self) -> usize {
        (self.log2n + 1) as usize
    }

    /// The number of matching results the utility requires before it trusts
    /// a query result: `failures_tolerated + 1`.
    pub fn result_quorum(&self) -> usize {
        (self.failures_tolerated + 1) as usize
    }
}

/// Returns true if `id` is a valid client id for an `n`-node cluster.
pub fn valid_client_id(id: NodeId, n: i32) -> bool {
    (0..n).contains(&id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn log2_ceil_small_values() {
        assert_eq!(log2_ceil(1), 0);
        assert_eq!(log2_ceil(2), 1);
        assert_eq!(log2_ceil(3), 2);
        assert_eq!(log2_ceil(4), 2);
        assert_eq!(log2_ceil(5), 3);
        assert_eq!(log2_ceil(7), 3);
        assert_eq!(log2_ceil(8), 3);
        assert_eq!(log2_ceil(9), 4);
    }

    #[test]
    fn primes() {
        let primes: Vec<i32> = (1..40).filter(|n| is_prime(*n)).collect();
        assert_eq!(primes, vec![2, 3, 5, 7, 11, 13, 17, 19, 23, 29, 31, 37]);
    }

    #[test]
    fn params_for_seven_nodes() {
        let params = ProtocolParams::new(7);
        assert_eq!(params.log2n, 3);
        assert_eq!(params.failures_tolerated, 3);
        assert_eq!(params.num_aggregation_groups, 7);
        assert_eq!(params.shuffle_rounds(), 16);
        assert_eq!(params.accept_threshold(), 4);
        assert_eq!(params.result_quorum(), 4);
    }
}
