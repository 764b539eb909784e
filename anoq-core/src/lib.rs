//! # anoq: anonymous distributed aggregation queries
//!
//! `anoq-core` contains the protocol-level building blocks of the anoq query
//! system: the wire formats exchanged between clients and the utility, the
//! cryptographic engine (signatures, blind signatures, envelope encryption,
//! onion construction), and the peer-to-peer overlay routing functions.
//!
//! The query system lets a single coordinating server (the *utility*) collect
//! aggregate statistics over a federation of data-contributing clients without
//! learning which client contributed which value, even when a bounded number
//! of clients misbehave. A query runs in four phases:
//!
//! 1. **Setup**: each client builds a `(query, value, proxies)` tuple and has
//!    the utility blindly sign it.
//! 2. **Shuffle**: the client multicasts the signed contribution to its proxy
//!    set through onion-encrypted, node-disjoint paths over a round-based
//!    gossip overlay.
//! 3. **Agreement**: the proxies run two-phase (Crusader) Byzantine agreement
//!    to fix a common set of accepted contributions.
//! 4. **Aggregate**: accepted values are folded up a binary reduction tree
//!    and the roots report to the utility, which accepts any result confirmed
//!    by a quorum of proxies.
//!
//! This crate is deliberately free of sockets, timers and async code; the
//! runtime lives in `anoq-node`.

pub mod common;
pub mod crypto;
pub mod data_source;
pub mod message;
pub mod overlay;
pub mod testutils;

use std::{fmt, hash::Hash};

use self::message::{FromBytes, ToBytes};

/// Identifies a node in the query network.
///
/// Client ids are assigned densely from `0` by the client-list file; the
/// utility uses the reserved id [`UTILITY_NODE_ID`], which never appears in a
/// proxy set.
pub type NodeId = i32;

/// The reserved id of the utility (the query server). The utility does not
/// participate in the overlay, but messages still need to be addressed to it.
pub const UTILITY_NODE_ID: NodeId = -1;

/// Identifies a select, filter or aggregate function of a data source.
pub type Opcode = u32;

/// The RSA modulus size used for every key in the system.
pub const RSA_STRENGTH: usize = 2048;

/// The size in bytes of every signature exchanged by the protocol.
pub const RSA_SIGNATURE_SIZE: usize = RSA_STRENGTH / 8;

/// A single data point contributed to a query.
///
/// The protocol core is generic over the record type; the application picks
/// it (the smart-meter example uses a fixed-point usage vector). Records must
/// be value-comparable and hashable so that duplicate contributions can be
/// rejected and query results can be voted on, and must be serialisable so
/// they can travel inside protocol messages.
pub trait Record:
    Clone + Eq + Hash + fmt::Debug + ToBytes + FromBytes + Send + Sync + 'static
{
}

impl<T> Record for T where
    T: Clone + Eq + Hash + fmt::Debug + ToBytes + FromBytes + Send + Sync + 'static
{
}
