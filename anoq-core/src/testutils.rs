//! Helpers for writing tests against the protocol building blocks.
//!
//! RSA-2048 key generation is expensive, so test keys are generated once per
//! process and shared; `test_key(i)` always returns the same key for the
//! same index.

use std::{collections::HashMap, sync::Arc};

use rsa::RsaPublicKey;

use crate::{
    crypto::{ByteObject, CryptoEngine, Signature},
    message::{ValueContribution, ValueTuple},
    NodeId, Record, UTILITY_NODE_ID,
};

pub mod keys {
    use std::{
        collections::HashMap,
        sync::{Mutex, OnceLock},
    };

    use rsa::RsaPrivateKey;

    /// The pool index reserved for the utility's test key.
    pub const UTILITY_KEY_INDEX: usize = 64;

    /// Returns the shared test key for pool index `i`, generating it on
    /// first use.
    pub fn test_key(i: usize) -> &'static RsaPrivateKey {
        static POOL: OnceLock<Mutex<HashMap<usize, &'static RsaPrivateKey>>> = OnceLock::new();
        let pool = POOL.get_or_init(Default::default);
        let mut pool = pool.lock().unwrap();
        pool.entry(i).or_insert_with(|| {
            let key = RsaPrivateKey::new(&mut rand::thread_rng(), crate::RSA_STRENGTH)
                .expect("test key generation");
            Box::leak(Box::new(key))
        })
    }
}

/// The public keys every node in an `n`-client test cluster knows: one per
/// client plus the utility's.
pub fn public_key_map(n: i32) -> HashMap<NodeId, RsaPublicKey> {
    let mut map: HashMap<NodeId, RsaPublicKey> = (0..n)
        .map(|id| (id, keys::test_key(id as usize).to_public_key()))
        .collect();
    map.insert(
        UTILITY_NODE_ID,
        keys::test_key(keys::UTILITY_KEY_INDEX).to_public_key(),
    );
    map
}

/// Crypto engines for clients `0..n` of a test cluster.
pub fn crypto_engines(n: i32) -> Vec<CryptoEngine> {
    (0..n)
        .map(|id| {
            CryptoEngine::from_keys(keys::test_key(id as usize).clone(), public_key_map(n))
                .expect("engine construction")
        })
        .collect()
}

/// The utility's crypto engine for a test cluster of `n` clients.
pub fn utility_engine(n: i32) -> CryptoEngine {
    CryptoEngine::from_keys(
        keys::test_key(keys::UTILITY_KEY_INDEX).clone(),
        public_key_map(n),
    )
    .expect("engine construction")
}

pub fn value_tuple<R: Record>(query_num: i32, value: R, proxies: Vec<NodeId>) -> ValueTuple<R> {
    ValueTuple {
        query_num,
        value,
        proxies,
    }
}

/// A contribution whose utility signature is all zeroes; enough for tests
/// that never check it.
pub fn dummy_contribution<R: Record>(
    query_num: i32,
    value: R,
    proxies: Vec<NodeId>,
) -> ValueContribution<R> {
    ValueContribution::new(value_tuple(query_num, value, proxies), Signature::zeroed())
}

/// Runs the real blind-signature exchange to produce a contribution with a
/// valid utility signature.
pub fn signed_contribution<R: Record>(
    client: &mut CryptoEngine,
    utility: &CryptoEngine,
    tuple: ValueTuple<R>,
) -> ValueContribution<R> {
    let blinded = client.blind(&tuple).expect("blind");
    let blind_signature = utility.sign_blinded(&blinded).expect("sign blinded");
    let signature = client.unblind(&tuple, &blind_signature).expect("unblind");
    ValueContribution::new(tuple, signature)
}

/// Shorthand for an `Arc`'d contribution, the form the agreement state
/// stores.
pub fn arc_contribution<R: Record>(
    query_num: i32,
    value: R,
    proxies: Vec<NodeId>,
) -> Arc<ValueContribution<R>> {
    Arc::new(dummy_contribution(query_num, value, proxies))
}
