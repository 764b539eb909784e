//! Two-phase (Crusader) Byzantine agreement over the shuffled value set.
//!
//! Phase 1: every proxy signs each contribution it holds and multicasts the
//! signature to the contribution's other proxies; signatures for the same
//! contribution accumulate in one bundle per contribution. A bundle with at
//! least `log2(N) + 1` distinct verifying signatures is *acceptable*.
//!
//! Phase 2: each proxy wraps every acceptable bundle in its own signature
//! and multicasts it. A received wrap counts only if the outer signature
//! verifies and, after discarding signatures that fail to verify, at least
//! `log2(N)` signatures from nodes other than the accepter remain. The
//! values still holding `log2(N) + 1` signatures when phase 2 closes are
//! the proxy's accepted set.
//!
//! Equivocation by up to `log2(N)` Byzantine proxies cannot produce two
//! honest proxies with conflicting accepted sets: acceptance always cites a
//! signature quorum that must overlap an honest signer.

use std::{
    collections::{hash_map::Entry, HashMap, HashSet},
    sync::Arc,
};

use tracing::{trace, warn};

use anoq_core::{
    common::ProtocolParams,
    crypto::CryptoEngine,
    message::{AgreementValue, MessageBody, OverlayMessage, SignedValue, ValueContribution},
    overlay::find_paths,
    NodeId, Record,
};

pub struct AgreementState<R: Record> {
    node_id: NodeId,
    params: ProtocolParams,
    query_num: i32,
    phase_1_finished: bool,
    /// One accumulating signature bundle per contribution.
    signed_proxy_values: HashMap<Arc<ValueContribution<R>>, SignedValue<R>>,
}

impl<R: Record> AgreementState<R> {
    pub fn new(node_id: NodeId, params: ProtocolParams, query_num: i32) -> Self {
        Self {
            node_id,
            params,
            query_num,
            phase_1_finished: false,
            signed_proxy_values: HashMap::new(),
        }
    }

    pub fn is_phase_1_finished(&self) -> bool {
        self.phase_1_finished
    }

    /// Dispatches a message received during either agreement phase; the
    /// body type tells the phases apart.
    pub fn handle_message(&mut self, body: &MessageBody<R>, crypto: &CryptoEngine) {
        match body {
            MessageBody::SignedValue(signed_value) => self.handle_phase_1(signed_value, crypto),
            MessageBody::AgreementValue(agreement_value) => {
                self.handle_phase_2(agreement_value.clone(), crypto)
            }
            _ => {
                warn!(
                    node_id = self.node_id,
                    "rejected an agreement message with an unexpected body"
                );
            }
        }
    }

    /// Phase 1: merge a single-signature bundle into the stored bundle for
    /// the same contribution.
    fn handle_phase_1(&mut self, signed_value: &SignedValue<R>, crypto: &CryptoEngine) {
        let Some((signer, signature)) = signed_value.signatures.iter().next() else {
            warn!(node_id = self.node_id, "rejected a value without a signature");
            return;
        };
        if !crypto.verify_contribution(&signed_value.contribution, signature, *signer) {
            warn!(
                node_id = self.node_id,
                signer, "rejected an invalid phase-1 signature"
            );
            return;
        }
        match self
            .signed_proxy_values
            .entry(signed_value.contribution.clone())
        {
            Entry::Vacant(entry) => {
                entry.insert(signed_value.clone());
            }
            Entry::Occupied(mut entry) => {
                entry.get_mut().signatures.insert(*signer, *signature);
            }
        }
    }

    /// Phase 2: check the accepter's signature over the whole bundle, prune
    /// inner signatures that do not verify, and merge if enough remain.
    fn handle_phase_2(&mut self, mut agreement_value: AgreementValue<R>, crypto: &CryptoEngine) {
        if !crypto.verify_agreement_value(&agreement_value) {
            warn!(
                node_id = self.node_id,
                accepter = agreement_value.accepter_id,
                "rejected an agreement value with an invalid accepter signature"
            );
            return;
        }
        let accepter_id = agreement_value.accepter_id;
        let contribution = agreement_value.signed_value.contribution.clone();
        let mut valid_signatures = 0;
        agreement_value
            .signed_value
            .signatures
            .retain(|signer, signature| {
                // The accepter's own signature does not count toward the
                // quorum it is claiming.
                if *signer == accepter_id {
                    return true;
                }
                if crypto.verify_contribution(&contribution, signature, *signer) {
                    valid_signatures += 1;
                    true
                } else {
                    false
                }
            });

        if valid_signatures < self.params.log2n as usize {
            warn!(
                node_id = self.node_id,
                accepter = accepter_id,
                valid_signatures,
                "rejected an agreement value without a signature quorum"
            );
            return;
        }
        match self.signed_proxy_values.entry(contribution) {
            Entry::Vacant(entry) => {
                entry.insert(agreement_value.signed_value);
            }
            Entry::Occupied(mut entry) => {
                entry
                    .get_mut()
                    .signatures
                    .extend(agreement_value.signed_value.signatures);
            }
        }
    }

    /// Closes phase 1: signs every acceptable bundle and builds the
    /// encrypted accept messages to multicast to the other proxies, routed
    /// over paths starting in the next overlay round.
    pub fn finish_phase_1(
        &mut self,
        current_round: i32,
        crypto: &CryptoEngine,
    ) -> Vec<OverlayMessage<R>> {
        let mut accept_messages = Vec::new();
        for (contribution, signed_value) in &self.signed_proxy_values {
            if signed_value.signatures.len() < self.params.accept_threshold() {
                continue;
            }
            let agreement_value = AgreementValue {
                signed_value: signed_value.clone(),
                accepter_id: self.node_id,
                accepter_signature: crypto.sign_signed_value(signed_value),
            };
            let other_proxies: Vec<NodeId> = contribution
                .tuple
                .proxies
                .iter()
                .copied()
                .filter(|proxy| *proxy != self.node_id)
                .collect();
            // Sends happen before receives within a round, so the paths
            // must start in the round after this one.
            let paths = find_paths(
                self.node_id,
                &other_proxies,
                self.params.num_nodes,
                current_round + 1,
            );
            for path in paths {
                let mut message = OverlayMessage::with_path(
                    self.query_num,
                    &path,
                    Some(Arc::new(MessageBody::AgreementValue(agreement_value.clone()))),
                );
                let final_hop = *path.last().expect("paths are never empty");
                if let Err(e) = crypto.envelope_encrypt(&mut message, final_hop) {
                    warn!(node_id = self.node_id, "could not encrypt accept message: {}", e);
                    continue;
                }
                accept_messages.push(message);
            }
        }
        trace!(
            node_id = self.node_id,
            messages = accept_messages.len(),
            "finished agreement phase 1"
        );
        self.phase_1_finished = true;
        accept_messages
    }

    /// Closes phase 2: the contributions whose bundles still hold a full
    /// quorum are the accepted set.
    pub fn finish_phase_2(&mut self) -> HashSet<Arc<ValueContribution<R>>> {
        let threshold = self.params.accept_threshold();
        self.signed_proxy_values
            .iter()
            .filter(|(_, signed_value)| signed_value.signatures.len() >= threshold)
            .map(|(contribution, _)| contribution.clone())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anoq_core::{
        crypto::{ByteObject, Signature},
        testutils::{crypto_engines, signed_contribution, utility_engine, value_tuple},
    };

    const N: i32 = 7;

    fn setup() -> (Vec<CryptoEngine>, Arc<ValueContribution<i64>>) {
        let mut engines = crypto_engines(N);
        let utility = utility_engine(N);
        let proxies: Vec<NodeId> = (0..N).collect();
        let contribution = Arc::new(signed_contribution(
            &mut engines[0],
            &utility,
            value_tuple(0, 42i64, proxies),
        ));
        (engines, contribution)
    }

    fn phase_1_message(
        engines: &[CryptoEngine],
        signer: NodeId,
        contribution: &Arc<ValueContribution<i64>>,
    ) -> MessageBody<i64> {
        let signature = engines[signer as usize].sign_contribution(contribution);
        MessageBody::SignedValue(SignedValue::with_signature(
            contribution.clone(),
            signer,
            signature,
        ))
    }

    #[test]
    fn quorum_of_verifying_signatures_is_accepted() {
        let (engines, contribution) = setup();
        let params = ProtocolParams::new(N);
        let mut state = AgreementState::new(0, params, 0);

        // log2(7) + 1 = 4 distinct signers.
        for signer in 1..=4 {
            state.handle_message(&phase_1_message(&engines, signer, &contribution), &engines[0]);
        }
        let accept_messages = state.finish_phase_1(10, &engines[0]);
        assert!(!accept_messages.is_empty());
        assert!(state.is_phase_1_finished());
        assert_eq!(state.finish_phase_2(), HashSet::from([contribution]));
    }

    #[test]
    fn one_signature_short_is_rejected() {
        let (engines, contribution) = setup();
        let mut state = AgreementState::new(0, ProtocolParams::new(N), 0);
        for signer in 1..=3 {
            state.handle_message(&phase_1_message(&engines, signer, &contribution), &engines[0]);
        }
        assert!(state.finish_phase_1(10, &engines[0]).is_empty());
        assert!(state.finish_phase_2().is_empty());
    }

    #[test]
    fn corrupted_signature_does_not_count() {
        let (engines, contribution) = setup();
        let mut state = AgreementState::new(0, ProtocolParams::new(N), 0);
        for signer in 1..=3 {
            state.handle_message(&phase_1_message(&engines, signer, &contribution), &engines[0]);
        }
        // A fourth "signature" that verifies under nobody's key.
        let forged = MessageBody::SignedValue(SignedValue::with_signature(
            contribution.clone(),
            4,
            Signature::zeroed(),
        ));
        state.handle_message(&forged, &engines[0]);
        assert!(state.finish_phase_2().is_empty());
    }

    #[test]
    fn duplicate_deliveries_are_idempotent() {
        let (engines, contribution) = setup();
        let mut state = AgreementState::new(0, ProtocolParams::new(N), 0);
        let message = phase_1_message(&engines, 2, &contribution);
        state.handle_message(&message, &engines[0]);
        state.handle_message(&message, &engines[0]);
        state.handle_message(&phase_1_message(&engines, 3, &contribution), &engines[0]);

        let bundle = state.signed_proxy_values.get(&contribution).unwrap();
        assert_eq!(bundle.signatures.len(), 2);
    }

    #[test]
    fn phase_2_requires_a_verifying_accepter_signature() {
        let (engines, contribution) = setup();
        let params = ProtocolParams::new(N);

        let mut bundle = SignedValue::new(contribution.clone());
        for signer in 1..=4 {
            bundle
                .signatures
                .insert(signer, engines[signer as usize].sign_contribution(&contribution));
        }
        let mut agreement_value = AgreementValue {
            accepter_signature: engines[1].sign_signed_value(&bundle),
            signed_value: bundle,
            accepter_id: 1,
        };

        let mut state = AgreementState::new(0, params, 0);
        state.handle_message(&MessageBody::AgreementValue(agreement_value.clone()), &engines[0]);
        assert_eq!(state.finish_phase_2(), HashSet::from([contribution.clone()]));

        // Tampering with the outer signature makes the same message
        // worthless.
        agreement_value.accepter_signature = Signature::zeroed();
        let mut state = AgreementState::new(0, params, 0);
        state.handle_message(&MessageBody::AgreementValue(agreement_value), &engines[0]);
        assert!(state.finish_phase_2().is_empty());
    }

    #[test]
    fn phase_2_excludes_the_accepters_own_signature_from_the_quorum() {
        let (engines, contribution) = setup();
        let params = ProtocolParams::new(N);

        // Bundle with the accepter's own signature plus only log2n - 1 = 2
        // others: 2 countable signatures, below the log2n quorum.
        let mut bundle = SignedValue::new(contribution.clone());
        for signer in 1..=3 {
            bundle
                .signatures
                .insert(signer, engines[signer as usize].sign_contribution(&contribution));
        }
        let agreement_value = AgreementValue {
            accepter_signature: engines[1].sign_signed_value(&bundle),
            signed_value: bundle,
            accepter_id: 1,
        };

        let mut state = AgreementState::new(0, params, 0);
        state.handle_message(&MessageBody::AgreementValue(agreement_value), &engines[0]);
        assert!(state.signed_proxy_values.is_empty());
    }
}
