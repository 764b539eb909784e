//! The cryptographic engine: every operation the protocol state machines
//! need, over pre-installed RSA-2048 keys.

use std::{collections::HashMap, path::PathBuf, sync::Arc};

use blind_rsa_signatures::{
    BlindSignature, MessageRandomizer, Options, PublicKey as BlindPublicKey, Secret,
    SecretKey as BlindSecretKey, Signature as BlindRsaSignature,
};
use rsa::{
    pkcs1v15::{Signature as RsaSignature, SigningKey, VerifyingKey},
    signature::{SignatureEncoding, Signer, Verifier},
    RsaPrivateKey, RsaPublicKey,
};
use sha2::Sha256;

use crate::{
    crypto::{envelope, keys, ByteObject, CryptoError, Signature},
    message::{
        AgreementValue, ByteReader, FromBytes, MessageBody, OverlayMessage, SignedValue,
        ToBytes, ValueContribution, ValueTuple,
    },
    NodeId, Record, UTILITY_NODE_ID,
};

/// The blinding secret saved between a `blind` and the matching `unblind`.
struct OutstandingBlind {
    secret: Secret,
    msg_randomizer: Option<MessageRandomizer>,
}

/// Signing, verification, blind signatures and envelope encryption for one
/// node.
///
/// The blind-signature client is stateful: [`blind`] saves the blinding
/// secret that the next [`unblind`] consumes, so exactly one signature
/// request may be outstanding at a time. Blinding twice in a row is a usage
/// error, not a silent overwrite.
///
/// [`blind`]: CryptoEngine::blind
/// [`unblind`]: CryptoEngine::unblind
pub struct CryptoEngine {
    private_key: RsaPrivateKey,
    signing_key: SigningKey<Sha256>,
    public_keys: HashMap<NodeId, RsaPublicKey>,
    verifying_keys: HashMap<NodeId, VerifyingKey<Sha256>>,
    blind_signing_key: BlindSecretKey,
    utility_blind_key: BlindPublicKey,
    blind_options: Options,
    outstanding_blind: Option<OutstandingBlind>,
}

impl CryptoEngine {
    /// Builds the engine from key files on disk. Any unreadable or
    /// malformed key file is fatal.
    pub fn from_files(
        private_key_file: &std::path::Path,
        public_key_files: &HashMap<NodeId, PathBuf>,
    ) -> Result<Self, CryptoError> {
        let private_key = keys::load_private_key(private_key_file)?;
        let public_keys = keys::load_public_keys(public_key_files)?;
        Self::from_keys(private_key, public_keys)
    }

    /// Builds the engine from keys already in memory. The utility's public
    /// key must be present under [`UTILITY_NODE_ID`].
    pub fn from_keys(
        private_key: RsaPrivateKey,
        public_keys: HashMap<NodeId, RsaPublicKey>,
    ) -> Result<Self, CryptoError> {
        let utility_key = public_keys
            .get(&UTILITY_NODE_ID)
            .ok_or(CryptoError::UnknownKey(UTILITY_NODE_ID))?
            .clone();
        let verifying_keys = public_keys
            .iter()
            .map(|(id, key)| (*id, VerifyingKey::<Sha256>::new(key.clone())))
            .collect();
        Ok(Self {
            signing_key: SigningKey::<Sha256>::new(private_key.clone()),
            blind_signing_key: BlindSecretKey(private_key.clone()),
            utility_blind_key: BlindPublicKey(utility_key),
            private_key,
            public_keys,
            verifying_keys,
            blind_options: Options::default(),
            outstanding_blind: None,
        })
    }

    fn sign_bytes(&self, message: &[u8]) -> Signature {
        let signature = self.signing_key.sign(message);
        // A PKCS#1 v1.5 signature is exactly one modulus wide.
        Signature::from_slice(&signature.to_bytes()).expect("signature has modulus width")
    }

    fn verify_bytes(&self, message: &[u8], signature: &Signature, signer: NodeId) -> bool {
        let Some(key) = self.verifying_keys.get(&signer) else {
            return false;
        };
        let Ok(signature) = RsaSignature::try_from(signature.as_slice()) else {
            return false;
        };
        key.verify(message, &signature).is_ok()
    }

    /// Signs a contribution with this node's private key.
    pub fn sign_contribution<R: Record>(&self, contribution: &ValueContribution<R>) -> Signature {
        let mut bytes = Vec::with_capacity(contribution.buffer_length());
        contribution.to_bytes(&mut bytes);
        self.sign_bytes(&bytes)
    }

    /// Verifies a signature over a contribution against `signer`'s public
    /// key. An unknown signer simply fails verification.
    pub fn verify_contribution<R: Record>(
        &self,
        contribution: &ValueContribution<R>,
        signature: &Signature,
        signer: NodeId,
    ) -> bool {
        let mut bytes = Vec::with_capacity(contribution.buffer_length());
        contribution.to_bytes(&mut bytes);
        self.verify_bytes(&bytes, signature, signer)
    }

    /// Signs a whole signature bundle (used by accepters in phase 2 of
    /// agreement).
    pub fn sign_signed_value<R: Record>(&self, signed_value: &SignedValue<R>) -> Signature {
        let mut bytes = Vec::with_capacity(signed_value.buffer_length());
        signed_value.to_bytes(&mut bytes);
        self.sign_bytes(&bytes)
    }

    /// Verifies an accepter's signature over a signature bundle.
    pub fn verify_signed_value<R: Record>(
        &self,
        signed_value: &SignedValue<R>,
        signature: &Signature,
        signer: NodeId,
    ) -> bool {
        let mut bytes = Vec::with_capacity(signed_value.buffer_length());
        signed_value.to_bytes(&mut bytes);
        self.verify_bytes(&bytes, signature, signer)
    }

    /// Verifies the (unblinded) utility signature on a value tuple.
    pub fn verify_utility<R: Record>(&self, tuple: &ValueTuple<R>, signature: &Signature) -> bool {
        let mut bytes = Vec::with_capacity(tuple.buffer_length());
        tuple.to_bytes(&mut bytes);
        let signature = BlindRsaSignature(signature.as_slice().to_vec());
        signature
            .verify(&self.utility_blind_key, None, &bytes, &self.blind_options)
            .is_ok()
    }

    /// Blinds a value tuple for the utility to sign, saving the blinding
    /// secret for the matching [`unblind`](Self::unblind).
    pub fn blind<R: Record>(&mut self, tuple: &ValueTuple<R>) -> Result<Vec<u8>, CryptoError> {
        if self.outstanding_blind.is_some() {
            return Err(CryptoError::BlindAlreadyOutstanding);
        }
        let mut bytes = Vec::with_capacity(tuple.buffer_length());
        tuple.to_bytes(&mut bytes);
        let result = self
            .utility_blind_key
            .blind(&mut rand::thread_rng(), &bytes, false, &self.blind_options)
            .map_err(|e| CryptoError::Blind(e.to_string()))?;
        self.outstanding_blind = Some(OutstandingBlind {
            secret: result.secret,
            msg_randomizer: result.msg_randomizer,
        });
        Ok(result.blind_msg.0)
    }

    /// Unblinds the utility's blind signature over the tuple most recently
    /// passed to [`blind`](Self::blind), validating it in the process.
    pub fn unblind<R: Record>(
        &mut self,
        tuple: &ValueTuple<R>,
        blind_signature: &[u8],
    ) -> Result<Signature, CryptoError> {
        let state = self
            .outstanding_blind
            .take()
            .ok_or(CryptoError::NoOutstandingBlind)?;
        let mut bytes = Vec::with_capacity(tuple.buffer_length());
        tuple.to_bytes(&mut bytes);
        let signature = self
            .utility_blind_key
            .finalize(
                &BlindSignature(blind_signature.to_vec()),
                &state.secret,
                state.msg_randomizer,
                &bytes,
                &self.blind_options,
            )
            .map_err(|e| CryptoError::Unblind(e.to_string()))?;
        Signature::from_slice(&signature.0)
            .ok_or_else(|| CryptoError::Unblind("unexpected signature length".into()))
    }

    /// Discards any outstanding blinding secret. Called when a query is
    /// reset so an aborted SETUP cannot poison the next query's blind.
    pub fn cancel_blind(&mut self) {
        self.outstanding_blind = None;
    }

    /// Signs a blinded message. Only meaningful on the utility, which is
    /// the only node whose blind signatures anyone will accept.
    pub fn sign_blinded(&self, blinded_message: &[u8]) -> Result<Vec<u8>, CryptoError> {
        self.blind_signing_key
            .blind_sign(&mut rand::thread_rng(), blinded_message, &self.blind_options)
            .map(|signature| signature.0)
            .map_err(|e| CryptoError::Sign(e.to_string()))
    }

    /// Envelope-encrypts a message's body in place under `target`'s public
    /// key: the body is replaced by an opaque byte body and the encrypted
    /// flag is set. A message with no body only gets its flag flipped.
    pub fn envelope_encrypt<R: Record>(
        &self,
        message: &mut OverlayMessage<R>,
        target: NodeId,
    ) -> Result<(), CryptoError> {
        message.is_encrypted = true;
        let Some(body) = &message.body else {
            return Ok(());
        };
        let key = self
            .public_keys
            .get(&target)
            .ok_or(CryptoError::UnknownKey(target))?;
        let mut plaintext = Vec::with_capacity(body.buffer_length());
        body.to_bytes(&mut plaintext);
        let sealed = envelope::seal(key, &plaintext)?;
        message.body = Some(Arc::new(MessageBody::Bytes(sealed)));
        Ok(())
    }

    /// Reverses [`envelope_encrypt`](Self::envelope_encrypt) in place with
    /// this node's private key.
    pub fn envelope_decrypt<R: Record>(
        &self,
        message: &mut OverlayMessage<R>,
    ) -> Result<(), CryptoError> {
        message.is_encrypted = false;
        let Some(body) = &message.body else {
            return Ok(());
        };
        let MessageBody::Bytes(sealed) = &**body else {
            return Err(CryptoError::Decrypt(
                "encrypted message does not carry a byte body".into(),
            ));
        };
        let plaintext = envelope::open(&self.private_key, sealed)?;
        let parsed = MessageBody::from_bytes(&mut ByteReader::new(&plaintext))
            .map_err(|e| CryptoError::Decrypt(e.to_string()))?;
        message.body = Some(Arc::new(parsed));
        Ok(())
    }

    /// Wraps `payload` in one envelope layer per node on `path`, innermost
    /// layer first, so each hop can peel exactly one layer.
    ///
    /// # Panics
    /// Panics if `path` is empty.
    pub fn build_onion<R: Record>(
        &self,
        path: &[NodeId],
        payload: Arc<MessageBody<R>>,
        query_num: i32,
    ) -> Result<OverlayMessage<R>, CryptoError> {
        let innermost = *path.last().expect("onion path must not be empty");
        let mut layer = OverlayMessage::new(query_num, innermost, Some(payload));
        self.envelope_encrypt(&mut layer, innermost)?;
        for &hop in path.iter().rev().skip(1) {
            let mut next = OverlayMessage::new(
                query_num,
                hop,
                Some(Arc::new(MessageBody::Overlay(layer))),
            );
            self.envelope_encrypt(&mut next, hop)?;
            layer = next;
        }
        Ok(layer)
    }

    /// Used by agreement to check an `AgreementValue`'s outer signature.
    pub fn verify_agreement_value<R: Record>(&self, agreement: &AgreementValue<R>) -> bool {
        self.verify_signed_value(
            &agreement.signed_value,
            &agreement.accepter_signature,
            agreement.accepter_id,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutils::{crypto_engines, dummy_contribution, utility_engine, value_tuple};

    #[test]
    fn blind_unblind_round_trip() {
        // Property: verify_utility(v, unblind(blind(v), sign_blinded(blind(v)))).
        let mut client = crypto_engines(3).remove(0);
        let utility = utility_engine(3);
        let tuple = value_tuple(0, 42i64, vec![0, 1, 2]);

        let blinded = client.blind(&tuple).unwrap();
        let blind_signature = utility.sign_blinded(&blinded).unwrap();
        let signature = client.unblind(&tuple, &blind_signature).unwrap();
        assert!(client.verify_utility(&tuple, &signature));

        // A different tuple does not verify under the same signature.
        let other = value_tuple(0, 43i64, vec![0, 1, 2]);
        assert!(!client.verify_utility(&other, &signature));
    }

    #[test]
    fn blind_twice_is_a_usage_error() {
        let mut client = crypto_engines(3).remove(0);
        let tuple = value_tuple(0, 1i64, vec![0]);
        client.blind(&tuple).unwrap();
        assert!(matches!(
            client.blind(&tuple),
            Err(CryptoError::BlindAlreadyOutstanding)
        ));
    }

    #[test]
    fn unblind_without_blind_is_a_usage_error() {
        let mut client = crypto_engines(3).remove(0);
        let tuple = value_tuple(0, 1i64, vec![0]);
        assert!(matches!(
            client.unblind(&tuple, &[0u8; 256]),
            Err(CryptoError::NoOutstandingBlind)
        ));
    }

    #[test]
    fn contribution_signatures_verify_per_signer() {
        let engines = crypto_engines(3);
        let contribution = dummy_contribution(0, 5i64, vec![0, 1, 2]);

        let signature = engines[1].sign_contribution(&contribution);
        assert!(engines[2].verify_contribution(&contribution, &signature, 1));
        // Wrong claimed signer.
        assert!(!engines[2].verify_contribution(&contribution, &signature, 0));
        // Unknown signer.
        assert!(!engines[2].verify_contribution(&contribution, &signature, 99));
    }

    #[test]
    fn envelope_encrypt_decrypt_in_place() {
        let engines = crypto_engines(2);
        let contribution = dummy_contribution(1, 7i64, vec![0, 1]);
        let mut message = OverlayMessage::new(
            1,
            1,
            Some(Arc::new(MessageBody::ValueContribution(contribution.clone()))),
        );

        engines[0].envelope_encrypt(&mut message, 1).unwrap();
        assert!(message.is_encrypted);
        assert!(matches!(message.body.as_deref(), Some(MessageBody::Bytes(_))));

        engines[1].envelope_decrypt(&mut message).unwrap();
        assert!(!message.is_encrypted);
        assert_eq!(
            message.body.as_deref(),
            Some(&MessageBody::ValueContribution(contribution))
        );
    }

    #[test]
    fn onion_peels_one_layer_per_hop() {
        let engines = crypto_engines(4);
        let contribution = dummy_contribution(2, 9i64, vec![1, 2, 3]);
        let payload = Arc::new(MessageBody::ValueContribution(contribution.clone()));
        let path = [1, 2, 3];

        let mut layer = engines[0].build_onion(&path, payload, 2).unwrap();
        for hop in [1usize, 2] {
            assert_eq!(layer.destination, path[hop - 1]);
            engines[hop].envelope_decrypt(&mut layer).unwrap();
            let Some(MessageBody::Overlay(inner)) = layer.body.as_deref() else {
                panic!("expected another onion layer");
            };
            layer = inner.clone();
        }
        assert_eq!(layer.destination, 3);
        engines[3].envelope_decrypt(&mut layer).unwrap();
        assert_eq!(
            layer.body.as_deref(),
            Some(&MessageBody::ValueContribution(contribution))
        );
    }
}
