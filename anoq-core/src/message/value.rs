//! Value-carrying message bodies: the contribution a client makes to a query
//! and the signature bundles the agreement phase wraps around it.

use std::sync::Arc;

use anyhow::Context;
use std::collections::BTreeMap;

use crate::{
    crypto::Signature,
    message::{ByteReader, DecodeError, FromBytes, ToBytes},
    NodeId, Record,
};

/// The tuple a client contributes to one query: the query number, the
/// selected record, and the ordered proxy set the client chose.
///
/// Built once in the setup phase and immutable afterwards; every message
/// that carries it shares the same allocation by reference. The proxy set
/// participates in equality, so two clients contributing the same
/// measurement with different proxy sets do not collide.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ValueTuple<R> {
    pub query_num: i32,
    pub value: R,
    pub proxies: Vec<NodeId>,
}

impl<R: Record> ToBytes for ValueTuple<R> {
    fn buffer_length(&self) -> usize {
        self.query_num.buffer_length() + self.value.buffer_length() + self.proxies.buffer_length()
    }

    fn to_bytes(&self, buffer: &mut Vec<u8>) {
        self.query_num.to_bytes(buffer);
        self.value.to_bytes(buffer);
        self.proxies.to_bytes(buffer);
    }
}

impl<R: Record> FromBytes for ValueTuple<R> {
    fn from_bytes(reader: &mut ByteReader<'_>) -> Result<Self, DecodeError> {
        let query_num = i32::from_bytes(reader).context("cannot parse query number")?;
        let value = R::from_bytes(reader).context("cannot parse record")?;
        let proxies = Vec::from_bytes(reader).context("cannot parse proxy list")?;
        Ok(Self {
            query_num,
            value,
            proxies,
        })
    }
}

/// A [`ValueTuple`] together with the utility's (unblinded) signature on it.
///
/// Both fields take part in equality and hashing: a proxy deduplicates
/// contributions by the pair, never by the tuple alone.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ValueContribution<R> {
    pub tuple: ValueTuple<R>,
    pub utility_signature: Signature,
}

impl<R> ValueContribution<R> {
    pub fn new(tuple: ValueTuple<R>, utility_signature: Signature) -> Self {
        Self {
            tuple,
            utility_signature,
        }
    }
}

impl<R: Record> ToBytes for ValueContribution<R> {
    fn buffer_length(&self) -> usize {
        self.tuple.buffer_length() + self.utility_signature.buffer_length()
    }

    fn to_bytes(&self, buffer: &mut Vec<u8>) {
        self.tuple.to_bytes(buffer);
        self.utility_signature.to_bytes(buffer);
    }
}

impl<R: Record> FromBytes for ValueContribution<R> {
    fn from_bytes(reader: &mut ByteReader<'_>) -> Result<Self, DecodeError> {
        let tuple = ValueTuple::from_bytes(reader).context("cannot parse value tuple")?;
        let utility_signature =
            Signature::from_bytes(reader).context("cannot parse utility signature")?;
        Ok(Self {
            tuple,
            utility_signature,
        })
    }
}

/// A contribution with the signatures it has accumulated during phase 1 of
/// agreement.
///
/// Every proxy that receives the contribution adds its own signature over
/// the contribution bytes; inserting the same signer twice just replaces the
/// entry. The map is ordered so the serialised form (which gets signed in
/// phase 2) is deterministic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignedValue<R> {
    pub contribution: Arc<ValueContribution<R>>,
    pub signatures: BTreeMap<NodeId, Signature>,
}

impl<R> SignedValue<R> {
    pub fn new(contribution: Arc<ValueContribution<R>>) -> Self {
        Self {
            contribution,
            signatures: BTreeMap::new(),
        }
    }

    /// A signature bundle with a single entry, as sent in phase 1.
    pub fn with_signature(
        contribution: Arc<ValueContribution<R>>,
        signer: NodeId,
        signature: Signature,
    ) -> Self {
        let mut signed = Self::new(contribution);
        signed.signatures.insert(signer, signature);
        signed
    }
}

impl<R: Record> ToBytes for SignedValue<R> {
    fn buffer_length(&self) -> usize {
        self.contribution.buffer_length()
            + 8
            + self.signatures.len() * (4 + crate::RSA_SIGNATURE_SIZE)
    }

    fn to_bytes(&self, buffer: &mut Vec<u8>) {
        self.contribution.to_bytes(buffer);
        (self.signatures.len() as u64).to_bytes(buffer);
        for (signer, signature) in &self.signatures {
            signer.to_bytes(buffer);
            signature.to_bytes(buffer);
        }
    }
}

impl<R: Record> FromBytes for SignedValue<R> {
    fn from_bytes(reader: &mut ByteReader<'_>) -> Result<Self, DecodeError> {
        let contribution =
            ValueContribution::from_bytes(reader).context("cannot parse contribution")?;
        let count = reader.take_count().context("cannot parse signature count")?;
        let mut signatures = BTreeMap::new();
        for _ in 0..count {
            let signer = NodeId::from_bytes(reader).context("cannot parse signer id")?;
            let signature = Signature::from_bytes(reader).context("cannot parse signature")?;
            signatures.insert(signer, signature);
        }
        Ok(Self {
            contribution: Arc::new(contribution),
            signatures,
        })
    }
}

/// A [`SignedValue`] that some proxy found acceptable at the end of phase 1,
/// wrapped with that proxy's signature over the whole bundle. The phase-2
/// message of Crusader Agreement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgreementValue<R> {
    pub signed_value: SignedValue<R>,
    pub accepter_id: NodeId,
    pub accepter_signature: Signature,
}

impl<R: Record> ToBytes for AgreementValue<R> {
    fn buffer_length(&self) -> usize {
        self.signed_value.buffer_length()
            + self.accepter_id.buffer_length()
            + self.accepter_signature.buffer_length()
    }

    fn to_bytes(&self, buffer: &mut Vec<u8>) {
        self.signed_value.to_bytes(buffer);
        self.accepter_id.to_bytes(buffer);
        self.accepter_signature.to_bytes(buffer);
    }
}

impl<R: Record> FromBytes for AgreementValue<R> {
    fn from_bytes(reader: &mut ByteReader<'_>) -> Result<Self, DecodeError> {
        let signed_value = SignedValue::from_bytes(reader).context("cannot parse signed value")?;
        let accepter_id = NodeId::from_bytes(reader).context("cannot parse accepter id")?;
        let accepter_signature =
            Signature::from_bytes(reader).context("cannot parse accepter signature")?;
        Ok(Self {
            signed_value,
            accepter_id,
            accepter_signature,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::ByteObject;

    fn tuple(query_num: i32, value: i64, proxies: Vec<NodeId>) -> ValueTuple<i64> {
        ValueTuple {
            query_num,
            value,
            proxies,
        }
    }

    fn signature(fill: u8) -> Signature {
        Signature::from_slice(&[fill; 256]).unwrap()
    }

    #[test]
    fn tuple_round_trip() {
        let t = tuple(3, 42, vec![0, 2, 5]);
        let mut buf = Vec::new();
        t.to_bytes(&mut buf);
        assert_eq!(buf.len(), t.buffer_length());

        let parsed = ValueTuple::<i64>::from_bytes(&mut ByteReader::new(&buf)).unwrap();
        assert_eq!(parsed, t);
    }

    #[test]
    fn proxies_take_part_in_equality() {
        let a = ValueContribution::new(tuple(1, 9, vec![0, 1]), signature(0xaa));
        let b = ValueContribution::new(tuple(1, 9, vec![0, 2]), signature(0xaa));
        assert_ne!(a, b);
    }

    #[test]
    fn contribution_equality_covers_signature() {
        let a = ValueContribution::new(tuple(1, 9, vec![0, 1]), signature(0xaa));
        let b = ValueContribution::new(tuple(1, 9, vec![0, 1]), signature(0xbb));
        assert_ne!(a, b);
    }

    #[test]
    fn signed_value_round_trip() {
        let contribution = Arc::new(ValueContribution::new(
            tuple(7, -3, vec![1, 4, 6]),
            signature(0x11),
        ));
        let mut signed = SignedValue::with_signature(contribution, 4, signature(0x22));
        signed.signatures.insert(6, signature(0x33));

        let mut buf = Vec::new();
        signed.to_bytes(&mut buf);
        assert_eq!(buf.len(), signed.buffer_length());

        let parsed = SignedValue::<i64>::from_bytes(&mut ByteReader::new(&buf)).unwrap();
        assert_eq!(parsed, signed);
    }

    #[test]
    fn duplicate_signer_replaces_entry() {
        let contribution = Arc::new(ValueContribution::new(tuple(1, 0, vec![2]), signature(0)));
        let mut signed = SignedValue::with_signature(contribution, 2, signature(0x22));
        signed.signatures.insert(2, signature(0x44));
        assert_eq!(signed.signatures.len(), 1);
        assert_eq!(signed.signatures[&2], signature(0x44));
    }

    #[test]
    fn agreement_value_round_trip() {
        let contribution = Arc::new(ValueContribution::new(
            tuple(2, 10, vec![0, 3]),
            signature(0x01),
        ));
        let signed = SignedValue::with_signature(contribution, 3, signature(0x02));
        let agreement = AgreementValue {
            signed_value: signed,
            accepter_id: 3,
            accepter_signature: signature(0x03),
        };

        let mut buf = Vec::new();
        agreement.to_bytes(&mut buf);
        assert_eq!(buf.len(), agreement.buffer_length());

        let parsed = AgreementValue::<i64>::from_bytes(&mut ByteReader::new(&buf)).unwrap();
        assert_eq!(parsed, agreement);
    }
}
