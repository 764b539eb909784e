//! The cryptographic engine of the query protocol.
//!
//! Everything the protocol needs from cryptography goes through
//! [`CryptoEngine`]: ordinary RSA signatures on contributions and signature
//! bundles, the blind-signature exchange with the utility, envelope
//! encryption of overlay message bodies, and onion construction for the
//! shuffle phase. The primitives themselves come from the RustCrypto `rsa`
//! crate and `blind-rsa-signatures`; nothing outside this module touches
//! them directly.

pub(crate) mod envelope;
#[allow(clippy::module_inception)]
mod engine;
pub mod keys;

pub use self::engine::CryptoEngine;

use std::fmt;

use derive_more::From;
use thiserror::Error;

use crate::{
    message::{ByteReader, DecodeError, FromBytes, ToBytes},
    RSA_SIGNATURE_SIZE,
};

/// An error from the cryptographic engine.
///
/// A signature that merely fails to verify is *not* an error (verification
/// returns `bool`); these are failures of the primitives themselves, and the
/// message that triggered one must be abandoned.
#[derive(Error, Debug)]
pub enum CryptoError {
    #[error("could not load key file {path}: {reason}")]
    KeyFile { path: String, reason: String },

    #[error("no public key known for node {0}")]
    UnknownKey(crate::NodeId),

    #[error("blinding failed: {0}")]
    Blind(String),

    #[error("a blinded value is already outstanding; unblind it before blinding again")]
    BlindAlreadyOutstanding,

    #[error("no blinded value is outstanding; blind a value before unblinding")]
    NoOutstandingBlind,

    #[error("blind signature could not be finalized: {0}")]
    Unblind(String),

    #[error("envelope encryption failed: {0}")]
    Encrypt(String),

    #[error("envelope decryption failed: {0}")]
    Decrypt(String),

    #[error("signing failed: {0}")]
    Sign(String),
}

/// An object that has a fixed-length byte representation.
pub trait ByteObject: Sized {
    /// The length of the object in bytes.
    const LENGTH: usize;

    /// Creates the all-zero object.
    fn zeroed() -> Self;

    /// A view of the object as a byte slice.
    fn as_slice(&self) -> &[u8];

    /// Creates the object from a slice of exactly [`Self::LENGTH`] bytes.
    fn from_slice(bytes: &[u8]) -> Option<Self>;
}

/// An RSA-2048 signature, as attached to contributions, signature bundles
/// and agreement messages.
///
/// All signatures in the system have the same fixed size, which keeps the
/// wire format free of per-signature length prefixes.
#[derive(From, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Signature([u8; RSA_SIGNATURE_SIZE]);

impl ByteObject for Signature {
    const LENGTH: usize = RSA_SIGNATURE_SIZE;

    fn zeroed() -> Self {
        Self([0; RSA_SIGNATURE_SIZE])
    }

    fn as_slice(&self) -> &[u8] {
        &self.0
    }

    fn from_slice(bytes: &[u8]) -> Option<Self> {
        if bytes.len() != Self::LENGTH {
            return None;
        }
        let mut out = [0; RSA_SIGNATURE_SIZE];
        out.copy_from_slice(bytes);
        Some(Self(out))
    }
}

impl fmt::Debug for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // 256 bytes of hex would drown every log line; the first few are
        // plenty to tell signatures apart.
        write!(f, "Signature(")?;
        for byte in &self.0[..6] {
            write!(f, "{:02x}", byte)?;
        }
        write!(f, "…)")
    }
}

impl ToBytes for Signature {
    fn buffer_length(&self) -> usize {
        RSA_SIGNATURE_SIZE
    }

    fn to_bytes(&self, buffer: &mut Vec<u8>) {
        buffer.extend_from_slice(&self.0);
    }
}

impl FromBytes for Signature {
    fn from_bytes(reader: &mut ByteReader<'_>) -> Result<Self, DecodeError> {
        Ok(Self(reader.take_array::<RSA_SIGNATURE_SIZE>()?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signature_byte_object() {
        let sig = Signature::zeroed();
        assert_eq!(sig.as_slice().len(), 256);
        assert!(Signature::from_slice(&[0u8; 255]).is_none());
        assert_eq!(Signature::from_slice(sig.as_slice()), Some(sig));
    }

    #[test]
    fn signature_wire_round_trip() {
        let mut bytes = [0u8; 256];
        bytes[0] = 0xab;
        bytes[255] = 0xcd;
        let sig = Signature::from(bytes);

        let mut buf = Vec::new();
        sig.to_bytes(&mut buf);
        assert_eq!(buf.len(), sig.buffer_length());

        let mut reader = ByteReader::new(&buf);
        assert_eq!(Signature::from_bytes(&mut reader).unwrap(), sig);
    }
}
