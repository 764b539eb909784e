//! Key loading.
//!
//! Every node owns an RSA-2048 key pair. Private keys are read from PEM
//! files at start-up (key-file problems are fatal by design); public keys of
//! all peers plus the utility are pre-installed and loaded the same way.
//! Both PKCS#8 (`BEGIN PRIVATE KEY`) and PKCS#1 (`BEGIN RSA PRIVATE KEY`)
//! encodings are accepted.

use std::{collections::HashMap, fs, path::Path};

use rsa::{
    pkcs1::{DecodeRsaPrivateKey, DecodeRsaPublicKey},
    pkcs8::{DecodePrivateKey, DecodePublicKey},
    RsaPrivateKey, RsaPublicKey,
};

use crate::{crypto::CryptoError, NodeId};

fn key_file_error(path: &Path, reason: impl ToString) -> CryptoError {
    CryptoError::KeyFile {
        path: path.display().to_string(),
        reason: reason.to_string(),
    }
}

/// Loads an RSA private key from a PEM file.
pub fn load_private_key(path: &Path) -> Result<RsaPrivateKey, CryptoError> {
    let pem = fs::read_to_string(path).map_err(|e| key_file_error(path, e))?;
    RsaPrivateKey::from_pkcs8_pem(&pem)
        .or_else(|_| RsaPrivateKey::from_pkcs1_pem(&pem))
        .map_err(|e| key_file_error(path, e))
}

/// Loads an RSA public key from a PEM file.
pub fn load_public_key(path: &Path) -> Result<RsaPublicKey, CryptoError> {
    let pem = fs::read_to_string(path).map_err(|e| key_file_error(path, e))?;
    RsaPublicKey::from_public_key_pem(&pem)
        .or_else(|_| RsaPublicKey::from_pkcs1_pem(&pem))
        .map_err(|e| key_file_error(path, e))
}

/// Loads the public keys of a set of nodes from their PEM files.
pub fn load_public_keys(
    key_files: &HashMap<NodeId, std::path::PathBuf>,
) -> Result<HashMap<NodeId, RsaPublicKey>, CryptoError> {
    key_files
        .iter()
        .map(|(id, path)| Ok((*id, load_public_key(path)?)))
        .collect()
}
