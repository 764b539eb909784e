//! Hybrid envelope encryption for overlay message bodies.
//!
//! Wire layout of a sealed body: `wrapped session key (256B) || IV (16B) ||
//! AES-256-CBC ciphertext`. The session key is wrapped with RSA-OAEP under
//! the recipient's public key. One layer of this is what each overlay hop
//! peels off an onion.

use aes::cipher::{block_padding::Pkcs7, BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use rand::{rngs::OsRng, RngCore};
use rsa::{Oaep, RsaPrivateKey, RsaPublicKey};
use sha2::Sha256;

use crate::{crypto::CryptoError, RSA_SIGNATURE_SIZE};

type Aes256CbcEnc = cbc::Encryptor<aes::Aes256>;
type Aes256CbcDec = cbc::Decryptor<aes::Aes256>;

const SESSION_KEY_LEN: usize = 32;
const IV_LEN: usize = 16;
/// An RSA-OAEP ciphertext is exactly one modulus wide.
const WRAPPED_KEY_LEN: usize = RSA_SIGNATURE_SIZE;

/// Encrypts `plaintext` so that only the owner of `recipient` can read it.
pub fn seal(recipient: &RsaPublicKey, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let mut session_key = [0u8; SESSION_KEY_LEN];
    let mut iv = [0u8; IV_LEN];
    OsRng.fill_bytes(&mut session_key);
    OsRng.fill_bytes(&mut iv);

    let wrapped_key = recipient
        .encrypt(&mut OsRng, Oaep::new::<Sha256>(), &session_key)
        .map_err(|e| CryptoError::Encrypt(e.to_string()))?;
    debug_assert_eq!(wrapped_key.len(), WRAPPED_KEY_LEN);

    let ciphertext = Aes256CbcEnc::new(&session_key.into(), &iv.into())
        .encrypt_padded_vec_mut::<Pkcs7>(plaintext);

    let mut sealed = Vec::with_capacity(WRAPPED_KEY_LEN + IV_LEN + ciphertext.len());
    sealed.extend_from_slice(&wrapped_key);
    sealed.extend_from_slice(&iv);
    sealed.extend_from_slice(&ciphertext);
    Ok(sealed)
}

/// Reverses [`seal`] with the recipient's private key.
pub fn open(recipient: &RsaPrivateKey, sealed: &[u8]) -> Result<Vec<u8>, CryptoError> {
    if sealed.len() < WRAPPED_KEY_LEN + IV_LEN {
        return Err(CryptoError::Decrypt(format!(
            "sealed body too short: {} bytes",
            sealed.len()
        )));
    }
    let (wrapped_key, rest) = sealed.split_at(WRAPPED_KEY_LEN);
    let (iv, ciphertext) = rest.split_at(IV_LEN);

    let session_key = recipient
        .decrypt(Oaep::new::<Sha256>(), wrapped_key)
        .map_err(|e| CryptoError::Decrypt(e.to_string()))?;
    if session_key.len() != SESSION_KEY_LEN {
        return Err(CryptoError::Decrypt("bad session key length".into()));
    }

    let key: [u8; SESSION_KEY_LEN] = session_key.as_slice().try_into().unwrap();
    let iv: [u8; IV_LEN] = iv.try_into().unwrap();
    Aes256CbcDec::new(&key.into(), &iv.into())
        .decrypt_padded_vec_mut::<Pkcs7>(ciphertext)
        .map_err(|e| CryptoError::Decrypt(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutils::keys;

    #[test]
    fn seal_open_round_trip() {
        let key = keys::test_key(0);
        let plaintext = b"the proxies must not learn who sent this".to_vec();
        let sealed = seal(&key.to_public_key(), &plaintext).unwrap();
        assert_ne!(sealed, plaintext);
        assert_eq!(open(key, &sealed).unwrap(), plaintext);
    }

    #[test]
    fn wrong_key_fails_to_open() {
        let sealed = seal(&keys::test_key(0).to_public_key(), b"secret").unwrap();
        assert!(open(keys::test_key(1), &sealed).is_err());
    }

    #[test]
    fn tampered_body_fails_to_open() {
        let key = keys::test_key(0);
        let mut sealed = seal(&key.to_public_key(), b"secret payload").unwrap();
        let last = sealed.len() - 1;
        sealed[last] ^= 0xff;
        assert!(open(key, &sealed).is_err());
    }

    #[test]
    fn truncated_body_is_an_error() {
        assert!(matches!(
            open(keys::test_key(0), &[0u8; 40]),
            Err(CryptoError::Decrypt(_))
        ));
    }
}
