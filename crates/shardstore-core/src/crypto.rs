//! Transparent payload encryption.
//!
//! Record values are encrypted at rest with AES-256-CBC when the store is
//! configured with a secret. The 16-byte IV is drawn fresh per record and
//! prepended to the ciphertext, so the stored payload is `IV ++ ciphertext`.
//! Decryption failures are typed as [`StoreError::Crypto`]; the engine maps
//! them to "not found" on the read path.

use aes::cipher::{block_padding::Pkcs7, BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use rand::RngCore;

use crate::error::{Result, StoreError};
use crate::ident::derive_key;

type Aes256CbcEnc = cbc::Encryptor<aes::Aes256>;
type Aes256CbcDec = cbc::Decryptor<aes::Aes256>;

const IV_LEN: usize = 16;

/// Symmetric cipher for record payloads, keyed from the store secret.
#[derive(Clone)]
pub struct PayloadCipher {
    key: [u8; 32],
}

impl PayloadCipher {
    /// Build a cipher from the configured secret.
    pub fn new(secret: &str) -> Self {
        Self {
            key: derive_key(secret),
        }
    }

    /// Encrypt a serialized record value. Output is `IV ++ ciphertext`.
    pub fn encrypt(&self, plaintext: &[u8]) -> Vec<u8> {
        let mut iv = [0u8; IV_LEN];
        rand::thread_rng().fill_bytes(&mut iv);

        let enc = Aes256CbcEnc::new(&self.key.into(), &iv.into());
        let ciphertext = enc.encrypt_padded_vec_mut::<Pkcs7>(plaintext);

        let mut payload = Vec::with_capacity(IV_LEN + ciphertext.len());
        payload.extend_from_slice(&iv);
        payload.extend_from_slice(&ciphertext);
        payload
    }

    /// Decrypt a stored payload produced by [`encrypt`](Self::encrypt).
    ///
    /// # Errors
    ///
    /// Returns `StoreError::Crypto` if the payload is truncated, the key is
    /// wrong, or the padding is invalid. A wrong key is indistinguishable
    /// from corruption here; callers on the read path treat both as absence.
    pub fn decrypt(&self, payload: &[u8]) -> Result<Vec<u8>> {
        if payload.len() < IV_LEN || (payload.len() - IV_LEN) % IV_LEN != 0 {
            return Err(StoreError::Crypto(
                "Encrypted payload is truncated".to_string(),
            ));
        }
        let (iv, ciphertext) = payload.split_at(IV_LEN);

        let dec = Aes256CbcDec::new(&self.key.into(), iv.into());
        dec.decrypt_padded_vec_mut::<Pkcs7>(ciphertext)
            .map_err(|_| StoreError::Crypto("Decryption failed".to_string()))
    }
}
