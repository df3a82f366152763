use aes_gcm::aead::{AeadInPlace, KeyInit};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use rand::RngCore;

use super::CryptoEngine;
use vbk_types::error::{Result, VbkError};

const NONCE_LEN: usize = 12;
const TAG_LEN: usize = 16;

/// AES-256-GCM authenticated encryption engine.
///
/// Envelope: `[12-byte nonce][ciphertext][16-byte tag]`, cipher offset 12.
pub struct Aes256GcmEngine {
    cipher: Aes256Gcm,
    content_key_secret: [u8; 32],
}

impl Aes256GcmEngine {
    pub fn new(encryption_key: &[u8; 32], content_key_secret: &[u8; 32]) -> Self {
        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(encryption_key));
        Self {
            cipher,
            content_key_secret: *content_key_secret,
        }
    }
}

impl CryptoEngine for Aes256GcmEngine {
    fn encrypt_into(&self, plaintext: &[u8], aad: &[u8], output: &mut Vec<u8>) -> Result<u8> {
        let mut nonce_bytes = [0u8; NONCE_LEN];
        rand::thread_rng().fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        output.clear();
        output.reserve(NONCE_LEN + plaintext.len() + TAG_LEN);
        output.extend_from_slice(&nonce_bytes);
        output.extend_from_slice(plaintext);

        let tag = self
            .cipher
            .encrypt_in_place_detached(nonce, aad, &mut output[NONCE_LEN..])
            .map_err(|e| VbkError::Other(format!("AES-GCM encrypt: {e}")))?;
        output.extend_from_slice(&tag);
        Ok(NONCE_LEN as u8)
    }

    fn decrypt_into(
        &self,
        data: &[u8],
        cipher_offset: u8,
        aad: &[u8],
        output: &mut Vec<u8>,
    ) -> Result<()> {
        let offset = cipher_offset as usize;
        if offset != NONCE_LEN || data.len() < NONCE_LEN + TAG_LEN {
            return Err(VbkError::DecryptionFailed);
        }
        let (nonce_bytes, ct_and_tag) = data.split_at(offset);
        let nonce = Nonce::from_slice(nonce_bytes);
        let (ciphertext, tag_bytes) = ct_and_tag.split_at(ct_and_tag.len() - TAG_LEN);
        let tag = aes_gcm::Tag::from_slice(tag_bytes);
        output.clear();
        output.extend_from_slice(ciphertext);
        self.cipher
            .decrypt_in_place_detached(nonce, aad, output, tag)
            .map_err(|_| VbkError::DecryptionFailed)
    }

    fn is_encrypting(&self) -> bool {
        true
    }

    fn content_key_secret(&self) -> &[u8; 32] {
        &self.content_key_secret
    }
}
