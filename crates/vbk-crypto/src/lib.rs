pub mod aes_gcm;

use std::sync::Arc;

use vbk_types::error::Result;

pub use crate::aes_gcm::Aes256GcmEngine;

/// Trait for encrypting and decrypting stored blocks.
///
/// Encryption reports a `cipher_offset`: the number of envelope bytes that
/// precede the ciphertext in the output. It is stored with the block record
/// and must be handed back to `decrypt`.
pub trait CryptoEngine: Send + Sync {
    /// Encrypt `plaintext` into `output`, reusing its capacity.
    /// Returns the cipher offset.
    fn encrypt_into(&self, plaintext: &[u8], aad: &[u8], output: &mut Vec<u8>) -> Result<u8>;

    /// Decrypt data produced by `encrypt_into` into a caller-provided buffer.
    fn decrypt_into(
        &self,
        data: &[u8],
        cipher_offset: u8,
        aad: &[u8],
        output: &mut Vec<u8>,
    ) -> Result<()>;

    fn encrypt(&self, plaintext: &[u8], aad: &[u8]) -> Result<(Vec<u8>, u8)> {
        let mut out = Vec::new();
        let offset = self.encrypt_into(plaintext, aad, &mut out)?;
        Ok((out, offset))
    }

    fn decrypt(&self, data: &[u8], cipher_offset: u8, aad: &[u8]) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        self.decrypt_into(data, cipher_offset, aad, &mut out)?;
        Ok(out)
    }

    /// Whether this engine actually encrypts data.
    fn is_encrypting(&self) -> bool;

    /// The secret used for computing content keys (keyed BLAKE2b-256).
    fn content_key_secret(&self) -> &[u8; 32];
}

/// No-encryption engine. Still computes deterministic content keys.
pub struct PlaintextEngine {
    content_key_secret: [u8; 32],
}

impl PlaintextEngine {
    pub fn new(content_key_secret: &[u8; 32]) -> Self {
        Self {
            content_key_secret: *content_key_secret,
        }
    }
}

impl CryptoEngine for PlaintextEngine {
    fn encrypt_into(&self, plaintext: &[u8], _aad: &[u8], output: &mut Vec<u8>) -> Result<u8> {
        output.clear();
        output.extend_from_slice(plaintext);
        Ok(0)
    }

    fn decrypt_into(
        &self,
        data: &[u8],
        _cipher_offset: u8,
        _aad: &[u8],
        output: &mut Vec<u8>,
    ) -> Result<()> {
        output.clear();
        output.extend_from_slice(data);
        Ok(())
    }

    fn is_encrypting(&self) -> bool {
        false
    }

    fn content_key_secret(&self) -> &[u8; 32] {
        &self.content_key_secret
    }
}

/// Pick an engine: AES-256-GCM when an encryption key is present, plaintext otherwise.
pub fn select_engine(
    encryption_key: Option<&[u8; 32]>,
    content_key_secret: &[u8; 32],
) -> Arc<dyn CryptoEngine> {
    match encryption_key {
        Some(key) => Arc::new(Aes256GcmEngine::new(key, content_key_secret)),
        None => Arc::new(PlaintextEngine::new(content_key_secret)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plaintext_encrypt_is_identity() {
        let engine = PlaintextEngine::new(&[0xAA; 32]);
        let (encrypted, offset) = engine.encrypt(b"hello plaintext", b"aad").unwrap();
        assert_eq!(encrypted, b"hello plaintext");
        assert_eq!(offset, 0);
    }

    #[test]
    fn plaintext_roundtrip_ignores_aad() {
        let engine = PlaintextEngine::new(&[0xCC; 32]);
        let (encrypted, offset) = engine.encrypt(b"test data", b"aad1").unwrap();
        let decrypted = engine.decrypt(&encrypted, offset, b"different_aad").unwrap();
        assert_eq!(decrypted, b"test data");
    }

    #[test]
    fn plaintext_content_key_secret() {
        let key = [0xBB; 32];
        let engine = PlaintextEngine::new(&key);
        assert_eq!(engine.content_key_secret(), &key);
        assert!(!engine.is_encrypting());
    }

    #[test]
    fn select_engine_by_key_presence() {
        let secret = [0x01; 32];
        assert!(!select_engine(None, &secret).is_encrypting());
        let engine = select_engine(Some(&[0x02; 32]), &secret);
        assert!(engine.is_encrypting());
        assert_eq!(engine.content_key_secret(), &secret);
    }
}
