use blake2::digest::consts::U32;
use blake2::digest::Mac;
use blake2::Blake2bMac;
use serde::{Deserialize, Serialize};
use std::fmt;

type KeyedBlake2b256 = Blake2bMac<U32>;

/// Dedup key of a block: keyed BLAKE2b-256 over the raw (plain) block bytes.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ContentKey(pub [u8; 32]);

impl ContentKey {
    pub fn compute(key: &[u8; 32], data: &[u8]) -> Self {
        // A 32-byte key is always within BLAKE2b's 64-byte key limit.
        let mut hasher = match KeyedBlake2b256::new_from_slice(key) {
            Ok(h) => h,
            Err(_) => unreachable!("32-byte key is valid for BLAKE2b"),
        };
        Mac::update(&mut hasher, data);
        let result = hasher.finalize();
        let mut out = [0u8; 32];
        out.copy_from_slice(&result.into_bytes());
        ContentKey(out)
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Parse a key from its 64-character hex form.
    pub fn from_hex(hex_str: &str) -> std::result::Result<Self, String> {
        let bytes = hex::decode(hex_str).map_err(|e| format!("invalid hex: {e}"))?;
        if bytes.len() != 32 {
            return Err(format!("expected 32 bytes, got {}", bytes.len()));
        }
        let mut arr = [0u8; 32];
        arr.copy_from_slice(&bytes);
        Ok(ContentKey(arr))
    }

    /// Storage key used by repositories: `blocks/<2-hex shard>/<hex>`.
    pub fn storage_key(&self) -> String {
        format!("blocks/{}/{}", hex::encode(&self.0[..1]), self.to_hex())
    }
}

impl fmt::Debug for ContentKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ContentKey({})", &self.to_hex()[..16])
    }
}

impl fmt::Display for ContentKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", &self.to_hex()[..16])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const KEY: [u8; 32] = [0xAA; 32];

    #[test]
    fn compute_deterministic() {
        let a = ContentKey::compute(&KEY, b"sector data");
        let b = ContentKey::compute(&KEY, b"sector data");
        assert_eq!(a, b);
    }

    #[test]
    fn different_data_different_key() {
        assert_ne!(
            ContentKey::compute(&KEY, b"block one"),
            ContentKey::compute(&KEY, b"block two")
        );
    }

    #[test]
    fn different_secret_different_key() {
        let data = b"same block";
        assert_ne!(
            ContentKey::compute(&[0x01; 32], data),
            ContentKey::compute(&[0x02; 32], data)
        );
    }

    #[test]
    fn hex_parse_matches_display() {
        let key = ContentKey::compute(&KEY, b"hex");
        let parsed = ContentKey::from_hex(&key.to_hex()).unwrap();
        assert_eq!(parsed, key);
        assert!(ContentKey::from_hex("abcd").is_err());
        assert!(ContentKey::from_hex("zz").is_err());
    }

    #[test]
    fn storage_key_is_sharded() {
        let key = ContentKey([0xAB; 32]);
        let storage = key.storage_key();
        assert!(storage.starts_with("blocks/ab/"));
        assert_eq!(storage.len(), "blocks/ab/".len() + 64);
    }

    #[test]
    fn msgpack_serialization_preserves_key() {
        let key = ContentKey::compute(&KEY, b"serde");
        let bytes = rmp_serde::to_vec(&key).unwrap();
        let back: ContentKey = rmp_serde::from_slice(&bytes).unwrap();
        assert_eq!(key, back);
    }
}
