//! Streaming digests
//!
//! Computes several digests over the same bytes in one pass. MD5 and
//! SHA-256 are always on; SHA-1 and SHA-512 only when requested.

use md5::Md5;
use sha1::Sha1;
use sha2::{Digest, Sha256, Sha512};
use std::collections::BTreeMap;

/// Every digest name this module knows, in field order
pub const HASH_NAMES: [&str; 4] = ["md5", "sha1", "sha256", "sha512"];

/// Incremental MD5 / SHA-1 / SHA-256 / SHA-512
pub struct MultiHash {
    md5: Md5,
    sha1: Option<Sha1>,
    sha256: Sha256,
    sha512: Option<Sha512>,
}

impl MultiHash {
    /// Hash with the digests named in `functions` (all of them when empty)
    pub fn new(functions: &[String]) -> Self {
        let wants = |name: &str| functions.is_empty() || functions.iter().any(|f| f == name);

        Self {
            md5: Md5::new(),
            sha1: wants("sha1").then(Sha1::new),
            sha256: Sha256::new(),
            sha512: wants("sha512").then(Sha512::new),
        }
    }

    pub fn update(&mut self, data: &[u8]) {
        self.md5.update(data);
        self.sha256.update(data);
        if let Some(sha1) = self.sha1.as_mut() {
            sha1.update(data);
        }
        if let Some(sha512) = self.sha512.as_mut() {
            sha512.update(data);
        }
    }

    /// Finalize into name → lowercase hex digest
    pub fn finish(self) -> BTreeMap<String, String> {
        let mut hashes = BTreeMap::new();
        hashes.insert("md5".to_string(), hex::encode(self.md5.finalize()));
        hashes.insert("sha256".to_string(), hex::encode(self.sha256.finalize()));
        if let Some(sha1) = self.sha1 {
            hashes.insert("sha1".to_string(), hex::encode(sha1.finalize()));
        }
        if let Some(sha512) = self.sha512 {
            hashes.insert("sha512".to_string(), hex::encode(sha512.finalize()));
        }
        hashes
    }
}

impl Default for MultiHash {
    fn default() -> Self {
        Self::new(&[])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_known_digests() {
        let mut hash = MultiHash::default();
        hash.update(b"hel");
        hash.update(b"lo");
        let hashes = hash.finish();

        assert_eq!(hashes["md5"], "5d41402abc4b2a76b9719d911017c592");
        assert_eq!(hashes["sha1"], "aaf4c61ddcc5e8a2dabede0f3b482cd9aea9434d");
        assert_eq!(
            hashes["sha256"],
            "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824"
        );
        assert_eq!(hashes["sha512"].len(), 128);
    }

    #[test]
    fn test_subset_keeps_md5_and_sha256() {
        let hashes = MultiHash::new(&["sha1".to_string()]).finish();

        assert!(hashes.contains_key("md5"));
        assert!(hashes.contains_key("sha1"));
        assert!(hashes.contains_key("sha256"));
        assert!(!hashes.contains_key("sha512"));
    }
}
