//! Entity identifiers, version tokens, and content hashes.

use sha2::{Digest, Sha256};
use ulid::Ulid;
use uuid::Uuid;

/// Fresh 128-bit entity identifier, stable for the entity's lifetime.
pub fn new_guid() -> String {
    Uuid::new_v4().to_string()
}

/// Mint a version token strictly greater than `current`.
///
/// Tokens are ULIDs (48-bit millisecond prefix, 80-bit randomness), so
/// they sort lexicographically in mint order. Two commits inside the
/// same millisecond could still collide backwards on the random part,
/// so keep minting until the ordering holds.
pub fn next_version(current: &str) -> String {
    loop {
        let version = Ulid::new().to_string();
        if version.as_str() > current {
            return version;
        }
    }
}

/// Deterministic content hash over body, meta and status.
///
/// Each part is framed by its little-endian u64 length so that shifting
/// bytes between parts always changes the hash. Used only to detect
/// unchanged writes.
pub fn content_etag(body: &[u8], meta: &[u8], status: &[u8]) -> String {
    let mut hasher = Sha256::new();
    for part in [body, meta, status] {
        hasher.update((part.len() as u64).to_le_bytes());
        hasher.update(part);
    }
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_guid_unique() {
        let a = new_guid();
        let b = new_guid();
        assert_eq!(a.len(), 36);
        assert_ne!(a, b);
    }

    #[test]
    fn test_version_strictly_increases() {
        let mut current = String::new();
        for _ in 0..50 {
            let next = next_version(&current);
            assert!(next.as_str() > current.as_str());
            assert_eq!(next.len(), 26);
            current = next;
        }
    }

    #[test]
    fn test_etag_deterministic() {
        let a = content_etag(b"body", b"meta", b"status");
        let b = content_etag(b"body", b"meta", b"status");
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
        assert_ne!(a, content_etag(b"body2", b"meta", b"status"));
    }

    #[test]
    fn test_etag_framing() {
        // Moving bytes across part boundaries must change the hash.
        assert_ne!(
            content_etag(b"ab", b"", b""),
            content_etag(b"a", b"b", b"")
        );
        assert_ne!(content_etag(b"", b"ab", b""), content_etag(b"", b"a", b"b"));
    }
}
