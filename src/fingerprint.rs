//! Content fingerprinting
//!
//! Stable sha-256 fingerprints for message content and dedup keys.
//! Derivation must be bit-exact across process restarts: identical
//! inputs always hash to identical strings.

use serde::Serialize;
use sha2::{Digest, Sha256};
use std::io::Write;

/// Fingerprint of a fetched message: provider id plus the immutable
/// content fields. Re-fetching the same message yields the same value.
pub fn message_fingerprint(
    provider_message_id: &str,
    from_header: &str,
    subject: &str,
    body_text: &str,
) -> String {
    let mut hasher = Sha256::new();
    hasher.update(provider_message_id.as_bytes());
    hasher.update([0u8]);
    hasher.update(from_header.as_bytes());
    hasher.update([0u8]);
    hasher.update(subject.as_bytes());
    hasher.update([0u8]);
    hasher.update(body_text.as_bytes());
    hex::encode(hasher.finalize())
}

/// Hash any serializable value by streaming its JSON form into the
/// hasher (no intermediate String).
pub fn hash_value<T: Serialize>(value: &T) -> String {
    let mut hasher = Sha256::new();
    if serde_json::to_writer(&mut HashWriter(&mut hasher), value).is_err() {
        return String::new();
    }
    hex::encode(hasher.finalize())
}

/// Adapter to allow writing into Sha256 via std::io::Write
struct HashWriter<'a, H: Digest>(&'a mut H);

impl<'a, H: Digest> Write for HashWriter<'a, H> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.update(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}
