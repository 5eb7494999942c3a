//! Workflow fingerprints.
//!
//! Every submitted graph is hashed so run metadata can tell apart two
//! attempts that differ only in an injected value.

use sha2::{Digest, Sha256};

/// Lowercase hex SHA-256 of `data`.
pub fn sha256_hex(data: &[u8]) -> String {
    let hash = Sha256::digest(data);
    format!("{hash:x}")
}

/// Fingerprint a workflow by hashing its compact JSON form.
///
/// `serde_json` maps are key-sorted, so the same logical graph always
/// yields the same fingerprint.
pub fn workflow_fingerprint(workflow: &serde_json::Value) -> String {
    let canonical = serde_json::to_string(workflow).unwrap_or_default();
    sha256_hex(canonical.as_bytes())
}
