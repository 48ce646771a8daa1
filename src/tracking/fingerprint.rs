//! Site-scoped fingerprint hashing
//!
//! The stored key is `hex(sha256(site_id || fingerprint))`. Mixing the site id
//! in means the same browser produces unrelated keys on unrelated sites.
//! Site ids have a fixed length, so the concatenation is unambiguous.

use sha2::{Digest, Sha256};

use crate::models::SiteId;

/// Length of the hex-encoded digest
pub const FINGERPRINT_HASH_LENGTH: usize = 64;

pub fn hash_fingerprint(site_id: &SiteId, fingerprint: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(site_id.as_str().as_bytes());
    hasher.update(fingerprint.as_bytes());
    hex::encode(hasher.finalize())
}
