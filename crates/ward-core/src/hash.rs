//! Content fingerprints (SHA-256, lowercase hex).

use std::path::Path;

use sha2::{Digest, Sha256};

use crate::errors::WardError;
use crate::fsutil::read_optional;

/// Fingerprint arbitrary bytes.
pub fn fingerprint(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

/// Fingerprint a file's current bytes. `None` when the file does not exist.
pub fn file_fingerprint(path: &Path) -> Result<Option<String>, WardError> {
    Ok(read_optional(path)?.map(|bytes| fingerprint(&bytes)))
}

/// Whether `s` looks like a fingerprint produced by [`fingerprint`].
pub fn is_fingerprint(s: &str) -> bool {
    s.len() == 64 && s.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'))
}
