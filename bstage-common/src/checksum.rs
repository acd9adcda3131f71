use crate::error::CommonError;
use sha2::{Digest, Sha256};

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

/// Check `bytes` against a pinned lowercase or uppercase hex digest.
pub fn verify_sha256(bytes: &[u8], expected: &str) -> Result<(), CommonError> {
    let actual = sha256_hex(bytes);
    if actual.eq_ignore_ascii_case(expected.trim()) {
        Ok(())
    } else {
        Err(CommonError::ChecksumMismatch {
            expected: expected.trim().to_lowercase(),
            actual,
        })
    }
}
