//! Content fingerprints used as the dedup key.
//!
//! The digest is a SHA-256 hash of the error type and the normalised
//! backtrace. Equal digests are necessary but not sufficient for a match:
//! [`Fingerprint::matches`] also compares the type and normalised text, so a
//! hash collision can never fold two different defects together.

use std::fmt;

use sha2::{Digest, Sha256};

use crate::normalise::normalise_backtrace;
use crate::types::AggregateError;

/// Fingerprint of one report, with the inputs needed to verify a match.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fingerprint {
    digest: String,
    error_type: String,
    normalised_backtrace: String,
}

impl Fingerprint {
    /// Compute the fingerprint of an already sanitised error type and a raw
    /// backtrace. Empty inputs are valid.
    #[must_use]
    pub fn compute(error_type: &str, backtrace: &str) -> Self {
        const DELIMITER: &[u8] = b"\x00";

        let normalised_backtrace = normalise_backtrace(backtrace);

        let mut hasher = Sha256::new();
        hasher.update(error_type.as_bytes());
        hasher.update(DELIMITER);
        hasher.update(normalised_backtrace.as_bytes());

        Self {
            digest: hex::encode(hasher.finalize()),
            error_type: error_type.to_owned(),
            normalised_backtrace,
        }
    }

    /// Hex-encoded SHA-256 digest (64 characters).
    #[must_use]
    pub fn digest(&self) -> &str {
        &self.digest
    }

    #[must_use]
    pub fn error_type(&self) -> &str {
        &self.error_type
    }

    #[must_use]
    pub fn normalised_backtrace(&self) -> &str {
        &self.normalised_backtrace
    }

    /// Whether `aggregate` records the same defect as this fingerprint.
    ///
    /// Requires equal digests, equal error types and equal normalised
    /// backtraces.
    #[must_use]
    pub fn matches(&self, aggregate: &AggregateError) -> bool {
        aggregate.fingerprint == self.digest
            && aggregate.error_type == self.error_type
            && normalise_backtrace(&aggregate.backtrace) == self.normalised_backtrace
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.digest)
    }
}
