//! Fatal error kinds raised by the barcode/UMI engine.
//!
//! Per-read validity failures are not errors: invalid reads are counted and
//! dropped by the extraction pipeline. Everything here aborts a run.

use thiserror::Error;

/// Result type alias for the pure parts of the engine.
pub type Result<T> = std::result::Result<T, SccoreError>;

#[derive(Error, Debug)]
pub enum SccoreError {
    /// Malformed or empty pattern string, or a disallowed kind character
    #[error("Invalid pattern '{pattern}': {reason}")]
    InvalidPattern { pattern: String, reason: String },

    /// Mismatch budget larger than a whitelist sequence
    #[error("Invalid mismatch budget {max_mismatch} for sequence '{sequence}' of length {len}")]
    InvalidMismatchBudget {
        max_mismatch: usize,
        sequence: String,
        len: usize,
    },

    /// The best protocol of a sampled stream was below the minimum confidence
    #[error(
        "Auto protocol detection failed for {stream}: best fraction {fraction:.4} of {sampled} sampled reads is below {min_confidence} (tally: {tally})"
    )]
    ProtocolDetectionFailed {
        stream: String,
        sampled: usize,
        fraction: f64,
        min_confidence: f64,
        tally: String,
    },

    /// Streams of one sample resolved to different protocols
    #[error(
        "Multiple protocols are not allowed for one sample: {stream} is {found} but {reference_stream} is {expected}"
    )]
    InconsistentProtocol {
        stream: String,
        found: String,
        reference_stream: String,
        expected: String,
    },

    #[error("Unknown protocol '{name}' (registered: {known})")]
    UnknownProtocol { name: String, known: String },

    /// A registry entry whose pattern, whitelists and rules do not fit together
    #[error("Invalid protocol '{protocol}': {reason}")]
    InvalidProtocol { protocol: String, reason: String },

    #[error("Read lists differ in length: {fq1} first-read files but {fq2} second-read files")]
    UnequalInputLists { fq1: usize, fq2: usize },

    #[error("Paired files have different record counts: {stream} ended at record {record} while its mate continued")]
    UnpairedReads { stream: String, record: usize },
}

impl SccoreError {
    #[cold]
    pub fn invalid_pattern<P: Into<String>, R: Into<String>>(pattern: P, reason: R) -> Self {
        SccoreError::InvalidPattern {
            pattern: pattern.into(),
            reason: reason.into(),
        }
    }

    #[cold]
    pub fn invalid_protocol<P: Into<String>, R: Into<String>>(protocol: P, reason: R) -> Self {
        SccoreError::InvalidProtocol {
            protocol: protocol.into(),
            reason: reason.into(),
        }
    }
}
