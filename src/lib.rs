//! Cell barcode and UMI extraction for single-cell sequencing reads.
//!
//! A protocol describes where barcode, linker and UMI segments sit in the
//! first read of a pair (see [`pattern`]). Barcode segments are corrected
//! against per-slot whitelists within a small mismatch budget
//! ([`mismatch`], [`correct`]); the protocol of a sample can be detected from
//! a sample of its reads ([`detect`]); and [`extract`] streams paired reads,
//! writing each valid second read under a `barcode:umi:index` name.

pub mod correct;
pub mod detect;
pub mod errors;
pub mod extract;
pub mod io;
pub mod mismatch;
pub mod offset;
pub mod pattern;
pub mod protocol;

pub use correct::{BarcodeCorrector, Correction};
pub use detect::{DetectionParams, Detector};
pub use errors::SccoreError;
pub use extract::{extract, ExtractStats, Extractor};
pub use mismatch::MismatchIndex;
pub use pattern::{parse_pattern, Kind, PatternMap};
pub use protocol::{Protocol, Registry};
