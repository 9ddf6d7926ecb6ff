//! Slice barcode and UMI segments out of a read and resolve the barcodes
//! against their slot whitelists.

use std::ops::Range;

use crate::errors::{Result, SccoreError};
use crate::mismatch::MismatchIndex;
use crate::pattern::{slice_clamped, Kind, PatternMap};

/// Separator placed between per-slot barcodes.
pub const BARCODE_SEPARATOR: &str = "_";

/// Outcome of resolving a read's barcode segments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentCheck {
    /// Every segment resolved to a whitelist entry
    pub valid: bool,
    /// At least one segment needed a mismatch correction
    pub corrected: bool,
    /// Resolved segments joined by [`BARCODE_SEPARATOR`]; unresolved slots
    /// are empty strings so positions stay stable
    pub barcode: String,
}

/// Per-read result of barcode correction and UMI extraction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Correction {
    pub valid: bool,
    pub corrected: bool,
    pub barcode: String,
    /// UMI, present only for valid reads
    pub umi: Option<String>,
}

/// Resolve each segment against the index at the same position.
///
/// All segments are evaluated even after one fails.
pub fn resolve_segments<'s, I>(segments: I, indices: &[MismatchIndex]) -> SegmentCheck
where
    I: IntoIterator<Item = &'s [u8]>,
{
    let mut valid = true;
    let mut corrected = false;
    let mut parts: Vec<&str> = Vec::with_capacity(indices.len());

    for (seq, index) in segments.into_iter().zip(indices) {
        match index.classify(seq) {
            Some(hit) => {
                corrected |= hit.is_corrected();
                parts.push(hit.barcode());
            }
            None => {
                valid = false;
                parts.push("");
            }
        }
    }

    SegmentCheck {
        valid,
        corrected,
        barcode: parts.join(BARCODE_SEPARATOR),
    }
}

/// Take segments verbatim for a layout without whitelists.
///
/// A segment cut short by the end of the read fails; nothing is corrected.
fn accept_segments<'s, I>(segments: I, ranges: &[Range<usize>]) -> SegmentCheck
where
    I: IntoIterator<Item = &'s [u8]>,
{
    let mut valid = true;
    let parts: Vec<String> = segments
        .into_iter()
        .zip(ranges)
        .map(|(seq, range)| {
            if seq.len() == range.len() {
                String::from_utf8_lossy(seq).into_owned()
            } else {
                valid = false;
                String::new()
            }
        })
        .collect();

    SegmentCheck {
        valid,
        corrected: false,
        barcode: parts.join(BARCODE_SEPARATOR),
    }
}

/// A parsed pattern bound to one whitelist index per barcode range, or to
/// none at all when barcodes are taken as read.
#[derive(Debug, Clone)]
pub struct BarcodeCorrector {
    pattern: PatternMap,
    slots: Vec<MismatchIndex>,
    umi: Range<usize>,
}

impl BarcodeCorrector {
    /// Bind `slots` to the `C` ranges of `pattern`.
    ///
    /// The pattern must have exactly one `U` range and as many `C` ranges as
    /// there are slots. With no slots every `C` range is accepted verbatim.
    pub fn new(name: &str, pattern: PatternMap, slots: Vec<MismatchIndex>) -> Result<Self> {
        let n_ranges = pattern.ranges(Kind::Barcode).len();
        if n_ranges == 0 {
            return Err(SccoreError::invalid_protocol(
                name,
                format!("pattern {pattern} has no barcode segment"),
            ));
        }
        if !slots.is_empty() && n_ranges != slots.len() {
            return Err(SccoreError::invalid_protocol(
                name,
                format!(
                    "pattern {pattern} has {n_ranges} barcode segments but {} whitelists were given",
                    slots.len()
                ),
            ));
        }
        let umi = pattern.umi_range().ok_or_else(|| {
            SccoreError::invalid_protocol(name, format!("pattern {pattern} must have exactly one UMI segment"))
        })?;
        Ok(BarcodeCorrector { pattern, slots, umi })
    }

    pub fn pattern(&self) -> &PatternMap {
        &self.pattern
    }

    /// Whether barcodes are corrected against whitelists.
    pub fn has_whitelists(&self) -> bool {
        !self.slots.is_empty()
    }

    /// Resolve the barcode segments of `seq` without looking at the UMI.
    pub fn check_barcodes(&self, seq: &[u8]) -> SegmentCheck {
        let ranges = self.pattern.ranges(Kind::Barcode);
        let segments = ranges.iter().map(|r| slice_clamped(seq, r));
        if self.has_whitelists() {
            resolve_segments(segments, &self.slots)
        } else {
            accept_segments(segments, ranges)
        }
    }

    /// Correct the barcodes of `seq` and take its UMI.
    ///
    /// A read whose barcodes resolve but which is too short to hold the full
    /// UMI is reported invalid.
    pub fn correct(&self, seq: &[u8]) -> Correction {
        let SegmentCheck {
            mut valid,
            corrected,
            barcode,
        } = self.check_barcodes(seq);

        let umi = if valid && seq.len() >= self.umi.end {
            Some(String::from_utf8_lossy(&seq[self.umi.clone()]).into_owned())
        } else {
            valid = false;
            None
        };

        Correction {
            valid,
            corrected,
            barcode,
            umi,
        }
    }
}
