//! Offset search for layouts whose barcode region may be preceded by a few
//! extra bases.
//!
//! The linkers between barcode slots sit at fixed distances from each
//! other, so the true start of the barcode region is the smallest offset at
//! which every linker resolves against its whitelist.

use std::ops::Range;

use crate::errors::{Result, SccoreError};
use crate::mismatch::MismatchIndex;
use crate::pattern::{slice_clamped, Kind, PatternMap};

/// Offsets beyond the declared maximum that are still tried.
pub const EXTRA_OFFSET_TOLERANCE: usize = 1;

#[derive(Debug, Clone)]
pub struct OffsetSearch {
    linkers: Vec<MismatchIndex>,
    /// Linker positions at offset 0
    linker_ranges: Vec<Range<usize>>,
    max_offset: usize,
}

impl OffsetSearch {
    /// Linker `i` is expected at `(i + 1) * slot_len + i * linker_len` bytes
    /// past the offset.
    ///
    /// Returns `None` when a shifted linker position does not fit in a
    /// `usize`.
    fn with_lengths(
        linkers: Vec<MismatchIndex>,
        slot_len: usize,
        linker_len: usize,
        max_offset: usize,
    ) -> Option<Self> {
        let last_offset = max_offset.checked_add(EXTRA_OFFSET_TOLERANCE)?;
        let linker_ranges = (0..linkers.len())
            .map(|i| {
                let start = (i + 1)
                    .checked_mul(slot_len)?
                    .checked_add(i.checked_mul(linker_len)?)?;
                let end = start.checked_add(linker_len)?;
                end.checked_add(last_offset)?;
                Some(start..end)
            })
            .collect::<Option<Vec<_>>>()?;
        Some(OffsetSearch {
            linkers,
            linker_ranges,
            max_offset,
        })
    }

    /// Take slot and linker lengths from the first `C` and `L` ranges of
    /// `pattern`.
    pub fn from_pattern(
        name: &str,
        pattern: &PatternMap,
        linkers: Vec<MismatchIndex>,
        max_offset: usize,
    ) -> Result<Self> {
        if linkers.is_empty() {
            return Err(SccoreError::invalid_protocol(
                name,
                "variable offset requires at least one linker whitelist",
            ));
        }
        let (Some(slot), Some(linker)) = (
            pattern.ranges(Kind::Barcode).first(),
            pattern.ranges(Kind::Linker).first(),
        ) else {
            return Err(SccoreError::invalid_protocol(
                name,
                format!("pattern {pattern} needs barcode and linker segments for offset search"),
            ));
        };
        Self::with_lengths(linkers, slot.len(), linker.len(), max_offset).ok_or_else(|| {
            SccoreError::invalid_protocol(name, format!("max_offset {max_offset} overflows the linker positions"))
        })
    }

    pub fn max_offset(&self) -> usize {
        self.max_offset
    }

    /// Smallest offset in `0..=max_offset + 1` at which every linker
    /// resolves, or `None`. Offsets that push the first linker past the end
    /// of the read are not tried.
    pub fn find_offset(&self, seq: &[u8]) -> Option<usize> {
        let first = self.linker_ranges.first()?.start;
        (0..=self.max_offset + EXTRA_OFFSET_TOLERANCE)
            .take_while(|&offset| first + offset < seq.len())
            .find(|&offset| self.linkers_valid_at(seq, offset))
    }

    fn linkers_valid_at(&self, seq: &[u8], offset: usize) -> bool {
        self.linker_ranges
            .iter()
            .zip(&self.linkers)
            .all(|(range, index)| {
                let shifted = range.start + offset..range.end + offset;
                index.classify(slice_clamped(seq, &shifted)).is_some()
            })
    }
}
