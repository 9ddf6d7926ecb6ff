//! Mismatch expansion and the per-slot whitelist index.
//!
//! Every whitelist entry is expanded into all strings reachable by exactly
//! `max_mismatch` substitutions over `ACGTN` (which includes the entry itself
//! and every closer variant), and each of those strings points back at its
//! entry. Lookups are then plain hash hits.

use std::io::{BufRead, BufReader};
use std::path::Path;

use anyhow::{Context, Result};
use itertools::Itertools;
use log::debug;
use rustc_hash::{FxHashMap, FxHashSet};

use crate::errors::SccoreError;
use crate::io::open_text;

/// Substitution alphabet, the ambiguity symbol included.
pub const ALPHABET: [u8; 5] = *b"ACGTN";

/// All sequences obtained from `seq` by substituting `max_mismatch` chosen
/// positions with every symbol of [`ALPHABET`].
///
/// Because the alphabet contains each original base, the result also holds
/// `seq` and every variant with fewer substitutions.
///
/// ```
/// use sccore::mismatch::mismatch_neighbourhood;
///
/// let seqs = mismatch_neighbourhood(b"ACG", 1).unwrap();
/// assert_eq!(seqs.len(), 13);
/// assert!(seqs.contains(&b"ACN".to_vec()));
/// ```
pub fn mismatch_neighbourhood(
    seq: &[u8],
    max_mismatch: usize,
) -> Result<FxHashSet<Vec<u8>>, SccoreError> {
    if max_mismatch > seq.len() {
        return Err(SccoreError::InvalidMismatchBudget {
            max_mismatch,
            sequence: String::from_utf8_lossy(seq).into_owned(),
            len: seq.len(),
        });
    }

    let mut result = FxHashSet::default();
    if max_mismatch == 0 {
        result.insert(seq.to_vec());
        return Ok(result);
    }

    for positions in (0..seq.len()).combinations(max_mismatch) {
        for bases in (0..max_mismatch)
            .map(|_| ALPHABET.iter().copied())
            .multi_cartesian_product()
        {
            let mut variant = seq.to_vec();
            for (&pos, base) in positions.iter().zip(bases) {
                variant[pos] = base;
            }
            result.insert(variant);
        }
    }
    Ok(result)
}

/// How a read segment resolved against a slot whitelist.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotMatch<'a> {
    /// The segment is itself a whitelist entry
    Exact(&'a str),
    /// The segment is within the mismatch budget of this entry
    Corrected(&'a str),
}

impl<'a> SlotMatch<'a> {
    /// Canonical whitelist entry.
    pub fn barcode(&self) -> &'a str {
        match *self {
            SlotMatch::Exact(bc) | SlotMatch::Corrected(bc) => bc,
        }
    }

    pub fn is_corrected(&self) -> bool {
        matches!(self, SlotMatch::Corrected(_))
    }
}

/// Exact set plus mismatch map for one barcode slot.
///
/// When two entries lie within `2 * max_mismatch` substitutions of each
/// other their neighbourhoods overlap; an overlapping key maps to the entry
/// that was indexed last. Exact entries are checked first, so an entry is
/// never corrected away to a neighbour.
#[derive(Debug, Clone, Default)]
pub struct MismatchIndex {
    entries: Vec<String>,
    exact: FxHashMap<Vec<u8>, usize>,
    corrected: FxHashMap<Vec<u8>, usize>,
    max_mismatch: usize,
}

impl MismatchIndex {
    /// Index `whitelist`, skipping blank entries and trimming whitespace.
    pub fn build<I, S>(whitelist: I, max_mismatch: usize) -> Result<Self, SccoreError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut index = MismatchIndex {
            max_mismatch,
            ..Default::default()
        };

        for entry in whitelist {
            let entry = entry.as_ref().trim();
            if entry.is_empty() {
                continue;
            }
            let id = index.entries.len();
            let neighbours = mismatch_neighbourhood(entry.as_bytes(), max_mismatch)?;
            index.entries.push(entry.to_string());
            index.exact.insert(entry.as_bytes().to_vec(), id);
            for seq in neighbours {
                index.corrected.insert(seq, id);
            }
        }

        debug!(
            "indexed {} whitelist entries into {} sequences within {} mismatch(es)",
            index.entries.len(),
            index.corrected.len(),
            max_mismatch
        );
        Ok(index)
    }

    /// Load a one-column whitelist file (plain or `.gz`) and index it.
    pub fn from_path(path: &Path, max_mismatch: usize) -> Result<Self> {
        let reader = BufReader::new(open_text(path)?);
        let lines: Vec<String> = reader
            .lines()
            .collect::<std::io::Result<_>>()
            .with_context(|| format!("Failed to read whitelist {}", path.display()))?;
        let index = Self::build(&lines, max_mismatch)
            .with_context(|| format!("Failed to index whitelist {}", path.display()))?;
        Ok(index)
    }

    /// Resolve `seq` against this slot: exact hit first, then the mismatch map.
    #[inline]
    pub fn classify(&self, seq: &[u8]) -> Option<SlotMatch<'_>> {
        if let Some(&id) = self.exact.get(seq) {
            return Some(SlotMatch::Exact(&self.entries[id]));
        }
        self.corrected
            .get(seq)
            .map(|&id| SlotMatch::Corrected(&self.entries[id]))
    }

    pub fn contains_exact(&self, seq: &[u8]) -> bool {
        self.exact.contains_key(seq)
    }

    /// Whitelist entries in file order.
    pub fn entries(&self) -> &[String] {
        &self.entries
    }

    pub fn max_mismatch(&self) -> usize {
        self.max_mismatch
    }

}
