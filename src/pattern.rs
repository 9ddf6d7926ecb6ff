//! Pattern grammar for barcode reads.
//!
//! A pattern such as `C8L16C8L16C8L1U12T18` is a run of `<KIND><LENGTH>`
//! tokens describing the read prefix left to right. Parsing produces, for
//! each kind, the ordered half-open byte ranges it occupies.

use std::collections::BTreeMap;
use std::fmt;
use std::ops::Range;

use lazy_static::lazy_static;
use regex::Regex;

use crate::errors::{Result, SccoreError};

lazy_static! {
    static ref TOKEN: Regex = Regex::new(r"([A-Z])(\d+)").expect("token regex is valid");
}

/// Segment kind of a pattern token.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Kind {
    /// `C`: cell barcode segment, corrected against a whitelist
    Barcode,
    /// `L`: linker / spacer
    Linker,
    /// `U`: UMI
    Umi,
    /// `N`: ignored bases
    Ignored,
    /// `T`: poly-T or fixed tail
    Tail,
}

/// Kinds accepted when the caller does not widen the alphabet.
pub const DEFAULT_KINDS: [Kind; 4] = [Kind::Barcode, Kind::Linker, Kind::Umi, Kind::Tail];

impl Kind {
    pub fn from_char(c: char) -> Option<Kind> {
        match c {
            'C' => Some(Kind::Barcode),
            'L' => Some(Kind::Linker),
            'U' => Some(Kind::Umi),
            'N' => Some(Kind::Ignored),
            'T' => Some(Kind::Tail),
            _ => None,
        }
    }

    pub fn as_char(self) -> char {
        match self {
            Kind::Barcode => 'C',
            Kind::Linker => 'L',
            Kind::Umi => 'U',
            Kind::Ignored => 'N',
            Kind::Tail => 'T',
        }
    }
}

/// Parsed pattern: the ranges of every kind, in encounter order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PatternMap {
    tokens: Vec<(Kind, usize)>,
    ranges: BTreeMap<Kind, Vec<Range<usize>>>,
}

impl PatternMap {
    /// Ranges of `kind`, empty when the pattern has none.
    pub fn ranges(&self, kind: Kind) -> &[Range<usize>] {
        self.ranges.get(&kind).map(Vec::as_slice).unwrap_or(&[])
    }

    /// The UMI range, when the pattern has exactly one.
    pub fn umi_range(&self) -> Option<Range<usize>> {
        match self.ranges(Kind::Umi) {
            [umi] => Some(umi.clone()),
            _ => None,
        }
    }

    /// Number of read bases governed by the pattern.
    pub fn len(&self) -> usize {
        self.ranges
            .values()
            .filter_map(|ranges| ranges.last())
            .map(|r| r.end)
            .max()
            .unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }
}

impl fmt::Display for PatternMap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (kind, len) in &self.tokens {
            write!(f, "{}{}", kind.as_char(), len)?;
        }
        Ok(())
    }
}

impl std::str::FromStr for PatternMap {
    type Err = SccoreError;

    fn from_str(s: &str) -> Result<Self> {
        parse_pattern(s)
    }
}

/// Parse `pattern` with the default `{C, L, U, T}` alphabet.
///
/// ```
/// use sccore::pattern::{parse_pattern, Kind};
///
/// let map = parse_pattern("C8L16C8L16C8L1U12T18").unwrap();
/// assert_eq!(map.ranges(Kind::Barcode), &[0..8, 24..32, 48..56]);
/// assert_eq!(map.umi_range(), Some(57..69));
/// ```
pub fn parse_pattern(pattern: &str) -> Result<PatternMap> {
    parse_pattern_with(pattern, &DEFAULT_KINDS)
}

/// Parse `pattern`, accepting only the kinds in `allowed`.
///
/// The tokens must cover the whole string. Ranges are laid out by cumulative
/// offset; no gaps are inferred.
pub fn parse_pattern_with(pattern: &str, allowed: &[Kind]) -> Result<PatternMap> {
    if pattern.is_empty() {
        return Err(SccoreError::invalid_pattern(pattern, "pattern cannot be empty"));
    }

    let mut tokens = Vec::new();
    let mut ranges: BTreeMap<Kind, Vec<Range<usize>>> = BTreeMap::new();
    let mut cursor = 0;
    let mut start: usize = 0;

    for caps in TOKEN.captures_iter(pattern) {
        let Some(whole) = caps.get(0) else { continue };
        if whole.start() != cursor {
            return Err(SccoreError::invalid_pattern(
                pattern,
                format!("unexpected text '{}'", &pattern[cursor..whole.start()]),
            ));
        }
        cursor = whole.end();

        let c = caps[1].chars().next().unwrap_or_default();
        let kind = Kind::from_char(c)
            .filter(|k| allowed.contains(k))
            .ok_or_else(|| SccoreError::invalid_pattern(pattern, format!("invalid character '{c}'")))?;
        let len: usize = caps[2]
            .parse()
            .map_err(|_| SccoreError::invalid_pattern(pattern, format!("bad length '{}'", &caps[2])))?;
        if len == 0 {
            return Err(SccoreError::invalid_pattern(
                pattern,
                format!("segment '{c}' has zero length"),
            ));
        }

        let end = start
            .checked_add(len)
            .ok_or_else(|| SccoreError::invalid_pattern(pattern, "pattern length overflows"))?;
        ranges.entry(kind).or_default().push(start..end);
        tokens.push((kind, len));
        start = end;
    }

    if cursor != pattern.len() {
        return Err(SccoreError::invalid_pattern(
            pattern,
            format!("unexpected text '{}'", &pattern[cursor..]),
        ));
    }

    Ok(PatternMap { tokens, ranges })
}

/// Slice `range` out of `seq`, truncated to the read length.
#[inline]
pub fn slice_clamped<'a>(seq: &'a [u8], range: &Range<usize>) -> &'a [u8] {
    let end = range.end.min(seq.len());
    let start = range.start.min(end);
    &seq[start..end]
}
