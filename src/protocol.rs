//! Protocol definitions and the registry they are selected from.
//!
//! A registry is loaded once from a JSON document listing every protocol in
//! priority order. All whitelists are indexed up front; afterwards the
//! registry is only read.

use std::collections::HashSet;
use std::fs;
use std::ops::Range;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use log::info;
use rayon::prelude::*;
use rustc_hash::FxHashMap;
use serde::Deserialize;

use crate::correct::{BarcodeCorrector, Correction, SegmentCheck};
use crate::errors::SccoreError;
use crate::mismatch::MismatchIndex;
use crate::offset::OffsetSearch;
use crate::pattern::{parse_pattern, slice_clamped, Kind, PatternMap};

fn default_max_mismatch() -> usize {
    1
}

/// Registry document.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RegistryConfig {
    /// Substitutions tolerated in barcodes and linkers
    #[serde(default = "default_max_mismatch")]
    pub max_mismatch: usize,
    pub protocols: Vec<ProtocolConfig>,
}

/// One registry entry.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProtocolConfig {
    pub name: String,
    pub pattern: String,
    /// One whitelist file per `C` segment; empty to take barcodes as read
    #[serde(default)]
    pub bc: Vec<PathBuf>,
    /// Linker whitelists used by the offset search
    #[serde(default)]
    pub linker: Vec<PathBuf>,
    /// Present for layouts with a variable number of leading bases
    #[serde(default)]
    pub max_offset: Option<usize>,
    #[serde(default)]
    pub anchor: Option<AnchorConfig>,
    #[serde(default)]
    pub tail_rule: Option<TailRuleConfig>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AnchorConfig {
    /// Pattern kind letter, e.g. `L`
    pub kind: char,
    /// Which range of that kind, 0-based
    pub index: usize,
    pub sequence: String,
}

/// Half-open windows as `[start, end]` pairs.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TailRuleConfig {
    pub absent: [usize; 2],
    pub present: [usize; 2],
    pub base: char,
}

/// Where the barcode region starts.
#[derive(Debug, Clone)]
pub enum Layout {
    /// At the first base of the read
    Fixed,
    /// After a short, per-read number of leading bases located via the linkers
    VariableOffset(OffsetSearch),
}

/// A fixed sequence that must appear verbatim at a pattern range.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Anchor {
    pub range: Range<usize>,
    pub sequence: Vec<u8>,
}

impl Anchor {
    fn resolve(name: &str, pattern: &PatternMap, config: &AnchorConfig) -> Result<Anchor, SccoreError> {
        let kind = Kind::from_char(config.kind).ok_or_else(|| {
            SccoreError::invalid_protocol(name, format!("unknown anchor kind '{}'", config.kind))
        })?;
        let range = pattern.ranges(kind).get(config.index).cloned().ok_or_else(|| {
            SccoreError::invalid_protocol(
                name,
                format!("pattern {pattern} has no {}[{}] for the anchor", config.kind, config.index),
            )
        })?;
        if range.len() != config.sequence.len() {
            return Err(SccoreError::invalid_protocol(
                name,
                format!(
                    "anchor '{}' does not fit the {}-base segment {}[{}]",
                    config.sequence,
                    range.len(),
                    config.kind,
                    config.index
                ),
            ));
        }
        Ok(Anchor {
            range,
            sequence: config.sequence.as_bytes().to_vec(),
        })
    }

    pub fn matches(&self, seq: &[u8]) -> bool {
        slice_clamped(seq, &self.range) == self.sequence.as_slice()
    }
}

/// Homopolymer rule for layouts recognised by where their tail starts:
/// `present` must be a full run of `base` while `absent` must not be.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TailRule {
    pub absent: Range<usize>,
    pub present: Range<usize>,
    pub base: u8,
}

impl TailRule {
    fn resolve(name: &str, config: &TailRuleConfig) -> Result<TailRule, SccoreError> {
        let window = |[start, end]: [usize; 2]| -> Result<Range<usize>, SccoreError> {
            if start >= end {
                return Err(SccoreError::invalid_protocol(
                    name,
                    format!("tail rule window [{start}, {end}] is empty"),
                ));
            }
            Ok(start..end)
        };
        if !config.base.is_ascii_alphabetic() {
            return Err(SccoreError::invalid_protocol(
                name,
                format!("tail rule base '{}' is not a nucleotide", config.base),
            ));
        }
        Ok(TailRule {
            absent: window(config.absent)?,
            present: window(config.present)?,
            base: config.base as u8,
        })
    }

    fn is_run(&self, seq: &[u8], range: &Range<usize>) -> bool {
        let window = slice_clamped(seq, range);
        window.len() == range.len() && window.iter().all(|&b| b == self.base)
    }

    pub fn matches(&self, seq: &[u8]) -> bool {
        !self.is_run(seq, &self.absent) && self.is_run(seq, &self.present)
    }
}

/// A named read layout together with its whitelists.
#[derive(Debug, Clone)]
pub struct Protocol {
    name: String,
    corrector: BarcodeCorrector,
    layout: Layout,
    anchor: Option<Anchor>,
    tail_rule: Option<TailRule>,
}

impl Protocol {
    /// A protocol without whitelists must carry a tail rule, otherwise it
    /// would claim every read long enough to hold its barcodes.
    pub fn new(
        name: impl Into<String>,
        pattern: PatternMap,
        slots: Vec<MismatchIndex>,
        layout: Layout,
        anchor: Option<Anchor>,
        tail_rule: Option<TailRule>,
    ) -> Result<Self, SccoreError> {
        let name = name.into();
        let corrector = BarcodeCorrector::new(&name, pattern, slots)?;
        if !corrector.has_whitelists() && tail_rule.is_none() {
            return Err(SccoreError::invalid_protocol(
                name,
                "a protocol without barcode whitelists needs a tail_rule",
            ));
        }
        Ok(Protocol {
            name,
            corrector,
            layout,
            anchor,
            tail_rule,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn pattern(&self) -> &PatternMap {
        self.corrector.pattern()
    }

    pub fn layout(&self) -> &Layout {
        &self.layout
    }

    pub fn anchor(&self) -> Option<&Anchor> {
        self.anchor.as_ref()
    }

    pub fn tail_rule(&self) -> Option<&TailRule> {
        self.tail_rule.as_ref()
    }

    /// Detection group: offset layouts first, then anchored, then plain,
    /// with tail-rule fallbacks last.
    fn priority(&self) -> u8 {
        match (&self.layout, &self.anchor, &self.tail_rule) {
            (_, _, Some(_)) => 3,
            (Layout::VariableOffset(_), _, None) => 0,
            (Layout::Fixed, Some(_), None) => 1,
            (Layout::Fixed, None, None) => 2,
        }
    }

    /// Strip the leading bases in front of the barcode region.
    ///
    /// Returns `None` for a variable-offset layout when no offset validates.
    pub fn trim<'a>(&self, seq: &'a [u8]) -> Option<&'a [u8]> {
        match &self.layout {
            Layout::Fixed => Some(seq),
            Layout::VariableOffset(search) => search.find_offset(seq).map(|offset| &seq[offset..]),
        }
    }

    /// Whether `seq` looks like a read of this protocol.
    ///
    /// Variable-offset layouts are recognised by their linkers alone; fixed
    /// layouts need every barcode to resolve and the anchor, if any, to match.
    /// A tail rule applies on top of either.
    pub fn matches(&self, seq: &[u8]) -> bool {
        let layout_ok = match &self.layout {
            Layout::VariableOffset(search) => search.find_offset(seq).is_some(),
            Layout::Fixed => {
                self.corrector.check_barcodes(seq).valid
                    && self.anchor.as_ref().map_or(true, |a| a.matches(seq))
            }
        };
        layout_ok && self.tail_rule.as_ref().map_or(true, |t| t.matches(seq))
    }

    /// Barcode resolution after trimming, without the UMI.
    pub fn check_barcodes(&self, seq: &[u8]) -> Option<SegmentCheck> {
        self.trim(seq).map(|s| self.corrector.check_barcodes(s))
    }

    /// Correct the barcodes of a first read and extract its UMI.
    pub fn correct(&self, seq: &[u8]) -> Correction {
        match self.trim(seq) {
            Some(s) => self.corrector.correct(s),
            None => Correction {
                valid: false,
                corrected: false,
                barcode: String::new(),
                umi: None,
            },
        }
    }
}

/// Read-only set of protocols in priority order.
#[derive(Debug, Clone)]
pub struct Registry {
    protocols: Vec<Protocol>,
    detection_order: Vec<usize>,
}

impl Registry {
    pub fn new(protocols: Vec<Protocol>) -> Result<Self, SccoreError> {
        let mut seen = HashSet::new();
        for p in &protocols {
            if !seen.insert(p.name()) {
                return Err(SccoreError::invalid_protocol(p.name(), "registered more than once"));
            }
        }
        let mut detection_order: Vec<usize> = (0..protocols.len()).collect();
        // stable: registry order is kept within a group
        detection_order.sort_by_key(|&i| protocols[i].priority());
        Ok(Registry {
            protocols,
            detection_order,
        })
    }

    /// Load the registry document at `path`, resolving whitelist paths
    /// relative to its directory.
    pub fn from_path(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)
            .with_context(|| format!("Failed to read protocol registry {}", path.display()))?;
        let config: RegistryConfig = serde_json::from_str(&text)
            .with_context(|| format!("Failed to parse protocol registry {}", path.display()))?;
        let base = path.parent().unwrap_or_else(|| Path::new("."));
        Self::from_config(&config, base)
    }

    pub fn from_config(config: &RegistryConfig, base: &Path) -> Result<Self> {
        for pc in &config.protocols {
            if pc.max_offset.is_none() && !pc.linker.is_empty() {
                return Err(SccoreError::invalid_protocol(&pc.name, "linker whitelists require max_offset").into());
            }
        }

        let resolve = |p: &PathBuf| if p.is_absolute() { p.clone() } else { base.join(p) };

        // Index every distinct whitelist file once, in parallel.
        let mut files: Vec<PathBuf> = config
            .protocols
            .iter()
            .flat_map(|p| p.bc.iter().chain(&p.linker))
            .map(resolve)
            .collect();
        files.sort();
        files.dedup();
        let indices: FxHashMap<PathBuf, MismatchIndex> = files
            .into_par_iter()
            .map(|f| MismatchIndex::from_path(&f, config.max_mismatch).map(|idx| (f, idx)))
            .collect::<Result<_>>()?;
        let lookup = |p: &PathBuf| -> MismatchIndex { indices[&resolve(p)].clone() };

        let mut protocols = Vec::with_capacity(config.protocols.len());
        for pc in &config.protocols {
            let pattern = parse_pattern(&pc.pattern)
                .with_context(|| format!("Invalid pattern for protocol {}", pc.name))?;
            let slots = pc.bc.iter().map(lookup).collect();
            let layout = match pc.max_offset {
                Some(max_offset) => {
                    let linkers = pc.linker.iter().map(lookup).collect();
                    Layout::VariableOffset(OffsetSearch::from_pattern(
                        &pc.name, &pattern, linkers, max_offset,
                    )?)
                }
                None => Layout::Fixed,
            };
            let anchor = pc
                .anchor
                .as_ref()
                .map(|a| Anchor::resolve(&pc.name, &pattern, a))
                .transpose()?;
            let tail_rule = pc
                .tail_rule
                .as_ref()
                .map(|t| TailRule::resolve(&pc.name, t))
                .transpose()?;
            protocols.push(Protocol::new(pc.name.clone(), pattern, slots, layout, anchor, tail_rule)?);
        }

        let registry = Self::new(protocols)?;
        info!(
            "Loaded {} protocol(s): {}",
            registry.protocols.len(),
            registry.names().join(", ")
        );
        Ok(registry)
    }

    pub fn protocols(&self) -> &[Protocol] {
        &self.protocols
    }

    pub fn names(&self) -> Vec<&str> {
        self.protocols.iter().map(Protocol::name).collect()
    }

    pub fn get(&self, name: &str) -> Result<&Protocol, SccoreError> {
        self.protocols
            .iter()
            .find(|p| p.name() == name)
            .ok_or_else(|| SccoreError::UnknownProtocol {
                name: name.to_string(),
                known: self.names().join(", "),
            })
    }

    /// Protocols in the order the detector tries them.
    pub fn detection_order(&self) -> impl Iterator<Item = &Protocol> + '_ {
        self.detection_order.iter().map(move |&i| &self.protocols[i])
    }

    /// First protocol, in detection order, that claims `seq`.
    pub fn classify(&self, seq: &[u8]) -> Option<&Protocol> {
        self.detection_order().find(|p| p.matches(seq))
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::TempDir;

    pub(crate) const V1_BC: [&str; 3] = ["NCAGATTC", "GTACGCAA", "CTGAGCCA"];
    pub(crate) const V2_BC: [&str; 3] = ["TCGACTGTC", "TTCTAGGAT", "TGCACGAGA"];

    pub(crate) fn write_lines(dir: &Path, name: &str, lines: &[&str]) -> PathBuf {
        let path = dir.join(name);
        let mut f = fs::File::create(&path).unwrap();
        for l in lines {
            writeln!(f, "{l}").unwrap();
        }
        path
    }

    /// GEXSCOPE-like registry with fixture whitelists on disk.
    pub(crate) fn fixture_registry(dir: &TempDir) -> Registry {
        write_lines(dir.path(), "v1_bc.txt", &V1_BC);
        write_lines(dir.path(), "v2_bc.txt", &V2_BC);
        write_lines(dir.path(), "linker1.txt", &["ACGATG"]);
        write_lines(dir.path(), "linker2.txt", &["CATAGT"]);
        let json = r#"{
            "protocols": [
                {"name": "GEXSCOPE-V2", "pattern": "C9L16C9L16C9L1U12T18",
                 "bc": ["v2_bc.txt", "v2_bc.txt", "v2_bc.txt"]},
                {"name": "GEXSCOPE-V1", "pattern": "C8L16C8L16C8L1U12T18",
                 "bc": ["v1_bc.txt", "v1_bc.txt", "v1_bc.txt"]},
                {"name": "flv_rna", "pattern": "C8L16C8L16C8U9L6",
                 "bc": ["v1_bc.txt", "v1_bc.txt", "v1_bc.txt"],
                 "anchor": {"kind": "L", "index": 2, "sequence": "CTGTCT"}},
                {"name": "GEXSCOPE-V3", "pattern": "C9L6C9L6C9L1U12T18",
                 "bc": ["v2_bc.txt", "v2_bc.txt", "v2_bc.txt"],
                 "linker": ["linker1.txt", "linker2.txt"], "max_offset": 3},
                {"name": "GEXSCOPE-MicroBead", "pattern": "C12U8",
                 "tail_rule": {"absent": [16, 20], "present": [22, 26], "base": "T"}}
            ]
        }"#;
        let path = dir.path().join("protocols.json");
        fs::write(&path, json).unwrap();
        Registry::from_path(&path).unwrap()
    }

    #[test]
    fn test_registry_detection_order() {
        let dir = TempDir::new().unwrap();
        let registry = fixture_registry(&dir);
        assert_eq!(
            registry.names(),
            vec!["GEXSCOPE-V2", "GEXSCOPE-V1", "flv_rna", "GEXSCOPE-V3", "GEXSCOPE-MicroBead"]
        );
        let order: Vec<&str> = registry.detection_order().map(Protocol::name).collect();
        assert_eq!(
            order,
            vec!["GEXSCOPE-V3", "flv_rna", "GEXSCOPE-V2", "GEXSCOPE-V1", "GEXSCOPE-MicroBead"]
        );
    }

    #[test]
    fn test_classify_reads() {
        let dir = TempDir::new().unwrap();
        let registry = fixture_registry(&dir);
        let name = |seq: String| registry.classify(seq.as_bytes()).map(|p| p.name().to_string());

        let v3 = format!("AT{}ACGATG{}CATAGT{}C{}{}", V2_BC[0], "TTCTAGGAT", V2_BC[2], "CATATCAATGGG", "T".repeat(10));
        assert_eq!(name(v3).as_deref(), Some("GEXSCOPE-V3"));

        let v2 = format!(
            "{}ATCCACGTGCTTGAGA{}TCAGCATGCGGCTACG{}C{}{}",
            V2_BC[0], V2_BC[1], V2_BC[2], "CATATCAATGGG", "T".repeat(10)
        );
        assert_eq!(name(v2).as_deref(), Some("GEXSCOPE-V2"));

        let v1 = format!(
            "{}TCGGTGACAGCCATAT{}CGTAGTCAGAAGCTGA{}C{}{}",
            V1_BC[0], V1_BC[1], V1_BC[2], "TCCGAAGCCCAT", "T".repeat(10)
        );
        assert_eq!(name(v1).as_deref(), Some("GEXSCOPE-V1"));

        let flv = format!(
            "{}TCGGTGACAGCCATAT{}CGTAGTCAGAAGCTGA{}TCCGAAGCCCTGTCT",
            V1_BC[0], V1_BC[1], V1_BC[2]
        );
        assert_eq!(name(flv).as_deref(), Some("flv_rna"));

        let microbead = format!("{}{}C{}", "ATCGATCGATCG", "ATCGATCG", "T".repeat(10));
        assert_eq!(name(microbead).as_deref(), Some("GEXSCOPE-MicroBead"));

        assert_eq!(name("A".repeat(80)), None);
    }

    #[test]
    fn test_tail_rule_protocol() {
        let dir = TempDir::new().unwrap();
        let registry = fixture_registry(&dir);
        let microbead = registry.get("GEXSCOPE-MicroBead").unwrap();
        let rule = microbead.tail_rule().unwrap();
        assert_eq!((rule.absent.clone(), rule.present.clone(), rule.base), (16..20, 22..26, b'T'));

        let read = format!("{}{}C{}", "ATCGATCGATCG", "ATCGATCG", "T".repeat(10));
        assert!(microbead.matches(read.as_bytes()));
        let c = microbead.correct(read.as_bytes());
        assert!(c.valid);
        assert!(!c.corrected);
        assert_eq!(c.barcode, "ATCGATCGATCG");
        assert_eq!(c.umi.as_deref(), Some("ATCGATCG"));

        // poly-T already at 16..20
        let early_tail = format!("{}{}", "ATCGATCGATCGATCG", "T".repeat(14));
        assert!(!microbead.matches(early_tail.as_bytes()));
        // read ends before the tail window
        assert!(!microbead.matches(&read.as_bytes()[..24]));
    }

    #[test]
    fn test_v3_correct_strips_offset() {
        let dir = TempDir::new().unwrap();
        let registry = fixture_registry(&dir);
        let v3 = registry.get("GEXSCOPE-V3").unwrap();
        // second barcode carries one substitution (TTCTAGGAT -> TTCGAGGAT) which is not in the
        // whitelist's exact set
        let seq = format!("AT{}ACGATGTTCGAGGATCATAGT{}C{}{}", V2_BC[0], V2_BC[2], "CATATCAATGGG", "T".repeat(10));
        let c = v3.correct(seq.as_bytes());
        assert!(c.valid);
        assert!(c.corrected);
        assert_eq!(c.barcode, "TCGACTGTC_TTCTAGGAT_TGCACGAGA");
        assert_eq!(c.umi.as_deref(), Some("CATATCAATGGG"));

        let no_linkers = "A".repeat(80);
        assert!(!v3.correct(no_linkers.as_bytes()).valid);
        assert!(v3.check_barcodes(no_linkers.as_bytes()).is_none());
    }

    #[test]
    fn test_unknown_protocol() {
        let dir = TempDir::new().unwrap();
        let registry = fixture_registry(&dir);
        let err = registry.get("GEXSCOPE-V9").unwrap_err();
        assert!(matches!(err, SccoreError::UnknownProtocol { .. }));
        assert!(err.to_string().contains("GEXSCOPE-V1"));
    }

    #[test]
    fn test_registry_rejects_bad_entries() {
        let dir = TempDir::new().unwrap();
        write_lines(dir.path(), "bc.txt", &V1_BC);
        let base = dir.path();

        let parse = |json: &str| -> Result<Registry> {
            let config: RegistryConfig = serde_json::from_str(json)?;
            Registry::from_config(&config, base)
        };

        // two whitelists for three barcode segments
        assert!(parse(
            r#"{"protocols": [{"name": "a", "pattern": "C8L16C8L16C8L1U12", "bc": ["bc.txt", "bc.txt"]}]}"#
        )
        .is_err());
        // anchor length does not fit the segment
        assert!(parse(
            r#"{"protocols": [{"name": "a", "pattern": "C8L6U4", "bc": ["bc.txt"],
                "anchor": {"kind": "L", "index": 0, "sequence": "ACG"}}]}"#
        )
        .is_err());
        // duplicate names
        assert!(parse(
            r#"{"protocols": [{"name": "a", "pattern": "C8U4", "bc": ["bc.txt"]},
                              {"name": "a", "pattern": "C8U4", "bc": ["bc.txt"]}]}"#
        )
        .is_err());
        // offset layout without linkers
        assert!(parse(
            r#"{"protocols": [{"name": "a", "pattern": "C8L6U4", "bc": ["bc.txt"], "max_offset": 3}]}"#
        )
        .is_err());
        // linker whitelists on a fixed layout
        let err = parse(
            r#"{"protocols": [{"name": "a", "pattern": "C8L6U4", "bc": ["bc.txt"], "linker": ["bc.txt"]}]}"#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("require max_offset"));
        // no whitelists and no tail rule
        assert!(parse(r#"{"protocols": [{"name": "a", "pattern": "C8U4"}]}"#).is_err());
        // empty tail rule window
        assert!(parse(
            r#"{"protocols": [{"name": "a", "pattern": "C8U4",
                "tail_rule": {"absent": [4, 4], "present": [6, 8], "base": "T"}}]}"#
        )
        .is_err());
        // missing whitelist file
        assert!(parse(r#"{"protocols": [{"name": "a", "pattern": "C8U4", "bc": ["nope.txt"]}]}"#).is_err());

        let ok = parse(r#"{"max_mismatch": 0, "protocols": [{"name": "a", "pattern": "C8U4", "bc": ["bc.txt"]}]}"#)
            .unwrap();
        let p = ok.get("a").unwrap();
        assert!(p.matches(b"GTACGCAAACGT"));
        assert!(!p.matches(b"GTACGCATACGT"));
    }
}
