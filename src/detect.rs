//! Protocol auto-detection from a sample of first reads.
//!
//! Each first-read stream is sampled independently and every sampled read
//! is credited to the first protocol, in detection order, that claims it.
//! The most frequent protocol wins the stream; all streams of a sample must
//! agree.

use std::path::Path;

use anyhow::{Context, Result};
use log::{error, info, warn};
use needletail::FastxReader;

use crate::errors::SccoreError;
use crate::io::open_fastx;
use crate::protocol::{Protocol, Registry};

/// Sampling size and confidence thresholds.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DetectionParams {
    /// Records read from the head of each stream
    pub max_reads: usize,
    /// Below this winning fraction detection fails
    pub min_confidence: f64,
    /// Below this winning fraction detection proceeds with a warning
    pub warn_confidence: f64,
}

impl Default for DetectionParams {
    fn default() -> Self {
        DetectionParams {
            max_reads: 10_000,
            min_confidence: 0.1,
            warn_confidence: 0.5,
        }
    }
}

/// Result for one stream.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamDetection {
    pub stream: String,
    pub protocol: String,
    pub sampled: usize,
    /// Reads credited to the winning protocol
    pub matched: usize,
    pub confidence: f64,
    pub low_confidence: bool,
    /// Reads credited to each protocol, in detection order
    pub tally: Vec<(String, usize)>,
}

/// The protocol selected for a sample and the per-stream evidence.
#[derive(Debug, Clone)]
pub struct Detection<'a> {
    pub protocol: &'a Protocol,
    pub streams: Vec<StreamDetection>,
}

struct Tally {
    sampled: usize,
    counts: Vec<usize>,
}

pub struct Detector<'a> {
    order: Vec<&'a Protocol>,
    params: DetectionParams,
}

impl<'a> Detector<'a> {
    pub fn new(registry: &'a Registry, params: DetectionParams) -> Self {
        Detector {
            order: registry.detection_order().collect(),
            params,
        }
    }

    fn empty_tally(&self) -> Tally {
        Tally {
            sampled: 0,
            counts: vec![0; self.order.len()],
        }
    }

    fn credit(&self, tally: &mut Tally, seq: &[u8]) {
        tally.sampled += 1;
        if let Some(i) = self.order.iter().position(|p| p.matches(seq)) {
            tally.counts[i] += 1;
        }
    }

    /// Detect the protocol of in-memory sequences; at most `max_reads` are
    /// sampled.
    pub fn detect_sequences<I, S>(&self, stream: &str, seqs: I) -> Result<StreamDetection, SccoreError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<[u8]>,
    {
        let mut tally = self.empty_tally();
        for seq in seqs.into_iter().take(self.params.max_reads) {
            self.credit(&mut tally, seq.as_ref());
        }
        self.resolve(stream, tally)
    }

    /// Detect the protocol of a parsed stream.
    pub fn detect_reader(
        &self,
        stream: &str,
        reader: Option<Box<dyn FastxReader>>,
    ) -> Result<StreamDetection> {
        let mut tally = self.empty_tally();
        if let Some(mut reader) = reader {
            while tally.sampled < self.params.max_reads {
                let Some(record) = reader.next() else { break };
                let record = record.with_context(|| format!("Failed to parse FASTX record in {stream}"))?;
                self.credit(&mut tally, &record.seq());
            }
        }
        Ok(self.resolve(stream, tally)?)
    }

    /// Detect each first-read file and require a single protocol across them.
    pub fn detect_paths<P: AsRef<Path>>(&self, paths: &[P]) -> Result<Detection<'a>> {
        let mut streams = Vec::with_capacity(paths.len());
        for path in paths {
            let path = path.as_ref();
            let reader = open_fastx(path)?;
            let label = path.display().to_string();
            streams.push(self.detect_reader(&label, reader)?);
        }
        Ok(self.consensus(streams)?)
    }

    /// Require every stream to have resolved to the same protocol.
    pub fn consensus(&self, streams: Vec<StreamDetection>) -> Result<Detection<'a>, SccoreError> {
        let Some(first) = streams.first() else {
            return Err(SccoreError::ProtocolDetectionFailed {
                stream: "<no input streams>".to_string(),
                sampled: 0,
                fraction: 0.0,
                min_confidence: self.params.min_confidence,
                tally: String::new(),
            });
        };
        if let Some(odd) = streams.iter().find(|s| s.protocol != first.protocol) {
            return Err(SccoreError::InconsistentProtocol {
                stream: odd.stream.clone(),
                found: odd.protocol.clone(),
                reference_stream: first.stream.clone(),
                expected: first.protocol.clone(),
            });
        }
        let protocol = self
            .order
            .iter()
            .copied()
            .find(|p| p.name() == first.protocol)
            .ok_or_else(|| SccoreError::UnknownProtocol {
                name: first.protocol.clone(),
                known: self.order.iter().map(|p| p.name()).collect::<Vec<_>>().join(", "),
            })?;
        Ok(Detection { protocol, streams })
    }

    fn resolve(&self, stream: &str, tally: Tally) -> Result<StreamDetection, SccoreError> {
        let counts: Vec<(String, usize)> = self
            .order
            .iter()
            .zip(&tally.counts)
            .map(|(p, &n)| (p.name().to_string(), n))
            .collect();
        let summary = format_tally(&counts);
        info!("{stream}: sampled {} reads, {summary}", tally.sampled);

        // first maximum, so ties go to the protocol tried first
        let best = counts
            .iter()
            .enumerate()
            .fold(None, |best: Option<(usize, usize)>, (i, &(_, n))| match best {
                Some((_, m)) if m >= n => best,
                _ => Some((i, n)),
            });
        let (winner, matched) = best.unwrap_or((0, 0));
        let confidence = if tally.sampled == 0 {
            0.0
        } else {
            matched as f64 / tally.sampled as f64
        };

        if matched == 0 || confidence < self.params.min_confidence {
            error!("Valid protocol read counts percent < {}", self.params.min_confidence);
            return Err(SccoreError::ProtocolDetectionFailed {
                stream: stream.to_string(),
                sampled: tally.sampled,
                fraction: confidence,
                min_confidence: self.params.min_confidence,
                tally: summary,
            });
        }
        let low_confidence = confidence < self.params.warn_confidence;
        if low_confidence {
            warn!("Valid protocol read counts percent < {}", self.params.warn_confidence);
        }

        let protocol = counts[winner].0.clone();
        info!("{stream}: {protocol} ({:.2}%)", confidence * 100.0);
        Ok(StreamDetection {
            stream: stream.to_string(),
            protocol,
            sampled: tally.sampled,
            matched,
            confidence,
            low_confidence,
            tally: counts,
        })
    }
}

fn format_tally(counts: &[(String, usize)]) -> String {
    counts
        .iter()
        .map(|(name, n)| format!("{name}={n}"))
        .collect::<Vec<_>>()
        .join(", ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::tests::fastq_reader;
    use crate::protocol::tests::{fixture_registry, V1_BC, V2_BC};
    use tempfile::TempDir;

    fn v2_read(i: usize) -> String {
        format!(
            "{}ATCCACGTGCTTGAGA{}TCAGCATGCGGCTACG{}C{}{}",
            V2_BC[i % 3],
            V2_BC[(i + 1) % 3],
            V2_BC[(i + 2) % 3],
            "CATATCAATGGG",
            "T".repeat(10)
        )
    }

    fn v1_read() -> String {
        format!(
            "{}TCGGTGACAGCCATAT{}CGTAGTCAGAAGCTGA{}C{}{}",
            V1_BC[0], V1_BC[1], V1_BC[2], "TCCGAAGCCCAT", "T".repeat(10)
        )
    }

    fn junk_read() -> String {
        "G".repeat(90)
    }

    #[test]
    fn test_dominant_protocol() {
        let dir = TempDir::new().unwrap();
        let registry = fixture_registry(&dir);
        let detector = Detector::new(&registry, DetectionParams::default());

        let seqs: Vec<String> = (0..100).map(|i| if i % 20 == 0 { junk_read() } else { v2_read(i) }).collect();
        let d = detector.detect_sequences("lane1", &seqs).unwrap();
        assert_eq!(d.protocol, "GEXSCOPE-V2");
        assert_eq!(d.sampled, 100);
        assert_eq!(d.matched, 95);
        assert!((d.confidence - 0.95).abs() < 1e-9);
        assert!(!d.low_confidence);
        assert_eq!(d.tally.iter().map(|(_, n)| n).sum::<usize>(), 95);
    }

    #[test]
    fn test_no_match_fails() {
        let dir = TempDir::new().unwrap();
        let registry = fixture_registry(&dir);
        let detector = Detector::new(&registry, DetectionParams::default());

        let seqs = vec![junk_read(); 50];
        let err = detector.detect_sequences("lane1", &seqs).unwrap_err();
        match err {
            SccoreError::ProtocolDetectionFailed { sampled, fraction, tally, .. } => {
                assert_eq!(sampled, 50);
                assert_eq!(fraction, 0.0);
                assert!(tally.contains("GEXSCOPE-V2=0"));
            }
            other => panic!("unexpected error {other:?}"),
        }

        let empty: Vec<String> = vec![];
        assert!(detector.detect_sequences("empty", &empty).is_err());
    }

    #[test]
    fn test_low_confidence_thresholds() {
        let dir = TempDir::new().unwrap();
        let registry = fixture_registry(&dir);
        let detector = Detector::new(&registry, DetectionParams::default());

        // 3 of 10 reads match: warn but proceed
        let seqs: Vec<String> = (0..10).map(|i| if i < 3 { v1_read() } else { junk_read() }).collect();
        let d = detector.detect_sequences("lane1", &seqs).unwrap();
        assert_eq!(d.protocol, "GEXSCOPE-V1");
        assert!(d.low_confidence);

        // 1 of 20 reads match: below the minimum
        let seqs: Vec<String> = (0..20).map(|i| if i == 0 { v1_read() } else { junk_read() }).collect();
        assert!(matches!(
            detector.detect_sequences("lane1", &seqs),
            Err(SccoreError::ProtocolDetectionFailed { .. })
        ));
    }

    #[test]
    fn test_sampling_stops_at_max_reads() {
        let dir = TempDir::new().unwrap();
        let registry = fixture_registry(&dir);
        let params = DetectionParams {
            max_reads: 5,
            ..Default::default()
        };
        let detector = Detector::new(&registry, params);
        // only the V1 head is sampled; the junk tail is never read
        let seqs: Vec<String> = (0..50).map(|i| if i < 5 { v1_read() } else { junk_read() }).collect();
        let d = detector.detect_sequences("lane1", &seqs).unwrap();
        assert_eq!(d.sampled, 5);
        assert_eq!(d.confidence, 1.0);
    }

    #[test]
    fn test_ties_go_to_detection_order() {
        let dir = TempDir::new().unwrap();
        let registry = fixture_registry(&dir);
        let detector = Detector::new(&registry, DetectionParams::default());
        let seqs = vec![v1_read(), v2_read(0)];
        let d = detector.detect_sequences("lane1", &seqs).unwrap();
        assert_eq!(d.protocol, "GEXSCOPE-V2");
    }

    #[test]
    fn test_detect_reader() {
        let dir = TempDir::new().unwrap();
        let registry = fixture_registry(&dir);
        let detector = Detector::new(&registry, DetectionParams::default());
        let text: String = (0..4)
            .map(|i| format!("@r{i}\n{}\n+\n{}\n", v1_read(), "I".repeat(v1_read().len())))
            .collect();
        let d = detector.detect_reader("mem", fastq_reader(&text)).unwrap();
        assert_eq!(d.protocol, "GEXSCOPE-V1");
        assert_eq!(d.sampled, 4);

        assert!(detector.detect_reader("none", None).is_err());
    }

    #[test]
    fn test_consensus_across_lanes() {
        let dir = TempDir::new().unwrap();
        let registry = fixture_registry(&dir);
        let detector = Detector::new(&registry, DetectionParams::default());

        let lane1 = detector.detect_sequences("L001", vec![v1_read(); 3]).unwrap();
        let lane2 = detector.detect_sequences("L002", vec![v1_read(); 3]).unwrap();
        let lane3 = detector.detect_sequences("L003", vec![v2_read(1); 3]).unwrap();

        let d = detector.consensus(vec![lane1.clone(), lane2.clone()]).unwrap();
        assert_eq!(d.protocol.name(), "GEXSCOPE-V1");
        assert_eq!(d.streams.len(), 2);

        match detector.consensus(vec![lane1, lane2, lane3]).unwrap_err() {
            SccoreError::InconsistentProtocol { stream, found, reference_stream, expected } => {
                assert_eq!(stream, "L003");
                assert_eq!(found, "GEXSCOPE-V2");
                assert_eq!(reference_stream, "L001");
                assert_eq!(expected, "GEXSCOPE-V1");
            }
            other => panic!("unexpected error {other:?}"),
        }
    }
}
