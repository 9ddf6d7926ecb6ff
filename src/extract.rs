//! Extract barcode and UMI from first reads and write them into the names of
//! the paired second reads.

use anyhow::{Context, Result};
use indicatif::{ProgressBar, ProgressStyle};
use log::info;
use std::path::{Path, PathBuf};

use crate::correct::Correction;
use crate::errors::SccoreError;
use crate::io::{create_fastq_writer, GenericWriter, PairedReads, ReadPair, TaggedName};
use crate::protocol::Protocol;

/// Read-pair counts of one run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExtractStats {
    pub raw_reads: usize,
    pub valid_reads: usize,
    /// Valid reads that needed at least one barcode correction
    pub corrected_reads: usize,
}

impl ExtractStats {
    pub fn valid_fraction(&self) -> f64 {
        fraction(self.valid_reads, self.raw_reads)
    }

    pub fn corrected_fraction(&self) -> f64 {
        fraction(self.corrected_reads, self.raw_reads)
    }
}

fn fraction(n: usize, total: usize) -> f64 {
    if total == 0 {
        0.0
    } else {
        n as f64 / total as f64
    }
}

/// Destinations of an extraction run.
pub struct Outputs {
    /// Retagged second reads
    pub tagged: GenericWriter,
    /// First reads of dropped pairs, when requested
    pub invalid: Option<GenericWriter>,
}

impl Outputs {
    pub fn create(tagged: &Path, invalid: Option<&Path>) -> Result<Self> {
        Ok(Outputs {
            tagged: create_fastq_writer(tagged)?,
            invalid: invalid.map(create_fastq_writer).transpose()?,
        })
    }

    pub fn finish(self) -> Result<()> {
        self.tagged.finish()?;
        if let Some(w) = self.invalid {
            w.finish()?;
        }
        Ok(())
    }
}

pub struct Extractor<'a> {
    protocol: &'a Protocol,
}

impl<'a> Extractor<'a> {
    pub fn new(protocol: &'a Protocol) -> Self {
        Extractor { protocol }
    }

    /// Barcode and UMI of a first read.
    pub fn correct(&self, seq: &[u8]) -> Correction {
        self.protocol.correct(seq)
    }

    /// Stream `pairs` into `outputs`, continuing the counts in `stats`.
    ///
    /// The running raw count is the last field of every written name, so
    /// names stay unique across lanes sharing `stats`.
    pub fn process_pairs<I>(
        &self,
        pairs: I,
        stats: &mut ExtractStats,
        outputs: &mut Outputs,
        progress: &ProgressBar,
    ) -> Result<()>
    where
        I: IntoIterator<Item = Result<ReadPair>>,
    {
        for pair in pairs {
            let pair = pair?;
            stats.raw_reads += 1;
            progress.inc(1);

            match self.correct(&pair.r1.seq) {
                Correction {
                    valid: true,
                    corrected,
                    barcode,
                    umi: Some(umi),
                } => {
                    stats.valid_reads += 1;
                    if corrected {
                        stats.corrected_reads += 1;
                    }
                    let name = TaggedName {
                        barcode,
                        umi,
                        index: stats.raw_reads,
                    };
                    outputs.tagged.write_fastq(
                        name.to_string().as_bytes(),
                        &pair.r2.seq,
                        pair.r2.qual.as_deref(),
                    )?;
                }
                _ => {
                    if let Some(w) = outputs.invalid.as_mut() {
                        pair.r1.write_to(w)?;
                    }
                }
            }
        }
        Ok(())
    }
}

fn spinner() -> Result<ProgressBar> {
    let pb = ProgressBar::new_spinner();
    pb.set_style(ProgressStyle::with_template("{spinner} {pos} read pairs [{elapsed_precise}] {per_sec}")?);
    Ok(pb)
}

/// Default output name for a sample's retagged second reads.
pub fn output_path(outdir: &Path, sample: &str) -> PathBuf {
    outdir.join(format!("{sample}_R2.fq.gz"))
}

/// Process lanes of paired FASTQ files with `protocol`, writing retagged
/// second reads to `out` and, optionally, dropped first reads to
/// `invalid_out`. Returns `(raw, valid, corrected)` counts.
///
/// `fq1` and `fq2` are paired positionally and must have equal length.
pub fn extract<P: AsRef<Path>>(
    fq1: &[P],
    fq2: &[P],
    protocol: &Protocol,
    out: &Path,
    invalid_out: Option<&Path>,
) -> Result<ExtractStats> {
    if fq1.len() != fq2.len() {
        return Err(SccoreError::UnequalInputLists {
            fq1: fq1.len(),
            fq2: fq2.len(),
        }
        .into());
    }

    let extractor = Extractor::new(protocol);
    let mut outputs = Outputs::create(out, invalid_out)?;
    let progress = spinner()?;
    let mut stats = ExtractStats::default();

    for (r1, r2) in fq1.iter().zip(fq2) {
        let (r1, r2) = (r1.as_ref(), r2.as_ref());
        info!("Extracting {} with {} onto {}", r1.display(), protocol.name(), r2.display());
        let pairs = PairedReads::from_paths(r1, r2)?;
        extractor
            .process_pairs(pairs, &mut stats, &mut outputs, &progress)
            .with_context(|| format!("Failed to extract {} / {}", r1.display(), r2.display()))?;
    }

    outputs.finish()?;
    progress.finish_and_clear();
    info!(
        "{} read pairs, {} valid ({:.2}%), {} corrected ({:.2}%)",
        stats.raw_reads,
        stats.valid_reads,
        stats.valid_fraction() * 100.0,
        stats.corrected_reads,
        stats.corrected_fraction() * 100.0
    );
    Ok(stats)
}
