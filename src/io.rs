use anyhow::{Context, Result};
use flate2::read::MultiGzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use needletail::{parse_fastx_file, FastxReader};
use std::fmt;
use std::fs::{self, File};
use std::io::{BufWriter, Read, Write};
use std::path::Path;

use crate::errors::SccoreError;

fn is_gz(path: &Path) -> bool {
    path.extension().map_or(false, |e| e == "gz")
}

/// Open a text file for reading, transparently decompressing `.gz` files.
pub fn open_text(path: &Path) -> Result<Box<dyn Read>> {
    let file = File::open(path).with_context(|| format!("Failed to open {}", path.display()))?;
    if is_gz(path) {
        Ok(Box::new(MultiGzDecoder::new(file)))
    } else {
        Ok(Box::new(file))
    }
}

/// Open a FASTA/FASTQ file (plain or compressed).
///
/// Returns `None` for an empty file so callers can treat it as zero records.
pub fn open_fastx(path: &Path) -> Result<Option<Box<dyn FastxReader>>> {
    // Check for 0-byte file BEFORE parsing to avoid parser errors
    if fs::metadata(path)
        .with_context(|| format!("Failed to stat {}", path.display()))?
        .len()
        == 0
    {
        return Ok(None);
    }

    match parse_fastx_file(path) {
        Ok(r) => Ok(Some(r)),
        // A compressed file with no records is reported as EmptyFile
        Err(e) if e.kind == needletail::errors::ParseErrorKind::EmptyFile => Ok(None),
        Err(e) => Err(e).with_context(|| format!("Failed to parse FASTX file {}", path.display())),
    }
}

/// Output sink for FASTQ records.
///
/// The gzip variant is kept concrete so the stream trailer can be written
/// (and its errors reported) by [`GenericWriter::finish`].
pub enum GenericWriter {
    Plain(Box<dyn Write>),
    Gzip(GzEncoder<BufWriter<File>>),
}

impl GenericWriter {
    /// Write a single `@<header>\n<seq>\n+\n<qual>\n` entry; if `qual` is
    /// `None`, an empty quality line is still emitted.
    pub fn write_fastq(&mut self, head: &[u8], seq: &[u8], qual: Option<&[u8]>) -> Result<()> {
        let w: &mut dyn Write = match self {
            Self::Plain(w) => w,
            Self::Gzip(w) => w,
        };
        w.write_all(b"@")?;
        w.write_all(head)?;
        w.write_all(b"\n")?;
        w.write_all(seq)?;
        w.write_all(b"\n+\n")?;
        if let Some(q) = qual {
            w.write_all(q)?;
        }
        w.write_all(b"\n")?;
        Ok(())
    }

    /// Flush buffered data and close the stream.
    pub fn finish(self) -> Result<()> {
        match self {
            Self::Plain(mut w) => w.flush().context("Failed to flush FASTQ output")?,
            Self::Gzip(w) => {
                w.finish()
                    .context("Failed to finish gzip stream")?
                    .flush()
                    .context("Failed to flush FASTQ output")?;
            }
        }
        Ok(())
    }
}

/// Create a writer for FASTQ output. If `path` ends with `.gz`, returns a
/// gzip-wrapped writer.
pub fn create_fastq_writer(path: &Path) -> Result<GenericWriter> {
    let file = File::create(path).with_context(|| format!("Failed to create {}", path.display()))?;
    let writer = BufWriter::new(file);
    if is_gz(path) {
        Ok(GenericWriter::Gzip(GzEncoder::new(writer, Compression::default())))
    } else {
        Ok(GenericWriter::Plain(Box::new(writer)))
    }
}

/// A FASTQ-style in-memory record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FastqRecord {
    /// The header / id field from the FASTQ record (bytes only)
    pub head: Vec<u8>,
    /// Sequence bytes
    pub seq: Vec<u8>,
    /// Optional quality string as bytes
    pub qual: Option<Vec<u8>>,
}

impl FastqRecord {
    pub fn write_to(&self, writer: &mut GenericWriter) -> Result<()> {
        writer.write_fastq(&self.head, &self.seq, self.qual.as_deref())
    }
}

/// First read (barcode + UMI) and second read (biological payload) of one
/// fragment.
#[derive(Debug, Clone)]
pub struct ReadPair {
    pub r1: FastqRecord,
    pub r2: FastqRecord,
}

fn next_owned(reader: &mut Option<Box<dyn FastxReader>>) -> Option<Result<FastqRecord>> {
    let record = reader.as_mut()?.next()?;
    Some(
        record
            .map(|r| FastqRecord {
                head: r.id().to_vec(),
                seq: r.seq().to_vec(),
                qual: r.qual().map(|q| q.to_vec()),
            })
            .context("Failed to parse FASTX record"),
    )
}

/// Forward-only cursor over the records of two mate files.
///
/// Both files must hold the same number of records; when one runs out
/// before the other the iterator yields [`SccoreError::UnpairedReads`]
/// and stops.
pub struct PairedReads {
    r1_label: String,
    r2_label: String,
    r1: Option<Box<dyn FastxReader>>,
    r2: Option<Box<dyn FastxReader>>,
    records: usize,
    done: bool,
}

impl PairedReads {
    pub fn from_readers(
        r1_label: impl Into<String>,
        r1: Option<Box<dyn FastxReader>>,
        r2_label: impl Into<String>,
        r2: Option<Box<dyn FastxReader>>,
    ) -> Self {
        PairedReads {
            r1_label: r1_label.into(),
            r2_label: r2_label.into(),
            r1,
            r2,
            records: 0,
            done: false,
        }
    }

    pub fn from_paths(fq1: &Path, fq2: &Path) -> Result<Self> {
        Ok(Self::from_readers(
            fq1.display().to_string(),
            open_fastx(fq1)?,
            fq2.display().to_string(),
            open_fastx(fq2)?,
        ))
    }
}

impl Iterator for PairedReads {
    type Item = Result<ReadPair>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        let pair = match (next_owned(&mut self.r1), next_owned(&mut self.r2)) {
            (None, None) => None,
            (Some(Ok(r1)), Some(Ok(r2))) => {
                self.records += 1;
                return Some(Ok(ReadPair { r1, r2 }));
            }
            (Some(Err(e)), _) | (_, Some(Err(e))) => Some(Err(e)),
            (None, Some(_)) => Some(Err(SccoreError::UnpairedReads {
                stream: self.r1_label.clone(),
                record: self.records + 1,
            }
            .into())),
            (Some(_), None) => Some(Err(SccoreError::UnpairedReads {
                stream: self.r2_label.clone(),
                record: self.records + 1,
            }
            .into())),
        };
        self.done = true;
        pair
    }
}

/// Read identifier written for every retained pair: `barcode:umi:index`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaggedName {
    pub barcode: String,
    pub umi: String,
    /// 1-based position of the pair in the whole run
    pub index: usize,
}

impl TaggedName {
    /// Parse a header written by the extraction pipeline.
    ///
    /// Only the first whitespace-separated token is considered. Returns
    /// `None` for malformed UTF-8 or headers without the three fields.
    pub fn parse(header: &[u8]) -> Option<TaggedName> {
        let header_str = std::str::from_utf8(header).ok()?;
        let name = header_str.trim_start_matches('@').split_whitespace().next()?;
        let mut fields = name.rsplitn(3, ':');
        let index = fields.next()?.parse().ok()?;
        let umi = fields.next()?;
        let barcode = fields.next()?;
        Some(TaggedName {
            barcode: barcode.to_string(),
            umi: umi.to_string(),
            index,
        })
    }
}

impl fmt::Display for TaggedName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.barcode, self.umi, self.index)
    }
}
