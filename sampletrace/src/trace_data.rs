//! Trace data model for verification
//!
//! Decodes a finished trace (raw or gzip-compressed) back into a header and a
//! list of records. Used by the binary's `--verify` and by tests; it checks
//! structure only and does no aggregation.

use std::collections::BTreeSet;
use std::io::Read;
use std::path::Path;

use anyhow::{bail, ensure, Context, Result};
use flate2::read::GzDecoder;
use sampletrace_common::{
    FeatureVersion, ALLOCATION_THREAD_BIT, FORMAT_MAJOR_VERSION, HEADER_WORDS, MARKER_HEADER,
    MARKER_STACKTRACE, MARKER_TRAILER, MARKER_VIRTUAL_IP, WORD_SIZE,
};

use crate::domain::ThreadId;

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

/// Decoded header record
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TraceHeader {
    pub major_version: usize,
    pub interval_usec: usize,
    pub version: FeatureVersion,
    pub label: Vec<u8>,
}

/// One decoded record after the header
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TraceRecord {
    Stacktrace {
        count: usize,
        thread_id: Option<usize>,
        frames: Vec<usize>,
        tag: Option<usize>,
        memory_kb: Option<usize>,
    },
    VirtualIp {
        id: usize,
        payload: Vec<u8>,
    },
}

impl TraceRecord {
    /// Whether this is a sample taken on an allocation event
    #[must_use]
    pub fn is_allocation_sample(&self) -> bool {
        matches!(
            self,
            Self::Stacktrace { thread_id: Some(tid), .. } if tid & ALLOCATION_THREAD_BIT != 0
        )
    }

    /// Sampled thread, with the allocation bit masked off
    #[must_use]
    pub fn thread(&self) -> Option<ThreadId> {
        match self {
            Self::Stacktrace { thread_id: Some(tid), .. } => {
                Some(ThreadId(tid & !ALLOCATION_THREAD_BIT))
            }
            _ => None,
        }
    }
}

/// Whole trace loaded from a file or buffer
#[derive(Debug, Clone)]
pub struct TraceData {
    pub header: TraceHeader,
    pub records: Vec<TraceRecord>,
    /// Stream ended without a trailer (or mid-record)
    pub truncated: bool,
}

impl TraceData {
    /// Load a trace file, decompressing it if it is gzip
    ///
    /// # Errors
    /// Returns an error if the file cannot be read or is malformed
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let bytes =
            std::fs::read(path).with_context(|| format!("Failed to read {}", path.display()))?;
        Self::from_bytes(&bytes).with_context(|| format!("Malformed trace {}", path.display()))
    }

    /// Decode a trace, decompressing it first if it starts with the gzip magic
    ///
    /// # Errors
    /// Returns an error if decompression fails or the stream is malformed
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.starts_with(&GZIP_MAGIC) {
            let mut raw = Vec::new();
            GzDecoder::new(bytes).read_to_end(&mut raw).context("Failed to decompress trace")?;
            Self::parse(&raw)
        } else {
            Self::parse(bytes)
        }
    }

    /// Decode an uncompressed trace
    ///
    /// # Errors
    /// Returns an error for a bad header, an unknown marker or bytes after
    /// the trailer. A stream that simply stops is not an error; it is flagged
    /// as truncated.
    pub fn parse(raw: &[u8]) -> Result<Self> {
        let mut cursor = Cursor { data: raw, pos: 0 };
        let header = parse_header(&mut cursor)?;
        let version = header.version;

        let mut records = Vec::new();
        let mut truncated = true;
        while let Some(marker) = cursor.byte() {
            match marker {
                MARKER_STACKTRACE => match parse_stacktrace(&mut cursor, version) {
                    Some(record) => records.push(record),
                    None => break,
                },
                MARKER_VIRTUAL_IP => match parse_virtual_ip(&mut cursor) {
                    Some(record) => records.push(record),
                    None => break,
                },
                MARKER_TRAILER => {
                    ensure!(
                        cursor.remaining() == 0,
                        "{} bytes after trailer",
                        cursor.remaining()
                    );
                    truncated = false;
                    break;
                }
                other => bail!("unknown record marker 0x{other:02x} at offset {}", cursor.pos - 1),
            }
        }

        Ok(Self { header, records, truncated })
    }

    /// Stack samples only, skipping virtual-ip records
    pub fn samples(&self) -> impl Iterator<Item = &TraceRecord> {
        self.records.iter().filter(|r| matches!(r, TraceRecord::Stacktrace { .. }))
    }

    #[must_use]
    pub fn sample_count(&self) -> usize {
        self.samples().count()
    }

    /// Distinct threads seen in the samples
    #[must_use]
    pub fn threads(&self) -> BTreeSet<ThreadId> {
        self.records.iter().filter_map(TraceRecord::thread).collect()
    }
}

struct Cursor<'a> {
    data: &'a [u8],
    pos: usize,
}

impl Cursor<'_> {
    fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    fn byte(&mut self) -> Option<u8> {
        let b = *self.data.get(self.pos)?;
        self.pos += 1;
        Some(b)
    }

    fn bytes(&mut self, len: usize) -> Option<&[u8]> {
        let end = self.pos.checked_add(len)?;
        let slice = self.data.get(self.pos..end)?;
        self.pos = end;
        Some(slice)
    }

    fn word(&mut self) -> Option<usize> {
        let mut raw = [0u8; WORD_SIZE];
        raw.copy_from_slice(self.bytes(WORD_SIZE)?);
        Some(usize::from_le_bytes(raw))
    }
}

fn parse_header(cursor: &mut Cursor<'_>) -> Result<TraceHeader> {
    let mut words = [0usize; HEADER_WORDS];
    for word in &mut words {
        *word = cursor.word().context("stream shorter than the header")?;
    }
    ensure!(words[0] == 0, "not a trace: first header word is {}", words[0]);
    ensure!(
        words[1] == FORMAT_MAJOR_VERSION,
        "unsupported format version {} (expected {FORMAT_MAJOR_VERSION})",
        words[1]
    );

    let marker = cursor.byte().context("missing header marker")?;
    ensure!(marker == MARKER_HEADER, "expected header marker, found 0x{marker:02x}");
    let feature = cursor.byte().context("missing feature byte")?;
    let version = FeatureVersion::from_byte(feature)
        .with_context(|| format!("unknown feature byte 0x{feature:02x}"))?;
    let label_len = cursor.byte().context("missing label length")?;
    let label = cursor.bytes(usize::from(label_len)).context("label cut short")?.to_vec();

    Ok(TraceHeader { major_version: words[1], interval_usec: words[3], version, label })
}

fn parse_stacktrace(cursor: &mut Cursor<'_>, version: FeatureVersion) -> Option<TraceRecord> {
    let count = cursor.word()?;
    let depth = cursor.word()?;
    let thread_id = if version.has_thread_id() { Some(cursor.word()?) } else { None };
    // A corrupt depth must not drive a huge allocation
    if depth > cursor.remaining() / WORD_SIZE {
        return None;
    }
    let mut frames = Vec::with_capacity(depth);
    for _ in 0..depth {
        frames.push(cursor.word()?);
    }
    let tag = if version.has_tag() { Some(cursor.word()?) } else { None };
    let memory_kb = if version.has_memory() { Some(cursor.word()?) } else { None };
    Some(TraceRecord::Stacktrace { count, thread_id, frames, tag, memory_kb })
}

fn parse_virtual_ip(cursor: &mut Cursor<'_>) -> Option<TraceRecord> {
    let id = cursor.word()?;
    let len = cursor.word()?;
    let payload = cursor.bytes(len)?.to_vec();
    Some(TraceRecord::VirtualIp { id, payload })
}
