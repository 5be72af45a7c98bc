//! # Trace Serialization
//!
//! Turns pool slots into wire records and writes them to the output
//! descriptor. The writer is the only thing that ever writes to that
//! descriptor.
//!
//! Each record is encoded into a reusable buffer and handed to a single
//! `write` call. A short count is fatal: a reader walking fixed-size fields
//! cannot resynchronize after half a record, so nothing is retried except a
//! write interrupted before it transferred any byte.

use std::io::{ErrorKind, Write};

use log::{debug, warn};
use sampletrace_common::{
    header_record_len, FeatureVersion, FORMAT_MAJOR_VERSION, MARKER_HEADER, MARKER_STACKTRACE,
    MARKER_TRAILER, MARKER_VIRTUAL_IP, WORD_SIZE,
};

use super::buffer_pool::{BufferPool, SlotRecord};
use crate::domain::{Interval, RuntimeLabel, StreamError};

/// Serializes records onto an output stream
pub struct TraceWriter<W: Write> {
    out: W,
    version: FeatureVersion,
    buf: Vec<u8>,
    header_written: bool,
    trailer_written: bool,
    /// Set after the first stream error, every later write fails fast
    failed: bool,
    pub records_written: u64,
    pub bytes_written: u64,
}

impl<W: Write> TraceWriter<W> {
    /// Create a writer emitting records at `version`
    ///
    /// `slot_bytes` sizes the encode buffer so steady-state writes never grow it.
    pub fn new(out: W, version: FeatureVersion, slot_bytes: usize) -> Self {
        Self {
            out,
            version,
            buf: Vec::with_capacity(slot_bytes.max(header_record_len(255))),
            header_written: false,
            trailer_written: false,
            failed: false,
            records_written: 0,
            bytes_written: 0,
        }
    }

    /// Emit the header record
    ///
    /// # Errors
    /// Returns a [`StreamError`] if the write fails or is short
    pub fn write_header(
        &mut self,
        interval: Interval,
        label: &RuntimeLabel,
    ) -> Result<(), StreamError> {
        self.buf.clear();
        encode_header(&mut self.buf, self.version, interval.as_micros(), label.as_bytes());
        self.emit()?;
        self.header_written = true;
        debug!("Wrote header: version={:?} interval={interval} label={label}", self.version);
        Ok(())
    }

    /// Serialize one filled slot
    ///
    /// Returns `false` without writing anything if the slot was published
    /// with no known record marker.
    ///
    /// # Errors
    /// Returns a [`StreamError`] if the write fails or is short
    pub fn write_slot(&mut self, record: &SlotRecord) -> Result<bool, StreamError> {
        debug_assert!(self.header_written, "record written before header");
        self.buf.clear();
        match record.header.marker {
            MARKER_STACKTRACE => encode_stacktrace(&mut self.buf, self.version, record),
            MARKER_VIRTUAL_IP => encode_virtual_ip(&mut self.buf, record),
            other => {
                warn!("Skipping slot with unknown marker 0x{other:02x}");
                return Ok(false);
            }
        }
        self.emit()?;
        self.records_written += 1;
        Ok(true)
    }

    /// Write every slot that is ready, in commit order
    ///
    /// Each slot is released back to the pool whether or not its write
    /// succeeded. A slot without a record marker counts as a dropped sample.
    /// Returns the number of records written.
    ///
    /// # Errors
    /// Returns the first [`StreamError`]; remaining slots stay queued
    pub fn drain(&mut self, pool: &BufferPool) -> Result<usize, StreamError> {
        let mut written = 0;
        while let Some(slot) = pool.take_next_full() {
            let result = self.write_slot(slot.record());
            BufferPool::release(slot);
            if result? {
                written += 1;
            } else {
                pool.record_drop();
            }
        }
        Ok(written)
    }

    /// Emit the trailer record, at most once
    ///
    /// # Errors
    /// Returns a [`StreamError`] if the write fails or is short
    pub fn write_trailer(&mut self) -> Result<(), StreamError> {
        if self.trailer_written {
            return Ok(());
        }
        self.buf.clear();
        self.buf.push(MARKER_TRAILER);
        self.emit()?;
        self.trailer_written = true;
        Ok(())
    }

    /// Flush and hand back the underlying stream
    ///
    /// # Errors
    /// Returns a [`StreamError`] if flushing fails
    pub fn finish(mut self) -> Result<W, StreamError> {
        self.out.flush()?;
        Ok(self.out)
    }

    fn emit(&mut self) -> Result<(), StreamError> {
        if self.failed {
            return Err(StreamError::Closed);
        }
        let expected = self.buf.len();
        loop {
            match self.out.write(&self.buf) {
                Ok(n) if n == expected => {
                    self.bytes_written += n as u64;
                    return Ok(());
                }
                Ok(0) => {
                    self.failed = true;
                    return Err(StreamError::Closed);
                }
                Ok(written) => {
                    self.failed = true;
                    return Err(StreamError::ShortWrite { written, expected });
                }
                Err(e) if e.kind() == ErrorKind::Interrupted => {}
                Err(e) => {
                    self.failed = true;
                    return Err(StreamError::Io(e));
                }
            }
        }
    }
}

fn push_word(buf: &mut Vec<u8>, value: usize) {
    buf.extend_from_slice(&value.to_le_bytes());
}

/// Append a header record to `buf`
pub fn encode_header(
    buf: &mut Vec<u8>,
    version: FeatureVersion,
    interval_usec: usize,
    label: &[u8],
) {
    let label = &label[..label.len().min(255)];
    for word in [0, FORMAT_MAJOR_VERSION, 0, interval_usec, 0] {
        push_word(buf, word);
    }
    buf.push(MARKER_HEADER);
    buf.push(version.as_byte());
    #[allow(clippy::cast_possible_truncation)]
    buf.push(label.len() as u8);
    buf.extend_from_slice(label);
}

/// Append a stacktrace record to `buf`
///
/// The declared depth is always the number of frames actually appended.
pub fn encode_stacktrace(buf: &mut Vec<u8>, version: FeatureVersion, record: &SlotRecord) {
    let header = &record.header;
    debug_assert!(header.depth <= record.capacity(), "depth beyond slot capacity");
    let frames = record.frames();
    buf.push(MARKER_STACKTRACE);
    push_word(buf, header.count);
    push_word(buf, frames.len());
    if version.has_thread_id() {
        push_word(buf, header.thread_id);
    }
    for &frame in frames {
        push_word(buf, frame);
    }
    if version.has_tag() {
        push_word(buf, header.tag);
    }
    if version.has_memory() {
        push_word(buf, header.memory_kb);
    }
}

/// Append a virtual-ip record to `buf`
pub fn encode_virtual_ip(buf: &mut Vec<u8>, record: &SlotRecord) {
    buf.push(MARKER_VIRTUAL_IP);
    push_word(buf, record.header.virtual_ip);
    let len_at = buf.len();
    push_word(buf, 0);
    buf.extend(record.payload_bytes());
    let len = buf.len() - len_at - WORD_SIZE;
    buf[len_at..len_at + WORD_SIZE].copy_from_slice(&len.to_le_bytes());
}
