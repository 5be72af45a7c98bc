//! CLI argument definitions

use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, ValueEnum};

use crate::session::{FlushMode, SessionConfig, DEFAULT_SLOT_BYTES, DEFAULT_SLOT_COUNT};
use crate::transport::Compression;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum CompressMode {
    /// Raw stream
    None,
    /// External compressor process (see --compressor)
    Gzip,
    /// Built-in gzip on a relay thread
    Relay,
}

#[derive(Parser, Debug)]
#[command(
    name = "sampletrace",
    about = "Record a sampled stack trace of a toy interpreter workload",
    after_help = "\
EXAMPLES:
    sampletrace -o trace.prof                     Record 5s at 100 Hz, gzip-compressed
    sampletrace -o trace.prof --compress none     Raw stream
    sampletrace -o trace.prof --duration 0        Record until Ctrl+C
    sampletrace -o trace.prof --verify            Decode the trace after recording"
)]
pub struct Args {
    /// Trace output file
    #[arg(short, long, value_name = "FILE")]
    pub output: PathBuf,

    /// Sampling interval in seconds (1e-6 <= interval < 1)
    #[arg(short, long, default_value = "0.01")]
    pub interval: f64,

    /// Stop after N seconds (0 = until Ctrl+C)
    #[arg(short, long, default_value = "5")]
    pub duration: u64,

    /// Record allocation samples and per-sample memory
    #[arg(long)]
    pub memory: bool,

    /// Runtime name written into the trace header
    #[arg(long, default_value = "toy")]
    pub label: String,

    /// Output compression
    #[arg(long, value_enum, default_value = "gzip")]
    pub compress: CompressMode,

    /// Program used by --compress gzip (reads stdin, writes stdout)
    #[arg(long, default_value = "gzip", value_name = "PROGRAM")]
    pub compressor: String,

    /// Compression level for --compress relay
    #[arg(long, default_value = "6", value_parser = clap::value_parser!(u32).range(0..=9))]
    pub level: u32,

    /// Number of preallocated sample slots
    #[arg(long, default_value_t = DEFAULT_SLOT_COUNT)]
    pub slots: usize,

    /// Size of each slot in bytes
    #[arg(long, default_value_t = DEFAULT_SLOT_BYTES)]
    pub slot_bytes: usize,

    /// Decode the trace after recording and print a summary
    #[arg(long)]
    pub verify: bool,

    /// Print session statistics as JSON on stdout
    #[arg(long)]
    pub stats_json: bool,

    /// Suppress non-essential output
    #[arg(short, long)]
    pub quiet: bool,
}

impl Args {
    #[must_use]
    pub fn compression(&self) -> Compression {
        match self.compress {
            CompressMode::None => Compression::None,
            CompressMode::Gzip => {
                Compression::Process { program: self.compressor.clone(), args: vec!["-c".into()] }
            }
            CompressMode::Relay => Compression::Relay { level: self.level },
        }
    }

    /// Session configuration for these arguments
    #[must_use]
    pub fn session_config(&self) -> SessionConfig {
        SessionConfig::default()
            .with_interval(self.interval)
            .with_memory_tracking(self.memory)
            .with_label(self.label.clone())
            .with_pool(self.slots, self.slot_bytes)
            .with_compression(self.compression())
            .with_flush(FlushMode::Background { interval: Duration::from_millis(25) })
    }
}
