//! In-process gzip relay
//!
//! Same descriptor contract as the process compressor, with a thread instead
//! of a child: the writer writes into a pipe and a dedicated thread gzips
//! whatever comes out of it into the destination. Useful where spawning a
//! process is not an option.

use std::fs::File;
use std::io::{self, Write};
use std::os::fd::OwnedFd;
use std::thread::{self, JoinHandle};

use flate2::write::GzEncoder;
use flate2::Compression;
use log::debug;

use super::{pipe, Transport};
use crate::domain::TransportError;

pub struct RelayCompressor {
    level: u32,
    handle: Option<JoinHandle<io::Result<u64>>>,
}

impl RelayCompressor {
    /// `level` is clamped to gzip's 0-9 range
    #[must_use]
    pub fn new(level: u32) -> Self {
        Self { level: level.min(9), handle: None }
    }
}

impl Transport for RelayCompressor {
    fn open(&mut self, destination: OwnedFd) -> Result<OwnedFd, TransportError> {
        let (read_end, write_end) = pipe().map_err(TransportError::Unavailable)?;
        let level = Compression::new(self.level);

        let handle = thread::Builder::new()
            .name("sampletrace-gzip".to_string())
            .spawn(move || -> io::Result<u64> {
                let mut source = File::from(read_end);
                let mut encoder = GzEncoder::new(File::from(destination), level);
                let copied = io::copy(&mut source, &mut encoder)?;
                encoder.finish()?.flush()?;
                Ok(copied)
            })
            .map_err(TransportError::Unavailable)?;

        self.handle = Some(handle);
        Ok(write_end)
    }

    fn close(&mut self) -> Result<(), TransportError> {
        let Some(handle) = self.handle.take() else {
            return Ok(());
        };
        match handle.join() {
            Ok(Ok(bytes)) => {
                debug!("Relay compressed {bytes} bytes");
                Ok(())
            }
            Ok(Err(e)) => Err(TransportError::RelayFailed(e)),
            Err(_) => Err(TransportError::RelayPanicked),
        }
    }

    fn name(&self) -> &'static str {
        "relay"
    }
}
