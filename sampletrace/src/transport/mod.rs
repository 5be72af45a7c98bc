//! # Compression Transport
//!
//! Optional layer between the trace writer and the real destination. A
//! transport takes ownership of the destination descriptor and hands back the
//! descriptor the writer should use instead.
//!
//! ## Descriptor Ownership
//!
//! - `open` consumes the destination. On success the caller owns only the
//!   returned writer descriptor; on failure both are closed.
//! - The read end of any pipe is closed in the parent before `open` returns.
//! - The caller must close the writer descriptor before calling `close`,
//!   otherwise the compressor never sees end of input.
//! - `close` reports a compressor failure (nonzero exit, relay error) as an
//!   error; nothing waits on the compressor before that.
//!
//! ## Implementations
//!
//! - [`Passthrough`] - no compression, writer descriptor is the destination
//! - [`ProcessCompressor`] - external program (default `gzip -c`) fed by a pipe
//! - [`RelayCompressor`] - in-process gzip on a dedicated thread fed by a pipe

#![allow(unsafe_code)] // pipe(2)

pub mod process;
pub mod relay;

use std::io;
use std::os::fd::{FromRawFd, OwnedFd};

pub use process::ProcessCompressor;
pub use relay::RelayCompressor;

use crate::domain::TransportError;

/// Interposes between the trace writer and the destination
pub trait Transport: Send {
    /// Take over `destination`, returning the descriptor the writer writes to
    ///
    /// # Errors
    /// Returns [`TransportError::Unavailable`] if the pipe or compressor
    /// cannot be created
    fn open(&mut self, destination: OwnedFd) -> Result<OwnedFd, TransportError>;

    /// Wait for the compressor to finish and report its outcome
    ///
    /// Calling `close` without a prior successful `open` is a no-op.
    ///
    /// # Errors
    /// Returns an error if the compressor failed
    fn close(&mut self) -> Result<(), TransportError>;

    /// Short name for logs
    fn name(&self) -> &'static str;
}

/// Compression setting for a session
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Compression {
    /// Write the raw stream to the destination
    None,
    /// Pipe through an external program reading stdin and writing stdout
    Process { program: String, args: Vec<String> },
    /// Gzip on a relay thread at the given level (0-9)
    Relay { level: u32 },
}

impl Default for Compression {
    fn default() -> Self {
        Self::gzip()
    }
}

impl Compression {
    /// External `gzip -c`
    #[must_use]
    pub fn gzip() -> Self {
        Self::Process { program: "gzip".to_string(), args: vec!["-c".to_string()] }
    }

    /// Build the transport for this setting
    #[must_use]
    pub fn transport(&self) -> Box<dyn Transport> {
        match self {
            Self::None => Box::new(Passthrough),
            Self::Process { program, args } => {
                Box::new(ProcessCompressor::new(program.clone(), args.clone()))
            }
            Self::Relay { level } => Box::new(RelayCompressor::new(*level)),
        }
    }
}

/// No-op transport
#[derive(Debug, Default)]
pub struct Passthrough;

impl Transport for Passthrough {
    fn open(&mut self, destination: OwnedFd) -> Result<OwnedFd, TransportError> {
        Ok(destination)
    }

    fn close(&mut self) -> Result<(), TransportError> {
        Ok(())
    }

    fn name(&self) -> &'static str {
        "none"
    }
}

/// Create a close-on-exec pipe, returning `(read_end, write_end)`
///
/// # Errors
/// Returns the OS error if the pipe cannot be created
pub fn pipe() -> io::Result<(OwnedFd, OwnedFd)> {
    let mut fds = [0 as libc::c_int; 2];

    #[cfg(target_os = "linux")]
    // SAFETY: fds points to two writable c_ints
    let rc = unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_CLOEXEC) };

    #[cfg(not(target_os = "linux"))]
    // SAFETY: fds points to two writable c_ints
    let rc = unsafe {
        let rc = libc::pipe(fds.as_mut_ptr());
        if rc == 0 {
            libc::fcntl(fds[0], libc::F_SETFD, libc::FD_CLOEXEC);
            libc::fcntl(fds[1], libc::F_SETFD, libc::FD_CLOEXEC);
        }
        rc
    };

    if rc == -1 {
        return Err(io::Error::last_os_error());
    }
    // SAFETY: pipe just returned two fresh descriptors nobody else owns
    Ok(unsafe { (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::File;
    use std::io::{Read, Write};

    #[test]
    fn test_pipe_roundtrip() {
        let (read_end, write_end) = pipe().unwrap();
        let mut writer = File::from(write_end);
        writer.write_all(b"sample").unwrap();
        drop(writer);

        let mut out = String::new();
        File::from(read_end).read_to_string(&mut out).unwrap();
        assert_eq!(out, "sample");
    }

    #[test]
    fn test_passthrough_returns_destination() {
        let (read_end, write_end) = pipe().unwrap();
        let mut transport = Compression::None.transport();
        let fd = transport.open(write_end).unwrap();
        File::from(fd).write_all(b"raw").unwrap();
        transport.close().unwrap();

        let mut out = Vec::new();
        File::from(read_end).read_to_end(&mut out).unwrap();
        assert_eq!(out, b"raw");
        assert_eq!(transport.name(), "none");
    }

    #[test]
    fn test_default_is_gzip_process() {
        assert_eq!(
            Compression::default(),
            Compression::Process { program: "gzip".into(), args: vec!["-c".into()] }
        );
    }
}
