//! External compressor process
//!
//! The child reads the trace from a pipe on stdin and writes compressed
//! output straight to the destination on stdout. The child's copy of the
//! write end is close-on-exec and the parent never keeps the read end, so the
//! child sees end of input as soon as the writer closes its descriptor.

use std::os::fd::OwnedFd;
use std::process::{Child, Command, Stdio};

use log::{debug, info};

use super::Transport;
use crate::domain::TransportError;

pub struct ProcessCompressor {
    program: String,
    args: Vec<String>,
    child: Option<Child>,
}

impl ProcessCompressor {
    #[must_use]
    pub fn new(program: String, args: Vec<String>) -> Self {
        Self { program, args, child: None }
    }
}

impl Transport for ProcessCompressor {
    fn open(&mut self, destination: OwnedFd) -> Result<OwnedFd, TransportError> {
        let mut child = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::from(destination))
            .stderr(Stdio::inherit())
            .spawn()
            .map_err(TransportError::Unavailable)?;

        let Some(stdin) = child.stdin.take() else {
            let _ = child.kill();
            let _ = child.wait();
            return Err(TransportError::Unavailable(std::io::Error::other(
                "compressor stdin not piped",
            )));
        };
        info!("Spawned compressor {} (pid {})", self.program, child.id());
        self.child = Some(child);
        Ok(OwnedFd::from(stdin))
    }

    fn close(&mut self) -> Result<(), TransportError> {
        let Some(mut child) = self.child.take() else {
            return Ok(());
        };
        let status = child.wait().map_err(TransportError::Wait)?;
        debug!("Compressor {} exited with {status}", self.program);
        if status.success() {
            Ok(())
        } else {
            Err(TransportError::ChildFailed(status))
        }
    }

    fn name(&self) -> &'static str {
        "process"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::pipe;
    use std::fs::File;
    use std::io::{ErrorKind, Read, Write};

    #[test]
    fn test_missing_program_is_unavailable() {
        let (_read_end, write_end) = pipe().unwrap();
        let mut transport =
            ProcessCompressor::new("/nonexistent/sampletrace-compressor".into(), Vec::new());
        let err = transport.open(write_end).unwrap_err();
        assert!(matches!(
            err,
            TransportError::Unavailable(ref e) if e.kind() == ErrorKind::NotFound
        ));
        assert!(transport.close().is_ok());
    }

    #[test]
    fn test_cat_passes_bytes_through() {
        let (read_end, write_end) = pipe().unwrap();
        let mut transport = ProcessCompressor::new("cat".into(), Vec::new());
        let fd = match transport.open(write_end) {
            Ok(fd) => fd,
            // cat missing from the test environment
            Err(TransportError::Unavailable(_)) => return,
            Err(e) => panic!("unexpected error: {e}"),
        };
        let mut writer = File::from(fd);
        writer.write_all(b"stream bytes").unwrap();
        drop(writer);
        transport.close().unwrap();

        let mut out = Vec::new();
        File::from(read_end).read_to_end(&mut out).unwrap();
        assert_eq!(out, b"stream bytes");
    }

    #[test]
    fn test_nonzero_exit_is_reported_at_close() {
        let (_read_end, write_end) = pipe().unwrap();
        let mut transport = ProcessCompressor::new("false".into(), Vec::new());
        let Ok(fd) = transport.open(write_end) else {
            return;
        };
        drop(fd);
        assert!(matches!(transport.close(), Err(TransportError::ChildFailed(_))));
    }
}
