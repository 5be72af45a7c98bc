//! Consumer side of the pool: inline or on a background thread
//!
//! The background flusher wakes every flush interval, writes whatever slots
//! are ready and goes back to sleep. It owns the writer, and with it the
//! output descriptor, until it is told to stop; then it hands the writer
//! back so the final drain and trailer happen on the stopping thread.

use std::fs::File;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{bounded, RecvTimeoutError, Sender};
use log::{debug, error};

use super::SessionState;
use crate::domain::StreamError;
use crate::profiling::{SamplerShared, TraceWriter};

pub(crate) enum Consumer {
    Manual(TraceWriter<File>),
    Background(Flusher),
}

pub(crate) struct Flusher {
    stop_tx: Sender<()>,
    handle: JoinHandle<Result<TraceWriter<File>, StreamError>>,
}

impl Flusher {
    pub(crate) fn spawn(
        shared: Arc<SamplerShared>,
        mut writer: TraceWriter<File>,
        interval: Duration,
    ) -> std::io::Result<Self> {
        let (stop_tx, stop_rx) = bounded::<()>(1);
        let handle = thread::Builder::new().name("sampletrace-flush".to_string()).spawn(
            move || loop {
                if let Err(e) = writer.drain(&shared.pool) {
                    error!("Trace stream failed, stopping session: {e}");
                    shared.set_state(SessionState::Stopped);
                    return Err(e);
                }
                match stop_rx.recv_timeout(interval) {
                    Err(RecvTimeoutError::Timeout) => {}
                    Ok(()) | Err(RecvTimeoutError::Disconnected) => {
                        debug!("Flusher stopping after {} records", writer.records_written);
                        return Ok(writer);
                    }
                }
            },
        )?;
        Ok(Self { stop_tx, handle })
    }

    /// Whether the thread has exited on its own (stream failure)
    pub(crate) fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Stop the thread and take the writer back
    pub(crate) fn stop(self) -> Result<TraceWriter<File>, StreamError> {
        let _ = self.stop_tx.send(());
        self.handle.join().unwrap_or_else(|_| {
            Err(StreamError::Io(std::io::Error::other("flusher thread panicked")))
        })
    }
}
