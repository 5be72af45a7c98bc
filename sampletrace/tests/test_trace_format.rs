use std::cell::Cell;
use std::fs::File;
use std::os::fd::OwnedFd;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;

use sampletrace::profiling::{CaptureOutcome, SampleSource, Sampler, ShadowStack};
use sampletrace::session::{Capabilities, FlushMode, Session, SessionConfig};
use sampletrace::trace_data::{TraceData, TraceRecord};
use sampletrace::transport::Compression;
use sampletrace_common::{
    header_record_len, stacktrace_record_len, FeatureVersion, FORMAT_MAJOR_VERSION,
    MARKER_HEADER, MARKER_TRAILER, VERSION_MEMORY, VERSION_THREAD_ID, WORD_SIZE,
};

fn raw_config() -> SessionConfig {
    SessionConfig::default()
        .with_compression(Compression::None)
        .with_flush(FlushMode::Manual)
}

fn started(config: &SessionConfig, capabilities: Capabilities, path: &Path) -> Session {
    let file = File::create(path).unwrap();
    let mut session = Session::new(capabilities);
    session.configure(config, OwnedFd::from(file)).unwrap();
    session.start().unwrap();
    session
}

fn trace_path(dir: &tempfile::TempDir) -> PathBuf {
    dir.path().join("trace.prof")
}

fn word(bytes: &[u8], index: usize) -> usize {
    let mut raw = [0u8; WORD_SIZE];
    raw.copy_from_slice(&bytes[index * WORD_SIZE..(index + 1) * WORD_SIZE]);
    usize::from_le_bytes(raw)
}

#[test]
fn test_empty_session_is_header_and_trailer() {
    let dir = tempfile::tempdir().unwrap();
    let path = trace_path(&dir);
    let config = raw_config().with_interval(0.01).with_label("worker");
    let mut session = started(&config, Capabilities::host(), &path);
    session.stop().unwrap();

    let bytes = std::fs::read(&path).unwrap();
    assert_eq!(bytes.len(), header_record_len(6) + 1);
    assert_eq!(word(&bytes, 0), 0);
    assert_eq!(word(&bytes, 1), FORMAT_MAJOR_VERSION);
    assert_eq!(word(&bytes, 2), 0);
    assert_eq!(word(&bytes, 3), 10_000);
    assert_eq!(word(&bytes, 4), 0);

    let tail = &bytes[5 * WORD_SIZE..];
    assert_eq!(tail[0], MARKER_HEADER);
    assert_eq!(tail[1], VERSION_THREAD_ID);
    assert_eq!(tail[2], 6);
    assert_eq!(&tail[3..9], b"worker");
    assert_eq!(bytes.last(), Some(&MARKER_TRAILER));
}

#[test]
fn test_exhausted_pool_drops_third_sample() {
    let dir = tempfile::tempdir().unwrap();
    let path = trace_path(&dir);
    let config = raw_config().with_pool(2, 512);
    let mut session = started(&config, Capabilities::host(), &path);
    let sampler = session.sampler().unwrap();

    let stack = ShadowStack::new(16);
    let _main = stack.enter(0x100);
    let _leaf = stack.enter(0x200);
    assert_eq!(sampler.capture(&stack), CaptureOutcome::Captured);
    assert_eq!(sampler.capture(&stack), CaptureOutcome::Captured);
    assert_eq!(sampler.capture(&stack), CaptureOutcome::Dropped);
    session.stop().unwrap();

    assert_eq!(session.stats().dropped, 1);
    let trace = TraceData::from_file(&path).unwrap();
    assert!(!trace.truncated);
    assert_eq!(trace.sample_count(), 2);
    for record in &trace.records {
        let TraceRecord::Stacktrace { frames, count, .. } = record else {
            panic!("unexpected record {record:?}");
        };
        assert_eq!(*count, 1);
        assert_eq!(frames, &[0x200, 0x100]);
    }
}

#[test]
fn test_records_plus_drops_equal_invocations() {
    let dir = tempfile::tempdir().unwrap();
    let path = trace_path(&dir);
    let config = raw_config().with_pool(4, 1024);
    let mut session = started(&config, Capabilities::host(), &path);
    let sampler = session.sampler().unwrap();

    let stack = ShadowStack::new(64);
    let invocations = 200u64;
    for i in 0..invocations {
        stack.push(usize::try_from(i).unwrap());
        sampler.capture(&stack);
        if i % 7 == 0 {
            session.drain().unwrap();
        }
        if i % 3 == 0 {
            stack.pop();
        }
    }
    session.stop().unwrap();

    let stats = session.stats();
    let trace = TraceData::from_file(&path).unwrap();
    assert!(stats.dropped > 0);
    assert_eq!(trace.sample_count() as u64 + stats.dropped, invocations);
    assert_eq!(stats.committed, trace.sample_count() as u64);
}

#[test]
fn test_concurrent_producers_account_for_every_capture() {
    let dir = tempfile::tempdir().unwrap();
    let path = trace_path(&dir);
    let config = raw_config()
        .with_pool(8, 512)
        .with_flush(FlushMode::Background { interval: Duration::from_millis(1) });
    let mut session = started(&config, Capabilities::host(), &path);
    let sampler = session.sampler().unwrap();

    let threads = 4;
    let per_thread = 5000u64;
    let producers: Vec<_> = (0..threads)
        .map(|t| {
            let sampler = sampler.clone();
            thread::spawn(move || {
                let stack = ShadowStack::new(4);
                let _frame = stack.enter(0x100 + t);
                for _ in 0..per_thread {
                    sampler.capture(&stack);
                }
            })
        })
        .collect();
    for producer in producers {
        producer.join().unwrap();
    }
    session.stop().unwrap();

    let stats = session.stats();
    let trace = TraceData::from_file(&path).unwrap();
    assert!(!trace.truncated);
    assert_eq!(trace.sample_count() as u64 + stats.dropped, per_thread * threads as u64);
    assert_eq!(stats.committed, trace.sample_count() as u64);
    for record in &trace.records {
        let TraceRecord::Stacktrace { frames, .. } = record else {
            panic!("unexpected record {record:?}");
        };
        assert_eq!(frames.len(), 1);
        assert!((0x100..0x100 + threads).contains(&frames[0]));
    }
}

#[test]
fn test_header_interval_below_one_second() {
    let dir = tempfile::tempdir().unwrap();
    let path = trace_path(&dir);
    let config = raw_config().with_interval(0.999_999_5);
    let mut session = started(&config, Capabilities::host(), &path);
    session.stop().unwrap();

    let trace = TraceData::from_file(&path).unwrap();
    assert_eq!(trace.header.interval_usec, 999_999);
}

#[test]
fn test_depth_capped_by_slot_size() {
    let dir = tempfile::tempdir().unwrap();
    let path = trace_path(&dir);
    let config = raw_config().with_max_depth(4);
    let mut session = started(&config, Capabilities::host(), &path);
    let sampler = session.sampler().unwrap();

    let stack = ShadowStack::new(32);
    for id in 1..=10 {
        stack.push(id);
    }
    sampler.capture(&stack);
    session.stop().unwrap();

    let bytes = std::fs::read(&path).unwrap();
    assert_eq!(
        bytes.len(),
        header_record_len(0) + stacktrace_record_len(FeatureVersion::ThreadId, 4) + 1
    );
    let trace = TraceData::parse(&bytes).unwrap();
    let TraceRecord::Stacktrace { frames, .. } = &trace.records[0] else {
        panic!("expected a stack sample");
    };
    assert_eq!(frames, &[10, 9, 8, 7]);
}

/// Source whose walk is interrupted by a second capture, like a nested signal
struct Interrupting<'a> {
    sampler: &'a Sampler,
    nested: Cell<Option<CaptureOutcome>>,
}

struct Leaf;

impl SampleSource for Leaf {
    fn walk_frames(&self, frames: &mut [usize]) -> usize {
        frames[0] = 0xb;
        1
    }

    fn thread_id(&self) -> usize {
        2
    }
}

impl SampleSource for Interrupting<'_> {
    fn walk_frames(&self, frames: &mut [usize]) -> usize {
        frames[0] = 0xa;
        self.nested.set(Some(self.sampler.capture(&Leaf)));
        1
    }

    fn thread_id(&self) -> usize {
        1
    }
}

#[test]
fn test_interrupting_capture_is_written_first() {
    let dir = tempfile::tempdir().unwrap();
    let path = trace_path(&dir);
    let mut session = started(&raw_config(), Capabilities::host(), &path);
    let sampler = session.sampler().unwrap();

    let outer = Interrupting { sampler: &sampler, nested: Cell::new(None) };
    assert_eq!(sampler.capture(&outer), CaptureOutcome::Captured);
    assert_eq!(outer.nested.get(), Some(CaptureOutcome::Captured));
    session.stop().unwrap();

    let trace = TraceData::from_file(&path).unwrap();
    let thread_ids: Vec<_> = trace
        .records
        .iter()
        .map(|r| match r {
            TraceRecord::Stacktrace { thread_id, .. } => *thread_id,
            TraceRecord::VirtualIp { .. } => None,
        })
        .collect();
    assert_eq!(thread_ids, vec![Some(2), Some(1)]);
}

#[test]
fn test_virtual_ip_ordered_with_samples() {
    let dir = tempfile::tempdir().unwrap();
    let path = trace_path(&dir);
    let mut session = started(&raw_config(), Capabilities::host(), &path);
    let sampler = session.sampler().unwrap();

    let stack = ShadowStack::new(4);
    let _frame = stack.enter(0x42);
    sampler.capture(&stack);
    sampler.emit_virtual_ip(0x42, b"toy:answer:1:demo");
    sampler.capture(&stack);
    session.stop().unwrap();

    let trace = TraceData::from_file(&path).unwrap();
    assert_eq!(trace.records.len(), 3);
    assert!(matches!(trace.records[0], TraceRecord::Stacktrace { .. }));
    assert_eq!(
        trace.records[1],
        TraceRecord::VirtualIp { id: 0x42, payload: b"toy:answer:1:demo".to_vec() }
    );
    assert!(matches!(trace.records[2], TraceRecord::Stacktrace { .. }));
}

#[test]
fn test_memory_tracking_layout() {
    let dir = tempfile::tempdir().unwrap();
    let path = trace_path(&dir);
    let config = raw_config().with_memory_tracking(true);
    let capabilities = Capabilities { allocation_events: true };
    let mut session = started(&config, capabilities, &path);
    let sampler = session.sampler().unwrap();

    let stack = ShadowStack::new(4);
    let _frame = stack.enter(0x1);
    stack.record_allocation(8 * 1024);
    sampler.capture(&stack);
    sampler.capture_allocation(&stack);
    session.stop().unwrap();

    let bytes = std::fs::read(&path).unwrap();
    assert_eq!(bytes[5 * WORD_SIZE + 1], VERSION_MEMORY);

    let trace = TraceData::parse(&bytes).unwrap();
    assert_eq!(trace.header.version, FeatureVersion::Memory);
    assert_eq!(trace.records.len(), 2);
    for record in &trace.records {
        let TraceRecord::Stacktrace { memory_kb, tag, .. } = record else {
            panic!("expected a stack sample");
        };
        assert_eq!(*memory_kb, Some(8));
        assert_eq!(*tag, Some(0));
    }
    assert!(!trace.records[0].is_allocation_sample());
    assert!(trace.records[1].is_allocation_sample());
}

#[test]
fn test_long_label_truncated_in_header() {
    let dir = tempfile::tempdir().unwrap();
    let path = trace_path(&dir);
    let config = raw_config().with_label("x".repeat(300));
    let mut session = started(&config, Capabilities::host(), &path);
    session.stop().unwrap();

    let trace = TraceData::from_file(&path).unwrap();
    assert_eq!(trace.header.label.len(), 255);
    assert!(trace.records.is_empty());
}
