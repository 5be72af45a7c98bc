//! Interpreter-maintained frame stack readable from a signal handler
//!
//! An interpreter pushes a code identifier when it enters a function and pops
//! it on return. The sampler reads the same array with atomic loads, so a
//! sample taken mid-update sees either the old or the new depth, never a torn
//! word. One thread owns the pushes and pops; any thread may sample.

#![allow(unsafe_code)] // gettid / pthread_self

use std::sync::atomic::{fence, AtomicUsize, Ordering};

use super::stack_capture::SampleSource;

/// Position stamp of an entry being rewritten
const REWRITING: usize = usize::MAX;

/// One ring entry, stamped with the stack position it holds
struct Entry {
    position: AtomicUsize,
    code_id: AtomicUsize,
}

pub struct ShadowStack {
    entries: Box<[Entry]>,
    depth: AtomicUsize,
    thread_id: AtomicUsize,
    allocated_kb: AtomicUsize,
    tag: AtomicUsize,
}

impl ShadowStack {
    /// Create a stack keeping the innermost `capacity` frames
    ///
    /// The stack is bound to the calling thread; use
    /// [`ShadowStack::bind_current_thread`] from the interpreter thread if it
    /// is created elsewhere.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: (0..capacity)
                .map(|_| Entry {
                    position: AtomicUsize::new(REWRITING),
                    code_id: AtomicUsize::new(0),
                })
                .collect(),
            depth: AtomicUsize::new(0),
            thread_id: AtomicUsize::new(current_thread_id()),
            allocated_kb: AtomicUsize::new(0),
            tag: AtomicUsize::new(0),
        }
    }

    /// Record the calling thread as the one this stack describes
    pub fn bind_current_thread(&self) {
        self.thread_id.store(current_thread_id(), Ordering::Relaxed);
    }

    /// Enter a frame
    ///
    /// Frames live in a ring indexed by stack position, so a deep stack
    /// overwrites its outermost frames. Depth is always counted, which keeps
    /// pushes and pops balanced.
    pub fn push(&self, code_id: usize) {
        let depth = self.depth.load(Ordering::Relaxed);
        if let Some(entry) = self.entry(depth) {
            entry.position.store(REWRITING, Ordering::Relaxed);
            fence(Ordering::Release);
            entry.code_id.store(code_id, Ordering::Relaxed);
            entry.position.store(depth, Ordering::Release);
        }
        self.depth.store(depth + 1, Ordering::Release);
    }

    /// Leave the innermost frame
    pub fn pop(&self) {
        let depth = self.depth.load(Ordering::Relaxed);
        self.depth.store(depth.saturating_sub(1), Ordering::Release);
    }

    /// Push `code_id` and pop it when the guard drops
    pub fn enter(&self, code_id: usize) -> FrameGuard<'_> {
        self.push(code_id);
        FrameGuard { stack: self }
    }

    #[must_use]
    pub fn depth(&self) -> usize {
        self.depth.load(Ordering::Acquire)
    }

    pub fn set_tag(&self, tag: usize) {
        self.tag.store(tag, Ordering::Relaxed);
    }

    /// Account `bytes` of allocation (negative to free)
    pub fn record_allocation(&self, bytes: isize) {
        let kb = bytes.unsigned_abs() / 1024;
        if bytes >= 0 {
            self.allocated_kb.fetch_add(kb, Ordering::Relaxed);
        } else {
            let _ = self.allocated_kb.fetch_update(Ordering::Relaxed, Ordering::Relaxed, |cur| {
                Some(cur.saturating_sub(kb))
            });
        }
    }

    fn entry(&self, position: usize) -> Option<&Entry> {
        match self.entries.len() {
            0 => None,
            len => self.entries.get(position % len),
        }
    }

    /// Code id at `position`, unless a deeper frame has since reused its entry
    fn load(&self, position: usize) -> Option<usize> {
        let entry = self.entry(position)?;
        if entry.position.load(Ordering::Acquire) != position {
            return None;
        }
        let code_id = entry.code_id.load(Ordering::Relaxed);
        fence(Ordering::Acquire);
        (entry.position.load(Ordering::Relaxed) == position).then_some(code_id)
    }
}

impl SampleSource for ShadowStack {
    /// Innermost frames first, stopping at the first overwritten position
    fn walk_frames(&self, out: &mut [usize]) -> usize {
        let depth = self.depth.load(Ordering::Acquire);
        let mut written = 0;
        for (dst, position) in out.iter_mut().zip((0..depth).rev().take(self.entries.len())) {
            let Some(code_id) = self.load(position) else {
                break;
            };
            *dst = code_id;
            written += 1;
        }
        written
    }

    fn thread_id(&self) -> usize {
        self.thread_id.load(Ordering::Relaxed)
    }

    fn tag(&self) -> usize {
        self.tag.load(Ordering::Relaxed)
    }

    fn allocated_kb(&self) -> usize {
        self.allocated_kb.load(Ordering::Relaxed)
    }
}

/// Pops its frame on drop
pub struct FrameGuard<'a> {
    stack: &'a ShadowStack,
}

impl Drop for FrameGuard<'_> {
    fn drop(&mut self) {
        self.stack.pop();
    }
}

#[cfg(target_os = "linux")]
#[allow(clippy::cast_sign_loss, clippy::cast_possible_truncation)]
fn current_thread_id() -> usize {
    // SAFETY: gettid has no preconditions and cannot fail
    unsafe { libc::syscall(libc::SYS_gettid) as usize }
}

#[cfg(not(target_os = "linux"))]
fn current_thread_id() -> usize {
    // SAFETY: pthread_self has no preconditions and cannot fail
    unsafe { libc::pthread_self() as usize }
}
