//! Per-context accounting for outstanding non-blocking operations.
//!
//! Every queued operation belongs to an `OpsContext`: the default context,
//! a per-region context (`context_model = region`), or the context of an
//! explicitly opened `fam_context`. The context carries the per-class
//! submitted/completed/error counters, the quiet targets, the completion
//! queues for failed operations, and the condvars `quiet` blocks on, so one
//! consumer pool can service many isolated contexts.

use crate::error::{FamError, FamResult};
use crossbeam::queue::SegQueue;
use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicU64, Ordering};

pub(crate) struct OpsContext {
    context_id: u64,
    write_submitted: AtomicU64,
    read_submitted: AtomicU64,
    write_completed: AtomicU64,
    read_completed: AtomicU64,
    write_err_count: AtomicU64,
    read_err_count: AtomicU64,
    quiet_write_target: AtomicU64,
    quiet_read_target: AtomicU64,
    write_cq: SegQueue<FamError>,
    read_cq: SegQueue<FamError>,
    write_lock: Mutex<()>,
    write_cv: Condvar,
    read_lock: Mutex<()>,
    read_cv: Condvar,
}

impl OpsContext {
    pub(crate) fn new(context_id: u64) -> Self {
        Self {
            context_id,
            write_submitted: AtomicU64::new(0),
            read_submitted: AtomicU64::new(0),
            write_completed: AtomicU64::new(0),
            read_completed: AtomicU64::new(0),
            write_err_count: AtomicU64::new(0),
            read_err_count: AtomicU64::new(0),
            quiet_write_target: AtomicU64::new(u64::MAX),
            quiet_read_target: AtomicU64::new(u64::MAX),
            write_cq: SegQueue::new(),
            read_cq: SegQueue::new(),
            write_lock: Mutex::new(()),
            write_cv: Condvar::new(),
            read_lock: Mutex::new(()),
            read_cv: Condvar::new(),
        }
    }

    pub(crate) fn context_id(&self) -> u64 {
        self.context_id
    }

    pub(crate) fn inc_write_submitted(&self) {
        self.write_submitted.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn inc_read_submitted(&self) {
        self.read_submitted.fetch_add(1, Ordering::SeqCst);
    }

    /// Consumer-side completion. The counter update happens under the class
    /// mutex so a thread parked in `quiet` cannot miss its wakeup.
    pub(crate) fn complete_write(&self, error: Option<FamError>) {
        if let Some(err) = error {
            self.write_cq.push(err);
            self.write_err_count.fetch_add(1, Ordering::SeqCst);
        }
        let _guard = self.write_lock.lock();
        let completed = self.write_completed.fetch_add(1, Ordering::SeqCst) + 1;
        if completed >= self.quiet_write_target.load(Ordering::SeqCst) {
            self.write_cv.notify_all();
        }
    }

    pub(crate) fn complete_read(&self, error: Option<FamError>) {
        if let Some(err) = error {
            self.read_cq.push(err);
            self.read_err_count.fetch_add(1, Ordering::SeqCst);
        }
        let _guard = self.read_lock.lock();
        let completed = self.read_completed.fetch_add(1, Ordering::SeqCst) + 1;
        if completed >= self.quiet_read_target.load(Ordering::SeqCst) {
            self.read_cv.notify_all();
        }
    }

    /// Wait until `target` writes have completed, then surface the first
    /// parked write error and clear the queue.
    pub(crate) fn write_quiet(&self, target: u64) -> FamResult<()> {
        {
            let mut guard = self.write_lock.lock();
            self.quiet_write_target.store(target, Ordering::SeqCst);
            while self.write_completed.load(Ordering::SeqCst) < target {
                self.write_cv.wait(&mut guard);
            }
            self.quiet_write_target.store(u64::MAX, Ordering::SeqCst);
        }
        if self.write_err_count.swap(0, Ordering::SeqCst) != 0 {
            return drain_first(&self.write_cq);
        }
        Ok(())
    }

    pub(crate) fn read_quiet(&self, target: u64) -> FamResult<()> {
        {
            let mut guard = self.read_lock.lock();
            self.quiet_read_target.store(target, Ordering::SeqCst);
            while self.read_completed.load(Ordering::SeqCst) < target {
                self.read_cv.wait(&mut guard);
            }
            self.quiet_read_target.store(u64::MAX, Ordering::SeqCst);
        }
        if self.read_err_count.swap(0, Ordering::SeqCst) != 0 {
            return drain_first(&self.read_cq);
        }
        Ok(())
    }

    /// Snapshot the submitted counters and wait for both classes to drain.
    pub(crate) fn quiet(&self) -> FamResult<()> {
        let write_target = self.write_submitted.load(Ordering::SeqCst);
        let read_target = self.read_submitted.load(Ordering::SeqCst);
        self.write_quiet(write_target)?;
        self.read_quiet(read_target)
    }

    pub(crate) fn write_progress(&self) -> u64 {
        self.write_submitted
            .load(Ordering::SeqCst)
            .saturating_sub(self.write_completed.load(Ordering::SeqCst))
    }

    pub(crate) fn read_progress(&self) -> u64 {
        self.read_submitted
            .load(Ordering::SeqCst)
            .saturating_sub(self.read_completed.load(Ordering::SeqCst))
    }

    pub(crate) fn progress(&self) -> u64 {
        self.write_progress() + self.read_progress()
    }

    #[cfg(test)]
    pub(crate) fn completion_queues_empty(&self) -> bool {
        self.write_cq.is_empty() && self.read_cq.is_empty()
    }
}

fn drain_first(queue: &SegQueue<FamError>) -> FamResult<()> {
    let mut first = None;
    while let Some(err) = queue.pop() {
        if first.is_none() {
            first = Some(err);
        }
    }
    match first {
        Some(err) => Err(err),
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::FamErrorKind;
    use std::sync::Arc;

    #[test]
    fn quiet_returns_once_counts_match() {
        let ctx = Arc::new(OpsContext::new(0));
        ctx.inc_write_submitted();
        ctx.inc_write_submitted();

        let waiter = {
            let ctx = Arc::clone(&ctx);
            std::thread::spawn(move || ctx.quiet())
        };
        ctx.complete_write(None);
        ctx.complete_write(None);
        waiter.join().unwrap().unwrap();
        assert_eq!(ctx.progress(), 0);
        assert!(ctx.completion_queues_empty());
    }

    #[test]
    fn quiet_surfaces_first_parked_error() {
        let ctx = OpsContext::new(0);
        ctx.inc_write_submitted();
        ctx.inc_write_submitted();
        ctx.complete_write(Some(FamError::out_of_range("first")));
        ctx.complete_write(Some(FamError::no_perm("second")));

        let err = ctx.quiet().unwrap_err();
        assert_eq!(err.kind(), FamErrorKind::OutOfRange);
        // The queue is cleared even though only the first error surfaced.
        assert!(ctx.completion_queues_empty());
        assert!(ctx.quiet().is_ok());
    }

    #[test]
    fn progress_counts_both_classes() {
        let ctx = OpsContext::new(0);
        ctx.inc_write_submitted();
        ctx.inc_read_submitted();
        ctx.inc_read_submitted();
        assert_eq!(ctx.progress(), 3);
        ctx.complete_read(None);
        assert_eq!(ctx.progress(), 2);
        assert_eq!(ctx.write_progress(), 1);
        assert_eq!(ctx.read_progress(), 1);
    }
}
