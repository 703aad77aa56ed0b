//! Timed-key expiry scheduler.
//!
//! One background worker drains a deadline heap and fires each job against
//! its bucket. Jobs hold weak references, so a bucket that was dropped or
//! deleted is simply skipped. Closing the scheduler discards pending jobs;
//! the reload sweep deletes anything that expired while the database was
//! down.

use crate::bucket::{Bucket, BucketShared};
use parking_lot::{Condvar, Mutex, MutexGuard};
use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::{Instant, SystemTime};
use tracing::debug;

struct Job {
    due: Instant,
    seq: u64,
    bucket: Weak<BucketShared>,
    key: String,
    mtime: SystemTime,
}

impl PartialEq for Job {
    fn eq(&self, other: &Self) -> bool {
        self.due == other.due && self.seq == other.seq
    }
}

impl Eq for Job {}

impl PartialOrd for Job {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Job {
    fn cmp(&self, other: &Self) -> Ordering {
        // Inverted so the earliest deadline sits on top of the max-heap.
        other
            .due
            .cmp(&self.due)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

struct State {
    jobs: BinaryHeap<Job>,
    stopped: bool,
    seq: u64,
}

struct Shared {
    state: Mutex<State>,
    cond: Condvar,
}

/// The expiry timer queue. Owned by the database.
pub(crate) struct ExpiryQueue {
    shared: Arc<Shared>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl ExpiryQueue {
    /// Creates the queue and starts its worker thread.
    pub(crate) fn new() -> Self {
        let shared = Arc::new(Shared {
            state: Mutex::new(State {
                jobs: BinaryHeap::new(),
                stopped: false,
                seq: 0,
            }),
            cond: Condvar::new(),
        });
        let worker = {
            let shared = Arc::clone(&shared);
            thread::spawn(move || run(&shared))
        };
        Self {
            shared,
            worker: Mutex::new(Some(worker)),
        }
    }

    /// Schedules `delete_timed(key, mtime)` on `bucket` at `due`.
    pub(crate) fn schedule(
        &self,
        due: Instant,
        bucket: Weak<BucketShared>,
        key: String,
        mtime: SystemTime,
    ) {
        let mut state = self.shared.state.lock();
        if state.stopped {
            return;
        }
        state.seq += 1;
        let seq = state.seq;
        state.jobs.push(Job {
            due,
            seq,
            bucket,
            key,
            mtime,
        });
        self.shared.cond.notify_all();
    }

    /// Stops the worker; pending jobs are dropped.
    pub(crate) fn close(&self) {
        {
            let mut state = self.shared.state.lock();
            state.stopped = true;
            self.shared.cond.notify_all();
        }
        if let Some(handle) = self.worker.lock().take() {
            let _ = handle.join();
        }
    }
}

fn run(shared: &Shared) {
    let mut state = shared.state.lock();
    loop {
        if state.stopped {
            break;
        }
        let now = Instant::now();
        let due = match state.jobs.peek() {
            None => {
                shared.cond.wait(&mut state);
                continue;
            }
            Some(job) if job.due > now => job.due,
            Some(_) => {
                if let Some(job) = state.jobs.pop() {
                    MutexGuard::unlocked(&mut state, || fire(job));
                }
                continue;
            }
        };
        let _ = shared.cond.wait_until(&mut state, due);
    }
    debug!("expiry worker stopped, {} jobs dropped", state.jobs.len());
}

fn fire(job: Job) {
    if let Some(shared) = job.bucket.upgrade() {
        Bucket::from_shared(shared).delete_timed(&job.key, job.mtime);
    }
}
