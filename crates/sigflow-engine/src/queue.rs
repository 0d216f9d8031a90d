//! Transaction queue and user-thread garbage
//!
//! Committed transactions wait here for the master thread. Everything the
//! master or a process thread is done with comes back as [`Garbage`] and
//! is released by the user thread in [`JobQueue::collect`].

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};
use sigflow_core::Sample;

use crate::job::{AccessFn, Job, PollFn, ProbeJob, TimerFn};
use crate::module::AudioModule;
use crate::node::EngineNode;

/// Object whose release is deferred to the user thread
pub(crate) enum Garbage {
    Jobs(Vec<Job>),
    Access(AccessFn),
    Probe(ProbeJob),
    Module(Box<dyn AudioModule>),
    Node(Arc<EngineNode>),
    Timer(TimerFn),
    Poll(PollFn),
    Values(Arc<[Sample]>),
    Callback(Box<dyn FnOnce() + Send>),
}

impl Garbage {
    /// Release on the calling thread, running callbacks
    pub fn release(self) {
        match self {
            Garbage::Probe(probe) => probe.deliver(),
            Garbage::Callback(callback) => callback(),
            other => drop(other),
        }
    }
}

struct QueueState {
    pending: VecDeque<Vec<Job>>,
    /// Transactions popped by the master but not yet retired
    n_active: usize,
    commit_base_stamp: u64,
    trash: Vec<Garbage>,
}

pub(crate) struct JobQueue {
    state: Mutex<QueueState>,
    drained: Condvar,
}

impl JobQueue {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(QueueState {
                pending: VecDeque::new(),
                n_active: 0,
                commit_base_stamp: 1,
                trash: Vec::new(),
            }),
            drained: Condvar::new(),
        }
    }

    /// Append a committed transaction; returns the stamp by which it will have been applied
    pub fn enqueue(&self, jobs: Vec<Job>, block_size: u64) -> u64 {
        let mut state = self.state.lock();
        state.pending.push_back(jobs);
        state.commit_base_stamp + block_size
    }

    pub fn has_pending(&self) -> bool {
        !self.state.lock().pending.is_empty()
    }

    /// Next transaction in commit order.
    ///
    /// With an empty queue and `update_commit_stamp` set, the commit base
    /// moves up to `current`.
    pub fn pop_transaction(&self, update_commit_stamp: bool, current: u64) -> Option<Vec<Job>> {
        let mut state = self.state.lock();
        match state.pending.pop_front() {
            Some(jobs) => {
                state.n_active += 1;
                Some(jobs)
            }
            None => {
                if update_commit_stamp {
                    state.commit_base_stamp = current;
                }
                None
            }
        }
    }

    /// Hand an applied transaction back for release
    pub fn retire(&self, jobs: Vec<Job>) {
        let mut state = self.state.lock();
        state.n_active = state.n_active.saturating_sub(1);
        if !jobs.is_empty() {
            state.trash.push(Garbage::Jobs(jobs));
        }
        if state.pending.is_empty() && state.n_active == 0 {
            self.drained.notify_all();
        }
    }

    /// Block until every committed transaction has been applied
    pub fn wait_on_trans(&self) {
        let mut state = self.state.lock();
        while !state.pending.is_empty() || state.n_active > 0 {
            self.drained.wait(&mut state);
        }
    }

    #[cfg(test)]
    pub fn is_drained(&self) -> bool {
        let state = self.state.lock();
        state.pending.is_empty() && state.n_active == 0
    }

    pub fn add_garbage(&self, garbage: Vec<Garbage>) {
        if garbage.is_empty() {
            return;
        }
        self.state.lock().trash.extend(garbage);
    }

    pub fn push_garbage(&self, garbage: Garbage) {
        self.state.lock().trash.push(garbage);
    }

    pub fn has_garbage(&self) -> bool {
        !self.state.lock().trash.is_empty()
    }

    /// Take all pending garbage; release happens outside the queue lock
    pub fn take_garbage(&self) -> Vec<Garbage> {
        std::mem::take(&mut self.state.lock().trash)
    }

    /// Release all pending garbage on the calling thread
    pub fn collect(&self) -> usize {
        let garbage = self.take_garbage();
        let n = garbage.len();
        for item in garbage {
            item.release();
        }
        n
    }
}
