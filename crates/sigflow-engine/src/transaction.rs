//! Transactions: ordered job batches applied atomically between blocks

use std::sync::Arc;

use parking_lot::{Condvar, Mutex};
use sigflow_core::{EngineError, EngineResult};

use crate::engine::{self, EngineShared};
use crate::job::Job;

/// Ordered batch of jobs.
///
/// `commit` and `dismiss` consume the transaction; dropping an uncommitted
/// transaction dismisses it.
pub struct Transaction {
    jobs: Vec<Job>,
    shared: Arc<EngineShared>,
}

impl Transaction {
    pub(crate) fn open(shared: Arc<EngineShared>) -> Self {
        Self {
            jobs: Vec::new(),
            shared,
        }
    }

    /// Append a job
    pub fn add(&mut self, job: Job) -> &mut Self {
        self.jobs.push(job);
        self
    }

    /// Append all jobs of `other`, leaving it empty
    pub fn merge(&mut self, mut other: Transaction) -> &mut Self {
        self.jobs.append(&mut other.jobs);
        self
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    /// Queue the jobs for the master thread.
    ///
    /// Returns the tick stamp by which they will have been applied, 0 for an
    /// empty transaction.
    pub fn commit(mut self) -> u64 {
        let jobs = std::mem::take(&mut self.jobs);
        self.shared.enqueue(jobs)
    }

    /// Commit once the tick stamp reaches `tick_stamp`, blocking until then.
    ///
    /// Requires a master thread and must not be called from it; the
    /// transaction is dismissed on refusal.
    pub fn commit_delayed(mut self, tick_stamp: u64) -> EngineResult<()> {
        if tick_stamp <= self.shared.tick.current() {
            self.commit();
            return Ok(());
        }
        if engine::on_master_thread() {
            log::warn!("commit_delayed refused on the master thread");
            return Err(EngineError::OnMasterThread("commit_delayed"));
        }
        if !self.shared.is_threaded() {
            log::warn!("commit_delayed refused without master thread");
            return Err(EngineError::NotThreaded);
        }

        let signal = Arc::new((Mutex::new(false), Condvar::new()));
        let mut jobs = Some(std::mem::take(&mut self.jobs));
        let timer = {
            let shared = Arc::clone(&self.shared);
            let signal = Arc::clone(&signal);
            Job::add_timer(move |stamp| {
                if stamp < tick_stamp {
                    return true;
                }
                if let Some(jobs) = jobs.take() {
                    shared.enqueue(jobs);
                }
                let (done, cond) = &*signal;
                *done.lock() = true;
                cond.notify_all();
                false
            })
        };
        self.shared.enqueue(vec![timer]);

        let (done, cond) = &*signal;
        let mut done = done.lock();
        while !*done {
            cond.wait(&mut done);
        }
        Ok(())
    }

    /// Drop all jobs without applying them
    pub fn dismiss(mut self) {
        self.dismiss_jobs();
    }

    fn dismiss_jobs(&mut self) {
        if self.jobs.is_empty() {
            return;
        }
        log::debug!("dismissing transaction with {} jobs", self.jobs.len());
        // unapplied jobs never reached the engine, release them here
        drop(std::mem::take(&mut self.jobs));
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        self.dismiss_jobs();
    }
}

impl std::fmt::Debug for Transaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transaction").field("jobs", &self.jobs).finish()
    }
}
