//! Process queue shared by the master and slave threads
//!
//! Holds the secured schedule for the block being rendered. Threads pop
//! nodes and cycles until the schedule is exhausted; the master waits
//! until every popped item has been pushed back as processed.

use parking_lot::{Condvar, Mutex};

use crate::const_values::ConstValueCache;
use crate::process;
use crate::queue::Garbage;
use crate::schedule::{Schedule, Work};

/// Tick range of the block being rendered
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct BlockInfo {
    /// Stamp of the first sample
    pub current: u64,
    /// Stamp every node must reach
    pub final_counter: u64,
}

struct PQueueState {
    schedule: Option<Schedule>,
    block: BlockInfo,
    n_nodes: usize,
    n_cycles: usize,
    trash: Vec<Garbage>,
}

impl PQueueState {
    fn is_done(&self) -> bool {
        self.n_nodes == 0 && self.n_cycles == 0 && self.schedule.as_ref().is_none_or(Schedule::is_exhausted)
    }
}

pub(crate) struct ProcessQueue {
    state: Mutex<PQueueState>,
    done: Condvar,
}

impl ProcessQueue {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(PQueueState {
                schedule: None,
                block: BlockInfo {
                    current: 0,
                    final_counter: 0,
                },
                n_nodes: 0,
                n_cycles: 0,
                trash: Vec::new(),
            }),
            done: Condvar::new(),
        }
    }

    /// Install a secured schedule and rewind it for `block`
    pub fn set_schedule(&self, mut schedule: Schedule, block: BlockInfo) {
        let mut state = self.state.lock();
        if state.schedule.is_some() {
            log::warn!("process queue: schedule already set");
        }
        schedule.restart();
        state.schedule = Some(schedule);
        state.block = block;
    }

    /// Take the schedule back once processing is done, with collected trash
    pub fn unset_schedule(&self) -> Option<(Schedule, Vec<Garbage>)> {
        let mut state = self.state.lock();
        if state.n_nodes > 0 || state.n_cycles > 0 {
            log::warn!(
                "process queue: schedule still busy ({} nodes, {} cycles)",
                state.n_nodes,
                state.n_cycles
            );
        }
        let schedule = state.schedule.take()?;
        Some((schedule, std::mem::take(&mut state.trash)))
    }

    pub fn pop_unprocessed(&self) -> Option<(Work, BlockInfo)> {
        let mut state = self.state.lock();
        let block = state.block;
        let work = state.schedule.as_mut()?.pop_work()?;
        match work {
            Work::Node(_) => state.n_nodes += 1,
            Work::Cycle(_) => state.n_cycles += 1,
        }
        Some((work, block))
    }

    pub fn push_processed(&self, is_cycle: bool, trash: Vec<Garbage>) {
        let mut state = self.state.lock();
        if is_cycle {
            state.n_cycles = state.n_cycles.saturating_sub(1);
        } else {
            state.n_nodes = state.n_nodes.saturating_sub(1);
        }
        state.trash.extend(trash);
        if state.is_done() {
            self.done.notify_all();
        }
    }

    /// Block until every scheduled item has been processed
    pub fn wait_on_unprocessed(&self) {
        let mut state = self.state.lock();
        while !state.is_done() {
            self.done.wait(&mut state);
        }
    }
}

/// Process items until the schedule runs dry
pub(crate) fn drain(pqueue: &ProcessQueue, consts: &ConstValueCache) -> usize {
    let mut n_items = 0;
    while let Some((work, block)) = pqueue.pop_unprocessed() {
        let trash = process::process_work(&work, block, consts);
        pqueue.push_processed(matches!(work, Work::Cycle(_)), trash);
        n_items += 1;
    }
    n_items
}
