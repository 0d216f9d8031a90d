//! Tick stamp time base
//!
//! Monotonic logical sample clock advanced once per processed block:
//! - Lock-free `current()` for the realtime path
//! - Last update paired with wall-clock time for conversions
//! - One-shot wakeups fired from the advancing thread

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;

use crate::MAX_TICK_STAMP;

/// Wall-clock time in microseconds since the UNIX epoch
pub fn system_time_us() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros() as u64)
        .unwrap_or(0)
}

/// Tick stamp and wall-clock time of the most recent advance
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TickUpdate {
    pub tick_stamp: u64,
    /// Microseconds since the UNIX epoch
    pub system_time: u64,
}

/// One-shot wakeup keyed to a future tick stamp
pub struct TickWakeup {
    awake_stamp: AtomicU64,
    callback: Box<dyn Fn(u64) + Send + Sync>,
}

impl TickWakeup {
    /// `callback` receives the tick stamp that triggered it
    pub fn new(callback: impl Fn(u64) + Send + Sync + 'static) -> Arc<Self> {
        Arc::new(Self {
            awake_stamp: AtomicU64::new(0),
            callback: Box::new(callback),
        })
    }

    /// Pending target stamp, 0 when not registered
    pub fn awake_stamp(&self) -> u64 {
        self.awake_stamp.load(Ordering::Acquire)
    }
}

impl std::fmt::Debug for TickWakeup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TickWakeup")
            .field("awake_stamp", &self.awake_stamp())
            .finish()
    }
}

/// Engine-wide logical clock
pub struct TickStamp {
    current: AtomicU64,
    leap: AtomicU64,
    last: Mutex<TickUpdate>,
    wakeups: Mutex<Vec<Arc<TickWakeup>>>,
}

impl Default for TickStamp {
    fn default() -> Self {
        Self::new()
    }
}

impl TickStamp {
    /// Starts at 1; 0 is reserved for "invalid"
    pub fn new() -> Self {
        Self {
            current: AtomicU64::new(1),
            leap: AtomicU64::new(0),
            last: Mutex::new(TickUpdate {
                tick_stamp: 1,
                system_time: system_time_us(),
            }),
            wakeups: Mutex::new(Vec::new()),
        }
    }

    pub const fn max_stamp() -> u64 {
        MAX_TICK_STAMP
    }

    #[inline]
    pub fn current(&self) -> u64 {
        self.current.load(Ordering::Acquire)
    }

    pub fn get_last(&self) -> TickUpdate {
        *self.last.lock()
    }

    pub fn leap(&self) -> u64 {
        self.leap.load(Ordering::Relaxed)
    }

    pub fn set_leap(&self, leap: u64) {
        self.leap.store(leap, Ordering::Relaxed);
    }

    /// Advance by the configured leap and fire all due wakeups.
    ///
    /// Due wakeups are removed from the pending set before any callback runs,
    /// so a callback may re-register itself for a later stamp.
    pub fn increment(&self) -> u64 {
        let leap = self.leap();
        if leap == 0 {
            log::error!("tick stamp increment without leap");
            return self.current();
        }

        let new_stamp = {
            let mut last = self.last.lock();
            let new_stamp = self.current().saturating_add(leap);
            self.current.store(new_stamp, Ordering::Release);
            *last = TickUpdate {
                tick_stamp: new_stamp,
                system_time: system_time_us(),
            };
            new_stamp
        };

        let due: Vec<Arc<TickWakeup>> = {
            let mut wakeups = self.wakeups.lock();
            let mut due = Vec::new();
            wakeups.retain(|w| {
                if w.awake_stamp() <= new_stamp {
                    w.awake_stamp.store(0, Ordering::Release);
                    due.push(Arc::clone(w));
                    false
                } else {
                    true
                }
            });
            due
        };

        for wakeup in due {
            (wakeup.callback)(new_stamp);
        }

        new_stamp
    }

    /// Register `wakeup` to fire once the tick stamp reaches `stamp`.
    ///
    /// A wakeup appears in the pending set at most once; registering it again
    /// keeps the earlier target. A `stamp` of 0 cancels it.
    pub fn awake_after(&self, wakeup: &Arc<TickWakeup>, stamp: u64) {
        let mut wakeups = self.wakeups.lock();
        let pos = wakeups.iter().position(|w| Arc::ptr_eq(w, wakeup));
        if stamp == 0 {
            if let Some(pos) = pos {
                wakeups.swap_remove(pos);
            }
            wakeup.awake_stamp.store(0, Ordering::Release);
            return;
        }
        match pos {
            Some(_) => {
                let prev = wakeup.awake_stamp();
                wakeup.awake_stamp.store(prev.min(stamp), Ordering::Release);
            }
            None => {
                wakeup.awake_stamp.store(stamp, Ordering::Release);
                wakeups.push(Arc::clone(wakeup));
            }
        }
    }

    pub fn pending_wakeups(&self) -> usize {
        self.wakeups.lock().len()
    }

    /// Convert a wall-clock time (µs) into a tick stamp at `sample_freq`
    pub fn from_system_time(&self, system_time: u64, sample_freq: u32) -> u64 {
        let last = self.get_last();
        let freq = sample_freq as u128;
        if system_time > last.system_time {
            let delta = (system_time - last.system_time) as u128 * freq / 1_000_000;
            last.tick_stamp.saturating_add(delta as u64)
        } else {
            let delta = ((last.system_time - system_time) as u128 * freq / 1_000_000) as u64;
            last.tick_stamp - delta.min(last.tick_stamp)
        }
    }
}
