//! Engine handle
//!
//! Two operating modes:
//! - Threaded: a `sigflow-master` thread runs the event loop and renders
//!   whenever a poll function asks for it
//! - Synchronous: the caller drives the master with `iterate` or `render`
//!
//! Either way, user threads talk to the master only through transactions
//! and release what it hands back through `collect`.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use sigflow_core::{BlockConfig, EngineError, EngineResult, TickStamp, TickWakeup};

use crate::config::EngineConfig;
use crate::const_values::ConstValueCache;
use crate::job::{Job, SyncPoint};
use crate::master::Master;
use crate::pqueue::{self, ProcessQueue};
use crate::queue::{Garbage, JobQueue};
use crate::slave::SlavePool;
use crate::transaction::Transaction;

#[cfg(unix)]
use crate::event_loop::{self, WakePipe};

const MASTER_THREAD_NAME: &str = "sigflow-master";

/// Whether the calling thread is the engine's master thread
pub(crate) fn on_master_thread() -> bool {
    thread::current().name() == Some(MASTER_THREAD_NAME)
}

type GarbageHook = Box<dyn Fn() + Send + Sync>;

// ============ Shared State ============

/// State shared by user threads, the master and the slaves
pub(crate) struct EngineShared {
    pub tick: TickStamp,
    sample_freq: AtomicU32,
    control_freq: AtomicU32,
    block_size: AtomicUsize,
    control_raster: AtomicUsize,
    pub queue: JobQueue,
    pub pqueue: ProcessQueue,
    pub consts: ConstValueCache,
    #[cfg(unix)]
    waker: Option<Arc<WakePipe>>,
    threaded: bool,
    n_integrated: AtomicUsize,
    garbage_hook: Mutex<Option<GarbageHook>>,
}

impl EngineShared {
    pub fn new(config: &EngineConfig, threaded: bool) -> EngineResult<Arc<Self>> {
        let block = config.block_config()?;
        #[cfg(unix)]
        let waker = if threaded { Some(Arc::new(WakePipe::new()?)) } else { None };
        #[cfg(not(unix))]
        {
            if threaded {
                return Err(EngineError::NotThreaded);
            }
        }

        let shared = Self {
            tick: TickStamp::new(),
            sample_freq: AtomicU32::new(0),
            control_freq: AtomicU32::new(0),
            block_size: AtomicUsize::new(0),
            control_raster: AtomicUsize::new(0),
            queue: JobQueue::new(),
            pqueue: ProcessQueue::new(),
            consts: ConstValueCache::new(),
            #[cfg(unix)]
            waker,
            threaded,
            n_integrated: AtomicUsize::new(0),
            garbage_hook: Mutex::new(None),
        };
        shared.apply_block_config(&block);
        Ok(Arc::new(shared))
    }

    pub fn apply_block_config(&self, block: &BlockConfig) {
        self.sample_freq.store(block.sample_freq, Ordering::Release);
        self.control_freq.store(block.control_freq, Ordering::Release);
        self.block_size.store(block.block_size, Ordering::Release);
        self.control_raster.store(block.control_raster, Ordering::Release);
        self.tick.set_leap(block.block_size as u64);
    }

    #[inline]
    pub fn block_size(&self) -> usize {
        self.block_size.load(Ordering::Acquire)
    }

    pub fn sample_freq(&self) -> u32 {
        self.sample_freq.load(Ordering::Acquire)
    }

    pub fn is_threaded(&self) -> bool {
        self.threaded
    }

    pub fn n_integrated(&self) -> usize {
        self.n_integrated.load(Ordering::Acquire)
    }

    pub fn set_n_integrated(&self, n: usize) {
        self.n_integrated.store(n, Ordering::Release);
    }

    /// Queue a transaction; returns the stamp by which it will have been applied
    pub fn enqueue(&self, jobs: Vec<Job>) -> u64 {
        if jobs.is_empty() {
            return 0;
        }
        let stamp = self.queue.enqueue(jobs, self.block_size() as u64);
        self.wake_master();
        stamp
    }

    #[cfg(unix)]
    pub fn wake_master(&self) {
        if let Some(waker) = &self.waker {
            waker.wake();
        }
    }

    #[cfg(not(unix))]
    pub fn wake_master(&self) {}

    pub fn drain_process_queue(&self) -> usize {
        pqueue::drain(&self.pqueue, &self.consts)
    }

    pub fn notify_garbage(&self) {
        if let Some(hook) = self.garbage_hook.lock().as_ref() {
            hook();
        }
    }
}

// ============ Engine ============

/// Realtime processing engine
pub struct Engine {
    shared: Arc<EngineShared>,
    /// Present in synchronous mode
    master: Option<Mutex<Master>>,
    master_thread: Option<JoinHandle<()>>,
    quit: Arc<AtomicBool>,
    n_slaves: usize,
}

impl Engine {
    /// Start with a master thread and `config.slave_count()` slaves
    #[cfg(not(unix))]
    pub fn start(_config: EngineConfig) -> EngineResult<Self> {
        Err(EngineError::NotThreaded)
    }

    /// Start with a master thread and `config.slave_count()` slaves
    #[cfg(unix)]
    pub fn start(config: EngineConfig) -> EngineResult<Self> {
        let shared = EngineShared::new(&config, true)?;
        let slaves = SlavePool::spawn(&shared, config.slave_count())?;
        let n_slaves = slaves.len();
        let master = Master::new(Arc::clone(&shared), slaves);
        let quit = Arc::new(AtomicBool::new(false));
        let waker = shared.waker.clone().ok_or(EngineError::NotThreaded)?;

        let handle = {
            let quit = Arc::clone(&quit);
            thread::Builder::new()
                .name(MASTER_THREAD_NAME.into())
                .spawn(move || event_loop::run_master(master, waker, quit))
                .map_err(|source| {
                    log::error!("Failed to spawn master thread: {}", source);
                    EngineError::ThreadSpawn {
                        name: MASTER_THREAD_NAME.into(),
                        source,
                    }
                })?
        };

        log::info!(
            "Engine started: {} Hz, block size {}, {} slaves",
            shared.sample_freq(),
            shared.block_size(),
            n_slaves
        );
        Ok(Self {
            shared,
            master: None,
            master_thread: Some(handle),
            quit,
            n_slaves,
        })
    }

    /// Engine driven by the caller through [`Engine::iterate`] and [`Engine::render`]
    pub fn new_synchronous(config: EngineConfig) -> EngineResult<Self> {
        let shared = EngineShared::new(&config, false)?;
        let slaves = SlavePool::spawn(&shared, config.n_slaves.unwrap_or(0))?;
        let n_slaves = slaves.len();
        let master = Master::new(Arc::clone(&shared), slaves);
        log::info!(
            "Synchronous engine: {} Hz, block size {}",
            shared.sample_freq(),
            shared.block_size()
        );
        Ok(Self {
            shared,
            master: Some(Mutex::new(master)),
            master_thread: None,
            quit: Arc::new(AtomicBool::new(false)),
            n_slaves,
        })
    }

    pub fn is_threaded(&self) -> bool {
        self.shared.is_threaded()
    }

    pub fn n_slaves(&self) -> usize {
        self.n_slaves
    }

    // ============ Transactions ============

    pub fn transaction(&self) -> Transaction {
        Transaction::open(Arc::clone(&self.shared))
    }

    /// Commit `jobs` as one transaction
    pub fn transact(&self, jobs: impl IntoIterator<Item = Job>) -> u64 {
        self.shared.enqueue(jobs.into_iter().collect())
    }

    /// Block until every committed transaction has been applied
    pub fn wait_on_trans(&self) {
        match &self.master {
            Some(master) => master.lock().dispatch(),
            None => self.shared.queue.wait_on_trans(),
        }
        self.collect();
    }

    /// Wait until the tick stamp reaches `tick_stamp`; false on timeout
    pub fn wait_until(&self, tick_stamp: u64, timeout: Duration) -> bool {
        if self.tick_stamp() >= tick_stamp {
            return true;
        }
        if !self.is_threaded() {
            return false;
        }

        let signal = Arc::new((Mutex::new(false), Condvar::new()));
        let wakeup = {
            let signal = Arc::clone(&signal);
            TickWakeup::new(move |_| {
                let (reached, cond) = &*signal;
                *reached.lock() = true;
                cond.notify_all();
            })
        };
        self.shared.tick.awake_after(&wakeup, tick_stamp);

        let deadline = Instant::now() + timeout;
        {
            let (reached, cond) = &*signal;
            let mut reached = reached.lock();
            while !*reached && self.tick_stamp() < tick_stamp {
                if cond.wait_until(&mut reached, deadline).timed_out() {
                    break;
                }
            }
        }
        self.shared.tick.awake_after(&wakeup, 0);
        self.tick_stamp() >= tick_stamp
    }

    // ============ Time Base ============

    pub fn tick_stamp(&self) -> u64 {
        self.shared.tick.current()
    }

    pub fn block_size(&self) -> usize {
        self.shared.block_size()
    }

    pub fn sample_freq(&self) -> u32 {
        self.shared.sample_freq()
    }

    pub fn control_freq(&self) -> u32 {
        self.shared.control_freq.load(Ordering::Acquire)
    }

    pub fn control_raster(&self) -> usize {
        self.shared.control_raster.load(Ordering::Acquire)
    }

    /// Tick stamp at a wall-clock time in microseconds since the UNIX epoch
    pub fn tick_stamp_from_systime(&self, system_time_us: u64) -> u64 {
        self.shared.tick.from_system_time(system_time_us, self.sample_freq())
    }

    /// Change latency and sample rate; the master is parked meanwhile.
    ///
    /// Refused while any module is integrated.
    pub fn configure(&self, latency_ms: u32, sample_freq: u32, control_freq: u32) -> EngineResult<BlockConfig> {
        let block = sigflow_core::constrain(latency_ms, sample_freq, control_freq)?;
        match &self.master {
            Some(master) => {
                let mut master = master.lock();
                master.dispatch();
                if self.n_integrated() > 0 {
                    return Err(EngineError::ConfigureRefused("modules are still integrated"));
                }
                self.shared.apply_block_config(&block);
                master.reconfigured();
            }
            None => {
                if on_master_thread() {
                    return Err(EngineError::ConfigureRefused("called from the master thread"));
                }
                if self.master_thread.is_none() {
                    return Err(EngineError::Shutdown);
                }
                self.shared.queue.wait_on_trans();
                if self.n_integrated() > 0 {
                    return Err(EngineError::ConfigureRefused("modules are still integrated"));
                }
                let point = SyncPoint::new();
                self.shared.enqueue(vec![Job::sync(Arc::clone(&point))]);
                point.wait_parked();
                self.shared.apply_block_config(&block);
                let expired = self.shared.consts.recycle(true);
                self.shared
                    .queue
                    .add_garbage(expired.into_iter().map(Garbage::Values).collect());
                point.release();
            }
        }
        log::info!(
            "Engine configured: {} Hz, block size {}, control raster {}",
            block.sample_freq,
            block.block_size,
            block.control_raster
        );
        Ok(block)
    }

    // ============ Synchronous Driving ============

    /// One master iteration; false when nothing was due
    pub fn iterate(&self) -> EngineResult<bool> {
        let master = self.master.as_ref().ok_or(EngineError::ConfigureRefused(
            "iterate requires a synchronous engine",
        ))?;
        let mut master = master.lock();
        let mut timeout_ms = None;
        let due = master.prepare(&mut timeout_ms) || master.check(false);
        if due {
            master.dispatch();
        }
        Ok(due)
    }

    /// Render `n_blocks` blocks back to back, applying pending jobs first
    pub fn render(&self, n_blocks: usize) -> EngineResult<u64> {
        let master = self.master.as_ref().ok_or(EngineError::ConfigureRefused(
            "render requires a synchronous engine",
        ))?;
        let mut master = master.lock();
        for _ in 0..n_blocks {
            master.force_process();
            master.dispatch();
        }
        if n_blocks == 0 {
            master.dispatch();
        }
        Ok(self.tick_stamp())
    }

    // ============ Garbage ============

    pub fn has_garbage(&self) -> bool {
        self.shared.queue.has_garbage()
    }

    /// Release everything the engine is done with; runs probe and user callbacks
    pub fn collect(&self) -> usize {
        self.shared.queue.collect()
    }

    /// Run `callback` on the next `collect`
    pub fn add_user_callback(&self, callback: impl FnOnce() + Send + 'static) {
        self.shared.queue.push_garbage(Garbage::Callback(Box::new(callback)));
    }

    /// Called from the master thread whenever garbage becomes available
    pub fn on_garbage(&self, hook: impl Fn() + Send + Sync + 'static) {
        *self.shared.garbage_hook.lock() = Some(Box::new(hook));
    }

    /// Modules currently integrated
    pub fn n_integrated(&self) -> usize {
        self.shared.n_integrated()
    }

    // ============ Shutdown ============

    /// Stop the master and slaves; pending garbage is collected
    pub fn shutdown(&mut self) {
        self.quit.store(true, Ordering::Release);
        self.shared.wake_master();
        if let Some(handle) = self.master_thread.take() {
            if handle.join().is_err() {
                log::error!("master thread panicked");
            }
            log::info!("Engine shut down");
        }
        self.master.take();
        self.collect();
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("threaded", &self.is_threaded())
            .field("tick_stamp", &self.tick_stamp())
            .field("block_size", &self.block_size())
            .field("n_slaves", &self.n_slaves)
            .finish()
    }
}
