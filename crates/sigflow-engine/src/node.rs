//! Engine nodes and the public module handle
//!
//! Each node carries:
//! - Atomics read by the process threads without locking
//! - A reentrant exec lock guarding buffers, routing and flow jobs
//! - An optional cycle group lock, always taken before the exec lock

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use parking_lot::{Mutex, ReentrantMutex};
use sigflow_core::{EngineError, EngineResult, NodeId};

use crate::job::AccessFn;
use crate::module::{AudioModule, ModuleClass, ModuleFlags, StreamIo, VirtualModule};
use crate::queue::Garbage;

// ============ Timed Jobs ============

pub(crate) enum TimedAction {
    Access(AccessFn),
    Discard,
}

/// Access job bound to a tick stamp
pub(crate) struct TimedJob {
    pub tick_stamp: u64,
    pub action: TimedAction,
}

/// Insert keeping `jobs` ordered by stamp, after equal stamps
pub(crate) fn insert_timed(jobs: &mut VecDeque<TimedJob>, job: TimedJob) {
    let pos = jobs.partition_point(|j| j.tick_stamp <= job.tick_stamp);
    jobs.insert(pos, job);
}

// ============ Exec State ============

/// Resolved source of an input during processing
pub(crate) struct RealInput {
    pub node: Arc<EngineNode>,
    pub stream: usize,
}

/// Published by the scheduler, read by process threads
#[derive(Default)]
pub(crate) struct Routing {
    pub inputs: Vec<Option<RealInput>>,
    pub jinputs: Vec<Vec<RealInput>>,
}

/// Node state guarded by the exec lock
pub(crate) struct NodeExec {
    pub module: RefCell<Option<Box<dyn AudioModule>>>,
    pub io: RefCell<StreamIo>,
    pub routing: RefCell<Routing>,
    pub flow_jobs: RefCell<VecDeque<TimedJob>>,
    /// Executed flow jobs awaiting collection
    pub trash: RefCell<Vec<Garbage>>,
    /// Set while the node is being processed on this thread's stack
    pub busy: Cell<bool>,
}

pub(crate) struct EngineNode {
    pub id: NodeId,
    pub class: ModuleClass,
    /// Tick stamp up to which outputs are computed
    counter: AtomicU64,
    /// Processing is suspended while `counter < next_active`
    next_active: AtomicU64,
    needs_reset: AtomicBool,
    integrated: AtomicBool,
    discarded: AtomicBool,
    scheduled: AtomicBool,
    sources: Box<[AtomicBool]>,
    group: Mutex<Option<Arc<ReentrantMutex<()>>>>,
    pub exec: ReentrantMutex<NodeExec>,
}

impl EngineNode {
    fn new(class: ModuleClass, module: Box<dyn AudioModule>) -> Self {
        Self {
            id: NodeId::next(),
            class,
            counter: AtomicU64::new(0),
            next_active: AtomicU64::new(0),
            needs_reset: AtomicBool::new(false),
            integrated: AtomicBool::new(false),
            discarded: AtomicBool::new(false),
            scheduled: AtomicBool::new(false),
            sources: (0..class.n_istreams).map(|_| AtomicBool::new(false)).collect(),
            group: Mutex::new(None),
            exec: ReentrantMutex::new(NodeExec {
                module: RefCell::new(Some(module)),
                io: RefCell::new(StreamIo::new(&class)),
                routing: RefCell::new(Routing::default()),
                flow_jobs: RefCell::new(VecDeque::new()),
                trash: RefCell::new(Vec::new()),
                busy: Cell::new(false),
            }),
        }
    }

    #[inline]
    pub fn counter(&self) -> u64 {
        self.counter.load(Ordering::Acquire)
    }

    #[inline]
    pub fn set_counter(&self, stamp: u64) {
        self.counter.store(stamp, Ordering::Release);
    }

    #[inline]
    pub fn next_active(&self) -> u64 {
        self.next_active.load(Ordering::Acquire)
    }

    pub fn set_next_active(&self, stamp: u64) {
        self.next_active.store(stamp, Ordering::Release);
    }

    #[inline]
    pub fn is_suspended(&self, counter: u64) -> bool {
        counter < self.next_active()
    }

    pub fn needs_reset(&self) -> bool {
        self.needs_reset.load(Ordering::Acquire)
    }

    pub fn set_needs_reset(&self, value: bool) {
        self.needs_reset.store(value, Ordering::Release);
    }

    pub fn is_integrated(&self) -> bool {
        self.integrated.load(Ordering::Acquire)
    }

    pub fn set_integrated(&self, value: bool) {
        self.integrated.store(value, Ordering::Release);
    }

    pub fn is_discarded(&self) -> bool {
        self.discarded.load(Ordering::Acquire)
    }

    pub fn mark_discarded(&self) {
        self.discarded.store(true, Ordering::Release);
    }

    pub fn is_scheduled(&self) -> bool {
        self.scheduled.load(Ordering::Acquire)
    }

    pub fn set_scheduled(&self, value: bool) {
        self.scheduled.store(value, Ordering::Release);
    }

    pub fn set_has_source(&self, istream: usize, value: bool) {
        if let Some(flag) = self.sources.get(istream) {
            flag.store(value, Ordering::Release);
        }
    }

    pub fn group(&self) -> Option<Arc<ReentrantMutex<()>>> {
        self.group.lock().clone()
    }

    pub fn set_group(&self, group: Option<Arc<ReentrantMutex<()>>>) {
        *self.group.lock() = group;
    }

    /// Contract check for jobs that require an integrated node
    pub fn ensure_integrated(&self) -> EngineResult<()> {
        if self.is_integrated() {
            Ok(())
        } else if self.is_discarded() {
            Err(EngineError::Discarded(self.id))
        } else {
            Err(EngineError::NotIntegrated(self.id))
        }
    }

    pub fn has_flow_jobs(&self) -> bool {
        !self.exec.lock().flow_jobs.borrow().is_empty()
    }
}

// ============ Module Handle ============

/// Handle to a module; cheap to clone, shared with the engine once integrated
#[derive(Clone)]
pub struct Module {
    node: Arc<EngineNode>,
}

impl Module {
    /// Wrap an implementation. Classes requesting deferred processing are refused.
    pub fn new(class: ModuleClass, module: Box<dyn AudioModule>) -> EngineResult<Self> {
        if class.flags.contains(ModuleFlags::DEFERRED) {
            log::warn!("refusing module with deferred processing: delay cycle processing not yet implemented");
            return Err(EngineError::DeferredProcessing);
        }
        Ok(Self {
            node: Arc::new(EngineNode::new(class, module)),
        })
    }

    /// Pass-through module with `n_iostreams` inputs mapped to equal outputs
    pub fn new_virtual(n_iostreams: usize) -> EngineResult<Self> {
        let class = ModuleClass::new(n_iostreams, 0, n_iostreams).with_flags(ModuleFlags::VIRTUAL);
        Self::new(class, Box::new(VirtualModule))
    }

    pub(crate) fn node(&self) -> &Arc<EngineNode> {
        &self.node
    }

    pub fn id(&self) -> NodeId {
        self.node.id
    }

    pub fn class(&self) -> &ModuleClass {
        &self.node.class
    }

    pub fn n_istreams(&self) -> usize {
        self.node.class.n_istreams
    }

    pub fn n_jstreams(&self) -> usize {
        self.node.class.n_jstreams
    }

    pub fn n_ostreams(&self) -> usize {
        self.node.class.n_ostreams
    }

    pub fn is_virtual(&self) -> bool {
        self.node.class.is_virtual()
    }

    pub fn is_integrated(&self) -> bool {
        self.node.is_integrated()
    }

    /// Whether the node is part of the current schedule
    pub fn is_scheduled(&self) -> bool {
        self.node.is_scheduled()
    }

    /// Tick stamp up to which the node has been processed
    pub fn tick_stamp(&self) -> u64 {
        self.node.counter()
    }

    /// Whether an input stream has a connected source; false when out of range
    pub fn has_source(&self, istream: usize) -> bool {
        self.node
            .sources
            .get(istream)
            .is_some_and(|flag| flag.load(Ordering::Acquire))
    }
}

impl PartialEq for Module {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.node, &other.node)
    }
}

impl Eq for Module {}

impl fmt::Debug for Module {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Module")
            .field("id", &self.node.id)
            .field("class", &self.node.class)
            .field("integrated", &self.node.is_integrated())
            .finish()
    }
}
