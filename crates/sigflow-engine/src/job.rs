//! Jobs: deferred graph mutations and accessors
//!
//! Jobs are built on a user thread, batched into a transaction and applied
//! by the master thread in commit order. Constructors check stream ranges
//! eagerly; integration state is checked when the master applies the job.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use sigflow_core::{EngineError, EngineResult, MAX_BLOCK_SIZE, MAX_POLLFDS, MAX_TICK_STAMP, NodeId, Sample, StreamKind};

use crate::module::AudioModule;
use crate::node::Module;

/// Mutable access to a module implementation, run on the master or a process thread
pub type AccessFn = Box<dyn FnMut(&mut dyn AudioModule) + Send>;
/// Receives one block of a module's outputs on the user thread
pub type ProbeFn = Box<dyn FnOnce(ProbeData) + Send>;
/// Called after every tick stamp advance; returning false removes the timer
pub type TimerFn = Box<dyn FnMut(u64) -> bool + Send>;
/// Asked whether a block should be processed; returning true triggers processing
pub type PollFn = Box<dyn FnMut(&mut PollRequest<'_>) -> bool + Send>;

// ============ Poll ============

/// File descriptor watched by the master event loop
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PollFd {
    pub fd: i32,
    pub events: i16,
    pub revents: i16,
}

impl PollFd {
    pub fn new(fd: i32, events: i16) -> Self {
        Self {
            fd,
            events,
            revents: 0,
        }
    }
}

/// Arguments of one poll function query
pub struct PollRequest<'a> {
    /// Samples a processing cycle will produce
    pub min_n_values: usize,
    /// Set by the poll function to bound the master's sleep, in milliseconds
    pub timeout_ms: Option<u64>,
    pub fds: &'a mut [PollFd],
    /// Whether `revents` reflect a completed poll
    pub revents_valid: bool,
}

/// Identity of a registered poll function
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PollHandle(u64);

impl PollHandle {
    fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

// ============ Probe ============

/// One output stream captured by a probe
#[derive(Debug, Clone, PartialEq)]
pub struct ProbeStream {
    pub connected: bool,
    pub values: Vec<Sample>,
}

/// Output block delivered to a probe callback.
///
/// `tick_stamp` is 0 when the node was discarded before any block was taken.
#[derive(Debug, Clone, PartialEq)]
pub struct ProbeData {
    pub tick_stamp: u64,
    pub n_values: usize,
    pub ostreams: Vec<ProbeStream>,
}

pub(crate) struct ProbeJob {
    pub tick_stamp: u64,
    pub n_values: usize,
    pub ostreams: Vec<ProbeStream>,
    pub callback: ProbeFn,
}

impl ProbeJob {
    fn new(n_ostreams: usize, callback: ProbeFn) -> Self {
        Self {
            tick_stamp: 0,
            n_values: 0,
            ostreams: (0..n_ostreams)
                .map(|_| ProbeStream {
                    connected: false,
                    values: vec![0.0; MAX_BLOCK_SIZE],
                })
                .collect(),
            callback,
        }
    }

    /// Run the callback with values cut to the captured length
    pub fn deliver(self) {
        let n_values = self.n_values;
        let ostreams = self
            .ostreams
            .into_iter()
            .map(|mut s| {
                s.values.truncate(n_values);
                s
            })
            .collect();
        (self.callback)(ProbeData {
            tick_stamp: self.tick_stamp,
            n_values,
            ostreams,
        });
    }
}

// ============ Sync ============

/// Rendezvous parking the master thread while a caller holds it
pub(crate) struct SyncPoint {
    parked: parking_lot::Mutex<SyncState>,
    cond: parking_lot::Condvar,
}

#[derive(PartialEq, Eq)]
enum SyncState {
    Pending,
    Parked,
    Released,
}

impl SyncPoint {
    pub fn new() -> std::sync::Arc<Self> {
        std::sync::Arc::new(Self {
            parked: parking_lot::Mutex::new(SyncState::Pending),
            cond: parking_lot::Condvar::new(),
        })
    }

    /// Master side: announce and block until released
    pub fn park(&self) {
        let mut state = self.parked.lock();
        if *state == SyncState::Pending {
            *state = SyncState::Parked;
            self.cond.notify_all();
        }
        while *state != SyncState::Released {
            self.cond.wait(&mut state);
        }
    }

    /// Caller side: wait until the master is parked
    pub fn wait_parked(&self) {
        let mut state = self.parked.lock();
        while *state == SyncState::Pending {
            self.cond.wait(&mut state);
        }
    }

    pub fn release(&self) {
        let mut state = self.parked.lock();
        *state = SyncState::Released;
        self.cond.notify_all();
    }
}

// ============ Job ============

pub(crate) enum JobKind {
    Integrate(Module),
    Discard(Module),
    KillInputs(Module),
    KillOutputs(Module),
    Connect {
        src: Module,
        ostream: usize,
        dest: Module,
        istream: usize,
    },
    JConnect {
        src: Module,
        ostream: usize,
        dest: Module,
        jstream: usize,
    },
    Disconnect {
        dest: Module,
        istream: usize,
    },
    JDisconnect {
        dest: Module,
        jstream: usize,
        src: Module,
        ostream: usize,
    },
    SetConsumer(Module),
    UnsetConsumer(Module),
    ForceReset(Module),
    Access {
        module: Module,
        access: AccessFn,
    },
    Suspend {
        module: Module,
        tick_stamp: u64,
    },
    Resume {
        module: Module,
        tick_stamp: u64,
    },
    FlowAccess {
        module: Module,
        tick_stamp: u64,
        access: Option<AccessFn>,
    },
    BoundaryAccess {
        module: Module,
        tick_stamp: u64,
        access: Option<AccessFn>,
    },
    BoundaryDiscard(Module),
    ProbeRequest {
        module: Module,
        probe: Option<ProbeJob>,
    },
    AddPoll {
        handle: PollHandle,
        poll: Option<PollFn>,
        fds: Vec<PollFd>,
    },
    RemovePoll(PollHandle),
    AddTimer(Option<TimerFn>),
    Sync(std::sync::Arc<SyncPoint>),
    Message(String),
    Nop,
}

/// A single engine operation, committed as part of a transaction
pub struct Job {
    pub(crate) kind: JobKind,
}

fn check_stream(module: &Module, kind: StreamKind, index: usize) -> EngineResult<()> {
    let count = match kind {
        StreamKind::Input => module.n_istreams(),
        StreamKind::Joint => module.n_jstreams(),
        StreamKind::Output => module.n_ostreams(),
    };
    if index < count {
        Ok(())
    } else {
        Err(EngineError::StreamOutOfRange {
            node: module.id(),
            kind,
            index,
            count,
        })
    }
}

fn check_stamp(stamp: u64) -> EngineResult<()> {
    if stamp == 0 || stamp == MAX_TICK_STAMP {
        Err(EngineError::InvalidTickStamp(stamp))
    } else {
        Ok(())
    }
}

fn check_real(module: &Module) -> EngineResult<()> {
    if module.is_virtual() {
        Err(EngineError::VirtualModule(module.id()))
    } else {
        Ok(())
    }
}

impl Job {
    fn from_kind(kind: JobKind) -> Self {
        Self { kind }
    }

    /// Add a module to the engine
    pub fn integrate(module: &Module) -> Self {
        Self::from_kind(JobKind::Integrate(module.clone()))
    }

    /// Remove a module from the engine and release its implementation
    pub fn discard(module: &Module) -> Self {
        Self::from_kind(JobKind::Discard(module.clone()))
    }

    /// Disconnect all inputs, including joint inputs
    pub fn kill_inputs(module: &Module) -> Self {
        Self::from_kind(JobKind::KillInputs(module.clone()))
    }

    /// Disconnect every consumer of the module's outputs
    pub fn kill_outputs(module: &Module) -> Self {
        Self::from_kind(JobKind::KillOutputs(module.clone()))
    }

    /// Connect `src` output `ostream` to `dest` input `istream`
    pub fn connect(src: &Module, ostream: usize, dest: &Module, istream: usize) -> EngineResult<Self> {
        check_stream(src, StreamKind::Output, ostream)?;
        check_stream(dest, StreamKind::Input, istream)?;
        Ok(Self::from_kind(JobKind::Connect {
            src: src.clone(),
            ostream,
            dest: dest.clone(),
            istream,
        }))
    }

    /// Add `src` output `ostream` to the joint input `jstream` of `dest`
    pub fn jconnect(src: &Module, ostream: usize, dest: &Module, jstream: usize) -> EngineResult<Self> {
        check_stream(src, StreamKind::Output, ostream)?;
        check_stream(dest, StreamKind::Joint, jstream)?;
        Ok(Self::from_kind(JobKind::JConnect {
            src: src.clone(),
            ostream,
            dest: dest.clone(),
            jstream,
        }))
    }

    pub fn disconnect(dest: &Module, istream: usize) -> EngineResult<Self> {
        check_stream(dest, StreamKind::Input, istream)?;
        Ok(Self::from_kind(JobKind::Disconnect {
            dest: dest.clone(),
            istream,
        }))
    }

    /// Remove one connection from a joint input; a missing connection is only warned about
    pub fn jdisconnect(dest: &Module, jstream: usize, src: &Module, ostream: usize) -> EngineResult<Self> {
        check_stream(dest, StreamKind::Joint, jstream)?;
        check_stream(src, StreamKind::Output, ostream)?;
        Ok(Self::from_kind(JobKind::JDisconnect {
            dest: dest.clone(),
            jstream,
            src: src.clone(),
            ostream,
        }))
    }

    pub fn set_consumer(module: &Module) -> Self {
        Self::from_kind(JobKind::SetConsumer(module.clone()))
    }

    pub fn unset_consumer(module: &Module) -> Self {
        Self::from_kind(JobKind::UnsetConsumer(module.clone()))
    }

    /// Reset the module before its next process call
    pub fn force_reset(module: &Module) -> Self {
        Self::from_kind(JobKind::ForceReset(module.clone()))
    }

    /// Run `access` against the implementation on the master thread
    pub fn access(module: &Module, access: impl FnMut(&mut dyn AudioModule) + Send + 'static) -> Self {
        Self::from_kind(JobKind::Access {
            module: module.clone(),
            access: Box::new(access),
        })
    }

    /// Typed variant of [`Job::access`]; does nothing if the implementation is not a `T`
    pub fn access_as<T: AudioModule + 'static>(
        module: &Module,
        mut access: impl FnMut(&mut T) + Send + 'static,
    ) -> Self {
        Self::access(module, move |m| {
            if let Some(t) = m.as_any_mut().downcast_mut::<T>() {
                access(t);
            }
        })
    }

    /// Suspend processing immediately, until resumed
    pub fn suspend_now(module: &Module) -> EngineResult<Self> {
        check_real(module)?;
        Ok(Self::from_kind(JobKind::Suspend {
            module: module.clone(),
            tick_stamp: MAX_TICK_STAMP,
        }))
    }

    /// Resume processing at `tick_stamp`
    pub fn resume_at(module: &Module, tick_stamp: u64) -> EngineResult<Self> {
        check_real(module)?;
        check_stamp(tick_stamp)?;
        Ok(Self::from_kind(JobKind::Resume {
            module: module.clone(),
            tick_stamp,
        }))
    }

    /// Run `access` from the process thread exactly when the module reaches `tick_stamp`
    pub fn flow_access(
        module: &Module,
        tick_stamp: u64,
        access: impl FnMut(&mut dyn AudioModule) + Send + 'static,
    ) -> EngineResult<Self> {
        check_real(module)?;
        check_stamp(tick_stamp)?;
        Ok(Self::from_kind(JobKind::FlowAccess {
            module: module.clone(),
            tick_stamp,
            access: Some(Box::new(access)),
        }))
    }

    /// Run `access` between blocks, before the block containing `tick_stamp`
    pub fn boundary_access(
        module: &Module,
        tick_stamp: u64,
        access: impl FnMut(&mut dyn AudioModule) + Send + 'static,
    ) -> EngineResult<Self> {
        check_real(module)?;
        check_stamp(tick_stamp)?;
        Ok(Self::from_kind(JobKind::BoundaryAccess {
            module: module.clone(),
            tick_stamp,
            access: Some(Box::new(access)),
        }))
    }

    /// Discard the module at the next block boundary
    pub fn boundary_discard(module: &Module) -> Self {
        Self::from_kind(JobKind::BoundaryDiscard(module.clone()))
    }

    /// Capture one block of the module's outputs
    pub fn probe_request(module: &Module, callback: impl FnOnce(ProbeData) + Send + 'static) -> Self {
        Self::from_kind(JobKind::ProbeRequest {
            module: module.clone(),
            probe: Some(ProbeJob::new(module.n_ostreams(), Box::new(callback))),
        })
    }

    /// Register a poll function watching `fds`
    pub fn add_poll(
        poll: impl FnMut(&mut PollRequest<'_>) -> bool + Send + 'static,
        fds: Vec<PollFd>,
    ) -> EngineResult<(Self, PollHandle)> {
        if fds.len() > MAX_POLLFDS {
            return Err(EngineError::PollTableFull {
                requested: fds.len(),
                max: MAX_POLLFDS,
            });
        }
        let handle = PollHandle::next();
        let job = Self::from_kind(JobKind::AddPoll {
            handle,
            poll: Some(Box::new(poll)),
            fds,
        });
        Ok((job, handle))
    }

    pub fn remove_poll(handle: PollHandle) -> Self {
        Self::from_kind(JobKind::RemovePoll(handle))
    }

    /// Call `timer` after each tick stamp advance until it returns false
    pub fn add_timer(timer: impl FnMut(u64) -> bool + Send + 'static) -> Self {
        Self::from_kind(JobKind::AddTimer(Some(Box::new(timer))))
    }

    pub(crate) fn sync(point: std::sync::Arc<SyncPoint>) -> Self {
        Self::from_kind(JobKind::Sync(point))
    }

    /// Log `text` from the master thread
    pub fn message(text: impl Into<String>) -> Self {
        Self::from_kind(JobKind::Message(text.into()))
    }

    pub fn nop() -> Self {
        Self::from_kind(JobKind::Nop)
    }

    /// Node addressed by this job, if any
    pub fn node_id(&self) -> Option<NodeId> {
        match &self.kind {
            JobKind::Integrate(m)
            | JobKind::Discard(m)
            | JobKind::KillInputs(m)
            | JobKind::KillOutputs(m)
            | JobKind::SetConsumer(m)
            | JobKind::UnsetConsumer(m)
            | JobKind::ForceReset(m)
            | JobKind::BoundaryDiscard(m) => Some(m.id()),
            JobKind::Connect { dest, .. }
            | JobKind::JConnect { dest, .. }
            | JobKind::Disconnect { dest, .. }
            | JobKind::JDisconnect { dest, .. } => Some(dest.id()),
            JobKind::Access { module, .. }
            | JobKind::Suspend { module, .. }
            | JobKind::Resume { module, .. }
            | JobKind::FlowAccess { module, .. }
            | JobKind::BoundaryAccess { module, .. }
            | JobKind::ProbeRequest { module, .. } => Some(module.id()),
            _ => None,
        }
    }
}

impl fmt::Display for Job {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.kind {
            JobKind::Integrate(m) => write!(f, "integrate({})", m.id()),
            JobKind::Discard(m) => write!(f, "discard({})", m.id()),
            JobKind::KillInputs(m) => write!(f, "kill_inputs({})", m.id()),
            JobKind::KillOutputs(m) => write!(f, "kill_outputs({})", m.id()),
            JobKind::Connect {
                src,
                ostream,
                dest,
                istream,
            } => write!(f, "connect({}:{} -> {}:{})", src.id(), ostream, dest.id(), istream),
            JobKind::JConnect {
                src,
                ostream,
                dest,
                jstream,
            } => write!(f, "jconnect({}:{} -> {}:j{})", src.id(), ostream, dest.id(), jstream),
            JobKind::Disconnect { dest, istream } => write!(f, "disconnect({}:{})", dest.id(), istream),
            JobKind::JDisconnect {
                dest,
                jstream,
                src,
                ostream,
            } => write!(f, "jdisconnect({}:{} -/- {}:j{})", src.id(), ostream, dest.id(), jstream),
            JobKind::SetConsumer(m) => write!(f, "set_consumer({})", m.id()),
            JobKind::UnsetConsumer(m) => write!(f, "unset_consumer({})", m.id()),
            JobKind::ForceReset(m) => write!(f, "force_reset({})", m.id()),
            JobKind::Access { module, .. } => write!(f, "access({})", module.id()),
            JobKind::Suspend { module, .. } => write!(f, "suspend({})", module.id()),
            JobKind::Resume { module, tick_stamp } => write!(f, "resume({}, {})", module.id(), tick_stamp),
            JobKind::FlowAccess { module, tick_stamp, .. } => {
                write!(f, "flow_access({}, {})", module.id(), tick_stamp)
            }
            JobKind::BoundaryAccess { module, tick_stamp, .. } => {
                write!(f, "boundary_access({}, {})", module.id(), tick_stamp)
            }
            JobKind::BoundaryDiscard(m) => write!(f, "boundary_discard({})", m.id()),
            JobKind::ProbeRequest { module, .. } => write!(f, "probe_request({})", module.id()),
            JobKind::AddPoll { fds, .. } => write!(f, "add_poll({} fds)", fds.len()),
            JobKind::RemovePoll(h) => write!(f, "remove_poll({:?})", h),
            JobKind::AddTimer(_) => f.write_str("add_timer"),
            JobKind::Sync(_) => f.write_str("sync"),
            JobKind::Message(text) => write!(f, "message({:?})", text),
            JobKind::Nop => f.write_str("nop"),
        }
    }
}

impl fmt::Debug for Job {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Job({})", self)
    }
}
