//! sigflow-engine: Realtime synthesis engine scheduler and runtime
//!
//! Pieces:
//! - Module graph with transactional, thread-safe mutation
//! - Leaf-level schedule with feedback cycle groups and virtual modules
//! - Multi-threaded block processing (master plus slave threads)
//! - Sample-accurate flow jobs, boundary jobs, suspension and resumption
//! - Probes, timers and poll functions driving the master event loop
//!
//! # Example
//!
//! ```no_run
//! use sigflow_engine::{Engine, EngineConfig, Job};
//!
//! let engine = Engine::new_synchronous(EngineConfig::default())?;
//! engine.transact([Job::message("hello")]);
//! engine.render(4)?;
//! engine.collect();
//! # Ok::<(), sigflow_engine::EngineError>(())
//! ```

mod config;
mod const_values;
mod engine;
#[cfg(unix)]
mod event_loop;
mod graph;
mod job;
mod master;
mod module;
mod node;
mod pqueue;
mod process;
mod queue;
mod schedule;
mod slave;
mod suspend;
mod transaction;

pub use config::EngineConfig;
pub use engine::Engine;
pub use job::{AccessFn, Job, PollFd, PollFn, PollHandle, PollRequest, ProbeData, ProbeFn, ProbeStream, TimerFn};
pub use module::{AudioModule, ModuleClass, ModuleFlags, ProcessContext};
pub use node::Module;
pub use transaction::Transaction;

pub use sigflow_core::{
    BlockConfig, EngineError, EngineResult, MAX_BLOCK_SIZE, MAX_POLLFDS, MAX_TICK_STAMP, NodeId, Sample,
    StreamKind, constrain, system_time_us,
};
