//! sigflow-core: Shared types for the sigflow engine
//!
//! Foundational pieces used by the engine crate:
//! - Sample type and engine-wide limits
//! - Error taxonomy
//! - Tick stamp time base with wakeups
//! - Block size / control raster constraint math

mod constrain;
mod error;
mod sample;
mod tick;

pub use constrain::*;
pub use error::*;
pub use sample::*;
pub use tick::*;

use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};

/// Unique identifier of an engine node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub u32);

impl NodeId {
    /// Allocate a process-wide unique id
    pub fn next() -> Self {
        static NEXT_ID: AtomicU32 = AtomicU32::new(1);
        Self(NEXT_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "node#{}", self.0)
    }
}
