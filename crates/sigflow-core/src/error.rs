//! Error types for the sigflow engine

use std::fmt;

use thiserror::Error;

use crate::NodeId;

/// Stream category, used in diagnostics
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    Input,
    Joint,
    Output,
}

impl fmt::Display for StreamKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            StreamKind::Input => "input",
            StreamKind::Joint => "joint input",
            StreamKind::Output => "output",
        })
    }
}

/// Core error type
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("{0} is not integrated")]
    NotIntegrated(NodeId),

    #[error("{0} is already integrated")]
    AlreadyIntegrated(NodeId),

    #[error("{0} has been discarded")]
    Discarded(NodeId),

    #[error("{node}: {kind} stream {index} out of range (module has {count})")]
    StreamOutOfRange {
        node: NodeId,
        kind: StreamKind,
        index: usize,
        count: usize,
    },

    #[error("{node}: input stream {istream} is already connected")]
    InputConnected { node: NodeId, istream: usize },

    #[error("{node}: input stream {istream} is not connected")]
    InputNotConnected { node: NodeId, istream: usize },

    #[error("{0}: not permitted on a virtual module")]
    VirtualModule(NodeId),

    #[error("tick stamp {0} out of range")]
    InvalidTickStamp(u64),

    #[error("delay cycle processing not yet implemented")]
    DeferredProcessing,

    #[error("adding poll function exceeds maximum number of poll fds ({requested} > {max})")]
    PollTableFull { requested: usize, max: usize },

    #[error("cycle without delay module: {0:?}")]
    CycleWithoutDelay(Vec<NodeId>),

    #[error("reconfiguration refused: {0}")]
    ConfigureRefused(&'static str),

    #[error("operation requires a master thread")]
    NotThreaded,

    #[error("{0} would block the master thread")]
    OnMasterThread(&'static str),

    #[error("engine is shut down")]
    Shutdown,

    #[error("Invalid parameter: {0}")]
    InvalidParam(String),

    #[error("failed to spawn thread {name}: {source}")]
    ThreadSpawn {
        name: String,
        #[source]
        source: std::io::Error,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias
pub type EngineResult<T> = Result<T, EngineError>;
