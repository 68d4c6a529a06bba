use thiserror::Error;

pub type Result<T> = std::result::Result<T, EngineError>;

/// The three error kinds the scheduler must distinguish, plus the ambient
/// failure modes a production crate surfaces regardless of those (config
/// parsing, a wedged worker past its deadline, a dropped channel).
#[derive(Error, Debug)]
pub enum EngineError {
    /// A Thunk's function raised on a worker. Carries the worker's captured
    /// message; the scheduler rethrows this on the master and aborts the run.
    #[error("computation failed on worker {worker}: {message}")]
    Computation { worker: String, message: String },

    /// RPC delivery to or from a worker failed at the transport layer.
    #[error("transport error talking to worker {worker}: {message}")]
    Transport { worker: String, message: String },

    /// An invariant the scheduler assumes was violated: a cycle, a missing
    /// cache entry when a task fires, or a double-fire of the same Thunk.
    /// These are bugs, not recoverable conditions.
    #[error("structural invariant violated: {0}")]
    StructuralViolation(String),

    /// A dispatched task did not complete within its configured deadline.
    #[error("thunk {thunk_id} on worker {worker} timed out after {millis}ms")]
    Timeout {
        thunk_id: u64,
        worker: String,
        millis: u64,
    },

    /// The completion channel was closed while the scheduler still expected
    /// replies (the worker pool was dropped out from under a running graph).
    #[error("completion channel closed with {outstanding} task(s) still outstanding")]
    ChannelClosed { outstanding: usize },

    /// A background dispatch task panicked instead of returning a result.
    #[error("worker task for thunk {thunk_id} panicked: {message}")]
    WorkerPanicked { thunk_id: u64, message: String },

    #[error("invalid engine configuration: {0}")]
    Config(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] Box<bincode::ErrorKind>),

    #[error("config file error: {0}")]
    ConfigParse(#[from] toml::de::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl EngineError {
    pub fn config<E: std::fmt::Display>(e: E) -> Self {
        Self::Config(e.to_string())
    }

    pub fn structural<E: std::fmt::Display>(e: E) -> Self {
        Self::StructuralViolation(e.to_string())
    }

    /// Which of the three §7 kinds this error belongs to, for callers that
    /// want to branch on it (e.g. deciding whether to log at error vs warn).
    pub fn kind(&self) -> FailureKind {
        match self {
            EngineError::Computation { .. } => FailureKind::Computation,
            EngineError::Transport { .. } | EngineError::ChannelClosed { .. } => {
                FailureKind::Transport
            }
            EngineError::StructuralViolation(_) | EngineError::WorkerPanicked { .. } => {
                FailureKind::Structural
            }
            _ => FailureKind::Structural,
        }
    }
}

/// The three error kinds from the error-handling design: a computation
/// raised, the transport failed, or an internal invariant was violated.
/// Unlike the teacher's `ErrorCategory` (which drives retry/backoff), this
/// has no bearing on retry — task-level retry is an explicit Non-goal here.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    Computation,
    Transport,
    Structural,
}
