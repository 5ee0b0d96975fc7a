use crate::command::CommandError;

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    #[error("already exists: {0}")]
    Exists(String),

    #[error("precondition failed: {0}")]
    Precondition(String),

    #[error("container not running: {0}")]
    NotRunning(String),

    #[error("kernel refused: {0}")]
    Kernel(String),

    #[error("registry error: {0}")]
    Registry(String),

    #[error(transparent)]
    Command(#[from] CommandError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl EngineError {
    pub fn not_found(kind: &'static str, id: impl Into<String>) -> Self {
        Self::NotFound {
            kind,
            id: id.into(),
        }
    }

    /// Process exit code for this error category.
    ///
    /// The payload's own exit status is never mapped here; only engine-level
    /// failures reach the caller as a non-zero code.
    pub fn exit_code(&self) -> u8 {
        match self {
            Self::NotFound { .. } => 2,
            Self::Exists(_) => 3,
            Self::Precondition(_) => 4,
            Self::NotRunning(_) => 5,
            Self::Kernel(_) | Self::Command(_) => 6,
            Self::Registry(_) => 7,
            Self::Io(_) => 1,
        }
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;
