use thiserror::Error;

#[derive(Error, Debug)]
pub enum AgentboxError {
    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("TOML parse error: {0}")]
    TomlParse(String),

    // Validation errors (rejected at the API boundary)
    #[error("Unexpected worker command: '{command}'")]
    UnexpectedCommand { command: String },

    #[error("Worker binary resolves outside the install directory: {path}")]
    BinaryOutsideInstallDir { path: String },

    #[error("Path escapes its base directory: {path}")]
    PathTraversal { path: String },

    #[error("Invalid mount request: {reason}")]
    InvalidMount { reason: String },

    // Process lifecycle errors
    #[error("A process with id '{id}' is already running")]
    ProcessAlreadyLive { id: String },

    #[error("Failed to spawn worker: {0}")]
    Spawn(String),

    // Session / mount errors
    #[error("Mount '{name}' already exists for this session")]
    MountExists { name: String },

    #[error("Worker binary not installed: {path}")]
    WorkerNotInstalled { path: String },

    // Sandbox errors
    #[error("Sandbox helper unavailable: {0}")]
    SandboxUnavailable(String),

    // IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    // Serialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Base64 decode error: {0}")]
    Base64(#[from] base64::DecodeError),

    // Generic wrapper
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl AgentboxError {
    /// Validation errors are rejected synchronously at the API boundary and
    /// never tear down more than the one request involved.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            Self::UnexpectedCommand { .. }
                | Self::BinaryOutsideInstallDir { .. }
                | Self::PathTraversal { .. }
                | Self::InvalidMount { .. }
                | Self::ProcessAlreadyLive { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, AgentboxError>;
