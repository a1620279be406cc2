use std::path::PathBuf;

/// Core error taxonomy.
///
/// Per-line decode problems and restart-budget exhaustion are deliberately
/// absent: the former is recovered in the scan loop, the latter is a policy
/// outcome reported through `RestartDecision`.
#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    #[error("server is already starting or running")]
    AlreadyActive,

    #[error("unknown server id: {0}")]
    UnknownServer(String),

    #[error("failed to spawn {}: {source}", path.display())]
    Spawn {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("artifact digest mismatch: expected {expected}, got {actual}")]
    Integrity { expected: String, actual: String },

    #[error("unsafe update location: {0}")]
    PathSecurity(String),

    #[error("network unavailable: {0}")]
    Network(String),

    #[error("servers still active after {waited_ms}ms drain window")]
    DrainTimeout { waited_ms: u64 },

    #[error("update refused: servers are still running")]
    UpdateRefused,

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, SupervisorError>;
