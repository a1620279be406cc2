use chrono::{DateTime, Utc};

/// Stable identifier for one managed server entry.
///
/// NOTE: The id outlives individual OS processes. A restart reuses the same
/// id with a fresh process handle.
#[derive(Debug, Clone, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub struct ServerId(pub String);

impl ServerId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }
}

impl Default for ServerId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ServerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Coarse lifecycle status of a supervised child process.
///
/// Transitions are monotonic per start attempt:
/// Stopped -> Starting -> Running -> Stopping -> Stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum ServerState {
    Stopped,
    Starting,
    Running,
    Stopping,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct ServerStatus {
    pub id: ServerId,
    pub state: ServerState,
    pub display_name: String,
    pub pid: Option<u32>,
    pub exit_code: Option<i32>,
    pub message: Option<String>,
}

/// Per-server automatic restart configuration.
///
/// `max_attempts_per_hour = -1` means unlimited. The window is sliding, not
/// a fixed per-hour bucket.
#[derive(Debug, Clone, Copy, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct RestartPolicy {
    pub enabled: bool,
    /// Restart even after a clean, user-initiated stop.
    pub force_keep_alive: bool,
    pub max_attempts_per_hour: i32,
    pub min_interval_secs: u64,
}

impl Default for RestartPolicy {
    fn default() -> Self {
        Self {
            enabled: false,
            force_keep_alive: false,
            max_attempts_per_hour: 3,
            min_interval_secs: 10,
        }
    }
}

impl RestartPolicy {
    pub fn unlimited_attempts(&self) -> bool {
        self.max_attempts_per_hour < 0
    }
}

/// Classification result for one line of child output.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub enum LogEventKind {
    ServerStarted,
    ServerStopping,
    GameRuleValue {
        name: String,
        value: String,
    },
    PlayerCount {
        online: u32,
        max: u32,
        names: Vec<String>,
    },
    EulaBlocked,
    /// Anything the rule table did not recognize, forwarded verbatim.
    Informational {
        raw: String,
    },
}

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct LogEvent {
    pub kind: LogEventKind,
    pub at: DateTime<Utc>,
    pub source: ServerId,
}

impl LogEvent {
    pub fn now(source: ServerId, kind: LogEventKind) -> Self {
        Self {
            kind,
            at: Utc::now(),
            source,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn server_id_is_non_empty() {
        let id = ServerId::new();
        assert!(!id.0.is_empty());
    }

    #[test]
    fn default_policy_is_disabled_and_bounded() {
        let p = RestartPolicy::default();
        assert!(!p.enabled);
        assert!(!p.force_keep_alive);
        assert!(!p.unlimited_attempts());
    }

    #[test]
    fn negative_cap_means_unlimited() {
        let p = RestartPolicy {
            max_attempts_per_hour: -1,
            ..RestartPolicy::default()
        };
        assert!(p.unlimited_attempts());
    }
}
