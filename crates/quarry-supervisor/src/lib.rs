//! Supervision core for locally managed game servers.
//!
//! Owns child-process lifecycles, classifies their output into typed
//! events, enforces per-server automatic-restart policy, and can replace
//! its own executable artifact with a verified newer build after draining
//! every running child. The graphical shell is an external collaborator:
//! it calls into [`ServerManager`] and [`SelfUpdater`], renders what the
//! [`sink::EventSink`] captures, and persists small settings through the
//! [`prefs::PrefStore`] port.

pub mod classifier;
pub mod download_progress;
pub mod error;
pub mod eula;
pub mod net_probe;
pub mod prefs;
pub mod restart_guard;
pub mod self_update;
pub mod server_manager;
pub mod sink;
mod support;
pub mod update_manifest;

pub use error::{Result, SupervisorError};
pub use quarry_process::{
    LogEvent, LogEventKind, RestartPolicy, ServerId, ServerState, ServerStatus,
};
pub use self_update::{SelfUpdater, UpdateCheck, UpdatePhase};
pub use server_manager::{ServerManager, ServerSpec};
pub use update_manifest::UpdateManifest;
