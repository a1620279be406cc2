//! Key-value preference port.
//!
//! The graphical shell owns presentation of settings; the core reads and
//! writes a handful of durable keys through this port. The bundled JSON
//! store persists atomically (temp file + same-directory rename).

use std::{
    collections::BTreeMap,
    fs, io,
    path::PathBuf,
    sync::{Arc, Mutex},
};

use quarry_process::{RestartPolicy, ServerId};

pub mod keys {
    pub const LAST_ARTIFACT_PATH: &str = "last_artifact_path";
    pub const PENDING_DELETE_PATH: &str = "update.pending_delete_path";
    pub const LAST_UPDATE_CHECK_UNIX_MS: &str = "update.last_check_unix_ms";
    pub const SKIP_UPDATE_PROMPT: &str = "update.skip_prompt";
}

pub trait PrefStore: Send + Sync {
    fn get(&self, key: &str) -> Option<String>;
    fn set(&self, key: &str, value: &str);
    fn remove(&self, key: &str);
}

/// File-backed store. Every mutation is persisted immediately; persistence
/// failures are logged and do not fail the caller.
pub struct JsonPrefStore {
    path: PathBuf,
    map: Mutex<BTreeMap<String, String>>,
}

impl JsonPrefStore {
    pub fn open(path: PathBuf) -> io::Result<Self> {
        let map = match fs::read(&path) {
            Ok(bytes) => serde_json::from_slice(&bytes).unwrap_or_default(),
            Err(e) if e.kind() == io::ErrorKind::NotFound => BTreeMap::new(),
            Err(e) => return Err(e),
        };
        Ok(Self {
            path,
            map: Mutex::new(map),
        })
    }

    fn save_locked(&self, map: &BTreeMap<String, String>) {
        let Ok(json) = serde_json::to_vec_pretty(map) else {
            return;
        };
        if let Some(parent) = self.path.parent()
            && let Err(err) = fs::create_dir_all(parent)
        {
            tracing::warn!(error = %err, "could not create preference directory");
            return;
        }

        let tmp = self.path.with_extension("json.tmp");
        if let Err(err) = fs::write(&tmp, json) {
            tracing::warn!(error = %err, "could not write preferences");
            let _ = fs::remove_file(&tmp);
            return;
        }
        if let Err(err) = fs::rename(&tmp, &self.path) {
            tracing::warn!(error = %err, "could not persist preferences");
            let _ = fs::remove_file(&tmp);
        }
    }
}

impl PrefStore for JsonPrefStore {
    fn get(&self, key: &str) -> Option<String> {
        let map = self.map.lock().unwrap_or_else(|e| e.into_inner());
        map.get(key).cloned()
    }

    fn set(&self, key: &str, value: &str) {
        let mut map = self.map.lock().unwrap_or_else(|e| e.into_inner());
        map.insert(key.to_string(), value.to_string());
        self.save_locked(&map);
    }

    fn remove(&self, key: &str) {
        let mut map = self.map.lock().unwrap_or_else(|e| e.into_inner());
        if map.remove(key).is_some() {
            self.save_locked(&map);
        }
    }
}

/// In-memory store for tests and ephemeral hosts.
#[derive(Default)]
pub struct MemoryPrefStore {
    map: Mutex<BTreeMap<String, String>>,
}

impl MemoryPrefStore {
    pub fn shared() -> Arc<Self> {
        Arc::new(Self::default())
    }
}

impl PrefStore for MemoryPrefStore {
    fn get(&self, key: &str) -> Option<String> {
        let map = self.map.lock().unwrap_or_else(|e| e.into_inner());
        map.get(key).cloned()
    }

    fn set(&self, key: &str, value: &str) {
        let mut map = self.map.lock().unwrap_or_else(|e| e.into_inner());
        map.insert(key.to_string(), value.to_string());
    }

    fn remove(&self, key: &str) {
        let mut map = self.map.lock().unwrap_or_else(|e| e.into_inner());
        map.remove(key);
    }
}

fn restart_key(id: &ServerId, field: &str) -> String {
    format!("restart.{}.{}", id.0, field)
}

pub fn load_restart_policy(store: &dyn PrefStore, id: &ServerId) -> RestartPolicy {
    let defaults = RestartPolicy::default();
    let get_bool = |field: &str, fallback: bool| {
        store
            .get(&restart_key(id, field))
            .and_then(|v| v.parse::<bool>().ok())
            .unwrap_or(fallback)
    };

    RestartPolicy {
        enabled: get_bool("enabled", defaults.enabled),
        force_keep_alive: get_bool("force_keep_alive", defaults.force_keep_alive),
        max_attempts_per_hour: store
            .get(&restart_key(id, "max_attempts"))
            .and_then(|v| v.parse::<i32>().ok())
            .unwrap_or(defaults.max_attempts_per_hour),
        min_interval_secs: store
            .get(&restart_key(id, "interval_secs"))
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(defaults.min_interval_secs),
    }
}

pub fn save_restart_policy(store: &dyn PrefStore, id: &ServerId, policy: &RestartPolicy) {
    store.set(&restart_key(id, "enabled"), &policy.enabled.to_string());
    store.set(
        &restart_key(id, "force_keep_alive"),
        &policy.force_keep_alive.to_string(),
    );
    store.set(
        &restart_key(id, "max_attempts"),
        &policy.max_attempts_per_hour.to_string(),
    );
    store.set(
        &restart_key(id, "interval_secs"),
        &policy.min_interval_secs.to_string(),
    );
}
