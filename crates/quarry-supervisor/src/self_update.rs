//! Self-update pipeline: check, drain, download, verify, replace, relaunch.
//!
//! A failed attempt at any stage leaves the currently installed artifact
//! fully intact. The superseded artifact is never deleted by the running
//! instance; its path is recorded as pending deletion and removed on the
//! next startup.

use std::{
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
    time::Duration,
};

use futures_util::StreamExt;
use sha2::{Digest, Sha256};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use crate::{
    download_progress::ProgressHandle,
    error::{Result, SupervisorError},
    prefs::{PrefStore, keys},
    server_manager::{ServerManager, stop_wait_timeout},
    support::{env_u64, now_unix_ms},
    update_manifest::{self, UpdateManifest},
};

fn relaunch_exit_delay() -> Duration {
    Duration::from_millis(
        env_u64("QUARRY_RELAUNCH_EXIT_DELAY_MS")
            .map(|v| v.clamp(0, 30_000))
            .unwrap_or(1500),
    )
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdatePhase {
    Idle,
    CheckingManifest,
    UpToDate,
    UpdateAvailable,
    Downloading,
    Verifying,
    Replacing,
    AwaitingRelaunchConfirmation,
    Relaunching,
}

#[derive(Debug, Clone, PartialEq)]
pub enum UpdateCheck {
    UpToDate,
    UpdateAvailable(UpdateManifest),
}

pub struct SelfUpdater {
    client: reqwest::Client,
    manifest_url: String,
    running_version: String,
    artifact_path: PathBuf,
    manager: ServerManager,
    prefs: Arc<dyn PrefStore>,
    progress: ProgressHandle,
    phase: Mutex<UpdatePhase>,
}

impl SelfUpdater {
    pub fn new(
        manifest_url: String,
        running_version: String,
        artifact_path: PathBuf,
        manager: ServerManager,
        prefs: Arc<dyn PrefStore>,
    ) -> Self {
        Self {
            client: reqwest::Client::new(),
            manifest_url,
            running_version,
            artifact_path,
            manager,
            prefs,
            progress: ProgressHandle::default(),
            phase: Mutex::new(UpdatePhase::Idle),
        }
    }

    pub fn phase(&self) -> UpdatePhase {
        *self.phase.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn set_phase(&self, phase: UpdatePhase) {
        *self.phase.lock().unwrap_or_else(|e| e.into_inner()) = phase;
    }

    /// Progress of the current (or most recent) download, for UI polling.
    pub fn progress(&self) -> ProgressHandle {
        self.progress.clone()
    }

    /// Fetch the manifest and compare versions.
    ///
    /// Background checks (`interactive = false`) swallow network failures:
    /// the endpoint being unreachable is logged and reported as up to date.
    /// Explicit user-initiated checks surface the failure.
    pub async fn check_for_updates(&self, interactive: bool) -> Result<UpdateCheck> {
        self.set_phase(UpdatePhase::CheckingManifest);

        let manifest = match update_manifest::fetch_manifest(&self.client, &self.manifest_url).await
        {
            Ok(m) => m,
            Err(err) => {
                self.set_phase(UpdatePhase::Idle);
                if interactive {
                    return Err(err);
                }
                tracing::warn!(error = %err, "background update check failed");
                return Ok(UpdateCheck::UpToDate);
            }
        };

        self.prefs
            .set(keys::LAST_UPDATE_CHECK_UNIX_MS, &now_unix_ms().to_string());

        if manifest.differs_from(&self.running_version) {
            self.set_phase(UpdatePhase::UpdateAvailable);
            Ok(UpdateCheck::UpdateAvailable(manifest))
        } else {
            self.set_phase(UpdatePhase::UpToDate);
            Ok(UpdateCheck::UpToDate)
        }
    }

    /// Download, verify, and install the manifest's artifact. Returns the
    /// installed path, leaving the pipeline awaiting relaunch confirmation.
    ///
    /// With servers still active the attempt is refused unless the caller
    /// passed `drain_running = true` (explicit user consent); the pipeline
    /// never kills a child as a side effect. Mandatory updates only change
    /// what choices the host offers the user, not the gate here.
    pub async fn apply(&self, manifest: &UpdateManifest, drain_running: bool) -> Result<PathBuf> {
        if !self.manager.active_ids().await.is_empty() {
            if !drain_running {
                self.set_phase(UpdatePhase::Idle);
                return Err(SupervisorError::UpdateRefused);
            }
            self.manager.drain_all(stop_wait_timeout()).await?;
        }

        // All validation happens before the first network byte. Any failure
        // from here on returns the pipeline to Idle.
        let (url, tmp_path, final_path) = match self.resolve_install_paths(manifest).await {
            Ok(v) => v,
            Err(err) => {
                self.set_phase(UpdatePhase::Idle);
                return Err(err);
            }
        };

        self.set_phase(UpdatePhase::Downloading);
        if let Err(err) = self.download_to(url, &tmp_path).await {
            let _ = tokio::fs::remove_file(&tmp_path).await;
            self.set_phase(UpdatePhase::Idle);
            return Err(err);
        }

        self.set_phase(UpdatePhase::Verifying);
        let verified = match file_sha256_hex(&tmp_path).await {
            Ok(actual) if actual.eq_ignore_ascii_case(&manifest.sha256) => Ok(()),
            Ok(actual) => Err(SupervisorError::Integrity {
                expected: manifest.sha256.clone(),
                actual,
            }),
            Err(err) => Err(err.into()),
        };
        if let Err(err) = verified {
            let _ = tokio::fs::remove_file(&tmp_path).await;
            self.set_phase(UpdatePhase::Idle);
            return Err(err);
        }

        // Same-directory rename: no partial-file window on the final name.
        self.set_phase(UpdatePhase::Replacing);
        if let Err(err) = tokio::fs::rename(&tmp_path, &final_path).await {
            let _ = tokio::fs::remove_file(&tmp_path).await;
            self.set_phase(UpdatePhase::Idle);
            return Err(err.into());
        }

        if final_path != self.artifact_path {
            // The old artifact may still be locked by this running instance.
            self.prefs.set(
                keys::PENDING_DELETE_PATH,
                &self.artifact_path.display().to_string(),
            );
        }

        tracing::info!(
            version = %manifest.version,
            path = %final_path.display(),
            "update installed"
        );
        self.set_phase(UpdatePhase::AwaitingRelaunchConfirmation);
        Ok(final_path)
    }

    /// Validate the manifest's transfer scheme, file name, and digest
    /// shape, and resolve the in-directory temp and final install paths.
    async fn resolve_install_paths(
        &self,
        manifest: &UpdateManifest,
    ) -> Result<(reqwest::Url, PathBuf, PathBuf)> {
        let url = update_manifest::validate_http_url(&manifest.download_url)?;
        let file_name = update_manifest::artifact_file_name(&url)?;
        if !manifest.digest_is_well_formed() {
            return Err(SupervisorError::Integrity {
                expected: manifest.sha256.clone(),
                actual: "manifest digest is not 64 hex characters".to_string(),
            });
        }

        let target_dir = self.artifact_path.parent().ok_or_else(|| {
            SupervisorError::PathSecurity("artifact path has no parent directory".to_string())
        })?;
        let target_dir = tokio::fs::canonicalize(target_dir).await?;
        let final_path = target_dir.join(&file_name);
        if !final_path.starts_with(&target_dir) {
            return Err(SupervisorError::PathSecurity(format!(
                "resolved path escapes the install directory: {}",
                final_path.display()
            )));
        }
        let tmp_path = target_dir.join(format!("{file_name}.download"));
        Ok((url, tmp_path, final_path))
    }

    async fn download_to(&self, url: reqwest::Url, tmp_path: &Path) -> Result<()> {
        let resp = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| SupervisorError::Network(e.to_string()))?
            .error_for_status()
            .map_err(|e| SupervisorError::Network(e.to_string()))?;

        self.progress.begin(resp.content_length());

        let mut file = tokio::fs::File::create(tmp_path).await?;
        let mut stream = resp.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| SupervisorError::Network(e.to_string()))?;
            file.write_all(&chunk).await?;
            self.progress.record(chunk.len() as u64);
        }
        file.flush().await?;
        drop(file);

        self.progress.finish();
        Ok(())
    }

    /// Launch the installed artifact as an independent OS process, then
    /// schedule this process's exit after a short grace delay so the
    /// replacement comes up cleanly.
    pub async fn relaunch(&self, new_artifact: &Path) -> Result<()> {
        let target_dir = self.artifact_path.parent().ok_or_else(|| {
            SupervisorError::PathSecurity("artifact path has no parent directory".to_string())
        })?;
        let target_dir = tokio::fs::canonicalize(target_dir).await?;
        let resolved = tokio::fs::canonicalize(new_artifact).await?;
        if !resolved.starts_with(&target_dir) {
            return Err(SupervisorError::PathSecurity(format!(
                "relaunch target is outside the install directory: {}",
                resolved.display()
            )));
        }

        self.set_phase(UpdatePhase::Relaunching);
        let mut cmd = tokio::process::Command::new(&resolved);
        cmd.current_dir(&target_dir);
        // Not kill-on-drop: the replacement must outlive this process.
        let child = cmd.spawn().map_err(|err| SupervisorError::Spawn {
            path: resolved.clone(),
            source: err,
        })?;
        drop(child);

        let delay = relaunch_exit_delay();
        tracing::info!(
            path = %resolved.display(),
            delay_ms = delay.as_millis() as u64,
            "replacement launched; scheduling host exit"
        );
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            std::process::exit(0);
        });
        Ok(())
    }
}

/// Remove the artifact a previous instance left behind, if any. Called
/// once at startup, before any update work.
pub fn purge_pending_delete(prefs: &dyn PrefStore) {
    let Some(path) = prefs.get(keys::PENDING_DELETE_PATH) else {
        return;
    };
    match std::fs::remove_file(&path) {
        Ok(()) => {
            tracing::info!(%path, "removed superseded artifact");
            prefs.remove(keys::PENDING_DELETE_PATH);
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            prefs.remove(keys::PENDING_DELETE_PATH);
        }
        Err(e) => {
            // Keep the key so the next startup retries.
            tracing::warn!(%path, error = %e, "could not remove superseded artifact");
        }
    }
}

pub fn skip_prompt(prefs: &dyn PrefStore) -> bool {
    prefs
        .get(keys::SKIP_UPDATE_PROMPT)
        .and_then(|v| v.parse::<bool>().ok())
        .unwrap_or(false)
}

async fn file_sha256_hex(path: &Path) -> std::io::Result<String> {
    let mut file = tokio::fs::File::open(path).await?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; 64 * 1024];
    loop {
        let n = file.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}
