//! Process supervision for user-registered server artifacts.
//!
//! One entry per managed server. Each start attempt wires the child's
//! merged stdout/stderr into the output classifier, spawns a ~1 Hz monitor
//! task that is the sole writer of death-detected state transitions, and
//! consults the restart guard on every confirmed termination.

use std::{
    collections::HashMap,
    path::PathBuf,
    sync::Arc,
    time::{Duration, Instant},
};

use quarry_process::{LogEvent, LogEventKind, ServerId, ServerState, ServerStatus};
use tokio::{
    io::AsyncWriteExt,
    process::{Child, ChildStdin, Command},
    sync::{Mutex, mpsc},
};

use crate::{
    classifier,
    error::{Result, SupervisorError},
    prefs::{self, PrefStore, keys},
    restart_guard::{RestartDecision, RestartGuard, Termination},
    sink::EventSink,
    support::env_u64,
};

use quarry_process::RestartPolicy;

fn health_poll_interval() -> Duration {
    Duration::from_millis(
        env_u64("QUARRY_HEALTH_POLL_MS")
            .map(|v| v.clamp(100, 10_000))
            .unwrap_or(1000),
    )
}

fn restart_cooldown() -> Duration {
    Duration::from_millis(
        env_u64("QUARRY_RESTART_COOLDOWN_MS")
            .map(|v| v.clamp(0, 60_000))
            .unwrap_or(3000),
    )
}

pub(crate) fn stop_wait_timeout() -> Duration {
    Duration::from_millis(
        env_u64("QUARRY_STOP_WAIT_MS")
            .map(|v| v.clamp(1000, 300_000))
            .unwrap_or(30_000),
    )
}

/// How one managed server is launched: `<launcher> <artifact>` with the
/// artifact's directory as working directory, stderr merged into the
/// classifier stream.
#[derive(Debug, Clone)]
pub struct ServerSpec {
    pub launcher: PathBuf,
    pub artifact: PathBuf,
    pub display_name: Option<String>,
    /// Written to stdin on cooperative stop before the pipe is closed, so
    /// the child runs its own save/shutdown routine.
    pub stop_command: String,
}

impl ServerSpec {
    pub fn new(launcher: PathBuf, artifact: PathBuf) -> Self {
        Self {
            launcher,
            artifact,
            display_name: None,
            stop_command: "stop".to_string(),
        }
    }
}

struct ServerEntry {
    spec: ServerSpec,
    state: ServerState,
    pid: Option<u32>,
    exit_code: Option<i32>,
    message: Option<String>,
    child: Option<Child>,
    stdin: Option<ChildStdin>,
    policy: RestartPolicy,
    guard: RestartGuard,
    // Bumped on every start attempt; stale monitor tasks exit when it moves.
    epoch: u64,
}

impl ServerEntry {
    fn status(&self, id: &ServerId) -> ServerStatus {
        let display_name = self.spec.display_name.clone().unwrap_or_else(|| {
            self.spec
                .artifact
                .file_stem()
                .map(|s| s.to_string_lossy().into_owned())
                .unwrap_or_else(|| id.0.clone())
        });
        ServerStatus {
            id: id.clone(),
            state: self.state,
            display_name,
            pid: self.pid,
            exit_code: self.exit_code,
            message: self.message.clone(),
        }
    }
}

#[derive(Clone)]
pub struct ServerManager {
    inner: Arc<Mutex<HashMap<ServerId, ServerEntry>>>,
    sink: Arc<dyn EventSink>,
    prefs: Arc<dyn PrefStore>,
}

impl ServerManager {
    pub fn new(sink: Arc<dyn EventSink>, prefs: Arc<dyn PrefStore>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(HashMap::new())),
            sink,
            prefs,
        }
    }

    /// Register an artifact under a fresh id. The entry persists across
    /// process restarts and is only destroyed by [`remove`](Self::remove).
    pub async fn register(&self, spec: ServerSpec) -> ServerId {
        let id = ServerId::new();
        self.register_with_id(id.clone(), spec).await;
        id
    }

    /// Register under a caller-chosen stable id, so per-server preferences
    /// (restart policy) survive host restarts.
    pub async fn register_with_id(&self, id: ServerId, spec: ServerSpec) {
        self.prefs.set(
            keys::LAST_ARTIFACT_PATH,
            &spec.artifact.display().to_string(),
        );
        let policy = prefs::load_restart_policy(self.prefs.as_ref(), &id);

        let mut inner = self.inner.lock().await;
        inner.insert(
            id,
            ServerEntry {
                spec,
                state: ServerState::Stopped,
                pid: None,
                exit_code: None,
                message: None,
                child: None,
                stdin: None,
                policy,
                guard: RestartGuard::default(),
                epoch: 0,
            },
        );
    }

    /// Remove a server from the managed set. Refused while the entry still
    /// has a live process.
    pub async fn remove(&self, id: &ServerId) -> Result<()> {
        let mut inner = self.inner.lock().await;
        let e = inner
            .get(id)
            .ok_or_else(|| SupervisorError::UnknownServer(id.0.clone()))?;
        if e.state != ServerState::Stopped {
            return Err(SupervisorError::AlreadyActive);
        }
        inner.remove(id);
        Ok(())
    }

    pub async fn set_restart_policy(&self, id: &ServerId, policy: RestartPolicy) -> Result<()> {
        let mut inner = self.inner.lock().await;
        let e = inner
            .get_mut(id)
            .ok_or_else(|| SupervisorError::UnknownServer(id.0.clone()))?;
        e.policy = policy;
        prefs::save_restart_policy(self.prefs.as_ref(), id, &policy);
        Ok(())
    }

    pub async fn set_display_name(&self, id: &ServerId, name: Option<String>) -> Result<()> {
        let mut inner = self.inner.lock().await;
        let e = inner
            .get_mut(id)
            .ok_or_else(|| SupervisorError::UnknownServer(id.0.clone()))?;
        e.spec.display_name = name;
        Ok(())
    }

    pub async fn start(&self, id: &ServerId) -> Result<ServerStatus> {
        let (spec, epoch) = {
            let mut inner = self.inner.lock().await;
            let e = inner
                .get_mut(id)
                .ok_or_else(|| SupervisorError::UnknownServer(id.0.clone()))?;
            if e.state != ServerState::Stopped {
                return Err(SupervisorError::AlreadyActive);
            }
            e.state = ServerState::Starting;
            e.message = Some("starting...".to_string());
            e.exit_code = None;
            e.epoch += 1;
            (e.spec.clone(), e.epoch)
        };

        self.emit_info(
            id,
            format!("[quarry] start requested: {}", spec.artifact.display()),
        );

        let cwd = match spec.artifact.parent() {
            Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
            _ => std::env::current_dir()?,
        };

        let mut cmd = Command::new(&spec.launcher);
        cmd.arg(&spec.artifact)
            .current_dir(&cwd)
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped());

        let mut child = match cmd.spawn() {
            Ok(c) => c,
            Err(err) => {
                // Recovered locally: the entry returns to Stopped and the
                // host stays up.
                {
                    let mut inner = self.inner.lock().await;
                    if let Some(e) = inner.get_mut(id) {
                        e.state = ServerState::Stopped;
                        e.message = Some(format!("spawn failed: {err}"));
                    }
                }
                self.emit_info(id, format!("[quarry] spawn failed: {err}"));
                return Err(SupervisorError::Spawn {
                    path: spec.launcher,
                    source: err,
                });
            }
        };

        let pid = child.id();
        let stdin = child.stdin.take();
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();

        // Merged output stream: both pipes feed one line channel, and a
        // single consumer below is the only appender to this server's sink.
        let (line_tx, line_rx) = mpsc::unbounded_channel::<Vec<u8>>();
        if let Some(out) = stdout {
            classifier::spawn_byte_reader(out, line_tx.clone());
        }
        if let Some(err) = stderr {
            classifier::spawn_byte_reader(err, line_tx);
        }
        self.spawn_classifier_consumer(id.clone(), line_rx);

        self.attach_child(id, child, stdin, pid).await?;

        self.spawn_monitor(id.clone(), epoch);
        self.emit_info(
            id,
            format!("[quarry] started: pid={}", pid.unwrap_or_default()),
        );
        self.status(id).await
    }

    // Second half of start(): store the spawned handle under the map lock.
    // A stop() can land between the Starting transition and this point; in
    // that case the entry is already Stopping with no stdin, so the
    // graceful command is delivered here and the pipe dropped for EOF.
    async fn attach_child(
        &self,
        id: &ServerId,
        mut child: Child,
        stdin: Option<ChildStdin>,
        pid: Option<u32>,
    ) -> Result<()> {
        let mut inner = self.inner.lock().await;
        let Some(e) = inner.get_mut(id) else {
            let _ = child.start_kill();
            return Err(SupervisorError::UnknownServer(id.0.clone()));
        };
        e.child = Some(child);
        e.pid = pid;
        match e.state {
            ServerState::Starting => {
                e.stdin = stdin;
                e.state = ServerState::Running;
                e.message = Some("waiting for startup to complete...".to_string());
            }
            ServerState::Stopping => {
                let cmd = e.spec.stop_command.clone();
                if let Some(mut stdin) = stdin {
                    let _ = stdin.write_all(format!("{cmd}\n").as_bytes()).await;
                    let _ = stdin.flush().await;
                }
            }
            _ => {}
        }
        Ok(())
    }

    /// Cooperative stop: write the configured stop command, then close the
    /// input pipe so the child runs its own save/shutdown sequence. The
    /// monitor confirms death and completes the Stopping -> Stopped
    /// transition. There is deliberately no timed escalation to
    /// [`force_stop`](Self::force_stop).
    pub async fn stop(&self, id: &ServerId) -> Result<ServerStatus> {
        let handoff = {
            let mut inner = self.inner.lock().await;
            let e = inner
                .get_mut(id)
                .ok_or_else(|| SupervisorError::UnknownServer(id.0.clone()))?;
            if matches!(e.state, ServerState::Stopped | ServerState::Stopping) {
                return Ok(e.status(id));
            }
            e.state = ServerState::Stopping;
            e.message = Some("stopping".to_string());
            (e.stdin.take(), e.spec.stop_command.clone())
        };

        self.emit_info(id, "[quarry] stop requested".to_string());

        if let (Some(mut stdin), cmd) = handoff {
            let _ = stdin.write_all(format!("{cmd}\n").as_bytes()).await;
            let _ = stdin.flush().await;
            // Dropping stdin closes the pipe; the child sees EOF.
        }

        self.status(id).await
    }

    /// Immediate, unconditional kill. Destructive: the child gets no chance
    /// to save, so callers must surface this to the user as a last resort.
    pub async fn force_stop(&self, id: &ServerId) -> Result<ServerStatus> {
        {
            let mut inner = self.inner.lock().await;
            let e = inner
                .get_mut(id)
                .ok_or_else(|| SupervisorError::UnknownServer(id.0.clone()))?;
            if let Some(child) = e.child.as_mut() {
                e.state = ServerState::Stopping;
                e.stdin = None;
                e.message = Some("kill requested".to_string());
                let _ = child.start_kill();
            } else {
                return Ok(e.status(id));
            }
        }

        self.emit_info(
            id,
            "[quarry] force stop: process killed (unsaved data may be lost)".to_string(),
        );
        self.status(id).await
    }

    /// Stop, wait for confirmed termination, cool down, start again.
    /// No-op while a start or stop is already in flight.
    pub async fn restart(&self, id: &ServerId) -> Result<ServerStatus> {
        {
            let inner = self.inner.lock().await;
            let e = inner
                .get(id)
                .ok_or_else(|| SupervisorError::UnknownServer(id.0.clone()))?;
            if matches!(e.state, ServerState::Starting | ServerState::Stopping) {
                return Ok(e.status(id));
            }
        }

        self.stop(id).await?;
        self.wait_for_stopped(id, stop_wait_timeout()).await?;
        tokio::time::sleep(restart_cooldown()).await;
        self.start(id).await
    }

    /// Write one newline-terminated command to the child's input stream.
    /// Returns whether the line was actually delivered; anything sent while
    /// the server is not Running is silently dropped.
    pub async fn send_command(&self, id: &ServerId, command: &str) -> Result<bool> {
        // The entry map lock doubles as the per-process input-stream writer
        // lock, so concurrent callers cannot interleave command text.
        let mut inner = self.inner.lock().await;
        let e = inner
            .get_mut(id)
            .ok_or_else(|| SupervisorError::UnknownServer(id.0.clone()))?;
        if e.state != ServerState::Running {
            tracing::debug!(server = %id, %command, "command dropped: server not running");
            return Ok(false);
        }
        let Some(stdin) = e.stdin.as_mut() else {
            return Ok(false);
        };
        stdin.write_all(format!("{command}\n").as_bytes()).await?;
        stdin.flush().await?;
        Ok(true)
    }

    /// Non-blocking liveness poll of the OS process handle.
    pub async fn is_alive(&self, id: &ServerId) -> Result<bool> {
        let mut inner = self.inner.lock().await;
        let e = inner
            .get_mut(id)
            .ok_or_else(|| SupervisorError::UnknownServer(id.0.clone()))?;
        match e.child.as_mut() {
            None => Ok(false),
            Some(child) => Ok(matches!(child.try_wait(), Ok(None))),
        }
    }

    pub async fn status(&self, id: &ServerId) -> Result<ServerStatus> {
        let inner = self.inner.lock().await;
        inner
            .get(id)
            .map(|e| e.status(id))
            .ok_or_else(|| SupervisorError::UnknownServer(id.0.clone()))
    }

    pub async fn list(&self) -> Vec<ServerStatus> {
        let inner = self.inner.lock().await;
        inner.iter().map(|(id, e)| e.status(id)).collect()
    }

    /// Ids of servers that are Running or Starting.
    pub async fn active_ids(&self) -> Vec<ServerId> {
        let inner = self.inner.lock().await;
        inner
            .iter()
            .filter(|(_, e)| matches!(e.state, ServerState::Running | ServerState::Starting))
            .map(|(id, _)| id.clone())
            .collect()
    }

    /// Cooperatively stop every active server and wait (bounded) until all
    /// entries reach Stopped. Used by normal host shutdown and by the
    /// update pipeline before it touches the artifact.
    pub async fn drain_all(&self, timeout: Duration) -> Result<()> {
        for id in self.active_ids().await {
            let _ = self.stop(&id).await;
        }

        let started = Instant::now();
        loop {
            let all_stopped = {
                let inner = self.inner.lock().await;
                inner.values().all(|e| e.state == ServerState::Stopped)
            };
            if all_stopped {
                return Ok(());
            }
            if started.elapsed() >= timeout {
                return Err(SupervisorError::DrainTimeout {
                    waited_ms: timeout.as_millis() as u64,
                });
            }
            tokio::time::sleep(Duration::from_millis(200)).await;
        }
    }

    async fn wait_for_stopped(&self, id: &ServerId, timeout: Duration) -> Result<()> {
        let started = Instant::now();
        loop {
            if self.status(id).await?.state == ServerState::Stopped {
                return Ok(());
            }
            if started.elapsed() >= timeout {
                return Err(SupervisorError::DrainTimeout {
                    waited_ms: timeout.as_millis() as u64,
                });
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    }

    fn emit_info(&self, id: &ServerId, raw: String) {
        self.sink
            .emit(LogEvent::now(id.clone(), LogEventKind::Informational { raw }));
    }

    fn spawn_classifier_consumer(&self, id: ServerId, mut rx: mpsc::UnboundedReceiver<Vec<u8>>) {
        let manager = self.clone();
        tokio::spawn(async move {
            while let Some(bytes) = rx.recv().await {
                let (line, lossy) = classifier::decode_line(&bytes);
                if lossy {
                    tracing::warn!(server = %id, "output line was not valid UTF-8; decoded lossily");
                }
                manager.handle_event(&id, classifier::classify(&line)).await;
            }
        });
    }

    async fn handle_event(&self, id: &ServerId, kind: LogEventKind) {
        match &kind {
            LogEventKind::ServerStarted => {
                let mut inner = self.inner.lock().await;
                if let Some(e) = inner.get_mut(id)
                    && e.state == ServerState::Running
                {
                    // The child reports it is ready for command traffic.
                    e.message = None;
                }
            }
            LogEventKind::ServerStopping => {
                let mut inner = self.inner.lock().await;
                if let Some(e) = inner.get_mut(id) {
                    e.message = Some("shutdown announced by server".to_string());
                }
            }
            LogEventKind::EulaBlocked => {
                let mut inner = self.inner.lock().await;
                if let Some(e) = inner.get_mut(id) {
                    e.message = Some("first-run EULA not accepted".to_string());
                }
            }
            LogEventKind::Informational { raw } => {
                // Startup-progress chatter becomes the status message until
                // the ready marker clears it.
                if let Some(hint) = classifier::startup_progress(raw) {
                    let mut inner = self.inner.lock().await;
                    if let Some(e) = inner.get_mut(id)
                        && e.state == ServerState::Running
                    {
                        e.message = Some(hint);
                    }
                }
            }
            _ => {}
        }
        self.sink.emit(LogEvent::now(id.clone(), kind));
    }

    // The monitor is the sole writer of state transitions caused by
    // external death detection, and the only caller of the restart guard.
    fn spawn_monitor(&self, id: ServerId, epoch: u64) {
        let manager = self.clone();
        tokio::spawn(async move {
            let interval = health_poll_interval();
            loop {
                tokio::time::sleep(interval).await;

                let outcome = {
                    let mut inner = manager.inner.lock().await;
                    let Some(e) = inner.get_mut(&id) else {
                        break;
                    };
                    if e.epoch != epoch {
                        break;
                    }
                    let Some(child) = e.child.as_mut() else {
                        break;
                    };

                    let exit = match child.try_wait() {
                        Ok(None) => continue,
                        Ok(Some(status)) => Some(status.code()),
                        Err(err) => {
                            tracing::warn!(server = %id, error = %err, "liveness poll failed");
                            None
                        }
                    };

                    let user_initiated = e.state == ServerState::Stopping;
                    e.child = None;
                    e.stdin = None;
                    e.pid = None;
                    e.exit_code = exit.flatten();
                    e.state = ServerState::Stopped;
                    e.message = Some(if user_initiated {
                        "stopped".to_string()
                    } else {
                        match e.exit_code {
                            Some(code) => format!("exited unexpectedly with code {code}"),
                            None => "exited unexpectedly".to_string(),
                        }
                    });

                    let termination = if user_initiated {
                        Termination::UserInitiated
                    } else {
                        Termination::Unexpected
                    };
                    let policy = e.policy;
                    let decision = e.guard.decide(&policy, termination, Instant::now());
                    if decision == RestartDecision::BudgetExhausted {
                        e.message = Some("restart budget exhausted".to_string());
                    }
                    (e.exit_code, user_initiated, decision, policy)
                };

                let (exit_code, user_initiated, decision, policy) = outcome;
                manager.emit_info(
                    &id,
                    format!(
                        "[quarry] process exited: code={:?} user_initiated={}",
                        exit_code, user_initiated
                    ),
                );

                match decision {
                    RestartDecision::NoAction => {}
                    RestartDecision::BudgetExhausted => {
                        manager.emit_info(
                            &id,
                            format!(
                                "[quarry] restart budget exhausted (max {} per hour)",
                                policy.max_attempts_per_hour
                            ),
                        );
                    }
                    RestartDecision::RestartAfter(delay) => {
                        manager.emit_info(
                            &id,
                            format!(
                                "[quarry] auto-restart scheduled in {}ms",
                                delay.as_millis()
                            ),
                        );
                        let restarter = manager.clone();
                        let id = id.clone();
                        tokio::spawn(async move {
                            tokio::time::sleep(delay).await;
                            match restarter.start(&id).await {
                                Ok(_) => {
                                    restarter.emit_info(
                                        &id,
                                        "[quarry] auto-restart triggered".to_string(),
                                    );
                                }
                                Err(err) => {
                                    restarter.emit_info(
                                        &id,
                                        format!("[quarry] auto-restart failed: {err}"),
                                    );
                                }
                            }
                        });
                    }
                }
                break;
            }
        });
    }
}
