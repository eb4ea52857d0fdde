pub mod events;
pub mod process;

pub use events::{EventBridge, EventSink, SessionEvent};
pub use process::{Phase, ProcessSession, ProcessStatus};

use std::collections::HashMap;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Arc, Mutex};

use base64::Engine;
use serde::{Deserialize, Serialize};
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::config::loader;
use crate::config::types::{AgentboxConfig, SandboxMode};
use crate::error::{AgentboxError, Result};
use crate::sandbox::{self, SandboxSpec};
use crate::vfs::{
    create_private_dir, to_host, MountEntry, MountMap, MountMode, MountPlanner, MountRequest,
    PathContext,
};
use process::LiveMap;

/// Host environment variables a worker is allowed to inherit. Everything else
/// is stripped; the desktop session environment carries tokens and socket
/// paths a sandboxed worker has no business seeing.
const ENV_ALLOWLIST: &[&str] = &[
    "HOME",
    "USER",
    "LOGNAME",
    "SHELL",
    "PATH",
    "LANG",
    "LC_ALL",
    "LC_CTYPE",
    "LC_MESSAGES",
    "TERM",
    "COLORTERM",
    "TZ",
    "DISPLAY",
    "WAYLAND_DISPLAY",
    "AGENTBOX_FEATURES",
];

/// Everything a caller supplies to launch one worker process.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SpawnRequest {
    /// Caller-chosen process id, unique among live processes
    pub id: String,
    /// Session name; scopes the mount namespace and workspace
    pub session: String,
    /// Virtual worker command; must match the configured one exactly
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    /// Virtual working directory; defaults to the user mount
    #[serde(default)]
    pub cwd: Option<String>,
    /// Extra environment on top of the inherited allow-list
    #[serde(default)]
    pub env: HashMap<String, String>,
    #[serde(default)]
    pub mounts: Vec<MountRequest>,
    /// The worker is resuming an earlier conversation
    #[serde(default)]
    pub resume: bool,
    #[serde(default)]
    pub allowed_domains: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SpawnOutcome {
    pub pid: u32,
}

/// Owns every live worker process and the session mount state, and fans
/// lifecycle events out through its [`EventBridge`].
pub struct Supervisor {
    config: AgentboxConfig,
    planner: MountPlanner,
    install_dir: PathBuf,
    bridge: Arc<EventBridge>,
    live: LiveMap,
    session_mounts: Mutex<HashMap<String, MountMap>>,
}

impl Supervisor {
    /// Build a supervisor from configuration and the process environment.
    pub fn new(config: AgentboxConfig) -> Result<Self> {
        let sessions_base = loader::get_sessions_base(&config);
        let ctx = PathContext::from_env(sessions_base)?;
        Ok(Self::with_context(config, ctx))
    }

    /// Build a supervisor against an explicit path context. The environment
    /// is only consulted through the context, which keeps tests hermetic.
    pub fn with_context(config: AgentboxConfig, ctx: PathContext) -> Self {
        let install_dir = loader::get_worker_install_dir(&config);
        Self {
            config,
            planner: MountPlanner::new(ctx),
            install_dir,
            bridge: Arc::new(EventBridge::default()),
            live: LiveMap::default(),
            session_mounts: Mutex::new(HashMap::new()),
        }
    }

    pub fn bridge(&self) -> &Arc<EventBridge> {
        &self.bridge
    }

    pub fn context(&self) -> &PathContext {
        self.planner.context()
    }

    /// Launch a worker process. Validation failures reject the one request;
    /// every error is also surfaced as an [`SessionEvent::Error`] so hosts
    /// driving the event stream see it without watching the return path.
    pub async fn spawn(&self, request: SpawnRequest) -> Result<SpawnOutcome> {
        match self.spawn_inner(&request).await {
            Ok(outcome) => Ok(outcome),
            Err(e) => {
                self.bridge
                    .emit(SessionEvent::Error {
                        id: request.id.clone(),
                        message: e.to_string(),
                    })
                    .await;
                Err(e)
            }
        }
    }

    async fn spawn_inner(&self, request: &SpawnRequest) -> Result<SpawnOutcome> {
        for mount in &request.mounts {
            mount.validate()?;
        }
        if self
            .live
            .lock()
            .expect("live-process map poisoned")
            .contains_key(&request.id)
        {
            return Err(AgentboxError::ProcessAlreadyLive {
                id: request.id.clone(),
            });
        }

        let executable = self.resolve_worker(&request.command)?;
        let mut mounts = self.planner.plan(&request.session, &request.mounts);
        {
            // Mounts established through `mount_path` outlive individual
            // spawns; fold them back in under everything the plan produced.
            let mut sessions = self
                .session_mounts
                .lock()
                .expect("session mount state poisoned");
            if let Some(established) = sessions.get(&request.session) {
                for (name, entry) in established {
                    mounts
                        .entry(name.clone())
                        .or_insert_with(|| entry.clone());
                }
            }
            sessions.insert(request.session.clone(), mounts.clone());
        }

        let mut cmd = self.build_command(request, &executable, &mounts)?;
        cmd.stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let child = cmd
            .spawn()
            .map_err(|e| AgentboxError::Spawn(format!("{}: {e}", executable.display())))?;
        let process = ProcessSession::start(
            request.id.clone(),
            request.session.clone(),
            child,
            self.bridge.clone(),
            self.live.clone(),
        )?;
        info!(id = %request.id, session = %request.session, pid = process.pid(),
              mode = ?self.config.sandbox.mode, "Worker spawned");
        Ok(SpawnOutcome {
            pid: process.pid(),
        })
    }

    /// The virtual command must match configuration exactly, and the real
    /// binary of the same file name must live inside the install directory.
    fn resolve_worker(&self, command: &str) -> Result<PathBuf> {
        if command != self.config.worker.virtual_command {
            return Err(AgentboxError::UnexpectedCommand {
                command: command.to_string(),
            });
        }
        let file_name = Path::new(command)
            .file_name()
            .ok_or_else(|| AgentboxError::UnexpectedCommand {
                command: command.to_string(),
            })?;
        let executable = self.install_dir.join(file_name);
        if !executable.is_file() {
            return Err(AgentboxError::WorkerNotInstalled {
                path: executable.display().to_string(),
            });
        }
        // Canonicalize both sides so a symlinked binary cannot point the
        // spawn outside the install directory.
        let executable = executable.canonicalize()?;
        let install_dir = self.install_dir.canonicalize()?;
        if !executable.starts_with(&install_dir) {
            return Err(AgentboxError::BinaryOutsideInstallDir {
                path: executable.display().to_string(),
            });
        }
        Ok(executable)
    }

    fn build_command(
        &self,
        request: &SpawnRequest,
        executable: &Path,
        mounts: &MountMap,
    ) -> Result<Command> {
        let ctx = self.planner.context();
        let mut cmd = match self.config.sandbox.mode {
            SandboxMode::Bwrap => {
                if !sandbox::bwrap_available() {
                    return Err(AgentboxError::SandboxUnavailable(
                        "bwrap not found on PATH".to_string(),
                    ));
                }
                let spec = SandboxSpec {
                    session: &request.session,
                    mounts,
                    home: &ctx.home,
                    user_mount: &ctx.user_mount,
                    cwd: request.cwd.as_deref(),
                    isolate_network: self.config.sandbox.isolate_network,
                };
                let mut cmd = Command::new("bwrap");
                cmd.args(sandbox::build_args(&spec, executable, &request.args));
                cmd
            }
            SandboxMode::None => {
                // Passthrough for hosts where user namespaces are unavailable
                // (nested containers, CI). Virtual paths still translate.
                let cwd = match request.cwd.as_deref() {
                    Some(cwd) => to_host(cwd, Some(mounts), ctx)?,
                    None => ctx.home.clone(),
                };
                let mut cmd = Command::new(executable);
                cmd.args(&request.args).current_dir(cwd);
                cmd
            }
        };

        cmd.env_clear();
        for key in ENV_ALLOWLIST
            .iter()
            .copied()
            .chain(self.config.extra_env.iter().map(String::as_str))
        {
            if let Ok(value) = std::env::var(key) {
                cmd.env(key, value);
            }
        }
        cmd.envs(&request.env);
        if request.resume {
            cmd.env("AGENTBOX_RESUME", "1");
        }
        if !request.allowed_domains.is_empty() {
            cmd.env("AGENTBOX_ALLOWED_DOMAINS", request.allowed_domains.join(","));
        }
        Ok(cmd)
    }

    /// Queue bytes for a live process's stdin. Resolves false when the id is
    /// unknown, the process exited, or the pipe broke under the write.
    pub async fn write_stdin(&self, id: &str, data: &str) -> bool {
        let process = self
            .live
            .lock()
            .expect("live-process map poisoned")
            .get(id)
            .cloned();
        match process {
            Some(process) => process.write_stdin(data.as_bytes().to_vec()).await,
            None => {
                debug!(id, "write_stdin for unknown process");
                false
            }
        }
    }

    /// Signal a process, removing it from the live set up front so callers
    /// see it gone immediately. Unknown ids are a no-op.
    pub fn kill(&self, id: &str, signal: Option<i32>) {
        let process = self
            .live
            .lock()
            .expect("live-process map poisoned")
            .remove(id);
        match process {
            Some(process) => process.kill(signal.unwrap_or(libc::SIGTERM)),
            None => debug!(id, "kill for unknown process, ignoring"),
        }
    }

    pub fn is_guest_connected(&self, id: &str) -> bool {
        self.live
            .lock()
            .expect("live-process map poisoned")
            .get(id)
            .is_some_and(|p| p.is_connected())
    }

    pub fn running_status(&self) -> Vec<ProcessStatus> {
        let mut statuses: Vec<_> = self
            .live
            .lock()
            .expect("live-process map poisoned")
            .values()
            .map(|p| p.status())
            .collect();
        statuses.sort_by(|a, b| a.id.cmp(&b.id));
        statuses
    }

    /// Translate a virtual path to its host path, using the named session's
    /// mount map when one has been established by a spawn.
    pub fn translate(&self, path: &str, session: Option<&str>) -> Result<PathBuf> {
        let mounts = session.and_then(|s| {
            self.session_mounts
                .lock()
                .expect("session mount state poisoned")
                .get(s)
                .cloned()
        });
        to_host(path, mounts.as_ref(), self.planner.context())
    }

    /// Read a file by virtual or host path, returned base64-encoded for the
    /// host's text-only message channel.
    pub async fn read_file(&self, path: &str, session: Option<&str>) -> Result<String> {
        let host = self.translate(path, session)?;
        let bytes = tokio::fs::read(&host).await?;
        Ok(base64::engine::general_purpose::STANDARD.encode(bytes))
    }

    /// Write base64-encoded content to a file by virtual or host path,
    /// creating parent directories owner-only and the file itself 0600.
    pub async fn write_file(&self, path: &str, data: &str, session: Option<&str>) -> Result<()> {
        let host = self.translate(path, session)?;
        let bytes = base64::engine::general_purpose::STANDARD.decode(data)?;
        if let Some(parent) = host.parent() {
            create_private_dir(parent)?;
        }
        tokio::fs::write(&host, bytes).await?;
        tokio::fs::set_permissions(&host, std::fs::Permissions::from_mode(0o600)).await?;
        Ok(())
    }

    /// Expose a host directory inside a session's mount namespace by
    /// symlinking it under the session root. Only absent names are created;
    /// remounting an established name is rejected rather than replaced. The
    /// mode is recorded and honored by the binds of later spawns.
    pub fn mount_path(
        &self,
        session: &str,
        name: &str,
        target: &Path,
        mode: MountMode,
    ) -> Result<String> {
        MountRequest {
            name: name.to_string(),
            relative_path: String::new(),
            mode,
        }
        .validate()?;

        {
            let sessions = self
                .session_mounts
                .lock()
                .expect("session mount state poisoned");
            if sessions.get(session).is_some_and(|m| m.contains_key(name)) {
                return Err(AgentboxError::MountExists {
                    name: name.to_string(),
                });
            }
        }

        let mnt_root = self.planner.context().session_root(session).join("mnt");
        create_private_dir(&mnt_root)?;
        let link = mnt_root.join(name);
        if link.symlink_metadata().is_ok() {
            return Err(AgentboxError::MountExists {
                name: name.to_string(),
            });
        }
        std::os::unix::fs::symlink(target, &link)?;

        let mut sessions = self
            .session_mounts
            .lock()
            .expect("session mount state poisoned");
        sessions.entry(session.to_string()).or_default().insert(
            name.to_string(),
            MountEntry {
                host_path: target.to_path_buf(),
                mode,
            },
        );
        let virtual_path = format!("/sessions/{session}/mnt/{name}");
        debug!(session, name, target = %target.display(), "Mounted host path");
        Ok(virtual_path)
    }

    /// Established mount map for a session, when any spawn or mount created one.
    pub fn session_mounts(&self, session: &str) -> Option<MountMap> {
        self.session_mounts
            .lock()
            .expect("session mount state poisoned")
            .get(session)
            .cloned()
    }

    /// Preview the mount map a spawn in this session would receive.
    pub fn plan_mounts(&self, session: &str, requests: &[MountRequest]) -> MountMap {
        self.planner.plan(session, requests)
    }

    /// Send every live worker a termination signal. Used on shutdown; exit
    /// handlers still run and report each exit.
    pub fn kill_all(&self) {
        let ids: Vec<String> = self
            .live
            .lock()
            .expect("live-process map poisoned")
            .keys()
            .cloned()
            .collect();
        if !ids.is_empty() {
            warn!(count = ids.len(), "Terminating live workers");
        }
        for id in ids {
            self.kill(&id, None);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::types::{SandboxConfig, WorkerConfig};
    use crate::supervisor::events::testing::RecordingSink;
    use std::fs;

    const WORKER_CMD: &str = "/usr/local/bin/agent-worker";

    struct Fixture {
        _tmp: tempfile::TempDir,
        supervisor: Supervisor,
        sink: Arc<RecordingSink>,
    }

    fn fixture() -> Fixture {
        let tmp = tempfile::tempdir().unwrap();
        let home = tmp.path().join("home");
        fs::create_dir_all(&home).unwrap();
        let install_dir = tmp.path().join("worker");
        fs::create_dir_all(&install_dir).unwrap();
        let script = install_dir.join("agent-worker");
        fs::write(&script, "#!/bin/sh\necho ready\nexec cat\n").unwrap();
        fs::set_permissions(&script, fs::Permissions::from_mode(0o755)).unwrap();

        let config = AgentboxConfig {
            sessions_base: Some(tmp.path().join("sessions")),
            worker: WorkerConfig {
                virtual_command: WORKER_CMD.to_string(),
                install_dir: Some(install_dir),
            },
            sandbox: SandboxConfig {
                mode: SandboxMode::None,
                isolate_network: false,
            },
            extra_env: Vec::new(),
        };
        let ctx = PathContext {
            home,
            sessions_base: tmp.path().join("sessions"),
            user_mount: "alice".to_string(),
        };
        let supervisor = Supervisor::with_context(config, ctx);
        let sink = Arc::new(RecordingSink::default());
        supervisor.bridge().register(sink.clone());
        Fixture {
            _tmp: tmp,
            supervisor,
            sink,
        }
    }

    fn request(id: &str) -> SpawnRequest {
        SpawnRequest {
            id: id.to_string(),
            session: "s1".to_string(),
            command: WORKER_CMD.to_string(),
            args: Vec::new(),
            cwd: None,
            env: HashMap::new(),
            mounts: Vec::new(),
            resume: false,
            allowed_domains: Vec::new(),
        }
    }

    fn stdout_text(events: &[SessionEvent]) -> String {
        events
            .iter()
            .filter_map(|e| match e {
                SessionEvent::Stdout { data, .. } => Some(data.as_str()),
                _ => None,
            })
            .collect()
    }

    #[tokio::test]
    async fn unexpected_command_is_rejected_with_one_error_event() {
        let f = fixture();
        let mut req = request("p1");
        req.command = "/bin/sh".to_string();

        let err = f.supervisor.spawn(req).await.unwrap_err();
        assert!(matches!(err, AgentboxError::UnexpectedCommand { .. }));
        assert!(err.is_validation());

        let errors: Vec<_> = f
            .sink
            .events()
            .iter()
            .filter(|e| matches!(e, SessionEvent::Error { .. }))
            .cloned()
            .collect();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].id(), "p1");
        assert!(f.supervisor.running_status().is_empty());
    }

    #[tokio::test]
    async fn duplicate_live_id_is_rejected() {
        let f = fixture();
        let outcome = f.supervisor.spawn(request("p1")).await.unwrap();
        assert!(outcome.pid > 0);

        let err = f.supervisor.spawn(request("p1")).await.unwrap_err();
        assert!(matches!(err, AgentboxError::ProcessAlreadyLive { .. }));

        f.supervisor.kill("p1", None);
        f.sink
            .wait_until(|events| events.iter().any(|e| matches!(e, SessionEvent::Exit { .. })))
            .await;
    }

    #[tokio::test]
    async fn spawn_echo_roundtrip_and_kill() {
        let f = fixture();
        f.supervisor.spawn(request("p1")).await.unwrap();

        // Writes queued before Ready flush in order after the handshake.
        assert!(f.supervisor.write_stdin("p1", "one\n").await);
        assert!(f.supervisor.write_stdin("p1", "two\n").await);
        f.sink
            .wait_until(|events| stdout_text(events).contains("two\n"))
            .await;
        assert!(f.supervisor.is_guest_connected("p1"));

        let events = f.sink.events();
        let connections = events
            .iter()
            .filter(|e| matches!(e, SessionEvent::GuestConnection { connected: true, .. }))
            .count();
        assert_eq!(connections, 1);
        let text = stdout_text(&events);
        assert!(text.find("ready\n").unwrap() < text.find("one\n").unwrap());
        assert!(text.find("one\n").unwrap() < text.find("two\n").unwrap());

        let status = f.supervisor.running_status();
        assert_eq!(status.len(), 1);
        assert_eq!(status[0].phase, Phase::Ready);

        f.supervisor.kill("p1", None);
        assert!(f.supervisor.running_status().is_empty());
        f.sink
            .wait_until(|events| {
                events
                    .iter()
                    .any(|e| matches!(e, SessionEvent::Exit { signal, .. } if signal == "SIGTERM"))
            })
            .await;

        assert!(!f.supervisor.write_stdin("p1", "late\n").await);
        // Killing an id that is already gone stays a no-op.
        f.supervisor.kill("p1", None);
        f.supervisor.kill("nope", None);
    }

    #[tokio::test]
    async fn missing_worker_binary_is_rejected() {
        let f = fixture();
        fs::remove_file(
            loader::get_worker_install_dir(&f.supervisor.config).join("agent-worker"),
        )
        .unwrap();

        let err = f.supervisor.spawn(request("p1")).await.unwrap_err();
        assert!(matches!(err, AgentboxError::WorkerNotInstalled { .. }));
    }

    #[tokio::test]
    async fn symlinked_worker_outside_install_dir_is_rejected() {
        let f = fixture();
        let install_dir = loader::get_worker_install_dir(&f.supervisor.config);
        let outside = install_dir.parent().unwrap().join("outside-sh");
        fs::write(&outside, "#!/bin/sh\n").unwrap();
        fs::set_permissions(&outside, fs::Permissions::from_mode(0o755)).unwrap();
        fs::remove_file(install_dir.join("agent-worker")).unwrap();
        std::os::unix::fs::symlink(&outside, install_dir.join("agent-worker")).unwrap();

        let err = f.supervisor.spawn(request("p1")).await.unwrap_err();
        assert!(matches!(err, AgentboxError::BinaryOutsideInstallDir { .. }));
    }

    #[tokio::test]
    async fn spawn_establishes_the_session_mount_map() {
        let f = fixture();
        let mut req = request("p1");
        req.mounts = vec![MountRequest {
            name: "projects".to_string(),
            relative_path: "src".to_string(),
            mode: MountMode::ReadOnly,
        }];
        f.supervisor.spawn(req).await.unwrap();

        let home = f.supervisor.context().home.clone();
        let host = f
            .supervisor
            .translate("/sessions/s1/mnt/projects/app.rs", Some("s1"))
            .unwrap();
        assert_eq!(host, home.join("src/app.rs"));

        f.supervisor.kill("p1", None);
        f.sink
            .wait_until(|events| events.iter().any(|e| matches!(e, SessionEvent::Exit { .. })))
            .await;
    }

    #[tokio::test]
    async fn file_transfer_uses_virtual_paths_and_private_modes() {
        let f = fixture();
        let data = base64::engine::general_purpose::STANDARD.encode(b"hello");
        f.supervisor
            .write_file("/sessions/s1/mnt/alice/notes/a.txt", &data, None)
            .await
            .unwrap();

        let home = f.supervisor.context().home.clone();
        let host = home.join("notes/a.txt");
        let mode = fs::metadata(&host).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode, 0o600);
        let dir_mode = fs::metadata(home.join("notes")).unwrap().permissions().mode() & 0o777;
        assert_eq!(dir_mode, 0o700);

        let read = f
            .supervisor
            .read_file("/sessions/s1/mnt/alice/notes/a.txt", None)
            .await
            .unwrap();
        assert_eq!(read, data);

        let err = f
            .supervisor
            .read_file("/sessions/s1/mnt/alice/../../etc/passwd", None)
            .await
            .unwrap_err();
        assert!(matches!(err, AgentboxError::PathTraversal { .. }));
    }

    #[tokio::test]
    async fn mount_path_creates_once_and_rejects_remount() {
        let f = fixture();
        let target = f.supervisor.context().home.join("shared");
        fs::create_dir_all(&target).unwrap();

        let virtual_path = f
            .supervisor
            .mount_path("s1", "shared", &target, MountMode::ReadWrite)
            .unwrap();
        assert_eq!(virtual_path, "/sessions/s1/mnt/shared");
        let link = f.supervisor.context().session_root("s1").join("mnt/shared");
        assert_eq!(fs::read_link(&link).unwrap(), target);

        let err = f
            .supervisor
            .mount_path("s1", "shared", &target, MountMode::ReadWrite)
            .unwrap_err();
        assert!(matches!(err, AgentboxError::MountExists { .. }));

        // The new mount resolves through the session map for translation.
        let host = f
            .supervisor
            .translate("/sessions/s1/mnt/shared/file.txt", Some("s1"))
            .unwrap();
        assert_eq!(host, target.join("file.txt"));

        assert!(f
            .supervisor
            .mount_path("s1", "../evil", &target, MountMode::ReadWrite)
            .is_err());
    }

    #[tokio::test]
    async fn mounted_paths_keep_their_mode_across_spawns() {
        let f = fixture();
        let target = f.supervisor.context().home.join("reference");
        fs::create_dir_all(&target).unwrap();
        f.supervisor
            .mount_path("s1", "reference", &target, MountMode::ReadOnly)
            .unwrap();

        f.supervisor.spawn(request("p1")).await.unwrap();

        // Planning a spawn folds the established mount back in, read-only,
        // next to the defaults.
        let map = f.supervisor.session_mounts("s1").unwrap();
        assert_eq!(map["reference"].host_path, target);
        assert!(map["reference"].mode.is_read_only());
        assert!(map.contains_key("alice"));
        assert!(map.contains_key("uploads"));

        f.supervisor.kill("p1", None);
        f.sink
            .wait_until(|events| events.iter().any(|e| matches!(e, SessionEvent::Exit { .. })))
            .await;
    }
}
