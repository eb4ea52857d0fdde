use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentboxConfig {
    /// Base directory for per-session workspaces (default: data dir + "sessions")
    pub sessions_base: Option<PathBuf>,
    pub worker: WorkerConfig,
    pub sandbox: SandboxConfig,
    /// Extra environment variable names forwarded into the worker, on top of
    /// the built-in allow-list.
    pub extra_env: Vec<String>,
}

/// Identity of the single worker binary this supervisor is allowed to run.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// The virtual command string callers must pass to `spawn`. Anything else
    /// is rejected outright.
    pub virtual_command: String,
    /// Host directory the real worker binary must live in (default: data dir
    /// + "worker").
    pub install_dir: Option<PathBuf>,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            virtual_command: "/usr/local/bin/agent-worker".to_string(),
            install_dir: None,
        }
    }
}

/// How worker processes are isolated from the host.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum SandboxMode {
    /// bubblewrap mount/user namespace sandbox (Linux)
    #[default]
    Bwrap,
    /// Direct spawn with a filtered environment. No filesystem containment;
    /// for tests and hosts already running inside an outer container.
    None,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SandboxConfig {
    /// Which isolation mode to use
    pub mode: SandboxMode,
    /// Give workers their own network namespace (default: share host network)
    pub isolate_network: bool,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            mode: SandboxMode::default(),
            isolate_network: false,
        }
    }
}
