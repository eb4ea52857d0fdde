use std::path::{Path, PathBuf};

use crate::config::types::AgentboxConfig;
use crate::error::{AgentboxError, Result};

/// Get the default configuration file path
pub fn get_config_path() -> PathBuf {
    if let Some(proj_dirs) = directories::ProjectDirs::from("com", "agentbox", "agentbox") {
        proj_dirs.config_dir().join("config.toml")
    } else {
        // Fallback to home directory
        dirs_fallback().join(".agentbox").join("config.toml")
    }
}

fn dirs_fallback() -> PathBuf {
    std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("."))
}

/// Load configuration from file, with defaults for missing values
pub fn load_config(config_path: Option<&Path>) -> Result<AgentboxConfig> {
    let path = config_path
        .map(PathBuf::from)
        .unwrap_or_else(get_config_path);

    if !path.exists() {
        // Return defaults if no config file exists
        return Ok(AgentboxConfig::default());
    }

    let content = std::fs::read_to_string(&path)?;
    let config: AgentboxConfig =
        toml::from_str(&content).map_err(|e| AgentboxError::TomlParse(e.to_string()))?;

    Ok(config)
}

/// Get the data directory (session storage, worker install)
pub fn get_data_dir() -> PathBuf {
    if let Some(proj_dirs) = directories::ProjectDirs::from("com", "agentbox", "agentbox") {
        proj_dirs.data_dir().to_path_buf()
    } else {
        dirs_fallback()
            .join(".local")
            .join("share")
            .join("agentbox")
    }
}

/// Base directory for per-session workspaces, honoring the config override.
pub fn get_sessions_base(config: &AgentboxConfig) -> PathBuf {
    config
        .sessions_base
        .clone()
        .unwrap_or_else(|| get_data_dir().join("sessions"))
}

/// Directory the real worker binary must live in, honoring the config override.
pub fn get_worker_install_dir(config: &AgentboxConfig) -> PathBuf {
    config
        .worker
        .install_dir
        .clone()
        .unwrap_or_else(|| get_data_dir().join("worker"))
}
