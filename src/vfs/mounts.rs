use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{AgentboxError, Result};
use crate::vfs::paths::PathContext;

/// Fixed mount name backed by the config-data directory.
pub const CONFIG_MOUNT: &str = "config";
/// Fixed mount name backed by the plugin cache.
pub const SKILLS_MOUNT: &str = "skills";
/// Per-session upload directory; always a real directory under the session
/// root, never a bind of anything outside it.
pub const UPLOADS_MOUNT: &str = "uploads";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MountMode {
    ReadOnly,
    ReadWrite,
}

impl MountMode {
    pub fn is_read_only(self) -> bool {
        matches!(self, MountMode::ReadOnly)
    }
}

/// One resolved binding inside a session's mount namespace.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MountEntry {
    pub host_path: PathBuf,
    pub mode: MountMode,
}

/// Mount name to resolved host binding, immutable for the life of a process.
pub type MountMap = BTreeMap<String, MountEntry>;

/// A caller-supplied mount request, validated before planning.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MountRequest {
    /// Mount name as seen under `/sessions/<name>/mnt/`
    pub name: String,
    /// Path relative to the home directory; empty means home itself
    pub relative_path: String,
    pub mode: MountMode,
}

impl MountRequest {
    /// Parse the CLI form `name[=relative/path][:ro]`.
    pub fn parse(s: &str) -> std::result::Result<Self, String> {
        let (spec, mode) = match s.strip_suffix(":ro") {
            Some(spec) => (spec, MountMode::ReadOnly),
            None => (s, MountMode::ReadWrite),
        };
        let (name, relative_path) = match spec.split_once('=') {
            Some((name, rel)) => (name, rel),
            None => (spec, ""),
        };
        let request = Self {
            name: name.to_string(),
            relative_path: relative_path.to_string(),
            mode,
        };
        request.validate().map_err(|e| e.to_string())?;
        Ok(request)
    }

    /// Boundary validation: mount names are single path components and
    /// relative paths stay relative, with no `..` segments.
    pub fn validate(&self) -> Result<()> {
        let reject = |reason: String| Err(AgentboxError::InvalidMount { reason });
        if self.name.is_empty() {
            return reject("mount name is empty".to_string());
        }
        if self.name.contains('/') || self.name == "." || self.name == ".." {
            return reject(format!("mount name '{}' is not a single path component", self.name));
        }
        let rel = Path::new(&self.relative_path);
        if rel.is_absolute() {
            return reject(format!("mount path '{}' must be relative to home", self.relative_path));
        }
        if rel
            .components()
            .any(|c| matches!(c, std::path::Component::ParentDir))
        {
            return reject(format!("mount path '{}' contains '..'", self.relative_path));
        }
        Ok(())
    }
}

/// Derives the per-spawn MountMap for a session and makes sure every backing
/// directory exists, memoizing creations so repeat spawns skip the syscalls.
pub struct MountPlanner {
    ctx: PathContext,
    created: Mutex<HashSet<PathBuf>>,
}

impl MountPlanner {
    pub fn new(ctx: PathContext) -> Self {
        Self {
            ctx,
            created: Mutex::new(HashSet::new()),
        }
    }

    pub fn context(&self) -> &PathContext {
        &self.ctx
    }

    /// Plan the MountMap for one spawn. Requests come first, then defaults
    /// for the current-user, config, skills and uploads mounts when absent.
    /// A mount whose directory cannot be created is dropped, not fatal.
    pub fn plan(&self, session: &str, requests: &[MountRequest]) -> MountMap {
        let mut map = MountMap::new();

        for request in requests {
            if let Err(e) = request.validate() {
                warn!(mount = %request.name, error = %e, "Skipping invalid mount request");
                continue;
            }
            let host_path = if request.relative_path.is_empty() {
                self.ctx.home.clone()
            } else {
                self.ctx.home.join(&request.relative_path)
            };
            map.insert(
                request.name.clone(),
                MountEntry {
                    host_path,
                    mode: request.mode,
                },
            );
        }

        let defaults = [
            (
                self.ctx.user_mount.clone(),
                self.ctx.home.clone(),
                MountMode::ReadWrite,
            ),
            (
                CONFIG_MOUNT.to_string(),
                self.ctx.config_dir(),
                MountMode::ReadWrite,
            ),
            (
                SKILLS_MOUNT.to_string(),
                self.ctx.skills_dir(),
                MountMode::ReadOnly,
            ),
            (
                UPLOADS_MOUNT.to_string(),
                self.ctx.session_root(session).join("uploads"),
                MountMode::ReadWrite,
            ),
        ];
        for (name, host_path, mode) in defaults {
            map.entry(name)
                .or_insert(MountEntry { host_path, mode });
        }

        map.retain(|name, entry| {
            let ok = self.ensure_dir(&entry.host_path);
            if !ok {
                warn!(mount = %name, path = %entry.host_path.display(),
                      "Mount directory unavailable, session will not see it");
            }
            ok
        });
        map
    }

    /// Idempotent, memoized directory creation with owner-only permissions.
    pub fn ensure_dir(&self, path: &Path) -> bool {
        {
            let created = self.created.lock().expect("created-dir cache poisoned");
            if created.contains(path) {
                return true;
            }
        }
        match create_private_dir(path) {
            Ok(()) => {
                debug!(path = %path.display(), "Mount directory ready");
                let mut created = self.created.lock().expect("created-dir cache poisoned");
                created.insert(path.to_path_buf());
                true
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Failed to create mount directory");
                false
            }
        }
    }
}

/// Create a directory (and parents) with owner-only permissions. Every
/// component this call creates gets mode 0700, not just the leaf; directories
/// that already exist keep their current permissions.
pub fn create_private_dir(path: &Path) -> std::io::Result<()> {
    if path.is_dir() {
        return Ok(());
    }
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            create_private_dir(parent)?;
        }
    }
    match fs::create_dir(path) {
        Ok(()) => fs::set_permissions(path, fs::Permissions::from_mode(0o700)),
        // Lost a race with a concurrent creator; treat like pre-existing.
        Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => Ok(()),
        Err(e) => Err(e),
    }
}
