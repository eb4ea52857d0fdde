use std::path::{Component, Path, PathBuf};

use crate::error::{AgentboxError, Result};
use crate::vfs::mounts::{MountMap, CONFIG_MOUNT};

/// Prefix of the virtual path namespace the worker sees.
pub const SESSIONS_PREFIX: &str = "/sessions/";

/// Host-side anchors a virtual path may resolve against.
#[derive(Debug, Clone)]
pub struct PathContext {
    /// Real home directory of the invoking user
    pub home: PathBuf,
    /// Base directory for per-session workspaces
    pub sessions_base: PathBuf,
    /// Mount name standing for the invoking user's home directory
    pub user_mount: String,
}

impl PathContext {
    /// Build a context from the process environment.
    pub fn from_env(sessions_base: PathBuf) -> Result<Self> {
        let home = std::env::var("HOME")
            .map(PathBuf::from)
            .map_err(|_| AgentboxError::Config("HOME is not set".to_string()))?;
        let user_mount = std::env::var("USER")
            .or_else(|_| std::env::var("LOGNAME"))
            .unwrap_or_else(|_| "user".to_string());
        Ok(Self {
            home,
            sessions_base,
            user_mount,
        })
    }

    /// Fixed config-data directory backing the `config` mount.
    pub fn config_dir(&self) -> PathBuf {
        self.home.join(".config").join("agentbox")
    }

    /// Plugin cache directory backing the `skills` mount.
    pub fn skills_dir(&self) -> PathBuf {
        self.home.join(".cache").join("agentbox").join("skills")
    }

    /// Host-side root directory of a session workspace.
    pub fn session_root(&self, session: &str) -> PathBuf {
        self.sessions_base.join(session)
    }
}

/// Translate a virtual worker path to a real host path.
///
/// Paths of the form `/sessions/<name>/mnt/<mount>/<rest>` resolve through
/// the session's MountMap when available, then through fixed fallback rules
/// (current-user mount to home, `config` mount to the config-data dir), and
/// finally relative to the sessions base. Anything else passes through
/// unchanged, which makes translation idempotent.
///
/// The resolved path is normalized lexically and must stay inside the anchor
/// directory it resolved against; `..` escapes are a hard error, never a
/// silently-escaped path.
pub fn to_host(path: &str, mounts: Option<&MountMap>, ctx: &PathContext) -> Result<PathBuf> {
    let Some((session, mount, rest)) = split_virtual(path) else {
        return Ok(PathBuf::from(path));
    };

    let (base, anchor) = if let Some(entry) = mounts.and_then(|m| m.get(mount)) {
        (entry.host_path.clone(), entry.host_path.clone())
    } else if mount == ctx.user_mount {
        (ctx.home.clone(), ctx.home.clone())
    } else if mount == CONFIG_MOUNT {
        (ctx.config_dir(), ctx.config_dir())
    } else {
        (
            ctx.session_root(session).join("mnt").join(mount),
            ctx.sessions_base.clone(),
        )
    };

    let joined = if rest.is_empty() {
        base
    } else {
        base.join(rest)
    };

    let traversal = || AgentboxError::PathTraversal {
        path: path.to_string(),
    };
    let resolved = normalize_lexically(&joined).ok_or_else(traversal)?;
    let anchor = normalize_lexically(&anchor).ok_or_else(traversal)?;
    if !resolved.starts_with(&anchor) {
        return Err(traversal());
    }
    Ok(resolved)
}

/// Split `/sessions/<name>/mnt/<mount>[/<rest>]` into its parts.
fn split_virtual(path: &str) -> Option<(&str, &str, &str)> {
    let tail = path.strip_prefix(SESSIONS_PREFIX)?;
    let (session, tail) = tail.split_once('/')?;
    let (mnt, tail) = tail.split_once('/')?;
    if session.is_empty() || mnt != "mnt" {
        return None;
    }
    let (mount, rest) = match tail.split_once('/') {
        Some((mount, rest)) => (mount, rest),
        None => (tail, ""),
    };
    if mount.is_empty() {
        return None;
    }
    Some((session, mount, rest))
}

/// Resolve `.` and `..` components without touching the filesystem.
/// Returns None when `..` would climb above the root.
fn normalize_lexically(path: &Path) -> Option<PathBuf> {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::Prefix(_) | Component::RootDir => out.push(component),
            Component::CurDir => {}
            Component::ParentDir => {
                if !out.pop() {
                    return None;
                }
            }
            Component::Normal(part) => out.push(part),
        }
    }
    Some(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vfs::mounts::{MountEntry, MountMode};

    fn ctx() -> PathContext {
        PathContext {
            home: PathBuf::from("/home/alice"),
            sessions_base: PathBuf::from("/data/sessions"),
            user_mount: "alice".to_string(),
        }
    }

    #[test]
    fn user_mount_resolves_to_home() {
        let host = to_host("/sessions/s1/mnt/alice/notes/todo.md", None, &ctx()).unwrap();
        assert_eq!(host, PathBuf::from("/home/alice/notes/todo.md"));
    }

    #[test]
    fn config_mount_resolves_to_config_dir() {
        let host = to_host("/sessions/s1/mnt/config/settings.json", None, &ctx()).unwrap();
        assert_eq!(
            host,
            PathBuf::from("/home/alice/.config/agentbox/settings.json")
        );
    }

    #[test]
    fn mount_map_wins_over_fallbacks() {
        let mut mounts = MountMap::new();
        mounts.insert(
            "projects".to_string(),
            MountEntry {
                host_path: PathBuf::from("/home/alice/src"),
                mode: MountMode::ReadWrite,
            },
        );
        let host = to_host("/sessions/s1/mnt/projects/app/main.rs", Some(&mounts), &ctx()).unwrap();
        assert_eq!(host, PathBuf::from("/home/alice/src/app/main.rs"));
    }

    #[test]
    fn unknown_mount_falls_back_to_sessions_base() {
        let host = to_host("/sessions/s1/mnt/uploads/img.png", None, &ctx()).unwrap();
        assert_eq!(host, PathBuf::from("/data/sessions/s1/mnt/uploads/img.png"));
    }

    #[test]
    fn non_virtual_paths_pass_through() {
        let host = to_host("/home/alice/plain.txt", None, &ctx()).unwrap();
        assert_eq!(host, PathBuf::from("/home/alice/plain.txt"));
    }

    #[test]
    fn translation_is_idempotent() {
        let once = to_host("/sessions/s1/mnt/alice/a.txt", None, &ctx()).unwrap();
        let twice = to_host(once.to_str().unwrap(), None, &ctx()).unwrap();
        assert_eq!(once, twice);
    }

    #[test]
    fn dotdot_escape_is_rejected() {
        let err = to_host("/sessions/s1/mnt/alice/../../etc/passwd", None, &ctx()).unwrap_err();
        assert!(matches!(err, AgentboxError::PathTraversal { .. }));
    }

    #[test]
    fn dotdot_in_session_name_is_rejected() {
        let err = to_host("/sessions/../mnt/x/y", None, &ctx()).unwrap_err();
        assert!(matches!(err, AgentboxError::PathTraversal { .. }));
    }

    #[test]
    fn interior_dotdot_within_anchor_is_allowed() {
        let host = to_host("/sessions/s1/mnt/alice/a/../b.txt", None, &ctx()).unwrap();
        assert_eq!(host, PathBuf::from("/home/alice/b.txt"));
    }

    #[test]
    fn mount_root_without_rest_resolves() {
        let host = to_host("/sessions/s1/mnt/alice", None, &ctx()).unwrap();
        assert_eq!(host, PathBuf::from("/home/alice"));
    }
}
