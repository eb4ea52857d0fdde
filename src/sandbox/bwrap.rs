use std::ffi::OsString;
use std::path::Path;

use crate::vfs::MountMap;

/// System roots always bound read-only into the sandbox.
const SYSTEM_RO_BINDS: &[&str] = &["/usr", "/bin", "/lib", "/etc"];

/// System roots bound read-only only when they exist on this host; binding a
/// nonexistent source is a hard error in bwrap.
const OPTIONAL_RO_BINDS: &[&str] = &["/lib64", "/lib32", "/opt", "/snap", "/nix"];

/// Everything `build_args` needs to describe one worker sandbox.
///
/// The sandbox is deny-by-default: an empty tmpfs root with an explicit
/// allow-list of binds, the closest Linux-native analogue of the VM the
/// workload originally ran in. Host runtime/IPC socket directories and
/// mutable system state are deliberately never mounted.
pub struct SandboxSpec<'a> {
    /// Session name; shapes the `/sessions/<name>/mnt` tree inside the root
    pub session: &'a str,
    /// Resolved mount bindings for this spawn
    pub mounts: &'a MountMap,
    /// Real home directory, bound read-write onto itself
    pub home: &'a Path,
    /// Mount name of the invoking user; its mount point is the default cwd
    pub user_mount: &'a str,
    /// Working directory inside the sandbox, when the caller supplies one
    pub cwd: Option<&'a str>,
    /// Give the worker its own network namespace
    pub isolate_network: bool,
}

/// Build the bwrap argument vector for one worker process.
///
/// Order matters: namespaces first, then the tmpfs root, then binds from
/// least to most specific, so session mounts override anything beneath them.
pub fn build_args(spec: &SandboxSpec<'_>, executable: &Path, args: &[String]) -> Vec<OsString> {
    let mut argv: Vec<OsString> = Vec::new();
    let mut push = |s: &str| argv.push(OsString::from(s));

    // New user namespace mapped to the invoking uid/gid; the sandbox dies
    // with the supervisor so workers cannot be orphaned.
    push("--unshare-user");
    push("--die-with-parent");
    if spec.isolate_network {
        push("--unshare-net");
    }

    // Empty root; everything visible below is an explicit allow.
    push("--tmpfs");
    push("/");

    for dir in SYSTEM_RO_BINDS {
        push("--ro-bind");
        push(dir);
        push(dir);
    }
    for dir in OPTIONAL_RO_BINDS {
        if Path::new(dir).exists() {
            push("--ro-bind");
            push(dir);
            push(dir);
        }
    }

    // Only the invoking user's home, not all of /home.
    argv.push(OsString::from("--bind"));
    argv.push(spec.home.as_os_str().to_os_string());
    argv.push(spec.home.as_os_str().to_os_string());

    // Private /tmp; the host's would leak other users' files.
    argv.push(OsString::from("--tmpfs"));
    argv.push(OsString::from("/tmp"));
    argv.push(OsString::from("--dev"));
    argv.push(OsString::from("/dev"));
    argv.push(OsString::from("--proc"));
    argv.push(OsString::from("/proc"));

    // Virtual session tree the worker expects, each mount bound per its mode.
    let mnt_root = format!("/sessions/{}/mnt", spec.session);
    argv.push(OsString::from("--dir"));
    argv.push(OsString::from(&mnt_root));
    for (name, entry) in spec.mounts {
        let target = format!("{mnt_root}/{name}");
        argv.push(OsString::from("--dir"));
        argv.push(OsString::from(&target));
        argv.push(OsString::from(if entry.mode.is_read_only() {
            "--ro-bind"
        } else {
            "--bind"
        }));
        argv.push(entry.host_path.as_os_str().to_os_string());
        argv.push(OsString::from(target));
    }

    let cwd = spec
        .cwd
        .map(str::to_string)
        .unwrap_or_else(|| format!("{mnt_root}/{}", spec.user_mount));
    argv.push(OsString::from("--chdir"));
    argv.push(OsString::from(cwd));

    argv.push(OsString::from("--"));
    argv.push(executable.as_os_str().to_os_string());
    for arg in args {
        argv.push(OsString::from(arg));
    }

    argv
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vfs::{MountEntry, MountMode};
    use std::path::PathBuf;

    fn spec_args(mounts: &MountMap, isolate_network: bool, cwd: Option<&str>) -> Vec<String> {
        let spec = SandboxSpec {
            session: "s1",
            mounts,
            home: Path::new("/home/alice"),
            user_mount: "alice",
            cwd,
            isolate_network,
        };
        build_args(&spec, Path::new("/opt/worker/agent-worker"), &["--serve".to_string()])
            .into_iter()
            .map(|s| s.into_string().unwrap())
            .collect()
    }

    fn position(args: &[String], needle: &str) -> usize {
        args.iter()
            .position(|a| a == needle)
            .unwrap_or_else(|| panic!("'{needle}' not in {args:?}"))
    }

    #[test]
    fn namespaces_come_before_the_root() {
        let args = spec_args(&MountMap::new(), false, None);
        assert_eq!(args[0], "--unshare-user");
        assert_eq!(args[1], "--die-with-parent");
        assert!(position(&args, "--tmpfs") > position(&args, "--die-with-parent"));
        assert!(!args.contains(&"--unshare-net".to_string()));
    }

    #[test]
    fn network_namespace_is_opt_in() {
        let args = spec_args(&MountMap::new(), true, None);
        assert!(args.contains(&"--unshare-net".to_string()));
    }

    #[test]
    fn system_binds_are_read_only_and_probed() {
        let args = spec_args(&MountMap::new(), false, None);
        for dir in SYSTEM_RO_BINDS {
            let i = position(&args, dir);
            assert_eq!(args[i - 1], "--ro-bind");
            assert_eq!(args[i + 1], *dir);
        }
        for dir in OPTIONAL_RO_BINDS {
            assert_eq!(
                args.contains(&dir.to_string()),
                Path::new(dir).exists(),
                "{dir} bind must match host existence"
            );
        }
    }

    #[test]
    fn home_is_the_only_rw_system_bind() {
        let args = spec_args(&MountMap::new(), false, None);
        let i = position(&args, "/home/alice");
        assert_eq!(args[i - 1], "--bind");
        assert!(!args.contains(&"/home".to_string()));
    }

    #[test]
    fn session_mounts_follow_their_modes() {
        let mut mounts = MountMap::new();
        mounts.insert(
            "skills".to_string(),
            MountEntry {
                host_path: PathBuf::from("/home/alice/.cache/agentbox/skills"),
                mode: MountMode::ReadOnly,
            },
        );
        mounts.insert(
            "uploads".to_string(),
            MountEntry {
                host_path: PathBuf::from("/data/sessions/s1/uploads"),
                mode: MountMode::ReadWrite,
            },
        );
        let args = spec_args(&mounts, false, None);

        let skills = position(&args, "/sessions/s1/mnt/skills");
        assert_eq!(args[skills - 1], "--dir");
        assert_eq!(args[skills + 1], "--ro-bind");

        let uploads = position(&args, "/sessions/s1/mnt/uploads");
        assert_eq!(args[uploads + 1], "--bind");
        assert_eq!(args[uploads + 2], "/data/sessions/s1/uploads");
    }

    #[test]
    fn cwd_defaults_to_the_user_mount() {
        let args = spec_args(&MountMap::new(), false, None);
        let i = position(&args, "--chdir");
        assert_eq!(args[i + 1], "/sessions/s1/mnt/alice");

        let args = spec_args(&MountMap::new(), false, Some("/sessions/s1/mnt/uploads"));
        let i = position(&args, "--chdir");
        assert_eq!(args[i + 1], "/sessions/s1/mnt/uploads");
    }

    #[test]
    fn command_follows_the_terminator() {
        let args = spec_args(&MountMap::new(), false, None);
        let i = position(&args, "--");
        assert_eq!(args[i + 1], "/opt/worker/agent-worker");
        assert_eq!(args[i + 2], "--serve");
        assert_eq!(args.len(), i + 3);
    }
}
