mod bwrap;

pub use bwrap::{build_args, SandboxSpec};

use std::process::Stdio;

/// Check that the bubblewrap helper is available on this host.
///
/// Probed once per process; spawning through a missing helper would fail with
/// a confusing ENOENT long after validation.
pub fn bwrap_available() -> bool {
    static AVAILABLE: std::sync::OnceLock<bool> = std::sync::OnceLock::new();
    *AVAILABLE.get_or_init(|| {
        std::process::Command::new("bwrap")
            .arg("--version")
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .map(|s| s.success())
            .unwrap_or(false)
    })
}
