//! Host tool availability checks.

use super::types::CheckResult;

/// (tool, package, what it is needed for)
const REQUIRED_TOOLS: [(&str, &str, &str); 11] = [
    ("tar", "tar", "base extraction and tarball output"),
    ("bzip2", "bzip2", "tarball output compression"),
    ("cp", "coreutils", "directory bases and image population"),
    ("du", "coreutils", "ledger cross-check"),
    ("dd", "coreutils", "image allocation"),
    ("chroot", "coreutils", "package installation and target scripts"),
    ("bash", "bash", "pre/post-install scripts"),
    ("mount", "mount", "image bases and bind mounts"),
    ("umount", "mount", "image bases and bind mounts"),
    ("mke2fs", "e2fsprogs", "image formatting"),
    ("e2fsck", "e2fsprogs", "e2fsprogs version detection"),
];

pub fn check_host_tools(python: &str) -> Vec<CheckResult> {
    let mut results: Vec<CheckResult> = REQUIRED_TOOLS
        .iter()
        .map(|(tool, package, purpose)| check_tool(tool, package, purpose, true))
        .collect();

    // Only layers with YAML CopyTargets need it.
    results.push(check_tool(python, "python3", "content placement tool", false));
    results
}

fn check_tool(tool: &str, package: &str, purpose: &str, required: bool) -> CheckResult {
    match which::which(tool) {
        Ok(path) => CheckResult::pass(tool, path.display().to_string()),
        Err(_) => CheckResult::missing(
            tool,
            format!("Not found. Install '{}' (needed for {})", package, purpose),
            required,
        ),
    }
}
