//! Running programs inside the target tree.
//!
//! The tree gets read-only bind mounts of `/dev`, `/sys` and `/proc` the
//! first time something runs in it. A user-mode emulator is copied in when
//! configured, for foreign-architecture targets. Teardown is advisory: a
//! mount that refuses to go away is logged, not fatal.

use anyhow::{Context, Result};
use std::fs;
use std::path::{Path, PathBuf};

use crate::common::in_tree;
use crate::process::{Cmd, CommandResult};

/// Host pseudo-filesystems bound into the target.
pub const BIND_MOUNTS: [&str; 3] = ["/dev", "/sys", "/proc"];

/// Where the emulator binary goes inside the target.
const EMULATOR_DIR: &str = "/usr/bin";

pub struct Chroot {
    root: PathBuf,
    emulator: Option<PathBuf>,
    mounted: Vec<PathBuf>,
    prepared: bool,
}

impl Chroot {
    pub fn new(root: impl Into<PathBuf>, emulator: Option<PathBuf>) -> Self {
        Self {
            root: root.into(),
            emulator,
            mounted: Vec::new(),
            prepared: false,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn is_prepared(&self) -> bool {
        self.prepared
    }

    /// Copy the emulator in and bind the pseudo-filesystems. Idempotent.
    pub fn prepare(&mut self) -> Result<()> {
        if self.prepared {
            return Ok(());
        }

        if let Some(ref emulator) = self.emulator {
            let name = emulator
                .file_name()
                .with_context(|| format!("Emulator path {} has no file name", emulator.display()))?;
            let dest = in_tree(&self.root, EMULATOR_DIR).join(name);
            if let Some(parent) = dest.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::copy(emulator, &dest).with_context(|| {
                format!("Failed to copy emulator {} into target", emulator.display())
            })?;
            tracing::debug!("Copied emulator to {}", dest.display());
        }

        for source in BIND_MOUNTS {
            let mount_point = in_tree(&self.root, source);
            fs::create_dir_all(&mount_point)
                .with_context(|| format!("Failed to create {}", mount_point.display()))?;
            Cmd::new("mount")
                .args(["--bind", "-r", source])
                .arg_path(&mount_point)
                .error_msg(format!("Failed to bind {} into the target", source))
                .run()?;
            self.mounted.push(mount_point.clone());
            // Older kernels ignore -r on the initial bind.
            Cmd::new("mount")
                .args(["-o", "remount,ro,bind"])
                .arg_path(&mount_point)
                .error_msg(format!("Failed to remount {} read-only", mount_point.display()))
                .run()?;
        }

        self.prepared = true;
        Ok(())
    }

    /// `chroot <root> <program> <args>`, not yet run.
    pub fn command<I, S>(&self, program: &str, args: I) -> Cmd
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Cmd::new("chroot").arg_path(&self.root).arg(program).args(args)
    }

    /// Run a program in the target, preparing it first.
    pub fn run<I, S>(&mut self, program: &str, args: I) -> Result<CommandResult>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.prepare()?;
        self.command(program, args).run()
    }

    /// Run a program in the target with `input` on stdin.
    pub fn run_with_input<I, S>(&mut self, program: &str, args: I, input: &str) -> Result<CommandResult>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.prepare()?;
        self.command(program, args).stdin(input).run()
    }

    /// Run a program in the target with output on the terminal.
    pub fn run_interactive<I, S>(&mut self, program: &str, args: I) -> Result<()>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.prepare()?;
        self.command(program, args).run_interactive()?;
        Ok(())
    }

    /// Unmount everything bound by [`Chroot::prepare`], newest first.
    pub fn teardown(&mut self) {
        while let Some(mount_point) = self.mounted.pop() {
            if let Err(e) = Cmd::new("umount").arg_path(&mount_point).advisory().run() {
                tracing::warn!("Failed to unmount {}: {:#}", mount_point.display(), e);
            }
        }
        if self.prepared {
            tracing::debug!("Released target {}", self.root.display());
        }
        self.prepared = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_line() {
        let chroot = Chroot::new("/work/targetfs", None);
        let cmd = chroot.command("bash", ["/tmp/setup.sh"]);
        assert_eq!(cmd.describe(), "chroot /work/targetfs bash /tmp/setup.sh");
    }

    #[test]
    fn test_teardown_without_prepare_is_noop() {
        let mut chroot = Chroot::new("/nonexistent", None);
        chroot.teardown();
        assert!(!chroot.is_prepared());
    }
}
