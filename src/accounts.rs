//! User, group and membership directives.
//!
//! Each directive becomes a shadow-utils invocation run inside the target.
//! An id that already exists in the target renames the existing account
//! instead of adding a new one.

use anyhow::{Context, Result};
use std::fs;
use std::path::Path;

use crate::common::in_tree;
use crate::layer::{GroupEntry, IdValue, LayerConfig, Password, UserEntry};
use crate::target::Chroot;

/// Ids in this range get system accounts.
pub const SYSTEM_ID_RANGE: std::ops::RangeInclusive<u64> = 1..=999;

/// A program with arguments to run inside the target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccountCommand {
    pub program: &'static str,
    pub args: Vec<String>,
    pub stdin: Option<String>,
}

impl AccountCommand {
    fn new(program: &'static str, args: Vec<String>) -> Self {
        Self {
            program,
            args,
            stdin: None,
        }
    }

    pub fn run(&self, chroot: &mut Chroot) -> Result<()> {
        match self.stdin {
            Some(ref input) => chroot.run_with_input(self.program, &self.args, input)?,
            None => chroot.run(self.program, &self.args)?,
        };
        Ok(())
    }
}

/// Accounts present in the target's `/etc/passwd` and `/etc/group`.
#[derive(Debug, Clone, Default)]
pub struct AccountDb {
    users: Vec<(String, String)>,
    groups: Vec<(String, String)>,
}

fn parse_db(text: &str) -> Vec<(String, String)> {
    text.lines()
        .filter(|line| !line.trim().is_empty() && !line.starts_with('#'))
        .filter_map(|line| {
            let mut fields = line.split(':');
            let name = fields.next()?;
            let id = fields.nth(1)?;
            Some((name.to_string(), id.to_string()))
        })
        .collect()
}

impl AccountDb {
    pub fn parse(passwd: &str, group: &str) -> Self {
        Self {
            users: parse_db(passwd),
            groups: parse_db(group),
        }
    }

    /// Read the databases of `tree`; missing files are empty.
    pub fn load(tree: &Path) -> Result<Self> {
        let read = |path: &str| -> Result<String> {
            let file = in_tree(tree, path);
            match fs::read_to_string(&file) {
                Ok(text) => Ok(text),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(String::new()),
                Err(e) => Err(e).with_context(|| format!("Failed to read {}", file.display())),
            }
        };
        Ok(Self::parse(&read("/etc/passwd")?, &read("/etc/group")?))
    }

    pub fn user_by_id(&self, uid: &str) -> Option<&str> {
        self.users
            .iter()
            .find(|(_, id)| id == uid)
            .map(|(name, _)| name.as_str())
    }

    pub fn group_by_id(&self, gid: &str) -> Option<&str> {
        self.groups
            .iter()
            .find(|(_, id)| id == gid)
            .map(|(name, _)| name.as_str())
    }

    pub fn has_group(&self, name: &str) -> bool {
        self.groups.iter().any(|(group, _)| group == name)
    }
}

fn is_system_id(id: Option<&IdValue>) -> bool {
    id.and_then(IdValue::as_number)
        .is_some_and(|n| SYSTEM_ID_RANGE.contains(&n))
}

fn split_opts(extra: Option<&str>) -> Vec<String> {
    extra
        .map(|opts| opts.split_whitespace().map(str::to_string).collect())
        .unwrap_or_default()
}

/// Commands creating or renaming one user, then setting its password.
pub fn user_commands(key: &str, entry: &UserEntry, db: &AccountDb) -> Vec<AccountCommand> {
    let (uid, username, password, system, shell, home, extra) = match entry {
        UserEntry::Legacy(uid, password) => (
            Some(uid),
            key.to_string(),
            password.as_ref(),
            false,
            None,
            None,
            Vec::new(),
        ),
        UserEntry::Detailed(spec) => {
            let system = is_system_id(spec.uid.as_ref());
            let (default_shell, default_home) = if system {
                ("/bin/false".to_string(), String::new())
            } else {
                ("/bin/bash".to_string(), format!("/home/{}", spec.username))
            };
            let shell = spec.shell.clone().unwrap_or(default_shell);
            let home = spec.home.clone().unwrap_or(default_home);
            (
                spec.uid.as_ref(),
                spec.username.clone(),
                spec.password.as_ref(),
                system,
                Some(shell).filter(|s| !s.is_empty()),
                Some(home).filter(|h| !h.is_empty()),
                split_opts(spec.extra_opts.as_deref()),
            )
        }
    };

    let mut common = Vec::new();
    if let Some(ref shell) = shell {
        common.extend(["-s".to_string(), shell.clone()]);
    }
    if let Some(ref home) = home {
        common.extend(["-m".to_string(), "-d".to_string(), home.clone()]);
    }
    common.extend(["--comment".to_string(), username.clone()]);
    common.extend(extra);

    let uid_text = uid.map(IdValue::to_string);
    let previous = uid_text.as_deref().and_then(|id| db.user_by_id(id));

    let mut commands = Vec::new();
    match previous {
        Some(previous) => {
            let mut args = vec!["-l".to_string(), username.clone()];
            args.extend(common);
            args.push(previous.to_string());
            commands.push(AccountCommand::new("usermod", args));
            if matches!(entry, UserEntry::Detailed(_)) && db.has_group(previous) {
                commands.push(AccountCommand::new(
                    "groupmod",
                    vec!["-n".to_string(), username.clone(), previous.to_string()],
                ));
            }
        }
        None => {
            let mut args = Vec::new();
            if system {
                args.push("--system".to_string());
            }
            args.extend(common);
            if let Some(id) = uid_text {
                args.extend(["-u".to_string(), id]);
            }
            args.push(username.clone());
            commands.push(AccountCommand::new("useradd", args));
        }
    }

    match password {
        Some(Password::Clear(clear)) => commands.push(AccountCommand {
            program: "chpasswd",
            args: Vec::new(),
            stdin: Some(format!("{}:{}\n", username, clear)),
        }),
        Some(Password::Hashed { hashed }) => commands.push(AccountCommand::new(
            "usermod",
            vec!["-p".to_string(), hashed.clone(), username],
        )),
        None => {}
    }

    commands
}

/// Command creating or renaming one group.
pub fn group_command(key: &str, entry: &GroupEntry, db: &AccountDb) -> AccountCommand {
    let (gid, name, extra) = match entry {
        GroupEntry::Gid(gid) => (Some(gid), key.to_string(), Vec::new()),
        GroupEntry::Detailed(spec) => (
            spec.gid.as_ref(),
            spec.groupname.clone(),
            split_opts(spec.extra_opts.as_deref()),
        ),
    };

    let gid_text = gid.map(IdValue::to_string);
    if let Some(previous) = gid_text.as_deref().and_then(|id| db.group_by_id(id)) {
        let mut args = vec!["-n".to_string(), name];
        args.extend(extra);
        args.push(previous.to_string());
        return AccountCommand::new("groupmod", args);
    }

    let mut args = Vec::new();
    if is_system_id(gid) {
        args.push("--system".to_string());
    }
    args.extend(extra);
    if let Some(id) = gid_text {
        args.extend(["-g".to_string(), id]);
    }
    args.push(name);
    AccountCommand::new("groupadd", args)
}

pub fn membership_command(user: &str, groups: &[String]) -> Option<AccountCommand> {
    if groups.is_empty() {
        return None;
    }
    Some(AccountCommand::new(
        "usermod",
        vec![
            "-a".to_string(),
            "-G".to_string(),
            groups.join(","),
            user.to_string(),
        ],
    ))
}

/// Apply the users, then groups, then memberships of `config`.
///
/// The account databases are re-read before each section so renames made
/// by an earlier section are seen.
pub fn apply(chroot: &mut Chroot, config: &LayerConfig) -> Result<()> {
    if config.users.is_empty() && config.groups.is_empty() && config.memberships.is_empty() {
        return Ok(());
    }

    if !config.users.is_empty() {
        let db = AccountDb::load(chroot.root())?;
        for (key, entry) in config.users.iter() {
            for command in user_commands(key, entry, &db) {
                command
                    .run(chroot)
                    .with_context(|| format!("Failed to set up user '{}'", key))?;
            }
        }
        tracing::info!("Configured {} users", config.users.len());
    }

    if !config.groups.is_empty() {
        let db = AccountDb::load(chroot.root())?;
        for (key, entry) in config.groups.iter() {
            group_command(key, entry, &db)
                .run(chroot)
                .with_context(|| format!("Failed to set up group '{}'", key))?;
        }
        tracing::info!("Configured {} groups", config.groups.len());
    }

    for (user, groups) in config.memberships.iter() {
        if let Some(command) = membership_command(user, groups) {
            command
                .run(chroot)
                .with_context(|| format!("Failed to set memberships of '{}'", user))?;
        }
    }

    Ok(())
}
