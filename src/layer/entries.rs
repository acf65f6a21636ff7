//! Typed entries of a layer configuration.
//!
//! Several fields accept a short and a long form (`"pkg"` or
//! `{"Package": "pkg", "Module": "core"}`); each is an untagged enum so the
//! rest of the crate only matches on variants.

use serde::de::{Deserializer, MapAccess, Visitor};
use serde::Deserialize;
use std::fmt;
use std::marker::PhantomData;

/// Mirror type understood by the sources.list rewrite.
pub const DEBIAN_MIRROR: &str = "debian_mirror";

/// A JSON mapping whose key order is kept.
///
/// Script and account directives run in declaration order.
#[derive(Debug, Clone, PartialEq)]
pub struct OrderedMap<T>(pub Vec<(String, T)>);

impl<T> Default for OrderedMap<T> {
    fn default() -> Self {
        Self(Vec::new())
    }
}

impl<T> OrderedMap<T> {
    pub fn iter(&self) -> impl Iterator<Item = (&str, &T)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn get(&self, key: &str) -> Option<&T> {
        self.0.iter().find(|(k, _)| k == key).map(|(_, v)| v)
    }
}

impl<'de, T: Deserialize<'de>> Deserialize<'de> for OrderedMap<T> {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct OrderedVisitor<T>(PhantomData<T>);

        impl<'de, T: Deserialize<'de>> Visitor<'de> for OrderedVisitor<T> {
            type Value = OrderedMap<T>;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str("a mapping")
            }

            fn visit_map<A: MapAccess<'de>>(self, mut access: A) -> Result<Self::Value, A::Error> {
                let mut entries = Vec::with_capacity(access.size_hint().unwrap_or(0));
                while let Some((key, value)) = access.next_entry::<String, T>()? {
                    entries.retain(|(k, _): &(String, T)| *k != key);
                    entries.push((key, value));
                }
                Ok(OrderedMap(entries))
            }
        }

        deserializer.deserialize_map(OrderedVisitor(PhantomData))
    }
}

/// A numeric id that configs write either as a number or a string.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum IdValue {
    Number(u64),
    Text(String),
}

impl IdValue {
    pub fn as_number(&self) -> Option<u64> {
        match self {
            IdValue::Number(n) => Some(*n),
            IdValue::Text(s) => s.trim().parse().ok(),
        }
    }
}

impl fmt::Display for IdValue {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            IdValue::Number(n) => write!(f, "{}", n),
            IdValue::Text(s) => f.write_str(s),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum PackageEntry {
    Assigned {
        #[serde(rename = "Package")]
        package: String,
        #[serde(rename = "Module")]
        module: String,
    },
    Name(String),
}

impl PackageEntry {
    pub fn package(&self) -> &str {
        match self {
            PackageEntry::Name(name) => name,
            PackageEntry::Assigned { package, .. } => package,
        }
    }

    /// Explicit module, case-folded.
    pub fn module(&self) -> Option<String> {
        match self {
            PackageEntry::Name(_) => None,
            PackageEntry::Assigned { module, .. } => Some(module.to_lowercase()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum MirrorEntry {
    Typed {
        #[serde(rename = "Path")]
        path: String,
        #[serde(rename = "Type")]
        kind: String,
    },
    Line(String),
}

impl MirrorEntry {
    pub fn path(&self) -> &str {
        match self {
            MirrorEntry::Line(line) => line,
            MirrorEntry::Typed { path, .. } => path,
        }
    }

    pub fn kind(&self) -> &str {
        match self {
            MirrorEntry::Line(_) => DEBIAN_MIRROR,
            MirrorEntry::Typed { kind, .. } => kind,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ArgEdits {
    #[serde(default)]
    pub add: Option<String>,
    #[serde(default)]
    pub del: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum CopyTargetEntry {
    Detailed {
        #[serde(rename = "Manifest")]
        manifest: String,
        #[serde(rename = "NvWorkspace", default)]
        workspace: Option<String>,
        #[serde(rename = "SourceType", default)]
        source_type: Option<String>,
        #[serde(rename = "Args", default)]
        args: Option<ArgEdits>,
    },
    Manifest(String),
}

impl CopyTargetEntry {
    pub fn manifest(&self) -> &str {
        match self {
            CopyTargetEntry::Manifest(path) => path,
            CopyTargetEntry::Detailed { manifest, .. } => manifest,
        }
    }
}

/// Where a pre/post-install script runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScriptLocation {
    /// On the build host.
    Host,
    /// Inside the target, script path as seen from the target.
    Target,
    /// Copied from the host into the target, run there, then removed.
    TargetCopy,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum Password {
    Hashed {
        #[serde(rename = "HashedPassword")]
        hashed: String,
    },
    Clear(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct UserSpec {
    #[serde(rename = "UID", default)]
    pub uid: Option<IdValue>,
    pub username: String,
    #[serde(default)]
    pub password: Option<Password>,
    #[serde(default)]
    pub shell: Option<String>,
    #[serde(default)]
    pub home: Option<String>,
    #[serde(default)]
    pub extra_opts: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum UserEntry {
    /// `[uid, password]`; the map key is the user name.
    Legacy(IdValue, Option<Password>),
    Detailed(UserSpec),
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct GroupSpec {
    #[serde(rename = "GID", default)]
    pub gid: Option<IdValue>,
    pub groupname: String,
    #[serde(default)]
    pub extra_opts: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum GroupEntry {
    /// Bare gid; the map key is the group name.
    Gid(IdValue),
    Detailed(GroupSpec),
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct MountSpec {
    pub device: String,
    #[serde(rename = "Type")]
    pub fs_type: String,
    pub mount_options: String,
}
