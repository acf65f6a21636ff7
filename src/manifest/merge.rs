//! Field-wise merge of a layer document onto its parent's frozen manifest.
//!
//! Each field has one [`Strategy`]; [`freeze`] walks [`STRATEGIES`] and
//! applies it. Fields not in the table keep the child's value.

use serde_json::{Map, Value};

use crate::layer::DEBIAN_MIRROR;

/// How same-key sequences combine inside a keyed merge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListPolicy {
    Replace,
    Append,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    /// The parent's value, once inherited.
    Parent,
    /// Points at the parent's frozen manifest.
    Rebase,
    /// `{Path, Type}` entries, unique by `Path`, last value at first position.
    UnionByPath,
    /// `{Manifest, ...}` entries, parent then child.
    Concat,
    /// Unique values, order of first appearance.
    Union,
    /// Recursive key-wise merge.
    Merge(ListPolicy),
    /// Replaced by the installed package set.
    Recompute,
}

pub const STRATEGIES: &[(&str, Strategy)] = &[
    ("OS", Strategy::Parent),
    ("Base", Strategy::Rebase),
    ("Mirrors", Strategy::UnionByPath),
    ("CopyTargets", Strategy::Concat),
    ("FilesystemCleanup", Strategy::Union),
    ("FilesystemInclude", Strategy::Union),
    ("AssociatedFilesystems", Strategy::Union),
    ("Users", Strategy::Merge(ListPolicy::Replace)),
    ("Groups", Strategy::Merge(ListPolicy::Replace)),
    ("Mounts", Strategy::Merge(ListPolicy::Replace)),
    ("PreInstalls", Strategy::Merge(ListPolicy::Replace)),
    ("PostInstalls", Strategy::Merge(ListPolicy::Replace)),
    ("Memberships", Strategy::Merge(ListPolicy::Append)),
    ("DebianPackages", Strategy::Recompute),
];

pub fn strategy_for(field: &str) -> Option<Strategy> {
    STRATEGIES
        .iter()
        .find(|(name, _)| *name == field)
        .map(|(_, strategy)| *strategy)
}

/// The document a layer freezes on top of.
#[derive(Debug, Clone)]
pub struct ParentManifest {
    pub doc: Map<String, Value>,
    /// What `Base` becomes; `None` keeps the child's own `Base`.
    pub reference: Option<String>,
}

/// Freeze `child` onto `parent`.
///
/// `packages` is the live `name=version` set of the built tree.
pub fn freeze(
    child: &Map<String, Value>,
    parent: Option<&ParentManifest>,
    packages: &[String],
) -> Map<String, Value> {
    let mut frozen = child.clone();

    for (field, strategy) in STRATEGIES {
        let own = child.get(*field);
        let inherited = parent.and_then(|p| p.doc.get(*field));

        let merged = match strategy {
            Strategy::Recompute => Some(Value::Array(
                packages.iter().cloned().map(Value::String).collect(),
            )),
            Strategy::UnionByPath => Some(union_by_path(inherited, own)),
            Strategy::Concat => Some(concat_manifests(inherited, own)),
            _ if parent.is_none() => continue,
            Strategy::Parent => inherited.or(own).cloned(),
            Strategy::Rebase => match parent.and_then(|p| p.reference.as_ref()) {
                Some(reference) => Some(Value::String(reference.clone())),
                None => own.cloned(),
            },
            Strategy::Union => Some(union(inherited, own)),
            Strategy::Merge(policy) => Some(merge_maps(inherited, own, *policy)),
        };

        if let Some(value) = merged {
            frozen.insert((*field).to_string(), value);
        }
    }

    frozen
}

fn items(value: Option<&Value>) -> &[Value] {
    match value {
        Some(Value::Array(items)) => items,
        _ => &[],
    }
}

fn union(parent: Option<&Value>, child: Option<&Value>) -> Value {
    let mut out: Vec<Value> = Vec::new();
    for item in items(parent).iter().chain(items(child)) {
        if !out.contains(item) {
            out.push(item.clone());
        }
    }
    Value::Array(out)
}

fn normalize_mirror(item: &Value) -> Value {
    match item {
        Value::String(path) => {
            let mut entry = Map::new();
            entry.insert("Path".to_string(), Value::String(path.clone()));
            entry.insert("Type".to_string(), Value::String(DEBIAN_MIRROR.to_string()));
            Value::Object(entry)
        }
        other => other.clone(),
    }
}

fn union_by_path(parent: Option<&Value>, child: Option<&Value>) -> Value {
    let mut out: Vec<Value> = Vec::new();
    for item in items(parent).iter().chain(items(child)) {
        let entry = normalize_mirror(item);
        let path = entry.get("Path").cloned();
        match out.iter_mut().find(|e| e.get("Path").cloned() == path) {
            Some(existing) => *existing = entry,
            None => out.push(entry),
        }
    }
    Value::Array(out)
}

fn concat_manifests(parent: Option<&Value>, child: Option<&Value>) -> Value {
    let out = items(parent)
        .iter()
        .chain(items(child))
        .map(|item| match item {
            Value::String(manifest) => {
                let mut entry = Map::new();
                entry.insert("Manifest".to_string(), Value::String(manifest.clone()));
                Value::Object(entry)
            }
            other => other.clone(),
        })
        .collect();
    Value::Array(out)
}

fn merge_maps(parent: Option<&Value>, child: Option<&Value>, policy: ListPolicy) -> Value {
    match (parent, child) {
        (Some(Value::Object(base)), Some(Value::Object(update))) => {
            Value::Object(deep_merge(base.clone(), update, policy))
        }
        (Some(base), None) => base.clone(),
        (_, Some(update)) => update.clone(),
        (None, None) => Value::Object(Map::new()),
    }
}

/// Merge `update` into `base`: nested objects recurse, same-key arrays follow
/// `policy`, anything else is overwritten.
pub fn deep_merge(
    mut base: Map<String, Value>,
    update: &Map<String, Value>,
    policy: ListPolicy,
) -> Map<String, Value> {
    for (key, value) in update {
        match (base.get_mut(key), value) {
            (Some(Value::Object(inner)), Value::Object(patch)) => {
                *inner = deep_merge(std::mem::take(inner), patch, policy);
            }
            (Some(Value::Array(existing)), Value::Array(extra)) if policy == ListPolicy::Append => {
                existing.extend(extra.iter().cloned());
            }
            (Some(slot), _) => *slot = value.clone(),
            (None, _) => {
                base.insert(key.clone(), value.clone());
            }
        }
    }
    base
}
