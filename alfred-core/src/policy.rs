//! Role-based projection of the state document.
//!
//! A node in the document may be wrapped as `{"data": X, "meta": Y}`, where
//! `Y` describes which roles may see or change `X` at that scope. Walking
//! down the tree accumulates those descriptors into a per-operation permitted
//! set; projecting a subtree rebuilds it with everything the caller's roles
//! do not permit redacted away. Redaction is not an error: it surfaces as
//! omitted object keys, dropped array entries, or `null` at the top level.
//!
//! An empty held-role set denotes the internal administrative path: it passes
//! every check and receives the plain data tree with wrappers stripped.

use std::collections::BTreeSet;

use serde_json::{Map, Value, json};

use crate::error::StoreError;

/// A set of role names. Set semantics collapse duplicates; ordering never
/// affects projection results.
pub type RoleSet = BTreeSet<String>;

/// Convenience constructors for commonly used role sets.
pub mod roles {
    use super::RoleSet;

    /// Builds a role set from names.
    pub fn held<'a, I>(names: I) -> RoleSet
    where
        I: IntoIterator<Item = &'a str>,
    {
        names.into_iter().map(str::to_owned).collect()
    }

    /// The internal administrative caller: no roles, passes every check.
    #[must_use]
    pub fn admin() -> RoleSet {
        RoleSet::new()
    }

    /// The fixed role set used for anonymous HTTP reads.
    #[must_use]
    pub fn public() -> RoleSet {
        held(["public"])
    }
}

/// Operations a policy descriptor can gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    /// Visibility of `data` at this scope.
    ReadData,
    /// Visibility of `meta` at this scope.
    ReadMeta,
    /// Replacing existing values (reserved for internal use).
    WriteData,
    /// Replacing metadata (reserved).
    WriteMeta,
    /// Introducing new keys (reserved for internal use).
    CreateData,
    /// Removing keys (reserved).
    DeleteData,
}

impl Operation {
    const COUNT: usize = 6;

    /// Maps a descriptor key to its operation. The suffixed `create_data` /
    /// `delete_data` spellings are canonical; anything else is ignored.
    fn from_key(key: &str) -> Option<Self> {
        match key {
            "read_data" => Some(Self::ReadData),
            "read_meta" => Some(Self::ReadMeta),
            "write_data" => Some(Self::WriteData),
            "write_meta" => Some(Self::WriteMeta),
            "create_data" => Some(Self::CreateData),
            "delete_data" => Some(Self::DeleteData),
            _ => None,
        }
    }

    /// Descriptor key for this operation, used in diagnostics.
    #[must_use]
    pub const fn as_key(self) -> &'static str {
        match self {
            Self::ReadData => "read_data",
            Self::ReadMeta => "read_meta",
            Self::WriteData => "write_data",
            Self::WriteMeta => "write_meta",
            Self::CreateData => "create_data",
            Self::DeleteData => "delete_data",
        }
    }

    const fn index(self) -> usize {
        match self {
            Self::ReadData => 0,
            Self::ReadMeta => 1,
            Self::WriteData => 2,
            Self::WriteMeta => 3,
            Self::CreateData => 4,
            Self::DeleteData => 5,
        }
    }
}

/// Permitted roles for one operation at the current scope.
///
/// `Any` is the state before any policy constrains the operation; a
/// `require` replaces it with a concrete set.
#[derive(Debug, Clone)]
enum Permitted {
    Any,
    Roles(RoleSet),
}

impl Permitted {
    fn union(&mut self, extra: &RoleSet) {
        if let Self::Roles(current) = self {
            current.extend(extra.iter().cloned());
        }
    }
}

/// The six permitted sets accumulated while descending the tree.
///
/// Data is readable until a policy restricts it; metadata and every write
/// operation are denied until a policy grants them.
#[derive(Debug, Clone)]
pub struct RolesPermitted {
    slots: [Permitted; Operation::COUNT],
}

impl Default for RolesPermitted {
    fn default() -> Self {
        let mut slots = [const { Permitted::Roles(RoleSet::new()) }; Operation::COUNT];
        slots[Operation::ReadData.index()] = Permitted::Any;
        Self { slots }
    }
}

impl RolesPermitted {
    /// Folds one policy descriptor into the accumulated sets: `require.K`
    /// replaces the set for K, `allow.K` unions into it, and allowing a
    /// write implies allowing the corresponding read.
    pub fn apply(&mut self, meta: &Value) {
        let Some(meta) = meta.as_object() else {
            return;
        };
        if let Some(require) = meta.get("require").and_then(Value::as_object) {
            for (key, entry) in require {
                if let Some(operation) = Operation::from_key(key) {
                    self.slots[operation.index()] = Permitted::Roles(role_list(entry));
                }
            }
        }
        if let Some(allow) = meta.get("allow").and_then(Value::as_object) {
            for (key, entry) in allow {
                let Some(operation) = Operation::from_key(key) else {
                    continue;
                };
                let extra = role_list(entry);
                self.slots[operation.index()].union(&extra);
                match operation {
                    Operation::WriteData => self.slots[Operation::ReadData.index()].union(&extra),
                    Operation::WriteMeta => self.slots[Operation::ReadMeta.index()].union(&extra),
                    _ => {}
                }
            }
        }
    }

    /// Whether `held` permits `operation` at this scope. An empty held set
    /// is the administrative caller and always passes.
    #[must_use]
    pub fn permits(&self, held: &RoleSet, operation: Operation) -> bool {
        if held.is_empty() {
            return true;
        }
        match &self.slots[operation.index()] {
            Permitted::Any => true,
            Permitted::Roles(permitted) => !permitted.is_disjoint(held),
        }
    }
}

fn role_list(entry: &Value) -> RoleSet {
    entry
        .as_array()
        .map(|list| {
            list.iter()
                .filter_map(Value::as_str)
                .map(str::to_owned)
                .collect()
        })
        .unwrap_or_default()
}

/// Splits a wrapper node into its `data` child and optional `meta`
/// descriptor. Any other keys on the wrapper are ignored.
fn as_wrapper(node: &Value) -> Option<(&Value, Option<&Value>)> {
    let entries = node.as_object()?;
    let data = entries.get("data")?;
    Some((data, entries.get("meta")))
}

/// Outcome of projecting one node: either a visible value, or the internal
/// redaction sentinel that is never handed to callers directly.
#[derive(Debug, Clone, PartialEq)]
enum Projection {
    Redacted,
    Visible(Value),
}

impl Projection {
    fn or_null(self) -> Value {
        match self {
            Self::Redacted => Value::Null,
            Self::Visible(value) => value,
        }
    }
}

/// Follows `path` from `root`, stepping transparently through wrapper nodes
/// and folding their descriptors into `permitted`. Returns the addressed
/// node, or `None` when a key is missing or a non-object is indexed.
///
/// The final node is returned still wrapped; projection applies its own
/// descriptor.
fn descend<'tree>(
    root: &'tree Value,
    path: &[&str],
    permitted: &mut RolesPermitted,
) -> Option<&'tree Value> {
    let mut node = root;
    for key in path {
        while let Some((data, meta)) = as_wrapper(node) {
            if let Some(meta) = meta {
                permitted.apply(meta);
            }
            node = data;
        }
        node = node.as_object()?.get(*key)?;
    }
    Some(node)
}

fn project(node: &Value, permitted: &RolesPermitted, held: &RoleSet, gate: Operation) -> Projection {
    if let Some((data, meta)) = as_wrapper(node) {
        let mut permitted = permitted.clone();
        if let Some(meta) = meta {
            permitted.apply(meta);
            // Non-administrative callers holding read_meta see the wrapper
            // itself, with the metadata branch gated by read_meta so that it
            // too can be role-redacted.
            if !held.is_empty() && permitted.permits(held, Operation::ReadMeta) {
                let data_view = project(data, &permitted, held, gate).or_null();
                let meta_view = project(meta, &permitted, held, Operation::ReadMeta).or_null();
                return Projection::Visible(json!({ "data": data_view, "meta": meta_view }));
            }
        }
        return project(data, &permitted, held, gate);
    }
    match node {
        Value::Object(entries) => {
            let mut view = Map::new();
            for (key, value) in entries {
                if let Projection::Visible(projected) = project(value, permitted, held, gate) {
                    view.insert(key.clone(), projected);
                }
            }
            // An object stays structurally visible when any descendant is
            // readable, even if this scope itself is not.
            if permitted.permits(held, gate) || !view.is_empty() {
                Projection::Visible(Value::Object(view))
            } else {
                Projection::Redacted
            }
        }
        Value::Array(entries) => {
            if permitted.permits(held, gate) {
                let view = entries
                    .iter()
                    .filter_map(|entry| match project(entry, permitted, held, gate) {
                        Projection::Visible(projected) => Some(projected),
                        Projection::Redacted => None,
                    })
                    .collect();
                Projection::Visible(Value::Array(view))
            } else {
                Projection::Redacted
            }
        }
        scalar => {
            if permitted.permits(held, gate) {
                Projection::Visible(scalar.clone())
            } else {
                Projection::Redacted
            }
        }
    }
}

/// Projects the subtree at `path` for a caller holding `held`.
///
/// A missing path or a fully redacted subtree projects to `null`.
#[must_use]
pub fn get(root: &Value, path: &[&str], held: &RoleSet) -> Value {
    let mut permitted = RolesPermitted::default();
    match descend(root, path, &mut permitted) {
        None => Value::Null,
        Some(node) => project(node, &permitted, held, Operation::ReadData).or_null(),
    }
}

/// Kind of mutation a `set` would perform at its target key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteKind {
    /// The key exists; gated by `write_data`.
    Replace,
    /// The key would be introduced; gated by `create_data`.
    Create,
}

/// Checks whether `held` may write `path`, accumulating policy down to the
/// target. Replacing an existing key requires `write_data`; introducing a
/// new one requires `create_data`. The target's own descriptor (when the
/// target is a wrapper) participates in the decision.
pub fn check_write(root: &Value, path: &[&str], held: &RoleSet) -> Result<WriteKind, StoreError> {
    let Some((last, parents)) = path.split_last() else {
        return Err(StoreError::InvalidPath(
            "the document root is not writable".into(),
        ));
    };
    let mut permitted = RolesPermitted::default();
    let Some(mut parent) = descend(root, parents, &mut permitted) else {
        return Err(StoreError::InvalidPath(format!(
            "no node at {}",
            parents.join("/")
        )));
    };
    while let Some((data, meta)) = as_wrapper(parent) {
        if let Some(meta) = meta {
            permitted.apply(meta);
        }
        parent = data;
    }
    let Some(entries) = parent.as_object() else {
        return Err(StoreError::InvalidPath(format!(
            "parent of {} is not an object",
            path.join("/")
        )));
    };
    let kind = match entries.get(*last) {
        Some(existing) => {
            if let Some((_, Some(meta))) = as_wrapper(existing) {
                permitted.apply(meta);
            }
            WriteKind::Replace
        }
        None => WriteKind::Create,
    };
    let operation = match kind {
        WriteKind::Replace => Operation::WriteData,
        WriteKind::Create => Operation::CreateData,
    };
    if permitted.permits(held, operation) {
        Ok(kind)
    } else {
        Err(StoreError::AccessDenied {
            operation: operation.as_key(),
            path: path.join("/"),
        })
    }
}
