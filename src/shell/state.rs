//! Shell State snapshots and diffs
//!
//! A [`ShellState`] is the canonical snapshot of a shell's declarations and
//! working directory. Its hash covers exactly those two things, so equal
//! hashes mean equal state for diff purposes.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use super::ShellType;

/// Shell-state errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ShellStateError {
    #[error("diff base {expected} does not match state {found}")]
    BaseMismatch { expected: String, found: String },

    #[error("applied state hash {found} does not match diff target {expected}")]
    TargetMismatch { expected: String, found: String },

    #[error("diff for {diff} cannot apply to a {state} state")]
    DialectMismatch { state: ShellType, diff: ShellType },

    #[error("malformed shell state output: {0}")]
    Parse(String),

    #[error("shell state capture failed: {0}")]
    Capture(String),

    #[error("shell state capture timed out after {0}s")]
    Timeout(u64),
}

/// Prefix for synthetic prompt variables (git branch, virtualenv, ...)
pub const PROMPT_VAR_PREFIX: &str = "PROMPTVAR_";

/// One named shell variable
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Declaration {
    pub name: String,
    pub value: String,
    /// Portable attribute flags: `x` exported, `r` readonly, `i` integer
    #[serde(default)]
    pub flags: String,
    /// Raw attribute string as reported by the dialect
    #[serde(default)]
    pub dialect_flags: String,
}

impl Declaration {
    pub fn new(
        name: impl Into<String>,
        value: impl Into<String>,
        flags: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
            flags: flags.into(),
            dialect_flags: String::new(),
        }
    }

    pub fn is_exported(&self) -> bool {
        self.flags.contains('x')
    }

    pub fn is_readonly(&self) -> bool {
        self.flags.contains('r')
    }

    pub fn is_integer(&self) -> bool {
        self.flags.contains('i')
    }

    pub fn is_prompt_var(&self) -> bool {
        self.name.starts_with(PROMPT_VAR_PREFIX)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ShellState {
    pub shell_type: ShellType,
    #[serde(default)]
    pub version: String,
    pub cwd: String,
    pub decls: BTreeMap<String, Declaration>,
    pub hash: String,
}

impl ShellState {
    pub fn new(
        shell_type: ShellType,
        version: impl Into<String>,
        cwd: impl Into<String>,
        decls: impl IntoIterator<Item = Declaration>,
    ) -> Self {
        let decls: BTreeMap<String, Declaration> =
            decls.into_iter().map(|d| (d.name.clone(), d)).collect();
        let cwd = cwd.into();
        let hash = compute_hash(&cwd, &decls);
        Self {
            shell_type,
            version: version.into(),
            cwd,
            decls,
            hash,
        }
    }

    /// Recompute after editing `cwd` or `decls` in place.
    pub fn rehash(&mut self) {
        self.hash = compute_hash(&self.cwd, &self.decls);
    }

    /// True when the stored hash matches the contents (e.g. after deserializing).
    pub fn hash_is_valid(&self) -> bool {
        self.hash == compute_hash(&self.cwd, &self.decls)
    }

    pub fn get(&self, name: &str) -> Option<&Declaration> {
        self.decls.get(name)
    }
}

/// SHA-256 over cwd and every declaration in name order, hex encoded.
fn compute_hash(cwd: &str, decls: &BTreeMap<String, Declaration>) -> String {
    let mut hasher = Sha256::new();
    hasher.update(cwd.as_bytes());
    hasher.update([0u8]);
    for decl in decls.values() {
        for field in [&decl.name, &decl.flags, &decl.dialect_flags, &decl.value] {
            hasher.update(field.as_bytes());
            hasher.update([0u8]);
        }
    }
    hasher
        .finalize()
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect()
}

/// Minimal edit script between two states of the same dialect
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ShellStateDiff {
    pub shell_type: ShellType,
    pub base_hash: String,
    pub target_hash: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cwd: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(default)]
    pub upserts: Vec<Declaration>,
    #[serde(default)]
    pub removed: Vec<String>,
}

impl ShellStateDiff {
    pub fn is_empty(&self) -> bool {
        self.cwd.is_none()
            && self.version.is_none()
            && self.upserts.is_empty()
            && self.removed.is_empty()
    }
}

/// Compute the edit script turning `old` into `new`.
pub fn diff(old: &ShellState, new: &ShellState) -> ShellStateDiff {
    let mut out = ShellStateDiff {
        shell_type: new.shell_type,
        base_hash: old.hash.clone(),
        target_hash: new.hash.clone(),
        cwd: None,
        version: None,
        upserts: Vec::new(),
        removed: Vec::new(),
    };
    // equal hashes are equal states, version included
    if old.hash == new.hash {
        return out;
    }

    if old.version != new.version {
        out.version = Some(new.version.clone());
    }
    if old.cwd != new.cwd {
        out.cwd = Some(new.cwd.clone());
    }
    for (name, decl) in &new.decls {
        if old.decls.get(name) != Some(decl) {
            out.upserts.push(decl.clone());
        }
    }
    for name in old.decls.keys() {
        if !new.decls.contains_key(name) {
            out.removed.push(name.clone());
        }
    }
    out
}

/// Reconstruct the target state from `old` and a diff computed against it.
pub fn apply(old: &ShellState, diff: &ShellStateDiff) -> Result<ShellState, ShellStateError> {
    if old.shell_type != diff.shell_type {
        return Err(ShellStateError::DialectMismatch {
            state: old.shell_type,
            diff: diff.shell_type,
        });
    }
    if old.hash != diff.base_hash {
        return Err(ShellStateError::BaseMismatch {
            expected: diff.base_hash.clone(),
            found: old.hash.clone(),
        });
    }

    let mut next = old.clone();
    if let Some(cwd) = &diff.cwd {
        next.cwd = cwd.clone();
    }
    if let Some(version) = &diff.version {
        next.version = version.clone();
    }
    for decl in &diff.upserts {
        next.decls.insert(decl.name.clone(), decl.clone());
    }
    for name in &diff.removed {
        next.decls.remove(name);
    }
    next.rehash();

    if next.hash != diff.target_hash {
        return Err(ShellStateError::TargetMismatch {
            expected: diff.target_hash.clone(),
            found: next.hash,
        });
    }
    Ok(next)
}
