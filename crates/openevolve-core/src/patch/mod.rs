//! Patch parsing and safe application against the shared target file.
//!
//! The target is shared mutable state: every access goes through the
//! run-scoped lock held for the whole snapshot -> apply -> evaluate ->
//! commit/revert span.

pub mod blocks;
pub mod edits;
pub mod unified;

use crate::config::Scope;
use crate::errors::EvolveError;
use edits::Edit;
use std::path::{Path, PathBuf};
use tokio::sync::{Mutex, MutexGuard};

#[derive(Debug, Clone)]
pub enum Patch {
    Edits(Vec<Edit>),
    Unified(String),
}

pub struct PatchEngine {
    target: PathBuf,
    scope: Scope,
    /// When set, structured edits may only address these block names.
    allowed_blocks: Option<Vec<String>>,
    lock: Mutex<()>,
}

impl PatchEngine {
    pub fn new(target: PathBuf, scope: Scope) -> Self {
        Self {
            target,
            scope,
            allowed_blocks: None,
            lock: Mutex::new(()),
        }
    }

    pub fn with_allowed_blocks(mut self, allowed: Option<Vec<String>>) -> Self {
        self.allowed_blocks = allowed;
        self
    }

    pub fn target(&self) -> &Path {
        &self.target
    }

    /// Classify and parse an LLM response body: a JSON mapping with a
    /// `diffs` key is a structured edit list, anything else is treated as a
    /// unified diff. Markdown fences are stripped first.
    pub fn parse(&self, body: &str) -> Result<Patch, EvolveError> {
        let body = strip_fences(body);
        if let Ok(value) = serde_json::from_str::<serde_json::Value>(body) {
            if value.is_object() && value.get("diffs").is_some() {
                return Ok(Patch::Edits(edits::parse_edits(body)?));
            }
        }
        Ok(Patch::Unified(body.to_string()))
    }

    /// Snapshot the target, apply the patch to a working copy and atomically
    /// replace the file. The returned guard holds the run lock; the caller
    /// must `commit` or `revert` after evaluation.
    pub async fn apply(&self, patch: &Patch) -> Result<ApplyGuard<'_>, EvolveError> {
        let permit = self.lock.lock().await;
        let original = std::fs::read(&self.target).map_err(|e| {
            EvolveError::PatchApply(format!("failed to read {}: {}", self.target.display(), e))
        })?;
        let source = String::from_utf8(original.clone()).map_err(|_| {
            EvolveError::PatchApply(format!("{} is not valid UTF-8", self.target.display()))
        })?;

        if let (Patch::Edits(list), Some(allowed)) = (patch, &self.allowed_blocks) {
            if let Some(edit) = list.iter().find(|e| !allowed.contains(&e.block)) {
                return Err(EvolveError::PatchApply(format!(
                    "block '{}' is not open for evolution",
                    edit.block
                )));
            }
        }

        let new_source = match patch {
            Patch::Edits(list) => edits::apply_edits(&source, list, self.scope)?,
            Patch::Unified(text) => unified::apply(&source, text)?,
        };

        write_atomic(&self.target, new_source.as_bytes())
            .map_err(|e| EvolveError::PatchApply(format!("failed to write target: {}", e)))?;

        Ok(ApplyGuard {
            _permit: permit,
            target: self.target.clone(),
            original,
            new_source,
            settled: false,
        })
    }

    /// Read the target's current contents under the run lock.
    pub async fn read_current(&self) -> Result<String, EvolveError> {
        let _permit = self.lock.lock().await;
        std::fs::read_to_string(&self.target).map_err(|e| {
            EvolveError::PatchApply(format!("failed to read {}: {}", self.target.display(), e))
        })
    }
}

/// Holds the run lock between apply and the commit/revert decision.
#[derive(Debug)]
pub struct ApplyGuard<'a> {
    _permit: MutexGuard<'a, ()>,
    target: PathBuf,
    original: Vec<u8>,
    pub new_source: String,
    settled: bool,
}

impl ApplyGuard<'_> {
    /// Keep the applied content in place.
    pub fn commit(mut self) {
        self.settled = true;
    }

    /// Restore the pre-apply bytes bit-exact. Failure here is fatal for the
    /// run: the working tree is in an unknown state.
    pub fn revert(mut self) -> Result<(), EvolveError> {
        self.settled = true;
        write_atomic(&self.target, &self.original)
            .map_err(|e| EvolveError::PatchRevert(e.to_string()))
    }
}

impl Drop for ApplyGuard<'_> {
    fn drop(&mut self) {
        if !self.settled {
            // Last-resort restore on unwind paths.
            if let Err(e) = write_atomic(&self.target, &self.original) {
                tracing::error!(target_file = %self.target.display(), error = %e, "revert on drop failed");
            }
        }
    }
}

/// Write via a temp sibling and rename, so readers never observe a torn file.
fn write_atomic(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let tmp = path.with_extension("evolve-tmp");
    std::fs::write(&tmp, bytes)?;
    std::fs::rename(&tmp, path)
}

fn strip_fences(body: &str) -> &str {
    let trimmed = body.trim();
    if !trimmed.starts_with("```") {
        return trimmed;
    }
    let without_open = match trimmed.find('\n') {
        Some(pos) => &trimmed[pos + 1..],
        None => return trimmed,
    };
    without_open
        .trim_end()
        .strip_suffix("```")
        .map(|s| s.trim_end())
        .unwrap_or(without_open)
}
