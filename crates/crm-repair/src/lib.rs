//! Recovery of source files that ended up containing a pasted unified diff.
//!
//! When a `git apply <<'EOF' ... EOF` block is pasted into a file instead of a
//! shell, the file holds the diff text itself. The diff still describes the
//! intended file: its context and added lines, in order, are the new content.

use std::fs;
use std::path::{Path, PathBuf};

use crm_storage::{sha256_hex, write_atomic, StorageError};
use thiserror::Error;
use tracing::{info, info_span, warn};

pub const CRATE_NAME: &str = "crm-repair";

/// Presence of this text is what marks a file as corrupted.
pub const DIFF_MARKER: &str = "diff --git ";

/// File repaired when no path is given on the command line.
pub const DEFAULT_TARGET: &str = "app.py";

const HEADER_PREFIX: &str = "diff --git a/";
const HEADER_SEPARATOR: &str = " b/";

#[derive(Debug, Error)]
pub enum RepairError {
    #[error("file {0} does not exist")]
    MissingTarget(PathBuf),
    #[error("path {0} has no usable file name")]
    NoFileName(PathBuf),
    #[error("reading {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error(transparent)]
    Storage(#[from] StorageError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RepairMode {
    /// Reconstruct and return the text, leave the file alone.
    Preview,
    /// Overwrite the file with the reconstructed text.
    Repair,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepairedText {
    pub content: String,
    pub recovered_lines: usize,
    pub original_hash: String,
    pub repaired_hash: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RepairOutcome {
    /// The file holds no diff marker.
    NoArtifact,
    /// A diff is present but has no usable hunk for this file.
    NoTargetHunks,
    Previewed(RepairedText),
    Repaired(RepairedText),
}

impl RepairOutcome {
    pub fn status_line(&self, path: &Path) -> String {
        match self {
            Self::NoArtifact => format!("no diff artifact recognised in {}", path.display()),
            Self::NoTargetHunks => format!(
                "diff artifact found in {} but no hunk targets it; file left untouched",
                path.display()
            ),
            Self::Previewed(text) => format!(
                "preview generated for {} ({} lines)",
                path.display(),
                text.recovered_lines
            ),
            Self::Repaired(text) => format!(
                "repaired {} ({} lines, sha256 {})",
                path.display(),
                text.recovered_lines,
                text.repaired_hash
            ),
        }
    }
}

/// Path named by a `diff --git a/<path> b/<path>` header. Headers whose two
/// paths differ (renames) are not treated as headers.
fn header_path(line: &str) -> Option<&str> {
    let rest = line.strip_prefix(HEADER_PREFIX)?;
    let sep_len = HEADER_SEPARATOR.len();
    if rest.len() <= sep_len || (rest.len() - sep_len) % 2 != 0 {
        return None;
    }
    let half = (rest.len() - sep_len) / 2;
    let old_path = rest.get(..half)?;
    let separator = rest.get(half..half + sep_len)?;
    let new_path = rest.get(half + sep_len..)?;
    (separator == HEADER_SEPARATOR && old_path == new_path).then_some(old_path)
}

/// Rebuild the content `target` would have after the patch.
///
/// Only hunks under a header naming `target` contribute; inside them context
/// lines and added lines are kept in order and removed lines are dropped.
/// Returns `None` when nothing was collected.
pub fn extract_file_from_patch(patch_text: &str, target: &str) -> Option<String> {
    let mut collected: Vec<&str> = Vec::new();
    let mut in_target = false;
    let mut in_hunk = false;

    for line in patch_text.lines() {
        if let Some(path) = header_path(line) {
            in_target = path == target;
            in_hunk = false;
            continue;
        }
        if !in_target {
            continue;
        }
        if line.starts_with("index ") || line.starts_with("--- ") || line.starts_with("+++ ") {
            continue;
        }
        if line.starts_with("@@") {
            in_hunk = true;
            continue;
        }
        if line.starts_with("\\ No newline") || !in_hunk {
            continue;
        }

        if let Some(added) = line.strip_prefix('+') {
            if !line.starts_with("+++") {
                collected.push(added);
            }
        } else if let Some(context) = line.strip_prefix(' ') {
            collected.push(context);
        }
    }

    if collected.is_empty() {
        return None;
    }
    let mut out = collected.join("\n");
    out.push('\n');
    Some(out)
}

/// Cut `original` at the first diff marker and rebuild `target` from it.
/// Whitespace-only reconstructions count as no result.
pub fn repair_text(original: &str, target: &str) -> Option<String> {
    let start = original.find(DIFF_MARKER)?;
    extract_file_from_patch(&original[start..], target).filter(|text| !text.trim().is_empty())
}

pub fn repair_file(path: &Path, mode: RepairMode) -> Result<RepairOutcome, RepairError> {
    if !path.exists() {
        return Err(RepairError::MissingTarget(path.to_path_buf()));
    }
    let target = path
        .file_name()
        .and_then(|name| name.to_str())
        .ok_or_else(|| RepairError::NoFileName(path.to_path_buf()))?;

    let span = info_span!("repair", path = %path.display(), ?mode);
    let _guard = span.enter();

    let original = fs::read_to_string(path).map_err(|source| RepairError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    if !original.contains(DIFF_MARKER) {
        info!("no diff marker found");
        return Ok(RepairOutcome::NoArtifact);
    }

    let Some(content) = repair_text(&original, target) else {
        warn!(file = target, "diff marker present but no hunk reconstructs the file");
        return Ok(RepairOutcome::NoTargetHunks);
    };

    let repaired = RepairedText {
        recovered_lines: content.lines().count(),
        original_hash: sha256_hex(original.as_bytes()),
        repaired_hash: sha256_hex(content.as_bytes()),
        content,
    };

    match mode {
        RepairMode::Preview => Ok(RepairOutcome::Previewed(repaired)),
        RepairMode::Repair => {
            write_atomic(path, repaired.content.as_bytes())?;
            info!(
                lines = repaired.recovered_lines,
                before = %repaired.original_hash,
                after = %repaired.repaired_hash,
                "file rewritten from diff"
            );
            Ok(RepairOutcome::Repaired(repaired))
        }
    }
}
