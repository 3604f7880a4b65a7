//! Small filesystem helpers shared by the engine components. Reads only;
//! every write goes through the store.

use std::path::{Path, PathBuf};

use pm_core::error::{PmError, Result};
use serde::de::DeserializeOwned;

/// Read and parse a JSON document.
pub fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let body = std::fs::read_to_string(path)
        .map_err(|e| PmError::Database(format!("Failed to read {}: {e}", path.display())))?;
    serde_json::from_str(&body)
        .map_err(|e| PmError::Validation(format!("Malformed JSON in {}: {e}", path.display())))
}

/// First `max_lines` lines of a text file; empty when the file is missing.
pub fn head_lines(path: &Path, max_lines: usize) -> String {
    std::fs::read_to_string(path)
        .map(|body| {
            body.lines()
                .take(max_lines)
                .collect::<Vec<_>>()
                .join("\n")
        })
        .unwrap_or_default()
}

/// Last `max_lines` lines of a text file; empty when the file is missing.
pub fn tail_lines(path: &Path, max_lines: usize) -> String {
    std::fs::read_to_string(path)
        .map(|body| {
            let lines: Vec<&str> = body.lines().collect();
            let start = lines.len().saturating_sub(max_lines);
            lines[start..].join("\n")
        })
        .unwrap_or_default()
}

/// On-disk size in bytes, zero when missing.
pub fn file_size(path: &Path) -> u64 {
    std::fs::metadata(path).map(|m| m.len()).unwrap_or(0)
}

/// Line count, zero when missing or unreadable.
pub fn line_count(path: &Path) -> usize {
    std::fs::read_to_string(path)
        .map(|body| body.lines().count())
        .unwrap_or(0)
}

/// Recursively list files under a path. A file path yields itself. Hidden
/// directories and `node_modules`/`target` are skipped; recursion is bounded.
pub fn expand_path(root: &Path, rel: &str) -> Vec<PathBuf> {
    let full = root.join(rel);
    let mut out = Vec::new();
    collect_files(&full, 0, &mut out);
    out
}

fn collect_files(path: &Path, depth: usize, out: &mut Vec<PathBuf>) {
    const MAX_DEPTH: usize = 6;
    if path.is_file() {
        out.push(path.to_path_buf());
        return;
    }
    if !path.is_dir() || depth > MAX_DEPTH {
        return;
    }
    let Ok(entries) = std::fs::read_dir(path) else {
        return;
    };
    let mut children: Vec<_> = entries.filter_map(|e| e.ok()).collect();
    children.sort_by_key(|e| e.file_name());
    for entry in children {
        let name = entry.file_name().to_string_lossy().into_owned();
        if name.starts_with('.') || name == "node_modules" || name == "target" {
            continue;
        }
        collect_files(&entry.path(), depth + 1, out);
    }
}
