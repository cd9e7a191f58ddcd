//! Small shared helpers: atomic file writes, text normalization, and
//! token-level similarity.

use std::fs::{self, File};
use std::io::{self, Write};
use std::path::Path;

// ── Atomic Writes ────────────────────────────────────────────────────────

/// Write `bytes` to `path` atomically: temp file in the same directory,
/// fsync, then rename over the destination. Partial writes can never be
/// observed at `path`.
pub fn atomic_write(path: &Path, bytes: &[u8]) -> io::Result<()> {
    let parent = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .map(Path::to_path_buf)
        .unwrap_or_else(|| std::path::PathBuf::from("."));
    fs::create_dir_all(&parent)?;

    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| "out".to_string());
    let tmp_path = parent.join(format!(".{}.tmp.{}", file_name, std::process::id()));

    {
        let mut tmp = File::create(&tmp_path)?;
        tmp.write_all(bytes)?;
        tmp.sync_all()?;
    }

    if let Err(err) = fs::rename(&tmp_path, path) {
        let _ = fs::remove_file(&tmp_path);
        return Err(err);
    }

    // Persist the rename itself; failures here are non-fatal on
    // filesystems without directory fsync support.
    if let Ok(dir) = File::open(&parent) {
        let _ = dir.sync_all();
    }
    Ok(())
}

/// Serialize `value` as pretty-printed JSON (2-space indent, trailing
/// newline) and write it atomically.
pub fn atomic_write_json<T: serde::Serialize>(path: &Path, value: &T) -> io::Result<()> {
    let mut json = serde_json::to_vec_pretty(value)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    json.push(b'\n');
    atomic_write(path, &json)
}

// ── Text Normalization ───────────────────────────────────────────────────

/// Normalize text for identity hashing: lowercase, strip everything but
/// alphanumerics, collapse runs of separators into single spaces.
pub fn normalize_for_identity(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut pending_space = false;
    for ch in text.chars() {
        if ch.is_alphanumeric() {
            if pending_space && !out.is_empty() {
                out.push(' ');
            }
            pending_space = false;
            for lower in ch.to_lowercase() {
                out.push(lower);
            }
        } else {
            pending_space = true;
        }
    }
    out
}

/// Tokenize normalized text into a set of lowercase alphanumeric tokens.
pub fn token_set(text: &str) -> std::collections::BTreeSet<String> {
    normalize_for_identity(text)
        .split(' ')
        .filter(|t| !t.is_empty())
        .map(str::to_string)
        .collect()
}

/// Token-level Jaccard similarity between two texts (0.0–1.0).
///
/// Two empty token sets are considered identical.
pub fn jaccard_similarity(a: &str, b: &str) -> f64 {
    let ta = token_set(a);
    let tb = token_set(b);
    if ta.is_empty() && tb.is_empty() {
        return 1.0;
    }
    let intersection = ta.intersection(&tb).count();
    let union = ta.union(&tb).count();
    if union == 0 {
        return 0.0;
    }
    intersection as f64 / union as f64
}

/// Truncate to at most `max_chars` characters on a char boundary,
/// appending an ellipsis when anything was cut.
pub fn truncate_chars(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let truncated: String = text.chars().take(max_chars.saturating_sub(1)).collect();
    format!("{truncated}…")
}

/// Longest common substring length between two strings (by chars).
///
/// Used as a fuzzy-match tie-break; inputs are short identifiers and
/// titles so the quadratic table is fine.
pub fn longest_common_substring(a: &str, b: &str) -> usize {
    let a: Vec<char> = a.chars().collect();
    let b: Vec<char> = b.chars().collect();
    if a.is_empty() || b.is_empty() {
        return 0;
    }
    let mut prev = vec![0usize; b.len() + 1];
    let mut best = 0;
    for i in 1..=a.len() {
        let mut row = vec![0usize; b.len() + 1];
        for j in 1..=b.len() {
            if a[i - 1] == b[j - 1] {
                row[j] = prev[j - 1] + 1;
                best = best.max(row[j]);
            }
        }
        prev = row;
    }
    best
}
