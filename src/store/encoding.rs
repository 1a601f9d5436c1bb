//! Working-directory encoding.
//!
//! The external agent stores each project's sessions under a directory whose
//! name is derived from the working directory: `/` and `_` become `-`, and a
//! hidden component's leading `.` is stripped and rendered as an extra `-`
//! (so `/home/u/.config` becomes `-home-u--config`). The mapping is lossy,
//! so decoding consults the filesystem: segments are greedily re-joined with
//! `_` (or a literal `-`) wherever the split interpretation does not exist
//! on disk.

use std::path::{Component, Path, PathBuf};

/// Encode an absolute working directory into its on-disk project name.
pub fn encode_working_dir(path: &Path) -> String {
    let mut out = String::new();
    for component in path.components() {
        match component {
            Component::RootDir => {}
            Component::Normal(os) => {
                out.push('-');
                let name = os.to_string_lossy();
                let name = if let Some(stripped) = name.strip_prefix('.') {
                    out.push('-');
                    stripped.to_string()
                } else {
                    name.to_string()
                };
                out.push_str(&name.replace(['/', '_'], "-"));
            }
            _ => {}
        }
    }
    out
}

/// Decode a project directory name back into an absolute path.
///
/// Probes the filesystem to resolve ambiguous splits; when no interpretation
/// exists on disk, falls back to reading every `-` as `/`.
pub fn decode_project_dir(encoded: &str) -> PathBuf {
    let segments = split_segments(encoded);
    if let Some(found) = probe(Path::new("/"), &segments) {
        return found;
    }
    // Plain `/` interpretation for paths that no longer exist.
    let mut path = PathBuf::from("/");
    for segment in &segments {
        path.push(segment);
    }
    path
}

/// Split an encoded name into components, resolving the `--` hidden marker.
fn split_segments(encoded: &str) -> Vec<String> {
    let mut segments = Vec::new();
    let mut hidden = false;
    for (i, token) in encoded.split('-').enumerate() {
        if token.is_empty() {
            // Leading '-' marks the root; later empties mark a hidden
            // component.
            if i > 0 {
                hidden = true;
            }
            continue;
        }
        if hidden {
            segments.push(format!(".{token}"));
            hidden = false;
        } else {
            segments.push(token.to_string());
        }
    }
    segments
}

/// Greedy resolver: at each position prefer the longest join of upcoming
/// segments that names an existing entry, trying `_` before `-` as the
/// joiner, and fall back to the plain single-segment step.
fn probe(base: &Path, segments: &[String]) -> Option<PathBuf> {
    if segments.is_empty() {
        return if base.exists() {
            Some(base.to_path_buf())
        } else {
            None
        };
    }

    for take in (1..=segments.len()).rev() {
        for joiner in ["_", "-"] {
            if take == 1 && joiner == "-" {
                continue;
            }
            let name = segments[..take].join(joiner);
            let candidate = base.join(&name);
            if candidate.exists() {
                if let Some(found) = probe(&candidate, &segments[take..]) {
                    return Some(found);
                }
            }
        }
    }
    None
}
