//! Configuration patching.
//!
//! [`substitute`] is the pure text transform; [`apply_patch`] runs it
//! against a file of the image. Both fail instead of silently doing nothing
//! when the pattern is absent.

use a3s_bake_core::directive::PatchScope;
use a3s_bake_core::error::{BakeError, Result};

use crate::rootfs::{Node, Rootfs, DEFAULT_FILE_MODE};

/// Replace occurrences of `pattern` in `content` within `scope`.
///
/// Returns the rewritten text and the number of replacements. Text outside
/// the replaced occurrences, line terminators included, is kept verbatim.
pub fn substitute(
    content: &str,
    pattern: &str,
    replacement: &str,
    scope: &PatchScope,
) -> std::result::Result<(String, usize), String> {
    if pattern.is_empty() {
        return Err("pattern is empty".to_string());
    }

    let (out, count) = match scope {
        PatchScope::All => {
            let count = content.matches(pattern).count();
            (content.replace(pattern, replacement), count)
        }
        PatchScope::First => {
            let count = usize::from(content.contains(pattern));
            (content.replacen(pattern, replacement, 1), count)
        }
        PatchScope::LinesContaining(filter) => {
            let mut out = String::with_capacity(content.len());
            let mut count = 0;
            for line in content.split_inclusive('\n') {
                if line.contains(filter.as_str()) {
                    count += line.matches(pattern).count();
                    out.push_str(&line.replace(pattern, replacement));
                } else {
                    out.push_str(line);
                }
            }
            (out, count)
        }
    };

    if count == 0 {
        return Err(match scope {
            PatchScope::LinesContaining(filter) => format!(
                "pattern {:?} not found on lines containing {:?}",
                pattern, filter
            ),
            _ => format!("pattern {:?} not found", pattern),
        });
    }
    Ok((out, count))
}

/// Patch the file at `path` (already resolved) inside `rootfs`.
///
/// Returns the number of replacements made.
pub fn apply_patch(
    rootfs: &mut Rootfs,
    path: &str,
    pattern: &str,
    replacement: &str,
    scope: &PatchScope,
) -> Result<usize> {
    let data = rootfs.read_file(path).map_err(|e| patch_error(path, e.to_string()))?;
    let text = std::str::from_utf8(data)
        .map_err(|_| patch_error(path, "file is not valid UTF-8 text"))?;

    let (patched, count) =
        substitute(text, pattern, replacement, scope).map_err(|reason| patch_error(path, reason))?;

    let mode = file_mode(rootfs, path);
    rootfs
        .write_file(path, patched, mode)
        .map_err(|e| patch_error(path, e.to_string()))?;

    tracing::debug!(path, pattern, replacement, count, "File patched");
    Ok(count)
}

/// Overwrite (or create) the file at `path` with `content`.
pub fn write_file(rootfs: &mut Rootfs, path: &str, content: &str) -> Result<()> {
    let mode = file_mode(rootfs, path);
    rootfs
        .write_file(path, content, mode)
        .map_err(|e| patch_error(path, e.to_string()))
}

/// Mode of an existing file, so rewrites keep its permissions.
fn file_mode(rootfs: &Rootfs, path: &str) -> u32 {
    rootfs
        .canonical(path)
        .ok()
        .and_then(|p| match rootfs.get(&p) {
            Some(Node::File { mode, .. }) => Some(*mode),
            _ => None,
        })
        .unwrap_or(DEFAULT_FILE_MODE)
}

fn patch_error(path: &str, reason: impl Into<String>) -> BakeError {
    BakeError::Patch {
        path: path.to_string(),
        reason: reason.into(),
    }
}
