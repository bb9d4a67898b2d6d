//! Namespace path helpers.
//!
//! Paths are absolute, `/`-separated, and never end in `/` except for the
//! root itself.

use crate::{CoordError, CoordErrorKind, CoordResult};

/// Validates an absolute namespace path
///
/// # Errors
///
/// Returns `InvalidPath` for relative paths, trailing or doubled slashes,
/// and `.`/`..` segments.
pub fn validate(path: &str) -> CoordResult {
    let invalid = |reason| {
        Err(CoordError::from(CoordErrorKind::InvalidPath {
            path: path.to_string(),
            reason,
        }))
    };

    if !path.starts_with('/') {
        return invalid("must be absolute");
    }
    if path == "/" {
        return Ok(());
    }
    if path.ends_with('/') {
        return invalid("trailing slash");
    }
    for segment in path[1..].split('/') {
        match segment {
            "" => return invalid("empty segment"),
            "." | ".." => return invalid("relative segment"),
            s if s.chars().any(char::is_control) => return invalid("control character"),
            _ => {}
        }
    }
    Ok(())
}

/// Joins a child name onto a parent path
#[must_use]
pub fn join(parent: &str, child: &str) -> String {
    if parent == "/" {
        format!("/{child}")
    } else {
        format!("{parent}/{child}")
    }
}

/// Returns the parent of a path, or `None` for the root
#[must_use]
pub fn parent(path: &str) -> Option<&str> {
    if path == "/" {
        return None;
    }
    match path.rfind('/') {
        Some(0) => Some("/"),
        Some(idx) => Some(&path[..idx]),
        None => None,
    }
}

/// Iterates over every non-root prefix of a path, shortest first
///
/// `/a/b/c` yields `/a`, `/a/b`, `/a/b/c`.
pub fn prefixes(path: &str) -> impl Iterator<Item = &str> {
    path.match_indices('/')
        .map(|(idx, _)| idx)
        .skip(1)
        .chain(std::iter::once(path.len()))
        .filter(move |_| path != "/")
        .map(move |end| &path[..end])
}

/// Returns the last segment of a path
#[must_use]
pub fn name(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}
