//! API-path utilities
//!
//! API paths are slash-rooted, case-sensitive POSIX-style strings; they are
//! the canonical identity of every filesystem entity. Root is `/`.

use crate::error::{ApiError, ApiResult};
use crate::{MAX_FILENAME_LEN, MAX_PATH_LEN};

/// Normalize a raw path into a canonical api path
///
/// Collapses duplicate separators, strips any trailing separator, and
/// roots the result. Rejects empty, relative, and traversal paths.
pub fn create_api_path(raw: &str) -> ApiResult<String> {
    if raw.contains('\0') {
        return Err(ApiError::InvalidOperation);
    }
    if raw.len() > MAX_PATH_LEN {
        return Err(ApiError::NameTooLong);
    }
    if raw.is_empty() || !raw.starts_with('/') {
        return Err(ApiError::InvalidOperation);
    }

    let mut parts: Vec<&str> = Vec::new();
    for segment in raw.split('/') {
        match segment {
            "" | "." => {}
            ".." => return Err(ApiError::InvalidOperation),
            name => {
                if name.len() > MAX_FILENAME_LEN {
                    return Err(ApiError::NameTooLong);
                }
                parts.push(name);
            }
        }
    }

    if parts.is_empty() {
        return Ok("/".to_owned());
    }
    Ok(format!("/{}", parts.join("/")))
}

/// Parent of an api path; root is its own parent
pub fn parent_of(api_path: &str) -> String {
    match api_path.rfind('/') {
        Some(0) | None => "/".to_owned(),
        Some(idx) => api_path[..idx].to_owned(),
    }
}

/// Final segment of an api path; empty for root
pub fn file_name_of(api_path: &str) -> &str {
    match api_path.rfind('/') {
        Some(idx) => &api_path[idx + 1..],
        None => api_path,
    }
}

/// Join a parent api path and a child name
pub fn combine(parent: &str, name: &str) -> String {
    if parent == "/" {
        format!("/{name}")
    } else {
        format!("{parent}/{name}")
    }
}

/// Non-empty path segments, in order
pub fn segments(api_path: &str) -> impl Iterator<Item = &str> {
    api_path.split('/').filter(|s| !s.is_empty())
}

/// Whether `candidate` is `ancestor` itself or lies underneath it
pub fn is_ancestor_or_self(ancestor: &str, candidate: &str) -> bool {
    if ancestor == "/" {
        return true;
    }
    candidate == ancestor
        || (candidate.starts_with(ancestor)
            && candidate.as_bytes().get(ancestor.len()) == Some(&b'/'))
}
