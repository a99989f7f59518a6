//! Key validation and hierarchy helpers.

use crate::StoreError;

/// Normalize a store key.
///
/// Spaces are stripped. The root `/` is accepted as-is. Any other key must
/// be non-empty, must not end with `/`, and must not contain empty segments.
pub fn normalize_key(key: &str) -> Result<String, StoreError> {
    let key: String = key.chars().filter(|c| *c != ' ').collect();

    if key.is_empty() {
        return Err(StoreError::invalid(&key, "key is empty"));
    }
    if key == "/" {
        return Ok(key);
    }
    if key.ends_with('/') {
        return Err(StoreError::invalid(&key, "key ends with '/'"));
    }

    let body = key.strip_prefix('/').unwrap_or(&key);
    if body.split('/').any(str::is_empty) {
        return Err(StoreError::invalid(&key, "key has an empty segment"));
    }

    Ok(key)
}

/// Proper ancestors of a normalized key, shallowest first.
///
/// `a/b/c` yields `a`, `a/b`. `/a/b` yields `/a`.
pub fn ancestors(key: &str) -> impl Iterator<Item = &str> {
    key.match_indices('/')
        .map(|(idx, _)| idx)
        .filter(|idx| *idx > 0)
        .map(move |idx| &key[..idx])
}
