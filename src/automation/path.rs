//! JSON path extraction for webhook field mappings.
//!
//! Paths are a relaxed JSONPath subset: an optional `$` / `$.` prefix, then
//! segments separated by `.`, `[` or `]`. `$.items[0].name` and
//! `items.0.name` address the same value.

use serde_json::Value;

/// Split a path into its non-empty segments.
pub fn segments(path: &str) -> Vec<&str> {
    let trimmed = path.trim();
    let trimmed = trimmed.strip_prefix('$').unwrap_or(trimmed);
    trimmed
        .split(['.', '[', ']'])
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .collect()
}

/// Resolve `path` inside `document`.
///
/// Returns `None` when any step is missing, indexes into a scalar, or the
/// final value is JSON `null`. Objects and arrays are returned as-is.
pub fn extract<'a>(document: &'a Value, path: &str) -> Option<&'a Value> {
    let mut current = document;
    for segment in segments(path) {
        current = match current {
            Value::Object(map) => map.get(segment)?,
            Value::Array(items) => {
                let index: usize = segment.parse().ok()?;
                items.get(index)?
            }
            _ => return None,
        };
    }
    if current.is_null() { None } else { Some(current) }
}
