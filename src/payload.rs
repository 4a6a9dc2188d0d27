//! Addressing leaves inside JSON payloads.
//!
//! Paths are accepted in two spellings:
//! - JSON pointer: `/swap/me`, `/items/0/name` (`~1` and `~0` escapes honoured)
//! - dotted: `swap.me`, `items.0.name`
//!
//! Numeric segments index into arrays; on objects they are plain keys.

use serde_json::Value;

/// Split a path into its segments.
pub fn parse_path(path: &str) -> Vec<String> {
    if let Some(pointer) = path.strip_prefix('/') {
        pointer
            .split('/')
            .map(|s| s.replace("~1", "/").replace("~0", "~"))
            .collect()
    } else if path.is_empty() {
        Vec::new()
    } else {
        path.split('.').map(str::to_string).collect()
    }
}

/// Look up the value at `segments`.
pub fn get<'a>(value: &'a Value, segments: &[String]) -> Option<&'a Value> {
    segments.iter().try_fold(value, |current, segment| match current {
        Value::Object(map) => map.get(segment),
        Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
        _ => None,
    })
}

/// Mutable lookup of the value at `segments`.
pub fn get_mut<'a>(value: &'a mut Value, segments: &[String]) -> Option<&'a mut Value> {
    segments.iter().try_fold(value, |current, segment| match current {
        Value::Object(map) => map.get_mut(segment),
        Value::Array(items) => segment.parse::<usize>().ok().and_then(move |i| items.get_mut(i)),
        _ => None,
    })
}
