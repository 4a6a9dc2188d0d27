//! `${NAME}` substitution in forwarded payloads.
//!
//! A JSON body opts in by listing leaf paths in a marker field at its top
//! level (conventionally `BROKER_VAR_SUB`):
//!
//! ```text
//! {
//!   "BROKER_VAR_SUB": ["swap.me"],
//!   "swap": { "me": "${BROKER_TYPE}:${BROKER_TOKEN}" }
//! }
//! ```
//!
//! Only the listed leaves that are strings are rewritten. Unknown variable
//! names are left in place as literal `${NAME}` text.

use std::borrow::Cow;
use std::collections::HashMap;
use std::sync::LazyLock;

use regex::{Captures, Regex};
use serde_json::Value;

use crate::payload;

/// Conventional name of the marker field.
pub const DEFAULT_MARKER: &str = "BROKER_VAR_SUB";

static PLACEHOLDER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}").expect("placeholder pattern is valid"));

/// Source of substitution values.
pub trait VariableSource {
    fn lookup(&self, name: &str) -> Option<String>;
}

impl VariableSource for HashMap<String, String> {
    fn lookup(&self, name: &str) -> Option<String> {
        self.get(name).cloned()
    }
}

/// Variables read from the process environment at lookup time.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcessEnv;

impl VariableSource for ProcessEnv {
    fn lookup(&self, name: &str) -> Option<String> {
        std::env::var(name).ok()
    }
}

/// Replace every `${NAME}` in `text` with its value from `vars`.
pub fn expand<'a>(text: &'a str, vars: &dyn VariableSource) -> Cow<'a, str> {
    PLACEHOLDER.replace_all(text, |caps: &Captures<'_>| match vars.lookup(&caps[1]) {
        Some(value) => value,
        None => caps[0].to_string(),
    })
}

/// Return a copy of `payload` with the marked leaves expanded.
///
/// `payload` itself is never modified. Payloads without the marker field,
/// non-object payloads and marker entries that do not name a string leaf
/// come back unchanged.
pub fn substitute(payload: &Value, marker: &str, vars: &dyn VariableSource) -> Value {
    let mut out = payload.clone();
    let Some(paths) = marked_paths(payload, marker) else {
        return out;
    };

    for path in paths {
        let segments = payload::parse_path(path);
        // The marker list itself is never a substitution target.
        if segments.first().map(String::as_str) == Some(marker) {
            continue;
        }
        if let Some(Value::String(leaf)) = payload::get_mut(&mut out, &segments) {
            let expanded = expand(leaf, vars).into_owned();
            *leaf = expanded;
        }
    }
    out
}

/// Whether `payload` carries a non-empty marker list.
pub fn has_marker(payload: &Value, marker: &str) -> bool {
    marked_paths(payload, marker).is_some_and(|paths| !paths.is_empty())
}

fn marked_paths<'a>(payload: &'a Value, marker: &str) -> Option<Vec<&'a str>> {
    let list = payload.as_object()?.get(marker)?.as_array()?;
    Some(list.iter().filter_map(Value::as_str).collect())
}

/// Rewrite a raw request body.
///
/// Returns `None` when the body is not JSON or carries no marker, in which
/// case the caller must forward the original bytes untouched.
pub fn substitute_body(body: &[u8], marker: &str, vars: &dyn VariableSource) -> Option<Vec<u8>> {
    let doc: Value = serde_json::from_slice(body).ok()?;
    if !has_marker(&doc, marker) {
        return None;
    }
    serde_json::to_vec(&substitute(&doc, marker, vars)).ok()
}
