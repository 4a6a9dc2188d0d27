//! Persisted form of filter rules.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Method value that matches every method.
pub const ANY_METHOD: &str = "any";

/// A single whitelist entry.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct FilterRule {
    /// HTTP method, case-insensitive. `any` or `*` match every method.
    #[serde(default = "default_method")]
    pub method: String,

    /// Path template. Segments may be literals, `:name` captures, `*`
    /// (any single segment) or a final `**` (any remainder).
    pub path: String,

    /// Base URL requests matching this rule are dispatched to. May contain
    /// `${NAME}` placeholders resolved from the client environment.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub origin: Option<String>,

    /// Body shapes accepted by this rule. When non-empty, at least one
    /// predicate must hold against the parsed JSON body.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub valid: Vec<BodyPredicate>,
}

fn default_method() -> String {
    ANY_METHOD.to_string()
}

impl FilterRule {
    /// Whether `method` is accepted by this rule.
    pub fn matches_method(&self, method: &str) -> bool {
        self.method == "*" || self.method.eq_ignore_ascii_case(ANY_METHOD) || self.method.eq_ignore_ascii_case(method)
    }
}

/// "The field at `path` must equal `value`."
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct BodyPredicate {
    /// Dotted (`proxy.me`) or JSON-pointer (`/proxy/me`) path into the body.
    pub path: String,
    pub value: Value,
}
