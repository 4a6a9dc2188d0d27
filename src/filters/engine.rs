//! Allow/deny evaluation of relayed requests.

use serde_json::Value;

use crate::filters::matcher::{PathCaptures, PathPattern};
use crate::filters::rule::FilterRule;
use crate::payload;

#[derive(Debug, Clone)]
struct CompiledRule {
    rule: FilterRule,
    pattern: PathPattern,
    predicates: Vec<(Vec<String>, Value)>,
}

/// An ordered, compiled list of filter rules.
#[derive(Debug, Clone, Default)]
pub struct Ruleset {
    rules: Vec<CompiledRule>,
}

/// Outcome of evaluating a request against a ruleset.
#[derive(Debug, Clone, PartialEq)]
pub enum Verdict<'a> {
    Allow {
        rule: &'a FilterRule,
        captures: PathCaptures,
    },
    Deny,
}

impl Verdict<'_> {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Verdict::Allow { .. })
    }
}

impl Ruleset {
    pub fn new(rules: Vec<FilterRule>) -> Self {
        let rules = rules
            .into_iter()
            .map(|rule| CompiledRule {
                pattern: PathPattern::new(rule.path.clone()),
                predicates: rule
                    .valid
                    .iter()
                    .map(|p| (payload::parse_path(&p.path), p.value.clone()))
                    .collect(),
                rule,
            })
            .collect();
        Self { rules }
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Evaluate a request. See [`evaluate`].
    pub fn evaluate(&self, method: &str, path: &str, body: &[u8]) -> Verdict<'_> {
        evaluate(self, method, path, body)
    }
}

/// Evaluate `method`, `path` and `body` against `ruleset`.
///
/// The first rule whose method, path and (if declared) body predicates all
/// match allows the request. No match denies it.
pub fn evaluate<'a>(ruleset: &'a Ruleset, method: &str, path: &str, body: &[u8]) -> Verdict<'a> {
    // Parsed at most once, and only if some rule needs it.
    let mut parsed: Option<Option<Value>> = None;

    for compiled in &ruleset.rules {
        if !compiled.rule.matches_method(method) {
            continue;
        }
        let Some(captures) = compiled.pattern.matches(path) else {
            continue;
        };

        if !compiled.predicates.is_empty() {
            let doc = parsed.get_or_insert_with(|| serde_json::from_slice(body).ok());
            let Some(doc) = doc.as_ref() else {
                continue;
            };
            let holds = compiled
                .predicates
                .iter()
                .any(|(segments, expected)| payload::get(doc, segments) == Some(expected));
            if !holds {
                continue;
            }
        }

        tracing::trace!(method, path, rule = compiled.pattern.as_str(), "Filter rule matched");
        return Verdict::Allow {
            rule: &compiled.rule,
            captures,
        };
    }

    tracing::debug!(method, path, "No filter rule matched, denying");
    Verdict::Deny
}
