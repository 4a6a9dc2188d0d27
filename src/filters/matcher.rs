//! Path template matching.
//!
//! # Responsibilities
//! - Compile a path template into segments once
//! - Match whole segments only (no prefix or substring matches)
//! - Collect `:name` captures for diagnostics
//!
//! # Design Decisions
//! - Path matching is case-sensitive
//! - A single trailing slash is not significant
//! - Paths with `.` or `..` segments, literal or percent-encoded, never
//!   match: the private service may resolve them to a path no rule allows
//! - No regex, matching is a linear walk over segments

/// Captured `:name` segments, in template order.
pub type PathCaptures = Vec<(String, String)>;

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    Capture(String),
    /// `*`: exactly one segment, any content.
    Any,
    /// `**` in last position: zero or more remaining segments.
    Rest,
}

/// A compiled path template.
#[derive(Debug, Clone)]
pub struct PathPattern {
    source: String,
    segments: Vec<Segment>,
}

impl PathPattern {
    /// Compile a template such as `/echo-param/:param`.
    pub fn new(template: impl Into<String>) -> Self {
        let source = template.into();
        let parts = split(&source);
        let last = parts.len().saturating_sub(1);
        let segments = parts
            .iter()
            .enumerate()
            .map(|(i, part)| match *part {
                "**" if i == last => Segment::Rest,
                "*" => Segment::Any,
                p if p.starts_with(':') && p.len() > 1 => Segment::Capture(p[1..].to_string()),
                p => Segment::Literal(p.to_string()),
            })
            .collect();
        Self { source, segments }
    }

    /// The template this pattern was compiled from.
    pub fn as_str(&self) -> &str {
        &self.source
    }

    /// Match `path`, returning captures on success.
    pub fn matches(&self, path: &str) -> Option<PathCaptures> {
        let parts = split(path);
        if parts.iter().any(|part| is_dot_segment(part)) {
            return None;
        }
        let mut captures = PathCaptures::new();

        for (i, segment) in self.segments.iter().enumerate() {
            match segment {
                Segment::Rest => return Some(captures),
                _ if i >= parts.len() => return None,
                Segment::Literal(lit) if lit != parts[i] => return None,
                Segment::Capture(name) => {
                    if parts[i].is_empty() {
                        return None;
                    }
                    captures.push((name.clone(), parts[i].to_string()));
                }
                Segment::Any if parts[i].is_empty() => return None,
                _ => {}
            }
        }

        if parts.len() == self.segments.len() {
            Some(captures)
        } else {
            None
        }
    }
}

fn split(path: &str) -> Vec<&str> {
    let trimmed = path.strip_prefix('/').unwrap_or(path);
    let trimmed = trimmed.strip_suffix('/').unwrap_or(trimmed);
    if trimmed.is_empty() {
        Vec::new()
    } else {
        trimmed.split('/').collect()
    }
}

fn is_dot_segment(part: &str) -> bool {
    let decoded = part.to_ascii_lowercase().replace("%2e", ".");
    decoded == "." || decoded == ".."
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_literal_path() {
        let pattern = PathPattern::new("/echo-body");
        assert!(pattern.matches("/echo-body").is_some());
        assert!(pattern.matches("/echo-body/").is_some());
        assert!(pattern.matches("/echo-body/filtered").is_none());
        assert!(pattern.matches("/echo-bodyx").is_none());
        assert!(pattern.matches("/echo").is_none());
    }

    #[test]
    fn test_capture_segment() {
        let pattern = PathPattern::new("/echo-param/:param");
        assert_eq!(
            pattern.matches("/echo-param/xyz"),
            Some(vec![("param".to_string(), "xyz".to_string())])
        );
        assert!(pattern.matches("/echo-param").is_none());
        assert!(pattern.matches("/echo-param/xyz/more").is_none());
    }

    #[test]
    fn test_wildcards() {
        let any = PathPattern::new("/repos/*/issues");
        assert!(any.matches("/repos/broker/issues").is_some());
        assert!(any.matches("/repos/issues").is_none());

        let rest = PathPattern::new("/static/**");
        assert!(rest.matches("/static").is_some());
        assert!(rest.matches("/static/css/site.css").is_some());
        assert!(rest.matches("/other/css").is_none());
    }

    #[test]
    fn test_case_sensitive() {
        let pattern = PathPattern::new("/Echo");
        assert!(pattern.matches("/echo").is_none());
    }

    #[test]
    fn test_dot_segments_never_match() {
        let rest = PathPattern::new("/static/**");
        assert!(rest.matches("/static/../admin/delete").is_none());
        assert!(rest.matches("/static/./css").is_none());
        assert!(rest.matches("/static/%2e%2e/admin").is_none());
        assert!(rest.matches("/static/.%2E/admin").is_none());
        assert!(rest.matches("/static/..css/site.css").is_some());

        let capture = PathPattern::new("/echo-param/:param");
        assert!(capture.matches("/echo-param/..").is_none());
        assert!(capture.matches("/echo-param/%2E").is_none());
        assert!(capture.matches("/echo-param/...").is_some());
    }
}
