//! Path pattern matching.
//!
//! # Responsibilities
//! - Parse route patterns (`/static`, `/users/:id`, `/files/*`)
//! - Match a request path, collecting parameter values
//!
//! # Design Decisions
//! - Matching is case-sensitive and slash-exact (`/a/` is not `/a`)
//! - `*` may only be the last segment and captures the rest of the path
//! - Parameter values are written into a caller-supplied buffer so the
//!   router can pool it

use std::fmt;
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Static(String),
    Param,
    Wildcard,
}

/// Invalid route pattern.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PatternError {
    MissingLeadingSlash(String),
    EmptyParamName(String),
    DuplicateParam(String),
    WildcardNotLast(String),
}

impl fmt::Display for PatternError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PatternError::MissingLeadingSlash(p) => write!(f, "route pattern {:?} must start with '/'", p),
            PatternError::EmptyParamName(p) => write!(f, "route pattern {:?} has an unnamed parameter", p),
            PatternError::DuplicateParam(p) => write!(f, "route pattern {:?} repeats a parameter name", p),
            PatternError::WildcardNotLast(p) => write!(f, "route pattern {:?} has '*' before the last segment", p),
        }
    }
}

impl std::error::Error for PatternError {}

/// A compiled route pattern.
#[derive(Debug, Clone)]
pub struct Pattern {
    raw: String,
    segments: Vec<Segment>,
    names: Arc<[String]>,
}

impl Pattern {
    pub fn parse(raw: &str) -> Result<Self, PatternError> {
        let Some(rest) = raw.strip_prefix('/') else {
            return Err(PatternError::MissingLeadingSlash(raw.to_string()));
        };

        let parts: Vec<&str> = rest.split('/').collect();
        let mut segments = Vec::with_capacity(parts.len());
        let mut names: Vec<String> = Vec::new();

        for (i, part) in parts.iter().enumerate() {
            if *part == "*" {
                if i + 1 != parts.len() {
                    return Err(PatternError::WildcardNotLast(raw.to_string()));
                }
                names.push("*".to_string());
                segments.push(Segment::Wildcard);
            } else if let Some(name) = part.strip_prefix(':') {
                if name.is_empty() {
                    return Err(PatternError::EmptyParamName(raw.to_string()));
                }
                if names.iter().any(|n| n == name) {
                    return Err(PatternError::DuplicateParam(raw.to_string()));
                }
                names.push(name.to_string());
                segments.push(Segment::Param);
            } else {
                segments.push(Segment::Static(part.to_string()));
            }
        }

        Ok(Self {
            raw: raw.to_string(),
            segments,
            names: names.into(),
        })
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// Parameter names in the order their values are collected.
    pub fn names(&self) -> &Arc<[String]> {
        &self.names
    }

    /// Match `path`, replacing the contents of `values` with the parameter
    /// values. On a miss `values` is left empty.
    pub fn matches_into(&self, path: &str, values: &mut Vec<String>) -> bool {
        values.clear();
        let Some(mut rest) = path.strip_prefix('/') else {
            return false;
        };

        let mut exhausted = false;
        for segment in &self.segments {
            if let Segment::Wildcard = segment {
                values.push(if exhausted { String::new() } else { rest.to_string() });
                return true;
            }
            if exhausted {
                values.clear();
                return false;
            }

            let head = match rest.split_once('/') {
                Some((head, tail)) => {
                    rest = tail;
                    head
                }
                None => {
                    exhausted = true;
                    rest
                }
            };

            let ok = match segment {
                Segment::Static(expected) => head == expected,
                Segment::Param if !head.is_empty() => {
                    values.push(head.to_string());
                    true
                }
                _ => false,
            };
            if !ok {
                values.clear();
                return false;
            }
        }

        if !exhausted {
            values.clear();
        }
        exhausted
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn matches(pattern: &str, path: &str) -> Option<Vec<String>> {
        let pattern = Pattern::parse(pattern).unwrap();
        let mut values = Vec::new();
        pattern.matches_into(path, &mut values).then_some(values)
    }

    #[test]
    fn static_segments() {
        assert_eq!(matches("/", "/"), Some(vec![]));
        assert_eq!(matches("/health", "/health"), Some(vec![]));
        assert_eq!(matches("/health", "/health/"), None);
        assert_eq!(matches("/health", "/Health"), None);
        assert_eq!(matches("/", "/x"), None);
    }

    #[test]
    fn params_collect_values() {
        assert_eq!(
            matches("/users/:id/posts/:post", "/users/7/posts/9"),
            Some(vec!["7".to_string(), "9".to_string()])
        );
        assert_eq!(matches("/users/:id", "/users/"), None);
        assert_eq!(matches("/users/:id", "/users/7/extra"), None);
        assert_eq!(matches("/users/:id", "/users"), None);
    }

    #[test]
    fn wildcard_takes_the_rest() {
        assert_eq!(matches("/files/*", "/files/a/b.txt"), Some(vec!["a/b.txt".to_string()]));
        assert_eq!(matches("/files/*", "/files"), Some(vec![String::new()]));
        assert_eq!(matches("/files/*", "/other/a"), None);
    }

    #[test]
    fn miss_leaves_buffer_empty() {
        let pattern = Pattern::parse("/users/:id/posts").unwrap();
        let mut values = vec!["stale".to_string()];
        assert!(!pattern.matches_into("/users/7/comments", &mut values));
        assert!(values.is_empty());
    }

    #[test]
    fn invalid_patterns() {
        assert!(matches!(Pattern::parse("users"), Err(PatternError::MissingLeadingSlash(_))));
        assert!(matches!(Pattern::parse("/users/:"), Err(PatternError::EmptyParamName(_))));
        assert!(matches!(Pattern::parse("/:id/:id"), Err(PatternError::DuplicateParam(_))));
        assert!(matches!(Pattern::parse("/*/x"), Err(PatternError::WildcardNotLast(_))));
        assert_eq!(Pattern::parse("/a/:b/*").unwrap().names().to_vec(), vec!["b", "*"]);
    }
}
