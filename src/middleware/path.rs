//! Path patterns for authorization rules and gateway routes.
//!
//! | pattern   | matches                                  |
//! |-----------|------------------------------------------|
//! | `/**`     | every path                               |
//! | `/x/**`   | `/x` and everything below it             |
//! | `/x`      | exactly `/x`                             |
//!
//! Matching is case-sensitive and ignores the query string.

use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PathPattern {
    Any,
    Exact(String),
    Prefix(String),
}

impl PathPattern {
    pub fn parse(pattern: &str) -> Self {
        let pattern = pattern.trim();

        if pattern == "/**" || pattern == "**" {
            return PathPattern::Any;
        }

        match pattern.strip_suffix("/**") {
            Some(prefix) => PathPattern::Prefix(prefix.to_string()),
            None => PathPattern::Exact(pattern.to_string()),
        }
    }

    pub fn matches(&self, path: &str) -> bool {
        match self {
            PathPattern::Any => true,
            PathPattern::Exact(exact) => path == exact,
            PathPattern::Prefix(prefix) => path
                .strip_prefix(prefix.as_str())
                .is_some_and(|rest| rest.is_empty() || rest.starts_with('/')),
        }
    }
}

impl From<&str> for PathPattern {
    fn from(pattern: &str) -> Self {
        Self::parse(pattern)
    }
}

impl fmt::Display for PathPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PathPattern::Any => f.write_str("/**"),
            PathPattern::Exact(path) => f.write_str(path),
            PathPattern::Prefix(prefix) => write!(f, "{prefix}/**"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exact_pattern() {
        let pattern = PathPattern::parse("/proxy");
        assert!(pattern.matches("/proxy"));
        assert!(!pattern.matches("/proxy/1"));
        assert!(!pattern.matches("/proxyx"));
    }

    #[test]
    fn test_prefix_pattern() {
        let pattern = PathPattern::parse("/reservations/**");
        assert!(pattern.matches("/reservations"));
        assert!(pattern.matches("/reservations/1"));
        assert!(pattern.matches("/reservations/batch/x"));
        assert!(!pattern.matches("/reservationsx"));
        assert!(!pattern.matches("/health"));
    }

    #[test]
    fn test_any_pattern() {
        let pattern = PathPattern::parse("/**");
        assert_eq!(pattern, PathPattern::Any);
        assert!(pattern.matches("/"));
        assert!(pattern.matches("/anything/at/all"));
    }

    #[test]
    fn test_display_round_trips_notation() {
        assert_eq!(PathPattern::parse("/x/**").to_string(), "/x/**");
        assert_eq!(PathPattern::parse(" /x ").to_string(), "/x");
    }
}
