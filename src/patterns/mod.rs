//! Subscription pattern matching
//!
//! IDs are dot-separated: `system.adapter.admin.0`.
//! Patterns use `*` as a wildcard for any run of characters, dots included:
//! - `system.adapter.*` matches `system.adapter.admin.0` and `system.adapter.web.0.alive`
//! - `*.info.connection` matches `hm-rpc.0.info.connection`
//! - `*` matches everything
//!
//! File subscriptions carry a second pattern for the file name; both halves
//! are joined into one composite key `id####file`.

use regex::Regex;
use std::fmt;
use thiserror::Error;

/// Separator between the id pattern and the file-name pattern
pub const KEY_SEPARATOR: &str = "####";

/// Event stream a subscription belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum SubscriptionType {
    StateChange,
    ObjectChange,
    FileChange,
    Log,
}

impl SubscriptionType {
    pub const ALL: [SubscriptionType; 4] = [
        SubscriptionType::StateChange,
        SubscriptionType::ObjectChange,
        SubscriptionType::FileChange,
        SubscriptionType::Log,
    ];

    /// Client event name for this stream
    pub fn event_name(&self) -> &'static str {
        match self {
            SubscriptionType::StateChange => "stateChange",
            SubscriptionType::ObjectChange => "objectChange",
            SubscriptionType::FileChange => "fileChange",
            SubscriptionType::Log => "log",
        }
    }
}

impl fmt::Display for SubscriptionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.event_name())
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PatternError {
    #[error("pattern cannot be empty")]
    Empty,

    #[error("invalid character {0:?} in pattern")]
    InvalidCharacter(char),

    #[error("pattern could not be compiled: {0}")]
    Compile(String),
}

/// A compiled glob-style pattern
#[derive(Debug, Clone)]
pub struct Pattern {
    raw: String,
    regex: Regex,
}

impl Pattern {
    pub fn compile(raw: &str) -> Result<Self, PatternError> {
        if raw.is_empty() {
            return Err(PatternError::Empty);
        }

        if let Some(c) = raw.chars().find(|c| c.is_whitespace() || c.is_control()) {
            return Err(PatternError::InvalidCharacter(c));
        }

        let body = raw
            .split('*')
            .map(regex::escape)
            .collect::<Vec<_>>()
            .join(".*");
        let regex = Regex::new(&format!("^{}$", body)).map_err(|e| PatternError::Compile(e.to_string()))?;

        Ok(Self {
            raw: raw.to_string(),
            regex,
        })
    }

    pub fn matches(&self, id: &str) -> bool {
        self.regex.is_match(id)
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    pub fn is_wildcard(&self) -> bool {
        self.raw.contains('*')
    }
}

impl PartialEq for Pattern {
    fn eq(&self, other: &Self) -> bool {
        self.raw == other.raw
    }
}

impl Eq for Pattern {}

impl fmt::Display for Pattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

/// Build the composite key for a pattern and optional file-name pattern
pub fn composite_key(pattern: &str, aux: Option<&str>) -> String {
    match aux {
        Some(aux) => format!("{}{}{}", pattern, KEY_SEPARATOR, aux),
        None => pattern.to_string(),
    }
}

/// One pattern subscription: id matcher plus optional file-name matcher
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PatternSubscription {
    key: String,
    pattern: Pattern,
    aux: Option<Pattern>,
}

impl PatternSubscription {
    pub fn new(pattern: &str, aux: Option<&str>) -> Result<Self, PatternError> {
        let compiled = Pattern::compile(pattern)?;
        let aux = aux.map(Pattern::compile).transpose()?;
        Ok(Self {
            key: composite_key(pattern, aux.as_ref().map(|a| a.as_str())),
            pattern: compiled,
            aux,
        })
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn pattern(&self) -> &Pattern {
        &self.pattern
    }

    pub fn aux(&self) -> Option<&Pattern> {
        self.aux.as_ref()
    }

    /// Match an id and, for file subscriptions, a file name.
    /// A subscription without a file-name pattern accepts any file.
    pub fn matches(&self, id: &str, file: Option<&str>) -> bool {
        if !self.pattern.matches(id) {
            return false;
        }
        match (&self.aux, file) {
            (Some(aux), Some(file)) => aux.matches(file),
            (Some(_), None) => false,
            (None, _) => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pattern_compile_valid() {
        assert!(Pattern::compile("*").is_ok());
        assert!(Pattern::compile("system.adapter.*").is_ok());
        assert!(Pattern::compile("*.info.connection").is_ok());
        assert!(Pattern::compile("javascript.0.[weird](chars)+").is_ok());
    }

    #[test]
    fn test_pattern_compile_invalid() {
        assert_eq!(Pattern::compile("").unwrap_err(), PatternError::Empty);
        assert_eq!(
            Pattern::compile("system. adapter").unwrap_err(),
            PatternError::InvalidCharacter(' ')
        );
    }

    #[test]
    fn test_pattern_matching() {
        let all = Pattern::compile("*").unwrap();
        let adapters = Pattern::compile("system.adapter.*").unwrap();
        let suffix = Pattern::compile("*.info.connection").unwrap();
        let exact = Pattern::compile("hm-rpc.0.info.connection").unwrap();

        assert!(all.matches("anything.at.all"));
        assert!(adapters.matches("system.adapter.admin.0"));
        assert!(adapters.matches("system.adapter.admin.0.alive"));
        assert!(!adapters.matches("system.host.pi"));
        assert!(suffix.matches("hm-rpc.0.info.connection"));
        assert!(!suffix.matches("hm-rpc.0.info.connection.extra"));
        assert!(exact.matches("hm-rpc.0.info.connection"));
        assert!(!exact.matches("hm-rpc.1.info.connection"));
    }

    #[test]
    fn test_regex_metacharacters_are_literal() {
        let p = Pattern::compile("a.b").unwrap();
        assert!(p.matches("a.b"));
        assert!(!p.matches("axb"));
    }

    #[test]
    fn test_composite_key() {
        assert_eq!(composite_key("vis.0", Some("*.css")), "vis.0####*.css");
        assert_eq!(composite_key("vis.0", None), "vis.0");
    }

    #[test]
    fn test_file_subscription_matching() {
        let sub = PatternSubscription::new("vis.0", Some("main/*.json")).unwrap();
        assert_eq!(sub.key(), "vis.0####main/*.json");
        assert!(sub.matches("vis.0", Some("main/views.json")));
        assert!(!sub.matches("vis.0", Some("other/views.json")));
        assert!(!sub.matches("vis.1", Some("main/views.json")));
        assert!(!sub.matches("vis.0", None));

        let plain = PatternSubscription::new("system.adapter.*", None).unwrap();
        assert!(plain.matches("system.adapter.admin.0", None));
    }
}
