//! Topic patterns.
//!
//! A pattern is either an exact topic or a prefix ending in `*`. There is no
//! hierarchy beyond that single trailing wildcard: `external.*` matches
//! `external.device_discovered` and `external.a.b` alike, and a bare `*`
//! matches every topic.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::types::{Error, Result};

/// Subscription pattern.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum TopicPattern {
    Exact(String),
    /// Stored without the trailing `*`.
    Prefix(String),
}

impl TopicPattern {
    pub fn parse(raw: &str) -> Result<Self> {
        if raw.is_empty() {
            return Err(Error::validation("topic pattern cannot be empty"));
        }
        match raw.find('*') {
            None => Ok(TopicPattern::Exact(raw.to_string())),
            Some(pos) if pos == raw.len() - 1 => {
                Ok(TopicPattern::Prefix(raw[..pos].to_string()))
            }
            Some(_) => Err(Error::validation(format!(
                "wildcard is only allowed at the end of a pattern: {}",
                raw
            ))),
        }
    }

    pub fn matches(&self, topic: &str) -> bool {
        match self {
            TopicPattern::Exact(exact) => exact == topic,
            TopicPattern::Prefix(prefix) => topic.starts_with(prefix.as_str()),
        }
    }

    pub fn is_wildcard(&self) -> bool {
        matches!(self, TopicPattern::Prefix(_))
    }
}

/// Check that a topic is publishable: non-empty and free of wildcards.
pub fn validate_topic(topic: &str) -> Result<()> {
    if topic.is_empty() {
        return Err(Error::validation("topic cannot be empty"));
    }
    if topic.contains('*') {
        return Err(Error::validation(format!(
            "cannot publish to a wildcard topic: {}",
            topic
        )));
    }
    Ok(())
}

impl fmt::Display for TopicPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TopicPattern::Exact(exact) => write!(f, "{}", exact),
            TopicPattern::Prefix(prefix) => write!(f, "{}*", prefix),
        }
    }
}

impl FromStr for TopicPattern {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl TryFrom<String> for TopicPattern {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        Self::parse(&value)
    }
}

impl From<TopicPattern> for String {
    fn from(pattern: TopicPattern) -> Self {
        pattern.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_parse_exact_and_prefix() {
        assert_eq!(
            TopicPattern::parse("external.device_discovered").unwrap(),
            TopicPattern::Exact("external.device_discovered".to_string())
        );
        assert_eq!(
            TopicPattern::parse("external.*").unwrap(),
            TopicPattern::Prefix("external.".to_string())
        );
        assert_eq!(
            TopicPattern::parse("*").unwrap(),
            TopicPattern::Prefix(String::new())
        );
    }

    #[test]
    fn test_parse_rejects_bad_patterns() {
        assert!(TopicPattern::parse("").is_err());
        assert!(TopicPattern::parse("*.device").is_err());
        assert!(TopicPattern::parse("a.*.b").is_err());
        assert!(TopicPattern::parse("a.**").is_err());
    }

    #[test]
    fn test_matching() {
        let wildcard = TopicPattern::parse("external.*").unwrap();
        assert!(wildcard.matches("external.device_discovered"));
        assert!(wildcard.matches("external.a.b"));
        assert!(!wildcard.matches("internal.device_discovered"));
        assert!(!wildcard.matches("external"));

        let exact = TopicPattern::parse("a.event").unwrap();
        assert!(exact.matches("a.event"));
        assert!(!exact.matches("a.event.more"));
    }

    #[test]
    fn test_display_round_trips_through_serde() {
        let pattern = TopicPattern::parse("devices.*").unwrap();
        assert_eq!(pattern.to_string(), "devices.*");

        let json = serde_json::to_string(&pattern).unwrap();
        assert_eq!(json, "\"devices.*\"");
        let back: TopicPattern = serde_json::from_str(&json).unwrap();
        assert_eq!(back, pattern);
    }

    #[test]
    fn test_validate_topic() {
        assert!(validate_topic("a.event").is_ok());
        assert!(validate_topic("").is_err());
        assert!(validate_topic("a.*").is_err());
    }

    proptest! {
        #[test]
        fn exact_pattern_matches_only_itself(topic in "[a-z_]{1,8}(\\.[a-z_]{1,8}){0,3}", other in "[a-z_.]{1,16}") {
            let pattern = TopicPattern::parse(&topic).unwrap();
            prop_assert!(pattern.matches(&topic));
            prop_assert_eq!(pattern.matches(&other), other == topic);
        }

        #[test]
        fn prefix_pattern_matches_every_extension(prefix in "[a-z_]{1,8}\\.", suffix in "[a-z_.]{0,16}") {
            let pattern = TopicPattern::parse(&format!("{}*", prefix)).unwrap();
            let topic = format!("{}{}", prefix, suffix);
            prop_assert!(pattern.matches(&topic));
        }
    }
}
