//! Filter rule grammar and matching.
//!
//! A rule has the form `<task|*>.<eventType|*>:<level>`. A wildcard task
//! requires a wildcard event type, so `*.Open:3` is rejected.

use crate::{Error, Result};
use std::fmt;
use tracesieve_core::{LEVEL_NOISE, LEVEL_SILENT};

/// The wildcard token in rule text.
pub const WILDCARD: &str = "*";

/// How specifically a rule matches an event.
///
/// Variants are declared from least to most specific, so the derived ordering
/// ranks them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Closeness {
    /// The rule does not apply to the event.
    NoMatch,
    /// `*.*` rule.
    WildcardWildcard,
    /// `Task.*` rule with a matching task.
    TaskWildcard,
    /// `Task.Event` rule with matching task and event type.
    TaskEvent,
}

impl Closeness {
    /// The highest closeness a rule can reach.
    pub const MAX: Closeness = Closeness::TaskEvent;
}

/// One parsed filter rule.
///
/// `None` in `task_name` or `event_type` is the wildcard.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilterRule {
    /// Task name to match, or wildcard.
    pub task_name: Option<String>,

    /// Event type to match, or wildcard.
    pub event_type: Option<String>,

    /// Most verbose level admitted by this rule.
    pub level: u8,
}

impl FilterRule {
    /// Parse one rule.
    pub fn parse(text: &str) -> Result<Self> {
        let text = text.trim();
        let invalid = |reason: &str| Error::FilterRule {
            rule: text.to_string(),
            reason: reason.to_string(),
        };

        let (pattern, level) = text
            .rsplit_once(':')
            .ok_or_else(|| invalid("expected '<task>.<event>:<level>'"))?;

        let level: u8 = level
            .trim()
            .parse()
            .map_err(|_| invalid("level is not a number"))?;
        if !(LEVEL_SILENT..=LEVEL_NOISE).contains(&level) {
            return Err(invalid("level must be between 0 and 5"));
        }

        let (task, event) = pattern
            .split_once('.')
            .ok_or_else(|| invalid("expected '<task>.<event>' before the level"))?;
        let task = task.trim();
        let event = event.trim();
        if task.is_empty() || event.is_empty() {
            return Err(invalid("task and event type must not be empty"));
        }

        let task_name = (task != WILDCARD).then(|| task.to_string());
        let event_type = (event != WILDCARD).then(|| event.to_string());
        if task_name.is_none() && event_type.is_some() {
            return Err(invalid("wildcard task requires wildcard event type"));
        }

        Ok(Self {
            task_name,
            event_type,
            level,
        })
    }

    /// The `(task, event type)` pair that identifies this rule.
    ///
    /// At most one rule per key may exist in a filter.
    pub fn key(&self) -> (Option<&str>, Option<&str>) {
        (self.task_name.as_deref(), self.event_type.as_deref())
    }

    /// How closely this rule matches an event.
    ///
    /// `event_type` must already have its identifier suffix stripped.
    pub fn closeness(&self, task_name: &str, event_type: &str) -> Closeness {
        match (&self.task_name, &self.event_type) {
            (None, _) => Closeness::WildcardWildcard,
            (Some(task), None) if task == task_name => Closeness::TaskWildcard,
            (Some(task), Some(event)) if task == task_name && event == event_type => {
                Closeness::TaskEvent
            }
            _ => Closeness::NoMatch,
        }
    }

    /// Whether an event at `level` passes this rule.
    pub fn admits(&self, level: u8) -> bool {
        self.level >= level
    }
}

impl fmt::Display for FilterRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}.{}:{}",
            self.task_name.as_deref().unwrap_or(WILDCARD),
            self.event_type.as_deref().unwrap_or(WILDCARD),
            self.level
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_forms() {
        let rule = FilterRule::parse("*.*:3").unwrap();
        assert_eq!(rule.key(), (None, None));
        assert_eq!(rule.level, 3);

        let rule = FilterRule::parse(" Transport.* : 4 ").unwrap();
        assert_eq!(rule.key(), (Some("Transport"), None));
        assert_eq!(rule.level, 4);

        let rule = FilterRule::parse("Transport.Send:5").unwrap();
        assert_eq!(rule.key(), (Some("Transport"), Some("Send")));
    }

    #[test]
    fn test_event_type_may_contain_dots() {
        let rule = FilterRule::parse("Hosting.Activation.Start:2").unwrap();
        assert_eq!(rule.key(), (Some("Hosting"), Some("Activation.Start")));
    }

    #[test]
    fn test_wildcard_task_with_specific_event_rejected() {
        let err = FilterRule::parse("*.Open:3").unwrap_err();
        assert!(matches!(err, Error::FilterRule { .. }));
    }

    #[test]
    fn test_malformed_rules_rejected() {
        for text in ["Transport", "Transport.Send", "Transport:3", ".Send:3", "A.B:x", "A.B:6"] {
            assert!(FilterRule::parse(text).is_err(), "{text} should be rejected");
        }
    }

    #[test]
    fn test_closeness() {
        let any = FilterRule::parse("*.*:1").unwrap();
        let task = FilterRule::parse("TaskA.*:1").unwrap();
        let exact = FilterRule::parse("TaskA.EventX:1").unwrap();

        assert_eq!(any.closeness("TaskB", "EventZ"), Closeness::WildcardWildcard);
        assert_eq!(task.closeness("TaskA", "EventY"), Closeness::TaskWildcard);
        assert_eq!(task.closeness("TaskB", "EventY"), Closeness::NoMatch);
        assert_eq!(exact.closeness("TaskA", "EventX"), Closeness::TaskEvent);
        assert_eq!(exact.closeness("TaskA", "EventY"), Closeness::NoMatch);
        assert_eq!(exact.closeness("taska", "EventX"), Closeness::NoMatch);
    }

    #[test]
    fn test_closeness_ranking() {
        assert!(Closeness::NoMatch < Closeness::WildcardWildcard);
        assert!(Closeness::WildcardWildcard < Closeness::TaskWildcard);
        assert!(Closeness::TaskWildcard < Closeness::TaskEvent);
        assert_eq!(Closeness::MAX, Closeness::TaskEvent);
    }

    #[test]
    fn test_display() {
        assert_eq!(FilterRule::parse("*.*:2").unwrap().to_string(), "*.*:2");
        assert_eq!(FilterRule::parse("A.B:0").unwrap().to_string(), "A.B:0");
    }
}
