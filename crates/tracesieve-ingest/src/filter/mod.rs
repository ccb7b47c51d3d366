//! Per-event inclusion filtering.
//!
//! This module provides:
//!
//! - [`InclusionFilter`] - Parsed rule set deciding whether an event is kept
//! - [`FilterAliases`] - Named rule lists substituted before parsing
//! - [`FilterHandle`] - The active filter of one source, swappable at runtime
//! - [`FilterRegistry`] - Handles by application id, owned by the daemon
//!
//! # Rule Selection
//!
//! Every rule is ranked against the event by [`Closeness`]. The closest rule
//! wins; if it admits the event's level the event is included. An event that
//! no rule matches is excluded. A filter with no rules includes everything.
//!
//! ```text
//! rules:  *.*:3   TaskA.*:4   TaskA.EventX:5
//!
//! (TaskA, EventX, 5)  -> TaskA.EventX:5  -> included
//! (TaskA, EventY, 4)  -> TaskA.*:4       -> included
//! (TaskB, EventZ, 4)  -> *.*:3           -> excluded
//! ```

mod rule;

pub use rule::{Closeness, FilterRule, WILDCARD};

use crate::Result;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::Arc;
use tracesieve_core::TraceEvent;
use tracing::{error, info, warn};

/// Alias expanding to the default rule list.
pub const DEFAULT_ALIAS: &str = "_default_";

/// Alias expanding to the summary rule list.
pub const SUMMARY_ALIAS: &str = "_summary_";

/// Outcome of evaluating a filter against one event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// The event is forwarded to the sink.
    Included,
    /// The event is dropped.
    Excluded,
}

impl Decision {
    /// Whether the event is forwarded.
    pub fn is_included(self) -> bool {
        self == Decision::Included
    }
}

/// Rule lists substituted for the reserved aliases before parsing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilterAliases {
    /// Expansion of `_default_`.
    pub default_rules: String,

    /// Expansion of `_summary_`.
    pub summary_rules: String,
}

impl Default for FilterAliases {
    fn default() -> Self {
        Self {
            default_rules: "*.*:4".to_string(),
            summary_rules: "*.*:2,FabricNode.*:4,Hosting.*:4,Reconfiguration.*:4".to_string(),
        }
    }
}

impl FilterAliases {
    /// Replace alias tokens in a comma-separated rule string.
    pub fn expand(&self, rules: &str) -> String {
        rules
            .split(',')
            .map(|token| match token.trim() {
                DEFAULT_ALIAS => self.default_rules.as_str(),
                SUMMARY_ALIAS => self.summary_rules.as_str(),
                _ => token,
            })
            .collect::<Vec<_>>()
            .join(",")
    }
}

/// Why a parsed rule was left out of the filter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    /// An earlier rule has the same key and level.
    Duplicate,
    /// An earlier rule has the same key but a different level.
    ConflictingLevel,
}

/// A rule removed during filter construction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DroppedRule {
    /// The rule that was dropped.
    pub rule: FilterRule,

    /// The earlier rule that was kept in its place.
    pub kept: FilterRule,

    /// Why it was dropped.
    pub reason: DropReason,
}

/// A parsed, immutable rule set.
#[derive(Debug, Clone, Default)]
pub struct InclusionFilter {
    rules: Vec<FilterRule>,
    dropped: Vec<DroppedRule>,
}

impl InclusionFilter {
    /// A filter that includes every event.
    pub fn include_all() -> Self {
        Self::default()
    }

    /// Parse a comma-separated rule string, expanding aliases first.
    ///
    /// A malformed rule fails the whole construction. When two rules share a
    /// `(task, event type)` key the later one is dropped and logged, and the
    /// earlier one stays in effect.
    pub fn parse(rules: &str, aliases: &FilterAliases) -> Result<Self> {
        let expanded = aliases.expand(rules);
        let mut filter = Self::default();
        let mut by_key: HashMap<(Option<String>, Option<String>), usize> = HashMap::new();

        for text in expanded.split(',').map(str::trim).filter(|t| !t.is_empty()) {
            let rule = FilterRule::parse(text)?;
            let key = (rule.task_name.clone(), rule.event_type.clone());

            if let Some(&existing) = by_key.get(&key) {
                let kept = filter.rules[existing].clone();
                let reason = if kept.level == rule.level {
                    warn!("Dropping duplicate filter rule {}", rule);
                    DropReason::Duplicate
                } else {
                    error!(
                        "Filter rule {} conflicts with earlier rule {}; keeping the earlier rule",
                        rule, kept
                    );
                    DropReason::ConflictingLevel
                };
                filter.dropped.push(DroppedRule { rule, kept, reason });
                continue;
            }

            by_key.insert(key, filter.rules.len());
            filter.rules.push(rule);
        }

        Ok(filter)
    }

    /// Rules in effect, in declaration order.
    pub fn rules(&self) -> &[FilterRule] {
        &self.rules
    }

    /// Rules removed during construction.
    pub fn dropped_rules(&self) -> &[DroppedRule] {
        &self.dropped
    }

    /// Whether the filter has no rules (and so includes everything).
    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// The closest rule for a task and (suffix-stripped) event type.
    pub fn closest_rule(&self, task_name: &str, event_type: &str) -> Option<&FilterRule> {
        let mut best: Option<(&FilterRule, Closeness)> = None;

        for rule in &self.rules {
            let closeness = rule.closeness(task_name, event_type);
            if closeness == Closeness::NoMatch {
                continue;
            }
            if best.is_none_or(|(_, c)| closeness > c) {
                best = Some((rule, closeness));
                if closeness == Closeness::MAX {
                    break;
                }
            }
        }

        best.map(|(rule, _)| rule)
    }

    /// Evaluate the filter for one event.
    pub fn decide(&self, event: &TraceEvent) -> Decision {
        if self.rules.is_empty() {
            return Decision::Included;
        }

        match self.closest_rule(&event.task_name, event.base_event_type()) {
            Some(rule) if rule.admits(event.level) => Decision::Included,
            _ => Decision::Excluded,
        }
    }

    /// Whether the event should be forwarded.
    pub fn should_include(&self, event: &TraceEvent) -> bool {
        self.decide(event).is_included()
    }
}

/// The active filter for one source.
///
/// Replacing the filter takes a dedicated lock. Readers take the same lock
/// only to clone the current `Arc`, so evaluation runs without it.
#[derive(Debug, Clone)]
pub struct FilterHandle {
    current: Arc<Mutex<Arc<InclusionFilter>>>,
}

impl FilterHandle {
    /// Create a handle holding `filter`.
    pub fn new(filter: InclusionFilter) -> Self {
        Self {
            current: Arc::new(Mutex::new(Arc::new(filter))),
        }
    }

    /// The filter in effect right now.
    pub fn snapshot(&self) -> Arc<InclusionFilter> {
        Arc::clone(&self.current.lock())
    }

    /// Swap in a new filter. Passes already running keep their snapshot.
    pub fn replace(&self, filter: InclusionFilter) {
        *self.current.lock() = Arc::new(filter);
    }
}

impl Default for FilterHandle {
    fn default() -> Self {
        Self::new(InclusionFilter::include_all())
    }
}

/// Filter handles by application id.
///
/// Constructed once by the daemon and passed to the components that need it.
#[derive(Debug, Default)]
pub struct FilterRegistry {
    handles: RwLock<HashMap<String, FilterHandle>>,
}

impl FilterRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Install a filter for an application, replacing any previous one.
    ///
    /// Existing handles for the application observe the new filter.
    pub fn install(&self, app_id: &str, filter: InclusionFilter) -> FilterHandle {
        let mut handles = self.handles.write();
        match handles.get(app_id) {
            Some(handle) => {
                handle.replace(filter);
                info!("Replaced filter for {}", app_id);
                handle.clone()
            }
            None => {
                let handle = FilterHandle::new(filter);
                handles.insert(app_id.to_string(), handle.clone());
                info!("Registered filter for {}", app_id);
                handle
            }
        }
    }

    /// The handle for an application, if one is registered.
    pub fn get(&self, app_id: &str) -> Option<FilterHandle> {
        self.handles.read().get(app_id).cloned()
    }

    /// Remove an application's filter.
    pub fn remove(&self, app_id: &str) -> Option<FilterHandle> {
        self.handles.write().remove(app_id)
    }

    /// Number of registered applications.
    pub fn len(&self) -> usize {
        self.handles.read().len()
    }

    /// Whether no applications are registered.
    pub fn is_empty(&self) -> bool {
        self.handles.read().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    fn event(task: &str, event_type: &str, level: u8) -> TraceEvent {
        TraceEvent {
            timestamp: Utc.timestamp_opt(1_700_000_000, 0).unwrap(),
            level,
            thread_id: 0,
            process_id: 0,
            task_name: task.to_string(),
            event_type: event_type.to_string(),
            event_text: String::new(),
        }
    }

    fn filter(rules: &str) -> InclusionFilter {
        InclusionFilter::parse(rules, &FilterAliases::default()).unwrap()
    }

    #[test]
    fn test_closest_rule_wins() {
        let f = filter("*.*:3, TaskA.*:4, TaskA.EventX:5");

        assert!(f.should_include(&event("TaskA", "EventX", 5)));
        assert!(f.should_include(&event("TaskA", "EventY", 4)));
        assert!(!f.should_include(&event("TaskB", "EventZ", 4)));
    }

    #[test]
    fn test_declaration_order_does_not_matter() {
        let f = filter("TaskA.EventX:5,TaskA.*:4,*.*:3");
        assert!(f.should_include(&event("TaskA", "EventX", 5)));
        assert!(!f.should_include(&event("TaskA", "EventY", 5)));
        assert!(f.should_include(&event("TaskB", "EventZ", 3)));
    }

    #[test]
    fn test_exact_rule_can_be_stricter_than_wildcard() {
        let f = filter("*.*:5,Lease.Renew:1");
        assert!(!f.should_include(&event("Lease", "Renew", 3)));
        assert!(f.should_include(&event("Lease", "Expire", 3)));
    }

    #[test]
    fn test_no_rules_includes_everything() {
        let f = filter("");
        assert!(f.is_empty());
        assert_eq!(f.decide(&event("Any", "Thing", 5)), Decision::Included);
    }

    #[test]
    fn test_unmatched_event_excluded() {
        let f = filter("TaskA.*:5");
        assert_eq!(f.decide(&event("TaskB", "X", 0)), Decision::Excluded);
    }

    #[test]
    fn test_event_type_suffix_stripped_before_matching() {
        let f = filter("Replica.Open:4");
        assert!(f.should_include(&event("Replica", "Open@3f2a", 4)));
        assert!(!f.should_include(&event("Replica", "Close@3f2a", 4)));
    }

    #[test]
    fn test_duplicate_same_level_dropped() {
        let f = filter("TaskA.*:4,TaskA.*:4");
        assert_eq!(f.rules().len(), 1);
        assert_eq!(f.dropped_rules().len(), 1);
        assert_eq!(f.dropped_rules()[0].reason, DropReason::Duplicate);
    }

    #[test]
    fn test_conflicting_duplicate_keeps_earlier_rule() {
        let f = filter("TaskA.EventX:2,*.*:5,TaskA.EventX:5");
        assert_eq!(f.rules().len(), 2);

        let dropped = &f.dropped_rules()[0];
        assert_eq!(dropped.reason, DropReason::ConflictingLevel);
        assert_eq!(dropped.rule.level, 5);
        assert_eq!(dropped.kept.level, 2);

        // The earlier level stays in effect, no merge.
        assert!(!f.should_include(&event("TaskA", "EventX", 3)));
    }

    #[test]
    fn test_malformed_rule_fails_construction() {
        let err = InclusionFilter::parse("*.*:3,*.Open:2", &FilterAliases::default()).unwrap_err();
        assert!(err.to_string().contains("*.Open:2"));
    }

    #[test]
    fn test_aliases_expand() {
        let aliases = FilterAliases {
            default_rules: "*.*:3".to_string(),
            summary_rules: "*.*:1,Lease.*:4".to_string(),
        };

        assert_eq!(aliases.expand("_default_"), "*.*:3");
        assert_eq!(aliases.expand("_summary_, Hosting.*:5"), "*.*:1,Lease.*:4, Hosting.*:5");

        let f = InclusionFilter::parse("_summary_", &aliases).unwrap();
        assert_eq!(f.rules().len(), 2);
        assert!(f.should_include(&event("Lease", "Renew", 4)));
        assert!(!f.should_include(&event("Other", "Thing", 2)));
    }

    #[test]
    fn test_default_aliases_parse() {
        let aliases = FilterAliases::default();
        assert!(InclusionFilter::parse(DEFAULT_ALIAS, &aliases).is_ok());
        let summary = InclusionFilter::parse(SUMMARY_ALIAS, &aliases).unwrap();
        assert!(summary.dropped_rules().is_empty());
    }

    #[test]
    fn test_handle_snapshot_survives_replace() {
        let handle = FilterHandle::new(filter("*.*:1"));
        let before = handle.snapshot();

        handle.replace(filter("*.*:5"));
        let after = handle.snapshot();

        assert!(!before.should_include(&event("A", "B", 4)));
        assert!(after.should_include(&event("A", "B", 4)));
    }

    #[test]
    fn test_registry_install_updates_existing_handles() {
        let registry = FilterRegistry::new();
        assert!(registry.is_empty());

        let handle = registry.install("fabric:/App", filter("*.*:1"));
        registry.install("fabric:/App", filter("*.*:5"));

        assert_eq!(registry.len(), 1);
        assert_eq!(handle.snapshot().rules()[0].level, 5);
        assert!(registry.get("fabric:/Other").is_none());

        registry.remove("fabric:/App");
        assert!(registry.get("fabric:/App").is_none());
    }
}
