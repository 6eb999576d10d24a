//! Read-only checks over aggregates and their members.

use std::collections::BTreeSet;
use std::fmt;

use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::error::TrackerError;
use crate::model::{ItemId, StateCategory, WorkItem};
use crate::oplog::{OperationLog, WarningKind};
use crate::tracker::{TrackerClient, load_members};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warning,
    Error,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(match self {
            Self::Info => "info",
            Self::Warning => "warning",
            Self::Error => "error",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Finding {
    pub rule: &'static str,
    pub severity: Severity,
    pub item_id: ItemId,
    pub message: String,
}

pub trait HygieneRule {
    fn name(&self) -> &'static str;
    fn check(&self, aggregate: &WorkItem, members: &[WorkItem]) -> Vec<Finding>;
}

/// Aggregate links no members at all.
pub struct EmptyAggregate;

impl HygieneRule for EmptyAggregate {
    fn name(&self) -> &'static str {
        "empty-aggregate"
    }

    fn check(&self, aggregate: &WorkItem, members: &[WorkItem]) -> Vec<Finding> {
        if members.is_empty() && aggregate.linked_ids().is_empty() {
            vec![Finding {
                rule: self.name(),
                severity: Severity::Error,
                item_id: aggregate.id,
                message: format!("'{}' has no linked members", aggregate.title),
            }]
        } else {
            Vec::new()
        }
    }
}

pub struct MissingEstimate;

impl HygieneRule for MissingEstimate {
    fn name(&self) -> &'static str {
        "missing-estimate"
    }

    fn check(&self, aggregate: &WorkItem, members: &[WorkItem]) -> Vec<Finding> {
        members
            .iter()
            .filter(|m| m.estimate.is_none())
            .map(|m| Finding {
                rule: self.name(),
                severity: Severity::Warning,
                item_id: m.id,
                message: format!("'{}' in '{}' has no estimate", m.title, aggregate.title),
            })
            .collect()
    }
}

/// Aggregate is closed while some member is not.
pub struct ClosedWithActiveMembers;

impl HygieneRule for ClosedWithActiveMembers {
    fn name(&self) -> &'static str {
        "closed-with-active-members"
    }

    fn check(&self, aggregate: &WorkItem, members: &[WorkItem]) -> Vec<Finding> {
        if aggregate.state_category() != StateCategory::Closed {
            return Vec::new();
        }
        let open: Vec<String> = members
            .iter()
            .filter(|m| m.state_category() != StateCategory::Closed)
            .map(|m| m.id.to_string())
            .collect();
        if open.is_empty() {
            return Vec::new();
        }
        vec![Finding {
            rule: self.name(),
            severity: Severity::Warning,
            item_id: aggregate.id,
            message: format!(
                "'{}' is {} but members {} are still open",
                aggregate.title,
                aggregate.state,
                open.join(", ")
            ),
        }]
    }
}

pub struct IterationSpread;

impl HygieneRule for IterationSpread {
    fn name(&self) -> &'static str {
        "iteration-spread"
    }

    fn check(&self, aggregate: &WorkItem, members: &[WorkItem]) -> Vec<Finding> {
        let iterations: BTreeSet<&str> = members
            .iter()
            .map(|m| m.iteration_path.as_str())
            .filter(|path| !path.is_empty())
            .collect();
        if iterations.len() <= 1 {
            return Vec::new();
        }
        vec![Finding {
            rule: self.name(),
            severity: Severity::Info,
            item_id: aggregate.id,
            message: format!(
                "members of '{}' span {} iterations: {}",
                aggregate.title,
                iterations.len(),
                iterations.into_iter().collect::<Vec<_>>().join(", ")
            ),
        }]
    }
}

#[must_use]
pub fn default_rules() -> Vec<Box<dyn HygieneRule>> {
    vec![
        Box::new(EmptyAggregate),
        Box::new(MissingEstimate),
        Box::new(ClosedWithActiveMembers),
        Box::new(IterationSpread),
    ]
}

/// Run every rule against one aggregate.
#[must_use]
pub fn check_aggregate(
    rules: &[Box<dyn HygieneRule>],
    aggregate: &WorkItem,
    members: &[WorkItem],
) -> Vec<Finding> {
    rules
        .iter()
        .flat_map(|rule| {
            let findings = rule.check(aggregate, members);
            debug!(rule = rule.name(), aggregate = aggregate.id, found = findings.len(), "checked");
            findings
        })
        .collect()
}

pub struct HygienePass<'a, C: ?Sized> {
    client: &'a C,
    rules: Vec<Box<dyn HygieneRule>>,
}

impl<'a, C> HygienePass<'a, C>
where
    C: TrackerClient + ?Sized,
{
    #[must_use]
    pub fn new(client: &'a C) -> Self {
        Self::with_rules(client, default_rules())
    }

    #[must_use]
    pub fn with_rules(client: &'a C, rules: Vec<Box<dyn HygieneRule>>) -> Self {
        Self { client, rules }
    }

    pub fn run(&self, aggregates: &[WorkItem], log: &mut OperationLog) {
        info!(aggregates = aggregates.len(), rules = self.rules.len(), "running hygiene checks");
        for aggregate in aggregates {
            match self.check_one(aggregate.id) {
                Ok(Some(findings)) => log.extend_findings(findings),
                Ok(None) => {
                    warn!(aggregate = aggregate.id, "aggregate disappeared before hygiene checks");
                    log.warn(
                        WarningKind::AggregateVanished,
                        Some(aggregate.id),
                        format!("'{}' no longer exists; hygiene not checked", aggregate.title),
                    );
                }
                Err(err) => {
                    error!(aggregate = aggregate.id, %err, "hygiene check failed");
                    log.fail(aggregate.title.clone(), Some(aggregate.id), err.code(), &err);
                }
            }
        }
    }

    fn check_one(&self, id: ItemId) -> Result<Option<Vec<Finding>>, TrackerError> {
        let Some(aggregate) = self.client.get_item_with_relations(id)? else {
            return Ok(None);
        };
        let members = load_members(self.client, &aggregate)?;
        Ok(Some(check_aggregate(&self.rules, &aggregate, &members.items)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryTracker;
    use crate::model::{Relation, RelationKind};

    fn member(id: ItemId, state: &str, iteration: &str, estimate: Option<f64>) -> WorkItem {
        WorkItem {
            state: state.to_string(),
            iteration_path: iteration.to_string(),
            estimate,
            ..WorkItem::new(id, format!("m{id}"))
        }
    }

    fn aggregate(state: &str, members: &[ItemId]) -> WorkItem {
        WorkItem {
            state: state.to_string(),
            relations: members
                .iter()
                .map(|&target| Relation {
                    kind: RelationKind::Related,
                    target,
                    comment: None,
                })
                .collect(),
            ..WorkItem::new(100, "Q1")
        }
    }

    #[test]
    fn empty_aggregate_is_an_error() {
        let findings = EmptyAggregate.check(&aggregate("New", &[]), &[]);
        assert_eq!(findings.len(), 1);
        assert_eq!(findings[0].severity, Severity::Error);
    }

    #[test]
    fn aggregate_with_only_dangling_links_is_not_empty() {
        assert!(EmptyAggregate.check(&aggregate("New", &[7]), &[]).is_empty());
    }

    #[test]
    fn missing_estimate_flags_each_member() {
        let members = [
            member(1, "New", "I1", None),
            member(2, "New", "I1", Some(3.0)),
            member(3, "New", "I1", None),
        ];
        let ids: Vec<_> = MissingEstimate
            .check(&aggregate("New", &[1, 2, 3]), &members)
            .into_iter()
            .map(|f| f.item_id)
            .collect();
        assert_eq!(ids, vec![1, 3]);
    }

    #[test]
    fn closed_aggregate_with_open_member() {
        let members = [member(1, "Done", "I1", None), member(2, "Active", "I1", None)];
        let findings = ClosedWithActiveMembers.check(&aggregate("Closed", &[1, 2]), &members);
        assert_eq!(findings.len(), 1);
        assert!(findings[0].message.contains('2'));

        assert!(
            ClosedWithActiveMembers
                .check(&aggregate("Active", &[1, 2]), &members)
                .is_empty()
        );
    }

    #[test]
    fn iteration_spread_is_informational() {
        let members = [member(1, "New", "Sprint 1", None), member(2, "New", "Sprint 2", None)];
        let findings = IterationSpread.check(&aggregate("New", &[1, 2]), &members);
        assert_eq!(findings[0].severity, Severity::Info);
        assert!(findings[0].message.contains("Sprint 1, Sprint 2"));

        let same = [member(1, "New", "Sprint 1", None), member(2, "New", "Sprint 1", None)];
        assert!(IterationSpread.check(&aggregate("New", &[1, 2]), &same).is_empty());
    }

    #[test]
    fn pass_collects_findings_without_mutating() {
        let tracker = MemoryTracker::with_items(
            "Release Train",
            vec![
                aggregate("Closed", &[1, 2]),
                member(1, "Active", "Sprint 1", None),
                member(2, "Done", "Sprint 2", Some(2.0)),
            ],
        );
        let mut log = OperationLog::new();
        let aggregates = vec![tracker.item(100).expect("aggregate")];
        HygienePass::new(&tracker).run(&aggregates, &mut log);

        let rules: Vec<_> = log.findings.iter().map(|f| f.rule).collect();
        assert_eq!(
            rules,
            vec!["missing-estimate", "closed-with-active-members", "iteration-spread"]
        );
        assert!(tracker.mutations().is_empty());
        assert!(!log.has_failures());
    }

    #[test]
    fn vanished_aggregate_is_warned_not_skipped() {
        let tracker = MemoryTracker::new("Release Train");
        let mut log = OperationLog::new();
        HygienePass::new(&tracker).run(&[aggregate("New", &[1])], &mut log);

        let warnings = log.warnings_of(WarningKind::AggregateVanished);
        assert_eq!(warnings.len(), 1);
        assert_eq!(warnings[0].item_id, Some(100));
        assert!(log.findings.is_empty());
        assert!(!log.has_failures());
    }

    #[test]
    fn unreachable_tracker_records_failure() {
        let tracker = MemoryTracker::with_items("Release Train", vec![aggregate("New", &[])]);
        let aggregates = vec![tracker.item(100).expect("aggregate")];
        tracker.make_unreachable(100);
        let mut log = OperationLog::new();
        HygienePass::new(&tracker).run(&aggregates, &mut log);
        assert_eq!(log.failures.len(), 1);
        assert_eq!(log.failures[0].code, "E2002");
    }
}
