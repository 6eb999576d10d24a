//! Append-only record of what a run did, for end-of-run reporting.
//!
//! Nothing in here feeds back into engine decisions.

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::error::ErrorCode;
use crate::hygiene::Finding;
use crate::model::ItemId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationKind {
    Created,
    Updated,
}

/// One aggregate created or updated by the grouping pass.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Operation {
    pub kind: OperationKind,
    pub aggregate_id: ItemId,
    pub title: String,
    /// Members listed by the group.
    pub member_count: usize,
    /// Relation creations attempted this run.
    pub added_relations: usize,
    /// Dangling aggregate id this creation replaced.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub recovered_from: Option<ItemId>,
}

/// An estimate written back to an aggregate.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EstimateChange {
    pub aggregate_id: ItemId,
    pub title: String,
    pub previous: Option<f64>,
    pub total: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WarningKind {
    MalformedMarker,
    MissingAggregate,
    RelationFailed,
    AnchorRewriteFailed,
    MemberCountMismatch,
    EstimateMismatch,
    MissingEstimate,
    DanglingMember,
    AggregateVanished,
}

/// A contained problem: the run carried on past it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RunWarning {
    pub kind: WarningKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub item_id: Option<ItemId>,
    pub message: String,
}

/// A group or aggregate that was abandoned.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Failure {
    /// Group name or aggregate title.
    pub subject: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub item_id: Option<ItemId>,
    pub code: &'static str,
    pub error: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OperationLog {
    pub started_at: DateTime<Utc>,
    pub operations: Vec<Operation>,
    pub estimate_updates: Vec<EstimateChange>,
    pub warnings: Vec<RunWarning>,
    pub failures: Vec<Failure>,
    pub findings: Vec<Finding>,
}

impl Default for OperationLog {
    fn default() -> Self {
        Self::new()
    }
}

impl OperationLog {
    #[must_use]
    pub fn new() -> Self {
        Self {
            started_at: Utc::now(),
            operations: Vec::new(),
            estimate_updates: Vec::new(),
            warnings: Vec::new(),
            failures: Vec::new(),
            findings: Vec::new(),
        }
    }

    pub fn record(&mut self, operation: Operation) {
        self.operations.push(operation);
    }

    pub fn record_estimate(&mut self, change: EstimateChange) {
        self.estimate_updates.push(change);
    }

    pub fn warn(&mut self, kind: WarningKind, item_id: Option<ItemId>, message: impl Into<String>) {
        self.warnings.push(RunWarning {
            kind,
            item_id,
            message: message.into(),
        });
    }

    pub fn fail(
        &mut self,
        subject: impl Into<String>,
        item_id: Option<ItemId>,
        code: ErrorCode,
        error: impl ToString,
    ) {
        self.failures.push(Failure {
            subject: subject.into(),
            item_id,
            code: code.code(),
            error: error.to_string(),
        });
    }

    pub fn extend_findings(&mut self, findings: impl IntoIterator<Item = Finding>) {
        self.findings.extend(findings);
    }

    #[must_use]
    pub fn count(&self, kind: OperationKind) -> usize {
        self.operations.iter().filter(|op| op.kind == kind).count()
    }

    #[must_use]
    pub fn warnings_of(&self, kind: WarningKind) -> Vec<&RunWarning> {
        self.warnings.iter().filter(|w| w.kind == kind).collect()
    }

    #[must_use]
    pub fn has_failures(&self) -> bool {
        !self.failures.is_empty()
    }

    /// Total relation creations attempted across all operations.
    #[must_use]
    pub fn added_relations(&self) -> usize {
        self.operations.iter().map(|op| op.added_relations).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn op(kind: OperationKind, added: usize) -> Operation {
        Operation {
            kind,
            aggregate_id: 7,
            title: "Q1".to_string(),
            member_count: 3,
            added_relations: added,
            recovered_from: None,
        }
    }

    #[test]
    fn counts_and_totals() {
        let mut log = OperationLog::new();
        log.record(op(OperationKind::Created, 3));
        log.record(op(OperationKind::Updated, 1));
        log.record(op(OperationKind::Updated, 0));

        assert_eq!(log.count(OperationKind::Created), 1);
        assert_eq!(log.count(OperationKind::Updated), 2);
        assert_eq!(log.added_relations(), 4);
        assert!(!log.has_failures());
    }

    #[test]
    fn failures_carry_stable_codes() {
        let mut log = OperationLog::new();
        log.fail("Q1", Some(3), ErrorCode::TransportFailure, "reset");
        assert!(log.has_failures());
        assert_eq!(log.failures[0].code, "E2002");
    }

    #[test]
    fn serializes_operation_kinds_lowercase() {
        let json = serde_json::to_value(op(OperationKind::Created, 2)).expect("serialize");
        assert_eq!(json["kind"], "created");
        assert!(json.get("recovered_from").is_none());
    }
}
