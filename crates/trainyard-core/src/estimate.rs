//! Roll member estimates up into an aggregate's notes field.
//!
//! The stored value lives in a prefix of the notes text:
//!
//! ```text
//! [ESTIMATE: 13] Anything the author wrote stays here.
//! ```
//!
//! Only aggregates carrying the system tag are corrected automatically
//! (unless the policy says otherwise); manually authored aggregates are
//! compared and flagged, never written.

use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::error::TrackerError;
use crate::model::WorkItem;
use crate::oplog::{EstimateChange, OperationLog, WarningKind};
use crate::tracker::{TrackerClient, load_members};

/// Which aggregates the reconciler may write to.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EstimatePolicy {
    /// Only aggregates tagged as system-authored.
    #[default]
    SystemAuthored,
    /// Every aggregate.
    All,
}

fn prefix_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^\s*\[\s*(?i:estimate)\s*:(?P<value>[^\]]*)\] ?")
            .expect("estimate prefix pattern should compile")
    })
}

/// The stored estimate, if the notes start with a prefix holding a finite number.
///
/// A prefix whose value does not parse still counts as a prefix for
/// [`strip`], so a rewrite replaces it.
#[must_use]
pub fn decode(notes: &str) -> Option<f64> {
    prefix_pattern()
        .captures(notes)
        .and_then(|captures| captures.name("value"))
        .and_then(|value| value.as_str().trim().parse::<f64>().ok())
        .filter(|value| value.is_finite())
}

/// Notes with every leading estimate prefix removed. Idempotent.
#[must_use]
pub fn strip(notes: &str) -> &str {
    let mut rest = notes;
    while let Some(found) = prefix_pattern().find(rest) {
        rest = &rest[found.end()..];
    }
    rest
}

/// Replace any existing prefix with `value`.
///
/// When nothing but whitespace would follow the prefix, a short generated
/// sentence is written instead of leaving a bare number.
#[must_use]
pub fn encode(value: f64, notes: &str, member_count: usize) -> String {
    let rest = strip(notes);
    let body = if rest.trim().is_empty() {
        generated_sentence(member_count)
    } else {
        rest.to_string()
    };
    format!("[ESTIMATE: {}] {body}", format_estimate(value))
}

/// Shortest decimal rendering: `13`, `2.5`.
#[must_use]
pub fn format_estimate(value: f64) -> String {
    format!("{value}")
}

fn generated_sentence(member_count: usize) -> String {
    let noun = if member_count == 1 { "item" } else { "items" };
    format!("Estimate rolled up from {member_count} linked {noun}.")
}

/// Sum of member estimates; absent estimates count as zero.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Rollup {
    pub total: f64,
    /// Members without an estimate.
    pub missing: usize,
}

#[must_use]
pub fn rollup(members: &[WorkItem]) -> Rollup {
    members.iter().fold(Rollup::default(), |acc, member| match member.estimate {
        Some(value) => Rollup {
            total: acc.total + value,
            ..acc
        },
        None => Rollup {
            missing: acc.missing + 1,
            ..acc
        },
    })
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ReconcileOutcome {
    pub total: f64,
    pub current: Option<f64>,
    pub missing: usize,
    /// The notes field was rewritten.
    pub updated: bool,
    /// A mismatch was found but left alone.
    pub warning: bool,
}

pub struct EstimateReconciler<'a, C: ?Sized> {
    client: &'a C,
    system_tag: &'a str,
}

impl<'a, C> EstimateReconciler<'a, C>
where
    C: TrackerClient + ?Sized,
{
    #[must_use]
    pub const fn new(client: &'a C, system_tag: &'a str) -> Self {
        Self { client, system_tag }
    }

    /// Compare the stored estimate with the member total and act per `policy`.
    ///
    /// # Errors
    ///
    /// Propagates a failed notes update.
    pub fn reconcile(
        &self,
        aggregate: &WorkItem,
        members: &[WorkItem],
        policy: EstimatePolicy,
    ) -> Result<ReconcileOutcome, TrackerError> {
        let Rollup { total, missing } = rollup(members);
        let notes = aggregate.notes.as_deref().unwrap_or("");
        let current = decode(notes);

        let mut outcome = ReconcileOutcome {
            total,
            current,
            missing,
            updated: false,
            warning: false,
        };

        #[allow(clippy::float_cmp)]
        let in_sync = current == Some(total);
        if in_sync {
            debug!(aggregate = aggregate.id, total, "estimate already current");
            return Ok(outcome);
        }

        let writable =
            policy == EstimatePolicy::All || aggregate.has_tag(self.system_tag);
        if writable {
            let updated_notes = encode(total, notes, members.len());
            self.client.update_notes(aggregate.id, &updated_notes)?;
            info!(
                aggregate = aggregate.id,
                previous = ?current,
                total,
                "updated stored estimate"
            );
            outcome.updated = true;
        } else {
            warn!(
                aggregate = aggregate.id,
                stored = ?current,
                total,
                "manual aggregate estimate differs from member total"
            );
            outcome.warning = true;
        }
        Ok(outcome)
    }
}

/// Reconcile a caller-supplied list of aggregates.
pub struct EstimatePass<'a, C: ?Sized> {
    client: &'a C,
    reconciler: EstimateReconciler<'a, C>,
    policy: EstimatePolicy,
}

impl<'a, C> EstimatePass<'a, C>
where
    C: TrackerClient + ?Sized,
{
    #[must_use]
    pub const fn new(client: &'a C, system_tag: &'a str, policy: EstimatePolicy) -> Self {
        Self {
            client,
            reconciler: EstimateReconciler::new(client, system_tag),
            policy,
        }
    }

    pub fn run(&self, aggregates: &[WorkItem], log: &mut OperationLog) {
        info!(aggregates = aggregates.len(), policy = ?self.policy, "reconciling estimates");
        for aggregate in aggregates {
            if let Err(err) = self.reconcile_one(aggregate, log) {
                error!(aggregate = aggregate.id, %err, "abandoning estimate reconciliation");
                log.fail(aggregate.title.clone(), Some(aggregate.id), err.code(), &err);
            }
        }
    }

    fn reconcile_one(&self, listed: &WorkItem, log: &mut OperationLog) -> Result<(), TrackerError> {
        let Some(aggregate) = self.client.get_item_with_relations(listed.id)? else {
            warn!(aggregate = listed.id, "aggregate disappeared before reconciliation");
            log.warn(
                WarningKind::AggregateVanished,
                Some(listed.id),
                format!("'{}' no longer exists; estimate not reconciled", listed.title),
            );
            return Ok(());
        };
        let members = load_members(self.client, &aggregate)?;

        for dangling in &members.dangling {
            log.warn(
                WarningKind::DanglingMember,
                Some(*dangling),
                format!("'{}' links {dangling}, which no longer exists", aggregate.title),
            );
        }
        for member in members.items.iter().filter(|m| m.estimate.is_none()) {
            log.warn(
                WarningKind::MissingEstimate,
                Some(member.id),
                format!("'{}' (member of '{}') has no estimate", member.title, aggregate.title),
            );
        }

        let outcome = self.reconciler.reconcile(&aggregate, &members.items, self.policy)?;
        if outcome.updated {
            log.record_estimate(EstimateChange {
                aggregate_id: aggregate.id,
                title: aggregate.title.clone(),
                previous: outcome.current,
                total: outcome.total,
            });
        }
        if outcome.warning {
            let stored = outcome
                .current
                .map_or_else(|| "nothing".to_string(), format_estimate);
            log.warn(
                WarningKind::EstimateMismatch,
                Some(aggregate.id),
                format!(
                    "'{}' stores {stored} but its members sum to {}",
                    aggregate.title,
                    format_estimate(outcome.total)
                ),
            );
        }
        Ok(())
    }
}
