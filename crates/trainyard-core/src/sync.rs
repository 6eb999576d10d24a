//! Converge an aggregate's membership relations towards a desired member list.
//!
//! Relations are only ever added. Re-running with an unchanged member list
//! against an aggregate that already links every member issues no calls.

use std::collections::HashSet;

use tracing::{debug, warn};

use crate::config::GroupingConfig;
use crate::error::TrackerError;
use crate::model::{ItemId, RelationKind, WorkItem};
use crate::tracker::TrackerClient;

/// A relation creation that the tracker refused.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelationFailure {
    pub target: ItemId,
    pub error: TrackerError,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncOutcome {
    /// Relation creations attempted, successful or not.
    pub attempted: usize,
    /// Desired members that were already linked.
    pub already_linked: usize,
    /// Membership links present on the aggregate before this run.
    pub existing_links: usize,
    pub failures: Vec<RelationFailure>,
}

/// Ids from `desired` not in `existing`, in `desired` order, once each.
#[must_use]
pub fn plan_links(existing: &HashSet<ItemId>, desired: &[ItemId]) -> Vec<ItemId> {
    let mut planned = HashSet::new();
    desired
        .iter()
        .copied()
        .filter(|id| !existing.contains(id) && planned.insert(*id))
        .collect()
}

pub struct RelationSynchronizer<'a, C: ?Sized> {
    client: &'a C,
    kind: &'a RelationKind,
    comment: &'a str,
}

impl<'a, C> RelationSynchronizer<'a, C>
where
    C: TrackerClient + ?Sized,
{
    #[must_use]
    pub fn new(client: &'a C, config: &'a GroupingConfig) -> Self {
        Self {
            client,
            kind: &config.relation,
            comment: &config.provenance_comment,
        }
    }

    /// Link every desired member the fetched `aggregate` does not link yet.
    pub fn synchronize(&self, aggregate: &WorkItem, desired: &[ItemId]) -> SyncOutcome {
        let mut existing = aggregate.linked_id_set();
        let existing_links = existing.len();
        existing.insert(aggregate.id);

        let to_add = plan_links(&existing, desired);
        let already_linked = desired.len() - to_add.len();
        debug!(
            aggregate = aggregate.id,
            desired = desired.len(),
            missing = to_add.len(),
            "diffed aggregate relations"
        );

        SyncOutcome {
            already_linked,
            existing_links,
            ..self.link_all(aggregate.id, &to_add)
        }
    }

    /// Link every id in `members` without diffing (fresh aggregates).
    pub fn link_all(&self, aggregate_id: ItemId, members: &[ItemId]) -> SyncOutcome {
        let mut outcome = SyncOutcome::default();

        for &target in members {
            outcome.attempted += 1;
            match self
                .client
                .create_relation(aggregate_id, target, self.kind, self.comment)
            {
                Ok(()) => debug!(aggregate = aggregate_id, member = target, "linked member"),
                Err(error) => {
                    warn!(
                        aggregate = aggregate_id,
                        member = target,
                        %error,
                        "failed to link member; continuing"
                    );
                    outcome.failures.push(RelationFailure { target, error });
                }
            }
        }

        outcome
    }
}
