//! The grouping pass: scan titles, then create or update one aggregate per group.
//!
//! # Paths
//!
//! - **Create**: the marker has no id. A new aggregate is created, every
//!   member is linked, and the anchor title is rewritten to embed the new id
//!   so the next run takes the update path instead of creating a duplicate.
//! - **Update**: the marker references an aggregate that resolves. Only the
//!   missing links are added.
//! - **Recover**: the marker references an aggregate that no longer exists.
//!   A replacement is created exactly as in the create path and the anchor is
//!   pointed at it.
//!
//! A transport or authorization failure abandons that group only; the pass
//! continues with the next one. Everything else is recorded in the
//! [`OperationLog`] and never propagates.

use std::thread;
use std::time::Duration;

use tracing::{error, info, warn};

use crate::config::GroupingConfig;
use crate::error::{ConfigError, EngineError};
use crate::marker::TitleMatcher;
use crate::model::{ItemId, WorkItem};
use crate::oplog::{Operation, OperationKind, OperationLog, WarningKind};
use crate::scan::{Group, GroupScanner};
use crate::sync::{RelationSynchronizer, SyncOutcome};
use crate::tracker::{AggregateDraft, TrackerClient};

pub struct GroupingEngine<'a, C: ?Sized> {
    client: &'a C,
    config: &'a GroupingConfig,
    area_path: &'a str,
    matcher: TitleMatcher,
}

impl<'a, C> GroupingEngine<'a, C>
where
    C: TrackerClient + ?Sized,
{
    /// # Errors
    ///
    /// Fails when the marker syntax is invalid or no area path is configured.
    pub fn new(client: &'a C, config: &'a GroupingConfig) -> Result<Self, ConfigError> {
        let matcher = TitleMatcher::new(config)?;
        let area_path = config.require_area_path()?;
        Ok(Self {
            client,
            config,
            area_path,
            matcher,
        })
    }

    #[must_use]
    pub const fn matcher(&self) -> &TitleMatcher {
        &self.matcher
    }

    #[must_use]
    pub fn scan(&self, items: &[WorkItem]) -> Vec<Group> {
        GroupScanner::new(&self.matcher).scan(items)
    }

    /// Scan `items` and process every resulting group in order.
    pub fn run(&self, items: &[WorkItem], log: &mut OperationLog) {
        let groups = self.scan(items);
        info!(
            items = items.len(),
            groups = groups.len(),
            "scanned titles for release-train markers"
        );

        let delay = Duration::from_millis(self.config.group_delay_ms);
        for (index, group) in groups.iter().enumerate() {
            if index > 0 && !delay.is_zero() {
                thread::sleep(delay);
            }

            match self.process_group(group, log) {
                Ok(operation) => log.record(operation),
                Err(err) => {
                    error!(group = %group.name, %err, "abandoning group");
                    log.fail(
                        group.name.clone(),
                        group.existing_id.or(group.anchor_id),
                        err.code(),
                        &err,
                    );
                }
            }
        }
    }

    /// Create, update or recover the aggregate for one group.
    ///
    /// # Errors
    ///
    /// Tracker failures while fetching or creating the aggregate, and
    /// non-positive ids from creation. Relation and anchor failures are only
    /// logged.
    pub fn process_group(
        &self,
        group: &Group,
        log: &mut OperationLog,
    ) -> Result<Operation, EngineError> {
        if let Some(raw) = &group.malformed_ref {
            log.warn(
                WarningKind::MalformedMarker,
                group.anchor_id,
                format!(
                    "marker for '{}' has unparseable id {raw:?}; treated as a new train",
                    group.name
                ),
            );
        }

        let Some(existing_id) = group.existing_id else {
            return self.create_for_group(group, None, log);
        };

        match self.client.get_item_with_relations(existing_id)? {
            Some(aggregate) => Ok(self.update_existing(&aggregate, group, log)),
            None => {
                warn!(
                    aggregate = existing_id,
                    group = %group.name,
                    "referenced aggregate not found; creating a replacement"
                );
                log.warn(
                    WarningKind::MissingAggregate,
                    Some(existing_id),
                    format!(
                        "aggregate {existing_id} referenced by '{}' no longer exists; replaced",
                        group.name
                    ),
                );
                self.create_for_group(group, Some(existing_id), log)
            }
        }
    }

    fn create_for_group(
        &self,
        group: &Group,
        recovered_from: Option<ItemId>,
        log: &mut OperationLog,
    ) -> Result<Operation, EngineError> {
        let draft = AggregateDraft {
            title: group.name.clone(),
            area_path: self.area_path.to_string(),
            tags: vec![self.config.system_tag.clone()],
        };
        let id = self.client.create_aggregate(&draft)?;
        if id <= 0 {
            return Err(EngineError::InvalidCreatedId(id));
        }
        info!(
            aggregate = id,
            name = %group.name,
            members = group.members.len(),
            "created release train"
        );

        let outcome = self.synchronizer().link_all(id, &group.members);
        record_relation_failures(id, &outcome, log);
        self.rewrite_anchor(group, id, log);

        Ok(Operation {
            kind: OperationKind::Created,
            aggregate_id: id,
            title: group.name.clone(),
            member_count: group.members.len(),
            added_relations: outcome.attempted,
            recovered_from,
        })
    }

    fn update_existing(
        &self,
        aggregate: &WorkItem,
        group: &Group,
        log: &mut OperationLog,
    ) -> Operation {
        let outcome = self.synchronizer().synchronize(aggregate, &group.members);

        // Relations are append-only: an oversized aggregate is reported, never trimmed.
        if outcome.existing_links > group.members.len() {
            warn!(
                aggregate = aggregate.id,
                linked = outcome.existing_links,
                listed = group.members.len(),
                "aggregate links more items than the group lists"
            );
            log.warn(
                WarningKind::MemberCountMismatch,
                Some(aggregate.id),
                format!(
                    "'{}' links {} items but the group lists {}",
                    aggregate.title,
                    outcome.existing_links,
                    group.members.len()
                ),
            );
        }
        record_relation_failures(aggregate.id, &outcome, log);

        info!(
            aggregate = aggregate.id,
            added = outcome.attempted,
            already_linked = outcome.already_linked,
            "updated release train"
        );
        Operation {
            kind: OperationKind::Updated,
            aggregate_id: aggregate.id,
            title: aggregate.title.clone(),
            member_count: group.members.len(),
            added_relations: outcome.attempted,
            recovered_from: None,
        }
    }

    fn rewrite_anchor(&self, group: &Group, aggregate_id: ItemId, log: &mut OperationLog) {
        let Some(anchor) = group.anchor_id.filter(|id| *id > 0) else {
            return;
        };

        let title = self.matcher.canonical_title(&group.name, aggregate_id);
        match self.client.update_title(anchor, &title) {
            Ok(()) => info!(anchor, %title, "pointed anchor at aggregate"),
            Err(err) => {
                warn!(anchor, %err, "failed to rewrite anchor title");
                log.warn(
                    WarningKind::AnchorRewriteFailed,
                    Some(anchor),
                    format!(
                        "could not point anchor {anchor} at aggregate {aggregate_id}: {err}; \
                         the next run will create a duplicate"
                    ),
                );
            }
        }
    }

    fn synchronizer(&self) -> RelationSynchronizer<'_, C> {
        RelationSynchronizer::new(self.client, self.config)
    }
}

fn record_relation_failures(aggregate_id: ItemId, outcome: &SyncOutcome, log: &mut OperationLog) {
    for failure in &outcome.failures {
        log.warn(
            WarningKind::RelationFailed,
            Some(failure.target),
            format!(
                "could not link {} to aggregate {aggregate_id}: {}",
                failure.target, failure.error
            ),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{MemoryTracker, TrackerCall};

    fn config() -> GroupingConfig {
        GroupingConfig {
            area_path: Some("Web\\Trains".to_string()),
            group_delay_ms: 0,
            ..GroupingConfig::default()
        }
    }

    fn feature(id: ItemId, title: &str) -> WorkItem {
        WorkItem {
            item_type: "Feature".to_string(),
            ..WorkItem::new(id, title)
        }
    }

    #[test]
    fn requires_area_path() {
        let tracker = MemoryTracker::default();
        let cfg = GroupingConfig::default();
        assert!(matches!(
            GroupingEngine::new(&tracker, &cfg),
            Err(ConfigError::MissingAreaPath)
        ));
    }

    #[test]
    fn create_path_tags_links_and_rewrites() {
        let items = vec![
            feature(1, "----- Q1 -----rt"),
            feature(2, "A"),
            feature(3, "B"),
        ];
        let tracker = MemoryTracker::with_items("Release Train", items.clone());
        let cfg = config();
        let engine = GroupingEngine::new(&tracker, &cfg).expect("engine");

        let mut log = OperationLog::new();
        engine.run(&items, &mut log);

        assert_eq!(log.operations.len(), 1);
        let op = &log.operations[0];
        assert_eq!(op.kind, OperationKind::Created);
        assert_eq!(op.added_relations, 2);

        let aggregate = tracker.item(op.aggregate_id).expect("aggregate stored");
        assert!(aggregate.has_tag("auto-generated"));
        assert_eq!(aggregate.area_path, "Web\\Trains");
        assert_eq!(aggregate.linked_ids(), vec![2, 3]);
        assert_eq!(
            tracker.item(1).expect("anchor").title,
            format!("----- Q1 -----rt:{}", op.aggregate_id)
        );
    }

    #[test]
    fn transport_error_abandons_only_that_group() {
        let items = vec![
            feature(1, "----- Broken -----rt:77"),
            feature(2, "A"),
            feature(3, "----- Fine -----rt"),
            feature(4, "B"),
        ];
        let tracker = MemoryTracker::with_items("Release Train", items.clone());
        tracker.make_unreachable(77);
        let cfg = config();
        let engine = GroupingEngine::new(&tracker, &cfg).expect("engine");

        let mut log = OperationLog::new();
        engine.run(&items, &mut log);

        assert_eq!(log.failures.len(), 1);
        assert_eq!(log.failures[0].subject, "Broken");
        assert_eq!(log.failures[0].item_id, Some(77));
        assert_eq!(log.operations.len(), 1);
        assert_eq!(log.operations[0].title, "Fine");
    }

    #[test]
    fn non_positive_created_id_is_a_group_failure() {
        let items = vec![feature(1, "----- Q1 -----rt"), feature(2, "A")];
        let tracker = MemoryTracker::with_items("Release Train", items.clone());
        tracker.override_created_id(0);
        let cfg = config();
        let engine = GroupingEngine::new(&tracker, &cfg).expect("engine");

        let mut log = OperationLog::new();
        engine.run(&items, &mut log);

        assert!(log.operations.is_empty());
        assert_eq!(log.failures[0].code, "E3001");
        assert!(
            !tracker
                .mutations()
                .iter()
                .any(|call| matches!(call, TrackerCall::CreateRelation { .. } | TrackerCall::UpdateTitle { .. }))
        );
    }

    #[test]
    fn failed_anchor_rewrite_is_reported() {
        let items = vec![feature(1, "----- Q1 -----rt"), feature(2, "A")];
        // The anchor is not stored upstream, so the title update is rejected.
        let tracker = MemoryTracker::with_items("Release Train", vec![feature(2, "A")]);
        let cfg = config();
        let engine = GroupingEngine::new(&tracker, &cfg).expect("engine");

        let mut log = OperationLog::new();
        engine.run(&items, &mut log);

        assert_eq!(log.count(OperationKind::Created), 1);
        assert_eq!(log.warnings_of(WarningKind::AnchorRewriteFailed).len(), 1);
    }

    #[test]
    fn malformed_marker_is_warned_and_created() {
        let items = vec![feature(1, "----- Q1 -----rt:x9"), feature(2, "A")];
        let tracker = MemoryTracker::with_items("Release Train", items.clone());
        let cfg = config();
        let engine = GroupingEngine::new(&tracker, &cfg).expect("engine");

        let mut log = OperationLog::new();
        engine.run(&items, &mut log);

        assert_eq!(log.count(OperationKind::Created), 1);
        assert_eq!(log.warnings_of(WarningKind::MalformedMarker).len(), 1);
    }

    #[test]
    fn oversized_aggregate_only_warns() {
        let mut aggregate = WorkItem::new(50, "Q1");
        for target in [7, 8, 9] {
            aggregate.relations.push(crate::model::Relation {
                kind: crate::model::RelationKind::Related,
                target,
                comment: None,
            });
        }
        let items = vec![feature(1, "----- Q1 -----rt:50"), feature(7, "A")];
        let mut seed = items.clone();
        seed.push(aggregate);
        let tracker = MemoryTracker::with_items("Release Train", seed);
        let cfg = config();
        let engine = GroupingEngine::new(&tracker, &cfg).expect("engine");

        let mut log = OperationLog::new();
        engine.run(&items, &mut log);

        assert_eq!(log.count(OperationKind::Updated), 1);
        assert_eq!(log.operations[0].added_relations, 0);
        assert_eq!(log.warnings_of(WarningKind::MemberCountMismatch).len(), 1);
        assert!(tracker.mutations().is_empty());
    }

    #[test]
    fn failed_link_on_create_is_warned_and_the_rest_proceed() {
        let items = vec![
            feature(1, "----- Q1 -----rt"),
            feature(2, "A"),
            feature(3, "B"),
            feature(4, "C"),
        ];
        let tracker = MemoryTracker::with_items("Release Train", items.clone());
        tracker.fail_relations_to(3);
        let cfg = config();
        let engine = GroupingEngine::new(&tracker, &cfg).expect("engine");

        let mut log = OperationLog::new();
        engine.run(&items, &mut log);

        assert!(!log.has_failures());
        let op = &log.operations[0];
        assert_eq!(op.kind, OperationKind::Created);
        assert_eq!(op.added_relations, 3);

        let failed = log.warnings_of(WarningKind::RelationFailed);
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].item_id, Some(3));
        assert_eq!(
            tracker.item(op.aggregate_id).expect("aggregate").linked_ids(),
            vec![2, 4]
        );
        assert_eq!(
            tracker.item(1).expect("anchor").title,
            format!("----- Q1 -----rt:{}", op.aggregate_id)
        );
    }

    #[test]
    fn failed_link_on_recovery_is_warned() {
        let items = vec![feature(1, "----- Q1 -----rt:4242"), feature(2, "A"), feature(3, "B")];
        let tracker = MemoryTracker::with_items("Release Train", items.clone());
        tracker.fail_relations_to(2);
        let cfg = config();
        let engine = GroupingEngine::new(&tracker, &cfg).expect("engine");

        let mut log = OperationLog::new();
        engine.run(&items, &mut log);

        let op = &log.operations[0];
        assert_eq!(op.kind, OperationKind::Created);
        assert_eq!(op.recovered_from, Some(4242));
        assert_eq!(log.warnings_of(WarningKind::MissingAggregate).len(), 1);

        let failed = log.warnings_of(WarningKind::RelationFailed);
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].item_id, Some(2));
        assert_eq!(
            tracker.item(op.aggregate_id).expect("aggregate").linked_ids(),
            vec![3]
        );
    }
}
