//! The upstream tracker contract consumed by every pass.
//!
//! Implementations are blocking: each call is one request/response. Fetch
//! calls distinguish a clean "not found" (`Ok(None)`) from a failed request
//! (`Err`), which is what the recovery path dispatches on.

use tracing::{debug, warn};

use crate::error::TrackerError;
use crate::model::{ItemId, RelationKind, WorkItem};

/// Scope for [`TrackerClient::query_items`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ItemFilter {
    /// Restrict to this area path and everything under it.
    pub area_path: Option<String>,
    /// Restrict to these work-item types (empty means any).
    pub item_types: Vec<String>,
    /// Maximum number of items to return.
    pub limit: Option<usize>,
}

/// Fields for a new aggregate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AggregateDraft {
    pub title: String,
    pub area_path: String,
    pub tags: Vec<String>,
}

/// Blocking access to the upstream work-item tracker.
///
/// # Errors
///
/// Every method returns [`TrackerError`] when the request fails or is
/// rejected. Fetches of an id that does not exist return `Ok(None)`.
pub trait TrackerClient {
    /// Items matching `filter`, ordered by the tracker's rank field ascending.
    fn query_items(&self, filter: &ItemFilter) -> Result<Vec<WorkItem>, TrackerError>;

    fn get_item(&self, id: ItemId) -> Result<Option<WorkItem>, TrackerError>;

    fn get_item_with_relations(&self, id: ItemId) -> Result<Option<WorkItem>, TrackerError>;

    /// Create an aggregate and return its id.
    fn create_aggregate(&self, draft: &AggregateDraft) -> Result<ItemId, TrackerError>;

    fn create_relation(
        &self,
        source: ItemId,
        target: ItemId,
        kind: &RelationKind,
        comment: &str,
    ) -> Result<(), TrackerError>;

    fn update_title(&self, id: ItemId, title: &str) -> Result<(), TrackerError>;

    fn update_notes(&self, id: ItemId, notes: &str) -> Result<(), TrackerError>;
}

/// Members of an aggregate as resolved from its relations.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Members {
    /// Resolved members, in relation order.
    pub items: Vec<WorkItem>,
    /// Linked ids that no longer resolve.
    pub dangling: Vec<ItemId>,
}

/// Fetch every item linked to `aggregate` through a membership relation.
///
/// `aggregate` must have been fetched with relations.
///
/// # Errors
///
/// The first failed fetch aborts the load.
pub fn load_members<C>(client: &C, aggregate: &WorkItem) -> Result<Members, TrackerError>
where
    C: TrackerClient + ?Sized,
{
    let mut members = Members::default();

    for id in aggregate.linked_ids() {
        match client.get_item(id)? {
            Some(item) => members.items.push(item),
            None => {
                warn!(aggregate = aggregate.id, member = id, "linked item no longer exists");
                members.dangling.push(id);
            }
        }
    }

    debug!(
        aggregate = aggregate.id,
        resolved = members.items.len(),
        dangling = members.dangling.len(),
        "loaded aggregate members"
    );
    Ok(members)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryTracker;
    use crate::model::Relation;

    fn link(kind: RelationKind, target: ItemId) -> Relation {
        Relation {
            kind,
            target,
            comment: None,
        }
    }

    fn aggregate(relations: Vec<Relation>) -> WorkItem {
        let mut item = WorkItem::new(50, "Train");
        item.relations = relations;
        item
    }

    #[test]
    fn members_follow_relation_order_once_each() {
        let tracker = MemoryTracker::with_items(
            "Release Train",
            vec![WorkItem::new(1, "A"), WorkItem::new(2, "B")],
        );
        let agg = aggregate(vec![
            link(RelationKind::Related, 2),
            link(RelationKind::Child, 1),
            link(RelationKind::Related, 2),
        ]);

        let members = load_members(&tracker, &agg).expect("load");
        let ids: Vec<ItemId> = members.items.iter().map(|item| item.id).collect();
        assert_eq!(ids, vec![2, 1]);
        assert!(members.dangling.is_empty());
    }

    #[test]
    fn unresolved_links_are_dangling() {
        let tracker = MemoryTracker::with_items("Release Train", vec![WorkItem::new(1, "A")]);
        let agg = aggregate(vec![
            link(RelationKind::Related, 1),
            link(RelationKind::Related, 77),
        ]);

        let members = load_members(&tracker, &agg).expect("load");
        assert_eq!(members.items.len(), 1);
        assert_eq!(members.dangling, vec![77]);
    }

    #[test]
    fn transport_error_aborts_the_load() {
        let tracker = MemoryTracker::with_items("Release Train", vec![WorkItem::new(1, "A")]);
        tracker.make_unreachable(1);
        let agg = aggregate(vec![link(RelationKind::Related, 1)]);

        assert!(matches!(
            load_members(&tracker, &agg),
            Err(TrackerError::Transport(_))
        ));
    }
}
