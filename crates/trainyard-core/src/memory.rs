//! In-memory [`TrackerClient`] with a call journal.
//!
//! Backs the test suites and the CLI's fixture mode. Items are returned by
//! [`TrackerClient::query_items`] in insertion order, which stands in for
//! rank order.

use std::cell::RefCell;
use std::collections::{HashMap, HashSet};

use serde::Serialize;

use crate::error::TrackerError;
use crate::model::{ItemId, Relation, RelationKind, WorkItem};
use crate::tracker::{AggregateDraft, ItemFilter, TrackerClient};

const FIRST_GENERATED_ID: ItemId = 900_000;

/// One recorded call against the tracker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "call", rename_all = "snake_case")]
pub enum TrackerCall {
    Query,
    Get { id: ItemId },
    GetWithRelations { id: ItemId },
    CreateAggregate { id: ItemId, title: String },
    CreateRelation { source: ItemId, target: ItemId },
    UpdateTitle { id: ItemId, title: String },
    UpdateNotes { id: ItemId, notes: String },
}

impl TrackerCall {
    #[must_use]
    pub const fn is_mutation(&self) -> bool {
        matches!(
            self,
            Self::CreateAggregate { .. }
                | Self::CreateRelation { .. }
                | Self::UpdateTitle { .. }
                | Self::UpdateNotes { .. }
        )
    }
}

#[derive(Debug, Default)]
struct State {
    order: Vec<ItemId>,
    items: HashMap<ItemId, WorkItem>,
    next_id: ItemId,
    calls: Vec<TrackerCall>,
    failing_relation_targets: HashSet<ItemId>,
    unreachable: HashSet<ItemId>,
    created_id_override: Option<ItemId>,
}

#[derive(Debug)]
pub struct MemoryTracker {
    aggregate_type: String,
    state: RefCell<State>,
}

impl Default for MemoryTracker {
    fn default() -> Self {
        Self::new("Release Train")
    }
}

impl MemoryTracker {
    /// Empty tracker; created aggregates get `aggregate_type`.
    #[must_use]
    pub fn new(aggregate_type: impl Into<String>) -> Self {
        Self {
            aggregate_type: aggregate_type.into(),
            state: RefCell::new(State {
                next_id: FIRST_GENERATED_ID,
                ..State::default()
            }),
        }
    }

    /// Tracker pre-seeded with `items` in the given order.
    #[must_use]
    pub fn with_items(aggregate_type: impl Into<String>, items: Vec<WorkItem>) -> Self {
        let tracker = Self::new(aggregate_type);
        for item in items {
            tracker.insert(item);
        }
        tracker
    }

    /// Insert or replace an item. New ids go to the end of the rank order.
    pub fn insert(&self, item: WorkItem) {
        let mut state = self.state.borrow_mut();
        if item.id >= state.next_id {
            state.next_id = item.id + 1;
        }
        if !state.items.contains_key(&item.id) {
            state.order.push(item.id);
        }
        state.items.insert(item.id, item);
    }

    /// Current snapshot of an item, relations included.
    #[must_use]
    pub fn item(&self, id: ItemId) -> Option<WorkItem> {
        self.state.borrow().items.get(&id).cloned()
    }

    /// Every item in rank order.
    #[must_use]
    pub fn items(&self) -> Vec<WorkItem> {
        let state = self.state.borrow();
        state
            .order
            .iter()
            .filter_map(|id| state.items.get(id).cloned())
            .collect()
    }

    #[must_use]
    pub fn calls(&self) -> Vec<TrackerCall> {
        self.state.borrow().calls.clone()
    }

    #[must_use]
    pub fn mutations(&self) -> Vec<TrackerCall> {
        self.state
            .borrow()
            .calls
            .iter()
            .filter(|call| call.is_mutation())
            .cloned()
            .collect()
    }

    pub fn clear_calls(&self) {
        self.state.borrow_mut().calls.clear();
    }

    /// Make every relation creation towards `target` fail.
    pub fn fail_relations_to(&self, target: ItemId) {
        self.state
            .borrow_mut()
            .failing_relation_targets
            .insert(target);
    }

    /// Make every fetch of `id` fail with a transport error.
    pub fn make_unreachable(&self, id: ItemId) {
        self.state.borrow_mut().unreachable.insert(id);
    }

    /// Force the id reported by the next aggregate creations.
    pub fn override_created_id(&self, id: ItemId) {
        self.state.borrow_mut().created_id_override = Some(id);
    }

    fn record(&self, call: TrackerCall) {
        self.state.borrow_mut().calls.push(call);
    }

    fn fetch(&self, id: ItemId, with_relations: bool) -> Result<Option<WorkItem>, TrackerError> {
        let state = self.state.borrow();
        if state.unreachable.contains(&id) {
            return Err(TrackerError::Transport(format!(
                "connection reset while fetching {id}"
            )));
        }
        Ok(state.items.get(&id).cloned().map(|mut item| {
            if !with_relations {
                item.relations.clear();
            }
            item
        }))
    }

    fn modify(
        &self,
        id: ItemId,
        apply: impl FnOnce(&mut WorkItem),
    ) -> Result<(), TrackerError> {
        let mut state = self.state.borrow_mut();
        let item = state.items.get_mut(&id).ok_or_else(|| TrackerError::Api {
            status: 404,
            message: format!("work item {id} does not exist"),
        })?;
        apply(item);
        Ok(())
    }
}

fn under_area(item_area: &str, scope: &str) -> bool {
    item_area.eq_ignore_ascii_case(scope)
        || item_area
            .to_ascii_lowercase()
            .starts_with(&format!("{}\\", scope.to_ascii_lowercase()))
}

impl TrackerClient for MemoryTracker {
    fn query_items(&self, filter: &ItemFilter) -> Result<Vec<WorkItem>, TrackerError> {
        self.record(TrackerCall::Query);

        let matches = self
            .items()
            .into_iter()
            .filter(|item| {
                filter
                    .area_path
                    .as_deref()
                    .is_none_or(|scope| under_area(&item.area_path, scope))
            })
            .filter(|item| {
                filter.item_types.is_empty()
                    || filter
                        .item_types
                        .iter()
                        .any(|kind| kind.eq_ignore_ascii_case(&item.item_type))
            })
            .map(|mut item| {
                item.relations.clear();
                item
            })
            .take(filter.limit.unwrap_or(usize::MAX))
            .collect();

        Ok(matches)
    }

    fn get_item(&self, id: ItemId) -> Result<Option<WorkItem>, TrackerError> {
        self.record(TrackerCall::Get { id });
        self.fetch(id, false)
    }

    fn get_item_with_relations(&self, id: ItemId) -> Result<Option<WorkItem>, TrackerError> {
        self.record(TrackerCall::GetWithRelations { id });
        self.fetch(id, true)
    }

    fn create_aggregate(&self, draft: &AggregateDraft) -> Result<ItemId, TrackerError> {
        let id = {
            let mut state = self.state.borrow_mut();
            if let Some(forced) = state.created_id_override {
                forced
            } else {
                let id = state.next_id;
                state.next_id += 1;
                id
            }
        };
        self.record(TrackerCall::CreateAggregate {
            id,
            title: draft.title.clone(),
        });

        if id > 0 {
            self.insert(WorkItem {
                id,
                title: draft.title.clone(),
                item_type: self.aggregate_type.clone(),
                area_path: draft.area_path.clone(),
                tags: draft.tags.clone(),
                ..WorkItem::default()
            });
        }
        Ok(id)
    }

    fn create_relation(
        &self,
        source: ItemId,
        target: ItemId,
        kind: &RelationKind,
        comment: &str,
    ) -> Result<(), TrackerError> {
        self.record(TrackerCall::CreateRelation { source, target });

        {
            let state = self.state.borrow();
            if state.failing_relation_targets.contains(&target) {
                return Err(TrackerError::Api {
                    status: 400,
                    message: format!("relation to {target} rejected"),
                });
            }
            if !state.items.contains_key(&target) {
                return Err(TrackerError::Api {
                    status: 400,
                    message: format!("target work item {target} does not exist"),
                });
            }
        }

        let comment = Some(comment.to_string()).filter(|c| !c.is_empty());
        self.modify(source, |item| {
            item.relations.push(Relation {
                kind: kind.clone(),
                target,
                comment: comment.clone(),
            });
        })?;
        self.modify(target, |item| {
            item.relations.push(Relation {
                kind: kind.reciprocal(),
                target: source,
                comment,
            });
        })
    }

    fn update_title(&self, id: ItemId, title: &str) -> Result<(), TrackerError> {
        self.record(TrackerCall::UpdateTitle {
            id,
            title: title.to_string(),
        });
        self.modify(id, |item| item.title = title.to_string())
    }

    fn update_notes(&self, id: ItemId, notes: &str) -> Result<(), TrackerError> {
        self.record(TrackerCall::UpdateNotes {
            id,
            notes: notes.to_string(),
        });
        self.modify(id, |item| item.notes = Some(notes.to_string()))
    }
}
