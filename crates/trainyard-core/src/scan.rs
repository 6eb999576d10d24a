//! Single-pass grouping of an ordered item list by title markers.

use tracing::debug;

use crate::marker::{OpenMarker, TitleMatch, TitleMatcher};
use crate::model::{ItemId, WorkItem};

/// One open-marker-to-boundary span of input items.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Group {
    pub name: String,
    /// Item whose title carried the opening marker.
    pub anchor_id: Option<ItemId>,
    /// Aggregate referenced by the marker, if any.
    pub existing_id: Option<ItemId>,
    /// Unparseable `:<id>` text from the marker.
    pub malformed_ref: Option<String>,
    /// Member ids in input order.
    pub members: Vec<ItemId>,
}

impl Group {
    fn opened(marker: OpenMarker, anchor_id: ItemId) -> Self {
        Self {
            name: marker.name,
            anchor_id: Some(anchor_id),
            existing_id: marker.existing_id,
            malformed_ref: marker.malformed_id,
            members: Vec::new(),
        }
    }
}

#[derive(Debug)]
enum ScanState {
    Idle,
    Collecting(Group),
}

#[derive(Debug, Clone, Copy)]
pub struct GroupScanner<'m> {
    matcher: &'m TitleMatcher,
}

impl<'m> GroupScanner<'m> {
    #[must_use]
    pub const fn new(matcher: &'m TitleMatcher) -> Self {
        Self { matcher }
    }

    /// Groups in the order their opening markers appear; empty groups are dropped.
    #[must_use]
    pub fn scan<'a>(&self, items: impl IntoIterator<Item = &'a WorkItem>) -> Vec<Group> {
        let (last, mut groups) = items.into_iter().fold(
            (ScanState::Idle, Vec::new()),
            |(state, mut groups), item| {
                let next = self.step(state, item, &mut groups);
                (next, groups)
            },
        );

        if let ScanState::Collecting(group) = last {
            emit(group, &mut groups);
        }
        groups
    }

    fn step(&self, state: ScanState, item: &WorkItem, groups: &mut Vec<Group>) -> ScanState {
        match (state, self.matcher.classify(&item.title)) {
            (state, TitleMatch::Open(marker)) => {
                if let ScanState::Collecting(previous) = state {
                    emit(previous, groups);
                }
                debug!(anchor = item.id, name = %marker.name, "group opened");
                ScanState::Collecting(Group::opened(marker, item.id))
            }
            (ScanState::Collecting(group), TitleMatch::Close) => {
                emit(group, groups);
                ScanState::Idle
            }
            (ScanState::Collecting(mut group), TitleMatch::Plain) => {
                group.members.push(item.id);
                ScanState::Collecting(group)
            }
            (ScanState::Idle, TitleMatch::Close | TitleMatch::Plain) => ScanState::Idle,
        }
    }
}

fn emit(group: Group, groups: &mut Vec<Group>) {
    if group.members.is_empty() {
        debug!(name = %group.name, "discarding group without members");
    } else {
        groups.push(group);
    }
}
