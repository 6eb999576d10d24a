use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::{fmt, str::FromStr};

/// Identifier assigned by the upstream tracker.
pub type ItemId = i64;

const RELATED_REF: &str = "System.LinkTypes.Related";
const CHILD_REF: &str = "System.LinkTypes.Hierarchy-Forward";
const PARENT_REF: &str = "System.LinkTypes.Hierarchy-Reverse";

/// Relation types between work items.
///
/// `Child` points from a parent to its child (hierarchy forward); `Parent`
/// is the reverse edge. Anything else the tracker reports is kept verbatim.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RelationKind {
    Related,
    Child,
    Parent,
    Other(String),
}

impl RelationKind {
    /// Map a tracker relation reference name to a kind.
    #[must_use]
    pub fn from_reference(reference: &str) -> Self {
        match reference {
            RELATED_REF => Self::Related,
            CHILD_REF => Self::Child,
            PARENT_REF => Self::Parent,
            other => Self::Other(other.to_string()),
        }
    }

    /// Tracker reference name for this kind.
    #[must_use]
    pub fn reference(&self) -> &str {
        match self {
            Self::Related => RELATED_REF,
            Self::Child => CHILD_REF,
            Self::Parent => PARENT_REF,
            Self::Other(reference) => reference,
        }
    }

    /// The edge the tracker records on the other end of this relation.
    #[must_use]
    pub fn reciprocal(&self) -> Self {
        match self {
            Self::Related => Self::Related,
            Self::Child => Self::Parent,
            Self::Parent => Self::Child,
            Self::Other(reference) => Self::Other(reference.clone()),
        }
    }

    /// Whether a relation of this kind counts as aggregate membership.
    #[must_use]
    pub const fn is_membership(&self) -> bool {
        matches!(self, Self::Related | Self::Child | Self::Parent)
    }
}

impl fmt::Display for RelationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Related => f.write_str("related"),
            Self::Child => f.write_str("child"),
            Self::Parent => f.write_str("parent"),
            Self::Other(reference) => f.write_str(reference),
        }
    }
}

impl FromStr for RelationKind {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "related" => Ok(Self::Related),
            "child" => Ok(Self::Child),
            "parent" => Ok(Self::Parent),
            _ => Err(ParseEnumError {
                expected: "relation kind (related|child|parent)",
                got: s.to_string(),
            }),
        }
    }
}

/// A typed edge from the owning item to `target`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Relation {
    pub kind: RelationKind,
    pub target: ItemId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
}

/// Coarse lifecycle bucket derived from the tracker's free-form state name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StateCategory {
    Proposed,
    Active,
    Closed,
}

impl StateCategory {
    /// Classify a tracker state name.
    #[must_use]
    pub fn of(state: &str) -> Self {
        match state.trim().to_ascii_lowercase().as_str() {
            "new" | "proposed" | "to do" | "" => Self::Proposed,
            "closed" | "done" | "removed" | "completed" | "resolved" | "cut" => Self::Closed,
            _ => Self::Active,
        }
    }
}

/// A work item as the engine sees it.
///
/// The engine only ever mutates `title`, `notes` and `relations`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkItem {
    pub id: ItemId,
    pub title: String,
    pub item_type: String,
    pub state: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
    pub area_path: String,
    pub iteration_path: String,
    pub tags: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub estimate: Option<f64>,
    pub relations: Vec<Relation>,
}

impl Default for WorkItem {
    fn default() -> Self {
        Self {
            id: 0,
            title: String::new(),
            item_type: String::new(),
            state: "New".to_string(),
            description: None,
            notes: None,
            area_path: String::new(),
            iteration_path: String::new(),
            tags: Vec::new(),
            estimate: None,
            relations: Vec::new(),
        }
    }
}

impl WorkItem {
    /// Convenience constructor used by fixtures and tests.
    #[must_use]
    pub fn new(id: ItemId, title: impl Into<String>) -> Self {
        Self {
            id,
            title: title.into(),
            ..Self::default()
        }
    }

    /// Case-insensitive tag membership.
    #[must_use]
    pub fn has_tag(&self, tag: &str) -> bool {
        let wanted = tag.trim();
        self.tags
            .iter()
            .any(|candidate| candidate.trim().eq_ignore_ascii_case(wanted))
    }

    /// Ids reachable through membership relations, in relation order, once each.
    #[must_use]
    pub fn linked_ids(&self) -> Vec<ItemId> {
        let mut seen = HashSet::new();
        self.relations
            .iter()
            .filter(|relation| relation.kind.is_membership())
            .map(|relation| relation.target)
            .filter(|target| seen.insert(*target))
            .collect()
    }

    /// Read-only set view of [`WorkItem::linked_ids`].
    #[must_use]
    pub fn linked_id_set(&self) -> HashSet<ItemId> {
        self.relations
            .iter()
            .filter(|relation| relation.kind.is_membership())
            .map(|relation| relation.target)
            .collect()
    }

    #[must_use]
    pub fn state_category(&self) -> StateCategory {
        StateCategory::of(&self.state)
    }
}

/// Split a tracker tag string (`"a; b;c"`) into trimmed, non-empty tags.
#[must_use]
pub fn parse_tags(raw: &str) -> Vec<String> {
    raw.split(';')
        .map(str::trim)
        .filter(|tag| !tag.is_empty())
        .map(str::to_string)
        .collect()
}

/// Inverse of [`parse_tags`].
#[must_use]
pub fn join_tags(tags: &[String]) -> String {
    tags.join("; ")
}

/// Error returned when parsing an enum value from text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseEnumError {
    pub expected: &'static str,
    pub got: String,
}

impl fmt::Display for ParseEnumError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid {}: '{}'", self.expected, self.got)
    }
}

impl std::error::Error for ParseEnumError {}
