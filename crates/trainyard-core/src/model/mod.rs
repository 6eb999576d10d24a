pub mod item;

pub use item::{ItemId, Relation, RelationKind, StateCategory, WorkItem};
