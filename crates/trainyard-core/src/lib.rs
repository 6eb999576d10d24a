//! trainyard-core library.
//!
//! Groups ranked work items into aggregates by reading marker titles,
//! keeps aggregate membership relations in sync, and rolls member
//! estimates up into each aggregate.
//!
//! # Conventions
//!
//! - **Errors**: typed errors (`TrackerError`, `EngineError`, `ConfigError`)
//!   at module seams; `anyhow::Result` only where config files are read.
//! - **Logging**: Use `tracing` macros (`info!`, `warn!`, `error!`, `debug!`, `trace!`).
//! - **Tracker access**: everything that talks to the tracker goes through
//!   [`tracker::TrackerClient`]; [`memory::MemoryTracker`] backs tests and
//!   offline runs.

pub mod config;
pub mod error;
pub mod estimate;
pub mod grouping;
pub mod hygiene;
pub mod marker;
pub mod memory;
pub mod model;
pub mod oplog;
pub mod scan;
pub mod sync;
pub mod tracker;

pub use error::{ConfigError, EngineError, ErrorCode, TrackerError};
pub use model::{ItemId, WorkItem};
pub use tracker::TrackerClient;
