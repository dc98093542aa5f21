// src/models/mod.rs

//! Domain models for the alerting daemon.
//!
//! Configuration is owned by the operator and never mutated at runtime;
//! snapshots and deltas are transient, scoped to a single tick; alert
//! state is the only durable structure.

mod config;
mod delta;
mod record;
mod state;

// Re-export all public types
pub use config::{
    AttrPath, AttrSelector, Config, Destination, FieldMap, FieldSelectors, HttpConfig,
    PipelineDef, ReferenceRule, RuleSpec, SourceSpec,
};
pub use delta::{ChangeKind, Delta, DeltaEntry};
pub use record::{Candidate, Record, Snapshot};
pub use state::{AlertMark, AlertState, STATE_SCHEMA_VERSION};
