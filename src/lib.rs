// src/lib.rs

//! Herald Library
//!
//! Periodic external-data-to-chat alerting: every N seconds a pipeline pulls
//! a snapshot from an HTTP source, ranks it against a rule, diffs it against
//! persisted state, and pushes a bounded message to chat destinations.

pub mod diff;
pub mod error;
pub mod models;
pub mod notify;
pub mod pipeline;
pub mod rules;
pub mod sources;
pub mod storage;
pub mod utils;
