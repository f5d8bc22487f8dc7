//! Verification and concurrency gate.
//!
//! Decides whether a unit of work may proceed: which checks a change needs,
//! whether their verdicts are already cached, which evidence proves a
//! checklist item, and who may integrate into the shared branch right now.
pub mod cache;
pub mod config;
pub mod error;
pub mod evidence;
pub mod gate;
pub mod hasher;
pub mod merge_lock;
pub mod paths;
pub mod registry;
pub mod runner;
pub mod sanitize;
pub mod scope;
pub mod util;

pub use error::{FieldIssue, GateError, Result, SchemaError};
