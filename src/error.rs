//! Error taxonomy for gate operations.
//!
//! Every rejection carries the identifiers and field names involved so the
//! caller can fix the exact item. A cache miss is not an error and never
//! appears here.
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

use crate::merge_lock::LockRecord;

/// Gate result type alias.
pub type Result<T> = std::result::Result<T, GateError>;

#[derive(Debug, Error)]
pub enum GateError {
    /// A declared input could not be read; callers must not cache.
    #[error("input unreadable: {path}: {source}")]
    InputUnreadable {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error(transparent)]
    Schema(#[from] SchemaError),

    #[error(
        "duplicate mapping: {checklist} is already linked to {existing} (requested {requested})"
    )]
    DuplicateMapping {
        checklist: String,
        existing: String,
        requested: String,
    },

    #[error("acquire timeout for {operation_id} after {}s (holder: {})", .waited.as_secs(), holder_label(.holder))]
    AcquireTimeout {
        operation_id: String,
        holder: Option<Box<LockRecord>>,
        waited: Duration,
    },

    #[error("{operation_id} does not hold the merge lock (holder: {})", holder_label(.holder))]
    NotHolder {
        operation_id: String,
        holder: Option<Box<LockRecord>>,
    },

    #[error("acquire cancelled for {operation_id}")]
    Cancelled { operation_id: String },

    #[error("not found: {id}")]
    NotFound { id: String },

    #[error("invalid identifier {raw:?}: {reason}")]
    InvalidIdentifier { raw: String, reason: String },

    #[error("{checklist} cannot be completed: {reason}")]
    EvidenceRequired { checklist: String, reason: String },

    #[error("invalid pattern {pattern:?}: {reason}")]
    Pattern { pattern: String, reason: String },

    #[error("configuration error: {0}")]
    Config(String),

    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("corrupt state file {path}: {reason}")]
    Corrupt { path: PathBuf, reason: String },
}

impl GateError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        GateError::Io {
            path: path.into(),
            source,
        }
    }

    /// True for lock contention outcomes (exit code 2 at the CLI).
    pub fn is_lock_contention(&self) -> bool {
        matches!(
            self,
            GateError::AcquireTimeout { .. }
                | GateError::NotHolder { .. }
                | GateError::Cancelled { .. }
        )
    }
}

fn holder_label(holder: &Option<Box<LockRecord>>) -> String {
    match holder {
        Some(record) => format!("{} pid {}", record.operation_id, record.pid),
        None => "none".to_string(),
    }
}

/// Evidence schema rejection naming every offending field.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SchemaError {
    #[error("unknown evidence type {0:?}")]
    UnknownType(String),

    #[error("{}", render_fields(.evidence_type, .missing, .invalid))]
    Fields {
        evidence_type: String,
        missing: Vec<String>,
        invalid: Vec<FieldIssue>,
    },
}

impl SchemaError {
    /// Missing required field names, in declaration order.
    pub fn missing(&self) -> &[String] {
        match self {
            SchemaError::Fields { missing, .. } => missing,
            SchemaError::UnknownType(_) => &[],
        }
    }

    pub fn invalid(&self) -> &[FieldIssue] {
        match self {
            SchemaError::Fields { invalid, .. } => invalid,
            SchemaError::UnknownType(_) => &[],
        }
    }
}

/// A present field that failed its kind check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldIssue {
    pub field: String,
    pub reason: String,
}

impl fmt::Display for FieldIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.field, self.reason)
    }
}

fn render_fields(evidence_type: &str, missing: &[String], invalid: &[FieldIssue]) -> String {
    let mut parts = Vec::new();
    if !missing.is_empty() {
        parts.push(format!("missing {}", missing.join(", ")));
    }
    if !invalid.is_empty() {
        let rendered: Vec<String> = invalid.iter().map(ToString::to_string).collect();
        parts.push(format!("invalid {}", rendered.join(", ")));
    }
    format!("schema error for {evidence_type}: {}", parts.join("; "))
}
