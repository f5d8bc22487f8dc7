//! Stable identifiers and the per-(kind, period) sequence allocator.
//!
//! Identifiers are immutable once assigned and never reused; the counter only
//! moves forward, even when an item is later superseded.
use crate::error::{GateError, Result};
use crate::paths::StorePaths;
use crate::util::{read_json_or_default, with_exclusive_lock, write_json_atomic};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

pub const COUNTERS_SCHEMA_VERSION: u32 = 1;

/// Item families that receive identifiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IdKind {
    Requirement,
    Checklist,
    Evidence,
}

impl IdKind {
    /// Prefix used in rendered identifiers.
    pub fn prefix(&self) -> &'static str {
        match self {
            IdKind::Requirement => "REQ",
            IdKind::Checklist => "CL",
            IdKind::Evidence => "EVID",
        }
    }

    fn from_prefix(prefix: &str) -> Option<Self> {
        match prefix {
            "REQ" => Some(IdKind::Requirement),
            "CL" => Some(IdKind::Checklist),
            "EVID" => Some(IdKind::Evidence),
            _ => None,
        }
    }
}

impl fmt::Display for IdKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.prefix())
    }
}

/// `PREFIX-period-seq`, e.g. `REQ-2026W42-007`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Identifier {
    kind: IdKind,
    period: String,
    seq: u64,
}

impl Identifier {
    pub fn new(kind: IdKind, period: &str, seq: u64) -> Result<Self> {
        validate_period(period)?;
        Ok(Self {
            kind,
            period: period.to_string(),
            seq,
        })
    }

    pub fn kind(&self) -> IdKind {
        self.kind
    }

    pub fn period(&self) -> &str {
        &self.period
    }

    pub fn seq(&self) -> u64 {
        self.seq
    }

    /// Parse and require a specific kind.
    pub fn parse_kind(raw: &str, expected: IdKind) -> Result<Self> {
        let id: Identifier = raw.parse()?;
        if id.kind != expected {
            return Err(GateError::InvalidIdentifier {
                raw: raw.to_string(),
                reason: format!("expected a {} identifier", expected.prefix()),
            });
        }
        Ok(id)
    }
}

impl fmt::Display for Identifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}-{:03}", self.kind.prefix(), self.period, self.seq)
    }
}

impl FromStr for Identifier {
    type Err = GateError;

    fn from_str(raw: &str) -> Result<Self> {
        let invalid = |reason: &str| GateError::InvalidIdentifier {
            raw: raw.to_string(),
            reason: reason.to_string(),
        };
        let mut parts = raw.trim().split('-');
        let (Some(prefix), Some(period), Some(seq), None) =
            (parts.next(), parts.next(), parts.next(), parts.next())
        else {
            return Err(invalid("expected PREFIX-period-seq"));
        };
        let kind = IdKind::from_prefix(prefix).ok_or_else(|| invalid("unknown prefix"))?;
        if period.is_empty() || !period.chars().all(|ch| ch.is_ascii_alphanumeric()) {
            return Err(invalid("period must be alphanumeric"));
        }
        if seq.is_empty() || !seq.chars().all(|ch| ch.is_ascii_digit()) {
            return Err(invalid("sequence must be numeric"));
        }
        let seq = seq.parse().map_err(|_| invalid("sequence out of range"))?;
        Ok(Self {
            kind,
            period: period.to_string(),
            seq,
        })
    }
}

impl TryFrom<String> for Identifier {
    type Error = GateError;

    fn try_from(raw: String) -> Result<Self> {
        raw.parse()
    }
}

impl From<Identifier> for String {
    fn from(id: Identifier) -> Self {
        id.to_string()
    }
}

/// Reject periods that would break the identifier grammar.
pub fn validate_period(period: &str) -> Result<()> {
    if period.is_empty() || !period.chars().all(|ch| ch.is_ascii_alphanumeric()) {
        return Err(GateError::InvalidIdentifier {
            raw: period.to_string(),
            reason: "period must be non-empty ASCII alphanumeric".to_string(),
        });
    }
    Ok(())
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct CounterFile {
    schema_version: u32,
    #[serde(default)]
    counters: BTreeMap<String, u64>,
}

/// Exclusive-increment allocator shared by the registry and the evidence store.
#[derive(Debug, Clone)]
pub struct IdAllocator {
    paths: StorePaths,
}

impl IdAllocator {
    pub fn new(paths: StorePaths) -> Self {
        Self { paths }
    }

    /// Assign the next identifier for `(kind, period)`.
    ///
    /// The read-increment-write cycle runs under the registry lock, so
    /// concurrent callers in different processes never share a sequence.
    pub fn assign(&self, kind: IdKind, period: &str) -> Result<Identifier> {
        validate_period(period)?;
        with_exclusive_lock(&self.paths.registry_lock_path(), || {
            self.assign_locked(kind, period)
        })
    }

    /// Variant for callers that already hold the registry lock.
    pub(crate) fn assign_locked(&self, kind: IdKind, period: &str) -> Result<Identifier> {
        let path = self.paths.counters_path();
        let mut file: CounterFile = read_json_or_default(&path)?;
        file.schema_version = COUNTERS_SCHEMA_VERSION;
        let slot = file
            .counters
            .entry(format!("{}:{}", kind.prefix(), period))
            .or_insert(0);
        *slot += 1;
        let seq = *slot;
        write_json_atomic(&path, &file)?;
        tracing::debug!(kind = kind.prefix(), period, seq, "assigned identifier");
        Identifier::new(kind, period, seq)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;
    use std::sync::Arc;

    #[test]
    fn identifiers_round_trip_canonical_form() {
        let id: Identifier = "REQ-W1-001".parse().expect("parse");
        assert_eq!(id.kind(), IdKind::Requirement);
        assert_eq!(id.period(), "W1");
        assert_eq!(id.seq(), 1);
        assert_eq!(id.to_string(), "REQ-W1-001");
        let wide: Identifier = "CL-2026W42-1234".parse().expect("parse wide");
        assert_eq!(wide.to_string(), "CL-2026W42-1234");
    }

    #[test]
    fn malformed_identifiers_are_rejected() {
        for raw in ["REQ-W1", "XYZ-W1-001", "REQ-W-1-001", "REQ-W1-abc", "REQ--001"] {
            assert!(raw.parse::<Identifier>().is_err(), "{raw} should fail");
        }
        let err = Identifier::parse_kind("CL-W1-001", IdKind::Requirement).expect_err("kind");
        assert!(err.to_string().contains("REQ"));
    }

    #[test]
    fn assign_is_monotonic_per_kind_and_period() {
        let dir = tempfile::tempdir().expect("create temp dir");
        let allocator = IdAllocator::new(StorePaths::new(dir.path().to_path_buf()));
        let first = allocator.assign(IdKind::Requirement, "W1").expect("assign");
        let second = allocator.assign(IdKind::Requirement, "W1").expect("assign");
        let other_period = allocator.assign(IdKind::Requirement, "W2").expect("assign");
        let other_kind = allocator.assign(IdKind::Checklist, "W1").expect("assign");
        assert_eq!(first.to_string(), "REQ-W1-001");
        assert_eq!(second.to_string(), "REQ-W1-002");
        assert_eq!(other_period.to_string(), "REQ-W2-001");
        assert_eq!(other_kind.to_string(), "CL-W1-001");
    }

    #[test]
    fn concurrent_assign_never_duplicates() {
        let dir = tempfile::tempdir().expect("create temp dir");
        let allocator = Arc::new(IdAllocator::new(StorePaths::new(dir.path().to_path_buf())));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let allocator = Arc::clone(&allocator);
                std::thread::spawn(move || {
                    (0..10)
                        .map(|_| {
                            allocator
                                .assign(IdKind::Checklist, "W7")
                                .expect("assign")
                                .seq()
                        })
                        .collect::<Vec<_>>()
                })
            })
            .collect();
        let mut seen = BTreeSet::new();
        for handle in handles {
            for seq in handle.join().expect("join") {
                assert!(seen.insert(seq), "duplicate sequence {seq}");
            }
        }
        assert_eq!(seen.len(), 80);
        assert_eq!(seen.iter().max().copied(), Some(80));
    }
}
