//! Persisted registry tables.
use super::Identifier;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

pub const REGISTRY_SCHEMA_VERSION: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequirementStatus {
    Open,
    InProgress,
    Done,
}

impl RequirementStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RequirementStatus::Open => "open",
            RequirementStatus::InProgress => "in_progress",
            RequirementStatus::Done => "done",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "open" => Some(RequirementStatus::Open),
            "in_progress" => Some(RequirementStatus::InProgress),
            "done" => Some(RequirementStatus::Done),
            _ => None,
        }
    }
}

impl fmt::Display for RequirementStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A planned deliverable satisfied by one or more checklist items.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequirementItem {
    pub id: Identifier,
    pub description: String,
    pub period: String,
    pub status: RequirementStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub superseded_by: Option<Identifier>,
    pub created_at_epoch_ms: u64,
    pub updated_at_epoch_ms: u64,
}

/// A single verifiable acceptance condition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChecklistItem {
    pub id: Identifier,
    pub description: String,
    pub period: String,
    pub complete: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub requirement: Option<Identifier>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub evidence: Option<Identifier>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at_epoch_ms: Option<u64>,
    pub created_at_epoch_ms: u64,
    pub updated_at_epoch_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(super) struct ItemTable<T> {
    pub(super) schema_version: u32,
    #[serde(default = "BTreeMap::new")]
    pub(super) items: BTreeMap<String, T>,
}

impl<T> Default for ItemTable<T> {
    fn default() -> Self {
        Self {
            schema_version: REGISTRY_SCHEMA_VERSION,
            items: BTreeMap::new(),
        }
    }
}

/// Checklist id → requirement id. A map key can appear only once, which is
/// the at-most-one-parent invariant.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(super) struct MappingTable {
    pub(super) schema_version: u32,
    #[serde(default)]
    pub(super) links: BTreeMap<String, String>,
}

impl Default for MappingTable {
    fn default() -> Self {
        Self {
            schema_version: REGISTRY_SCHEMA_VERSION,
            links: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LinkOutcome {
    Created,
    AlreadyLinked,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", content = "requirement", rename_all = "snake_case")]
pub enum Resolution {
    Mapped(Identifier),
    Unmapped,
}

/// Registry health summary. Orphans are reportable, not fatal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RegistryReport {
    pub requirements: usize,
    pub checklist_items: usize,
    pub links: usize,
    pub orphaned_requirements: Vec<Identifier>,
    pub unmapped_checklist: Vec<Identifier>,
    pub incomplete_checklist: Vec<Identifier>,
}
