//! Identifier registry: requirement and checklist items plus their links.
//!
//! Links are keyed by identifier, never by description text, so rewording
//! either side cannot break or redirect a mapping. Every table write happens
//! under the registry lock and lands through an atomic replace.
mod ids;
mod items;

pub use ids::{validate_period, IdAllocator, IdKind, Identifier};
pub use items::{
    ChecklistItem, LinkOutcome, RegistryReport, RequirementItem, RequirementStatus, Resolution,
};

use crate::error::{GateError, Result};
use crate::evidence::EvidenceStore;
use crate::paths::StorePaths;
use crate::util::{now_epoch_ms, read_json_or_default, with_exclusive_lock, write_json_atomic};
use items::{ItemTable, MappingTable};

/// Handle onto the persisted registry tables.
#[derive(Debug, Clone)]
pub struct Registry {
    paths: StorePaths,
    allocator: IdAllocator,
}

impl Registry {
    pub fn new(paths: StorePaths) -> Self {
        let allocator = IdAllocator::new(paths.clone());
        Self { paths, allocator }
    }

    /// Assign a fresh identifier without creating an item.
    pub fn assign(&self, kind: IdKind, period: &str) -> Result<Identifier> {
        self.allocator.assign(kind, period)
    }

    /// Create a requirement item with a newly assigned identifier.
    pub fn add_requirement(&self, description: &str, period: &str) -> Result<RequirementItem> {
        validate_period(period)?;
        self.locked(|| {
            let id = self.allocator.assign_locked(IdKind::Requirement, period)?;
            let now = now_epoch_ms();
            let item = RequirementItem {
                id: id.clone(),
                description: description.trim().to_string(),
                period: period.to_string(),
                status: RequirementStatus::Open,
                superseded_by: None,
                created_at_epoch_ms: now,
                updated_at_epoch_ms: now,
            };
            let mut table = self.load_requirements()?;
            table.items.insert(id.to_string(), item.clone());
            self.save_requirements(&table)?;
            tracing::info!(id = %id, "requirement added");
            Ok(item)
        })
    }

    /// Create a checklist item, optionally linked to a parent requirement.
    pub fn add_checklist_item(
        &self,
        description: &str,
        period: &str,
        requirement: Option<&Identifier>,
    ) -> Result<ChecklistItem> {
        validate_period(period)?;
        if let Some(requirement) = requirement {
            expect_kind(requirement, IdKind::Requirement)?;
        }
        self.locked(|| {
            let id = self.allocator.assign_locked(IdKind::Checklist, period)?;
            let now = now_epoch_ms();
            let item = ChecklistItem {
                id: id.clone(),
                description: description.trim().to_string(),
                period: period.to_string(),
                complete: false,
                requirement: None,
                evidence: None,
                completed_at_epoch_ms: None,
                created_at_epoch_ms: now,
                updated_at_epoch_ms: now,
            };
            let mut table = self.load_checklist()?;
            table.items.insert(id.to_string(), item);
            self.save_checklist(&table)?;
            if let Some(requirement) = requirement {
                self.link_locked(requirement, &id)?;
            }
            tracing::info!(id = %id, "checklist item added");
            self.checklist_item(&id)
        })
    }

    pub fn requirement(&self, id: &Identifier) -> Result<RequirementItem> {
        self.load_requirements()?
            .items
            .remove(&id.to_string())
            .ok_or_else(|| not_found(id))
    }

    pub fn checklist_item(&self, id: &Identifier) -> Result<ChecklistItem> {
        self.load_checklist()?
            .items
            .remove(&id.to_string())
            .ok_or_else(|| not_found(id))
    }

    pub fn requirements(&self) -> Result<Vec<RequirementItem>> {
        Ok(self.load_requirements()?.items.into_values().collect())
    }

    pub fn checklist_items(&self) -> Result<Vec<ChecklistItem>> {
        Ok(self.load_checklist()?.items.into_values().collect())
    }

    /// Replace the description text of a requirement or checklist item.
    ///
    /// Identifiers and links are untouched.
    pub fn describe(&self, id: &Identifier, description: &str) -> Result<()> {
        let description = description.trim().to_string();
        self.locked(|| match id.kind() {
            IdKind::Requirement => {
                let mut table = self.load_requirements()?;
                let item = table.items.get_mut(&id.to_string()).ok_or_else(|| not_found(id))?;
                item.description = description;
                item.updated_at_epoch_ms = now_epoch_ms();
                self.save_requirements(&table)
            }
            IdKind::Checklist => {
                let mut table = self.load_checklist()?;
                let item = table.items.get_mut(&id.to_string()).ok_or_else(|| not_found(id))?;
                item.description = description;
                item.updated_at_epoch_ms = now_epoch_ms();
                self.save_checklist(&table)
            }
            IdKind::Evidence => Err(GateError::InvalidIdentifier {
                raw: id.to_string(),
                reason: "evidence records are immutable".to_string(),
            }),
        })
    }

    pub fn set_status(&self, id: &Identifier, status: RequirementStatus) -> Result<()> {
        expect_kind(id, IdKind::Requirement)?;
        self.locked(|| {
            let mut table = self.load_requirements()?;
            let item = table.items.get_mut(&id.to_string()).ok_or_else(|| not_found(id))?;
            item.status = status;
            item.updated_at_epoch_ms = now_epoch_ms();
            self.save_requirements(&table)
        })
    }

    /// Mark `old` as superseded by `new`. Requirements are never deleted.
    pub fn supersede(&self, old: &Identifier, new: &Identifier) -> Result<()> {
        expect_kind(old, IdKind::Requirement)?;
        expect_kind(new, IdKind::Requirement)?;
        if old == new {
            return Err(GateError::InvalidIdentifier {
                raw: old.to_string(),
                reason: "a requirement cannot supersede itself".to_string(),
            });
        }
        self.locked(|| {
            let mut table = self.load_requirements()?;
            if !table.items.contains_key(&new.to_string()) {
                return Err(not_found(new));
            }
            let item = table.items.get_mut(&old.to_string()).ok_or_else(|| not_found(old))?;
            item.superseded_by = Some(new.clone());
            item.updated_at_epoch_ms = now_epoch_ms();
            self.save_requirements(&table)
        })
    }

    /// Link a checklist item to its requirement parent.
    ///
    /// Idempotent for the same pair; a checklist item already linked to a
    /// different requirement is rejected with `DuplicateMapping`.
    pub fn link(&self, requirement: &Identifier, checklist: &Identifier) -> Result<LinkOutcome> {
        expect_kind(requirement, IdKind::Requirement)?;
        expect_kind(checklist, IdKind::Checklist)?;
        self.locked(|| self.link_locked(requirement, checklist))
    }

    fn link_locked(&self, requirement: &Identifier, checklist: &Identifier) -> Result<LinkOutcome> {
        let mut mapping = self.load_mapping()?;
        let key = checklist.to_string();
        if let Some(existing) = mapping.links.get(&key) {
            if existing == &requirement.to_string() {
                return Ok(LinkOutcome::AlreadyLinked);
            }
            return Err(GateError::DuplicateMapping {
                checklist: key,
                existing: existing.clone(),
                requested: requirement.to_string(),
            });
        }
        mapping.links.insert(key.clone(), requirement.to_string());
        self.save_mapping(&mapping)?;

        let mut table = self.load_checklist()?;
        if let Some(item) = table.items.get_mut(&key) {
            item.requirement = Some(requirement.clone());
            item.updated_at_epoch_ms = now_epoch_ms();
            self.save_checklist(&table)?;
        }
        tracing::info!(requirement = %requirement, checklist = %checklist, "linked");
        Ok(LinkOutcome::Created)
    }

    /// Resolve a checklist item to its requirement parent.
    pub fn resolve(&self, checklist: &Identifier) -> Result<Resolution> {
        expect_kind(checklist, IdKind::Checklist)?;
        let mapping = self.load_mapping()?;
        match mapping.links.get(&checklist.to_string()) {
            Some(raw) => Ok(Resolution::Mapped(raw.parse()?)),
            None => Ok(Resolution::Unmapped),
        }
    }

    /// Point a checklist item at an evidence record.
    ///
    /// A correction is a new record re-pointed here; completion is cleared
    /// until the item is completed again against the new evidence.
    pub fn attach_evidence(
        &self,
        checklist: &Identifier,
        evidence: &Identifier,
        store: &EvidenceStore,
    ) -> Result<()> {
        expect_kind(checklist, IdKind::Checklist)?;
        expect_kind(evidence, IdKind::Evidence)?;
        store.fetch(evidence)?;
        self.locked(|| {
            let mut table = self.load_checklist()?;
            let item = table
                .items
                .get_mut(&checklist.to_string())
                .ok_or_else(|| not_found(checklist))?;
            if item.evidence.as_ref() != Some(evidence) {
                item.complete = false;
                item.completed_at_epoch_ms = None;
            }
            item.evidence = Some(evidence.clone());
            item.updated_at_epoch_ms = now_epoch_ms();
            self.save_checklist(&table)?;
            tracing::info!(checklist = %checklist, evidence = %evidence, "evidence attached");
            Ok(())
        })
    }

    /// Mark a checklist item complete.
    ///
    /// Allowed only when its evidence reference resolves to a record that
    /// passes schema validation.
    pub fn complete(&self, checklist: &Identifier, store: &EvidenceStore) -> Result<()> {
        expect_kind(checklist, IdKind::Checklist)?;
        self.locked(|| {
            let mut table = self.load_checklist()?;
            let item = table
                .items
                .get_mut(&checklist.to_string())
                .ok_or_else(|| not_found(checklist))?;
            let evidence_id = item.evidence.clone().ok_or_else(|| GateError::EvidenceRequired {
                checklist: checklist.to_string(),
                reason: "no evidence attached".to_string(),
            })?;
            let record = match store.fetch(&evidence_id) {
                Ok(record) => record,
                Err(GateError::NotFound { .. }) => {
                    return Err(GateError::EvidenceRequired {
                        checklist: checklist.to_string(),
                        reason: format!("evidence {evidence_id} not found"),
                    })
                }
                Err(err) => return Err(err),
            };
            if let Err(err) = store.validate_detailed(&record) {
                return Err(GateError::EvidenceRequired {
                    checklist: checklist.to_string(),
                    reason: format!("evidence {evidence_id} is invalid: {err}"),
                });
            }
            let now = now_epoch_ms();
            item.complete = true;
            item.completed_at_epoch_ms = Some(now);
            item.updated_at_epoch_ms = now;
            self.save_checklist(&table)?;
            tracing::info!(checklist = %checklist, evidence = %evidence_id, "checklist item completed");
            Ok(())
        })
    }

    /// Clear the completion flag; the evidence reference is kept.
    pub fn reopen(&self, checklist: &Identifier) -> Result<()> {
        expect_kind(checklist, IdKind::Checklist)?;
        self.locked(|| {
            let mut table = self.load_checklist()?;
            let item = table
                .items
                .get_mut(&checklist.to_string())
                .ok_or_else(|| not_found(checklist))?;
            item.complete = false;
            item.completed_at_epoch_ms = None;
            item.updated_at_epoch_ms = now_epoch_ms();
            self.save_checklist(&table)
        })
    }

    /// Requirement ids with no mapped checklist item.
    ///
    /// Superseded requirements are skipped; their successor carries the work.
    pub fn orphans(&self) -> Result<Vec<Identifier>> {
        let mapping = self.load_mapping()?;
        let mapped: std::collections::BTreeSet<&String> = mapping.links.values().collect();
        Ok(self
            .load_requirements()?
            .items
            .into_values()
            .filter(|item| item.superseded_by.is_none())
            .filter(|item| !mapped.contains(&item.id.to_string()))
            .map(|item| item.id)
            .collect())
    }

    /// Summarize orphans, unmapped items, and incomplete items.
    pub fn report(&self) -> Result<RegistryReport> {
        let orphaned_requirements = self.orphans()?;
        let mapping = self.load_mapping()?;
        let checklist = self.load_checklist()?;
        let mut unmapped_checklist = Vec::new();
        let mut incomplete_checklist = Vec::new();
        for (key, item) in &checklist.items {
            if !mapping.links.contains_key(key) {
                unmapped_checklist.push(item.id.clone());
            }
            if !item.complete {
                incomplete_checklist.push(item.id.clone());
            }
        }
        Ok(RegistryReport {
            requirements: self.load_requirements()?.items.len(),
            checklist_items: checklist.items.len(),
            links: mapping.links.len(),
            orphaned_requirements,
            unmapped_checklist,
            incomplete_checklist,
        })
    }

    fn locked<T>(&self, f: impl FnOnce() -> Result<T>) -> Result<T> {
        with_exclusive_lock(&self.paths.registry_lock_path(), f)
    }

    fn load_requirements(&self) -> Result<ItemTable<RequirementItem>> {
        read_json_or_default(&self.paths.requirements_path())
    }

    fn save_requirements(&self, table: &ItemTable<RequirementItem>) -> Result<()> {
        write_json_atomic(&self.paths.requirements_path(), table)
    }

    fn load_checklist(&self) -> Result<ItemTable<ChecklistItem>> {
        read_json_or_default(&self.paths.checklist_path())
    }

    fn save_checklist(&self, table: &ItemTable<ChecklistItem>) -> Result<()> {
        write_json_atomic(&self.paths.checklist_path(), table)
    }

    fn load_mapping(&self) -> Result<MappingTable> {
        read_json_or_default(&self.paths.mapping_path())
    }

    fn save_mapping(&self, mapping: &MappingTable) -> Result<()> {
        write_json_atomic(&self.paths.mapping_path(), mapping)
    }
}

fn expect_kind(id: &Identifier, kind: IdKind) -> Result<()> {
    if id.kind() != kind {
        return Err(GateError::InvalidIdentifier {
            raw: id.to_string(),
            reason: format!("expected a {} identifier", kind.prefix()),
        });
    }
    Ok(())
}

fn not_found(id: &Identifier) -> GateError {
    GateError::NotFound { id: id.to_string() }
}
