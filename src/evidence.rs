//! Evidence store.
//!
//! Records are validated against their type's required fields at collection
//! time, written once, and never modified. A correction is a new record that
//! the checklist item is re-pointed at.
mod schema;

pub use schema::{coerce_cli_value, validate_fields, EvidenceType, FieldKind, FieldSpec};

use crate::error::{GateError, Result};
use crate::paths::StorePaths;
use crate::registry::{IdAllocator, IdKind, Identifier};
use crate::util::{ensure_dir, now_epoch_ms, sha256_hex, write_atomic};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::Path;

pub const EVIDENCE_SCHEMA_VERSION: u32 = 1;

/// A persisted, schema-checked artifact proving a checklist item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvidenceRecord {
    pub schema_version: u32,
    pub id: Identifier,
    #[serde(rename = "type")]
    pub evidence_type: String,
    pub fields: BTreeMap<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artifact: Option<ArtifactRef>,
    pub collected_at_epoch_ms: u64,
}

impl EvidenceRecord {
    pub fn kind(&self) -> Option<EvidenceType> {
        EvidenceType::parse(&self.evidence_type)
    }
}

/// Artifact payload stored next to the record, referenced by hash.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactRef {
    pub sha256: String,
    pub bytes: u64,
}

/// Handle onto `evidence/` in a gate store.
#[derive(Debug, Clone)]
pub struct EvidenceStore {
    paths: StorePaths,
    allocator: IdAllocator,
}

impl EvidenceStore {
    pub fn new(paths: StorePaths) -> Self {
        let allocator = IdAllocator::new(paths.clone());
        Self { paths, allocator }
    }

    /// Validate and persist a new record.
    ///
    /// Schema failures return the exact missing/invalid fields and consume no
    /// identifier.
    pub fn collect(
        &self,
        type_name: &str,
        fields: BTreeMap<String, Value>,
        artifact: Option<&[u8]>,
        period: &str,
    ) -> Result<EvidenceRecord> {
        let kind = validate_fields(type_name, &fields)?;
        let id = self.allocator.assign(IdKind::Evidence, period)?;
        let artifact_ref = match artifact {
            Some(bytes) => {
                let path = self.paths.artifact_path(&id.to_string());
                write_atomic(&path, bytes)?;
                Some(ArtifactRef {
                    sha256: sha256_hex(bytes),
                    bytes: bytes.len() as u64,
                })
            }
            None => None,
        };
        let record = EvidenceRecord {
            schema_version: EVIDENCE_SCHEMA_VERSION,
            id: id.clone(),
            evidence_type: kind.as_str().to_string(),
            fields,
            artifact: artifact_ref,
            collected_at_epoch_ms: now_epoch_ms(),
        };
        self.persist_new(&record)?;
        tracing::info!(id = %id, evidence_type = kind.as_str(), "evidence collected");
        Ok(record)
    }

    pub fn fetch(&self, id: &Identifier) -> Result<EvidenceRecord> {
        let path = self.paths.evidence_path(&id.to_string());
        let bytes = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Err(GateError::NotFound { id: id.to_string() })
            }
            Err(err) => return Err(GateError::io(&path, err)),
        };
        parse_record(&path, &bytes)
    }

    /// Re-run schema validation independent of collection time.
    pub fn validate(&self, record: &EvidenceRecord) -> bool {
        self.validate_detailed(record).is_ok()
    }

    /// Schema check plus artifact integrity when the payload is in this store.
    pub fn validate_detailed(&self, record: &EvidenceRecord) -> Result<EvidenceType> {
        if record.schema_version != EVIDENCE_SCHEMA_VERSION {
            return Err(GateError::Corrupt {
                path: self.paths.evidence_path(&record.id.to_string()),
                reason: format!("unsupported schema_version {}", record.schema_version),
            });
        }
        if record.id.kind() != IdKind::Evidence {
            return Err(GateError::InvalidIdentifier {
                raw: record.id.to_string(),
                reason: "evidence records need an EVID identifier".to_string(),
            });
        }
        let kind = validate_fields(&record.evidence_type, &record.fields)?;
        if let Some(artifact) = &record.artifact {
            let path = self.paths.artifact_path(&record.id.to_string());
            match fs::read(&path) {
                Ok(bytes) => {
                    if sha256_hex(&bytes) != artifact.sha256 {
                        return Err(GateError::Corrupt {
                            path,
                            reason: "artifact hash mismatch".to_string(),
                        });
                    }
                }
                // Records held here must keep their payload; a foreign record
                // may carry one this store never saw.
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                    if self.paths.evidence_path(&record.id.to_string()).is_file() {
                        return Err(GateError::Corrupt {
                            path,
                            reason: "artifact missing".to_string(),
                        });
                    }
                }
                Err(err) => return Err(GateError::io(&path, err)),
            }
        }
        Ok(kind)
    }

    /// Load a record file from anywhere on disk and validate it.
    pub fn validate_file(&self, path: &Path) -> Result<EvidenceRecord> {
        let bytes = fs::read(path).map_err(|err| GateError::io(path, err))?;
        let record = parse_record(path, &bytes)?;
        self.validate_detailed(&record)?;
        Ok(record)
    }

    /// All stored records ordered by identifier.
    pub fn list(&self) -> Result<Vec<EvidenceRecord>> {
        let dir = self.paths.evidence_dir();
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(GateError::io(&dir, err)),
        };
        let mut records = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|err| GateError::io(&dir, err))?;
            let path = entry.path();
            if path.extension().is_some_and(|ext| ext == "json") {
                let bytes = fs::read(&path).map_err(|err| GateError::io(&path, err))?;
                records.push(parse_record(&path, &bytes)?);
            }
        }
        records.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(records)
    }

    fn persist_new(&self, record: &EvidenceRecord) -> Result<()> {
        let path = self.paths.evidence_path(&record.id.to_string());
        let dir = self.paths.evidence_dir();
        ensure_dir(&dir)?;
        let text = serde_json::to_string_pretty(record).map_err(|err| GateError::Corrupt {
            path: path.clone(),
            reason: format!("serialize: {err}"),
        })?;
        let mut temp =
            tempfile::NamedTempFile::new_in(&dir).map_err(|err| GateError::io(&dir, err))?;
        temp.write_all(text.as_bytes())
            .map_err(|err| GateError::io(temp.path(), err))?;
        temp.as_file()
            .sync_all()
            .map_err(|err| GateError::io(temp.path(), err))?;
        // Records are write-once; an existing file means a counter bug, not a retry.
        temp.persist_noclobber(&path)
            .map_err(|err| GateError::io(&path, err.error))?;
        Ok(())
    }
}

fn parse_record(path: &Path, bytes: &[u8]) -> Result<EvidenceRecord> {
    serde_json::from_slice(bytes).map_err(|err| GateError::Corrupt {
        path: path.to_path_buf(),
        reason: err.to_string(),
    })
}
