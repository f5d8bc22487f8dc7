//! Incremental scope resolution.
//!
//! Picks the checks whose declared input globs intersect a change set. Any
//! path in the escalation set, or a change set that cannot be determined,
//! selects the full catalog instead. Scope never fails toward "run nothing".
use crate::error::{GateError, Result};
use crate::hasher::FileRef;
use crate::registry::Identifier;
use crate::util::read_json_optional;
use globset::{Glob, GlobSet, GlobSetBuilder};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;
use walkdir::WalkDir;

pub const CATALOG_SCHEMA_VERSION: u32 = 1;

/// Paths whose change invalidates any incremental reasoning.
pub const DEFAULT_ESCALATION: &[&str] = &[
    "Cargo.toml",
    "Cargo.lock",
    "package.json",
    "go.mod",
    "pyproject.toml",
    "spec.md",
    ".github/workflows/**",
];

/// The set of checks a repository declares, loaded from `catalog.json`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CheckCatalog {
    #[serde(default = "catalog_schema_version")]
    pub schema_version: u32,
    pub checks: Vec<CheckSpec>,
    #[serde(default = "default_escalation")]
    pub escalation: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CheckSpec {
    pub name: String,
    pub inputs: Vec<String>,
    pub command: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
    /// Checklist item this check's outcome proves, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checklist: Option<Identifier>,
}

impl CheckSpec {
    pub fn timeout(&self, fallback: Duration) -> Duration {
        self.timeout_secs.map(Duration::from_secs).unwrap_or(fallback)
    }
}

fn catalog_schema_version() -> u32 {
    CATALOG_SCHEMA_VERSION
}

fn default_escalation() -> Vec<String> {
    DEFAULT_ESCALATION.iter().map(|s| s.to_string()).collect()
}

impl CheckCatalog {
    pub fn new(checks: Vec<CheckSpec>) -> Self {
        Self {
            schema_version: CATALOG_SCHEMA_VERSION,
            checks,
            escalation: default_escalation(),
        }
    }

    /// Load and validate a catalog file.
    pub fn load(path: &Path) -> Result<Self> {
        let catalog: Self = read_json_optional(path)?.ok_or_else(|| {
            GateError::Config(format!("no check catalog at {}", path.display()))
        })?;
        catalog.validate()?;
        Ok(catalog)
    }

    /// Reject duplicate or empty names and patterns that do not compile.
    pub fn validate(&self) -> Result<()> {
        if self.schema_version != CATALOG_SCHEMA_VERSION {
            return Err(GateError::Config(format!(
                "unsupported catalog schema_version {}",
                self.schema_version
            )));
        }
        let mut seen = BTreeSet::new();
        for check in &self.checks {
            if check.name.trim().is_empty() {
                return Err(GateError::Config("check with empty name".to_string()));
            }
            if !seen.insert(check.name.as_str()) {
                return Err(GateError::Config(format!(
                    "duplicate check name {}",
                    check.name
                )));
            }
            if check.command.trim().is_empty() {
                return Err(GateError::Config(format!(
                    "check {} has an empty command",
                    check.name
                )));
            }
            compile_globset(&check.inputs)?;
        }
        compile_globset(&self.escalation)?;
        Ok(())
    }

    pub fn check(&self, name: &str) -> Option<&CheckSpec> {
        self.checks.iter().find(|check| check.name == name)
    }

    fn all_names(&self) -> Vec<String> {
        self.checks.iter().map(|check| check.name.clone()).collect()
    }
}

/// Files changed in the range under test, or why they are unknown.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum ChangeSet {
    Known { files: Vec<FileRef> },
    Unknown { reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ScopeReason {
    Incremental,
    Escalated { path: String },
    ChangesUnknown { reason: String },
}

/// Checks to run, in catalog order, and why.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ScopeDecision {
    pub checks: Vec<String>,
    pub reason: ScopeReason,
}

impl ScopeDecision {
    pub fn is_full(&self) -> bool {
        !matches!(self.reason, ScopeReason::Incremental)
    }
}

/// Select the checks a change set requires.
pub fn scope(changes: &ChangeSet, catalog: &CheckCatalog) -> Result<ScopeDecision> {
    let files = match changes {
        ChangeSet::Unknown { reason } => {
            tracing::info!(%reason, "change set unknown; running full scope");
            return Ok(ScopeDecision {
                checks: catalog.all_names(),
                reason: ScopeReason::ChangesUnknown {
                    reason: reason.clone(),
                },
            });
        }
        ChangeSet::Known { files } => files,
    };

    let escalation = compile_globset(&catalog.escalation)?;
    if let Some(hit) = files.iter().find(|file| escalation.is_match(&file.logical)) {
        tracing::info!(path = %hit.logical, "escalation path changed; running full scope");
        return Ok(ScopeDecision {
            checks: catalog.all_names(),
            reason: ScopeReason::Escalated {
                path: hit.logical.clone(),
            },
        });
    }

    let mut selected = Vec::new();
    for check in &catalog.checks {
        let inputs = compile_globset(&check.inputs)?;
        if files.iter().any(|file| inputs.is_match(&file.logical)) {
            selected.push(check.name.clone());
        }
    }
    tracing::debug!(
        changed = files.len(),
        selected = selected.len(),
        total = catalog.checks.len(),
        "incremental scope resolved"
    );
    Ok(ScopeDecision {
        checks: selected,
        reason: ScopeReason::Incremental,
    })
}

/// Ask git which files changed.
///
/// With a range this is `git diff --name-only <range>`; without one it is the
/// working tree against `HEAD` plus untracked files. Any failure, including a
/// repository with no commits yet, yields `Unknown`.
pub fn changed_files(repo: &Path, range: Option<&str>) -> ChangeSet {
    let diff_target = range.unwrap_or("HEAD");
    let mut names = match git_lines(repo, &["diff", "--name-only", diff_target]) {
        Ok(names) => names,
        Err(reason) => return ChangeSet::Unknown { reason },
    };
    if range.is_none() {
        match git_lines(repo, &["ls-files", "--others", "--exclude-standard"]) {
            Ok(untracked) => names.extend(untracked),
            Err(reason) => return ChangeSet::Unknown { reason },
        }
    }
    names.sort();
    names.dedup();
    ChangeSet::Known {
        files: names
            .iter()
            .map(|name| FileRef::under(repo, name))
            .collect(),
    }
}

fn git_lines(repo: &Path, args: &[&str]) -> std::result::Result<Vec<String>, String> {
    let output = Command::new("git")
        .args(args)
        .current_dir(repo)
        .output()
        .map_err(|err| format!("run git: {err}"))?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(format!("git {} failed: {}", args.join(" "), stderr.trim()));
    }
    Ok(String::from_utf8_lossy(&output.stdout)
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(str::to_string)
        .collect())
}

/// A check's inputs as found in the tree.
///
/// `unreadable` lists entries the walk could not inspect (permission denied,
/// dangling or looping symlinks). Any of them may hide an input, so an input
/// set with unreadable entries must never be cached.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InputSet {
    pub files: Vec<FileRef>,
    pub unreadable: Vec<PathBuf>,
}

impl InputSet {
    pub fn is_complete(&self) -> bool {
        self.unreadable.is_empty()
    }
}

/// Expand a check's input globs against the repository tree.
///
/// `.git` and the gate's own store are never inputs. Symlinks are followed so
/// a linked input contributes its target's content.
pub fn expand_inputs(repo: &Path, store_root: &Path, check: &CheckSpec) -> Result<InputSet> {
    let matcher = compile_globset(&check.inputs)?;
    let store_root = store_root.to_path_buf();
    let walker = WalkDir::new(repo)
        .follow_links(true)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|entry| entry.file_name() != ".git" && entry.path() != store_root);

    let mut inputs = InputSet::default();
    for entry in walker {
        let entry = match entry {
            Ok(entry) => entry,
            Err(err) => {
                let path = err
                    .path()
                    .map(Path::to_path_buf)
                    .unwrap_or_else(|| repo.to_path_buf());
                tracing::warn!(check = %check.name, path = %path.display(), %err, "input tree entry unreadable");
                inputs.unreadable.push(path);
                continue;
            }
        };
        if !entry.file_type().is_file() {
            continue;
        }
        let Ok(rel) = entry.path().strip_prefix(repo) else {
            continue;
        };
        let rel = rel.to_string_lossy().replace('\\', "/");
        if matcher.is_match(&rel) {
            inputs.files.push(FileRef::under(repo, &rel));
        }
    }
    tracing::debug!(
        check = %check.name,
        inputs = inputs.files.len(),
        unreadable = inputs.unreadable.len(),
        "inputs expanded"
    );
    Ok(inputs)
}

pub(crate) fn compile_globset(patterns: &[String]) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        let glob = Glob::new(pattern).map_err(|err| GateError::Pattern {
            pattern: pattern.clone(),
            reason: err.to_string(),
        })?;
        builder.add(glob);
    }
    builder.build().map_err(|err| GateError::Pattern {
        pattern: patterns.join(","),
        reason: err.to_string(),
    })
}
