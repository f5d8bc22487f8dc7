//! The verification pipeline: scope, cache, execute, record.
//!
//! `run_gate` reports verdicts; deciding whether to proceed is the caller's.
use crate::cache::{CacheLookup, CheckCache};
use crate::config::GateConfig;
use crate::error::{GateError, Result};
use crate::evidence::EvidenceStore;
use crate::hasher::{hash_files, ContentDigest, FileRef};
use crate::paths::StorePaths;
use crate::registry::{Identifier, Registry};
use crate::runner::{run_check, CheckRun};
use crate::scope::{expand_inputs, scope, ChangeSet, CheckCatalog, CheckSpec, ScopeDecision};
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::PathBuf;

/// Where the gate runs and what it persists into.
#[derive(Debug, Clone)]
pub struct GateContext {
    pub repo: PathBuf,
    pub paths: StorePaths,
    pub config: GateConfig,
}

impl GateContext {
    pub fn new(repo: PathBuf, paths: StorePaths, config: GateConfig) -> Self {
        Self {
            repo,
            paths,
            config,
        }
    }

    pub fn cache(&self) -> CheckCache {
        CheckCache::new(self.paths.clone(), &self.config)
    }

    pub fn evidence(&self) -> EvidenceStore {
        EvidenceStore::new(self.paths.clone())
    }

    pub fn registry(&self) -> Registry {
        Registry::new(self.paths.clone())
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct GateOptions {
    /// Ignore cached verdicts and execute every scoped check.
    pub bypass: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum VerdictSource {
    Cache,
    Executed,
}

/// Outcome of one scoped check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CheckVerdict {
    pub check: String,
    pub source: VerdictSource,
    pub exit_code: i32,
    pub timed_out: bool,
    pub output_sample: String,
    /// Whether this run's outcome was written to the cache.
    pub cached: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub checklist: Option<Identifier>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub evidence: Option<Identifier>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub checklist_error: Option<String>,
}

impl CheckVerdict {
    pub fn passed(&self) -> bool {
        self.exit_code == 0 && !self.timed_out
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GateReport {
    pub scope: ScopeDecision,
    pub verdicts: Vec<CheckVerdict>,
}

impl GateReport {
    pub fn passed(&self) -> bool {
        self.verdicts.iter().all(CheckVerdict::passed)
    }

    pub fn failed_checks(&self) -> Vec<&str> {
        self.verdicts
            .iter()
            .filter(|verdict| !verdict.passed())
            .map(|verdict| verdict.check.as_str())
            .collect()
    }
}

/// Run every check the change set requires, consulting the cache first.
pub fn run_gate(
    ctx: &GateContext,
    catalog: &CheckCatalog,
    changes: &ChangeSet,
    options: GateOptions,
) -> Result<GateReport> {
    let decision = scope(changes, catalog)?;
    let cache = ctx.cache();
    let store_root = ctx.repo.join(ctx.paths.root());
    let mut verdicts = Vec::with_capacity(decision.checks.len());

    for name in &decision.checks {
        let Some(check) = catalog.check(name) else {
            continue;
        };
        let inputs = expand_inputs(&ctx.repo, &store_root, check)?;
        let cache = cache.clone().with_command(&check.command);
        if !inputs.is_complete() {
            tracing::warn!(check = %check.name, unreadable = inputs.unreadable.len(), "input set incomplete; running uncached");
            verdicts.push(execute(ctx, None, check, &inputs.files)?);
            continue;
        }
        let verdict = match cache.lookup(&check.name, &inputs.files, options.bypass)? {
            CacheLookup::Hit(outcome) => CheckVerdict {
                check: check.name.clone(),
                source: VerdictSource::Cache,
                exit_code: outcome.code,
                timed_out: false,
                output_sample: outcome.output_sample,
                cached: true,
                checklist: check.checklist.clone(),
                evidence: None,
                checklist_error: None,
            },
            CacheLookup::Miss(_) => execute(ctx, Some(&cache), check, &inputs.files)?,
        };
        verdicts.push(verdict);
    }

    let report = GateReport {
        scope: decision,
        verdicts,
    };
    tracing::info!(
        checks = report.verdicts.len(),
        passed = report.passed(),
        "gate finished"
    );
    Ok(report)
}

/// Run a check and, when `cache` is given, store the verdict under the
/// inputs as they were hashed before the run started.
fn execute(
    ctx: &GateContext,
    cache: Option<&CheckCache>,
    check: &CheckSpec,
    files: &[FileRef],
) -> Result<CheckVerdict> {
    let checked = if cache.is_some() {
        pre_run_digest(check, files)?
    } else {
        None
    };
    let timeout = check.timeout(ctx.config.check_timeout);
    let run = run_check(check, &ctx.repo, timeout, ctx.config.output_sample_bytes)?;

    // Timed-out runs stay uncached so a retry always executes.
    let cached = match (cache, &checked) {
        (Some(cache), Some(checked)) if !run.timed_out => {
            match cache.store_checked(
                &check.name,
                files,
                checked,
                run.exit_code,
                &run.output,
                ctx.config.cache_ttl,
            ) {
                Ok(entry) => entry.is_some(),
                Err(GateError::InputUnreadable { path, .. }) => {
                    tracing::warn!(check = %check.name, path = %path.display(), "input vanished during run; not caching");
                    false
                }
                Err(err) => return Err(err),
            }
        }
        _ => false,
    };

    let mut verdict = CheckVerdict {
        check: check.name.clone(),
        source: VerdictSource::Executed,
        exit_code: run.exit_code,
        timed_out: run.timed_out,
        output_sample: run.output.clone(),
        cached,
        checklist: check.checklist.clone(),
        evidence: None,
        checklist_error: None,
    };
    if let Some(checklist) = &check.checklist {
        match record_evidence(ctx, check, checklist, &run) {
            Ok(evidence) => verdict.evidence = Some(evidence),
            Err(err) => {
                tracing::warn!(check = %check.name, checklist = %checklist, %err, "could not record evidence");
                verdict.checklist_error = Some(err.to_string());
            }
        }
    }
    Ok(verdict)
}

fn pre_run_digest(check: &CheckSpec, files: &[FileRef]) -> Result<Option<ContentDigest>> {
    match hash_files(files) {
        Ok(digest) => Ok(Some(digest)),
        Err(GateError::InputUnreadable { path, .. }) => {
            tracing::warn!(check = %check.name, path = %path.display(), "input unreadable before run; not caching");
            Ok(None)
        }
        Err(err) => Err(err),
    }
}

/// Collect `test_result` evidence for a run and move the checklist item to
/// match: completed on pass, reopened on failure.
fn record_evidence(
    ctx: &GateContext,
    check: &CheckSpec,
    checklist: &Identifier,
    run: &CheckRun,
) -> Result<Identifier> {
    let store = ctx.evidence();
    let registry = ctx.registry();
    let sample = if run.output.trim().is_empty() {
        "(no output)".to_string()
    } else {
        run.output.clone()
    };
    let mut fields = BTreeMap::new();
    fields.insert("test_command".to_string(), Value::from(check.command.clone()));
    fields.insert("exit_code".to_string(), Value::from(run.exit_code));
    fields.insert("output_sample".to_string(), Value::from(sample));
    let record = store.collect(
        "test_result",
        fields,
        None,
        &ctx.config.effective_period(),
    )?;
    registry.attach_evidence(checklist, &record.id, &store)?;
    if run.passed() {
        registry.complete(checklist, &store)?;
    } else {
        registry.reopen(checklist)?;
    }
    Ok(record.id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    struct Fixture {
        _dir: tempfile::TempDir,
        ctx: GateContext,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().expect("create temp dir");
        let repo = dir.path().to_path_buf();
        fs::create_dir_all(repo.join("src")).expect("mkdir src");
        fs::write(repo.join("src/lib.rs"), "pub fn a() {}").expect("write");
        let config = GateConfig {
            period: Some("W1".to_string()),
            ..GateConfig::default()
        };
        let ctx = GateContext::new(repo.clone(), StorePaths::new(repo.join(".vgate")), config);
        Fixture { _dir: dir, ctx }
    }

    fn check(name: &str, command: &str, checklist: Option<&Identifier>) -> CheckSpec {
        CheckSpec {
            name: name.to_string(),
            inputs: vec!["src/**".to_string()],
            command: command.to_string(),
            timeout_secs: None,
            checklist: checklist.cloned(),
        }
    }

    fn unknown() -> ChangeSet {
        ChangeSet::Unknown {
            reason: "first run".to_string(),
        }
    }

    #[test]
    fn second_run_is_served_from_cache() {
        let fx = fixture();
        let catalog = CheckCatalog::new(vec![check("unit", "echo ran", None)]);
        let first = run_gate(&fx.ctx, &catalog, &unknown(), GateOptions::default()).expect("run");
        assert_eq!(first.verdicts[0].source, VerdictSource::Executed);
        assert!(first.verdicts[0].cached);

        let second = run_gate(&fx.ctx, &catalog, &unknown(), GateOptions::default()).expect("run");
        assert_eq!(second.verdicts[0].source, VerdictSource::Cache);
        assert!(second.passed());

        let bypassed = run_gate(&fx.ctx, &catalog, &unknown(), GateOptions { bypass: true })
            .expect("run");
        assert_eq!(bypassed.verdicts[0].source, VerdictSource::Executed);
    }

    #[test]
    fn failures_are_reported_and_cached() {
        let fx = fixture();
        let catalog = CheckCatalog::new(vec![check("unit", "echo boom; exit 2", None)]);
        let report = run_gate(&fx.ctx, &catalog, &unknown(), GateOptions::default()).expect("run");
        assert!(!report.passed());
        assert_eq!(report.failed_checks(), ["unit"]);
        let again = run_gate(&fx.ctx, &catalog, &unknown(), GateOptions::default()).expect("run");
        assert_eq!(again.verdicts[0].source, VerdictSource::Cache);
        assert_eq!(again.verdicts[0].exit_code, 2);
    }

    #[test]
    fn timed_out_checks_are_never_cached() {
        let fx = fixture();
        let mut slow = check("slow", "sleep 5", None);
        slow.timeout_secs = Some(0);
        let catalog = CheckCatalog::new(vec![slow]);
        let report = run_gate(&fx.ctx, &catalog, &unknown(), GateOptions::default()).expect("run");
        assert!(report.verdicts[0].timed_out);
        assert!(!report.verdicts[0].cached);
        assert!(fx.ctx.cache().entries().expect("entries").is_empty());
    }

    #[test]
    fn checklist_items_follow_check_outcomes() {
        let fx = fixture();
        let registry = fx.ctx.registry();
        let item = registry
            .add_checklist_item("unit tests pass", "W1", None)
            .expect("add item");

        let passing = CheckCatalog::new(vec![check("unit", "echo ok", Some(&item.id))]);
        let report = run_gate(&fx.ctx, &passing, &unknown(), GateOptions::default()).expect("run");
        let evidence = report.verdicts[0].evidence.clone().expect("evidence recorded");
        let stored = registry.checklist_item(&item.id).expect("fetch");
        assert!(stored.complete);
        assert_eq!(stored.evidence, Some(evidence));

        let failing = CheckCatalog::new(vec![check("unit", "exit 1", Some(&item.id))]);
        run_gate(&fx.ctx, &failing, &unknown(), GateOptions { bypass: true }).expect("run");
        assert!(!registry.checklist_item(&item.id).expect("fetch").complete);
    }

    #[test]
    fn unknown_checklist_item_is_reported_not_fatal() {
        let fx = fixture();
        let missing: Identifier = "CL-W1-404".parse().expect("parse");
        let catalog = CheckCatalog::new(vec![check("unit", "true", Some(&missing))]);
        let report = run_gate(&fx.ctx, &catalog, &unknown(), GateOptions::default()).expect("run");
        assert!(report.passed());
        assert!(report.verdicts[0].checklist_error.is_some());
    }

    #[test]
    fn verdict_for_inputs_rewritten_mid_run_is_not_cached() {
        let fx = fixture();
        fs::write(fx.ctx.repo.join("src/lib.rs"), "good").expect("write");
        let catalog = CheckCatalog::new(vec![check(
            "unit",
            "grep -q good src/lib.rs; rc=$?; echo bad > src/lib.rs; exit $rc",
            None,
        )]);
        let first = run_gate(&fx.ctx, &catalog, &unknown(), GateOptions::default()).expect("run");
        assert!(first.passed());
        assert!(!first.verdicts[0].cached);
        assert!(fx.ctx.cache().entries().expect("entries").is_empty());

        let second = run_gate(&fx.ctx, &catalog, &unknown(), GateOptions::default()).expect("run");
        assert_eq!(second.verdicts[0].source, VerdictSource::Executed);
        assert_eq!(second.verdicts[0].exit_code, 1);
        assert!(!second.passed());
    }

    #[test]
    fn editing_a_check_command_reruns_it() {
        let fx = fixture();
        let before = CheckCatalog::new(vec![check("unit", "exit 0", None)]);
        run_gate(&fx.ctx, &before, &unknown(), GateOptions::default()).expect("run");

        let after = CheckCatalog::new(vec![check("unit", "exit 4", None)]);
        let report = run_gate(&fx.ctx, &after, &unknown(), GateOptions::default()).expect("run");
        assert_eq!(report.verdicts[0].source, VerdictSource::Executed);
        assert_eq!(report.verdicts[0].exit_code, 4);
    }

    #[cfg(unix)]
    #[test]
    fn unreadable_tree_entries_run_uncached() {
        let fx = fixture();
        std::os::unix::fs::symlink(
            fx.ctx.repo.join("missing.rs"),
            fx.ctx.repo.join("src/dangling.rs"),
        )
        .expect("dangling link");
        let catalog = CheckCatalog::new(vec![check("unit", "echo ran", None)]);
        for _ in 0..2 {
            let report =
                run_gate(&fx.ctx, &catalog, &unknown(), GateOptions::default()).expect("run");
            assert!(report.passed());
            assert_eq!(report.verdicts[0].source, VerdictSource::Executed);
            assert!(!report.verdicts[0].cached);
        }
        assert!(fx.ctx.cache().entries().expect("entries").is_empty());
    }

    #[test]
    fn unrelated_changes_run_nothing() {
        let fx = fixture();
        let catalog = CheckCatalog::new(vec![check("unit", "true", None)]);
        let changes = ChangeSet::Known {
            files: vec![FileRef::under(&fx.ctx.repo, "README.md")],
        };
        let report = run_gate(&fx.ctx, &catalog, &changes, GateOptions::default()).expect("run");
        assert!(report.verdicts.is_empty());
        assert!(report.passed());
    }
}
