//! Command handlers behind the `vgate` CLI.
//!
//! Each handler resolves the store, loads layered config, calls one library
//! operation, and prints either a short text summary or pretty JSON.
use crate::cli::{
    CacheCommand, CacheLookupArgs, CacheStoreArgs, Command, EvidenceCollectArgs,
    EvidenceCommand, HashArgs, KindArg, LockAcquireArgs, LockCommand, RegistryCommand,
    RootArgs, RunArgs, ScopeArgs, StatusArg,
};
use anyhow::{anyhow, Context, Result};
use serde::Serialize;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::fs;
use std::io::{BufRead, IsTerminal, Write};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use verify_gate::cache::{CacheLookup, CheckCache};
use verify_gate::config::{parse_duration, GateConfig, ENV_STORE};
use verify_gate::evidence::{coerce_cli_value, EvidenceStore, EvidenceType};
use verify_gate::gate::{run_gate, GateContext, GateOptions, VerdictSource};
use verify_gate::hasher::{hash_files, FileRef};
use verify_gate::merge_lock::{
    default_actor, AcquireOutcome, AcquireRequest, LockState, MergeCoordinator, TryAcquire,
};
use verify_gate::paths::{StorePaths, DEFAULT_STORE_DIR};
use verify_gate::registry::{IdKind, Identifier, Registry, RequirementStatus, Resolution};
use verify_gate::sanitize::{keyword_matcher, scan_identifiers, strip_fenced_blocks};
use verify_gate::scope::{changed_files, scope, CheckCatalog};
use verify_gate::GateError;

/// Non-error command result; errors map to exit codes in `main`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Pass,
    Fail,
}

impl From<Verdict> for ExitCode {
    fn from(verdict: Verdict) -> Self {
        match verdict {
            Verdict::Pass => ExitCode::SUCCESS,
            Verdict::Fail => ExitCode::from(1),
        }
    }
}

/// Resolved store location plus layered configuration.
struct Session {
    repo: PathBuf,
    paths: StorePaths,
    config: GateConfig,
}

impl Session {
    fn open(args: &RootArgs) -> Result<Self> {
        let repo = args.repo.clone();
        let store = match &args.store {
            Some(store) => store.clone(),
            None => match std::env::var(ENV_STORE) {
                Ok(value) if !value.trim().is_empty() => PathBuf::from(value.trim()),
                _ => repo.join(DEFAULT_STORE_DIR),
            },
        };
        let paths = StorePaths::new(store);
        let config = GateConfig::load(&paths)
            .with_context(|| format!("load config from {}", paths.root().display()))?;
        Ok(Self {
            repo,
            paths,
            config,
        })
    }

    fn period(&self, flag: Option<&str>) -> String {
        match flag {
            Some(period) => period.to_string(),
            None => self.config.effective_period(),
        }
    }

    fn file_refs(&self, files: &[String]) -> Vec<FileRef> {
        files
            .iter()
            .map(|file| FileRef::under(&self.repo, file))
            .collect()
    }

    fn catalog(&self) -> Result<CheckCatalog> {
        let path = self.paths.catalog_path();
        CheckCatalog::load(&path).with_context(|| format!("load {}", path.display()))
    }
}

pub fn run(args: RootArgs) -> Result<Verdict> {
    let session = Session::open(&args)?;
    match args.command {
        Command::Hash(hash) => run_hash(&session, hash),
        Command::Cache(command) => run_cache(&session, command),
        Command::Evidence(command) => run_evidence(&session, command),
        Command::Registry(command) => run_registry(&session, command),
        Command::Lock(command) => run_lock(&session, command),
        Command::Scope(scope_args) => run_scope(&session, scope_args),
        Command::Run(run_args) => run_checks(&session, run_args),
    }
}

fn run_hash(session: &Session, args: HashArgs) -> Result<Verdict> {
    let digest = hash_files(&session.file_refs(&args.files))?;
    println!("{digest}");
    Ok(Verdict::Pass)
}

fn run_cache(session: &Session, command: CacheCommand) -> Result<Verdict> {
    let cache = CheckCache::new(session.paths.clone(), &session.config);
    match command {
        CacheCommand::Lookup(args) => cache_lookup(session, &cache, args),
        CacheCommand::Store(args) => cache_store(session, &cache, args),
        CacheCommand::Invalidate { pattern } => {
            let removed = cache.invalidate(&pattern)?;
            println!("removed {removed} entries");
            Ok(Verdict::Pass)
        }
        CacheCommand::Prune => {
            let removed = cache.prune()?;
            println!("pruned {removed} expired entries");
            Ok(Verdict::Pass)
        }
        CacheCommand::Stats { json } => {
            let stats = cache.stats()?;
            if json {
                print_json(&stats)?;
            } else {
                println!(
                    "hits {} misses {} hit rate {:.1}%",
                    stats.hits,
                    stats.misses,
                    stats.hit_rate * 100.0
                );
            }
            Ok(Verdict::Pass)
        }
        CacheCommand::List { json } => {
            let rows = cache.entries()?;
            if json {
                print_json(&rows)?;
            } else {
                for row in rows {
                    println!("{}\t{}", row.check, row.hash);
                }
            }
            Ok(Verdict::Pass)
        }
    }
}

fn cache_lookup(session: &Session, cache: &CheckCache, args: CacheLookupArgs) -> Result<Verdict> {
    let files = session.file_refs(&args.files);
    let cache = scoped(cache, args.command.as_deref());
    let lookup = cache.lookup(&args.check, &files, args.bypass)?;
    match &lookup {
        CacheLookup::Hit(outcome) => {
            if args.json {
                print_json(&json!({
                    "result": "hit",
                    "check": args.check,
                    "code": outcome.code,
                    "hash": outcome.hash,
                    "output_sample": outcome.output_sample,
                    "created_at_epoch_ms": outcome.created_at_epoch_ms,
                }))?;
            } else {
                println!("hit {} code {}", args.check, outcome.code);
            }
            Ok(Verdict::Pass)
        }
        CacheLookup::Miss(reason) => {
            if args.json {
                print_json(&json!({
                    "result": "miss",
                    "check": args.check,
                    "reason": reason,
                }))?;
            } else {
                println!("miss {} ({reason:?})", args.check);
            }
            Ok(Verdict::Fail)
        }
    }
}

fn cache_store(session: &Session, cache: &CheckCache, args: CacheStoreArgs) -> Result<Verdict> {
    let output = match &args.output_file {
        Some(path) => {
            let bytes = fs::read(path).with_context(|| format!("read {}", path.display()))?;
            String::from_utf8_lossy(&bytes).into_owned()
        }
        None => args.output.clone(),
    };
    let ttl = match &args.ttl {
        Some(raw) => parse_duration(raw).ok_or_else(|| anyhow!("invalid --ttl {raw:?}"))?,
        None => session.config.cache_ttl,
    };
    let files = session.file_refs(&args.files);
    let entry = scoped(cache, args.command.as_deref()).store(
        &args.check,
        &files,
        args.code,
        &output,
        ttl,
    )?;
    println!("stored {} {}", entry.check, entry.hash);
    Ok(Verdict::Pass)
}

fn scoped(cache: &CheckCache, command: Option<&str>) -> CheckCache {
    match command {
        Some(command) => cache.clone().with_command(command),
        None => cache.clone(),
    }
}

fn run_evidence(session: &Session, command: EvidenceCommand) -> Result<Verdict> {
    let store = EvidenceStore::new(session.paths.clone());
    match command {
        EvidenceCommand::Collect(args) => evidence_collect(session, &store, args),
        EvidenceCommand::Validate { file } => {
            let record = store.validate_file(&file)?;
            println!("valid {} ({})", record.id, record.evidence_type);
            Ok(Verdict::Pass)
        }
        EvidenceCommand::Show { id } => {
            let id = parse_id(&id, IdKind::Evidence)?;
            print_json(&store.fetch(&id)?)?;
            Ok(Verdict::Pass)
        }
        EvidenceCommand::List { json } => {
            let records = store.list()?;
            if json {
                print_json(&records)?;
            } else {
                for record in records {
                    println!("{}\t{}", record.id, record.evidence_type);
                }
            }
            Ok(Verdict::Pass)
        }
    }
}

fn evidence_collect(
    session: &Session,
    store: &EvidenceStore,
    args: EvidenceCollectArgs,
) -> Result<Verdict> {
    let kind = EvidenceType::parse(&args.evidence_type);
    let mut fields: BTreeMap<String, Value> = BTreeMap::new();
    for raw in &args.fields {
        let (key, value) = raw
            .split_once('=')
            .ok_or_else(|| anyhow!("--field expects key=value, got {raw:?}"))?;
        let key = key.trim();
        fields.insert(key.to_string(), coerce_cli_value(kind, key, value));
    }
    let artifact = match &args.artifact {
        Some(path) => Some(fs::read(path).with_context(|| format!("read {}", path.display()))?),
        None => None,
    };
    let period = session.period(args.period.as_deref());
    let record = store.collect(&args.evidence_type, fields, artifact.as_deref(), &period)?;
    if args.json {
        print_json(&record)?;
    } else {
        println!("{}", record.id);
    }
    Ok(Verdict::Pass)
}

fn run_registry(session: &Session, command: RegistryCommand) -> Result<Verdict> {
    let registry = Registry::new(session.paths.clone());
    let store = EvidenceStore::new(session.paths.clone());
    match command {
        RegistryCommand::Assign { kind, period } => {
            let kind = match kind {
                KindArg::Req => IdKind::Requirement,
                KindArg::Cl => IdKind::Checklist,
                KindArg::Evid => IdKind::Evidence,
            };
            let id = registry.assign(kind, &session.period(period.as_deref()))?;
            println!("{id}");
        }
        RegistryCommand::AddRequirement {
            description,
            period,
        } => {
            let item = registry.add_requirement(&description, &session.period(period.as_deref()))?;
            println!("{}", item.id);
        }
        RegistryCommand::AddItem {
            description,
            period,
            requirement,
        } => {
            let requirement = requirement
                .as_deref()
                .map(|raw| parse_id(raw, IdKind::Requirement))
                .transpose()?;
            let item = registry.add_checklist_item(
                &description,
                &session.period(period.as_deref()),
                requirement.as_ref(),
            )?;
            println!("{}", item.id);
        }
        RegistryCommand::Link {
            requirement,
            checklist,
        } => {
            let requirement = parse_id(&requirement, IdKind::Requirement)?;
            let checklist = parse_id(&checklist, IdKind::Checklist)?;
            let outcome = registry.link(&requirement, &checklist)?;
            println!("{checklist} -> {requirement} ({outcome:?})");
        }
        RegistryCommand::Resolve { checklist, json } => {
            let checklist = parse_id(&checklist, IdKind::Checklist)?;
            let resolution = registry.resolve(&checklist)?;
            if json {
                print_json(&resolution)?;
            } else {
                match resolution {
                    Resolution::Mapped(requirement) => println!("{requirement}"),
                    Resolution::Unmapped => println!("unmapped"),
                }
            }
        }
        RegistryCommand::Describe { id, description } => {
            let id: Identifier = id.parse()?;
            registry.describe(&id, &description)?;
        }
        RegistryCommand::Status { id, status } => {
            let id = parse_id(&id, IdKind::Requirement)?;
            let status = match status {
                StatusArg::Open => RequirementStatus::Open,
                StatusArg::InProgress => RequirementStatus::InProgress,
                StatusArg::Done => RequirementStatus::Done,
            };
            registry.set_status(&id, status)?;
        }
        RegistryCommand::Supersede { old, new } => {
            let old = parse_id(&old, IdKind::Requirement)?;
            let new = parse_id(&new, IdKind::Requirement)?;
            registry.supersede(&old, &new)?;
        }
        RegistryCommand::Attach {
            checklist,
            evidence,
        } => {
            let checklist = parse_id(&checklist, IdKind::Checklist)?;
            let evidence = parse_id(&evidence, IdKind::Evidence)?;
            registry.attach_evidence(&checklist, &evidence, &store)?;
        }
        RegistryCommand::Complete { checklist } => {
            let checklist = parse_id(&checklist, IdKind::Checklist)?;
            registry.complete(&checklist, &store)?;
        }
        RegistryCommand::Reopen { checklist } => {
            let checklist = parse_id(&checklist, IdKind::Checklist)?;
            registry.reopen(&checklist)?;
        }
        RegistryCommand::Report { json } => {
            let report = registry.report()?;
            if json {
                print_json(&report)?;
            } else {
                println!(
                    "requirements {} checklist items {} links {}",
                    report.requirements, report.checklist_items, report.links
                );
                print_id_list("orphaned requirements", &report.orphaned_requirements);
                print_id_list("unmapped checklist items", &report.unmapped_checklist);
                print_id_list("incomplete checklist items", &report.incomplete_checklist);
            }
        }
        RegistryCommand::Scan {
            file,
            keywords,
            json,
        } => return registry_scan(&registry, &store, &file, &keywords, json),
    }
    Ok(Verdict::Pass)
}

fn registry_scan(
    registry: &Registry,
    store: &EvidenceStore,
    file: &Path,
    keywords: &[String],
    json: bool,
) -> Result<Verdict> {
    let text = fs::read_to_string(file).with_context(|| format!("read {}", file.display()))?;
    let mut mentions = Vec::new();
    let mut unknown = 0usize;
    for mention in scan_identifiers(&text) {
        let known = match mention.id.kind() {
            IdKind::Requirement => exists(registry.requirement(&mention.id))?,
            IdKind::Checklist => exists(registry.checklist_item(&mention.id))?,
            IdKind::Evidence => exists(store.fetch(&mention.id))?,
        };
        if !known {
            unknown += 1;
        }
        mentions.push(json!({
            "id": mention.id,
            "line": mention.line,
            "known": known,
        }));
    }

    let mut keyword_lines = Vec::new();
    if !keywords.is_empty() {
        let matcher = keyword_matcher(keywords)?;
        for (idx, line) in strip_fenced_blocks(&text).lines().enumerate() {
            if matcher.is_match(line) {
                keyword_lines.push(json!({"line": idx + 1, "text": line.trim()}));
            }
        }
    }

    if json {
        print_json(&json!({
            "file": file.display().to_string(),
            "identifiers": mentions,
            "unknown": unknown,
            "keyword_lines": keyword_lines,
        }))?;
    } else {
        for mention in &mentions {
            let marker = if mention["known"].as_bool().unwrap_or(false) {
                ""
            } else {
                " (unknown)"
            };
            println!("{}:{}{}", mention["line"], mention["id"].as_str().unwrap_or(""), marker);
        }
        for line in &keyword_lines {
            println!("keyword {}: {}", line["line"], line["text"].as_str().unwrap_or(""));
        }
    }
    Ok(if unknown == 0 {
        Verdict::Pass
    } else {
        Verdict::Fail
    })
}

fn exists<T>(lookup: verify_gate::Result<T>) -> Result<bool> {
    match lookup {
        Ok(_) => Ok(true),
        Err(GateError::NotFound { .. }) => Ok(false),
        Err(err) => Err(err.into()),
    }
}

fn run_lock(session: &Session, command: LockCommand) -> Result<Verdict> {
    let coordinator = MergeCoordinator::new(session.paths.clone(), &session.config);
    match command {
        LockCommand::Acquire(args) => lock_acquire(session, coordinator, args),
        LockCommand::Release { operation_id } => {
            coordinator.release(&operation_id)?;
            println!("released {operation_id}");
            Ok(Verdict::Pass)
        }
        LockCommand::Status { json } => {
            let state = coordinator.status()?;
            if json {
                print_json(&state)?;
            } else {
                match state {
                    LockState::Free => println!("free"),
                    LockState::Held {
                        record,
                        age_ms,
                        stale,
                    } => println!(
                        "held by {} (pid {}, actor {}, age {}s{})",
                        record.operation_id,
                        record.pid,
                        record.actor,
                        age_ms / 1000,
                        if stale { ", stale" } else { "" }
                    ),
                }
            }
            Ok(Verdict::Pass)
        }
        LockCommand::ForceRelease { yes, actor } => {
            if !yes && !session.config.non_interactive && std::io::stdin().is_terminal() {
                let holder = match coordinator.status()? {
                    LockState::Free => "nobody".to_string(),
                    LockState::Held { record, .. } => record.operation_id,
                };
                if !confirm(&format!("force-release merge lock held by {holder}? [y/N] "))? {
                    println!("aborted");
                    return Ok(Verdict::Fail);
                }
            }
            let actor = actor.unwrap_or_else(default_actor);
            match coordinator.force_release(&actor)? {
                Some(previous) => println!("force-released {}", previous.operation_id),
                None => println!("lock was already free"),
            }
            Ok(Verdict::Pass)
        }
    }
}

fn lock_acquire(
    session: &Session,
    coordinator: MergeCoordinator,
    args: LockAcquireArgs,
) -> Result<Verdict> {
    let mut request = AcquireRequest::new(&args.operation_id, &session.config);
    if let Some(actor) = args.actor {
        request.actor = actor;
    }
    if let Some(raw) = &args.timeout {
        request.operation_timeout =
            parse_duration(raw).ok_or_else(|| anyhow!("invalid --timeout {raw:?}"))?;
    }
    let outcome = if args.no_wait {
        match coordinator.try_acquire(&request)? {
            TryAcquire::Acquired(outcome) => outcome,
            TryAcquire::Busy(holder) => {
                return Err(GateError::AcquireTimeout {
                    operation_id: request.operation_id,
                    holder: Some(Box::new(holder)),
                    waited: std::time::Duration::ZERO,
                }
                .into())
            }
            TryAcquire::Queued { waiting } => {
                tracing::info!(operation_id = %request.operation_id, waiting, "merge lock reserved for queued waiters");
                return Err(GateError::AcquireTimeout {
                    operation_id: request.operation_id,
                    holder: None,
                    waited: std::time::Duration::ZERO,
                }
                .into())
            }
        }
    } else {
        let coordinator = match &args.wait {
            Some(raw) => {
                let wait = parse_duration(raw).ok_or_else(|| anyhow!("invalid --wait {raw:?}"))?;
                coordinator.with_wait(wait, session.config.merge_poll_interval)
            }
            None => coordinator,
        };
        coordinator.acquire(&request)?
    };
    if args.json {
        print_json(&outcome)?;
    } else {
        match outcome {
            AcquireOutcome::Acquired => println!("acquired {}", request.operation_id),
            AcquireOutcome::AcquiredAfterWait { waited_ms, .. } => {
                println!("acquired {} after {waited_ms}ms", request.operation_id)
            }
            AcquireOutcome::StaleTakeover { previous } => println!(
                "acquired {} (took over stale lock from {})",
                request.operation_id, previous.operation_id
            ),
        }
    }
    Ok(Verdict::Pass)
}

fn run_scope(session: &Session, args: ScopeArgs) -> Result<Verdict> {
    let catalog = session.catalog()?;
    let changes = changed_files(&session.repo, args.range.as_deref());
    let decision = scope(&changes, &catalog)?;
    if args.json {
        print_json(&json!({"changes": changes, "decision": decision}))?;
    } else {
        for check in &decision.checks {
            println!("{check}");
        }
    }
    Ok(Verdict::Pass)
}

fn run_checks(session: &Session, args: RunArgs) -> Result<Verdict> {
    let catalog = session.catalog()?;
    let changes = changed_files(&session.repo, args.range.as_deref());
    let ctx = GateContext::new(
        session.repo.clone(),
        session.paths.clone(),
        session.config.clone(),
    );
    let report = run_gate(&ctx, &catalog, &changes, GateOptions { bypass: args.bypass })?;
    if args.json {
        print_json(&report)?;
    } else {
        for verdict in &report.verdicts {
            let source = match verdict.source {
                VerdictSource::Cache => "cached",
                VerdictSource::Executed => "ran",
            };
            let status = if verdict.timed_out {
                "timeout".to_string()
            } else if verdict.passed() {
                "pass".to_string()
            } else {
                format!("fail ({})", verdict.exit_code)
            };
            println!("{}\t{status}\t{source}", verdict.check);
            if let Some(err) = &verdict.checklist_error {
                println!("  checklist: {err}");
            }
        }
    }
    Ok(if report.passed() {
        Verdict::Pass
    } else {
        Verdict::Fail
    })
}

fn parse_id(raw: &str, kind: IdKind) -> Result<Identifier> {
    Ok(Identifier::parse_kind(raw, kind)?)
}

fn print_id_list(label: &str, ids: &[Identifier]) {
    if ids.is_empty() {
        return;
    }
    let joined: Vec<String> = ids.iter().map(ToString::to_string).collect();
    println!("{label}: {}", joined.join(", "));
}

fn print_json<T: Serialize + ?Sized>(value: &T) -> Result<()> {
    let text = serde_json::to_string_pretty(value).context("serialize output")?;
    println!("{text}");
    Ok(())
}

fn confirm(prompt: &str) -> Result<bool> {
    eprint!("{prompt}");
    std::io::stderr().flush().context("flush prompt")?;
    let mut answer = String::new();
    std::io::stdin()
        .lock()
        .read_line(&mut answer)
        .context("read confirmation")?;
    Ok(matches!(answer.trim().to_ascii_lowercase().as_str(), "y" | "yes"))
}
