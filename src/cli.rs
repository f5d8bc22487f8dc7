//! CLI argument parsing for the verification gate.
//!
//! The CLI is thin: every command maps onto one library operation and prints
//! its result, so the same gate can be driven from other tooling.
use clap::{Args, Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

/// Root CLI entrypoint.
#[derive(Parser, Debug)]
#[command(
    name = "vgate",
    version,
    about = "Verification and concurrency gate: check cache, evidence, registry, merge lock",
    after_help = "Exit codes:\n  0  success or cache hit\n  1  cache miss, failing check, or validation failure\n  2  merge lock contention, timeout, or not the holder\n\nExamples:\n  vgate scope --range main..HEAD\n  vgate run --range main..HEAD --json\n  vgate cache lookup unit-tests src/lib.rs src/cache.rs\n  vgate evidence collect --type code_review --field reviewer=sam --field findings=none\n  vgate registry link REQ-2025W14-001 CL-2025W14-003\n  vgate lock acquire merge-42 --wait 5m",
    subcommand_required = true,
    arg_required_else_help = true
)]
pub struct RootArgs {
    /// Gate store directory (defaults to $VGATE_STORE, then <repo>/.vgate)
    #[arg(long, value_name = "DIR", global = true)]
    pub store: Option<PathBuf>,

    /// Repository root that checks and inputs are resolved against
    #[arg(long, value_name = "DIR", default_value = ".", global = true)]
    pub repo: PathBuf,

    /// Raise the default log level to debug
    #[arg(long, short, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Command,
}

/// Top-level commands.
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Print the content hash of a set of input files
    Hash(HashArgs),
    /// Check result cache
    #[command(subcommand)]
    Cache(CacheCommand),
    /// Evidence store
    #[command(subcommand)]
    Evidence(EvidenceCommand),
    /// Requirement and checklist registry
    #[command(subcommand)]
    Registry(RegistryCommand),
    /// Merge lock
    #[command(subcommand)]
    Lock(LockCommand),
    /// Show which checks a change set requires
    Scope(ScopeArgs),
    /// Run the scoped checks through the cache and record evidence
    Run(RunArgs),
}

#[derive(Args, Debug)]
pub struct HashArgs {
    /// Input files, relative to --repo
    #[arg(required = true, value_name = "FILE")]
    pub files: Vec<String>,
}

#[derive(Subcommand, Debug)]
pub enum CacheCommand {
    /// Look up a cached verdict (exit 0 on hit, 1 on miss)
    Lookup(CacheLookupArgs),
    /// Store a verdict for a check over its inputs
    Store(CacheStoreArgs),
    /// Remove entries whose check name matches a glob
    Invalidate {
        #[arg(value_name = "PATTERN")]
        pattern: String,
    },
    /// Remove expired entries
    Prune,
    /// Show hit and miss counters
    Stats {
        #[arg(long)]
        json: bool,
    },
    /// List index rows
    List {
        #[arg(long)]
        json: bool,
    },
}

#[derive(Args, Debug)]
pub struct CacheLookupArgs {
    pub check: String,

    /// Input files, relative to --repo
    #[arg(value_name = "FILE")]
    pub files: Vec<String>,

    /// Command the verdict was produced by; part of the cache key
    #[arg(long)]
    pub command: Option<String>,

    /// Force a miss
    #[arg(long)]
    pub bypass: bool,

    /// Emit machine-readable JSON output
    #[arg(long)]
    pub json: bool,
}

#[derive(Args, Debug)]
pub struct CacheStoreArgs {
    pub check: String,

    /// Input files, relative to --repo
    #[arg(required = true, value_name = "FILE")]
    pub files: Vec<String>,

    /// Exit code the check produced
    #[arg(long, allow_hyphen_values = true)]
    pub code: i32,

    /// Command that produced the verdict; part of the cache key
    #[arg(long)]
    pub command: Option<String>,

    /// Output sample to keep with the verdict
    #[arg(long, default_value = "", conflicts_with = "output_file")]
    pub output: String,

    /// Read the output sample from a file
    #[arg(long, value_name = "PATH")]
    pub output_file: Option<PathBuf>,

    /// Entry lifetime (e.g. 30m, 24h); defaults to the configured TTL
    #[arg(long, value_name = "DURATION")]
    pub ttl: Option<String>,
}

#[derive(Subcommand, Debug)]
pub enum EvidenceCommand {
    /// Validate fields and persist a new evidence record
    Collect(EvidenceCollectArgs),
    /// Validate an evidence record file
    Validate {
        #[arg(value_name = "PATH")]
        file: PathBuf,
    },
    /// Print a stored record
    Show {
        #[arg(value_name = "ID")]
        id: String,
    },
    /// List stored records
    List {
        #[arg(long)]
        json: bool,
    },
}

#[derive(Args, Debug)]
pub struct EvidenceCollectArgs {
    /// Evidence type (test_result, code_review, command_output, functional_test, manual_check)
    #[arg(long = "type", value_name = "TYPE")]
    pub evidence_type: String,

    /// Field value as key=value; repeatable
    #[arg(long = "field", value_name = "KEY=VALUE")]
    pub fields: Vec<String>,

    /// Artifact payload stored next to the record
    #[arg(long, value_name = "PATH")]
    pub artifact: Option<PathBuf>,

    /// Reporting period for the new identifier
    #[arg(long)]
    pub period: Option<String>,

    #[arg(long)]
    pub json: bool,
}

#[derive(Subcommand, Debug)]
pub enum RegistryCommand {
    /// Assign a fresh identifier without creating an item
    Assign {
        #[arg(value_enum)]
        kind: KindArg,
        #[arg(long)]
        period: Option<String>,
    },
    /// Create a requirement item
    AddRequirement {
        description: String,
        #[arg(long)]
        period: Option<String>,
    },
    /// Create a checklist item, optionally linked to a requirement
    AddItem {
        description: String,
        #[arg(long)]
        period: Option<String>,
        #[arg(long, value_name = "REQ_ID")]
        requirement: Option<String>,
    },
    /// Link a checklist item to its requirement
    Link {
        requirement: String,
        checklist: String,
    },
    /// Show which requirement a checklist item satisfies
    Resolve {
        checklist: String,
        #[arg(long)]
        json: bool,
    },
    /// Change an item's description; links are unaffected
    Describe { id: String, description: String },
    /// Set a requirement's status
    Status {
        id: String,
        #[arg(value_enum)]
        status: StatusArg,
    },
    /// Mark a requirement as replaced by another
    Supersede { old: String, new: String },
    /// Point a checklist item at an evidence record
    Attach { checklist: String, evidence: String },
    /// Complete a checklist item against its evidence
    Complete { checklist: String },
    /// Clear a checklist item's completion
    Reopen { checklist: String },
    /// Summarize orphans, unmapped and incomplete items
    Report {
        #[arg(long)]
        json: bool,
    },
    /// List identifiers referenced by a document outside fenced blocks
    Scan {
        #[arg(value_name = "PATH")]
        file: PathBuf,

        /// Also report lines mentioning this keyword; repeatable
        #[arg(long = "keyword", value_name = "TEXT")]
        keywords: Vec<String>,

        #[arg(long)]
        json: bool,
    },
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, ValueEnum)]
pub enum KindArg {
    Req,
    Cl,
    Evid,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, ValueEnum)]
pub enum StatusArg {
    Open,
    InProgress,
    Done,
}

#[derive(Subcommand, Debug)]
pub enum LockCommand {
    /// Acquire the merge lock for an operation
    Acquire(LockAcquireArgs),
    /// Release the merge lock held by an operation
    Release {
        #[arg(value_name = "OPERATION_ID")]
        operation_id: String,
    },
    /// Show the current holder
    Status {
        #[arg(long)]
        json: bool,
    },
    /// Clear the lock regardless of holder (audited)
    ForceRelease {
        /// Skip the confirmation prompt
        #[arg(long)]
        yes: bool,

        /// Name recorded in the audit log
        #[arg(long)]
        actor: Option<String>,
    },
}

#[derive(Args, Debug)]
pub struct LockAcquireArgs {
    #[arg(value_name = "OPERATION_ID")]
    pub operation_id: String,

    /// Name recorded on the lock
    #[arg(long)]
    pub actor: Option<String>,

    /// Declared operation timeout (staleness is a multiple of this)
    #[arg(long, value_name = "DURATION")]
    pub timeout: Option<String>,

    /// How long to queue for the lock
    #[arg(long, value_name = "DURATION", conflicts_with = "no_wait")]
    pub wait: Option<String>,

    /// Fail immediately if the lock is held
    #[arg(long)]
    pub no_wait: bool,

    #[arg(long)]
    pub json: bool,
}

#[derive(Args, Debug)]
pub struct ScopeArgs {
    /// Revision range passed to git diff; defaults to uncommitted changes
    #[arg(long, value_name = "A..B")]
    pub range: Option<String>,

    #[arg(long)]
    pub json: bool,
}

#[derive(Args, Debug)]
pub struct RunArgs {
    /// Revision range passed to git diff; defaults to uncommitted changes
    #[arg(long, value_name = "A..B")]
    pub range: Option<String>,

    /// Ignore cached verdicts
    #[arg(long)]
    pub bypass: bool,

    #[arg(long)]
    pub json: bool,
}
