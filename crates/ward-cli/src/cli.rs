//! CLI definition and command dispatch for ward.
//!
//! This module defines the command-line interface using `clap` and provides
//! the `run()` function that dispatches commands to the engine.
//!
//! ## Configuration Precedence
//!
//! 1. CLI flags (e.g., `--config`, `--verbose`, `--project`)
//! 2. Environment variables (`WARD_CONFIG`, `WARD_VERBOSE`, `WARD_PROJECT`)
//! 3. Project config (`.ward/config.yaml`) over global config (`~/.ward/config.yaml`)
//! 4. Built-in defaults
//!
//! ## Exit Codes
//!
//! | Code | Meaning |
//! |------|---------|
//! | 0 | Success / write allowed |
//! | 1 | Invalid operation or input |
//! | 2 | Blocked by preflight or the write gate |
//! | 3 | No active run or quick-fix |
//! | 4 | I/O or state persistence failure |
//! | 5 | Verification failed (step can be retried) |
//! | 6 | Retry budget exhausted (abort or force-complete) |
//! | 7 | Stale state needs manual cleanup |

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use serde::Serialize;

use crate::ui::{format, table, ColorMode, MessageType, Progress, ProgressMode, Style};

use ward_core::{
    ErrorKind, GateRequest, KnowledgeFacts, OperationKind, PreflightReport, QuickFixState,
    RunState, StartRunOptions, StepPlan, StepStatus, WardEngine, WardError, Workspace,
};

// ============================================================================
// CLI Definition
// ============================================================================

/// Version string including git commit hash
const VERSION: &str = concat!(env!("CARGO_PKG_VERSION"), " (", env!("GIT_HASH"), ")");

/// ward – guard rails for assistant-driven edits
#[derive(Parser, Debug)]
#[command(name = "ward")]
#[command(author, version = VERSION, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Enable verbose output (debug logging)
    #[arg(short, long, global = true, env = "WARD_VERBOSE")]
    pub verbose: bool,

    /// Suppress informational messages and spinners
    #[arg(short, long, global = true, env = "WARD_QUIET")]
    pub quiet: bool,

    /// Path to configuration file (default: ~/.ward/config.yaml)
    #[arg(long, global = true, env = "WARD_CONFIG")]
    pub config: Option<PathBuf>,

    /// Operate on a registered project instead of the current directory
    #[arg(short, long, global = true, env = "WARD_PROJECT")]
    pub project: Option<String>,

    /// Color output mode
    #[arg(long, global = true, env = "WARD_COLOR", value_enum, default_value_t = ColorMode::Auto)]
    pub color: ColorMode,

    #[command(subcommand)]
    pub command: Command,
}

/// Available commands
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Create the .ward state directory for the current project
    #[command(after_help = r#"EXAMPLES:
    # Initialize ward in the current project
    ward init
"#)]
    Init,

    /// Show active run, quick-fix and knowledge health
    #[command(after_help = r#"EXAMPLES:
    ward status
    ward status --json | jq '.run.steps'
"#)]
    Status {
        /// Output in JSON format
        #[arg(long)]
        json: bool,
    },

    /// Check whether files are ready to be edited
    #[command(after_help = r#"EXAMPLES:
    # Can these files be modified?
    ward preflight src/lib.rs src/util.rs

    # Strict refactor: every file needs fresh knowledge
    ward preflight src/lib.rs --refactor --strict

    # Exit code 2 when blocked
    ward preflight a.py --refactor --strict || echo blocked
"#)]
    Preflight {
        /// Target files
        #[arg(required = true)]
        files: Vec<String>,

        /// Check for a refactor instead of a plain modify
        #[arg(long)]
        refactor: bool,

        /// Require knowledge for every file and treat staleness as blocking
        #[arg(long)]
        strict: bool,

        /// Output in JSON format
        #[arg(long)]
        json: bool,
    },

    /// Record knowledge about a file (new version when its content changed)
    #[command(after_help = r#"EXAMPLES:
    ward learn src/auth.rs --summary "Session tokens" --purpose "Login flow" \
        --export "issue_token=Creates a signed token" --caveat "Clock skew matters"

    # Facts as JSON: {"summary", "purpose", "exports": {..}, "caveats": [..]}
    ward learn src/auth.rs --facts facts.json
"#)]
    Learn {
        /// File to learn
        path: String,

        /// Short summary of the file
        #[arg(long, conflicts_with = "facts")]
        summary: Option<String>,

        /// Why the file exists
        #[arg(long, conflicts_with = "facts")]
        purpose: Option<String>,

        /// Exported symbol, as NAME=DESCRIPTION (repeatable)
        #[arg(long = "export", value_name = "NAME=DESC", conflicts_with = "facts")]
        exports: Vec<String>,

        /// Caveat when editing the file (repeatable)
        #[arg(long = "caveat", value_name = "TEXT", conflicts_with = "facts")]
        caveats: Vec<String>,

        /// Read facts from a JSON file
        #[arg(long, value_name = "FILE")]
        facts: Option<PathBuf>,
    },

    /// Show stored knowledge for a file
    #[command(after_help = r#"EXAMPLES:
    ward recall src/auth.rs
    ward recall src/auth.rs --json
"#)]
    Recall {
        path: String,

        /// Output in JSON format
        #[arg(long)]
        json: bool,
    },

    /// Report whether learned knowledge is still fresh
    #[command(after_help = r#"EXAMPLES:
    ward stale src/auth.rs src/db.rs
"#)]
    Stale {
        #[arg(required = true)]
        paths: Vec<String>,

        /// Output in JSON format
        #[arg(long)]
        json: bool,
    },

    /// List every learned file
    Knowledge {
        /// Output in JSON format
        #[arg(long)]
        json: bool,
    },

    /// Delete the knowledge record of a file
    Forget { path: String },

    /// Multi-step runs with verification and rollback
    Run {
        #[command(subcommand)]
        action: RunAction,
    },

    /// Single-file quick-fixes with exact undo
    #[command(name = "quickfix")]
    QuickFix {
        #[command(subcommand)]
        action: QuickFixAction,
    },

    /// Decide a host write request (JSON on stdin or flags)
    #[command(after_help = r#"EXAMPLES:
    # Host protocol: request on stdin, decision on stdout
    echo '{"path":"src/lib.rs","actionId":"w-17"}' | ward gate

    # Same check from a shell
    ward gate --path src/lib.rs

Exit status is 0 on allow and 2 on block.
"#)]
    Gate {
        /// File about to be written (reads the JSON request from stdin when omitted)
        #[arg(long)]
        path: Option<String>,

        /// Host tool action identifier
        #[arg(long)]
        action_id: Option<String>,
    },

    /// Remove snapshots nothing references any more
    #[command(after_help = r#"EXAMPLES:
    ward gc --dry-run
    ward gc --grace-secs 0
"#)]
    Gc {
        /// Keep unreferenced snapshots younger than this (default: snapshotGraceSecs)
        #[arg(long)]
        grace_secs: Option<u64>,

        /// Report what would be removed without deleting
        #[arg(long)]
        dry_run: bool,

        /// Output in JSON format
        #[arg(long)]
        json: bool,
    },

    /// Diagnose abandoned, unreadable or dangling state
    Doctor {
        /// Output in JSON format
        #[arg(long)]
        json: bool,
    },

    /// Archive abandoned or unreadable state (no rollback)
    #[command(after_help = r#"EXAMPLES:
    # Only state whose heartbeat expired
    ward clear-stale

    # Drop whatever is active, without restoring files
    ward clear-stale --force
"#)]
    ClearStale {
        /// Also clear live state
        #[arg(long)]
        force: bool,
    },

    /// Register the current project under a name
    Register {
        name: String,

        /// Project root (default: the resolved project)
        #[arg(long)]
        root: Option<PathBuf>,

        /// Declared language
        #[arg(long)]
        language: Option<String>,
    },

    /// List registered projects
    Projects {
        /// Output in JSON format
        #[arg(long)]
        json: bool,
    },
}

/// Run subcommands
#[derive(Subcommand, Debug)]
pub enum RunAction {
    /// Start a run with a plan
    #[command(after_help = r#"EXAMPLES:
    ward run start --goal "Extract retry helper" \
        --step "add helper:src/retry.rs" \
        --step "use helper:src/client.rs,src/server.rs"

    # Plan file: [{"description": "..", "files": [".."]}]
    ward run start --goal "Rename config" --plan plan.json --refactor --strict
"#)]
    Start {
        /// What the run is meant to achieve
        #[arg(long)]
        goal: String,

        /// Step as "description:file1,file2" (repeatable, in order)
        #[arg(long = "step", value_name = "DESC:FILES", conflicts_with = "plan")]
        steps: Vec<String>,

        /// Read the plan from a JSON file
        #[arg(long, value_name = "FILE")]
        plan: Option<PathBuf>,

        /// Failed verifications allowed per step before human decision is required
        #[arg(long)]
        retry_budget: Option<u32>,

        /// Start without running preflight
        #[arg(long)]
        skip_preflight: bool,

        /// Preflight in strict mode
        #[arg(long)]
        strict: bool,

        /// Preflight as a refactor
        #[arg(long)]
        refactor: bool,

        /// Output in JSON format
        #[arg(long)]
        json: bool,
    },

    /// Move a step (1-based) into progress
    Begin { step: usize },

    /// Replace a file's content through ward
    #[command(after_help = r#"EXAMPLES:
    ward run edit src/retry.rs --expected old.rs --new new.rs -m "add backoff"
    ward run edit src/fresh.rs --create --new fresh.rs
"#)]
    Edit {
        path: String,

        /// File holding the new content
        #[arg(long, value_name = "FILE")]
        new: PathBuf,

        /// File holding the content the target is expected to have now
        #[arg(long, value_name = "FILE", required_unless_present = "create", conflicts_with = "create")]
        expected: Option<PathBuf>,

        /// The target is expected not to exist yet
        #[arg(long)]
        create: bool,

        /// Edit description
        #[arg(short, long, default_value = "")]
        message: String,
    },

    /// Record a write the host already performed
    Record {
        path: String,

        /// Edit description
        #[arg(short, long, default_value = "")]
        message: String,
    },

    /// Finish the current step and verify it
    Complete {
        /// Files touched by the step (default: its targets and edited files)
        #[arg(long = "file")]
        files: Vec<String>,

        /// Notes for the step
        #[arg(long)]
        notes: Option<String>,

        /// Output in JSON format
        #[arg(long)]
        json: bool,
    },

    /// Mark a step (1-based) done without verification
    ForceComplete {
        step: usize,

        /// Why verification is being skipped
        #[arg(long, required = true)]
        note: String,
    },

    /// Roll back every change of the run and archive it
    Abort {
        #[arg(long, required = true)]
        reason: String,
    },

    /// Show the active run (or archived runs)
    Show {
        /// List archived runs instead
        #[arg(long)]
        history: bool,

        /// Output in JSON format
        #[arg(long)]
        json: bool,
    },

    /// Refresh the liveness timestamp of active state
    Heartbeat,
}

/// Quick-fix subcommands
#[derive(Subcommand, Debug)]
pub enum QuickFixAction {
    /// Snapshot a file and allow writes to it
    Start { path: String },
    /// Keep the edit
    Done,
    /// Restore the original bytes
    Cancel,
}

// ============================================================================
// Run function
// ============================================================================

/// Exit code for an error kind.
fn exit_code_for(kind: ErrorKind) -> ExitCode {
    ExitCode::from(match kind {
        ErrorKind::User => 1,
        ErrorKind::Blocked => 2,
        ErrorKind::NoActiveState => 3,
        ErrorKind::Io => 4,
        ErrorKind::Verification => 5,
        ErrorKind::RetryBudget => 6,
        ErrorKind::StaleState => 7,
    })
}

fn hint_for(err: &WardError) -> Option<&'static str> {
    match err {
        WardError::NotInitialized => Some("Run `ward init` in the project root"),
        WardError::NoActiveRun => Some("Start one with `ward run start`"),
        WardError::NoActiveQuickFix => Some("Start one with `ward quickfix start <path>`"),
        WardError::VerificationFailed { .. } => {
            Some("Fix the failure, then retry with `ward run begin <step>` and `ward run complete`")
        }
        WardError::RetryBudgetExhausted { .. } => {
            Some("Decide: `ward run abort --reason ..` or `ward run force-complete <step> --note ..`")
        }
        WardError::StaleState(_) => Some("Inspect with `ward doctor`, then `ward clear-stale`"),
        WardError::LockTimeout(_) => Some("Wait for the other ward process or raise lockTimeoutMs"),
        _ => None,
    }
}

/// Everything a handler needs.
struct Ctx<'a> {
    style: &'a Style,
    engine: &'a WardEngine,
    workspace: Workspace,
    /// Directory relative paths are resolved against.
    base_dir: PathBuf,
    quiet: bool,
}

impl Ctx<'_> {
    /// Turn a user-supplied path into a project-relative key.
    fn key(&self, raw: &str) -> Result<String, WardError> {
        let path = Path::new(raw);
        let abs = if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.base_dir.join(path)
        };
        self.workspace.relative_key(&abs)
    }

    fn keys(&self, raw: &[String]) -> Result<Vec<String>, WardError> {
        raw.iter().map(|r| self.key(r)).collect()
    }

    fn info(&self, text: &str) {
        if !self.quiet {
            println!("{}", self.style.message(MessageType::Info, text));
        }
    }
}

/// Run the CLI application.
pub fn run() -> ExitCode {
    let cli = Cli::parse();

    // Logs go to stderr: stdout carries command output and the gate protocol.
    let log_level = if cli.verbose { "debug" } else { "warn" };
    let filter = format!("ward_core={},ward_cli={}", log_level, log_level);

    tracing_subscriber::fmt()
        .with_env_filter(&filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let style = Style::new(cli.color);

    let engine = match &cli.config {
        Some(config_path) => WardEngine::with_config(config_path),
        None => WardEngine::with_defaults(),
    };
    let engine = match engine {
        Ok(engine) => engine,
        Err(e) => {
            let hint = match &cli.config {
                Some(path) => format!("Check your config at {}", path.display()),
                None => "Check your global config at ~/.ward/config.yaml".to_string(),
            };
            eprintln!(
                "{}",
                style.error_with_context("Failed to load configuration", Some(&e.to_string()), Some(&hint))
            );
            return exit_code_for(e.kind());
        }
    };

    let cwd = match std::env::current_dir() {
        Ok(dir) => dir,
        Err(e) => {
            eprintln!("{}", style.message(MessageType::Err, &format!("Cannot read current directory: {}", e)));
            return exit_code_for(ErrorKind::Io);
        }
    };

    let workspace = match &cli.project {
        Some(name) => engine
            .registry()
            .and_then(|registry| engine.resolve_project(&registry, name)),
        None => engine.resolve_workspace(&cwd),
    };
    let workspace = match workspace {
        Ok(ws) => ws,
        Err(e) => {
            eprintln!(
                "{}",
                style.message(MessageType::Err, &format!("Failed to resolve project: {}", e))
            );
            return exit_code_for(e.kind());
        }
    };

    let base_dir = if cli.project.is_some() {
        workspace.root().to_path_buf()
    } else {
        cwd
    };
    let mut ctx = Ctx {
        style: &style,
        engine: &engine,
        workspace,
        base_dir,
        quiet: cli.quiet,
    };

    let result = match cli.command {
        Command::Init => handle_init(&mut ctx),
        Command::Status { json } => handle_status(&ctx, json),
        Command::Preflight {
            files,
            refactor,
            strict,
            json,
        } => handle_preflight(&ctx, &files, refactor, strict, json),
        Command::Learn {
            path,
            summary,
            purpose,
            exports,
            caveats,
            facts,
        } => handle_learn(&ctx, &path, summary, purpose, &exports, caveats, facts),
        Command::Recall { path, json } => handle_recall(&ctx, &path, json),
        Command::Stale { paths, json } => handle_stale(&ctx, &paths, json),
        Command::Knowledge { json } => handle_knowledge(&ctx, json),
        Command::Forget { path } => handle_forget(&ctx, &path),
        Command::Run { action } => handle_run(&ctx, action, cli.quiet),
        Command::QuickFix { action } => handle_quickfix(&ctx, action),
        Command::Gate { path, action_id } => handle_gate(&ctx, path, action_id),
        Command::Gc {
            grace_secs,
            dry_run,
            json,
        } => handle_gc(&ctx, grace_secs, dry_run, json),
        Command::Doctor { json } => handle_doctor(&ctx, json),
        Command::ClearStale { force } => handle_clear_stale(&ctx, force),
        Command::Register { name, root, language } => handle_register(&ctx, &name, root, language),
        Command::Projects { json } => handle_projects(&ctx, json),
    };

    match result {
        Ok(code) => code,
        Err(e) => {
            let hint = hint_for(&e);
            eprintln!("{}", style.error_with_context(&e.to_string(), None, hint));
            exit_code_for(e.kind())
        }
    }
}

type CmdResult = Result<ExitCode, WardError>;

fn print_json<T: Serialize>(value: &T) -> Result<(), WardError> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn read_file(path: &Path) -> Result<Vec<u8>, WardError> {
    fs::read(path).map_err(|e| WardError::PathNotFound(format!("{}: {}", path.display(), e)))
}

// ============================================================================
// Command handlers
// ============================================================================

fn handle_init(ctx: &mut Ctx<'_>) -> CmdResult {
    let created = ctx.engine.init_workspace(&mut ctx.workspace)?;
    let root = ctx.workspace.root().display().to_string();
    if created {
        println!(
            "{}",
            ctx.style.message(MessageType::Ok, &format!("Initialized ward at {}", root))
        );
        if !ctx.quiet {
            println!();
            println!("{}", ctx.style.message(MessageType::Hint, "Next steps:"));
            println!("  1. Learn key files:  ward learn <path> --summary ..");
            println!("  2. Check readiness:  ward preflight <files..>");
            println!("  3. Start a run:      ward run start --goal .. --step \"desc:file\"");
        }
    } else {
        ctx.info(&format!("ward already initialized at {}", root));
    }
    Ok(ExitCode::SUCCESS)
}

fn handle_status(ctx: &Ctx<'_>, json: bool) -> CmdResult {
    let status = ctx.engine.status(&ctx.workspace)?;
    if json {
        print_json(&status)?;
        return Ok(ExitCode::SUCCESS);
    }

    let style = ctx.style;
    println!("{}", style.section("STATUS"));
    println!();
    println!("  {}", style.key_value("Project", &status.root.display().to_string()));
    if !status.initialized {
        println!("  {}", style.key_value("Initialized", "no (run `ward init`)"));
        return Ok(ExitCode::SUCCESS);
    }

    match &status.run {
        Some(run) => {
            let done = run.steps.iter().filter(|s| s.status == StepStatus::Done).count();
            let mut line = format!(
                "{} \"{}\" ({}/{} steps done)",
                style.short_id(run.id.as_str()),
                run.goal,
                done,
                run.steps.len()
            );
            if status.run_abandoned {
                line.push_str(" [abandoned]");
            }
            println!("  {}", style.key_value("Run", &line));
            if let Some(idx) = run.current_step() {
                println!(
                    "  {}",
                    style.key_value(
                        "Current",
                        &format!("{}: {}", format::step_label(idx), run.steps[idx].description)
                    )
                );
            }
        }
        None => println!("  {}", style.key_value("Run", "(none)")),
    }

    match &status.quickfix {
        Some(fix) => {
            let mut line = format!(
                "{} (started {})",
                style.file_path(&fix.path),
                format::format_relative_time(fix.started_at)
            );
            if status.quickfix_abandoned {
                line.push_str(" [abandoned]");
            }
            println!("  {}", style.key_value("Quick-fix", &line));
        }
        None => println!("  {}", style.key_value("Quick-fix", "(none)")),
    }

    println!(
        "  {}",
        style.key_value(
            "Knowledge",
            &format!("{} files, {} stale", status.knowledge_files, status.stale_files.len())
        )
    );
    for path in &status.stale_files {
        println!("{}", style.list_item("-", &format!("{} (stale)", path)));
    }

    if !status.problems.is_empty() {
        println!();
        for problem in &status.problems {
            println!("{}", style.message(MessageType::Warn, problem));
        }
        println!("{}", style.message(MessageType::Hint, "Run `ward doctor` for details"));
    }
    Ok(ExitCode::SUCCESS)
}

fn print_preflight(style: &Style, report: &PreflightReport) {
    if report.ready {
        println!(
            "{}",
            style.message(
                MessageType::Ok,
                &format!("Ready to {} {} file(s)", report.operation, report.files.len())
            )
        );
    } else {
        println!(
            "{}",
            style.message(
                MessageType::Block,
                &format!("Not ready: {} blocker(s)", report.blockers.len())
            )
        );
        for blocker in &report.blockers {
            println!("{}", style.list_item("-", blocker));
        }
    }
    for warning in &report.warnings {
        println!("{}", style.message(MessageType::Warn, warning));
    }
    if !report.impact_set.is_empty() {
        println!(
            "{}",
            style.message_detail("Impact", &report.impact_set.join(", "))
        );
    }
}

fn handle_preflight(ctx: &Ctx<'_>, files: &[String], refactor: bool, strict: bool, json: bool) -> CmdResult {
    let keys = ctx.keys(files)?;
    let operation = if refactor {
        OperationKind::Refactor
    } else {
        OperationKind::Modify
    };
    let report = ctx.engine.preflight(&ctx.workspace, &keys, operation, strict)?;

    if json {
        print_json(&report)?;
    } else {
        print_preflight(ctx.style, &report);
    }

    Ok(if report.ready {
        ExitCode::SUCCESS
    } else {
        exit_code_for(ErrorKind::Blocked)
    })
}

fn handle_learn(
    ctx: &Ctx<'_>,
    path: &str,
    summary: Option<String>,
    purpose: Option<String>,
    exports: &[String],
    caveats: Vec<String>,
    facts_file: Option<PathBuf>,
) -> CmdResult {
    let key = ctx.key(path)?;

    let facts = match facts_file {
        Some(file) => {
            let raw = read_file(&file)?;
            serde_json::from_slice::<KnowledgeFacts>(&raw)?
        }
        None => {
            let mut parsed = BTreeMap::new();
            for export in exports {
                let (name, desc) = export.split_once('=').ok_or_else(|| {
                    WardError::InvalidArgument(format!(
                        "--export expects NAME=DESCRIPTION, got `{}`",
                        export
                    ))
                })?;
                parsed.insert(name.trim().to_string(), desc.trim().to_string());
            }
            KnowledgeFacts {
                summary: summary.unwrap_or_default(),
                purpose: purpose.unwrap_or_default(),
                exports: parsed,
                caveats,
            }
        }
    };

    let outcome = ctx.engine.learn(&ctx.workspace, &key, facts)?;
    let version = outcome.record.current_version();
    let text = if outcome.appended {
        format!("Learned {} (v{})", ctx.style.file_path(&key), version)
    } else {
        format!("Updated facts for {} (v{}, content unchanged)", ctx.style.file_path(&key), version)
    };
    println!("{}", ctx.style.message(MessageType::Ok, &text));
    Ok(ExitCode::SUCCESS)
}

fn handle_recall(ctx: &Ctx<'_>, path: &str, json: bool) -> CmdResult {
    let key = ctx.key(path)?;
    let (record, freshness) = ctx.engine.recall(&ctx.workspace, &key)?;

    if json {
        #[derive(Serialize)]
        struct Recall<'a> {
            freshness: ward_core::Freshness,
            #[serde(flatten)]
            record: &'a ward_core::KnowledgeRecord,
        }
        print_json(&Recall {
            freshness,
            record: &record,
        })?;
        return Ok(ExitCode::SUCCESS);
    }

    let style = ctx.style;
    println!("{}", style.section(&record.path));
    println!();
    println!(
        "  {}",
        style.key_value(
            "Version",
            &format!("v{} ({})", record.current_version(), style.freshness(freshness))
        )
    );
    if let Some(latest) = record.latest() {
        println!(
            "  {}",
            style.key_value("Learned", &format::format_relative_time(latest.created_at))
        );
        if let Some(vcs) = &latest.vcs_ref {
            println!("  {}", style.key_value("Revision", &style.short_id(vcs)));
        }
    }
    if !record.facts.summary.is_empty() {
        println!("  {}", style.key_value("Summary", &record.facts.summary));
    }
    if !record.facts.purpose.is_empty() {
        println!("  {}", style.key_value("Purpose", &record.facts.purpose));
    }
    if !record.facts.exports.is_empty() {
        println!("  Exports:");
        for (name, desc) in &record.facts.exports {
            println!("{}", style.list_item("+", &format!("{}: {}", name, desc)));
        }
    }
    if !record.facts.caveats.is_empty() {
        println!("  Caveats:");
        for caveat in &record.facts.caveats {
            println!("{}", style.list_item("!", caveat));
        }
    }
    if let Some(module) = &record.module {
        println!(
            "  {}",
            style.key_value(
                "Module",
                &format!(
                    "{} lines, interfaces: {}",
                    module.line_count,
                    if module.interfaces.is_empty() {
                        "-".to_string()
                    } else {
                        module.interfaces.join(", ")
                    }
                )
            )
        );
    }
    if freshness.is_stale() {
        println!();
        println!(
            "{}",
            style.message(
                MessageType::Warn,
                &format!("File changed since it was learned; run `ward learn {}`", record.path)
            )
        );
    }
    Ok(ExitCode::SUCCESS)
}

fn handle_stale(ctx: &Ctx<'_>, paths: &[String], json: bool) -> CmdResult {
    let keys = ctx.keys(paths)?;
    let results = ctx.engine.stale(&ctx.workspace, &keys)?;

    if json {
        let map: BTreeMap<&str, Option<ward_core::Freshness>> =
            results.iter().map(|(k, f)| (k.as_str(), *f)).collect();
        print_json(&map)?;
        return Ok(ExitCode::SUCCESS);
    }

    for (key, freshness) in &results {
        let state = match freshness {
            Some(f) => ctx.style.freshness(*f),
            None => "not learned".to_string(),
        };
        println!("{}  {}", ctx.style.file_path(key), state);
    }
    Ok(ExitCode::SUCCESS)
}

fn handle_knowledge(ctx: &Ctx<'_>, json: bool) -> CmdResult {
    let records = ctx.engine.knowledge_list(&ctx.workspace)?;
    if json {
        #[derive(Serialize)]
        struct Entry<'a> {
            path: &'a str,
            version: u32,
            freshness: ward_core::Freshness,
        }
        let entries: Vec<Entry<'_>> = records
            .iter()
            .map(|(r, f)| Entry {
                path: &r.path,
                version: r.current_version(),
                freshness: *f,
            })
            .collect();
        print_json(&entries)?;
    } else if records.is_empty() {
        ctx.info("No learned files yet. Use `ward learn <path>`.");
    } else {
        println!("{}", table::render_knowledge_table(ctx.style, &records));
    }
    Ok(ExitCode::SUCCESS)
}

fn handle_forget(ctx: &Ctx<'_>, path: &str) -> CmdResult {
    let key = ctx.key(path)?;
    if ctx.engine.forget(&ctx.workspace, &key)? {
        println!("{}", ctx.style.message(MessageType::Ok, &format!("Forgot {}", key)));
        Ok(ExitCode::SUCCESS)
    } else {
        Err(WardError::KnowledgeNotFound(key))
    }
}

// ----------------------------------------------------------------------------
// Runs
// ----------------------------------------------------------------------------

/// Parse `description:file1,file2` (split on the last `:`).
fn parse_step(ctx: &Ctx<'_>, raw: &str) -> Result<StepPlan, WardError> {
    let (description, files) = raw.rsplit_once(':').ok_or_else(|| {
        WardError::InvalidArgument(format!(
            "--step expects \"description:file1,file2\", got `{}`",
            raw
        ))
    })?;
    let files = files
        .split(',')
        .map(str::trim)
        .filter(|f| !f.is_empty())
        .map(|f| ctx.key(f))
        .collect::<Result<Vec<_>, _>>()?;
    Ok(StepPlan {
        description: description.trim().to_string(),
        files,
    })
}

fn load_plan(ctx: &Ctx<'_>, file: &Path) -> Result<Vec<StepPlan>, WardError> {
    let raw = read_file(file)?;
    let plan: Vec<StepPlan> = serde_json::from_slice(&raw)?;
    // Plan file paths are project-relative.
    let root = ctx.workspace.root();
    plan.into_iter()
        .map(|step| {
            let files = step
                .files
                .iter()
                .map(|f| ctx.workspace.relative_key(&root.join(f)))
                .collect::<Result<Vec<_>, _>>()?;
            Ok(StepPlan {
                description: step.description,
                files,
            })
        })
        .collect()
}

/// 1-based step number from the CLI to a 0-based index.
fn step_index(step: usize) -> Result<usize, WardError> {
    step.checked_sub(1)
        .ok_or_else(|| WardError::InvalidArgument("Steps are numbered from 1.".to_string()))
}

fn print_run(style: &Style, run: &RunState) {
    println!(
        "{}",
        style.section(&format!("RUN {} ({})", style.short_id(run.id.as_str()), run.status))
    );
    println!();
    println!("  {}", style.key_value("Goal", &run.goal));
    println!(
        "  {}",
        style.key_value(
            "Edits",
            &format!("{} recorded, {} files touched", run.edits.len(), run.touched.len())
        )
    );
    println!("  {}", style.key_value("Retry budget", &run.retry_budget.to_string()));
    println!(
        "  {}",
        style.key_value("Heartbeat", &format::format_relative_time(run.heartbeat_at))
    );
    if let Some(verification) = &run.last_verification {
        println!(
            "  {}",
            style.key_value(
                "Last check",
                &format!(
                    "{} {}",
                    format::step_label(verification.step),
                    if verification.passed { "passed" } else { "failed" }
                )
            )
        );
    }
    println!();
    println!("{}", table::render_steps_table(style, &run.steps));
}

fn handle_run(ctx: &Ctx<'_>, action: RunAction, quiet: bool) -> CmdResult {
    let style = ctx.style;
    let engine = ctx.engine;
    let ws = &ctx.workspace;

    match action {
        RunAction::Start {
            goal,
            steps,
            plan,
            retry_budget,
            skip_preflight,
            strict,
            refactor,
            json,
        } => {
            let plan = match plan {
                Some(file) => load_plan(ctx, &file)?,
                None => steps
                    .iter()
                    .map(|s| parse_step(ctx, s))
                    .collect::<Result<Vec<_>, _>>()?,
            };
            let options = StartRunOptions {
                retry_budget,
                skip_preflight,
                strict,
                refactor,
            };
            let run = engine.start_run(ws, &goal, plan, &options)?;
            if json {
                print_json(&run)?;
            } else {
                println!(
                    "{}",
                    style.message(
                        MessageType::Ok,
                        &format!(
                            "Started run {} with {} step(s)",
                            style.short_id(run.id.as_str()),
                            run.steps.len()
                        )
                    )
                );
                ctx.info("Begin the first step with `ward run begin 1`");
            }
        }

        RunAction::Begin { step } => {
            let idx = step_index(step)?;
            let run = engine.begin_step(ws, idx)?;
            println!(
                "{}",
                style.message(
                    MessageType::Ok,
                    &format!("Began {}: {}", format::step_label(idx), run.steps[idx].description)
                )
            );
            println!("{}", style.message_detail("Files", &run.steps[idx].files.join(", ")));
        }

        RunAction::Edit {
            path,
            new,
            expected,
            create,
            message,
        } => {
            let key = ctx.key(&path)?;
            let new_content = read_file(&new)?;
            let expected = match (&expected, create) {
                (_, true) => None,
                (Some(file), false) => Some(read_file(file)?),
                (None, false) => {
                    return Err(WardError::InvalidArgument(
                        "Pass --expected FILE or --create.".to_string(),
                    ))
                }
            };
            let record = engine.edit_file(ws, &key, expected.as_deref(), &new_content, &message)?;
            println!(
                "{}",
                style.message(
                    MessageType::Ok,
                    &format!("Edit #{} applied to {}", record.seq, style.file_path(&key))
                )
            );
        }

        RunAction::Record { path, message } => {
            let key = ctx.key(&path)?;
            let record = engine.record_write(ws, &key, &message)?;
            println!(
                "{}",
                style.message(
                    MessageType::Ok,
                    &format!("Recorded write #{} on {}", record.seq, style.file_path(&key))
                )
            );
        }

        RunAction::Complete { files, notes, json } => {
            let keys = ctx.keys(&files)?;
            let progress = Progress::spinner("Verifying step...", ProgressMode::detect(quiet, json));
            let result = engine.complete_step(ws, &keys, notes.as_deref());
            tracing::debug!("Verification finished in {:?}", progress.elapsed());
            progress.finish_clear();
            let completion = result?;

            if json {
                #[derive(Serialize)]
                #[serde(rename_all = "camelCase")]
                struct Completion<'a> {
                    step: usize,
                    passed: bool,
                    details: &'a str,
                    attempts: u32,
                    next_step: Option<usize>,
                    run_completed: bool,
                }
                print_json(&Completion {
                    step: completion.step + 1,
                    passed: completion.passed,
                    details: &completion.details,
                    attempts: completion.attempts,
                    next_step: completion.next_step.map(|i| i + 1),
                    run_completed: completion.run_completed,
                })?;
            } else if completion.passed {
                println!(
                    "{}",
                    style.message(
                        MessageType::Ok,
                        &format!("{} verified", format::step_label(completion.step))
                    )
                );
                if completion.run_completed {
                    println!("{}", style.message(MessageType::Ok, "All steps done; run completed and archived"));
                } else if let Some(next) = completion.next_step {
                    ctx.info(&format!("Now on {}", format::step_label(next)));
                }
            }

            if !completion.passed {
                tracing::debug!("step {} failed attempt {}", completion.step + 1, completion.attempts);
                return Err(WardError::VerificationFailed {
                    step: completion.step + 1,
                    details: completion.details,
                });
            }
        }

        RunAction::ForceComplete { step, note } => {
            let idx = step_index(step)?;
            let run = engine.force_complete_step(ws, idx, &note)?;
            println!(
                "{}",
                style.message(
                    MessageType::Warn,
                    &format!("{} marked done without verification", format::step_label(idx))
                )
            );
            if run.is_complete() {
                println!("{}", style.message(MessageType::Ok, "All steps done; run completed and archived"));
            }
        }

        RunAction::Abort { reason } => {
            let summary = engine.abort_run(ws, &reason)?;
            println!(
                "{}",
                style.message(
                    MessageType::Ok,
                    &format!(
                        "Aborted run {}; {} restore(s) applied",
                        style.short_id(summary.run.id.as_str()),
                        summary.restored.len()
                    )
                )
            );
            if !quiet {
                let mut seen = std::collections::BTreeSet::new();
                for path in summary.restored.iter().filter(|p| seen.insert(p.as_str())) {
                    println!("{}", style.list_item("-", path));
                }
            }
        }

        RunAction::Show { history, json } => {
            if history {
                let runs = engine.run_history(ws)?;
                if json {
                    print_json(&runs)?;
                } else if runs.is_empty() {
                    ctx.info("No archived runs.");
                } else {
                    for run in &runs {
                        println!(
                            "{}  {:<10} {}  {}",
                            style.short_id(run.id.as_str()),
                            run.status.to_string(),
                            format::format_relative_time(run.created_at),
                            run.goal
                        );
                    }
                }
            } else {
                let run = engine.show_run(ws)?;
                if json {
                    print_json(&run)?;
                } else {
                    print_run(style, &run);
                }
            }
        }

        RunAction::Heartbeat => {
            let (run, quickfix) = engine.heartbeat(ws)?;
            let what = match (run, quickfix) {
                (true, true) => "run and quick-fix",
                (true, false) => "run",
                _ => "quick-fix",
            };
            ctx.info(&format!("Heartbeat recorded for {}", what));
        }
    }

    Ok(ExitCode::SUCCESS)
}

// ----------------------------------------------------------------------------
// Quick-fix
// ----------------------------------------------------------------------------

fn handle_quickfix(ctx: &Ctx<'_>, action: QuickFixAction) -> CmdResult {
    let style = ctx.style;
    let fix: QuickFixState = match action {
        QuickFixAction::Start { path } => {
            let key = ctx.key(&path)?;
            let fix = ctx.engine.start_quickfix(&ctx.workspace, &key)?;
            println!(
                "{}",
                style.message(
                    MessageType::Ok,
                    &format!("Quick-fix started on {}", style.file_path(&fix.path))
                )
            );
            fix
        }
        QuickFixAction::Done => {
            let fix = ctx.engine.quickfix_done(&ctx.workspace)?;
            println!(
                "{}",
                style.message(MessageType::Ok, &format!("Quick-fix on {} done", style.file_path(&fix.path)))
            );
            fix
        }
        QuickFixAction::Cancel => {
            let fix = ctx.engine.quickfix_cancel(&ctx.workspace)?;
            println!(
                "{}",
                style.message(
                    MessageType::Ok,
                    &format!("Quick-fix cancelled; {} restored", style.file_path(&fix.path))
                )
            );
            fix
        }
    };
    tracing::debug!("quick-fix state: {:?}", fix.status);
    Ok(ExitCode::SUCCESS)
}

// ----------------------------------------------------------------------------
// Gate
// ----------------------------------------------------------------------------

fn read_gate_request(path: Option<String>, action_id: Option<String>) -> Result<GateRequest, WardError> {
    match path {
        Some(path) => Ok(GateRequest { path, action_id }),
        None => {
            let input = std::io::read_to_string(std::io::stdin())?;
            serde_json::from_str::<GateRequest>(input.trim())
                .map_err(|e| WardError::InvalidArgument(format!("Invalid gate request: {}", e)))
        }
    }
}

fn handle_gate(ctx: &Ctx<'_>, path: Option<String>, action_id: Option<String>) -> CmdResult {
    let decision = read_gate_request(path, action_id).and_then(|mut request| {
        if Path::new(&request.path).is_relative() {
            request.path = ctx.base_dir.join(&request.path).display().to_string();
        }
        ctx.engine.gate(&ctx.workspace, &request)
    });

    match decision {
        Ok(response) => {
            println!("{}", serde_json::to_string(&response)?);
            Ok(if response.is_allowed() {
                ExitCode::SUCCESS
            } else {
                exit_code_for(ErrorKind::Blocked)
            })
        }
        Err(e) => {
            // Fail closed: the host still gets a decision.
            let response = ward_core::GateResponse::block(format!("ward error: {}", e));
            println!("{}", serde_json::to_string(&response)?);
            Err(e)
        }
    }
}

// ----------------------------------------------------------------------------
// Maintenance
// ----------------------------------------------------------------------------

fn handle_gc(ctx: &Ctx<'_>, grace_secs: Option<u64>, dry_run: bool, json: bool) -> CmdResult {
    let grace = grace_secs.map(std::time::Duration::from_secs);
    let summary = ctx.engine.gc(&ctx.workspace, grace, dry_run)?;
    if json {
        print_json(&summary)?;
    } else {
        let verb = if dry_run { "Would remove" } else { "Removed" };
        println!(
            "{}",
            ctx.style.message(
                MessageType::Ok,
                &format!(
                    "{} {} of {} snapshot(s) ({})",
                    verb,
                    summary.removed,
                    summary.scanned,
                    format::format_bytes(summary.bytes_freed)
                )
            )
        );
        println!(
            "{}",
            ctx.style.message_detail(
                "Kept",
                &format!("{} referenced, {} within grace window", summary.kept_live, summary.kept_recent)
            )
        );
    }
    Ok(ExitCode::SUCCESS)
}

fn handle_doctor(ctx: &Ctx<'_>, json: bool) -> CmdResult {
    let report = ctx.engine.doctor(&ctx.workspace)?;
    if json {
        print_json(&report)?;
    } else {
        for warning in &report.warnings {
            println!("{}", ctx.style.message(MessageType::Warn, warning));
        }
        if report.is_healthy() {
            println!("{}", ctx.style.message(MessageType::Ok, "No problems found"));
        } else {
            for problem in &report.problems {
                println!("{}", ctx.style.message(MessageType::Err, problem));
            }
            println!(
                "{}",
                ctx.style.message(MessageType::Hint, "Resolve with `ward clear-stale` (add --force for live state)")
            );
        }
    }
    Ok(if report.is_healthy() {
        ExitCode::SUCCESS
    } else {
        exit_code_for(ErrorKind::StaleState)
    })
}

fn handle_clear_stale(ctx: &Ctx<'_>, force: bool) -> CmdResult {
    let summary = ctx.engine.clear_stale(&ctx.workspace, force)?;
    let style = ctx.style;
    if summary.is_empty() {
        ctx.info("Nothing to clear");
        return Ok(ExitCode::SUCCESS);
    }
    if let Some(id) = &summary.archived_run {
        println!("{}", style.message(MessageType::Ok, &format!("Archived run {} as abandoned", style.short_id(id))));
    }
    if let Some(path) = &summary.quarantined_run {
        println!(
            "{}",
            style.message(MessageType::Ok, &format!("Moved unreadable run state to {}", path.display()))
        );
    }
    if let Some(path) = &summary.archived_quickfix {
        println!("{}", style.message(MessageType::Ok, &format!("Archived quick-fix on {} as abandoned", path)));
    }
    if summary.discarded_quickfix {
        println!("{}", style.message(MessageType::Ok, "Removed unreadable quick-fix state"));
    }
    if summary.preflight_removed {
        println!("{}", style.message(MessageType::Ok, "Removed preflight report"));
    }
    Ok(ExitCode::SUCCESS)
}

fn handle_register(ctx: &Ctx<'_>, name: &str, root: Option<PathBuf>, language: Option<String>) -> CmdResult {
    let workspace = match root {
        Some(root) => Workspace::from_root(&ctx.base_dir.join(root))?,
        None => ctx.workspace.clone(),
    };
    let entry = ctx.engine.register_project(&workspace, name, language)?;
    println!(
        "{}",
        ctx.style.message(
            MessageType::Ok,
            &format!("Registered {} at {}", name, entry.root.display())
        )
    );
    Ok(ExitCode::SUCCESS)
}

fn handle_projects(ctx: &Ctx<'_>, json: bool) -> CmdResult {
    use ward_core::Registry;

    let projects = ctx.engine.registry()?.list()?;
    if json {
        let map: BTreeMap<&str, &ward_core::ProjectEntry> =
            projects.iter().map(|(n, e)| (n.as_str(), e)).collect();
        print_json(&map)?;
    } else if projects.is_empty() {
        ctx.info("No registered projects. Use `ward register <name>`.");
    } else {
        println!("{}", table::render_projects_table(&projects));
    }
    Ok(ExitCode::SUCCESS)
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_package_carries_no_author() {
        assert_eq!(env!("CARGO_PKG_AUTHORS"), "");
    }

    #[test]
    fn test_exit_codes_are_distinct() {
        let kinds = [
            ErrorKind::User,
            ErrorKind::Blocked,
            ErrorKind::NoActiveState,
            ErrorKind::Io,
            ErrorKind::Verification,
            ErrorKind::RetryBudget,
            ErrorKind::StaleState,
        ];
        let codes: std::collections::HashSet<String> =
            kinds.iter().map(|k| format!("{:?}", exit_code_for(*k))).collect();
        assert_eq!(codes.len(), kinds.len());
    }

    #[test]
    fn test_failed_verification_maps_to_exit_five() {
        let err = WardError::VerificationFailed {
            step: 2,
            details: "exit status 1".to_string(),
        };
        assert_eq!(err.kind(), ErrorKind::Verification);
        assert_eq!(
            format!("{:?}", exit_code_for(err.kind())),
            format!("{:?}", ExitCode::from(5))
        );
        assert!(hint_for(&err).unwrap().contains("ward run begin"));
        assert_eq!(err.to_string(), "Verification failed for step 2: exit status 1");
    }

    #[test]
    fn test_step_index_is_one_based() {
        assert_eq!(step_index(1).unwrap(), 0);
        assert!(step_index(0).is_err());
    }

    #[test]
    fn test_parse_run_start() {
        let cli = Cli::try_parse_from([
            "ward", "run", "start", "--goal", "g", "--step", "one:a.rs", "--step", "two:b.rs,c.rs",
        ])
        .unwrap();
        match cli.command {
            Command::Run {
                action: RunAction::Start { steps, .. },
            } => assert_eq!(steps.len(), 2),
            other => panic!("unexpected command: {:?}", other),
        }
    }

    #[test]
    fn test_edit_requires_expected_or_create() {
        assert!(Cli::try_parse_from(["ward", "run", "edit", "a.rs", "--new", "n"]).is_err());
        assert!(Cli::try_parse_from(["ward", "run", "edit", "a.rs", "--new", "n", "--create"]).is_ok());
    }
}
