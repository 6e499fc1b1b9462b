//! Command-line surface.
//!
//! Exit codes: 0 success, 2 validation failure, 3 policy block,
//! 4 approval required or denied, 5 execution failure, 6 I/O error.

use clap::{Parser, Subcommand};
use serde_json::Value;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use crate::config;
use crate::dsl::{parse_plan, validate_plan};
use crate::error::ErrorCode;
use crate::exec::{Orchestrator, RunOutcome, Suspension};
use crate::manifest::derive_manifest;
use crate::services::Services;
use crate::signing;
use crate::store::RunState;

pub const EXIT_OK: i32 = 0;
pub const EXIT_VALIDATION: i32 = 2;
pub const EXIT_POLICY: i32 = 3;
pub const EXIT_APPROVAL: i32 = 4;
pub const EXIT_EXECUTION: i32 = 5;
pub const EXIT_IO: i32 = 6;

#[derive(Parser)]
#[command(name = "deskpilot", about = "Desktop automation plan execution core")]
pub struct Cli {
    /// Directory holding policy.yaml, trust_store.yaml, orchestrator.yaml.
    #[arg(long, global = true, default_value = "configs")]
    pub config_dir: PathBuf,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// List plan templates in a directory.
    Templates {
        #[arg(long, default_value = "plans")]
        dir: PathBuf,
    },
    /// Statically validate a plan file.
    Validate { file: PathBuf },
    /// Execute a plan file.
    Run {
        file: PathBuf,
        #[arg(long)]
        auto_approve: bool,
        #[arg(long)]
        dry_run: bool,
        /// Extra variables, `key=value`, repeatable.
        #[arg(long = "var", value_name = "K=V")]
        vars: Vec<String>,
    },
    /// List recorded runs.
    List {
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
    /// Show one run as JSON.
    Show { run_id: u64 },
    /// Sign a plan file in place.
    Sign {
        file: PathBuf,
        #[arg(long)]
        key_id: String,
        #[arg(long)]
        key_file: PathBuf,
    },
    /// Generate an Ed25519 keypair.
    Keygen {
        #[arg(long)]
        key_id: String,
        #[arg(long, default_value = "keys")]
        out: PathBuf,
    },
    /// Policy checks without execution.
    Policy {
        #[command(subcommand)]
        command: PolicyCommand,
    },
    /// Serve the read-only HTTP surface.
    Serve {
        #[arg(long, default_value = "127.0.0.1:8787")]
        addr: String,
    },
}

#[derive(Subcommand)]
pub enum PolicyCommand {
    /// Evaluate a plan against the configured policy.
    Test { file: PathBuf },
}

/// Parse repeated `--var k=v` arguments.
pub fn parse_vars(raw: &[String]) -> Result<HashMap<String, Value>, String> {
    let mut vars = HashMap::new();
    for entry in raw {
        let (key, value) = entry
            .split_once('=')
            .ok_or_else(|| format!("expected key=value, got '{entry}'"))?;
        if key.is_empty() {
            return Err(format!("empty variable name in '{entry}'"));
        }
        vars.insert(key.to_string(), Value::String(value.to_string()));
    }
    Ok(vars)
}

fn build_services(config_dir: &Path) -> Result<Arc<Services>, String> {
    let policy = config::load_policy(&config_dir.join("policy.yaml"))?;
    let trust = config::load_trust_store(&config_dir.join("trust_store.yaml"))?;
    let orchestrator = config::load_or_default(&config_dir.join("orchestrator.yaml"))?;
    let audit = crate::store::JsonLinesAuditSink::new("logs/policy_audit.log")
        .map_err(|e| e.to_string())?;
    Ok(Services::builder()
        .policy(policy)
        .trust(trust)
        .orchestrator(orchestrator)
        .audit(Arc::new(audit))
        .build())
}

pub async fn execute(cli: Cli) -> i32 {
    match cli.command {
        Command::Templates { dir } => templates(&dir),
        Command::Validate { file } => validate(&file),
        Command::Run {
            file,
            auto_approve,
            dry_run,
            vars,
        } => run(&cli.config_dir, &file, auto_approve, dry_run, &vars).await,
        Command::List { limit } => list(&cli.config_dir, limit).await,
        Command::Show { run_id } => show(&cli.config_dir, run_id).await,
        Command::Sign {
            file,
            key_id,
            key_file,
        } => sign(&file, &key_id, &key_file),
        Command::Keygen { key_id, out } => keygen(&key_id, &out),
        Command::Policy {
            command: PolicyCommand::Test { file },
        } => policy_test(&cli.config_dir, &file),
        Command::Serve { addr } => serve(&cli.config_dir, &addr).await,
    }
}

fn templates(dir: &Path) -> i32 {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) => {
            eprintln!("cannot read {}: {e}", dir.display());
            return EXIT_IO;
        }
    };
    for entry in entries.filter_map(Result::ok) {
        let name = entry.file_name().to_string_lossy().into_owned();
        if name.ends_with(".yaml") || name.ends_with(".yml") {
            println!("{name}");
        }
    }
    EXIT_OK
}

fn validate(file: &Path) -> i32 {
    let text = match std::fs::read_to_string(file) {
        Ok(text) => text,
        Err(e) => {
            eprintln!("cannot read {}: {e}", file.display());
            return EXIT_IO;
        }
    };
    let plan = match parse_plan(&text) {
        Ok(plan) => plan,
        Err(e) => {
            eprintln!("parse error: {e}");
            return EXIT_VALIDATION;
        }
    };
    let report = validate_plan(&plan);
    for diagnostic in &report.diagnostics {
        let location = diagnostic
            .step_index
            .map(|i| format!(" (step {i})"))
            .unwrap_or_default();
        eprintln!(
            "{:?} {}{}: {}",
            diagnostic.level, diagnostic.code, location, diagnostic.message
        );
    }
    if report.is_valid {
        println!("OK: {} steps", plan.steps.len());
        EXIT_OK
    } else {
        EXIT_VALIDATION
    }
}

async fn run(
    config_dir: &Path,
    file: &Path,
    auto_approve: bool,
    dry_run: bool,
    raw_vars: &[String],
) -> i32 {
    let text = match std::fs::read_to_string(file) {
        Ok(text) => text,
        Err(e) => {
            eprintln!("cannot read {}: {e}", file.display());
            return EXIT_IO;
        }
    };
    let plan = match parse_plan(&text) {
        Ok(plan) => plan,
        Err(e) => {
            eprintln!("parse error: {e}");
            return EXIT_VALIDATION;
        }
    };
    let vars = match parse_vars(raw_vars) {
        Ok(vars) => vars,
        Err(e) => {
            eprintln!("{e}");
            return EXIT_VALIDATION;
        }
    };
    let services = match build_services(config_dir) {
        Ok(services) => services,
        Err(e) => {
            eprintln!("configuration error: {e}");
            return EXIT_IO;
        }
    };
    let orchestrator = Orchestrator::new(services);

    let run_id = match orchestrator.submit(plan, vars, auto_approve, dry_run).await {
        Ok(run_id) => run_id,
        Err(e) => {
            eprintln!("{e}");
            return match e.code() {
                ErrorCode::ValidationFailed => EXIT_VALIDATION,
                ErrorCode::QueueFull => EXIT_EXECUTION,
                _ => EXIT_EXECUTION,
            };
        }
    };

    // Single-shot mode: process this run on the calling task.
    let mut last_outcome = None;
    while let Some((id, outcome)) = orchestrator.process_one().await {
        if id == run_id {
            last_outcome = Some(outcome);
        }
        let state = orchestrator
            .run_state(run_id)
            .await
            .unwrap_or(RunState::Failed);
        if state.is_terminal() || state == RunState::WaitingApproval || state == RunState::Paused {
            break;
        }
    }

    match last_outcome {
        Some(RunOutcome::Completed) => {
            println!("run {run_id} completed");
            EXIT_OK
        }
        Some(RunOutcome::Suspended(Suspension::Approval { .. })) => {
            eprintln!("run {run_id} requires approval (resume via POST /hitl/{run_id})");
            EXIT_APPROVAL
        }
        Some(RunOutcome::Suspended(Suspension::SafeFail { reason })) => {
            eprintln!("run {run_id} paused by L4 monitor: {reason}");
            EXIT_EXECUTION
        }
        Some(RunOutcome::Suspended(Suspension::Paused)) => {
            eprintln!("run {run_id} paused");
            EXIT_EXECUTION
        }
        Some(RunOutcome::Cancelled) => {
            eprintln!("run {run_id} cancelled");
            EXIT_EXECUTION
        }
        Some(RunOutcome::Failed(card)) => {
            eprintln!("run {run_id} failed: {card}");
            for hint in &card.hints {
                eprintln!("  hint: {hint}");
            }
            match card.code {
                ErrorCode::PolicyBlocked => EXIT_POLICY,
                ErrorCode::ApprovalDenied | ErrorCode::ApprovalTimeout => EXIT_APPROVAL,
                _ => EXIT_EXECUTION,
            }
        }
        None => {
            eprintln!("run {run_id} was not scheduled");
            EXIT_EXECUTION
        }
    }
}

async fn list(config_dir: &Path, limit: usize) -> i32 {
    let services = match build_services(config_dir) {
        Ok(services) => services,
        Err(e) => {
            eprintln!("configuration error: {e}");
            return EXIT_IO;
        }
    };
    match services.store.list_runs(limit).await {
        Ok(summaries) => {
            for summary in summaries {
                println!(
                    "{}\t{:?}\t{}\t{}",
                    summary.run_id, summary.state, summary.plan_name, summary.public_id
                );
            }
            EXIT_OK
        }
        Err(e) => {
            eprintln!("{e}");
            EXIT_IO
        }
    }
}

async fn show(config_dir: &Path, run_id: u64) -> i32 {
    let services = match build_services(config_dir) {
        Ok(services) => services,
        Err(e) => {
            eprintln!("configuration error: {e}");
            return EXIT_IO;
        }
    };
    match services.store.get_run(run_id).await {
        Ok(Some(run)) => {
            println!(
                "{}",
                serde_json::to_string_pretty(&run).unwrap_or_default()
            );
            EXIT_OK
        }
        Ok(None) => {
            eprintln!("run {run_id} not found");
            EXIT_EXECUTION
        }
        Err(e) => {
            eprintln!("{e}");
            EXIT_IO
        }
    }
}

fn sign(file: &Path, key_id: &str, key_file: &Path) -> i32 {
    let text = match std::fs::read_to_string(file) {
        Ok(text) => text,
        Err(e) => {
            eprintln!("cannot read {}: {e}", file.display());
            return EXIT_IO;
        }
    };
    let plan = match parse_plan(&text) {
        Ok(plan) => plan,
        Err(e) => {
            eprintln!("parse error: {e}");
            return EXIT_VALIDATION;
        }
    };
    if plan.signature.is_some() {
        eprintln!("plan is already signed; remove the signature block first");
        return EXIT_VALIDATION;
    }
    let key_text = match std::fs::read_to_string(key_file) {
        Ok(key) => key,
        Err(e) => {
            eprintln!("cannot read {}: {e}", key_file.display());
            return EXIT_IO;
        }
    };
    let key = match signing::parse_signing_key(&key_text) {
        Ok(key) => key,
        Err(code) => {
            eprintln!("invalid signing key: {code}");
            return EXIT_VALIDATION;
        }
    };
    let block = signing::sign_plan(&plan, &key, key_id, chrono::Utc::now());
    let appended = format!(
        "{}\nsignature:\n  algo: {}\n  key_id: \"{}\"\n  created_at: \"{}\"\n  sig: \"{}\"\n",
        text.trim_end(),
        block.algo,
        block.key_id,
        block.created_at,
        block.sig
    );
    if let Err(e) = std::fs::write(file, appended) {
        eprintln!("cannot write {}: {e}", file.display());
        return EXIT_IO;
    }
    println!("signed {} with {key_id}", file.display());
    EXIT_OK
}

fn keygen(key_id: &str, out: &Path) -> i32 {
    if let Err(e) = std::fs::create_dir_all(out) {
        eprintln!("cannot create {}: {e}", out.display());
        return EXIT_IO;
    }
    let (private_key, public_key) = signing::generate_keypair();
    let slug = key_id.replace([':', '/'], "_");
    let private_path = out.join(format!("{slug}.key"));
    let public_path = out.join(format!("{slug}.pub"));
    if let Err(e) = std::fs::write(&private_path, &private_key) {
        eprintln!("cannot write {}: {e}", private_path.display());
        return EXIT_IO;
    }
    if let Err(e) = std::fs::write(&public_path, &public_key) {
        eprintln!("cannot write {}: {e}", public_path.display());
        return EXIT_IO;
    }
    println!("wrote {} and {}", private_path.display(), public_path.display());
    println!("add to trust_store.yaml under key_id \"{key_id}\": {public_key}");
    EXIT_OK
}

fn policy_test(config_dir: &Path, file: &Path) -> i32 {
    let text = match std::fs::read_to_string(file) {
        Ok(text) => text,
        Err(e) => {
            eprintln!("cannot read {}: {e}", file.display());
            return EXIT_IO;
        }
    };
    let plan = match parse_plan(&text) {
        Ok(plan) => plan,
        Err(e) => {
            eprintln!("parse error: {e}");
            return EXIT_VALIDATION;
        }
    };
    let policy = match config::load_policy(&config_dir.join("policy.yaml")) {
        Ok(policy) => policy,
        Err(e) => {
            eprintln!("policy error: {e}");
            return EXIT_IO;
        }
    };
    let trust = config::load_trust_store(&config_dir.join("trust_store.yaml")).unwrap_or_default();
    let manifest = derive_manifest(&plan);
    let signature = plan
        .signature
        .as_ref()
        .map(|_| trust.verify(&plan, chrono::Utc::now()));
    let engine = crate::policy::PolicyEngine::new(policy);
    let decision = engine.evaluate(&manifest, chrono::Utc::now(), signature.as_ref());
    for check in &decision.checks {
        println!(
            "{:?}: {}{}",
            check.kind,
            if check.allowed { "allow" } else { "block" },
            check
                .reason
                .as_ref()
                .map(|r| format!(" ({r})"))
                .unwrap_or_default()
        );
    }
    if decision.allowed {
        println!("allowed; autopilot={}", decision.autopilot_enabled);
        EXIT_OK
    } else {
        EXIT_POLICY
    }
}

async fn serve(config_dir: &Path, addr: &str) -> i32 {
    let services = match build_services(config_dir) {
        Ok(services) => services,
        Err(e) => {
            eprintln!("configuration error: {e}");
            return EXIT_IO;
        }
    };
    let orchestrator = Orchestrator::new(services);
    orchestrator.start_workers();

    // Cron schedules fire template submissions into the queue.
    let schedules: Vec<crate::config::ScheduleEntry> =
        match config::load_or_default(&config_dir.join("schedules.yaml")) {
            Ok(schedules) => schedules,
            Err(e) => {
                eprintln!("schedules error: {e}");
                return EXIT_IO;
            }
        };
    if !schedules.is_empty() {
        match crate::triggers::ScheduleRunner::new(schedules) {
            Ok(runner) => {
                let orchestrator = Arc::clone(&orchestrator);
                let cancel = tokio_util::sync::CancellationToken::new();
                tokio::spawn(async move {
                    runner
                        .run(
                            move |entry| {
                                let orchestrator = Arc::clone(&orchestrator);
                                tokio::spawn(async move {
                                    submit_schedule(&orchestrator, entry).await;
                                });
                            },
                            cancel,
                        )
                        .await;
                });
            }
            Err(e) => {
                eprintln!("schedules error: {e}");
                return EXIT_IO;
            }
        }
    }

    match crate::http::serve(orchestrator, addr).await {
        Ok(()) => EXIT_OK,
        Err(e) => {
            eprintln!("server error: {e}");
            EXIT_IO
        }
    }
}

async fn submit_schedule(orchestrator: &Orchestrator, entry: crate::config::ScheduleEntry) {
    let text = match tokio::fs::read_to_string(&entry.template).await {
        Ok(text) => text,
        Err(e) => {
            tracing::error!(schedule = %entry.id, template = %entry.template, error = %e, "cannot read template");
            return;
        }
    };
    let mut plan = match parse_plan(&text) {
        Ok(plan) => plan,
        Err(e) => {
            tracing::error!(schedule = %entry.id, error = %e, "template parse failed");
            return;
        }
    };
    let execution = plan.execution.get_or_insert_with(Default::default);
    execution.queue.get_or_insert(entry.queue.clone());
    execution.priority.get_or_insert(entry.priority);
    let variables: HashMap<String, serde_json::Value> =
        entry.variables.clone().into_iter().collect();
    match orchestrator.submit(plan, variables, false, false).await {
        Ok(run_id) => tracing::info!(schedule = %entry.id, run_id, "scheduled run enqueued"),
        Err(e) => tracing::warn!(schedule = %entry.id, error = %e, "scheduled run rejected"),
    }
}

/// Poll helper shared by interactive commands.
#[allow(dead_code)]
async fn wait_terminal(orchestrator: &Orchestrator, run_id: u64) -> RunState {
    orchestrator
        .wait_terminal(run_id, Duration::from_secs(3600))
        .await
        .unwrap_or(RunState::Failed)
}
