//! `plcctl` – headless front-end for the PLC commissioning engine.
//!
//! Inspects device descriptions and topologies, and runs scripted
//! commissioning workflows against the configured engineering backend.

mod config;
mod logging;
mod prompt;

use anyhow::Context;
use clap::{Parser, Subcommand};
use engine::catalog::Catalog;
use engine::logging::TracingSink;
use engine::types::*;
use engine::{topology, BackendRegistry, ErrorRecord, Manufacturer, Outcome, ProjectConfig};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

// ===========================================================================
// CLI definition
// ===========================================================================

#[derive(Parser)]
#[command(
    name = "plcctl",
    version,
    about = "Commission PLC field devices from scripted workflows"
)]
struct Cli {
    /// Extra configuration file layered over the defaults.
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Log at debug level regardless of the configured levels.
    #[arg(short, long, global = true)]
    verbose: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Summarise the device types declared in description documents.
    Describe {
        /// Device-description documents (YAML or JSON).
        #[arg(required = true)]
        descriptions: Vec<PathBuf>,
        /// Output as JSON.
        #[arg(long)]
        json: bool,
    },

    /// Resolve a topology against description documents without a backend.
    Import {
        /// Topology document.
        topology: PathBuf,
        /// Device-description documents.
        #[arg(long = "gsd", required = true, num_args = 1..)]
        descriptions: Vec<PathBuf>,
        /// Output as JSON.
        #[arg(long)]
        json: bool,
    },

    /// Run a commissioning workflow from a YAML file.
    Run {
        /// Path to the workflow YAML file.
        file: PathBuf,
        /// Backend to drive; defaults to `backend.manufacturer` from config.
        #[arg(long)]
        manufacturer: Option<String>,
        /// Never prompt at pause steps.
        #[arg(long)]
        yes: bool,
        /// Directory for artifacts output.
        #[arg(long)]
        artifacts: Option<PathBuf>,
        /// Output as JSON.
        #[arg(long)]
        json: bool,
    },

    /// Write a project configuration document.
    NewConfig {
        /// Project file to open or create.
        #[arg(long)]
        project: PathBuf,
        /// Network adapter the engineering tool should use.
        #[arg(long)]
        network_card: String,
        /// Destination (.json or .yaml).
        #[arg(long)]
        out: PathBuf,
    },
}

// ===========================================================================
// Main
// ===========================================================================

fn main() {
    if let Err(e) = run() {
        eprintln!("error: {:#}", e);
        std::process::exit(2);
    }
}

fn run() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let mut app = config::load_config(cli.config.as_deref()).context("failed to load configuration")?;
    app.logging.verbose |= cli.verbose;
    if let Some(path) = logging::init_logging(&app.logging)? {
        tracing::info!(path = %path.display(), "writing log file");
    }

    match cli.command {
        Commands::Describe { descriptions, json } => cmd_describe(&descriptions, json),
        Commands::Import {
            topology,
            descriptions,
            json,
        } => cmd_import(&topology, &descriptions, json),
        Commands::Run {
            file,
            manufacturer,
            yes,
            artifacts,
            json,
        } => {
            let manufacturer = match manufacturer {
                Some(m) => m
                    .parse::<Manufacturer>()
                    .map_err(|e: ErrorRecord| anyhow::anyhow!(e.message))?,
                None => app.backend.manufacturer()?,
            };
            let hooks = prompt::TerminalHooks::new(app.backend.interactive && !yes && !json);
            cmd_run(&file, manufacturer, &hooks, artifacts, json)
        }
        Commands::NewConfig {
            project,
            network_card,
            out,
        } => cmd_new_config(project, network_card, &out),
    }
    Ok(())
}

// ===========================================================================
// Subcommand implementations
// ===========================================================================

fn cmd_describe(descriptions: &[PathBuf], json: bool) {
    let run_id = new_run_id();
    let start = Instant::now();
    let outcome = Catalog::load(descriptions, &TracingSink)
        .map(|catalog| serde_json::to_value(catalog.summary()).ok());
    let report = step_report(
        &run_id,
        0,
        "describe",
        &join_paths(descriptions),
        Status::Pass,
        outcome,
        elapsed_ms(start),
    );
    output_result(&report, json);
}

fn cmd_import(topology_path: &Path, descriptions: &[PathBuf], json: bool) {
    let run_id = new_run_id();
    let start = Instant::now();
    let outcome: Outcome<_> = Catalog::load(descriptions, &TracingSink)
        .and_then(|catalog| topology::import(topology_path, &catalog, &TracingSink))
        .map(|import| serde_json::to_value(import).ok());
    let report = step_report(
        &run_id,
        0,
        "import",
        &topology_path.display().to_string(),
        Status::Pass,
        outcome,
        elapsed_ms(start),
    );
    output_result(&report, json);
}

fn cmd_run(
    file: &Path,
    manufacturer: Manufacturer,
    hooks: &prompt::TerminalHooks,
    artifacts: Option<PathBuf>,
    json: bool,
) {
    let target = file.display().to_string();
    let start = Instant::now();

    let prepared = engine::scenario::load_scenario_file(file).and_then(|scenario| {
        BackendRegistry::new()
            .create_session(manufacturer, Arc::new(TracingSink))
            .map(|session| (scenario, session))
    });
    let (scenario, mut session) = match prepared {
        Ok(v) => v,
        Err(failure) => {
            let report = step_report(
                &new_run_id(),
                0,
                "run",
                &target,
                Status::Pass,
                Err(failure),
                elapsed_ms(start),
            );
            output_result(&report, json);
            return;
        }
    };

    let base_dir = file.parent().unwrap_or_else(|| Path::new("."));
    tracing::info!(workflow = %target, %manufacturer, steps = scenario.steps.len(), "running workflow");
    let result = engine::scenario::run_scenario(&scenario, base_dir, &mut session, hooks);

    if json {
        let j = serde_json::to_string_pretty(&result).unwrap_or_default();
        println!("{}", j);
    } else {
        print_scenario(&result);
    }

    if let Some(ref dir) = artifacts {
        write_artifacts(dir, &result);
    }

    match result.overall_status {
        Status::Pass | Status::Skip => {}
        Status::Fail => std::process::exit(1),
        Status::Error => std::process::exit(2),
    }
}

fn cmd_new_config(project: PathBuf, network_card: String, out: &Path) {
    let run_id = new_run_id();
    let start = Instant::now();
    let cfg = ProjectConfig::new(project, network_card);
    let outcome = cfg
        .validate()
        .and_then(|()| cfg.save(out))
        .map(|()| serde_json::to_value(&cfg).ok());
    let report = step_report(
        &run_id,
        0,
        "new-config",
        &out.display().to_string(),
        Status::Pass,
        outcome,
        elapsed_ms(start),
    );
    output_result(&report, false);
}

// ===========================================================================
// Output helpers
// ===========================================================================

fn output_result(report: &StepReport, json: bool) {
    if json {
        let j = serde_json::to_string_pretty(report).unwrap_or_default();
        println!("{}", j);
    } else {
        print_human(report);
    }

    // Exit with non-zero status on error/fail
    match report.status {
        Status::Pass | Status::Skip => {}
        Status::Fail => std::process::exit(1),
        Status::Error => std::process::exit(2),
    }
}

fn print_human(r: &StepReport) {
    println!("[{}] {} {}", r.status, r.op, r.target);
    println!("  run_id: {}", r.run_id);
    println!("  timing: {}ms", r.timing_ms);

    for err in &r.errors {
        println!("  error:  {}", err);
    }

    if let Some(ref data) = r.data {
        if let Ok(s) = serde_json::to_string_pretty(data) {
            for line in s.lines() {
                println!("  {}", line);
            }
        }
    }
}

fn print_scenario(result: &ScenarioResult) {
    println!(
        "Workflow: {}",
        result.name.as_deref().unwrap_or("<unnamed>")
    );
    println!("Overall: {} ({}ms)", result.overall_status, result.timing_ms);
    for sr in &result.step_results {
        let target = if sr.target.is_empty() {
            String::new()
        } else {
            format!(" {}", sr.target)
        };
        println!(
            "  Step {}: {}{} -> {} (expected {}, {}ms)",
            sr.index, sr.op, target, sr.status, sr.expected, sr.timing_ms
        );
        for err in &sr.errors {
            println!("    {}", err);
        }
    }
    for err in &result.teardown_errors {
        println!("  teardown: {}", err);
    }
}

// ===========================================================================
// Artifact helpers
// ===========================================================================

fn write_artifacts(dir: &Path, result: &ScenarioResult) {
    let art_dir = dir.join(&result.run_id);
    if let Err(e) = std::fs::create_dir_all(&art_dir) {
        eprintln!(
            "warning: failed to create artifacts dir {}: {}",
            art_dir.display(),
            e
        );
        return;
    }

    // result.json
    let j = serde_json::to_string_pretty(result).unwrap_or_default();
    let _ = std::fs::write(art_dir.join("result.json"), j);

    // events.jsonl, one line per step
    let mut lines = String::new();
    for sr in &result.step_results {
        if let Ok(line) = serde_json::to_string(sr) {
            lines.push_str(&line);
            lines.push('\n');
        }
    }
    let _ = std::fs::write(art_dir.join("events.jsonl"), lines);
}

fn elapsed_ms(start: Instant) -> u64 {
    start.elapsed().as_millis() as u64
}

fn join_paths(paths: &[PathBuf]) -> String {
    paths
        .iter()
        .map(|p| p.display().to_string())
        .collect::<Vec<_>>()
        .join(",")
}

