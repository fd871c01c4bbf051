//! PlayRunner CLI Entry Point
//!
//! Runs a single playbook file through the engine.
//!
//! # Usage
//!
//! ```bash
//! # Execute a playbook
//! playrunner playbooks/gateway_health.yaml
//!
//! # Supply parameters and credentials
//! playrunner health.yaml --param gateway_url=http://gw:8088 --credentials creds.yaml
//!
//! # Step through the playbook one step at a time
//! playrunner health.yaml --debug
//! ```
//!
//! While a playbook runs, commands typed on stdin steer it:
//! `p` pauses, `r` resumes (or runs the next step in debug mode),
//! `s` skips the current step, `c` leaves debug mode and `q` cancels.
//! Ctrl-C cancels as well.

use std::collections::HashMap;
use std::env;
use std::io::BufRead;
use std::process::ExitCode;
use std::sync::Arc;

use colored::Colorize;
use log::{error, info, warn};
use serde_json::Value;

use playrunner::context::{AppContext, Collaborators};
use playrunner::execution::{ExecutionControl, InMemoryVault};
use playrunner::playbook::{
    ExecutionState, ExecutionStatus, PlaybookLoader, StepStatus, YamlPlaybookLoader,
};
use playrunner::{OrchestratorConfig, APP_NAME, VERSION};

/// Config file read when `--config` is not given.
const DEFAULT_CONFIG: &str = "playrunner.yaml";

/// Command-line configuration parsed from arguments.
#[derive(Debug, Default)]
struct Config {
    playbook_path: Option<String>,
    parameters: HashMap<String, Value>,
    credentials_path: Option<String>,
    config_path: Option<String>,
    debug: bool,
    verbose: bool,
}

/// Configures the logging system with appropriate formatting.
fn setup_logging(verbose: bool) {
    let level = if verbose { "debug" } else { "info" };

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level))
        .format(|buf, record| {
            use std::io::Write;

            match record.level() {
                log::Level::Warn | log::Level::Error => {
                    writeln!(buf, "[{}] {}", record.level(), record.args())
                }
                _ => writeln!(buf, "{}", record.args()),
            }
        })
        .init();
}

/// Prints the application banner with version information.
fn print_banner() {
    println!();
    println!("{} v{}", APP_NAME, VERSION);
    println!("Playbook Execution Orchestrator");
    println!();
}

/// Prints usage information.
fn print_usage() {
    println!("Usage: playrunner [OPTIONS] <PLAYBOOK_FILE>");
    println!();
    println!("Arguments:");
    println!("  <PLAYBOOK_FILE>       Path to playbook YAML or JSON file");
    println!();
    println!("Options:");
    println!("  --param NAME=VALUE    Set a playbook parameter (repeatable)");
    println!("  --credentials FILE    Load credentials from a YAML file");
    println!("  --config FILE         Orchestrator config (default: {})", DEFAULT_CONFIG);
    println!("  --debug               Pause before every step");
    println!("  --verbose             Enable debug logging");
    println!("  --help                Show this help message");
    println!("  --version             Show version information");
    println!();
    println!("Examples:");
    println!("  playrunner gateway_health.yaml --param gateway_url=http://localhost:8088");
    println!("  playrunner perspective_login.yaml --credentials creds.yaml --debug");
}

/// Parses command-line arguments into a Config struct.
fn parse_arguments(args: &[String]) -> Result<Config, String> {
    let mut config = Config::default();
    let mut i = 1; // Skip program name

    while i < args.len() {
        let arg = &args[i];

        match arg.as_str() {
            "--help" | "-h" => {
                print_usage();
                std::process::exit(0);
            }
            "--version" | "-V" => {
                println!("{} {}", APP_NAME, VERSION);
                std::process::exit(0);
            }
            "--debug" => {
                config.debug = true;
            }
            "--verbose" | "-v" => {
                config.verbose = true;
            }
            "--param" | "-p" => {
                i += 1;
                if i >= args.len() {
                    return Err("--param requires a NAME=VALUE argument".to_string());
                }
                let (name, value) = args[i]
                    .split_once('=')
                    .filter(|(name, _)| !name.is_empty())
                    .ok_or_else(|| format!("Invalid parameter (expected NAME=VALUE): {}", args[i]))?;
                config
                    .parameters
                    .insert(name.to_string(), Value::String(value.to_string()));
            }
            "--credentials" => {
                i += 1;
                if i >= args.len() {
                    return Err("--credentials requires a file argument".to_string());
                }
                config.credentials_path = Some(args[i].clone());
            }
            "--config" => {
                i += 1;
                if i >= args.len() {
                    return Err("--config requires a file argument".to_string());
                }
                config.config_path = Some(args[i].clone());
            }
            arg if arg.starts_with('-') => {
                return Err(format!("Unknown option: {}", arg));
            }
            _ => {
                if config.playbook_path.is_some() {
                    return Err(format!("Unexpected argument: {}", arg));
                }
                config.playbook_path = Some(arg.clone());
            }
        }
        i += 1;
    }

    Ok(config)
}

/// Forwards stdin commands and Ctrl-C to the running execution.
fn spawn_console(control: ExecutionControl) {
    let ctrl_c = control.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, cancelling execution");
            ctrl_c.cancel();
        }
    });

    // A plain thread, so a pending stdin read never holds up runtime shutdown.
    std::thread::spawn(move || {
        for line in std::io::stdin().lock().lines() {
            let Ok(line) = line else {
                break;
            };
            let sent = match line.trim() {
                "p" | "pause" => control.pause(),
                "" | "r" | "resume" => control.resume(),
                "s" | "skip" => control.skip_current_step(),
                "c" | "continue" => control.disable_debug(),
                "q" | "quit" => control.cancel(),
                other => {
                    warn!("Unknown command '{}' (p, r, s, c, q)", other);
                    continue;
                }
            };
            if !sent {
                break;
            }
        }
    });
}

/// Prints the per-step outcome of an execution.
fn print_summary(state: &ExecutionState) {
    println!();
    println!("{}", "Execution Summary".bold());
    println!("  Playbook:  {}", state.playbook_name);
    println!("  Execution: {}", state.execution_id);

    for result in &state.step_results {
        let status = match result.status {
            StepStatus::Completed => "COMPLETED".green(),
            StepStatus::Failed => "FAILED".red(),
            StepStatus::Skipped => "SKIPPED".yellow(),
            StepStatus::Running => "RUNNING".cyan(),
            StepStatus::Pending => "PENDING".dimmed(),
        };
        print!("  {:<10} {}", status, result.step_name);
        if result.attempts > 1 {
            print!(" ({} attempts)", result.attempts);
        }
        println!();
        if let Some(ref message) = result.error {
            println!("             {}", message.dimmed());
        }
    }

    let status = match state.status {
        ExecutionStatus::Completed => "COMPLETED".green().bold(),
        ExecutionStatus::Cancelled => "CANCELLED".yellow().bold(),
        _ => format!("{:?}", state.status).to_uppercase().red().bold(),
    };
    println!();
    println!("  Status: {}", status);
    if let Some(ref message) = state.error {
        println!("  {}", message);
    }
}

/// Main application entry point.
async fn run() -> Result<bool, Box<dyn std::error::Error>> {
    let args: Vec<String> = env::args().collect();

    // Parse arguments
    let cli = parse_arguments(&args).map_err(|e| {
        eprintln!("Error: {}", e);
        eprintln!();
        print_usage();
        e
    })?;

    // Setup logging
    setup_logging(cli.verbose);

    // Print banner
    print_banner();

    let Some(playbook_path) = cli.playbook_path else {
        print_usage();
        return Err("No playbook file given".into());
    };

    // Load orchestrator config
    let mut config =
        OrchestratorConfig::load(cli.config_path.as_deref().unwrap_or(DEFAULT_CONFIG))?;
    config.apply_env_overrides()?;

    let vault = match cli.credentials_path {
        Some(ref path) => {
            let vault = InMemoryVault::from_yaml_file(path)?;
            info!("Loaded {} credential(s) from {}", vault.len(), path);
            vault
        }
        None => InMemoryVault::new(),
    };

    // Load playbook
    let loader = YamlPlaybookLoader::with_root(&config.playbook_dir);
    let playbook = loader.load(&playbook_path).map_err(|e| {
        error!("Failed to load playbook: {}", e);
        format!("Could not load playbook from '{}': {}", playbook_path, e)
    })?;

    let ctx = AppContext::new(config, Collaborators::new(Arc::new(vault)))?;
    let engine = ctx.engine(playbook);
    if cli.debug {
        engine.enable_debug(engine.execution_id());
        info!("Debug mode: press Enter to run each step, 'c' to continue");
    }
    spawn_console(engine.control());

    // Execute playbook
    let outcome = engine.execute_playbook(cli.parameters).await;
    let state = engine.state();

    print_summary(&state);
    print!("{}", engine.timeline().gantt_chart());

    match outcome {
        Ok(state) => Ok(state.status == ExecutionStatus::Completed && state.error.is_none()),
        Err(e) if e.is_cancellation() => Ok(false),
        Err(e) => Err(e.into()),
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    match run().await {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(e) => {
            eprintln!();
            eprintln!("Error: {}", e);
            ExitCode::FAILURE
        }
    }
}
