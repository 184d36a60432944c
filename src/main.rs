//! Osmflow CLI Entry Point
//!
//! Provides command-line interface for module and flow execution.
//!
//! # Usage
//!
//! ```bash
//! # Run a flow against a target
//! osmflow flows/recon.yaml -p target=example.com
//!
//! # Check a document without running anything
//! osmflow flows/recon.yaml --validate
//!
//! # Dry run mode (preview the plan)
//! osmflow modules/probe.yaml -p target=example.com --dry-run
//!
//! # Specify working directory and pool size, keep a JSON report
//! osmflow flows/recon.yaml -p target=example.com --working-dir /data/recon --parallel 8 --report run.json
//! ```

use std::collections::BTreeMap;
use std::env;
use std::path::PathBuf;
use std::process::ExitCode;

use colored::Colorize;
use log::{error, info};

use osmflow::execution::Engine;
use osmflow::workflow::parser::{lint_workflow, load_workflow};
use osmflow::workflow::report::{NodeRecord, NodeStatus, RunReport};
use osmflow::workflow::{build, DocumentKind};
use osmflow::{APP_NAME, VERSION};

/// Command-line configuration parsed from arguments.
#[derive(Debug)]
struct Config {
    workflow_path: Option<String>,
    params: BTreeMap<String, String>,
    pause_flag_path: Option<String>,
    report_path: Option<PathBuf>,
    dry_run: bool,
    validate_only: bool,
    working_dir: Option<PathBuf>,
    max_parallel: usize,
    verbose: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            workflow_path: None,
            params: BTreeMap::new(),
            pause_flag_path: None,
            report_path: None,
            dry_run: false,
            validate_only: false,
            working_dir: None,
            max_parallel: num_cpus::get(),
            verbose: false,
        }
    }
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
    println!("{} v{}", APP_NAME.bold(), VERSION);
    println!("Scanning Workflow Engine");
    println!();
}

/// Prints usage information.
fn print_usage() {
    println!("Usage: osmflow [OPTIONS] <WORKFLOW_FILE>");
    println!();
    println!("Arguments:");
    println!("  <WORKFLOW_FILE>       Path to a module or flow YAML file");
    println!();
    println!("Options:");
    println!("  -p, --param KEY=VALUE Supply a parameter (repeatable)");
    println!("  --dry-run             Print the plan without executing");
    println!("  --validate            Check the document and exit");
    println!("  --working-dir PATH    Set working directory for steps");
    println!("  --parallel N          Worker pool size (default: {})", num_cpus::get());
    println!("  --pause-flag PATH     Pause between batches while PATH exists");
    println!("  --report PATH         Write the run report as JSON");
    println!("  --verbose             Enable debug logging");
    println!("  --help                Show this help message");
    println!("  --version             Show version information");
    println!();
    println!("Examples:");
    println!("  osmflow flows/recon.yaml -p target=example.com");
    println!("  osmflow modules/probe.yaml -p target=example.com --dry-run");
    println!("  osmflow flows/recon.yaml -p target=example.com --parallel 8 --report run.json");
}

/// Splits a `KEY=VALUE` parameter.
fn parse_param(raw: &str) -> Result<(String, String), String> {
    match raw.split_once('=') {
        Some((key, value)) if !key.trim().is_empty() => Ok((key.trim().to_string(), value.to_string())),
        _ => Err(format!("Invalid parameter '{}', expected KEY=VALUE", raw)),
    }
}

fn option_value<'a>(args: &'a [String], i: usize, flag: &str) -> Result<&'a String, String> {
    args.get(i).ok_or_else(|| format!("{} requires an argument", flag))
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
            "--dry-run" => config.dry_run = true,
            "--validate" => config.validate_only = true,
            "--verbose" | "-v" => config.verbose = true,
            "--param" | "-p" => {
                i += 1;
                let (key, val) = parse_param(option_value(args, i, arg)?)?;
                config.params.insert(key, val);
            }
            "--working-dir" => {
                i += 1;
                config.working_dir = Some(PathBuf::from(option_value(args, i, arg)?));
            }
            "--pause-flag" => {
                i += 1;
                config.pause_flag_path = Some(option_value(args, i, arg)?.clone());
            }
            "--report" => {
                i += 1;
                config.report_path = Some(PathBuf::from(option_value(args, i, arg)?));
            }
            "--parallel" => {
                i += 1;
                let raw = option_value(args, i, arg)?;
                config.max_parallel = match raw.parse() {
                    Ok(n) if n > 0 => n,
                    _ => return Err(format!("Invalid parallel value: {}", raw)),
                };
            }
            arg if arg.starts_with('-') => {
                return Err(format!("Unknown option: {}", arg));
            }
            _ => {
                if config.workflow_path.is_some() {
                    return Err(format!("Unexpected argument: {}", arg));
                }
                config.workflow_path = Some(arg.clone());
            }
        }
        i += 1;
    }

    if config.workflow_path.is_none() {
        return Err("Missing <WORKFLOW_FILE>".to_string());
    }

    Ok(config)
}

/// Validates the working directory. Steps run inside it; the process
/// itself stays where it was started.
fn setup_working_directory(working_dir: Option<PathBuf>) -> Result<Option<PathBuf>, Box<dyn std::error::Error>> {
    let Some(dir) = working_dir else {
        let current = env::current_dir()?;
        info!("Working directory: {}", current.display());
        return Ok(None);
    };

    if !dir.exists() {
        return Err(format!("Working directory does not exist: {}", dir.display()).into());
    }

    if !dir.is_dir() {
        return Err(format!("Path is not a directory: {}", dir.display()).into());
    }

    let dir = dir.canonicalize()?;
    info!("Working directory: {}", dir.display());
    Ok(Some(dir))
}

/// Lints the document, then checks that it loads and its graph builds.
fn validate(path: &str) -> Result<bool, Box<dyn std::error::Error>> {
    let problems = lint_workflow(path)?;
    if !problems.is_empty() {
        println!("{} {} problem(s) in {}", "✗".red(), problems.len(), path);
        for problem in &problems {
            println!("  - {}", problem);
        }
        return Ok(false);
    }

    let document = load_workflow(path)?;
    let graph = build(&document)?;
    println!(
        "{} {} '{}' is valid ({} nodes)",
        "✓".green(),
        document.kind,
        document.name,
        graph.len()
    );
    Ok(true)
}

fn status_label(status: NodeStatus) -> colored::ColoredString {
    match status {
        NodeStatus::Success => "success".green(),
        NodeStatus::Failed => "failed".red(),
        NodeStatus::Skipped => "skipped".yellow(),
    }
}

fn print_records(records: &[NodeRecord], depth: usize) {
    for record in records {
        let duration = record
            .duration_ms
            .map(|ms| format!(" ({} ms)", ms))
            .unwrap_or_default();
        println!(
            "{}{:<28} {}{}",
            "  ".repeat(depth + 1),
            record.name,
            status_label(record.status),
            duration
        );
        if let Some(error) = &record.error {
            println!("{}  {}", "  ".repeat(depth + 1), error.dimmed());
        }
        print_records(&record.children, depth + 1);
    }
}

/// Prints the colored run summary.
fn print_summary(report: &RunReport) {
    println!();
    println!("{}", "Summary".bold());
    print_records(&report.nodes, 0);
    println!();
    println!(
        "  {} succeeded, {} failed, {} skipped in {} ms",
        report.count(NodeStatus::Success),
        report.count(NodeStatus::Failed),
        report.count(NodeStatus::Skipped),
        report.duration_ms()
    );

    if !report.context.exports().is_empty() {
        println!();
        println!("{}", "Exports".bold());
        for (name, value) in report.context.exports() {
            println!("  {} = {}", name, value);
        }
    }

    println!();
    match &report.error {
        None => println!("{} {} '{}' completed", "✓".green(), report.kind, report.workflow),
        Some(e) => println!("{} {} '{}' aborted: {}", "✗".red(), report.kind, report.workflow, e),
    }
}

/// Main application entry point.
fn run() -> Result<bool, Box<dyn std::error::Error>> {
    let args: Vec<String> = env::args().collect();

    // Parse arguments
    let config = parse_arguments(&args).map_err(|e| {
        eprintln!("Error: {}", e);
        eprintln!();
        print_usage();
        e
    })?;

    // Setup logging
    setup_logging(config.verbose);

    let workflow_path = config.workflow_path.clone().unwrap_or_default();

    if config.validate_only {
        return validate(&workflow_path);
    }

    // Print banner
    print_banner();

    if let Some(ref path) = config.pause_flag_path {
        info!("Pause control: {}", path);
    }

    if config.dry_run {
        info!("Mode: DRY RUN (commands will not execute)");
        println!();
    }

    let work_dir = setup_working_directory(config.working_dir)?;

    // Load document
    let document = load_workflow(&workflow_path).map_err(|e| {
        error!("Failed to load workflow: {}", e);
        format!("Could not load workflow from '{}': {}", workflow_path, e)
    })?;

    match document.kind {
        DocumentKind::Module => info!("Module loaded: {} steps", document.steps.len()),
        DocumentKind::Flow => info!("Flow loaded: {} modules", document.modules.len()),
    }

    // Create and configure engine
    let mut engine = Engine::new(document);
    engine.set_max_parallel(config.max_parallel);
    engine.set_dry_run(config.dry_run);

    if let Some(pause_path) = config.pause_flag_path {
        engine.set_pause_flag_path(pause_path);
    }

    if let Some(dir) = work_dir {
        engine.set_working_dir(dir);
    }

    // Execute
    let report = engine.run(&config.params)?;
    print_summary(&report);

    if let Some(path) = config.report_path {
        report.save(&path)?;
        info!("Report written to {}", path.display());
    }

    Ok(report.succeeded)
}

fn main() -> ExitCode {
    match run() {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::from(1),
        Err(e) => {
            eprintln!();
            eprintln!("Error: {}", e);
            ExitCode::from(2)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> Vec<String> {
        std::iter::once("osmflow")
            .chain(list.iter().copied())
            .map(String::from)
            .collect()
    }

    #[test]
    fn test_parse_full_arguments() {
        let config = parse_arguments(&args(&[
            "recon.yaml",
            "-p",
            "target=example.com",
            "--param",
            "query=a=b",
            "--parallel",
            "3",
            "--dry-run",
            "--report",
            "out.json",
            "--pause-flag",
            "/tmp/pause",
        ]))
        .unwrap();

        assert_eq!(config.workflow_path.as_deref(), Some("recon.yaml"));
        assert_eq!(config.params["target"], "example.com");
        assert_eq!(config.params["query"], "a=b");
        assert_eq!(config.max_parallel, 3);
        assert!(config.dry_run);
        assert_eq!(config.report_path, Some(PathBuf::from("out.json")));
        assert_eq!(config.pause_flag_path.as_deref(), Some("/tmp/pause"));
    }

    #[test]
    fn test_parse_rejects_bad_input() {
        assert!(parse_arguments(&args(&[])).is_err());
        assert!(parse_arguments(&args(&["a.yaml", "b.yaml"])).is_err());
        assert!(parse_arguments(&args(&["a.yaml", "--parallel", "0"])).is_err());
        assert!(parse_arguments(&args(&["a.yaml", "-p", "novalue"])).is_err());
        assert!(parse_arguments(&args(&["a.yaml", "-p"])).is_err());
        assert!(parse_arguments(&args(&["a.yaml", "--bogus"])).is_err());
    }

    #[test]
    fn test_parse_param() {
        assert_eq!(parse_param("k=v").unwrap(), ("k".to_string(), "v".to_string()));
        assert_eq!(parse_param("k=").unwrap(), ("k".to_string(), String::new()));
        assert!(parse_param("=v").is_err());
    }
}
