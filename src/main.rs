//! emu-harness CLI
//!
//! Entry point for the `emu-harness` command-line tool.

use std::path::{Path, PathBuf};
use std::process;

use clap::{Parser, Subcommand};
use emu_classifier::{CiStatus, Classifier, ExitPolicy};
use emu_harness::dispatch::Dispatcher;
use emu_harness::lifecycle::Controller;
use emu_harness::signal::SignalHandler;
use emu_harness::{HarnessConfig, RunContext};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "emu-harness")]
#[command(about = "Run test suites on emulated devices", version)]
struct Cli {
    /// Log filter (e.g. "info", "emu_harness=debug")
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start devices, run the selected suites and tear everything down
    Run {
        /// Path to the harness config file
        #[arg(long, short = 'c')]
        config: PathBuf,

        /// Suites to run instead of the configured `test_suites` (repeatable)
        #[arg(long = "suite")]
        suites: Vec<String>,
    },

    /// Validate the configuration
    Verify {
        #[arg(long, short = 'c')]
        config: PathBuf,
    },

    /// Print each suite's resolved command line without running anything
    Commands {
        #[arg(long, short = 'c')]
        config: PathBuf,

        #[arg(long = "suite")]
        suites: Vec<String>,
    },

    /// Classify an existing suite log
    Classify {
        /// Suite category whose rule table applies
        #[arg(long)]
        category: String,

        /// Exit code the suite ended with; omit for a killed process
        #[arg(long)]
        exit_code: Option<i32>,

        /// Suite name for the summary line
        #[arg(long, default_value = "suite")]
        suite: String,

        /// Config file supplying the exit policy and custom rules
        #[arg(long, short = 'c')]
        config: Option<PathBuf>,

        /// Captured output to classify
        log: PathBuf,
    },
}

fn main() {
    let cli = Cli::parse();

    let filter = EnvFilter::try_new(&cli.log_level).unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_target(false).with_writer(std::io::stderr))
        .init();

    match cli.command {
        Commands::Run { config, suites } => run(&config, suites),
        Commands::Verify { config } => run_verify(&config),
        Commands::Commands { config, suites } => run_commands(&config, suites),
        Commands::Classify {
            category,
            exit_code,
            suite,
            config,
            log,
        } => run_classify(&category, exit_code, &suite, config.as_deref(), &log),
    }
}

/// Load and validate, exiting with the fatal code on any problem.
fn load_config(path: &Path, suites: Vec<String>) -> HarnessConfig {
    let loaded = HarnessConfig::load(path).and_then(|mut config| {
        if !suites.is_empty() {
            config.select_suites(suites)?;
        }
        Ok(config)
    });
    match loaded {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Configuration error: {}", e);
            process::exit(CiStatus::Exception.exit_code());
        }
    }
}

fn run(path: &Path, suites: Vec<String>) {
    let config = load_config(path, suites);

    let handler = SignalHandler::new();
    if let Err(e) = handler.install(CiStatus::Exception.exit_code()) {
        eprintln!("Warning: could not install signal handler: {}", e);
    }

    let controller = match Controller::emulator(config) {
        Ok(c) => c.with_signal_state(handler.state()),
        Err(e) => {
            eprintln!("Error: {}", e);
            process::exit(CiStatus::Exception.exit_code());
        }
    };

    let report = controller.run();
    println!("{}", report.summary.human_summary);
    for suite in &report.summary.suites {
        let message = suite.message.as_deref().unwrap_or("");
        println!("  {:<24} {:<8} {}", suite.suite, suite.verdict, message);
    }
    if let Some(path) = &report.summary_path {
        println!("Summary: {}", path.display());
    }
    if let Some(dir) = &report.logs_dir {
        println!("Logs: {}", dir.display());
    }
    process::exit(report.exit_code());
}

fn run_verify(path: &Path) {
    let config = load_config(path, Vec::new());
    if let Err(e) = RunContext::resolve(&config) {
        eprintln!("Configuration error: {}", e);
        process::exit(CiStatus::Exception.exit_code());
    }

    println!("Configuration valid: {}", path.display());
    println!();
    println!("  Devices: {}", config.devices.len());
    for (suite, device) in config.test_suites.iter().zip(config.bound_devices()) {
        let category = config.suites.get(suite).map(|s| s.category.as_str()).unwrap_or("?");
        println!("  {} ({}) -> {} [console {}]", suite, category, device.name, device.console_port);
    }
    if !config.packages.is_empty() {
        let names: Vec<&str> = config.packages.keys().map(String::as_str).collect();
        println!("  Packages: {}", names.join(", "));
    }
}

fn run_commands(path: &Path, suites: Vec<String>) {
    let config = load_config(path, suites);
    let ctx = match RunContext::resolve(&config) {
        Ok(ctx) => ctx,
        Err(e) => {
            eprintln!("Configuration error: {}", e);
            process::exit(CiStatus::Exception.exit_code());
        }
    };
    let dispatcher = Dispatcher::new(&config, &ctx, config.timing.to_timing().suite);

    let mut failed = false;
    for (suite, device) in config.test_suites.iter().zip(config.bound_devices()) {
        match dispatcher.command_for(suite, device) {
            Ok(command) => {
                println!("# {} on {} (cwd {})", suite, device.name, command.cwd.display());
                println!("{}", command.display());
            }
            Err(e) => {
                eprintln!("{}: {}", suite, e);
                failed = true;
            }
        }
    }
    if failed {
        process::exit(CiStatus::Exception.exit_code());
    }
}

fn run_classify(category: &str, exit_code: Option<i32>, suite: &str, config: Option<&Path>, log: &Path) {
    let classifier = match config {
        Some(path) => {
            let config = load_config(path, Vec::new());
            match config.classifier.build() {
                Ok(c) => c,
                Err(e) => {
                    eprintln!("Configuration error: {}", e);
                    process::exit(CiStatus::Exception.exit_code());
                }
            }
        }
        None => Classifier::new(ExitPolicy::default()),
    };

    let text = match std::fs::read(log) {
        Ok(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
        Err(e) => {
            eprintln!("Error reading {}: {}", log.display(), e);
            process::exit(CiStatus::Exception.exit_code());
        }
    };

    let classification = classifier.classify(category, &text, exit_code);
    eprintln!("{}", classification.summary_line(suite));
    match serde_json::to_string_pretty(&classification) {
        Ok(json) => println!("{}", json),
        Err(e) => {
            eprintln!("Error serializing output: {}", e);
            process::exit(CiStatus::Exception.exit_code());
        }
    }
    process::exit(classification.severity.ci_status().exit_code());
}
