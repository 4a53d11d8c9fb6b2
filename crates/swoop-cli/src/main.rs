use anyhow::Result;
use clap::{Parser, Subcommand, ValueEnum};
use serde_json::{json, Value};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing_subscriber::{fmt, EnvFilter};

use swoop_runner::{
    collect_results, expand_jobs, write_batch_report, write_jsonl, BatchOutcome, BenchmarkVariant,
    CommandFrequencyController, Engine, EngineError, ExperimentConfig, JobDescriptor, Notifier,
    NullNotifier, SendmailNotifier, VariantFamily,
};

#[derive(Parser)]
#[command(name = "swoop", version, about = "Compiler-variant benchmark runner")]
struct Cli {
    /// Log at debug level (RUST_LOG still wins when set).
    #[arg(short, long, global = true)]
    verbose: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum InputArg {
    Ref,
    Train,
    Test,
    All,
}

impl InputArg {
    fn as_str(self) -> &'static str {
        match self {
            InputArg::Ref => "ref",
            InputArg::Train => "train",
            InputArg::Test => "test",
            InputArg::All => "all",
        }
    }
}

#[derive(clap::Args)]
struct Selection {
    /// Experiment file; built-in defaults when omitted.
    experiment: Option<PathBuf>,
    /// Benchmark variants to run, e.g. `429.mcf.orig,429.mcf.sw`.
    #[arg(short, long, value_delimiter = ',')]
    benchmarks: Option<Vec<String>>,
    #[arg(short, long, value_enum)]
    input: Option<InputArg>,
    /// Keep only the `.orig` variants of the selected benchmarks.
    #[arg(long)]
    orig_only: bool,
}

#[derive(Subcommand)]
enum Commands {
    Run {
        #[command(flatten)]
        selection: Selection,
        /// `perf stat -r` repetitions per job.
        #[arg(short, long)]
        repeat: Option<u32>,
        /// Send progress mail through sendmail.
        #[arg(long)]
        mail: bool,
        #[arg(short = 'n', long)]
        dry_run: bool,
        #[arg(long)]
        json: bool,
    },
    Describe {
        #[command(flatten)]
        selection: Selection,
        #[arg(long)]
        json: bool,
    },
    Decode {
        name: String,
        #[arg(long)]
        json: bool,
    },
    Collect {
        runs_root: PathBuf,
        #[arg(short, long, default_value = "results.jsonl")]
        out: PathBuf,
        #[arg(long)]
        json: bool,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);
    let json_mode = command_json_mode(&cli.command);
    let result = run_command(cli.command);
    match result {
        Ok(Some(payload)) => {
            emit_json(&payload);
            Ok(())
        }
        Ok(None) => Ok(()),
        Err(err) => {
            let interrupted = err.downcast_ref::<EngineError>().is_some();
            if json_mode {
                let code = if interrupted { "interrupted" } else { "command_failed" };
                emit_json(&json_error(code, format!("{:#}", err), json!({})));
            } else if interrupted {
                eprintln!("error: {}", err);
            } else {
                return Err(err);
            }
            std::process::exit(if interrupted { 130 } else { 1 });
        }
    }
}

fn init_tracing(verbose: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(if verbose { "debug" } else { "info" })
    });
    fmt::Subscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

fn run_command(command: Commands) -> Result<Option<Value>> {
    match command {
        Commands::Run {
            selection,
            repeat,
            mail,
            dry_run,
            json,
        } => {
            let mut config = load_config(&selection)?;
            if let Some(repeat) = repeat {
                config.repeat = repeat;
            }
            if mail {
                config.notify.enabled = true;
            }
            let catalog = config.load_catalog()?;
            let host = config.host_name();
            let descriptors = expand_jobs(&config, &catalog, &host)?;

            let cancel = Arc::new(AtomicBool::new(false));
            let flag = cancel.clone();
            ctrlc::set_handler(move || flag.store(true, Ordering::SeqCst))?;

            let frequency = Box::new(CommandFrequencyController::new(
                config.frequency_tool.clone(),
                config.settle_delay(),
            ));
            let notifier: Box<dyn Notifier> = if config.notify.enabled && !dry_run {
                Box::new(SendmailNotifier::new(&config.notify, &host))
            } else {
                Box::new(NullNotifier)
            };
            let mut engine =
                Engine::new(&config, &catalog, frequency, notifier, cancel)?.dry_run(dry_run);
            let outcome = engine.run_batch(&descriptors)?;
            let report_path = if dry_run {
                None
            } else {
                Some(write_batch_report(&config.runs_root, &outcome)?)
            };

            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "run",
                    "host": host,
                    "jobs": descriptors.len(),
                    "report_path": report_path,
                    "outcome": serde_json::to_value(&outcome)?
                })));
            }
            print_outcome(&host, descriptors.len(), &outcome);
            if let Some(path) = report_path {
                println!("report: {}", path.display());
            }
        }
        Commands::Describe { selection, json } => {
            let config = load_config(&selection)?;
            let catalog = config.load_catalog()?;
            let host = config.host_name();
            let descriptors = expand_jobs(&config, &catalog, &host)?;
            if json {
                let jobs: Vec<Value> = descriptors.iter().map(descriptor_to_json).collect();
                return Ok(Some(json!({
                    "ok": true,
                    "command": "describe",
                    "host": host,
                    "input": config.input,
                    "runs_root": config.runs_root,
                    "sources_root": config.sources_root,
                    "jobs": jobs
                })));
            }
            println!("host: {}", host);
            println!("input: {}", config.input);
            println!("runs_root: {}", config.runs_root.display());
            println!("sources_root: {}", config.sources_root.display());
            println!("jobs: {}", descriptors.len());
            for d in &descriptors {
                println!("  {}  ({})", d.encode(), d.binary_name());
            }
        }
        Commands::Decode { name, json } => {
            let descriptor = JobDescriptor::decode(&name)?;
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "decode",
                    "job": descriptor_to_json(&descriptor)
                })));
            }
            print_descriptor(&descriptor);
        }
        Commands::Collect {
            runs_root,
            out,
            json,
        } => {
            let records = collect_results(&runs_root)?;
            write_jsonl(&out, &records)?;
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "collect",
                    "runs_root": runs_root,
                    "records": records.len(),
                    "out": out
                })));
            }
            println!("records: {}", records.len());
            println!("out: {}", out.display());
        }
    }
    Ok(None)
}

fn load_config(selection: &Selection) -> Result<ExperimentConfig> {
    let mut config = match &selection.experiment {
        Some(path) => ExperimentConfig::load(path)?,
        None => ExperimentConfig::default(),
    };
    if let Some(benchmarks) = &selection.benchmarks {
        config.benchmarks = benchmarks.clone();
    }
    if let Some(input) = selection.input {
        config.input = input.as_str().to_string();
    }
    if selection.orig_only {
        config.benchmarks.retain(|b| is_original_or_unknown(b));
    }
    Ok(config)
}

/// Unparseable ids are kept so expansion reports them.
fn is_original_or_unknown(id: &str) -> bool {
    BenchmarkVariant::parse(id).map_or(true, |v| v.family == VariantFamily::Original)
}

fn descriptor_to_json(d: &JobDescriptor) -> Value {
    json!({
        "name": d.encode(),
        "binary": d.binary_name(),
        "host": d.host,
        "frequency": d.frequency,
        "benchmark": d.benchmark(),
        "variant": d.variant.id(),
        "kind": d.kind.as_str(),
        "unroll": d.unroll,
        "indirection": d.indirection,
        "hoist": d.hoist,
        "scheduler": d.scheduler_name(),
        "input": d.input.to_string()
    })
}

fn print_descriptor(d: &JobDescriptor) {
    println!("name: {}", d.encode());
    println!("host: {}", d.host);
    println!("frequency: {}", d.frequency);
    println!("benchmark: {}", d.benchmark());
    println!("variant: {}", d.variant.id());
    println!("kind: {}", d.kind.as_str());
    println!("binary: {}", d.binary_name());
    if let Some(u) = d.unroll {
        println!("unroll: {}", u);
    }
    if let Some(i) = d.indirection {
        println!("indirection: {}", i);
    }
    if let Some(h) = &d.hoist {
        println!("hoist: {}", h);
    }
    println!("scheduler: {}", d.scheduler_name());
    println!("input: {}", d.input);
}

fn print_outcome(host: &str, expanded: usize, outcome: &BatchOutcome) {
    println!("host: {}", host);
    println!("jobs: {}", expanded);
    println!("dropped: {}", outcome.dropped.len());
    println!("skipped: {}", outcome.skipped.len());
    if outcome.dry_run {
        for (name, command) in &outcome.planned {
            println!("{}: {}", name, command);
        }
        return;
    }
    println!("executed: {}", outcome.results.len());
    println!("failed: {}", outcome.failures());
    for entry in &outcome.report {
        println!("{}", entry);
    }
}

fn emit_json(value: &Value) {
    match serde_json::to_string(value) {
        Ok(s) => println!("{}", s),
        Err(_) => println!(
            "{{\"ok\":false,\"error\":{{\"code\":\"serialization_error\",\"message\":\"failed to serialize JSON payload\",\"details\":{{}}}}}}"
        ),
    }
}

fn json_error(code: &str, message: String, details: Value) -> Value {
    json!({
        "ok": false,
        "error": {
            "code": code,
            "message": message,
            "details": details
        }
    })
}

fn command_json_mode(command: &Commands) -> bool {
    match command {
        Commands::Run { json, .. }
        | Commands::Describe { json, .. }
        | Commands::Decode { json, .. }
        | Commands::Collect { json, .. } => *json,
    }
}
