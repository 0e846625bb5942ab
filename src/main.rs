//! # convo-evidence CLI (`cev`)
//!
//! The `cev` binary drives batch exports, verifies evidence files and
//! reports on thinking-block coverage.
//!
//! ## Usage
//!
//! ```bash
//! cev --config ./config/cev.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `cev run` | Export every catalog item as an evidence file |
//! | `cev verify <FILE>...` | Recompute digests and schema checks |
//! | `cev diagnose <DIR>` | Thinking-block diagnostics over evidence files |
//! | `cev inspect <FIXTURE>` | Print the structured section of one fixture |
//!
//! Results go to stdout; logs and progress go to stderr.

use std::path::{Path, PathBuf};

use anyhow::Context;
use clap::{Parser, Subcommand, ValueEnum};
use tracing_subscriber::EnvFilter;

use convo_evidence::config::{self, Config};
use convo_evidence::diagnose;
use convo_evidence::identity::IdentityNormalizer;
use convo_evidence::integrity::VerificationReport;
use convo_evidence::orchestrator::{ItemPipeline, Orchestrator};
use convo_evidence::progress::ProgressMode;
use convo_evidence::replay::{ReplayCatalog, ReplayDocument, ReplaySource};
use convo_evidence::sink::DirectorySink;
use convo_evidence::traits::UNTITLED;

/// convo-evidence CLI: export windowed conversations as verifiable evidence.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file. See `config/cev.example.toml` for a full example.
#[derive(Parser)]
#[command(
    name = "cev",
    about = "Export conversations, with revealed thinking, as hash-verifiable evidence files",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    ///
    /// Defaults to `./config/cev.toml`. `inspect` falls back to built-in
    /// defaults when the file is missing; `verify` and `diagnose` ignore it.
    #[arg(long, global = true, default_value = "./config/cev.toml")]
    config: PathBuf,

    /// Emit logs as JSON lines on stderr.
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, ValueEnum)]
enum ProgressArg {
    Human,
    Json,
    Off,
}

impl From<ProgressArg> for ProgressMode {
    fn from(arg: ProgressArg) -> Self {
        match arg {
            ProgressArg::Human => ProgressMode::Human,
            ProgressArg::Json => ProgressMode::Json,
            ProgressArg::Off => ProgressMode::Off,
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Export every catalog item.
    ///
    /// Visits the configured fixture catalog in order, reveals thinking
    /// content, assembles and hashes each conversation and writes one
    /// evidence file per item to `output.dir`. Per-item failures are
    /// reported and skipped.
    Run {
        /// Maximum number of items to visit (overrides `batch.limit`).
        #[arg(long)]
        limit: Option<usize>,

        /// Progress output on stderr. Defaults to `human` on a terminal.
        #[arg(long, value_enum)]
        progress: Option<ProgressArg>,

        /// List items and their normalized identities without extracting.
        #[arg(long)]
        dry_run: bool,
    },

    /// Verify evidence files.
    ///
    /// Recomputes both digests and the structured invariants. Exits non-zero
    /// if any file fails.
    Verify {
        #[arg(required = true)]
        files: Vec<PathBuf>,
    },

    /// Thinking-block diagnostics over a directory of evidence files.
    Diagnose {
        dir: PathBuf,

        /// Print the report as JSON.
        #[arg(long)]
        json: bool,
    },

    /// Reveal, extract and assemble one fixture, printing the structured
    /// section as JSON. Nothing is written.
    Inspect { fixture: PathBuf },
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("convo_evidence=warn,cev=warn"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn load_or_default(path: &Path) -> anyhow::Result<Config> {
    if path.exists() {
        config::load_config(path)
    } else {
        Ok(Config::minimal())
    }
}

async fn run(
    cfg: &Config,
    limit: Option<usize>,
    progress: Option<ProgressArg>,
    dry_run: bool,
) -> anyhow::Result<()> {
    let catalog = ReplayCatalog::new(cfg.source.clone(), cfg.selectors.clone());
    let sink = DirectorySink::new(&cfg.output.dir);
    let mut orchestrator = Orchestrator::new(cfg, Box::new(catalog), Box::new(sink))?;
    if let Some(limit) = limit {
        orchestrator = orchestrator.with_limit(limit);
    }

    if dry_run {
        let plan = orchestrator.plan().await?;
        println!("{:<5} {:<28} {:<28} {}", "#", "IDENTITY", "KEY", "TITLE");
        for (i, p) in plan.iter().enumerate() {
            let title = p.item.title.as_deref().unwrap_or(UNTITLED);
            let note = match p.duplicate_of {
                Some(j) => format!("  (duplicate of #{})", j + 1),
                None => String::new(),
            };
            println!(
                "{:<5} {:<28} {:<28} {}{}",
                i + 1,
                p.item.identity,
                p.key,
                title,
                note
            );
        }
        println!("{} items", plan.len());
        return Ok(());
    }

    let control = orchestrator.control();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("cancelling after the current item...");
            control.cancel();
        }
    });

    let mode = progress
        .map(ProgressMode::from)
        .unwrap_or_else(ProgressMode::default_for_tty);
    let reporter = mode.reporter();
    let summary = orchestrator.run(reporter.as_ref()).await?;

    println!("succeeded:         {}", summary.succeeded);
    println!("skipped:           {}", summary.skipped);
    println!("failed:            {}", summary.failed);
    println!("revelation_errors: {}", summary.revelation_errors);
    if summary.cancelled {
        println!("cancelled:         true");
    }
    Ok(())
}

fn verify(files: &[PathBuf]) -> bool {
    let mut all_passed = true;
    for file in files {
        let report = match std::fs::read_to_string(file) {
            Ok(json) => VerificationReport::for_json(&json),
            Err(e) => {
                println!("FAIL  {}  cannot read: {}", file.display(), e);
                all_passed = false;
                continue;
            }
        };
        if report.passed() {
            println!("PASS  {}", file.display());
        } else {
            all_passed = false;
            println!("FAIL  {}", file.display());
            for failure in &report.failures {
                println!("      {} ({})", failure, failure.kind());
            }
        }
    }
    all_passed
}

async fn inspect(cfg: &Config, fixture: &Path) -> anyhow::Result<()> {
    let doc = ReplayDocument::load(fixture)?;
    let item_id = IdentityNormalizer::new(&cfg.batch.identity_prefixes).normalize(&doc.identity);
    let title = doc.title.clone().unwrap_or_else(|| UNTITLED.to_string());
    let url = doc
        .url
        .clone()
        .unwrap_or_else(|| format!("file://{}", fixture.display()));
    let source = ReplaySource::with_selectors(doc, cfg.selectors.clone());

    let pipeline = ItemPipeline::from_config(cfg)?;
    let revealed = pipeline.reveal(&source).await?;
    if let Some(failure) = &revealed.failure {
        eprintln!("warning: {}", failure);
    }
    let (_, structured) = pipeline
        .assemble(&source, &revealed, &item_id, &title, &url)
        .await?;
    println!(
        "{}",
        serde_json::to_string_pretty(&structured).context("Failed to serialize structured data")?
    );
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_json);

    match cli.command {
        Commands::Run {
            limit,
            progress,
            dry_run,
        } => {
            let cfg = config::load_config(&cli.config)?;
            run(&cfg, limit, progress, dry_run).await?;
        }
        Commands::Verify { files } => {
            if !verify(&files) {
                std::process::exit(1);
            }
        }
        Commands::Diagnose { dir, json } => {
            let report = diagnose::diagnose_dir(&dir)?;
            if json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                diagnose::print_report(&dir, &report);
            }
        }
        Commands::Inspect { fixture } => {
            let cfg = load_or_default(&cli.config)?;
            inspect(&cfg, &fixture).await?;
        }
    }

    Ok(())
}
