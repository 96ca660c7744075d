//! `stampd`: digest batching and ledger anchoring daemon plus operator
//! tooling over the same store.

use std::fs::{self, File};
use std::io::{self, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use clap::{Parser, Subcommand};
use stampd_core::Side;
use stampd_node::{parse_hex32, write_file_atomic, NodeConfig, Scheduler};
use stampd_store::{
    dump, restore, BatchInfo, DigestStatus, FlushEngine, FlushOutcome, FsckOptions, Store,
    SystemClock,
};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "stampd")]
#[command(about = "stampd - batch digests and anchor them to a ledger", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Config file path
    #[arg(short, long, global = true, default_value = "stampd.toml")]
    config: PathBuf,

    /// Override `data_dir` from the config file
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the flush scheduler until interrupted
    Run,

    /// Submit digests (64 hex chars each)
    Put {
        #[arg(required = true)]
        digests: Vec<String>,
    },

    /// Show the status and inclusion proof of digests
    Lookup {
        #[arg(required = true)]
        digests: Vec<String>,
    },

    /// Run one flush cycle now
    Flush,

    /// Verify every batch and chase unconfirmed ones on the ledger
    Fsck {
        /// Log every batch root and member digest
        #[arg(long)]
        print_hashes: bool,

        /// Do not query the ledger
        #[arg(long)]
        skip_ledger: bool,

        /// Report pending digests older than this many seconds
        /// (default: stuck_multiple * flush_period_secs)
        #[arg(long)]
        stuck_after_secs: Option<u64>,
    },

    /// Export every batch and digest
    Dump {
        /// Aligned text instead of JSON lines
        #[arg(long)]
        human: bool,

        /// Write to this file instead of stdout
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Import a JSON-lines dump into an empty store ("-" reads stdin)
    Restore { input: PathBuf },

    /// Show the most recent confirmed batch
    LastAnchor,

    /// List the digests closed at the given flush times
    Timestamps {
        #[arg(required = true)]
        flush_times: Vec<i64>,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut cfg = NodeConfig::load(&cli.config)?;
    if let Some(dir) = cli.data_dir {
        cfg.data_dir = dir;
    }

    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_new(&cfg.log_filter)
            .with_context(|| format!("log_filter {:?}", cfg.log_filter))?
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .init();

    match cli.command {
        Commands::Run => {
            let runtime = tokio::runtime::Builder::new_multi_thread()
                .enable_all()
                .build()
                .context("start tokio runtime")?;
            runtime.block_on(cmd_run(&cfg))
        }
        Commands::Put { digests } => cmd_put(&cfg, &digests),
        Commands::Lookup { digests } => cmd_lookup(&cfg, &digests, cli.verbose),
        Commands::Flush => cmd_flush(&cfg),
        Commands::Fsck {
            print_hashes,
            skip_ledger,
            stuck_after_secs,
        } => cmd_fsck(
            &cfg,
            FsckOptions {
                verbose: cli.verbose,
                print_hashes,
                skip_ledger,
                stuck_after: stuck_after_secs.map(Duration::from_secs),
            },
        ),
        Commands::Dump { human, output } => cmd_dump(&cfg, human, output),
        Commands::Restore { input } => cmd_restore(&cfg, &input, cli.verbose),
        Commands::LastAnchor => cmd_last_anchor(&cfg),
        Commands::Timestamps { flush_times } => cmd_timestamps(&cfg, &flush_times),
    }
}

fn open_engine(cfg: &NodeConfig) -> Result<Arc<FlushEngine>> {
    fs::create_dir_all(&cfg.data_dir)
        .with_context(|| format!("create data dir {}", cfg.data_dir.display()))?;
    let db_path = cfg.db_path();
    let store = Store::open(&db_path).with_context(|| format!("open {}", db_path.display()))?;
    let ledger = cfg.build_ledger()?;
    Ok(Arc::new(FlushEngine::new(
        Arc::new(store),
        ledger,
        Arc::new(SystemClock),
        cfg.flush_config(),
    )))
}

fn parse_digests(values: &[String]) -> Result<Vec<[u8; 32]>> {
    values
        .iter()
        .map(|v| parse_hex32("digest", v).map_err(|e| anyhow!(e)))
        .collect()
}

async fn cmd_run(cfg: &NodeConfig) -> Result<()> {
    let engine = open_engine(cfg)?;
    let counts = engine.store().counts()?;
    info!(
        data_dir = %cfg.data_dir.display(),
        digests = counts.digests,
        pending = counts.pending,
        batches = counts.batches,
        "stampd starting"
    );
    let scheduler = Scheduler::spawn(engine.clone(), cfg.period(), cfg.offset());

    tokio::signal::ctrl_c()
        .await
        .context("wait for shutdown signal")?;
    info!("shutdown requested; draining");
    scheduler.shutdown().await;
    let drained = engine.clone();
    tokio::task::spawn_blocking(move || drained.drain())
        .await
        .context("drain flush engine")?;
    // Last handle: the redb file closes here, after the gate is released.
    drop(engine);
    info!("stampd stopped");
    Ok(())
}

fn cmd_put(cfg: &NodeConfig, values: &[String]) -> Result<()> {
    let digests = parse_digests(values)?;
    let engine = open_engine(cfg)?;
    for result in engine.put_many(&digests)? {
        let state = match (result.already_existed, result.batch) {
            (false, _) => "new".to_string(),
            (true, None) => "exists pending".to_string(),
            (true, Some(root)) => format!("exists batch={}", hex::encode(root)),
        };
        println!("{} {state}", hex::encode(result.digest));
    }
    Ok(())
}

fn print_batch(prefix: &str, batch: &BatchInfo) {
    print!(
        "{prefix}batch={} state={} flushed_at={}",
        hex::encode(batch.root),
        batch.state,
        batch.flushed_at
    );
    if let Some(tx_id) = &batch.tx_id {
        print!(" tx={tx_id}");
    }
    if let (Some(height), Some(time)) = (batch.chain_height, batch.chain_time) {
        print!(" height={height} chain_time={time}");
    }
    println!();
}

fn cmd_lookup(cfg: &NodeConfig, values: &[String], show_proof: bool) -> Result<()> {
    let digests = parse_digests(values)?;
    let engine = open_engine(cfg)?;
    let statuses = engine.store().get_many(&digests)?;
    for (digest, status) in digests.iter().zip(statuses) {
        let digest = hex::encode(digest);
        match status {
            DigestStatus::NotFound => println!("{digest} not-found"),
            DigestStatus::Pending { submitted_at } => {
                println!("{digest} pending submitted_at={submitted_at}")
            }
            DigestStatus::Anchored {
                submitted_at,
                batch,
                proof,
            } => {
                print_batch(&format!("{digest} submitted_at={submitted_at} "), &batch);
                if show_proof {
                    println!("  index={} verifies={}", proof.index, proof.verify(&batch.root));
                    for step in &proof.steps {
                        let side = match step.side {
                            Side::Left => "L",
                            Side::Right => "R",
                        };
                        println!("  {side} {}", hex::encode(step.sibling));
                    }
                }
            }
        }
    }
    Ok(())
}

fn cmd_flush(cfg: &NodeConfig) -> Result<()> {
    let engine = open_engine(cfg)?;
    match engine.flush()? {
        FlushOutcome::Completed(summary) => {
            match summary.batch {
                Some(root) => println!(
                    "closed batch {} with {} digests (commit {})",
                    hex::encode(root),
                    summary.digests,
                    summary.commit.unwrap_or_default()
                ),
                None => println!("no pending digests"),
            }
            println!(
                "submitted={} failed={} confirmed={} unconfirmed={} ledger_errors={}",
                summary.submitted.len(),
                summary.failed.len(),
                summary.confirmed.len(),
                summary.still_unconfirmed,
                summary.ledger_errors
            );
            for anomaly in &summary.anomalies {
                println!("anomaly {}: {}", anomaly.code, anomaly.detail);
            }
        }
        FlushOutcome::Busy => println!("flush already in progress"),
        FlushOutcome::Closed => println!("engine closed"),
    }
    Ok(())
}

fn cmd_fsck(cfg: &NodeConfig, opts: FsckOptions) -> Result<()> {
    let engine = open_engine(cfg)?;
    let report = engine.fsck(&opts)?;
    println!(
        "batches={} digests={} pending={} confirmed={} failed={} unconfirmed={} ledger_errors={}",
        report.batches_checked,
        report.digests_checked,
        report.pending,
        report.confirmed.len(),
        report.failed.len(),
        report.still_unconfirmed,
        report.ledger_errors
    );
    for finding in &report.findings {
        let subject = finding.subject.map(hex::encode).unwrap_or_default();
        println!("{} {subject} {}", finding.code, finding.detail);
    }
    if !report.is_clean() {
        bail!("fsck found {} problem(s)", report.findings.len());
    }
    Ok(())
}

fn cmd_dump(cfg: &NodeConfig, human: bool, output: Option<PathBuf>) -> Result<()> {
    let engine = open_engine(cfg)?;
    let stats = match output {
        Some(path) => {
            let mut buf = Vec::new();
            let stats = dump(engine.store(), &mut buf, human)?;
            write_file_atomic(&path, &buf).map_err(|e| anyhow!(e))?;
            stats
        }
        None => {
            let stdout = io::stdout();
            let mut out = stdout.lock();
            let stats = dump(engine.store(), &mut out, human)?;
            out.flush()?;
            stats
        }
    };
    info!(batches = stats.batches, digests = stats.digests, "dump complete");
    Ok(())
}

fn cmd_restore(cfg: &NodeConfig, input: &Path, verbose: bool) -> Result<()> {
    let engine = open_engine(cfg)?;
    let target = cfg.db_path().display().to_string();
    let stats = if input.as_os_str() == "-" {
        restore(engine.store(), io::stdin().lock(), verbose, &target)?
    } else {
        let file = File::open(input).with_context(|| format!("open {}", input.display()))?;
        restore(engine.store(), BufReader::new(file), verbose, &target)?
    };
    println!("restored {} batches, {} digests", stats.batches, stats.digests);
    Ok(())
}

fn cmd_last_anchor(cfg: &NodeConfig) -> Result<()> {
    let engine = open_engine(cfg)?;
    match engine.store().last_anchor()? {
        Some(batch) => print_batch("", &batch),
        None => println!("no confirmed batch"),
    }
    Ok(())
}

fn cmd_timestamps(cfg: &NodeConfig, flush_times: &[i64]) -> Result<()> {
    let engine = open_engine(cfg)?;
    for collection in engine.get_timestamps(flush_times)? {
        print_batch(&format!("flushed_at={} ", collection.flushed_at), &collection.batch);
        for digest in &collection.digests {
            println!("  {}", hex::encode(digest));
        }
    }
    Ok(())
}
