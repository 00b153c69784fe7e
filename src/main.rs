use std::path::PathBuf;
use std::process::exit;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use log::info;
use tokio_util::sync::CancellationToken;

use rs485_archiver::config::{resolve_db_path, Layout, RemoteTarget};
use rs485_archiver::logging::{init_logging, LogTarget};
use rs485_archiver::sync::{SyncOutcome, SyncService};
use rs485_archiver::vcs::GitCli;

#[derive(Parser, Debug)]
#[command(name = "ems-sync", about = "Archive recorded samples to the remote repository")]
struct Args {
    /// Run a single pass and exit
    #[arg(long)]
    once: bool,
    /// Seconds between passes
    #[arg(long, default_value_t = 5)]
    interval: u64,
    /// Record database (overrides DB_PATH)
    #[arg(long)]
    db_path: Option<PathBuf>,
    /// Working tree holding historical_data/ and real_time_monitoring/
    #[arg(long, default_value = ".")]
    root: PathBuf,
    /// Log to stderr instead of historical_data/logs/sync.log
    #[arg(long)]
    log_stderr: bool,
}

fn main() {
    if let Err(e) = run() {
        eprintln!("Error: {e:#}");
        exit(1);
    }
}

fn run() -> Result<()> {
    let args = Args::parse();

    let layout = Layout::new(&args.root);
    layout
        .prepare()
        .with_context(|| format!("preparing directories under {}", args.root.display()))?;

    init_logging(if args.log_stderr {
        LogTarget::Stderr
    } else {
        LogTarget::File(layout.logs_dir().join("sync.log"))
    });

    let db_path = resolve_db_path(&layout, args.db_path);
    let remote = RemoteTarget::from_env();
    let interval = Duration::from_secs(args.interval.max(1));
    info!("database {}, remote {}", db_path.display(), remote);

    let vcs = GitCli::new(&layout.root);
    let mut service = SyncService::new(layout, db_path, interval, remote, Box::new(vcs));

    if args.once {
        match service.run_once().context("sync pass failed")? {
            SyncOutcome::Synced { records, files, .. } => {
                println!("synced {records} record(s) into {} file(s)", files.len())
            }
            other => println!("{other:?}"),
        }
        return Ok(());
    }

    service.run_forever(&CancellationToken::new());
    Ok(())
}
