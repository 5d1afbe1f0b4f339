//! issupervisord - one supervisor process (Component E)
//!
//! Normally spawned by `isd` already running under the target
//! submitter's uid/gid (via `Command::uid`/`gid` at process creation).
//! `--uid`/`--gid` let it also be run standalone — for local testing,
//! or when the launcher could not drop privilege at spawn time — in
//! which case it assumes the identity itself before starting any
//! worker.

use anyhow::{Context, Result};
use clap::Parser;
use is_kernel::queue::{QueueClient, RedisQueueClient};
use is_kernel::supervisor::Supervisor;
use is_kernel::worker::QueueResultSink;
use is_kernel::Config;
use std::path::PathBuf;
use std::sync::{mpsc, Arc};

#[derive(Parser, Debug)]
#[command(author, version, about = "Per-user image-serving worker pool")]
struct Args {
    #[arg(long, env = "IS_KERNEL_CONFIG")]
    config: Option<PathBuf>,
    /// Private queue key this supervisor's workers pop jobs from.
    #[arg(long)]
    private_key: String,
    /// Assume this uid before starting workers.
    #[arg(long)]
    uid: Option<u32>,
    /// Assume this gid before starting workers.
    #[arg(long)]
    gid: Option<u32>,
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

fn main() -> Result<()> {
    let args = Args::parse();
    let level = match args.verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();

    if let Some(path) = &args.config {
        std::env::set_var("IS_KERNEL_CONFIG", path);
    }
    let config = Config::load().context("failed to load configuration")?;

    if let (Some(uid), Some(gid)) = (args.uid, args.gid) {
        assume_identity(uid, gid)?;
    }

    let local_queue: Arc<dyn QueueClient> = Arc::new(
        RedisQueueClient::connect(&config.queue.local_addr)
            .context("failed to connect to local queue")?,
    );
    let sink = Arc::new(QueueResultSink::new(local_queue.clone()));

    let supervisor = Supervisor::start(
        args.private_key.clone(),
        local_queue,
        config.metadata.property_table_path.clone(),
        config.supervisor.n_worker_threads,
        sink,
    )
    .with_context(|| format!("failed to start supervisor for {}", args.private_key))?;

    let (tx, rx) = mpsc::channel();
    ctrlc::set_handler(move || {
        let _ = tx.send(());
    })
    .context("failed to install Ctrl-C handler")?;

    log::info!(
        "issupervisord running for {} with {} worker threads",
        args.private_key,
        config.supervisor.n_worker_threads
    );
    let _ = rx.recv();
    log::info!("shutdown signal received, tearing down workers for {}", args.private_key);
    supervisor.shutdown()
}

#[cfg(target_os = "linux")]
fn assume_identity(uid: u32, gid: u32) -> Result<()> {
    use is_kernel::process_identity::{Identity, IdentitySwitcher, UnixIdentitySwitcher};
    UnixIdentitySwitcher
        .assume(Identity { uid, gid })
        .context("failed to assume target identity")
}

#[cfg(not(target_os = "linux"))]
fn assume_identity(uid: u32, gid: u32) -> Result<()> {
    log::warn!(
        "identity switch to uid={} gid={} requested but unsupported on this platform",
        uid,
        gid
    );
    Ok(())
}
