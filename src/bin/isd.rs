//! isd - the dispatcher daemon (Component F)
//!
//! Pops signed job descriptors off the shared queue, authenticates the
//! submitter (cache hit, or decrypt+verify a fresh `isAuth` blob), and
//! routes the request onto that submitter's private queue, spawning an
//! `issupervisord` child process under the submitter's OS identity the
//! first time a given `(pid, esaf)` is seen.

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use is_kernel::auth::{derive_cipher_key, AuthAssertion};
use is_kernel::crypto::load_or_create_device_seed;
use is_kernel::dispatcher::{Dispatcher, SupervisorSpawner};
use is_kernel::queue::RedisQueueClient;
use is_kernel::Config;
use std::path::PathBuf;
use std::process::Command;
use std::sync::mpsc;

#[derive(Parser, Debug)]
#[command(author, version, about = "Image-serving dispatcher")]
struct Args {
    /// Path to a TOML or JSON config file.
    #[arg(long, env = "IS_KERNEL_CONFIG")]
    config: Option<PathBuf>,
    /// Path to the issupervisord binary spawned for each newly
    /// authenticated submitter.
    #[arg(long, default_value = "issupervisord")]
    supervisor_binary: PathBuf,
    /// Increase log verbosity (-v debug, -vv trace).
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

/// Spawns one `issupervisord` child process per newly authenticated
/// `(pid, esaf)`, handing privilege-drop to the OS via
/// [`std::os::unix::process::CommandExt::uid`]/`gid` rather than
/// forking in-process — the Rust-idiomatic equivalent of the original
/// fork()+setuid()+exec() sequence.
struct ProcessSupervisorSpawner {
    binary: PathBuf,
    config: Option<PathBuf>,
}

impl SupervisorSpawner for ProcessSupervisorSpawner {
    fn spawn(&self, assertion: &AuthAssertion) -> Result<String> {
        let private_key = format!("private:{}:{}", assertion.pid, assertion.esaf);
        let mut cmd = Command::new(&self.binary);
        cmd.arg("--private-key")
            .arg(&private_key)
            .arg("--uid")
            .arg(assertion.uid.to_string())
            .arg("--gid")
            .arg(assertion.gid.to_string());
        if let Some(cfg) = &self.config {
            cmd.env("IS_KERNEL_CONFIG", cfg);
        }
        #[cfg(target_os = "linux")]
        {
            use std::os::unix::process::CommandExt;
            cmd.uid(assertion.uid).gid(assertion.gid);
        }
        cmd.spawn()
            .with_context(|| format!("failed to spawn {}", self.binary.display()))?;
        Ok(private_key)
    }
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

    let verifying_key = config
        .auth
        .verifying_key()?
        .ok_or_else(|| anyhow!("auth.verifying_key_hex must be configured for isd"))?;
    // Load the symmetric seed from auth.key_path, creating it on first
    // run (or checking it against auth.key_seed if both are set).
    let key_seed = load_or_create_device_seed(&config.auth.key_path, config.auth.key_seed.as_deref())
        .with_context(|| format!("failed to load device key seed from {}", config.auth.key_path.display()))?;
    let cipher_key = derive_cipher_key(&key_seed);

    let shared_queue = RedisQueueClient::connect(&config.queue.shared_addr)
        .context("failed to connect to shared queue")?;
    let local_queue = RedisQueueClient::connect(&config.queue.local_addr)
        .context("failed to connect to local queue")?;

    let dispatcher = Dispatcher::new(
        &shared_queue,
        &config.queue.shared_key,
        &local_queue,
        cipher_key,
        verifying_key,
    );
    let spawner = ProcessSupervisorSpawner {
        binary: args.supervisor_binary.clone(),
        config: args.config.clone(),
    };

    let (tx, rx) = mpsc::channel();
    ctrlc::set_handler(move || {
        let _ = tx.send(());
    })
    .context("failed to install Ctrl-C handler")?;

    log::info!(
        "isd running: shared_queue={} local_queue={}",
        config.queue.shared_addr,
        config.queue.local_addr
    );

    loop {
        if rx.try_recv().is_ok() {
            log::info!("shutdown signal received, exiting");
            return Ok(());
        }
        // A connection failure or a malformed shared-queue reply is
        // environmental/protocol class (§7 class 2 in the design docs)
        // and propagates here as fatal; per-request failures are
        // already logged and swallowed inside `run_once`.
        dispatcher.run_once(&spawner)?;
    }
}
