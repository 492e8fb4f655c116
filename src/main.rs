#![forbid(unsafe_code)]

use directories::ProjectDirs;
use error_iter::ErrorIter as _;
use is_terminal::IsTerminal as _;
use mempaper_wallet::client::mempool::{MempoolClient, MempoolClientError};
use mempaper_wallet::config::{ConfigError, ConfigStore};
use mempaper_wallet::core::{CoreError, CorePaths, NoPriceOracle, SystemClock, WalletCore};
use mempaper_wallet::rewards::RewardError;
use mempaper_wallet::secure::{SecureError, SecureStore};
use onlyargs::CliError;
use onlyargs_derive::OnlyArgs;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::{env, fs};
use thiserror::Error;
use tracing::debug;
use tracing_subscriber::filter::{EnvFilter, LevelFilter};
use tracing_subscriber::prelude::*;

#[derive(Debug, OnlyArgs)]
#[footer = "Environment variables:"]
#[footer = "  - RUST_LOG configures log verbosity, e.g. RUST_LOG=debug"]
#[footer = "  - TERM_COLOR accepts \"always\" to override automatic terminal sensing"]
struct Args {
    /// Directory holding config.json and config.secure.json.
    ///   Default is the user configuration directory.
    #[long]
    config_dir: Option<PathBuf>,

    /// Directory holding the cache files and the encryption salt.
    ///   Default is the user cache directory.
    #[long]
    data_dir: Option<PathBuf>,

    /// Answer from caches only; never block on the network for
    ///   extended-key scans.
    startup: bool,

    /// Print the last persisted wallet snapshot and exit.
    cached: bool,

    /// Reconcile and sync the block-reward monitoring table to the chain
    ///   tip instead of fetching wallet balances.
    #[long]
    sync_rewards: bool,
}

#[derive(Debug, Error)]
enum Error {
    #[error("Argument parsing error")]
    Args(#[from] CliError),

    #[error("Unable to locate user directories")]
    ProjectDirs,

    #[error("Configuration error")]
    Config(#[from] ConfigError),

    #[error("Secure storage error")]
    Secure(#[from] SecureError),

    #[error("REST client error")]
    Client(#[from] MempoolClientError),

    #[error("Engine error")]
    Core(#[from] CoreError),

    #[error("Block reward error")]
    Reward(#[from] RewardError),

    #[error("I/O error")]
    Io(#[from] std::io::Error),

    #[error("JSON error")]
    Json(#[from] serde_json::Error),
}

fn main() -> ExitCode {
    // Initialize the tracing subscriber for instrumentation.
    // Uses the `RUST_LOG` environment var for configuration. E.g. `RUST_LOG=debug cargo run`
    //
    // See: https://docs.rs/tracing-subscriber/latest/tracing_subscriber/struct.EnvFilter.html#directives
    let env_filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::INFO.into())
        .from_env_lossy();
    let term_color = env::var("TERM_COLOR")
        .map(|color| color == "always")
        .unwrap_or_else(|_| std::io::stdout().is_terminal());
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_ansi(term_color))
        .with(env_filter)
        .init();

    match run(onlyargs::parse()) {
        Ok(_) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("Error: {err}");
            for source in err.sources().skip(1) {
                eprintln!("  Caused by: {source}");
            }

            ExitCode::FAILURE
        }
    }
}

fn run(args: Result<Args, CliError>) -> Result<(), Error> {
    let args = args?;

    let project_dir =
        ProjectDirs::from("org", "mempaper", "mempaper-wallet").ok_or(Error::ProjectDirs)?;
    let config_dir = args
        .config_dir
        .unwrap_or_else(|| project_dir.config_dir().to_path_buf());
    let data_dir = args
        .data_dir
        .unwrap_or_else(|| project_dir.cache_dir().to_path_buf());
    fs::create_dir_all(&data_dir)?;

    debug!("Config dir: {config_dir:?}, data dir: {data_dir:?}");

    let paths = CorePaths::new(&data_dir);
    let store = Arc::new(SecureStore::open(&paths.salt)?);
    let config = ConfigStore::new(config_dir, store.clone()).load()?;
    let client = Arc::new(MempoolClient::new(&config)?);

    let core = Arc::new(WalletCore::with_parts(
        config,
        client,
        store,
        paths,
        Arc::new(NoPriceOracle),
        Arc::new(SystemClock),
    )?);

    if args.cached {
        match core.cached_wallet_balances() {
            Some(snapshot) => println!("{}", serde_json::to_string_pretty(&snapshot)?),
            None => eprintln!("No cached wallet snapshot yet"),
        }
        return Ok(());
    }

    if args.sync_rewards {
        let table: Vec<String> = core
            .config
            .block_reward_addresses_table
            .iter()
            .map(|entry| entry.address.clone())
            .collect();

        core.rewards
            .update_monitored_addresses(&*core.client, &table)?;
        core.rewards.sync_all(&*core.client)?;

        println!("{}", serde_json::to_string_pretty(&core.rewards.stats())?);
        return Ok(());
    }

    // Warm the derivation cache in the background before a live fetch, the
    // way the daemon queues a rebuild on startup. The gap-limit admission
    // set keeps the worker and the fetch below from scanning the same key
    // twice. Startup mode skips this: it must answer from caches alone and
    // exit without waiting on background scans.
    let rebuild_worker = (!args.startup).then(|| {
        let worker = core.spawn_rebuild_worker();
        worker.notify(core.rebuild_request());
        worker
    });

    let report = core.fetch_wallet_balances(args.startup);
    println!("{}", serde_json::to_string_pretty(&report)?);

    if let Some(worker) = rebuild_worker {
        worker.stop();
    }

    Ok(())
}
