//! The process-wide context for the wallet-scanning engine.
//!
//! Everything the subsystems share — configuration, the REST client, cache
//! handles, worker pools, the gap-limit admission set — lives on one
//! [`WalletCore`] value instead of module globals. That removes init-order
//! hazards and lets tests build fully isolated instances.

use crate::client::mempool::{MempoolClient, MempoolClientError};
use crate::client::{ChainApi, PoolError, WorkerPools};
use crate::config::{Config, ConfigError};
use crate::derivation::{DerivationCache, GapScanFn, RebuildRequest, RebuildWorker};
use crate::rewards::RewardCache;
use crate::scan::optimized::OptimizedStore;
use crate::secure::{Envelope, SecureError, SecureStore};
use crate::wallet::WalletSnapshot;
use parking_lot::Mutex;
use rust_decimal::Decimal;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;
use tracing::warn;

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("configuration error")]
    Config(#[from] ConfigError),

    #[error("secure storage error")]
    Secure(#[from] SecureError),

    #[error("thread pool error")]
    Pool(#[from] PoolError),

    #[error("REST client error")]
    Client(#[from] MempoolClientError),
}

/// Wall-clock seconds, injectable for isolated tests.
pub trait Clock: Send + Sync {
    /// Unix timestamp in seconds.
    fn now(&self) -> u64;
}

pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|elapsed| elapsed.as_secs())
            .unwrap_or(0)
    }
}

/// The fiat-price collaborator. The engine only consumes a rate; fetching
/// one is somebody else's job.
pub trait PriceOracle: Send + Sync {
    /// Current BTC price in `currency`, if the oracle has one.
    fn rate(&self, currency: &str) -> Option<Decimal>;
}

/// Oracle used when no price source is wired up. Fiat totals come out as 0.
pub struct NoPriceOracle;

impl PriceOracle for NoPriceOracle {
    fn rate(&self, _currency: &str) -> Option<Decimal> {
        None
    }
}

/// Filesystem layout of everything the engine persists.
pub struct CorePaths {
    /// The 32-byte salt backing the device-bound encryption key.
    pub salt: PathBuf,
    pub derivation_cache: PathBuf,
    pub optimized_balance: PathBuf,
    pub block_rewards: PathBuf,
    pub wallet_snapshot: PathBuf,
}

impl CorePaths {
    pub fn new(data_dir: &Path) -> Self {
        Self {
            salt: data_dir.join(".cache_key"),
            derivation_cache: data_dir.join("wallet_address_cache.secure.json"),
            optimized_balance: data_dir.join("optimized_balance_cache.json"),
            block_rewards: data_dir.join("block_reward_cache.json"),
            wallet_snapshot: data_dir.join("wallet_balance_cache.secure.json"),
        }
    }
}

pub struct WalletCore {
    pub config: Config,
    pub client: Arc<dyn ChainApi>,
    pub store: Arc<SecureStore>,
    pub derivation: Arc<DerivationCache>,
    pub optimized: OptimizedStore,
    pub rewards: RewardCache,
    pub pools: WorkerPools,
    pub oracle: Arc<dyn PriceOracle>,
    pub clock: Arc<dyn Clock>,

    /// Extended keys with a gap-limit scan in flight. The lock guards only
    /// this set, never the scans themselves.
    pub(crate) active_detections: Mutex<HashSet<String>>,

    /// Non-reentrant aggregator gate; contenders fail fast.
    pub(crate) fetch_lock: Mutex<()>,

    /// Short-lived per-key balance cache: key → (sats, fetched-at).
    pub(crate) balance_ttl: Mutex<HashMap<String, (u64, u64)>>,

    snapshot_path: PathBuf,
}

impl WalletCore {
    /// Production wiring: device-bound store, blocking REST client, system
    /// clock, no price oracle.
    pub fn open(data_dir: &Path, config: Config) -> Result<Self, CoreError> {
        let paths = CorePaths::new(data_dir);
        let store = Arc::new(SecureStore::open(&paths.salt)?);
        let client = Arc::new(MempoolClient::new(&config)?);

        Self::with_parts(
            config,
            client,
            store,
            paths,
            Arc::new(NoPriceOracle),
            Arc::new(SystemClock),
        )
    }

    /// Assemble a core from explicit collaborators.
    pub fn with_parts(
        config: Config,
        client: Arc<dyn ChainApi>,
        store: Arc<SecureStore>,
        paths: CorePaths,
        oracle: Arc<dyn PriceOracle>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, CoreError> {
        config.validate()?;

        Ok(Self {
            derivation: Arc::new(DerivationCache::new(paths.derivation_cache, store.clone())),
            optimized: OptimizedStore::new(paths.optimized_balance),
            rewards: RewardCache::open(paths.block_rewards, clock.clone()),
            pools: WorkerPools::new()?,
            config,
            client,
            store,
            oracle,
            clock,
            active_detections: Mutex::new(HashSet::new()),
            fetch_lock: Mutex::new(()),
            balance_ttl: Mutex::new(HashMap::new()),
            snapshot_path: paths.wallet_snapshot,
        })
    }

    /// Aggregate every configured wallet entry into one report. See
    /// [`crate::wallet::fetch_wallet_balances`].
    pub fn fetch_wallet_balances(&self, startup_mode: bool) -> crate::wallet::WalletReport {
        crate::wallet::fetch_wallet_balances(self, startup_mode)
    }

    /// The last successfully fetched snapshot, decoupling render consumers
    /// from fetch latency. Never touches the network.
    pub fn cached_wallet_balances(&self) -> Option<WalletSnapshot> {
        match self.store.load_as(&self.snapshot_path) {
            Ok(snapshot) => snapshot,
            Err(err) => {
                warn!("Unreadable wallet snapshot cache: {err}");
                None
            }
        }
    }

    pub(crate) fn persist_snapshot(&self, snapshot: &WalletSnapshot) {
        if let Err(err) =
            self.store
                .save_as(&self.snapshot_path, Envelope::Cache("wallet_balance"), snapshot)
        {
            warn!("Failed to persist wallet snapshot: {err}");
        }
    }

    /// Spawn the derivation-cache rebuild worker, wiring the gap-limit
    /// scanner in as a service so the cache module never imports it.
    pub fn spawn_rebuild_worker(self: &Arc<Self>) -> RebuildWorker {
        let gap_scan: Option<GapScanFn> = if self.config.xpub_enable_gap_limit {
            let core = Arc::clone(self);
            Some(Arc::new(move |xpub| {
                crate::scan::gap_limit::derive_with_gap_limit(&core, xpub)
            }))
        } else {
            None
        };

        RebuildWorker::spawn(self.derivation.clone(), gap_scan)
    }

    /// The rebuild request matching the current configuration.
    pub fn rebuild_request(&self) -> RebuildRequest {
        RebuildRequest {
            entries: self.config.wallet_balance_addresses_with_comments.clone(),
            derivation_count: self.config.xpub_derivation_count,
            gap_limit_enabled: self.config.xpub_enable_gap_limit,
        }
    }

    pub(crate) fn ttl_get(&self, xkey: &str) -> Option<u64> {
        let timeout = self.config.wallet_balance_cache_timeout;
        if timeout == 0 {
            return None;
        }

        let ttl = self.balance_ttl.lock();
        let (sats, fetched_at) = ttl.get(xkey)?;
        (self.clock.now().saturating_sub(*fetched_at) < timeout).then_some(*sats)
    }

    pub(crate) fn ttl_put(&self, xkey: &str, sats: u64) {
        self.balance_ttl
            .lock()
            .insert(xkey.to_string(), (sats, self.clock.now()));
    }
}
