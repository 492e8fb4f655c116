//! Per-address coinbase counters with incremental sync.
//!
//! Every monitored address keeps a count of the coinbase transactions that
//! paid it, along with the height range they were found in and the height it
//! has been synced to. Small sync gaps walk blocks (cheap for recent
//! blocks); large gaps replay the address transaction history instead.
//! Counters only increase and `synced_height` is monotone.

use crate::client::{ChainApi, ClientError};
use crate::core::Clock;
use crate::secure::atomic_write;
use crate::util::crop;
use memplora::bitcoin::BlockHash;
use memplora::Transaction;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::{fs, io};
use thiserror::Error;
use tracing::{debug, info, warn};

pub const CACHE_VERSION: &str = "1.0";

/// Gaps at or below this many blocks sync by walking blocks; larger gaps
/// replay the transaction history, which costs one address call plus
/// pagination regardless of gap size.
const BLOCK_WALK_LIMIT: u64 = 50;

/// Esplora-style page size for address histories.
const PAGE_SIZE: usize = 25;

#[derive(Debug, Error)]
pub enum RewardError {
    #[error("REST client error")]
    Client(#[from] ClientError),

    #[error("I/O error")]
    Io(#[from] io::Error),

    #[error("JSON error")]
    Json(#[from] serde_json::Error),

    #[error("address {0} is not monitored")]
    Unknown(String),
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, Eq, PartialEq)]
pub struct RewardEntry {
    pub total_coinbase_count: u64,
    pub synced_height: u64,
    #[serde(default)]
    pub first_block_found: Option<u64>,
    #[serde(default)]
    pub latest_block_found: Option<u64>,
    #[serde(default)]
    pub last_updated: u64,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct RewardCacheData {
    pub addresses: BTreeMap<String, RewardEntry>,
    pub global_sync_height: u64,
    pub cache_version: String,
    #[serde(default)]
    pub last_full_scan: u64,
    #[serde(default)]
    pub last_updated: u64,
}

impl Default for RewardCacheData {
    fn default() -> Self {
        Self {
            addresses: BTreeMap::new(),
            global_sync_height: 0,
            cache_version: CACHE_VERSION.to_string(),
            last_full_scan: 0,
            last_updated: 0,
        }
    }
}

#[derive(Clone, Copy, Debug, Serialize)]
pub struct RewardStats {
    pub monitored_addresses: usize,
    pub total_coinbase_count: u64,
    pub global_sync_height: u64,
}

/// The persistent coinbase-count cache. One lock guards the in-memory data
/// and the file; every mutation commits through an atomic rename, and a
/// failed write leaves the in-memory state untouched.
pub struct RewardCache {
    path: PathBuf,
    clock: Arc<dyn Clock>,
    inner: Mutex<RewardCacheData>,
}

impl RewardCache {
    /// Open the cache, lazily: a missing or unreadable file starts empty.
    pub fn open(path: PathBuf, clock: Arc<dyn Clock>) -> Self {
        let data = match fs::read(&path) {
            Ok(raw) => serde_json::from_slice(&raw).unwrap_or_else(|err| {
                warn!("Corrupt block reward cache, starting empty: {err}");
                RewardCacheData::default()
            }),
            Err(err) => {
                if err.kind() != io::ErrorKind::NotFound {
                    warn!("Unreadable block reward cache, starting empty: {err}");
                }
                RewardCacheData::default()
            }
        };

        if !data.addresses.is_empty() {
            debug!(
                "Block reward cache loaded: {} addresses, synced to {}",
                data.addresses.len(),
                data.global_sync_height,
            );
        }

        Self {
            path,
            clock,
            inner: Mutex::new(data),
        }
    }

    pub fn coinbase_count(&self, address: &str) -> u64 {
        self.inner
            .lock()
            .addresses
            .get(address)
            .map(|entry| entry.total_coinbase_count)
            .unwrap_or(0)
    }

    pub fn synced_height(&self, address: &str) -> u64 {
        self.inner
            .lock()
            .addresses
            .get(address)
            .map(|entry| entry.synced_height)
            .unwrap_or(0)
    }

    pub fn monitored_addresses(&self) -> Vec<String> {
        self.inner.lock().addresses.keys().cloned().collect()
    }

    pub fn stats(&self) -> RewardStats {
        let data = self.inner.lock();
        RewardStats {
            monitored_addresses: data.addresses.len(),
            total_coinbase_count: data
                .addresses
                .values()
                .map(|entry| entry.total_coinbase_count)
                .sum(),
            global_sync_height: data.global_sync_height,
        }
    }

    /// Start monitoring `address`: scan its whole transaction history for
    /// coinbase payouts at or above `scan_from_height` (default 1) and
    /// record it as synced to the current tip. A no-op if already present.
    pub fn add_address(
        &self,
        client: &dyn ChainApi,
        address: &str,
        scan_from_height: Option<u64>,
    ) -> Result<(), RewardError> {
        if self.inner.lock().addresses.contains_key(address) {
            debug!("Address {} already monitored", crop(address));
            return Ok(());
        }

        let tip = client.tip_height()?;
        let lower = scan_from_height.unwrap_or(1);

        info!(
            "Scanning history of {} for coinbase payouts (blocks {lower}..={tip})",
            crop(address)
        );
        let found = scan_history(client, address, lower, tip)?;
        info!(
            "History scan of {} complete: {} coinbase transactions",
            crop(address),
            found.count,
        );

        let mut inner = self.inner.lock();
        if inner.addresses.contains_key(address) {
            return Ok(());
        }

        let mut data = inner.clone();
        data.addresses.insert(
            address.to_string(),
            RewardEntry {
                total_coinbase_count: found.count,
                synced_height: tip,
                first_block_found: found.first,
                latest_block_found: found.latest,
                last_updated: self.clock.now(),
            },
        );
        data.global_sync_height = data.global_sync_height.max(tip);

        self.commit(&mut inner, data)
    }

    /// Bring one monitored address up to the current tip.
    ///
    /// Returns the number of newly discovered coinbase transactions.
    pub fn sync_address(&self, client: &dyn ChainApi, address: &str) -> Result<u64, RewardError> {
        let tip = client.tip_height()?;
        let synced = {
            let inner = self.inner.lock();
            inner
                .addresses
                .get(address)
                .map(|entry| entry.synced_height)
                .ok_or_else(|| RewardError::Unknown(address.to_string()))?
        };

        if synced >= tip {
            debug!("Address {} already synced to {synced}", crop(address));
            return Ok(0);
        }

        let gap = tip - synced;
        let found = if gap <= BLOCK_WALK_LIMIT {
            debug!("Walking {gap} blocks for {}", crop(address));
            scan_blocks(client, address, synced + 1, tip)?
        } else {
            debug!("Replaying history for {} ({gap} blocks behind)", crop(address));
            scan_history(client, address, synced + 1, tip)?
        };

        let mut inner = self.inner.lock();
        let mut data = inner.clone();
        let entry = data
            .addresses
            .get_mut(address)
            .ok_or_else(|| RewardError::Unknown(address.to_string()))?;

        // A concurrent sync may have advanced the entry while we scanned.
        if entry.synced_height != synced {
            debug!("Address {} was synced concurrently, discarding scan", crop(address));
            return Ok(0);
        }

        entry.total_coinbase_count += found.count;
        entry.synced_height = tip;
        entry.first_block_found = merge_min(entry.first_block_found, found.first);
        entry.latest_block_found = merge_max(entry.latest_block_found, found.latest);
        entry.last_updated = self.clock.now();
        data.global_sync_height = data.global_sync_height.max(tip);

        self.commit(&mut inner, data)?;

        if found.count > 0 {
            info!(
                "Sync of {} found {} new coinbase transactions",
                crop(address),
                found.count,
            );
        }

        Ok(found.count)
    }

    /// Recovery sweep after downtime: sync every monitored address.
    ///
    /// Per-address failures are logged and skipped; the sweep continues.
    pub fn sync_all(&self, client: &dyn ChainApi) -> Result<usize, RewardError> {
        let tip = client.tip_height()?;
        let addresses = self.monitored_addresses();

        let mut synced = 0;
        for address in &addresses {
            match self.sync_address(client, address) {
                Ok(_) => synced += 1,
                Err(err) => warn!("Sync failed for {}: {err}", crop(address)),
            }
        }

        let mut inner = self.inner.lock();
        let mut data = inner.clone();
        data.global_sync_height = data.global_sync_height.max(tip);
        self.commit(&mut inner, data)?;

        info!("Reward sync complete: {synced}/{} addresses", addresses.len());
        Ok(synced)
    }

    /// Ingest a freshly found block (driven by the external block-tip
    /// listener). Credits every monitored address the coinbase pays.
    ///
    /// Returns `true` if any monitored address was credited.
    pub fn update_for_new_block(
        &self,
        client: &dyn ChainApi,
        hash: &BlockHash,
        height: u64,
    ) -> Result<bool, RewardError> {
        let Some(coinbase) = coinbase_of_block(client, hash)? else {
            return Ok(false);
        };

        let mut inner = self.inner.lock();
        let mut data = inner.clone();
        let mut credited = false;

        for output in &coinbase.outputs {
            let Some(address) = output.address.as_deref() else {
                continue;
            };
            let Some(entry) = data.addresses.get_mut(address) else {
                continue;
            };

            entry.total_coinbase_count += 1;
            entry.synced_height = entry.synced_height.max(height);
            entry.latest_block_found = merge_max(entry.latest_block_found, Some(height));
            entry.first_block_found = merge_min(entry.first_block_found, Some(height));
            entry.last_updated = self.clock.now();
            credited = true;

            info!(
                "Block reward found: {} sat to {} at height {height}",
                output.value,
                crop(address),
            );
        }

        data.global_sync_height = data.global_sync_height.max(height);
        self.commit(&mut inner, data)?;

        Ok(credited)
    }

    /// Stop monitoring `address` and delete its entry.
    pub fn remove_address(&self, address: &str) -> Result<bool, RewardError> {
        let mut inner = self.inner.lock();
        if !inner.addresses.contains_key(address) {
            return Ok(false);
        }

        let mut data = inner.clone();
        data.addresses.remove(address);
        self.commit(&mut inner, data)?;

        info!("Removed {} from block reward monitoring", crop(address));
        Ok(true)
    }

    /// Reconcile the monitored set with the configured table: add what is
    /// missing, remove what is extraneous.
    pub fn update_monitored_addresses(
        &self,
        client: &dyn ChainApi,
        addresses: &[String],
    ) -> Result<(), RewardError> {
        let current = self.monitored_addresses();

        for stale in current.iter().filter(|a| !addresses.contains(a)) {
            self.remove_address(stale)?;
        }

        for address in addresses {
            if !current.contains(address) {
                if let Err(err) = self.add_address(client, address, None) {
                    warn!("Could not add {}: {err}", crop(address));
                }
            }
        }

        Ok(())
    }

    /// Persist `data` and, only on success, make it the in-memory state.
    fn commit(
        &self,
        inner: &mut parking_lot::MutexGuard<'_, RewardCacheData>,
        mut data: RewardCacheData,
    ) -> Result<(), RewardError> {
        data.last_updated = self.clock.now();
        atomic_write(&self.path, &serde_json::to_vec_pretty(&data)?)?;
        **inner = data;

        Ok(())
    }
}

#[derive(Debug, Default)]
struct ScanOutcome {
    count: u64,
    first: Option<u64>,
    latest: Option<u64>,
}

impl ScanOutcome {
    fn record(&mut self, height: u64) {
        self.count += 1;
        self.first = merge_min(self.first, Some(height));
        self.latest = merge_max(self.latest, Some(height));
    }
}

fn merge_min(current: Option<u64>, found: Option<u64>) -> Option<u64> {
    match (current, found) {
        (Some(a), Some(b)) => Some(a.min(b)),
        (a, b) => a.or(b),
    }
}

fn merge_max(current: Option<u64>, found: Option<u64>) -> Option<u64> {
    match (current, found) {
        (Some(a), Some(b)) => Some(a.max(b)),
        (a, b) => a.or(b),
    }
}

/// Count coinbase transactions in the address history, confirmed within
/// `[lower, upper]`, following pagination until a short page.
fn scan_history(
    client: &dyn ChainApi,
    address: &str,
    lower: u64,
    upper: u64,
) -> Result<ScanOutcome, ClientError> {
    let mut outcome = ScanOutcome::default();
    let mut offset = 0usize;

    loop {
        let page = client.address_txs(address, (offset > 0).then_some(offset))?;
        if page.is_empty() {
            break;
        }

        for tx in &page {
            let Some(height) = tx.block_height() else {
                continue;
            };
            let height = u64::from(height);
            if height < lower || height > upper {
                continue;
            }
            if tx.is_coinbase() {
                debug!("Coinbase payout to {} at height {height}", crop(address));
                outcome.record(height);
            }
        }

        if page.len() < PAGE_SIZE {
            break;
        }
        offset += page.len();
    }

    Ok(outcome)
}

/// Walk blocks `lower..=upper` and match the coinbase outputs against
/// `address`. Per-block failures are skipped, not fatal.
fn scan_blocks(
    client: &dyn ChainApi,
    address: &str,
    lower: u64,
    upper: u64,
) -> Result<ScanOutcome, ClientError> {
    let mut outcome = ScanOutcome::default();

    for height in lower..=upper {
        let hash = match client.block_hash_at(height) {
            Ok(hash) => hash,
            Err(err) => {
                warn!("No block hash at height {height}: {err}");
                continue;
            }
        };

        let coinbase = match coinbase_of_block(client, &hash) {
            Ok(Some(tx)) => tx,
            Ok(None) => continue,
            Err(err) => {
                warn!("Could not read coinbase of block {height}: {err}");
                continue;
            }
        };

        if coinbase
            .outputs
            .iter()
            .any(|output| output.address.as_deref() == Some(address))
        {
            outcome.record(height);
        }
    }

    Ok(outcome)
}

/// The first transaction of a block. Uses the inlined transaction list when
/// the backend provides one, the txids endpoint otherwise.
fn coinbase_of_block(
    client: &dyn ChainApi,
    hash: &BlockHash,
) -> Result<Option<Transaction>, ClientError> {
    if let Ok(info) = client.block(hash) {
        if let Some(first) = info.tx.and_then(|txs| txs.into_iter().next()) {
            return Ok(Some(first));
        }
    }

    let txids = client.block_txids(hash)?;
    match txids.first() {
        Some(coinbase_txid) => Ok(Some(client.tx(coinbase_txid)?)),
        None => Ok(None),
    }
}
