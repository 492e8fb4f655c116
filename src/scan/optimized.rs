//! The optimized balance engine.
//!
//! A full gap-limit scan of an extended key is expensive, so its result is
//! cached for a configurable number of days. While the cache is valid only a
//! small monitoring set is polled: every funded address plus a buffer of
//! successors of the highest funded index. Any change inside that set
//! triggers a full rescan and a fresh cache entry.

use super::{fetch_balances, xpub_addresses, ScanError};
use crate::core::WalletCore;
use crate::keys::Xpub;
use crate::secure::atomic_write;
use crate::util::crop;
use memplora::bitcoin::hashes::{sha256, Hash as _};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::{fs, io};
use thiserror::Error;
use tracing::{debug, info, warn};

/// Balance differences at or below one satoshi count as "unchanged".
const SAT_TOLERANCE: u64 = 1;

#[derive(Debug, Error)]
pub enum OptimizedStoreError {
    #[error("I/O error")]
    Io(#[from] io::Error),

    #[error("JSON error")]
    Json(#[from] serde_json::Error),
}

/// One full-scan result for one extended key.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct OptimizedEntry {
    /// Unix seconds of the scan this entry describes.
    pub last_full_scan: u64,
    pub total_balance_sat: u64,
    /// Funded addresses plus the buffer; the only addresses polled while
    /// the entry is valid.
    pub monitoring_addresses: Vec<String>,
    /// Balance of every scanned address at scan time, funded or not.
    pub address_balances: BTreeMap<String, u64>,
    pub scan_address_count: u32,
    pub funded_address_count: u32,
    pub cache_days: u32,
    pub buffer_addresses: u32,
}

impl OptimizedEntry {
    fn is_fresh(&self, now: u64) -> bool {
        now.saturating_sub(self.last_full_scan) < u64::from(self.cache_days) * 86_400
    }
}

/// Persistent store for [`OptimizedEntry`]s.
///
/// Plaintext is permitted here: the file holds only public addresses,
/// balances and timestamps. Writes are still atomic and owner-only.
pub struct OptimizedStore {
    path: PathBuf,
    memory: Mutex<Option<HashMap<String, OptimizedEntry>>>,
}

impl OptimizedStore {
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            memory: Mutex::new(None),
        }
    }

    pub fn entry(&self, xkey: &str) -> Option<OptimizedEntry> {
        let mut memory = self.memory.lock();
        let map = self.loaded(&mut memory);
        map.get(&entry_key(xkey)).cloned()
    }

    pub fn store(&self, xkey: &str, entry: OptimizedEntry) -> Result<(), OptimizedStoreError> {
        let mut memory = self.memory.lock();
        let map = self.loaded(&mut memory);
        map.insert(entry_key(xkey), entry);

        atomic_write(&self.path, &serde_json::to_vec_pretty(&*map)?)?;

        Ok(())
    }

    pub fn clear(&self) -> Result<(), OptimizedStoreError> {
        *self.memory.lock() = Some(HashMap::new());

        match fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    fn loaded<'a>(
        &self,
        memory: &'a mut Option<HashMap<String, OptimizedEntry>>,
    ) -> &'a mut HashMap<String, OptimizedEntry> {
        memory.get_or_insert_with(|| match fs::read(&self.path) {
            Ok(raw) => serde_json::from_slice(&raw).unwrap_or_else(|err| {
                warn!("Corrupt optimized balance cache, starting empty: {err}");
                HashMap::new()
            }),
            Err(err) => {
                if err.kind() != io::ErrorKind::NotFound {
                    warn!("Unreadable optimized balance cache, starting empty: {err}");
                }
                HashMap::new()
            }
        })
    }
}

fn entry_key(xkey: &str) -> String {
    let digest = sha256::Hash::hash(xkey.as_bytes()).to_string();
    format!("optimized_balance:{}", &digest[..16])
}

/// Confirmed balance of an extended key, in satoshis.
///
/// `startup_mode` answers from the cache alone and never touches the
/// network; a key with no cached scan reports zero rather than blocking
/// startup.
pub fn optimized_balance(
    core: &WalletCore,
    xpub: &Xpub,
    startup_mode: bool,
) -> Result<u64, ScanError> {
    if !core.config.enable_optimized_balance_monitoring {
        return standard_balance(core, xpub, startup_mode);
    }

    let xkey = xpub.encoded();

    if startup_mode {
        let cached = core.optimized.entry(xkey).map(|entry| entry.total_balance_sat);
        debug!(
            "Startup balance for `{}`: {} (cache {})",
            xpub.short(),
            cached.unwrap_or(0),
            if cached.is_some() { "hit" } else { "miss" },
        );
        return Ok(cached.unwrap_or(0));
    }

    if let Some(sats) = core.ttl_get(xkey) {
        return Ok(sats);
    }

    let now = core.clock.now();

    if let Some(entry) = core.optimized.entry(xkey) {
        if entry.is_fresh(now) && !monitored_set_changed(core, &entry) {
            debug!(
                "Monitoring set unchanged for `{}`, keeping cached total",
                xpub.short()
            );
            core.ttl_put(xkey, entry.total_balance_sat);
            return Ok(entry.total_balance_sat);
        }
    }

    full_rescan(core, xpub, now)
}

/// Poll the monitoring set and compare against the cached balances.
fn monitored_set_changed(core: &WalletCore, entry: &OptimizedEntry) -> bool {
    if entry.monitoring_addresses.is_empty() {
        return true;
    }

    let current = fetch_balances(
        &core.pools.balance,
        &*core.client,
        &entry.monitoring_addresses,
    );

    for address in &entry.monitoring_addresses {
        let cached = entry.address_balances.get(address).copied().unwrap_or(0);
        let live = current.get(address).copied().unwrap_or(0);

        if cached.abs_diff(live) > SAT_TOLERANCE {
            info!(
                "Balance change on monitored address {}: {cached} sat → {live} sat",
                crop(address)
            );
            return true;
        }
    }

    false
}

fn full_rescan(core: &WalletCore, xpub: &Xpub, now: u64) -> Result<u64, ScanError> {
    let buffer = core.config.optimized_balance_buffer_addresses as usize;

    // The ordered universe comes from the derivation cache; the engine
    // itself never derives addresses.
    let universe = xpub_addresses(core, xpub)?;
    if universe.is_empty() {
        warn!("No addresses derived for `{}`", xpub.short());
        return Ok(0);
    }

    info!(
        "Full balance scan for `{}`: {} addresses",
        xpub.short(),
        universe.len()
    );

    let address_list: Vec<String> = universe.iter().map(|d| d.address.clone()).collect();
    let balances = fetch_balances(&core.pools.balance, &*core.client, &address_list);

    let balance_of = |address: &str| balances.get(address).copied().unwrap_or(0);

    let funded_positions: Vec<usize> = universe
        .iter()
        .enumerate()
        .filter(|(_, derived)| balance_of(&derived.address) > 0)
        .map(|(position, _)| position)
        .collect();
    let total: u64 = funded_positions
        .iter()
        .map(|&position| balance_of(&universe[position].address))
        .sum();

    // Funded addresses plus the next N after the highest funded index; the
    // first N when nothing is funded.
    let mut monitoring: Vec<String> = funded_positions
        .iter()
        .map(|&position| universe[position].address.clone())
        .collect();
    match funded_positions.last() {
        Some(&highest) => {
            for derived in universe.iter().skip(highest + 1).take(buffer) {
                if !monitoring.contains(&derived.address) {
                    monitoring.push(derived.address.clone());
                }
            }
        }
        None => {
            monitoring = universe
                .iter()
                .take(buffer)
                .map(|derived| derived.address.clone())
                .collect();
        }
    }

    let entry = OptimizedEntry {
        last_full_scan: now,
        total_balance_sat: total,
        monitoring_addresses: monitoring,
        address_balances: address_list
            .iter()
            .map(|address| (address.clone(), balance_of(address)))
            .collect(),
        scan_address_count: universe.len() as u32,
        funded_address_count: funded_positions.len() as u32,
        cache_days: core.config.optimized_balance_cache_days,
        buffer_addresses: core.config.optimized_balance_buffer_addresses,
    };

    info!(
        "Full scan for `{}` complete: {total} sat across {}/{} addresses",
        xpub.short(),
        entry.funded_address_count,
        entry.scan_address_count,
    );

    if let Err(err) = core.optimized.store(xpub.encoded(), entry) {
        warn!("Failed to persist optimized balance entry: {err}");
    }
    core.ttl_put(xpub.encoded(), total);

    Ok(total)
}

/// Plain scan-and-sum, used when optimized monitoring is disabled.
fn standard_balance(core: &WalletCore, xpub: &Xpub, startup_mode: bool) -> Result<u64, ScanError> {
    if startup_mode {
        // No cached scan exists in this mode and startup never blocks on
        // the network.
        return Ok(0);
    }

    if let Some(sats) = core.ttl_get(xpub.encoded()) {
        return Ok(sats);
    }

    let universe = xpub_addresses(core, xpub)?;
    let address_list: Vec<String> = universe.iter().map(|d| d.address.clone()).collect();
    let balances = fetch_balances(&core.pools.balance, &*core.client, &address_list);
    let total = balances.values().sum();

    core.ttl_put(xpub.encoded(), total);

    Ok(total)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::mock::MockChain;
    use crate::config::Config;
    use crate::core::testutil::{test_core, FixedClock};
    use crate::core::WalletCore;
    use std::sync::Arc;

    const ZPUB: &str = "zpub6rFR7y4Q2AijBEqTUquhVz398htDFrtymD9xYYfG1m4wAcvPhXNfE3EfH1r1ADqtfSdVCToUG868RvUUkgDKf31mGDtKsAYz2oz2AGutZYs";

    const DAY: u64 = 86_400;

    fn config() -> Config {
        // Gap limit off keeps the universe at the fixed 20-address window.
        Config {
            xpub_enable_gap_limit: false,
            ..Config::default()
        }
    }

    fn addresses(count: u32) -> Vec<String> {
        Xpub::parse(ZPUB)
            .unwrap()
            .derive(count, 0)
            .unwrap()
            .into_iter()
            .map(|d| d.address)
            .collect()
    }

    /// A valid entry two days old: A0 and A3 funded, A4..A6 buffered.
    fn seed_entry(core: &WalletCore, now: u64) -> OptimizedEntry {
        let addrs = addresses(20);
        let mut address_balances: BTreeMap<String, u64> =
            addrs.iter().map(|a| (a.clone(), 0)).collect();
        address_balances.insert(addrs[0].clone(), 1_000_000);
        address_balances.insert(addrs[3].clone(), 2_000_000);

        let entry = OptimizedEntry {
            last_full_scan: now - 2 * DAY,
            total_balance_sat: 3_000_000,
            monitoring_addresses: vec![
                addrs[0].clone(),
                addrs[3].clone(),
                addrs[4].clone(),
                addrs[5].clone(),
                addrs[6].clone(),
            ],
            address_balances,
            scan_address_count: 20,
            funded_address_count: 2,
            cache_days: 50,
            buffer_addresses: 5,
        };
        core.optimized.store(ZPUB, entry.clone()).unwrap();
        entry
    }

    #[test]
    fn test_fresh_cache_polls_only_the_monitoring_set() {
        let dir = tempfile::tempdir().unwrap();
        let mock = Arc::new(MockChain::new(850_000));
        let now = 100 * DAY;
        let core = test_core(dir.path(), config(), mock.clone(), FixedClock::new(now));

        let entry = seed_entry(&core, now);
        for address in &entry.monitoring_addresses {
            let cached = entry.address_balances[address];
            if cached > 0 {
                mock.fund(address, cached);
            }
        }

        let xpub = Xpub::parse(ZPUB).unwrap();
        let total = optimized_balance(&core, &xpub, false).unwrap();

        assert_eq!(total, 3_000_000);
        // Five monitored addresses, five stats calls, no full rescan.
        assert_eq!(mock.stats_calls(), 5);
    }

    #[test]
    fn test_monitored_change_triggers_full_rescan() {
        let dir = tempfile::tempdir().unwrap();
        let mock = Arc::new(MockChain::new(850_000));
        let now = 100 * DAY;
        let core = test_core(dir.path(), config(), mock.clone(), FixedClock::new(now));

        let entry = seed_entry(&core, now);
        let addrs = addresses(20);
        mock.fund(&addrs[0], 1_000_000);
        // A3 moved by 0.001 BTC since the cached scan.
        mock.fund(&addrs[3], 2_000_000 + 100_000);

        let xpub = Xpub::parse(ZPUB).unwrap();
        let total = optimized_balance(&core, &xpub, false).unwrap();

        assert_eq!(total, 3_100_000);
        // Five monitoring probes, then all twenty addresses rescanned.
        assert_eq!(mock.stats_calls(), 25);

        // The rescan wrote a fresh entry.
        let rescanned = core.optimized.entry(ZPUB).unwrap();
        assert_eq!(rescanned.last_full_scan, now);
        assert!(rescanned.last_full_scan > entry.last_full_scan);
        assert_eq!(rescanned.total_balance_sat, 3_100_000);
    }

    #[test]
    fn test_expired_cache_rescans() {
        let dir = tempfile::tempdir().unwrap();
        let mock = Arc::new(MockChain::new(850_000));
        let now = 100 * DAY;
        let core = test_core(dir.path(), config(), mock.clone(), FixedClock::new(now));

        let mut entry = seed_entry(&core, now);
        entry.last_full_scan = now - 51 * DAY;
        core.optimized.store(ZPUB, entry).unwrap();

        let xpub = Xpub::parse(ZPUB).unwrap();
        optimized_balance(&core, &xpub, false).unwrap();

        // Straight to the full rescan; the monitoring set is not polled.
        assert_eq!(mock.stats_calls(), 20);
    }

    #[test]
    fn test_startup_mode_never_touches_network() {
        let dir = tempfile::tempdir().unwrap();
        let mock = Arc::new(MockChain::new(850_000));
        let now = 100 * DAY;
        let core = test_core(dir.path(), config(), mock.clone(), FixedClock::new(now));

        let xpub = Xpub::parse(ZPUB).unwrap();

        // Cache miss: zero, zero calls.
        assert_eq!(optimized_balance(&core, &xpub, true).unwrap(), 0);
        assert_eq!(mock.stats_calls(), 0);

        // Cache hit: cached total, still zero calls.
        seed_entry(&core, now);
        assert_eq!(optimized_balance(&core, &xpub, true).unwrap(), 3_000_000);
        assert_eq!(mock.stats_calls(), 0);
    }

    #[test]
    fn test_monitoring_set_covers_every_funded_address() {
        let dir = tempfile::tempdir().unwrap();
        let mock = Arc::new(MockChain::new(850_000));
        let core = test_core(dir.path(), config(), mock.clone(), FixedClock::new(100 * DAY));

        let addrs = addresses(20);
        mock.fund(&addrs[2], 10_000);
        mock.fund(&addrs[9], 20_000);

        let xpub = Xpub::parse(ZPUB).unwrap();
        optimized_balance(&core, &xpub, false).unwrap();

        let entry = core.optimized.entry(ZPUB).unwrap();
        assert!(entry.monitoring_addresses.contains(&addrs[2]));
        assert!(entry.monitoring_addresses.contains(&addrs[9]));
        // Buffer: the five successors of index 9.
        for buffered in &addrs[10..15] {
            assert!(entry.monitoring_addresses.contains(buffered));
        }
        assert_eq!(entry.monitoring_addresses.len(), 7);
        // Every scanned address is recorded, funded or not.
        assert_eq!(entry.address_balances.len(), 20);
    }

    #[test]
    fn test_unfunded_key_monitors_the_first_buffer() {
        let dir = tempfile::tempdir().unwrap();
        let mock = Arc::new(MockChain::new(850_000));
        let core = test_core(dir.path(), config(), mock, FixedClock::new(100 * DAY));

        let xpub = Xpub::parse(ZPUB).unwrap();
        optimized_balance(&core, &xpub, false).unwrap();

        let entry = core.optimized.entry(ZPUB).unwrap();
        assert_eq!(entry.monitoring_addresses, addresses(5));
        assert_eq!(entry.total_balance_sat, 0);
    }

    #[test]
    fn test_ttl_cache_short_circuits_repeat_calls() {
        let dir = tempfile::tempdir().unwrap();
        let mock = Arc::new(MockChain::new(850_000));
        let clock = FixedClock::new(100 * DAY);
        let core = test_core(dir.path(), config(), mock.clone(), clock.clone());

        let xpub = Xpub::parse(ZPUB).unwrap();
        optimized_balance(&core, &xpub, false).unwrap();
        let after_first = mock.stats_calls();

        // Same rendering pass: answered from the TTL cache.
        optimized_balance(&core, &xpub, false).unwrap();
        assert_eq!(mock.stats_calls(), after_first);

        // TTL expired: the monitoring set is polled again.
        clock.advance(61);
        optimized_balance(&core, &xpub, false).unwrap();
        assert!(mock.stats_calls() > after_first);
    }

    #[test]
    fn test_store_survives_restart() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("optimized_balance_cache.json");

        let first = OptimizedStore::new(path.clone());
        let mock_entry = OptimizedEntry {
            last_full_scan: 123,
            total_balance_sat: 42,
            monitoring_addresses: vec!["bc1qtest".to_string()],
            address_balances: BTreeMap::new(),
            scan_address_count: 1,
            funded_address_count: 0,
            cache_days: 50,
            buffer_addresses: 5,
        };
        first.store(ZPUB, mock_entry).unwrap();

        let second = OptimizedStore::new(path);
        assert_eq!(second.entry(ZPUB).unwrap().total_balance_sat, 42);
    }
}
