//! The persistent cache of derived addresses.
//!
//! Entries are keyed by a content hash of `(extended key, count, start)` so
//! they are immutable: a different derivation window is a different entry.
//! Gap-limit results use a disjoint `:gap_limit:` key suffix and therefore
//! never collide with fixed-count entries. The in-memory map is bounded by a
//! small LRU; the encrypted file on disk keeps everything.

use crate::config::WalletEntry;
use crate::keys::{DerivedAddress, KeyError, Xpub};
use crate::secure::{Envelope, SecureError, SecureStore};
use crate::util::crop;
use memplora::bitcoin::hashes::{sha256, Hash as _};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{channel, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use thiserror::Error;
use tracing::{debug, info, warn};

const CACHE_TYPE: &str = "address_derivation";

/// In-memory entry bound. The encrypted file on disk is not pruned.
const MEMORY_ENTRY_CAP: usize = 64;

#[derive(Debug, Error)]
pub enum DerivationError {
    #[error("key derivation error")]
    Key(#[from] KeyError),

    #[error("cache storage error")]
    Secure(#[from] SecureError),
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct CacheEntry {
    /// Ordered `[address, index]` pairs.
    pub addresses: Vec<(String, u32)>,
    pub count: u32,
    pub start_index: u32,
    pub cached_at: u64,
    /// Wall time spent deriving, in seconds.
    pub derivation_time: f64,
}

impl CacheEntry {
    fn to_derived(&self) -> Vec<DerivedAddress> {
        self.addresses
            .iter()
            .map(|(address, index)| DerivedAddress {
                address: address.clone(),
                index: *index,
            })
            .collect()
    }
}

/// Aggregate statistics over the persisted cache.
#[derive(Clone, Copy, Debug, Default, Serialize)]
pub struct CacheStats {
    pub entries: usize,
    pub addresses: usize,
    pub total_derivation_time: f64,
}

#[derive(Default)]
struct Memory {
    entries: HashMap<String, CacheEntry>,
    // Recency order, oldest first.
    order: VecDeque<String>,
}

impl Memory {
    fn get(&mut self, key: &str) -> Option<CacheEntry> {
        let entry = self.entries.get(key).cloned()?;
        self.touch(key);
        Some(entry)
    }

    fn insert(&mut self, key: String, entry: CacheEntry) {
        self.entries.insert(key.clone(), entry);
        self.touch(&key);

        while self.entries.len() > MEMORY_ENTRY_CAP {
            let Some(oldest) = self.order.pop_front() else {
                break;
            };
            self.entries.remove(&oldest);
        }
    }

    fn touch(&mut self, key: &str) {
        self.order.retain(|k| k != key);
        self.order.push_back(key.to_string());
    }
}

/// Process-wide keyed store for derived addresses, fronted by one lock and
/// persisted through the encrypted store.
pub struct DerivationCache {
    path: PathBuf,
    store: Arc<SecureStore>,
    memory: Mutex<Memory>,
}

impl DerivationCache {
    pub fn new(path: PathBuf, store: Arc<SecureStore>) -> Self {
        Self {
            path,
            store,
            memory: Mutex::new(Memory::default()),
        }
    }

    /// Return the cached window for `(xpub, count, start)`, deriving and
    /// persisting it on a miss.
    ///
    /// An exact-count key means a larger cached window is never sliced to
    /// serve a smaller request; the smaller window is recomputed instead.
    pub fn get_or_derive(
        &self,
        xpub: &Xpub,
        count: u32,
        start: u32,
    ) -> Result<Vec<DerivedAddress>, DerivationError> {
        let key = fixed_key(xpub.encoded(), count, start);
        let mut memory = self.memory.lock();

        if let Some(entry) = memory.get(&key) {
            return Ok(entry.to_derived());
        }

        if let Some(entry) = self.disk_entry(&key) {
            let derived = entry.to_derived();
            memory.insert(key, entry);
            return Ok(derived);
        }

        debug!("Cache miss for `{}`, deriving {count} addresses", xpub.short());
        let started = Instant::now();
        let derived = xpub.derive(count, start)?;
        let derivation_time = started.elapsed().as_secs_f64();

        let entry = CacheEntry {
            addresses: derived
                .iter()
                .map(|d| (d.address.clone(), d.index))
                .collect(),
            count,
            start_index: start,
            cached_at: unix_now(),
            derivation_time,
        };

        memory.insert(key.clone(), entry.clone());
        // Persistence failures must not fail the read path; the addresses
        // are valid either way and the next mutation retries the write.
        if let Err(err) = self.persist(&key, &entry) {
            warn!("Failed to persist derivation cache entry: {err}");
        }

        Ok(derived)
    }

    /// Store a finished gap-limit result under its disjoint key.
    pub fn store_gap_result(
        &self,
        xkey: &str,
        final_count: u32,
        addresses: &[DerivedAddress],
        derivation_time: f64,
    ) -> Result<(), DerivationError> {
        let key = gap_key(xkey, final_count);
        let entry = CacheEntry {
            addresses: addresses
                .iter()
                .map(|d| (d.address.clone(), d.index))
                .collect(),
            count: final_count,
            start_index: 0,
            cached_at: unix_now(),
            derivation_time,
        };

        let mut memory = self.memory.lock();
        memory.insert(key.clone(), entry.clone());
        self.persist(&key, &entry)?;

        Ok(())
    }

    /// Look up a finished gap-limit result by probing the candidate terminal
    /// counts.
    pub fn gap_result(
        &self,
        xkey: &str,
        candidates: impl IntoIterator<Item = u32>,
    ) -> Option<(Vec<DerivedAddress>, u32)> {
        let mut memory = self.memory.lock();
        let mut disk: Option<HashMap<String, CacheEntry>> = None;

        for count in candidates {
            let key = gap_key(xkey, count);

            if let Some(entry) = memory.get(&key) {
                return Some((entry.to_derived(), count));
            }

            let map = disk.get_or_insert_with(|| self.disk_map());
            if let Some(entry) = map.get(&key) {
                memory.insert(key, entry.clone());
                return Some((entry.to_derived(), count));
            }
        }

        None
    }

    /// Drop every cached entry, in memory and on disk. The only way any
    /// cache is ever cleared.
    pub fn clear(&self) -> Result<(), DerivationError> {
        let mut memory = self.memory.lock();
        *memory = Memory::default();

        match std::fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(DerivationError::Secure(err.into())),
        }
    }

    pub fn stats(&self) -> CacheStats {
        let map = self.disk_map();

        CacheStats {
            entries: map.len(),
            addresses: map.values().map(|entry| entry.addresses.len()).sum(),
            total_derivation_time: map.values().map(|entry| entry.derivation_time).sum(),
        }
    }

    fn disk_entry(&self, key: &str) -> Option<CacheEntry> {
        self.disk_map().remove(key)
    }

    fn disk_map(&self) -> HashMap<String, CacheEntry> {
        match self.store.load_as(&self.path) {
            Ok(Some(map)) => map,
            Ok(None) => HashMap::new(),
            Err(err) => {
                warn!("Unreadable derivation cache, treating as empty: {err}");
                HashMap::new()
            }
        }
    }

    fn persist(&self, key: &str, entry: &CacheEntry) -> Result<(), SecureError> {
        let mut map = self.disk_map();
        map.insert(key.to_string(), entry.clone());
        self.store.save_as(&self.path, Envelope::Cache(CACHE_TYPE), &map)
    }
}

fn content_key(material: &str) -> String {
    sha256::Hash::hash(material.as_bytes()).to_string()[..16].to_string()
}

fn fixed_key(xkey: &str, count: u32, start: u32) -> String {
    content_key(&format!("{xkey}:{count}:{start}"))
}

fn gap_key(xkey: &str, final_count: u32) -> String {
    content_key(&format!("{xkey}:gap_limit:{final_count}"))
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// A gap-limit scan injected as a service, breaking the import cycle between
/// this cache and the scanner.
pub type GapScanFn = Arc<
    dyn Fn(&Xpub) -> Result<(Vec<DerivedAddress>, u32), crate::scan::ScanError> + Send + Sync,
>;

/// A configuration-change notification for the rebuild worker.
#[derive(Clone, Debug)]
pub struct RebuildRequest {
    pub entries: Vec<WalletEntry>,
    pub derivation_count: u32,
    pub gap_limit_enabled: bool,
}

/// The single background thread that re-derives addresses after wallet
/// configuration changes, so balance fetches find a warm cache.
///
/// Notifications are gated by a hash of the wallet-relevant configuration,
/// and queued rebuilds coalesce: only the newest request survives a drain.
/// The worker never blocks readers; it takes the cache lock only through the
/// same short-lived operations readers use.
pub struct RebuildWorker {
    sender: Option<Sender<RebuildRequest>>,
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
    last_hash: Mutex<Option<String>>,
}

impl RebuildWorker {
    pub fn spawn(cache: Arc<DerivationCache>, gap_scan: Option<GapScanFn>) -> Self {
        let stop = Arc::new(AtomicBool::new(false));
        let (sender, receiver) = channel::<RebuildRequest>();

        let handle = std::thread::spawn({
            let stop = stop.clone();
            move || {
                debug!("Started address cache rebuild worker");

                while !stop.load(Ordering::Relaxed) {
                    let mut request = match receiver.recv_timeout(Duration::from_millis(500)) {
                        Ok(request) => request,
                        Err(RecvTimeoutError::Timeout) => continue,
                        Err(RecvTimeoutError::Disconnected) => break,
                    };

                    // Coalesce: only the newest queued rebuild matters.
                    while let Ok(newer) = receiver.try_recv() {
                        request = newer;
                    }

                    rebuild(&cache, gap_scan.as_ref(), &request);
                }

                debug!("Stopped address cache rebuild worker");
            }
        });

        Self {
            sender: Some(sender),
            stop,
            handle: Some(handle),
            last_hash: Mutex::new(None),
        }
    }

    /// Queue a rebuild if the wallet-relevant configuration actually changed.
    pub fn notify(&self, request: RebuildRequest) {
        let hash = wallet_config_hash(&request);

        {
            let mut last = self.last_hash.lock();
            if last.as_deref() == Some(hash.as_str()) {
                return;
            }
            *last = Some(hash);
        }

        if let Some(sender) = &self.sender {
            if sender.send(request).is_err() {
                warn!("Rebuild worker is gone, dropping notification");
            }
        }
    }

    /// Halt the worker. It finishes the task in flight and exits.
    pub fn stop(self) {
        drop(self);
    }
}

impl Drop for RebuildWorker {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        self.sender.take();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

/// Hash of the wallet-relevant configuration: the sorted entry list plus the
/// derivation count.
fn wallet_config_hash(request: &RebuildRequest) -> String {
    let mut addresses: Vec<&str> = request
        .entries
        .iter()
        .map(|entry| entry.address.as_str())
        .collect();
    addresses.sort_unstable();

    let material = format!("{}|{}", addresses.join(","), request.derivation_count);
    sha256::Hash::hash(material.as_bytes()).to_string()
}

fn rebuild(cache: &DerivationCache, gap_scan: Option<&GapScanFn>, request: &RebuildRequest) {
    let started = Instant::now();
    let mut derived_total = 0usize;

    for entry in &request.entries {
        if entry.kind() != crate::config::EntryKind::Extended {
            continue;
        }

        let xpub = match Xpub::parse(&entry.address) {
            Ok(xpub) => xpub,
            Err(err) => {
                warn!("Skipping unparseable key `{}`: {err}", crop(&entry.address));
                continue;
            }
        };

        let result = match gap_scan {
            Some(scan) if request.gap_limit_enabled => match scan(&xpub) {
                Ok((addresses, final_count)) => {
                    debug!(
                        "Gap-limit rebuild for `{}`: {final_count} addresses",
                        xpub.short()
                    );
                    Ok(addresses)
                }
                Err(err) => {
                    warn!(
                        "Gap-limit rebuild failed for `{}`, falling back to the fixed window: {err}",
                        xpub.short()
                    );
                    cache
                        .get_or_derive(&xpub, request.derivation_count, 0)
                        .map_err(Into::into)
                }
            },
            _ => cache
                .get_or_derive(&xpub, request.derivation_count, 0)
                .map_err(crate::scan::ScanError::from),
        };

        match result {
            Ok(addresses) => derived_total += addresses.len(),
            Err(err) => warn!("Rebuild failed for `{}`: {err}", xpub.short()),
        }
    }

    info!(
        "Address cache rebuild complete: {derived_total} addresses in {:.2?}",
        started.elapsed()
    );
}
