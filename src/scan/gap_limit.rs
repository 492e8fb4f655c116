//! BIP-44 gap-limit discovery with a bootstrap phase for sparse wallets.
//!
//! The scanner expands the derivation window until a configurable number of
//! consecutive unused addresses is seen. The bootstrap phase keeps expanding
//! a wallet that shows no usage at all, up to a hard maximum, which rescues
//! restored wallets whose first used address lies beyond the initial window.
//! The "any used in the whole set" predicate prevents a totally empty key
//! from expanding forever.

use super::{fetch_usage_batch, AddressUsage, GapParams, ScanError, STANDARD_HARD_CAP};
use crate::core::WalletCore;
use crate::keys::{DerivedAddress, Xpub};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

const ADMISSION_POLL: Duration = Duration::from_millis(250);

/// Removes the key from the admission set on every exit path.
struct AdmissionGuard<'a> {
    set: &'a Mutex<HashSet<String>>,
    key: String,
}

impl Drop for AdmissionGuard<'_> {
    fn drop(&mut self) {
        self.set.lock().remove(&self.key);
    }
}

/// Discover the address universe of `xpub` under the gap rule.
///
/// Returns the ordered `(address, index)` list and the final window size,
/// and stores the result in the derivation cache under the gap-limit key.
///
/// Two concurrent calls for the same key perform exactly one network-bound
/// scan: the second caller waits for the first and reads its cached result.
/// Scans for different keys run in parallel. The admission lock protects
/// only the set of in-flight keys, never the scan itself.
pub fn derive_with_gap_limit(
    core: &WalletCore,
    xpub: &Xpub,
) -> Result<(Vec<DerivedAddress>, u32), ScanError> {
    let params = GapParams::from_config(&core.config)?;
    let key = xpub.encoded().to_string();

    let admitted = core.active_detections.lock().insert(key.clone());
    if !admitted {
        debug!("Gap-limit scan already running for `{}`, waiting", xpub.short());
        while core.active_detections.lock().contains(&key) {
            std::thread::sleep(ADMISSION_POLL);
        }

        if let Some(result) = core.derivation.gap_result(&key, params.candidate_counts()) {
            debug!("Reusing finished gap-limit scan for `{}`", xpub.short());
            return Ok(result);
        }

        // The other scan finished without caching anything (it failed).
        // Fall back to the fixed window rather than repeating its failure.
        warn!(
            "No cached gap-limit result for `{}` after waiting, using the fixed window",
            xpub.short()
        );
        let addresses = core
            .derivation
            .get_or_derive(xpub, params.initial_count, 0)?;
        return Ok((addresses, params.initial_count));
    }

    let _guard = AdmissionGuard {
        set: &core.active_detections,
        key,
    };

    perform_scan(core, xpub, &params)
}

fn perform_scan(
    core: &WalletCore,
    xpub: &Xpub,
    params: &GapParams,
) -> Result<(Vec<DerivedAddress>, u32), ScanError> {
    let started = Instant::now();
    let gap = params.gap_limit as usize;

    let mut current = params.initial_count;
    let mut seen: HashMap<String, AddressUsage> = HashMap::new();

    info!(
        "Gap-limit scan for `{}` (initial window {current})",
        xpub.short()
    );

    let window = loop {
        let window = core.derivation.get_or_derive(xpub, current, 0)?;

        // Only addresses not checked in an earlier round hit the network.
        let unseen: Vec<DerivedAddress> = window
            .iter()
            .filter(|derived| !seen.contains_key(&derived.address))
            .cloned()
            .collect();
        if !unseen.is_empty() {
            debug!(
                "Checking {} new addresses (indices {}..={})",
                unseen.len(),
                unseen[0].index,
                unseen[unseen.len() - 1].index,
            );
            seen.extend(fetch_usage_batch(&core.pools.usage, &*core.client, &unseen));
        }

        if window.len() < gap {
            // Not enough addresses to evaluate the gap rule yet.
            if params.bootstrap_enabled && current < params.bootstrap_max {
                current += params.bootstrap_increment;
                continue;
            }
            break window;
        }

        let ever_used = |derived: &DerivedAddress| {
            seen.get(&derived.address).is_some_and(AddressUsage::ever_used)
        };

        let tail = &window[window.len() - gap..];
        let used_in_tail = tail.iter().filter(|derived| ever_used(derived)).count();
        let any_used = window.iter().any(ever_used);

        debug!(
            "Gap analysis at window {current}: {used_in_tail}/{gap} of the tail used, \
             any used: {any_used}"
        );

        if used_in_tail == 0 {
            if any_used {
                // Usage was discovered and the tail has gone quiet.
                debug!("Gap satisfied after discovery");
                break window;
            }
            if params.bootstrap_enabled && current < params.bootstrap_max {
                // Nothing found anywhere yet; keep bootstrapping.
                current += params.bootstrap_increment;
                continue;
            }
            // Wallet treated as unused (bootstrap exhausted or disabled).
            break window;
        }

        // Usage inside the tail: the window has to grow.
        let (next, cap) = if params.bootstrap_enabled {
            (current + params.bootstrap_increment, params.bootstrap_max)
        } else {
            (current + params.increment, STANDARD_HARD_CAP)
        };
        if next > cap {
            warn!("Window cap reached at {current} addresses for `{}`", xpub.short());
            break window;
        }
        current = next;
    };

    let final_count = window.len() as u32;
    core.derivation.store_gap_result(
        xpub.encoded(),
        final_count,
        &window,
        started.elapsed().as_secs_f64(),
    )?;

    info!(
        "Gap-limit scan for `{}` finished: {final_count} addresses in {:.2?}",
        xpub.short(),
        started.elapsed()
    );

    Ok((window, final_count))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::mock::MockChain;
    use crate::config::Config;
    use crate::core::testutil::{test_core, FixedClock};
    use std::sync::Arc;

    const ZPUB: &str = "zpub6rFR7y4Q2AijBEqTUquhVz398htDFrtymD9xYYfG1m4wAcvPhXNfE3EfH1r1ADqtfSdVCToUG868RvUUkgDKf31mGDtKsAYz2oz2AGutZYs";

    fn scan_config() -> Config {
        Config {
            xpub_enable_gap_limit: true,
            ..Config::default()
        }
    }

    fn derived(xpub: &Xpub, count: u32) -> Vec<DerivedAddress> {
        xpub.derive(count, 0).unwrap()
    }

    #[test]
    fn test_funded_first_address_stops_after_discovery() {
        let dir = tempfile::tempdir().unwrap();
        let xpub = Xpub::parse(ZPUB).unwrap();
        let mock = Arc::new(MockChain::new(850_000));

        // Index 0 funded, everything else untouched.
        mock.fund(&derived(&xpub, 1)[0].address, 3_445_077);

        let core = test_core(dir.path(), scan_config(), mock, FixedClock::new(1_000));
        let (addresses, final_count) = derive_with_gap_limit(&core, &xpub).unwrap();

        // Window 20 has the funded address inside its tail, so it expands
        // once; at 40 the tail is quiet and usage was discovered.
        assert_eq!(final_count, 40);
        assert_eq!(addresses.len(), 40);
        assert_eq!(addresses[0].index, 0);
    }

    #[test]
    fn test_sparse_wallet_found_beyond_initial_window() {
        let dir = tempfile::tempdir().unwrap();
        let xpub = Xpub::parse(ZPUB).unwrap();
        let mock = Arc::new(MockChain::new(850_000));

        // Only index 42 is funded.
        mock.fund(&derived(&xpub, 60)[42].address, 10_000_000);

        let core = test_core(dir.path(), scan_config(), mock, FixedClock::new(1_000));
        let (addresses, final_count) = derive_with_gap_limit(&core, &xpub).unwrap();

        // 20 → 40 (bootstrap) → 60 (tail 40..59 contains 42) → 80 (quiet).
        assert_eq!(final_count, 80);
        assert!(addresses.iter().any(|d| d.index == 42));
    }

    #[test]
    fn test_spent_address_still_counts_as_used() {
        let dir = tempfile::tempdir().unwrap();
        let xpub = Xpub::parse(ZPUB).unwrap();
        let mock = Arc::new(MockChain::new(850_000));

        // Index 0 received and spent everything; "ever used" still holds.
        mock.drain(&derived(&xpub, 1)[0].address, 500_000);

        let core = test_core(dir.path(), scan_config(), mock, FixedClock::new(1_000));
        let (_, final_count) = derive_with_gap_limit(&core, &xpub).unwrap();

        assert_eq!(final_count, 40);
    }

    #[test]
    fn test_empty_wallet_stops_at_bootstrap_max() {
        let dir = tempfile::tempdir().unwrap();
        let xpub = Xpub::parse(ZPUB).unwrap();
        let mock = Arc::new(MockChain::new(850_000));

        let core = test_core(dir.path(), scan_config(), mock, FixedClock::new(1_000));
        let (_, final_count) = derive_with_gap_limit(&core, &xpub).unwrap();

        assert_eq!(final_count, 200);
    }

    #[test]
    fn test_bootstrap_disabled_stops_immediately_when_quiet() {
        let dir = tempfile::tempdir().unwrap();
        let xpub = Xpub::parse(ZPUB).unwrap();
        let mock = Arc::new(MockChain::new(850_000));

        let config = Config {
            xpub_enable_bootstrap_search: false,
            ..scan_config()
        };
        let core = test_core(dir.path(), config, mock, FixedClock::new(1_000));
        let (_, final_count) = derive_with_gap_limit(&core, &xpub).unwrap();

        assert_eq!(final_count, 20);
    }

    #[test]
    fn test_bootstrap_max_below_initial_still_returns_initial_window() {
        let dir = tempfile::tempdir().unwrap();
        let xpub = Xpub::parse(ZPUB).unwrap();
        let mock = Arc::new(MockChain::new(850_000));

        let config = Config {
            xpub_bootstrap_max_addresses: 10,
            ..scan_config()
        };
        let core = test_core(dir.path(), config, mock, FixedClock::new(1_000));
        let (addresses, final_count) = derive_with_gap_limit(&core, &xpub).unwrap();

        assert_eq!(final_count, 20);
        assert_eq!(addresses.len(), 20);
    }

    #[test]
    fn test_result_is_cached_under_gap_key() {
        let dir = tempfile::tempdir().unwrap();
        let xpub = Xpub::parse(ZPUB).unwrap();
        let mock = Arc::new(MockChain::new(850_000));

        let core = test_core(dir.path(), scan_config(), mock, FixedClock::new(1_000));
        let (addresses, final_count) = derive_with_gap_limit(&core, &xpub).unwrap();

        let params = GapParams::from_config(&core.config).unwrap();
        let (cached, cached_count) = core
            .derivation
            .gap_result(ZPUB, params.candidate_counts())
            .unwrap();
        assert_eq!(cached_count, final_count);
        assert_eq!(cached, addresses);
    }

    #[test]
    fn test_concurrent_scans_make_one_network_pass() {
        let dir = tempfile::tempdir().unwrap();
        let xpub = Xpub::parse(ZPUB).unwrap();
        let mock = Arc::new(MockChain::new(850_000));
        mock.fund(&derived(&xpub, 1)[0].address, 1_000);
        // Slow the scan down enough that the second caller reliably finds
        // the first one still in flight.
        mock.set_latency(Duration::from_millis(25));

        let core = Arc::new(test_core(
            dir.path(),
            scan_config(),
            mock.clone(),
            FixedClock::new(1_000),
        ));

        let barrier = Arc::new(std::sync::Barrier::new(2));
        let handles: Vec<_> = (0..2)
            .map(|_| {
                let core = core.clone();
                let xpub = xpub.clone();
                let barrier = barrier.clone();
                std::thread::spawn(move || {
                    barrier.wait();
                    derive_with_gap_limit(&core, &xpub).unwrap()
                })
            })
            .collect();

        let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert_eq!(results[0], results[1]);

        // One scan touches 40 distinct addresses; the second caller must
        // not have repeated any usage fetches.
        assert_eq!(mock.stats_calls(), 40);
        assert!(core.active_detections.lock().is_empty());
    }
}
