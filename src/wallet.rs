//! The wallet aggregator: one call that turns the configured entries into a
//! deduplicated, fiat-annotated balance report.

use crate::config::{BalanceUnit, EntryKind, WalletEntry};
use crate::core::WalletCore;
use crate::keys::{short_key, Xpub};
use crate::scan::optimized::optimized_balance;
use crate::scan::{self, GapParams};
use crate::util::crop;
use memplora::btc_from_sats;
use rayon::prelude::*;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use tracing::{debug, info, warn};

/// A manual address with a confirmed balance.
#[derive(Clone, Debug, Deserialize, Serialize, Eq, PartialEq)]
pub struct AddressBalance {
    pub address: String,
    pub balance_btc: Decimal,
    pub comment: String,
}

/// An extended-key wallet with a confirmed balance. Only the abbreviated
/// key form leaves this module.
#[derive(Clone, Debug, Deserialize, Serialize, Eq, PartialEq)]
pub struct XpubBalance {
    pub xpub_short: String,
    pub balance_btc: Decimal,
    pub comment: String,
}

/// A manually configured address that is also derived from one of the
/// configured extended keys.
#[derive(Clone, Debug, Deserialize, Serialize, Eq, PartialEq)]
pub struct Conflict {
    pub address: String,
    pub xkey_short: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub derivation_index: Option<u32>,
}

/// A successful aggregate fetch. This is also what the "last known" cache
/// persists for render consumers.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
pub struct WalletSnapshot {
    pub addresses: Vec<AddressBalance>,
    pub xpubs: Vec<XpubBalance>,
    pub total_btc: Decimal,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_fiat: Option<Decimal>,
    pub fiat_currency: String,
    pub unit: BalanceUnit,
    pub duplicates_removed: usize,
    pub show_fiat: bool,
    /// Non-fatal problems, e.g. extended keys that failed to parse while
    /// other entries went through.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// The outcome of a wallet fetch. Failures are values; this call never
/// panics and never raises.
#[derive(Clone, Debug, Serialize, PartialEq)]
#[serde(untagged)]
pub enum WalletReport {
    Ready(WalletSnapshot),
    Failed {
        error: String,
        #[serde(skip_serializing_if = "Vec::is_empty")]
        conflicts: Vec<Conflict>,
    },
}

impl WalletReport {
    pub fn error(&self) -> Option<&str> {
        match self {
            Self::Ready(snapshot) => snapshot.error.as_deref(),
            Self::Failed { error, .. } => Some(error),
        }
    }

    pub fn snapshot(&self) -> Option<&WalletSnapshot> {
        match self {
            Self::Ready(snapshot) => Some(snapshot),
            Self::Failed { .. } => None,
        }
    }

    fn failed(error: impl Into<String>) -> Self {
        Self::Failed {
            error: error.into(),
            conflicts: Vec::new(),
        }
    }
}

/// Fetch every configured wallet balance.
///
/// Guarded by a non-reentrant try-lock: a second caller gets an immediate
/// `Balance fetch in progress` failure instead of queueing. Conflict
/// detection runs before any balance work and short-circuits the call; the
/// engine refuses to silently deduplicate away a user-specified address.
pub fn fetch_wallet_balances(core: &WalletCore, startup_mode: bool) -> WalletReport {
    let Some(_guard) = core.fetch_lock.try_lock() else {
        debug!("Wallet balance fetch already in progress, skipping duplicate request");
        return WalletReport::failed("Balance fetch in progress");
    };

    let entries = &core.config.wallet_balance_addresses_with_comments;
    if entries.is_empty() {
        return WalletReport::failed("No wallet addresses, XPUBs, or ZPUBs configured");
    }

    info!("Processing {} wallet entries", entries.len());

    let mut manual: Vec<&WalletEntry> = Vec::new();
    let mut extended: Vec<&WalletEntry> = Vec::new();
    for entry in entries {
        match entry.kind() {
            EntryKind::Address => manual.push(entry),
            EntryKind::Extended => extended.push(entry),
        }
    }

    let mut parse_failures: Vec<String> = Vec::new();
    let mut keys: Vec<(&WalletEntry, Xpub)> = Vec::new();
    for entry in extended {
        match Xpub::parse(&entry.address) {
            Ok(xpub) => keys.push((entry, xpub)),
            Err(err) => {
                warn!("Unparseable extended key `{}`: {err}", crop(&entry.address));
                parse_failures.push(format!("{}: {err}", short_key(&entry.address)));
            }
        }
    }

    // A fully-invalid config is a user-visible error; a mixed one carries
    // on with the valid entries and surfaces the failures.
    if !parse_failures.is_empty() && keys.is_empty() && manual.is_empty() {
        return WalletReport::failed(format!(
            "No valid wallet entries: {}",
            parse_failures.join("; ")
        ));
    }
    let error_note = (!parse_failures.is_empty()).then(|| {
        format!(
            "Skipped extended keys that failed to parse: {}",
            parse_failures.join("; ")
        )
    });

    // Conflict detection precedes all balance work and uses only local
    // derivations (plus already-cached gap results), so a conflicting
    // config is rejected with zero network calls.
    let derived_sets: Vec<(String, HashMap<String, u32>)> = keys
        .iter()
        .map(|(_, xpub)| (xpub.short(), derived_address_set(core, xpub)))
        .collect();

    let mut conflicts: Vec<Conflict> = Vec::new();
    for entry in &manual {
        for (xkey_short, derived) in &derived_sets {
            if let Some(&index) = derived.get(&entry.address) {
                conflicts.push(Conflict {
                    address: entry.address.clone(),
                    xkey_short: xkey_short.clone(),
                    derivation_index: Some(index),
                });
            }
        }
    }
    if !conflicts.is_empty() {
        return WalletReport::Failed {
            error: conflict_message(&conflicts),
            conflicts,
        };
    }

    // Deduplicate: drop manual addresses already covered by a derived set.
    let all_derived: HashSet<&String> = derived_sets
        .iter()
        .flat_map(|(_, derived)| derived.keys())
        .collect();
    let covered = manual.len();
    manual.retain(|entry| !all_derived.contains(&entry.address));
    let duplicates_removed = covered - manual.len();
    if duplicates_removed > 0 {
        info!("Filtered {duplicates_removed} manual addresses already covered by extended keys");
    }

    // Manual address balances, on the bounded balance pool.
    let manual_balances: Vec<(String, String, u64)> = core.pools.balance.install(|| {
        manual
            .par_iter()
            .map(|entry| {
                let sats = scan::fetch_balance_sat(&*core.client, &entry.address);
                (entry.address.clone(), entry.comment.clone(), sats)
            })
            .collect()
    });
    let addresses: Vec<AddressBalance> = manual_balances
        .into_iter()
        .filter(|(_, _, sats)| *sats > 0)
        .map(|(address, comment, sats)| AddressBalance {
            address,
            balance_btc: btc_from_sats(sats),
            comment: default_comment(comment, "Address"),
        })
        .collect();

    // Extended-key scans in parallel on the bounded key pool.
    let xpubs: Vec<XpubBalance> = core.pools.xkeys.install(|| {
        keys.par_iter()
            .filter_map(|(entry, xpub)| match optimized_balance(core, xpub, startup_mode) {
                Ok(sats) if sats > 0 => Some(XpubBalance {
                    xpub_short: xpub.short(),
                    balance_btc: btc_from_sats(sats),
                    comment: default_comment(entry.comment.clone(), "Hardware Wallet"),
                }),
                Ok(_) => None,
                Err(err) => {
                    warn!("Balance scan failed for `{}`: {err}", xpub.short());
                    None
                }
            })
            .collect()
    });

    let total_btc: Decimal = addresses
        .iter()
        .map(|entry| entry.balance_btc)
        .chain(xpubs.iter().map(|entry| entry.balance_btc))
        .sum();

    // A missing rate reports fiat zero; it never fails the whole call.
    let show_fiat = core.config.wallet_balance_show_fiat;
    let fiat_currency = core.config.btc_price_currency.clone();
    let total_fiat = show_fiat.then(|| match core.oracle.rate(&fiat_currency) {
        Some(rate) => total_btc * rate,
        None => {
            warn!("No {fiat_currency} rate available, reporting fiat as zero");
            Decimal::ZERO
        }
    });

    let snapshot = WalletSnapshot {
        addresses,
        xpubs,
        total_btc,
        total_fiat,
        fiat_currency,
        unit: core.config.wallet_balance_unit,
        duplicates_removed,
        show_fiat,
        error: error_note,
    };

    info!(
        "Wallet fetch complete: {} BTC across {} addresses and {} extended keys",
        snapshot.total_btc,
        snapshot.addresses.len(),
        snapshot.xpubs.len(),
    );

    core.persist_snapshot(&snapshot);

    WalletReport::Ready(snapshot)
}

/// The derived `address → index` set of one extended key, for conflict
/// detection and deduplication. Served from the cached gap-limit result
/// when one exists, otherwise from a locally derived fixed window.
fn derived_address_set(core: &WalletCore, xpub: &Xpub) -> HashMap<String, u32> {
    let cached = GapParams::from_config(&core.config)
        .ok()
        .and_then(|params| core.derivation.gap_result(xpub.encoded(), params.candidate_counts()));

    let derived = match cached {
        Some((derived, _)) => derived,
        None => match core
            .derivation
            .get_or_derive(xpub, core.config.xpub_derivation_count, 0)
        {
            Ok(derived) => derived,
            Err(err) => {
                warn!("Could not derive conflict set for `{}`: {err}", xpub.short());
                return HashMap::new();
            }
        },
    };

    derived
        .into_iter()
        .map(|derived| (derived.address, derived.index))
        .collect()
}

fn default_comment(comment: String, fallback: &str) -> String {
    if comment.is_empty() {
        fallback.to_string()
    } else {
        comment
    }
}

fn conflict_message(conflicts: &[Conflict]) -> String {
    if let [conflict] = conflicts {
        let index_info = conflict
            .derivation_index
            .map(|index| format!(" (derivation index {index})"))
            .unwrap_or_default();
        return format!(
            "Address conflict detected: '{}' is manually added but also derived from {}{}. \
             Remove either the manual address or the extended key to avoid double-counting.",
            conflict.address, conflict.xkey_short, index_info,
        );
    }

    let lines: Vec<String> = conflicts
        .iter()
        .map(|conflict| {
            let index_info = conflict
                .derivation_index
                .map(|index| format!(" (index {index})"))
                .unwrap_or_default();
            format!("'{}' from {}{}", conflict.address, conflict.xkey_short, index_info)
        })
        .collect();

    format!(
        "Multiple address conflicts detected: {}. These addresses are both manually added and \
         derived from extended keys; remove the duplicates to avoid double-counting.",
        lines.join(", "),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::mock::MockChain;
    use crate::config::Config;
    use crate::core::testutil::{test_core, FixedClock, StaticRate};
    use std::sync::Arc;

    const ZPUB: &str = "zpub6rFR7y4Q2AijBEqTUquhVz398htDFrtymD9xYYfG1m4wAcvPhXNfE3EfH1r1ADqtfSdVCToUG868RvUUkgDKf31mGDtKsAYz2oz2AGutZYs";

    fn entry(address: &str, comment: &str) -> WalletEntry {
        WalletEntry {
            address: address.to_string(),
            comment: comment.to_string(),
            entry_type: None,
        }
    }

    fn config_with(entries: Vec<WalletEntry>) -> Config {
        Config {
            wallet_balance_addresses_with_comments: entries,
            ..Config::default()
        }
    }

    fn zpub_addresses(count: u32) -> Vec<String> {
        Xpub::parse(ZPUB)
            .unwrap()
            .derive(count, 0)
            .unwrap()
            .into_iter()
            .map(|d| d.address)
            .collect()
    }

    #[test]
    fn test_funded_zpub_wallet() {
        let dir = tempfile::tempdir().unwrap();
        let mock = Arc::new(MockChain::new(850_000));
        mock.fund(&zpub_addresses(1)[0], 3_445_077);

        let core = test_core(
            dir.path(),
            config_with(vec![entry(ZPUB, "Cold storage")]),
            mock,
            FixedClock::new(100 * 86_400),
        );

        let report = fetch_wallet_balances(&core, false);
        let snapshot = report.snapshot().expect("fetch should succeed");

        assert_eq!(snapshot.total_btc.to_string(), "0.03445077");
        assert_eq!(snapshot.xpubs.len(), 1);
        assert_eq!(snapshot.xpubs[0].xpub_short, "zpub...2AGutZYs");
        assert_eq!(snapshot.xpubs[0].comment, "Cold storage");
        assert!(snapshot.addresses.is_empty());
        assert_eq!(snapshot.duplicates_removed, 0);
        assert!(snapshot.error.is_none());
    }

    #[test]
    fn test_conflict_short_circuits_before_any_balance_call() {
        let dir = tempfile::tempdir().unwrap();
        let mock = Arc::new(MockChain::new(850_000));

        // The manual address is the zpub's index-3 receive address.
        let conflicting = zpub_addresses(4)[3].clone();
        let core = test_core(
            dir.path(),
            config_with(vec![entry(&conflicting, "Oops"), entry(ZPUB, "Wallet")]),
            mock.clone(),
            FixedClock::new(100 * 86_400),
        );

        let report = fetch_wallet_balances(&core, false);
        let WalletReport::Failed { error, conflicts } = report else {
            panic!("expected a conflict failure");
        };

        assert!(error.contains("manually added but also derived from"));
        assert!(error.contains("derivation index 3"));
        assert_eq!(conflicts.len(), 1);
        assert_eq!(conflicts[0].address, conflicting);
        assert_eq!(conflicts[0].xkey_short, "zpub...2AGutZYs");
        assert_eq!(conflicts[0].derivation_index, Some(3));

        // Conflict detection made zero balance calls.
        assert_eq!(mock.stats_calls(), 0);
    }

    #[test]
    fn test_contended_fetch_fails_fast() {
        let dir = tempfile::tempdir().unwrap();
        let core = test_core(
            dir.path(),
            config_with(vec![entry(ZPUB, "")]),
            Arc::new(MockChain::new(850_000)),
            FixedClock::new(100 * 86_400),
        );

        let _held = core.fetch_lock.lock();
        let report = fetch_wallet_balances(&core, false);

        assert_eq!(report.error(), Some("Balance fetch in progress"));
    }

    #[test]
    fn test_empty_config_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let core = test_core(
            dir.path(),
            config_with(Vec::new()),
            Arc::new(MockChain::new(850_000)),
            FixedClock::new(100 * 86_400),
        );

        let report = fetch_wallet_balances(&core, false);
        assert!(report.error().unwrap().contains("No wallet addresses"));
    }

    #[test]
    fn test_fully_invalid_config_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let core = test_core(
            dir.path(),
            config_with(vec![entry("xpub6garbagegarbagegarbage", "Bad")]),
            Arc::new(MockChain::new(850_000)),
            FixedClock::new(100 * 86_400),
        );

        let report = fetch_wallet_balances(&core, false);
        assert!(report.snapshot().is_none());
        assert!(report.error().unwrap().contains("No valid wallet entries"));
    }

    #[test]
    fn test_mixed_config_continues_and_surfaces_failures() {
        let dir = tempfile::tempdir().unwrap();
        let mock = Arc::new(MockChain::new(850_000));
        mock.fund(&zpub_addresses(1)[0], 50_000);

        let core = test_core(
            dir.path(),
            config_with(vec![
                entry("xpub6garbagegarbagegarbage", "Bad"),
                entry(ZPUB, "Good"),
            ]),
            mock,
            FixedClock::new(100 * 86_400),
        );

        let report = fetch_wallet_balances(&core, false);
        let snapshot = report.snapshot().expect("valid entries should proceed");

        assert_eq!(snapshot.xpubs.len(), 1);
        assert!(snapshot.error.as_deref().unwrap().contains("failed to parse"));
    }

    #[test]
    fn test_manual_addresses_only() {
        let dir = tempfile::tempdir().unwrap();
        let mock = Arc::new(MockChain::new(850_000));
        mock.fund("bc1qfundedmanualaddress", 250_000);

        let core = test_core(
            dir.path(),
            config_with(vec![
                entry("bc1qfundedmanualaddress", "Tips"),
                entry("bc1qemptymanualaddress", "Empty"),
            ]),
            mock,
            FixedClock::new(100 * 86_400),
        );

        let report = fetch_wallet_balances(&core, false);
        let snapshot = report.snapshot().unwrap();

        // Only positive balances are reported, with their comments.
        assert_eq!(snapshot.addresses.len(), 1);
        assert_eq!(snapshot.addresses[0].address, "bc1qfundedmanualaddress");
        assert_eq!(snapshot.addresses[0].comment, "Tips");
        assert_eq!(snapshot.total_btc.to_string(), "0.00250000");
        assert!(snapshot.xpubs.is_empty());
    }

    #[test]
    fn test_fiat_conversion() {
        let dir = tempfile::tempdir().unwrap();
        let mock = Arc::new(MockChain::new(850_000));
        mock.fund("bc1qfundedmanualaddress", 100_000_000);

        let mut core = test_core(
            dir.path(),
            Config {
                wallet_balance_show_fiat: true,
                btc_price_currency: "EUR".to_string(),
                ..config_with(vec![entry("bc1qfundedmanualaddress", "")])
            },
            mock,
            FixedClock::new(100 * 86_400),
        );
        core.oracle = Arc::new(StaticRate(Decimal::new(60_000, 0)));

        let report = fetch_wallet_balances(&core, false);
        let snapshot = report.snapshot().unwrap();

        assert_eq!(snapshot.total_btc.to_string(), "1.00000000");
        assert_eq!(snapshot.total_fiat.unwrap().to_string(), "60000.00000000");
        assert_eq!(snapshot.fiat_currency, "EUR");
        assert!(snapshot.show_fiat);
    }

    #[test]
    fn test_missing_rate_reports_zero_fiat() {
        let dir = tempfile::tempdir().unwrap();
        let mock = Arc::new(MockChain::new(850_000));
        mock.fund("bc1qfundedmanualaddress", 100_000);

        let core = test_core(
            dir.path(),
            Config {
                wallet_balance_show_fiat: true,
                ..config_with(vec![entry("bc1qfundedmanualaddress", "")])
            },
            mock,
            FixedClock::new(100 * 86_400),
        );

        let report = fetch_wallet_balances(&core, false);
        let snapshot = report.snapshot().unwrap();

        assert_eq!(snapshot.total_fiat, Some(Decimal::ZERO));
    }

    #[test]
    fn test_snapshot_is_persisted_for_render_consumers() {
        let dir = tempfile::tempdir().unwrap();
        let mock = Arc::new(MockChain::new(850_000));
        mock.fund("bc1qfundedmanualaddress", 750_000);

        let core = test_core(
            dir.path(),
            config_with(vec![entry("bc1qfundedmanualaddress", "Tips")]),
            mock,
            FixedClock::new(100 * 86_400),
        );

        let report = fetch_wallet_balances(&core, false);
        let cached = core.cached_wallet_balances().expect("snapshot persisted");

        similar_asserts::assert_eq!(Some(&cached), report.snapshot());
    }

    #[test]
    fn test_success_result_is_disjoint_from_derived_sets() {
        let dir = tempfile::tempdir().unwrap();
        let mock = Arc::new(MockChain::new(850_000));
        let manual = "bc1qfundedmanualaddress";
        mock.fund(manual, 10_000);
        mock.fund(&zpub_addresses(1)[0], 20_000);

        let core = test_core(
            dir.path(),
            config_with(vec![entry(manual, ""), entry(ZPUB, "")]),
            mock,
            FixedClock::new(100 * 86_400),
        );

        let report = fetch_wallet_balances(&core, false);
        let snapshot = report.snapshot().unwrap();

        let derived: HashSet<String> = zpub_addresses(200).into_iter().collect();
        for reported in &snapshot.addresses {
            assert!(!derived.contains(&reported.address));
        }
    }
}
