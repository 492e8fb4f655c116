//! Address scanning: usage snapshots, gap-limit discovery, and the
//! optimized balance engine.

use crate::client::{ChainApi, ClientError};
use crate::config::{Config, ConfigError};
use crate::core::WalletCore;
use crate::derivation::DerivationError;
use crate::keys::{DerivedAddress, KeyError, Xpub};
use crate::util::crop;
use memplora::AddressStats;
use rayon::prelude::*;
use rayon::ThreadPool;
use std::collections::{BTreeSet, HashMap};
use thiserror::Error;
use tracing::warn;

pub mod gap_limit;
pub mod optimized;

#[derive(Debug, Error)]
pub enum ScanError {
    #[error("configuration error")]
    Config(#[from] ConfigError),

    #[error("key derivation error")]
    Key(#[from] KeyError),

    #[error("derivation cache error")]
    Derivation(#[from] DerivationError),

    #[error("REST client error")]
    Client(#[from] ClientError),
}

/// Usage snapshot for one address. Satoshi-denominated; conversion to BTC
/// happens at the aggregator boundary.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct AddressUsage {
    pub balance_sat: u64,
    pub total_received_sat: u64,
    pub total_spent_sat: u64,
    pub tx_count: u64,
}

impl AddressUsage {
    pub fn from_stats(stats: &AddressStats) -> Self {
        Self {
            balance_sat: stats.chain_stats.balance_sat(),
            total_received_sat: stats.chain_stats.funded_txo_sum,
            total_spent_sat: stats.chain_stats.spent_txo_sum,
            tx_count: stats.chain_stats.tx_count,
        }
    }

    /// Received funds or appeared in a transaction at any point.
    pub fn ever_used(&self) -> bool {
        self.total_received_sat > 0 || self.tx_count > 0
    }

    /// Held funds in the past, empty now.
    pub fn is_spent(&self) -> bool {
        self.total_received_sat > 0 && self.balance_sat == 0
    }
}

/// Gap-limit parameters resolved from configuration.
#[derive(Clone, Copy, Debug)]
pub struct GapParams {
    pub initial_count: u32,
    pub gap_limit: u32,
    pub increment: u32,
    pub bootstrap_enabled: bool,
    pub bootstrap_increment: u32,
    pub bootstrap_max: u32,
}

/// Hard cap on the window when expanding by the standard increment.
pub const STANDARD_HARD_CAP: u32 = 500;

impl GapParams {
    pub fn from_config(config: &Config) -> Result<Self, ScanError> {
        config.validate()?;

        Ok(Self {
            initial_count: config.xpub_derivation_count,
            gap_limit: config.xpub_gap_limit_last_n,
            increment: config.xpub_gap_limit_increment.max(1),
            bootstrap_enabled: config.xpub_enable_bootstrap_search,
            bootstrap_increment: config.xpub_bootstrap_increment.max(1),
            bootstrap_max: config.xpub_bootstrap_max_addresses,
        })
    }

    /// Every terminal window size a finished scan could have stored under a
    /// `:gap_limit:` key, for cache probing.
    pub fn candidate_counts(&self) -> Vec<u32> {
        let mut counts = BTreeSet::new();

        let mut count = self.initial_count;
        counts.insert(count);
        while count < self.bootstrap_max {
            count += self.bootstrap_increment;
            counts.insert(count);
        }

        let mut count = self.initial_count;
        while count < STANDARD_HARD_CAP {
            count += self.increment;
            counts.insert(count);
        }

        counts.into_iter().collect()
    }
}

/// Fetch usage for a batch of addresses on the bounded usage pool.
///
/// Per-address failures are logged and degrade to "never used"; they do not
/// abort the batch.
pub(crate) fn fetch_usage_batch(
    pool: &ThreadPool,
    client: &dyn ChainApi,
    addresses: &[DerivedAddress],
) -> HashMap<String, AddressUsage> {
    pool.install(|| {
        addresses
            .par_iter()
            .map(|derived| {
                let usage = match client.address_stats(&derived.address) {
                    Ok(stats) => AddressUsage::from_stats(&stats),
                    Err(err) => {
                        warn!("Usage fetch failed for {}: {err}", crop(&derived.address));
                        AddressUsage::default()
                    }
                };
                (derived.address.clone(), usage)
            })
            .collect()
    })
}

/// Fetch the confirmed balance of one address, treating failures as zero.
pub(crate) fn fetch_balance_sat(client: &dyn ChainApi, address: &str) -> u64 {
    match client.address_stats(address) {
        Ok(stats) => stats.chain_stats.balance_sat(),
        Err(err) => {
            warn!("Balance fetch failed for {}: {err}", crop(address));
            0
        }
    }
}

/// Fetch balances for many addresses on the bounded balance pool.
pub(crate) fn fetch_balances(
    pool: &ThreadPool,
    client: &dyn ChainApi,
    addresses: &[String],
) -> HashMap<String, u64> {
    pool.install(|| {
        addresses
            .par_iter()
            .map(|address| (address.clone(), fetch_balance_sat(client, address)))
            .collect()
    })
}

/// The address universe for an extended key: the gap-limit result when the
/// rule is enabled (cached if available), the fixed window otherwise.
pub(crate) fn xpub_addresses(
    core: &WalletCore,
    xpub: &Xpub,
) -> Result<Vec<DerivedAddress>, ScanError> {
    if core.config.xpub_enable_gap_limit {
        let params = GapParams::from_config(&core.config)?;
        if let Some((addresses, _)) = core
            .derivation
            .gap_result(xpub.encoded(), params.candidate_counts())
        {
            return Ok(addresses);
        }

        let (addresses, _) = gap_limit::derive_with_gap_limit(core, xpub)?;
        Ok(addresses)
    } else {
        Ok(core
            .derivation
            .get_or_derive(xpub, core.config.xpub_derivation_count, 0)?)
    }
}
