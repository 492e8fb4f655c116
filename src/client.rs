use memplora::bitcoin::{BlockHash, Txid};
use memplora::{AddressStats, BlockInfo, FeeEstimates, Transaction};
use rayon::{ThreadPool, ThreadPoolBuilder};
use thiserror::Error;

pub mod mempool;

// Hard caps, not targets. Sized for a private mempool instance; an adapter
// targeting the public API should tighten them via `WorkerPools::with_caps`.
pub const USAGE_WORKERS: usize = 20;
pub const BALANCE_WORKERS: usize = 10;
pub const XKEY_WORKERS: usize = 5;

#[derive(Debug, Error)]
pub enum PoolError {
    #[error("Rayon thread pool error")]
    Build(#[from] rayon::ThreadPoolBuildError),
}

#[derive(Clone, Debug, Error)]
pub enum ClientError {
    #[error("HTTP status {0}")]
    Status(u16),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("unexpected response shape: {0}")]
    Protocol(String),
}

/// The REST surface consumed by the scanning subsystems.
///
/// Exists as a trait so that unit tests can mock the client responses.
pub trait ChainApi: Send + Sync {
    /// Current chain tip height.
    fn tip_height(&self) -> Result<u64, ClientError>;

    /// Block hash at the given height.
    fn block_hash_at(&self, height: u64) -> Result<BlockHash, ClientError>;

    /// Confirmed statistics for an address.
    fn address_stats(&self, address: &str) -> Result<AddressStats, ClientError>;

    /// One page (up to 25) of confirmed transactions for an address.
    /// `offset` continues a paginated walk through the history.
    fn address_txs(
        &self,
        address: &str,
        offset: Option<usize>,
    ) -> Result<Vec<Transaction>, ClientError>;

    /// Block metadata, possibly with inlined transactions.
    fn block(&self, hash: &BlockHash) -> Result<BlockInfo, ClientError>;

    /// The txids of a block, first entry being the coinbase.
    fn block_txids(&self, hash: &BlockHash) -> Result<Vec<Txid>, ClientError>;

    /// A single transaction.
    fn tx(&self, txid: &Txid) -> Result<Transaction, ClientError>;

    /// Current fee recommendations.
    fn fees_recommended(&self) -> Result<FeeEstimates, ClientError>;
}

/// The bounded worker pools shared by the scanning subsystems.
pub struct WorkerPools {
    /// Batch address-usage fetches during gap-limit scans.
    pub usage: ThreadPool,

    /// Per-address balance fetches.
    pub balance: ThreadPool,

    /// Per-extended-key scans inside the aggregator.
    pub xkeys: ThreadPool,
}

impl WorkerPools {
    pub fn new() -> Result<Self, PoolError> {
        Self::with_caps(USAGE_WORKERS, BALANCE_WORKERS, XKEY_WORKERS)
    }

    pub fn with_caps(usage: usize, balance: usize, xkeys: usize) -> Result<Self, PoolError> {
        Ok(Self {
            usage: ThreadPoolBuilder::new().num_threads(usage).build()?,
            balance: ThreadPoolBuilder::new().num_threads(balance).build()?,
            xkeys: ThreadPoolBuilder::new().num_threads(xkeys).build()?,
        })
    }
}
