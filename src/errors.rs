//! Convenience re-exports of every error type in the crate.

pub use crate::client::mempool::MempoolClientError;
pub use crate::client::{ClientError, PoolError};
pub use crate::config::ConfigError;
pub use crate::core::CoreError;
pub use crate::derivation::DerivationError;
pub use crate::keys::KeyError;
pub use crate::rewards::RewardError;
pub use crate::scan::optimized::OptimizedStoreError;
pub use crate::scan::ScanError;
pub use crate::secure::SecureError;
