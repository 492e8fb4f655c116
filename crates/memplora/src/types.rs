//! Typed responses for the mempool/Esplora REST surface.

use bitcoin::hashes::Hash as _;
use bitcoin::{BlockHash, ScriptBuf, Txid};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// JSON parsing errors for [`Status`].
#[derive(Debug, Error)]
pub enum Error {
    /// Missing `status.block_height` field.
    #[error("Missing `status.block_height` field")]
    Height,

    /// Missing `status.block_hash` field.
    #[error("Missing `status.block_hash` field")]
    Hash,

    /// Missing or invalid `status.block_time` field.
    #[error("Missing or invalid `status.block_time` field")]
    Time,
}

/// Confirmed and unconfirmed totals for a single address.
///
/// All sums are satoshi-denominated; conversion to BTC happens in higher
/// layers only.
#[derive(Clone, Debug, Default, Deserialize, Serialize, Eq, PartialEq)]
pub struct AddressStats {
    /// The address the statistics belong to.
    #[serde(default)]
    pub address: String,

    /// Totals over confirmed transactions.
    pub chain_stats: ChainStats,

    /// Totals over mempool transactions. Ignored by the wallet engine, which
    /// only reports confirmed balances.
    #[serde(default)]
    pub mempool_stats: Option<ChainStats>,
}

/// Satoshi-denominated counters for an address.
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, Eq, PartialEq)]
pub struct ChainStats {
    #[serde(default)]
    pub funded_txo_count: u64,

    /// Total satoshis ever received.
    #[serde(default)]
    pub funded_txo_sum: u64,

    #[serde(default)]
    pub spent_txo_count: u64,

    /// Total satoshis ever spent.
    #[serde(default)]
    pub spent_txo_sum: u64,

    /// Number of transactions touching the address.
    #[serde(default)]
    pub tx_count: u64,
}

impl ChainStats {
    /// Current confirmed balance in satoshis.
    pub fn balance_sat(&self) -> u64 {
        self.funded_txo_sum.saturating_sub(self.spent_txo_sum)
    }

    /// `true` if the address received funds or appeared in a transaction at
    /// any point in its history.
    pub fn ever_used(&self) -> bool {
        self.funded_txo_sum > 0 || self.tx_count > 0
    }

    /// `true` if the address held funds in the past but is empty now.
    pub fn is_spent(&self) -> bool {
        self.funded_txo_sum > 0 && self.balance_sat() == 0
    }
}

/// A transaction as reported by the REST API.
#[derive(Clone, Debug, Deserialize, Serialize, Eq, PartialEq)]
pub struct Transaction {
    /// Transaction ID.
    pub txid: Txid,

    /// Transaction version.
    #[serde(default)]
    pub version: u32,

    /// Block height or timestamp for transaction finalization.
    #[serde(rename = "locktime", default)]
    pub lock_time: u32,

    /// Transaction inputs.
    #[serde(rename = "vin")]
    pub inputs: Vec<TxIn>,

    /// Transaction outputs.
    #[serde(rename = "vout")]
    pub outputs: Vec<TxOut>,

    #[serde(default)]
    pub size: u32,

    #[serde(default)]
    pub weight: u64,

    /// Fee paid for the transaction, in satoshis. Zero for coinbase.
    #[serde(default)]
    pub fee: u64,

    /// Whether the transaction has been confirmed, and where.
    pub status: Status,
}

impl Transaction {
    /// `true` when the first input carries any positive coinbase signal.
    ///
    /// Backends disagree on how to mark coinbase inputs; see
    /// [`TxIn::is_coinbase`] for the accepted signals. A transaction whose
    /// provider reports none of them is treated as non-coinbase rather than
    /// guessed at.
    pub fn is_coinbase(&self) -> bool {
        self.inputs.first().is_some_and(TxIn::is_coinbase)
    }

    /// The confirmation height, if the transaction is confirmed.
    pub fn block_height(&self) -> Option<u32> {
        match self.status {
            Status::Confirmed { block_height, .. } => Some(block_height),
            Status::Unconfirmed => None,
        }
    }
}

/// [`Transaction`] input.
///
/// Coinbase inputs are encoded three different ways in the wild, so every
/// field that participates in the classification is optional.
#[derive(Clone, Debug, Default, Deserialize, Serialize, Eq, PartialEq)]
pub struct TxIn {
    /// Previous transaction output ID. All zeros (or absent) for coinbase.
    #[serde(default)]
    pub txid: Option<Txid>,

    /// Previous transaction output index. `0xffff_ffff` for coinbase.
    #[serde(rename = "vout", default)]
    pub index: u32,

    /// Previous transaction output. Absent for coinbase.
    #[serde(rename = "prevout", default)]
    pub previous_output: Option<TxOut>,

    /// Script signature.
    #[serde(rename = "scriptsig", default)]
    pub script_sig: Option<ScriptBuf>,

    /// Explicit coinbase marker used by Esplora and local mempool instances.
    #[serde(rename = "is_coinbase", default)]
    pub coinbase_flag: Option<bool>,

    /// Raw coinbase script, present on bitcoind-flavored APIs instead of the
    /// boolean marker.
    #[serde(default)]
    pub coinbase: Option<String>,

    /// Sequence number.
    #[serde(default)]
    pub sequence: u32,
}

impl TxIn {
    /// `true` if any single coinbase signal is positive: the explicit
    /// `is_coinbase` flag, the presence of a `coinbase` script field, or an
    /// all-zero previous txid.
    pub fn is_coinbase(&self) -> bool {
        self.coinbase_flag == Some(true)
            || self.coinbase.is_some()
            || self.txid == Some(Txid::all_zeros())
    }
}

/// [`Transaction`] output.
#[derive(Clone, Debug, Default, Deserialize, Serialize, Eq, PartialEq)]
pub struct TxOut {
    /// Script public key.
    #[serde(rename = "scriptpubkey", default)]
    pub script_pubkey: ScriptBuf,

    /// The address form of the script, when the backend can express one.
    #[serde(rename = "scriptpubkey_address", default)]
    pub address: Option<String>,

    /// Output value in satoshis.
    #[serde(default)]
    pub value: u64,
}

/// Network consensus status for [`Transaction`].
#[derive(Clone, Copy, Debug, Deserialize, Serialize, Eq, PartialEq)]
#[serde(try_from = "JsonStatus")]
#[serde(into = "JsonStatus")]
pub enum Status {
    /// Transaction has not yet been confirmed by the network.
    Unconfirmed,

    /// Transaction has been confirmed by consensus.
    Confirmed {
        /// The block height containing the transaction.
        block_height: u32,

        /// The block hash that uniquely identifies the block.
        block_hash: BlockHash,

        /// Absolute timestamp for the block, as agreed upon by the network.
        block_time: DateTime<Utc>,
    },
}

#[derive(Clone, Copy, Debug, Deserialize, Serialize)]
struct JsonStatus {
    confirmed: bool,
    block_height: Option<u32>,
    block_hash: Option<BlockHash>,
    block_time: Option<i64>,
}

impl TryFrom<JsonStatus> for Status {
    type Error = Error;

    fn try_from(value: JsonStatus) -> Result<Self, Self::Error> {
        match value.confirmed {
            false => Ok(Status::Unconfirmed),
            true => Ok(Status::Confirmed {
                block_height: value.block_height.ok_or(Error::Height)?,
                block_hash: value.block_hash.ok_or(Error::Hash)?,
                block_time: value
                    .block_time
                    .and_then(|timestamp| DateTime::from_timestamp(timestamp, 0))
                    .ok_or(Error::Time)?,
            }),
        }
    }
}

impl From<Status> for JsonStatus {
    fn from(value: Status) -> Self {
        match value {
            Status::Unconfirmed => JsonStatus {
                confirmed: false,
                block_height: None,
                block_hash: None,
                block_time: None,
            },
            Status::Confirmed {
                block_height,
                block_hash,
                block_time,
            } => JsonStatus {
                confirmed: true,
                block_height: Some(block_height),
                block_hash: Some(block_hash),
                block_time: Some(block_time.timestamp()),
            },
        }
    }
}

/// Block metadata.
#[derive(Clone, Debug, Deserialize, Serialize, Eq, PartialEq)]
pub struct BlockInfo {
    /// The block hash.
    pub id: BlockHash,

    /// The block height.
    pub height: u64,

    #[serde(default)]
    pub timestamp: i64,

    #[serde(default)]
    pub tx_count: u64,

    /// Inlined transactions, offered by some backends. Callers must fall
    /// back to the txids endpoint when absent.
    #[serde(default)]
    pub tx: Option<Vec<Transaction>>,
}

/// The `block/{hash}/txids` response.
///
/// Backends disagree on the envelope: a bare array, `{"txids": [...]}`, or
/// `{"transactions": [...]}` are all seen in the wild.
#[derive(Clone, Debug, Deserialize)]
#[serde(untagged)]
pub enum BlockTxids {
    Plain(Vec<Txid>),
    Txids { txids: Vec<Txid> },
    Transactions { transactions: Vec<Txid> },
}

impl BlockTxids {
    pub fn into_vec(self) -> Vec<Txid> {
        match self {
            Self::Plain(txids) => txids,
            Self::Txids { txids } => txids,
            Self::Transactions { transactions } => transactions,
        }
    }
}

/// The `v1/fees/recommended` response. All values are sat/vB.
#[derive(Clone, Copy, Debug, Deserialize, Serialize, Eq, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct FeeEstimates {
    pub fastest_fee: u64,
    pub half_hour_fee: u64,
    pub hour_fee: u64,
    pub economy_fee: u64,
    pub minimum_fee: u64,
}
