//! A [mempool.space]/[Esplora] REST protocol implementation, [sans I/O].
//! (Bring your own HTTP client!)
//!
//! This library handles the protocol-layer aspects of a mempool or Esplora
//! instance: request construction and strictly-typed ser-de of the responses.
//! It intentionally performs no network I/O, which keeps it usable from both
//! sync and async HTTP clients and trivially testable.
//!
//! [mempool.space]: https://mempool.space/docs/api/rest
//! [Esplora]: https://github.com/Blockstream/esplora/blob/master/API.md
//! [sans I/O]: https://sans-io.readthedocs.io/how-to-sans-io.html
//!
//! # Sync example with `ureq`
//!
//! ```no_run
//! use memplora::{AddressStats, Memplora};
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let agent = ureq::agent();
//!     let mempool = Memplora::new("http://127.0.0.1:4081/api/")?;
//!
//!     let mut resp = agent.run(mempool.address_stats("bc1qar0srrr7xfkvy5l643lydnw9re59gtzzwf5mdq"))?;
//!     let stats: AddressStats = resp.body_mut().read_json()?;
//!
//!     println!("{} sat", stats.chain_stats.balance_sat());
//!
//!     Ok(())
//! }
//! ```

#![forbid(unsafe_code)]

pub use bitcoin;
pub use chrono;
pub use http;
pub use rust_decimal;

pub use self::types::{
    AddressStats, BlockInfo, BlockTxids, ChainStats, FeeEstimates, Status, Transaction, TxIn,
    TxOut,
};
use bitcoin::{BlockHash, Txid};
use http::{Request, Uri};
use rust_decimal::Decimal;

mod types;

/// A bodiless HTTP request, ready to be sent by any HTTP client.
pub type Req = http::Request<()>;

/// Convert a satoshi amount into a BTC-denominated [`Decimal`] with scale 8.
///
/// This is the only sanctioned sats-to-BTC conversion; everything on the wire
/// stays satoshi-denominated.
pub fn btc_from_sats(sats: u64) -> Decimal {
    Decimal::from_i128_with_scale(sats as i128, 8)
}

/// The main protocol type. Builds [`Req`]s for every endpoint the wallet
/// engine consumes.
#[derive(Clone, Debug)]
pub struct Memplora {
    req: Req,
}

impl Memplora {
    /// Protocol constructor.
    ///
    /// The API endpoint string must be a valid [`Uri`].
    ///
    /// # Example
    ///
    /// ```
    /// # use memplora::Memplora;
    /// # fn main() -> Result<(), memplora::http::Error> {
    /// let mempool = Memplora::new("https://mempool.example.org/api/")?;
    /// # Ok(())
    /// # }
    /// ```
    ///
    /// # Panics
    ///
    /// Asserts that the API server URL has both a scheme and host component,
    /// disallowing relative URIs like `/api` and non-network URIs like
    /// `data:`.
    pub fn new<U>(api: U) -> Result<Self, http::Error>
    where
        U: TryInto<Uri>,
        <U as TryInto<Uri>>::Error: Into<http::Error>,
    {
        let req = Request::get(api).body(())?;
        assert!(req.uri().scheme().is_some());
        assert!(req.uri().host().is_some());

        Ok(Self { req })
    }

    /// Get the current chain tip height.
    ///
    /// The response body is a plain-text integer, not JSON.
    pub fn tip_height(&self) -> Req {
        self.at("blocks/tip/height".to_string())
    }

    /// Get the [`BlockHash`] at `height`.
    ///
    /// The response body is a plain-text hash, not JSON.
    pub fn block_hash_at(&self, height: u64) -> Req {
        self.at(format!("block-height/{height}"))
    }

    /// Get confirmed/mempool statistics for an address.
    ///
    /// The response deserializes into an [`AddressStats`].
    pub fn address_stats(&self, address: &str) -> Req {
        self.at(format!("address/{address}"))
    }

    /// Get the first page (up to 25) of confirmed transactions for an address.
    ///
    /// The response deserializes into a `Vec<Transaction>`. A full page of 25
    /// means more pages may exist; see [`Memplora::address_txs_chain`].
    pub fn address_txs(&self, address: &str) -> Req {
        self.at(format!("address/{address}/txs"))
    }

    /// Get a later page of confirmed transactions for an address, continuing
    /// after `offset` transactions already seen.
    pub fn address_txs_chain(&self, address: &str, offset: usize) -> Req {
        self.at(format!("address/{address}/txs/chain/{offset}"))
    }

    /// Get block metadata by [`BlockHash`].
    ///
    /// The response deserializes into a [`BlockInfo`]. Some backends inline
    /// the block's transactions; most do not, and callers must fall back to
    /// [`Memplora::block_txids`].
    pub fn block(&self, hash: BlockHash) -> Req {
        self.at(format!("block/{hash}"))
    }

    /// Get a list of [`Txid`]s by [`BlockHash`].
    ///
    /// The response deserializes into a [`BlockTxids`], which tolerates the
    /// envelope variants seen across backends.
    pub fn block_txids(&self, hash: BlockHash) -> Req {
        self.at(format!("block/{hash}/txids"))
    }

    /// Get a [`Transaction`] by [`Txid`].
    pub fn tx(&self, txid: Txid) -> Req {
        self.at(format!("tx/{txid}"))
    }

    /// Get the current fee recommendations.
    ///
    /// The response deserializes into a [`FeeEstimates`].
    pub fn fees_recommended(&self) -> Req {
        self.at("v1/fees/recommended".to_string())
    }

    /// Clone the base request with `path` appended.
    fn at(&self, path: String) -> Req {
        let mut req = self.req.clone();

        // The `http` crate has really bad ergonomics for updating paths.
        // SEE: https://github.com/hyperium/http/issues/594
        let req_uri = req.uri_mut();
        let mut uri_parts = req_uri.clone().into_parts();
        let root = req_uri.path();
        let slash = if root.ends_with('/') { "" } else { "/" };
        uri_parts.path_and_query = Some(format!("{root}{slash}{path}").parse().unwrap());
        *req_uri = Uri::from_parts(uri_parts).unwrap();

        req
    }
}
