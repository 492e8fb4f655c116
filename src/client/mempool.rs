use super::{ChainApi, ClientError};
use crate::config::Config;
use memplora::bitcoin::{BlockHash, Txid};
use memplora::{
    AddressStats, BlockInfo, BlockTxids, FeeEstimates, Memplora, Req, Transaction,
};
use serde::de::DeserializeOwned;
use std::time::Duration;
use thiserror::Error;
use tracing::trace;
use ureq::tls::{TlsConfig, TlsProvider};
use ureq::Agent;

#[derive(Debug, Error)]
pub enum MempoolClientError {
    #[error("Invalid mempool REST URI")]
    Uri(#[from] memplora::http::Error),
}

/// A blocking REST client for a mempool/Esplora instance.
///
/// One shared [`Agent`] provides connection pooling across all worker
/// threads; total outstanding requests are bounded by the worker pool caps.
pub struct MempoolClient {
    agent: Agent,
    proto: Memplora,
}

impl MempoolClient {
    pub fn new(config: &Config) -> Result<Self, MempoolClientError> {
        let proto = Memplora::new(config.api_base_url())?;

        // Self-hosted instances commonly run with self-signed certificates;
        // `mempool_verify_ssl: false` opts out of verification for them.
        let agent = Agent::from(
            Agent::config_builder()
                .timeout_global(Some(Duration::from_secs(config.mempool_timeout_secs)))
                .max_idle_connections_per_host(super::USAGE_WORKERS)
                .tls_config(
                    TlsConfig::builder()
                        .provider(TlsProvider::NativeTls)
                        .disable_verification(!config.mempool_verify_ssl)
                        .build(),
                )
                .build(),
        );

        Ok(Self { agent, proto })
    }

    fn run_json<T: DeserializeOwned>(&self, req: Req) -> Result<T, ClientError> {
        trace!("GET {}", req.uri());
        let mut resp = self.agent.run(req).map_err(transport_error)?;
        resp.body_mut()
            .read_json()
            .map_err(|err| ClientError::Protocol(err.to_string()))
    }

    fn run_text(&self, req: Req) -> Result<String, ClientError> {
        trace!("GET {}", req.uri());
        let mut resp = self.agent.run(req).map_err(transport_error)?;
        resp.body_mut()
            .read_to_string()
            .map_err(|err| ClientError::Transport(err.to_string()))
    }
}

fn transport_error(err: ureq::Error) -> ClientError {
    match err {
        ureq::Error::StatusCode(code) => ClientError::Status(code),
        other => ClientError::Transport(other.to_string()),
    }
}

impl ChainApi for MempoolClient {
    fn tip_height(&self) -> Result<u64, ClientError> {
        let body = self.run_text(self.proto.tip_height())?;
        body.trim()
            .parse()
            .map_err(|_| ClientError::Protocol(format!("tip height `{}`", body.trim())))
    }

    fn block_hash_at(&self, height: u64) -> Result<BlockHash, ClientError> {
        let body = self.run_text(self.proto.block_hash_at(height))?;
        body.trim()
            .parse()
            .map_err(|_| ClientError::Protocol(format!("block hash `{}`", body.trim())))
    }

    fn address_stats(&self, address: &str) -> Result<AddressStats, ClientError> {
        self.run_json(self.proto.address_stats(address))
    }

    fn address_txs(
        &self,
        address: &str,
        offset: Option<usize>,
    ) -> Result<Vec<Transaction>, ClientError> {
        let req = match offset {
            Some(offset) => self.proto.address_txs_chain(address, offset),
            None => self.proto.address_txs(address),
        };
        self.run_json(req)
    }

    fn block(&self, hash: &BlockHash) -> Result<BlockInfo, ClientError> {
        self.run_json(self.proto.block(*hash))
    }

    fn block_txids(&self, hash: &BlockHash) -> Result<Vec<Txid>, ClientError> {
        let txids: BlockTxids = self.run_json(self.proto.block_txids(*hash))?;
        Ok(txids.into_vec())
    }

    fn tx(&self, txid: &Txid) -> Result<Transaction, ClientError> {
        self.run_json(self.proto.tx(*txid))
    }

    fn fees_recommended(&self) -> Result<FeeEstimates, ClientError> {
        self.run_json(self.proto.fees_recommended())
    }
}
