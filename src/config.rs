//! Application configuration.
//!
//! Non-sensitive keys live in a plain `config.json`; keys that reveal wallet
//! contents are stored beside it in `config.secure.json`, encrypted through
//! [`SecureStore`]. Loading merges the two; saving splits them back apart.

use crate::secure::{Envelope, SecureError, SecureStore};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::path::PathBuf;
use std::sync::Arc;
use std::{fs, io};
use thiserror::Error;
use tracing::warn;

/// Keys that must never be written to the plain config file.
pub const SENSITIVE_KEYS: [&str; 4] = [
    "wallet_balance_addresses_with_comments",
    "block_reward_addresses_table",
    "admin_password_hash",
    "secret_key",
];

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error")]
    Io(#[from] io::Error),

    #[error("JSON error")]
    Json(#[from] serde_json::Error),

    #[error("secure storage error")]
    Secure(#[from] SecureError),

    #[error("`xpub_gap_limit_last_n` must be greater than zero")]
    ZeroGapLimit,

    #[error("`xpub_derivation_count` must be within 1..=100, found {0}")]
    DerivationCount(u32),
}

/// Balance display unit. Display-only; every computation stays in satoshis.
#[derive(Copy, Clone, Debug, Default, Deserialize, Serialize, Eq, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum BalanceUnit {
    #[default]
    #[serde(alias = "BTC")]
    Btc,
    #[serde(alias = "SATS")]
    Sats,
}

/// One row of the wallet table: a plain address or an extended public key.
#[derive(Clone, Debug, Deserialize, Serialize, Eq, PartialEq)]
pub struct WalletEntry {
    pub address: String,

    #[serde(default)]
    pub comment: String,

    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub entry_type: Option<EntryKind>,
}

#[derive(Copy, Clone, Debug, Deserialize, Serialize, Eq, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum EntryKind {
    Address,
    #[serde(alias = "xpub", alias = "zpub")]
    Extended,
}

impl WalletEntry {
    /// The declared entry type, inferred from the prefix when absent.
    pub fn kind(&self) -> EntryKind {
        self.entry_type.unwrap_or_else(|| {
            let lower = self.address.to_ascii_lowercase();
            if lower.starts_with("xpub") || lower.starts_with("zpub") {
                EntryKind::Extended
            } else {
                EntryKind::Address
            }
        })
    }
}

/// One row of the block-reward monitoring table.
#[derive(Clone, Debug, Deserialize, Serialize, Eq, PartialEq)]
pub struct RewardAddressEntry {
    pub address: String,

    #[serde(default)]
    pub comment: String,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    pub mempool_host: String,
    pub mempool_rest_port: u16,
    pub mempool_use_https: bool,
    pub mempool_verify_ssl: bool,
    /// Per-request timeout for the REST client, in seconds.
    pub mempool_timeout_secs: u64,

    /// Initial derivation window for extended keys (1..=100).
    pub xpub_derivation_count: u32,
    pub xpub_enable_gap_limit: bool,
    /// BIP-44 gap rule: stop after this many consecutive unused addresses.
    pub xpub_gap_limit_last_n: u32,
    pub xpub_gap_limit_increment: u32,
    pub xpub_enable_bootstrap_search: bool,
    pub xpub_bootstrap_increment: u32,
    pub xpub_bootstrap_max_addresses: u32,

    /// The wallet table. Sensitive: stored encrypted.
    pub wallet_balance_addresses_with_comments: Vec<WalletEntry>,
    /// Addresses monitored for coinbase payouts. Sensitive: stored encrypted.
    pub block_reward_addresses_table: Vec<RewardAddressEntry>,

    pub wallet_balance_unit: BalanceUnit,
    pub wallet_balance_show_fiat: bool,
    pub btc_price_currency: String,

    pub optimized_balance_cache_days: u32,
    pub optimized_balance_buffer_addresses: u32,
    pub enable_optimized_balance_monitoring: bool,

    /// Process-local balance cache TTL, in seconds.
    pub wallet_balance_cache_timeout: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            mempool_host: "127.0.0.1".to_string(),
            mempool_rest_port: 4081,
            mempool_use_https: false,
            mempool_verify_ssl: true,
            mempool_timeout_secs: 10,

            xpub_derivation_count: 20,
            xpub_enable_gap_limit: true,
            xpub_gap_limit_last_n: 20,
            xpub_gap_limit_increment: 20,
            xpub_enable_bootstrap_search: true,
            xpub_bootstrap_increment: 20,
            xpub_bootstrap_max_addresses: 200,

            wallet_balance_addresses_with_comments: Vec::new(),
            block_reward_addresses_table: Vec::new(),

            wallet_balance_unit: BalanceUnit::Btc,
            wallet_balance_show_fiat: false,
            btc_price_currency: "USD".to_string(),

            optimized_balance_cache_days: 50,
            optimized_balance_buffer_addresses: 5,
            enable_optimized_balance_monitoring: true,

            wallet_balance_cache_timeout: 60,
        }
    }
}

impl Config {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.xpub_gap_limit_last_n == 0 {
            return Err(ConfigError::ZeroGapLimit);
        }
        if !(1..=100).contains(&self.xpub_derivation_count) {
            return Err(ConfigError::DerivationCount(self.xpub_derivation_count));
        }

        Ok(())
    }

    /// The REST API base URL. The port is omitted when it matches the
    /// protocol default, so reverse-proxied instances get clean URLs.
    pub fn api_base_url(&self) -> String {
        let scheme = if self.mempool_use_https { "https" } else { "http" };
        let default_port = if self.mempool_use_https { 443 } else { 80 };

        if self.mempool_rest_port == default_port {
            format!("{scheme}://{}/api", self.mempool_host)
        } else {
            format!("{scheme}://{}:{}/api", self.mempool_host, self.mempool_rest_port)
        }
    }
}

/// Reads and writes the split public/secure configuration pair.
pub struct ConfigStore {
    public_path: PathBuf,
    secure_path: PathBuf,
    store: Arc<SecureStore>,
}

impl ConfigStore {
    pub fn new(config_dir: PathBuf, store: Arc<SecureStore>) -> Self {
        Self {
            public_path: config_dir.join("config.json"),
            secure_path: config_dir.join("config.secure.json"),
            store,
        }
    }

    /// Load the merged configuration.
    ///
    /// A missing public file yields defaults. An unreadable secure file is
    /// treated as empty (with a warning) so a fresh device still starts; it
    /// simply has no wallets configured.
    pub fn load(&self) -> Result<Config, ConfigError> {
        let mut merged = match fs::read(&self.public_path) {
            Ok(raw) => serde_json::from_slice::<Map<String, Value>>(&raw)?,
            Err(err) if err.kind() == io::ErrorKind::NotFound => Map::new(),
            Err(err) => return Err(err.into()),
        };

        match self.store.load(&self.secure_path) {
            Ok(Some(Value::Object(secure))) => merged.extend(secure),
            Ok(Some(_)) | Ok(None) => {}
            Err(err) => {
                warn!("Unreadable secure config, continuing without it: {err}");
            }
        }

        let config: Config = serde_json::from_value(Value::Object(merged))?;
        config.validate()?;

        Ok(config)
    }

    /// Persist a configuration, splitting sensitive keys into the encrypted
    /// peer file. Both writes are atomic.
    pub fn save(&self, config: &Config) -> Result<(), ConfigError> {
        let Value::Object(all) = serde_json::to_value(config)? else {
            unreachable!("Config serializes to an object");
        };

        let mut public = Map::new();
        let mut secure = Map::new();
        for (key, value) in all {
            if SENSITIVE_KEYS.contains(&key.as_str()) {
                secure.insert(key, value);
            } else {
                public.insert(key, value);
            }
        }

        crate::secure::atomic_write(
            &self.public_path,
            &serde_json::to_vec_pretty(&Value::Object(public))?,
        )?;
        self.store
            .save(&self.secure_path, Envelope::Config, &Value::Object(secure))?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_store() -> Arc<SecureStore> {
        Arc::new(SecureStore::from_password(
            "test-device",
            b"0123456789abcdef0123456789abcdef",
        ))
    }

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.xpub_derivation_count, 20);
        assert_eq!(config.optimized_balance_cache_days, 50);
        assert_eq!(config.optimized_balance_buffer_addresses, 5);
        assert!(config.enable_optimized_balance_monitoring);
        assert_eq!(config.wallet_balance_cache_timeout, 60);
        config.validate().unwrap();
    }

    #[test]
    fn test_zero_gap_limit_rejected() {
        let config = Config {
            xpub_gap_limit_last_n: 0,
            ..Config::default()
        };
        assert!(matches!(config.validate(), Err(ConfigError::ZeroGapLimit)));
    }

    #[test]
    fn test_derivation_count_bounds() {
        let config = Config {
            xpub_derivation_count: 101,
            ..Config::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::DerivationCount(101))
        ));
    }

    #[test]
    fn test_entry_kind_inference() {
        let plain = WalletEntry {
            address: "bc1qar0srrr7xfkvy5l643lydnw9re59gtzzwf5mdq".to_string(),
            comment: String::new(),
            entry_type: None,
        };
        assert_eq!(plain.kind(), EntryKind::Address);

        let extended = WalletEntry {
            address: "zpub6rFR7y4Q2AijBEqTUquhVz398htDFrtymD9xYYfG1m4wAcvPhXNfE3EfH1r1ADqtfSdVCToUG868RvUUkgDKf31mGDtKsAYz2oz2AGutZYs".to_string(),
            comment: String::new(),
            entry_type: None,
        };
        assert_eq!(extended.kind(), EntryKind::Extended);

        // An explicit type wins over prefix inference.
        let declared = WalletEntry {
            entry_type: Some(EntryKind::Address),
            ..extended
        };
        assert_eq!(declared.kind(), EntryKind::Address);
    }

    #[test]
    fn test_api_base_url() {
        let mut config = Config::default();
        assert_eq!(config.api_base_url(), "http://127.0.0.1:4081/api");

        config.mempool_use_https = true;
        config.mempool_rest_port = 443;
        config.mempool_host = "mempool.example.org".to_string();
        assert_eq!(config.api_base_url(), "https://mempool.example.org/api");

        config.mempool_rest_port = 8443;
        assert_eq!(config.api_base_url(), "https://mempool.example.org:8443/api");
    }

    #[test]
    fn test_save_splits_sensitive_keys() {
        let dir = tempfile::tempdir().unwrap();
        let store = test_store();
        let config_store = ConfigStore::new(dir.path().to_path_buf(), store);

        let config = Config {
            wallet_balance_addresses_with_comments: vec![WalletEntry {
                address: "bc1qar0srrr7xfkvy5l643lydnw9re59gtzzwf5mdq".to_string(),
                comment: "Cold storage".to_string(),
                entry_type: None,
            }],
            ..Config::default()
        };

        config_store.save(&config).unwrap();

        // The plain file must not contain any sensitive key.
        let public: Value =
            serde_json::from_slice(&fs::read(dir.path().join("config.json")).unwrap()).unwrap();
        for key in SENSITIVE_KEYS {
            assert!(public.get(key).is_none(), "{key} leaked into plain config");
        }
        assert_eq!(public["mempool_rest_port"], serde_json::json!(4081));

        // The secure file is an encrypted envelope, not plaintext JSON.
        let raw = fs::read_to_string(dir.path().join("config.secure.json")).unwrap();
        assert!(raw.contains("\"_encrypted\": true"));
        assert!(!raw.contains("Cold storage"));

        let loaded = config_store.load().unwrap();
        assert_eq!(
            loaded.wallet_balance_addresses_with_comments[0].comment,
            "Cold storage"
        );
    }

    #[test]
    fn test_load_missing_files_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config_store = ConfigStore::new(dir.path().to_path_buf(), test_store());

        let config = config_store.load().unwrap();
        assert_eq!(config.xpub_derivation_count, 20);
        assert!(config.wallet_balance_addresses_with_comments.is_empty());
    }
}
