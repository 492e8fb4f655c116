//! Device-bound encrypted persistence for cache and config files.
//!
//! Sensitive files (extended public keys, derived addresses, wallet tables)
//! are encrypted with a key derived from a device fingerprint, so copying the
//! files to another machine yields nothing. The construction is the Fernet
//! layout: AES-128-CBC with PKCS7 padding, authenticated by HMAC-SHA256 over
//! `version ‖ IV ‖ ciphertext`, framed as url-safe base64.
//!
//! The only persisted secret-adjacent material is the random salt file; the
//! symmetric key is re-derived from the fingerprint on every process start
//! and never written anywhere. Losing the salt makes every encrypted cache
//! unrecoverable, which is the intended posture.

use aes::cipher::block_padding::Pkcs7;
use aes::cipher::{BlockDecryptMut as _, BlockEncryptMut as _, KeyIvInit as _};
use base64::engine::general_purpose::URL_SAFE;
use base64::Engine as _;
use hmac::{Hmac, Mac as _};
use memplora::bitcoin::hashes::{sha256, Hash as _};
use pbkdf2::pbkdf2_hmac;
use rand::rngs::OsRng;
use rand::RngCore as _;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{json, Value};
use sha2::Sha256;
use std::path::{Path, PathBuf};
use std::{env, fs, io};
use thiserror::Error;
use tracing::{debug, warn};

type Aes128CbcEnc = cbc::Encryptor<aes::Aes128>;
type Aes128CbcDec = cbc::Decryptor<aes::Aes128>;
type HmacSha256 = Hmac<Sha256>;

pub const SECURE_VERSION: &str = "1.0";

const TOKEN_VERSION: u8 = 0x80;
const SALT_LEN: usize = 32;
const MAC_LEN: usize = 32;
const IV_LEN: usize = 16;
// Moderate iteration count; the primary deployment target is a Pi Zero.
const PBKDF2_ITERATIONS: u32 = 100_000;

#[derive(Debug, Error)]
pub enum SecureError {
    #[error("I/O error")]
    Io(#[from] io::Error),

    #[error("JSON error")]
    Json(#[from] serde_json::Error),

    #[error("base64 decoding error")]
    Base64(#[from] base64::DecodeError),

    #[error("malformed encrypted envelope")]
    Malformed,

    #[error("payload failed authentication")]
    Unauthenticated,
}

/// The JSON envelope variant written around an encrypted payload.
#[derive(Copy, Clone, Debug)]
pub enum Envelope {
    /// `{_encrypted: true, _version, data}` — the sensitive half of the
    /// configuration.
    Config,

    /// `{_encrypted_cache: true, _version, _cache_type, data}` — an
    /// encrypted cache file, tagged with its cache type.
    Cache(&'static str),
}

/// Encrypts and decrypts JSON files with the device-bound key.
pub struct SecureStore {
    signing_key: [u8; 16],
    encryption_key: [u8; 16],
}

impl SecureStore {
    /// Open the store, creating the salt file on first use.
    ///
    /// The key is derived from [`device_fingerprint`] and the salt on every
    /// call; nothing but the salt touches the disk.
    pub fn open(salt_path: &Path) -> Result<Self, SecureError> {
        let salt = load_or_create_salt(salt_path)?;
        Ok(Self::from_password(&device_fingerprint(), &salt))
    }

    /// Derive the store key from an explicit password and salt.
    pub fn from_password(password: &str, salt: &[u8]) -> Self {
        let mut key = [0u8; 32];
        pbkdf2_hmac::<Sha256>(password.as_bytes(), salt, PBKDF2_ITERATIONS, &mut key);

        // Fernet key split: first half signs, second half encrypts.
        Self {
            signing_key: key[..16].try_into().unwrap(),
            encryption_key: key[16..].try_into().unwrap(),
        }
    }

    /// Load and decrypt a file. A missing file is `Ok(None)`; corruption or
    /// a failed MAC is an error, and callers fall back to an empty value.
    pub fn load(&self, path: &Path) -> Result<Option<Value>, SecureError> {
        let raw = match fs::read(path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err.into()),
        };

        let envelope: Value = serde_json::from_slice(&raw)?;
        let flagged = envelope
            .get("_encrypted")
            .or_else(|| envelope.get("_encrypted_cache"))
            .and_then(Value::as_bool)
            .unwrap_or(false);
        let token = envelope.get("data").and_then(Value::as_str);

        match (flagged, token) {
            (true, Some(token)) => Ok(Some(self.decrypt(token)?)),
            _ => Err(SecureError::Malformed),
        }
    }

    /// Typed convenience wrapper around [`SecureStore::load`].
    pub fn load_as<T: DeserializeOwned>(&self, path: &Path) -> Result<Option<T>, SecureError> {
        self.load(path)?
            .map(|value| serde_json::from_value(value).map_err(SecureError::from))
            .transpose()
    }

    /// Encrypt `value` and write it atomically with 0600 permissions.
    pub fn save(&self, path: &Path, envelope: Envelope, value: &Value) -> Result<(), SecureError> {
        let token = self.encrypt(value)?;
        let body = match envelope {
            Envelope::Config => json!({
                "_encrypted": true,
                "_version": SECURE_VERSION,
                "data": token,
            }),
            Envelope::Cache(cache_type) => json!({
                "_encrypted_cache": true,
                "_version": SECURE_VERSION,
                "_cache_type": cache_type,
                "data": token,
            }),
        };

        atomic_write(path, &serde_json::to_vec_pretty(&body)?)?;
        debug!("Saved encrypted file {path:?}");

        Ok(())
    }

    /// Typed convenience wrapper around [`SecureStore::save`].
    pub fn save_as<T: Serialize>(
        &self,
        path: &Path,
        envelope: Envelope,
        value: &T,
    ) -> Result<(), SecureError> {
        self.save(path, envelope, &serde_json::to_value(value)?)
    }

    fn encrypt(&self, value: &Value) -> Result<String, SecureError> {
        let plaintext = serde_json::to_vec(value)?;

        let mut iv = [0u8; IV_LEN];
        OsRng.fill_bytes(&mut iv);

        let ciphertext = Aes128CbcEnc::new(&self.encryption_key.into(), &iv.into())
            .encrypt_padded_vec_mut::<Pkcs7>(&plaintext);

        let mut token = Vec::with_capacity(1 + IV_LEN + ciphertext.len() + MAC_LEN);
        token.push(TOKEN_VERSION);
        token.extend_from_slice(&iv);
        token.extend_from_slice(&ciphertext);

        let mut mac = HmacSha256::new_from_slice(&self.signing_key)
            .expect("HMAC-SHA256 accepts keys of any length");
        mac.update(&token);
        token.extend_from_slice(&mac.finalize().into_bytes());

        Ok(URL_SAFE.encode(token))
    }

    fn decrypt(&self, token: &str) -> Result<Value, SecureError> {
        let raw = URL_SAFE.decode(token)?;
        if raw.len() < 1 + IV_LEN + MAC_LEN || raw[0] != TOKEN_VERSION {
            return Err(SecureError::Malformed);
        }

        let (body, tag) = raw.split_at(raw.len() - MAC_LEN);

        let mut mac = HmacSha256::new_from_slice(&self.signing_key)
            .expect("HMAC-SHA256 accepts keys of any length");
        mac.update(body);
        mac.verify_slice(tag)
            .map_err(|_| SecureError::Unauthenticated)?;

        let iv: [u8; IV_LEN] = body[1..1 + IV_LEN].try_into().unwrap();
        let plaintext = Aes128CbcDec::new(&self.encryption_key.into(), &iv.into())
            .decrypt_padded_vec_mut::<Pkcs7>(&body[1 + IV_LEN..])
            .map_err(|_| SecureError::Unauthenticated)?;

        Ok(serde_json::from_slice(&plaintext)?)
    }
}

/// Write `bytes` to `path` via a temp file and atomic rename, restricting
/// permissions to the owner. Parent directories are created as needed.
pub(crate) fn atomic_write(path: &Path, bytes: &[u8]) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }

    let mut tmp = path.as_os_str().to_os_string();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);

    fs::write(&tmp, bytes)?;
    restrict_permissions(&tmp)?;
    fs::rename(&tmp, path)?;

    Ok(())
}

#[cfg(unix)]
fn restrict_permissions(path: &Path) -> io::Result<()> {
    use std::os::unix::fs::PermissionsExt as _;
    fs::set_permissions(path, fs::Permissions::from_mode(0o600))
}

#[cfg(not(unix))]
fn restrict_permissions(_path: &Path) -> io::Result<()> {
    Ok(())
}

fn load_or_create_salt(path: &Path) -> Result<[u8; SALT_LEN], SecureError> {
    if let Ok(raw) = fs::read(path) {
        if let Ok(salt) = <[u8; SALT_LEN]>::try_from(raw.as_slice()) {
            return Ok(salt);
        }
        warn!("Salt file {path:?} has the wrong length, recreating it");
    }

    let mut salt = [0u8; SALT_LEN];
    OsRng.fill_bytes(&mut salt);
    atomic_write(path, &salt)?;
    debug!("Created new salt file {path:?}");

    Ok(salt)
}

/// A stable fingerprint of the machine the process is running on.
///
/// SHA-256 over `|`-joined identifiers, most specific first:
///
/// - CPU serial from `/proc/cpuinfo` (present on Raspberry Pi); falls back
///   to `/etc/hostname`
/// - first non-loopback MAC from `/sys/class/net`; falls back to
///   `/etc/machine-id`, then the architecture string (containers, CI)
/// - OS and architecture constants
/// - the numeric uid from `/proc/self/status`; falls back to
///   `USER`/`USERNAME` on systems without procfs
///
/// Every component is chosen to survive a reboot on the same device.
pub fn device_fingerprint() -> String {
    let mut parts = Vec::with_capacity(5);

    parts.push(cpu_serial().or_else(hostname).unwrap_or_else(|| "unknown-host".to_string()));
    parts.push(
        first_mac()
            .or_else(machine_id)
            .unwrap_or_else(|| env::consts::ARCH.to_string()),
    );
    parts.push(env::consts::OS.to_string());
    parts.push(env::consts::ARCH.to_string());
    parts.push(
        process_uid()
            .or_else(|| env::var("USER").or_else(|_| env::var("USERNAME")).ok())
            .unwrap_or_else(|| "unknown-user".to_string()),
    );

    sha256::Hash::hash(parts.join("|").as_bytes()).to_string()
}

fn cpu_serial() -> Option<String> {
    fs::read_to_string("/proc/cpuinfo")
        .ok()?
        .lines()
        .find(|line| line.starts_with("Serial"))
        .map(|line| line.trim().to_string())
}

fn hostname() -> Option<String> {
    fs::read_to_string("/etc/hostname")
        .ok()
        .map(|name| name.trim().to_string())
        .filter(|name| !name.is_empty())
}

/// The real uid of the process, read from the `Uid:` line of
/// `/proc/self/status`.
fn process_uid() -> Option<String> {
    fs::read_to_string("/proc/self/status")
        .ok()?
        .lines()
        .find(|line| line.starts_with("Uid:"))
        .and_then(|line| line.split_whitespace().nth(1).map(str::to_string))
}

fn machine_id() -> Option<String> {
    fs::read_to_string("/etc/machine-id")
        .ok()
        .map(|id| id.trim().to_string())
        .filter(|id| !id.is_empty())
}

fn first_mac() -> Option<String> {
    let mut interfaces: Vec<String> = fs::read_dir("/sys/class/net")
        .ok()?
        .flatten()
        .map(|entry| entry.file_name().to_string_lossy().into_owned())
        .filter(|name| name != "lo")
        .collect();
    interfaces.sort();

    for name in interfaces {
        if let Ok(mac) = fs::read_to_string(format!("/sys/class/net/{name}/address")) {
            let mac = mac.trim();
            if !mac.is_empty() && mac != "00:00:00:00:00:00" {
                return Some(mac.to_string());
            }
        }
    }

    None
}
