use memplora::bitcoin::hashes::{sha512, Hash as _, HashEngine, Hmac, HmacEngine};
use memplora::bitcoin::secp256k1::{self, Scalar, Secp256k1, VerifyOnly};
use memplora::bitcoin::{address, base58, Address, Network, PublicKey};
use serde::{Deserialize, Serialize};
use std::sync::LazyLock;
use thiserror::Error;
use tracing::warn;

/// Child indices at or above this bound require the private key.
const HARDENED_BOUND: u32 = 1 << 31;

static SECP: LazyLock<Secp256k1<VerifyOnly>> = LazyLock::new(Secp256k1::verification_only);

#[derive(Debug, Error)]
pub enum KeyError {
    #[error("base58 decoding error")]
    Base58(#[from] base58::Error),

    #[error("extended key payload must be 78 bytes, found {0}")]
    Length(usize),

    #[error("unsupported extended key version {0:02x?}")]
    UnsupportedVersion([u8; 4]),

    #[error("public key prefix must be 0x02 or 0x03, found {0:#04x}")]
    PublicKeyPrefix(u8),

    #[error("secp256k1 error")]
    Secp(#[from] secp256k1::Error),

    #[error("hardened derivation is not possible with a public key")]
    Hardened,

    #[error("child key at index {0} is unusable")]
    UnusableChild(u32),

    #[error("address encoding error")]
    Address(#[from] address::Error),
}

/// Address encoding implied by the extended key version.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Deserialize, Serialize)]
pub enum AddressKind {
    /// "xpub": legacy base58check addresses.
    P2pkh,
    /// "zpub": bech32 segwit v0 addresses.
    P2wpkh,
}

impl AddressKind {
    fn encode(&self, child: &secp256k1::PublicKey) -> Result<String, KeyError> {
        let pubkey = PublicKey::new(*child);

        let address = match self {
            Self::P2pkh => Address::p2pkh(&pubkey, Network::Bitcoin),
            Self::P2wpkh => Address::p2wpkh(&pubkey, Network::Bitcoin)?,
        };

        Ok(address.to_string())
    }
}

/// An account-level extended public key that remembers its original encoding.
///
/// Only the two mainnet versions are accepted: "xpub" (`0x0488b21e`, P2PKH)
/// and "zpub" (`0x04b24746`, P2WPKH). Everything else — testnet, "ypub",
/// multisig variants — is rejected rather than guessed at.
#[derive(Clone, Debug)]
pub struct Xpub {
    encoded: String,
    kind: AddressKind,
    depth: u8,
    parent_fingerprint: [u8; 4],
    child_number: u32,
    chain_code: [u8; 32],
    public_key: secp256k1::PublicKey,
}

/// A single receive address with its derivation index on the external chain
/// (`m/0/i`).
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct DerivedAddress {
    pub address: String,
    pub index: u32,
}

impl Xpub {
    // See: https://github.com/satoshilabs/slips/blob/master/slip-0132.md
    pub fn parse(encoded: &str) -> Result<Self, KeyError> {
        let data = base58::decode_check(encoded)?;
        if data.len() != 78 {
            return Err(KeyError::Length(data.len()));
        }

        let kind = match data[..4] {
            [0x04, 0x88, 0xb2, 0x1e] => AddressKind::P2pkh,
            [0x04, 0xb2, 0x47, 0x46] => AddressKind::P2wpkh,
            _ => return Err(KeyError::UnsupportedVersion(data[..4].try_into().unwrap())),
        };

        if !matches!(data[45], 0x02 | 0x03) {
            return Err(KeyError::PublicKeyPrefix(data[45]));
        }

        Ok(Self {
            encoded: encoded.to_string(),
            kind,
            depth: data[4],
            parent_fingerprint: data[5..9].try_into().unwrap(),
            child_number: u32::from_be_bytes(data[9..13].try_into().unwrap()),
            chain_code: data[13..45].try_into().unwrap(),
            public_key: secp256k1::PublicKey::from_slice(&data[45..78])?,
        })
    }

    /// The original string encoding.
    pub fn encoded(&self) -> &str {
        &self.encoded
    }

    pub fn kind(&self) -> AddressKind {
        self.kind
    }

    pub fn depth(&self) -> u8 {
        self.depth
    }

    pub fn parent_fingerprint(&self) -> [u8; 4] {
        self.parent_fingerprint
    }

    pub fn child_number(&self) -> u32 {
        self.child_number
    }

    /// Abbreviated form for reports and logs: `zpub...A1B2C3D4`.
    pub fn short(&self) -> String {
        short_key(&self.encoded)
    }

    /// Derive `count` external-chain receive addresses starting at index
    /// `start`.
    ///
    /// The external-chain node `m/0` is derived once and reused for the
    /// whole batch. `count == 0` returns an empty list without touching the
    /// HMAC. A child that falls outside the curve order is skipped, as
    /// BIP-32 requires; its index is simply absent from the result.
    pub fn derive(&self, count: u32, start: u32) -> Result<Vec<DerivedAddress>, KeyError> {
        if count == 0 {
            return Ok(Vec::new());
        }

        let end = start
            .checked_add(count)
            .filter(|end| *end <= HARDENED_BOUND)
            .ok_or(KeyError::Hardened)?;

        let (external_pk, external_cc) = derive_child(&self.public_key, &self.chain_code, 0)?;

        let mut addresses = Vec::with_capacity(count as usize);
        for index in start..end {
            let (child, _) = match derive_child(&external_pk, &external_cc, index) {
                Ok(pair) => pair,
                Err(KeyError::UnusableChild(index)) => {
                    // Astronomically rare, but mandated by BIP-32.
                    warn!("Skipping unusable child index {index} for `{}`", self.short());
                    continue;
                }
                Err(err) => return Err(err),
            };

            addresses.push(DerivedAddress {
                address: self.kind.encode(&child)?,
                index,
            });
        }

        Ok(addresses)
    }
}

/// Abbreviate an extended key for reports and logs.
pub(crate) fn short_key(encoded: &str) -> String {
    if encoded.len() <= 12 {
        return encoded.to_string();
    }
    format!("{}...{}", &encoded[..4], &encoded[encoded.len() - 8..])
}

/// One step of public BIP-32 derivation: `I = HMAC-SHA512(cc, ser_P(pk) ‖ i)`,
/// child point `pk + parse256(I_L)·G`, child chain code `I_R`.
///
/// An `I_L` at or beyond the curve order, or a child point at infinity, makes
/// the index unusable ([`KeyError::UnusableChild`]); callers skip it.
fn derive_child(
    parent: &secp256k1::PublicKey,
    chain_code: &[u8; 32],
    index: u32,
) -> Result<(secp256k1::PublicKey, [u8; 32]), KeyError> {
    if index >= HARDENED_BOUND {
        return Err(KeyError::Hardened);
    }

    let mut engine = HmacEngine::<sha512::Hash>::new(chain_code);
    engine.input(&parent.serialize());
    engine.input(&index.to_be_bytes());
    let output = Hmac::<sha512::Hash>::from_engine(engine).to_byte_array();

    let tweak = Scalar::from_be_bytes(output[..32].try_into().unwrap())
        .map_err(|_| KeyError::UnusableChild(index))?;
    let child = parent
        .add_exp_tweak(&SECP, &tweak)
        .map_err(|_| KeyError::UnusableChild(index))?;

    Ok((child, output[32..].try_into().unwrap()))
}

#[cfg(test)]
mod tests {
    use super::*;

    // Well-known account-level test keys with published receive addresses.
    const XPUB: &str = "xpub6CUGRUonZSQ4TWtTMmzXdrXDtypWKiKrhko4egpiMZbpiaQL2jkwSB1icqYh2cfDfVxdx4df189oLKnC5fSwqPfgyP3hooxujYzAu3fDVmz";
    const ZPUB: &str = "zpub6rFR7y4Q2AijBEqTUquhVz398htDFrtymD9xYYfG1m4wAcvPhXNfE3EfH1r1ADqtfSdVCToUG868RvUUkgDKf31mGDtKsAYz2oz2AGutZYs";

    #[test]
    fn test_parse_xpub() {
        let key = Xpub::parse(XPUB).unwrap();
        assert_eq!(key.kind(), AddressKind::P2pkh);
        assert_eq!(key.encoded(), XPUB);
    }

    #[test]
    fn test_parse_zpub() {
        let key = Xpub::parse(ZPUB).unwrap();
        assert_eq!(key.kind(), AddressKind::P2wpkh);
    }

    #[test]
    fn test_reject_foreign_version() {
        // Re-encode the xpub payload under the testnet "tpub" version bytes.
        let mut data = base58::decode_check(XPUB).unwrap();
        data[..4].copy_from_slice(&[0x04, 0x35, 0x87, 0xcf]);
        let tpub = base58::encode_check(&data);

        assert!(matches!(
            Xpub::parse(&tpub),
            Err(KeyError::UnsupportedVersion(_))
        ));
    }

    #[test]
    fn test_reject_bad_checksum() {
        let mut corrupted = XPUB.to_string();
        corrupted.pop();
        corrupted.push('1');

        assert!(matches!(Xpub::parse(&corrupted), Err(KeyError::Base58(_))));
    }

    #[test]
    fn test_reject_bad_pubkey_prefix() {
        let mut data = base58::decode_check(XPUB).unwrap();
        data[45] = 0x04;
        let corrupted = base58::encode_check(&data);

        assert!(matches!(
            Xpub::parse(&corrupted),
            Err(KeyError::PublicKeyPrefix(0x04))
        ));
    }

    #[test]
    fn test_derive_p2pkh() {
        let key = Xpub::parse(XPUB).unwrap();
        let addresses = key.derive(2, 0).unwrap();

        assert_eq!(addresses[0].address, "1LqBGSKuX5yYUonjxT5qGfpUsXKYYWeabA");
        assert_eq!(addresses[0].index, 0);
        assert_eq!(addresses[1].address, "1Ak8PffB2meyfYnbXZR9EGfLfFZVpzJvQP");
        assert_eq!(addresses[1].index, 1);
    }

    #[test]
    fn test_derive_p2wpkh() {
        // BIP-84 reference vectors.
        let key = Xpub::parse(ZPUB).unwrap();
        let addresses = key.derive(2, 0).unwrap();

        assert_eq!(
            addresses[0].address,
            "bc1qcr8te4kr609gcawutmrza0j4xv80jy8z306fyu"
        );
        assert_eq!(
            addresses[1].address,
            "bc1qnjg0jd8228aq7egyzacy8cys3knf9xvrerkf9g"
        );
    }

    #[test]
    fn test_derive_prefix_property() {
        let key = Xpub::parse(ZPUB).unwrap();
        let five = key.derive(5, 0).unwrap();
        let eight = key.derive(8, 0).unwrap();

        assert_eq!(five.as_slice(), &eight[..5]);
    }

    #[test]
    fn test_derive_range_offset() {
        let key = Xpub::parse(ZPUB).unwrap();
        let all = key.derive(10, 0).unwrap();
        let tail = key.derive(4, 6).unwrap();

        assert_eq!(&all[6..], tail.as_slice());
        assert_eq!(tail[0].index, 6);
    }

    #[test]
    fn test_derive_zero_is_empty() {
        let key = Xpub::parse(XPUB).unwrap();
        assert!(key.derive(0, 0).unwrap().is_empty());
    }

    #[test]
    fn test_derive_hardened_rejected() {
        let key = Xpub::parse(XPUB).unwrap();
        assert!(matches!(
            key.derive(1, 1 << 31),
            Err(KeyError::Hardened)
        ));
        assert!(matches!(
            key.derive(2, (1 << 31) - 1),
            Err(KeyError::Hardened)
        ));
    }

    #[test]
    fn test_short_form() {
        let key = Xpub::parse(ZPUB).unwrap();
        assert_eq!(key.short(), "zpub...2AGutZYs");
    }
}
