//! Chains and bridged assets
//!
//! Every bridged asset originates on an external chain. Locking it there mints
//! its mirror on Nervos; burning the mirror on Nervos unlocks the original.

use crate::config::{AssetRuleConfig, Settings};
use crate::error::{RelayerError, RelayerResult};

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

/// Chains the relayer can watch
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChainKind {
    Nervos,
    Ethereum,
    Tron,
    Eos,
    Bitcoin,
    Cardano,
}

impl ChainKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChainKind::Nervos => "nervos",
            ChainKind::Ethereum => "ethereum",
            ChainKind::Tron => "tron",
            ChainKind::Eos => "eos",
            ChainKind::Bitcoin => "bitcoin",
            ChainKind::Cardano => "cardano",
        }
    }

    /// Key of the persisted cursor entry, e.g. `lastHandledEthBlock`
    pub fn cursor_key(&self) -> String {
        let label = match self {
            ChainKind::Nervos => "Ckb",
            ChainKind::Ethereum => "Eth",
            ChainKind::Tron => "Tron",
            ChainKind::Eos => "Eos",
            ChainKind::Bitcoin => "Btc",
            ChainKind::Cardano => "Ada",
        };
        format!("lastHandled{}Block", label)
    }

    pub fn is_nervos(&self) -> bool {
        matches!(self, ChainKind::Nervos)
    }
}

impl fmt::Display for ChainKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ChainKind {
    type Err = RelayerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "nervos" | "ckb" => Ok(ChainKind::Nervos),
            "ethereum" | "eth" => Ok(ChainKind::Ethereum),
            "tron" => Ok(ChainKind::Tron),
            "eos" => Ok(ChainKind::Eos),
            "bitcoin" | "btc" => Ok(ChainKind::Bitcoin),
            "cardano" | "ada" => Ok(ChainKind::Cardano),
            other => Err(RelayerError::Config(format!("unknown chain kind: {}", other))),
        }
    }
}

/// Direction of a transfer relative to Nervos
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// lock on the external chain, mint on Nervos
    In,
    /// burn on Nervos, unlock on the external chain
    Out,
}

/// An asset native to one of the external chains
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "chain", content = "address", rename_all = "UPPERCASE")]
pub enum Asset {
    Btc(String),
    Eth(String),
    Eos(String),
    Tron(String),
    Ada(String),
}

impl Asset {
    /// Build the asset for an address observed on `chain`
    pub fn for_chain(chain: ChainKind, address: &str) -> RelayerResult<Self> {
        match chain {
            ChainKind::Ethereum => {
                if !address.starts_with("0x") || address.len() != 42 {
                    return Err(RelayerError::Config(format!(
                        "invalid ETH asset address: {}",
                        address
                    )));
                }
                Ok(Asset::Eth(address.to_ascii_lowercase()))
            }
            ChainKind::Bitcoin => Ok(Asset::Btc(address.to_string())),
            ChainKind::Eos => Ok(Asset::Eos(address.to_string())),
            ChainKind::Tron => Ok(Asset::Tron(address.to_string())),
            ChainKind::Cardano => Ok(Asset::Ada(address.to_string())),
            ChainKind::Nervos => Err(RelayerError::Config(
                "nervos assets are mirrors, not bridge origins".to_string(),
            )),
        }
    }

    /// Chain the asset originates from
    pub fn chain(&self) -> ChainKind {
        match self {
            Asset::Btc(_) => ChainKind::Bitcoin,
            Asset::Eth(_) => ChainKind::Ethereum,
            Asset::Eos(_) => ChainKind::Eos,
            Asset::Tron(_) => ChainKind::Tron,
            Asset::Ada(_) => ChainKind::Cardano,
        }
    }

    pub fn address(&self) -> &str {
        match self {
            Asset::Btc(a) | Asset::Eth(a) | Asset::Eos(a) | Asset::Tron(a) | Asset::Ada(a) => a,
        }
    }

    /// On-chain tag used inside bridge lock arguments
    pub fn chain_tag(&self) -> u8 {
        match self {
            Asset::Btc(_) => 0,
            Asset::Eth(_) => 1,
            Asset::Eos(_) => 2,
            Asset::Tron(_) => 3,
            Asset::Ada(_) => 5,
        }
    }

    /// Bridge lock arguments: owner lock hash, chain tag, length-prefixed asset bytes
    pub fn bridge_args(&self, owner_lock_hash: &str) -> RelayerResult<String> {
        let owner = hex::decode(owner_lock_hash.trim_start_matches("0x"))
            .map_err(|e| RelayerError::Config(format!("invalid owner lock hash: {}", e)))?;
        let asset = self.address().as_bytes();

        let mut args = Vec::with_capacity(owner.len() + 5 + asset.len());
        args.extend_from_slice(&owner);
        args.push(self.chain_tag());
        args.extend_from_slice(&(asset.len() as u32).to_le_bytes());
        args.extend_from_slice(asset);

        Ok(format!("0x{}", hex::encode(args)))
    }

    /// Smallest amount accepted for bridging
    pub fn minimal_amount(&self, whitelist: &AssetWhitelist) -> u128 {
        whitelist.rule(self).map(|r| r.minimal_amount).unwrap_or(0)
    }

    /// Fee retained by the bridge in the given direction
    pub fn bridge_fee(&self, direction: Direction, whitelist: &AssetWhitelist) -> u128 {
        match (whitelist.rule(self), direction) {
            (Some(rule), Direction::In) => rule.bridge_fee_in,
            (Some(rule), Direction::Out) => rule.bridge_fee_out,
            (None, _) => 0,
        }
    }
}

impl fmt::Display for Asset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.chain(), self.address())
    }
}

/// Parsed whitelist entry
#[derive(Debug, Clone, PartialEq)]
pub struct AssetRule {
    pub address: String,
    pub minimal_amount: u128,
    pub bridge_fee_in: u128,
    pub bridge_fee_out: u128,
}

/// Per-chain asset whitelist. A chain without entries accepts every asset.
#[derive(Debug, Clone, Default)]
pub struct AssetWhitelist {
    rules: HashMap<ChainKind, Vec<AssetRule>>,
}

impl AssetWhitelist {
    pub fn from_settings(settings: &Settings) -> RelayerResult<Self> {
        let mut whitelist = Self::default();
        for chain in settings.chains.values().filter(|c| c.enabled) {
            for rule in &chain.assets {
                whitelist.insert(chain.kind, parse_rule(rule)?);
            }
        }
        Ok(whitelist)
    }

    pub fn insert(&mut self, chain: ChainKind, rule: AssetRule) {
        self.rules.entry(chain).or_default().push(rule);
    }

    pub fn rule(&self, asset: &Asset) -> Option<&AssetRule> {
        self.rules
            .get(&asset.chain())?
            .iter()
            .find(|r| r.address.eq_ignore_ascii_case(asset.address()))
    }

    pub fn is_whitelisted(&self, asset: &Asset) -> bool {
        match self.rules.get(&asset.chain()) {
            None => true,
            Some(rules) if rules.is_empty() => true,
            Some(_) => self.rule(asset).is_some(),
        }
    }
}

fn parse_rule(rule: &AssetRuleConfig) -> RelayerResult<AssetRule> {
    let field = |name: &str, value: &str| {
        parse_amount(value).ok_or_else(|| {
            RelayerError::Config(format!("asset {}: invalid {} {:?}", rule.address, name, value))
        })
    };

    Ok(AssetRule {
        address: rule.address.clone(),
        minimal_amount: field("minimal_amount", &rule.minimal_amount)?,
        bridge_fee_in: field("bridge_fee_in", &rule.bridge_fee_in)?,
        bridge_fee_out: field("bridge_fee_out", &rule.bridge_fee_out)?,
    })
}

/// Parse a decimal amount string; rejects signs, fractions and overflow
pub fn parse_amount(value: &str) -> Option<u128> {
    if value.is_empty() || !value.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    value.parse().ok()
}

/// Serde adapter carrying `u128` amounts as decimal strings
pub mod amount_str {
    use serde::{de, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(amount: &u128, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&amount.to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u128, D::Error> {
        let raw = String::deserialize(deserializer)?;
        super::parse_amount(&raw)
            .ok_or_else(|| de::Error::custom(format!("invalid amount {:?}", raw)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn whitelist() -> AssetWhitelist {
        let mut w = AssetWhitelist::default();
        w.insert(
            ChainKind::Ethereum,
            AssetRule {
                address: "0x0000000000000000000000000000000000000000".into(),
                minimal_amount: 1000,
                bridge_fee_in: 10,
                bridge_fee_out: 20,
            },
        );
        w
    }

    #[test]
    fn test_eth_address_validation() {
        assert!(Asset::for_chain(ChainKind::Ethereum, "0x1234").is_err());
        let asset =
            Asset::for_chain(ChainKind::Ethereum, "0xABCDEF0000000000000000000000000000000000").unwrap();
        assert_eq!(asset.address(), "0xabcdef0000000000000000000000000000000000");
        assert!(Asset::for_chain(ChainKind::Nervos, "anything").is_err());
    }

    #[test]
    fn test_fee_and_minimum_from_whitelist() {
        let w = whitelist();
        let eth = Asset::Eth("0x0000000000000000000000000000000000000000".into());
        assert!(w.is_whitelisted(&eth));
        assert_eq!(eth.minimal_amount(&w), 1000);
        assert_eq!(eth.bridge_fee(Direction::In, &w), 10);
        assert_eq!(eth.bridge_fee(Direction::Out, &w), 20);

        let other = Asset::Eth("0x1111111111111111111111111111111111111111".into());
        assert!(!w.is_whitelisted(&other));

        // chains without rules accept everything, free of charge
        let btc = Asset::Btc("btc".into());
        assert!(w.is_whitelisted(&btc));
        assert_eq!(btc.bridge_fee(Direction::In, &w), 0);
    }

    #[test]
    fn test_bridge_args_layout() {
        let asset = Asset::Tron("trx".into());
        let args = asset.bridge_args("0xaabb").unwrap();
        assert_eq!(args, "0xaabb0303000000747278");
    }

    #[test]
    fn test_asset_serde_shape() {
        let json = serde_json::to_value(Asset::Eos("EOS".into())).unwrap();
        assert_eq!(json, serde_json::json!({"chain": "EOS", "address": "EOS"}));
    }

    #[test]
    fn test_parse_amount() {
        assert_eq!(parse_amount("12345"), Some(12345));
        assert_eq!(parse_amount("-1"), None);
        assert_eq!(parse_amount("1.5"), None);
        assert_eq!(parse_amount(""), None);
        assert_eq!(parse_amount("999999999999999999999999999999999999999999"), None);
    }

    #[test]
    fn test_cursor_keys() {
        assert_eq!(ChainKind::Ethereum.cursor_key(), "lastHandledEthBlock");
        assert_eq!(ChainKind::Nervos.cursor_key(), "lastHandledCkbBlock");
        assert_eq!("ckb".parse::<ChainKind>().unwrap(), ChainKind::Nervos);
    }
}
