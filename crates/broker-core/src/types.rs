use crate::error::ProvisionError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

const BROKER_ID_MAX_LEN: usize = 64;
const MAX_FEE_RATE_BPS: u32 = 10_000;

/// Broker identifier shared by every registry and datastore.
///
/// Only lowercase ASCII letters, digits, `-` and `_` are accepted. The format is checked
/// once in [`BrokerId::parse`]; everything downstream trusts the value.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct BrokerId(String);

impl BrokerId {
    pub fn parse(value: impl Into<String>) -> Result<Self, ProvisionError> {
        let value = value.into();
        let invalid = |reason: &str| ProvisionError::InvalidBrokerId {
            value: value.clone(),
            reason: reason.to_string(),
        };

        if value.is_empty() {
            return Err(invalid("must not be empty"));
        }
        if value.len() > BROKER_ID_MAX_LEN {
            return Err(invalid("must be at most 64 characters"));
        }
        if !value
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-' || c == '_')
        {
            return Err(invalid(
                "only lowercase letters, digits, '-' and '_' are allowed",
            ));
        }

        Ok(Self(value))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for BrokerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for BrokerId {
    type Error = ProvisionError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(value)
    }
}

impl From<BrokerId> for String {
    fn from(value: BrokerId) -> Self {
        value.0
    }
}

impl FromStr for BrokerId {
    type Err = ProvisionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

/// Deployment environment; each one carries its own registry targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Environment {
    Dev,
    Qa,
    Staging,
    Mainnet,
}

impl Environment {
    pub fn name(self) -> &'static str {
        match self {
            Self::Dev => "dev",
            Self::Qa => "qa",
            Self::Staging => "staging",
            Self::Mainnet => "mainnet",
        }
    }
}

impl fmt::Display for Environment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Environment {
    type Err = ProvisionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "dev" => Ok(Self::Dev),
            "qa" => Ok(Self::Qa),
            "staging" => Ok(Self::Staging),
            "mainnet" => Ok(Self::Mainnet),
            other => Err(ProvisionError::Configuration(format!(
                "unknown environment '{other}'"
            ))),
        }
    }
}

impl TryFrom<String> for Environment {
    type Error = ProvisionError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Environment> for String {
    fn from(value: Environment) -> Self {
        value.name().to_string()
    }
}

/// Ledger family of a registry target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RegistryFamily {
    /// EVM-compatible chain; the allow-bit lives in a contract.
    Evm,
    /// Solana cluster; the allow-bit lives in a program-derived account.
    Solana,
}

/// Contract/program role a registry target plays for broker allow-listing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RegistryRole {
    Vault,
    VaultManager,
    FeeManager,
}

impl RegistryRole {
    pub fn name(self) -> &'static str {
        match self {
            Self::Vault => "vault",
            Self::VaultManager => "vault_manager",
            Self::FeeManager => "fee_manager",
        }
    }

    /// Access-control role the operator must hold to flip the broker allow-bit.
    pub fn manager_role(self) -> &'static str {
        match self {
            Self::Vault | Self::VaultManager => "BROKER_MANAGER_ROLE",
            Self::FeeManager => "FEE_MANAGER_ROLE",
        }
    }
}

/// One configured registry destination. Loaded from static configuration, never mutated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistryTarget {
    pub name: String,
    pub family: RegistryFamily,
    pub role: RegistryRole,
    /// EVM chain id (decimal) or Solana cluster name.
    pub chain_id: String,
    /// Contract address (0x hex) or program id (base58).
    pub address: String,
    pub rpc_url: String,
}

impl RegistryTarget {
    pub fn contract_address(&self) -> Result<EvmAddress, ProvisionError> {
        self.address.parse().map_err(|e: ProvisionError| {
            ProvisionError::Configuration(format!("target '{}': {e}", self.name))
        })
    }

    pub fn program_id(&self) -> Result<SolanaPubkey, ProvisionError> {
        self.address.parse().map_err(|e: ProvisionError| {
            ProvisionError::Configuration(format!("target '{}': {e}", self.name))
        })
    }
}

/// Whether an operation registers or removes the broker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationMode {
    Create,
    Delete,
}

impl OperationMode {
    /// Allow-bit value the commit writes.
    pub fn target_allowed(self) -> bool {
        matches!(self, Self::Create)
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::Delete => "delete",
        }
    }
}

/// 20-byte EVM account address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct EvmAddress(pub [u8; 20]);

impl FromStr for EvmAddress {
    type Err = ProvisionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let digits = s.strip_prefix("0x").unwrap_or(s);
        let bytes = hex::decode(digits).map_err(|e| {
            ProvisionError::Configuration(format!("invalid EVM address '{s}': {e}"))
        })?;
        let array: [u8; 20] = bytes.try_into().map_err(|_| {
            ProvisionError::Configuration(format!("invalid EVM address '{s}': expected 20 bytes"))
        })?;
        Ok(Self(array))
    }
}

impl fmt::Display for EvmAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{}", hex::encode(self.0))
    }
}

impl TryFrom<String> for EvmAddress {
    type Error = ProvisionError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<EvmAddress> for String {
    fn from(value: EvmAddress) -> Self {
        value.to_string()
    }
}

/// 32-byte Solana public key / program id, base58 rendered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct SolanaPubkey(pub [u8; 32]);

impl SolanaPubkey {
    /// The system program (all-zero key).
    pub const SYSTEM_PROGRAM: SolanaPubkey = SolanaPubkey([0u8; 32]);

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl FromStr for SolanaPubkey {
    type Err = ProvisionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = bs58::decode(s).into_vec().map_err(|e| {
            ProvisionError::Configuration(format!("invalid Solana pubkey '{s}': {e}"))
        })?;
        let array: [u8; 32] = bytes.try_into().map_err(|_| {
            ProvisionError::Configuration(format!("invalid Solana pubkey '{s}': expected 32 bytes"))
        })?;
        Ok(Self(array))
    }
}

impl fmt::Display for SolanaPubkey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&bs58::encode(self.0).into_string())
    }
}

impl TryFrom<String> for SolanaPubkey {
    type Error = ProvisionError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<SolanaPubkey> for String {
    fn from(value: SolanaPubkey) -> Self {
        value.to_string()
    }
}

/// Fee rate in basis points.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "u32", into = "u32")]
pub struct FeeRateBps(u32);

impl FeeRateBps {
    pub fn new(bps: u32) -> Result<Self, ProvisionError> {
        if bps > MAX_FEE_RATE_BPS {
            return Err(ProvisionError::InvalidFeeRate(format!(
                "{bps} bps exceeds {MAX_FEE_RATE_BPS} bps"
            )));
        }
        Ok(Self(bps))
    }

    pub fn bps(self) -> u32 {
        self.0
    }
}

impl TryFrom<u32> for FeeRateBps {
    type Error = ProvisionError;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<FeeRateBps> for u32 {
    fn from(value: FeeRateBps) -> Self {
        value.0
    }
}

/// Broker data supplied by the caller for mirroring.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BrokerData {
    pub broker_id: BrokerId,
    pub broker_name: String,
    pub maker_fee_rate: FeeRateBps,
    pub taker_fee_rate: FeeRateBps,
    pub admin_account_id: Option<String>,
}

/// Broker record as written to each datastore.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BrokerRecord {
    pub broker_id: BrokerId,
    pub broker_name: String,
    pub maker_fee_rate: FeeRateBps,
    pub taker_fee_rate: FeeRateBps,
    /// `0x`-prefixed keccak digest of the broker id.
    pub broker_hash: String,
    pub admin_account_id: Option<String>,
}

impl BrokerRecord {
    pub fn from_data(data: &BrokerData) -> Self {
        Self {
            broker_id: data.broker_id.clone(),
            broker_name: data.broker_name.clone(),
            maker_fee_rate: data.maker_fee_rate,
            taker_fee_rate: data.taker_fee_rate,
            broker_hash: crate::derivation::broker_hash(&data.broker_id).to_string(),
            admin_account_id: data.admin_account_id.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn broker_id_accepts_documented_alphabet() {
        assert!(BrokerId::parse("acme-dex").is_ok());
        assert!(BrokerId::parse("woofi_pro2").is_ok());
    }

    #[test]
    fn broker_id_rejects_invalid_tokens() {
        for value in ["", "Acme", "acme dex", "acme.dex", &"a".repeat(65)] {
            let err = BrokerId::parse(value).unwrap_err();
            assert!(matches!(err, ProvisionError::InvalidBrokerId { .. }));
        }
    }

    #[test]
    fn broker_id_deserialization_validates() {
        let parsed: Result<BrokerId, _> = serde_json::from_str("\"UPPER\"");
        assert!(parsed.is_err());
        let parsed: BrokerId = serde_json::from_str("\"acme-dex\"").unwrap();
        assert_eq!(parsed.as_str(), "acme-dex");
    }

    #[test]
    fn evm_address_parses_and_renders_lowercase_hex() {
        let address: EvmAddress = "0x00000000000000000000000000000000000000Ab".parse().unwrap();
        assert_eq!(
            address.to_string(),
            "0x00000000000000000000000000000000000000ab"
        );
        assert!("0x1234".parse::<EvmAddress>().is_err());
    }

    #[test]
    fn solana_pubkey_roundtrips_base58() {
        let key = SolanaPubkey([7u8; 32]);
        let parsed: SolanaPubkey = key.to_string().parse().unwrap();
        assert_eq!(parsed, key);
        assert_eq!(
            SolanaPubkey::SYSTEM_PROGRAM.to_string(),
            "11111111111111111111111111111111"
        );
    }

    #[test]
    fn fee_rate_is_bounded() {
        assert!(FeeRateBps::new(10_000).is_ok());
        assert!(matches!(
            FeeRateBps::new(10_001),
            Err(ProvisionError::InvalidFeeRate(_))
        ));
    }

    #[test]
    fn environment_names_roundtrip() {
        for env in [
            Environment::Dev,
            Environment::Qa,
            Environment::Staging,
            Environment::Mainnet,
        ] {
            assert_eq!(env.name().parse::<Environment>().unwrap(), env);
        }
    }
}
