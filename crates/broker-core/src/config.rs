//! Static provisioning configuration.

use crate::error::ProvisionError;
use crate::storage::DatastoreRole;
use crate::types::{Environment, RegistryTarget};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::future::Future;
use std::path::Path;
use std::time::Duration;

/// Limits applied to every ledger call and funding check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CallPolicy {
    /// Upper bound for each simulate/commit call; a timeout counts as a failure.
    pub call_timeout_secs: u64,
    /// Operator balance floor on every EVM target.
    pub min_evm_balance_wei: u64,
    /// Operator balance floor on the Solana target.
    pub min_solana_lamports: u64,
    /// Fee budget reported as the cost estimate for one Solana `set_broker` call.
    pub solana_fee_lamports: u64,
}

impl Default for CallPolicy {
    fn default() -> Self {
        Self {
            call_timeout_secs: 30,
            min_evm_balance_wei: 10_000_000_000_000_000,
            min_solana_lamports: 10_000_000,
            solana_fee_lamports: 5_000,
        }
    }
}

impl CallPolicy {
    pub fn call_timeout(&self) -> Duration {
        Duration::from_secs(self.call_timeout_secs.max(1))
    }

    pub async fn bounded<F: Future>(
        &self,
        call: F,
    ) -> Result<F::Output, tokio::time::error::Elapsed> {
        tokio::time::timeout(self.call_timeout(), call).await
    }
}

/// Registry targets of one deployment environment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct EnvironmentConfig {
    #[serde(default)]
    pub targets: Vec<RegistryTarget>,
}

/// Connection settings of one mirrored datastore.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatastoreConfig {
    pub url: String,
    pub table: String,
    /// Whether this datastore assigns the sequential broker index.
    #[serde(default)]
    pub assigns_index: bool,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

fn default_max_connections() -> u32 {
    2
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatastoresConfig {
    pub primary: DatastoreConfig,
    pub secondary: DatastoreConfig,
    pub tertiary: DatastoreConfig,
}

impl DatastoresConfig {
    pub fn get(&self, role: DatastoreRole) -> &DatastoreConfig {
        match role {
            DatastoreRole::Primary => &self.primary,
            DatastoreRole::Secondary => &self.secondary,
            DatastoreRole::Tertiary => &self.tertiary,
        }
    }
}

/// Root configuration document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct ProvisioningConfig {
    #[serde(default)]
    pub policy: CallPolicy,
    #[serde(default)]
    pub environments: BTreeMap<Environment, EnvironmentConfig>,
    #[serde(default)]
    pub datastores: Option<DatastoresConfig>,
    /// Cap on retained journal entries; unbounded when absent.
    #[serde(default)]
    pub journal_max_entries: Option<usize>,
}

impl ProvisioningConfig {
    pub fn from_toml_str(contents: &str) -> Result<Self, ProvisionError> {
        toml::from_str(contents).map_err(|e| ProvisionError::Configuration(e.to_string()))
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ProvisionError> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|e| {
            ProvisionError::Configuration(format!("cannot read {}: {e}", path.display()))
        })?;
        Self::from_toml_str(&contents)
    }
}
