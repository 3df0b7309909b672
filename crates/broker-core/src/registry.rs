//! Static classification of the configured registry targets.

use crate::config::ProvisioningConfig;
use crate::error::ProvisionError;
use crate::types::{Environment, RegistryFamily, RegistryRole, RegistryTarget};
use std::collections::{BTreeMap, HashSet};

/// Targets of one environment, grouped by ledger family and contract role.
#[derive(Debug, Clone, Default)]
pub struct TargetPartition<'a> {
    pub evm: Vec<&'a RegistryTarget>,
    pub solana: Vec<&'a RegistryTarget>,
    pub by_role: BTreeMap<RegistryRole, Vec<&'a RegistryTarget>>,
}

impl TargetPartition<'_> {
    pub fn len(&self) -> usize {
        self.evm.len() + self.solana.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// One-line summary used in log fields.
    pub fn summary(&self) -> String {
        let roles = self
            .by_role
            .iter()
            .map(|(role, targets)| format!("{}={}", role.name(), targets.len()))
            .collect::<Vec<_>>()
            .join(",");
        format!("evm={} solana={} [{}]", self.evm.len(), self.solana.len(), roles)
    }
}

/// Validated registry targets per environment.
#[derive(Debug, Clone)]
pub struct ChainRegistry {
    environments: BTreeMap<Environment, Vec<RegistryTarget>>,
}

impl ChainRegistry {
    /// Validate every configured environment up front.
    pub fn from_config(config: &ProvisioningConfig) -> Result<Self, ProvisionError> {
        let mut environments = BTreeMap::new();
        for (env, env_config) in &config.environments {
            validate_targets(*env, &env_config.targets)?;
            environments.insert(*env, env_config.targets.clone());
        }
        Ok(Self { environments })
    }

    pub fn targets(&self, env: Environment) -> Result<&[RegistryTarget], ProvisionError> {
        self.environments
            .get(&env)
            .map(Vec::as_slice)
            .ok_or_else(|| {
                ProvisionError::Configuration(format!("environment '{env}' is not configured"))
            })
    }

    pub fn partition(&self, env: Environment) -> Result<TargetPartition<'_>, ProvisionError> {
        let mut partition = TargetPartition::default();
        for target in self.targets(env)? {
            match target.family {
                RegistryFamily::Evm => partition.evm.push(target),
                RegistryFamily::Solana => partition.solana.push(target),
            }
            partition.by_role.entry(target.role).or_default().push(target);
        }
        Ok(partition)
    }

    pub fn environments(&self) -> impl Iterator<Item = Environment> + '_ {
        self.environments.keys().copied()
    }
}

fn validate_targets(env: Environment, targets: &[RegistryTarget]) -> Result<(), ProvisionError> {
    if targets.is_empty() {
        return Err(ProvisionError::Configuration(format!(
            "environment '{env}' has no registry targets"
        )));
    }

    let mut names = HashSet::new();
    let mut solana_targets = 0usize;
    for target in targets {
        if target.name.trim().is_empty() {
            return Err(ProvisionError::Configuration(format!(
                "environment '{env}' has a target without a name"
            )));
        }
        if !names.insert(target.name.as_str()) {
            return Err(ProvisionError::Configuration(format!(
                "environment '{env}' lists target '{}' twice",
                target.name
            )));
        }
        match target.family {
            RegistryFamily::Evm => {
                target.contract_address()?;
            }
            RegistryFamily::Solana => {
                target.program_id()?;
                solana_targets += 1;
            }
        }
    }

    if solana_targets > 1 {
        return Err(ProvisionError::Configuration(format!(
            "environment '{env}' has {solana_targets} Solana targets, at most one is supported"
        )));
    }

    Ok(())
}
