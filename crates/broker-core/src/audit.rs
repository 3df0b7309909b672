//! Read-only checks of operator permissions and funding across an environment.

use crate::clients::LedgerClients;
use crate::config::CallPolicy;
use crate::credentials::Credentials;
use crate::derivation::{role_hash, SetBrokerInstruction};
use crate::error::{LedgerCallError, ProvisionError};
use crate::registry::ChainRegistry;
use crate::types::{BrokerId, Environment, RegistryFamily, RegistryTarget, SolanaPubkey};
use futures::future::join_all;
use serde::Serialize;
use std::sync::Arc;
use tracing::info;

/// Broker id used when an authority check has to simulate a real instruction.
const CHECK_BROKER_ID: &str = "permission-check";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AuditDetail {
    pub target: String,
    pub chain_id: String,
    pub ok: bool,
    pub detail: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AuditReport {
    pub environment: Environment,
    pub ok: bool,
    pub details: Vec<AuditDetail>,
}

impl AuditReport {
    fn from_details(environment: Environment, details: Vec<AuditDetail>) -> Self {
        Self {
            environment,
            ok: details.iter().all(|detail| detail.ok),
            details,
        }
    }
}

#[derive(Clone)]
pub struct ProvisioningAuditor {
    registry: Arc<ChainRegistry>,
    clients: LedgerClients,
    credentials: Arc<Credentials>,
    policy: CallPolicy,
}

impl ProvisioningAuditor {
    pub fn new(
        registry: Arc<ChainRegistry>,
        clients: LedgerClients,
        credentials: Arc<Credentials>,
        policy: CallPolicy,
    ) -> Self {
        Self {
            registry,
            clients,
            credentials,
            policy,
        }
    }

    /// Whether the operator holds the manager role on every target.
    pub async fn check_provisioning_permissions(
        &self,
        env: Environment,
    ) -> Result<AuditReport, ProvisionError> {
        let targets = self.registry.targets(env)?;
        let details = join_all(targets.iter().map(|target| async move {
            let result = self.policy.bounded(self.permission(target)).await;
            self.detail(target, flatten(result, &self.policy))
        }))
        .await;

        let report = AuditReport::from_details(env, details);
        info!(environment = %env, ok = report.ok, "permission audit finished");
        Ok(report)
    }

    /// Whether the operator balance meets the configured floor on every target.
    pub async fn check_funding_balances(
        &self,
        env: Environment,
    ) -> Result<AuditReport, ProvisionError> {
        let targets = self.registry.targets(env)?;
        let details = join_all(targets.iter().map(|target| async move {
            let result = self.policy.bounded(self.balance(target)).await;
            self.detail(target, flatten(result, &self.policy))
        }))
        .await;

        let report = AuditReport::from_details(env, details);
        info!(environment = %env, ok = report.ok, "funding audit finished");
        Ok(report)
    }

    async fn permission(&self, target: &RegistryTarget) -> Result<(bool, String), LedgerCallError> {
        let role = target.role.manager_role();
        match target.family {
            RegistryFamily::Evm => {
                let operator = &self.credentials.evm.operator;
                let granted = self
                    .clients
                    .evm
                    .has_role(target, &role_hash(target.role), operator)
                    .await?;
                Ok(describe_role(granted, role, &operator.to_string()))
            }
            RegistryFamily::Solana => {
                let signer = &self.credentials.solana;
                let instruction = role_check_instruction(target, signer.pubkey())?;
                match self
                    .clients
                    .solana
                    .account_exists(target, &instruction.manager_role_account)
                    .await
                {
                    Ok(granted) => Ok(describe_role(granted, role, &signer.pubkey().to_string())),
                    Err(_) => {
                        let simulation = self
                            .clients
                            .solana
                            .simulate_set_broker(target, &instruction, signer)
                            .await?;
                        Ok(match simulation.error {
                            None => (true, format!("{role} confirmed by simulation")),
                            Some(error) => (false, format!("authority check failed: {error}")),
                        })
                    }
                }
            }
        }
    }

    async fn balance(&self, target: &RegistryTarget) -> Result<(bool, String), LedgerCallError> {
        match target.family {
            RegistryFamily::Evm => {
                let available = self
                    .clients
                    .evm
                    .balance_of(target, &self.credentials.evm.operator)
                    .await?;
                let required = u128::from(self.policy.min_evm_balance_wei);
                Ok(describe_balance(available, required, "wei"))
            }
            RegistryFamily::Solana => {
                let available = self
                    .clients
                    .solana
                    .lamports(target, &self.credentials.solana.pubkey())
                    .await?;
                Ok(describe_balance(
                    u128::from(available),
                    u128::from(self.policy.min_solana_lamports),
                    "lamports",
                ))
            }
        }
    }

    fn detail(&self, target: &RegistryTarget, result: (bool, String)) -> AuditDetail {
        AuditDetail {
            target: target.name.clone(),
            chain_id: target.chain_id.clone(),
            ok: result.0,
            detail: result.1,
        }
    }
}

fn flatten(
    result: Result<Result<(bool, String), LedgerCallError>, tokio::time::error::Elapsed>,
    policy: &CallPolicy,
) -> (bool, String) {
    match result {
        Ok(Ok(checked)) => checked,
        Ok(Err(err)) => (false, format!("ledger error: {err}")),
        Err(_) => (
            false,
            format!("timed out after {}s", policy.call_timeout().as_secs()),
        ),
    }
}

fn role_check_instruction(
    target: &RegistryTarget,
    operator: SolanaPubkey,
) -> Result<SetBrokerInstruction, LedgerCallError> {
    let program_id = target
        .program_id()
        .map_err(|e| LedgerCallError::Decode(e.to_string()))?;
    let check_id = BrokerId::parse(CHECK_BROKER_ID).map_err(|e| LedgerCallError::Decode(e.to_string()))?;
    SetBrokerInstruction::derive(program_id, target.role, operator, &check_id, true)
        .map_err(|e| LedgerCallError::Decode(e.to_string()))
}

fn describe_role(granted: bool, role: &str, operator: &str) -> (bool, String) {
    if granted {
        (true, format!("{operator} holds {role}"))
    } else {
        (false, format!("{operator} does not hold {role}"))
    }
}

fn describe_balance(available: u128, required: u128, unit: &str) -> (bool, String) {
    if available >= required {
        (true, format!("balance {available} {unit} (floor {required} {unit})"))
    } else {
        (
            false,
            format!("insufficient balance: required {required} {unit}, available {available} {unit}"),
        )
    }
}
