use crate::clients::LedgerClients;
use crate::config::CallPolicy;
use crate::credentials::Credentials;
use crate::derivation::{broker_hash, role_hash, SetBrokerInstruction};
use crate::error::SimulationFailure;
use crate::types::{BrokerId, OperationMode, RegistryFamily, RegistryTarget};
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, warn};

/// Estimated fee of the state-changing call, in the chain's smallest unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CostEstimate {
    pub amount: u128,
    pub unit: &'static str,
}

/// Pass/fail result of one dry run. Never persisted outside the journal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SimulationOutcome {
    pub target: String,
    pub chain_id: String,
    pub ok: bool,
    pub failure: Option<SimulationFailure>,
    pub cost_estimate: Option<CostEstimate>,
}

impl SimulationOutcome {
    /// Human-readable failure reason.
    pub fn reason(&self) -> Option<String> {
        self.failure.as_ref().map(ToString::to_string)
    }
}

/// Side-effect-free precondition check for one registry target.
#[derive(Clone)]
pub struct DryRunSimulator {
    clients: LedgerClients,
    credentials: Arc<Credentials>,
    policy: CallPolicy,
}

impl DryRunSimulator {
    pub fn new(clients: LedgerClients, credentials: Arc<Credentials>, policy: CallPolicy) -> Self {
        Self {
            clients,
            credentials,
            policy,
        }
    }

    /// Run every precondition check for `mode` on `target`.
    ///
    /// Never fails: ledger errors and timeouts become a failed outcome.
    pub async fn simulate(
        &self,
        target: &RegistryTarget,
        broker_id: &BrokerId,
        mode: OperationMode,
    ) -> SimulationOutcome {
        let checks = async {
            match target.family {
                RegistryFamily::Evm => self.check_evm(target, broker_id, mode).await,
                RegistryFamily::Solana => self.check_solana(target, broker_id, mode).await,
            }
        };

        let result = match self.policy.bounded(checks).await {
            Ok(result) => result,
            Err(_) => Err(SimulationFailure::Timeout {
                after_secs: self.policy.call_timeout().as_secs(),
            }),
        };

        let outcome = match result {
            Ok(cost) => SimulationOutcome {
                target: target.name.clone(),
                chain_id: target.chain_id.clone(),
                ok: true,
                failure: None,
                cost_estimate: Some(cost),
            },
            Err(failure) => SimulationOutcome {
                target: target.name.clone(),
                chain_id: target.chain_id.clone(),
                ok: false,
                failure: Some(failure),
                cost_estimate: None,
            },
        };

        debug!(
            broker_id = %broker_id,
            registry = %target.name,
            mode = mode.name(),
            ok = outcome.ok,
            reason = %outcome.reason().unwrap_or_default(),
            "simulation finished"
        );
        outcome
    }

    async fn check_evm(
        &self,
        target: &RegistryTarget,
        broker_id: &BrokerId,
        mode: OperationMode,
    ) -> Result<CostEstimate, SimulationFailure> {
        let evm = &self.clients.evm;
        let operator = &self.credentials.evm.operator;
        let hash = broker_hash(broker_id);

        let allowed = evm.is_broker_allowed(target, &hash).await?;
        check_allow_state(mode, allowed)?;

        let cost = evm
            .estimate_set_allowed_cost(target, &hash, mode.target_allowed(), operator)
            .await?;
        let balance = evm.balance_of(target, operator).await?;
        if balance < cost {
            return Err(SimulationFailure::InsufficientBalance {
                required: cost,
                available: balance,
                unit: "wei",
            });
        }

        if !evm.has_role(target, &role_hash(target.role), operator).await? {
            return Err(SimulationFailure::MissingRole {
                role: target.role.manager_role().to_string(),
            });
        }

        Ok(CostEstimate {
            amount: cost,
            unit: "wei",
        })
    }

    async fn check_solana(
        &self,
        target: &RegistryTarget,
        broker_id: &BrokerId,
        mode: OperationMode,
    ) -> Result<CostEstimate, SimulationFailure> {
        let solana = &self.clients.solana;
        let signer = &self.credentials.solana;
        let program_id = target
            .program_id()
            .map_err(|e| SimulationFailure::Ledger(e.to_string()))?;
        let instruction = SetBrokerInstruction::derive(
            program_id,
            target.role,
            signer.pubkey(),
            broker_id,
            mode.target_allowed(),
        )
        .map_err(|e| SimulationFailure::Ledger(e.to_string()))?;

        let account = solana
            .broker_account(target, &instruction.broker_account)
            .await?;
        check_allow_state(mode, account.map(|a| a.allowed).unwrap_or(false))?;

        match solana
            .account_exists(target, &instruction.manager_role_account)
            .await
        {
            Ok(true) => {}
            Ok(false) => {
                return Err(SimulationFailure::MissingRole {
                    role: target.role.manager_role().to_string(),
                })
            }
            Err(err) => {
                warn!(
                    registry = %target.name,
                    error = %err,
                    "manager role account unreadable, simulating instruction instead"
                );
                let simulation = solana
                    .simulate_set_broker(target, &instruction, signer)
                    .await
                    .map_err(|e| SimulationFailure::AuthorityCheckFailed(e.to_string()))?;
                if let Some(error) = simulation.error {
                    return Err(SimulationFailure::AuthorityCheckFailed(error));
                }
            }
        }

        let required = self
            .policy
            .min_solana_lamports
            .max(self.policy.solana_fee_lamports);
        let available = solana.lamports(target, &signer.pubkey()).await?;
        if available < required {
            return Err(SimulationFailure::InsufficientBalance {
                required: u128::from(required),
                available: u128::from(available),
                unit: "lamports",
            });
        }

        Ok(CostEstimate {
            amount: u128::from(self.policy.solana_fee_lamports),
            unit: "lamports",
        })
    }
}

fn check_allow_state(mode: OperationMode, allowed: bool) -> Result<(), SimulationFailure> {
    match (mode, allowed) {
        (OperationMode::Create, true) => Err(SimulationFailure::AlreadyAllowed),
        (OperationMode::Delete, false) => Err(SimulationFailure::NotAllowed),
        _ => Ok(()),
    }
}
