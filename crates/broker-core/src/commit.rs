use crate::clients::LedgerClients;
use crate::config::CallPolicy;
use crate::credentials::Credentials;
use crate::derivation::{broker_hash, SetBrokerInstruction};
use crate::error::CommitFailure;
use crate::types::{BrokerId, OperationMode, RegistryFamily, RegistryTarget};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{error, info};

/// Confirmed state change on one registry target.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CommitOutcome {
    pub target: String,
    pub chain_id: String,
    pub transaction_id: String,
}

/// One async lock per ledger, so commits to the same chain never overlap.
///
/// EVM nonces are assigned per sender and chain; concurrent sends from one operator on
/// the same chain could race for a nonce.
#[derive(Debug, Default)]
pub struct ChainLocks {
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl ChainLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn lock_for(&self, target: &RegistryTarget) -> Arc<Mutex<()>> {
        let key = chain_key(target);
        self.locks.lock().await.entry(key).or_default().clone()
    }
}

fn chain_key(target: &RegistryTarget) -> String {
    let family = match target.family {
        RegistryFamily::Evm => "evm",
        RegistryFamily::Solana => "solana",
    };
    format!("{family}:{}", target.chain_id)
}

/// Issues the state-changing allow/deny call on one target.
///
/// No retries: every precondition was checked by the dry run, and resubmitting after an
/// ambiguous failure could double-apply the change.
#[derive(Clone)]
pub struct CommitExecutor {
    clients: LedgerClients,
    credentials: Arc<Credentials>,
    policy: CallPolicy,
    locks: Arc<ChainLocks>,
}

impl CommitExecutor {
    pub fn new(clients: LedgerClients, credentials: Arc<Credentials>, policy: CallPolicy) -> Self {
        Self {
            clients,
            credentials,
            policy,
            locks: Arc::new(ChainLocks::new()),
        }
    }

    pub async fn commit(
        &self,
        target: &RegistryTarget,
        broker_id: &BrokerId,
        mode: OperationMode,
    ) -> Result<CommitOutcome, CommitFailure> {
        let lock = self.locks.lock_for(target).await;
        let _guard = lock.lock().await;

        let call = async {
            match target.family {
                RegistryFamily::Evm => self
                    .clients
                    .evm
                    .set_broker_allowed(
                        target,
                        &broker_hash(broker_id),
                        mode.target_allowed(),
                        &self.credentials.evm.operator,
                    )
                    .await
                    .map_err(CommitFailure::from),
                RegistryFamily::Solana => {
                    let signer = &self.credentials.solana;
                    let program_id = target
                        .program_id()
                        .map_err(|e| CommitFailure::Ledger(e.to_string()))?;
                    let instruction = SetBrokerInstruction::derive(
                        program_id,
                        target.role,
                        signer.pubkey(),
                        broker_id,
                        mode.target_allowed(),
                    )
                    .map_err(|e| CommitFailure::Ledger(e.to_string()))?;
                    self.clients
                        .solana
                        .submit_set_broker(target, &instruction, signer)
                        .await
                        .map_err(CommitFailure::from)
                }
            }
        };

        let result = match self.policy.bounded(call).await {
            Ok(result) => result,
            Err(_) => Err(CommitFailure::Timeout {
                after_secs: self.policy.call_timeout().as_secs(),
            }),
        };

        match result {
            Ok(transaction_id) => {
                info!(
                    broker_id = %broker_id,
                    registry = %target.name,
                    chain_id = %target.chain_id,
                    mode = mode.name(),
                    transaction_id = %transaction_id,
                    "commit confirmed"
                );
                Ok(CommitOutcome {
                    target: target.name.clone(),
                    chain_id: target.chain_id.clone(),
                    transaction_id,
                })
            }
            Err(failure) => {
                error!(
                    broker_id = %broker_id,
                    registry = %target.name,
                    chain_id = %target.chain_id,
                    mode = mode.name(),
                    error = %failure,
                    "commit failed"
                );
                Err(failure)
            }
        }
    }
}
