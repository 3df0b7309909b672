//! Scripted ledger shared by the unit tests of this crate.

use crate::clients::{EvmRegistryClient, LedgerClients, SolanaRegistryClient, SolanaSimulation};
use crate::commit::CommitExecutor;
use crate::config::CallPolicy;
use crate::credentials::{Credentials, EvmCredential, SolanaCredential};
use crate::derivation::{BrokerAccountState, BrokerHash, SetBrokerInstruction};
use crate::error::LedgerCallError;
use crate::simulate::DryRunSimulator;
use crate::types::{EvmAddress, RegistryFamily, RegistryRole, RegistryTarget, SolanaPubkey};
use async_trait::async_trait;
use ed25519_dalek::SigningKey;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

pub const GAS_COST_WEI: u128 = 21_000 * 1_000_000_000;

pub fn evm_target(name: &str, chain_id: &str) -> RegistryTarget {
    RegistryTarget {
        name: name.to_string(),
        family: RegistryFamily::Evm,
        role: RegistryRole::Vault,
        chain_id: chain_id.to_string(),
        address: "0x816f722424b49cf1275cc86da9840fbd5a6167e9".to_string(),
        rpc_url: format!("http://{name}.local"),
    }
}

pub fn solana_target(name: &str) -> RegistryTarget {
    RegistryTarget {
        name: name.to_string(),
        family: RegistryFamily::Solana,
        role: RegistryRole::Vault,
        chain_id: "devnet".to_string(),
        address: "ErBmAD61mGFKvrFNaTJuxoPwqrS8GgtwtqJTJVjFWx9Q".to_string(),
        rpc_url: format!("http://{name}.local"),
    }
}

pub fn credentials() -> Arc<Credentials> {
    Arc::new(Credentials::new(
        EvmCredential {
            operator: EvmAddress([0x11; 20]),
            signer_url: None,
        },
        SolanaCredential::from_signing_key(SigningKey::from_bytes(&[7; 32])),
    ))
}

#[derive(Debug, Default)]
struct State {
    allowed: HashMap<String, bool>,
    evm_balance: HashMap<String, u128>,
    revoked: HashSet<String>,
    solana_lamports: Option<u64>,
    role_unreadable: bool,
    instruction_error: Option<String>,
    read_delay: Duration,
    commit_delay: Duration,
    commit_failures: HashMap<String, LedgerCallError>,
    commits: Vec<String>,
    reads: usize,
    in_flight: HashMap<String, usize>,
    max_in_flight: HashMap<String, usize>,
}

/// In-memory ledger for both families, keyed by target name.
#[derive(Debug, Default)]
pub struct ScriptedLedger {
    state: Mutex<State>,
}

impl ScriptedLedger {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn clients(self: &Arc<Self>) -> LedgerClients {
        LedgerClients::new(self.clone(), self.clone())
    }

    pub fn simulator(self: &Arc<Self>, policy: CallPolicy) -> DryRunSimulator {
        DryRunSimulator::new(self.clients(), credentials(), policy)
    }

    pub fn executor(self: &Arc<Self>, policy: CallPolicy) -> CommitExecutor {
        CommitExecutor::new(self.clients(), credentials(), policy)
    }

    pub async fn allow(&self, target: &str) {
        self.state
            .lock()
            .await
            .allowed
            .insert(target.to_string(), true);
    }

    pub async fn is_allowed(&self, target: &str) -> bool {
        self.state
            .lock()
            .await
            .allowed
            .get(target)
            .copied()
            .unwrap_or(false)
    }

    pub async fn set_evm_balance(&self, target: &str, wei: u128) {
        self.state
            .lock()
            .await
            .evm_balance
            .insert(target.to_string(), wei);
    }

    pub async fn revoke_role(&self, target: &str) {
        self.state.lock().await.revoked.insert(target.to_string());
    }

    pub async fn set_solana_lamports(&self, lamports: u64) {
        self.state.lock().await.solana_lamports = Some(lamports);
    }

    pub async fn set_role_account_unreadable(&self) {
        self.state.lock().await.role_unreadable = true;
    }

    pub async fn set_instruction_error(&self, error: &str) {
        self.state.lock().await.instruction_error = Some(error.to_string());
    }

    pub async fn set_read_delay(&self, delay: Duration) {
        self.state.lock().await.read_delay = delay;
    }

    pub async fn set_commit_delay(&self, delay: Duration) {
        self.state.lock().await.commit_delay = delay;
    }

    pub async fn fail_commit(&self, target: &str, error: LedgerCallError) {
        self.state
            .lock()
            .await
            .commit_failures
            .insert(target.to_string(), error);
    }

    /// Target names of confirmed commits, in confirmation order.
    pub async fn commits(&self) -> Vec<String> {
        self.state.lock().await.commits.clone()
    }

    pub async fn reads(&self) -> usize {
        self.state.lock().await.reads
    }

    pub async fn max_in_flight(&self, chain_id: &str) -> usize {
        self.state
            .lock()
            .await
            .max_in_flight
            .get(chain_id)
            .copied()
            .unwrap_or(0)
    }

    async fn read(&self) {
        let delay = {
            let mut state = self.state.lock().await;
            state.reads += 1;
            state.read_delay
        };
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
    }

    async fn write(&self, target: &RegistryTarget, allowed: bool) -> Result<String, LedgerCallError> {
        let delay = {
            let mut state = self.state.lock().await;
            let in_flight = state.in_flight.entry(target.chain_id.clone()).or_default();
            *in_flight += 1;
            let current = *in_flight;
            let max = state.max_in_flight.entry(target.chain_id.clone()).or_default();
            *max = (*max).max(current);
            state.commit_delay
        };
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.state.lock().await;
        if let Some(in_flight) = state.in_flight.get_mut(&target.chain_id) {
            *in_flight -= 1;
        }
        if let Some(error) = state.commit_failures.get(&target.name) {
            return Err(error.clone());
        }
        state.allowed.insert(target.name.clone(), allowed);
        state.commits.push(target.name.clone());
        Ok(format!("tx-{}-{}", target.name, state.commits.len()))
    }
}

#[async_trait]
impl EvmRegistryClient for ScriptedLedger {
    async fn is_broker_allowed(
        &self,
        target: &RegistryTarget,
        _hash: &BrokerHash,
    ) -> Result<bool, LedgerCallError> {
        self.read().await;
        Ok(self.is_allowed(&target.name).await)
    }

    async fn estimate_set_allowed_cost(
        &self,
        _target: &RegistryTarget,
        _hash: &BrokerHash,
        _allowed: bool,
        _from: &EvmAddress,
    ) -> Result<u128, LedgerCallError> {
        self.read().await;
        Ok(GAS_COST_WEI)
    }

    async fn balance_of(
        &self,
        target: &RegistryTarget,
        _account: &EvmAddress,
    ) -> Result<u128, LedgerCallError> {
        self.read().await;
        Ok(self
            .state
            .lock()
            .await
            .evm_balance
            .get(&target.name)
            .copied()
            .unwrap_or(1_000_000_000_000_000_000))
    }

    async fn has_role(
        &self,
        target: &RegistryTarget,
        _role_hash: &[u8; 32],
        _account: &EvmAddress,
    ) -> Result<bool, LedgerCallError> {
        self.read().await;
        Ok(!self.state.lock().await.revoked.contains(&target.name))
    }

    async fn set_broker_allowed(
        &self,
        target: &RegistryTarget,
        _hash: &BrokerHash,
        allowed: bool,
        _from: &EvmAddress,
    ) -> Result<String, LedgerCallError> {
        self.write(target, allowed).await
    }
}

#[async_trait]
impl SolanaRegistryClient for ScriptedLedger {
    async fn broker_account(
        &self,
        target: &RegistryTarget,
        _address: &SolanaPubkey,
    ) -> Result<Option<BrokerAccountState>, LedgerCallError> {
        self.read().await;
        if !self.is_allowed(&target.name).await {
            return Ok(None);
        }
        Ok(Some(BrokerAccountState {
            broker_hash: BrokerHash([0; 32]),
            allowed: true,
        }))
    }

    async fn account_exists(
        &self,
        target: &RegistryTarget,
        _address: &SolanaPubkey,
    ) -> Result<bool, LedgerCallError> {
        self.read().await;
        let state = self.state.lock().await;
        if state.role_unreadable {
            return Err(LedgerCallError::Transport("connection reset".to_string()));
        }
        Ok(!state.revoked.contains(&target.name))
    }

    async fn lamports(
        &self,
        _target: &RegistryTarget,
        _account: &SolanaPubkey,
    ) -> Result<u64, LedgerCallError> {
        self.read().await;
        Ok(self
            .state
            .lock()
            .await
            .solana_lamports
            .unwrap_or(1_000_000_000))
    }

    async fn simulate_set_broker(
        &self,
        _target: &RegistryTarget,
        _instruction: &SetBrokerInstruction,
        _signer: &SolanaCredential,
    ) -> Result<SolanaSimulation, LedgerCallError> {
        self.read().await;
        Ok(SolanaSimulation {
            units_consumed: Some(4_200),
            error: self.state.lock().await.instruction_error.clone(),
        })
    }

    async fn submit_set_broker(
        &self,
        target: &RegistryTarget,
        instruction: &SetBrokerInstruction,
        _signer: &SolanaCredential,
    ) -> Result<String, LedgerCallError> {
        self.write(target, instruction.allowed).await
    }
}
