//! Deterministic in-process ledger for both registry families.
//!
//! State is keyed the way the real registries key it: EVM allow-lists by chain, contract
//! and broker hash; Solana broker accounts by their program-derived address. Reads,
//! writes and balances can be scripted per target to rehearse failure paths.

use crate::solana_rpc::{encode_set_broker_message, encode_transaction};
use async_trait::async_trait;
use broker_core::clients::{
    EvmRegistryClient, LedgerClients, SolanaRegistryClient, SolanaSimulation,
};
use broker_core::credentials::SolanaCredential;
use broker_core::derivation::{
    decode_broker_account, encode_broker_account, keccak256, BrokerAccountState, BrokerHash,
    SetBrokerInstruction,
};
use broker_core::error::LedgerCallError;
use broker_core::types::{EvmAddress, RegistryTarget, SolanaPubkey};
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::debug;

/// Gas units charged for one `setAllowedBroker` call.
pub const SET_ALLOWED_GAS: u128 = 46_000;
pub const DEFAULT_GAS_PRICE_WEI: u128 = 1_000_000_000;
pub const DEFAULT_EVM_BALANCE_WEI: u128 = 1_000_000_000_000_000_000;
pub const DEFAULT_LAMPORTS: u64 = 1_000_000_000;
/// Compute units reported for a simulated `set_broker`.
pub const SET_BROKER_UNITS: u64 = 6_500;

/// One confirmed registry write.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SandboxCommit {
    pub target: String,
    pub chain_id: String,
    pub transaction_id: String,
    pub allowed: bool,
}

#[derive(Debug, Default)]
struct SandboxState {
    evm_allowed: HashMap<(String, String, BrokerHash), bool>,
    solana_accounts: HashMap<(String, SolanaPubkey), Vec<u8>>,
    evm_balances: HashMap<String, u128>,
    gas_price: HashMap<String, u128>,
    lamports: HashMap<String, u64>,
    revoked_roles: HashSet<String>,
    unreadable_role_accounts: HashSet<String>,
    read_failures: HashMap<String, LedgerCallError>,
    commit_failures: HashMap<String, LedgerCallError>,
    latency: Duration,
    nonce: u64,
    commits: Vec<SandboxCommit>,
    in_flight: HashMap<String, usize>,
    max_in_flight: HashMap<String, usize>,
}

#[derive(Debug, Default)]
pub struct SandboxLedger {
    state: Mutex<SandboxState>,
}

impl SandboxLedger {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Client set backed by this ledger for both families.
    pub fn clients(self: &Arc<Self>) -> LedgerClients {
        LedgerClients::new(self.clone(), self.clone())
    }

    pub async fn set_evm_balance(&self, target: &str, wei: u128) {
        self.state
            .lock()
            .await
            .evm_balances
            .insert(target.to_string(), wei);
    }

    pub async fn set_gas_price(&self, target: &str, wei: u128) {
        self.state
            .lock()
            .await
            .gas_price
            .insert(target.to_string(), wei);
    }

    pub async fn set_lamports(&self, target: &str, lamports: u64) {
        self.state
            .lock()
            .await
            .lamports
            .insert(target.to_string(), lamports);
    }

    /// Operator loses the registry's manager role on `target`.
    pub async fn revoke_role(&self, target: &str) {
        self.state
            .lock()
            .await
            .revoked_roles
            .insert(target.to_string());
    }

    /// Role account lookups on `target` fail at the transport level.
    pub async fn set_role_account_unreadable(&self, target: &str) {
        self.state
            .lock()
            .await
            .unreadable_role_accounts
            .insert(target.to_string());
    }

    pub async fn fail_reads(&self, target: &str, error: LedgerCallError) {
        self.state
            .lock()
            .await
            .read_failures
            .insert(target.to_string(), error);
    }

    pub async fn fail_commits(&self, target: &str, error: LedgerCallError) {
        self.state
            .lock()
            .await
            .commit_failures
            .insert(target.to_string(), error);
    }

    pub async fn clear_failures(&self, target: &str) {
        let mut state = self.state.lock().await;
        state.read_failures.remove(target);
        state.commit_failures.remove(target);
    }

    /// Delay applied to every call.
    pub async fn set_latency(&self, latency: Duration) {
        self.state.lock().await.latency = latency;
    }

    /// Mark a broker as allowed on an EVM target without going through a commit.
    pub async fn seed_evm_allowed(&self, target: &RegistryTarget, hash: BrokerHash) {
        self.state
            .lock()
            .await
            .evm_allowed
            .insert(evm_key(target, hash), true);
    }

    /// Create an allowed broker account at `address` on a Solana target.
    pub async fn seed_solana_allowed(
        &self,
        target: &RegistryTarget,
        address: SolanaPubkey,
        hash: BrokerHash,
    ) {
        let data = encode_broker_account(&BrokerAccountState {
            broker_hash: hash,
            allowed: true,
        });
        self.state
            .lock()
            .await
            .solana_accounts
            .insert((target.chain_id.clone(), address), data);
    }

    pub async fn commits(&self) -> Vec<SandboxCommit> {
        self.state.lock().await.commits.clone()
    }

    /// Highest number of writes observed in flight at once on `chain_id`.
    pub async fn max_in_flight(&self, chain_id: &str) -> usize {
        self.state
            .lock()
            .await
            .max_in_flight
            .get(chain_id)
            .copied()
            .unwrap_or(0)
    }

    async fn before_read(&self, target: &RegistryTarget) -> Result<(), LedgerCallError> {
        let (latency, failure) = {
            let state = self.state.lock().await;
            (state.latency, state.read_failures.get(&target.name).cloned())
        };
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        match failure {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    /// Runs `apply` after the configured latency, tracking overlap per chain.
    async fn write<F>(&self, target: &RegistryTarget, allowed: bool, apply: F) -> Result<String, LedgerCallError>
    where
        F: FnOnce(&mut SandboxState, u64) -> String,
    {
        let latency = {
            let mut state = self.state.lock().await;
            let in_flight = state.in_flight.entry(target.chain_id.clone()).or_default();
            *in_flight += 1;
            let current = *in_flight;
            let max = state.max_in_flight.entry(target.chain_id.clone()).or_default();
            *max = (*max).max(current);
            state.latency
        };
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }

        let mut state = self.state.lock().await;
        if let Some(in_flight) = state.in_flight.get_mut(&target.chain_id) {
            *in_flight = in_flight.saturating_sub(1);
        }
        if let Some(error) = state.commit_failures.get(&target.name) {
            return Err(error.clone());
        }

        state.nonce += 1;
        let nonce = state.nonce;
        let transaction_id = apply(&mut state, nonce);
        state.commits.push(SandboxCommit {
            target: target.name.clone(),
            chain_id: target.chain_id.clone(),
            transaction_id: transaction_id.clone(),
            allowed,
        });
        debug!(registry = %target.name, tx = %transaction_id, allowed, "sandbox write confirmed");
        Ok(transaction_id)
    }
}

fn evm_key(target: &RegistryTarget, hash: BrokerHash) -> (String, String, BrokerHash) {
    (
        target.chain_id.clone(),
        target.address.to_ascii_lowercase(),
        hash,
    )
}

#[async_trait]
impl EvmRegistryClient for SandboxLedger {
    async fn is_broker_allowed(
        &self,
        target: &RegistryTarget,
        hash: &BrokerHash,
    ) -> Result<bool, LedgerCallError> {
        self.before_read(target).await?;
        Ok(self
            .state
            .lock()
            .await
            .evm_allowed
            .get(&evm_key(target, *hash))
            .copied()
            .unwrap_or(false))
    }

    async fn estimate_set_allowed_cost(
        &self,
        target: &RegistryTarget,
        _hash: &BrokerHash,
        _allowed: bool,
        _from: &EvmAddress,
    ) -> Result<u128, LedgerCallError> {
        self.before_read(target).await?;
        let gas_price = self
            .state
            .lock()
            .await
            .gas_price
            .get(&target.name)
            .copied()
            .unwrap_or(DEFAULT_GAS_PRICE_WEI);
        SET_ALLOWED_GAS
            .checked_mul(gas_price)
            .ok_or_else(|| LedgerCallError::Decode("cost estimate overflow".to_string()))
    }

    async fn balance_of(
        &self,
        target: &RegistryTarget,
        _account: &EvmAddress,
    ) -> Result<u128, LedgerCallError> {
        self.before_read(target).await?;
        Ok(self
            .state
            .lock()
            .await
            .evm_balances
            .get(&target.name)
            .copied()
            .unwrap_or(DEFAULT_EVM_BALANCE_WEI))
    }

    async fn has_role(
        &self,
        target: &RegistryTarget,
        _role_hash: &[u8; 32],
        _account: &EvmAddress,
    ) -> Result<bool, LedgerCallError> {
        self.before_read(target).await?;
        Ok(!self.state.lock().await.revoked_roles.contains(&target.name))
    }

    async fn set_broker_allowed(
        &self,
        target: &RegistryTarget,
        hash: &BrokerHash,
        allowed: bool,
        from: &EvmAddress,
    ) -> Result<String, LedgerCallError> {
        let key = evm_key(target, *hash);
        let name = target.name.clone();
        let from = *from;
        let hash = *hash;
        self.write(target, allowed, move |state, nonce| {
            state.evm_allowed.insert(key, allowed);
            let mut material = Vec::with_capacity(128);
            material.extend_from_slice(name.as_bytes());
            material.extend_from_slice(&from.0);
            material.extend_from_slice(hash.as_bytes());
            material.push(u8::from(allowed));
            material.extend_from_slice(&nonce.to_be_bytes());
            format!("0x{}", hex::encode(keccak256(&material)))
        })
        .await
    }
}

#[async_trait]
impl SolanaRegistryClient for SandboxLedger {
    async fn broker_account(
        &self,
        target: &RegistryTarget,
        address: &SolanaPubkey,
    ) -> Result<Option<BrokerAccountState>, LedgerCallError> {
        self.before_read(target).await?;
        let state = self.state.lock().await;
        match state
            .solana_accounts
            .get(&(target.chain_id.clone(), *address))
        {
            None => Ok(None),
            Some(data) => decode_broker_account(data)
                .map(Some)
                .map_err(LedgerCallError::Decode),
        }
    }

    async fn account_exists(
        &self,
        target: &RegistryTarget,
        address: &SolanaPubkey,
    ) -> Result<bool, LedgerCallError> {
        self.before_read(target).await?;
        let state = self.state.lock().await;
        if state.unreadable_role_accounts.contains(&target.name) {
            return Err(LedgerCallError::Transport(format!(
                "account {address} unavailable"
            )));
        }
        if state
            .solana_accounts
            .contains_key(&(target.chain_id.clone(), *address))
        {
            return Ok(true);
        }
        // Role accounts are implicit: present unless the role was revoked.
        Ok(!state.revoked_roles.contains(&target.name))
    }

    async fn lamports(
        &self,
        target: &RegistryTarget,
        _account: &SolanaPubkey,
    ) -> Result<u64, LedgerCallError> {
        self.before_read(target).await?;
        Ok(self
            .state
            .lock()
            .await
            .lamports
            .get(&target.name)
            .copied()
            .unwrap_or(DEFAULT_LAMPORTS))
    }

    async fn simulate_set_broker(
        &self,
        target: &RegistryTarget,
        _instruction: &SetBrokerInstruction,
        _signer: &SolanaCredential,
    ) -> Result<SolanaSimulation, LedgerCallError> {
        self.before_read(target).await?;
        let revoked = self.state.lock().await.revoked_roles.contains(&target.name);
        Ok(SolanaSimulation {
            units_consumed: Some(SET_BROKER_UNITS),
            error: revoked.then(|| {
                "AnchorError caused by account: manager_role. Error Code: AccountNotInitialized"
                    .to_string()
            }),
        })
    }

    async fn submit_set_broker(
        &self,
        target: &RegistryTarget,
        instruction: &SetBrokerInstruction,
        signer: &SolanaCredential,
    ) -> Result<String, LedgerCallError> {
        let account_key = (target.chain_id.clone(), instruction.broker_account);
        let data = encode_broker_account(&BrokerAccountState {
            broker_hash: instruction.broker_hash,
            allowed: instruction.allowed,
        });
        let instruction = instruction.clone();
        let signer = signer.clone();
        self.write(target, instruction.allowed, move |state, nonce| {
            state.solana_accounts.insert(account_key, data);
            let mut blockhash = [0u8; 32];
            blockhash[24..].copy_from_slice(&nonce.to_be_bytes());
            let message = encode_set_broker_message(&instruction, blockhash);
            let signature = signer.sign(&message);
            let transaction = encode_transaction(&message, &signature);
            debug!(bytes = transaction.len(), "sandbox transaction encoded");
            bs58::encode(signature).into_string()
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use broker_core::derivation::broker_hash;
    use broker_core::types::{BrokerId, RegistryFamily, RegistryRole};
    use ed25519_dalek::SigningKey;

    fn evm_target() -> RegistryTarget {
        RegistryTarget {
            name: "arbitrum-vault".to_string(),
            family: RegistryFamily::Evm,
            role: RegistryRole::Vault,
            chain_id: "42161".to_string(),
            address: "0x816F722424B49Cf1275cc86DA9840Fbd5a6167e9".to_string(),
            rpc_url: "http://sandbox".to_string(),
        }
    }

    fn solana_target() -> RegistryTarget {
        RegistryTarget {
            name: "solana-devnet".to_string(),
            family: RegistryFamily::Solana,
            role: RegistryRole::Vault,
            chain_id: "devnet".to_string(),
            address: "ErBmAD61mGFKvrFNaTJuxoPwqrS8GgtwtqJTJVjFWx9Q".to_string(),
            rpc_url: "http://sandbox".to_string(),
        }
    }

    #[tokio::test]
    async fn evm_writes_are_visible_to_reads() {
        let ledger = SandboxLedger::new();
        let target = evm_target();
        let hash = broker_hash(&BrokerId::parse("acme-dex").unwrap());
        let operator = EvmAddress([1; 20]);

        assert!(!ledger.is_broker_allowed(&target, &hash).await.unwrap());
        let tx = ledger
            .set_broker_allowed(&target, &hash, true, &operator)
            .await
            .unwrap();
        assert!(tx.starts_with("0x"));
        assert_eq!(tx.len(), 66);
        assert!(ledger.is_broker_allowed(&target, &hash).await.unwrap());

        let commits = ledger.commits().await;
        assert_eq!(commits.len(), 1);
        assert_eq!(commits[0].chain_id, "42161");
    }

    #[tokio::test]
    async fn solana_writes_land_at_the_derived_account() {
        let ledger = SandboxLedger::new();
        let target = solana_target();
        let signer = SolanaCredential::from_signing_key(SigningKey::from_bytes(&[3; 32]));
        let instruction = SetBrokerInstruction::derive(
            target.program_id().unwrap(),
            target.role,
            signer.pubkey(),
            &BrokerId::parse("acme-dex").unwrap(),
            true,
        )
        .unwrap();

        let signature = ledger
            .submit_set_broker(&target, &instruction, &signer)
            .await
            .unwrap();
        assert_eq!(bs58::decode(&signature).into_vec().unwrap().len(), 64);

        let account = ledger
            .broker_account(&target, &instruction.broker_account)
            .await
            .unwrap()
            .unwrap();
        assert!(account.allowed);
        assert_eq!(account.broker_hash, instruction.broker_hash);
    }

    #[tokio::test]
    async fn scripted_failures_surface_as_ledger_errors() {
        let ledger = SandboxLedger::new();
        let target = evm_target();
        let hash = BrokerHash([5; 32]);
        ledger
            .fail_reads(&target.name, LedgerCallError::Transport("connection refused".into()))
            .await;
        assert!(matches!(
            ledger.is_broker_allowed(&target, &hash).await,
            Err(LedgerCallError::Transport(_))
        ));

        ledger.clear_failures(&target.name).await;
        ledger
            .fail_commits(&target.name, LedgerCallError::Reverted { tx_id: "0xdead".into() })
            .await;
        assert!(ledger
            .set_broker_allowed(&target, &hash, true, &EvmAddress([1; 20]))
            .await
            .is_err());
        assert!(!ledger.is_broker_allowed(&target, &hash).await.unwrap());
        assert!(ledger.commits().await.is_empty());
    }

    #[tokio::test]
    async fn revoked_role_fails_simulation() {
        let ledger = SandboxLedger::new();
        let target = solana_target();
        let signer = SolanaCredential::from_signing_key(SigningKey::from_bytes(&[3; 32]));
        let instruction = SetBrokerInstruction::derive(
            target.program_id().unwrap(),
            target.role,
            signer.pubkey(),
            &BrokerId::parse("acme-dex").unwrap(),
            true,
        )
        .unwrap();

        ledger.revoke_role(&target.name).await;
        assert!(!ledger
            .account_exists(&target, &instruction.manager_role_account)
            .await
            .unwrap());
        let simulation = ledger
            .simulate_set_broker(&target, &instruction, &signer)
            .await
            .unwrap();
        assert!(!simulation.succeeded());
    }
}
