use crate::credentials::SolanaCredential;
use crate::derivation::{BrokerAccountState, BrokerHash, SetBrokerInstruction};
use crate::error::LedgerCallError;
use crate::types::{EvmAddress, RegistryTarget, SolanaPubkey};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Access to broker allow-lists held in EVM contracts.
///
/// Every method receives the target so one client can serve all configured chains.
#[async_trait]
pub trait EvmRegistryClient: Send + Sync {
    /// `getAllowedBroker(bytes32)`.
    async fn is_broker_allowed(
        &self,
        target: &RegistryTarget,
        hash: &BrokerHash,
    ) -> Result<bool, LedgerCallError>;

    /// Estimated fee in wei (gas x gas price) of `setAllowedBroker(hash, allowed)`.
    async fn estimate_set_allowed_cost(
        &self,
        target: &RegistryTarget,
        hash: &BrokerHash,
        allowed: bool,
        from: &EvmAddress,
    ) -> Result<u128, LedgerCallError>;

    /// Native balance in wei.
    async fn balance_of(
        &self,
        target: &RegistryTarget,
        account: &EvmAddress,
    ) -> Result<u128, LedgerCallError>;

    /// `hasRole(bytes32,address)`.
    async fn has_role(
        &self,
        target: &RegistryTarget,
        role_hash: &[u8; 32],
        account: &EvmAddress,
    ) -> Result<bool, LedgerCallError>;

    /// Send `setAllowedBroker(hash, allowed)` and wait for a successful receipt.
    /// Returns the transaction hash.
    async fn set_broker_allowed(
        &self,
        target: &RegistryTarget,
        hash: &BrokerHash,
        allowed: bool,
        from: &EvmAddress,
    ) -> Result<String, LedgerCallError>;
}

/// Result of running an instruction in simulate mode.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SolanaSimulation {
    pub units_consumed: Option<u64>,
    pub error: Option<String>,
}

impl SolanaSimulation {
    pub fn succeeded(&self) -> bool {
        self.error.is_none()
    }
}

/// Access to the broker allow-list program on Solana.
#[async_trait]
pub trait SolanaRegistryClient: Send + Sync {
    /// Decoded broker allowance account, `None` when the account does not exist.
    async fn broker_account(
        &self,
        target: &RegistryTarget,
        address: &SolanaPubkey,
    ) -> Result<Option<BrokerAccountState>, LedgerCallError>;

    /// Whether an account exists. Errors mean the account could not be read.
    async fn account_exists(
        &self,
        target: &RegistryTarget,
        address: &SolanaPubkey,
    ) -> Result<bool, LedgerCallError>;

    async fn lamports(
        &self,
        target: &RegistryTarget,
        account: &SolanaPubkey,
    ) -> Result<u64, LedgerCallError>;

    async fn simulate_set_broker(
        &self,
        target: &RegistryTarget,
        instruction: &SetBrokerInstruction,
        signer: &SolanaCredential,
    ) -> Result<SolanaSimulation, LedgerCallError>;

    /// Sign, send and confirm `set_broker`. Returns the transaction signature.
    async fn submit_set_broker(
        &self,
        target: &RegistryTarget,
        instruction: &SetBrokerInstruction,
        signer: &SolanaCredential,
    ) -> Result<String, LedgerCallError>;
}

/// Ledger clients for both registry families.
#[derive(Clone)]
pub struct LedgerClients {
    pub evm: Arc<dyn EvmRegistryClient>,
    pub solana: Arc<dyn SolanaRegistryClient>,
}

impl LedgerClients {
    pub fn new(evm: Arc<dyn EvmRegistryClient>, solana: Arc<dyn SolanaRegistryClient>) -> Self {
        Self { evm, solana }
    }
}
