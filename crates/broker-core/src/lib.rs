#![deny(unsafe_code)]
//! Broker identity provisioning across EVM registries, a Solana program and three
//! mirrored datastores.
//!
//! Every state change is preceded by a dry run on every affected registry
//! (simulate-then-commit). The datastore leg is a saga with ordered compensation, and
//! every attempt is recorded in a hash-chained journal.

pub mod audit;
pub mod clients;
pub mod commit;
pub mod config;
pub mod coordinator;
pub mod credentials;
pub mod derivation;
pub mod error;
pub mod flow;
pub mod journal;
pub mod mirror;
pub mod registry;
pub mod runtime;
pub mod simulate;
pub mod storage;
pub mod types;

#[cfg(test)]
mod test_support;

pub use audit::{AuditDetail, AuditReport, ProvisioningAuditor};
pub use clients::{EvmRegistryClient, LedgerClients, SolanaRegistryClient, SolanaSimulation};
pub use commit::{ChainLocks, CommitExecutor, CommitOutcome};
pub use config::{CallPolicy, DatastoreConfig, DatastoresConfig, EnvironmentConfig, ProvisioningConfig};
pub use coordinator::{CommitRecord, ProvisioningCoordinator, ProvisioningReport};
pub use credentials::{Credentials, EvmCredential, SolanaCredential};
pub use error::{CommitFailure, DatastoreError, LedgerCallError, ProvisionError, SimulationFailure};
pub use flow::{ProvisioningStage, ProvisioningStateMachine};
pub use journal::{JournalEntry, JournalEntryKind, ProvisioningJournal, SharedJournal, StageEvent};
pub use mirror::{
    CompensationAction, DatastoreSet, MirrorFailure, MirrorReport, MirrorStep, RecordMirror,
};
pub use registry::{ChainRegistry, TargetPartition};
pub use runtime::{BrokerEngine, OnboardingReport};
pub use simulate::{CostEstimate, DryRunSimulator, SimulationOutcome};
pub use storage::{BrokerStore, DatastoreRole, MemoryBrokerStore, PostgresBrokerStore, StoredBroker};
pub use types::{
    BrokerData, BrokerId, BrokerRecord, Environment, EvmAddress, FeeRateBps, OperationMode,
    RegistryFamily, RegistryRole, RegistryTarget, SolanaPubkey,
};
