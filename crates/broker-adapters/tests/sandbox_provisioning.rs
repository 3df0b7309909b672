use broker_adapters::SandboxLedger;
use broker_core::derivation::{broker_account_address, broker_hash};
use broker_core::{
    BrokerData, BrokerEngine, BrokerId, BrokerRecord, BrokerStore, CallPolicy, Credentials,
    DatastoreRole, DatastoreSet, Environment, EnvironmentConfig, EvmAddress, EvmCredential,
    FeeRateBps, LedgerCallError, MemoryBrokerStore, ProvisioningConfig, ProvisioningStage,
    RegistryFamily, RegistryRole, RegistryTarget, SolanaCredential,
};
use ed25519_dalek::SigningKey;
use std::sync::Arc;
use std::time::Duration;

const PROGRAM_ID: &str = "ErBmAD61mGFKvrFNaTJuxoPwqrS8GgtwtqJTJVjFWx9Q";

fn evm(name: &str, chain_id: &str, role: RegistryRole) -> RegistryTarget {
    RegistryTarget {
        name: name.to_string(),
        family: RegistryFamily::Evm,
        role,
        chain_id: chain_id.to_string(),
        address: "0x816f722424b49cf1275cc86da9840fbd5a6167e9".to_string(),
        rpc_url: format!("http://{name}.sandbox"),
    }
}

fn solana(name: &str, cluster: &str) -> RegistryTarget {
    RegistryTarget {
        name: name.to_string(),
        family: RegistryFamily::Solana,
        role: RegistryRole::Vault,
        chain_id: cluster.to_string(),
        address: PROGRAM_ID.to_string(),
        rpc_url: format!("http://{name}.sandbox"),
    }
}

fn config(env: Environment, targets: Vec<RegistryTarget>) -> ProvisioningConfig {
    let mut config = ProvisioningConfig {
        policy: CallPolicy {
            call_timeout_secs: 5,
            ..CallPolicy::default()
        },
        ..ProvisioningConfig::default()
    };
    config
        .environments
        .insert(env, EnvironmentConfig { targets });
    config
}

fn credentials() -> Arc<Credentials> {
    Arc::new(Credentials::new(
        EvmCredential {
            operator: EvmAddress([0x22; 20]),
            signer_url: None,
        },
        SolanaCredential::from_signing_key(SigningKey::from_bytes(&[9; 32])),
    ))
}

fn acme() -> BrokerData {
    BrokerData {
        broker_id: BrokerId::parse("acme-dex").unwrap(),
        broker_name: "Acme DEX".to_string(),
        maker_fee_rate: FeeRateBps::new(3).unwrap(),
        taker_fee_rate: FeeRateBps::new(6).unwrap(),
        admin_account_id: Some("0xadmin".to_string()),
    }
}

fn engine(
    ledger: &Arc<SandboxLedger>,
    config: &ProvisioningConfig,
    stores: DatastoreSet,
) -> BrokerEngine {
    BrokerEngine::new(config, ledger.clients(), credentials(), stores).unwrap()
}

#[tokio::test]
async fn underfunded_solana_target_blocks_every_evm_commit() {
    let ledger = SandboxLedger::new();
    ledger.set_lamports("solana-mainnet-beta", 1_000).await;
    let config = config(
        Environment::Mainnet,
        vec![
            evm("arbitrum-vault", "42161", RegistryRole::Vault),
            evm("base-vault", "8453", RegistryRole::Vault),
            solana("solana-mainnet-beta", "mainnet-beta"),
        ],
    );
    let engine = engine(&ledger, &config, DatastoreSet::in_memory());

    let report = engine
        .provision_broker(&acme().broker_id, Environment::Mainnet)
        .await
        .unwrap();

    assert!(!report.ok);
    assert_eq!(report.stage, ProvisioningStage::Aborted);
    assert_eq!(report.errors.len(), 1);
    assert!(report.errors[0].starts_with("solana-mainnet-beta: insufficient balance"));
    assert!(report.transaction_ids.is_empty());
    assert!(ledger.commits().await.is_empty());
}

#[tokio::test]
async fn provisioning_commits_everywhere_then_second_attempt_is_refused() {
    let ledger = SandboxLedger::new();
    let config = config(
        Environment::Qa,
        vec![
            evm("sepolia-vault", "11155111", RegistryRole::Vault),
            solana("solana-devnet", "devnet"),
        ],
    );
    let engine = engine(&ledger, &config, DatastoreSet::in_memory());
    let broker_id = acme().broker_id;

    let first = engine
        .provision_broker(&broker_id, Environment::Qa)
        .await
        .unwrap();
    assert!(first.ok, "{:?}", first.errors);
    assert_eq!(first.stage, ProvisioningStage::Committed);
    assert_eq!(
        first.transaction_ids.keys().collect::<Vec<_>>(),
        vec!["sepolia-vault", "solana-devnet"]
    );

    let second = engine
        .provision_broker(&broker_id, Environment::Qa)
        .await
        .unwrap();
    assert!(!second.ok);
    assert_eq!(second.stage, ProvisioningStage::Aborted);
    assert_eq!(
        second.errors,
        vec![
            "sepolia-vault: already allowed".to_string(),
            "solana-devnet: already allowed".to_string(),
        ]
    );
    assert_eq!(ledger.commits().await.len(), 2);
}

#[tokio::test]
async fn failed_creation_commit_reports_no_transaction_map() {
    let ledger = SandboxLedger::new();
    ledger
        .fail_commits(
            "base-vault",
            LedgerCallError::Reverted {
                tx_id: "0xdead".to_string(),
            },
        )
        .await;
    let config = config(
        Environment::Mainnet,
        vec![
            evm("arbitrum-vault", "42161", RegistryRole::Vault),
            evm("base-vault", "8453", RegistryRole::Vault),
            solana("solana-mainnet-beta", "mainnet-beta"),
        ],
    );
    let engine = engine(&ledger, &config, DatastoreSet::in_memory());

    let report = engine
        .provision_broker(&acme().broker_id, Environment::Mainnet)
        .await
        .unwrap();

    assert!(!report.ok);
    assert_eq!(report.stage, ProvisioningStage::PartialFailure);
    assert!(report.transaction_ids.is_empty());
    assert_eq!(
        report.errors,
        vec!["base-vault: transaction 0xdead reverted".to_string()]
    );

    let mut confirmed: Vec<&str> = report
        .commits
        .iter()
        .filter(|record| record.ok)
        .map(|record| record.target.as_str())
        .collect();
    confirmed.sort_unstable();
    assert_eq!(confirmed, vec!["arbitrum-vault", "solana-mainnet-beta"]);
    assert_eq!(ledger.commits().await.len(), 2);
}

#[tokio::test]
async fn deletion_proceeds_on_targets_whose_simulation_passed() {
    let ledger = SandboxLedger::new();
    let broker_id = acme().broker_id;
    let hash = broker_hash(&broker_id);
    let target_a = evm("chain-a", "1", RegistryRole::Vault);
    let target_b = evm("chain-b", "10", RegistryRole::Vault);
    let target_c = solana("chain-c", "devnet");

    ledger.seed_evm_allowed(&target_a, hash).await;
    ledger.seed_evm_allowed(&target_b, hash).await;
    let program_id = target_c.program_id().unwrap();
    ledger
        .seed_solana_allowed(
            &target_c,
            broker_account_address(&program_id, &hash).unwrap(),
            hash,
        )
        .await;
    ledger
        .fail_reads(
            "chain-b",
            LedgerCallError::Transport("connection refused".to_string()),
        )
        .await;

    let config = config(
        Environment::Staging,
        vec![target_a, target_b, target_c],
    );
    let engine = engine(&ledger, &config, DatastoreSet::in_memory());

    let report = engine
        .deprovision_broker(&broker_id, Environment::Staging)
        .await
        .unwrap();

    assert!(report.ok);
    assert_eq!(report.stage, ProvisioningStage::Committed);
    assert_eq!(
        report.transaction_ids.keys().collect::<Vec<_>>(),
        vec!["chain-a", "chain-c"]
    );
    assert_eq!(report.errors.len(), 1);
    assert!(report.errors[0].starts_with("chain-b: "));

    let removed: Vec<(String, bool)> = ledger
        .commits()
        .await
        .into_iter()
        .map(|commit| (commit.target, commit.allowed))
        .collect();
    assert_eq!(removed.len(), 2);
    assert!(removed.iter().all(|(target, allowed)| target != "chain-b" && !allowed));
}

#[tokio::test]
async fn commits_on_one_chain_never_overlap() {
    let ledger = SandboxLedger::new();
    ledger.set_latency(Duration::from_millis(40)).await;
    let config = config(
        Environment::Dev,
        vec![
            evm("arb-vault", "42161", RegistryRole::Vault),
            evm("arb-vault-manager", "42161", RegistryRole::VaultManager),
            evm("arb-fee-manager", "42161", RegistryRole::FeeManager),
            evm("base-vault", "8453", RegistryRole::Vault),
        ],
    );
    let engine = engine(&ledger, &config, DatastoreSet::in_memory());

    let report = engine
        .provision_broker(&acme().broker_id, Environment::Dev)
        .await
        .unwrap();

    assert!(report.ok, "{:?}", report.errors);
    assert_eq!(report.transaction_ids.len(), 4);
    assert_eq!(ledger.max_in_flight("42161").await, 1);
}

#[tokio::test]
async fn audits_change_nothing_on_chain() {
    let ledger = SandboxLedger::new();
    ledger.revoke_role("base-vault").await;
    ledger.set_evm_balance("arbitrum-vault", 1_000).await;
    let config = config(
        Environment::Qa,
        vec![
            evm("arbitrum-vault", "421614", RegistryRole::Vault),
            evm("base-vault", "84532", RegistryRole::Vault),
            solana("solana-devnet", "devnet"),
        ],
    );
    let engine = engine(&ledger, &config, DatastoreSet::in_memory());

    let permissions = engine
        .check_provisioning_permissions(Environment::Qa)
        .await
        .unwrap();
    let again = engine
        .check_provisioning_permissions(Environment::Qa)
        .await
        .unwrap();
    assert_eq!(permissions, again);
    assert!(!permissions.ok);
    let failing: Vec<&str> = permissions
        .details
        .iter()
        .filter(|detail| !detail.ok)
        .map(|detail| detail.target.as_str())
        .collect();
    assert_eq!(failing, vec!["base-vault"]);

    let balances = engine.check_funding_balances(Environment::Qa).await.unwrap();
    assert!(!balances.ok);
    assert!(balances
        .details
        .iter()
        .any(|detail| detail.target == "arbitrum-vault" && !detail.ok));

    assert!(ledger.commits().await.is_empty());
}

async fn assert_absent_everywhere(stores: &DatastoreSet, broker_id: &BrokerId) {
    for role in DatastoreRole::WRITE_ORDER {
        assert!(
            stores.get(role).fetch(broker_id).await.unwrap().is_none(),
            "{role} still holds {broker_id}"
        );
    }
}

#[tokio::test]
async fn duplicate_in_tertiary_rolls_back_earlier_writes() {
    let tertiary = Arc::new(MemoryBrokerStore::new(DatastoreRole::Tertiary, false));
    tertiary
        .insert(&BrokerRecord::from_data(&acme()))
        .await
        .unwrap();
    let stores = DatastoreSet::new(
        Arc::new(MemoryBrokerStore::new(DatastoreRole::Primary, false)),
        Arc::new(MemoryBrokerStore::new(DatastoreRole::Secondary, true)),
        tertiary.clone(),
    );
    let ledger = SandboxLedger::new();
    let config = config(
        Environment::Qa,
        vec![evm("sepolia-vault", "11155111", RegistryRole::Vault)],
    );
    let engine = engine(&ledger, &config, stores.clone());

    let report = engine.mirror_broker_record(&acme()).await;

    assert!(!report.ok);
    assert!(report.compensation_complete());
    assert_eq!(report.compensations.len(), 2);
    assert!(report.message.contains("rolled back 2 earlier write(s)"));
    assert!(stores
        .primary
        .fetch(&acme().broker_id)
        .await
        .unwrap()
        .is_none());
    assert!(stores
        .secondary
        .fetch(&acme().broker_id)
        .await
        .unwrap()
        .is_none());
    // The pre-existing tertiary row belongs to someone else and stays.
    assert!(tertiary.fetch(&acme().broker_id).await.unwrap().is_some());
}

#[tokio::test]
async fn unreachable_tertiary_leaves_no_row_behind() {
    let tertiary = Arc::new(MemoryBrokerStore::new(DatastoreRole::Tertiary, false));
    tertiary.set_reachable(false);
    let stores = DatastoreSet::new(
        Arc::new(MemoryBrokerStore::new(DatastoreRole::Primary, false)),
        Arc::new(MemoryBrokerStore::new(DatastoreRole::Secondary, true)),
        tertiary.clone(),
    );
    let ledger = SandboxLedger::new();
    let config = config(
        Environment::Qa,
        vec![
            evm("sepolia-vault", "11155111", RegistryRole::Vault),
            solana("solana-devnet", "devnet"),
        ],
    );
    let engine = engine(&ledger, &config, stores.clone());

    let report = engine
        .onboard_broker(&acme(), Environment::Qa)
        .await
        .unwrap();

    assert!(!report.ok);
    assert_eq!(report.stage, ProvisioningStage::MirrorRolledBack);
    assert_eq!(report.provisioning.transaction_ids.len(), 2);
    let mirror = report.mirror.unwrap();
    assert_eq!(mirror.errors.len(), 1);
    assert!(mirror.errors[0].starts_with("tertiary: "));

    tertiary.set_reachable(true);
    assert_absent_everywhere(&stores, &acme().broker_id).await;
}

#[tokio::test]
async fn onboarding_then_unmirroring_clears_every_store() {
    let ledger = SandboxLedger::new();
    let stores = DatastoreSet::in_memory();
    let config = config(
        Environment::Qa,
        vec![
            evm("sepolia-vault", "11155111", RegistryRole::Vault),
            solana("solana-devnet", "devnet"),
        ],
    );
    let engine = engine(&ledger, &config, stores.clone());

    let report = engine
        .onboard_broker(&acme(), Environment::Qa)
        .await
        .unwrap();
    assert!(report.ok);
    assert_eq!(report.stage, ProvisioningStage::Done);
    let mirror = report.mirror.unwrap();
    assert_eq!(mirror.broker_index, Some(1));
    assert_eq!(mirror.written.len(), 3);

    let removal = engine.unmirror_broker_record(&acme().broker_id).await;
    assert!(removal.ok, "{:?}", removal.errors);
    assert_eq!(removal.removed.len(), 3);
    assert_absent_everywhere(&stores, &acme().broker_id).await;

    let journal = engine.journal();
    let journal = journal.lock().await;
    assert!(journal.verify_chain());
    assert!(!journal.entries_for(report.attempt_id).is_empty());
}
