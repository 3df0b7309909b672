//! Wiring shared by the `brokerctl` binary: configuration, credentials, ledger clients
//! and datastores resolved into a ready [`BrokerEngine`].

use anyhow::Context;
use broker_adapters::{rpc_clients, ConfirmationPolicy, SandboxLedger};
use broker_core::{
    BrokerData, BrokerEngine, BrokerId, Credentials, DatastoreSet, EvmAddress, EvmCredential,
    FeeRateBps, ProvisioningConfig, SolanaCredential,
};
use clap::{Args, ValueEnum};
use ed25519_dalek::SigningKey;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LedgerMode {
    /// In-process registries; nothing leaves the machine.
    Sandbox,
    /// Live nodes reached over JSON-RPC.
    Rpc,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum DatastoreMode {
    Memory,
    Postgres,
}

#[derive(Debug, Clone)]
pub struct EngineOptions {
    pub config_path: PathBuf,
    pub ledger: LedgerMode,
    pub datastores: DatastoreMode,
}

/// Broker fields accepted by the `onboard` and `mirror` commands.
#[derive(Debug, Clone, Args)]
pub struct BrokerArgs {
    /// Broker identifier, e.g. `acme-dex`.
    #[arg(long)]
    pub broker_id: String,
    /// Display name stored with the record.
    #[arg(long)]
    pub broker_name: String,
    #[arg(long, default_value_t = 0)]
    pub maker_fee_bps: u32,
    #[arg(long, default_value_t = 0)]
    pub taker_fee_bps: u32,
    #[arg(long)]
    pub admin_account_id: Option<String>,
}

impl BrokerArgs {
    pub fn to_data(&self) -> anyhow::Result<BrokerData> {
        Ok(BrokerData {
            broker_id: BrokerId::parse(self.broker_id.clone())?,
            broker_name: self.broker_name.clone(),
            maker_fee_rate: FeeRateBps::new(self.maker_fee_bps)?,
            taker_fee_rate: FeeRateBps::new(self.taker_fee_bps)?,
            admin_account_id: self.admin_account_id.clone(),
        })
    }
}

/// Fixed operator identity used when sandbox runs have no credentials in the environment.
pub fn sandbox_credentials() -> Credentials {
    Credentials::new(
        EvmCredential {
            operator: EvmAddress([0x5a; 20]),
            signer_url: None,
        },
        SolanaCredential::from_signing_key(SigningKey::from_bytes(&[0x5a; 32])),
    )
}

fn resolve_credentials(ledger: LedgerMode) -> anyhow::Result<Credentials> {
    match (ledger, Credentials::from_env()) {
        (_, Ok(credentials)) => Ok(credentials),
        (LedgerMode::Sandbox, Err(err)) => {
            warn!(error = %err, "no operator credentials in environment, using sandbox identity");
            Ok(sandbox_credentials())
        }
        (LedgerMode::Rpc, Err(err)) => Err(err).context("rpc ledger requires operator credentials"),
    }
}

pub fn build_engine(options: &EngineOptions) -> anyhow::Result<BrokerEngine> {
    let config = ProvisioningConfig::load(&options.config_path)
        .with_context(|| format!("loading {}", options.config_path.display()))?;
    let credentials = Arc::new(resolve_credentials(options.ledger)?);

    let clients = match options.ledger {
        LedgerMode::Sandbox => SandboxLedger::new().clients(),
        LedgerMode::Rpc => {
            let timeout = config.policy.call_timeout();
            let confirmation = confirmation_within(timeout);
            rpc_clients(timeout, credentials.evm.signer_url.clone(), confirmation)?
        }
    };

    let stores = match options.datastores {
        DatastoreMode::Memory => DatastoreSet::in_memory(),
        DatastoreMode::Postgres => {
            let datastores = config
                .datastores
                .as_ref()
                .context("datastores=postgres requires a [datastores] section in the config")?;
            DatastoreSet::connect_postgres(datastores)?
        }
    };

    info!(
        config = %options.config_path.display(),
        ledger = ?options.ledger,
        datastores = ?options.datastores,
        "engine configured"
    );
    Ok(BrokerEngine::new(&config, clients, credentials, stores)?)
}

/// Confirmation polling that gives up before the per-call timeout fires.
///
/// Two poll intervals are kept back for the submission and status round-trips.
fn confirmation_within(timeout: Duration) -> ConfirmationPolicy {
    let default = ConfirmationPolicy::default();
    let interval = default.poll_interval.as_millis().max(1);
    let budget = timeout.as_millis().saturating_sub(2 * interval) / interval;
    ConfirmationPolicy {
        max_polls: u32::try_from(budget).unwrap_or(u32::MAX).max(1),
        ..default
    }
}
