use broker_core::{BrokerId, Environment};
use broker_ops::{build_engine, BrokerArgs, DatastoreMode, EngineOptions, LedgerMode};
use clap::{Parser, Subcommand};
use serde::Serialize;
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::info;

#[derive(Debug, Parser)]
#[command(name = "brokerctl", version, about = "Broker identity provisioning")]
struct Cli {
    /// Provisioning configuration (registry targets per environment, datastores, policy).
    #[arg(long, default_value = "config/sandbox.toml", env = "BROKER_CONFIG")]
    config: PathBuf,
    /// Where registry calls go.
    #[arg(long, value_enum, default_value_t = LedgerMode::Sandbox, env = "BROKER_LEDGER")]
    ledger: LedgerMode,
    /// Backend of the three mirrored datastores.
    #[arg(long, value_enum, default_value_t = DatastoreMode::Memory, env = "BROKER_DATASTORES")]
    datastores: DatastoreMode,
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Allow a broker on every registry of an environment.
    Provision {
        #[arg(long)]
        broker_id: String,
        #[arg(long)]
        env: Environment,
    },
    /// Remove a broker from every registry where that is possible.
    Deprovision {
        #[arg(long)]
        broker_id: String,
        #[arg(long)]
        env: Environment,
    },
    /// Provision on chain, then mirror the record into the datastores.
    Onboard {
        #[command(flatten)]
        broker: BrokerArgs,
        #[arg(long)]
        env: Environment,
    },
    /// Check the operator's manager role on every registry.
    CheckPermissions {
        #[arg(long)]
        env: Environment,
    },
    /// Check the operator's balance against the configured floors.
    CheckBalances {
        #[arg(long)]
        env: Environment,
    },
    /// Write the broker record to primary, secondary and tertiary.
    Mirror {
        #[command(flatten)]
        broker: BrokerArgs,
    },
    /// Delete the broker record from every datastore.
    Unmirror {
        #[arg(long)]
        broker_id: String,
    },
}

fn emit<T: Serialize>(report: &T, ok: bool) -> anyhow::Result<ExitCode> {
    println!("{}", serde_json::to_string_pretty(report)?);
    Ok(if ok {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    tracing_subscriber::fmt()
        .with_env_filter(std::env::var("RUST_LOG").unwrap_or_else(|_| {
            "brokerctl=info,broker_ops=info,broker_core=info,broker_adapters=info,warn".to_string()
        }))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let engine = build_engine(&EngineOptions {
        config_path: cli.config.clone(),
        ledger: cli.ledger,
        datastores: cli.datastores,
    })?;
    info!(command = ?cli.command, "running");

    match cli.command {
        Command::Provision { broker_id, env } => {
            let report = engine
                .provision_broker(&BrokerId::parse(broker_id)?, env)
                .await?;
            emit(&report, report.ok)
        }
        Command::Deprovision { broker_id, env } => {
            let report = engine
                .deprovision_broker(&BrokerId::parse(broker_id)?, env)
                .await?;
            emit(&report, report.ok)
        }
        Command::Onboard { broker, env } => {
            let report = engine.onboard_broker(&broker.to_data()?, env).await?;
            emit(&report, report.ok)
        }
        Command::CheckPermissions { env } => {
            let report = engine.check_provisioning_permissions(env).await?;
            emit(&report, report.ok)
        }
        Command::CheckBalances { env } => {
            let report = engine.check_funding_balances(env).await?;
            emit(&report, report.ok)
        }
        Command::Mirror { broker } => {
            let report = engine.mirror_broker_record(&broker.to_data()?).await;
            emit(&report, report.ok)
        }
        Command::Unmirror { broker_id } => {
            let report = engine
                .unmirror_broker_record(&BrokerId::parse(broker_id)?)
                .await;
            emit(&report, report.ok)
        }
    }
}
