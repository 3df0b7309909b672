use crate::audit::{AuditReport, ProvisioningAuditor};
use crate::clients::LedgerClients;
use crate::commit::CommitExecutor;
use crate::config::ProvisioningConfig;
use crate::coordinator::{ProvisioningCoordinator, ProvisioningReport};
use crate::credentials::Credentials;
use crate::error::ProvisionError;
use crate::flow::{ProvisioningStage, ProvisioningStateMachine};
use crate::journal::{ProvisioningJournal, SharedJournal, StageEvent};
use crate::mirror::{DatastoreSet, MirrorReport, RecordMirror};
use crate::registry::ChainRegistry;
use crate::simulate::DryRunSimulator;
use crate::types::{BrokerData, BrokerId, Environment, OperationMode};
use serde::Serialize;
use std::sync::Arc;
use tracing::{error, info};
use uuid::Uuid;

/// Result of provisioning a broker on chain and mirroring its record.
#[derive(Debug, Clone, Serialize)]
pub struct OnboardingReport {
    pub attempt_id: Uuid,
    pub broker_id: BrokerId,
    pub ok: bool,
    pub stage: ProvisioningStage,
    pub provisioning: ProvisioningReport,
    /// Present only when the on-chain phase committed everywhere.
    pub mirror: Option<MirrorReport>,
}

/// Library entry point for every broker provisioning operation.
pub struct BrokerEngine {
    registry: Arc<ChainRegistry>,
    coordinator: ProvisioningCoordinator,
    auditor: ProvisioningAuditor,
    mirror: RecordMirror,
    journal: SharedJournal,
}

impl BrokerEngine {
    pub fn new(
        config: &ProvisioningConfig,
        clients: LedgerClients,
        credentials: Arc<Credentials>,
        stores: DatastoreSet,
    ) -> Result<Self, ProvisionError> {
        let registry = Arc::new(ChainRegistry::from_config(config)?);
        let journal = match config.journal_max_entries {
            Some(max) => ProvisioningJournal::with_retention(max).into_shared(),
            None => ProvisioningJournal::shared(),
        };
        let policy = config.policy.clone();

        let simulator = DryRunSimulator::new(clients.clone(), credentials.clone(), policy.clone());
        let executor = CommitExecutor::new(clients.clone(), credentials.clone(), policy.clone());
        let coordinator =
            ProvisioningCoordinator::new(registry.clone(), simulator, executor, journal.clone());
        let auditor = ProvisioningAuditor::new(registry.clone(), clients, credentials, policy);
        let mirror = RecordMirror::new(stores, journal.clone());

        info!(
            environments = ?registry.environments().map(Environment::name).collect::<Vec<_>>(),
            call_timeout_secs = config.policy.call_timeout().as_secs(),
            "broker engine ready"
        );

        Ok(Self {
            registry,
            coordinator,
            auditor,
            mirror,
            journal,
        })
    }

    pub fn registry(&self) -> &ChainRegistry {
        &self.registry
    }

    pub async fn provision_broker(
        &self,
        broker_id: &BrokerId,
        env: Environment,
    ) -> Result<ProvisioningReport, ProvisionError> {
        self.coordinator.provision(broker_id, env).await
    }

    pub async fn deprovision_broker(
        &self,
        broker_id: &BrokerId,
        env: Environment,
    ) -> Result<ProvisioningReport, ProvisionError> {
        self.coordinator.deprovision(broker_id, env).await
    }

    pub async fn check_provisioning_permissions(
        &self,
        env: Environment,
    ) -> Result<AuditReport, ProvisionError> {
        self.auditor.check_provisioning_permissions(env).await
    }

    pub async fn check_funding_balances(
        &self,
        env: Environment,
    ) -> Result<AuditReport, ProvisionError> {
        self.auditor.check_funding_balances(env).await
    }

    pub async fn mirror_broker_record(&self, data: &BrokerData) -> MirrorReport {
        self.mirror.mirror(data).await
    }

    pub async fn unmirror_broker_record(&self, broker_id: &BrokerId) -> MirrorReport {
        self.mirror.unmirror(broker_id).await
    }

    /// Provision on every registry, then mirror the record into the datastores.
    ///
    /// Mirroring only starts once every commit confirmed. A mirroring failure leaves
    /// the on-chain state in place; the report carries the transaction ids for
    /// reconciliation.
    pub async fn onboard_broker(
        &self,
        data: &BrokerData,
        env: Environment,
    ) -> Result<OnboardingReport, ProvisionError> {
        let mut machine = ProvisioningStateMachine::new(Uuid::new_v4());
        let attempt_id = machine.attempt_id();
        let broker_id = data.broker_id.clone();

        let provisioning = self
            .coordinator
            .run(&mut machine, &broker_id, env, OperationMode::Create)
            .await?;

        if machine.stage() != ProvisioningStage::Committed {
            return Ok(OnboardingReport {
                attempt_id,
                broker_id,
                ok: false,
                stage: machine.stage(),
                provisioning,
                mirror: None,
            });
        }

        self.advance(&mut machine, &broker_id, ProvisioningStage::Mirroring, "")
            .await?;
        let mirror = self.mirror.mirror_attempt(attempt_id, data).await;

        if mirror.ok {
            self.advance(&mut machine, &broker_id, ProvisioningStage::Done, &mirror.message)
                .await?;
            info!(
                attempt_id = %attempt_id,
                broker_id = %broker_id,
                broker_index = ?mirror.broker_index,
                "broker onboarded"
            );
        } else {
            self.advance(
                &mut machine,
                &broker_id,
                ProvisioningStage::MirrorRolledBack,
                &mirror.message,
            )
            .await?;
            error!(
                attempt_id = %attempt_id,
                broker_id = %broker_id,
                transaction_ids = ?provisioning.transaction_ids,
                message = %mirror.message,
                "record mirroring rolled back after on-chain provisioning"
            );
        }

        Ok(OnboardingReport {
            attempt_id,
            broker_id,
            ok: mirror.ok,
            stage: machine.stage(),
            provisioning,
            mirror: Some(mirror),
        })
    }

    /// Shared handle to the provisioning journal.
    pub fn journal(&self) -> SharedJournal {
        self.journal.clone()
    }

    async fn advance(
        &self,
        machine: &mut ProvisioningStateMachine,
        broker_id: &BrokerId,
        next: ProvisioningStage,
        detail: &str,
    ) -> Result<(), ProvisionError> {
        machine.transition(next)?;
        self.journal.lock().await.append_stage(
            machine.attempt_id(),
            Some(broker_id.as_str()),
            StageEvent::new(next.name(), detail),
        )?;
        Ok(())
    }
}
