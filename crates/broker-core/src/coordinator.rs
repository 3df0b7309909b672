//! Simulate-then-commit fan-out across every registry target of an environment.
//!
//! Creation uses a strict gate: one failed simulation anywhere means nothing is committed
//! anywhere. Deletion gates per target: a target commits iff its own simulation passed,
//! so a broker can still be removed from the registries that are reachable.

use crate::commit::CommitExecutor;
use crate::error::{CommitFailure, ProvisionError};
use crate::flow::{ProvisioningStage, ProvisioningStateMachine};
use crate::journal::{JournalEntryKind, SharedJournal, StageEvent};
use crate::registry::ChainRegistry;
use crate::simulate::{DryRunSimulator, SimulationOutcome};
use crate::types::{BrokerId, Environment, OperationMode, RegistryTarget};
use futures::future::join_all;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{error, info, warn};
use uuid::Uuid;

/// Result of one state-changing call as reported to the caller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CommitRecord {
    pub target: String,
    pub chain_id: String,
    pub ok: bool,
    pub transaction_id: Option<String>,
    pub failure: Option<CommitFailure>,
}

/// Aggregated result of a provisioning or de-provisioning attempt.
#[derive(Debug, Clone, Serialize)]
pub struct ProvisioningReport {
    pub attempt_id: Uuid,
    pub broker_id: BrokerId,
    pub environment: Environment,
    pub mode: OperationMode,
    pub ok: bool,
    pub stage: ProvisioningStage,
    /// Confirmed transaction ids keyed by target name.
    pub transaction_ids: BTreeMap<String, String>,
    /// Every failure reason, formatted `"{target}: {reason}"`.
    pub errors: Vec<String>,
    pub simulations: Vec<SimulationOutcome>,
    pub commits: Vec<CommitRecord>,
}

#[derive(Clone)]
pub struct ProvisioningCoordinator {
    registry: Arc<ChainRegistry>,
    simulator: DryRunSimulator,
    executor: CommitExecutor,
    journal: SharedJournal,
}

impl ProvisioningCoordinator {
    pub fn new(
        registry: Arc<ChainRegistry>,
        simulator: DryRunSimulator,
        executor: CommitExecutor,
        journal: SharedJournal,
    ) -> Self {
        Self {
            registry,
            simulator,
            executor,
            journal,
        }
    }

    pub fn journal(&self) -> &SharedJournal {
        &self.journal
    }

    /// Allow `broker_id` on every target of `env`, all or nothing.
    pub async fn provision(
        &self,
        broker_id: &BrokerId,
        env: Environment,
    ) -> Result<ProvisioningReport, ProvisionError> {
        let mut machine = ProvisioningStateMachine::new(Uuid::new_v4());
        self.run(&mut machine, broker_id, env, OperationMode::Create)
            .await
    }

    /// Deny `broker_id` on every target whose own simulation passes.
    pub async fn deprovision(
        &self,
        broker_id: &BrokerId,
        env: Environment,
    ) -> Result<ProvisioningReport, ProvisionError> {
        let mut machine = ProvisioningStateMachine::new(Uuid::new_v4());
        self.run(&mut machine, broker_id, env, OperationMode::Delete)
            .await
    }

    /// Run the simulate/commit phases, leaving `machine` in `Aborted`, `PartialFailure`
    /// or `Committed`.
    pub async fn run(
        &self,
        machine: &mut ProvisioningStateMachine,
        broker_id: &BrokerId,
        env: Environment,
        mode: OperationMode,
    ) -> Result<ProvisioningReport, ProvisionError> {
        let attempt_id = machine.attempt_id();
        let partition = self.registry.partition(env)?;
        let targets = self.registry.targets(env)?;

        info!(
            attempt_id = %attempt_id,
            broker_id = %broker_id,
            environment = %env,
            mode = mode.name(),
            targets = %partition.summary(),
            "simulating on all registry targets"
        );
        self.record_stage(
            machine,
            broker_id,
            format!("{} targets in {env}", partition.len()),
        )
        .await?;

        let simulations = join_all(
            targets
                .iter()
                .map(|target| self.simulator.simulate(target, broker_id, mode)),
        )
        .await;
        for outcome in &simulations {
            self.record(attempt_id, broker_id, JournalEntryKind::Simulation, outcome)
                .await?;
        }

        let mut errors: Vec<String> = simulations
            .iter()
            .filter(|outcome| !outcome.ok)
            .map(|outcome| {
                format!(
                    "{}: {}",
                    outcome.target,
                    outcome.reason().unwrap_or_default()
                )
            })
            .collect();

        let eligible: Vec<&RegistryTarget> = match mode {
            OperationMode::Create if errors.is_empty() => targets.iter().collect(),
            OperationMode::Create => Vec::new(),
            OperationMode::Delete => targets
                .iter()
                .zip(&simulations)
                .filter(|(_, outcome)| outcome.ok)
                .map(|(target, _)| target)
                .collect(),
        };

        let mut report = ProvisioningReport {
            attempt_id,
            broker_id: broker_id.clone(),
            environment: env,
            mode,
            ok: false,
            stage: machine.stage(),
            transaction_ids: BTreeMap::new(),
            errors: Vec::new(),
            simulations,
            commits: Vec::new(),
        };

        if eligible.is_empty() {
            warn!(
                attempt_id = %attempt_id,
                broker_id = %broker_id,
                errors = ?errors,
                "simulation gate closed, nothing committed"
            );
            self.advance(machine, broker_id, ProvisioningStage::Aborted, errors.join("; "))
                .await?;
            report.stage = machine.stage();
            report.errors = errors;
            self.record(attempt_id, broker_id, JournalEntryKind::Outcome, &report)
                .await?;
            return Ok(report);
        }

        self.advance(
            machine,
            broker_id,
            ProvisioningStage::Committing,
            format!("{} targets", eligible.len()),
        )
        .await?;

        let results = join_all(
            eligible
                .iter()
                .map(|target| self.executor.commit(target, broker_id, mode)),
        )
        .await;

        let mut commit_failed = false;
        let mut confirmed: BTreeMap<String, String> = BTreeMap::new();
        for (target, result) in eligible.iter().zip(results) {
            let record = match result {
                Ok(outcome) => {
                    confirmed.insert(outcome.target.clone(), outcome.transaction_id.clone());
                    CommitRecord {
                        target: outcome.target,
                        chain_id: outcome.chain_id,
                        ok: true,
                        transaction_id: Some(outcome.transaction_id),
                        failure: None,
                    }
                }
                Err(failure) => {
                    commit_failed = true;
                    errors.push(format!("{}: {failure}", target.name));
                    CommitRecord {
                        target: target.name.clone(),
                        chain_id: target.chain_id.clone(),
                        ok: false,
                        transaction_id: None,
                        failure: Some(failure),
                    }
                }
            };
            self.record(attempt_id, broker_id, JournalEntryKind::Commit, &record)
                .await?;
            report.commits.push(record);
        }

        let next = if commit_failed {
            error!(
                attempt_id = %attempt_id,
                broker_id = %broker_id,
                transaction_ids = ?confirmed,
                errors = ?errors,
                "commit phase partially failed, manual reconciliation required"
            );
            ProvisioningStage::PartialFailure
        } else {
            info!(
                attempt_id = %attempt_id,
                broker_id = %broker_id,
                transaction_ids = ?confirmed,
                "all commits confirmed"
            );
            ProvisioningStage::Committed
        };
        self.advance(machine, broker_id, next, errors.join("; "))
            .await?;

        // A failed creation carries no id map; confirmed ids stay on the commit records.
        report.ok = match mode {
            OperationMode::Create => errors.is_empty(),
            OperationMode::Delete => !confirmed.is_empty(),
        };
        if report.ok || mode == OperationMode::Delete {
            report.transaction_ids = confirmed;
        }
        report.stage = machine.stage();
        report.errors = errors;
        self.record(attempt_id, broker_id, JournalEntryKind::Outcome, &report)
            .await?;
        Ok(report)
    }

    async fn advance(
        &self,
        machine: &mut ProvisioningStateMachine,
        broker_id: &BrokerId,
        next: ProvisioningStage,
        detail: String,
    ) -> Result<(), ProvisionError> {
        machine.transition(next)?;
        self.record_stage(machine, broker_id, detail).await
    }

    async fn record_stage(
        &self,
        machine: &ProvisioningStateMachine,
        broker_id: &BrokerId,
        detail: String,
    ) -> Result<(), ProvisionError> {
        self.journal.lock().await.append_stage(
            machine.attempt_id(),
            Some(broker_id.as_str()),
            StageEvent::new(machine.stage().name(), detail),
        )?;
        Ok(())
    }

    async fn record<T: Serialize>(
        &self,
        attempt_id: Uuid,
        broker_id: &BrokerId,
        kind: JournalEntryKind,
        payload: &T,
    ) -> Result<(), ProvisionError> {
        self.journal
            .lock()
            .await
            .append(attempt_id, Some(broker_id.as_str()), kind, payload)?;
        Ok(())
    }
}
