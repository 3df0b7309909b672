use crate::error::ProvisionError;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Stages of one provisioning attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProvisioningStage {
    Simulating,
    Aborted,
    Committing,
    PartialFailure,
    Committed,
    Mirroring,
    MirrorRolledBack,
    Done,
}

impl ProvisioningStage {
    pub fn name(self) -> &'static str {
        match self {
            Self::Simulating => "simulating",
            Self::Aborted => "aborted",
            Self::Committing => "committing",
            Self::PartialFailure => "partial_failure",
            Self::Committed => "committed",
            Self::Mirroring => "mirroring",
            Self::MirrorRolledBack => "mirror_rolled_back",
            Self::Done => "done",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Aborted | Self::PartialFailure | Self::MirrorRolledBack | Self::Done
        )
    }

    pub fn can_transition_to(self, next: ProvisioningStage) -> bool {
        matches!(
            (self, next),
            (Self::Simulating, Self::Aborted)
                | (Self::Simulating, Self::Committing)
                | (Self::Committing, Self::PartialFailure)
                | (Self::Committing, Self::Committed)
                | (Self::Committed, Self::Mirroring)
                | (Self::Mirroring, Self::MirrorRolledBack)
                | (Self::Mirroring, Self::Done)
        )
    }
}

/// Enforces `Simulating -> (Aborted | Committing) -> (PartialFailure | Committed)
/// -> Mirroring -> (MirrorRolledBack | Done)`.
///
/// `Committed` ends a provision-only or deprovision attempt; onboarding carries on into
/// the mirroring stages.
#[derive(Debug, Clone)]
pub struct ProvisioningStateMachine {
    attempt_id: Uuid,
    stage: ProvisioningStage,
}

impl ProvisioningStateMachine {
    pub fn new(attempt_id: Uuid) -> Self {
        Self {
            attempt_id,
            stage: ProvisioningStage::Simulating,
        }
    }

    pub fn attempt_id(&self) -> Uuid {
        self.attempt_id
    }

    pub fn stage(&self) -> ProvisioningStage {
        self.stage
    }

    pub fn transition(&mut self, next: ProvisioningStage) -> Result<(), ProvisionError> {
        if !self.stage.can_transition_to(next) {
            return Err(ProvisionError::stage_violation(
                self.stage.name(),
                next.name(),
            ));
        }
        self.stage = next;
        Ok(())
    }
}
