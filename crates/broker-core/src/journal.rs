use crate::error::ProvisionError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::debug;
use uuid::Uuid;

/// Journal entry types.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum JournalEntryKind {
    Stage,
    Simulation,
    Commit,
    Compensation,
    Outcome,
}

impl JournalEntryKind {
    pub fn name(self) -> &'static str {
        match self {
            Self::Stage => "stage",
            Self::Simulation => "simulation",
            Self::Commit => "commit",
            Self::Compensation => "compensation",
            Self::Outcome => "outcome",
        }
    }
}

/// Hash-chained journal entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JournalEntry {
    pub entry_id: String,
    pub index: u64,
    pub attempt_id: Uuid,
    pub broker_id: Option<String>,
    pub kind: JournalEntryKind,
    pub timestamp: DateTime<Utc>,
    pub payload: Value,
    pub previous_hash: Option<String>,
    pub entry_hash: String,
}

/// Stage transition payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageEvent {
    pub stage: String,
    pub detail: String,
}

impl StageEvent {
    pub fn new(stage: impl Into<String>, detail: impl Into<String>) -> Self {
        Self {
            stage: stage.into(),
            detail: detail.into(),
        }
    }
}

/// Append-only record of every provisioning attempt.
///
/// Nothing is ever edited in place: stage transitions, per-target outcomes and
/// compensations each become a new entry chained to the previous one by BLAKE3.
///
/// An unbounded journal holds every entry for the life of the process. Long-lived
/// engines should either cap it with [`ProvisioningJournal::with_retention`] or export
/// entries periodically with [`ProvisioningJournal::drain`]. Evicted or drained entries
/// leave their hash behind as the anchor, so the retained suffix still verifies and
/// indices keep counting.
#[derive(Debug, Default, Clone)]
pub struct ProvisioningJournal {
    entries: VecDeque<JournalEntry>,
    next_index: u64,
    anchor_hash: Option<String>,
    max_entries: Option<usize>,
}

/// Journal shared by the coordinators and the saga.
pub type SharedJournal = Arc<Mutex<ProvisioningJournal>>;

impl ProvisioningJournal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Journal keeping at most `max_entries` entries; the oldest are evicted first.
    pub fn with_retention(max_entries: usize) -> Self {
        Self {
            max_entries: Some(max_entries.max(1)),
            ..Self::default()
        }
    }

    pub fn shared() -> SharedJournal {
        Arc::new(Mutex::new(Self::new()))
    }

    pub fn into_shared(self) -> SharedJournal {
        Arc::new(Mutex::new(self))
    }

    /// Rebuild a journal from exported entries and verify the chain.
    pub fn from_entries(entries: Vec<JournalEntry>) -> Result<Self, ProvisionError> {
        let next_index = entries.len() as u64;
        let journal = Self {
            entries: entries.into(),
            next_index,
            ..Self::default()
        };

        for (expected_index, entry) in journal.entries.iter().enumerate() {
            if entry.index != expected_index as u64 {
                return Err(ProvisionError::InvariantViolation(format!(
                    "journal index gap at position {} (found {})",
                    expected_index, entry.index
                )));
            }
        }

        if !journal.verify_chain() {
            return Err(ProvisionError::InvariantViolation(
                "journal hash-chain verification failed".to_string(),
            ));
        }

        Ok(journal)
    }

    /// Retained entries, oldest first.
    pub fn entries(&self) -> Vec<&JournalEntry> {
        self.entries.iter().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries_for(&self, attempt_id: Uuid) -> Vec<&JournalEntry> {
        self.entries
            .iter()
            .filter(|entry| entry.attempt_id == attempt_id)
            .collect()
    }

    pub fn append<T: Serialize>(
        &mut self,
        attempt_id: Uuid,
        broker_id: Option<&str>,
        kind: JournalEntryKind,
        payload: &T,
    ) -> Result<JournalEntry, ProvisionError> {
        let payload = serde_json::to_value(payload)
            .map_err(|e| ProvisionError::Serialization(e.to_string()))?;

        let index = self.next_index;
        let timestamp = Utc::now();
        let previous_hash = self
            .entries
            .back()
            .map(|entry| entry.entry_hash.clone())
            .or_else(|| self.anchor_hash.clone());
        let broker_id = broker_id.map(str::to_string);
        let entry_hash = compute_entry_hash(
            index,
            attempt_id,
            broker_id.as_deref(),
            kind,
            timestamp,
            &payload,
            previous_hash.as_deref(),
        );

        let entry = JournalEntry {
            entry_id: Uuid::new_v4().to_string(),
            index,
            attempt_id,
            broker_id,
            kind,
            timestamp,
            payload,
            previous_hash,
            entry_hash,
        };

        debug!(
            attempt_id = %entry.attempt_id,
            index = entry.index,
            kind = entry.kind.name(),
            payload = %entry.payload,
            "journal entry appended"
        );

        self.entries.push_back(entry.clone());
        self.next_index += 1;
        if let Some(max) = self.max_entries {
            while self.entries.len() > max {
                if let Some(evicted) = self.entries.pop_front() {
                    self.anchor_hash = Some(evicted.entry_hash);
                }
            }
        }
        Ok(entry)
    }

    /// Remove and return every retained entry, oldest first. Later entries keep
    /// chaining from the last drained one.
    pub fn drain(&mut self) -> Vec<JournalEntry> {
        if let Some(last) = self.entries.back() {
            self.anchor_hash = Some(last.entry_hash.clone());
        }
        self.entries.drain(..).collect()
    }

    pub fn append_stage(
        &mut self,
        attempt_id: Uuid,
        broker_id: Option<&str>,
        event: StageEvent,
    ) -> Result<JournalEntry, ProvisionError> {
        self.append(attempt_id, broker_id, JournalEntryKind::Stage, &event)
    }

    /// Verify the retained entries, starting from the anchor left by evictions.
    pub fn verify_chain(&self) -> bool {
        let mut previous_hash = self.anchor_hash.clone();
        let first_index = self.next_index - self.entries.len() as u64;
        for (offset, entry) in self.entries.iter().enumerate() {
            if entry.index != first_index + offset as u64 {
                return false;
            }
            let expected_hash = compute_entry_hash(
                entry.index,
                entry.attempt_id,
                entry.broker_id.as_deref(),
                entry.kind,
                entry.timestamp,
                &entry.payload,
                previous_hash.as_deref(),
            );
            if entry.entry_hash != expected_hash {
                return false;
            }
            if entry.previous_hash != previous_hash {
                return false;
            }
            previous_hash = Some(entry.entry_hash.clone());
        }
        true
    }
}

fn compute_entry_hash(
    index: u64,
    attempt_id: Uuid,
    broker_id: Option<&str>,
    kind: JournalEntryKind,
    timestamp: DateTime<Utc>,
    payload: &Value,
    previous_hash: Option<&str>,
) -> String {
    let material = serde_json::json!({
        "index": index,
        "attempt_id": attempt_id,
        "broker_id": broker_id,
        "kind": kind,
        "timestamp": timestamp,
        "payload": payload,
        "previous_hash": previous_hash,
    });

    let bytes = serde_json::to_vec(&material).unwrap_or_default();
    blake3::hash(&bytes).to_hex().to_string()
}
