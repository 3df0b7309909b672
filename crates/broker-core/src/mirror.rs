//! Saga writing the broker record into the three datastores.
//!
//! Rows are inserted primary -> secondary -> tertiary. When a step fails, every earlier
//! row is deleted again in reverse order. Each compensation is attempted on its own and
//! a failed compensation never hides the original failure.

use crate::config::DatastoresConfig;
use crate::error::{DatastoreError, ProvisionError};
use crate::journal::{JournalEntryKind, SharedJournal};
use crate::storage::{BrokerStore, DatastoreRole, MemoryBrokerStore, PostgresBrokerStore};
use crate::types::{BrokerData, BrokerId, BrokerRecord};
use serde::Serialize;
use std::sync::Arc;
use tracing::{error, info, warn};
use uuid::Uuid;

/// The three mirrored datastores.
#[derive(Clone)]
pub struct DatastoreSet {
    pub primary: Arc<dyn BrokerStore>,
    pub secondary: Arc<dyn BrokerStore>,
    pub tertiary: Arc<dyn BrokerStore>,
}

impl DatastoreSet {
    pub fn new(
        primary: Arc<dyn BrokerStore>,
        secondary: Arc<dyn BrokerStore>,
        tertiary: Arc<dyn BrokerStore>,
    ) -> Self {
        Self {
            primary,
            secondary,
            tertiary,
        }
    }

    /// In-process stores; the secondary store assigns the broker index.
    pub fn in_memory() -> Self {
        Self::new(
            Arc::new(MemoryBrokerStore::new(DatastoreRole::Primary, false)),
            Arc::new(MemoryBrokerStore::new(DatastoreRole::Secondary, true)),
            Arc::new(MemoryBrokerStore::new(DatastoreRole::Tertiary, false)),
        )
    }

    /// PostgreSQL stores with lazily connected pools.
    pub fn connect_postgres(config: &DatastoresConfig) -> Result<Self, ProvisionError> {
        let indexing = DatastoreRole::WRITE_ORDER
            .iter()
            .filter(|role| config.get(**role).assigns_index)
            .count();
        if indexing > 1 {
            return Err(ProvisionError::Configuration(
                "at most one datastore may assign the broker index".to_string(),
            ));
        }

        let connect = |role: DatastoreRole| -> Result<Arc<dyn BrokerStore>, ProvisionError> {
            let store = PostgresBrokerStore::connect_lazy(role, config.get(role))
                .map_err(|e| ProvisionError::Configuration(e.to_string()))?;
            Ok(Arc::new(store))
        };

        Ok(Self::new(
            connect(DatastoreRole::Primary)?,
            connect(DatastoreRole::Secondary)?,
            connect(DatastoreRole::Tertiary)?,
        ))
    }

    pub fn get(&self, role: DatastoreRole) -> &Arc<dyn BrokerStore> {
        match role {
            DatastoreRole::Primary => &self.primary,
            DatastoreRole::Secondary => &self.secondary,
            DatastoreRole::Tertiary => &self.tertiary,
        }
    }
}

/// One successful row operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MirrorStep {
    pub store: DatastoreRole,
    pub broker_index: Option<u64>,
    pub detail: String,
}

/// Undo of an earlier saga write.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CompensationAction {
    pub store: DatastoreRole,
    pub attempted: bool,
    pub success: bool,
    pub detail: String,
}

/// The failure that stopped the saga.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MirrorFailure {
    pub store: DatastoreRole,
    pub error: DatastoreError,
}

#[derive(Debug, Clone, Serialize)]
pub struct MirrorReport {
    pub attempt_id: Uuid,
    pub broker_id: BrokerId,
    pub ok: bool,
    pub message: String,
    /// Index assigned by the indexing datastore, when the write reached it.
    pub broker_index: Option<u64>,
    pub written: Vec<MirrorStep>,
    pub removed: Vec<MirrorStep>,
    pub compensations: Vec<CompensationAction>,
    pub failure: Option<MirrorFailure>,
    /// Every datastore error, formatted `"{store}: {error}"`.
    pub errors: Vec<String>,
}

impl MirrorReport {
    fn new(attempt_id: Uuid, broker_id: BrokerId) -> Self {
        Self {
            attempt_id,
            broker_id,
            ok: false,
            message: String::new(),
            broker_index: None,
            written: Vec::new(),
            removed: Vec::new(),
            compensations: Vec::new(),
            failure: None,
            errors: Vec::new(),
        }
    }

    /// Whether every compensation that ran succeeded.
    pub fn compensation_complete(&self) -> bool {
        self.compensations.iter().all(|action| action.success)
    }
}

#[derive(Clone)]
pub struct RecordMirror {
    stores: DatastoreSet,
    journal: SharedJournal,
}

impl RecordMirror {
    pub fn new(stores: DatastoreSet, journal: SharedJournal) -> Self {
        Self { stores, journal }
    }

    pub fn stores(&self) -> &DatastoreSet {
        &self.stores
    }

    pub async fn mirror(&self, data: &BrokerData) -> MirrorReport {
        self.mirror_attempt(Uuid::new_v4(), data).await
    }

    /// Mirror `data` under an existing attempt id so the journal groups the saga with
    /// the on-chain phase that preceded it.
    pub async fn mirror_attempt(&self, attempt_id: Uuid, data: &BrokerData) -> MirrorReport {
        let record = BrokerRecord::from_data(data);
        let mut report = MirrorReport::new(attempt_id, record.broker_id.clone());
        let mut written: Vec<DatastoreRole> = Vec::new();

        for role in DatastoreRole::WRITE_ORDER {
            match self.stores.get(role).insert(&record).await {
                Ok(stored) => {
                    if stored.broker_index.is_some() {
                        report.broker_index = stored.broker_index;
                    }
                    report.written.push(MirrorStep {
                        store: role,
                        broker_index: stored.broker_index,
                        detail: "row inserted".to_string(),
                    });
                    written.push(role);
                }
                Err(err) => {
                    error!(
                        attempt_id = %attempt_id,
                        broker_id = %record.broker_id,
                        store = %role,
                        error = %err,
                        "datastore write failed, compensating earlier writes"
                    );
                    report.errors.push(format!("{role}: {err}"));
                    report.failure = Some(MirrorFailure {
                        store: role,
                        error: err,
                    });
                    break;
                }
            }
        }

        if let Some(failure) = report.failure.clone() {
            report.compensations = self
                .run_compensating_actions(attempt_id, &record.broker_id, &written)
                .await;
            report.broker_index = None;
            report.message = if report.compensation_complete() {
                format!(
                    "{} write failed: {}; rolled back {} earlier write(s)",
                    failure.store,
                    failure.error,
                    report.compensations.len()
                )
            } else {
                format!(
                    "{} write failed: {}; rollback incomplete, manual cleanup required",
                    failure.store, failure.error
                )
            };
        } else {
            report.ok = true;
            report.message = "broker record mirrored to primary, secondary and tertiary".to_string();
            info!(
                attempt_id = %attempt_id,
                broker_id = %record.broker_id,
                broker_index = ?report.broker_index,
                "broker record mirrored"
            );
        }

        self.append_journal(
            attempt_id,
            &record.broker_id,
            JournalEntryKind::Outcome,
            &report,
        )
        .await;
        report
    }

    /// Delete the broker row from every datastore, tertiary first.
    ///
    /// Each store is attempted independently; a missing row counts as removed.
    pub async fn unmirror(&self, broker_id: &BrokerId) -> MirrorReport {
        let attempt_id = Uuid::new_v4();
        let mut report = MirrorReport::new(attempt_id, broker_id.clone());

        for role in DatastoreRole::WRITE_ORDER.iter().rev().copied() {
            match self.stores.get(role).delete(broker_id).await {
                Ok(existed) => report.removed.push(MirrorStep {
                    store: role,
                    broker_index: None,
                    detail: if existed {
                        "row deleted".to_string()
                    } else {
                        "row already absent".to_string()
                    },
                }),
                Err(err) => {
                    error!(
                        attempt_id = %attempt_id,
                        broker_id = %broker_id,
                        store = %role,
                        error = %err,
                        "datastore delete failed"
                    );
                    report.errors.push(format!("{role}: {err}"));
                    if report.failure.is_none() {
                        report.failure = Some(MirrorFailure {
                            store: role,
                            error: err,
                        });
                    }
                }
            }
        }

        report.ok = report.errors.is_empty();
        report.message = if report.ok {
            "broker record removed from every datastore".to_string()
        } else {
            format!(
                "broker record removal failed on {} datastore(s)",
                report.errors.len()
            )
        };

        self.append_journal(attempt_id, broker_id, JournalEntryKind::Outcome, &report)
            .await;
        report
    }

    async fn run_compensating_actions(
        &self,
        attempt_id: Uuid,
        broker_id: &BrokerId,
        written: &[DatastoreRole],
    ) -> Vec<CompensationAction> {
        let mut plan = Vec::new();

        for role in written.iter().rev().copied() {
            let action = match self.stores.get(role).delete(broker_id).await {
                Ok(true) => CompensationAction {
                    store: role,
                    attempted: true,
                    success: true,
                    detail: "row deleted".to_string(),
                },
                Ok(false) => CompensationAction {
                    store: role,
                    attempted: true,
                    success: true,
                    detail: "row already absent".to_string(),
                },
                Err(err) => {
                    error!(
                        attempt_id = %attempt_id,
                        broker_id = %broker_id,
                        store = %role,
                        error = %err,
                        "compensation failed, row left behind"
                    );
                    CompensationAction {
                        store: role,
                        attempted: true,
                        success: false,
                        detail: format!("compensation failed: {err}"),
                    }
                }
            };

            self.append_journal(
                attempt_id,
                broker_id,
                JournalEntryKind::Compensation,
                &action,
            )
            .await;
            plan.push(action);
        }

        plan
    }

    async fn append_journal<T: Serialize>(
        &self,
        attempt_id: Uuid,
        broker_id: &BrokerId,
        kind: JournalEntryKind,
        payload: &T,
    ) {
        if let Err(err) =
            self.journal
                .lock()
                .await
                .append(attempt_id, Some(broker_id.as_str()), kind, payload)
        {
            warn!(attempt_id = %attempt_id, error = %err, "journal append failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::journal::ProvisioningJournal;
    use crate::storage::{MemoryBrokerStore, StoredBroker};
    use crate::types::FeeRateBps;

    struct Fixture {
        primary: Arc<MemoryBrokerStore>,
        secondary: Arc<MemoryBrokerStore>,
        tertiary: Arc<MemoryBrokerStore>,
        mirror: RecordMirror,
    }

    fn fixture() -> Fixture {
        let primary = Arc::new(MemoryBrokerStore::new(DatastoreRole::Primary, false));
        let secondary = Arc::new(MemoryBrokerStore::new(DatastoreRole::Secondary, true));
        let tertiary = Arc::new(MemoryBrokerStore::new(DatastoreRole::Tertiary, false));
        let mirror = RecordMirror::new(
            DatastoreSet::new(primary.clone(), secondary.clone(), tertiary.clone()),
            ProvisioningJournal::shared(),
        );
        Fixture {
            primary,
            secondary,
            tertiary,
            mirror,
        }
    }

    fn data(id: &str) -> BrokerData {
        BrokerData {
            broker_id: BrokerId::parse(id).unwrap(),
            broker_name: "Acme DEX".to_string(),
            maker_fee_rate: FeeRateBps::new(3).unwrap(),
            taker_fee_rate: FeeRateBps::new(6).unwrap(),
            admin_account_id: Some("0xadmin".to_string()),
        }
    }

    #[tokio::test]
    async fn writes_all_three_rows_and_reports_index() {
        let f = fixture();
        let report = f.mirror.mirror(&data("acme-dex")).await;

        assert!(report.ok, "{}", report.message);
        assert_eq!(report.written.len(), 3);
        assert_eq!(report.broker_index, Some(1));
        assert!(report.compensations.is_empty());
        for store in [&f.primary, &f.secondary, &f.tertiary] {
            assert_eq!(store.len().await, 1);
        }
    }

    #[tokio::test]
    async fn secondary_failure_removes_primary_row() {
        let f = fixture();
        f.secondary.set_reachable(false);
        let id = BrokerId::parse("acme-dex").unwrap();

        let report = f.mirror.mirror(&data("acme-dex")).await;
        assert!(!report.ok);
        assert_eq!(report.failure.unwrap().store, DatastoreRole::Secondary);
        assert_eq!(report.compensations.len(), 1);
        assert_eq!(report.compensations[0].store, DatastoreRole::Primary);
        assert!(f.primary.fetch(&id).await.unwrap().is_none());
        assert!(f.tertiary.is_empty().await);
    }

    /// Inserts succeed, deletes always fail.
    struct UndeletableStore {
        inner: MemoryBrokerStore,
    }

    #[async_trait::async_trait]
    impl BrokerStore for UndeletableStore {
        fn role(&self) -> DatastoreRole {
            self.inner.role()
        }

        async fn insert(&self, record: &BrokerRecord) -> Result<StoredBroker, DatastoreError> {
            self.inner.insert(record).await
        }

        async fn delete(&self, _broker_id: &BrokerId) -> Result<bool, DatastoreError> {
            Err(DatastoreError::Query {
                store: self.inner.role().to_string(),
                message: "permission denied for table broker".to_string(),
            })
        }

        async fn fetch(&self, broker_id: &BrokerId) -> Result<Option<StoredBroker>, DatastoreError> {
            self.inner.fetch(broker_id).await
        }
    }

    #[tokio::test]
    async fn tertiary_duplicate_rolls_back_secondary_then_primary() {
        let f = fixture();
        f.tertiary.insert(&BrokerRecord::from_data(&data("acme-dex"))).await.unwrap();
        let id = BrokerId::parse("acme-dex").unwrap();

        let report = f.mirror.mirror(&data("acme-dex")).await;
        assert!(!report.ok);
        let failure = report.failure.clone().unwrap();
        assert_eq!(failure.store, DatastoreRole::Tertiary);
        assert!(matches!(failure.error, DatastoreError::Duplicate { .. }));
        assert_eq!(
            report
                .compensations
                .iter()
                .map(|action| action.store)
                .collect::<Vec<_>>(),
            vec![DatastoreRole::Secondary, DatastoreRole::Primary]
        );
        assert!(report.broker_index.is_none());
        assert!(f.primary.fetch(&id).await.unwrap().is_none());
        assert!(f.secondary.fetch(&id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn compensation_failure_is_reported_without_masking_the_cause() {
        let primary = Arc::new(MemoryBrokerStore::new(DatastoreRole::Primary, false));
        let secondary = Arc::new(UndeletableStore {
            inner: MemoryBrokerStore::new(DatastoreRole::Secondary, true),
        });
        let tertiary = Arc::new(MemoryBrokerStore::new(DatastoreRole::Tertiary, false));
        tertiary.set_reachable(false);
        let journal = ProvisioningJournal::shared();
        let mirror = RecordMirror::new(
            DatastoreSet::new(primary.clone(), secondary, tertiary),
            journal.clone(),
        );

        let report = mirror.mirror(&data("acme-dex")).await;
        assert!(!report.ok);
        let failure = report.failure.clone().unwrap();
        assert_eq!(failure.store, DatastoreRole::Tertiary);
        assert!(matches!(failure.error, DatastoreError::Connection { .. }));

        assert!(!report.compensation_complete());
        assert_eq!(report.compensations.len(), 2);
        assert!(!report.compensations[0].success);
        assert!(report.compensations[1].success);
        assert!(report.message.contains("rollback incomplete"));
        assert!(primary.is_empty().await);

        let journal = journal.lock().await;
        let compensations = journal
            .entries()
            .iter()
            .filter(|entry| entry.kind == JournalEntryKind::Compensation)
            .count();
        assert_eq!(compensations, 2);
    }

    #[tokio::test]
    async fn unmirror_treats_missing_rows_as_removed() {
        let f = fixture();
        f.mirror.mirror(&data("acme-dex")).await;
        let id = BrokerId::parse("acme-dex").unwrap();
        f.tertiary.delete(&id).await.unwrap();

        let report = f.mirror.unmirror(&id).await;
        assert!(report.ok);
        assert_eq!(report.removed.len(), 3);
        assert_eq!(report.removed[0].store, DatastoreRole::Tertiary);
        assert_eq!(report.removed[0].detail, "row already absent");
        assert!(f.primary.is_empty().await);
    }

    #[tokio::test]
    async fn unmirror_attempts_every_store_independently() {
        let f = fixture();
        f.mirror.mirror(&data("acme-dex")).await;
        f.secondary.set_reachable(false);
        let id = BrokerId::parse("acme-dex").unwrap();

        let report = f.mirror.unmirror(&id).await;
        assert!(!report.ok);
        assert_eq!(report.errors.len(), 1);
        assert!(f.primary.is_empty().await);
        assert!(f.tertiary.is_empty().await);
    }
}
