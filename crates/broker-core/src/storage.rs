use crate::config::DatastoreConfig;
use crate::error::DatastoreError;
use crate::types::{BrokerId, BrokerRecord, FeeRateBps};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Row};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::{Mutex, OnceCell};

/// Position of a datastore in the mirroring saga.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DatastoreRole {
    Primary,
    Secondary,
    Tertiary,
}

impl DatastoreRole {
    /// Fixed saga write order.
    pub const WRITE_ORDER: [DatastoreRole; 3] = [Self::Primary, Self::Secondary, Self::Tertiary];

    pub fn name(self) -> &'static str {
        match self {
            Self::Primary => "primary",
            Self::Secondary => "secondary",
            Self::Tertiary => "tertiary",
        }
    }
}

impl fmt::Display for DatastoreRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A broker row as held by one datastore.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredBroker {
    pub record: BrokerRecord,
    /// Sequential index, present only in the datastore that assigns one.
    pub broker_index: Option<u64>,
    pub created_at: DateTime<Utc>,
}

/// One independently-owned relational datastore holding a copy of the broker record.
///
/// Uniqueness of `broker_id` is enforced locally by each store; there is no transaction
/// spanning stores.
#[async_trait]
pub trait BrokerStore: Send + Sync {
    fn role(&self) -> DatastoreRole;

    async fn insert(&self, record: &BrokerRecord) -> Result<StoredBroker, DatastoreError>;

    /// Remove the row; `Ok(false)` when no row existed.
    async fn delete(&self, broker_id: &BrokerId) -> Result<bool, DatastoreError>;

    async fn fetch(&self, broker_id: &BrokerId) -> Result<Option<StoredBroker>, DatastoreError>;
}

#[derive(Debug, Default)]
struct MemoryTable {
    rows: BTreeMap<BrokerId, StoredBroker>,
    next_index: u64,
}

/// In-process datastore.
///
/// The uniqueness check and the index allocation happen under one lock, so concurrent
/// inserts can never hand out the same index. `set_reachable(false)` simulates an outage:
/// every call then fails with a connection error.
#[derive(Debug)]
pub struct MemoryBrokerStore {
    role: DatastoreRole,
    assigns_index: bool,
    reachable: AtomicBool,
    table: Mutex<MemoryTable>,
}

impl MemoryBrokerStore {
    pub fn new(role: DatastoreRole, assigns_index: bool) -> Self {
        Self {
            role,
            assigns_index,
            reachable: AtomicBool::new(true),
            table: Mutex::new(MemoryTable {
                rows: BTreeMap::new(),
                next_index: 1,
            }),
        }
    }

    pub async fn len(&self) -> usize {
        self.table.lock().await.rows.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    pub fn set_reachable(&self, reachable: bool) {
        self.reachable.store(reachable, Ordering::SeqCst);
    }

    fn check_reachable(&self) -> Result<(), DatastoreError> {
        if self.reachable.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(DatastoreError::Connection {
                store: self.role.to_string(),
                message: "connection refused".to_string(),
            })
        }
    }
}

#[async_trait]
impl BrokerStore for MemoryBrokerStore {
    fn role(&self) -> DatastoreRole {
        self.role
    }

    async fn insert(&self, record: &BrokerRecord) -> Result<StoredBroker, DatastoreError> {
        self.check_reachable()?;
        let mut table = self.table.lock().await;
        if table.rows.contains_key(&record.broker_id) {
            return Err(DatastoreError::Duplicate {
                store: self.role.to_string(),
                broker_id: record.broker_id.to_string(),
            });
        }

        let broker_index = if self.assigns_index {
            let index = table.next_index;
            table.next_index += 1;
            Some(index)
        } else {
            None
        };

        let stored = StoredBroker {
            record: record.clone(),
            broker_index,
            created_at: Utc::now(),
        };
        table.rows.insert(record.broker_id.clone(), stored.clone());
        Ok(stored)
    }

    async fn delete(&self, broker_id: &BrokerId) -> Result<bool, DatastoreError> {
        self.check_reachable()?;
        Ok(self.table.lock().await.rows.remove(broker_id).is_some())
    }

    async fn fetch(&self, broker_id: &BrokerId) -> Result<Option<StoredBroker>, DatastoreError> {
        self.check_reachable()?;
        Ok(self.table.lock().await.rows.get(broker_id).cloned())
    }
}

/// PostgreSQL-backed datastore.
///
/// The pool connects lazily, so each datastore is connected on first use and a dead
/// store only fails the saga step that touches it. The broker index, when assigned,
/// comes from an identity column so allocation is atomic inside PostgreSQL.
#[derive(Debug)]
pub struct PostgresBrokerStore {
    role: DatastoreRole,
    table: String,
    assigns_index: bool,
    pool: PgPool,
    schema_ready: OnceCell<()>,
}

impl PostgresBrokerStore {
    pub fn connect_lazy(
        role: DatastoreRole,
        config: &DatastoreConfig,
    ) -> Result<Self, DatastoreError> {
        if !is_valid_table_name(&config.table) {
            return Err(DatastoreError::Query {
                store: role.to_string(),
                message: format!("invalid table name '{}'", config.table),
            });
        }

        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections.max(1))
            .connect_lazy(&config.url)
            .map_err(|e| DatastoreError::Connection {
                store: role.to_string(),
                message: e.to_string(),
            })?;

        Ok(Self {
            role,
            table: config.table.clone(),
            assigns_index: config.assigns_index,
            pool,
            schema_ready: OnceCell::new(),
        })
    }

    async fn ensure_schema(&self) -> Result<(), DatastoreError> {
        self.schema_ready
            .get_or_try_init(|| async {
                let index_column = if self.assigns_index {
                    "broker_index BIGINT GENERATED ALWAYS AS IDENTITY UNIQUE,"
                } else {
                    ""
                };
                let statement = format!(
                    r#"
                    CREATE TABLE IF NOT EXISTS {table} (
                        broker_id TEXT PRIMARY KEY,
                        broker_name TEXT NOT NULL,
                        maker_fee_rate INTEGER NOT NULL,
                        taker_fee_rate INTEGER NOT NULL,
                        broker_hash TEXT NOT NULL,
                        admin_account_id TEXT NULL,
                        {index_column}
                        created_at TIMESTAMPTZ NOT NULL DEFAULT now()
                    )
                    "#,
                    table = self.table,
                );
                sqlx::query(&statement)
                    .execute(&self.pool)
                    .await
                    .map_err(|e| self.classify(e))?;
                Ok::<(), DatastoreError>(())
            })
            .await
            .map(|_| ())
    }

    fn classify(&self, err: sqlx::Error) -> DatastoreError {
        let store = self.role.to_string();
        match &err {
            sqlx::Error::Io(_)
            | sqlx::Error::Tls(_)
            | sqlx::Error::PoolTimedOut
            | sqlx::Error::PoolClosed
            | sqlx::Error::Configuration(_) => DatastoreError::Connection {
                store,
                message: err.to_string(),
            },
            _ => DatastoreError::Query {
                store,
                message: err.to_string(),
            },
        }
    }

    fn decode_row(&self, row: &sqlx::postgres::PgRow) -> Result<StoredBroker, DatastoreError> {
        let decode = |column: &str, e: sqlx::Error| DatastoreError::Query {
            store: self.role.to_string(),
            message: format!("decode {column} failed: {e}"),
        };

        let broker_id: String = row
            .try_get("broker_id")
            .map_err(|e| decode("broker_id", e))?;
        let maker: i32 = row
            .try_get("maker_fee_rate")
            .map_err(|e| decode("maker_fee_rate", e))?;
        let taker: i32 = row
            .try_get("taker_fee_rate")
            .map_err(|e| decode("taker_fee_rate", e))?;
        let broker_index = if self.assigns_index {
            let index: i64 = row
                .try_get("broker_index")
                .map_err(|e| decode("broker_index", e))?;
            Some(u64::try_from(index).map_err(|_| DatastoreError::Query {
                store: self.role.to_string(),
                message: "negative broker_index in storage".to_string(),
            })?)
        } else {
            None
        };

        let invalid = |message: String| DatastoreError::Query {
            store: self.role.to_string(),
            message,
        };

        Ok(StoredBroker {
            record: BrokerRecord {
                broker_id: BrokerId::parse(broker_id).map_err(|e| invalid(e.to_string()))?,
                broker_name: row
                    .try_get("broker_name")
                    .map_err(|e| decode("broker_name", e))?,
                maker_fee_rate: fee_from_column(maker).map_err(invalid)?,
                taker_fee_rate: fee_from_column(taker).map_err(invalid)?,
                broker_hash: row
                    .try_get("broker_hash")
                    .map_err(|e| decode("broker_hash", e))?,
                admin_account_id: row
                    .try_get("admin_account_id")
                    .map_err(|e| decode("admin_account_id", e))?,
            },
            broker_index,
            created_at: row
                .try_get("created_at")
                .map_err(|e| decode("created_at", e))?,
        })
    }

    fn select_columns(&self) -> &'static str {
        if self.assigns_index {
            "broker_id, broker_name, maker_fee_rate, taker_fee_rate, broker_hash, admin_account_id, broker_index, created_at"
        } else {
            "broker_id, broker_name, maker_fee_rate, taker_fee_rate, broker_hash, admin_account_id, created_at"
        }
    }
}

#[async_trait]
impl BrokerStore for PostgresBrokerStore {
    fn role(&self) -> DatastoreRole {
        self.role
    }

    async fn insert(&self, record: &BrokerRecord) -> Result<StoredBroker, DatastoreError> {
        self.ensure_schema().await?;

        let statement = format!(
            r#"
            INSERT INTO {table} (
                broker_id,
                broker_name,
                maker_fee_rate,
                taker_fee_rate,
                broker_hash,
                admin_account_id
            )
            VALUES ($1, $2, $3, $4, $5, $6)
            RETURNING {columns}
            "#,
            table = self.table,
            columns = self.select_columns(),
        );

        let row = sqlx::query(&statement)
            .bind(record.broker_id.as_str())
            .bind(&record.broker_name)
            .bind(fee_to_column(record.maker_fee_rate))
            .bind(fee_to_column(record.taker_fee_rate))
            .bind(&record.broker_hash)
            .bind(&record.admin_account_id)
            .fetch_one(&self.pool)
            .await
            .map_err(|e| {
                let duplicate =
                    matches!(&e, sqlx::Error::Database(db) if db.is_unique_violation());
                if duplicate {
                    DatastoreError::Duplicate {
                        store: self.role.to_string(),
                        broker_id: record.broker_id.to_string(),
                    }
                } else {
                    self.classify(e)
                }
            })?;

        self.decode_row(&row)
    }

    async fn delete(&self, broker_id: &BrokerId) -> Result<bool, DatastoreError> {
        self.ensure_schema().await?;

        let statement = format!("DELETE FROM {} WHERE broker_id = $1", self.table);
        let result = sqlx::query(&statement)
            .bind(broker_id.as_str())
            .execute(&self.pool)
            .await
            .map_err(|e| self.classify(e))?;
        Ok(result.rows_affected() > 0)
    }

    async fn fetch(&self, broker_id: &BrokerId) -> Result<Option<StoredBroker>, DatastoreError> {
        self.ensure_schema().await?;

        let statement = format!(
            "SELECT {} FROM {} WHERE broker_id = $1",
            self.select_columns(),
            self.table
        );
        let row = sqlx::query(&statement)
            .bind(broker_id.as_str())
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| self.classify(e))?;

        row.map(|row| self.decode_row(&row)).transpose()
    }
}

fn fee_to_column(rate: FeeRateBps) -> i32 {
    // Bounded to 10_000 at construction.
    i32::try_from(rate.bps()).unwrap_or(i32::MAX)
}

fn fee_from_column(value: i32) -> Result<FeeRateBps, String> {
    let bps = u32::try_from(value).map_err(|_| format!("negative fee rate {value} in storage"))?;
    FeeRateBps::new(bps).map_err(|e| e.to_string())
}

/// Table names are interpolated into SQL, so only plain identifiers are accepted.
fn is_valid_table_name(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= 63
        && name
            .chars()
            .next()
            .map(|c| c.is_ascii_lowercase() || c == '_')
            .unwrap_or(false)
        && name
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
}
