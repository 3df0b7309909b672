use serde::Serialize;
use thiserror::Error;

/// Exceptional provisioning errors.
///
/// Per-target simulation, commit and datastore failures are reported as data inside
/// the operation reports; only the conditions below abort an operation outright.
#[derive(Debug, Error)]
pub enum ProvisionError {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Invalid broker id '{value}': {reason}")]
    InvalidBrokerId { value: String, reason: String },

    #[error("Invalid fee rate: {0}")]
    InvalidFeeRate(String),

    #[error("Invariant violation: {0}")]
    InvariantViolation(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl ProvisionError {
    pub fn stage_violation(from: &str, to: &str) -> Self {
        Self::InvariantViolation(format!(
            "provisioning stage transition not allowed: '{}' -> '{}'",
            from, to
        ))
    }
}

/// Errors raised by a ledger client while talking to a chain or program.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum LedgerCallError {
    #[error("transport failure: {0}")]
    Transport(String),

    #[error("rpc error {code}: {message}")]
    Rpc { code: i64, message: String },

    #[error("unexpected response: {0}")]
    Decode(String),

    #[error("transaction {tx_id} reverted")]
    Reverted { tx_id: String },

    #[error("transaction {tx_id} was not confirmed")]
    Unconfirmed { tx_id: String },
}

/// Reason a dry-run simulation did not pass.
#[derive(Debug, Clone, Error, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SimulationFailure {
    #[error("already allowed")]
    AlreadyAllowed,

    #[error("not allowed")]
    NotAllowed,

    #[error("insufficient balance: required {required} {unit}, available {available} {unit}")]
    InsufficientBalance {
        required: u128,
        available: u128,
        unit: &'static str,
    },

    #[error("operator does not hold {role}")]
    MissingRole { role: String },

    #[error("authority check failed: {0}")]
    AuthorityCheckFailed(String),

    #[error("timed out after {after_secs}s")]
    Timeout { after_secs: u64 },

    #[error("ledger error: {0}")]
    Ledger(String),
}

impl From<LedgerCallError> for SimulationFailure {
    fn from(err: LedgerCallError) -> Self {
        Self::Ledger(err.to_string())
    }
}

/// Reason a state-changing call did not confirm.
///
/// A commit failure happens after every precondition was verified, so it is never retried
/// automatically: a retry could double-submit the state change.
#[derive(Debug, Clone, Error, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CommitFailure {
    #[error("timed out after {after_secs}s, outcome unknown")]
    Timeout { after_secs: u64 },

    #[error("transaction {tx_id} reverted")]
    Reverted { tx_id: String },

    #[error("transaction {tx_id} was not confirmed")]
    Unconfirmed { tx_id: String },

    #[error("ledger error: {0}")]
    Ledger(String),
}

impl From<LedgerCallError> for CommitFailure {
    fn from(err: LedgerCallError) -> Self {
        match err {
            LedgerCallError::Reverted { tx_id } => Self::Reverted { tx_id },
            LedgerCallError::Unconfirmed { tx_id } => Self::Unconfirmed { tx_id },
            other => Self::Ledger(other.to_string()),
        }
    }
}

/// Datastore write/delete failures observed by the mirroring saga.
#[derive(Debug, Clone, Error, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DatastoreError {
    #[error("broker '{broker_id}' already exists in {store}")]
    Duplicate { store: String, broker_id: String },

    #[error("{store} connection failed: {message}")]
    Connection { store: String, message: String },

    #[error("{store} query failed: {message}")]
    Query { store: String, message: String },
}
