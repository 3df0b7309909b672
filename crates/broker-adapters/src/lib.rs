#![deny(unsafe_code)]
//! Ledger clients for broker provisioning.
//!
//! `JsonRpcEvmClient` and `JsonRpcSolanaClient` talk to live nodes. `SandboxLedger`
//! keeps registry state in memory for rehearsals and tests.

pub mod evm_rpc;
pub mod rpc;
pub mod sandbox;
pub mod solana_rpc;

pub use evm_rpc::JsonRpcEvmClient;
pub use rpc::{ConfirmationPolicy, JsonRpcTransport};
pub use sandbox::{SandboxCommit, SandboxLedger};
pub use solana_rpc::JsonRpcSolanaClient;

use broker_core::clients::LedgerClients;
use broker_core::error::LedgerCallError;
use std::sync::Arc;
use std::time::Duration;

/// Client set that reaches every registry over JSON-RPC.
pub fn rpc_clients(
    request_timeout: Duration,
    evm_signer_url: Option<String>,
    confirmation: ConfirmationPolicy,
) -> Result<LedgerClients, LedgerCallError> {
    let evm = JsonRpcEvmClient::new(request_timeout, evm_signer_url, confirmation)?;
    let solana = JsonRpcSolanaClient::new(request_timeout, confirmation)?;
    Ok(LedgerClients::new(Arc::new(evm), Arc::new(solana)))
}
