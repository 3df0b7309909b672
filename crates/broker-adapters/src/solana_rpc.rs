//! Solana program client over the Solana JSON-RPC API.
//!
//! Transactions use the legacy message format with a single signer, the operator.

use crate::rpc::{ConfirmationPolicy, JsonRpcTransport};
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use broker_core::clients::{SolanaRegistryClient, SolanaSimulation};
use broker_core::credentials::SolanaCredential;
use broker_core::derivation::{decode_broker_account, BrokerAccountState, SetBrokerInstruction};
use broker_core::error::LedgerCallError;
use broker_core::types::{RegistryTarget, SolanaPubkey};
use serde::Deserialize;
use serde_json::{json, Value};
use std::time::Duration;
use tracing::{debug, info};

const COMMITMENT: &str = "confirmed";

#[derive(Debug, Deserialize)]
struct RpcValue<T> {
    value: T,
}

#[derive(Debug, Deserialize)]
struct AccountInfo {
    data: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct LatestBlockhash {
    blockhash: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SimulationValue {
    #[serde(default)]
    err: Option<Value>,
    #[serde(default)]
    logs: Option<Vec<String>>,
    #[serde(default)]
    units_consumed: Option<u64>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SignatureStatus {
    #[serde(default)]
    err: Option<Value>,
    #[serde(default)]
    confirmation_status: Option<String>,
}

#[derive(Debug)]
pub struct JsonRpcSolanaClient {
    transport: JsonRpcTransport,
    confirmation: ConfirmationPolicy,
}

impl JsonRpcSolanaClient {
    pub fn new(
        request_timeout: Duration,
        confirmation: ConfirmationPolicy,
    ) -> Result<Self, LedgerCallError> {
        Ok(Self {
            transport: JsonRpcTransport::new(request_timeout)?,
            confirmation,
        })
    }

    async fn account_data(
        &self,
        target: &RegistryTarget,
        address: &SolanaPubkey,
    ) -> Result<Option<Vec<u8>>, LedgerCallError> {
        let response: RpcValue<Option<AccountInfo>> = self
            .transport
            .call(
                &target.rpc_url,
                "getAccountInfo",
                json!([address.to_string(), { "encoding": "base64", "commitment": COMMITMENT }]),
            )
            .await?;

        match response.value {
            None => Ok(None),
            Some(info) => {
                let encoded = info.data.first().ok_or_else(|| {
                    LedgerCallError::Decode(format!("account {address} has no data field"))
                })?;
                BASE64
                    .decode(encoded)
                    .map(Some)
                    .map_err(|e| LedgerCallError::Decode(format!("account {address}: {e}")))
            }
        }
    }

    async fn signed_transaction(
        &self,
        target: &RegistryTarget,
        instruction: &SetBrokerInstruction,
        signer: &SolanaCredential,
    ) -> Result<(String, String), LedgerCallError> {
        let latest: RpcValue<LatestBlockhash> = self
            .transport
            .call(
                &target.rpc_url,
                "getLatestBlockhash",
                json!([{ "commitment": COMMITMENT }]),
            )
            .await?;
        let blockhash: SolanaPubkey = latest
            .value
            .blockhash
            .parse()
            .map_err(|e| LedgerCallError::Decode(format!("blockhash: {e}")))?;

        let message = encode_set_broker_message(instruction, blockhash.0);
        let signature = signer.sign(&message);
        let transaction = encode_transaction(&message, &signature);
        Ok((
            BASE64.encode(transaction),
            bs58::encode(signature).into_string(),
        ))
    }

    async fn wait_for_signature(
        &self,
        target: &RegistryTarget,
        signature: &str,
    ) -> Result<String, LedgerCallError> {
        for _ in 0..self.confirmation.max_polls {
            let statuses: RpcValue<Vec<Option<SignatureStatus>>> = self
                .transport
                .call(
                    &target.rpc_url,
                    "getSignatureStatuses",
                    json!([[signature], { "searchTransactionHistory": true }]),
                )
                .await?;

            if let Some(Some(status)) = statuses.value.into_iter().next() {
                if status.err.is_some() {
                    return Err(LedgerCallError::Reverted {
                        tx_id: signature.to_string(),
                    });
                }
                if matches!(
                    status.confirmation_status.as_deref(),
                    Some("confirmed") | Some("finalized")
                ) {
                    return Ok(signature.to_string());
                }
            }
            tokio::time::sleep(self.confirmation.poll_interval).await;
        }

        Err(LedgerCallError::Unconfirmed {
            tx_id: signature.to_string(),
        })
    }
}

#[async_trait]
impl SolanaRegistryClient for JsonRpcSolanaClient {
    async fn broker_account(
        &self,
        target: &RegistryTarget,
        address: &SolanaPubkey,
    ) -> Result<Option<BrokerAccountState>, LedgerCallError> {
        match self.account_data(target, address).await? {
            None => Ok(None),
            Some(data) => decode_broker_account(&data)
                .map(Some)
                .map_err(LedgerCallError::Decode),
        }
    }

    async fn account_exists(
        &self,
        target: &RegistryTarget,
        address: &SolanaPubkey,
    ) -> Result<bool, LedgerCallError> {
        Ok(self.account_data(target, address).await?.is_some())
    }

    async fn lamports(
        &self,
        target: &RegistryTarget,
        account: &SolanaPubkey,
    ) -> Result<u64, LedgerCallError> {
        let response: RpcValue<u64> = self
            .transport
            .call(
                &target.rpc_url,
                "getBalance",
                json!([account.to_string(), { "commitment": COMMITMENT }]),
            )
            .await?;
        Ok(response.value)
    }

    async fn simulate_set_broker(
        &self,
        target: &RegistryTarget,
        instruction: &SetBrokerInstruction,
        signer: &SolanaCredential,
    ) -> Result<SolanaSimulation, LedgerCallError> {
        let (transaction, _) = self.signed_transaction(target, instruction, signer).await?;
        let response: RpcValue<SimulationValue> = self
            .transport
            .call(
                &target.rpc_url,
                "simulateTransaction",
                json!([transaction, {
                    "encoding": "base64",
                    "sigVerify": false,
                    "replaceRecentBlockhash": true,
                    "commitment": COMMITMENT,
                }]),
            )
            .await?;

        let value = response.value;
        let error = value.err.filter(|err| !err.is_null()).map(|err| {
            match value.logs.as_ref().and_then(|logs| logs.last()) {
                Some(last) => format!("{err} ({last})"),
                None => err.to_string(),
            }
        });
        debug!(
            registry = %target.name,
            units = ?value.units_consumed,
            error = ?error,
            "set_broker simulated"
        );
        Ok(SolanaSimulation {
            units_consumed: value.units_consumed,
            error,
        })
    }

    async fn submit_set_broker(
        &self,
        target: &RegistryTarget,
        instruction: &SetBrokerInstruction,
        signer: &SolanaCredential,
    ) -> Result<String, LedgerCallError> {
        let (transaction, signature) =
            self.signed_transaction(target, instruction, signer).await?;
        let returned: String = self
            .transport
            .call(
                &target.rpc_url,
                "sendTransaction",
                json!([transaction, { "encoding": "base64", "preflightCommitment": COMMITMENT }]),
            )
            .await?;
        if returned != signature {
            return Err(LedgerCallError::Decode(format!(
                "node returned signature {returned}, expected {signature}"
            )));
        }
        info!(registry = %target.name, signature = %signature, "set_broker submitted");

        self.wait_for_signature(target, &signature).await
    }
}

/// Legacy message for one `set_broker` instruction.
///
/// Account order: operator (signer, writable), broker account (writable), manager role
/// account, system program, program id (all read-only).
pub fn encode_set_broker_message(instruction: &SetBrokerInstruction, recent_blockhash: [u8; 32]) -> Vec<u8> {
    let keys = [
        instruction.operator,
        instruction.broker_account,
        instruction.manager_role_account,
        SolanaPubkey::SYSTEM_PROGRAM,
        instruction.program_id,
    ];

    let mut message = vec![1u8, 0, 3];
    push_short_vec_len(keys.len(), &mut message);
    for key in &keys {
        message.extend_from_slice(key.as_bytes());
    }
    message.extend_from_slice(&recent_blockhash);

    let data = instruction.data();
    push_short_vec_len(1, &mut message);
    message.push(4);
    let accounts = [1u8, 2, 0, 3];
    push_short_vec_len(accounts.len(), &mut message);
    message.extend_from_slice(&accounts);
    push_short_vec_len(data.len(), &mut message);
    message.extend_from_slice(&data);
    message
}

pub fn encode_transaction(message: &[u8], signature: &[u8; 64]) -> Vec<u8> {
    let mut transaction = Vec::with_capacity(1 + 64 + message.len());
    push_short_vec_len(1, &mut transaction);
    transaction.extend_from_slice(signature);
    transaction.extend_from_slice(message);
    transaction
}

/// Solana compact-u16 length prefix.
fn push_short_vec_len(len: usize, out: &mut Vec<u8>) {
    let mut remaining = len;
    loop {
        let mut byte = (remaining & 0x7f) as u8;
        remaining >>= 7;
        if remaining == 0 {
            out.push(byte);
            break;
        }
        byte |= 0x80;
        out.push(byte);
    }
}
