//! EVM registry client over Ethereum JSON-RPC.

use crate::rpc::{ConfirmationPolicy, JsonRpcTransport};
use async_trait::async_trait;
use broker_core::clients::EvmRegistryClient;
use broker_core::derivation::{
    decode_bool_word, get_allowed_broker_calldata, has_role_calldata, set_allowed_broker_calldata,
    BrokerHash,
};
use broker_core::error::{LedgerCallError, ProvisionError};
use broker_core::types::{EvmAddress, RegistryTarget};
use serde::Deserialize;
use serde_json::{json, Value};
use std::time::Duration;
use tracing::{debug, info};

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TransactionReceipt {
    transaction_hash: String,
    status: Option<String>,
}

/// Talks to each target's `rpc_url`; transactions are sent to the remote signer when one
/// is configured, otherwise to the node's managed account.
#[derive(Debug)]
pub struct JsonRpcEvmClient {
    transport: JsonRpcTransport,
    signer_url: Option<String>,
    confirmation: ConfirmationPolicy,
}

impl JsonRpcEvmClient {
    pub fn new(
        request_timeout: Duration,
        signer_url: Option<String>,
        confirmation: ConfirmationPolicy,
    ) -> Result<Self, LedgerCallError> {
        Ok(Self {
            transport: JsonRpcTransport::new(request_timeout)?,
            signer_url,
            confirmation,
        })
    }

    async fn eth_call(
        &self,
        target: &RegistryTarget,
        data: Vec<u8>,
    ) -> Result<Vec<u8>, LedgerCallError> {
        let to = contract(target)?;
        let result: String = self
            .transport
            .call(
                &target.rpc_url,
                "eth_call",
                json!([{ "to": to.to_string(), "data": hex_data(&data) }, "latest"]),
            )
            .await?;
        decode_hex_bytes(&result)
    }

    async fn quantity(
        &self,
        url: &str,
        method: &str,
        params: Value,
    ) -> Result<u128, LedgerCallError> {
        let result: String = self.transport.call(url, method, params).await?;
        parse_quantity(&result)
    }

    async fn wait_for_receipt(
        &self,
        target: &RegistryTarget,
        tx_hash: &str,
    ) -> Result<String, LedgerCallError> {
        for _ in 0..self.confirmation.max_polls {
            let receipt: Option<TransactionReceipt> = self
                .transport
                .call(&target.rpc_url, "eth_getTransactionReceipt", json!([tx_hash]))
                .await?;

            if let Some(receipt) = receipt {
                return match receipt.status.as_deref() {
                    Some("0x1") => Ok(receipt.transaction_hash),
                    _ => Err(LedgerCallError::Reverted {
                        tx_id: receipt.transaction_hash,
                    }),
                };
            }
            tokio::time::sleep(self.confirmation.poll_interval).await;
        }

        Err(LedgerCallError::Unconfirmed {
            tx_id: tx_hash.to_string(),
        })
    }
}

#[async_trait]
impl EvmRegistryClient for JsonRpcEvmClient {
    async fn is_broker_allowed(
        &self,
        target: &RegistryTarget,
        hash: &BrokerHash,
    ) -> Result<bool, LedgerCallError> {
        let word = self
            .eth_call(target, get_allowed_broker_calldata(hash))
            .await?;
        decode_bool_word(&word).map_err(LedgerCallError::Decode)
    }

    async fn estimate_set_allowed_cost(
        &self,
        target: &RegistryTarget,
        hash: &BrokerHash,
        allowed: bool,
        from: &EvmAddress,
    ) -> Result<u128, LedgerCallError> {
        let to = contract(target)?;
        let data = set_allowed_broker_calldata(hash, allowed);
        let gas = self
            .quantity(
                &target.rpc_url,
                "eth_estimateGas",
                json!([{ "from": from.to_string(), "to": to.to_string(), "data": hex_data(&data) }]),
            )
            .await?;
        let gas_price = self
            .quantity(&target.rpc_url, "eth_gasPrice", json!([]))
            .await?;

        debug!(
            registry = %target.name,
            gas = %gas,
            gas_price = %gas_price,
            "estimated setAllowedBroker cost"
        );
        gas.checked_mul(gas_price)
            .ok_or_else(|| LedgerCallError::Decode("gas cost overflows u128".to_string()))
    }

    async fn balance_of(
        &self,
        target: &RegistryTarget,
        account: &EvmAddress,
    ) -> Result<u128, LedgerCallError> {
        self.quantity(
            &target.rpc_url,
            "eth_getBalance",
            json!([account.to_string(), "latest"]),
        )
        .await
    }

    async fn has_role(
        &self,
        target: &RegistryTarget,
        role_hash: &[u8; 32],
        account: &EvmAddress,
    ) -> Result<bool, LedgerCallError> {
        let word = self
            .eth_call(target, has_role_calldata(role_hash, account))
            .await?;
        decode_bool_word(&word).map_err(LedgerCallError::Decode)
    }

    async fn set_broker_allowed(
        &self,
        target: &RegistryTarget,
        hash: &BrokerHash,
        allowed: bool,
        from: &EvmAddress,
    ) -> Result<String, LedgerCallError> {
        let to = contract(target)?;
        let data = set_allowed_broker_calldata(hash, allowed);
        let chain_id = target
            .chain_id
            .parse::<u64>()
            .map_err(|e| LedgerCallError::Decode(format!("chain id '{}': {e}", target.chain_id)))?;
        let send_url = self.signer_url.as_deref().unwrap_or(&target.rpc_url);

        let tx_hash: String = self
            .transport
            .call(
                send_url,
                "eth_sendTransaction",
                json!([{
                    "from": from.to_string(),
                    "to": to.to_string(),
                    "data": hex_data(&data),
                    "chainId": format!("0x{chain_id:x}"),
                }]),
            )
            .await?;
        info!(registry = %target.name, tx_hash = %tx_hash, "setAllowedBroker submitted");

        self.wait_for_receipt(target, &tx_hash).await
    }
}

fn contract(target: &RegistryTarget) -> Result<EvmAddress, LedgerCallError> {
    target
        .contract_address()
        .map_err(|e: ProvisionError| LedgerCallError::Decode(e.to_string()))
}

fn hex_data(bytes: &[u8]) -> String {
    format!("0x{}", hex::encode(bytes))
}

/// Decode `0x`-prefixed hex data.
pub fn decode_hex_bytes(value: &str) -> Result<Vec<u8>, LedgerCallError> {
    let digits = value.strip_prefix("0x").unwrap_or(value);
    hex::decode(digits).map_err(|e| LedgerCallError::Decode(format!("hex data '{value}': {e}")))
}

/// Decode an Ethereum JSON-RPC quantity (`0x`-prefixed, no leading zeros required).
pub fn parse_quantity(value: &str) -> Result<u128, LedgerCallError> {
    let digits = value
        .strip_prefix("0x")
        .ok_or_else(|| LedgerCallError::Decode(format!("quantity '{value}' lacks 0x prefix")))?;
    if digits.is_empty() {
        return Ok(0);
    }
    u128::from_str_radix(digits, 16)
        .map_err(|e| LedgerCallError::Decode(format!("quantity '{value}': {e}")))
}
