//! Operator funding credentials, resolved once at process start.

use crate::error::ProvisionError;
use crate::types::{EvmAddress, SolanaPubkey};
use ed25519_dalek::{Signer, SigningKey};
use std::fmt;
use std::path::Path;

pub const EVM_OPERATOR_ADDRESS_ENV: &str = "BROKER_EVM_OPERATOR_ADDRESS";
pub const EVM_SIGNER_URL_ENV: &str = "BROKER_EVM_SIGNER_URL";
pub const SOLANA_KEYPAIR_ENV: &str = "BROKER_SOLANA_KEYPAIR";

/// Funding credential for every EVM target.
///
/// Transactions are signed by a remote signer (or the node's managed account); this
/// process only needs the operator address and where to send signing requests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EvmCredential {
    pub operator: EvmAddress,
    pub signer_url: Option<String>,
}

/// Funding keypair for the Solana target.
#[derive(Clone)]
pub struct SolanaCredential {
    signing_key: SigningKey,
}

impl SolanaCredential {
    pub fn from_signing_key(signing_key: SigningKey) -> Self {
        Self { signing_key }
    }

    /// Parse a `solana-keygen` style keypair: a JSON array of 64 bytes.
    pub fn from_keypair_json(json: &str) -> Result<Self, ProvisionError> {
        let bytes: Vec<u8> = serde_json::from_str(json.trim()).map_err(|e| {
            ProvisionError::Configuration(format!("solana keypair is not a JSON byte array: {e}"))
        })?;
        let bytes: [u8; 64] = bytes.try_into().map_err(|_| {
            ProvisionError::Configuration("solana keypair must contain 64 bytes".to_string())
        })?;
        let signing_key = SigningKey::from_keypair_bytes(&bytes).map_err(|e| {
            ProvisionError::Configuration(format!("solana keypair is inconsistent: {e}"))
        })?;
        Ok(Self { signing_key })
    }

    pub fn pubkey(&self) -> SolanaPubkey {
        SolanaPubkey(self.signing_key.verifying_key().to_bytes())
    }

    pub fn sign(&self, message: &[u8]) -> [u8; 64] {
        self.signing_key.sign(message).to_bytes()
    }
}

impl fmt::Debug for SolanaCredential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SolanaCredential")
            .field("pubkey", &self.pubkey().to_string())
            .finish_non_exhaustive()
    }
}

/// All funding credentials, shared by reference with every component.
#[derive(Debug, Clone)]
pub struct Credentials {
    pub evm: EvmCredential,
    pub solana: SolanaCredential,
}

impl Credentials {
    pub fn new(evm: EvmCredential, solana: SolanaCredential) -> Self {
        Self { evm, solana }
    }

    /// Resolve credentials from the process environment.
    ///
    /// `BROKER_SOLANA_KEYPAIR` holds either the keypair JSON itself or a path to a keypair file.
    pub fn from_env() -> Result<Self, ProvisionError> {
        let operator = require_env(EVM_OPERATOR_ADDRESS_ENV)?.parse::<EvmAddress>()?;
        let signer_url = std::env::var(EVM_SIGNER_URL_ENV)
            .ok()
            .filter(|value| !value.trim().is_empty());

        let keypair = require_env(SOLANA_KEYPAIR_ENV)?;
        let solana = if keypair.trim_start().starts_with('[') {
            SolanaCredential::from_keypair_json(&keypair)?
        } else {
            let contents = std::fs::read_to_string(Path::new(keypair.trim())).map_err(|e| {
                ProvisionError::Configuration(format!(
                    "cannot read solana keypair file '{}': {e}",
                    keypair.trim()
                ))
            })?;
            SolanaCredential::from_keypair_json(&contents)?
        };

        Ok(Self {
            evm: EvmCredential {
                operator,
                signer_url,
            },
            solana,
        })
    }
}

fn require_env(name: &str) -> Result<String, ProvisionError> {
    std::env::var(name)
        .map_err(|_| ProvisionError::Configuration(format!("missing environment variable {name}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn keypair_json(seed: u8) -> String {
        let key = SigningKey::from_bytes(&[seed; 32]);
        serde_json::to_string(&key.to_keypair_bytes().to_vec()).unwrap()
    }

    #[test]
    fn keypair_json_yields_matching_pubkey() {
        let credential = SolanaCredential::from_keypair_json(&keypair_json(3)).unwrap();
        let expected = SigningKey::from_bytes(&[3; 32]).verifying_key().to_bytes();
        assert_eq!(credential.pubkey(), SolanaPubkey(expected));
    }

    #[test]
    fn keypair_json_rejects_short_arrays() {
        let err = SolanaCredential::from_keypair_json("[1,2,3]").unwrap_err();
        assert!(err.to_string().contains("64 bytes"));
    }

    #[test]
    fn debug_output_hides_secret_material() {
        let credential = SolanaCredential::from_keypair_json(&keypair_json(4)).unwrap();
        let rendered = format!("{credential:?}");
        assert!(rendered.contains("pubkey"));
        assert!(!rendered.contains("signing_key"));
    }
}
