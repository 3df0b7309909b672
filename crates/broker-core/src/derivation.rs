//! Pure hash, selector and address derivations.
//!
//! Simulation, commit and audit paths all derive broker keys through this module so the
//! on-chain lookup key, the program-derived accounts and the mirrored `broker_hash` column
//! can never disagree.

use crate::error::ProvisionError;
use crate::types::{BrokerId, EvmAddress, RegistryRole, SolanaPubkey};
use curve25519_dalek::edwards::CompressedEdwardsY;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use sha3::{Digest, Keccak256};
use std::fmt;

pub const BROKER_SEED: &[u8] = b"broker";
pub const MANAGER_ROLE_SEED: &[u8] = b"manager_role";
const PDA_MARKER: &[u8] = b"ProgramDerivedAddress";

/// Size of the broker allowance account: discriminator, broker hash, allow flag.
pub const BROKER_ACCOUNT_LEN: usize = 8 + 32 + 1;

/// Keccak-256 digest of a broker id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BrokerHash(pub [u8; 32]);

impl BrokerHash {
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Display for BrokerHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{}", hex::encode(self.0))
    }
}

pub fn keccak256(bytes: &[u8]) -> [u8; 32] {
    Keccak256::digest(bytes).into()
}

pub fn broker_hash(broker_id: &BrokerId) -> BrokerHash {
    BrokerHash(keccak256(broker_id.as_str().as_bytes()))
}

/// Access-control role hash, `keccak256(role_name)`, shared by EVM contracts and the program.
pub fn role_hash(role: RegistryRole) -> [u8; 32] {
    keccak256(role.manager_role().as_bytes())
}

pub fn function_selector(signature: &str) -> [u8; 4] {
    let digest = keccak256(signature.as_bytes());
    [digest[0], digest[1], digest[2], digest[3]]
}

pub fn get_allowed_broker_calldata(hash: &BrokerHash) -> Vec<u8> {
    let mut data = function_selector("getAllowedBroker(bytes32)").to_vec();
    data.extend_from_slice(hash.as_bytes());
    data
}

pub fn set_allowed_broker_calldata(hash: &BrokerHash, allowed: bool) -> Vec<u8> {
    let mut data = function_selector("setAllowedBroker(bytes32,bool)").to_vec();
    data.extend_from_slice(hash.as_bytes());
    data.extend_from_slice(&bool_word(allowed));
    data
}

pub fn has_role_calldata(role_hash: &[u8; 32], account: &EvmAddress) -> Vec<u8> {
    let mut data = function_selector("hasRole(bytes32,address)").to_vec();
    data.extend_from_slice(role_hash);
    data.extend_from_slice(&[0u8; 12]);
    data.extend_from_slice(&account.0);
    data
}

fn bool_word(value: bool) -> [u8; 32] {
    let mut word = [0u8; 32];
    word[31] = u8::from(value);
    word
}

/// Decode an ABI-encoded `bool` return value.
pub fn decode_bool_word(bytes: &[u8]) -> Result<bool, String> {
    if bytes.len() != 32 {
        return Err(format!("expected 32-byte word, got {} bytes", bytes.len()));
    }
    if bytes[..31].iter().any(|b| *b != 0) || bytes[31] > 1 {
        return Err("word is not a valid bool".to_string());
    }
    Ok(bytes[31] == 1)
}

/// Solana `find_program_address`: first bump from 255 downwards whose hash is off the
/// ed25519 curve.
pub fn find_program_address(
    seeds: &[&[u8]],
    program_id: &SolanaPubkey,
) -> Result<(SolanaPubkey, u8), ProvisionError> {
    for bump in (1..=u8::MAX).rev() {
        let mut hasher = Sha256::new();
        for seed in seeds {
            hasher.update(seed);
        }
        hasher.update([bump]);
        hasher.update(program_id.as_bytes());
        hasher.update(PDA_MARKER);
        let candidate: [u8; 32] = hasher.finalize().into();

        if !is_on_curve(&candidate) {
            return Ok((SolanaPubkey(candidate), bump));
        }
    }

    Err(ProvisionError::InvariantViolation(format!(
        "no viable program address for program {program_id}"
    )))
}

pub fn is_on_curve(bytes: &[u8; 32]) -> bool {
    CompressedEdwardsY(*bytes).decompress().is_some()
}

pub fn broker_account_address(
    program_id: &SolanaPubkey,
    hash: &BrokerHash,
) -> Result<SolanaPubkey, ProvisionError> {
    find_program_address(&[BROKER_SEED, hash.as_bytes()], program_id).map(|(key, _)| key)
}

pub fn manager_role_address(
    program_id: &SolanaPubkey,
    role: RegistryRole,
    operator: &SolanaPubkey,
) -> Result<SolanaPubkey, ProvisionError> {
    let role = role_hash(role);
    find_program_address(&[MANAGER_ROLE_SEED, &role, operator.as_bytes()], program_id)
        .map(|(key, _)| key)
}

/// Anchor-style 8-byte discriminator, `sha256("{namespace}:{name}")[..8]`.
pub fn anchor_discriminator(namespace: &str, name: &str) -> [u8; 8] {
    let digest: [u8; 32] = Sha256::digest(format!("{namespace}:{name}").as_bytes()).into();
    let mut out = [0u8; 8];
    out.copy_from_slice(&digest[..8]);
    out
}

/// Decoded broker allowance account.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BrokerAccountState {
    pub broker_hash: BrokerHash,
    pub allowed: bool,
}

pub fn encode_broker_account(state: &BrokerAccountState) -> Vec<u8> {
    let mut data = anchor_discriminator("account", "BrokerAllowance").to_vec();
    data.extend_from_slice(state.broker_hash.as_bytes());
    data.push(u8::from(state.allowed));
    data
}

pub fn decode_broker_account(data: &[u8]) -> Result<BrokerAccountState, String> {
    if data.len() < BROKER_ACCOUNT_LEN {
        return Err(format!(
            "broker account too short: {} bytes, expected {}",
            data.len(),
            BROKER_ACCOUNT_LEN
        ));
    }
    if data[..8] != anchor_discriminator("account", "BrokerAllowance") {
        return Err("broker account discriminator mismatch".to_string());
    }
    let mut hash = [0u8; 32];
    hash.copy_from_slice(&data[8..40]);
    Ok(BrokerAccountState {
        broker_hash: BrokerHash(hash),
        allowed: data[40] != 0,
    })
}

/// Fully resolved `set_broker` instruction for the Solana program.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SetBrokerInstruction {
    pub program_id: SolanaPubkey,
    pub operator: SolanaPubkey,
    pub broker_account: SolanaPubkey,
    pub manager_role_account: SolanaPubkey,
    pub broker_hash: BrokerHash,
    pub allowed: bool,
}

impl SetBrokerInstruction {
    pub fn derive(
        program_id: SolanaPubkey,
        role: RegistryRole,
        operator: SolanaPubkey,
        broker_id: &BrokerId,
        allowed: bool,
    ) -> Result<Self, ProvisionError> {
        let hash = broker_hash(broker_id);
        Ok(Self {
            program_id,
            operator,
            broker_account: broker_account_address(&program_id, &hash)?,
            manager_role_account: manager_role_address(&program_id, role, &operator)?,
            broker_hash: hash,
            allowed,
        })
    }

    pub fn data(&self) -> Vec<u8> {
        let mut data = anchor_discriminator("global", "set_broker").to_vec();
        data.extend_from_slice(self.broker_hash.as_bytes());
        data.push(u8::from(self.allowed));
        data
    }
}
