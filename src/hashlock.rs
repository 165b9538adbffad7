use std::fmt;

use rand::RngCore;
use serde::{Deserialize, Serialize};
use starknet_crypto::poseidon_hash_many;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::SwapError;
use crate::states::{keccak256, Hash32, StarkFelt};

pub const SECRET_LEN: usize = 31;

/// Byte appended to the secret to form the 32-byte EVM word.
pub const EVM_SECRET_MARKER: u8 = 0x00;

/// The preimage both escrows are locked with. Its 31 bytes always fit in
/// a single Starknet field element.
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct Secret([u8; SECRET_LEN]);

impl Secret {
    pub fn random() -> Self {
        let mut bytes = [0u8; SECRET_LEN];
        rand::thread_rng().fill_bytes(&mut bytes);
        Self(bytes)
    }

    pub fn from_bytes(bytes: [u8; SECRET_LEN]) -> Self {
        Self(bytes)
    }

    pub fn from_hex(value: &str) -> Result<Self, SwapError> {
        let digits = value.strip_prefix("0x").unwrap_or(value);
        let mut bytes = [0u8; SECRET_LEN];
        hex::decode_to_slice(digits, &mut bytes)
            .map_err(|_| SwapError::InvalidHex("secret must be 31 bytes".to_string()))?;
        Ok(Self(bytes))
    }

    pub fn as_bytes(&self) -> &[u8; SECRET_LEN] {
        &self.0
    }

    /// `secret ‖ 0x00`, the value passed to EVM `withdraw`.
    pub fn evm_word(&self) -> [u8; 32] {
        let mut word = [EVM_SECRET_MARKER; 32];
        word[..SECRET_LEN].copy_from_slice(&self.0);
        word
    }

    pub fn as_felt(&self) -> StarkFelt {
        let mut bytes = [0u8; 32];
        bytes[32 - SECRET_LEN..].copy_from_slice(&self.0);
        StarkFelt(bytes)
    }

    pub fn to_hex(&self) -> String {
        format!("0x{}", hex::encode(self.0))
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Secret(<redacted>)")
    }
}

pub fn commit_evm(secret: &Secret) -> Hash32 {
    Hash32(keccak256(&secret.evm_word()))
}

pub fn commit_starknet(secret: &Secret) -> StarkFelt {
    StarkFelt::from_felt(poseidon_hash_many(&[secret.as_felt().to_felt()]))
}

/// Both commitments of one secret. Only constructible from a [`Secret`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Hashlock {
    evm: Hash32,
    starknet: StarkFelt,
}

impl Hashlock {
    pub fn from_secret(secret: &Secret) -> Self {
        Self {
            evm: commit_evm(secret),
            starknet: commit_starknet(secret),
        }
    }

    pub fn evm(&self) -> Hash32 {
        self.evm
    }

    pub fn starknet(&self) -> StarkFelt {
        self.starknet
    }

    pub fn verify(&self, secret: &Secret) -> bool {
        *self == Self::from_secret(secret)
    }
}
