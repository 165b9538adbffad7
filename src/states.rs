use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use sha3::{Digest, Keccak256};
use starknet_crypto::Felt;
use sylvia::cw_schema::cw_serde;
use sylvia::cw_std::{Decimal256, Uint128, Uint256};

use crate::error::SwapError;

pub const WORD: usize = 32;

pub fn keccak256(data: &[u8]) -> [u8; 32] {
    let mut hasher = Keccak256::new();
    hasher.update(data);
    hasher.finalize().into()
}

/// Reads the `index`-th 32-byte ABI word.
pub fn read_word(data: &[u8], index: usize) -> Option<[u8; 32]> {
    let start = index.checked_mul(WORD)?;
    let slice = data.get(start..start + WORD)?;
    let mut word = [0u8; 32];
    word.copy_from_slice(slice);
    Some(word)
}

/// Decodes `0x`-prefixed hex into `N` bytes, left padding short values.
fn decode_hex_padded<const N: usize>(value: &str) -> Option<[u8; N]> {
    let digits = value
        .strip_prefix("0x")
        .or_else(|| value.strip_prefix("0X"))?;
    if digits.is_empty() || digits.len() > N * 2 {
        return None;
    }
    let padded = format!("{:0>width$}", digits, width = N * 2);
    let mut out = [0u8; N];
    hex::decode_to_slice(padded, &mut out).ok()?;
    Some(out)
}

/// A 32-byte value: order hashes, keccak digests, raw EVM words.
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Hash32(#[serde(with = "hex")] pub [u8; 32]);

impl Hash32 {
    pub fn from_hex(value: &str) -> Result<Self, SwapError> {
        decode_hex_padded(value)
            .map(Self)
            .ok_or_else(|| SwapError::InvalidHex(value.to_string()))
    }

    pub fn to_uint(&self) -> Uint256 {
        Uint256::from_be_bytes(self.0)
    }

    pub fn from_uint(value: Uint256) -> Self {
        Self(value.to_be_bytes())
    }
}

impl fmt::Display for Hash32 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{}", hex::encode(self.0))
    }
}

impl fmt::Debug for Hash32 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

/// 20-byte EVM account or contract address.
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EvmAddress(#[serde(with = "hex")] pub [u8; 20]);

impl EvmAddress {
    pub const ZERO: EvmAddress = EvmAddress([0u8; 20]);

    /// Accepts exactly `0x` followed by 40 hex digits.
    pub fn parse(value: &str) -> Result<Self, SwapError> {
        let invalid = || SwapError::InvalidAddress {
            chain: "evm",
            value: value.to_string(),
        };
        let digits = value.strip_prefix("0x").ok_or_else(invalid)?;
        if digits.len() != 40 {
            return Err(invalid());
        }
        decode_hex_padded(value).map(Self).ok_or_else(invalid)
    }

    pub fn is_zero(&self) -> bool {
        self.0 == [0u8; 20]
    }

    /// Left-padded ABI word.
    pub fn to_word(&self) -> [u8; 32] {
        let mut word = [0u8; 32];
        word[12..].copy_from_slice(&self.0);
        word
    }

    pub fn from_word(word: &[u8; 32]) -> Result<Self, SwapError> {
        if word[..12].iter().any(|b| *b != 0) {
            return Err(SwapError::MalformedEvent(format!(
                "word 0x{} is not an address",
                hex::encode(word)
            )));
        }
        let mut address = [0u8; 20];
        address.copy_from_slice(&word[12..]);
        Ok(Self(address))
    }

    pub fn to_felt(&self) -> StarkFelt {
        StarkFelt(self.to_word())
    }

    pub fn from_felt(felt: &StarkFelt) -> Result<Self, SwapError> {
        Self::from_word(&felt.0)
    }
}

impl FromStr for EvmAddress {
    type Err = SwapError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for EvmAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{}", hex::encode(self.0))
    }
}

impl fmt::Debug for EvmAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

/// A Starknet field element kept as 32 big-endian bytes. Always canonical
/// (below the field prime) when built through the checked constructors.
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct StarkFelt(#[serde(with = "hex")] pub [u8; 32]);

impl StarkFelt {
    pub const ZERO: StarkFelt = StarkFelt([0u8; 32]);

    pub fn from_bytes_be(bytes: [u8; 32]) -> Result<Self, SwapError> {
        let felt = Felt::from_bytes_be(&bytes);
        if felt.to_bytes_be() != bytes {
            return Err(SwapError::InvalidHex(format!(
                "0x{} is not a field element",
                hex::encode(bytes)
            )));
        }
        Ok(Self(bytes))
    }

    /// Left pads up to 32 bytes.
    pub fn from_slice(bytes: &[u8]) -> Result<Self, SwapError> {
        if bytes.len() > 32 {
            return Err(SwapError::InvalidHex(hex::encode(bytes)));
        }
        let mut out = [0u8; 32];
        out[32 - bytes.len()..].copy_from_slice(bytes);
        Self::from_bytes_be(out)
    }

    pub fn from_hex(value: &str) -> Result<Self, SwapError> {
        let bytes =
            decode_hex_padded(value).ok_or_else(|| SwapError::InvalidHex(value.to_string()))?;
        Self::from_bytes_be(bytes)
    }

    /// Contract and account addresses: `0x` plus 1 to 64 hex digits, below 2^251.
    pub fn parse_address(value: &str) -> Result<Self, SwapError> {
        let invalid = || SwapError::InvalidAddress {
            chain: "starknet",
            value: value.to_string(),
        };
        if !value.starts_with("0x") {
            return Err(invalid());
        }
        let bytes: [u8; 32] = decode_hex_padded(value).ok_or_else(invalid)?;
        if bytes[0] >= 0x08 {
            return Err(invalid());
        }
        Ok(Self(bytes))
    }

    pub fn from_u64(value: u64) -> Self {
        Self::from_u128(value as u128)
    }

    pub fn from_u128(value: u128) -> Self {
        let mut out = [0u8; 32];
        out[16..].copy_from_slice(&value.to_be_bytes());
        Self(out)
    }

    pub fn to_u64(&self) -> Option<u64> {
        if self.0[..24].iter().any(|b| *b != 0) {
            return None;
        }
        let mut tail = [0u8; 8];
        tail.copy_from_slice(&self.0[24..]);
        Some(u64::from_be_bytes(tail))
    }

    pub fn to_u128(&self) -> Option<u128> {
        if self.0[..16].iter().any(|b| *b != 0) {
            return None;
        }
        let mut tail = [0u8; 16];
        tail.copy_from_slice(&self.0[16..]);
        Some(u128::from_be_bytes(tail))
    }

    pub fn to_felt(&self) -> Felt {
        Felt::from_bytes_be(&self.0)
    }

    pub fn from_felt(felt: Felt) -> Self {
        Self(felt.to_bytes_be())
    }
}

impl fmt::Display for StarkFelt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{}", hex::encode(self.0))
    }
}

impl fmt::Debug for StarkFelt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

/// Cairo `u256`: two 128-bit limbs, low first on the wire.
#[cw_serde(crate = "sylvia::cw_schema")]
#[derive(Copy, Eq, Default)]
pub struct U256Limbs {
    pub low: Uint128,
    pub high: Uint128,
}

impl U256Limbs {
    pub fn to_felts(&self) -> [StarkFelt; 2] {
        [
            StarkFelt::from_u128(self.low.u128()),
            StarkFelt::from_u128(self.high.u128()),
        ]
    }

    pub fn from_felts(low: &StarkFelt, high: &StarkFelt) -> Result<Self, SwapError> {
        let limb = |felt: &StarkFelt| {
            felt.to_u128()
                .map(Uint128::new)
                .ok_or_else(|| SwapError::InvalidAmount(format!("{felt} is not a u128 limb")))
        };
        Ok(Self {
            low: limb(low)?,
            high: limb(high)?,
        })
    }
}

impl From<Uint256> for U256Limbs {
    fn from(value: Uint256) -> Self {
        let bytes = value.to_be_bytes();
        let mut high = [0u8; 16];
        let mut low = [0u8; 16];
        high.copy_from_slice(&bytes[..16]);
        low.copy_from_slice(&bytes[16..]);
        Self {
            low: Uint128::new(u128::from_be_bytes(low)),
            high: Uint128::new(u128::from_be_bytes(high)),
        }
    }
}

impl From<U256Limbs> for Uint256 {
    fn from(limbs: U256Limbs) -> Self {
        let mut bytes = [0u8; 32];
        bytes[..16].copy_from_slice(&limbs.high.u128().to_be_bytes());
        bytes[16..].copy_from_slice(&limbs.low.u128().to_be_bytes());
        Uint256::from_be_bytes(bytes)
    }
}

/// Amounts of one swap, in token base units.
#[cw_serde(crate = "sylvia::cw_schema")]
#[derive(Copy, Eq)]
pub struct Amounts {
    pub making: Uint256,
    pub taking: Uint256,
    pub safety_deposit: Uint256,
}

fn ten_pow(exp: u32) -> Uint256 {
    Uint256::from(10u128).pow(exp)
}

/// Parses a positive decimal string into base units, e.g. `"1.5"` with 18
/// decimals. At most 18 decimals are supported.
pub fn parse_units(value: &str, decimals: u32) -> Result<Uint256, SwapError> {
    let trimmed = value.trim();
    if trimmed.starts_with('-') {
        return Err(SwapError::NonPositiveAmount(value.to_string()));
    }
    if decimals > 18 {
        return Err(SwapError::InvalidAmount(format!(
            "{decimals} decimals is more than supported"
        )));
    }
    let parsed = Decimal256::from_str(trimmed)
        .map_err(|_| SwapError::InvalidAmount(value.to_string()))?;
    let divisor = ten_pow(18 - decimals);
    let atomics = parsed.atomics();
    if !(atomics % divisor).is_zero() {
        return Err(SwapError::InvalidAmount(format!(
            "{value} has more than {decimals} fractional digits"
        )));
    }
    let units = atomics / divisor;
    if units.is_zero() {
        return Err(SwapError::NonPositiveAmount(value.to_string()));
    }
    Ok(units)
}

/// Inverse of [`parse_units`], for logs.
pub fn format_units(value: Uint256, decimals: u32) -> String {
    match value.checked_mul(ten_pow(18u32.saturating_sub(decimals))) {
        Ok(atomics) if decimals <= 18 => Decimal256::new(atomics).to_string(),
        _ => value.to_string(),
    }
}
