use rand::RngCore;
use serde::{Deserialize, Serialize};
use starknet_crypto::{pedersen_hash, Felt};
use sylvia::cw_std::Uint256;

use crate::error::SwapError;
use crate::states::{keccak256, EvmAddress, Hash32, StarkFelt, U256Limbs};
use crate::timelocks::TimelockOffsets;

/// Parameters handed to the order SDK for a cross-chain order whose source is an EVM chain.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EvmOrderParams {
    pub maker: EvmAddress,
    pub maker_asset: EvmAddress,
    pub taker_asset: EvmAddress,
    pub making_amount: Uint256,
    pub taking_amount: Uint256,
    pub hashlock: Hash32,
    pub offsets: TimelockOffsets,
    pub src_chain_id: u64,
    pub dst_chain_id: u64,
    pub src_safety_deposit: Uint256,
    pub dst_safety_deposit: Uint256,
    pub escrow_factory: EvmAddress,
    pub resolver: EvmAddress,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderExtension {
    /// Escrow extension as produced by the SDK, opaque here.
    #[serde(with = "hex")]
    pub escrow: Vec<u8>,
    #[serde(with = "hex")]
    pub custom_data: Vec<u8>,
}

impl OrderExtension {
    /// Custom data trails the extension.
    pub fn encode(&self) -> Vec<u8> {
        [self.escrow.as_slice(), self.custom_data.as_slice()].concat()
    }

    pub fn hash(&self) -> Hash32 {
        Hash32(keccak256(&self.encode()))
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EvmOrder {
    pub salt: Uint256,
    pub maker: EvmAddress,
    pub receiver: EvmAddress,
    pub maker_asset: EvmAddress,
    pub taker_asset: EvmAddress,
    pub making_amount: Uint256,
    pub taking_amount: Uint256,
    pub maker_traits: Uint256,
    pub extension: OrderExtension,
    pub dst_chain_id: u64,
}

impl EvmOrder {
    /// Maker traits bit 253 tells the escrow factory the destination is not an EVM chain.
    pub fn with_non_evm_destination(mut self) -> Self {
        let mut bytes = self.maker_traits.to_be_bytes();
        bytes[0] |= 0x20;
        self.maker_traits = Uint256::from_be_bytes(bytes);
        self
    }

    pub fn has_non_evm_destination(&self) -> bool {
        self.maker_traits.to_be_bytes()[0] & 0x20 != 0
    }

    pub fn with_dst_chain_id(mut self, chain_id: u64) -> Self {
        self.dst_chain_id = chain_id;
        self
    }

    pub fn with_custom_data(mut self, custom_data: Vec<u8>) -> Self {
        self.extension.custom_data = custom_data;
        self
    }

    /// The protocol checks that the low 160 bits of the salt match the
    /// extension hash, so this must run after every extension change.
    pub fn with_extension_salt(mut self) -> Self {
        let mut bytes = [0u8; 32];
        bytes[12..].copy_from_slice(&self.extension.hash().0[12..]);
        self.salt = Uint256::from_be_bytes(bytes);
        self
    }

    pub fn salt_matches_extension(&self) -> bool {
        self.salt.to_be_bytes()[12..] == self.extension.hash().0[12..]
    }
}

/// Receiver, asset and Starknet hashlock packed for the resolver to read.
pub fn starknet_custom_data(receiver: &StarkFelt, asset: &StarkFelt, hashlock: &StarkFelt) -> Vec<u8> {
    [receiver.0, asset.0, hashlock.0].concat()
}

/// Compact `r, vs` signature.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EvmSignature {
    pub r: Hash32,
    pub vs: Hash32,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TakerTraits {
    pub maker_amount: bool,
    pub extension_len: usize,
    pub threshold: Uint256,
}

impl TakerTraits {
    /// Fill by making amount, carrying the order extension, with the taking
    /// amount as threshold.
    pub fn for_fill(order: &EvmOrder) -> Self {
        Self {
            maker_amount: true,
            extension_len: order.extension.encode().len(),
            threshold: order.taking_amount,
        }
    }

    pub fn encode(&self) -> Result<Uint256, SwapError> {
        let threshold = self.threshold.to_be_bytes();
        if threshold[..8].iter().any(|b| *b != 0) || threshold[8] > 0x01 {
            return Err(SwapError::InvalidAmount(format!(
                "threshold {} does not fit 185 bits",
                self.threshold
            )));
        }
        // The extension length occupies 24 bits.
        let extension_len = u32::try_from(self.extension_len)
            .ok()
            .filter(|len| *len <= 0x00ff_ffff)
            .ok_or_else(|| {
                SwapError::InvalidConfig(format!(
                    "order extension of {} bytes is too long",
                    self.extension_len
                ))
            })?;
        let mut bytes = [0u8; 32];
        bytes[8..].copy_from_slice(&threshold[8..]);
        bytes[1..4].copy_from_slice(&extension_len.to_be_bytes()[1..]);
        if self.maker_amount {
            bytes[0] |= 0x80;
        }
        Ok(Uint256::from_be_bytes(bytes))
    }
}

/// Order construction and signing, provided by the limit-order SDK.
pub trait EvmOrderSdk {
    fn build_order(&self, params: &EvmOrderParams) -> Result<EvmOrder, SwapError>;
    fn order_hash(&self, order: &EvmOrder, chain_id: u64) -> Hash32;
    fn sign(&self, order: &EvmOrder, chain_id: u64) -> Result<EvmSignature, SwapError>;
}

impl<T: EvmOrderSdk + ?Sized> EvmOrderSdk for &T {
    fn build_order(&self, params: &EvmOrderParams) -> Result<EvmOrder, SwapError> {
        (**self).build_order(params)
    }

    fn order_hash(&self, order: &EvmOrder, chain_id: u64) -> Hash32 {
        (**self).order_hash(order, chain_id)
    }

    fn sign(&self, order: &EvmOrder, chain_id: u64) -> Result<EvmSignature, SwapError> {
        (**self).sign(order, chain_id)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StarknetOrder {
    pub salt: StarkFelt,
    pub maker: StarkFelt,
    pub receiver: StarkFelt,
    pub maker_asset: StarkFelt,
    pub taker_asset: StarkFelt,
    pub making_amount: U256Limbs,
    pub taking_amount: U256Limbs,
}

impl StarknetOrder {
    pub fn new(
        maker: StarkFelt,
        receiver: EvmAddress,
        maker_asset: StarkFelt,
        taker_asset: EvmAddress,
        making_amount: Uint256,
        taking_amount: Uint256,
    ) -> Self {
        let mut salt = [0u8; 8];
        rand::thread_rng().fill_bytes(&mut salt);
        Self {
            salt: StarkFelt::from_u64(u64::from_be_bytes(salt)),
            maker,
            receiver: receiver.to_felt(),
            maker_asset,
            taker_asset: taker_asset.to_felt(),
            making_amount: making_amount.into(),
            taking_amount: taking_amount.into(),
        }
    }

    pub fn with_salt(self, salt: StarkFelt) -> Self {
        Self { salt, ..self }
    }

    pub fn elements(&self) -> Vec<StarkFelt> {
        let [making_low, making_high] = self.making_amount.to_felts();
        let [taking_low, taking_high] = self.taking_amount.to_felts();
        vec![
            self.salt,
            self.maker,
            self.receiver,
            self.maker_asset,
            self.taker_asset,
            making_low,
            making_high,
            taking_low,
            taking_high,
        ]
    }

    pub fn order_hash(&self) -> StarkFelt {
        compute_hash_on_elements(&self.elements())
    }

    pub fn to_calldata(&self) -> Vec<StarkFelt> {
        self.elements()
    }
}

/// Pedersen chain starting from zero, closed with the element count.
pub fn compute_hash_on_elements(elements: &[StarkFelt]) -> StarkFelt {
    let acc = elements
        .iter()
        .fold(Felt::ZERO, |acc, element| pedersen_hash(&acc, &element.to_felt()));
    StarkFelt::from_felt(pedersen_hash(&acc, &Felt::from(elements.len() as u64)))
}

pub trait StarknetOrderSigner {
    fn sign(&self, order: &StarknetOrder) -> Result<Vec<StarkFelt>, SwapError>;
}

impl<T: StarknetOrderSigner + ?Sized> StarknetOrderSigner for &T {
    fn sign(&self, order: &StarknetOrder) -> Result<Vec<StarkFelt>, SwapError> {
        (**self).sign(order)
    }
}

/// The deployed limit-order protocol accepts the order hash itself as signature.
#[derive(Clone, Copy, Debug, Default)]
pub struct HashSigner;

impl StarknetOrderSigner for HashSigner {
    fn sign(&self, order: &StarknetOrder) -> Result<Vec<StarkFelt>, SwapError> {
        Ok(vec![order.order_hash()])
    }
}
