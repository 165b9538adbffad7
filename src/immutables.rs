use std::fmt;

use serde::{Deserialize, Serialize};
use starknet_crypto::poseidon_hash_many;
use sylvia::cw_std::Uint256;

use crate::error::SwapError;
use crate::hashlock::Hashlock;
use crate::order::{EvmOrder, StarknetOrder};
use crate::states::{keccak256, read_word, EvmAddress, Hash32, StarkFelt, U256Limbs, WORD};
use crate::timelocks::{rebase_destination, DstTimelocks, Stage, TimelockOffsets, Timelocks};

pub const EVM_IMMUTABLES_WORDS: usize = 8;
pub const STARKNET_IMMUTABLES_FELTS: usize = 17;

const PROXY_PREFIX: [u8; 20] = [
    0x3d, 0x60, 0x2d, 0x80, 0x60, 0x0a, 0x3d, 0x39, 0x81, 0xf3, 0x36, 0x3d, 0x3d, 0x37, 0x3d, 0x3d,
    0x3d, 0x36, 0x3d, 0x73,
];
const PROXY_SUFFIX: [u8; 15] = [
    0x5a, 0xf4, 0x3d, 0x82, 0x80, 0x3e, 0x90, 0x3d, 0x91, 0x60, 0x2b, 0x57, 0xfd, 0x5b, 0xf3,
];

/// What every escrow commits to, regardless of chain encoding.
pub trait EscrowImmutables {
    type Address: Copy + fmt::Debug + fmt::Display + PartialEq;

    fn order_hash_bytes(&self) -> [u8; 32];
    fn hashlock_bytes(&self) -> [u8; 32];
    fn maker(&self) -> Self::Address;
    fn taker(&self) -> Self::Address;
    fn token(&self) -> Self::Address;
    fn amount(&self) -> Uint256;
    fn safety_deposit(&self) -> Uint256;
    fn timelocks(&self) -> Timelocks;
    fn record(&self) -> RecordedImmutables;
}

/// Maker, taker and token of one escrow.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Parties<A> {
    pub maker: A,
    pub taker: A,
    pub token: A,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EvmImmutables {
    pub order_hash: Hash32,
    pub hashlock: Hash32,
    pub maker: EvmAddress,
    pub taker: EvmAddress,
    pub token: EvmAddress,
    pub amount: Uint256,
    pub safety_deposit: Uint256,
    pub timelocks: Timelocks,
}

impl EvmImmutables {
    pub fn words(&self) -> [[u8; 32]; EVM_IMMUTABLES_WORDS] {
        [
            self.order_hash.0,
            self.hashlock.0,
            self.maker.to_word(),
            self.taker.to_word(),
            self.token.to_word(),
            self.amount.to_be_bytes(),
            self.safety_deposit.to_be_bytes(),
            self.timelocks.0.to_be_bytes(),
        ]
    }

    pub fn abi_encode(&self) -> Vec<u8> {
        self.words().concat()
    }

    pub fn abi_decode(data: &[u8]) -> Result<Self, SwapError> {
        let word = |index: usize| {
            read_word(data, index).ok_or_else(|| {
                SwapError::MalformedEvent(format!(
                    "immutables need {} bytes, got {}",
                    EVM_IMMUTABLES_WORDS * WORD,
                    data.len()
                ))
            })
        };
        Ok(Self {
            order_hash: Hash32(word(0)?),
            hashlock: Hash32(word(1)?),
            maker: EvmAddress::from_word(&word(2)?)?,
            taker: EvmAddress::from_word(&word(3)?)?,
            token: EvmAddress::from_word(&word(4)?)?,
            amount: Uint256::from_be_bytes(word(5)?),
            safety_deposit: Uint256::from_be_bytes(word(6)?),
            timelocks: Timelocks(Uint256::from_be_bytes(word(7)?)),
        })
    }

    pub fn hash(&self) -> Hash32 {
        Hash32(keccak256(&self.abi_encode()))
    }

    pub fn with_timelocks(self, timelocks: Timelocks) -> Self {
        Self { timelocks, ..self }
    }

    /// Clone address the factory deploys for these immutables.
    pub fn escrow_address(&self, factory: &EvmAddress, implementation: &EvmAddress) -> EvmAddress {
        let init_code = [&PROXY_PREFIX[..], &implementation.0[..], &PROXY_SUFFIX[..]].concat();
        let preimage = [
            &[0xff][..],
            &factory.0[..],
            &self.hash().0[..],
            &keccak256(&init_code)[..],
        ]
        .concat();
        let digest = keccak256(&preimage);
        let mut address = [0u8; 20];
        address.copy_from_slice(&digest[12..]);
        EvmAddress(address)
    }
}

impl EscrowImmutables for EvmImmutables {
    type Address = EvmAddress;

    fn order_hash_bytes(&self) -> [u8; 32] {
        self.order_hash.0
    }

    fn hashlock_bytes(&self) -> [u8; 32] {
        self.hashlock.0
    }

    fn maker(&self) -> EvmAddress {
        self.maker
    }

    fn taker(&self) -> EvmAddress {
        self.taker
    }

    fn token(&self) -> EvmAddress {
        self.token
    }

    fn amount(&self) -> Uint256 {
        self.amount
    }

    fn safety_deposit(&self) -> Uint256 {
        self.safety_deposit
    }

    fn timelocks(&self) -> Timelocks {
        self.timelocks
    }

    fn record(&self) -> RecordedImmutables {
        RecordedImmutables::Evm(*self)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StarknetImmutables {
    pub order_hash: StarkFelt,
    pub hash_lock: StarkFelt,
    pub maker: StarkFelt,
    pub taker: StarkFelt,
    pub token: StarkFelt,
    pub amount: U256Limbs,
    pub safety_deposit: U256Limbs,
    pub timelocks: Timelocks,
}

impl StarknetImmutables {
    /// Cairo serialisation of the `Immutables` struct.
    pub fn to_calldata(&self) -> Vec<StarkFelt> {
        let [amount_low, amount_high] = self.amount.to_felts();
        let [deposit_low, deposit_high] = self.safety_deposit.to_felts();
        let mut felts = vec![
            self.order_hash,
            self.hash_lock,
            self.maker,
            self.taker,
            self.token,
            amount_low,
            amount_high,
            deposit_low,
            deposit_high,
            StarkFelt::from_u64(self.timelocks.deployed_at()),
        ];
        felts.extend(
            Stage::ALL
                .iter()
                .map(|stage| StarkFelt::from_u64(self.timelocks.offset(*stage) as u64)),
        );
        felts
    }

    pub fn from_calldata(felts: &[StarkFelt]) -> Result<Self, SwapError> {
        if felts.len() < STARKNET_IMMUTABLES_FELTS {
            return Err(SwapError::MalformedEvent(format!(
                "immutables need {STARKNET_IMMUTABLES_FELTS} felts, got {}",
                felts.len()
            )));
        }
        let small = |felt: &StarkFelt| {
            felt.to_u64()
                .and_then(|value| u32::try_from(value).ok())
                .ok_or_else(|| SwapError::MalformedEvent(format!("{felt} is not a u32")))
        };
        let mut offsets = [0u32; 7];
        for (slot, felt) in offsets.iter_mut().zip(&felts[10..17]) {
            *slot = small(felt)?;
        }
        let deployed_at = small(&felts[9])?;
        Ok(Self {
            order_hash: felts[0],
            hash_lock: felts[1],
            maker: felts[2],
            taker: felts[3],
            token: felts[4],
            amount: U256Limbs::from_felts(&felts[5], &felts[6])?,
            safety_deposit: U256Limbs::from_felts(&felts[7], &felts[8])?,
            timelocks: Timelocks::pack(&TimelockOffsets::from_array(offsets), deployed_at),
        })
    }

    pub fn hash(&self) -> StarkFelt {
        let felts: Vec<_> = self.to_calldata().iter().map(StarkFelt::to_felt).collect();
        StarkFelt::from_felt(poseidon_hash_many(&felts))
    }

    pub fn with_timelocks(self, timelocks: Timelocks) -> Self {
        Self { timelocks, ..self }
    }
}

impl EscrowImmutables for StarknetImmutables {
    type Address = StarkFelt;

    fn order_hash_bytes(&self) -> [u8; 32] {
        self.order_hash.0
    }

    fn hashlock_bytes(&self) -> [u8; 32] {
        self.hash_lock.0
    }

    fn maker(&self) -> StarkFelt {
        self.maker
    }

    fn taker(&self) -> StarkFelt {
        self.taker
    }

    fn token(&self) -> StarkFelt {
        self.token
    }

    fn amount(&self) -> Uint256 {
        self.amount.into()
    }

    fn safety_deposit(&self) -> Uint256 {
        self.safety_deposit.into()
    }

    fn timelocks(&self) -> Timelocks {
        self.timelocks
    }

    fn record(&self) -> RecordedImmutables {
        RecordedImmutables::Starknet(*self)
    }
}

/// Immutables exactly as an escrow was deployed with, kept for withdrawal
/// and cancellation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordedImmutables {
    Evm(EvmImmutables),
    Starknet(StarknetImmutables),
}

impl RecordedImmutables {
    pub fn timelocks(&self) -> Timelocks {
        match self {
            RecordedImmutables::Evm(immutables) => immutables.timelocks,
            RecordedImmutables::Starknet(immutables) => immutables.timelocks,
        }
    }
}

/// EVM order hashes are 256-bit; Starknet takes them modulo `2^251 - 1`.
pub fn evm_order_hash_to_felt(order_hash: &Hash32) -> StarkFelt {
    let mut modulus = [0xff; 32];
    modulus[0] = 0x07;
    let reduced = order_hash.to_uint() % Uint256::from_be_bytes(modulus);
    StarkFelt(reduced.to_be_bytes())
}

pub fn starknet_order_hash_to_bytes32(order_hash: &StarkFelt) -> Hash32 {
    Hash32(order_hash.0)
}

pub fn build_evm_source(
    order: &EvmOrder,
    order_hash: Hash32,
    hashlock: &Hashlock,
    taker: EvmAddress,
    safety_deposit: Uint256,
    offsets: &TimelockOffsets,
) -> Result<EvmImmutables, SwapError> {
    offsets.validate()?;
    Ok(EvmImmutables {
        order_hash,
        hashlock: hashlock.evm(),
        maker: order.maker,
        taker,
        token: order.maker_asset,
        amount: order.making_amount,
        safety_deposit,
        timelocks: Timelocks::pack(offsets, 0),
    })
}

pub fn build_starknet_source(
    order: &StarknetOrder,
    hashlock: &Hashlock,
    taker: StarkFelt,
    safety_deposit: Uint256,
    offsets: &TimelockOffsets,
) -> Result<StarknetImmutables, SwapError> {
    offsets.validate()?;
    Ok(StarknetImmutables {
        order_hash: order.order_hash(),
        hash_lock: hashlock.starknet(),
        maker: order.maker,
        taker,
        token: order.maker_asset,
        amount: order.making_amount,
        safety_deposit: safety_deposit.into(),
        timelocks: Timelocks::pack(offsets, 0),
    })
}

/// Destination immutables for an EVM order filled on Starknet. Fails before
/// anything is built when the re-based schedule is unusable.
pub fn build_starknet_destination(
    order_hash: &Hash32,
    hashlock: &Hashlock,
    parties: Parties<StarkFelt>,
    amount: Uint256,
    safety_deposit: Uint256,
    offsets: &TimelockOffsets,
    src_cancellation: u64,
) -> Result<(StarknetImmutables, DstTimelocks), SwapError> {
    offsets.validate()?;
    let schedule = rebase_destination(offsets, src_cancellation)?;
    let immutables = StarknetImmutables {
        order_hash: evm_order_hash_to_felt(order_hash),
        hash_lock: hashlock.starknet(),
        maker: parties.maker,
        taker: parties.taker,
        token: parties.token,
        amount: amount.into(),
        safety_deposit: safety_deposit.into(),
        timelocks: Timelocks::pack(offsets, 0),
    };
    Ok((immutables, schedule))
}

pub fn build_evm_destination(
    order_hash: &StarkFelt,
    hashlock: &Hashlock,
    parties: Parties<EvmAddress>,
    amount: Uint256,
    safety_deposit: Uint256,
    offsets: &TimelockOffsets,
    src_cancellation: u64,
) -> Result<(EvmImmutables, DstTimelocks), SwapError> {
    offsets.validate()?;
    let schedule = rebase_destination(offsets, src_cancellation)?;
    let immutables = EvmImmutables {
        order_hash: starknet_order_hash_to_bytes32(order_hash),
        hashlock: hashlock.evm(),
        maker: parties.maker,
        taker: parties.taker,
        token: parties.token,
        amount,
        safety_deposit,
        timelocks: Timelocks::pack(offsets, 0),
    };
    Ok((immutables, schedule))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hashlock::Secret;

    fn sample_evm() -> EvmImmutables {
        EvmImmutables {
            order_hash: Hash32([0x11; 32]),
            hashlock: Hash32([0x22; 32]),
            maker: EvmAddress([0x33; 20]),
            taker: EvmAddress([0x44; 20]),
            token: EvmAddress([0x55; 20]),
            amount: Uint256::from(100u128),
            safety_deposit: Uint256::from(110_000_000_000_000u128),
            timelocks: Timelocks::pack(&TimelockOffsets::default(), 1_700_000_000),
        }
    }

    fn sample_starknet() -> StarknetImmutables {
        StarknetImmutables {
            order_hash: StarkFelt::from_u64(1),
            hash_lock: StarkFelt::from_u64(2),
            maker: StarkFelt::from_u64(3),
            taker: StarkFelt::from_u64(4),
            token: StarkFelt::from_u64(5),
            amount: Uint256::MAX.into(),
            safety_deposit: Uint256::from(7u128).into(),
            timelocks: Timelocks::pack(&TimelockOffsets::default(), 99),
        }
    }

    #[test]
    fn evm_encoding_is_idempotent() {
        let immutables = sample_evm();
        let encoded = immutables.abi_encode();
        assert_eq!(encoded.len(), 256);
        assert_eq!(encoded, sample_evm().abi_encode());
        assert_eq!(immutables.hash(), sample_evm().hash());
        assert_eq!(&encoded[64 + 12..96], &[0x33; 20]);
        assert_eq!(EvmImmutables::abi_decode(&encoded).unwrap(), immutables);
    }

    #[test]
    fn evm_decode_rejects_short_data() {
        let encoded = sample_evm().abi_encode();
        assert!(matches!(
            EvmImmutables::abi_decode(&encoded[..200]),
            Err(SwapError::MalformedEvent(_))
        ));
    }

    #[test]
    fn escrow_address_depends_on_timelocks() {
        let factory = EvmAddress([0xa7; 20]);
        let implementation = EvmAddress([0x01; 20]);
        let immutables = sample_evm();
        let address = immutables.escrow_address(&factory, &implementation);
        assert_eq!(address, sample_evm().escrow_address(&factory, &implementation));

        let moved = immutables
            .with_timelocks(immutables.timelocks.anchor(1_700_000_001).unwrap())
            .escrow_address(&factory, &implementation);
        assert_ne!(address, moved);
    }

    #[test]
    fn starknet_calldata_layout() {
        let immutables = sample_starknet();
        let calldata = immutables.to_calldata();
        assert_eq!(calldata.len(), STARKNET_IMMUTABLES_FELTS);
        assert_eq!(calldata[5], StarkFelt::from_u128(u128::MAX));
        assert_eq!(calldata[6], StarkFelt::from_u128(u128::MAX));
        assert_eq!(calldata[9], StarkFelt::from_u64(99));
        assert_eq!(calldata[16], StarkFelt::from_u64(402));
        assert_eq!(StarknetImmutables::from_calldata(&calldata).unwrap(), immutables);
        assert_eq!(immutables.hash(), sample_starknet().hash());
    }

    #[test]
    fn order_hash_reduction_stays_below_modulus() {
        let felt = evm_order_hash_to_felt(&Hash32([0xff; 32]));
        assert!(felt.0[0] < 0x08);
        assert!(StarkFelt::from_bytes_be(felt.0).is_ok());

        let small = Hash32::from_uint(Uint256::from(12345u128));
        assert_eq!(evm_order_hash_to_felt(&small), StarkFelt::from_u64(12345));
        assert_eq!(
            starknet_order_hash_to_bytes32(&StarkFelt::from_u64(9)).to_uint(),
            Uint256::from(9u128)
        );
    }

    #[test]
    fn destination_builder_fails_on_elapsed_source() {
        let secret = Secret::random();
        let hashlock = Hashlock::from_secret(&secret);
        let parties = Parties {
            maker: StarkFelt::from_u64(1),
            taker: StarkFelt::from_u64(2),
            token: StarkFelt::from_u64(3),
        };
        let err = build_starknet_destination(
            &Hash32([1; 32]),
            &hashlock,
            parties,
            Uint256::one(),
            Uint256::zero(),
            &TimelockOffsets::default(),
            0,
        )
        .unwrap_err();
        assert!(matches!(err, SwapError::NegativeTimelockOffset { .. }));

        let (immutables, schedule) = build_starknet_destination(
            &Hash32([1; 32]),
            &hashlock,
            parties,
            Uint256::one(),
            Uint256::zero(),
            &TimelockOffsets::default(),
            10_642,
        )
        .unwrap();
        assert_eq!(immutables.hash_lock, hashlock.starknet());
        assert_eq!(immutables.timelocks.deployed_at(), 0);
        assert_eq!(schedule.anchor, 10_000);
    }
}
