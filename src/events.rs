use sylvia::cw_std::Uint256;

use crate::chain::{EvmLog, StarknetEvent};
use crate::error::SwapError;
use crate::immutables::{EvmImmutables, EVM_IMMUTABLES_WORDS};
use crate::states::{keccak256, read_word, EvmAddress, Hash32, StarkFelt};
use crate::timelocks::Stage;

pub const SRC_ESCROW_CREATED_SIGNATURE: &str = "SrcEscrowCreated((bytes32,bytes32,uint256,uint256,uint256,uint256,uint256,uint256),(uint256,uint256,uint256,uint256,uint256))";

/// `DstEscrowCreated(address,bytes32,uint256)`
pub const DST_ESCROW_CREATED_TOPIC: Hash32 = Hash32([
    0xc3, 0x0e, 0x11, 0x1d, 0xcc, 0x74, 0xfd, 0xdc, 0x2c, 0x3a, 0x4d, 0x98, 0xff, 0xb9, 0x7a, 0xde,
    0xc4, 0x48, 0x5c, 0x0a, 0x68, 0x79, 0x46, 0xbf, 0x5b, 0x22, 0xc2, 0xa9, 0x9c, 0x7f, 0xf9, 0x6d,
]);

/// Key of the resolver's source escrow deployment event.
pub const STARKNET_SRC_DEPLOYED_KEY: StarkFelt = StarkFelt([
    0x00, 0xf3, 0x23, 0x84, 0x50, 0x26, 0xb2, 0xbe, 0x2d, 0xa8, 0x2f, 0xc1, 0x64, 0x76, 0x96, 0x1f,
    0x81, 0x0f, 0x27, 0x90, 0x69, 0xce, 0x9e, 0x12, 0x8e, 0xab, 0xc1, 0x02, 0x3a, 0x87, 0xad, 0xe0,
]);

/// Key of the resolver's destination escrow deployment event.
pub const STARKNET_DST_DEPLOYED_KEY: StarkFelt = StarkFelt([
    0x02, 0x52, 0xbc, 0xf5, 0xa9, 0x00, 0x92, 0x53, 0x34, 0x54, 0xac, 0x4a, 0x06, 0x89, 0x0f, 0xf6,
    0x04, 0x7c, 0x24, 0xae, 0xa8, 0x87, 0x0f, 0x52, 0x6e, 0x24, 0xda, 0x47, 0xfd, 0xfc, 0x31, 0x31,
]);

pub fn src_escrow_created_topic() -> Hash32 {
    Hash32(keccak256(SRC_ESCROW_CREATED_SIGNATURE.as_bytes()))
}

fn word(data: &[u8], index: usize, event: &str) -> Result<[u8; 32], SwapError> {
    read_word(data, index)
        .ok_or_else(|| SwapError::MalformedEvent(format!("{event}: missing word {index}")))
}

/// What the destination escrow needs beyond the source immutables. Address
/// fields are raw words since the destination may not be an EVM chain.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DstImmutablesComplement {
    pub maker: Hash32,
    pub amount: Uint256,
    pub token: Hash32,
    pub safety_deposit: Uint256,
    pub chain_id: Uint256,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SrcEscrowCreated {
    pub immutables: EvmImmutables,
    pub complement: DstImmutablesComplement,
}

impl SrcEscrowCreated {
    pub fn decode(log: &EvmLog) -> Result<Self, SwapError> {
        let immutables = EvmImmutables::abi_decode(&log.data)?;
        let at = |offset: usize| word(&log.data, EVM_IMMUTABLES_WORDS + offset, "SrcEscrowCreated");
        let complement = DstImmutablesComplement {
            maker: Hash32(at(0)?),
            amount: Uint256::from_be_bytes(at(1)?),
            token: Hash32(at(2)?),
            safety_deposit: Uint256::from_be_bytes(at(3)?),
            chain_id: Uint256::from_be_bytes(at(4)?),
        };
        Ok(Self {
            immutables,
            complement,
        })
    }

    pub fn to_log(&self, factory: EvmAddress) -> EvmLog {
        let mut data = self.immutables.abi_encode();
        for word in [
            self.complement.maker.0,
            self.complement.amount.to_be_bytes(),
            self.complement.token.0,
            self.complement.safety_deposit.to_be_bytes(),
            self.complement.chain_id.to_be_bytes(),
        ] {
            data.extend_from_slice(&word);
        }
        EvmLog {
            address: factory,
            topics: vec![src_escrow_created_topic()],
            data,
        }
    }

    /// Source cancellation instant of the escrow that emitted this event.
    pub fn src_cancellation(&self) -> u64 {
        self.immutables.timelocks.get(Stage::SrcCancellation)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DstEscrowCreated {
    pub escrow: EvmAddress,
    pub hashlock: Hash32,
    pub taker: Hash32,
}

impl DstEscrowCreated {
    pub fn decode(log: &EvmLog) -> Result<Self, SwapError> {
        Ok(Self {
            escrow: EvmAddress::from_word(&word(&log.data, 0, "DstEscrowCreated")?)?,
            hashlock: Hash32(word(&log.data, 1, "DstEscrowCreated")?),
            taker: Hash32(word(&log.data, 2, "DstEscrowCreated")?),
        })
    }

    pub fn to_log(&self, factory: EvmAddress) -> EvmLog {
        EvmLog {
            address: factory,
            topics: vec![DST_ESCROW_CREATED_TOPIC],
            data: [self.escrow.to_word(), self.hashlock.0, self.taker.0].concat(),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StarknetSrcDeployed {
    pub escrow: StarkFelt,
    pub cancellation: u64,
}

impl StarknetSrcDeployed {
    pub fn decode(event: &StarknetEvent) -> Result<Self, SwapError> {
        let (escrow, cancellation) = match event.data.as_slice() {
            [escrow, cancellation, ..] => (*escrow, cancellation),
            _ => {
                return Err(SwapError::MalformedEvent(
                    "source deploy event needs escrow and cancellation".to_string(),
                ))
            }
        };
        let cancellation = cancellation.to_u64().ok_or_else(|| {
            SwapError::MalformedEvent(format!("cancellation {cancellation} is not a timestamp"))
        })?;
        Ok(Self {
            escrow,
            cancellation,
        })
    }

    pub fn to_event(&self, resolver: StarkFelt) -> StarknetEvent {
        StarknetEvent {
            from_address: resolver,
            keys: vec![STARKNET_SRC_DEPLOYED_KEY],
            data: vec![self.escrow, StarkFelt::from_u64(self.cancellation)],
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StarknetDstDeployed {
    pub escrow: StarkFelt,
}

impl StarknetDstDeployed {
    pub fn decode(event: &StarknetEvent) -> Result<Self, SwapError> {
        event
            .data
            .first()
            .map(|escrow| Self { escrow: *escrow })
            .ok_or_else(|| SwapError::MalformedEvent("destination deploy event is empty".to_string()))
    }

    pub fn to_event(&self, resolver: StarkFelt) -> StarknetEvent {
        StarknetEvent {
            from_address: resolver,
            keys: vec![STARKNET_DST_DEPLOYED_KEY],
            data: vec![self.escrow],
        }
    }
}
