use std::fmt::Display;

use sylvia::cw_schema::cw_serde;
use sylvia::cw_std::Uint256;

use crate::error::SwapError;
use crate::immutables::EscrowImmutables;
use crate::timelocks::{Stage, Timelocks};

pub mod destination;
pub mod source;

pub use destination::{DestinationEscrowDeployer, EvmDestinationDeployer, StarknetDestinationDeployer};
pub use source::{EvmSourceDeployer, SourceEscrowDeployer, StarknetSourceDeployer};

pub const OPTIMISM: &str = "optimism";
pub const STARKNET: &str = "starknet";

#[cw_serde(crate = "sylvia")]
#[derive(Copy, Eq)]
pub enum EscrowRole {
    Source,
    Destination,
}

impl EscrowRole {
    pub fn withdrawal_stage(self) -> Stage {
        match self {
            EscrowRole::Source => Stage::SrcWithdrawal,
            EscrowRole::Destination => Stage::DstWithdrawal,
        }
    }

    pub fn cancellation_stage(self) -> Stage {
        match self {
            EscrowRole::Source => Stage::SrcCancellation,
            EscrowRole::Destination => Stage::DstCancellation,
        }
    }
}

/// A funded escrow together with the immutables it was deployed with,
/// timelocks anchored to its deployment.
#[derive(Clone, Debug, PartialEq)]
pub struct EscrowDeployment<I: EscrowImmutables> {
    pub escrow: I::Address,
    pub immutables: I,
    pub tx_hash: String,
    pub role: EscrowRole,
}

impl<I: EscrowImmutables> EscrowDeployment<I> {
    pub fn timelocks(&self) -> Timelocks {
        self.immutables.timelocks()
    }

    pub fn withdrawal_at(&self) -> u64 {
        self.timelocks().get(self.role.withdrawal_stage())
    }

    pub fn cancellation_at(&self) -> u64 {
        self.timelocks().get(self.role.cancellation_stage())
    }
}

pub(crate) fn ensure_balance(
    token: impl Display,
    owner: impl Display,
    have: Uint256,
    need: Uint256,
) -> Result<(), SwapError> {
    if have < need {
        return Err(SwapError::InsufficientFunds {
            token: token.to_string(),
            owner: owner.to_string(),
            have,
            need,
        });
    }
    Ok(())
}

pub(crate) fn ensure_allowance(
    token: impl Display,
    owner: impl Display,
    spender: impl Display,
    have: Uint256,
    need: Uint256,
) -> Result<(), SwapError> {
    if have < need {
        return Err(SwapError::InsufficientAllowance {
            token: token.to_string(),
            owner: owner.to_string(),
            spender: spender.to_string(),
            have,
            need,
        });
    }
    Ok(())
}
