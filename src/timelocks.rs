use serde::{Deserialize, Serialize};
use sylvia::cw_schema::cw_serde;
use sylvia::cw_std::Uint256;

use crate::error::SwapError;

#[cw_serde(crate = "sylvia")]
#[derive(Copy, Eq, Hash, PartialOrd, Ord)]
pub enum Stage {
    SrcWithdrawal,
    SrcPublicWithdrawal,
    SrcCancellation,
    SrcPublicCancellation,
    DstWithdrawal,
    DstPublicWithdrawal,
    DstCancellation,
}

impl Stage {
    pub const ALL: [Stage; 7] = [
        Stage::SrcWithdrawal,
        Stage::SrcPublicWithdrawal,
        Stage::SrcCancellation,
        Stage::SrcPublicCancellation,
        Stage::DstWithdrawal,
        Stage::DstPublicWithdrawal,
        Stage::DstCancellation,
    ];

    pub fn index(self) -> usize {
        self as usize
    }
}

/// Stage offsets in seconds, relative to the escrow deployment.
#[cw_serde(crate = "sylvia")]
#[derive(Copy, Eq)]
pub struct TimelockOffsets {
    pub src_withdrawal: u32,
    pub src_public_withdrawal: u32,
    pub src_cancellation: u32,
    pub src_public_cancellation: u32,
    pub dst_withdrawal: u32,
    pub dst_public_withdrawal: u32,
    pub dst_cancellation: u32,
}

impl Default for TimelockOffsets {
    fn default() -> Self {
        Self {
            src_withdrawal: 5,
            src_public_withdrawal: 440,
            src_cancellation: 642,
            src_public_cancellation: 644,
            dst_withdrawal: 5,
            dst_public_withdrawal: 400,
            dst_cancellation: 402,
        }
    }
}

impl TimelockOffsets {
    pub fn get(&self, stage: Stage) -> u32 {
        match stage {
            Stage::SrcWithdrawal => self.src_withdrawal,
            Stage::SrcPublicWithdrawal => self.src_public_withdrawal,
            Stage::SrcCancellation => self.src_cancellation,
            Stage::SrcPublicCancellation => self.src_public_cancellation,
            Stage::DstWithdrawal => self.dst_withdrawal,
            Stage::DstPublicWithdrawal => self.dst_public_withdrawal,
            Stage::DstCancellation => self.dst_cancellation,
        }
    }

    pub fn from_array(values: [u32; 7]) -> Self {
        Self {
            src_withdrawal: values[0],
            src_public_withdrawal: values[1],
            src_cancellation: values[2],
            src_public_cancellation: values[3],
            dst_withdrawal: values[4],
            dst_public_withdrawal: values[5],
            dst_cancellation: values[6],
        }
    }

    pub fn validate(&self) -> Result<(), SwapError> {
        if !(self.src_withdrawal < self.src_public_withdrawal
            && self.src_public_withdrawal < self.src_cancellation
            && self.src_cancellation < self.src_public_cancellation)
        {
            return Err(SwapError::InvalidTimelockOrdering(
                "source stages must be strictly increasing",
            ));
        }
        if !(self.dst_withdrawal < self.dst_public_withdrawal
            && self.dst_public_withdrawal < self.dst_cancellation)
        {
            return Err(SwapError::InvalidTimelockOrdering(
                "destination stages must be strictly increasing",
            ));
        }
        if self.dst_cancellation >= self.src_cancellation {
            return Err(SwapError::InvalidTimelockOrdering(
                "destination cancellation must come before source cancellation",
            ));
        }
        Ok(())
    }
}

const DEPLOYED_AT_SLOT: usize = 7;

fn slot_range(slot: usize) -> std::ops::Range<usize> {
    let end = 32 - 4 * slot;
    end - 4..end
}

/// Packed schedule as the escrow factory stores it: stage `i` in bits
/// `[32i, 32i + 32)`, deployment timestamp in the top 32 bits.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Timelocks(pub Uint256);

impl Timelocks {
    pub fn pack(offsets: &TimelockOffsets, deployed_at: u32) -> Self {
        let mut bytes = [0u8; 32];
        for stage in Stage::ALL {
            bytes[slot_range(stage.index())].copy_from_slice(&offsets.get(stage).to_be_bytes());
        }
        bytes[slot_range(DEPLOYED_AT_SLOT)].copy_from_slice(&deployed_at.to_be_bytes());
        Self(Uint256::from_be_bytes(bytes))
    }

    fn read_slot(&self, slot: usize) -> u32 {
        let bytes = self.0.to_be_bytes();
        let mut value = [0u8; 4];
        value.copy_from_slice(&bytes[slot_range(slot)]);
        u32::from_be_bytes(value)
    }

    /// Replaces only the deployment timestamp.
    pub fn anchor(self, deployed_at: u64) -> Result<Self, SwapError> {
        let deployed_at =
            u32::try_from(deployed_at).map_err(|_| SwapError::TimestampOverflow(deployed_at))?;
        let mut bytes = self.0.to_be_bytes();
        bytes[slot_range(DEPLOYED_AT_SLOT)].copy_from_slice(&deployed_at.to_be_bytes());
        Ok(Self(Uint256::from_be_bytes(bytes)))
    }

    pub fn deployed_at(&self) -> u64 {
        self.read_slot(DEPLOYED_AT_SLOT) as u64
    }

    pub fn offset(&self, stage: Stage) -> u32 {
        self.read_slot(stage.index())
    }

    /// Absolute instant of `stage`. Both terms are 32-bit so the sum cannot overflow.
    pub fn get(&self, stage: Stage) -> u64 {
        self.deployed_at() + self.offset(stage) as u64
    }

    pub fn offsets(&self) -> TimelockOffsets {
        let mut values = [0u32; 7];
        for stage in Stage::ALL {
            values[stage.index()] = self.offset(stage);
        }
        TimelockOffsets::from_array(values)
    }

    pub fn to_uint(&self) -> Uint256 {
        self.0
    }
}

/// Absolute destination instants derived from the observed source cancellation.
#[cw_serde(crate = "sylvia")]
#[derive(Copy, Eq)]
pub struct DstTimelocks {
    pub anchor: u64,
    pub withdrawal: u64,
    pub public_withdrawal: u64,
    pub cancellation: u64,
}

impl DstTimelocks {
    /// Seconds between destination and source cancellation.
    pub fn margin(&self, src_cancellation: u64) -> u64 {
        src_cancellation.saturating_sub(self.cancellation)
    }
}

/// Re-bases the destination schedule onto the source deployment instant,
/// recovered as `src_cancellation - offsets.src_cancellation`.
pub fn rebase_destination(
    offsets: &TimelockOffsets,
    src_cancellation: u64,
) -> Result<DstTimelocks, SwapError> {
    let anchor = src_cancellation
        .checked_sub(offsets.src_cancellation as u64)
        .ok_or(SwapError::NegativeTimelockOffset {
            src_cancellation,
            offset: offsets.src_cancellation as u64,
        })?;
    let at = |stage: Stage| anchor + offsets.get(stage) as u64;
    let rebased = DstTimelocks {
        anchor,
        withdrawal: at(Stage::DstWithdrawal),
        public_withdrawal: at(Stage::DstPublicWithdrawal),
        cancellation: at(Stage::DstCancellation),
    };
    if rebased.cancellation >= src_cancellation {
        return Err(SwapError::DestinationOutlivesSource {
            dst_cancellation: rebased.cancellation,
            src_cancellation,
        });
    }
    Ok(rebased)
}

/// The factory refuses a destination escrow whose cancellation, counted
/// from the deployment block, would land after the source cancellation.
pub fn check_destination_deadline(
    offsets: &TimelockOffsets,
    now: u64,
    src_cancellation: u64,
) -> Result<(), SwapError> {
    let dst_cancellation = now.saturating_add(offsets.dst_cancellation as u64);
    if dst_cancellation > src_cancellation {
        return Err(SwapError::DestinationOutlivesSource {
            dst_cancellation,
            src_cancellation,
        });
    }
    Ok(())
}
