use cw_storage_plus::Map;
use serde::{Deserialize, Serialize};
use sylvia::cw_std::{MemoryStorage, Order, StdResult, Storage};

use crate::error::SwapError;
use crate::hashlock::Hashlock;
use crate::immutables::RecordedImmutables;
use crate::orchestrator::SwapPhase;

const SWAPS: Map<&[u8], SwapRecord> = Map::new("swaps");

/// One deployed escrow as the journal remembers it.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LegRecord {
    pub chain: String,
    pub escrow: String,
    pub tx_hash: String,
    pub immutables: RecordedImmutables,
    pub cancellation_at: u64,
}

/// A source deploy that was submitted but whose escrow could not be read
/// back. The maker's funds may be locked in it.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnconfirmedLeg {
    pub chain: String,
    pub tx_hash: String,
    pub escrow: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct WithdrawalRecord {
    pub src_tx: String,
    pub dst_tx: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SwapRecord {
    pub order_hash: String,
    pub route: String,
    pub phase: SwapPhase,
    pub hashlock: Hashlock,
    pub src: Option<LegRecord>,
    pub src_unconfirmed: Option<UnconfirmedLeg>,
    pub dst: Option<LegRecord>,
    pub withdrawals: Option<WithdrawalRecord>,
    pub failure: Option<String>,
}

impl SwapRecord {
    pub fn new(order_hash: String, route: &str, hashlock: Hashlock) -> Self {
        Self {
            order_hash,
            route: route.to_string(),
            phase: SwapPhase::OrderSigned,
            hashlock,
            src: None,
            src_unconfirmed: None,
            dst: None,
            withdrawals: None,
            failure: None,
        }
    }

    /// A source deploy went out, so funds may be locked.
    pub fn source_submitted(&self) -> bool {
        self.src.is_some() || self.src_unconfirmed.is_some()
    }

    /// Funds are locked and the swap halted: someone has to cancel once the
    /// cancellation windows open.
    pub fn needs_cancellation(&self) -> bool {
        self.source_submitted() && self.phase != SwapPhase::Withdrawn && self.failure.is_some()
    }
}

/// Swap records keyed by order hash.
pub struct SwapJournal<S = MemoryStorage> {
    storage: S,
}

impl Default for SwapJournal<MemoryStorage> {
    fn default() -> Self {
        Self::new(MemoryStorage::new())
    }
}

impl<S: Storage> SwapJournal<S> {
    pub fn new(storage: S) -> Self {
        Self { storage }
    }

    pub fn save(&mut self, key: &[u8; 32], record: &SwapRecord) -> StdResult<()> {
        SWAPS.save(&mut self.storage, key.as_slice(), record)
    }

    pub fn may_load(&self, key: &[u8; 32]) -> StdResult<Option<SwapRecord>> {
        SWAPS.may_load(&self.storage, key.as_slice())
    }

    pub fn load(&self, key: &[u8; 32]) -> Result<SwapRecord, SwapError> {
        self.may_load(key)?
            .ok_or_else(|| SwapError::UnknownSwap(format!("0x{}", hex::encode(key))))
    }

    pub fn records(&self) -> StdResult<Vec<SwapRecord>> {
        SWAPS
            .range(&self.storage, None, None, Order::Ascending)
            .map(|item| item.map(|(_, record)| record))
            .collect()
    }

    pub fn pending_cancellations(&self) -> StdResult<Vec<SwapRecord>> {
        Ok(self
            .records()?
            .into_iter()
            .filter(SwapRecord::needs_cancellation)
            .collect())
    }

    pub fn into_storage(self) -> S {
        self.storage
    }
}
