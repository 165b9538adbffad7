use sylvia::cw_std::{StdError, Uint256};
use thiserror::Error;

use crate::orchestrator::SwapPhase;

/// Transport-level failure talking to a chain. Reverts are not errors at this
/// level: they come back as receipts with `success == false`.
#[derive(Error, Debug, PartialEq)]
pub enum ChainError {
    #[error("rpc request failed: {0}")]
    Rpc(String),

    #[error("transaction {0} was not confirmed")]
    Unconfirmed(String),

    #[error("unsupported call: {0}")]
    Unsupported(String),
}

#[derive(Error, Debug, PartialEq)]
pub enum SwapError {
    #[error("{0}")]
    Std(#[from] StdError),

    #[error("chain error: {0}")]
    Chain(#[from] ChainError),

    // Preconditions, detected before anything is submitted.
    #[error("insufficient balance of {token} for {owner}: have {have}, need {need}")]
    InsufficientFunds {
        token: String,
        owner: String,
        have: Uint256,
        need: Uint256,
    },

    #[error("insufficient allowance of {token} from {owner} to {spender}: have {have}, need {need}")]
    InsufficientAllowance {
        token: String,
        owner: String,
        spender: String,
        have: Uint256,
        need: Uint256,
    },

    #[error("invalid {chain} address: {value}")]
    InvalidAddress { chain: &'static str, value: String },

    #[error("invalid hex value: {0}")]
    InvalidHex(String),

    #[error("invalid amount: {0}")]
    InvalidAmount(String),

    #[error("amount must be positive: {0}")]
    NonPositiveAmount(String),

    #[error("invalid timelock ordering: {0}")]
    InvalidTimelockOrdering(&'static str),

    #[error("timestamp {0} does not fit the packed timelock layout")]
    TimestampOverflow(u64),

    #[error("source cancellation {src_cancellation} is earlier than its own offset {offset}")]
    NegativeTimelockOffset { src_cancellation: u64, offset: u64 },

    #[error("destination cancellation {dst_cancellation} is not before source cancellation {src_cancellation}")]
    DestinationOutlivesSource {
        dst_cancellation: u64,
        src_cancellation: u64,
    },

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("usage: {0}")]
    Usage(String),

    // Deployment.
    #[error("approval on {chain} failed in tx {tx_hash}")]
    ApprovalFailed { chain: &'static str, tx_hash: String },

    #[error("escrow deployment on {chain} failed in tx {tx_hash}")]
    EscrowDeploymentFailed { chain: &'static str, tx_hash: String },

    #[error("source deploy event {event} not found in tx {tx_hash}")]
    DeployEventNotFound { event: String, tx_hash: String },

    #[error("destination escrow event {event} not found in tx {tx_hash}")]
    TargetEventNotFound { event: String, tx_hash: String },

    #[error("malformed event: {0}")]
    MalformedEvent(String),

    #[error("immutables emitted by the factory do not match the ones built for order {order_hash}")]
    ImmutablesMismatch { order_hash: String },

    /// The deploy transaction was mined, so the maker's funds are locked,
    /// but the escrow it created could not be confirmed.
    #[error("source escrow funded in tx {tx_hash} but not confirmed: {source}")]
    SourceUnconfirmed {
        tx_hash: String,
        escrow: Option<String>,
        source: Box<SwapError>,
    },

    // Withdrawal.
    #[error("withdrawal window of {leg} opens at {opens_at}, chain time is {now}")]
    WithdrawalWindowNotOpen { leg: String, opens_at: u64, now: u64 },

    #[error("withdrawal window of {leg} closed at {closed_at}, chain time is {now}")]
    WithdrawalWindowClosed { leg: String, closed_at: u64, now: u64 },

    #[error("withdrawal from {leg} reverted in tx {tx_hash}")]
    WithdrawalReverted { leg: String, tx_hash: String },

    #[error("secret is public but {leg} could not be withdrawn after {attempts} attempts: {last_error}")]
    CounterpartWithdrawalStuck {
        leg: String,
        attempts: u32,
        last_error: String,
    },

    // Orchestration.
    #[error("invalid swap transition from {from:?} to {to:?}")]
    InvalidTransition { from: SwapPhase, to: SwapPhase },

    #[error("unknown swap {0}")]
    UnknownSwap(String),

    #[error("swap halted in phase {phase:?}: {source}")]
    Halted {
        phase: SwapPhase,
        source: Box<SwapError>,
    },
}

impl SwapError {
    /// Errors raised locally before any transaction was submitted.
    pub fn is_precondition(&self) -> bool {
        match self {
            SwapError::InsufficientFunds { .. }
            | SwapError::InsufficientAllowance { .. }
            | SwapError::InvalidAddress { .. }
            | SwapError::InvalidHex(_)
            | SwapError::InvalidAmount(_)
            | SwapError::NonPositiveAmount(_)
            | SwapError::InvalidTimelockOrdering(_)
            | SwapError::TimestampOverflow(_)
            | SwapError::NegativeTimelockOffset { .. }
            | SwapError::DestinationOutlivesSource { .. }
            | SwapError::InvalidConfig(_)
            | SwapError::Usage(_)
            | SwapError::WithdrawalWindowNotOpen { .. } => true,
            SwapError::Halted { source, .. } => source.is_precondition(),
            _ => false,
        }
    }

    /// The innermost cause, unwrapping orchestrator halts.
    pub fn root(&self) -> &SwapError {
        match self {
            SwapError::Halted { source, .. } | SwapError::SourceUnconfirmed { source, .. } => {
                source.root()
            }
            other => other,
        }
    }
}
