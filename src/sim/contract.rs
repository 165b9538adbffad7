use cw_storage_plus::Item;
use starknet_crypto::poseidon_hash_many;
use sylvia::contract;
use sylvia::ctx::{ExecCtx, InstantiateCtx, QueryCtx};
use sylvia::cw_schema::cw_serde;
use sylvia::cw_std::testing::{
    message_info, mock_dependencies, mock_env, MockApi, MockQuerier, MockStorage,
};
use sylvia::cw_std::{Addr, Env, HexBinary, OwnedDeps, Response, StdError, StdResult, Timestamp};
use thiserror::Error;

use crate::states::{keccak256, StarkFelt};

#[derive(Error, Debug, PartialEq)]
pub enum EscrowError {
    #[error("{0}")]
    Std(#[from] StdError),

    #[error("only the taker can withdraw")]
    OnlyTaker,

    #[error("escrow was already withdrawn")]
    AlreadyWithdrawn,

    #[error("withdrawal window opens at {opens_at}")]
    WithdrawTooEarly { opens_at: u64 },

    #[error("withdrawal window closed at {closed_at}")]
    WithdrawTooLate { closed_at: u64 },

    #[error("immutables do not match the escrow")]
    InvalidImmutables,

    #[error("secret does not match the hashlock")]
    InvalidSecret,
}

#[cw_serde(crate = "sylvia::cw_schema")]
#[derive(Copy, Eq)]
pub enum HashScheme {
    Keccak,
    Poseidon,
}

impl HashScheme {
    fn commit(self, secret: &[u8]) -> Option<[u8; 32]> {
        match self {
            HashScheme::Keccak => Some(keccak256(secret)),
            HashScheme::Poseidon => {
                let felt = StarkFelt::from_slice(secret).ok()?;
                Some(StarkFelt::from_felt(poseidon_hash_many(&[felt.to_felt()])).0)
            }
        }
    }
}

/// What an escrow is locked with: the digest of its immutables, the
/// hashlock and the taker's withdrawal window.
#[cw_serde(crate = "sylvia::cw_schema")]
pub struct EscrowTerms {
    pub digest: HexBinary,
    pub hashlock: HexBinary,
    pub scheme: HashScheme,
    pub taker: Addr,
    pub withdrawal: u64,
    pub cancellation: u64,
}

#[cw_serde(crate = "sylvia")]
pub struct EscrowStatus {
    pub withdrawn: bool,
    pub secret: Option<HexBinary>,
}

/// Escrow contract standing in for the deployed escrows of both chains.
pub struct EscrowContract {
    pub terms: Item<EscrowTerms>,
    pub revealed: Item<HexBinary>,
}

#[contract]
#[sv::error(EscrowError)]
impl EscrowContract {
    pub const fn new() -> Self {
        Self {
            terms: Item::new("terms"),
            revealed: Item::new("revealed"),
        }
    }

    #[sv::msg(instantiate)]
    pub fn instantiate(&self, ctx: InstantiateCtx, terms: EscrowTerms) -> Result<Response, EscrowError> {
        self.terms.save(ctx.deps.storage, &terms)?;
        Ok(Response::new().add_attribute("action", "instantiate"))
    }

    /// Taker only, inside `[withdrawal, cancellation)`.
    #[sv::msg(exec)]
    pub fn withdraw(
        &self,
        ctx: ExecCtx,
        secret: HexBinary,
        digest: HexBinary,
    ) -> Result<Response, EscrowError> {
        let terms = self.terms.load(ctx.deps.storage)?;
        if self.revealed.may_load(ctx.deps.storage)?.is_some() {
            return Err(EscrowError::AlreadyWithdrawn);
        }
        if ctx.info.sender != terms.taker {
            return Err(EscrowError::OnlyTaker);
        }

        let now = ctx.env.block.time.seconds();
        if now < terms.withdrawal {
            return Err(EscrowError::WithdrawTooEarly {
                opens_at: terms.withdrawal,
            });
        }
        if now >= terms.cancellation {
            return Err(EscrowError::WithdrawTooLate {
                closed_at: terms.cancellation,
            });
        }
        if digest != terms.digest {
            return Err(EscrowError::InvalidImmutables);
        }
        match terms.scheme.commit(secret.as_slice()) {
            Some(commitment) if commitment.as_slice() == terms.hashlock.as_slice() => {}
            _ => return Err(EscrowError::InvalidSecret),
        }

        self.revealed.save(ctx.deps.storage, &secret)?;
        Ok(Response::new()
            .add_attribute("action", "withdraw")
            .add_attribute("secret", secret.to_hex()))
    }

    #[sv::msg(query)]
    pub fn status(&self, ctx: QueryCtx) -> StdResult<EscrowStatus> {
        let secret = self.revealed.may_load(ctx.deps.storage)?;
        Ok(EscrowStatus {
            withdrawn: secret.is_some(),
            secret,
        })
    }
}

fn env_at(now: u64) -> Env {
    let mut env = mock_env();
    env.block.time = Timestamp::from_seconds(now);
    env
}

/// One deployed escrow: the contract with its own storage.
pub struct EscrowInstance {
    contract: EscrowContract,
    deps: OwnedDeps<MockStorage, MockApi, MockQuerier>,
}

impl EscrowInstance {
    pub fn instantiate(creator: &Addr, terms: EscrowTerms, now: u64) -> Result<Self, EscrowError> {
        let contract = EscrowContract::new();
        let mut deps = mock_dependencies();
        let ctx = InstantiateCtx::from((deps.as_mut(), env_at(now), message_info(creator, &[])));
        contract.instantiate(ctx, terms)?;
        Ok(Self { contract, deps })
    }

    pub fn withdraw(
        &mut self,
        sender: &Addr,
        secret: &[u8],
        digest: &[u8],
        now: u64,
    ) -> Result<(), EscrowError> {
        let ctx = ExecCtx::from((self.deps.as_mut(), env_at(now), message_info(sender, &[])));
        self.contract
            .withdraw(ctx, HexBinary::from(secret), HexBinary::from(digest))?;
        Ok(())
    }

    pub fn status(&self) -> StdResult<EscrowStatus> {
        self.contract
            .status(QueryCtx::from((self.deps.as_ref(), mock_env())))
    }
}
