//! In-process chains for exercising the swap end to end: shared clock,
//! token ledgers and escrows backed by [`EscrowContract`].

use std::fmt::Display;
use std::hash::Hash;

use sylvia::cw_std::{Addr, Uint256};

use crate::config::SwapConfig;
use crate::deploy::EscrowRole;
use crate::order::{EvmOrder, EvmOrderParams, StarknetOrder};
use crate::states::{EvmAddress, Hash32, StarkFelt};

mod clock;
mod contract;
mod evm;
mod ledger;
mod sdk;
mod starknet;

pub use clock::ManualClock;
pub use contract::{EscrowContract, EscrowError, EscrowInstance, EscrowStatus, EscrowTerms, HashScheme};
pub use evm::SimEvmChain;
pub use ledger::Ledger;
pub use sdk::SimOrderSdk;
pub use starknet::SimStarknetChain;

pub const GENESIS: u64 = 1_700_000_000;

const RESOLVER_FLOAT: u128 = 1_000_000_000_000_000_000_000;

pub(crate) fn addr(account: impl Display) -> Addr {
    Addr::unchecked(account.to_string())
}

/// A funded escrow and what it pays out on withdrawal.
pub(crate) struct LockedEscrow<A> {
    pub instance: EscrowInstance,
    pub role: EscrowRole,
    pub maker: A,
    pub token: A,
    pub amount: Uint256,
    pub deposit_token: A,
    pub deposit: Uint256,
}

impl<A: Copy + Eq + Hash + Display> LockedEscrow<A> {
    /// Source escrows pay the taker, destination escrows the maker. The
    /// safety deposit always goes to whoever withdrew.
    pub fn release(&self, ledger: &mut Ledger<A>, escrow: &A, sender: &A) -> Result<(), String> {
        let recipient = match self.role {
            EscrowRole::Source => sender,
            EscrowRole::Destination => &self.maker,
        };
        ledger.transfer(&self.token, escrow, recipient, self.amount)?;
        if !self.deposit.is_zero() {
            ledger.transfer(&self.deposit_token, escrow, sender, self.deposit)?;
        }
        Ok(())
    }
}

/// Both chains, an order SDK and a configuration whose resolver accounts
/// are already funded.
pub struct SimWorld {
    pub clock: ManualClock,
    pub evm: SimEvmChain,
    pub starknet: SimStarknetChain,
    pub sdk: SimOrderSdk,
    pub config: SwapConfig,
    pub evm_token: EvmAddress,
    pub starknet_token: StarkFelt,
}

impl SimWorld {
    pub fn new() -> Self {
        Self::with_clock(ManualClock::new(GENESIS))
    }

    /// Chain time never moves on its own.
    pub fn frozen() -> Self {
        Self::with_clock(ManualClock::frozen(GENESIS))
    }

    fn with_clock(clock: ManualClock) -> Self {
        let mut config = SwapConfig::default();
        config.evm.user = EvmAddress([0x7f; 20]);
        config.evm.resolver_account = EvmAddress([0x5e; 20]);
        config.starknet.user = StarkFelt::from_u64(0x0606_84d6);
        let evm_token = EvmAddress([0x72; 20]);
        let starknet_token = StarkFelt::from_u64(0x0053_c911);

        let evm = SimEvmChain::new(
            clock.clone(),
            config.evm.escrow_factory,
            config.evm.limit_order_protocol,
        );
        let starknet = SimStarknetChain::new(
            clock.clone(),
            config.starknet.resolver_contract,
            config.starknet.limit_order_protocol,
            config.starknet.fee_token,
        );

        let float = Uint256::from(RESOLVER_FLOAT);
        let resolver = config.evm.resolver_account;
        evm.fund(&EvmAddress::ZERO, &resolver, float);
        evm.fund(&evm_token, &resolver, float);
        evm.grant_allowance(&evm_token, &resolver, &config.evm.escrow_factory, Uint256::MAX);
        let resolver = config.starknet.resolver_account;
        starknet.fund(&starknet_token, &resolver, float);
        starknet.fund(&config.starknet.fee_token, &resolver, float);

        Self {
            clock,
            evm,
            starknet,
            sdk: SimOrderSdk,
            config,
            evm_token,
            starknet_token,
        }
    }

    pub fn fund_evm_maker(&self, amount: Uint256) {
        self.evm.fund(&self.evm_token, &self.config.evm.user, amount);
    }

    pub fn approve_evm_lop(&self, amount: Uint256) {
        self.evm.grant_allowance(
            &self.evm_token,
            &self.config.evm.user,
            &self.config.evm.limit_order_protocol,
            amount,
        );
    }

    pub fn fund_starknet_maker(&self, amount: Uint256) {
        self.starknet
            .fund(&self.starknet_token, &self.config.starknet.user, amount);
    }

    pub fn approve_starknet_lop(&self, amount: Uint256) {
        self.starknet.grant_allowance(
            &self.starknet_token,
            &self.config.starknet.user,
            &self.config.starknet.limit_order_protocol,
            amount,
        );
    }

    /// Unsigned order selling `evm_token` for the Starknet token.
    pub fn evm_order(&self, making: Uint256, taking: Uint256) -> EvmOrder {
        let config = &self.config;
        self.sdk.order(&EvmOrderParams {
            maker: config.evm.user,
            maker_asset: self.evm_token,
            taker_asset: EvmAddress::ZERO,
            making_amount: making,
            taking_amount: taking,
            hashlock: Hash32::default(),
            offsets: config.offsets,
            src_chain_id: config.evm.chain_id,
            dst_chain_id: config.starknet.chain_id,
            src_safety_deposit: config.safety_deposit,
            dst_safety_deposit: config.safety_deposit,
            escrow_factory: config.evm.escrow_factory,
            resolver: config.evm.resolver,
        })
    }

    pub fn starknet_order(&self, making: Uint256, taking: Uint256) -> StarknetOrder {
        StarknetOrder::new(
            self.config.starknet.user,
            self.config.evm.user,
            self.starknet_token,
            self.evm_token,
            making,
            taking,
        )
    }
}

impl Default for SimWorld {
    fn default() -> Self {
        Self::new()
    }
}
