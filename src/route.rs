use sylvia::cw_std::Uint256;
use tracing::{info, instrument};

use crate::chain::{explorer_link, Clock, EvmChain, StarknetCall, StarknetChain, STARKNET_CHAIN_ID};
use crate::config::SwapConfig;
use crate::deploy::{
    ensure_balance, DestinationEscrowDeployer, EscrowDeployment, EvmDestinationDeployer,
    EvmSourceDeployer, SourceEscrowDeployer, StarknetDestinationDeployer, StarknetSourceDeployer,
    OPTIMISM, STARKNET,
};
use crate::error::SwapError;
use crate::hashlock::{Hashlock, Secret};
use crate::immutables::{
    build_evm_destination, build_evm_source, build_starknet_destination, build_starknet_source,
    EscrowImmutables, EvmImmutables, Parties, StarknetImmutables,
};
use crate::orchestrator::SwapRequest;
use crate::order::{
    starknet_custom_data, EvmOrder, EvmOrderParams, EvmOrderSdk, EvmSignature, StarknetOrder,
    StarknetOrderSigner,
};
use crate::states::{parse_units, Amounts, EvmAddress, StarkFelt};
use crate::withdraw::{
    EvmWithdrawalLeg, StarknetWithdrawalLeg, WithdrawalCoordinator, WithdrawalReceipts,
};

/// Tokens, counterparty and amounts of one swap, typed for its chains.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SwapPlan<S, D> {
    pub src_token: S,
    pub dst_token: D,
    /// Counterparty address on the destination chain.
    pub receiver: D,
    pub amounts: Amounts,
}

/// A signed order and the source immutables derived from it.
#[derive(Clone, Debug, PartialEq)]
pub struct SignedOrder<O, G, I> {
    pub order: O,
    pub signature: G,
    pub immutables: I,
}

/// One swap direction: everything chain specific the orchestrator drives.
pub trait SwapRoute {
    type Plan;
    type Signed;
    type Src: EscrowImmutables;
    type Dst: EscrowImmutables;

    const SOURCE: &'static str;
    const DESTINATION: &'static str;

    fn name(&self) -> &'static str;
    fn config(&self) -> &SwapConfig;
    fn parse(&self, request: &SwapRequest) -> Result<Self::Plan, SwapError>;
    fn approve(&self, plan: &Self::Plan) -> Result<(), SwapError>;
    fn sign_order(&self, plan: &Self::Plan, hashlock: &Hashlock) -> Result<Self::Signed, SwapError>;
    fn order_key(&self, signed: &Self::Signed) -> [u8; 32];
    fn deploy_source(&self, signed: &Self::Signed) -> Result<EscrowDeployment<Self::Src>, SwapError>;
    fn deploy_destination(
        &self,
        plan: &Self::Plan,
        signed: &Self::Signed,
        hashlock: &Hashlock,
        src_cancellation: u64,
    ) -> Result<EscrowDeployment<Self::Dst>, SwapError>;
    fn withdraw<C: Clock>(
        &self,
        coordinator: &mut WithdrawalCoordinator<C>,
        secret: &Secret,
        src: &EscrowDeployment<Self::Src>,
        dst: &EscrowDeployment<Self::Dst>,
    ) -> Result<WithdrawalReceipts, SwapError>;
}

fn parse_amounts(request: &SwapRequest, config: &SwapConfig) -> Result<Amounts, SwapError> {
    Ok(Amounts {
        making: parse_units(&request.making_amount, config.decimals)?,
        taking: parse_units(&request.taking_amount, config.decimals)?,
        safety_deposit: config.safety_deposit,
    })
}

/// Maker on Optimism, receiver on Starknet.
pub struct OpToStarknetRoute<E, S, K> {
    pub evm: E,
    pub starknet: S,
    pub sdk: K,
    pub config: SwapConfig,
}

impl<E: EvmChain, S: StarknetChain, K: EvmOrderSdk> SwapRoute for OpToStarknetRoute<E, S, K> {
    type Plan = SwapPlan<EvmAddress, StarkFelt>;
    type Signed = SignedOrder<EvmOrder, EvmSignature, EvmImmutables>;
    type Src = EvmImmutables;
    type Dst = StarknetImmutables;

    const SOURCE: &'static str = OPTIMISM;
    const DESTINATION: &'static str = STARKNET;

    fn name(&self) -> &'static str {
        "op-to-starknet"
    }

    fn config(&self) -> &SwapConfig {
        &self.config
    }

    fn parse(&self, request: &SwapRequest) -> Result<Self::Plan, SwapError> {
        Ok(SwapPlan {
            src_token: EvmAddress::parse(&request.src_token)?,
            dst_token: StarkFelt::parse_address(&request.dst_token)?,
            receiver: StarkFelt::parse_address(&request.counterparty)?,
            amounts: parse_amounts(request, &self.config)?,
        })
    }

    /// Approves the limit-order protocol for the maximum amount when the
    /// current allowance does not cover the order.
    #[instrument(skip_all, fields(token = %plan.src_token))]
    fn approve(&self, plan: &Self::Plan) -> Result<(), SwapError> {
        let maker = self.config.require_evm_user()?;
        let token = &plan.src_token;
        let spender = &self.config.evm.limit_order_protocol;
        ensure_balance(
            token,
            &maker,
            self.evm.balance_of(token, &maker)?,
            plan.amounts.making,
        )?;
        let allowance = self.evm.allowance(token, &maker, spender)?;
        if allowance >= plan.amounts.making {
            return Ok(());
        }
        let receipt = self.evm.approve(&maker, token, spender, Uint256::MAX)?;
        let tx_hash = receipt.tx_hash.to_string();
        if !receipt.success {
            return Err(SwapError::ApprovalFailed {
                chain: OPTIMISM,
                tx_hash,
            });
        }
        info!(link = %explorer_link(self.evm.chain_id(), &tx_hash), "limit order protocol approved");
        Ok(())
    }

    fn sign_order(&self, plan: &Self::Plan, hashlock: &Hashlock) -> Result<Self::Signed, SwapError> {
        let config = &self.config;
        let params = EvmOrderParams {
            maker: config.require_evm_user()?,
            maker_asset: plan.src_token,
            taker_asset: EvmAddress::ZERO,
            making_amount: plan.amounts.making,
            taking_amount: plan.amounts.taking,
            hashlock: hashlock.evm(),
            offsets: config.offsets,
            src_chain_id: config.evm.chain_id,
            dst_chain_id: config.starknet.chain_id,
            src_safety_deposit: plan.amounts.safety_deposit,
            dst_safety_deposit: plan.amounts.safety_deposit,
            escrow_factory: config.evm.escrow_factory,
            resolver: config.evm.resolver,
        };
        let order = self
            .sdk
            .build_order(&params)?
            .with_non_evm_destination()
            .with_dst_chain_id(config.starknet.chain_id)
            .with_custom_data(starknet_custom_data(
                &plan.receiver,
                &plan.dst_token,
                &hashlock.starknet(),
            ))
            .with_extension_salt();
        let order_hash = self.sdk.order_hash(&order, config.evm.chain_id);
        let signature = self.sdk.sign(&order, config.evm.chain_id)?;
        let immutables = build_evm_source(
            &order,
            order_hash,
            hashlock,
            config.evm.resolver,
            plan.amounts.safety_deposit,
            &config.offsets,
        )?;
        info!(%order_hash, making = %plan.amounts.making, taking = %plan.amounts.taking, "order signed");
        Ok(SignedOrder {
            order,
            signature,
            immutables,
        })
    }

    fn order_key(&self, signed: &Self::Signed) -> [u8; 32] {
        signed.immutables.order_hash.0
    }

    fn deploy_source(&self, signed: &Self::Signed) -> Result<EscrowDeployment<EvmImmutables>, SwapError> {
        let config = &self.config.evm;
        EvmSourceDeployer {
            chain: &self.evm,
            resolver_account: self.config.require_evm_resolver_account()?,
            resolver: config.resolver,
            escrow_factory: config.escrow_factory,
            limit_order_protocol: config.limit_order_protocol,
        }
        .deploy(&signed.order, &signed.signature, &signed.immutables)
    }

    fn deploy_destination(
        &self,
        plan: &Self::Plan,
        signed: &Self::Signed,
        hashlock: &Hashlock,
        src_cancellation: u64,
    ) -> Result<EscrowDeployment<StarknetImmutables>, SwapError> {
        let config = &self.config.starknet;
        let (immutables, schedule) = build_starknet_destination(
            &signed.immutables.order_hash,
            hashlock,
            Parties {
                maker: plan.receiver,
                taker: config.resolver_contract,
                token: plan.dst_token,
            },
            plan.amounts.taking,
            plan.amounts.safety_deposit,
            &self.config.offsets,
            src_cancellation,
        )?;
        info!(
            src_cancellation,
            dst_cancellation = schedule.cancellation,
            margin = schedule.margin(src_cancellation),
            "destination schedule"
        );
        StarknetDestinationDeployer {
            chain: &self.starknet,
            resolver_account: config.resolver_account,
            resolver_contract: config.resolver_contract,
            fee_token: config.fee_token,
        }
        .deploy(&immutables, src_cancellation)
    }

    fn withdraw<C: Clock>(
        &self,
        coordinator: &mut WithdrawalCoordinator<C>,
        secret: &Secret,
        src: &EscrowDeployment<EvmImmutables>,
        dst: &EscrowDeployment<StarknetImmutables>,
    ) -> Result<WithdrawalReceipts, SwapError> {
        // Source escrows name the resolver contract as taker.
        let src_leg = EvmWithdrawalLeg::from_deployment(
            &self.evm,
            self.config.require_evm_resolver_account()?,
            Some(self.config.evm.resolver),
            src,
        );
        let dst_leg = StarknetWithdrawalLeg::from_deployment(
            &self.starknet,
            self.config.starknet.resolver_account,
            self.config.starknet.resolver_contract,
            dst,
        );
        coordinator.withdraw(secret, &src_leg, &dst_leg)
    }
}

/// Maker on Starknet, receiver on Optimism.
pub struct StarknetToOpRoute<S, E, G> {
    pub starknet: S,
    pub evm: E,
    pub signer: G,
    pub config: SwapConfig,
}

impl<S: StarknetChain, E: EvmChain, G: StarknetOrderSigner> SwapRoute for StarknetToOpRoute<S, E, G> {
    type Plan = SwapPlan<StarkFelt, EvmAddress>;
    type Signed = SignedOrder<StarknetOrder, Vec<StarkFelt>, StarknetImmutables>;
    type Src = StarknetImmutables;
    type Dst = EvmImmutables;

    const SOURCE: &'static str = STARKNET;
    const DESTINATION: &'static str = OPTIMISM;

    fn name(&self) -> &'static str {
        "starknet-to-op"
    }

    fn config(&self) -> &SwapConfig {
        &self.config
    }

    fn parse(&self, request: &SwapRequest) -> Result<Self::Plan, SwapError> {
        Ok(SwapPlan {
            src_token: StarkFelt::parse_address(&request.src_token)?,
            dst_token: EvmAddress::parse(&request.dst_token)?,
            receiver: EvmAddress::parse(&request.counterparty)?,
            amounts: parse_amounts(request, &self.config)?,
        })
    }

    #[instrument(skip_all, fields(token = %plan.src_token))]
    fn approve(&self, plan: &Self::Plan) -> Result<(), SwapError> {
        let maker = self.config.require_starknet_user()?;
        let token = &plan.src_token;
        ensure_balance(
            token,
            &maker,
            self.starknet.balance_of(token, &maker)?,
            plan.amounts.making,
        )?;
        let call = StarknetCall::approve(
            *token,
            self.config.starknet.limit_order_protocol,
            plan.amounts.making,
        );
        let receipt = self.starknet.execute(&maker, &[call])?;
        let tx_hash = receipt.tx_hash.to_string();
        if !receipt.success {
            return Err(SwapError::ApprovalFailed {
                chain: STARKNET,
                tx_hash,
            });
        }
        info!(link = %explorer_link(STARKNET_CHAIN_ID, &tx_hash), "limit order protocol approved");
        Ok(())
    }

    fn sign_order(&self, plan: &Self::Plan, hashlock: &Hashlock) -> Result<Self::Signed, SwapError> {
        let order = StarknetOrder::new(
            self.config.require_starknet_user()?,
            plan.receiver,
            plan.src_token,
            plan.dst_token,
            plan.amounts.making,
            plan.amounts.taking,
        );
        let signature = self.signer.sign(&order)?;
        let immutables = build_starknet_source(
            &order,
            hashlock,
            self.config.starknet.resolver_contract,
            plan.amounts.safety_deposit,
            &self.config.offsets,
        )?;
        info!(order_hash = %immutables.order_hash, making = %plan.amounts.making, taking = %plan.amounts.taking, "order signed");
        Ok(SignedOrder {
            order,
            signature,
            immutables,
        })
    }

    fn order_key(&self, signed: &Self::Signed) -> [u8; 32] {
        signed.immutables.order_hash.0
    }

    fn deploy_source(
        &self,
        signed: &Self::Signed,
    ) -> Result<EscrowDeployment<StarknetImmutables>, SwapError> {
        let config = &self.config.starknet;
        StarknetSourceDeployer {
            chain: &self.starknet,
            resolver_account: config.resolver_account,
            resolver_contract: config.resolver_contract,
            fee_token: config.fee_token,
            limit_order_protocol: config.limit_order_protocol,
        }
        .deploy(&signed.order, &signed.signature, &signed.immutables)
    }

    fn deploy_destination(
        &self,
        plan: &Self::Plan,
        signed: &Self::Signed,
        hashlock: &Hashlock,
        src_cancellation: u64,
    ) -> Result<EscrowDeployment<EvmImmutables>, SwapError> {
        let resolver_account = self.config.require_evm_resolver_account()?;
        let (immutables, schedule) = build_evm_destination(
            &signed.immutables.order_hash,
            hashlock,
            Parties {
                maker: plan.receiver,
                taker: resolver_account,
                token: plan.dst_token,
            },
            plan.amounts.taking,
            plan.amounts.safety_deposit,
            &self.config.offsets,
            src_cancellation,
        )?;
        info!(
            src_cancellation,
            dst_cancellation = schedule.cancellation,
            margin = schedule.margin(src_cancellation),
            "destination schedule"
        );
        EvmDestinationDeployer {
            chain: &self.evm,
            resolver_account,
            escrow_factory: self.config.evm.escrow_factory,
        }
        .deploy(&immutables, src_cancellation)
    }

    fn withdraw<C: Clock>(
        &self,
        coordinator: &mut WithdrawalCoordinator<C>,
        secret: &Secret,
        src: &EscrowDeployment<StarknetImmutables>,
        dst: &EscrowDeployment<EvmImmutables>,
    ) -> Result<WithdrawalReceipts, SwapError> {
        let src_leg = StarknetWithdrawalLeg::from_deployment(
            &self.starknet,
            self.config.starknet.resolver_account,
            self.config.starknet.resolver_contract,
            src,
        );
        let dst_leg = EvmWithdrawalLeg::from_deployment(
            &self.evm,
            self.config.require_evm_resolver_account()?,
            None,
            dst,
        );
        coordinator.withdraw(secret, &src_leg, &dst_leg)
    }
}
