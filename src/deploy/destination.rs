use tracing::{info, instrument, warn};

use crate::chain::{explorer_link, EvmChain, StarknetCall, StarknetChain, STARKNET_CHAIN_ID};
use crate::deploy::{ensure_allowance, ensure_balance, EscrowDeployment, EscrowRole, OPTIMISM, STARKNET};
use crate::error::SwapError;
use crate::events::{DstEscrowCreated, StarknetDstDeployed, DST_ESCROW_CREATED_TOPIC, STARKNET_DST_DEPLOYED_KEY};
use crate::immutables::{EscrowImmutables, EvmImmutables, StarknetImmutables};
use crate::states::{EvmAddress, StarkFelt};
use crate::timelocks::{check_destination_deadline, rebase_destination, Timelocks};

/// Locks the resolver's funds on the destination chain once the source
/// escrow exists.
pub trait DestinationEscrowDeployer {
    type Immutables: EscrowImmutables;

    /// `src_cancellation` is the absolute source cancellation instant read
    /// from the source deployment.
    fn deploy(
        &self,
        immutables: &Self::Immutables,
        src_cancellation: u64,
    ) -> Result<EscrowDeployment<Self::Immutables>, SwapError>;
}

/// Re-checks the schedule against the source and the current chain time.
fn check_schedule(timelocks: &Timelocks, now: u64, src_cancellation: u64) -> Result<(), SwapError> {
    let offsets = timelocks.offsets();
    let rebased = rebase_destination(&offsets, src_cancellation)?;
    check_destination_deadline(&offsets, now, src_cancellation).map_err(|err| {
        warn!(
            now,
            src_cancellation,
            margin = rebased.margin(src_cancellation),
            "destination would outlive source"
        );
        err
    })
}

pub struct StarknetDestinationDeployer<C> {
    pub chain: C,
    pub resolver_account: StarkFelt,
    pub resolver_contract: StarkFelt,
    pub fee_token: StarkFelt,
}

impl<C: StarknetChain> DestinationEscrowDeployer for StarknetDestinationDeployer<C> {
    type Immutables = StarknetImmutables;

    #[instrument(skip_all, fields(order_hash = %immutables.order_hash))]
    fn deploy(
        &self,
        immutables: &StarknetImmutables,
        src_cancellation: u64,
    ) -> Result<EscrowDeployment<StarknetImmutables>, SwapError> {
        check_schedule(
            &immutables.timelocks,
            self.chain.block_timestamp()?,
            src_cancellation,
        )?;

        let amount = immutables.amount();
        let deposit = immutables.safety_deposit();
        let token_need = if immutables.token == self.fee_token {
            amount.checked_add(deposit).map_err(|err| SwapError::InvalidAmount(err.to_string()))?
        } else {
            amount
        };
        ensure_balance(
            &immutables.token,
            &self.resolver_account,
            self.chain
                .balance_of(&immutables.token, &self.resolver_account)?,
            token_need,
        )?;
        if immutables.token != self.fee_token {
            ensure_balance(
                &self.fee_token,
                &self.resolver_account,
                self.chain
                    .balance_of(&self.fee_token, &self.resolver_account)?,
                deposit,
            )?;
        }

        let mut calls = vec![StarknetCall::transfer(
            immutables.token,
            self.resolver_contract,
            amount,
        )];
        if !deposit.is_zero() {
            calls.push(StarknetCall::transfer(
                self.fee_token,
                self.resolver_contract,
                deposit,
            ));
        }
        calls.push(StarknetCall::deploy_dst(
            self.resolver_contract,
            immutables,
            src_cancellation,
        ));

        let receipt = self.chain.execute(&self.resolver_account, &calls)?;
        let tx_hash = receipt.tx_hash.to_string();
        if !receipt.success {
            return Err(SwapError::EscrowDeploymentFailed {
                chain: STARKNET,
                tx_hash,
            });
        }
        let event = receipt
            .find_event(&STARKNET_DST_DEPLOYED_KEY)
            .ok_or_else(|| SwapError::TargetEventNotFound {
                event: STARKNET_DST_DEPLOYED_KEY.to_string(),
                tx_hash: tx_hash.clone(),
            })?;
        let deployed = StarknetDstDeployed::decode(event)?;
        let recorded =
            immutables.with_timelocks(immutables.timelocks.anchor(receipt.block_timestamp)?);
        info!(
            escrow = %deployed.escrow,
            link = %explorer_link(STARKNET_CHAIN_ID, &tx_hash),
            "destination escrow deployed"
        );

        Ok(EscrowDeployment {
            escrow: deployed.escrow,
            immutables: recorded,
            tx_hash,
            role: EscrowRole::Destination,
        })
    }
}

/// Calls `createDstEscrow` on the factory from the resolver account. The
/// zero token address stands for the native currency.
pub struct EvmDestinationDeployer<C> {
    pub chain: C,
    pub resolver_account: EvmAddress,
    pub escrow_factory: EvmAddress,
}

impl<C: EvmChain> DestinationEscrowDeployer for EvmDestinationDeployer<C> {
    type Immutables = EvmImmutables;

    #[instrument(skip_all, fields(order_hash = %immutables.order_hash))]
    fn deploy(
        &self,
        immutables: &EvmImmutables,
        src_cancellation: u64,
    ) -> Result<EscrowDeployment<EvmImmutables>, SwapError> {
        check_schedule(
            &immutables.timelocks,
            self.chain.block_timestamp()?,
            src_cancellation,
        )?;

        let native = immutables.token.is_zero();
        let value = if native {
            immutables
                .safety_deposit
                .checked_add(immutables.amount)
                .map_err(|err| SwapError::InvalidAmount(err.to_string()))?
        } else {
            immutables.safety_deposit
        };
        ensure_balance(
            "native",
            &self.resolver_account,
            self.chain
                .balance_of(&EvmAddress::ZERO, &self.resolver_account)?,
            value,
        )?;
        if !native {
            let token = &immutables.token;
            ensure_balance(
                token,
                &self.resolver_account,
                self.chain.balance_of(token, &self.resolver_account)?,
                immutables.amount,
            )?;
            ensure_allowance(
                token,
                &self.resolver_account,
                &self.escrow_factory,
                self.chain
                    .allowance(token, &self.resolver_account, &self.escrow_factory)?,
                immutables.amount,
            )?;
        }

        let receipt = self.chain.create_dst_escrow(
            &self.resolver_account,
            &self.escrow_factory,
            immutables,
            src_cancellation,
            value,
        )?;
        let tx_hash = receipt.tx_hash.to_string();
        if !receipt.success {
            return Err(SwapError::EscrowDeploymentFailed {
                chain: OPTIMISM,
                tx_hash,
            });
        }
        let log = receipt
            .find_log(&DST_ESCROW_CREATED_TOPIC)
            .ok_or_else(|| SwapError::TargetEventNotFound {
                event: DST_ESCROW_CREATED_TOPIC.to_string(),
                tx_hash: tx_hash.clone(),
            })?;
        let created = DstEscrowCreated::decode(log)?;
        // The escrow checks immutables against its own address, which the
        // factory derived with the deployment block timestamp.
        let recorded =
            immutables.with_timelocks(immutables.timelocks.anchor(receipt.block_timestamp)?);
        info!(
            escrow = %created.escrow,
            link = %explorer_link(self.chain.chain_id(), &tx_hash),
            "destination escrow deployed"
        );

        Ok(EscrowDeployment {
            escrow: created.escrow,
            immutables: recorded,
            tx_hash,
            role: EscrowRole::Destination,
        })
    }
}
