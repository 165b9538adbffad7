use tracing::{debug, error, info, instrument};

use crate::chain::{
    explorer_link, DeploySrcCall, EvmChain, EvmReceipt, StarknetCall, StarknetChain,
    StarknetReceipt, STARKNET_CHAIN_ID,
};
use crate::deploy::{ensure_allowance, ensure_balance, EscrowDeployment, EscrowRole, OPTIMISM, STARKNET};
use crate::error::SwapError;
use crate::events::{src_escrow_created_topic, SrcEscrowCreated, StarknetSrcDeployed, STARKNET_SRC_DEPLOYED_KEY};
use crate::immutables::{EscrowImmutables, EvmImmutables, StarknetImmutables};
use crate::order::{EvmOrder, EvmSignature, StarknetOrder, TakerTraits};
use crate::states::{EvmAddress, StarkFelt};
use crate::timelocks::Stage;

/// Locks the maker's funds on the source chain.
pub trait SourceEscrowDeployer {
    type Immutables: EscrowImmutables;
    type Order;
    type Signature;

    fn deploy(
        &self,
        order: &Self::Order,
        signature: &Self::Signature,
        immutables: &Self::Immutables,
    ) -> Result<EscrowDeployment<Self::Immutables>, SwapError>;
}

/// Fills the order through the resolver contract, which deploys the
/// source escrow via the escrow factory.
pub struct EvmSourceDeployer<C> {
    pub chain: C,
    pub resolver_account: EvmAddress,
    pub resolver: EvmAddress,
    pub escrow_factory: EvmAddress,
    pub limit_order_protocol: EvmAddress,
}

impl<C: EvmChain> EvmSourceDeployer<C> {
    /// Reads the escrow back from a mined deploy transaction.
    fn confirm(
        &self,
        receipt: &EvmReceipt,
        tx_hash: &str,
        immutables: &EvmImmutables,
    ) -> Result<EscrowDeployment<EvmImmutables>, SwapError> {
        let topic = src_escrow_created_topic();
        let log = receipt
            .find_log(&topic)
            .ok_or_else(|| SwapError::DeployEventNotFound {
                event: topic.to_string(),
                tx_hash: tx_hash.to_string(),
            })?;
        let event = SrcEscrowCreated::decode(log)?;

        let expected = immutables.with_timelocks(
            immutables
                .timelocks
                .anchor(event.immutables.timelocks.deployed_at())?,
        );
        if expected != event.immutables {
            return Err(SwapError::ImmutablesMismatch {
                order_hash: immutables.order_hash.to_string(),
            });
        }

        let implementation = self.chain.escrow_src_implementation(&self.escrow_factory)?;
        let escrow = event
            .immutables
            .escrow_address(&self.escrow_factory, &implementation);
        info!(
            %escrow,
            src_cancellation = event.src_cancellation(),
            "source escrow deployed"
        );

        Ok(EscrowDeployment {
            escrow,
            immutables: event.immutables,
            tx_hash: tx_hash.to_string(),
            role: EscrowRole::Source,
        })
    }

    /// Where the factory puts the escrow when it anchors the immutables to
    /// the block of the deploy transaction.
    fn expected_escrow(&self, immutables: &EvmImmutables, deployed_at: u64) -> Option<EvmAddress> {
        let timelocks = immutables.timelocks.anchor(deployed_at).ok()?;
        let implementation = self
            .chain
            .escrow_src_implementation(&self.escrow_factory)
            .ok()?;
        Some(
            immutables
                .with_timelocks(timelocks)
                .escrow_address(&self.escrow_factory, &implementation),
        )
    }
}

impl<C: EvmChain> SourceEscrowDeployer for EvmSourceDeployer<C> {
    type Immutables = EvmImmutables;
    type Order = EvmOrder;
    type Signature = EvmSignature;

    #[instrument(skip_all, fields(order_hash = %immutables.order_hash))]
    fn deploy(
        &self,
        order: &EvmOrder,
        signature: &EvmSignature,
        immutables: &EvmImmutables,
    ) -> Result<EscrowDeployment<EvmImmutables>, SwapError> {
        let maker = &immutables.maker;
        let token = &immutables.token;
        ensure_balance(
            token,
            maker,
            self.chain.balance_of(token, maker)?,
            immutables.amount,
        )?;
        ensure_allowance(
            token,
            maker,
            &self.limit_order_protocol,
            self.chain.allowance(token, maker, &self.limit_order_protocol)?,
            immutables.amount,
        )?;
        // The resolver sends the safety deposit as call value.
        ensure_balance(
            EvmAddress::ZERO,
            self.resolver_account,
            self.chain
                .balance_of(&EvmAddress::ZERO, &self.resolver_account)?,
            immutables.safety_deposit,
        )?;

        let call = DeploySrcCall {
            immutables: *immutables,
            order: order.clone(),
            signature: *signature,
            taker_traits: TakerTraits::for_fill(order).encode()?,
            fill_amount: order.making_amount,
            value: immutables.safety_deposit,
        };
        let receipt = self
            .chain
            .deploy_src(&self.resolver_account, &self.resolver, &call)?;
        let tx_hash = receipt.tx_hash.to_string();
        if !receipt.success {
            return Err(SwapError::EscrowDeploymentFailed {
                chain: OPTIMISM,
                tx_hash,
            });
        }
        info!(
            fill_amount = %order.making_amount,
            link = %explorer_link(self.chain.chain_id(), &tx_hash),
            "order filled"
        );

        self.confirm(&receipt, &tx_hash, immutables).map_err(|err| {
            let escrow = self.expected_escrow(immutables, receipt.block_timestamp);
            error!(%tx_hash, error = %err, "source deploy mined but escrow not confirmed");
            SwapError::SourceUnconfirmed {
                tx_hash: tx_hash.clone(),
                escrow: escrow.map(|escrow| escrow.to_string()),
                source: Box::new(err),
            }
        })
    }
}

/// Deploys the source escrow through the Starknet resolver contract, which
/// pulls the maker's tokens via the limit-order protocol.
pub struct StarknetSourceDeployer<C> {
    pub chain: C,
    pub resolver_account: StarkFelt,
    pub resolver_contract: StarkFelt,
    pub fee_token: StarkFelt,
    pub limit_order_protocol: StarkFelt,
}

impl<C: StarknetChain> SourceEscrowDeployer for StarknetSourceDeployer<C> {
    type Immutables = StarknetImmutables;
    type Order = StarknetOrder;
    type Signature = Vec<StarkFelt>;

    #[instrument(skip_all, fields(order_hash = %immutables.order_hash))]
    fn deploy(
        &self,
        order: &StarknetOrder,
        signature: &Vec<StarkFelt>,
        immutables: &StarknetImmutables,
    ) -> Result<EscrowDeployment<StarknetImmutables>, SwapError> {
        let maker = &immutables.maker;
        let token = &immutables.token;
        let amount = immutables.amount();
        let deposit = immutables.safety_deposit();
        ensure_balance(token, maker, self.chain.balance_of(token, maker)?, amount)?;
        ensure_allowance(
            token,
            maker,
            &self.limit_order_protocol,
            self.chain
                .allowance(token, maker, &self.limit_order_protocol)?,
            amount,
        )?;
        ensure_balance(
            &self.fee_token,
            &self.resolver_account,
            self.chain
                .balance_of(&self.fee_token, &self.resolver_account)?,
            deposit,
        )?;

        let mut calls = Vec::with_capacity(2);
        if !deposit.is_zero() {
            calls.push(StarknetCall::transfer(
                self.fee_token,
                self.resolver_contract,
                deposit,
            ));
        }
        calls.push(StarknetCall::deploy_src(
            self.resolver_contract,
            immutables,
            order,
            signature,
        ));
        debug!(calls = calls.len(), "submitting source multicall");

        let receipt = self.chain.execute(&self.resolver_account, &calls)?;
        let tx_hash = receipt.tx_hash.to_string();
        if !receipt.success {
            return Err(SwapError::EscrowDeploymentFailed {
                chain: STARKNET,
                tx_hash,
            });
        }
        info!(link = %explorer_link(STARKNET_CHAIN_ID, &tx_hash), "source escrow deploy mined");

        Self::confirm(&receipt, &tx_hash, immutables).map_err(|err| {
            let escrow = receipt
                .find_event(&STARKNET_SRC_DEPLOYED_KEY)
                .and_then(|event| StarknetSrcDeployed::decode(event).ok())
                .map(|deployed| deployed.escrow.to_string());
            error!(%tx_hash, error = %err, "source deploy mined but escrow not confirmed");
            SwapError::SourceUnconfirmed {
                tx_hash: tx_hash.clone(),
                escrow,
                source: Box::new(err),
            }
        })
    }
}

impl<C: StarknetChain> StarknetSourceDeployer<C> {
    fn confirm(
        receipt: &StarknetReceipt,
        tx_hash: &str,
        immutables: &StarknetImmutables,
    ) -> Result<EscrowDeployment<StarknetImmutables>, SwapError> {
        let event = receipt
            .find_event(&STARKNET_SRC_DEPLOYED_KEY)
            .ok_or_else(|| SwapError::DeployEventNotFound {
                event: STARKNET_SRC_DEPLOYED_KEY.to_string(),
                tx_hash: tx_hash.to_string(),
            })?;
        let deployed = StarknetSrcDeployed::decode(event)?;
        let offset = immutables.timelocks.offset(Stage::SrcCancellation) as u64;
        let deployed_at = deployed.cancellation.checked_sub(offset).ok_or_else(|| {
            SwapError::MalformedEvent(format!(
                "cancellation {} precedes its offset {offset}",
                deployed.cancellation
            ))
        })?;
        let recorded = immutables.with_timelocks(immutables.timelocks.anchor(deployed_at)?);
        info!(
            escrow = %deployed.escrow,
            src_cancellation = deployed.cancellation,
            "source escrow deployed"
        );

        Ok(EscrowDeployment {
            escrow: deployed.escrow,
            immutables: recorded,
            tx_hash: tx_hash.to_string(),
            role: EscrowRole::Source,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hashlock::{Hashlock, Secret};
    use crate::immutables::{build_evm_source, build_starknet_source};
    use crate::order::{EvmOrderSdk, HashSigner, StarknetOrderSigner};
    use crate::sim::{SimWorld, GENESIS};
    use crate::timelocks::TimelockOffsets;
    use sylvia::cw_std::Uint256;

    fn evm_deployer(world: &SimWorld) -> EvmSourceDeployer<&crate::sim::SimEvmChain> {
        EvmSourceDeployer {
            chain: &world.evm,
            resolver_account: world.config.evm.resolver_account,
            resolver: world.config.evm.resolver,
            escrow_factory: world.config.evm.escrow_factory,
            limit_order_protocol: world.config.evm.limit_order_protocol,
        }
    }

    fn evm_source(world: &SimWorld, secret: &Secret) -> (EvmOrder, EvmSignature, EvmImmutables) {
        let order = world.evm_order(Uint256::from(100u128), Uint256::one());
        let order_hash = world.sdk.order_hash(&order, 10);
        let signature = world.sdk.sign(&order, 10).unwrap();
        let immutables = build_evm_source(
            &order,
            order_hash,
            &Hashlock::from_secret(secret),
            world.config.evm.resolver,
            world.config.safety_deposit,
            &TimelockOffsets::default(),
        )
        .unwrap();
        (order, signature, immutables)
    }

    #[test]
    fn evm_source_deploy_records_anchored_immutables() {
        let world = SimWorld::new();
        world.fund_evm_maker(Uint256::from(100u128));
        world.approve_evm_lop(Uint256::from(100u128));
        let secret = Secret::random();
        let (order, signature, immutables) = evm_source(&world, &secret);

        let deployment = evm_deployer(&world)
            .deploy(&order, &signature, &immutables)
            .unwrap();

        assert_eq!(deployment.role, EscrowRole::Source);
        assert_eq!(deployment.immutables.timelocks.deployed_at(), GENESIS);
        assert_eq!(deployment.cancellation_at(), GENESIS + 642);
        assert_eq!(
            world.evm.balance(&immutables.token, &deployment.escrow),
            Uint256::from(100u128)
        );
    }

    #[test]
    fn evm_source_checks_balance_before_submitting() {
        let world = SimWorld::new();
        world.fund_evm_maker(Uint256::from(10u128));
        let secret = Secret::random();
        let (order, signature, immutables) = evm_source(&world, &secret);

        let err = evm_deployer(&world)
            .deploy(&order, &signature, &immutables)
            .unwrap_err();
        assert!(matches!(err, SwapError::InsufficientFunds { .. }));
        assert!(world.evm.submissions().is_empty());
    }

    #[test]
    fn evm_source_checks_resolver_deposit_before_submitting() {
        let world = SimWorld::new();
        world.fund_evm_maker(Uint256::from(100u128));
        world.approve_evm_lop(Uint256::from(100u128));
        let secret = Secret::random();
        let (order, signature, immutables) = evm_source(&world, &secret);
        let deployer = EvmSourceDeployer {
            resolver_account: EvmAddress([0x99; 20]),
            ..evm_deployer(&world)
        };

        let err = deployer.deploy(&order, &signature, &immutables).unwrap_err();

        assert!(err.is_precondition());
        match err {
            SwapError::InsufficientFunds { token, owner, .. } => {
                assert_eq!(token, EvmAddress::ZERO.to_string());
                assert_eq!(owner, EvmAddress([0x99; 20]).to_string());
            }
            other => panic!("unexpected error {other:?}"),
        }
        assert!(world.evm.submissions().is_empty());
    }

    #[test]
    fn evm_source_without_event_reports_the_locked_escrow() {
        let world = SimWorld::new();
        world.fund_evm_maker(Uint256::from(100u128));
        world.approve_evm_lop(Uint256::from(100u128));
        world.evm.suppress_events(true);
        let secret = Secret::random();
        let (order, signature, immutables) = evm_source(&world, &secret);

        let err = evm_deployer(&world)
            .deploy(&order, &signature, &immutables)
            .unwrap_err();

        assert!(!err.is_precondition());
        assert!(matches!(err.root(), SwapError::DeployEventNotFound { .. }));
        match err {
            SwapError::SourceUnconfirmed {
                tx_hash, escrow, ..
            } => {
                assert!(tx_hash.starts_with("0x"));
                // The escrow derived from the block timestamp holds the maker's tokens.
                let escrow: EvmAddress = escrow.unwrap().parse().unwrap();
                assert_eq!(
                    world.evm.balance(&immutables.token, &escrow),
                    Uint256::from(100u128)
                );
            }
            other => panic!("unexpected error {other:?}"),
        }
        assert_eq!(world.evm.submissions(), vec!["deploySrc".to_string()]);
    }

    #[test]
    fn reverted_source_deploy_locks_nothing() {
        let world = SimWorld::new();
        world.fund_evm_maker(Uint256::from(100u128));
        world.approve_evm_lop(Uint256::from(100u128));
        let secret = Secret::random();
        let (order, signature, immutables) = evm_source(&world, &secret);
        // A salt that no longer matches the extension makes the fill revert.
        let order = EvmOrder {
            salt: Uint256::one(),
            ..order
        };

        let err = evm_deployer(&world)
            .deploy(&order, &signature, &immutables)
            .unwrap_err();

        assert!(matches!(err, SwapError::EscrowDeploymentFailed { .. }));
        assert_eq!(
            world.evm.balance(&immutables.token, &immutables.maker),
            Uint256::from(100u128)
        );
    }

    #[test]
    fn starknet_source_multicall_funds_deposit() {
        let world = SimWorld::new();
        world.fund_starknet_maker(Uint256::from(100u128));
        world.approve_starknet_lop(Uint256::from(100u128));
        let secret = Secret::random();
        let order = world.starknet_order(Uint256::from(100u128), Uint256::one());
        let signature = HashSigner.sign(&order).unwrap();
        let immutables = build_starknet_source(
            &order,
            &Hashlock::from_secret(&secret),
            world.config.starknet.resolver_contract,
            world.config.safety_deposit,
            &TimelockOffsets::default(),
        )
        .unwrap();

        let deployer = StarknetSourceDeployer {
            chain: &world.starknet,
            resolver_account: world.config.starknet.resolver_account,
            resolver_contract: world.config.starknet.resolver_contract,
            fee_token: world.config.starknet.fee_token,
            limit_order_protocol: world.config.starknet.limit_order_protocol,
        };
        let deployment = deployer.deploy(&order, &signature, &immutables).unwrap();

        assert_eq!(deployment.immutables.timelocks.deployed_at(), GENESIS);
        assert_eq!(
            world.starknet.last_entrypoints(),
            vec!["transfer".to_string(), "deploy_src".to_string()]
        );
        assert_eq!(
            world
                .starknet
                .balance(&immutables.token, &deployment.escrow),
            Uint256::from(100u128)
        );
    }

    #[test]
    fn starknet_source_requires_allowance() {
        let world = SimWorld::new();
        world.fund_starknet_maker(Uint256::from(100u128));
        let secret = Secret::random();
        let order = world.starknet_order(Uint256::from(100u128), Uint256::one());
        let immutables = build_starknet_source(
            &order,
            &Hashlock::from_secret(&secret),
            world.config.starknet.resolver_contract,
            world.config.safety_deposit,
            &TimelockOffsets::default(),
        )
        .unwrap();
        let deployer = StarknetSourceDeployer {
            chain: &world.starknet,
            resolver_account: world.config.starknet.resolver_account,
            resolver_contract: world.config.starknet.resolver_contract,
            fee_token: world.config.starknet.fee_token,
            limit_order_protocol: world.config.starknet.limit_order_protocol,
        };
        let err = deployer
            .deploy(&order, &vec![order.order_hash()], &immutables)
            .unwrap_err();
        assert!(matches!(err, SwapError::InsufficientAllowance { .. }));
        assert!(world.starknet.last_entrypoints().is_empty());
    }
}
