use serde::{Deserialize, Serialize};
use sylvia::cw_schema::cw_serde;
use sylvia::cw_std::{MemoryStorage, Storage};
use tracing::{error, info, instrument, warn};

use crate::chain::Clock;
use crate::deploy::EscrowDeployment;
use crate::error::{ChainError, SwapError};
use crate::hashlock::{Hashlock, Secret};
use crate::immutables::EscrowImmutables;
use crate::journal::{LegRecord, SwapJournal, SwapRecord, UnconfirmedLeg, WithdrawalRecord};
use crate::route::SwapRoute;
use crate::withdraw::{WithdrawalCoordinator, WithdrawalReceipts};

#[cw_serde(crate = "sylvia")]
#[derive(Copy, Eq)]
pub enum SwapPhase {
    Init,
    AmountsParsed,
    Approved,
    OrderSigned,
    SrcDeployed,
    DstDeployed,
    Withdrawn,
    Aborted,
}

impl SwapPhase {
    fn next(self) -> Option<SwapPhase> {
        match self {
            SwapPhase::Init => Some(SwapPhase::AmountsParsed),
            SwapPhase::AmountsParsed => Some(SwapPhase::Approved),
            SwapPhase::Approved => Some(SwapPhase::OrderSigned),
            SwapPhase::OrderSigned => Some(SwapPhase::SrcDeployed),
            SwapPhase::SrcDeployed => Some(SwapPhase::DstDeployed),
            SwapPhase::DstDeployed => Some(SwapPhase::Withdrawn),
            SwapPhase::Withdrawn | SwapPhase::Aborted => None,
        }
    }

    /// Nothing is locked on chain yet.
    pub fn can_abort(self) -> bool {
        matches!(
            self,
            SwapPhase::Init | SwapPhase::AmountsParsed | SwapPhase::Approved | SwapPhase::OrderSigned
        )
    }

    pub fn ensure_transition(self, to: SwapPhase) -> Result<SwapPhase, SwapError> {
        let allowed = match to {
            SwapPhase::Aborted => self.can_abort(),
            _ => self.next() == Some(to),
        };
        if !allowed {
            return Err(SwapError::InvalidTransition { from: self, to });
        }
        Ok(to)
    }
}

/// Raw swap parameters as given on the command line.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SwapRequest {
    pub src_token: String,
    pub making_amount: String,
    pub dst_token: String,
    pub taking_amount: String,
    /// The user's address on the destination chain.
    pub counterparty: String,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SwapOutcome {
    pub order_hash: String,
    pub src_escrow: String,
    pub dst_escrow: String,
    pub receipts: WithdrawalReceipts,
}

fn leg_record<I: EscrowImmutables>(chain: &str, deployment: &EscrowDeployment<I>) -> LegRecord {
    LegRecord {
        chain: chain.to_string(),
        escrow: deployment.escrow.to_string(),
        tx_hash: deployment.tx_hash.clone(),
        immutables: deployment.immutables.record(),
        cancellation_at: deployment.cancellation_at(),
    }
}

/// Drives one swap at a time through a [`SwapRoute`], journaling every
/// phase it reaches.
pub struct SwapOrchestrator<R, C, S = MemoryStorage> {
    route: R,
    clock: C,
    journal: SwapJournal<S>,
}

impl<R: SwapRoute, C: Clock> SwapOrchestrator<R, C> {
    pub fn new(route: R, clock: C) -> Self {
        Self::with_journal(route, clock, SwapJournal::default())
    }
}

impl<R: SwapRoute, C: Clock, S: Storage> SwapOrchestrator<R, C, S> {
    pub fn with_journal(route: R, clock: C, journal: SwapJournal<S>) -> Self {
        Self {
            route,
            clock,
            journal,
        }
    }

    pub fn route(&self) -> &R {
        &self.route
    }

    pub fn journal(&self) -> &SwapJournal<S> {
        &self.journal
    }

    pub fn execute(&mut self, request: &SwapRequest) -> Result<SwapOutcome, SwapError> {
        self.execute_with_secret(request, Secret::random())
    }

    #[instrument(skip_all, fields(route = self.route.name()))]
    pub fn execute_with_secret(
        &mut self,
        request: &SwapRequest,
        secret: Secret,
    ) -> Result<SwapOutcome, SwapError> {
        let hashlock = Hashlock::from_secret(&secret);
        let mut phase = SwapPhase::Init;

        let (plan, signed) = match self.prepare(request, &hashlock, &mut phase) {
            Ok(prepared) => prepared,
            Err(err) => return Err(aborted(phase, err)),
        };

        let key = self.route.order_key(&signed);
        let order_hash = format!("0x{}", hex::encode(key));
        let mut record = SwapRecord::new(order_hash.clone(), self.route.name(), hashlock);
        self.journal.save(&key, &record)?;

        let src = match self.route.deploy_source(&signed) {
            Ok(src) => src,
            Err(err) => {
                if let Some(leg) = unconfirmed_source(R::SOURCE, &err) {
                    record.src_unconfirmed = Some(leg);
                    return Err(self.halt(&key, record, err));
                }
                record.phase = phase.ensure_transition(SwapPhase::Aborted)?;
                record.failure = Some(err.to_string());
                self.journal.save(&key, &record)?;
                return Err(aborted(phase, err));
            }
        };
        phase = phase.ensure_transition(SwapPhase::SrcDeployed)?;
        record.phase = phase;
        record.src = Some(leg_record(R::SOURCE, &src));
        self.journal.save(&key, &record)?;
        info!(%order_hash, escrow = %src.escrow, cancellation_at = src.cancellation_at(), "source escrow locked");

        let dst = match self.route.deploy_destination(
            &plan,
            &signed,
            &hashlock,
            src.cancellation_at(),
        ) {
            Ok(dst) => dst,
            Err(err) => return Err(self.halt(&key, record, err)),
        };
        phase = phase.ensure_transition(SwapPhase::DstDeployed)?;
        record.phase = phase;
        record.dst = Some(leg_record(R::DESTINATION, &dst));
        self.journal.save(&key, &record)?;
        info!(%order_hash, escrow = %dst.escrow, cancellation_at = dst.cancellation_at(), "destination escrow locked");

        let config = self.route.config();
        let mut coordinator =
            WithdrawalCoordinator::new(&self.clock, config.withdrawal_order, config.retry);
        let receipts = match self.route.withdraw(&mut coordinator, &secret, &src, &dst) {
            Ok(receipts) => receipts,
            Err(err) => return Err(self.halt(&key, record, err)),
        };
        phase = phase.ensure_transition(SwapPhase::Withdrawn)?;
        record.phase = phase;
        record.withdrawals = Some(WithdrawalRecord {
            src_tx: receipts.src_tx.clone(),
            dst_tx: receipts.dst_tx.clone(),
        });
        self.journal.save(&key, &record)?;
        info!(%order_hash, src_tx = %receipts.src_tx, dst_tx = %receipts.dst_tx, "swap settled");

        Ok(SwapOutcome {
            order_hash,
            src_escrow: src.escrow.to_string(),
            dst_escrow: dst.escrow.to_string(),
            receipts,
        })
    }

    fn prepare(
        &self,
        request: &SwapRequest,
        hashlock: &Hashlock,
        phase: &mut SwapPhase,
    ) -> Result<(R::Plan, R::Signed), SwapError> {
        let plan = self.route.parse(request)?;
        *phase = phase.ensure_transition(SwapPhase::AmountsParsed)?;
        self.route.approve(&plan)?;
        *phase = phase.ensure_transition(SwapPhase::Approved)?;
        let signed = self.route.sign_order(&plan, hashlock)?;
        *phase = phase.ensure_transition(SwapPhase::OrderSigned)?;
        Ok((plan, signed))
    }

    /// Funds are locked: keep the phase, record the failure and leave the
    /// swap for manual cancellation.
    fn halt(&mut self, key: &[u8; 32], mut record: SwapRecord, err: SwapError) -> SwapError {
        error!(phase = ?record.phase, error = %err, "swap halted, escrows need manual cancellation");
        record.failure = Some(err.to_string());
        if let Err(save_err) = self.journal.save(key, &record) {
            warn!(error = %save_err, "could not journal halted swap");
        }
        SwapError::Halted {
            phase: record.phase,
            source: Box::new(err),
        }
    }

    /// Marks a journaled swap aborted. Refused once a source deploy went out.
    pub fn abort(&mut self, key: &[u8; 32]) -> Result<SwapRecord, SwapError> {
        let mut record = self.journal.load(key)?;
        if record.source_submitted() {
            return Err(SwapError::InvalidTransition {
                from: record.phase,
                to: SwapPhase::Aborted,
            });
        }
        record.phase = record.phase.ensure_transition(SwapPhase::Aborted)?;
        self.journal.save(key, &record)?;
        warn!(order_hash = %record.order_hash, "swap aborted");
        Ok(record)
    }

    pub fn pending_cancellations(&self) -> Result<Vec<SwapRecord>, SwapError> {
        Ok(self.journal.pending_cancellations()?)
    }
}

/// Source deploy failures after which the maker's funds may already sit in
/// an escrow.
fn unconfirmed_source(chain: &str, err: &SwapError) -> Option<UnconfirmedLeg> {
    let (tx_hash, escrow) = match err {
        SwapError::SourceUnconfirmed {
            tx_hash, escrow, ..
        } => (tx_hash.clone(), escrow.clone()),
        SwapError::Chain(ChainError::Unconfirmed(tx_hash)) => (tx_hash.clone(), None),
        _ => return None,
    };
    Some(UnconfirmedLeg {
        chain: chain.to_string(),
        tx_hash,
        escrow,
    })
}

fn aborted(phase: SwapPhase, err: SwapError) -> SwapError {
    warn!(phase = ?phase, error = %err, "swap aborted before any escrow was funded");
    SwapError::Halted {
        phase: SwapPhase::Aborted,
        source: Box::new(err),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::order::HashSigner;
    use crate::route::{OpToStarknetRoute, StarknetToOpRoute};
    use crate::sim::{ManualClock, SimEvmChain, SimOrderSdk, SimStarknetChain, SimWorld, GENESIS};
    use crate::states::{parse_units, EvmAddress, Hash32};
    use crate::withdraw::WithdrawalOrder;
    use sylvia::cw_std::Uint256;

    type OpOrchestrator<'a> = SwapOrchestrator<
        OpToStarknetRoute<&'a SimEvmChain, &'a SimStarknetChain, &'a SimOrderSdk>,
        &'a ManualClock,
    >;
    type StarknetOrchestrator<'a> = SwapOrchestrator<
        StarknetToOpRoute<&'a SimStarknetChain, &'a SimEvmChain, HashSigner>,
        &'a ManualClock,
    >;

    fn units(value: &str) -> Uint256 {
        parse_units(value, 18).unwrap()
    }

    fn op_orchestrator(world: &SimWorld) -> OpOrchestrator<'_> {
        SwapOrchestrator::new(
            OpToStarknetRoute {
                evm: &world.evm,
                starknet: &world.starknet,
                sdk: &world.sdk,
                config: world.config.clone(),
            },
            &world.clock,
        )
    }

    fn starknet_orchestrator(world: &SimWorld) -> StarknetOrchestrator<'_> {
        SwapOrchestrator::new(
            StarknetToOpRoute {
                starknet: &world.starknet,
                evm: &world.evm,
                signer: HashSigner,
                config: world.config.clone(),
            },
            &world.clock,
        )
    }

    fn op_request(world: &SimWorld) -> SwapRequest {
        SwapRequest {
            src_token: world.evm_token.to_string(),
            making_amount: "100".to_string(),
            dst_token: world.starknet_token.to_string(),
            taking_amount: "1".to_string(),
            counterparty: world.config.starknet.user.to_string(),
        }
    }

    fn starknet_request(world: &SimWorld) -> SwapRequest {
        SwapRequest {
            src_token: world.starknet_token.to_string(),
            making_amount: "100".to_string(),
            dst_token: world.evm_token.to_string(),
            taking_amount: "1".to_string(),
            counterparty: world.config.evm.user.to_string(),
        }
    }

    #[test]
    fn phases_only_move_forward() {
        assert_eq!(
            SwapPhase::Init.ensure_transition(SwapPhase::AmountsParsed),
            Ok(SwapPhase::AmountsParsed)
        );
        assert_eq!(
            SwapPhase::OrderSigned.ensure_transition(SwapPhase::Aborted),
            Ok(SwapPhase::Aborted)
        );
        assert_eq!(
            SwapPhase::SrcDeployed.ensure_transition(SwapPhase::Aborted),
            Err(SwapError::InvalidTransition {
                from: SwapPhase::SrcDeployed,
                to: SwapPhase::Aborted
            })
        );
        assert!(SwapPhase::Init
            .ensure_transition(SwapPhase::SrcDeployed)
            .is_err());
        assert!(SwapPhase::Withdrawn
            .ensure_transition(SwapPhase::Init)
            .is_err());
    }

    #[test]
    fn op_to_starknet_settles() {
        let world = SimWorld::new();
        world.fund_evm_maker(units("100"));
        let secret = Secret::random();
        let hashlock = Hashlock::from_secret(&secret);
        let mut orchestrator = op_orchestrator(&world);

        let outcome = orchestrator
            .execute_with_secret(&op_request(&world), secret)
            .unwrap();

        // Maker's tokens went to the resolver, the receiver got the destination tokens.
        assert_eq!(
            world.evm.balance(&world.evm_token, &world.config.evm.resolver),
            units("100")
        );
        assert_eq!(
            world
                .starknet
                .balance(&world.starknet_token, &world.config.starknet.user),
            units("1")
        );
        // Destination first, after the withdrawal windows opened.
        assert_eq!(world.clock.now(), GENESIS + 5);

        let key = Hash32::from_hex(&outcome.order_hash).unwrap().0;
        let record = orchestrator.journal().load(&key).unwrap();
        assert_eq!(record.phase, SwapPhase::Withdrawn);
        assert_eq!(record.hashlock, hashlock);
        assert_eq!(record.route, "op-to-starknet");
        assert_eq!(record.src.as_ref().map(|leg| leg.chain.as_str()), Some("optimism"));
        assert_eq!(record.dst.as_ref().map(|leg| leg.escrow.clone()), Some(outcome.dst_escrow));
        assert!(!record.needs_cancellation());
    }

    #[test]
    fn starknet_to_op_settles() {
        let world = SimWorld::new();
        world.fund_starknet_maker(units("100"));
        let mut orchestrator = starknet_orchestrator(&world);

        let outcome = orchestrator.execute(&starknet_request(&world)).unwrap();

        assert_eq!(
            world
                .evm
                .balance(&world.evm_token, &world.config.evm.user),
            units("1")
        );
        assert_eq!(
            world.starknet.balance(
                &world.starknet_token,
                &world.config.starknet.resolver_contract
            ),
            units("100")
        );
        assert_eq!(orchestrator.journal().records().unwrap().len(), 1);
        assert!(outcome.receipts.src_tx.starts_with("0x"));
    }

    #[test]
    fn source_first_order_is_honored() {
        let mut world = SimWorld::new();
        world.config.withdrawal_order = WithdrawalOrder::SourceFirst;
        world.fund_starknet_maker(units("100"));
        let mut orchestrator = starknet_orchestrator(&world);

        orchestrator.execute(&starknet_request(&world)).unwrap();

        assert_eq!(
            world.starknet.last_entrypoints(),
            vec!["withdraw_src".to_string()]
        );
        assert_eq!(
            world.evm.submissions().last().map(String::as_str),
            Some("withdraw")
        );
    }

    #[test]
    fn insufficient_funds_aborts_before_any_transaction() {
        let world = SimWorld::new();
        let mut orchestrator = op_orchestrator(&world);

        let err = orchestrator.execute(&op_request(&world)).unwrap_err();

        assert!(err.is_precondition());
        assert!(matches!(err.root(), SwapError::InsufficientFunds { .. }));
        assert!(matches!(
            err,
            SwapError::Halted {
                phase: SwapPhase::Aborted,
                ..
            }
        ));
        assert!(world.evm.submissions().is_empty());
        assert!(orchestrator.journal().records().unwrap().is_empty());
    }

    #[test]
    fn frozen_clock_halts_before_withdrawal() {
        let world = SimWorld::frozen();
        world.fund_evm_maker(units("100"));
        let mut orchestrator = op_orchestrator(&world);

        let err = orchestrator.execute(&op_request(&world)).unwrap_err();

        match &err {
            SwapError::Halted { phase, source } => {
                assert_eq!(*phase, SwapPhase::DstDeployed);
                assert!(matches!(**source, SwapError::WithdrawalWindowNotOpen { .. }));
            }
            other => panic!("unexpected error {other:?}"),
        }
        assert_eq!(
            world.starknet.last_entrypoints(),
            vec!["transfer", "transfer", "deploy_dst"]
        );
        assert!(!world.evm.submissions().contains(&"withdraw".to_string()));

        let pending = orchestrator.pending_cancellations().unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].phase, SwapPhase::DstDeployed);
        assert!(pending[0].dst.is_some());
    }

    #[test]
    fn transient_counterpart_revert_is_retried() {
        let world = SimWorld::new();
        world.fund_evm_maker(units("100"));
        world.evm.fail_next_withdrawals(1);
        let mut orchestrator = op_orchestrator(&world);

        orchestrator.execute(&op_request(&world)).unwrap();

        let withdrawals = world
            .evm
            .submissions()
            .iter()
            .filter(|call| call.as_str() == "withdraw")
            .count();
        assert_eq!(withdrawals, 2);
        assert_eq!(
            world.evm.balance(&world.evm_token, &world.config.evm.resolver),
            units("100")
        );
    }

    #[test]
    fn stuck_counterpart_is_left_for_cancellation() {
        let world = SimWorld::new();
        world.fund_evm_maker(units("100"));
        world.evm.fail_next_withdrawals(1_000);
        let mut orchestrator = op_orchestrator(&world);

        let err = orchestrator.execute(&op_request(&world)).unwrap_err();

        assert!(matches!(
            err.root(),
            SwapError::CounterpartWithdrawalStuck { .. }
        ));
        // Retried right up to the source cancellation instant.
        assert_eq!(world.clock.now(), GENESIS + 642);
        // The receiver was paid on Starknet, the source escrow still holds the tokens.
        assert_eq!(
            world
                .starknet
                .balance(&world.starknet_token, &world.config.starknet.user),
            units("1")
        );
        let pending = orchestrator.pending_cancellations().unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].phase, SwapPhase::DstDeployed);
    }

    #[test]
    fn destination_failure_halts_after_source() {
        let world = SimWorld::new();
        world.fund_evm_maker(units("100"));
        world.starknet.suppress_events(true);
        let mut orchestrator = op_orchestrator(&world);

        let err = orchestrator.execute(&op_request(&world)).unwrap_err();

        assert!(matches!(
            err,
            SwapError::Halted {
                phase: SwapPhase::SrcDeployed,
                ..
            }
        ));
        assert!(!err.is_precondition());
        let pending = orchestrator.pending_cancellations().unwrap();
        assert_eq!(pending.len(), 1);
        assert!(pending[0].dst.is_none());
        assert!(pending[0]
            .failure
            .as_deref()
            .is_some_and(|failure| failure.contains("not found")));
    }

    #[test]
    fn abort_is_refused_once_source_is_locked() {
        let world = SimWorld::new();
        world.fund_evm_maker(units("100"));
        world.starknet.suppress_events(true);
        let mut orchestrator = op_orchestrator(&world);
        let _ = orchestrator.execute(&op_request(&world));

        let record = orchestrator.pending_cancellations().unwrap().remove(0);
        let key = Hash32::from_hex(&record.order_hash).unwrap().0;
        assert!(matches!(
            orchestrator.abort(&key),
            Err(SwapError::InvalidTransition { .. })
        ));
        assert!(matches!(
            orchestrator.abort(&[0u8; 32]),
            Err(SwapError::UnknownSwap(_))
        ));
    }

    #[test]
    fn unconfirmed_source_deploy_is_left_for_cancellation() {
        let world = SimWorld::new();
        world.fund_evm_maker(units("100"));
        world.evm.suppress_events(true);
        let mut orchestrator = op_orchestrator(&world);

        let err = orchestrator.execute(&op_request(&world)).unwrap_err();

        assert!(matches!(
            err,
            SwapError::Halted {
                phase: SwapPhase::OrderSigned,
                ..
            }
        ));
        assert!(matches!(err.root(), SwapError::DeployEventNotFound { .. }));
        assert!(!err.is_precondition());
        // The fill went through: the maker's tokens left their account.
        assert!(world
            .evm
            .balance(&world.evm_token, &world.config.evm.user)
            .is_zero());
        assert!(world.starknet.transactions().is_empty());

        let pending = orchestrator.pending_cancellations().unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].phase, SwapPhase::OrderSigned);
        assert!(pending[0].src.is_none());
        let leg = pending[0].src_unconfirmed.clone().unwrap();
        assert_eq!(leg.chain, "optimism");
        assert!(leg.tx_hash.starts_with("0x"));
        let escrow: EvmAddress = leg.escrow.unwrap().parse().unwrap();
        assert_eq!(world.evm.balance(&world.evm_token, &escrow), units("100"));

        let key = Hash32::from_hex(&pending[0].order_hash).unwrap().0;
        assert!(matches!(
            orchestrator.abort(&key),
            Err(SwapError::InvalidTransition { .. })
        ));
    }

    #[test]
    fn underfunded_resolver_aborts_before_source_deploy() {
        let mut world = SimWorld::new();
        world.fund_evm_maker(units("100"));
        // Holds no native balance for the safety deposit.
        world.config.evm.resolver_account = EvmAddress([0x99; 20]);
        let mut orchestrator = op_orchestrator(&world);

        let err = orchestrator.execute(&op_request(&world)).unwrap_err();

        assert!(err.is_precondition());
        assert!(matches!(err.root(), SwapError::InsufficientFunds { .. }));
        let records = orchestrator.journal().records().unwrap();
        assert_eq!(records[0].phase, SwapPhase::Aborted);
        assert!(!records[0].needs_cancellation());
        assert!(!world.evm.submissions().contains(&"deploySrc".to_string()));
    }

    #[test]
    fn one_orchestrator_runs_swaps_back_to_back() {
        let world = SimWorld::new();
        world.fund_evm_maker(units("200"));
        let mut orchestrator = op_orchestrator(&world);

        orchestrator.execute(&op_request(&world)).unwrap();
        world.clock.advance(60);
        orchestrator.execute(&op_request(&world)).unwrap();

        let records = orchestrator.journal().records().unwrap();
        assert_eq!(records.len(), 2);
        assert!(records
            .iter()
            .all(|record| record.phase == SwapPhase::Withdrawn));
        assert_ne!(world.config.evm.user, EvmAddress::ZERO);
    }
}
