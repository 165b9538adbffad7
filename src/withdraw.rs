use std::time::Duration;

use sylvia::cw_schema::cw_serde;
use tracing::{info, instrument, warn};

use crate::chain::{explorer_link, Clock, EvmChain, StarknetCall, StarknetChain, STARKNET_CHAIN_ID};
use crate::deploy::{EscrowDeployment, EscrowRole};
use crate::error::SwapError;
use crate::hashlock::Secret;
use crate::immutables::{EvmImmutables, StarknetImmutables};
use crate::states::{EvmAddress, StarkFelt};

/// Which escrow receives the secret first.
#[cw_serde(crate = "sylvia")]
#[derive(Copy, Eq, Default)]
pub enum WithdrawalOrder {
    #[default]
    DestinationFirst,
    SourceFirst,
}

#[cw_serde(crate = "sylvia")]
#[derive(Copy, Eq)]
pub enum WithdrawalState {
    Pending,
    WithdrawingDst,
    WithdrawingSrc,
    Settled,
    Failed,
}

/// Backoff for the counterpart leg once the secret is public. Retries only
/// end with success or at the leg's cancellation instant.
#[cw_serde(crate = "sylvia")]
#[derive(Copy, Eq)]
pub struct RetryPolicy {
    pub initial_backoff_secs: u64,
    pub max_backoff_secs: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial_backoff_secs: 2,
            max_backoff_secs: 60,
        }
    }
}

impl RetryPolicy {
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u64.checked_shl(attempt).unwrap_or(u64::MAX);
        let secs = self
            .initial_backoff_secs
            .saturating_mul(factor)
            .min(self.max_backoff_secs);
        Duration::from_secs(secs)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LegReceipt {
    pub tx_hash: String,
    pub success: bool,
}

/// One escrow to withdraw from, with everything needed to reveal the
/// secret to it.
pub trait WithdrawalLeg {
    fn describe(&self) -> String;
    fn role(&self) -> EscrowRole;
    fn chain_time(&self) -> Result<u64, SwapError>;
    fn window_opens_at(&self) -> u64;
    fn cancellation_at(&self) -> u64;
    fn withdraw(&self, secret: &Secret) -> Result<LegReceipt, SwapError>;
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WithdrawalReceipts {
    pub src_tx: String,
    pub dst_tx: String,
}

pub struct WithdrawalCoordinator<C> {
    clock: C,
    order: WithdrawalOrder,
    retry: RetryPolicy,
    state: WithdrawalState,
}

impl<C: Clock> WithdrawalCoordinator<C> {
    pub fn new(clock: C, order: WithdrawalOrder, retry: RetryPolicy) -> Self {
        Self {
            clock,
            order,
            retry,
            state: WithdrawalState::Pending,
        }
    }

    pub fn state(&self) -> WithdrawalState {
        self.state
    }

    pub fn order(&self) -> WithdrawalOrder {
        self.order
    }

    fn working_state(leg: &dyn WithdrawalLeg) -> WithdrawalState {
        match leg.role() {
            EscrowRole::Source => WithdrawalState::WithdrawingSrc,
            EscrowRole::Destination => WithdrawalState::WithdrawingDst,
        }
    }

    /// Reveals `secret` to both escrows. The first leg fails the whole
    /// withdrawal; the second is retried since the secret is public by then.
    #[instrument(skip_all, fields(order = ?self.order))]
    pub fn withdraw(
        &mut self,
        secret: &Secret,
        src: &dyn WithdrawalLeg,
        dst: &dyn WithdrawalLeg,
    ) -> Result<WithdrawalReceipts, SwapError> {
        self.state = WithdrawalState::Pending;
        let (first, second) = match self.order {
            WithdrawalOrder::DestinationFirst => (dst, src),
            WithdrawalOrder::SourceFirst => (src, dst),
        };

        self.state = Self::working_state(first);
        let first_tx = match self.reveal(secret, first) {
            Ok(tx_hash) => tx_hash,
            Err(err) => {
                self.state = WithdrawalState::Failed;
                return Err(err);
            }
        };
        info!(leg = %first.describe(), tx_hash = %first_tx, "secret revealed");

        self.state = Self::working_state(second);
        let second_tx = match self.complete_counterpart(secret, second) {
            Ok(tx_hash) => tx_hash,
            Err(err) => {
                self.state = WithdrawalState::Failed;
                return Err(err);
            }
        };
        self.state = WithdrawalState::Settled;

        let receipts = match self.order {
            WithdrawalOrder::DestinationFirst => WithdrawalReceipts {
                src_tx: second_tx,
                dst_tx: first_tx,
            },
            WithdrawalOrder::SourceFirst => WithdrawalReceipts {
                src_tx: first_tx,
                dst_tx: second_tx,
            },
        };
        Ok(receipts)
    }

    /// Sleeps until the leg's window opens, then checks again. Nothing is
    /// submitted when the chain has not caught up.
    pub fn wait_for_window(&self, leg: &dyn WithdrawalLeg) -> Result<u64, SwapError> {
        let opens_at = leg.window_opens_at();
        let mut now = leg.chain_time()?;
        if now < opens_at {
            let wait = opens_at - now;
            info!(leg = %leg.describe(), wait_secs = wait, "waiting for withdrawal window");
            self.clock.sleep(Duration::from_secs(wait));
            now = leg.chain_time()?;
            if now < opens_at {
                return Err(SwapError::WithdrawalWindowNotOpen {
                    leg: leg.describe(),
                    opens_at,
                    now,
                });
            }
        }
        if now >= leg.cancellation_at() {
            return Err(SwapError::WithdrawalWindowClosed {
                leg: leg.describe(),
                closed_at: leg.cancellation_at(),
                now,
            });
        }
        Ok(now)
    }

    fn reveal(&self, secret: &Secret, leg: &dyn WithdrawalLeg) -> Result<String, SwapError> {
        self.wait_for_window(leg)?;
        let receipt = leg.withdraw(secret)?;
        if !receipt.success {
            return Err(SwapError::WithdrawalReverted {
                leg: leg.describe(),
                tx_hash: receipt.tx_hash,
            });
        }
        Ok(receipt.tx_hash)
    }

    fn complete_counterpart(
        &self,
        secret: &Secret,
        leg: &dyn WithdrawalLeg,
    ) -> Result<String, SwapError> {
        let cancellation_at = leg.cancellation_at();
        let mut attempts = 0;
        loop {
            attempts += 1;
            let err = match self.reveal(secret, leg) {
                Ok(tx_hash) => return Ok(tx_hash),
                Err(err) => err,
            };
            let now = match &err {
                SwapError::WithdrawalWindowClosed { now, .. } => *now,
                _ => leg.chain_time().unwrap_or_else(|_| self.clock.now()),
            };
            if now >= cancellation_at {
                warn!(leg = %leg.describe(), attempts, error = %err, "counterpart withdrawal stuck");
                return Err(SwapError::CounterpartWithdrawalStuck {
                    leg: leg.describe(),
                    attempts,
                    last_error: err.to_string(),
                });
            }
            // Never sleep past the cancellation instant.
            let backoff = self
                .retry
                .backoff(attempts - 1)
                .min(Duration::from_secs(cancellation_at - now));
            warn!(
                leg = %leg.describe(),
                attempts,
                backoff_secs = backoff.as_secs(),
                error = %err,
                "counterpart withdrawal failed, retrying"
            );
            self.clock.sleep(backoff);
        }
    }
}

fn role_name(role: EscrowRole) -> &'static str {
    match role {
        EscrowRole::Source => "source",
        EscrowRole::Destination => "destination",
    }
}

/// Withdraws from an EVM escrow, directly or through the resolver contract
/// when it is the escrow's taker.
pub struct EvmWithdrawalLeg<C> {
    pub chain: C,
    pub caller: EvmAddress,
    pub via: Option<EvmAddress>,
    pub escrow: EvmAddress,
    pub immutables: EvmImmutables,
    pub role: EscrowRole,
}

impl<C: EvmChain> EvmWithdrawalLeg<C> {
    pub fn from_deployment(
        chain: C,
        caller: EvmAddress,
        via: Option<EvmAddress>,
        deployment: &EscrowDeployment<EvmImmutables>,
    ) -> Self {
        Self {
            chain,
            caller,
            via,
            escrow: deployment.escrow,
            immutables: deployment.immutables,
            role: deployment.role,
        }
    }
}

impl<C: EvmChain> WithdrawalLeg for EvmWithdrawalLeg<C> {
    fn describe(&self) -> String {
        format!("optimism {} escrow {}", role_name(self.role), self.escrow)
    }

    fn role(&self) -> EscrowRole {
        self.role
    }

    fn chain_time(&self) -> Result<u64, SwapError> {
        Ok(self.chain.block_timestamp()?)
    }

    fn window_opens_at(&self) -> u64 {
        self.immutables.timelocks.get(self.role.withdrawal_stage())
    }

    fn cancellation_at(&self) -> u64 {
        self.immutables.timelocks.get(self.role.cancellation_stage())
    }

    fn withdraw(&self, secret: &Secret) -> Result<LegReceipt, SwapError> {
        let to = self.via.unwrap_or(self.escrow);
        let receipt = self.chain.withdraw(
            &self.caller,
            &to,
            &self.escrow,
            secret.evm_word(),
            &self.immutables,
        )?;
        let tx_hash = receipt.tx_hash.to_string();
        info!(
            escrow = %self.escrow,
            success = receipt.success,
            link = %explorer_link(self.chain.chain_id(), &tx_hash),
            "withdraw submitted"
        );
        Ok(LegReceipt {
            tx_hash,
            success: receipt.success,
        })
    }
}

/// Withdraws from a Starknet escrow through the resolver contract.
pub struct StarknetWithdrawalLeg<C> {
    pub chain: C,
    pub account: StarkFelt,
    pub resolver_contract: StarkFelt,
    pub escrow: StarkFelt,
    pub immutables: StarknetImmutables,
    pub role: EscrowRole,
}

impl<C: StarknetChain> StarknetWithdrawalLeg<C> {
    pub fn from_deployment(
        chain: C,
        account: StarkFelt,
        resolver_contract: StarkFelt,
        deployment: &EscrowDeployment<StarknetImmutables>,
    ) -> Self {
        Self {
            chain,
            account,
            resolver_contract,
            escrow: deployment.escrow,
            immutables: deployment.immutables,
            role: deployment.role,
        }
    }
}

impl<C: StarknetChain> WithdrawalLeg for StarknetWithdrawalLeg<C> {
    fn describe(&self) -> String {
        format!("starknet {} escrow {}", role_name(self.role), self.escrow)
    }

    fn role(&self) -> EscrowRole {
        self.role
    }

    fn chain_time(&self) -> Result<u64, SwapError> {
        Ok(self.chain.block_timestamp()?)
    }

    fn window_opens_at(&self) -> u64 {
        self.immutables.timelocks.get(self.role.withdrawal_stage())
    }

    fn cancellation_at(&self) -> u64 {
        self.immutables.timelocks.get(self.role.cancellation_stage())
    }

    fn withdraw(&self, secret: &Secret) -> Result<LegReceipt, SwapError> {
        let call = match self.role {
            EscrowRole::Source => StarknetCall::withdraw_src(
                self.resolver_contract,
                self.escrow,
                secret.as_felt(),
                &self.immutables,
            ),
            EscrowRole::Destination => StarknetCall::withdraw_dst(
                self.resolver_contract,
                self.escrow,
                secret.as_felt(),
                &self.immutables,
            ),
        };
        let receipt = self.chain.execute(&self.account, &[call])?;
        let tx_hash = receipt.tx_hash.to_string();
        info!(
            escrow = %self.escrow,
            success = receipt.success,
            link = %explorer_link(STARKNET_CHAIN_ID, &tx_hash),
            "withdraw submitted"
        );
        Ok(LegReceipt {
            tx_hash,
            success: receipt.success,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::ManualClock;
    use std::cell::RefCell;
    use std::collections::VecDeque;
    use std::rc::Rc;

    struct ScriptedLeg {
        name: &'static str,
        role: EscrowRole,
        clock: ManualClock,
        opens_at: u64,
        cancellation_at: u64,
        outcomes: RefCell<VecDeque<bool>>,
        log: Rc<RefCell<Vec<&'static str>>>,
    }

    impl ScriptedLeg {
        fn new(
            name: &'static str,
            role: EscrowRole,
            clock: &ManualClock,
            log: &Rc<RefCell<Vec<&'static str>>>,
        ) -> Self {
            Self {
                name,
                role,
                clock: clock.clone(),
                opens_at: 1_005,
                cancellation_at: 1_400,
                outcomes: RefCell::new(VecDeque::new()),
                log: log.clone(),
            }
        }

        fn failing(self, times: usize) -> Self {
            self.outcomes.borrow_mut().extend(std::iter::repeat(false).take(times));
            self
        }
    }

    impl WithdrawalLeg for ScriptedLeg {
        fn describe(&self) -> String {
            self.name.to_string()
        }

        fn role(&self) -> EscrowRole {
            self.role
        }

        fn chain_time(&self) -> Result<u64, SwapError> {
            Ok(self.clock.now())
        }

        fn window_opens_at(&self) -> u64 {
            self.opens_at
        }

        fn cancellation_at(&self) -> u64 {
            self.cancellation_at
        }

        fn withdraw(&self, _secret: &Secret) -> Result<LegReceipt, SwapError> {
            self.log.borrow_mut().push(self.name);
            let success = self.outcomes.borrow_mut().pop_front().unwrap_or(true);
            Ok(LegReceipt {
                tx_hash: format!("{}-tx", self.name),
                success,
            })
        }
    }

    fn legs(clock: &ManualClock) -> (ScriptedLeg, ScriptedLeg, Rc<RefCell<Vec<&'static str>>>) {
        let log = Rc::new(RefCell::new(Vec::new()));
        let src = ScriptedLeg::new("src", EscrowRole::Source, clock, &log);
        let dst = ScriptedLeg::new("dst", EscrowRole::Destination, clock, &log);
        (src, dst, log)
    }

    #[test]
    fn destination_first_waits_then_settles() {
        let clock = ManualClock::new(1_000);
        let (src, dst, log) = legs(&clock);
        let mut coordinator =
            WithdrawalCoordinator::new(clock.clone(), WithdrawalOrder::default(), RetryPolicy::default());

        let receipts = coordinator.withdraw(&Secret::random(), &src, &dst).unwrap();

        assert_eq!(*log.borrow(), vec!["dst", "src"]);
        assert_eq!(receipts.dst_tx, "dst-tx");
        assert_eq!(receipts.src_tx, "src-tx");
        assert_eq!(coordinator.state(), WithdrawalState::Settled);
        assert_eq!(clock.now(), 1_005);
    }

    #[test]
    fn source_first_order() {
        let clock = ManualClock::new(1_010);
        let (src, dst, log) = legs(&clock);
        let mut coordinator =
            WithdrawalCoordinator::new(clock, WithdrawalOrder::SourceFirst, RetryPolicy::default());
        coordinator.withdraw(&Secret::random(), &src, &dst).unwrap();
        assert_eq!(*log.borrow(), vec!["src", "dst"]);
    }

    #[test]
    fn frozen_clock_submits_nothing() {
        let clock = ManualClock::frozen(1_000);
        let (src, dst, log) = legs(&clock);
        let mut coordinator =
            WithdrawalCoordinator::new(clock, WithdrawalOrder::default(), RetryPolicy::default());

        let err = coordinator.withdraw(&Secret::random(), &src, &dst).unwrap_err();

        assert_eq!(
            err,
            SwapError::WithdrawalWindowNotOpen {
                leg: "dst".to_string(),
                opens_at: 1_005,
                now: 1_000
            }
        );
        assert!(log.borrow().is_empty());
        assert_eq!(coordinator.state(), WithdrawalState::Failed);
    }

    #[test]
    fn first_leg_revert_fails_without_counterpart() {
        let clock = ManualClock::new(1_010);
        let (src, dst, log) = legs(&clock);
        let dst = dst.failing(1);
        let mut coordinator =
            WithdrawalCoordinator::new(clock, WithdrawalOrder::default(), RetryPolicy::default());

        let err = coordinator.withdraw(&Secret::random(), &src, &dst).unwrap_err();

        assert!(matches!(err, SwapError::WithdrawalReverted { .. }));
        assert_eq!(*log.borrow(), vec!["dst"]);
        assert_eq!(coordinator.state(), WithdrawalState::Failed);
    }

    #[test]
    fn counterpart_is_retried_with_backoff() {
        let clock = ManualClock::new(1_010);
        let (src, dst, log) = legs(&clock);
        let src = src.failing(2);
        let mut coordinator =
            WithdrawalCoordinator::new(clock.clone(), WithdrawalOrder::default(), RetryPolicy::default());

        coordinator.withdraw(&Secret::random(), &src, &dst).unwrap();

        assert_eq!(*log.borrow(), vec!["dst", "src", "src", "src"]);
        assert_eq!(coordinator.state(), WithdrawalState::Settled);
        // 2s then 4s of backoff.
        assert_eq!(clock.now(), 1_016);
    }

    #[test]
    fn counterpart_retries_until_cancellation() {
        let clock = ManualClock::new(1_010);
        let (src, dst, log) = legs(&clock);
        // More failures than any fixed attempt budget would allow.
        let src = src.failing(8);
        let mut coordinator =
            WithdrawalCoordinator::new(clock.clone(), WithdrawalOrder::default(), RetryPolicy::default());

        let receipts = coordinator.withdraw(&Secret::random(), &src, &dst).unwrap();

        assert_eq!(receipts.src_tx, "src-tx");
        assert_eq!(log.borrow().iter().filter(|leg| **leg == "src").count(), 9);
        assert_eq!(coordinator.state(), WithdrawalState::Settled);
        // 2 + 4 + 8 + 16 + 32 + 60 + 60 + 60 seconds of backoff.
        assert_eq!(clock.now(), 1_252);
    }

    #[test]
    fn counterpart_gives_up_only_at_cancellation() {
        let clock = ManualClock::new(1_010);
        let (src, dst, log) = legs(&clock);
        let src = src.failing(100);
        let mut coordinator =
            WithdrawalCoordinator::new(clock.clone(), WithdrawalOrder::default(), RetryPolicy::default());

        let err = coordinator.withdraw(&Secret::random(), &src, &dst).unwrap_err();

        match err {
            SwapError::CounterpartWithdrawalStuck { leg, attempts, .. } => {
                assert_eq!(leg, "src");
                // The last backoff is clipped to land on the cancellation instant.
                assert_eq!(attempts, 12);
            }
            other => panic!("unexpected error {other:?}"),
        }
        assert_eq!(clock.now(), 1_400);
        assert_eq!(log.borrow().iter().filter(|leg| **leg == "src").count(), 11);
        assert_eq!(coordinator.state(), WithdrawalState::Failed);
    }

    #[test]
    fn counterpart_stops_at_cancellation() {
        let clock = ManualClock::new(1_010);
        let (mut src, dst, _log) = legs(&clock);
        src.cancellation_at = 1_012;
        let src = src.failing(10);
        let mut coordinator =
            WithdrawalCoordinator::new(clock, WithdrawalOrder::default(), RetryPolicy::default());

        let err = coordinator.withdraw(&Secret::random(), &src, &dst).unwrap_err();
        match err {
            SwapError::CounterpartWithdrawalStuck { attempts, .. } => assert_eq!(attempts, 2),
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn backoff_is_capped() {
        let retry = RetryPolicy::default();
        assert_eq!(retry.backoff(0), Duration::from_secs(2));
        assert_eq!(retry.backoff(3), Duration::from_secs(16));
        assert_eq!(retry.backoff(10), Duration::from_secs(60));
        assert_eq!(retry.backoff(80), Duration::from_secs(60));
    }
}
