use std::cell::RefCell;
use std::collections::{HashMap, HashSet};

use sylvia::cw_std::{HexBinary, Uint256};
use tracing::debug;

use crate::chain::{StarknetCall, StarknetChain, StarknetEvent, StarknetReceipt};
use crate::deploy::EscrowRole;
use crate::error::ChainError;
use crate::events::{StarknetDstDeployed, StarknetSrcDeployed};
use crate::immutables::{StarknetImmutables, STARKNET_IMMUTABLES_FELTS};
use crate::order::compute_hash_on_elements;
use crate::sim::{addr, EscrowInstance, EscrowTerms, HashScheme, Ledger, LockedEscrow, ManualClock};
use crate::states::{keccak256, StarkFelt, U256Limbs};
use crate::timelocks::{check_destination_deadline, Stage};

const ORDER_FELTS: usize = 9;

#[derive(Default)]
struct StarknetState {
    ledger: Ledger<StarkFelt>,
    escrows: HashMap<StarkFelt, LockedEscrow<StarkFelt>>,
    transactions: Vec<Vec<String>>,
    suppress_events: bool,
    failing_withdrawals: u32,
    nonce: u64,
}

/// Starknet with ERC20 tokens, the limit-order protocol and the resolver
/// contract that deploys escrows and forwards withdrawals.
pub struct SimStarknetChain {
    clock: ManualClock,
    resolver_contract: StarkFelt,
    limit_order_protocol: StarkFelt,
    fee_token: StarkFelt,
    state: RefCell<StarknetState>,
}

fn amount_at(calldata: &[StarkFelt], index: usize) -> Result<Uint256, String> {
    match calldata.get(index..index + 2) {
        Some([low, high]) => U256Limbs::from_felts(low, high)
            .map(Uint256::from)
            .map_err(|err| err.to_string()),
        _ => Err(format!("missing u256 at {index}")),
    }
}

fn felt_at(calldata: &[StarkFelt], index: usize) -> Result<StarkFelt, String> {
    calldata
        .get(index)
        .copied()
        .ok_or_else(|| format!("missing felt at {index}"))
}

fn immutables_at(calldata: &[StarkFelt], start: usize) -> Result<StarknetImmutables, String> {
    let felts = calldata
        .get(start..)
        .ok_or_else(|| "missing immutables".to_string())?;
    StarknetImmutables::from_calldata(felts).map_err(|err| err.to_string())
}

fn escrow_terms(immutables: &StarknetImmutables, role: EscrowRole) -> EscrowTerms {
    EscrowTerms {
        digest: HexBinary::from(&immutables.hash().0),
        hashlock: HexBinary::from(&immutables.hash_lock.0),
        scheme: HashScheme::Poseidon,
        taker: addr(immutables.taker),
        withdrawal: immutables.timelocks.get(role.withdrawal_stage()),
        cancellation: immutables.timelocks.get(role.cancellation_stage()),
    }
}

impl SimStarknetChain {
    pub fn new(
        clock: ManualClock,
        resolver_contract: StarkFelt,
        limit_order_protocol: StarkFelt,
        fee_token: StarkFelt,
    ) -> Self {
        Self {
            clock,
            resolver_contract,
            limit_order_protocol,
            fee_token,
            state: RefCell::new(StarknetState::default()),
        }
    }

    pub fn balance(&self, token: &StarkFelt, owner: &StarkFelt) -> Uint256 {
        self.state.borrow().ledger.balance(token, owner)
    }

    pub fn allowance_of(&self, token: &StarkFelt, owner: &StarkFelt, spender: &StarkFelt) -> Uint256 {
        self.state.borrow().ledger.allowance(token, owner, spender)
    }

    pub fn fund(&self, token: &StarkFelt, owner: &StarkFelt, amount: Uint256) {
        self.state.borrow_mut().ledger.mint(token, owner, amount);
    }

    pub fn grant_allowance(
        &self,
        token: &StarkFelt,
        owner: &StarkFelt,
        spender: &StarkFelt,
        amount: Uint256,
    ) {
        self.state
            .borrow_mut()
            .ledger
            .approve(token, owner, spender, amount);
    }

    /// Entrypoints of every executed multicall, in order.
    pub fn transactions(&self) -> Vec<Vec<String>> {
        self.state.borrow().transactions.clone()
    }

    pub fn last_entrypoints(&self) -> Vec<String> {
        self.state
            .borrow()
            .transactions
            .last()
            .cloned()
            .unwrap_or_default()
    }

    /// Resolver deployments still succeed but emit no events.
    pub fn suppress_events(&self, suppress: bool) {
        self.state.borrow_mut().suppress_events = suppress;
    }

    pub fn fail_next_withdrawals(&self, count: u32) {
        self.state.borrow_mut().failing_withdrawals = count;
    }

    pub fn escrow_withdrawn(&self, escrow: &StarkFelt) -> bool {
        self.state
            .borrow()
            .escrows
            .get(escrow)
            .and_then(|locked| locked.instance.status().ok())
            .is_some_and(|status| status.withdrawn)
    }

    fn dispatch(
        &self,
        state: &mut StarknetState,
        account: &StarkFelt,
        call: &StarknetCall,
        now: u64,
    ) -> Result<Vec<StarknetEvent>, String> {
        let calldata = &call.calldata;
        match call.entrypoint.as_str() {
            "transfer" => {
                let recipient = felt_at(calldata, 0)?;
                let amount = amount_at(calldata, 1)?;
                state
                    .ledger
                    .transfer(&call.contract, account, &recipient, amount)?;
                Ok(Vec::new())
            }
            "approve" => {
                let spender = felt_at(calldata, 0)?;
                let amount = amount_at(calldata, 1)?;
                state
                    .ledger
                    .approve(&call.contract, account, &spender, amount);
                Ok(Vec::new())
            }
            _ if call.contract != self.resolver_contract => {
                Err(format!("{} has no entrypoint {}", call.contract, call.entrypoint))
            }
            "deploy_src" => self.deploy_src(state, calldata, now),
            "deploy_dst" => self.deploy_dst(state, calldata, now),
            "withdraw_src" | "withdraw_dst" => self.withdraw(state, calldata, now),
            other => Err(format!("resolver has no entrypoint {other}")),
        }
    }

    fn lock(
        &self,
        state: &mut StarknetState,
        escrow: StarkFelt,
        immutables: &StarknetImmutables,
        role: EscrowRole,
        now: u64,
    ) -> Result<(), String> {
        let instance = EscrowInstance::instantiate(
            &addr(self.resolver_contract),
            escrow_terms(immutables, role),
            now,
        )
        .map_err(|err| err.to_string())?;
        state.escrows.insert(
            escrow,
            LockedEscrow {
                instance,
                role,
                maker: immutables.maker,
                token: immutables.token,
                amount: immutables.amount.into(),
                deposit_token: self.fee_token,
                deposit: immutables.safety_deposit.into(),
            },
        );
        Ok(())
    }

    /// Fills the order through the limit-order protocol into a fresh escrow.
    fn deploy_src(
        &self,
        state: &mut StarknetState,
        calldata: &[StarkFelt],
        now: u64,
    ) -> Result<Vec<StarknetEvent>, String> {
        let immutables = immutables_at(calldata, 0)?;
        let order = calldata
            .get(STARKNET_IMMUTABLES_FELTS..STARKNET_IMMUTABLES_FELTS + ORDER_FELTS)
            .ok_or_else(|| "missing order".to_string())?;
        if compute_hash_on_elements(order) != immutables.order_hash {
            return Err("order hash does not match the immutables".to_string());
        }
        let timelocks = immutables
            .timelocks
            .anchor(now)
            .map_err(|err| err.to_string())?;
        let anchored = immutables.with_timelocks(timelocks);
        let escrow = anchored.hash();

        state.ledger.transfer_from(
            &anchored.token,
            &self.limit_order_protocol,
            &anchored.maker,
            &escrow,
            anchored.amount.into(),
        )?;
        state.ledger.transfer(
            &self.fee_token,
            &self.resolver_contract,
            &escrow,
            anchored.safety_deposit.into(),
        )?;
        self.lock(state, escrow, &anchored, EscrowRole::Source, now)?;

        if state.suppress_events {
            return Ok(Vec::new());
        }
        let event = StarknetSrcDeployed {
            escrow,
            cancellation: anchored.timelocks.get(Stage::SrcCancellation),
        };
        Ok(vec![event.to_event(self.resolver_contract)])
    }

    /// Funds the destination escrow from the resolver contract's balance.
    fn deploy_dst(
        &self,
        state: &mut StarknetState,
        calldata: &[StarkFelt],
        now: u64,
    ) -> Result<Vec<StarknetEvent>, String> {
        let immutables = immutables_at(calldata, 0)?;
        let src_cancellation = felt_at(calldata, STARKNET_IMMUTABLES_FELTS)?
            .to_u64()
            .ok_or_else(|| "source cancellation is not a timestamp".to_string())?;
        check_destination_deadline(&immutables.timelocks.offsets(), now, src_cancellation)
            .map_err(|err| err.to_string())?;
        let timelocks = immutables
            .timelocks
            .anchor(now)
            .map_err(|err| err.to_string())?;
        let anchored = immutables.with_timelocks(timelocks);
        let escrow = anchored.hash();

        state.ledger.transfer(
            &anchored.token,
            &self.resolver_contract,
            &escrow,
            anchored.amount.into(),
        )?;
        state.ledger.transfer(
            &self.fee_token,
            &self.resolver_contract,
            &escrow,
            anchored.safety_deposit.into(),
        )?;
        self.lock(state, escrow, &anchored, EscrowRole::Destination, now)?;

        if state.suppress_events {
            return Ok(Vec::new());
        }
        Ok(vec![StarknetDstDeployed { escrow }.to_event(self.resolver_contract)])
    }

    /// `[escrow, secret, immutables..]`; the escrow sees the resolver as sender.
    fn withdraw(
        &self,
        state: &mut StarknetState,
        calldata: &[StarkFelt],
        now: u64,
    ) -> Result<Vec<StarknetEvent>, String> {
        if state.failing_withdrawals > 0 {
            state.failing_withdrawals -= 1;
            return Err("escrow withdraw reverted".to_string());
        }
        let escrow = felt_at(calldata, 0)?;
        let secret = felt_at(calldata, 1)?;
        let immutables = immutables_at(calldata, 2)?;
        let sender = self.resolver_contract;

        let StarknetState {
            ledger, escrows, ..
        } = state;
        let locked = escrows
            .get_mut(&escrow)
            .ok_or_else(|| format!("no escrow at {escrow}"))?;
        locked.release(ledger, &escrow, &sender)?;
        locked
            .instance
            .withdraw(&addr(sender), &secret.0, &immutables.hash().0, now)
            .map_err(|err| err.to_string())?;
        Ok(Vec::new())
    }
}

impl StarknetChain for SimStarknetChain {
    fn block_timestamp(&self) -> Result<u64, ChainError> {
        Ok(self.clock.now())
    }

    fn balance_of(&self, token: &StarkFelt, owner: &StarkFelt) -> Result<Uint256, ChainError> {
        Ok(self.balance(token, owner))
    }

    fn allowance(
        &self,
        token: &StarkFelt,
        owner: &StarkFelt,
        spender: &StarkFelt,
    ) -> Result<Uint256, ChainError> {
        Ok(self.allowance_of(token, owner, spender))
    }

    /// All calls apply or none do.
    fn execute(
        &self,
        account: &StarkFelt,
        calls: &[StarknetCall],
    ) -> Result<StarknetReceipt, ChainError> {
        if calls.is_empty() {
            return Err(ChainError::Unsupported("empty multicall".to_string()));
        }
        let mut state = self.state.borrow_mut();
        state
            .transactions
            .push(calls.iter().map(|call| call.entrypoint.clone()).collect());
        state.nonce += 1;
        let mut digest = keccak256(&[&b"starknet"[..], &state.nonce.to_be_bytes()].concat());
        digest[0] &= 0x07;
        let tx_hash = StarkFelt(digest);
        let now = self.clock.now();

        let snapshot = state.ledger.clone();
        let known: HashSet<StarkFelt> = state.escrows.keys().copied().collect();
        let mut events = Vec::new();
        let mut failure = None;
        for call in calls {
            match self.dispatch(&mut state, account, call, now) {
                Ok(emitted) => events.extend(emitted),
                Err(reason) => {
                    failure = Some((call.entrypoint.as_str(), reason));
                    break;
                }
            }
        }
        let success = match failure {
            None => true,
            Some((entrypoint, reason)) => {
                debug!(entrypoint, %reason, "starknet multicall reverted");
                state.ledger = snapshot;
                state.escrows.retain(|escrow, _| known.contains(escrow));
                events.clear();
                false
            }
        };
        Ok(StarknetReceipt {
            tx_hash,
            block_timestamp: now,
            success,
            events,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hashlock::{Hashlock, Secret};
    use crate::timelocks::{TimelockOffsets, Timelocks};

    fn felt(value: u64) -> StarkFelt {
        StarkFelt::from_u64(value)
    }

    fn chain(clock: &ManualClock) -> SimStarknetChain {
        SimStarknetChain::new(clock.clone(), felt(0x7e), felt(0x10), felt(0xfee))
    }

    fn destination(secret: &Secret) -> StarknetImmutables {
        StarknetImmutables {
            order_hash: felt(1),
            hash_lock: Hashlock::from_secret(secret).starknet(),
            maker: felt(0xa),
            taker: felt(0x7e),
            token: felt(0x70),
            amount: Uint256::from(40u128).into(),
            safety_deposit: Uint256::from(2u128).into(),
            timelocks: Timelocks::pack(&TimelockOffsets::default(), 0),
        }
    }

    #[test]
    fn multicall_is_atomic() {
        let clock = ManualClock::new(1_000);
        let chain = chain(&clock);
        let account = felt(0xacc);
        chain.fund(&felt(0x70), &account, Uint256::from(10u128));

        let receipt = chain
            .execute(
                &account,
                &[
                    StarknetCall::transfer(felt(0x70), felt(0xb), Uint256::from(10u128)),
                    StarknetCall::transfer(felt(0x70), felt(0xb), Uint256::from(1u128)),
                ],
            )
            .unwrap();

        assert!(!receipt.success);
        assert_eq!(chain.balance(&felt(0x70), &account), Uint256::from(10u128));
        assert_eq!(chain.last_entrypoints(), vec!["transfer", "transfer"]);
        assert!(chain.execute(&account, &[]).is_err());
    }

    #[test]
    fn destination_withdraw_pays_maker_through_resolver() {
        let clock = ManualClock::new(1_000);
        let chain = chain(&clock);
        let account = felt(0xacc);
        let resolver = felt(0x7e);
        chain.fund(&felt(0x70), &account, Uint256::from(40u128));
        chain.fund(&felt(0xfee), &account, Uint256::from(2u128));
        let secret = Secret::random();
        let immutables = destination(&secret);

        let receipt = chain
            .execute(
                &account,
                &[
                    StarknetCall::transfer(felt(0x70), resolver, Uint256::from(40u128)),
                    StarknetCall::transfer(felt(0xfee), resolver, Uint256::from(2u128)),
                    StarknetCall::deploy_dst(resolver, &immutables, 1_642),
                ],
            )
            .unwrap();
        assert!(receipt.success);
        let escrow = StarknetDstDeployed::decode(&receipt.events[0]).unwrap().escrow;
        let anchored = immutables.with_timelocks(immutables.timelocks.anchor(1_000).unwrap());
        assert_eq!(escrow, anchored.hash());

        clock.advance(5);
        let receipt = chain
            .execute(
                &account,
                &[StarknetCall::withdraw_dst(resolver, escrow, secret.as_felt(), &anchored)],
            )
            .unwrap();
        assert!(receipt.success);
        assert!(chain.escrow_withdrawn(&escrow));
        assert_eq!(chain.balance(&felt(0x70), &felt(0xa)), Uint256::from(40u128));
        assert_eq!(chain.balance(&felt(0xfee), &resolver), Uint256::from(2u128));
    }

    #[test]
    fn late_destination_reverts() {
        let clock = ManualClock::new(1_300);
        let chain = chain(&clock);
        let account = felt(0xacc);
        let immutables = destination(&Secret::random());

        let receipt = chain
            .execute(
                &account,
                &[StarknetCall::deploy_dst(felt(0x7e), &immutables, 1_642)],
            )
            .unwrap();
        assert!(!receipt.success);
        assert!(receipt.events.is_empty());
    }
}
