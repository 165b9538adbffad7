use std::cell::RefCell;
use std::collections::HashMap;

use sylvia::cw_std::{HexBinary, Uint256};
use tracing::debug;

use crate::chain::{DeploySrcCall, EvmChain, EvmLog, EvmReceipt, OPTIMISM_CHAIN_ID};
use crate::deploy::EscrowRole;
use crate::error::ChainError;
use crate::events::{DstEscrowCreated, DstImmutablesComplement, SrcEscrowCreated};
use crate::immutables::EvmImmutables;
use crate::sim::{addr, EscrowInstance, EscrowTerms, HashScheme, Ledger, LockedEscrow, ManualClock};
use crate::states::{keccak256, read_word, EvmAddress, Hash32};
use crate::timelocks::check_destination_deadline;

const SRC_IMPLEMENTATION: EvmAddress = EvmAddress([0xe5; 20]);
const DST_IMPLEMENTATION: EvmAddress = EvmAddress([0xed; 20]);

#[derive(Default)]
struct EvmState {
    ledger: Ledger<EvmAddress>,
    escrows: HashMap<EvmAddress, LockedEscrow<EvmAddress>>,
    submissions: Vec<String>,
    suppress_events: bool,
    failing_withdrawals: u32,
    nonce: u64,
}

/// Optimism as the swap sees it: the limit-order protocol, the escrow
/// factory and the resolver contract. The zero token is the native currency.
pub struct SimEvmChain {
    clock: ManualClock,
    factory: EvmAddress,
    limit_order_protocol: EvmAddress,
    state: RefCell<EvmState>,
}

fn escrow_terms(immutables: &EvmImmutables, role: EscrowRole) -> EscrowTerms {
    EscrowTerms {
        digest: HexBinary::from(&immutables.hash().0),
        hashlock: HexBinary::from(&immutables.hashlock.0),
        scheme: HashScheme::Keccak,
        taker: addr(immutables.taker),
        withdrawal: immutables.timelocks.get(role.withdrawal_stage()),
        cancellation: immutables.timelocks.get(role.cancellation_stage()),
    }
}

impl SimEvmChain {
    pub fn new(clock: ManualClock, factory: EvmAddress, limit_order_protocol: EvmAddress) -> Self {
        Self {
            clock,
            factory,
            limit_order_protocol,
            state: RefCell::new(EvmState::default()),
        }
    }

    pub fn balance(&self, token: &EvmAddress, owner: &EvmAddress) -> Uint256 {
        self.state.borrow().ledger.balance(token, owner)
    }

    pub fn allowance_of(&self, token: &EvmAddress, owner: &EvmAddress, spender: &EvmAddress) -> Uint256 {
        self.state.borrow().ledger.allowance(token, owner, spender)
    }

    pub fn fund(&self, token: &EvmAddress, owner: &EvmAddress, amount: Uint256) {
        self.state.borrow_mut().ledger.mint(token, owner, amount);
    }

    pub fn grant_allowance(
        &self,
        token: &EvmAddress,
        owner: &EvmAddress,
        spender: &EvmAddress,
        amount: Uint256,
    ) {
        self.state
            .borrow_mut()
            .ledger
            .approve(token, owner, spender, amount);
    }

    /// Names of the calls submitted so far, reverted ones included.
    pub fn submissions(&self) -> Vec<String> {
        self.state.borrow().submissions.clone()
    }

    /// Factory transactions still succeed but emit no logs.
    pub fn suppress_events(&self, suppress: bool) {
        self.state.borrow_mut().suppress_events = suppress;
    }

    pub fn fail_next_withdrawals(&self, count: u32) {
        self.state.borrow_mut().failing_withdrawals = count;
    }

    pub fn escrow_withdrawn(&self, escrow: &EvmAddress) -> bool {
        self.state
            .borrow()
            .escrows
            .get(escrow)
            .and_then(|locked| locked.instance.status().ok())
            .is_some_and(|status| status.withdrawn)
    }

    fn submit(
        &self,
        name: &str,
        apply: impl FnOnce(&mut EvmState, u64) -> Result<Vec<EvmLog>, String>,
    ) -> EvmReceipt {
        let mut state = self.state.borrow_mut();
        state.submissions.push(name.to_string());
        state.nonce += 1;
        let tx_hash = Hash32(keccak256(&[&b"optimism"[..], &state.nonce.to_be_bytes()].concat()));
        let now = self.clock.now();

        let snapshot = state.ledger.clone();
        let (success, logs) = match apply(&mut state, now) {
            Ok(logs) => (true, logs),
            Err(reason) => {
                debug!(call = name, %reason, "evm call reverted");
                state.ledger = snapshot;
                (false, Vec::new())
            }
        };
        EvmReceipt {
            tx_hash,
            block_timestamp: now,
            success,
            logs,
        }
    }
}

impl EvmChain for SimEvmChain {
    fn chain_id(&self) -> u64 {
        OPTIMISM_CHAIN_ID
    }

    fn block_timestamp(&self) -> Result<u64, ChainError> {
        Ok(self.clock.now())
    }

    fn balance_of(&self, token: &EvmAddress, owner: &EvmAddress) -> Result<Uint256, ChainError> {
        Ok(self.balance(token, owner))
    }

    fn allowance(
        &self,
        token: &EvmAddress,
        owner: &EvmAddress,
        spender: &EvmAddress,
    ) -> Result<Uint256, ChainError> {
        Ok(self.allowance_of(token, owner, spender))
    }

    fn approve(
        &self,
        from: &EvmAddress,
        token: &EvmAddress,
        spender: &EvmAddress,
        amount: Uint256,
    ) -> Result<EvmReceipt, ChainError> {
        Ok(self.submit("approve", |state, _| {
            state.ledger.approve(token, from, spender, amount);
            Ok(Vec::new())
        }))
    }

    fn escrow_src_implementation(&self, factory: &EvmAddress) -> Result<EvmAddress, ChainError> {
        if *factory != self.factory {
            return Err(ChainError::Rpc(format!("no escrow factory at {factory}")));
        }
        Ok(SRC_IMPLEMENTATION)
    }

    fn deploy_src(
        &self,
        from: &EvmAddress,
        _resolver: &EvmAddress,
        call: &DeploySrcCall,
    ) -> Result<EvmReceipt, ChainError> {
        let factory = self.factory;
        let limit_order_protocol = self.limit_order_protocol;
        Ok(self.submit("deploySrc", |state, now| {
            let order = &call.order;
            if !order.salt_matches_extension() {
                return Err("order salt does not match its extension".to_string());
            }
            let timelocks = call
                .immutables
                .timelocks
                .anchor(now)
                .map_err(|err| err.to_string())?;
            let anchored = call.immutables.with_timelocks(timelocks);
            let escrow = anchored.escrow_address(&factory, &SRC_IMPLEMENTATION);

            state.ledger.transfer_from(
                &order.maker_asset,
                &limit_order_protocol,
                &order.maker,
                &escrow,
                call.fill_amount,
            )?;
            state
                .ledger
                .transfer(&EvmAddress::ZERO, from, &escrow, call.value)?;

            let instance = EscrowInstance::instantiate(
                &addr(factory),
                escrow_terms(&anchored, EscrowRole::Source),
                now,
            )
            .map_err(|err| err.to_string())?;
            state.escrows.insert(
                escrow,
                LockedEscrow {
                    instance,
                    role: EscrowRole::Source,
                    maker: anchored.maker,
                    token: anchored.token,
                    amount: anchored.amount,
                    deposit_token: EvmAddress::ZERO,
                    deposit: anchored.safety_deposit,
                },
            );

            if state.suppress_events {
                return Ok(Vec::new());
            }
            let custom = &order.extension.custom_data;
            let event = SrcEscrowCreated {
                immutables: anchored,
                complement: DstImmutablesComplement {
                    maker: Hash32(read_word(custom, 0).unwrap_or_default()),
                    amount: order.taking_amount,
                    token: Hash32(read_word(custom, 1).unwrap_or_default()),
                    safety_deposit: anchored.safety_deposit,
                    chain_id: Uint256::from(order.dst_chain_id),
                },
            };
            Ok(vec![event.to_log(factory)])
        }))
    }

    fn create_dst_escrow(
        &self,
        from: &EvmAddress,
        factory: &EvmAddress,
        immutables: &EvmImmutables,
        src_cancellation: u64,
        value: Uint256,
    ) -> Result<EvmReceipt, ChainError> {
        Ok(self.submit("createDstEscrow", |state, now| {
            check_destination_deadline(&immutables.timelocks.offsets(), now, src_cancellation)
                .map_err(|err| err.to_string())?;
            let timelocks = immutables
                .timelocks
                .anchor(now)
                .map_err(|err| err.to_string())?;
            let anchored = immutables.with_timelocks(timelocks);
            let escrow = anchored.escrow_address(factory, &DST_IMPLEMENTATION);

            if anchored.token.is_zero() {
                let need = anchored
                    .amount
                    .checked_add(anchored.safety_deposit)
                    .map_err(|err| err.to_string())?;
                if value != need {
                    return Err(format!("value {value} does not cover {need}"));
                }
            } else {
                if value != anchored.safety_deposit {
                    return Err(format!("value {value} is not the safety deposit"));
                }
                state
                    .ledger
                    .transfer_from(&anchored.token, factory, from, &escrow, anchored.amount)?;
            }
            state.ledger.transfer(&EvmAddress::ZERO, from, &escrow, value)?;

            let instance = EscrowInstance::instantiate(
                &addr(factory),
                escrow_terms(&anchored, EscrowRole::Destination),
                now,
            )
            .map_err(|err| err.to_string())?;
            state.escrows.insert(
                escrow,
                LockedEscrow {
                    instance,
                    role: EscrowRole::Destination,
                    maker: anchored.maker,
                    token: anchored.token,
                    amount: anchored.amount,
                    deposit_token: EvmAddress::ZERO,
                    deposit: anchored.safety_deposit,
                },
            );

            if state.suppress_events {
                return Ok(Vec::new());
            }
            let event = DstEscrowCreated {
                escrow,
                hashlock: anchored.hashlock,
                taker: Hash32(anchored.taker.to_word()),
            };
            Ok(vec![event.to_log(*factory)])
        }))
    }

    fn withdraw(
        &self,
        from: &EvmAddress,
        to: &EvmAddress,
        escrow: &EvmAddress,
        secret: [u8; 32],
        immutables: &EvmImmutables,
    ) -> Result<EvmReceipt, ChainError> {
        // Called through the resolver contract, the escrow sees the resolver as sender.
        let sender = if to == escrow { *from } else { *to };
        Ok(self.submit("withdraw", |state, now| {
            if state.failing_withdrawals > 0 {
                state.failing_withdrawals -= 1;
                return Err("execution reverted".to_string());
            }
            let EvmState {
                ledger, escrows, ..
            } = state;
            let locked = escrows
                .get_mut(escrow)
                .ok_or_else(|| format!("no escrow at {escrow}"))?;
            locked.release(ledger, escrow, &sender)?;
            locked
                .instance
                .withdraw(&addr(sender), &secret, &immutables.hash().0, now)
                .map_err(|err| err.to_string())?;
            Ok(Vec::new())
        }))
    }
}
