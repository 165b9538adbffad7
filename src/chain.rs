use std::thread;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use sylvia::cw_std::Uint256;

use crate::error::ChainError;
use crate::immutables::{EvmImmutables, StarknetImmutables};
use crate::order::{EvmOrder, EvmSignature, StarknetOrder};
use crate::states::{EvmAddress, Hash32, StarkFelt, U256Limbs};

pub const OPTIMISM_CHAIN_ID: u64 = 10;
/// Chain id the escrow factory uses for Starknet.
pub const STARKNET_CHAIN_ID: u64 = 99999;

/// Block explorer page for a transaction, when one is known.
pub fn explorer_link(chain_id: u64, tx_hash: &str) -> String {
    match chain_id {
        OPTIMISM_CHAIN_ID => format!("https://optimistic.etherscan.io/tx/{tx_hash}"),
        STARKNET_CHAIN_ID => format!("https://sepolia.voyager.online/tx/{tx_hash}"),
        _ => format!("tx {tx_hash}"),
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EvmLog {
    pub address: EvmAddress,
    pub topics: Vec<Hash32>,
    #[serde(with = "hex")]
    pub data: Vec<u8>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EvmReceipt {
    pub tx_hash: Hash32,
    pub block_timestamp: u64,
    pub success: bool,
    pub logs: Vec<EvmLog>,
}

impl EvmReceipt {
    pub fn find_log(&self, topic: &Hash32) -> Option<&EvmLog> {
        self.logs.iter().find(|log| log.topics.contains(topic))
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StarknetEvent {
    pub from_address: StarkFelt,
    pub keys: Vec<StarkFelt>,
    pub data: Vec<StarkFelt>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StarknetReceipt {
    pub tx_hash: StarkFelt,
    pub block_timestamp: u64,
    pub success: bool,
    pub events: Vec<StarknetEvent>,
}

impl StarknetReceipt {
    pub fn find_event(&self, key: &StarkFelt) -> Option<&StarknetEvent> {
        self.events.iter().find(|event| event.keys.contains(key))
    }
}

/// One entry of a Starknet account multicall.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StarknetCall {
    pub contract: StarkFelt,
    pub entrypoint: String,
    pub calldata: Vec<StarkFelt>,
}

impl StarknetCall {
    fn new(contract: StarkFelt, entrypoint: &str, calldata: Vec<StarkFelt>) -> Self {
        Self {
            contract,
            entrypoint: entrypoint.to_string(),
            calldata,
        }
    }

    pub fn transfer(token: StarkFelt, recipient: StarkFelt, amount: Uint256) -> Self {
        let [low, high] = U256Limbs::from(amount).to_felts();
        Self::new(token, "transfer", vec![recipient, low, high])
    }

    pub fn approve(token: StarkFelt, spender: StarkFelt, amount: Uint256) -> Self {
        let [low, high] = U256Limbs::from(amount).to_felts();
        Self::new(token, "approve", vec![spender, low, high])
    }

    /// `deploy_src(immutables, order, signature)`; the signature is a Cairo array.
    pub fn deploy_src(
        resolver: StarkFelt,
        immutables: &StarknetImmutables,
        order: &StarknetOrder,
        signature: &[StarkFelt],
    ) -> Self {
        let mut calldata = immutables.to_calldata();
        calldata.extend(order.to_calldata());
        calldata.push(StarkFelt::from_u64(signature.len() as u64));
        calldata.extend_from_slice(signature);
        Self::new(resolver, "deploy_src", calldata)
    }

    pub fn deploy_dst(
        resolver: StarkFelt,
        immutables: &StarknetImmutables,
        src_cancellation: u64,
    ) -> Self {
        let mut calldata = immutables.to_calldata();
        calldata.push(StarkFelt::from_u64(src_cancellation));
        Self::new(resolver, "deploy_dst", calldata)
    }

    pub fn withdraw_src(
        resolver: StarkFelt,
        escrow: StarkFelt,
        secret: StarkFelt,
        immutables: &StarknetImmutables,
    ) -> Self {
        Self::withdraw_via(resolver, "withdraw_src", escrow, secret, immutables)
    }

    pub fn withdraw_dst(
        resolver: StarkFelt,
        escrow: StarkFelt,
        secret: StarkFelt,
        immutables: &StarknetImmutables,
    ) -> Self {
        Self::withdraw_via(resolver, "withdraw_dst", escrow, secret, immutables)
    }

    fn withdraw_via(
        resolver: StarkFelt,
        entrypoint: &str,
        escrow: StarkFelt,
        secret: StarkFelt,
        immutables: &StarknetImmutables,
    ) -> Self {
        let mut calldata = vec![escrow, secret];
        calldata.extend(immutables.to_calldata());
        Self::new(resolver, entrypoint, calldata)
    }
}

/// Arguments of the resolver's `deploySrc`, which fills the order and
/// funds the source escrow in one transaction.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DeploySrcCall {
    pub immutables: EvmImmutables,
    pub order: EvmOrder,
    pub signature: EvmSignature,
    pub taker_traits: Uint256,
    pub fill_amount: Uint256,
    pub value: Uint256,
}

/// Submit-and-confirm access to an EVM chain. Every transaction method
/// returns once the receipt is available; a revert is a receipt with
/// `success == false`, not an error.
pub trait EvmChain {
    fn chain_id(&self) -> u64;
    fn block_timestamp(&self) -> Result<u64, ChainError>;
    fn balance_of(&self, token: &EvmAddress, owner: &EvmAddress) -> Result<Uint256, ChainError>;
    fn allowance(
        &self,
        token: &EvmAddress,
        owner: &EvmAddress,
        spender: &EvmAddress,
    ) -> Result<Uint256, ChainError>;
    fn approve(
        &self,
        from: &EvmAddress,
        token: &EvmAddress,
        spender: &EvmAddress,
        amount: Uint256,
    ) -> Result<EvmReceipt, ChainError>;
    fn escrow_src_implementation(&self, factory: &EvmAddress) -> Result<EvmAddress, ChainError>;
    fn deploy_src(
        &self,
        from: &EvmAddress,
        resolver: &EvmAddress,
        call: &DeploySrcCall,
    ) -> Result<EvmReceipt, ChainError>;
    fn create_dst_escrow(
        &self,
        from: &EvmAddress,
        factory: &EvmAddress,
        immutables: &EvmImmutables,
        src_cancellation: u64,
        value: Uint256,
    ) -> Result<EvmReceipt, ChainError>;
    /// `withdraw(secret, immutables)` sent to `to`: the escrow itself, or
    /// the resolver contract forwarding to `escrow`.
    fn withdraw(
        &self,
        from: &EvmAddress,
        to: &EvmAddress,
        escrow: &EvmAddress,
        secret: [u8; 32],
        immutables: &EvmImmutables,
    ) -> Result<EvmReceipt, ChainError>;
}

impl<T: EvmChain + ?Sized> EvmChain for &T {
    fn chain_id(&self) -> u64 {
        (**self).chain_id()
    }

    fn block_timestamp(&self) -> Result<u64, ChainError> {
        (**self).block_timestamp()
    }

    fn balance_of(&self, token: &EvmAddress, owner: &EvmAddress) -> Result<Uint256, ChainError> {
        (**self).balance_of(token, owner)
    }

    fn allowance(
        &self,
        token: &EvmAddress,
        owner: &EvmAddress,
        spender: &EvmAddress,
    ) -> Result<Uint256, ChainError> {
        (**self).allowance(token, owner, spender)
    }

    fn approve(
        &self,
        from: &EvmAddress,
        token: &EvmAddress,
        spender: &EvmAddress,
        amount: Uint256,
    ) -> Result<EvmReceipt, ChainError> {
        (**self).approve(from, token, spender, amount)
    }

    fn escrow_src_implementation(&self, factory: &EvmAddress) -> Result<EvmAddress, ChainError> {
        (**self).escrow_src_implementation(factory)
    }

    fn deploy_src(
        &self,
        from: &EvmAddress,
        resolver: &EvmAddress,
        call: &DeploySrcCall,
    ) -> Result<EvmReceipt, ChainError> {
        (**self).deploy_src(from, resolver, call)
    }

    fn create_dst_escrow(
        &self,
        from: &EvmAddress,
        factory: &EvmAddress,
        immutables: &EvmImmutables,
        src_cancellation: u64,
        value: Uint256,
    ) -> Result<EvmReceipt, ChainError> {
        (**self).create_dst_escrow(from, factory, immutables, src_cancellation, value)
    }

    fn withdraw(
        &self,
        from: &EvmAddress,
        to: &EvmAddress,
        escrow: &EvmAddress,
        secret: [u8; 32],
        immutables: &EvmImmutables,
    ) -> Result<EvmReceipt, ChainError> {
        (**self).withdraw(from, to, escrow, secret, immutables)
    }
}

pub trait StarknetChain {
    fn block_timestamp(&self) -> Result<u64, ChainError>;
    fn balance_of(&self, token: &StarkFelt, owner: &StarkFelt) -> Result<Uint256, ChainError>;
    fn allowance(
        &self,
        token: &StarkFelt,
        owner: &StarkFelt,
        spender: &StarkFelt,
    ) -> Result<Uint256, ChainError>;
    /// Executes `calls` atomically from `account` and waits for the receipt.
    fn execute(
        &self,
        account: &StarkFelt,
        calls: &[StarknetCall],
    ) -> Result<StarknetReceipt, ChainError>;
}

impl<T: StarknetChain + ?Sized> StarknetChain for &T {
    fn block_timestamp(&self) -> Result<u64, ChainError> {
        (**self).block_timestamp()
    }

    fn balance_of(&self, token: &StarkFelt, owner: &StarkFelt) -> Result<Uint256, ChainError> {
        (**self).balance_of(token, owner)
    }

    fn allowance(
        &self,
        token: &StarkFelt,
        owner: &StarkFelt,
        spender: &StarkFelt,
    ) -> Result<Uint256, ChainError> {
        (**self).allowance(token, owner, spender)
    }

    fn execute(
        &self,
        account: &StarkFelt,
        calls: &[StarknetCall],
    ) -> Result<StarknetReceipt, ChainError> {
        (**self).execute(account, calls)
    }
}

/// Wall time source used for waiting out timelocks.
pub trait Clock {
    fn now(&self) -> u64;
    fn sleep(&self, duration: Duration);
}

impl<T: Clock + ?Sized> Clock for &T {
    fn now(&self) -> u64 {
        (**self).now()
    }

    fn sleep(&self, duration: Duration) {
        (**self).sleep(duration)
    }
}

#[derive(Clone, Copy, Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|elapsed| elapsed.as_secs())
            .unwrap_or_default()
    }

    fn sleep(&self, duration: Duration) {
        thread::sleep(duration)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn explorer_links_per_chain() {
        assert_eq!(
            explorer_link(OPTIMISM_CHAIN_ID, "0xabc"),
            "https://optimistic.etherscan.io/tx/0xabc"
        );
        assert_eq!(
            explorer_link(STARKNET_CHAIN_ID, "0xdef"),
            "https://sepolia.voyager.online/tx/0xdef"
        );
        assert_eq!(explorer_link(1, "0x1"), "tx 0x1");
    }

    #[test]
    fn transfer_splits_amount_into_limbs() {
        let amount = Uint256::from(u128::MAX) + Uint256::from(5u128);
        let call = StarknetCall::transfer(StarkFelt::from_u64(1), StarkFelt::from_u64(2), amount);
        assert_eq!(call.entrypoint, "transfer");
        assert_eq!(call.calldata[1], StarkFelt::from_u64(4));
        assert_eq!(call.calldata[2], StarkFelt::from_u64(1));
    }

    #[test]
    fn receipt_lookup_by_key() {
        let key = StarkFelt::from_u64(77);
        let receipt = StarknetReceipt {
            tx_hash: StarkFelt::from_u64(1),
            block_timestamp: 0,
            success: true,
            events: vec![
                StarknetEvent {
                    from_address: StarkFelt::ZERO,
                    keys: vec![StarkFelt::from_u64(1)],
                    data: vec![],
                },
                StarknetEvent {
                    from_address: StarkFelt::ZERO,
                    keys: vec![key],
                    data: vec![StarkFelt::from_u64(9)],
                },
            ],
        };
        assert_eq!(receipt.find_event(&key).unwrap().data[0], StarkFelt::from_u64(9));
        assert!(receipt.find_event(&StarkFelt::from_u64(2)).is_none());
    }
}
