use sylvia::cw_std::Uint256;

use crate::error::SwapError;
use crate::order::{EvmOrder, EvmOrderParams, EvmOrderSdk, EvmSignature, OrderExtension};
use crate::states::{keccak256, EvmAddress, Hash32};
use crate::timelocks::Timelocks;

/// Deterministic stand-in for the limit-order SDK: orders hash with
/// keccak over their fields and signatures are derived from the hash.
#[derive(Clone, Copy, Debug, Default)]
pub struct SimOrderSdk;

impl SimOrderSdk {
    pub fn order(&self, params: &EvmOrderParams) -> EvmOrder {
        let escrow = [
            params.escrow_factory.to_word(),
            params.hashlock.0,
            Uint256::from(params.dst_chain_id).to_be_bytes(),
            params.src_safety_deposit.to_be_bytes(),
            params.dst_safety_deposit.to_be_bytes(),
            Timelocks::pack(&params.offsets, 0).0.to_be_bytes(),
            params.resolver.to_word(),
        ]
        .concat();
        EvmOrder {
            salt: Uint256::zero(),
            maker: params.maker,
            receiver: EvmAddress::ZERO,
            maker_asset: params.maker_asset,
            taker_asset: params.taker_asset,
            making_amount: params.making_amount,
            taking_amount: params.taking_amount,
            maker_traits: Uint256::zero(),
            extension: OrderExtension {
                escrow,
                custom_data: Vec::new(),
            },
            dst_chain_id: params.dst_chain_id,
        }
        .with_extension_salt()
    }
}

impl EvmOrderSdk for SimOrderSdk {
    fn build_order(&self, params: &EvmOrderParams) -> Result<EvmOrder, SwapError> {
        if params.making_amount.is_zero() || params.taking_amount.is_zero() {
            return Err(SwapError::NonPositiveAmount("0".to_string()));
        }
        Ok(self.order(params))
    }

    fn order_hash(&self, order: &EvmOrder, chain_id: u64) -> Hash32 {
        let encoded = [
            order.salt.to_be_bytes(),
            order.maker.to_word(),
            order.receiver.to_word(),
            order.maker_asset.to_word(),
            order.taker_asset.to_word(),
            order.making_amount.to_be_bytes(),
            order.taking_amount.to_be_bytes(),
            order.maker_traits.to_be_bytes(),
            Uint256::from(chain_id).to_be_bytes(),
        ]
        .concat();
        Hash32(keccak256(&encoded))
    }

    fn sign(&self, order: &EvmOrder, chain_id: u64) -> Result<EvmSignature, SwapError> {
        let hash = self.order_hash(order, chain_id);
        Ok(EvmSignature {
            r: Hash32(keccak256(&[&b"r"[..], &hash.0[..]].concat())),
            vs: Hash32(keccak256(&[&b"vs"[..], &hash.0[..]].concat())),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::timelocks::TimelockOffsets;

    fn params() -> EvmOrderParams {
        EvmOrderParams {
            maker: EvmAddress([1; 20]),
            maker_asset: EvmAddress([2; 20]),
            taker_asset: EvmAddress::ZERO,
            making_amount: Uint256::from(100u128),
            taking_amount: Uint256::one(),
            hashlock: Hash32([3; 32]),
            offsets: TimelockOffsets::default(),
            src_chain_id: 10,
            dst_chain_id: 99999,
            src_safety_deposit: Uint256::one(),
            dst_safety_deposit: Uint256::one(),
            escrow_factory: EvmAddress([4; 20]),
            resolver: EvmAddress([5; 20]),
        }
    }

    #[test]
    fn hash_binds_chain_and_traits() {
        let sdk = SimOrderSdk;
        let order = sdk.build_order(&params()).unwrap();
        assert!(order.salt_matches_extension());
        assert_ne!(sdk.order_hash(&order, 10), sdk.order_hash(&order, 1));
        assert_ne!(
            sdk.order_hash(&order, 10),
            sdk.order_hash(&order.clone().with_non_evm_destination(), 10)
        );
        assert_eq!(sdk.sign(&order, 10).unwrap(), sdk.sign(&order, 10).unwrap());

        let zero = EvmOrderParams {
            taking_amount: Uint256::zero(),
            ..params()
        };
        assert!(sdk.build_order(&zero).is_err());
    }
}
