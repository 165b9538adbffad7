use std::env;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use sylvia::cw_std::Uint256;
use tracing::debug;

use crate::chain::{OPTIMISM_CHAIN_ID, STARKNET_CHAIN_ID};
use crate::error::SwapError;
use crate::states::{EvmAddress, StarkFelt};
use crate::timelocks::TimelockOffsets;
use crate::withdraw::{RetryPolicy, WithdrawalOrder};

const OP_LIMIT_ORDER_PROTOCOL: EvmAddress = EvmAddress([
    0x11, 0x11, 0x11, 0x12, 0x54, 0x21, 0xca, 0x6d, 0xc4, 0x52, 0xd2, 0x89, 0x31, 0x42, 0x80, 0xa0,
    0xf8, 0x84, 0x2a, 0x65,
]);
const OP_ESCROW_FACTORY: EvmAddress = EvmAddress([
    0xa7, 0xbc, 0xb4, 0xea, 0xc8, 0x96, 0x43, 0x06, 0xf9, 0xe3, 0x76, 0x4f, 0x67, 0xdb, 0x6a, 0x7a,
    0xf6, 0xdd, 0xf9, 0x9a,
]);
const OP_RESOLVER: EvmAddress = EvmAddress([
    0x55, 0xe7, 0x23, 0xee, 0x06, 0xb4, 0xbf, 0x69, 0x73, 0x4e, 0xde, 0x8e, 0x4d, 0x0c, 0xc4, 0x43,
    0xd8, 0x5b, 0xdf, 0x93,
]);

const STARKNET_LIMIT_ORDER_PROTOCOL: &str =
    "0x4beec109b7712b2f5576c63af17da0966756438d2a6bbaf894f48b8d17a72f";
const STARKNET_RESOLVER_CONTRACT: &str =
    "0x16d599d9fc0476dfe847c454f57349a563703be12852cda3ddf5183400fc334";
const STARKNET_RESOLVER_ACCOUNT: &str =
    "0x048A6a340B41Ba1Be6e17F23881E924746aB7E84c05ff915F4eAe86890b78da1";
const STARKNET_FEE_TOKEN: &str =
    "0x04718f5a0fc34cc1af16a1cdee98ffb20c31f5cd61d6ab07201858f4287c938d";

const DEFAULT_SAFETY_DEPOSIT: u128 = 110_000_000_000_000;
const DEFAULT_DECIMALS: u32 = 18;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EvmConfig {
    pub chain_id: u64,
    pub limit_order_protocol: EvmAddress,
    pub escrow_factory: EvmAddress,
    /// Resolver contract: taker of source escrows, fills orders.
    pub resolver: EvmAddress,
    /// Account sending resolver transactions.
    pub resolver_account: EvmAddress,
    pub user: EvmAddress,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StarknetConfig {
    pub chain_id: u64,
    pub limit_order_protocol: StarkFelt,
    pub resolver_contract: StarkFelt,
    pub resolver_account: StarkFelt,
    /// Token safety deposits are paid in.
    pub fee_token: StarkFelt,
    pub user: StarkFelt,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SwapConfig {
    pub evm: EvmConfig,
    pub starknet: StarknetConfig,
    pub offsets: TimelockOffsets,
    pub safety_deposit: Uint256,
    pub decimals: u32,
    pub withdrawal_order: WithdrawalOrder,
    pub retry: RetryPolicy,
}

fn known_felt(value: &str) -> StarkFelt {
    StarkFelt::parse_address(value).unwrap_or(StarkFelt::ZERO)
}

impl Default for SwapConfig {
    fn default() -> Self {
        Self {
            evm: EvmConfig {
                chain_id: OPTIMISM_CHAIN_ID,
                limit_order_protocol: OP_LIMIT_ORDER_PROTOCOL,
                escrow_factory: OP_ESCROW_FACTORY,
                resolver: OP_RESOLVER,
                resolver_account: EvmAddress::ZERO,
                user: EvmAddress::ZERO,
            },
            starknet: StarknetConfig {
                chain_id: STARKNET_CHAIN_ID,
                limit_order_protocol: known_felt(STARKNET_LIMIT_ORDER_PROTOCOL),
                resolver_contract: known_felt(STARKNET_RESOLVER_CONTRACT),
                resolver_account: known_felt(STARKNET_RESOLVER_ACCOUNT),
                fee_token: known_felt(STARKNET_FEE_TOKEN),
                user: StarkFelt::ZERO,
            },
            offsets: TimelockOffsets::default(),
            safety_deposit: Uint256::from(DEFAULT_SAFETY_DEPOSIT),
            decimals: DEFAULT_DECIMALS,
            withdrawal_order: WithdrawalOrder::default(),
            retry: RetryPolicy::default(),
        }
    }
}

impl FromStr for WithdrawalOrder {
    type Err = SwapError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "destination-first" => Ok(WithdrawalOrder::DestinationFirst),
            "source-first" => Ok(WithdrawalOrder::SourceFirst),
            other => Err(SwapError::InvalidConfig(format!(
                "unknown withdrawal order {other}"
            ))),
        }
    }
}

fn parse_offsets(value: &str) -> Result<TimelockOffsets, SwapError> {
    let values = value
        .split(',')
        .map(|part| part.trim().parse::<u32>())
        .collect::<Result<Vec<_>, _>>()
        .map_err(|err| SwapError::InvalidConfig(err.to_string()))?;
    let values: [u32; 7] = values
        .try_into()
        .map_err(|_| SwapError::InvalidConfig("expected 7 comma separated offsets".to_string()))?;
    Ok(TimelockOffsets::from_array(values))
}

struct Overrides<F> {
    lookup: F,
}

impl<F: Fn(&str) -> Option<String>> Overrides<F> {
    fn get<T>(
        &self,
        key: &str,
        parse: impl Fn(&str) -> Result<T, SwapError>,
    ) -> Result<Option<T>, SwapError> {
        match (self.lookup)(key) {
            None => Ok(None),
            Some(raw) => {
                debug!(key, "config override");
                parse(raw.trim())
                    .map(Some)
                    .map_err(|err| SwapError::InvalidConfig(format!("{key}: {err}")))
            }
        }
    }

    fn apply<T>(
        &self,
        key: &str,
        target: &mut T,
        parse: impl Fn(&str) -> Result<T, SwapError>,
    ) -> Result<(), SwapError> {
        if let Some(value) = self.get(key, parse)? {
            *target = value;
        }
        Ok(())
    }
}

fn number<T: FromStr>(value: &str) -> Result<T, SwapError> {
    value
        .parse()
        .map_err(|_| SwapError::InvalidConfig(format!("{value} is not a number")))
}

impl SwapConfig {
    pub fn from_env() -> Result<Self, SwapError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Defaults overridden by whatever `lookup` knows, then validated.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, SwapError> {
        let overrides = Overrides { lookup };
        let mut config = Self::default();
        let evm = |value: &str| EvmAddress::parse(value);
        let felt = |value: &str| StarkFelt::parse_address(value);

        overrides.apply("OP_CHAIN_ID", &mut config.evm.chain_id, number)?;
        overrides.apply("OP_LIMIT_ORDER_PROTOCOL", &mut config.evm.limit_order_protocol, evm)?;
        overrides.apply("OP_ESCROW_FACTORY", &mut config.evm.escrow_factory, evm)?;
        overrides.apply("OP_RESOLVER", &mut config.evm.resolver, evm)?;
        overrides.apply("OP_RESOLVER_ACCOUNT", &mut config.evm.resolver_account, evm)?;
        overrides.apply("OP_USER_ADDRESS", &mut config.evm.user, evm)?;

        overrides.apply("STARKNET_CHAIN_ID", &mut config.starknet.chain_id, number)?;
        overrides.apply(
            "STARKNET_LIMIT_ORDER_PROTOCOL",
            &mut config.starknet.limit_order_protocol,
            felt,
        )?;
        overrides.apply(
            "STARKNET_RESOLVER_CONTRACT",
            &mut config.starknet.resolver_contract,
            felt,
        )?;
        overrides.apply(
            "STARKNET_RESOLVER_ADDRESS",
            &mut config.starknet.resolver_account,
            felt,
        )?;
        overrides.apply("STARKNET_FEE_TOKEN", &mut config.starknet.fee_token, felt)?;
        overrides.apply("STARKNET_USER_ADDRESS", &mut config.starknet.user, felt)?;

        overrides.apply("SWAP_SAFETY_DEPOSIT", &mut config.safety_deposit, |value| {
            Uint256::from_str(value).map_err(|err| SwapError::InvalidConfig(err.to_string()))
        })?;
        overrides.apply("SWAP_DECIMALS", &mut config.decimals, number)?;
        overrides.apply("SWAP_TIMELOCKS", &mut config.offsets, parse_offsets)?;
        overrides.apply("SWAP_WITHDRAWAL_ORDER", &mut config.withdrawal_order, |value| {
            value.parse()
        })?;
        overrides.apply(
            "SWAP_RETRY_BACKOFF_SECS",
            &mut config.retry.initial_backoff_secs,
            number,
        )?;
        overrides.apply(
            "SWAP_RETRY_MAX_BACKOFF_SECS",
            &mut config.retry.max_backoff_secs,
            number,
        )?;

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), SwapError> {
        self.offsets
            .validate()
            .map_err(|err| SwapError::InvalidConfig(err.to_string()))?;
        if self.decimals > 18 {
            return Err(SwapError::InvalidConfig(format!(
                "{} decimals is more than supported",
                self.decimals
            )));
        }
        if self.retry.initial_backoff_secs == 0
            || self.retry.max_backoff_secs < self.retry.initial_backoff_secs
        {
            return Err(SwapError::InvalidConfig(format!(
                "retry backoff {}s capped at {}s",
                self.retry.initial_backoff_secs, self.retry.max_backoff_secs
            )));
        }
        if self.evm.chain_id == self.starknet.chain_id {
            return Err(SwapError::InvalidConfig(
                "both chains share one chain id".to_string(),
            ));
        }
        Ok(())
    }

    pub fn require_evm_user(&self) -> Result<EvmAddress, SwapError> {
        require(self.evm.user, EvmAddress::ZERO, "OP_USER_ADDRESS")
    }

    pub fn require_evm_resolver_account(&self) -> Result<EvmAddress, SwapError> {
        require(self.evm.resolver_account, EvmAddress::ZERO, "OP_RESOLVER_ACCOUNT")
    }

    pub fn require_starknet_user(&self) -> Result<StarkFelt, SwapError> {
        require(self.starknet.user, StarkFelt::ZERO, "STARKNET_USER_ADDRESS")
    }
}

fn require<T: PartialEq>(value: T, unset: T, key: &str) -> Result<T, SwapError> {
    if value == unset {
        return Err(SwapError::InvalidConfig(format!("{key} is not set")));
    }
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_match_deployment() {
        let config = SwapConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config.evm.chain_id, 10);
        assert_eq!(config.starknet.chain_id, 99999);
        assert_eq!(
            config.evm.escrow_factory.to_string(),
            "0xa7bcb4eac8964306f9e3764f67db6a7af6ddf99a"
        );
        assert_eq!(
            config.evm.limit_order_protocol,
            EvmAddress::parse("0x111111125421cA6dc452d289314280a0f8842A65").unwrap()
        );
        assert_eq!(
            config.starknet.fee_token,
            StarkFelt::parse_address(STARKNET_FEE_TOKEN).unwrap()
        );
        assert_ne!(config.starknet.resolver_contract, StarkFelt::ZERO);
        assert_eq!(config.offsets, TimelockOffsets::default());
        assert_eq!(config.safety_deposit, Uint256::from(110_000_000_000_000u128));
        assert_eq!(config.withdrawal_order, WithdrawalOrder::DestinationFirst);
        assert!(config.require_evm_user().is_err());
    }

    #[test]
    fn env_overrides() {
        let config = SwapConfig::from_lookup(lookup(&[
            ("OP_USER_ADDRESS", "0x7F7Ac1507d9addC6b0b23872334F2a08bDc2Cd25"),
            ("STARKNET_USER_ADDRESS", "0x60684d67ee65a3c3c41932caead3d6b19c0738390d24924f172ffb416cef3ae"),
            ("SWAP_TIMELOCKS", "10, 120, 121, 122, 10, 100, 101"),
            ("SWAP_WITHDRAWAL_ORDER", "source-first"),
            ("SWAP_SAFETY_DEPOSIT", "0"),
            ("SWAP_RETRY_MAX_BACKOFF_SECS", "30"),
        ]))
        .unwrap();
        assert!(config.require_evm_user().is_ok());
        assert!(config.require_starknet_user().is_ok());
        assert_eq!(config.offsets.src_cancellation, 121);
        assert_eq!(config.withdrawal_order, WithdrawalOrder::SourceFirst);
        assert!(config.safety_deposit.is_zero());
        assert_eq!(config.retry.max_backoff_secs, 30);
        assert_eq!(config.retry.initial_backoff_secs, 2);
    }

    #[test]
    fn invalid_values_are_reported_by_key() {
        let err = SwapConfig::from_lookup(lookup(&[("OP_ESCROW_FACTORY", "0x1234")])).unwrap_err();
        match err {
            SwapError::InvalidConfig(message) => assert!(message.starts_with("OP_ESCROW_FACTORY")),
            other => panic!("unexpected error {other:?}"),
        }

        let err = SwapConfig::from_lookup(lookup(&[("SWAP_TIMELOCKS", "1,2,3")])).unwrap_err();
        assert!(matches!(err, SwapError::InvalidConfig(_)));

        // dst cancellation after src cancellation
        let err = SwapConfig::from_lookup(lookup(&[("SWAP_TIMELOCKS", "5,440,642,644,5,400,700")]))
            .unwrap_err();
        assert!(matches!(err, SwapError::InvalidConfig(_)));

        let err = SwapConfig::from_lookup(lookup(&[("SWAP_RETRY_BACKOFF_SECS", "0")])).unwrap_err();
        assert!(matches!(err, SwapError::InvalidConfig(_)));
        let err = SwapConfig::from_lookup(lookup(&[("SWAP_RETRY_MAX_BACKOFF_SECS", "1")])).unwrap_err();
        assert!(matches!(err, SwapError::InvalidConfig(_)));
    }
}
