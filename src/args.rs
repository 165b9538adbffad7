use std::fmt;
use std::str::FromStr;

use crate::error::SwapError;
use crate::orchestrator::SwapRequest;
use crate::states::{parse_units, EvmAddress, StarkFelt};

pub const USAGE: &str = "swap <op-to-starknet|starknet-to-op> <srcToken> <makingAmount> <dstToken> <takingAmount> <counterpartyUserAddress>";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Direction {
    OpToStarknet,
    StarknetToOp,
}

impl FromStr for Direction {
    type Err = SwapError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "op-to-starknet" => Ok(Direction::OpToStarknet),
            "starknet-to-op" => Ok(Direction::StarknetToOp),
            other => Err(SwapError::Usage(format!("unknown direction {other}"))),
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::OpToStarknet => f.write_str("op-to-starknet"),
            Direction::StarknetToOp => f.write_str("starknet-to-op"),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SwapArgs {
    pub direction: Direction,
    pub request: SwapRequest,
}

fn check_amount(value: &str, decimals: u32) -> Result<(), SwapError> {
    parse_units(value, decimals).map(|_| ())
}

impl SwapArgs {
    /// Parses the arguments after the program name. Addresses are checked
    /// against the chain they live on.
    pub fn parse<I>(args: I, decimals: u32) -> Result<Self, SwapError>
    where
        I: IntoIterator,
        I::Item: Into<String>,
    {
        let args: Vec<String> = args.into_iter().map(Into::into).collect();
        let [direction, src_token, making_amount, dst_token, taking_amount, counterparty]: [String; 6] =
            args.try_into().map_err(|args: Vec<String>| {
                SwapError::Usage(format!("expected 6 arguments, got {}", args.len()))
            })?;
        let direction: Direction = direction.parse()?;

        match direction {
            Direction::OpToStarknet => {
                EvmAddress::parse(&src_token)?;
                StarkFelt::parse_address(&dst_token)?;
                StarkFelt::parse_address(&counterparty)?;
            }
            Direction::StarknetToOp => {
                StarkFelt::parse_address(&src_token)?;
                EvmAddress::parse(&dst_token)?;
                EvmAddress::parse(&counterparty)?;
            }
        }
        check_amount(&making_amount, decimals)?;
        check_amount(&taking_amount, decimals)?;

        Ok(Self {
            direction,
            request: SwapRequest {
                src_token,
                making_amount,
                dst_token,
                taking_amount,
                counterparty,
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const OP_TOKEN: &str = "0x722d3c28fadCee0f1070C12C4d47F20DB5bfE82B";
    const STRK: &str = "0x04718f5a0fc34cc1af16a1cdee98ffb20c31f5cd61d6ab07201858f4287c938d";
    const STARKNET_USER: &str = "0x060684D67EE65A3C3C41932cAeAD3d6B19c0738390d24924f172FFB416Cef3ae";

    #[test]
    fn parses_op_to_starknet() {
        let args = SwapArgs::parse(
            ["op-to-starknet", OP_TOKEN, "100", STRK, "1", STARKNET_USER],
            18,
        )
        .unwrap();
        assert_eq!(args.direction, Direction::OpToStarknet);
        assert_eq!(args.request.making_amount, "100");
        assert_eq!(args.request.counterparty, STARKNET_USER);
    }

    #[test]
    fn addresses_are_checked_per_chain() {
        // A Starknet address where an EVM one is expected.
        let err = SwapArgs::parse(
            ["starknet-to-op", STRK, "100", STRK, "1", OP_TOKEN],
            18,
        )
        .unwrap_err();
        assert!(matches!(err, SwapError::InvalidAddress { chain: "evm", .. }));

        let too_large = format!("0x{}", "f".repeat(64));
        let err = SwapArgs::parse(
            ["op-to-starknet", OP_TOKEN, "100", STRK, "1", too_large.as_str()],
            18,
        )
        .unwrap_err();
        assert!(matches!(err, SwapError::InvalidAddress { chain: "starknet", .. }));
    }

    #[test]
    fn amounts_must_be_positive() {
        for amount in ["0", "-5", "abc", "0.0"] {
            let err = SwapArgs::parse(
                ["op-to-starknet", OP_TOKEN, amount, STRK, "1", STARKNET_USER],
                18,
            )
            .unwrap_err();
            assert!(
                matches!(err, SwapError::NonPositiveAmount(_) | SwapError::InvalidAmount(_)),
                "{amount}: {err:?}"
            );
        }
    }

    #[test]
    fn wrong_arity_and_direction() {
        assert!(matches!(
            SwapArgs::parse(["op-to-starknet", OP_TOKEN], 18),
            Err(SwapError::Usage(_))
        ));
        assert!(matches!(
            SwapArgs::parse(["sideways", OP_TOKEN, "1", STRK, "1", STARKNET_USER], 18),
            Err(SwapError::Usage(_))
        ));
        assert_eq!(
            "starknet-to-op".parse::<Direction>().unwrap().to_string(),
            "starknet-to-op"
        );
    }
}
