use std::env;
use std::process::ExitCode;
use std::time::{SystemTime, UNIX_EPOCH};

use escrow_swap::args::{Direction, SwapArgs, USAGE};
use escrow_swap::config::SwapConfig;
use escrow_swap::error::SwapError;
use escrow_swap::hashlock::{Hashlock, Secret};
use escrow_swap::states::parse_units;
use escrow_swap::timelocks::{rebase_destination, Stage, Timelocks};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

fn plan(config: &SwapConfig, args: &SwapArgs) -> Result<(), SwapError> {
    let request = &args.request;
    let making = parse_units(&request.making_amount, config.decimals)?;
    let taking = parse_units(&request.taking_amount, config.decimals)?;
    let (src_chain, dst_chain) = match args.direction {
        Direction::OpToStarknet => (config.evm.chain_id, config.starknet.chain_id),
        Direction::StarknetToOp => (config.starknet.chain_id, config.evm.chain_id),
    };

    let secret = Secret::random();
    let hashlock = Hashlock::from_secret(&secret);

    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs())
        .unwrap_or_default();
    let deployed_at = u32::try_from(now).map_err(|_| SwapError::TimestampOverflow(now))?;
    let timelocks = Timelocks::pack(&config.offsets, deployed_at);
    let destination = rebase_destination(&config.offsets, timelocks.get(Stage::SrcCancellation))?;

    info!(direction = %args.direction, src_chain, dst_chain, "swap plan");
    println!("direction       {}", args.direction);
    println!("source          {} on chain {src_chain}", request.src_token);
    println!("destination     {} on chain {dst_chain}", request.dst_token);
    println!("making amount   {making}");
    println!("taking amount   {taking}");
    println!("counterparty    {}", request.counterparty);
    println!("safety deposit  {}", config.safety_deposit);
    println!("evm hashlock    {}", hashlock.evm());
    println!("stark hashlock  {}", hashlock.starknet());
    println!("withdrawals     {:?}", config.withdrawal_order);
    println!("timelocks (if deployed at {now}):");
    for stage in Stage::ALL {
        println!("  {stage:?} at {}", timelocks.get(stage));
    }
    println!(
        "destination margin {}s",
        destination.margin(timelocks.get(Stage::SrcCancellation))
    );
    Ok(())
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let result = SwapConfig::from_env().and_then(|config| {
        let args = SwapArgs::parse(env::args().skip(1), config.decimals)?;
        plan(&config, &args)
    });
    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!(%err, "swap failed");
            if matches!(err, SwapError::Usage(_)) {
                eprintln!("usage: {USAGE}");
            }
            ExitCode::FAILURE
        }
    }
}
