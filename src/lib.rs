pub mod args;
pub mod chain;
pub mod config;
pub mod deploy;
pub mod error;
pub mod events;
pub mod hashlock;
pub mod immutables;
pub mod journal;
pub mod orchestrator;
pub mod order;
pub mod route;
pub mod states;
pub mod timelocks;
pub mod withdraw;

#[cfg(any(test, feature = "testing"))]
pub mod sim;
