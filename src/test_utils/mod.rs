//! Helpers for exercising pollers and listeners without a node.

pub mod macros;
mod mock_chain;

use alloy::primitives::{Address, address};

pub use macros::{next_item, take_logs};
pub use mock_chain::{Call, CallKind, MockChain, fatal_error, transient_error};

use crate::abi::{EventSchema, parse_abi, resolve_event};

/// Contract emitting [`COUNTER_ABI`] events in tests.
pub const COUNTER_ADDRESS: Address = address!("0x5FbDB2315678afecb367f032d93F642f64180aa3");

/// ABI of a counter contract whose single event matches the logs a [`MockChain`] mines.
pub const COUNTER_ABI: &str = r#"[
    {"type":"function","name":"increase","inputs":[],"outputs":[],"stateMutability":"nonpayable"},
    {"type":"event","name":"CountIncreased","anonymous":false,
     "inputs":[{"name":"newCount","type":"uint256","indexed":false}]}
]"#;

/// Resolved `CountIncreased(uint256)` schema.
///
/// # Panics
///
/// Never for the bundled ABI.
#[must_use]
pub fn counter_schema() -> EventSchema {
    let abi = parse_abi(COUNTER_ABI).expect("bundled ABI is valid");
    resolve_event(&abi, "CountIncreased").expect("bundled ABI declares CountIncreased")
}

/// A chain of `CountIncreased` logs from [`COUNTER_ADDRESS`], holding only genesis.
#[must_use]
pub fn counter_chain() -> MockChain {
    MockChain::new(COUNTER_ADDRESS, counter_schema().selector)
}
