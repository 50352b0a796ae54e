use alloy_primitives::{Address, Bytes, U256};
use std::{any::Any, collections::HashMap};

/// A transaction message executed against a test chain.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CallMessage {
    pub from: Address,
    pub to: Address,
    pub nonce: u64,
    pub value: U256,
    pub gas_limit: u64,
    pub gas_price: u128,
    pub data: Bytes,
}

/// The receipt of an executed message.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MessageReceipt {
    /// Whether execution succeeded. Reverts, invalid opcodes and
    /// out-of-gas all report `false`.
    pub success: bool,
    /// Gas consumed by the message.
    pub gas_used: u64,
}

/// Artifacts attached to a message execution by tracers, keyed by a
/// well-known name per tracer. Consumers downcast the values they own.
pub type AdditionalResults = HashMap<String, Box<dyn Any + Send>>;

/// The full result record of one executed message.
#[derive(Debug)]
pub struct MessageResults {
    pub receipt: MessageReceipt,
    pub additional_results: AdditionalResults,
}

impl MessageResults {
    pub fn new(receipt: MessageReceipt) -> Self {
        Self { receipt, additional_results: AdditionalResults::default() }
    }
}
