//! Synthesized calls and call sequences.

use crate::contracts::ContractDefinition;
use alloy_dyn_abi::{DynSolValue, JsonAbiExt};
use alloy_json_abi::Function;
use alloy_primitives::{Address, Bytes, U256};
use eyre::{Context, Result};
use hydra_chain::{CallMessage, MessageReceipt, TestChain};
use hydra_coverage::CoverageMaps;
use std::sync::Arc;

/// The ABI-level view of a call's input data.
///
/// Input values are kept beside the encoded calldata so mutations can
/// re-encode deterministically; whenever the values change, the calldata is
/// re-encoded before dispatch.
#[derive(Clone, Debug)]
pub struct CallAbiData {
    /// The method the calldata targets.
    pub method: Function,
    /// The decoded input values, one per method parameter.
    pub input_values: Vec<DynSolValue>,
}

/// A synthesized EVM transaction.
#[derive(Clone, Debug)]
pub struct Call {
    pub sender: Address,
    pub target: Address,
    pub nonce: u64,
    pub value: U256,
    pub gas_limit: u64,
    pub gas_price: u128,
    /// The encoded calldata dispatched to the chain.
    pub calldata: Bytes,
    /// The structured view of `calldata`, absent for calls restored from a
    /// persisted corpus.
    pub abi_data: Option<CallAbiData>,
    /// How many extra blocks the chain head jumps before this call mines.
    pub block_number_delay: u64,
    /// How many extra seconds the head timestamp jumps before this call
    /// mines.
    pub block_timestamp_delay: u64,
}

impl Call {
    /// Creates a call targeting `method` at `target`, encoding
    /// `input_values` into calldata.
    pub fn from_method(
        sender: Address,
        target: Address,
        method: Function,
        input_values: Vec<DynSolValue>,
        value: U256,
        gas_limit: u64,
    ) -> Result<Self> {
        let calldata = method
            .abi_encode_input(&input_values)
            .wrap_err_with(|| format!("could not encode calldata for {}", method.signature()))?;
        Ok(Self {
            sender,
            target,
            nonce: 0,
            value,
            gas_limit,
            gas_price: 0,
            calldata: calldata.into(),
            abi_data: Some(CallAbiData { method, input_values }),
            block_number_delay: 0,
            block_timestamp_delay: 0,
        })
    }

    /// Sets the block delays, reducing the number delay so every jumped
    /// block can get a distinct timestamp: the number delay is brought below
    /// the timestamp delay modulo it, or zeroed when the timestamp delay is
    /// zero.
    pub fn with_delays(mut self, block_number_delay: u64, block_timestamp_delay: u64) -> Self {
        self.block_number_delay = block_number_delay;
        self.block_timestamp_delay = block_timestamp_delay;
        if self.block_number_delay > self.block_timestamp_delay {
            if self.block_timestamp_delay == 0 {
                self.block_number_delay = 0;
            } else {
                self.block_number_delay %= self.block_timestamp_delay;
            }
        }
        self
    }

    /// Re-encodes `calldata` from the current ABI input values. Must be
    /// called after any mutation of [`CallAbiData::input_values`].
    pub fn reencode_calldata(&mut self) -> Result<()> {
        if let Some(abi_data) = &self.abi_data {
            let calldata = abi_data
                .method
                .abi_encode_input(&abi_data.input_values)
                .wrap_err_with(|| {
                    format!("could not re-encode calldata for {}", abi_data.method.signature())
                })?;
            self.calldata = calldata.into();
        }
        Ok(())
    }

    /// Re-stamps chain-dependent fields from live chain state.
    ///
    /// Deliberately late-bound: the same call, re-used under shrinking, must
    /// pick up the nonce and gas price of the current (post-revert) head.
    pub fn fill_from_chain(&mut self, chain: &dyn TestChain) {
        self.nonce = chain.account_nonce(self.sender);
        self.gas_price = chain.gas_price();
    }

    /// The chain message for this call.
    pub fn to_message(&self) -> CallMessage {
        CallMessage {
            from: self.sender,
            to: self.target,
            nonce: self.nonce,
            value: self.value,
            gas_limit: self.gas_limit,
            gas_price: self.gas_price,
            data: self.calldata.clone(),
        }
    }
}

/// Where a call landed once executed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ChainReference {
    pub block_number: u64,
    pub transaction_index: u32,
}

/// One element of a call sequence: the call plus its post-execution record.
///
/// The chain reference, receipt and coverage are populated once after
/// execution and only read thereafter.
#[derive(Clone, Debug)]
pub struct CallSequenceElement {
    /// The definition of the contract the call targets, when known.
    pub contract: Option<Arc<ContractDefinition>>,
    pub call: Call,
    pub chain_reference: Option<ChainReference>,
    pub receipt: Option<MessageReceipt>,
    /// Coverage recorded by the tracer while this element executed.
    pub coverage: Option<Arc<CoverageMaps>>,
}

impl CallSequenceElement {
    pub fn new(contract: Option<Arc<ContractDefinition>>, call: Call) -> Self {
        Self { contract, call, chain_reference: None, receipt: None, coverage: None }
    }

    /// Whether the executed call failed. Unexecuted elements count as
    /// successful.
    pub fn failed(&self) -> bool {
        self.receipt.as_ref().is_some_and(|receipt| !receipt.success)
    }
}

/// An ordered sequence of calls, tested as a unit.
pub type CallSequence = Vec<CallSequenceElement>;

#[cfg(test)]
mod tests {
    use super::*;
    use alloy_json_abi::Function;

    fn call_with_delays(number: u64, timestamp: u64) -> Call {
        let method = Function::parse("f(uint256 x)").unwrap();
        Call::from_method(
            Address::ZERO,
            Address::ZERO,
            method,
            vec![DynSolValue::Uint(U256::from(1), 256)],
            U256::ZERO,
            1_000_000,
        )
        .unwrap()
        .with_delays(number, timestamp)
    }

    #[test]
    fn delay_invariant_holds_after_construction() {
        let call = call_with_delays(100, 10);
        assert!(call.block_number_delay <= call.block_timestamp_delay);
        assert_eq!(call.block_number_delay, 0);

        let call = call_with_delays(105, 10);
        assert_eq!(call.block_number_delay, 5);

        let call = call_with_delays(100, 0);
        assert_eq!(call.block_number_delay, 0);
        assert_eq!(call.block_timestamp_delay, 0);

        let call = call_with_delays(5, 100);
        assert_eq!(call.block_number_delay, 5);
        assert_eq!(call.block_timestamp_delay, 100);
    }

    #[test]
    fn mutating_values_and_reencoding_changes_calldata() {
        let mut call = call_with_delays(0, 0);
        let original = call.calldata.clone();

        let abi_data = call.abi_data.as_mut().unwrap();
        abi_data.input_values[0] = DynSolValue::Uint(U256::from(99), 256);
        call.reencode_calldata().unwrap();

        assert_ne!(call.calldata, original);
        // Selector is untouched by input mutation.
        assert_eq!(call.calldata[..4], original[..4]);
    }
}
