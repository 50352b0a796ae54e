//! ABI value generation and mutation.
//!
//! The engine consumes these interfaces when synthesizing fresh calls and
//! mutating corpus-derived ones. [`RandomValueGenerator`] and the two
//! mutators are the stock implementations; embedders can substitute their
//! own, e.g. to seed generation from static analysis.

use alloy_dyn_abi::{DynSolType, DynSolValue};
use alloy_primitives::{Address, B256, U256};
use indexmap::IndexSet;
use revm::interpreter::opcode;

mod generator;
pub use generator::{RandomValueGenerator, RandomValueGeneratorConfig};

mod mutator;
pub use mutator::{RandomValueMutator, ShrinkingValueMutator};

/// Produces ABI-typed values for fuzzed call synthesis.
pub trait ValueGenerator: Send {
    /// Generates a value of the given ABI type.
    fn generate_abi_value(&mut self, ty: &DynSolType) -> DynSolValue;

    /// Generates the raw two's-complement representation of an integer of
    /// the given signedness and bit width. Negative signed results are
    /// sign-extended to the full word.
    fn generate_integer(&mut self, signed: bool, bits: usize) -> U256;

    /// Generates an address.
    fn generate_address(&mut self) -> Address;
}

/// Mutates ABI-typed values, delegating to a [`ValueGenerator`] when a
/// mutation calls for a fresh value.
pub trait ValueMutator: Send {
    fn mutate_abi_value(
        &mut self,
        generator: &mut dyn ValueGenerator,
        ty: &DynSolType,
        value: DynSolValue,
    ) -> DynSolValue;
}

/// Runtime-collected values biasing generation.
///
/// Workers clone the campaign's base set and grow their copy with values
/// observed on their own chain, e.g. deployed contract addresses.
#[derive(Clone, Debug)]
pub struct ValueSet {
    addresses: IndexSet<Address>,
    words: IndexSet<B256>,
}

impl Default for ValueSet {
    fn default() -> Self {
        let mut words = IndexSet::new();
        for interesting in [U256::ZERO, U256::from(1), U256::from(2), U256::MAX] {
            words.insert(B256::from(interesting));
        }
        Self { addresses: IndexSet::from_iter([Address::ZERO]), words }
    }
}

impl ValueSet {
    pub fn add_address(&mut self, address: Address) {
        self.addresses.insert(address);
    }

    pub fn remove_address(&mut self, address: Address) {
        self.addresses.shift_remove(&address);
    }

    pub fn add_word(&mut self, word: B256) {
        self.words.insert(word);
    }

    /// Collects the operands of `PUSH1..PUSH32` instructions in `code` into
    /// the word dictionary, so generated integers can hit the constants the
    /// code actually compares against.
    pub fn collect_push_bytes(&mut self, code: &[u8]) {
        let mut offset = 0;
        while offset < code.len() {
            let op = code[offset];
            offset += 1;
            if (opcode::PUSH1..=opcode::PUSH32).contains(&op) {
                let size = (op - opcode::PUSH1 + 1) as usize;
                let end = (offset + size).min(code.len());
                let mut word = B256::ZERO;
                word[32 - (end - offset)..].copy_from_slice(&code[offset..end]);
                self.add_word(word);
                offset = end;
            }
        }
    }

    pub fn addresses(&self) -> &IndexSet<Address> {
        &self.addresses
    }

    pub fn words(&self) -> &IndexSet<B256> {
        &self.words
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn push_operands_land_in_the_word_dictionary() {
        let mut value_set = ValueSet::default();
        let baseline = value_set.words().len();
        // PUSH1 0x2a; PUSH2 0xbeef; JUMPDEST.
        value_set.collect_push_bytes(&[0x60, 0x2a, 0x61, 0xbe, 0xef, 0x5b]);

        assert_eq!(value_set.words().len(), baseline + 2);
        assert!(value_set.words().contains(&B256::from(U256::from(0x2au64))));
        assert!(value_set.words().contains(&B256::from(U256::from(0xbeefu64))));
    }

    #[test]
    fn truncated_push_operands_do_not_panic() {
        let mut value_set = ValueSet::default();
        // PUSH32 with only two operand bytes present.
        value_set.collect_push_bytes(&[0x7f, 0x01, 0x02]);
        assert!(value_set.words().contains(&B256::from(U256::from(0x0102u64))));
    }
}
