use super::{mutator::sign_extend, ValueGenerator, ValueSet};
use alloy_dyn_abi::{DynSolType, DynSolValue};
use alloy_primitives::{Address, B256, I256, U256};
use parking_lot::Mutex;
use rand::{rngs::StdRng, Rng, SeedableRng};
use std::sync::Arc;

/// Knobs for [`RandomValueGenerator`].
#[derive(Clone, Copy, Debug)]
pub struct RandomValueGeneratorConfig {
    /// Upper bound on generated dynamic array lengths.
    pub max_array_length: usize,
    /// Upper bound on generated `bytes` lengths.
    pub max_bytes_length: usize,
    /// Upper bound on generated string lengths.
    pub max_string_length: usize,
    /// Probability of drawing an integer or address from the value set
    /// instead of generating it randomly.
    pub dictionary_bias: f32,
}

impl Default for RandomValueGeneratorConfig {
    fn default() -> Self {
        Self {
            max_array_length: 8,
            max_bytes_length: 64,
            max_string_length: 64,
            dictionary_bias: 0.4,
        }
    }
}

/// A seeded random [`ValueGenerator`] biased by a shared [`ValueSet`].
///
/// Integer generation mixes three sources: boundary values (zero, one, the
/// type maximum), words collected in the value set, and uniform randomness.
pub struct RandomValueGenerator {
    rng: StdRng,
    value_set: Arc<Mutex<ValueSet>>,
    config: RandomValueGeneratorConfig,
}

impl RandomValueGenerator {
    pub fn new(seed: u64, value_set: Arc<Mutex<ValueSet>>) -> Self {
        Self::with_config(seed, value_set, RandomValueGeneratorConfig::default())
    }

    pub fn with_config(
        seed: u64,
        value_set: Arc<Mutex<ValueSet>>,
        config: RandomValueGeneratorConfig,
    ) -> Self {
        Self { rng: StdRng::seed_from_u64(seed), value_set, config }
    }

    fn random_word(&mut self) -> B256 {
        B256::from(self.rng.gen::<[u8; 32]>())
    }

    fn dictionary_word(&mut self) -> Option<B256> {
        let value_set = self.value_set.lock();
        let words = value_set.words();
        if words.is_empty() {
            return None;
        }
        let index = self.rng.gen_range(0..words.len());
        words.get_index(index).copied()
    }

    fn generate_bytes(&mut self, length: usize) -> Vec<u8> {
        (0..length).map(|_| self.rng.gen()).collect()
    }
}

/// The mask selecting the low `bits` of a word.
pub(super) fn bit_mask(bits: usize) -> U256 {
    if bits >= 256 {
        U256::MAX
    } else {
        (U256::from(1) << bits) - U256::from(1)
    }
}

impl ValueGenerator for RandomValueGenerator {
    fn generate_abi_value(&mut self, ty: &DynSolType) -> DynSolValue {
        match ty {
            DynSolType::Bool => DynSolValue::Bool(self.rng.gen()),
            DynSolType::Int(bits) => {
                let raw = self.generate_integer(true, *bits);
                DynSolValue::Int(I256::from_raw(raw), *bits)
            }
            DynSolType::Uint(bits) => DynSolValue::Uint(self.generate_integer(false, *bits), *bits),
            DynSolType::Address => DynSolValue::Address(self.generate_address()),
            DynSolType::Function => {
                let raw: [u8; 24] = self.rng.gen();
                DynSolValue::Function(raw.into())
            }
            DynSolType::FixedBytes(size) => {
                let mut word = self.random_word();
                word[*size..].fill(0);
                DynSolValue::FixedBytes(word, *size)
            }
            DynSolType::Bytes => {
                let length = self.rng.gen_range(0..=self.config.max_bytes_length);
                DynSolValue::Bytes(self.generate_bytes(length))
            }
            DynSolType::String => {
                let length = self.rng.gen_range(0..=self.config.max_string_length);
                let string = (0..length)
                    .map(|_| char::from(self.rng.gen_range(b' '..=b'~')))
                    .collect();
                DynSolValue::String(string)
            }
            DynSolType::Array(inner) => {
                let length = self.rng.gen_range(0..=self.config.max_array_length);
                DynSolValue::Array((0..length).map(|_| self.generate_abi_value(inner)).collect())
            }
            DynSolType::FixedArray(inner, size) => DynSolValue::FixedArray(
                (0..*size).map(|_| self.generate_abi_value(inner)).collect(),
            ),
            DynSolType::Tuple(types) => {
                DynSolValue::Tuple(types.iter().map(|ty| self.generate_abi_value(ty)).collect())
            }
            _ => panic!("unsupported fuzz param type: {ty}"),
        }
    }

    fn generate_integer(&mut self, signed: bool, bits: usize) -> U256 {
        let mask = bit_mask(bits);
        let roll: f32 = self.rng.gen();
        let raw = if roll < 0.25 {
            // For signed widths `mask` is -1 and `mask >> 1` the maximum;
            // the lone sign bit, the minimum, is added alongside them.
            let mut boundaries = vec![U256::ZERO, U256::from(1), mask, mask >> 1];
            if signed && bits > 0 {
                boundaries.push(U256::from(1) << (bits.min(256) - 1));
            }
            boundaries[self.rng.gen_range(0..boundaries.len())]
        } else if roll < 0.25 + self.config.dictionary_bias {
            match self.dictionary_word() {
                Some(word) => U256::from_be_bytes(word.0) & mask,
                None => U256::from_be_bytes(self.random_word().0) & mask,
            }
        } else {
            U256::from_be_bytes(self.random_word().0) & mask
        };
        if signed {
            sign_extend(raw, bits).into_raw()
        } else {
            raw
        }
    }

    fn generate_address(&mut self) -> Address {
        if self.rng.gen::<f32>() < self.config.dictionary_bias {
            let value_set = self.value_set.lock();
            let addresses = value_set.addresses();
            if !addresses.is_empty() {
                let index = self.rng.gen_range(0..addresses.len());
                if let Some(address) = addresses.get_index(index) {
                    return *address;
                }
            }
        }
        Address::from(self.rng.gen::<[u8; 20]>())
    }
}
