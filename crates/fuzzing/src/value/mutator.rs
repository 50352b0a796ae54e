use super::{ValueGenerator, ValueMutator};
use alloy_dyn_abi::{DynSolType, DynSolValue};
use alloy_primitives::{Address, I256, U256};
use rand::{rngs::StdRng, Rng, SeedableRng};

/// The stock fuzzing mutator: small structural edits with an occasional
/// full regeneration, so corpus-derived sequences drift without losing the
/// shape that made them interesting.
pub struct RandomValueMutator {
    rng: StdRng,
}

impl RandomValueMutator {
    pub fn new(seed: u64) -> Self {
        Self { rng: StdRng::seed_from_u64(seed) }
    }

    fn mutate_uint(&mut self, value: U256, bits: usize) -> U256 {
        let mask = super::generator::bit_mask(bits);
        match self.rng.gen_range(0..5) {
            0 => value.wrapping_add(U256::from(1)) & mask,
            1 => value.wrapping_sub(U256::from(1)) & mask,
            // Flip a random bit within the type width.
            2 => (value ^ (U256::from(1) << self.rng.gen_range(0..bits))) & mask,
            3 => U256::ZERO,
            _ => mask,
        }
    }
}

impl ValueMutator for RandomValueMutator {
    fn mutate_abi_value(
        &mut self,
        generator: &mut dyn ValueGenerator,
        ty: &DynSolType,
        value: DynSolValue,
    ) -> DynSolValue {
        // A fresh value now and then escapes local minima the structural
        // edits cannot leave.
        if self.rng.gen_range(0..8) == 0 {
            return generator.generate_abi_value(ty);
        }
        match (ty, value) {
            (DynSolType::Uint(bits), DynSolValue::Uint(value, _)) => {
                DynSolValue::Uint(self.mutate_uint(value, *bits), *bits)
            }
            (DynSolType::Int(bits), DynSolValue::Int(value, _)) => {
                let mutated = self.mutate_uint(value.into_raw(), *bits);
                DynSolValue::Int(sign_extend(mutated, *bits), *bits)
            }
            (DynSolType::Bool, DynSolValue::Bool(value)) => DynSolValue::Bool(!value),
            (DynSolType::Address, DynSolValue::Address(_)) => {
                DynSolValue::Address(generator.generate_address())
            }
            (DynSolType::FixedBytes(size), DynSolValue::FixedBytes(mut word, _)) => {
                if *size > 0 {
                    let index = self.rng.gen_range(0..*size);
                    word[index] ^= self.rng.gen::<u8>() | 1;
                }
                DynSolValue::FixedBytes(word, *size)
            }
            (DynSolType::Bytes, DynSolValue::Bytes(mut bytes)) => {
                mutate_buffer(&mut self.rng, &mut bytes);
                DynSolValue::Bytes(bytes)
            }
            (DynSolType::String, DynSolValue::String(string)) => {
                let mut bytes = string.into_bytes();
                mutate_buffer(&mut self.rng, &mut bytes);
                // Keep mutated strings printable ASCII so they survive
                // round-trips through serialized corpora.
                bytes.iter_mut().for_each(|byte| *byte = b' ' + (*byte % 95));
                DynSolValue::String(String::from_utf8_lossy(&bytes).into_owned())
            }
            (DynSolType::Array(inner), DynSolValue::Array(mut values)) => {
                match self.rng.gen_range(0..3) {
                    0 => values.push(generator.generate_abi_value(inner)),
                    1 => {
                        values.pop();
                    }
                    _ => {
                        if !values.is_empty() {
                            let index = self.rng.gen_range(0..values.len());
                            let element = values[index].clone();
                            values[index] = self.mutate_abi_value(generator, inner, element);
                        }
                    }
                }
                DynSolValue::Array(values)
            }
            (DynSolType::FixedArray(inner, _), DynSolValue::FixedArray(mut values)) => {
                if !values.is_empty() {
                    let index = self.rng.gen_range(0..values.len());
                    let element = values[index].clone();
                    values[index] = self.mutate_abi_value(generator, inner, element);
                }
                DynSolValue::FixedArray(values)
            }
            (DynSolType::Tuple(types), DynSolValue::Tuple(mut values))
                if types.len() == values.len() && !values.is_empty() =>
            {
                let index = self.rng.gen_range(0..values.len());
                let element = values[index].clone();
                values[index] = self.mutate_abi_value(generator, &types[index], element);
                DynSolValue::Tuple(values)
            }
            // Mismatched or exotic values are replaced wholesale.
            (ty, _) => generator.generate_abi_value(ty),
        }
    }
}

/// The shrinking mutator used when minimizing a failing sequence: every
/// mutation moves a value toward its simplest form, so repeated application
/// under a verifier converges on a minimal reproduction.
pub struct ShrinkingValueMutator {
    rng: StdRng,
}

impl ShrinkingValueMutator {
    pub fn new(seed: u64) -> Self {
        Self { rng: StdRng::seed_from_u64(seed) }
    }

    fn shrink_uint(&mut self, value: U256) -> U256 {
        if value.is_zero() {
            return value;
        }
        match self.rng.gen_range(0..3) {
            0 => U256::ZERO,
            1 => value >> 1,
            _ => value - U256::from(1),
        }
    }
}

impl ValueMutator for ShrinkingValueMutator {
    fn mutate_abi_value(
        &mut self,
        generator: &mut dyn ValueGenerator,
        ty: &DynSolType,
        value: DynSolValue,
    ) -> DynSolValue {
        match (ty, value) {
            (DynSolType::Uint(bits), DynSolValue::Uint(value, _)) => {
                DynSolValue::Uint(self.shrink_uint(value), *bits)
            }
            (DynSolType::Int(bits), DynSolValue::Int(value, _)) => {
                let magnitude = self.shrink_uint(value.unsigned_abs());
                let shrunk = if value.is_negative() {
                    I256::ZERO.checked_sub(I256::from_raw(magnitude)).unwrap_or(I256::ZERO)
                } else {
                    I256::from_raw(magnitude)
                };
                DynSolValue::Int(shrunk, *bits)
            }
            (DynSolType::Bool, DynSolValue::Bool(_)) => DynSolValue::Bool(false),
            (DynSolType::Address, DynSolValue::Address(_)) => {
                DynSolValue::Address(Address::ZERO)
            }
            (DynSolType::FixedBytes(size), DynSolValue::FixedBytes(mut word, _)) => {
                // Clear the tail first so values shrink toward all-zero.
                let keep = self.rng.gen_range(0..=*size) / 2;
                word[keep..].fill(0);
                DynSolValue::FixedBytes(word, *size)
            }
            (DynSolType::Bytes, DynSolValue::Bytes(mut bytes)) => {
                bytes.truncate(bytes.len() / 2);
                DynSolValue::Bytes(bytes)
            }
            (DynSolType::String, DynSolValue::String(mut string)) => {
                string.truncate(string.len() / 2);
                DynSolValue::String(string)
            }
            (DynSolType::Array(inner), DynSolValue::Array(mut values)) => {
                if self.rng.gen_bool(0.5) || values.is_empty() {
                    values.truncate(values.len() / 2);
                } else {
                    let index = self.rng.gen_range(0..values.len());
                    let element = values[index].clone();
                    values[index] = self.mutate_abi_value(generator, inner, element);
                }
                DynSolValue::Array(values)
            }
            (DynSolType::FixedArray(inner, _), DynSolValue::FixedArray(mut values)) => {
                if !values.is_empty() {
                    let index = self.rng.gen_range(0..values.len());
                    let element = values[index].clone();
                    values[index] = self.mutate_abi_value(generator, inner, element);
                }
                DynSolValue::FixedArray(values)
            }
            (DynSolType::Tuple(types), DynSolValue::Tuple(mut values))
                if types.len() == values.len() && !values.is_empty() =>
            {
                let index = self.rng.gen_range(0..values.len());
                let element = values[index].clone();
                values[index] = self.mutate_abi_value(generator, &types[index], element);
                DynSolValue::Tuple(values)
            }
            (_, value) => value,
        }
    }
}

/// Sign-extends the low `bits` of a raw value to a full-width `I256`.
pub(super) fn sign_extend(raw: U256, bits: usize) -> I256 {
    if bits == 0 || bits >= 256 {
        return I256::from_raw(raw);
    }
    let sign_bit = U256::from(1) << (bits - 1);
    if raw & sign_bit == U256::ZERO {
        I256::from_raw(raw)
    } else {
        I256::from_raw(raw | (U256::MAX << bits))
    }
}

fn mutate_buffer(rng: &mut StdRng, bytes: &mut Vec<u8>) {
    match rng.gen_range(0..3) {
        0 => bytes.push(rng.gen()),
        1 => {
            bytes.pop();
        }
        _ => {
            if !bytes.is_empty() {
                let index = rng.gen_range(0..bytes.len());
                bytes[index] = rng.gen();
            }
        }
    }
}
