//! Iterative call sequence generation.
//!
//! A [`CallSequenceGenerator`] prepares one base sequence at a time, either
//! verbatim from the unexecuted corpus queue, entirely fresh, or derived
//! from corpus samples by a weighted-random mutation strategy. Elements are
//! handed out lazily through [`pop_sequence_element`]: holes left by the
//! strategy are synthesized on demand, and corpus-derived elements can be
//! mutated per element right before they are fetched, so mutations see the
//! most recent runtime state.
//!
//! [`pop_sequence_element`]: CallSequenceGenerator::pop_sequence_element

use crate::{
    calls::{Call, CallSequenceElement},
    contracts::DeployedContractMethod,
    corpus::{Corpus, CorpusError},
    random::WeightedRandomChooser,
    value::{ValueGenerator, ValueMutator},
};
use alloy_dyn_abi::Specifier;
use alloy_primitives::U256;
use eyre::{Context, Result};
use hydra_chain::TestChain;
use hydra_config::{FuzzingConfig, SequenceGenerationConfig};
use rand::{rngs::StdRng, Rng};

/// Errors raised while synthesizing call sequence elements.
#[derive(Debug, thiserror::Error)]
pub enum SequenceGeneratorError {
    /// Neither pure nor state-changing methods are deployed; nothing can be
    /// fuzzed.
    #[error("cannot generate a fuzzed call: no deployed methods are known")]
    NoMethods,
}

/// How a strategy derives the base sequence from corpus samples.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum MutationStrategyKind {
    /// Copy the head of a corpus sequence; the rest is generated fresh.
    CorpusHead,
    /// Copy a random-length tail of a corpus sequence; the head is fresh.
    CorpusTail,
    /// Copy a corpus sequence and replicate one of its elements at nearby
    /// positions, up to 30 times.
    Expansion,
    /// Join a random-length head and tail of two corpus sequences.
    SpliceAtRandom,
    /// Interleave random-length prefixes of two corpus sequences.
    InterleaveAtRandom,
}

#[derive(Clone, Copy, Debug)]
struct MutationStrategy {
    kind: MutationStrategyKind,
    /// Whether every prefetched element gets its ABI inputs mutated.
    mutate_prefetch: bool,
}

/// The worker state a generator draws on. Assembled fresh for each call
/// into the generator; everything here is owned by the worker.
pub struct GeneratorContext<'a> {
    pub rng: &'a mut StdRng,
    pub chain: &'a dyn TestChain,
    pub corpus: &'a Corpus,
    pub config: &'a FuzzingConfig,
    pub pure_methods: &'a [DeployedContractMethod],
    pub state_changing_methods: &'a [DeployedContractMethod],
    pub value_generator: &'a mut dyn ValueGenerator,
    pub value_mutator: &'a mut dyn ValueMutator,
}

/// Generates call sequences iteratively, element by element.
pub struct CallSequenceGenerator {
    /// Weighted selector over the configured mutation strategies.
    mutation_strategy_chooser: WeightedRandomChooser<MutationStrategy>,
    /// The sequence being handed out. `None` slots are synthesized fresh
    /// when fetched.
    base_sequence: Vec<Option<CallSequenceElement>>,
    /// The next element to hand out.
    fetch_index: usize,
    /// Whether prefetched corpus elements are mutated before use.
    mutate_prefetch: bool,
}

impl CallSequenceGenerator {
    pub fn new(config: &SequenceGenerationConfig) -> Self {
        let mut chooser = WeightedRandomChooser::new();
        let strategies = [
            (MutationStrategyKind::CorpusHead, false, config.random_unmodified_corpus_head_weight),
            (MutationStrategyKind::CorpusTail, false, config.random_unmodified_corpus_tail_weight),
            (MutationStrategyKind::Expansion, false, config.random_unmodified_expansion_weight),
            (
                MutationStrategyKind::SpliceAtRandom,
                false,
                config.random_unmodified_splice_at_random_weight,
            ),
            (
                MutationStrategyKind::InterleaveAtRandom,
                false,
                config.random_unmodified_interleave_at_random_weight,
            ),
            (MutationStrategyKind::CorpusHead, true, config.random_mutated_corpus_head_weight),
            (MutationStrategyKind::CorpusTail, true, config.random_mutated_corpus_tail_weight),
            (
                MutationStrategyKind::SpliceAtRandom,
                true,
                config.random_mutated_splice_at_random_weight,
            ),
            (
                MutationStrategyKind::InterleaveAtRandom,
                true,
                config.random_mutated_interleave_at_random_weight,
            ),
        ];
        for (kind, mutate_prefetch, weight) in strategies {
            chooser.add_choice(MutationStrategy { kind, mutate_prefetch }, u128::from(weight));
        }
        Self {
            mutation_strategy_chooser: chooser,
            base_sequence: Vec::new(),
            fetch_index: 0,
            mutate_prefetch: false,
        }
    }

    /// Prepares the generator for a new sequence.
    ///
    /// Returns whether the sequence is newly generated, as opposed to a
    /// loaded-but-unexecuted corpus sequence replayed verbatim.
    pub fn initialize_next_sequence(&mut self, ctx: &mut GeneratorContext<'_>) -> Result<bool> {
        self.base_sequence = vec![None; ctx.config.call_sequence_length];
        self.fetch_index = 0;
        self.mutate_prefetch = false;

        // Sequences loaded from disk are executed before any fuzzing.
        if let Some(unexecuted) = ctx.corpus.unexecuted_call_sequence() {
            self.base_sequence = unexecuted.into_iter().map(Some).collect();
            return Ok(false);
        }

        // Without strategies or corpus entries, all slots stay empty and
        // every element is generated fresh.
        if self.mutation_strategy_chooser.choice_count() == 0
            || ctx.corpus.active_mutable_sequence_count() == 0
        {
            return Ok(true);
        }

        if ctx.rng.gen::<f32>() > ctx.config.sequence_generation.new_sequence_probability {
            let strategy = self.mutation_strategy_chooser.choose(ctx.rng).copied();
            if let Some(strategy) = strategy {
                match apply_strategy(strategy.kind, &mut self.base_sequence, ctx) {
                    Ok(()) => self.mutate_prefetch = strategy.mutate_prefetch,
                    // A strategy losing the race for corpus entries is not
                    // fatal; the sequence is generated fresh instead.
                    Err(CorpusError::Empty) => {
                        debug!(
                            target: "hydra::generator",
                            "corpus drained under a mutation strategy, generating fresh"
                        );
                    }
                }
            }
        }
        Ok(true)
    }

    /// Hands out the next element of the prepared sequence, or `None` when
    /// the sequence is exhausted.
    pub fn pop_sequence_element(
        &mut self,
        ctx: &mut GeneratorContext<'_>,
    ) -> Result<Option<CallSequenceElement>> {
        if self.fetch_index >= self.base_sequence.len() {
            return Ok(None);
        }

        let mut element = match self.base_sequence[self.fetch_index].take() {
            None => generate_new_element(ctx)?,
            Some(mut element) => {
                if self.mutate_prefetch {
                    mutate_element_inputs(ctx, &mut element)?;
                }
                element
            }
        };

        // Late-bind nonce and gas price so re-used elements match the
        // current chain head.
        element.call.fill_from_chain(ctx.chain);
        self.fetch_index += 1;
        Ok(Some(element))
    }
}

/// Synthesizes a fresh element targeting a random deployed method.
fn generate_new_element(ctx: &mut GeneratorContext<'_>) -> Result<CallSequenceElement> {
    if ctx.state_changing_methods.is_empty() && ctx.pure_methods.is_empty() {
        return Err(SequenceGeneratorError::NoMethods.into());
    }

    // Pure methods are worth an occasional call for the coverage they hold,
    // but state-changing methods drive the interesting transitions: pure
    // ones get a 1-in-100 chance unless they are all there is.
    let only_pure = ctx.state_changing_methods.is_empty();
    let method = if (!ctx.pure_methods.is_empty() && ctx.rng.gen_range(0..100) == 0) || only_pure {
        &ctx.pure_methods[ctx.rng.gen_range(0..ctx.pure_methods.len())]
    } else {
        &ctx.state_changing_methods[ctx.rng.gen_range(0..ctx.state_changing_methods.len())]
    };

    let senders = &ctx.config.sender_addresses;
    let sender = senders[ctx.rng.gen_range(0..senders.len())];

    let mut input_values = Vec::with_capacity(method.method.inputs.len());
    for input in &method.method.inputs {
        let ty = input
            .resolve()
            .wrap_err_with(|| format!("could not resolve parameter type `{}`", input.ty))?;
        input_values.push(ctx.value_generator.generate_abi_value(&ty));
    }

    let value = if method.is_payable() {
        ctx.value_generator.generate_integer(false, 64)
    } else {
        U256::ZERO
    };

    let mut block_number_delay = 0;
    let mut block_timestamp_delay = 0;
    if ctx.config.max_block_number_delay > 0 {
        block_number_delay = ctx.value_generator.generate_integer(false, 64).as_limbs()[0]
            % (ctx.config.max_block_number_delay + 1);
    }
    if ctx.config.max_block_timestamp_delay > 0 {
        block_timestamp_delay = ctx.value_generator.generate_integer(false, 64).as_limbs()[0]
            % (ctx.config.max_block_timestamp_delay + 1);
    }

    let call = Call::from_method(
        sender,
        method.address,
        method.method.clone(),
        input_values,
        value,
        ctx.config.transaction_gas_limit,
    )?
    .with_delays(block_number_delay, block_timestamp_delay);

    Ok(CallSequenceElement::new(Some(method.contract.clone()), call))
}

/// Mutates every ABI input of `element` and re-encodes its calldata.
/// Elements without structured input values (e.g. restored from disk) are
/// left untouched.
fn mutate_element_inputs(
    ctx: &mut GeneratorContext<'_>,
    element: &mut CallSequenceElement,
) -> Result<()> {
    let Some(abi_data) = element.call.abi_data.as_mut() else { return Ok(()) };
    for (index, input) in abi_data.method.inputs.iter().enumerate() {
        let ty = input
            .resolve()
            .wrap_err_with(|| format!("could not resolve parameter type `{}`", input.ty))?;
        let value = abi_data.input_values[index].clone();
        abi_data.input_values[index] =
            ctx.value_mutator.mutate_abi_value(&mut *ctx.value_generator, &ty, value);
    }
    element.call.reencode_calldata()
}

fn apply_strategy(
    kind: MutationStrategyKind,
    base: &mut Vec<Option<CallSequenceElement>>,
    ctx: &mut GeneratorContext<'_>,
) -> Result<(), CorpusError> {
    match kind {
        MutationStrategyKind::CorpusHead => strategy_corpus_head(base, ctx),
        MutationStrategyKind::CorpusTail => strategy_corpus_tail(base, ctx),
        MutationStrategyKind::Expansion => strategy_expansion(base, ctx),
        MutationStrategyKind::SpliceAtRandom => strategy_splice_at_random(base, ctx),
        MutationStrategyKind::InterleaveAtRandom => strategy_interleave_at_random(base, ctx),
    }
}

fn strategy_corpus_head(
    base: &mut [Option<CallSequenceElement>],
    ctx: &mut GeneratorContext<'_>,
) -> Result<(), CorpusError> {
    let entry = ctx.corpus.random_mutation_target_sequence(ctx.rng)?;
    let max_length = base.len().min(entry.sequence.len());
    for (slot, element) in base.iter_mut().zip(&entry.sequence[..max_length]) {
        *slot = Some(element.clone());
    }
    Ok(())
}

fn strategy_corpus_tail(
    base: &mut [Option<CallSequenceElement>],
    ctx: &mut GeneratorContext<'_>,
) -> Result<(), CorpusError> {
    let entry = ctx.corpus.random_mutation_target_sequence(ctx.rng)?;
    let max_length = base.len().min(entry.sequence.len());
    if max_length == 0 {
        return Ok(());
    }
    let target_length = ctx.rng.gen_range(0..max_length) + 1;
    let base_offset = base.len() - target_length;
    let source_offset = entry.sequence.len() - target_length;
    for i in 0..target_length {
        base[base_offset + i] = Some(entry.sequence[source_offset + i].clone());
    }
    Ok(())
}

/// Copies one corpus sequence and replicates a random element of the copy
/// at advancing nearby positions, inserting (never overwriting) and
/// truncating at the configured sequence length.
fn strategy_expansion(
    base: &mut Vec<Option<CallSequenceElement>>,
    ctx: &mut GeneratorContext<'_>,
) -> Result<(), CorpusError> {
    let entry = ctx.corpus.random_mutation_target_sequence(ctx.rng)?;
    let copied = base.len().min(entry.sequence.len());
    if copied == 0 {
        return Ok(());
    }
    for (slot, element) in base.iter_mut().zip(&entry.sequence[..copied]) {
        *slot = Some(element.clone());
    }

    let capacity = base.len();
    let rounds = ctx.rng.gen_range(0..=30);
    let mut index = ctx.rng.gen_range(0..copied);
    let duplicated = base[index].clone();
    for round in 0..rounds {
        index += round;
        if index >= base.len() {
            break;
        }
        base.insert(index, duplicated.clone());
        base.truncate(capacity);
    }
    Ok(())
}

fn strategy_splice_at_random(
    base: &mut [Option<CallSequenceElement>],
    ctx: &mut GeneratorContext<'_>,
) -> Result<(), CorpusError> {
    let head = ctx.corpus.random_mutation_target_sequence(ctx.rng)?;
    let tail = ctx.corpus.random_mutation_target_sequence(ctx.rng)?;

    let max_length = base.len().min(head.sequence.len());
    if max_length == 0 {
        return Ok(());
    }
    let head_length = ctx.rng.gen_range(0..max_length) + 1;
    for (slot, element) in base.iter_mut().zip(&head.sequence[..head_length]) {
        *slot = Some(element.clone());
    }

    let max_tail_length = (base.len() - head_length).min(tail.sequence.len());
    let tail_length = ctx.rng.gen_range(0..=max_tail_length);
    let source_offset = tail.sequence.len() - tail_length;
    for i in 0..tail_length {
        base[head_length + i] = Some(tail.sequence[source_offset + i].clone());
    }
    Ok(())
}

fn strategy_interleave_at_random(
    base: &mut [Option<CallSequenceElement>],
    ctx: &mut GeneratorContext<'_>,
) -> Result<(), CorpusError> {
    let first = ctx.corpus.random_mutation_target_sequence(ctx.rng)?;
    let second = ctx.corpus.random_mutation_target_sequence(ctx.rng)?;

    let max_length = base.len().min(first.sequence.len());
    if max_length == 0 {
        return Ok(());
    }
    let first_length = ctx.rng.gen_range(0..max_length) + 1;
    let max_second_length = (base.len() - first_length).min(second.sequence.len());
    let second_length = ctx.rng.gen_range(0..=max_second_length);

    interleave_into(base, &first.sequence, first_length, &second.sequence, second_length);
    Ok(())
}

/// Interleaves `first[..first_length]` and `second[..second_length]` into
/// the front of `base`, element by element, starting with `first`.
fn interleave_into(
    base: &mut [Option<CallSequenceElement>],
    first: &[CallSequenceElement],
    first_length: usize,
    second: &[CallSequenceElement],
    second_length: usize,
) {
    let mut destination = 0;
    for i in 0..first_length.max(second_length) {
        if i < first_length {
            base[destination] = Some(first[i].clone());
            destination += 1;
        }
        if i < second_length {
            base[destination] = Some(second[i].clone());
            destination += 1;
        }
    }
}
