//! # hydra-config
//!
//! Configuration for hydra fuzzing campaigns.

#![cfg_attr(docsrs, feature(doc_cfg, doc_auto_cfg))]

use alloy_primitives::{address, Address};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

mod error;
pub use error::ConfigError;

/// Contains the configuration for a fuzzing campaign.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FuzzingConfig {
    /// The number of worker threads executing call sequences in parallel.
    pub workers: usize,
    /// The number of call sequences a worker tests before it is torn down and
    /// respawned on a fresh chain clone, bounding chain memory growth.
    pub worker_reset_limit: usize,
    /// Campaign wall-clock limit in seconds. Zero disables the limit.
    pub timeout: u64,
    /// The total number of call sequences to test across all workers before
    /// the campaign stops. Zero disables the limit.
    pub test_limit: u64,
    /// The number of calls in a generated call sequence.
    pub call_sequence_length: usize,
    /// Optional seed for the campaign RNG. Workers derive disjoint seeds from
    /// it, so runs are reproducible given a seed.
    pub seed: Option<u64>,
    /// Directory where corpus entries are persisted and re-loaded from.
    /// If not set, the corpus lives in memory only.
    pub corpus_directory: Option<PathBuf>,
    /// Whether to attach the coverage tracer to worker chains and use
    /// coverage-guided corpus updates.
    pub coverage_enabled: bool,
    /// The sender addresses used for fuzzed calls.
    pub sender_addresses: Vec<Address>,
    /// The address deploying target contracts during chain setup.
    pub deployer_address: Address,
    /// The maximum number of blocks a generated call may jump ahead.
    pub max_block_number_delay: u64,
    /// The maximum number of seconds a generated call may jump ahead.
    pub max_block_timestamp_delay: u64,
    /// Block gas limit of the test chain.
    pub block_gas_limit: u64,
    /// Gas limit for each fuzzed transaction.
    pub transaction_gas_limit: u64,
    /// The maximum number of iterations spent shrinking a failing sequence.
    pub shrink_limit: u64,
    /// Stop the campaign once a property test failed and was shrunk.
    pub stop_on_failed_test: bool,
    /// Treat a deployed contract that cannot be matched to a compiled
    /// contract definition as a fatal error.
    pub stop_on_failed_contract_matching: bool,
    /// Weights for the call sequence generation strategies.
    pub sequence_generation: SequenceGenerationConfig,
}

impl Default for FuzzingConfig {
    fn default() -> Self {
        Self {
            workers: 10,
            worker_reset_limit: 50,
            timeout: 0,
            test_limit: 0,
            call_sequence_length: 100,
            seed: None,
            corpus_directory: None,
            coverage_enabled: true,
            sender_addresses: vec![
                address!("1111111111111111111111111111111111111111"),
                address!("2222222222222222222222222222222222222222"),
                address!("3333333333333333333333333333333333333333"),
            ],
            deployer_address: address!("1111111111111111111111111111111111111111"),
            max_block_number_delay: 60_480,
            max_block_timestamp_delay: 604_800,
            block_gas_limit: 125_000_000,
            transaction_gas_limit: 12_500_000,
            shrink_limit: 5000,
            stop_on_failed_test: true,
            stop_on_failed_contract_matching: true,
            sequence_generation: SequenceGenerationConfig::default(),
        }
    }
}

impl FuzzingConfig {
    /// Validates the configuration, returning the first offending value.
    ///
    /// Invalid configuration is fatal at campaign startup.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.workers == 0 {
            return Err(ConfigError::ZeroWorkers);
        }
        if self.call_sequence_length == 0 {
            return Err(ConfigError::ZeroCallSequenceLength);
        }
        if self.sender_addresses.is_empty() {
            return Err(ConfigError::NoSenders);
        }
        let p = self.sequence_generation.new_sequence_probability;
        if !(0.0..=1.0).contains(&p) || p.is_nan() {
            return Err(ConfigError::InvalidNewSequenceProbability(p));
        }
        Ok(())
    }
}

/// Weights controlling how a worker derives its next call sequence.
///
/// Each mutation strategy is selected by weighted random choice; a zero
/// weight disables the strategy. If every weight is zero, or the corpus has
/// no entries yet, sequences are generated entirely fresh.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct SequenceGenerationConfig {
    /// The probability of generating an entirely new sequence rather than
    /// mutating corpus entries. Must be within `[0, 1]`.
    pub new_sequence_probability: f32,
    /// Weight of copying the head of a corpus sequence, unmodified, and
    /// generating fresh calls for the rest.
    pub random_unmodified_corpus_head_weight: u64,
    /// Weight of copying a random-length tail of a corpus sequence,
    /// unmodified, and generating fresh calls at the start.
    pub random_unmodified_corpus_tail_weight: u64,
    /// Weight of replicating an element of a copied corpus sequence at
    /// nearby positions, expanding it up to 30 times.
    pub random_unmodified_expansion_weight: u64,
    /// Weight of splicing a random-length head and tail of two corpus
    /// sequences together, unmodified.
    pub random_unmodified_splice_at_random_weight: u64,
    /// Weight of interleaving random-length prefixes of two corpus
    /// sequences, unmodified.
    pub random_unmodified_interleave_at_random_weight: u64,
    /// Weight of the corpus-head strategy with per-call input mutation.
    pub random_mutated_corpus_head_weight: u64,
    /// Weight of the corpus-tail strategy with per-call input mutation.
    pub random_mutated_corpus_tail_weight: u64,
    /// Weight of the splice strategy with per-call input mutation.
    pub random_mutated_splice_at_random_weight: u64,
    /// Weight of the interleave strategy with per-call input mutation.
    pub random_mutated_interleave_at_random_weight: u64,
}

impl Default for SequenceGenerationConfig {
    fn default() -> Self {
        Self {
            new_sequence_probability: 0.3,
            random_unmodified_corpus_head_weight: 800,
            random_unmodified_corpus_tail_weight: 100,
            random_unmodified_expansion_weight: 80,
            random_unmodified_splice_at_random_weight: 200,
            random_unmodified_interleave_at_random_weight: 100,
            random_mutated_corpus_head_weight: 80,
            random_mutated_corpus_tail_weight: 10,
            random_mutated_splice_at_random_weight: 20,
            random_mutated_interleave_at_random_weight: 10,
        }
    }
}
