//! # hydra-fuzzing
//!
//! The hydra coverage-guided fuzzing engine.
//!
//! A [`Fuzzer`] drives N worker threads, each owning a clone of the
//! campaign's base test chain. Workers synthesize call sequences (fresh, or
//! derived from the shared [`Corpus`](corpus::Corpus) by weighted mutation
//! strategies), execute them with an edge-coverage tracer attached, feed
//! coverage back into the corpus, run the registered property tests against
//! every executed prefix, and minimize failing sequences before reporting
//! them.

#![cfg_attr(docsrs, feature(doc_cfg, doc_auto_cfg))]

#[macro_use]
extern crate tracing;

pub mod calls;
pub mod contracts;
pub mod corpus;
pub mod events;
mod fuzzer;
pub mod generator;
pub mod metrics;
pub mod random;
mod shrink;
pub mod value;
mod worker;

pub use fuzzer::{
    CancellationToken, Fuzzer, FuzzerHooks, FuzzingResults, NewValueGeneratorFn,
    WorkerConfiguratorFn,
};
pub use generator::SequenceGeneratorError;
pub use worker::{
    CallSequenceTestFn, FuzzerWorker, ShrinkCallSequenceRequest, ShrinkSequenceFinishedFn,
    ShrinkSequenceVerifierFn,
};
