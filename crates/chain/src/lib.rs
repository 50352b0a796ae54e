//! # hydra-chain
//!
//! The test chain interface the hydra fuzzing engine drives.
//!
//! The engine never implements an EVM itself: it executes synthesized
//! transactions against a [`TestChain`] supplied by the embedding
//! application, observes execution through [`ChainTracer`]s, and reads
//! per-message results (receipt plus a string-keyed bag of tracer
//! artifacts). A scripted in-memory backend for tests lives in [`mock`].

#![cfg_attr(docsrs, feature(doc_cfg, doc_auto_cfg))]

#[macro_use]
extern crate tracing;

use alloy_primitives::{Address, Bytes};
use eyre::Result;

mod types;
pub use types::{AdditionalResults, CallMessage, MessageReceipt, MessageResults};

mod tracer;
pub use tracer::{ChainTracer, FrameStart, TraceStep};

pub mod mock;

/// A contract deployment change observed on a test chain.
///
/// Events are buffered by the chain and drained by its owner with
/// [`TestChain::take_deployment_events`], so the consumer decides when to
/// react to deployments without the chain calling back into it.
#[derive(Clone, Debug)]
pub enum ContractDeploymentEvent {
    /// Bytecode was deployed at `address`.
    Added {
        address: Address,
        init_bytecode: Bytes,
        runtime_bytecode: Bytes,
        /// Whether the deployment happened dynamically during a fuzzed call
        /// (`CREATE`/`CREATE2`) rather than during chain setup.
        dynamic: bool,
    },
    /// A previously deployed contract was removed, e.g. by a chain revert
    /// past its deployment block or a `SELFDESTRUCT`.
    Removed { address: Address },
}

/// A closure run on a freshly cloned chain before its setup transactions are
/// replayed, so tracers observe the initial deployments as well.
pub type ChainInitializer<'a> = &'a mut dyn FnMut(&mut dyn TestChain) -> Result<()>;

/// An EVM-backed test chain the fuzzing engine executes call sequences on.
///
/// Implementations own all chain state. Workers hold exclusive ownership of
/// their clone; the only shared use is `clone_chain` on the campaign's base
/// chain, which is externally serialized.
pub trait TestChain: Send {
    /// Produces an independent copy of this chain.
    ///
    /// The `initializer` runs on the clone pre-genesis: tracers added inside
    /// it are attached before the base chain's setup deployments are
    /// replayed onto the clone.
    fn clone_chain(&self, initializer: ChainInitializer<'_>) -> Result<Box<dyn TestChain>>;

    /// The block number of the current chain head.
    fn head_block_number(&self) -> u64;

    /// Rolls the chain back so `block_number` is the new head, discarding
    /// all later blocks and their state.
    fn revert_to_block_number(&mut self, block_number: u64) -> Result<()>;

    /// Attaches a tracer observing every message executed from now on.
    fn add_tracer(&mut self, tracer: Box<dyn ChainTracer>);

    /// Mines `message` in a new block whose number and timestamp advance by
    /// the given delays, and returns its execution results.
    fn execute_call(
        &mut self,
        message: &CallMessage,
        block_number_delay: u64,
        block_timestamp_delay: u64,
    ) -> Result<MessageResults>;

    /// The current nonce of `address`.
    fn account_nonce(&self, address: Address) -> u64;

    /// The gas price messages are expected to pay.
    fn gas_price(&self) -> u128;

    /// Drains contract deployment events buffered since the last call.
    fn take_deployment_events(&mut self) -> Vec<ContractDeploymentEvent>;
}
