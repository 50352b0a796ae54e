//! Typed observer registries for fuzzer and worker lifecycle events.
//!
//! Observers are push-style and synchronous: publishing walks the
//! subscriber list in registration order on the publishing thread, and the
//! first subscriber error aborts the publish and propagates to the caller
//! as a worker (or fuzzer) error.

use crate::contracts::ContractDefinition;
use alloy_primitives::Address;
use eyre::Result;
use std::sync::Arc;

type EventHandler<E> = Box<dyn Fn(&E) -> Result<()> + Send + Sync>;

/// A registry of subscribers for one event type.
pub struct EventPublisher<E> {
    subscribers: Vec<EventHandler<E>>,
}

impl<E> Default for EventPublisher<E> {
    fn default() -> Self {
        Self { subscribers: Vec::new() }
    }
}

impl<E> EventPublisher<E> {
    pub fn subscribe(&mut self, handler: impl Fn(&E) -> Result<()> + Send + Sync + 'static) {
        self.subscribers.push(Box::new(handler));
    }

    pub fn publish(&self, event: &E) -> Result<()> {
        for subscriber in &self.subscribers {
            subscriber(event)?;
        }
        Ok(())
    }
}

/// The campaign started executing.
#[derive(Clone, Debug)]
pub struct FuzzerStartedEvent {
    pub workers: usize,
}

/// The campaign finished, cleanly or after a failure.
#[derive(Clone, Debug)]
pub struct FuzzerStoppedEvent {
    pub failure_count: u64,
}

/// Event registries published by the fuzzer itself.
#[derive(Default)]
pub struct FuzzerEvents {
    pub started: EventPublisher<FuzzerStartedEvent>,
    pub stopped: EventPublisher<FuzzerStoppedEvent>,
}

/// A worker cloned its chain and is ready to test sequences.
#[derive(Clone, Debug)]
pub struct WorkerChainCreatedEvent {
    pub worker_index: usize,
    pub testing_base_block_number: u64,
}

/// A worker is about to test a new call sequence.
#[derive(Clone, Debug)]
pub struct WorkerCallSequenceTestingEvent {
    pub worker_index: usize,
}

/// A worker finished testing a call sequence.
#[derive(Clone, Debug)]
pub struct WorkerCallSequenceTestedEvent {
    pub worker_index: usize,
}

/// A worker matched a deployment on its chain to a compiled contract.
#[derive(Clone, Debug)]
pub struct WorkerContractAddedEvent {
    pub worker_index: usize,
    pub address: Address,
    pub definition: Arc<ContractDefinition>,
}

/// A previously tracked deployment disappeared from a worker's chain.
#[derive(Clone, Debug)]
pub struct WorkerContractRemovedEvent {
    pub worker_index: usize,
    pub address: Address,
    pub definition: Arc<ContractDefinition>,
}

/// Event registries published by one fuzzer worker.
#[derive(Default)]
pub struct FuzzerWorkerEvents {
    pub chain_created: EventPublisher<WorkerChainCreatedEvent>,
    pub call_sequence_testing: EventPublisher<WorkerCallSequenceTestingEvent>,
    pub call_sequence_tested: EventPublisher<WorkerCallSequenceTestedEvent>,
    pub contract_added: EventPublisher<WorkerContractAddedEvent>,
    pub contract_removed: EventPublisher<WorkerContractRemovedEvent>,
}
