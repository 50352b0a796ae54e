//! A scripted in-memory [`TestChain`] backend.
//!
//! `MockChain` executes no EVM bytecode. Each deployed contract carries a
//! program closure that maps an incoming message to a [`MockExecution`]: a
//! receipt, plus the trace events to feed through attached tracers. This is
//! the backend the engine's own test suite runs against; embedding
//! applications provide a real EVM chain instead.

use crate::{
    CallMessage, ChainInitializer, ChainTracer, ContractDeploymentEvent, FrameStart,
    MessageReceipt, MessageResults, TestChain, TraceStep,
};
use alloy_primitives::{Address, Bytes, U256};
use eyre::{ensure, Result};
use revm::interpreter::opcode;
use std::{collections::HashMap, sync::Arc};

/// Per-contract word storage available to mock programs.
pub type MockStorage = HashMap<U256, U256>;

/// The behavior of a mock contract: maps a message to an execution outcome,
/// with read-write access to the contract's storage.
pub type MockProgram = Arc<dyn Fn(&CallMessage, &mut MockStorage) -> MockExecution + Send + Sync>;

/// The scripted outcome of executing one message.
pub struct MockExecution {
    /// Trace events replayed through every attached tracer, outermost frame
    /// first. Must be balanced: every `FrameStart` has a matching
    /// `FrameEnd`.
    pub trace: Vec<TraceEvent>,
    pub success: bool,
    pub gas_used: u64,
}

impl MockExecution {
    pub fn success(trace: Vec<TraceEvent>) -> Self {
        Self { trace, success: true, gas_used: 40_000 }
    }

    pub fn failure(trace: Vec<TraceEvent>) -> Self {
        Self { trace, success: false, gas_used: 40_000 }
    }
}

/// One event of a scripted execution trace.
pub enum TraceEvent {
    FrameStart(FrameStart),
    Step(TraceStep),
    FrameEnd { reverted: bool },
}

/// A `JUMP` step taking the edge `pc -> dst`.
pub fn jump_step(pc: u64, dst: u64) -> TraceEvent {
    TraceEvent::Step(TraceStep { pc, op: opcode::JUMP, stack: vec![U256::from(dst)] })
}

/// A `JUMPI` step at `pc` with branch target `dst` and the given condition.
pub fn jumpi_step(pc: u64, dst: u64, condition: bool) -> TraceEvent {
    TraceEvent::Step(TraceStep {
        pc,
        op: opcode::JUMPI,
        stack: vec![U256::from(dst), U256::from(condition as u64)],
    })
}

/// A contract registered on a [`MockChain`].
#[derive(Clone)]
pub struct MockDeployment {
    pub address: Address,
    pub init_bytecode: Bytes,
    pub runtime_bytecode: Bytes,
    pub program: MockProgram,
}

struct MockBlock {
    number: u64,
    timestamp: u64,
    storage: HashMap<Address, MockStorage>,
    nonces: HashMap<Address, u64>,
}

/// A scripted test chain.
///
/// Setup deployments registered with [`deploy`](Self::deploy) are recorded
/// and replayed onto every clone, after the clone's initializer has run, so
/// tracers and event consumers observe them the same way they would on a
/// real chain.
#[derive(Default)]
pub struct MockChain {
    deployments: Vec<MockDeployment>,
    contracts: HashMap<Address, MockDeployment>,
    tracers: Vec<Box<dyn ChainTracer>>,
    pending_events: Vec<ContractDeploymentEvent>,
    storage: HashMap<Address, MockStorage>,
    nonces: HashMap<Address, u64>,
    blocks: Vec<MockBlock>,
    head_number: u64,
    head_timestamp: u64,
    gas_price: u128,
}

impl MockChain {
    pub fn new() -> Self {
        Self { gas_price: 1_000_000_000, ..Default::default() }
    }

    /// Registers a contract on this chain, mining one setup block for it.
    /// The deployment is replayed onto every clone of this chain.
    pub fn deploy(&mut self, deployment: MockDeployment) {
        self.deployments.push(deployment.clone());
        self.apply_deployment(deployment);
    }

    /// Reads a storage word of a deployed contract. Test-only convenience.
    pub fn storage_value(&self, address: Address, slot: U256) -> U256 {
        self.storage.get(&address).and_then(|s| s.get(&slot)).copied().unwrap_or(U256::ZERO)
    }

    fn apply_deployment(&mut self, deployment: MockDeployment) {
        self.pending_events.push(ContractDeploymentEvent::Added {
            address: deployment.address,
            init_bytecode: deployment.init_bytecode.clone(),
            runtime_bytecode: deployment.runtime_bytecode.clone(),
            dynamic: false,
        });
        self.contracts.insert(deployment.address, deployment);
        self.mine_empty_block();
    }

    fn mine_empty_block(&mut self) {
        self.head_number += 1;
        self.head_timestamp += 1;
        self.snapshot_block();
    }

    fn snapshot_block(&mut self) {
        self.blocks.push(MockBlock {
            number: self.head_number,
            timestamp: self.head_timestamp,
            storage: self.storage.clone(),
            nonces: self.nonces.clone(),
        });
    }

    fn replay_trace(&mut self, trace: &[TraceEvent]) {
        for tracer in &mut self.tracers {
            for event in trace {
                match event {
                    TraceEvent::FrameStart(frame) => tracer.capture_frame_start(frame),
                    TraceEvent::Step(step) => tracer.capture_step(step),
                    TraceEvent::FrameEnd { reverted } => tracer.capture_frame_end(*reverted),
                }
            }
        }
    }
}

impl TestChain for MockChain {
    fn clone_chain(&self, initializer: ChainInitializer<'_>) -> Result<Box<dyn TestChain>> {
        let mut chain = Self::new();
        chain.gas_price = self.gas_price;
        initializer(&mut chain)?;
        for deployment in &self.deployments {
            chain.deployments.push(deployment.clone());
            chain.apply_deployment(deployment.clone());
        }
        Ok(Box::new(chain))
    }

    fn head_block_number(&self) -> u64 {
        self.head_number
    }

    fn revert_to_block_number(&mut self, block_number: u64) -> Result<()> {
        ensure!(
            block_number <= self.head_number,
            "cannot revert to block {block_number}: head is {}",
            self.head_number
        );
        self.blocks.retain(|block| block.number <= block_number);
        match self.blocks.last() {
            Some(block) => {
                self.storage = block.storage.clone();
                self.nonces = block.nonces.clone();
                self.head_timestamp = block.timestamp;
            }
            None => {
                self.storage.clear();
                self.nonces.clear();
                self.head_timestamp = 0;
            }
        }
        self.head_number = block_number;
        Ok(())
    }

    fn add_tracer(&mut self, tracer: Box<dyn ChainTracer>) {
        self.tracers.push(tracer);
    }

    fn execute_call(
        &mut self,
        message: &CallMessage,
        block_number_delay: u64,
        block_timestamp_delay: u64,
    ) -> Result<MessageResults> {
        let blocks_jumped = 1 + block_number_delay;
        self.head_number += blocks_jumped;
        // A mined block needs a distinct timestamp, so the jump is at least
        // one second per block.
        self.head_timestamp += block_timestamp_delay.max(blocks_jumped);

        let execution = match self.contracts.get(&message.to) {
            Some(contract) => {
                let program = contract.program.clone();
                let storage = self.storage.entry(message.to).or_default();
                program(message, storage)
            }
            None => {
                trace!(target: "hydra::mock_chain", to = %message.to, "call to empty account");
                MockExecution { trace: vec![], success: true, gas_used: 21_000 }
            }
        };

        for tracer in &mut self.tracers {
            tracer.capture_tx_start();
        }
        self.replay_trace(&execution.trace);
        let mut results = MessageResults::new(MessageReceipt {
            success: execution.success,
            gas_used: execution.gas_used,
        });
        for tracer in &mut self.tracers {
            tracer.capture_tx_end(&mut results);
        }

        *self.nonces.entry(message.from).or_default() += 1;
        self.snapshot_block();
        Ok(results)
    }

    fn account_nonce(&self, address: Address) -> u64 {
        self.nonces.get(&address).copied().unwrap_or_default()
    }

    fn gas_price(&self) -> u128 {
        self.gas_price
    }

    fn take_deployment_events(&mut self) -> Vec<ContractDeploymentEvent> {
        std::mem::take(&mut self.pending_events)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy_primitives::address;

    fn noop_deployment(target: Address) -> MockDeployment {
        MockDeployment {
            address: target,
            init_bytecode: Bytes::from_static(&[0x60, 0x80]),
            runtime_bytecode: Bytes::from_static(&[0x60, 0x40]),
            program: Arc::new(|_, _| MockExecution::success(vec![])),
        }
    }

    #[test]
    fn deployments_replay_on_clone() {
        let target = address!("00000000000000000000000000000000000000aa");
        let mut base = MockChain::new();
        base.deploy(noop_deployment(target));
        base.take_deployment_events();

        let mut clone = base.clone_chain(&mut |_| Ok(())).unwrap();
        let events = clone.take_deployment_events();
        assert_eq!(events.len(), 1);
        assert!(matches!(
            &events[0],
            ContractDeploymentEvent::Added { address, dynamic: false, .. } if *address == target
        ));
        assert_eq!(clone.head_block_number(), 1);
    }

    #[test]
    fn execute_call_advances_head_by_delays() {
        let target = address!("00000000000000000000000000000000000000aa");
        let mut chain = MockChain::new();
        chain.deploy(noop_deployment(target));

        let message = CallMessage { to: target, ..Default::default() };
        chain.execute_call(&message, 4, 100).unwrap();
        assert_eq!(chain.head_block_number(), 1 + 5);
        assert_eq!(chain.account_nonce(message.from), 1);
    }

    #[test]
    fn revert_restores_storage_and_nonces() {
        let target = address!("00000000000000000000000000000000000000aa");
        let mut chain = MockChain::new();
        chain.deploy(MockDeployment {
            program: Arc::new(|message, storage| {
                storage.insert(U256::ZERO, message.value);
                MockExecution::success(vec![])
            }),
            ..noop_deployment(target)
        });
        let base = chain.head_block_number();

        let message = CallMessage { to: target, value: U256::from(7), ..Default::default() };
        chain.execute_call(&message, 0, 0).unwrap();
        assert_eq!(chain.storage_value(target, U256::ZERO), U256::from(7));

        chain.revert_to_block_number(base).unwrap();
        assert_eq!(chain.head_block_number(), base);
        assert_eq!(chain.storage_value(target, U256::ZERO), U256::ZERO);
        assert_eq!(chain.account_nonce(message.from), 0);
    }

    #[test]
    fn revert_past_head_is_an_error() {
        let mut chain = MockChain::new();
        assert!(chain.revert_to_block_number(5).is_err());
    }
}
