use crate::MessageResults;
use alloy_primitives::{Address, Bytes, U256};

/// The context passed to tracers when a call frame is entered.
#[derive(Clone, Debug)]
pub struct FrameStart {
    /// The address the frame executes under.
    pub address: Address,
    /// The bytecode being executed: init code for `create` frames, runtime
    /// code otherwise.
    pub code: Bytes,
    /// Whether the frame deploys a contract (`CREATE`/`CREATE2`).
    pub create: bool,
}

/// A single interpreter step observed by a tracer.
#[derive(Clone, Debug)]
pub struct TraceStep {
    /// The program counter of the opcode about to execute.
    pub pc: u64,
    /// The opcode about to execute.
    pub op: u8,
    /// The top of the EVM stack, topmost element first. Backends only need
    /// to expose as many elements as the opcode consumes.
    pub stack: Vec<U256>,
}

impl TraceStep {
    /// The `n`-th element from the top of the stack, zero-based.
    pub fn stack_back(&self, n: usize) -> Option<&U256> {
        self.stack.get(n)
    }
}

/// An observer of EVM execution on a test chain.
///
/// The chain drives the tracer through one transaction at a time: a
/// `capture_tx_start`, then a balanced sequence of frame entries, steps and
/// frame exits, then `capture_tx_end` with the message results the tracer
/// may attach artifacts to.
#[allow(unused_variables)]
pub trait ChainTracer: Send {
    /// Called before any frame of a transaction executes.
    fn capture_tx_start(&mut self) {}

    /// Called when a call frame is entered, including the outermost one.
    fn capture_frame_start(&mut self, frame: &FrameStart) {}

    /// Called for each interpreter step within the current frame.
    fn capture_step(&mut self, step: &TraceStep) {}

    /// Called when the current frame exits. `reverted` is true if the frame
    /// ended in revert, an invalid opcode, or out-of-gas.
    fn capture_frame_end(&mut self, reverted: bool) {}

    /// Called after the transaction completes, so the tracer can attach its
    /// artifacts to the message results.
    fn capture_tx_end(&mut self, results: &mut MessageResults) {}
}
