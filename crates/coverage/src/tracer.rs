use crate::{contract_coverage_map_hash, edge_marker, CoverageMaps};
use alloy_primitives::{Address, Bytes, B256, U256};
use hydra_chain::{ChainTracer, FrameStart, MessageResults, TraceStep};
use revm::interpreter::opcode;

/// The key under which the coverage tracer stores its [`CoverageMaps`] in
/// the additional results of a message.
pub const COVERAGE_TRACER_RESULTS_KEY: &str = "CoverageTracerResults";

/// Obtains the [`CoverageMaps`] recorded by a [`CoverageTracer`] from
/// message results. `None` if no coverage tracer was attached during this
/// message execution.
pub fn get_coverage_tracer_results(results: &MessageResults) -> Option<&CoverageMaps> {
    results
        .additional_results
        .get(COVERAGE_TRACER_RESULTS_KEY)
        .and_then(|result| result.downcast_ref())
}

/// Removes and returns the [`CoverageMaps`] recorded by a
/// [`CoverageTracer`] from message results.
pub fn take_coverage_tracer_results(results: &mut MessageResults) -> Option<CoverageMaps> {
    let result = results.additional_results.remove(COVERAGE_TRACER_RESULTS_KEY)?;
    match result.downcast::<CoverageMaps>() {
        Ok(maps) => Some(*maps),
        Err(other) => {
            results.additional_results.insert(COVERAGE_TRACER_RESULTS_KEY.into(), other);
            None
        }
    }
}

/// State tracked per call frame while tracing.
struct CallFrameState {
    /// Whether the frame executes init bytecode (deploying a contract).
    create: bool,
    /// The address the frame executes under.
    address: Address,
    /// The code executing in this frame, kept for lazy hash computation.
    code: Bytes,
    /// The coverage map identity of the executing code, computed the first
    /// time the frame emits an edge.
    lookup_hash: Option<B256>,
    /// Coverage recorded for this frame, merged into the parent on exit.
    pending: CoverageMaps,
}

/// A [`ChainTracer`] collecting edge coverage from EVM execution.
///
/// Only `JUMP` and `JUMPI` produce markers; a `JUMPI` with a zero condition
/// records the fall-through edge to `pc + 1`. Frames that exit in revert
/// have their pending coverage re-tagged into the revert channel before it
/// is merged into the parent frame, so a parent (and ultimately the corpus)
/// still sees the paths the reverted frame explored.
#[derive(Default)]
pub struct CoverageTracer {
    /// Coverage committed by exited outermost frames of the current tx.
    coverage_maps: CoverageMaps,
    /// Stack of per-frame states, indexed by call depth.
    frame_states: Vec<CallFrameState>,
}

impl CoverageTracer {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ChainTracer for CoverageTracer {
    fn capture_tx_start(&mut self) {
        self.coverage_maps = CoverageMaps::new();
        self.frame_states.clear();
    }

    fn capture_frame_start(&mut self, frame: &FrameStart) {
        self.frame_states.push(CallFrameState {
            create: frame.create,
            address: frame.address,
            code: frame.code.clone(),
            lookup_hash: None,
            pending: CoverageMaps::new(),
        });
    }

    fn capture_step(&mut self, step: &TraceStep) {
        let state = self
            .frame_states
            .last_mut()
            .expect("coverage tracer observed a step outside of any call frame");

        let dst = match step.op {
            opcode::JUMP => step.stack_back(0).copied(),
            opcode::JUMPI => {
                let taken = step.stack_back(1).is_some_and(|condition| !condition.is_zero());
                if taken {
                    step.stack_back(0).copied()
                } else {
                    Some(U256::from(step.pc + 1))
                }
            }
            _ => return,
        };
        let Some(dst) = dst else { return };

        let lookup_hash = *state
            .lookup_hash
            .get_or_insert_with(|| contract_coverage_map_hash(&state.code, state.create));
        let marker = edge_marker(step.pc, dst.saturating_to::<u64>());
        state.pending.set_at(state.address, lookup_hash, state.code.len(), marker);
    }

    fn capture_frame_end(&mut self, reverted: bool) {
        let mut state = self
            .frame_states
            .pop()
            .expect("coverage tracer observed an unbalanced call frame exit");
        if reverted && state.pending.revert_all() {
            trace!(
                target: "hydra::coverage",
                address = %state.address,
                "re-tagged coverage of reverted frame"
            );
        }
        match self.frame_states.last_mut() {
            Some(parent) => parent.pending.update(&state.pending),
            None => self.coverage_maps.update(&state.pending),
        };
    }

    fn capture_tx_end(&mut self, results: &mut MessageResults) {
        let maps = std::mem::take(&mut self.coverage_maps);
        results
            .additional_results
            .insert(COVERAGE_TRACER_RESULTS_KEY.into(), Box::new(maps));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy_primitives::address;
    use hydra_chain::{MessageReceipt, MessageResults};

    const ADDR: Address = address!("00000000000000000000000000000000000000aa");
    const CODE: [u8; 4] = [0x60, 0x01, 0x56, 0x5b];

    fn frame(create: bool) -> FrameStart {
        FrameStart { address: ADDR, code: Bytes::from_static(&CODE), create }
    }

    fn jump(pc: u64, dst: u64) -> TraceStep {
        TraceStep { pc, op: opcode::JUMP, stack: vec![U256::from(dst)] }
    }

    fn jumpi(pc: u64, dst: u64, condition: u64) -> TraceStep {
        TraceStep {
            pc,
            op: opcode::JUMPI,
            stack: vec![U256::from(dst), U256::from(condition)],
        }
    }

    fn finish(tracer: &mut CoverageTracer) -> CoverageMaps {
        let mut results =
            MessageResults::new(MessageReceipt { success: true, gas_used: 0 });
        tracer.capture_tx_end(&mut results);
        take_coverage_tracer_results(&mut results).unwrap()
    }

    #[test]
    fn records_jump_and_branch_edges() {
        let mut tracer = CoverageTracer::new();
        tracer.capture_tx_start();
        tracer.capture_frame_start(&frame(false));
        tracer.capture_step(&jump(2, 10));
        tracer.capture_step(&jumpi(12, 40, 1));
        tracer.capture_step(&jumpi(12, 40, 0));
        // Non-branching opcodes are ignored.
        tracer.capture_step(&TraceStep { pc: 13, op: opcode::ADD, stack: vec![] });
        tracer.capture_frame_end(false);

        let maps = finish(&mut tracer);
        let hash = contract_coverage_map_hash(&CODE, false);
        let map = maps.contract_map(&hash).unwrap();
        assert_eq!(map.hit_count(edge_marker(2, 10)), 1);
        assert_eq!(map.hit_count(edge_marker(12, 40)), 1);
        assert_eq!(map.hit_count(edge_marker(12, 13)), 1);
        assert_eq!(map.covered_edge_count(true), 3);
        assert_eq!(map.address(), ADDR);
        assert_eq!(map.code_size(), CODE.len());
    }

    #[test]
    fn create_frames_use_the_init_code_identity() {
        let mut tracer = CoverageTracer::new();
        tracer.capture_tx_start();
        tracer.capture_frame_start(&frame(true));
        tracer.capture_step(&jump(2, 10));
        tracer.capture_frame_end(false);

        let maps = finish(&mut tracer);
        assert!(maps.contract_map(&contract_coverage_map_hash(&CODE, true)).is_some());
        assert!(maps.contract_map(&contract_coverage_map_hash(&CODE, false)).is_none());
    }

    #[test]
    fn reverted_inner_frame_is_tagged_not_dropped() {
        let mut tracer = CoverageTracer::new();
        tracer.capture_tx_start();
        tracer.capture_frame_start(&frame(false));
        tracer.capture_step(&jump(2, 10));

        // Inner frame reverts after taking a fresh edge.
        tracer.capture_frame_start(&frame(false));
        tracer.capture_step(&jump(20, 30));
        tracer.capture_frame_end(true);

        tracer.capture_frame_end(false);

        let maps = finish(&mut tracer);
        let map = maps.contract_map(&contract_coverage_map_hash(&CODE, false)).unwrap();
        assert_eq!(map.hit_count(edge_marker(2, 10)), 1);
        assert_eq!(map.hit_count(edge_marker(20, 30)), 0);
        assert_eq!(map.reverted_hit_count(edge_marker(20, 30)), 1);
    }

    #[test]
    fn fresh_master_merge_contains_exactly_the_observed_edges() {
        let mut tracer = CoverageTracer::new();
        tracer.capture_tx_start();
        tracer.capture_frame_start(&frame(false));
        tracer.capture_step(&jumpi(4, 16, 1));
        tracer.capture_frame_end(false);

        let maps = finish(&mut tracer);
        let mut master = CoverageMaps::new();
        assert!(master.update(&maps));
        assert_eq!(master.len(), 1);
        let map = master.contract_map(&contract_coverage_map_hash(&CODE, false)).unwrap();
        assert_eq!(map.covered_edge_count(true), 1);
        assert_eq!(map.hit_count(edge_marker(4, 16)), 1);
    }

    #[test]
    #[should_panic(expected = "unbalanced call frame exit")]
    fn unbalanced_frame_exit_panics() {
        let mut tracer = CoverageTracer::new();
        tracer.capture_tx_start();
        tracer.capture_frame_end(false);
    }

    #[test]
    fn tx_start_resets_prior_state() {
        let mut tracer = CoverageTracer::new();
        tracer.capture_tx_start();
        tracer.capture_frame_start(&frame(false));
        tracer.capture_step(&jump(2, 10));
        tracer.capture_frame_end(false);

        tracer.capture_tx_start();
        tracer.capture_frame_start(&frame(false));
        tracer.capture_frame_end(false);
        let maps = finish(&mut tracer);
        assert!(maps.is_empty());
    }
}
