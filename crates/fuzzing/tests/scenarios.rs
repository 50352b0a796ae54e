//! End-to-end engine scenarios against the scripted mock chain.

use alloy_dyn_abi::{DynSolType, DynSolValue};
use alloy_json_abi::{Function, JsonAbi};
use alloy_primitives::{Address, Bytes, U256};
use hydra_chain::{
    mock::{jump_step, jumpi_step, MockChain, MockDeployment, MockExecution, TraceEvent},
    CallMessage, FrameStart, TestChain,
};
use hydra_config::FuzzingConfig;
use hydra_coverage::{contract_coverage_map_hash, edge_marker};
use hydra_fuzzing::{
    calls::CallSequence,
    contracts::{ContractDefinition, ContractDefinitions, ContractKind},
    value::ValueGenerator,
    Fuzzer, FuzzerWorker, ShrinkCallSequenceRequest,
};
use parking_lot::Mutex;
use std::{collections::VecDeque, sync::Arc};

const TARGET: Address = Address::repeat_byte(0xaa);
const INIT_CODE: &[u8] = &[0x60, 0x80, 0x60, 0x40, 0x52];
const RUNTIME_CODE: &[u8] = &[0x60, 0x01, 0x56, 0x5b, 0x00];

/// A value generator that replays a fixed script of integers, so tests can
/// pin exactly which arguments the engine synthesizes. Everything else it
/// produces is zero, including block delays.
struct ScriptedValueGenerator {
    values: VecDeque<U256>,
}

impl ScriptedValueGenerator {
    fn new(values: impl IntoIterator<Item = u64>) -> Self {
        Self { values: values.into_iter().map(U256::from).collect() }
    }

    fn next_value(&mut self) -> U256 {
        self.values.pop_front().unwrap_or_default()
    }
}

impl ValueGenerator for ScriptedValueGenerator {
    fn generate_abi_value(&mut self, ty: &DynSolType) -> DynSolValue {
        match ty {
            DynSolType::Uint(bits) => DynSolValue::Uint(self.next_value(), *bits),
            other => panic!("scripted generator cannot produce {other}"),
        }
    }

    fn generate_integer(&mut self, _signed: bool, _bits: usize) -> U256 {
        U256::ZERO
    }

    fn generate_address(&mut self) -> Address {
        Address::ZERO
    }
}

fn definition(signature: &str) -> ContractDefinition {
    let function = Function::parse(signature).unwrap();
    let mut abi = JsonAbi::new();
    abi.functions.insert(function.name.clone(), vec![function]);
    ContractDefinition {
        name: "Target".into(),
        abi,
        init_bytecode: Bytes::from_static(INIT_CODE),
        runtime_bytecode: Bytes::from_static(RUNTIME_CODE),
        kind: ContractKind::Contract,
    }
}

fn frame_start() -> TraceEvent {
    TraceEvent::FrameStart(FrameStart {
        address: TARGET,
        code: Bytes::from_static(RUNTIME_CODE),
        create: false,
    })
}

fn calldata_argument(message: &CallMessage) -> U256 {
    message
        .data
        .get(4..36)
        .map(U256::from_be_slice)
        .unwrap_or_default()
}

/// A contract with one method `f(uint256 x)` that takes a distinct branch
/// for `x == 42` and fails there, like an `assert(x != 42)` would.
fn branching_chain() -> MockChain {
    let mut chain = MockChain::new();
    chain.deploy(MockDeployment {
        address: TARGET,
        init_bytecode: Bytes::from_static(INIT_CODE),
        runtime_bytecode: Bytes::from_static(RUNTIME_CODE),
        program: Arc::new(|message, _| {
            let x = calldata_argument(message);
            let is_forty_two = x == U256::from(42);
            let trace = vec![
                frame_start(),
                jumpi_step(10, 40, is_forty_two),
                TraceEvent::FrameEnd { reverted: is_forty_two },
            ];
            if is_forty_two {
                MockExecution::failure(trace)
            } else {
                MockExecution::success(trace)
            }
        }),
    });
    chain
}

/// A shrink request whose verifier checks that the candidate still contains
/// a failed call, mirroring assertion-test semantics.
fn assertion_shrink_request(
    shrunk_into: Arc<Mutex<Option<CallSequence>>>,
) -> ShrinkCallSequenceRequest {
    ShrinkCallSequenceRequest {
        verifier: Arc::new(|_, candidate| Ok(candidate.iter().any(|element| element.failed()))),
        finished_callback: Some(Arc::new(move |_, sequence| {
            *shrunk_into.lock() = Some(sequence.to_vec());
            Ok(())
        })),
        record_result_in_corpus: true,
    }
}

/// Installs an assertion test: any failed call in the prefix requests a
/// shrink.
fn add_assertion_test(fuzzer: &mut Fuzzer, shrunk_into: Arc<Mutex<Option<CallSequence>>>) {
    fuzzer.add_call_sequence_test(Arc::new(move |_, sequence| {
        if sequence.last().is_some_and(|element| element.failed()) {
            Ok(vec![assertion_shrink_request(shrunk_into.clone())])
        } else {
            Ok(vec![])
        }
    }));
}

fn scripted_fuzzer(config: FuzzingConfig, script: &'static [u64]) -> Fuzzer {
    let mut fuzzer =
        Fuzzer::new(config, ContractDefinitions::new([definition("f(uint256 x)")])).unwrap();
    fuzzer.hooks_mut().new_value_generator =
        Arc::new(|_, _| Box::new(ScriptedValueGenerator::new(script.iter().copied())));
    fuzzer
}

#[test]
fn coverage_discovery_adds_corpus_entries_per_new_branch() {
    let config = FuzzingConfig {
        workers: 1,
        call_sequence_length: 2,
        seed: Some(0x5eed),
        ..Default::default()
    };
    let fuzzer = scripted_fuzzer(config, &[41, 42]);

    let base_chain: Mutex<Box<dyn TestChain>> = Mutex::new(Box::new(branching_chain()));
    let mut worker = FuzzerWorker::spawn(&fuzzer, 0, 1, &base_chain).unwrap();
    let base_block = worker.testing_base_block_number();

    let (sequence, _) = worker.test_next_call_sequence().unwrap();
    assert_eq!(sequence.len(), 2);

    // f(41) took the fall-through branch, f(42) the taken branch: each
    // prefix contributed an unseen edge.
    assert_eq!(fuzzer.corpus().active_mutable_sequence_count(), 2);

    // The chain is back at the testing base block on every exit path.
    assert_eq!(worker.chain().head_block_number(), base_block);

    let master = fuzzer.corpus().master_coverage();
    let map = master
        .contract_map(&contract_coverage_map_hash(RUNTIME_CODE, false))
        .expect("runtime code has coverage");
    assert_eq!(map.hit_count(edge_marker(10, 11)), 1);
    assert_eq!(map.reverted_hit_count(edge_marker(10, 40)), 1);
}

#[test]
fn assertion_failure_is_shrunk_to_the_single_failing_call() {
    let config = FuzzingConfig {
        workers: 1,
        call_sequence_length: 2,
        seed: Some(0x5eed),
        shrink_limit: 200,
        stop_on_failed_test: true,
        ..Default::default()
    };
    let mut fuzzer = scripted_fuzzer(config, &[41, 42]);
    let shrunk = Arc::new(Mutex::new(None));
    add_assertion_test(&mut fuzzer, shrunk.clone());

    let results = fuzzer.start(Box::new(branching_chain())).unwrap();
    assert!(results.failed());
    assert_eq!(results.failure_count, 1);

    let shrunk = shrunk.lock().clone().expect("finished callback ran");
    assert_eq!(shrunk.len(), 1, "minimal reproduction is a single call");
    let abi_data = shrunk[0].call.abi_data.as_ref().unwrap();
    assert_eq!(abi_data.method.name, "f");
    assert_eq!(abi_data.input_values[0], DynSolValue::Uint(U256::from(42), 256));
}

#[test]
fn shrinking_minimizes_arguments_not_just_length() {
    // `g(x)` fails for any x >= 1, so the smallest failing argument is 1.
    let mut chain = MockChain::new();
    chain.deploy(MockDeployment {
        address: TARGET,
        init_bytecode: Bytes::from_static(INIT_CODE),
        runtime_bytecode: Bytes::from_static(RUNTIME_CODE),
        program: Arc::new(|message, _| {
            let x = calldata_argument(message);
            let failing = x >= U256::from(1);
            let trace = vec![
                frame_start(),
                jumpi_step(10, 40, failing),
                TraceEvent::FrameEnd { reverted: failing },
            ];
            if failing {
                MockExecution::failure(trace)
            } else {
                MockExecution::success(trace)
            }
        }),
    });

    let config = FuzzingConfig {
        workers: 1,
        call_sequence_length: 1,
        seed: Some(7),
        shrink_limit: 400,
        stop_on_failed_test: true,
        ..Default::default()
    };
    let mut fuzzer = Fuzzer::new(
        config,
        ContractDefinitions::new([definition("g(uint256 x)")]),
    )
    .unwrap();
    fuzzer.hooks_mut().new_value_generator =
        Arc::new(|_, _| Box::new(ScriptedValueGenerator::new([1_000_000])));
    let shrunk = Arc::new(Mutex::new(None));
    add_assertion_test(&mut fuzzer, shrunk.clone());

    let results = fuzzer.start(Box::new(chain)).unwrap();
    assert!(results.failed());

    let shrunk = shrunk.lock().clone().expect("finished callback ran");
    assert_eq!(shrunk.len(), 1);
    let abi_data = shrunk[0].call.abi_data.as_ref().unwrap();
    assert_eq!(
        abi_data.input_values[0],
        DynSolValue::Uint(U256::from(1), 256),
        "argument should shrink to the smallest still-failing value"
    );
}

#[test]
fn reverted_frames_land_in_the_revert_coverage_channel() {
    // `h()` touches a fresh edge and then reverts unconditionally.
    let mut chain = MockChain::new();
    chain.deploy(MockDeployment {
        address: TARGET,
        init_bytecode: Bytes::from_static(INIT_CODE),
        runtime_bytecode: Bytes::from_static(RUNTIME_CODE),
        program: Arc::new(|_, _| {
            MockExecution::failure(vec![
                frame_start(),
                jump_step(7, 30),
                TraceEvent::FrameEnd { reverted: true },
            ])
        }),
    });

    let config = FuzzingConfig {
        workers: 1,
        call_sequence_length: 1,
        seed: Some(3),
        ..Default::default()
    };
    let mut fuzzer =
        Fuzzer::new(config, ContractDefinitions::new([definition("h()")])).unwrap();
    fuzzer.hooks_mut().new_value_generator =
        Arc::new(|_, _| Box::new(ScriptedValueGenerator::new([])));

    let base_chain: Mutex<Box<dyn TestChain>> = Mutex::new(Box::new(chain));
    let mut worker = FuzzerWorker::spawn(&fuzzer, 0, 1, &base_chain).unwrap();
    worker.test_next_call_sequence().unwrap();

    let master = fuzzer.corpus().master_coverage();
    let map = master
        .contract_map(&contract_coverage_map_hash(RUNTIME_CODE, false))
        .expect("reverted execution still records coverage");
    assert_eq!(map.hit_count(edge_marker(7, 30)), 0);
    assert_eq!(map.reverted_hit_count(edge_marker(7, 30)), 1);
    assert_eq!(map.covered_edge_count(false), 0);
    assert_eq!(map.covered_edge_count(true), 1);

    // Revert-context coverage still earns the sequence a corpus slot.
    assert_eq!(fuzzer.corpus().active_mutable_sequence_count(), 1);
}

#[test]
fn workers_respawn_at_the_reset_limit_and_the_corpus_survives() {
    // A benign contract whose branch depends on argument parity.
    let mut chain = MockChain::new();
    chain.deploy(MockDeployment {
        address: TARGET,
        init_bytecode: Bytes::from_static(INIT_CODE),
        runtime_bytecode: Bytes::from_static(RUNTIME_CODE),
        program: Arc::new(|message, _| {
            let branch = calldata_argument(message).bit(0);
            MockExecution::success(vec![
                frame_start(),
                jumpi_step(10, 40, branch),
                TraceEvent::FrameEnd { reverted: false },
            ])
        }),
    });

    let config = FuzzingConfig {
        workers: 1,
        worker_reset_limit: 3,
        test_limit: 7,
        call_sequence_length: 4,
        seed: Some(0xfeed),
        ..Default::default()
    };
    let fuzzer = Fuzzer::new(
        config,
        ContractDefinitions::new([definition("p(uint256 x)")]),
    )
    .unwrap();

    let results = fuzzer.start(Box::new(chain)).unwrap();

    // 3 sequences per epoch: two full epochs plus one sequence into the
    // third before the test limit fires.
    assert_eq!(results.sequences_tested, 7);
    assert_eq!(fuzzer.metrics().snapshot().worker_startup_count, 3);
    assert!(!results.failed());
    assert!(
        results.corpus_entry_count >= 1,
        "corpus entries must survive worker resets"
    );
}

#[test]
fn campaigns_with_identical_seeds_are_reproducible() {
    let run = || {
        let config = FuzzingConfig {
            workers: 1,
            worker_reset_limit: 2,
            test_limit: 4,
            call_sequence_length: 3,
            seed: Some(0xabcdef),
            ..Default::default()
        };
        let fuzzer = Fuzzer::new(
            config,
            ContractDefinitions::new([definition("p(uint256 x)")]),
        )
        .unwrap();

        let calldata = Arc::new(Mutex::new(Vec::<Bytes>::new()));
        let recorded = calldata.clone();
        let mut chain = MockChain::new();
        chain.deploy(MockDeployment {
            address: TARGET,
            init_bytecode: Bytes::from_static(INIT_CODE),
            runtime_bytecode: Bytes::from_static(RUNTIME_CODE),
            program: Arc::new(move |message, _| {
                recorded.lock().push(message.data.clone());
                MockExecution::success(vec![])
            }),
        });

        fuzzer.start(Box::new(chain)).unwrap();
        let recorded = calldata.lock().clone();
        recorded
    };

    assert_eq!(run(), run());
}
