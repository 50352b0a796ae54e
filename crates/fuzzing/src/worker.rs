//! The fuzzer worker: one thread driving one chain clone.

use crate::{
    calls::{CallSequence, CallSequenceElement, ChainReference},
    contracts::{ContractDefinition, DeployedContractMethod},
    events::{
        FuzzerWorkerEvents, WorkerCallSequenceTestedEvent, WorkerCallSequenceTestingEvent,
        WorkerChainCreatedEvent, WorkerContractAddedEvent, WorkerContractRemovedEvent,
    },
    fuzzer::Fuzzer,
    generator::{CallSequenceGenerator, GeneratorContext},
    metrics::WorkerMetrics,
    shrink,
    value::{RandomValueMutator, ShrinkingValueMutator, ValueGenerator, ValueMutator, ValueSet},
};
use alloy_dyn_abi::Specifier;
use alloy_primitives::Address;
use eyre::{bail, Context, Result};
use hydra_chain::{ContractDeploymentEvent, TestChain};
use hydra_coverage::{take_coverage_tracer_results, CoverageTracer};
use indexmap::IndexMap;
use parking_lot::Mutex;
use rand::{rngs::StdRng, Rng, SeedableRng};
use std::sync::{atomic::Ordering, Arc};

/// A property or assertion test invoked with every executed sequence
/// prefix. Returning shrink requests marks the prefix as a failure to be
/// minimized.
pub type CallSequenceTestFn = Arc<
    dyn for<'a> Fn(
            &mut FuzzerWorker<'a>,
            &[CallSequenceElement],
        ) -> Result<Vec<ShrinkCallSequenceRequest>>
        + Send
        + Sync,
>;

/// Re-checks whether a candidate sequence still reproduces the failure
/// being shrunk. The candidate has been executed on the worker's chain when
/// this is called.
pub type ShrinkSequenceVerifierFn = Arc<
    dyn for<'a> Fn(&mut FuzzerWorker<'a>, &[CallSequenceElement]) -> Result<bool> + Send + Sync,
>;

/// Invoked with the final shrunken sequence, e.g. to re-run it with full
/// tracing for reporting.
pub type ShrinkSequenceFinishedFn = Arc<
    dyn for<'a> Fn(&mut FuzzerWorker<'a>, &[CallSequenceElement]) -> Result<()> + Send + Sync,
>;

/// A request, emitted by a test function, to minimize a failing sequence.
pub struct ShrinkCallSequenceRequest {
    pub verifier: ShrinkSequenceVerifierFn,
    pub finished_callback: Option<ShrinkSequenceFinishedFn>,
    /// Whether the shrunken sequence is retained in the corpus.
    pub record_result_in_corpus: bool,
}

/// A single fuzzing worker.
///
/// A worker lives for one epoch: it clones the campaign's base chain,
/// tracks deployments on its clone, tests sequences until the reset limit,
/// then returns so the fuzzer can respawn it with a fresh chain, bounding
/// accumulated chain state.
pub struct FuzzerWorker<'a> {
    worker_index: usize,
    fuzzer: &'a Fuzzer,
    pub(crate) chain: Box<dyn TestChain>,
    /// The block height at which all setup deployments exist; the chain is
    /// reverted here between sequences.
    testing_base_block_number: u64,
    /// Deployed contracts matched to compiled definitions, in deployment
    /// order so derived method lists are deterministic.
    deployed_contracts: IndexMap<Address, Arc<ContractDefinition>>,
    pure_methods: Vec<DeployedContractMethod>,
    state_changing_methods: Vec<DeployedContractMethod>,
    pub(crate) rng: StdRng,
    sequence_generator: CallSequenceGenerator,
    value_set: Arc<Mutex<ValueSet>>,
    value_generator: Box<dyn ValueGenerator>,
    value_mutator: Box<dyn ValueMutator>,
    pub(crate) shrinking_value_mutator: Box<dyn ValueMutator>,
    /// Observer registries for this worker's lifecycle events.
    pub events: FuzzerWorkerEvents,
}

impl<'a> FuzzerWorker<'a> {
    /// Creates a worker for one epoch: clones the base chain (attaching the
    /// coverage tracer before setup replays), processes the setup
    /// deployments and records the testing base block.
    pub fn spawn(
        fuzzer: &'a Fuzzer,
        worker_index: usize,
        seed: u64,
        base_chain: &Mutex<Box<dyn TestChain>>,
    ) -> Result<Self> {
        let mut rng = StdRng::seed_from_u64(seed);
        let value_set = Arc::new(Mutex::new(fuzzer.base_value_set().clone()));
        let value_generator =
            (fuzzer.hooks().new_value_generator)(rng.gen(), value_set.clone());
        let value_mutator = Box::new(RandomValueMutator::new(rng.gen()));
        let shrinking_value_mutator = Box::new(ShrinkingValueMutator::new(rng.gen()));

        let coverage_enabled = fuzzer.config().coverage_enabled;
        let chain = {
            let base = base_chain.lock();
            base.clone_chain(&mut |chain| {
                if coverage_enabled {
                    chain.add_tracer(Box::new(CoverageTracer::new()));
                }
                Ok(())
            })
            .wrap_err("could not clone the base chain")?
        };

        let mut worker = Self {
            worker_index,
            fuzzer,
            chain,
            testing_base_block_number: 0,
            deployed_contracts: IndexMap::new(),
            pure_methods: Vec::new(),
            state_changing_methods: Vec::new(),
            rng,
            sequence_generator: CallSequenceGenerator::new(
                &fuzzer.config().sequence_generation,
            ),
            value_set,
            value_generator,
            value_mutator,
            shrinking_value_mutator,
            events: FuzzerWorkerEvents::default(),
        };

        for configurator in fuzzer.worker_configurators() {
            configurator(&mut worker)?;
        }

        // Pick up the setup deployments replayed onto the clone.
        worker.process_deployment_events()?;
        worker.testing_base_block_number = worker.chain.head_block_number();
        worker.metrics().worker_startup_count.fetch_add(1, Ordering::Relaxed);

        debug!(
            target: "hydra::worker",
            worker_index,
            base_block = worker.testing_base_block_number,
            contracts = worker.deployed_contracts.len(),
            "worker chain ready"
        );
        worker.events.chain_created.publish(&WorkerChainCreatedEvent {
            worker_index,
            testing_base_block_number: worker.testing_base_block_number,
        })?;
        Ok(worker)
    }

    pub fn worker_index(&self) -> usize {
        self.worker_index
    }

    pub fn fuzzer(&self) -> &'a Fuzzer {
        self.fuzzer
    }

    pub fn chain(&self) -> &dyn TestChain {
        &*self.chain
    }

    pub fn testing_base_block_number(&self) -> u64 {
        self.testing_base_block_number
    }

    /// Deployed contracts currently tracked by this worker.
    pub fn deployed_contracts(&self) -> &IndexMap<Address, Arc<ContractDefinition>> {
        &self.deployed_contracts
    }

    /// The value set feeding this worker's value generator.
    pub fn value_set(&self) -> &Arc<Mutex<ValueSet>> {
        &self.value_set
    }

    pub(crate) fn metrics(&self) -> &WorkerMetrics {
        self.fuzzer.metrics().worker(self.worker_index)
    }

    /// Tests sequences until the reset limit or cancellation.
    ///
    /// Returns whether the campaign was cancelled (as opposed to the worker
    /// retiring at its reset limit, in which case the fuzzer respawns it).
    pub fn run(&mut self) -> Result<bool> {
        let reset_limit = self.fuzzer.config().worker_reset_limit;
        let mut sequences_tested = 0;
        while sequences_tested < reset_limit {
            if self.fuzzer.cancellation().is_cancelled() {
                return Ok(true);
            }

            self.events
                .call_sequence_testing
                .publish(&WorkerCallSequenceTestingEvent { worker_index: self.worker_index })?;

            let (sequence, shrink_requests) = self.test_next_call_sequence()?;
            for request in shrink_requests {
                shrink::shrink_call_sequence(self, sequence.clone(), request)?;
            }

            self.events
                .call_sequence_tested
                .publish(&WorkerCallSequenceTestedEvent { worker_index: self.worker_index })?;

            self.metrics().sequences_tested.fetch_add(1, Ordering::Relaxed);
            sequences_tested += 1;
            self.fuzzer.note_sequence_tested();
        }
        debug!(
            target: "hydra::worker",
            worker_index = self.worker_index,
            "worker reached its reset limit, retiring"
        );
        Ok(false)
    }

    /// Generates and executes one call sequence, submitting every executed
    /// prefix to the corpus and the registered test functions.
    ///
    /// Execution stops early once any test function requests shrinking. On
    /// every exit path the chain is reverted to the testing base block.
    pub fn test_next_call_sequence(
        &mut self,
    ) -> Result<(CallSequence, Vec<ShrinkCallSequenceRequest>)> {
        let mut executed = CallSequence::new();
        let mut shrink_requests = Vec::new();
        let result = self.test_call_sequence_inner(&mut executed, &mut shrink_requests);
        let reverted = self.revert_to_base();
        result?;
        reverted?;
        Ok((executed, shrink_requests))
    }

    fn test_call_sequence_inner(
        &mut self,
        executed: &mut CallSequence,
        shrink_requests: &mut Vec<ShrinkCallSequenceRequest>,
    ) -> Result<()> {
        {
            let (generator, mut ctx) = self.generator_parts();
            generator.initialize_next_sequence(&mut ctx)?;
        }

        let fuzzer = self.fuzzer;
        loop {
            let element = {
                let (generator, mut ctx) = self.generator_parts();
                generator.pop_sequence_element(&mut ctx)?
            };
            let Some(mut element) = element else { break };

            self.execute_element(&mut element)?;
            executed.push(element);

            let weight = 1 + self.metrics().sequences_tested.load(Ordering::Relaxed);
            fuzzer
                .corpus()
                .check_sequence_coverage_and_update(executed.as_slice(), weight, true)?;

            for test_function in fuzzer.call_sequence_test_functions() {
                shrink_requests.extend(test_function(self, executed.as_slice())?);
            }

            if fuzzer.cancellation().is_cancelled() {
                return Ok(());
            }
            // A shrink request means a test was violated; stop here and go
            // minimize what we have.
            if !shrink_requests.is_empty() {
                break;
            }
        }
        Ok(())
    }

    /// Executes one element on the worker chain, recording its receipt,
    /// chain reference and coverage, and absorbing any deployment events
    /// the call caused.
    pub(crate) fn execute_element(&mut self, element: &mut CallSequenceElement) -> Result<()> {
        let message = element.call.to_message();
        let mut results = self
            .chain
            .execute_call(
                &message,
                element.call.block_number_delay,
                element.call.block_timestamp_delay,
            )
            .wrap_err("call execution failed on the worker chain")?;

        element.chain_reference = Some(ChainReference {
            block_number: self.chain.head_block_number(),
            transaction_index: 0,
        });
        if let Some(maps) = take_coverage_tracer_results(&mut results) {
            element.coverage = Some(Arc::new(maps));
        }

        let metrics = self.metrics();
        metrics.calls_tested.fetch_add(1, Ordering::Relaxed);
        metrics.gas_used.fetch_add(results.receipt.gas_used, Ordering::Relaxed);
        element.receipt = Some(results.receipt);

        self.process_deployment_events()
    }

    pub(crate) fn revert_to_base(&mut self) -> Result<()> {
        self.chain
            .revert_to_block_number(self.testing_base_block_number)
            .wrap_err("could not revert the worker chain to the testing base block")
    }

    /// Applies the shrinking value mutator to every ABI input of `element`
    /// and re-encodes its calldata.
    pub(crate) fn shrink_element_inputs(
        &mut self,
        element: &mut CallSequenceElement,
    ) -> Result<()> {
        let Some(abi_data) = element.call.abi_data.as_mut() else { return Ok(()) };
        for (index, input) in abi_data.method.inputs.iter().enumerate() {
            let ty = input
                .resolve()
                .wrap_err_with(|| format!("could not resolve parameter type `{}`", input.ty))?;
            let value = abi_data.input_values[index].clone();
            abi_data.input_values[index] = self
                .shrinking_value_mutator
                .mutate_abi_value(&mut *self.value_generator, &ty, value);
        }
        element.call.reencode_calldata()
    }

    /// Drains deployment events from the chain and updates the tracked
    /// contract and method lists.
    fn process_deployment_events(&mut self) -> Result<()> {
        for event in self.chain.take_deployment_events() {
            match event {
                ContractDeploymentEvent::Added {
                    address,
                    init_bytecode,
                    runtime_bytecode,
                    dynamic: _,
                } => {
                    // The generator can use the new address and the
                    // constants pushed by the deployed code as inputs.
                    {
                        let mut value_set = self.value_set.lock();
                        value_set.add_address(address);
                        value_set.collect_push_bytes(&runtime_bytecode);
                    }

                    let Some(definition) = self
                        .fuzzer
                        .contract_definitions()
                        .match_bytecode(&init_bytecode, &runtime_bytecode)
                    else {
                        if self.fuzzer.config().stop_on_failed_contract_matching {
                            bail!(
                                "could not match the bytecode deployed at {address} to any \
                                 compiled contract"
                            );
                        }
                        warn!(
                            target: "hydra::worker",
                            %address,
                            "skipping unmatched contract deployment"
                        );
                        continue;
                    };

                    self.deployed_contracts.insert(address, definition.clone());
                    self.update_methods();
                    self.events.contract_added.publish(&WorkerContractAddedEvent {
                        worker_index: self.worker_index,
                        address,
                        definition,
                    })?;
                }
                ContractDeploymentEvent::Removed { address } => {
                    self.value_set.lock().remove_address(address);
                    let Some(definition) = self.deployed_contracts.shift_remove(&address)
                    else {
                        continue;
                    };
                    self.update_methods();
                    self.events.contract_removed.publish(&WorkerContractRemovedEvent {
                        worker_index: self.worker_index,
                        address,
                        definition,
                    })?;
                }
            }
        }
        Ok(())
    }

    /// Rebuilds the pure and state-changing method lists from the tracked
    /// deployments.
    fn update_methods(&mut self) {
        self.pure_methods.clear();
        self.state_changing_methods.clear();
        for (&address, definition) in &self.deployed_contracts {
            for method in definition.abi.functions() {
                let deployed = DeployedContractMethod {
                    contract: definition.clone(),
                    address,
                    method: method.clone(),
                };
                if deployed.is_state_changing() {
                    self.state_changing_methods.push(deployed);
                } else {
                    self.pure_methods.push(deployed);
                }
            }
        }
    }

    /// Splits the worker into its generator and the context the generator
    /// needs, so both can be borrowed at once.
    fn generator_parts(&mut self) -> (&mut CallSequenceGenerator, GeneratorContext<'_>) {
        let Self {
            fuzzer,
            chain,
            pure_methods,
            state_changing_methods,
            rng,
            sequence_generator,
            value_generator,
            value_mutator,
            ..
        } = self;
        (
            sequence_generator,
            GeneratorContext {
                rng,
                chain: &**chain,
                corpus: fuzzer.corpus(),
                config: fuzzer.config(),
                pure_methods,
                state_changing_methods,
                value_generator: &mut **value_generator,
                value_mutator: &mut **value_mutator,
            },
        )
    }
}
