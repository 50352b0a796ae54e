//! The fuzzing campaign driver.

use crate::{
    contracts::ContractDefinitions,
    corpus::Corpus,
    events::{FuzzerEvents, FuzzerStartedEvent, FuzzerStoppedEvent},
    metrics::FuzzerMetrics,
    value::{RandomValueGenerator, ValueGenerator, ValueSet},
    worker::{CallSequenceTestFn, FuzzerWorker},
};
use eyre::Result;
use hydra_chain::TestChain;
use hydra_config::FuzzingConfig;
use parking_lot::Mutex;
use std::{
    sync::{
        atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering},
        Arc,
    },
    thread,
    time::{Duration, Instant},
};

/// A process-wide cooperative cancellation flag.
///
/// Workers poll it before starting a sequence, after each executed element
/// and between shrink iterations; once set, they finish their per-element
/// bookkeeping, revert their chain and exit cleanly.
#[derive(Clone, Debug, Default)]
pub struct CancellationToken {
    cancelled: Arc<AtomicBool>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

/// Constructs the value generator of a freshly spawned worker from its seed
/// and cloned value set. Replaceable so embedders can bias generation.
pub type NewValueGeneratorFn =
    Arc<dyn Fn(u64, Arc<Mutex<ValueSet>>) -> Box<dyn ValueGenerator> + Send + Sync>;

/// Runs on every freshly spawned worker before it starts testing, e.g. to
/// subscribe to its events.
pub type WorkerConfiguratorFn =
    Arc<dyn for<'a> Fn(&mut FuzzerWorker<'a>) -> Result<()> + Send + Sync>;

/// Replaceable construction hooks.
pub struct FuzzerHooks {
    pub new_value_generator: NewValueGeneratorFn,
}

impl Default for FuzzerHooks {
    fn default() -> Self {
        Self {
            new_value_generator: Arc::new(|seed, value_set| {
                Box::new(RandomValueGenerator::new(seed, value_set))
            }),
        }
    }
}

/// Aggregate results of a finished campaign.
#[derive(Clone, Debug)]
pub struct FuzzingResults {
    /// How many property failures were found and shrunk.
    pub failure_count: u64,
    pub sequences_tested: u64,
    pub calls_tested: u64,
    pub gas_used: u64,
    /// Corpus entries retained at the end of the campaign.
    pub corpus_entry_count: usize,
    pub elapsed: Duration,
}

impl FuzzingResults {
    /// Whether any property was violated; drives the process exit code.
    pub fn failed(&self) -> bool {
        self.failure_count > 0
    }
}

/// The fuzzing campaign: spawns and respawns workers, owns the shared
/// corpus and compiled contract set, arbitrates shutdown, and aggregates
/// metrics.
pub struct Fuzzer {
    config: FuzzingConfig,
    contract_definitions: ContractDefinitions,
    corpus: Arc<Corpus>,
    base_value_set: ValueSet,
    call_sequence_test_functions: Vec<CallSequenceTestFn>,
    worker_configurators: Vec<WorkerConfiguratorFn>,
    hooks: FuzzerHooks,
    /// Observer registries for campaign lifecycle events.
    pub events: FuzzerEvents,
    metrics: Arc<FuzzerMetrics>,
    cancellation: CancellationToken,
    /// Seed all worker seeds derive from; logged so campaigns can be
    /// replayed.
    master_seed: u64,
    total_sequences_tested: AtomicU64,
    failure_count: AtomicU64,
}

impl Fuzzer {
    pub fn new(config: FuzzingConfig, contract_definitions: ContractDefinitions) -> Result<Self> {
        config.validate()?;
        let master_seed = config.seed.unwrap_or_else(rand::random);
        let corpus = Arc::new(Corpus::new(config.corpus_directory.clone()));
        let metrics = Arc::new(FuzzerMetrics::new(config.workers));
        Ok(Self {
            config,
            contract_definitions,
            corpus,
            base_value_set: ValueSet::default(),
            call_sequence_test_functions: Vec::new(),
            worker_configurators: Vec::new(),
            hooks: FuzzerHooks::default(),
            events: FuzzerEvents::default(),
            metrics,
            cancellation: CancellationToken::new(),
            master_seed,
            total_sequences_tested: AtomicU64::new(0),
            failure_count: AtomicU64::new(0),
        })
    }

    pub fn config(&self) -> &FuzzingConfig {
        &self.config
    }

    pub fn contract_definitions(&self) -> &ContractDefinitions {
        &self.contract_definitions
    }

    pub fn corpus(&self) -> &Corpus {
        &self.corpus
    }

    pub fn metrics(&self) -> &FuzzerMetrics {
        &self.metrics
    }

    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancellation
    }

    pub fn master_seed(&self) -> u64 {
        self.master_seed
    }

    /// Property failures found so far.
    pub fn failure_count(&self) -> u64 {
        self.failure_count.load(Ordering::Relaxed)
    }

    pub(crate) fn hooks(&self) -> &FuzzerHooks {
        &self.hooks
    }

    pub fn hooks_mut(&mut self) -> &mut FuzzerHooks {
        &mut self.hooks
    }

    /// The value set worker sets start as clones of. Seed it before
    /// starting the campaign.
    pub fn base_value_set(&self) -> &ValueSet {
        &self.base_value_set
    }

    pub fn base_value_set_mut(&mut self) -> &mut ValueSet {
        &mut self.base_value_set
    }

    /// Registers a property/assertion test invoked with every executed
    /// sequence prefix.
    pub fn add_call_sequence_test(&mut self, test_function: CallSequenceTestFn) {
        self.call_sequence_test_functions.push(test_function);
    }

    pub(crate) fn call_sequence_test_functions(&self) -> &[CallSequenceTestFn] {
        &self.call_sequence_test_functions
    }

    /// Registers a hook run on every freshly spawned worker.
    pub fn add_worker_configurator(&mut self, configurator: WorkerConfiguratorFn) {
        self.worker_configurators.push(configurator);
    }

    pub(crate) fn worker_configurators(&self) -> &[WorkerConfiguratorFn] {
        &self.worker_configurators
    }

    /// Accounts one tested sequence toward the campaign test limit.
    pub(crate) fn note_sequence_tested(&self) {
        let total = self.total_sequences_tested.fetch_add(1, Ordering::SeqCst) + 1;
        if self.config.test_limit > 0
            && total >= self.config.test_limit
            && !self.cancellation.is_cancelled()
        {
            info!(target: "hydra::fuzzer", total, "test limit reached, stopping");
            self.cancellation.cancel();
        }
    }

    /// Accounts one shrunk property failure.
    pub(crate) fn note_test_failure(&self) {
        self.failure_count.fetch_add(1, Ordering::SeqCst);
        if self.config.stop_on_failed_test {
            self.cancellation.cancel();
        }
    }

    /// Runs the campaign against `base_chain` until a limit fires, an
    /// unrecoverable error surfaces, or the cancellation token is set
    /// externally.
    ///
    /// Setup (contract deployments) must already be mined on `base_chain`;
    /// workers clone it and replay that setup through their own tracers.
    pub fn start(&self, base_chain: Box<dyn TestChain>) -> Result<FuzzingResults> {
        let started_at = Instant::now();
        let loaded = self.corpus.load_from_directory()?;
        info!(
            target: "hydra::fuzzer",
            workers = self.config.workers,
            seed = self.master_seed,
            corpus_loaded = loaded,
            "starting fuzzing campaign"
        );
        self.events.started.publish(&FuzzerStartedEvent { workers: self.config.workers })?;

        let base_chain = Mutex::new(base_chain);
        let first_worker_error: Mutex<Option<eyre::Report>> = Mutex::new(None);
        let active_workers = AtomicUsize::new(self.config.workers);

        thread::scope(|scope| {
            for worker_index in 0..self.config.workers {
                let base_chain = &base_chain;
                let first_worker_error = &first_worker_error;
                let active_workers = &active_workers;
                scope.spawn(move || {
                    self.worker_loop(worker_index, base_chain, first_worker_error);
                    active_workers.fetch_sub(1, Ordering::SeqCst);
                });
            }

            if self.config.timeout > 0 {
                let deadline = started_at + Duration::from_secs(self.config.timeout);
                let active_workers = &active_workers;
                scope.spawn(move || {
                    while active_workers.load(Ordering::SeqCst) > 0
                        && !self.cancellation.is_cancelled()
                    {
                        if Instant::now() >= deadline {
                            info!(target: "hydra::fuzzer", "timeout reached, stopping");
                            self.cancellation.cancel();
                            break;
                        }
                        thread::sleep(Duration::from_millis(25));
                    }
                });
            }
        });

        let snapshot = self.metrics.snapshot();
        let results = FuzzingResults {
            failure_count: self.failure_count(),
            sequences_tested: snapshot.sequences_tested,
            calls_tested: snapshot.calls_tested,
            gas_used: snapshot.gas_used,
            corpus_entry_count: self.corpus.active_mutable_sequence_count(),
            elapsed: started_at.elapsed(),
        };
        self.events.stopped.publish(&FuzzerStoppedEvent {
            failure_count: results.failure_count,
        })?;

        if let Some(error) = first_worker_error.into_inner() {
            return Err(error);
        }
        info!(
            target: "hydra::fuzzer",
            sequences = results.sequences_tested,
            calls = results.calls_tested,
            failures = results.failure_count,
            corpus = results.corpus_entry_count,
            "fuzzing campaign finished"
        );
        Ok(results)
    }

    /// Keeps one worker index busy: spawns a worker, lets it run to its
    /// reset limit, respawns it, until cancellation. Chain setup failures
    /// are retried a few times before giving up on the campaign.
    fn worker_loop(
        &self,
        worker_index: usize,
        base_chain: &Mutex<Box<dyn TestChain>>,
        first_worker_error: &Mutex<Option<eyre::Report>>,
    ) {
        let mut epoch: u64 = 0;
        let mut spawn_failures: u32 = 0;
        while !self.cancellation.is_cancelled() {
            // Disjoint per-(worker, epoch) seeds keep campaigns replayable
            // from the master seed alone.
            let seed = self
                .master_seed
                .wrapping_add(worker_index as u64)
                .wrapping_add(epoch.wrapping_mul(self.config.workers as u64));
            epoch += 1;

            match FuzzerWorker::spawn(self, worker_index, seed, base_chain) {
                Ok(mut worker) => {
                    spawn_failures = 0;
                    match worker.run() {
                        // Cancelled mid-run; exit cleanly.
                        Ok(true) => break,
                        // Reset limit reached; respawn with a fresh chain.
                        Ok(false) => continue,
                        Err(error) => {
                            error!(
                                target: "hydra::fuzzer",
                                worker_index,
                                %error,
                                "worker failed, stopping the campaign"
                            );
                            self.record_error(error, first_worker_error);
                            break;
                        }
                    }
                }
                Err(error) => {
                    spawn_failures += 1;
                    if spawn_failures >= 3 {
                        error!(
                            target: "hydra::fuzzer",
                            worker_index,
                            %error,
                            "worker failed to start repeatedly, stopping the campaign"
                        );
                        self.record_error(error, first_worker_error);
                        break;
                    }
                    warn!(
                        target: "hydra::fuzzer",
                        worker_index,
                        %error,
                        "worker failed to start, respawning"
                    );
                }
            }
        }
    }

    fn record_error(
        &self,
        error: eyre::Report,
        first_worker_error: &Mutex<Option<eyre::Report>>,
    ) {
        let mut slot = first_worker_error.lock();
        if slot.is_none() {
            *slot = Some(error);
        }
        self.cancellation.cancel();
    }
}
