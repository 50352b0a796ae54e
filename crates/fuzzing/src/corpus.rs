//! The shared corpus of coverage-increasing call sequences.

use crate::{
    calls::{Call, CallSequence, CallSequenceElement},
    random::WeightedRandomChooser,
};
use alloy_primitives::{keccak256, Address, Bytes, U256};
use eyre::{Context, Result};
use hydra_coverage::CoverageMaps;
use parking_lot::{Mutex, RwLock};
use rand::rngs::StdRng;
use serde::{Deserialize, Serialize};
use std::{
    collections::VecDeque,
    fs,
    path::{Path, PathBuf},
    sync::Arc,
};

/// Errors returned by corpus sampling.
#[derive(Debug, thiserror::Error)]
pub enum CorpusError {
    /// The corpus holds no sequences eligible as mutation sources.
    #[error("the corpus contains no mutable call sequences")]
    Empty,
}

/// A retained call sequence and its sampling weight.
///
/// Entries are immutable once stored; mutation strategies copy elements out
/// of them, never into them.
#[derive(Clone, Debug)]
pub struct CorpusEntry {
    pub sequence: CallSequence,
    pub weight: u64,
}

/// The store of call sequences whose execution increased coverage, shared
/// by all workers.
///
/// The entry list, the master coverage map and the unexecuted queue are
/// guarded by independent locks, so the hot sample path does not contend
/// with coverage merges.
pub struct Corpus {
    /// Weighted-samplable corpus entries.
    mutation_targets: RwLock<WeightedRandomChooser<Arc<CorpusEntry>>>,
    /// The master coverage observed across the whole campaign. Single
    /// writer; merges are serialized.
    coverage_maps: Mutex<CoverageMaps>,
    /// Sequences loaded from disk that have not been executed yet. Drained
    /// before any generation happens.
    unexecuted: Mutex<VecDeque<CallSequence>>,
    /// Where entries are persisted, if anywhere.
    directory: Option<PathBuf>,
}

impl Corpus {
    pub fn new(directory: Option<PathBuf>) -> Self {
        Self {
            mutation_targets: RwLock::new(WeightedRandomChooser::new()),
            coverage_maps: Mutex::new(CoverageMaps::new()),
            unexecuted: Mutex::new(VecDeque::new()),
            directory,
        }
    }

    /// The number of corpus entries eligible as mutation sources.
    pub fn active_mutable_sequence_count(&self) -> usize {
        self.mutation_targets.read().choice_count()
    }

    /// Weighted-random sample over all corpus entries.
    pub fn random_mutation_target_sequence(
        &self,
        rng: &mut StdRng,
    ) -> Result<Arc<CorpusEntry>, CorpusError> {
        self.mutation_targets.read().choose(rng).cloned().ok_or(CorpusError::Empty)
    }

    /// Pops one sequence loaded from disk but not yet executed, or `None`
    /// once the queue is drained.
    pub fn unexecuted_call_sequence(&self) -> Option<CallSequence> {
        self.unexecuted.lock().pop_front()
    }

    /// Queues a sequence to be executed verbatim before any generation,
    /// the same way persisted sequences are on startup.
    pub fn add_unexecuted_call_sequence(&self, sequence: CallSequence) {
        self.unexecuted.lock().push_back(sequence);
    }

    /// Merges the coverage recorded by `sequence`'s last executed element
    /// into the master map; if a new edge was observed, retains a copy of
    /// the sequence with the given sampling weight.
    ///
    /// Returns whether the sequence was added.
    pub fn check_sequence_coverage_and_update(
        &self,
        sequence: &[CallSequenceElement],
        weight: u64,
        persist: bool,
    ) -> Result<bool> {
        let Some(coverage) = sequence.last().and_then(|element| element.coverage.as_deref())
        else {
            return Ok(false);
        };

        let new_edge = self.coverage_maps.lock().update(coverage);
        if !new_edge {
            return Ok(false);
        }

        debug!(
            target: "hydra::corpus",
            length = sequence.len(),
            weight,
            "new coverage, retaining call sequence"
        );
        self.insert_entry(CorpusEntry { sequence: sequence.to_vec(), weight }, persist)?;
        Ok(true)
    }

    /// Unconditionally inserts a (shrunken) failing sequence.
    pub fn add_test_result_call_sequence(
        &self,
        sequence: CallSequence,
        weight: u64,
        persist: bool,
    ) -> Result<()> {
        self.insert_entry(CorpusEntry { sequence, weight }, persist)
    }

    /// A snapshot of the master coverage map.
    pub fn master_coverage(&self) -> CoverageMaps {
        self.coverage_maps.lock().clone()
    }

    /// Loads persisted sequences into the unexecuted queue. Returns how
    /// many were loaded.
    pub fn load_from_directory(&self) -> Result<usize> {
        let Some(directory) = &self.directory else { return Ok(0) };
        if !directory.exists() {
            return Ok(0);
        }

        let mut paths: Vec<PathBuf> = fs::read_dir(directory)
            .wrap_err_with(|| format!("could not read corpus directory {}", directory.display()))?
            .filter_map(|entry| Some(entry.ok()?.path()))
            .filter(|path| path.extension().is_some_and(|extension| extension == "json"))
            .collect();
        // Deterministic load order regardless of directory enumeration.
        paths.sort();

        let mut loaded = 0;
        for path in paths {
            let sequence = read_sequence(&path)
                .wrap_err_with(|| format!("could not load corpus entry {}", path.display()))?;
            self.unexecuted.lock().push_back(sequence);
            loaded += 1;
        }
        info!(target: "hydra::corpus", loaded, "loaded persisted corpus entries");
        Ok(loaded)
    }

    fn insert_entry(&self, entry: CorpusEntry, persist: bool) -> Result<()> {
        if persist {
            if let Some(directory) = &self.directory {
                write_sequence(directory, &entry.sequence)?;
            }
        }
        let weight = entry.weight;
        self.mutation_targets.write().add_choice(Arc::new(entry), u128::from(weight));
        Ok(())
    }
}

/// The persisted form of one call: enough to re-execute it, not enough to
/// re-mutate it (structured ABI values do not survive the round-trip).
#[derive(Serialize, Deserialize)]
struct CallDescriptor {
    sender: Address,
    target: Address,
    selector: Bytes,
    calldata: Bytes,
    value: U256,
    gas_limit: u64,
    block_number_delay: u64,
    block_timestamp_delay: u64,
}

impl From<&CallSequenceElement> for CallDescriptor {
    fn from(element: &CallSequenceElement) -> Self {
        let call = &element.call;
        Self {
            sender: call.sender,
            target: call.target,
            selector: call.calldata.get(..4).map(|bytes| Bytes::from(bytes.to_vec())).unwrap_or_default(),
            calldata: call.calldata.clone(),
            value: call.value,
            gas_limit: call.gas_limit,
            block_number_delay: call.block_number_delay,
            block_timestamp_delay: call.block_timestamp_delay,
        }
    }
}

impl From<CallDescriptor> for CallSequenceElement {
    fn from(descriptor: CallDescriptor) -> Self {
        Self::new(
            None,
            Call {
                sender: descriptor.sender,
                target: descriptor.target,
                nonce: 0,
                value: descriptor.value,
                gas_limit: descriptor.gas_limit,
                gas_price: 0,
                calldata: descriptor.calldata,
                abi_data: None,
                block_number_delay: descriptor.block_number_delay,
                block_timestamp_delay: descriptor.block_timestamp_delay,
            },
        )
    }
}

fn write_sequence(directory: &Path, sequence: &CallSequence) -> Result<()> {
    let descriptors: Vec<CallDescriptor> = sequence.iter().map(CallDescriptor::from).collect();
    let json = serde_json::to_vec_pretty(&descriptors)?;
    fs::create_dir_all(directory)
        .wrap_err_with(|| format!("could not create corpus directory {}", directory.display()))?;
    let path = directory.join(format!("{}.json", keccak256(&json)));
    fs::write(&path, json)
        .wrap_err_with(|| format!("could not persist corpus entry {}", path.display()))?;
    Ok(())
}

fn read_sequence(path: &Path) -> Result<CallSequence> {
    let json = fs::read(path)?;
    let descriptors: Vec<CallDescriptor> = serde_json::from_slice(&json)?;
    Ok(descriptors.into_iter().map(CallSequenceElement::from).collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy_dyn_abi::DynSolValue;
    use alloy_json_abi::Function;
    use hydra_coverage::{contract_coverage_map_hash, edge_marker};
    use rand::SeedableRng;

    fn element_with_coverage(marker: u64) -> CallSequenceElement {
        let mut maps = CoverageMaps::new();
        maps.set_at(
            Address::ZERO,
            contract_coverage_map_hash(&[0u8], false),
            1,
            marker,
        );
        let mut element = element();
        element.coverage = Some(Arc::new(maps));
        element
    }

    fn element() -> CallSequenceElement {
        let method = Function::parse("f(uint256 x)").unwrap();
        CallSequenceElement::new(
            None,
            Call::from_method(
                Address::ZERO,
                Address::repeat_byte(0xaa),
                method,
                vec![DynSolValue::Uint(U256::from(42), 256)],
                U256::ZERO,
                1_000_000,
            )
            .unwrap(),
        )
    }

    #[test]
    fn sequences_are_added_only_on_new_coverage() {
        let corpus = Corpus::new(None);
        let sequence = vec![element_with_coverage(edge_marker(1, 2))];

        assert!(corpus.check_sequence_coverage_and_update(&sequence, 1, false).unwrap());
        assert_eq!(corpus.active_mutable_sequence_count(), 1);

        // Same coverage again: no admission.
        assert!(!corpus.check_sequence_coverage_and_update(&sequence, 2, false).unwrap());
        assert_eq!(corpus.active_mutable_sequence_count(), 1);

        let fresh = vec![element_with_coverage(edge_marker(3, 4))];
        assert!(corpus.check_sequence_coverage_and_update(&fresh, 3, false).unwrap());
        assert_eq!(corpus.active_mutable_sequence_count(), 2);
    }

    #[test]
    fn sequences_without_coverage_are_ignored() {
        let corpus = Corpus::new(None);
        assert!(!corpus.check_sequence_coverage_and_update(&[element()], 1, false).unwrap());
        assert!(!corpus.check_sequence_coverage_and_update(&[], 1, false).unwrap());
        assert_eq!(corpus.active_mutable_sequence_count(), 0);
    }

    #[test]
    fn sampling_empty_corpus_fails() {
        let corpus = Corpus::new(None);
        let mut rng = StdRng::seed_from_u64(0);
        assert!(matches!(
            corpus.random_mutation_target_sequence(&mut rng),
            Err(CorpusError::Empty)
        ));
    }

    #[test]
    fn sampling_favors_heavier_entries() {
        let corpus = Corpus::new(None);
        corpus
            .check_sequence_coverage_and_update(&[element_with_coverage(edge_marker(1, 2))], 1, false)
            .unwrap();
        corpus
            .check_sequence_coverage_and_update(
                &[element_with_coverage(edge_marker(3, 4)), element_with_coverage(edge_marker(5, 6))],
                99,
                false,
            )
            .unwrap();

        let mut rng = StdRng::seed_from_u64(11);
        let mut heavy = 0;
        for _ in 0..500 {
            let entry = corpus.random_mutation_target_sequence(&mut rng).unwrap();
            if entry.weight == 99 {
                heavy += 1;
            }
        }
        assert!(heavy > 400, "heavy entry sampled only {heavy} of 500");
    }

    #[test]
    fn failing_sequences_are_added_unconditionally() {
        let corpus = Corpus::new(None);
        corpus.add_test_result_call_sequence(vec![element()], 5, false).unwrap();
        assert_eq!(corpus.active_mutable_sequence_count(), 1);
    }

    #[test]
    fn persisted_sequences_load_into_the_unexecuted_queue() {
        let dir = tempfile::tempdir().unwrap();
        let corpus = Corpus::new(Some(dir.path().to_path_buf()));
        let sequence = vec![element_with_coverage(edge_marker(1, 2)), element()];
        corpus.check_sequence_coverage_and_update(&sequence, 1, true).unwrap();

        let reloaded = Corpus::new(Some(dir.path().to_path_buf()));
        assert_eq!(reloaded.load_from_directory().unwrap(), 1);

        let loaded = reloaded.unexecuted_call_sequence().unwrap();
        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded[0].call.calldata, sequence[0].call.calldata);
        assert_eq!(loaded[0].call.target, sequence[0].call.target);
        // Structured values do not survive persistence.
        assert!(loaded[0].call.abi_data.is_none());
        assert!(reloaded.unexecuted_call_sequence().is_none());
    }
}
