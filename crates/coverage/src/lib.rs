//! # hydra-coverage
//!
//! EVM edge coverage for fuzzing campaigns.
//!
//! Coverage is recorded per control-flow *edge*: a 64-bit marker packing the
//! source and destination program counters of a taken branch. Edges observed
//! in call frames that later reverted are kept in a separate channel rather
//! than discarded, since an early revert may still have explored paths worth
//! preserving in the corpus.

#![cfg_attr(docsrs, feature(doc_cfg, doc_auto_cfg))]

#[macro_use]
extern crate tracing;

use alloy_primitives::{
    map::{rustc_hash::FxHashMap, B256HashMap},
    Address, Keccak256, B256,
};

mod tracer;
pub use tracer::{
    get_coverage_tracer_results, take_coverage_tracer_results, CoverageTracer,
    COVERAGE_TRACER_RESULTS_KEY,
};

/// Destination sentinel marking that the source pc ended its frame with a
/// revert. EVM code size is bounded far below 2³², so sentinel destinations
/// cannot collide with real program counters.
pub const REVERT_MARKER_XOR: u64 = 0xFFFF_FFFF;

/// Destination sentinel marking that the source pc ended its frame with a
/// return.
pub const RETURN_MARKER_XOR: u64 = 0xFFFF_FFFE;

/// Packs the edge `pc -> dst` into a 64-bit marker: the high 32 bits hold
/// the source pc, the low 32 bits the destination pc.
#[inline]
pub const fn edge_marker(pc: u64, dst: u64) -> u64 {
    pc.rotate_left(32) ^ dst
}

/// The source pc of a packed edge marker.
#[inline]
pub const fn marker_source(marker: u64) -> u64 {
    marker >> 32
}

/// The destination pc of a packed edge marker.
#[inline]
pub const fn marker_destination(marker: u64) -> u64 {
    marker & 0xFFFF_FFFF
}

/// The hash identifying one contract code body in coverage maps.
///
/// Init and runtime bytecode of the same contract get distinct identities:
/// the deployment kind is folded into the hash as a discriminator byte.
pub fn contract_coverage_map_hash(code: &[u8], init: bool) -> B256 {
    let mut hasher = Keccak256::new();
    hasher.update(code);
    hasher.update([init as u8]);
    hasher.finalize()
}

/// Edge hit counts for one contract code identity.
///
/// Hits are split into a success channel and a revert channel; counts move
/// wholesale from the former to the latter when the recording frame reverts.
#[derive(Clone, Debug, Default)]
pub struct ContractCoverageMap {
    /// The address the code was first observed executing under.
    address: Address,
    /// Length of the code body, recorded for report consumers.
    code_size: usize,
    /// Hit counts of edges taken in frames that did not revert.
    successful_hits: FxHashMap<u64, u32>,
    /// Hit counts of edges taken in frames that reverted.
    reverted_hits: FxHashMap<u64, u32>,
}

impl ContractCoverageMap {
    fn new(address: Address, code_size: usize) -> Self {
        Self { address, code_size, ..Default::default() }
    }

    /// The address the code was first observed executing under.
    pub fn address(&self) -> Address {
        self.address
    }

    /// The length of the code body this map covers.
    pub fn code_size(&self) -> usize {
        self.code_size
    }

    /// The success-channel hit count for `marker`.
    pub fn hit_count(&self, marker: u64) -> u32 {
        self.successful_hits.get(&marker).copied().unwrap_or_default()
    }

    /// The revert-channel hit count for `marker`.
    pub fn reverted_hit_count(&self, marker: u64) -> u32 {
        self.reverted_hits.get(&marker).copied().unwrap_or_default()
    }

    /// The number of distinct edges covered. Revert-channel edges are
    /// included when `include_reverted` is set.
    pub fn covered_edge_count(&self, include_reverted: bool) -> usize {
        if !include_reverted {
            return self.successful_hits.len();
        }
        let mut edges: Vec<u64> = self.successful_hits.keys().copied().collect();
        edges.extend(self.reverted_hits.keys());
        edges.sort_unstable();
        edges.dedup();
        edges.len()
    }

    /// Iterates over `(marker, success hits, revert hits)` for every edge
    /// present in either channel.
    pub fn iter(&self) -> impl Iterator<Item = (u64, u32, u32)> + '_ {
        let reverted_only = self
            .reverted_hits
            .iter()
            .filter(|(marker, _)| !self.successful_hits.contains_key(*marker))
            .map(|(&marker, &hits)| (marker, 0, hits));
        self.successful_hits
            .iter()
            .map(|(&marker, &hits)| (marker, hits, self.reverted_hit_count(marker)))
            .chain(reverted_only)
    }

    fn record_hit(&mut self, marker: u64) -> bool {
        let count = self.successful_hits.entry(marker).or_default();
        *count = count.saturating_add(1);
        *count == 1 && !self.reverted_hits.contains_key(&marker)
    }

    fn update(&mut self, other: &Self) -> bool {
        let mut new_edge = false;
        for (&marker, &hits) in &other.successful_hits {
            if hits == 0 {
                continue;
            }
            let count = self.successful_hits.entry(marker).or_default();
            new_edge |= *count == 0 && !self.reverted_hits.contains_key(&marker);
            *count = count.saturating_add(hits);
        }
        for (&marker, &hits) in &other.reverted_hits {
            if hits == 0 {
                continue;
            }
            let count = self.reverted_hits.entry(marker).or_default();
            new_edge |= *count == 0 && !self.successful_hits.contains_key(&marker);
            *count = count.saturating_add(hits);
        }
        new_edge
    }

    fn revert_all(&mut self) -> bool {
        let mut moved = false;
        for (marker, hits) in self.successful_hits.drain() {
            if hits == 0 {
                continue;
            }
            moved = true;
            let count = self.reverted_hits.entry(marker).or_default();
            *count = count.saturating_add(hits);
        }
        moved
    }
}

/// Coverage across all contract code identities touched by an execution.
///
/// Keys are [`contract_coverage_map_hash`] values, so init and runtime code
/// of the same contract are tracked independently.
#[derive(Clone, Debug, Default)]
pub struct CoverageMaps {
    maps: B256HashMap<ContractCoverageMap>,
}

impl CoverageMaps {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records one hit of `marker` in the map identified by `lookup_hash`,
    /// creating the map on first contact. Returns whether the edge was new
    /// to this map.
    pub fn set_at(
        &mut self,
        address: Address,
        lookup_hash: B256,
        code_size: usize,
        marker: u64,
    ) -> bool {
        self.maps
            .entry(lookup_hash)
            .or_insert_with(|| ContractCoverageMap::new(address, code_size))
            .record_hit(marker)
    }

    /// Merges `other` into `self`, adding hit counts with saturation.
    ///
    /// Returns whether a new edge appeared: an edge with a positive count in
    /// `other` that was absent from `self` (in both channels) before the
    /// merge. This single bit is the corpus admission signal.
    pub fn update(&mut self, other: &Self) -> bool {
        let mut new_edge = false;
        for (hash, other_map) in &other.maps {
            match self.maps.get_mut(hash) {
                Some(map) => new_edge |= map.update(other_map),
                None => {
                    let has_hits = !other_map.successful_hits.is_empty()
                        || !other_map.reverted_hits.is_empty();
                    new_edge |= has_hits;
                    self.maps.insert(*hash, other_map.clone());
                }
            }
        }
        new_edge
    }

    /// Moves every success-channel hit into the revert channel, leaving the
    /// success channel empty. Returns whether any counts moved.
    pub fn revert_all(&mut self) -> bool {
        let mut moved = false;
        for map in self.maps.values_mut() {
            moved |= map.revert_all();
        }
        moved
    }

    /// The map recorded for `lookup_hash`, if any code with that identity
    /// executed.
    pub fn contract_map(&self, lookup_hash: &B256) -> Option<&ContractCoverageMap> {
        self.maps.get(lookup_hash)
    }

    /// Iterates over all per-contract maps.
    pub fn iter(&self) -> impl Iterator<Item = (&B256, &ContractCoverageMap)> {
        self.maps.iter()
    }

    pub fn len(&self) -> usize {
        self.maps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.maps.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy_primitives::address;

    const ADDR: Address = address!("00000000000000000000000000000000000000aa");

    #[test]
    fn marker_packs_source_and_destination() {
        let marker = edge_marker(0x1234, 0x5678);
        assert_eq!(marker_source(marker), 0x1234);
        assert_eq!(marker_destination(marker), 0x5678);
    }

    #[test]
    fn sentinels_do_not_collide_with_return_sentinel() {
        assert_ne!(REVERT_MARKER_XOR, RETURN_MARKER_XOR);
        // Sentinel destinations sit above any real EVM code offset.
        assert!(marker_destination(edge_marker(0, REVERT_MARKER_XOR)) > 0x0100_0000);
    }

    #[test]
    fn init_and_runtime_code_get_distinct_identities() {
        let code = [0x60, 0x80, 0x60, 0x40];
        assert_ne!(
            contract_coverage_map_hash(&code, true),
            contract_coverage_map_hash(&code, false)
        );
    }

    fn map_with(markers: &[u64]) -> CoverageMaps {
        let hash = contract_coverage_map_hash(&[0u8], false);
        let mut maps = CoverageMaps::new();
        for &marker in markers {
            maps.set_at(ADDR, hash, 1, marker);
        }
        maps
    }

    #[test]
    fn update_reports_new_edges_only_once() {
        let mut master = CoverageMaps::new();
        assert!(master.update(&map_with(&[edge_marker(1, 2)])));
        assert!(!master.update(&map_with(&[edge_marker(1, 2)])));
        assert!(master.update(&map_with(&[edge_marker(1, 2), edge_marker(3, 4)])));
    }

    #[test]
    fn update_accumulates_hit_counts() {
        let hash = contract_coverage_map_hash(&[0u8], false);
        let marker = edge_marker(1, 2);
        let mut master = map_with(&[marker]);
        master.update(&map_with(&[marker]));
        master.update(&map_with(&[marker]));
        assert_eq!(master.contract_map(&hash).unwrap().hit_count(marker), 3);
    }

    #[test]
    fn update_is_commutative_and_associative_on_counts() {
        let (e1, e2, e3) = (edge_marker(1, 2), edge_marker(3, 4), edge_marker(5, 6));
        let (a, b, c) = (map_with(&[e1, e2]), map_with(&[e2, e3]), map_with(&[e3, e1]));
        let hash = contract_coverage_map_hash(&[0u8], false);

        let mut left = a.clone();
        left.update(&b);
        left.update(&c);

        let mut right = c.clone();
        right.update(&b);
        right.update(&a);

        for marker in [e1, e2, e3] {
            assert_eq!(
                left.contract_map(&hash).unwrap().hit_count(marker),
                right.contract_map(&hash).unwrap().hit_count(marker),
            );
        }
    }

    #[test]
    fn revert_all_moves_hits_to_the_revert_channel() {
        let hash = contract_coverage_map_hash(&[0u8], false);
        let marker = edge_marker(1, 2);
        let mut maps = map_with(&[marker]);

        assert!(maps.revert_all());
        let map = maps.contract_map(&hash).unwrap();
        assert_eq!(map.hit_count(marker), 0);
        assert_eq!(map.reverted_hit_count(marker), 1);
        assert_eq!(map.covered_edge_count(false), 0);
        assert_eq!(map.covered_edge_count(true), 1);

        // Nothing left to move.
        assert!(!maps.revert_all());
    }

    #[test]
    fn reverted_edge_is_not_new_when_seen_successfully() {
        let marker = edge_marker(1, 2);
        let mut master = map_with(&[marker]);
        let mut reverted = map_with(&[marker]);
        reverted.revert_all();
        assert!(!master.update(&reverted));
    }
}
