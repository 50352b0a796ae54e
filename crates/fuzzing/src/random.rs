//! Weighted random selection.

use rand::{rngs::StdRng, Rng};

/// A weighted random chooser over an append-only set of choices.
///
/// Sampling is O(log n) over a Fenwick (binary indexed) tree of cumulative
/// weights. Weights accumulate in a `u128`, which gives enough headroom that
/// campaign-scale totals cannot wrap: entry weights grow linearly with the
/// number of sequences a worker tested, and summing u64-sized weights would
/// need more than 2⁶⁴ entries to overflow the total.
#[derive(Clone, Debug)]
pub struct WeightedRandomChooser<T> {
    choices: Vec<T>,
    /// One-indexed Fenwick tree over choice weights.
    tree: Vec<u128>,
    total_weight: u128,
    weighted_count: usize,
}

impl<T> Default for WeightedRandomChooser<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> WeightedRandomChooser<T> {
    pub fn new() -> Self {
        Self { choices: Vec::new(), tree: vec![0], total_weight: 0, weighted_count: 0 }
    }

    /// The number of choices with a non-zero weight.
    pub fn choice_count(&self) -> usize {
        self.weighted_count
    }

    /// The sum of all weights.
    pub fn total_weight(&self) -> u128 {
        self.total_weight
    }

    /// Adds a choice. A zero weight keeps the choice unselectable.
    pub fn add_choice(&mut self, choice: T, weight: u128) {
        self.choices.push(choice);
        let index = self.choices.len();
        // A new Fenwick node covers the range (index - lowbit, index]; seed
        // it with the sum of the range it absorbs plus the new weight.
        let lowbit = index & index.wrapping_neg();
        let absorbed = self.prefix_sum(index - 1) - self.prefix_sum(index - lowbit);
        self.tree.push(absorbed + weight);
        self.total_weight += weight;
        if weight > 0 {
            self.weighted_count += 1;
        }
    }

    /// Picks a choice with probability proportional to its weight. `None`
    /// when no choice has a positive weight.
    pub fn choose(&self, rng: &mut StdRng) -> Option<&T> {
        if self.total_weight == 0 {
            return None;
        }
        let mut remaining = rng.gen_range(0..self.total_weight);
        let mut position = 0;
        let mut step = self.choices.len().next_power_of_two();
        while step > 0 {
            let next = position + step;
            if next < self.tree.len() && self.tree[next] <= remaining {
                remaining -= self.tree[next];
                position = next;
            }
            step >>= 1;
        }
        self.choices.get(position)
    }

    fn prefix_sum(&self, mut index: usize) -> u128 {
        let mut sum = 0;
        while index > 0 {
            sum += self.tree[index];
            index &= index - 1;
        }
        sum
    }
}
