//! Minimization of failing call sequences.
//!
//! Deleting calls alone misses minimizations available in argument space
//! (a large constant that could be zero), and value shrinking alone never
//! shortens the sequence. The shrinker therefore removes reverting calls
//! first, then alternates randomly between shrinking argument values and
//! dropping calls, keeping whichever candidates the verifier confirms.

use crate::{
    calls::CallSequence,
    worker::{FuzzerWorker, ShrinkCallSequenceRequest},
};
use eyre::Result;
use rand::Rng;
use std::sync::atomic::Ordering;

/// Shrinks `original` until the iteration budget is exhausted, then records
/// the result (if requested), reverts the chain, and hands the final
/// sequence to the request's finished callback.
///
/// The result never grows: the final sequence is at most as long as the
/// original and still satisfies the request's verifier.
pub(crate) fn shrink_call_sequence(
    worker: &mut FuzzerWorker<'_>,
    original: CallSequence,
    request: ShrinkCallSequenceRequest,
) -> Result<CallSequence> {
    let mut iterations = worker.fuzzer().config().shrink_limit;
    let mut best = original;

    debug!(
        target: "hydra::shrink",
        length = best.len(),
        budget = iterations,
        "shrinking failing call sequence"
    );

    // First drop calls that reverted: they rarely contribute to the failing
    // state, so each is cheap to try exactly once.
    let mut index = 0;
    while index < best.len() && iterations > 0 {
        if worker.fuzzer().cancellation().is_cancelled() {
            break;
        }
        if !best[index].failed() {
            index += 1;
            continue;
        }
        iterations -= 1;
        let mut candidate = best.clone();
        candidate.remove(index);
        if test_shrunken_call_sequence(worker, &mut candidate, &request)? {
            best = candidate;
        } else {
            index += 1;
        }
    }

    // Then alternate between argument shrinking and call removal. A
    // sequence of one call has nothing left to remove, so it always goes to
    // the argument side.
    while iterations > 0 && !best.is_empty() {
        if worker.fuzzer().cancellation().is_cancelled() {
            break;
        }
        iterations -= 1;

        let mut candidate = best.clone();
        let param_shrink = candidate.len() == 1 || worker.rng.gen_bool(0.5);
        let index = worker.rng.gen_range(0..candidate.len());
        if param_shrink {
            worker.shrink_element_inputs(&mut candidate[index])?;
        } else {
            candidate.remove(index);
        }

        if test_shrunken_call_sequence(worker, &mut candidate, &request)? {
            best = candidate;
        }
    }

    debug!(target: "hydra::shrink", length = best.len(), "shrinking finished");

    if request.record_result_in_corpus {
        let weight = 1 + worker.metrics().sequences_tested.load(Ordering::Relaxed);
        worker
            .fuzzer()
            .corpus()
            .add_test_result_call_sequence(best.clone(), weight, true)?;
    }

    worker.revert_to_base()?;
    if let Some(finished_callback) = &request.finished_callback {
        finished_callback(worker, &best)?;
    }
    worker.revert_to_base()?;
    worker.fuzzer().note_test_failure();
    Ok(best)
}

/// Executes a candidate on the worker chain and runs the request's
/// verifier against it. The chain is reverted to the testing base block
/// before returning, success or not.
fn test_shrunken_call_sequence(
    worker: &mut FuzzerWorker<'_>,
    candidate: &mut CallSequence,
    request: &ShrinkCallSequenceRequest,
) -> Result<bool> {
    let result = execute_candidate(worker, candidate, request);
    let reverted = worker.revert_to_base();
    let valid = result?;
    reverted?;
    Ok(valid)
}

fn execute_candidate(
    worker: &mut FuzzerWorker<'_>,
    candidate: &mut CallSequence,
    request: &ShrinkCallSequenceRequest,
) -> Result<bool> {
    for index in 0..candidate.len() {
        {
            let element = &mut candidate[index];
            // Re-stamp against the current (post-revert) chain head.
            element.call.fill_from_chain(worker.chain());
            worker.execute_element(element)?;
        }

        // Shrink executions can still discover coverage worth keeping.
        let weight = 1 + worker.metrics().sequences_tested.load(Ordering::Relaxed);
        worker.fuzzer().corpus().check_sequence_coverage_and_update(
            &candidate[..=index],
            weight,
            true,
        )?;

        if worker.fuzzer().cancellation().is_cancelled() {
            return Ok(false);
        }
    }
    (request.verifier)(worker, candidate.as_slice())
}
