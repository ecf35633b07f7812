//! Merge Reconciliation
//!
//! Turns one sequence into another while keeping as many existing elements
//! as possible.
//!
//! # Algorithm
//!
//! Walk the target sequence by index `i`:
//!
//! 1. If `current[i]` is the same element as `target[i]`, keep it.
//! 2. Otherwise scan `current` forward from `i + 1` for the first element
//!    that is the same as `target[i]` and swap it into position `i`.
//! 3. Otherwise insert `target[i]` at `i`.
//!
//! Finally everything past `target.len()` is trimmed. Duplicates resolve to
//! the first forward match, which is deterministic but not a minimal edit.

/// What reconciling one position did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeStep {
    Kept,
    Swapped { from: usize },
    Inserted,
}

/// Reconcile `current` into `target` in place using `same` as identity.
///
/// Elements kept or swapped are the existing ones, not copies from
/// `target`. Returns one step per target position.
pub fn reconcile<T, F>(current: &mut Vec<T>, target: &[T], same: F) -> Vec<MergeStep>
where
    T: Clone,
    F: Fn(&T, &T) -> bool,
{
    let mut steps = Vec::with_capacity(target.len());

    for (i, wanted) in target.iter().enumerate() {
        if current.get(i).is_some_and(|existing| same(existing, wanted)) {
            steps.push(MergeStep::Kept);
            continue;
        }

        let found = current
            .iter()
            .skip(i + 1)
            .position(|existing| same(existing, wanted))
            .map(|offset| i + 1 + offset);

        match found {
            Some(from) => {
                current.swap(i, from);
                steps.push(MergeStep::Swapped { from });
            }
            None => {
                current.insert(i, wanted.clone());
                steps.push(MergeStep::Inserted);
            }
        }
    }

    current.truncate(target.len());
    steps
}
