//! Reconnection Optimizer
//!
//! When a wildcard path re-resolves, most of its elements are usually the
//! same objects as before. [`plan`] keeps those subscriptions untouched:
//!
//! 1. Align `old` and `new` from the front while elements are identical
//! 2. Align the remainders from the back
//! 3. Unsubscribe what is left of `old`, subscribe what is left of `new`
//!
//! Appending, prepending and dropping or swapping one element cause no
//! unnecessary churn. Reordering defeats both alignments and degrades to
//! unsubscribing and resubscribing the whole middle section; callers rely on
//! exactly this churn, so it is not optimized further.
//!
//! An element that occurs more than once may be aligned at one position and
//! left over at another. Aligned elements are never unsubscribed, otherwise
//! a duplicate in the middle would drop a subscription that is still needed.

use std::collections::HashSet;
use std::hash::Hash;

/// Subscriptions to drop and to add.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Plan<T> {
    pub unsubscribe: Vec<T>,
    pub subscribe: Vec<T>,
}

impl<T> Plan<T> {
    pub fn is_empty(&self) -> bool {
        self.unsubscribe.is_empty() && self.subscribe.is_empty()
    }
}

/// Compute the subscription changes needed to go from `old` to `new`.
pub fn plan<T>(old: &[T], new: &[T]) -> Plan<T>
where
    T: Clone + Eq + Hash,
{
    let mut should_stay: HashSet<&T> = HashSet::new();

    // Skip common elements from the start
    let mut front = 0;
    while front < old.len() && front < new.len() && old[front] == new[front] {
        should_stay.insert(&new[front]);
        front += 1;
    }

    // Skip common elements from the end
    let (mut old_end, mut new_end) = (old.len(), new.len());
    while old_end > front && new_end > front && old[old_end - 1] == new[new_end - 1] {
        should_stay.insert(&new[new_end - 1]);
        old_end -= 1;
        new_end -= 1;
    }

    Plan {
        unsubscribe: old[front..old_end]
            .iter()
            .filter(|item| !should_stay.contains(item))
            .cloned()
            .collect(),
        subscribe: new[front..new_end].to_vec(),
    }
}
