//! Test-and-commit accounting for shared counter sets.

use std::collections::{BTreeMap, BTreeSet};

use tracing::trace;

use crate::device::{CounterConsumption, CounterSet};

/// Tracks what has been consumed from each counter set during one node
/// attempt.
///
/// Consumption is all-or-nothing per commit: a first pass confirms every
/// counter of every referenced set still has room (and that units agree), a
/// second pass applies the increments. A set can be *blocked*, meaning its
/// prior consumption could not be reconstructed; devices consuming a
/// blocked set are never admitted.
#[derive(Clone, Debug, Default)]
pub struct CounterTracker {
    available: BTreeMap<String, CounterSet>,
    consumed: BTreeMap<String, BTreeMap<String, i64>>,
    blocked: BTreeSet<String>,
}

impl CounterTracker {
    /// Seeds the tracker with the node's counter-set inventory.
    pub fn new(sets: impl IntoIterator<Item = CounterSet>) -> Self {
        CounterTracker {
            available: sets.into_iter().map(|s| (s.name.clone(), s)).collect(),
            consumed: BTreeMap::new(),
            blocked: BTreeSet::new(),
        }
    }

    /// Marks a set as unusable for further consumption.
    pub fn block(&mut self, set_name: &str) {
        self.blocked.insert(set_name.to_string());
    }

    /// Whether any of the given consumptions targets a blocked set.
    pub fn any_blocked(&self, consumes: &[CounterConsumption]) -> bool {
        consumes.iter().any(|c| self.blocked.contains(&c.counter_set))
    }

    /// Attempts to consume all the given amounts; commits only if every
    /// counter fits. Returns whether the commit happened.
    ///
    /// A consumption referencing an unknown set or counter, or carrying a
    /// mismatched unit, rejects the whole commit.
    pub fn try_consume(&mut self, consumes: &[CounterConsumption]) -> bool {
        for consumption in consumes {
            let set = match self.available.get(&consumption.counter_set) {
                Some(set) => set,
                None => {
                    trace!(
                        counter_set = %consumption.counter_set,
                        "rejecting consumption from unknown counter set"
                    );
                    return false;
                }
            };
            for (name, wanted) in &consumption.counters {
                let have = match set.counters.get(name) {
                    Some(have) => have,
                    None => return false,
                };
                if have.unit != wanted.unit {
                    trace!(
                        counter_set = %consumption.counter_set,
                        counter = %name,
                        "rejecting consumption with mismatched unit"
                    );
                    return false;
                }
                let existing = self
                    .consumed
                    .get(&consumption.counter_set)
                    .and_then(|m| m.get(name))
                    .copied()
                    .unwrap_or(0);
                if existing + wanted.amount > have.amount {
                    return false;
                }
            }
        }

        for consumption in consumes {
            let per_set = self
                .consumed
                .entry(consumption.counter_set.clone())
                .or_default();
            for (name, wanted) in &consumption.counters {
                *per_set.entry(name.clone()).or_insert(0) += wanted.amount;
            }
        }
        true
    }

    /// Total consumed so far from one counter of one set.
    pub fn consumed(&self, set_name: &str, counter: &str) -> i64 {
        self.consumed
            .get(set_name)
            .and_then(|m| m.get(counter))
            .copied()
            .unwrap_or(0)
    }
}
