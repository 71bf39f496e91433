//! Shared message counter
//!
//! Every active message loop increments the same [`MessageCounter`]; the
//! coordinator drains it on a fixed interval with
//! [`MessageCounter::snapshot_and_reset`].

use serde::{Serialize, Serializer};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::{Mutex, MutexGuard, PoisonError};

/// Classification key of a protocol message: namespace plus code relative to
/// that namespace's offset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MessageKey {
    /// Protocol name (`p2p`, `eth`, `snap`, or `unknown`)
    pub protocol: &'static str,

    /// Message code within the protocol
    pub code: u16,
}

impl MessageKey {
    pub const fn new(protocol: &'static str, code: u16) -> Self {
        Self { protocol, code }
    }
}

impl fmt::Display for MessageKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{:#04x}", self.protocol, self.code)
    }
}

impl Serialize for MessageKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

/// Concurrent accumulator of message counts keyed by [`MessageKey`]
#[derive(Debug, Default)]
pub struct MessageCounter {
    counts: Mutex<HashMap<MessageKey, u64>>,
}

impl MessageCounter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add one occurrence of `key`
    pub fn increment(&self, key: MessageKey) {
        *self.lock().entry(key).or_insert(0) += 1;
    }

    /// Take every count accumulated so far and leave the counter empty.
    ///
    /// The swap happens under the same lock as [`increment`](Self::increment),
    /// so each increment lands in exactly one snapshot.
    pub fn snapshot_and_reset(&self) -> CountSnapshot {
        let taken = std::mem::take(&mut *self.lock());
        taken.into_iter().collect()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<MessageKey, u64>> {
        // A panicking incrementer cannot leave the map half-updated.
        self.counts.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Counts drained from a [`MessageCounter`] at one instant
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct CountSnapshot(BTreeMap<MessageKey, u64>);

impl CountSnapshot {
    /// Count recorded for `key`, zero when absent
    pub fn get(&self, key: &MessageKey) -> u64 {
        self.0.get(key).copied().unwrap_or(0)
    }

    /// Sum of all counts
    pub fn total(&self) -> u64 {
        self.0.values().sum()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }
}

impl FromIterator<(MessageKey, u64)> for CountSnapshot {
    fn from_iter<I: IntoIterator<Item = (MessageKey, u64)>>(iter: I) -> Self {
        let mut counts = BTreeMap::new();
        for (key, count) in iter {
            *counts.entry(key).or_insert(0) += count;
        }
        Self(counts)
    }
}

impl fmt::Display for CountSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for (key, count) in &self.0 {
            if !first {
                f.write_str(" ")?;
            }
            write!(f, "{}={}", key, count)?;
            first = false;
        }
        Ok(())
    }
}
