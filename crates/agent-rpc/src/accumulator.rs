//! Cross-page accumulator
//!
//! Some objects can only be assembled after a whole crawl, e.g. sprint
//! membership gathered from every issue page. The accumulator is owned by the
//! crawl, passed down by `&mut`, and flushed once at the end.

use crate::{FullSyncSender, Record, Result};
use std::collections::BTreeMap;

/// Keyed state collected across pages
#[derive(Debug, Clone)]
pub struct Accumulator<K, V> {
    entries: BTreeMap<K, V>,
}

impl<K: Ord, V> Default for Accumulator<K, V> {
    fn default() -> Self {
        Self {
            entries: BTreeMap::new(),
        }
    }
}

impl<K: Ord, V> Accumulator<K, V> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert `value`, or fold it into the existing entry with `combine`
    pub fn merge(&mut self, key: K, value: V, combine: impl FnOnce(&mut V, V)) {
        match self.entries.get_mut(&key) {
            Some(existing) => combine(existing, value),
            None => {
                self.entries.insert(key, value);
            }
        }
    }

    pub fn get(&self, key: &K) -> Option<&V> {
        self.entries.get(key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Convert every entry to a record and ship them through `sender`, then
    /// close the sender's stream. Conversion errors abort before anything is sent.
    pub async fn flush(
        self,
        sender: &FullSyncSender,
        mut to_record: impl FnMut(K, V) -> Result<Record>,
    ) -> Result<u64> {
        let records = self
            .entries
            .into_iter()
            .map(|(k, v)| to_record(k, v))
            .collect::<Result<Vec<_>>>()?;
        sender.send(records).await?;
        sender.done().await
    }
}
