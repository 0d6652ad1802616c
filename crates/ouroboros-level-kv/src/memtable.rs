//! Ordered multi-version table
//!
//! Each key maps to a chain of versions in ascending sequence order. A read
//! at sequence S sees the newest version with `sequence <= S`.

use crate::types::{BatchOp, Sequence, Version};
use bytes::Bytes;
use std::collections::BTreeMap;
use std::ops::Bound;

/// Per-version bookkeeping charged by `memory_usage`
const VERSION_OVERHEAD: usize = std::mem::size_of::<Version>();

#[derive(Debug, Default)]
pub struct MemTable {
    map: BTreeMap<Bytes, Vec<Version>>,
}

impl MemTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a table holding `image` as single versions at `sequence`
    pub fn from_image(image: BTreeMap<Bytes, Bytes>, sequence: Sequence) -> Self {
        let map = image
            .into_iter()
            .map(|(key, value)| {
                (
                    key,
                    vec![Version {
                        sequence,
                        value: Some(value),
                    }],
                )
            })
            .collect();
        Self { map }
    }

    /// Record one mutation at `sequence`
    pub fn apply(&mut self, op: &BatchOp, sequence: Sequence) {
        let (key, value) = match op {
            BatchOp::Put { key, value } => (key, Some(value.clone())),
            BatchOp::Delete { key } => (key, None),
        };

        match self.map.get_mut(key.as_ref()) {
            Some(chain) => chain.push(Version { sequence, value }),
            None => {
                // Deleting a key with no history leaves nothing to shadow
                if value.is_some() {
                    self.map.insert(key.clone(), vec![Version { sequence, value }]);
                }
            }
        }
    }

    fn visible(chain: &[Version], sequence: Sequence) -> Option<&Bytes> {
        chain
            .iter()
            .rev()
            .find(|v| v.sequence <= sequence)
            .and_then(|v| v.value.as_ref())
    }

    /// Value of `key` as of `sequence`
    pub fn get(&self, key: &[u8], sequence: Sequence) -> Option<&Bytes> {
        self.map
            .get(key)
            .and_then(|chain| Self::visible(chain, sequence))
    }

    /// First live entry at or after `from`
    pub fn seek_forward(&self, from: Bound<&[u8]>, sequence: Sequence) -> Option<(Bytes, Bytes)> {
        self.map
            .range::<[u8], _>((from, Bound::Unbounded))
            .find_map(|(key, chain)| {
                Self::visible(chain, sequence).map(|value| (key.clone(), value.clone()))
            })
    }

    /// Last live entry at or before `to`
    pub fn seek_backward(&self, to: Bound<&[u8]>, sequence: Sequence) -> Option<(Bytes, Bytes)> {
        self.map
            .range::<[u8], _>((Bound::Unbounded, to))
            .rev()
            .find_map(|(key, chain)| {
                Self::visible(chain, sequence).map(|value| (key.clone(), value.clone()))
            })
    }

    /// Drop versions of `keys` that no reader at or above `floor` can see
    pub fn prune<'a>(&mut self, keys: impl IntoIterator<Item = &'a Bytes>, floor: Sequence) {
        for key in keys {
            let remove = match self.map.get_mut(key.as_ref()) {
                Some(chain) => {
                    if let Some(keep_from) = chain.iter().rposition(|v| v.sequence <= floor) {
                        chain.drain(..keep_from);
                    }
                    chain.len() == 1 && chain[0].is_tombstone() && chain[0].sequence <= floor
                }
                None => false,
            };
            if remove {
                self.map.remove(key.as_ref());
            }
        }
    }

    /// Key and value bytes of every retained version in `[start, end)`
    pub fn approximate_size(&self, start: &[u8], end: &[u8]) -> u64 {
        if start >= end {
            return 0;
        }
        self.map
            .range::<[u8], _>((Bound::Included(start), Bound::Excluded(end)))
            .map(|(key, chain)| {
                chain
                    .iter()
                    .map(|v| (key.len() + v.value_len()) as u64)
                    .sum::<u64>()
            })
            .sum()
    }

    /// Live entries as of `sequence`, in key order
    pub fn live_entries(&self, sequence: Sequence) -> Vec<(Bytes, Bytes)> {
        self.map
            .iter()
            .filter_map(|(key, chain)| {
                Self::visible(chain, sequence).map(|value| (key.clone(), value.clone()))
            })
            .collect()
    }

    pub fn live_count(&self, sequence: Sequence) -> usize {
        self.map
            .values()
            .filter(|chain| Self::visible(chain, sequence).is_some())
            .count()
    }

    /// Number of retained versions across all keys
    pub fn version_count(&self) -> usize {
        self.map.values().map(Vec::len).sum()
    }

    pub fn memory_usage(&self) -> usize {
        self.map
            .iter()
            .map(|(key, chain)| {
                key.len()
                    + chain
                        .iter()
                        .map(|v| v.value_len() + VERSION_OVERHEAD)
                        .sum::<usize>()
            })
            .sum()
    }
}
