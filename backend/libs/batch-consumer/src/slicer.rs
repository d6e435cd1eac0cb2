//! Splits a batch into key-disjoint slices.
//!
//! A slice never contains two messages with the same key, so each slice can be
//! applied as one unordered bulk statement. Applying slices in order preserves
//! per-key arrival order across the whole batch.

use std::collections::HashMap;
use std::hash::Hash;

use crate::message::Message;

/// Options controlling how a batch is sliced.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SliceOptions {
    /// Keep only the last message per key (log-compaction semantics)
    pub compacted: bool,
    /// Messages carry no meaningful keys; apply everything in one slice
    pub no_keys: bool,
}

pub type Slice<K, P> = Vec<Message<K, P>>;

#[derive(Debug, Clone, Copy, Default)]
pub struct BatchSlicer;

impl BatchSlicer {
    /// Slice `messages` according to `options`. Empty input yields no slices.
    pub fn slice<K, P>(messages: Vec<Message<K, P>>, options: SliceOptions) -> Vec<Slice<K, P>>
    where
        K: Eq + Hash + Clone,
    {
        if messages.is_empty() {
            return Vec::new();
        }
        if options.no_keys {
            return vec![messages];
        }
        if options.compacted {
            return vec![Self::compact(messages)];
        }

        // Occurrence rank of each message within its key group. The i-th
        // occurrence of every key lands in slice i; within a slice, messages
        // keep their arrival order.
        let mut seen: HashMap<Option<K>, usize> = HashMap::new();
        let mut slices: Vec<Slice<K, P>> = Vec::new();
        for message in messages {
            let rank = seen.entry(message.key.clone()).or_insert(0);
            if *rank == slices.len() {
                slices.push(Vec::new());
            }
            slices[*rank].push(message);
            *rank += 1;
        }
        slices
    }

    /// Last message per key, ordered by the position of that last occurrence.
    pub fn compact<K, P>(messages: Vec<Message<K, P>>) -> Vec<Message<K, P>>
    where
        K: Eq + Hash + Clone,
    {
        let mut last_seen: HashMap<Option<K>, usize> = HashMap::new();
        for (i, message) in messages.iter().enumerate() {
            last_seen.insert(message.key.clone(), i);
        }
        messages
            .into_iter()
            .enumerate()
            .filter(|(i, m)| last_seen.get(&m.key) == Some(i))
            .map(|(_, m)| m)
            .collect()
    }
}
