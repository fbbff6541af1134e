//! Heap-based k-way merge over sorted SSTable iterators.
//!
//! A min-heap keyed by the internal-key comparator tracks the current
//! entry of every live source. `next` pops the smallest, advances its
//! source, and re-pushes it while it remains valid. Exact internal-key
//! ties (impossible between well-formed tables, which never share a
//! `(user key, seq)` pair) fall back to source order.

use std::cmp::Ordering;
use std::collections::BinaryHeap;

use crate::error::Result;
use crate::key;
use crate::sstable::SSTableIterator;

struct HeapEntry {
    key: Vec<u8>,
    source: usize,
}

impl PartialEq for HeapEntry {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for HeapEntry {}

impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for HeapEntry {
    // Reversed so the std max-heap pops the smallest key; equal keys pop
    // the lower source index first.
    fn cmp(&self, other: &Self) -> Ordering {
        key::compare(&self.key, &other.key)
            .reverse()
            .then_with(|| self.source.cmp(&other.source).reverse())
    }
}

pub struct MergeIterator<'a> {
    sources: Vec<SSTableIterator<'a>>,
    heap: BinaryHeap<HeapEntry>,
}

impl<'a> MergeIterator<'a> {
    /// Build a merge over already-positioned iterators; exhausted sources
    /// are skipped.
    pub fn new(sources: Vec<SSTableIterator<'a>>) -> Self {
        let mut heap = BinaryHeap::new();
        for (source, iter) in sources.iter().enumerate() {
            if iter.valid() {
                heap.push(HeapEntry {
                    key: iter.key().to_vec(),
                    source,
                });
            }
        }
        Self { sources, heap }
    }

    pub fn valid(&self) -> bool {
        !self.heap.is_empty()
    }

    /// Requires `valid()`.
    pub fn key(&self) -> &[u8] {
        &self.heap.peek().unwrap().key
    }

    /// Requires `valid()`.
    pub fn value(&self) -> &[u8] {
        let source = self.heap.peek().unwrap().source;
        self.sources[source].value()
    }

    /// Requires `valid()`.
    pub fn next(&mut self) -> Result<()> {
        let entry = self.heap.pop().unwrap();
        let iter = &mut self.sources[entry.source];
        iter.next()?;
        if iter.valid() {
            self.heap.push(HeapEntry {
                key: iter.key().to_vec(),
                source: entry.source,
            });
        }
        Ok(())
    }
}
