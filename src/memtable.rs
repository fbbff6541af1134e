//! In-memory write buffer over the skiplist.
//!
//! Entries are encoded internal keys inserted with empty skiplist values;
//! the user value rides inside the internal key, matching the on-disk data
//! block layout. A size counter tracks accumulated encoded bytes to decide
//! when the buffer is full and must be rotated.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{RwLock, RwLockReadGuard};

use crate::key::{self, InternalKey, KeyType};
use crate::skiplist::SkipList;

pub struct Memtable {
    index: RwLock<SkipList>,
    size: AtomicU64,
    max_size: u64,
}

impl Memtable {
    pub fn new(max_size: u64) -> Self {
        Self {
            index: RwLock::new(SkipList::new(key::compare)),
            size: AtomicU64::new(0),
            max_size,
        }
    }

    /// Insert an entry at a fresh sequence number. `user_value` is ignored
    /// for deletions.
    pub fn add(&self, seq: u64, kind: KeyType, user_key: &[u8], user_value: &[u8]) {
        let ik = match kind {
            KeyType::Value => InternalKey::new(user_key, user_value, seq, kind),
            KeyType::Deletion => InternalKey::new(user_key, &[], seq, kind),
        };
        let size = ik.size();
        self.index.write().unwrap().insert(ik.encode(), Vec::new());
        self.size.fetch_add(size, Ordering::SeqCst);
    }

    /// Look up the freshest record for `user_key` visible at `seq`.
    ///
    /// Returns `None` when the key is unknown to this memtable,
    /// `Some(None)` when the freshest visible record is a tombstone, and
    /// `Some(Some(value))` otherwise.
    pub fn get(&self, user_key: &[u8], seq: u64) -> Option<Option<Vec<u8>>> {
        let target = key::lookup_key(user_key, seq).encode();
        let index = self.index.read().unwrap();
        let mut iter = index.iter();
        iter.seek(&target);
        if !iter.valid() {
            return None;
        }

        // Seek lands on the largest seq <= the ceiling; only the user key
        // needs checking.
        let found = InternalKey::decode(iter.key()).ok()?;
        if found.user_key != user_key {
            return None;
        }
        match found.kind {
            KeyType::Value => Some(Some(found.user_value)),
            KeyType::Deletion => Some(None),
        }
    }

    pub fn full(&self) -> bool {
        self.size.load(Ordering::SeqCst) >= self.max_size
    }

    pub fn size(&self) -> u64 {
        self.size.load(Ordering::SeqCst)
    }

    /// Shared access to the underlying index, for flushing a sealed
    /// memtable to an SSTable.
    pub fn index(&self) -> RwLockReadGuard<'_, SkipList> {
        self.index.read().unwrap()
    }
}
