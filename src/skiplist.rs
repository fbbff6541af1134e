//! A probabilistic ordered index over opaque byte keys.
//!
//! The skiplist backs the memtable: an ordered associative container
//! parameterized by a comparator, with O(log n) insert and seek. Node
//! height follows a geometric distribution (p = 0.5) capped at
//! [`MAX_HEIGHT`] levels.
//!
//! ```text
//! level 3:  HEAD ----------------------------> 50 ----------> nil
//! level 2:  HEAD ----------> 20 -------------> 50 ----------> nil
//! level 1:  HEAD --> 10 --> 20 ----> 35 -----> 50 --> 60 ---> nil
//! level 0:  HEAD --> 10 --> 20 --> 25 --> 35 -> 50 --> 60 --> nil
//! ```
//!
//! Nodes live in an arena and link by index, so no unsafe code is needed
//! for the multi-level pointer structure. A level-0 back pointer supports
//! reverse iteration.

use std::cmp::Ordering;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::key::Comparator;

pub const MAX_HEIGHT: usize = 32;
const P: f64 = 0.5;

/// Arena index of the head sentinel.
const HEAD: usize = 0;

struct Node {
    key: Vec<u8>,
    value: Vec<u8>,
    next: Vec<Option<usize>>,
    prev: Option<usize>,
}

impl Node {
    fn new(height: usize, key: Vec<u8>, value: Vec<u8>) -> Self {
        Self {
            key,
            value,
            next: vec![None; height],
            prev: None,
        }
    }
}

pub struct SkipList {
    nodes: Vec<Node>,
    tail: Option<usize>,
    level: usize,
    len: usize,
    rng: StdRng,
    cmp: Comparator,
}

impl SkipList {
    pub fn new(cmp: Comparator) -> Self {
        Self {
            nodes: vec![Node::new(MAX_HEIGHT, Vec::new(), Vec::new())],
            tail: None,
            level: 1,
            len: 0,
            rng: StdRng::from_entropy(),
            cmp,
        }
    }

    /// Insert a key/value pair. Keys are unique: inserting a key that
    /// already exists is a programmer error and panics.
    pub fn insert(&mut self, key: Vec<u8>, value: Vec<u8>) {
        let mut prev = [HEAD; MAX_HEIGHT];
        let mut h = HEAD;
        for i in (0..self.level).rev() {
            h = self.find_less_than(h, i, &key);
            if let Some(next) = self.nodes[h].next[i] {
                if (self.cmp)(&self.nodes[next].key, &key) == Ordering::Equal {
                    panic!("key already exists in skiplist");
                }
            }
            prev[i] = h;
        }

        let height = self.random_height();
        let idx = self.nodes.len();
        self.nodes.push(Node::new(height, key, value));

        self.nodes[idx].prev = Some(prev[0]);
        if let Some(next) = self.nodes[prev[0]].next[0] {
            self.nodes[next].prev = Some(idx);
        }

        for i in 0..height {
            self.nodes[idx].next[i] = self.nodes[prev[i]].next[i];
            self.nodes[prev[i]].next[i] = Some(idx);
        }

        if self.nodes[idx].next[0].is_none() {
            self.tail = Some(idx);
        }
        self.level = self.level.max(height);
        self.len += 1;
    }

    pub fn contains(&self, key: &[u8]) -> bool {
        let mut h = HEAD;
        for i in (0..self.level).rev() {
            h = self.find_less_than(h, i, key);
            if let Some(next) = self.nodes[h].next[i] {
                if (self.cmp)(&self.nodes[next].key, key) == Ordering::Equal {
                    return true;
                }
            }
        }
        false
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn iter(&self) -> SkipListIterator<'_> {
        SkipListIterator {
            list: self,
            cur: None,
        }
    }

    /// Last node at `level` whose key is < `target`, starting from `begin`.
    fn find_less_than(&self, begin: usize, level: usize, target: &[u8]) -> usize {
        let mut h = begin;
        while let Some(next) = self.nodes[h].next[level] {
            if (self.cmp)(&self.nodes[next].key, target) != Ordering::Less {
                break;
            }
            h = next;
        }
        h
    }

    fn random_height(&mut self) -> usize {
        let mut height = 1;
        while height < MAX_HEIGHT && self.rng.gen::<f64>() < P {
            height += 1;
        }
        height
    }
}

/// A bidirectional cursor over the skiplist.
///
/// Positions are stable across concurrent reads; the engine never mutates
/// a list while iterating it (inserts go only to the active memtable,
/// iteration only to sealed ones or under the memtable lock).
pub struct SkipListIterator<'a> {
    list: &'a SkipList,
    cur: Option<usize>,
}

impl<'a> SkipListIterator<'a> {
    pub fn valid(&self) -> bool {
        matches!(self.cur, Some(idx) if idx != HEAD)
    }

    /// Requires `valid()`.
    pub fn key(&self) -> &'a [u8] {
        assert!(self.valid());
        &self.list.nodes[self.cur.unwrap()].key
    }

    /// Requires `valid()`.
    pub fn value(&self) -> &'a [u8] {
        assert!(self.valid());
        &self.list.nodes[self.cur.unwrap()].value
    }

    /// Requires `valid()`.
    pub fn next(&mut self) {
        assert!(self.valid());
        self.cur = self.list.nodes[self.cur.unwrap()].next[0];
    }

    /// Requires `valid()`. Positions before the first entry become invalid.
    pub fn prev(&mut self) {
        assert!(self.valid());
        self.cur = self.list.nodes[self.cur.unwrap()].prev;
    }

    /// Position on the first entry whose key is >= `target`.
    pub fn seek(&mut self, target: &[u8]) {
        let mut h = HEAD;
        for i in (0..self.list.level).rev() {
            h = self.list.find_less_than(h, i, target);
        }
        self.cur = self.list.nodes[h].next[0];
    }

    pub fn seek_to_first(&mut self) {
        self.cur = self.list.nodes[HEAD].next[0];
    }

    pub fn seek_to_last(&mut self) {
        self.cur = self.list.tail;
    }
}
