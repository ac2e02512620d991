//! Hash-consed node table with per-node reference counts.
//!
//! Nodes live in one flat vector, indexed by `u32`. Index 0 is a sentinel
//! meaning "no node", index 1 is the terminal. Unique-table lookup goes through
//! a fixed array of buckets, each the head of an intrusive chain threaded
//! through `Entry::next`.
//!
//! Reference counts only track *external* owners (predicate handles, encoder
//! trie nodes, variable nodes). A node whose count is zero stays in the table
//! until the next [`NodeTable::collect_garbage`] finds that no referenced node
//! reaches it.

use std::cmp::min;

use crate::error::{Error, Result};
use crate::reference::Ref;
use crate::utils::{pairing3, MyHash};

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct Node {
    pub variable: u32,
    pub low: Ref,
    pub high: Ref,
}

impl Default for Node {
    fn default() -> Self {
        Self {
            variable: 0,
            low: Ref::ZERO,
            high: Ref::ZERO,
        }
    }
}

impl MyHash for Node {
    fn hash(&self) -> u64 {
        pairing3(self.variable as u64, self.low.as_lit(), self.high.as_lit())
    }
}

#[derive(Debug, Clone, Default)]
struct Entry {
    node: Node,
    next: u32,
    refs: u32,
    occupied: bool,
}

pub struct NodeTable {
    data: Vec<Entry>,

    buckets: Vec<u32>,
    bitmask: u64,

    /// Index of the first *possibly* free (non-occupied) cell.
    min_free: usize,
    /// Index of the last occupied cell.
    last_index: usize,
    /// Number of occupied cells.
    real_size: usize,
}

impl NodeTable {
    /// Create a new table of size `2^bits`.
    pub fn new(bits: usize) -> Self {
        assert!(bits <= 31, "Storage bits should be in the range 0..=31");

        let capacity = 1 << bits;
        let mut data: Vec<Entry> = Vec::with_capacity(capacity);
        data.resize_with(capacity, Entry::default);
        data[0].occupied = true; // sentry

        let buckets_bits = min(bits, 16);
        let buckets_size = 1 << buckets_bits;

        Self {
            data,
            buckets: vec![0; buckets_size],
            bitmask: (buckets_size - 1) as u64,
            min_free: 1,
            last_index: 0,
            real_size: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.data.len()
    }
    /// Number of occupied cells.
    pub fn real_size(&self) -> usize {
        self.real_size
    }

    pub fn is_occupied(&self, index: u32) -> bool {
        assert_ne!(index, 0, "Index is 0");
        self.data[index as usize].occupied
    }

    pub fn node(&self, index: u32) -> Node {
        assert!(self.is_occupied(index), "Node {} is not allocated", index);
        self.data[index as usize].node
    }

    pub fn variable(&self, index: u32) -> u32 {
        self.node(index).variable
    }

    pub fn refs(&self, index: u32) -> u32 {
        self.data[index as usize].refs
    }

    pub fn inc_ref(&mut self, index: u32) {
        assert!(
            self.is_occupied(index),
            "Referencing node {} which has been collected",
            index
        );
        let entry = &mut self.data[index as usize];
        entry.refs = entry.refs.saturating_add(1);
    }

    /// Returns the remaining reference count.
    pub fn dec_ref(&mut self, index: u32) -> u32 {
        assert!(
            self.is_occupied(index),
            "Dereferencing node {} which has been collected",
            index
        );
        let entry = &mut self.data[index as usize];
        assert!(entry.refs > 0, "Node {} is dereferenced more often than referenced", index);
        entry.refs -= 1;
        entry.refs
    }

    /// Allocate a new cell in the table and return its index.
    pub(crate) fn alloc(&mut self) -> Result<u32> {
        let index = (self.min_free..=self.last_index)
            .find(|&i| !self.data[i].occupied)
            .unwrap_or(self.last_index + 1);

        if index >= self.capacity() {
            return Err(Error::TableFull {
                capacity: self.capacity(),
            });
        }
        self.last_index = self.last_index.max(index);

        let entry = &mut self.data[index];
        entry.occupied = true;
        entry.refs = 0;
        entry.next = 0;
        self.min_free = index + 1;
        self.real_size += 1;

        Ok(index as u32)
    }

    fn free(&mut self, index: u32) {
        let entry = &mut self.data[index as usize];
        entry.occupied = false;
        entry.refs = 0;
        entry.next = 0;
        self.min_free = min(self.min_free, index as usize);
        self.real_size -= 1;
    }

    fn bucket_index(&self, node: &Node) -> usize {
        (node.hash() & self.bitmask) as usize
    }

    /// Return the index of `node`, adding it to the table if it is not there yet.
    pub fn put(&mut self, node: Node) -> Result<u32> {
        let bucket = self.bucket_index(&node);
        let mut index = self.buckets[bucket];
        let mut last = 0;

        while index != 0 {
            let entry = &self.data[index as usize];
            if entry.node == node {
                return Ok(index);
            }
            last = index;
            index = entry.next;
        }

        let i = self.alloc()?;
        self.data[i as usize].node = node;
        if last == 0 {
            self.buckets[bucket] = i;
        } else {
            self.data[last as usize].next = i;
        }
        Ok(i)
    }

    /// Drop every node not reachable from a node with a non-zero reference count.
    ///
    /// The terminal (index 1) is always kept. Returns the number of freed nodes.
    pub fn collect_garbage(&mut self) -> usize {
        let mut alive = vec![false; self.last_index + 1];
        let mut stack: Vec<u32> = (1..=self.last_index as u32)
            .filter(|&i| {
                let entry = &self.data[i as usize];
                entry.occupied && (entry.refs > 0 || i == 1)
            })
            .collect();

        while let Some(i) = stack.pop() {
            if alive[i as usize] {
                continue;
            }
            alive[i as usize] = true;
            if i == 1 {
                continue;
            }
            let node = self.data[i as usize].node;
            for child in [node.low.index(), node.high.index()] {
                if !alive[child as usize] {
                    stack.push(child);
                }
            }
        }

        let mut freed = 0;
        for bucket in 0..self.buckets.len() {
            let mut index = self.buckets[bucket];
            let mut head = 0;
            let mut tail = 0;
            while index != 0 {
                let next = self.data[index as usize].next;
                if alive[index as usize] {
                    if tail == 0 {
                        head = index;
                    } else {
                        self.data[tail as usize].next = index;
                    }
                    tail = index;
                } else {
                    self.free(index);
                    freed += 1;
                }
                index = next;
            }
            if tail != 0 {
                self.data[tail as usize].next = 0;
            }
            self.buckets[bucket] = head;
        }
        freed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table_with_terminal(bits: usize) -> NodeTable {
        let mut table = NodeTable::new(bits);
        assert_eq!(table.alloc().unwrap(), 1);
        table
    }

    #[test]
    fn test_alloc() {
        let mut table = NodeTable::new(2);
        assert_eq!(table.alloc().unwrap(), 1);
        assert_eq!(table.alloc().unwrap(), 2);
        assert_eq!(table.alloc().unwrap(), 3);
    }

    #[test]
    fn test_alloc_too_much() {
        let mut table = NodeTable::new(2);
        for _ in 0..3 {
            table.alloc().unwrap();
        }
        assert!(matches!(table.alloc(), Err(Error::TableFull { capacity: 4 })));
    }

    #[test]
    fn test_put_is_hash_consed() {
        let mut table = table_with_terminal(4);
        let node = Node {
            variable: 1,
            low: Ref::ZERO,
            high: Ref::ONE,
        };
        let a = table.put(node).unwrap();
        let b = table.put(node).unwrap();
        assert_eq!(a, b);
        assert_eq!(table.real_size(), 2);
        assert_eq!(table.node(a), node);
    }

    #[test]
    #[should_panic(expected = "dereferenced more often than referenced")]
    fn test_over_deref_panics() {
        let mut table = table_with_terminal(4);
        let a = table
            .put(Node {
                variable: 1,
                low: Ref::ZERO,
                high: Ref::ONE,
            })
            .unwrap();
        table.inc_ref(a);
        table.dec_ref(a);
        table.dec_ref(a);
    }

    #[test]
    fn test_collect_garbage_keeps_referenced_and_children() {
        let mut table = table_with_terminal(4);
        let x2 = table
            .put(Node {
                variable: 2,
                low: Ref::ZERO,
                high: Ref::ONE,
            })
            .unwrap();
        let x1_and_x2 = table
            .put(Node {
                variable: 1,
                low: Ref::ZERO,
                high: Ref::positive(x2),
            })
            .unwrap();
        let dead = table
            .put(Node {
                variable: 3,
                low: Ref::ZERO,
                high: Ref::ONE,
            })
            .unwrap();
        table.inc_ref(x1_and_x2);

        assert_eq!(table.collect_garbage(), 1);
        assert!(table.is_occupied(x1_and_x2));
        assert!(table.is_occupied(x2));
        assert!(!table.is_occupied(dead));

        // The freed cell is reused and the unique table still finds survivors.
        let again = table
            .put(Node {
                variable: 2,
                low: Ref::ZERO,
                high: Ref::ONE,
            })
            .unwrap();
        assert_eq!(again, x2);
        let reused = table
            .put(Node {
                variable: 4,
                low: Ref::ZERO,
                high: Ref::ONE,
            })
            .unwrap();
        assert_eq!(reused, dead);
    }
}
