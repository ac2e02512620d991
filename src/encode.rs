//! Memoizing encoder of bit-prefix matches.
//!
//! A [`PrefixTrie`] follows the sequence of bit decisions of a match. Each
//! trie node stores the conjunction of the literals on its path and owns one
//! reference to it, so matches sharing a prefix reuse the same partial
//! conjunction instead of rebuilding it.

use crate::bdd::Bdd;
use crate::error::Result;
use crate::reference::Ref;

struct TrieNode {
    result: Ref,
    /// Child for bit value `0` and `1`; `0` means absent (the root is never a child).
    children: [u32; 2],
}

pub(crate) struct PrefixTrie {
    nodes: Vec<TrieNode>,
}

impl PrefixTrie {
    pub const ROOT: u32 = 0;

    pub fn new() -> Self {
        Self {
            nodes: vec![TrieNode {
                result: Ref::ONE,
                children: [0, 0],
            }],
        }
    }

    pub fn result(&self, at: u32) -> Ref {
        self.nodes[at as usize].result
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Descend from `at` along `bit`, conjoining `literal` if the child is new.
    pub fn child(&mut self, bdd: &mut Bdd, at: u32, bit: bool, literal: Ref) -> Result<u32> {
        let slot = bit as usize;
        let existing = self.nodes[at as usize].children[slot];
        if existing != 0 {
            return Ok(existing);
        }

        let result = bdd.apply_and(self.result(at), literal)?;
        bdd.inc_ref(result);

        let index = self.nodes.len() as u32;
        self.nodes.push(TrieNode {
            result,
            children: [0, 0],
        });
        self.nodes[at as usize].children[slot] = index;
        Ok(index)
    }

    /// Walk (and extend) the trie along `bits`, literal `i` testing `vars[i]`.
    pub fn walk(
        &mut self,
        bdd: &mut Bdd,
        vars: &[Ref],
        bits: impl IntoIterator<Item = bool>,
    ) -> Result<u32> {
        let mut at = Self::ROOT;
        for (i, bit) in bits.into_iter().enumerate() {
            let literal = if bit { vars[i] } else { -vars[i] };
            at = self.child(bdd, at, bit, literal)?;
        }
        Ok(at)
    }
}
