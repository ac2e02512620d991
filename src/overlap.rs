//! Per-device index of installed rules, answering "which rules may overlap this one".

use crate::rule::Rule;

pub trait OverlapIndex {
    fn insert(&mut self, rule: Rule);

    /// Returns `false` if the rule was not indexed.
    fn remove(&mut self, rule: &Rule) -> bool;

    /// Every indexed rule (other than `rule` itself) whose match may intersect
    /// `rule`'s match, in no particular order. May over-approximate.
    fn overlapping(&self, rule: &Rule) -> Vec<&Rule>;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug, Default)]
struct TrieNode {
    children: [Option<u32>; 2],
    rules: Vec<Rule>,
}

/// Binary trie over destination-prefix bits.
///
/// Two destination prefixes intersect iff one is a prefix of the other, so the
/// rules overlapping a rule are those stored on its path from the root plus
/// those stored below it. Source-suffix matches are ignored, which only
/// over-approximates.
///
/// Removing the last rule of a leaf prunes its now-empty path, so the trie
/// holds at most one node per bit of the installed prefixes.
#[derive(Debug)]
pub struct PrefixTrieIndex {
    width: u32,
    nodes: Vec<TrieNode>,
    free: Vec<u32>,
    len: usize,
}

impl PrefixTrieIndex {
    /// Index over `width`-bit destination headers.
    pub fn new(width: u32) -> Self {
        Self {
            width,
            nodes: vec![TrieNode::default()],
            free: Vec::new(),
            len: 0,
        }
    }

    fn bits<'a>(&self, rule: &'a Rule) -> impl Iterator<Item = bool> + 'a {
        let width = self.width;
        let depth = rule.prefix_len().min(width);
        (0..depth).map(move |i| rule.dst().bit((width - 1 - i) as u64))
    }

    /// Nodes from the root down to `rule`'s prefix, with the bit taken into each.
    fn path(&self, rule: &Rule) -> Option<Vec<(usize, bool)>> {
        let mut path = vec![(0, false)];
        let mut at = 0;
        for bit in self.bits(rule) {
            at = self.nodes[at].children[bit as usize]? as usize;
            path.push((at, bit));
        }
        Some(path)
    }

    fn alloc(&mut self) -> usize {
        match self.free.pop() {
            Some(i) => i as usize,
            None => {
                self.nodes.push(TrieNode::default());
                self.nodes.len() - 1
            }
        }
    }

    fn prune(&mut self, mut path: Vec<(usize, bool)>) {
        while path.len() > 1 {
            let (at, bit) = path[path.len() - 1];
            let node = &self.nodes[at];
            if !node.rules.is_empty() || node.children.iter().any(Option::is_some) {
                return;
            }
            path.pop();
            let (parent, _) = path[path.len() - 1];
            self.nodes[parent].children[bit as usize] = None;
            self.free.push(at as u32);
        }
    }
}

impl OverlapIndex for PrefixTrieIndex {
    fn insert(&mut self, rule: Rule) {
        let mut at = 0;
        let bits: Vec<bool> = self.bits(&rule).collect();
        for bit in bits {
            at = match self.nodes[at].children[bit as usize] {
                Some(child) => child as usize,
                None => {
                    let child = self.alloc();
                    self.nodes[at].children[bit as usize] = Some(child as u32);
                    child
                }
            };
        }
        let rules = &mut self.nodes[at].rules;
        if !rules.contains(&rule) {
            rules.push(rule);
            self.len += 1;
        }
    }

    fn remove(&mut self, rule: &Rule) -> bool {
        let Some(path) = self.path(rule) else {
            return false;
        };
        let (at, _) = path[path.len() - 1];
        let rules = &mut self.nodes[at].rules;
        match rules.iter().position(|r| r == rule) {
            Some(i) => {
                rules.swap_remove(i);
                self.len -= 1;
                self.prune(path);
                true
            }
            None => false,
        }
    }

    fn overlapping(&self, rule: &Rule) -> Vec<&Rule> {
        let mut result: Vec<&Rule> = self.nodes[0].rules.iter().collect();

        let mut at = 0;
        for bit in self.bits(rule) {
            match self.nodes[at].children[bit as usize] {
                Some(child) => {
                    at = child as usize;
                    result.extend(self.nodes[at].rules.iter());
                }
                None => {
                    result.retain(|r| *r != rule);
                    return result;
                }
            }
        }

        // Everything below `at` is more specific than `rule`.
        let mut stack: Vec<u32> = self.nodes[at].children.iter().flatten().copied().collect();
        while let Some(i) = stack.pop() {
            let node = &self.nodes[i as usize];
            result.extend(node.rules.iter());
            stack.extend(node.children.iter().flatten().copied());
        }

        result.retain(|r| *r != rule);
        result
    }

    fn len(&self) -> usize {
        self.len
    }
}
