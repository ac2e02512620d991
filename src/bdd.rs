//! Single-threaded BDD core behind [`PredicateEngine`][crate::engine::PredicateEngine].
//!
//! Complement edges: a negated [`Ref`] denotes the negation of the node it
//! points to, and the high edge of a stored node is never negated. Together
//! with the unique table this keeps every boolean function canonical.
//!
//! Nothing here knows about ownership: callers are responsible for bumping
//! reference counts of results they intend to keep, before anything can
//! trigger [`Bdd::collect_garbage`].

use std::collections::HashMap;

use log::debug;
use num_bigint::BigUint;

use crate::cache::Cache;
use crate::error::Result;
use crate::reference::Ref;
use crate::table::{Node, NodeTable};

pub(crate) struct Bdd {
    table: NodeTable,
    cache: Cache<(Ref, Ref, Ref), Ref>,
    gc_runs: usize,
}

impl Bdd {
    pub fn new(storage_bits: usize, cache_bits: usize) -> Self {
        let mut table = NodeTable::new(storage_bits);

        // Allocate the terminal node:
        let one = table.alloc().unwrap_or(0);
        assert_eq!(one, Ref::ONE.index()); // Make sure the terminal node is (1).

        Self {
            table,
            cache: Cache::new(cache_bits),
            gc_runs: 0,
        }
    }

    pub fn table(&self) -> &NodeTable {
        &self.table
    }

    pub fn cache(&self) -> &Cache<(Ref, Ref, Ref), Ref> {
        &self.cache
    }

    pub fn gc_runs(&self) -> usize {
        self.gc_runs
    }

    pub fn inc_ref(&mut self, node: Ref) {
        if !node.is_terminal() {
            self.table.inc_ref(node.index());
        }
    }

    pub fn dec_ref(&mut self, node: Ref) {
        if !node.is_terminal() {
            self.table.dec_ref(node.index());
        }
    }

    pub fn refs(&self, node: Ref) -> u32 {
        if node.is_terminal() {
            0
        } else {
            self.table.refs(node.index())
        }
    }

    pub fn variable(&self, node: Ref) -> u32 {
        self.table.variable(node.index())
    }

    pub fn low_node(&self, node: Ref) -> Ref {
        let low = self.table.node(node.index()).low;
        if node.is_negated() {
            -low
        } else {
            low
        }
    }

    pub fn high_node(&self, node: Ref) -> Ref {
        let high = self.table.node(node.index()).high;
        if node.is_negated() {
            -high
        } else {
            high
        }
    }

    pub fn mk_node(&mut self, v: u32, low: Ref, high: Ref) -> Result<Ref> {
        assert_ne!(v, 0, "Variable index should not be zero");

        // Handle canonicity
        if high.is_negated() {
            return Ok(-self.mk_node(v, -low, -high)?);
        }

        // Handle duplicates
        if low == high {
            return Ok(low);
        }

        let i = self.table.put(Node {
            variable: v,
            low,
            high,
        })?;
        Ok(Ref::positive(i))
    }

    pub fn mk_var(&mut self, v: u32) -> Result<Ref> {
        self.mk_node(v, Ref::ZERO, Ref::ONE)
    }

    fn top_cofactors(&self, node: Ref, v: u32) -> (Ref, Ref) {
        if node.is_terminal() || v < self.variable(node) {
            return (node, node);
        }
        debug_assert_eq!(v, self.variable(node));
        (self.low_node(node), self.high_node(node))
    }

    /// Apply the ITE operation to the arguments.
    ///
    /// ```text
    /// ITE(x, y, z) = (x ∧ y) ∨ (¬x ∧ z)
    /// ```
    pub fn apply_ite(&mut self, f: Ref, g: Ref, h: Ref) -> Result<Ref> {
        // Base cases:
        //   ite(1,G,H) => G
        //   ite(0,G,H) => H
        if f == Ref::ONE {
            return Ok(g);
        }
        if f == Ref::ZERO {
            return Ok(h);
        }

        // From now on, F is known not to be a constant.
        //   ite(F,G,G) => G
        //   ite(F,1,0) => F
        //   ite(F,0,1) => ~F
        if g == h {
            return Ok(g);
        }
        if g == Ref::ONE && h == Ref::ZERO {
            return Ok(f);
        }
        if g == Ref::ZERO && h == Ref::ONE {
            return Ok(-f);
        }

        // Standard triples:
        //   ite(F,F,H) => ite(F,1,H)
        //   ite(F,G,F) => ite(F,G,0)
        //   ite(F,~F,H) => ite(F,0,H)
        //   ite(F,G,~F) => ite(F,G,1)
        if g == f {
            return self.apply_ite(f, Ref::ONE, h);
        }
        if h == f {
            return self.apply_ite(f, g, Ref::ZERO);
        }
        if g == -f {
            return self.apply_ite(f, Ref::ZERO, h);
        }
        if h == -f {
            return self.apply_ite(f, g, Ref::ONE);
        }

        let i = self.variable(f);
        let j = self.variable(g);
        let k = self.variable(h);

        // Equivalent pairs (choose the one with the lowest top variable):
        //   ite(F,1,H) == ite(H,1,F) == F ∨ H
        //   ite(F,G,0) == ite(G,F,0) == F ∧ G
        if g == Ref::ONE && k != 0 && k < i {
            return self.apply_ite(h, Ref::ONE, f);
        }
        if h == Ref::ZERO && j != 0 && j < i {
            return self.apply_ite(g, f, Ref::ZERO);
        }

        // Make sure the first two pointers (f and g) are regular (not negated)
        let (mut f, mut g, mut h) = (f, g, h);

        // ite(~F,G,H) => ite(F,H,G)
        if f.is_negated() {
            f = -f;
            std::mem::swap(&mut g, &mut h);
        }

        // ite(F,~G,H) => ~ite(F,G,~H)
        let mut n = false;
        if g.is_negated() {
            n = true;
            g = -g;
            h = -h;
        }

        let key = (f, g, h);
        if let Some(res) = self.cache.get(&key) {
            return Ok(if n { -res } else { res });
        }

        // Determine the top variable:
        let mut m = i;
        if j != 0 {
            m = m.min(j);
        }
        if k != 0 {
            m = m.min(k);
        }

        let (f0, f1) = self.top_cofactors(f, m);
        let (g0, g1) = self.top_cofactors(g, m);
        let (h0, h1) = self.top_cofactors(h, m);

        let e = self.apply_ite(f0, g0, h0)?;
        let t = self.apply_ite(f1, g1, h1)?;

        let res = self.mk_node(m, e, t)?;
        self.cache.insert(key, res);

        Ok(if n { -res } else { res })
    }

    pub fn apply_and(&mut self, u: Ref, v: Ref) -> Result<Ref> {
        self.apply_ite(u, v, Ref::ZERO)
    }

    pub fn apply_or(&mut self, u: Ref, v: Ref) -> Result<Ref> {
        self.apply_ite(u, Ref::ONE, v)
    }

    /// `u ∧ ¬v`
    pub fn apply_diff(&mut self, u: Ref, v: Ref) -> Result<Ref> {
        self.apply_ite(u, -v, Ref::ZERO)
    }

    /// Number of satisfying assignments over `num_vars` variables.
    pub fn sat_count(&self, node: Ref, num_vars: u32) -> BigUint {
        let max = BigUint::from(1u32) << num_vars as usize;
        let mut cache = HashMap::new();
        self.sat_count_(node, &max, &mut cache)
    }

    fn sat_count_(&self, node: Ref, max: &BigUint, cache: &mut HashMap<Ref, BigUint>) -> BigUint {
        if node == Ref::ZERO {
            return BigUint::ZERO;
        } else if node == Ref::ONE {
            return max.clone();
        }

        if let Some(count) = cache.get(&node) {
            return count.clone();
        }

        let stored = self.table.node(node.index());
        let count_low = self.sat_count_(stored.low, max, cache);
        let count_high = self.sat_count_(stored.high, max, cache);

        let count: BigUint = (count_low + count_high) >> 1;
        let count = if node.is_negated() { max - count } else { count };

        cache.insert(node, count.clone());
        count
    }

    /// Free every node unreachable from a referenced node.
    ///
    /// Invalidates all unreferenced [`Ref`]s and the computed table.
    pub fn collect_garbage(&mut self) -> usize {
        self.cache.clear();
        let before = self.table.real_size();
        let freed = self.table.collect_garbage();
        self.gc_runs += 1;
        debug!(
            "Collected garbage: freed {} of {} nodes",
            freed, before
        );
        freed
    }

    pub fn to_bracket_string(&self, node: Ref) -> String {
        if node == Ref::ZERO {
            return "(0)".to_string();
        } else if node == Ref::ONE {
            return "(1)".to_string();
        }

        format!(
            "{}:(x{}, {}, {})",
            node,
            self.variable(node),
            self.to_bracket_string(self.high_node(node)),
            self.to_bracket_string(self.low_node(node))
        )
    }
}

#[cfg(test)]
mod tests {
    use test_log::test;

    use super::*;

    fn bdd() -> Bdd {
        Bdd::new(12, 8)
    }

    #[test]
    fn test_var() {
        let mut bdd = bdd();

        let x = bdd.mk_var(1).unwrap();

        assert_eq!(bdd.variable(x), 1);
        assert_eq!(bdd.high_node(x), Ref::ONE);
        assert_eq!(bdd.low_node(x), Ref::ZERO);
        assert_eq!(bdd.high_node(-x), Ref::ZERO);
        assert_eq!(bdd.low_node(-x), Ref::ONE);
    }

    #[test]
    fn test_de_morgan_and() {
        let mut bdd = bdd();

        let x = bdd.mk_var(1).unwrap();
        let y = bdd.mk_var(2).unwrap();

        let f = -bdd.apply_and(x, y).unwrap();
        let g = bdd.apply_or(-x, -y).unwrap();
        assert_eq!(f, g);
    }

    #[test]
    fn test_diff() {
        let mut bdd = bdd();

        let x = bdd.mk_var(1).unwrap();
        let y = bdd.mk_var(2).unwrap();

        let f = bdd.apply_diff(x, y).unwrap();
        let g = bdd.apply_and(x, -y).unwrap();
        assert_eq!(f, g);
        assert_eq!(bdd.apply_diff(x, x).unwrap(), Ref::ZERO);
        assert_eq!(bdd.apply_diff(x, Ref::ZERO).unwrap(), x);
    }

    #[test]
    fn test_apply_ite_terminal_cases() {
        let mut bdd = bdd();

        let g = bdd.mk_var(2).unwrap();
        let h = bdd.mk_var(3).unwrap();
        assert_eq!(bdd.apply_ite(Ref::ONE, g, h).unwrap(), g);
        assert_eq!(bdd.apply_ite(Ref::ZERO, g, h).unwrap(), h);

        let f = bdd.mk_var(1).unwrap();
        assert_eq!(bdd.apply_ite(f, g, g).unwrap(), g);
        assert_eq!(bdd.apply_ite(f, Ref::ONE, Ref::ZERO).unwrap(), f);
        assert_eq!(bdd.apply_ite(f, Ref::ZERO, Ref::ONE).unwrap(), -f);
    }

    #[test]
    fn test_or_is_commutative() {
        let mut bdd = bdd();

        let x1 = bdd.mk_var(1).unwrap();
        let x2 = bdd.mk_var(2).unwrap();
        let x3 = bdd.mk_var(3).unwrap();

        let a = bdd.apply_and(x1, -x3).unwrap();
        let b = bdd.apply_and(x2, x3).unwrap();
        let f = bdd.apply_or(a, b).unwrap();
        assert_eq!(f, bdd.apply_or(b, a).unwrap());
        println!("f = {}", bdd.to_bracket_string(f));
    }

    #[test]
    fn test_sat_count() {
        let mut bdd = bdd();

        let x1 = bdd.mk_var(1).unwrap();
        let x2 = bdd.mk_var(2).unwrap();
        let f = bdd.apply_and(x1, x2).unwrap();

        assert_eq!(bdd.sat_count(f, 3), BigUint::from(2u32));
        assert_eq!(bdd.sat_count(-f, 3), BigUint::from(6u32));
        assert_eq!(bdd.sat_count(Ref::ONE, 3), BigUint::from(8u32));
        assert_eq!(bdd.sat_count(Ref::ZERO, 3), BigUint::ZERO);
    }

    #[test]
    fn test_collect_garbage_keeps_referenced() {
        let mut bdd = bdd();

        let x1 = bdd.mk_var(1).unwrap();
        let x2 = bdd.mk_var(2).unwrap();
        let f = bdd.apply_and(x1, x2).unwrap();
        bdd.inc_ref(f);

        bdd.collect_garbage();
        assert_eq!(bdd.gc_runs(), 1);
        assert_eq!(bdd.variable(f), 1);
        assert!(bdd.cache().is_empty());

        // Rebuilding the same function finds the surviving node.
        let x1 = bdd.mk_var(1).unwrap();
        let x2 = bdd.mk_var(2).unwrap();
        assert_eq!(bdd.apply_and(x1, x2).unwrap(), f);
    }
}
