//! Thread-safe, reference-counted predicate engine.
//!
//! [`PredicateEngine`] is a cheap, clonable handle to one shared BDD manager.
//! Every operation returns an owned [`Predicate`]; dropping the handle
//! releases its reference. Operations from several threads are serialized on
//! one internal lock.
//!
//! ## Variables
//!
//! Variables `0..header_bits` encode the destination header, most significant
//! bit first. Variables `header_bits..header_bits + source_bits` encode the
//! source suffix, least significant bit first.
//!
//! ## Capacity
//!
//! The node table has a fixed capacity of `2^storage_bits` nodes. When an
//! operation runs out of room, the engine collects garbage and retries once;
//! if that is still not enough, the operation fails with [`Error::TableFull`].

use std::fmt::Debug;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use log::debug;
use num_bigint::BigUint;

use crate::bdd::Bdd;
use crate::encode::PrefixTrie;
use crate::error::{Error, Result};
use crate::predicate::Predicate;
use crate::reference::Ref;
use crate::rule::SourceMatch;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineConfig {
    /// Width of the destination header, in bits.
    pub header_bits: u32,
    /// Number of low-order source bits a match may test.
    pub source_bits: u32,
    /// The node table holds `2^storage_bits` nodes.
    pub storage_bits: usize,
    /// Initial size of the computed table, `2^cache_bits`.
    pub cache_bits: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            header_bits: 32,
            source_bits: 8,
            storage_bits: 20,
            cache_bits: 16,
        }
    }
}

impl EngineConfig {
    pub fn with_header_bits(mut self, header_bits: u32) -> Self {
        self.header_bits = header_bits;
        self
    }

    pub fn with_source_bits(mut self, source_bits: u32) -> Self {
        self.source_bits = source_bits;
        self
    }

    pub fn with_storage_bits(mut self, storage_bits: usize) -> Self {
        self.storage_bits = storage_bits;
        self
    }

    pub fn with_cache_bits(mut self, cache_bits: usize) -> Self {
        self.cache_bits = cache_bits;
        self
    }

    pub fn num_vars(&self) -> u32 {
        self.header_bits + self.source_bits
    }
}

/// Snapshot of engine counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineStats {
    pub live_nodes: usize,
    pub capacity: usize,
    pub cache_hits: usize,
    pub cache_misses: usize,
    pub gc_runs: usize,
    pub op_count: u64,
    /// Nodes of the destination and source encoder tries.
    pub encoder_nodes: usize,
}

struct State {
    bdd: Bdd,
    vars: Vec<Ref>,
    dst: PrefixTrie,
    src: PrefixTrie,
}

struct Inner {
    config: EngineConfig,
    state: Mutex<State>,
    op_count: AtomicU64,
}

#[derive(Clone)]
pub struct PredicateEngine {
    inner: Arc<Inner>,
}

impl Default for PredicateEngine {
    fn default() -> Self {
        Self::new(EngineConfig::default())
    }
}

impl Debug for PredicateEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let stats = self.stats();
        f.debug_struct("PredicateEngine")
            .field("config", &self.inner.config)
            .field("live_nodes", &stats.live_nodes)
            .field("capacity", &stats.capacity)
            .finish()
    }
}

impl PredicateEngine {
    /// # Panics
    ///
    /// Panics if the configuration has no header bits, more than 32 source
    /// bits, or a node table too small to hold every variable.
    pub fn new(config: EngineConfig) -> Self {
        assert!(config.header_bits > 0, "Header should have at least one bit");
        assert!(config.source_bits <= 32, "At most 32 source bits are supported");
        assert!(
            config.storage_bits <= 31,
            "Storage bits should be in the range 0..=31"
        );
        assert!(
            (1usize << config.storage_bits) > config.num_vars() as usize + 1,
            "Node table cannot hold {} variables",
            config.num_vars()
        );

        let mut bdd = Bdd::new(config.storage_bits, config.cache_bits);
        let mut vars = Vec::with_capacity(config.num_vars() as usize);
        for v in 1..=config.num_vars() {
            // Capacity was checked above, so variables always fit.
            let x = bdd.mk_var(v).unwrap_or(Ref::ONE);
            assert!(!x.is_terminal(), "Failed to allocate variable {}", v);
            bdd.inc_ref(x);
            vars.push(x);
        }

        Self {
            inner: Arc::new(Inner {
                config,
                state: Mutex::new(State {
                    bdd,
                    vars,
                    dst: PrefixTrie::new(),
                    src: PrefixTrie::new(),
                }),
                op_count: AtomicU64::new(0),
            }),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    pub fn num_vars(&self) -> u32 {
        self.inner.config.num_vars()
    }

    pub(crate) fn same_engine(&self, other: &PredicateEngine) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    // A panic while holding the lock (a violated ownership contract) must not
    // turn every later drop into a second panic.
    fn lock(&self) -> MutexGuard<'_, State> {
        self.inner
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Run `op` under the lock, retrying once after garbage collection if the
    /// node table fills up. The result is referenced before the lock is released.
    fn run(&self, op: impl Fn(&mut State) -> Result<Ref>) -> Result<Predicate> {
        let mut state = self.lock();
        let node = match op(&mut state) {
            Err(Error::TableFull { capacity }) => {
                debug!("Node table is full ({} nodes), collecting garbage", capacity);
                state.bdd.collect_garbage();
                op(&mut state)?
            }
            other => other?,
        };
        state.bdd.inc_ref(node);
        drop(state);
        Ok(Predicate::from_raw(self.clone(), node))
    }

    fn check_owner(&self, p: &Predicate) {
        assert!(
            self.same_engine(p.engine()),
            "Predicate {:?} belongs to another engine",
            p
        );
    }

    fn count_op(&self) {
        self.inner.op_count.fetch_add(1, Ordering::Relaxed);
    }

    /// Number of boolean operations executed so far.
    pub fn op_count(&self) -> u64 {
        self.inner.op_count.load(Ordering::Relaxed)
    }

    pub fn one(&self) -> Predicate {
        Predicate::from_raw(self.clone(), Ref::ONE)
    }

    pub fn zero(&self) -> Predicate {
        Predicate::from_raw(self.clone(), Ref::ZERO)
    }

    /// Positive literal of variable `index` (0-based).
    pub fn var(&self, index: u32) -> Predicate {
        assert!(index < self.num_vars(), "Variable {} is out of range", index);
        let mut state = self.lock();
        let x = state.vars[index as usize];
        state.bdd.inc_ref(x);
        drop(state);
        Predicate::from_raw(self.clone(), x)
    }

    pub fn and(&self, a: &Predicate, b: &Predicate) -> Result<Predicate> {
        self.check_owner(a);
        self.check_owner(b);
        self.count_op();
        self.run(|s| s.bdd.apply_and(a.node(), b.node()))
    }

    pub fn or(&self, a: &Predicate, b: &Predicate) -> Result<Predicate> {
        self.check_owner(a);
        self.check_owner(b);
        self.count_op();
        self.run(|s| s.bdd.apply_or(a.node(), b.node()))
    }

    /// `a ∧ ¬b`
    pub fn diff(&self, a: &Predicate, b: &Predicate) -> Result<Predicate> {
        self.check_owner(a);
        self.check_owner(b);
        self.count_op();
        self.run(|s| s.bdd.apply_diff(a.node(), b.node()))
    }

    pub fn not(&self, a: &Predicate) -> Predicate {
        self.check_owner(a);
        self.count_op();
        let node = -a.node();
        self.ref_node(node);
        Predicate::from_raw(self.clone(), node)
    }

    /// Encode a destination prefix, optionally restricted by a source suffix.
    ///
    /// Partial conjunctions are memoized in per-field tries, see
    /// [`encode`][crate::encode].
    pub fn encode(
        &self,
        dst: &BigUint,
        prefix_len: u32,
        source: Option<SourceMatch>,
    ) -> Result<Predicate> {
        let config = &self.inner.config;
        if prefix_len > config.header_bits {
            return Err(Error::PrefixTooLong {
                len: prefix_len,
                width: config.header_bits,
            });
        }
        if let Some(src) = source {
            if src.suffix_len > config.source_bits {
                return Err(Error::SuffixTooLong {
                    len: src.suffix_len,
                    width: config.source_bits,
                });
            }
        }

        let header_bits = config.header_bits;
        self.run(|s| {
            let State { bdd, vars, dst: dst_trie, src: src_trie } = s;
            let (dst_vars, src_vars) = vars.split_at(header_bits as usize);

            let bits = (0..prefix_len).map(|i| dst.bit((header_bits - 1 - i) as u64));
            let at = dst_trie.walk(bdd, dst_vars, bits)?;
            let dst_node = dst_trie.result(at);

            match source {
                None => Ok(dst_node),
                Some(src) => {
                    let bits = (0..src.suffix_len).map(|i| (src.bits >> i) & 1 == 1);
                    let at = src_trie.walk(bdd, src_vars, bits)?;
                    bdd.apply_and(dst_node, src_trie.result(at))
                }
            }
        })
    }

    /// Take one more reference to `node`. Constants are not counted.
    pub fn ref_node(&self, node: Ref) {
        self.lock().bdd.inc_ref(node);
    }

    /// Release one reference to `node`.
    ///
    /// # Panics
    ///
    /// Panics if `node` is not referenced.
    pub fn deref_node(&self, node: Ref) {
        self.lock().bdd.dec_ref(node);
    }

    pub fn ref_count(&self, p: &Predicate) -> u32 {
        self.check_owner(p);
        self.lock().bdd.refs(p.node())
    }

    /// Number of header assignments (over all variables) satisfying `p`.
    pub fn sat_count(&self, p: &Predicate) -> BigUint {
        self.check_owner(p);
        self.lock().bdd.sat_count(p.node(), self.num_vars())
    }

    pub fn to_bracket_string(&self, p: &Predicate) -> String {
        self.check_owner(p);
        self.lock().bdd.to_bracket_string(p.node())
    }

    /// Free every node not reachable from a live predicate. Returns the number of freed nodes.
    pub fn collect_garbage(&self) -> usize {
        self.lock().bdd.collect_garbage()
    }

    pub fn stats(&self) -> EngineStats {
        let state = self.lock();
        EngineStats {
            live_nodes: state.bdd.table().real_size(),
            capacity: state.bdd.table().capacity(),
            cache_hits: state.bdd.cache().hits(),
            cache_misses: state.bdd.cache().misses(),
            gc_runs: state.bdd.gc_runs(),
            op_count: self.op_count(),
            encoder_nodes: state.dst.len() + state.src.len(),
        }
    }
}
