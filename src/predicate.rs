//! Owned predicate handles.

use std::fmt::{Debug, Formatter};
use std::hash::{Hash, Hasher};

use crate::engine::PredicateEngine;
use crate::reference::Ref;

/// One unit of ownership of a predicate node.
///
/// `Clone` takes another reference, `Drop` releases this one, so a
/// `Predicate` can be moved between tables, aggregators and local variables
/// without manual bookkeeping.
///
/// Equality and hashing compare node *identity*: two handles are equal when
/// they point to the same node of the same engine.
pub struct Predicate {
    engine: PredicateEngine,
    node: Ref,
}

impl Predicate {
    /// Adopt one already-taken reference to `node`.
    pub fn from_raw(engine: PredicateEngine, node: Ref) -> Self {
        Self { engine, node }
    }

    /// Give up ownership without releasing it: the caller becomes responsible
    /// for a matching [`PredicateEngine::deref_node`].
    pub fn into_raw(self) -> Ref {
        let node = self.node;
        self.engine.ref_node(node);
        node
    }

    pub fn node(&self) -> Ref {
        self.node
    }

    pub fn engine(&self) -> &PredicateEngine {
        &self.engine
    }

    pub fn is_false(&self) -> bool {
        self.node == Ref::ZERO
    }

    pub fn is_true(&self) -> bool {
        self.node == Ref::ONE
    }
}

impl Clone for Predicate {
    fn clone(&self) -> Self {
        self.engine.ref_node(self.node);
        Self {
            engine: self.engine.clone(),
            node: self.node,
        }
    }
}

impl Drop for Predicate {
    fn drop(&mut self) {
        self.engine.deref_node(self.node);
    }
}

impl PartialEq for Predicate {
    fn eq(&self, other: &Self) -> bool {
        self.node == other.node && self.engine.same_engine(&other.engine)
    }
}

impl Eq for Predicate {}

impl Hash for Predicate {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.node.hash(state);
    }
}

impl Debug for Predicate {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        if self.is_true() {
            write!(f, "Predicate(TRUE)")
        } else if self.is_false() {
            write!(f, "Predicate(FALSE)")
        } else {
            write!(f, "Predicate({})", self.node)
        }
    }
}
