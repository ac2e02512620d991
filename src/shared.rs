//! A model shared between threads.

use std::collections::HashSet;
use std::sync::{Mutex, MutexGuard};

use crate::error::{Error, Result};
use crate::model::InverseModel;
use crate::overlap::{OverlapIndex, PrefixTrieIndex};
use crate::ports::{InternedPorts, PortVector, PortVectorRegistry};
use crate::predicate::Predicate;
use crate::rule::Rule;

/// [`InverseModel`] behind a lock: one writer at a time, batches are applied
/// in lock acquisition order.
///
/// Unlike the engine, a poisoned model is not recovered: a writer that panicked
/// mid-update may have left the partition half-rebuilt, so every later call
/// reports [`Error::Poisoned`].
pub struct SharedModel<I = PrefixTrieIndex, R = InternedPorts> {
    model: Mutex<InverseModel<I, R>>,
}

impl<I, R> SharedModel<I, R>
where
    I: OverlapIndex + Send,
    R: PortVectorRegistry,
{
    pub fn new(model: InverseModel<I, R>) -> Self {
        Self {
            model: Mutex::new(model),
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, InverseModel<I, R>>> {
        self.model.lock().map_err(|_| Error::Poisoned)
    }

    pub fn apply_batch(&self, insertions: &[Rule], deletions: &[Rule]) -> Result<HashSet<Predicate>> {
        self.lock()?.apply_batch(insertions, deletions)
    }

    pub fn current_partition(&self) -> Result<Vec<(Predicate, PortVector)>> {
        Ok(self.lock()?.current_partition())
    }

    pub fn ec_count(&self) -> Result<usize> {
        Ok(self.lock()?.ec_count())
    }

    pub fn verify_partition(&self) -> Result<bool> {
        self.lock()?.verify_partition()
    }

    /// Run `f` with exclusive access to the model.
    pub fn with<T>(&self, f: impl FnOnce(&mut InverseModel<I, R>) -> T) -> Result<T> {
        Ok(f(&mut *self.lock()?))
    }

    pub fn into_inner(self) -> Result<InverseModel<I, R>> {
        self.model.into_inner().map_err(|_| Error::Poisoned)
    }
}
