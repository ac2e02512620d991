//! Conflict-free aggregation of per-rule deltas.
//!
//! Deltas arrive as "region `p` moves from port `old` to port `new`". Stage one
//! unions all deltas with the same destination port. Stage two groups the
//! resulting predicates by *identity* (not semantic equality): every distinct
//! handle becomes one group carrying the reassignments of all devices whose
//! stage-one entry is that very handle.

use std::collections::{BTreeMap, HashMap};

use crate::engine::PredicateEngine;
use crate::error::Result;
use crate::predicate::Predicate;
use crate::rule::{DeviceId, Port};

pub struct ConflictFreeChanges {
    engine: PredicateEngine,
    new_port_to_pred: HashMap<Port, Predicate>,
    pred_to_changes: HashMap<Predicate, BTreeMap<DeviceId, Port>>,
    change_count: usize,
    aggregated: bool,
}

impl ConflictFreeChanges {
    pub fn new(engine: PredicateEngine) -> Self {
        Self {
            engine,
            new_port_to_pred: HashMap::new(),
            pred_to_changes: HashMap::new(),
            change_count: 0,
            aggregated: false,
        }
    }

    /// Record that region `delta` changes its action from `old` to `new`.
    ///
    /// `old == None` means the previous action is unknown and the delta is
    /// always incorporated. A delta that does not change the port is dropped.
    pub fn add(&mut self, delta: Predicate, old: Option<&Port>, new: Port) -> Result<()> {
        assert!(!self.aggregated, "Adding a change to an aggregated batch");

        if old == Some(&new) {
            return Ok(());
        }

        self.union(new, delta)?;
        self.change_count += 1;
        Ok(())
    }

    fn union(&mut self, new: Port, delta: Predicate) -> Result<()> {
        match self.new_port_to_pred.get_mut(&new) {
            Some(existing) => {
                *existing = self.engine.or(existing, &delta)?;
            }
            None => {
                self.new_port_to_pred.insert(new, delta);
            }
        }
        Ok(())
    }

    /// Second aggregation stage. Must be called once, after every `add`.
    pub fn aggregate(&mut self) {
        assert!(!self.aggregated, "Batch is already aggregated");
        self.aggregated = true;

        for (port, pred) in &self.new_port_to_pred {
            self.pred_to_changes
                .entry(pred.clone())
                .or_default()
                .insert(port.device(), port.clone());
        }
    }

    /// Fold the stage-one entries of `other` into this batch.
    ///
    /// Raw counts add up, so a merged batch reports every delta of its parts.
    pub fn merge(&mut self, mut other: ConflictFreeChanges) -> Result<()> {
        assert!(!self.aggregated, "Merging into an aggregated batch");
        for (port, pred) in other.new_port_to_pred.drain() {
            self.union(port, pred)?;
        }
        self.change_count += other.change_count;
        Ok(())
    }

    /// Release every predicate held by the batch. Dropping the batch does the same.
    pub fn release(self) {
        drop(self);
    }

    /// Aggregated groups: a region and the reassignments applied to it.
    ///
    /// Empty until [`aggregate`][Self::aggregate] is called.
    pub fn groups(&self) -> impl Iterator<Item = (&Predicate, &BTreeMap<DeviceId, Port>)> {
        self.pred_to_changes.iter()
    }

    /// Stage-one entries: destination port and the region moving to it.
    pub fn entries(&self) -> impl Iterator<Item = (&Port, &Predicate)> {
        self.new_port_to_pred.iter()
    }

    pub fn get(&self, new: &Port) -> Option<&Predicate> {
        self.new_port_to_pred.get(new)
    }

    pub fn is_empty(&self) -> bool {
        self.new_port_to_pred.is_empty()
    }

    /// Number of accepted raw deltas.
    pub fn raw_len(&self) -> usize {
        self.change_count
    }

    pub fn first_stage_len(&self) -> usize {
        self.new_port_to_pred.len()
    }

    pub fn second_stage_len(&self) -> usize {
        self.pred_to_changes.len()
    }
}
