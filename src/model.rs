//! The inverse model: a partition of the header space into equivalence classes.
//!
//! Every class (EC) is a predicate mapped to the [`PortVector`] its packets
//! take. The predicates of all classes are pairwise disjoint and cover the
//! whole header space. A batch of rule insertions and deletions is applied in
//! two phases:
//!
//! 1. [`compute_changes`][InverseModel::compute_changes] updates the per-device
//!    rule tables and collects "region moves from port A to port B" deltas into
//!    a [`ConflictFreeChanges`] batch.
//! 2. [`update`][InverseModel::update] aggregates the batch and splits every EC
//!    intersecting a changed region, moving the intersection to the derived
//!    port vector. Classes landing on an existing vector are merged.
//!
//! [`apply_batch`][InverseModel::apply_batch] runs both phases.
//!
//! ## Evaluation order
//!
//! All deltas of a batch are computed against the rule set *after* the batch:
//! new rules are installed and deleted rules are unindexed before any delta is
//! computed. Every delta thus names the port of the region's final owner, and
//! the stage-one entries of one device never overlap.

use std::cmp::Reverse;
use std::collections::hash_map::Entry;
use std::collections::{BTreeMap, HashMap, HashSet};

use log::{debug, info};
use rayon::prelude::*;

use crate::changes::ConflictFreeChanges;
use crate::engine::PredicateEngine;
use crate::error::{Error, Result};
use crate::overlap::{OverlapIndex, PrefixTrieIndex};
use crate::ports::{InternedPorts, PortVector, PortVectorRegistry};
use crate::predicate::Predicate;
use crate::rule::{DeviceId, Port, Rule};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModelConfig {
    /// Compute per-device deltas on the rayon thread pool.
    pub parallel: bool,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self { parallel: true }
    }
}

impl ModelConfig {
    pub fn with_parallel(mut self, parallel: bool) -> Self {
        self.parallel = parallel;
        self
    }
}

/// Sizes observed while applying the last batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UpdateStats {
    pub insertions: usize,
    pub deletions: usize,
    pub raw_changes: usize,
    pub first_stage: usize,
    pub second_stage: usize,
    pub transferred: usize,
    pub ec_count: usize,
}

/// Rules of one device: the overlap index and the match table.
struct DeviceRules<I> {
    index: I,
    matches: HashMap<Rule, Predicate>,
}

#[derive(Default)]
struct DeviceBatch {
    insertions: Vec<Rule>,
    deletions: Vec<Rule>,
}

impl<I: OverlapIndex> DeviceRules<I> {
    /// Overlapping rules with priority accepted by `keep`, highest priority first.
    fn ranked<'a>(&'a self, rule: &Rule, keep: impl Fn(i32) -> bool) -> Vec<(&'a Rule, &'a Predicate)> {
        let mut ranked: Vec<_> = self
            .index
            .overlapping(rule)
            .into_iter()
            .filter(|r| keep(r.priority()))
            .filter_map(|r| self.matches.get(r).map(|p| (r, p)))
            .collect();
        ranked.sort_by_key(|(r, _)| Reverse(r.priority()));
        ranked
    }

    /// Region where `rule` (matching `own`) is the highest-priority match.
    fn exclusive_match(&self, engine: &PredicateEngine, rule: &Rule, own: &Predicate) -> Result<Predicate> {
        let mut hit = own.clone();
        for (_, higher) in self.ranked(rule, |p| p > rule.priority()) {
            if hit.is_false() {
                break;
            }
            hit = engine.diff(&hit, higher)?;
        }
        Ok(hit)
    }

    fn insertion_changes(
        &self,
        engine: &PredicateEngine,
        rule: &Rule,
        changes: &mut ConflictFreeChanges,
    ) -> Result<()> {
        let Some(own) = self.matches.get(rule) else {
            return Ok(());
        };
        let hit = self.exclusive_match(engine, rule, own)?;
        if !hit.is_false() {
            changes.add(hit, None, rule.out_port().clone())?;
        }
        Ok(())
    }

    /// The exclusive region of a deleted rule falls through to the
    /// lower-priority rules overlapping it.
    fn deletion_changes(
        &self,
        engine: &PredicateEngine,
        rule: &Rule,
        own: &Predicate,
        changes: &mut ConflictFreeChanges,
    ) -> Result<()> {
        let mut remaining = self.exclusive_match(engine, rule, own)?;
        for (candidate, matched) in self.ranked(rule, |p| p < rule.priority()) {
            if remaining.is_false() {
                break;
            }
            let claim = engine.and(matched, &remaining)?;
            if claim.is_false() {
                continue;
            }
            remaining = engine.diff(&remaining, &claim)?;
            changes.add(claim, Some(rule.out_port()), candidate.out_port().clone())?;
        }
        if !remaining.is_false() {
            debug!("Part of the region of {} is not matched by any remaining rule", rule);
        }
        Ok(())
    }

    fn apply(&mut self, engine: &PredicateEngine, batch: DeviceBatch) -> Result<ConflictFreeChanges> {
        let mut changes = ConflictFreeChanges::new(engine.clone());

        let mut encoded = Vec::with_capacity(batch.insertions.len());
        for rule in batch.insertions {
            if self.matches.contains_key(&rule) {
                debug!("Rule {} is already installed", rule);
                continue;
            }
            let p = engine.encode(rule.dst(), rule.prefix_len(), rule.source())?;
            encoded.push((rule, p));
        }

        let mut inserted = Vec::with_capacity(encoded.len());
        for (rule, p) in encoded {
            self.index.insert(rule.clone());
            self.matches.insert(rule.clone(), p);
            inserted.push(rule);
        }

        let mut removed = Vec::with_capacity(batch.deletions.len());
        for rule in batch.deletions {
            match self.matches.remove(&rule) {
                Some(p) => {
                    self.index.remove(&rule);
                    removed.push((rule, p));
                }
                None => debug!("Rule {} is not installed, nothing to delete", rule),
            }
        }

        for (rule, own) in &removed {
            self.deletion_changes(engine, rule, own, &mut changes)?;
        }
        for rule in &inserted {
            self.insertion_changes(engine, rule, &mut changes)?;
        }
        Ok(changes)
    }
}

/// Incrementally maintained equivalence classes of a set of devices.
pub struct InverseModel<I = PrefixTrieIndex, R = InternedPorts> {
    engine: PredicateEngine,
    config: ModelConfig,
    devices: BTreeMap<DeviceId, DeviceRules<I>>,
    registry: R,
    ports_to_predicate: HashMap<PortVector, Predicate>,
    last_update: UpdateStats,
}

impl InverseModel {
    /// Model over `devices` with the default overlap index and port registry.
    ///
    /// Every device starts with its catch-all rule, so the model starts with a
    /// single EC: the whole header space sent to every default port.
    pub fn new(engine: PredicateEngine, devices: impl IntoIterator<Item = DeviceId>) -> Self {
        let width = engine.config().header_bits;
        Self::with_components(
            engine,
            ModelConfig::default(),
            devices,
            |_| PrefixTrieIndex::new(width),
            InternedPorts::new(),
        )
    }
}

impl<I, R> InverseModel<I, R>
where
    I: OverlapIndex + Send,
    R: PortVectorRegistry,
{
    pub fn with_components(
        engine: PredicateEngine,
        config: ModelConfig,
        devices: impl IntoIterator<Item = DeviceId>,
        mut index_factory: impl FnMut(DeviceId) -> I,
        registry: R,
    ) -> Self {
        let mut tables = BTreeMap::new();
        for device in devices {
            tables.entry(device).or_insert_with(|| {
                let default = Rule::default_of(device);
                let mut index = index_factory(device);
                index.insert(default.clone());
                DeviceRules {
                    index,
                    matches: HashMap::from([(default, engine.one())]),
                }
            });
        }

        let defaults = tables.keys().map(|&d| Port::default_of(d)).collect();
        let initial = registry.create(defaults);
        let ports_to_predicate = HashMap::from([(initial, engine.one())]);

        Self {
            engine,
            config,
            devices: tables,
            registry,
            ports_to_predicate,
            last_update: UpdateStats {
                ec_count: 1,
                ..Default::default()
            },
        }
    }

    pub fn engine(&self) -> &PredicateEngine {
        &self.engine
    }

    pub fn config(&self) -> &ModelConfig {
        &self.config
    }

    pub fn registry(&self) -> &R {
        &self.registry
    }

    pub fn devices(&self) -> impl Iterator<Item = DeviceId> + '_ {
        self.devices.keys().copied()
    }

    pub fn last_update(&self) -> UpdateStats {
        self.last_update
    }

    pub fn ec_count(&self) -> usize {
        self.ports_to_predicate.len()
    }

    /// Number of installed rules, the per-device catch-all rules included.
    pub fn rule_count(&self) -> usize {
        self.devices.values().map(|d| d.matches.len()).sum()
    }

    /// Match predicate of an installed rule.
    pub fn rule_predicate(&self, rule: &Rule) -> Option<&Predicate> {
        self.devices.get(&rule.device())?.matches.get(rule)
    }

    /// Validate a rule about to be installed.
    fn check_rule(&self, rule: &Rule) -> Result<()> {
        for device in [rule.device(), rule.out_port().device()] {
            if !self.devices.contains_key(&device) {
                return Err(Error::UnknownDevice(device));
            }
        }
        if rule.out_port().device() != rule.device() {
            return Err(Error::ForeignPort {
                device: rule.device(),
                port: rule.out_port().clone(),
            });
        }
        let config = self.engine.config();
        if rule.prefix_len() > config.header_bits {
            return Err(Error::PrefixTooLong {
                len: rule.prefix_len(),
                width: config.header_bits,
            });
        }
        if let Some(src) = rule.source() {
            if src.suffix_len > config.source_bits {
                return Err(Error::SuffixTooLong {
                    len: src.suffix_len,
                    width: config.source_bits,
                });
            }
        }
        Ok(())
    }

    /// Update the rule tables and collect the deltas of one batch.
    ///
    /// A rule present in both lists is dropped from both. The returned batch
    /// is not aggregated yet.
    ///
    /// An invalid insertion rejects the whole batch before anything is
    /// modified. Deletions are not validated: one that does not name an
    /// installed rule is skipped. An engine failure while computing deltas
    /// leaves the rule tables updated but the partition untouched.
    pub fn compute_changes(&mut self, insertions: &[Rule], deletions: &[Rule]) -> Result<ConflictFreeChanges> {
        for rule in insertions {
            self.check_rule(rule)?;
        }

        let inserted: HashSet<&Rule> = insertions.iter().collect();
        let deleted: HashSet<&Rule> = deletions.iter().collect();

        let mut batches: BTreeMap<DeviceId, DeviceBatch> = BTreeMap::new();
        let mut seen = HashSet::new();
        for rule in insertions {
            if !deleted.contains(rule) && seen.insert(rule) {
                batches.entry(rule.device()).or_default().insertions.push(rule.clone());
            }
        }
        seen.clear();
        for rule in deletions {
            if inserted.contains(rule) || !seen.insert(rule) {
                continue;
            }
            if !self.devices.contains_key(&rule.device()) {
                debug!("Rule {} is on an unknown device, nothing to delete", rule);
                continue;
            }
            batches.entry(rule.device()).or_default().deletions.push(rule.clone());
        }

        let engine = &self.engine;
        let work: Vec<(&mut DeviceRules<I>, DeviceBatch)> = self
            .devices
            .iter_mut()
            .filter_map(|(device, rules)| batches.remove(device).map(|batch| (rules, batch)))
            .collect();

        let shards: Vec<ConflictFreeChanges> = if self.config.parallel && work.len() > 1 {
            work.into_par_iter()
                .map(|(rules, batch)| rules.apply(engine, batch))
                .collect::<Result<_>>()?
        } else {
            work.into_iter()
                .map(|(rules, batch)| rules.apply(engine, batch))
                .collect::<Result<_>>()?
        };

        let mut changes = ConflictFreeChanges::new(self.engine.clone());
        for shard in shards {
            changes.merge(shard)?;
        }
        Ok(changes)
    }

    /// Apply a batch of changes to the partition.
    ///
    /// Returns the set of predicates moved to a new port vector. The partition
    /// is replaced after every completed group, so a failure leaves it as it
    /// was after the last completed group.
    pub fn update(&mut self, mut changes: ConflictFreeChanges) -> Result<HashSet<Predicate>> {
        let raw_changes = changes.raw_len();
        let first_stage = changes.first_stage_len();
        changes.aggregate();

        let engine = &self.engine;
        let mut transferred = HashSet::new();
        for (delta, moves) in changes.groups() {
            let mut next = HashMap::with_capacity(self.ports_to_predicate.len() + 1);
            let mut remaining = delta.clone();

            for (&vector, ec) in &self.ports_to_predicate {
                if remaining.is_false() {
                    insert_predicate(engine, &mut next, vector, ec.clone())?;
                    continue;
                }
                let inter = engine.and(ec, &remaining)?;
                if inter.is_false() {
                    insert_predicate(engine, &mut next, vector, ec.clone())?;
                    continue;
                }
                remaining = engine.diff(&remaining, &inter)?;
                if inter != *ec {
                    let rest = engine.diff(ec, &inter)?;
                    if !rest.is_false() {
                        insert_predicate(engine, &mut next, vector, rest)?;
                    }
                }
                let target = self.registry.with_changes(vector, moves);
                transferred.insert(inter.clone());
                insert_predicate(engine, &mut next, target, inter)?;
            }

            self.ports_to_predicate = next;
        }

        self.last_update = UpdateStats {
            raw_changes,
            first_stage,
            second_stage: changes.second_stage_len(),
            transferred: transferred.len(),
            ec_count: self.ports_to_predicate.len(),
            ..self.last_update
        };
        changes.release();
        Ok(transferred)
    }

    /// Insert and delete rules, updating the partition.
    pub fn apply_batch(&mut self, insertions: &[Rule], deletions: &[Rule]) -> Result<HashSet<Predicate>> {
        let changes = self.compute_changes(insertions, deletions)?;
        self.last_update = UpdateStats {
            insertions: insertions.len(),
            deletions: deletions.len(),
            ..Default::default()
        };
        let transferred = self.update(changes)?;

        let stats = self.last_update;
        info!(
            "Applied {} insertions and {} deletions: {} changes, {} -> {} groups, {} transferred, {} ECs",
            stats.insertions,
            stats.deletions,
            stats.raw_changes,
            stats.first_stage,
            stats.second_stage,
            stats.transferred,
            stats.ec_count
        );
        Ok(transferred)
    }

    pub fn insert_rules(&mut self, rules: &[Rule]) -> Result<HashSet<Predicate>> {
        self.apply_batch(rules, &[])
    }

    pub fn delete_rules(&mut self, rules: &[Rule]) -> Result<HashSet<Predicate>> {
        self.apply_batch(&[], rules)
    }

    /// Snapshot of the partition, ordered by port vector.
    pub fn current_partition(&self) -> Vec<(Predicate, PortVector)> {
        let mut partition: Vec<_> = self
            .ports_to_predicate
            .iter()
            .map(|(&vector, p)| (p.clone(), vector))
            .collect();
        partition.sort_by_key(|&(_, vector)| vector);
        partition
    }

    /// For every port, the ECs whose packets leave through it.
    pub fn port_to_predicates(&self) -> HashMap<Port, HashSet<Predicate>> {
        let mut result: HashMap<Port, HashSet<Predicate>> = HashMap::new();
        for (&vector, p) in &self.ports_to_predicate {
            for port in self.registry.members(vector).iter() {
                result.entry(port.clone()).or_default().insert(p.clone());
            }
        }
        result
    }

    /// Port vector of the EC containing every header in `p`, if there is one.
    pub fn vector_of(&self, p: &Predicate) -> Result<Option<PortVector>> {
        for (&vector, ec) in &self.ports_to_predicate {
            if self.engine.diff(p, ec)?.is_false() {
                return Ok(Some(vector));
            }
        }
        Ok(None)
    }

    /// Check that the ECs are non-empty, pairwise disjoint and cover the header space.
    pub fn verify_partition(&self) -> Result<bool> {
        let mut union = self.engine.zero();
        for ec in self.ports_to_predicate.values() {
            if ec.is_false() || !self.engine.and(&union, ec)?.is_false() {
                return Ok(false);
            }
            union = self.engine.or(&union, ec)?;
        }
        Ok(union.is_true())
    }
}

/// Insert `p` under `vector`, unioning with the predicate already there.
fn insert_predicate(
    engine: &PredicateEngine,
    map: &mut HashMap<PortVector, Predicate>,
    vector: PortVector,
    p: Predicate,
) -> Result<()> {
    match map.entry(vector) {
        Entry::Occupied(mut entry) => {
            let merged = engine.or(entry.get(), &p)?;
            entry.insert(merged);
        }
        Entry::Vacant(entry) => {
            entry.insert(p);
        }
    }
    Ok(())
}
