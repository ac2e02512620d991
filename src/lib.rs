//! # inverse-model: incremental equivalence classes of network forwarding
//!
//! **`inverse-model`** maintains a partition of the packet-header space into
//! **equivalence classes** (ECs): maximal sets of headers that every device
//! forwards the same way. Each class is a boolean predicate over header bits,
//! mapped to the vector of per-device output ports its packets take.
//!
//! When rules are inserted or deleted, the partition is updated incrementally
//! instead of being recomputed from scratch.
//!
//! ## How an update works
//!
//! 1. For every changed rule, the model computes the header region whose action
//!    changes and the port it moves to, taking rule priorities into account.
//! 2. The deltas are aggregated into **conflict-free** groups: disjoint regions,
//!    each with the per-device port reassignments that apply to it.
//! 3. Every EC intersecting a group is split, and the intersection moves to the
//!    derived port vector. Classes landing on the same vector are merged.
//!
//! ## Predicates
//!
//! Predicates are nodes of a shared, reference-counted BDD with complement
//! edges, managed by [`PredicateEngine`][crate::engine::PredicateEngine].
//! A [`Predicate`][crate::predicate::Predicate] owns one reference to its node:
//! cloning takes another, dropping releases it.
//!
//! ## Basic Usage
//!
//! ```rust
//! use inverse_model::engine::{EngineConfig, PredicateEngine};
//! use inverse_model::model::InverseModel;
//! use inverse_model::rule::{DeviceId, Port, Rule};
//!
//! let engine = PredicateEngine::new(EngineConfig::default().with_storage_bits(16));
//! let d = DeviceId::new(0);
//! let mut model = InverseModel::new(engine, [d]);
//!
//! // Send 10.0.0.0/8 to port `eth1`.
//! let rule = Rule::ipv4(d, [10, 0, 0, 0], 8, 10, Port::new(d, "eth1"));
//! let moved = model.insert_rules(&[rule.clone()])?;
//! assert_eq!(moved.len(), 1);
//! assert_eq!(model.ec_count(), 2);
//!
//! // Deleting it merges the classes back.
//! model.delete_rules(&[rule])?;
//! assert_eq!(model.ec_count(), 1);
//! assert!(model.verify_partition()?);
//! # Ok::<(), inverse_model::error::Error>(())
//! ```
//!
//! ## Core Components
//!
//! - **[`engine`]**: the predicate engine and the prefix encoder.
//! - **[`changes`]**: two-stage conflict-free aggregation of deltas.
//! - **[`model`]**: the inverse model itself.
//! - **[`overlap`]** and **[`ports`]**: the rule index and port-vector registry
//!   the model is generic over.

pub(crate) mod bdd;
pub(crate) mod cache;
pub mod changes;
pub(crate) mod encode;
pub mod engine;
pub mod error;
pub mod model;
pub mod overlap;
pub mod ports;
pub mod predicate;
pub mod reference;
pub mod rule;
pub mod shared;
pub(crate) mod table;
pub(crate) mod utils;

pub use error::{Error, Result};
