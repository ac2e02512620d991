//! Interned port vectors.
//!
//! A port vector records, for every device of the model, the output port a
//! class of packets takes. Vectors are immutable and interned, so two vectors
//! with the same contents are the same [`PortVector`] handle.

use std::collections::{BTreeMap, HashMap};
use std::fmt::{Display, Formatter};
use std::sync::{Arc, Mutex, PoisonError};

use crate::rule::{DeviceId, Port};

#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct PortVector(u32);

impl PortVector {
    pub fn id(self) -> u32 {
        self.0
    }
}

impl Display for PortVector {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

pub trait PortVectorRegistry {
    fn create(&self, ports: Vec<Port>) -> PortVector;

    /// Derive a vector from `base` with the given per-device overrides.
    fn with_changes(&self, base: PortVector, changes: &BTreeMap<DeviceId, Port>) -> PortVector;

    fn members(&self, vector: PortVector) -> Arc<[Port]>;
}

#[derive(Default)]
struct Interner {
    vectors: Vec<Arc<[Port]>>,
    ids: HashMap<Arc<[Port]>, u32>,
}

impl Interner {
    fn intern(&mut self, ports: Vec<Port>) -> PortVector {
        let ports: Arc<[Port]> = ports.into();
        if let Some(&id) = self.ids.get(&ports) {
            return PortVector(id);
        }
        let id = self.vectors.len() as u32;
        self.vectors.push(ports.clone());
        self.ids.insert(ports, id);
        PortVector(id)
    }
}

/// Registry keeping every distinct vector alive for its own lifetime.
///
/// Vectors are stored sorted by device, one port per device.
#[derive(Default)]
pub struct InternedPorts {
    inner: Mutex<Interner>,
}

impl InternedPorts {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.lock().vectors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Interner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl PortVectorRegistry for InternedPorts {
    fn create(&self, mut ports: Vec<Port>) -> PortVector {
        ports.sort_by_key(|p| p.device());
        ports.dedup_by_key(|p| p.device());
        self.lock().intern(ports)
    }

    fn with_changes(&self, base: PortVector, changes: &BTreeMap<DeviceId, Port>) -> PortVector {
        let mut inner = self.lock();
        let mut ports = inner.vectors[base.0 as usize].to_vec();
        for (&device, port) in changes {
            match ports.binary_search_by_key(&device, |p| p.device()) {
                Ok(i) => ports[i] = port.clone(),
                Err(i) => ports.insert(i, port.clone()),
            }
        }
        inner.intern(ports)
    }

    fn members(&self, vector: PortVector) -> Arc<[Port]> {
        self.lock().vectors[vector.0 as usize].clone()
    }
}
