use thiserror::Error;

use crate::rule::{DeviceId, Port};

#[derive(Debug, Error)]
pub enum Error {
    /// The node table stayed full even after garbage collection.
    #[error("predicate node table is full ({capacity} nodes)")]
    TableFull { capacity: usize },

    #[error("prefix length {len} exceeds the {width}-bit header")]
    PrefixTooLong { len: u32, width: u32 },

    #[error("source suffix length {len} exceeds the {width} source bits")]
    SuffixTooLong { len: u32, width: u32 },

    #[error("device {0} is not part of the model")]
    UnknownDevice(DeviceId),

    /// A rule must forward to a port of its own device.
    #[error("rule on {device} forwards to port {port} of another device")]
    ForeignPort { device: DeviceId, port: Port },

    /// A writer panicked while holding the shared model.
    #[error("inverse model lock is poisoned")]
    Poisoned,
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
