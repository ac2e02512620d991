//! Devices, ports and forwarding rules.

use std::fmt::{Display, Formatter};
use std::net::Ipv4Addr;
use std::sync::Arc;

use num_bigint::BigUint;

/// Stable integer uid of a device; also the deterministic ordering key of
/// per-device reassignments.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct DeviceId(u32);

impl DeviceId {
    pub const fn new(uid: u32) -> Self {
        Self(uid)
    }

    pub const fn uid(self) -> u32 {
        self.0
    }
}

impl Display for DeviceId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "d{}", self.0)
    }
}

/// An output port of a device.
#[derive(Debug, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct Port {
    device: DeviceId,
    name: Arc<str>,
}

impl Port {
    pub const DEFAULT_NAME: &'static str = "default";

    pub fn new(device: DeviceId, name: impl Into<Arc<str>>) -> Self {
        Self {
            device,
            name: name.into(),
        }
    }

    /// The port taken by packets no installed rule matches.
    pub fn default_of(device: DeviceId) -> Self {
        Self::new(device, Self::DEFAULT_NAME)
    }

    pub fn device(&self) -> DeviceId {
        self.device
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl Display for Port {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.device, self.name)
    }
}

/// Match on the `suffix_len` least significant bits of the source address.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub struct SourceMatch {
    pub bits: u32,
    pub suffix_len: u32,
}

impl SourceMatch {
    pub const fn new(bits: u32, suffix_len: u32) -> Self {
        Self { bits, suffix_len }
    }
}

/// A forwarding rule. Two rules with identical fields are the same rule.
#[derive(Debug, Clone, Eq, PartialEq, Hash)]
pub struct Rule {
    device: DeviceId,
    dst: BigUint,
    prefix_len: u32,
    source: Option<SourceMatch>,
    priority: i32,
    out_port: Port,
}

impl Rule {
    /// Priority of the catch-all rule every device starts with.
    pub const DEFAULT_PRIORITY: i32 = -1;

    pub fn new(
        device: DeviceId,
        dst: impl Into<BigUint>,
        prefix_len: u32,
        priority: i32,
        out_port: Port,
    ) -> Self {
        Self {
            device,
            dst: dst.into(),
            prefix_len,
            source: None,
            priority,
            out_port,
        }
    }

    /// IPv4 destination prefix rule, e.g. `Rule::ipv4(d, [10, 0, 0, 0], 8, 10, port)`.
    pub fn ipv4(
        device: DeviceId,
        addr: [u8; 4],
        prefix_len: u32,
        priority: i32,
        out_port: Port,
    ) -> Self {
        Self::new(device, u32::from(Ipv4Addr::from(addr)), prefix_len, priority, out_port)
    }

    /// Catch-all rule sending everything to the device's default port.
    pub fn default_of(device: DeviceId) -> Self {
        Self::new(
            device,
            0u32,
            0,
            Self::DEFAULT_PRIORITY,
            Port::default_of(device),
        )
    }

    pub fn with_source(mut self, source: SourceMatch) -> Self {
        self.source = Some(source);
        self
    }

    pub fn device(&self) -> DeviceId {
        self.device
    }

    pub fn dst(&self) -> &BigUint {
        &self.dst
    }

    pub fn prefix_len(&self) -> u32 {
        self.prefix_len
    }

    pub fn source(&self) -> Option<SourceMatch> {
        self.source
    }

    pub fn priority(&self) -> i32 {
        self.priority
    }

    pub fn out_port(&self) -> &Port {
        &self.out_port
    }
}

impl Display for Rule {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}[{:x}/{}",
            self.device, self.dst, self.prefix_len
        )?;
        if let Some(src) = self.source {
            write!(f, " src {:b}/{}", src.bits, src.suffix_len)?;
        }
        write!(f, " prio {} -> {}]", self.priority, self.out_port)
    }
}
