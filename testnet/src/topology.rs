//! Topology planning: validator count to per-node names, addresses and ports.
//!
//! Everything here is a pure function of the validator count and the
//! [`PortScheme`]; no I/O happens in this module.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::net::{Ipv4Addr, SocketAddrV4};

use crate::config::defaults;
use crate::error::{TestnetError, TestnetResult};

/// Base ports and private subnet from which every slot is derived.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortScheme {
    /// REST API port of validator 0.
    #[serde(default = "default_api_base")]
    pub api_base: u16,
    /// Peer-to-peer port of validator 0.
    #[serde(default = "default_p2p_base")]
    pub p2p_base: u16,
    /// Metrics port of validator 0.
    #[serde(default = "default_metrics_base")]
    pub metrics_base: u16,
    /// Network address of the /24 container subnet.
    #[serde(default = "default_subnet")]
    pub subnet: Ipv4Addr,
    /// Host octet of validator 0 inside the subnet.
    #[serde(default = "default_first_host_octet")]
    pub first_host_octet: u8,
}

fn default_api_base() -> u16 {
    defaults::API_PORT_BASE
}
fn default_p2p_base() -> u16 {
    defaults::P2P_PORT_BASE
}
fn default_metrics_base() -> u16 {
    defaults::METRICS_PORT_BASE
}
fn default_subnet() -> Ipv4Addr {
    defaults::SUBNET
}
fn default_first_host_octet() -> u8 {
    defaults::FIRST_HOST_OCTET
}

impl Default for PortScheme {
    fn default() -> Self {
        Self {
            api_base: default_api_base(),
            p2p_base: default_p2p_base(),
            metrics_base: default_metrics_base(),
            subnet: default_subnet(),
            first_host_octet: default_first_host_octet(),
        }
    }
}

impl PortScheme {
    /// Subnet in CIDR notation, as written into the compose manifest.
    pub fn subnet_cidr(&self) -> String {
        format!("{}/24", self.network_address())
    }

    /// Gateway address of the subnet (host octet 1).
    pub fn gateway(&self) -> Ipv4Addr {
        let [a, b, c, _] = self.subnet.octets();
        Ipv4Addr::new(a, b, c, 1)
    }

    fn network_address(&self) -> Ipv4Addr {
        let [a, b, c, _] = self.subnet.octets();
        Ipv4Addr::new(a, b, c, 0)
    }

    /// Checks that `count` slots fit the scheme without overlapping ranges.
    pub fn validate(&self, count: usize) -> TestnetResult<()> {
        let ranges = [
            ("ports.api_base", self.api_base),
            ("ports.p2p_base", self.p2p_base),
            ("ports.metrics_base", self.metrics_base),
        ];

        for (field, base) in ranges {
            if base == 0 {
                return Err(TestnetError::config(field, "base port must be nonzero"));
            }
            if base as usize + count > u16::MAX as usize + 1 {
                return Err(TestnetError::config(
                    field,
                    format!("{count} ports starting at {base} exceed 65535"),
                ));
            }
        }

        for (i, (field_a, a)) in ranges.iter().enumerate() {
            for (field_b, b) in ranges.iter().skip(i + 1) {
                let (a, b) = (*a as usize, *b as usize);
                if a < b + count && b < a + count {
                    return Err(TestnetError::config(
                        *field_a,
                        format!("port range overlaps `{field_b}` for {count} validators"),
                    ));
                }
            }
        }

        let first = self.first_host_octet as usize;
        if first < 2 || first + count > 255 {
            return Err(TestnetError::config(
                "ports.first_host_octet",
                format!("host octets {first}..{} do not fit the /24 subnet", first + count),
            ));
        }

        Ok(())
    }
}

/// One validator's position in the network.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NodeSlot {
    /// Zero-based validator index.
    pub index: usize,
    /// Service name, `validator-<index>`.
    pub container_name: String,
    /// Address on the private container subnet.
    pub ip: Ipv4Addr,
    /// REST API port, published on the host.
    pub api_port: u16,
    /// Peer port, published on the host.
    pub p2p_port: u16,
    /// Metrics port, published on the host.
    pub metrics_port: u16,
}

impl NodeSlot {
    /// REST endpoint as seen from the host.
    pub fn api_url(&self) -> String {
        format!("http://127.0.0.1:{}", self.api_port)
    }

    /// Peer address other validators dial.
    pub fn p2p_address(&self) -> SocketAddrV4 {
        SocketAddrV4::new(self.ip, self.p2p_port)
    }

    /// The slot's three host ports.
    pub fn ports(&self) -> [u16; 3] {
        [self.api_port, self.p2p_port, self.metrics_port]
    }
}

/// Ordered, immutable set of slots.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Topology {
    scheme: PortScheme,
    slots: Vec<NodeSlot>,
}

impl Topology {
    /// Plans `count` validators with the default port scheme.
    pub fn plan(count: usize) -> TestnetResult<Self> {
        Self::plan_with(PortScheme::default(), count)
    }

    /// Plans `count` validators with an explicit port scheme.
    pub fn plan_with(scheme: PortScheme, count: usize) -> TestnetResult<Self> {
        if !(defaults::MIN_VALIDATORS..=defaults::MAX_VALIDATORS).contains(&count) {
            return Err(TestnetError::config(
                "validators",
                format!(
                    "{count} is outside the supported range {}..={}",
                    defaults::MIN_VALIDATORS,
                    defaults::MAX_VALIDATORS
                ),
            ));
        }
        scheme.validate(count)?;

        let [a, b, c, _] = scheme.subnet.octets();
        let slots = (0..count)
            .map(|index| {
                // Bounds were checked by `validate`.
                let offset = index as u16;
                NodeSlot {
                    index,
                    container_name: format!("validator-{index}"),
                    ip: Ipv4Addr::new(a, b, c, scheme.first_host_octet + index as u8),
                    api_port: scheme.api_base + offset,
                    p2p_port: scheme.p2p_base + offset,
                    metrics_port: scheme.metrics_base + offset,
                }
            })
            .collect();

        Ok(Self { scheme, slots })
    }

    /// Number of validators.
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// Always false for a planned topology; present for API symmetry.
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// All slots in index order.
    pub fn slots(&self) -> &[NodeSlot] {
        &self.slots
    }

    /// Slot for validator `index`.
    pub fn slot(&self, index: usize) -> TestnetResult<&NodeSlot> {
        self.slots
            .get(index)
            .ok_or(TestnetError::ValidatorIndexOutOfRange {
                index,
                count: self.slots.len(),
            })
    }

    /// The scheme the slots were derived from.
    pub fn scheme(&self) -> &PortScheme {
        &self.scheme
    }

    /// Every host port the network publishes.
    pub fn host_ports(&self) -> Vec<u16> {
        self.slots.iter().flat_map(NodeSlot::ports).collect()
    }

    /// True when no two slots share an address or a port.
    pub fn is_injective(&self) -> bool {
        let ports = self.host_ports();
        let unique_ports: HashSet<_> = ports.iter().collect();
        let unique_ips: HashSet<_> = self.slots.iter().map(|s| s.ip).collect();
        unique_ports.len() == ports.len() && unique_ips.len() == self.slots.len()
    }
}
