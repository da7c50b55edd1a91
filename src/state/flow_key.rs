use std::fmt;
use std::net::IpAddr;

use crate::engine::constants::ip_proto;

/// Network address of one side of a flow.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Address {
    Ip(IpAddr),
    /// Addresses that have no IP form (domain names negotiated by a proxy, test fixtures).
    Opaque(String),
}

impl From<IpAddr> for Address {
    fn from(value: IpAddr) -> Self {
        Address::Ip(value)
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Address::Ip(ip) => write!(f, "{ip}"),
            Address::Opaque(name) => f.write_str(name),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Transport {
    Tcp,
    Udp,
    Other(u8),
}

impl Transport {
    pub fn is_stream(self) -> bool {
        matches!(self, Transport::Tcp)
    }
}

impl From<u8> for Transport {
    fn from(value: u8) -> Self {
        match value {
            ip_proto::TCP => Transport::Tcp,
            ip_proto::UDP => Transport::Udp,
            other => Transport::Other(other),
        }
    }
}

impl From<Transport> for u8 {
    fn from(value: Transport) -> Self {
        match value {
            Transport::Tcp => ip_proto::TCP,
            Transport::Udp => ip_proto::UDP,
            Transport::Other(other) => other,
        }
    }
}

/// One side of a conversation. A `None` port is a wildcard that matches any port.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Endpoint {
    pub address: Address,
    pub port: Option<u16>,
}

impl Endpoint {
    pub fn new(address: impl Into<Address>, port: u16) -> Self {
        Self {
            address: address.into(),
            port: Some(port),
        }
    }

    pub fn any_port(address: impl Into<Address>) -> Self {
        Self {
            address: address.into(),
            port: None,
        }
    }

    pub fn is_wildcard(&self) -> bool {
        self.port.is_none()
    }

    fn without_port(&self) -> Self {
        Self {
            address: self.address.clone(),
            port: None,
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.port {
            Some(port) => write!(f, "{}:{}", self.address, port),
            None => write!(f, "{}:*", self.address),
        }
    }
}

/// Direction-agnostic conversation key.
///
/// The two endpoints are stored in canonical order, so `FlowKey::new(a, b, t)`
/// and `FlowKey::new(b, a, t)` compare and hash identically.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FlowKey {
    low: Endpoint,
    high: Endpoint,
    pub transport: Transport,
}

impl FlowKey {
    pub fn new(a: Endpoint, b: Endpoint, transport: Transport) -> Self {
        if a <= b {
            Self {
                low: a,
                high: b,
                transport,
            }
        } else {
            Self {
                low: b,
                high: a,
                transport,
            }
        }
    }

    pub fn endpoints(&self) -> (&Endpoint, &Endpoint) {
        (&self.low, &self.high)
    }

    pub fn contains(&self, endpoint: &Endpoint) -> bool {
        &self.low == endpoint || &self.high == endpoint
    }

    pub fn has_wildcard(&self) -> bool {
        self.low.is_wildcard() || self.high.is_wildcard()
    }

    /// Keys with one port replaced by a wildcard, in the order a lookup should try them.
    pub fn wildcard_candidates(&self) -> impl Iterator<Item = FlowKey> + '_ {
        let low = (!self.low.is_wildcard())
            .then(|| FlowKey::new(self.low.without_port(), self.high.clone(), self.transport));
        let high = (!self.high.is_wildcard())
            .then(|| FlowKey::new(self.low.clone(), self.high.without_port(), self.transport));
        low.into_iter().chain(high)
    }

    /// Hash of the address pair and transport only. Stable under port wildcards,
    /// which makes it suitable for routing a flow to a shard.
    pub fn address_hash(&self) -> u64 {
        use std::hash::{DefaultHasher, Hash, Hasher};

        let mut hasher = DefaultHasher::new();
        let (first, second) = if self.low.address <= self.high.address {
            (&self.low.address, &self.high.address)
        } else {
            (&self.high.address, &self.low.address)
        };
        first.hash(&mut hasher);
        second.hash(&mut hasher);
        self.transport.hash(&mut hasher);
        hasher.finish()
    }
}

impl fmt::Display for FlowKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let proto = match self.transport {
            Transport::Tcp => "tcp",
            Transport::Udp => "udp",
            Transport::Other(_) => "other",
        };
        write!(f, "{} <-> {} ({})", self.low, self.high, proto)
    }
}
