use std::collections::BTreeMap;
use std::fmt;
use std::net::{Ipv4Addr, Ipv6Addr};
use chrono::{DateTime, Utc};
use serde::{Serialize, Deserialize};

/// A service instance observed through DNS-SD.
/// Identity is `instance_name`; the remaining fields may be updated in place
/// as newer information for the same instance arrives.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceRecord {
    /// Full DNS-SD instance name, e.g. "My Printer._ipp._tcp.local."
    pub instance_name: String,

    /// Target hostname, e.g. "printer.local."; empty when unknown
    pub hostname: String,

    pub addr_ipv4: Option<Ipv4Addr>,

    pub addr_ipv6: Option<Ipv6Addr>,

    pub port: u16,

    /// TTL in seconds
    pub ttl: u32,

    /// TXT record key-value pairs, in announcement order
    pub txt: Vec<(String, String)>,

    /// Time the producer first built this record
    pub first_seen: DateTime<Utc>,
}

impl ServiceRecord {
    pub fn has_hostname(&self) -> bool {
        !self.hostname.is_empty()
    }
}

/// One-line rendering of every field, used for discovery log lines.
impl fmt::Display for ServiceRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "service: {} ipv4: {} ipv6: {}, port: {}, TTL: {}, TXT: [",
            self.instance_name,
            OptAddr(self.addr_ipv4.as_ref()),
            OptAddr(self.addr_ipv6.as_ref()),
            self.port,
            self.ttl,
        )?;
        for (i, (key, value)) in self.txt.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{}={}", key, value)?;
        }
        write!(f, "] hostname: {}", self.hostname)
    }
}

struct OptAddr<'a, T>(Option<&'a T>);

impl<T: fmt::Display> fmt::Display for OptAddr<'_, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0 {
            Some(addr) => addr.fmt(f),
            None => f.write_str("none"),
        }
    }
}

/// A 6-byte link-layer address learned from an ARP reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct HardwareAddress(pub [u8; 6]);

impl fmt::Display for HardwareAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let b = &self.0;
        write!(
            f,
            "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
            b[0], b[1], b[2], b[3], b[4], b[5]
        )
    }
}

/// A UPnP device advertised over SSDP, flattened from its description document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpnpDevice {
    pub udn: String,
    pub device_type: String,
    /// Location of the device description
    pub url_base: String,
    pub friendly_name: String,
    pub manufacturer: String,
    pub model_description: Option<String>,
    pub model_name: String,
    pub services: Vec<UpnpService>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpnpService {
    pub service_type: String,
    pub service_id: String,
}

/// Host address -> devices discovered at that host.
pub type DeviceMap = BTreeMap<String, Vec<UpnpDevice>>;
