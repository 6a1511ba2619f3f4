use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Hostname-keyed address lookups used to backfill known records.
pub trait AddressLookup: Send + Sync {
    fn ipv4_address(&self, hostname: &str) -> Option<Ipv4Addr>;
    fn ipv6_address(&self, hostname: &str) -> Option<Ipv6Addr>;
}

#[derive(Debug, Clone, Copy)]
struct Cached<T> {
    addr: T,
    expires: Instant,
}

#[derive(Debug, Default)]
struct HostEntry {
    ipv4: Option<Cached<Ipv4Addr>>,
    ipv6: Option<Cached<Ipv6Addr>>,
}

impl HostEntry {
    fn is_empty(&self) -> bool {
        self.ipv4.is_none() && self.ipv6.is_none()
    }
}

/// Most recent IPv4 and IPv6 address announced for each hostname, each
/// valid until its record TTL runs out. Written by the mDNS browser, read
/// by the reconciler.
#[derive(Debug, Default)]
pub struct HostAddressCache {
    hosts: Mutex<HashMap<String, HostEntry>>,
}

impl HostAddressCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, hostname: &str, addr: IpAddr, ttl: Duration) {
        self.insert_at(hostname, addr, ttl, Instant::now());
    }

    fn insert_at(&self, hostname: &str, addr: IpAddr, ttl: Duration, now: Instant) {
        if hostname.is_empty() {
            return;
        }
        let Ok(mut hosts) = self.hosts.lock() else {
            tracing::error!("Address cache lock poisoned");
            return;
        };
        let entry = hosts.entry(hostname.to_string()).or_default();
        let expires = now + ttl;
        match addr {
            IpAddr::V4(addr) => entry.ipv4 = Some(Cached { addr, expires }),
            IpAddr::V6(addr) => entry.ipv6 = Some(Cached { addr, expires }),
        }
    }

    fn ipv4_at(&self, hostname: &str, now: Instant) -> Option<Ipv4Addr> {
        self.lookup(hostname, now, |entry| &mut entry.ipv4)
    }

    fn ipv6_at(&self, hostname: &str, now: Instant) -> Option<Ipv6Addr> {
        self.lookup(hostname, now, |entry| &mut entry.ipv6)
    }

    /// Expired slots are cleared on read; hosts with no slots left are dropped.
    fn lookup<T: Copy>(
        &self,
        hostname: &str,
        now: Instant,
        slot: impl Fn(&mut HostEntry) -> &mut Option<Cached<T>>,
    ) -> Option<T> {
        let mut hosts = self.hosts.lock().ok()?;
        let entry = hosts.get_mut(hostname)?;
        let cached = slot(entry);
        let addr = match *cached {
            Some(c) if c.expires > now => Some(c.addr),
            _ => None,
        };
        if addr.is_none() {
            *cached = None;
        }
        if entry.is_empty() {
            hosts.remove(hostname);
        }
        addr
    }

    pub fn len(&self) -> usize {
        self.hosts.lock().map(|hosts| hosts.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl AddressLookup for HostAddressCache {
    fn ipv4_address(&self, hostname: &str) -> Option<Ipv4Addr> {
        self.ipv4_at(hostname, Instant::now())
    }

    fn ipv6_address(&self, hostname: &str) -> Option<Ipv6Addr> {
        self.ipv6_at(hostname, Instant::now())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const HOST: &str = "printer.local.";

    #[test]
    fn test_lookup_within_ttl() {
        let cache = HostAddressCache::new();
        let now = Instant::now();
        cache.insert_at(HOST, "192.168.1.50".parse().unwrap(), Duration::from_secs(120), now);
        cache.insert_at(HOST, "fe80::1".parse().unwrap(), Duration::from_secs(120), now);

        let later = now + Duration::from_secs(60);
        assert_eq!(cache.ipv4_at(HOST, later), Some(Ipv4Addr::new(192, 168, 1, 50)));
        assert_eq!(cache.ipv6_at(HOST, later), Some("fe80::1".parse().unwrap()));
        assert_eq!(cache.ipv4_at("other.local.", later), None);
    }

    #[test]
    fn test_newer_announcement_replaces_address() {
        let cache = HostAddressCache::new();
        let now = Instant::now();
        cache.insert_at(HOST, "192.168.1.50".parse().unwrap(), Duration::from_secs(120), now);
        cache.insert_at(HOST, "192.168.1.51".parse().unwrap(), Duration::from_secs(120), now);

        assert_eq!(cache.ipv4_at(HOST, now), Some(Ipv4Addr::new(192, 168, 1, 51)));
    }

    #[test]
    fn test_expired_entries_are_evicted() {
        let cache = HostAddressCache::new();
        let now = Instant::now();
        cache.insert_at(HOST, "192.168.1.50".parse().unwrap(), Duration::from_secs(10), now);
        cache.insert_at(HOST, "fe80::1".parse().unwrap(), Duration::from_secs(120), now);

        let later = now + Duration::from_secs(30);
        assert_eq!(cache.ipv4_at(HOST, later), None);
        assert_eq!(cache.len(), 1, "IPv6 slot keeps the host alive");

        let much_later = now + Duration::from_secs(300);
        assert_eq!(cache.ipv6_at(HOST, much_later), None);
        assert!(cache.is_empty());
    }

    #[test]
    fn test_empty_hostname_ignored() {
        let cache = HostAddressCache::new();
        cache.insert("", "10.0.0.1".parse().unwrap(), Duration::from_secs(10));
        assert!(cache.is_empty());
    }
}
