use std::collections::HashSet;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use mdns_sd::{ServiceDaemon, ServiceEvent, ServiceInfo};
use futures::stream::{FuturesUnordered, StreamExt};
use futures::Future;
use anyhow::{anyhow, Context, Result};
use chrono::Utc;
use shared::protocol::{qualified_type, META_QUERY_TYPE};
use shared::types::ServiceRecord;
use crate::engine::EngineHandle;
use crate::mdns::cache::HostAddressCache;

/// A fresh browse and the receiver its events arrive on
pub struct Browse {
    service_type: String,
    receiver: flume::Receiver<ServiceEvent>,
}

/// Issues browse requests. Each request replaces the daemon's previous
/// query for the same type and hands the new receiver to [`run_browser`].
#[derive(Clone)]
pub struct BrowseTrigger {
    daemon: ServiceDaemon,
    tx: mpsc::UnboundedSender<Browse>,
}

impl BrowseTrigger {
    pub fn new(daemon: ServiceDaemon) -> (Self, mpsc::UnboundedReceiver<Browse>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { daemon, tx }, rx)
    }

    pub fn browse(&self, service_type: &str, domain: &str) -> Result<()> {
        let service_type = qualified_type(service_type, domain);
        let receiver = self
            .daemon
            .browse(&service_type)
            .with_context(|| format!("Failed to browse {}", service_type))?;
        self.tx
            .send(Browse { service_type, receiver })
            .map_err(|_| anyhow!("mDNS browser is not running"))
    }
}

/// Re-trigger discovery on a fixed cadence. A failed browse is only logged;
/// the next tick retries it.
pub async fn run_browse_ticker(
    trigger: BrowseTrigger,
    service_type: String,
    domain: String,
    interval: Duration,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval.max(Duration::from_millis(1)));
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if let Err(e) = trigger.browse(&service_type, &domain) {
                    tracing::warn!("Failed to browse: {:#}", e);
                }
            }
            _ = cancel.cancelled() => break,
        }
    }
}

type RecvResult = (String, flume::Receiver<ServiceEvent>, std::result::Result<ServiceEvent, flume::RecvError>);
type RecvFuture = Pin<Box<dyn Future<Output = RecvResult> + Send>>;

/// Each future owns its receiver and the type it was browsed for, and hands
/// both back with the event so the receiver can be re-armed.
fn make_recv_future(service_type: String, rx: flume::Receiver<ServiceEvent>) -> RecvFuture {
    Box::pin(async move {
        let result = rx.recv_async().await;
        (service_type, rx, result)
    })
}

/// Drain every browse receiver. Service types found through the meta-query
/// are browsed once each; resolved instances update the address cache and
/// are forwarded to the reconciler.
pub async fn run_browser(
    daemon: ServiceDaemon,
    mut browses: mpsc::UnboundedReceiver<Browse>,
    domain: String,
    cache: Arc<HostAddressCache>,
    engine: EngineHandle,
    cancel: CancellationToken,
) -> Result<()> {
    tracing::info!("Starting mDNS browser");

    let meta_type = qualified_type(META_QUERY_TYPE, &domain);
    let mut browsed_types = HashSet::new();
    let mut receivers: FuturesUnordered<RecvFuture> = FuturesUnordered::new();

    loop {
        tokio::select! {
            Some(browse) = browses.recv() => {
                tracing::trace!("Browsing {}", browse.service_type);
                receivers.push(make_recv_future(browse.service_type, browse.receiver));
            }

            Some((service_type, rx, result)) = receivers.next() => {
                let event = match result {
                    Ok(event) => event,
                    Err(_) => {
                        // superseded by a newer browse for the same type
                        tracing::trace!("Receiver for {} closed", service_type);
                        continue;
                    }
                };

                if service_type == meta_type {
                    if let Some(found) = discovered_type(&event) {
                        if browsed_types.insert(found.clone()) {
                            tracing::info!("Discovered new service type: {}", found);
                            match daemon.browse(&found) {
                                Ok(receiver) => receivers.push(make_recv_future(found, receiver)),
                                Err(e) => tracing::error!("Failed to browse {}: {}", found, e),
                            }
                        }
                    }
                } else if let ServiceEvent::ServiceResolved(info) = &event {
                    cache_addresses(&cache, info);
                    let record = convert_service_info(info);
                    tracing::debug!("Resolved service: {}", record.instance_name);
                    if let Err(e) = engine.submit(record).await {
                        tracing::error!("Failed to send resolved service: {}", e);
                    }
                }

                receivers.push(make_recv_future(service_type, rx));
            }

            _ = cancel.cancelled() => {
                tracing::info!("mDNS browser shutting down ({} hosts cached)", cache.len());
                break;
            }
        }
    }

    Ok(())
}

/// Service type announced on the meta-query
fn discovered_type(event: &ServiceEvent) -> Option<String> {
    match event {
        ServiceEvent::ServiceFound(_, fullname) => Some(fullname.clone()),
        ServiceEvent::ServiceResolved(info) => Some(info.get_type().to_string()),
        _ => None,
    }
}

/// Lowest IPv4 and lowest IPv6 of a resolution. The record and the host
/// cache both use this so repeated resolutions agree.
fn lowest_addresses(info: &ServiceInfo) -> (Option<Ipv4Addr>, Option<Ipv6Addr>) {
    let mut ipv4: Option<Ipv4Addr> = None;
    let mut ipv6: Option<Ipv6Addr> = None;
    for addr in info.get_addresses() {
        match *addr {
            IpAddr::V4(v4) => ipv4 = Some(ipv4.map_or(v4, |cur| cur.min(v4))),
            IpAddr::V6(v6) => ipv6 = Some(ipv6.map_or(v6, |cur| cur.min(v6))),
        }
    }
    (ipv4, ipv6)
}

fn cache_addresses(cache: &HostAddressCache, info: &ServiceInfo) {
    let ttl = Duration::from_secs(u64::from(info.get_host_ttl()));
    let (ipv4, ipv6) = lowest_addresses(info);
    if let Some(addr) = ipv4 {
        cache.insert(info.get_hostname(), IpAddr::V4(addr), ttl);
    }
    if let Some(addr) = ipv6 {
        cache.insert(info.get_hostname(), IpAddr::V6(addr), ttl);
    }
}

/// Convert an mdns-sd ServiceInfo to our ServiceRecord
fn convert_service_info(info: &ServiceInfo) -> ServiceRecord {
    let (addr_ipv4, addr_ipv6) = lowest_addresses(info);

    let txt = info
        .get_properties()
        .iter()
        .map(|prop| (prop.key().to_string(), prop.val_str().to_string()))
        .collect();

    ServiceRecord {
        instance_name: info.get_fullname().to_string(),
        hostname: info.get_hostname().to_string(),
        addr_ipv4,
        addr_ipv6,
        port: info.get_port(),
        ttl: info.get_host_ttl(),
        txt,
        first_seen: Utc::now(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use crate::mdns::cache::AddressLookup;

    fn printer_info(ip: &str) -> ServiceInfo {
        let txt = HashMap::from([("rp".to_string(), "ipp/print".to_string())]);
        ServiceInfo::new("_ipp._tcp.local.", "printer", "printer.local.", ip, 631, txt).unwrap()
    }

    #[test]
    fn test_convert_service_info() {
        let info = printer_info("192.168.1.50");
        let record = convert_service_info(&info);

        assert_eq!(record.instance_name, "printer._ipp._tcp.local.");
        assert_eq!(record.hostname, "printer.local.");
        assert_eq!(record.addr_ipv4, Some(Ipv4Addr::new(192, 168, 1, 50)));
        assert_eq!(record.addr_ipv6, None);
        assert_eq!(record.port, 631);
        assert_eq!(record.ttl, info.get_host_ttl());
        assert_eq!(record.txt, vec![("rp".to_string(), "ipp/print".to_string())]);
    }

    #[test]
    fn test_cache_addresses() {
        let cache = HostAddressCache::new();
        cache_addresses(&cache, &printer_info("192.168.1.50"));

        assert_eq!(cache.ipv4_address("printer.local."), Some(Ipv4Addr::new(192, 168, 1, 50)));
        assert_eq!(cache.ipv6_address("printer.local."), None);
    }

    #[test]
    fn test_record_and_cache_pick_same_address() {
        let info = printer_info("192.168.1.60,192.168.1.50,fe80::2,fe80::1");
        let cache = HostAddressCache::new();
        cache_addresses(&cache, &info);
        let record = convert_service_info(&info);

        assert_eq!(record.addr_ipv4, Some(Ipv4Addr::new(192, 168, 1, 50)));
        assert_eq!(record.addr_ipv6, Some("fe80::1".parse().unwrap()));
        assert_eq!(cache.ipv4_address("printer.local."), record.addr_ipv4);
        assert_eq!(cache.ipv6_address("printer.local."), record.addr_ipv6);
    }

    #[test]
    fn test_discovered_type() {
        let found = ServiceEvent::ServiceFound(
            "_services._dns-sd._udp.local.".to_string(),
            "_ipp._tcp.local.".to_string(),
        );
        assert_eq!(discovered_type(&found).as_deref(), Some("_ipp._tcp.local."));

        let stopped = ServiceEvent::SearchStopped("_services._dns-sd._udp.local.".to_string());
        assert_eq!(discovered_type(&stopped), None);
    }
}
