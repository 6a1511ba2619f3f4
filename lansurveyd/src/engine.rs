use std::collections::{HashMap, HashSet};
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::thread;
use tokio::sync::{mpsc, oneshot};
use anyhow::Result;
use shared::types::ServiceRecord;
use crate::arp::AddressResolver;
use crate::mdns::cache::AddressLookup;
use crate::neighbors::PresenceSnapshot;

/// Commands sent to the reconciler thread
pub enum EngineCommand {
    Record(ServiceRecord),
    List(oneshot::Sender<Vec<ServiceRecord>>),
    Get(String, oneshot::Sender<Option<ServiceRecord>>),
    Shutdown,
}

/// What a single incoming record did to the known set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Observation {
    /// New instance with an IPv4 address; logged
    Discovered,
    /// New instance without an IPv4 address; stored, not logged
    Pending,
    /// Known instance whose empty IPv4 slot was filled from the host cache; logged
    Backfilled,
    /// Known instance with no new IPv4 information
    Known,
}

/// Single owner of the merged service set.
///
/// Records are deduplicated by instance name. For an instance already known,
/// the incoming record itself is discarded; only the hostname-keyed address
/// cache can change it. An IPv4 address is filled in only when missing,
/// while a cached IPv6 address always replaces the stored one.
pub struct Reconciler {
    entries: HashMap<String, ServiceRecord>,
    presence: PresenceSnapshot,
    resolver: Option<Box<dyn AddressResolver>>,
    lookup: Arc<dyn AddressLookup>,
    probed: HashSet<Ipv4Addr>,
}

impl Reconciler {
    /// `resolver` is `None` when link-layer probing is unavailable.
    pub fn new(
        presence: PresenceSnapshot,
        resolver: Option<Box<dyn AddressResolver>>,
        lookup: Arc<dyn AddressLookup>,
    ) -> Self {
        Self {
            entries: HashMap::new(),
            presence,
            resolver,
            lookup,
            probed: HashSet::new(),
        }
    }

    pub fn observe(&mut self, record: ServiceRecord) -> Observation {
        let Some(entry) = self.entries.get_mut(&record.instance_name) else {
            let addr = record.addr_ipv4;
            if addr.is_some() {
                tracing::info!("{}", record);
            }
            self.entries.insert(record.instance_name.clone(), record);
            return match addr {
                Some(addr) => {
                    self.probe(addr);
                    Observation::Discovered
                }
                None => Observation::Pending,
            };
        };

        if !entry.has_hostname() {
            return Observation::Known;
        }

        let mut backfilled = None;
        if let Some(addr) = self.lookup.ipv4_address(&entry.hostname) {
            if entry.addr_ipv4.is_none() {
                entry.addr_ipv4 = Some(addr);
                tracing::info!("{}", entry);
                backfilled = Some(addr);
            }
        }
        if let Some(addr) = self.lookup.ipv6_address(&entry.hostname) {
            entry.addr_ipv6 = Some(addr);
        }

        match backfilled {
            Some(addr) => {
                self.probe(addr);
                Observation::Backfilled
            }
            None => Observation::Known,
        }
    }

    /// Best-effort hardware address lookup; the result is logged, never stored.
    fn probe(&mut self, addr: Ipv4Addr) {
        if self.presence.contains(addr) {
            tracing::debug!("{} already in neighbor table, not probing", addr);
            return;
        }
        if !self.probed.insert(addr) {
            return;
        }
        let Some(resolver) = self.resolver.as_mut() else {
            return;
        };
        if let Some(mac) = resolver.resolve(addr) {
            tracing::info!("IP {} is at {}", addr, mac);
        }
    }

    pub fn get(&self, instance_name: &str) -> Option<&ServiceRecord> {
        self.entries.get(instance_name)
    }

    /// Known records sorted by instance name
    pub fn records(&self) -> Vec<ServiceRecord> {
        let mut records: Vec<ServiceRecord> = self.entries.values().cloned().collect();
        records.sort_by(|a, b| a.instance_name.cmp(&b.instance_name));
        records
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Handle to feed and query the reconciler thread
#[derive(Clone)]
pub struct EngineHandle {
    tx: mpsc::Sender<EngineCommand>,
}

impl EngineHandle {
    /// Run the reconciler on its own thread. Commands are handled one at a
    /// time in arrival order; ARP probes block only this thread.
    pub fn spawn(mut reconciler: Reconciler, capacity: usize) -> Self {
        let (tx, mut rx) = mpsc::channel::<EngineCommand>(capacity.max(1));

        thread::spawn(move || {
            while let Some(cmd) = rx.blocking_recv() {
                match cmd {
                    EngineCommand::Record(record) => {
                        reconciler.observe(record);
                    }
                    EngineCommand::List(reply) => {
                        let _ = reply.send(reconciler.records());
                    }
                    EngineCommand::Get(instance_name, reply) => {
                        let _ = reply.send(reconciler.get(&instance_name).cloned());
                    }
                    EngineCommand::Shutdown => {
                        tracing::info!("Reconciler shutting down with {} services", reconciler.len());
                        break;
                    }
                }
            }
        });

        Self { tx }
    }

    pub async fn submit(&self, record: ServiceRecord) -> Result<()> {
        self.tx.send(EngineCommand::Record(record)).await?;
        Ok(())
    }

    /// All known services, sorted by instance name
    pub async fn list(&self) -> Result<Vec<ServiceRecord>> {
        let (reply, rx) = oneshot::channel();
        self.tx.send(EngineCommand::List(reply)).await?;
        Ok(rx.await?)
    }

    pub async fn get(&self, instance_name: String) -> Result<Option<ServiceRecord>> {
        let (reply, rx) = oneshot::channel();
        self.tx.send(EngineCommand::Get(instance_name, reply)).await?;
        Ok(rx.await?)
    }

    pub async fn shutdown(&self) -> Result<()> {
        self.tx.send(EngineCommand::Shutdown).await?;
        Ok(())
    }
}
