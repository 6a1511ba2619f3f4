//! SSDP/UPnP device discovery.
//!
//! Devices are kept per host, behind a mutex owned by [`UpnpDiscovery`].
//! Readers only ever get a cloned snapshot.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use futures::TryStreamExt;
use rupnp::http::Uri;
use rupnp::ssdp::SearchTarget;
use rupnp::DeviceSpec;
use tokio_util::sync::CancellationToken;
use anyhow::{Context, Result};
use shared::types::{DeviceMap, UpnpDevice, UpnpService};
use crate::config::UpnpConfig;

#[derive(Clone, Default)]
pub struct UpnpDiscovery {
    hosts: Arc<Mutex<DeviceMap>>,
}

impl UpnpDiscovery {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, DeviceMap> {
        self.hosts.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Point-in-time copy of every host and its devices
    pub fn snapshot(&self) -> DeviceMap {
        self.lock().clone()
    }

    /// Add devices seen at `host`; a device already known by UDN is replaced.
    pub fn merge(&self, host: &str, devices: Vec<UpnpDevice>) {
        let mut hosts = self.lock();
        let known = hosts.entry(host.to_string()).or_default();
        for device in devices {
            match known.iter_mut().find(|d| d.udn == device.udn) {
                Some(existing) => *existing = device,
                None => known.push(device),
            }
        }
    }

    /// One SSDP search for root devices. Returns the number of devices answering.
    pub async fn search_once(&self, timeout: Duration) -> Result<usize> {
        let devices = rupnp::discover(&SearchTarget::RootDevice, timeout, None)
            .await
            .context("Failed to start SSDP search")?;
        futures::pin_mut!(devices);

        let mut found = 0;
        loop {
            match devices.try_next().await {
                Ok(Some(device)) => {
                    let Some(host) = host_of(device.url()) else {
                        tracing::debug!("Device {} has no host in {}", device.udn(), device.url());
                        continue;
                    };
                    let spec: &DeviceSpec = &device;
                    self.merge(&host, flatten(&device.url().to_string(), spec));
                    found += 1;
                }
                Ok(None) => break,
                Err(e) => tracing::debug!("Received error device response: {}", e),
            }
        }

        Ok(found)
    }

    /// Search repeatedly until cancelled
    pub async fn run(self, config: UpnpConfig, cancel: CancellationToken) {
        let timeout = Duration::from_secs(config.search_timeout_secs);
        let mut ticker = tokio::time::interval(Duration::from_secs(config.search_interval_secs.max(1)));

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    match self.search_once(timeout).await {
                        Ok(found) => tracing::debug!("SSDP search answered by {} devices", found),
                        Err(e) => tracing::warn!("UPnP discovery failed: {:#}", e),
                    }
                }
                _ = cancel.cancelled() => {
                    tracing::info!("UPnP discovery shutting down");
                    break;
                }
            }
        }
    }
}

/// Wait for discovery to settle, then log what was found once.
pub async fn report_after(discovery: UpnpDiscovery, settle: Duration, cancel: CancellationToken) {
    tokio::select! {
        _ = tokio::time::sleep(settle) => log_report(&discovery.snapshot()),
        _ = cancel.cancelled() => {}
    }
}

pub fn log_report(hosts: &DeviceMap) {
    tracing::info!("------------found {} UPnP enabled hosts-----------", hosts.len());
    for (host, devices) in hosts {
        tracing::info!("host: {}", host);
        for device in devices {
            tracing::info!("device type: {}", device.device_type);
            tracing::info!("url base: {}", device.url_base);
            tracing::info!("friendlyName: {}", device.friendly_name);
            tracing::info!("manufacturer: {}", device.manufacturer);
            tracing::info!("modelDescription: {}", device.model_description.as_deref().unwrap_or(""));
            tracing::info!("modelName: {}", device.model_name);
            for service in &device.services {
                tracing::info!("----service type: {}", service.service_type);
            }
            tracing::info!("*********************************");
        }
        tracing::info!("---------------------------------------");
    }
}

fn host_of(url: &Uri) -> Option<String> {
    url.host().map(|host| host.trim_start_matches('[').trim_end_matches(']').to_string())
}

/// A root device followed by its embedded devices, depth first
fn flatten(url_base: &str, spec: &DeviceSpec) -> Vec<UpnpDevice> {
    let mut devices = vec![UpnpDevice {
        udn: spec.udn().to_string(),
        device_type: spec.device_type().to_string(),
        url_base: url_base.to_string(),
        friendly_name: spec.friendly_name().to_string(),
        manufacturer: spec.manufacturer().to_string(),
        model_description: spec.model_description().map(str::to_string),
        model_name: spec.model_name().to_string(),
        services: spec
            .services()
            .iter()
            .map(|service| UpnpService {
                service_type: service.service_type().to_string(),
                service_id: service.service_id().to_string(),
            })
            .collect(),
    }];
    for sub in spec.devices() {
        devices.extend(flatten(url_base, sub));
    }
    devices
}
