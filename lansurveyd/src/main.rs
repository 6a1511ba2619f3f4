mod api;
mod arp;
mod cli;
mod config;
mod engine;
mod logging;
mod mdns;
mod neighbors;
mod upnp;

use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use mdns_sd::ServiceDaemon;
use anyhow::{Context, Result};
use crate::arp::{AddressResolver, ArpResolver};
use crate::cli::Command;
use crate::config::Config;
use crate::engine::{EngineHandle, Reconciler};
use crate::mdns::browser::BrowseTrigger;
use crate::mdns::cache::HostAddressCache;
use crate::upnp::UpnpDiscovery;

#[tokio::main]
async fn main() -> Result<()> {
    let args = match cli::parse(std::env::args().skip(1)) {
        Ok(Command::Run(args)) => args,
        Ok(Command::Help) => {
            println!("{}", cli::usage_text());
            return Ok(());
        }
        Ok(Command::Version) => {
            println!("{}", cli::version_text());
            return Ok(());
        }
        Err(e) => {
            eprintln!("{}\n\n{}", e, cli::usage_text());
            std::process::exit(2);
        }
    };

    let config = match &args.config {
        Some(path) => Config::load(path),
        None => Ok(Config::default()),
    };

    let log_file = args
        .output
        .clone()
        .or_else(|| config.as_ref().ok().and_then(|c| c.log.file.clone()));
    logging::init(log_file.as_deref());

    let config = match config {
        Ok(config) => config,
        Err(e) => {
            tracing::error!("{:#}", e);
            std::process::exit(1);
        }
    };

    tracing::info!("start scanning:");

    let presence = match neighbors::scan() {
        Ok(presence) => presence,
        Err(e) => {
            tracing::warn!("Failed to read neighbor table, every new host will be probed: {:#}", e);
            Default::default()
        }
    };
    tracing::info!("{} hosts already in neighbor table", presence.len());

    let mdns_daemon = match start_discovery(|| create_daemon(&config)) {
        Ok(daemon) => daemon,
        Err(code) => std::process::exit(code),
    };

    let resolver: Option<Box<dyn AddressResolver>> = match ArpResolver::new(&config.arp) {
        Ok(resolver) => Some(Box::new(resolver)),
        Err(e) => {
            tracing::warn!("ARP probing disabled: {:#}", e);
            None
        }
    };

    let address_cache = Arc::new(HostAddressCache::new());
    let reconciler = Reconciler::new(presence, resolver, address_cache.clone());
    let engine = EngineHandle::spawn(reconciler, config.discovery.channel_capacity);

    let cancel = CancellationToken::new();
    let mut tasks = Vec::new();

    // Spawn mDNS browser task
    let (trigger, browses) = BrowseTrigger::new(mdns_daemon.clone());
    let browser_daemon = mdns_daemon.clone();
    let browser_domain = config.discovery.domain.clone();
    let browser_engine = engine.clone();
    let browser_cancel = cancel.clone();
    tasks.push(tokio::spawn(async move {
        if let Err(e) = mdns::browser::run_browser(
            browser_daemon,
            browses,
            browser_domain,
            address_cache,
            browser_engine,
            browser_cancel,
        )
        .await
        {
            tracing::error!("mDNS browser error: {}", e);
        }
    }));

    tasks.push(tokio::spawn(mdns::browser::run_browse_ticker(
        trigger,
        config.discovery.service_type.clone(),
        config.discovery.domain.clone(),
        config.discovery.browse_interval(),
        cancel.clone(),
    )));

    let upnp = UpnpDiscovery::new();
    if config.upnp.enabled {
        tasks.push(tokio::spawn(upnp.clone().run(config.upnp.clone(), cancel.clone())));
        tasks.push(tokio::spawn(upnp::report_after(
            upnp.clone(),
            Duration::from_secs(config.upnp.settle_secs),
            cancel.clone(),
        )));
    }

    if let Some(listen) = &config.api.listen {
        let app = api::routes::router(api::routes::AppState {
            engine: engine.clone(),
            upnp: upnp.clone(),
        });
        match tokio::net::TcpListener::bind(listen).await {
            Ok(listener) => {
                tracing::info!("API listening on {}", listen);
                let server_cancel = cancel.clone();
                tasks.push(tokio::spawn(async move {
                    if let Err(e) = axum::serve(listener, app)
                        .with_graceful_shutdown(async move { server_cancel.cancelled().await })
                        .await
                    {
                        tracing::error!("Server error: {}", e);
                    }
                }));
            }
            Err(e) => tracing::warn!("API disabled, failed to bind to {}: {}", listen, e),
        }
    }

    // Wait for shutdown signal
    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for ctrl-c")?;

    tracing::info!("Shutdown signal received");
    cancel.cancel();
    futures::future::join_all(tasks).await;

    if let Err(e) = engine.shutdown().await {
        tracing::error!("Failed to shutdown reconciler: {}", e);
    }

    if let Err(e) = mdns_daemon.shutdown() {
        tracing::error!("Failed to shutdown mDNS daemon: {}", e);
    }

    tracing::info!("Shutdown complete");
    Ok(())
}

/// Exit status when the mDNS producer cannot start
const EXIT_DISCOVERY_FAILED: i32 = 1;

/// Build the mDNS producer, logging the cause and yielding the exit status on failure
fn start_discovery<T>(create: impl FnOnce() -> Result<T>) -> std::result::Result<T, i32> {
    create().map_err(|e| {
        tracing::error!("Failed to initialize resolver: {:#}", e);
        EXIT_DISCOVERY_FAILED
    })
}

/// Create the mDNS daemon, optionally bound to a single interface
fn create_daemon(config: &Config) -> Result<ServiceDaemon> {
    let daemon = ServiceDaemon::new().context("Failed to create mDNS daemon")?;

    if let Some(interface) = &config.discovery.interface {
        daemon
            .disable_interface(mdns_sd::IfKind::All)
            .context("Failed to disable default interfaces")?;
        daemon
            .enable_interface(interface.as_str())
            .with_context(|| format!("Failed to enable interface {}", interface))?;
    }

    Ok(daemon)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::sync::Mutex;
    use anyhow::anyhow;

    #[derive(Clone, Default)]
    struct Captured(Arc<Mutex<Vec<u8>>>);

    impl Write for Captured {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_discovery_failure_exits_with_status_one() {
        let captured = Captured::default();
        let writer = captured.clone();
        let subscriber = tracing_subscriber::fmt()
            .with_writer(move || writer.clone())
            .with_ansi(false)
            .finish();

        let result = tracing::subscriber::with_default(subscriber, || {
            start_discovery::<()>(|| Err(anyhow!("no multicast-capable interface")))
        });

        assert_eq!(result, Err(1));
        let logged = String::from_utf8(captured.0.lock().unwrap().clone()).unwrap();
        assert!(logged.contains("Failed to initialize resolver"), "{}", logged);
        assert!(logged.contains("no multicast-capable interface"), "{}", logged);
    }

    #[test]
    fn test_discovery_success_passes_daemon_through() {
        assert_eq!(start_discovery(|| Ok(7)), Ok(7));
    }
}
