//! On-demand ARP resolution of a single IPv4 address.

use std::net::{IpAddr, Ipv4Addr};
use std::time::{Duration, Instant};
use anyhow::{anyhow, bail, Context, Result};
use pnet::datalink::{self, Channel, DataLinkReceiver, DataLinkSender, NetworkInterface};
use pnet::packet::arp::{ArpHardwareTypes, ArpOperations, ArpPacket, MutableArpPacket};
use pnet::packet::ethernet::{EtherTypes, EthernetPacket, MutableEthernetPacket};
use pnet::packet::Packet;
use pnet::util::MacAddr;
use shared::types::HardwareAddress;
use crate::config::ArpConfig;

const BROADCAST_MAC: MacAddr = MacAddr(0xff, 0xff, 0xff, 0xff, 0xff, 0xff);

const ETHERNET_HEADER_LEN: usize = 14;
const ARP_PACKET_LEN: usize = 28;

/// Poll granularity of the datalink receiver while waiting for a reply
const READ_TIMEOUT: Duration = Duration::from_millis(100);

/// Learns the hardware address behind an IPv4 address.
///
/// No answer and a failed request are indistinguishable to callers; both
/// come back as `None`. Implementations do not cache.
pub trait AddressResolver: Send {
    fn resolve(&mut self, addr: Ipv4Addr) -> Option<HardwareAddress>;
}

/// Broadcast ARP requests on one Ethernet interface.
pub struct ArpResolver {
    interface: String,
    source_mac: MacAddr,
    source_ip: Ipv4Addr,
    tx: Box<dyn DataLinkSender>,
    rx: Box<dyn DataLinkReceiver>,
    attempts: u32,
    attempt_timeout: Duration,
}

impl ArpResolver {
    /// Open a datalink channel on the configured interface, or the first
    /// usable one. Fails when raw link-layer access is unavailable.
    pub fn new(config: &ArpConfig) -> Result<Self> {
        let interfaces = datalink::interfaces();
        let (interface, source_mac, source_ip) =
            select_interface(&interfaces, config.interface.as_deref())?;

        let channel_config = datalink::Config {
            read_timeout: Some(READ_TIMEOUT),
            ..Default::default()
        };
        let (tx, rx) = match datalink::channel(interface, channel_config) {
            Ok(Channel::Ethernet(tx, rx)) => (tx, rx),
            Ok(_) => bail!("Unsupported channel type on {}", interface.name),
            Err(e) => {
                return Err(e).with_context(|| {
                    format!("Failed to open datalink channel on {}", interface.name)
                })
            }
        };

        tracing::info!(
            "ARP resolver ready on {} ({} / {})",
            interface.name,
            source_ip,
            source_mac
        );

        Ok(Self {
            interface: interface.name.clone(),
            source_mac,
            source_ip,
            tx,
            rx,
            attempts: config.attempts.max(1),
            attempt_timeout: config.attempt_timeout(),
        })
    }

    fn wait_for_reply(&mut self, target: Ipv4Addr) -> Option<HardwareAddress> {
        let deadline = Instant::now() + self.attempt_timeout;
        while Instant::now() < deadline {
            match self.rx.next() {
                Ok(frame) => {
                    if let Some(mac) = match_reply(frame, target) {
                        return Some(mac);
                    }
                }
                // read timeouts surface as errors; keep waiting until the deadline
                Err(_) => std::thread::sleep(Duration::from_millis(1)),
            }
        }
        None
    }
}

impl AddressResolver for ArpResolver {
    fn resolve(&mut self, addr: Ipv4Addr) -> Option<HardwareAddress> {
        let request = build_request(self.source_mac, self.source_ip, addr)
            .map_err(|e| tracing::debug!("Failed to build ARP request for {}: {}", addr, e))
            .ok()?;

        for attempt in 1..=self.attempts {
            match self.tx.send_to(&request, None) {
                Some(Ok(())) => {}
                Some(Err(e)) => {
                    tracing::debug!("Failed to send ARP request on {}: {}", self.interface, e);
                    return None;
                }
                None => return None,
            }

            if let Some(mac) = self.wait_for_reply(addr) {
                return Some(mac);
            }
            tracing::debug!("No ARP reply from {} (attempt {}/{})", addr, attempt, self.attempts);
        }

        None
    }
}

fn select_interface<'a>(
    interfaces: &'a [NetworkInterface],
    name: Option<&str>,
) -> Result<(&'a NetworkInterface, MacAddr, Ipv4Addr)> {
    let usable = |iface: &'a NetworkInterface| {
        let mac = iface.mac.filter(|m| *m != MacAddr::zero())?;
        let ip = iface.ips.iter().find_map(|net| match net.ip() {
            IpAddr::V4(v4) if !v4.is_unspecified() && !v4.is_link_local() => Some(v4),
            _ => None,
        })?;
        Some((iface, mac, ip))
    };

    match name {
        Some(name) => {
            let iface = interfaces
                .iter()
                .find(|iface| iface.name == name)
                .ok_or_else(|| anyhow!("Interface {} not found", name))?;
            usable(iface).ok_or_else(|| anyhow!("Interface {} has no MAC or IPv4 address", name))
        }
        None => interfaces
            .iter()
            .filter(|iface| iface.is_up() && !iface.is_loopback())
            .find_map(usable)
            .ok_or_else(|| anyhow!("No interface with a MAC and IPv4 address found")),
    }
}

/// Ethernet broadcast frame carrying an ARP who-has for `target_ip`.
fn build_request(source_mac: MacAddr, source_ip: Ipv4Addr, target_ip: Ipv4Addr) -> Result<Vec<u8>> {
    let mut buffer = vec![0u8; ETHERNET_HEADER_LEN + ARP_PACKET_LEN];

    {
        let mut ethernet = MutableEthernetPacket::new(&mut buffer[..ETHERNET_HEADER_LEN])
            .ok_or_else(|| anyhow!("Failed to construct Ethernet packet buffer"))?;
        ethernet.set_destination(BROADCAST_MAC);
        ethernet.set_source(source_mac);
        ethernet.set_ethertype(EtherTypes::Arp);
    }

    {
        let mut arp = MutableArpPacket::new(&mut buffer[ETHERNET_HEADER_LEN..])
            .ok_or_else(|| anyhow!("Failed to construct ARP packet buffer"))?;
        arp.set_hardware_type(ArpHardwareTypes::Ethernet);
        arp.set_protocol_type(EtherTypes::Ipv4);
        arp.set_hw_addr_len(6);
        arp.set_proto_addr_len(4);
        arp.set_operation(ArpOperations::Request);
        arp.set_sender_hw_addr(source_mac);
        arp.set_sender_proto_addr(source_ip);
        arp.set_target_hw_addr(MacAddr::zero());
        arp.set_target_proto_addr(target_ip);
    }

    Ok(buffer)
}

/// Hardware address from an ARP reply sent by `target`, if `frame` is one.
fn match_reply(frame: &[u8], target: Ipv4Addr) -> Option<HardwareAddress> {
    let ethernet = EthernetPacket::new(frame)?;
    if ethernet.get_ethertype() != EtherTypes::Arp {
        return None;
    }
    let arp = ArpPacket::new(ethernet.payload())?;
    if arp.get_operation() != ArpOperations::Reply || arp.get_sender_proto_addr() != target {
        return None;
    }
    let mac = arp.get_sender_hw_addr();
    Some(HardwareAddress([mac.0, mac.1, mac.2, mac.3, mac.4, mac.5]))
}

#[cfg(test)]
mod tests {
    use super::*;

    const LOCAL_MAC: MacAddr = MacAddr(0x02, 0x00, 0x00, 0x00, 0x00, 0x01);
    const LOCAL_IP: Ipv4Addr = Ipv4Addr::new(192, 168, 1, 10);
    const PEER_MAC: MacAddr = MacAddr(0x00, 0x1b, 0x63, 0xaa, 0x0f, 0xff);
    const PEER_IP: Ipv4Addr = Ipv4Addr::new(192, 168, 1, 50);

    fn reply_frame(sender_mac: MacAddr, sender_ip: Ipv4Addr) -> Vec<u8> {
        let mut buffer = build_request(sender_mac, sender_ip, LOCAL_IP).unwrap();
        {
            let mut ethernet = MutableEthernetPacket::new(&mut buffer[..ETHERNET_HEADER_LEN]).unwrap();
            ethernet.set_destination(LOCAL_MAC);
        }
        let mut arp = MutableArpPacket::new(&mut buffer[ETHERNET_HEADER_LEN..]).unwrap();
        arp.set_operation(ArpOperations::Reply);
        arp.set_target_hw_addr(LOCAL_MAC);
        buffer
    }

    #[test]
    fn test_build_request() {
        let frame = build_request(LOCAL_MAC, LOCAL_IP, PEER_IP).unwrap();
        assert_eq!(frame.len(), 42);

        let ethernet = EthernetPacket::new(&frame).unwrap();
        assert_eq!(ethernet.get_destination(), BROADCAST_MAC);
        assert_eq!(ethernet.get_source(), LOCAL_MAC);
        assert_eq!(ethernet.get_ethertype(), EtherTypes::Arp);

        let arp = ArpPacket::new(ethernet.payload()).unwrap();
        assert_eq!(arp.get_operation(), ArpOperations::Request);
        assert_eq!(arp.get_sender_proto_addr(), LOCAL_IP);
        assert_eq!(arp.get_target_proto_addr(), PEER_IP);
    }

    #[test]
    fn test_match_reply_from_target() {
        let frame = reply_frame(PEER_MAC, PEER_IP);
        assert_eq!(
            match_reply(&frame, PEER_IP),
            Some(HardwareAddress([0x00, 0x1b, 0x63, 0xaa, 0x0f, 0xff]))
        );
    }

    #[test]
    fn test_match_reply_ignores_other_traffic() {
        let other_host = reply_frame(PEER_MAC, Ipv4Addr::new(192, 168, 1, 51));
        assert_eq!(match_reply(&other_host, PEER_IP), None);

        let request = build_request(PEER_MAC, PEER_IP, LOCAL_IP).unwrap();
        assert_eq!(match_reply(&request, PEER_IP), None, "requests are not answers");

        assert_eq!(match_reply(&[0u8; 10], PEER_IP), None);
    }
}
