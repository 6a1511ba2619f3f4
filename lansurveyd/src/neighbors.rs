//! Startup snapshot of the OS neighbor table.
//!
//! Hosts already resolved before the scan starts are never probed again.

use std::collections::HashSet;
use std::net::Ipv4Addr;
use anyhow::Result;

/// ATF_COM: the kernel holds a completed hardware address for the entry
const ATF_COMPLETE: u32 = 0x2;

/// IPv4 addresses that already had a hardware mapping at startup.
#[derive(Debug, Clone, Default)]
pub struct PresenceSnapshot {
    addrs: HashSet<String>,
}

impl PresenceSnapshot {
    pub fn new(addrs: HashSet<String>) -> Self {
        Self { addrs }
    }

    pub fn contains(&self, addr: Ipv4Addr) -> bool {
        self.addrs.contains(&addr.to_string())
    }

    pub fn len(&self) -> usize {
        self.addrs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.addrs.is_empty()
    }
}

/// Arguments for the neighbor table tool; `-n` skips reverse lookups where supported
#[cfg_attr(target_os = "linux", allow(dead_code))]
fn arp_args() -> &'static [&'static str] {
    if cfg!(windows) {
        &["-a"]
    } else {
        &["-an"]
    }
}

/// Enumerate already-resolved IPv4 neighbors. Called once, before discovery starts.
#[cfg(target_os = "linux")]
pub fn scan() -> Result<PresenceSnapshot> {
    use anyhow::Context;

    let contents = std::fs::read_to_string("/proc/net/arp")
        .context("Failed to read /proc/net/arp")?;
    Ok(PresenceSnapshot::new(parse_proc_net_arp(&contents)))
}

#[cfg(not(target_os = "linux"))]
pub fn scan() -> Result<PresenceSnapshot> {
    use anyhow::{bail, Context};

    let args = arp_args();
    let output = std::process::Command::new("arp")
        .args(args)
        .output()
        .with_context(|| format!("Failed to run arp {}", args.join(" ")))?;
    if !output.status.success() {
        bail!("arp {} exited with {}", args.join(" "), output.status);
    }
    Ok(PresenceSnapshot::new(parse_arp_a(&String::from_utf8_lossy(&output.stdout))))
}

/// Parse the Linux kernel ARP table:
///
/// ```text
/// IP address       HW type     Flags       HW address            Mask     Device
/// 192.168.1.1      0x1         0x2         aa:bb:cc:dd:ee:ff     *        eth0
/// ```
#[cfg_attr(not(target_os = "linux"), allow(dead_code))]
pub fn parse_proc_net_arp(contents: &str) -> HashSet<String> {
    contents
        .lines()
        .skip(1)
        .filter_map(|line| {
            let fields: Vec<&str> = line.split_whitespace().collect();
            if fields.len() < 4 {
                return None;
            }
            let addr: Ipv4Addr = fields[0].parse().ok()?;
            let flags = u32::from_str_radix(fields[2].trim_start_matches("0x"), 16).ok()?;
            if flags & ATF_COMPLETE == 0 || is_zero_mac(fields[3]) {
                return None;
            }
            Some(addr.to_string())
        })
        .collect()
}

/// Parse `arp -an` (or Windows `arp -a`) output in either the BSD form
/// `? (192.168.1.1) at aa:bb:cc:dd:ee:ff on en0 ifscope [ethernet]`
/// or the Windows form `  192.168.1.1   aa-bb-cc-dd-ee-ff   dynamic`.
#[cfg_attr(target_os = "linux", allow(dead_code))]
pub fn parse_arp_a(output: &str) -> HashSet<String> {
    output
        .lines()
        .filter_map(|line| {
            let fields: Vec<&str> = line.split_whitespace().collect();
            let (addr, mac) = match fields.as_slice() {
                [_, addr, "at", mac, ..] => (addr.trim_start_matches('(').trim_end_matches(')'), *mac),
                [addr, mac, _kind] => (*addr, *mac),
                _ => return None,
            };
            let addr: Ipv4Addr = addr.parse().ok()?;
            if !looks_like_mac(mac) || is_zero_mac(mac) {
                return None;
            }
            Some(addr.to_string())
        })
        .collect()
}

#[cfg_attr(target_os = "linux", allow(dead_code))]
fn looks_like_mac(s: &str) -> bool {
    let parts: Vec<&str> = s.split([':', '-']).collect();
    parts.len() == 6
        && parts
            .iter()
            .all(|p| !p.is_empty() && p.len() <= 2 && p.chars().all(|c| c.is_ascii_hexdigit()))
}

fn is_zero_mac(s: &str) -> bool {
    s.split([':', '-']).all(|p| p.chars().all(|c| c == '0'))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_proc_net_arp() {
        let table = "\
IP address       HW type     Flags       HW address            Mask     Device
192.168.1.1      0x1         0x2         aa:bb:cc:dd:ee:ff     *        eth0
192.168.1.9      0x1         0x0         00:00:00:00:00:00     *        eth0
192.168.1.20     0x1         0x6         10:20:30:40:50:60     *        eth0
10.0.0.7         0x1         0x2         00:00:00:00:00:00     *        eth1
";
        let addrs = parse_proc_net_arp(table);

        assert_eq!(addrs.len(), 2);
        assert!(addrs.contains("192.168.1.1"));
        assert!(addrs.contains("192.168.1.20"));
    }

    #[test]
    fn test_parse_arp_a_bsd() {
        let output = "\
? (192.168.1.1) at aa:bb:cc:dd:ee:ff on en0 ifscope [ethernet]
? (192.168.1.9) at (incomplete) on en0 ifscope [ethernet]
router.lan (192.168.1.254) at 0:1b:63:a:f:ff on en0 ifscope permanent [ethernet]
";
        let addrs = parse_arp_a(output);

        assert_eq!(addrs.len(), 2);
        assert!(addrs.contains("192.168.1.1"));
        assert!(addrs.contains("192.168.1.254"));
    }

    #[test]
    fn test_parse_arp_a_windows() {
        let output = "
Interface: 192.168.1.10 --- 0xb
  Internet Address      Physical Address      Type
  192.168.1.1           aa-bb-cc-dd-ee-ff     dynamic
  192.168.1.255         ff-ff-ff-ff-ff-ff     static
";
        let addrs = parse_arp_a(output);

        assert_eq!(addrs.len(), 2);
        assert!(addrs.contains("192.168.1.1"));
        assert!(!addrs.contains("192.168.1.10"));
    }

    #[test]
    fn test_snapshot_contains() {
        let snapshot = PresenceSnapshot::new(HashSet::from(["192.168.1.1".to_string()]));
        assert!(snapshot.contains(Ipv4Addr::new(192, 168, 1, 1)));
        assert!(!snapshot.contains(Ipv4Addr::new(192, 168, 1, 2)));
        assert_eq!(snapshot.len(), 1);
        assert!(!snapshot.is_empty());
        assert!(PresenceSnapshot::default().is_empty());
    }

    #[test]
    fn test_arp_args_skip_name_resolution() {
        if cfg!(windows) {
            assert_eq!(arp_args(), ["-a"]);
        } else {
            assert_eq!(arp_args(), ["-an"]);
        }
    }

    #[test]
    fn test_parse_arp_an_numeric_bsd() {
        let output = "\
? (192.168.1.1) at aa:bb:cc:dd:ee:ff on en0 ifscope [ethernet]
? (192.168.1.254) at 0:1b:63:a:f:ff on en0 ifscope permanent [ethernet]
";
        let addrs = parse_arp_a(output);

        assert_eq!(addrs.len(), 2);
        assert!(addrs.contains("192.168.1.254"));
    }
}
