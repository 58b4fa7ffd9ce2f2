//! Reconstruct the guest's network endpoints from classified log events.

use super::events::{parse_line, MacAddr, NetworkEvent};
use super::transcript::Transcript;
use crate::arch::Endianness;
use log::debug;
use serde::Serialize;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::net::Ipv4Addr;

/// One guest address to bridge onto the host.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct NetworkEndpoint {
    pub ip: Ipv4Addr,
    pub base_device: String,
    pub vlan_id: Option<u16>,
    pub mac: Option<MacAddr>,
}

/// Events of a transcript, split by kind and kept in log order.
#[derive(Debug, Default)]
struct Observed {
    interfaces: Vec<(String, Ipv4Addr)>,
    members: Vec<(String, String)>,
    vlans: Vec<(String, u16)>,
    macs: HashMap<String, MacAddr>,
}

impl Observed {
    fn collect(transcript: &Transcript, endianness: Endianness) -> Self {
        let mut observed = Self::default();
        for event in transcript.lines().filter_map(|l| parse_line(l, endianness)) {
            match event {
                NetworkEvent::InterfaceConfigured { device, ip } => {
                    if ip == Ipv4Addr::LOCALHOST || ip.is_unspecified() {
                        continue;
                    }
                    observed.interfaces.push((device, ip));
                }
                NetworkEvent::BridgeMembership { bridge, member } => {
                    // some images run `brctl addif br0 br0`
                    if bridge != member {
                        observed.members.push((bridge, member));
                    }
                }
                NetworkEvent::VlanRegistered { device, vlan_id } => {
                    observed.vlans.push((device, vlan_id));
                }
                NetworkEvent::MacChanged { device, mac } => {
                    observed.macs.insert(device, mac);
                }
            }
        }
        observed
    }

    fn members_of<'a>(&'a self, bridge: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.members
            .iter()
            .filter(move |(br, _)| br == bridge)
            .map(|(_, member)| member.as_str())
    }

    fn endpoint(&self, interface: &str, device: &str, ip: Ipv4Addr) -> NetworkEndpoint {
        let base_device = device.split('.').next().unwrap_or(device).to_string();
        let vlan_id = self
            .vlans
            .iter()
            .find(|(dev, _)| dev == device)
            .map(|(_, id)| *id);
        let mac = self
            .macs
            .get(interface)
            .or_else(|| self.macs.get(&base_device))
            .copied();
        NetworkEndpoint {
            ip,
            base_device,
            vlan_id,
            mac,
        }
    }
}

/// Walks configured interfaces in log order.
///
/// Once any interface turns out to be a bridge, later bridgeless interfaces
/// no longer produce endpoints of their own.
#[derive(Debug, Default)]
struct Extractor {
    bridge_seen: bool,
    endpoints: Vec<NetworkEndpoint>,
}

impl Extractor {
    fn run(mut self, observed: &Observed) -> Vec<NetworkEndpoint> {
        for (interface, ip) in &observed.interfaces {
            let mut bridged = false;
            for member in observed.members_of(interface) {
                self.endpoints.push(observed.endpoint(interface, member, *ip));
                self.bridge_seen = true;
                bridged = true;
            }
            if !bridged && !self.bridge_seen {
                self.endpoints.push(observed.endpoint(interface, interface, *ip));
            }
        }
        dedup_by_ip(self.endpoints)
    }
}

fn dedup_by_ip(endpoints: Vec<NetworkEndpoint>) -> Vec<NetworkEndpoint> {
    let mut exact = HashSet::new();
    let mut ips = BTreeSet::new();
    let mut kept = Vec::new();
    for endpoint in endpoints {
        if !exact.insert(endpoint.clone()) {
            continue;
        }
        if ips.insert(endpoint.ip) {
            kept.push(endpoint);
        } else {
            debug!("duplicate ip address for interface: {:?}", endpoint);
        }
    }
    kept
}

/// Deduplicated endpoints, in transcript order.
pub fn extract_endpoints(transcript: &Transcript, endianness: Endianness) -> Vec<NetworkEndpoint> {
    let observed = Observed::collect(transcript, endianness);
    Extractor::default().run(&observed)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn log(lines: &[&str]) -> Transcript {
        let text = lines
            .iter()
            .map(|l| format!("[    3.210000] firmadyne: {}", l))
            .collect::<Vec<_>>()
            .join("\r\n");
        Transcript::from_text(&text)
    }

    #[test]
    fn test_single_interface() {
        let t = log(&["__inet_insert_ifa[PID: 30 (ifconfig)]: device:eth0 ifa:0x0a000005"]);
        assert_eq!(
            extract_endpoints(&t, Endianness::Big),
            vec![NetworkEndpoint {
                ip: Ipv4Addr::new(10, 0, 0, 5),
                base_device: "eth0".into(),
                vlan_id: None,
                mac: None,
            }]
        );
    }

    #[test]
    fn test_loopback_and_zero_ignored() {
        let t = log(&[
            "__inet_insert_ifa[PID: 1 (init)]: device:lo ifa:0x7f000001",
            "__inet_insert_ifa[PID: 1 (init)]: device:eth1 ifa:0x00000000",
        ]);
        assert!(extract_endpoints(&t, Endianness::Big).is_empty());
    }

    #[test]
    fn test_same_ip_different_devices_yields_one() {
        let t = log(&[
            "__inet_insert_ifa[PID: 30 (ifconfig)]: device:eth0 ifa:0xc0a80101",
            "__inet_insert_ifa[PID: 31 (ifconfig)]: device:eth1 ifa:0xc0a80101",
        ]);
        let endpoints = extract_endpoints(&t, Endianness::Big);
        assert_eq!(endpoints.len(), 1);
        assert_eq!(endpoints[0].base_device, "eth0");
    }

    #[test]
    fn test_bridge_with_vlan_member_and_mac() {
        let t = log(&[
            "register_vlan_dev[PID: 20 (vconfig)]: dev:eth0.2 vlan_id:2",
            "br_add_if[PID: 21 (brctl)]: br:br0 dev:eth0.2",
            "br_add_if[PID: 21 (brctl)]: br:br0 dev:br0",
            "ioctl_SIOCSIFHWADDR[PID: 22 (ifconfig)]: dev:eth0 mac:0x0000aabb 0xccddeeff",
            "ioctl_SIOCSIFHWADDR[PID: 22 (ifconfig)]: dev:br0 mac:0x00000011 0x22334455",
            "__inet_insert_ifa[PID: 23 (ifconfig)]: device:br0 ifa:0xc0a80001",
        ]);
        let endpoints = extract_endpoints(&t, Endianness::Big);
        assert_eq!(endpoints.len(), 1);
        let ep = &endpoints[0];
        assert_eq!(ep.ip, Ipv4Addr::new(192, 168, 0, 1));
        assert_eq!(ep.base_device, "eth0");
        assert_eq!(ep.vlan_id, Some(2));
        assert_eq!(ep.mac.unwrap().to_string(), "00:11:22:33:44:55");
    }

    #[test]
    fn test_mac_falls_back_to_base_device_and_last_change_wins() {
        let t = log(&[
            "br_add_if[PID: 21 (brctl)]: br:br0 dev:eth0",
            "ioctl_SIOCSIFHWADDR[PID: 22 (ifconfig)]: dev:eth0 mac:0x0000aabb 0xccddeeff",
            "ioctl_SIOCSIFHWADDR[PID: 22 (ifconfig)]: dev:eth0 mac:0x00000011 0x22334455",
            "__inet_insert_ifa[PID: 23 (ifconfig)]: device:br0 ifa:0xc0a80001",
        ]);
        let endpoints = extract_endpoints(&t, Endianness::Big);
        assert_eq!(endpoints[0].mac.unwrap().to_string(), "00:11:22:33:44:55");
    }

    #[test]
    fn test_bridge_flag_suppresses_later_bare_interfaces() {
        let t = log(&[
            "br_add_if[PID: 21 (brctl)]: br:br0 dev:eth0",
            "__inet_insert_ifa[PID: 23 (ifconfig)]: device:br0 ifa:0xc0a80001",
            "__inet_insert_ifa[PID: 24 (ifconfig)]: device:eth1 ifa:0x0a000002",
        ]);
        let endpoints = extract_endpoints(&t, Endianness::Big);
        assert_eq!(endpoints.len(), 1);
        assert_eq!(endpoints[0].ip, Ipv4Addr::new(192, 168, 0, 1));

        // a bare interface configured before the bridge is kept
        let t = log(&[
            "__inet_insert_ifa[PID: 20 (ifconfig)]: device:eth1 ifa:0x0a000002",
            "br_add_if[PID: 21 (brctl)]: br:br0 dev:eth0",
            "__inet_insert_ifa[PID: 23 (ifconfig)]: device:br0 ifa:0xc0a80001",
        ]);
        assert_eq!(extract_endpoints(&t, Endianness::Big).len(), 2);
    }

    #[test]
    fn test_deterministic_order() {
        let t = log(&[
            "__inet_insert_ifa[PID: 30 (ifconfig)]: device:eth0 ifa:0x0a000005",
            "__inet_insert_ifa[PID: 31 (ifconfig)]: device:eth1 ifa:0x0a010005",
        ]);
        let first = extract_endpoints(&t, Endianness::Big);
        let second = extract_endpoints(&t, Endianness::Big);
        assert_eq!(first, second);
        assert_eq!(first[0].base_device, "eth0");
        assert_eq!(first[1].base_device, "eth1");
    }
}
