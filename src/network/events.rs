//! Classification of instrumented kernel log lines.

use crate::arch::Endianness;
use log::debug;
use regex::Regex;
use serde::Serialize;
use std::fmt;
use std::net::Ipv4Addr;
use std::sync::LazyLock;

static INET_INSERT_IFA: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^__inet_insert_ifa\[[^\]]+\]: device:([^ ]+) ifa:0x([0-9a-f]+)")
        .expect("static regex")
});
static BRIDGE_MEMBER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(?:br_dev_ioctl|br_add_if)\[[^\]]+\]: br:([^ ]+) dev:(.*)").expect("static regex")
});
static REGISTER_VLAN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^register_vlan_dev\[[^\]]+\]: dev:([^ ]+) vlan_id:([0-9]+)")
        .expect("static regex")
});
static SET_HWADDR: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^ioctl_SIOCSIFHWADDR\[[^\]]+\]: dev:([^ ]+) mac:0x([0-9a-f]+) 0x([0-9a-f]+)")
        .expect("static regex")
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct MacAddr(pub [u8; 6]);

impl fmt::Display for MacAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [a, b, c, d, e, g] = self.0;
        write!(f, "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}", a, b, c, d, e, g)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NetworkEvent {
    InterfaceConfigured { device: String, ip: Ipv4Addr },
    BridgeMembership { bridge: String, member: String },
    VlanRegistered { device: String, vlan_id: u16 },
    MacChanged { device: String, mac: MacAddr },
}

fn word_bytes(word: u32, endianness: Endianness) -> [u8; 4] {
    match endianness {
        Endianness::Big => word.to_be_bytes(),
        Endianness::Little => word.to_le_bytes(),
    }
}

/// Interpret a logged 32-bit word as the guest's in-memory address.
pub fn decode_ip(word: u32, endianness: Endianness) -> Ipv4Addr {
    Ipv4Addr::from(word_bytes(word, endianness))
}

/// Last two bytes of the first word, then all four of the second.
pub fn decode_mac(hi: u32, lo: u32, endianness: Endianness) -> MacAddr {
    let hi = word_bytes(hi, endianness);
    let lo = word_bytes(lo, endianness);
    MacAddr([hi[2], hi[3], lo[0], lo[1], lo[2], lo[3]])
}

fn hex_word(hex: &str, line: &str) -> Option<u32> {
    match u32::from_str_radix(hex, 16) {
        Ok(word) => Some(word),
        Err(_) => {
            debug!("ignoring line with oversized word 0x{}: {}", hex, line);
            None
        }
    }
}

/// Classify one stripped line; unrelated lines yield `None`.
pub fn parse_line(line: &str, endianness: Endianness) -> Option<NetworkEvent> {
    if let Some(c) = INET_INSERT_IFA.captures(line) {
        let ip = decode_ip(hex_word(&c[2], line)?, endianness);
        return Some(NetworkEvent::InterfaceConfigured {
            device: c[1].to_string(),
            ip,
        });
    }
    if let Some(c) = BRIDGE_MEMBER.captures(line) {
        return Some(NetworkEvent::BridgeMembership {
            bridge: c[1].to_string(),
            member: c[2].trim().to_string(),
        });
    }
    if let Some(c) = REGISTER_VLAN.captures(line) {
        let Ok(vlan_id) = c[2].parse::<u16>() else {
            debug!("ignoring out of range vlan id: {}", line);
            return None;
        };
        return Some(NetworkEvent::VlanRegistered {
            device: c[1].to_string(),
            vlan_id,
        });
    }
    if let Some(c) = SET_HWADDR.captures(line) {
        let mac = decode_mac(hex_word(&c[2], line)?, hex_word(&c[3], line)?, endianness);
        return Some(NetworkEvent::MacChanged {
            device: c[1].to_string(),
            mac,
        });
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_ip_per_endianness() {
        assert_eq!(decode_ip(0x0A000001, Endianness::Big), Ipv4Addr::new(10, 0, 0, 1));
        assert_eq!(decode_ip(0x0A000001, Endianness::Little), Ipv4Addr::new(1, 0, 0, 10));
    }

    #[test]
    fn test_decode_mac() {
        let mac = decode_mac(0x00000011, 0x22334455, Endianness::Big);
        assert_eq!(mac.to_string(), "00:11:22:33:44:55");

        let mac = decode_mac(0x11000000, 0x55443322, Endianness::Little);
        assert_eq!(mac.to_string(), "00:11:22:33:44:55");
    }

    #[test]
    fn test_parse_interface() {
        let event = parse_line(
            "__inet_insert_ifa[PID: 34 (ifconfig)]: device:eth0 ifa:0xc0a80101",
            Endianness::Big,
        );
        assert_eq!(
            event,
            Some(NetworkEvent::InterfaceConfigured {
                device: "eth0".into(),
                ip: Ipv4Addr::new(192, 168, 1, 1),
            })
        );
    }

    #[test]
    fn test_parse_bridge_vlan_mac() {
        assert_eq!(
            parse_line("br_add_if[PID: 40 (brctl)]: br:br0 dev:eth0.1 ", Endianness::Little),
            Some(NetworkEvent::BridgeMembership {
                bridge: "br0".into(),
                member: "eth0.1".into(),
            })
        );
        assert_eq!(
            parse_line(
                "register_vlan_dev[PID: 41 (vconfig)]: dev:eth0.1 vlan_id:1",
                Endianness::Little
            ),
            Some(NetworkEvent::VlanRegistered {
                device: "eth0.1".into(),
                vlan_id: 1,
            })
        );
        assert!(matches!(
            parse_line(
                "ioctl_SIOCSIFHWADDR[PID: 50 (ifconfig)]: dev:br0 mac:0x1122 0x33445566",
                Endianness::Big
            ),
            Some(NetworkEvent::MacChanged { .. })
        ));
    }

    #[test]
    fn test_unmatched_and_oversized_lines() {
        assert_eq!(parse_line("Freeing unused kernel memory", Endianness::Big), None);
        assert_eq!(
            parse_line(
                "__inet_insert_ifa[PID: 1 (x)]: device:eth0 ifa:0x1ffffffff",
                Endianness::Big
            ),
            None
        );
    }
}
