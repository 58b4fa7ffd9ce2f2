//! Host-side TAP/VLAN bring-up and tear-down for each endpoint.

use super::topology::NetworkEndpoint;
use crate::process::Cmd;
use serde::Serialize;
use std::net::Ipv4Addr;

/// Host address paired with a guest address on the same /24.
///
/// `.1` is taken by the guest as the usual gateway, so the host uses `.2`;
/// otherwise the host sits one below the guest.
pub fn host_ip(guest: Ipv4Addr) -> Ipv4Addr {
    let [a, b, c, d] = guest.octets();
    let last = match d {
        1 => 2,
        0 => 1,
        n => n - 1,
    };
    Ipv4Addr::new(a, b, c, last)
}

/// Host devices and addresses for one emulated NIC.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TapBinding {
    pub tap: String,
    pub vlan_id: Option<u16>,
    pub guest_device: String,
    pub guest_ip: Ipv4Addr,
    pub host_ip: Ipv4Addr,
}

impl TapBinding {
    pub fn new(
        index: u32,
        guest_device: &str,
        guest_ip: Ipv4Addr,
        host_ip: Ipv4Addr,
        vlan_id: Option<u16>,
    ) -> Self {
        Self {
            tap: format!("tap_{}", index),
            vlan_id,
            guest_device: guest_device.to_string(),
            guest_ip,
            host_ip,
        }
    }

    pub fn from_endpoint(index: u32, endpoint: &NetworkEndpoint) -> Self {
        Self::new(
            index,
            &endpoint.base_device,
            endpoint.ip,
            host_ip(endpoint.ip),
            endpoint.vlan_id,
        )
    }

    /// `tap_N.VLAN` when a VLAN is present.
    pub fn vlan_device(&self) -> Option<String> {
        self.vlan_id.map(|id| format!("{}.{}", self.tap, id))
    }

    /// Device carrying the host address.
    pub fn host_net_dev(&self) -> String {
        self.vlan_device().unwrap_or_else(|| self.tap.clone())
    }

    pub fn bring_up(&self) -> Vec<Cmd> {
        let mut cmds = vec![ip_tool("tunctl").args(["-t", &self.tap, "-u", "root"])];

        if let (Some(id), Some(vlan_dev)) = (self.vlan_id, self.vlan_device()) {
            cmds.push(ip_tool("ip").args([
                "link",
                "add",
                "link",
                &self.tap,
                "name",
                &vlan_dev,
                "type",
                "vlan",
                "id",
                &id.to_string(),
            ]));
            cmds.push(ip_tool("ip").args(["link", "set", &self.tap, "up"]));
        }

        let dev = self.host_net_dev();
        cmds.push(ip_tool("ip").args(["link", "set", &dev, "up"]));
        cmds.push(ip_tool("ip").args([
            "addr",
            "add",
            &format!("{}/24", self.host_ip),
            "dev",
            &dev,
        ]));
        cmds.push(ip_tool("ip").args([
            "route",
            "add",
            &self.guest_ip.to_string(),
            "via",
            &self.host_ip.to_string(),
            "dev",
            &self.tap,
        ]));
        cmds
    }

    pub fn tear_down(&self) -> Vec<Cmd> {
        let dev = self.host_net_dev();
        let mut cmds = vec![
            ip_tool("ip").args(["route", "flush", "dev", &dev]),
            ip_tool("ip").args(["link", "set", &dev, "down"]),
        ];
        if self.vlan_id.is_some() {
            cmds.push(ip_tool("ip").args(["link", "delete", &dev]));
        }
        cmds.push(ip_tool("tunctl").args(["-d", &self.tap]));
        cmds
    }
}

fn ip_tool(program: &str) -> Cmd {
    Cmd::new(program).sudo()
}

/// Bindings in endpoint order, numbered from `base`.
pub fn bindings_for(endpoints: &[NetworkEndpoint], base: u32) -> Vec<TapBinding> {
    endpoints
        .iter()
        .zip(base..)
        .map(|(endpoint, index)| TapBinding::from_endpoint(index, endpoint))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn endpoint(ip: [u8; 4], vlan_id: Option<u16>) -> NetworkEndpoint {
        NetworkEndpoint {
            ip: Ipv4Addr::from(ip),
            base_device: "eth0".into(),
            vlan_id,
            mac: None,
        }
    }

    fn lines(cmds: &[Cmd]) -> Vec<String> {
        cmds.iter().map(|c| c.get_args().join(" ")).collect()
    }

    #[test]
    fn test_host_ip() {
        assert_eq!(host_ip(Ipv4Addr::new(192, 168, 1, 1)), Ipv4Addr::new(192, 168, 1, 2));
        assert_eq!(host_ip(Ipv4Addr::new(192, 168, 1, 50)), Ipv4Addr::new(192, 168, 1, 49));
        assert_eq!(host_ip(Ipv4Addr::new(10, 0, 0, 0)), Ipv4Addr::new(10, 0, 0, 1));
    }

    #[test]
    fn test_bindings_are_deterministic() {
        let endpoints = vec![endpoint([10, 0, 0, 5], None), endpoint([10, 0, 1, 1], Some(3))];
        let first = bindings_for(&endpoints, 0);
        assert_eq!(first, bindings_for(&endpoints, 0));
        assert_eq!(first[0].tap, "tap_0");
        assert_eq!(first[0].host_ip, Ipv4Addr::new(10, 0, 0, 4));
        assert_eq!(first[1].tap, "tap_1");
        assert_eq!(first[1].host_net_dev(), "tap_1.3");

        let offset = bindings_for(&endpoints, 8);
        assert_eq!(offset[0].tap, "tap_8");
    }

    #[test]
    fn test_plain_bring_up_order() {
        let binding = TapBinding::from_endpoint(0, &endpoint([10, 0, 0, 5], None));
        let up = binding.bring_up();
        assert_eq!(up[0].program(), "tunctl");
        assert!(up.iter().all(|c| c.is_privileged()));
        assert_eq!(
            lines(&up),
            vec![
                "-t tap_0 -u root",
                "link set tap_0 up",
                "addr add 10.0.0.4/24 dev tap_0",
                "route add 10.0.0.5 via 10.0.0.4 dev tap_0",
            ]
        );
    }

    #[test]
    fn test_vlan_bring_up_and_tear_down_are_inverse() {
        let binding = TapBinding::from_endpoint(2, &endpoint([192, 168, 0, 1], Some(7)));
        assert_eq!(
            lines(&binding.bring_up()),
            vec![
                "-t tap_2 -u root",
                "link add link tap_2 name tap_2.7 type vlan id 7",
                "link set tap_2 up",
                "link set tap_2.7 up",
                "addr add 192.168.0.2/24 dev tap_2.7",
                "route add 192.168.0.1 via 192.168.0.2 dev tap_2",
            ]
        );

        let down = binding.tear_down();
        assert_eq!(
            lines(&down),
            vec![
                "route flush dev tap_2.7",
                "link set tap_2.7 down",
                "link delete tap_2.7",
                "-d tap_2",
            ]
        );
        // created tap first, so it is deleted last
        assert_eq!(down.last().unwrap().program(), "tunctl");
    }
}
