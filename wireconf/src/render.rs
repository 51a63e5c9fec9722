// Config rendering

//! WireGuard configuration rendering
//!
//! Pure, deterministic rendering of the server interface config, the companion
//! firewall script and per-client peer files. Peer blocks in the server config
//! are fenced with `### begin <name> ###` / `### end <name> ###` markers so a
//! previously deployed file can be split into its interface part and peers.

use crate::error::Result;
use crate::firewall;
use crate::ip_alloc::client_addresses;
use crate::types::{Client, DnsMode, DomainSnapshot};
use std::collections::BTreeMap;
use std::path::PathBuf;

/// Default tunnel MTU
pub const DEFAULT_MTU: u16 = 1420;

const PEER_BEGIN: &str = "### begin ";

/// Renders deployment artifacts for one tunnel interface
#[derive(Debug, Clone)]
pub struct ConfigRenderer {
    interface: String,
    firewall_script: PathBuf,
    mtu: u16,
}

impl ConfigRenderer {
    /// Create a renderer for `interface` whose hooks call `firewall_script`
    pub fn new(interface: impl Into<String>, firewall_script: impl Into<PathBuf>, mtu: u16) -> Self {
        Self {
            interface: interface.into(),
            firewall_script: firewall_script.into(),
            mtu,
        }
    }

    /// Tunnel interface name
    pub fn interface(&self) -> &str {
        &self.interface
    }

    /// Render the server interface config
    pub fn render_interface_config(
        &self,
        server_private_key: &str,
        port: u16,
        snapshot: &DomainSnapshot,
    ) -> Result<String> {
        let addresses: Vec<&str> = snapshot
            .networks
            .iter()
            .map(|n| n.interface_address.as_str())
            .collect();
        let script = self.firewall_script.display();

        let mut conf = vec![
            "[Interface]".to_string(),
            format!("PrivateKey = {}", server_private_key),
            format!("Address = {}", addresses.join(", ")),
            format!("ListenPort = {}", port),
            format!("MTU = {}", self.mtu),
            String::new(),
            "# Forwarding and Firewall".to_string(),
            "PreUp = sysctl -w net.ipv4.ip_forward=1".to_string(),
            format!("PostUp = {} apply", script),
            format!("PostDown = {} remove", script),
            String::new(),
        ];

        for client in snapshot.clients.iter().filter(|c| c.enabled) {
            let mut allowed_ips = client_addresses(snapshot, client)?;
            allowed_ips.extend(snapshot.routes_via(client.id).map(|r| r.target_cidr.clone()));

            conf.push(format!("### begin {} ###", client.name));
            conf.push("[Peer]".to_string());
            conf.push(format!("PublicKey = {}", client.public_key));
            if let Some(psk) = client.preshared_key.as_deref().filter(|k| !k.is_empty()) {
                conf.push(format!("PresharedKey = {}", psk));
            }
            conf.push(format!("AllowedIPs = {}", allowed_ips.join(", ")));
            conf.push(format!("### end {} ###", client.name));
            conf.push(String::new());
        }

        Ok(conf.join("\n"))
    }

    /// Render the companion firewall script
    pub fn render_firewall_script(&self, snapshot: &DomainSnapshot) -> Result<String> {
        firewall::render_firewall_script(snapshot, &self.interface)
    }

    /// Render the (apply, remove) firewall commands
    pub fn render_iptables_commands(
        &self,
        snapshot: &DomainSnapshot,
    ) -> Result<(Vec<String>, Vec<String>)> {
        firewall::render_iptables_commands(snapshot, &self.interface)
    }
}

/// Render a standalone peer file for `client`.
///
/// `server_endpoint` is `host:port`; `other_routes` are CIDRs routed through
/// other clients that this peer should reach.
pub fn render_client_config(
    snapshot: &DomainSnapshot,
    client: &Client,
    server_public_key: &str,
    server_endpoint: &str,
    other_routes: &[String],
) -> Result<String> {
    let addresses = client_addresses(snapshot, client)?;
    let address = if addresses.is_empty() {
        "10.0.0.0/32".to_string()
    } else {
        addresses.join(", ")
    };

    let mut interface = vec![
        "[Interface]".to_string(),
        format!("PrivateKey = {}", client.private_key),
        format!("Address = {}", address),
    ];

    match client.dns_mode {
        DnsMode::Default => {
            let gateways: Vec<&str> = snapshot.client_networks(client).map(|n| n.gateway()).collect();
            if !gateways.is_empty() {
                interface.push(format!("DNS = {}", gateways.join(", ")));
            }
        }
        DnsMode::Custom => {
            if let Some(servers) = client.dns_servers.as_deref().filter(|s| !s.trim().is_empty()) {
                interface.push(format!("DNS = {}", servers));
            }
        }
        DnsMode::None => {}
    }

    let own_routes: Vec<&str> = snapshot
        .routes_via(client.id)
        .map(|r| r.target_cidr.as_str())
        .collect();
    if !own_routes.is_empty() {
        interface.push("PostUp = sysctl -w net.ipv4.ip_forward=1".to_string());
        for cidr in &own_routes {
            interface.push(format!("PostUp = {}", router_snippet(cidr, "-A")));
        }
        for cidr in &own_routes {
            interface.push(format!("PostDown = {}", router_snippet(cidr, "-D")));
        }
    }

    let mut allowed_ips: Vec<String> = snapshot.client_networks(client).map(|n| n.cidr.clone()).collect();
    for cidr in other_routes {
        if !allowed_ips.contains(cidr) {
            allowed_ips.push(cidr.clone());
        }
    }
    let allowed = if allowed_ips.is_empty() {
        "0.0.0.0/0".to_string()
    } else {
        allowed_ips.join(", ")
    };

    let mut peer = vec![
        "[Peer]".to_string(),
        format!("PublicKey = {}", server_public_key),
        format!("Endpoint = {}", server_endpoint),
        format!("AllowedIPs = {}", allowed),
    ];
    if let Some(psk) = client.preshared_key.as_deref().filter(|k| !k.is_empty()) {
        peer.push(format!("PresharedKey = {}", psk));
    }
    if let Some(keepalive) = client.keepalive.filter(|k| *k > 0) {
        peer.push(format!("PersistentKeepalive = {}", keepalive));
    }

    Ok(format!("{}\n\n{}\n", interface.join("\n"), peer.join("\n")))
}

/// Shell one-liner installing (`-A`) or removing (`-D`) NAT and forwarding for
/// the LAN interface that serves `cidr`, detected when the tunnel comes up.
/// `%i` is expanded by wg-quick to the tunnel interface.
fn router_snippet(cidr: &str, op: &str) -> String {
    format!(
        "iface=$(ip -o addr show to {cidr} | awk '{{print $2}}' | head -1); \
         if [ -n \"$iface\" ]; then \
         iptables -t nat {op} POSTROUTING -o $iface -j MASQUERADE; \
         iptables {op} FORWARD -i %i -o $iface -j ACCEPT; \
         iptables {op} FORWARD -i $iface -o %i -m state --state RELATED,ESTABLISHED -j ACCEPT; \
         fi",
        cidr = cidr,
        op = op
    )
}

/// Everything before the first peer marker, trimmed
pub fn interface_part(config: &str) -> String {
    config
        .lines()
        .take_while(|line| !line.starts_with(PEER_BEGIN))
        .collect::<Vec<_>>()
        .join("\n")
        .trim()
        .to_string()
}

/// Peer blocks of a rendered config keyed by public key
pub fn peer_blocks(config: &str) -> BTreeMap<String, String> {
    let mut peers = BTreeMap::new();
    let mut current: Option<Vec<&str>> = None;

    for line in config.lines() {
        if line.starts_with(PEER_BEGIN) {
            current = Some(Vec::new());
        } else if line.starts_with("### end ") {
            if let Some(block) = current.take() {
                let key = block
                    .iter()
                    .find_map(|l| l.strip_prefix("PublicKey ="))
                    .map(|k| k.trim().to_string());
                if let Some(key) = key {
                    peers.insert(key, block.join("\n"));
                }
            }
        } else if let Some(block) = current.as_mut() {
            block.push(line);
        }
    }

    peers
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Network, Route, ServerConfig};

    fn client(id: u32, name: &str, octet: u8, networks: Vec<u32>) -> Client {
        Client {
            id,
            name: name.to_string(),
            public_key: format!("{}-pub", name),
            private_key: format!("{}-priv", name),
            preshared_key: Some(format!("{}-psk", name)),
            octet,
            enabled: true,
            keepalive: None,
            dns_mode: DnsMode::Default,
            dns_servers: None,
            network_ids: networks,
        }
    }

    fn snapshot() -> DomainSnapshot {
        DomainSnapshot {
            server: ServerConfig::default(),
            networks: vec![
                Network { id: 1, name: "lan".into(), cidr: "10.0.1.0/24".into(), interface_address: "10.0.1.1/24".into() },
                Network { id: 2, name: "iot".into(), cidr: "10.0.2.0/24".into(), interface_address: "10.0.2.1/24".into() },
            ],
            clients: vec![
                client(1, "laptop", 5, vec![1]),
                client(2, "router", 6, vec![1, 2]),
                client(3, "retired", 7, vec![1]),
            ],
            routes: vec![Route { id: 1, target_cidr: "192.168.50.0/24".into(), via_client_id: 2 }],
            rules: Vec::new(),
        }
    }

    fn renderer() -> ConfigRenderer {
        ConfigRenderer::new("wg0", "/etc/wireguard/wg0-rules.sh", DEFAULT_MTU)
    }

    #[test]
    fn test_interface_section() {
        let conf = renderer().render_interface_config("server-priv", 51820, &snapshot()).unwrap();
        let iface = interface_part(&conf);

        assert!(iface.starts_with("[Interface]\nPrivateKey = server-priv\n"));
        assert!(iface.contains("Address = 10.0.1.1/24, 10.0.2.1/24"));
        assert!(iface.contains("ListenPort = 51820"));
        assert!(iface.contains("MTU = 1420"));
        assert!(iface.contains("PreUp = sysctl -w net.ipv4.ip_forward=1"));
        assert!(iface.contains("PostUp = /etc/wireguard/wg0-rules.sh apply"));
        assert!(iface.contains("PostDown = /etc/wireguard/wg0-rules.sh remove"));
    }

    #[test]
    fn test_disabled_clients_are_omitted() {
        let mut snap = snapshot();
        snap.clients[2].enabled = false;
        let conf = renderer().render_interface_config("k", 51820, &snap).unwrap();

        for c in snap.clients.iter().filter(|c| c.enabled) {
            assert!(conf.contains(&format!("### begin {} ###", c.name)));
            assert!(conf.contains(&format!("### end {} ###", c.name)));
        }
        assert!(!conf.contains("retired"));
    }

    #[test]
    fn test_peer_allowed_ips_include_owned_routes() {
        let conf = renderer().render_interface_config("k", 51820, &snapshot()).unwrap();
        let peers = peer_blocks(&conf);

        assert!(peers["router-pub"].contains("AllowedIPs = 10.0.1.6/32, 10.0.2.6/32, 192.168.50.0/24"));
        assert!(peers["laptop-pub"].contains("AllowedIPs = 10.0.1.5/32"));
        assert!(peers["laptop-pub"].contains("PresharedKey = laptop-psk"));
    }

    #[test]
    fn test_rendering_is_deterministic() {
        let snap = snapshot();
        let a = renderer().render_interface_config("k", 51820, &snap).unwrap();
        let b = renderer().render_interface_config("k", 51820, &snap).unwrap();
        assert_eq!(a, b);

        let s1 = renderer().render_firewall_script(&snap).unwrap();
        let s2 = renderer().render_firewall_script(&snap).unwrap();
        assert_eq!(s1, s2);
    }

    #[test]
    fn test_missing_preshared_key_omitted() {
        let mut snap = snapshot();
        snap.clients[0].preshared_key = None;
        let conf = renderer().render_interface_config("k", 51820, &snap).unwrap();
        assert!(!peer_blocks(&conf)["laptop-pub"].contains("PresharedKey"));
    }

    #[test]
    fn test_interface_part_stops_at_first_marker() {
        let conf = "[Interface]\nPrivateKey = a\n\n### begin x ###\n[Peer]\n### end x ###\n";
        assert_eq!(interface_part(conf), "[Interface]\nPrivateKey = a");
        assert_eq!(interface_part("[Interface]\n"), "[Interface]");
    }

    #[test]
    fn test_client_config_router_mode() {
        let snap = snapshot();
        let router = &snap.clients[1];
        let conf = render_client_config(&snap, router, "server-pub", "vpn.example.com:51820", &snap.other_routes(router.id)).unwrap();

        let post_up: Vec<_> = conf.lines().filter(|l| l.starts_with("PostUp = iface=")).collect();
        let post_down: Vec<_> = conf.lines().filter(|l| l.starts_with("PostDown = ")).collect();
        assert_eq!(post_up.len(), 1);
        assert_eq!(post_down.len(), 1);
        assert!(post_up[0].contains("ip -o addr show to 192.168.50.0/24"));
        assert!(post_up[0].contains("iptables -t nat -A POSTROUTING -o $iface -j MASQUERADE"));
        assert!(post_up[0].contains("iptables -A FORWARD -i %i -o $iface -j ACCEPT"));
        assert!(post_up[0].contains("if [ -n \"$iface\" ]"));
        assert!(post_down[0].contains("iptables -t nat -D POSTROUTING -o $iface -j MASQUERADE"));
        assert!(post_down[0].contains("192.168.50.0/24"));
        assert!(conf.contains("PostUp = sysctl -w net.ipv4.ip_forward=1"));
        // the router does not route its own subnet back through the tunnel
        assert!(conf.contains("AllowedIPs = 10.0.1.0/24, 10.0.2.0/24\n"));
    }

    #[test]
    fn test_client_config_reaches_other_routes() {
        let snap = snapshot();
        let laptop = &snap.clients[0];
        let conf = render_client_config(&snap, laptop, "server-pub", "vpn.example.com:51820", &snap.other_routes(laptop.id)).unwrap();

        assert!(conf.contains("AllowedIPs = 10.0.1.0/24, 192.168.50.0/24"));
        assert!(!conf.contains("PostUp"));
        assert!(conf.contains("Endpoint = vpn.example.com:51820"));
        assert!(conf.contains("PublicKey = server-pub"));
        assert!(conf.contains("Address = 10.0.1.5/32"));
    }

    #[test]
    fn test_client_config_dns_modes() {
        let mut snap = snapshot();
        let conf = render_client_config(&snap, &snap.clients[1], "s", "e:1", &[]).unwrap();
        assert!(conf.contains("DNS = 10.0.1.1, 10.0.2.1"));

        snap.clients[1].dns_mode = DnsMode::Custom;
        snap.clients[1].dns_servers = Some("1.1.1.1, 9.9.9.9".into());
        let conf = render_client_config(&snap, &snap.clients[1], "s", "e:1", &[]).unwrap();
        assert!(conf.contains("DNS = 1.1.1.1, 9.9.9.9"));

        snap.clients[1].dns_mode = DnsMode::None;
        let conf = render_client_config(&snap, &snap.clients[1], "s", "e:1", &[]).unwrap();
        assert!(!conf.contains("DNS"));
    }

    #[test]
    fn test_client_config_without_networks() {
        let mut snap = snapshot();
        snap.clients[0].network_ids.clear();
        snap.clients[0].keepalive = Some(25);
        let conf = render_client_config(&snap, &snap.clients[0], "s", "e:1", &[]).unwrap();

        assert!(conf.contains("Address = 10.0.0.0/32"));
        assert!(conf.contains("AllowedIPs = 0.0.0.0/0"));
        assert!(conf.contains("PersistentKeepalive = 25"));
    }

    #[test]
    fn test_peer_blocks_round_trip() {
        let conf = renderer().render_interface_config("k", 51820, &snapshot()).unwrap();
        let peers = peer_blocks(&conf);
        let keys: Vec<_> = peers.keys().cloned().collect();
        assert_eq!(keys, vec!["laptop-pub", "retired-pub", "router-pub"]);
    }
}
