// Firewall script rendering

//! Access-control firewall rendering
//!
//! Access rules are planned as typed [`IptablesCommand`] values and rendered to
//! shell by a single `Display` implementation, so the ordering and fan-out
//! logic can be tested without string matching.
//!
//! The rule set is rebuilt in a temporary chain and swapped in place of the
//! live chain, keeping the window in which forwarded traffic is unfiltered as
//! small as iptables allows.

use crate::error::Result;
use crate::ip_alloc::client_addresses;
use crate::types::{AccessRule, DomainSnapshot, Protocol, RuleAction};
use std::fmt;

/// Chain holding the active access rules
pub const LIVE_CHAIN: &str = "WG_ACCESS_CONTROL";
/// Chain the next rule set is staged in before the swap
pub const TEMP_CHAIN: &str = "WG_ACCESS_TEMP";

/// One `-A <chain>` match rule
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilterRule {
    /// Ingress interface (the tunnel)
    pub interface: String,
    pub source: Option<String>,
    pub destination: Option<String>,
    pub protocol: Protocol,
    /// Destination port, only rendered for tcp/udp
    pub port: Option<u16>,
    pub action: RuleAction,
}

/// A single iptables invocation in the generated script
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IptablesCommand {
    /// Accept WireGuard traffic on the UDP listen port unless the rule already exists
    EnsureListenPortOpen(u16),
    /// `-P FORWARD <policy>`
    ForwardPolicy(RuleAction),
    /// Accept RELATED,ESTABLISHED traffic unless the rule already exists
    EnsureEstablishedAccepted,
    /// `-N <chain>`, or `-F <chain>` when it already exists
    CreateOrFlushChain(&'static str),
    /// `-A <chain> ...`
    Append {
        chain: &'static str,
        rule: FilterRule,
    },
    /// `-I FORWARD -j <chain>`
    InsertJump(&'static str),
    /// `-D FORWARD -j <chain>`, tolerating absence
    DeleteJump(&'static str),
    /// `-F <chain>`, tolerating absence
    FlushChain(&'static str),
    /// `-X <chain>`, tolerating absence
    DeleteChain(&'static str),
    /// `-E <from> <to>`
    RenameChain {
        from: &'static str,
        to: &'static str,
    },
}

const ESTABLISHED_MATCH: &str = "FORWARD -m conntrack --ctstate RELATED,ESTABLISHED -j ACCEPT";

impl fmt::Display for FilterRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "-i {}", self.interface)?;
        if let Some(src) = &self.source {
            write!(f, " -s {}", src)?;
        }
        if let Some(dst) = &self.destination {
            write!(f, " -d {}", dst)?;
        }
        if let Some(proto) = self.protocol.as_match() {
            write!(f, " -p {}", proto)?;
            if let Some(port) = self.port {
                write!(f, " --dport {}", port)?;
            }
        }
        write!(f, " -j {}", self.action.target())
    }
}

impl fmt::Display for IptablesCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IptablesCommand::EnsureListenPortOpen(port) => write!(
                f,
                "iptables -C INPUT -p udp --dport {p} -j ACCEPT 2>/dev/null || iptables -A INPUT -p udp --dport {p} -j ACCEPT",
                p = port
            ),
            IptablesCommand::ForwardPolicy(action) => {
                write!(f, "iptables -P FORWARD {}", action.target())
            }
            IptablesCommand::EnsureEstablishedAccepted => write!(
                f,
                "iptables -C {m} 2>/dev/null || iptables -I {m}",
                m = ESTABLISHED_MATCH
            ),
            IptablesCommand::CreateOrFlushChain(chain) => {
                write!(f, "iptables -N {c} 2>/dev/null || iptables -F {c}", c = chain)
            }
            IptablesCommand::Append { chain, rule } => write!(f, "iptables -A {} {}", chain, rule),
            IptablesCommand::InsertJump(chain) => write!(f, "iptables -I FORWARD -j {}", chain),
            IptablesCommand::DeleteJump(chain) => {
                write!(f, "iptables -D FORWARD -j {} 2>/dev/null || true", chain)
            }
            IptablesCommand::FlushChain(chain) => {
                write!(f, "iptables -F {} 2>/dev/null || true", chain)
            }
            IptablesCommand::DeleteChain(chain) => {
                write!(f, "iptables -X {} 2>/dev/null || true", chain)
            }
            IptablesCommand::RenameChain { from, to } => write!(f, "iptables -E {} {}", from, to),
        }
    }
}

/// Commands run by the script's `apply` and `remove` subcommands
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FirewallPlan {
    pub up: Vec<IptablesCommand>,
    pub down: Vec<IptablesCommand>,
}

/// Rules in emission order: every DROP before every ACCEPT, then by priority,
/// keeping store order for ties
pub fn ordered_rules(rules: &[AccessRule]) -> Vec<&AccessRule> {
    let mut sorted: Vec<&AccessRule> = rules.iter().collect();
    sorted.sort_by_key(|r| {
        let group = match r.action {
            RuleAction::Drop => 0,
            RuleAction::Accept => 1,
        };
        (group, r.priority)
    });
    sorted
}

/// Source addresses of a rule. `vec![None]` means "any source"; an empty list
/// means the rule names a client that cannot be resolved and emits nothing.
fn resolve_sources(snapshot: &DomainSnapshot, rule: &AccessRule) -> Result<Vec<Option<String>>> {
    match rule.source_client_id {
        Some(id) => match snapshot.client(id) {
            Some(client) => Ok(client_addresses(snapshot, client)?.into_iter().map(Some).collect()),
            None => {
                log::warn!("Access rule {} references unknown source client {}", rule.id, id);
                Ok(Vec::new())
            }
        },
        None => Ok(vec![None]),
    }
}

fn resolve_destinations(
    snapshot: &DomainSnapshot,
    rule: &AccessRule,
) -> Result<Vec<Option<String>>> {
    if let Some(id) = rule.dest_client_id {
        return match snapshot.client(id) {
            Some(client) => Ok(client_addresses(snapshot, client)?.into_iter().map(Some).collect()),
            None => {
                log::warn!("Access rule {} references unknown destination client {}", rule.id, id);
                Ok(Vec::new())
            }
        };
    }
    match &rule.dest_cidr {
        Some(cidr) => Ok(vec![Some(cidr.clone())]),
        None => Ok(vec![None]),
    }
}

/// Build the typed command plan for `snapshot` on tunnel interface `interface`.
///
/// Once server setup is complete the listen port is opened in INPUT as well.
/// That rule is left in place by `remove`.
pub fn plan(snapshot: &DomainSnapshot, interface: &str) -> Result<FirewallPlan> {
    let mut up = Vec::new();
    if snapshot.server.setup_completed {
        up.push(IptablesCommand::EnsureListenPortOpen(snapshot.server.port));
    }
    up.extend([
        IptablesCommand::ForwardPolicy(RuleAction::Drop),
        IptablesCommand::EnsureEstablishedAccepted,
        IptablesCommand::CreateOrFlushChain(TEMP_CHAIN),
    ]);

    for rule in ordered_rules(&snapshot.rules) {
        let sources = resolve_sources(snapshot, rule)?;
        let destinations = resolve_destinations(snapshot, rule)?;

        for source in &sources {
            for destination in &destinations {
                up.push(IptablesCommand::Append {
                    chain: TEMP_CHAIN,
                    rule: FilterRule {
                        interface: interface.to_string(),
                        source: source.clone(),
                        destination: destination.clone(),
                        protocol: rule.proto,
                        port: rule.port,
                        action: rule.action,
                    },
                });
            }
        }
    }

    up.extend([
        IptablesCommand::InsertJump(TEMP_CHAIN),
        IptablesCommand::DeleteJump(LIVE_CHAIN),
        IptablesCommand::FlushChain(LIVE_CHAIN),
        IptablesCommand::DeleteChain(LIVE_CHAIN),
        IptablesCommand::RenameChain {
            from: TEMP_CHAIN,
            to: LIVE_CHAIN,
        },
    ]);

    let down = vec![
        IptablesCommand::DeleteJump(LIVE_CHAIN),
        IptablesCommand::FlushChain(LIVE_CHAIN),
        IptablesCommand::DeleteChain(LIVE_CHAIN),
        // never leave forwarding closed once the tunnel is gone
        IptablesCommand::ForwardPolicy(RuleAction::Accept),
    ];

    Ok(FirewallPlan { up, down })
}

/// Render the plan as (apply, remove) command strings
pub fn render_iptables_commands(
    snapshot: &DomainSnapshot,
    interface: &str,
) -> Result<(Vec<String>, Vec<String>)> {
    let plan = plan(snapshot, interface)?;
    Ok((
        plan.up.iter().map(ToString::to_string).collect(),
        plan.down.iter().map(ToString::to_string).collect(),
    ))
}

/// Render the POSIX shell script exposing `apply` and `remove`
pub fn render_firewall_script(snapshot: &DomainSnapshot, interface: &str) -> Result<String> {
    let (up, down) = render_iptables_commands(snapshot, interface)?;

    let mut script = vec![
        "#!/bin/sh".to_string(),
        "# Automatically generated WireGuard firewall script".to_string(),
        String::new(),
        "apply_rules() {".to_string(),
    ];
    script.extend(up.iter().map(|cmd| format!("  {}", cmd)));
    script.extend(["}".to_string(), String::new(), "remove_rules() {".to_string()]);
    script.extend(down.iter().map(|cmd| format!("  {}", cmd)));
    script.extend(
        [
            "}",
            "",
            "case \"$1\" in",
            "  apply)",
            "    apply_rules",
            "    ;;",
            "  remove)",
            "    remove_rules",
            "    ;;",
            "  *)",
            "    echo \"Usage: $0 {apply|remove}\"",
            "    exit 1",
            "    ;;",
            "esac",
            "",
        ]
        .map(String::from),
    );

    Ok(script.join("\n"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Client, DestinationType, DnsMode, Network};

    fn client(id: u32, name: &str, octet: u8) -> Client {
        Client {
            id,
            name: name.to_string(),
            public_key: format!("{}-pub", name),
            private_key: format!("{}-priv", name),
            preshared_key: None,
            octet,
            enabled: true,
            keepalive: None,
            dns_mode: DnsMode::Default,
            dns_servers: None,
            network_ids: vec![1],
        }
    }

    fn rule(id: u32, action: RuleAction) -> AccessRule {
        AccessRule {
            id,
            source_client_id: None,
            dest_client_id: None,
            dest_cidr: Some(format!("192.0.2.{}/32", id)),
            destination_type: DestinationType::Host,
            port: None,
            proto: Protocol::All,
            action,
            priority: 0,
        }
    }

    fn snapshot(rules: Vec<AccessRule>) -> DomainSnapshot {
        DomainSnapshot {
            networks: vec![Network {
                id: 1,
                name: "lan".into(),
                cidr: "10.0.1.0/24".into(),
                interface_address: "10.0.1.1/24".into(),
            }],
            clients: vec![client(1, "laptop", 5), client(2, "nas", 9)],
            rules,
            ..Default::default()
        }
    }

    #[test]
    fn test_dns_accept_rule_scenario() {
        let mut r = rule(1, RuleAction::Accept);
        r.source_client_id = Some(1);
        r.dest_cidr = Some("8.8.8.8/32".into());
        r.port = Some(53);
        r.proto = Protocol::Udp;

        let (up, _) = render_iptables_commands(&snapshot(vec![r]), "wg0").unwrap();
        assert!(up.contains(
            &"iptables -A WG_ACCESS_TEMP -i wg0 -s 10.0.1.5/32 -d 8.8.8.8/32 -p udp --dport 53 -j ACCEPT"
                .to_string()
        ));
    }

    #[test]
    fn test_drop_rules_precede_accept_rules() {
        let rules = vec![
            rule(1, RuleAction::Accept),
            rule(2, RuleAction::Drop),
            rule(3, RuleAction::Accept),
            rule(4, RuleAction::Drop),
        ];
        let plan = plan(&snapshot(rules), "wg0").unwrap();

        let order: Vec<_> = plan
            .up
            .iter()
            .filter_map(|cmd| match cmd {
                IptablesCommand::Append { rule, .. } => rule.destination.clone(),
                _ => None,
            })
            .collect();
        assert_eq!(
            order,
            vec!["192.0.2.2/32", "192.0.2.4/32", "192.0.2.1/32", "192.0.2.3/32"]
        );
    }

    #[test]
    fn test_priority_orders_within_action_group() {
        let mut late_drop = rule(1, RuleAction::Drop);
        late_drop.priority = 10;
        let early_drop = rule(2, RuleAction::Drop);
        let mut first_accept = rule(3, RuleAction::Accept);
        first_accept.priority = -5;

        let rules = [late_drop, early_drop, first_accept];
        let ordered = ordered_rules(&rules);
        let ids: Vec<_> = ordered.iter().map(|r| r.id).collect();
        assert_eq!(ids, vec![2, 1, 3]);
    }

    #[test]
    fn test_client_to_client_fan_out() {
        let mut snap = snapshot(Vec::new());
        snap.networks.push(Network {
            id: 2,
            name: "iot".into(),
            cidr: "10.0.2.0/24".into(),
            interface_address: "10.0.2.1/24".into(),
        });
        snap.clients[0].network_ids = vec![1, 2];
        snap.clients[1].network_ids = vec![1, 2];
        let mut r = rule(1, RuleAction::Drop);
        r.source_client_id = Some(1);
        r.dest_client_id = Some(2);
        r.dest_cidr = None;
        r.proto = Protocol::Tcp;
        r.port = Some(22);
        snap.rules = vec![r];

        let (up, _) = render_iptables_commands(&snap, "wg0").unwrap();
        let appends: Vec<_> = up.iter().filter(|c| c.contains("-A WG_ACCESS_TEMP")).collect();
        assert_eq!(appends.len(), 4);
        assert_eq!(
            appends[0],
            "iptables -A WG_ACCESS_TEMP -i wg0 -s 10.0.1.5/32 -d 10.0.1.9/32 -p tcp --dport 22 -j DROP"
        );
        assert_eq!(
            appends[3],
            "iptables -A WG_ACCESS_TEMP -i wg0 -s 10.0.2.5/32 -d 10.0.2.9/32 -p tcp --dport 22 -j DROP"
        );
    }

    #[test]
    fn test_unspecified_source_and_destination() {
        let mut r = rule(1, RuleAction::Drop);
        r.dest_cidr = None;
        r.port = Some(80);

        let (up, _) = render_iptables_commands(&snapshot(vec![r]), "wg0").unwrap();
        // port is ignored without a tcp/udp protocol
        assert!(up.contains(&"iptables -A WG_ACCESS_TEMP -i wg0 -j DROP".to_string()));
    }

    #[test]
    fn test_unknown_client_emits_nothing() {
        let mut r = rule(1, RuleAction::Accept);
        r.source_client_id = Some(99);

        let plan = plan(&snapshot(vec![r]), "wg0").unwrap();
        assert!(!plan
            .up
            .iter()
            .any(|cmd| matches!(cmd, IptablesCommand::Append { .. })));
    }

    #[test]
    fn test_invalid_octet_fails_closed() {
        let mut snap = snapshot(Vec::new());
        snap.networks[0].cidr = "10.0.1.128/25".into();
        let mut r = rule(1, RuleAction::Accept);
        r.source_client_id = Some(1);
        snap.rules = vec![r];

        assert!(plan(&snap, "wg0").is_err());
    }

    #[test]
    fn test_chain_swap_sequence() {
        let (up, down) = render_iptables_commands(&snapshot(Vec::new()), "wg0").unwrap();
        assert_eq!(
            up,
            vec![
                "iptables -P FORWARD DROP",
                "iptables -C FORWARD -m conntrack --ctstate RELATED,ESTABLISHED -j ACCEPT 2>/dev/null || iptables -I FORWARD -m conntrack --ctstate RELATED,ESTABLISHED -j ACCEPT",
                "iptables -N WG_ACCESS_TEMP 2>/dev/null || iptables -F WG_ACCESS_TEMP",
                "iptables -I FORWARD -j WG_ACCESS_TEMP",
                "iptables -D FORWARD -j WG_ACCESS_CONTROL 2>/dev/null || true",
                "iptables -F WG_ACCESS_CONTROL 2>/dev/null || true",
                "iptables -X WG_ACCESS_CONTROL 2>/dev/null || true",
                "iptables -E WG_ACCESS_TEMP WG_ACCESS_CONTROL",
            ]
        );
        assert_eq!(down.last().unwrap(), "iptables -P FORWARD ACCEPT");
        assert_eq!(down[0], "iptables -D FORWARD -j WG_ACCESS_CONTROL 2>/dev/null || true");
    }

    #[test]
    fn test_listen_port_opened_after_setup() {
        let mut snap = snapshot(Vec::new());
        let (up, _) = render_iptables_commands(&snap, "wg0").unwrap();
        assert!(up.iter().all(|cmd| !cmd.contains("INPUT")));

        snap.server.setup_completed = true;
        snap.server.port = 51900;
        let plan = plan(&snap, "wg0").unwrap();
        assert_eq!(plan.up[0], IptablesCommand::EnsureListenPortOpen(51900));
        assert_eq!(
            plan.up[0].to_string(),
            "iptables -C INPUT -p udp --dport 51900 -j ACCEPT 2>/dev/null || iptables -A INPUT -p udp --dport 51900 -j ACCEPT"
        );
        assert!(plan.down.iter().all(|cmd| !cmd.to_string().contains("INPUT")));
    }

    #[test]
    fn test_script_subcommands() {
        let script = render_firewall_script(&snapshot(vec![rule(1, RuleAction::Drop)]), "wg0").unwrap();

        assert!(script.starts_with("#!/bin/sh\n"));
        assert!(script.contains("apply_rules() {\n  iptables -P FORWARD DROP"));
        assert!(script.contains("remove_rules() {\n  iptables -D FORWARD -j WG_ACCESS_CONTROL"));
        assert!(script.contains("  apply)\n    apply_rules"));
        assert!(script.contains("  remove)\n    remove_rules"));
        assert!(script.contains("exit 1"));
    }

    #[test]
    fn test_interface_name_flows_into_rules() {
        let (up, _) = render_iptables_commands(&snapshot(vec![rule(1, RuleAction::Drop)]), "wg7").unwrap();
        assert!(up.iter().any(|c| c.starts_with("iptables -A WG_ACCESS_TEMP -i wg7 ")));
    }
}
