//! Egress firewall for the sandbox subnet.
//!
//! Rules are installed at the top of the engine-provided `DOCKER-USER` chain,
//! in order:
//!
//! 1. accept established/related traffic back into the subnet,
//! 2. accept `subnet -> gateway` on each allowlisted port,
//! 3. drop `subnet -> subnet` (no lateral movement between workloads),
//! 4. drop everything else sourced from the subnet.
//!
//! Hosts with a restrictive INPUT policy additionally get an accept for
//! `subnet -> gateway:port` on INPUT. Every rule is existence-checked with
//! `iptables -C` before insertion, so reapplying is a no-op. Rules are never
//! torn down: they are scoped to the sandbox subnet and become inert once the
//! network is removed.

use tokio::process::Command;

/// Chain a rule is installed into.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Chain {
    DockerUser,
    Input,
}

impl Chain {
    fn as_str(&self) -> &'static str {
        match self {
            Chain::DockerUser => "DOCKER-USER",
            Chain::Input => "INPUT",
        }
    }
}

/// One packet-filter rule: chain plus the match/target arguments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FirewallRule {
    pub chain: Chain,
    pub args: Vec<String>,
}

/// Outcome of a firewall application attempt.
#[derive(Debug)]
pub enum FirewallStatus {
    /// Rules are in place; counts rules inserted by this run (0 = all
    /// pre-existing).
    Applied { inserted: usize, total: usize },
    /// The packet-filter toolkit is unavailable; the node runs WITHOUT
    /// network isolation.
    Skipped { reason: String },
}

#[derive(Debug, thiserror::Error)]
pub enum FirewallError {
    #[error("failed to run iptables: {0}")]
    Exec(#[from] std::io::Error),
    #[error("iptables rejected rule `{rule}`: {stderr}")]
    Rejected { rule: String, stderr: String },
}

/// Renders the full rule set for a subnet/gateway pair and allowlist.
///
/// Deterministic: the same inputs always produce the same rules in the same
/// order, which is what makes the existence-checked install idempotent.
pub fn build_rules(subnet: &str, gateway: &str, allow_ports: &[u16]) -> Vec<FirewallRule> {
    let mut rules = Vec::new();

    rules.push(FirewallRule {
        chain: Chain::DockerUser,
        args: str_args(&[
            "-d", subnet, "-m", "conntrack", "--ctstate", "ESTABLISHED,RELATED", "-j", "ACCEPT",
        ]),
    });
    for port in allow_ports {
        rules.push(FirewallRule {
            chain: Chain::DockerUser,
            args: str_args(&[
                "-s",
                subnet,
                "-d",
                gateway,
                "-p",
                "tcp",
                "--dport",
                &port.to_string(),
                "-j",
                "ACCEPT",
            ]),
        });
    }
    rules.push(FirewallRule {
        chain: Chain::DockerUser,
        args: str_args(&["-s", subnet, "-d", subnet, "-j", "DROP"]),
    });
    rules.push(FirewallRule {
        chain: Chain::DockerUser,
        args: str_args(&["-s", subnet, "-j", "DROP"]),
    });

    // Some hosts run a default-drop INPUT policy; without these the proxies
    // on the gateway are unreachable from the subnet.
    for port in allow_ports {
        rules.push(FirewallRule {
            chain: Chain::Input,
            args: str_args(&[
                "-s",
                subnet,
                "-d",
                gateway,
                "-p",
                "tcp",
                "--dport",
                &port.to_string(),
                "-j",
                "ACCEPT",
            ]),
        });
    }

    rules
}

/// Installs the rule set, inserting each missing rule at its position from
/// the top of its chain. Missing toolkit reports [`FirewallStatus::Skipped`].
pub async fn apply(
    subnet: &str,
    gateway: &str,
    allow_ports: &[u16],
) -> Result<FirewallStatus, FirewallError> {
    if !iptables_available().await {
        return Ok(FirewallStatus::Skipped {
            reason: "iptables not found on this host".to_string(),
        });
    }

    let rules = build_rules(subnet, gateway, allow_ports);
    let mut inserted = 0;
    // Per-chain insert positions keep the rendered order under `-I`.
    let mut docker_user_position = 0;
    let mut input_position = 0;

    for rule in &rules {
        let position = match rule.chain {
            Chain::DockerUser => {
                docker_user_position += 1;
                docker_user_position
            }
            Chain::Input => {
                input_position += 1;
                input_position
            }
        };
        if rule_exists(rule).await? {
            continue;
        }
        insert_rule(rule, position).await?;
        inserted += 1;
    }

    Ok(FirewallStatus::Applied {
        inserted,
        total: rules.len(),
    })
}

async fn iptables_available() -> bool {
    Command::new("iptables")
        .arg("--version")
        .output()
        .await
        .map(|output| output.status.success())
        .unwrap_or(false)
}

async fn rule_exists(rule: &FirewallRule) -> Result<bool, FirewallError> {
    let output = Command::new("iptables")
        .arg("-C")
        .arg(rule.chain.as_str())
        .args(&rule.args)
        .output()
        .await?;
    Ok(output.status.success())
}

async fn insert_rule(rule: &FirewallRule, position: usize) -> Result<(), FirewallError> {
    let output = Command::new("iptables")
        .arg("-I")
        .arg(rule.chain.as_str())
        .arg(position.to_string())
        .args(&rule.args)
        .output()
        .await?;
    if !output.status.success() {
        return Err(FirewallError::Rejected {
            rule: format!("{} {}", rule.chain.as_str(), rule.args.join(" ")),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }
    tracing::info!(chain = rule.chain.as_str(), rule = %rule.args.join(" "), "installed firewall rule");
    Ok(())
}

fn str_args(args: &[&str]) -> Vec<String> {
    args.iter().map(|s| s.to_string()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rule_set_shape_and_order() {
        let rules = build_rules("172.28.0.0/24", "172.28.0.1", &[8741, 8742]);
        // conntrack + 2 allows + 2 drops on DOCKER-USER, 2 allows on INPUT.
        assert_eq!(rules.len(), 7);
        assert!(rules[0].args.contains(&"ESTABLISHED,RELATED".to_string()));
        assert_eq!(rules[1].args[7], "8741");
        assert_eq!(rules[2].args[7], "8742");
        assert_eq!(
            rules[3].args,
            vec!["-s", "172.28.0.0/24", "-d", "172.28.0.0/24", "-j", "DROP"]
        );
        assert_eq!(rules[4].args, vec!["-s", "172.28.0.0/24", "-j", "DROP"]);
        assert!(rules[5..].iter().all(|r| r.chain == Chain::Input));
    }

    #[test]
    fn catch_all_drop_comes_after_allows() {
        let rules = build_rules("10.9.0.0/24", "10.9.0.1", &[3128]);
        let drop_index = rules
            .iter()
            .position(|r| r.args == vec!["-s", "10.9.0.0/24", "-j", "DROP"])
            .unwrap();
        let allow_index = rules
            .iter()
            .position(|r| r.args.contains(&"3128".to_string()) && r.chain == Chain::DockerUser)
            .unwrap();
        assert!(allow_index < drop_index);
    }

    #[test]
    fn rendering_is_deterministic() {
        let a = build_rules("172.28.0.0/24", "172.28.0.1", &[8741]);
        let b = build_rules("172.28.0.0/24", "172.28.0.1", &[8741]);
        assert_eq!(a, b);
    }

    #[test]
    fn no_ports_still_locks_the_subnet_down() {
        let rules = build_rules("172.28.0.0/24", "172.28.0.1", &[]);
        assert_eq!(rules.len(), 3);
        assert!(rules.iter().all(|r| r.chain == Chain::DockerUser));
    }
}
