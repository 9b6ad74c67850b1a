//! Sandbox bridge network lifecycle.
//!
//! The bridge uses explicit IPAM (fixed subnet and gateway) so the host
//! address containers see never moves between restarts; both proxies bind to
//! it. The network is *not* `internal`: the node itself still needs the
//! default route for RPC traffic, and egress restriction is the firewall's
//! job, not the bridge's.

use bollard::Docker;
use bollard::models::{Ipam, IpamConfig, Network};
use bollard::network::{CreateNetworkOptions, InspectNetworkOptions};
use std::collections::HashMap;

use crate::config::SandboxNetworkConfig;

/// Resolved identity of the sandbox network.
#[derive(Debug, Clone)]
pub struct NetworkInfo {
    pub name: String,
    pub subnet: String,
    pub gateway: String,
}

#[derive(Debug, thiserror::Error)]
pub enum SandboxNetError {
    #[error("docker network operation failed: {0}")]
    Docker(#[from] bollard::errors::Error),
    #[error("existing network {name} is unusable: {reason}")]
    Invalid { name: String, reason: String },
}

/// Creates the sandbox bridge, or validates a pre-existing network of the
/// same name. An existing network without an IPv4 subnet and gateway is
/// refused rather than silently adopted.
pub async fn ensure_network(
    docker: &Docker,
    config: &SandboxNetworkConfig,
) -> Result<NetworkInfo, SandboxNetError> {
    match docker
        .inspect_network(&config.name, None::<InspectNetworkOptions<String>>)
        .await
    {
        Ok(existing) => {
            let (subnet, gateway) = ipv4_ipam(&existing).ok_or_else(|| SandboxNetError::Invalid {
                name: config.name.clone(),
                reason: "no IPv4 subnet and gateway in IPAM config".to_string(),
            })?;
            tracing::info!(name = %config.name, subnet, gateway, "reusing existing sandbox network");
            Ok(NetworkInfo {
                name: config.name.clone(),
                subnet,
                gateway,
            })
        }
        Err(bollard::errors::Error::DockerResponseServerError {
            status_code: 404, ..
        }) => {
            let mut options = HashMap::new();
            // Masquerade on: replies to node-initiated traffic must route back.
            options.insert(
                "com.docker.network.bridge.enable_ip_masquerade".to_string(),
                "true".to_string(),
            );
            docker
                .create_network(CreateNetworkOptions {
                    name: config.name.clone(),
                    driver: "bridge".to_string(),
                    internal: false,
                    ipam: Ipam {
                        driver: Some("default".to_string()),
                        config: Some(vec![IpamConfig {
                            subnet: Some(config.subnet.clone()),
                            gateway: Some(config.gateway.clone()),
                            ..Default::default()
                        }]),
                        options: None,
                    },
                    options,
                    ..Default::default()
                })
                .await?;
            tracing::info!(name = %config.name, subnet = %config.subnet, gateway = %config.gateway, "created sandbox network");
            Ok(NetworkInfo {
                name: config.name.clone(),
                subnet: config.subnet.clone(),
                gateway: config.gateway.clone(),
            })
        }
        Err(error) => Err(error.into()),
    }
}

/// Extracts the first IPv4 subnet/gateway pair from a network's IPAM config.
fn ipv4_ipam(network: &Network) -> Option<(String, String)> {
    let configs = network.ipam.as_ref()?.config.as_ref()?;
    configs.iter().find_map(|entry| {
        let subnet = entry.subnet.as_deref()?;
        let gateway = entry.gateway.as_deref()?;
        if subnet.contains('.') && gateway.contains('.') {
            Some((subnet.to_string(), gateway.to_string()))
        } else {
            None
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn network_with(config: Option<Vec<IpamConfig>>) -> Network {
        Network {
            ipam: Some(Ipam {
                driver: Some("default".to_string()),
                config,
                options: None,
            }),
            ..Default::default()
        }
    }

    #[test]
    fn ipv4_pair_is_extracted() {
        let network = network_with(Some(vec![IpamConfig {
            subnet: Some("172.28.0.0/24".to_string()),
            gateway: Some("172.28.0.1".to_string()),
            ..Default::default()
        }]));
        assert_eq!(
            ipv4_ipam(&network),
            Some(("172.28.0.0/24".to_string(), "172.28.0.1".to_string()))
        );
    }

    #[test]
    fn ipv6_only_network_is_rejected() {
        let network = network_with(Some(vec![IpamConfig {
            subnet: Some("fd00::/64".to_string()),
            gateway: Some("fd00::1".to_string()),
            ..Default::default()
        }]));
        assert_eq!(ipv4_ipam(&network), None);
    }

    #[test]
    fn missing_ipam_is_rejected() {
        assert_eq!(ipv4_ipam(&Network::default()), None);
        assert_eq!(ipv4_ipam(&network_with(None)), None);
        assert_eq!(ipv4_ipam(&network_with(Some(vec![]))), None);
    }

    #[test]
    fn ipv4_entry_is_found_after_ipv6() {
        let network = network_with(Some(vec![
            IpamConfig {
                subnet: Some("fd00::/64".to_string()),
                gateway: Some("fd00::1".to_string()),
                ..Default::default()
            },
            IpamConfig {
                subnet: Some("172.28.0.0/24".to_string()),
                gateway: Some("172.28.0.1".to_string()),
                ..Default::default()
            },
        ]));
        assert!(ipv4_ipam(&network).is_some());
    }
}
