//! Network partition simulation with in-container packet filtering
//!
//! Rules live in the node container's own INPUT chain, so only the node under
//! test is affected. Traffic from the network gateway is always accepted so the
//! host can keep managing the node while its peers are cut off.

use std::sync::Arc;

use tracing::{debug, info, instrument, Span};

use super::runtime::{ContainerRuntime, ExecOutput};
use crate::error::{DeployError, Result};

/// One iptables invocation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FilterRule {
    /// Remove every rule from every chain
    Flush,
    /// Insert at the head of `chain`
    Insert {
        chain: &'static str,
        source: String,
        target: &'static str,
    },
}

impl FilterRule {
    pub fn args(&self) -> Vec<String> {
        match self {
            FilterRule::Flush => vec!["-F".to_string()],
            FilterRule::Insert {
                chain,
                source,
                target,
            } => vec![
                "-I".to_string(),
                chain.to_string(),
                "-s".to_string(),
                source.clone(),
                "-j".to_string(),
                target.to_string(),
            ],
        }
    }
}

/// Addressing of the shared node network
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeAddressing {
    pub gateway: String,
    /// Allocation range when the network has one, otherwise the subnet
    pub node_range: String,
}

/// Rule sequence for the requested state. Always starts with a flush; when
/// blocking, the gateway ACCEPT is inserted after the range DROP so it ends up
/// ahead of it in the chain.
pub fn partition_rules(addressing: &NodeAddressing, blocked: bool) -> Vec<FilterRule> {
    let mut rules = vec![FilterRule::Flush];
    if blocked {
        rules.push(FilterRule::Insert {
            chain: "INPUT",
            source: addressing.node_range.clone(),
            target: "DROP",
        });
        rules.push(FilterRule::Insert {
            chain: "INPUT",
            source: addressing.gateway.clone(),
            target: "ACCEPT",
        });
    }
    rules
}

pub struct TrafficController {
    runtime: Arc<dyn ContainerRuntime>,
    network_name: String,
    span: Span,
}

impl TrafficController {
    pub fn new(runtime: Arc<dyn ContainerRuntime>, network_name: impl Into<String>) -> Self {
        Self {
            runtime,
            network_name: network_name.into(),
            span: tracing::debug_span!("traffic_control"),
        }
    }

    pub fn with_span(mut self, span: Span) -> Self {
        self.span = span;
        self
    }

    /// Block or restore inbound peer traffic for one node container.
    ///
    /// Prior rules are always flushed first. If iptables is missing it is
    /// installed and the whole sequence is retried once.
    #[instrument(parent = &self.span, skip(self))]
    pub async fn set_traffic_control(&self, resource_id: &str, blocked: bool) -> Result<()> {
        debug!("setting up traffic control");

        let addressing = self.resolve_addressing().await?;
        let rules = partition_rules(&addressing, blocked);

        match self.apply_rules(resource_id, &rules).await {
            Ok(()) => {}
            Err(e) if matches!(e.root(), DeployError::ToolMissing { .. }) => {
                info!("iptables is not installed, installing it");
                self.install_iptables(resource_id).await?;
                self.apply_rules(resource_id, &rules).await?;
            }
            Err(e) => return Err(e),
        }

        match self.iptables(resource_id, &["-S".to_string()]).await {
            Ok(output) => debug!(rules = %output.stdout.trim(), "current iptables state"),
            Err(e) => debug!(error = %e, "failed to print iptables state"),
        }

        debug!("traffic control has been set up");
        Ok(())
    }

    /// Gateway and node range of the shared network's single IPAM block
    pub async fn resolve_addressing(&self) -> Result<NodeAddressing> {
        let blocks = self.runtime.network_ipam(&self.network_name).await?;

        let block = match blocks.as_slice() {
            [block] => block,
            [] => {
                return Err(DeployError::Configuration(format!(
                    "network {} has no ipam config, cannot identify node subnet",
                    self.network_name
                )))
            }
            _ => {
                return Err(DeployError::Configuration(format!(
                    "network {} has more than one ipam config, cannot identify node subnet",
                    self.network_name
                )))
            }
        };

        let node_range = block.ip_range.clone().or_else(|| block.subnet.clone());
        match (block.gateway.clone(), node_range) {
            (Some(gateway), Some(node_range)) => Ok(NodeAddressing {
                gateway,
                node_range,
            }),
            _ => Err(DeployError::Configuration(format!(
                "failed to identify subnet or gateway ip of network {}",
                self.network_name
            ))),
        }
    }

    async fn apply_rules(&self, resource_id: &str, rules: &[FilterRule]) -> Result<()> {
        for rule in rules {
            self.iptables(resource_id, &rule.args()).await?;
        }
        Ok(())
    }

    async fn install_iptables(&self, resource_id: &str) -> Result<()> {
        self.exec_checked(resource_id, &["apt-get", "update"])
            .await
            .map_err(|e| e.for_resource(resource_id, "failed to update apt"))?;
        self.exec_checked(resource_id, &["apt-get", "-y", "install", "iptables"])
            .await
            .map_err(|e| e.for_resource(resource_id, "failed to install iptables"))?;
        Ok(())
    }

    async fn exec_checked(&self, resource_id: &str, cmd: &[&str]) -> Result<ExecOutput> {
        let cmd: Vec<String> = cmd.iter().map(|s| s.to_string()).collect();
        let output = self.runtime.exec(resource_id, &cmd).await?;
        if output.success() {
            Ok(output)
        } else {
            Err(DeployError::Backend(format!(
                "`{}` exited with {}: {}",
                cmd.join(" "),
                output.exit_code,
                output.stderr.trim()
            )))
        }
    }

    async fn iptables(&self, resource_id: &str, args: &[String]) -> Result<ExecOutput> {
        let mut cmd = Vec::with_capacity(args.len() + 1);
        cmd.push("iptables".to_string());
        cmd.extend_from_slice(args);

        debug!(cmd = ?cmd, "executing cmd");
        let output = self.runtime.exec(resource_id, &cmd).await?;

        if output.success() {
            Ok(output)
        } else if output.command_not_found() {
            Err(DeployError::ToolMissing {
                tool: "iptables".to_string(),
                resource: resource_id.to_string(),
            })
        } else {
            Err(DeployError::Backend(format!(
                "`iptables {}` exited with {}: {}",
                args.join(" "),
                output.exit_code,
                output.stderr.trim()
            )))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::docker::fake::{FakeRule, FakeRuntime, Verdict};
    use crate::docker::runtime::{ContainerSpec, IpamBlock, MockContainerRuntime};
    use std::net::Ipv4Addr;

    async fn node(runtime: &FakeRuntime) -> String {
        let id = runtime
            .create_container(&ContainerSpec {
                name: "dynonode-traffic".to_string(),
                ..Default::default()
            })
            .await
            .unwrap();
        runtime.start_container(&id).await.unwrap();
        id
    }

    fn controller(runtime: Arc<FakeRuntime>) -> TrafficController {
        TrafficController::new(runtime, "dynocluster")
    }

    #[tokio::test]
    async fn test_blocked_node_accepts_gateway_and_drops_peers() {
        let runtime = Arc::new(FakeRuntime::new());
        let id = node(&runtime).await;

        controller(runtime.clone())
            .set_traffic_control(&id, true)
            .await
            .unwrap();

        assert_eq!(
            runtime.rules(&id),
            vec![
                FakeRule {
                    chain: "INPUT".to_string(),
                    source: "172.28.5.254".to_string(),
                    target: "ACCEPT".to_string(),
                },
                FakeRule {
                    chain: "INPUT".to_string(),
                    source: "172.28.5.0/24".to_string(),
                    target: "DROP".to_string(),
                },
            ]
        );
        assert_eq!(
            runtime.evaluate_input(&id, Ipv4Addr::new(172, 28, 5, 254)),
            Verdict::Accept
        );
        assert_eq!(
            runtime.evaluate_input(&id, Ipv4Addr::new(172, 28, 5, 7)),
            Verdict::Drop
        );
        // outside the allocation range
        assert_eq!(
            runtime.evaluate_input(&id, Ipv4Addr::new(172, 28, 9, 1)),
            Verdict::Accept
        );
    }

    #[tokio::test]
    async fn test_block_then_unblock_matches_never_blocked() {
        let runtime = Arc::new(FakeRuntime::new());
        let toggled = node(&runtime).await;
        let untouched = runtime
            .create_container(&ContainerSpec {
                name: "dynonode-untouched".to_string(),
                ..Default::default()
            })
            .await
            .unwrap();

        let traffic = controller(runtime.clone());
        traffic.set_traffic_control(&toggled, true).await.unwrap();
        traffic.set_traffic_control(&toggled, false).await.unwrap();

        assert!(runtime.rules(&toggled).is_empty());
        assert_eq!(runtime.rules(&toggled), runtime.rules(&untouched));
        assert_eq!(
            runtime.evaluate_input(&toggled, Ipv4Addr::new(172, 28, 5, 7)),
            Verdict::Accept
        );
    }

    #[tokio::test]
    async fn test_repeated_block_does_not_stack_rules() {
        let runtime = Arc::new(FakeRuntime::new());
        let id = node(&runtime).await;

        let traffic = controller(runtime.clone());
        traffic.set_traffic_control(&id, true).await.unwrap();
        traffic.set_traffic_control(&id, true).await.unwrap();

        assert_eq!(runtime.rules(&id).len(), 2);
    }

    #[tokio::test]
    async fn test_installs_iptables_when_missing() {
        let runtime = Arc::new(FakeRuntime::new().without_iptables());
        let id = node(&runtime).await;

        controller(runtime.clone())
            .set_traffic_control(&id, true)
            .await
            .unwrap();

        let commands: Vec<String> = runtime
            .exec_log()
            .into_iter()
            .map(|(_, cmd)| cmd.join(" "))
            .collect();
        assert_eq!(commands[0], "iptables -F");
        assert_eq!(commands[1], "apt-get update");
        assert_eq!(commands[2], "apt-get -y install iptables");
        assert_eq!(commands[3], "iptables -F");
        assert_eq!(runtime.rules(&id).len(), 2);
    }

    #[tokio::test]
    async fn test_failed_install_is_fatal() {
        let runtime = Arc::new(FakeRuntime::new().without_iptables().without_apt());
        let id = node(&runtime).await;

        let err = controller(runtime.clone())
            .set_traffic_control(&id, true)
            .await
            .unwrap_err();

        assert!(err.to_string().contains("failed to update apt"));
        assert!(runtime.rules(&id).is_empty());
    }

    #[tokio::test]
    async fn test_retries_exactly_once_after_install() {
        let mut mock = MockContainerRuntime::new();
        mock.expect_network_ipam().returning(|_| {
            Ok(vec![IpamBlock {
                subnet: Some("10.1.0.0/16".to_string()),
                ip_range: None,
                gateway: Some("10.1.0.1".to_string()),
            }])
        });
        mock.expect_exec()
            .withf(|_, cmd| cmd[0] == "iptables")
            .times(2)
            .returning(|_, _| {
                Ok(ExecOutput {
                    exit_code: 127,
                    stdout: String::new(),
                    stderr: "iptables: command not found".to_string(),
                })
            });
        mock.expect_exec()
            .withf(|_, cmd| cmd[0] == "apt-get")
            .times(2)
            .returning(|_, _| Ok(ExecOutput::default()));

        let traffic = TrafficController::new(Arc::new(mock), "dynocluster");
        let err = traffic.set_traffic_control("abc", true).await.unwrap_err();

        assert!(matches!(err, DeployError::ToolMissing { .. }));
    }

    #[tokio::test]
    async fn test_subnet_used_when_no_ip_range() {
        let runtime = Arc::new(FakeRuntime::new().with_ipam(vec![IpamBlock {
            subnet: Some("172.28.0.0/16".to_string()),
            ip_range: None,
            gateway: Some("172.28.0.1".to_string()),
        }]));

        let addressing = controller(runtime).resolve_addressing().await.unwrap();
        assert_eq!(
            addressing,
            NodeAddressing {
                gateway: "172.28.0.1".to_string(),
                node_range: "172.28.0.0/16".to_string(),
            }
        );
    }

    #[tokio::test]
    async fn test_ambiguous_or_missing_addressing_is_configuration_error() {
        let block = IpamBlock {
            subnet: Some("172.28.0.0/16".to_string()),
            ip_range: None,
            gateway: Some("172.28.0.1".to_string()),
        };

        for ipam in [
            vec![],
            vec![block.clone(), block.clone()],
            vec![IpamBlock {
                gateway: None,
                ..block.clone()
            }],
        ] {
            let runtime = Arc::new(FakeRuntime::new().with_ipam(ipam));
            let id = node(&runtime).await;

            let err = controller(runtime.clone())
                .set_traffic_control(&id, true)
                .await
                .unwrap_err();
            assert!(matches!(err, DeployError::Configuration(_)));
            assert!(runtime.exec_log().is_empty());
        }
    }
}
