use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use dynocluster::{
    clusterdef::{ClusterDef, NodeGroupDef, Service},
    config::Config,
    deployment::Deployer,
    docker::{DockerDeployer, NodeInfo},
};

#[derive(Parser, Debug)]
#[command(name = "dynocluster", version, about = "Ephemeral test clusters on local containers")]
struct Cli {
    /// Emit logs as JSON
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List clusters and their nodes
    Ps,
    /// Create a new cluster
    Create(CreateArgs),
    /// Remove one cluster
    Rm { cluster_id: String },
    /// Remove every managed node
    RmAll,
    /// Remove nodes whose expiry has passed
    Cleanup,
    /// Print the connection string of a cluster
    Connstr { cluster_id: String },
    /// Cut a node off from its peers, keeping the gateway reachable
    BlockTraffic { node: String },
    /// Restore a node's network traffic
    AllowTraffic { node: String },
    /// List locally available server images
    Images {
        /// Only versions matching this prefix, e.g. `7.2`
        version: Option<String>,
    },
}

#[derive(Args, Debug)]
struct CreateArgs {
    /// Server version for every node
    #[arg(value_name = "VERSION", required_unless_present = "def")]
    server_version: Option<String>,

    /// Cluster definition as JSON instead of the flags below
    #[arg(long, conflicts_with = "server_version")]
    def: Option<PathBuf>,

    #[arg(long, default_value_t = 3)]
    nodes: usize,

    #[arg(long, default_value_t = 0)]
    build: u32,

    #[arg(long)]
    community: bool,

    #[arg(long)]
    serverless: bool,

    #[arg(long)]
    columnar: bool,

    /// Comma-separated services, e.g. `kv,n1ql,index`
    #[arg(long)]
    services: Option<String>,

    #[arg(long, default_value = "")]
    purpose: String,

    /// Lifetime in minutes; the configured default when unset
    #[arg(long)]
    expiry_minutes: Option<u64>,
}

impl CreateArgs {
    fn cluster_def(&self) -> Result<ClusterDef> {
        if let Some(path) = &self.def {
            let raw = std::fs::read_to_string(path)
                .with_context(|| format!("failed to read {}", path.display()))?;
            return serde_json::from_str(&raw)
                .with_context(|| format!("invalid cluster definition in {}", path.display()));
        }

        let Some(version) = self.server_version.clone() else {
            bail!("either a version or --def is required");
        };
        let expiry = match self.expiry_minutes {
            Some(minutes) => match minutes.checked_mul(60) {
                Some(secs) => Some(Duration::from_secs(secs)),
                None => bail!("--expiry-minutes {} is out of range", minutes),
            },
            None => None,
        };
        let services = match &self.services {
            Some(list) => Service::parse_list(list)?,
            None => Vec::new(),
        };

        Ok(ClusterDef {
            purpose: self.purpose.clone(),
            expiry,
            nodes: vec![NodeGroupDef {
                count: self.nodes,
                version,
                build_no: self.build,
                use_community_edition: self.community,
                use_serverless: self.serverless,
                use_columnar: self.columnar,
                services,
            }],
        })
    }
}

fn init_tracing(json: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info".into());

    if json {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .init();
    }
}

/// Cancelled on Ctrl-C so in-flight waits return promptly
fn shutdown_token() -> CancellationToken {
    let token = CancellationToken::new();
    let trigger = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("Interrupted, cancelling");
            trigger.cancel();
        }
    });
    token
}

async fn find_node(deployer: &DockerDeployer, needle: &str) -> Result<NodeInfo> {
    let nodes = deployer.controller().list_nodes().await?;
    let matches: Vec<NodeInfo> = nodes
        .into_iter()
        .filter(|n| n.node_id == needle || n.name == needle || n.resource_id.starts_with(needle))
        .collect();

    match matches.len() {
        0 => bail!("no node matches `{}`", needle),
        1 => Ok(matches.into_iter().next().context("node vanished")?),
        n => bail!("`{}` is ambiguous, it matches {} nodes", needle, n),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.json);

    let config = Config::load()?;
    let deployer = DockerDeployer::from_config(&config).context("failed to set up docker backend")?;
    let cancel = shutdown_token();

    match cli.command {
        Command::Ps => {
            for cluster in deployer.list_clusters().await? {
                let expiry = cluster
                    .expiry
                    .map(|e| e.to_rfc3339())
                    .unwrap_or_else(|| "unknown".to_string());
                println!(
                    "{} [{}] purpose={:?} expiry={}",
                    cluster.cluster_id, cluster.state, cluster.purpose, expiry
                );
                for node in cluster.nodes {
                    println!(
                        "  {} {} {}",
                        node.node_id,
                        node.name,
                        node.ip_address.as_deref().unwrap_or("-")
                    );
                }
            }
        }
        Command::Create(args) => {
            let def = args.cluster_def()?;
            let cluster = deployer.new_cluster(&def, &cancel).await?;
            tracing::info!(cluster_id = %cluster.cluster_id, nodes = cluster.nodes.len(), "Cluster created");
            println!("{}", cluster.cluster_id);
        }
        Command::Rm { cluster_id } => {
            deployer.remove_cluster(&cluster_id, &cancel).await?;
        }
        Command::RmAll => {
            deployer.remove_all(&cancel).await?;
        }
        Command::Cleanup => {
            deployer.cleanup(&cancel).await?;
        }
        Command::Connstr { cluster_id } => {
            println!("{}", deployer.get_connect_info(&cluster_id).await?.conn_str);
        }
        Command::BlockTraffic { node } => {
            let node = find_node(&deployer, &node).await?;
            deployer
                .controller()
                .set_traffic_control(&node.resource_id, true)
                .await?;
            tracing::info!(node_id = %node.node_id, "Traffic blocked");
        }
        Command::AllowTraffic { node } => {
            let node = find_node(&deployer, &node).await?;
            deployer
                .controller()
                .set_traffic_control(&node.resource_id, false)
                .await?;
            tracing::info!(node_id = %node.node_id, "Traffic allowed");
        }
        Command::Images { version } => {
            let images = match version {
                Some(version) => deployer.images().search_images(&version).await?,
                None => deployer.images().list_images().await?,
            };
            for image in images {
                println!("{} ({})", image.name, image.version);
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn create_args(args: &[&str]) -> CreateArgs {
        let cli = Cli::try_parse_from(["dynocluster", "create"].iter().chain(args)).unwrap();
        match cli.command {
            Command::Create(args) => args,
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn test_create_args_build_single_group() {
        let def = create_args(&["7.2.0", "--nodes", "2", "--expiry-minutes", "30"])
            .cluster_def()
            .unwrap();

        assert_eq!(def.expiry, Some(Duration::from_secs(1800)));
        assert_eq!(def.nodes.len(), 1);
        assert_eq!(def.nodes[0].count, 2);
        assert_eq!(def.nodes[0].version, "7.2.0");
    }

    #[test]
    fn test_oversized_expiry_minutes_is_rejected() {
        let args = create_args(&["7.2.0", "--expiry-minutes", &u64::MAX.to_string()]);

        let err = args.cluster_def().unwrap_err();
        assert!(err.to_string().contains("out of range"));
    }
}
