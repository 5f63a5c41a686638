use std::collections::BTreeMap;
use std::future::IntoFuture;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use serde::Serialize;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

use netrunner_client::Client;
use netrunner_control::types::{
    AddNodeRequest, LoadSnapshotRequest, RestartNodeRequest, StartRequest,
};
use netrunner_control::{create_router, ControlService, ServiceConfig};
use netrunner_network::{EXEC_PATH_ENV_VAR, PLUGIN_DIR_ENV_VAR};

#[derive(Parser, Debug)]
#[command(name = "netrunner")]
#[command(about = "Local validator fleet orchestrator", long_about = None)]
struct Cli {
    /// Log level
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the control service
    Server(ServerArgs),
    /// Ping a control server
    Ping(ClientArgs),
    /// Issue a control RPC
    Control(ControlArgs),
}

#[derive(Args, Debug)]
struct ServerArgs {
    /// Port of the control service
    #[arg(long, default_value_t = 8080)]
    port: u16,

    /// Optional second port mirroring every RPC as an HTTP gateway
    #[arg(long)]
    grpc_gateway_port: Option<u16>,

    /// Base directory for named snapshots
    #[arg(long)]
    snapshots_dir: Option<PathBuf>,

    /// Default parent directory for generated cluster state
    #[arg(long)]
    root_data_dir: Option<PathBuf>,
}

#[derive(Args, Debug)]
struct ClientArgs {
    /// Control server endpoint
    #[arg(long, default_value = "http://127.0.0.1:8080")]
    endpoint: String,

    /// Seconds to wait for the initial dial
    #[arg(long, default_value_t = 10)]
    dial_timeout: u64,
}

#[derive(Args, Debug)]
struct ControlArgs {
    #[command(flatten)]
    client: ClientArgs,

    #[command(subcommand)]
    command: ControlCommand,
}

#[derive(Subcommand, Debug)]
enum ControlCommand {
    /// Report the server's RPC version
    RpcVersion,
    /// Start a cluster
    Start {
        /// Validator binary
        #[arg(long, env = EXEC_PATH_ENV_VAR)]
        exec_path: String,
        #[arg(long)]
        num_nodes: Option<u32>,
        /// JSON object of flags applied to every node
        #[arg(long)]
        global_node_config: Option<String>,
        /// Path to a genesis document
        #[arg(long)]
        genesis_path: Option<PathBuf>,
        #[arg(long)]
        root_data_dir: Option<String>,
        #[arg(long, env = PLUGIN_DIR_ENV_VAR)]
        plugin_dir: Option<String>,
        /// JSON map of chain alias to config contents
        #[arg(long)]
        chain_configs: Option<String>,
        /// JSON map of chain alias to upgrade contents
        #[arg(long)]
        upgrade_configs: Option<String>,
        /// JSON map of subnet id to config contents
        #[arg(long)]
        subnet_configs: Option<String>,
        /// JSON map of node name to that node's flags
        #[arg(long)]
        custom_node_configs: Option<String>,
        /// JSON array of blockchain specs
        #[arg(long)]
        blockchain_specs: Option<String>,
        #[arg(long)]
        reassign_ports_if_used: bool,
        #[arg(long)]
        dynamic_ports: bool,
    },
    /// Stop the cluster
    Stop,
    /// One-shot health report
    Health,
    /// Block until the fleet reports healthy
    WaitForHealthy,
    /// API URIs of the running nodes
    Uris,
    /// Latest cluster status
    Status,
    /// Stream cluster status frames to stdout
    StreamStatus {
        /// Push interval in milliseconds
        #[arg(long, default_value_t = 1000)]
        push_interval: u64,
    },
    /// Add a node to the cluster
    AddNode {
        name: String,
        #[arg(long, env = EXEC_PATH_ENV_VAR)]
        exec_path: Option<String>,
        /// JSON object of node flags
        #[arg(long)]
        node_config: Option<String>,
        #[arg(long)]
        chain_configs: Option<String>,
        #[arg(long)]
        upgrade_configs: Option<String>,
        #[arg(long)]
        subnet_configs: Option<String>,
    },
    /// Remove a node
    RemoveNode { name: String },
    /// Restart a node in place
    RestartNode {
        name: String,
        #[arg(long)]
        exec_path: Option<String>,
        #[arg(long)]
        plugin_dir: Option<String>,
        #[arg(long)]
        track_subnets: Option<String>,
        #[arg(long)]
        chain_configs: Option<String>,
        #[arg(long)]
        upgrade_configs: Option<String>,
        #[arg(long)]
        subnet_configs: Option<String>,
    },
    /// Suspend a node without losing its state
    PauseNode { name: String },
    /// Resume a paused node
    ResumeNode { name: String },
    /// Create subnets from a JSON array of subnet specs
    CreateSubnets {
        #[arg(long)]
        subnet_specs: String,
    },
    /// Create blockchains from a JSON array of blockchain specs
    CreateBlockchains {
        #[arg(long)]
        blockchain_specs: String,
    },
    /// Transform subnets into elastic subnets
    TransformElasticSubnets {
        #[arg(long)]
        elastic_subnet_specs: String,
    },
    /// Stake validators on elastic subnets
    AddPermissionlessValidator {
        #[arg(long)]
        validator_specs: String,
    },
    /// Remove subnet validators
    RemoveSubnetValidator {
        #[arg(long)]
        validator_specs: String,
    },
    /// Attach a test peer to a node
    AttachPeer {
        #[arg(long)]
        node_name: String,
    },
    /// Send a message through an attached peer
    SendOutboundMessage {
        #[arg(long)]
        node_name: String,
        #[arg(long)]
        peer_id: String,
        #[arg(long)]
        op: u32,
        /// Message body
        #[arg(long)]
        message: String,
    },
    /// Save the cluster as a named snapshot
    SaveSnapshot { snapshot_name: String },
    /// Restore a cluster from a named snapshot
    LoadSnapshot {
        snapshot_name: String,
        #[arg(long, env = EXEC_PATH_ENV_VAR)]
        exec_path: Option<String>,
        #[arg(long, env = PLUGIN_DIR_ENV_VAR)]
        plugin_dir: Option<String>,
        #[arg(long)]
        root_data_dir: Option<String>,
        #[arg(long)]
        global_node_config: Option<String>,
        #[arg(long)]
        chain_configs: Option<String>,
        #[arg(long)]
        upgrade_configs: Option<String>,
        #[arg(long)]
        subnet_configs: Option<String>,
        #[arg(long)]
        reassign_ports_if_used: bool,
        #[arg(long)]
        dynamic_ports: bool,
    },
    /// Delete a named snapshot
    RemoveSnapshot { snapshot_name: String },
    /// List snapshot names
    GetSnapshotNames,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_level = match cli.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    match cli.command {
        Command::Server(args) => run_server(args).await,
        Command::Ping(args) => {
            let client = dial(&args).await?;
            print_response(&client.ping().await?)
        }
        Command::Control(args) => run_control(args).await,
    }
}

async fn run_server(args: ServerArgs) -> Result<()> {
    let snapshots_dir = args
        .snapshots_dir
        .unwrap_or_else(|| std::env::temp_dir().join("netrunner-snapshots"));
    info!("starting control service, snapshots dir = {:?}", snapshots_dir);

    let service = Arc::new(ControlService::new(ServiceConfig {
        snapshots_dir,
        root_data_dir: args.root_data_dir,
    }));
    let app = create_router(service);

    let addr: SocketAddr = ([0, 0, 0, 0], args.port).into();
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;
    info!("control service listening on http://{}", addr);

    if let Some(gateway_port) = args.grpc_gateway_port {
        let gateway_addr: SocketAddr = ([0, 0, 0, 0], gateway_port).into();
        let gateway_listener = tokio::net::TcpListener::bind(gateway_addr)
            .await
            .with_context(|| format!("Failed to bind {}", gateway_addr))?;
        info!("gateway mirror listening on http://{}", gateway_addr);
        let gateway_app = app.clone();
        tokio::try_join!(
            axum::serve(listener, app).into_future(),
            axum::serve(gateway_listener, gateway_app).into_future(),
        )?;
    } else {
        axum::serve(listener, app).await?;
    }
    Ok(())
}

async fn dial(args: &ClientArgs) -> Result<Client> {
    Client::new(&args.endpoint, Duration::from_secs(args.dial_timeout)).await
}

async fn run_control(args: ControlArgs) -> Result<()> {
    let client = dial(&args.client).await?;
    match args.command {
        ControlCommand::RpcVersion => print_response(&client.rpc_version().await?),
        ControlCommand::Start {
            exec_path,
            num_nodes,
            global_node_config,
            genesis_path,
            root_data_dir,
            plugin_dir,
            chain_configs,
            upgrade_configs,
            subnet_configs,
            custom_node_configs,
            blockchain_specs,
            reassign_ports_if_used,
            dynamic_ports,
        } => {
            let genesis = match genesis_path {
                Some(path) => Some(
                    std::fs::read_to_string(&path)
                        .with_context(|| format!("Failed to read genesis {:?}", path))?,
                ),
                None => None,
            };
            let req = StartRequest {
                exec_path,
                num_nodes,
                global_node_config,
                genesis,
                root_data_dir,
                plugin_dir,
                chain_configs: parse_map(chain_configs.as_deref())?,
                upgrade_configs: parse_map(upgrade_configs.as_deref())?,
                subnet_configs: parse_map(subnet_configs.as_deref())?,
                custom_node_configs: parse_map(custom_node_configs.as_deref())?,
                blockchain_specs: parse_list(blockchain_specs.as_deref())?,
                reassign_ports_if_used,
                dynamic_ports,
            };
            print_response(&client.start(req).await?)
        }
        ControlCommand::Stop => print_response(&client.stop().await?),
        ControlCommand::Health => print_response(&client.health().await?),
        ControlCommand::WaitForHealthy => print_response(&client.wait_for_healthy().await?),
        ControlCommand::Uris => print_response(&client.uris().await?),
        ControlCommand::Status => print_response(&client.status().await?),
        ControlCommand::StreamStatus { push_interval } => {
            let mut frames = client
                .stream_status(Duration::from_millis(push_interval))
                .await?;
            while let Some(info) = frames.recv().await {
                print_response(&info)?;
            }
            Ok(())
        }
        ControlCommand::AddNode {
            name,
            exec_path,
            node_config,
            chain_configs,
            upgrade_configs,
            subnet_configs,
        } => {
            let req = AddNodeRequest {
                name,
                exec_path,
                node_config,
                chain_configs: parse_map(chain_configs.as_deref())?,
                upgrade_configs: parse_map(upgrade_configs.as_deref())?,
                subnet_configs: parse_map(subnet_configs.as_deref())?,
            };
            print_response(&client.add_node(req).await?)
        }
        ControlCommand::RemoveNode { name } => print_response(&client.remove_node(&name).await?),
        ControlCommand::RestartNode {
            name,
            exec_path,
            plugin_dir,
            track_subnets,
            chain_configs,
            upgrade_configs,
            subnet_configs,
        } => {
            let req = RestartNodeRequest {
                name,
                exec_path,
                plugin_dir,
                track_subnets,
                chain_configs: parse_map(chain_configs.as_deref())?,
                upgrade_configs: parse_map(upgrade_configs.as_deref())?,
                subnet_configs: parse_map(subnet_configs.as_deref())?,
            };
            print_response(&client.restart_node(req).await?)
        }
        ControlCommand::PauseNode { name } => print_response(&client.pause_node(&name).await?),
        ControlCommand::ResumeNode { name } => print_response(&client.resume_node(&name).await?),
        ControlCommand::CreateSubnets { subnet_specs } => {
            let specs = serde_json::from_str(&subnet_specs).context("Invalid subnet specs")?;
            print_response(&client.create_subnets(specs).await?)
        }
        ControlCommand::CreateBlockchains { blockchain_specs } => {
            let specs =
                serde_json::from_str(&blockchain_specs).context("Invalid blockchain specs")?;
            print_response(&client.create_blockchains(specs).await?)
        }
        ControlCommand::TransformElasticSubnets {
            elastic_subnet_specs,
        } => {
            let specs = serde_json::from_str(&elastic_subnet_specs)
                .context("Invalid elastic subnet specs")?;
            print_response(&client.transform_elastic_subnets(specs).await?)
        }
        ControlCommand::AddPermissionlessValidator { validator_specs } => {
            let specs = serde_json::from_str(&validator_specs).context("Invalid validator specs")?;
            print_response(&client.add_permissionless_validator(specs).await?)
        }
        ControlCommand::RemoveSubnetValidator { validator_specs } => {
            let specs = serde_json::from_str(&validator_specs).context("Invalid validator specs")?;
            print_response(&client.remove_subnet_validator(specs).await?)
        }
        ControlCommand::AttachPeer { node_name } => {
            print_response(&client.attach_peer(&node_name).await?)
        }
        ControlCommand::SendOutboundMessage {
            node_name,
            peer_id,
            op,
            message,
        } => print_response(
            &client
                .send_outbound_message(&node_name, &peer_id, op, message.as_bytes())
                .await?,
        ),
        ControlCommand::SaveSnapshot { snapshot_name } => {
            print_response(&client.save_snapshot(&snapshot_name).await?)
        }
        ControlCommand::LoadSnapshot {
            snapshot_name,
            exec_path,
            plugin_dir,
            root_data_dir,
            global_node_config,
            chain_configs,
            upgrade_configs,
            subnet_configs,
            reassign_ports_if_used,
            dynamic_ports,
        } => {
            let req = LoadSnapshotRequest {
                snapshot_name,
                exec_path,
                plugin_dir,
                root_data_dir,
                global_node_config,
                chain_configs: parse_map(chain_configs.as_deref())?,
                upgrade_configs: parse_map(upgrade_configs.as_deref())?,
                subnet_configs: parse_map(subnet_configs.as_deref())?,
                reassign_ports_if_used,
                dynamic_ports,
            };
            print_response(&client.load_snapshot(req).await?)
        }
        ControlCommand::RemoveSnapshot { snapshot_name } => {
            client.remove_snapshot(&snapshot_name).await?;
            println!("{}", r#"{"success":true}"#);
            Ok(())
        }
        ControlCommand::GetSnapshotNames => print_response(&client.get_snapshot_names().await?),
    }
}

fn parse_map(raw: Option<&str>) -> Result<BTreeMap<String, String>> {
    match raw {
        Some(raw) => serde_json::from_str(raw).context("Invalid JSON map"),
        None => Ok(BTreeMap::new()),
    }
}

fn parse_list<T: serde::de::DeserializeOwned>(raw: Option<&str>) -> Result<Vec<T>> {
    match raw {
        Some(raw) => serde_json::from_str(raw).context("Invalid JSON list"),
        None => Ok(Vec::new()),
    }
}

fn print_response<T: Serialize>(response: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(response)?);
    Ok(())
}
