//! Subcommands of the `nodemesh` binary.
//!
//! Every command returns a JSON document that the binary prints.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use clap::Subcommand;
use corelib::node::{FileStore, LocalIdentity};
use corelib::{InstanceId, InstanceSessionId, LogicalNodeSessionId, NodeId, NodeNames, ServiceCallRequest};
use messaging::protocol::MESSAGE_TYPE_RPC;
use messaging::virtual_transport::VIRTUAL_TRANSPORT_ID;
use messaging::{
    ChannelServiceConfig, ContactPoint, MessageChannelService, MethodError, RemotableService,
    RemoteServiceCaller, ServiceCallHandler, VirtualNetwork, VirtualTransport,
};
use replication::{NodePropertiesConfig, NodePropertiesService};
use serde_json::{json, Value};
use tracing::{info, warn};

/// Output of a command.
pub type CommandResult = anyhow::Result<Value>;

const NODE_INFO_SERVICE: &str = "NodeInfo";
const CONVERGENCE_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Generate a fresh instance id and a session of it.
    GenerateId {
        /// Session generation to use.
        #[arg(long, default_value_t = 1)]
        generation: u32,
    },
    /// Parse any node id form and describe it.
    ParseId { id: String },
    /// Load or create the persistent identity and start a new session.
    Bootstrap {
        /// JSON file holding the identity.
        #[arg(long)]
        store: PathBuf,
    },
    /// Run several nodes in process, let them gossip their properties and
    /// call each other.
    Simulate {
        #[arg(long, default_value_t = 3)]
        nodes: usize,
        /// Forward received properties to other neighbours.
        #[arg(long)]
        relay: bool,
        /// Connect the nodes as a chain instead of a full mesh.
        #[arg(long)]
        chain: bool,
    },
}

impl Command {
    pub async fn execute(&self) -> CommandResult {
        match self {
            Command::GenerateId { generation } => generate_id(*generation),
            Command::ParseId { id } => parse_id(id),
            Command::Bootstrap { store } => bootstrap(store),
            Command::Simulate { nodes, relay, chain } => simulate(*nodes, *relay, *chain).await,
        }
    }
}

// ============================================================================
// Identity Commands
// ============================================================================

fn generate_id(generation: u32) -> CommandResult {
    let instance = InstanceId::generate();
    let session = InstanceSessionId::new(&instance, generation)?;
    Ok(json!({
        "instance": instance,
        "session": session,
        "logical_node": instance.default_logical_node_id(),
        "logical_node_session": session.default_logical_node_session_id(),
    }))
}

fn parse_id(input: &str) -> CommandResult {
    let id = NodeId::parse(input)?;
    let mut output = json!({
        "type": id.id_type().name(),
        "canonical": id.as_str(),
        "instance": id.instance_id(),
    });
    let session = match &id {
        NodeId::InstanceSession(session) => Some(session.clone()),
        NodeId::LogicalNodeSession(session) => Some(session.instance_session_id()),
        _ => None,
    };
    if let Some(session) = session {
        output["session_generation"] = json!(session.generation());
    }
    if let Some(part) = id.as_identity().logical_node_part() {
        output["logical_node_part"] = json!(part);
    }
    Ok(output)
}

fn bootstrap(path: &Path) -> CommandResult {
    let store = FileStore::new(path);
    let identity = LocalIdentity::bootstrap(&store)
        .with_context(|| format!("failed to bootstrap identity from {}", path.display()))?;
    info!(session = %identity.session(), first_start = identity.is_first_start(), "Identity bootstrapped");
    Ok(json!({
        "store": path.display().to_string(),
        "instance": identity.instance_id(),
        "session": identity.session(),
        "generation": identity.session().generation(),
        "first_start": identity.is_first_start(),
    }))
}

// ============================================================================
// Simulation
// ============================================================================

/// Remotely callable view of a node's published properties.
struct NodeInfoService {
    properties: Weak<NodePropertiesService>,
}

#[async_trait]
impl RemotableService for NodeInfoService {
    fn service_name(&self) -> &str {
        NODE_INFO_SERVICE
    }

    fn remote_methods(&self) -> &[&str] {
        &["properties"]
    }

    async fn invoke(&self, method: &str, _params: &[Value]) -> Result<Option<Value>, MethodError> {
        let properties = self
            .properties
            .upgrade()
            .ok_or_else(|| MethodError::Internal("node is shutting down".into()))?;
        match method {
            "properties" => Ok(Some(json!(properties.local_properties()))),
            other => Err(MethodError::Internal(format!("unexpected method '{}'", other))),
        }
    }
}

struct SimulatedNode {
    name: String,
    channels: Arc<MessageChannelService>,
    names: Arc<NodeNames>,
    properties: Arc<NodePropertiesService>,
    caller: RemoteServiceCaller,
}

impl SimulatedNode {
    async fn start(network: &Arc<VirtualNetwork>, index: usize, relay: bool) -> anyhow::Result<Self> {
        let name = format!("node-{}", index);
        let session = InstanceSessionId::new(&InstanceId::generate(), 1)?;
        let channels = MessageChannelService::new(session.clone(), ChannelServiceConfig::default());
        channels.add_transport(Arc::new(VirtualTransport::new(Arc::clone(network))));
        channels.start_server(&Self::contact(index)).await?;

        let names = Arc::new(NodeNames::new());
        let properties = NodePropertiesService::new(
            Arc::clone(&channels),
            Arc::clone(&names),
            NodePropertiesConfig::default().with_relay(relay),
        );
        properties.publish([
            (replication::KEY_DISPLAY_NAME, Some(name.clone())),
            ("index", Some(index.to_string())),
        ])?;

        let handler = ServiceCallHandler::new(session);
        handler.register_service(Arc::new(NodeInfoService {
            properties: Arc::downgrade(&properties),
        }));
        channels.register_request_handler(MESSAGE_TYPE_RPC, handler.clone());
        let caller = RemoteServiceCaller::new(Arc::clone(&channels), handler).with_timeout(Duration::from_secs(2));

        Ok(Self {
            name,
            channels,
            names,
            properties,
            caller,
        })
    }

    fn contact(index: usize) -> ContactPoint {
        ContactPoint::new(VIRTUAL_TRANSPORT_ID, format!("node-{}", index))
    }

    fn id(&self) -> LogicalNodeSessionId {
        self.channels.local_node().default_logical_node_session_id()
    }

    fn report(&self) -> Value {
        let known: Vec<Value> = self
            .properties
            .all_node_properties()
            .into_iter()
            .map(|(session, properties)| {
                json!({
                    "node": self.names.describe(&session),
                    "properties": properties,
                })
            })
            .collect();
        json!({
            "name": self.name,
            "session": self.channels.local_node(),
            "connected": self.channels.connected_nodes().len(),
            "known": known,
        })
    }
}

async fn simulate(count: usize, relay: bool, chain: bool) -> CommandResult {
    anyhow::ensure!(count >= 2, "a simulation needs at least two nodes");
    let network = VirtualNetwork::new();
    let mut nodes = Vec::with_capacity(count);
    for index in 0..count {
        nodes.push(SimulatedNode::start(&network, index, relay).await?);
    }

    for (index, node) in nodes.iter().enumerate() {
        let last = if chain { (index + 2).min(count) } else { count };
        for target in index + 1..last {
            node.channels.connect(&SimulatedNode::contact(target), true).await?;
        }
    }

    let converged = tokio::time::timeout(CONVERGENCE_TIMEOUT, async {
        while nodes
            .iter()
            .any(|node| node.properties.all_node_properties().len() < count)
        {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .is_ok();
    if !converged {
        warn!(nodes = count, relay, chain, "Node properties did not converge");
    }

    let origin = &nodes[0];
    let mut calls = Vec::new();
    for target in &nodes[1..] {
        let request = ServiceCallRequest::builder()
            .target(target.id())
            .caller(origin.id())
            .service(NODE_INFO_SERVICE)
            .method("properties")
            .build()?;
        let result = origin.caller.call(request).await;
        calls.push(json!({
            "target": target.name,
            "success": result.is_success(),
            "value": result.return_value(),
            "failure": result.remote_operation_message(),
        }));
    }

    let reports: Vec<Value> = nodes.iter().map(SimulatedNode::report).collect();
    for node in &nodes {
        node.channels.close_all().await;
    }

    Ok(json!({
        "topology": if chain { "chain" } else { "mesh" },
        "relay": relay,
        "converged": converged,
        "nodes": reports,
        "calls": calls,
    }))
}
