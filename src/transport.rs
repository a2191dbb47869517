// src/transport.rs

//! Boundary to the resource-sharing transport.
//!
//! Peers expose a resource addressed by `(base_uri, block?, command, range?)`.
//! The engine only needs discovery and request/response; anything that can
//! provide both implements [`PeerTransport`]. [`LoopbackNetwork`] is an
//! in-process implementation used by tests and local demos.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;

/// Resource type advertised by every shared file.
pub const RESOURCE_TYPE_INDEX: &str = "x.blockshare.index";

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("peer unreachable: {0}")]
    Unreachable(String),
    #[error("resource not found: {0}")]
    NotFound(String),
    #[error("request forbidden: {0}")]
    Forbidden(String),
    #[error("transport failure: {0}")]
    Failed(String),
}

/// A discovered peer exposing a shared resource.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PeerEndpoint {
    /// Unique identity; a re-discovered peer carries the same id.
    pub id: String,
    pub host: String,
    pub base_uri: String,
    /// Stream-oriented transport; allows larger chunks.
    pub reliable: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveryQuery {
    pub resource_type: String,
    pub interface: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Index,
    Hash,
    Data,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerRequest {
    pub base_uri: String,
    pub block: Option<usize>,
    pub command: Command,
    /// `offset-length` inside the block, for [`Command::Data`].
    pub range: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerResponse {
    Index { blocks: usize },
    Hash(String),
    Data { range: String, data: Vec<u8> },
}

pub fn format_range(offset: u64, len: usize) -> String {
    format!("{offset}-{len}")
}

pub fn parse_range(range: &str) -> Option<(u64, usize)> {
    let (offset, len) = range.split_once('-')?;
    Some((offset.parse().ok()?, len.parse().ok()?))
}

/// Server side of a shared resource.
pub trait ResourceHandler: Send + Sync {
    fn base_uri(&self) -> &str;
    fn resource_type(&self) -> &str;
    fn interface(&self) -> &str;
    fn handle(&self, request: &PeerRequest) -> Result<PeerResponse, TransportError>;
}

#[async_trait]
pub trait PeerTransport: Send + Sync {
    /// Peers, other than this node, exposing resources matching `query`.
    async fn discover(&self, query: &DiscoveryQuery) -> Result<Vec<PeerEndpoint>, TransportError>;

    async fn get(&self, peer: &PeerEndpoint, request: PeerRequest) -> Result<PeerResponse, TransportError>;

    fn publish(&self, handler: Arc<dyn ResourceHandler>) -> Result<(), TransportError>;

    fn unpublish(&self, base_uri: &str);
}

#[derive(Default)]
struct LoopbackNode {
    reliable: bool,
    online: bool,
    resources: HashMap<String, Arc<dyn ResourceHandler>>,
}

/// In-process hub connecting [`LoopbackTransport`]s.
#[derive(Default)]
pub struct LoopbackNetwork {
    nodes: Mutex<HashMap<String, LoopbackNode>>,
}

impl LoopbackNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Joins `node` to the network.
    pub fn transport(self: &Arc<Self>, node: &str, reliable: bool) -> LoopbackTransport {
        self.nodes.lock().insert(
            node.to_string(),
            LoopbackNode {
                reliable,
                online: true,
                resources: HashMap::new(),
            },
        );
        LoopbackTransport {
            network: self.clone(),
            node: node.to_string(),
        }
    }

    /// An offline node is neither discoverable nor reachable.
    pub fn set_online(&self, node: &str, online: bool) {
        if let Some(n) = self.nodes.lock().get_mut(node) {
            n.online = online;
        }
    }
}

pub struct LoopbackTransport {
    network: Arc<LoopbackNetwork>,
    node: String,
}

impl LoopbackTransport {
    pub fn node(&self) -> &str {
        &self.node
    }

    fn host_of(node: &str, reliable: bool) -> String {
        let scheme = if reliable { "loopback+tcp" } else { "loopback+udp" };
        format!("{scheme}://{node}")
    }

    fn node_of(host: &str) -> Option<&str> {
        host.split_once("://").map(|(_, node)| node)
    }
}

#[async_trait]
impl PeerTransport for LoopbackTransport {
    async fn discover(&self, query: &DiscoveryQuery) -> Result<Vec<PeerEndpoint>, TransportError> {
        let nodes = self.network.nodes.lock();
        let mut found = Vec::new();
        for (name, node) in nodes.iter() {
            if name == &self.node || !node.online {
                continue;
            }
            for handler in node.resources.values() {
                if handler.resource_type() == query.resource_type && handler.interface() == query.interface {
                    found.push(PeerEndpoint {
                        id: format!("{name}{}", handler.base_uri()),
                        host: Self::host_of(name, node.reliable),
                        base_uri: handler.base_uri().to_string(),
                        reliable: node.reliable,
                    });
                }
            }
        }
        Ok(found)
    }

    async fn get(&self, peer: &PeerEndpoint, request: PeerRequest) -> Result<PeerResponse, TransportError> {
        let handler = {
            let nodes = self.network.nodes.lock();
            let name = Self::node_of(&peer.host)
                .ok_or_else(|| TransportError::Unreachable(peer.host.clone()))?;
            let node = nodes
                .get(name)
                .filter(|n| n.online)
                .ok_or_else(|| TransportError::Unreachable(peer.host.clone()))?;
            node.resources
                .get(&request.base_uri)
                .cloned()
                .ok_or_else(|| TransportError::NotFound(request.base_uri.clone()))?
        };
        tokio::task::spawn_blocking(move || handler.handle(&request))
            .await
            .map_err(|e| TransportError::Failed(e.to_string()))?
    }

    fn publish(&self, handler: Arc<dyn ResourceHandler>) -> Result<(), TransportError> {
        let mut nodes = self.network.nodes.lock();
        let node = nodes
            .get_mut(&self.node)
            .ok_or_else(|| TransportError::Unreachable(self.node.clone()))?;
        node.resources.insert(handler.base_uri().to_string(), handler);
        Ok(())
    }

    fn unpublish(&self, base_uri: &str) {
        if let Some(node) = self.network.nodes.lock().get_mut(&self.node) {
            node.resources.remove(base_uri);
        }
    }
}
