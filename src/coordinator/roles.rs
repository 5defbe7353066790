//! Fleet layout and the registry of followers the coordinator talks to.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::debug;

use crate::{
    FleetConfig, FleetError, Result,
    store::data::{NodeRecord, Role},
    utils,
};

/// One node of the configured network.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Deserialize, Serialize)]
pub struct LayoutNode {
    pub role: Role,
    pub host_name: String,
    pub ip: String,
    pub port: u16,
}

/// The configured network: which node runs on which host.
#[derive(Debug, Clone, Default)]
pub struct FleetLayout {
    pub org_msp_id: String,
    pub peer_domain: String,
    pub orderer_domain: String,
    nodes: Vec<LayoutNode>,
}

impl FleetLayout {
    pub fn from_config(config: &FleetConfig) -> Result<Self> {
        let mut nodes = Vec::new();
        for (role, entries) in [(Role::ORDERER, &config.orderers), (Role::PEER, &config.peers)] {
            for (host_name, addr) in entries.iter() {
                let (ip, port) = utils::split_host_port(addr)?;
                nodes.push(LayoutNode {
                    role,
                    host_name: host_name.clone(),
                    ip,
                    port,
                });
            }
        }
        Ok(Self {
            org_msp_id: config.org_msp_id.clone(),
            peer_domain: config.peer_domain.clone(),
            orderer_domain: config.orderer_domain.clone(),
            nodes,
        })
    }

    pub fn nodes(&self) -> &[LayoutNode] {
        &self.nodes
    }

    /// Nodes hosted on `ip`, orderers first.
    pub fn nodes_at(
        &self,
        ip: &str,
    ) -> Vec<&LayoutNode> {
        self.nodes.iter().filter(|n| n.ip == ip).collect()
    }

    pub fn roles_at(
        &self,
        ip: &str,
    ) -> BTreeSet<Role> {
        self.nodes_at(ip).into_iter().map(|n| n.role).collect()
    }

    /// host name -> ip of every node.
    pub fn hosts(&self) -> BTreeMap<String, String> {
        self.nodes.iter().map(|n| (n.host_name.clone(), n.ip.clone())).collect()
    }

    pub fn domain(
        &self,
        role: Role,
    ) -> &str {
        match role {
            Role::ORDERER => &self.orderer_domain,
            Role::PEER => &self.peer_domain,
        }
    }

    pub fn record(
        &self,
        node: &LayoutNode,
    ) -> NodeRecord {
        NodeRecord::new(&self.org_msp_id, node.role, &node.host_name, &node.ip, node.port)
    }

    /// The layout node a stored record stands for.
    pub fn node_of(
        &self,
        record: &NodeRecord,
    ) -> Option<LayoutNode> {
        Some(LayoutNode {
            role: record.role?,
            host_name: record.host_name.clone()?,
            ip: record.ip_address.clone()?,
            port: u16::try_from(record.port?).ok()?,
        })
    }
}

/// A registered follower and the nodes it hosts for one role.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct ServerEntry {
    pub role: Role,
    pub http_url: String,
    pub ip: String,
    pub ports: Vec<u16>,
}

/// Followers known to the coordinator, keyed by role.
#[derive(Debug, Default)]
pub struct RoleRegistry {
    servers: RwLock<BTreeMap<Role, Vec<ServerEntry>>>,
}

impl RoleRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records the follower at `ip` for every role the layout places there.
    ///
    /// Registering the same host again replaces its server URL.
    pub async fn register(
        &self,
        layout: &FleetLayout,
        ip: &str,
        port: u16,
    ) -> Result<Vec<ServerEntry>> {
        let nodes = layout.nodes_at(ip);
        if nodes.is_empty() {
            return Err(FleetError::Install(format!("no roles configured for {}", ip)));
        }

        let http_url = format!("http://{}:{}", ip, port);
        let mut servers = self.servers.write().await;
        for role in layout.roles_at(ip) {
            let entry = ServerEntry {
                role,
                http_url: http_url.clone(),
                ip: ip.to_string(),
                ports: nodes.iter().filter(|n| n.role == role).map(|n| n.port).collect(),
            };
            debug!("roles::register({}, {})", role, http_url);
            let entries = servers.entry(role).or_default();
            match entries.iter_mut().find(|s| s.ip.eq_ignore_ascii_case(ip)) {
                Some(known) => *known = entry,
                None => entries.push(entry),
            }
        }
        Ok(servers.values().flatten().filter(|s| s.ip == ip).cloned().collect())
    }

    pub async fn servers(
        &self,
        role: Role,
    ) -> Vec<ServerEntry> {
        self.servers.read().await.get(&role).cloned().unwrap_or_default()
    }

    pub async fn server_at(
        &self,
        ip: &str,
    ) -> Option<ServerEntry> {
        self.servers.read().await.values().flatten().find(|s| s.ip == ip).cloned()
    }

    pub async fn all(&self) -> Vec<ServerEntry> {
        self.servers.read().await.values().flatten().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fleet_config() -> FleetConfig {
        FleetConfig {
            org_msp_id: "Org1MSP".to_string(),
            peer_domain: "org1.example.com".to_string(),
            orderer_domain: "example.com".to_string(),
            orderers: BTreeMap::from([("orderer0.example.com".to_string(), "10.0.0.5:7050".to_string())]),
            peers: BTreeMap::from([
                ("peer0.org1.example.com".to_string(), "10.0.0.5:7051".to_string()),
                ("peer1.org1.example.com".to_string(), "10.0.0.6:7051".to_string()),
            ]),
        }
    }

    #[test]
    fn test_layout_roles_by_address() {
        let layout = FleetLayout::from_config(&fleet_config()).unwrap();
        assert_eq!(layout.nodes().len(), 3);
        assert_eq!(layout.roles_at("10.0.0.5"), BTreeSet::from([Role::ORDERER, Role::PEER]));
        assert_eq!(layout.roles_at("10.0.0.6"), BTreeSet::from([Role::PEER]));
        assert!(layout.roles_at("10.0.0.7").is_empty());
        assert_eq!(layout.hosts().get("peer1.org1.example.com").unwrap(), "10.0.0.6");

        let record = layout.record(&layout.nodes_at("10.0.0.6")[0]);
        assert_eq!(record.org_id.as_deref(), Some("Org1MSP"));
        assert_eq!(layout.node_of(&record).unwrap().port, 7051);
    }

    #[test]
    fn test_layout_rejects_bad_address() {
        let mut config = fleet_config();
        config.peers.insert("peer2.org1.example.com".to_string(), "10.0.0.7".to_string());
        assert!(FleetLayout::from_config(&config).is_err());
    }

    #[tokio::test]
    async fn test_registry_reregistration_replaces_url() {
        let layout = FleetLayout::from_config(&fleet_config()).unwrap();
        let registry = RoleRegistry::new();

        let entries = registry.register(&layout, "10.0.0.5", 8080).await.unwrap();
        assert_eq!(entries.len(), 2);
        registry.register(&layout, "10.0.0.5", 9090).await.unwrap();
        assert_eq!(registry.all().await.len(), 2);
        assert_eq!(registry.server_at("10.0.0.5").await.unwrap().http_url, "http://10.0.0.5:9090");
        assert!(registry.all().await.iter().all(|s| s.http_url == "http://10.0.0.5:9090"));
        assert_eq!(registry.servers(Role::ORDERER).await[0].ports, vec![7050]);

        assert!(registry.register(&layout, "10.0.0.9", 8080).await.is_err());
    }
}
