use serde::{Deserialize, Serialize};
use strum::{AsRefStr, Display, EnumString};

use crate::{
    FleetError, Result,
    store::schema::{ColumnAttr, Entity, EntitySchema, FieldKind, FieldValue, PersistedRecord, StorageType},
};

/// Network role a fleet node is installed as.
#[allow(clippy::upper_case_acronyms)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Deserialize, Serialize, AsRefStr, Display, EnumString)]
pub enum Role {
    ORDERER,
    PEER,
}

impl Role {
    /// Folder the role's bundle is unpacked into.
    pub fn folder_name(&self) -> &'static str {
        match self {
            Role::ORDERER => "order",
            Role::PEER => "peer",
        }
    }

    pub fn start_script(&self) -> &'static str {
        match self {
            Role::ORDERER => "start-orderer.sh",
            Role::PEER => "start-peer.sh",
        }
    }

    /// Credential tree of the role, e.g. `peerOrganizations`.
    pub fn org_dir(&self) -> &'static str {
        match self {
            Role::ORDERER => "ordererOrganizations",
            Role::PEER => "peerOrganizations",
        }
    }

    pub fn node_dir(&self) -> &'static str {
        match self {
            Role::ORDERER => "orderers",
            Role::PEER => "peers",
        }
    }
}

/// Lifecycle status of one fleet node.
#[allow(clippy::upper_case_acronyms)]
#[allow(non_camel_case_types)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize, AsRefStr, Display, EnumString)]
pub enum NodeStatus {
    REGISTERED,
    PACKAGE_BUILT,
    DOWNLOADED,
    INSTALLING,
    BOOTING,
    SUCCESS,
    FAIL,
}

impl NodeStatus {
    /// Whether a node in `current` (`None` = no row yet) may move to `self`.
    pub fn accepts_from(
        &self,
        current: Option<NodeStatus>,
    ) -> bool {
        use NodeStatus::*;

        let Some(current) = current else {
            return matches!(self, REGISTERED);
        };
        match self {
            REGISTERED => false,
            PACKAGE_BUILT => matches!(current, REGISTERED | PACKAGE_BUILT | DOWNLOADED | FAIL),
            DOWNLOADED => matches!(current, REGISTERED | PACKAGE_BUILT | DOWNLOADED),
            INSTALLING => matches!(current, DOWNLOADED | INSTALLING | BOOTING | SUCCESS | FAIL),
            BOOTING => matches!(current, INSTALLING | BOOTING),
            SUCCESS | FAIL => true,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, NodeStatus::SUCCESS | NodeStatus::FAIL)
    }
}

/// One fleet node, keyed by `(org, role, host, ip, port)`.
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
pub struct NodeRecord {
    #[serde(flatten)]
    pub base: PersistedRecord,
    pub org_id: Option<String>,
    pub role: Option<Role>,
    pub host_name: Option<String>,
    pub ip_address: Option<String>,
    pub port: Option<i64>,
    pub status: Option<NodeStatus>,
}

static NODE_SCHEMA: EntitySchema = EntitySchema {
    table: "tb_nodes",
    type_name: "NodeRecord",
    columns: &[
        ColumnAttr::new("org_id", FieldKind::Text).column("org_msp_id").length(128).key(),
        ColumnAttr::new("role", FieldKind::Enum).key(),
        ColumnAttr::new("host_name", FieldKind::Text).length(128).key(),
        ColumnAttr::new("ip_address", FieldKind::Text).length(64).key(),
        ColumnAttr::new("port", FieldKind::Integer).storage(StorageType::Integer).key(),
        ColumnAttr::new("status", FieldKind::Enum),
    ],
};

impl NodeRecord {
    pub fn new(
        org_id: &str,
        role: Role,
        host_name: &str,
        ip_address: &str,
        port: u16,
    ) -> Self {
        Self {
            base: PersistedRecord::default(),
            org_id: Some(org_id.to_string()),
            role: Some(role),
            host_name: Some(host_name.to_string()),
            ip_address: Some(ip_address.to_string()),
            port: Some(port as i64),
            status: None,
        }
    }

    pub fn with_status(
        mut self,
        status: NodeStatus,
    ) -> Self {
        self.status = Some(status);
        self
    }

    /// Copy holding only the natural key.
    pub fn key(&self) -> Self {
        Self {
            status: None,
            base: PersistedRecord::default(),
            ..self.clone()
        }
    }

    /// `role@host(ip:port)`, used in logs.
    pub fn label(&self) -> String {
        format!(
            "{}@{}({}:{})",
            self.role.map(|r| r.to_string()).unwrap_or_default(),
            self.host_name.as_deref().unwrap_or_default(),
            self.ip_address.as_deref().unwrap_or_default(),
            self.port.unwrap_or_default()
        )
    }
}

impl Entity for NodeRecord {
    fn schema() -> &'static EntitySchema {
        &NODE_SCHEMA
    }

    fn base(&self) -> &PersistedRecord {
        &self.base
    }

    fn base_mut(&mut self) -> &mut PersistedRecord {
        &mut self.base
    }

    fn field(
        &self,
        name: &str,
    ) -> Option<FieldValue> {
        match name {
            "org_id" => self.org_id.clone().map(FieldValue::Text),
            "role" => self.role.map(|r| FieldValue::Enum(r.to_string())),
            "host_name" => self.host_name.clone().map(FieldValue::Text),
            "ip_address" => self.ip_address.clone().map(FieldValue::Text),
            "port" => self.port.map(FieldValue::Int),
            "status" => self.status.map(|s| FieldValue::Enum(s.to_string())),
            _ => None,
        }
    }

    fn set_field(
        &mut self,
        name: &str,
        value: FieldValue,
    ) -> Result<()> {
        match name {
            "org_id" => self.org_id = Some(value.into_text()?),
            "role" => self.role = Some(value.into_enum()?),
            "host_name" => self.host_name = Some(value.into_text()?),
            "ip_address" => self.ip_address = Some(value.into_text()?),
            "port" => self.port = Some(value.into_int()?),
            "status" => self.status = Some(value.into_enum()?),
            _ => return Err(FleetError::Schema(format!("NodeRecord has no field '{}'", name))),
        }
        Ok(())
    }
}
