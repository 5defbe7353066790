//! Request and response shapes exchanged by the coordinator and its followers.
//!
//! Field names follow the camelCase wire format both sides already speak.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use strum::{AsRefStr, Display, EnumString};

use crate::{FleetError, store::data::Role};

/// Result code of a command response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
pub enum ResponseCode {
    #[serde(rename = "0")]
    Success,
    #[serde(rename = "1")]
    Fail,
    #[serde(rename = "2")]
    Booting,
}

/// Envelope every command endpoint answers with.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct InstallResponse {
    pub code: ResponseCode,
    #[serde(default)]
    pub msg: String,
}

impl InstallResponse {
    pub fn success() -> Self {
        Self {
            code: ResponseCode::Success,
            msg: String::new(),
        }
    }

    pub fn fail(msg: impl Into<String>) -> Self {
        Self {
            code: ResponseCode::Fail,
            msg: msg.into(),
        }
    }

    pub fn booting() -> Self {
        Self {
            code: ResponseCode::Booting,
            msg: String::new(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.code == ResponseCode::Success
    }
}

impl From<FleetError> for InstallResponse {
    fn from(err: FleetError) -> Self {
        InstallResponse::fail(err.to_string())
    }
}

impl<T> From<crate::Result<T>> for InstallResponse {
    fn from(result: crate::Result<T>) -> Self {
        match result {
            Ok(_) => InstallResponse::success(),
            Err(err) => err.into(),
        }
    }
}

/// Host class a follower requests its package for.
#[allow(clippy::upper_case_acronyms)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, AsRefStr, Display, EnumString)]
pub enum OsType {
    LINUX,
    MAC,
    WINDOWS,
}

impl OsType {
    pub fn current() -> Self {
        match std::env::consts::OS {
            "macos" => OsType::MAC,
            "windows" => OsType::WINDOWS,
            _ => OsType::LINUX,
        }
    }
}

/// Starts the local install of one role.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InstallCmd {
    pub role: Role,
    /// host name -> port of the role's nodes on the receiving follower
    pub role_ports: BTreeMap<String, u16>,
    /// host name -> ip of every node in the network
    #[serde(default)]
    pub hosts: BTreeMap<String, String>,
    pub role_folder_name: String,
}

/// Removes nodes of one role from the receiving follower.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoveCmd {
    pub role: Role,
    #[serde(default)]
    pub ip: String,
    pub host_names: Vec<String>,
    pub ports: Vec<u16>,
    #[serde(default)]
    pub peer_domain: Option<String>,
    #[serde(default)]
    pub orderer_domain: Option<String>,
}

impl RemoveCmd {
    /// Domain of the removed nodes' credential tree.
    pub fn domain(&self) -> Option<&str> {
        match self.role {
            Role::ORDERER => self.orderer_domain.as_deref(),
            Role::PEER => self.peer_domain.as_deref(),
        }
    }
}

/// Re-runs the install of one role with an update payload.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateCmd {
    pub role: Role,
    #[serde(default)]
    pub hosts: BTreeMap<String, String>,
    #[serde(default)]
    pub peer_host_config: BTreeMap<String, String>,
    #[serde(default)]
    pub current_host: Option<String>,
}

/// Completion report a follower posts after an install or update.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct InstallResult {
    pub role: Role,
    pub success: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
pub struct EndCmd {
    #[serde(default)]
    pub success: bool,
}

/// Follower registration body.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RoleRegistration {
    pub server_port: String,
}

/// Multipart part carrying a package or script.
pub const FILE_PART: &str = "file";
/// Multipart part carrying a JSON command.
pub const CONTENT_PART: &str = "content";
/// File name a package is served as.
pub const PACKAGE_FILE_NAME: &str = "InstallPackage.tar.gz";
