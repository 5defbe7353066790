//! Follower to coordinator calls.

use std::{path::Path, time::Duration};

use async_trait::async_trait;
use futures::StreamExt;
use reqwest::{Client, header::CONTENT_TYPE};
use tokio::io::AsyncWriteExt;
use tracing::debug;

use crate::{
    FleetError, Result,
    protocol::{InstallResponse, InstallResult, OsType, RoleRegistration},
};

/// Calls a follower makes on the coordinator at `coordinator_url`.
#[async_trait]
pub trait CoordinatorClient: Send + Sync {
    async fn register(
        &self,
        coordinator_url: &str,
        registration: &RoleRegistration,
    ) -> Result<InstallResponse>;

    /// Streams this host's package into `dest`.
    async fn fetch_package(
        &self,
        coordinator_url: &str,
        os: OsType,
        dest: &Path,
    ) -> Result<()>;

    async fn report_finished(
        &self,
        coordinator_url: &str,
        result: &InstallResult,
    ) -> Result<InstallResponse>;
}

#[derive(Clone)]
pub struct HttpCoordinatorClient {
    client: Client,
    timeout: Duration,
}

impl HttpCoordinatorClient {
    pub fn new(timeout_ms: u64) -> Self {
        Self {
            client: Client::new(),
            timeout: Duration::from_millis(timeout_ms),
        }
    }
}

#[async_trait]
impl CoordinatorClient for HttpCoordinatorClient {
    async fn register(
        &self,
        coordinator_url: &str,
        registration: &RoleRegistration,
    ) -> Result<InstallResponse> {
        debug!("remote::register({})", coordinator_url);
        let response = self.client.post(format!("{}/reg/role", coordinator_url)).json(registration).timeout(self.timeout).send().await?.error_for_status()?;
        Ok(response.json::<InstallResponse>().await?)
    }

    async fn fetch_package(
        &self,
        coordinator_url: &str,
        os: OsType,
        dest: &Path,
    ) -> Result<()> {
        let url = format!("{}/install/getPackage/{}", coordinator_url, os);
        debug!("remote::fetch_package({})", url);
        let response = self.client.get(&url).send().await?.error_for_status()?;

        // refusals come back as an envelope instead of an archive
        let is_json = response.headers().get(CONTENT_TYPE).and_then(|v| v.to_str().ok()).is_some_and(|v| v.starts_with("application/json"));
        if is_json {
            let refusal = response.json::<InstallResponse>().await?;
            return Err(FleetError::Package(format!("coordinator refused package: {}", refusal.msg)));
        }

        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut file = tokio::fs::File::create(dest).await?;
        let mut body = response.bytes_stream();
        while let Some(chunk) = body.next().await {
            file.write_all(&chunk?).await?;
        }
        file.flush().await?;
        Ok(())
    }

    async fn report_finished(
        &self,
        coordinator_url: &str,
        result: &InstallResult,
    ) -> Result<InstallResponse> {
        debug!("remote::finished({}, {})", coordinator_url, result.role);
        let response = self.client.post(format!("{}/install/finished", coordinator_url)).json(result).timeout(self.timeout).send().await?.error_for_status()?;
        Ok(response.json::<InstallResponse>().await?)
    }
}
