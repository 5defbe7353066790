//! Coordinator to follower commands.

use std::{path::Path, time::Duration};

use async_trait::async_trait;
use reqwest::{
    Body, Client,
    multipart::{Form, Part},
};
use tokio_util::io::ReaderStream;
use tracing::debug;

use crate::{
    Result,
    protocol::{CONTENT_PART, EndCmd, FILE_PART, InstallCmd, InstallResponse, PACKAGE_FILE_NAME, RemoveCmd, UpdateCmd},
};

/// Commands the coordinator sends to a follower at `server_url`.
///
/// A transport failure is an `Err`; a follower that answered with a failure
/// envelope is an `Ok` holding it.
#[async_trait]
pub trait FollowerClient: Send + Sync {
    async fn push_package(
        &self,
        server_url: &str,
        package: &Path,
    ) -> Result<InstallResponse>;

    async fn send_install(
        &self,
        server_url: &str,
        cmd: &InstallCmd,
    ) -> Result<InstallResponse>;

    async fn send_update(
        &self,
        server_url: &str,
        cmd: &UpdateCmd,
        payload: Vec<u8>,
    ) -> Result<InstallResponse>;

    async fn send_remove(
        &self,
        server_url: &str,
        cmd: &RemoveCmd,
        script: Option<Vec<u8>>,
    ) -> Result<InstallResponse>;

    async fn probe_backend(
        &self,
        server_url: &str,
        script: Vec<u8>,
    ) -> Result<InstallResponse>;

    async fn send_end(
        &self,
        server_url: &str,
        cmd: &EndCmd,
    ) -> Result<InstallResponse>;
}

/// [`FollowerClient`] over HTTP multipart requests.
#[derive(Clone)]
pub struct HttpFollowerClient {
    client: Client,
    timeout: Duration,
}

impl HttpFollowerClient {
    pub fn new(timeout_ms: u64) -> Self {
        Self {
            client: Client::new(),
            timeout: Duration::from_millis(timeout_ms),
        }
    }

    async fn post_form(
        &self,
        url: String,
        form: Form,
    ) -> Result<InstallResponse> {
        debug!("remote::post({})", url);
        let response = self.client.post(&url).multipart(form).timeout(self.timeout).send().await?.error_for_status()?;
        Ok(response.json::<InstallResponse>().await?)
    }
}

fn content_form<T: serde::Serialize>(cmd: &T) -> Result<Form> {
    Ok(Form::new().text(CONTENT_PART, serde_json::to_string(cmd)?))
}

fn file_part(
    bytes: Vec<u8>,
    name: &str,
) -> Part {
    Part::bytes(bytes).file_name(name.to_string())
}

#[async_trait]
impl FollowerClient for HttpFollowerClient {
    async fn push_package(
        &self,
        server_url: &str,
        package: &Path,
    ) -> Result<InstallResponse> {
        let file = tokio::fs::File::open(package).await?;
        let length = file.metadata().await?.len();
        let part = Part::stream_with_length(Body::wrap_stream(ReaderStream::new(file)), length).file_name(PACKAGE_FILE_NAME);
        self.post_form(format!("{}/install/pushPackage", server_url), Form::new().part(FILE_PART, part)).await
    }

    async fn send_install(
        &self,
        server_url: &str,
        cmd: &InstallCmd,
    ) -> Result<InstallResponse> {
        self.post_form(format!("{}/install/start", server_url), content_form(cmd)?).await
    }

    async fn send_update(
        &self,
        server_url: &str,
        cmd: &UpdateCmd,
        payload: Vec<u8>,
    ) -> Result<InstallResponse> {
        let form = content_form(cmd)?.part(FILE_PART, file_part(payload, "update.sh"));
        self.post_form(format!("{}/install/update", server_url), form).await
    }

    async fn send_remove(
        &self,
        server_url: &str,
        cmd: &RemoveCmd,
        script: Option<Vec<u8>>,
    ) -> Result<InstallResponse> {
        let mut form = content_form(cmd)?;
        if let Some(script) = script {
            form = form.part(FILE_PART, file_part(script, "stopNode.sh"));
        }
        self.post_form(format!("{}/install/remove", server_url), form).await
    }

    async fn probe_backend(
        &self,
        server_url: &str,
        script: Vec<u8>,
    ) -> Result<InstallResponse> {
        let form = Form::new().part(FILE_PART, file_part(script, "fetchBackendInit.sh"));
        self.post_form(format!("{}/install/backendStatus", server_url), form).await
    }

    async fn send_end(
        &self,
        server_url: &str,
        cmd: &EndCmd,
    ) -> Result<InstallResponse> {
        debug!("remote::end({})", server_url);
        let response = self.client.post(format!("{}/install/end", server_url)).json(cmd).timeout(self.timeout).send().await?.error_for_status()?;
        Ok(response.json::<InstallResponse>().await?)
    }
}
