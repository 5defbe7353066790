//! HTTP surface of the installer.
//!
//! | Method | Path | Side |
//! |--------|------|------|
//! | `GET` | `/install/getPackage/{osType}` | coordinator |
//! | `POST` | `/install/pushPackage` | follower |
//! | `POST` | `/install/start` | follower |
//! | `POST` | `/install/backendStatus` | follower |
//! | `POST` | `/install/remove` | follower |
//! | `POST` | `/install/update` | follower |
//! | `POST` | `/install/finished` | coordinator |
//! | `POST` | `/install/end` | both |
//! | `POST` | `/reg/role` | coordinator |
//! | `GET` | `/install/nodes` | coordinator |
//!
//! Command endpoints always answer `200` with an [`InstallResponse`]; a
//! rejected command carries code `"1"` and leaves the store untouched.

use std::{net::SocketAddr, str::FromStr, sync::Arc};

use axum::{
    Json, Router,
    body::{Body, Bytes},
    extract::{ConnectInfo, Multipart, Path, State},
    http::header,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use futures::StreamExt;
use serde::de::DeserializeOwned;
use tokio::io::AsyncWriteExt;
use tokio_util::io::ReaderStream;
use tracing::{error, info};

use crate::{
    FleetError, Result,
    coordinator::InstallOrchestrator,
    follower::FollowerAgent,
    protocol::{CONTENT_PART, EndCmd, FILE_PART, InstallCmd, InstallResponse, InstallResult, OsType, PACKAGE_FILE_NAME, RemoveCmd, RoleRegistration, UpdateCmd},
};

/// Shared by every handler. Only a coordinator carries an orchestrator.
#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Option<Arc<InstallOrchestrator>>,
    pub agent: Arc<FollowerAgent>,
}

pub fn install_router(state: AppState) -> Router {
    Router::new()
        .route("/install/getPackage/{os_type}", get(get_package))
        .route("/install/pushPackage", post(push_package))
        .route("/install/start", post(start_install))
        .route("/install/backendStatus", post(backend_status))
        .route("/install/remove", post(remove))
        .route("/install/update", post(update))
        .route("/install/finished", post(finished))
        .route("/install/end", post(end))
        .route("/install/nodes", get(list_nodes))
        .route("/reg/role", post(register_role))
        .with_state(state)
}

fn peer_ip(addr: &SocketAddr) -> String {
    addr.ip().to_canonical().to_string()
}

fn orchestrator(state: &AppState) -> Result<&Arc<InstallOrchestrator>> {
    state.orchestrator.as_ref().ok_or_else(|| FleetError::Install("this server is not the coordinator".to_string()))
}

fn envelope<T>(result: Result<T>) -> Json<InstallResponse> {
    if let Err(err) = result.as_ref() {
        error!("server::command failed: {}", err);
    }
    Json(result.into())
}

/// Parts of a multipart command: the JSON `content` and an optional `file`.
#[derive(Default)]
struct CommandParts {
    content: Option<String>,
    file: Option<Vec<u8>>,
}

impl CommandParts {
    async fn read(mut multipart: Multipart) -> Result<Self> {
        let mut parts = Self::default();
        while let Some(field) = multipart.next_field().await? {
            match field.name() {
                Some(CONTENT_PART) => parts.content = Some(field.text().await?),
                Some(FILE_PART) => parts.file = Some(field.bytes().await?.to_vec()),
                _ => {}
            }
        }
        Ok(parts)
    }

    fn content<T: DeserializeOwned>(&self) -> Result<T> {
        let content = self.content.as_deref().ok_or_else(|| FleetError::Protocol(format!("missing multipart part '{}'", CONTENT_PART)))?;
        serde_json::from_str(content).map_err(|err| FleetError::Protocol(format!("malformed command: {}", err)))
    }

    fn file(&mut self) -> Result<Vec<u8>> {
        self.file.take().ok_or_else(|| FleetError::Protocol(format!("missing multipart part '{}'", FILE_PART)))
    }
}

// ==== Coordinator ====

/// `GET /install/getPackage/{osType}`: streams the caller's package. The
/// nodes are marked DOWNLOADED once the last chunk went out.
async fn get_package(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Path(os_type): Path<String>,
) -> Response {
    let ip = peer_ip(&addr);
    let result = async {
        let os = OsType::from_str(&os_type).map_err(|_| FleetError::Protocol(format!("unknown os type {}", os_type)))?;
        let orchestrator = orchestrator(&state)?.clone();
        let package = orchestrator.build_package(&ip, os).await?;
        let file = tokio::fs::File::open(&package).await?;
        Ok::<_, FleetError>((orchestrator, file))
    };
    let (orchestrator, file) = match result.await {
        Ok(opened) => opened,
        Err(err) => return envelope::<()>(Err(err)).into_response(),
    };

    info!("server::get_package({}) streaming", ip);
    let handed_off = futures::stream::once(async move {
        if let Err(err) = orchestrator.mark_downloaded(&ip).await {
            error!("server::get_package({}) not marked downloaded: {}", ip, err);
        }
        None::<std::io::Result<Bytes>>
    })
    .filter_map(std::future::ready);
    let body = Body::from_stream(ReaderStream::new(file).chain(handed_off));

    (
        [
            (header::CONTENT_TYPE, "application/octet-stream".to_string()),
            (header::CONTENT_DISPOSITION, format!("attachment; filename=\"{}\"", PACKAGE_FILE_NAME)),
        ],
        body,
    )
        .into_response()
}

/// `POST /reg/role`
async fn register_role(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Json(registration): Json<RoleRegistration>,
) -> Json<InstallResponse> {
    let result = async {
        let port = registration.server_port.trim().parse::<u16>().map_err(|_| FleetError::Protocol(format!("bad server port {}", registration.server_port)))?;
        orchestrator(&state)?.register(&peer_ip(&addr), port).await
    };
    envelope(result.await)
}

/// `POST /install/finished`
async fn finished(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Json(result): Json<InstallResult>,
) -> Json<InstallResponse> {
    let recorded = async { orchestrator(&state)?.record_completion(&peer_ip(&addr), &result).await };
    envelope(recorded.await)
}

/// `GET /install/nodes`
async fn list_nodes(State(state): State<AppState>) -> Response {
    let nodes = async { orchestrator(&state)?.nodes().await };
    match nodes.await {
        Ok(nodes) => Json(nodes).into_response(),
        Err(err) => envelope::<()>(Err(err)).into_response(),
    }
}

// ==== Follower ====

/// `POST /install/pushPackage`: streams the `file` part to disk, then unpacks it.
async fn push_package(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    mut multipart: Multipart,
) -> Json<InstallResponse> {
    let result = async {
        let target = state.agent.package_path();
        let mut stored = false;
        while let Some(mut field) = multipart.next_field().await? {
            if field.name() != Some(FILE_PART) {
                continue;
            }
            if let Some(parent) = target.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            let mut file = tokio::fs::File::create(&target).await?;
            while let Some(chunk) = field.chunk().await? {
                file.write_all(&chunk).await?;
            }
            file.flush().await?;
            stored = true;
        }
        if !stored {
            return Err(FleetError::Protocol(format!("missing multipart part '{}'", FILE_PART)));
        }
        state.agent.package_received(&peer_ip(&addr)).await
    };
    envelope(result.await)
}

/// `POST /install/start`
async fn start_install(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    multipart: Multipart,
) -> Json<InstallResponse> {
    let result = async {
        let cmd: InstallCmd = CommandParts::read(multipart).await?.content()?;
        state.agent.record_coordinator(&peer_ip(&addr)).await;
        state.agent.start_install(cmd).await
    };
    envelope(result.await)
}

/// `POST /install/backendStatus`
async fn backend_status(
    State(state): State<AppState>,
    multipart: Multipart,
) -> Json<InstallResponse> {
    let script = async { CommandParts::read(multipart).await?.file() };
    match script.await {
        Ok(script) => Json(state.agent.check_backend(script).await),
        Err(err) => envelope::<()>(Err(err)),
    }
}

/// `POST /install/remove`
async fn remove(
    State(state): State<AppState>,
    multipart: Multipart,
) -> Json<InstallResponse> {
    let result = async {
        let mut parts = CommandParts::read(multipart).await?;
        let cmd: RemoveCmd = parts.content()?;
        state.agent.remove(&cmd, parts.file.take()).await
    };
    envelope(result.await)
}

/// `POST /install/update`
async fn update(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    multipart: Multipart,
) -> Json<InstallResponse> {
    let result = async {
        let mut parts = CommandParts::read(multipart).await?;
        let cmd: UpdateCmd = parts.content()?;
        state.agent.record_coordinator(&peer_ip(&addr)).await;
        state.agent.start_update(cmd, parts.file()?).await
    };
    envelope(result.await)
}

/// `POST /install/end`: a coordinator broadcasts to its followers, every
/// server marks itself finished.
async fn end(
    State(state): State<AppState>,
    body: Bytes,
) -> Json<InstallResponse> {
    let cmd = if body.is_empty() {
        EndCmd::default()
    } else {
        match serde_json::from_slice::<EndCmd>(&body) {
            Ok(cmd) => cmd,
            Err(err) => return envelope::<()>(Err(FleetError::Protocol(format!("malformed end command: {}", err)))),
        }
    };
    if let Some(orchestrator) = state.orchestrator.as_ref() {
        orchestrator.broadcast_end(cmd.success).await;
    }
    state.agent.end(&cmd);
    Json(InstallResponse::success())
}
