//! The installer process: serves the HTTP surface, drives the run and exits
//! once the fleet operation is finished.

use std::{
    net::SocketAddr,
    sync::{Arc, atomic::AtomicBool},
    time::Duration,
};

use axum::Router;
use tokio::{net::TcpListener, sync::Notify};
use tracing::{error, info, warn};

use crate::{
    Config, Result, ServerMode,
    coordinator::InstallOrchestrator,
    follower::FollowerAgent,
    protocol::OsType,
    server::{AppState, install_router},
};

/// One installer process, coordinator or follower.
///
/// ```rust,ignore
/// let installer = InstallerBuilder::new().config(config).build()?;
/// installer.launch().await?;
/// ```
pub struct Installer {
    config: Config,
    state: AppState,
    finished: Arc<AtomicBool>,
}

impl Installer {
    pub(crate) fn new(
        config: Config,
        orchestrator: Option<Arc<InstallOrchestrator>>,
        agent: Arc<FollowerAgent>,
    ) -> Self {
        // a coordinator is done when its run is, a follower when it is told so
        let finished = match orchestrator.as_ref() {
            Some(orchestrator) => orchestrator.finished_flag(),
            None => agent.finished_flag(),
        };
        Self {
            config,
            state: AppState {
                orchestrator,
                agent,
            },
            finished,
        }
    }

    pub fn orchestrator(&self) -> Option<&Arc<InstallOrchestrator>> {
        self.state.orchestrator.as_ref()
    }

    pub fn agent(&self) -> &Arc<FollowerAgent> {
        &self.state.agent
    }

    pub fn router(&self) -> Router {
        install_router(self.state.clone())
    }

    pub fn is_finished(&self) -> bool {
        self.finished.load(std::sync::atomic::Ordering::SeqCst)
    }

    /// Serves until the fleet operation is finished, then shuts the server
    /// down. There is no cancellation; stop the process to abort a run.
    pub async fn launch(&self) -> Result<()> {
        let listener = TcpListener::bind(&self.config.server.bind).await?;
        info!("installer::launch({:?}) on {}", self.config.server.mode, listener.local_addr()?);

        let stop = Arc::new(Notify::new());
        let signal = stop.clone();
        let service = self.router().into_make_service_with_connect_info::<SocketAddr>();
        let server = tokio::spawn(async move { axum::serve(listener, service).with_graceful_shutdown(async move { signal.notified().await }).await });

        match self.config.server.mode {
            ServerMode::Coordinator => self.start_run(),
            ServerMode::Follower => self.join_coordinator().await,
        }

        self.wait_finished().await;
        info!("installer::finished");
        stop.notify_one();
        server.await??;
        Ok(())
    }

    fn start_run(&self) {
        let Some(orchestrator) = self.orchestrator().cloned() else {
            return;
        };
        tokio::spawn(async move {
            match orchestrator.run().await {
                Ok(true) => info!("installer::run succeeded"),
                Ok(false) => warn!("installer::run finished with failed or missing nodes"),
                Err(err) => {
                    error!("installer::run aborted: {}", err);
                    orchestrator.finish();
                }
            }
        });
    }

    /// Pull mode: register and fetch the package when a coordinator is
    /// configured. Failures are logged; the coordinator may still push.
    async fn join_coordinator(&self) {
        if self.agent().coordinator_url().await.is_none() {
            info!("installer::waiting for the coordinator to push a package");
            return;
        }
        if let Err(err) = self.agent().register().await {
            warn!("installer::register failed: {}", err);
            return;
        }
        if let Err(err) = self.agent().fetch_package(OsType::current()).await {
            warn!("installer::fetch_package failed: {}", err);
        }
    }

    /// Polls the finished flag at `finish_poll_interval_ms`.
    pub async fn wait_finished(&self) {
        let interval = Duration::from_millis(self.config.install.finish_poll_interval_ms.max(1));
        while !self.is_finished() {
            tokio::time::sleep(interval).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::{
        InstallerBuilder,
        coordinator::tests::{FakeFollower, config},
        follower::tests::{FakeCoordinator, FakeRunner},
        protocol::EndCmd,
    };

    #[tokio::test]
    async fn test_follower_exits_on_end() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = config(&dir);
        config.server.bind = "127.0.0.1:0".to_string();
        config.install.finish_poll_interval_ms = 10;

        let installer = Arc::new(
            InstallerBuilder::new()
                .config(config)
                .script_runner(Arc::new(FakeRunner::default()))
                .coordinator_client(Arc::new(FakeCoordinator::default()))
                .build()
                .unwrap(),
        );
        assert!(installer.orchestrator().is_none());

        let running = installer.clone();
        let handle = tokio::spawn(async move { running.launch().await });
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!handle.is_finished());

        installer.agent().end(&EndCmd {
            success: true,
        });
        tokio::time::timeout(Duration::from_secs(5), handle).await.unwrap().unwrap().unwrap();
        assert!(installer.is_finished());
    }

    #[tokio::test]
    async fn test_coordinator_exits_after_run() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = config(&dir);
        config.server.bind = "127.0.0.1:0".to_string();
        config.server.mode = ServerMode::Coordinator;
        config.install.finish_poll_interval_ms = 10;
        config.install.completion_checks = 1;

        let follower = Arc::new(FakeFollower::default());
        let installer = InstallerBuilder::new().config(config).follower_client(follower.clone()).build().unwrap();
        tokio::time::timeout(Duration::from_secs(10), installer.launch()).await.unwrap().unwrap();

        assert!(installer.is_finished());
        let nodes = installer.orchestrator().unwrap().nodes().await.unwrap();
        assert_eq!(nodes.len(), 2);
        assert_eq!(follower.calls().iter().filter(|c| c.starts_with("end")).count(), 2);
    }
}
