use std::sync::Arc;

use crate::{
    Config, Installer, Result, ServerMode,
    coordinator::{
        InstallOrchestrator,
        remote::{FollowerClient, HttpFollowerClient},
    },
    follower::{
        FollowerAgent,
        remote::{CoordinatorClient, HttpCoordinatorClient},
        script::{ScriptRunner, ShellRunner},
    },
    store::open_node_store,
};

#[derive(Default)]
pub struct InstallerBuilder {
    config: Option<Config>,
    runner: Option<Arc<dyn ScriptRunner>>,
    follower_client: Option<Arc<dyn FollowerClient>>,
    coordinator_client: Option<Arc<dyn CoordinatorClient>>,
}

impl InstallerBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn config(
        mut self,
        config: Config,
    ) -> Self {
        self.config = Some(config);
        self
    }

    pub fn script_runner(
        mut self,
        runner: Arc<dyn ScriptRunner>,
    ) -> Self {
        self.runner = Some(runner);
        self
    }

    /// Client the coordinator sends commands with.
    pub fn follower_client(
        mut self,
        client: Arc<dyn FollowerClient>,
    ) -> Self {
        self.follower_client = Some(client);
        self
    }

    /// Client a follower reports to its coordinator with.
    pub fn coordinator_client(
        mut self,
        client: Arc<dyn CoordinatorClient>,
    ) -> Self {
        self.coordinator_client = Some(client);
        self
    }

    /// Every installer carries a follower agent; a coordinator also opens the
    /// checkpoint store and an orchestrator.
    pub fn build(self) -> Result<Installer> {
        let config = self.config.unwrap_or_default();
        let timeout_ms = config.install.command_timeout_ms;

        let runner = self.runner.unwrap_or_else(|| Arc::new(ShellRunner::new(timeout_ms)));
        let coordinator_client = self.coordinator_client.unwrap_or_else(|| Arc::new(HttpCoordinatorClient::new(timeout_ms)));
        let agent = Arc::new(FollowerAgent::new(&config, runner, coordinator_client));

        let orchestrator = match config.server.mode {
            ServerMode::Coordinator => {
                let db = Arc::new(open_node_store(&config.store)?);
                let client = self.follower_client.unwrap_or_else(|| Arc::new(HttpFollowerClient::new(timeout_ms)));
                Some(Arc::new(InstallOrchestrator::new(&config, db, client)?))
            }
            ServerMode::Follower => None,
        };

        Ok(Installer::new(config, orchestrator, agent))
    }
}
