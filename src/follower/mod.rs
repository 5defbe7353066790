//! Follower side of a fleet install: receives its package, runs the local
//! role scripts and reports back to the coordinator.

pub mod remote;
pub mod script;

use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};

use tokio::sync::RwLock;
use tracing::{error, info, warn};

use crate::{
    Config, FleetError, InstallConfig, Result,
    coordinator::package::{self, CRYPTO_CONFIG_DIR},
    protocol::{EndCmd, InstallCmd, InstallResponse, InstallResult, OsType, PACKAGE_FILE_NAME, RemoveCmd, RoleRegistration, UpdateCmd},
    store::data::Role,
};

use remote::CoordinatorClient;
use script::{ScriptCommand, ScriptRunner};

const PACKAGES_DIR: &str = "packages";
const PROBE_SCRIPT: &str = "fetchBackendInit.sh";
const STOP_SCRIPT: &str = "stopNode.sh";
const UPDATE_SCRIPT: &str = "update.sh";

pub const ENV_ROLE_PORTS: &str = "FLEET_ROLE_PORTS";
pub const ENV_HOSTS: &str = "FLEET_HOSTS";
pub const ENV_PEER_HOSTS: &str = "FLEET_PEER_HOSTS";
pub const ENV_CURRENT_HOST: &str = "FLEET_CURRENT_HOST";

/// `k1=v1,k2=v2`, the form scripts read maps in.
fn join_map<V: std::fmt::Display>(map: &BTreeMap<String, V>) -> String {
    map.iter().map(|(k, v)| format!("{}={}", k, v)).collect::<Vec<_>>().join(",")
}

pub struct FollowerAgent {
    install: InstallConfig,
    server_port: u16,
    coordinator_port: u16,
    coordinator_url: RwLock<Option<String>>,
    package_ready: AtomicBool,
    runner: Arc<dyn ScriptRunner>,
    client: Arc<dyn CoordinatorClient>,
    finished: Arc<AtomicBool>,
}

impl FollowerAgent {
    pub fn new(
        config: &Config,
        runner: Arc<dyn ScriptRunner>,
        client: Arc<dyn CoordinatorClient>,
    ) -> Self {
        Self {
            install: config.install.clone(),
            server_port: config.server.follower_port,
            coordinator_port: config.server.coordinator_port,
            coordinator_url: RwLock::new(config.server.coordinator_url.clone()),
            package_ready: AtomicBool::new(false),
            runner,
            client,
            finished: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn install_path(&self) -> &Path {
        Path::new(&self.install.install_path)
    }

    /// Where an incoming package is stored before it is unpacked.
    pub fn package_path(&self) -> PathBuf {
        self.install_path().join(PACKAGES_DIR).join(PACKAGE_FILE_NAME)
    }

    pub async fn coordinator_url(&self) -> Option<String> {
        self.coordinator_url.read().await.clone()
    }

    pub fn is_package_ready(&self) -> bool {
        self.package_ready.load(Ordering::SeqCst)
    }

    pub fn finished_flag(&self) -> Arc<AtomicBool> {
        self.finished.clone()
    }

    pub fn is_finished(&self) -> bool {
        self.finished.load(Ordering::SeqCst)
    }

    async fn require_coordinator(&self) -> Result<String> {
        self.coordinator_url().await.ok_or_else(|| FleetError::Config("coordinator address is unknown".to_string()))
    }

    // ==== Package ====

    /// Announces this follower to the coordinator. Failures are only logged
    /// by callers; registration is not retried.
    pub async fn register(&self) -> Result<InstallResponse> {
        let url = self.require_coordinator().await?;
        let registration = RoleRegistration {
            server_port: self.server_port.to_string(),
        };
        let response = self.client.register(&url, &registration).await?;
        info!("follower::register({}) {:?}", url, response.code);
        Ok(response)
    }

    /// Downloads the package for this host class and applies it.
    pub async fn fetch_package(
        &self,
        os: OsType,
    ) -> Result<()> {
        let url = self.require_coordinator().await?;
        let dest = self.package_path();
        self.client.fetch_package(&url, os, &dest).await?;
        self.apply_package().await
    }

    /// Makes `sender_ip` the coordinator completion reports go to. The last
    /// coordinator that sent a command wins.
    pub async fn record_coordinator(
        &self,
        sender_ip: &str,
    ) {
        let sender = format!("http://{}:{}", sender_ip, self.coordinator_port);
        let mut url = self.coordinator_url.write().await;
        if url.as_deref() != Some(sender.as_str()) {
            info!("follower::coordinator is now {}", sender);
            *url = Some(sender);
        }
    }

    /// Marks the package stored at [`Self::package_path`] as received from
    /// `sender_ip` and unpacks it.
    pub async fn package_received(
        &self,
        sender_ip: &str,
    ) -> Result<()> {
        self.record_coordinator(sender_ip).await;
        self.apply_package().await
    }

    async fn apply_package(&self) -> Result<()> {
        self.package_ready.store(false, Ordering::SeqCst);
        package::unpack(self.package_path(), self.install_path().to_path_buf()).await?;
        self.package_ready.store(true, Ordering::SeqCst);
        info!("follower::package ready in {:?}", self.install_path());
        Ok(())
    }

    // ==== Install / update ====

    fn role_dir(
        &self,
        role: Role,
        folder: &str,
    ) -> PathBuf {
        let folder = if folder.is_empty() {
            role.folder_name()
        } else {
            folder
        };
        self.install_path().join(folder)
    }

    /// Checks the command can run, then installs in the background and
    /// reports the result to the coordinator.
    pub async fn start_install(
        self: &Arc<Self>,
        cmd: InstallCmd,
    ) -> Result<()> {
        let script = self.install_script(&cmd)?;
        info!("follower::install({}) {:?}", cmd.role, cmd.role_ports.keys());
        let agent = self.clone();
        tokio::spawn(async move {
            let success = agent.run_reporting(cmd.role, &script).await;
            agent.report(cmd.role, success).await;
        });
        Ok(())
    }

    fn install_script(
        &self,
        cmd: &InstallCmd,
    ) -> Result<ScriptCommand> {
        if !self.is_package_ready() {
            return Err(FleetError::Install("install package is not ready".to_string()));
        }
        let dir = self.role_dir(cmd.role, &cmd.role_folder_name);
        if !dir.join(cmd.role.start_script()).is_file() {
            return Err(FleetError::Install(format!("{} missing from {:?}", cmd.role.start_script(), dir)));
        }
        Ok(ScriptCommand::new(cmd.role.start_script(), dir)
            .arg("up")
            .env(ENV_ROLE_PORTS, join_map(&cmd.role_ports))
            .env(ENV_HOSTS, join_map(&cmd.hosts)))
    }

    /// Stores the update payload as a script, runs it in the background and
    /// reports the result.
    pub async fn start_update(
        self: &Arc<Self>,
        cmd: UpdateCmd,
        payload: Vec<u8>,
    ) -> Result<()> {
        if payload.is_empty() {
            return Err(FleetError::Protocol("update payload is empty".to_string()));
        }
        let dir = self.role_dir(cmd.role, "");
        tokio::fs::create_dir_all(&dir).await?;
        tokio::fs::write(dir.join(UPDATE_SCRIPT), payload).await?;

        let mut script = ScriptCommand::new(UPDATE_SCRIPT, dir).env(ENV_HOSTS, join_map(&cmd.hosts)).env(ENV_PEER_HOSTS, join_map(&cmd.peer_host_config));
        if let Some(host) = cmd.current_host.as_ref() {
            script = script.env(ENV_CURRENT_HOST, host.as_str());
        }
        info!("follower::update({}) {:?}", cmd.role, cmd.current_host);
        let agent = self.clone();
        tokio::spawn(async move {
            let success = agent.run_reporting(cmd.role, &script).await;
            agent.report(cmd.role, success).await;
        });
        Ok(())
    }

    /// Runs a role script; any failure becomes `false`.
    async fn run_reporting(
        &self,
        role: Role,
        script: &ScriptCommand,
    ) -> bool {
        match self.runner.run(script).await {
            Ok(output) => output.success(),
            Err(err) => {
                error!("follower::script({}) failed: {}", role, err);
                false
            }
        }
    }

    async fn report(
        &self,
        role: Role,
        success: bool,
    ) {
        let result = InstallResult {
            role,
            success,
        };
        let url = match self.require_coordinator().await {
            Ok(url) => url,
            Err(err) => {
                error!("follower::report({}, {}) dropped: {}", role, success, err);
                return;
            }
        };
        match self.client.report_finished(&url, &result).await {
            Ok(response) if response.is_success() => info!("follower::report({}, {})", role, success),
            Ok(response) => warn!("follower::report({}) refused: {}", role, response.msg),
            Err(err) => error!("follower::report({}) failed: {}", role, err),
        }
    }

    // ==== Probe / remove / end ====

    /// Runs a backend probe: non-empty output is SUCCESS, empty output is
    /// BOOTING, anything else FAIL.
    pub async fn check_backend(
        &self,
        script: Vec<u8>,
    ) -> InstallResponse {
        let run = async {
            tokio::fs::create_dir_all(self.install_path()).await?;
            tokio::fs::write(self.install_path().join(PROBE_SCRIPT), script).await?;
            self.runner.run(&ScriptCommand::new(PROBE_SCRIPT, self.install_path())).await
        };
        match run.await {
            Ok(output) if !output.success() => InstallResponse::fail(format!("probe exited {}", output.code)),
            Ok(output) if output.stdout.trim().is_empty() => InstallResponse::booting(),
            Ok(_) => InstallResponse::success(),
            Err(err) => err.into(),
        }
    }

    /// Stops the named nodes and deletes their credentials. Removing nodes
    /// that are already gone succeeds.
    pub async fn remove(
        &self,
        cmd: &RemoveCmd,
        script: Option<Vec<u8>>,
    ) -> Result<()> {
        if cmd.host_names.is_empty() {
            return Err(FleetError::Protocol("remove names no hosts".to_string()));
        }
        if let Some(script) = script {
            tokio::fs::create_dir_all(self.install_path()).await?;
            tokio::fs::write(self.install_path().join(STOP_SCRIPT), script).await?;
            for host in cmd.host_names.iter() {
                let output = self.runner.run(&ScriptCommand::new(STOP_SCRIPT, self.install_path()).arg(host.as_str())).await?;
                if !output.success() {
                    return Err(FleetError::Script(format!("stopping {} exited {}", host, output.code)));
                }
            }
        }

        if let Some(domain) = cmd.domain() {
            for host in cmd.host_names.iter() {
                let dir = self.install_path().join(CRYPTO_CONFIG_DIR).join(cmd.role.org_dir()).join(domain).join(cmd.role.node_dir()).join(host);
                match tokio::fs::remove_dir_all(&dir).await {
                    Ok(()) => {}
                    Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                    Err(err) => return Err(err.into()),
                }
            }
        }
        info!("follower::remove({}) {:?}", cmd.role, cmd.host_names);
        Ok(())
    }

    pub fn end(
        &self,
        cmd: &EndCmd,
    ) {
        info!("follower::end success={}", cmd.success);
        self.finished.store(true, Ordering::SeqCst);
    }
}
