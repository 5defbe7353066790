//! Coordinator side of a fleet install.
//!
//! The [`InstallOrchestrator`] resolves roles by caller address, builds and
//! hands out packages, issues install/update/remove/end commands and records
//! every node transition in the checkpoint store.

pub mod package;
pub mod remote;
pub mod roles;

use std::{
    collections::{BTreeMap, BTreeSet},
    path::{Path, PathBuf},
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::{
    Config, FleetError, InstallConfig, InstallMode, Result,
    protocol::{EndCmd, InstallCmd, InstallResponse, InstallResult, OsType, RemoveCmd, UpdateCmd},
    store::{
        CheckPointDb, OrderBy, Page,
        data::{NodeRecord, NodeStatus, Role},
    },
};

use package::PackageBuilder;
use remote::FollowerClient;
use roles::{FleetLayout, LayoutNode, RoleRegistry};

const PACKAGES_DIR: &str = "packages";
const SCRIPTS_DIR: &str = "scripts";
const STOP_NODE_SCRIPT: &str = "stopNode.sh";
const UPDATE_ORDERER_SCRIPT: &str = "updateOrdererHost.sh";
const BACKEND_PROBE_SCRIPT: &str = "fetchBackendInit.sh";

/// Answer of one follower to one command.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CommandOutcome {
    pub ip: String,
    pub role: Option<Role>,
    pub response: InstallResponse,
}

impl CommandOutcome {
    fn new(
        ip: &str,
        role: Option<Role>,
        response: InstallResponse,
    ) -> Self {
        Self {
            ip: ip.to_string(),
            role,
            response,
        }
    }
}

pub struct InstallOrchestrator {
    install: InstallConfig,
    follower_port: u16,
    layout: FleetLayout,
    registry: RoleRegistry,
    db: Arc<CheckPointDb>,
    packages: PackageBuilder,
    client: Arc<dyn FollowerClient>,
    ending: AtomicBool,
    finished: Arc<AtomicBool>,
}

impl InstallOrchestrator {
    pub fn new(
        config: &Config,
        db: Arc<CheckPointDb>,
        client: Arc<dyn FollowerClient>,
    ) -> Result<Self> {
        let install = config.install.clone();
        let packages = PackageBuilder::new(&install.init_dir, Path::new(&install.install_path).join(PACKAGES_DIR));
        Ok(Self {
            layout: FleetLayout::from_config(&config.fleet)?,
            follower_port: config.server.follower_port,
            registry: RoleRegistry::new(),
            install,
            db,
            packages,
            client,
            ending: AtomicBool::new(false),
            finished: Arc::new(AtomicBool::new(false)),
        })
    }

    pub fn layout(&self) -> &FleetLayout {
        &self.layout
    }

    pub fn registry(&self) -> &RoleRegistry {
        &self.registry
    }

    pub fn finished_flag(&self) -> Arc<AtomicBool> {
        self.finished.clone()
    }

    pub fn is_finished(&self) -> bool {
        self.finished.load(Ordering::SeqCst)
    }

    /// Every stored node of this organization, ordered by id.
    pub async fn nodes(&self) -> Result<Vec<NodeRecord>> {
        let query = NodeRecord {
            org_id: Some(self.layout.org_msp_id.clone()),
            ..Default::default()
        };
        self.db.find(&query, &OrderBy::new().asc("id"), Page::all()).await
    }

    // ==== Registration and packages ====

    /// Registers the follower at `ip` and every node the layout places there.
    ///
    /// Re-registering keeps the stored status of known nodes.
    pub async fn register(
        &self,
        ip: &str,
        server_port: u16,
    ) -> Result<BTreeSet<Role>> {
        self.registry.register(&self.layout, ip, server_port).await?;
        self.record_registered(ip).await
    }

    /// Registers `ip` at the follower port unless its follower already did.
    async fn enlist(
        &self,
        ip: &str,
    ) -> Result<()> {
        if self.registry.server_at(ip).await.is_none() {
            self.register(ip, self.follower_port).await?;
        } else {
            self.record_registered(ip).await?;
        }
        Ok(())
    }

    async fn record_registered(
        &self,
        ip: &str,
    ) -> Result<BTreeSet<Role>> {
        for node in self.layout.nodes_at(ip) {
            self.transition(self.layout.record(node), NodeStatus::REGISTERED).await?;
        }
        let roles = self.layout.roles_at(ip);
        info!("coordinator::register({}) roles {:?}", ip, roles);
        Ok(roles)
    }

    /// Builds the package for the follower at `ip`.
    pub async fn build_package(
        &self,
        ip: &str,
        os: OsType,
    ) -> Result<PathBuf> {
        let nodes = self.layout.nodes_at(ip);
        if nodes.is_empty() {
            return Err(FleetError::Install(format!("no roles configured for {}", ip)));
        }
        let package = self.packages.build(&self.layout, ip, os).await?;
        for node in nodes {
            self.transition(self.layout.record(node), NodeStatus::PACKAGE_BUILT).await?;
        }
        Ok(package)
    }

    /// Records that the follower at `ip` received its package.
    pub async fn mark_downloaded(
        &self,
        ip: &str,
    ) -> Result<()> {
        info!("coordinator::downloaded({})", ip);
        self.transition_at(ip, None, NodeStatus::DOWNLOADED).await
    }

    /// Builds the package of `ip` and pushes it to its follower.
    pub async fn push_package(
        &self,
        ip: &str,
    ) -> CommandOutcome {
        let response = match self.build_package(ip, OsType::LINUX).await {
            Ok(package) => self.client.push_package(&self.server_url(ip).await, &package).await.unwrap_or_else(InstallResponse::from),
            Err(err) => err.into(),
        };
        if response.is_success() {
            if let Err(err) = self.mark_downloaded(ip).await {
                return CommandOutcome::new(ip, None, err.into());
            }
        } else {
            error!("coordinator::push_package({}) failed: {}", ip, response.msg);
        }
        CommandOutcome::new(ip, None, response)
    }

    // ==== Commands ====

    /// Sends the install command for `role` to every registered follower of it.
    pub async fn issue_install(
        &self,
        role: Role,
    ) -> Vec<CommandOutcome> {
        let mut outcomes = Vec::new();
        for server in self.registry.servers(role).await {
            outcomes.push(self.issue_install_at(&server.ip, role).await);
        }
        outcomes
    }

    /// Sends the install command for `role` to the follower at `ip`.
    ///
    /// An accepted command moves the nodes to INSTALLING; a refused or
    /// undelivered one marks them FAIL. Nothing is retried.
    pub async fn issue_install_at(
        &self,
        ip: &str,
        role: Role,
    ) -> CommandOutcome {
        let cmd = InstallCmd {
            role,
            role_ports: self.layout.nodes_at(ip).into_iter().filter(|n| n.role == role).map(|n| (n.host_name.clone(), n.port)).collect(),
            hosts: self.layout.hosts(),
            role_folder_name: role.folder_name().to_string(),
        };
        let response = self.client.send_install(&self.server_url(ip).await, &cmd).await.unwrap_or_else(InstallResponse::from);
        self.settle(ip, role, response, NodeStatus::INSTALLING).await
    }

    /// Tells the running `existing` nodes about the `added` ones, shipping
    /// `payload` as their update script.
    ///
    /// Each updated node re-enters INSTALLING until its follower reports; a
    /// refused or undelivered update marks it FAIL.
    pub async fn issue_update(
        &self,
        existing: &[LayoutNode],
        added: &[LayoutNode],
        payload: Vec<u8>,
    ) -> Vec<CommandOutcome> {
        let hosts = added.iter().map(|n| (n.host_name.clone(), n.ip.clone())).collect::<BTreeMap<_, _>>();
        let peer_host_config = added.iter().map(|n| (n.host_name.clone(), format!("{}:{}", n.ip, n.port))).collect::<BTreeMap<_, _>>();

        let mut outcomes = Vec::new();
        for node in existing {
            let cmd = UpdateCmd {
                role: node.role,
                hosts: hosts.clone(),
                peer_host_config: peer_host_config.clone(),
                current_host: Some(node.host_name.clone()),
            };
            let response = self.client.send_update(&self.server_url(&node.ip).await, &cmd, payload.clone()).await.unwrap_or_else(InstallResponse::from);
            let next = Self::next_status(&node.ip, node.role, &response, NodeStatus::INSTALLING);
            let outcome = match self.transition(self.layout.record(node), next).await {
                Ok(_) => CommandOutcome::new(&node.ip, Some(node.role), response),
                Err(err) => CommandOutcome::new(&node.ip, Some(node.role), err.into()),
            };
            outcomes.push(outcome);
        }
        outcomes
    }

    /// Removes `nodes` from their hosts, one command per host and role.
    ///
    /// Rows are deleted only for commands the follower accepted.
    pub async fn remove_nodes(
        &self,
        nodes: &[LayoutNode],
    ) -> Vec<CommandOutcome> {
        let mut groups: BTreeMap<(String, Role), Vec<&LayoutNode>> = BTreeMap::new();
        for node in nodes {
            groups.entry((node.ip.clone(), node.role)).or_default().push(node);
        }
        let script = self.script(STOP_NODE_SCRIPT).await;

        let mut outcomes = Vec::new();
        for ((ip, role), group) in groups {
            let cmd = RemoveCmd {
                role,
                ip: ip.clone(),
                host_names: group.iter().map(|n| n.host_name.clone()).collect(),
                ports: group.iter().map(|n| n.port).collect(),
                peer_domain: Some(self.layout.peer_domain.clone()),
                orderer_domain: Some(self.layout.orderer_domain.clone()),
            };
            let mut response = self.client.send_remove(&self.server_url(&ip).await, &cmd, script.clone()).await.unwrap_or_else(InstallResponse::from);
            if response.is_success() {
                for node in group {
                    if let Err(err) = self.db.delete(&self.layout.record(node)).await {
                        error!("coordinator::remove({}) row not deleted: {}", node.host_name, err);
                        response = err.into();
                    }
                }
                info!("coordinator::remove({}, {}) {:?}", ip, role, cmd.host_names);
            } else {
                error!("coordinator::remove({}, {}) failed: {}", ip, role, response.msg);
            }
            outcomes.push(CommandOutcome::new(&ip, Some(role), response));
        }
        outcomes
    }

    /// Runs `script` on the follower at `ip` to probe its backend.
    ///
    /// A booting backend moves its installing nodes to BOOTING.
    pub async fn probe_backend(
        &self,
        ip: &str,
        script: Vec<u8>,
    ) -> InstallResponse {
        let response = self.client.probe_backend(&self.server_url(ip).await, script).await.unwrap_or_else(InstallResponse::from);
        debug!("coordinator::probe_backend({}) {:?}", ip, response.code);
        if response.code == crate::protocol::ResponseCode::Booting {
            for node in self.layout.nodes_at(ip) {
                let record = self.layout.record(node);
                let moved = match self.status_of(&record).await {
                    Ok(Some(NodeStatus::INSTALLING)) => self.transition(record, NodeStatus::BOOTING).await.map(|_| ()),
                    Ok(_) => Ok(()),
                    Err(err) => Err(err),
                };
                if let Err(err) = moved {
                    return err.into();
                }
            }
        }
        response
    }

    /// Persists a follower's completion report.
    pub async fn record_completion(
        &self,
        ip: &str,
        result: &InstallResult,
    ) -> Result<()> {
        let status = if result.success {
            NodeStatus::SUCCESS
        } else {
            NodeStatus::FAIL
        };
        info!("coordinator::finished({}, {}) {}", ip, result.role, status);
        if !self.layout.roles_at(ip).contains(&result.role) {
            return Err(FleetError::Install(format!("{} hosts no {} node", ip, result.role)));
        }
        self.transition_at(ip, Some(result.role), status).await
    }

    /// Notifies every registered follower that the run is over, then marks
    /// this process finished. Only the first call broadcasts.
    pub async fn broadcast_end(
        &self,
        success: bool,
    ) -> Vec<CommandOutcome> {
        if self.ending.swap(true, Ordering::SeqCst) {
            return Vec::new();
        }
        let urls = self.registry.all().await.into_iter().map(|s| (s.http_url, s.ip)).collect::<BTreeMap<_, _>>();
        let mut outcomes = Vec::new();
        for (url, ip) in urls {
            let response = self
                .client
                .send_end(
                    &url,
                    &EndCmd {
                        success,
                    },
                )
                .await
                .unwrap_or_else(InstallResponse::from);
            if !response.is_success() {
                warn!("coordinator::end({}) not acknowledged: {}", url, response.msg);
            }
            outcomes.push(CommandOutcome::new(&ip, None, response));
        }
        self.finish();
        outcomes
    }

    pub fn finish(&self) {
        if !self.finished.swap(true, Ordering::SeqCst) {
            info!("coordinator::finish");
        }
    }

    // ==== Runs ====

    /// Drives a whole run: a new install, or an update of a known network.
    pub async fn run(&self) -> Result<bool> {
        let success = if self.install.mode == InstallMode::Update && !self.db.is_empty::<NodeRecord>().await? {
            self.update_network().await?
        } else {
            self.new_install().await?
        };
        self.broadcast_end(success).await;
        Ok(success)
    }

    async fn new_install(&self) -> Result<bool> {
        info!("coordinator::run new install of {} nodes", self.layout.nodes().len());
        let targets = self.layout.nodes().to_vec();
        self.install_nodes(&targets).await?;
        let records = targets.iter().map(|n| self.layout.record(n)).collect::<Vec<_>>();
        self.wait_for_completion(&records).await
    }

    /// Diffs the layout against stored rows: nodes only in the store are
    /// removed, nodes missing or not successful are installed. Running
    /// orderers are told about added ones before those are installed.
    async fn update_network(&self) -> Result<bool> {
        let stored = self.nodes().await?;
        let stored_nodes = stored.iter().filter_map(|r| self.layout.node_of(r).map(|n| (n, r.status))).collect::<BTreeMap<_, _>>();
        let wanted = self.layout.nodes().iter().cloned().collect::<BTreeSet<_>>();

        let stale = stored_nodes.keys().filter(|n| !wanted.contains(*n)).cloned().collect::<Vec<_>>();
        let targets = self.layout.nodes().iter().filter(|n| stored_nodes.get(*n) != Some(&Some(NodeStatus::SUCCESS))).cloned().collect::<Vec<_>>();
        let added_orderers = targets.iter().filter(|n| n.role == Role::ORDERER && !stored_nodes.contains_key(*n)).cloned().collect::<Vec<_>>();
        let running_orderers = self.layout.nodes().iter().filter(|n| n.role == Role::ORDERER && !targets.contains(*n)).cloned().collect::<Vec<_>>();
        info!(
            "coordinator::run update: {} to remove, {} to install, {} orderers to update",
            stale.len(),
            targets.len(),
            if added_orderers.is_empty() { 0 } else { running_orderers.len() }
        );

        let mut success = true;
        if !stale.is_empty() {
            success &= self.remove_nodes(&stale).await.iter().all(|o| o.response.is_success());
        }

        let mut waiting = Vec::new();
        if !added_orderers.is_empty() && !running_orderers.is_empty() {
            match self.script(UPDATE_ORDERER_SCRIPT).await {
                Some(script) => {
                    let ips = running_orderers.iter().map(|n| n.ip.clone()).collect::<BTreeSet<_>>();
                    for ip in ips.iter() {
                        self.enlist(ip).await?;
                    }
                    success &= self.issue_update(&running_orderers, &added_orderers, script).await.iter().all(|o| o.response.is_success());
                    waiting.extend(running_orderers.iter().map(|n| self.layout.record(n)));
                }
                None => {
                    warn!("coordinator::run {}/{} missing, running orderers keep their old hosts", SCRIPTS_DIR, UPDATE_ORDERER_SCRIPT);
                    success = false;
                }
            }
        }
        if !targets.is_empty() {
            self.install_nodes(&targets).await?;
            waiting.extend(targets.iter().map(|n| self.layout.record(n)));
        }
        if !waiting.is_empty() {
            success &= self.wait_for_completion(&waiting).await?;
        }
        Ok(success)
    }

    /// Registers, packages and installs `targets`, orderers before peers.
    async fn install_nodes(
        &self,
        targets: &[LayoutNode],
    ) -> Result<()> {
        let ips = targets.iter().map(|n| n.ip.clone()).collect::<BTreeSet<_>>();
        for ip in ips.iter() {
            self.enlist(ip).await?;
        }

        let mut delivered = BTreeSet::new();
        for ip in ips.iter() {
            if self.push_package(ip).await.response.is_success() {
                delivered.insert(ip.clone());
            } else {
                self.transition_at(ip, None, NodeStatus::FAIL).await?;
            }
        }

        for role in [Role::ORDERER, Role::PEER] {
            let role_ips = targets.iter().filter(|n| n.role == role && delivered.contains(&n.ip)).map(|n| n.ip.clone()).collect::<BTreeSet<_>>();
            for ip in role_ips {
                self.issue_install_at(&ip, role).await;
            }
        }
        Ok(())
    }

    /// Polls the store until every record is SUCCESS or FAIL, at most
    /// `completion_checks` times. Returns whether all succeeded.
    ///
    /// With a backend probe script in `{init_dir}/scripts`, hosts that still
    /// have INSTALLING nodes are probed on every check.
    async fn wait_for_completion(
        &self,
        records: &[NodeRecord],
    ) -> Result<bool> {
        let interval = Duration::from_millis(self.install.completion_check_interval_ms);
        let probe = self.script(BACKEND_PROBE_SCRIPT).await;
        for check in 1..=self.install.completion_checks.max(1) {
            let statuses = self.statuses(records).await?;
            if statuses.iter().all(|s| s.is_some_and(|s| s.is_terminal())) {
                return Ok(statuses.iter().all(|s| *s == Some(NodeStatus::SUCCESS)));
            }
            if let Some(script) = probe.as_ref() {
                let installing = records
                    .iter()
                    .zip(statuses.iter())
                    .filter(|(_, status)| **status == Some(NodeStatus::INSTALLING))
                    .filter_map(|(record, _)| record.ip_address.clone())
                    .collect::<BTreeSet<_>>();
                for ip in installing {
                    self.probe_backend(&ip, script.clone()).await;
                }
            }
            debug!("coordinator::wait check {} of {}", check, self.install.completion_checks);
            if check < self.install.completion_checks {
                tokio::time::sleep(interval).await;
            }
        }
        warn!("coordinator::wait gave up before every node reported, check the followers");
        Ok(false)
    }

    async fn statuses(
        &self,
        records: &[NodeRecord],
    ) -> Result<Vec<Option<NodeStatus>>> {
        let mut statuses = Vec::with_capacity(records.len());
        for record in records {
            statuses.push(self.status_of(record).await?);
        }
        Ok(statuses)
    }

    async fn status_of(
        &self,
        record: &NodeRecord,
    ) -> Result<Option<NodeStatus>> {
        let rows = self.db.find(&record.key(), &OrderBy::new(), Page::all()).await?;
        Ok(rows.first().and_then(|r| r.status))
    }

    // ==== Helpers ====

    /// Moves the nodes on `ip` (optionally of one role) to `next`.
    async fn transition_at(
        &self,
        ip: &str,
        role: Option<Role>,
        next: NodeStatus,
    ) -> Result<()> {
        let nodes = self.layout.nodes_at(ip);
        if nodes.is_empty() {
            return Err(FleetError::Install(format!("no roles configured for {}", ip)));
        }
        for node in nodes.into_iter().filter(|n| role.is_none_or(|r| r == n.role)) {
            self.transition(self.layout.record(node), next).await?;
        }
        Ok(())
    }

    /// Writes `next` when the stored status allows it; see [`NodeStatus::accepts_from`].
    async fn transition(
        &self,
        record: NodeRecord,
        next: NodeStatus,
    ) -> Result<bool> {
        let label = record.label();
        let changed = self
            .db
            .upsert_with(&record.with_status(next), |rows: &[NodeRecord]| {
                let accepted = if rows.is_empty() {
                    next.accepts_from(None)
                } else {
                    rows.iter().any(|r| next.accepts_from(r.status))
                };
                if !accepted {
                    let current = rows.first().and_then(|r| r.status);
                    if next == NodeStatus::REGISTERED {
                        debug!("coordinator::transition({}) already known as {:?}", label, current);
                    } else {
                        warn!("coordinator::transition({}) {:?} -> {} rejected", label, current, next);
                    }
                }
                accepted
            })
            .await?;
        if changed {
            debug!("coordinator::transition({}) -> {}", label, next);
        }
        Ok(changed)
    }

    /// Moves the nodes of `role` on `ip` to `accepted` or, on a failure
    /// envelope, to FAIL.
    async fn settle(
        &self,
        ip: &str,
        role: Role,
        response: InstallResponse,
        accepted: NodeStatus,
    ) -> CommandOutcome {
        let next = Self::next_status(ip, role, &response, accepted);
        if let Err(err) = self.transition_at(ip, Some(role), next).await {
            return CommandOutcome::new(ip, Some(role), err.into());
        }
        CommandOutcome::new(ip, Some(role), response)
    }

    fn next_status(
        ip: &str,
        role: Role,
        response: &InstallResponse,
        accepted: NodeStatus,
    ) -> NodeStatus {
        if response.is_success() {
            accepted
        } else {
            error!("coordinator::command({}, {}) failed: {}", ip, role, response.msg);
            NodeStatus::FAIL
        }
    }

    async fn server_url(
        &self,
        ip: &str,
    ) -> String {
        match self.registry.server_at(ip).await {
            Some(server) => server.http_url,
            None => format!("http://{}:{}", ip, self.follower_port),
        }
    }

    /// Optional script shipped with a command, from `{init_dir}/scripts`.
    async fn script(
        &self,
        name: &str,
    ) -> Option<Vec<u8>> {
        tokio::fs::read(Path::new(&self.install.init_dir).join(SCRIPTS_DIR).join(name)).await.ok()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::{
        fs,
        sync::{Mutex, OnceLock, Weak},
    };

    use async_trait::async_trait;

    use super::*;
    use crate::{FleetConfig, StoreConfig, store::open_node_store};

    /// Records every command; optionally answers installs with a completion report.
    #[derive(Default)]
    pub(crate) struct FakeFollower {
        calls: Mutex<Vec<String>>,
        pub(crate) refuse_install: bool,
        orchestrator: OnceLock<Weak<InstallOrchestrator>>,
        pub(crate) report_success: Option<bool>,
    }

    impl FakeFollower {
        fn record(
            &self,
            call: String,
        ) {
            self.calls.lock().unwrap().push(call);
        }

        pub(crate) fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }

        /// Reports `role` on the host of `server_url` once the command was accepted.
        fn report_later(
            &self,
            server_url: &str,
            role: Role,
        ) {
            if let (Some(success), Some(orchestrator)) = (self.report_success, self.orchestrator.get().and_then(|o| o.upgrade())) {
                let ip = server_url.trim_start_matches("http://").rsplit_once(':').unwrap().0.to_string();
                let result = InstallResult {
                    role,
                    success,
                };
                tokio::spawn(async move {
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    orchestrator.record_completion(&ip, &result).await.unwrap();
                });
            }
        }
    }

    #[async_trait]
    impl FollowerClient for FakeFollower {
        async fn push_package(
            &self,
            server_url: &str,
            package: &Path,
        ) -> Result<InstallResponse> {
            assert!(package.exists());
            self.record(format!("push {}", server_url));
            Ok(InstallResponse::success())
        }

        async fn send_install(
            &self,
            server_url: &str,
            cmd: &InstallCmd,
        ) -> Result<InstallResponse> {
            self.record(format!("install {} {}", server_url, cmd.role));
            if self.refuse_install {
                return Ok(InstallResponse::fail("script missing"));
            }
            self.report_later(server_url, cmd.role);
            Ok(InstallResponse::success())
        }

        async fn send_update(
            &self,
            server_url: &str,
            cmd: &UpdateCmd,
            _payload: Vec<u8>,
        ) -> Result<InstallResponse> {
            self.record(format!("update {} {} {}", server_url, cmd.role, cmd.current_host.as_deref().unwrap_or_default()));
            self.report_later(server_url, cmd.role);
            Ok(InstallResponse::success())
        }

        async fn send_remove(
            &self,
            server_url: &str,
            cmd: &RemoveCmd,
            _script: Option<Vec<u8>>,
        ) -> Result<InstallResponse> {
            self.record(format!("remove {} {}", server_url, cmd.host_names.join(",")));
            Ok(InstallResponse::success())
        }

        async fn probe_backend(
            &self,
            server_url: &str,
            _script: Vec<u8>,
        ) -> Result<InstallResponse> {
            self.record(format!("probe {}", server_url));
            Ok(InstallResponse::booting())
        }

        async fn send_end(
            &self,
            server_url: &str,
            _cmd: &EndCmd,
        ) -> Result<InstallResponse> {
            self.record(format!("end {}", server_url));
            Err(FleetError::Transport("connection refused".to_string()))
        }
    }

    pub(crate) fn config(dir: &tempfile::TempDir) -> Config {
        let init = dir.path().join("init");
        for bundle in ["peer-10.0.0.5", "order-10.0.0.2"] {
            fs::create_dir_all(init.join("bundles").join(bundle)).unwrap();
        }
        fs::write(init.join("bundles/peer-10.0.0.5/start-peer.sh"), "echo peer").unwrap();
        fs::write(init.join("bundles/order-10.0.0.2/start-orderer.sh"), "echo orderer").unwrap();

        let mut config = Config::default();
        config.store = StoreConfig {
            path: dir.path().join("checkpoint.db").to_string_lossy().to_string(),
            ..Default::default()
        };
        config.install.init_dir = init.to_string_lossy().to_string();
        config.install.install_path = dir.path().join("work").to_string_lossy().to_string();
        config.install.completion_checks = 20;
        config.install.completion_check_interval_ms = 20;
        config.fleet = FleetConfig {
            org_msp_id: "Org1MSP".to_string(),
            peer_domain: "org1.example.com".to_string(),
            orderer_domain: "example.com".to_string(),
            orderers: BTreeMap::from([("orderer0".to_string(), "10.0.0.2:7050".to_string())]),
            peers: BTreeMap::from([("peer0".to_string(), "10.0.0.5:7051".to_string())]),
        };
        config
    }

    pub(crate) fn orchestrator(
        config: &Config,
        follower: Arc<FakeFollower>,
    ) -> (Arc<InstallOrchestrator>, Arc<CheckPointDb>) {
        let db = Arc::new(open_node_store(&config.store).unwrap());
        let orchestrator = Arc::new(InstallOrchestrator::new(config, db.clone(), follower.clone()).unwrap());
        follower.orchestrator.set(Arc::downgrade(&orchestrator)).unwrap();
        (orchestrator, db)
    }

    fn peer0() -> NodeRecord {
        NodeRecord::new("Org1MSP", Role::PEER, "peer0", "10.0.0.5", 7051)
    }

    async fn stored(db: &CheckPointDb) -> Vec<NodeRecord> {
        db.find(&peer0().key(), &OrderBy::new(), Page::all()).await.unwrap()
    }

    // ==== Node lifecycle ====

    #[tokio::test]
    async fn test_peer_lifecycle_and_reregistration() {
        let dir = tempfile::tempdir().unwrap();
        let (orchestrator, db) = orchestrator(&config(&dir), Arc::new(FakeFollower::default()));

        let roles = orchestrator.register("10.0.0.5", 8080).await.unwrap();
        assert_eq!(roles, BTreeSet::from([Role::PEER]));
        assert_eq!(stored(&db).await[0].status, Some(NodeStatus::REGISTERED));

        let package = orchestrator.build_package("10.0.0.5", OsType::LINUX).await.unwrap();
        assert!(package.exists());
        assert_eq!(stored(&db).await[0].status, Some(NodeStatus::PACKAGE_BUILT));

        orchestrator
            .record_completion(
                "10.0.0.5",
                &InstallResult {
                    role: Role::PEER,
                    success: true,
                },
            )
            .await
            .unwrap();
        assert_eq!(stored(&db).await[0].status, Some(NodeStatus::SUCCESS));

        orchestrator.register("10.0.0.5", 8080).await.unwrap();
        let rows = stored(&db).await;
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].status, Some(NodeStatus::SUCCESS));
    }

    #[tokio::test]
    async fn test_remove_deletes_rows() {
        let dir = tempfile::tempdir().unwrap();
        let follower = Arc::new(FakeFollower::default());
        let (orchestrator, db) = orchestrator(&config(&dir), follower.clone());
        orchestrator.register("10.0.0.5", 8080).await.unwrap();
        orchestrator.register("10.0.0.2", 8080).await.unwrap();

        let node = orchestrator.layout().node_of(&peer0()).unwrap();
        let outcomes = orchestrator.remove_nodes(&[node]).await;
        assert_eq!(outcomes.len(), 1);
        assert!(outcomes[0].response.is_success());
        assert!(stored(&db).await.is_empty());
        assert_eq!(orchestrator.nodes().await.unwrap().len(), 1);
        assert_eq!(follower.calls(), vec!["remove http://10.0.0.5:8080 peer0"]);
    }

    #[tokio::test]
    async fn test_registration_from_unknown_address_fails() {
        let dir = tempfile::tempdir().unwrap();
        let (orchestrator, db) = orchestrator(&config(&dir), Arc::new(FakeFollower::default()));
        assert!(orchestrator.register("10.9.9.9", 8080).await.is_err());
        assert!(orchestrator.build_package("10.9.9.9", OsType::LINUX).await.is_err());
        assert!(db.is_empty::<NodeRecord>().await.unwrap());

        let wrong_role = InstallResult {
            role: Role::ORDERER,
            success: true,
        };
        assert!(orchestrator.record_completion("10.0.0.5", &wrong_role).await.is_err());
    }

    #[tokio::test]
    async fn test_refused_install_marks_fail() {
        let dir = tempfile::tempdir().unwrap();
        let follower = Arc::new(FakeFollower {
            refuse_install: true,
            ..Default::default()
        });
        let (orchestrator, db) = orchestrator(&config(&dir), follower.clone());
        orchestrator.register("10.0.0.5", 8080).await.unwrap();
        assert!(orchestrator.push_package("10.0.0.5").await.response.is_success());
        assert_eq!(stored(&db).await[0].status, Some(NodeStatus::DOWNLOADED));

        let outcomes = orchestrator.issue_install(Role::PEER).await;
        assert_eq!(outcomes.len(), 1);
        assert!(!outcomes[0].response.is_success());
        assert_eq!(stored(&db).await[0].status, Some(NodeStatus::FAIL));
        assert_eq!(follower.calls().iter().filter(|c| c.starts_with("install")).count(), 1);
    }

    #[tokio::test]
    async fn test_probe_and_update_transitions() {
        let dir = tempfile::tempdir().unwrap();
        let follower = Arc::new(FakeFollower::default());
        let (orchestrator, db) = orchestrator(&config(&dir), follower.clone());
        orchestrator.register("10.0.0.5", 8080).await.unwrap();
        orchestrator.push_package("10.0.0.5").await;
        orchestrator.issue_install(Role::PEER).await;
        assert_eq!(stored(&db).await[0].status, Some(NodeStatus::INSTALLING));

        assert_eq!(orchestrator.probe_backend("10.0.0.5", b"true".to_vec()).await, InstallResponse::booting());
        assert_eq!(stored(&db).await[0].status, Some(NodeStatus::BOOTING));

        let done = InstallResult {
            role: Role::PEER,
            success: true,
        };
        orchestrator.record_completion("10.0.0.5", &done).await.unwrap();
        // a BOOTING answer leaves finished nodes alone
        orchestrator.probe_backend("10.0.0.5", b"true".to_vec()).await;
        assert_eq!(stored(&db).await[0].status, Some(NodeStatus::SUCCESS));

        let peer0 = orchestrator.layout().node_of(&peer0()).unwrap();
        let peer1 = LayoutNode {
            host_name: "peer1".to_string(),
            ip: "10.0.0.6".to_string(),
            ..peer0.clone()
        };
        let outcomes = orchestrator.issue_update(&[peer0], &[peer1], b"echo update".to_vec()).await;
        assert!(outcomes[0].response.is_success());
        assert_eq!(stored(&db).await[0].status, Some(NodeStatus::INSTALLING));
        assert!(follower.calls().contains(&"update http://10.0.0.5:8080 PEER peer0".to_string()));
    }

    // ==== Runs ====

    #[tokio::test]
    async fn test_new_install_run() {
        let dir = tempfile::tempdir().unwrap();
        let follower = Arc::new(FakeFollower {
            report_success: Some(true),
            ..Default::default()
        });
        let (orchestrator, _db) = orchestrator(&config(&dir), follower.clone());

        assert!(orchestrator.run().await.unwrap());
        assert!(orchestrator.is_finished());
        assert!(orchestrator.nodes().await.unwrap().iter().all(|r| r.status == Some(NodeStatus::SUCCESS)));

        let calls = follower.calls();
        let orderer = calls.iter().position(|c| c == "install http://10.0.0.2:8080 ORDERER").unwrap();
        let peer = calls.iter().position(|c| c == "install http://10.0.0.5:8080 PEER").unwrap();
        assert!(orderer < peer);
        assert_eq!(calls.iter().filter(|c| c.starts_with("end")).count(), 2);
    }

    #[tokio::test]
    async fn test_run_gives_up_without_reports() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = config(&dir);
        config.install.completion_checks = 2;
        let (orchestrator, _db) = orchestrator(&config, Arc::new(FakeFollower::default()));

        assert!(!orchestrator.run().await.unwrap());
        assert!(orchestrator.is_finished());
    }

    #[tokio::test]
    async fn test_update_run_diffs_layout() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = config(&dir);
        config.install.mode = InstallMode::Update;
        let follower = Arc::new(FakeFollower {
            report_success: Some(true),
            ..Default::default()
        });
        let (orchestrator, db) = orchestrator(&config, follower.clone());

        // peer0 already installed, a retired peer still stored
        db.insert(&peer0().with_status(NodeStatus::SUCCESS)).await.unwrap();
        db.insert(&NodeRecord::new("Org1MSP", Role::PEER, "peer1", "10.0.0.6", 7051).with_status(NodeStatus::SUCCESS)).await.unwrap();

        assert!(orchestrator.run().await.unwrap());
        let calls = follower.calls();
        assert!(calls.contains(&"remove http://10.0.0.6:8080 peer1".to_string()));
        assert!(calls.contains(&"install http://10.0.0.2:8080 ORDERER".to_string()));
        assert!(!calls.iter().any(|c| c.contains("install http://10.0.0.5")));

        let hosts = orchestrator.nodes().await.unwrap().into_iter().map(|r| r.host_name.unwrap()).collect::<BTreeSet<_>>();
        assert_eq!(hosts, BTreeSet::from(["orderer0".to_string(), "peer0".to_string()]));
    }

    #[tokio::test]
    async fn test_update_run_extends_orderers() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = config(&dir);
        config.install.mode = InstallMode::Update;
        config.fleet.orderers.insert("orderer1".to_string(), "10.0.0.3:7050".to_string());
        let init = dir.path().join("init");
        fs::create_dir_all(init.join("bundles/order-10.0.0.3")).unwrap();
        fs::write(init.join("bundles/order-10.0.0.3/start-orderer.sh"), "echo orderer").unwrap();
        fs::create_dir_all(init.join("scripts")).unwrap();
        fs::write(init.join("scripts/updateOrdererHost.sh"), "echo hosts").unwrap();
        let follower = Arc::new(FakeFollower {
            report_success: Some(true),
            ..Default::default()
        });
        let (orchestrator, db) = orchestrator(&config, follower.clone());

        let orderer0 = NodeRecord::new("Org1MSP", Role::ORDERER, "orderer0", "10.0.0.2", 7050);
        db.insert(&orderer0.clone().with_status(NodeStatus::SUCCESS)).await.unwrap();
        db.insert(&peer0().with_status(NodeStatus::SUCCESS)).await.unwrap();
        // the running orderer's follower announced its own port
        orchestrator.register("10.0.0.2", 9090).await.unwrap();

        assert!(orchestrator.run().await.unwrap());
        let calls = follower.calls();
        let update = calls.iter().position(|c| c == "update http://10.0.0.2:9090 ORDERER orderer0").unwrap();
        let install = calls.iter().position(|c| c == "install http://10.0.0.3:8080 ORDERER").unwrap();
        assert!(update < install);
        assert!(!calls.iter().any(|c| c.starts_with("install http://10.0.0.2") || c.starts_with("push http://10.0.0.2")));
        assert!(calls.contains(&"end http://10.0.0.2:9090".to_string()));
        assert!(orchestrator.nodes().await.unwrap().iter().all(|r| r.status == Some(NodeStatus::SUCCESS)));
    }

    #[tokio::test]
    async fn test_update_run_without_orderer_script_fails() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = config(&dir);
        config.install.mode = InstallMode::Update;
        config.fleet.orderers.insert("orderer1".to_string(), "10.0.0.3:7050".to_string());
        let init = dir.path().join("init");
        fs::create_dir_all(init.join("bundles/order-10.0.0.3")).unwrap();
        fs::write(init.join("bundles/order-10.0.0.3/start-orderer.sh"), "echo orderer").unwrap();
        let follower = Arc::new(FakeFollower {
            report_success: Some(true),
            ..Default::default()
        });
        let (orchestrator, db) = orchestrator(&config, follower.clone());
        db.insert(&NodeRecord::new("Org1MSP", Role::ORDERER, "orderer0", "10.0.0.2", 7050).with_status(NodeStatus::SUCCESS)).await.unwrap();

        assert!(!orchestrator.run().await.unwrap());
        assert!(!follower.calls().iter().any(|c| c.starts_with("update")));
        assert!(follower.calls().contains(&"install http://10.0.0.3:8080 ORDERER".to_string()));
    }

    #[tokio::test]
    async fn test_wait_probes_installing_backends() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = config(&dir);
        config.install.completion_checks = 2;
        let scripts = dir.path().join("init/scripts");
        fs::create_dir_all(&scripts).unwrap();
        fs::write(scripts.join("fetchBackendInit.sh"), "curl -s localhost:9443/healthz").unwrap();
        let follower = Arc::new(FakeFollower::default());
        let (orchestrator, _db) = orchestrator(&config, follower.clone());

        // no reports: the probes are all that moves the nodes
        assert!(!orchestrator.run().await.unwrap());
        let calls = follower.calls();
        assert!(calls.contains(&"probe http://10.0.0.2:8080".to_string()));
        assert!(calls.contains(&"probe http://10.0.0.5:8080".to_string()));
        assert!(orchestrator.nodes().await.unwrap().iter().all(|r| r.status == Some(NodeStatus::BOOTING)));
        // BOOTING nodes are not probed again
        assert_eq!(calls.iter().filter(|c| c.starts_with("probe")).count(), 2);
    }
}
