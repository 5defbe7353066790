//! Local script execution.

use std::{collections::BTreeMap, path::PathBuf, process::Stdio, time::Duration};

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, warn};

use crate::{FleetError, Result};

/// One shell script invocation.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ScriptCommand {
    pub script: PathBuf,
    pub args: Vec<String>,
    pub working_dir: PathBuf,
    pub envs: BTreeMap<String, String>,
}

impl ScriptCommand {
    pub fn new(
        script: impl Into<PathBuf>,
        working_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            script: script.into(),
            working_dir: working_dir.into(),
            ..Default::default()
        }
    }

    pub fn arg(
        mut self,
        arg: impl Into<String>,
    ) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn env(
        mut self,
        key: &str,
        value: impl Into<String>,
    ) -> Self {
        self.envs.insert(key.to_string(), value.into());
        self
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ScriptOutput {
    pub code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl ScriptOutput {
    pub fn success(&self) -> bool {
        self.code == 0
    }
}

/// Runs install scripts. A script that ran and exited non-zero is an `Ok`;
/// one that could not be started or timed out is an `Err`.
#[async_trait]
pub trait ScriptRunner: Send + Sync {
    async fn run(
        &self,
        cmd: &ScriptCommand,
    ) -> Result<ScriptOutput>;
}

/// [`ScriptRunner`] spawning `bash` on the local host.
pub struct ShellRunner {
    shell: String,
    timeout: Duration,
}

impl ShellRunner {
    pub fn new(timeout_ms: u64) -> Self {
        Self {
            shell: "bash".to_string(),
            timeout: Duration::from_millis(timeout_ms),
        }
    }

    pub fn with_shell(
        mut self,
        shell: &str,
    ) -> Self {
        self.shell = shell.to_string();
        self
    }
}

#[async_trait]
impl ScriptRunner for ShellRunner {
    async fn run(
        &self,
        cmd: &ScriptCommand,
    ) -> Result<ScriptOutput> {
        debug!("script::run({:?} {:?})", cmd.script, cmd.args);
        let child = Command::new(&self.shell)
            .arg(&cmd.script)
            .args(&cmd.args)
            .current_dir(&cmd.working_dir)
            .envs(&cmd.envs)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|err| FleetError::Script(format!("cannot start {:?}: {}", cmd.script, err)))?;

        let output = tokio::time::timeout(self.timeout, child.wait_with_output())
            .await
            .map_err(|_| FleetError::Script(format!("{:?} timed out after {:?}", cmd.script, self.timeout)))??;

        let output = ScriptOutput {
            code: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        };
        if !output.success() {
            warn!("script::run({:?}) exited {}: {}", cmd.script, output.code, output.stderr.trim());
        }
        Ok(output)
    }
}
