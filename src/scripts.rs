// Copyright 2025 Helsing GmbH
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Lifecycle script execution.
//!
//! The install events run in order (`preinstall`, `install`,
//! `postinstall`) with the usual lifecycle environment set. Dependency
//! scripts only run for trusted packages; the project's own scripts are
//! always trusted. Every script carries a timeout.

use std::collections::BTreeMap;
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use miette::miette;
use tokio::process::Command;

/// The install-time lifecycle events, in execution order.
pub const INSTALL_EVENTS: [&str; 3] = ["preinstall", "install", "postinstall"];

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(300);

#[derive(Debug, Clone)]
pub struct ScriptRunner {
    ignore_scripts: bool,
    timeout: Duration,
}

impl Default for ScriptRunner {
    fn default() -> Self {
        Self {
            ignore_scripts: false,
            timeout: DEFAULT_TIMEOUT,
        }
    }
}

impl ScriptRunner {
    pub fn new(ignore_scripts: bool) -> Self {
        Self {
            ignore_scripts,
            ..Default::default()
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Runs the install lifecycle for one package. Untrusted packages
    /// are skipped with a warning rather than executed.
    pub async fn run_lifecycle(
        &self,
        scripts: &BTreeMap<String, String>,
        cwd: &Path,
        name: &str,
        version: &str,
        trusted: bool,
    ) -> miette::Result<()> {
        if self.ignore_scripts {
            return Ok(());
        }

        let declared: Vec<&str> = INSTALL_EVENTS
            .iter()
            .copied()
            .filter(|event| scripts.contains_key(*event))
            .collect();

        if declared.is_empty() {
            return Ok(());
        }

        if !trusted {
            tracing::warn!(
                "warning: {name}@{version} declares lifecycle scripts but is not a trusted dependency, skipping"
            );
            return Ok(());
        }

        for event in declared {
            let command = &scripts[event];
            tracing::info!(":: {name}@{version} {event}: {command}");
            self.run(command, event, cwd, name, version).await?;
        }

        Ok(())
    }

    /// Runs a single script with the lifecycle environment and the
    /// local `.bin` directory on `PATH`.
    pub async fn run(
        &self,
        command: &str,
        event: &str,
        cwd: &Path,
        name: &str,
        version: &str,
    ) -> miette::Result<()> {
        let bin_dir = cwd.join("node_modules").join(".bin");
        let path_var = match std::env::var("PATH") {
            Ok(existing) => format!("{}:{existing}", bin_dir.display()),
            Err(_) => bin_dir.display().to_string(),
        };

        let mut child = Command::new("sh")
            .arg("-c")
            .arg(command)
            .current_dir(cwd)
            .env("PATH", path_var)
            .env("npm_lifecycle_event", event)
            .env("npm_package_name", name)
            .env("npm_package_version", version)
            .stdin(Stdio::null())
            .spawn()
            .map_err(|err| miette!("failed to spawn {event} script of {name}: {err}"))?;

        let status = match tokio::time::timeout(self.timeout, child.wait()).await {
            Ok(status) => status.map_err(|err| miette!("failed to wait for {event} script: {err}"))?,
            Err(_) => {
                child.kill().await.ok();
                return Err(miette!(
                    "{event} script of {name} timed out after {}s",
                    self.timeout.as_secs()
                ));
            }
        };

        if !status.success() {
            return Err(miette!(
                "{event} script of {name} exited with {}",
                status.code().map(|c| c.to_string()).unwrap_or_else(|| "signal".into())
            ));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scripts(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[tokio::test]
    async fn runs_install_events_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let runner = ScriptRunner::default();

        runner
            .run_lifecycle(
                &scripts(&[
                    ("preinstall", "echo pre >> order.txt"),
                    ("install", "echo main >> order.txt"),
                    ("postinstall", "echo post >> order.txt"),
                ]),
                dir.path(),
                "app",
                "1.0.0",
                true,
            )
            .await
            .unwrap();

        let order = std::fs::read_to_string(dir.path().join("order.txt")).unwrap();
        assert_eq!(order, "pre\nmain\npost\n");
    }

    #[tokio::test]
    async fn untrusted_package_scripts_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let runner = ScriptRunner::default();

        runner
            .run_lifecycle(
                &scripts(&[("postinstall", "touch should-not-exist")]),
                dir.path(),
                "dep",
                "1.0.0",
                false,
            )
            .await
            .unwrap();

        assert!(!dir.path().join("should-not-exist").exists());
    }

    #[tokio::test]
    async fn ignore_scripts_flag_suppresses_everything() {
        let dir = tempfile::tempdir().unwrap();
        let runner = ScriptRunner::new(true);

        runner
            .run_lifecycle(
                &scripts(&[("install", "touch should-not-exist")]),
                dir.path(),
                "app",
                "1.0.0",
                true,
            )
            .await
            .unwrap();

        assert!(!dir.path().join("should-not-exist").exists());
    }

    #[tokio::test]
    async fn failing_script_errors() {
        let dir = tempfile::tempdir().unwrap();
        let runner = ScriptRunner::default();

        let result = runner.run("exit 3", "install", dir.path(), "app", "1.0.0").await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn lifecycle_environment_is_set() {
        let dir = tempfile::tempdir().unwrap();
        let runner = ScriptRunner::default();

        runner
            .run(
                "echo \"$npm_lifecycle_event $npm_package_name@$npm_package_version\" > env.txt",
                "postinstall",
                dir.path(),
                "app",
                "2.0.0",
            )
            .await
            .unwrap();

        let env = std::fs::read_to_string(dir.path().join("env.txt")).unwrap();
        assert_eq!(env.trim(), "postinstall app@2.0.0");
    }

    #[tokio::test]
    async fn hanging_script_times_out() {
        let dir = tempfile::tempdir().unwrap();
        let runner = ScriptRunner::default().with_timeout(Duration::from_millis(200));

        let result = runner.run("sleep 10", "install", dir.path(), "app", "1.0.0").await;
        assert!(result.is_err());
    }
}
