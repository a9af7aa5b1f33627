//! Stage actions against the host.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use titan_env_core::{
    poll_until, CheckpointId, Environment, PoolConfig, PoolManager, PoolStatusReport,
};
use titan_exec::{titan, ErrorKind, Program};
use tracing::{debug, info, warn};

use crate::config::{ImageSpec, InstallConfig};
use crate::error::{InstallError, Result};
use crate::report::Diagnostic;
use crate::stage::Stage;

const STATUS_FORMAT: &str = "{{.Names}}\t{{.Status}}";

/// Outcome of one stage.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    Ok,
    /// Succeeded with a known, non-fatal issue
    Degraded,
    Failed,
}

/// Result of a stage execution.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StageResult {
    pub stage: Stage,
    pub status: StageStatus,

    /// Details and deviations worth surfacing in the summary.
    pub notes: Vec<String>,

    /// Duration in milliseconds.
    pub duration_ms: u64,
}

impl StageResult {
    pub fn new(stage: Stage, status: StageStatus, notes: Vec<String>) -> Self {
        Self {
            stage,
            status,
            notes,
            duration_ms: 0,
        }
    }

    pub fn ok(stage: Stage, notes: Vec<String>) -> Self {
        Self::new(stage, StageStatus::Ok, notes)
    }

    pub fn degraded(stage: Stage, notes: Vec<String>) -> Self {
        Self::new(stage, StageStatus::Degraded, notes)
    }

    pub fn failed(stage: Stage, reason: impl Into<String>) -> Self {
        Self::new(stage, StageStatus::Failed, vec![reason.into()])
    }

    /// Whether this stage did not fail (ok or degraded).
    pub fn passed(&self) -> bool {
        self.status != StageStatus::Failed
    }
}

/// What functional verification observed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Verification {
    /// Repository the checks ran against, if any probe registered one
    pub repository: Option<String>,
    pub used_fallback: bool,
    pub checkpoint: Option<CheckpointId>,
    pub history: bool,
    /// Every deviation from a clean verification
    pub notes: Vec<String>,
}

impl Verification {
    /// A missing repository fails the stage; any other deviation degrades it.
    pub fn status(&self) -> StageStatus {
        if self.repository.is_none() {
            StageStatus::Failed
        } else if self.checkpoint.is_none() || !self.history || !self.notes.is_empty() {
            StageStatus::Degraded
        } else {
            StageStatus::Ok
        }
    }
}

/// Repository names from `titan ls` output: first column, header skipped.
pub fn parse_repositories(output: &str) -> Vec<String> {
    output
        .lines()
        .filter_map(|line| line.split_whitespace().next())
        .filter(|name| *name != "REPOSITORY")
        .map(String::from)
        .collect()
}

/// Container name to status from `docker ps -a --format {{.Names}}\t{{.Status}}`.
pub fn parse_container_status(output: &str) -> BTreeMap<String, String> {
    output
        .lines()
        .filter_map(|line| line.split_once('\t'))
        .map(|(name, status)| (name.trim().to_string(), status.trim().to_string()))
        .collect()
}

pub fn is_container_up(status: &str) -> bool {
    status.starts_with("Up") && !status.contains("Restarting")
}

/// Every expected container is up. An empty expectation is never stable.
pub fn service_is_stable(statuses: &BTreeMap<String, String>, expected: &[String]) -> bool {
    !expected.is_empty()
        && expected.iter().all(|name| {
            statuses
                .get(name)
                .map_or(false, |status| is_container_up(status))
        })
}

/// Executes individual stages. Holds no state between calls.
pub struct StageRunner {
    env: Environment,
    pools: PoolManager,
    config: InstallConfig,
}

impl StageRunner {
    pub fn new(env: Environment, pool_config: PoolConfig, config: InstallConfig) -> Self {
        let pools = PoolManager::new(env.clone(), pool_config);
        Self { env, pools, config }
    }

    pub fn config(&self) -> &InstallConfig {
        &self.config
    }

    pub fn pools(&self) -> &PoolManager {
        &self.pools
    }

    async fn list_repositories(&self) -> Vec<String> {
        let out = self.env.run(Program::Titan, &["ls"]).await;
        if out.success {
            parse_repositories(&out.output)
        } else {
            debug!(output = out.trimmed(), "Unable to list repositories");
            Vec::new()
        }
    }

    /// Remove repositories, uninstall the service and prune runtime resources.
    ///
    /// Never fails; returns a note for each step that did not succeed.
    /// A missing service or repository is expected on a first run and is not noted.
    pub async fn teardown(&self) -> Vec<String> {
        let mut notes = Vec::new();

        let listing = self.env.run(Program::Titan, &["ls"]).await;
        if listing.success {
            for repo in parse_repositories(&listing.output) {
                info!(repository = %repo, "Removing repository");
                let out = self.env.run(Program::Titan, &["rm", "-f", repo.as_str()]).await;
                if !out.success && titan::classify(&out.output) != ErrorKind::RepositoryNotFound {
                    notes.push(format!("unable to remove repository {repo}: {}", out.trimmed()));
                }
            }
        } else if titan::classify(&listing.output) == ErrorKind::ServiceUnavailable {
            debug!("Service not running, no repositories to remove");
        } else {
            notes.push(format!("unable to list repositories: {}", listing.trimmed()));
        }

        let steps: [(Program, &[&str]); 3] = [
            (Program::Titan, &["uninstall", "-f"]),
            (Program::Docker, &["container", "prune", "-f"]),
            (Program::Docker, &["volume", "prune", "-f"]),
        ];
        for (program, args) in steps {
            let out = self.env.run(program, args).await;
            if !out.success {
                notes.push(format!(
                    "{program} {} failed: {}",
                    args.join(" "),
                    out.trimmed()
                ));
            }
        }

        for note in &notes {
            warn!(stage = %Stage::Teardown, "{note}");
        }
        notes
    }

    /// Optionally clean, bring both pools online and wait until they are stable.
    pub async fn setup_pools(&self) -> Result<PoolStatusReport> {
        let config = self.pools.config();
        let names = config.pool_names();

        if self.config.clean_slate {
            info!("Cleaning pools for a clean slate");
            self.pools.clean(&names).await?;
        }

        for name in names {
            self.pools.ensure_online(name, config.image_size_mb).await?;
        }

        let polls = self
            .pools
            .wait_until_online(&names, &config.stability_poll())
            .await?;
        debug!(polls, "Pools stable");

        Ok(self.pools.verify(&names).await?)
    }

    async fn image_exists(&self, image: &str) -> bool {
        self.env
            .run(Program::Docker, &["image", "inspect", image])
            .await
            .success
    }

    async fn build_image(&self, spec: &ImageSpec) -> Result<()> {
        let context = spec.context.to_string_lossy().into_owned();
        info!(image = %spec.image, context = %context, "Building image");
        let out = self
            .env
            .run(
                Program::Docker,
                &["build", "-t", spec.image.as_str(), context.as_str()],
            )
            .await;
        if out.success {
            Ok(())
        } else {
            Err(InstallError::aborted(
                Stage::ImageBuild,
                format!("building {} failed: {}", spec.image, out.trimmed()),
            ))
        }
    }

    /// Rebuild the service image; rebuild the builder image only when forced or absent.
    pub async fn build_images(&self) -> Result<Vec<String>> {
        let mut notes = Vec::new();

        self.build_image(&self.config.service_image).await?;
        notes.push(format!("built {}", self.config.service_image.image));

        let builder = &self.config.builder_image;
        if self.config.force_builder || !self.image_exists(&builder.image).await {
            self.build_image(builder).await?;
            notes.push(format!("built {}", builder.image));
        } else {
            debug!(image = %builder.image, "Builder image present, skipping rebuild");
            notes.push(format!("reused {}", builder.image));
        }
        Ok(notes)
    }

    /// One status check of the expected containers.
    pub async fn service_stable(&self) -> bool {
        let out = self
            .env
            .run(Program::Docker, &["ps", "-a", "--format", STATUS_FORMAT])
            .await;
        if !out.success {
            warn!(output = out.trimmed(), "Unable to query container status");
            return false;
        }
        let statuses = parse_container_status(&out.output);
        service_is_stable(&statuses, &self.config.expected_containers)
    }

    /// Run the install entry point once, let it settle, then poll container
    /// status. Returns the number of status checks used.
    pub async fn install_service(&self, attempt: u32) -> Result<u32> {
        let registry = self
            .config
            .registry
            .as_ref()
            .map(|r| format!("--registry={r}"));
        let mut args = vec!["install"];
        if let Some(arg) = &registry {
            args.push(arg.as_str());
        }

        info!(attempt, "Installing service");
        let out = self.env.run(Program::Titan, &args).await;
        if !out.success {
            warn!(attempt, output = out.trimmed(), "Install entry point reported failure");
        }

        tokio::time::sleep(self.config.settle_time()).await;

        match poll_until(&self.config.status_poll(), |_| self.service_stable()).await {
            Some(polls) => {
                info!(attempt, polls, "Service stable");
                Ok(polls)
            }
            None => Err(InstallError::ServiceUnstable { attempts: attempt }),
        }
    }

    /// Container listing and recent logs of each expected container.
    pub async fn collect_diagnostics(&self) -> Vec<Diagnostic> {
        let mut diagnostics = Vec::new();

        let ps = self.env.run(Program::Docker, &["ps", "-a"]).await;
        diagnostics.push(Diagnostic::new("docker ps -a", ps.output));

        let tail = self.config.diagnostics_tail.to_string();
        for name in &self.config.expected_containers {
            let logs = self
                .env
                .run(Program::Docker, &["logs", "--tail", tail.as_str(), name.as_str()])
                .await;
            diagnostics.push(Diagnostic::new(format!("docker logs {name}"), logs.output));
        }
        diagnostics
    }

    /// Probe workload, checkpoint and history query.
    ///
    /// When the primary probe fails, the simpler fallback probe runs too. A
    /// probe that reports failure while its repository still appears is
    /// accepted, but only as a degraded result.
    pub async fn verify(&self) -> Verification {
        let probe = &self.config.probe;
        let mut verification = Verification::default();

        let primary = self
            .env
            .run(
                Program::Titan,
                &[
                    "run",
                    "-n",
                    probe.repository.as_str(),
                    "--",
                    "-d",
                    probe.image.as_str(),
                ],
            )
            .await;

        if primary.success {
            verification.repository = Some(probe.repository.clone());
        } else {
            warn!(repository = %probe.repository, output = primary.trimmed(), "Probe workload failed");
            if self.list_repositories().await.contains(&probe.repository) {
                verification.notes.push(format!(
                    "probe {} reported failure but its repository is registered",
                    probe.repository
                ));
            } else {
                verification.notes.push(format!(
                    "probe {} failed: {}",
                    probe.repository,
                    primary.trimmed()
                ));
            }

            info!(repository = %probe.fallback_repository, "Trying fallback probe");
            verification.used_fallback = true;
            let fallback = self
                .env
                .run(
                    Program::Titan,
                    &[
                        "run",
                        "-n",
                        probe.fallback_repository.as_str(),
                        "--",
                        probe.fallback_image.as_str(),
                    ],
                )
                .await;
            if !fallback.success {
                verification.notes.push(format!(
                    "fallback probe {} failed: {}",
                    probe.fallback_repository,
                    fallback.trimmed()
                ));
            }

            let registered = self.list_repositories().await;
            verification.repository = [&probe.repository, &probe.fallback_repository]
                .into_iter()
                .find(|repo| registered.contains(*repo))
                .cloned();
        }

        let Some(repo) = verification.repository.clone() else {
            verification
                .notes
                .push("no repository registered after both probes".to_string());
            return verification;
        };

        let commit = self
            .env
            .run(
                Program::Titan,
                &[
                    "commit",
                    "-m",
                    self.config.checkpoint_message.as_str(),
                    repo.as_str(),
                ],
            )
            .await;
        let checkpoint = if commit.success {
            CheckpointId::parse(&commit.output)
        } else {
            None
        };
        match checkpoint {
            Some(id) => {
                info!(repository = %repo, checkpoint = %id, "Checkpoint created");
                verification.checkpoint = Some(id);
            }
            None => verification.notes.push(format!(
                "checkpoint on {repo} did not return a valid id: {}",
                commit.trimmed()
            )),
        }

        let log = self.env.run(Program::Titan, &["log", repo.as_str()]).await;
        verification.history = log.success;
        if !log.success {
            verification
                .notes
                .push(format!("history of {repo} unavailable: {}", log.trimmed()));
        }

        verification
    }
}
