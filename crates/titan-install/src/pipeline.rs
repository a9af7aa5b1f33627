//! Installation pipeline orchestration.

use std::time::Instant;

use chrono::Utc;
use titan_env_core::{with_retry, Environment, PoolConfig, RetryOutcome};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::config::InstallConfig;
use crate::error::InstallError;
use crate::gate::{InstallGate, Verdict};
use crate::report::InstallReport;
use crate::runner::{StageResult, StageRunner, StageStatus};
use crate::stage::{Stage, StagePolicy};

/// Installation pipeline orchestrator.
pub struct InstallPipeline {
    runner: StageRunner,
}

impl InstallPipeline {
    pub fn new(env: Environment, pool_config: PoolConfig, config: InstallConfig) -> Self {
        Self {
            runner: StageRunner::new(env, pool_config, config),
        }
    }

    pub fn runner(&self) -> &StageRunner {
        &self.runner
    }

    /// Execute every stage in order and produce the run report.
    ///
    /// A failed stage whose policy is abort or retry ends the run; the
    /// stages after it do not appear in the report. The verdict always
    /// comes from the gate, so a degraded stage can never end in success.
    pub async fn run(&self) -> InstallReport {
        let run_id = Uuid::new_v4();
        let mut report = InstallReport::new(run_id, Utc::now());
        info!(run_id = %run_id, "Starting install pipeline");

        for stage in Stage::ALL {
            info!(stage = %stage, "Executing stage");
            let start = Instant::now();
            let mut result = self.run_stage(stage, &mut report).await;
            result.duration_ms = start.elapsed().as_millis() as u64;

            let abort = result.status == StageStatus::Failed
                && matches!(stage.policy(), StagePolicy::Abort | StagePolicy::Retry);
            report.stages.push(result);

            if abort {
                error!(run_id = %run_id, stage = %stage, "Stage failed, aborting run");
                break;
            }
        }

        let gate = InstallGate::evaluate(&report.stages);
        report.verdict = gate.verdict;
        report.violations = gate.violations;
        report.finished_at = Utc::now();

        match report.verdict {
            Verdict::Success => info!(run_id = %run_id, "{}", gate.message),
            Verdict::Partial => warn!(run_id = %run_id, "{}", gate.message),
            Verdict::Failure => error!(run_id = %run_id, "{}", gate.message),
        }
        report
    }

    async fn run_stage(&self, stage: Stage, report: &mut InstallReport) -> StageResult {
        match stage {
            // Ignore policy: whatever teardown hits is only noted.
            Stage::Teardown => StageResult::ok(stage, self.runner.teardown().await),
            Stage::PoolSetup => match self.runner.setup_pools().await {
                Ok(status) => {
                    report.pools = Some(status);
                    StageResult::ok(stage, vec![])
                }
                Err(e) => {
                    if let Ok(status) = self
                        .runner
                        .pools()
                        .verify(&self.runner.pools().config().pool_names())
                        .await
                    {
                        report.pools = Some(status);
                    }
                    StageResult::failed(stage, e.to_string())
                }
            },
            Stage::ImageBuild => match self.runner.build_images().await {
                Ok(notes) => StageResult::ok(stage, notes),
                Err(e) => StageResult::failed(stage, e.to_string()),
            },
            Stage::ServiceInstall => self.install_with_retry(report).await,
            Stage::Verification => {
                let verification = self.runner.verify().await;
                report.repository = verification.repository.clone();
                report.used_fallback_probe = verification.used_fallback;
                report.checkpoint = verification.checkpoint.clone();
                report.history_available = verification.history;
                StageResult::new(stage, verification.status(), verification.notes)
            }
        }
    }

    /// Install with a full teardown before every retry. When the ceiling is
    /// reached, diagnostics are captured into the report.
    async fn install_with_retry(&self, report: &mut InstallReport) -> StageResult {
        let stage = Stage::ServiceInstall;
        let policy = self.runner.config().retry_policy();
        let runner = &self.runner;

        let outcome = with_retry(
            &policy,
            InstallError::is_retryable,
            |attempt| async move {
                info!(attempt, "Tearing down before retrying install");
                runner.teardown().await;
            },
            |attempt| runner.install_service(attempt),
        )
        .await;

        match outcome {
            Ok(RetryOutcome {
                value: polls,
                attempts,
            }) => {
                report.install_attempts = attempts;
                StageResult::ok(
                    stage,
                    vec![format!(
                        "service stable after {attempts} attempt(s) and {polls} status check(s)"
                    )],
                )
            }
            Err(failure) => {
                report.install_attempts = failure.attempts;
                if failure.exhausted {
                    error!(
                        attempts = failure.attempts,
                        "Service never became stable, collecting diagnostics"
                    );
                    report.diagnostics = runner.collect_diagnostics().await;
                }
                StageResult::failed(stage, failure.error.to_string())
            }
        }
    }
}
