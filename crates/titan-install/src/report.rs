//! Install run report and its human-readable summary.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use titan_env_core::{CheckpointId, PoolStatusReport};
use uuid::Uuid;

use crate::gate::Verdict;
use crate::runner::{StageResult, StageStatus};
use crate::stage::Stage;

/// Output captured when escalating a failure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Diagnostic {
    /// Command that produced the output
    pub source: String,
    pub output: String,
}

impl Diagnostic {
    pub fn new(source: impl Into<String>, output: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            output: output.into(),
        }
    }
}

/// Everything one install run observed. Not persisted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstallReport {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,

    /// Stages in the order they ran; stages after an abort are absent.
    pub stages: Vec<StageResult>,

    /// Install attempts used by the service install stage
    pub install_attempts: u32,

    pub pools: Option<PoolStatusReport>,
    pub repository: Option<String>,
    pub used_fallback_probe: bool,
    pub checkpoint: Option<CheckpointId>,
    pub history_available: bool,
    pub diagnostics: Vec<Diagnostic>,

    pub violations: Vec<String>,
    pub verdict: Verdict,
}

impl InstallReport {
    pub fn new(run_id: Uuid, started_at: DateTime<Utc>) -> Self {
        Self {
            run_id,
            started_at,
            finished_at: started_at,
            stages: Vec::new(),
            install_attempts: 0,
            pools: None,
            repository: None,
            used_fallback_probe: false,
            checkpoint: None,
            history_available: false,
            diagnostics: Vec::new(),
            violations: Vec::new(),
            verdict: Verdict::Failure,
        }
    }

    pub fn stage(&self, stage: Stage) -> Option<&StageResult> {
        self.stages.iter().find(|r| r.stage == stage)
    }

    pub fn status(&self, stage: Stage) -> Option<StageStatus> {
        self.stage(stage).map(|r| r.status)
    }

    pub fn duration_ms(&self) -> i64 {
        (self.finished_at - self.started_at).num_milliseconds()
    }
}

fn status_label(status: Option<StageStatus>) -> &'static str {
    match status {
        Some(StageStatus::Ok) => "ok",
        Some(StageStatus::Degraded) => "degraded",
        Some(StageStatus::Failed) => "FAILED",
        None => "not run",
    }
}

fn push_notes(out: &mut String, report: &InstallReport, stage: Stage) {
    if let Some(result) = report.stage(stage) {
        if result.status != StageStatus::Ok {
            for note in &result.notes {
                out.push_str(&format!("  ! {}\n", note));
            }
        }
    }
}

/// Render the four-section summary printed at the end of an install.
pub fn render_summary(report: &InstallReport) -> String {
    let mut out = format!(
        "Titan install {}: {}\n",
        report.run_id,
        report.verdict.to_string().to_uppercase()
    );

    out.push_str("\nPool status\n");
    out.push_str(&format!(
        "  setup: {}\n",
        status_label(report.status(Stage::PoolSetup))
    ));
    if let Some(pools) = &report.pools {
        for (name, health) in &pools.pools {
            out.push_str(&format!("  {}: {}\n", name, health));
        }
    }
    push_notes(&mut out, report, Stage::PoolSetup);

    out.push_str("\nService status\n");
    out.push_str(&format!(
        "  images: {}\n",
        status_label(report.status(Stage::ImageBuild))
    ));
    push_notes(&mut out, report, Stage::ImageBuild);
    out.push_str(&format!(
        "  install: {} ({} attempt(s))\n",
        status_label(report.status(Stage::ServiceInstall)),
        report.install_attempts
    ));
    push_notes(&mut out, report, Stage::ServiceInstall);
    if !report.diagnostics.is_empty() {
        out.push_str(&format!(
            "  diagnostics captured: {}\n",
            report
                .diagnostics
                .iter()
                .map(|d| d.source.as_str())
                .collect::<Vec<_>>()
                .join(", ")
        ));
    }

    out.push_str("\nVersioning status\n");
    match &report.checkpoint {
        Some(id) => out.push_str(&format!("  checkpoint: {}\n", id)),
        None => out.push_str("  checkpoint: none\n"),
    }
    out.push_str(&format!(
        "  history: {}\n",
        if report.history_available {
            "available"
        } else {
            "unavailable"
        }
    ));

    out.push_str("\nRepository status\n");
    match &report.repository {
        Some(repo) if report.used_fallback_probe => {
            out.push_str(&format!("  repository: {} (fallback probe)\n", repo))
        }
        Some(repo) => out.push_str(&format!("  repository: {}\n", repo)),
        None => out.push_str("  repository: none\n"),
    }
    push_notes(&mut out, report, Stage::Verification);

    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use titan_env_core::PoolHealth;

    fn report() -> InstallReport {
        let mut report = InstallReport::new(Uuid::new_v4(), Utc::now());
        report.stages = Stage::ALL
            .iter()
            .map(|s| StageResult::ok(*s, vec![]))
            .collect();
        report.install_attempts = 1;
        report.pools = Some(PoolStatusReport {
            pools: BTreeMap::from([
                ("titan".to_string(), PoolHealth::Online),
                ("titan-docker".to_string(), PoolHealth::Online),
            ]),
        });
        report.repository = Some("titan-probe".to_string());
        report.checkpoint = CheckpointId::parse("Commit 0123456789abcdef0123456789abcdef");
        report.history_available = true;
        report.verdict = Verdict::Success;
        report
    }

    #[test]
    fn test_summary_has_four_sections() {
        let text = render_summary(&report());
        for section in [
            "Pool status",
            "Service status",
            "Versioning status",
            "Repository status",
        ] {
            assert!(text.contains(section), "missing {section}:\n{text}");
        }
        assert!(text.contains("SUCCESS"));
        assert!(text.contains("titan-docker: online"));
        assert!(text.contains("checkpoint: 0123456789abcdef0123456789abcdef"));
        assert!(text.contains("repository: titan-probe\n"));
    }

    #[test]
    fn test_summary_surfaces_degraded_notes() {
        let mut report = report();
        report.verdict = Verdict::Partial;
        report.checkpoint = None;
        report.stages[4] = StageResult::degraded(
            Stage::Verification,
            vec!["checkpoint on titan-probe did not return a valid id: Commit XYZ".to_string()],
        );
        let text = render_summary(&report);
        assert!(text.contains("PARTIAL"));
        assert!(text.contains("checkpoint: none"));
        assert!(text.contains("! checkpoint on titan-probe"));
    }

    #[test]
    fn test_aborted_stages_render_as_not_run() {
        let mut report = InstallReport::new(Uuid::new_v4(), Utc::now());
        report.stages = vec![
            StageResult::ok(Stage::Teardown, vec![]),
            StageResult::failed(Stage::PoolSetup, "no loop device found"),
        ];
        let text = render_summary(&report);
        assert!(text.contains("setup: FAILED"));
        assert!(text.contains("! no loop device found"));
        assert!(text.contains("install: not run"));
    }

    #[test]
    fn test_report_serializes() {
        let json = serde_json::to_value(report()).unwrap();
        assert_eq!(json["verdict"], "success");
        assert_eq!(json["stages"][3]["stage"], "service_install");
    }
}
