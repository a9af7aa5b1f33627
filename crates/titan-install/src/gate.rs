//! Verdict evaluation over stage results.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::runner::{StageResult, StageStatus};
use crate::stage::Stage;

/// Terminal outcome of an install run.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    Success,
    /// No stage failed but at least one degraded
    Partial,
    Failure,
}

impl Verdict {
    /// Conjunction of stage statuses: any failed wins, then any degraded.
    pub fn aggregate<I>(statuses: I) -> Self
    where
        I: IntoIterator<Item = StageStatus>,
    {
        statuses
            .into_iter()
            .fold(Verdict::Success, |verdict, status| match (verdict, status) {
                (Verdict::Failure, _) | (_, StageStatus::Failed) => Verdict::Failure,
                (Verdict::Partial, _) | (_, StageStatus::Degraded) => Verdict::Partial,
                _ => Verdict::Success,
            })
    }

    /// Process exit code: only a failure is non-zero.
    pub fn exit_code(&self) -> u8 {
        match self {
            Verdict::Success | Verdict::Partial => 0,
            Verdict::Failure => 1,
        }
    }
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Verdict::Success => "success",
            Verdict::Partial => "partial",
            Verdict::Failure => "failure",
        };
        f.write_str(s)
    }
}

/// Gate evaluation verdict.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GateVerdict {
    pub verdict: Verdict,

    /// Why the verdict is not success (empty on success).
    pub violations: Vec<String>,

    /// Summary message.
    pub message: String,
}

/// Install gate evaluation rules.
pub struct InstallGate;

impl InstallGate {
    /// Evaluate the stage results of one run.
    ///
    /// Gate rule:
    /// - Every stage must have run; a missing stage is a failure
    /// - Any failed stage makes the run a failure
    /// - Otherwise any degraded stage makes it partial
    pub fn evaluate(results: &[StageResult]) -> GateVerdict {
        let mut violations = Vec::new();
        let mut statuses = Vec::new();

        for stage in Stage::ALL {
            match results.iter().find(|r| r.stage == stage) {
                Some(result) => {
                    statuses.push(result.status);
                    if result.status != StageStatus::Ok {
                        let detail = if result.notes.is_empty() {
                            String::new()
                        } else {
                            format!(": {}", result.notes.join("; "))
                        };
                        violations.push(format!(
                            "Stage '{}' {}{}",
                            stage,
                            match result.status {
                                StageStatus::Degraded => "degraded",
                                _ => "failed",
                            },
                            detail
                        ));
                    }
                }
                None => {
                    statuses.push(StageStatus::Failed);
                    violations.push(format!("Stage '{}' did not run", stage));
                }
            }
        }

        let verdict = Verdict::aggregate(statuses);
        let message = match verdict {
            Verdict::Success => "All stages passed".to_string(),
            Verdict::Partial => format!("Install usable with {} issue(s)", violations.len()),
            Verdict::Failure => format!("Install failed with {} violation(s)", violations.len()),
        };

        GateVerdict {
            verdict,
            violations,
            message,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn all_ok() -> Vec<StageResult> {
        Stage::ALL
            .iter()
            .map(|stage| StageResult::ok(*stage, vec![]))
            .collect()
    }

    fn with_status(stage: Stage, status: StageStatus) -> Vec<StageResult> {
        let mut results = all_ok();
        for r in results.iter_mut().filter(|r| r.stage == stage) {
            r.status = status;
            r.notes = vec![format!("{stage} {status:?}")];
        }
        results
    }

    #[test]
    fn test_aggregate() {
        use StageStatus as S;
        assert_eq!(Verdict::aggregate([S::Ok, S::Ok, S::Ok]), Verdict::Success);
        assert_eq!(Verdict::aggregate([S::Ok, S::Degraded, S::Ok]), Verdict::Partial);
        assert_eq!(Verdict::aggregate([S::Degraded, S::Failed]), Verdict::Failure);
        assert_eq!(Verdict::aggregate([S::Failed, S::Degraded]), Verdict::Failure);
        assert_eq!(Verdict::aggregate(Vec::new()), Verdict::Success);
    }

    #[test]
    fn test_all_ok_passes() {
        let verdict = InstallGate::evaluate(&all_ok());
        assert_eq!(verdict.verdict, Verdict::Success);
        assert!(verdict.violations.is_empty());
    }

    #[test]
    fn test_degraded_verification_is_partial() {
        let verdict =
            InstallGate::evaluate(&with_status(Stage::Verification, StageStatus::Degraded));
        assert_eq!(verdict.verdict, Verdict::Partial);
        assert_eq!(verdict.violations.len(), 1);
        assert!(verdict.violations[0].contains("verification"));
    }

    #[test]
    fn test_failed_pool_setup_is_failure() {
        let mut results = with_status(Stage::PoolSetup, StageStatus::Failed);
        results.retain(|r| matches!(r.stage, Stage::Teardown | Stage::PoolSetup));
        let verdict = InstallGate::evaluate(&results);
        assert_eq!(verdict.verdict, Verdict::Failure);
        assert!(verdict
            .violations
            .iter()
            .any(|v| v.contains("did not run")));
    }

    #[test]
    fn test_empty_results_never_succeed() {
        let verdict = InstallGate::evaluate(&[]);
        assert_eq!(verdict.verdict, Verdict::Failure);
        assert_eq!(verdict.violations.len(), Stage::ALL.len());
    }

    #[test]
    fn test_exit_codes() {
        assert_eq!(Verdict::Success.exit_code(), 0);
        assert_eq!(Verdict::Partial.exit_code(), 0);
        assert_eq!(Verdict::Failure.exit_code(), 1);
    }
}
