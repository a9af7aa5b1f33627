//! Integration tests for the install pipeline against a simulated host.

use std::path::PathBuf;
use std::sync::Arc;

use titan_env_core::fakes::{FakeHost, ProbeBehavior};
use titan_env_core::{PoolConfig, PoolHealth, PoolManager};
use titan_install::{
    render_summary, ImageSpec, InstallConfig, InstallPipeline, ProbeConfig, Stage, StageStatus,
    Verdict,
};

const POOLS: [&str; 2] = ["titan", "titan-docker"];

fn pool_config() -> PoolConfig {
    PoolConfig {
        system_pool: "titan".to_string(),
        docker_pool: "titan-docker".to_string(),
        pool_dir: PathBuf::from("/var/lib/titan/pools"),
        image_size_mb: 1024,
        stability_polls: 3,
        poll_interval_secs: 1,
    }
}

fn install_config() -> InstallConfig {
    InstallConfig {
        registry: None,
        clean_slate: false,
        force_builder: false,
        service_image: ImageSpec::new("titan:latest", "."),
        builder_image: ImageSpec::new("titandata/zfs-builder:latest", "zfs-builder"),
        max_attempts: 3,
        backoff_base_secs: 5,
        backoff_max_secs: 30,
        settle_secs: 10,
        status_polls: 4,
        status_interval_secs: 5,
        expected_containers: vec!["titan-docker-server".to_string()],
        diagnostics_tail: 50,
        probe: ProbeConfig {
            repository: "titan-probe".to_string(),
            image: "nginx:alpine".to_string(),
            fallback_repository: "titan-probe-simple".to_string(),
            fallback_image: "hello-world".to_string(),
        },
        checkpoint_message: "install verification".to_string(),
    }
}

fn pipeline(host: &Arc<FakeHost>, config: InstallConfig) -> InstallPipeline {
    InstallPipeline::new(host.environment(), pool_config(), config)
}

/// Test: fresh host installs cleanly end to end
#[tokio::test(start_paused = true)]
async fn test_fresh_host_succeeds() {
    let host = Arc::new(FakeHost::new());

    let report = pipeline(&host, install_config()).run().await;

    assert_eq!(report.verdict, Verdict::Success, "{:?}", report.violations);
    assert_eq!(report.stages.len(), Stage::ALL.len());
    assert!(report.stages.iter().all(|s| s.status == StageStatus::Ok));
    assert_eq!(report.install_attempts, 1);
    assert_eq!(report.repository.as_deref(), Some("titan-probe"));
    assert!(!report.used_fallback_probe);
    assert_eq!(
        report.checkpoint.as_ref().map(|c| c.as_str().len()),
        Some(32)
    );
    assert!(report.history_available);
    assert!(report.diagnostics.is_empty());

    let pools = report.pools.as_ref().expect("pool status");
    assert!(pools.all_online());

    assert_eq!(host.count("titan install"), 1);
    assert_eq!(host.count("titan uninstall -f"), 1);
    assert_eq!(host.count("titan run -n titan-probe-simple"), 0);

    let summary = render_summary(&report);
    assert!(summary.contains("SUCCESS"));
    assert!(summary.contains("titan: online"));
}

/// Test: install that fails N < max times then succeeds
#[tokio::test(start_paused = true)]
async fn test_install_retries_below_ceiling() {
    let host = Arc::new(FakeHost::new());
    host.update(|s| s.install_failures_remaining = 2);

    let report = pipeline(&host, install_config()).run().await;

    assert_eq!(report.verdict, Verdict::Success, "{:?}", report.violations);
    assert_eq!(report.install_attempts, 3);
    assert_eq!(host.count("titan install"), 3);
    // One teardown stage plus one teardown per retry
    assert_eq!(host.count("titan uninstall -f"), 1 + 2);
    assert_eq!(host.count("docker volume prune -f"), 1 + 2);
}

/// Test: install that fails as often as the ceiling allows
#[tokio::test(start_paused = true)]
async fn test_install_ceiling_escalates_to_diagnostics() {
    let host = Arc::new(FakeHost::new());
    host.update(|s| s.install_failures_remaining = 3);

    let report = pipeline(&host, install_config()).run().await;

    assert_eq!(report.verdict, Verdict::Failure);
    assert_eq!(report.verdict.exit_code(), 1);
    assert_eq!(report.install_attempts, 3);
    assert_eq!(host.count("titan install"), 3);
    assert_eq!(host.count("titan uninstall -f"), 1 + 2);
    assert_eq!(report.status(Stage::ServiceInstall), Some(StageStatus::Failed));
    assert_eq!(report.status(Stage::Verification), None, "run aborted");

    let sources: Vec<_> = report.diagnostics.iter().map(|d| d.source.as_str()).collect();
    assert_eq!(sources, ["docker ps -a", "docker logs titan-docker-server"]);
    assert!(report.diagnostics[0].output.contains("Restarting"));
    assert_eq!(host.count("docker logs --tail 50 titan-docker-server"), 1);
}

/// Test: a single attempt ceiling never retries
#[tokio::test(start_paused = true)]
async fn test_single_attempt_ceiling() {
    let host = Arc::new(FakeHost::new());
    host.update(|s| s.install_failures_remaining = 1);
    let config = InstallConfig {
        max_attempts: 1,
        ..install_config()
    };

    let report = pipeline(&host, config).run().await;

    assert_eq!(report.verdict, Verdict::Failure);
    assert_eq!(host.count("titan install"), 1);
    assert_eq!(host.count("titan uninstall -f"), 1);
}

/// Test: malformed checkpoint output yields partial, never success
#[tokio::test(start_paused = true)]
async fn test_malformed_checkpoint_is_partial() {
    let host = Arc::new(FakeHost::new());
    host.update(|s| s.commit_output = Some("Commit XYZ123\n".to_string()));

    let report = pipeline(&host, install_config()).run().await;

    assert_eq!(report.verdict, Verdict::Partial);
    assert_eq!(report.verdict.exit_code(), 0);
    assert!(report.checkpoint.is_none());
    assert_eq!(report.status(Stage::PoolSetup), Some(StageStatus::Ok));
    assert_eq!(report.status(Stage::ServiceInstall), Some(StageStatus::Ok));
    assert_eq!(report.status(Stage::Verification), Some(StageStatus::Degraded));
    assert!(report
        .violations
        .iter()
        .any(|v| v.contains("did not return a valid id")));
}

/// Test: uppercase checkpoint id is rejected the same way
#[tokio::test(start_paused = true)]
async fn test_uppercase_checkpoint_is_partial() {
    let host = Arc::new(FakeHost::new());
    host.update(|s| {
        s.commit_output = Some("Commit 0123456789ABCDEF0123456789ABCDEF".to_string())
    });

    let report = pipeline(&host, install_config()).run().await;

    assert_eq!(report.verdict, Verdict::Partial);
}

/// Test: history failure degrades verification
#[tokio::test(start_paused = true)]
async fn test_history_failure_is_partial() {
    let host = Arc::new(FakeHost::new());
    host.update(|s| s.log_fails = true);

    let report = pipeline(&host, install_config()).run().await;

    assert_eq!(report.verdict, Verdict::Partial);
    assert!(report.checkpoint.is_some());
    assert!(!report.history_available);
}

/// Test: pool failure aborts the run regardless of later stages
#[tokio::test(start_paused = true)]
async fn test_pool_failure_aborts() {
    let host = Arc::new(FakeHost::new());
    host.update(|s| s.hide_loop_devices = true);

    let report = pipeline(&host, install_config()).run().await;

    assert_eq!(report.verdict, Verdict::Failure);
    assert_eq!(report.status(Stage::Teardown), Some(StageStatus::Ok));
    assert_eq!(report.status(Stage::PoolSetup), Some(StageStatus::Failed));
    assert_eq!(report.status(Stage::ImageBuild), None);
    assert_eq!(host.count("docker build"), 0);
    assert_eq!(host.count("titan install"), 0);

    let summary = render_summary(&report);
    assert!(summary.contains("setup: FAILED"));
    assert!(summary.contains("no loop device found"));
}

/// Test: image build failure aborts before install
#[tokio::test(start_paused = true)]
async fn test_image_build_failure_aborts() {
    let host = Arc::new(FakeHost::new());
    host.update(|s| {
        s.failing_builds.insert("titan:latest".to_string());
    });

    let report = pipeline(&host, install_config()).run().await;

    assert_eq!(report.verdict, Verdict::Failure);
    assert_eq!(report.status(Stage::ImageBuild), Some(StageStatus::Failed));
    assert_eq!(host.count("titan install"), 0);
}

/// Test: builder image is only rebuilt when absent or forced
#[tokio::test(start_paused = true)]
async fn test_builder_rebuild_skipped_when_present() {
    let host = Arc::new(FakeHost::new());
    host.update(|s| {
        s.images.insert("titandata/zfs-builder:latest".to_string());
    });

    let report = pipeline(&host, install_config()).run().await;
    assert_eq!(report.verdict, Verdict::Success);
    assert_eq!(host.count("docker build -t titan:latest ."), 1);
    assert_eq!(host.count("docker build -t titandata/zfs-builder:latest"), 0);

    host.clear_calls();
    let forced = InstallConfig {
        force_builder: true,
        ..install_config()
    };
    pipeline(&host, forced).run().await;
    assert_eq!(
        host.count("docker build -t titandata/zfs-builder:latest zfs-builder"),
        1
    );
}

/// Test: primary probe fails and registers nothing, fallback probe carries verification
#[tokio::test(start_paused = true)]
async fn test_fallback_probe_used() {
    let host = Arc::new(FakeHost::new());
    host.update(|s| {
        s.probes
            .insert("titan-probe".to_string(), ProbeBehavior::FailsUnregistered);
    });

    let report = pipeline(&host, install_config()).run().await;

    assert_eq!(report.verdict, Verdict::Partial);
    assert!(report.used_fallback_probe);
    assert_eq!(report.repository.as_deref(), Some("titan-probe-simple"));
    assert!(report.checkpoint.is_some());
    assert_eq!(host.count("titan run -n titan-probe-simple -- hello-world"), 1);
    assert_eq!(host.count("titan commit -m install verification titan-probe-simple"), 1);
}

/// Test: probe reports failure but its repository registered anyway
#[tokio::test(start_paused = true)]
async fn test_registered_despite_failure_is_partial() {
    let host = Arc::new(FakeHost::new());
    host.update(|s| {
        s.probes
            .insert("titan-probe".to_string(), ProbeBehavior::FailsRegistered);
    });

    let report = pipeline(&host, install_config()).run().await;

    assert_eq!(report.verdict, Verdict::Partial);
    assert_eq!(report.repository.as_deref(), Some("titan-probe"));
    assert!(report.checkpoint.is_some());
    assert!(report
        .violations
        .iter()
        .any(|v| v.contains("reported failure but its repository is registered")));
}

/// Test: no repository after both probes fails the run
#[tokio::test(start_paused = true)]
async fn test_no_repository_after_both_probes_fails() {
    let host = Arc::new(FakeHost::new());
    host.update(|s| {
        s.probes
            .insert("titan-probe".to_string(), ProbeBehavior::FailsUnregistered);
        s.probes
            .insert("titan-probe-simple".to_string(), ProbeBehavior::FailsUnregistered);
    });

    let report = pipeline(&host, install_config()).run().await;

    assert_eq!(report.verdict, Verdict::Failure);
    assert_eq!(report.status(Stage::Verification), Some(StageStatus::Failed));
    assert!(report.repository.is_none());
    assert_eq!(host.count("titan commit"), 0);
}

/// Test: clean slate destroys existing pools and the registry reaches install
#[tokio::test(start_paused = true)]
async fn test_clean_slate_recreates_pools() {
    let host = Arc::new(FakeHost::new());
    let pools = PoolManager::new(host.environment(), pool_config());
    for name in POOLS {
        pools.ensure_online(name, 1024).await.expect("pre-existing pool");
    }
    host.clear_calls();

    let config = InstallConfig {
        clean_slate: true,
        registry: Some("titan-registry".to_string()),
        ..install_config()
    };
    let report = pipeline(&host, config).run().await;

    assert_eq!(report.verdict, Verdict::Success, "{:?}", report.violations);
    assert_eq!(host.count("host zpool destroy -f titan"), 2);
    assert_eq!(host.count("host zpool create"), 2);
    assert_eq!(host.count("titan install --registry=titan-registry"), 1);
    assert_eq!(host.state().registries, vec!["titan-registry".to_string()]);
    let status = pools.verify(&POOLS).await.unwrap();
    assert_eq!(status.health("titan-docker"), PoolHealth::Online);
}

/// Test: pools already online are reused without recreation
#[tokio::test(start_paused = true)]
async fn test_existing_pools_reused() {
    let host = Arc::new(FakeHost::new());
    let pools = PoolManager::new(host.environment(), pool_config());
    for name in POOLS {
        pools.ensure_online(name, 1024).await.expect("pre-existing pool");
    }
    host.clear_calls();

    let report = pipeline(&host, install_config()).run().await;

    assert_eq!(report.verdict, Verdict::Success);
    assert_eq!(host.count("host zpool create"), 0);
    assert_eq!(host.count("host zpool destroy"), 0);
}

/// Test: teardown removes repositories left by a previous install
#[tokio::test(start_paused = true)]
async fn test_teardown_removes_previous_repositories() {
    let host = Arc::new(FakeHost::new());
    host.update(|s| {
        s.service_running = true;
        s.repos.insert("old-repo".to_string());
    });

    let report = pipeline(&host, install_config()).run().await;

    assert_eq!(report.verdict, Verdict::Success);
    assert_eq!(host.count("titan rm -f old-repo"), 1);
    let teardown = report.stage(Stage::Teardown).expect("teardown ran");
    assert!(teardown.notes.is_empty(), "{:?}", teardown.notes);
}

/// Test: a pool left on disk after a host restart is imported, not recreated
#[tokio::test(start_paused = true)]
async fn test_restarted_host_imports_exported_pool() {
    let host = Arc::new(FakeHost::new());
    host.update(|s| {
        s.files.insert("/var/lib/titan/pools/titan.img".to_string());
        s.exported.insert("titan".to_string());
    });

    let report = pipeline(&host, install_config()).run().await;

    assert_eq!(report.verdict, Verdict::Success, "{:?}", report.violations);
    let calls = host.calls();
    let exact = |cmd: &str| calls.iter().filter(|c| c.as_str() == cmd).count();
    assert_eq!(exact("host zpool import -f -d /dev titan"), 1);
    assert_eq!(host.count("host zpool create -f titan "), 0);
    assert_eq!(host.count("host zpool create -f titan-docker "), 1);
    let pools = report.pools.as_ref().expect("pool status");
    assert_eq!(pools.health("titan"), PoolHealth::Online);
    assert!(host.state().exported.is_empty());
}
