//! Titan environment bootstrap CLI
//!
//! The `titan-env` command readies a container host for the Titan storage service.
//!
//! ## Commands
//!
//! - `kernel`: Show the running kernel tag and its prebuilt module image
//! - `module install`: Provision a ZFS kernel module for the running kernel
//! - `pools`: Inspect, create, clean or recover the storage pools
//! - `install`: Run the staged installation pipeline
//! - `checkpoint-check`: Validate a checkpoint identifier

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use serde_json::json;
use tracing::info;

use titan_env_core::{
    init_tracing, kernel_tag_from_file, CheckpointId, EnvError, Environment,
    HostAccess, ModuleConfig, ModuleImageRef, ModuleProvisioner, PoolConfig, PoolManager,
    PoolStatusReport,
};
use titan_exec::{ProgramPaths, SystemExecutor};
use titan_install::{render_summary, InstallConfig, InstallPipeline};

#[derive(Parser)]
#[command(name = "titan-env")]
#[command(author = "Titan Data")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Ready a container host for the Titan storage service", long_about = None)]
struct Cli {
    /// Enable verbose output (same as setting TITAN_DEBUG)
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit JSON-formatted log lines and results
    #[arg(long, global = true)]
    json: bool,

    /// How host-level commands reach the host namespaces
    #[arg(
        long,
        global = true,
        value_enum,
        env = "TITAN_HOST_ACCESS",
        default_value_t = HostAccessMode::HelperContainer
    )]
    host_access: HostAccessMode,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum HostAccessMode {
    /// Privileged helper container sharing the host PID namespace
    HelperContainer,
    /// Local nsenter, when already running on the host as root
    Nsenter,
}

#[derive(Subcommand)]
enum Commands {
    /// Show the running kernel tag and its prebuilt module image
    Kernel {
        /// Parse a local kernel config file instead of querying the host
        #[arg(long)]
        config_file: Option<PathBuf>,
    },

    /// Manage the ZFS kernel module
    Module {
        #[command(subcommand)]
        action: ModuleAction,
    },

    /// Manage the storage pools
    Pools {
        #[command(subcommand)]
        action: PoolAction,
    },

    /// Run the staged installation pipeline
    Install {
        /// Registry passed to the install entry point
        #[arg(long, env = "TITAN_REGISTRY")]
        registry: Option<String>,

        /// Destroy and recreate both pools first
        #[arg(long)]
        clean: bool,

        /// Rebuild the module-builder image even if present
        #[arg(long)]
        force_builder: bool,

        /// Install attempts before giving up
        #[arg(long)]
        attempts: Option<u32>,
    },

    /// Validate a checkpoint identifier (`Commit <32 lowercase hex>`)
    CheckpointCheck {
        /// Checkpoint command output to validate
        text: String,
    },
}

#[derive(Subcommand)]
enum ModuleAction {
    /// Install a prebuilt module, building from source if none is published
    Install,
}

#[derive(Subcommand)]
enum PoolAction {
    /// Show the health of both pools
    Status,
    /// Create any missing pool and bring both online
    Ensure {
        /// Backing file size in MiB
        #[arg(long)]
        size_mb: Option<u64>,
    },
    /// Destroy both pools and release their backing storage
    Clean,
    /// Export and re-import pools after a host restart
    Recover,
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();

    init_tracing(cli.json, cli.verbose);

    let module_config = ModuleConfig::from_env();
    let pool_config = PoolConfig::from_env();
    let env = system_environment(cli.host_access, &module_config);

    let code = match cli.command {
        Commands::Kernel { config_file } => {
            cmd_kernel(&env, &module_config, config_file.as_deref(), cli.json).await?
        }
        Commands::Module { action } => match action {
            ModuleAction::Install => cmd_module_install(&env, &module_config, cli.json).await?,
        },
        Commands::Pools { action } => cmd_pools(&env, pool_config, action, cli.json).await?,
        Commands::Install {
            registry,
            clean,
            force_builder,
            attempts,
        } => {
            let mut config = InstallConfig::from_env();
            if registry.is_some() {
                config.registry = registry;
            }
            config.clean_slate |= clean;
            config.force_builder |= force_builder;
            if let Some(attempts) = attempts {
                config.max_attempts = attempts;
            }
            cmd_install(&env, pool_config, config, cli.json).await?
        }
        Commands::CheckpointCheck { text } => cmd_checkpoint_check(&text, cli.json)?,
    };

    Ok(ExitCode::from(code))
}

fn system_environment(mode: HostAccessMode, module: &ModuleConfig) -> Environment {
    let access = match mode {
        HostAccessMode::HelperContainer => HostAccess::HelperContainer {
            image: module.helper_image.clone(),
        },
        HostAccessMode::Nsenter => HostAccess::Nsenter,
    };
    let executor = SystemExecutor::new(ProgramPaths::default());
    Environment::new(Arc::new(executor), access)
}

fn print_json(value: &serde_json::Value) -> Result<()> {
    println!(
        "{}",
        serde_json::to_string_pretty(value).context("Failed to serialize output")?
    );
    Ok(())
}

/// Error text followed by numbered remediation steps, when the error has any.
fn render_error(err: &EnvError) -> String {
    let mut out = format!("Error: {}\n", err);
    if let Some(hints) = err.remediation() {
        out.push_str("\nTo resolve this, you can:\n");
        for (i, hint) in hints.iter().enumerate() {
            out.push_str(&format!("  {}. {}\n", i + 1, hint));
        }
    }
    out
}

/// Print an error with its remediation steps and return the failure exit code.
fn report_error(err: &EnvError) -> u8 {
    eprint!("{}", render_error(err));
    1
}

fn print_pools(status: &PoolStatusReport, json: bool) -> Result<()> {
    if json {
        return print_json(&serde_json::to_value(status)?);
    }
    for (name, health) in &status.pools {
        println!("{:<16} {}", name, health);
    }
    Ok(())
}

async fn cmd_kernel(
    env: &Environment,
    module: &ModuleConfig,
    config_file: Option<&Path>,
    json: bool,
) -> Result<u8> {
    let kernel = match config_file {
        Some(path) => kernel_tag_from_file(path),
        None => {
            ModuleProvisioner::new(env.clone(), module.clone())
                .detect_kernel()
                .await
        }
    };
    let kernel = match kernel {
        Ok(kernel) => kernel,
        Err(e) => return Ok(report_error(&e)),
    };

    let image = ModuleImageRef::for_kernel(&module.prebuilt_repository, &kernel);
    if json {
        print_json(&json!({
            "kernel": kernel,
            "version": kernel.version(),
            "module_image": image.to_string(),
        }))?;
    } else {
        println!("Kernel:       {}", kernel);
        println!("Version:      {}", kernel.version());
        println!("Module image: {}", image);
    }
    Ok(0)
}

async fn cmd_module_install(env: &Environment, module: &ModuleConfig, json: bool) -> Result<u8> {
    let provisioner = ModuleProvisioner::new(env.clone(), module.clone());
    match provisioner.provision().await {
        Ok(outcome) => {
            if json {
                print_json(&serde_json::to_value(&outcome)?)?;
            } else {
                println!("ZFS module ready for kernel {}", outcome.kernel());
            }
            Ok(0)
        }
        Err(e) => Ok(report_error(&e)),
    }
}

async fn cmd_pools(
    env: &Environment,
    config: PoolConfig,
    action: PoolAction,
    json: bool,
) -> Result<u8> {
    let size_mb = match &action {
        PoolAction::Ensure { size_mb } => size_mb.unwrap_or(config.image_size_mb),
        _ => config.image_size_mb,
    };
    let pools = PoolManager::new(env.clone(), config);
    let names = pools.config().pool_names();

    let result = match action {
        PoolAction::Status => Ok(()),
        PoolAction::Ensure { .. } => {
            let mut result = Ok(());
            for name in names {
                if let Err(e) = pools.ensure_online(name, size_mb).await {
                    result = Err(e);
                    break;
                }
            }
            result
        }
        PoolAction::Clean => pools.clean(&names).await,
        PoolAction::Recover => pools.recover_host_id_mismatch(&names).await,
    };
    if let Err(e) = result {
        return Ok(report_error(&e));
    }

    match pools.verify(&names).await {
        Ok(status) => {
            print_pools(&status, json)?;
            Ok(0)
        }
        Err(e) => Ok(report_error(&e)),
    }
}

async fn cmd_install(
    env: &Environment,
    pool_config: PoolConfig,
    config: InstallConfig,
    json: bool,
) -> Result<u8> {
    info!(
        clean_slate = config.clean_slate,
        max_attempts = config.max_attempts,
        "Starting Titan install"
    );
    let pipeline = InstallPipeline::new(env.clone(), pool_config, config);
    let report = pipeline.run().await;

    if json {
        print_json(&serde_json::to_value(&report)?)?;
    } else {
        print!("{}", render_summary(&report));
    }
    Ok(report.verdict.exit_code())
}

fn cmd_checkpoint_check(text: &str, json: bool) -> Result<u8> {
    let checkpoint = CheckpointId::parse(text);
    if json {
        print_json(&json!({
            "valid": checkpoint.is_some(),
            "checkpoint": checkpoint,
        }))?;
    } else {
        match &checkpoint {
            Some(id) => println!("valid checkpoint {}", id),
            None => println!("invalid checkpoint: {:?}", text),
        }
    }
    Ok(if checkpoint.is_some() { 0 } else { 1 })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use titan_env_core::fakes::FakeHost;
    use titan_env_core::SOURCE_BUILD_REMEDIATION;

    fn module_config() -> ModuleConfig {
        ModuleConfig {
            helper_image: "alpine:latest".to_string(),
            kernel_config_path: "/etc/linuxkit.yml".to_string(),
            prebuilt_repository: "titandata/docker-desktop-zfs-kernel".to_string(),
            builder_image: "titandata/zfs-builder:latest".to_string(),
            zfs_version: "zfs-0.8.2".to_string(),
            zfs_config: "kernel".to_string(),
            engine_socket: "/var/run/docker.sock".to_string(),
        }
    }

    fn pool_config() -> PoolConfig {
        PoolConfig {
            system_pool: "titan".to_string(),
            docker_pool: "titan-docker".to_string(),
            pool_dir: PathBuf::from("/var/lib/titan/pools"),
            image_size_mb: 256,
            stability_polls: 2,
            poll_interval_secs: 1,
        }
    }

    #[test]
    fn test_cli_parses_install_flags() {
        let cli = Cli::try_parse_from([
            "titan-env",
            "--host-access",
            "nsenter",
            "install",
            "--registry",
            "titan-registry",
            "--clean",
            "--attempts",
            "5",
        ])
        .expect("parse");
        assert_eq!(cli.host_access, HostAccessMode::Nsenter);
        match cli.command {
            Commands::Install {
                registry,
                clean,
                force_builder,
                attempts,
            } => {
                assert_eq!(registry.as_deref(), Some("titan-registry"));
                assert!(clean);
                assert!(!force_builder);
                assert_eq!(attempts, Some(5));
            }
            _ => panic!("expected install"),
        }
    }

    #[test]
    fn test_cli_parses_pool_actions() {
        let cli = Cli::try_parse_from(["titan-env", "pools", "ensure", "--size-mb", "512"])
            .expect("parse");
        assert!(matches!(
            cli.command,
            Commands::Pools {
                action: PoolAction::Ensure { size_mb: Some(512) }
            }
        ));
    }

    #[test]
    fn test_checkpoint_check_exit_codes() {
        assert_eq!(
            cmd_checkpoint_check("Commit 0123456789abcdef0123456789abcdef", false).unwrap(),
            0
        );
        assert_eq!(cmd_checkpoint_check("Commit XYZ123", false).unwrap(), 1);
        assert_eq!(
            cmd_checkpoint_check("commit 0123456789abcdef0123456789abcdef", false).unwrap(),
            1
        );
    }

    #[tokio::test]
    async fn test_kernel_from_local_file() {
        let host = Arc::new(FakeHost::new());
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"kernel:\n  image: linuxkit/kernel:6.6.12-linuxkit\n")
            .unwrap();

        let code = cmd_kernel(&host.environment(), &module_config(), Some(file.path()), false)
            .await
            .unwrap();

        assert_eq!(code, 0);
        assert!(host.calls().is_empty(), "local file must not touch the host");
    }

    #[tokio::test]
    async fn test_module_install_failure_exits_non_zero() {
        let host = Arc::new(FakeHost::new());
        host.update(|s| s.source_build_succeeds = false);

        let code = cmd_module_install(&host.environment(), &module_config(), false)
            .await
            .unwrap();

        assert_eq!(code, 1);
    }

    #[tokio::test]
    async fn test_source_build_failure_prints_remediation() {
        let host = Arc::new(FakeHost::new());
        host.update(|s| s.source_build_succeeds = false);

        let err = ModuleProvisioner::new(host.environment(), module_config())
            .provision()
            .await
            .unwrap_err();
        let text = render_error(&err);

        assert!(text.starts_with("Error: "), "{text}");
        assert!(text.contains("To resolve this, you can:"));
        for (i, hint) in SOURCE_BUILD_REMEDIATION.iter().enumerate() {
            assert!(text.contains(&format!("  {}. {}", i + 1, hint)), "{text}");
        }
    }

    #[test]
    fn test_error_without_hints_renders_one_line() {
        let err = EnvError::LoopDeviceNotFound {
            pool: "titan".to_string(),
            file: "/var/lib/titan/pools/titan.img".to_string(),
        };
        let text = render_error(&err);
        assert_eq!(text.lines().count(), 1);
        assert!(!text.contains("To resolve"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_pools_ensure_then_clean() {
        let host = Arc::new(FakeHost::new());
        let env = host.environment();

        let code = cmd_pools(&env, pool_config(), PoolAction::Ensure { size_mb: None }, true)
            .await
            .unwrap();
        assert_eq!(code, 0);
        assert_eq!(host.count("host truncate -s 256M"), 2);

        let code = cmd_pools(&env, pool_config(), PoolAction::Clean, false)
            .await
            .unwrap();
        assert_eq!(code, 0);
        assert!(host.state().pools.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_install_exit_code_follows_verdict() {
        let host = Arc::new(FakeHost::new());
        let config = InstallConfig {
            settle_secs: 1,
            status_interval_secs: 1,
            ..InstallConfig::default()
        };

        let code = cmd_install(&host.environment(), pool_config(), config.clone(), false)
            .await
            .unwrap();
        assert_eq!(code, 0);

        host.update(|s| s.hide_loop_devices = true);
        let code = cmd_install(
            &host.environment(),
            PoolConfig {
                system_pool: "other".to_string(),
                ..pool_config()
            },
            config,
            false,
        )
        .await
        .unwrap();
        assert_eq!(code, 1);
    }
}
