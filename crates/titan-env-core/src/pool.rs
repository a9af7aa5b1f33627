//! Storage pool lifecycle.
//!
//! Each pool is backed by a sparse file attached to a loop device. Pools move
//! through [`PoolHealth`] states; the manager validates every transition it
//! makes so a bad sequence fails loudly instead of corrupting a pool.

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use titan_exec::{zpool, ErrorKind};
use tracing::{debug, info, warn};

use crate::config::PoolConfig;
use crate::environment::Environment;
use crate::error::{EnvError, Result};
use crate::retry::{poll_until, PollPolicy};

/// Health of a named pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PoolHealth {
    Absent,
    /// Backing file found on disk; importing the pool it holds
    Importing,
    Creating,
    Online,
    /// Imported but unhealthy, typically a host-id mismatch after a VM restart
    Degraded,
    Destroying,
}

impl PoolHealth {
    /// Parse the `health` column of `zpool list`.
    pub fn from_zpool(health: &str) -> Self {
        match health.trim().to_ascii_uppercase().as_str() {
            "ONLINE" => PoolHealth::Online,
            _ => PoolHealth::Degraded,
        }
    }

    pub fn can_transition_to(self, next: PoolHealth) -> bool {
        use PoolHealth::*;
        matches!(
            (self, next),
            (Absent, Creating)
                | (Absent, Importing)
                | (Importing, Online)
                | (Importing, Creating)
                | (Importing, Absent)
                | (Creating, Online)
                | (Creating, Absent)
                | (Online, Degraded)
                | (Degraded, Online)
                | (Online, Destroying)
                | (Degraded, Destroying)
                | (Destroying, Absent)
        )
    }
}

impl fmt::Display for PoolHealth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PoolHealth::Absent => "absent",
            PoolHealth::Importing => "importing",
            PoolHealth::Creating => "creating",
            PoolHealth::Online => "online",
            PoolHealth::Degraded => "degraded",
            PoolHealth::Destroying => "destroying",
        };
        f.write_str(s)
    }
}

/// A named pool and where it lives.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pool {
    pub name: String,
    pub image_file: PathBuf,
    pub device: Option<String>,
    pub health: PoolHealth,
}

impl Pool {
    pub fn new(name: &str, image_file: PathBuf, health: PoolHealth) -> Self {
        Self {
            name: name.to_string(),
            image_file,
            device: None,
            health,
        }
    }

    /// Move to `next`, rejecting transitions the lifecycle does not allow.
    pub fn transition(&mut self, next: PoolHealth) -> Result<()> {
        if !self.health.can_transition_to(next) {
            return Err(EnvError::InvalidPoolTransition {
                pool: self.name.clone(),
                from: self.health,
                to: next,
            });
        }
        debug!(pool = %self.name, from = %self.health, to = %next, "Pool state change");
        self.health = next;
        Ok(())
    }
}

/// Health of every requested pool, by name.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolStatusReport {
    pub pools: BTreeMap<String, PoolHealth>,
}

impl PoolStatusReport {
    pub fn health(&self, name: &str) -> PoolHealth {
        self.pools.get(name).copied().unwrap_or(PoolHealth::Absent)
    }

    pub fn all_online(&self) -> bool {
        !self.pools.is_empty() && self.pools.values().all(|h| *h == PoolHealth::Online)
    }

    pub fn all_absent(&self) -> bool {
        self.pools.values().all(|h| *h == PoolHealth::Absent)
    }

    /// Names not yet online
    pub fn pending(&self) -> Vec<String> {
        self.pools
            .iter()
            .filter(|(_, h)| **h != PoolHealth::Online)
            .map(|(n, _)| n.clone())
            .collect()
    }
}

/// Parse `zpool list -H -o name,health` output into name/health pairs.
pub fn parse_pool_list(output: &str) -> BTreeMap<String, PoolHealth> {
    output
        .lines()
        .filter_map(|line| {
            let mut fields = line.split_whitespace();
            let name = fields.next()?;
            let health = fields.next()?;
            Some((name.to_string(), PoolHealth::from_zpool(health)))
        })
        .collect()
}

/// Loop devices attached to `file`, from `losetup -a` or `losetup -j` output.
///
/// Lines look like `/dev/loop0: [2049]:1234 (/var/lib/titan/pools/titan.img)`.
pub fn find_loop_devices(listing: &str, file: &str) -> Vec<String> {
    let needle = format!("({file})");
    listing
        .lines()
        .filter(|line| line.contains(&needle))
        .filter_map(|line| line.split_once(':'))
        .map(|(device, _)| device.trim().to_string())
        .collect()
}

/// Creates, verifies, recovers and destroys the named pools.
pub struct PoolManager {
    env: Environment,
    config: PoolConfig,
}

impl PoolManager {
    pub fn new(env: Environment, config: PoolConfig) -> Self {
        Self { env, config }
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    async fn zpool(&self, args: &[&str]) -> Result<String> {
        let mut command = vec!["zpool"];
        command.extend_from_slice(args);
        let out = self.env.host(&command).await;
        if out.success {
            Ok(out.output)
        } else {
            Err(EnvError::PoolCommandFailed {
                command: command.join(" "),
                output: out.output,
            })
        }
    }

    /// Aggregate health for each named pool.
    pub async fn verify(&self, names: &[&str]) -> Result<PoolStatusReport> {
        let out = self
            .env
            .host(&["zpool", "list", "-H", "-o", "name,health"])
            .await;

        let listed = if out.success {
            parse_pool_list(&out.output)
        } else if zpool::is_absent(&out.output) {
            BTreeMap::new()
        } else {
            return Err(EnvError::PoolCommandFailed {
                command: "zpool list -H -o name,health".to_string(),
                output: out.output,
            });
        };

        let pools = names
            .iter()
            .map(|name| {
                let health = listed.get(*name).copied().unwrap_or(PoolHealth::Absent);
                (name.to_string(), health)
            })
            .collect();
        Ok(PoolStatusReport { pools })
    }

    async fn loop_devices_for(&self, file: &str) -> Vec<String> {
        let out = self.env.host(&["losetup", "-j", file]).await;
        if !out.success {
            return Vec::new();
        }
        find_loop_devices(&out.output, file)
    }

    async fn detach_loop_devices(&self, name: &str, file: &str) {
        for device in self.loop_devices_for(file).await {
            let out = self.env.host(&["losetup", "-d", device.as_str()]).await;
            if !out.success {
                warn!(pool = %name, device = %device, output = out.trimmed(), "Unable to detach loop device");
            }
        }
    }

    /// Loop device backing `file`. An already attached device is reused so
    /// repeated attempts never stack devices on the same file.
    async fn attach_loop_device(&self, name: &str, file: &str) -> Result<String> {
        if let Some(device) = self.loop_devices_for(file).await.into_iter().next() {
            debug!(pool = %name, device = %device, "Reusing attached loop device");
            return Ok(device);
        }

        let out = self.env.host(&["losetup", "-f", file]).await;
        if !out.success {
            return Err(EnvError::PoolCommandFailed {
                command: format!("losetup -f {file}"),
                output: out.output,
            });
        }

        let listing = self.env.host(&["losetup", "-a"]).await;
        match find_loop_devices(&listing.output, file).into_iter().next() {
            Some(device) => {
                debug!(pool = %name, device = %device, "Attached backing file");
                Ok(device)
            }
            None => {
                self.detach_loop_devices(name, file).await;
                Err(EnvError::LoopDeviceNotFound {
                    pool: name.to_string(),
                    file: file.to_string(),
                })
            }
        }
    }

    /// Import the pool held by an existing backing file.
    ///
    /// Returns `false`, with the pool moved to `Creating`, when the file holds
    /// no importable pool. A pool claimed by another host is never recreated.
    async fn import_from_backing_file(&self, pool: &mut Pool, file: &str) -> Result<bool> {
        let name = pool.name.clone();
        pool.transition(PoolHealth::Importing)?;
        info!(pool = %name, file = %file, "Backing file present, importing pool");

        let device = match self.attach_loop_device(&name, file).await {
            Ok(device) => device,
            Err(e) => {
                pool.transition(PoolHealth::Absent)?;
                return Err(e);
            }
        };

        match self.zpool(&["import", "-f", "-d", "/dev", name.as_str()]).await {
            Ok(_) => {
                pool.device = Some(device);
                pool.transition(PoolHealth::Online)?;
                info!(pool = %name, "Pool imported");
                Ok(true)
            }
            Err(EnvError::PoolCommandFailed { output, .. }) if zpool::is_absent(&output) => {
                debug!(pool = %name, "No importable pool on backing file");
                pool.transition(PoolHealth::Creating)?;
                Ok(false)
            }
            Err(EnvError::PoolCommandFailed { command, output }) => {
                self.detach_loop_devices(&name, file).await;
                pool.transition(PoolHealth::Absent)?;
                if zpool::classify(&output) == ErrorKind::HostIdMismatch {
                    Err(EnvError::HostIdMismatchUnresolved { pool: name, output })
                } else {
                    Err(EnvError::PoolCommandFailed { command, output })
                }
            }
            Err(e) => Err(e),
        }
    }

    /// Destroy pools, detach their loop devices and delete backing files.
    /// Safe to call on pools that do not exist.
    pub async fn clean(&self, names: &[&str]) -> Result<()> {
        let status = self.verify(names).await?;

        for &name in names {
            let file = self.config.image_file(name);
            let file_str = file.to_string_lossy().into_owned();
            let mut pool = Pool::new(name, file, status.health(name));

            if pool.health != PoolHealth::Absent {
                pool.transition(PoolHealth::Destroying)?;
            }

            info!(pool = %name, "Destroying pool");
            let out = self.env.host(&["zpool", "destroy", "-f", name]).await;
            if !out.success {
                if zpool::is_absent(&out.output) {
                    debug!(pool = %name, "Pool already absent");
                } else {
                    return Err(EnvError::PoolCommandFailed {
                        command: format!("zpool destroy -f {name}"),
                        output: out.output,
                    });
                }
            }

            self.detach_loop_devices(name, &file_str).await;

            let out = self.env.host(&["rm", "-f", file_str.as_str()]).await;
            if !out.success {
                warn!(pool = %name, file = %file_str, output = out.trimmed(), "Unable to remove backing file");
            }

            if pool.health == PoolHealth::Destroying {
                pool.transition(PoolHealth::Absent)?;
            }
        }
        Ok(())
    }

    /// Make sure a pool is online.
    ///
    /// A pool missing from `zpool list` whose backing file still exists is
    /// imported, not recreated; creation only happens when there is no file
    /// or the file holds no pool.
    pub async fn ensure_online(&self, name: &str, image_size_mb: u64) -> Result<Pool> {
        let file = self.config.image_file(name);
        let file_str = file.to_string_lossy().into_owned();
        let status = self.verify(&[name]).await?;
        let mut pool = Pool::new(name, file, status.health(name));

        match pool.health {
            PoolHealth::Online => {
                debug!(pool = %name, "Pool already online");
                return Ok(pool);
            }
            PoolHealth::Degraded => {
                self.recover_host_id_mismatch(&[name]).await?;
                let status = self.verify(&[name]).await?;
                if status.health(name) == PoolHealth::Online {
                    pool.transition(PoolHealth::Online)?;
                    return Ok(pool);
                }
                return Err(EnvError::PoolsUnstable {
                    polls: 1,
                    pending: vec![name.to_string()],
                });
            }
            _ => {}
        }

        if self.env.host(&["test", "-e", file_str.as_str()]).await.success {
            if self.import_from_backing_file(&mut pool, &file_str).await? {
                return Ok(pool);
            }
        } else {
            pool.transition(PoolHealth::Creating)?;
        }
        info!(pool = %name, file = %file_str, size_mb = image_size_mb, "Creating pool");

        let dir = self.config.pool_dir.to_string_lossy().into_owned();
        let size = format!("{image_size_mb}M");
        for command in [
            vec!["mkdir", "-p", dir.as_str()],
            vec!["truncate", "-s", size.as_str(), file_str.as_str()],
        ] {
            let out = self.env.host(&command).await;
            if !out.success {
                self.detach_loop_devices(name, &file_str).await;
                pool.transition(PoolHealth::Absent)?;
                return Err(EnvError::PoolCommandFailed {
                    command: command.join(" "),
                    output: out.output,
                });
            }
        }

        let device = match self.attach_loop_device(name, &file_str).await {
            Ok(device) => device,
            Err(e) => {
                pool.transition(PoolHealth::Absent)?;
                return Err(e);
            }
        };

        if let Err(e) = self.zpool(&["create", "-f", name, device.as_str()]).await {
            self.detach_loop_devices(name, &file_str).await;
            pool.transition(PoolHealth::Absent)?;
            return Err(e);
        }

        pool.device = Some(device);
        pool.transition(PoolHealth::Online)?;
        info!(pool = %name, "Pool online");
        Ok(pool)
    }

    /// Export and re-import pools whose embedded host id no longer matches.
    ///
    /// Pools that were not imported beforehand may not exist yet, so their
    /// export/import failures are ignored.
    pub async fn recover_host_id_mismatch(&self, names: &[&str]) -> Result<()> {
        let status = self.verify(names).await?;

        for &name in names {
            let was_imported = status.health(name) != PoolHealth::Absent;

            if let Err(e) = self.zpool(&["export", name]).await {
                if was_imported {
                    warn!(pool = %name, error = %e, "Export failed, attempting import anyway");
                } else {
                    debug!(pool = %name, "Pool not imported, nothing to export");
                }
            }

            match self.zpool(&["import", "-f", "-d", "/dev", name]).await {
                Ok(_) => info!(pool = %name, "Pool re-imported"),
                Err(EnvError::PoolCommandFailed { output, .. }) if was_imported => {
                    return Err(EnvError::HostIdMismatchUnresolved {
                        pool: name.to_string(),
                        output,
                    });
                }
                Err(EnvError::PoolCommandFailed { output, .. }) => {
                    if zpool::classify(&output) == ErrorKind::HostIdMismatch {
                        warn!(pool = %name, "Pool still claimed by another host");
                    } else {
                        debug!(pool = %name, "No importable pool found");
                    }
                }
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    /// Poll until every named pool is online.
    pub async fn wait_until_online(&self, names: &[&str], policy: &PollPolicy) -> Result<u32> {
        let polls = poll_until(policy, |poll| async move {
            match self.verify(names).await {
                Ok(report) => report.all_online(),
                Err(e) => {
                    warn!(poll, error = %e, "Pool status check failed");
                    false
                }
            }
        })
        .await;

        match polls {
            Some(polls) => Ok(polls),
            None => {
                let pending = match self.verify(names).await {
                    Ok(report) => report.pending(),
                    Err(_) => names.iter().map(|n| n.to_string()).collect(),
                };
                Err(EnvError::PoolsUnstable {
                    polls: policy.max_polls,
                    pending,
                })
            }
        }
    }
}
