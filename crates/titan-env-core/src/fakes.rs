//! In-memory host for tests (testing only)
//!
//! [`FakeHost`] implements [`CommandExecutor`] by simulating the container
//! engine, the pool CLI, loop devices and the `titan` CLI. Every invocation
//! is recorded; commands that went through host access are recorded as
//! `host <command...>` so tests can assert on what reached the host.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use titan_exec::{CommandExecutor, CommandOutput, Program};

use crate::environment::{Environment, HostAccess, NSENTER_HOST_ARGS};

/// LinuxKit config naming `linuxkit/kernel:<tag>`.
pub fn linuxkit_config(kernel_tag: &str) -> String {
    format!(
        "kernel:\n  image: linuxkit/kernel:{kernel_tag}\n  cmdline: \"console=ttyS0\"\ninit:\n  - linuxkit/init:v0.8\n"
    )
}

/// How a `titan run` probe behaves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeBehavior {
    Succeeds,
    /// Command fails and nothing is registered
    FailsUnregistered,
    /// Command fails but the repository shows up anyway
    FailsRegistered,
}

/// Simulated host state. Public so tests can arrange and inspect it.
#[derive(Debug, Clone)]
pub struct FakeHostState {
    /// Contents served for `cat` of the kernel config, `None` if unreadable
    pub kernel_config: Option<String>,
    pub zfs_loaded: bool,
    /// Kernel versions with a published prebuilt module image
    pub published_modules: BTreeSet<String>,
    /// Prebuilt image exists but fails to load
    pub prebuilt_broken: bool,
    pub source_build_succeeds: bool,

    /// Imported pools and their zpool health column
    pub pools: BTreeMap<String, String>,
    /// Pools on disk but not imported
    pub exported: BTreeSet<String>,
    /// Pools whose import keeps reporting a foreign host id
    pub stuck_host_id: BTreeSet<String>,
    pub files: BTreeSet<String>,
    /// Loop device to backing file
    pub loops: BTreeMap<String, String>,
    /// `losetup -a` returns nothing even after an attach
    pub hide_loop_devices: bool,
    next_loop: u32,

    pub images: BTreeSet<String>,
    pub failing_builds: BTreeSet<String>,

    /// Installs that leave the service restarting before one succeeds
    pub install_failures_remaining: u32,
    pub service_running: bool,
    pub service_crashing: bool,
    pub registries: Vec<String>,
    pub repos: BTreeSet<String>,
    pub probes: BTreeMap<String, ProbeBehavior>,
    /// Replaces the `titan commit` output when set
    pub commit_output: Option<String>,
    pub log_fails: bool,
    next_commit: u128,
}

impl Default for FakeHostState {
    fn default() -> Self {
        Self {
            kernel_config: Some(linuxkit_config("5.10.104-linuxkit")),
            zfs_loaded: false,
            published_modules: BTreeSet::new(),
            prebuilt_broken: false,
            source_build_succeeds: true,
            pools: BTreeMap::new(),
            exported: BTreeSet::new(),
            stuck_host_id: BTreeSet::new(),
            files: BTreeSet::new(),
            loops: BTreeMap::new(),
            hide_loop_devices: false,
            next_loop: 0,
            images: BTreeSet::new(),
            failing_builds: BTreeSet::new(),
            install_failures_remaining: 0,
            service_running: false,
            service_crashing: false,
            registries: Vec::new(),
            repos: BTreeSet::new(),
            probes: BTreeMap::new(),
            commit_output: None,
            log_fails: false,
            next_commit: 0,
        }
    }
}

/// Recording, stateful stand-in for a real host.
#[derive(Debug, Default)]
pub struct FakeHost {
    state: Mutex<FakeHostState>,
    calls: Mutex<Vec<String>>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

fn ok(output: impl Into<String>) -> CommandOutput {
    CommandOutput::ok(output)
}

fn fail(output: impl Into<String>) -> CommandOutput {
    CommandOutput::failed(output, 1)
}

impl FakeHost {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_state(state: FakeHostState) -> Self {
        Self {
            state: Mutex::new(state),
            calls: Mutex::new(Vec::new()),
        }
    }

    /// Environment over this host using a helper container for host access.
    pub fn environment(self: &std::sync::Arc<Self>) -> Environment {
        Environment::new(
            self.clone(),
            HostAccess::HelperContainer {
                image: "alpine:latest".to_string(),
            },
        )
    }

    /// Change state between operations.
    pub fn update<F: FnOnce(&mut FakeHostState)>(&self, f: F) {
        f(&mut lock(&self.state));
    }

    pub fn state(&self) -> FakeHostState {
        lock(&self.state).clone()
    }

    pub fn calls(&self) -> Vec<String> {
        lock(&self.calls).clone()
    }

    /// Number of recorded calls starting with `prefix`.
    pub fn count(&self, prefix: &str) -> usize {
        lock(&self.calls)
            .iter()
            .filter(|c| c.starts_with(prefix))
            .count()
    }

    pub fn clear_calls(&self) {
        lock(&self.calls).clear();
    }

    fn host_command<'a>(program: Program, args: &'a [&'a str]) -> Option<&'a [&'a str]> {
        match program {
            Program::Nsenter if args.starts_with(&NSENTER_HOST_ARGS) => {
                Some(&args[NSENTER_HOST_ARGS.len()..])
            }
            Program::Docker if args.first() == Some(&"run") && args.contains(&"--pid=host") => {
                let pos = args.iter().position(|a| *a == "nsenter")?;
                let rest = &args[pos + 1..];
                rest.starts_with(&NSENTER_HOST_ARGS)
                    .then(|| &rest[NSENTER_HOST_ARGS.len()..])
            }
            _ => None,
        }
    }

    fn on_host(&self, cmd: &[&str]) -> CommandOutput {
        let mut s = lock(&self.state);
        match cmd {
            ["cat", path] => match &s.kernel_config {
                Some(text) => ok(text.clone()),
                None => fail(format!("cat: can't open '{path}': No such file or directory")),
            },
            ["mkdir", "-p", _] => ok(""),
            ["test", "-e", file] => {
                if s.files.contains(*file) {
                    ok("")
                } else {
                    fail("")
                }
            }
            ["truncate", "-s", _, file] => {
                s.files.insert(file.to_string());
                ok("")
            }
            ["rm", "-f", file] => {
                s.files.remove(*file);
                ok("")
            }
            ["losetup", "-f", file] => {
                if !s.files.contains(*file) {
                    return fail(format!("losetup: {file}: failed to set up loop device: No such file or directory"));
                }
                let dev = format!("/dev/loop{}", s.next_loop);
                s.next_loop += 1;
                s.loops.insert(dev, file.to_string());
                ok("")
            }
            ["losetup", "-a"] => {
                if s.hide_loop_devices {
                    return ok("");
                }
                ok(Self::loop_listing(&s, None))
            }
            ["losetup", "-j", file] => ok(Self::loop_listing(&s, Some(*file))),
            ["losetup", "-d", dev] => match s.loops.remove(*dev) {
                Some(_) => ok(""),
                None => fail(format!("losetup: {dev}: detach failed: No such device or address")),
            },
            ["zpool", "list", "-H", "-o", "name,health"] => {
                if s.pools.is_empty() {
                    return fail("no pools available");
                }
                let lines: String = s
                    .pools
                    .iter()
                    .map(|(name, health)| format!("{name}\t{health}\n"))
                    .collect();
                ok(lines)
            }
            ["zpool", "create", "-f", name, dev] => {
                if s.pools.contains_key(*name) {
                    return fail(format!("cannot create '{name}': pool already exists"));
                }
                if !s.loops.contains_key(*dev) {
                    return fail(format!("cannot open '{dev}': no such device"));
                }
                s.pools.insert(name.to_string(), "ONLINE".to_string());
                ok("")
            }
            ["zpool", "destroy", "-f", name] => match s.pools.remove(*name) {
                Some(_) => ok(""),
                None => fail(format!("cannot open '{name}': no such pool")),
            },
            ["zpool", "export", name] => match s.pools.remove(*name) {
                Some(_) => {
                    s.exported.insert(name.to_string());
                    ok("")
                }
                None => fail(format!("cannot open '{name}': no such pool")),
            },
            ["zpool", "import", "-f", "-d", "/dev", name] => {
                if s.stuck_host_id.contains(*name) {
                    return fail(format!(
                        "cannot import '{name}': pool was previously in use from another system."
                    ));
                }
                if s.pools.contains_key(*name) {
                    return fail(format!(
                        "cannot import '{name}': a pool with that name is already created/imported"
                    ));
                }
                if s.exported.remove(*name) {
                    s.pools.insert(name.to_string(), "ONLINE".to_string());
                    return ok("");
                }
                fail(format!("cannot import '{name}': no such pool available"))
            }
            _ => fail(format!("fake host: unsupported command {cmd:?}")),
        }
    }

    fn loop_listing(s: &FakeHostState, file: Option<&str>) -> String {
        s.loops
            .iter()
            .enumerate()
            .filter(|(_, (_, f))| file.map_or(true, |want| want == f.as_str()))
            .map(|(i, (dev, f))| format!("{dev}: [2049]:{} ({f})\n", 1000 + i))
            .collect()
    }

    fn on_docker(&self, args: &[&str]) -> CommandOutput {
        let mut s = lock(&self.state);
        match args {
            ["run", "--rm", _, "lsmod"] => {
                let mut out = String::from("Module                  Size  Used by\n");
                if s.zfs_loaded {
                    out.push_str("zfs                  3801088  0\nzunicode              331776  1 zfs\n");
                }
                out.push_str("overlay               126976  0\n");
                ok(out)
            }
            ["run", "--privileged", "--rm", image] => {
                let tag = image.rsplit_once(':').map(|(_, t)| t).unwrap_or("latest");
                if !s.published_modules.contains(tag) {
                    return fail(format!(
                        "Unable to find image '{image}' locally\ndocker: Error response from daemon: manifest for {image} not found: manifest unknown: manifest unknown."
                    ));
                }
                if s.prebuilt_broken {
                    return fail("insmod: ERROR: could not insert module zfs.ko: Invalid module format");
                }
                s.zfs_loaded = true;
                ok("ZFS module loaded\n")
            }
            ["run", "--rm", "--privileged", "-v", _, "-e", _, "-e", _, _builder] => {
                if s.source_build_succeeds {
                    s.zfs_loaded = true;
                    ok("Building zfs...\nDone\n")
                } else {
                    fail("configure: error: *** Unable to build an empty module.\nmake: *** [all] Error 2")
                }
            }
            ["build", "-t", image, _context] => {
                if s.failing_builds.contains(*image) {
                    return fail(format!("failed to build {image}: exit code 1"));
                }
                s.images.insert(image.to_string());
                ok(format!("Successfully tagged {image}\n"))
            }
            ["image", "inspect", image] => {
                if s.images.contains(*image) {
                    ok("[{}]")
                } else {
                    fail(format!("Error: No such image: {image}"))
                }
            }
            ["ps", "-a", "--format", _] => ok(Self::container_status(&s)),
            ["ps", "-a"] => ok(format!(
                "CONTAINER ID   IMAGE   STATUS\n{}",
                Self::container_status(&s)
            )),
            ["logs", "--tail", _, name] => ok(format!("fake logs for {name}\n")),
            ["container", "prune", "-f"] | ["volume", "prune", "-f"] => {
                ok("Total reclaimed space: 0B\n")
            }
            _ => fail(format!("fake docker: unsupported command {args:?}")),
        }
    }

    fn container_status(s: &FakeHostState) -> String {
        if s.service_running {
            "titan-docker-server\tUp 5 seconds\n".to_string()
        } else if s.service_crashing {
            "titan-docker-server\tRestarting (1) 2 seconds ago\n".to_string()
        } else {
            String::new()
        }
    }

    fn on_titan(&self, args: &[&str]) -> CommandOutput {
        let mut s = lock(&self.state);
        let needs_service = !matches!(args.first(), Some(&"install") | Some(&"uninstall"));
        if needs_service && !s.service_running {
            return fail("Error: dial tcp 127.0.0.1:5001: connect: connection refused");
        }

        match args {
            ["ls"] => {
                let mut out = String::from("REPOSITORY           STATUS\n");
                for repo in &s.repos {
                    out.push_str(&format!("{repo:<20} detached\n"));
                }
                ok(out)
            }
            ["rm", "-f", repo] => {
                if s.repos.remove(*repo) {
                    ok(format!("Removed {repo}\n"))
                } else {
                    fail(format!("repository '{repo}' does not exist"))
                }
            }
            ["uninstall", "-f"] => {
                s.service_running = false;
                s.service_crashing = false;
                ok("Uninstalled titan infrastructure\n")
            }
            ["install", rest @ ..] => {
                if let Some(registry) = rest.iter().find_map(|a| a.strip_prefix("--registry=")) {
                    s.registries.push(registry.to_string());
                }
                if s.install_failures_remaining > 0 {
                    s.install_failures_remaining -= 1;
                    s.service_crashing = true;
                    return fail("Error: titan server did not become ready\n");
                }
                s.service_crashing = false;
                s.service_running = true;
                ok("Titan cli successfully installed, happy data versioning :)\n")
            }
            ["run", "-n", repo, "--", ..] => {
                let behavior = s
                    .probes
                    .get(*repo)
                    .copied()
                    .unwrap_or(ProbeBehavior::Succeeds);
                match behavior {
                    ProbeBehavior::Succeeds => {
                        s.repos.insert(repo.to_string());
                        ok(format!("Running controlled container {repo}\n"))
                    }
                    ProbeBehavior::FailsRegistered => {
                        s.repos.insert(repo.to_string());
                        fail("Error response from daemon: driver failed programming external connectivity")
                    }
                    ProbeBehavior::FailsUnregistered => {
                        fail("Error response from daemon: error while creating mount source path")
                    }
                }
            }
            ["commit", "-m", _, repo] => {
                if !s.repos.contains(*repo) {
                    return fail(format!("repository '{repo}' does not exist"));
                }
                if let Some(out) = &s.commit_output {
                    return ok(out.clone());
                }
                s.next_commit += 1;
                ok(format!("Commit {:032x}\n", s.next_commit))
            }
            ["log", repo] => {
                if s.log_fails || !s.repos.contains(*repo) {
                    return fail(format!("repository '{repo}' does not exist"));
                }
                ok(format!("commit {:032x}\nAuthor: titan\n\n    checkpoint\n", s.next_commit))
            }
            _ => fail(format!("fake titan: unsupported command {args:?}")),
        }
    }
}

#[async_trait]
impl CommandExecutor for FakeHost {
    async fn execute(&self, program: Program, args: &[&str]) -> CommandOutput {
        if let Some(cmd) = Self::host_command(program, args) {
            lock(&self.calls).push(format!("host {}", cmd.join(" ")));
            return self.on_host(cmd);
        }

        lock(&self.calls).push(format!("{} {}", program, args.join(" ")));
        match program {
            Program::Docker => self.on_docker(args),
            Program::Titan => self.on_titan(args),
            Program::Nsenter => fail("fake nsenter: host commands only"),
        }
    }
}
