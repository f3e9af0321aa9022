//! `dronegrid run`: wires every channel and starts every component.
//!
//! ```text
//!                 ┌────────────── exit ───────────────┐
//!                 ▼                                   │
//!           supervisor ◄── ping/pong ──► coordinator ─┘
//!                 ▲                        ▲  ▲  ▲
//!                 │ ping/pong              │  │  │ data (one pipe per direction)
//!                 ▼                        ▼  ▼  ▼
//!        physics, obstacles, targets ◄────┘
//! ```
//!
//! Each child is this same binary re-executed with a subcommand. Pipes are
//! created close-on-exec; a child keeps only the handles named on its
//! command line.

use crate::wiring::LinkSpec;

use anyhow::{Context, Result};
use dronegrid_env::channel::inherit;
use dronegrid_env::{FileRegistry, Pid, Pipe, Registry, Role};
use serde::Serialize;
use std::collections::BTreeMap;
use std::os::fd::RawFd;
use std::os::unix::process::CommandExt;
use std::path::PathBuf;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Collaborators the coordinator exchanges data with.
pub const DEPENDENTS: [Role; 3] = [Role::Physics, Role::ObstacleGenerator, Role::TargetGenerator];

/// Everything monitored by the supervisor.
pub const MONITORED: [Role; 4] = [
    Role::Coordinator,
    Role::Physics,
    Role::ObstacleGenerator,
    Role::TargetGenerator,
];

/// Options forwarded to every child.
#[derive(Debug, Clone)]
pub struct RunConfig {
    /// Binary to re-execute
    pub program: PathBuf,
    pub registry: PathBuf,
    pub log_dir: PathBuf,
    /// Resolved master seed (never 0 here)
    pub seed: u64,
    pub verbose: bool,
    /// Log to stderr and skip the terminal UI
    pub headless: bool,
    /// Overrides the supervisor's default probe timeout
    pub probe_timeout: Option<Duration>,
}

impl RunConfig {
    fn common_args(&self) -> Vec<String> {
        let mut args = vec![
            "--registry".to_string(),
            self.registry.display().to_string(),
            "--log-dir".to_string(),
            self.log_dir.display().to_string(),
            "--seed".to_string(),
            self.seed.to_string(),
        ];
        if self.verbose {
            args.push("--verbose".to_string());
        }
        if self.headless {
            args.push("--log-stderr".to_string());
        }
        args
    }
}

/// A child's command line and the handles it inherits.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChildPlan {
    pub role: Role,
    pub args: Vec<String>,
    pub fds: Vec<RawFd>,
}

/// Exit record of one child.
#[derive(Debug, Clone, Serialize)]
pub struct ChildExit {
    pub role: Role,
    pub pid: u32,
    pub code: Option<i32>,
    pub success: bool,
}

/// How the run ended.
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub seed: u64,
    pub children: Vec<ChildExit>,
}

impl RunSummary {
    pub fn all_succeeded(&self) -> bool {
        self.children.iter().all(|child| child.success)
    }
}

/// Every pipe of one run, owned by the orchestrator until the children
/// are spawned.
pub struct Wiring {
    /// coordinator -> dependent, dependent -> coordinator
    data: BTreeMap<Role, (Pipe, Pipe)>,
    /// supervisor -> participant, participant -> supervisor
    control: BTreeMap<Role, (Pipe, Pipe)>,
    /// coordinator -> supervisor
    exit: Pipe,
}

impl Wiring {
    pub fn new() -> Result<Self> {
        let mut data = BTreeMap::new();
        for role in DEPENDENTS {
            let pair = (Pipe::new()?, Pipe::new()?);
            data.insert(role, pair);
        }
        let mut control = BTreeMap::new();
        for role in MONITORED {
            let pair = (Pipe::new()?, Pipe::new()?);
            control.insert(role, pair);
        }
        Ok(Self {
            data,
            control,
            exit: Pipe::new().context("creating exit pipe")?,
        })
    }

    fn heartbeat_args(&self, role: Role, args: &mut Vec<String>, fds: &mut Vec<RawFd>) {
        if let Some((ping, pong)) = self.control.get(&role) {
            args.extend([
                "--heartbeat-rx".to_string(),
                ping.read_fd().to_string(),
                "--heartbeat-tx".to_string(),
                pong.write_fd().to_string(),
            ]);
            fds.extend([ping.read_fd().as_raw(), pong.write_fd().as_raw()]);
        }
    }

    /// Command lines for every child, supervisor first.
    pub fn plans(&self, config: &RunConfig) -> Vec<ChildPlan> {
        let mut plans = Vec::new();

        // Supervisor
        let mut args = vec!["supervisor".to_string()];
        args.extend(config.common_args());
        let mut fds = vec![self.exit.read_fd().as_raw()];
        args.extend(["--exit-rx".to_string(), self.exit.read_fd().to_string()]);
        if let Some(timeout) = config.probe_timeout {
            args.extend(["--probe-timeout-ms".to_string(), timeout.as_millis().to_string()]);
        }
        for (role, (ping, pong)) in &self.control {
            let spec = LinkSpec::new(*role, Some(pong.read_fd()), Some(ping.write_fd()));
            fds.extend(spec.fds().map(|fd| fd.as_raw()));
            args.extend(["--control".to_string(), spec.to_string()]);
        }
        plans.push(ChildPlan {
            role: Role::Supervisor,
            args,
            fds,
        });

        // Coordinator
        let mut args = vec!["coordinator".to_string()];
        args.extend(config.common_args());
        if config.headless {
            args.push("--headless".to_string());
        }
        let mut fds = vec![self.exit.write_fd().as_raw()];
        args.extend(["--supervisor-tx".to_string(), self.exit.write_fd().to_string()]);
        for (role, (to_dependent, from_dependent)) in &self.data {
            let spec = LinkSpec::new(*role, Some(from_dependent.read_fd()), Some(to_dependent.write_fd()));
            fds.extend(spec.fds().map(|fd| fd.as_raw()));
            args.extend(["--link".to_string(), spec.to_string()]);
        }
        self.heartbeat_args(Role::Coordinator, &mut args, &mut fds);
        plans.push(ChildPlan {
            role: Role::Coordinator,
            args,
            fds,
        });

        // Dependents
        for (role, (to_dependent, from_dependent)) in &self.data {
            let mut args = vec![role.name().to_string()];
            args.extend(config.common_args());
            args.extend([
                "--rx".to_string(),
                to_dependent.read_fd().to_string(),
                "--tx".to_string(),
                from_dependent.write_fd().to_string(),
            ]);
            let mut fds = vec![to_dependent.read_fd().as_raw(), from_dependent.write_fd().as_raw()];
            self.heartbeat_args(*role, &mut args, &mut fds);
            plans.push(ChildPlan { role: *role, args, fds });
        }

        plans
    }
}

fn spawn(config: &RunConfig, plan: &ChildPlan) -> Result<Child> {
    let mut command = Command::new(&config.program);
    command.args(&plan.args);
    if plan.role != Role::Coordinator {
        command.stdin(Stdio::null()).stdout(Stdio::null());
        if !config.headless {
            command.stderr(Stdio::null());
        }
    }
    let fds = plan.fds.clone();
    // SAFETY: the hook only calls fcntl, which is async-signal-safe.
    unsafe {
        command.pre_exec(move || inherit(&fds));
    }
    command
        .spawn()
        .with_context(|| format!("spawning {}", plan.role))
}

/// Kills and reaps children spawned before a failure.
fn stop_children(children: &mut [(Role, Child)]) {
    for (role, child) in children.iter_mut() {
        warn!(%role, pid = child.id(), "Stopping already spawned child");
        if let Err(e) = child.kill() {
            debug!(%role, "Kill failed: {}", e);
        }
        if let Err(e) = child.wait() {
            warn!(%role, "Could not reap child: {}", e);
        }
    }
}

/// Runs one full session and waits for every child.
pub fn run(config: &RunConfig) -> Result<RunSummary> {
    let registry = FileRegistry::new(&config.registry);
    registry.reset().context("resetting the registry")?;
    info!(registry = %config.registry.display(), seed = config.seed, "Registry reset");

    if config.headless {
        // Ctrl-C reaches the whole foreground group. Children inherit the
        // ignored disposition; only the coordinator installs a handler and
        // turns it into an orderly quit.
        // SAFETY: signal(2) with SIG_IGN installs no Rust handler.
        unsafe {
            libc::signal(libc::SIGINT, libc::SIG_IGN);
        }
    }

    let wiring = Wiring::new()?;
    let plans = wiring.plans(config);

    let mut children: Vec<(Role, Child)> = Vec::new();
    for plan in &plans {
        match spawn(config, plan) {
            Ok(child) => {
                info!(role = %plan.role, pid = child.id(), "Spawned");
                children.push((plan.role, child));
            }
            Err(e) => {
                error!(role = %plan.role, "Spawn failed: {:#}", e);
                stop_children(&mut children);
                return Err(e);
            }
        }
    }
    // Children hold their own ends now.
    drop(wiring);

    let mut exits = Vec::new();
    for (role, mut child) in children {
        let pid = Pid(child.id());
        let status: ExitStatus = child.wait().with_context(|| format!("waiting for {}", role))?;
        if status.success() {
            info!(%role, %pid, "Exited");
        } else {
            warn!(%role, %pid, %status, "Exited abnormally");
        }
        exits.push(ChildExit {
            role,
            pid: pid.as_raw(),
            code: status.code(),
            success: status.success(),
        });
    }

    Ok(RunSummary {
        seed: config.seed,
        children: exits,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(headless: bool) -> RunConfig {
        RunConfig {
            program: PathBuf::from("/bin/true"),
            registry: PathBuf::from("registry.txt"),
            log_dir: PathBuf::from("logs"),
            seed: 9,
            verbose: false,
            headless,
            probe_timeout: None,
        }
    }

    fn value_after<'a>(args: &'a [String], flag: &str) -> Vec<&'a str> {
        args.windows(2)
            .filter(|w| w[0] == flag)
            .map(|w| w[1].as_str())
            .collect()
    }

    #[test]
    fn test_supervisor_first_and_every_role_planned() {
        let wiring = Wiring::new().unwrap();
        let plans = wiring.plans(&config(false));
        let roles: Vec<Role> = plans.iter().map(|p| p.role).collect();
        assert_eq!(roles[0], Role::Supervisor);
        assert_eq!(roles[1], Role::Coordinator);
        assert_eq!(plans.len(), 5);
        for role in DEPENDENTS {
            assert!(roles.contains(&role));
        }
    }

    #[test]
    fn test_each_child_inherits_only_its_named_handles() {
        let wiring = Wiring::new().unwrap();
        for plan in wiring.plans(&config(false)) {
            let mut named: Vec<RawFd> = Vec::new();
            for flag in ["--rx", "--tx", "--heartbeat-rx", "--heartbeat-tx", "--exit-rx", "--supervisor-tx"] {
                named.extend(value_after(&plan.args, flag).iter().map(|v| v.parse::<RawFd>().unwrap()));
            }
            for flag in ["--link", "--control"] {
                for value in value_after(&plan.args, flag) {
                    let spec: LinkSpec = value.parse().unwrap();
                    named.extend(spec.fds().map(|fd| fd.as_raw()));
                }
            }
            named.sort_unstable();
            let mut inherited = plan.fds.clone();
            inherited.sort_unstable();
            assert_eq!(named, inherited, "{} inherits unexpected handles", plan.role);
        }
    }

    #[test]
    fn test_pipe_ends_pair_up() {
        let wiring = Wiring::new().unwrap();
        let plans = wiring.plans(&config(false));
        let coordinator = plans.iter().find(|p| p.role == Role::Coordinator).unwrap();
        let physics = plans.iter().find(|p| p.role == Role::Physics).unwrap();

        let link: LinkSpec = value_after(&coordinator.args, "--link")
            .into_iter()
            .map(|v| v.parse::<LinkSpec>().unwrap())
            .find(|spec| spec.role == Role::Physics)
            .unwrap();
        let physics_rx: RawFd = value_after(&physics.args, "--rx")[0].parse().unwrap();
        let physics_tx: RawFd = value_after(&physics.args, "--tx")[0].parse().unwrap();

        let (to_physics, from_physics) = &wiring.data[&Role::Physics];
        assert_eq!(link.tx.unwrap().as_raw(), to_physics.write_fd().as_raw());
        assert_eq!(physics_rx, to_physics.read_fd().as_raw());
        assert_eq!(link.rx.unwrap().as_raw(), from_physics.read_fd().as_raw());
        assert_eq!(physics_tx, from_physics.write_fd().as_raw());
    }

    #[test]
    fn test_headless_reaches_coordinator_and_logs_to_stderr() {
        let wiring = Wiring::new().unwrap();
        for plan in wiring.plans(&config(true)) {
            assert!(plan.args.contains(&"--log-stderr".to_string()));
            assert_eq!(plan.args.contains(&"--headless".to_string()), plan.role == Role::Coordinator);
        }
    }

    #[test]
    fn test_summary_flags_failures() {
        let summary = RunSummary {
            seed: 1,
            children: vec![
                ChildExit { role: Role::Supervisor, pid: 10, code: Some(0), success: true },
                ChildExit { role: Role::Physics, pid: 11, code: None, success: false },
            ],
        };
        assert!(!summary.all_succeeded());
    }

    #[test]
    fn test_stopped_children_are_reaped() {
        let mut children: Vec<(Role, Child)> = (0..2)
            .map(|_| (Role::Physics, Command::new("sleep").arg("30").spawn().unwrap()))
            .collect();
        stop_children(&mut children);
        for (_, child) in &mut children {
            // Already waited on: the status is cached, no zombie left behind.
            let status = child.try_wait().unwrap().expect("child reaped");
            assert!(!status.success());
        }
    }
}
