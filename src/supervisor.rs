//! Process supervision.
//!
//! A supervisor owns every long-lived process of one test case: launch,
//! readiness confirmation, liveness checks, and teardown. There is no
//! process-wide registry; each case constructs its own supervisor, so
//! concurrent cases cannot contaminate each other.
//!
//! Process output always goes to per-process log files in the sandbox,
//! whatever the outcome, so failures can be diagnosed post-mortem.

use crate::error::HarnessError;
use crate::probe::{self, PollPolicy, Probe};
use std::collections::HashMap;
use std::fs::File;
use std::net::TcpListener;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// How long a stopped process gets to exit gracefully before SIGKILL.
pub const DEFAULT_GRACE: Duration = Duration::from_secs(3);

/// Interval between liveness polls while stopping or awaiting readiness.
const REAP_POLL_INTERVAL: Duration = Duration::from_millis(25);

/// Lifecycle state of a supervised process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    /// Registered, not yet launched.
    Pending,
    /// Spawned, readiness not yet confirmed.
    Starting,
    /// Spawned and all readiness probes satisfied.
    Running,
    /// Exited or terminated.
    Stopped,
    /// Launch or readiness failed.
    Failed,
}

struct Supervised {
    name: String,
    child: Option<Child>,
    state: ProcessState,
    stdout_log: PathBuf,
    stderr_log: PathBuf,
}

/// Owner of one case's process set.
pub struct Supervisor {
    sandbox: PathBuf,
    procs: Vec<Supervised>,
    index: HashMap<String, usize>,
    /// Indices into `procs` in launch order; teardown walks it in reverse.
    start_seq: Vec<usize>,
    grace: Duration,
}

impl Supervisor {
    pub fn new(sandbox: &Path) -> Self {
        Self {
            sandbox: sandbox.to_path_buf(),
            procs: Vec::new(),
            index: HashMap::new(),
            start_seq: Vec::new(),
            grace: DEFAULT_GRACE,
        }
    }

    #[cfg_attr(not(test), allow(dead_code))]
    pub fn with_grace(mut self, grace: Duration) -> Self {
        self.grace = grace;
        self
    }

    /// Register a process name ahead of launch. Idempotent.
    pub fn register(&mut self, name: &str) {
        if self.index.contains_key(name) {
            return;
        }
        let supervised = Supervised {
            name: name.to_string(),
            child: None,
            state: ProcessState::Pending,
            stdout_log: self.sandbox.join(format!("{name}.stdout.log")),
            stderr_log: self.sandbox.join(format!("{name}.stderr.log")),
        };
        self.index.insert(name.to_string(), self.procs.len());
        self.procs.push(supervised);
    }

    pub fn state(&self, name: &str) -> Option<ProcessState> {
        self.index.get(name).map(|&i| self.procs[i].state)
    }

    #[cfg_attr(not(test), allow(dead_code))]
    pub fn stdout_log(&self, name: &str) -> Option<&Path> {
        self.index
            .get(name)
            .map(|&i| self.procs[i].stdout_log.as_path())
    }

    pub fn stderr_log(&self, name: &str) -> Option<&Path> {
        self.index
            .get(name)
            .map(|&i| self.procs[i].stderr_log.as_path())
    }

    /// Spawn a registered process. Non-blocking: returns as soon as the OS
    /// process exists, before any readiness confirmation.
    pub fn launch(&mut self, name: &str, mut cmd: Command) -> Result<(), HarnessError> {
        let idx = *self
            .index
            .get(name)
            .ok_or_else(|| HarnessError::Launch {
                name: name.to_string(),
                source: std::io::Error::other("process not registered"),
            })?;
        let proc = &mut self.procs[idx];

        if proc.state != ProcessState::Pending {
            return Ok(());
        }

        let stdout = File::create(&proc.stdout_log).map_err(HarnessError::Sandbox)?;
        let stderr = File::create(&proc.stderr_log).map_err(HarnessError::Sandbox)?;
        cmd.stdin(Stdio::null())
            .stdout(Stdio::from(stdout))
            .stderr(Stdio::from(stderr));

        match cmd.spawn() {
            Ok(child) => {
                debug!(process = name, pid = child.id(), "launched");
                proc.child = Some(child);
                proc.state = ProcessState::Starting;
                self.start_seq.push(idx);
                Ok(())
            }
            Err(e) => {
                proc.state = ProcessState::Failed;
                Err(HarnessError::Launch {
                    name: name.to_string(),
                    source: e,
                })
            }
        }
    }

    /// Block until every probe is satisfied, then mark the process Running.
    ///
    /// Only the calling run blocks; other supervised processes keep going.
    /// A process that exits while starting fails as a launch failure; a
    /// probe that never succeeds fails as a readiness timeout naming it.
    pub fn await_ready(
        &mut self,
        name: &str,
        probes: &[Box<dyn Probe>],
        policy: PollPolicy,
    ) -> Result<(), HarnessError> {
        let idx = match self.index.get(name) {
            Some(&i) => i,
            None => {
                return Err(HarnessError::ReadinessTimeout {
                    process: name.to_string(),
                    probe: "process not registered".to_string(),
                    timeout: Duration::ZERO,
                });
            }
        };

        if self.procs[idx].state == ProcessState::Running {
            return Ok(());
        }

        let start = Instant::now();
        loop {
            let elapsed = start.elapsed();
            let proc = &mut self.procs[idx];

            // A crash during startup is a launch failure, not a slow probe.
            if let Some(child) = proc.child.as_mut()
                && let Ok(Some(status)) = child.try_wait()
            {
                proc.state = ProcessState::Failed;
                return Err(HarnessError::Launch {
                    name: name.to_string(),
                    source: std::io::Error::other(format!("exited during startup: {status}")),
                });
            }

            match probe::first_unmet(probes, elapsed) {
                None => {
                    proc.state = ProcessState::Running;
                    debug!(process = name, elapsed = ?elapsed, "ready");
                    return Ok(());
                }
                Some(unmet) => {
                    if elapsed >= policy.timeout {
                        proc.state = ProcessState::Failed;
                        return Err(HarnessError::ReadinessTimeout {
                            process: name.to_string(),
                            probe: probes[unmet].describe(),
                            timeout: policy.timeout,
                        });
                    }
                    std::thread::sleep(policy.interval);
                }
            }
        }
    }

    /// Whether the process is alive right now.
    pub fn is_running(&mut self, name: &str) -> bool {
        let Some(&idx) = self.index.get(name) else {
            return false;
        };
        let proc = &mut self.procs[idx];
        match proc.child.as_mut() {
            Some(child) => match child.try_wait() {
                Ok(Some(_)) => {
                    proc.state = ProcessState::Stopped;
                    proc.child = None;
                    false
                }
                Ok(None) => true,
                Err(_) => false,
            },
            None => false,
        }
    }

    /// Terminate every owned process in reverse launch order.
    ///
    /// Graceful termination first, SIGKILL for survivors after the grace
    /// period. Idempotent and infallible: safe after partial failure, safe
    /// to call twice, safe when a process already exited on its own.
    pub fn stop_all(&mut self) {
        for i in (0..self.start_seq.len()).rev() {
            let idx = self.start_seq[i];
            stop_one(&mut self.procs[idx], self.grace);
        }
    }
}

impl Drop for Supervisor {
    fn drop(&mut self) {
        self.stop_all();
    }
}

fn stop_one(proc: &mut Supervised, grace: Duration) {
    let Some(child) = proc.child.as_mut() else {
        return;
    };

    // Already exited on its own: just reap.
    if let Ok(Some(status)) = child.try_wait() {
        debug!(process = %proc.name, %status, "already exited");
        proc.state = ProcessState::Stopped;
        proc.child = None;
        return;
    }

    terminate(child);

    let deadline = Instant::now() + grace;
    while Instant::now() < deadline {
        if let Ok(Some(_)) = child.try_wait() {
            proc.state = ProcessState::Stopped;
            proc.child = None;
            return;
        }
        std::thread::sleep(REAP_POLL_INTERVAL);
    }

    warn!(process = %proc.name, "did not exit within grace period, killing");
    if let Err(e) = child.kill() {
        warn!(process = %proc.name, error = %e, "kill failed");
    }
    let _ = child.wait();
    proc.state = ProcessState::Stopped;
    proc.child = None;
}

#[cfg(unix)]
fn terminate(child: &mut Child) {
    // SIGTERM so the process can flush logs before exiting.
    unsafe {
        libc::kill(child.id() as libc::pid_t, libc::SIGTERM);
    }
}

#[cfg(not(unix))]
fn terminate(child: &mut Child) {
    let _ = child.kill();
}

/// Allocate a TCP port from the OS ephemeral range.
///
/// The listener is bound and immediately released; the port number is then
/// handed to the supervised process. Cases never hard-code ports, so
/// concurrently-running cases get distinct OS-assigned ports.
pub fn allocate_port() -> std::io::Result<u16> {
    let listener = TcpListener::bind("127.0.0.1:0")?;
    Ok(listener.local_addr()?.port())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::probe::{FileExists, PollPolicy};

    fn short_policy() -> PollPolicy {
        PollPolicy {
            interval: Duration::from_millis(10),
            timeout: Duration::from_millis(500),
        }
    }

    fn sh(script: &str) -> Command {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(script);
        cmd
    }

    #[test]
    fn launch_and_stop_long_lived_process() {
        let dir = tempfile::tempdir().unwrap();
        let mut sup = Supervisor::new(dir.path()).with_grace(Duration::from_secs(1));
        sup.register("sleeper");

        sup.launch("sleeper", sh("sleep 30")).unwrap();
        assert_eq!(sup.state("sleeper"), Some(ProcessState::Starting));
        assert!(sup.is_running("sleeper"));

        sup.stop_all();
        assert!(!sup.is_running("sleeper"));
        assert_eq!(sup.state("sleeper"), Some(ProcessState::Stopped));
    }

    #[test]
    fn stop_all_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let mut sup = Supervisor::new(dir.path()).with_grace(Duration::from_secs(1));
        sup.register("sleeper");
        sup.launch("sleeper", sh("sleep 30")).unwrap();

        sup.stop_all();
        sup.stop_all(); // second call must not raise or hang
        assert_eq!(sup.state("sleeper"), Some(ProcessState::Stopped));
    }

    #[test]
    fn stop_all_after_self_exit_reaps_quietly() {
        let dir = tempfile::tempdir().unwrap();
        let mut sup = Supervisor::new(dir.path()).with_grace(Duration::from_secs(1));
        sup.register("oneshot");
        sup.launch("oneshot", sh("true")).unwrap();

        // Give the process time to exit on its own.
        std::thread::sleep(Duration::from_millis(200));
        sup.stop_all();
        assert_eq!(sup.state("oneshot"), Some(ProcessState::Stopped));
    }

    #[test]
    fn teardown_runs_in_reverse_launch_order() {
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("order.log");
        let mut sup = Supervisor::new(dir.path()).with_grace(Duration::from_secs(5));

        let trap = |name: &str| {
            format!(
                "trap 'echo {name} >> {}; exit 0' TERM; while :; do sleep 0.05; done",
                log.display()
            )
        };
        sup.register("first");
        sup.register("second");
        sup.launch("first", sh(&trap("first"))).unwrap();
        sup.launch("second", sh(&trap("second"))).unwrap();

        // Let both shells install their traps.
        std::thread::sleep(Duration::from_millis(300));
        sup.stop_all();

        let contents = std::fs::read_to_string(&log).unwrap();
        let order: Vec<&str> = contents.lines().collect();
        assert_eq!(order, vec!["second", "first"]);
    }

    #[test]
    fn await_ready_confirms_probe_satisfaction() {
        let dir = tempfile::tempdir().unwrap();
        let marker = dir.path().join("ready.marker");
        let mut sup = Supervisor::new(dir.path()).with_grace(Duration::from_secs(1));
        sup.register("server");
        sup.launch(
            "server",
            sh(&format!("touch {}; exec sleep 30", marker.display())),
        )
        .unwrap();

        let probes: Vec<Box<dyn Probe>> = vec![Box::new(FileExists { path: marker })];
        sup.await_ready("server", &probes, short_policy()).unwrap();
        assert_eq!(sup.state("server"), Some(ProcessState::Running));

        sup.stop_all();
    }

    #[test]
    fn await_ready_times_out_naming_probe() {
        let dir = tempfile::tempdir().unwrap();
        let mut sup = Supervisor::new(dir.path()).with_grace(Duration::from_secs(1));
        sup.register("server");
        sup.launch("server", sh("sleep 30")).unwrap();

        let probes: Vec<Box<dyn Probe>> = vec![Box::new(FileExists {
            path: dir.path().join("never.marker"),
        })];
        let err = sup
            .await_ready("server", &probes, short_policy())
            .unwrap_err();
        match err {
            HarnessError::ReadinessTimeout { process, probe, .. } => {
                assert_eq!(process, "server");
                assert!(probe.contains("never.marker"), "got: {probe}");
            }
            other => panic!("expected readiness timeout, got {other}"),
        }
        assert_eq!(sup.state("server"), Some(ProcessState::Failed));

        sup.stop_all();
    }

    #[test]
    fn exit_during_startup_is_a_launch_failure() {
        let dir = tempfile::tempdir().unwrap();
        let mut sup = Supervisor::new(dir.path()).with_grace(Duration::from_secs(1));
        sup.register("flaky");
        sup.launch("flaky", sh("exit 3")).unwrap();

        let probes: Vec<Box<dyn Probe>> = vec![Box::new(FileExists {
            path: dir.path().join("never.marker"),
        })];
        let err = sup
            .await_ready("flaky", &probes, short_policy())
            .unwrap_err();
        assert!(matches!(err, HarnessError::Launch { .. }), "got: {err}");
    }

    #[test]
    fn spawn_failure_surfaces_as_launch_error() {
        let dir = tempfile::tempdir().unwrap();
        let mut sup = Supervisor::new(dir.path());
        sup.register("ghost");

        let err = sup
            .launch("ghost", Command::new("goldrun_no_such_binary_52341"))
            .unwrap_err();
        assert!(matches!(err, HarnessError::Launch { .. }));
        assert_eq!(sup.state("ghost"), Some(ProcessState::Failed));
    }

    #[test]
    fn output_is_captured_to_log_files() {
        let dir = tempfile::tempdir().unwrap();
        let mut sup = Supervisor::new(dir.path()).with_grace(Duration::from_secs(1));
        sup.register("noisy");
        sup.launch("noisy", sh("echo to-stdout; echo to-stderr >&2; sleep 30"))
            .unwrap();

        std::thread::sleep(Duration::from_millis(300));
        sup.stop_all();

        let stdout = std::fs::read_to_string(sup.stdout_log("noisy").unwrap()).unwrap();
        let stderr = std::fs::read_to_string(sup.stderr_log("noisy").unwrap()).unwrap();
        assert!(stdout.contains("to-stdout"));
        assert!(stderr.contains("to-stderr"));
    }

    #[test]
    fn allocated_ports_are_bindable_and_distinct() {
        let a = allocate_port().unwrap();
        let b = allocate_port().unwrap();
        assert_ne!(a, b);
        // The released port can be bound by the process it was handed to.
        TcpListener::bind(("127.0.0.1", a)).unwrap();
    }
}
