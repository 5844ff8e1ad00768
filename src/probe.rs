//! Readiness probes.
//!
//! A probe is a predicate polled until it reports ready. Dependent test
//! runs block on the conjunction of a process's probes before executing.
//! Polling is an explicit bounded loop with a fixed interval and a global
//! timeout, so behavior stays deterministic and testable.

use regex::Regex;
use std::net::{TcpStream, ToSocketAddrs};
use std::path::PathBuf;
use std::time::{Duration, Instant};

/// Default polling interval between probe checks.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(25);

/// Default global readiness timeout.
pub const DEFAULT_READY_TIMEOUT: Duration = Duration::from_secs(30);

/// How long a single TCP connect attempt may block.
const CONNECT_TIMEOUT: Duration = Duration::from_millis(250);

/// A readiness predicate.
///
/// `ready` takes the elapsed time since polling started so time-based
/// probes stay pure; tests drive it with synthetic elapsed values instead
/// of a real clock.
pub trait Probe {
    /// Human-readable description, used in timeout diagnostics.
    fn describe(&self) -> String;

    /// Check the predicate once. IO errors count as not ready.
    fn ready(&self, elapsed: Duration) -> bool;
}

/// Ready when a TCP connect to `host:port` succeeds.
pub struct PortOpen {
    pub host: String,
    pub port: u16,
}

impl Probe for PortOpen {
    fn describe(&self) -> String {
        format!("port-open {}:{}", self.host, self.port)
    }

    fn ready(&self, _elapsed: Duration) -> bool {
        let mut addrs = match (self.host.as_str(), self.port).to_socket_addrs() {
            Ok(addrs) => addrs,
            Err(_) => return false,
        };
        addrs.any(|addr| TcpStream::connect_timeout(&addr, CONNECT_TIMEOUT).is_ok())
    }
}

/// Ready when the file exists.
pub struct FileExists {
    pub path: PathBuf,
}

impl Probe for FileExists {
    fn describe(&self) -> String {
        format!("file-exists {}", self.path.display())
    }

    fn ready(&self, _elapsed: Duration) -> bool {
        self.path.exists()
    }
}

/// Ready when the pattern appears in the (growing) log file.
pub struct LogPattern {
    pub path: PathBuf,
    pub pattern: Regex,
}

impl Probe for LogPattern {
    fn describe(&self) -> String {
        format!("log-pattern {:?} in {}", self.pattern.as_str(), self.path.display())
    }

    fn ready(&self, _elapsed: Duration) -> bool {
        match std::fs::read_to_string(&self.path) {
            Ok(contents) => self.pattern.is_match(&contents),
            Err(_) => false,
        }
    }
}

/// Ready unconditionally once the elapsed time passes the delay.
pub struct Delay {
    pub duration: Duration,
}

impl Probe for Delay {
    fn describe(&self) -> String {
        format!("delay {:?}", self.duration)
    }

    fn ready(&self, elapsed: Duration) -> bool {
        elapsed >= self.duration
    }
}

/// Polling parameters for a readiness wait.
#[derive(Debug, Clone, Copy)]
pub struct PollPolicy {
    pub interval: Duration,
    pub timeout: Duration,
}

impl Default for PollPolicy {
    fn default() -> Self {
        Self {
            interval: DEFAULT_POLL_INTERVAL,
            timeout: DEFAULT_READY_TIMEOUT,
        }
    }
}

/// The first probe in the conjunction that is not yet satisfied.
pub fn first_unmet(probes: &[Box<dyn Probe>], elapsed: Duration) -> Option<usize> {
    probes.iter().position(|p| !p.ready(elapsed))
}

/// Block until every probe is satisfied or the timeout elapses.
///
/// On timeout, returns the description of the probe that never succeeded.
/// The supervisor interleaves this loop with process liveness checks; this
/// standalone form waits on probes with no owning process.
#[cfg_attr(not(test), allow(dead_code))]
pub fn wait_until_ready(probes: &[Box<dyn Probe>], policy: PollPolicy) -> Result<(), String> {
    let start = Instant::now();
    loop {
        let elapsed = start.elapsed();
        match first_unmet(probes, elapsed) {
            None => return Ok(()),
            Some(idx) => {
                if elapsed >= policy.timeout {
                    return Err(probes[idx].describe());
                }
                std::thread::sleep(policy.interval);
            }
        }
    }
}
