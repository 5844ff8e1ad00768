//! Test-case execution engine.
//!
//! Drives one case end to end: condition gating, sandbox creation, lazy
//! process launch with readiness confirmation, strictly sequential run
//! execution, gold comparison, and supervised teardown.

use crate::error::HarnessError;
use crate::gate::{self, FeatureSet, Gate};
use crate::gold;
use crate::probe::{Delay, FileExists, LogPattern, PollPolicy, PortOpen, Probe};
use crate::schema::{
    CaseSpec, OutputMatch, OutputMatchStructured, ProbeSpec, ProcessSpec, RunSpec, SuiteConfig,
};
use crate::supervisor::{allocate_port, ProcessState, Supervisor};
use crate::vars::VarTable;
use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::time::{Duration, Instant};
use tracing::{debug, info};

/// Default timeout per run in seconds.
const DEFAULT_RUN_TIMEOUT_SECS: u64 = 30;

/// Result of running one case file.
#[derive(Debug, serde::Serialize)]
pub struct CaseResult {
    pub name: String,
    /// Present when the case was intentionally skipped; the reason is
    /// reported, distinct from failure.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub skipped: Option<String>,
    pub runs: Vec<RunResult>,
    pub comparisons: Vec<GoldResult>,
    #[serde(serialize_with = "serialize_duration")]
    pub duration: Duration,
}

impl CaseResult {
    /// The overall verdict: the AND of all run verdicts and comparisons.
    /// A skipped case is not a failure.
    pub fn passed(&self) -> bool {
        self.runs
            .iter()
            .all(|r| matches!(r.verdict, RunVerdict::Passed | RunVerdict::Skipped))
            && self.comparisons.iter().all(|c| c.passed)
    }

    fn skipped(name: &str, reason: String, start: Instant) -> Self {
        Self {
            name: name.to_string(),
            skipped: Some(reason),
            runs: vec![],
            comparisons: vec![],
            duration: start.elapsed(),
        }
    }

    /// A case that failed before any run could start (sandbox setup,
    /// malformed condition). Reported as a synthetic failed run.
    fn aborted(name: &str, run_name: &str, failure: Failure, start: Instant) -> Self {
        Self {
            name: name.to_string(),
            skipped: None,
            runs: vec![RunResult {
                name: run_name.to_string(),
                verdict: RunVerdict::Failed,
                reason: None,
                duration: Duration::ZERO,
                failures: vec![failure],
            }],
            comparisons: vec![],
            duration: start.elapsed(),
        }
    }
}

/// Verdict for a single run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunVerdict {
    Passed,
    Failed,
    /// Excluded by its condition gate; never executed, not a failure.
    Skipped,
    /// Never executed because an earlier failure aborted the case.
    NotRun,
}

/// Result of a single run.
#[derive(Debug, serde::Serialize)]
pub struct RunResult {
    pub name: String,
    pub verdict: RunVerdict,
    /// Why the run was skipped or not run.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(serialize_with = "serialize_duration")]
    pub duration: Duration,
    pub failures: Vec<Failure>,
}

/// One recorded failure, tagged with its kind so reports can name it.
#[derive(Debug, Clone, serde::Serialize)]
pub struct Failure {
    pub kind: FailureKind,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub enum FailureKind {
    /// A process could not start. Fatal to the case.
    LaunchFailure,
    /// A dependency never became ready. Fatal to dependent runs only.
    ReadinessTimeout,
    /// Exit code differed from the expectation. Recoverable.
    RunExitMismatch,
    /// The run's subprocess hung. Forces case teardown.
    ProcessTimeout,
    /// Stdout/stderr did not match. Recoverable.
    OutputMismatch,
    /// A process declared `still_running` had exited. Recoverable.
    ProcessExited,
    /// Gold diff found. Recoverable.
    ComparisonMismatch,
    /// Malformed predicate or invalid spec reference. Surfaced before any
    /// process launches.
    ConditionError,
    /// A variable reference could not be resolved.
    VariableError,
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            FailureKind::LaunchFailure => "LaunchFailure",
            FailureKind::ReadinessTimeout => "ReadinessTimeout",
            FailureKind::RunExitMismatch => "RunExitMismatch",
            FailureKind::ProcessTimeout => "ProcessTimeout",
            FailureKind::OutputMismatch => "OutputMismatch",
            FailureKind::ProcessExited => "ProcessExited",
            FailureKind::ComparisonMismatch => "ComparisonMismatch",
            FailureKind::ConditionError => "ConditionError",
            FailureKind::VariableError => "VariableError",
        };
        f.write_str(name)
    }
}

/// Result of one gold comparison.
#[derive(Debug, serde::Serialize)]
pub struct GoldResult {
    /// Artifact path as declared in the case.
    pub file: String,
    /// The gold reference that applied after conditional selection.
    pub gold: String,
    pub passed: bool,
    /// Rendered diff or read error when the comparison failed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

fn serialize_duration<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
where
    S: serde::Serializer,
{
    serializer.serialize_f64(duration.as_secs_f64())
}

/// Effective configuration for running a case, combining suite settings.
#[derive(Debug, Clone, Default)]
pub struct EffectiveConfig {
    pub run_timeout: Option<u64>,
    pub ready_timeout: Option<u64>,
    pub poll_interval_ms: Option<u64>,
    pub suite_env: HashMap<String, String>,
    pub inherit_env: Option<bool>,
}

impl EffectiveConfig {
    pub fn from_suite(suite: Option<&SuiteConfig>) -> Self {
        match suite {
            Some(cfg) => Self {
                run_timeout: cfg.timeout,
                ready_timeout: cfg.ready_timeout,
                poll_interval_ms: cfg.poll_interval_ms,
                suite_env: cfg.env.clone(),
                inherit_env: cfg.inherit_env,
            },
            None => Self::default(),
        }
    }
}

/// Sandbox for one case: working directory, environment, temp-dir keepalive.
struct CaseContext {
    dir: PathBuf,
    env: HashMap<String, String>,
    inherit_env: bool,
    _temp_dir: Option<tempfile::TempDir>,
}

impl CaseContext {
    fn new(
        spec: &CaseSpec,
        effective: &EffectiveConfig,
        sandbox_base: Option<&Path>,
    ) -> std::io::Result<Self> {
        let (dir, temp_dir) = match sandbox_base {
            Some(base) => {
                let dir = base.join(&spec.name);
                std::fs::create_dir_all(&dir)?;
                (dir, None)
            }
            None => {
                let temp = tempfile::tempdir()?;
                let dir = temp.path().to_path_buf();
                (dir, Some(temp))
            }
        };

        // Suite env first, case env overrides.
        let mut env = effective.suite_env.clone();
        for (k, v) in &spec.env {
            env.insert(k.clone(), v.clone());
        }

        Ok(Self {
            dir,
            env,
            inherit_env: effective.inherit_env.unwrap_or(false),
            _temp_dir: temp_dir,
        })
    }

    fn resolve_path(&self, path: &str) -> PathBuf {
        let path = Path::new(path);
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.dir.join(path)
        }
    }
}

/// Run a single case.
///
/// `spec_dir` anchors gold-file paths; `sandbox_base`, when set, replaces
/// the default temp-dir sandbox. All gating and validation happens before
/// any process launches; teardown of every process is guaranteed on every
/// exit path.
pub fn run_case(
    spec: &CaseSpec,
    spec_dir: &Path,
    effective: &EffectiveConfig,
    features: &FeatureSet,
    sandbox_base: Option<&Path>,
) -> CaseResult {
    let start = Instant::now();

    // Conditions and process references are checked before anything starts.
    if let Err(e) = validate_spec(spec) {
        return CaseResult::aborted(
            &spec.name,
            "<validate>",
            Failure {
                kind: FailureKind::ConditionError,
                message: e.to_string(),
            },
            start,
        );
    }

    match gate::gate_case(spec, features) {
        Gate::Include => {}
        Gate::Skip(reason) => {
            info!(case = %spec.name, %reason, "skipped");
            return CaseResult::skipped(&spec.name, reason, start);
        }
    }

    let ctx = match CaseContext::new(spec, effective, sandbox_base) {
        Ok(ctx) => ctx,
        Err(e) => {
            return CaseResult::aborted(
                &spec.name,
                "<sandbox>",
                Failure {
                    kind: FailureKind::LaunchFailure,
                    message: format!("failed to create sandbox: {e}"),
                },
                start,
            );
        }
    };

    // Processes excluded by their condition gate simply don't exist for
    // this case.
    let processes: Vec<&ProcessSpec> = spec
        .processes
        .iter()
        .filter(|p| match &p.when {
            Some(cond) => gate::evaluate(cond, features).unwrap_or(false),
            None => true,
        })
        .collect();

    // Variable table: case dir, per-process dirs, allocated ports.
    let mut vars = VarTable::new();
    vars.insert("case.dir", ctx.dir.display().to_string());
    for process in &processes {
        let proc_dir = ctx.dir.join(&process.name);
        if let Err(e) = std::fs::create_dir_all(&proc_dir) {
            return CaseResult::aborted(
                &spec.name,
                "<sandbox>",
                Failure {
                    kind: FailureKind::LaunchFailure,
                    message: format!("failed to create process dir: {e}"),
                },
                start,
            );
        }
        vars.insert(
            format!("{}.dir", process.name),
            proc_dir.display().to_string(),
        );
        for port_name in &process.ports {
            match allocate_port() {
                Ok(port) => {
                    debug!(process = %process.name, port_name = %port_name, port, "allocated port");
                    vars.insert(format!("{}.{port_name}", process.name), port.to_string());
                }
                Err(e) => {
                    return CaseResult::aborted(
                        &spec.name,
                        "<sandbox>",
                        Failure {
                            kind: FailureKind::LaunchFailure,
                            message: format!("failed to allocate port: {e}"),
                        },
                        start,
                    );
                }
            }
        }
    }

    // Gold references are fixed now, before anything launches, so the
    // matrix is deterministic however the runs behave.
    let bindings: Vec<(&crate::schema::GoldBinding, String)> = spec
        .gold
        .iter()
        .map(|b| {
            let gold = gate::select_gold(b, features)
                .map(|g| g.to_string())
                .unwrap_or_else(|_| b.gold.clone());
            (b, gold)
        })
        .collect();

    let mut sup = Supervisor::new(&ctx.dir);
    for process in &processes {
        sup.register(&process.name);
    }

    let poll = PollPolicy {
        interval: Duration::from_millis(
            spec.poll_interval_ms
                .or(effective.poll_interval_ms)
                .unwrap_or(crate::probe::DEFAULT_POLL_INTERVAL.as_millis() as u64),
        ),
        timeout: Duration::from_secs(
            spec.ready_timeout
                .or(effective.ready_timeout)
                .unwrap_or(crate::probe::DEFAULT_READY_TIMEOUT.as_secs()),
        ),
    };

    let case_timeout = spec.timeout.or(effective.run_timeout);

    let mut results: Vec<RunResult> = Vec::with_capacity(spec.runs.len());
    let mut fatal: Option<String> = None;

    for run in &spec.runs {
        if let Some(reason) = &fatal {
            results.push(RunResult {
                name: run.name.clone(),
                verdict: RunVerdict::NotRun,
                reason: Some(reason.clone()),
                duration: Duration::ZERO,
                failures: vec![],
            });
            continue;
        }

        // Run-level gating was validated up front; exclusion is a skip,
        // never a failure.
        if let Some(cond) = &run.when
            && !gate::evaluate(cond, features).unwrap_or(false)
        {
            results.push(RunResult {
                name: run.name.clone(),
                verdict: RunVerdict::Skipped,
                reason: Some("condition not met".to_string()),
                duration: Duration::ZERO,
                failures: vec![],
            });
            continue;
        }

        let execution = execute_run(
            run,
            &ctx,
            &vars,
            &mut sup,
            &processes,
            case_timeout,
            poll,
        );

        if let Some(reason) = execution.fatal {
            fatal = Some(reason);
        } else if !spec.continue_on_fail && execution.result.verdict == RunVerdict::Failed {
            fatal = Some("earlier run failed and continue_on_fail is disabled".to_string());
        }
        results.push(execution.result);
    }

    // Artifacts are compared before teardown, while the sandbox is intact.
    let comparisons: Vec<GoldResult> = bindings
        .iter()
        .map(|(binding, gold_ref)| compare_binding(binding, gold_ref, spec_dir, &ctx, &vars))
        .collect();

    sup.stop_all();

    CaseResult {
        name: spec.name.clone(),
        skipped: None,
        runs: results,
        comparisons,
        duration: start.elapsed(),
    }
}

/// Pre-launch validation: condition trees and process references.
pub fn validate_spec(spec: &CaseSpec) -> Result<(), HarnessError> {
    gate::validate_case(spec)?;

    for run in &spec.runs {
        for name in run.requires.iter().chain(run.still_running.iter()) {
            if !spec.processes.iter().any(|p| &p.name == name) {
                return Err(HarnessError::Condition(format!(
                    "run '{}' references unknown process '{name}'",
                    run.name
                )));
            }
        }
    }
    Ok(())
}

struct RunExecution {
    result: RunResult,
    /// Set when the failure must abort the remaining case.
    fatal: Option<String>,
}

impl RunExecution {
    fn recoverable(result: RunResult) -> Self {
        Self {
            result,
            fatal: None,
        }
    }
}

fn execute_run(
    run: &RunSpec,
    ctx: &CaseContext,
    vars: &VarTable,
    sup: &mut Supervisor,
    processes: &[&ProcessSpec],
    case_timeout: Option<u64>,
    poll: PollPolicy,
) -> RunExecution {
    let start = Instant::now();
    let mut failures: Vec<Failure> = Vec::new();

    // The command never starts before every precondition is satisfied.
    for name in required_processes(run, processes) {
        if let Err(failure) = ensure_running(&name, sup, processes, ctx, vars, poll) {
            let is_fatal = failure.kind == FailureKind::LaunchFailure;
            let message = failure.message.clone();
            failures.push(failure);
            let result = RunResult {
                name: run.name.clone(),
                verdict: RunVerdict::Failed,
                reason: None,
                duration: start.elapsed(),
                failures,
            };
            return RunExecution {
                result,
                fatal: is_fatal.then_some(message),
            };
        }
    }

    let timeout = Duration::from_secs(
        run.timeout
            .or(case_timeout)
            .unwrap_or(DEFAULT_RUN_TIMEOUT_SECS),
    );

    match run_command(run, ctx, vars, timeout) {
        Ok(output) => {
            check_expectations(run, &output, &mut failures);
        }
        Err(CommandError::Timeout) => {
            failures.push(Failure {
                kind: FailureKind::ProcessTimeout,
                message: format!("run timed out after {}s", timeout.as_secs()),
            });
            let message = failures.last().map(|f| f.message.clone());
            return RunExecution {
                result: RunResult {
                    name: run.name.clone(),
                    verdict: RunVerdict::Failed,
                    reason: None,
                    duration: start.elapsed(),
                    failures,
                },
                fatal: message,
            };
        }
        Err(CommandError::Variable(message)) => {
            failures.push(Failure {
                kind: FailureKind::VariableError,
                message,
            });
        }
        Err(CommandError::Spawn(message)) => {
            failures.push(Failure {
                kind: FailureKind::LaunchFailure,
                message,
            });
        }
        Err(CommandError::Io(message)) => {
            failures.push(Failure {
                kind: FailureKind::LaunchFailure,
                message,
            });
        }
    }

    // Postconditions: only checked after the run's own subprocess exited.
    for name in &run.still_running {
        if !sup.is_running(name) {
            failures.push(Failure {
                kind: FailureKind::ProcessExited,
                message: format!("process '{name}' is no longer running"),
            });
        }
    }

    let verdict = if failures.is_empty() {
        RunVerdict::Passed
    } else {
        RunVerdict::Failed
    };
    RunExecution::recoverable(RunResult {
        name: run.name.clone(),
        verdict,
        reason: None,
        duration: start.elapsed(),
        failures,
    })
}

/// Preconditions for a run: declared `requires` plus every process whose
/// variables the command references, in stable order.
fn required_processes(run: &RunSpec, processes: &[&ProcessSpec]) -> Vec<String> {
    let mut names: Vec<String> = run.requires.clone();

    let mut templates: Vec<&str> = vec![run.cmd.as_str()];
    templates.extend(run.args.iter().map(String::as_str));
    templates.extend(run.env.values().map(String::as_str));

    for template in templates {
        for referenced in VarTable::referenced_processes(template) {
            let is_process = processes.iter().any(|p| p.name == referenced);
            if is_process && !names.contains(&referenced) {
                names.push(referenced);
            }
        }
    }
    names
}

/// Start a process on first demand and block until its probes confirm
/// readiness. Subsequent calls are cheap liveness checks.
fn ensure_running(
    name: &str,
    sup: &mut Supervisor,
    processes: &[&ProcessSpec],
    ctx: &CaseContext,
    vars: &VarTable,
    poll: PollPolicy,
) -> Result<(), Failure> {
    match sup.state(name) {
        Some(ProcessState::Running) => {
            if sup.is_running(name) {
                return Ok(());
            }
            return Err(Failure {
                kind: FailureKind::ProcessExited,
                message: format!("required process '{name}' exited"),
            });
        }
        Some(ProcessState::Failed) | Some(ProcessState::Stopped) => {
            return Err(Failure {
                kind: FailureKind::ReadinessTimeout,
                message: format!("required process '{name}' previously failed"),
            });
        }
        Some(ProcessState::Pending) | Some(ProcessState::Starting) | None => {}
    }

    let Some(spec) = processes.iter().find(|p| p.name == name) else {
        return Err(Failure {
            kind: FailureKind::ConditionError,
            message: format!("required process '{name}' is not included in this case"),
        });
    };

    if sup.state(name) == Some(ProcessState::Pending) {
        let cmd = match build_command(
            &spec.cmd, &spec.args, spec.shell, &spec.env, ctx, vars,
        ) {
            Ok(cmd) => cmd,
            Err(e) => {
                return Err(Failure {
                    kind: FailureKind::VariableError,
                    message: e,
                });
            }
        };
        if let Err(e) = sup.launch(name, cmd) {
            return Err(Failure {
                kind: FailureKind::LaunchFailure,
                message: e.to_string(),
            });
        }
    }

    let probes = match build_probes(&spec.ready, ctx, vars) {
        Ok(probes) => probes,
        Err(e) => {
            return Err(Failure {
                kind: FailureKind::VariableError,
                message: e,
            });
        }
    };

    let policy = match spec.ready_timeout {
        Some(secs) => PollPolicy {
            timeout: Duration::from_secs(secs),
            ..poll
        },
        None => poll,
    };

    // Point diagnostics at the captured output, which survives teardown
    // when a sandbox dir is configured.
    let stderr_log = sup
        .stderr_log(name)
        .map(|p| p.display().to_string())
        .unwrap_or_default();

    sup.await_ready(name, &probes, policy).map_err(|e| {
        let kind = match e {
            HarnessError::Launch { .. } => FailureKind::LaunchFailure,
            _ => FailureKind::ReadinessTimeout,
        };
        Failure {
            kind,
            message: format!("{e} (stderr log: {stderr_log})"),
        }
    })
}

/// Materialize probe declarations, resolving variable references.
fn build_probes(
    specs: &[ProbeSpec],
    ctx: &CaseContext,
    vars: &VarTable,
) -> Result<Vec<Box<dyn Probe>>, String> {
    let mut probes: Vec<Box<dyn Probe>> = Vec::new();

    for spec in specs {
        if let Some(target) = &spec.port_open {
            let resolved = vars.resolve(target)?;
            let (host, port) = match resolved.rsplit_once(':') {
                Some((host, port)) => (host.to_string(), port.to_string()),
                None => ("127.0.0.1".to_string(), resolved),
            };
            let port: u16 = port
                .parse()
                .map_err(|_| format!("invalid port in port_open probe: {port:?}"))?;
            probes.push(Box::new(PortOpen { host, port }));
        }

        if let Some(path) = &spec.file_exists {
            let resolved = vars.resolve(path)?;
            probes.push(Box::new(FileExists {
                path: ctx.resolve_path(&resolved),
            }));
        }

        if let Some(lp) = &spec.log_pattern {
            let path = vars.resolve(&lp.path)?;
            let pattern = regex::Regex::new(&lp.pattern)
                .map_err(|e| format!("invalid log_pattern regex {:?}: {e}", lp.pattern))?;
            probes.push(Box::new(LogPattern {
                path: ctx.resolve_path(&path),
                pattern,
            }));
        }

        if let Some(ms) = spec.delay_ms {
            probes.push(Box::new(Delay {
                duration: Duration::from_millis(ms),
            }));
        }
    }

    Ok(probes)
}

struct CommandOutput {
    /// Exit code if the process exited normally.
    exit_code: Option<i32>,
    stdout: String,
    stderr: String,
}

enum CommandError {
    Variable(String),
    Spawn(String),
    Timeout,
    Io(String),
}

fn build_command(
    cmd: &str,
    args: &[String],
    shell: bool,
    extra_env: &HashMap<String, String>,
    ctx: &CaseContext,
    vars: &VarTable,
) -> Result<Command, String> {
    let cmd = vars.resolve(cmd)?;
    let args = vars.resolve_all(args)?;

    let mut command = if shell {
        let mut c = Command::new("sh");
        c.arg("-c");
        c.arg(format!("{} {}", cmd, args.join(" ")));
        c
    } else {
        let mut c = Command::new(&cmd);
        c.args(&args);
        c
    };

    command.current_dir(&ctx.dir);

    if !ctx.inherit_env {
        command.env_clear();
    }
    for (k, v) in &ctx.env {
        command.env(k, vars.resolve(v)?);
    }
    for (k, v) in extra_env {
        command.env(k, vars.resolve(v)?);
    }

    Ok(command)
}

fn run_command(
    run: &RunSpec,
    ctx: &CaseContext,
    vars: &VarTable,
    timeout: Duration,
) -> Result<CommandOutput, CommandError> {
    let mut cmd = build_command(&run.cmd, &run.args, run.shell, &run.env, ctx, vars)
        .map_err(CommandError::Variable)?;

    if run.stdin.is_some() {
        cmd.stdin(Stdio::piped());
    } else {
        cmd.stdin(Stdio::null());
    }
    cmd.stdout(Stdio::piped());
    cmd.stderr(Stdio::piped());

    let mut child = cmd
        .spawn()
        .map_err(|e| CommandError::Spawn(format!("failed to spawn: {e}")))?;

    if let Some(stdin_data) = &run.stdin
        && let Some(mut stdin) = child.stdin.take()
    {
        stdin
            .write_all(stdin_data.as_bytes())
            .map_err(|e| CommandError::Io(format!("failed to write stdin: {e}")))?;
    }

    // Wait with timeout; a hang becomes a timeout failure, never a stuck
    // harness.
    let start = Instant::now();
    loop {
        match child.try_wait() {
            Ok(Some(status)) => {
                let output = child
                    .wait_with_output()
                    .map_err(|e| CommandError::Io(format!("failed to read output: {e}")))?;
                return Ok(CommandOutput {
                    exit_code: status.code(),
                    stdout: String::from_utf8_lossy(&output.stdout).to_string(),
                    stderr: String::from_utf8_lossy(&output.stderr).to_string(),
                });
            }
            Ok(None) => {
                if start.elapsed() > timeout {
                    let _ = child.kill();
                    let _ = child.wait();
                    return Err(CommandError::Timeout);
                }
                std::thread::sleep(Duration::from_millis(10));
            }
            Err(e) => return Err(CommandError::Io(format!("failed to wait: {e}"))),
        }
    }
}

fn check_expectations(run: &RunSpec, output: &CommandOutput, failures: &mut Vec<Failure>) {
    let expected_exit = run.exit.unwrap_or(0);
    match output.exit_code {
        Some(actual) => {
            if actual != expected_exit {
                failures.push(Failure {
                    kind: FailureKind::RunExitMismatch,
                    message: format!("exit code: expected {expected_exit}, got {actual}"),
                });
            }
        }
        None => {
            failures.push(Failure {
                kind: FailureKind::RunExitMismatch,
                message: format!(
                    "exit code: expected {expected_exit}, but process was terminated by a signal"
                ),
            });
        }
    }

    if let Some(matcher) = &run.stdout
        && let Err(message) = check_output_match("stdout", &output.stdout, matcher)
    {
        failures.push(Failure {
            kind: FailureKind::OutputMismatch,
            message,
        });
    }

    if let Some(matcher) = &run.stderr
        && let Err(message) = check_output_match("stderr", &output.stderr, matcher)
    {
        failures.push(Failure {
            kind: FailureKind::OutputMismatch,
            message,
        });
    }
}

fn check_output_match(name: &str, actual: &str, matcher: &OutputMatch) -> Result<(), String> {
    match matcher {
        OutputMatch::Exact(expected) => {
            if actual != expected {
                Err(format!(
                    "{name}: expected exact match\n  expected: {expected:?}\n  got: {actual:?}"
                ))
            } else {
                Ok(())
            }
        }
        OutputMatch::Structured(s) => check_structured_match(name, actual, s),
    }
}

fn check_structured_match(
    name: &str,
    actual: &str,
    matcher: &OutputMatchStructured,
) -> Result<(), String> {
    if let Some(expected) = &matcher.equals
        && actual != expected
    {
        return Err(format!(
            "{name}: expected exact match\n  expected: {expected:?}\n  got: {actual:?}"
        ));
    }

    if let Some(substring) = &matcher.contains
        && !actual.contains(substring)
    {
        return Err(format!(
            "{name}: expected to contain {substring:?}\n  got: {actual:?}"
        ));
    }

    if let Some(pattern) = &matcher.regex {
        let re = regex::Regex::new(pattern)
            .map_err(|e| format!("{name}: invalid regex {pattern:?}: {e}"))?;
        if !re.is_match(actual) {
            return Err(format!(
                "{name}: expected to match regex {pattern:?}\n  got: {actual:?}"
            ));
        }
    }

    Ok(())
}

fn compare_binding(
    binding: &crate::schema::GoldBinding,
    gold_ref: &str,
    spec_dir: &Path,
    ctx: &CaseContext,
    vars: &VarTable,
) -> GoldResult {
    let mut result = GoldResult {
        file: binding.file.clone(),
        gold: gold_ref.to_string(),
        passed: false,
        detail: None,
    };

    let artifact_path = match vars.resolve(&binding.file) {
        Ok(p) => ctx.resolve_path(&p),
        Err(e) => {
            result.detail = Some(e);
            return result;
        }
    };

    let gold_path = spec_dir.join(gold_ref);
    let gold_content = match std::fs::read_to_string(&gold_path) {
        Ok(c) => c,
        Err(e) => {
            result.detail = Some(format!(
                "failed to read gold file {}: {e}",
                gold_path.display()
            ));
            return result;
        }
    };

    let actual_content = match std::fs::read_to_string(&artifact_path) {
        Ok(c) => c,
        Err(e) => {
            result.detail = Some(format!(
                "artifact {} was not produced: {e}",
                artifact_path.display()
            ));
            return result;
        }
    };

    match gold::compare(&gold_content, &actual_content, &binding.normalize) {
        Ok(diff) if diff.is_match() => {
            result.passed = true;
        }
        Ok(diff) => {
            result.detail = Some(diff.to_string());
        }
        Err(e) => {
            result.detail = Some(e);
        }
    }
    result
}
