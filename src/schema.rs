//! Schema definitions for goldrun case files.
//!
//! This module defines the structure of test-case specification files.
//! Cases are written in YAML (or TOML) and validated against these types.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;

/// Suite-level configuration loaded from `goldrun.yaml` in the test root.
///
/// Provides defaults that apply to all case files in the suite, plus the
/// feature set condition gates evaluate against.
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
pub struct SuiteConfig {
    /// Schema version (must match crate major version).
    #[serde(default = "default_version")]
    pub version: u32,

    /// Features present in this environment (tool capabilities, build
    /// flags). Condition gates evaluate against this set; detection is the
    /// suite author's responsibility, not the harness's.
    #[serde(default)]
    pub features: Vec<String>,

    /// Default run timeout in seconds (can be overridden at case/run level).
    #[serde(default)]
    pub timeout: Option<u64>,

    /// Default readiness timeout in seconds.
    #[serde(default)]
    pub ready_timeout: Option<u64>,

    /// Probe polling interval in milliseconds.
    #[serde(default)]
    pub poll_interval_ms: Option<u64>,

    /// Default environment variables for all processes and runs.
    #[serde(default)]
    pub env: HashMap<String, String>,

    /// Whether to inherit environment from host by default.
    #[serde(default)]
    pub inherit_env: Option<bool>,

    /// Directory for case sandboxes. Use "local" for `.goldrun/<timestamp>/`,
    /// or specify a custom path. When not set, uses system temp (auto-deleted).
    #[serde(default)]
    pub sandbox_dir: Option<SandboxDir>,
}

fn default_version() -> u32 {
    1
}

fn default_true() -> bool {
    true
}

/// Directory configuration for case sandboxes.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(from = "String", into = "String")]
pub enum SandboxDir {
    /// Use `.goldrun/<timestamp>/` in the test root directory.
    Local,
    /// Use a specific path for sandboxes.
    Path(PathBuf),
}

impl From<String> for SandboxDir {
    fn from(s: String) -> Self {
        if s == "local" {
            SandboxDir::Local
        } else {
            SandboxDir::Path(PathBuf::from(s))
        }
    }
}

impl From<SandboxDir> for String {
    fn from(dir: SandboxDir) -> String {
        match dir {
            SandboxDir::Local => "local".to_string(),
            SandboxDir::Path(p) => p.display().to_string(),
        }
    }
}

/// Root document for a test-case specification file.
///
/// A case owns a process topology (long-lived supervised processes), an
/// ordered list of runs executed against it, and gold-file bindings checked
/// after the runs complete.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct CaseSpec {
    /// Schema version (must match crate major version).
    pub version: u32,

    /// Unique name for this case.
    pub name: String,

    /// Optional description.
    #[serde(default)]
    pub description: Option<String>,

    /// Features that must all be present, or the whole case is skipped.
    #[serde(default)]
    pub require_features: Vec<String>,

    /// Whether later runs execute after an earlier run fails (default: true).
    /// The overall verdict is the AND of all run verdicts either way.
    #[serde(default = "default_true")]
    pub continue_on_fail: bool,

    /// Default run timeout in seconds for this case.
    #[serde(default)]
    pub timeout: Option<u64>,

    /// Readiness timeout in seconds for this case's processes.
    #[serde(default)]
    pub ready_timeout: Option<u64>,

    /// Probe polling interval in milliseconds.
    #[serde(default)]
    pub poll_interval_ms: Option<u64>,

    /// Environment variables for all processes and runs in this case.
    #[serde(default)]
    pub env: HashMap<String, String>,

    /// Long-lived processes supervised for the duration of the case.
    #[serde(default)]
    pub processes: Vec<ProcessSpec>,

    /// The runs executed, in declaration order.
    pub runs: Vec<RunSpec>,

    /// Gold-file bindings checked after all runs complete.
    #[serde(default)]
    pub gold: Vec<GoldBinding>,
}

/// A long-lived process owned by the case's supervisor.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct ProcessSpec {
    /// Unique name; also the namespace for the variables it produces
    /// (`<name>.<port>`, `<name>.dir`).
    pub name: String,

    /// The command/binary to execute. May reference variables.
    pub cmd: String,

    /// Command arguments. May reference variables.
    #[serde(default)]
    pub args: Vec<String>,

    /// Run through shell (default: false).
    #[serde(default)]
    pub shell: bool,

    /// Additional environment variables for this process.
    #[serde(default)]
    pub env: HashMap<String, String>,

    /// Named TCP ports to allocate from the OS ephemeral range before
    /// launch. Each becomes a variable `<name>.<port-name>`.
    #[serde(default)]
    pub ports: Vec<String>,

    /// Readiness probes; the process counts as running only once all are
    /// satisfied.
    #[serde(default)]
    pub ready: Vec<ProbeSpec>,

    /// Readiness timeout in seconds (overrides case/suite default).
    #[serde(default)]
    pub ready_timeout: Option<u64>,

    /// Include this process only when the condition holds.
    #[serde(default)]
    pub when: Option<Condition>,
}

/// A readiness probe declaration.
///
/// Each probe is a single-key map where the key determines the kind.
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub struct ProbeSpec {
    /// TCP connect succeeds to `[host:]port`. May reference variables,
    /// e.g. `"${origin.http}"`.
    #[serde(default)]
    pub port_open: Option<String>,

    /// File exists (path relative to the case sandbox).
    #[serde(default)]
    pub file_exists: Option<String>,

    /// Pattern appears in a growing log file.
    #[serde(default)]
    pub log_pattern: Option<LogPatternSpec>,

    /// Unconditional fixed delay.
    #[serde(default)]
    pub delay_ms: Option<u64>,
}

/// A log-pattern probe: regex match against a file's contents.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct LogPatternSpec {
    /// Path to the log file (relative to the case sandbox).
    pub path: String,

    /// Regular expression to find.
    pub pattern: String,
}

/// One command execution with an expected outcome.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct RunSpec {
    /// Run name (used in reporting).
    pub name: String,

    /// The command/binary to execute. May reference variables.
    pub cmd: String,

    /// Command arguments. May reference variables.
    #[serde(default)]
    pub args: Vec<String>,

    /// Run through shell (default: false).
    #[serde(default)]
    pub shell: bool,

    /// Standard input to provide.
    #[serde(default)]
    pub stdin: Option<String>,

    /// Additional environment variables for this run.
    #[serde(default)]
    pub env: HashMap<String, String>,

    /// Expected exit code (default: 0).
    #[serde(default)]
    pub exit: Option<i32>,

    /// Processes that must be running (started and ready) before this run
    /// starts. Processes whose variables the command references are
    /// required implicitly.
    #[serde(default)]
    pub requires: Vec<String>,

    /// Processes that must still be running after this run's own
    /// subprocess has exited.
    #[serde(default)]
    pub still_running: Vec<String>,

    /// Timeout in seconds (overrides case/suite default).
    #[serde(default)]
    pub timeout: Option<u64>,

    /// Expected stdout content.
    #[serde(default)]
    pub stdout: Option<OutputMatch>,

    /// Expected stderr content.
    #[serde(default)]
    pub stderr: Option<OutputMatch>,

    /// Include this run only when the condition holds; otherwise it is
    /// reported as skipped.
    #[serde(default)]
    pub when: Option<Condition>,
}

/// Matching rules for stdout/stderr.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(untagged)]
pub enum OutputMatch {
    /// Exact string match.
    Exact(String),

    /// Structured match with multiple options.
    Structured(OutputMatchStructured),
}

/// Structured output matching with multiple match types.
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
pub struct OutputMatchStructured {
    /// Exact string match.
    #[serde(default)]
    pub equals: Option<String>,

    /// Substring match.
    #[serde(default)]
    pub contains: Option<String>,

    /// Regular expression match.
    #[serde(default)]
    pub regex: Option<String>,
}

/// A boolean predicate over the suite's feature set.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(untagged)]
pub enum Condition {
    /// True when the named feature is present.
    Feature(String),

    /// True when every sub-condition holds. Must be non-empty.
    All { all: Vec<Condition> },

    /// True when at least one sub-condition holds. Must be non-empty.
    Any { any: Vec<Condition> },

    /// Negation.
    Not { not: Box<Condition> },
}

/// A captured artifact bound to a gold reference file.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct GoldBinding {
    /// Path of the captured artifact (relative to the case sandbox).
    /// May reference variables.
    pub file: String,

    /// Path of the gold reference file (relative to the case file).
    pub gold: String,

    /// Normalization applied to both sides before comparison.
    #[serde(default)]
    pub normalize: Vec<NormalizeRule>,

    /// Conditional gold substitutions, first match wins. Resolved once,
    /// before any process launches.
    #[serde(default)]
    pub select: Vec<GoldSelect>,
}

/// A conditional gold-reference substitution.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct GoldSelect {
    /// Condition under which this gold file applies.
    pub when: Condition,

    /// Path of the substitute gold file (relative to the case file).
    pub gold: String,
}

/// A normalization rule applied before gold comparison.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(untagged)]
pub enum NormalizeRule {
    /// A built-in rule by name.
    Builtin(BuiltinNormalize),

    /// A custom regex rewrite.
    Custom { pattern: String, replace: String },
}

/// Built-in normalization rules.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum BuiltinNormalize {
    /// Replace epoch and ISO-8601 timestamp tokens with `<TS>`.
    Timestamps,
    /// Replace `:NNNN` port suffixes with `:<PORT>`.
    Ports,
    /// Normalize CRLF line endings to LF.
    LineEndings,
}

/// Generate the JSON Schema for case specification files.
pub fn generate_schema() -> schemars::schema::RootSchema {
    schemars::schema_for!(CaseSpec)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_minimal_case() {
        let yaml = r#"
version: 1
name: smoke
runs:
  - name: hello
    cmd: echo
    args: ["hello"]
    exit: 0
"#;
        let spec: CaseSpec = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(spec.version, 1);
        assert_eq!(spec.name, "smoke");
        assert!(spec.continue_on_fail, "continue_on_fail defaults to true");
        assert_eq!(spec.runs.len(), 1);
        assert_eq!(spec.runs[0].exit, Some(0));
        assert!(spec.processes.is_empty());
        assert!(spec.gold.is_empty());
    }

    #[test]
    fn parse_full_case() {
        let yaml = r#"
version: 1
name: via
description: Check the protocol-version log against gold references.
require_features: [http2, ipv6]
continue_on_fail: true

processes:
  - name: origin
    cmd: sh
    args: ["-c", "serve --port ${origin.http} >> origin.log"]
    shell: false
    ports: [http]
    ready:
      - port_open: "${origin.http}"
      - log_pattern:
          path: origin.log
          pattern: "listening"

runs:
  - name: http11
    cmd: client
    args: ["--http1.1", "--proxy", "localhost:${origin.http}"]
    exit: 0
    requires: [origin]
    still_running: [origin]

gold:
  - file: via.log
    gold: gold/via.gold
    normalize: [timestamps, ports]
    select:
      - when: { all: [quic, http3] }
        gold: gold/via_h3.gold
"#;
        let spec: CaseSpec = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(spec.require_features, vec!["http2", "ipv6"]);
        assert_eq!(spec.processes.len(), 1);
        assert_eq!(spec.processes[0].ports, vec!["http"]);
        assert_eq!(spec.processes[0].ready.len(), 2);
        assert!(spec.processes[0].ready[0].port_open.is_some());
        assert!(spec.processes[0].ready[1].log_pattern.is_some());
        assert_eq!(spec.runs[0].still_running, vec!["origin"]);
        assert_eq!(spec.gold.len(), 1);
        assert_eq!(spec.gold[0].normalize.len(), 2);
        assert_eq!(spec.gold[0].select.len(), 1);
    }

    #[test]
    fn parse_condition_forms() {
        let yaml = r#"
version: 1
name: gated
runs:
  - name: bare
    cmd: "true"
    when: quic
  - name: nested
    cmd: "true"
    when:
      any:
        - http3
        - all: [tls, { not: ipv6 }]
"#;
        let spec: CaseSpec = serde_yaml::from_str(yaml).unwrap();
        assert!(matches!(
            spec.runs[0].when,
            Some(Condition::Feature(ref f)) if f == "quic"
        ));
        match &spec.runs[1].when {
            Some(Condition::Any { any }) => {
                assert_eq!(any.len(), 2);
                assert!(matches!(any[1], Condition::All { .. }));
            }
            other => panic!("expected any-condition, got {other:?}"),
        }
    }

    #[test]
    fn parse_normalize_rules() {
        let yaml = r#"
version: 1
name: norm
runs:
  - name: noop
    cmd: "true"
gold:
  - file: out.log
    gold: out.gold
    normalize:
      - timestamps
      - line_endings
      - pattern: 'session-[0-9a-f]+'
        replace: 'session-<ID>'
"#;
        let spec: CaseSpec = serde_yaml::from_str(yaml).unwrap();
        let rules = &spec.gold[0].normalize;
        assert!(matches!(
            rules[0],
            NormalizeRule::Builtin(BuiltinNormalize::Timestamps)
        ));
        assert!(matches!(
            rules[1],
            NormalizeRule::Builtin(BuiltinNormalize::LineEndings)
        ));
        assert!(matches!(rules[2], NormalizeRule::Custom { .. }));
    }

    #[test]
    fn parse_stdout_match_forms() {
        let yaml = r#"
version: 1
name: matches
runs:
  - name: exact
    cmd: echo
    args: ["hello"]
    stdout: "hello\n"
  - name: structured
    cmd: echo
    args: ["hello world"]
    stdout:
      contains: world
"#;
        let spec: CaseSpec = serde_yaml::from_str(yaml).unwrap();
        match &spec.runs[0].stdout {
            Some(OutputMatch::Exact(s)) => assert_eq!(s, "hello\n"),
            other => panic!("expected exact match, got {other:?}"),
        }
        match &spec.runs[1].stdout {
            Some(OutputMatch::Structured(s)) => {
                assert_eq!(s.contains.as_deref(), Some("world"));
            }
            other => panic!("expected structured match, got {other:?}"),
        }
    }

    #[test]
    fn parse_suite_config() {
        let yaml = r#"
version: 1
features: [http2, tls]
timeout: 20
ready_timeout: 15
poll_interval_ms: 50
env:
  NO_PROXY: "*"
sandbox_dir: local
"#;
        let config: SuiteConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.features, vec!["http2", "tls"]);
        assert_eq!(config.timeout, Some(20));
        assert_eq!(config.ready_timeout, Some(15));
        assert_eq!(config.poll_interval_ms, Some(50));
        assert!(matches!(config.sandbox_dir, Some(SandboxDir::Local)));
    }

    #[test]
    fn parse_toml_case() {
        let toml_src = r#"
version = 1
name = "toml-case"

[[runs]]
name = "hello"
cmd = "echo"
args = ["hi"]
exit = 0
"#;
        let spec: CaseSpec = toml::from_str(toml_src).unwrap();
        assert_eq!(spec.name, "toml-case");
        assert_eq!(spec.runs.len(), 1);
    }
}
