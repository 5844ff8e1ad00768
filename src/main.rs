mod error;
mod gate;
mod gold;
mod loader;
mod probe;
mod runner;
mod schema;
mod supervisor;
mod vars;

use clap::{Parser, Subcommand, ValueEnum};
use gate::FeatureSet;
use runner::{CaseResult, EffectiveConfig, RunVerdict};
use std::fmt::Write as _;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Clone, Copy, Default, ValueEnum)]
enum OutputFormat {
    /// Human-readable output with checkmarks
    #[default]
    Human,
    /// Machine-readable JSON output
    Json,
    /// JUnit XML output for CI systems
    Junit,
}

#[derive(Parser)]
#[command(name = "goldrun")]
#[command(about = "A declarative gold-file test harness for long-lived processes")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Execute test cases
    Run {
        /// Path to test cases (file or directory)
        path: PathBuf,
        /// Output format
        #[arg(short, long, default_value = "human")]
        output: OutputFormat,
        /// Filter cases by name pattern (substring match)
        #[arg(short, long)]
        filter: Option<String>,
        /// Show verbose output (full gold diffs)
        #[arg(short, long)]
        verbose: bool,
        /// Declare a feature as present (repeatable; adds to suite config)
        #[arg(short = 'F', long = "feature")]
        features: Vec<String>,
        /// Directory for case sandboxes (overrides suite config).
        /// Use "local" for .goldrun/<timestamp>/, or specify a path.
        #[arg(long)]
        sandbox_dir: Option<String>,
    },
    /// Validate test cases without running them
    Validate {
        /// Path to test cases (file or directory)
        path: PathBuf,
    },
    /// Scaffold a new case file
    Init {
        /// Output path for the new case file
        #[arg(default_value = "tests/example.yaml")]
        path: PathBuf,
    },
    /// Output the case schema (for AI consumers)
    Schema,
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Command::Run {
            path,
            output,
            filter,
            verbose,
            features,
            sandbox_dir,
        } => run_command(path, output, filter, verbose, features, sandbox_dir),
        Command::Validate { path } => validate_command(path),
        Command::Init { path } => init_command(path),
        Command::Schema => {
            let schema = schema::generate_schema();
            let json = serde_json::to_string_pretty(&schema).expect("Failed to serialize schema");
            println!("{json}");
        }
    }
}

fn run_command(
    path: PathBuf,
    output: OutputFormat,
    filter: Option<String>,
    verbose: bool,
    cli_features: Vec<String>,
    sandbox_dir: Option<String>,
) {
    // Determine the test root directory for suite config
    let test_root = if path.is_file() {
        path.parent().unwrap_or(&path).to_path_buf()
    } else {
        path.clone()
    };

    // Load suite config if present
    let mut suite_config = match loader::load_suite_config(&test_root) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error loading suite config: {e}");
            std::process::exit(1);
        }
    };

    // CLI sandbox_dir overrides suite config
    if let Some(ref dir) = sandbox_dir {
        suite_config = Some(suite_config.unwrap_or_default());
        if let Some(ref mut config) = suite_config {
            config.sandbox_dir = Some(if dir == "local" {
                schema::SandboxDir::Local
            } else {
                schema::SandboxDir::Path(PathBuf::from(dir))
            });
        }
    }

    let case_paths = match loader::find_cases(&path) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Error finding cases: {e}");
            std::process::exit(1);
        }
    };

    if case_paths.is_empty() {
        eprintln!("No case files found at: {}", path.display());
        std::process::exit(1);
    }

    // Features: suite config plus CLI declarations
    let mut feature_names: Vec<String> = suite_config
        .as_ref()
        .map(|c| c.features.clone())
        .unwrap_or_default();
    feature_names.extend(cli_features);
    let features = FeatureSet::new(feature_names);

    let sandbox_base = match resolve_sandbox_base(suite_config.as_ref(), &test_root) {
        Ok(base) => base,
        Err(e) => {
            eprintln!("Error creating sandbox directory: {e}");
            std::process::exit(1);
        }
    };

    let effective = EffectiveConfig::from_suite(suite_config.as_ref());
    let run_start = std::time::Instant::now();

    // Cases run strictly sequentially: each owns exclusive ports and
    // processes, and its runs assume side effects of earlier ones.
    let mut file_results: Vec<(PathBuf, Result<CaseResult, String>)> = Vec::new();
    for case_path in &case_paths {
        match loader::load_case(case_path) {
            Ok(spec) => {
                if let Some(ref f) = filter
                    && !spec.name.contains(f.as_str())
                {
                    continue;
                }
                let spec_dir = case_path.parent().unwrap_or(Path::new("."));
                let result = runner::run_case(
                    &spec,
                    spec_dir,
                    &effective,
                    &features,
                    sandbox_base.as_deref(),
                );
                file_results.push((case_path.clone(), Ok(result)));
            }
            Err(e) => {
                file_results.push((case_path.clone(), Err(e.to_string())));
            }
        }
    }

    let mut total_passed = 0;
    let mut total_failed = 0;
    let mut total_skipped = 0;
    let mut json_results = Vec::new();
    let mut junit_results = Vec::new();

    for (case_path, result) in &file_results {
        match result {
            Err(e) => {
                if matches!(output, OutputFormat::Human) {
                    eprintln!("✗ Failed to load {}: {e}", case_path.display());
                }
                total_failed += 1;
            }
            Ok(case) => {
                if case.skipped.is_some() {
                    total_skipped += 1;
                } else {
                    for run in &case.runs {
                        match run.verdict {
                            RunVerdict::Passed => total_passed += 1,
                            RunVerdict::Failed | RunVerdict::NotRun => total_failed += 1,
                            RunVerdict::Skipped => total_skipped += 1,
                        }
                    }
                    for comparison in &case.comparisons {
                        if comparison.passed {
                            total_passed += 1;
                        } else {
                            total_failed += 1;
                        }
                    }
                }

                match output {
                    OutputFormat::Human => print_case_human(case_path, case, verbose),
                    OutputFormat::Json => {
                        json_results.push(serde_json::json!({
                            "file": case_path.display().to_string(),
                            "case": case,
                        }));
                    }
                    OutputFormat::Junit => {}
                }
            }
        }
        if matches!(output, OutputFormat::Junit) {
            junit_results.push(JunitFileResult {
                file: case_path.display().to_string(),
                outcome: match result {
                    Ok(case) => Ok(case),
                    Err(e) => Err(e.clone()),
                },
            });
        }
    }

    let total_time = run_start.elapsed();

    match output {
        OutputFormat::Human => {
            println!("\n{total_passed} passed, {total_failed} failed, {total_skipped} skipped");
        }
        OutputFormat::Json => {
            let output = serde_json::json!({
                "passed": total_passed,
                "failed": total_failed,
                "skipped": total_skipped,
                "results": json_results,
            });
            println!(
                "{}",
                serde_json::to_string_pretty(&output).expect("Failed to serialize")
            );
        }
        OutputFormat::Junit => {
            print!("{}", format_junit_xml(&junit_results, total_time));
        }
    }

    if total_failed > 0 {
        std::process::exit(1);
    }
}

/// Where sandboxes go: default temp dirs, a fixed path, or a timestamped
/// local directory for post-mortem inspection.
fn resolve_sandbox_base(
    suite: Option<&schema::SuiteConfig>,
    test_root: &Path,
) -> std::io::Result<Option<PathBuf>> {
    let Some(dir) = suite.and_then(|c| c.sandbox_dir.as_ref()) else {
        return Ok(None);
    };
    let base = match dir {
        schema::SandboxDir::Local => {
            let stamp = chrono::Local::now().format("%Y%m%d-%H%M%S");
            test_root.join(".goldrun").join(stamp.to_string())
        }
        schema::SandboxDir::Path(p) => p.clone(),
    };
    fs::create_dir_all(&base)?;
    Ok(Some(base))
}

fn print_case_human(case_path: &Path, case: &CaseResult, verbose: bool) {
    println!("\n{}", case_path.display());

    if let Some(reason) = &case.skipped {
        println!("  - {} skipped: {reason}", case.name);
        return;
    }

    for run in &case.runs {
        match run.verdict {
            RunVerdict::Passed => {
                println!("  ✓ {} ({:.2?})", run.name, run.duration);
            }
            RunVerdict::Failed => {
                println!("  ✗ {} ({:.2?})", run.name, run.duration);
                for failure in &run.failures {
                    let mut lines = failure.message.lines();
                    if let Some(first) = lines.next() {
                        println!("    [{}] {first}", failure.kind);
                    }
                    for line in lines {
                        println!("      {line}");
                    }
                }
            }
            RunVerdict::Skipped => {
                let reason = run.reason.as_deref().unwrap_or("condition not met");
                println!("  - {} skipped: {reason}", run.name);
            }
            RunVerdict::NotRun => {
                let reason = run.reason.as_deref().unwrap_or("earlier failure");
                println!("  ! {} not run: {reason}", run.name);
            }
        }
    }

    for comparison in &case.comparisons {
        if comparison.passed {
            println!("  ✓ gold {} matches {}", comparison.file, comparison.gold);
        } else {
            println!("  ✗ gold {} vs {}", comparison.file, comparison.gold);
            if let Some(detail) = &comparison.detail {
                if verbose {
                    for line in detail.lines() {
                        println!("    {line}");
                    }
                } else if let Some(first) = detail.lines().next() {
                    let more = detail.lines().count().saturating_sub(1);
                    if more > 0 {
                        println!("    {first} (+{more} more, use --verbose)");
                    } else {
                        println!("    {first}");
                    }
                }
            }
        }
    }
}

fn validate_command(path: PathBuf) {
    let cases = match loader::find_cases(&path) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Error finding cases: {e}");
            std::process::exit(1);
        }
    };

    if cases.is_empty() {
        eprintln!("No case files found at: {}", path.display());
        std::process::exit(1);
    }

    let mut errors = 0;
    for case_path in &cases {
        match loader::load_case(case_path) {
            Ok(spec) => match runner::validate_spec(&spec) {
                Ok(()) => {
                    println!(
                        "✓ {} ({} processes, {} runs)",
                        case_path.display(),
                        spec.processes.len(),
                        spec.runs.len()
                    );
                }
                Err(e) => {
                    eprintln!("✗ {}: {e}", case_path.display());
                    errors += 1;
                }
            },
            Err(e) => {
                eprintln!("✗ {}: {e}", case_path.display());
                errors += 1;
            }
        }
    }

    if errors > 0 {
        eprintln!("\n{errors} case(s) failed validation");
        std::process::exit(1);
    }
    println!("\nAll {} case(s) valid", cases.len());
}

fn init_command(path: PathBuf) {
    let template = r#"version: 1
name: example

processes:
  - name: server
    cmd: sh
    args: ["-c", "echo ready > server.log; exec sleep 300"]
    ready:
      - log_pattern:
          path: server.log
          pattern: ready

runs:
  - name: request
    cmd: sh
    args: ["-c", "echo hello >> session.log"]
    exit: 0
    requires: [server]
    still_running: [server]

# gold:
#   - file: session.log
#     gold: session.gold
#     normalize: [timestamps, ports]
"#;
    if path.exists() {
        eprintln!("Error: file already exists: {}", path.display());
        std::process::exit(1);
    }
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
        && !parent.exists()
        && let Err(e) = fs::create_dir_all(parent)
    {
        eprintln!("Error creating directory: {e}");
        std::process::exit(1);
    }
    if let Err(e) = fs::write(&path, template) {
        eprintln!("Error writing file: {e}");
        std::process::exit(1);
    }
    println!("Created: {}", path.display());
}

/// A file result for JUnit output.
struct JunitFileResult<'a> {
    file: String,
    outcome: Result<&'a CaseResult, String>,
}

/// Format case results as JUnit XML.
fn format_junit_xml(results: &[JunitFileResult<'_>], total_time: Duration) -> String {
    let mut xml = String::new();
    xml.push_str("<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n");

    let mut total_tests = 0;
    let mut total_failures = 0;
    let mut total_skipped = 0;
    for result in results {
        match &result.outcome {
            Err(_) => {
                total_tests += 1;
                total_failures += 1;
            }
            Ok(case) if case.skipped.is_some() => {
                total_tests += 1;
                total_skipped += 1;
            }
            Ok(case) => {
                total_tests += case.runs.len() + case.comparisons.len();
                for run in &case.runs {
                    match run.verdict {
                        RunVerdict::Failed | RunVerdict::NotRun => total_failures += 1,
                        RunVerdict::Skipped => total_skipped += 1,
                        RunVerdict::Passed => {}
                    }
                }
                total_failures += case.comparisons.iter().filter(|c| !c.passed).count();
            }
        }
    }

    let _ = writeln!(
        xml,
        "<testsuites tests=\"{total_tests}\" failures=\"{total_failures}\" skipped=\"{total_skipped}\" time=\"{:.3}\">",
        total_time.as_secs_f64()
    );

    for result in results {
        match &result.outcome {
            Err(e) => {
                let _ = writeln!(
                    xml,
                    "  <testsuite name=\"{}\" tests=\"1\" failures=\"1\" time=\"0.000\">",
                    escape_xml(&result.file)
                );
                xml.push_str("    <testcase name=\"&lt;load&gt;\" time=\"0.000\">\n");
                let _ = writeln!(
                    xml,
                    "      <failure message=\"{}\">Failed to load case</failure>",
                    escape_xml(e)
                );
                xml.push_str("    </testcase>\n  </testsuite>\n");
            }
            Ok(case) if case.skipped.is_some() => {
                let reason = case.skipped.as_deref().unwrap_or_default();
                let _ = writeln!(
                    xml,
                    "  <testsuite name=\"{}\" tests=\"1\" failures=\"0\" skipped=\"1\" time=\"{:.3}\">",
                    escape_xml(&result.file),
                    case.duration.as_secs_f64()
                );
                let _ = writeln!(
                    xml,
                    "    <testcase name=\"{}\" time=\"0.000\">",
                    escape_xml(&case.name)
                );
                let _ = writeln!(
                    xml,
                    "      <skipped message=\"{}\"/>",
                    escape_xml(reason)
                );
                xml.push_str("    </testcase>\n  </testsuite>\n");
            }
            Ok(case) => {
                let tests = case.runs.len() + case.comparisons.len();
                let failures = case
                    .runs
                    .iter()
                    .filter(|r| matches!(r.verdict, RunVerdict::Failed | RunVerdict::NotRun))
                    .count()
                    + case.comparisons.iter().filter(|c| !c.passed).count();

                let _ = writeln!(
                    xml,
                    "  <testsuite name=\"{}\" tests=\"{tests}\" failures=\"{failures}\" time=\"{:.3}\">",
                    escape_xml(&result.file),
                    case.duration.as_secs_f64()
                );

                for run in &case.runs {
                    let _ = writeln!(
                        xml,
                        "    <testcase name=\"{}\" time=\"{:.3}\">",
                        escape_xml(&run.name),
                        run.duration.as_secs_f64()
                    );
                    match run.verdict {
                        RunVerdict::Passed => {}
                        RunVerdict::Skipped => {
                            let reason = run.reason.as_deref().unwrap_or("condition not met");
                            let _ = writeln!(
                                xml,
                                "      <skipped message=\"{}\"/>",
                                escape_xml(reason)
                            );
                        }
                        RunVerdict::NotRun => {
                            let reason = run.reason.as_deref().unwrap_or("earlier failure");
                            let _ = writeln!(
                                xml,
                                "      <failure message=\"not run: {}\"/>",
                                escape_xml(reason)
                            );
                        }
                        RunVerdict::Failed => {
                            let message = run
                                .failures
                                .first()
                                .map(|f| f.message.as_str())
                                .unwrap_or("Run failed");
                            let _ = writeln!(
                                xml,
                                "      <failure message=\"{}\">",
                                escape_xml(message)
                            );
                            for failure in &run.failures {
                                let _ = writeln!(
                                    xml,
                                    "[{}] {}",
                                    failure.kind,
                                    escape_xml(&failure.message)
                                );
                            }
                            xml.push_str("      </failure>\n");
                        }
                    }
                    xml.push_str("    </testcase>\n");
                }

                for comparison in &case.comparisons {
                    let _ = writeln!(
                        xml,
                        "    <testcase name=\"gold:{}\" time=\"0.000\">",
                        escape_xml(&comparison.file)
                    );
                    if !comparison.passed {
                        let detail = comparison.detail.as_deref().unwrap_or("gold mismatch");
                        let _ = writeln!(
                            xml,
                            "      <failure message=\"gold mismatch vs {}\">{}</failure>",
                            escape_xml(&comparison.gold),
                            escape_xml(detail)
                        );
                    }
                    xml.push_str("    </testcase>\n");
                }

                xml.push_str("  </testsuite>\n");
            }
        }
    }

    xml.push_str("</testsuites>\n");
    xml
}

/// Escape special XML characters.
fn escape_xml(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
        .replace('\'', "&apos;")
}
