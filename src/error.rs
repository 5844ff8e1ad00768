//! Harness error taxonomy.
//!
//! Errors that abort a whole case (launch, readiness of a dependency,
//! malformed conditions, sandbox setup) are surfaced as `HarnessError`.
//! Recoverable per-run outcomes (exit-code mismatches, gold diffs) are
//! recorded as tagged failures on the run result instead, so sibling runs
//! keep executing.

use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum HarnessError {
    /// A supervised process could not be spawned or died during startup.
    /// Fatal to the case.
    #[error("process '{name}' failed to launch: {source}")]
    Launch {
        name: String,
        #[source]
        source: std::io::Error,
    },

    /// A readiness probe never succeeded within the timeout. Fatal to
    /// runs that depend on the process.
    #[error("process '{process}' not ready after {timeout:?}: {probe} never succeeded")]
    ReadinessTimeout {
        process: String,
        probe: String,
        timeout: Duration,
    },

    /// A condition predicate or spec reference is malformed. Surfaced
    /// before any launch.
    #[error("invalid condition: {0}")]
    Condition(String),

    /// Sandbox or log file creation failed.
    #[error("sandbox setup failed: {0}")]
    Sandbox(std::io::Error),
}
