//! Gold-file comparison.
//!
//! A captured artifact is compared against a gold reference after both
//! sides pass through the binding's normalization rules. Comparison is
//! exact after normalization; any residual difference fails and is
//! reported as a line-level diff.

use crate::schema::{BuiltinNormalize, NormalizeRule};
use regex::Regex;
use std::fmt;

/// Result of one gold comparison. An empty diff means the artifact matched.
#[derive(Debug, Clone, Default)]
pub struct GoldDiff {
    pub lines: Vec<LineDiff>,
}

/// One differing line position.
#[derive(Debug, Clone)]
pub struct LineDiff {
    /// 1-based line number.
    pub line: usize,
    /// Gold-side line, if the gold file has one at this position.
    pub expected: Option<String>,
    /// Artifact-side line, if the artifact has one at this position.
    pub actual: Option<String>,
}

impl GoldDiff {
    pub fn is_match(&self) -> bool {
        self.lines.is_empty()
    }
}

impl fmt::Display for GoldDiff {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for diff in &self.lines {
            match (&diff.expected, &diff.actual) {
                (Some(e), Some(a)) => {
                    writeln!(f, "line {}: expected {e:?}, got {a:?}", diff.line)?;
                }
                (Some(e), None) => {
                    writeln!(f, "line {}: expected {e:?}, missing", diff.line)?;
                }
                (None, Some(a)) => {
                    writeln!(f, "line {}: unexpected {a:?}", diff.line)?;
                }
                (None, None) => {}
            }
        }
        Ok(())
    }
}

/// Apply normalization rules to a text, in declaration order.
///
/// Returns an error message for an invalid custom pattern.
pub fn normalize(text: &str, rules: &[NormalizeRule]) -> Result<String, String> {
    let mut result = text.to_string();
    for rule in rules {
        result = match rule {
            NormalizeRule::Builtin(BuiltinNormalize::Timestamps) => {
                normalize_timestamps(&result)
            }
            NormalizeRule::Builtin(BuiltinNormalize::Ports) => normalize_ports(&result),
            NormalizeRule::Builtin(BuiltinNormalize::LineEndings) => result.replace("\r\n", "\n"),
            NormalizeRule::Custom { pattern, replace } => {
                let re = Regex::new(pattern)
                    .map_err(|e| format!("invalid normalize pattern {pattern:?}: {e}"))?;
                re.replace_all(&result, replace.as_str()).into_owned()
            }
        };
    }
    Ok(result)
}

fn normalize_timestamps(text: &str) -> String {
    // ISO-8601 first so its date/time digits don't partially match as epochs.
    let iso =
        Regex::new(r"\d{4}-\d{2}-\d{2}[T ]\d{2}:\d{2}:\d{2}(?:\.\d+)?(?:Z|[+-]\d{2}:?\d{2})?")
            .unwrap();
    let epoch = Regex::new(r"\b\d{10}(?:\.\d{1,6})?\b").unwrap();

    let text = iso.replace_all(text, "<TS>");
    epoch.replace_all(&text, "<TS>").into_owned()
}

fn normalize_ports(text: &str) -> String {
    let port = Regex::new(r":\d{2,5}\b").unwrap();
    port.replace_all(text, ":<PORT>").into_owned()
}

/// Compare an artifact against a gold reference under the given rules.
///
/// Both sides are normalized; the result is a line-level diff, empty on a
/// match. A trailing-newline difference that no line pair explains is
/// reported against the final line.
pub fn compare(gold: &str, actual: &str, rules: &[NormalizeRule]) -> Result<GoldDiff, String> {
    let gold = normalize(gold, rules)?;
    let actual = normalize(actual, rules)?;

    if gold == actual {
        return Ok(GoldDiff::default());
    }

    let gold_lines: Vec<&str> = gold.lines().collect();
    let actual_lines: Vec<&str> = actual.lines().collect();
    let mut lines = Vec::new();

    for (i, pair) in gold_lines
        .iter()
        .map(Some)
        .chain(std::iter::repeat(None))
        .zip(actual_lines.iter().map(Some).chain(std::iter::repeat(None)))
        .take(gold_lines.len().max(actual_lines.len()))
        .enumerate()
    {
        match pair {
            (Some(e), Some(a)) if e == a => {}
            (expected, actual) => lines.push(LineDiff {
                line: i + 1,
                expected: expected.map(|s| s.to_string()),
                actual: actual.map(|s| s.to_string()),
            }),
        }
    }

    if lines.is_empty() {
        // Same lines but different bytes: a trailing-newline difference.
        let n = gold_lines.len().max(1);
        lines.push(LineDiff {
            line: n,
            expected: Some(format!("{:?}", gold.ends_with('\n'))),
            actual: Some(format!("{:?}", actual.ends_with('\n'))),
        });
    }

    Ok(GoldDiff { lines })
}
