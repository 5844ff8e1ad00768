//! Variable table and command-template interpolation.
//!
//! Supervised processes expose runtime-resolved values (assigned ports,
//! sandbox paths) as named variables like `origin.http` or `proxy.dir`.
//! Run commands and process arguments reference them with `${name}` syntax.

use std::collections::HashMap;

/// Named values produced by the harness for one test case.
///
/// Lookups check the table first, then fall back to the host environment,
/// so templates can also reference plain environment variables.
#[derive(Debug, Clone, Default)]
pub struct VarTable {
    vars: HashMap<String, String>,
}

impl VarTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.vars.insert(name.into(), value.into());
    }

    /// Interpolate `${name}` references in a template string.
    ///
    /// Returns an error message naming the first unresolvable reference or
    /// an unclosed `${`.
    pub fn resolve(&self, template: &str) -> Result<String, String> {
        let mut result = String::with_capacity(template.len());
        let mut chars = template.chars().peekable();

        while let Some(c) = chars.next() {
            if c == '$' && chars.peek() == Some(&'{') {
                chars.next(); // consume '{'
                let mut name = String::new();
                loop {
                    match chars.next() {
                        Some('}') => break,
                        Some(c) => name.push(c),
                        None => {
                            return Err(format!("unclosed variable reference: ${{{name}"));
                        }
                    }
                }
                let value = self
                    .vars
                    .get(&name)
                    .cloned()
                    .or_else(|| std::env::var(&name).ok())
                    .ok_or_else(|| format!("variable '{name}' is not defined"))?;
                result.push_str(&value);
            } else {
                result.push(c);
            }
        }

        Ok(result)
    }

    /// Resolve a list of templates, preserving order.
    pub fn resolve_all(&self, templates: &[String]) -> Result<Vec<String>, String> {
        templates.iter().map(|t| self.resolve(t)).collect()
    }

    /// Names of processes whose variables a template reads.
    ///
    /// A reference like `${origin.http}` reads a variable produced by the
    /// process `origin`. Used to widen a run's preconditions so no variable
    /// is consumed before its producer is confirmed running.
    pub fn referenced_processes(template: &str) -> Vec<String> {
        let mut names = Vec::new();
        let mut rest = template;
        while let Some(start) = rest.find("${") {
            rest = &rest[start + 2..];
            if let Some(end) = rest.find('}') {
                let var = &rest[..end];
                if let Some((process, _)) = var.split_once('.')
                    && !process.is_empty()
                    && !names.iter().any(|n| n == process)
                {
                    names.push(process.to_string());
                }
                rest = &rest[end + 1..];
            } else {
                break;
            }
        }
        names
    }
}
