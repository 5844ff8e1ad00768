//! Case file loader.
//!
//! Loads and parses test-case specification files from disk.

use crate::schema::{CaseSpec, SuiteConfig};
use std::path::Path;

/// Error type for case loading operations.
#[derive(Debug)]
pub enum LoadError {
    /// Failed to read the file.
    Io(std::io::Error),
    /// Failed to parse YAML.
    Yaml(serde_yaml::Error),
    /// Failed to parse TOML.
    Toml(toml::de::Error),
    /// Unsupported file extension.
    UnsupportedFormat(String),
}

impl std::fmt::Display for LoadError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LoadError::Io(e) => write!(f, "failed to read file: {e}"),
            LoadError::Yaml(e) => write!(f, "invalid YAML: {e}"),
            LoadError::Toml(e) => write!(f, "invalid TOML: {e}"),
            LoadError::UnsupportedFormat(ext) => {
                write!(
                    f,
                    "unsupported file format: {ext} (expected .yaml, .yml, or .toml)"
                )
            }
        }
    }
}

impl std::error::Error for LoadError {}

/// The name of the suite configuration file.
pub const SUITE_CONFIG_FILENAME: &str = "goldrun.yaml";

/// Load a test case from a file path.
pub fn load_case(path: &Path) -> Result<CaseSpec, LoadError> {
    let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("");
    let contents = std::fs::read_to_string(path).map_err(LoadError::Io)?;

    match ext {
        "yaml" | "yml" => serde_yaml::from_str(&contents).map_err(LoadError::Yaml),
        "toml" => toml::from_str(&contents).map_err(LoadError::Toml),
        other => Err(LoadError::UnsupportedFormat(other.to_string())),
    }
}

/// Load suite configuration from a directory.
///
/// Looks for `goldrun.yaml` in the given directory.
/// Returns `None` if the file doesn't exist, `Err` if it exists but is invalid.
pub fn load_suite_config(dir: &Path) -> Result<Option<SuiteConfig>, LoadError> {
    let config_path = dir.join(SUITE_CONFIG_FILENAME);

    if !config_path.exists() {
        return Ok(None);
    }

    let contents = std::fs::read_to_string(&config_path).map_err(LoadError::Io)?;
    let config: SuiteConfig = serde_yaml::from_str(&contents).map_err(LoadError::Yaml)?;
    Ok(Some(config))
}

/// Find all case files in a directory or return the single file.
///
/// Gold reference files live next to the cases, so only spec extensions
/// are collected; the suite config file is excluded.
pub fn find_cases(path: &Path) -> Result<Vec<std::path::PathBuf>, std::io::Error> {
    if path.is_file() {
        return Ok(vec![path.to_path_buf()]);
    }

    let mut cases = Vec::new();
    collect_cases_recursive(path, &mut cases)?;
    cases.sort();
    Ok(cases)
}

fn collect_cases_recursive(
    dir: &Path,
    cases: &mut Vec<std::path::PathBuf>,
) -> Result<(), std::io::Error> {
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();

        if path.is_dir() {
            collect_cases_recursive(&path, cases)?;
        } else if let Some(ext) = path.extension().and_then(|e| e.to_str())
            && (ext == "yaml" || ext == "yml" || ext == "toml")
        {
            // Skip suite config file
            if path.file_name().is_some_and(|f| f == SUITE_CONFIG_FILENAME) {
                continue;
            }
            cases.push(path);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::tempdir;

    #[test]
    fn load_valid_case() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("case.yaml");
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(
            file,
            r#"
version: 1
name: smoke
runs:
  - name: hello
    cmd: echo
    exit: 0
"#
        )
        .unwrap();

        let spec = load_case(&path).unwrap();
        assert_eq!(spec.version, 1);
        assert_eq!(spec.name, "smoke");
        assert_eq!(spec.runs.len(), 1);
    }

    #[test]
    fn load_invalid_yaml() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("bad.yaml");
        std::fs::write(&path, "invalid: [yaml: {").unwrap();

        let result = load_case(&path);
        assert!(matches!(result, Err(LoadError::Yaml(_))));
    }

    #[test]
    fn unsupported_format() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("case.txt");
        std::fs::write(&path, "").unwrap();

        let result = load_case(&path);
        assert!(matches!(result, Err(LoadError::UnsupportedFormat(_))));
    }

    #[test]
    fn load_valid_toml_case() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("case.toml");
        std::fs::write(
            &path,
            r#"
version = 1
name = "toml-case"

[[runs]]
name = "hello"
cmd = "echo"

"#,
        )
        .unwrap();

        let spec = load_case(&path).unwrap();
        assert_eq!(spec.name, "toml-case");
        assert_eq!(spec.runs.len(), 1);
    }

    #[test]
    fn find_cases_in_directory() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("a.yaml"), "").unwrap();
        std::fs::write(dir.path().join("b.yml"), "").unwrap();
        std::fs::write(dir.path().join("c.toml"), "").unwrap();
        std::fs::write(dir.path().join("via.gold"), "").unwrap();

        let cases = find_cases(dir.path()).unwrap();
        assert_eq!(cases.len(), 3, "gold files are not case files");
    }

    #[test]
    fn find_cases_excludes_suite_config() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("a.yaml"), "").unwrap();
        std::fs::write(dir.path().join("goldrun.yaml"), "version: 1").unwrap();

        let cases = find_cases(dir.path()).unwrap();
        assert_eq!(cases.len(), 1);
        assert!(cases[0].file_name().unwrap() != "goldrun.yaml");
    }

    #[test]
    fn load_suite_config_not_found() {
        let dir = tempdir().unwrap();
        let result = load_suite_config(dir.path()).unwrap();
        assert!(result.is_none());
    }

    #[test]
    fn load_suite_config_valid() {
        let dir = tempdir().unwrap();
        std::fs::write(
            dir.path().join("goldrun.yaml"),
            r#"
version: 1
features: [http2]
timeout: 10
"#,
        )
        .unwrap();

        let config = load_suite_config(dir.path()).unwrap().unwrap();
        assert_eq!(config.version, 1);
        assert_eq!(config.features, vec!["http2"]);
        assert_eq!(config.timeout, Some(10));
    }

    #[test]
    fn load_suite_config_invalid() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("goldrun.yaml"), "invalid: [yaml: {").unwrap();

        let result = load_suite_config(dir.path());
        assert!(matches!(result, Err(LoadError::Yaml(_))));
    }
}
