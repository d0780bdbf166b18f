//! Configuration for conduit.
//!
//! Configuration sources (highest priority first):
//! 1. Environment variables (CONDUIT_HOME, CONDUIT_WORKFLOWS, CONDUIT_HOST, CONDUIT_PORT)
//! 2. Config file (.conduit/config.yaml)
//! 3. Defaults (~/.conduit)
//!
//! Config file discovery:
//! - Searches current directory and parents for .conduit/config.yaml
//! - `paths.home` is relative to the .conduit/ directory, `paths.workflows`
//!   to the project root (the directory containing .conduit/)

use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::core::CoordinatorConfig;
use crate::resilience::ResilienceConfig;
use crate::server::ServerConfig;
use crate::streaming::StreamingConfig;

/// Global cached configuration (stores Result to handle init errors)
static CONFIG: OnceLock<Result<ResolvedConfig, String>> = OnceLock::new();

/// Raw config file schema (matches YAML structure)
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub paths: PathsConfig,
    #[serde(default)]
    pub resilience: ResilienceConfig,
    #[serde(default)]
    pub streaming: StreamingConfig,
    #[serde(default)]
    pub coordinator: CoordinatorConfig,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub fabric: Option<FabricConfig>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PathsConfig {
    /// State directory (relative to .conduit/)
    pub home: Option<String>,
    /// Workflow definitions directory (relative to the project root)
    pub workflows: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FabricConfig {
    pub binary_path: Option<String>,
    pub timeout_seconds: Option<u64>,
}

/// Fabric provider settings after defaults
#[derive(Debug, Clone, Default)]
pub struct FabricSettings {
    /// Explicit binary; auto-detected when unset
    pub binary_path: Option<String>,
    pub timeout: Option<Duration>,
}

/// Resolved configuration with absolute paths
#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    /// State directory
    pub home: PathBuf,
    /// Directory scanned for workflow YAML files
    pub workflows_dir: PathBuf,
    /// Path to config file (if found)
    pub config_file: Option<PathBuf>,
    pub resilience: ResilienceConfig,
    pub streaming: StreamingConfig,
    pub coordinator: CoordinatorConfig,
    pub server: ServerConfig,
    pub fabric: FabricSettings,
}

/// Find config file by searching `start` and its parents
fn find_config_file(start: &Path) -> Option<PathBuf> {
    let mut current = start.to_path_buf();

    loop {
        let config_path = current.join(".conduit").join("config.yaml");
        if config_path.exists() {
            return Some(config_path);
        }

        if !current.pop() {
            break;
        }
    }

    None
}

/// Load and parse config file
fn load_config_file(path: &Path) -> Result<ConfigFile> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    serde_yaml::from_str(&content)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))
}

/// Resolve a path that may be relative to `base`
fn resolve_path(base: &Path, path_str: &str) -> PathBuf {
    let path = PathBuf::from(path_str);
    if path.is_absolute() {
        path
    } else {
        base.join(path)
            .canonicalize()
            .unwrap_or_else(|_| base.join(path_str))
    }
}

/// Resolve configuration from a starting directory, a default home and an
/// environment lookup
fn resolve_config<E>(start: &Path, default_home: PathBuf, env: E) -> Result<ResolvedConfig>
where
    E: Fn(&str) -> Option<String>,
{
    let config_file = find_config_file(start);

    let (file, conduit_dir, project_root) = match config_file {
        Some(ref config_path) => {
            let file = load_config_file(config_path)?;
            let conduit_dir = config_path.parent().unwrap_or(Path::new(".")).to_path_buf();
            let project_root = conduit_dir.parent().unwrap_or(Path::new(".")).to_path_buf();
            (file, Some(conduit_dir), Some(project_root))
        }
        None => (ConfigFile::default(), None, None),
    };

    let home = match (env("CONDUIT_HOME"), &file.paths.home, &conduit_dir) {
        (Some(env_home), _, _) => PathBuf::from(env_home),
        (None, Some(home_path), Some(dir)) => resolve_path(dir, home_path),
        _ => default_home,
    };

    let workflows_dir = match (env("CONDUIT_WORKFLOWS"), &file.paths.workflows, &project_root) {
        (Some(env_dir), _, _) => PathBuf::from(env_dir),
        (None, Some(dir_path), Some(root)) => resolve_path(root, dir_path),
        _ => home.join("workflows"),
    };

    let mut server = file.server;
    if let Some(host) = env("CONDUIT_HOST") {
        server.host = host;
    }
    if let Some(port) = env("CONDUIT_PORT") {
        server.port = port
            .parse()
            .with_context(|| format!("Invalid CONDUIT_PORT: {}", port))?;
    }

    let fabric = file
        .fabric
        .map(|f| FabricSettings {
            binary_path: f.binary_path,
            timeout: f.timeout_seconds.map(Duration::from_secs),
        })
        .unwrap_or_default();

    Ok(ResolvedConfig {
        home,
        workflows_dir,
        config_file,
        resilience: file.resilience,
        streaming: file.streaming,
        coordinator: file.coordinator,
        server,
        fabric,
    })
}

/// Load configuration from all sources
fn load_config() -> Result<ResolvedConfig> {
    let default_home = dirs::home_dir()
        .context("Failed to determine home directory")?
        .join(".conduit");
    let cwd = std::env::current_dir().context("Failed to determine current directory")?;

    resolve_config(&cwd, default_home, |key| std::env::var(key).ok())
}

/// Get the global configuration (loads once, then cached)
pub fn config() -> Result<&'static ResolvedConfig> {
    let result = CONFIG.get_or_init(|| load_config().map_err(|e| format!("{:#}", e)));

    match result {
        Ok(config) => Ok(config),
        Err(e) => anyhow::bail!("{}", e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;
    use tempfile::TempDir;

    fn no_env(_: &str) -> Option<String> {
        None
    }

    #[test]
    fn test_defaults_without_file() {
        let temp = TempDir::new().unwrap();
        let home = temp.path().join("home");

        let config = resolve_config(temp.path(), home.clone(), no_env).unwrap();
        assert_eq!(config.home, home);
        assert_eq!(config.workflows_dir, home.join("workflows"));
        assert!(config.config_file.is_none());
        assert_eq!(config.resilience.breaker.failure_threshold, 5);
        assert_eq!(config.server.port, 3000);
    }

    #[test]
    fn test_config_file_found_from_subdirectory() {
        let temp = TempDir::new().unwrap();
        let conduit_dir = temp.path().join(".conduit");
        std::fs::create_dir_all(&conduit_dir).unwrap();
        let nested = temp.path().join("a").join("b");
        std::fs::create_dir_all(&nested).unwrap();

        let mut file = std::fs::File::create(conduit_dir.join("config.yaml")).unwrap();
        writeln!(
            file,
            r#"
version: "1"
paths:
  workflows: flows
resilience:
  retry:
    max_retries: 1
  breaker:
    failure_threshold: 2
streaming:
  partial_every: 4
server:
  port: 8088
fabric:
  timeout_seconds: 30
"#
        )
        .unwrap();

        let config = resolve_config(&nested, temp.path().join("unused"), no_env).unwrap();
        assert!(config.config_file.is_some());
        assert!(config.workflows_dir.ends_with("flows"));
        assert_eq!(config.resilience.retry.max_retries, 1);
        assert_eq!(config.resilience.retry.base_delay_ms, 1000);
        assert_eq!(config.resilience.breaker.failure_threshold, 2);
        assert_eq!(config.streaming.partial_every, 4);
        assert_eq!(config.server.port, 8088);
        assert_eq!(config.server.host, "127.0.0.1");
        assert_eq!(config.fabric.timeout, Some(Duration::from_secs(30)));
    }

    #[test]
    fn test_env_overrides() {
        let temp = TempDir::new().unwrap();
        let env: HashMap<&str, &str> = [
            ("CONDUIT_HOME", "/srv/conduit"),
            ("CONDUIT_WORKFLOWS", "/srv/flows"),
            ("CONDUIT_HOST", "0.0.0.0"),
            ("CONDUIT_PORT", "9000"),
        ]
        .into_iter()
        .collect();

        let config = resolve_config(temp.path(), temp.path().join("home"), |k| {
            env.get(k).map(|v| v.to_string())
        })
        .unwrap();

        assert_eq!(config.home, PathBuf::from("/srv/conduit"));
        assert_eq!(config.workflows_dir, PathBuf::from("/srv/flows"));
        assert_eq!(config.server.host, "0.0.0.0");
        assert_eq!(config.server.port, 9000);
    }

    #[test]
    fn test_invalid_port_is_an_error() {
        let temp = TempDir::new().unwrap();
        let result = resolve_config(temp.path(), temp.path().join("home"), |k| {
            (k == "CONDUIT_PORT").then(|| "not-a-port".to_string())
        });
        assert!(result.is_err());
    }

    #[test]
    fn test_resolve_relative_path() {
        let base = PathBuf::from("/home/user/project");

        assert_eq!(
            resolve_path(&base, "./subdir"),
            PathBuf::from("/home/user/project/subdir")
        );
        assert_eq!(
            resolve_path(&base, "/absolute/path"),
            PathBuf::from("/absolute/path")
        );
    }
}
