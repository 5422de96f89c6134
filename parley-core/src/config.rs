// ABOUTME: Configuration parsing from TOML file with environment variable overrides
// ABOUTME: Provides defaults for every section plus XDG paths for config and logs

use crate::policy::UnmatchedToolFallback;
use crate::resolver::{DEFAULT_ALLOWED_TOOLS, DEFAULT_MODEL};
use anyhow::{Context, Result};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

const QUALIFIER: &str = "com";
const ORGANIZATION: &str = "parley";
const APPLICATION: &str = "parley";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub workspace: WorkspaceConfig,
    #[serde(default)]
    pub defaults: DefaultsConfig,
    #[serde(default)]
    pub policy: PolicyConfig,
    #[serde(default)]
    pub audit: AuditConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Interval between SSE keep-alive comments
    #[serde(default = "default_keep_alive_secs")]
    pub keep_alive_secs: u64,
    #[serde(default = "default_true")]
    pub metrics: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            keep_alive_secs: default_keep_alive_secs(),
            metrics: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Engine type: "direct" or "mock"
    #[serde(rename = "type", default = "default_engine_type")]
    pub engine_type: String,
    /// Path to the CLI binary (direct engine)
    pub binary: Option<String>,
    #[serde(default = "default_true")]
    pub include_partial_messages: bool,
    #[serde(default)]
    pub extra_args: Vec<String>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            engine_type: default_engine_type(),
            binary: None,
            include_partial_messages: true,
            extra_args: Vec::new(),
        }
    }
}

impl EngineConfig {
    /// Settings in the shape the engine factories expect
    pub fn factory_config(&self) -> serde_json::Value {
        let mut value = serde_json::json!({
            "include_partial_messages": self.include_partial_messages,
            "extra_args": self.extra_args,
        });
        if let Some(binary) = &self.binary {
            value["binary"] = serde_json::Value::String(binary.clone());
        }
        value
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkspaceConfig {
    #[serde(default = "default_workspace_path")]
    pub path: String,
    /// Skills library; defaults to `<workspace>/skills`
    pub skills_dir: Option<String>,
    /// Directory holding `.mcp.json`; defaults to the workspace
    pub project_dir: Option<String>,
}

impl Default for WorkspaceConfig {
    fn default() -> Self {
        Self {
            path: default_workspace_path(),
            skills_dir: None,
            project_dir: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DefaultsConfig {
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default = "default_allowed_tools")]
    pub allowed_tools: Vec<String>,
}

impl Default for DefaultsConfig {
    fn default() -> Self {
        Self {
            model: default_model(),
            allowed_tools: default_allowed_tools(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PolicyConfig {
    #[serde(default)]
    pub unmatched_tools: UnmatchedToolFallback,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self { enabled: true }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Also write daily-rotated logs under the XDG data directory
    #[serde(default)]
    pub file: bool,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    13100
}

fn default_keep_alive_secs() -> u64 {
    15
}

fn default_engine_type() -> String {
    "direct".to_string()
}

fn default_workspace_path() -> String {
    "./workspace".to_string()
}

fn default_model() -> String {
    DEFAULT_MODEL.to_string()
}

fn default_allowed_tools() -> Vec<String> {
    DEFAULT_ALLOWED_TOOLS.iter().map(|t| t.to_string()).collect()
}

fn default_true() -> bool {
    true
}

pub fn project_dirs() -> Option<ProjectDirs> {
    ProjectDirs::from(QUALIFIER, ORGANIZATION, APPLICATION)
}

/// e.g. ~/.local/share/parley/, falling back to ./data
pub fn data_dir() -> PathBuf {
    project_dirs()
        .map(|p| p.data_dir().to_path_buf())
        .unwrap_or_else(|| PathBuf::from("./data"))
}

pub fn log_dir() -> PathBuf {
    data_dir().join("logs")
}

/// e.g. ~/.config/parley/parley.toml
pub fn config_file() -> PathBuf {
    project_dirs()
        .map(|p| p.config_dir().to_path_buf())
        .unwrap_or_else(|| PathBuf::from("."))
        .join("parley.toml")
}

/// Expand tilde (~) to home directory in paths
/// Logs a warning if expansion fails and falls back to the original path
pub fn expand_tilde(path: &str) -> String {
    if path != "~" && !path.starts_with("~/") {
        return path.to_string();
    }
    let Some(base_dirs) = directories::BaseDirs::new() else {
        tracing::warn!(
            path = %path,
            "Failed to expand tilde in path: could not determine home directory"
        );
        return path.to_string();
    };
    match path.strip_prefix("~/") {
        Some(rest) => base_dirs.home_dir().join(rest).to_string_lossy().to_string(),
        None => base_dirs.home_dir().to_string_lossy().to_string(),
    }
}

impl Config {
    /// Config file search order:
    /// 1. PARLEY_CONFIG_PATH env var (if set)
    /// 2. ./parley.toml
    /// 3. ~/.config/parley/parley.toml
    fn find_config_file() -> Option<PathBuf> {
        if let Ok(env_path) = std::env::var("PARLEY_CONFIG_PATH") {
            let path = PathBuf::from(&env_path);
            if path.exists() {
                return Some(path);
            }
            tracing::warn!(path = %env_path, "PARLEY_CONFIG_PATH does not exist, ignoring");
        }

        let local_config = PathBuf::from("parley.toml");
        if local_config.exists() {
            return Some(local_config);
        }

        let xdg_config = config_file();
        if xdg_config.exists() {
            return Some(xdg_config);
        }

        None
    }

    /// Load configuration from the first config file found, then apply env overrides
    pub fn load() -> Result<Self> {
        let mut config = if let Some(config_path) = Self::find_config_file() {
            tracing::info!(
                path = %config_path.display(),
                "Loading configuration from file"
            );
            let content = std::fs::read_to_string(&config_path)
                .with_context(|| format!("Failed to read {}", config_path.display()))?;
            Self::from_toml(&content)
                .with_context(|| format!("Failed to parse {}", config_path.display()))?
        } else {
            tracing::info!("No config file found, using environment variables and defaults");
            Config::default()
        };

        config.apply_env_overrides()?;
        config.workspace.path = expand_tilde(&config.workspace.path);
        config.workspace.skills_dir = config.workspace.skills_dir.as_deref().map(expand_tilde);
        config.workspace.project_dir = config.workspace.project_dir.as_deref().map(expand_tilde);
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        Ok(toml::from_str::<Config>(content)?)
    }

    fn apply_env_overrides(&mut self) -> Result<()> {
        if let Ok(val) = std::env::var("PARLEY_HOST") {
            self.server.host = val;
        }
        if let Ok(val) = std::env::var("PARLEY_PORT") {
            self.server.port = val.parse().with_context(|| {
                format!("PARLEY_PORT must be a valid port number, got: {}", val)
            })?;
        }
        if let Ok(val) = std::env::var("PARLEY_WORKSPACE") {
            self.workspace.path = val;
        }
        if let Ok(val) = std::env::var("PARLEY_ENGINE") {
            self.engine.engine_type = val;
        }
        if let Ok(val) = std::env::var("PARLEY_ENGINE_BINARY") {
            self.engine.binary = Some(val);
        }
        if let Ok(val) = std::env::var("PARLEY_DEFAULT_MODEL") {
            self.defaults.model = val;
        }
        Ok(())
    }

    fn validate(&self) -> Result<()> {
        if self.defaults.model.trim().is_empty() {
            anyhow::bail!("defaults.model must not be empty");
        }
        if self.workspace.path.trim().is_empty() {
            anyhow::bail!("workspace.path must not be empty");
        }
        Ok(())
    }

    pub fn workspace_dir(&self) -> PathBuf {
        PathBuf::from(&self.workspace.path)
    }

    pub fn database_path(&self) -> PathBuf {
        self.workspace_dir().join("parley.db")
    }

    pub fn audit_dir(&self) -> PathBuf {
        self.workspace_dir().join("audit")
    }

    /// Parent of per-session working directories
    pub fn sessions_root(&self) -> PathBuf {
        self.workspace_dir().join("sessions")
    }

    pub fn skills_dir(&self) -> PathBuf {
        self.workspace
            .skills_dir
            .as_ref()
            .map(PathBuf::from)
            .unwrap_or_else(|| self.workspace_dir().join("skills"))
    }

    pub fn project_dir(&self) -> PathBuf {
        self.workspace
            .project_dir
            .as_ref()
            .map(PathBuf::from)
            .unwrap_or_else(|| self.workspace_dir())
    }
}
