//! Server configuration stored in a TOML file (`labproxy-server.toml`).

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};

use crate::core::registry;

/// Default listening port.
pub const DEFAULT_PORT: u16 = 8084;

/// Server configuration (TOML).
///
/// Missing fields fall back to defaults, so an empty file (or no file at all)
/// yields a server that listens on `0.0.0.0:8084` and allows every registered
/// command.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ServerConfig {
    /// Address to bind.
    pub bind: String,

    pub port: u16,

    /// Directory under which per-request workspaces are created.
    /// Defaults to the system temp directory.
    pub workspace_root: Option<PathBuf>,

    /// Directory holding the device tools. Commands without an explicit
    /// `path` resolve to `<tool_dir>/<name>`, or to `PATH` when unset.
    pub tool_dir: Option<PathBuf>,

    /// Kill commands that run longer than this. No limit when unset.
    pub command_timeout_secs: Option<u64>,

    /// Allow-list. Only commands named here are executed.
    pub commands: BTreeMap<String, CommandConfig>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct CommandConfig {
    /// Explicit executable for this command.
    pub path: Option<PathBuf>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0".to_string(),
            port: DEFAULT_PORT,
            workspace_root: None,
            tool_dir: None,
            command_timeout_secs: None,
            commands: registry::commands()
                .iter()
                .map(|spec| (spec.name.to_string(), CommandConfig::default()))
                .collect(),
        }
    }
}

impl ServerConfig {
    pub fn validate(&self) -> Result<()> {
        if self.bind.trim().is_empty() {
            return Err(anyhow!("bind must not be empty"));
        }
        if self.command_timeout_secs == Some(0) {
            return Err(anyhow!("command_timeout_secs must be > 0"));
        }
        if self.commands.is_empty() {
            return Err(anyhow!("commands must allow at least one command"));
        }
        for (name, command) in &self.commands {
            if registry::lookup(name).is_none() {
                return Err(anyhow!("commands.{name}: not a supported command"));
            }
            if command
                .path
                .as_ref()
                .is_some_and(|path| path.as_os_str().is_empty())
            {
                return Err(anyhow!("commands.{name}.path must not be empty"));
            }
        }
        Ok(())
    }

    pub fn is_allowed(&self, name: &str) -> bool {
        self.commands.contains_key(name)
    }

    /// Executable launched for `name`.
    pub fn executable(&self, name: &str) -> PathBuf {
        if let Some(path) = self.commands.get(name).and_then(|cmd| cmd.path.clone()) {
            return path;
        }
        match &self.tool_dir {
            Some(dir) => dir.join(name),
            None => PathBuf::from(name),
        }
    }

    pub fn command_timeout(&self) -> Option<Duration> {
        self.command_timeout_secs.map(Duration::from_secs)
    }

    pub fn workspace_root(&self) -> PathBuf {
        self.workspace_root
            .clone()
            .unwrap_or_else(std::env::temp_dir)
    }

    /// Socket address string for the listener.
    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }
}

/// Load config from a TOML file.
///
/// If the file is missing, returns `ServerConfig::default()`.
pub fn load_config(path: &Path) -> Result<ServerConfig> {
    if !path.exists() {
        let cfg = ServerConfig::default();
        cfg.validate()?;
        return Ok(cfg);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: ServerConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()?;
    Ok(cfg)
}
