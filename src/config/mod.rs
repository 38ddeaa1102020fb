use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::plugin::CommandPlugin;

/// Default cap for the server console buffer, in bytes.
pub const MAX_LOG_SIZE_BYTES: usize = 1_000_000;

/// Grace period after cancellation before the server is force-killed.
pub const DEFAULT_STOP_GRACE_MS: u64 = 10_000;

/// Hard ceiling for a stop request, measured from the same instant as the grace period.
pub const DEFAULT_STOP_TIMEOUT_MS: u64 = 20_000;

/// Static supervisor configuration, fixed for the lifetime of a `ServerProcess`.
#[derive(Deserialize, Debug, Clone)]
#[serde(default)]
pub struct SupervisorConfig {
    /// Server install directory. Also the main process's working directory.
    pub server_install_path: PathBuf,
    /// Server executable. Relative paths are resolved against `server_install_path`.
    pub executable_path: PathBuf,
    pub executable_args: Vec<String>,
    /// Extra environment variables for the server process
    pub environment: BTreeMap<String, String>,
    /// Auxiliary executables started alongside every session
    pub plugins: Vec<CommandPlugin>,
    /// Deprecated: whitespace separated command lines. Use `plugins` instead.
    pub run_on_start: Vec<String>,
    pub stop_grace_ms: u64,
    pub stop_timeout_ms: u64,
    pub log_buffer_size: usize,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            server_install_path: PathBuf::from("."),
            executable_path: PathBuf::from(default_executable_name()),
            executable_args: Vec::new(),
            environment: BTreeMap::new(),
            plugins: Vec::new(),
            run_on_start: Vec::new(),
            stop_grace_ms: DEFAULT_STOP_GRACE_MS,
            stop_timeout_ms: DEFAULT_STOP_TIMEOUT_MS,
            log_buffer_size: MAX_LOG_SIZE_BYTES,
        }
    }
}

#[cfg(target_os = "windows")]
fn default_executable_name() -> &'static str {
    "acServer.exe"
}

#[cfg(not(target_os = "windows"))]
fn default_executable_name() -> &'static str {
    "acServer"
}

impl SupervisorConfig {
    pub fn new(server_install_path: impl Into<PathBuf>, executable_path: impl Into<PathBuf>) -> Self {
        Self {
            server_install_path: server_install_path.into(),
            executable_path: executable_path.into(),
            ..Self::default()
        }
    }

    /// Load from a TOML file. A missing file yields the defaults.
    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            tracing::info!("Config file {} does not exist, using defaults", path.display());
            return Ok(Self::default());
        }
        let s = std::fs::read_to_string(path)?;
        Self::from_toml(&s)
    }

    pub fn from_toml(s: &str) -> anyhow::Result<Self> {
        toml::from_str(s).map_err(|e| anyhow::anyhow!("Invalid supervisor config: {}", e))
    }

    /// Absolute executables are used as-is, relative ones live under the install directory.
    pub fn resolve_executable(&self) -> PathBuf {
        if self.executable_path.is_absolute() {
            self.executable_path.clone()
        } else {
            self.server_install_path.join(&self.executable_path)
        }
    }

    pub fn stop_grace(&self) -> Duration {
        Duration::from_millis(self.stop_grace_ms)
    }

    pub fn stop_timeout(&self) -> Duration {
        Duration::from_millis(self.stop_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let cfg = SupervisorConfig::default();
        assert_eq!(cfg.stop_grace(), Duration::from_secs(10));
        assert_eq!(cfg.stop_timeout(), Duration::from_secs(20));
        assert_eq!(cfg.log_buffer_size, 1_000_000);
        assert!(cfg.plugins.is_empty());
    }

    #[test]
    fn test_resolve_relative_executable() {
        let cfg = SupervisorConfig::new("/srv/assetto", "acServer");
        assert_eq!(cfg.resolve_executable(), PathBuf::from("/srv/assetto/acServer"));
    }

    #[test]
    fn test_resolve_absolute_executable() {
        let exe = std::env::temp_dir().join("custom").join("acServer");
        let cfg = SupervisorConfig::new("/srv/assetto", exe.clone());
        assert_eq!(cfg.resolve_executable(), exe);
    }

    #[test]
    fn test_parse_toml() {
        let cfg = SupervisorConfig::from_toml(
            r#"
            server_install_path = "/srv/assetto"
            executable_path = "acServer"
            run_on_start = ["./stracker/stracker_linux_x86/stracker --stracker_ini stracker.ini"]
            stop_grace_ms = 500

            [environment]
            STEAM_RUNTIME = "1"

            [[plugins]]
            executable = "plugins/kissmyrank/kissmyrank"
            arguments = ["--config", "kmr.json"]
            "#,
        )
        .unwrap();

        assert_eq!(cfg.server_install_path, PathBuf::from("/srv/assetto"));
        assert_eq!(cfg.stop_grace(), Duration::from_millis(500));
        // 지정하지 않은 값은 기본값 유지
        assert_eq!(cfg.stop_timeout(), Duration::from_secs(20));
        assert_eq!(cfg.environment.get("STEAM_RUNTIME").map(String::as_str), Some("1"));
        assert_eq!(cfg.plugins.len(), 1);
        assert_eq!(cfg.plugins[0].arguments, vec!["--config", "kmr.json"]);
        assert_eq!(cfg.run_on_start.len(), 1);
    }

    #[test]
    fn test_parse_invalid_toml() {
        assert!(SupervisorConfig::from_toml("stop_grace_ms = \"soon\"").is_err());
    }

    #[test]
    fn test_load_missing_file_uses_defaults() {
        let cfg = SupervisorConfig::load("/nonexistent/race-supervisor.toml").unwrap();
        assert_eq!(cfg.stop_grace_ms, DEFAULT_STOP_GRACE_MS);
    }
}
