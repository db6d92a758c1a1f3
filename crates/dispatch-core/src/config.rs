use std::path::PathBuf;
use std::time::Duration;

use crate::error::{DispatchError, Result};

pub const DEFAULT_TABLE: &str = "actions";
pub const DEFAULT_CONTAINER: &str = "sandbox";
pub const DEFAULT_WORKDIR: &str = "/root";
pub const DEFAULT_INTERVAL_SECS: u64 = 60;
pub const DEFAULT_RECORD_DELAY: Duration = Duration::from_secs(2);

/// Terminal type exported to every executed command.
pub const COMMAND_TERM: &str = "xterm";

// ---------------------------------------------------------------------------
// StoreConfig
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct StoreConfig {
    /// Base URL of the PostgREST endpoint, without `/rest/v1`.
    pub url: String,
    pub key: String,
    pub table: String,
}

// The key is a credential; keep it out of `{:?}` output.
impl std::fmt::Debug for StoreConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoreConfig")
            .field("url", &self.url)
            .field("key", &"<redacted>")
            .field("table", &self.table)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// BackendConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct BackendConfig {
    /// Name of the already-running container commands are executed in.
    pub container: String,
    pub workdir: String,
    /// Container CLI used to reach the daemon.
    pub docker_bin: PathBuf,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            container: DEFAULT_CONTAINER.to_string(),
            workdir: DEFAULT_WORKDIR.to_string(),
            docker_bin: PathBuf::from("docker"),
        }
    }
}

// ---------------------------------------------------------------------------
// RunMode
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunMode {
    /// A single pass, then exit.
    Once,
    /// Passes forever, `interval` apart, until interrupted.
    Continuous { interval: Duration },
}

// ---------------------------------------------------------------------------
// DispatchConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct DispatchConfig {
    pub store: StoreConfig,
    pub backend: BackendConfig,
    pub mode: RunMode,
    /// Pause after every record, successful or not.
    pub record_delay: Duration,
}

impl DispatchConfig {
    /// Assemble and validate the process configuration.
    ///
    /// `url` and `key` are required; everything else falls back to the
    /// defaults above when `None`.
    pub fn new(
        url: Option<String>,
        key: Option<String>,
        table: Option<String>,
        backend: BackendConfig,
        mode: RunMode,
        record_delay: Duration,
    ) -> Result<Self> {
        let url = required("store url", url)?;
        let key = required("store key", key)?;
        let table = table.unwrap_or_else(|| DEFAULT_TABLE.to_string());

        let config = Self {
            store: StoreConfig {
                url: url.trim_end_matches('/').to_string(),
                key,
                table,
            },
            backend,
            mode,
            record_delay,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if !(self.store.url.starts_with("http://") || self.store.url.starts_with("https://")) {
            return Err(DispatchError::InvalidSetting {
                name: "store url",
                reason: format!("'{}' is not an http(s) URL", self.store.url),
            });
        }
        if self.store.table.trim().is_empty() {
            return Err(invalid("table", "must not be empty"));
        }
        if self.backend.container.trim().is_empty() {
            return Err(invalid("container", "must not be empty"));
        }
        if self.backend.workdir.trim().is_empty() {
            return Err(invalid("workdir", "must not be empty"));
        }
        if let RunMode::Continuous { interval } = self.mode {
            if interval.is_zero() {
                return Err(invalid("interval", "must be at least one second"));
            }
        }
        Ok(())
    }
}

fn required(name: &'static str, value: Option<String>) -> Result<String> {
    match value {
        Some(v) if !v.trim().is_empty() => Ok(v.trim().to_string()),
        _ => Err(DispatchError::MissingSetting(name)),
    }
}

fn invalid(name: &'static str, reason: &str) -> DispatchError {
    DispatchError::InvalidSetting {
        name,
        reason: reason.to_string(),
    }
}
