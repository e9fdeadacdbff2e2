use derive_new::new;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ExecMode {
    #[default]
    Sync,
    /// Copies are ordered on the execution stream instead of blocking the host.
    Async,
}

/// Where the model is in its lifecycle when arguments are refreshed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ExecutionStage {
    /// The first execution after load. Always fully initialises and copies synchronously.
    Load,
    Run,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, new)]
#[serde(default)]
pub struct ArgsConfig {
    /// Feature map bases may move between executions.
    pub fm_refreshable: bool,
    pub exec_mode: ExecMode,
    pub kernel_refresh: bool,
    /// Dynamic argument bytes above which the refresh kernel is used.
    pub kernel_refresh_min_bytes: u64,
    pub max_refresh_cores: u32,
    pub dump_enabled: bool,
}

impl Default for ArgsConfig {
    fn default() -> Self {
        Self {
            fm_refreshable: true,
            exec_mode: ExecMode::Sync,
            kernel_refresh: true,
            kernel_refresh_min_bytes: 64 * 1024,
            max_refresh_cores: 48,
            dump_enabled: false,
        }
    }
}

impl ArgsConfig {
    pub fn from_env() -> Self {
        Self::default().with_env_overrides()
    }

    pub fn with_env_overrides(mut self) -> Self {
        if std::env::var("ARGTABLE_DISABLE_KERNEL_REFRESH").is_ok() {
            log::warn!("Disabling kernel argument refresh");
            self.kernel_refresh = false;
        }
        if std::env::var("ARGTABLE_FORCE_SYNC_COPY").is_ok() {
            log::warn!("Forcing synchronous argument copies");
            self.exec_mode = ExecMode::Sync;
        }
        if std::env::var("ARGTABLE_DUMP").is_ok() {
            log::warn!("Enabling argument dumps");
            self.dump_enabled = true;
        }
        self
    }

    pub fn is_async(&self) -> bool {
        self.exec_mode == ExecMode::Async
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_json_keeps_defaults() -> anyhow::Result<()> {
        let config: ArgsConfig =
            serde_json::from_str(r#"{ "exec_mode": "Async", "kernel_refresh": false }"#)?;
        assert!(config.is_async());
        assert!(!config.kernel_refresh);
        assert_eq!(config.kernel_refresh_min_bytes, 64 * 1024);
        assert_eq!(config.max_refresh_cores, 48);
        Ok(())
    }
}
