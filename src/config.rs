use anyhow::Error;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Server configuration, loaded from `config.ron` in the working directory.
/// Every field has a default so a missing file still boots a usable server.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct Config {
    pub bind_addr: String,
    pub firmware_dir: PathBuf,
    pub admin: Credentials,
    /// Watchdog scan interval, seconds.
    pub watchdog_interval_secs: u64,
    /// Rollout auto-expand tick, seconds. 0 disables the expander task.
    pub rollout_tick_secs: u64,
    /// Pending-command expiry sweep interval, seconds.
    pub command_sweep_secs: u64,
    /// Concurrent update-queue task limit.
    pub queue_concurrency: usize,
    /// Outbound frames buffered per WebSocket subscriber before drops.
    pub ws_queue_depth: usize,
    /// `check` requests allowed per device per minute.
    pub check_rate_per_minute: u32,
    /// Firmware downloads allowed per minute across the fleet.
    pub download_rate_per_minute: u32,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            bind_addr: "0.0.0.0:3000".into(),
            firmware_dir: PathBuf::from("firmware"),
            admin: Credentials {
                username: "admin".into(),
                password: "admin".into(),
            },
            watchdog_interval_secs: 60,
            rollout_tick_secs: 60,
            command_sweep_secs: 60,
            queue_concurrency: 5,
            ws_queue_depth: 64,
            check_rate_per_minute: 30,
            download_rate_per_minute: 5,
        }
    }
}

impl Config {
    pub fn load() -> Result<Config, Error> {
        Config::load_from(Path::new("config.ron"))
    }

    pub fn load_from(path: &Path) -> Result<Config, Error> {
        if !path.exists() {
            return Ok(Config::default());
        }
        let contents = std::fs::read_to_string(path)?;
        let config: Config = ron::from_str(&contents)?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.ron");
        std::fs::write(
            &path,
            r#"(
    bind_addr: "127.0.0.1:8080",
    queue_concurrency: 2,
    admin: (
        username: "ops",
        password: "hunter2",
    ),
)"#,
        )
        .unwrap();

        let config = Config::load_from(&path).unwrap();
        assert_eq!(config.bind_addr, "127.0.0.1:8080");
        assert_eq!(config.queue_concurrency, 2);
        assert_eq!(config.admin.username, "ops");
        // Unset fields fall back to defaults.
        assert_eq!(config.check_rate_per_minute, 30);
    }

    #[test]
    fn test_missing_file_falls_back_to_defaults() {
        let config = Config::load_from(Path::new("/nonexistent/config.ron")).unwrap();
        assert_eq!(config, Config::default());
    }
}
