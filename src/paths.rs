//! Centralized path resolution for fleet
//!
//! # Environment Variables
//!
//! - `FLEET_CONFIG_DIR` - Override config directory
//! - `FLEET_STATE_DIR` - Override state directory (where the simulated cloud lives)
//!
//! # Path Resolution Priority
//!
//! For config_dir():
//! 1. `FLEET_CONFIG_DIR` environment variable
//! 2. `XDG_CONFIG_HOME/fleet` (if set)
//! 3. Platform default:
//!    - Windows: `%APPDATA%\fleet`
//!    - macOS/Linux: `~/.config/fleet`
//!
//! For state_dir():
//! 1. `FLEET_STATE_DIR` environment variable
//! 2. `XDG_STATE_HOME/fleet` (if set)
//! 3. Platform default:
//!    - Windows: `%LOCALAPPDATA%\fleet`
//!    - macOS/Linux: `~/.local/state/fleet`

use anyhow::{Context, Result};
use std::path::PathBuf;

/// Environment variable for config directory override
pub const ENV_CONFIG_DIR: &str = "FLEET_CONFIG_DIR";

/// Environment variable for state directory override
pub const ENV_STATE_DIR: &str = "FLEET_STATE_DIR";

const APP_DIR: &str = "fleet";

/// File name of the simulated cloud inside the state directory
pub const CLOUD_FILE: &str = "cloud.json";

/// Get the fleet config directory path
pub fn config_dir() -> Result<PathBuf> {
    if let Ok(dir) = std::env::var(ENV_CONFIG_DIR) {
        let path = expand(&dir);
        log::debug!(
            "Using config dir from {}: {}",
            ENV_CONFIG_DIR,
            path.display()
        );
        return Ok(path);
    }

    if let Ok(xdg_config) = std::env::var("XDG_CONFIG_HOME") {
        let path = PathBuf::from(xdg_config).join(APP_DIR);
        log::debug!("Using XDG_CONFIG_HOME: {}", path.display());
        return Ok(path);
    }

    #[cfg(windows)]
    {
        if let Some(app_data) = dirs::config_dir() {
            let path = app_data.join(APP_DIR);
            log::debug!("Using Windows config dir: {}", path.display());
            return Ok(path);
        }
    }

    let home = dirs::home_dir().context("Could not determine home directory")?;
    let path = home.join(".config").join(APP_DIR);
    log::debug!("Using default config dir: {}", path.display());
    Ok(path)
}

/// Get the fleet state directory path
pub fn state_dir() -> Result<PathBuf> {
    if let Ok(dir) = std::env::var(ENV_STATE_DIR) {
        let path = expand(&dir);
        log::debug!("Using state dir from {}: {}", ENV_STATE_DIR, path.display());
        return Ok(path);
    }

    if let Ok(xdg_state) = std::env::var("XDG_STATE_HOME") {
        let path = PathBuf::from(xdg_state).join(APP_DIR);
        log::debug!("Using XDG_STATE_HOME: {}", path.display());
        return Ok(path);
    }

    #[cfg(windows)]
    {
        if let Some(local_app_data) = dirs::data_local_dir() {
            let path = local_app_data.join(APP_DIR);
            log::debug!("Using Windows state dir: {}", path.display());
            return Ok(path);
        }
    }

    let home = dirs::home_dir().context("Could not determine home directory")?;
    let path = home.join(".local").join("state").join(APP_DIR);
    log::debug!("Using default state dir: {}", path.display());
    Ok(path)
}

/// Default location of the simulated cloud
pub fn default_cloud_file() -> Result<PathBuf> {
    Ok(state_dir()?.join(CLOUD_FILE))
}

/// Expand ~ and environment variables in a path string.
pub fn expand(path: &str) -> PathBuf {
    let expanded = shellexpand::full(path).unwrap_or(std::borrow::Cow::Borrowed(path));
    PathBuf::from(expanded.as_ref())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;

    /// Run `f` with `key` set to `value`
    ///
    /// # Safety
    /// Uses unsafe env::set_var/remove_var. Only use in single-threaded
    /// test contexts.
    fn with_env_var<F, R>(key: &str, value: &str, f: F) -> R
    where
        F: FnOnce() -> R,
    {
        let original = env::var(key).ok();
        // SAFETY: Tests run in isolation and don't read env vars concurrently
        unsafe { env::set_var(key, value) };
        let result = f();
        match original {
            // SAFETY: Tests run in isolation
            Some(v) => unsafe { env::set_var(key, v) },
            None => unsafe { env::remove_var(key) },
        }
        result
    }

    fn without_env_var<F, R>(key: &str, f: F) -> R
    where
        F: FnOnce() -> R,
    {
        let original = env::var(key).ok();
        // SAFETY: Tests run in isolation and don't read env vars concurrently
        unsafe { env::remove_var(key) };
        let result = f();
        if let Some(v) = original {
            // SAFETY: Tests run in isolation
            unsafe { env::set_var(key, v) };
        }
        result
    }

    #[test]
    fn test_config_dir_env_override() {
        with_env_var(ENV_CONFIG_DIR, "/custom/fleet/config", || {
            assert_eq!(config_dir().unwrap(), PathBuf::from("/custom/fleet/config"));
        });
    }

    #[test]
    fn test_state_dir_env_override_with_tilde() {
        let home = dirs::home_dir().unwrap();
        with_env_var(ENV_STATE_DIR, "~/fleet-state-test", || {
            assert_eq!(state_dir().unwrap(), home.join("fleet-state-test"));
        });
    }

    #[test]
    fn test_xdg_state_home() {
        without_env_var(ENV_STATE_DIR, || {
            with_env_var("XDG_STATE_HOME", "/tmp/xdg-fleet-test", || {
                assert_eq!(
                    default_cloud_file().unwrap(),
                    PathBuf::from("/tmp/xdg-fleet-test/fleet/cloud.json")
                );
            });
        });
    }

    #[test]
    fn test_expand_with_env_var() {
        with_env_var("FLEET_TEST_VAR", "test_value", || {
            let result = expand("/path/$FLEET_TEST_VAR/file");
            assert_eq!(result, PathBuf::from("/path/test_value/file"));
        });
    }

    #[test]
    fn test_expand_absolute() {
        assert_eq!(expand("/absolute/path"), PathBuf::from("/absolute/path"));
    }
}
