//! Configuration loading from `copilot.toml` with defaults.
//!
//! Lookup order when no path is given: `./copilot.toml`, then
//! `<config dir>/copilot/copilot.toml`.

use copilot_types::config::CopilotConfig;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// File name looked up in the working directory.
pub const CONFIG_FILE: &str = "copilot.toml";

/// Load node configuration from a TOML file, with defaults.
///
/// A missing file yields the defaults. A file that cannot be read or
/// parsed is reported and also yields the defaults.
pub fn load_config(path: Option<&Path>) -> CopilotConfig {
    let config_path = path
        .map(|p| p.to_path_buf())
        .unwrap_or_else(default_config_path);

    if !config_path.exists() {
        debug!(path = %config_path.display(), "No config file, using defaults");
        return CopilotConfig::default();
    }

    match std::fs::read_to_string(&config_path) {
        Ok(contents) => match toml::from_str::<CopilotConfig>(&contents) {
            Ok(config) => {
                info!(path = %config_path.display(), "Loaded configuration");
                config
            }
            Err(e) => {
                warn!(
                    error = %e,
                    path = %config_path.display(),
                    "Failed to parse config, using defaults"
                );
                CopilotConfig::default()
            }
        },
        Err(e) => {
            warn!(
                error = %e,
                path = %config_path.display(),
                "Failed to read config file, using defaults"
            );
            CopilotConfig::default()
        }
    }
}

/// `./copilot.toml` when it exists, otherwise the per-user location.
pub fn default_config_path() -> PathBuf {
    let local = PathBuf::from(CONFIG_FILE);
    if local.exists() {
        return local;
    }
    dirs::config_dir()
        .map(|dir| dir.join("copilot").join(CONFIG_FILE))
        .unwrap_or(local)
}
