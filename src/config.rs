//! Daemon configuration.
//!
//! Loaded from `/etc/storaged/storaged.conf` (TOML); every key has a
//! default, so a missing file yields a fully usable configuration.

use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::error;

/// Default location of the configuration file.
pub const CONFIG_FILE: &str = "/etc/storaged/storaged.conf";

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Directory for state that must survive a reboot (the `mounted-fs` and
    /// `mdraid` records).
    pub durable_state_dir: PathBuf,
    /// Directory for state that only survives a daemon restart (the
    /// `unlocked-luks` and `loop` records).
    pub runtime_state_dir: PathBuf,
    /// Root under which the daemon auto-creates mount point directories.
    /// Cleanup refuses to remove directories outside this root.
    pub media_root: PathBuf,
    /// Well-known bus name claimed by the daemon.
    pub bus_name: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            durable_state_dir: PathBuf::from("/var/lib/storaged"),
            runtime_state_dir: PathBuf::from("/run/storaged"),
            media_root: PathBuf::from("/media"),
            bus_name: "org.storaged.Storaged".to_string(),
        }
    }
}

impl Config {
    /// Loads the configuration from `path`.
    ///
    /// A missing file is not an error; defaults are returned instead.
    pub fn load(path: &Path) -> error::Result<Self> {
        let contents = match std::fs::read_to_string(path) {
            Ok(contents) => contents,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Ok(Self::default());
            }
            Err(err) => {
                return Err(crate::Error::Failed(format!(
                    "Error reading configuration file {}: {}",
                    path.display(),
                    err
                )));
            }
        };
        toml::from_str(&contents).map_err(|err| {
            crate::Error::Failed(format!(
                "Error parsing configuration file {}: {}",
                path.display(),
                err
            ))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::load(&dir.path().join("storaged.conf")).unwrap();
        assert_eq!(config, Config::default());
    }

    #[test]
    fn partial_file_keeps_remaining_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("storaged.conf");
        std::fs::write(&path, "media_root = \"/run/media\"\n").unwrap();

        let config = Config::load(&path).unwrap();
        assert_eq!(config.media_root, PathBuf::from("/run/media"));
        assert_eq!(config.bus_name, "org.storaged.Storaged");
    }

    #[test]
    fn invalid_toml_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("storaged.conf");
        std::fs::write(&path, "media_root = [").unwrap();
        assert!(Config::load(&path).is_err());
    }
}
