//! Configuration management for rtunnel

mod backoff;
pub mod serde_utils;
mod tunnel;

pub use backoff::BackoffConfig;
pub use tunnel::{AuthConfig, AuthMethod, TunnelConfig, DEFAULT_HALF_CLOSE_TIMEOUT};

use crate::error::ConfigError;
use std::path::{Path, PathBuf};

/// Get the default configuration directory
pub fn default_config_dir() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("rtunnel")
}

/// Get the default configuration file path
pub fn default_config_path() -> PathBuf {
    default_config_dir().join("tunnel.toml")
}

/// Load configuration from a TOML file
pub fn load_config<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T, ConfigError> {
    if !path.exists() {
        return Err(ConfigError::NotFound(path.to_path_buf()));
    }

    let content = std::fs::read_to_string(path)
        .map_err(|e| ConfigError::Invalid(format!("Failed to read config: {}", e)))?;

    let config: T = toml::from_str(&content)?;
    Ok(config)
}

/// Expand a leading `~` to the current user's home directory.
///
/// Paths without a `~` prefix, and all paths when no home directory can be
/// determined, are returned unchanged.
pub fn expand_home(path: &Path) -> PathBuf {
    match path.strip_prefix("~") {
        Ok(rest) => match dirs::home_dir() {
            Some(home) => home.join(rest),
            None => path.to_path_buf(),
        },
        Err(_) => path.to_path_buf(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_expand_home() {
        let home = match dirs::home_dir() {
            Some(home) => home,
            None => return,
        };
        assert_eq!(expand_home(Path::new("~/.ssh/id_ed25519")), home.join(".ssh/id_ed25519"));
        assert_eq!(expand_home(Path::new("~")), home);
    }

    #[test]
    fn test_expand_home_leaves_other_paths() {
        assert_eq!(expand_home(Path::new("/etc/key")), PathBuf::from("/etc/key"));
        assert_eq!(expand_home(Path::new("keys/~id")), PathBuf::from("keys/~id"));
    }

    #[test]
    fn test_load_config_missing_file() {
        let result = load_config::<TunnelConfig>(Path::new("/nonexistent/tunnel.toml"));
        assert!(matches!(result, Err(ConfigError::NotFound(_))));
    }

    #[test]
    fn test_load_config_from_toml() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
relay_host = "relay.example"
ssh_user = "tunnel"
public_port = 9009
local_target_port = 9001
reconnect_delay = 10

[auth]
password = "p"
"#
        )
        .unwrap();

        let config: TunnelConfig = load_config(file.path()).unwrap();
        assert_eq!(config.relay_host, "relay.example");
        assert_eq!(config.relay_ssh_port, 22);
        assert_eq!(config.reconnect_delay, std::time::Duration::from_secs(10));
        assert_eq!(config.auth.password.as_deref(), Some("p"));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_load_config_rejects_bad_toml() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "relay_host = ").unwrap();
        let result = load_config::<TunnelConfig>(file.path());
        assert!(matches!(result, Err(ConfigError::Parse(_))));
    }
}
