//! Daemon configuration.
//!
//! Configuration is read from `~/.remotecode/config`, a flat `KEY=value` file
//! with `#` comments. Environment variables with the same names override file
//! values, so a one-off `REMOTECODE_YOLO=true remotecode` works without
//! editing the file.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("config file not found at {path}")]
    NotFound { path: PathBuf },

    #[error("missing required key: {key}")]
    MissingKey { key: &'static str },

    #[error("I/O error reading config: {0}")]
    Io(#[from] std::io::Error),
}

pub type ConfigResult<T> = std::result::Result<T, ConfigError>;

/// A user allowed to talk to the daemon: a numeric Telegram id or a
/// `@username` handle.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AllowedUser {
    Id(i64),
    Username(String),
}

impl AllowedUser {
    pub fn matches(&self, id: i64, username: Option<&str>) -> bool {
        match self {
            Self::Id(allowed) => *allowed == id,
            Self::Username(allowed) => username.is_some_and(|u| u.eq_ignore_ascii_case(allowed)),
        }
    }
}

/// Resolved daemon configuration.
#[derive(Clone, Debug)]
pub struct Config {
    /// Base state directory, `~/.remotecode` by default.
    pub state_dir: PathBuf,
    pub bot_token: String,
    pub allowed_users: Vec<AllowedUser>,
    /// Daemon-wide auto-allow of every tool invocation.
    pub yolo: bool,
    pub verbose: bool,
    /// Initial auto-sync toggle; `/sync` flips the persisted copy.
    pub auto_sync: bool,
}

impl Config {
    /// Load from the default state directory.
    pub fn load() -> ConfigResult<Self> {
        let state_dir = default_state_dir();
        Self::load_from(&state_dir)
    }

    /// Load from an explicit state directory (used by tests).
    pub fn load_from(state_dir: &Path) -> ConfigResult<Self> {
        let path = state_dir.join("config");
        let mut values = if path.exists() {
            parse_kv_file(&std::fs::read_to_string(&path)?)
        } else {
            HashMap::new()
        };

        // Environment overrides file.
        for key in [
            "TELEGRAM_BOT_TOKEN",
            "REMOTECODE_ALLOWED_USERS",
            "REMOTECODE_YOLO",
            "REMOTECODE_VERBOSE",
            "REMOTECODE_AUTO_SYNC",
        ] {
            if let Ok(v) = std::env::var(key) {
                values.insert(key.to_string(), v);
            }
        }

        let bot_token = values
            .get("TELEGRAM_BOT_TOKEN")
            .filter(|v| !v.is_empty())
            .cloned()
            .ok_or(ConfigError::MissingKey {
                key: "TELEGRAM_BOT_TOKEN",
            })?;

        let allowed_raw = values
            .get("REMOTECODE_ALLOWED_USERS")
            .filter(|v| !v.trim().is_empty())
            .cloned()
            .ok_or(ConfigError::MissingKey {
                key: "REMOTECODE_ALLOWED_USERS",
            })?;

        Ok(Self {
            state_dir: state_dir.to_path_buf(),
            bot_token,
            allowed_users: parse_allowed_users(&allowed_raw),
            yolo: is_truthy(values.get("REMOTECODE_YOLO")),
            verbose: is_truthy(values.get("REMOTECODE_VERBOSE")),
            auto_sync: values
                .get("REMOTECODE_AUTO_SYNC")
                .is_some_and(|v| v.trim().eq_ignore_ascii_case("on")),
        })
    }

    pub fn pid_file(&self) -> PathBuf {
        self.state_dir.join("remotecode.pid")
    }

    pub fn log_file(&self) -> PathBuf {
        self.state_dir.join("remotecode.log")
    }

    pub fn registry_file(&self) -> PathBuf {
        self.state_dir.join("local")
    }

    pub fn is_user_allowed(&self, id: i64, username: Option<&str>) -> bool {
        self.allowed_users.iter().any(|u| u.matches(id, username))
    }
}

pub fn default_state_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".remotecode")
}

fn parse_kv_file(content: &str) -> HashMap<String, String> {
    let mut map = HashMap::new();
    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        if let Some((key, value)) = line.split_once('=') {
            map.insert(key.trim().to_string(), value.trim().to_string());
        }
    }
    map
}

fn parse_allowed_users(raw: &str) -> Vec<AllowedUser> {
    raw.split(|c: char| c == ',' || c.is_whitespace())
        .filter(|s| !s.is_empty())
        .filter_map(|s| {
            if let Some(name) = s.strip_prefix('@') {
                Some(AllowedUser::Username(name.to_string()))
            } else {
                s.parse::<i64>().ok().map(AllowedUser::Id)
            }
        })
        .collect()
}

fn is_truthy(value: Option<&String>) -> bool {
    value.is_some_and(|v| {
        matches!(
            v.trim().to_ascii_lowercase().as_str(),
            "1" | "true" | "yes" | "on"
        )
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_config(dir: &Path, body: &str) {
        std::fs::create_dir_all(dir).unwrap();
        std::fs::write(dir.join("config"), body).unwrap();
    }

    #[test]
    fn test_parse_kv_skips_comments() {
        let map = parse_kv_file("# comment\nA=1\n\nB = two\n");
        assert_eq!(map.get("A").map(String::as_str), Some("1"));
        assert_eq!(map.get("B").map(String::as_str), Some("two"));
        assert_eq!(map.len(), 2);
    }

    #[test]
    fn test_allowed_users_mixed() {
        let users = parse_allowed_users("12345, @alice 67890");
        assert_eq!(users.len(), 3);
        assert!(users[0].matches(12345, None));
        assert!(users[1].matches(0, Some("Alice")));
        assert!(!users[1].matches(0, Some("bob")));
        assert!(users[2].matches(67890, Some("whoever")));
    }

    #[test]
    fn test_load_requires_token() {
        let dir = tempfile::tempdir().unwrap();
        write_config(dir.path(), "REMOTECODE_ALLOWED_USERS=1\n");
        let err = Config::load_from(dir.path()).unwrap_err();
        assert!(matches!(
            err,
            ConfigError::MissingKey {
                key: "TELEGRAM_BOT_TOKEN"
            }
        ));
    }

    #[test]
    fn test_load_full() {
        let dir = tempfile::tempdir().unwrap();
        write_config(
            dir.path(),
            "TELEGRAM_BOT_TOKEN=123:abc\n\
             REMOTECODE_ALLOWED_USERS=42 @bob\n\
             REMOTECODE_YOLO=true\n\
             REMOTECODE_AUTO_SYNC=on\n",
        );
        let config = Config::load_from(dir.path()).unwrap();
        assert_eq!(config.bot_token, "123:abc");
        assert!(config.yolo);
        assert!(config.auto_sync);
        assert!(!config.verbose);
        assert!(config.is_user_allowed(42, None));
        assert!(config.is_user_allowed(7, Some("BOB")));
        assert!(!config.is_user_allowed(7, Some("mallory")));
    }
}
