use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

use crate::model::{Provider, SyncDirection};
use crate::sync::ConflictStrategy;

const CONFIG_DIR_NAME: &str = "tasksync";
const CONFIG_FILE_NAME: &str = "config.yaml";
const DEFAULT_TASKS_DIR: &str = "~/tasks";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error reading {path}: {source}")]
    Io { path: PathBuf, source: io::Error },
    #[error("invalid configuration: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("{provider}.{field}: {reason}")]
    Invalid {
        provider: Provider,
        field: &'static str,
        reason: String,
    },
    #[error("home directory is unavailable")]
    MissingHomeDir,
}

/// Settings for one provider, with the defaults applied to any key the
/// YAML leaves out.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ProviderConfig {
    pub enabled: bool,
    pub conflict_strategy: ConflictStrategy,
    pub sync_direction: SyncDirection,
    /// Local project name to remote project id.
    pub project_mappings: BTreeMap<String, String>,
    /// Seconds to wait between two calls to the provider.
    pub rate_limit_delay: f64,
    /// Attempts per call when the provider is unavailable, including the first.
    pub max_retries: u32,
    pub timeout_seconds: u64,
    pub sync_completed_tasks: bool,
    pub base_url: Option<String>,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            conflict_strategy: ConflictStrategy::NewestWins,
            sync_direction: SyncDirection::Bidirectional,
            project_mappings: BTreeMap::new(),
            rate_limit_delay: 1.2,
            max_retries: 3,
            timeout_seconds: 30,
            sync_completed_tasks: true,
            base_url: None,
        }
    }
}

impl ProviderConfig {
    pub fn rate_limit_delay(&self) -> Duration {
        Duration::from_secs_f64(self.rate_limit_delay)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds)
    }

    pub fn validate(&self, provider: Provider) -> Result<(), ConfigError> {
        let invalid = |field, reason: &str| ConfigError::Invalid {
            provider,
            field,
            reason: reason.to_string(),
        };
        if !self.rate_limit_delay.is_finite() || self.rate_limit_delay < 0.0 {
            return Err(invalid(
                "rate_limit_delay",
                "must be a non-negative number of seconds",
            ));
        }
        if self.timeout_seconds == 0 {
            return Err(invalid("timeout_seconds", "must be greater than zero"));
        }
        if self.max_retries == 0 {
            return Err(invalid("max_retries", "must allow at least one attempt"));
        }
        if let Some(base_url) = &self.base_url
            && url::Url::parse(base_url).is_err()
        {
            return Err(invalid("base_url", "is not a valid URL"));
        }
        if let Some((local, _)) = self
            .project_mappings
            .iter()
            .find(|(local, remote)| local.trim().is_empty() || remote.trim().is_empty())
        {
            return Err(ConfigError::Invalid {
                provider,
                field: "project_mappings",
                reason: format!("empty project name or id in mapping for {local:?}"),
            });
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawConfig {
    #[serde(default)]
    tasks_dir: Option<String>,
    #[serde(default)]
    database_path: Option<String>,
    #[serde(default)]
    providers: BTreeMap<Provider, ProviderConfig>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    pub tasks_dir: PathBuf,
    /// `None` means the default location under the XDG data directory.
    pub database_path: Option<PathBuf>,
    pub providers: BTreeMap<Provider, ProviderConfig>,
}

impl Config {
    /// Reads the config file named by `TASKSYNC_CONFIG`, or the default one.
    /// A missing default file yields the built-in defaults.
    pub fn load() -> Result<Self, ConfigError> {
        let home = dirs::home_dir().ok_or(ConfigError::MissingHomeDir)?;
        let mut config = match std::env::var("TASKSYNC_CONFIG") {
            Ok(path) => Self::from_file(&expand_with_home(&path, &home), &home)?,
            Err(_) => {
                let path = default_config_path(&home);
                if path.exists() {
                    Self::from_file(&path, &home)?
                } else {
                    Self::from_yaml_str("{}", &home)?
                }
            }
        };
        config.apply_env_overrides(&home);
        Ok(config)
    }

    pub fn from_file(path: &Path, home: &Path) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_yaml_str(&content, home)
    }

    pub fn from_yaml_str(content: &str, home: &Path) -> Result<Self, ConfigError> {
        let raw: RawConfig = serde_yaml::from_str(content)?;
        let mut providers = raw.providers;
        if providers.is_empty() {
            providers.insert(Provider::Todoist, ProviderConfig::default());
        }
        for (provider, settings) in &providers {
            settings.validate(*provider)?;
        }
        Ok(Self {
            tasks_dir: expand_with_home(
                raw.tasks_dir.as_deref().unwrap_or(DEFAULT_TASKS_DIR),
                home,
            ),
            database_path: raw
                .database_path
                .map(|value| expand_with_home(&value, home)),
            providers,
        })
    }

    fn apply_env_overrides(&mut self, home: &Path) {
        if let Ok(value) = std::env::var("TASKSYNC_TASKS_DIR") {
            self.tasks_dir = expand_with_home(&value, home);
        }
        if let Ok(value) = std::env::var("TASKSYNC_DB") {
            self.database_path = Some(expand_with_home(&value, home));
        }
    }

    pub fn enabled_providers(&self) -> impl Iterator<Item = (Provider, &ProviderConfig)> {
        self.providers
            .iter()
            .filter(|(_, settings)| settings.enabled)
            .map(|(provider, settings)| (*provider, settings))
    }
}

fn default_config_path(home: &Path) -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| home.join(".config"))
        .join(CONFIG_DIR_NAME)
        .join(CONFIG_FILE_NAME)
}

fn expand_with_home(value: &str, home: &Path) -> PathBuf {
    if value == "~" {
        return home.to_path_buf();
    }
    if let Some(rest) = value.strip_prefix("~/") {
        return home.join(rest);
    }
    PathBuf::from(value)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn home() -> PathBuf {
        PathBuf::from("/tmp/home-user")
    }

    #[test]
    fn empty_config_enables_todoist_with_defaults() {
        let config = Config::from_yaml_str("{}", &home()).unwrap();
        assert_eq!(config.tasks_dir, PathBuf::from("/tmp/home-user/tasks"));
        assert_eq!(config.database_path, None);
        assert_eq!(
            config.providers.get(&Provider::Todoist),
            Some(&ProviderConfig::default())
        );
    }

    #[test]
    fn parses_provider_settings() {
        let yaml = r#"
tasks_dir: ~/notes/tasks
database_path: /var/lib/tasksync/sync.db
providers:
  todoist:
    conflict_strategy: merge
    sync_direction: push_only
    rate_limit_delay: 0.5
    project_mappings:
      Work: "2203306141"
  apple_reminders:
    enabled: false
"#;
        let config = Config::from_yaml_str(yaml, &home()).unwrap();
        let todoist = &config.providers[&Provider::Todoist];

        assert_eq!(config.tasks_dir, PathBuf::from("/tmp/home-user/notes/tasks"));
        assert_eq!(
            config.database_path,
            Some(PathBuf::from("/var/lib/tasksync/sync.db"))
        );
        assert_eq!(todoist.conflict_strategy, ConflictStrategy::Merge);
        assert_eq!(todoist.sync_direction, SyncDirection::PushOnly);
        assert_eq!(todoist.rate_limit_delay(), Duration::from_millis(500));
        assert_eq!(todoist.max_retries, 3);
        assert_eq!(todoist.project_mappings["Work"], "2203306141");
        let enabled: Vec<_> = config.enabled_providers().map(|(p, _)| p).collect();
        assert_eq!(enabled, vec![Provider::Todoist]);
    }

    #[test]
    fn rejects_unknown_strategy_and_keys() {
        let bad_strategy = "providers:\n  todoist:\n    conflict_strategy: coin_flip\n";
        assert!(matches!(
            Config::from_yaml_str(bad_strategy, &home()),
            Err(ConfigError::Yaml(_))
        ));
        let typo = "providers:\n  todoist:\n    rate_limit: 2\n";
        assert!(matches!(
            Config::from_yaml_str(typo, &home()),
            Err(ConfigError::Yaml(_))
        ));
    }

    #[test]
    fn validates_numbers_eagerly() {
        let negative = "providers:\n  todoist:\n    rate_limit_delay: -1\n";
        assert!(matches!(
            Config::from_yaml_str(negative, &home()),
            Err(ConfigError::Invalid {
                field: "rate_limit_delay",
                ..
            })
        ));
        let zero_timeout = "providers:\n  todoist:\n    timeout_seconds: 0\n";
        assert!(matches!(
            Config::from_yaml_str(zero_timeout, &home()),
            Err(ConfigError::Invalid {
                field: "timeout_seconds",
                ..
            })
        ));
        let no_attempts = "providers:\n  todoist:\n    max_retries: 0\n";
        assert!(matches!(
            Config::from_yaml_str(no_attempts, &home()),
            Err(ConfigError::Invalid {
                field: "max_retries",
                ..
            })
        ));
    }

    #[test]
    fn expands_tilde_paths() {
        assert_eq!(expand_with_home("~", &home()), home());
        assert_eq!(
            expand_with_home("/abs/path", &home()),
            PathBuf::from("/abs/path")
        );
    }
}
