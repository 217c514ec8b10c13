use serde::{Deserialize, Serialize};
use serde_yaml::{Mapping, Value};
use std::env;
use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use crate::error::{io_context, ForgeError};
use crate::persist::write_atomic;

pub(crate) const HOME_ENV: &str = "FORGE_HOME";
const DEFAULT_HOME_DIR: &str = ".codeforge";

/// Directory layout under the forge home.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct ForgePaths {
    root: PathBuf,
}

impl ForgePaths {
    pub(crate) fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// `$FORGE_HOME` when set, otherwise `~/.codeforge`.
    pub(crate) fn resolve() -> Result<Self, ForgeError> {
        if let Some(home) = env::var_os(HOME_ENV).filter(|value| !value.is_empty()) {
            return Ok(Self::new(PathBuf::from(home)));
        }
        let home = env::var_os("HOME")
            .filter(|value| !value.is_empty())
            .ok_or_else(|| {
                ForgeError::Config(format!("Neither {} nor HOME is set", HOME_ENV))
            })?;
        Ok(Self::new(PathBuf::from(home).join(DEFAULT_HOME_DIR)))
    }

    pub(crate) fn root(&self) -> &Path {
        &self.root
    }

    pub(crate) fn config_path(&self) -> PathBuf {
        self.root.join("config.yaml")
    }

    pub(crate) fn challenges_dir(&self) -> PathBuf {
        self.root.join("challenges")
    }

    pub(crate) fn repos_dir(&self) -> PathBuf {
        self.root.join("repos")
    }

    pub(crate) fn workspaces_dir(&self) -> PathBuf {
        self.root.join("workspaces")
    }

    pub(crate) fn locks_dir(&self) -> PathBuf {
        self.root.join("locks")
    }

    pub(crate) fn history_path(&self) -> PathBuf {
        self.root.join("history.jsonl")
    }

    pub(crate) fn history_lock_path(&self) -> PathBuf {
        self.locks_dir().join("history.lock")
    }

    pub(crate) fn log_path(&self) -> PathBuf {
        self.root.join("forge.log")
    }

    pub(crate) fn workspace_dir(&self, challenge_id: &str) -> PathBuf {
        self.workspaces_dir().join(challenge_id)
    }

    pub(crate) fn challenge_lock_path(&self, challenge_id: &str) -> PathBuf {
        self.locks_dir().join(format!("{}.lock", challenge_id))
    }

    /// Serializes clone, fetch and copy on one repository cache.
    pub(crate) fn repo_lock_path(&self, repo: &str) -> PathBuf {
        self.locks_dir()
            .join("repos")
            .join(format!("{}.lock", repo.replace('/', "__")))
    }

    /// `owner/name` is cached as `repos/owner__name`.
    pub(crate) fn repo_cache_dir(&self, repo: &str) -> PathBuf {
        self.repos_dir().join(repo.replace('/', "__"))
    }

    pub(crate) fn ensure_layout(&self) -> Result<(), ForgeError> {
        for dir in [
            self.root.clone(),
            self.challenges_dir(),
            self.repos_dir(),
            self.workspaces_dir(),
            self.locks_dir(),
        ] {
            fs::create_dir_all(&dir)
                .map_err(io_context(format!("Failed to create {}", dir.display())))?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) enum ApiProvider {
    #[serde(rename = "anthropic")]
    Anthropic,
    #[serde(rename = "openai")]
    OpenAi,
    #[serde(rename = "openrouter")]
    OpenRouter,
}

impl ApiProvider {
    pub(crate) const ALL: [ApiProvider; 3] = [
        ApiProvider::Anthropic,
        ApiProvider::OpenAi,
        ApiProvider::OpenRouter,
    ];

    pub(crate) fn as_str(self) -> &'static str {
        match self {
            ApiProvider::Anthropic => "anthropic",
            ApiProvider::OpenAi => "openai",
            ApiProvider::OpenRouter => "openrouter",
        }
    }

    pub(crate) fn default_model(self) -> &'static str {
        match self {
            ApiProvider::Anthropic => "claude-sonnet-4-20250514",
            ApiProvider::OpenAi => "gpt-4o",
            ApiProvider::OpenRouter => "anthropic/claude-sonnet-4",
        }
    }
}

impl FromStr for ApiProvider {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let normalized = value.trim().to_ascii_lowercase();
        Self::ALL
            .into_iter()
            .find(|provider| provider.as_str() == normalized)
            .ok_or_else(|| {
                format!(
                    "Unknown api_provider '{}'; expected one of: anthropic, openai, openrouter",
                    value
                )
            })
    }
}

impl fmt::Display for ApiProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub(crate) struct Config {
    pub(crate) api_provider: Option<ApiProvider>,
    pub(crate) api_key: Option<String>,
    pub(crate) api_model: Option<String>,
    pub(crate) editor: String,
    pub(crate) test_timeout_secs: u64,
    pub(crate) review_timeout_secs: u64,
    pub(crate) lock_timeout_secs: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            api_provider: None,
            api_key: None,
            api_model: None,
            editor: "vim".to_string(),
            test_timeout_secs: 120,
            review_timeout_secs: 90,
            lock_timeout_secs: 30,
        }
    }
}

impl Config {
    /// The model to request from the configured provider.
    pub(crate) fn effective_model(&self) -> Option<String> {
        let provider = self.api_provider?;
        Some(
            self.api_model
                .clone()
                .filter(|model| !model.trim().is_empty())
                .unwrap_or_else(|| provider.default_model().to_string()),
        )
    }

    /// `$EDITOR` wins over the configured editor.
    pub(crate) fn effective_editor(&self) -> String {
        env::var("EDITOR")
            .ok()
            .filter(|value| !value.trim().is_empty())
            .unwrap_or_else(|| self.editor.clone())
    }
}

pub(crate) const CONFIG_KEYS: [&str; 7] = [
    "api_provider",
    "api_key",
    "api_model",
    "editor",
    "test_timeout_secs",
    "review_timeout_secs",
    "lock_timeout_secs",
];

#[derive(Debug)]
pub(crate) struct LoadedConfig {
    pub(crate) config: Config,
    pub(crate) warnings: Vec<String>,
}

/// Loads `config.yaml`; a missing file yields the defaults.
pub(crate) fn load_config(path: &Path) -> Result<LoadedConfig, ForgeError> {
    let content = match fs::read_to_string(path) {
        Ok(content) => content,
        Err(err) if err.kind() == io::ErrorKind::NotFound => {
            return Ok(LoadedConfig {
                config: Config::default(),
                warnings: Vec::new(),
            })
        }
        Err(err) => {
            return Err(ForgeError::Config(format!(
                "Failed to read config {}: {}",
                path.display(),
                err
            )))
        }
    };
    let value: Value = serde_yaml::from_str(&content).map_err(|err| {
        ForgeError::Config(format!("Failed to parse config {}: {}", path.display(), err))
    })?;
    let mapping = match value {
        Value::Mapping(mapping) => mapping,
        Value::Null => Mapping::new(),
        _ => {
            return Err(ForgeError::Config(format!(
                "Config {} must be a YAML mapping",
                path.display()
            )))
        }
    };

    let warnings = unknown_top_level_keys(&mapping);

    let config: Config = serde_path_to_error::deserialize(Value::Mapping(mapping)).map_err(
        |err| ForgeError::Config(format!("Invalid config {}: {}", path.display(), err)),
    )?;
    validate_config(&config)?;

    Ok(LoadedConfig { config, warnings })
}

pub(crate) fn save_config(path: &Path, config: &Config) -> Result<(), ForgeError> {
    let rendered = serde_yaml::to_string(config)
        .map_err(|err| ForgeError::Config(format!("Failed to render config: {}", err)))?;
    write_atomic(path, rendered.as_bytes())
}

fn unknown_top_level_keys(mapping: &Mapping) -> Vec<String> {
    mapping
        .keys()
        .filter_map(|key| key.as_str().map(|value| value.to_string()))
        .filter(|key| !CONFIG_KEYS.contains(&key.as_str()))
        .collect()
}

fn validate_config(config: &Config) -> Result<(), ForgeError> {
    if config.editor.trim().is_empty() {
        return Err(ForgeError::Config("editor must not be empty".to_string()));
    }
    for (label, value) in [
        ("test_timeout_secs", config.test_timeout_secs),
        ("review_timeout_secs", config.review_timeout_secs),
    ] {
        if value == 0 {
            return Err(ForgeError::Config(format!("{} must be at least 1", label)));
        }
    }
    Ok(())
}

/// Applies a `forge config <key> <value>` update. An empty value, `none` or
/// `null` clears optional keys.
pub(crate) fn set_config_value(config: &mut Config, key: &str, raw: &str) -> Result<(), ForgeError> {
    let value = raw.trim();
    let cleared = value.is_empty()
        || value.eq_ignore_ascii_case("none")
        || value.eq_ignore_ascii_case("null");
    match key {
        "api_provider" => {
            config.api_provider = if cleared {
                None
            } else {
                Some(value.parse().map_err(ForgeError::Config)?)
            };
        }
        "api_key" => config.api_key = (!cleared).then(|| value.to_string()),
        "api_model" => config.api_model = (!cleared).then(|| value.to_string()),
        "editor" => {
            if cleared {
                return Err(ForgeError::Config("editor must not be empty".to_string()));
            }
            config.editor = value.to_string();
        }
        "test_timeout_secs" => config.test_timeout_secs = parse_seconds(key, value, 1)?,
        "review_timeout_secs" => config.review_timeout_secs = parse_seconds(key, value, 1)?,
        "lock_timeout_secs" => config.lock_timeout_secs = parse_seconds(key, value, 0)?,
        _ => {
            return Err(ForgeError::Config(format!(
                "Unknown config key '{}'; valid keys: {}",
                key,
                CONFIG_KEYS.join(", ")
            )))
        }
    }
    Ok(())
}

fn parse_seconds(key: &str, value: &str, minimum: u64) -> Result<u64, ForgeError> {
    let parsed: u64 = value.parse().map_err(|_| {
        ForgeError::Config(format!("{} must be a whole number of seconds, got '{}'", key, value))
    })?;
    if parsed < minimum {
        return Err(ForgeError::Config(format!(
            "{} must be at least {}",
            key, minimum
        )));
    }
    Ok(parsed)
}

/// Display value for a key; secrets are masked.
pub(crate) fn display_config_value(config: &Config, key: &str) -> Option<String> {
    let value = match key {
        "api_provider" => config.api_provider.map(|provider| provider.to_string()),
        "api_key" => config.api_key.as_deref().map(mask_secret),
        "api_model" => config.api_model.clone(),
        "editor" => Some(config.editor.clone()),
        "test_timeout_secs" => Some(config.test_timeout_secs.to_string()),
        "review_timeout_secs" => Some(config.review_timeout_secs.to_string()),
        "lock_timeout_secs" => Some(config.lock_timeout_secs.to_string()),
        _ => return None,
    };
    Some(value.unwrap_or_else(|| "(not set)".to_string()))
}

pub(crate) fn mask_secret(value: &str) -> String {
    let chars: Vec<char> = value.chars().collect();
    if chars.len() <= 8 {
        return "*".repeat(chars.len());
    }
    let head: String = chars[..4].iter().collect();
    let tail: String = chars[chars.len() - 4..].iter().collect();
    format!("{}...{}", head, tail)
}
