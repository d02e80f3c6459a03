use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{AppError, AppResult};
use crate::sync::ReconcilePolicy;

pub const DEFAULT_API_URL: &str =
    "https://ai-powered-support-co-pilot-production-c917.up.railway.app";
pub const DEFAULT_TABLE: &str = "tickets";

const APP_DIR_NAME: &str = "ticket-desk";
const CONFIG_FILE_NAME: &str = "config.toml";
const CONFIG_DIR_ENV: &str = "TICKET_DESK_CONFIG_DIR";

/// Settings resolved from the stored file and the environment.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub supabase_url: Option<String>,
    pub supabase_key: Option<String>,
    pub api_url: String,
    pub table: String,
    pub reconcile_policy: ReconcilePolicy,
}

impl AppConfig {
    pub fn load() -> AppResult<Self> {
        let stored = StoredConfig::load()?;
        Self::resolve(stored, |name| env::var(name).ok())
    }

    /// Environment values take precedence over stored ones; blank values count as unset.
    pub fn resolve(stored: StoredConfig, env: impl Fn(&str) -> Option<String>) -> AppResult<Self> {
        let pick = |name: &str, stored: Option<String>| {
            non_blank(env(name)).or_else(|| non_blank(stored))
        };

        let reconcile_policy = match pick("TICKETS_RECONCILE", stored.reconcile_policy) {
            Some(value) => ReconcilePolicy::parse(&value).ok_or_else(|| {
                AppError::Configuration(format!(
                    "unknown reconcile policy '{value}' (expected 'full' or 'incremental')"
                ))
            })?,
            None => ReconcilePolicy::default(),
        };

        Ok(Self {
            supabase_url: pick("SUPABASE_URL", stored.supabase_url),
            supabase_key: pick("SUPABASE_KEY", stored.supabase_key),
            api_url: pick("TICKETS_API_URL", stored.api_url)
                .unwrap_or_else(|| DEFAULT_API_URL.to_string()),
            table: DEFAULT_TABLE.to_string(),
            reconcile_policy,
        })
    }

    pub fn require_supabase(&self) -> AppResult<(&str, &str)> {
        let url = self.supabase_url.as_deref().ok_or_else(|| {
            AppError::Configuration(
                "Supabase URL not configured; run `desk config init` or set SUPABASE_URL"
                    .to_string(),
            )
        })?;
        let key = self.supabase_key.as_deref().ok_or_else(|| {
            AppError::Configuration(
                "Supabase key not configured; run `desk config init` or set SUPABASE_KEY"
                    .to_string(),
            )
        })?;
        Ok((url, key))
    }
}

fn non_blank(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

/// The on-disk configuration file.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredConfig {
    pub supabase_url: Option<String>,
    pub supabase_key: Option<String>,
    pub api_url: Option<String>,
    pub reconcile_policy: Option<String>,
}

impl StoredConfig {
    pub fn load() -> AppResult<Self> {
        Self::load_from(&config_file_path()?)
    }

    pub fn load_from(path: &Path) -> AppResult<Self> {
        match fs::read_to_string(path) {
            Ok(contents) => toml::from_str(&contents).map_err(|err| {
                AppError::Configuration(format!("invalid config file {}: {err}", path.display()))
            }),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %path.display(), "no config file, using defaults");
                Ok(Self::default())
            }
            Err(err) => Err(AppError::Io(err)),
        }
    }

    pub fn save(&self) -> AppResult<()> {
        self.save_to(&config_file_path()?)
    }

    pub fn save_to(&self, path: &Path) -> AppResult<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let data = toml::to_string_pretty(self)
            .map_err(|err| AppError::Configuration(format!("failed to write config: {err}")))?;
        fs::write(path, data)?;
        Ok(())
    }
}

pub fn config_directory() -> AppResult<PathBuf> {
    if let Some(dir) = non_blank(env::var(CONFIG_DIR_ENV).ok()) {
        return Ok(PathBuf::from(dir));
    }
    dirs::config_dir()
        .map(|dir| dir.join(APP_DIR_NAME))
        .ok_or_else(|| AppError::Configuration("could not determine config directory".to_string()))
}

pub fn config_file_path() -> AppResult<PathBuf> {
    Ok(config_directory()?.join(CONFIG_FILE_NAME))
}
