use parking_lot::RwLock;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};

use crate::schema::TillerConfig;

/// Loads the Tiller configuration.
pub struct ConfigLoader {
    config: Arc<RwLock<TillerConfig>>,
    config_path: PathBuf,
}

impl ConfigLoader {
    /// Resolve the config path: explicit path > TILLER_CONFIG env > ~/.tiller/tiller.toml
    pub fn resolve_path(explicit: Option<&Path>) -> PathBuf {
        if let Some(p) = explicit {
            return p.to_path_buf();
        }
        if let Ok(p) = std::env::var("TILLER_CONFIG") {
            return PathBuf::from(p);
        }
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".tiller")
            .join("tiller.toml")
    }

    /// Load the config from disk, falling back to defaults.
    pub fn load(path: Option<&Path>) -> tiller_core::Result<Self> {
        let config_path = Self::resolve_path(path);
        let config = if config_path.exists() {
            info!(?config_path, "loading configuration");
            let raw = std::fs::read_to_string(&config_path)?;
            toml::from_str::<TillerConfig>(&raw).map_err(|e| {
                tiller_core::TillerError::Config(format!(
                    "failed to parse {}: {}",
                    config_path.display(),
                    e
                ))
            })?
        } else {
            warn!(?config_path, "config file not found, using defaults");
            TillerConfig::default()
        };

        let config = Self::apply_env_overrides(config);

        // Validate config — log warnings, fail on errors
        match config.validate() {
            Ok(warnings) => {
                for w in &warnings {
                    warn!("{}", w);
                }
            }
            Err(e) => {
                return Err(tiller_core::TillerError::Config(e));
            }
        }

        Ok(Self {
            config: Arc::new(RwLock::new(config)),
            config_path,
        })
    }

    /// Get a read snapshot of the current config.
    pub fn get(&self) -> TillerConfig {
        self.config.read().clone()
    }

    /// Get a shared reference for subscription.
    pub fn shared(&self) -> Arc<RwLock<TillerConfig>> {
        Arc::clone(&self.config)
    }

    /// Path the config was loaded from.
    pub fn path(&self) -> &Path {
        &self.config_path
    }

    /// Apply env var overrides (TILLER_DB_PATH, TILLER_DAILY_BUDGET, etc.)
    fn apply_env_overrides(mut config: TillerConfig) -> TillerConfig {
        if let Ok(v) = std::env::var("TILLER_DB_PATH") {
            config.store.db_path = PathBuf::from(v);
        }
        if let Ok(v) = std::env::var("TILLER_DAILY_BUDGET") {
            if let Ok(budget) = v.parse::<f64>() {
                config.budget.daily_ceiling_usd = budget;
            }
        }
        if let Ok(v) = std::env::var("TILLER_CONFIDENCE_THRESHOLD") {
            if let Ok(t) = v.parse::<f64>() {
                config.router.confidence_threshold = t;
            }
        }
        if let Ok(v) = std::env::var("TILLER_LOG_LEVEL") {
            config.logging.level = v;
        }
        // Override secret: config file takes priority, env is the fallback.
        if config.budget.override_token.is_none() {
            if let Ok(v) = std::env::var("TILLER_OVERRIDE_TOKEN") {
                config.budget.override_token = Some(v);
            }
        }
        config
    }

    /// Reload the config from disk.
    pub fn reload(&self) -> tiller_core::Result<()> {
        if !self.config_path.exists() {
            return Err(tiller_core::TillerError::Config(format!(
                "config file not found: {}",
                self.config_path.display()
            )));
        }
        let raw = std::fs::read_to_string(&self.config_path)?;
        let new_config = toml::from_str::<TillerConfig>(&raw).map_err(|e| {
            tiller_core::TillerError::Config(format!(
                "failed to parse {}: {}",
                self.config_path.display(),
                e
            ))
        })?;
        let new_config = Self::apply_env_overrides(new_config);
        *self.config.write() = new_config;
        info!("configuration reloaded");
        Ok(())
    }
}
