use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::{OutreachError, Result};

/// Top-level configuration for the outreach engine.
///
/// Loaded from `~/.outreach/config.toml` by default. Each section corresponds
/// to a bounded context or cross-cutting concern.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OutreachConfig {
    #[serde(default)]
    pub general: GeneralConfig,
    #[serde(default)]
    pub scoring: ScoringConfig,
    #[serde(default)]
    pub planner: PlannerConfig,
    #[serde(default)]
    pub dispatch: DispatchConfig,
    #[serde(default)]
    pub sweeps: SweepConfig,
    #[serde(default)]
    pub goals: GoalsConfig,
}

impl OutreachConfig {
    /// Load configuration from a TOML file.
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: OutreachConfig = toml::from_str(&content)?;
        info!("Configuration loaded from {}", path.display());
        Ok(config)
    }

    /// Load configuration from a TOML file, falling back to defaults if the
    /// file does not exist or cannot be parsed.
    pub fn load_or_default(path: &Path) -> Self {
        match Self::load(path) {
            Ok(config) => config,
            Err(e) => {
                warn!(
                    "Failed to load config from {}: {}. Using defaults.",
                    path.display(),
                    e
                );
                Self::default()
            }
        }
    }

    /// Save the current configuration to a TOML file.
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content =
            toml::to_string_pretty(self).map_err(|e| OutreachError::Config(e.to_string()))?;
        std::fs::write(path, content)?;
        info!("Configuration saved to {}", path.display());
        Ok(())
    }
}

/// General application settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneralConfig {
    /// Data directory holding the SQLite database.
    pub data_dir: String,
    /// Log level: trace, debug, info, warn, error.
    pub log_level: String,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            data_dir: "~/.outreach/data".to_string(),
            log_level: "info".to_string(),
        }
    }
}

/// Engagement and excitement scoring.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScoringConfig {
    /// Trailing window for activity signals, in days.
    pub window_days: u32,
    /// Scores older than this are recomputed by the staleness sweep.
    pub freshness_hours: u32,
    /// Maximum contacts recomputed per staleness sweep.
    pub batch_size: u32,
    /// Insight attributes that count as positive signals for excitement.
    pub positive_signal_attributes: Vec<String>,
}

impl Default for ScoringConfig {
    fn default() -> Self {
        Self {
            window_days: 30,
            freshness_hours: 24,
            batch_size: 100,
            positive_signal_attributes: vec![
                "expressed_interest".to_string(),
                "membership_interest".to_string(),
                "event_interest".to_string(),
                "positive_feedback".to_string(),
                "referral_offered".to_string(),
                "volunteer_interest".to_string(),
            ],
        }
    }
}

/// Goal selection.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PlannerConfig {
    /// Intersect the base decision table with the full goal registry.
    pub registry_mode: bool,
    /// Days after a refusal during which the contact is not approached.
    pub refusal_cooldown_days: u32,
}

impl Default for PlannerConfig {
    fn default() -> Self {
        Self {
            registry_mode: true,
            refusal_cooldown_days: 90,
        }
    }
}

/// Outbound dispatch and transport retry policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatchConfig {
    /// Retries after the first failed send for transient errors.
    pub max_retries: u32,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    /// A dispatch claim older than this is considered abandoned.
    pub claim_ttl_minutes: u32,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay_ms: 500,
            max_delay_ms: 10_000,
            claim_ttl_minutes: 15,
        }
    }
}

/// Periodic sweep cadence and per-run bounds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SweepConfig {
    pub interval_secs: u64,
    pub timeout_batch: u32,
    pub deferred_batch: u32,
    pub dispatch_batch: u32,
    pub planning_batch: u32,
}

impl Default for SweepConfig {
    fn default() -> Self {
        Self {
            interval_secs: 300,
            timeout_batch: 100,
            deferred_batch: 100,
            dispatch_batch: 50,
            planning_batch: 50,
        }
    }
}

/// Goal catalog source.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct GoalsConfig {
    /// TOML catalog overriding the built-in goals. When unset the catalog
    /// stored in the database is used, then the built-in one.
    pub catalog_path: Option<String>,
}
