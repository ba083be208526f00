//! The goal registry: a validated, immutable snapshot of the goal catalog.
//!
//! A registry is built once per planning cycle and shared behind an `Arc`.
//! All catalog validation happens here, so a registry that exists is always
//! well-formed and planning never has to re-check it.

use std::collections::HashMap;
use std::path::Path;

use tracing::{debug, info};

use outreach_core::config::GoalsConfig;
use outreach_core::error::OutreachError;
use outreach_core::goal::{Goal, GoalCatalog, Trigger};
use outreach_storage::GoalRepository;

use crate::error::RegistryError;
use crate::selector::BASE_GOAL_KEYS;

/// The catalog compiled into the binary.
pub const BUILTIN_CATALOG: &str = include_str!("../goals/default_goals.toml");

/// Validated goal catalog with keyed lookup. Declaration order is kept.
#[derive(Debug, Clone)]
pub struct GoalRegistry {
    goals: Vec<Goal>,
    index: HashMap<String, usize>,
}

impl GoalRegistry {
    /// Validate `goals` and build a registry.
    ///
    /// Rejects duplicate keys, a missing or repeated `default` outcome,
    /// `max_attempts = 0`, `next_goal` references to unknown goals, and a
    /// catalog that lacks any of the base decision-table goals.
    pub fn new(goals: Vec<Goal>) -> Result<Self, RegistryError> {
        let mut index = HashMap::with_capacity(goals.len());
        for (position, goal) in goals.iter().enumerate() {
            if index.insert(goal.key.clone(), position).is_some() {
                return Err(RegistryError::DuplicateGoal(goal.key.clone()));
            }
            if goal.max_attempts == 0 {
                return Err(RegistryError::ZeroMaxAttempts(goal.key.clone()));
            }
            let defaults = goal
                .outcomes
                .iter()
                .filter(|o| o.trigger == Trigger::Default)
                .count();
            match defaults {
                0 => return Err(RegistryError::MissingDefault(goal.key.clone())),
                1 => {}
                _ => return Err(RegistryError::DuplicateDefault(goal.key.clone())),
            }
        }

        for goal in &goals {
            for outcome in &goal.outcomes {
                if let Some(next) = &outcome.action.next_goal {
                    if !index.contains_key(next) {
                        return Err(RegistryError::UnknownNextGoal {
                            goal: goal.key.clone(),
                            outcome: outcome.name.clone(),
                            next: next.clone(),
                        });
                    }
                }
            }
        }

        if let Some(missing) = BASE_GOAL_KEYS.iter().find(|k| !index.contains_key(**k)) {
            return Err(RegistryError::MissingBaseGoal(missing.to_string()));
        }

        debug!(goals = goals.len(), "Goal catalog validated");
        Ok(Self { goals, index })
    }

    /// Parse and validate a TOML catalog.
    pub fn from_toml(content: &str) -> Result<Self, RegistryError> {
        let catalog: GoalCatalog = toml::from_str(content)?;
        Self::new(catalog.goals)
    }

    /// Parse and validate a TOML catalog file.
    pub fn from_file(path: &Path) -> Result<Self, RegistryError> {
        let content = std::fs::read_to_string(path).map_err(OutreachError::from)?;
        Self::from_toml(&content)
    }

    /// The built-in catalog.
    pub fn builtin() -> Result<Self, RegistryError> {
        Self::from_toml(BUILTIN_CATALOG)
    }

    /// Resolve the active catalog: the configured file if any, otherwise the
    /// catalog stored in the database, otherwise the built-in one.
    pub fn load(config: &GoalsConfig, repo: &GoalRepository) -> Result<Self, RegistryError> {
        if let Some(path) = &config.catalog_path {
            let registry = Self::from_file(Path::new(path))?;
            info!(path = %path, goals = registry.len(), "Goal catalog loaded from file");
            return Ok(registry);
        }

        let stored = repo.load_catalog()?;
        if !stored.is_empty() {
            let registry = Self::new(stored)?;
            info!(goals = registry.len(), "Goal catalog loaded from database");
            return Ok(registry);
        }

        let registry = Self::builtin()?;
        info!(goals = registry.len(), "Using built-in goal catalog");
        Ok(registry)
    }

    /// Store this catalog, replacing whatever was stored before.
    pub fn persist(&self, repo: &GoalRepository) -> Result<(), RegistryError> {
        repo.replace_catalog(&self.goals)?;
        info!(goals = self.goals.len(), "Goal catalog saved");
        Ok(())
    }

    pub fn get(&self, key: &str) -> Option<&Goal> {
        self.index.get(key).map(|&i| &self.goals[i])
    }

    pub fn contains(&self, key: &str) -> bool {
        self.index.contains_key(key)
    }

    pub fn goals(&self) -> &[Goal] {
        &self.goals
    }

    /// Declaration position of `key`, used for deterministic tie-breaks.
    pub fn position(&self, key: &str) -> Option<usize> {
        self.index.get(key).copied()
    }

    pub fn len(&self) -> usize {
        self.goals.len()
    }

    pub fn is_empty(&self) -> bool {
        self.goals.is_empty()
    }
}
