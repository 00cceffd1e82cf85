//! Configuration management for redirfsctl
//!
//! A configuration names the filters to register and the ordered list of
//! path rules to apply to them. It is only read to drive the engine; the
//! live chain state is never written back.

use crate::error::{Error, Result};
use crate::ops::OpId;
use crate::path::PathFlags;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};

/// Default log level when none is configured
pub const DEFAULT_LOG_LEVEL: &str = "info";

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Filters to register
    #[serde(default)]
    pub filters: Vec<FilterConfig>,

    /// Path rules, applied in order
    #[serde(default)]
    pub paths: Vec<PathRule>,

    /// Logging configuration
    #[serde(default)]
    pub log: LogConfig,
}

/// One filter registration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FilterConfig {
    /// Filter name
    pub name: String,

    /// Unique priority; lower runs first
    pub priority: i32,

    /// Whether callbacks run after registration
    #[serde(default = "default_true")]
    pub active: bool,

    /// Operations the filter hooks
    #[serde(default)]
    pub ops: Vec<OpId>,

    /// Hooked operations whose pre-callback vetoes the call
    #[serde(default)]
    pub deny: Vec<OpId>,
}

/// Which part of the tree a rule covers
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum RuleScope {
    /// The path only
    Single,
    /// The path and its descendants
    Subtree,
    /// Both
    Both,
}

/// Whether a rule attaches or suppresses the filter
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum RuleAction {
    Include,
    Exclude,
}

/// One attach/detach rule
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PathRule {
    /// Name of a configured filter
    pub filter: String,

    /// Absolute path inside the filtered tree
    pub path: PathBuf,

    /// Rule scope
    #[serde(default = "default_scope")]
    pub scope: RuleScope,

    /// Rule action
    #[serde(default = "default_action")]
    pub action: RuleAction,
}

impl PathRule {
    /// Engine flags for this rule
    pub fn flags(&self) -> PathFlags {
        let scope = match self.scope {
            RuleScope::Single => PathFlags::SINGLE,
            RuleScope::Subtree => PathFlags::SUBTREE,
            RuleScope::Both => PathFlags::SINGLE | PathFlags::SUBTREE,
        };
        let action = match self.action {
            RuleAction::Include => PathFlags::INCLUDE,
            RuleAction::Exclude => PathFlags::EXCLUDE,
        };
        scope | action
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// Level or `tracing` filter directive
    pub level: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        LogConfig {
            level: DEFAULT_LOG_LEVEL.to_string(),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_scope() -> RuleScope {
    RuleScope::Subtree
}

fn default_action() -> RuleAction {
    RuleAction::Include
}

impl Config {
    /// Default configuration file location
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("redirfs")
            .join("config.json")
    }

    /// Load configuration from a file, with environment variable overrides
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref()).map_err(|e| {
            Error::Config(format!("Failed to read config file: {}", e))
        })?;

        let mut config: Config = serde_json::from_str(&content).map_err(|e| {
            Error::Config(format!("Failed to parse config file: {}", e))
        })?;

        config.apply_env_overrides();

        config.validate()?;
        Ok(config)
    }

    /// Apply environment variable overrides to configuration
    pub fn apply_env_overrides(&mut self) {
        if let Ok(level) = std::env::var("REDIRFS_LOG_LEVEL") {
            let level = level.trim().to_string();
            if !level.is_empty() {
                self.log.level = level;
            }
        }
    }

    /// Save configuration to a file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = serde_json::to_string_pretty(self).map_err(|e| {
            Error::Config(format!("Failed to serialize config: {}", e))
        })?;

        if let Some(parent) = path.as_ref().parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path.as_ref(), content).map_err(|e| {
            Error::Config(format!("Failed to write config file: {}", e))
        })?;

        Ok(())
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        let mut priorities = HashSet::new();
        let mut names = HashSet::new();

        for filter in &self.filters {
            if filter.name.is_empty() {
                return Err(Error::InvalidConfig(
                    "Filter name is required".to_string(),
                ));
            }
            if !names.insert(filter.name.as_str()) {
                return Err(Error::InvalidConfig(format!(
                    "Filter {} is defined twice",
                    filter.name
                )));
            }
            if !priorities.insert(filter.priority) {
                return Err(Error::InvalidConfig(format!(
                    "Priority {} is used by more than one filter",
                    filter.priority
                )));
            }
            if filter.ops.iter().chain(filter.deny.iter()).any(|op| op.is_end()) {
                return Err(Error::InvalidConfig(format!(
                    "Filter {} lists the end marker as an operation",
                    filter.name
                )));
            }
            if let Some(op) = filter.deny.iter().find(|op| !filter.ops.contains(op)) {
                return Err(Error::InvalidConfig(format!(
                    "Filter {} denies {:?} without hooking it",
                    filter.name, op
                )));
            }
        }

        for rule in &self.paths {
            if !names.contains(rule.filter.as_str()) {
                return Err(Error::InvalidConfig(format!(
                    "Path rule for {:?} names unknown filter {}",
                    rule.path, rule.filter
                )));
            }
            if !rule.path.is_absolute() {
                return Err(Error::InvalidConfig(format!(
                    "Path rule path {:?} must be absolute",
                    rule.path
                )));
            }
        }

        Ok(())
    }

    /// Look up a filter definition by name
    pub fn filter(&self, name: &str) -> Option<&FilterConfig> {
        self.filters.iter().find(|f| f.name == name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn sample() -> Config {
        Config {
            filters: vec![
                FilterConfig {
                    name: "avflt".to_string(),
                    priority: 10,
                    active: true,
                    ops: vec![OpId::RegFopOpen, OpId::RegFopRelease],
                    deny: vec![OpId::RegFopOpen],
                },
                FilterConfig {
                    name: "trace".to_string(),
                    priority: 5,
                    active: true,
                    ops: vec![OpId::DirIopLookup],
                    deny: Vec::new(),
                },
            ],
            paths: vec![
                PathRule {
                    filter: "avflt".to_string(),
                    path: PathBuf::from("/home"),
                    scope: RuleScope::Subtree,
                    action: RuleAction::Include,
                },
                PathRule {
                    filter: "avflt".to_string(),
                    path: PathBuf::from("/home/cache"),
                    scope: RuleScope::Subtree,
                    action: RuleAction::Exclude,
                },
            ],
            log: LogConfig::default(),
        }
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join("config.json");

        let config = sample();
        config.save(&path).unwrap();

        let loaded = Config::load(&path).unwrap();
        assert_eq!(loaded.filters.len(), 2);
        assert_eq!(loaded.paths.len(), 2);
        assert_eq!(loaded.filter("trace").unwrap().priority, 5);
        assert_eq!(loaded.paths[1].action, RuleAction::Exclude);
    }

    #[test]
    fn test_defaults_when_fields_missing() {
        let json = r#"{
            "filters": [{ "name": "f", "priority": 1 }],
            "paths": [{ "filter": "f", "path": "/srv" }]
        }"#;
        let config: Config = serde_json::from_str(json).unwrap();
        assert!(config.filters[0].active);
        assert!(config.filters[0].ops.is_empty());
        assert_eq!(config.paths[0].scope, RuleScope::Subtree);
        assert_eq!(config.paths[0].action, RuleAction::Include);
        assert_eq!(config.log.level, DEFAULT_LOG_LEVEL);
        config.validate().unwrap();
    }

    #[test]
    fn test_rule_flags() {
        let config = sample();
        assert_eq!(
            config.paths[0].flags(),
            PathFlags::SUBTREE | PathFlags::INCLUDE
        );
        assert_eq!(
            config.paths[1].flags(),
            PathFlags::SUBTREE | PathFlags::EXCLUDE
        );

        let both = PathRule {
            filter: "avflt".to_string(),
            path: PathBuf::from("/"),
            scope: RuleScope::Both,
            action: RuleAction::Include,
        };
        assert_eq!(
            both.flags(),
            PathFlags::SINGLE | PathFlags::SUBTREE | PathFlags::INCLUDE
        );
    }

    #[test]
    fn test_validate_duplicate_priority() {
        let mut config = sample();
        config.filters[1].priority = 10;
        assert!(matches!(config.validate(), Err(Error::InvalidConfig(_))));
    }

    #[test]
    fn test_validate_unknown_filter() {
        let mut config = sample();
        config.paths[0].filter = "missing".to_string();
        assert!(matches!(config.validate(), Err(Error::InvalidConfig(_))));
    }

    #[test]
    fn test_validate_relative_path() {
        let mut config = sample();
        config.paths[0].path = PathBuf::from("home");
        assert!(matches!(config.validate(), Err(Error::InvalidConfig(_))));
    }

    #[test]
    fn test_validate_deny_without_hook() {
        let mut config = sample();
        config.filters[1].deny = vec![OpId::RegFopOpen];
        assert!(matches!(config.validate(), Err(Error::InvalidConfig(_))));
    }

    #[test]
    fn test_load_missing_file() {
        let dir = tempdir().unwrap();
        let err = Config::load(dir.path().join("nope.json")).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }
}
