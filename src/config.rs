use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};
use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const CONFIG_ENV: &str = "BOOT_FINDER_CONFIG";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub engine: EngineConfig,
    pub cache: CacheConfig,
    pub scanner: ScannerConfig,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionMode {
    /// One indicator at a time, in priority order.
    #[default]
    Sequential,
    /// Indicators submitted to a bounded worker pool.
    Pooled,
}

/// Confidence required for a positive classification, by result count.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ThresholdTable {
    pub single: f64,
    pub pair: f64,
    pub multiple: f64,
}

impl Default for ThresholdTable {
    fn default() -> Self {
        Self {
            single: 0.75,
            pair: 0.6,
            multiple: 0.55,
        }
    }
}

impl ThresholdTable {
    pub fn for_count(&self, results: usize) -> f64 {
        match results {
            0 | 1 => self.single,
            2 => self.pair,
            _ => self.multiple,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Stop as soon as one indicator's confidence is strictly above this.
    pub single_indicator_threshold: f64,
    /// Stop once two or more results average strictly above this.
    pub combined_threshold: f64,
    pub thresholds: ThresholdTable,
    pub timeout_ms: u64,
    pub max_workers: usize,
    pub mode: ExecutionMode,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            single_indicator_threshold: 0.95,
            combined_threshold: 0.9,
            thresholds: ThresholdTable::default(),
            timeout_ms: 30_000,
            max_workers: 3,
            mode: ExecutionMode::Sequential,
        }
    }
}

impl EngineConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub capacity: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self { capacity: 1000 }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScannerConfig {
    /// Dotted name of the class declaring the target method.
    pub target_owner: String,
    pub target_method: String,
    /// Operations inspected before a matched call for literal arguments.
    pub argument_window: usize,
}

impl Default for ScannerConfig {
    fn default() -> Self {
        Self {
            target_owner: "org.springframework.boot.SpringApplication".to_string(),
            target_method: "run".to_string(),
            argument_window: 20,
        }
    }
}

impl Settings {
    /// Resolves settings from `explicit`, then `$BOOT_FINDER_CONFIG`, then the
    /// user config file; falls back to defaults when none exists.
    pub fn load(explicit: Option<&Path>) -> Result<Self> {
        match resolve_config_path(explicit) {
            Some(path) => Self::from_file(&path),
            None => Ok(Self::default()),
        }
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        let settings: Settings = serde_json::from_str(&raw)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;
        settings
            .validate()
            .with_context(|| format!("Invalid config file: {}", path.display()))?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<()> {
        let engine = &self.engine;
        for (name, value) in [
            ("engine.single_indicator_threshold", engine.single_indicator_threshold),
            ("engine.combined_threshold", engine.combined_threshold),
            ("engine.thresholds.single", engine.thresholds.single),
            ("engine.thresholds.pair", engine.thresholds.pair),
            ("engine.thresholds.multiple", engine.thresholds.multiple),
        ] {
            if !(0.0..=1.0).contains(&value) {
                bail!("{name} must be within [0, 1], got {value}");
            }
        }
        if engine.max_workers == 0 {
            bail!("engine.max_workers must be at least 1");
        }
        if self.cache.capacity == 0 {
            bail!("cache.capacity must be at least 1");
        }
        if self.scanner.target_owner.is_empty() || self.scanner.target_method.is_empty() {
            bail!("scanner.target_owner and scanner.target_method must not be empty");
        }
        Ok(())
    }
}

pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|d| d.join("boot-finder").join("config.json"))
}

fn resolve_config_path(explicit: Option<&Path>) -> Option<PathBuf> {
    if let Some(p) = explicit {
        return Some(p.to_path_buf());
    }
    if let Ok(p) = env::var(CONFIG_ENV)
        && !p.is_empty()
    {
        return Some(PathBuf::from(p));
    }
    default_config_path().filter(|p| p.exists())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures::temp_path;

    #[test]
    fn defaults_match_documented_values() {
        let s = Settings::default();
        assert_eq!(s.engine.single_indicator_threshold, 0.95);
        assert_eq!(s.engine.combined_threshold, 0.9);
        assert_eq!(s.engine.timeout(), Duration::from_secs(30));
        assert_eq!(s.engine.max_workers, 3);
        assert_eq!(s.engine.mode, ExecutionMode::Sequential);
        assert_eq!(s.cache.capacity, 1000);
        assert_eq!(s.scanner.argument_window, 20);
        s.validate().unwrap();
    }

    #[test]
    fn threshold_table_picks_by_result_count() {
        let t = ThresholdTable::default();
        assert_eq!(t.for_count(1), 0.75);
        assert_eq!(t.for_count(2), 0.6);
        assert_eq!(t.for_count(3), 0.55);
        assert_eq!(t.for_count(7), 0.55);
    }

    #[test]
    fn partial_file_keeps_defaults_for_missing_fields() {
        let path = temp_path("config.json");
        std::fs::write(
            &path,
            r#"{"engine": {"mode": "pooled", "timeout_ms": 500}, "cache": {"capacity": 8}}"#,
        )
        .unwrap();

        let s = Settings::load(Some(&path)).unwrap();
        assert_eq!(s.engine.mode, ExecutionMode::Pooled);
        assert_eq!(s.engine.timeout_ms, 500);
        assert_eq!(s.engine.combined_threshold, 0.9);
        assert_eq!(s.cache.capacity, 8);
        assert_eq!(s.scanner, ScannerConfig::default());
        let _ = std::fs::remove_file(path);
    }

    #[test]
    fn invalid_values_are_rejected_with_context() {
        let path = temp_path("bad.json");
        std::fs::write(&path, r#"{"engine": {"thresholds": {"pair": 1.5}}}"#).unwrap();
        let err = Settings::from_file(&path).unwrap_err();
        let msg = format!("{err:#}");
        assert!(msg.contains("Invalid config file"));
        assert!(msg.contains("engine.thresholds.pair"));
        let _ = std::fs::remove_file(path);

        let mut s = Settings::default();
        s.cache.capacity = 0;
        assert!(s.validate().is_err());
    }

    #[test]
    fn missing_explicit_file_is_an_error() {
        let path = temp_path("absent.json");
        assert!(Settings::load(Some(&path)).is_err());
    }
}
