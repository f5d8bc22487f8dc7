//! Gate configuration.
//!
//! Defaults are overlaid by the store-owned `config.json`, then by `VGATE_*`
//! environment variables. CLI flags are applied last by the binary.
use crate::error::{GateError, Result};
use crate::paths::StorePaths;
use crate::util::read_json_optional;
use chrono::Datelike;
use serde::{Deserialize, Serialize};
use std::time::Duration;

pub const CONFIG_SCHEMA_VERSION: u32 = 1;

pub const ENV_CACHE_TTL: &str = "VGATE_CACHE_TTL";
pub const ENV_OUTPUT_SAMPLE_BYTES: &str = "VGATE_OUTPUT_SAMPLE_BYTES";
pub const ENV_CLOCK_SKEW: &str = "VGATE_CLOCK_SKEW";
pub const ENV_OPERATION_TIMEOUT: &str = "VGATE_OPERATION_TIMEOUT";
pub const ENV_STALE_MULTIPLIER: &str = "VGATE_STALE_MULTIPLIER";
pub const ENV_MERGE_TIMEOUT: &str = "VGATE_MERGE_TIMEOUT";
pub const ENV_MERGE_POLL: &str = "VGATE_MERGE_POLL";
pub const ENV_CHECK_TIMEOUT: &str = "VGATE_CHECK_TIMEOUT";
pub const ENV_NONINTERACTIVE: &str = "VGATE_NONINTERACTIVE";
pub const ENV_PERIOD: &str = "VGATE_PERIOD";
pub const ENV_STORE: &str = "VGATE_STORE";

/// Effective configuration shared by every component.
#[derive(Debug, Clone, PartialEq)]
pub struct GateConfig {
    pub cache_ttl: Duration,
    pub output_sample_bytes: usize,
    pub clock_skew_tolerance: Duration,
    pub operation_timeout: Duration,
    pub stale_multiplier: u32,
    pub merge_timeout: Duration,
    pub merge_poll_interval: Duration,
    pub check_timeout: Duration,
    pub non_interactive: bool,
    /// Reporting period for new identifiers; `None` means the current ISO week.
    pub period: Option<String>,
}

impl Default for GateConfig {
    fn default() -> Self {
        Self {
            cache_ttl: Duration::from_secs(24 * 60 * 60),
            output_sample_bytes: 4096,
            clock_skew_tolerance: Duration::from_secs(5 * 60),
            operation_timeout: Duration::from_secs(30 * 60),
            stale_multiplier: 2,
            merge_timeout: Duration::from_secs(10 * 60),
            merge_poll_interval: Duration::from_secs(2),
            check_timeout: Duration::from_secs(10 * 60),
            non_interactive: false,
            period: None,
        }
    }
}

/// On-disk shape of `config.json`; every field is optional.
#[derive(Debug, Default, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct ConfigFile {
    pub schema_version: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache_ttl: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_sample_bytes: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub clock_skew_tolerance: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub operation_timeout: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stale_multiplier: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub merge_timeout: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub merge_poll_interval: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub check_timeout: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub non_interactive: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub period: Option<String>,
}

impl GateConfig {
    /// Load `config.json` (if present) and overlay the process environment.
    pub fn load(paths: &StorePaths) -> Result<Self> {
        let mut config = Self::default();
        if let Some(file) = read_json_optional::<ConfigFile>(&paths.config_path())? {
            config.apply_file(&file)?;
        }
        config.apply_env(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Overlay values from a parsed `config.json`.
    pub fn apply_file(&mut self, file: &ConfigFile) -> Result<()> {
        if file.schema_version != CONFIG_SCHEMA_VERSION {
            return Err(GateError::Config(format!(
                "unsupported config schema_version {}",
                file.schema_version
            )));
        }
        if let Some(raw) = &file.cache_ttl {
            self.cache_ttl = parse_duration_named("cache_ttl", raw)?;
        }
        if let Some(bytes) = file.output_sample_bytes {
            self.output_sample_bytes = bytes;
        }
        if let Some(raw) = &file.clock_skew_tolerance {
            self.clock_skew_tolerance = parse_duration_named("clock_skew_tolerance", raw)?;
        }
        if let Some(raw) = &file.operation_timeout {
            self.operation_timeout = parse_duration_named("operation_timeout", raw)?;
        }
        if let Some(multiplier) = file.stale_multiplier {
            self.stale_multiplier = multiplier;
        }
        if let Some(raw) = &file.merge_timeout {
            self.merge_timeout = parse_duration_named("merge_timeout", raw)?;
        }
        if let Some(raw) = &file.merge_poll_interval {
            self.merge_poll_interval = parse_duration_named("merge_poll_interval", raw)?;
        }
        if let Some(raw) = &file.check_timeout {
            self.check_timeout = parse_duration_named("check_timeout", raw)?;
        }
        if let Some(flag) = file.non_interactive {
            self.non_interactive = flag;
        }
        if let Some(period) = &file.period {
            self.period = Some(period.clone());
        }
        Ok(())
    }

    /// Overlay `VGATE_*` variables using `lookup` as the environment source.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        let durations: [(&str, &mut Duration); 6] = [
            (ENV_CACHE_TTL, &mut self.cache_ttl),
            (ENV_CLOCK_SKEW, &mut self.clock_skew_tolerance),
            (ENV_OPERATION_TIMEOUT, &mut self.operation_timeout),
            (ENV_MERGE_TIMEOUT, &mut self.merge_timeout),
            (ENV_MERGE_POLL, &mut self.merge_poll_interval),
            (ENV_CHECK_TIMEOUT, &mut self.check_timeout),
        ];
        for (key, slot) in durations {
            if let Some(raw) = lookup(key) {
                *slot = parse_duration_named(key, &raw)?;
            }
        }
        if let Some(raw) = lookup(ENV_OUTPUT_SAMPLE_BYTES) {
            self.output_sample_bytes = raw.trim().parse().map_err(|_| {
                GateError::Config(format!("{ENV_OUTPUT_SAMPLE_BYTES}: expected integer, got {raw:?}"))
            })?;
        }
        if let Some(raw) = lookup(ENV_STALE_MULTIPLIER) {
            self.stale_multiplier = raw.trim().parse().map_err(|_| {
                GateError::Config(format!("{ENV_STALE_MULTIPLIER}: expected integer, got {raw:?}"))
            })?;
        }
        if let Some(raw) = lookup(ENV_NONINTERACTIVE) {
            self.non_interactive = parse_flag(ENV_NONINTERACTIVE, &raw)?;
        }
        if let Some(raw) = lookup(ENV_PERIOD) {
            let trimmed = raw.trim();
            if !trimmed.is_empty() {
                self.period = Some(trimmed.to_string());
            }
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.stale_multiplier == 0 {
            return Err(GateError::Config(
                "stale_multiplier must be at least 1".to_string(),
            ));
        }
        if self.merge_poll_interval.is_zero() {
            return Err(GateError::Config(
                "merge_poll_interval must be non-zero".to_string(),
            ));
        }
        if let Some(period) = &self.period {
            crate::registry::validate_period(period)?;
        }
        Ok(())
    }

    /// Reporting period used when assigning identifiers.
    pub fn effective_period(&self) -> String {
        match &self.period {
            Some(period) => period.clone(),
            None => current_iso_week(),
        }
    }
}

/// Current ISO week rendered as `YYYYWww`.
pub fn current_iso_week() -> String {
    let week = chrono::Utc::now().iso_week();
    format!("{}W{:02}", week.year(), week.week())
}

/// Parse `<n>`, `<n>ms`, `<n>s`, `<n>m`, `<n>h`, or `<n>d`.
pub fn parse_duration(raw: &str) -> Option<Duration> {
    let trimmed = raw.trim();
    let split = trimmed
        .find(|ch: char| !ch.is_ascii_digit())
        .unwrap_or(trimmed.len());
    let (digits, unit) = trimmed.split_at(split);
    let value: u64 = digits.parse().ok()?;
    let duration = match unit {
        "" | "s" => Duration::from_secs(value),
        "ms" => Duration::from_millis(value),
        "m" => Duration::from_secs(value.checked_mul(60)?),
        "h" => Duration::from_secs(value.checked_mul(60 * 60)?),
        "d" => Duration::from_secs(value.checked_mul(24 * 60 * 60)?),
        _ => return None,
    };
    Some(duration)
}

fn parse_duration_named(name: &str, raw: &str) -> Result<Duration> {
    parse_duration(raw)
        .ok_or_else(|| GateError::Config(format!("{name}: invalid duration {raw:?}")))
}

fn parse_flag(name: &str, raw: &str) -> Result<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" | "" => Ok(false),
        _ => Err(GateError::Config(format!("{name}: invalid flag {raw:?}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn parse_duration_accepts_units() {
        assert_eq!(parse_duration("90"), Some(Duration::from_secs(90)));
        assert_eq!(parse_duration("250ms"), Some(Duration::from_millis(250)));
        assert_eq!(parse_duration("24h"), Some(Duration::from_secs(86_400)));
        assert_eq!(parse_duration("2d"), Some(Duration::from_secs(172_800)));
        assert_eq!(parse_duration("5x"), None);
        assert_eq!(parse_duration("h"), None);
    }

    #[test]
    fn env_overrides_defaults() {
        let env: HashMap<&str, &str> = [
            (ENV_CACHE_TTL, "1h"),
            (ENV_MERGE_POLL, "50ms"),
            (ENV_NONINTERACTIVE, "1"),
            (ENV_STALE_MULTIPLIER, "3"),
            (ENV_PERIOD, "W1"),
        ]
        .into_iter()
        .collect();
        let mut config = GateConfig::default();
        config
            .apply_env(|key| env.get(key).map(|value| value.to_string()))
            .expect("apply env");
        assert_eq!(config.cache_ttl, Duration::from_secs(3600));
        assert_eq!(config.merge_poll_interval, Duration::from_millis(50));
        assert!(config.non_interactive);
        assert_eq!(config.stale_multiplier, 3);
        assert_eq!(config.effective_period(), "W1");
    }

    #[test]
    fn env_rejects_bad_duration_with_variable_name() {
        let mut config = GateConfig::default();
        let err = config
            .apply_env(|key| (key == ENV_MERGE_TIMEOUT).then(|| "soon".to_string()))
            .expect_err("invalid duration");
        assert!(err.to_string().contains(ENV_MERGE_TIMEOUT));
    }

    #[test]
    fn config_file_overlays_and_checks_schema_version() {
        let mut config = GateConfig::default();
        let file = ConfigFile {
            schema_version: CONFIG_SCHEMA_VERSION,
            cache_ttl: Some("30m".to_string()),
            ..ConfigFile::default()
        };
        config.apply_file(&file).expect("apply file");
        assert_eq!(config.cache_ttl, Duration::from_secs(1800));

        let bad = ConfigFile {
            schema_version: 99,
            ..ConfigFile::default()
        };
        assert!(config.apply_file(&bad).is_err());
    }

    #[test]
    fn current_iso_week_has_expected_shape() {
        let week = current_iso_week();
        let (year, rest) = week.split_once('W').expect("W separator");
        assert_eq!(year.len(), 4);
        assert_eq!(rest.len(), 2);
    }
}
