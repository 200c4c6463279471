//! Core configuration surface
//!
//! Defaults match the documented operational values; a YAML file can
//! override any subset, section by section.

use std::collections::HashMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::credit::{CreditEngine, CreditEventKind, CreditRule};
use crate::error::{CoreError, CoreResult};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CoreConfig {
    pub barcode: BarcodeConfig,
    pub scan: ScanConfig,
    pub lock: LockConfig,
    pub scheduler: SchedulerConfig,
    pub credit: CreditConfig,
    pub courier: CourierConfig,
    pub cancel: CancelConfig,
}

impl CoreConfig {
    /// Load configuration from a YAML file. Missing sections fall back to
    /// defaults.
    pub fn from_yaml_file(path: impl AsRef<Path>) -> CoreResult<Self> {
        let raw = std::fs::read_to_string(path.as_ref()).map_err(|e| {
            CoreError::bad_input(format!(
                "cannot read config {}: {e}",
                path.as_ref().display()
            ))
        })?;
        serde_yaml::from_str(&raw)
            .map_err(|e| CoreError::bad_input(format!("invalid config YAML: {e}")))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BarcodeConfig {
    /// Unique-code generation retries before `GenerationExhausted`.
    pub code_retries: u32,
    /// Batch creation ceiling.
    pub bulk_max: usize,
    /// Human-readable prefix printed before the code body.
    pub code_prefix: String,
}

impl Default for BarcodeConfig {
    fn default() -> Self {
        Self {
            code_retries: 3,
            bulk_max: 1000,
            code_prefix: "PP".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScanConfig {
    /// Scan events older than this are eligible for cleanup.
    pub retention_days: i64,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self { retention_days: 180 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LockConfig {
    pub default_ttl_seconds: u64,
    /// Auto-extend cadence as a fraction of the TTL.
    pub extend_interval_ratio: f64,
    /// Per-call timeout against the coordination store.
    pub op_timeout_seconds: u64,
    /// Ceiling for `wait_for_lock`.
    pub wait_timeout_seconds: u64,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            default_ttl_seconds: 30,
            extend_interval_ratio: 0.25,
            op_timeout_seconds: 5,
            wait_timeout_seconds: 10,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    pub tick_interval_seconds: u64,
    /// Consecutive failures before a job is disabled pending admin action.
    pub failure_disable_threshold: u32,
    /// Job specs registered at startup, keyed by task id.
    pub jobs: HashMap<String, JobConfig>,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_interval_seconds: 30,
            failure_disable_threshold: 5,
            jobs: HashMap::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct JobConfig {
    pub enabled: bool,
    /// Standard 5-field cron expression.
    pub cron: Option<String>,
    /// One-shot delay as seconds from registration.
    pub delay_seconds: Option<u64>,
    /// Handler key; defaults to the job id when absent.
    pub handler: Option<String>,
    pub payload: serde_json::Value,
}

impl Default for JobConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            cron: None,
            delay_seconds: None,
            handler: None,
            payload: serde_json::Value::Null,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CreditConfig {
    /// When true, grants run after the lifecycle transaction commits
    /// (best-effort) instead of inside it.
    pub post_commit: bool,
    /// Per-kind rule overrides, keyed by the kind's snake_case name.
    pub rules: HashMap<String, CreditRuleConfig>,
}

impl Default for CreditConfig {
    fn default() -> Self {
        Self {
            post_commit: false,
            rules: HashMap::new(),
        }
    }
}

impl CreditConfig {
    /// Merge configured overrides onto the stock rule table.
    pub fn build_engine(&self) -> CoreResult<CreditEngine> {
        let mut rules = CreditEngine::default_rules();
        for (name, overrides) in &self.rules {
            let kind: CreditEventKind = name.parse()?;
            let base = rules.entry(kind).or_insert_with(|| CreditRule::new(0));
            if let Some(points) = overrides.points {
                base.points = points;
            }
            if let Some(active) = overrides.active {
                base.active = active;
            }
            if overrides.daily_limit.is_some() {
                base.daily_limit = overrides.daily_limit;
            }
            if overrides.weekly_limit.is_some() {
                base.weekly_limit = overrides.weekly_limit;
            }
        }
        Ok(CreditEngine::new(rules))
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CreditRuleConfig {
    pub points: Option<i64>,
    pub daily_limit: Option<u32>,
    pub weekly_limit: Option<u32>,
    pub active: Option<bool>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CourierConfig {
    /// Task deadline; overdue tasks are swept for reassignment.
    pub timeout_minutes: i64,
    /// Reassignments before a task escalates to the parent level.
    pub reassign_limit: i32,
}

impl Default for CourierConfig {
    fn default() -> Self {
        Self {
            timeout_minutes: 2880,
            reassign_limit: 2,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CancelConfig {
    /// Window in which the last scanning courier may cancel.
    pub courier_window_minutes: i64,
}

impl Default for CancelConfig {
    fn default() -> Self {
        Self {
            courier_window_minutes: 10,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_match_documented_values() {
        let config = CoreConfig::default();
        assert_eq!(config.barcode.code_retries, 3);
        assert_eq!(config.barcode.bulk_max, 1000);
        assert_eq!(config.scan.retention_days, 180);
        assert_eq!(config.lock.default_ttl_seconds, 30);
        assert!((config.lock.extend_interval_ratio - 0.25).abs() < f64::EPSILON);
        assert_eq!(config.courier.timeout_minutes, 2880);
        assert_eq!(config.cancel.courier_window_minutes, 10);
        assert_eq!(config.scheduler.failure_disable_threshold, 5);
    }

    #[test]
    fn yaml_overrides_partial_sections() {
        let yaml = r#"
barcode:
  code_retries: 5
credit:
  rules:
    letter_created:
      daily_limit: 2
scheduler:
  jobs:
    future_letter_release:
      cron: "*/5 * * * *"
"#;
        let mut file = tempfile::NamedTempFile::new().expect("temp file");
        file.write_all(yaml.as_bytes()).expect("write yaml");

        let config = CoreConfig::from_yaml_file(file.path()).expect("parse config");
        assert_eq!(config.barcode.code_retries, 5);
        assert_eq!(config.barcode.bulk_max, 1000); // untouched default
        let job = config
            .scheduler
            .jobs
            .get("future_letter_release")
            .expect("job present");
        assert_eq!(job.cron.as_deref(), Some("*/5 * * * *"));

        let engine = config.credit.build_engine().expect("engine");
        let rule = engine.rule(CreditEventKind::LetterCreated).expect("rule");
        assert_eq!(rule.daily_limit, Some(2));
        assert_eq!(rule.points, 10); // stock points retained
    }

    #[test]
    fn unknown_rule_kind_is_rejected() {
        let mut config = CreditConfig::default();
        config
            .rules
            .insert("letter_burned".to_string(), CreditRuleConfig::default());
        assert!(config.build_engine().is_err());
    }
}
