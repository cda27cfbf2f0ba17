use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::limits::*;

/// What to do when the external provider can't answer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FailurePolicy {
    /// Allow the booking; a degraded integration never blocks local bookings.
    #[default]
    Open,
    /// Reject the booking.
    Closed,
}

impl FailurePolicy {
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "open" => Some(Self::Open),
            "closed" => Some(Self::Closed),
            _ => None,
        }
    }
}

/// Knobs for the validator itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidatorConfig {
    pub external_failure_policy: FailurePolicy,
    pub max_external_pages: usize,
    pub external_timeout: Duration,
}

impl Default for ValidatorConfig {
    fn default() -> Self {
        Self {
            external_failure_policy: FailurePolicy::Open,
            max_external_pages: DEFAULT_MAX_EXTERNAL_PAGES,
            external_timeout: Duration::from_millis(DEFAULT_EXTERNAL_TIMEOUT_MS),
        }
    }
}

/// Process configuration, read from `SLOTGUARD_*` environment variables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub validator: ValidatorConfig,
    pub data_dir: PathBuf,
    pub compact_threshold: u64,
    pub metrics_port: Option<u16>,
}

impl Config {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary key lookup; unparseable values fall back to defaults.
    pub fn from_lookup(get: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = ValidatorConfig::default();
        let policy = match get("SLOTGUARD_EXTERNAL_FAILURE_POLICY") {
            Some(raw) => FailurePolicy::parse(&raw).unwrap_or_else(|| {
                tracing::warn!("unknown failure policy {raw:?}, using {:?}", defaults.external_failure_policy);
                defaults.external_failure_policy
            }),
            None => defaults.external_failure_policy,
        };
        let max_pages = get("SLOTGUARD_EXTERNAL_MAX_PAGES")
            .and_then(|s| s.parse().ok())
            .filter(|&n: &usize| n > 0)
            .unwrap_or(defaults.max_external_pages);
        let timeout = get("SLOTGUARD_EXTERNAL_TIMEOUT_MS")
            .and_then(|s| s.parse().ok())
            .map(Duration::from_millis)
            .unwrap_or(defaults.external_timeout);

        Self {
            validator: ValidatorConfig {
                external_failure_policy: policy,
                max_external_pages: max_pages,
                external_timeout: timeout,
            },
            data_dir: PathBuf::from(get("SLOTGUARD_DATA_DIR").unwrap_or_else(|| "./data".into())),
            compact_threshold: get("SLOTGUARD_COMPACT_THRESHOLD")
                .and_then(|s| s.parse().ok())
                .unwrap_or(DEFAULT_COMPACT_THRESHOLD),
            metrics_port: get("SLOTGUARD_METRICS_PORT").and_then(|s| s.parse().ok()),
        }
    }
}
