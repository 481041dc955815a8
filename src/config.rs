use std::path::PathBuf;
use std::str::FromStr;

use crate::calendar::BusinessHours;
use crate::model::{HOUR, MINUTE, Ms};

/// Policy knobs for the lifecycle engine. Passed explicitly, never read from ambient state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    /// Seats per (instructor, start) slot.
    pub slot_capacity: u32,
    /// Cancelling at least this long before the start refunds the access credit.
    pub refund_window_ms: Ms,
    /// How far ahead members may book.
    pub horizon_months: u32,
    pub hours: BusinessHours,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            slot_capacity: 2,
            refund_window_ms: 3 * HOUR,
            horizon_months: 1,
            hours: BusinessHours::default(),
        }
    }
}

impl EngineConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.slot_capacity == 0 {
            return Err(ConfigError::Inconsistent("slot capacity must be at least 1"));
        }
        if self.hours.open_hour > self.hours.close_hour || self.hours.close_hour > 23 {
            return Err(ConfigError::Inconsistent("business hours must satisfy open <= close <= 23"));
        }
        if self.refund_window_ms < 0 {
            return Err(ConfigError::Inconsistent("refund window cannot be negative"));
        }
        Ok(())
    }
}

/// Daemon settings, read from `SLOTBOOK_*` environment variables.
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    pub data_dir: PathBuf,
    pub metrics_port: Option<u16>,
    pub engine: EngineConfig,
    pub compact_threshold: u64,
    pub notify_queue: usize,
    pub notify_concurrency: usize,
    /// UTC hour at which daily reminders go out.
    pub reminder_hour: u32,
    pub slot_retention_days: i64,
    pub audit_retention_days: i64,
}

impl ServiceConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = EngineConfig::default();
        let refund_minutes: i64 = parsed(&lookup, "SLOTBOOK_REFUND_WINDOW_MINUTES", 180)?;
        let closed_dates = match lookup("SLOTBOOK_CLOSED_DATES") {
            Some(raw) => parse_closed_dates(&raw)?,
            None => Vec::new(),
        };

        let engine = EngineConfig {
            slot_capacity: parsed(&lookup, "SLOTBOOK_SLOT_CAPACITY", defaults.slot_capacity)?,
            refund_window_ms: refund_minutes * MINUTE,
            horizon_months: parsed(&lookup, "SLOTBOOK_HORIZON_MONTHS", defaults.horizon_months)?,
            hours: BusinessHours {
                open_hour: parsed(&lookup, "SLOTBOOK_OPEN_HOUR", defaults.hours.open_hour)?,
                close_hour: parsed(&lookup, "SLOTBOOK_CLOSE_HOUR", defaults.hours.close_hour)?,
                closed_dates,
                ..defaults.hours
            },
        };
        engine.validate()?;

        let metrics_port: Option<u16> = match lookup("SLOTBOOK_METRICS_PORT") {
            Some(raw) => Some(raw.parse().map_err(|_| ConfigError::Invalid {
                key: "SLOTBOOK_METRICS_PORT",
                value: raw,
            })?),
            None => None,
        };

        let config = Self {
            data_dir: lookup("SLOTBOOK_DATA_DIR")
                .unwrap_or_else(|| "./data".into())
                .into(),
            metrics_port,
            engine,
            compact_threshold: parsed(&lookup, "SLOTBOOK_COMPACT_THRESHOLD", 1000)?,
            notify_queue: parsed(&lookup, "SLOTBOOK_NOTIFY_QUEUE", 256)?,
            notify_concurrency: parsed(&lookup, "SLOTBOOK_NOTIFY_CONCURRENCY", 4)?,
            reminder_hour: parsed(&lookup, "SLOTBOOK_REMINDER_HOUR", 6)?,
            slot_retention_days: parsed(&lookup, "SLOTBOOK_SLOT_RETENTION_DAYS", 90)?,
            audit_retention_days: parsed(&lookup, "SLOTBOOK_AUDIT_RETENTION_DAYS", 30)?,
        };
        if config.notify_queue == 0 || config.notify_concurrency == 0 {
            return Err(ConfigError::Inconsistent("notification queue and concurrency must be positive"));
        }
        if config.reminder_hour > 23 {
            return Err(ConfigError::Inconsistent("reminder hour must be 0..=23"));
        }
        Ok(config)
    }
}

fn parsed<T: FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &'static str,
    default: T,
) -> Result<T, ConfigError> {
    match lookup(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|_| ConfigError::Invalid { key, value: raw }),
        None => Ok(default),
    }
}

/// `"12-25,01-01"` → `[(12, 25), (1, 1)]`.
fn parse_closed_dates(raw: &str) -> Result<Vec<(u32, u32)>, ConfigError> {
    let invalid = || ConfigError::Invalid {
        key: "SLOTBOOK_CLOSED_DATES",
        value: raw.to_string(),
    };
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|item| {
            let (month, day) = item.split_once('-').ok_or_else(invalid)?;
            let month: u32 = month.parse().map_err(|_| invalid())?;
            let day: u32 = day.parse().map_err(|_| invalid())?;
            if !(1..=12).contains(&month) || !(1..=31).contains(&day) {
                return Err(invalid());
            }
            Ok((month, day))
        })
        .collect()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    Invalid { key: &'static str, value: String },
    Inconsistent(&'static str),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Invalid { key, value } => write!(f, "invalid value for {key}: {value:?}"),
            ConfigError::Inconsistent(msg) => write!(f, "invalid configuration: {msg}"),
        }
    }
}

impl std::error::Error for ConfigError {}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn from_pairs(pairs: &[(&str, &str)]) -> Result<ServiceConfig, ConfigError> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        ServiceConfig::from_lookup(|k| map.get(k).cloned())
    }

    #[test]
    fn defaults_when_unset() {
        let cfg = from_pairs(&[]).unwrap();
        assert_eq!(cfg.engine, EngineConfig::default());
        assert_eq!(cfg.data_dir, PathBuf::from("./data"));
        assert_eq!(cfg.metrics_port, None);
        assert_eq!(cfg.compact_threshold, 1000);
        assert_eq!(cfg.engine.refund_window_ms, 3 * HOUR);
    }

    #[test]
    fn overrides_are_applied() {
        let cfg = from_pairs(&[
            ("SLOTBOOK_SLOT_CAPACITY", "4"),
            ("SLOTBOOK_REFUND_WINDOW_MINUTES", "60"),
            ("SLOTBOOK_CLOSED_DATES", "12-25, 01-01"),
            ("SLOTBOOK_METRICS_PORT", "9100"),
        ])
        .unwrap();
        assert_eq!(cfg.engine.slot_capacity, 4);
        assert_eq!(cfg.engine.refund_window_ms, HOUR);
        assert_eq!(cfg.engine.hours.closed_dates, vec![(12, 25), (1, 1)]);
        assert_eq!(cfg.metrics_port, Some(9100));
    }

    #[test]
    fn garbage_is_rejected() {
        let err = from_pairs(&[("SLOTBOOK_SLOT_CAPACITY", "two")]).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { key: "SLOTBOOK_SLOT_CAPACITY", .. }));
        assert!(from_pairs(&[("SLOTBOOK_CLOSED_DATES", "13-01")]).is_err());
        assert!(from_pairs(&[("SLOTBOOK_CLOSED_DATES", "xmas")]).is_err());
    }

    #[test]
    fn inconsistent_hours_rejected() {
        let err = from_pairs(&[("SLOTBOOK_OPEN_HOUR", "22"), ("SLOTBOOK_CLOSE_HOUR", "8")]).unwrap_err();
        assert!(matches!(err, ConfigError::Inconsistent(_)));
        assert!(from_pairs(&[("SLOTBOOK_SLOT_CAPACITY", "0")]).is_err());
    }
}
