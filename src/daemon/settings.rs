//! User-facing configuration stored under the `settings` key of the document.

use chrono::NaiveTime;
use serde::{Deserialize, Serialize};
use url::Url;

use super::error::ValidationError;

pub const DEFAULT_RETENTION_DAYS: u32 = 90;
pub const DEFAULT_TEMP_ACCESS_MINUTES: u32 = 5;
pub const DEFAULT_BLOCK_PAGE_URL: &str = "chrome-extension://tabwarden/blocked.html";
const MAX_RETENTION_DAYS: u32 = 3650;
const MINUTES_PER_DAY: u32 = 24 * 60;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Settings {
    /// Total daily browsing budget across all domains. The quota check is off when unset.
    pub daily_budget_minutes: Option<u32>,
    pub retention_days: u32,
    /// Added to the built-in loopback exclusions.
    pub excluded_domains: Vec<String>,
    pub block_page_url: String,
    #[serde(with = "hh_mm")]
    pub backup_time: NaiveTime,
    pub temp_access_minutes: u32,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            daily_budget_minutes: None,
            retention_days: DEFAULT_RETENTION_DAYS,
            excluded_domains: vec![],
            block_page_url: DEFAULT_BLOCK_PAGE_URL.into(),
            backup_time: NaiveTime::from_hms_opt(3, 0, 0).unwrap_or(NaiveTime::MIN),
            temp_access_minutes: DEFAULT_TEMP_ACCESS_MINUTES,
        }
    }
}

/// Partial update sent by the options page. Absent fields are left untouched;
/// `dailyBudgetMinutes: 0` disables the budget.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SettingsPatch {
    pub daily_budget_minutes: Option<u32>,
    pub retention_days: Option<u32>,
    pub excluded_domains: Option<Vec<String>>,
    pub block_page_url: Option<String>,
    #[serde(default, with = "hh_mm::option")]
    pub backup_time: Option<NaiveTime>,
    pub temp_access_minutes: Option<u32>,
}

impl Settings {
    /// Produces the patched settings, or rejects the whole patch.
    pub fn patched(&self, patch: SettingsPatch) -> Result<Settings, ValidationError> {
        let mut next = self.clone();

        if let Some(minutes) = patch.daily_budget_minutes {
            if minutes > MINUTES_PER_DAY {
                return Err(ValidationError::invalid(
                    "dailyBudgetMinutes",
                    format!("cannot exceed {MINUTES_PER_DAY} minutes"),
                ));
            }
            next.daily_budget_minutes = (minutes > 0).then_some(minutes);
        }
        if let Some(days) = patch.retention_days {
            if !(1..=MAX_RETENTION_DAYS).contains(&days) {
                return Err(ValidationError::invalid(
                    "retentionDays",
                    format!("must be 1-{MAX_RETENTION_DAYS}"),
                ));
            }
            next.retention_days = days;
        }
        if let Some(domains) = patch.excluded_domains {
            next.excluded_domains = domains
                .into_iter()
                .map(|d| d.trim().to_lowercase())
                .filter(|d| !d.is_empty())
                .collect();
        }
        if let Some(url) = patch.block_page_url {
            Url::parse(&url)
                .map_err(|e| ValidationError::invalid("blockPageUrl", e.to_string()))?;
            next.block_page_url = url;
        }
        if let Some(time) = patch.backup_time {
            next.backup_time = time;
        }
        if let Some(minutes) = patch.temp_access_minutes {
            if !(1..=MINUTES_PER_DAY).contains(&minutes) {
                return Err(ValidationError::invalid(
                    "tempAccessMinutes",
                    format!("must be 1-{MINUTES_PER_DAY}"),
                ));
            }
            next.temp_access_minutes = minutes;
        }

        Ok(next)
    }
}

mod hh_mm {
    use chrono::NaiveTime;
    use serde::{self, Deserialize, Deserializer, Serializer};

    const FORMAT: &str = "%H:%M";

    pub fn serialize<S>(time: &NaiveTime, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&time.format(FORMAT).to_string())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<NaiveTime, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        NaiveTime::parse_from_str(&s, FORMAT).map_err(serde::de::Error::custom)
    }

    pub mod option {
        use chrono::NaiveTime;
        use serde::{Deserialize, Deserializer};

        pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<NaiveTime>, D::Error>
        where
            D: Deserializer<'de>,
        {
            Option::<String>::deserialize(deserializer)?
                .map(|s| NaiveTime::parse_from_str(&s, super::FORMAT))
                .transpose()
                .map_err(serde::de::Error::custom)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_fields_fall_back_to_defaults() {
        let settings: Settings = serde_json::from_str(r#"{"dailyBudgetMinutes": 120}"#).unwrap();
        assert_eq!(settings.daily_budget_minutes, Some(120));
        assert_eq!(settings.retention_days, DEFAULT_RETENTION_DAYS);
        assert_eq!(settings.backup_time, NaiveTime::from_hms_opt(3, 0, 0).unwrap());
    }

    #[test]
    fn test_backup_time_round_trips_as_hours_and_minutes() {
        let json = serde_json::to_value(Settings::default()).unwrap();
        assert_eq!(json["backupTime"], "03:00");
    }

    #[test]
    fn test_patch_rejects_invalid_values_without_partial_update() {
        let settings = Settings::default();
        let patch: SettingsPatch =
            serde_json::from_str(r#"{"retentionDays": 30, "tempAccessMinutes": 0}"#).unwrap();

        assert!(settings.patched(patch).is_err());
        assert_eq!(settings.retention_days, DEFAULT_RETENTION_DAYS);
    }

    #[test]
    fn test_patch_zero_budget_disables_quota() {
        let settings = Settings {
            daily_budget_minutes: Some(60),
            ..Settings::default()
        };
        let patch = SettingsPatch {
            daily_budget_minutes: Some(0),
            backup_time: NaiveTime::from_hms_opt(4, 30, 0),
            ..SettingsPatch::default()
        };

        let next = settings.patched(patch).unwrap();
        assert_eq!(next.daily_budget_minutes, None);
        assert_eq!(next.backup_time, NaiveTime::from_hms_opt(4, 30, 0).unwrap());
    }
}
