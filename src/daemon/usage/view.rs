use std::collections::BTreeMap;

use chrono::NaiveDate;
use serde::Serialize;

use crate::daemon::storage::entities::{UsageClass, UsageRecord};

/// Aggregated per-domain usage returned to the popup and options page.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageView {
    pub date: NaiveDate,
    pub total_today: u64,
    pub domains: BTreeMap<String, DomainUsage>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DomainUsage {
    pub today: u64,
    pub today_general: u64,
    pub today_restricted: u64,
    pub cumulative: u64,
    pub blocked_today: u32,
    pub temp_access_count: u32,
}

impl DomainUsage {
    pub fn from_record(record: &UsageRecord, today: NaiveDate) -> Self {
        Self {
            today: record.seconds_on(today),
            today_general: record.seconds_on_as(today, UsageClass::General),
            today_restricted: record.seconds_on_as(today, UsageClass::Restricted),
            cumulative: record.cumulative,
            blocked_today: record.blocked_on(today),
            temp_access_count: record.temp_access_count,
        }
    }
}
