//! Threshold bookkeeping for the daily budget and per-site limit notifications. Both are
//! deduplicated per calendar day through sets stored in the document.

use chrono::NaiveDate;

use super::storage::entities::DailySet;

pub const QUOTA_THRESHOLDS: [u8; 3] = [75, 90, 100];

/// Marks every threshold `used_seconds` has reached as sent and returns the highest one that
/// was not sent before today. Only that one is worth a notification.
pub fn newly_crossed_threshold(
    sent: &mut DailySet<u8>,
    today: NaiveDate,
    used_seconds: u64,
    budget_seconds: u64,
) -> Option<u8> {
    if budget_seconds == 0 {
        return None;
    }
    QUOTA_THRESHOLDS
        .into_iter()
        .filter(|threshold| used_seconds * 100 >= budget_seconds * u64::from(*threshold))
        .filter(|threshold| sent.insert_for(today, *threshold))
        .max()
}
