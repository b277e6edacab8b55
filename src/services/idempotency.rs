// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! Duplicate-dose detection.
//!
//! A dose counts as already taken when a `taken` intake record exists for the
//! same medication on the same calendar day within [`DUPLICATE_TOLERANCE_SECS`] of
//! the requested scheduled time. The tolerance absorbs device clock skew.
//!
//! Lookups fail open: if the store cannot be queried the dose is allowed, so
//! a store outage never blocks dose logging.

use crate::db::{collections, DocumentStore, DocumentStoreExt, Filter};
use crate::error::Result;
use crate::models::{IntakeRecord, IntakeStatus};
use crate::time_utils::{day_bounds, day_bounds_containing, format_utc_rfc3339};
use chrono::{DateTime, FixedOffset, NaiveDate, Offset, Utc};
use serde::Serialize;
use std::sync::Arc;

/// Records closer than this to the requested time are the same dose.
pub const DUPLICATE_TOLERANCE_SECS: i64 = 60;

/// Absolute distance between two instants in milliseconds.
fn distance_ms(a: DateTime<Utc>, b: DateTime<Utc>) -> i64 {
    (a - b).num_milliseconds().abs()
}

/// Outcome of a duplicate-dose check.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DoseCheck {
    pub can_take: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub existing_intake_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub taken_at: Option<DateTime<Utc>>,
}

impl DoseCheck {
    fn allowed() -> Self {
        Self {
            can_take: true,
            reason: None,
            existing_intake_id: None,
            taken_at: None,
        }
    }
}

pub struct DoseCompletionTracker {
    docs: Arc<dyn DocumentStore>,
    /// Zone used to decide what "the same day" means.
    offset: FixedOffset,
}

impl DoseCompletionTracker {
    pub fn new(docs: Arc<dyn DocumentStore>) -> Self {
        Self::with_offset(docs, Utc.fix())
    }

    pub fn with_offset(docs: Arc<dyn DocumentStore>, offset: FixedOffset) -> Self {
        Self { docs, offset }
    }

    pub async fn can_take_dose(
        &self,
        medication_id: &str,
        scheduled_time: DateTime<Utc>,
    ) -> DoseCheck {
        let (start, end) = day_bounds_containing(scheduled_time, self.offset);

        let records = match self.taken_between(medication_id, start, end).await {
            Ok(records) => records,
            Err(e) => {
                tracing::warn!(
                    medication_id = %medication_id,
                    error = %e,
                    "Duplicate-dose lookup failed; allowing dose"
                );
                return DoseCheck::allowed();
            }
        };

        let duplicate = records
            .into_iter()
            .filter(|r| distance_ms(r.scheduled_time, scheduled_time) < DUPLICATE_TOLERANCE_SECS * 1000)
            .min_by_key(|r| distance_ms(r.scheduled_time, scheduled_time));

        match duplicate {
            Some(existing) => {
                let taken_at = existing.taken_at.unwrap_or(existing.scheduled_time);
                tracing::info!(
                    medication_id = %medication_id,
                    existing_intake_id = %existing.id,
                    "Duplicate dose rejected"
                );
                DoseCheck {
                    can_take: false,
                    reason: Some(format!(
                        "This dose was already recorded as taken at {}",
                        format_utc_rfc3339(taken_at)
                    )),
                    existing_intake_id: Some(existing.id),
                    taken_at: Some(taken_at),
                }
            }
            None => DoseCheck::allowed(),
        }
    }

    pub async fn is_dose_completed(
        &self,
        medication_id: &str,
        scheduled_time: DateTime<Utc>,
    ) -> bool {
        !self.can_take_dose(medication_id, scheduled_time).await.can_take
    }

    /// Scheduled times of doses taken today, in order.
    pub async fn completed_doses_for_today(
        &self,
        medication_id: &str,
    ) -> Result<Vec<DateTime<Utc>>> {
        let (start, end) = day_bounds_containing(Utc::now(), self.offset);
        self.completed_between(medication_id, start, end).await
    }

    /// Scheduled times of doses taken on `date`, in order.
    pub async fn completed_doses_on(
        &self,
        medication_id: &str,
        date: NaiveDate,
    ) -> Result<Vec<DateTime<Utc>>> {
        let (start, end) = day_bounds(date, self.offset);
        self.completed_between(medication_id, start, end).await
    }

    async fn completed_between(
        &self,
        medication_id: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<DateTime<Utc>>> {
        let mut times: Vec<DateTime<Utc>> = self
            .taken_between(medication_id, start, end)
            .await?
            .into_iter()
            .map(|r| r.scheduled_time)
            .collect();
        times.sort();
        times.dedup();
        Ok(times)
    }

    async fn taken_between(
        &self,
        medication_id: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<IntakeRecord>> {
        let filters = [
            Filter::eq("medicationId", medication_id),
            Filter::eq("status", IntakeStatus::Taken.as_str()),
            Filter::gte("scheduledTime", start.timestamp_millis()),
            Filter::lt("scheduledTime", end.timestamp_millis()),
        ];
        Ok(self
            .docs
            .query_as::<IntakeRecord>(collections::INTAKE_RECORDS, &filters)
            .await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn distance_is_symmetric() {
        let a = Utc::now();
        let b = a + Duration::seconds(30);
        assert_eq!(distance_ms(a, b), 30_000);
        assert_eq!(distance_ms(b, a), 30_000);
    }

    #[test]
    fn allowed_check_serializes_without_extras() {
        let v = serde_json::to_value(DoseCheck::allowed()).unwrap();
        assert_eq!(v, serde_json::json!({ "canTake": true }));
    }
}
