use ulid::Ulid;

use crate::caps::*;
use crate::model::*;

use super::quota::{booked_count, booked_minutes};
use super::window::window_containing;
use super::{Engine, EngineError};

impl Engine {
    pub fn list_subjects(&self) -> Vec<SubjectInfo> {
        self.state
            .iter()
            .map(|entry| {
                let st = entry.value().clone();
                let guard = st.try_read().expect("list_subjects: uncontended read");
                SubjectInfo {
                    id: guard.id,
                    name: guard.name.clone(),
                }
            })
            .collect()
    }

    pub async fn get_limits(
        &self,
        subject_id: Ulid,
        kind: LimitKind,
    ) -> Result<LimitSet, EngineError> {
        let st = self
            .get_subject(&subject_id)
            .ok_or(EngineError::NotFound(subject_id))?;
        let guard = st.read().await;
        Ok(*guard.limits(kind))
    }

    pub async fn get_bookings(&self, subject_id: Ulid) -> Result<Vec<BookingInfo>, EngineError> {
        let st = match self.get_subject(&subject_id) {
            Some(st) => st,
            None => return Ok(vec![]),
        };
        let guard = st.read().await;
        Ok(guard
            .bookings
            .iter()
            .map(|b| BookingInfo {
                id: b.id,
                subject_id,
                start: b.span.start,
                end: b.span.end,
                label: b.label.clone(),
            })
            .collect())
    }

    /// One row per configured cap: the window containing `at`, the amount
    /// consumed in it, and the cap. Booking-count rows first, then duration
    /// rows, each in unit rank order.
    pub async fn usage(&self, subject_id: Ulid, at: Ms) -> Result<Vec<UsageRow>, EngineError> {
        if !(MIN_VALID_TIMESTAMP_MS..=MAX_VALID_TIMESTAMP_MS).contains(&at) {
            return Err(EngineError::LimitExceeded("timestamp out of range"));
        }
        let st = self
            .get_subject(&subject_id)
            .ok_or(EngineError::NotFound(subject_id))?;
        let guard = st.read().await;

        let mut rows = Vec::new();
        for kind in [LimitKind::Bookings, LimitKind::Minutes] {
            for (unit, cap) in guard.limits(kind).entries() {
                let window = window_containing(unit, at);
                let used = match kind {
                    LimitKind::Bookings => booked_count(&guard, &window),
                    LimitKind::Minutes => booked_minutes(&guard, &window) as u64,
                };
                rows.push(UsageRow {
                    kind,
                    unit,
                    window_start: window.start,
                    window_end: window.end,
                    used,
                    cap,
                });
            }
        }
        Ok(rows)
    }
}
