use crate::model::*;

use super::window::window_containing;
use super::EngineError;

pub(crate) const MINUTE_MS: Ms = 60_000;

pub(crate) fn validate_span(span: &Span) -> Result<(), EngineError> {
    use crate::caps::*;
    if span.start < MIN_VALID_TIMESTAMP_MS || span.end > MAX_VALID_TIMESTAMP_MS {
        return Err(EngineError::LimitExceeded("timestamp out of range"));
    }
    if span.duration_ms() > MAX_SPAN_DURATION_MS {
        return Err(EngineError::LimitExceeded("span too wide"));
    }
    Ok(())
}

/// Bookings started inside `window`.
pub(crate) fn booked_count(st: &SubjectState, window: &Span) -> u64 {
    st.starting_in(window).len() as u64
}

/// Minutes booked inside `window`, counting each booking by its start.
/// Sub-minute remainders round up so a 61-second slot costs 2 minutes.
pub(crate) fn booked_minutes(st: &SubjectState, window: &Span) -> i64 {
    st.starting_in(window)
        .iter()
        .map(|b| (b.span.duration_ms() + MINUTE_MS - 1) / MINUTE_MS)
        .sum()
}

/// Admission check for a new booking at `span`: every configured cap of the
/// subject must still hold after adding it. `pending` carries spans accepted
/// earlier in the same batch so an atomic batch cannot slip past a cap one
/// member at a time.
pub(crate) fn check_quota(
    st: &SubjectState,
    span: &Span,
    pending: &[Span],
) -> Result<(), EngineError> {
    for (unit, cap) in st.booking_limits.entries() {
        let window = window_containing(unit, span.start);
        let used = booked_count(st, &window)
            + pending.iter().filter(|p| window.contains_instant(p.start)).count() as u64;
        if used + 1 > u64::from(cap) {
            return Err(EngineError::QuotaExceeded {
                kind: LimitKind::Bookings,
                unit,
                cap,
            });
        }
    }

    let minutes = (span.duration_ms() + MINUTE_MS - 1) / MINUTE_MS;
    for (unit, cap) in st.duration_limits.entries() {
        let window = window_containing(unit, span.start);
        let used = booked_minutes(st, &window)
            + pending
                .iter()
                .filter(|p| window.contains_instant(p.start))
                .map(|p| (p.duration_ms() + MINUTE_MS - 1) / MINUTE_MS)
                .sum::<i64>();
        if used + minutes > i64::from(cap) {
            return Err(EngineError::QuotaExceeded {
                kind: LimitKind::Minutes,
                unit,
                cap,
            });
        }
    }

    Ok(())
}
