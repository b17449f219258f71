use std::fmt;

use serde::de::{self, MapAccess, Visitor};
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use ulid::Ulid;

/// Unix milliseconds — the only time type.
pub type Ms = i64;

/// Half-open interval `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Span {
    pub start: Ms,
    pub end: Ms,
}

impl Span {
    pub fn new(start: Ms, end: Ms) -> Self {
        debug_assert!(start < end, "Span start must be before end");
        Self { start, end }
    }

    pub fn duration_ms(&self) -> Ms {
        self.end - self.start
    }

    pub fn contains_instant(&self, t: Ms) -> bool {
        self.start <= t && t < self.end
    }
}

/// The period granularity a cap applies to. Declaration order is rank order:
/// shorter periods first, so `Day < Week < Month < Year`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum LimitUnit {
    Day,
    Week,
    Month,
    Year,
}

/// All units in rank order. "Ascending" is defined against this table, never
/// against map insertion order.
pub const ASCENDING_UNITS: [LimitUnit; 4] = [
    LimitUnit::Day,
    LimitUnit::Week,
    LimitUnit::Month,
    LimitUnit::Year,
];

impl LimitUnit {
    pub fn rank(self) -> usize {
        self as usize
    }

    /// Wire/JSON key, matching the persisted shape.
    pub fn key(self) -> &'static str {
        match self {
            LimitUnit::Day => "PER_DAY",
            LimitUnit::Week => "PER_WEEK",
            LimitUnit::Month => "PER_MONTH",
            LimitUnit::Year => "PER_YEAR",
        }
    }

    /// Display label.
    pub fn label(self) -> &'static str {
        match self {
            LimitUnit::Day => "Day",
            LimitUnit::Week => "Week",
            LimitUnit::Month => "Month",
            LimitUnit::Year => "Year",
        }
    }

    pub fn from_key(key: &str) -> Option<Self> {
        match key {
            "PER_DAY" => Some(LimitUnit::Day),
            "PER_WEEK" => Some(LimitUnit::Week),
            "PER_MONTH" => Some(LimitUnit::Month),
            "PER_YEAR" => Some(LimitUnit::Year),
            _ => None,
        }
    }
}

/// Which limit set of a subject is being addressed: caps on booking counts,
/// or caps on total booked minutes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LimitKind {
    Bookings,
    Minutes,
}

impl LimitKind {
    pub fn noun(self) -> &'static str {
        match self {
            LimitKind::Bookings => "booking",
            LimitKind::Minutes => "duration",
        }
    }
}

/// A mapping from period unit to a positive cap: "at most N per day/week/
/// month/year". 0–4 entries; an empty set means no limits are active.
///
/// One optional field per unit, so an invalid key cannot be represented and
/// iteration is inherently in rank order. Serializes as a map of present
/// entries (`{"PER_DAY": 1, "PER_WEEK": 5}`), the shape the limits are
/// persisted and exchanged in.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LimitSet {
    per_day: Option<u32>,
    per_week: Option<u32>,
    per_month: Option<u32>,
    per_year: Option<u32>,
}

impl LimitSet {
    pub fn get(&self, unit: LimitUnit) -> Option<u32> {
        match unit {
            LimitUnit::Day => self.per_day,
            LimitUnit::Week => self.per_week,
            LimitUnit::Month => self.per_month,
            LimitUnit::Year => self.per_year,
        }
    }

    pub fn set(&mut self, unit: LimitUnit, cap: u32) {
        match unit {
            LimitUnit::Day => self.per_day = Some(cap),
            LimitUnit::Week => self.per_week = Some(cap),
            LimitUnit::Month => self.per_month = Some(cap),
            LimitUnit::Year => self.per_year = Some(cap),
        }
    }

    /// Builder-style `set`, for literals.
    pub fn with(mut self, unit: LimitUnit, cap: u32) -> Self {
        self.set(unit, cap);
        self
    }

    /// Present entries in rank order (day first).
    pub fn entries(&self) -> impl Iterator<Item = (LimitUnit, u32)> + '_ {
        ASCENDING_UNITS
            .iter()
            .filter_map(|&u| self.get(u).map(|cap| (u, cap)))
    }

    pub fn len(&self) -> usize {
        self.entries().count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// True iff caps are non-decreasing as the period widens: a shorter
    /// period must not permit more than a longer one. Vacuously true for 0
    /// or 1 entries. Equal caps across units pass (non-decreasing, not
    /// strictly increasing). Pure — the write path maps `false` to a
    /// rejection of the whole update.
    pub fn is_ascending(&self) -> bool {
        let mut prev: Option<u32> = None;
        for (_, cap) in self.entries() {
            if let Some(p) = prev
                && p > cap
            {
                return false;
            }
            prev = Some(cap);
        }
        true
    }
}

impl Serialize for LimitSet {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.len()))?;
        for (unit, cap) in self.entries() {
            map.serialize_entry(unit.key(), &cap)?;
        }
        map.end()
    }
}

impl<'de> Deserialize<'de> for LimitSet {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct LimitSetVisitor;

        impl<'de> Visitor<'de> for LimitSetVisitor {
            type Value = LimitSet;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                write!(f, "a map from PER_* keys to integer caps")
            }

            fn visit_map<A: MapAccess<'de>>(self, mut access: A) -> Result<LimitSet, A::Error> {
                let mut set = LimitSet::default();
                while let Some(key) = access.next_key::<String>()? {
                    let unit = LimitUnit::from_key(&key)
                        .ok_or_else(|| de::Error::custom(format!("unknown limit key: {key}")))?;
                    if set.get(unit).is_some() {
                        return Err(de::Error::custom(format!("duplicate limit key: {key}")));
                    }
                    set.set(unit, access.next_value()?);
                }
                Ok(set)
            }
        }

        deserializer.deserialize_map(LimitSetVisitor)
    }
}

/// A recorded booking against a subject.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Booking {
    pub id: Ulid,
    pub span: Span,
    pub label: Option<String>,
}

/// The record limits attach to — a user or an event type in the calling
/// application. Holds both limit sets and every recorded booking.
#[derive(Debug, Clone)]
pub struct SubjectState {
    pub id: Ulid,
    pub name: Option<String>,
    pub booking_limits: LimitSet,
    pub duration_limits: LimitSet,
    /// All bookings, sorted by `span.start`.
    pub bookings: Vec<Booking>,
}

impl SubjectState {
    pub fn new(id: Ulid, name: Option<String>) -> Self {
        Self {
            id,
            name,
            booking_limits: LimitSet::default(),
            duration_limits: LimitSet::default(),
            bookings: Vec::new(),
        }
    }

    pub fn limits(&self, kind: LimitKind) -> &LimitSet {
        match kind {
            LimitKind::Bookings => &self.booking_limits,
            LimitKind::Minutes => &self.duration_limits,
        }
    }

    pub fn set_limits(&mut self, kind: LimitKind, limits: LimitSet) {
        match kind {
            LimitKind::Bookings => self.booking_limits = limits,
            LimitKind::Minutes => self.duration_limits = limits,
        }
    }

    /// Insert booking maintaining sort order by span.start.
    pub fn insert_booking(&mut self, booking: Booking) {
        let pos = self
            .bookings
            .binary_search_by_key(&booking.span.start, |b| b.span.start)
            .unwrap_or_else(|e| e);
        self.bookings.insert(pos, booking);
    }

    /// Remove booking by id.
    pub fn remove_booking(&mut self, id: Ulid) -> Option<Booking> {
        if let Some(pos) = self.bookings.iter().position(|b| b.id == id) {
            Some(self.bookings.remove(pos))
        } else {
            None
        }
    }

    /// Bookings whose start falls inside `window`. Binary search on both
    /// edges — the vec is sorted by start.
    pub fn starting_in(&self, window: &Span) -> &[Booking] {
        let lo = self.bookings.partition_point(|b| b.span.start < window.start);
        let hi = self.bookings.partition_point(|b| b.span.start < window.end);
        &self.bookings[lo..hi]
    }
}

/// The event types — flat, no nesting. This is the WAL record format.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    SubjectCreated {
        id: Ulid,
        name: Option<String>,
    },
    SubjectUpdated {
        id: Ulid,
        name: Option<String>,
    },
    SubjectDeleted {
        id: Ulid,
    },
    /// Wholesale replacement of one limit set — never a partial-field edit.
    /// An empty set clears the limits.
    LimitsReplaced {
        subject_id: Ulid,
        kind: LimitKind,
        limits: LimitSet,
    },
    BookingRecorded {
        id: Ulid,
        subject_id: Ulid,
        span: Span,
        label: Option<String>,
    },
    BookingCancelled {
        id: Ulid,
        subject_id: Ulid,
    },
}

// ── Query result types ───────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubjectInfo {
    pub id: Ulid,
    pub name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BookingInfo {
    pub id: Ulid,
    pub subject_id: Ulid,
    pub start: Ms,
    pub end: Ms,
    pub label: Option<String>,
}

/// One row of the usage report: how much of a cap is consumed in the window
/// containing the queried instant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UsageRow {
    pub kind: LimitKind,
    pub unit: LimitUnit,
    pub window_start: Ms,
    pub window_end: Ms,
    pub used: u64,
    pub cap: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn span_basics() {
        let s = Span::new(100, 200);
        assert_eq!(s.duration_ms(), 100);
        assert!(s.contains_instant(100));
        assert!(s.contains_instant(199));
        assert!(!s.contains_instant(200)); // half-open
    }

    #[test]
    fn unit_rank_table() {
        assert_eq!(LimitUnit::Day.rank(), 0);
        assert_eq!(LimitUnit::Week.rank(), 1);
        assert_eq!(LimitUnit::Month.rank(), 2);
        assert_eq!(LimitUnit::Year.rank(), 3);
        assert!(LimitUnit::Day < LimitUnit::Year);
        for (i, u) in ASCENDING_UNITS.iter().enumerate() {
            assert_eq!(u.rank(), i);
        }
    }

    #[test]
    fn unit_keys_and_labels() {
        assert_eq!(LimitUnit::Day.key(), "PER_DAY");
        assert_eq!(LimitUnit::Week.label(), "Week");
        for u in ASCENDING_UNITS {
            assert_eq!(LimitUnit::from_key(u.key()), Some(u));
        }
        assert_eq!(LimitUnit::from_key("PER_FORTNIGHT"), None);
    }

    #[test]
    fn empty_and_single_sets_are_ascending() {
        assert!(LimitSet::default().is_ascending());
        for u in ASCENDING_UNITS {
            assert!(LimitSet::default().with(u, 7).is_ascending());
        }
    }

    #[test]
    fn ascending_pair_passes() {
        let set = LimitSet::default()
            .with(LimitUnit::Day, 1)
            .with(LimitUnit::Week, 5);
        assert!(set.is_ascending());
    }

    #[test]
    fn descending_pair_fails() {
        let set = LimitSet::default()
            .with(LimitUnit::Day, 5)
            .with(LimitUnit::Week, 1);
        assert!(!set.is_ascending());
    }

    #[test]
    fn equal_caps_nonadjacent_units_pass() {
        // Non-decreasing, not strictly increasing.
        let set = LimitSet::default()
            .with(LimitUnit::Day, 2)
            .with(LimitUnit::Month, 2);
        assert!(set.is_ascending());
    }

    #[test]
    fn construction_order_is_irrelevant() {
        let set = LimitSet::default()
            .with(LimitUnit::Week, 3)
            .with(LimitUnit::Day, 3)
            .with(LimitUnit::Year, 10);
        assert!(set.is_ascending());
        // Same entries in another insertion order compare equal.
        let other = LimitSet::default()
            .with(LimitUnit::Year, 10)
            .with(LimitUnit::Day, 3)
            .with(LimitUnit::Week, 3);
        assert_eq!(set, other);
    }

    #[test]
    fn is_ascending_is_idempotent() {
        let good = LimitSet::default()
            .with(LimitUnit::Day, 1)
            .with(LimitUnit::Year, 9);
        let bad = LimitSet::default()
            .with(LimitUnit::Month, 9)
            .with(LimitUnit::Year, 1);
        assert_eq!(good.is_ascending(), good.is_ascending());
        assert_eq!(bad.is_ascending(), bad.is_ascending());
    }

    #[test]
    fn dip_at_the_end_fails() {
        let set = LimitSet::default()
            .with(LimitUnit::Day, 1)
            .with(LimitUnit::Week, 2)
            .with(LimitUnit::Month, 3)
            .with(LimitUnit::Year, 2);
        assert!(!set.is_ascending());
    }

    #[test]
    fn entries_iterate_in_rank_order() {
        let set = LimitSet::default()
            .with(LimitUnit::Year, 10)
            .with(LimitUnit::Day, 1);
        let units: Vec<LimitUnit> = set.entries().map(|(u, _)| u).collect();
        assert_eq!(units, vec![LimitUnit::Day, LimitUnit::Year]);
        assert_eq!(set.len(), 2);
        assert!(!set.is_empty());
    }

    #[test]
    fn limit_set_json_shape() {
        let set = LimitSet::default()
            .with(LimitUnit::Day, 1)
            .with(LimitUnit::Week, 5);
        let json = serde_json::to_value(set).unwrap();
        assert_eq!(json, serde_json::json!({"PER_DAY": 1, "PER_WEEK": 5}));

        let parsed: LimitSet = serde_json::from_value(json).unwrap();
        assert_eq!(parsed, set);
    }

    #[test]
    fn limit_set_json_empty() {
        let set = LimitSet::default();
        assert_eq!(serde_json::to_string(&set).unwrap(), "{}");
        let parsed: LimitSet = serde_json::from_str("{}").unwrap();
        assert!(parsed.is_empty());
    }

    #[test]
    fn limit_set_json_rejects_unknown_key() {
        let err = serde_json::from_str::<LimitSet>(r#"{"PER_HOUR": 3}"#).unwrap_err();
        assert!(err.to_string().contains("unknown limit key"));
    }

    #[test]
    fn limit_set_json_rejects_duplicate_key() {
        let err = serde_json::from_str::<LimitSet>(r#"{"PER_DAY": 1, "PER_DAY": 2}"#).unwrap_err();
        assert!(err.to_string().contains("duplicate limit key"));
    }

    #[test]
    fn booking_ordering() {
        let mut st = SubjectState::new(Ulid::new(), None);
        st.insert_booking(Booking {
            id: Ulid::new(),
            span: Span::new(300, 400),
            label: None,
        });
        st.insert_booking(Booking {
            id: Ulid::new(),
            span: Span::new(100, 200),
            label: Some("standup".into()),
        });
        st.insert_booking(Booking {
            id: Ulid::new(),
            span: Span::new(200, 300),
            label: None,
        });
        assert_eq!(st.bookings[0].span.start, 100);
        assert_eq!(st.bookings[1].span.start, 200);
        assert_eq!(st.bookings[2].span.start, 300);
    }

    #[test]
    fn booking_remove() {
        let mut st = SubjectState::new(Ulid::new(), None);
        let id = Ulid::new();
        st.insert_booking(Booking {
            id,
            span: Span::new(100, 200),
            label: None,
        });
        assert_eq!(st.bookings.len(), 1);
        assert!(st.remove_booking(id).is_some());
        assert!(st.bookings.is_empty());
        assert!(st.remove_booking(id).is_none());
    }

    #[test]
    fn starting_in_slices_by_start() {
        let mut st = SubjectState::new(Ulid::new(), None);
        for start in [100, 250, 400, 550] {
            st.insert_booking(Booking {
                id: Ulid::new(),
                span: Span::new(start, start + 100),
                label: None,
            });
        }
        let window = Span::new(250, 550);
        let hits = st.starting_in(&window);
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].span.start, 250); // window start is inclusive
        assert_eq!(hits[1].span.start, 400); // 550 excluded — half-open
    }

    #[test]
    fn starting_in_ignores_span_overlap() {
        // A booking that overlaps the window but starts before it does not count.
        let mut st = SubjectState::new(Ulid::new(), None);
        st.insert_booking(Booking {
            id: Ulid::new(),
            span: Span::new(100, 900),
            label: None,
        });
        assert!(st.starting_in(&Span::new(200, 800)).is_empty());
    }

    #[test]
    fn event_serialization_roundtrip() {
        let event = Event::LimitsReplaced {
            subject_id: Ulid::new(),
            kind: LimitKind::Bookings,
            limits: LimitSet::default()
                .with(LimitUnit::Day, 2)
                .with(LimitUnit::Week, 9),
        };
        let bytes = bincode::serialize(&event).unwrap();
        let decoded: Event = bincode::deserialize(&bytes).unwrap();
        assert_eq!(event, decoded);
    }

    #[test]
    fn booking_event_roundtrip() {
        let event = Event::BookingRecorded {
            id: Ulid::new(),
            subject_id: Ulid::new(),
            span: Span::new(1000, 2000),
            label: Some("intro call".into()),
        };
        let bytes = bincode::serialize(&event).unwrap();
        let decoded: Event = bincode::deserialize(&bytes).unwrap();
        assert_eq!(event, decoded);
    }
}
