use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{oneshot, RwLock};
use ulid::Ulid;

use crate::caps::*;
use crate::model::*;

use super::quota::{check_quota, validate_span};
use super::{apply_to_subject, Engine, EngineError, WalCommand};

impl Engine {
    pub async fn create_subject(
        &self,
        id: Ulid,
        name: Option<String>,
    ) -> Result<(), EngineError> {
        if self.state.len() >= MAX_SUBJECTS_PER_TENANT {
            return Err(EngineError::LimitExceeded("too many subjects"));
        }
        if let Some(ref n) = name
            && n.len() > MAX_NAME_LEN
        {
            return Err(EngineError::LimitExceeded("subject name too long"));
        }
        if self.state.contains_key(&id) {
            return Err(EngineError::AlreadyExists(id));
        }

        let event = Event::SubjectCreated { id, name: name.clone() };
        self.wal_append(&event).await?;
        let st = SubjectState::new(id, name);
        self.state.insert(id, Arc::new(RwLock::new(st)));
        self.notify.send(id, &event);
        Ok(())
    }

    pub async fn update_subject(
        &self,
        id: Ulid,
        name: Option<String>,
    ) -> Result<(), EngineError> {
        if let Some(ref n) = name
            && n.len() > MAX_NAME_LEN
        {
            return Err(EngineError::LimitExceeded("subject name too long"));
        }
        let st = self.get_subject(&id).ok_or(EngineError::NotFound(id))?;
        let mut guard = st.write().await;

        let event = Event::SubjectUpdated { id, name };
        self.persist_and_apply(id, &mut guard, &event).await
    }

    pub async fn delete_subject(&self, id: Ulid) -> Result<(), EngineError> {
        let st = self.get_subject(&id).ok_or(EngineError::NotFound(id))?;
        let guard = st.read().await;
        for booking in &guard.bookings {
            self.booking_to_subject.remove(&booking.id);
        }
        drop(guard);

        let event = Event::SubjectDeleted { id };
        self.wal_append(&event).await?;
        self.state.remove(&id);
        self.notify.send(id, &event);
        self.notify.remove(&id);
        Ok(())
    }

    /// The limits write path: validate, then replace the stored set
    /// wholesale. A rejected set leaves the stored one untouched; an empty
    /// set clears the limits.
    pub async fn replace_limits(
        &self,
        subject_id: Ulid,
        kind: LimitKind,
        limits: LimitSet,
    ) -> Result<(), EngineError> {
        for (unit, cap) in limits.entries() {
            if cap == 0 {
                return Err(EngineError::InvalidCap { kind, unit });
            }
            if cap > MAX_CAP_VALUE {
                return Err(EngineError::LimitExceeded("limit cap too large"));
            }
        }
        if !limits.is_ascending() {
            return Err(EngineError::NotAscending(kind));
        }

        let st = self
            .get_subject(&subject_id)
            .ok_or(EngineError::NotFound(subject_id))?;
        let mut guard = st.write().await;

        let event = Event::LimitsReplaced { subject_id, kind, limits };
        self.persist_and_apply(subject_id, &mut guard, &event).await
    }

    pub async fn clear_limits(
        &self,
        subject_id: Ulid,
        kind: LimitKind,
    ) -> Result<(), EngineError> {
        self.replace_limits(subject_id, kind, LimitSet::default()).await
    }

    pub async fn record_booking(
        &self,
        id: Ulid,
        subject_id: Ulid,
        span: Span,
        label: Option<String>,
    ) -> Result<(), EngineError> {
        validate_span(&span)?;
        if let Some(ref l) = label
            && l.len() > MAX_LABEL_LEN
        {
            return Err(EngineError::LimitExceeded("label too long"));
        }
        if self.booking_to_subject.contains_key(&id) {
            return Err(EngineError::AlreadyExists(id));
        }
        let st = self
            .get_subject(&subject_id)
            .ok_or(EngineError::NotFound(subject_id))?;
        let mut guard = st.write().await;
        if guard.bookings.len() >= MAX_BOOKINGS_PER_SUBJECT {
            return Err(EngineError::LimitExceeded("too many bookings on subject"));
        }

        check_quota(&guard, &span, &[])?;

        let event = Event::BookingRecorded { id, subject_id, span, label };
        self.persist_and_apply(subject_id, &mut guard, &event).await
    }

    /// Atomically record multiple bookings (a recurring series).
    /// All-or-nothing: if any member would exceed a cap, none are committed.
    /// Members may target different subjects.
    pub async fn batch_record_bookings(
        &self,
        bookings: Vec<(Ulid, Ulid, Span, Option<String>)>,
    ) -> Result<(), EngineError> {
        if bookings.is_empty() {
            return Ok(());
        }
        if bookings.len() > MAX_BATCH_SIZE {
            return Err(EngineError::LimitExceeded("batch too large"));
        }
        for (id, _, span, label) in &bookings {
            validate_span(span)?;
            if let Some(l) = label
                && l.len() > MAX_LABEL_LEN
            {
                return Err(EngineError::LimitExceeded("label too long"));
            }
            if self.booking_to_subject.contains_key(id) {
                return Err(EngineError::AlreadyExists(*id));
            }
        }

        // Acquire write locks in sorted order to prevent deadlocks.
        let mut subject_ids: Vec<Ulid> = bookings.iter().map(|(_, sid, _, _)| *sid).collect();
        subject_ids.sort();
        subject_ids.dedup();

        let mut guards = Vec::with_capacity(subject_ids.len());
        let mut guard_index = HashMap::new();

        for sid in &subject_ids {
            let st = self
                .get_subject(sid)
                .ok_or(EngineError::NotFound(*sid))?;
            let guard = st.write_owned().await;
            guard_index.insert(*sid, guards.len());
            guards.push(guard);
        }

        // Phase 1: Validate every member against current state plus the
        // earlier members of the batch for the same subject.
        let mut pending: HashMap<Ulid, Vec<Span>> = HashMap::new();
        for (_, sid, span, _) in &bookings {
            let guard = &guards[guard_index[sid]];
            let accepted = pending.entry(*sid).or_default();
            if guard.bookings.len() + accepted.len() >= MAX_BOOKINGS_PER_SUBJECT {
                return Err(EngineError::LimitExceeded("too many bookings on subject"));
            }
            check_quota(guard, span, accepted)?;
            accepted.push(*span);
        }

        // Phase 2: All validated — commit every member.
        for (id, subject_id, span, label) in bookings {
            let event = Event::BookingRecorded { id, subject_id, span, label };
            self.wal_append(&event).await?;
            let idx = guard_index[&subject_id];
            apply_to_subject(&mut guards[idx], &event, &self.booking_to_subject);
            self.notify.send(subject_id, &event);
        }

        Ok(())
    }

    pub async fn cancel_booking(&self, id: Ulid) -> Result<Ulid, EngineError> {
        let (subject_id, mut guard) = self.resolve_booking_write(&id).await?;
        let event = Event::BookingCancelled { id, subject_id };
        self.persist_and_apply(subject_id, &mut guard, &event).await?;
        Ok(subject_id)
    }

    /// Bookings that ended at or before `cutoff` — candidates for pruning.
    pub fn collect_expired_bookings(&self, cutoff: Ms) -> Vec<(Ulid, Ulid)> {
        let mut expired = Vec::new();
        for entry in self.state.iter() {
            let st = entry.value().clone();
            if let Ok(guard) = st.try_read() {
                for booking in &guard.bookings {
                    if booking.span.end <= cutoff {
                        expired.push((booking.id, guard.id));
                    }
                }
            }
        }
        expired
    }

    /// Compact the WAL by rewriting it with only the events needed to recreate the current state.
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        let mut events = Vec::new();

        for entry in self.state.iter() {
            let st = entry.value().clone();
            let guard = st.try_read().expect("compact: uncontended read");

            events.push(Event::SubjectCreated {
                id: guard.id,
                name: guard.name.clone(),
            });
            if !guard.booking_limits.is_empty() {
                events.push(Event::LimitsReplaced {
                    subject_id: guard.id,
                    kind: LimitKind::Bookings,
                    limits: guard.booking_limits,
                });
            }
            if !guard.duration_limits.is_empty() {
                events.push(Event::LimitsReplaced {
                    subject_id: guard.id,
                    kind: LimitKind::Minutes,
                    limits: guard.duration_limits,
                });
            }
            for booking in &guard.bookings {
                events.push(Event::BookingRecorded {
                    id: booking.id,
                    subject_id: guard.id,
                    span: booking.span,
                    label: booking.label.clone(),
                });
            }
        }

        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact { events, response: tx })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}
