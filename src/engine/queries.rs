use tokio::sync::oneshot;
use ulid::Ulid;

use crate::calendar::with_retry;
use crate::limits::*;
use crate::model::*;

use super::availability::{SlotRequest, SlotSearch, reconcile_busy, resolve_slots};
use super::conflict::validate_window;
use super::mirror::MirrorRemoval;
use super::{Engine, EngineError, SharedLedger, WalCommand};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotQuery {
    pub professional_id: Ulid,
    pub duration_ms: Ms,
    pub window: Span,
    /// Resume after a slot starting at this instant.
    pub after: Option<Ms>,
    /// Overrides the policy's minimum advance notice.
    pub notice_days: Option<u32>,
}

impl Engine {
    /// Busy intervals of a professional around `window`: calendar events plus live
    /// ledger rows. The calendar is read before the ledger lock is taken.
    pub(super) async fn busy_snapshot(
        &self,
        professional_id: Ulid,
        window: Span,
        now: Ms,
    ) -> Result<Vec<BusyInterval>, EngineError> {
        let calendar = with_retry("list_busy_intervals", &self.retry, || {
            self.calendar.list_busy_intervals(professional_id, window)
        })
        .await
        .map_err(|e| EngineError::ExternalCalendarUnavailable(e.to_string()))?;

        match self.get_ledger(&professional_id) {
            Some(ledger) => {
                let guard = ledger.read().await;
                Ok(reconcile_busy(calendar, &guard, now))
            }
            None => Ok(calendar),
        }
    }

    pub async fn find_slots(&self, query: SlotQuery) -> Result<SlotSearch, EngineError> {
        validate_window(&query.window)?;
        if query.window.duration_ms() > MAX_SEARCH_WINDOW_MS {
            return Err(EngineError::LimitExceeded("search window too wide"));
        }
        if query.duration_ms <= 0 {
            return Err(EngineError::InvalidRequest("duration must be positive".into()));
        }
        if query.duration_ms > MAX_APPOINTMENT_DURATION_MS {
            return Err(EngineError::LimitExceeded("appointment too long"));
        }

        let policy = self.policy();
        let now = self.now();
        let busy = self
            .busy_snapshot(
                query.professional_id,
                query.window.expanded(policy.buffer_ms()),
                now,
            )
            .await?;
        let request = SlotRequest {
            duration_ms: query.duration_ms,
            window: query.window,
            notice_days: query
                .notice_days
                .unwrap_or(policy.min_advance_notice_days),
        };
        let mut search = resolve_slots(&policy, &request, &busy, now);
        if let Some(after) = query.after {
            search.slots.skip_past(after);
        }
        Ok(search)
    }

    pub async fn get_appointment(&self, id: &Ulid) -> Result<Appointment, EngineError> {
        let professional_id = self.professional_of(id).ok_or(EngineError::NotFound(*id))?;
        let ledger = self
            .get_ledger(&professional_id)
            .ok_or(EngineError::NotFound(professional_id))?;
        let guard = ledger.read().await;
        guard.get(id).cloned().ok_or(EngineError::NotFound(*id))
    }

    pub async fn appointment_by_payment(&self, payment_reference: &str) -> Option<Appointment> {
        let id = self.payment_index.get(payment_reference).map(|e| *e.value())?;
        self.get_appointment(&id).await.ok()
    }

    /// Every appointment of a professional, terminal ones included, ordered by start.
    pub async fn list_appointments(&self, professional_id: &Ulid) -> Vec<Appointment> {
        match self.get_ledger(professional_id) {
            Some(ledger) => ledger.read().await.appointments.clone(),
            None => Vec::new(),
        }
    }

    pub fn escalations(&self) -> Vec<Escalation> {
        let mut all: Vec<Escalation> = self.escalations.iter().map(|e| e.value().clone()).collect();
        all.sort_by_key(|e| (e.raised_at, e.id));
        all
    }

    fn all_ledgers(&self) -> Vec<SharedLedger> {
        self.ledgers.iter().map(|e| e.value().clone()).collect()
    }

    /// `(appointment_id, professional_id)` of every hold whose deadline is at or before `now`.
    pub async fn collect_expired_holds(&self, now: Ms) -> Vec<(Ulid, Ulid)> {
        let mut expired = Vec::new();
        for ledger in self.all_ledgers() {
            let guard = ledger.read().await;
            expired.extend(
                guard
                    .appointments
                    .iter()
                    .filter(|a| a.hold_lapsed(now))
                    .map(|a| (a.id, guard.id)),
            );
        }
        expired
    }

    /// Released appointments whose calendar event has not been deleted yet.
    pub async fn pending_mirror_removals(&self) -> Vec<MirrorRemoval> {
        let mut pending = Vec::new();
        for ledger in self.all_ledgers() {
            let guard = ledger.read().await;
            for appt in &guard.appointments {
                if appt.mirror() != MirrorStatus::RemovalPending {
                    continue;
                }
                if let Some(event_id) = &appt.external_calendar_event_id {
                    pending.push(MirrorRemoval {
                        appointment_id: appt.id,
                        professional_id: guard.id,
                        event_id: event_id.clone(),
                    });
                }
            }
        }
        pending
    }

    /// Rewrite the WAL as one snapshot per appointment plus the escalations.
    ///
    /// New holds wait on the compaction gate and every existing ledger is read-locked
    /// until the compacted file is in place, so no append can slip between the snapshot
    /// and the swap.
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        let _gate = self.compaction_gate.write().await;
        let mut guards = Vec::new();
        for ledger in self.all_ledgers() {
            guards.push(ledger.read_owned().await);
        }

        let mut events = Vec::new();
        for guard in &guards {
            events.extend(guard.appointments.iter().map(|a| Event::Snapshot {
                appointment: a.clone(),
            }));
        }
        events.extend(
            self.escalations()
                .into_iter()
                .map(|escalation| Event::PaymentEscalated { escalation }),
        );

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
