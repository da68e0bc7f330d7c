use dashmap::mapref::entry::Entry;
use ulid::Ulid;

use crate::calendar::with_retry;
use crate::limits::*;
use crate::model::*;

use super::availability::{WindowCheck, check_window};
use super::conflict::{check_no_conflict, validate_id, validate_window};
use super::{Engine, EngineError};

/// What the caller picked: who, when, which services, and the payment that will pay for it.
#[derive(Debug, Clone)]
pub struct HoldRequest {
    pub professional_id: Ulid,
    pub customer_id: String,
    pub window: Span,
    pub service_ids: Vec<String>,
    pub payment_reference: String,
}

impl Engine {
    /// Reserve `request.window` provisionally.
    ///
    /// 1. Re-check the window against a fresh busy snapshot (fast path).
    /// 2. Write the calendar mirror event.
    /// 3. Insert the `Hold` row under the professional's write lock, which re-checks
    ///    overlap against live rows. If this fails, the calendar event is deleted again.
    pub async fn create_hold(&self, request: HoldRequest) -> Result<Appointment, EngineError> {
        validate_id("customer_id", &request.customer_id)?;
        validate_id("payment_reference", &request.payment_reference)?;
        validate_window(&request.window)?;
        if request.window.duration_ms() > MAX_APPOINTMENT_DURATION_MS {
            return Err(EngineError::LimitExceeded("appointment too long"));
        }
        if request.service_ids.len() > MAX_SERVICES_PER_APPOINTMENT {
            return Err(EngineError::LimitExceeded("too many services"));
        }
        if self.payment_index.contains_key(&request.payment_reference) {
            return Err(EngineError::DuplicatePaymentReference(request.payment_reference));
        }

        let policy = self.policy();
        let selection = policy
            .select_services(&request.service_ids)
            .map_err(|e| EngineError::InvalidRequest(e.to_string()))?;
        if request.window.duration_ms() < selection.total_duration_ms {
            return Err(EngineError::InvalidRequest(format!(
                "window is {} minutes, services need {}",
                request.window.duration_minutes(),
                selection.total_duration_ms / MINUTE_MS
            )));
        }

        // (a) fast path against the current busy set
        let now = self.now();
        let busy = self
            .busy_snapshot(
                request.professional_id,
                request.window.expanded(policy.buffer_ms()),
                now,
            )
            .await?;
        match check_window(&policy, &request.window, &busy, now) {
            Ok(()) => {}
            Err(WindowCheck::Busy(conflicting)) => {
                metrics::counter!(crate::observability::SLOT_TAKEN_TOTAL, "stage" => "precheck")
                    .increment(1);
                return Err(EngineError::SlotTaken { conflicting });
            }
            Err(WindowCheck::TooSoon { earliest }) => {
                return Err(EngineError::InvalidRequest(format!(
                    "window starts before the earliest bookable time {earliest}"
                )));
            }
            Err(WindowCheck::Closed) => {
                return Err(EngineError::InvalidRequest(
                    "window is outside business hours".into(),
                ));
            }
        }

        // (b) calendar mirror, keyed by the appointment id so retries never duplicate it
        let id = Ulid::new();
        let summary = format!("HOLD {} ({})", selection.category, request.customer_id);
        let created = with_retry("create_event", &self.retry, || {
            self.calendar
                .create_event(request.professional_id, id, request.window, &summary)
        })
        .await;
        let event_id = match created {
            Ok(event_id) => event_id,
            Err(e) => {
                // A timed-out create may still have landed on the calendar.
                if e.is_retryable() {
                    self.roll_back_unacknowledged_event(request.professional_id, id)
                        .await;
                }
                return Err(EngineError::ExternalCalendarUnavailable(e.to_string()));
            }
        };

        // (c) ledger row
        let held_at = self.now();
        if request.window.start - held_at < policy.min_hold_ms() {
            // The calendar round-trip ate into the lead time.
            self.roll_back_calendar_event(request.professional_id, &event_id)
                .await;
            return Err(EngineError::InvalidRequest(format!(
                "window starts before the earliest bookable time {}",
                held_at + policy.min_hold_ms()
            )));
        }
        let deadline = held_at + policy.hold_timeout(request.window.start - held_at);
        let appointment = Appointment::new_hold(NewHold {
            id,
            professional_id: request.professional_id,
            customer_id: request.customer_id,
            service_ids: selection.service_ids,
            category: selection.category,
            window: request.window,
            payment_reference: request.payment_reference,
            price_total: selection.price_total,
            deposit_amount: selection.deposit_amount,
            external_calendar_event_id: event_id.clone(),
            created_at: held_at,
            hold_deadline: deadline,
        });

        if let Err(e) = self.insert_hold(&appointment, policy.buffer_ms()).await {
            if matches!(e, EngineError::SlotTaken { .. }) {
                metrics::counter!(crate::observability::SLOT_TAKEN_TOTAL, "stage" => "insert")
                    .increment(1);
            }
            self.roll_back_calendar_event(request.professional_id, &event_id)
                .await;
            return Err(e);
        }

        metrics::counter!(crate::observability::HOLDS_CREATED_TOTAL).increment(1);
        tracing::info!(
            "hold {} for professional {} until {deadline}",
            appointment.id,
            appointment.professional_id
        );
        Ok(appointment)
    }

    /// Storage-level insert: overlap and payment-reference uniqueness are checked under
    /// the professional's write lock, so concurrent callers serialise here.
    async fn insert_hold(&self, appointment: &Appointment, buffer: Ms) -> Result<(), EngineError> {
        let _gate = self.compaction_gate.read().await;
        let ledger = self.ledger_for(appointment.professional_id)?;
        let mut guard = ledger.write().await;
        // Terminal rows stay for audit and do not count.
        if guard.live_count() >= MAX_LIVE_APPOINTMENTS_PER_PROFESSIONAL {
            return Err(EngineError::LimitExceeded("too many live appointments for professional"));
        }

        let now = self.now();
        let lapsed = check_no_conflict(&guard, &appointment.window, buffer, now)?;

        let reference = appointment.payment_reference.clone();
        match self.payment_index.entry(reference.clone()) {
            Entry::Occupied(_) => return Err(EngineError::DuplicatePaymentReference(reference)),
            Entry::Vacant(slot) => {
                slot.insert(appointment.id);
            }
        }

        let result = async {
            for id in lapsed {
                self.transition_locked(
                    &mut guard,
                    id,
                    AppointmentState::Hold,
                    AppointmentState::Expired,
                    now,
                )
                .await?;
                metrics::counter!(crate::observability::EXPIRATIONS_TOTAL).increment(1);
                tracing::info!("expired lapsed hold {id} in favour of {}", appointment.id);
            }
            let event = Event::HoldPlaced {
                appointment: appointment.clone(),
            };
            self.persist_and_apply(&mut guard, &event).await
        }
        .await;

        if result.is_err() {
            self.payment_index.remove(&reference);
        }
        result
    }

    async fn roll_back_calendar_event(&self, professional_id: Ulid, event_id: &str) {
        let deleted = with_retry("delete_event", &self.retry, || {
            self.calendar.delete_event(professional_id, event_id)
        })
        .await;
        match deleted {
            Ok(()) => tracing::debug!("rolled back calendar event {event_id}"),
            Err(e) => tracing::error!(
                "calendar event {event_id} of professional {professional_id} is orphaned: {e}"
            ),
        }
    }

    async fn roll_back_unacknowledged_event(&self, professional_id: Ulid, appointment_id: Ulid) {
        let deleted = with_retry("delete_event", &self.retry, || {
            self.calendar.delete_event_for(professional_id, appointment_id)
        })
        .await;
        if let Err(e) = deleted {
            tracing::error!(
                "calendar event for {appointment_id} of professional {professional_id} may be orphaned: {e}"
            );
        }
    }
}
