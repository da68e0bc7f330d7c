use ulid::Ulid;

use crate::model::*;

use super::{Engine, EngineError};

impl Engine {
    /// `Hold → Confirmed`. Reserved to payment resolution.
    pub async fn confirm(&self, id: Ulid) -> Result<Appointment, EngineError> {
        let appt = self
            .transition(id, AppointmentState::Hold, AppointmentState::Confirmed)
            .await?;
        metrics::counter!(crate::observability::CONFIRMATIONS_TOTAL).increment(1);
        Ok(appt)
    }

    /// `Hold → Expired`. Reserved to the sweeper and to the ledger insert that finds a
    /// lapsed hold in its way. Refused before the hold's deadline.
    pub async fn expire(&self, id: Ulid) -> Result<Appointment, EngineError> {
        let appt = self
            .transition(id, AppointmentState::Hold, AppointmentState::Expired)
            .await?;
        metrics::counter!(crate::observability::EXPIRATIONS_TOTAL).increment(1);
        Ok(appt)
    }

    /// Cancel from the state the caller last saw: a hold becomes `CancelledBeforePay`,
    /// a confirmed appointment becomes `Cancelled`.
    pub async fn cancel(
        &self,
        id: Ulid,
        expected: AppointmentState,
    ) -> Result<Appointment, EngineError> {
        let next = match expected {
            AppointmentState::Hold => AppointmentState::CancelledBeforePay,
            AppointmentState::Confirmed => AppointmentState::Cancelled,
            other => {
                return Err(EngineError::InvalidRequest(format!(
                    "cannot cancel an appointment that is {other}"
                )));
            }
        };
        self.transition(id, expected, next).await
    }

    pub async fn refund(&self, id: Ulid) -> Result<Appointment, EngineError> {
        self.transition(id, AppointmentState::Confirmed, AppointmentState::Refunded)
            .await
    }

    pub async fn complete(&self, id: Ulid) -> Result<Appointment, EngineError> {
        self.transition(id, AppointmentState::Confirmed, AppointmentState::Completed)
            .await
    }

    /// Operator-facing compare-and-swap. Confirmation and expiry are not reachable
    /// from here; they belong to payment resolution and the sweeper.
    pub async fn request_transition(
        &self,
        id: Ulid,
        expected: AppointmentState,
        next: AppointmentState,
    ) -> Result<Appointment, EngineError> {
        match next {
            AppointmentState::CancelledBeforePay | AppointmentState::Cancelled => {
                // `cancel` picks the target from `expected`; refuse a mismatched pair.
                if !expected.can_transition_to(next) {
                    return Err(invalid_edge(expected, next));
                }
                self.cancel(id, expected).await
            }
            AppointmentState::Refunded if expected == AppointmentState::Confirmed => {
                self.refund(id).await
            }
            AppointmentState::Completed if expected == AppointmentState::Confirmed => {
                self.complete(id).await
            }
            AppointmentState::Confirmed | AppointmentState::Expired => {
                Err(EngineError::InvalidRequest(format!(
                    "{next} is set by the booking engine, not by request"
                )))
            }
            _ => Err(invalid_edge(expected, next)),
        }
    }

    async fn transition(
        &self,
        id: Ulid,
        expected: AppointmentState,
        next: AppointmentState,
    ) -> Result<Appointment, EngineError> {
        let mut guard = self.resolve_appointment_write(&id).await?;
        let at = self.now();
        self.transition_locked(&mut guard, id, expected, next, at)
            .await
    }

    /// Compare-and-swap under a ledger write lock the caller already holds.
    pub(super) async fn transition_locked(
        &self,
        ledger: &mut ProfessionalLedger,
        id: Ulid,
        expected: AppointmentState,
        next: AppointmentState,
        at: Ms,
    ) -> Result<Appointment, EngineError> {
        if !expected.can_transition_to(next) {
            return Err(invalid_edge(expected, next));
        }
        let current = ledger.get(&id).ok_or(EngineError::NotFound(id))?;
        let actual = current.state();
        if actual != expected {
            return Err(EngineError::StaleStateConflict {
                id,
                expected,
                actual,
            });
        }
        if next == AppointmentState::Expired && !current.hold_lapsed(at) {
            return Err(EngineError::InvalidRequest(format!(
                "hold {id} runs until {}",
                current.hold_deadline().unwrap_or_default()
            )));
        }

        let event = Event::StateChanged {
            id,
            professional_id: ledger.id,
            from: expected,
            to: next,
            at,
        };
        self.persist_and_apply(ledger, &event).await?;
        tracing::info!("appointment {id}: {expected} -> {next}");
        ledger.get(&id).cloned().ok_or(EngineError::NotFound(id))
    }
}

fn invalid_edge(from: AppointmentState, to: AppointmentState) -> EngineError {
    EngineError::InvalidRequest(format!("no transition from {from} to {to}"))
}
