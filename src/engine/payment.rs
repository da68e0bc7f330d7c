use ulid::Ulid;

use crate::model::*;

use super::{Engine, EngineError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PaymentOutcome {
    Succeeded,
    Failed,
}

impl PaymentOutcome {
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "succeeded" | "success" | "paid" => Some(PaymentOutcome::Succeeded),
            "failed" | "failure" => Some(PaymentOutcome::Failed),
            _ => None,
        }
    }
}

/// Outcomes of a payment notification that need no compensation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PaymentResolution {
    Confirmed(Appointment),
    /// Redelivery of a payment that already confirmed the appointment.
    AlreadyConfirmed { id: Ulid, state: AppointmentState },
    /// The payment failed; the hold runs until its deadline.
    LeftOnHold { id: Ulid },
    /// A failed payment for an appointment that is no longer held.
    Ignored { id: Ulid, state: AppointmentState },
    UnknownReference,
}

impl PaymentResolution {
    pub fn label(&self) -> &'static str {
        match self {
            PaymentResolution::Confirmed(_) => "confirmed",
            PaymentResolution::AlreadyConfirmed { .. } => "already_confirmed",
            PaymentResolution::LeftOnHold { .. } => "left_on_hold",
            PaymentResolution::Ignored { .. } => "ignored",
            PaymentResolution::UnknownReference => "unknown_reference",
        }
    }
}

impl Engine {
    /// Handle an at-least-once payment notification.
    ///
    /// A success that arrives after the hold was released is returned as
    /// [`EngineError::PaidButExpired`] and recorded as an escalation; it is never dropped.
    pub async fn resolve_payment(
        &self,
        payment_reference: &str,
        outcome: PaymentOutcome,
    ) -> Result<PaymentResolution, EngineError> {
        let Some(id) = self.payment_index.get(payment_reference).map(|e| *e.value()) else {
            tracing::info!("payment {payment_reference}: no appointment with this reference");
            return Ok(PaymentResolution::UnknownReference);
        };

        match outcome {
            PaymentOutcome::Failed => {
                let state = self.get_appointment(&id).await?.state();
                tracing::info!("payment {payment_reference} failed; appointment {id} is {state}");
                if state == AppointmentState::Hold {
                    Ok(PaymentResolution::LeftOnHold { id })
                } else {
                    Ok(PaymentResolution::Ignored { id, state })
                }
            }
            PaymentOutcome::Succeeded => match self.confirm(id).await {
                Ok(appt) => Ok(PaymentResolution::Confirmed(
                    self.mark_mirror_confirmed(appt).await,
                )),
                Err(EngineError::StaleStateConflict { actual, .. }) if actual.was_confirmed() => {
                    tracing::debug!("payment {payment_reference} redelivered; {id} is {actual}");
                    Ok(PaymentResolution::AlreadyConfirmed { id, state: actual })
                }
                Err(EngineError::StaleStateConflict { actual, .. }) => {
                    self.escalate(id, payment_reference, actual).await?;
                    Err(EngineError::PaidButExpired {
                        appointment_id: id,
                        payment_reference: payment_reference.to_string(),
                        state: actual,
                    })
                }
                Err(e) => Err(e),
            },
        }
    }

    /// Record a paid-but-released appointment once per payment reference.
    async fn escalate(
        &self,
        id: Ulid,
        payment_reference: &str,
        state: AppointmentState,
    ) -> Result<(), EngineError> {
        let mut guard = self.resolve_appointment_write(&id).await?;
        if self.escalations.contains_key(payment_reference) {
            tracing::warn!("payment {payment_reference} for {id} already escalated");
            return Ok(());
        }
        let deposit_amount = guard
            .get(&id)
            .ok_or(EngineError::NotFound(id))?
            .deposit_amount;
        let escalation = Escalation {
            id: Ulid::new(),
            appointment_id: id,
            professional_id: guard.id,
            payment_reference: payment_reference.to_string(),
            state,
            deposit_amount,
            raised_at: self.now(),
        };
        let event = Event::PaymentEscalated {
            escalation: escalation.clone(),
        };
        self.persist_and_apply(&mut guard, &event).await?;
        drop(guard);

        metrics::counter!(crate::observability::PAID_BUT_EXPIRED_TOTAL).increment(1);
        tracing::error!(
            "payment {payment_reference} succeeded but appointment {id} is {state}; refund or manual booking required"
        );
        self.notify.escalate(&escalation);
        Ok(())
    }
}
