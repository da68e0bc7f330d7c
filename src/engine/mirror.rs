use ulid::Ulid;

use crate::calendar::{VisualState, with_retry};
use crate::model::*;

use super::{Engine, EngineError};

/// A released appointment whose calendar event still has to be deleted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MirrorRemoval {
    pub appointment_id: Ulid,
    pub professional_id: Ulid,
    pub event_id: String,
}

impl Engine {
    /// Delete the mirror event and record it. On failure the removal stays pending
    /// and the next sweep tries again; the appointment state is not touched either way.
    pub async fn remove_mirror(&self, removal: &MirrorRemoval) -> Result<(), EngineError> {
        with_retry("delete_event", &self.retry, || {
            self.calendar
                .delete_event(removal.professional_id, &removal.event_id)
        })
        .await
        .map_err(|e| EngineError::ExternalCalendarUnavailable(e.to_string()))?;
        self.record_mirror(removal.appointment_id, MirrorStatus::Removed)
            .await
    }

    /// Redraw a confirmed appointment's event. Best effort: on failure the mirror stays
    /// `Held` and `appt` is returned unchanged.
    pub(super) async fn mark_mirror_confirmed(&self, appt: Appointment) -> Appointment {
        let Some(event_id) = appt.external_calendar_event_id.as_deref() else {
            return appt;
        };
        let result = with_retry("update_event", &self.retry, || {
            self.calendar
                .update_event(appt.professional_id, event_id, VisualState::Confirmed)
        })
        .await;
        if let Err(e) = result {
            tracing::warn!("could not mark calendar event {event_id} of {} confirmed: {e}", appt.id);
            return appt;
        }
        match self.record_confirmed_mirror(appt.id).await {
            Ok(Some(updated)) => updated,
            Ok(None) => appt,
            Err(e) => {
                tracing::warn!("could not record confirmed mirror of {}: {e}", appt.id);
                appt
            }
        }
    }

    /// `Held → Confirmed` on the mirror, only while the appointment is still confirmed.
    async fn record_confirmed_mirror(&self, id: Ulid) -> Result<Option<Appointment>, EngineError> {
        let mut guard = self.resolve_appointment_write(&id).await?;
        let current = guard.get(&id).ok_or(EngineError::NotFound(id))?;
        if current.state() != AppointmentState::Confirmed || current.mirror() != MirrorStatus::Held {
            return Ok(None);
        }
        let event = Event::MirrorUpdated {
            id,
            professional_id: guard.id,
            mirror: MirrorStatus::Confirmed,
        };
        self.persist_and_apply(&mut guard, &event).await?;
        Ok(guard.get(&id).cloned())
    }

    async fn record_mirror(&self, id: Ulid, mirror: MirrorStatus) -> Result<(), EngineError> {
        let mut guard = self.resolve_appointment_write(&id).await?;
        let current = guard.get(&id).ok_or(EngineError::NotFound(id))?.mirror();
        if current == mirror {
            return Ok(());
        }
        let event = Event::MirrorUpdated {
            id,
            professional_id: guard.id,
            mirror,
        };
        self.persist_and_apply(&mut guard, &event).await
    }
}
