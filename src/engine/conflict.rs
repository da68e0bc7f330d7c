use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::EngineError;

pub(crate) fn validate_window(span: &Span) -> Result<(), EngineError> {
    if span.start < MIN_VALID_TIMESTAMP_MS || span.end > MAX_VALID_TIMESTAMP_MS {
        return Err(EngineError::LimitExceeded("timestamp out of range"));
    }
    if span.start >= span.end {
        return Err(EngineError::InvalidRequest("window must end after it starts".into()));
    }
    Ok(())
}

pub(crate) fn validate_id(what: &'static str, value: &str) -> Result<(), EngineError> {
    if value.is_empty() {
        return Err(EngineError::InvalidRequest(format!("{what} is empty")));
    }
    if value.len() > MAX_ID_LEN {
        return Err(EngineError::LimitExceeded("identifier too long"));
    }
    Ok(())
}

/// Storage-level uniqueness check, run under the professional's write lock.
///
/// Any live appointment overlapping `window` with the buffer applied on both sides is a
/// conflict, except holds already past their deadline: those are returned so the caller
/// can expire them in the same critical section.
pub(crate) fn check_no_conflict(
    ledger: &ProfessionalLedger,
    window: &Span,
    buffer: Ms,
    now: Ms,
) -> Result<Vec<Ulid>, EngineError> {
    let search = window.expanded(buffer);
    let mut lapsed = Vec::new();
    for appt in ledger.overlapping(&search) {
        if !appt.state().is_live() || !appt.window.overlaps_with_buffer(window, buffer) {
            continue;
        }
        if appt.hold_lapsed(now) {
            lapsed.push(appt.id);
            continue;
        }
        return Err(EngineError::SlotTaken {
            conflicting: BusySource::Appointment(appt.id),
        });
    }
    Ok(lapsed)
}
