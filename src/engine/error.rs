use ulid::Ulid;

use crate::model::{AppointmentState, BusySource};

#[derive(Debug)]
pub enum EngineError {
    /// Another live commitment occupies the requested window (buffer included).
    SlotTaken {
        conflicting: BusySource,
    },
    /// The appointment was not in the state the caller expected.
    StaleStateConflict {
        id: Ulid,
        expected: AppointmentState,
        actual: AppointmentState,
    },
    ExternalCalendarUnavailable(String),
    /// A payment succeeded for an appointment that no longer holds its slot.
    PaidButExpired {
        appointment_id: Ulid,
        payment_reference: String,
        state: AppointmentState,
    },
    DuplicatePaymentReference(String),
    NotFound(Ulid),
    InvalidRequest(String),
    LimitExceeded(&'static str),
    WalError(String),
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::SlotTaken { conflicting } => match conflicting {
                BusySource::Appointment(id) => write!(f, "slot taken by appointment {id}"),
                BusySource::CalendarEvent(id) => write!(f, "slot taken by calendar event {id}"),
            },
            EngineError::StaleStateConflict {
                id,
                expected,
                actual,
            } => write!(
                f,
                "appointment {id} is {actual}, expected {expected}; re-read and retry"
            ),
            EngineError::ExternalCalendarUnavailable(e) => {
                write!(f, "external calendar unavailable: {e}")
            }
            EngineError::PaidButExpired {
                appointment_id,
                payment_reference,
                state,
            } => write!(
                f,
                "payment {payment_reference} succeeded but appointment {appointment_id} is {state}"
            ),
            EngineError::DuplicatePaymentReference(r) => {
                write!(f, "payment reference already in use: {r}")
            }
            EngineError::NotFound(id) => write!(f, "not found: {id}"),
            EngineError::InvalidRequest(msg) => write!(f, "invalid request: {msg}"),
            EngineError::LimitExceeded(msg) => write!(f, "limit exceeded: {msg}"),
            EngineError::WalError(e) => write!(f, "WAL error: {e}"),
        }
    }
}

impl std::error::Error for EngineError {}
