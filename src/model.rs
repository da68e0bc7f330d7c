use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Unix milliseconds, the only time type.
pub type Ms = i64;

pub const MINUTE_MS: Ms = 60_000;
pub const HOUR_MS: Ms = 60 * MINUTE_MS;
pub const DAY_MS: Ms = 24 * HOUR_MS;

/// Half-open interval `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Span {
    pub start: Ms,
    pub end: Ms,
}

impl Span {
    pub fn new(start: Ms, end: Ms) -> Self {
        debug_assert!(start < end, "Span start must be before end");
        Self { start, end }
    }

    /// `None` unless `start < end`. For windows that arrive from outside.
    pub fn checked(start: Ms, end: Ms) -> Option<Self> {
        (start < end).then_some(Self { start, end })
    }

    pub fn from_minutes(start: Ms, duration_minutes: i64) -> Self {
        Self::new(start, start + duration_minutes * MINUTE_MS)
    }

    pub fn duration_ms(&self) -> Ms {
        self.end - self.start
    }

    pub fn duration_minutes(&self) -> i64 {
        self.duration_ms() / MINUTE_MS
    }

    pub fn overlaps(&self, other: &Span) -> bool {
        self.start < other.end && other.start < self.end
    }

    /// `start1 < end2 + b && start2 < end1 + b`. With `b = 0` this is plain overlap.
    pub fn overlaps_with_buffer(&self, other: &Span, buffer: Ms) -> bool {
        self.start < other.end + buffer && other.start < self.end + buffer
    }

    /// The span grown by `buffer` on both sides.
    pub fn expanded(&self, buffer: Ms) -> Span {
        Span::new(self.start - buffer, self.end + buffer)
    }

    /// Returns true if `self` fully contains `other`.
    pub fn contains_span(&self, other: &Span) -> bool {
        self.start <= other.start && other.end <= self.end
    }
}

// ── Appointment lifecycle ────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AppointmentState {
    Hold,
    Confirmed,
    Expired,
    CancelledBeforePay,
    Cancelled,
    Refunded,
    Completed,
}

impl AppointmentState {
    /// The only edges of the lifecycle graph. Everything else is rejected.
    pub fn can_transition_to(self, next: AppointmentState) -> bool {
        use AppointmentState::*;
        matches!(
            (self, next),
            (Hold, Confirmed)
                | (Hold, Expired)
                | (Hold, CancelledBeforePay)
                | (Confirmed, Cancelled)
                | (Confirmed, Refunded)
                | (Confirmed, Completed)
        )
    }

    pub fn is_terminal(self) -> bool {
        !matches!(self, AppointmentState::Hold | AppointmentState::Confirmed)
    }

    /// Live appointments occupy their window on the professional's calendar.
    pub fn is_live(self) -> bool {
        matches!(self, AppointmentState::Hold | AppointmentState::Confirmed)
    }

    /// States that can only be reached after a successful payment confirmation.
    pub fn was_confirmed(self) -> bool {
        matches!(
            self,
            AppointmentState::Confirmed
                | AppointmentState::Cancelled
                | AppointmentState::Refunded
                | AppointmentState::Completed
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            AppointmentState::Hold => "hold",
            AppointmentState::Confirmed => "confirmed",
            AppointmentState::Expired => "expired",
            AppointmentState::CancelledBeforePay => "cancelled_before_pay",
            AppointmentState::Cancelled => "cancelled",
            AppointmentState::Refunded => "refunded",
            AppointmentState::Completed => "completed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        let state = match s.to_ascii_lowercase().as_str() {
            "hold" => AppointmentState::Hold,
            "confirmed" => AppointmentState::Confirmed,
            "expired" => AppointmentState::Expired,
            "cancelled_before_pay" => AppointmentState::CancelledBeforePay,
            "cancelled" => AppointmentState::Cancelled,
            "refunded" => AppointmentState::Refunded,
            "completed" => AppointmentState::Completed,
            _ => return None,
        };
        Some(state)
    }
}

impl std::fmt::Display for AppointmentState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where the calendar mirror of an appointment stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MirrorStatus {
    /// Event exists and is marked as a provisional hold.
    Held,
    /// Event exists and is marked as a confirmed appointment.
    Confirmed,
    /// Appointment released; the event still has to be deleted.
    RemovalPending,
    Removed,
}

impl MirrorStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            MirrorStatus::Held => "held",
            MirrorStatus::Confirmed => "confirmed",
            MirrorStatus::RemovalPending => "removal_pending",
            MirrorStatus::Removed => "removed",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateChange {
    pub from: AppointmentState,
    pub to: AppointmentState,
    pub at: Ms,
}

/// Returned by [`Appointment::apply_transition`] when the persisted state is not the
/// one the caller expected, or the edge does not exist.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransitionRejected {
    pub actual: AppointmentState,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Appointment {
    pub id: Ulid,
    pub professional_id: Ulid,
    pub customer_id: String,
    pub service_ids: Vec<String>,
    pub category: String,
    pub window: Span,
    pub payment_reference: String,
    pub price_total: i64,
    pub deposit_amount: i64,
    pub external_calendar_event_id: Option<String>,
    pub created_at: Ms,
    state: AppointmentState,
    hold_deadline: Ms,
    mirror: MirrorStatus,
    history: Vec<StateChange>,
}

/// Everything needed to open a ledger row in `Hold`.
#[derive(Debug, Clone)]
pub struct NewHold {
    pub id: Ulid,
    pub professional_id: Ulid,
    pub customer_id: String,
    pub service_ids: Vec<String>,
    pub category: String,
    pub window: Span,
    pub payment_reference: String,
    pub price_total: i64,
    pub deposit_amount: i64,
    pub external_calendar_event_id: String,
    pub created_at: Ms,
    pub hold_deadline: Ms,
}

impl Appointment {
    pub fn new_hold(hold: NewHold) -> Self {
        Self {
            id: hold.id,
            professional_id: hold.professional_id,
            customer_id: hold.customer_id,
            service_ids: hold.service_ids,
            category: hold.category,
            window: hold.window,
            payment_reference: hold.payment_reference,
            price_total: hold.price_total,
            deposit_amount: hold.deposit_amount,
            external_calendar_event_id: Some(hold.external_calendar_event_id),
            created_at: hold.created_at,
            state: AppointmentState::Hold,
            hold_deadline: hold.hold_deadline,
            mirror: MirrorStatus::Held,
            history: Vec::new(),
        }
    }

    pub fn state(&self) -> AppointmentState {
        self.state
    }

    /// Present only while the appointment is held.
    pub fn hold_deadline(&self) -> Option<Ms> {
        (self.state == AppointmentState::Hold).then_some(self.hold_deadline)
    }

    /// True once `now` has reached the deadline of a live hold.
    pub fn hold_lapsed(&self, now: Ms) -> bool {
        self.state == AppointmentState::Hold && self.hold_deadline <= now
    }

    pub fn mirror(&self) -> MirrorStatus {
        self.mirror
    }

    pub fn history(&self) -> &[StateChange] {
        &self.history
    }

    /// Compare-and-swap on the state field. The only code path that changes `state`.
    pub fn apply_transition(
        &mut self,
        expected: AppointmentState,
        next: AppointmentState,
        at: Ms,
    ) -> Result<StateChange, TransitionRejected> {
        if self.state != expected || !expected.can_transition_to(next) {
            return Err(TransitionRejected { actual: self.state });
        }
        let change = StateChange { from: expected, to: next, at };
        self.state = next;
        self.history.push(change);
        Ok(change)
    }

    pub(crate) fn set_mirror(&mut self, mirror: MirrorStatus) {
        self.mirror = mirror;
    }
}

/// Mirror follow-up implied by entering `state`. A confirmation keeps `Held` until
/// the calendar has actually redrawn the event.
pub fn mirror_after(state: AppointmentState) -> Option<MirrorStatus> {
    match state {
        AppointmentState::Expired
        | AppointmentState::CancelledBeforePay
        | AppointmentState::Cancelled
        | AppointmentState::Refunded => Some(MirrorStatus::RemovalPending),
        AppointmentState::Hold | AppointmentState::Confirmed | AppointmentState::Completed => None,
    }
}

// ── Busy intervals ───────────────────────────────────────────────

/// Where a busy interval came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BusySource {
    /// A ledger appointment in `Hold` or `Confirmed`.
    Appointment(Ulid),
    /// Any calendar event (mirrors, manual blocks, personal events).
    CalendarEvent(String),
}

/// Read-only projection of an existing commitment, used only for availability.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BusyInterval {
    pub span: Span,
    pub source: BusySource,
}

// ── Escalations ──────────────────────────────────────────────────

/// A payment that succeeded for an appointment that no longer holds its slot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Escalation {
    pub id: Ulid,
    pub appointment_id: Ulid,
    pub professional_id: Ulid,
    pub payment_reference: String,
    pub state: AppointmentState,
    pub deposit_amount: i64,
    pub raised_at: Ms,
}

/// WAL record format. Flat: no nesting beyond the records they carry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    HoldPlaced {
        appointment: Appointment,
    },
    StateChanged {
        id: Ulid,
        professional_id: Ulid,
        from: AppointmentState,
        to: AppointmentState,
        at: Ms,
    },
    MirrorUpdated {
        id: Ulid,
        professional_id: Ulid,
        mirror: MirrorStatus,
    },
    PaymentEscalated {
        escalation: Escalation,
    },
    /// Compaction output: an appointment exactly as it stood, history included.
    Snapshot {
        appointment: Appointment,
    },
}

impl Event {
    pub fn professional_id(&self) -> Ulid {
        match self {
            Event::HoldPlaced { appointment } | Event::Snapshot { appointment } => {
                appointment.professional_id
            }
            Event::StateChanged { professional_id, .. }
            | Event::MirrorUpdated { professional_id, .. } => *professional_id,
            Event::PaymentEscalated { escalation } => escalation.professional_id,
        }
    }
}

/// All appointments of one professional, sorted by `window.start`.
#[derive(Debug, Clone)]
pub struct ProfessionalLedger {
    pub id: Ulid,
    pub appointments: Vec<Appointment>,
}

impl ProfessionalLedger {
    pub fn new(id: Ulid) -> Self {
        Self {
            id,
            appointments: Vec::new(),
        }
    }

    /// Insert maintaining sort order by window start.
    pub fn insert(&mut self, appointment: Appointment) {
        let pos = self
            .appointments
            .partition_point(|a| a.window.start <= appointment.window.start);
        self.appointments.insert(pos, appointment);
    }

    pub fn get(&self, id: &Ulid) -> Option<&Appointment> {
        self.appointments.iter().find(|a| a.id == *id)
    }

    pub fn get_mut(&mut self, id: &Ulid) -> Option<&mut Appointment> {
        self.appointments.iter_mut().find(|a| a.id == *id)
    }

    /// Appointments whose window overlaps `query`.
    /// Uses binary search to skip appointments starting at or after `query.end`.
    pub fn overlapping(&self, query: &Span) -> impl Iterator<Item = &Appointment> {
        let right_bound = self
            .appointments
            .partition_point(|a| a.window.start < query.end);
        self.appointments[..right_bound]
            .iter()
            .filter(move |a| a.window.end > query.start)
    }

    pub fn live_count(&self) -> usize {
        self.appointments.iter().filter(|a| a.state().is_live()).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hold_at(start: Ms, end: Ms) -> Appointment {
        Appointment::new_hold(NewHold {
            id: Ulid::new(),
            professional_id: Ulid::new(),
            customer_id: "c1".into(),
            service_ids: vec!["lash_classic".into()],
            category: "lashes".into(),
            window: Span::new(start, end),
            payment_reference: format!("pay_{start}"),
            price_total: 2500,
            deposit_amount: 500,
            external_calendar_event_id: "evt".into(),
            created_at: 0,
            hold_deadline: 1_000,
        })
    }

    #[test]
    fn span_overlap_is_half_open() {
        let a = Span::new(100, 200);
        let b = Span::new(150, 250);
        let c = Span::new(200, 300);
        assert!(a.overlaps(&b));
        assert!(!a.overlaps(&c));
    }

    #[test]
    fn checked_span_rejects_empty_and_inverted() {
        assert_eq!(Span::checked(100, 200), Some(Span::new(100, 200)));
        assert_eq!(Span::checked(200, 200), None);
        assert_eq!(Span::checked(300, 200), None);
    }

    #[test]
    fn overlap_with_buffer_on_both_sides() {
        let booked = Span::new(10 * HOUR_MS, 11 * HOUR_MS);
        let buffer = 10 * MINUTE_MS;
        // Starts inside the trailing buffer.
        let after = Span::from_minutes(11 * HOUR_MS + 5 * MINUTE_MS, 30);
        assert!(booked.overlaps_with_buffer(&after, buffer));
        // Ends inside the leading buffer.
        let before = Span::new(9 * HOUR_MS, 9 * HOUR_MS + 55 * MINUTE_MS);
        assert!(booked.overlaps_with_buffer(&before, buffer));
        // Exactly one buffer apart.
        let clear = Span::from_minutes(11 * HOUR_MS + 10 * MINUTE_MS, 60);
        assert!(!booked.overlaps_with_buffer(&clear, buffer));
        assert!(!clear.overlaps_with_buffer(&booked, buffer));
    }

    #[test]
    fn lifecycle_edges() {
        use AppointmentState::*;
        assert!(Hold.can_transition_to(Confirmed));
        assert!(Hold.can_transition_to(Expired));
        assert!(Hold.can_transition_to(CancelledBeforePay));
        assert!(Confirmed.can_transition_to(Refunded));
        assert!(!Hold.can_transition_to(Hold));
        assert!(!Expired.can_transition_to(Hold));
        assert!(!Expired.can_transition_to(Confirmed));
        assert!(!Hold.can_transition_to(Refunded));
        assert!(!Refunded.can_transition_to(Cancelled));
        for s in [Expired, CancelledBeforePay, Cancelled, Refunded, Completed] {
            assert!(s.is_terminal());
        }
    }

    #[test]
    fn state_names_roundtrip() {
        use AppointmentState::*;
        for s in [Hold, Confirmed, Expired, CancelledBeforePay, Cancelled, Refunded, Completed] {
            assert_eq!(AppointmentState::parse(s.as_str()), Some(s));
        }
        assert_eq!(AppointmentState::parse("CONFIRMED"), Some(Confirmed));
        assert_eq!(AppointmentState::parse("requested"), None);
    }

    #[test]
    fn apply_transition_is_compare_and_swap() {
        let mut appt = hold_at(0, 100);
        assert_eq!(appt.hold_deadline(), Some(1_000));
        appt.apply_transition(AppointmentState::Hold, AppointmentState::Expired, 5)
            .unwrap();
        assert_eq!(appt.state(), AppointmentState::Expired);
        assert_eq!(appt.hold_deadline(), None);

        let err = appt
            .apply_transition(AppointmentState::Hold, AppointmentState::Expired, 6)
            .unwrap_err();
        assert_eq!(err.actual, AppointmentState::Expired);
        assert_eq!(appt.history().len(), 1);
    }

    #[test]
    fn apply_transition_rejects_missing_edge() {
        let mut appt = hold_at(0, 100);
        let err = appt
            .apply_transition(AppointmentState::Hold, AppointmentState::Refunded, 5)
            .unwrap_err();
        assert_eq!(err.actual, AppointmentState::Hold);
        assert_eq!(appt.state(), AppointmentState::Hold);
    }

    #[test]
    fn ledger_keeps_start_order() {
        let mut ledger = ProfessionalLedger::new(Ulid::new());
        ledger.insert(hold_at(300, 400));
        ledger.insert(hold_at(100, 200));
        ledger.insert(hold_at(200, 300));
        let starts: Vec<Ms> = ledger.appointments.iter().map(|a| a.window.start).collect();
        assert_eq!(starts, vec![100, 200, 300]);
    }

    #[test]
    fn overlapping_skips_past_and_future() {
        let mut ledger = ProfessionalLedger::new(Ulid::new());
        ledger.insert(hold_at(100, 200));
        ledger.insert(hold_at(450, 600));
        ledger.insert(hold_at(1000, 1100));
        let hits: Vec<_> = ledger.overlapping(&Span::new(500, 800)).collect();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].window, Span::new(450, 600));
    }

    #[test]
    fn live_count_skips_released_rows() {
        let mut ledger = ProfessionalLedger::new(Ulid::new());
        ledger.insert(hold_at(0, 10));
        let mut gone = hold_at(20, 30);
        gone.apply_transition(AppointmentState::Hold, AppointmentState::Expired, 5)
            .unwrap();
        ledger.insert(gone);
        assert_eq!(ledger.appointments.len(), 2);
        assert_eq!(ledger.live_count(), 1);
    }

    #[test]
    fn overlapping_adjacent_not_included() {
        let mut ledger = ProfessionalLedger::new(Ulid::new());
        ledger.insert(hold_at(100, 200));
        assert_eq!(ledger.overlapping(&Span::new(200, 300)).count(), 0);
    }

    #[test]
    fn event_serialization_roundtrip() {
        let event = Event::HoldPlaced {
            appointment: hold_at(100, 200),
        };
        let bytes = bincode::serialize(&event).unwrap();
        let decoded: Event = bincode::deserialize(&bytes).unwrap();
        assert_eq!(event, decoded);
    }
}
