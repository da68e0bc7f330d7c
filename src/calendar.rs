//! External calendar port.
//!
//! The calendar is a mirror of the ledger and a source of foreign busy time
//! (personal events, manual blocks). It is never asked to arbitrate a booking.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;
use ulid::Ulid;

use crate::model::{BusyInterval, BusySource, Span};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CalendarError {
    /// Network trouble or a 5xx; worth another attempt.
    Transient(String),
    Timeout,
    /// The provider refused the request outright.
    Permanent(String),
}

impl CalendarError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, CalendarError::Transient(_) | CalendarError::Timeout)
    }
}

impl std::fmt::Display for CalendarError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CalendarError::Transient(e) => write!(f, "transient calendar error: {e}"),
            CalendarError::Timeout => write!(f, "calendar request timed out"),
            CalendarError::Permanent(e) => write!(f, "calendar rejected request: {e}"),
        }
    }
}

impl std::error::Error for CalendarError {}

/// How a mirrored appointment is drawn on the professional's calendar.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VisualState {
    Held,
    Confirmed,
}

#[async_trait]
pub trait CalendarProvider: Send + Sync {
    /// Every event of the professional intersecting `window`, mirrors included.
    async fn list_busy_intervals(
        &self,
        professional_id: Ulid,
        window: Span,
    ) -> Result<Vec<BusyInterval>, CalendarError>;

    /// Creates a provisional event for `appointment_id` and returns its provider id.
    ///
    /// Must be idempotent per appointment: a repeated create (a retry after a timeout
    /// that the provider did commit) returns the existing event instead of a second one.
    async fn create_event(
        &self,
        professional_id: Ulid,
        appointment_id: Ulid,
        span: Span,
        summary: &str,
    ) -> Result<String, CalendarError>;

    async fn update_event(
        &self,
        professional_id: Ulid,
        event_id: &str,
        visual: VisualState,
    ) -> Result<(), CalendarError>;

    /// Deleting an event that is already gone succeeds.
    async fn delete_event(&self, professional_id: Ulid, event_id: &str)
    -> Result<(), CalendarError>;

    /// Delete whatever event a create for `appointment_id` may have left behind.
    /// Succeeds when there is none.
    async fn delete_event_for(
        &self,
        professional_id: Ulid,
        appointment_id: Ulid,
    ) -> Result<(), CalendarError>;
}

// ── Retry ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub attempts: u32,
    /// Per-attempt deadline.
    pub timeout: Duration,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            timeout: Duration::from_secs(5),
            initial_backoff: Duration::from_millis(200),
            max_backoff: Duration::from_secs(2),
        }
    }
}

/// Run `call` until it succeeds, fails permanently or runs out of attempts.
/// Each attempt is bounded by `policy.timeout`; backoff doubles between attempts.
pub async fn with_retry<T, F, Fut>(
    op: &'static str,
    policy: &RetryPolicy,
    mut call: F,
) -> Result<T, CalendarError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, CalendarError>>,
{
    let mut backoff = policy.initial_backoff;
    let mut attempt = 1;
    loop {
        let result = tokio::time::timeout(policy.timeout, call())
            .await
            .unwrap_or(Err(CalendarError::Timeout));
        match result {
            Ok(v) => return Ok(v),
            Err(e) if e.is_retryable() && attempt < policy.attempts => {
                metrics::counter!(crate::observability::CALENDAR_RETRIES_TOTAL, "op" => op)
                    .increment(1);
                tracing::warn!("calendar {op} attempt {attempt} failed: {e}; retrying in {backoff:?}");
                tokio::time::sleep(backoff).await;
                backoff = (backoff * 2).min(policy.max_backoff);
                attempt += 1;
            }
            Err(e) => {
                metrics::counter!(crate::observability::CALENDAR_FAILURES_TOTAL, "op" => op)
                    .increment(1);
                return Err(e);
            }
        }
    }
}

// ── In-memory provider ───────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CalendarOp {
    List,
    Create,
    Update,
    Delete,
}

/// Scripted misbehaviour for the next call of an operation.
#[derive(Debug, Clone)]
pub enum Fault {
    Fail(CalendarError),
    /// Sleep before answering normally.
    Stall(Duration),
    /// Do the work, then sleep before answering.
    StallAfter(Duration),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredEvent {
    pub span: Span,
    pub summary: String,
    /// `None` for blocks that were not created by the booking engine.
    pub visual: Option<VisualState>,
    /// Appointment the event was created for.
    pub appointment_id: Option<Ulid>,
}

#[derive(Debug, Default)]
struct CalendarState {
    events: HashMap<Ulid, BTreeMap<String, StoredEvent>>,
    faults: HashMap<CalendarOp, VecDeque<Fault>>,
    calls: HashMap<CalendarOp, u64>,
    next_id: u64,
}

/// Calendar kept in process memory. Serves single-node deployments and tests;
/// faults can be queued per operation.
#[derive(Debug, Default)]
pub struct InMemoryCalendar {
    inner: Mutex<CalendarState>,
}

impl InMemoryCalendar {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an event that did not come from a booking (lunch, day off, ...).
    pub async fn add_block(&self, professional_id: Ulid, span: Span, summary: &str) -> String {
        let mut st = self.inner.lock().await;
        let id = next_event_id(&mut st);
        st.events.entry(professional_id).or_default().insert(
            id.clone(),
            StoredEvent {
                span,
                summary: summary.to_string(),
                visual: None,
                appointment_id: None,
            },
        );
        id
    }

    pub async fn fail_next(&self, op: CalendarOp, times: usize, error: CalendarError) {
        let mut st = self.inner.lock().await;
        let queue = st.faults.entry(op).or_default();
        queue.extend(std::iter::repeat_n(Fault::Fail(error), times));
    }

    pub async fn stall_next(&self, op: CalendarOp, times: usize, delay: Duration) {
        let mut st = self.inner.lock().await;
        let queue = st.faults.entry(op).or_default();
        queue.extend(std::iter::repeat_n(Fault::Stall(delay), times));
    }

    /// The next `times` calls succeed on the calendar but answer only after `delay`.
    pub async fn stall_after_next(&self, op: CalendarOp, times: usize, delay: Duration) {
        let mut st = self.inner.lock().await;
        let queue = st.faults.entry(op).or_default();
        queue.extend(std::iter::repeat_n(Fault::StallAfter(delay), times));
    }

    pub async fn event(&self, professional_id: Ulid, event_id: &str) -> Option<StoredEvent> {
        let st = self.inner.lock().await;
        st.events
            .get(&professional_id)
            .and_then(|evs| evs.get(event_id))
            .cloned()
    }

    pub async fn event_count(&self, professional_id: Ulid) -> usize {
        let st = self.inner.lock().await;
        st.events.get(&professional_id).map_or(0, BTreeMap::len)
    }

    pub async fn calls(&self, op: CalendarOp) -> u64 {
        let st = self.inner.lock().await;
        st.calls.get(&op).copied().unwrap_or(0)
    }

    /// Count the call and apply any queued fault. The lock is released before stalling.
    /// Returns the delay to apply once the call has done its work.
    async fn enter(&self, op: CalendarOp) -> Result<Option<Duration>, CalendarError> {
        let fault = {
            let mut st = self.inner.lock().await;
            *st.calls.entry(op).or_default() += 1;
            st.faults.get_mut(&op).and_then(VecDeque::pop_front)
        };
        match fault {
            Some(Fault::Fail(e)) => Err(e),
            Some(Fault::Stall(delay)) => {
                tokio::time::sleep(delay).await;
                Ok(None)
            }
            Some(Fault::StallAfter(delay)) => Ok(Some(delay)),
            None => Ok(None),
        }
    }
}

async fn leave(after: Option<Duration>) {
    if let Some(delay) = after {
        tokio::time::sleep(delay).await;
    }
}

fn next_event_id(st: &mut CalendarState) -> String {
    st.next_id += 1;
    format!("evt_{:06}", st.next_id)
}

#[async_trait]
impl CalendarProvider for InMemoryCalendar {
    async fn list_busy_intervals(
        &self,
        professional_id: Ulid,
        window: Span,
    ) -> Result<Vec<BusyInterval>, CalendarError> {
        let after = self.enter(CalendarOp::List).await?;
        let mut busy: Vec<BusyInterval> = self
            .inner
            .lock()
            .await
            .events
            .get(&professional_id)
            .into_iter()
            .flatten()
            .filter(|(_, ev)| ev.span.overlaps(&window))
            .map(|(id, ev)| BusyInterval {
                span: ev.span,
                source: BusySource::CalendarEvent(id.clone()),
            })
            .collect();
        busy.sort_by_key(|b| b.span.start);
        leave(after).await;
        Ok(busy)
    }

    async fn create_event(
        &self,
        professional_id: Ulid,
        appointment_id: Ulid,
        span: Span,
        summary: &str,
    ) -> Result<String, CalendarError> {
        let after = self.enter(CalendarOp::Create).await?;
        let id = {
            let mut st = self.inner.lock().await;
            match find_event_for(&st, professional_id, appointment_id) {
                Some(existing) => existing,
                None => {
                    let id = next_event_id(&mut st);
                    st.events.entry(professional_id).or_default().insert(
                        id.clone(),
                        StoredEvent {
                            span,
                            summary: summary.to_string(),
                            visual: Some(VisualState::Held),
                            appointment_id: Some(appointment_id),
                        },
                    );
                    id
                }
            }
        };
        leave(after).await;
        Ok(id)
    }

    async fn update_event(
        &self,
        professional_id: Ulid,
        event_id: &str,
        visual: VisualState,
    ) -> Result<(), CalendarError> {
        let after = self.enter(CalendarOp::Update).await?;
        {
            let mut st = self.inner.lock().await;
            let ev = st
                .events
                .get_mut(&professional_id)
                .and_then(|evs| evs.get_mut(event_id))
                .ok_or_else(|| CalendarError::Permanent(format!("no such event: {event_id}")))?;
            ev.visual = Some(visual);
        }
        leave(after).await;
        Ok(())
    }

    async fn delete_event(
        &self,
        professional_id: Ulid,
        event_id: &str,
    ) -> Result<(), CalendarError> {
        let after = self.enter(CalendarOp::Delete).await?;
        if let Some(evs) = self.inner.lock().await.events.get_mut(&professional_id) {
            evs.remove(event_id);
        }
        leave(after).await;
        Ok(())
    }

    async fn delete_event_for(
        &self,
        professional_id: Ulid,
        appointment_id: Ulid,
    ) -> Result<(), CalendarError> {
        let after = self.enter(CalendarOp::Delete).await?;
        {
            let mut st = self.inner.lock().await;
            if let Some(id) = find_event_for(&st, professional_id, appointment_id)
                && let Some(evs) = st.events.get_mut(&professional_id)
            {
                evs.remove(&id);
            }
        }
        leave(after).await;
        Ok(())
    }
}

fn find_event_for(st: &CalendarState, professional_id: Ulid, appointment_id: Ulid) -> Option<String> {
    st.events
        .get(&professional_id)?
        .iter()
        .find(|(_, ev)| ev.appointment_id == Some(appointment_id))
        .map(|(id, _)| id.clone())
}
