use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, Datelike, NaiveDate};

use crate::model::*;
use crate::policy::BookingPolicy;

// ── Local calendar days ───────────────────────────────────────────

/// UTC instant of local midnight for the day containing `ms`.
pub fn local_day_start(ms: Ms, offset: Ms) -> Ms {
    (ms + offset).div_euclid(DAY_MS) * DAY_MS - offset
}

fn local_date(day_start: Ms, offset: Ms) -> Option<NaiveDate> {
    DateTime::from_timestamp_millis(day_start + offset).map(|d| d.date_naive())
}

/// First instant a booking may start at: local midnight `notice_days` days after today,
/// and never sooner than one minimum hold lifetime from `now`.
pub fn earliest_bookable(policy: &BookingPolicy, notice_days: u32, now: Ms) -> Ms {
    let soonest = now + policy.min_hold_ms();
    if notice_days == 0 {
        return soonest;
    }
    (local_day_start(now, policy.offset_ms()) + notice_days as Ms * DAY_MS).max(soonest)
}

/// Opening hours inside `window`, one span per open local day, clamped to the window.
/// Closed weekdays and holidays contribute nothing.
pub fn working_intervals(policy: &BookingPolicy, window: &Span) -> Vec<Span> {
    let offset = policy.offset_ms();
    let mut out = Vec::new();
    let mut day = local_day_start(window.start, offset);
    while day < window.end {
        if let Some(date) = local_date(day, offset)
            && !policy.is_holiday(date)
            && let Some(hours) = policy.hours_for(date.weekday())
        {
            let open = (day + hours.open_minute * MINUTE_MS).max(window.start);
            let close = (day + hours.close_minute * MINUTE_MS).min(window.end);
            if open < close {
                out.push(Span::new(open, close));
            }
        }
        day += DAY_MS;
    }
    out
}

/// Busy intervals grown by `buffer` on both sides, sorted and merged.
pub fn expanded_busy(busy: &[BusyInterval], buffer: Ms) -> Vec<Span> {
    let mut spans: Vec<Span> = busy.iter().map(|b| b.span.expanded(buffer)).collect();
    spans.sort_by_key(|s| s.start);
    merge_overlapping(&spans)
}

/// Combine the calendar's busy list with the ledger's live appointments.
///
/// Calendar events that mirror one of the professional's appointments are dropped in
/// favour of the ledger's own view: a hold past its deadline, or an appointment whose
/// mirror is still waiting for deletion, no longer blocks anything.
pub fn reconcile_busy(
    calendar: Vec<BusyInterval>,
    ledger: &ProfessionalLedger,
    now: Ms,
) -> Vec<BusyInterval> {
    let mirrors: HashSet<&str> = ledger
        .appointments
        .iter()
        .filter_map(|a| a.external_calendar_event_id.as_deref())
        .collect();

    let mut busy: Vec<BusyInterval> = calendar
        .into_iter()
        .filter(|b| match &b.source {
            BusySource::CalendarEvent(id) => !mirrors.contains(id.as_str()),
            BusySource::Appointment(_) => true,
        })
        .collect();

    busy.extend(
        ledger
            .appointments
            .iter()
            .filter(|a| a.state().is_live() && !a.hold_lapsed(now))
            .map(|a| BusyInterval {
                span: a.window,
                source: BusySource::Appointment(a.id),
            }),
    );
    busy.sort_by_key(|b| b.span.start);
    busy
}

// ── Slot search ───────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotRequest {
    pub duration_ms: Ms,
    pub window: Span,
    pub notice_days: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    /// The window ends before the advance-notice horizon; `earliest` is the first
    /// instant that would be accepted.
    BeforeNotice { earliest: Ms },
    /// No business hours fall inside the window.
    Closed,
}

#[derive(Debug, Clone)]
pub struct SlotSearch {
    pub slots: SlotCursor,
    pub rejection: Option<RejectReason>,
}

/// Lazy, chronologically ordered candidate windows over a fixed snapshot of free time.
///
/// Candidates step by the granularity from the start of each free sub-interval. Cloning
/// restarts nothing: a clone continues from the same position.
#[derive(Debug, Clone)]
pub struct SlotCursor {
    free: Arc<[Span]>,
    duration: Ms,
    granularity: Ms,
    idx: usize,
    next_start: Ms,
}

impl SlotCursor {
    pub fn new(free: Vec<Span>, duration: Ms, granularity: Ms) -> Self {
        let next_start = free.first().map_or(0, |s| s.start);
        Self {
            free: free.into(),
            duration,
            granularity: granularity.max(1),
            idx: 0,
            next_start,
        }
    }

    pub fn empty() -> Self {
        Self::new(Vec::new(), 1, 1)
    }

    /// Same snapshot, positioned after a window previously returned by it.
    pub fn continue_after(&self, last: Span) -> Self {
        let mut cursor = self.clone();
        cursor.skip_past(last.start);
        cursor
    }

    /// Position the cursor on the first candidate starting strictly after `instant`.
    pub fn skip_past(&mut self, instant: Ms) {
        self.idx = self.free.partition_point(|s| s.end <= instant);
        if let Some(sub) = self.free.get(self.idx) {
            self.next_start = if instant < sub.start {
                sub.start
            } else {
                sub.start + ((instant - sub.start) / self.granularity + 1) * self.granularity
            };
        }
    }
}

impl Iterator for SlotCursor {
    type Item = Span;

    fn next(&mut self) -> Option<Span> {
        while let Some(sub) = self.free.get(self.idx) {
            let candidate = self.next_start.max(sub.start);
            if candidate + self.duration <= sub.end {
                self.next_start = candidate + self.granularity;
                return Some(Span::new(candidate, candidate + self.duration));
            }
            self.idx += 1;
            if let Some(following) = self.free.get(self.idx) {
                self.next_start = following.start;
            }
        }
        None
    }
}

/// Free slots for a request against one busy snapshot. Deterministic in its inputs.
pub fn resolve_slots(
    policy: &BookingPolicy,
    request: &SlotRequest,
    busy: &[BusyInterval],
    now: Ms,
) -> SlotSearch {
    let earliest = earliest_bookable(policy, request.notice_days, now);
    if request.window.end <= earliest {
        return SlotSearch {
            slots: SlotCursor::empty(),
            rejection: Some(RejectReason::BeforeNotice { earliest }),
        };
    }
    let window = Span::new(request.window.start.max(earliest), request.window.end);

    let working = working_intervals(policy, &window);
    if working.is_empty() {
        return SlotSearch {
            slots: SlotCursor::empty(),
            rejection: Some(RejectReason::Closed),
        };
    }

    let blocked = expanded_busy(busy, policy.buffer_ms());
    let free = subtract_intervals(&working, &blocked);
    SlotSearch {
        slots: SlotCursor::new(free, request.duration_ms, policy.granularity_ms()),
        rejection: None,
    }
}

// ── Single-window check ───────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WindowCheck {
    TooSoon { earliest: Ms },
    /// Outside business hours, on a closed weekday or a holiday.
    Closed,
    Busy(BusySource),
}

/// Would `window` be offered by [`resolve_slots`] for this snapshot?
/// Granularity is not enforced here.
pub fn check_window(
    policy: &BookingPolicy,
    window: &Span,
    busy: &[BusyInterval],
    now: Ms,
) -> Result<(), WindowCheck> {
    let earliest = earliest_bookable(policy, policy.min_advance_notice_days, now);
    if window.start < earliest {
        return Err(WindowCheck::TooSoon { earliest });
    }
    if !working_intervals(policy, window)
        .iter()
        .any(|w| w.contains_span(window))
    {
        return Err(WindowCheck::Closed);
    }
    let buffer = policy.buffer_ms();
    if let Some(hit) = busy.iter().find(|b| b.span.overlaps_with_buffer(window, buffer)) {
        return Err(WindowCheck::Busy(hit.source.clone()));
    }
    Ok(())
}

// ── Interval algebra ──────────────────────────────────────────────

/// Merge sorted overlapping/adjacent intervals into disjoint intervals.
pub fn merge_overlapping(sorted: &[Span]) -> Vec<Span> {
    let mut merged: Vec<Span> = Vec::new();
    for &span in sorted {
        if let Some(last) = merged.last_mut()
            && span.start <= last.end
        {
            last.end = last.end.max(span.end);
            continue;
        }
        merged.push(span);
    }
    merged
}

/// `base` minus `to_remove`; both sorted, `to_remove` disjoint.
pub fn subtract_intervals(base: &[Span], to_remove: &[Span]) -> Vec<Span> {
    let mut result = Vec::new();
    let mut ri = 0;

    for &b in base {
        let mut current_start = b.start;
        let current_end = b.end;

        while ri < to_remove.len() && to_remove[ri].end <= current_start {
            ri += 1;
        }

        let mut j = ri;
        while j < to_remove.len() && to_remove[j].start < current_end {
            let r = &to_remove[j];
            if r.start > current_start {
                result.push(Span::new(current_start, r.start));
            }
            current_start = current_start.max(r.end);
            j += 1;
        }

        if current_start < current_end {
            result.push(Span::new(current_start, current_end));
        }
    }

    result
}
