use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::engine::{Engine, EngineError};

const COMPACT_CHECK_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SweepReport {
    pub expired: usize,
    pub mirrors_removed: usize,
    /// Calendar deletions that failed this round and will be retried.
    pub mirrors_pending: usize,
}

/// One pass: expire every lapsed hold, then delete calendar events of released
/// appointments. Safe to run concurrently with payments and with other sweeps.
pub async fn sweep_once(engine: &Engine) -> SweepReport {
    let mut report = SweepReport::default();

    let now = engine.now();
    for (id, professional_id) in engine.collect_expired_holds(now).await {
        match engine.expire(id).await {
            Ok(_) => {
                report.expired += 1;
                info!("expired hold {id} of professional {professional_id}");
            }
            // Confirmed, cancelled or expired by someone else in the meantime.
            Err(EngineError::StaleStateConflict { actual, .. }) => {
                tracing::debug!("sweeper skip {id}: now {actual}");
            }
            Err(e) => tracing::warn!("sweeper could not expire {id}: {e}"),
        }
    }

    for removal in engine.pending_mirror_removals().await {
        match engine.remove_mirror(&removal).await {
            Ok(()) => {
                report.mirrors_removed += 1;
                metrics::counter!(crate::observability::MIRRORS_REMOVED_TOTAL).increment(1);
            }
            Err(e) => {
                report.mirrors_pending += 1;
                tracing::warn!(
                    "calendar event {} of {} still pending removal: {e}",
                    removal.event_id,
                    removal.appointment_id
                );
            }
        }
    }

    report
}

/// Background task that periodically sweeps a tenant until `cancel` fires.
pub async fn run_sweeper(engine: Arc<Engine>, every: Duration, cancel: CancellationToken) {
    let mut interval = tokio::time::interval(every);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = interval.tick() => {
                let report = sweep_once(&engine).await;
                if report != SweepReport::default() {
                    tracing::debug!("sweep: {report:?}");
                }
            }
        }
    }
    tracing::debug!("sweeper stopped");
}

/// Background task that compacts the WAL once enough appends have piled up.
pub async fn run_compactor(engine: Arc<Engine>, threshold: u64, cancel: CancellationToken) {
    let mut interval = tokio::time::interval(COMPACT_CHECK_INTERVAL);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = interval.tick() => {
                let appends = engine.wal_appends_since_compact().await;
                if appends < threshold {
                    continue;
                }
                match engine.compact_wal().await {
                    Ok(()) => info!("compacted WAL after {appends} appends"),
                    Err(e) => tracing::error!("WAL compaction failed: {e}"),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calendar::{CalendarError, CalendarOp, InMemoryCalendar, RetryPolicy};
    use crate::clock::Clock;
    use crate::engine::HoldRequest;
    use crate::model::*;
    use crate::notify::NotifyHub;
    use crate::policy::{BookingPolicy, PolicyHandle, ServiceDef};
    use std::path::PathBuf;
    use ulid::Ulid;

    // 2026-03-02, a Monday, 00:00 UTC.
    const MONDAY: Ms = 1_772_409_600_000;
    const H: Ms = 3_600_000;

    fn test_wal_path(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("slotlock_test_sweeper");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        let _ = std::fs::remove_file(&path);
        path
    }

    fn policy() -> BookingPolicy {
        let mut p = BookingPolicy::default();
        p.services.insert(
            "cut".into(),
            ServiceDef {
                id: "cut".into(),
                category: "hair".into(),
                duration_minutes: 60,
                price: 3000,
                deposit: 1000,
            },
        );
        p
    }

    fn fast_retry() -> RetryPolicy {
        RetryPolicy {
            attempts: 2,
            timeout: Duration::from_millis(50),
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(2),
        }
    }

    async fn setup(name: &str) -> (Arc<Engine>, Arc<InMemoryCalendar>, Clock) {
        let calendar = Arc::new(InMemoryCalendar::new());
        let clock = Clock::manual(MONDAY + 8 * H);
        let engine = Engine::new(
            test_wal_path(name),
            Arc::new(NotifyHub::new()),
            calendar.clone(),
            Arc::new(PolicyHandle::new(policy())),
        )
        .unwrap()
        .with_clock(clock.clone())
        .with_retry_policy(fast_retry());
        (Arc::new(engine), calendar, clock)
    }

    async fn hold_at(engine: &Engine, pid: Ulid, start: Ms, reference: &str) -> Appointment {
        engine
            .create_hold(HoldRequest {
                professional_id: pid,
                customer_id: "cust".into(),
                window: Span::new(start, start + H),
                service_ids: vec!["cut".into()],
                payment_reference: reference.into(),
            })
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn sweep_expires_lapsed_holds_and_removes_mirrors() {
        let (engine, calendar, clock) = setup("sweep_basic.wal").await;
        let pid = Ulid::new();
        let appt = hold_at(&engine, pid, MONDAY + 10 * H, "pay_1").await;
        assert_eq!(calendar.event_count(pid).await, 1);

        // Not lapsed yet.
        assert_eq!(sweep_once(&engine).await, SweepReport::default());

        clock.advance(11 * 60_000);
        let report = sweep_once(&engine).await;
        assert_eq!(report.expired, 1);
        assert_eq!(report.mirrors_removed, 1);
        assert_eq!(calendar.event_count(pid).await, 0);

        let after = engine.get_appointment(&appt.id).await.unwrap();
        assert_eq!(after.state(), AppointmentState::Expired);
        assert_eq!(after.mirror(), MirrorStatus::Removed);

        // A second sweep has nothing left to do.
        assert_eq!(sweep_once(&engine).await, SweepReport::default());
    }

    #[tokio::test]
    async fn failed_calendar_delete_is_retried_next_sweep() {
        let (engine, calendar, clock) = setup("sweep_retry.wal").await;
        let pid = Ulid::new();
        let appt = hold_at(&engine, pid, MONDAY + 10 * H, "pay_2").await;

        clock.advance(H);
        calendar
            .fail_next(CalendarOp::Delete, 2, CalendarError::Transient("503".into()))
            .await;
        let report = sweep_once(&engine).await;
        assert_eq!(report.expired, 1);
        assert_eq!(report.mirrors_pending, 1);
        let stuck = engine.get_appointment(&appt.id).await.unwrap();
        assert_eq!(stuck.state(), AppointmentState::Expired);
        assert_eq!(stuck.mirror(), MirrorStatus::RemovalPending);

        let report = sweep_once(&engine).await;
        assert_eq!(report.expired, 0);
        assert_eq!(report.mirrors_removed, 1);
        assert_eq!(calendar.event_count(pid).await, 0);
    }

    #[tokio::test]
    async fn confirmed_holds_are_left_alone() {
        let (engine, _calendar, clock) = setup("sweep_confirmed.wal").await;
        let pid = Ulid::new();
        let appt = hold_at(&engine, pid, MONDAY + 10 * H, "pay_3").await;
        engine.confirm(appt.id).await.unwrap();

        clock.advance(H);
        assert_eq!(sweep_once(&engine).await, SweepReport::default());
        let after = engine.get_appointment(&appt.id).await.unwrap();
        assert_eq!(after.state(), AppointmentState::Confirmed);
    }

    #[tokio::test]
    async fn concurrent_sweeps_expire_once() {
        let (engine, _calendar, clock) = setup("sweep_concurrent.wal").await;
        let pid = Ulid::new();
        hold_at(&engine, pid, MONDAY + 10 * H, "pay_4").await;
        clock.advance(H);

        let (a, b) = tokio::join!(sweep_once(&engine), sweep_once(&engine));
        assert_eq!(a.expired + b.expired, 1);
    }

    #[tokio::test]
    async fn sweeper_stops_on_cancel() {
        let (engine, _calendar, _clock) = setup("sweep_cancel.wal").await;
        let cancel = CancellationToken::new();
        let task = tokio::spawn(run_sweeper(
            engine.clone(),
            Duration::from_millis(5),
            cancel.clone(),
        ));
        tokio::time::sleep(Duration::from_millis(20)).await;
        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .expect("sweeper did not stop")
            .unwrap();
    }
}
