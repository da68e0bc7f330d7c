mod availability;
mod conflict;
mod error;
mod hold;
mod mirror;
mod payment;
mod queries;
mod transitions;

pub use availability::{
    RejectReason, SlotCursor, SlotRequest, SlotSearch, WindowCheck, check_window,
    earliest_bookable, merge_overlapping, reconcile_busy, resolve_slots, subtract_intervals,
    working_intervals,
};
pub use error::EngineError;
pub use hold::HoldRequest;
pub use mirror::MirrorRemoval;
pub use payment::{PaymentOutcome, PaymentResolution};
pub use queries::SlotQuery;

use std::collections::HashMap;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{RwLock, mpsc, oneshot};
use ulid::Ulid;

use crate::calendar::{CalendarProvider, RetryPolicy};
use crate::clock::Clock;
use crate::limits::MAX_PROFESSIONALS_PER_TENANT;
use crate::model::*;
use crate::notify::NotifyHub;
use crate::policy::{BookingPolicy, PolicyHandle};
use crate::wal::Wal;

pub type SharedLedger = Arc<RwLock<ProfessionalLedger>>;

// ── Group-commit WAL channel ─────────────────────────────

pub(super) enum WalCommand {
    Append {
        event: Event,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        events: Vec<Event>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

type PendingAppend = (Event, oneshot::Sender<io::Result<()>>);

/// Background task that owns the WAL and batches appends for group commit.
/// Takes the first append, drains whatever else is already queued, then fsyncs once
/// and answers every sender with the shared result.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        let mut batch = match cmd {
            WalCommand::Append { event, response } => vec![(event, response)],
            other => {
                handle_non_append(&mut wal, other);
                continue;
            }
        };
        let mut deferred = None;
        loop {
            match rx.try_recv() {
                Ok(WalCommand::Append { event, response }) => batch.push((event, response)),
                Ok(other) => {
                    deferred = Some(other);
                    break;
                }
                Err(_) => break,
            }
        }
        commit_batch(&mut wal, &mut batch);
        // A compaction queued behind the batch must see it on disk first.
        if let Some(cmd) = deferred {
            handle_non_append(&mut wal, cmd);
        }
    }
}

fn commit_batch(wal: &mut Wal, batch: &mut Vec<PendingAppend>) {
    metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
    let flush_start = std::time::Instant::now();
    let result = flush_batch(wal, batch);
    metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
        .record(flush_start.elapsed().as_secs_f64());
    for (_, tx) in batch.drain(..) {
        let r = match &result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(r);
    }
}

fn flush_batch(wal: &mut Wal, batch: &[PendingAppend]) -> io::Result<()> {
    let append_err = batch
        .iter()
        .find_map(|(event, _)| wal.append_buffered(event).err());
    // Flush even after a failed append so stray buffered bytes never leak into the
    // next batch; every caller of this one is told it failed.
    let flush_err = wal.flush_sync().err();
    match append_err.or(flush_err) {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

fn handle_non_append(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { events, response } => {
            let result =
                Wal::write_compact_file(wal.path(), &events).and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { event, response } => {
            let mut batch = vec![(event, response)];
            commit_batch(wal, &mut batch);
        }
    }
}

// ── Engine ───────────────────────────────────────────────────────

/// The appointment ledger of one tenant plus its collaborators.
pub struct Engine {
    pub ledgers: DashMap<Ulid, SharedLedger>,
    pub(super) wal_tx: mpsc::Sender<WalCommand>,
    pub notify: Arc<NotifyHub>,
    /// appointment id → professional id
    pub(super) appointment_index: DashMap<Ulid, Ulid>,
    /// payment reference → appointment id; unique across the tenant.
    pub(super) payment_index: DashMap<String, Ulid>,
    /// payment reference → escalation raised for it.
    pub(super) escalations: DashMap<String, Escalation>,
    /// Hold inserts share it; compaction takes it exclusively so no new professional can
    /// append while the snapshot is written.
    pub(super) compaction_gate: RwLock<()>,
    pub(super) calendar: Arc<dyn CalendarProvider>,
    pub(super) policy: Arc<PolicyHandle>,
    pub(super) clock: Clock,
    pub(super) retry: RetryPolicy,
}

impl Engine {
    pub fn new(
        wal_path: PathBuf,
        notify: Arc<NotifyHub>,
        calendar: Arc<dyn CalendarProvider>,
        policy: Arc<PolicyHandle>,
    ) -> io::Result<Self> {
        let (wal, events) = Wal::recover(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let engine = Self {
            ledgers: DashMap::new(),
            wal_tx,
            notify,
            appointment_index: DashMap::new(),
            payment_index: DashMap::new(),
            escalations: DashMap::new(),
            compaction_gate: RwLock::new(()),
            calendar,
            policy,
            clock: Clock::System,
            retry: RetryPolicy::default(),
        };

        // Rebuild into plain ledgers first; nothing else can see them yet.
        let mut rebuilt: HashMap<Ulid, ProfessionalLedger> = HashMap::new();
        for event in &events {
            let pid = event.professional_id();
            let ledger = rebuilt
                .entry(pid)
                .or_insert_with(|| ProfessionalLedger::new(pid));
            engine.apply_to_ledger(ledger, event);
        }
        for (pid, ledger) in rebuilt {
            engine.ledgers.insert(pid, Arc::new(RwLock::new(ledger)));
        }
        if !events.is_empty() {
            tracing::info!(
                "replayed {} events into {} ledgers",
                events.len(),
                engine.ledgers.len()
            );
        }

        Ok(engine)
    }

    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn now(&self) -> Ms {
        self.clock.now()
    }

    pub fn policy(&self) -> Arc<BookingPolicy> {
        self.policy.snapshot()
    }

    /// Apply an event to a ledger (no locking; caller holds the lock).
    fn apply_to_ledger(&self, ledger: &mut ProfessionalLedger, event: &Event) {
        match event {
            Event::HoldPlaced { appointment } | Event::Snapshot { appointment } => {
                self.appointment_index
                    .insert(appointment.id, appointment.professional_id);
                self.payment_index
                    .insert(appointment.payment_reference.clone(), appointment.id);
                ledger.insert(appointment.clone());
            }
            Event::StateChanged { id, from, to, at, .. } => {
                let Some(appt) = ledger.get_mut(id) else {
                    tracing::warn!("state change for unknown appointment {id}");
                    return;
                };
                match appt.apply_transition(*from, *to, *at) {
                    Ok(_) => {
                        if let Some(mirror) = mirror_after(*to) {
                            appt.set_mirror(mirror);
                        }
                    }
                    Err(rejected) => tracing::warn!(
                        "logged transition {from} -> {to} does not apply to {id} in state {}",
                        rejected.actual
                    ),
                }
            }
            Event::MirrorUpdated { id, mirror, .. } => {
                if let Some(appt) = ledger.get_mut(id) {
                    appt.set_mirror(*mirror);
                }
            }
            Event::PaymentEscalated { escalation } => {
                self.escalations
                    .insert(escalation.payment_reference.clone(), escalation.clone());
            }
        }
    }

    /// Write event to WAL via the background group-commit writer.
    async fn wal_append(&self, event: &Event) -> Result<(), EngineError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append {
                event: event.clone(),
                response: tx,
            })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
    }

    /// WAL-append, apply, notify. Nothing becomes visible before it is durable.
    pub(super) async fn persist_and_apply(
        &self,
        ledger: &mut ProfessionalLedger,
        event: &Event,
    ) -> Result<(), EngineError> {
        self.wal_append(event).await?;
        self.apply_to_ledger(ledger, event);
        self.notify.send(ledger.id, event);
        Ok(())
    }

    pub fn get_ledger(&self, professional_id: &Ulid) -> Option<SharedLedger> {
        self.ledgers.get(professional_id).map(|e| e.value().clone())
    }

    /// The professional's ledger, created empty on first use.
    pub(super) fn ledger_for(&self, professional_id: Ulid) -> Result<SharedLedger, EngineError> {
        if let Some(ledger) = self.get_ledger(&professional_id) {
            return Ok(ledger);
        }
        if self.ledgers.len() >= MAX_PROFESSIONALS_PER_TENANT {
            return Err(EngineError::LimitExceeded("too many professionals"));
        }
        Ok(self
            .ledgers
            .entry(professional_id)
            .or_insert_with(|| Arc::new(RwLock::new(ProfessionalLedger::new(professional_id))))
            .value()
            .clone())
    }

    pub fn professional_of(&self, appointment_id: &Ulid) -> Option<Ulid> {
        self.appointment_index.get(appointment_id).map(|e| *e.value())
    }

    /// Lookup appointment → professional, acquire that ledger's write lock.
    pub(super) async fn resolve_appointment_write(
        &self,
        appointment_id: &Ulid,
    ) -> Result<tokio::sync::OwnedRwLockWriteGuard<ProfessionalLedger>, EngineError> {
        let professional_id = self
            .professional_of(appointment_id)
            .ok_or(EngineError::NotFound(*appointment_id))?;
        let ledger = self
            .get_ledger(&professional_id)
            .ok_or(EngineError::NotFound(professional_id))?;
        Ok(ledger.write_owned().await)
    }
}
