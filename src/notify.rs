use dashmap::DashMap;
use tokio::sync::broadcast;
use ulid::Ulid;

use crate::model::{Escalation, Event};

const CHANNEL_CAPACITY: usize = 256;

/// Broadcast hub: ledger events per professional, plus one channel for paid-but-expired
/// escalations that operators must act on.
pub struct NotifyHub {
    channels: DashMap<Ulid, broadcast::Sender<Event>>,
    escalations: broadcast::Sender<Escalation>,
}

impl Default for NotifyHub {
    fn default() -> Self {
        Self::new()
    }
}

impl NotifyHub {
    pub fn new() -> Self {
        Self {
            channels: DashMap::new(),
            escalations: broadcast::channel(CHANNEL_CAPACITY).0,
        }
    }

    /// Subscribe to ledger events of a professional. Creates the channel if needed.
    pub fn subscribe(&self, professional_id: Ulid) -> broadcast::Receiver<Event> {
        let sender = self
            .channels
            .entry(professional_id)
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0);
        sender.subscribe()
    }

    /// Send a notification. No-op if nobody is listening.
    pub fn send(&self, professional_id: Ulid, event: &Event) {
        if let Some(sender) = self.channels.get(&professional_id) {
            let _ = sender.send(event.clone());
        }
    }

    pub fn subscribe_escalations(&self) -> broadcast::Receiver<Escalation> {
        self.escalations.subscribe()
    }

    pub fn escalate(&self, escalation: &Escalation) {
        let _ = self.escalations.send(escalation.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{AppointmentState, MirrorStatus};

    #[tokio::test]
    async fn subscribe_and_receive() {
        let hub = NotifyHub::new();
        let pid = Ulid::new();
        let mut rx = hub.subscribe(pid);

        let event = Event::MirrorUpdated {
            id: Ulid::new(),
            professional_id: pid,
            mirror: MirrorStatus::Removed,
        };
        hub.send(pid, &event);

        let received = rx.recv().await.unwrap();
        assert_eq!(received, event);
    }

    #[tokio::test]
    async fn send_without_subscribers_is_noop() {
        let hub = NotifyHub::new();
        let pid = Ulid::new();
        hub.send(
            pid,
            &Event::MirrorUpdated {
                id: Ulid::new(),
                professional_id: pid,
                mirror: MirrorStatus::Held,
            },
        );
        hub.escalate(&Escalation {
            id: Ulid::new(),
            appointment_id: Ulid::new(),
            professional_id: pid,
            payment_reference: "pay_1".into(),
            state: AppointmentState::Expired,
            deposit_amount: 0,
            raised_at: 0,
        });
    }

    #[tokio::test]
    async fn escalations_reach_every_subscriber() {
        let hub = NotifyHub::new();
        let mut a = hub.subscribe_escalations();
        let mut b = hub.subscribe_escalations();
        let escalation = Escalation {
            id: Ulid::new(),
            appointment_id: Ulid::new(),
            professional_id: Ulid::new(),
            payment_reference: "pay_9".into(),
            state: AppointmentState::CancelledBeforePay,
            deposit_amount: 500,
            raised_at: 42,
        };
        hub.escalate(&escalation);
        assert_eq!(a.recv().await.unwrap(), escalation);
        assert_eq!(b.recv().await.unwrap(), escalation);
    }
}
