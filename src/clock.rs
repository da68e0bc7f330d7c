use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};

use crate::model::Ms;

pub fn now_ms() -> Ms {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as Ms)
        .unwrap_or(0)
}

/// Time source for the engine. Tests drive a manual clock.
#[derive(Debug, Clone, Default)]
pub enum Clock {
    #[default]
    System,
    Manual(Arc<AtomicI64>),
}

impl Clock {
    pub fn manual(start: Ms) -> Self {
        Clock::Manual(Arc::new(AtomicI64::new(start)))
    }

    pub fn now(&self) -> Ms {
        match self {
            Clock::System => now_ms(),
            Clock::Manual(t) => t.load(Ordering::SeqCst),
        }
    }

    /// Move a manual clock. No-op on the system clock.
    pub fn set(&self, t: Ms) {
        if let Clock::Manual(cur) = self {
            cur.store(t, Ordering::SeqCst);
        }
    }

    pub fn advance(&self, by: Ms) {
        if let Clock::Manual(cur) = self {
            cur.fetch_add(by, Ordering::SeqCst);
        }
    }
}
