use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use log::{debug, warn};
use uuid::Uuid;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct TicketId(Uuid);

impl TicketId {
    fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for TicketId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Process-wide gate allowing a single install in flight.
#[derive(Debug)]
pub struct InstallQueue {
    active: Mutex<Option<TicketId>>,
    poll_interval: Duration,
}

impl InstallQueue {
    pub fn new(poll_interval: Duration) -> Arc<Self> {
        Arc::new(Self {
            active: Mutex::new(None),
            poll_interval,
        })
    }

    fn slot(&self) -> MutexGuard<'_, Option<TicketId>> {
        self.active.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Ticket currently holding the gate, if any.
    pub fn active(&self) -> Option<TicketId> {
        *self.slot()
    }

    pub fn is_busy(&self) -> bool {
        self.active().is_some()
    }

    pub fn try_acquire(self: &Arc<Self>) -> Option<InstallTicket> {
        let mut slot = self.slot();
        if slot.is_some() {
            return None;
        }
        let id = TicketId::new();
        *slot = Some(id);
        debug!("queue: ticket {id} acquired");
        Some(InstallTicket {
            id,
            queue: Arc::clone(self),
        })
    }

    /// Sleep in `poll_interval` steps until the gate is free, then take it.
    pub async fn acquire(self: &Arc<Self>) -> InstallTicket {
        let mut waited = false;
        loop {
            if let Some(ticket) = self.try_acquire() {
                return ticket;
            }
            if !waited {
                debug!("queue: another install is running, waiting");
                waited = true;
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }

    fn release(&self, id: TicketId) {
        let mut slot = self.slot();
        match *slot {
            Some(current) if current == id => {
                *slot = None;
                debug!("queue: ticket {id} released");
            }
            other => warn!("queue: ticket {id} released while slot held {other:?}"),
        }
    }
}

/// Held for the duration of one install; dropping it frees the gate.
#[derive(Debug)]
pub struct InstallTicket {
    id: TicketId,
    queue: Arc<InstallQueue>,
}

impl InstallTicket {
    pub fn id(&self) -> TicketId {
        self.id
    }
}

impl Drop for InstallTicket {
    fn drop(&mut self) {
        self.queue.release(self.id);
    }
}
