use tokio::sync::mpsc::UnboundedSender;

use super::queue::TicketId;

/// Progress of one install, forwarded from the worker to whoever observes it.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum ProgressEvent {
    /// `count` blocks of `block_size` bytes out of `total_size` bytes have arrived.
    Transfer {
        ticket: TicketId,
        count: u64,
        block_size: u64,
        total_size: u64,
    },
    Completed {
        ticket: TicketId,
    },
    Failed {
        ticket: TicketId,
    },
}

impl ProgressEvent {
    pub fn ticket(&self) -> TicketId {
        match self {
            ProgressEvent::Transfer { ticket, .. }
            | ProgressEvent::Completed { ticket }
            | ProgressEvent::Failed { ticket } => *ticket,
        }
    }

    /// Completion fraction in `0.0..=1.0`.
    pub fn fraction(&self) -> f64 {
        match *self {
            ProgressEvent::Transfer {
                count,
                block_size,
                total_size,
                ..
            } => crate::util::progress_percent(count, block_size, total_size) / 100.0,
            ProgressEvent::Completed { .. } => 1.0,
            ProgressEvent::Failed { .. } => 0.0,
        }
    }
}

pub type ProgressSender = UnboundedSender<ProgressEvent>;

pub(crate) fn emit(sender: Option<&ProgressSender>, event: ProgressEvent) {
    if let Some(sender) = sender {
        // A dropped receiver means nobody is watching anymore.
        let _ = sender.send(event);
    }
}
