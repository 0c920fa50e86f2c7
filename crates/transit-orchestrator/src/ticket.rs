//! Ticket allocation (spec.md §3 "Ticket").

use std::sync::atomic::{AtomicU64, Ordering};
use transit_core::Ticket;

/// Monotonic, never-reused ticket source. Seeded from the history store's
/// `max_ticket()` at startup so tickets stay unique across restarts.
pub struct TicketGenerator {
    next: AtomicU64,
}

impl TicketGenerator {
    pub fn starting_after(max_existing: Ticket) -> Self {
        Self {
            next: AtomicU64::new(max_existing + 1),
        }
    }

    pub fn next(&self) -> Ticket {
        self.next.fetch_add(1, Ordering::SeqCst)
    }
}
