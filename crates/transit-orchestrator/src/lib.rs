//! The transfer orchestrator: ticket allocation, admission queue,
//! interface-aware pause/resume/swap, and the per-ticket state machine
//! described in spec.md §4. Everything here is driven through
//! [`OrchestratorHandle`]; the actor itself (`Orchestrator`) is not
//! constructed directly outside `spawn`.

pub mod controller;
pub mod event;
pub mod interface_monitor;
pub mod orchestrator;
pub mod resource_guard;
pub mod scheduler;
pub mod security;
pub mod ticket;

pub use event::{BroadcastEventPublisher, EventPublisher, TransferEvent};
pub use interface_monitor::{Edge, InterfaceMonitor};
pub use orchestrator::{AdmitRequest, Orchestrator, OrchestratorHandle};
pub use resource_guard::{NullWakeLock, ResourceGuard, SpaceZone, WakeLockClient};
pub use scheduler::Scheduler;
pub use ticket::TicketGenerator;
