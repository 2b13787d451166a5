//! Authentication: pending challenge tables and the coordinator

pub mod coordinator;
pub mod pending;

pub use coordinator::{AuthContext, AuthCoordinator, AuthObserver};
pub use pending::{PendingTable, PendingTicket, Resolution};
