//! Customer and ticket storage.

pub mod models;
pub mod sqlite;

pub use models::{Customer, CustomerStatus, CustomerUpdate, OpenTicket, Priority, Ticket, TicketStatus};
pub use sqlite::Store;
