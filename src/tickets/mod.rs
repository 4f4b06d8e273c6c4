//! Ticket lifecycle and assignment engine

pub mod assignment;
pub mod audit;
pub mod machine;
pub mod query;
pub mod service;
pub mod status;
pub mod team;

pub use assignment::{AssignmentPolicy, Candidate, CandidateList};
pub use audit::{AuditAction, HistoryEntry, HistoryFilter};
pub use machine::Actor;
pub use query::TicketFilter;
pub use service::{ActionBody, NewTicket, Outcome, TicketService, TicketView};
pub use status::TicketStatus;
