//! Database entities

pub mod account;
pub mod audit_record;
pub mod session;
pub mod staff_specialty;
pub mod team_member;
pub mod ticket;
pub mod ticket_type;
pub mod urgency_level;

pub use account::Entity as Account;
pub use audit_record::Entity as AuditRecord;
pub use session::Entity as Session;
pub use staff_specialty::Entity as StaffSpecialty;
pub use team_member::Entity as TeamMember;
pub use ticket::Entity as Ticket;
pub use ticket_type::Entity as TicketType;
pub use urgency_level::Entity as UrgencyLevel;
