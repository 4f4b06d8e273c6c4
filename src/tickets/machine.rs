//! The ticket status machine.
//!
//! A single transition table decides, for every action, which role may
//! trigger it, which relationship to the ticket the caller must hold, which
//! statuses it may start from and where it leads. Planning a transition is
//! pure: it only looks at the caller and a loaded ticket, and either returns
//! the exact change to write or the reason it is refused.

use super::audit::AuditAction;
use super::status::TicketStatus;
use crate::db::entities::account::Role;
use crate::db::entities::ticket;
use crate::error::{Result, ServerError};

/// The caller of an engine operation
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Actor {
    pub id: i32,
    pub role: Role,
}

impl Actor {
    pub fn new(id: i32, role: Role) -> Self {
        Self { id, role }
    }
}

/// Who, relative to the ticket, may trigger an action
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Scope {
    /// Any moderator
    Moderator,
    /// The staff member the ticket is assigned to
    Assignee,
    /// The account that filed the ticket
    Reporter,
}

impl Scope {
    fn role(&self) -> Role {
        match self {
            Scope::Moderator => Role::Mod,
            Scope::Assignee => Role::Staff,
            Scope::Reporter => Role::User,
        }
    }
}

/// What happens to the assignee column
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AssigneeChange {
    Keep,
    Set(i32),
    Clear,
}

/// A lifecycle action requested by a caller
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Action {
    Assign { staff_id: i32 },
    Escalate,
    MarkOutOfService,
    Close,
    Resolve,
    StartWork,
    SubmitForReview,
    Reassign,
    SetPending,
    Reject,
    Accept,
    EditDescription { description: String },
}

/// One row of the transition table
#[derive(Clone, Debug)]
pub struct Rule {
    pub scope: Scope,
    pub from: Vec<TicketStatus>,
    /// `None` keeps the current status
    pub to: Option<TicketStatus>,
    pub audit: AuditAction,
}

impl Action {
    /// Build an action from its wire name and the payload fields it needs
    pub fn parse(name: &str, staff_id: Option<i32>, description: Option<String>) -> Result<Action> {
        let action = match name.trim().to_ascii_lowercase().as_str() {
            "assign" => Action::Assign {
                staff_id: staff_id
                    .ok_or_else(|| ServerError::InvalidRequest("assign requires staff_id".into()))?,
            },
            "escalate" => Action::Escalate,
            "mark_out_of_service" => Action::MarkOutOfService,
            "close" => Action::Close,
            "resolve" => Action::Resolve,
            "start_work" => Action::StartWork,
            "submit_for_review" => Action::SubmitForReview,
            "reassign" => Action::Reassign,
            "set_pending" => Action::SetPending,
            "reject" => Action::Reject,
            "accept" => Action::Accept,
            "edit_description" => Action::EditDescription {
                description: description.ok_or_else(|| {
                    ServerError::InvalidRequest("edit_description requires description".into())
                })?,
            },
            other => {
                return Err(ServerError::InvalidRequest(format!("unknown action '{}'", other)))
            }
        };
        Ok(action)
    }

    pub fn name(&self) -> &'static str {
        match self {
            Action::Assign { .. } => "assign",
            Action::Escalate => "escalate",
            Action::MarkOutOfService => "mark_out_of_service",
            Action::Close => "close",
            Action::Resolve => "resolve",
            Action::StartWork => "start_work",
            Action::SubmitForReview => "submit_for_review",
            Action::Reassign => "reassign",
            Action::SetPending => "set_pending",
            Action::Reject => "reject",
            Action::Accept => "accept",
            Action::EditDescription { .. } => "edit_description",
        }
    }

    pub fn rule(&self) -> Rule {
        use AuditAction as A;
        use Scope::*;
        use TicketStatus::*;

        let side_exit = |to: TicketStatus| TicketStatus::non_terminal_except(to);
        let (scope, from, to, audit) = match self {
            Action::Assign { .. } => (Moderator, vec![Open], Some(Assigned), A::Assign),
            Action::Escalate => (
                Moderator,
                side_exit(EscalatedUpper),
                Some(EscalatedUpper),
                A::StatusChange,
            ),
            Action::MarkOutOfService => (
                Moderator,
                side_exit(OutOfService),
                Some(OutOfService),
                A::StatusChange,
            ),
            Action::Close => (Moderator, side_exit(Closed), Some(Closed), A::StatusChange),
            Action::Resolve => (Moderator, vec![Review], Some(Resolved), A::StatusChange),
            Action::StartWork => (Assignee, vec![Assigned, Pending], Some(Working), A::Working),
            Action::SubmitForReview => (Assignee, vec![Working], Some(Review), A::Resolve),
            Action::Reassign => (Assignee, vec![Assigned, Working], Some(Open), A::Reassign),
            Action::SetPending => (Assignee, vec![Assigned, Working], Some(Pending), A::Pending),
            Action::Reject => (Reporter, vec![Review, Resolved], Some(Open), A::Reopen),
            Action::Accept => (Reporter, vec![Review, Resolved], Some(Closed), A::StatusChange),
            Action::EditDescription { .. } => (Reporter, vec![Open], None, A::Update),
        };

        Rule { scope, from, to, audit }
    }

    fn assignee_change(&self) -> AssigneeChange {
        match self {
            Action::Assign { staff_id } => AssigneeChange::Set(*staff_id),
            Action::Reassign | Action::Reject => AssigneeChange::Clear,
            _ => AssigneeChange::Keep,
        }
    }

    fn detail(&self) -> String {
        match self {
            Action::Assign { staff_id } => format!("assigned to staff {}", staff_id),
            Action::Escalate => "escalated to upper level support".to_string(),
            Action::MarkOutOfService => "marked out of service / outsource requirement".to_string(),
            Action::Close => "closed by moderator".to_string(),
            Action::Resolve => "marked resolved after review".to_string(),
            Action::StartWork => "work started".to_string(),
            Action::SubmitForReview => "submitted for review".to_string(),
            Action::Reassign => "returned for reassignment".to_string(),
            Action::SetPending => "set pending".to_string(),
            Action::Reject => "rejected by reporter, reopened".to_string(),
            Action::Accept => "accepted by reporter".to_string(),
            Action::EditDescription { .. } => "description updated by reporter".to_string(),
        }
    }

    /// One instance of every action, used to list what a caller may do
    pub fn catalog() -> Vec<Action> {
        vec![
            Action::Assign { staff_id: 0 },
            Action::Escalate,
            Action::MarkOutOfService,
            Action::Close,
            Action::Resolve,
            Action::StartWork,
            Action::SubmitForReview,
            Action::Reassign,
            Action::SetPending,
            Action::Reject,
            Action::Accept,
            Action::EditDescription { description: String::new() },
        ]
    }
}

/// An accepted, not yet written, transition
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Transition {
    pub action: &'static str,
    pub from: TicketStatus,
    pub to: TicketStatus,
    pub assignee: AssigneeChange,
    pub description: Option<String>,
    pub audit: AuditAction,
    pub detail: String,
}

/// Role gate, checked before the ticket is loaded so that a caller without
/// the role learns nothing about which tickets exist.
pub fn check_role(actor: &Actor, action: &Action) -> Result<()> {
    if actor.role == action.rule().scope.role() {
        Ok(())
    } else {
        Err(ServerError::Unauthorized)
    }
}

/// Validate `action` against the caller and the ticket as loaded
pub fn plan(actor: &Actor, ticket: &ticket::Model, action: &Action) -> Result<Transition> {
    check_role(actor, action)?;

    let rule = action.rule();
    let related = match rule.scope {
        Scope::Moderator => true,
        Scope::Assignee => ticket.assignee_id == Some(actor.id),
        Scope::Reporter => ticket.reporter_id == actor.id,
    };
    if !related {
        return Err(ServerError::Unauthorized);
    }

    if !rule.from.contains(&ticket.status) {
        return Err(ServerError::InvalidTransition {
            action: action.name(),
            current: ticket.status,
            required: rule.from,
        });
    }

    let to = rule.to.unwrap_or(ticket.status);
    let description = match action {
        Action::EditDescription { description } => Some(description.trim().to_string()),
        _ => None,
    };

    Ok(Transition {
        action: action.name(),
        from: ticket.status,
        to,
        assignee: action.assignee_change(),
        description,
        audit: rule.audit,
        detail: format!("{} ({} -> {})", action.detail(), ticket.status, to),
    })
}

/// Names of the actions `actor` could perform on `ticket` right now
pub fn available_actions(actor: &Actor, ticket: &ticket::Model) -> Vec<&'static str> {
    Action::catalog()
        .iter()
        .filter(|action| plan(actor, ticket, action).is_ok())
        .map(|action| action.name())
        .collect()
}

/// Moderators and the current assignee may edit the ticket messages until
/// the ticket is closed.
pub fn check_message_edit(actor: &Actor, ticket: &ticket::Model) -> Result<()> {
    let allowed = match actor.role {
        Role::Mod => true,
        Role::Staff => ticket.assignee_id == Some(actor.id),
        Role::User | Role::Admin => false,
    };
    if !allowed {
        return Err(ServerError::Unauthorized);
    }
    if ticket.status.is_terminal() {
        return Err(ServerError::InvalidTransition {
            action: "edit_messages",
            current: ticket.status,
            required: TicketStatus::non_terminal_except(TicketStatus::Closed),
        });
    }
    Ok(())
}

/// Users see what they reported, staff what is assigned to them, moderators
/// and admins everything.
pub fn can_view(actor: &Actor, ticket: &ticket::Model) -> bool {
    match actor.role {
        Role::User => ticket.reporter_id == actor.id,
        Role::Staff => ticket.assignee_id == Some(actor.id),
        Role::Mod | Role::Admin => true,
    }
}
