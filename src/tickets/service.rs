//! Ticket lifecycle engine.
//!
//! Every accepted change is one transaction: a guarded update of the ticket
//! row followed by its history records. The guard matches the status and
//! version that were checked, so a change that raced with another one
//! affects no row and is reported as a conflict.

use std::collections::HashMap;
use std::sync::Arc;

use rand::Rng;
use sea_orm::sea_query::Expr;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, DatabaseConnection, EntityTrait, QueryFilter, Set,
    TransactionTrait,
};
use serde::{Deserialize, Serialize};

use super::assignment::{AssignmentPolicy, CandidateList, ANY_CATEGORY};
use super::audit::{self, AuditAction, HistoryEntry};
use super::machine::{self, Action, Actor, AssigneeChange, Transition};
use super::query::{self, TicketFilter};
use super::status::TicketStatus;
use crate::db::entities::account::{self, Role};
use crate::db::entities::{
    ticket, ticket_type, urgency_level, Account, Ticket, TicketType, UrgencyLevel,
};
use crate::db::now_secs;
use crate::error::{Result, ServerError};

/// Largest caller-visible ticket number
pub const MAX_TICKET_ID: i64 = 9_999_999_999;
pub const MAX_TITLE_CHARS: usize = 200;
const ID_ATTEMPTS: usize = 16;

/// Body of `POST /api/tickets`
#[derive(Clone, Debug, Deserialize)]
pub struct NewTicket {
    pub title: String,
    #[serde(default)]
    pub description: String,
    pub category: String,
    pub urgency: String,
}

/// Body of `POST /api/tickets/:id/actions`
#[derive(Clone, Debug, Default, Deserialize)]
pub struct ActionBody {
    pub action: Option<String>,
    /// Target of `assign`
    pub staff_id: Option<i32>,
    /// New text for `edit_description`
    pub description: Option<String>,
    pub client_message: Option<String>,
    pub internal_message: Option<String>,
}

impl ActionBody {
    pub fn into_request(self) -> Result<ChangeRequest> {
        let action = match self.action.as_deref().map(str::trim).filter(|a| !a.is_empty()) {
            Some(name) => Some(Action::parse(name, self.staff_id, self.description)?),
            None => None,
        };
        Ok(ChangeRequest {
            action,
            client_message: self.client_message,
            internal_message: self.internal_message,
        })
    }
}

/// A lifecycle action and message edits, applied together or not at all
#[derive(Clone, Debug, Default)]
pub struct ChangeRequest {
    pub action: Option<Action>,
    pub client_message: Option<String>,
    pub internal_message: Option<String>,
}

/// Returned for every accepted request
#[derive(Clone, Debug, Serialize)]
pub struct Outcome {
    pub accepted: bool,
    pub ticket_id: i64,
    pub new_status: TicketStatus,
    /// False when nothing needed to be written
    pub changed: bool,
    pub version: i32,
}

impl Outcome {
    fn unchanged(ticket: &ticket::Model) -> Self {
        Self {
            accepted: true,
            ticket_id: ticket.id,
            new_status: ticket.status,
            changed: false,
            version: ticket.version,
        }
    }
}

/// Message fields that differ from the stored ticket
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct MessageChange {
    pub client_message: Option<String>,
    pub internal_message: Option<String>,
}

impl MessageChange {
    pub fn between(ticket: &ticket::Model, client: Option<&str>, internal: Option<&str>) -> Self {
        Self {
            client_message: client
                .filter(|m| *m != ticket.client_message)
                .map(str::to_string),
            internal_message: internal
                .filter(|m| *m != ticket.internal_message)
                .map(str::to_string),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.client_message.is_none() && self.internal_message.is_none()
    }

    fn detail(&self) -> String {
        let mut fields = Vec::new();
        if self.client_message.is_some() {
            fields.push("client message");
        }
        if self.internal_message.is_some() {
            fields.push("internal message");
        }
        format!("{} updated", fields.join(" and "))
    }
}

/// A ticket as shown to one caller
#[derive(Clone, Debug, Serialize)]
pub struct TicketView {
    pub id: i64,
    pub title: String,
    pub description: String,
    pub category: String,
    pub urgency: String,
    pub status: TicketStatus,
    pub client_message: String,
    /// Hidden from reporters
    #[serde(skip_serializing_if = "Option::is_none")]
    pub internal_message: Option<String>,
    pub reporter_id: i32,
    pub reporter: Option<String>,
    pub assignee_id: Option<i32>,
    pub assignee: Option<String>,
    pub version: i32,
    pub created_at: i64,
    pub updated_at: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub allowed_actions: Option<Vec<&'static str>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub can_edit_messages: Option<bool>,
}

pub struct TicketService {
    db: Arc<DatabaseConnection>,
    policy: AssignmentPolicy,
}

impl TicketService {
    pub fn new(db: Arc<DatabaseConnection>, policy: AssignmentPolicy) -> Self {
        Self { db, policy }
    }

    pub fn db(&self) -> &DatabaseConnection {
        &self.db
    }

    pub fn policy(&self) -> &AssignmentPolicy {
        &self.policy
    }

    /// File a new ticket. Only users report tickets.
    pub async fn create_ticket(&self, actor: &Actor, new: NewTicket) -> Result<ticket::Model> {
        if actor.role != Role::User {
            return Err(ServerError::Unauthorized);
        }

        let title = new.title.trim();
        if title.is_empty() || title.chars().count() > MAX_TITLE_CHARS {
            return Err(ServerError::InvalidRequest(format!(
                "title must be 1 to {} characters",
                MAX_TITLE_CHARS
            )));
        }
        let category = self.resolve_category(&new.category).await?;
        let urgency = self.resolve_urgency(&new.urgency).await?;

        let txn = self.db.begin().await?;

        let mut id = None;
        for _ in 0..ID_ATTEMPTS {
            let candidate = rand::thread_rng().gen_range(1..=MAX_TICKET_ID);
            if Ticket::find_by_id(candidate).one(&txn).await?.is_none() {
                id = Some(candidate);
                break;
            }
        }
        let id = id.ok_or_else(|| ServerError::Internal("could not allocate a ticket id".into()))?;

        let now = now_secs();
        let created = ticket::ActiveModel {
            id: Set(id),
            title: Set(title.to_string()),
            description: Set(new.description.trim().to_string()),
            category: Set(category),
            urgency: Set(urgency),
            client_message: Set(String::new()),
            internal_message: Set(String::new()),
            status: Set(TicketStatus::Open),
            reporter_id: Set(actor.id),
            assignee_id: Set(None),
            version: Set(0),
            created_at: Set(now),
            updated_at: Set(now),
        }
        .insert(&txn)
        .await?;

        audit::record(&txn, id, AuditAction::Create, actor.id, "ticket created", now).await?;
        txn.commit().await?;

        tracing::info!("Ticket {} created by account {}", id, actor.id);
        Ok(created)
    }

    async fn resolve_category(&self, raw: &str) -> Result<String> {
        let raw = raw.trim();
        if raw.eq_ignore_ascii_case(ANY_CATEGORY[0]) {
            return Ok(ANY_CATEGORY[0].to_string());
        }
        TicketType::find()
            .all(self.db())
            .await?
            .into_iter()
            .find(|t| t.name.eq_ignore_ascii_case(raw))
            .map(|t: ticket_type::Model| t.name)
            .ok_or_else(|| ServerError::InvalidRequest(format!("unknown ticket type '{}'", raw)))
    }

    async fn resolve_urgency(&self, raw: &str) -> Result<String> {
        let raw = raw.trim();
        UrgencyLevel::find()
            .all(self.db())
            .await?
            .into_iter()
            .find(|u| u.name.eq_ignore_ascii_case(raw))
            .map(|u: urgency_level::Model| u.name)
            .ok_or_else(|| ServerError::InvalidRequest(format!("unknown urgency level '{}'", raw)))
    }

    /// Load a ticket regardless of who asks
    pub async fn load(&self, id: i64) -> Result<ticket::Model> {
        Ticket::find_by_id(id)
            .one(self.db())
            .await?
            .ok_or_else(|| ServerError::NotFound(format!("Ticket {}", id)))
    }

    /// Load a ticket the caller may see; anything else is not found
    pub async fn load_visible(&self, actor: &Actor, id: i64) -> Result<ticket::Model> {
        let ticket = self.load(id).await?;
        if machine::can_view(actor, &ticket) {
            Ok(ticket)
        } else {
            Err(ServerError::NotFound(format!("Ticket {}", id)))
        }
    }

    /// Detail view with the actions open to the caller
    pub async fn ticket_detail(&self, actor: &Actor, id: i64) -> Result<TicketView> {
        let ticket = self.load_visible(actor, id).await?;
        let allowed = machine::available_actions(actor, &ticket);
        let can_edit = machine::check_message_edit(actor, &ticket).is_ok();

        let mut view = self
            .views(actor, vec![ticket])
            .await?
            .pop()
            .ok_or_else(|| ServerError::Internal("empty ticket view".into()))?;
        view.allowed_actions = Some(allowed);
        view.can_edit_messages = Some(can_edit);
        Ok(view)
    }

    /// Role-scoped ticket list
    pub async fn list(&self, actor: &Actor, filter: &TicketFilter) -> Result<Vec<TicketView>> {
        let tickets = query::list_tickets(self.db(), actor, filter).await?;
        self.views(actor, tickets).await
    }

    /// Attach account names and hide what the caller must not see
    pub async fn views(
        &self,
        actor: &Actor,
        tickets: Vec<ticket::Model>,
    ) -> Result<Vec<TicketView>> {
        let mut ids: Vec<i32> = tickets
            .iter()
            .flat_map(|t| std::iter::once(t.reporter_id).chain(t.assignee_id))
            .collect();
        ids.sort_unstable();
        ids.dedup();

        let names: HashMap<i32, String> = Account::find()
            .filter(account::Column::Id.is_in(ids))
            .all(self.db())
            .await?
            .into_iter()
            .map(|a| (a.id, a.username))
            .collect();

        let show_internal = actor.role != Role::User;
        Ok(tickets
            .into_iter()
            .map(|t| TicketView {
                reporter: names.get(&t.reporter_id).cloned(),
                assignee: t.assignee_id.and_then(|id| names.get(&id).cloned()),
                id: t.id,
                title: t.title,
                description: t.description,
                category: t.category,
                urgency: t.urgency,
                status: t.status,
                client_message: t.client_message,
                internal_message: show_internal.then_some(t.internal_message),
                reporter_id: t.reporter_id,
                assignee_id: t.assignee_id,
                version: t.version,
                created_at: t.created_at,
                updated_at: t.updated_at,
                allowed_actions: None,
                can_edit_messages: None,
            })
            .collect())
    }

    /// Assignment candidates for a ticket, moderators only
    pub async fn candidates(&self, actor: &Actor, id: i64) -> Result<CandidateList> {
        if actor.role != Role::Mod {
            return Err(ServerError::Unauthorized);
        }
        let ticket = self.load(id).await?;
        self.policy.candidates(self.db(), &ticket.category).await
    }

    /// History of one ticket, for anyone who may see it
    pub async fn history(&self, actor: &Actor, id: i64) -> Result<Vec<HistoryEntry>> {
        self.load_visible(actor, id).await?;
        audit::ticket_history(self.db(), id).await
    }

    /// Apply a lifecycle action and/or message edits
    pub async fn perform(
        &self,
        actor: &Actor,
        id: i64,
        request: ChangeRequest,
    ) -> Result<Outcome> {
        let edits_messages =
            request.client_message.is_some() || request.internal_message.is_some();
        if request.action.is_none() && !edits_messages {
            let ticket = self.load_visible(actor, id).await?;
            return Ok(Outcome::unchanged(&ticket));
        }

        // Role gates run before the ticket is read
        if let Some(action) = &request.action {
            machine::check_role(actor, action)?;
        }
        if edits_messages && !matches!(actor.role, Role::Mod | Role::Staff) {
            return Err(ServerError::Unauthorized);
        }

        let ticket = self.load(id).await?;

        let transition = match &request.action {
            Some(action) => {
                let transition = machine::plan(actor, &ticket, action)?;
                if let Action::Assign { staff_id } = action {
                    self.check_assignable(*staff_id).await?;
                }
                Some(transition)
            }
            None => None,
        };

        let messages = if edits_messages {
            machine::check_message_edit(actor, &ticket)?;
            MessageChange::between(
                &ticket,
                request.client_message.as_deref(),
                request.internal_message.as_deref(),
            )
        } else {
            MessageChange::default()
        };

        if transition.is_none() && messages.is_empty() {
            tracing::debug!("Ticket {}: message edit by {} changed nothing", id, actor.id);
            return Ok(Outcome::unchanged(&ticket));
        }

        let updated = self.commit(actor, &ticket, transition.as_ref(), &messages).await?;
        Ok(Outcome {
            accepted: true,
            ticket_id: id,
            new_status: updated.status,
            changed: true,
            version: updated.version,
        })
    }

    async fn check_assignable(&self, staff_id: i32) -> Result<()> {
        let staff = Account::find_by_id(staff_id).one(self.db()).await?;
        match staff {
            Some(s) if s.role == Role::Staff && !s.is_banned => Ok(()),
            _ => Err(ServerError::InvalidRequest(format!(
                "account {} is not an active staff account",
                staff_id
            ))),
        }
    }

    /// Write a checked change against the `snapshot` it was checked on
    pub(crate) async fn commit(
        &self,
        actor: &Actor,
        snapshot: &ticket::Model,
        transition: Option<&Transition>,
        messages: &MessageChange,
    ) -> Result<ticket::Model> {
        let mut updated = snapshot.clone();
        updated.updated_at = now_secs().max(snapshot.updated_at);
        updated.version = snapshot.version + 1;
        if let Some(t) = transition {
            updated.status = t.to;
            match t.assignee {
                AssigneeChange::Keep => {}
                AssigneeChange::Set(id) => updated.assignee_id = Some(id),
                AssigneeChange::Clear => updated.assignee_id = None,
            }
            if let Some(description) = &t.description {
                updated.description = description.clone();
            }
        }
        if let Some(m) = &messages.client_message {
            updated.client_message = m.clone();
        }
        if let Some(m) = &messages.internal_message {
            updated.internal_message = m.clone();
        }

        let txn = self.db.begin().await?;

        let result = Ticket::update_many()
            .col_expr(ticket::Column::Status, Expr::value(updated.status))
            .col_expr(ticket::Column::AssigneeId, Expr::value(updated.assignee_id))
            .col_expr(ticket::Column::Description, Expr::value(updated.description.clone()))
            .col_expr(ticket::Column::ClientMessage, Expr::value(updated.client_message.clone()))
            .col_expr(
                ticket::Column::InternalMessage,
                Expr::value(updated.internal_message.clone()),
            )
            .col_expr(ticket::Column::Version, Expr::value(updated.version))
            .col_expr(ticket::Column::UpdatedAt, Expr::value(updated.updated_at))
            .filter(ticket::Column::Id.eq(snapshot.id))
            .filter(ticket::Column::Status.eq(snapshot.status))
            .filter(ticket::Column::Version.eq(snapshot.version))
            .exec(&txn)
            .await?;

        if result.rows_affected == 0 {
            txn.rollback().await?;
            tracing::debug!(
                "Ticket {}: change by {} lost a race at version {}",
                snapshot.id,
                actor.id,
                snapshot.version
            );
            return Err(ServerError::Conflict);
        }

        if !messages.is_empty() {
            audit::record(
                &txn,
                snapshot.id,
                AuditAction::MessageUpdate,
                actor.id,
                &messages.detail(),
                updated.updated_at,
            )
            .await?;
        }
        if let Some(t) = transition {
            let at = updated.updated_at;
            audit::record(&txn, snapshot.id, t.audit, actor.id, &t.detail, at).await?;
        }

        txn.commit().await?;

        match transition {
            Some(t) => tracing::info!(
                "Ticket {}: {} by {} ({} -> {})",
                snapshot.id,
                t.action,
                actor.id,
                t.from,
                t.to
            ),
            None => tracing::info!("Ticket {}: messages updated by {}", snapshot.id, actor.id),
        }

        Ok(updated)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::entities::{audit_record, AuditRecord};
    use crate::db::init_database;
    use crate::tickets::testutil::account;
    use sea_orm::{ConnectionTrait, PaginatorTrait, QueryOrder, Statement};
    use tempfile::TempDir;

    struct Desk {
        _dir: TempDir,
        service: TicketService,
        reporter: Actor,
        moderator: Actor,
        staff7: Actor,
        staff9: Actor,
    }

    async fn desk() -> Desk {
        let dir = TempDir::new().unwrap();
        let db = init_database(&dir.path().join("desk.db")).await.unwrap();
        let reporter = account(&db, "alice", Role::User).await;
        let moderator = account(&db, "moddy", Role::Mod).await;
        let staff7 = account(&db, "seven", Role::Staff).await;
        let staff9 = account(&db, "nine", Role::Staff).await;
        Desk {
            _dir: dir,
            service: TicketService::new(Arc::new(db), AssignmentPolicy::default()),
            reporter: Actor::new(reporter.id, Role::User),
            moderator: Actor::new(moderator.id, Role::Mod),
            staff7: Actor::new(staff7.id, Role::Staff),
            staff9: Actor::new(staff9.id, Role::Staff),
        }
    }

    fn new_ticket() -> NewTicket {
        NewTicket {
            title: "Laptop will not boot".into(),
            description: "Black screen after the update".into(),
            category: "hardware".into(),
            urgency: "high".into(),
        }
    }

    fn act(action: Action) -> ChangeRequest {
        ChangeRequest {
            action: Some(action),
            ..Default::default()
        }
    }

    async fn history_actions(desk: &Desk, id: i64) -> Vec<AuditAction> {
        AuditRecord::find()
            .filter(audit_record::Column::TicketId.eq(id))
            .order_by_asc(audit_record::Column::Id)
            .all(desk.service.db())
            .await
            .unwrap()
            .into_iter()
            .map(|r| r.action)
            .collect()
    }

    #[test]
    fn test_action_body_parsing() {
        let body: ActionBody = serde_json::from_str(r#"{"action":"assign","staff_id":7}"#).unwrap();
        let request = body.into_request().unwrap();
        assert_eq!(request.action, Some(Action::Assign { staff_id: 7 }));

        let body: ActionBody = serde_json::from_str(r#"{"client_message":"hi"}"#).unwrap();
        let request = body.into_request().unwrap();
        assert_eq!(request.action, None);
        assert_eq!(request.client_message.as_deref(), Some("hi"));

        let body: ActionBody = serde_json::from_str(r#"{"action":"assign"}"#).unwrap();
        assert!(matches!(body.into_request(), Err(ServerError::InvalidRequest(_))));
        let body: ActionBody = serde_json::from_str(r#"{"action":"teleport"}"#).unwrap();
        assert!(matches!(body.into_request(), Err(ServerError::InvalidRequest(_))));
    }

    #[tokio::test]
    async fn test_create_ticket() {
        let desk = desk().await;
        let t = desk.service.create_ticket(&desk.reporter, new_ticket()).await.unwrap();
        assert_eq!(t.status, TicketStatus::Open);
        assert_eq!(t.assignee_id, None);
        assert_eq!(t.category, "Hardware");
        assert_eq!(t.urgency, "High");
        assert!((1..=MAX_TICKET_ID).contains(&t.id));
        assert_eq!(history_actions(&desk, t.id).await, vec![AuditAction::Create]);

        let undecided = NewTicket {
            category: "Undecided".into(),
            ..new_ticket()
        };
        let t = desk.service.create_ticket(&desk.reporter, undecided).await.unwrap();
        assert_eq!(t.category, "undecided");
    }

    #[tokio::test]
    async fn test_create_ticket_validation() {
        let desk = desk().await;
        let err = desk.service.create_ticket(&desk.moderator, new_ticket()).await.unwrap_err();
        assert!(matches!(err, ServerError::Unauthorized));

        let blank = NewTicket {
            title: "   ".into(),
            ..new_ticket()
        };
        let too_long = NewTicket {
            title: "x".repeat(201),
            ..new_ticket()
        };
        let plumbing = NewTicket {
            category: "Plumbing".into(),
            ..new_ticket()
        };
        let whenever = NewTicket {
            urgency: "Whenever".into(),
            ..new_ticket()
        };
        for bad in [blank, too_long, plumbing, whenever] {
            let err = desk.service.create_ticket(&desk.reporter, bad).await.unwrap_err();
            assert!(matches!(err, ServerError::InvalidRequest(_)));
        }
    }

    #[tokio::test]
    async fn test_assign_then_work_then_reject() {
        let desk = desk().await;
        let t = desk.service.create_ticket(&desk.reporter, new_ticket()).await.unwrap();
        let s = &desk.service;

        let out = s
            .perform(&desk.moderator, t.id, act(Action::Assign { staff_id: desk.staff7.id }))
            .await
            .unwrap();
        assert_eq!(out.new_status, TicketStatus::Assigned);
        let loaded = s.load(t.id).await.unwrap();
        assert_eq!(loaded.assignee_id, Some(desk.staff7.id));
        assert_eq!(loaded.version, 1);
        assert_eq!(history_actions(&desk, t.id).await[1..], [AuditAction::Assign]);

        s.perform(&desk.staff7, t.id, act(Action::StartWork)).await.unwrap();
        s.perform(&desk.staff7, t.id, act(Action::SubmitForReview)).await.unwrap();
        let out = s.perform(&desk.reporter, t.id, act(Action::Reject)).await.unwrap();
        assert_eq!(out.new_status, TicketStatus::Open);

        let loaded = s.load(t.id).await.unwrap();
        assert_eq!(loaded.assignee_id, None);
        assert!(loaded.updated_at >= t.updated_at);
        assert_eq!(loaded.created_at, t.created_at);
        assert_eq!(
            history_actions(&desk, t.id).await[2..],
            [AuditAction::Working, AuditAction::Resolve, AuditAction::Reopen]
        );
    }

    #[tokio::test]
    async fn test_assign_closed_ticket_changes_nothing() {
        let desk = desk().await;
        let t = desk.service.create_ticket(&desk.reporter, new_ticket()).await.unwrap();
        let s = &desk.service;
        s.perform(&desk.moderator, t.id, act(Action::Close)).await.unwrap();
        let before = s.load(t.id).await.unwrap();
        let audit_before = history_actions(&desk, t.id).await.len();

        let err = s
            .perform(&desk.moderator, t.id, act(Action::Assign { staff_id: desk.staff9.id }))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ServerError::InvalidTransition { current: TicketStatus::Closed, .. }
        ));
        assert_eq!(s.load(t.id).await.unwrap(), before);
        assert_eq!(history_actions(&desk, t.id).await.len(), audit_before);
    }

    #[tokio::test]
    async fn test_rejections_write_nothing() {
        let desk = desk().await;
        let t = desk.service.create_ticket(&desk.reporter, new_ticket()).await.unwrap();
        let s = &desk.service;
        s.perform(&desk.moderator, t.id, act(Action::Assign { staff_id: desk.staff7.id }))
            .await
            .unwrap();
        let before = s.load(t.id).await.unwrap();

        let err = s.perform(&desk.staff9, t.id, act(Action::StartWork)).await.unwrap_err();
        assert!(matches!(err, ServerError::Unauthorized));
        let err = s.perform(&desk.reporter, t.id, act(Action::Accept)).await.unwrap_err();
        assert!(matches!(err, ServerError::InvalidTransition { .. }));
        let err = s.perform(&desk.staff7, t.id, act(Action::SubmitForReview)).await.unwrap_err();
        assert!(matches!(err, ServerError::InvalidTransition { .. }));
        let err = s.perform(&desk.reporter, 12, act(Action::Accept)).await.unwrap_err();
        assert!(matches!(err, ServerError::NotFound(_)));

        assert_eq!(s.load(t.id).await.unwrap(), before);
        assert_eq!(history_actions(&desk, t.id).await.len(), 2);
    }

    #[tokio::test]
    async fn test_assign_requires_active_staff() {
        let desk = desk().await;
        let t = desk.service.create_ticket(&desk.reporter, new_ticket()).await.unwrap();
        let err = desk
            .service
            .perform(&desk.moderator, t.id, act(Action::Assign { staff_id: desk.reporter.id }))
            .await
            .unwrap_err();
        assert!(matches!(err, ServerError::InvalidRequest(_)));
        assert_eq!(desk.service.load(t.id).await.unwrap().status, TicketStatus::Open);
    }

    #[tokio::test]
    async fn test_message_edits_audit_only_changes() {
        let desk = desk().await;
        let t = desk.service.create_ticket(&desk.reporter, new_ticket()).await.unwrap();
        let s = &desk.service;
        s.perform(&desk.moderator, t.id, act(Action::Assign { staff_id: desk.staff7.id }))
            .await
            .unwrap();

        let edit = ChangeRequest {
            client_message: Some("We ordered a new disk".into()),
            ..Default::default()
        };
        let out = s.perform(&desk.staff7, t.id, edit.clone()).await.unwrap();
        assert!(out.changed);

        // Same text again is accepted without a write
        let out = s.perform(&desk.staff7, t.id, edit).await.unwrap();
        assert!(!out.changed);
        assert_eq!(
            history_actions(&desk, t.id).await[1..],
            [AuditAction::Assign, AuditAction::MessageUpdate]
        );

        // Reporters cannot edit messages
        let err = s
            .perform(
                &desk.reporter,
                t.id,
                ChangeRequest {
                    internal_message: Some("hi".into()),
                    ..Default::default()
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ServerError::Unauthorized));

        // Edit plus action in one request
        let both = ChangeRequest {
            action: Some(Action::StartWork),
            internal_message: Some("Disk arrives Monday".into()),
            client_message: None,
        };
        let out = s.perform(&desk.staff7, t.id, both).await.unwrap();
        assert_eq!(out.new_status, TicketStatus::Working);
        let loaded = s.load(t.id).await.unwrap();
        assert_eq!(loaded.internal_message, "Disk arrives Monday");
        assert_eq!(loaded.client_message, "We ordered a new disk");
        assert_eq!(
            history_actions(&desk, t.id).await[3..],
            [AuditAction::MessageUpdate, AuditAction::Working]
        );
    }

    #[tokio::test]
    async fn test_failed_action_discards_message_edit() {
        let desk = desk().await;
        let t = desk.service.create_ticket(&desk.reporter, new_ticket()).await.unwrap();
        let request = ChangeRequest {
            action: Some(Action::Resolve),
            client_message: Some("done".into()),
            internal_message: None,
        };
        let err = desk.service.perform(&desk.moderator, t.id, request).await.unwrap_err();
        assert!(matches!(err, ServerError::InvalidTransition { .. }));
        assert_eq!(desk.service.load(t.id).await.unwrap().client_message, "");
    }

    #[tokio::test]
    async fn test_stale_snapshot_is_a_conflict() {
        let desk = desk().await;
        let t = desk.service.create_ticket(&desk.reporter, new_ticket()).await.unwrap();
        let s = &desk.service;
        s.perform(&desk.moderator, t.id, act(Action::Assign { staff_id: desk.staff7.id }))
            .await
            .unwrap();

        let snapshot = s.load(t.id).await.unwrap();
        let transition = machine::plan(&desk.staff7, &snapshot, &Action::StartWork).unwrap();
        s.commit(&desk.staff7, &snapshot, Some(&transition), &MessageChange::default())
            .await
            .unwrap();

        let err = s
            .commit(&desk.staff7, &snapshot, Some(&transition), &MessageChange::default())
            .await
            .unwrap_err();
        assert!(matches!(err, ServerError::Conflict));
        assert_eq!(
            history_actions(&desk, t.id).await[1..],
            [AuditAction::Assign, AuditAction::Working]
        );
    }

    #[tokio::test]
    async fn test_concurrent_start_work_succeeds_once() {
        let desk = desk().await;
        let t = desk.service.create_ticket(&desk.reporter, new_ticket()).await.unwrap();
        let s = &desk.service;
        s.perform(&desk.moderator, t.id, act(Action::Assign { staff_id: desk.staff7.id }))
            .await
            .unwrap();

        let (a, b) = tokio::join!(
            s.perform(&desk.staff7, t.id, act(Action::StartWork)),
            s.perform(&desk.staff7, t.id, act(Action::StartWork)),
        );
        assert_eq!([a.is_ok(), b.is_ok()].iter().filter(|ok| **ok).count(), 1);

        assert_eq!(s.load(t.id).await.unwrap().status, TicketStatus::Working);
        let working = AuditRecord::find()
            .filter(audit_record::Column::TicketId.eq(t.id))
            .filter(audit_record::Column::Action.eq(AuditAction::Working))
            .count(s.db())
            .await
            .unwrap();
        assert_eq!(working, 1);
    }

    #[tokio::test]
    async fn test_visibility_and_detail() {
        let desk = desk().await;
        let t = desk.service.create_ticket(&desk.reporter, new_ticket()).await.unwrap();
        let s = &desk.service;

        let err = s.ticket_detail(&desk.staff7, t.id).await.unwrap_err();
        assert!(matches!(err, ServerError::NotFound(_)));

        let view = s.ticket_detail(&desk.reporter, t.id).await.unwrap();
        assert_eq!(view.allowed_actions, Some(vec!["edit_description"]));
        assert_eq!(view.internal_message, None);
        assert_eq!(view.reporter.as_deref(), Some("alice"));

        s.perform(&desk.moderator, t.id, act(Action::Assign { staff_id: desk.staff7.id }))
            .await
            .unwrap();
        let view = s.ticket_detail(&desk.staff7, t.id).await.unwrap();
        assert_eq!(view.assignee.as_deref(), Some("seven"));
        assert_eq!(view.can_edit_messages, Some(true));
        assert!(view.internal_message.is_some());

        let history = s.history(&desk.staff7, t.id).await.unwrap();
        assert_eq!(history.len(), 2);
        assert!(s.history(&desk.staff9, t.id).await.is_err());
    }

    #[tokio::test]
    async fn test_edit_description_and_list() {
        let desk = desk().await;
        let s = &desk.service;
        let t = s.create_ticket(&desk.reporter, new_ticket()).await.unwrap();
        s.create_ticket(
            &desk.reporter,
            NewTicket {
                title: "VPN drops".into(),
                category: "Network".into(),
                ..new_ticket()
            },
        )
        .await
        .unwrap();

        s.perform(
            &desk.reporter,
            t.id,
            act(Action::EditDescription {
                description: " Also beeps twice ".into(),
            }),
        )
        .await
        .unwrap();
        assert_eq!(s.load(t.id).await.unwrap().description, "Also beeps twice");

        let mine = s.list(&desk.reporter, &TicketFilter::default()).await.unwrap();
        assert_eq!(mine.len(), 2);
        assert!(mine.iter().all(|v| v.reporter.as_deref() == Some("alice")));

        let network = s
            .list(
                &desk.moderator,
                &TicketFilter {
                    category: Some("network".into()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(network.len(), 1);

        let search = s
            .list(
                &desk.moderator,
                &TicketFilter {
                    search: Some("alic".into()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(search.len(), 2);

        assert!(s.list(&desk.staff7, &TicketFilter::default()).await.unwrap().is_empty());

        let bad = s
            .list(
                &desk.moderator,
                &TicketFilter {
                    status: Some("sleeping".into()),
                    ..Default::default()
                },
            )
            .await;
        assert!(matches!(bad, Err(ServerError::InvalidRequest(_))));
    }

    #[tokio::test]
    async fn test_pending_and_back_to_work() {
        let desk = desk().await;
        let t = desk.service.create_ticket(&desk.reporter, new_ticket()).await.unwrap();
        let s = &desk.service;
        s.perform(&desk.moderator, t.id, act(Action::Assign { staff_id: desk.staff7.id }))
            .await
            .unwrap();

        s.perform(&desk.staff7, t.id, act(Action::StartWork)).await.unwrap();
        let out = s.perform(&desk.staff7, t.id, act(Action::SetPending)).await.unwrap();
        assert_eq!(out.new_status, TicketStatus::Pending);
        let out = s.perform(&desk.staff7, t.id, act(Action::StartWork)).await.unwrap();
        assert_eq!(out.new_status, TicketStatus::Working);
        assert_eq!(out.version, 4);

        // Staff cannot park a ticket that is already parked
        s.perform(&desk.staff7, t.id, act(Action::SetPending)).await.unwrap();
        let err = s.perform(&desk.staff7, t.id, act(Action::SetPending)).await.unwrap_err();
        assert!(matches!(
            err,
            ServerError::InvalidTransition { current: TicketStatus::Pending, .. }
        ));

        assert_eq!(
            history_actions(&desk, t.id).await[2..],
            [
                AuditAction::Working,
                AuditAction::Pending,
                AuditAction::Working,
                AuditAction::Pending
            ]
        );
        assert_eq!(s.load(t.id).await.unwrap().assignee_id, Some(desk.staff7.id));
    }

    #[tokio::test]
    async fn test_escalate_and_out_of_service() {
        let desk = desk().await;
        let t = desk.service.create_ticket(&desk.reporter, new_ticket()).await.unwrap();
        let s = &desk.service;

        let out = s.perform(&desk.moderator, t.id, act(Action::Escalate)).await.unwrap();
        assert_eq!(out.new_status, TicketStatus::EscalatedUpper);
        let err = s.perform(&desk.moderator, t.id, act(Action::Escalate)).await.unwrap_err();
        assert!(matches!(err, ServerError::InvalidTransition { .. }));

        let out = s
            .perform(&desk.moderator, t.id, act(Action::MarkOutOfService))
            .await
            .unwrap();
        assert_eq!(out.new_status, TicketStatus::OutOfService);

        let err = s.perform(&desk.staff7, t.id, act(Action::Escalate)).await.unwrap_err();
        assert!(matches!(err, ServerError::Unauthorized));

        assert_eq!(
            history_actions(&desk, t.id).await[1..],
            [AuditAction::StatusChange, AuditAction::StatusChange]
        );
        let details: Vec<String> = audit::ticket_history(s.db(), t.id)
            .await
            .unwrap()
            .into_iter()
            .map(|h| h.detail)
            .collect();
        assert!(details.iter().any(|d| d.contains("escalated_upper -> out_of_service")));
    }

    #[tokio::test]
    async fn test_failed_audit_insert_undoes_the_change() {
        let desk = desk().await;
        let t = desk.service.create_ticket(&desk.reporter, new_ticket()).await.unwrap();
        let s = &desk.service;

        let db = s.db();
        db.execute(Statement::from_string(
            db.get_database_backend(),
            r#"CREATE TRIGGER history_down BEFORE INSERT ON ticket_history
               BEGIN SELECT RAISE(ABORT, 'history unavailable'); END"#
                .to_string(),
        ))
        .await
        .unwrap();

        let err = s.perform(&desk.moderator, t.id, act(Action::Escalate)).await.unwrap_err();
        assert!(matches!(err, ServerError::Database(_)));

        let request = ChangeRequest {
            action: Some(Action::Assign { staff_id: desk.staff7.id }),
            client_message: Some("On it".into()),
            internal_message: None,
        };
        assert!(s.perform(&desk.moderator, t.id, request).await.is_err());

        let loaded = s.load(t.id).await.unwrap();
        assert_eq!(loaded.status, TicketStatus::Open);
        assert_eq!(loaded.version, 0);
        assert_eq!(loaded.assignee_id, None);
        assert_eq!(loaded.client_message, "");
        assert_eq!(history_actions(&desk, t.id).await, vec![AuditAction::Create]);
    }

    #[tokio::test]
    async fn test_empty_request_is_a_no_op() {
        let desk = desk().await;
        let t = desk.service.create_ticket(&desk.reporter, new_ticket()).await.unwrap();
        let s = &desk.service;

        let out = s.perform(&desk.reporter, t.id, ChangeRequest::default()).await.unwrap();
        assert!(out.accepted);
        assert!(!out.changed);
        assert_eq!((out.new_status, out.version), (TicketStatus::Open, 0));
        assert_eq!(history_actions(&desk, t.id).await.len(), 1);

        // Still hidden from callers who cannot see the ticket
        let err = s.perform(&desk.staff9, t.id, ChangeRequest::default()).await.unwrap_err();
        assert!(matches!(err, ServerError::NotFound(_)));
    }
}
