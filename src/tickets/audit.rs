//! Ticket history.
//!
//! Records are only ever appended, always on the connection of the
//! transaction that performs the change they describe.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use sea_orm::entity::prelude::*;
use sea_orm::sea_query::Condition;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, ConnectionTrait, DatabaseConnection, EntityTrait, Iterable,
    QueryFilter, QueryOrder, QuerySelect, Set,
};
use serde::{Deserialize, Serialize};

use super::query::{day_end, day_start, page_size, SortDir};
use crate::db::entities::{account, audit_record, Account, AuditRecord};
use crate::error::{Result, ServerError};

#[derive(
    Copy, Clone, Debug, PartialEq, Eq, Hash, EnumIter, DeriveActiveEnum, Serialize, Deserialize,
)]
#[sea_orm(rs_type = "String", db_type = "String(StringLen::N(32))")]
#[serde(rename_all = "snake_case")]
pub enum AuditAction {
    #[sea_orm(string_value = "create")]
    Create,
    #[sea_orm(string_value = "assign")]
    Assign,
    #[sea_orm(string_value = "status_change")]
    StatusChange,
    #[sea_orm(string_value = "working")]
    Working,
    /// Work submitted for review
    #[sea_orm(string_value = "resolve")]
    Resolve,
    #[sea_orm(string_value = "reassign")]
    Reassign,
    #[sea_orm(string_value = "pending")]
    Pending,
    #[sea_orm(string_value = "reopen")]
    Reopen,
    /// Reporter edited the description
    #[sea_orm(string_value = "update")]
    Update,
    #[sea_orm(string_value = "message_update")]
    MessageUpdate,
}

impl AuditAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditAction::Create => "create",
            AuditAction::Assign => "assign",
            AuditAction::StatusChange => "status_change",
            AuditAction::Working => "working",
            AuditAction::Resolve => "resolve",
            AuditAction::Reassign => "reassign",
            AuditAction::Pending => "pending",
            AuditAction::Reopen => "reopen",
            AuditAction::Update => "update",
            AuditAction::MessageUpdate => "message_update",
        }
    }
}

impl fmt::Display for AuditAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AuditAction {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let wanted = s.trim().to_ascii_lowercase();
        AuditAction::iter()
            .find(|a| a.as_str() == wanted)
            .ok_or_else(|| format!("unknown history action '{}'", s.trim()))
    }
}

/// Append one record. `conn` must be the transaction that writes the change.
pub async fn record<C: ConnectionTrait>(
    conn: &C,
    ticket_id: i64,
    action: AuditAction,
    actor_id: i32,
    detail: &str,
    at: i64,
) -> std::result::Result<audit_record::Model, DbErr> {
    let entry = audit_record::ActiveModel {
        ticket_id: Set(ticket_id),
        action: Set(action),
        actor_id: Set(actor_id),
        detail: Set(detail.to_string()),
        created_at: Set(at),
        ..Default::default()
    };
    entry.insert(conn).await
}

/// A history row with the actor's username resolved
#[derive(Clone, Debug, Serialize)]
pub struct HistoryEntry {
    pub id: i32,
    pub ticket_id: i64,
    pub action: AuditAction,
    pub actor_id: i32,
    pub actor_username: Option<String>,
    pub detail: String,
    pub created_at: i64,
}

/// Query string of the moderator history page
#[derive(Clone, Debug, Default, Deserialize)]
pub struct HistoryFilter {
    pub ticket_id: Option<i64>,
    pub action: Option<String>,
    /// Actor id, or a substring of the actor's username
    pub actor: Option<String>,
    pub start_date: Option<String>,
    pub end_date: Option<String>,
    /// Substring of the detail text
    pub detail: Option<String>,
    pub sort_by: Option<String>,
    pub sort_dir: Option<String>,
    pub limit: Option<u64>,
    pub offset: Option<u64>,
}

fn sort_column(raw: Option<&str>) -> audit_record::Column {
    match raw {
        Some("id") => audit_record::Column::Id,
        Some("ticket_id") => audit_record::Column::TicketId,
        Some("action") => audit_record::Column::Action,
        Some("actor_id") => audit_record::Column::ActorId,
        _ => audit_record::Column::CreatedAt,
    }
}

fn non_empty(value: &Option<String>) -> Option<&str> {
    value.as_deref().map(str::trim).filter(|s| !s.is_empty())
}

/// History of one ticket, oldest first
pub async fn ticket_history(db: &DatabaseConnection, ticket_id: i64) -> Result<Vec<HistoryEntry>> {
    let rows = AuditRecord::find()
        .filter(audit_record::Column::TicketId.eq(ticket_id))
        .order_by_asc(audit_record::Column::CreatedAt)
        .order_by_asc(audit_record::Column::Id)
        .all(db)
        .await?;
    with_usernames(db, rows).await
}

/// Filtered history across all tickets
pub async fn search_history(
    db: &DatabaseConnection,
    filter: &HistoryFilter,
) -> Result<Vec<HistoryEntry>> {
    let mut cond = Condition::all();

    if let Some(ticket_id) = filter.ticket_id {
        cond = cond.add(audit_record::Column::TicketId.eq(ticket_id));
    }
    if let Some(raw) = non_empty(&filter.action) {
        let action: AuditAction = raw.parse().map_err(ServerError::InvalidRequest)?;
        cond = cond.add(audit_record::Column::Action.eq(action));
    }
    if let Some(actor) = non_empty(&filter.actor) {
        let mut ids: Vec<i32> = Account::find()
            .select_only()
            .column(account::Column::Id)
            .filter(account::Column::Username.contains(actor))
            .into_tuple()
            .all(db)
            .await?;
        if let Ok(id) = actor.parse::<i32>() {
            ids.push(id);
        }
        cond = cond.add(audit_record::Column::ActorId.is_in(ids));
    }
    if let Some(start) = non_empty(&filter.start_date) {
        cond = cond.add(audit_record::Column::CreatedAt.gte(day_start(start)?));
    }
    if let Some(end) = non_empty(&filter.end_date) {
        cond = cond.add(audit_record::Column::CreatedAt.lte(day_end(end)?));
    }
    if let Some(detail) = non_empty(&filter.detail) {
        cond = cond.add(audit_record::Column::Detail.contains(detail));
    }

    let order = SortDir::parse(filter.sort_dir.as_deref()).order();
    let rows = AuditRecord::find()
        .filter(cond)
        .order_by(sort_column(filter.sort_by.as_deref()), order.clone())
        .order_by(audit_record::Column::Id, order)
        .limit(page_size(filter.limit))
        .offset(filter.offset.unwrap_or(0))
        .all(db)
        .await?;

    with_usernames(db, rows).await
}

async fn with_usernames(
    db: &DatabaseConnection,
    rows: Vec<audit_record::Model>,
) -> Result<Vec<HistoryEntry>> {
    let mut actor_ids: Vec<i32> = rows.iter().map(|r| r.actor_id).collect();
    actor_ids.sort_unstable();
    actor_ids.dedup();

    let names: HashMap<i32, String> = Account::find()
        .filter(account::Column::Id.is_in(actor_ids))
        .all(db)
        .await?
        .into_iter()
        .map(|a| (a.id, a.username))
        .collect();

    Ok(rows
        .into_iter()
        .map(|r| HistoryEntry {
            id: r.id,
            ticket_id: r.ticket_id,
            action: r.action,
            actor_id: r.actor_id,
            actor_username: names.get(&r.actor_id).cloned(),
            detail: r.detail,
            created_at: r.created_at,
        })
        .collect())
}
