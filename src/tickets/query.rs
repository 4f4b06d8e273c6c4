//! Ticket list filters shared by the dashboards.

use chrono::{NaiveDate, NaiveTime};
use sea_orm::sea_query::{Condition, Expr};
use sea_orm::{
    ColumnTrait, DatabaseConnection, EntityTrait, Order, QueryFilter, QueryOrder, QuerySelect,
};
use serde::Deserialize;

use super::machine::Actor;
use super::status::TicketStatus;
use crate::db::entities::account::{self, Role};
use crate::db::entities::{ticket, Account, Ticket};
use crate::error::{Result, ServerError};

pub const DEFAULT_PAGE_SIZE: u64 = 50;
pub const MAX_PAGE_SIZE: u64 = 200;

/// Sort direction, `desc` unless asked otherwise
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SortDir {
    Asc,
    Desc,
}

impl SortDir {
    /// Anything but `asc` sorts descending
    pub fn parse(raw: Option<&str>) -> Self {
        match raw.map(|s| s.trim().to_ascii_lowercase()) {
            Some(s) if s == "asc" => SortDir::Asc,
            _ => SortDir::Desc,
        }
    }

    pub fn order(&self) -> Order {
        match self {
            SortDir::Asc => Order::Asc,
            SortDir::Desc => Order::Desc,
        }
    }
}

/// Parse `YYYY-MM-DD` into the unix second at which that day starts (UTC)
pub fn day_start(raw: &str) -> Result<i64> {
    let raw = raw.trim();
    let date = NaiveDate::parse_from_str(raw, "%Y-%m-%d").map_err(|_| {
        ServerError::InvalidRequest(format!("invalid date '{}', expected YYYY-MM-DD", raw))
    })?;
    Ok(date.and_time(NaiveTime::MIN).and_utc().timestamp())
}

/// Last unix second of the given day, so that end dates are inclusive
pub fn day_end(raw: &str) -> Result<i64> {
    Ok(day_start(raw)? + 86_400 - 1)
}

/// Clamp a requested page size
pub fn page_size(limit: Option<u64>) -> u64 {
    limit.unwrap_or(DEFAULT_PAGE_SIZE).clamp(1, MAX_PAGE_SIZE)
}

fn non_empty(value: &Option<String>) -> Option<&str> {
    value.as_deref().map(str::trim).filter(|s| !s.is_empty())
}

/// Query string of `GET /api/tickets`
#[derive(Clone, Debug, Default, Deserialize)]
pub struct TicketFilter {
    pub status: Option<String>,
    pub urgency: Option<String>,
    pub category: Option<String>,
    /// Substring of title, description, reporter or assignee username
    pub search: Option<String>,
    pub start_date: Option<String>,
    pub end_date: Option<String>,
    pub sort_by: Option<String>,
    pub sort_dir: Option<String>,
    pub limit: Option<u64>,
    pub offset: Option<u64>,
}

fn sort_column(raw: Option<&str>) -> ticket::Column {
    match raw {
        Some("created_at") => ticket::Column::CreatedAt,
        Some("title") => ticket::Column::Title,
        Some("status") => ticket::Column::Status,
        _ => ticket::Column::UpdatedAt,
    }
}

/// Tickets visible to `actor` that match `filter`
pub async fn list_tickets(
    db: &DatabaseConnection,
    actor: &Actor,
    filter: &TicketFilter,
) -> Result<Vec<ticket::Model>> {
    let mut cond = Condition::all();

    cond = match actor.role {
        Role::User => cond.add(ticket::Column::ReporterId.eq(actor.id)),
        Role::Staff => cond.add(ticket::Column::AssigneeId.eq(actor.id)),
        Role::Mod | Role::Admin => cond,
    };

    if let Some(raw) = non_empty(&filter.status) {
        let status: TicketStatus = raw.parse().map_err(ServerError::InvalidRequest)?;
        cond = cond.add(ticket::Column::Status.eq(status));
    }
    if let Some(urgency) = non_empty(&filter.urgency) {
        cond = cond.add(Expr::cust_with_values("LOWER(urgency) = LOWER(?)", [urgency]));
    }
    if let Some(category) = non_empty(&filter.category) {
        cond = cond.add(Expr::cust_with_values("LOWER(category) = LOWER(?)", [category]));
    }
    if let Some(start) = non_empty(&filter.start_date) {
        cond = cond.add(ticket::Column::CreatedAt.gte(day_start(start)?));
    }
    if let Some(end) = non_empty(&filter.end_date) {
        cond = cond.add(ticket::Column::CreatedAt.lte(day_end(end)?));
    }
    if let Some(search) = non_empty(&filter.search) {
        let matching_accounts: Vec<i32> = Account::find()
            .select_only()
            .column(account::Column::Id)
            .filter(account::Column::Username.contains(search))
            .into_tuple()
            .all(db)
            .await?;

        let mut any = Condition::any()
            .add(ticket::Column::Title.contains(search))
            .add(ticket::Column::Description.contains(search));
        if let Ok(id) = search.parse::<i64>() {
            any = any.add(ticket::Column::Id.eq(id));
        }
        if !matching_accounts.is_empty() {
            any = any
                .add(ticket::Column::ReporterId.is_in(matching_accounts.clone()))
                .add(ticket::Column::AssigneeId.is_in(matching_accounts));
        }
        cond = cond.add(any);
    }

    let order = SortDir::parse(filter.sort_dir.as_deref()).order();
    let tickets = Ticket::find()
        .filter(cond)
        .order_by(sort_column(filter.sort_by.as_deref()), order.clone())
        .order_by(ticket::Column::Id, order)
        .limit(page_size(filter.limit))
        .offset(filter.offset.unwrap_or(0))
        .all(db)
        .await?;

    Ok(tickets)
}
