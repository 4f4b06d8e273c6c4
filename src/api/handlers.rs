use std::sync::Arc;

use axum::{
    extract::State,
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use sea_orm::{DatabaseConnection, EntityTrait, QueryOrder};
use serde::Serialize;

use super::auth::{require_session, DbSessionStore, SessionContext, SessionStore};
use super::extract::{ApiJson, ApiPath, ApiQuery};
use crate::config::Config;
use crate::db::entities::account::Role;
use crate::db::entities::{ticket_type, urgency_level, TicketType, UrgencyLevel};
use crate::error::{Result, ServerError};
use crate::tickets::{
    audit, team, ActionBody, AssignmentPolicy, Candidate, CandidateList, HistoryEntry,
    HistoryFilter, NewTicket, Outcome, TicketFilter, TicketService, TicketStatus, TicketView,
};

/// Application state shared across handlers
pub struct AppState {
    pub db: Arc<DatabaseConnection>,
    pub tickets: TicketService,
    pub sessions: Arc<dyn SessionStore>,
}

impl AppState {
    pub fn new(db: Arc<DatabaseConnection>, config: &Config) -> Self {
        let policy = AssignmentPolicy::new(config.load_terminal.clone());
        Self {
            tickets: TicketService::new(db.clone(), policy),
            sessions: Arc::new(DbSessionStore::new(db.clone())),
            db,
        }
    }

    async fn caller(&self, headers: &HeaderMap) -> Result<SessionContext> {
        require_session(self.sessions.as_ref(), headers).await
    }
}

/// Health check endpoint
pub async fn health() -> Response {
    let json = serde_json::json!({
        "status": "healthy",
        "version": env!("CARGO_PKG_VERSION")
    });
    (StatusCode::OK, Json(json)).into_response()
}

/// GET /api/me - the caller's account
pub async fn me(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Json<SessionContext>> {
    Ok(Json(state.caller(&headers).await?))
}

/// GET /api/meta/ticket-types
pub async fn ticket_types(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Json<Vec<String>>> {
    state.caller(&headers).await?;
    let names = TicketType::find()
        .order_by_asc(ticket_type::Column::Id)
        .all(state.db.as_ref())
        .await?
        .into_iter()
        .map(|t| t.name)
        .collect();
    Ok(Json(names))
}

#[derive(Serialize)]
pub struct UrgencyLevelInfo {
    name: String,
    rank: i32,
}

/// GET /api/meta/urgency-levels
pub async fn urgency_levels(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Json<Vec<UrgencyLevelInfo>>> {
    state.caller(&headers).await?;
    let levels = UrgencyLevel::find()
        .order_by_asc(urgency_level::Column::Rank)
        .all(state.db.as_ref())
        .await?
        .into_iter()
        .map(|u| UrgencyLevelInfo { name: u.name, rank: u.rank })
        .collect();
    Ok(Json(levels))
}

/// GET /api/meta/statuses
pub async fn statuses(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Json<Vec<TicketStatus>>> {
    state.caller(&headers).await?;
    Ok(Json(TicketStatus::ALL.to_vec()))
}

/// POST /api/tickets - file a ticket
pub async fn create_ticket(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    ApiJson(req): ApiJson<NewTicket>,
) -> Result<Response> {
    let caller = state.caller(&headers).await?;
    let ticket = state.tickets.create_ticket(&caller.actor(), req).await?;
    let view = state
        .tickets
        .views(&caller.actor(), vec![ticket])
        .await?
        .pop()
        .ok_or_else(|| ServerError::Internal("created ticket has no view".into()))?;
    Ok((StatusCode::CREATED, Json(view)).into_response())
}

/// GET /api/tickets - tickets visible to the caller
pub async fn list_tickets(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    ApiQuery(filter): ApiQuery<TicketFilter>,
) -> Result<Json<Vec<TicketView>>> {
    let caller = state.caller(&headers).await?;
    Ok(Json(state.tickets.list(&caller.actor(), &filter).await?))
}

/// GET /api/tickets/:id
pub async fn get_ticket(
    State(state): State<Arc<AppState>>,
    ApiPath(id): ApiPath<i64>,
    headers: HeaderMap,
) -> Result<Json<TicketView>> {
    let caller = state.caller(&headers).await?;
    Ok(Json(state.tickets.ticket_detail(&caller.actor(), id).await?))
}

/// POST /api/tickets/:id/actions - lifecycle action and/or message edits
pub async fn ticket_action(
    State(state): State<Arc<AppState>>,
    ApiPath(id): ApiPath<i64>,
    headers: HeaderMap,
    ApiJson(body): ApiJson<ActionBody>,
) -> Result<Json<Outcome>> {
    let caller = state.caller(&headers).await?;
    let request = body.into_request()?;
    let action = request.action.as_ref().map(|a| a.name()).unwrap_or("edit_messages");

    match state.tickets.perform(&caller.actor(), id, request).await {
        Ok(outcome) => Ok(Json(outcome)),
        Err(e) => {
            tracing::debug!("Ticket {}: {} by {} rejected: {}", id, action, caller.username, e);
            Err(e)
        }
    }
}

/// GET /api/tickets/:id/candidates - ranked staff for assignment
pub async fn ticket_candidates(
    State(state): State<Arc<AppState>>,
    ApiPath(id): ApiPath<i64>,
    headers: HeaderMap,
) -> Result<Json<CandidateList>> {
    let caller = state.caller(&headers).await?;
    Ok(Json(state.tickets.candidates(&caller.actor(), id).await?))
}

/// GET /api/tickets/:id/history
pub async fn ticket_history(
    State(state): State<Arc<AppState>>,
    ApiPath(id): ApiPath<i64>,
    headers: HeaderMap,
) -> Result<Json<Vec<HistoryEntry>>> {
    let caller = state.caller(&headers).await?;
    Ok(Json(state.tickets.history(&caller.actor(), id).await?))
}

/// GET /api/history - moderators' history search
pub async fn search_history(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    ApiQuery(filter): ApiQuery<HistoryFilter>,
) -> Result<Json<Vec<HistoryEntry>>> {
    let caller = state.caller(&headers).await?;
    if caller.role != Role::Mod {
        return Err(ServerError::Unauthorized);
    }
    Ok(Json(audit::search_history(state.db.as_ref(), &filter).await?))
}

/// GET /api/team - staff under the calling moderator
pub async fn my_team(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Json<Vec<Candidate>>> {
    let caller = state.caller(&headers).await?;
    Ok(Json(team::team_overview(&state.tickets, &caller.actor()).await?))
}

/// GET /api/team/:staff_id/tickets
pub async fn team_member_tickets(
    State(state): State<Arc<AppState>>,
    ApiPath(staff_id): ApiPath<i32>,
    headers: HeaderMap,
    ApiQuery(filter): ApiQuery<TicketFilter>,
) -> Result<Json<Vec<TicketView>>> {
    let caller = state.caller(&headers).await?;
    Ok(Json(
        team::member_tickets(&state.tickets, &caller.actor(), staff_id, &filter).await?,
    ))
}
