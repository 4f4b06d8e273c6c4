pub mod auth;
pub mod extract;
pub mod handlers;

use std::sync::Arc;

use axum::{
    routing::{get, post},
    Router,
};

pub use handlers::AppState;

/// JSON API routes
pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/health", get(handlers::health))
        .route("/api/me", get(handlers::me))
        // Reference data
        .route("/api/meta/ticket-types", get(handlers::ticket_types))
        .route("/api/meta/urgency-levels", get(handlers::urgency_levels))
        .route("/api/meta/statuses", get(handlers::statuses))
        // Tickets
        .route("/api/tickets", get(handlers::list_tickets).post(handlers::create_ticket))
        .route("/api/tickets/:id", get(handlers::get_ticket))
        .route("/api/tickets/:id/actions", post(handlers::ticket_action))
        .route("/api/tickets/:id/candidates", get(handlers::ticket_candidates))
        .route("/api/tickets/:id/history", get(handlers::ticket_history))
        // Moderator views
        .route("/api/history", get(handlers::search_history))
        .route("/api/team", get(handlers::my_team))
        .route("/api/team/:staff_id/tickets", get(handlers::team_member_tickets))
}
