use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use sea_orm::DbErr;
use serde::Serialize;
use thiserror::Error;

use crate::tickets::TicketStatus;

#[derive(Error, Debug)]
pub enum ServerError {
    #[error("Authentication required")]
    AuthRequired,

    #[error("Unauthorized for this action")]
    Unauthorized,

    #[error("{0} not found")]
    NotFound(String),

    #[error("Cannot {action}: ticket is {current}, requires {}", format_statuses(.required))]
    InvalidTransition {
        action: &'static str,
        current: TicketStatus,
        required: Vec<TicketStatus>,
    },

    #[error("Ticket changed since you loaded it, please retry")]
    Conflict,

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Database error: {0}")]
    Database(#[from] DbErr),

    #[error("Internal error: {0}")]
    Internal(String),
}

fn format_statuses(statuses: &[TicketStatus]) -> String {
    let names: Vec<&str> = statuses.iter().map(|s| s.as_str()).collect();
    match names.len() {
        0 => "no status".to_string(),
        1 => names[0].to_string(),
        _ => format!("one of: {}", names.join(", ")),
    }
}

impl ServerError {
    /// Short machine-readable kind, sent alongside the message
    pub fn kind(&self) -> &'static str {
        match self {
            ServerError::AuthRequired => "auth_required",
            ServerError::Unauthorized => "unauthorized",
            ServerError::NotFound(_) => "not_found",
            ServerError::InvalidTransition { .. } => "invalid_transition",
            ServerError::Conflict => "conflict",
            ServerError::InvalidRequest(_) => "invalid_request",
            ServerError::Database(_) | ServerError::Internal(_) => "internal",
        }
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            ServerError::AuthRequired => StatusCode::UNAUTHORIZED,
            ServerError::Unauthorized => StatusCode::FORBIDDEN,
            ServerError::NotFound(_) => StatusCode::NOT_FOUND,
            ServerError::InvalidTransition { .. } => StatusCode::CONFLICT,
            ServerError::Conflict => StatusCode::CONFLICT,
            ServerError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            ServerError::Database(_) | ServerError::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

/// Body returned for every rejected request
#[derive(Serialize)]
struct Rejection {
    accepted: bool,
    error: &'static str,
    reason: String,
}

impl IntoResponse for ServerError {
    fn into_response(self) -> Response {
        let reason = match &self {
            ServerError::Database(e) => {
                tracing::error!("Database failure: {}", e);
                "Internal server error".to_string()
            }
            ServerError::Internal(msg) => {
                tracing::error!("Internal failure: {}", msg);
                "Internal server error".to_string()
            }
            _ => self.to_string(),
        };

        let body = Rejection {
            accepted: false,
            error: self.kind(),
            reason,
        };

        (self.status_code(), Json(body)).into_response()
    }
}

pub type Result<T> = std::result::Result<T, ServerError>;
