//! Server configuration, read from the environment.

use std::net::SocketAddr;
use std::path::PathBuf;

use thiserror::Error;

use crate::tickets::status::parse_status_list;
use crate::tickets::TicketStatus;

pub const DEFAULT_BIND: &str = "127.0.0.1:8080";
pub const DEFAULT_MAX_BODY_BYTES: usize = 1024 * 1024;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("{var} is invalid: {reason}")]
    Invalid { var: &'static str, reason: String },
}

/// Server configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Directory holding the SQLite file
    pub data_dir: PathBuf,
    pub database_url: String,
    pub bind: SocketAddr,
    /// Statuses not counted in a staff member's load
    pub load_terminal: Vec<TicketStatus>,
    /// Optional TOML file with accounts to create at start
    pub seed_file: Option<PathBuf>,
    pub max_body_bytes: usize,
}

impl Config {
    /// Load `.env` if present, then read `HELPDESK_*` variables
    pub fn from_env() -> Result<Self, ConfigError> {
        if let Ok(path) = dotenvy::dotenv() {
            tracing::debug!("Loaded environment from {:?}", path);
        }
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        let data_dir = get("HELPDESK_DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|| std::env::temp_dir().join("helpdesk-server"));

        let database_url = get("HELPDESK_DATABASE_URL").unwrap_or_else(|| {
            format!("sqlite:{}?mode=rwc", data_dir.join("helpdesk.db").display())
        });

        let bind = get("HELPDESK_BIND")
            .unwrap_or_else(|| DEFAULT_BIND.to_string())
            .parse::<SocketAddr>()
            .map_err(|e| ConfigError::Invalid {
                var: "HELPDESK_BIND",
                reason: e.to_string(),
            })?;

        let load_terminal = match get("HELPDESK_LOAD_TERMINAL") {
            Some(raw) => parse_status_list(&raw).map_err(|reason| ConfigError::Invalid {
                var: "HELPDESK_LOAD_TERMINAL",
                reason,
            })?,
            None => vec![TicketStatus::Resolved, TicketStatus::Closed],
        };

        let max_body_bytes = match get("HELPDESK_MAX_BODY_BYTES") {
            Some(raw) => raw.parse::<usize>().map_err(|e| ConfigError::Invalid {
                var: "HELPDESK_MAX_BODY_BYTES",
                reason: e.to_string(),
            })?,
            None => DEFAULT_MAX_BODY_BYTES,
        };

        Ok(Self {
            database_url,
            data_dir,
            bind,
            load_terminal,
            seed_file: get("HELPDESK_SEED_FILE").map(PathBuf::from),
            max_body_bytes,
        })
    }
}
