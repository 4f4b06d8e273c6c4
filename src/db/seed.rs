//! Development seed file.
//!
//! Accounts normally come from the account administration service. For
//! local runs a TOML file can create them instead:
//!
//! ```toml
//! [[accounts]]
//! username = "moddy"
//! role = "mod"
//!
//! [[accounts]]
//! username = "seven"
//! role = "staff"
//! specialties = ["Hardware", "Network"]
//! leader = "moddy"
//! token = "dev-seven"
//! ```
//!
//! Applying a seed twice is harmless: accounts are matched by username.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use sea_orm::{
    ActiveModelTrait, ColumnTrait, ConnectionTrait, DatabaseConnection, DbErr, EntityTrait,
    QueryFilter, Set, Statement,
};
use serde::Deserialize;
use thiserror::Error;

use super::entities::account::{self, Role};
use super::entities::Account;
use super::now_secs;
use crate::api::auth::{DbSessionStore, SESSION_TTL_SECS};

#[derive(Error, Debug)]
pub enum SeedError {
    #[error("Cannot read seed file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Cannot parse seed file: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Invalid seed entry: {0}")]
    Invalid(String),

    #[error("Database error: {0}")]
    Database(#[from] DbErr),
}

#[derive(Debug, Default, Deserialize)]
pub struct SeedFile {
    #[serde(default)]
    pub accounts: Vec<SeedAccount>,
}

#[derive(Debug, Deserialize)]
pub struct SeedAccount {
    pub username: String,
    pub role: String,
    pub display_name: Option<String>,
    #[serde(default)]
    pub specialties: Vec<String>,
    /// Username of the moderator this staff member reports to
    pub leader: Option<String>,
    /// Raw session token to register for this account
    pub token: Option<String>,
}

impl SeedFile {
    pub fn load(path: &Path) -> Result<Self, SeedError> {
        let raw = std::fs::read_to_string(path)?;
        Self::parse(&raw)
    }

    pub fn parse(raw: &str) -> Result<Self, SeedError> {
        Ok(toml::from_str(raw)?)
    }
}

/// Create missing accounts with their specialties, teams and sessions.
/// Returns the number of accounts created.
pub async fn apply(db: &Arc<DatabaseConnection>, seed: &SeedFile) -> Result<usize, SeedError> {
    let sessions = DbSessionStore::new(db.clone());
    let db = db.as_ref();
    let mut ids: HashMap<String, i32> = HashMap::new();
    let mut created = 0;
    let now = now_secs();

    for entry in &seed.accounts {
        let role: Role = entry.role.parse().map_err(SeedError::Invalid)?;
        let existing = Account::find()
            .filter(account::Column::Username.eq(entry.username.clone()))
            .one(db)
            .await?;

        let id = match existing {
            Some(a) => a.id,
            None => {
                let inserted = account::ActiveModel {
                    username: Set(entry.username.clone()),
                    display_name: Set(entry.display_name.clone()),
                    role: Set(role),
                    is_banned: Set(false),
                    created_at: Set(now),
                    ..Default::default()
                }
                .insert(db)
                .await?;
                created += 1;
                inserted.id
            }
        };
        ids.insert(entry.username.clone(), id);

        for label in &entry.specialties {
            db.execute(Statement::from_sql_and_values(
                db.get_database_backend(),
                r#"INSERT OR IGNORE INTO staff_specialties (account_id, label) VALUES (?, ?)"#,
                [id.into(), label.trim().into()],
            ))
            .await?;
        }

        if let Some(token) = &entry.token {
            sessions.issue(id, token, SESSION_TTL_SECS).await?;
        }
    }

    // Leaders may appear after their members in the file
    for entry in &seed.accounts {
        let Some(leader) = &entry.leader else { continue };
        let leader_id = match ids.get(leader) {
            Some(id) => *id,
            None => Account::find()
                .filter(account::Column::Username.eq(leader.clone()))
                .one(db)
                .await?
                .map(|a| a.id)
                .ok_or_else(|| SeedError::Invalid(format!("unknown leader '{}'", leader)))?,
        };
        let member_id = ids[&entry.username];
        db.execute(Statement::from_sql_and_values(
            db.get_database_backend(),
            r#"INSERT OR IGNORE INTO team_members (leader_id, member_id) VALUES (?, ?)"#,
            [leader_id.into(), member_id.into()],
        ))
        .await?;
    }

    tracing::info!("Seed applied: {} new accounts", created);
    Ok(created)
}
