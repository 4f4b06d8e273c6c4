//! Session resolution.
//!
//! Logging in happens elsewhere; this module only turns a presented token
//! into the caller's account and role. Tokens are accepted as a bearer
//! `Authorization` header or a `token=` cookie.

use std::sync::Arc;

use async_trait::async_trait;
use axum::http::{header, HeaderMap};
use sea_orm::{
    ActiveModelTrait, ColumnTrait, DatabaseConnection, DbErr, EntityTrait, QueryFilter, Set,
};
use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::db::entities::account::Role;
use crate::db::entities::{session, Account, Session};
use crate::db::now_secs;
use crate::error::{Result, ServerError};
use crate::tickets::Actor;

/// Default lifetime of an issued session
pub const SESSION_TTL_SECS: i64 = 30 * 24 * 60 * 60;

/// The authenticated caller of a request
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct SessionContext {
    pub account_id: i32,
    pub username: String,
    pub display_name: Option<String>,
    pub role: Role,
}

impl SessionContext {
    pub fn actor(&self) -> Actor {
        Actor::new(self.account_id, self.role)
    }
}

/// Looks up the session behind a raw token
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// `None` for unknown or expired tokens and banned accounts
    async fn resolve(&self, token: &str) -> Result<Option<SessionContext>>;
}

/// SHA-256 of a token as lowercase hex; only this is stored
pub fn hash_token(token: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(token.as_bytes());
    let result = hasher.finalize();
    result.iter().map(|b| format!("{:02x}", b)).collect()
}

/// Pull the session token from the request headers
pub fn extract_token(headers: &HeaderMap) -> Option<String> {
    if let Some(auth_header) = headers.get(header::AUTHORIZATION) {
        if let Ok(auth_str) = auth_header.to_str() {
            if let Some(token) = auth_str.strip_prefix("Bearer ") {
                let token = token.trim();
                if !token.is_empty() {
                    return Some(token.to_string());
                }
            }
        }
    }

    let cookie_header = headers.get(header::COOKIE)?.to_str().ok()?;
    for part in cookie_header.split(';') {
        let part = part.trim();
        if let Some(token) = part.strip_prefix("token=") {
            if !token.is_empty() {
                return Some(token.to_string());
            }
        }
    }
    None
}

/// Resolve the caller or fail with `AuthRequired`
pub async fn require_session(
    store: &dyn SessionStore,
    headers: &HeaderMap,
) -> Result<SessionContext> {
    let token = extract_token(headers).ok_or(ServerError::AuthRequired)?;
    store.resolve(&token).await?.ok_or(ServerError::AuthRequired)
}

/// Sessions kept in the `sessions` table
pub struct DbSessionStore {
    db: Arc<DatabaseConnection>,
}

impl DbSessionStore {
    pub fn new(db: Arc<DatabaseConnection>) -> Self {
        Self { db }
    }

    /// Store a session for `token`, valid for `ttl_secs`
    pub async fn issue(
        &self,
        account_id: i32,
        token: &str,
        ttl_secs: i64,
    ) -> std::result::Result<session::Model, DbErr> {
        let now = now_secs();
        let token_hash = hash_token(token);

        // Re-issuing the same token replaces the old row
        Session::delete_many()
            .filter(session::Column::TokenHash.eq(token_hash.clone()))
            .exec(self.db.as_ref())
            .await?;

        let created = session::ActiveModel {
            token_hash: Set(token_hash),
            account_id: Set(account_id),
            created_at: Set(now),
            expires_at: Set(now + ttl_secs),
            ..Default::default()
        }
        .insert(self.db.as_ref())
        .await?;
        Ok(created)
    }
}

#[async_trait]
impl SessionStore for DbSessionStore {
    async fn resolve(&self, token: &str) -> Result<Option<SessionContext>> {
        let found = Session::find()
            .filter(session::Column::TokenHash.eq(hash_token(token)))
            .find_also_related(Account)
            .one(self.db.as_ref())
            .await?;

        let Some((session, Some(account))) = found else {
            return Ok(None);
        };
        if session.expires_at <= now_secs() {
            tracing::debug!("Session for account {} has expired", account.id);
            return Ok(None);
        }
        if account.is_banned {
            tracing::debug!("Rejecting session of banned account {}", account.id);
            return Ok(None);
        }

        Ok(Some(SessionContext {
            account_id: account.id,
            username: account.username,
            display_name: account.display_name,
            role: account.role,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::entities::account;
    use crate::db::init_database;
    use crate::tickets::testutil;
    use axum::http::HeaderValue;
    use sea_orm::sea_query::Expr;
    use tempfile::TempDir;

    #[test]
    fn test_token_hash() {
        let hash1 = hash_token("hd_abc");
        let hash2 = hash_token("hd_abc");
        let hash3 = hash_token("hd_abd");

        assert_eq!(hash1, hash2);
        assert_ne!(hash1, hash3);
        assert_eq!(hash1.len(), 64);
    }

    #[test]
    fn test_extract_token() {
        let mut headers = HeaderMap::new();
        assert_eq!(extract_token(&headers), None);

        headers.insert(
            header::COOKIE,
            HeaderValue::from_static("theme=dark; token=cookie-token"),
        );
        assert_eq!(extract_token(&headers).as_deref(), Some("cookie-token"));

        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Bearer header-token"));
        assert_eq!(extract_token(&headers).as_deref(), Some("header-token"));

        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Basic dXNlcjpwYXNz"));
        assert_eq!(extract_token(&headers).as_deref(), Some("cookie-token"));
    }

    #[tokio::test]
    async fn test_session_store() {
        let dir = TempDir::new().unwrap();
        let db = Arc::new(init_database(&dir.path().join("s.db")).await.unwrap());
        let staff = testutil::account(&db, "seven", Role::Staff).await;
        let store = DbSessionStore::new(db.clone());

        store.issue(staff.id, "live", SESSION_TTL_SECS).await.unwrap();
        store.issue(staff.id, "stale", -1).await.unwrap();

        let ctx = store.resolve("live").await.unwrap().unwrap();
        assert_eq!(ctx.username, "seven");
        assert_eq!(ctx.actor(), Actor::new(staff.id, Role::Staff));

        assert!(store.resolve("stale").await.unwrap().is_none());
        assert!(store.resolve("unknown").await.unwrap().is_none());

        let mut headers = HeaderMap::new();
        let err = require_session(&store, &headers).await.unwrap_err();
        assert!(matches!(err, ServerError::AuthRequired));
        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Bearer live"));
        assert_eq!(require_session(&store, &headers).await.unwrap().account_id, staff.id);

        account::Entity::update_many()
            .col_expr(account::Column::IsBanned, Expr::value(true))
            .filter(account::Column::Id.eq(staff.id))
            .exec(db.as_ref())
            .await
            .unwrap();
        assert!(store.resolve("live").await.unwrap().is_none());
    }
}
