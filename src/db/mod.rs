//! Database module for SQLite persistence using SeaORM

pub mod entities;
pub mod seed;

use sea_orm::{ConnectionTrait, Database, DatabaseConnection, DbErr, Statement};
use std::time::{SystemTime, UNIX_EPOCH};

/// Categories registered on first start
pub const DEFAULT_TICKET_TYPES: [&str; 5] = ["Hardware", "Software", "Network", "Account", "Other"];

/// Urgency levels registered on first start, with their rank
pub const DEFAULT_URGENCY_LEVELS: [(&str, i32); 4] =
    [("Low", 1), ("Medium", 2), ("High", 3), ("Critical", 4)];

/// Unix seconds; every stored timestamp uses this clock
pub fn now_secs() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

/// Initialize a SQLite database file and create tables
#[cfg(test)]
pub async fn init_database(db_path: &std::path::Path) -> Result<DatabaseConnection, DbErr> {
    // Ensure parent directory exists
    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent).ok();
    }

    let db_url = format!("sqlite:{}?mode=rwc", db_path.display());
    connect(&db_url).await
}

/// Connect to `db_url`, create tables and seed reference data
pub async fn connect(db_url: &str) -> Result<DatabaseConnection, DbErr> {
    tracing::info!("Connecting to database: {}", db_url);

    let db = Database::connect(db_url).await?;

    create_tables(&db).await?;
    seed_reference_data(&db).await?;

    Ok(db)
}

async fn run(db: &DatabaseConnection, sql: &str) -> Result<(), DbErr> {
    db.execute(Statement::from_string(db.get_database_backend(), sql.to_string()))
        .await?;
    Ok(())
}

/// Create all tables if they don't exist
async fn create_tables(db: &DatabaseConnection) -> Result<(), DbErr> {
    // Accounts are owned by the account administration service
    run(
        db,
        r#"
        CREATE TABLE IF NOT EXISTS accounts (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            username TEXT NOT NULL UNIQUE,
            display_name TEXT,
            role TEXT NOT NULL DEFAULT 'user',
            is_banned INTEGER NOT NULL DEFAULT 0,
            created_at INTEGER NOT NULL
        )
        "#,
    )
    .await?;
    run(db, r#"CREATE INDEX IF NOT EXISTS idx_accounts_role ON accounts(role)"#).await?;

    run(
        db,
        r#"
        CREATE TABLE IF NOT EXISTS staff_specialties (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            account_id INTEGER NOT NULL,
            label TEXT NOT NULL,
            FOREIGN KEY (account_id) REFERENCES accounts(id) ON DELETE CASCADE,
            UNIQUE(account_id, label)
        )
        "#,
    )
    .await?;
    run(
        db,
        r#"CREATE INDEX IF NOT EXISTS idx_skill_label ON staff_specialties(label COLLATE NOCASE)"#,
    )
    .await?;

    run(
        db,
        r#"
        CREATE TABLE IF NOT EXISTS team_members (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            leader_id INTEGER NOT NULL,
            member_id INTEGER NOT NULL,
            FOREIGN KEY (leader_id) REFERENCES accounts(id) ON DELETE CASCADE,
            FOREIGN KEY (member_id) REFERENCES accounts(id) ON DELETE CASCADE,
            UNIQUE(leader_id, member_id)
        )
        "#,
    )
    .await?;

    run(
        db,
        r#"
        CREATE TABLE IF NOT EXISTS ticket_types (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            name TEXT NOT NULL UNIQUE
        )
        "#,
    )
    .await?;

    run(
        db,
        r#"
        CREATE TABLE IF NOT EXISTS urgency_levels (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            name TEXT NOT NULL UNIQUE,
            rank INTEGER NOT NULL
        )
        "#,
    )
    .await?;

    // Ticket ids are random, so no AUTOINCREMENT here
    run(
        db,
        r#"
        CREATE TABLE IF NOT EXISTS tickets (
            id INTEGER PRIMARY KEY,
            title TEXT NOT NULL,
            description TEXT NOT NULL DEFAULT '',
            category TEXT NOT NULL,
            urgency TEXT NOT NULL,
            client_message TEXT NOT NULL DEFAULT '',
            internal_message TEXT NOT NULL DEFAULT '',
            status TEXT NOT NULL DEFAULT 'open',
            reporter_id INTEGER NOT NULL,
            assignee_id INTEGER,
            version INTEGER NOT NULL DEFAULT 0,
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL,
            FOREIGN KEY (reporter_id) REFERENCES accounts(id),
            FOREIGN KEY (assignee_id) REFERENCES accounts(id)
        )
        "#,
    )
    .await?;
    run(db, r#"CREATE INDEX IF NOT EXISTS idx_tickets_reporter ON tickets(reporter_id)"#).await?;
    run(
        db,
        r#"CREATE INDEX IF NOT EXISTS idx_tickets_assignee ON tickets(assignee_id, status)"#,
    )
    .await?;
    run(db, r#"CREATE INDEX IF NOT EXISTS idx_tickets_updated ON tickets(updated_at)"#).await?;

    // Append-only history, one row per accepted change
    run(
        db,
        r#"
        CREATE TABLE IF NOT EXISTS ticket_history (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            ticket_id INTEGER NOT NULL,
            action TEXT NOT NULL,
            actor_id INTEGER NOT NULL,
            detail TEXT NOT NULL DEFAULT '',
            created_at INTEGER NOT NULL,
            FOREIGN KEY (ticket_id) REFERENCES tickets(id),
            FOREIGN KEY (actor_id) REFERENCES accounts(id)
        )
        "#,
    )
    .await?;
    run(db, r#"CREATE INDEX IF NOT EXISTS idx_history_ticket ON ticket_history(ticket_id)"#).await?;
    run(
        db,
        r#"CREATE INDEX IF NOT EXISTS idx_history_created ON ticket_history(created_at)"#,
    )
    .await?;

    run(
        db,
        r#"
        CREATE TABLE IF NOT EXISTS sessions (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            token_hash TEXT NOT NULL UNIQUE,
            account_id INTEGER NOT NULL,
            created_at INTEGER NOT NULL,
            expires_at INTEGER NOT NULL,
            FOREIGN KEY (account_id) REFERENCES accounts(id) ON DELETE CASCADE
        )
        "#,
    )
    .await?;
    run(db, r#"CREATE INDEX IF NOT EXISTS idx_sessions_account ON sessions(account_id)"#).await?;

    tracing::info!("Database tables initialized");
    Ok(())
}

/// Register the default categories and urgency levels; existing rows are kept
async fn seed_reference_data(db: &DatabaseConnection) -> Result<(), DbErr> {
    for name in DEFAULT_TICKET_TYPES {
        db.execute(Statement::from_sql_and_values(
            db.get_database_backend(),
            r#"INSERT OR IGNORE INTO ticket_types (name) VALUES (?)"#,
            [name.into()],
        ))
        .await?;
    }

    for (name, rank) in DEFAULT_URGENCY_LEVELS {
        db.execute(Statement::from_sql_and_values(
            db.get_database_backend(),
            r#"INSERT OR IGNORE INTO urgency_levels (name, rank) VALUES (?, ?)"#,
            [name.into(), rank.into()],
        ))
        .await?;
    }

    Ok(())
}
