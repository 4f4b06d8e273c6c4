//! Assignment policy: which staff should take a ticket.
//!
//! Eligible staff are ranked by how many tickets they currently hold,
//! least loaded first, ties broken by staff id.

use std::collections::HashMap;

use sea_orm::{
    ColumnTrait, ConnectionTrait, DatabaseConnection, EntityTrait, QueryFilter, QueryOrder,
    Statement, Value,
};
use serde::Serialize;

use super::status::TicketStatus;
use crate::db::entities::account::{self, Role};
use crate::db::entities::{staff_specialty, ticket_type, Account, StaffSpecialty, TicketType};
use crate::error::Result;

/// Category sentinels meaning "no particular specialty"
pub const ANY_CATEGORY: [&str; 2] = ["undecided", "any"];

/// A staff account with its specialties and current load
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct Candidate {
    pub staff_id: i32,
    pub username: String,
    /// Display name, falling back to the username
    pub display_name: String,
    pub specialties: Vec<String>,
    pub current_open_count: i64,
}

/// Who is eligible for a category
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Eligibility {
    Any,
    Specialty(String),
}

impl Eligibility {
    /// Resolve `category` against the registered ticket types. Unknown
    /// categories fall back to `Any`; the flag reports that fallback.
    pub fn for_category(category: &str, registered: &[String]) -> (Eligibility, bool) {
        let category = category.trim();
        if ANY_CATEGORY.iter().any(|s| s.eq_ignore_ascii_case(category)) {
            return (Eligibility::Any, false);
        }
        if registered.iter().any(|r| r.eq_ignore_ascii_case(category)) {
            (Eligibility::Specialty(category.to_string()), false)
        } else {
            (Eligibility::Any, true)
        }
    }

    fn admits(&self, candidate: &Candidate) -> bool {
        match self {
            Eligibility::Any => true,
            Eligibility::Specialty(label) => candidate
                .specialties
                .iter()
                .any(|s| s.eq_ignore_ascii_case(label)),
        }
    }
}

/// Filter `staff` by `rule` and order the result by (load, id)
pub fn rank(staff: &[Candidate], rule: &Eligibility) -> Vec<Candidate> {
    let mut ranked: Vec<Candidate> = staff.iter().filter(|c| rule.admits(c)).cloned().collect();
    ranked.sort_by_key(|c| (c.current_open_count, c.staff_id));
    ranked
}

/// Policy output for one ticket
#[derive(Clone, Debug, Serialize)]
pub struct CandidateList {
    pub category: String,
    /// The category is not a registered type, all staff were considered
    pub fallback: bool,
    pub matching: Vec<Candidate>,
    pub all_staff: Vec<Candidate>,
}

#[derive(Clone, Debug)]
pub struct AssignmentPolicy {
    /// Statuses that do not count towards a staff member's load
    load_terminal: Vec<TicketStatus>,
}

impl AssignmentPolicy {
    pub fn new(load_terminal: Vec<TicketStatus>) -> Self {
        Self { load_terminal }
    }

    /// Rank the staff for `category`
    pub async fn candidates(
        &self,
        db: &DatabaseConnection,
        category: &str,
    ) -> Result<CandidateList> {
        let registered: Vec<String> = TicketType::find()
            .order_by_asc(ticket_type::Column::Id)
            .all(db)
            .await?
            .into_iter()
            .map(|t| t.name)
            .collect();

        let (rule, fallback) = Eligibility::for_category(category, &registered);
        let staff = self.staff_directory(db, None).await?;

        Ok(CandidateList {
            category: category.to_string(),
            fallback,
            matching: rank(&staff, &rule),
            all_staff: rank(&staff, &Eligibility::Any),
        })
    }

    /// Active staff accounts with specialties and load, optionally limited to `ids`
    pub async fn staff_directory(
        &self,
        db: &DatabaseConnection,
        ids: Option<&[i32]>,
    ) -> Result<Vec<Candidate>> {
        let mut query = Account::find()
            .filter(account::Column::Role.eq(Role::Staff))
            .filter(account::Column::IsBanned.eq(false));
        if let Some(ids) = ids {
            query = query.filter(account::Column::Id.is_in(ids.to_vec()));
        }
        let staff = query.order_by_asc(account::Column::Id).all(db).await?;
        let staff_ids: Vec<i32> = staff.iter().map(|s| s.id).collect();

        let mut specialties: HashMap<i32, Vec<String>> = HashMap::new();
        for row in StaffSpecialty::find()
            .filter(staff_specialty::Column::AccountId.is_in(staff_ids))
            .order_by_asc(staff_specialty::Column::Label)
            .all(db)
            .await?
        {
            specialties.entry(row.account_id).or_default().push(row.label);
        }

        let loads = self.open_counts(db).await?;

        Ok(staff
            .into_iter()
            .map(|s| Candidate {
                staff_id: s.id,
                current_open_count: loads.get(&s.id).copied().unwrap_or(0),
                specialties: specialties.remove(&s.id).unwrap_or_default(),
                display_name: s.label().to_string(),
                username: s.username,
            })
            .collect())
    }

    /// Tickets held per assignee, not counting load-terminal statuses
    pub async fn open_counts(&self, db: &DatabaseConnection) -> Result<HashMap<i32, i64>> {
        let mut sql = String::from(
            "SELECT assignee_id, COUNT(*) AS open_count FROM tickets WHERE assignee_id IS NOT NULL",
        );
        if !self.load_terminal.is_empty() {
            let placeholders = vec!["?"; self.load_terminal.len()].join(", ");
            sql.push_str(&format!(" AND status NOT IN ({})", placeholders));
        }
        sql.push_str(" GROUP BY assignee_id");

        let values: Vec<Value> = self
            .load_terminal
            .iter()
            .map(|s| Value::from(s.as_str()))
            .collect();

        let rows = db
            .query_all(Statement::from_sql_and_values(db.get_database_backend(), sql, values))
            .await?;

        let mut counts = HashMap::new();
        for row in rows {
            let assignee: i32 = row.try_get("", "assignee_id")?;
            let count: i64 = row.try_get("", "open_count")?;
            counts.insert(assignee, count);
        }
        Ok(counts)
    }
}

impl Default for AssignmentPolicy {
    fn default() -> Self {
        Self::new(vec![TicketStatus::Resolved, TicketStatus::Closed])
    }
}
