//! Ticket entity
//!
//! Ids are random caller-visible numbers, not row sequence values, so the
//! primary key is not auto-incremented.

use sea_orm::entity::prelude::*;

use crate::tickets::TicketStatus;

#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel)]
#[sea_orm(table_name = "tickets")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: i64,
    pub title: String,
    pub description: String,
    pub category: String,
    pub urgency: String,
    /// Note shown to the reporter
    pub client_message: String,
    /// Note between staff and moderators
    pub internal_message: String,
    pub status: TicketStatus,
    pub reporter_id: i32,
    pub assignee_id: Option<i32>,
    /// Bumped on every accepted change
    pub version: i32,
    pub created_at: i64,
    pub updated_at: i64,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(
        belongs_to = "super::account::Entity",
        from = "Column::ReporterId",
        to = "super::account::Column::Id"
    )]
    Reporter,
    #[sea_orm(
        belongs_to = "super::account::Entity",
        from = "Column::AssigneeId",
        to = "super::account::Column::Id"
    )]
    Assignee,
    #[sea_orm(has_many = "super::audit_record::Entity")]
    History,
}

impl Related<super::audit_record::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::History.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
