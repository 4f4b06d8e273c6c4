//! Staff grouped under a moderator

use sea_orm::entity::prelude::*;

#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel)]
#[sea_orm(table_name = "team_members")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i32,
    pub leader_id: i32,
    pub member_id: i32,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(
        belongs_to = "super::account::Entity",
        from = "Column::LeaderId",
        to = "super::account::Column::Id"
    )]
    Leader,
    #[sea_orm(
        belongs_to = "super::account::Entity",
        from = "Column::MemberId",
        to = "super::account::Column::Id"
    )]
    Member,
}

impl ActiveModelBehavior for ActiveModel {}
