//! Staff grouped under a moderator.

use sea_orm::{ColumnTrait, EntityTrait, QueryFilter, QuerySelect};

use super::assignment::Candidate;
use super::machine::Actor;
use super::query::{self, TicketFilter};
use super::service::{TicketService, TicketView};
use crate::db::entities::account::Role;
use crate::db::entities::{team_member, TeamMember};
use crate::error::{Result, ServerError};

async fn member_ids(service: &TicketService, leader_id: i32) -> Result<Vec<i32>> {
    let ids = TeamMember::find()
        .select_only()
        .column(team_member::Column::MemberId)
        .filter(team_member::Column::LeaderId.eq(leader_id))
        .into_tuple()
        .all(service.db())
        .await?;
    Ok(ids)
}

/// The caller's team with each member's current load
pub async fn team_overview(service: &TicketService, leader: &Actor) -> Result<Vec<Candidate>> {
    if leader.role != Role::Mod {
        return Err(ServerError::Unauthorized);
    }
    let ids = member_ids(service, leader.id).await?;
    service.policy().staff_directory(service.db(), Some(&ids)).await
}

/// Tickets assigned to one member of the caller's team
pub async fn member_tickets(
    service: &TicketService,
    leader: &Actor,
    staff_id: i32,
    filter: &TicketFilter,
) -> Result<Vec<TicketView>> {
    if leader.role != Role::Mod {
        return Err(ServerError::Unauthorized);
    }
    if !member_ids(service, leader.id).await?.contains(&staff_id) {
        return Err(ServerError::Unauthorized);
    }

    let member = Actor::new(staff_id, Role::Staff);
    let tickets = query::list_tickets(service.db(), &member, filter).await?;
    service.views(leader, tickets).await
}
