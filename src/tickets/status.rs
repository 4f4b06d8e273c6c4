//! Ticket status values.
//!
//! Every status string that reaches the database goes through this enum, so
//! the table can only ever hold one of these values.

use std::fmt;
use std::str::FromStr;

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

#[derive(
    Copy, Clone, Debug, PartialEq, Eq, Hash, EnumIter, DeriveActiveEnum, Serialize, Deserialize,
)]
#[sea_orm(rs_type = "String", db_type = "String(StringLen::N(32))")]
#[serde(rename_all = "snake_case")]
pub enum TicketStatus {
    #[sea_orm(string_value = "open")]
    Open,
    /// Assigned to a staff member, waiting in their queue
    #[sea_orm(string_value = "assigned")]
    Assigned,
    #[sea_orm(string_value = "working")]
    Working,
    #[sea_orm(string_value = "pending")]
    Pending,
    /// Work submitted, waiting for the reporter to check it
    #[sea_orm(string_value = "review")]
    Review,
    #[sea_orm(string_value = "resolved")]
    Resolved,
    #[sea_orm(string_value = "closed")]
    Closed,
    #[sea_orm(string_value = "escalated_upper")]
    EscalatedUpper,
    #[sea_orm(string_value = "out_of_service")]
    OutOfService,
}

impl TicketStatus {
    pub const ALL: [TicketStatus; 9] = [
        TicketStatus::Open,
        TicketStatus::Assigned,
        TicketStatus::Working,
        TicketStatus::Pending,
        TicketStatus::Review,
        TicketStatus::Resolved,
        TicketStatus::Closed,
        TicketStatus::EscalatedUpper,
        TicketStatus::OutOfService,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            TicketStatus::Open => "open",
            TicketStatus::Assigned => "assigned",
            TicketStatus::Working => "working",
            TicketStatus::Pending => "pending",
            TicketStatus::Review => "review",
            TicketStatus::Resolved => "resolved",
            TicketStatus::Closed => "closed",
            TicketStatus::EscalatedUpper => "escalated_upper",
            TicketStatus::OutOfService => "out_of_service",
        }
    }

    /// No lifecycle action leaves this status
    pub fn is_terminal(&self) -> bool {
        matches!(self, TicketStatus::Closed)
    }

    /// Statuses that are neither terminal nor `exclude`
    pub fn non_terminal_except(exclude: TicketStatus) -> Vec<TicketStatus> {
        Self::ALL
            .iter()
            .copied()
            .filter(|s| !s.is_terminal() && *s != exclude)
            .collect()
    }
}

impl fmt::Display for TicketStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TicketStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim().to_ascii_lowercase();
        Self::ALL
            .iter()
            .copied()
            .find(|status| status.as_str() == wanted)
            .ok_or_else(|| format!("unknown ticket status '{}'", s.trim()))
    }
}

/// Parse a comma-separated status list, e.g. `resolved,closed`
pub fn parse_status_list(raw: &str) -> Result<Vec<TicketStatus>, String> {
    let mut statuses = Vec::new();
    for part in raw.split(',').map(str::trim).filter(|p| !p.is_empty()) {
        let status: TicketStatus = part.parse()?;
        if !statuses.contains(&status) {
            statuses.push(status);
        }
    }
    Ok(statuses)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_round_trips_every_status() {
        for status in TicketStatus::ALL {
            assert_eq!(status.as_str().parse::<TicketStatus>().unwrap(), status);
        }
        assert_eq!(" Closed ".parse::<TicketStatus>().unwrap(), TicketStatus::Closed);
        assert!("Assign-in_queue".parse::<TicketStatus>().is_err());
    }

    #[test]
    fn test_only_closed_is_terminal() {
        let terminal: Vec<_> = TicketStatus::ALL.iter().filter(|s| s.is_terminal()).collect();
        assert_eq!(terminal, vec![&TicketStatus::Closed]);
    }

    #[test]
    fn test_non_terminal_except() {
        let from = TicketStatus::non_terminal_except(TicketStatus::EscalatedUpper);
        assert!(!from.contains(&TicketStatus::Closed));
        assert!(!from.contains(&TicketStatus::EscalatedUpper));
        assert!(from.contains(&TicketStatus::OutOfService));
        assert_eq!(from.len(), 7);
    }

    #[test]
    fn test_parse_status_list() {
        assert_eq!(
            parse_status_list("resolved, closed,closed").unwrap(),
            vec![TicketStatus::Resolved, TicketStatus::Closed]
        );
        assert!(parse_status_list("").unwrap().is_empty());
        assert!(parse_status_list("resolved,rejected").is_err());
    }

    #[test]
    fn test_serde_uses_snake_case() {
        let json = serde_json::to_string(&TicketStatus::OutOfService).unwrap();
        assert_eq!(json, "\"out_of_service\"");
        let back: TicketStatus = serde_json::from_str("\"escalated_upper\"").unwrap();
        assert_eq!(back, TicketStatus::EscalatedUpper);
    }
}
