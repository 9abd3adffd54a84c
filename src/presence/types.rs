use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityType {
    Agent,
    User,
    Session,
    Channel,
    System,
}

impl std::fmt::Display for EntityType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            EntityType::Agent => "agent",
            EntityType::User => "user",
            EntityType::Session => "session",
            EntityType::Channel => "channel",
            EntityType::System => "system",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for EntityType {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "agent" => Ok(EntityType::Agent),
            "user" => Ok(EntityType::User),
            "session" => Ok(EntityType::Session),
            "channel" => Ok(EntityType::Channel),
            "system" => Ok(EntityType::System),
            _ => Err(()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PresenceStatus {
    Online,
    Away,
    Busy,
    DoNotDisturb,
    Offline,
}

impl std::str::FromStr for PresenceStatus {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "online" => Ok(PresenceStatus::Online),
            "away" => Ok(PresenceStatus::Away),
            "busy" => Ok(PresenceStatus::Busy),
            "do-not-disturb" | "dnd" => Ok(PresenceStatus::DoNotDisturb),
            "offline" => Ok(PresenceStatus::Offline),
            _ => Err(()),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Capability {
    pub name: String,
    pub priority: i32,
}

#[derive(Debug, Clone, Serialize)]
pub struct PresenceInfo {
    pub entity_id: String,
    pub entity_type: EntityType,
    pub status: PresenceStatus,
    pub status_message: Option<String>,
    pub activity: Option<String>,
    pub capabilities: Vec<Capability>,
    pub last_seen: DateTime<Utc>,
    pub metadata: HashMap<String, serde_json::Value>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionInfo {
    pub session_id: String,
    pub entity_id: String,
    pub entity_type: EntityType,
    pub connection_id: String,
    pub created_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    pub authenticated: bool,
    pub permissions: Vec<String>,
    pub subscriptions: Vec<String>,
}

/// Reason a presence/session transition happened — carried to subscriber
/// callbacks and log lines, never to clients as a stable code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeReason {
    Explicit,
    Timeout,
    ConnectionClosed,
    Logout,
}
