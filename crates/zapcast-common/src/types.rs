//! Common types for Zapcast

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unique identifier for tenants (campaign owners)
pub type TenantId = Uuid;

/// Unique identifier for campaigns
pub type CampaignId = Uuid;

/// Unique identifier for campaign messages
pub type CampaignMessageId = Uuid;

/// Unique identifier for sending devices ("instances")
pub type InstanceId = Uuid;

/// Unique identifier for contacts (recipients)
pub type ContactId = Uuid;

/// Timestamp wrapper
pub type Timestamp = DateTime<Utc>;

/// Sending mode of a campaign
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SendingMode {
    /// Per-device throttling derived from warm-up level
    #[default]
    Warming,
    /// No per-device throttling
    Direct,
}

impl std::fmt::Display for SendingMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SendingMode::Warming => write!(f, "warming"),
            SendingMode::Direct => write!(f, "direct"),
        }
    }
}

impl std::str::FromStr for SendingMode {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "warming" => Ok(SendingMode::Warming),
            "direct" => Ok(SendingMode::Direct),
            _ => Err(crate::Error::Validation(format!("Invalid sending mode: {}", s))),
        }
    }
}
