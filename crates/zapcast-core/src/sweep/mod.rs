//! Periodic sweeps over campaign state
//!
//! Both sweeps isolate errors per campaign: a failure on one campaign is
//! recorded in the report and never stops the rest of the sweep.

mod stall;
mod trigger;
mod worker;

pub use stall::{StallDetector, StallReport};
pub use trigger::{SchedulerTrigger, SweepReport};
pub use worker::SweepWorker;

use serde::Serialize;
use zapcast_common::types::CampaignId;
use zapcast_common::Result;
use zapcast_storage::models::Campaign;
use zapcast_storage::InstanceRegistry;

/// Failure reason for a campaign with an empty device list
pub const NO_INSTANCES_REASON: &str = "no instances configured";

/// Failure reason for a campaign whose devices are all offline
pub const ALL_DISCONNECTED_REASON: &str = "all instances disconnected";

/// Per-campaign error captured during a sweep
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SweepError {
    pub campaign_id: CampaignId,
    pub error: String,
}

/// Device availability of a campaign
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum DeviceHealth {
    NoneConfigured,
    AllDisconnected,
    Available,
}

impl DeviceHealth {
    /// Failure reason when the campaign cannot make progress
    pub(crate) fn failure_reason(&self) -> Option<&'static str> {
        match self {
            DeviceHealth::NoneConfigured => Some(NO_INSTANCES_REASON),
            DeviceHealth::AllDisconnected => Some(ALL_DISCONNECTED_REASON),
            DeviceHealth::Available => None,
        }
    }
}

pub(crate) async fn device_health(
    instances: &dyn InstanceRegistry,
    campaign: &Campaign,
) -> Result<DeviceHealth> {
    if campaign.instance_ids.is_empty() {
        return Ok(DeviceHealth::NoneConfigured);
    }

    let devices = instances.get_many(&campaign.instance_ids).await?;
    if devices.iter().any(|d| d.is_connected()) {
        Ok(DeviceHealth::Available)
    } else {
        Ok(DeviceHealth::AllDisconnected)
    }
}
