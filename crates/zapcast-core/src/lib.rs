//! Zapcast Core - Campaign delivery engine
//!
//! This crate provides the sending policy, device selection, the
//! per-campaign dispatch loop, the stall detector and scheduler trigger
//! sweeps, the campaign lifecycle manager and the message transport.

pub mod campaign;
pub mod clock;
pub mod dispatch;
pub mod metrics;
pub mod stores;
pub mod sweep;
pub mod transport;

#[cfg(test)]
pub(crate) mod testing;

pub use campaign::{CampaignError, CampaignManager, CampaignRunner, DispatchInvoker};
pub use clock::{Clock, ManualClock, SystemClock};
pub use dispatch::{
    DeferReason, DevicePool, DispatchEngine, Pick, PolicyError, PolicySettings, RunOutcome,
    RunSummary, SendWindow, SendingPolicy,
};
pub use metrics::DispatchMetrics;
pub use stores::Stores;
pub use sweep::{SchedulerTrigger, StallDetector, StallReport, SweepError, SweepReport, SweepWorker};
pub use transport::{
    FailureClassifier, FailureKind, HttpTransport, OutboundMessage, RequestFailure, SendOutcome,
    StatusClassifier, Transport,
};
