//! Campaign lifecycle and dispatch invocation

mod manager;
mod runner;

pub use manager::{CampaignError, CampaignManager};
pub use runner::{CampaignRunner, DispatchInvoker};
