//! Dispatch - sending policy, device selection and the per-campaign send loop

mod engine;
mod policy;
mod pool;

pub use engine::{DispatchEngine, RunOutcome, RunSummary};
pub use policy::{DeferReason, PolicyError, PolicySettings, SendWindow, SendingPolicy};
pub use pool::{DevicePool, Pick};
