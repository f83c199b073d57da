//! Sweep worker - drives the trigger and the stall detector on a fixed tick

use super::{SchedulerTrigger, StallDetector};
use std::sync::Arc;
use tokio::time::{interval, Duration, MissedTickBehavior};
use tracing::{error, info};
use zapcast_common::config::SchedulerConfig;

/// Periodic sweep worker
pub struct SweepWorker {
    trigger: Arc<SchedulerTrigger>,
    stall: Arc<StallDetector>,
    tick_secs: u64,
    stall_every_ticks: u64,
}

impl SweepWorker {
    pub fn new(
        trigger: Arc<SchedulerTrigger>,
        stall: Arc<StallDetector>,
        config: &SchedulerConfig,
    ) -> Self {
        Self {
            trigger,
            stall,
            tick_secs: config.tick_secs.max(1),
            stall_every_ticks: u64::from(config.stall_every_ticks.max(1)),
        }
    }

    /// Run the sweep loop forever
    pub async fn run(&self) {
        let mut ticker = interval(Duration::from_secs(self.tick_secs));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(
            "Sweep worker started (interval: {}s, stall check every {} ticks)",
            self.tick_secs, self.stall_every_ticks
        );

        let mut tick: u64 = 0;
        loop {
            ticker.tick().await;
            self.run_once(tick).await;
            tick = tick.wrapping_add(1);
        }
    }

    /// One tick: the trigger always runs, the stall detector every N ticks
    pub async fn run_once(&self, tick: u64) {
        if let Err(e) = self.trigger.sweep().await {
            error!("Error running trigger sweep: {}", e);
        }

        if tick % self.stall_every_ticks == 0 {
            if let Err(e) = self.stall.detect_and_recover().await {
                error!("Error running stall detection: {}", e);
            }
        }
    }
}
