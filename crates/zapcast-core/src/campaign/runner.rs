//! Campaign runner - in-process re-invocation of the dispatch loop

use crate::clock::Clock;
use crate::dispatch::{DispatchEngine, RunOutcome, RunSummary};
use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, error, info};
use zapcast_common::types::CampaignId;
use zapcast_common::Result;

/// "Re-invoke the dispatch loop for campaign N"
///
/// Sweeps depend only on this; what actually runs the loop (a task in this
/// process, a queue consumer, an HTTP call) is up to the implementation.
#[async_trait]
pub trait DispatchInvoker: Send + Sync {
    async fn invoke(&self, campaign_id: CampaignId) -> Result<()>;
}

/// Runs dispatch invocations as tokio tasks, one at a time per campaign
#[derive(Clone)]
pub struct CampaignRunner {
    engine: Arc<DispatchEngine>,
    clock: Arc<dyn Clock>,
    in_flight: Arc<Mutex<HashSet<CampaignId>>>,
    reinvoke_delay: Duration,
}

impl CampaignRunner {
    pub fn new(engine: Arc<DispatchEngine>, clock: Arc<dyn Clock>, reinvoke_delay: Duration) -> Self {
        Self {
            engine,
            clock,
            in_flight: Arc::new(Mutex::new(HashSet::new())),
            reinvoke_delay,
        }
    }

    /// Whether a task for the campaign is currently running
    pub async fn is_running(&self, campaign_id: CampaignId) -> bool {
        self.in_flight.lock().await.contains(&campaign_id)
    }

    /// Run invocations back to back while they end on an exhausted budget.
    /// Any other outcome is left to the sweeps.
    pub async fn run_until_paused(&self, campaign_id: CampaignId) -> Result<RunSummary> {
        loop {
            let summary = self.engine.run_campaign(campaign_id).await?;

            let RunOutcome::BudgetExhausted { resume_at } = summary.outcome else {
                return Ok(summary);
            };

            let until_resume = (resume_at - self.clock.now())
                .to_std()
                .unwrap_or_default();
            let wait = until_resume.max(self.reinvoke_delay);
            debug!(
                campaign_id = %campaign_id,
                wait_secs = wait.as_secs(),
                "Budget exhausted, re-invoking"
            );
            self.clock.sleep(wait).await;
        }
    }
}

#[async_trait]
impl DispatchInvoker for CampaignRunner {
    async fn invoke(&self, campaign_id: CampaignId) -> Result<()> {
        if !self.in_flight.lock().await.insert(campaign_id) {
            debug!(campaign_id = %campaign_id, "Dispatch already running");
            return Ok(());
        }

        let runner = self.clone();
        tokio::spawn(async move {
            match runner.run_until_paused(campaign_id).await {
                Ok(summary) => info!(
                    campaign_id = %campaign_id,
                    outcome = ?summary.outcome,
                    "Dispatch run ended"
                ),
                Err(e) => error!("Error dispatching campaign {}: {}", campaign_id, e),
            }
            runner.in_flight.lock().await.remove(&campaign_id);
        });

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{self, Fixture};
    use pretty_assertions::assert_eq;
    use zapcast_common::config::DispatchConfig;

    #[tokio::test]
    async fn test_run_until_paused_reinvokes_on_budget() {
        let fx = Fixture::with_dispatch(DispatchConfig {
            max_messages_per_run: 2,
            ..testing::dispatch_config()
        })
        .await;
        let campaign = fx.sending_campaign(5, |_| {}).await;
        let runner = fx.runner();

        let summary = runner.run_until_paused(campaign.id).await.unwrap();

        assert!(summary.completed());
        assert_eq!(fx.transport.sent_count(), 5);
    }

    #[tokio::test]
    async fn test_invoke_runs_in_background_once() {
        let fx = Fixture::new().await;
        let campaign = fx.sending_campaign(3, |_| {}).await;
        let runner = fx.runner();

        runner.invoke(campaign.id).await.unwrap();
        // Second invoke while the first task has not finished is a no-op
        runner.invoke(campaign.id).await.unwrap();

        for _ in 0..100 {
            if !runner.is_running(campaign.id).await {
                break;
            }
            tokio::task::yield_now().await;
        }

        assert!(!runner.is_running(campaign.id).await);
        assert_eq!(fx.transport.sent_count(), 3);
        assert_eq!(fx.campaign(campaign.id).await.status, "completed");
    }
}
