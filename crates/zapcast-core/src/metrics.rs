//! Prometheus metrics for the delivery engine

use prometheus::{Encoder, IntCounterVec, Opts, Registry, TextEncoder};
use zapcast_storage::models::CampaignStatus;

/// Engine counters, registered on a private registry
pub struct DispatchMetrics {
    registry: Registry,
    pub messages_total: IntCounterVec,
    pub campaign_transitions_total: IntCounterVec,
    pub sweeps_total: IntCounterVec,
    pub sweep_errors_total: IntCounterVec,
}

impl DispatchMetrics {
    pub fn new() -> prometheus::Result<Self> {
        let registry = Registry::new();

        let messages_total = IntCounterVec::new(
            Opts::new(
                "zapcast_messages_total",
                "Delivery attempts by outcome (sent, failed, transient)",
            ),
            &["outcome"],
        )?;
        let campaign_transitions_total = IntCounterVec::new(
            Opts::new(
                "zapcast_campaign_transitions_total",
                "Campaign status transitions by target status",
            ),
            &["to"],
        )?;
        let sweeps_total = IntCounterVec::new(
            Opts::new("zapcast_sweeps_total", "Periodic sweeps executed"),
            &["sweep"],
        )?;
        let sweep_errors_total = IntCounterVec::new(
            Opts::new(
                "zapcast_sweep_errors_total",
                "Per-campaign errors isolated during sweeps",
            ),
            &["sweep"],
        )?;

        registry.register(Box::new(messages_total.clone()))?;
        registry.register(Box::new(campaign_transitions_total.clone()))?;
        registry.register(Box::new(sweeps_total.clone()))?;
        registry.register(Box::new(sweep_errors_total.clone()))?;

        Ok(Self {
            registry,
            messages_total,
            campaign_transitions_total,
            sweeps_total,
            sweep_errors_total,
        })
    }

    pub fn record_message(&self, outcome: &str) {
        self.messages_total.with_label_values(&[outcome]).inc();
    }

    pub fn record_transition(&self, to: CampaignStatus) {
        self.campaign_transitions_total
            .with_label_values(&[&to.to_string()])
            .inc();
    }

    pub fn record_sweep(&self, sweep: &str, errors: usize) {
        self.sweeps_total.with_label_values(&[sweep]).inc();
        if errors > 0 {
            self.sweep_errors_total
                .with_label_values(&[sweep])
                .inc_by(errors as u64);
        }
    }

    /// Render all metrics in the Prometheus text format
    pub fn render(&self) -> prometheus::Result<String> {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
    }
}
