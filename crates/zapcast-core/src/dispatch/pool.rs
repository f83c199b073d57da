//! Device pool selector
//!
//! Round-robin over a campaign's connected devices. In warming mode each
//! device has its own cool-down derived from its warm-up level; the last send
//! time per device is shared by every campaign in the process.

use chrono::Duration;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::debug;
use zapcast_common::types::{CampaignId, InstanceId, SendingMode, Timestamp};
use zapcast_storage::models::{Campaign, Instance};

/// Result of a device pick
#[derive(Debug, Clone)]
pub enum Pick {
    /// Send through this device now
    Device(Instance),
    /// Devices are connected but all cooling down; the earliest frees up at `until`
    Cooling { until: Timestamp },
    /// No configured device is connected
    NoneConnected,
}

#[derive(Default)]
struct PoolState {
    last_send: HashMap<InstanceId, Timestamp>,
    cursors: HashMap<CampaignId, usize>,
}

/// Device pool selector
#[derive(Clone)]
pub struct DevicePool {
    /// Minimum gap per warm-up level, level 1 first
    warmup_gaps: Arc<Vec<Duration>>,
    state: Arc<Mutex<PoolState>>,
}

impl DevicePool {
    /// Create a selector from the per-level gap table (seconds)
    pub fn new(warmup_gaps_secs: &[u64]) -> Self {
        Self {
            warmup_gaps: Arc::new(
                warmup_gaps_secs
                    .iter()
                    .map(|secs| Duration::seconds(*secs as i64))
                    .collect(),
            ),
            state: Arc::new(Mutex::new(PoolState::default())),
        }
    }

    /// Minimum gap between two sends from a device at `level`
    pub fn gap_for_level(&self, level: i32) -> Duration {
        if self.warmup_gaps.is_empty() {
            return Duration::zero();
        }
        let index = (level.max(1) - 1) as usize;
        self.warmup_gaps[index.min(self.warmup_gaps.len() - 1)]
    }

    /// Choose the device for the campaign's next send and reserve it at `now`.
    ///
    /// `devices` may contain devices in any order and status; only connected
    /// ones listed in the campaign are considered, in the campaign's order.
    pub async fn pick(
        &self,
        campaign: &Campaign,
        devices: &[Instance],
        mode: SendingMode,
        now: Timestamp,
    ) -> Pick {
        let candidates: Vec<&Instance> = campaign
            .instance_ids
            .iter()
            .filter_map(|id| devices.iter().find(|d| d.id == *id))
            .filter(|d| d.is_connected())
            .collect();

        if candidates.is_empty() {
            return Pick::NoneConnected;
        }

        let mut state = self.state.lock().await;
        let start = state.cursors.get(&campaign.id).copied().unwrap_or(0);
        let mut earliest: Option<Timestamp> = None;

        for offset in 0..candidates.len() {
            let index = (start + offset) % candidates.len();
            let device = candidates[index];

            if mode == SendingMode::Warming {
                if let Some(last) = state.last_send.get(&device.id) {
                    let ready_at = *last + self.gap_for_level(device.warmup_level);
                    if ready_at > now {
                        earliest = Some(earliest.map_or(ready_at, |e| e.min(ready_at)));
                        continue;
                    }
                }
            }

            state.cursors.insert(campaign.id, index + 1);
            state.last_send.insert(device.id, now);
            return Pick::Device(device.clone());
        }

        let until = earliest.unwrap_or(now);
        debug!(
            campaign_id = %campaign.id,
            until = %until,
            "All devices cooling down"
        );
        Pick::Cooling { until }
    }

    /// Undo the reservation made by a pick at `reserved_at` that was never used.
    ///
    /// The pick only succeeded because any earlier send was already a full gap
    /// behind, so dropping the entry leaves the device ready at `reserved_at`.
    pub async fn release(&self, device_id: InstanceId, reserved_at: Timestamp) {
        let mut state = self.state.lock().await;
        if state.last_send.get(&device_id) == Some(&reserved_at) {
            state.last_send.remove(&device_id);
        }
    }

    /// Drop the rotation cursor of a campaign that stopped sending
    pub async fn forget(&self, campaign_id: CampaignId) {
        self.state.lock().await.cursors.remove(&campaign_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing;
    use chrono::{TimeZone, Utc};
    use pretty_assertions::assert_eq;

    fn now() -> Timestamp {
        Utc.with_ymd_and_hms(2024, 3, 5, 12, 0, 0).unwrap()
    }

    fn device(level: i32, status: &str) -> Instance {
        testing::instance(level, status, now())
    }

    fn campaign(devices: &[Instance]) -> Campaign {
        testing::campaign_row(devices, now())
    }

    fn picked(pick: Pick) -> InstanceId {
        match pick {
            Pick::Device(d) => d.id,
            other => panic!("expected a device, got {:?}", other),
        }
    }

    #[test]
    fn test_gap_for_level() {
        let pool = DevicePool::new(&[120, 60, 30]);
        assert_eq!(pool.gap_for_level(0), Duration::seconds(120));
        assert_eq!(pool.gap_for_level(1), Duration::seconds(120));
        assert_eq!(pool.gap_for_level(2), Duration::seconds(60));
        assert_eq!(pool.gap_for_level(9), Duration::seconds(30));
        assert_eq!(DevicePool::new(&[]).gap_for_level(3), Duration::zero());
    }

    #[tokio::test]
    async fn test_warming_rotates_and_respects_cooldown() {
        let pool = DevicePool::new(&[120, 60]);
        let slow = device(1, "connected");
        let fast = device(2, "connected");
        let devices = vec![slow.clone(), fast.clone()];
        let campaign = campaign(&devices);

        let first = picked(pool.pick(&campaign, &devices, SendingMode::Warming, now()).await);
        let second = picked(pool.pick(&campaign, &devices, SendingMode::Warming, now()).await);
        assert_eq!(first, slow.id);
        assert_eq!(second, fast.id);

        // Both cooling: the fast device frees up first
        let third = pool.pick(&campaign, &devices, SendingMode::Warming, now()).await;
        match third {
            Pick::Cooling { until } => assert_eq!(until, now() + Duration::seconds(60)),
            other => panic!("expected cooling, got {:?}", other),
        }

        // After 60s only the fast device is eligible, whatever the cursor says
        let later = now() + Duration::seconds(60);
        let fourth = picked(pool.pick(&campaign, &devices, SendingMode::Warming, later).await);
        assert_eq!(fourth, fast.id);

        let fifth = pool.pick(&campaign, &devices, SendingMode::Warming, later).await;
        assert!(matches!(fifth, Pick::Cooling { .. }));
    }

    #[tokio::test]
    async fn test_rapid_picks_never_return_cooling_device() {
        let pool = DevicePool::new(&[30, 10]);
        let devices = vec![device(1, "connected"), device(2, "connected")];
        let campaign = campaign(&devices);
        let mut last_pick: HashMap<InstanceId, Timestamp> = HashMap::new();

        for second in 0..200 {
            let at = now() + Duration::seconds(second);
            if let Pick::Device(d) = pool.pick(&campaign, &devices, SendingMode::Warming, at).await
            {
                if let Some(prev) = last_pick.get(&d.id) {
                    assert!(at - *prev >= pool.gap_for_level(d.warmup_level));
                }
                last_pick.insert(d.id, at);
            }
        }
    }

    #[tokio::test]
    async fn test_direct_mode_round_robin_without_cooldown() {
        let pool = DevicePool::new(&[120]);
        let devices = vec![device(1, "connected"), device(1, "connected")];
        let campaign = campaign(&devices);

        let picks: Vec<InstanceId> = direct_picks(&pool, &campaign, &devices, 4).await;
        assert_eq!(
            picks,
            vec![devices[0].id, devices[1].id, devices[0].id, devices[1].id]
        );
    }

    async fn direct_picks(
        pool: &DevicePool,
        campaign: &Campaign,
        devices: &[Instance],
        n: usize,
    ) -> Vec<InstanceId> {
        let mut picks = Vec::new();
        for _ in 0..n {
            picks.push(picked(
                pool.pick(campaign, devices, SendingMode::Direct, now()).await,
            ));
        }
        picks
    }

    #[tokio::test]
    async fn test_disconnected_devices_are_skipped() {
        let pool = DevicePool::new(&[120]);
        let offline = device(3, "disconnected");
        let online = device(1, "connected");
        let devices = vec![offline.clone(), online.clone()];
        let campaign = campaign(&devices);

        let pick = picked(pool.pick(&campaign, &devices, SendingMode::Direct, now()).await);
        assert_eq!(pick, online.id);

        let all_offline = vec![offline.clone(), device(2, "connecting")];
        let campaign = self::campaign(&all_offline);
        assert!(matches!(
            pool.pick(&campaign, &all_offline, SendingMode::Warming, now()).await,
            Pick::NoneConnected
        ));
    }

    #[tokio::test]
    async fn test_released_pick_does_not_start_cooldown() {
        let pool = DevicePool::new(&[120]);
        let devices = vec![device(1, "connected")];
        let campaign = campaign(&devices);

        let first = picked(pool.pick(&campaign, &devices, SendingMode::Warming, now()).await);
        pool.release(first, now()).await;

        let again = picked(pool.pick(&campaign, &devices, SendingMode::Warming, now()).await);
        assert_eq!(again, first);
        assert!(matches!(
            pool.pick(&campaign, &devices, SendingMode::Warming, now()).await,
            Pick::Cooling { .. }
        ));
    }

    #[tokio::test]
    async fn test_cooldown_is_shared_across_campaigns() {
        let pool = DevicePool::new(&[120]);
        let devices = vec![device(1, "connected")];
        let first = campaign(&devices);
        let second = campaign(&devices);

        picked(pool.pick(&first, &devices, SendingMode::Warming, now()).await);
        assert!(matches!(
            pool.pick(&second, &devices, SendingMode::Warming, now()).await,
            Pick::Cooling { .. }
        ));
    }
}
