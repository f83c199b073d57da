//! Sending policy - time windows, daily cap and pacing for one campaign
//!
//! All arithmetic happens in the campaign's own timezone. The process-local
//! timezone is never consulted.

use chrono::{DateTime, Datelike, Duration, NaiveDate, NaiveDateTime, TimeZone, Timelike, Utc};
use chrono_tz::Tz;
use rand::Rng;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use zapcast_common::types::Timestamp;
use zapcast_storage::models::{Campaign, CreateCampaign};
use zapcast_storage::models::{
    DEFAULT_END_HOUR, DEFAULT_INTERVAL_MAX_SECS, DEFAULT_INTERVAL_MIN_SECS, DEFAULT_START_HOUR,
    DEFAULT_TIMEZONE, DEFAULT_WEEKDAYS,
};

/// How far ahead to look for the next open window. Any valid policy opens
/// within a week; one extra day covers DST shifts.
const WINDOW_SEARCH_HOURS: i64 = 8 * 24;

/// Sending policy errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PolicyError {
    #[error("Unknown timezone: {0}")]
    InvalidTimezone(String),

    #[error("Hour out of range 0-23: {0}")]
    InvalidHour(i32),

    #[error("Weekday out of range 0-6: {0}")]
    InvalidWeekday(i32),

    #[error("Message interval must be non-negative (min {min}, max {max})")]
    InvalidInterval { min: i32, max: i32 },

    #[error("Policy never opens a sending window")]
    NoWindow,
}

/// Why sending is not allowed right now
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeferReason {
    DisallowedDay,
    OutsideHours,
    DailyCapReached,
}

impl std::fmt::Display for DeferReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeferReason::DisallowedDay => write!(f, "disallowed_day"),
            DeferReason::OutsideHours => write!(f, "outside_hours"),
            DeferReason::DailyCapReached => write!(f, "daily_cap_reached"),
        }
    }
}

/// Answer to "may we send now?"
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendWindow {
    /// Send now, then wait `delay` before the next send
    Allowed { delay: std::time::Duration },
    /// Not before `retry_at`
    DeniedUntil {
        retry_at: Timestamp,
        reason: DeferReason,
    },
}

/// Raw policy fields as stored on a campaign
#[derive(Debug, Clone)]
pub struct PolicySettings {
    pub timezone: String,
    pub allowed_start_hour: i32,
    pub allowed_end_hour: i32,
    /// 0 = Sunday .. 6 = Saturday, empty = every day
    pub allowed_days: Vec<i32>,
    pub message_interval_min: i32,
    pub message_interval_max: i32,
    /// Absent or non-positive means uncapped
    pub daily_limit: Option<i32>,
}

impl From<&Campaign> for PolicySettings {
    fn from(campaign: &Campaign) -> Self {
        Self {
            timezone: campaign.timezone.clone(),
            allowed_start_hour: campaign.allowed_start_hour,
            allowed_end_hour: campaign.allowed_end_hour,
            allowed_days: campaign.allowed_days.clone(),
            message_interval_min: campaign.message_interval_min,
            message_interval_max: campaign.message_interval_max,
            daily_limit: campaign.daily_limit,
        }
    }
}

impl From<&CreateCampaign> for PolicySettings {
    fn from(input: &CreateCampaign) -> Self {
        Self {
            timezone: input
                .timezone
                .clone()
                .unwrap_or_else(|| DEFAULT_TIMEZONE.to_string()),
            allowed_start_hour: input.allowed_start_hour.unwrap_or(DEFAULT_START_HOUR),
            allowed_end_hour: input.allowed_end_hour.unwrap_or(DEFAULT_END_HOUR),
            allowed_days: input
                .allowed_days
                .clone()
                .unwrap_or_else(|| DEFAULT_WEEKDAYS.to_vec()),
            message_interval_min: input
                .message_interval_min
                .unwrap_or(DEFAULT_INTERVAL_MIN_SECS),
            message_interval_max: input
                .message_interval_max
                .unwrap_or(DEFAULT_INTERVAL_MAX_SECS),
            daily_limit: input.daily_limit,
        }
    }
}

/// Validated sending policy
#[derive(Debug, Clone)]
pub struct SendingPolicy {
    timezone: Tz,
    start_hour: u32,
    end_hour: u32,
    allowed_days: Vec<u32>,
    interval_min_secs: u64,
    interval_max_secs: u64,
    daily_limit: Option<i32>,
}

impl SendingPolicy {
    /// Validate raw settings
    pub fn parse(settings: &PolicySettings) -> Result<Self, PolicyError> {
        let timezone: Tz = settings
            .timezone
            .parse()
            .map_err(|_| PolicyError::InvalidTimezone(settings.timezone.clone()))?;

        let start_hour = hour(settings.allowed_start_hour)?;
        let end_hour = hour(settings.allowed_end_hour)?;

        let mut allowed_days = Vec::with_capacity(settings.allowed_days.len());
        for &day in &settings.allowed_days {
            if !(0..=6).contains(&day) {
                return Err(PolicyError::InvalidWeekday(day));
            }
            allowed_days.push(day as u32);
        }

        let (min, max) = (settings.message_interval_min, settings.message_interval_max);
        if min < 0 || max < 0 {
            return Err(PolicyError::InvalidInterval { min, max });
        }
        let (min, max) = if min > max { (max, min) } else { (min, max) };

        Ok(Self {
            timezone,
            start_hour,
            end_hour,
            allowed_days,
            interval_min_secs: min as u64,
            interval_max_secs: max as u64,
            daily_limit: settings.daily_limit.filter(|limit| *limit > 0),
        })
    }

    /// Policy of a stored campaign
    pub fn for_campaign(campaign: &Campaign) -> Result<Self, PolicyError> {
        Self::parse(&PolicySettings::from(campaign))
    }

    /// Calendar date of `now` in the campaign's timezone
    pub fn local_date(&self, now: Timestamp) -> NaiveDate {
        now.with_timezone(&self.timezone).date_naive()
    }

    /// Decide whether a send may happen at `now`, given the sends already
    /// counted for today's local date.
    pub fn next_send_window(
        &self,
        now: Timestamp,
        sent_today: i32,
    ) -> Result<SendWindow, PolicyError> {
        self.next_send_window_with(now, sent_today, &mut rand::thread_rng())
    }

    pub fn next_send_window_with<R: Rng + ?Sized>(
        &self,
        now: Timestamp,
        sent_today: i32,
        rng: &mut R,
    ) -> Result<SendWindow, PolicyError> {
        if self.daily_cap_reached(sent_today) {
            return Ok(SendWindow::DeniedUntil {
                retry_at: self.next_local_midnight(now)?,
                reason: DeferReason::DailyCapReached,
            });
        }

        let local = now.with_timezone(&self.timezone);
        if let Some(reason) = self.window_block(&local) {
            return Ok(SendWindow::DeniedUntil {
                retry_at: self.next_window_start(now)?,
                reason,
            });
        }

        Ok(SendWindow::Allowed {
            delay: self.draw_delay(rng),
        })
    }

    /// Pause to apply after a send, uniform over the configured interval
    pub fn draw_delay<R: Rng + ?Sized>(&self, rng: &mut R) -> std::time::Duration {
        let secs = if self.interval_min_secs == self.interval_max_secs {
            self.interval_min_secs
        } else {
            rng.gen_range(self.interval_min_secs..=self.interval_max_secs)
        };
        std::time::Duration::from_secs(secs)
    }

    /// Midpoint of the pacing interval
    pub fn mean_delay(&self) -> Duration {
        Duration::seconds(((self.interval_min_secs + self.interval_max_secs) / 2) as i64)
    }

    /// Earliest instant at or after `from` inside the day/hour window
    pub fn next_window_start(&self, from: Timestamp) -> Result<Timestamp, PolicyError> {
        let local = from.with_timezone(&self.timezone);
        if self.window_block(&local).is_none() {
            return Ok(from);
        }

        let top_of_hour = local
            .date_naive()
            .and_hms_opt(local.hour(), 0, 0)
            .ok_or(PolicyError::NoWindow)?;

        for step in 1..=WINDOW_SEARCH_HOURS {
            let Some(candidate) = self.resolve(top_of_hour + Duration::hours(step)) else {
                // Local hour skipped by a DST jump
                continue;
            };
            if self.window_block(&candidate).is_none() {
                return Ok(candidate.with_timezone(&Utc));
            }
        }

        Err(PolicyError::NoWindow)
    }

    /// Instant the daily counter resets: the next local midnight, or the
    /// first existing hour after it when midnight falls in a DST gap.
    pub fn next_local_midnight(&self, now: Timestamp) -> Result<Timestamp, PolicyError> {
        let tomorrow = self
            .local_date(now)
            .succ_opt()
            .and_then(|d| d.and_hms_opt(0, 0, 0))
            .ok_or(PolicyError::NoWindow)?;

        (0..24)
            .find_map(|h| self.resolve(tomorrow + Duration::hours(h)))
            .map(|t| t.with_timezone(&Utc))
            .ok_or(PolicyError::NoWindow)
    }

    fn daily_cap_reached(&self, sent_today: i32) -> bool {
        matches!(self.daily_limit, Some(limit) if sent_today >= limit)
    }

    fn window_block(&self, local: &DateTime<Tz>) -> Option<DeferReason> {
        let day = local.weekday().num_days_from_sunday();
        if !self.allowed_days.is_empty() && !self.allowed_days.contains(&day) {
            return Some(DeferReason::DisallowedDay);
        }
        if !self.hour_allowed(local.hour()) {
            return Some(DeferReason::OutsideHours);
        }
        None
    }

    fn hour_allowed(&self, hour: u32) -> bool {
        let (start, end) = (self.start_hour, self.end_hour);
        if start == end {
            true
        } else if start < end {
            start <= hour && hour < end
        } else {
            // Overnight window, e.g. 22 -> 6
            hour >= start || hour < end
        }
    }

    fn resolve(&self, naive: NaiveDateTime) -> Option<DateTime<Tz>> {
        self.timezone.from_local_datetime(&naive).earliest()
    }
}

fn hour(value: i32) -> Result<u32, PolicyError> {
    if (0..=23).contains(&value) {
        Ok(value as u32)
    } else {
        Err(PolicyError::InvalidHour(value))
    }
}
