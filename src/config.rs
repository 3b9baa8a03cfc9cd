//! Runtime settings, process arguments and team policy.
//!
//! Settings come from the `system_settings` key/value table and are re-read
//! on every scan and every team operation, so an administrator can move the
//! matching window or the team capacity without restarting anything.
//! Process-level knobs come from CLI flags or the environment.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Local, NaiveDateTime};
use tracing::{info, warn};

use crate::embedding::{Encoder, HashingEncoder, HttpEncoder};

pub const STEP_2_START_AT: &str = "step_2_start_at";
pub const STEP_2_END_AT: &str = "step_2_end_at";
pub const TEAM_MAX_STUDENT_COUNT: &str = "team_max_student_count";

pub const DEFAULT_TEAM_CAPACITY: usize = 4;
pub const DEFAULT_MIN_TEAM_SIZE: usize = 2;

const SETTING_TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Inclusive time range in which the matching engine may scan.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MatchingWindow {
    pub start: NaiveDateTime,
    pub end: NaiveDateTime,
}

impl MatchingWindow {
    pub fn contains(&self, now: NaiveDateTime) -> bool {
        self.start <= now && now <= self.end
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Settings {
    pub matching_window: Option<MatchingWindow>,
    pub team_capacity: usize,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            matching_window: None,
            team_capacity: DEFAULT_TEAM_CAPACITY,
        }
    }
}

impl Settings {
    pub fn from_pairs(values: &HashMap<String, String>) -> Self {
        let start = values.get(STEP_2_START_AT).and_then(|v| parse_setting_time(v));
        let end = values.get(STEP_2_END_AT).and_then(|v| parse_setting_time(v));
        let matching_window = match (start, end) {
            (Some(start), Some(end)) => Some(MatchingWindow { start, end }),
            _ => None,
        };

        let team_capacity = match values.get(TEAM_MAX_STUDENT_COUNT) {
            Some(raw) => raw.trim().parse::<usize>().unwrap_or_else(|_| {
                warn!("ignoring unparsable {TEAM_MAX_STUDENT_COUNT} `{raw}`");
                DEFAULT_TEAM_CAPACITY
            }),
            None => DEFAULT_TEAM_CAPACITY,
        };

        Self {
            matching_window,
            team_capacity,
        }
    }

    pub fn in_matching_window(&self, now: NaiveDateTime) -> bool {
        self.matching_window.is_some_and(|window| window.contains(now))
    }
}

/// Accepts `2024-08-01 09:00:00` (host local time) or RFC 3339, which is
/// converted to host local time so it compares against `Local::now()`.
pub fn parse_setting_time(raw: &str) -> Option<NaiveDateTime> {
    let raw = raw.trim();
    if let Ok(value) = NaiveDateTime::parse_from_str(raw, SETTING_TIME_FORMAT) {
        return Some(value);
    }
    match DateTime::parse_from_rfc3339(raw) {
        Ok(value) => Some(value.with_timezone(&Local).naive_local()),
        Err(_) => {
            warn!("ignoring unparsable setting time `{raw}`");
            None
        }
    }
}

/// Business rules the team state machine applies on top of the stored settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TeamPolicy {
    /// Invalidate every other pending record of a team when a join fills it.
    pub lock_when_nearly_full: bool,
    /// A leave from a team this size or smaller dissolves the team.
    pub min_team_size: usize,
}

impl Default for TeamPolicy {
    fn default() -> Self {
        Self {
            lock_when_nearly_full: true,
            min_team_size: DEFAULT_MIN_TEAM_SIZE,
        }
    }
}

/// Process configuration shared by every subcommand.
#[derive(clap::Args, Debug, Clone)]
pub struct RuntimeArgs {
    /// Postgres connection string
    #[arg(long, env = "DATABASE_URL", hide_env_values = true)]
    pub database_url: String,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    /// Seconds between matching scans in watch mode
    #[arg(long, env = "SCAN_INTERVAL_SECS", default_value = "10")]
    pub scan_interval_secs: u64,

    /// Close every other pending record of a team when a join fills it
    #[arg(long, env = "TEAM_LOCK_WHEN_NEARLY_FULL", default_value = "true")]
    pub team_lock_when_nearly_full: bool,

    /// A leave from a team this size or smaller dissolves it
    #[arg(long, env = "TEAM_MIN_SIZE", default_value = "2")]
    pub team_min_size: usize,

    /// OpenAI-style embeddings endpoint; the hashing encoder is used when unset
    #[arg(long, env = "EMBEDDING_URL")]
    pub embedding_url: Option<String>,

    /// Model name sent to the embeddings endpoint
    #[arg(long, env = "EMBEDDING_MODEL", default_value = "text-embedding-3-small")]
    pub embedding_model: String,

    /// Dimension of the hashing encoder
    #[arg(long, env = "EMBEDDING_DIM", default_value = "256")]
    pub embedding_dim: usize,
}

impl RuntimeArgs {
    pub fn log_filter(&self) -> String {
        format!("warn,roommate_match={}", self.log_level)
    }

    pub fn scan_interval(&self) -> Duration {
        Duration::from_secs(self.scan_interval_secs.max(1))
    }

    pub fn team_policy(&self) -> TeamPolicy {
        TeamPolicy {
            lock_when_nearly_full: self.team_lock_when_nearly_full,
            min_team_size: self.team_min_size,
        }
    }

    pub fn encoder(&self) -> anyhow::Result<Arc<dyn Encoder>> {
        match &self.embedding_url {
            Some(url) => {
                info!("using embedding endpoint {url} ({})", self.embedding_model);
                Ok(Arc::new(HttpEncoder::new(url.clone(), self.embedding_model.clone())?))
            }
            None => Ok(Arc::new(HashingEncoder::new(self.embedding_dim))),
        }
    }
}
