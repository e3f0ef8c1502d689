use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Latest reconciled view of the tracker's active interval.
///
/// Snapshots are never patched in place: the reconciler builds a fresh value on
/// every poll and publishes it behind an `Arc`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TimerSnapshot {
    pub active: bool,
    pub id: String,
    pub tags: Vec<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub elapsed_seconds: u64,
}

impl TimerSnapshot {
    pub fn idle() -> Self {
        Self {
            active: false,
            id: String::new(),
            tags: Vec::new(),
            started_at: None,
            elapsed_seconds: 0,
        }
    }

    pub fn running(
        id: impl Into<String>,
        tags: Vec<String>,
        started_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Self {
        let elapsed_seconds = (now - started_at).num_seconds().max(0) as u64;
        Self {
            active: true,
            id: id.into(),
            tags: dedup_preserving_order(tags),
            started_at: Some(started_at),
            elapsed_seconds,
        }
    }

    pub fn from_interval(interval: &TrackerInterval, now: DateTime<Utc>) -> Self {
        if interval.end.is_some() {
            return Self::idle();
        }
        Self::running(interval.id.clone(), interval.tags.clone(), interval.start, now)
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.active {
            validate_non_empty(&self.id, "snapshot.id")?;
            if self.started_at.is_none() {
                return Err("snapshot.started_at must be set while active".to_string());
            }
        } else {
            if !self.id.is_empty() {
                return Err("snapshot.id must be empty while inactive".to_string());
            }
            if !self.tags.is_empty() {
                return Err("snapshot.tags must be empty while inactive".to_string());
            }
        }
        Ok(())
    }

    pub fn elapsed_display(&self) -> String {
        let hours = self.elapsed_seconds / 3600;
        let minutes = (self.elapsed_seconds % 3600) / 60;
        let seconds = self.elapsed_seconds % 60;
        format!("{hours}:{minutes:02}:{seconds:02}")
    }
}

impl Default for TimerSnapshot {
    fn default() -> Self {
        Self::idle()
    }
}

/// One interval record from the tracker's export.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TrackerInterval {
    pub id: String,
    pub start: DateTime<Utc>,
    pub end: Option<DateTime<Utc>>,
    pub tags: Vec<String>,
}

impl TrackerInterval {
    pub fn is_open(&self) -> bool {
        self.end.is_none()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct ValidationResult {
    pub is_valid: bool,
    pub errors: Vec<String>,
    pub tags: Vec<String>,
}

/// Notifications pushed to UI subscribers after coordinator operations.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TimerEvent {
    TimerStarted { tags: Vec<String> },
    TimerStopped { last_tags: Vec<String> },
    TagsUpdated { old_tags: Vec<String>, new_tags: Vec<String> },
    TagUpdateFailed { reason: String },
}

pub(crate) fn dedup_preserving_order(tags: Vec<String>) -> Vec<String> {
    let mut seen = std::collections::HashSet::new();
    tags.into_iter()
        .filter(|tag| seen.insert(tag.clone()))
        .collect()
}

fn validate_non_empty(value: &str, field: &str) -> Result<(), String> {
    if value.trim().is_empty() {
        return Err(format!("{field} must not be empty"));
    }
    Ok(())
}
