use crate::domain::models::{TrackerInterval, dedup_preserving_order};
use crate::infrastructure::error::GatewayError;
use chrono::{DateTime, NaiveDateTime, Utc};
use serde::Deserialize;

const COMPACT_TIMESTAMP_FORMAT: &str = "%Y%m%dT%H%M%SZ";

#[derive(Debug, Deserialize)]
struct ExportRecord {
    id: Option<ExportId>,
    start: String,
    end: Option<String>,
    #[serde(default)]
    tags: Vec<String>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum ExportId {
    Number(u64),
    Text(String),
}

impl ExportId {
    fn render(self) -> String {
        match self {
            Self::Number(value) => format!("@{value}"),
            Self::Text(value) => value.trim().to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ActiveInterval<'a> {
    None,
    One(&'a TrackerInterval),
    Ambiguous(usize),
}

pub fn parse_export(output: &str) -> Result<Vec<TrackerInterval>, GatewayError> {
    if output.trim().is_empty() {
        return Ok(Vec::new());
    }

    let records: Vec<ExportRecord> = serde_json::from_str(output)
        .map_err(|error| GatewayError::MalformedOutput(format!("invalid export json: {error}")))?;

    records
        .into_iter()
        .enumerate()
        .map(|(index, record)| {
            let start = parse_timestamp(&record.start).ok_or_else(|| {
                GatewayError::MalformedOutput(format!(
                    "record {index}: invalid start '{}'",
                    record.start
                ))
            })?;
            let end = match record.end.as_deref() {
                Some(raw) => Some(parse_timestamp(raw).ok_or_else(|| {
                    GatewayError::MalformedOutput(format!("record {index}: invalid end '{raw}'"))
                })?),
                None => None,
            };
            let id = record.id.map(ExportId::render).unwrap_or_default();
            if end.is_none() && id.is_empty() {
                return Err(GatewayError::MalformedOutput(format!(
                    "record {index}: open interval has no id"
                )));
            }
            let tags = record
                .tags
                .into_iter()
                .map(|tag| tag.trim().to_string())
                .filter(|tag| !tag.is_empty())
                .collect();

            Ok(TrackerInterval {
                id,
                start,
                end,
                tags: dedup_preserving_order(tags),
            })
        })
        .collect()
}

pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if let Ok(naive) = NaiveDateTime::parse_from_str(raw, COMPACT_TIMESTAMP_FORMAT) {
        return Some(naive.and_utc());
    }
    DateTime::parse_from_rfc3339(raw)
        .ok()
        .map(|value| value.with_timezone(&Utc))
}

pub fn active_interval(intervals: &[TrackerInterval]) -> ActiveInterval<'_> {
    let mut open = intervals.iter().filter(|interval| interval.is_open());
    match (open.next(), open.next()) {
        (None, _) => ActiveInterval::None,
        (Some(interval), None) => ActiveInterval::One(interval),
        (Some(_), Some(_)) => ActiveInterval::Ambiguous(2 + open.count()),
    }
}

/// Tags of the latest `limit` intervals, oldest first, without repeats.
pub fn recent_tags(intervals: &[TrackerInterval], limit: usize) -> Vec<String> {
    let mut ordered: Vec<&TrackerInterval> = intervals.iter().collect();
    ordered.sort_by_key(|interval| interval.start);
    let skip = ordered.len().saturating_sub(limit);
    let tags = ordered
        .into_iter()
        .skip(skip)
        .flat_map(|interval| interval.tags.iter().cloned())
        .collect();
    dedup_preserving_order(tags)
}
