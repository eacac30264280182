use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::silence::Silence;

/// Camera angle / content a stream source carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SourceVariant {
    #[serde(rename = "CAM")]
    Camera,
    #[serde(rename = "PRES")]
    Presentation,
    /// Camera and presentation side by side. Gets silence analysis.
    #[serde(rename = "COMB")]
    Combined,
}

impl SourceVariant {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceVariant::Camera => "CAM",
            SourceVariant::Presentation => "PRES",
            SourceVariant::Combined => "COMB",
        }
    }

    pub fn all() -> [SourceVariant; 3] {
        [
            SourceVariant::Combined,
            SourceVariant::Presentation,
            SourceVariant::Camera,
        ]
    }
}

impl fmt::Display for SourceVariant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SourceVariant {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "CAM" => Ok(SourceVariant::Camera),
            "PRES" => Ok(SourceVariant::Presentation),
            "COMB" => Ok(SourceVariant::Combined),
            other => Err(format!("unknown source variant: {}", other)),
        }
    }
}

/// A capture source of a stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamSource {
    pub variant: SourceVariant,
    pub url: String,
}

/// Input for creating a stream record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewStream {
    pub course_slug: String,
    /// Human-readable lecture name, used in job descriptions and file names.
    pub name: String,
    #[serde(default)]
    pub tenant: Option<String>,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    #[serde(default = "default_true")]
    pub publish_live: bool,
    #[serde(default = "default_true")]
    pub publish_vod: bool,
    #[serde(default)]
    pub sources: Vec<StreamSource>,
    /// Pre-recorded file to replay as a live stream at `start`.
    #[serde(default)]
    pub premiere_file: Option<String>,
}

fn default_true() -> bool {
    true
}

/// A stream that should be dispatched now.
///
/// `sources` only lists sources that have not been handed to a worker yet.
#[derive(Debug, Clone, PartialEq)]
pub struct DueStream {
    pub stream_id: i64,
    pub course_slug: String,
    pub name: String,
    pub tenant: Option<String>,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub publish_live: bool,
    pub publish_vod: bool,
    pub sources: Vec<StreamSource>,
}

/// A premiere that should be dispatched now.
#[derive(Debug, Clone, PartialEq)]
pub struct DuePremiere {
    pub stream_id: i64,
    pub course_slug: String,
    pub name: String,
    pub tenant: Option<String>,
    pub file_path: String,
    pub end: DateTime<Utc>,
}

/// Per-source state of a stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceState {
    pub variant: SourceVariant,
    pub url: String,
    pub worker_id: Option<String>,
    pub slot_name: Option<String>,
    pub live_url: Option<String>,
    pub finished_at: Option<DateTime<Utc>>,
    pub recording_path: Option<String>,
    pub duration_secs: Option<f64>,
    pub vod_url: Option<String>,
    pub thumbnail_url: Option<String>,
}

/// Full stream record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Stream {
    pub id: i64,
    pub course_slug: String,
    pub name: String,
    pub tenant: Option<String>,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub publish_live: bool,
    pub publish_vod: bool,
    pub premiere_file: Option<String>,
    pub premiere_worker: Option<String>,
    pub premiere_slot: Option<String>,
    pub sources: Vec<SourceState>,
    pub silences: Vec<Silence>,
}

impl Stream {
    /// Slot names currently recorded for this stream (sources and premiere).
    pub fn slot_names(&self) -> Vec<String> {
        self.sources
            .iter()
            .filter_map(|s| s.slot_name.clone())
            .chain(self.premiere_slot.clone())
            .collect()
    }

    /// When the last dispatched source finished, if all of them have.
    pub fn finished_at(&self) -> Option<DateTime<Utc>> {
        let dispatched: Vec<_> = self
            .sources
            .iter()
            .filter(|s| s.worker_id.is_some())
            .collect();
        if dispatched.is_empty() {
            return None;
        }
        dispatched
            .iter()
            .map(|s| s.finished_at)
            .collect::<Option<Vec<_>>>()
            .and_then(|times| times.into_iter().max())
    }
}
