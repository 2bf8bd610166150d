//! Navlight tag parsing and route interpolation.
//!
//! A tag download is a fixed-width text log of the controls a team visited.
//! [`Tag::parse`] recovers the team details and the control schedule, and
//! [`Tag::interpolate`] turns that schedule into a uniformly sampled route
//! with a running score suitable for animation.

use std::fs;
use std::path::Path;

use chrono::TimeDelta;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod batch;
pub mod controls;
pub mod record;
pub mod trajectory;

pub use batch::{aggregate, process_tags, run_batch, Batch, Skipped, TagSource, TrajectoryRecord};
pub use controls::{ControlTable, Coordinate};
pub use record::{
    correct_alignment, format_hms, parse_tag, to_hms, ParticipantMeta, ScheduleRow, HOME,
};
pub use trajectory::{interpolate, Trajectory, TrajectoryPoint};

#[derive(Error, Debug, Clone, PartialEq)]
pub enum NavError {
    #[error("malformed tag header: {0}")]
    MalformedHeader(String),
    #[error("column mismatch: {0}")]
    ColumnMismatch(String),
    #[error("no data rows in tag")]
    EmptyData,
    #[error("invalid {column} value '{value}'")]
    InvalidField { column: String, value: String },
    #[error("control '{0}' missing from control table")]
    UnknownControl(String),
    #[error("no route samples to interpolate")]
    EmptyTrajectory,
    #[error("invalid parameter: {0}")]
    InvalidParameter(String),
    #[error("failed to load control table: {0}")]
    ControlTable(String),
}

/// Longest supported event including its grace window (one week).
const MAX_HORIZON_MINUTES: f64 = 7.0 * 24.0 * 60.0;
const MIN_STEP_MINUTES: f64 = 1.0 / 60.0;

/// Event timing and tag layout settings shared by parsing and interpolation.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Params {
    /// Nominal event duration; the late penalty starts here.
    pub event_hours: f64,
    pub step_minutes: f64,
    /// Window after the nominal end before the official score takes over.
    pub grace_minutes: f64,
    pub penalty_points_per_minute: f64,
    /// Short lines are only re-padded when the shortfall is below this.
    pub pad_slack: usize,
    /// Data rows run this many characters past the header line.
    pub width_overhang: usize,
    pub min_line_len: usize,
}

impl Default for Params {
    fn default() -> Self {
        Self {
            event_hours: 6.0,
            step_minutes: 5.0,
            grace_minutes: 30.0,
            penalty_points_per_minute: 10.0,
            pad_slack: 10,
            width_overhang: 4,
            min_line_len: 40,
        }
    }
}

impl Params {
    /// Load params from JSON; keys that are absent keep their defaults.
    pub fn from_json_path(path: &Path) -> Result<Self, NavError> {
        let text = fs::read_to_string(path).map_err(|e| {
            NavError::InvalidParameter(format!("failed to read {}: {}", path.display(), e))
        })?;
        let params: Params = serde_json::from_str(&text).map_err(|e| {
            NavError::InvalidParameter(format!(
                "{} is not valid params JSON: {}",
                path.display(),
                e
            ))
        })?;
        params.validate()?;
        Ok(params)
    }

    pub fn validate(&self) -> Result<(), NavError> {
        if !self.event_hours.is_finite() || self.event_hours < 0.0 {
            return Err(NavError::InvalidParameter(format!(
                "event_hours must be a non-negative number, got {}",
                self.event_hours
            )));
        }
        if !(MIN_STEP_MINUTES..=MAX_HORIZON_MINUTES).contains(&self.step_minutes) {
            return Err(NavError::InvalidParameter(format!(
                "step_minutes must be between one second and {} minutes, got {}",
                MAX_HORIZON_MINUTES, self.step_minutes
            )));
        }
        if !self.grace_minutes.is_finite() || self.grace_minutes < 0.0 {
            return Err(NavError::InvalidParameter(format!(
                "grace_minutes must be a non-negative number, got {}",
                self.grace_minutes
            )));
        }
        if !self.penalty_points_per_minute.is_finite() || self.penalty_points_per_minute < 0.0 {
            return Err(NavError::InvalidParameter(format!(
                "penalty_points_per_minute must be a non-negative number, got {}",
                self.penalty_points_per_minute
            )));
        }
        let horizon = self.event_hours * 60.0 + self.grace_minutes;
        if horizon > MAX_HORIZON_MINUTES {
            return Err(NavError::InvalidParameter(format!(
                "event plus grace window must not exceed {} minutes, got {}",
                MAX_HORIZON_MINUTES, horizon
            )));
        }
        Ok(())
    }

    pub fn step(&self) -> TimeDelta {
        minutes_to_delta(self.step_minutes)
    }

    pub fn soft_end(&self) -> TimeDelta {
        minutes_to_delta(self.event_hours * 60.0)
    }

    pub fn hard_end(&self) -> TimeDelta {
        self.soft_end() + minutes_to_delta(self.grace_minutes)
    }
}

fn minutes_to_delta(minutes: f64) -> TimeDelta {
    TimeDelta::milliseconds((minutes * 60_000.0).round() as i64)
}

/// One team's tag: parsed once, interpolated at most once.
#[derive(Clone, Debug)]
pub struct Tag {
    pub meta: ParticipantMeta,
    pub schedule: Vec<ScheduleRow>,
    route: Option<Trajectory>,
}

impl Tag {
    pub fn new(meta: ParticipantMeta, schedule: Vec<ScheduleRow>) -> Self {
        Self {
            meta,
            schedule,
            route: None,
        }
    }

    pub fn parse(text: &str, params: &Params) -> Result<Self, NavError> {
        let (meta, schedule) = parse_tag(text, params)?;
        Ok(Self::new(meta, schedule))
    }

    /// Interpolate the route over the event. Later calls return the cached
    /// route and ignore their arguments.
    pub fn interpolate(
        &mut self,
        controls: &ControlTable,
        params: &Params,
    ) -> Result<&Trajectory, NavError> {
        if self.route.is_none() {
            let route = interpolate(&self.schedule, controls, self.meta.score, params)?;
            self.route = Some(route);
        }
        self.route.as_ref().ok_or(NavError::EmptyTrajectory)
    }

    pub fn route(&self) -> Option<&Trajectory> {
        self.route.as_ref()
    }
}

/// Serialize [`TimeDelta`] as whole milliseconds.
pub(crate) mod delta_ms {
    use chrono::TimeDelta;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(delta: &TimeDelta, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_i64(delta.num_milliseconds())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<TimeDelta, D::Error> {
        let ms = i64::deserialize(deserializer)?;
        Ok(TimeDelta::milliseconds(ms))
    }
}
