use std::collections::{BTreeMap, HashSet};

use ordered_float::OrderedFloat;
use serde::Serialize;
use tracing::{debug, info, warn};

use super::{ControlTable, NavError, Params, Tag};

/// Raw tag text with a name used in log messages.
#[derive(Clone, Debug)]
pub struct TagSource {
    pub name: String,
    pub text: String,
}

#[derive(Clone, Debug)]
pub struct Skipped {
    pub name: String,
    pub error: NavError,
}

#[derive(Clone, Debug, Default)]
pub struct Batch {
    /// Tags with an interpolated route, in input order.
    pub tags: Vec<Tag>,
    pub skipped: Vec<Skipped>,
}

/// Parse and interpolate every source. Bad tags are skipped and reported,
/// never fatal to the batch.
pub fn run_batch(sources: Vec<TagSource>, controls: &ControlTable, params: &Params) -> Batch {
    let parsed = sources
        .into_iter()
        .map(|source| {
            let tag = Tag::parse(&source.text, params);
            (source.name, tag)
        })
        .collect();
    process_tags(parsed, controls, params)
}

/// Interpolate already parsed tags in order. Only the first tag seen for a
/// team number is kept.
pub fn process_tags(
    parsed: Vec<(String, Result<Tag, NavError>)>,
    controls: &ControlTable,
    params: &Params,
) -> Batch {
    let mut batch = Batch::default();
    let mut teams = HashSet::new();

    for (name, result) in parsed {
        let mut tag = match result {
            Ok(tag) => tag,
            Err(error) => {
                warn!("Skipping {}: {}", name, error);
                batch.skipped.push(Skipped { name, error });
                continue;
            }
        };
        let team = tag.meta.team;
        if !teams.insert(team) {
            info!("Ignoring {}: team {} already loaded", name, team);
            continue;
        }
        match tag.interpolate(controls, params) {
            Ok(route) => debug!("{}: team {} route has {} samples", name, team, route.len()),
            Err(error) => {
                warn!("Skipping {}: {}", name, error);
                batch.skipped.push(Skipped { name, error });
                continue;
            }
        }
        batch.tags.push(tag);
    }

    batch
}

/// One team's position and score at one timestamp, ready for rendering.
#[derive(Clone, Debug, Serialize, PartialEq)]
pub struct TrajectoryRecord {
    pub team: u32,
    pub time_s: i64,
    /// `HH:MM`.
    pub time_label: String,
    pub control: String,
    pub x: i64,
    pub y: i64,
    pub score: f64,
    /// Best score of any team at this timestamp.
    pub max_score: f64,
    pub leader: bool,
}

/// Flatten every interpolated route into per-team records and mark the
/// leaders at each timestamp. Coordinates are truncated to whole pixels.
pub fn aggregate(tags: &[Tag]) -> Vec<TrajectoryRecord> {
    let mut best: BTreeMap<i64, OrderedFloat<f64>> = BTreeMap::new();
    for tag in tags {
        for point in tag.route().into_iter().flat_map(|r| r.iter()) {
            let entry = best
                .entry(point.time.num_milliseconds())
                .or_insert(OrderedFloat(f64::NEG_INFINITY));
            *entry = (*entry).max(OrderedFloat(point.score));
        }
    }

    let mut records = Vec::new();
    for tag in tags {
        let Some(route) = tag.route() else {
            continue;
        };
        for point in route.iter() {
            let max_score = best
                .get(&point.time.num_milliseconds())
                .map_or(point.score, |m| m.into_inner());
            let seconds = point.time.num_seconds();
            records.push(TrajectoryRecord {
                team: tag.meta.team,
                time_s: seconds,
                time_label: format!("{:02}:{:02}", seconds / 3600, (seconds % 3600) / 60),
                control: point.control.clone(),
                x: point.x as i64,
                y: point.y as i64,
                score: point.score,
                max_score,
                leader: point.score == max_score && point.score > 0.0,
            });
        }
    }
    records
}
