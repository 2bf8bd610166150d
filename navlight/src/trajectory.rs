use chrono::TimeDelta;
use ndarray::Array1;
use serde::{Deserialize, Serialize};

use super::{ControlTable, NavError, Params, ScheduleRow};

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct TrajectoryPoint {
    #[serde(with = "crate::delta_ms", rename = "time_ms")]
    pub time: TimeDelta,
    /// Last control visited at or before `time`.
    pub control: String,
    pub x: f64,
    pub y: f64,
    pub score: f64,
}

/// Route sampled on a uniform time grid from the event start through the
/// end of the grace window.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct Trajectory {
    pub points: Vec<TrajectoryPoint>,
}

impl Trajectory {
    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, TrajectoryPoint> {
        self.points.iter()
    }

    pub fn at(&self, time: TimeDelta) -> Option<&TrajectoryPoint> {
        self.points
            .binary_search_by(|p| p.time.cmp(&time))
            .ok()
            .map(|idx| &self.points[idx])
    }
}

#[derive(Clone, Debug)]
struct Visit<'a> {
    time: TimeDelta,
    control: &'a str,
    x: f64,
    y: f64,
    points: f64,
}

#[derive(Clone, Debug)]
struct Resampled<'a> {
    times: Vec<TimeDelta>,
    controls: Vec<&'a str>,
    x: Array1<f64>,
    y: Array1<f64>,
    points: Array1<f64>,
}

/// Resample a schedule onto the time grid and apply the late penalty.
///
/// Positions are interpolated linearly between visits and held at the
/// nearest visit outside them; points are forward-filled. Past the nominal
/// end, points drop continuously at the penalty rate. From the end of the
/// grace window on, the official `final_score` is used.
pub fn interpolate(
    schedule: &[ScheduleRow],
    controls: &ControlTable,
    final_score: u32,
    params: &Params,
) -> Result<Trajectory, NavError> {
    params.validate()?;

    let mut visits = Vec::with_capacity(schedule.len());
    for row in schedule {
        let coord = controls
            .get(&row.control)
            .ok_or_else(|| NavError::UnknownControl(row.control.clone()))?;
        visits.push(Visit {
            time: row.elapsed,
            control: &row.control,
            x: coord.x,
            y: coord.y,
            points: row.points,
        });
    }
    if visits.is_empty() {
        return Err(NavError::EmptyTrajectory);
    }
    // Stable, so simultaneous visits keep their log order.
    visits.sort_by_key(|v| v.time);

    let soft_end = params.soft_end();
    let hard_end = params.hard_end();
    let last_visit = visits[visits.len() - 1].time;
    let times = build_grid(params.step(), last_visit.max(hard_end), hard_end);

    let mut series = resample(&visits, times);
    let deductions = late_deductions(&series.times, soft_end, params.penalty_points_per_minute);
    series.points = &series.points - &deductions;

    let final_score = f64::from(final_score);
    let points = series
        .times
        .iter()
        .enumerate()
        .map(|(i, &time)| TrajectoryPoint {
            time,
            control: series.controls[i].to_string(),
            x: series.x[i],
            y: series.y[i],
            score: if time >= hard_end {
                final_score
            } else {
                series.points[i]
            },
        })
        .collect();

    Ok(Trajectory { points })
}

/// Multiples of `step` up to `horizon`, with `pinned` added if it falls
/// between grid points.
fn build_grid(step: TimeDelta, horizon: TimeDelta, pinned: TimeDelta) -> Vec<TimeDelta> {
    let mut times = Vec::new();
    let mut k = 0i32;
    loop {
        let t = step * k;
        if t > horizon {
            break;
        }
        times.push(t);
        k += 1;
    }
    if let Err(pos) = times.binary_search(&pinned) {
        times.insert(pos, pinned);
    }
    times
}

fn resample<'a>(visits: &[Visit<'a>], times: Vec<TimeDelta>) -> Resampled<'a> {
    let n = times.len();
    let mut controls = Vec::with_capacity(n);
    let mut x = Vec::with_capacity(n);
    let mut y = Vec::with_capacity(n);
    let mut points = Vec::with_capacity(n);

    for &t in &times {
        // Number of visits at or before t; ties resolve to the last logged.
        let idx = visits.partition_point(|v| v.time <= t);
        if idx == 0 {
            let first = &visits[0];
            controls.push(first.control);
            x.push(first.x);
            y.push(first.y);
            points.push(first.points);
            continue;
        }
        let prev = &visits[idx - 1];
        controls.push(prev.control);
        points.push(prev.points);
        match visits.get(idx) {
            Some(next) => {
                let span = (next.time - prev.time).num_milliseconds() as f64;
                let frac = (t - prev.time).num_milliseconds() as f64 / span;
                x.push(prev.x + (next.x - prev.x) * frac);
                y.push(prev.y + (next.y - prev.y) * frac);
            }
            None => {
                x.push(prev.x);
                y.push(prev.y);
            }
        }
    }

    Resampled {
        times,
        controls,
        x: Array1::from_vec(x),
        y: Array1::from_vec(y),
        points: Array1::from_vec(points),
    }
}

fn late_deductions(
    times: &[TimeDelta],
    soft_end: TimeDelta,
    points_per_minute: f64,
) -> Array1<f64> {
    let seconds_per_point = 60.0 / points_per_minute;
    times
        .iter()
        .map(|&t| {
            let late_s = (t - soft_end).num_milliseconds() as f64 / 1000.0;
            (late_s / seconds_per_point).max(0.0)
        })
        .collect()
}
