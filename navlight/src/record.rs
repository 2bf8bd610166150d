use std::sync::LazyLock;

use chrono::TimeDelta;
use regex::Regex;
use serde::{Deserialize, Serialize};

use super::{NavError, Params};

/// Control id used for the start/finish (hash house).
pub const HOME: &str = "HH";

const PLACE_COLUMN: &str = "Pl/Cnt";
/// Often blank on every row, in which case fixed-width inference drops it.
const OPTIONAL_COLUMN: &str = "KmRate";
const CONTROL_COLUMN: &str = "Con";
const SPLIT_COLUMN: &str = "TmSplit";
const POINTS_COLUMN: &str = "CmPts";
const HEADER_LINE: usize = 3;
const INFER_ROWS: usize = 100;

static SCORE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"Score: ([0-9]+) points").expect("valid regex"));
static TEAM_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"Team No: ([0-9]+)").expect("valid regex"));

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct ParticipantMeta {
    pub team: u32,
    pub names: Vec<String>,
    /// Official final score printed at the foot of the tag.
    pub score: u32,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct ScheduleRow {
    pub control: String,
    /// Time since the event start.
    #[serde(with = "crate::delta_ms", rename = "elapsed_ms")]
    pub elapsed: TimeDelta,
    /// Cumulative points after visiting this control.
    pub points: f64,
}

impl ScheduleRow {
    pub fn start() -> Self {
        Self {
            control: HOME.to_string(),
            elapsed: TimeDelta::zero(),
            points: 0.0,
        }
    }
}

/// Ensure a split includes an hour component, e.g. `9:21` becomes `0:9:21`.
pub fn to_hms(split: &str) -> String {
    if split.matches(':').count() == 2 {
        split.to_string()
    } else {
        format!("0:{}", split)
    }
}

/// Format a duration as `H:MM:SS`.
pub fn format_hms(delta: TimeDelta) -> String {
    let total = delta.num_seconds();
    let sign = if total < 0 { "-" } else { "" };
    let total = total.abs();
    format!(
        "{}{}:{:02}:{:02}",
        sign,
        total / 3600,
        (total % 3600) / 60,
        total % 60
    )
}

/// Restore fixed-width alignment of a data line written before the place
/// column widened.
///
/// A line short of `expected_len` by fewer than `slack` characters gets the
/// missing blanks inserted at `insert_offset`. Longer, full-width, or badly
/// truncated lines are returned unchanged. Offsets count characters.
pub fn correct_alignment(
    line: &str,
    expected_len: usize,
    insert_offset: usize,
    slack: usize,
) -> String {
    let width = line.chars().count();
    if width >= expected_len {
        return line.to_string();
    }
    let pad = expected_len - width;
    if pad >= slack {
        return line.to_string();
    }
    let split = line
        .char_indices()
        .nth(insert_offset)
        .map(|(idx, _)| idx)
        .unwrap_or(line.len());
    let mut out = String::with_capacity(line.len() + pad);
    out.push_str(&line[..split]);
    out.push_str(&" ".repeat(pad));
    out.push_str(&line[split..]);
    out
}

/// Parse a tag download into team details and the visited-control schedule.
///
/// The schedule always starts with a synthetic row at the hash house with
/// zero elapsed time and zero points.
pub fn parse_tag(
    text: &str,
    params: &Params,
) -> Result<(ParticipantMeta, Vec<ScheduleRow>), NavError> {
    let lines: Vec<&str> = text.lines().collect();
    if lines.len() <= HEADER_LINE {
        return Err(NavError::MalformedHeader(format!(
            "expected at least {} lines, found {}",
            HEADER_LINE + 1,
            lines.len()
        )));
    }

    let score_idx = lines
        .iter()
        .rposition(|line| !line.trim().is_empty())
        .ok_or_else(|| NavError::MalformedHeader("tag is blank".into()))?;
    let meta = parse_meta(lines[1], lines[score_idx])?;

    let header = lines[HEADER_LINE];
    let place_byte = header.find(PLACE_COLUMN).ok_or_else(|| {
        NavError::MalformedHeader(format!("no '{}' column in header", PLACE_COLUMN))
    })?;
    let insert_offset = header[..place_byte].chars().count().saturating_sub(1);
    let expected_len = header.chars().count() + params.width_overhang;

    let data_end = score_idx.max(HEADER_LINE + 1);
    let data: Vec<Vec<char>> = lines[HEADER_LINE + 1..data_end]
        .iter()
        .filter(|line| line.chars().count() >= params.min_line_len)
        .map(|line| {
            correct_alignment(line, expected_len, insert_offset, params.pad_slack)
                .chars()
                .collect()
        })
        .collect();
    if data.is_empty() {
        return Err(NavError::EmptyData);
    }

    let spans = infer_columns(&data);
    let mut names: Vec<&str> = header.split_whitespace().collect();
    if names.len() > spans.len() {
        if let Some(pos) = names.iter().position(|name| *name == OPTIONAL_COLUMN) {
            names.remove(pos);
        }
    }
    if names.len() != spans.len() {
        return Err(NavError::ColumnMismatch(format!(
            "{} header columns but {} data columns",
            names.len(),
            spans.len()
        )));
    }

    let column = |name: &str| {
        names
            .iter()
            .position(|n| *n == name)
            .ok_or_else(|| NavError::ColumnMismatch(format!("missing '{}' column", name)))
    };
    let con_idx = column(CONTROL_COLUMN)?;
    let split_idx = column(SPLIT_COLUMN)?;
    let pts_idx = column(POINTS_COLUMN)?;

    let mut schedule = Vec::with_capacity(data.len() + 1);
    schedule.push(ScheduleRow::start());
    let mut elapsed = TimeDelta::zero();
    for row in &data {
        let control = match field(row, spans[con_idx]) {
            Some(raw) => normalize_control(&raw)?,
            None => HOME.to_string(),
        };
        let split = required(row, spans[split_idx], SPLIT_COLUMN)?;
        elapsed = elapsed
            .checked_add(&parse_split(&split)?)
            .ok_or_else(|| invalid(SPLIT_COLUMN, &split))?;
        let raw_points = required(row, spans[pts_idx], POINTS_COLUMN)?;
        let points = raw_points
            .parse::<f64>()
            .ok()
            .filter(|p| p.is_finite())
            .ok_or_else(|| invalid(POINTS_COLUMN, &raw_points))?;
        schedule.push(ScheduleRow {
            control,
            elapsed,
            points,
        });
    }

    Ok((meta, schedule))
}

fn parse_meta(team_line: &str, score_line: &str) -> Result<ParticipantMeta, NavError> {
    let score = SCORE_RE
        .captures(score_line)
        .and_then(|caps| caps[1].parse::<u32>().ok())
        .ok_or_else(|| NavError::MalformedHeader(format!("no score in '{}'", score_line.trim())))?;

    let caps = TEAM_RE.captures(team_line).ok_or_else(|| {
        NavError::MalformedHeader(format!("no team number in '{}'", team_line.trim()))
    })?;
    let team = caps[1].parse::<u32>().map_err(|_| {
        NavError::MalformedHeader(format!("team number '{}' out of range", &caps[1]))
    })?;
    let rest = caps.get(0).map_or("", |m| &team_line[m.end()..]);
    let names = rest
        .split(',')
        .map(str::trim)
        .filter(|name| !name.is_empty())
        .map(str::to_string)
        .collect();

    Ok(ParticipantMeta { team, names, score })
}

/// Character spans of fixed-width columns: maximal runs of positions that
/// hold a non-blank character in at least one of the leading rows.
fn infer_columns(rows: &[Vec<char>]) -> Vec<(usize, usize)> {
    let sample = &rows[..rows.len().min(INFER_ROWS)];
    let width = sample.iter().map(Vec::len).max().unwrap_or(0);
    let mut occupied = vec![false; width];
    for row in sample {
        for (i, ch) in row.iter().enumerate() {
            if !ch.is_whitespace() {
                occupied[i] = true;
            }
        }
    }

    let mut spans = Vec::new();
    let mut start: Option<usize> = None;
    for (i, &used) in occupied.iter().enumerate() {
        match (used, start) {
            (true, None) => start = Some(i),
            (false, Some(s)) => {
                spans.push((s, i));
                start = None;
            }
            _ => {}
        }
    }
    if let Some(s) = start {
        spans.push((s, width));
    }
    spans
}

fn field(row: &[char], (start, end): (usize, usize)) -> Option<String> {
    if start >= row.len() {
        return None;
    }
    let text: String = row[start..end.min(row.len())].iter().collect();
    let trimmed = text.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

fn required(row: &[char], span: (usize, usize), column: &str) -> Result<String, NavError> {
    field(row, span).ok_or_else(|| invalid(column, ""))
}

fn invalid(column: &str, value: &str) -> NavError {
    NavError::InvalidField {
        column: column.to_string(),
        value: value.to_string(),
    }
}

/// Control numbers become plain integer strings; control 0 is the hash house.
fn normalize_control(raw: &str) -> Result<String, NavError> {
    let number = match raw.parse::<i64>() {
        Ok(n) => n,
        Err(_) => match raw.parse::<f64>() {
            Ok(f) if f.is_finite() && f.fract() == 0.0 => f as i64,
            _ => return Err(invalid(CONTROL_COLUMN, raw)),
        },
    };
    if number == 0 {
        Ok(HOME.to_string())
    } else {
        Ok(number.to_string())
    }
}

fn parse_split(raw: &str) -> Result<TimeDelta, NavError> {
    let hms = to_hms(raw);
    let parts: Vec<&str> = hms.split(':').collect();
    if parts.len() != 3 {
        return Err(invalid(SPLIT_COLUMN, raw));
    }
    let hours = parts[0].parse::<u32>().map_err(|_| invalid(SPLIT_COLUMN, raw))?;
    let minutes = parts[1].parse::<u32>().map_err(|_| invalid(SPLIT_COLUMN, raw))?;
    let seconds = parts[2]
        .parse::<f64>()
        .ok()
        .filter(|s| (0.0..60.0).contains(s))
        .ok_or_else(|| invalid(SPLIT_COLUMN, raw))?;
    let whole_ms = (i64::from(hours) * 3600 + i64::from(minutes) * 60) * 1000;
    TimeDelta::try_milliseconds(whole_ms + (seconds * 1000.0).round() as i64)
        .ok_or_else(|| invalid(SPLIT_COLUMN, raw))
}

#[cfg(test)]
mod tests {
    use super::*;

    const HEADER: &str = "Con    Time   TmSplit   Pl/Cnt  KmRate   CmPts";

    fn tag(rows: &[&str], score: u32) -> String {
        let mut text = String::from("NAVLIGHT TAG DOWNLOAD\n");
        text.push_str("Team No: 101  Alice Smith,Bob Jones\n");
        text.push_str("Course: 6hr Rogaine\n");
        text.push_str(HEADER);
        text.push('\n');
        for row in rows {
            text.push_str(row);
            text.push('\n');
        }
        text.push_str(&format!("Score: {} points\n", score));
        text
    }

    #[test]
    fn test_to_hms() {
        assert_eq!(to_hms("9:21"), "0:9:21");
        assert_eq!(to_hms("1:09:21"), "1:09:21");
    }

    #[test]
    fn test_format_hms() {
        assert_eq!(format_hms(TimeDelta::seconds(3 * 3600 + 5 * 60 + 9)), "3:05:09");
        assert_eq!(format_hms(TimeDelta::zero()), "0:00:00");
    }

    #[test]
    fn test_parse_split() {
        assert_eq!(parse_split("9:21").unwrap(), TimeDelta::seconds(561));
        assert_eq!(parse_split("1:09:21").unwrap(), TimeDelta::seconds(4161));
        assert!(parse_split("abc").is_err());
        assert!(parse_split("1:2:3:4").is_err());
        assert!(parse_split("1:00:1e16").is_err());
        assert!(parse_split("0:00:75").is_err());
        assert!(parse_split("0:00:NaN").is_err());
    }

    #[test]
    fn test_correct_alignment_inserts_before_offset() {
        let line = "abcdefghij";
        let fixed = correct_alignment(line, 13, 4, 10);
        assert_eq!(fixed, "abcd   efghij");
    }

    #[test]
    fn test_correct_alignment_leaves_large_shortfall() {
        let line = "abcdefghij";
        assert_eq!(correct_alignment(line, 20, 4, 10), line);
        assert_eq!(correct_alignment(line, 10, 4, 10), line);
        assert_eq!(correct_alignment(line, 8, 4, 10), line);
    }

    #[test]
    fn test_correct_alignment_offset_past_end() {
        assert_eq!(correct_alignment("abc", 5, 10, 10), "abc  ");
    }

    #[test]
    fn test_narrow_place_column_matches_wide() {
        let wide = " 17  1:02:03    31:03      4/99     5.0        100";
        let narrow = " 17  1:02:03    31:03     4/99     5.0        100";
        assert_eq!(narrow.len() + 1, wide.len());
        let insert_offset = HEADER.find(PLACE_COLUMN).unwrap() - 1;
        let fixed = correct_alignment(narrow, HEADER.len() + 4, insert_offset, 10);
        assert_eq!(fixed, wide);
    }

    #[test]
    fn test_parse_tag_schedule() {
        let text = tag(
            &[
                " 31  0:09:21     9:21     3/120     5.2         30",
                " 42  0:25:00    15:39    10/120     6.1         70",
                "     0:31:10     6:10     1/120                 70",
            ],
            70,
        );
        let (meta, schedule) = parse_tag(&text, &Params::default()).expect("parse");
        assert_eq!(meta.team, 101);
        assert_eq!(meta.names, vec!["Alice Smith", "Bob Jones"]);
        assert_eq!(meta.score, 70);

        assert_eq!(schedule.len(), 4);
        assert_eq!(schedule[0], ScheduleRow::start());
        assert_eq!(schedule[1].control, "31");
        assert_eq!(schedule[1].elapsed, TimeDelta::seconds(561));
        assert_eq!(schedule[1].points, 30.0);
        assert_eq!(schedule[2].control, "42");
        assert_eq!(schedule[2].elapsed, TimeDelta::seconds(1500));
        assert_eq!(schedule[3].control, HOME);
        assert_eq!(schedule[3].elapsed, TimeDelta::seconds(1870));
        assert_eq!(schedule[3].points, 70.0);
    }

    #[test]
    fn test_parse_tag_pads_short_rows() {
        let text = tag(
            &[
                " 17  0:31:03    31:03     4/99     5.0        100",
                " 42  0:46:42    15:39    10/120     6.1        140",
            ],
            140,
        );
        let (_, schedule) = parse_tag(&text, &Params::default()).expect("parse");
        assert_eq!(schedule[1].control, "17");
        assert_eq!(schedule[1].points, 100.0);
        assert_eq!(schedule[2].elapsed, TimeDelta::seconds(31 * 60 + 3 + 15 * 60 + 39));
    }

    #[test]
    fn test_parse_tag_skips_short_lines() {
        let text = tag(
            &[
                " 31  0:09:21     9:21     3/120     5.2         30",
                "-- continued --",
                "",
                "     0:15:00     5:39     1/120     4.0         30",
            ],
            30,
        );
        let (_, schedule) = parse_tag(&text, &Params::default()).expect("parse");
        assert_eq!(schedule.len(), 3);
        assert_eq!(schedule[2].control, HOME);
    }

    #[test]
    fn test_blank_rate_column_dropped() {
        let text = tag(
            &[
                " 31  0:09:21     9:21     3/120                 30",
                "     0:15:00     5:39     1/120                 30",
            ],
            30,
        );
        let (_, schedule) = parse_tag(&text, &Params::default()).expect("parse");
        assert_eq!(schedule.len(), 3);
        assert_eq!(schedule[1].points, 30.0);
    }

    #[test]
    fn test_control_zero_is_home() {
        let text = tag(&["  0  0:09:21     9:21     3/120     5.2          0"], 0);
        let (_, schedule) = parse_tag(&text, &Params::default()).expect("parse");
        assert_eq!(schedule[1].control, HOME);
    }

    #[test]
    fn test_missing_score_is_malformed() {
        let mut text = tag(&[" 31  0:09:21     9:21     3/120     5.2         30"], 30);
        text = text.replace("Score: 30 points", "Total: 30");
        assert!(matches!(
            parse_tag(&text, &Params::default()),
            Err(NavError::MalformedHeader(_))
        ));
    }

    #[test]
    fn test_missing_team_is_malformed() {
        let text = tag(&[" 31  0:09:21     9:21     3/120     5.2         30"], 30)
            .replace("Team No: 101", "Team: 101");
        assert!(matches!(
            parse_tag(&text, &Params::default()),
            Err(NavError::MalformedHeader(_))
        ));
    }

    #[test]
    fn test_missing_place_header_is_malformed() {
        let text = tag(&[" 31  0:09:21     9:21     3/120     5.2         30"], 30)
            .replace("Pl/Cnt", "Place ");
        assert!(matches!(
            parse_tag(&text, &Params::default()),
            Err(NavError::MalformedHeader(_))
        ));
    }

    #[test]
    fn test_no_rows_is_empty_data() {
        let text = tag(&["short line"], 0);
        assert_eq!(parse_tag(&text, &Params::default()), Err(NavError::EmptyData));
    }

    #[test]
    fn test_column_mismatch() {
        let text = tag(
            &[" 31  0:09:21     9:21     3/120     5.2    x    30"],
            30,
        );
        assert!(matches!(
            parse_tag(&text, &Params::default()),
            Err(NavError::ColumnMismatch(_))
        ));
    }

    #[test]
    fn test_oversized_split_is_invalid_field() {
        let text = tag(&[" 31  0:09:21 1:00:1e16    3/120     5.2         30"], 30);
        assert_eq!(
            parse_tag(&text, &Params::default()),
            Err(NavError::InvalidField {
                column: SPLIT_COLUMN.to_string(),
                value: "1:00:1e16".to_string(),
            })
        );
    }

    #[test]
    fn test_three_narrow_place_column_parses_like_wide() {
        let wide_row = " 42  0:25:00    15:39   104/120     6.1         70";
        let narrow = tag(&[" 31  0:09:21     9:21    4/9     5.2         30", wide_row], 70);
        let wide = tag(&[" 31  0:09:21     9:21       4/9     5.2         30", wide_row], 70);
        let params = Params::default();
        let (_, narrow_schedule) = parse_tag(&narrow, &params).expect("narrow");
        let (_, wide_schedule) = parse_tag(&wide, &params).expect("wide");
        assert_eq!(narrow_schedule, wide_schedule);
        assert_eq!(narrow_schedule[1].control, "31");
        assert_eq!(narrow_schedule[1].elapsed, TimeDelta::seconds(561));
        assert_eq!(narrow_schedule[2].points, 70.0);
    }

    #[test]
    fn test_bad_split_is_invalid_field() {
        let text = tag(&[" 31  0:09:21     9:xx     3/120     5.2         30"], 30);
        assert!(matches!(
            parse_tag(&text, &Params::default()),
            Err(NavError::InvalidField { .. })
        ));
    }
}
