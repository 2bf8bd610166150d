use std::collections::HashMap;
use std::fs::File;
use std::io::Read;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::debug;

use super::NavError;

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq)]
pub struct Coordinate {
    pub x: f64,
    pub y: f64,
}

/// Map coordinates of every control, keyed by control id.
#[derive(Clone, Debug, Default)]
pub struct ControlTable {
    coords: HashMap<String, Coordinate>,
}

impl ControlTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, id: impl Into<String>, x: f64, y: f64) {
        self.coords.insert(id.into(), Coordinate { x, y });
    }

    pub fn get(&self, id: &str) -> Option<Coordinate> {
        self.coords.get(id).copied()
    }

    pub fn len(&self) -> usize {
        self.coords.len()
    }

    pub fn is_empty(&self) -> bool {
        self.coords.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, Coordinate)> {
        self.coords.iter().map(|(id, c)| (id.as_str(), *c))
    }

    /// Read a CSV whose first column is the control id and which has `x`
    /// and `y` columns. Rows with a blank coordinate are skipped.
    pub fn from_reader<R: Read>(reader: R) -> Result<Self, NavError> {
        let mut rdr = csv::ReaderBuilder::new()
            .trim(csv::Trim::All)
            .flexible(true)
            .from_reader(reader);
        let headers = rdr
            .headers()
            .map_err(|e| NavError::ControlTable(e.to_string()))?
            .clone();
        let x_idx = headers
            .iter()
            .position(|h| h == "x")
            .ok_or_else(|| NavError::ControlTable("missing 'x' column".into()))?;
        let y_idx = headers
            .iter()
            .position(|h| h == "y")
            .ok_or_else(|| NavError::ControlTable("missing 'y' column".into()))?;

        let mut table = Self::new();
        for (line, record) in rdr.records().enumerate() {
            let record = record.map_err(|e| NavError::ControlTable(e.to_string()))?;
            let id = record.get(0).unwrap_or("");
            if id.is_empty() {
                continue;
            }
            let raw_x = record.get(x_idx).unwrap_or("");
            let raw_y = record.get(y_idx).unwrap_or("");
            if raw_x.is_empty() || raw_y.is_empty() {
                debug!("control {} has no coordinates, skipping", id);
                continue;
            }
            let x = parse_coord(raw_x, line)?;
            let y = parse_coord(raw_y, line)?;
            table.insert(id, x, y);
        }
        Ok(table)
    }

    pub fn from_path(path: &Path) -> Result<Self, NavError> {
        let file = File::open(path)
            .map_err(|e| NavError::ControlTable(format!("{}: {}", path.display(), e)))?;
        Self::from_reader(file)
    }
}

fn parse_coord(raw: &str, line: usize) -> Result<f64, NavError> {
    raw.parse::<f64>()
        .ok()
        .filter(|v| v.is_finite())
        .ok_or_else(|| {
            NavError::ControlTable(format!("row {}: bad coordinate '{}'", line + 1, raw))
        })
}
