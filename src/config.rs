//! Per-constraint configuration.
//!
//! A constraint is described by a JSON object, for example:
//!
//! ```json
//! {
//!   "constraint": "Bilbao",
//!   "activity_group": "Bike",
//!   "border": 3,
//!   "start": "1970-01-01",
//!   "finish": "2970-01-01",
//!   "latitude": 43.3,
//!   "longitude": -2.9,
//!   "height": 0.3,
//!   "width": 0.5,
//!   "fraction": 1
//! }
//! ```
//!
//! `border` is in the same units as longitude/latitude after scaling by
//! `border_scale` (default: one unit is 1e-4 degrees, roughly 10m).

use std::path::Path;

use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use geo::{coord, Rect};
use log::info;
use serde::{Deserialize, Serialize};

use crate::error::{NearbyError, OptionExt, Result};

/// Degrees per unit of `border`.
pub const DEFAULT_BORDER_SCALE: f64 = 1e-4;

/// Largest accepted radius search budget; the first step is `2^-iterations`
/// of the range.
pub const MAX_EPSILON_ITERATIONS: u32 = 30;

/// Configuration for one constraint (an independent similarity graph).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NearbyConfig {
    /// Namespace for edges, groups and run markers
    pub constraint: String,
    /// Only activities in this group are compared
    pub activity_group: String,
    /// Match tolerance, in units of `border_scale` degrees
    pub border: f64,
    #[serde(default = "default_border_scale")]
    pub border_scale: f64,
    /// Start of the sample time window (inclusive)
    pub start: String,
    /// End of the sample time window (exclusive)
    pub finish: String,
    /// Center and extent of the region of interest (degrees)
    pub latitude: f64,
    pub longitude: f64,
    pub height: f64,
    pub width: f64,
    /// Fraction of each new activity's points that are kept, in (0, 1]
    #[serde(default = "default_fraction")]
    pub fraction: f64,
    /// Seed for downsampling; unseeded sampling is not reproducible
    #[serde(default)]
    pub sample_seed: Option<u64>,
    /// DBSCAN core point threshold (neighbourhood size including the point)
    #[serde(default = "default_min_points")]
    pub min_points: usize,
    /// Search range and iteration budget for the density radius
    #[serde(default)]
    pub epsilon_lo: f64,
    #[serde(default = "default_epsilon_hi")]
    pub epsilon_hi: f64,
    #[serde(default = "default_epsilon_iterations")]
    pub epsilon_iterations: u32,
}

fn default_border_scale() -> f64 {
    DEFAULT_BORDER_SCALE
}

fn default_fraction() -> f64 {
    1.0
}

fn default_min_points() -> usize {
    3
}

fn default_epsilon_hi() -> f64 {
    1.0
}

fn default_epsilon_iterations() -> u32 {
    5
}

impl NearbyConfig {
    /// Parse and validate a JSON configuration.
    pub fn from_json(json: &str) -> Result<Self> {
        let config: NearbyConfig = serde_json::from_str(json)?;
        config.validate()?;
        info!("[Nearby] {}: {:?}", config.constraint, config);
        if config.fraction < 1.0 {
            info!(
                "[Nearby] Reducing to {}%",
                (0.5 + 100.0 * config.fraction) as u32
            );
        }
        Ok(config)
    }

    /// Read, parse and validate a JSON configuration file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let json = std::fs::read_to_string(path)?;
        Self::from_json(&json)
    }

    /// Reject anything that would make a run meaningless.
    ///
    /// Called before any mutation so a bad configuration never leaves
    /// partial state behind.
    pub fn validate(&self) -> Result<()> {
        if self.constraint.trim().is_empty() {
            return Err(NearbyError::config("constraint name is empty"));
        }
        if self.activity_group.trim().is_empty() {
            return Err(NearbyError::config("activity_group is empty"));
        }
        for (name, value) in [
            ("border", self.border),
            ("border_scale", self.border_scale),
            ("height", self.height),
            ("width", self.width),
        ] {
            if !value.is_finite() || value <= 0.0 {
                return Err(NearbyError::config(format!(
                    "{} must be positive, got {}",
                    name, value
                )));
            }
        }
        if !self.latitude.is_finite() || !(-90.0..=90.0).contains(&self.latitude) {
            return Err(NearbyError::config(format!("bad latitude {}", self.latitude)));
        }
        if !self.longitude.is_finite() || !(-180.0..=180.0).contains(&self.longitude) {
            return Err(NearbyError::config(format!(
                "bad longitude {}",
                self.longitude
            )));
        }
        if !(self.fraction > 0.0 && self.fraction <= 1.0) {
            return Err(NearbyError::config(format!(
                "fraction must be in (0, 1], got {}",
                self.fraction
            )));
        }
        if self.min_points == 0 {
            return Err(NearbyError::config("min_points must be at least 1"));
        }
        if !(1..=MAX_EPSILON_ITERATIONS).contains(&self.epsilon_iterations) {
            return Err(NearbyError::config(format!(
                "epsilon_iterations must be in 1..={}, got {}",
                MAX_EPSILON_ITERATIONS, self.epsilon_iterations
            )));
        }
        if !(self.epsilon_lo >= 0.0 && self.epsilon_lo < self.epsilon_hi && self.epsilon_hi <= 1.0)
        {
            return Err(NearbyError::config(format!(
                "epsilon range [{}, {}] must lie within [0, 1]",
                self.epsilon_lo, self.epsilon_hi
            )));
        }
        let (start, finish) = self.window()?;
        if finish <= start {
            return Err(NearbyError::config(format!(
                "finish {} is not after start {}",
                self.finish, self.start
            )));
        }
        Ok(())
    }

    /// The `[start, finish)` sample window.
    pub fn window(&self) -> Result<(DateTime<Utc>, DateTime<Utc>)> {
        Ok((parse_time(&self.start)?, parse_time(&self.finish)?))
    }

    /// Matching tolerance in degrees.
    pub fn border_degrees(&self) -> f64 {
        self.border * self.border_scale
    }

    /// Region of interest as `(longitude, latitude)` rectangle.
    pub fn region(&self) -> Rect<f64> {
        Rect::new(
            coord! { x: self.longitude - self.width / 2.0, y: self.latitude - self.height / 2.0 },
            coord! { x: self.longitude + self.width / 2.0, y: self.latitude + self.height / 2.0 },
        )
    }
}

/// Parse either a date (`2020-01-31`, midnight UTC) or an RFC 3339 time.
pub fn parse_time(value: &str) -> Result<DateTime<Utc>> {
    if let Ok(time) = DateTime::parse_from_rfc3339(value) {
        return Ok(time.with_timezone(&Utc));
    }
    let date = NaiveDate::parse_from_str(value, "%Y-%m-%d")
        .map_err(|e| NearbyError::config(format!("cannot parse time '{}': {}", value, e)))?;
    Ok(date.and_time(NaiveTime::MIN).and_utc())
}

/// Parse an optional date bound given on the command line.
pub fn parse_date(value: Option<&str>) -> Result<Option<DateTime<Utc>>> {
    value.map(parse_time).transpose()
}

/// Seconds since the epoch, the unit position timestamps are stored in.
pub fn epoch_seconds(time: DateTime<Utc>) -> f64 {
    time.timestamp_micros() as f64 / 1e6
}

impl Default for NearbyConfig {
    fn default() -> Self {
        Self {
            constraint: "default".to_string(),
            activity_group: "all".to_string(),
            border: 3.0,
            border_scale: DEFAULT_BORDER_SCALE,
            start: "1970-01-01".to_string(),
            finish: "2970-01-01".to_string(),
            latitude: 0.0,
            longitude: 0.0,
            height: 180.0,
            width: 360.0,
            fraction: 1.0,
            sample_seed: None,
            min_points: 3,
            epsilon_lo: 0.0,
            epsilon_hi: 1.0,
            epsilon_iterations: 5,
        }
    }
}

/// Look up a named configuration among several (e.g. a file holding a JSON
/// array of constraints).
pub fn find_constraint(configs: Vec<NearbyConfig>, constraint: &str) -> Result<NearbyConfig> {
    configs
        .into_iter()
        .find(|c| c.constraint == constraint)
        .ok_or_config(&format!("no configuration for constraint '{}'", constraint))
}
