//! Auto-scroll coordinate mapping.
//!
//! The canvas drifts upward at a fixed rate derived from the wall clock. Input
//! arrives in viewport coordinates and is shifted into canvas space before it
//! is stored, so stored points never move while the view scrolls.

use chrono::{DateTime, Local, NaiveDateTime, TimeZone, Utc};
use kurbo::{Affine, Point, Vec2};
use serde::{Deserialize, Serialize};

use crate::config::SessionConfig;

/// Milliseconds of wall-clock time per canvas unit of scroll.
pub const SCROLL_MS_PER_UNIT: f64 = 80.0;

/// Which midnight the scroll offset counts from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScrollEpoch {
    /// Most recent midnight in the local time zone.
    #[default]
    LocalMidnight,
    /// Most recent midnight in UTC.
    UtcMidnight,
}

impl ScrollEpoch {
    /// Resolve the epoch instant preceding `now`.
    pub fn resolve(self, now: DateTime<Utc>) -> DateTime<Utc> {
        match self {
            ScrollEpoch::UtcMidnight => Utc.from_utc_datetime(&midnight(now.date_naive())),
            ScrollEpoch::LocalMidnight => {
                let local_date = now.with_timezone(&Local).date_naive();
                midnight(local_date)
                    .and_local_timezone(Local)
                    .earliest()
                    .map(|t| t.with_timezone(&Utc))
                    // Midnight skipped by a DST jump; fall back to UTC.
                    .unwrap_or_else(|| ScrollEpoch::UtcMidnight.resolve(now))
            }
        }
    }
}

fn midnight(date: chrono::NaiveDate) -> NaiveDateTime {
    date.and_time(chrono::NaiveTime::MIN)
}

/// Maps viewport input into scrolled canvas space.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CoordinateMapper {
    epoch: DateTime<Utc>,
}

impl CoordinateMapper {
    /// Create a mapper whose epoch is fixed now.
    pub fn new(epoch: ScrollEpoch) -> Self {
        Self::with_epoch(epoch.resolve(Utc::now()))
    }

    /// Create a mapper for the configured epoch, fixed now.
    pub fn from_config(config: &SessionConfig) -> Self {
        Self::new(config.scroll_epoch)
    }

    /// Create a mapper with an explicit epoch.
    pub fn with_epoch(epoch: DateTime<Utc>) -> Self {
        Self { epoch }
    }

    pub fn epoch(&self) -> DateTime<Utc> {
        self.epoch
    }

    /// Vertical scroll distance at `now`.
    pub fn scroll_offset(&self, now: DateTime<Utc>) -> f64 {
        (now - self.epoch).num_milliseconds() as f64 / SCROLL_MS_PER_UNIT
    }

    /// Convert raw viewport coordinates to canvas coordinates.
    pub fn map_point(&self, raw_x: f64, raw_y: f64, now: DateTime<Utc>) -> Point {
        Point::new(raw_x, raw_y + self.scroll_offset(now))
    }

    /// Transform from canvas space to viewport space at `now`, for rendering.
    pub fn view_transform(&self, now: DateTime<Utc>) -> Affine {
        Affine::translate(Vec2::new(0.0, -self.scroll_offset(now)))
    }

    /// Convert a canvas point back to viewport coordinates.
    pub fn to_viewport(&self, point: Point, now: DateTime<Utc>) -> Point {
        self.view_transform(now) * point
    }
}

impl Default for CoordinateMapper {
    fn default() -> Self {
        Self::new(ScrollEpoch::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Timelike};

    fn fixed_epoch() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 0, 0, 0).unwrap()
    }

    #[test]
    fn test_same_inputs_same_output() {
        let mapper = CoordinateMapper::with_epoch(fixed_epoch());
        let now = fixed_epoch() + Duration::milliseconds(123_456);
        assert_eq!(mapper.map_point(12.5, 40.0, now), mapper.map_point(12.5, 40.0, now));
    }

    #[test]
    fn test_eight_seconds_scrolls_one_hundred() {
        let mapper = CoordinateMapper::with_epoch(fixed_epoch());
        let t1 = fixed_epoch() + Duration::milliseconds(1_600);
        let t2 = t1 + Duration::milliseconds(8_000);

        let a = mapper.map_point(5.0, 10.0, t1);
        let b = mapper.map_point(5.0, 10.0, t2);

        assert_eq!(a, Point::new(5.0, 30.0));
        assert_eq!(b.y - a.y, 100.0);
        assert_eq!(a.x, b.x);
    }

    #[test]
    fn test_offset_difference_anywhere_in_day() {
        let mapper = CoordinateMapper::with_epoch(fixed_epoch());
        let t1 = fixed_epoch() + Duration::milliseconds(37_654_321);
        let t2 = t1 + Duration::milliseconds(8_000);
        let delta = mapper.map_point(0.0, 0.0, t2).y - mapper.map_point(0.0, 0.0, t1).y;
        assert!((delta - 100.0).abs() < 1e-9);
    }

    #[test]
    fn test_viewport_roundtrip() {
        let mapper = CoordinateMapper::with_epoch(fixed_epoch());
        let now = fixed_epoch() + Duration::milliseconds(4_000);
        let canvas = mapper.map_point(100.0, 200.0, now);
        let viewport = mapper.to_viewport(canvas, now);
        assert!((viewport.x - 100.0).abs() < 1e-9);
        assert!((viewport.y - 200.0).abs() < 1e-9);
    }

    #[test]
    fn test_utc_epoch_is_midnight() {
        let now = Utc.with_ymd_and_hms(2024, 5, 1, 17, 30, 5).unwrap();
        let epoch = ScrollEpoch::UtcMidnight.resolve(now);
        assert_eq!(epoch, fixed_epoch());
    }

    #[test]
    fn test_mapper_follows_configured_epoch() {
        let config = SessionConfig {
            scroll_epoch: ScrollEpoch::UtcMidnight,
            ..SessionConfig::default()
        };
        let before = Utc::now();
        let mapper = CoordinateMapper::from_config(&config);
        let after = Utc::now();

        let epoch = mapper.epoch();
        assert_eq!(epoch.time(), chrono::NaiveTime::MIN);
        assert!(epoch == ScrollEpoch::UtcMidnight.resolve(before)
            || epoch == ScrollEpoch::UtcMidnight.resolve(after));
    }

    #[test]
    fn test_local_epoch_precedes_now() {
        let now = Utc::now();
        let epoch = ScrollEpoch::LocalMidnight.resolve(now);
        assert!(epoch <= now);
        assert!(now - epoch <= Duration::hours(25));
        assert_eq!(epoch.with_timezone(&Local).minute(), 0);
    }
}
