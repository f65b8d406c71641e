//! GPX track points to sample sequences.

use std::fs;
use std::io::Cursor;
use std::path::Path;

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use serde_json::json;
use trendline::{Measure, Sample, SampleSequence};

pub const ELEVATION: usize = 0;
pub const DISTANCE: usize = 1;
pub const SPEED: usize = 2;

pub const MEASURE_NAMES: [&str; 3] = ["elevation", "distance", "speed"];

pub fn measure_index(name: &str) -> Option<usize> {
    MEASURE_NAMES.iter().position(|m| m.eq_ignore_ascii_case(name))
}

pub fn read_gpx(path: &Path) -> Result<SampleSequence> {
    let data = fs::read(path).with_context(|| format!("failed to read {}", path.display()))?;
    parse_gpx(&data, ELEVATION).with_context(|| format!("failed to parse {}", path.display()))
}

/// Every timed track point becomes one sample carrying elevation (m),
/// cumulative great-circle distance (m) and speed (m/s). Points without a
/// timestamp are skipped; a missing elevation is stored as NaN.
///
/// Dilution-of-precision figures become measure accuracies: vertical DOP for
/// elevation, horizontal DOP for distance and speed, each falling back to
/// positional DOP.
pub fn parse_gpx(input: &[u8], primary_measure: usize) -> Result<SampleSequence> {
    let gpx = gpx::read(Cursor::new(input)).map_err(|e| anyhow!("invalid GPX: {e}"))?;

    let mut samples = Vec::new();
    let mut distance = 0.0;
    let mut last: Option<(f64, f64, i64, f64)> = None;

    for track in gpx.tracks {
        for segment in track.segments {
            for point in segment.points {
                let Some(time) = point.time else {
                    continue;
                };
                let iso = time.format().map_err(|e| anyhow!("bad point time: {e}"))?;
                let utc = DateTime::parse_from_rfc3339(&iso)
                    .with_context(|| format!("bad point time {iso}"))?
                    .with_timezone(&Utc);
                let t_ms = utc.timestamp_millis();
                let geo = point.point();
                let (lat, lon) = (geo.y(), geo.x());

                let mut speed = 0.0;
                if let Some((last_lat, last_lon, last_ms, last_distance)) = last {
                    distance += haversine_distance(last_lat, last_lon, lat, lon);
                    let dt = (t_ms - last_ms) as f64 / 1000.0;
                    speed = if dt > 0.0 {
                        (distance - last_distance) / dt
                    } else {
                        f64::NAN
                    };
                }
                last = Some((lat, lon, t_ms, distance));

                let vertical = point.vdop.or(point.pdop);
                let horizontal = point.hdop.or(point.pdop);
                let sample = Sample::new(
                    samples.len() as u64,
                    t_ms,
                    vec![
                        with_dop(
                            Measure::new(MEASURE_NAMES[ELEVATION], "m", point.elevation.unwrap_or(f64::NAN)),
                            vertical,
                        ),
                        with_dop(Measure::new(MEASURE_NAMES[DISTANCE], "m", distance), horizontal),
                        with_dop(Measure::new(MEASURE_NAMES[SPEED], "m/s", speed), horizontal),
                    ],
                )
                .with_extra(json!({ "lat": lat, "lon": lon }));
                samples.push(sample);
            }
        }
    }

    if samples.is_empty() {
        return Err(anyhow!("no timed track points"));
    }
    Ok(SampleSequence::new(samples, primary_measure))
}

fn with_dop(measure: Measure, dop: Option<f64>) -> Measure {
    match dop {
        Some(dop) => measure.with_accuracy(dop),
        None => measure,
    }
}

fn haversine_distance(lat1: f64, lon1: f64, lat2: f64, lon2: f64) -> f64 {
    const EARTH_RADIUS_M: f64 = 6_371_000.0;
    let dlat = (lat2 - lat1).to_radians();
    let dlon = (lon2 - lon1).to_radians();
    let a = (dlat / 2.0).sin().powi(2)
        + lat1.to_radians().cos() * lat2.to_radians().cos() * (dlon / 2.0).sin().powi(2);
    EARTH_RADIUS_M * 2.0 * a.sqrt().atan2((1.0 - a).sqrt())
}
