// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! NMEA sentence parsing.
//!
//! Stateless decoding of the two sentence shapes the logger cares about:
//! GGA (position fix) and RMC (speed over ground). Everything else is
//! classified as ignorable. Malformed input never errors, it yields
//! `None` -- garbled serial bytes are a normal operating condition.

/// Knots to km/h.
const KNOTS_TO_KMH: f64 = 1.852;

/// RMC talker variants that carry speed over ground.
const RMC_VARIANTS: [&str; 2] = ["$GPRMC", "$GNRMC"];

/// Parsed fragment of a GGA position sentence.
///
/// Latitude/longitude are `None` when the raw coordinate or hemisphere
/// field was empty; altitude is `None` when the field did not parse.
/// The fragment itself is still valid in those cases -- whether a fix
/// without position is usable is decided downstream.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PositionFragment {
    /// Decimal degrees, negative for the southern hemisphere.
    pub latitude: Option<f64>,
    /// Decimal degrees, negative for the western hemisphere.
    pub longitude: Option<f64>,
    /// Meters above mean sea level.
    pub altitude: Option<f64>,
}

/// Classification of one raw NMEA line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Sentence {
    /// Leading token ends in "GGA" (any talker ID).
    Position,
    /// Leading token is a recognized RMC variant.
    Speed,
    /// Anything else, including empty lines.
    Ignored,
}

/// Classify a line by its leading comma token.
pub fn classify(line: &str) -> Sentence {
    let header = line.split(',').next().unwrap_or("");
    if header.ends_with("GGA") {
        Sentence::Position
    } else if RMC_VARIANTS.contains(&header) {
        Sentence::Speed
    } else {
        Sentence::Ignored
    }
}

/// Parse a GGA sentence into a position fragment.
///
/// Requires at least 10 comma-separated fields; returns `None` below
/// that. Field layout (0-indexed): 2/3 latitude + hemisphere,
/// 4/5 longitude + hemisphere, 9 altitude in meters.
pub fn parse_position_sentence(line: &str) -> Option<PositionFragment> {
    let parts: Vec<&str> = line.split(',').collect();
    if parts.len() < 10 {
        return None;
    }

    Some(PositionFragment {
        latitude: to_decimal_degrees(parts[2], parts[3]),
        longitude: to_decimal_degrees(parts[4], parts[5]),
        altitude: parts[9].parse().ok(),
    })
}

/// Parse an RMC sentence into a speed in km/h.
///
/// Requires at least 8 fields and a non-empty knots field (index 7).
/// Any other layout yields `None`, silently.
pub fn parse_speed_sentence(line: &str) -> Option<f64> {
    let parts: Vec<&str> = line.split(',').collect();
    if parts.len() < 8 || parts[7].is_empty() {
        return None;
    }
    let knots: f64 = parts[7].parse().ok()?;
    Some(knots * KNOTS_TO_KMH)
}

/// Convert an NMEA `DDDMM.MMMM` coordinate to decimal degrees.
///
/// Degrees are the digits left of the two minute digits; the sign flips
/// for the S and W hemispheres. Empty raw or hemisphere input yields
/// `None` (fail closed).
pub fn to_decimal_degrees(raw: &str, hemisphere: &str) -> Option<f64> {
    if raw.is_empty() || hemisphere.is_empty() {
        return None;
    }
    let value: f64 = raw.parse().ok()?;
    let degrees = (value / 100.0).floor();
    let minutes = value - degrees * 100.0;
    let decimal = degrees + minutes / 60.0;

    match hemisphere {
        "S" | "W" => Some(-decimal),
        _ => Some(decimal),
    }
}
