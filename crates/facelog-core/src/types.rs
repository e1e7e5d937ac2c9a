use serde::{Deserialize, Deserializer, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Stable key a face is enrolled and recognized under.
///
/// Identities double as recognizer labels, capture directory names and
/// SQLite integer keys, so parsed identities are restricted to
/// `0..=i64::MAX`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct Identity(u64);

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("invalid identity {0:?}: expected an integer in 0..=9223372036854775807")]
pub struct InvalidIdentity(pub String);

impl Identity {
    /// Largest identity accepted when parsing.
    pub const MAX: u64 = i64::MAX as u64;

    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for Identity {
    type Err = InvalidIdentity;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        // u64::from_str accepts a leading '+', which would not round-trip
        // through directory names.
        if trimmed.is_empty() || !trimmed.bytes().all(|b| b.is_ascii_digit()) {
            return Err(InvalidIdentity(s.to_string()));
        }
        trimmed
            .parse::<u64>()
            .ok()
            .filter(|&id| id <= Self::MAX)
            .map(Self)
            .ok_or_else(|| InvalidIdentity(s.to_string()))
    }
}

impl<'de> Deserialize<'de> for Identity {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Number(u64),
            Text(String),
        }

        match Raw::deserialize(deserializer)? {
            Raw::Number(n) if n <= Self::MAX => Ok(Self(n)),
            Raw::Number(n) => Err(serde::de::Error::custom(InvalidIdentity(n.to_string()))),
            Raw::Text(s) => s.parse().map_err(serde::de::Error::custom),
        }
    }
}

/// Rectangle believed to contain a face, in pixel coordinates of the frame
/// it was detected in.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FaceRegion {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
    /// Detector score for this region.
    pub confidence: f32,
}

impl FaceRegion {
    pub fn area(&self) -> u64 {
        self.width as u64 * self.height as u64
    }

    /// True when the region is non-empty and lies entirely inside a
    /// `width`×`height` frame.
    pub fn within(&self, width: u32, height: u32) -> bool {
        self.width > 0
            && self.height > 0
            && self.x as u64 + self.width as u64 <= width as u64
            && self.y as u64 + self.height as u64 <= height as u64
    }
}

/// Tuning knobs passed to a [`FaceDetect`](crate::detector::FaceDetect) call.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DetectParams {
    /// Minimum number of overlapping raw candidates merged into a region.
    pub min_neighbors: u32,
    /// Minimum width and height of a region, in pixels.
    pub min_size: u32,
}

impl Default for DetectParams {
    fn default() -> Self {
        Self {
            min_neighbors: 2,
            min_size: 30,
        }
    }
}

/// Match score normalized to [0, 100]. Higher = more certain.
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Confidence(f32);

impl Confidence {
    /// Map a recognizer distance to a confidence: `100 - distance`, clamped.
    pub fn from_distance(distance: f64) -> Self {
        let raw = if distance.is_finite() { 100.0 - distance } else { 0.0 };
        Self(raw.clamp(0.0, 100.0) as f32)
    }

    pub fn value(self) -> f32 {
        self.0
    }
}

/// Outcome of a successful identification.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Identification {
    /// `None` when the best match fell at or below the acceptance threshold.
    pub identity: Option<Identity>,
    pub confidence: Confidence,
    /// The face region that was scored.
    pub region: FaceRegion,
}

impl Identification {
    pub fn is_known(&self) -> bool {
        self.identity.is_some()
    }
}
