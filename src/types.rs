//! Core types for EmberDB

use serde::{Deserialize, Serialize};

/// Timestamp as an opaque monotonic 64-bit value.
///
/// EmberDB performs no calendar or timezone arithmetic; any monotone
/// sequence id can be used instead of real timestamps. Only ordering and
/// subtraction are meaningful.
pub type Timestamp = i64;

/// Minimum possible timestamp, reserved as a sentinel
pub const TIMESTAMP_MIN: Timestamp = i64::MIN;

/// Maximum possible timestamp, reserved as a sentinel
pub const TIMESTAMP_MAX: Timestamp = i64::MAX;

/// Series identifier. External series names map to ids via the registry;
/// the core treats ids as opaque.
pub type ParamId = u64;

/// Sample payload: an inline float or a descriptor of payload bytes
/// stored in a page.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum Payload {
    /// 64-bit float value
    Float(f64),
    /// Variable-length payload stored at `offset` within a page
    Blob { len: u32, offset: u32 },
}

impl Payload {
    /// Get the inline float value if present
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Payload::Float(v) => Some(*v),
            Payload::Blob { .. } => None,
        }
    }
}

impl From<f64> for Payload {
    fn from(v: f64) -> Self {
        Payload::Float(v)
    }
}

/// A single timestamped measurement for one series
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    /// Series id
    pub param_id: ParamId,
    /// Sample timestamp
    pub timestamp: Timestamp,
    /// Measured value
    pub payload: Payload,
}

impl Sample {
    /// Create a new float sample
    pub fn new(param_id: ParamId, timestamp: Timestamp, value: f64) -> Self {
        Self {
            param_id,
            timestamp,
            payload: Payload::Float(value),
        }
    }
}

/// Inclusive time range for queries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeRange {
    /// Start timestamp (inclusive)
    pub start: Timestamp,
    /// End timestamp (inclusive)
    pub end: Timestamp,
}

impl TimeRange {
    /// Create a new time range
    pub fn new(start: Timestamp, end: Timestamp) -> Self {
        Self { start, end }
    }

    /// Range covering all representable timestamps
    pub fn all() -> Self {
        Self {
            start: TIMESTAMP_MIN,
            end: TIMESTAMP_MAX,
        }
    }

    /// Check if a timestamp is within the range
    pub fn contains(&self, ts: Timestamp) -> bool {
        ts >= self.start && ts <= self.end
    }

    /// Check if two ranges overlap
    pub fn overlaps(&self, other: &TimeRange) -> bool {
        self.start <= other.end && self.end >= other.start
    }

    /// An inverted range matches nothing
    pub fn is_empty(&self) -> bool {
        self.start > self.end
    }
}

/// Scan direction for range queries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ScanDirection {
    /// Ascending timestamps
    Forward,
    /// Descending timestamps
    Backward,
}

/// Single-series time-range query plan.
///
/// The query-language parser (out of scope here) produces this plan from
/// its textual form.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SearchQuery {
    /// Series to search
    pub param: ParamId,
    /// Inclusive time window
    pub range: TimeRange,
    /// Scan direction
    pub direction: ScanDirection,
}

impl SearchQuery {
    /// Forward scan over `[lo, hi]` for one series
    pub fn forward(param: ParamId, lo: Timestamp, hi: Timestamp) -> Self {
        Self {
            param,
            range: TimeRange::new(lo, hi),
            direction: ScanDirection::Forward,
        }
    }

    /// Backward scan over `[lo, hi]` for one series
    pub fn backward(param: ParamId, lo: Timestamp, hi: Timestamp) -> Self {
        Self {
            param,
            range: TimeRange::new(lo, hi),
            direction: ScanDirection::Backward,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_time_range() {
        let range1 = TimeRange::new(100, 200);
        let range2 = TimeRange::new(150, 250);
        let range3 = TimeRange::new(300, 400);

        assert!(range1.overlaps(&range2));
        assert!(!range1.overlaps(&range3));
        assert!(range1.contains(150));
        assert!(!range1.contains(250));
        assert!(TimeRange::new(10, 5).is_empty());
    }

    #[test]
    fn test_payload() {
        let p = Payload::Float(3.5);
        assert_eq!(p.as_f64(), Some(3.5));

        let b = Payload::Blob { len: 8, offset: 100 };
        assert_eq!(b.as_f64(), None);
    }

    #[test]
    fn test_search_query() {
        let q = SearchQuery::forward(7, 10, 20);
        assert_eq!(q.param, 7);
        assert_eq!(q.range, TimeRange::new(10, 20));
        assert_eq!(q.direction, ScanDirection::Forward);

        let q = SearchQuery::backward(7, 10, 20);
        assert_eq!(q.direction, ScanDirection::Backward);
    }
}
