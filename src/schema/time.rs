//! RFC 3339 timestamps as they appear inside schema blobs.
//!
//! Times are serialized in UTC with a `Z` suffix.  Fractional seconds are
//! emitted only when the nanosecond part is nonzero, with trailing zeros
//! trimmed.  On the parse side the original string is retained so that
//! re-serializing a claim date is byte-stable, and the special `-00:01`
//! offset ("local time known, location unknown") survives untouched.

use crate::error::{Error, Result};
use chrono::{DateTime, Timelike, Utc};
use std::cmp::Ordering;
use std::fmt;

/// Formats a UTC instant in the schema wire form.
pub fn format_rfc3339(t: &DateTime<Utc>) -> String {
    let base = t.format("%Y-%m-%dT%H:%M:%S").to_string();
    let nanos = t.nanosecond();
    if nanos == 0 {
        return format!("{base}Z");
    }
    let mut frac = format!("{nanos:09}");
    while frac.ends_with('0') {
        frac.pop();
    }
    format!("{base}.{frac}Z")
}

/// A parsed RFC 3339 time that remembers its original string form.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Time3339 {
    utc: DateTime<Utc>,
    raw: String,
}

impl Time3339 {
    /// Wraps a UTC instant, deriving the canonical string form.
    pub fn new(t: DateTime<Utc>) -> Self {
        Self {
            raw: format_rfc3339(&t),
            utc: t,
        }
    }

    /// Returns the current time.
    pub fn now() -> Self {
        Self::new(Utc::now())
    }

    /// Parses an RFC 3339 string, keeping the raw form for re-emission.
    pub fn parse(s: &str) -> Result<Self> {
        let fixed = DateTime::parse_from_rfc3339(s)
            .map_err(|err| Error::InvalidArgument(format!("invalid RFC 3339 time {s:?}: {err}")))?;
        Ok(Self {
            utc: fixed.with_timezone(&Utc),
            raw: s.to_string(),
        })
    }

    /// Returns the instant in UTC.
    pub fn utc(&self) -> DateTime<Utc> {
        self.utc
    }

    /// Returns the original (or canonical) string form.
    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// Reports whether the time carries the `-00:01` offset marking a
    /// known local time at an unknown location.
    pub fn is_location_unknown(&self) -> bool {
        self.raw.ends_with("-00:01")
    }
}

impl fmt::Display for Time3339 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

impl Ord for Time3339 {
    fn cmp(&self, other: &Self) -> Ordering {
        self.utc
            .cmp(&other.utc)
            .then_with(|| self.raw.cmp(&other.raw))
    }
}

impl PartialOrd for Time3339 {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

#[cfg(test)]
mod tests {
    use super::{format_rfc3339, Time3339};
    use chrono::{TimeZone, Timelike, Utc};

    #[test]
    fn whole_seconds_have_no_fraction() {
        let t = Utc.with_ymd_and_hms(2012, 5, 13, 15, 2, 47).unwrap();
        assert_eq!(format_rfc3339(&t), "2012-05-13T15:02:47Z");
    }

    #[test]
    fn fraction_trims_trailing_zeros() {
        let t = Utc
            .with_ymd_and_hms(2012, 5, 13, 15, 2, 47)
            .unwrap()
            .with_nanosecond(120_000_000)
            .unwrap();
        assert_eq!(format_rfc3339(&t), "2012-05-13T15:02:47.12Z");

        let t = t.with_nanosecond(123_456_789).unwrap();
        assert_eq!(format_rfc3339(&t), "2012-05-13T15:02:47.123456789Z");
    }

    #[test]
    fn parse_keeps_raw_form() {
        let t = Time3339::parse("2012-05-13T15:02:47.25Z").unwrap();
        assert_eq!(t.as_str(), "2012-05-13T15:02:47.25Z");
        assert_eq!(t.utc().timestamp_subsec_nanos(), 250_000_000);
    }

    #[test]
    fn unknown_location_offset_is_preserved() {
        let t = Time3339::parse("2012-05-13T15:02:47-00:01").unwrap();
        assert!(t.is_location_unknown());
        assert_eq!(t.to_string(), "2012-05-13T15:02:47-00:01");
    }

    #[test]
    fn ordering_is_by_instant() {
        let a = Time3339::parse("2012-05-13T15:02:47Z").unwrap();
        let b = Time3339::parse("2012-05-13T16:02:47+01:00").unwrap();
        let c = Time3339::parse("2012-05-13T15:02:48Z").unwrap();
        // a and b name the same instant.
        assert_eq!(a.utc(), b.utc());
        assert!(a < c && b < c);
    }
}
