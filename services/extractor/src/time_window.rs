//! Bag timestamps and the extraction time window.

use crate::error::{ExtractError, Result};
use chrono::{DateTime, NaiveDate, NaiveDateTime, TimeZone, Utc};
use std::fmt;

/// Format accepted for `min_filter_time` / `max_filter_time`.
pub const FILTER_TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Format used in output folder and file names.
pub const FOLDER_TIME_FORMAT: &str = "%Y-%m-%d_%H-%M-%S";

/// Start of the window when no start time is configured.
const DEFAULT_WINDOW_START: (i32, u32, u32) = (1980, 1, 1);

/// End of the window when no end time is configured.
const DEFAULT_WINDOW_END: (i32, u32, u32) = (2900, 12, 31);

/// Timestamp as stored in a bag: whole seconds plus nanoseconds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RosTime {
    pub secs: u32,
    pub nsecs: u32,
}

impl RosTime {
    pub const MIN: RosTime = RosTime { secs: 0, nsecs: 0 };
    pub const MAX: RosTime = RosTime {
        secs: u32::MAX,
        nsecs: 999_999_999,
    };

    pub fn new(secs: u32, nsecs: u32) -> Self {
        Self { secs, nsecs }
    }

    /// Decode the 8-byte little-endian `secs, nsecs` pair used by the bag format.
    pub fn from_le_bytes(bytes: [u8; 8]) -> Self {
        Self {
            secs: u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]),
            nsecs: u32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]),
        }
    }

    pub fn to_le_bytes(self) -> [u8; 8] {
        let mut out = [0u8; 8];
        out[..4].copy_from_slice(&self.secs.to_le_bytes());
        out[4..].copy_from_slice(&self.nsecs.to_le_bytes());
        out
    }

    /// Convert a calendar time, clamping to the range a bag can represent.
    pub fn from_datetime_saturating(dt: &DateTime<Utc>) -> Self {
        let secs = dt.timestamp();
        if secs < 0 {
            Self::MIN
        } else if secs > i64::from(u32::MAX) {
            Self::MAX
        } else {
            Self {
                secs: secs as u32,
                nsecs: dt.timestamp_subsec_nanos().min(999_999_999),
            }
        }
    }

    /// Whole-second part as a UTC calendar time.
    pub fn to_datetime(self) -> DateTime<Utc> {
        Utc.timestamp_opt(i64::from(self.secs), 0)
            .single()
            .unwrap_or(DateTime::<Utc>::MIN_UTC)
    }

    /// `YYYY-MM-DD_HH-MM-SS-<nsecs>`, the time part of an output file name.
    ///
    /// Nanoseconds are written as a plain integer without zero padding.
    pub fn file_token(self) -> String {
        format!(
            "{}-{}",
            self.to_datetime().format(FOLDER_TIME_FORMAT),
            self.nsecs
        )
    }
}

impl fmt::Display for RosTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{:09}", self.secs, self.nsecs)
    }
}

/// Inclusive time range used to prune bag messages. Missing bounds are open.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TimeRange {
    pub start: Option<RosTime>,
    pub end: Option<RosTime>,
}

impl TimeRange {
    pub fn unbounded() -> Self {
        Self::default()
    }

    pub fn new(start: Option<RosTime>, end: Option<RosTime>) -> Self {
        Self { start, end }
    }

    /// A range that admits no time at all.
    pub fn empty() -> Self {
        Self::new(Some(RosTime::MAX), Some(RosTime::MIN))
    }

    pub fn is_empty(&self) -> bool {
        matches!((self.start, self.end), (Some(start), Some(end)) if start > end)
    }

    pub fn contains(&self, time: RosTime) -> bool {
        self.start.map_or(true, |start| time >= start) && self.end.map_or(true, |end| time <= end)
    }

    /// Whether `[first, last]` shares at least one instant with this range.
    pub fn overlaps(&self, first: RosTime, last: RosTime) -> bool {
        self.start.map_or(true, |start| last >= start) && self.end.map_or(true, |end| first <= end)
    }
}

/// Validated extraction window, `start <= end`, both in UTC.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeWindow {
    start: DateTime<Utc>,
    end: DateTime<Utc>,
}

impl TimeWindow {
    /// Build a window, rejecting `start > end`.
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Result<Self> {
        if start > end {
            return Err(ExtractError::InvalidWindow {
                start: start.format(FILTER_TIME_FORMAT).to_string(),
                end: end.format(FILTER_TIME_FORMAT).to_string(),
            });
        }
        Ok(Self { start, end })
    }

    /// Parse `YYYY-MM-DD HH:MM:SS` bounds as UTC.
    ///
    /// A missing start defaults to 1980-01-01 and a missing end to 2900-12-31.
    pub fn parse(start: Option<&str>, end: Option<&str>) -> Result<Self> {
        let start = match start {
            Some(value) => parse_filter_time(value)?,
            None => calendar_day(DEFAULT_WINDOW_START),
        };
        let end = match end {
            Some(value) => parse_filter_time(value)?,
            None => calendar_day(DEFAULT_WINDOW_END),
        };
        Self::new(start, end)
    }

    pub fn start(&self) -> DateTime<Utc> {
        self.start
    }

    pub fn end(&self) -> DateTime<Utc> {
        self.end
    }

    /// `{start}_{end}` folder component, each as `YYYY-MM-DD_HH-MM-SS`.
    pub fn folder_suffix(&self) -> String {
        format!(
            "{}_{}",
            self.start.format(FOLDER_TIME_FORMAT),
            self.end.format(FOLDER_TIME_FORMAT)
        )
    }

    /// The window as a bag time range.
    ///
    /// Bounds outside the bag range saturate. A window lying entirely before
    /// 1970 or after the last representable bag second maps to an empty range.
    pub fn range(&self) -> TimeRange {
        if self.end.timestamp() < 0 || self.start.timestamp() > i64::from(u32::MAX) {
            return TimeRange::empty();
        }
        TimeRange::new(
            Some(RosTime::from_datetime_saturating(&self.start)),
            Some(RosTime::from_datetime_saturating(&self.end)),
        )
    }
}

fn parse_filter_time(value: &str) -> Result<DateTime<Utc>> {
    NaiveDateTime::parse_from_str(value.trim(), FILTER_TIME_FORMAT)
        .map(|naive| Utc.from_utc_datetime(&naive))
        .map_err(|_| ExtractError::InvalidTime {
            value: value.to_string(),
        })
}

fn calendar_day((year, month, day): (i32, u32, u32)) -> DateTime<Utc> {
    NaiveDate::from_ymd_opt(year, month, day)
        .and_then(|date| date.and_hms_opt(0, 0, 0))
        .map(|naive| Utc.from_utc_datetime(&naive))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}
