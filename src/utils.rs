use crate::prelude::*;

use chrono::{DateTime, Local, NaiveDateTime, TimeZone};

/// Format used for every datetime string in the database and on the command line.
pub const DATETIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

pub struct Utils;

impl Utils {
    /// Space separated lowercase hex, used when tracing frames.
    pub fn hex(data: &[u8]) -> String {
        data.iter()
            .map(|b| format!("{:02x}", b))
            .collect::<Vec<_>>()
            .join(" ")
    }

    pub fn local_datetime(timestamp: i64) -> Result<DateTime<Local>> {
        Local
            .timestamp_opt(timestamp, 0)
            .single()
            .ok_or_else(|| anyhow!("utils.rs:timestamp {} out of range", timestamp))
    }

    /// Human readable local time for log lines; falls back to the raw number.
    pub fn describe_timestamp(timestamp: i64) -> String {
        match Self::local_datetime(timestamp) {
            Ok(dt) => dt.format(DATETIME_FORMAT).to_string(),
            Err(_) => timestamp.to_string(),
        }
    }

    pub fn format_local(timestamp: i64) -> Result<String> {
        Ok(Self::local_datetime(timestamp)?
            .format(DATETIME_FORMAT)
            .to_string())
    }

    /// UTC offset of local standard time in seconds, daylight saving removed.
    pub fn standard_utc_offset(year: i32) -> i64 {
        let offset_at = |month| {
            Local
                .with_ymd_and_hms(year, month, 1, 12, 0, 0)
                .earliest()
                .map(|dt| dt.offset().local_minus_utc() as i64)
        };

        match (offset_at(1), offset_at(7)) {
            (Some(winter), Some(summer)) => winter.min(summer),
            (Some(offset), None) | (None, Some(offset)) => offset,
            (None, None) => 0,
        }
    }

    /// Parses a local `YYYY-MM-DD HH:MM:SS` string into unix seconds. Times
    /// repeated by a DST change resolve to the earlier instant.
    pub fn parse_local(input: &str) -> Result<i64> {
        let naive = NaiveDateTime::parse_from_str(input.trim(), DATETIME_FORMAT)
            .with_context(|| format!("invalid datetime {:?}, expected YYYY-MM-DD HH:MM:SS", input))?;

        Local
            .from_local_datetime(&naive)
            .earliest()
            .map(|dt| dt.timestamp())
            .ok_or_else(|| anyhow!("utils.rs:{} does not exist in local time", input))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hex_dump() {
        assert_eq!(Utils::hex(&[0x7e, 0x00, 0xff]), "7e 00 ff");
        assert_eq!(Utils::hex(&[]), "");
    }

    #[test]
    fn local_round_trip() -> Result<()> {
        let ts = Utils::parse_local("2024-06-01 12:05:00")?;
        assert_eq!(Utils::format_local(ts)?, "2024-06-01 12:05:00");
        Ok(())
    }

    #[test]
    fn standard_offset_is_whole_minutes() {
        let offset = Utils::standard_utc_offset(2024);
        assert_eq!(offset % 60, 0);
        assert!(offset.abs() <= 14 * 3600);
    }

    #[test]
    fn rejects_garbage() {
        assert!(Utils::parse_local("yesterday").is_err());
    }
}
