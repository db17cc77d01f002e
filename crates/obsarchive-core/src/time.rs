//! Timestamp helpers for producers that decode instrument text.
//!
//! Instruments usually stamp records with naive local text such as
//! `"2024-06-01 12:00:05"`. The engine stores epoch seconds UTC, so these
//! helpers normalize that text before it is appended.

use chrono::{FixedOffset, NaiveDateTime, TimeZone};
use snafu::prelude::*;

use crate::error::{ArchiveResult, InvalidLocalTimeSnafu, InvalidTimestampSnafu};

/// Parse naive text with a `strftime` format, interpreting it as UTC.
///
/// ```
/// use obsarchive_core::time::parse_timestamp;
///
/// let t = parse_timestamp("2020-01-01 00:00:00", "%Y-%m-%d %H:%M:%S").unwrap();
/// assert_eq!(t, 1_577_836_800);
/// ```
pub fn parse_timestamp(text: &str, format: &str) -> ArchiveResult<i64> {
    let naive = NaiveDateTime::parse_from_str(text, format).context(InvalidTimestampSnafu {
        text,
        format,
    })?;
    Ok(naive.and_utc().timestamp())
}

/// Parse naive text recorded at a fixed UTC offset (seconds east of UTC).
pub fn parse_local_timestamp(
    text: &str,
    format: &str,
    utc_offset_seconds: i32,
) -> ArchiveResult<i64> {
    let naive = NaiveDateTime::parse_from_str(text, format).context(InvalidTimestampSnafu {
        text,
        format,
    })?;
    let offset = FixedOffset::east_opt(utc_offset_seconds).context(InvalidLocalTimeSnafu {
        text,
        offset_seconds: utc_offset_seconds,
    })?;
    let local = offset
        .from_local_datetime(&naive)
        .single()
        .context(InvalidLocalTimeSnafu {
            text,
            offset_seconds: utc_offset_seconds,
        })?;
    Ok(local.timestamp())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ArchiveError;

    const FMT: &str = "%Y-%m-%d %H:%M:%S";

    #[test]
    fn local_offset_shifts_to_utc() -> ArchiveResult<()> {
        let utc = parse_timestamp("2024-06-01 12:00:00", FMT)?;
        let cet = parse_local_timestamp("2024-06-01 14:00:00", FMT, 2 * 3600)?;
        assert_eq!(utc, cet);
        Ok(())
    }

    #[test]
    fn bad_text_and_offsets_are_rejected() {
        assert!(matches!(
            parse_timestamp("yesterday", FMT),
            Err(ArchiveError::InvalidTimestamp { .. })
        ));
        assert!(matches!(
            parse_local_timestamp("2024-06-01 14:00:00", FMT, 90_000),
            Err(ArchiveError::InvalidLocalTime { .. })
        ));
    }
}
