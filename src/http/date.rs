//! Parse dates in HTTP headers.
//!
//! See <https://www.rfc-editor.org/rfc/rfc9110#section-5.6.7>.

use chrono::NaiveDateTime;

/// Formats accepted by [`parse_http_date`], once the day of the week
/// is removed.
const FORMATS: &[&str] = &[
    // RFC 1123: `Sun, 06 Nov 1994 08:49:37 GMT`
    "%d %b %Y %H:%M:%S GMT",
    // RFC 850: `Sunday, 06-Nov-94 08:49:37 GMT`
    "%d-%b-%y %H:%M:%S GMT",
    // asctime: `Sun Nov  6 08:49:37 1994`
    "%b %e %H:%M:%S %Y",
];

/// Parse a date in any of the three formats allowed in HTTP.
///
/// The day of the week is ignored, so a date with an inconsistent
/// weekday is still accepted.
pub(super) fn parse_http_date(value: &str) -> Option<NaiveDateTime> {
    let (_, date) = value
        .trim()
        .split_once(|c: char| c == ',' || c.is_ascii_whitespace())?;

    let date = date.trim_start();

    FORMATS
        .iter()
        .find_map(|format| NaiveDateTime::parse_from_str(date, format).ok())
}

#[test]
fn parse_all_formats() {
    let expected = chrono::NaiveDate::from_ymd_opt(2014, 11, 15)
        .and_then(|d| d.and_hms_opt(8, 12, 31))
        .unwrap();

    for value in [
        "Tue, 15 Nov 2014 08:12:31 GMT",
        "Tuesday, 15-Nov-14 08:12:31 GMT",
        "Tue Nov 15 08:12:31 2014",
    ] {
        assert_eq!(parse_http_date(value), Some(expected), "{value:?}");
    }
}

#[test]
fn parse_asctime_with_padded_day() {
    let date = parse_http_date("Sun Nov  6 08:49:37 1994").unwrap();
    assert_eq!(date.to_string(), "1994-11-06 08:49:37");
}

#[test]
fn reject_invalid_dates() {
    for value in ["", "yesterday", "Tue, 45 Nov 2014 08:12:31 GMT", "Tue 2014-11-15"] {
        assert_eq!(parse_http_date(value), None, "{value:?}");
    }
}
