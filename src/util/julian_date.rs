//! CD-1.1 timestamps are 20 character strings `yyyyddd hh:mm:ss.mmm` (year, day of year, time of
//!  day in UTC with millisecond precision). The protocol calls this a "Julian date", though it is
//!  really an ordinal date.

use std::time::{Duration, SystemTime, UNIX_EPOCH};
use anyhow::bail;

pub const JULIAN_DATE_LEN: usize = 20;

const MILLIS_PER_DAY: i64 = 86_400_000;

/// checks the `\d{7} \d{2}:\d{2}:\d{2}\.\d{3}` shape without interpreting the numbers
pub fn is_valid_julian_date(s: &str) -> bool {
    let bytes = s.as_bytes();
    if bytes.len() != JULIAN_DATE_LEN {
        return false;
    }
    bytes.iter().enumerate().all(|(idx, b)| match idx {
        7 => *b == b' ',
        10 | 13 => *b == b':',
        16 => *b == b'.',
        _ => b.is_ascii_digit(),
    })
}

pub fn parse_julian_date(s: &str) -> anyhow::Result<SystemTime> {
    if !is_valid_julian_date(s) {
        bail!("'{}' is not a valid CD-1.1 julian date (yyyyddd hh:mm:ss.mmm)", s);
    }

    let num = |from: usize, to: usize| -> i64 {
        // the shape check above guarantees ASCII digits
        s[from..to].bytes().fold(0, |acc, b| acc * 10 + (b - b'0') as i64)
    };

    let year = num(0, 4);
    let day_of_year = num(4, 7);
    let hour = num(8, 10);
    let minute = num(11, 13);
    let second = num(14, 16);
    let millis = num(17, 20);

    let days_in_year = if is_leap_year(year) { 366 } else { 365 };
    if day_of_year < 1 || day_of_year > days_in_year {
        bail!("day of year {} out of range in '{}'", day_of_year, s);
    }
    if hour > 23 || minute > 59 || second > 59 {
        bail!("time of day out of range in '{}'", s);
    }

    let days = days_from_civil(year, 1, 1) + day_of_year - 1;
    let epoch_millis = days * MILLIS_PER_DAY
        + ((hour * 60 + minute) * 60 + second) * 1000
        + millis;

    Ok(from_epoch_millis(epoch_millis))
}

/// Sub-millisecond parts of `t` are truncated (towards the past).
pub fn format_julian_date(t: SystemTime) -> anyhow::Result<String> {
    let epoch_millis = to_epoch_millis(t);
    let days = epoch_millis.div_euclid(MILLIS_PER_DAY);
    let millis_of_day = epoch_millis.rem_euclid(MILLIS_PER_DAY);

    let (year, _, _) = civil_from_days(days);
    if !(0..=9999).contains(&year) {
        bail!("year {} cannot be represented as a CD-1.1 julian date", year);
    }
    let day_of_year = days - days_from_civil(year, 1, 1) + 1;

    let result = format!("{:04}{:03} {:02}:{:02}:{:02}.{:03}",
        year,
        day_of_year,
        millis_of_day / 3_600_000,
        (millis_of_day / 60_000) % 60,
        (millis_of_day / 1000) % 60,
        millis_of_day % 1000,
    );
    debug_assert_eq!(result.len(), JULIAN_DATE_LEN);
    Ok(result)
}

pub fn to_epoch_millis(t: SystemTime) -> i64 {
    match t.duration_since(UNIX_EPOCH) {
        Ok(d) => (d.as_nanos() / 1_000_000) as i64,
        Err(e) => {
            let nanos = e.duration().as_nanos() as i128;
            (-nanos).div_euclid(1_000_000) as i64
        }
    }
}

pub fn from_epoch_millis(millis: i64) -> SystemTime {
    if millis >= 0 {
        UNIX_EPOCH + Duration::from_millis(millis as u64)
    }
    else {
        UNIX_EPOCH - Duration::from_millis(millis.unsigned_abs())
    }
}

fn is_leap_year(year: i64) -> bool {
    (year % 4 == 0 && year % 100 != 0) || year % 400 == 0
}

/// days since 1970-01-01 for a proleptic Gregorian date (H. Hinnant's algorithm)
fn days_from_civil(year: i64, month: i64, day: i64) -> i64 {
    let y = if month <= 2 { year - 1 } else { year };
    let era = y.div_euclid(400);
    let yoe = y - era * 400;
    let mp = (month + 9) % 12;
    let doy = (153 * mp + 2) / 5 + day - 1;
    let doe = yoe * 365 + yoe / 4 - yoe / 100 + doy;
    era * 146_097 + doe - 719_468
}

fn civil_from_days(days: i64) -> (i64, i64, i64) {
    let z = days + 719_468;
    let era = z.div_euclid(146_097);
    let doe = z - era * 146_097;
    let yoe = (doe - doe / 1460 + doe / 36_524 - doe / 146_096) / 365;
    let doy = doe - (365 * yoe + yoe / 4 - yoe / 100);
    let mp = (5 * doy + 2) / 153;
    let day = doy - (153 * mp + 2) / 5 + 1;
    let month = if mp < 10 { mp + 3 } else { mp - 9 };
    let year = yoe + era * 400 + if month <= 2 { 1 } else { 0 };
    (year, month, day)
}
