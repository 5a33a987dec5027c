//! ISO-8601 durations (`PT1H30M`, `P2DT0.5S`, `-PT5S`) for `chrono::Duration`.
//!
//! chrono has no serde support for durations, so fields opt in with
//! `#[serde(with = "sourcekit_codec::duration")]` (or `duration::option` for
//! `Option<Duration>`), or use the [`IsoDuration`] newtype inside collections.

use chrono::Duration;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

const SECONDS_PER_MINUTE: i64 = 60;
const SECONDS_PER_HOUR: i64 = 3_600;
const SECONDS_PER_DAY: i64 = 86_400;
const NANOS_PER_SECOND: i64 = 1_000_000_000;
/// Largest whole-second magnitude chrono can represent.
const MAX_SECONDS: i64 = i64::MAX / 1_000;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("invalid ISO-8601 duration `{input}`: {reason}")]
pub struct DurationParseError {
    input: String,
    reason: &'static str,
}

impl DurationParseError {
    fn new(input: &str, reason: &'static str) -> Self {
        Self {
            input: input.to_string(),
            reason,
        }
    }
}

/// Render a duration as ISO-8601, days being the largest unit.
pub fn format(duration: &Duration) -> String {
    let negative = *duration < Duration::zero();
    let magnitude = if negative { -*duration } else { *duration };

    let total_seconds = magnitude.num_seconds();
    let nanos = i64::from(magnitude.subsec_nanos()).abs();

    let days = total_seconds / SECONDS_PER_DAY;
    let hours = (total_seconds % SECONDS_PER_DAY) / SECONDS_PER_HOUR;
    let minutes = (total_seconds % SECONDS_PER_HOUR) / SECONDS_PER_MINUTE;
    let seconds = total_seconds % SECONDS_PER_MINUTE;

    let mut out = String::new();
    if negative {
        out.push('-');
    }
    out.push('P');
    if days > 0 {
        out.push_str(&format!("{days}D"));
    }

    let has_time = hours > 0 || minutes > 0 || seconds > 0 || nanos > 0;
    if has_time || days == 0 {
        out.push('T');
    }
    if hours > 0 {
        out.push_str(&format!("{hours}H"));
    }
    if minutes > 0 {
        out.push_str(&format!("{minutes}M"));
    }
    if nanos > 0 {
        let fraction = format!("{nanos:09}");
        out.push_str(&format!("{seconds}.{}S", fraction.trim_end_matches('0')));
    } else if seconds > 0 || !has_time && days == 0 {
        out.push_str(&format!("{seconds}S"));
    }
    out
}

/// Parse `[-+]P[nD][T[nH][nM][n[.f]S]]`; component values may carry their own sign.
pub fn parse(input: &str) -> Result<Duration, DurationParseError> {
    let err = |reason| DurationParseError::new(input, reason);

    let (negative, rest) = match input.as_bytes().first() {
        Some(b'-') => (true, &input[1..]),
        Some(b'+') => (false, &input[1..]),
        _ => (false, input),
    };
    let rest = rest
        .strip_prefix('P')
        .or_else(|| rest.strip_prefix('p'))
        .ok_or_else(|| err("must start with 'P'"))?;
    if rest.is_empty() {
        return Err(err("no components"));
    }

    let (date_part, time_part) = match rest.find(['T', 't']) {
        Some(idx) => (&rest[..idx], Some(&rest[idx + 1..])),
        None => (rest, None),
    };

    let mut total_nanos: i128 = 0;
    let mut components = 0;

    let mut last_rank = 0;
    for (value, unit) in components_of(date_part).map_err(err)? {
        let (rank, factor) = match unit {
            'W' => (1, 7 * SECONDS_PER_DAY),
            'D' => (2, SECONDS_PER_DAY),
            _ => return Err(err("unsupported date unit (only W and D are fixed-length)")),
        };
        if rank <= last_rank {
            return Err(err("date components out of order"));
        }
        last_rank = rank;
        let nanos = scaled(whole(value).map_err(err)?, factor);
        total_nanos = accumulate(total_nanos, nanos).map_err(err)?;
        components += 1;
    }

    if let Some(time_part) = time_part {
        if time_part.is_empty() {
            return Err(err("'T' must be followed by a component"));
        }
        let mut last_rank = 0;
        for (value, unit) in components_of(time_part).map_err(err)? {
            let (rank, factor) = match unit {
                'H' => (1, SECONDS_PER_HOUR),
                'M' => (2, SECONDS_PER_MINUTE),
                'S' => (3, 1),
                _ => return Err(err("unknown time unit")),
            };
            if rank <= last_rank {
                return Err(err("time components out of order"));
            }
            last_rank = rank;
            let nanos = if unit == 'S' {
                Some(fractional_seconds(value).map_err(err)?)
            } else {
                scaled(whole(value).map_err(err)?, factor)
            };
            total_nanos = accumulate(total_nanos, nanos).map_err(err)?;
            components += 1;
        }
    }

    if components == 0 {
        return Err(err("no components"));
    }
    if negative {
        total_nanos = -total_nanos;
    }

    let seconds = total_nanos / i128::from(NANOS_PER_SECOND);
    let nanos = total_nanos % i128::from(NANOS_PER_SECOND);
    if seconds.abs() > i128::from(MAX_SECONDS) {
        return Err(err("out of range"));
    }
    // Both casts are in range after the check above.
    Duration::try_seconds(seconds as i64)
        .and_then(|whole| whole.checked_add(&Duration::nanoseconds(nanos as i64)))
        .ok_or_else(|| err("out of range"))
}

fn scaled(value: i128, factor_seconds: i64) -> Option<i128> {
    value.checked_mul(i128::from(factor_seconds) * i128::from(NANOS_PER_SECOND))
}

fn accumulate(total: i128, nanos: Option<i128>) -> Result<i128, &'static str> {
    nanos
        .and_then(|nanos| total.checked_add(nanos))
        .ok_or("out of range")
}

/// Split `12H30M5.5S` into `[("12", 'H'), ("30", 'M'), ("5.5", 'S')]`.
fn components_of(part: &str) -> Result<Vec<(&str, char)>, &'static str> {
    let mut out = Vec::new();
    let mut start = 0;
    for (idx, ch) in part.char_indices() {
        if ch.is_ascii_alphabetic() {
            let value = &part[start..idx];
            if value.is_empty() {
                return Err("unit without a value");
            }
            out.push((value, ch.to_ascii_uppercase()));
            start = idx + ch.len_utf8();
        }
    }
    if start != part.len() {
        return Err("value without a unit");
    }
    Ok(out)
}

fn whole(value: &str) -> Result<i128, &'static str> {
    value.parse::<i64>().map(i128::from).map_err(|_| "not an integer")
}

fn fractional_seconds(value: &str) -> Result<i128, &'static str> {
    let (sign, digits) = match value.strip_prefix('-') {
        Some(rest) => (-1, rest),
        None => (1, value.strip_prefix('+').unwrap_or(value)),
    };
    let (int_part, frac_part) = match digits.split_once(['.', ',']) {
        Some((i, f)) => (i, f),
        None => (digits, ""),
    };
    if int_part.is_empty() || !int_part.bytes().all(|b| b.is_ascii_digit()) {
        return Err("not a number");
    }
    if frac_part.len() > 9 || !frac_part.bytes().all(|b| b.is_ascii_digit()) {
        return Err("fraction must have at most 9 digits");
    }
    let seconds: i128 = int_part.parse().map_err(|_| "not a number")?;
    let nanos: i128 = if frac_part.is_empty() {
        0
    } else {
        format!("{frac_part:0<9}").parse().map_err(|_| "not a number")?
    };
    seconds
        .checked_mul(i128::from(NANOS_PER_SECOND))
        .and_then(|whole| whole.checked_add(nanos))
        .map(|total| sign * total)
        .ok_or("out of range")
}

pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    serializer.serialize_str(&format(duration))
}

pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = String::deserialize(deserializer)?;
    parse(&raw).map_err(serde::de::Error::custom)
}

/// `Option<Duration>` variant: `None` encodes as null.
pub mod option {
    use super::*;

    pub fn serialize<S>(duration: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match duration {
            Some(d) => serializer.serialize_some(&format(d)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
    where
        D: Deserializer<'de>,
    {
        Option::<String>::deserialize(deserializer)?
            .map(|raw| parse(&raw).map_err(serde::de::Error::custom))
            .transpose()
    }
}

/// A `chrono::Duration` that (de)serializes as an ISO-8601 string.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct IsoDuration(pub Duration);

impl From<Duration> for IsoDuration {
    fn from(value: Duration) -> Self {
        Self(value)
    }
}

impl From<IsoDuration> for Duration {
    fn from(value: IsoDuration) -> Self {
        value.0
    }
}

impl Serialize for IsoDuration {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serialize(&self.0, serializer)
    }
}

impl<'de> Deserialize<'de> for IsoDuration {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        deserialize(deserializer).map(IsoDuration)
    }
}
