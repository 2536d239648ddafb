//! Fractional-day serial timestamps (days since 1899-12-30 UTC), the format
//! the record store uses for `LastTimePlayed`.

use chrono::{DateTime, Duration, TimeZone, Utc};

/// Serial value of the Unix epoch.
pub const UNIX_EPOCH_SERIAL: f64 = 25_569.0;
const MILLIS_PER_DAY: f64 = 86_400_000.0;
const SERIAL_SCALE: f64 = 1_000_000.0;

pub fn to_serial(ts: DateTime<Utc>) -> f64 {
    let days = ts.timestamp_millis() as f64 / MILLIS_PER_DAY + UNIX_EPOCH_SERIAL;
    (days * SERIAL_SCALE).round() / SERIAL_SCALE
}

pub fn from_serial(serial: f64) -> Option<DateTime<Utc>> {
    if !serial.is_finite() || serial <= 0.0 {
        return None;
    }
    let millis = ((serial - UNIX_EPOCH_SERIAL) * MILLIS_PER_DAY).round();
    if millis.abs() > i64::MAX as f64 {
        return None;
    }
    Utc.timestamp_millis_opt(millis as i64).single()
}

pub fn format_serial(serial: f64) -> String {
    format!("{serial}")
}

pub fn parse_serial(raw: &str) -> Result<Option<f64>, String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Ok(None);
    }
    let value: f64 = trimmed
        .parse()
        .map_err(|_| format!("invalid serial time: {trimmed}"))?;
    if !value.is_finite() || value < 0.0 {
        return Err(format!("invalid serial time: {trimmed}"));
    }
    if value == 0.0 {
        return Ok(None);
    }
    Ok(Some(value))
}

/// Round-trip precision of a stored serial.
pub fn serial_resolution() -> Duration {
    Duration::milliseconds((MILLIS_PER_DAY / SERIAL_SCALE).ceil() as i64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unix_epoch_maps_to_known_serial() {
        let epoch = Utc.timestamp_opt(0, 0).single().expect("epoch");
        assert_eq!(to_serial(epoch), UNIX_EPOCH_SERIAL);
        assert_eq!(from_serial(UNIX_EPOCH_SERIAL), Some(epoch));
    }

    #[test]
    fn serial_roundtrip_stays_within_resolution() {
        let ts = Utc
            .with_ymd_and_hms(2026, 3, 14, 15, 9, 26)
            .single()
            .expect("ts");
        let back = from_serial(to_serial(ts)).expect("back");
        assert!(
            (back - ts).num_milliseconds().abs() <= serial_resolution().num_milliseconds()
        );
    }

    #[test]
    fn parse_serial_accepts_blank_and_rejects_garbage() {
        assert_eq!(parse_serial(""), Ok(None));
        assert_eq!(parse_serial("0"), Ok(None));
        assert_eq!(parse_serial("45321.5"), Ok(Some(45_321.5)));
        assert!(parse_serial("yesterday").is_err());
        assert!(parse_serial("-3").is_err());
    }
}
