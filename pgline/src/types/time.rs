//! Conversions between [`Timestamp`] and the [`time`] crate, `time` feature.
use time::{Duration, PrimitiveDateTime, UtcDateTime};

use super::value::Timestamp;

const PRIMITIVE_PG_EPOCH: PrimitiveDateTime = {
    // source: `from_julian_day` docs
    let date = match time::Date::from_julian_day(2_451_545) {
        Ok(ok) => ok,
        Err(_) => panic!("julian day of 2000-01-01 is valid"),
    };
    PrimitiveDateTime::new(date, time::Time::MIDNIGHT)
};

const UTC_PG_EPOCH: UtcDateTime = {
    // source: `from_julian_day` docs
    let date = match time::Date::from_julian_day(2_451_545) {
        Ok(ok) => ok,
        Err(_) => panic!("julian day of 2000-01-01 is valid"),
    };
    UtcDateTime::new(date, time::Time::MIDNIGHT)
};

impl From<PrimitiveDateTime> for Timestamp {
    fn from(value: PrimitiveDateTime) -> Self {
        let delta = value - PRIMITIVE_PG_EPOCH;
        Timestamp::from_micros(delta.whole_microseconds() as i64)
    }
}

impl From<UtcDateTime> for Timestamp {
    fn from(value: UtcDateTime) -> Self {
        let delta = value - UTC_PG_EPOCH;
        Timestamp::from_micros(delta.whole_microseconds() as i64)
    }
}

impl From<Timestamp> for PrimitiveDateTime {
    /// The infinity values saturate to the representable range.
    fn from(value: Timestamp) -> Self {
        PRIMITIVE_PG_EPOCH.saturating_add(Duration::microseconds(value.micros()))
    }
}

impl From<Timestamp> for UtcDateTime {
    /// The infinity values saturate to the representable range.
    fn from(value: Timestamp) -> Self {
        UTC_PG_EPOCH.saturating_add(Duration::microseconds(value.micros()))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn epoch_is_zero() {
        assert_eq!(Timestamp::from(PRIMITIVE_PG_EPOCH).micros(), 0);
        assert_eq!(PrimitiveDateTime::from(Timestamp::from_micros(0)), PRIMITIVE_PG_EPOCH);
    }

    #[test]
    fn microseconds_survive_the_round_trip() {
        let ts = Timestamp::from_micros(1_234_567_890_123);
        let dt = PrimitiveDateTime::from(ts);
        assert_eq!(Timestamp::from(dt), ts);
    }
}
