//! DOS timestamps as stored in directory entries.
//!
//! Dates are packed as `year-1980:7 | month:4 | day:5` and times as
//! `hour:5 | minute:6 | second/2:5`, with an optional extra byte holding
//! hundredths of a second in `0..200` for creation times.

/// A calendar date between 1980-01-01 and 2107-12-31.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Debug)]
pub struct Date {
    year: u16,
    month: u8,
    day: u8,
}

impl Date {
    const MIN_YEAR: u16 = 1980;
    const MAX_YEAR: u16 = 2107;

    /// 1980-01-01, the earliest representable date.
    pub const EPOCH: Self = Self {
        year: Self::MIN_YEAR,
        month: 1,
        day: 1,
    };

    #[must_use]
    /// Returns `None` if the date is not a valid date in the DOS range.
    pub const fn new(year: u16, month: u8, day: u8) -> Option<Self> {
        if year < Self::MIN_YEAR || year > Self::MAX_YEAR || month < 1 || month > 12 {
            return None;
        }
        if day < 1 || day > days_in_month(year, month) {
            return None;
        }
        Some(Self { year, month, day })
    }

    #[must_use]
    #[expect(clippy::cast_possible_truncation, reason = "fields are masked")]
    /// Decodes a packed date. Fields are taken as stored, even when out of range.
    pub const fn from_dos(raw: u16) -> Self {
        Self {
            year: (raw >> 9) + Self::MIN_YEAR,
            month: ((raw >> 5) & 0xF) as u8,
            day: (raw & 0x1F) as u8,
        }
    }

    #[must_use]
    pub const fn to_dos(self) -> u16 {
        ((self.year - Self::MIN_YEAR) << 9) | ((self.month as u16) << 5) | self.day as u16
    }

    #[must_use]
    #[inline]
    pub const fn year(&self) -> u16 {
        self.year
    }

    #[must_use]
    #[inline]
    pub const fn month(&self) -> u8 {
        self.month
    }

    #[must_use]
    #[inline]
    pub const fn day(&self) -> u8 {
        self.day
    }
}

const fn days_in_month(year: u16, month: u8) -> u8 {
    match month {
        2 if year % 4 == 0 && (year % 100 != 0 || year % 400 == 0) => 29,
        2 => 28,
        4 | 6 | 9 | 11 => 30,
        _ => 31,
    }
}

/// A time of day with a 10 ms resolution.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Debug)]
pub struct Time {
    hour: u8,
    min: u8,
    sec: u8,
    ms: u16,
}

impl Time {
    pub const MIDNIGHT: Self = Self {
        hour: 0,
        min: 0,
        sec: 0,
        ms: 0,
    };

    #[must_use]
    pub const fn new(hour: u8, min: u8, sec: u8, ms: u16) -> Option<Self> {
        if hour > 23 || min > 59 || sec > 59 || ms > 999 {
            return None;
        }
        Some(Self { hour, min, sec, ms })
    }

    #[must_use]
    #[expect(clippy::cast_possible_truncation, reason = "fields are masked")]
    /// Decodes a packed time and its hundredths byte (0 when absent).
    pub const fn from_dos(raw: u16, hundredths: u8) -> Self {
        Self {
            hour: (raw >> 11) as u8,
            min: ((raw >> 5) & 0x3F) as u8,
            sec: (raw & 0x1F) as u8 * 2 + hundredths / 100,
            ms: (hundredths % 100) as u16 * 10,
        }
    }

    #[must_use]
    #[expect(clippy::cast_possible_truncation, reason = "ms is at most 999")]
    /// Encodes the time as its packed value and hundredths byte.
    pub const fn to_dos(self) -> (u16, u8) {
        let raw = ((self.hour as u16) << 11) | ((self.min as u16) << 5) | (self.sec as u16 / 2);
        let hundredths = (self.ms / 10) as u8 + (self.sec % 2) * 100;
        (raw, hundredths)
    }

    #[must_use]
    #[inline]
    pub const fn hour(&self) -> u8 {
        self.hour
    }

    #[must_use]
    #[inline]
    pub const fn min(&self) -> u8 {
        self.min
    }

    #[must_use]
    #[inline]
    pub const fn sec(&self) -> u8 {
        self.sec
    }

    #[must_use]
    #[inline]
    pub const fn ms(&self) -> u16 {
        self.ms
    }
}

#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Debug)]
pub struct DateTime {
    date: Date,
    time: Time,
}

impl DateTime {
    pub const EPOCH: Self = Self::new(Date::EPOCH, Time::MIDNIGHT);

    #[must_use]
    #[inline]
    pub const fn new(date: Date, time: Time) -> Self {
        Self { date, time }
    }

    #[must_use]
    #[inline]
    pub const fn date(&self) -> Date {
        self.date
    }

    #[must_use]
    #[inline]
    pub const fn time(&self) -> Time {
        self.time
    }
}

/// Source of the timestamps stamped on created and modified entries.
pub trait TimeProvider {
    fn now(&self) -> DateTime;
}

/// Always reports the DOS epoch, for hosts without a wall clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct DosEpochClock;

impl TimeProvider for DosEpochClock {
    #[inline]
    fn now(&self) -> DateTime {
        DateTime::EPOCH
    }
}

/// Always reports the same instant.
#[derive(Debug, Clone, Copy)]
pub struct FixedClock(pub DateTime);

impl TimeProvider for FixedClock {
    #[inline]
    fn now(&self) -> DateTime {
        self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_date_range() {
        assert!(Date::new(1980, 1, 1).is_some());
        assert!(Date::new(2107, 12, 31).is_some());
        assert!(Date::new(1979, 12, 31).is_none());
        assert!(Date::new(2108, 1, 1).is_none());
        assert!(Date::new(2023, 2, 29).is_none());
        assert!(Date::new(2024, 2, 29).is_some());
        assert!(Date::new(2024, 4, 31).is_none());
        assert!(Date::new(2024, 13, 1).is_none());
    }

    #[test]
    fn test_date_encode_decode() {
        let date = Date::new(2055, 7, 23).unwrap();
        assert_eq!(date.to_dos(), 38647);
        assert_eq!(Date::from_dos(38647), date);
        assert_eq!(Date::EPOCH.to_dos(), 33);
    }

    #[test]
    fn test_time_encode_decode() {
        let t1 = Time::new(15, 3, 29, 990).unwrap();
        let t2 = Time::new(15, 3, 18, 990).unwrap();
        let t3 = Time::new(15, 3, 29, 40).unwrap();
        assert_eq!(t1.to_dos(), (30830, 199));
        assert_eq!(t2.to_dos(), (30825, 99));
        assert_eq!(t3.to_dos(), (30830, 104));
        for time in [t1, t2, t3] {
            let (raw, hundredths) = time.to_dos();
            assert_eq!(Time::from_dos(raw, hundredths), time);
        }

        // Without the hundredths byte only even seconds survive.
        let (raw, _) = t1.to_dos();
        assert_eq!(Time::from_dos(raw, 0), Time::new(15, 3, 28, 0).unwrap());
    }

    #[test]
    fn test_clocks() {
        assert_eq!(DosEpochClock.now(), DateTime::EPOCH);
        let instant = DateTime::new(
            Date::new(2024, 5, 17).unwrap(),
            Time::new(9, 30, 0, 0).unwrap(),
        );
        assert_eq!(FixedClock(instant).now(), instant);
    }
}
