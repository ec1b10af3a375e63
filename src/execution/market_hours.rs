use chrono::{DateTime, Datelike, NaiveTime, Utc, Weekday};
use chrono_tz::Tz;

/// Regular trading session in the exchange's local time.
#[derive(Debug, Clone, Copy)]
pub struct MarketHours {
    pub tz: Tz,
    pub open: NaiveTime,
    pub close: NaiveTime,
}

impl MarketHours {
    pub fn new(tz: Tz, open: NaiveTime, close: NaiveTime) -> Self {
        Self { tz, open, close }
    }

    /// Weekday and `open <= local time <= close`, both bounds inclusive.
    pub fn is_open(&self, at: DateTime<Utc>) -> bool {
        let local = at.with_timezone(&self.tz);
        if matches!(local.weekday(), Weekday::Sat | Weekday::Sun) {
            return false;
        }
        let t = local.time();
        t >= self.open && t <= self.close
    }
}

impl Default for MarketHours {
    fn default() -> Self {
        Self {
            tz: chrono_tz::America::Toronto,
            open: NaiveTime::from_hms_opt(9, 30, 0).unwrap_or(NaiveTime::MIN),
            close: NaiveTime::from_hms_opt(15, 59, 0).unwrap_or(NaiveTime::MIN),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn utc(y: i32, m: u32, d: u32, h: u32, min: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, h, min, s).unwrap()
    }

    #[test]
    fn test_session_bounds_in_toronto() {
        let hours = MarketHours::default();
        // 2025-11-07 is a Friday; Toronto is UTC-5 after the DST change.
        assert!(!hours.is_open(utc(2025, 11, 7, 12, 0, 0)));
        assert!(hours.is_open(utc(2025, 11, 7, 14, 30, 0)));
        assert!(hours.is_open(utc(2025, 11, 7, 20, 59, 0)));
        assert!(!hours.is_open(utc(2025, 11, 7, 20, 59, 30)));
        assert!(!hours.is_open(utc(2025, 11, 7, 21, 0, 0)));
    }

    #[test]
    fn test_daylight_saving_offset() {
        let hours = MarketHours::default();
        // July: UTC-4, so 13:30 UTC is the open.
        assert!(hours.is_open(utc(2025, 7, 15, 13, 30, 0)));
        assert!(!hours.is_open(utc(2025, 7, 15, 13, 29, 0)));
    }

    #[test]
    fn test_weekend_closed() {
        let hours = MarketHours::default();
        assert!(!hours.is_open(utc(2025, 11, 8, 15, 0, 0)));
        assert!(!hours.is_open(utc(2025, 11, 9, 15, 0, 0)));
    }
}
