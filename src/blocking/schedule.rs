//! Wall-clock windows for scheduled pause and family time.

use crate::config::TimeWindowConfig;
use crate::error::{GjallarError, Result};
use chrono::{DateTime, Datelike, Local, Timelike};

/// A weekly recurring window: minutes-of-day bounds plus a weekday bitmask
/// (bit 0 = Monday). Windows crossing midnight wrap; the window's weekday is
/// the day it starts on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeWindow {
    start_minute: u16,
    end_minute: u16,
    weekdays: u8,
}

fn parse_hhmm(value: &str) -> Result<u16> {
    let (hours, minutes) = value
        .split_once(':')
        .ok_or_else(|| GjallarError::InvalidTimeWindow(value.to_string()))?;
    let hours: u16 = hours
        .parse()
        .map_err(|_| GjallarError::InvalidTimeWindow(value.to_string()))?;
    let minutes: u16 = minutes
        .parse()
        .map_err(|_| GjallarError::InvalidTimeWindow(value.to_string()))?;
    if hours > 23 || minutes > 59 {
        return Err(GjallarError::InvalidTimeWindow(value.to_string()));
    }
    Ok(hours * 60 + minutes)
}

fn parse_weekday(value: &str) -> Result<u8> {
    let bit = match value.to_ascii_lowercase().as_str() {
        "mon" | "monday" => 0,
        "tue" | "tuesday" => 1,
        "wed" | "wednesday" => 2,
        "thu" | "thursday" => 3,
        "fri" | "friday" => 4,
        "sat" | "saturday" => 5,
        "sun" | "sunday" => 6,
        _ => return Err(GjallarError::InvalidTimeWindow(value.to_string())),
    };
    Ok(1 << bit)
}

impl TimeWindow {
    pub fn parse(start: &str, end: &str, days: &[String]) -> Result<Self> {
        let start_minute = parse_hhmm(start)?;
        let end_minute = parse_hhmm(end)?;

        let mut weekdays = 0u8;
        for day in days {
            weekdays |= parse_weekday(day)?;
        }
        if weekdays == 0 {
            // No days listed means every day.
            weekdays = 0x7F;
        }

        Ok(Self {
            start_minute,
            end_minute,
            weekdays,
        })
    }

    pub fn from_config(config: &TimeWindowConfig) -> Result<Self> {
        Self::parse(&config.start, &config.end, &config.days)
    }

    pub fn contains(&self, now: &DateTime<Local>) -> bool {
        let minute = (now.hour() * 60 + now.minute()) as u16;
        let today = 1u8 << now.weekday().num_days_from_monday();

        if self.start_minute <= self.end_minute {
            self.weekdays & today != 0 && minute >= self.start_minute && minute < self.end_minute
        } else {
            // Overnight window: the part before midnight belongs to the
            // start day, the part after to the following day.
            let yesterday = 1u8 << now.weekday().pred().num_days_from_monday();
            (self.weekdays & today != 0 && minute >= self.start_minute)
                || (self.weekdays & yesterday != 0 && minute < self.end_minute)
        }
    }
}
