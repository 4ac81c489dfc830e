//! Setting arguments
//!
//! Turns `set` command words such as `target 21`, `hot-water on` or
//! `heat-schedule weekend 08:00=21 22:30=16` into a [`Setting`]. Only the
//! shape is checked here; ranges are enforced by the hub.

use crate::core::hub::{Setting, UNUSED_SLOT_HOUR};
use crate::core::protocol::dcb::{
    HotWaterMode, HotWaterPeriod, RunMode, SetPoint, SwitchTime, HEAT_SETPOINTS, HOLIDAY_HOURS_MAX,
    HOT_WATER_PERIODS,
};

/// Usage text for the `set` command
pub const SETTING_USAGE: &str = "\
target <°C>
away <°C>
mode heating|frost
hot-water timer|on|off
holiday <hours>|off|away
time now|<day 1-7> <HH:MM[:SS]>
heat-schedule weekday|weekend <HH:MM=°C>...
water-schedule weekday|weekend <HH:MM-HH:MM>...";

fn number<T: std::str::FromStr>(word: &str, what: &str) -> Result<T, String> {
    word.parse()
        .map_err(|_| format!("invalid {what}: {word}"))
}

fn clock(word: &str) -> Result<(u8, u8, u8), String> {
    let parts: Vec<&str> = word.split(':').collect();
    match parts.as_slice() {
        [h, m] => Ok((number(h, "hour")?, number(m, "minute")?, 0)),
        [h, m, s] => Ok((number(h, "hour")?, number(m, "minute")?, number(s, "second")?)),
        _ => Err(format!("expected HH:MM, got {word}")),
    }
}

fn switch_time(word: &str) -> Result<SwitchTime, String> {
    let (hour, minute, _) = clock(word)?;
    Ok(SwitchTime { hour, minute })
}

fn weekend(word: Option<&str>) -> Result<bool, String> {
    match word {
        Some("weekday") => Ok(false),
        Some("weekend") => Ok(true),
        Some(other) => Err(format!("expected weekday or weekend, got {other}")),
        None => Err("missing weekday|weekend".to_string()),
    }
}

fn heat_points(words: &[&str]) -> Result<[SetPoint; HEAT_SETPOINTS], String> {
    if words.is_empty() || words.len() > HEAT_SETPOINTS {
        return Err(format!("expected 1 to {HEAT_SETPOINTS} set-points"));
    }
    let mut points = [SetPoint {
        hour: UNUSED_SLOT_HOUR,
        minute: 0,
        temperature: 0,
    }; HEAT_SETPOINTS];
    for (slot, word) in points.iter_mut().zip(words) {
        let (time, temperature) = word
            .split_once('=')
            .ok_or_else(|| format!("expected HH:MM=°C, got {word}"))?;
        let (hour, minute, _) = clock(time)?;
        *slot = SetPoint {
            hour,
            minute,
            temperature: number(temperature, "temperature")?,
        };
    }
    Ok(points)
}

fn water_periods(words: &[&str]) -> Result<[HotWaterPeriod; HOT_WATER_PERIODS], String> {
    if words.is_empty() || words.len() > HOT_WATER_PERIODS {
        return Err(format!("expected 1 to {HOT_WATER_PERIODS} periods"));
    }
    let unused = SwitchTime {
        hour: UNUSED_SLOT_HOUR,
        minute: 0,
    };
    let mut periods = [HotWaterPeriod {
        on: unused,
        off: unused,
    }; HOT_WATER_PERIODS];
    for (slot, word) in periods.iter_mut().zip(words) {
        let (on, off) = word
            .split_once('-')
            .ok_or_else(|| format!("expected HH:MM-HH:MM, got {word}"))?;
        *slot = HotWaterPeriod {
            on: switch_time(on)?,
            off: switch_time(off)?,
        };
    }
    Ok(periods)
}

/// Parse `set` command words
pub fn parse_setting<S: AsRef<str>>(words: &[S]) -> Result<Setting, String> {
    let words: Vec<&str> = words.iter().map(AsRef::as_ref).collect();
    let Some((&name, rest)) = words.split_first() else {
        return Err(format!("missing setting, one of:\n{SETTING_USAGE}"));
    };
    let arg = |i: usize| rest.get(i).copied().ok_or_else(|| format!("{name}: missing value"));

    let setting = match name.to_lowercase().replace('_', "-").as_str() {
        "target" | "target-temperature" => Setting::TargetTemperature(number(arg(0)?, "temperature")?),
        "away" | "frost" | "away-temperature" => Setting::AwayTemperature(number(arg(0)?, "temperature")?),
        "mode" | "run-mode" => match arg(0)? {
            "heating" | "heat" => Setting::RunMode(RunMode::Heating),
            "frost" | "frost-protect" => Setting::RunMode(RunMode::FrostProtect),
            other => return Err(format!("unknown run mode: {other}")),
        },
        "hot-water" | "dhw" => match arg(0)? {
            "timer" | "auto" => Setting::HotWater(HotWaterMode::Timer),
            "on" => Setting::HotWater(HotWaterMode::On),
            "off" => Setting::HotWater(HotWaterMode::Off),
            other => return Err(format!("unknown hot-water mode: {other}")),
        },
        "holiday" => match arg(0)? {
            "off" => Setting::HolidayHours(0),
            "away" => Setting::HolidayHours(HOLIDAY_HOURS_MAX),
            hours => Setting::HolidayHours(number(hours, "hours")?),
        },
        "time" | "clock" => match arg(0)? {
            "now" => Setting::day_time_now(),
            day => {
                let (hour, minute, second) = clock(arg(1)?)?;
                Setting::DayTime {
                    day: number(day, "day")?,
                    hour,
                    minute,
                    second,
                }
            }
        },
        "heat-schedule" => Setting::HeatSchedule {
            weekend: weekend(rest.first().copied())?,
            points: heat_points(rest.get(1..).unwrap_or_default())?,
        },
        "water-schedule" | "dhw-schedule" => Setting::HotWaterSchedule {
            weekend: weekend(rest.first().copied())?,
            periods: water_periods(rest.get(1..).unwrap_or_default())?,
        },
        other => return Err(format!("unknown setting {other}, one of:\n{SETTING_USAGE}")),
    };
    Ok(setting)
}
