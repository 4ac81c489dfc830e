//! Hub boundary
//!
//! [`Hub`] is what applications talk to: it owns the link session and the
//! device cache, polls the bus, validates and writes settings, and answers
//! attribute queries from the cache without touching the link.

use super::device::{DeviceCache, DeviceState};
use super::error::{HubError, HubResult};
use super::logger::{FrameTrace, TraceFormat};
use super::protocol::dcb::{
    self, AttributeValue, Dcb, HotWaterMode, HotWaterPeriod, Model, Register, RunMode, SetPoint,
    Weekday, HEAT_SETPOINTS, HOLIDAY_HOURS_MAX, HOT_WATER_PERIODS,
};
use super::session::{LinkConfig, LinkSession};
use super::transport::{create_transport, Transport, TransportTrait};
use crate::config::{ConfigError, HubConfig};
use chrono::{DateTime, Datelike, Local, Timelike, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Accepted target temperatures, °C
pub const TARGET_RANGE: (u8, u8) = (5, 35);

/// Accepted away (frost) temperatures, °C
pub const AWAY_RANGE: (u8, u8) = (7, 17);

/// Hour value marking an unused program slot
pub const UNUSED_SLOT_HOUR: u8 = 24;

// ============ Settings ============

/// A value that can be written to a thermostat
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Setting {
    /// Target room temperature (5-35 °C)
    TargetTemperature(u8),
    /// Frost protection temperature (7-17 °C)
    AwayTemperature(u8),
    /// Heating or frost protection
    RunMode(RunMode),
    /// Hot-water override, PRTHW only
    HotWater(HotWaterMode),
    /// Holiday countdown in hours (0 clears)
    HolidayHours(u16),
    /// Clock, written as one block
    DayTime {
        /// 1 = Monday .. 7 = Sunday
        day: Weekday,
        /// 0-23
        hour: u8,
        /// 0-59
        minute: u8,
        /// 0-59
        second: u8,
    },
    /// Heating program
    HeatSchedule {
        /// Weekend block instead of weekday
        weekend: bool,
        /// Set-points in time order
        points: [SetPoint; HEAT_SETPOINTS],
    },
    /// Hot-water program, PRTHW only
    HotWaterSchedule {
        /// Weekend block instead of weekday
        weekend: bool,
        /// On/off pairs
        periods: [HotWaterPeriod; HOT_WATER_PERIODS],
    },
}

fn check(attribute: &'static str, value: impl Into<i64>, min: impl Into<i64>, max: impl Into<i64>) -> HubResult<()> {
    let (value, min, max) = (value.into(), min.into(), max.into());
    if (min..=max).contains(&value) {
        Ok(())
    } else {
        Err(HubError::InvalidAttributeRange {
            attribute,
            value,
            min,
            max,
        })
    }
}

impl Setting {
    /// Current local time as a clock setting
    pub fn day_time_now() -> Self {
        let now = Local::now();
        // All four fit in a byte
        Setting::DayTime {
            day: now.weekday().number_from_monday() as u8,
            hour: now.hour() as u8,
            minute: now.minute() as u8,
            second: now.second() as u8,
        }
    }

    /// Holiday preset used by "away" mode
    pub fn away() -> Self {
        Setting::HolidayHours(HOLIDAY_HOURS_MAX)
    }

    /// Short name for logs and errors
    pub fn name(&self) -> &'static str {
        match self {
            Setting::TargetTemperature(_) => "target_temperature",
            Setting::AwayTemperature(_) => "away_temperature",
            Setting::RunMode(_) => "run_mode",
            Setting::HotWater(_) => "hot_water",
            Setting::HolidayHours(_) => "holiday_hours",
            Setting::DayTime { .. } => "day_time",
            Setting::HeatSchedule { .. } => "heat_schedule",
            Setting::HotWaterSchedule { .. } => "hot_water_schedule",
        }
    }

    /// Register the setting lands in
    pub fn register(&self) -> Register {
        match self {
            Setting::TargetTemperature(_) => Register::TargetTemperature,
            Setting::AwayTemperature(_) => Register::AwayTemperature,
            Setting::RunMode(_) => Register::RunMode,
            Setting::HotWater(_) => Register::HotWaterStatus,
            Setting::HolidayHours(_) => Register::HolidayHours,
            Setting::DayTime { .. } => Register::Day,
            Setting::HeatSchedule { weekend: false, .. } => Register::WeekdayHeatSchedule,
            Setting::HeatSchedule { weekend: true, .. } => Register::WeekendHeatSchedule,
            Setting::HotWaterSchedule { weekend: false, .. } => Register::WeekdayHotWaterSchedule,
            Setting::HotWaterSchedule { weekend: true, .. } => Register::WeekendHotWaterSchedule,
        }
    }

    /// Check the value against its range and the device model
    pub fn validate(&self, model: Model) -> HubResult<()> {
        if !dcb::is_supported(self.register(), model) {
            return Err(HubError::UnsupportedByModel {
                attribute: self.name(),
                model,
            });
        }

        match *self {
            Setting::TargetTemperature(t) => check("target_temperature", t, TARGET_RANGE.0, TARGET_RANGE.1),
            Setting::AwayTemperature(t) => check("away_temperature", t, AWAY_RANGE.0, AWAY_RANGE.1),
            Setting::RunMode(_) | Setting::HotWater(_) => Ok(()),
            Setting::HolidayHours(h) => check("holiday_hours", h, 0, HOLIDAY_HOURS_MAX),
            Setting::DayTime {
                day,
                hour,
                minute,
                second,
            } => {
                check("day", day, 1, 7)?;
                check("hour", hour, 0, 23)?;
                check("minute", minute, 0, 59)?;
                check("second", second, 0, 59)
            }
            Setting::HeatSchedule { points, .. } => {
                for point in points {
                    check("heat_schedule.hour", point.hour, 0, UNUSED_SLOT_HOUR)?;
                    check("heat_schedule.minute", point.minute, 0, 59)?;
                    if point.hour != UNUSED_SLOT_HOUR {
                        check(
                            "heat_schedule.temperature",
                            point.temperature,
                            TARGET_RANGE.0,
                            TARGET_RANGE.1,
                        )?;
                    }
                }
                Ok(())
            }
            Setting::HotWaterSchedule { periods, .. } => {
                for time in periods.iter().flat_map(|p| [p.on, p.off]) {
                    check("hot_water_schedule.hour", time.hour, 0, UNUSED_SLOT_HOUR)?;
                    check("hot_water_schedule.minute", time.minute, 0, 59)?;
                }
                Ok(())
            }
        }
    }

    /// Bytes sent in the write frame
    pub fn payload(&self) -> Vec<u8> {
        match self {
            Setting::TargetTemperature(t) | Setting::AwayTemperature(t) => vec![*t],
            Setting::RunMode(mode) => vec![*mode as u8],
            Setting::HotWater(mode) => vec![*mode as u8],
            Setting::HolidayHours(h) => dcb::wire_word(*h).to_vec(),
            Setting::DayTime {
                day,
                hour,
                minute,
                second,
            } => vec![*day, *hour, *minute, *second],
            Setting::HeatSchedule { points, .. } => dcb::encode_heat_schedule(points),
            Setting::HotWaterSchedule { periods, .. } => dcb::encode_hot_water_schedule(periods),
        }
    }

    /// Bytes to patch into the cached DCB once the write is acknowledged
    ///
    /// `None` when the resulting state cannot be known without a read.
    pub fn dcb_patch(&self) -> Option<Vec<u8>> {
        match self {
            Setting::HotWater(HotWaterMode::Timer) => None,
            Setting::HotWater(HotWaterMode::On) => Some(vec![1]),
            Setting::HotWater(HotWaterMode::Off) => Some(vec![0]),
            Setting::HolidayHours(h) => Some(dcb::dcb_word_bytes(*h).to_vec()),
            _ => Some(self.payload()),
        }
    }

    /// Registers whose value the thermostat derives from this setting
    pub fn refresh(&self) -> &'static [Register] {
        match self {
            Setting::TargetTemperature(_)
            | Setting::AwayTemperature(_)
            | Setting::RunMode(_)
            | Setting::HolidayHours(_) => &[Register::HeatStatus],
            Setting::HotWater(_) => &[Register::HotWaterStatus],
            _ => &[],
        }
    }
}

impl fmt::Display for Setting {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Setting::TargetTemperature(t) | Setting::AwayTemperature(t) => {
                write!(f, "{} = {t}°C", self.name())
            }
            Setting::RunMode(mode) => write!(f, "run_mode = {mode:?}"),
            Setting::HotWater(mode) => write!(f, "hot_water = {mode:?}"),
            Setting::HolidayHours(h) => write!(f, "holiday_hours = {h}"),
            Setting::DayTime {
                day,
                hour,
                minute,
                second,
            } => write!(f, "day_time = {day} {hour:02}:{minute:02}:{second:02}"),
            Setting::HeatSchedule { weekend, points } => write!(
                f,
                "heat_schedule[{}] = {}",
                if *weekend { "weekend" } else { "weekday" },
                AttributeValue::HeatSchedule(*points)
            ),
            Setting::HotWaterSchedule { weekend, periods } => write!(
                f,
                "hot_water_schedule[{}] = {}",
                if *weekend { "weekend" } else { "weekday" },
                AttributeValue::HotWaterSchedule(*periods)
            ),
        }
    }
}

// ============ Hub ============

/// Result of polling one device
#[derive(Debug, Clone, PartialEq)]
pub enum PollOutcome {
    /// Fresh DCB
    Online(Dcb),
    /// Why the device could not be read
    Offline(HubError),
}

impl PollOutcome {
    /// Device answered
    pub fn is_online(&self) -> bool {
        matches!(self, PollOutcome::Online(_))
    }
}

/// Cached attribute value
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Reading {
    /// Decoded value
    pub value: AttributeValue,
    /// Device is not answering; value is from an earlier read
    pub stale: bool,
    /// When the cached DCB last changed
    pub last_updated: Option<DateTime<Utc>>,
}

/// Controller for every thermostat behind one UH1 hub
pub struct Hub {
    session: LinkSession,
    cache: Arc<DeviceCache>,
    order: Vec<u8>,
}

impl Hub {
    /// Hub over an existing transport; the link opens on first use
    pub fn with_transport(
        transport: Box<dyn TransportTrait>,
        devices: &[(u8, Model)],
        link: LinkConfig,
    ) -> Self {
        let cache = Arc::new(DeviceCache::new());
        for &(id, model) in devices {
            cache.register(id, model);
        }
        Self {
            session: LinkSession::new(transport, Arc::clone(&cache), link),
            cache,
            order: devices.iter().map(|&(id, _)| id).collect(),
        }
    }

    /// Parse `address` and open the link
    ///
    /// A link that fails to open is only logged; every device reports a link
    /// error until a later transaction manages to reopen it.
    pub async fn open_link(address: &str, devices: &[(u8, Model)], link: LinkConfig) -> HubResult<Self> {
        let transport = Transport::parse(address)?;
        let hub = Self::with_transport(create_transport(transport), devices, link);
        hub.connect().await;
        Ok(hub)
    }

    /// Build from a configuration file's settings
    pub async fn open(config: &HubConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        let transport = create_transport(config.transport()?);
        let mut hub = Self::with_transport(transport, &config.device_list(), config.link_config());

        if let Some(path) = &config.logging.trace_file {
            let mut trace = FrameTrace::new();
            match trace.start(path.clone(), TraceFormat::from_path(path)) {
                Ok(()) => {
                    info!(path = %path.display(), "frame trace enabled");
                    hub.session = hub.session.with_trace(trace.shared());
                }
                Err(e) => warn!(path = %path.display(), "cannot open frame trace: {e}"),
            }
        }

        hub.connect().await;
        Ok(hub)
    }

    async fn connect(&self) {
        if let Err(e) = self.session.open().await {
            warn!(link = %self.session.connection_info(), "hub link not open: {e}");
        }
    }

    /// Read every configured device, in configuration order
    pub async fn poll_all(&self) -> BTreeMap<u8, PollOutcome> {
        let timeout = self.session.config().device_timeout;
        let results = self.session.read_all_devices(&self.order, timeout).await;

        let online = results.values().filter(|r| r.is_ok()).count();
        debug!(online, total = results.len(), "poll complete");

        results
            .into_iter()
            .map(|(id, result)| {
                let outcome = match result {
                    Ok(dcb) => PollOutcome::Online(dcb),
                    Err(e) => PollOutcome::Offline(e),
                };
                (id, outcome)
            })
            .collect()
    }

    /// Read one device
    pub async fn poll(&self, id: u8) -> HubResult<Dcb> {
        self.session
            .read_device(id, self.session.config().device_timeout)
            .await
    }

    /// Validate, write and cache a setting
    ///
    /// Rejected values fail before any byte is sent. After the write is
    /// acknowledged the cache is patched and registers the thermostat
    /// derives from the setting are re-read; a failed re-read is logged
    /// and does not fail the write.
    pub async fn write_attribute(&self, id: u8, setting: Setting) -> HubResult<()> {
        let model = self.cache.model(id).ok_or(HubError::UnknownDevice(id))?;
        if let Err(e) = setting.validate(model) {
            warn!(device = id, "rejected {}: {e}", setting.name());
            return Err(e);
        }

        let config = self.session.config();
        let patch = setting.dcb_patch();
        self.session
            .write_register(
                id,
                setting.register(),
                &setting.payload(),
                patch.as_deref(),
                config.write_timeout,
            )
            .await?;
        info!(device = id, "{setting}");

        let refresh = setting.refresh();
        if !refresh.is_empty() {
            if let Err(e) = self
                .session
                .refresh_registers(id, refresh, config.device_timeout)
                .await
            {
                warn!(device = id, "re-read after {} failed: {e}", setting.name());
            }
        }
        Ok(())
    }

    /// Set the device clock from the local time
    pub async fn sync_clock(&self, id: u8) -> HubResult<()> {
        self.write_attribute(id, Setting::day_time_now()).await
    }

    /// Cached value of `register`; never touches the link
    ///
    /// Hot-water status on a PRT reads as off.
    pub fn get_attribute(&self, id: u8, register: Register) -> Option<Reading> {
        let state = self.cache.get(id)?;
        let value = if register == Register::HotWaterStatus && !state.model.has_hot_water() {
            state.dcb.as_ref()?;
            AttributeValue::Switch(false)
        } else {
            state.value(register)?
        };
        Some(Reading {
            value,
            stale: !state.online,
            last_updated: state.last_updated,
        })
    }

    /// Snapshot of one device
    pub fn device(&self, id: u8) -> Option<DeviceState> {
        self.cache.get(id)
    }

    /// Snapshot of every device
    pub fn devices(&self) -> Vec<DeviceState> {
        self.cache.all()
    }

    /// Configured ids in poll order
    pub fn device_ids(&self) -> &[u8] {
        &self.order
    }

    /// Underlying link session
    pub fn session(&self) -> &LinkSession {
        &self.session
    }

    /// Device cache
    pub fn cache(&self) -> &Arc<DeviceCache> {
        &self.cache
    }

    /// Close the link
    pub async fn close(&self) {
        self.session.close().await;
    }
}
