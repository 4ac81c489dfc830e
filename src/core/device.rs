//! Per-device state cache
//!
//! Every configured thermostat has one entry holding the last DCB read from
//! it and whether the last transaction with it succeeded. Entries are created
//! at configuration time, replaced wholesale by bulk reads and patched after
//! verified writes. A device that stops answering keeps its last DCB so
//! callers can keep showing stale values.

use super::protocol::dcb::{
    self, AttributeValue, Dcb, HotWaterPeriod, Model, Register, RunMode, SetPoint,
    HEAT_SETPOINTS, HOT_WATER_PERIODS,
};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::BTreeMap;

/// Snapshot of one thermostat
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeviceState {
    /// Bus address (1-32)
    pub id: u8,
    /// Configured model
    pub model: Model,
    /// Last DCB read, if any
    pub dcb: Option<Dcb>,
    /// Last transaction succeeded
    pub online: bool,
    /// When the DCB was last replaced or patched
    pub last_updated: Option<DateTime<Utc>>,
}

impl DeviceState {
    /// Fresh entry: no DCB, offline
    pub fn new(id: u8, model: Model) -> Self {
        Self {
            id,
            model,
            dcb: None,
            online: false,
            last_updated: None,
        }
    }

    /// Decode one register from the cached DCB
    pub fn value(&self, register: Register) -> Option<AttributeValue> {
        self.dcb.as_ref()?.decode(register, self.model)
    }

    /// Cached values exist but the device is not answering
    pub fn is_stale(&self) -> bool {
        self.dcb.is_some() && !self.online
    }

    /// Model reported by the device itself, falling back to the configured one
    pub fn reported_model(&self) -> Model {
        self.dcb.as_ref().and_then(Dcb::model).unwrap_or(self.model)
    }

    /// Target room temperature, °C
    pub fn target_temperature(&self) -> Option<u8> {
        match self.value(Register::TargetTemperature)? {
            AttributeValue::Temperature(t) => Some(t),
            _ => None,
        }
    }

    /// Frost protection temperature, °C
    pub fn away_temperature(&self) -> Option<u8> {
        match self.value(Register::AwayTemperature)? {
            AttributeValue::Temperature(t) => Some(t),
            _ => None,
        }
    }

    /// Measured room temperature, °C
    pub fn room_temperature(&self) -> Option<f32> {
        match self.value(Register::RoomTemperature)? {
            AttributeValue::RoomTemperature(t) => Some(t),
            _ => None,
        }
    }

    /// Heating or frost protection
    pub fn run_mode(&self) -> Option<RunMode> {
        match self.value(Register::RunMode)? {
            AttributeValue::RunMode(mode) => Some(mode),
            _ => None,
        }
    }

    /// Heating output on
    pub fn heat_status(&self) -> Option<bool> {
        match self.value(Register::HeatStatus)? {
            AttributeValue::Switch(on) => Some(on),
            _ => None,
        }
    }

    /// Hot-water output on; always off for a PRT
    pub fn hot_water_status(&self) -> Option<bool> {
        if !self.model.has_hot_water() {
            return self.dcb.as_ref().map(|_| false);
        }
        match self.value(Register::HotWaterStatus)? {
            AttributeValue::Switch(on) => Some(on),
            _ => None,
        }
    }

    /// Remaining holiday hours
    pub fn holiday_hours(&self) -> Option<u16> {
        match self.value(Register::HolidayHours)? {
            AttributeValue::Hours(h) => Some(h),
            _ => None,
        }
    }

    /// Holiday mode running
    pub fn holiday_active(&self) -> Option<bool> {
        self.holiday_hours().map(|h| h != 0)
    }

    /// Day of week, 1 = Monday
    pub fn day(&self) -> Option<u8> {
        match self.value(Register::Day)? {
            AttributeValue::Day(d) => Some(d),
            _ => None,
        }
    }

    /// Thermostat clock as seconds since midnight
    pub fn time_seconds(&self) -> Option<u32> {
        match self.value(Register::Time)? {
            AttributeValue::Time(secs) => Some(secs),
            _ => None,
        }
    }

    /// Heating program for weekdays or the weekend
    pub fn heat_schedule(&self, weekend: bool) -> Option<[SetPoint; HEAT_SETPOINTS]> {
        let register = if weekend {
            Register::WeekendHeatSchedule
        } else {
            Register::WeekdayHeatSchedule
        };
        match self.value(register)? {
            AttributeValue::HeatSchedule(points) => Some(points),
            _ => None,
        }
    }

    /// Hot-water program for weekdays or the weekend (PRT-HW)
    pub fn hot_water_schedule(&self, weekend: bool) -> Option<[HotWaterPeriod; HOT_WATER_PERIODS]> {
        let register = if weekend {
            Register::WeekendHotWaterSchedule
        } else {
            Register::WeekdayHotWaterSchedule
        };
        match self.value(register)? {
            AttributeValue::HotWaterSchedule(periods) => Some(periods),
            _ => None,
        }
    }
}

/// Cache of every configured device, keyed by bus address
#[derive(Debug, Default)]
pub struct DeviceCache {
    devices: RwLock<BTreeMap<u8, DeviceState>>,
}

impl DeviceCache {
    /// Create an empty cache
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a device; re-registering resets its entry
    pub fn register(&self, id: u8, model: Model) {
        self.devices.write().insert(id, DeviceState::new(id, model));
    }

    /// Whether `id` is configured
    pub fn contains(&self, id: u8) -> bool {
        self.devices.read().contains_key(&id)
    }

    /// Replace a device's DCB after a bulk read and mark it online
    ///
    /// Returns false for an unknown id.
    pub fn update(&self, id: u8, dcb: Dcb) -> bool {
        let mut devices = self.devices.write();
        let Some(state) = devices.get_mut(&id) else {
            return false;
        };
        if let Some(reported) = dcb.model() {
            if reported != state.model {
                tracing::warn!(
                    device = id,
                    configured = %state.model,
                    reported = %reported,
                    "device reports a different model"
                );
            }
        }
        state.dcb = Some(dcb);
        state.online = true;
        state.last_updated = Some(Utc::now());
        true
    }

    /// Overwrite bytes of a cached DCB
    ///
    /// No-op if the device has no DCB yet or the range is out of bounds.
    pub fn patch(&self, id: u8, offset: usize, bytes: &[u8]) -> bool {
        let mut devices = self.devices.write();
        let Some(state) = devices.get_mut(&id) else {
            return false;
        };
        let Some(dcb) = state.dcb.as_mut() else {
            return false;
        };
        if !dcb.patch(offset, bytes) {
            return false;
        }
        state.last_updated = Some(Utc::now());
        true
    }

    /// Overwrite one register of a cached DCB
    pub fn patch_register(&self, id: u8, register: Register, bytes: &[u8]) -> bool {
        let Some(model) = self.model(id) else {
            return false;
        };
        if !dcb::is_supported(register, model) {
            return false;
        }
        self.patch(id, dcb::register_offset(register, model), bytes)
    }

    /// Flag the device online without touching its DCB
    pub fn mark_online(&self, id: u8) {
        if let Some(state) = self.devices.write().get_mut(&id) {
            state.online = true;
        }
    }

    /// Flag the device offline, keeping its DCB
    pub fn mark_offline(&self, id: u8) {
        if let Some(state) = self.devices.write().get_mut(&id) {
            state.online = false;
        }
    }

    /// Flag every device offline
    pub fn mark_all_offline(&self) {
        for state in self.devices.write().values_mut() {
            state.online = false;
        }
    }

    /// Copy of one entry
    pub fn get(&self, id: u8) -> Option<DeviceState> {
        self.devices.read().get(&id).cloned()
    }

    /// Configured model
    pub fn model(&self, id: u8) -> Option<Model> {
        self.devices.read().get(&id).map(|s| s.model)
    }

    /// Configured ids in ascending order
    pub fn ids(&self) -> Vec<u8> {
        self.devices.read().keys().copied().collect()
    }

    /// Copy of every entry
    pub fn all(&self) -> Vec<DeviceState> {
        self.devices.read().values().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::protocol::dcb::{MODEL_OFFSET, MODEL_PRT, MODEL_PRTHW};

    fn dcb_for(model: Model) -> Dcb {
        let mut bytes = vec![0u8; model.dcb_len()];
        bytes[MODEL_OFFSET] = model.byte();
        bytes[18] = 21;
        bytes[17] = 12;
        bytes[32] = 0;
        bytes[33] = 195;
        Dcb::new(bytes)
    }

    #[test]
    fn test_new_entry_is_offline_and_empty() {
        let cache = DeviceCache::new();
        cache.register(1, Model::Prt);

        let state = cache.get(1).unwrap();
        assert!(!state.online);
        assert!(state.dcb.is_none());
        assert_eq!(state.target_temperature(), None);
        assert!(!state.is_stale());
    }

    #[test]
    fn test_update_sets_online() {
        let cache = DeviceCache::new();
        cache.register(1, Model::Prt);
        assert!(cache.update(1, dcb_for(Model::Prt)));

        let state = cache.get(1).unwrap();
        assert!(state.online);
        assert!(state.last_updated.is_some());
        assert_eq!(state.target_temperature(), Some(21));
        assert_eq!(state.away_temperature(), Some(12));
        assert_eq!(state.room_temperature(), Some(19.5));
        assert_eq!(state.reported_model(), Model::Prt);

        assert!(!cache.update(9, dcb_for(Model::Prt)));
    }

    #[test]
    fn test_offline_keeps_last_known_dcb() {
        let cache = DeviceCache::new();
        cache.register(1, Model::Prt);
        cache.update(1, dcb_for(Model::Prt));
        cache.mark_offline(1);

        let state = cache.get(1).unwrap();
        assert!(!state.online);
        assert!(state.is_stale());
        assert_eq!(state.target_temperature(), Some(21));
    }

    #[test]
    fn test_mark_all_offline() {
        let cache = DeviceCache::new();
        for id in [1, 2, 3] {
            cache.register(id, Model::Prt);
            cache.update(id, dcb_for(Model::Prt));
        }
        cache.mark_all_offline();
        assert!(cache.all().iter().all(|s| !s.online));
        assert_eq!(cache.ids(), vec![1, 2, 3]);
    }

    #[test]
    fn test_patch_register_uses_model_offsets() {
        let cache = DeviceCache::new();
        cache.register(4, Model::PrtHw);
        cache.update(4, dcb_for(Model::PrtHw));

        assert!(cache.patch_register(4, Register::Day, &[5]));
        assert_eq!(cache.get(4).unwrap().dcb.unwrap().byte(37), Some(5));
        assert_eq!(cache.get(4).unwrap().day(), Some(5));

        // No DCB yet
        cache.register(5, Model::Prt);
        assert!(!cache.patch_register(5, Register::TargetTemperature, &[20]));
        // Not on this model
        cache.update(5, dcb_for(Model::Prt));
        assert!(!cache.patch_register(5, Register::HotWaterStatus, &[1]));
    }

    #[test]
    fn test_hot_water_reads_off_on_prt() {
        let cache = DeviceCache::new();
        cache.register(1, Model::Prt);
        assert_eq!(cache.get(1).unwrap().hot_water_status(), None);

        cache.update(1, dcb_for(Model::Prt));
        let state = cache.get(1).unwrap();
        assert_eq!(state.hot_water_status(), Some(false));
        assert_eq!(state.hot_water_schedule(false), None);
    }

    #[test]
    fn test_holiday_active() {
        let cache = DeviceCache::new();
        cache.register(2, Model::PrtHw);
        let mut dcb = dcb_for(Model::PrtHw);
        dcb.patch(24, &dcb::dcb_word_bytes(48));
        cache.update(2, dcb);

        let state = cache.get(2).unwrap();
        assert_eq!(state.holiday_hours(), Some(48));
        assert_eq!(state.holiday_active(), Some(true));
    }

    #[test]
    fn test_reported_model_from_dcb() {
        let mut state = DeviceState::new(1, Model::Prt);
        let mut bytes = vec![0u8; 97];
        bytes[MODEL_OFFSET] = MODEL_PRTHW;
        state.dcb = Some(Dcb::new(bytes));
        assert_eq!(state.reported_model(), Model::PrtHw);

        let mut bytes = vec![0u8; 64];
        bytes[MODEL_OFFSET] = MODEL_PRT;
        state.dcb = Some(Dcb::new(bytes));
        assert_eq!(state.reported_model(), Model::Prt);
    }
}
