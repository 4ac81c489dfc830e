//! Virtual UH1 bus
//!
//! In-memory thermostats that answer V3 frames the way real PRT and PRT-HW
//! units do. A [`VirtualBus`] can be plugged straight into a link session
//! through [`VirtualBus::transport`] or served over TCP with [`serve`] so
//! external tools can poll it like a serial-over-IP bridge.
//!
//! Faults are scriptable per device (silence, corrupted checksums) and for the
//! whole bus (latency, refused connections, dropped link). Every request that
//! reaches the bus is logged for ordering assertions.

use super::protocol::checksum;
use super::protocol::dcb::{
    self, encode_heat_schedule, encode_hot_water_schedule, HotWaterPeriod, Model, Register,
    SetPoint, SwitchTime,
};
use super::protocol::frame::{self, Operation, MASTER_ADDR, READ_HEADER_LEN, REQUEST_OVERHEAD};
use super::transport::{TransportError, TransportStats, TransportTrait, TransportType};
use async_trait::async_trait;
use bytes::BytesMut;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::Instant;
use tracing::{debug, info, warn};

const DCB_LEN_OFFSET: usize = 0;
const ADDRESS_OFFSET: usize = 11;
const ON_OFF_OFFSET: usize = 21;

/// One simulated thermostat
#[derive(Debug, Clone)]
pub struct VirtualThermostat {
    id: u8,
    model: Model,
    dcb: Vec<u8>,
    responsive: bool,
    corrupt: bool,
}

impl VirtualThermostat {
    /// Thermostat with factory-like settings: 20 °C target, 12 °C frost,
    /// 20.5 °C room, Monday 12:00:00
    pub fn new(id: u8, model: Model) -> Self {
        let len = model.dcb_len();
        let mut dcb = vec![0u8; len];
        // Small enough for u16 by construction
        dcb[DCB_LEN_OFFSET..DCB_LEN_OFFSET + 2].copy_from_slice(&(len as u16).to_be_bytes());
        dcb[dcb::MODEL_OFFSET] = model.byte();
        dcb[ADDRESS_OFFSET] = id;
        dcb[ON_OFF_OFFSET] = 1;

        let mut thermostat = Self {
            id,
            model,
            dcb,
            responsive: true,
            corrupt: false,
        };
        thermostat.set(Register::AwayTemperature, &[12]);
        thermostat.set(Register::TargetTemperature, &[20]);
        thermostat.set(Register::RoomTemperature, &dcb::dcb_word_bytes(205));
        thermostat.set(Register::Day, &[1]);
        thermostat.set(Register::Time, &[12, 0, 0]);

        let point = |hour, minute, temperature| SetPoint { hour, minute, temperature };
        thermostat.set(
            Register::WeekdayHeatSchedule,
            &encode_heat_schedule(&[point(7, 0, 21), point(9, 0, 16), point(17, 0, 21), point(22, 0, 16)]),
        );
        thermostat.set(
            Register::WeekendHeatSchedule,
            &encode_heat_schedule(&[point(8, 0, 21), point(10, 0, 21), point(17, 0, 21), point(22, 30, 16)]),
        );

        if model.has_hot_water() {
            let period = |on_h, on_m, off_h, off_m| HotWaterPeriod {
                on: SwitchTime { hour: on_h, minute: on_m },
                off: SwitchTime { hour: off_h, minute: off_m },
            };
            let program = encode_hot_water_schedule(&[
                period(6, 30, 8, 0),
                period(17, 0, 19, 0),
                period(24, 0, 24, 0),
                period(24, 0, 24, 0),
            ]);
            thermostat.set(Register::WeekdayHotWaterSchedule, &program);
            thermostat.set(Register::WeekendHotWaterSchedule, &program);
        }
        thermostat
    }

    /// Set the measured room temperature
    #[must_use]
    pub fn with_room_temperature(mut self, celsius: f32) -> Self {
        self.set_room_temperature(celsius);
        self
    }

    /// Set the target temperature
    #[must_use]
    pub fn with_target_temperature(mut self, celsius: u8) -> Self {
        self.set(Register::TargetTemperature, &[celsius]);
        self
    }

    /// Bus address
    pub fn id(&self) -> u8 {
        self.id
    }

    /// Model
    pub fn model(&self) -> Model {
        self.model
    }

    /// Current DCB contents
    pub fn dcb(&self) -> &[u8] {
        &self.dcb
    }

    fn set(&mut self, register: Register, bytes: &[u8]) {
        if !dcb::is_supported(register, self.model) {
            return;
        }
        let offset = dcb::register_offset(register, self.model);
        if let Some(target) = self.dcb.get_mut(offset..offset + bytes.len()) {
            target.copy_from_slice(bytes);
        }
    }

    fn set_room_temperature(&mut self, celsius: f32) {
        // Clamped to the u16 range before the cast
        let tenths = (celsius * 10.0).round().clamp(0.0, f32::from(u16::MAX)) as u16;
        self.set(Register::RoomTemperature, &dcb::dcb_word_bytes(tenths));
        self.update_heating();
    }

    /// Heating demand follows the target unless frost protection or a
    /// holiday is active
    fn update_heating(&mut self) {
        let at = |r: Register| dcb::register_offset(r, self.model);
        let word = |r: Register| dcb::dcb_word([self.dcb[at(r)], self.dcb[at(r) + 1]]);
        let room = word(Register::RoomTemperature);
        let holiday = word(Register::HolidayHours);
        let frost = self.dcb[at(Register::RunMode)] == 1 || holiday != 0;
        let setpoint = if frost {
            self.dcb[at(Register::AwayTemperature)]
        } else {
            self.dcb[at(Register::TargetTemperature)]
        };
        let demand = room < u16::from(setpoint) * 10;
        let heat = at(Register::HeatStatus);
        self.dcb[heat] = u8::from(demand);
    }

    fn apply_write(&mut self, address: u16, payload: &[u8]) -> bool {
        match Register::from_wire_address(address) {
            Some(Register::HolidayHours) if payload.len() == 2 => {
                let hours = dcb::wire_word_value([payload[0], payload[1]]);
                self.set(Register::HolidayHours, &dcb::dcb_word_bytes(hours));
            }
            Some(Register::HotWaterStatus) if self.model.has_hot_water() => match payload.first() {
                Some(1) => self.set(Register::HotWaterStatus, &[1]),
                Some(2) => self.set(Register::HotWaterStatus, &[0]),
                Some(0) => {}
                _ => return false,
            },
            Some(Register::HeatStatus | Register::RoomTemperature | Register::Model) => return false,
            Some(register) => {
                if !dcb::is_supported(register, self.model) {
                    return false;
                }
                let offset = dcb::register_offset(register, self.model);
                match self.dcb.get_mut(offset..offset + payload.len()) {
                    Some(target) => target.copy_from_slice(payload),
                    None => return false,
                }
            }
            None => {
                let offset = usize::from(address);
                match self.dcb.get_mut(offset..offset + payload.len()) {
                    Some(target) => target.copy_from_slice(payload),
                    None => return false,
                }
            }
        }
        self.update_heating();
        true
    }

    fn read(&self, address: u16, length: u16) -> Option<&[u8]> {
        if address == 0 && length == frame::FULL_DCB {
            return Some(&self.dcb);
        }
        let offset = match Register::from_wire_address(address) {
            Some(register) if dcb::is_supported(register, self.model) => {
                dcb::register_offset(register, self.model)
            }
            Some(_) => return None,
            None => usize::from(address),
        };
        self.dcb.get(offset..offset + usize::from(length))
    }

    /// Answer a checksum-valid request addressed to this thermostat
    ///
    /// Returns `None` where a real unit would stay silent.
    pub fn handle(&mut self, request: &[u8]) -> Option<Vec<u8>> {
        if !self.responsive || request.len() < REQUEST_OVERHEAD {
            return None;
        }
        let address = u16::from_le_bytes([request[4], request[5]]);
        let length = u16::from_le_bytes([request[6], request[7]]);
        let payload = &request[8..request.len() - checksum::CHECKSUM_LEN];

        let mut response = match Operation::from_u8(request[3])? {
            Operation::Read => {
                let data = self.read(address, length)?;
                // DCBs and register reads stay far below u16::MAX
                let data_len = data.len() as u16;
                let total = (READ_HEADER_LEN + data.len() + checksum::CHECKSUM_LEN) as u16;
                let mut response = vec![MASTER_ADDR];
                response.extend_from_slice(&total.to_le_bytes());
                response.push(self.id);
                response.push(Operation::Read as u8);
                response.extend_from_slice(&address.to_le_bytes());
                response.extend_from_slice(&data_len.to_le_bytes());
                response.extend_from_slice(data);
                response
            }
            Operation::Write => {
                if usize::from(length) != payload.len() || !self.apply_write(address, payload) {
                    return None;
                }
                vec![MASTER_ADDR, 0x07, 0x00, self.id, Operation::Write as u8]
            }
        };
        checksum::append(&mut response);

        if self.corrupt {
            if let Some(last) = response.last_mut() {
                *last ^= 0xFF;
            }
        }
        Some(response)
    }
}

/// One request seen by the bus
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BusEvent {
    /// Device addressed
    pub device: u8,
    /// Read or write
    pub operation: Operation,
    /// Protocol address
    pub address: u16,
    /// Requested length
    pub length: u16,
    /// Write payload
    pub payload: Vec<u8>,
    /// A reply was produced
    pub answered: bool,
}

#[derive(Debug)]
struct BusState {
    devices: BTreeMap<u8, VirtualThermostat>,
    log: Vec<BusEvent>,
    latency: Duration,
    link_up: bool,
    connects: usize,
    discarded: u64,
}

/// Shared handle to a set of virtual thermostats
#[derive(Debug, Clone)]
pub struct VirtualBus {
    state: Arc<Mutex<BusState>>,
}

impl Default for VirtualBus {
    fn default() -> Self {
        Self::new()
    }
}

impl VirtualBus {
    /// Empty bus
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(BusState {
                devices: BTreeMap::new(),
                log: Vec::new(),
                latency: Duration::ZERO,
                link_up: true,
                connects: 0,
                discarded: 0,
            })),
        }
    }

    /// Attach a thermostat, replacing any with the same address
    pub fn add(&self, thermostat: VirtualThermostat) {
        self.state.lock().devices.insert(thermostat.id, thermostat);
    }

    /// Make a thermostat answer or stay silent
    pub fn set_responsive(&self, id: u8, responsive: bool) {
        if let Some(t) = self.state.lock().devices.get_mut(&id) {
            t.responsive = responsive;
        }
    }

    /// Make a thermostat's replies fail their checksum
    pub fn set_corrupt(&self, id: u8, corrupt: bool) {
        if let Some(t) = self.state.lock().devices.get_mut(&id) {
            t.corrupt = corrupt;
        }
    }

    /// Force the heating output state
    pub fn set_heating(&self, id: u8, on: bool) {
        if let Some(t) = self.state.lock().devices.get_mut(&id) {
            t.set(Register::HeatStatus, &[u8::from(on)]);
        }
    }

    /// Change the measured room temperature
    pub fn set_room_temperature(&self, id: u8, celsius: f32) {
        if let Some(t) = self.state.lock().devices.get_mut(&id) {
            t.set_room_temperature(celsius);
        }
    }

    /// Delay before replies become readable
    pub fn set_latency(&self, latency: Duration) {
        self.state.lock().latency = latency;
    }

    /// Bring the whole link up or down
    pub fn set_link_up(&self, up: bool) {
        self.state.lock().link_up = up;
    }

    /// Copy of a thermostat's DCB
    pub fn dcb(&self, id: u8) -> Option<Vec<u8>> {
        self.state.lock().devices.get(&id).map(|t| t.dcb.clone())
    }

    /// Every request seen so far
    pub fn events(&self) -> Vec<BusEvent> {
        self.state.lock().log.clone()
    }

    /// Device addressed by each request, in arrival order
    pub fn requests_to(&self) -> Vec<u8> {
        self.state.lock().log.iter().map(|e| e.device).collect()
    }

    /// Number of successful connects
    pub fn connects(&self) -> usize {
        self.state.lock().connects
    }

    /// Bytes dropped by clients resynchronising
    pub fn bytes_discarded(&self) -> u64 {
        self.state.lock().discarded
    }

    /// Ids attached to the bus
    pub fn ids(&self) -> Vec<u8> {
        self.state.lock().devices.keys().copied().collect()
    }

    fn latency(&self) -> Duration {
        self.state.lock().latency
    }

    /// Route one raw request frame; `None` when nobody answers
    ///
    /// Frames with a bad checksum are dropped without being logged, the way a
    /// thermostat ignores line noise.
    pub fn process(&self, request: &[u8]) -> Option<Vec<u8>> {
        if request.len() < REQUEST_OVERHEAD
            || usize::from(request[1]) != request.len()
            || !checksum::verify(request)
        {
            debug!(len = request.len(), "virtual bus dropped malformed frame");
            return None;
        }

        let device = request[0];
        let mut state = self.state.lock();
        let response = state
            .devices
            .get_mut(&device)
            .and_then(|t| t.handle(request));

        state.log.push(BusEvent {
            device,
            operation: Operation::from_u8(request[3]).unwrap_or(Operation::Read),
            address: u16::from_le_bytes([request[4], request[5]]),
            length: u16::from_le_bytes([request[6], request[7]]),
            payload: request[8..request.len() - checksum::CHECKSUM_LEN].to_vec(),
            answered: response.is_some(),
        });
        response
    }

    /// In-process transport attached to this bus
    pub fn transport(&self) -> VirtualTransport {
        VirtualTransport {
            bus: self.clone(),
            connected: false,
            pending: BytesMut::new(),
            ready_at: None,
            stats: TransportStats::default(),
        }
    }
}

/// [`TransportTrait`] implementation backed by a [`VirtualBus`]
pub struct VirtualTransport {
    bus: VirtualBus,
    connected: bool,
    pending: BytesMut,
    ready_at: Option<Instant>,
    stats: TransportStats,
}

#[async_trait]
impl TransportTrait for VirtualTransport {
    async fn connect(&mut self) -> Result<(), TransportError> {
        let mut state = self.bus.state.lock();
        if !state.link_up {
            return Err(TransportError::ConnectionFailed(
                "virtual bus unavailable".to_string(),
            ));
        }
        state.connects += 1;
        self.connected = true;
        self.pending.clear();
        self.stats = TransportStats::default();
        Ok(())
    }

    async fn disconnect(&mut self) -> Result<(), TransportError> {
        self.connected = false;
        self.pending.clear();
        self.ready_at = None;
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected
    }

    async fn send(&mut self, data: &[u8]) -> Result<usize, TransportError> {
        if !self.connected {
            return Err(TransportError::NotConnected);
        }
        if !self.bus.state.lock().link_up {
            self.connected = false;
            return Err(TransportError::Disconnected);
        }

        self.stats.bytes_sent += data.len() as u64;
        self.stats.packets_sent += 1;

        if let Some(response) = self.bus.process(data) {
            self.pending.extend_from_slice(&response);
            self.ready_at = Some(Instant::now() + self.bus.latency());
        }
        Ok(data.len())
    }

    async fn read_exact(&mut self, buf: &mut [u8]) -> Result<(), TransportError> {
        if !self.connected {
            return Err(TransportError::NotConnected);
        }
        if let Some(ready_at) = self.ready_at {
            tokio::time::sleep_until(ready_at).await;
        }
        if self.pending.len() < buf.len() {
            // A silent device: nothing more will arrive for this request
            std::future::pending::<()>().await;
        }
        buf.copy_from_slice(&self.pending.split_to(buf.len()));
        self.stats.bytes_received += buf.len() as u64;
        Ok(())
    }

    async fn clear_input(&mut self) -> Result<usize, TransportError> {
        if !self.connected {
            return Err(TransportError::NotConnected);
        }
        let discarded = self.pending.len();
        self.pending.clear();
        self.ready_at = None;
        self.stats.bytes_discarded += discarded as u64;
        self.bus.state.lock().discarded += discarded as u64;
        Ok(discarded)
    }

    fn transport_type(&self) -> TransportType {
        TransportType::Virtual
    }

    fn connection_info(&self) -> String {
        format!("virtual bus ({} devices)", self.bus.ids().len())
    }

    fn stats(&self) -> TransportStats {
        self.stats.clone()
    }
}

// ============ TCP bridge ============

/// Serve `bus` to TCP clients until the listener fails
///
/// Each connection is a raw byte stream carrying V3 frames, the same as a
/// serial-over-IP adapter in front of a UH1.
pub async fn serve(bus: VirtualBus, listener: TcpListener) -> std::io::Result<()> {
    info!(addr = %listener.local_addr()?, devices = ?bus.ids(), "virtual UH1 listening");
    loop {
        let (socket, peer) = listener.accept().await?;
        debug!(%peer, "virtual UH1 client connected");
        let bus = bus.clone();
        tokio::spawn(async move {
            if let Err(e) = handle_client(&bus, socket).await {
                warn!(%peer, "virtual UH1 client error: {e}");
            }
            debug!(%peer, "virtual UH1 client disconnected");
        });
    }
}

async fn handle_client(bus: &VirtualBus, mut socket: TcpStream) -> std::io::Result<()> {
    socket.set_nodelay(true)?;
    loop {
        let mut lead = [0u8; 2];
        match socket.read_exact(&mut lead).await {
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(()),
            Err(e) => return Err(e),
        }

        let frame_len = usize::from(lead[1]);
        if frame_len < REQUEST_OVERHEAD {
            // Out of step with the client; drop what we have and carry on
            continue;
        }
        let mut request = vec![0u8; frame_len];
        request[..2].copy_from_slice(&lead);
        socket.read_exact(&mut request[2..]).await?;

        if let Some(response) = bus.process(&request) {
            let latency = bus.latency();
            if !latency.is_zero() {
                tokio::time::sleep(latency).await;
            }
            socket.write_all(&response).await?;
        }
    }
}
