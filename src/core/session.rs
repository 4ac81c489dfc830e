//! Link session management
//!
//! A [`LinkSession`] owns the one transport shared by every thermostat behind
//! a hub. The bus is half-duplex with no multiplexing, so the session is a
//! capacity-one permit: callers queue on a FIFO mutex, the holder runs one
//! request/response transaction under its own timeout, waits out the pacing
//! delay and hands the link to the next waiter.
//!
//! Failures are classified as they happen:
//! - timeouts and bad frames take only the addressed device offline and
//!   leave the input to be drained before the next transaction;
//! - replies from another device or to another address are late answers to
//!   abandoned requests and are skipped while waiting for the real one;
//! - transport failures close the link and take every device offline; the
//!   next transaction reopens it.

use super::device::DeviceCache;
use super::error::{HubError, HubResult};
use super::logger::FrameLog;
use super::protocol::dcb::{self, Dcb, Register};
use super::protocol::frame::{self, ReadHeader, WriteAck, READ_HEADER_LEN, WRITE_ACK_LEN};
use super::transport::{TransportError, TransportStats, TransportTrait};
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, Mutex, MutexGuard};
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Largest read payload accepted from a header; anything above is line noise
pub const MAX_READ_PAYLOAD: usize = 1024;

/// Link state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    /// Transport not open
    Closed,
    /// Transport being opened
    Opening,
    /// Transport open
    Open,
}

/// Session events
#[derive(Debug, Clone, PartialEq)]
pub enum LinkEvent {
    /// Link state changed
    StateChanged(LinkState),
    /// A transaction with this device took the link
    TransactionStarted(u8),
    /// The transaction with this device finished, successfully or not
    TransactionFinished(u8),
    /// Device answered after being offline
    DeviceOnline(u8),
    /// Device stopped answering
    DeviceOffline(u8),
}

/// Link timing
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkConfig {
    /// Window for a read response
    pub device_timeout: Duration,
    /// Window for a write acknowledgement
    pub write_timeout: Duration,
    /// Longest wait for the link before giving up
    pub contention_timeout: Duration,
    /// Quiet time after each transaction
    pub pacing: Duration,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            device_timeout: Duration::from_secs(3),
            write_timeout: Duration::from_secs(3),
            contention_timeout: Duration::from_secs(2),
            pacing: Duration::from_millis(100),
        }
    }
}

impl LinkConfig {
    /// Set read timeout
    #[must_use]
    pub fn device_timeout(mut self, timeout: Duration) -> Self {
        self.device_timeout = timeout;
        self
    }

    /// Set write timeout
    #[must_use]
    pub fn write_timeout(mut self, timeout: Duration) -> Self {
        self.write_timeout = timeout;
        self
    }

    /// Set contention ceiling
    #[must_use]
    pub fn contention_timeout(mut self, timeout: Duration) -> Self {
        self.contention_timeout = timeout;
        self
    }

    /// Set pacing delay
    #[must_use]
    pub fn pacing(mut self, pacing: Duration) -> Self {
        self.pacing = pacing;
        self
    }
}

/// Transport plus the bookkeeping that travels with it
struct Link {
    transport: Box<dyn TransportTrait>,
    /// Input may hold leftovers of an abandoned response
    needs_resync: bool,
}

/// Exclusive use of the link for one transaction
///
/// Dropping the permit releases the link immediately; [`Permit::release`]
/// waits out the pacing delay first.
pub struct Permit<'a> {
    link: MutexGuard<'a, Link>,
    session: &'a LinkSession,
    device: u8,
}

impl Permit<'_> {
    /// Device the permit was taken for
    pub fn device(&self) -> u8 {
        self.device
    }

    /// Wait out the pacing delay, then release the link
    pub async fn release(self) {
        tokio::time::sleep(self.session.config.pacing).await;
    }
}

impl Drop for Permit<'_> {
    fn drop(&mut self) {
        *self.session.holder.write() = None;
        let _ = self
            .session
            .events
            .send(LinkEvent::TransactionFinished(self.device));
    }
}

/// Single shared link to a hub
pub struct LinkSession {
    link: Mutex<Link>,
    state: RwLock<LinkState>,
    holder: RwLock<Option<u8>>,
    cache: Arc<DeviceCache>,
    config: LinkConfig,
    info: String,
    trace: Option<FrameLog>,
    events: broadcast::Sender<LinkEvent>,
}

impl LinkSession {
    /// Create a session over `transport`; the link opens on first use
    pub fn new(transport: Box<dyn TransportTrait>, cache: Arc<DeviceCache>, config: LinkConfig) -> Self {
        let (events, _) = broadcast::channel(256);
        let info = transport.connection_info();
        let state = if transport.is_connected() {
            LinkState::Open
        } else {
            LinkState::Closed
        };

        Self {
            link: Mutex::new(Link {
                transport,
                needs_resync: false,
            }),
            state: RwLock::new(state),
            holder: RwLock::new(None),
            cache,
            config,
            info,
            trace: None,
            events,
        }
    }

    /// Record every frame to `trace`
    #[must_use]
    pub fn with_trace(mut self, trace: FrameLog) -> Self {
        self.trace = Some(trace);
        self
    }

    /// Device cache updated by this session
    pub fn cache(&self) -> &Arc<DeviceCache> {
        &self.cache
    }

    /// Timing in use
    pub fn config(&self) -> &LinkConfig {
        &self.config
    }

    /// Transport description
    pub fn connection_info(&self) -> &str {
        &self.info
    }

    /// Current link state
    pub fn state(&self) -> LinkState {
        *self.state.read()
    }

    /// Device whose transaction holds the link
    pub fn holder(&self) -> Option<u8> {
        *self.holder.read()
    }

    /// Subscribe to session events
    pub fn subscribe(&self) -> broadcast::Receiver<LinkEvent> {
        self.events.subscribe()
    }

    /// Transport statistics; waits for the link like any transaction
    pub async fn stats(&self) -> HubResult<TransportStats> {
        let permit = self.acquire_link().await?;
        Ok(permit.transport.stats())
    }

    fn set_state(&self, state: LinkState) {
        let previous = std::mem::replace(&mut *self.state.write(), state);
        if previous != state {
            debug!(?state, "link state changed");
            let _ = self.events.send(LinkEvent::StateChanged(state));
        }
    }

    async fn acquire_link(&self) -> HubResult<MutexGuard<'_, Link>> {
        tokio::time::timeout(self.config.contention_timeout, self.link.lock())
            .await
            .map_err(|_| HubError::ContentionTimeout(self.config.contention_timeout))
    }

    /// Wait for exclusive use of the link on behalf of `device`
    ///
    /// Gives up with [`HubError::ContentionTimeout`] after the contention
    /// ceiling, leaving no claim behind.
    pub async fn acquire(&self, device: u8) -> HubResult<Permit<'_>> {
        let link = self.acquire_link().await?;
        *self.holder.write() = Some(device);
        let _ = self.events.send(LinkEvent::TransactionStarted(device));
        Ok(Permit {
            link,
            session: self,
            device,
        })
    }

    // ============ Transaction plumbing ============

    async fn ensure_open(&self, link: &mut Link) -> HubResult<()> {
        if link.transport.is_connected() {
            return Ok(());
        }

        self.set_state(LinkState::Opening);
        match link.transport.connect().await {
            Ok(()) => {
                info!(link = %self.info, "link opened");
                link.needs_resync = false;
                self.set_state(LinkState::Open);
                Ok(())
            }
            Err(e) => {
                warn!(link = %self.info, "failed to open link: {e}");
                self.set_state(LinkState::Closed);
                self.cache.mark_all_offline();
                Err(e.into())
            }
        }
    }

    async fn resync(&self, link: &mut Link, device: u8) -> HubResult<()> {
        if !link.needs_resync {
            return Ok(());
        }
        match link.transport.clear_input().await {
            Ok(discarded) => {
                link.needs_resync = false;
                if discarded > 0 {
                    debug!(device, discarded, "discarded stale input");
                }
                self.trace_info(Some(device), &format!("resync, {discarded} bytes dropped"));
                Ok(())
            }
            Err(e) => Err(self.fail_link(link, e).await),
        }
    }

    async fn fail_link(&self, link: &mut Link, err: TransportError) -> HubError {
        warn!(link = %self.info, "link failed: {err}");
        link.transport.disconnect().await.ok();
        link.needs_resync = false;
        self.set_state(LinkState::Closed);
        self.cache.mark_all_offline();
        self.trace_info(None, &format!("link closed: {err}"));
        err.into()
    }

    async fn send_frame(&self, link: &mut Link, device: u8, request: &[u8]) -> HubResult<()> {
        if let Some(trace) = &self.trace {
            trace.lock().log_tx(device, request);
        }
        match link.transport.send(request).await {
            Ok(_) => Ok(()),
            Err(e) => Err(self.fail_link(link, e).await),
        }
    }

    async fn read_exact(
        &self,
        link: &mut Link,
        device: u8,
        buf: &mut [u8],
        deadline: Instant,
        timeout: Duration,
    ) -> HubResult<()> {
        match tokio::time::timeout_at(deadline, link.transport.read_exact(buf)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(self.fail_link(link, e).await),
            Err(_) => Err(HubError::DeviceTimeout { device, timeout }),
        }
    }

    fn trace_rx(&self, device: u8, parts: &[&[u8]]) {
        if let Some(trace) = &self.trace {
            trace.lock().log_rx(device, &parts.concat());
        }
    }

    fn trace_info(&self, device: Option<u8>, message: &str) {
        if let Some(trace) = &self.trace {
            trace.lock().log_info(device, message);
        }
    }

    async fn read_frame(
        &self,
        link: &mut Link,
        device: u8,
        address: u16,
        length: u16,
        timeout: Duration,
    ) -> HubResult<Dcb> {
        let request = frame::encode_read(device, address, length);
        self.send_frame(link, device, &request).await?;
        let deadline = Instant::now() + timeout;

        loop {
            let mut header = [0u8; READ_HEADER_LEN];
            self.read_exact(link, device, &mut header, deadline, timeout).await?;
            let header = ReadHeader::parse(header);

            if !header.is_well_formed() || header.payload_len() > MAX_READ_PAYLOAD {
                self.trace_rx(device, &[header.as_bytes()]);
                return Err(HubError::Protocol {
                    device,
                    detail: format!("unexpected response header {}", hex::encode(header.as_bytes())),
                });
            }

            let mut body = vec![0u8; header.body_len()];
            self.read_exact(link, device, &mut body, deadline, timeout).await?;
            self.trace_rx(device, &[header.as_bytes(), &body]);

            if header.answers(device, address) {
                return frame::decode_read_response(&header, &body)
                    .map_err(|e| HubError::from_frame(device, e));
            }

            // Late reply to an abandoned request; ours is still to come
            debug!(
                device,
                from = header.source(),
                address = header.address(),
                "discarded reply to an earlier request"
            );
            self.trace_info(
                Some(device),
                &format!("discarded late reply from device {}", header.source()),
            );
        }
    }

    async fn write_frame(
        &self,
        link: &mut Link,
        device: u8,
        address: u16,
        payload: &[u8],
        timeout: Duration,
    ) -> HubResult<WriteAck> {
        let request =
            frame::encode_write(device, address, payload).map_err(|e| HubError::from_frame(device, e))?;
        self.send_frame(link, device, &request).await?;
        let deadline = Instant::now() + timeout;

        loop {
            let mut raw = [0u8; WRITE_ACK_LEN];
            self.read_exact(link, device, &mut raw, deadline, timeout).await?;
            self.trace_rx(device, &[&raw]);

            let ack = frame::decode_write_ack(raw).map_err(|e| HubError::from_frame(device, e))?;
            if !ack.is_well_formed() {
                return Err(HubError::Protocol {
                    device,
                    detail: format!("unexpected acknowledgement {}", hex::encode(ack.as_bytes())),
                });
            }
            if ack.source() == device {
                return Ok(ack);
            }

            debug!(device, from = ack.source(), "discarded acknowledgement of an earlier write");
            self.trace_info(
                Some(device),
                &format!("discarded late acknowledgement from device {}", ack.source()),
            );
        }
    }

    /// Open the link if needed and drain leftovers of an abandoned exchange
    async fn begin(&self, link: &mut Link, device: u8) -> HubResult<()> {
        self.ensure_open(link).await?;
        self.resync(link, device).await?;
        // Cleared only once the whole response has been consumed
        link.needs_resync = true;
        Ok(())
    }

    async fn read_on(
        &self,
        permit: &mut Permit<'_>,
        address: u16,
        length: u16,
        timeout: Duration,
    ) -> HubResult<Dcb> {
        let device = permit.device;
        let link = &mut *permit.link;

        self.begin(link, device).await?;
        let dcb = self.read_frame(link, device, address, length, timeout).await?;
        link.needs_resync = false;
        Ok(dcb)
    }

    async fn write_on(
        &self,
        permit: &mut Permit<'_>,
        address: u16,
        payload: &[u8],
        timeout: Duration,
    ) -> HubResult<WriteAck> {
        let device = permit.device;
        let link = &mut *permit.link;

        self.begin(link, device).await?;
        let ack = self.write_frame(link, device, address, payload, timeout).await?;
        link.needs_resync = false;
        Ok(ack)
    }

    fn record_success(&self, device: u8) {
        let was_online = self.cache.get(device).is_some_and(|s| s.online);
        self.cache.mark_online(device);
        if !was_online {
            info!(device, "device online");
            let _ = self.events.send(LinkEvent::DeviceOnline(device));
        }
    }

    fn record_failure(&self, device: u8, err: &HubError) {
        if err.is_device_fault() {
            warn!(device, "{err}");
            let was_online = self.cache.get(device).is_some_and(|s| s.online);
            self.cache.mark_offline(device);
            if was_online {
                let _ = self.events.send(LinkEvent::DeviceOffline(device));
            }
        } else if err.is_link_fault() {
            let _ = self.events.send(LinkEvent::DeviceOffline(device));
        }
    }

    fn check_device(&self, device: u8) -> HubResult<()> {
        if self.cache.contains(device) {
            Ok(())
        } else {
            Err(HubError::UnknownDevice(device))
        }
    }

    // ============ Operations ============

    /// Read the whole DCB of `device` and store it in the cache
    pub async fn read_device(&self, device: u8, timeout: Duration) -> HubResult<Dcb> {
        self.check_device(device)?;
        let mut permit = self.acquire(device).await?;

        let result = self.read_on(&mut permit, 0, frame::FULL_DCB, timeout).await;

        match &result {
            Ok(dcb) => {
                debug!(device, len = dcb.len(), "DCB read");
                self.record_success(device);
                self.cache.update(device, dcb.clone());
            }
            Err(e) => self.record_failure(device, e),
        }

        permit.release().await;
        result
    }

    /// Read `length` bytes at protocol address `address` without touching the cache
    pub async fn read_registers(
        &self,
        device: u8,
        address: u16,
        length: u16,
        timeout: Duration,
    ) -> HubResult<Vec<u8>> {
        self.check_device(device)?;
        let mut permit = self.acquire(device).await?;

        let result = self
            .read_on(&mut permit, address, length, timeout)
            .await
            .map(|data| data.as_bytes().to_vec());

        match &result {
            Ok(_) => self.record_success(device),
            Err(e) => self.record_failure(device, e),
        }

        permit.release().await;
        result
    }

    /// Write `payload` at protocol address `address`
    pub async fn write_device(
        &self,
        device: u8,
        address: u16,
        payload: &[u8],
        timeout: Duration,
    ) -> HubResult<WriteAck> {
        self.check_device(device)?;
        let mut permit = self.acquire(device).await?;

        let result = self.write_on(&mut permit, address, payload, timeout).await;

        match &result {
            Ok(_) => {
                debug!(device, address, len = payload.len(), "write acknowledged");
                self.record_success(device);
            }
            Err(e) => self.record_failure(device, e),
        }

        permit.release().await;
        result
    }

    /// Write `payload` to `register` and record the result in the cache
    ///
    /// Once the write is acknowledged, `cached` (the register's DCB
    /// encoding, when it differs from the wire payload or is known at all)
    /// replaces the cached copy of the register.
    pub async fn write_register(
        &self,
        device: u8,
        register: Register,
        payload: &[u8],
        cached: Option<&[u8]>,
        timeout: Duration,
    ) -> HubResult<WriteAck> {
        let address = register.spec().wire_address.ok_or_else(|| HubError::Protocol {
            device,
            detail: format!("{register} has no protocol address"),
        })?;

        let ack = self.write_device(device, address, payload, timeout).await?;
        if let Some(bytes) = cached {
            self.cache.patch_register(device, register, bytes);
        }
        Ok(ack)
    }

    /// Re-read `registers` with narrow reads and patch the cache
    ///
    /// Registers without a protocol address, or absent on the device's
    /// model, are skipped. Stops at the first failure.
    pub async fn refresh_registers(
        &self,
        device: u8,
        registers: &[Register],
        timeout: Duration,
    ) -> HubResult<()> {
        let model = self.cache.model(device).ok_or(HubError::UnknownDevice(device))?;

        for &register in registers {
            let spec = register.spec();
            let Some(address) = spec.wire_address else {
                continue;
            };
            if !dcb::is_supported(register, model) {
                continue;
            }

            // Register widths are at most 16 bytes
            let length = spec.width as u16;
            let bytes = self.read_registers(device, address, length, timeout).await?;
            if bytes.len() != spec.width {
                return Err(HubError::Protocol {
                    device,
                    detail: format!(
                        "{register}: expected {} bytes, got {}",
                        spec.width,
                        bytes.len()
                    ),
                });
            }
            self.cache.patch_register(device, register, &bytes);
            debug!(device, %register, "register refreshed");
        }
        Ok(())
    }

    /// Read every device in `devices`, strictly in order
    ///
    /// Device faults are recorded and the batch moves on; a link fault ends
    /// the batch and is reported for every device not yet read.
    pub async fn read_all_devices(
        &self,
        devices: &[u8],
        timeout: Duration,
    ) -> BTreeMap<u8, HubResult<Dcb>> {
        let mut results = BTreeMap::new();
        let mut remaining = devices.iter();

        while let Some(&device) = remaining.next() {
            let result = self.read_device(device, timeout).await;
            let link_error = match &result {
                Err(e) if e.is_link_fault() => Some(e.clone()),
                _ => None,
            };
            results.insert(device, result);

            if let Some(err) = link_error {
                for &skipped in remaining.by_ref() {
                    results.insert(skipped, Err(err.clone()));
                }
                break;
            }
        }
        results
    }

    /// Open the link now rather than on the first transaction
    pub async fn open(&self) -> HubResult<()> {
        let mut link = self.acquire_link().await?;
        self.ensure_open(&mut link).await
    }

    /// Close the transport; the next transaction reopens it
    pub async fn close(&self) {
        let mut link = self.link.lock().await;
        if link.transport.is_connected() {
            link.transport.disconnect().await.ok();
            info!(link = %self.info, "link closed");
        }
        link.needs_resync = false;
        self.set_state(LinkState::Closed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::protocol::dcb::Model;
    use crate::core::simulator::{VirtualBus, VirtualThermostat};
    use crate::core::logger::FrameTrace;
    use crate::core::transport::MockTransportTrait;
    use std::collections::VecDeque;

    /// Bytes waiting on the line, oldest first
    type Wire = Arc<parking_lot::Mutex<VecDeque<u8>>>;

    /// Mock link in front of `bus`; whatever is already on `wire` arrives
    /// ahead of the replies to new requests
    fn wire_transport(bus: &VirtualBus, wire: &Wire) -> MockTransportTrait {
        let mut transport = MockTransportTrait::new();
        transport.expect_connection_info().return_const("wire".to_string());
        transport.expect_is_connected().return_const(true);

        let (replies, bus) = (Arc::clone(wire), bus.clone());
        transport.expect_send().returning(move |data| {
            if let Some(reply) = bus.process(data) {
                replies.lock().extend(reply);
            }
            Ok(data.len())
        });

        let incoming = Arc::clone(wire);
        transport.expect_read_exact().returning(move |buf| {
            let mut incoming = incoming.lock();
            let n = buf.len();
            if incoming.len() < n {
                return Err(TransportError::Disconnected);
            }
            for (slot, byte) in buf.iter_mut().zip(incoming.drain(..n)) {
                *slot = byte;
            }
            Ok(())
        });
        transport
    }

    fn mock_session(transport: MockTransportTrait, ids: &[(u8, Model)]) -> LinkSession {
        let cache = Arc::new(DeviceCache::new());
        for &(id, model) in ids {
            cache.register(id, model);
        }
        LinkSession::new(Box::new(transport), cache, LinkConfig::default())
    }

    fn mixed_bus() -> VirtualBus {
        let bus = VirtualBus::new();
        bus.add(VirtualThermostat::new(1, Model::PrtHw).with_target_temperature(30));
        bus.add(VirtualThermostat::new(2, Model::Prt).with_target_temperature(10));
        bus
    }

    const MIXED: &[(u8, Model)] = &[(1, Model::PrtHw), (2, Model::Prt)];

    fn session_on(bus: &VirtualBus, ids: &[(u8, Model)]) -> LinkSession {
        let cache = Arc::new(DeviceCache::new());
        for &(id, model) in ids {
            cache.register(id, model);
        }
        LinkSession::new(Box::new(bus.transport()), cache, LinkConfig::default())
    }

    fn bus_with(ids: &[(u8, Model)]) -> VirtualBus {
        let bus = VirtualBus::new();
        for &(id, model) in ids {
            bus.add(VirtualThermostat::new(id, model));
        }
        bus
    }

    #[tokio::test(start_paused = true)]
    async fn test_read_device_updates_cache() {
        let devices = [(1, Model::Prt)];
        let bus = bus_with(&devices);
        let session = session_on(&bus, &devices);
        assert_eq!(session.state(), LinkState::Closed);

        let dcb = session.read_device(1, Duration::from_secs(3)).await.unwrap();
        assert_eq!(dcb.len(), Model::Prt.dcb_len());
        assert_eq!(session.state(), LinkState::Open);
        assert_eq!(session.holder(), None);

        let state = session.cache().get(1).unwrap();
        assert!(state.online);
        assert_eq!(state.dcb, Some(dcb));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_marks_only_that_device_offline() {
        let devices = [(1, Model::Prt), (2, Model::Prt), (3, Model::PrtHw)];
        let bus = bus_with(&devices);
        bus.set_responsive(2, false);
        let session = session_on(&bus, &devices);

        let results = session.read_all_devices(&[1, 2, 3], Duration::from_secs(3)).await;
        assert!(results[&1].is_ok());
        assert!(matches!(results[&2], Err(HubError::DeviceTimeout { device: 2, .. })));
        assert!(results[&3].is_ok());

        let cache = session.cache();
        assert!(cache.get(1).unwrap().online);
        assert!(!cache.get(2).unwrap().online);
        assert!(cache.get(3).unwrap().online);
        assert_eq!(bus.requests_to(), vec![1, 2, 3]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_keeps_stale_dcb() {
        let devices = [(1, Model::Prt)];
        let bus = bus_with(&devices);
        let session = session_on(&bus, &devices);

        session.read_device(1, Duration::from_secs(3)).await.unwrap();
        bus.set_responsive(1, false);
        let err = session.read_device(1, Duration::from_secs(3)).await.unwrap_err();
        assert!(err.is_device_fault());

        let state = session.cache().get(1).unwrap();
        assert!(!state.online);
        assert!(state.is_stale());
        assert_eq!(state.target_temperature(), Some(20));
    }

    #[tokio::test(start_paused = true)]
    async fn test_corrupt_response_is_checksum_error_and_resyncs() {
        let devices = [(1, Model::Prt), (2, Model::Prt)];
        let bus = bus_with(&devices);
        bus.set_corrupt(1, true);
        let session = session_on(&bus, &devices);

        let results = session.read_all_devices(&[1, 2], Duration::from_secs(1)).await;
        assert!(matches!(results[&1], Err(HubError::Checksum { device: 1, .. })));
        assert!(results[&2].is_ok());
        assert!(!session.cache().get(1).unwrap().online);
    }

    #[tokio::test(start_paused = true)]
    async fn test_leftover_bytes_are_drained_after_timeout() {
        let devices = [(1, Model::Prt)];
        let bus = bus_with(&devices);
        let session = session_on(&bus, &devices);

        // Reply arrives too late: header read times out, bytes stay queued
        bus.set_latency(Duration::from_secs(5));
        let err = session.read_device(1, Duration::from_secs(1)).await.unwrap_err();
        assert!(matches!(err, HubError::DeviceTimeout { .. }));

        bus.set_latency(Duration::ZERO);
        session.read_device(1, Duration::from_secs(1)).await.unwrap();
        assert!(bus.bytes_discarded() > 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_write_then_refresh_patches_cache() {
        let devices = [(5, Model::PrtHw)];
        let bus = bus_with(&devices);
        let session = session_on(&bus, &devices);
        session.read_device(5, Duration::from_secs(3)).await.unwrap();

        let ack = session
            .write_device(5, 18, &[23], Duration::from_secs(3))
            .await
            .unwrap();
        assert_eq!(ack.source(), 5);
        assert_eq!(bus.dcb(5).unwrap()[18], 23);

        bus.set_heating(5, true);
        session
            .refresh_registers(5, &[Register::HeatStatus], Duration::from_secs(3))
            .await
            .unwrap();
        assert_eq!(session.cache().get(5).unwrap().heat_status(), Some(true));
    }

    #[tokio::test(start_paused = true)]
    async fn test_unknown_device_sends_nothing() {
        let bus = bus_with(&[(1, Model::Prt)]);
        let session = session_on(&bus, &[(1, Model::Prt)]);

        let err = session.write_device(9, 18, &[20], Duration::from_secs(1)).await.unwrap_err();
        assert_eq!(err, HubError::UnknownDevice(9));
        assert!(bus.requests_to().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_contention_timeout_leaves_no_claim() {
        let devices = [(1, Model::Prt)];
        let bus = bus_with(&devices);
        let session = session_on(&bus, &devices);

        let held = session.acquire(1).await.unwrap();
        assert_eq!(session.holder(), Some(1));

        let err = session.read_device(1, Duration::from_secs(1)).await.unwrap_err();
        assert_eq!(err, HubError::ContentionTimeout(Duration::from_secs(2)));
        assert_eq!(session.holder(), Some(1));
        assert!(bus.requests_to().is_empty());

        drop(held);
        assert_eq!(session.holder(), None);
        session.read_device(1, Duration::from_secs(1)).await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_open_failure_marks_all_offline_and_aborts_batch() {
        let cache = Arc::new(DeviceCache::new());
        for id in [1, 2, 3] {
            cache.register(id, Model::Prt);
        }

        let mut transport = MockTransportTrait::new();
        transport.expect_connection_info().return_const("mock".to_string());
        transport.expect_is_connected().return_const(false);
        transport
            .expect_connect()
            .times(1)
            .returning(|| Err(TransportError::ConnectionFailed("refused".into())));
        transport.expect_send().never();

        let session = LinkSession::new(Box::new(transport), cache, LinkConfig::default());
        let results = session.read_all_devices(&[1, 2, 3], Duration::from_secs(1)).await;

        assert_eq!(results.len(), 3);
        assert!(results.values().all(|r| matches!(r, Err(HubError::Link(_)))));
        assert!(session.cache().all().iter().all(|s| !s.online));
        assert_eq!(session.state(), LinkState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_send_failure_closes_link() {
        let cache = Arc::new(DeviceCache::new());
        cache.register(1, Model::Prt);
        cache.register(2, Model::Prt);

        let mut transport = MockTransportTrait::new();
        transport.expect_connection_info().return_const("mock".to_string());
        transport.expect_is_connected().return_const(true);
        transport
            .expect_send()
            .times(1)
            .returning(|_| Err(TransportError::Disconnected));
        transport.expect_disconnect().times(1).returning(|| Ok(()));

        let session = LinkSession::new(Box::new(transport), cache, LinkConfig::default());
        let results = session.read_all_devices(&[1, 2], Duration::from_secs(1)).await;

        assert!(matches!(results[&1], Err(HubError::Link(_))));
        assert!(matches!(results[&2], Err(HubError::Link(_))));
        assert_eq!(session.state(), LinkState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_events_bracket_each_transaction() {
        let devices = [(1, Model::Prt)];
        let bus = bus_with(&devices);
        let session = session_on(&bus, &devices);
        let mut events = session.subscribe();

        session.read_device(1, Duration::from_secs(1)).await.unwrap();

        let mut seen = Vec::new();
        while let Ok(event) = events.try_recv() {
            seen.push(event);
        }
        assert_eq!(
            seen,
            vec![
                LinkEvent::TransactionStarted(1),
                LinkEvent::StateChanged(LinkState::Opening),
                LinkEvent::StateChanged(LinkState::Open),
                LinkEvent::DeviceOnline(1),
                LinkEvent::TransactionFinished(1),
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_then_reopen() {
        let devices = [(1, Model::Prt)];
        let bus = bus_with(&devices);
        let session = session_on(&bus, &devices);

        session.read_device(1, Duration::from_secs(1)).await.unwrap();
        session.close().await;
        assert_eq!(session.state(), LinkState::Closed);

        session.read_device(1, Duration::from_secs(1)).await.unwrap();
        assert_eq!(session.state(), LinkState::Open);
        assert_eq!(bus.connects(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_late_reply_from_another_device_is_skipped() {
        let bus = mixed_bus();
        let wire = Wire::default();
        // Device 1 answering a request that already timed out
        let late = bus.process(&frame::encode_read(1, 0, frame::FULL_DCB)).unwrap();
        wire.lock().extend(late);

        let trace = FrameTrace::new().shared();
        let session = mock_session(wire_transport(&bus, &wire), MIXED).with_trace(Arc::clone(&trace));

        let dcb = session.read_device(2, Duration::from_secs(1)).await.unwrap();
        assert_eq!(dcb.len(), Model::Prt.dcb_len());
        assert_eq!(session.cache().get(2).unwrap().target_temperature(), Some(10));
        assert!(session.cache().get(1).unwrap().dcb.is_none());
        assert!(wire.lock().is_empty());
        assert!(trace
            .lock()
            .entries()
            .any(|e| e.note.as_deref() == Some("discarded late reply from device 1")));

        let dcb = session.read_device(1, Duration::from_secs(1)).await.unwrap();
        assert_eq!(dcb.len(), Model::PrtHw.dcb_len());
        assert_eq!(session.cache().get(1).unwrap().target_temperature(), Some(30));
    }

    #[tokio::test(start_paused = true)]
    async fn test_late_reply_to_another_address_is_skipped() {
        let bus = mixed_bus();
        let wire = Wire::default();
        let late = bus.process(&frame::encode_read(2, 41, 1)).unwrap();
        wire.lock().extend(late);

        let session = mock_session(wire_transport(&bus, &wire), MIXED);
        let dcb = session.read_device(2, Duration::from_secs(1)).await.unwrap();
        assert_eq!(dcb.len(), Model::Prt.dcb_len());
    }

    #[tokio::test(start_paused = true)]
    async fn test_unexpected_header_is_protocol_error_and_resyncs() {
        let bus = mixed_bus();
        let wire = Wire::default();
        // A write acknowledgement where a read header should start
        let ack = bus.process(&frame::encode_write(1, 18, &[21]).unwrap()).unwrap();
        wire.lock().extend(ack);

        let mut transport = wire_transport(&bus, &wire);
        let drained = Arc::clone(&wire);
        transport.expect_clear_input().times(1).returning(move || {
            let mut line = drained.lock();
            let n = line.len();
            line.clear();
            Ok(n)
        });
        let session = mock_session(transport, MIXED);

        let err = session.read_device(2, Duration::from_secs(1)).await.unwrap_err();
        assert!(matches!(err, HubError::Protocol { device: 2, .. }), "{err:?}");
        assert!(!session.cache().get(2).unwrap().online);

        let dcb = session.read_device(2, Duration::from_secs(1)).await.unwrap();
        assert_eq!(dcb.len(), Model::Prt.dcb_len());
        assert!(session.cache().get(2).unwrap().online);
    }

    #[tokio::test(start_paused = true)]
    async fn test_late_acknowledgement_from_another_device_is_skipped() {
        let bus = mixed_bus();
        let wire = Wire::default();
        let late = bus.process(&frame::encode_write(1, 17, &[12]).unwrap()).unwrap();
        wire.lock().extend(late);

        let session = mock_session(wire_transport(&bus, &wire), MIXED);
        let ack = session.write_device(2, 18, &[22], Duration::from_secs(1)).await.unwrap();
        assert_eq!(ack.source(), 2);
        assert_eq!(bus.dcb(2).unwrap()[18], 22);
        assert!(wire.lock().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_missing_port_is_reported_for_every_device() {
        let mut transport = MockTransportTrait::new();
        transport.expect_connection_info().return_const("/dev/ttyUSB9".to_string());
        transport.expect_is_connected().return_const(false);
        transport
            .expect_connect()
            .times(1)
            .returning(|| Err(TransportError::PortNotFound("/dev/ttyUSB9".into())));
        transport.expect_send().never();

        let session = mock_session(transport, MIXED);
        let results = session.read_all_devices(&[1, 2], Duration::from_secs(1)).await;

        let expected = HubError::PortNotFound("/dev/ttyUSB9".into());
        assert_eq!(results[&1], Err(expected.clone()));
        assert_eq!(results[&2], Err(expected));
        assert_eq!(session.state(), LinkState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_write_register_patches_cache_only_after_ack() {
        let devices = [(5, Model::PrtHw)];
        let bus = bus_with(&devices);
        let session = session_on(&bus, &devices);
        session.read_device(5, Duration::from_secs(3)).await.unwrap();

        session
            .write_register(5, Register::TargetTemperature, &[23], Some(&[23]), Duration::from_secs(3))
            .await
            .unwrap();
        assert_eq!(session.cache().get(5).unwrap().target_temperature(), Some(23));

        bus.set_responsive(5, false);
        let err = session
            .write_register(5, Register::TargetTemperature, &[25], Some(&[25]), Duration::from_secs(3))
            .await
            .unwrap_err();
        assert!(matches!(err, HubError::DeviceTimeout { device: 5, .. }));
        assert_eq!(session.cache().get(5).unwrap().target_temperature(), Some(23));
    }

    #[tokio::test(start_paused = true)]
    async fn test_write_register_without_protocol_address() {
        let devices = [(5, Model::PrtHw)];
        let bus = bus_with(&devices);
        let session = session_on(&bus, &devices);

        let err = session
            .write_register(5, Register::RoomTemperature, &[0, 200], None, Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, HubError::Protocol { device: 5, .. }));
        assert!(bus.requests_to().is_empty());
    }
}
