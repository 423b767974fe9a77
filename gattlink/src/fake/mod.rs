//! An in-memory radio, for tests and demos.
//!
//! Every request made through [`FakeRadio`] (or a link it hands out) is
//! recorded as a [`Call`] and answered with callbacks that are queued to the
//! attached [`Session`], the same way a real radio's glue code would deliver
//! them. By default every request succeeds; a responder can be installed to
//! script other replies.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Mutex as StdMutex;
use std::sync::Arc;

use anyhow::anyhow;
use log::{debug, trace, warn};
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::characteristic::{Characteristic, CharacteristicProperties, WriteType};
use crate::descriptor::Descriptor;
use crate::radio::{BondState, ConnectionPriority, ConnectionState, Radio, RadioEvent, RadioLink, ScanMode, Filter};
use crate::service::Service;
use crate::session::{Session, SessionConfig};
use crate::uuid::{
    uuid_from_u16, CLIENT_CHARACTERISTIC_CONFIGURATION_UUID, GENERIC_ATTRIBUTE_SERVICE_UUID,
    SERVICE_CHANGED_CHARACTERISTIC_UUID,
};
use crate::{
    Address, CharacteristicHandle, DescriptorHandle, Device, Error, GattStatus, LinkId, Result,
    ServiceHandle, MAC,
};

pub const HEART_RATE_SERVICE_UUID: Uuid = uuid_from_u16(0x180D);
pub const HEART_RATE_MEASUREMENT_UUID: Uuid = uuid_from_u16(0x2A37);
pub const BODY_SENSOR_LOCATION_UUID: Uuid = uuid_from_u16(0x2A38);
pub const HEART_RATE_CONTROL_POINT_UUID: Uuid = uuid_from_u16(0x2A39);
pub const BATTERY_SERVICE_UUID: Uuid = uuid_from_u16(0x180F);
pub const BATTERY_LEVEL_UUID: Uuid = uuid_from_u16(0x2A19);

/// The RSSI reported for every remote
pub const FAKE_RSSI: i32 = -60;

/// One request made of the fake radio
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Call {
    StartScan { mode: ScanMode, service_uuids: Vec<Uuid> },
    StopScan(ScanMode),
    Connect { link_id: LinkId, auto_connect: bool },
    Disconnect(LinkId),
    Close(LinkId),
    DiscoverServices(LinkId),
    Refresh(LinkId),
    ReadCharacteristic(LinkId, CharacteristicHandle),
    WriteCharacteristic(LinkId, CharacteristicHandle, Vec<u8>, WriteType),
    ReadDescriptor(LinkId, DescriptorHandle),
    WriteDescriptor(LinkId, DescriptorHandle, Vec<u8>),
    SetNotification(LinkId, CharacteristicHandle, bool),
    ReadRemoteRssi(LinkId),
    RequestMtu(LinkId, u16),
    RequestConnectionPriority(LinkId, ConnectionPriority),
    BeginReliableWrite(LinkId),
    ExecuteReliableWrite(LinkId),
    AbortReliableWrite(LinkId),
}

/// Decides which callbacks answer a call
pub type Responder = Box<dyn FnMut(&FakeRadio, &Call) -> Vec<RadioEvent> + Send>;

#[derive(Clone)]
pub struct FakeRadio {
    inner: Arc<FakeRadioInner>,
}

struct FakeRadioInner {
    calls: StdMutex<Vec<Call>>,
    responder: StdMutex<Option<Responder>>,
    events: StdMutex<Option<mpsc::UnboundedSender<RadioEvent>>>,

    advertisers: StdMutex<Vec<Device>>,
    services: StdMutex<Vec<Service>>,
    bond_state: StdMutex<BondState>,
    characteristic_values: StdMutex<HashMap<CharacteristicHandle, Vec<u8>>>,
    descriptor_values: StdMutex<HashMap<DescriptorHandle, Vec<u8>>>,

    scanner_available: AtomicBool,
    links_available: AtomicBool,
    priority_failures: AtomicU32,
}

impl Default for FakeRadio {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeRadio {
    pub fn new() -> Self {
        FakeRadio {
            inner: Arc::new(FakeRadioInner {
                calls: StdMutex::new(vec![]),
                responder: StdMutex::new(None),
                events: StdMutex::new(None),
                advertisers: StdMutex::new(vec![]),
                services: StdMutex::new(vec![]),
                bond_state: StdMutex::new(BondState::None),
                characteristic_values: StdMutex::new(HashMap::new()),
                descriptor_values: StdMutex::new(HashMap::new()),
                scanner_available: AtomicBool::new(true),
                links_available: AtomicBool::new(true),
                priority_failures: AtomicU32::new(0),
            }),
        }
    }

    /// Starts a session on this radio and attaches to it
    pub async fn start_session(&self, config: SessionConfig) -> Result<Session> {
        let session = config.start(Arc::new(self.clone())).await?;
        self.attach(&session);
        Ok(session)
    }

    /// Routes future callbacks to `session`
    pub fn attach(&self, session: &Session) {
        *self.inner.events.lock().unwrap() = Some(session.event_sender());
    }

    pub fn set_responder<F>(&self, responder: F)
        where F: FnMut(&FakeRadio, &Call) -> Vec<RadioEvent> + Send + 'static
    {
        *self.inner.responder.lock().unwrap() = Some(Box::new(responder));
    }

    pub fn add_advertiser(&self, device: Device) {
        self.inner.advertisers.lock().unwrap().push(device);
    }

    /// The service table every link reports after discovery
    pub fn set_services(&self, services: Vec<Service>) {
        *self.inner.services.lock().unwrap() = services;
    }

    pub fn set_bond_state(&self, bond_state: BondState) {
        *self.inner.bond_state.lock().unwrap() = bond_state;
    }

    pub fn set_characteristic_value(&self, characteristic: CharacteristicHandle, value: &[u8]) {
        self.inner.characteristic_values.lock().unwrap().insert(characteristic, value.to_vec());
    }

    pub fn characteristic_value(&self, characteristic: CharacteristicHandle) -> Option<Vec<u8>> {
        self.inner.characteristic_values.lock().unwrap().get(&characteristic).cloned()
    }

    pub fn set_descriptor_value(&self, descriptor: DescriptorHandle, value: &[u8]) {
        self.inner.descriptor_values.lock().unwrap().insert(descriptor, value.to_vec());
    }

    pub fn descriptor_value(&self, descriptor: DescriptorHandle) -> Option<Vec<u8>> {
        self.inner.descriptor_values.lock().unwrap().get(&descriptor).cloned()
    }

    /// With no scanner, starting a scan fails with [`Error::RadioUnavailable`]
    pub fn set_scanner_available(&self, available: bool) {
        self.inner.scanner_available.store(available, Ordering::SeqCst);
    }

    /// With no links, connect calls return no link
    pub fn set_links_available(&self, available: bool) {
        self.inner.links_available.store(available, Ordering::SeqCst);
    }

    /// Rejects the next `count` connection priority requests
    pub fn fail_priority_requests(&self, count: u32) {
        self.inner.priority_failures.store(count, Ordering::SeqCst);
    }

    pub fn calls(&self) -> Vec<Call> {
        self.inner.calls.lock().unwrap().clone()
    }

    pub fn count<P>(&self, predicate: P) -> usize
        where P: Fn(&Call) -> bool
    {
        self.inner.calls.lock().unwrap().iter().filter(|call| predicate(call)).count()
    }

    pub fn clear_calls(&self) {
        self.inner.calls.lock().unwrap().clear();
    }

    /// Queues a callback for the attached session
    pub fn emit(&self, event: RadioEvent) {
        match self.inner.events.lock().unwrap().as_ref() {
            Some(events) => {
                if events.send(event).is_err() {
                    debug!("FakeRadio: session has gone away, dropping callback");
                }
            }
            None => warn!("FakeRadio isn't attached to a session, dropping {:?}", event),
        }
    }

    /// Pushes a notified value, as if the remote had sent one
    pub fn notify(&self, link_id: LinkId, characteristic: CharacteristicHandle, value: &[u8]) {
        self.emit(RadioEvent::CharacteristicChanged { link_id, characteristic, value: value.to_vec() });
    }

    /// Drops the link, as if the remote went out of range
    pub fn drop_link(&self, link_id: LinkId, status: GattStatus) {
        self.emit(RadioEvent::ConnectionStateChange {
            link_id,
            status,
            state: ConnectionState::Disconnected,
        });
    }

    fn handle(&self, call: Call) {
        trace!("FakeRadio: {:?}", call);
        self.inner.calls.lock().unwrap().push(call.clone());

        let events = {
            let mut responder = self.inner.responder.lock().unwrap();
            match responder.as_mut() {
                Some(respond) => respond(self, &call),
                None => self.default_response(&call),
            }
        };
        for event in events {
            self.emit(event);
        }
    }

    /// The callbacks a well-behaved remote would produce for `call`
    pub fn default_response(&self, call: &Call) -> Vec<RadioEvent> {
        let ok = GattStatus::SUCCESS;
        match call {
            Call::StartScan { service_uuids, .. } => {
                let mut filter = Filter::new();
                for uuid in service_uuids {
                    filter.add_service(*uuid);
                }
                self.inner.advertisers.lock().unwrap()
                    .iter()
                    .filter(|device| filter.matches(device))
                    .map(|device| RadioEvent::ScanResult { device: device.clone() })
                    .collect()
            }
            Call::Connect { link_id, .. } => vec![RadioEvent::ConnectionStateChange {
                link_id: *link_id,
                status: ok,
                state: ConnectionState::Connected,
            }],
            Call::Disconnect(link_id) => vec![RadioEvent::ConnectionStateChange {
                link_id: *link_id,
                status: ok,
                state: ConnectionState::Disconnected,
            }],
            Call::DiscoverServices(link_id) => {
                vec![RadioEvent::ServicesDiscovered { link_id: *link_id, status: ok }]
            }
            Call::ReadCharacteristic(link_id, characteristic) => {
                let value = self.characteristic_value(*characteristic).unwrap_or_default();
                vec![RadioEvent::CharacteristicRead {
                    link_id: *link_id,
                    characteristic: *characteristic,
                    value,
                    status: ok,
                }]
            }
            Call::WriteCharacteristic(link_id, characteristic, value, _) => {
                self.set_characteristic_value(*characteristic, value);
                vec![RadioEvent::CharacteristicWrite {
                    link_id: *link_id,
                    characteristic: *characteristic,
                    status: ok,
                }]
            }
            Call::ReadDescriptor(link_id, descriptor) => {
                let value = self.descriptor_value(*descriptor).unwrap_or_default();
                vec![RadioEvent::DescriptorRead {
                    link_id: *link_id,
                    descriptor: *descriptor,
                    value,
                    status: ok,
                }]
            }
            Call::WriteDescriptor(link_id, descriptor, value) => {
                self.inner.descriptor_values.lock().unwrap().insert(*descriptor, value.clone());
                vec![RadioEvent::DescriptorWrite {
                    link_id: *link_id,
                    descriptor: *descriptor,
                    status: ok,
                }]
            }
            Call::ReadRemoteRssi(link_id) => {
                vec![RadioEvent::ReadRemoteRssi { link_id: *link_id, rssi: FAKE_RSSI, status: ok }]
            }
            Call::RequestMtu(link_id, mtu) => {
                vec![RadioEvent::MtuChanged { link_id: *link_id, mtu: *mtu, status: ok }]
            }
            Call::ExecuteReliableWrite(link_id) => {
                vec![RadioEvent::ReliableWriteCompleted { link_id: *link_id, status: ok }]
            }
            Call::StopScan(_) |
            Call::Close(_) |
            Call::Refresh(_) |
            Call::SetNotification(..) |
            Call::RequestConnectionPriority(..) |
            Call::BeginReliableWrite(_) |
            Call::AbortReliableWrite(_) => vec![],
        }
    }
}

impl Radio for FakeRadio {
    fn start_scan(&self, filter: &Filter, mode: ScanMode) -> Result<()> {
        if !self.inner.scanner_available.load(Ordering::SeqCst) {
            return Err(Error::RadioUnavailable);
        }
        let mut service_uuids: Vec<Uuid> = filter.service_uuids().cloned().collect();
        service_uuids.sort();
        self.handle(Call::StartScan { mode, service_uuids });
        Ok(())
    }

    fn stop_scan(&self, mode: ScanMode) -> Result<()> {
        self.handle(Call::StopScan(mode));
        Ok(())
    }

    fn connect(&self, link_id: LinkId, _device: &Device, auto_connect: bool)
               -> Result<Option<Arc<dyn RadioLink>>> {
        if !self.inner.links_available.load(Ordering::SeqCst) {
            self.inner.calls.lock().unwrap().push(Call::Connect { link_id, auto_connect });
            return Ok(None);
        }
        self.handle(Call::Connect { link_id, auto_connect });
        Ok(Some(Arc::new(FakeLink { link_id, radio: self.clone() })))
    }
}

struct FakeLink {
    link_id: LinkId,
    radio: FakeRadio,
}

impl RadioLink for FakeLink {
    fn disconnect(&self) -> Result<()> {
        self.radio.handle(Call::Disconnect(self.link_id));
        Ok(())
    }

    fn close(&self) {
        self.radio.handle(Call::Close(self.link_id));
    }

    fn bond_state(&self) -> BondState {
        *self.radio.inner.bond_state.lock().unwrap()
    }

    fn discover_services(&self) -> Result<()> {
        self.radio.handle(Call::DiscoverServices(self.link_id));
        Ok(())
    }

    fn services(&self) -> Vec<Service> {
        self.radio.inner.services.lock().unwrap().clone()
    }

    fn refresh(&self) -> Result<()> {
        self.radio.handle(Call::Refresh(self.link_id));
        Ok(())
    }

    fn read_characteristic(&self, characteristic: &Characteristic) -> Result<()> {
        self.radio.handle(Call::ReadCharacteristic(self.link_id, characteristic.handle));
        Ok(())
    }

    fn write_characteristic(&self, characteristic: &Characteristic, value: &[u8],
                            write_type: WriteType) -> Result<()> {
        self.radio.handle(Call::WriteCharacteristic(self.link_id, characteristic.handle,
                                                    value.to_vec(), write_type));
        Ok(())
    }

    fn read_descriptor(&self, descriptor: &Descriptor) -> Result<()> {
        self.radio.handle(Call::ReadDescriptor(self.link_id, descriptor.handle));
        Ok(())
    }

    fn write_descriptor(&self, descriptor: &Descriptor, value: &[u8]) -> Result<()> {
        self.radio.handle(Call::WriteDescriptor(self.link_id, descriptor.handle, value.to_vec()));
        Ok(())
    }

    fn set_characteristic_notification(&self, characteristic: &Characteristic, enabled: bool)
                                       -> Result<()> {
        self.radio.handle(Call::SetNotification(self.link_id, characteristic.handle, enabled));
        Ok(())
    }

    fn read_remote_rssi(&self) -> Result<()> {
        self.radio.handle(Call::ReadRemoteRssi(self.link_id));
        Ok(())
    }

    fn request_mtu(&self, mtu: u16) -> Result<()> {
        self.radio.handle(Call::RequestMtu(self.link_id, mtu));
        Ok(())
    }

    fn request_connection_priority(&self, priority: ConnectionPriority) -> Result<()> {
        self.radio.handle(Call::RequestConnectionPriority(self.link_id, priority));
        let failures = &self.radio.inner.priority_failures;
        if failures.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1)).is_ok() {
            return Err(Error::Other(anyhow!("Connection priority {:?} rejected", priority)));
        }
        Ok(())
    }

    fn begin_reliable_write(&self) -> Result<()> {
        self.radio.handle(Call::BeginReliableWrite(self.link_id));
        Ok(())
    }

    fn execute_reliable_write(&self) -> Result<()> {
        self.radio.handle(Call::ExecuteReliableWrite(self.link_id));
        Ok(())
    }

    fn abort_reliable_write(&self) -> Result<()> {
        self.radio.handle(Call::AbortReliableWrite(self.link_id));
        Ok(())
    }
}

/// A device advertising a heart rate service
pub fn sample_device() -> Device {
    Device::new(Address::MAC(MAC(0xF1E2D3C4B5A6)))
        .with_name("Fake HRM")
        .with_service(HEART_RATE_SERVICE_UUID)
}

/// The service table of [`sample_device`]: heart rate, battery and generic
/// attribute services.
///
/// Characteristic handles: measurement 2 (notify), sensor location 4 (read),
/// control point 5 (write), battery level 11 (read, notify), service changed
/// 21 (indicate). Each notifying characteristic's configuration descriptor
/// has the next handle up.
pub fn sample_services() -> Vec<Service> {
    let heart_rate = ServiceHandle(1);
    let battery = ServiceHandle(10);
    let generic_attribute = ServiceHandle(20);

    let with_cccd = |characteristic: Characteristic, handle: u32| {
        let descriptor = Descriptor::new(characteristic.handle, DescriptorHandle(handle),
                                         CLIENT_CHARACTERISTIC_CONFIGURATION_UUID);
        characteristic.with_descriptor(descriptor)
    };

    vec![
        Service::new(heart_rate, HEART_RATE_SERVICE_UUID)
            .with_characteristic(with_cccd(Characteristic::new(heart_rate,
                                                               CharacteristicHandle(2),
                                                               HEART_RATE_MEASUREMENT_UUID,
                                                               CharacteristicProperties::NOTIFY),
                                           3))
            .with_characteristic(Characteristic::new(heart_rate,
                                                     CharacteristicHandle(4),
                                                     BODY_SENSOR_LOCATION_UUID,
                                                     CharacteristicProperties::READ))
            .with_characteristic(Characteristic::new(heart_rate,
                                                     CharacteristicHandle(5),
                                                     HEART_RATE_CONTROL_POINT_UUID,
                                                     CharacteristicProperties::WRITE)),
        Service::new(battery, BATTERY_SERVICE_UUID)
            .with_characteristic(with_cccd(Characteristic::new(battery,
                                                               CharacteristicHandle(11),
                                                               BATTERY_LEVEL_UUID,
                                                               CharacteristicProperties::READ
                                                               | CharacteristicProperties::NOTIFY),
                                           12)),
        Service::new(generic_attribute, GENERIC_ATTRIBUTE_SERVICE_UUID)
            .with_characteristic(with_cccd(Characteristic::new(generic_attribute,
                                                               CharacteristicHandle(21),
                                                               SERVICE_CHANGED_CHARACTERISTIC_UUID,
                                                               CharacteristicProperties::INDICATE),
                                           22)),
    ]
}
