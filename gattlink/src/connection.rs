use std::collections::HashMap;
use std::fmt;
use std::hash::Hash;
use std::sync::atomic::{AtomicU16, AtomicU32, Ordering};
use std::sync::Mutex as StdMutex;
use std::sync::{Arc, Weak};

use dashmap::DashMap;
use log::{debug, info, trace, warn};
use uuid::Uuid;

use crate::characteristic::{Characteristic, CharacteristicProperties, WriteType};
use crate::descriptor::Descriptor;
use crate::executor::{Executor, Operation};
use crate::observer::{ChangeObserver, ObserverSlot, ValueListener};
use crate::operation::{OpKey, OpValue};
use crate::radio::{BondState, ConnectionPriority, RadioLink};
use crate::service::Service;
use crate::session::SessionConfig;
use crate::uuid::{
    CLIENT_CHARACTERISTIC_CONFIGURATION_UUID, DISABLE_INDICATION_VALUE, DISABLE_NOTIFICATION_VALUE,
    ENABLE_INDICATION_VALUE, ENABLE_NOTIFICATION_VALUE, SERVICE_CHANGE_INDICATORS,
};
use crate::{CharacteristicHandle, Device, Error, GattError, LinkId, Result};

/// The MTU every link starts with, before any negotiation
pub const DEFAULT_MTU: u16 = 23;

/// Bytes of every ATT packet taken by the protocol header
pub const ATT_HEADER_SIZE: u16 = 3;

/// Live links, keyed by the id minted when connecting
pub(crate) type LinkTable = DashMap<LinkId, Connection>;

/// Where a link is in its lifecycle.
///
/// `Closed` is terminal and reachable from every other state.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LinkState {
    AwaitingConnect,
    AwaitingMtu,
    Connected,
    Closed,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ConnectOptions {
    pub auto_connect: bool,

    /// An MTU to negotiate before the connection counts as established
    pub mtu: Option<u16>,

    /// Requested after connecting, on a best effort basis
    pub priority: Option<ConnectionPriority>,
}

impl ConnectOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn auto_connect(mut self, auto_connect: bool) -> Self {
        self.auto_connect = auto_connect;
        self
    }

    pub fn mtu(mut self, mtu: u16) -> Self {
        self.mtu = Some(mtu);
        self
    }

    pub fn priority(mut self, priority: ConnectionPriority) -> Self {
        self.priority = Some(priority);
        self
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct CloseListenerId(u32);

type CloseListener = Box<dyn FnOnce() + Send>;

/// One established link to a remote device.
///
/// Every GATT request goes through the session's executor; the radio only
/// supports one outstanding request per link so requests on the same
/// connection are serialized.
///
/// A `Connection` is cheap to clone; clones refer to the same link.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<ConnectionInner>,
}
impl PartialEq for Connection {
    fn eq(&self, other: &Connection) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}
impl Eq for Connection {}
impl Hash for Connection {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        std::ptr::hash(Arc::as_ptr(&self.inner), state);
    }
}

struct ConnectionInner {
    link_id: LinkId,
    device: Device,
    options: ConnectOptions,
    config: Arc<SessionConfig>,
    executor: Arc<Executor<OpKey, OpValue>>,

    // NB: a weak reference since the table itself holds this connection
    table: Weak<LinkTable>,

    // Filled in once the low-level connect call returns, and taken (exactly
    // once) when the link is released
    link: StdMutex<Option<Arc<dyn RadioLink>>>,

    state: StdMutex<LinkState>,
    mtu: AtomicU16,
    priority: StdMutex<Option<ConnectionPriority>>,

    services: StdMutex<Option<Vec<Service>>>,
    observers: StdMutex<HashMap<CharacteristicHandle, ObserverSlot>>,

    close_listeners: StdMutex<Vec<(CloseListenerId, CloseListener)>>,
    next_listener_id: AtomicU32,

    // Serializes GATT requests, since the radio can only handle one at a time.
    // This is a tokio mutex because it's held while awaiting completions.
    io: tokio::sync::Mutex<()>,
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = match self.inner.state.try_lock() {
            Ok(state) => format!("{:?}", *state),
            Err(_) => "<locked>".to_string(),
        };
        f.debug_struct("Connection")
            .field("link_id", &self.inner.link_id)
            .field("address", &self.inner.device.address)
            .field("state", &state)
            .finish()
    }
}

impl Connection {
    pub(crate) fn new(link_id: LinkId,
                      device: Device,
                      options: ConnectOptions,
                      config: Arc<SessionConfig>,
                      executor: Arc<Executor<OpKey, OpValue>>,
                      table: &Arc<LinkTable>)
                      -> Self {
        Connection {
            inner: Arc::new(ConnectionInner {
                link_id,
                device,
                options,
                config,
                executor,
                table: Arc::downgrade(table),
                link: StdMutex::new(None),
                state: StdMutex::new(LinkState::AwaitingConnect),
                mtu: AtomicU16::new(DEFAULT_MTU),
                priority: StdMutex::new(None),
                services: StdMutex::new(None),
                observers: StdMutex::new(HashMap::new()),
                close_listeners: StdMutex::new(vec![]),
                next_listener_id: AtomicU32::new(0),
                io: tokio::sync::Mutex::new(()),
            }),
        }
    }

    /// Runs the low-level connect call and keeps the link it produces.
    ///
    /// The link slot stays locked for the duration of the call so callbacks
    /// that race back before it returns will find the link once they get to it.
    pub(crate) fn attach_link<F>(&self, connect: F) -> Result<()>
        where F: FnOnce() -> Result<Option<Arc<dyn RadioLink>>>
    {
        let mut slot = self.inner.link.lock().unwrap();
        match connect()? {
            Some(link) => {
                *slot = Some(link);
                Ok(())
            }
            None => {
                debug!("{}: radio gave us no link", self.inner.link_id);
                Err(Error::PeripheralUnreachable)
            }
        }
    }

    pub(crate) fn link(&self) -> Result<Arc<dyn RadioLink>> {
        self.inner.link.lock().unwrap().clone().ok_or(Error::NotConnected)
    }

    pub fn link_id(&self) -> LinkId {
        self.inner.link_id
    }

    pub fn device(&self) -> &Device {
        &self.inner.device
    }

    pub fn options(&self) -> ConnectOptions {
        self.inner.options
    }

    pub fn state(&self) -> LinkState {
        *self.inner.state.lock().unwrap()
    }

    pub(crate) fn set_state(&self, new_state: LinkState) -> bool {
        let mut state = self.inner.state.lock().unwrap();
        if *state == LinkState::Closed {
            return false;
        }
        trace!("{}: {:?} -> {:?}", self.inner.link_id, *state, new_state);
        *state = new_state;
        true
    }

    pub fn is_connected(&self) -> bool {
        self.state() == LinkState::Connected
    }

    pub fn is_closed(&self) -> bool {
        self.state() == LinkState::Closed
    }

    fn check_connected(&self) -> Result<()> {
        if self.is_connected() {
            Ok(())
        } else {
            Err(Error::NotConnected)
        }
    }

    pub fn mtu(&self) -> u16 {
        self.inner.mtu.load(Ordering::Acquire)
    }

    pub(crate) fn set_mtu(&self, mtu: u16) {
        self.inner.mtu.store(mtu, Ordering::Release);
    }

    /// The largest payload that fits in one packet at the negotiated MTU
    pub fn max_data_packet_size(&self) -> u16 {
        self.mtu().saturating_sub(ATT_HEADER_SIZE)
    }

    /// The connection priority the radio accepted, if one was requested
    pub fn priority(&self) -> Option<ConnectionPriority> {
        *self.inner.priority.lock().unwrap()
    }

    pub(crate) fn set_priority(&self, priority: ConnectionPriority) {
        *self.inner.priority.lock().unwrap() = Some(priority);
    }

    pub(crate) fn on_connected(&self) -> bool {
        let connected = self.set_state(LinkState::Connected);
        if connected {
            info!("{}: connected to {} (mtu = {})",
                  self.inner.link_id, self.inner.device.address, self.mtu());
        } else {
            warn!("{}: ignoring connect notification for a closed link", self.inner.link_id);
        }
        connected
    }

    /// The unsolicited disconnect path; the link is already down
    pub(crate) fn on_closed(&self) -> bool {
        self.shutdown(false)
    }

    /// Tears down a link that never finished connecting (or failed to)
    pub(crate) fn abandon(&self) -> bool {
        self.shutdown(true)
    }

    // Whichever of close(), on_closed() or abandon() gets here first does the
    // work, the others are no-ops.
    fn shutdown(&self, disconnect: bool) -> bool {
        {
            let mut state = self.inner.state.lock().unwrap();
            if *state == LinkState::Closed {
                return false;
            }
            *state = LinkState::Closed;
        }
        debug!("{}: closing", self.inner.link_id);

        // The table entry must go before the link is released
        if let Some(table) = self.inner.table.upgrade() {
            table.remove(&self.inner.link_id);
        }

        let link = self.inner.link.lock().unwrap().take();
        if let Some(link) = link {
            if disconnect {
                if let Err(err) = link.disconnect() {
                    debug!("{}: disconnect during teardown failed: {}", self.inner.link_id, err);
                }
            }
            link.close();
        }

        *self.inner.services.lock().unwrap() = None;
        self.inner.observers.lock().unwrap().clear();

        let link_id = self.inner.link_id;
        let released = self.inner.executor
            .notify_failure_where(|key| key.link_id() == Some(link_id), GattError::Disconnected);
        if released > 0 {
            debug!("{}: failed {} pending operation(s)", link_id, released);
        }
        self.inner.executor.forget_where(|key| key.link_id() == Some(link_id));

        let listeners = std::mem::take(&mut *self.inner.close_listeners.lock().unwrap());
        for (_, listener) in listeners {
            listener();
        }
        true
    }

    /// Registers a listener to be called once, when the connection closes.
    ///
    /// If the connection is already closed the listener is called immediately.
    pub fn add_close_listener<F>(&self, listener: F) -> CloseListenerId
        where F: FnOnce() + Send + 'static
    {
        let id = CloseListenerId(self.inner.next_listener_id.fetch_add(1, Ordering::Relaxed));
        {
            // The state lock is held so we can't race with shutdown() draining the list
            let state = self.inner.state.lock().unwrap();
            if *state != LinkState::Closed {
                self.inner.close_listeners.lock().unwrap().push((id, Box::new(listener)));
                return id;
            }
        }
        listener();
        id
    }

    pub fn remove_close_listener(&self, id: CloseListenerId) -> bool {
        let mut listeners = self.inner.close_listeners.lock().unwrap();
        let before = listeners.len();
        listeners.retain(|(listener_id, _)| *listener_id != id);
        listeners.len() != before
    }

    /// Disconnects and releases the link.
    ///
    /// The link is released even if the radio doesn't confirm the disconnect in
    /// time, in which case the timeout is still reported.
    pub async fn close(&self) -> Result<()> {
        if self.is_closed() {
            return Ok(());
        }
        let link = match self.link() {
            Ok(link) => link,
            Err(_) => {
                self.shutdown(false);
                return Ok(());
            }
        };

        let op = Operation::new(OpKey::Disconnect(self.inner.link_id), move || link.disconnect());
        let result = self.inner.executor
            .execute(op, Some(self.inner.config.operation_timeout))
            .await;
        self.shutdown(false);

        match result {
            Ok(_) | Err(Error::Gatt(GattError::Disconnected)) => Ok(()),
            Err(err) => Err(err),
        }
    }

    /// The services found by the last discovery, if any
    pub fn services(&self) -> Option<Vec<Service>> {
        self.inner.services.lock().unwrap().clone()
    }

    async fn ensure_services(&self) -> Result<Vec<Service>> {
        self.check_connected()?;

        let cached = self.inner.executor
            .execute_sync(OpKey::ServicesCached(self.inner.link_id),
                          || Ok(self.services().map(OpValue::Services)))?;
        if let Some(services) = cached {
            return services.into_services();
        }

        let _io = self.inner.io.lock().await;
        // Somebody else may have finished discovering while we waited
        if let Some(services) = self.services() {
            return Ok(services);
        }
        self.discover_locked(false).await
    }

    /// Re-runs service discovery, bypassing the cache.
    ///
    /// If the remote exposes a service-changed indicator (and is bonded) the
    /// radio stack's own cache is refreshed first, since it can go stale when
    /// the remote's service table changes.
    pub async fn discover_services(&self) -> Result<Vec<Service>> {
        self.check_connected()?;
        let _io = self.inner.io.lock().await;
        self.discover_locked(true).await
    }

    async fn discover_locked(&self, invalidate: bool) -> Result<Vec<Service>> {
        let link = self.link()?;
        if invalidate && self.needs_refresh(link.as_ref()) {
            debug!("{}: refreshing the radio's service cache before discovery", self.inner.link_id);
            link.refresh()?;
        }

        let mut retries = self.inner.config.discovery_retries;
        loop {
            match self.run_discovery(&link).await {
                Err(Error::Gatt(err)) if err.is_internal_error() && retries > 0 => {
                    retries -= 1;
                    warn!("{}: service discovery hit an internal error, refreshing and retrying",
                          self.inner.link_id);
                    link.refresh()?;
                }
                result => return result,
            }
        }
    }

    async fn run_discovery(&self, link: &Arc<dyn RadioLink>) -> Result<Vec<Service>> {
        let radio_link = link.clone();
        let op = Operation::new(OpKey::DiscoverServices(self.inner.link_id),
                                move || radio_link.discover_services());
        self.inner.executor
            .execute(op, Some(self.inner.config.slow_operation_timeout))
            .await?;

        let services = link.services();
        debug!("{}: discovered {} service(s)", self.inner.link_id, services.len());
        *self.inner.services.lock().unwrap() = Some(services.clone());
        Ok(services)
    }

    fn needs_refresh(&self, link: &dyn RadioLink) -> bool {
        let services = self.services().unwrap_or_else(|| link.services());
        let has_indicator = SERVICE_CHANGE_INDICATORS.iter().any(|(service_uuid, characteristic_uuid)| {
            services.iter()
                    .filter(|service| &service.uuid == service_uuid)
                    .any(|service| service.has_characteristic(characteristic_uuid))
        });
        if !has_indicator {
            return false;
        }
        // Service changes from a device we aren't bonded with can't be trusted
        if link.bond_state() != BondState::Bonded {
            debug!("{}: not bonded, skipping service cache refresh", self.inner.link_id);
            return false;
        }
        true
    }

    pub async fn get_service(&self, uuid: Uuid) -> Result<Service> {
        let services = self.ensure_services().await?;
        let service = unique("service", uuid, services.iter().filter(|s| s.uuid == uuid))?;
        Ok(service.clone())
    }

    /// Looks up a characteristic across every service with a matching UUID.
    ///
    /// The characteristic UUID must be unique across all of those services.
    pub async fn get_characteristic(&self, service_uuid: Uuid, characteristic_uuid: Uuid)
                                    -> Result<Characteristic> {
        let services = self.ensure_services().await?;
        find_characteristic(&services, service_uuid, characteristic_uuid).map(Clone::clone)
    }

    pub async fn get_descriptor(&self, service_uuid: Uuid, characteristic_uuid: Uuid,
                                descriptor_uuid: Uuid)
                                -> Result<Descriptor> {
        let services = self.ensure_services().await?;
        let characteristic = find_characteristic(&services, service_uuid, characteristic_uuid)?;
        let descriptor = unique("descriptor", descriptor_uuid,
                                characteristic.descriptors_by_uuid(&descriptor_uuid))?;
        Ok(descriptor.clone())
    }

    pub async fn read_characteristic(&self, characteristic: &Characteristic) -> Result<Vec<u8>> {
        self.check_connected()?;
        let _io = self.inner.io.lock().await;

        let link = self.link()?;
        let target = characteristic.clone();
        let op = Operation::new(OpKey::ReadCharacteristic(self.inner.link_id, characteristic.handle),
                                move || link.read_characteristic(&target));
        self.inner.executor
            .execute_nonnull(op, Some(self.inner.config.operation_timeout))
            .await?
            .into_bytes()
    }

    pub async fn write_characteristic(&self, characteristic: &Characteristic, value: &[u8],
                                      write_type: WriteType)
                                      -> Result<()> {
        self.check_connected()?;
        let _io = self.inner.io.lock().await;

        let link = self.link()?;
        let target = characteristic.clone();
        let value = value.to_vec();
        let op = Operation::new(OpKey::WriteCharacteristic(self.inner.link_id, characteristic.handle),
                                move || link.write_characteristic(&target, &value, write_type));
        self.inner.executor
            .execute(op, Some(self.inner.config.operation_timeout))
            .await?;
        Ok(())
    }

    pub async fn read_descriptor(&self, descriptor: &Descriptor) -> Result<Vec<u8>> {
        self.check_connected()?;
        let _io = self.inner.io.lock().await;

        let link = self.link()?;
        let target = descriptor.clone();
        let op = Operation::new(OpKey::ReadDescriptor(self.inner.link_id, descriptor.handle),
                                move || link.read_descriptor(&target));
        self.inner.executor
            .execute_nonnull(op, Some(self.inner.config.operation_timeout))
            .await?
            .into_bytes()
    }

    pub async fn write_descriptor(&self, descriptor: &Descriptor, value: &[u8]) -> Result<()> {
        self.check_connected()?;
        let _io = self.inner.io.lock().await;
        self.write_descriptor_locked(self.link()?, descriptor, value).await
    }

    async fn write_descriptor_locked(&self, link: Arc<dyn RadioLink>, descriptor: &Descriptor,
                                     value: &[u8])
                                     -> Result<()> {
        let target = descriptor.clone();
        let value = value.to_vec();
        let op = Operation::new(OpKey::WriteDescriptor(self.inner.link_id, descriptor.handle),
                                move || link.write_descriptor(&target, &value));
        self.inner.executor
            .execute(op, Some(self.inner.config.operation_timeout))
            .await?;
        Ok(())
    }

    pub async fn read_remote_rssi(&self) -> Result<i32> {
        self.check_connected()?;
        let _io = self.inner.io.lock().await;

        let link = self.link()?;
        let op = Operation::new(OpKey::ReadRssi(self.inner.link_id), move || link.read_remote_rssi());
        self.inner.executor
            .execute_nonnull(op, Some(self.inner.config.operation_timeout))
            .await?
            .into_rssi()
    }

    /// Negotiates a new MTU on an established link, returning the MTU the
    /// remote settled on
    pub async fn request_mtu(&self, mtu: u16) -> Result<u16> {
        self.check_connected()?;
        let _io = self.inner.io.lock().await;

        let link = self.link()?;
        let op = Operation::new(OpKey::RequestMtu(self.inner.link_id), move || link.request_mtu(mtu));
        let negotiated = self.inner.executor
            .execute_nonnull(op, Some(self.inner.config.operation_timeout))
            .await?
            .into_mtu()?;
        self.set_mtu(negotiated);
        Ok(negotiated)
    }

    /// Toggles notification delivery in the radio stack and writes the
    /// matching value to the characteristic's configuration descriptor
    pub async fn set_notification_enabled(&self, characteristic: &Characteristic, enabled: bool)
                                          -> Result<()> {
        self.check_connected()?;
        let _io = self.inner.io.lock().await;
        self.set_notification_locked(characteristic, enabled).await
    }

    async fn set_notification_locked(&self, characteristic: &Characteristic, enabled: bool)
                                     -> Result<()> {
        if !characteristic.supports_notify() {
            return Err(Error::NotifyUnsupported(characteristic.uuid));
        }
        let descriptor = unique("descriptor", CLIENT_CHARACTERISTIC_CONFIGURATION_UUID,
                                characteristic.descriptors_by_uuid(&CLIENT_CHARACTERISTIC_CONFIGURATION_UUID))?
            .clone();

        let link = self.link()?;
        link.set_characteristic_notification(characteristic, enabled)?;
        let value = configuration_value(characteristic.properties, enabled);
        trace!("{}: writing {:?} to configuration of {:?}",
               self.inner.link_id, value, characteristic.handle);
        self.write_descriptor_locked(link, &descriptor, &value).await
    }

    /// Enables notifications and installs a fresh [`ChangeObserver`] for the
    /// characteristic, replacing any previous one.
    ///
    /// `listener`, if given, is called with every new value. If enabling fails
    /// the previous observer (if any) is left in place.
    pub async fn enable_notification(&self, characteristic: &Characteristic,
                                     listener: Option<ValueListener>)
                                     -> Result<ChangeObserver> {
        self.check_connected()?;
        let _io = self.inner.io.lock().await;

        // Install the observer first so a value arriving right after the
        // descriptor write isn't dropped
        let (slot, observer) = ObserverSlot::enabled(characteristic.handle, listener);
        let previous = self.inner.observers.lock().unwrap().insert(characteristic.handle, slot);

        if let Err(err) = self.set_notification_locked(characteristic, true).await {
            let mut observers = self.inner.observers.lock().unwrap();
            match previous {
                Some(previous) => observers.insert(characteristic.handle, previous),
                None => observers.remove(&characteristic.handle),
            };
            return Err(err);
        }
        Ok(observer)
    }

    /// Detaches the characteristic's observer and disables notifications
    pub async fn disable_notification(&self, characteristic: &Characteristic) -> Result<()> {
        self.check_connected()?;
        let _io = self.inner.io.lock().await;

        self.inner.observers.lock().unwrap().insert(characteristic.handle, ObserverSlot::Disabled);
        self.set_notification_locked(characteristic, false).await
    }

    /// Whether a [`ChangeObserver`] is currently installed for the characteristic
    pub fn is_observing(&self, characteristic: CharacteristicHandle) -> bool {
        self.inner.observers
            .lock()
            .unwrap()
            .get(&characteristic)
            .map_or(false, ObserverSlot::is_enabled)
    }

    /// Delivers a notified value to the characteristic's observer.
    ///
    /// Returns false (and drops the value) if nobody is observing it.
    pub(crate) fn on_characteristic_changed(&self, characteristic: CharacteristicHandle,
                                            value: &[u8])
                                            -> bool {
        let (accepted, listener) = {
            let observers = self.inner.observers.lock().unwrap();
            match observers.get(&characteristic) {
                Some(slot) => slot.deliver(value),
                None => (false, None),
            }
        };
        if !accepted {
            trace!("{}: dropping notification for unobserved {:?}", self.inner.link_id, characteristic);
            return false;
        }
        if let Some(listener) = listener {
            listener(value);
        }
        true
    }

    pub fn begin_reliable_write(&self) -> Result<()> {
        self.check_connected()?;
        self.link()?.begin_reliable_write()
    }

    /// Commits the writes queued since [`Self::begin_reliable_write`]
    pub async fn execute_reliable_write(&self) -> Result<()> {
        self.check_connected()?;
        let _io = self.inner.io.lock().await;

        let link = self.link()?;
        let op = Operation::new(OpKey::ExecuteReliableWrite(self.inner.link_id),
                                move || link.execute_reliable_write());
        self.inner.executor
            .execute(op, Some(self.inner.config.operation_timeout))
            .await?;
        Ok(())
    }

    pub fn abort_reliable_write(&self) -> Result<()> {
        self.check_connected()?;
        self.link()?.abort_reliable_write()
    }
}

fn configuration_value(properties: CharacteristicProperties, enabled: bool) -> [u8; 2] {
    let indicate = properties.contains(CharacteristicProperties::INDICATE)
        && !properties.contains(CharacteristicProperties::NOTIFY);
    match (enabled, indicate) {
        (true, true) => ENABLE_INDICATION_VALUE,
        (true, false) => ENABLE_NOTIFICATION_VALUE,
        (false, true) => DISABLE_INDICATION_VALUE,
        (false, false) => DISABLE_NOTIFICATION_VALUE,
    }
}

fn unique<'a, T, I>(kind: &'static str, uuid: Uuid, matches: I) -> Result<&'a T>
    where I: Iterator<Item = &'a T>
{
    let matches: Vec<&T> = matches.collect();
    if matches.len() == 1 {
        Ok(matches[0])
    } else {
        Err(Error::Lookup { kind, uuid, found: matches.len() })
    }
}

fn find_characteristic(services: &[Service], service_uuid: Uuid, characteristic_uuid: Uuid)
                       -> Result<&Characteristic> {
    let matching: Vec<&Service> = services.iter().filter(|s| s.uuid == service_uuid).collect();
    if matching.is_empty() {
        return Err(Error::Lookup { kind: "service", uuid: service_uuid, found: 0 });
    }
    unique("characteristic", characteristic_uuid,
           matching.into_iter()
                   .flat_map(|s| s.characteristics.iter().filter(move |c| c.uuid == characteristic_uuid)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    use crate::fake::{self, Call, FakeRadio, BATTERY_LEVEL_UUID, BATTERY_SERVICE_UUID,
                      BODY_SENSOR_LOCATION_UUID, HEART_RATE_CONTROL_POINT_UUID,
                      HEART_RATE_MEASUREMENT_UUID, HEART_RATE_SERVICE_UUID};
    use crate::radio::RadioEvent;
    use crate::session::Session;
    use crate::uuid::uuid_from_u16;
    use crate::{DescriptorHandle, GattStatus, ServiceHandle};

    async fn connected() -> (FakeRadio, Session, Connection) {
        let _ = env_logger::builder().is_test(true).try_init();

        let radio = FakeRadio::new();
        radio.set_services(fake::sample_services());

        let mut config = SessionConfig::new();
        config.set_operation_timeout(Duration::from_millis(200))
              .set_slow_operation_timeout(Duration::from_millis(200))
              .set_connect_timeout(Duration::from_millis(200));
        let session = radio.start_session(config).await.unwrap();
        let connection = session.connect(&fake::sample_device(), ConnectOptions::new())
                                .await
                                .unwrap();
        (radio, session, connection)
    }

    // Gives the session's event task a chance to route anything queued
    async fn settle() {
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    fn discoveries(radio: &FakeRadio) -> usize {
        radio.count(|call| matches!(call, Call::DiscoverServices(_)))
    }

    #[tokio::test]
    async fn lookups_discover_once() {
        let (radio, session, connection) = connected().await;
        assert_eq!(connection.services(), None);

        let service = connection.get_service(HEART_RATE_SERVICE_UUID).await.unwrap();
        assert_eq!(service.handle, ServiceHandle(1));
        let measurement = connection.get_characteristic(HEART_RATE_SERVICE_UUID,
                                                        HEART_RATE_MEASUREMENT_UUID)
                                    .await
                                    .unwrap();
        assert_eq!(measurement.handle, CharacteristicHandle(2));
        let cccd = connection.get_descriptor(HEART_RATE_SERVICE_UUID, HEART_RATE_MEASUREMENT_UUID,
                                             CLIENT_CHARACTERISTIC_CONFIGURATION_UUID)
                             .await
                             .unwrap();
        assert_eq!(cccd.handle, DescriptorHandle(3));

        assert_eq!(discoveries(&radio), 1);
        let link_id = connection.link_id();
        assert_eq!(session.executor().submission_count(&OpKey::DiscoverServices(link_id)), 1);
        assert_eq!(session.executor().submission_count(&OpKey::ServicesCached(link_id)), 3);
        assert_eq!(connection.services().map(|s| s.len()), Some(3));
    }

    #[tokio::test]
    async fn lookups_need_exactly_one_match() {
        let (radio, session, connection) = connected().await;

        let shared = uuid_from_u16(0xFFF0);
        let value = uuid_from_u16(0xFFF1);
        let only_in_second = uuid_from_u16(0xFFF2);
        let first = ServiceHandle(40);
        let second = ServiceHandle(50);
        radio.set_services(vec![
            Service::new(first, shared)
                .with_characteristic(Characteristic::new(first, CharacteristicHandle(41), value,
                                                         CharacteristicProperties::READ)),
            Service::new(second, shared)
                .with_characteristic(Characteristic::new(second, CharacteristicHandle(51), value,
                                                         CharacteristicProperties::READ))
                .with_characteristic(Characteristic::new(second, CharacteristicHandle(52),
                                                         only_in_second,
                                                         CharacteristicProperties::READ)),
        ]);

        let err = connection.get_service(shared).await.unwrap_err();
        assert!(matches!(err, Error::Lookup { kind: "service", found: 2, .. }));

        let err = connection.get_characteristic(shared, value).await.unwrap_err();
        assert!(matches!(err, Error::Lookup { kind: "characteristic", found: 2, .. }));

        let err = connection.get_service(BATTERY_SERVICE_UUID).await.unwrap_err();
        assert!(matches!(err, Error::Lookup { kind: "service", found: 0, .. }));

        // A characteristic is searched for across every service sharing the UUID
        let characteristic = connection.get_characteristic(shared, only_in_second).await.unwrap();
        assert_eq!(characteristic.handle, CharacteristicHandle(52));

        // Failed lookups don't trigger any further discovery
        assert_eq!(discoveries(&radio), 1);
        assert_eq!(session.executor().submission_count(&OpKey::DiscoverServices(connection.link_id())), 1);
    }

    #[tokio::test]
    async fn read_and_write() {
        let (radio, _session, connection) = connected().await;
        radio.set_characteristic_value(CharacteristicHandle(4), &[0x01]);

        let location = connection.get_characteristic(HEART_RATE_SERVICE_UUID, BODY_SENSOR_LOCATION_UUID)
                                 .await
                                 .unwrap();
        assert_eq!(connection.read_characteristic(&location).await.unwrap(), vec![0x01]);

        let control = connection.get_characteristic(HEART_RATE_SERVICE_UUID, HEART_RATE_CONTROL_POINT_UUID)
                                .await
                                .unwrap();
        connection.write_characteristic(&control, &[0x01], WriteType::WithResponse).await.unwrap();
        assert_eq!(radio.characteristic_value(CharacteristicHandle(5)), Some(vec![0x01]));
        assert_eq!(radio.count(|call| {
                       *call == Call::WriteCharacteristic(connection.link_id(), CharacteristicHandle(5),
                                                          vec![0x01], WriteType::WithResponse)
                   }),
                   1);

        assert_eq!(connection.read_remote_rssi().await.unwrap(), fake::FAKE_RSSI);
    }

    #[tokio::test]
    async fn failure_status_and_timeout() {
        let (radio, session, connection) = connected().await;
        let location = connection.get_characteristic(HEART_RATE_SERVICE_UUID, BODY_SENSOR_LOCATION_UUID)
                                 .await
                                 .unwrap();

        radio.set_responder(|radio, call| match call {
            Call::ReadCharacteristic(link_id, characteristic) => vec![RadioEvent::CharacteristicRead {
                link_id: *link_id,
                characteristic: *characteristic,
                value: vec![],
                status: GattStatus::READ_NOT_PERMITTED,
            }],
            Call::ReadRemoteRssi(_) => vec![],
            _ => radio.default_response(call),
        });

        let err = connection.read_characteristic(&location).await.unwrap_err();
        assert_eq!(err.gatt_error(), Some(&GattError::ReadNotPermitted));

        let err = connection.read_remote_rssi().await.unwrap_err();
        assert!(err.is_timeout());
        assert!(!session.executor().is_pending(&OpKey::ReadRssi(connection.link_id())));

        // The link is still usable after a timeout
        assert!(connection.is_connected());
    }

    #[tokio::test]
    async fn configuration_descriptor_values() {
        let (radio, _session, connection) = connected().await;
        let link_id = connection.link_id();

        let measurement = connection.get_characteristic(HEART_RATE_SERVICE_UUID, HEART_RATE_MEASUREMENT_UUID)
                                    .await
                                    .unwrap();
        connection.set_notification_enabled(&measurement, true).await.unwrap();
        assert_eq!(radio.descriptor_value(DescriptorHandle(3)), Some(ENABLE_NOTIFICATION_VALUE.to_vec()));
        connection.set_notification_enabled(&measurement, false).await.unwrap();
        assert_eq!(radio.descriptor_value(DescriptorHandle(3)), Some(DISABLE_NOTIFICATION_VALUE.to_vec()));

        let changed = connection.get_characteristic(crate::uuid::GENERIC_ATTRIBUTE_SERVICE_UUID,
                                                    crate::uuid::SERVICE_CHANGED_CHARACTERISTIC_UUID)
                                .await
                                .unwrap();
        connection.set_notification_enabled(&changed, true).await.unwrap();
        assert_eq!(radio.descriptor_value(DescriptorHandle(22)), Some(ENABLE_INDICATION_VALUE.to_vec()));

        assert_eq!(radio.count(|call| *call == Call::SetNotification(link_id, CharacteristicHandle(2), true)), 1);
        assert_eq!(radio.count(|call| *call == Call::SetNotification(link_id, CharacteristicHandle(2), false)), 1);

        let control = connection.get_characteristic(HEART_RATE_SERVICE_UUID, HEART_RATE_CONTROL_POINT_UUID)
                                .await
                                .unwrap();
        let err = connection.set_notification_enabled(&control, true).await.unwrap_err();
        assert!(matches!(err, Error::NotifyUnsupported(uuid) if uuid == HEART_RATE_CONTROL_POINT_UUID));
    }

    #[tokio::test]
    async fn read_descriptor_routes_by_descriptor() {
        let (radio, _session, connection) = connected().await;
        let link_id = connection.link_id();
        radio.set_characteristic_value(CharacteristicHandle(11), &[87]);
        radio.set_descriptor_value(DescriptorHandle(12), &[0x01, 0x00]);

        let cccd = connection.get_descriptor(BATTERY_SERVICE_UUID, BATTERY_LEVEL_UUID,
                                             CLIENT_CHARACTERISTIC_CONFIGURATION_UUID)
                             .await
                             .unwrap();
        assert_eq!(connection.read_descriptor(&cccd).await.unwrap(), vec![0x01, 0x00]);
        assert_eq!(radio.count(|call| *call == Call::ReadDescriptor(link_id, DescriptorHandle(12))), 1);

        radio.set_responder(|_radio, call| match call {
            Call::ReadDescriptor(link_id, descriptor) => vec![RadioEvent::DescriptorRead {
                link_id: *link_id,
                descriptor: *descriptor,
                value: vec![],
                status: GattStatus::READ_NOT_PERMITTED,
            }],
            _ => vec![],
        });
        let err = connection.read_descriptor(&cccd).await.unwrap_err();
        assert_eq!(err.gatt_error(), Some(&GattError::ReadNotPermitted));

        // A characteristic read sharing the numeric handle doesn't complete it
        radio.set_responder(|_radio, call| match call {
            Call::ReadDescriptor(link_id, descriptor) => vec![RadioEvent::CharacteristicRead {
                link_id: *link_id,
                characteristic: CharacteristicHandle(descriptor.0),
                value: vec![0xFF],
                status: GattStatus::SUCCESS,
            }],
            _ => vec![],
        });
        let err = connection.read_descriptor(&cccd).await.unwrap_err();
        assert!(err.is_timeout());
        assert!(connection.is_connected());
    }

    #[tokio::test]
    async fn missing_configuration_descriptor_leaves_stack_untouched() {
        let (radio, _session, connection) = connected().await;
        let bare = Characteristic::new(ServiceHandle(1), CharacteristicHandle(60), uuid_from_u16(0xFFF3),
                                       CharacteristicProperties::NOTIFY);

        let err = connection.enable_notification(&bare, None).await.unwrap_err();
        assert!(matches!(err, Error::Lookup { kind: "descriptor", found: 0, .. }));
        let err = connection.set_notification_enabled(&bare, false).await.unwrap_err();
        assert!(matches!(err, Error::Lookup { kind: "descriptor", found: 0, .. }));

        assert_eq!(radio.count(|call| matches!(call, Call::SetNotification(..))), 0);
        assert!(!connection.is_observing(bare.handle));
    }

    #[tokio::test]
    async fn failed_reenable_keeps_previous_observer() {
        let (radio, _session, connection) = connected().await;
        let link_id = connection.link_id();
        let battery = connection.get_characteristic(BATTERY_SERVICE_UUID, BATTERY_LEVEL_UUID)
                                .await
                                .unwrap();
        let mut observer = connection.enable_notification(&battery, None).await.unwrap();

        radio.set_responder(|radio, call| match call {
            Call::WriteDescriptor(link_id, descriptor, _) => vec![RadioEvent::DescriptorWrite {
                link_id: *link_id,
                descriptor: *descriptor,
                status: GattStatus::WRITE_NOT_PERMITTED,
            }],
            _ => radio.default_response(call),
        });
        let err = connection.enable_notification(&battery, None).await.unwrap_err();
        assert_eq!(err.gatt_error(), Some(&GattError::WriteNotPermitted));

        assert!(connection.is_observing(battery.handle));
        radio.notify(link_id, battery.handle, &[42]);
        assert_eq!(observer.wait_for_value(Duration::from_millis(200)).await.unwrap(), vec![42]);

        // With nothing installed before, a failed enable leaves nothing behind
        let measurement = connection.get_characteristic(HEART_RATE_SERVICE_UUID, HEART_RATE_MEASUREMENT_UUID)
                                    .await
                                    .unwrap();
        connection.enable_notification(&measurement, None).await.unwrap_err();
        assert!(!connection.is_observing(measurement.handle));
    }

    #[test]
    fn notify_takes_precedence_over_indicate() {
        let both = CharacteristicProperties::NOTIFY | CharacteristicProperties::INDICATE;
        assert_eq!(configuration_value(both, true), ENABLE_NOTIFICATION_VALUE);
        assert_eq!(configuration_value(CharacteristicProperties::INDICATE, true), ENABLE_INDICATION_VALUE);
        assert_eq!(configuration_value(CharacteristicProperties::INDICATE, false), DISABLE_INDICATION_VALUE);
    }

    #[tokio::test]
    async fn notifications_reach_observer_until_disabled() {
        let (radio, _session, connection) = connected().await;
        let link_id = connection.link_id();
        let battery = connection.get_characteristic(BATTERY_SERVICE_UUID, BATTERY_LEVEL_UUID)
                                .await
                                .unwrap();

        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let listener: ValueListener = Arc::new(move |_value: &[u8]| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        let mut observer = connection.enable_notification(&battery, Some(listener)).await.unwrap();

        radio.notify(link_id, battery.handle, &[87]);
        assert_eq!(observer.wait_for_value(Duration::from_millis(200)).await.unwrap(), vec![87]);
        assert_eq!(observer.latest(), Some(vec![87]));
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        assert!(connection.is_observing(battery.handle));
        connection.disable_notification(&battery).await.unwrap();
        assert!(!connection.is_observing(battery.handle));
        radio.notify(link_id, battery.handle, &[86]);
        settle().await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        let err = observer.wait_for_value(Duration::from_millis(50)).await.unwrap_err();
        assert!(matches!(err, Error::NotificationsDisabled));
    }

    #[tokio::test]
    async fn unobserved_notifications_are_dropped() {
        let (_radio, _session, connection) = connected().await;
        assert!(!connection.on_characteristic_changed(CharacteristicHandle(2), &[1]));
    }

    #[tokio::test]
    async fn close_listener_fires_once_across_racing_disconnects() {
        let (radio, session, connection) = connected().await;
        let link_id = connection.link_id();

        let fired = Arc::new(AtomicUsize::new(0));
        let counter = fired.clone();
        connection.add_close_listener(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        let removed = Arc::new(AtomicUsize::new(0));
        let counter = removed.clone();
        let id = connection.add_close_listener(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        assert!(connection.remove_close_listener(id));

        // The remote drops the link just as we ask to close it
        radio.drop_link(link_id, GattStatus::SUCCESS);
        connection.close().await.unwrap();
        settle().await;

        assert!(connection.is_closed());
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert_eq!(removed.load(Ordering::SeqCst), 0);
        assert_eq!(radio.count(|call| *call == Call::Close(link_id)), 1);
        assert!(session.connection(link_id).is_none());

        // Closing again is a no-op
        connection.close().await.unwrap();
        assert_eq!(radio.count(|call| *call == Call::Close(link_id)), 1);
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn close_releases_link_and_state() {
        let (radio, session, connection) = connected().await;
        let link_id = connection.link_id();
        connection.get_service(HEART_RATE_SERVICE_UUID).await.unwrap();

        connection.close().await.unwrap();
        settle().await;

        assert_eq!(radio.count(|call| *call == Call::Disconnect(link_id)), 1);
        assert_eq!(radio.count(|call| *call == Call::Close(link_id)), 1);
        assert_eq!(connection.services(), None);
        assert!(session.connections().is_empty());

        let err = connection.get_service(HEART_RATE_SERVICE_UUID).await.unwrap_err();
        assert!(matches!(err, Error::NotConnected));

        // Per-link bookkeeping goes with the link, totals stay
        let executor = session.executor();
        assert_eq!(executor.submission_count_where(|key| key.link_id() == Some(link_id)), 0);
        assert_eq!(executor.submission_count_of_kind("discover_services"), 1);
        assert_eq!(executor.submission_count_of_kind("disconnect"), 1);

        // A listener added after the fact is called straight away
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = fired.clone();
        connection.add_close_listener(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn disconnect_fails_pending_operations() {
        let (radio, _session, connection) = connected().await;
        let link_id = connection.link_id();
        let location = connection.get_characteristic(HEART_RATE_SERVICE_UUID, BODY_SENSOR_LOCATION_UUID)
                                 .await
                                 .unwrap();

        radio.set_responder(|radio, call| match call {
            Call::ReadCharacteristic(..) => vec![],
            _ => radio.default_response(call),
        });

        let dropper = async {
            settle().await;
            radio.drop_link(link_id, GattStatus(0x08));
        };
        let (result, ()) = tokio::join!(connection.read_characteristic(&location), dropper);

        let err = result.unwrap_err();
        assert_eq!(err.gatt_error(), Some(&GattError::Disconnected));
        assert!(connection.is_closed());
    }

    #[tokio::test]
    async fn internal_error_refreshes_and_retries_discovery_once() {
        let (radio, _session, connection) = connected().await;

        let mut failed = false;
        radio.set_responder(move |radio, call| match call {
            Call::DiscoverServices(link_id) if !failed => {
                failed = true;
                vec![RadioEvent::ServicesDiscovered { link_id: *link_id, status: GattStatus::INTERNAL_ERROR }]
            }
            _ => radio.default_response(call),
        });

        connection.get_service(HEART_RATE_SERVICE_UUID).await.unwrap();
        assert_eq!(radio.count(|call| matches!(call, Call::Refresh(_))), 1);
        assert_eq!(discoveries(&radio), 2);
    }

    #[tokio::test]
    async fn persistent_internal_error_is_reported() {
        let (radio, _session, connection) = connected().await;

        radio.set_responder(|radio, call| match call {
            Call::DiscoverServices(link_id) => {
                vec![RadioEvent::ServicesDiscovered { link_id: *link_id, status: GattStatus::INTERNAL_ERROR }]
            }
            _ => radio.default_response(call),
        });

        let err = connection.get_service(HEART_RATE_SERVICE_UUID).await.unwrap_err();
        assert_eq!(err.gatt_error(), Some(&GattError::InternalError));
        assert_eq!(radio.count(|call| matches!(call, Call::Refresh(_))), 1);
        assert_eq!(discoveries(&radio), 2);
    }

    #[tokio::test]
    async fn rediscovery_refreshes_cache_for_bonded_devices() {
        let (radio, _session, connection) = connected().await;
        connection.get_service(HEART_RATE_SERVICE_UUID).await.unwrap();

        connection.discover_services().await.unwrap();
        assert_eq!(radio.count(|call| matches!(call, Call::Refresh(_))), 0);

        radio.set_bond_state(BondState::Bonded);
        connection.discover_services().await.unwrap();
        assert_eq!(radio.count(|call| matches!(call, Call::Refresh(_))), 1);
        assert_eq!(discoveries(&radio), 3);
    }

    #[tokio::test]
    async fn mtu_and_reliable_writes() {
        let (radio, _session, connection) = connected().await;
        let link_id = connection.link_id();
        assert_eq!(connection.mtu(), DEFAULT_MTU);
        assert_eq!(connection.max_data_packet_size(), 20);

        assert_eq!(connection.request_mtu(247).await.unwrap(), 247);
        assert_eq!(connection.max_data_packet_size(), 244);

        let control = connection.get_characteristic(HEART_RATE_SERVICE_UUID, HEART_RATE_CONTROL_POINT_UUID)
                                .await
                                .unwrap();
        connection.begin_reliable_write().unwrap();
        connection.write_characteristic(&control, &[0x01], WriteType::WithResponse).await.unwrap();
        connection.execute_reliable_write().await.unwrap();
        connection.abort_reliable_write().unwrap();

        assert_eq!(radio.count(|call| *call == Call::BeginReliableWrite(link_id)), 1);
        assert_eq!(radio.count(|call| *call == Call::ExecuteReliableWrite(link_id)), 1);
        assert_eq!(radio.count(|call| *call == Call::AbortReliableWrite(link_id)), 1);
    }
}
