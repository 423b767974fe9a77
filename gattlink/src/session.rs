use std::fmt;
use std::hash::Hash;
use std::ops::Deref;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use futures::StreamExt;
use log::{debug, info, trace, warn};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::connection::{ConnectOptions, Connection, LinkState, LinkTable};
use crate::executor::{Executor, Operation};
use crate::operation::{OpKey, OpValue};
use crate::radio::{ConnectionState, Filter, Radio, RadioEvent, ScanMode};
use crate::{CharacteristicHandle, DescriptorHandle, Device, Error, GattError, GattStatus, LinkId, Result};

/// Timeouts and retry budgets for a [`Session`]
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Applies to reads, writes, RSSI and MTU requests and disconnects
    pub operation_timeout: Duration,

    /// Applies to service discovery
    pub slow_operation_timeout: Duration,

    /// How long each connection attempt may take, including MTU negotiation
    pub connect_timeout: Duration,

    /// How long to scan in low latency mode before falling back to a low power
    /// scan with no deadline
    pub low_latency_scan_timeout: Duration,

    pub connect_attempts: u32,

    /// How many times discovery is retried (after refreshing the radio's cache)
    /// when it fails with an internal error
    pub discovery_retries: u32,

    pub priority_attempts: u32,
}

impl Default for SessionConfig {
    fn default() -> Self {
        SessionConfig {
            operation_timeout: Duration::from_secs(5),
            slow_operation_timeout: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(5),
            low_latency_scan_timeout: Duration::from_secs(10),
            connect_attempts: 3,
            discovery_retries: 1,
            priority_attempts: 3,
        }
    }
}

impl SessionConfig {
    pub fn new() -> SessionConfig {
        SessionConfig::default()
    }

    pub fn set_operation_timeout(&mut self, timeout: Duration) -> &mut Self {
        self.operation_timeout = timeout;
        self
    }

    pub fn set_slow_operation_timeout(&mut self, timeout: Duration) -> &mut Self {
        self.slow_operation_timeout = timeout;
        self
    }

    pub fn set_connect_timeout(&mut self, timeout: Duration) -> &mut Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn set_low_latency_scan_timeout(&mut self, timeout: Duration) -> &mut Self {
        self.low_latency_scan_timeout = timeout;
        self
    }

    pub fn set_connect_attempts(&mut self, attempts: u32) -> &mut Self {
        self.connect_attempts = attempts;
        self
    }

    pub fn set_discovery_retries(&mut self, retries: u32) -> &mut Self {
        self.discovery_retries = retries;
        self
    }

    pub fn set_priority_attempts(&mut self, attempts: u32) -> &mut Self {
        self.priority_attempts = attempts;
        self
    }

    /// Starts a session on top of the given radio.
    ///
    /// Must be called from within a tokio runtime, since a task is spawned to
    /// process radio events.
    pub async fn start(self, radio: Arc<dyn Radio>) -> Result<Session> {
        Session::start(self, radio).await
    }
}

/// Connects to devices and routes radio callbacks to the operations and
/// connections waiting on them.
#[derive(Clone)]
pub struct Session {
    inner: Arc<SessionInner>,
}
impl PartialEq for Session {
    fn eq(&self, other: &Session) -> bool {
        Arc::<SessionInner>::ptr_eq(&self.inner, &other.inner)
    }
}
impl Eq for Session {}
impl Hash for Session {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        std::ptr::hash(Arc::<SessionInner>::as_ptr(&self.inner), state);
    }
}
impl Deref for Session {
    type Target = SessionInner;

    fn deref(&self) -> &Self::Target {
        &self.inner
    }
}
impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("connections", &self.connections.len())
            .field("executor", &self.executor)
            .finish()
    }
}

pub struct SessionInner {
    radio: Arc<dyn Radio>,
    config: Arc<SessionConfig>,
    executor: Arc<Executor<OpKey, OpValue>>,
    connections: Arc<LinkTable>,
    next_link_id: AtomicU32,
    event_bus: mpsc::UnboundedSender<RadioEvent>,
}

impl Session {
    fn wrap(inner: Arc<SessionInner>) -> Self {
        Self { inner }
    }

    async fn start(config: SessionConfig, radio: Arc<dyn Radio>) -> Result<Self> {
        // The radio glue feeds this bus (via event_sender()) from whatever
        // thread its callbacks arrive on and a single task routes them in order
        let (event_bus_tx, event_bus_rx) = mpsc::unbounded_channel();
        let session = Session {
            inner: Arc::new(SessionInner {
                radio,
                config: Arc::new(config),
                executor: Arc::new(Executor::new()),
                connections: Arc::new(LinkTable::new()),
                next_link_id: AtomicU32::new(1),
                event_bus: event_bus_tx,
            }),
        };

        // XXX: the task only holds a Weak reference, otherwise the session could
        // never be dropped. It upgrades only while routing an event.
        let weak_session = Arc::downgrade(&session.inner);
        tokio::spawn(async move { Session::run_event_task(weak_session, event_bus_rx).await });

        Ok(session)
    }

    async fn run_event_task(weak_session_inner: Weak<SessionInner>,
                            event_bus: mpsc::UnboundedReceiver<RadioEvent>) {
        trace!("Starting task to route radio events...");

        let stream = tokio_stream::wrappers::UnboundedReceiverStream::new(event_bus);
        tokio::pin!(stream);
        while let Some(event) = stream.next().await {
            let session = match weak_session_inner.upgrade() {
                Some(strong_inner) => Session::wrap(strong_inner),
                None => {
                    trace!("Exiting radio event task since the Session has been dropped");
                    break;
                }
            };
            session.dispatch(event);
        }

        trace!("Finished routing radio events");
    }

    /// A sender for feeding radio callbacks into this session from any thread
    pub fn event_sender(&self) -> mpsc::UnboundedSender<RadioEvent> {
        self.event_bus.clone()
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// The executor every radio operation goes through
    pub fn executor(&self) -> &Executor<OpKey, OpValue> {
        &self.executor
    }

    pub fn connection(&self, link_id: LinkId) -> Option<Connection> {
        self.connections.get(&link_id).map(|entry| entry.value().clone())
    }

    /// Every link that is connecting or connected
    pub fn connections(&self) -> Vec<Connection> {
        self.connections.iter().map(|entry| entry.value().clone()).collect()
    }

    /// Makes a single connection attempt.
    ///
    /// If the attempt times out it's cancelled, which disconnects and releases
    /// the half-open link; any later callback for it is ignored.
    pub async fn connect(&self, device: &Device, options: ConnectOptions) -> Result<Connection> {
        let link_id = LinkId(self.next_link_id.fetch_add(1, Ordering::Relaxed));
        let connection = Connection::new(link_id, device.clone(), options, self.config.clone(),
                                         self.executor.clone(), &self.connections);
        self.connections.insert(link_id, connection.clone());
        info!("{}: connecting to {}", link_id, device.address);

        let radio = self.radio.clone();
        let target = device.clone();
        let attaching = connection.clone();
        let abandoned = connection.clone();
        let op = Operation::new(OpKey::Connect(link_id), move || {
                attaching.attach_link(|| radio.connect(link_id, &target, options.auto_connect))
            })
            .on_cancel(move || {
                abandoned.abandon();
            });

        let mut submission = match self.executor.submit(op) {
            Ok(submission) => submission,
            Err(err) => {
                connection.abandon();
                return Err(err);
            }
        };
        let waited = submission.wait(Some(self.config.connect_timeout)).await;
        match waited {
            Ok(_) => {}
            Err(err) if err.is_timeout() => {
                warn!("{}: connection attempt timed out", link_id);
                submission.cancel();
                return Err(err);
            }
            Err(err) => {
                debug!("{}: connection attempt failed: {}", link_id, err);
                connection.abandon();
                return Err(err);
            }
        }

        self.apply_priority(&connection);
        Ok(connection)
    }

    fn apply_priority(&self, connection: &Connection) {
        let priority = match connection.options().priority {
            Some(priority) => priority,
            None => return,
        };
        let link = match connection.link() {
            Ok(link) => link,
            Err(_) => return,
        };

        let attempts = self.config.priority_attempts;
        for attempt in 1..=attempts {
            match link.request_connection_priority(priority) {
                Ok(()) => {
                    debug!("{}: connection priority set to {:?}", connection.link_id(), priority);
                    connection.set_priority(priority);
                    return;
                }
                Err(err) => {
                    warn!("{}: request for {:?} priority failed ({}/{}): {}",
                          connection.link_id(), priority, attempt, attempts, err);
                }
            }
        }
    }

    /// Connects, retrying failed attempts up to the configured budget
    pub async fn connect_with_retry(&self, device: &Device, options: ConnectOptions)
                                    -> Result<Connection> {
        let attempts = self.config.connect_attempts.max(1);
        let mut attempt = 1;
        loop {
            match self.connect(device, options).await {
                Ok(connection) => return Ok(connection),
                Err(err) if attempt < attempts => {
                    warn!("Connection attempt {}/{} to {} failed: {}",
                          attempt, attempts, device.address, err);
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }

    fn stop_scan(&self, mode: ScanMode) {
        if let Err(err) = self.radio.stop_scan(mode) {
            debug!("Failed to stop {:?} scan: {}", mode, err);
        }
    }

    fn scan_operation(&self, service_uuid: Uuid, mode: ScanMode) -> Operation<OpKey> {
        let mut filter = Filter::new();
        filter.add_service(service_uuid);
        let radio = self.radio.clone();
        Operation::new(OpKey::Scan(service_uuid), move || radio.start_scan(&filter, mode))
    }

    /// Finds a device advertising `service_uuid`.
    ///
    /// Scans in low latency mode first and, if nothing turns up in time, keeps
    /// scanning in low power mode until something does.
    pub async fn scan_for(&self, service_uuid: Uuid) -> Result<Device> {
        let stopper = self.radio.clone();
        let op = self.scan_operation(service_uuid, ScanMode::LowLatency)
            .on_cancel(move || {
                if let Err(err) = stopper.stop_scan(ScanMode::LowLatency) {
                    debug!("Failed to stop low latency scan: {}", err);
                }
            });

        info!("Scanning for {}", service_uuid);
        let mut submission = self.executor.submit(op)?;
        let waited = submission.wait(Some(self.config.low_latency_scan_timeout)).await;
        let found = match waited {
            Ok(found) => found,
            Err(err) if err.is_timeout() => {
                info!("Nothing found for {}, falling back to a low power scan", service_uuid);
                submission.cancel();

                let op = self.scan_operation(service_uuid, ScanMode::LowPower);
                let result = self.executor.execute(op, None).await;
                self.stop_scan(ScanMode::LowPower);
                match result {
                    Ok(found) => found,
                    Err(err) => {
                        self.stop_scan(ScanMode::LowLatency);
                        return Err(err);
                    }
                }
            }
            Err(err) => {
                self.stop_scan(ScanMode::LowLatency);
                return Err(err);
            }
        };
        self.stop_scan(ScanMode::LowLatency);

        let device = found
            .ok_or_else(|| Error::MissingResult(format!("{:?}", OpKey::Scan(service_uuid))))?
            .into_device()?;
        info!("Found {} advertising {}", device.address, service_uuid);
        Ok(device)
    }

    /// Scans for a device advertising `service_uuid` and connects to it
    pub async fn auto_connect(&self, service_uuid: Uuid, options: ConnectOptions)
                              -> Result<Connection> {
        let device = self.scan_for(service_uuid).await?;
        self.connect_with_retry(&device, options).await
    }

    /// Routes one radio callback
    pub fn dispatch(&self, event: RadioEvent) {
        trace!("Radio event: {:?}", event);
        match event {
            RadioEvent::ScanResult { device } => self.on_scan_result(device),
            RadioEvent::ScanFailed { error_code } => self.on_scan_failed(error_code),
            RadioEvent::ConnectionStateChange { link_id, status, state } => {
                self.on_connection_state_change(link_id, status, state)
            }
            RadioEvent::ServicesDiscovered { link_id, status } => {
                self.on_services_discovered(link_id, status)
            }
            RadioEvent::CharacteristicRead { link_id, characteristic, value, status } => {
                self.on_characteristic_read(link_id, characteristic, value, status)
            }
            RadioEvent::CharacteristicWrite { link_id, characteristic, status } => {
                self.on_characteristic_write(link_id, characteristic, status)
            }
            RadioEvent::CharacteristicChanged { link_id, characteristic, value } => {
                self.on_characteristic_changed(link_id, characteristic, &value)
            }
            RadioEvent::DescriptorRead { link_id, descriptor, value, status } => {
                self.on_descriptor_read(link_id, descriptor, value, status)
            }
            RadioEvent::DescriptorWrite { link_id, descriptor, status } => {
                self.on_descriptor_write(link_id, descriptor, status)
            }
            RadioEvent::ReadRemoteRssi { link_id, rssi, status } => {
                self.on_read_remote_rssi(link_id, rssi, status)
            }
            RadioEvent::ReliableWriteCompleted { link_id, status } => {
                self.on_reliable_write_completed(link_id, status)
            }
            RadioEvent::MtuChanged { link_id, mtu, status } => {
                self.on_mtu_changed(link_id, mtu, status)
            }
        }
    }

    // Callbacks for links we no longer track (closed, cancelled or never ours)
    // are dropped without touching the executor
    fn tracked(&self, link_id: LinkId, what: &str) -> Option<Connection> {
        let connection = self.connection(link_id);
        if connection.is_none() {
            debug!("Ignoring {} for untracked {}", what, link_id);
        }
        connection
    }

    pub fn on_scan_result(&self, device: Device) {
        trace!("Scan result: {:?}", device);
        for uuid in device.service_uuids.iter() {
            self.executor.notify_success(&OpKey::Scan(*uuid), Some(OpValue::Device(device.clone())));
        }
    }

    pub fn on_scan_failed(&self, error_code: i32) {
        warn!("Scan failed with code {}", error_code);
        self.executor.notify_failure_where(|key| key.is_scan(), GattError::ScanFailed(error_code));
    }

    pub fn on_connection_state_change(&self, link_id: LinkId, status: GattStatus,
                                      state: ConnectionState) {
        let connection = match self.tracked(link_id, "connection state change") {
            Some(connection) => connection,
            None => return,
        };
        debug!("{}: state = {:?}, status = {:?}", link_id, state, status);

        match state {
            ConnectionState::Connected => {
                if !status.is_success() {
                    warn!("{}: connected with failure status {:?}", link_id, status);
                    self.executor.notify_failure(&OpKey::Connect(link_id), status.into());
                    connection.abandon();
                    return;
                }
                if connection.state() != LinkState::AwaitingConnect {
                    warn!("{}: spurious connect notification in state {:?}",
                          link_id, connection.state());
                    return;
                }

                match connection.options().mtu {
                    Some(mtu) => {
                        connection.set_state(LinkState::AwaitingMtu);
                        debug!("{}: requesting mtu {}", link_id, mtu);
                        if let Err(err) = connection.link().and_then(|link| link.request_mtu(mtu)) {
                            warn!("{}: failed to request mtu: {}", link_id, err);
                            self.executor.notify_failure(&OpKey::Connect(link_id),
                                                         GattError::GeneralFailure(GattStatus::FAILURE));
                            connection.abandon();
                        }
                    }
                    None => {
                        if connection.on_connected() {
                            self.executor.notify_success(&OpKey::Connect(link_id), None);
                        }
                    }
                }
            }
            ConnectionState::Disconnected => {
                self.connections.remove(&link_id);
                if connection.is_connected() {
                    info!("{}: disconnected", link_id);
                    self.executor.notify_success(&OpKey::Disconnect(link_id), None);
                } else {
                    let error = if status.is_success() {
                        GattError::Disconnected
                    } else {
                        GattError::from(status)
                    };
                    debug!("{}: disconnected before connecting: {:?}", link_id, error);
                    self.executor.notify_failure(&OpKey::Connect(link_id), error);
                }
                connection.on_closed();
            }
        }
    }

    pub fn on_mtu_changed(&self, link_id: LinkId, mtu: u16, status: GattStatus) {
        let connection = match self.tracked(link_id, "mtu change") {
            Some(connection) => connection,
            None => return,
        };

        if connection.state() == LinkState::AwaitingMtu {
            if status.is_success() {
                connection.set_mtu(mtu);
                if connection.on_connected() {
                    self.executor.notify_success(&OpKey::Connect(link_id), None);
                }
            } else {
                warn!("{}: mtu negotiation failed: {:?}", link_id, status);
                self.executor.notify_failure(&OpKey::Connect(link_id), status.into());
                connection.abandon();
            }
        } else {
            self.executor.notify_completion(&OpKey::RequestMtu(link_id), status, Some(OpValue::Mtu(mtu)));
        }
    }

    pub fn on_services_discovered(&self, link_id: LinkId, status: GattStatus) {
        if self.tracked(link_id, "service discovery").is_some() {
            self.executor.notify_completion(&OpKey::DiscoverServices(link_id), status, None);
        }
    }

    pub fn on_characteristic_read(&self, link_id: LinkId, characteristic: CharacteristicHandle,
                                  value: Vec<u8>, status: GattStatus) {
        if self.tracked(link_id, "characteristic read").is_some() {
            self.executor.notify_completion(&OpKey::ReadCharacteristic(link_id, characteristic),
                                            status, Some(OpValue::Bytes(value)));
        }
    }

    pub fn on_characteristic_write(&self, link_id: LinkId, characteristic: CharacteristicHandle,
                                   status: GattStatus) {
        if self.tracked(link_id, "characteristic write").is_some() {
            self.executor.notify_completion(&OpKey::WriteCharacteristic(link_id, characteristic),
                                            status, None);
        }
    }

    pub fn on_characteristic_changed(&self, link_id: LinkId, characteristic: CharacteristicHandle,
                                     value: &[u8]) {
        if let Some(connection) = self.tracked(link_id, "characteristic change") {
            connection.on_characteristic_changed(characteristic, value);
        }
    }

    pub fn on_descriptor_read(&self, link_id: LinkId, descriptor: DescriptorHandle, value: Vec<u8>,
                              status: GattStatus) {
        if self.tracked(link_id, "descriptor read").is_some() {
            self.executor.notify_completion(&OpKey::ReadDescriptor(link_id, descriptor),
                                            status, Some(OpValue::Bytes(value)));
        }
    }

    pub fn on_descriptor_write(&self, link_id: LinkId, descriptor: DescriptorHandle,
                               status: GattStatus) {
        if self.tracked(link_id, "descriptor write").is_some() {
            self.executor.notify_completion(&OpKey::WriteDescriptor(link_id, descriptor),
                                            status, None);
        }
    }

    pub fn on_read_remote_rssi(&self, link_id: LinkId, rssi: i32, status: GattStatus) {
        if self.tracked(link_id, "rssi read").is_some() {
            self.executor.notify_completion(&OpKey::ReadRssi(link_id), status, Some(OpValue::Rssi(rssi)));
        }
    }

    pub fn on_reliable_write_completed(&self, link_id: LinkId, status: GattStatus) {
        if self.tracked(link_id, "reliable write").is_some() {
            self.executor.notify_completion(&OpKey::ExecuteReliableWrite(link_id), status, None);
        }
    }
}
