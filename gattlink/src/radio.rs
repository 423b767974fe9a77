//! The boundary with the underlying radio stack.
//!
//! Outbound requests go through [`Radio`] and [`RadioLink`]. They are expected to
//! return as soon as the request has been handed to the stack; the outcome arrives
//! later as a callback, which the stack (or its glue code) feeds back into
//! [`Session::dispatch`](crate::session::Session::dispatch) as a [`RadioEvent`], or by
//! calling the matching `Session::on_*` method directly.
//!
//! Implementations must not deliver callbacks re-entrantly from within one of these
//! calls; callbacks are expected on a thread owned by the stack.

use std::collections::HashSet;
use std::sync::Arc;

use uuid::Uuid;

use crate::characteristic::{Characteristic, WriteType};
use crate::descriptor::Descriptor;
use crate::service::Service;
use crate::{CharacteristicHandle, DescriptorHandle, Device, GattStatus, LinkId, Result};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ScanMode {
    LowPower,
    Balanced,
    LowLatency,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    Disconnected,
    Connected,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BondState {
    None,
    Bonding,
    Bonded,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ConnectionPriority {
    Balanced,
    High,
    LowPower,
}

#[derive(Clone, Debug, Default)]
pub struct Filter {
    pub(crate) service_uuids: HashSet<Uuid>
}
impl Filter {
    pub fn new() -> Self {
        Self {
            service_uuids: HashSet::new()
        }
    }

    pub fn add_service(&mut self, uuid: Uuid) -> &mut Self {
        self.service_uuids.insert(uuid);

        self
    }

    pub fn service_uuids(&self) -> impl Iterator<Item = &Uuid> {
        self.service_uuids.iter()
    }

    pub fn matches(&self, device: &Device) -> bool {
        self.service_uuids.is_empty()
            || self.service_uuids.iter().any(|uuid| device.advertises(uuid))
    }
}

pub trait Radio: Send + Sync {
    /// Fails with [`Error::RadioUnavailable`](crate::Error::RadioUnavailable) if
    /// the platform can't provide a scanner
    fn start_scan(&self, filter: &Filter, mode: ScanMode) -> Result<()>;
    fn stop_scan(&self, mode: ScanMode) -> Result<()>;

    /// Initiates a connection; `Ok(None)` means the stack gave us no usable link.
    ///
    /// All callbacks for the returned link must be reported against `link_id`.
    fn connect(&self, link_id: LinkId, device: &Device, auto_connect: bool)
               -> Result<Option<Arc<dyn RadioLink>>>;
}

// Note the characteristic and descriptor entry points are given the full
// discovered object, in case that simplifies state tracking for the stack
pub trait RadioLink: Send + Sync {
    fn disconnect(&self) -> Result<()>;

    /// Releases the stack's resources for this link. Called exactly once.
    fn close(&self);

    fn bond_state(&self) -> BondState;

    fn discover_services(&self) -> Result<()>;

    /// The services found by the most recent successful discovery
    fn services(&self) -> Vec<Service>;

    /// Clears the stack's own cache of the remote service table
    fn refresh(&self) -> Result<()>;

    fn read_characteristic(&self, characteristic: &Characteristic) -> Result<()>;
    fn write_characteristic(&self, characteristic: &Characteristic, value: &[u8],
                            write_type: WriteType) -> Result<()>;

    fn read_descriptor(&self, descriptor: &Descriptor) -> Result<()>;
    fn write_descriptor(&self, descriptor: &Descriptor, value: &[u8]) -> Result<()>;

    fn set_characteristic_notification(&self, characteristic: &Characteristic, enabled: bool)
                                       -> Result<()>;

    fn read_remote_rssi(&self) -> Result<()>;
    fn request_mtu(&self, mtu: u16) -> Result<()>;

    /// There's no callback for priority requests, so this is synchronous
    fn request_connection_priority(&self, priority: ConnectionPriority) -> Result<()>;

    fn begin_reliable_write(&self) -> Result<()>;
    fn execute_reliable_write(&self) -> Result<()>;
    fn abort_reliable_write(&self) -> Result<()>;
}

/// Every callback the radio stack can deliver
#[derive(Clone, Debug)]
pub enum RadioEvent {
    ScanResult {
        device: Device,
    },
    ScanFailed {
        error_code: i32,
    },
    ConnectionStateChange {
        link_id: LinkId,
        status: GattStatus,
        state: ConnectionState,
    },
    ServicesDiscovered {
        link_id: LinkId,
        status: GattStatus,
    },
    CharacteristicRead {
        link_id: LinkId,
        characteristic: CharacteristicHandle,
        value: Vec<u8>,
        status: GattStatus,
    },
    CharacteristicWrite {
        link_id: LinkId,
        characteristic: CharacteristicHandle,
        status: GattStatus,
    },
    CharacteristicChanged {
        link_id: LinkId,
        characteristic: CharacteristicHandle,
        value: Vec<u8>,
    },
    DescriptorRead {
        link_id: LinkId,
        descriptor: DescriptorHandle,
        value: Vec<u8>,
        status: GattStatus,
    },
    DescriptorWrite {
        link_id: LinkId,
        descriptor: DescriptorHandle,
        status: GattStatus,
    },
    ReadRemoteRssi {
        link_id: LinkId,
        rssi: i32,
        status: GattStatus,
    },
    ReliableWriteCompleted {
        link_id: LinkId,
        status: GattStatus,
    },
    MtuChanged {
        link_id: LinkId,
        mtu: u16,
        status: GattStatus,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::uuid::uuid_from_u16;

    #[test]
    fn filter_matches_advertised_services() {
        let hr = uuid_from_u16(0x180D);
        let device = Device::new("F1:E2:D3:C4:B5:A6".parse().unwrap()).with_service(hr);

        let mut filter = Filter::new();
        assert!(filter.matches(&device));

        filter.add_service(uuid_from_u16(0x180F));
        assert!(!filter.matches(&device));

        filter.add_service(hr);
        assert!(filter.matches(&device));
    }
}
