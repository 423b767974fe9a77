use anyhow::anyhow;
use uuid::Uuid;

use crate::executor::OperationKey;
use crate::service::Service;
use crate::{CharacteristicHandle, DescriptorHandle, Device, Error, LinkId, Result};

/// Operation identity: what kind of request, against which target
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum OpKey {
    Scan(Uuid),
    Connect(LinkId),
    Disconnect(LinkId),
    DiscoverServices(LinkId),
    ServicesCached(LinkId),
    ReadCharacteristic(LinkId, CharacteristicHandle),
    WriteCharacteristic(LinkId, CharacteristicHandle),
    ReadDescriptor(LinkId, DescriptorHandle),
    WriteDescriptor(LinkId, DescriptorHandle),
    ReadRssi(LinkId),
    RequestMtu(LinkId),
    ExecuteReliableWrite(LinkId),
}

impl OpKey {
    pub fn link_id(&self) -> Option<LinkId> {
        match *self {
            OpKey::Scan(_) => None,
            OpKey::Connect(link_id) |
            OpKey::Disconnect(link_id) |
            OpKey::DiscoverServices(link_id) |
            OpKey::ServicesCached(link_id) |
            OpKey::ReadCharacteristic(link_id, _) |
            OpKey::WriteCharacteristic(link_id, _) |
            OpKey::ReadDescriptor(link_id, _) |
            OpKey::WriteDescriptor(link_id, _) |
            OpKey::ReadRssi(link_id) |
            OpKey::RequestMtu(link_id) |
            OpKey::ExecuteReliableWrite(link_id) => Some(link_id),
        }
    }

    pub fn is_connect(&self) -> bool {
        matches!(self, OpKey::Connect(_))
    }

    pub fn is_scan(&self) -> bool {
        matches!(self, OpKey::Scan(_))
    }
}

impl OperationKey for OpKey {
    fn kind(&self) -> &'static str {
        match self {
            OpKey::Scan(_) => "scan",
            OpKey::Connect(_) => "connect",
            OpKey::Disconnect(_) => "disconnect",
            OpKey::DiscoverServices(_) => "discover_services",
            OpKey::ServicesCached(_) => "services_cached",
            OpKey::ReadCharacteristic(..) => "read_characteristic",
            OpKey::WriteCharacteristic(..) => "write_characteristic",
            OpKey::ReadDescriptor(..) => "read_descriptor",
            OpKey::WriteDescriptor(..) => "write_descriptor",
            OpKey::ReadRssi(_) => "read_rssi",
            OpKey::RequestMtu(_) => "request_mtu",
            OpKey::ExecuteReliableWrite(_) => "execute_reliable_write",
        }
    }
}

/// The payload a completion may carry
#[derive(Clone, Debug)]
pub enum OpValue {
    Device(Device),
    Bytes(Vec<u8>),
    Rssi(i32),
    Mtu(u16),
    Services(Vec<Service>),
}

impl OpValue {
    pub fn into_device(self) -> Result<Device> {
        match self {
            OpValue::Device(device) => Ok(device),
            other => Err(unexpected("device", &other)),
        }
    }

    pub fn into_bytes(self) -> Result<Vec<u8>> {
        match self {
            OpValue::Bytes(bytes) => Ok(bytes),
            other => Err(unexpected("bytes", &other)),
        }
    }

    pub fn into_rssi(self) -> Result<i32> {
        match self {
            OpValue::Rssi(rssi) => Ok(rssi),
            other => Err(unexpected("rssi", &other)),
        }
    }

    pub fn into_mtu(self) -> Result<u16> {
        match self {
            OpValue::Mtu(mtu) => Ok(mtu),
            other => Err(unexpected("mtu", &other)),
        }
    }

    pub fn into_services(self) -> Result<Vec<Service>> {
        match self {
            OpValue::Services(services) => Ok(services),
            other => Err(unexpected("services", &other)),
        }
    }
}

fn unexpected(expected: &str, got: &OpValue) -> Error {
    Error::Other(anyhow!("Expected {} completion, got {:?}", expected, got))
}
