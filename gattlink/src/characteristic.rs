use bitflags::bitflags;
use uuid::Uuid;

use crate::descriptor::Descriptor;
use crate::uuid::CLIENT_CHARACTERISTIC_CONFIGURATION_UUID;
use crate::{CharacteristicHandle, ServiceHandle};

// NB: we don't use a Uuid as a unique key for a characteristic
// since it's possible for devices to expose the same characteristic
// (with the same uuid) multiple times, differentiated with an attribute
// handle.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Characteristic {
    pub handle: CharacteristicHandle,
    pub service: ServiceHandle,
    pub uuid: Uuid,
    pub properties: CharacteristicProperties,
    pub descriptors: Vec<Descriptor>,
}

bitflags! {
    pub struct CharacteristicProperties: u32 {
        const NONE = 0;

        const BROADCAST = 0x01;
        const READ = 0x02;
        const WRITE_WITHOUT_RESPONSE = 0x04;
        const WRITE = 0x08;
        const NOTIFY = 0x10;
        const INDICATE = 0x20;
        const AUTHENTICATED_SIGNED_WRITES = 0x40;
        const EXTENDED_PROPERTIES = 0x80;
        const RELIABLE_WRITES = 0x100;
        const WRITABLE_AUXILIARIES = 0x200;
    }
}

impl Characteristic {
    pub fn new(service: ServiceHandle,
               handle: CharacteristicHandle,
               uuid: Uuid,
               properties: CharacteristicProperties)
               -> Self {
        Self {
            handle,
            service,
            uuid,
            properties,
            descriptors: vec![],
        }
    }

    pub fn with_descriptor(mut self, descriptor: Descriptor) -> Self {
        self.descriptors.push(descriptor);
        self
    }

    pub fn descriptors_by_uuid<'a>(&'a self, uuid: &'a Uuid)
                                   -> impl Iterator<Item = &'a Descriptor> + 'a {
        self.descriptors.iter().filter(move |d| &d.uuid == uuid)
    }

    /// The client characteristic configuration descriptor, if the remote exposes one
    pub fn configuration_descriptor(&self) -> Option<&Descriptor> {
        self.descriptors
            .iter()
            .find(|d| d.uuid == CLIENT_CHARACTERISTIC_CONFIGURATION_UUID)
    }

    pub fn supports_notify(&self) -> bool {
        self.properties.intersects(CharacteristicProperties::NOTIFY | CharacteristicProperties::INDICATE)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum WriteType {
    WithResponse,
    WithoutResponse,
}

impl Default for WriteType {
    fn default() -> Self {
        WriteType::WithResponse
    }
}
