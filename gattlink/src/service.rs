use uuid::Uuid;

use crate::characteristic::Characteristic;
use crate::ServiceHandle;

// A Service is a snapshot of what the radio stack reported after service
// discovery. NB: we don't use a Uuid as a unique key for a service since it's
// possible for devices to expose the same service (with the same uuid)
// multiple times, differentiated with an attribute handle.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Service {
    pub handle: ServiceHandle,
    pub uuid: Uuid,
    pub characteristics: Vec<Characteristic>,
}

impl Service {
    pub fn new(handle: ServiceHandle, uuid: Uuid) -> Self {
        Service {
            handle,
            uuid,
            characteristics: vec![],
        }
    }

    pub fn with_characteristic(mut self, characteristic: Characteristic) -> Self {
        self.characteristics.push(characteristic);
        self
    }

    pub fn characteristics_by_uuid<'a>(&'a self, uuid: &'a Uuid)
                                       -> impl Iterator<Item = &'a Characteristic> + 'a {
        self.characteristics.iter().filter(move |c| &c.uuid == uuid)
    }

    pub fn has_characteristic(&self, uuid: &Uuid) -> bool {
        self.characteristics.iter().any(|c| &c.uuid == uuid)
    }
}
