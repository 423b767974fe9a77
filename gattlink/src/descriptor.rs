use uuid::Uuid;

use crate::{CharacteristicHandle, DescriptorHandle};

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Descriptor {
    pub handle: DescriptorHandle,
    pub characteristic: CharacteristicHandle,
    pub uuid: Uuid,
}

impl Descriptor {
    pub fn new(characteristic: CharacteristicHandle, handle: DescriptorHandle, uuid: Uuid) -> Self {
        Self { handle, characteristic, uuid }
    }
}
