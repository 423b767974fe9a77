//! A GATT connection layer that turns a callback-driven, one-request-at-a-time
//! radio stack into independently awaitable operations.
//!
//! The crate is organised around three pieces:
//!
//! * [`executor::Executor`] matches asynchronous completions (keyed by an operation
//!   identity) with the callers waiting on them, and owns timeout and cancellation
//!   mechanics.
//! * [`connection::Connection`] is one established link, with a lazily populated
//!   service cache and read/write/notify operations built on the executor.
//! * [`session::Session`] owns scanning and connect-with-retry workflows and is
//!   the single entry point for every callback coming from the radio stack.
//!
//! The radio stack itself is a black box behind the [`radio::Radio`] and
//! [`radio::RadioLink`] traits.

use ::uuid::Uuid;
use arrayvec::ArrayVec;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

pub mod uuid;

pub mod service;
pub mod characteristic;
pub mod descriptor;

pub mod radio;

pub mod executor;
pub mod operation;

pub mod observer;
pub mod connection;

pub mod session;

pub mod fake;

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct MAC(u64);
impl fmt::Display for MAC {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let bytes = u64::to_le_bytes(self.0);
        write!(f,
               "{:02X}:{:02X}:{:02X}:{:02X}:{:02X}:{:02X}",
               bytes[0], bytes[1], bytes[2], bytes[3], bytes[4], bytes[5])
    }
}

/// A radio-specific unique identifier for Bluetooth devices
///
/// The underlying hardware MAC address is directly exposed where the radio
/// stack reports one, otherwise the address is an opaque string.
///
/// Addresses can be serialized/deserialized so applications can remember a
/// known device and later connect back to it without having to re-scan.
#[derive(Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum Address {
    MAC(MAC),
    String(String),
}
impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Address::MAC(mac) => {
                write!(f, "{}", mac)
            }
            Address::String(s) => {
                write!(f, "{}", s)
            }
        }
    }
}
impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Address::MAC(mac) => {
                write!(f, "MAC:{}", mac)
            }
            Address::String(s) => {
                write!(f, "String:{}", s)
            }
        }
    }
}

// Returns None for anything that isn't exactly six colon-separated hex octets,
// without allocating, since a valid address doesn't have to be a MAC address.
fn try_u64_from_mac48_str(s: &str) -> Option<u64> {
    if !s.contains(':') {
        return None;
    }
    let mut parts = ArrayVec::<_, 6>::new();
    for part in s.split(':') {
        if parts.try_push(part).is_err() {
            return None;
        }
    }
    if parts.len() != 6 {
        return None;
    }
    let mut bytes = [0u8; 8];
    for (i, part) in parts.iter().enumerate() {
        bytes[i] = u8::from_str_radix(part, 16).ok()?;
    }
    Some(u64::from_le_bytes(bytes))
}

impl FromStr for Address {
    type Err = std::convert::Infallible;
    fn from_str(s: &str) -> std::result::Result<Self, std::convert::Infallible> {
        match try_u64_from_mac48_str(s) {
            Some(val) => Ok(Address::MAC(MAC(val))),
            None => Ok(Address::String(s.to_string())),
        }
    }
}

/// A remote device, as reported by a scan result or known in advance.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Device {
    pub address: Address,
    pub name: Option<String>,

    /// Service UUIDs seen in the device's advertisements
    pub service_uuids: Vec<Uuid>,
}

impl Device {
    pub fn new(address: Address) -> Self {
        Self {
            address,
            name: None,
            service_uuids: vec![],
        }
    }

    pub fn with_name(mut self, name: &str) -> Self {
        self.name = Some(name.to_string());
        self
    }

    pub fn with_service(mut self, uuid: Uuid) -> Self {
        self.service_uuids.push(uuid);
        self
    }

    pub fn advertises(&self, uuid: &Uuid) -> bool {
        self.service_uuids.contains(uuid)
    }
}

/// Stable identity of one link, minted by the [`session::Session`] for every
/// low-level connect call.
///
/// The radio stack reports callbacks against this id instead of against its
/// own native link object.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LinkId(pub u32);

impl fmt::Display for LinkId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "link#{}", self.0)
    }
}

// Where the radio stack exposes them, these handles should correspond to the
// underlying ATT attribute handles. They are what distinguishes two GATT
// objects that share a UUID.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ServiceHandle(pub u32);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CharacteristicHandle(pub u32);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DescriptorHandle(pub u32);

/// A raw status code as reported by the radio stack alongside a callback
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct GattStatus(pub i32);

impl GattStatus {
    pub const SUCCESS: GattStatus = GattStatus(0x00);
    pub const INSUFFICIENT_AUTHENTICATION: GattStatus = GattStatus(0x05);
    pub const REQUEST_NOT_SUPPORTED: GattStatus = GattStatus(0x06);
    pub const INSUFFICIENT_AUTHORIZATION: GattStatus = GattStatus(0x08);
    pub const INSUFFICIENT_ENCRYPTION: GattStatus = GattStatus(0x0f);
    pub const READ_NOT_PERMITTED: GattStatus = GattStatus(0x02);
    pub const WRITE_NOT_PERMITTED: GattStatus = GattStatus(0x03);
    pub const INTERNAL_ERROR: GattStatus = GattStatus(0x81);
    pub const ERROR: GattStatus = GattStatus(0x85);
    pub const CONGESTED: GattStatus = GattStatus(0x8f);
    pub const FAILURE: GattStatus = GattStatus(0x101);

    pub fn is_success(&self) -> bool {
        *self == GattStatus::SUCCESS
    }
}

impl fmt::Debug for GattStatus {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "GattStatus({:#04x})", self.0)
    }
}

/// A failure reported by the radio stack for one operation.
///
/// This is `Clone` since a single completion may release several waiters
/// that all asked for the same operation.
#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
pub enum GattError {
    #[error("Insufficient Authentication")]
    InsufficientAuthentication,

    #[error("Insufficient Authorization")]
    InsufficientAuthorization,

    #[error("Insufficient Encryption")]
    InsufficientEncryption,

    #[error("Read Not Permitted")]
    ReadNotPermitted,

    #[error("Write Not Permitted")]
    WriteNotPermitted,

    #[error("Unsupported request")]
    Unsupported,

    #[error("Congested")]
    Congested,

    #[error("Internal stack error")]
    InternalError,

    #[error("Link disconnected")]
    Disconnected,

    #[error("Scan failed with error code {0}")]
    ScanFailed(i32),

    #[error("General Failure ({0:?})")]
    GeneralFailure(GattStatus),
}

impl GattError {
    /// The raw status this failure was reported with, if it came from a status code
    pub fn status(&self) -> Option<GattStatus> {
        match self {
            GattError::InsufficientAuthentication => Some(GattStatus::INSUFFICIENT_AUTHENTICATION),
            GattError::InsufficientAuthorization => Some(GattStatus::INSUFFICIENT_AUTHORIZATION),
            GattError::InsufficientEncryption => Some(GattStatus::INSUFFICIENT_ENCRYPTION),
            GattError::ReadNotPermitted => Some(GattStatus::READ_NOT_PERMITTED),
            GattError::WriteNotPermitted => Some(GattStatus::WRITE_NOT_PERMITTED),
            GattError::Unsupported => Some(GattStatus::REQUEST_NOT_SUPPORTED),
            GattError::Congested => Some(GattStatus::CONGESTED),
            GattError::InternalError => Some(GattStatus::INTERNAL_ERROR),
            GattError::GeneralFailure(status) => Some(*status),
            GattError::Disconnected | GattError::ScanFailed(_) => None,
        }
    }

    pub fn is_internal_error(&self) -> bool {
        matches!(self, GattError::InternalError)
    }
}

impl From<GattStatus> for GattError {
    fn from(status: GattStatus) -> Self {
        match status {
            GattStatus::INSUFFICIENT_AUTHENTICATION => GattError::InsufficientAuthentication,
            GattStatus::INSUFFICIENT_AUTHORIZATION => GattError::InsufficientAuthorization,
            GattStatus::INSUFFICIENT_ENCRYPTION => GattError::InsufficientEncryption,
            GattStatus::READ_NOT_PERMITTED => GattError::ReadNotPermitted,
            GattStatus::WRITE_NOT_PERMITTED => GattError::WriteNotPermitted,
            GattStatus::REQUEST_NOT_SUPPORTED => GattError::Unsupported,
            GattStatus::CONGESTED => GattError::Congested,
            GattStatus::INTERNAL_ERROR => GattError::InternalError,
            _ => GattError::GeneralFailure(status),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("{operation} timed out after {timeout:?}")]
    Timeout {
        operation: String,
        timeout: Duration,
    },

    #[error("There was a GATT communication protocol error")]
    Gatt(#[from] GattError),

    #[error("Expected exactly one {kind} {uuid}, found {found}")]
    Lookup {
        kind: &'static str,
        uuid: Uuid,
        found: usize,
    },

    #[error("Characteristic {0} supports neither notifications nor indications")]
    NotifyUnsupported(Uuid),

    #[error("No scanner available (is the radio disabled?)")]
    RadioUnavailable,

    #[error("The system is unable to communicate with this peripheral currently")]
    PeripheralUnreachable,

    #[error("The link is not connected")]
    NotConnected,

    #[error("Operation cancelled")]
    Cancelled,

    #[error("{0} completed without a result")]
    MissingResult(String),

    #[error("Notifications have been disabled for this characteristic")]
    NotificationsDisabled,

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl Error {
    pub fn is_timeout(&self) -> bool {
        matches!(self, Error::Timeout { .. })
    }

    /// The stack-reported failure behind this error, if any
    pub fn gatt_error(&self) -> Option<&GattError> {
        match self {
            Error::Gatt(err) => Some(err),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[test]
fn mac_two_way() {
    let addr = Address::from_str("F1:E2:D3:C4:B5:A6").unwrap();
    assert!(matches!(addr, Address::MAC(_)));
    let str = addr.to_string();
    // The octets are intentionally formatted as uppercase since radio stacks
    // (Android notably) are particular about this.
    assert_eq!(str, "F1:E2:D3:C4:B5:A6");

    let addr = Address::from_str("18c2a267-a539-4423-aecc-edeeb2784bcc").unwrap();
    assert!(matches!(addr, Address::String(_)));
    let str = addr.to_string();
    assert_eq!(str, "18c2a267-a539-4423-aecc-edeeb2784bcc");
}

#[test]
fn gatt_status_mapping() {
    assert_eq!(GattError::from(GattStatus::INTERNAL_ERROR), GattError::InternalError);
    assert!(GattError::from(GattStatus(0x81)).is_internal_error());
    assert_eq!(GattError::from(GattStatus(133)), GattError::GeneralFailure(GattStatus::ERROR));
    assert_eq!(GattError::from(GattStatus(133)).status(), Some(GattStatus(133)));
    assert_eq!(GattError::Disconnected.status(), None);
    assert!(GattStatus::SUCCESS.is_success());
}
