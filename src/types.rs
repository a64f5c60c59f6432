//! GATT attribute handles and the operation request/response model.
//!
//! Handles are assumed already resolved (service/characteristic topology
//! discovery is out of scope); callers supply them directly.

use uuid::Uuid;

/// An addressable data point exposed by the remote peripheral.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Characteristic {
    /// UUID of the service the characteristic belongs to.
    pub service: Uuid,
    /// UUID of the characteristic itself.
    pub uuid: Uuid,
}

impl Characteristic {
    pub fn new(service: Uuid, uuid: Uuid) -> Self {
        Self { service, uuid }
    }
}

/// Metadata attribute attached to a characteristic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Descriptor {
    pub characteristic: Characteristic,
    pub uuid: Uuid,
}

impl Descriptor {
    pub fn new(characteristic: Characteristic, uuid: Uuid) -> Self {
        Self { characteristic, uuid }
    }
}

/// How a characteristic write is acknowledged by the peripheral.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum WriteType {
    WithResponse,
    #[default]
    WithoutResponse,
}

/// Target attribute of a read or write operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationTarget {
    Characteristic(Characteristic),
    Descriptor(Descriptor),
}

impl From<Characteristic> for OperationTarget {
    fn from(characteristic: Characteristic) -> Self {
        OperationTarget::Characteristic(characteristic)
    }
}

impl From<Descriptor> for OperationTarget {
    fn from(descriptor: Descriptor) -> Self {
        OperationTarget::Descriptor(descriptor)
    }
}

/// A logical operation issued through the connection coordinator.
///
/// Exactly one platform action is driven per accepted request, and exactly
/// one [`OperationResponse`] flows back for it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OperationRequest {
    Read {
        target: OperationTarget,
    },
    Write {
        target: OperationTarget,
        payload: Vec<u8>,
        write_type: WriteType,
    },
    ReadRssi,
}

/// The single response produced by the platform for an issued request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OperationResponse {
    /// Payload of a completed read.
    Value(Vec<u8>),
    /// Acknowledgement of a completed write.
    WriteComplete,
    /// Signal strength in dBm.
    Rssi(i16),
    /// The platform reported an explicit protocol/status error.
    Failure {
        /// GATT status code, when the platform surfaced one.
        status: Option<u8>,
        description: String,
    },
}

/// An inbound value-change notification for an observed characteristic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    pub characteristic: Characteristic,
    pub payload: Vec<u8>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_write_type_default() {
        assert_eq!(WriteType::default(), WriteType::WithoutResponse);
    }

    #[test]
    fn test_target_from_handles() {
        let characteristic = Characteristic::new(Uuid::new_v4(), Uuid::new_v4());
        let descriptor = Descriptor::new(characteristic, Uuid::new_v4());
        assert_eq!(
            OperationTarget::from(characteristic),
            OperationTarget::Characteristic(characteristic)
        );
        assert_eq!(
            OperationTarget::from(descriptor),
            OperationTarget::Descriptor(descriptor)
        );
    }
}
