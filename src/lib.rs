#![doc = include_str!("../README.md")]

pub mod apdu;
pub mod client;
pub mod encoding;
pub mod service;
pub mod transport;
pub mod util;

// Re-export main types without glob imports to avoid conflicts
pub use apdu::{ApduType, MaxApduSize, MaxSegments};
pub use client::{BacnetClient, ClientConfig, ClientError, ConfirmedInvoke};
pub use service::{
    AbortReason, ConfirmedServiceChoice, ErrorClass, ErrorCode, RejectReason, ServiceError,
    UnconfirmedServiceChoice,
};
pub use transport::{BacnetAddress, Transport, TransportError};

pub const BACNET_PROTOCOL_VERSION: u8 = 1;
pub const BACNET_MAX_APDU: usize = 1476;
pub const BACNET_MAX_MPDU: usize = 1497;

#[cfg(test)]
mod tests {
    use crate::apdu::{Apdu, MaxApduSize};
    use crate::service::ConfirmedServiceChoice;
    use crate::transport::BacnetAddress;

    #[test]
    fn test_reexported_types() {
        let addr = BacnetAddress::local(vec![192, 168, 1, 10, 0xBA, 0xC0]);
        assert!(addr.is_local());
        assert_eq!(MaxApduSize::Up1476.size(), crate::BACNET_MAX_APDU);
    }

    #[test]
    fn test_simple_ack_header_size() {
        let apdu = Apdu::SimpleAck {
            invoke_id: 1,
            service_choice: ConfirmedServiceChoice::WriteProperty as u8,
        };
        assert_eq!(apdu.encode().len(), 3);
    }
}
