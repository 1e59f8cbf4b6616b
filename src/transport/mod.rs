//! Transport boundary.
//!
//! The engine consumes transports through the [`Transport`] trait: an opaque
//! channel that can send an APDU to an address, deliver inbound APDUs through
//! a callback, and answer a few capability questions (payload budget, header
//! reservation, broadcast address). A BACnet/IP implementation lives in
//! [`udp`]; other data links (MS/TP, Ethernet) plug in behind the same trait.
//!
//! Addresses follow the BACnet network-layer model: a network number plus a
//! MAC of link-specific length. Network 0 means "this network"; 0xFFFF is the
//! global broadcast network.

use std::fmt;
use std::net::SocketAddr;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use thiserror::Error;

pub mod npdu;
pub mod udp;

/// Result type for transport operations
pub type Result<T> = std::result::Result<T, TransportError>;

/// Errors that can occur in transport operations
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Frame of {len} bytes exceeds the transport maximum of {max}")]
    Oversize { len: usize, max: usize },

    #[error("Invalid frame: {0}")]
    InvalidFrame(&'static str),

    #[error("Address not representable on this transport")]
    AddressUnsupported,

    #[error("Transport not started")]
    NotStarted,

    #[error("Send timed out")]
    SendTimeout,
}

/// The global broadcast network number
pub const GLOBAL_BROADCAST_NETWORK: u16 = 0xFFFF;

/// A BACnet address: network number plus link-layer MAC.
///
/// An empty MAC together with a nonzero network number is a broadcast on
/// that network.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BacnetAddress {
    pub network: u16,
    pub mac: Vec<u8>,
}

impl BacnetAddress {
    /// Address on the local network
    pub fn local(mac: Vec<u8>) -> Self {
        Self { network: 0, mac }
    }

    /// Address on a remote network, reached through a router
    pub fn remote(network: u16, mac: Vec<u8>) -> Self {
        Self { network, mac }
    }

    /// The global broadcast address
    pub fn global_broadcast() -> Self {
        Self {
            network: GLOBAL_BROADCAST_NETWORK,
            mac: Vec::new(),
        }
    }

    pub fn is_local(&self) -> bool {
        self.network == 0
    }

    pub fn is_broadcast(&self) -> bool {
        self.network == GLOBAL_BROADCAST_NETWORK || self.mac.is_empty()
    }

    /// Build from an IPv4 socket address (6-byte MAC: 4 address + 2 port)
    pub fn from_socket_addr(addr: SocketAddr) -> Result<Self> {
        match addr {
            SocketAddr::V4(v4) => {
                let mut mac = v4.ip().octets().to_vec();
                mac.extend_from_slice(&v4.port().to_be_bytes());
                Ok(Self::local(mac))
            }
            SocketAddr::V6(_) => Err(TransportError::AddressUnsupported),
        }
    }

    /// Interpret the MAC as an IPv4 socket address, if it has that shape
    pub fn to_socket_addr(&self) -> Result<SocketAddr> {
        if self.mac.len() != 6 {
            return Err(TransportError::AddressUnsupported);
        }
        let ip = std::net::Ipv4Addr::new(self.mac[0], self.mac[1], self.mac[2], self.mac[3]);
        let port = u16::from_be_bytes([self.mac[4], self.mac[5]]);
        Ok(SocketAddr::new(ip.into(), port))
    }
}

impl fmt::Display for BacnetAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Ok(addr) = self.to_socket_addr() {
            if self.network == 0 {
                return write!(f, "{}", addr);
            }
            return write!(f, "{}:{}", self.network, addr);
        }
        write!(f, "{}:{}", self.network, hex::encode(&self.mac))
    }
}

impl FromStr for BacnetAddress {
    type Err = TransportError;

    fn from_str(s: &str) -> Result<Self> {
        let addr: SocketAddr = s
            .parse()
            .map_err(|_| TransportError::InvalidFrame("not an ip:port address"))?;
        Self::from_socket_addr(addr)
    }
}

/// Callback receiving each inbound APDU together with its source address.
///
/// Invoked on the transport's receive thread; implementations must be cheap
/// or hand off.
pub type FrameSink = Arc<dyn Fn(Bytes, BacnetAddress) + Send + Sync>;

/// Common interface of all BACnet transports.
pub trait Transport: Send + Sync {
    /// Install the receive callback and start delivering inbound frames.
    fn start(&self, sink: FrameSink) -> Result<()>;

    /// Send one APDU. `expecting_reply` steers the network-layer control
    /// bits; `timeout` bounds the send itself, not any reply.
    fn send(
        &self,
        apdu: &[u8],
        dest: &BacnetAddress,
        expecting_reply: bool,
        timeout: Duration,
    ) -> Result<usize>;

    /// Largest APDU this transport can carry in one frame
    fn max_apdu_length(&self) -> usize;

    /// Bytes of lower-layer headers prepended to each APDU
    fn header_length(&self) -> usize;

    /// The broadcast address of this transport
    fn broadcast_address(&self) -> BacnetAddress;

    /// Block until every queued frame has left the wire, or `timeout`.
    /// Returns false on timeout.
    fn wait_for_transmits_flushed(&self, timeout: Duration) -> bool;

    /// Upper bound on unacknowledged outbound frames, where the link
    /// supports such a notion. Default is to ignore it.
    fn set_max_outstanding_frames(&self, _frames: usize) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn socket_addr_round_trip() {
        let addr: BacnetAddress = "192.168.1.100:47808".parse().unwrap();
        assert!(addr.is_local());
        assert!(!addr.is_broadcast());
        assert_eq!(addr.mac.len(), 6);
        assert_eq!(
            addr.to_socket_addr().unwrap().to_string(),
            "192.168.1.100:47808"
        );
    }

    #[test]
    fn broadcast_classification() {
        assert!(BacnetAddress::global_broadcast().is_broadcast());
        assert!(BacnetAddress::remote(5, vec![]).is_broadcast());
        assert!(!BacnetAddress::remote(5, vec![1]).is_broadcast());
    }

    #[test]
    fn display_formats_ip_macs() {
        let addr: BacnetAddress = "10.0.0.1:47808".parse().unwrap();
        assert_eq!(format!("{}", addr), "10.0.0.1:47808");
        let odd = BacnetAddress::remote(3, vec![0x2A]);
        assert_eq!(format!("{}", odd), "3:2a");
    }
}
