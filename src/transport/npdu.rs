//! Minimal NPDU (network layer) framing.
//!
//! The IP transport wraps every APDU in an NPDU. This implementation covers
//! what a non-routing device needs: the control octet, optional destination
//! for global/remote broadcasts with a hop count, and skipping the source
//! address of frames that arrived through a router. Network-layer messages
//! (Who-Is-Router-To-Network and friends) are recognized so the receive path
//! can drop them; routing itself is out of scope.

use bitflags::bitflags;

use crate::transport::{BacnetAddress, Result, TransportError, GLOBAL_BROADCAST_NETWORK};

/// Protocol version carried in every NPDU
pub const NPDU_VERSION: u8 = 1;

const DEFAULT_HOP_COUNT: u8 = 255;

bitflags! {
    /// NPDU control octet
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct NpduControl: u8 {
        const NETWORK_MESSAGE = 0x80;
        const DESTINATION_PRESENT = 0x20;
        const SOURCE_PRESENT = 0x08;
        const EXPECTING_REPLY = 0x04;
        // low two bits are the priority
    }
}

/// Network Protocol Data Unit header
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Npdu {
    pub expecting_reply: bool,
    pub priority: u8,
    /// Destination (network, mac); empty mac is a broadcast on that network
    pub destination: Option<(u16, Vec<u8>)>,
    /// Source (network, mac) stamped by a router
    pub source: Option<(u16, Vec<u8>)>,
    pub hop_count: u8,
    /// Set when the frame carries a network-layer message, not an APDU
    pub network_message: Option<u8>,
}

impl Default for Npdu {
    fn default() -> Self {
        Self {
            expecting_reply: false,
            priority: 0,
            destination: None,
            source: None,
            hop_count: DEFAULT_HOP_COUNT,
            network_message: None,
        }
    }
}

impl Npdu {
    /// Header for an APDU addressed to `dest`
    pub fn for_destination(dest: &BacnetAddress, expecting_reply: bool) -> Self {
        let destination = if dest.network == 0 {
            None
        } else {
            Some((dest.network, dest.mac.clone()))
        };
        Self {
            expecting_reply,
            destination,
            ..Self::default()
        }
    }

    /// Header for a global broadcast APDU
    pub fn global_broadcast() -> Self {
        Self {
            destination: Some((GLOBAL_BROADCAST_NETWORK, Vec::new())),
            ..Self::default()
        }
    }

    pub fn is_network_message(&self) -> bool {
        self.network_message.is_some()
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut control = NpduControl::empty();
        control.set(NpduControl::EXPECTING_REPLY, self.expecting_reply);
        control.set(NpduControl::DESTINATION_PRESENT, self.destination.is_some());
        control.set(NpduControl::SOURCE_PRESENT, self.source.is_some());
        control.set(NpduControl::NETWORK_MESSAGE, self.network_message.is_some());

        let mut buffer = vec![NPDU_VERSION, control.bits() | (self.priority & 0x03)];
        if let Some((network, mac)) = &self.destination {
            buffer.extend_from_slice(&network.to_be_bytes());
            buffer.push(mac.len() as u8);
            buffer.extend_from_slice(mac);
        }
        if let Some((network, mac)) = &self.source {
            buffer.extend_from_slice(&network.to_be_bytes());
            buffer.push(mac.len() as u8);
            buffer.extend_from_slice(mac);
        }
        if self.destination.is_some() {
            buffer.push(self.hop_count);
        }
        if let Some(message_type) = self.network_message {
            buffer.push(message_type);
        }
        buffer
    }

    /// Decode a header, returning it together with its length
    pub fn decode(data: &[u8]) -> Result<(Self, usize)> {
        if data.len() < 2 {
            return Err(TransportError::InvalidFrame("npdu too short"));
        }
        if data[0] != NPDU_VERSION {
            return Err(TransportError::InvalidFrame("npdu version"));
        }
        let control = NpduControl::from_bits_truncate(data[1]);
        let priority = data[1] & 0x03;
        let mut pos = 2;

        let mut read_address = |pos: &mut usize| -> Result<(u16, Vec<u8>)> {
            if data.len() < *pos + 3 {
                return Err(TransportError::InvalidFrame("npdu address"));
            }
            let network = u16::from_be_bytes([data[*pos], data[*pos + 1]]);
            let mac_len = data[*pos + 2] as usize;
            *pos += 3;
            if data.len() < *pos + mac_len {
                return Err(TransportError::InvalidFrame("npdu address mac"));
            }
            let mac = data[*pos..*pos + mac_len].to_vec();
            *pos += mac_len;
            Ok((network, mac))
        };

        let destination = if control.contains(NpduControl::DESTINATION_PRESENT) {
            Some(read_address(&mut pos)?)
        } else {
            None
        };
        let source = if control.contains(NpduControl::SOURCE_PRESENT) {
            Some(read_address(&mut pos)?)
        } else {
            None
        };
        let hop_count = if destination.is_some() {
            let hop = *data
                .get(pos)
                .ok_or(TransportError::InvalidFrame("npdu hop count"))?;
            pos += 1;
            hop
        } else {
            DEFAULT_HOP_COUNT
        };
        let network_message = if control.contains(NpduControl::NETWORK_MESSAGE) {
            let message_type = *data
                .get(pos)
                .ok_or(TransportError::InvalidFrame("npdu message type"))?;
            pos += 1;
            Some(message_type)
        } else {
            None
        };

        Ok((
            Self {
                expecting_reply: control.contains(NpduControl::EXPECTING_REPLY),
                priority,
                destination,
                source,
                hop_count,
                network_message,
            },
            pos,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn local_header_is_two_bytes() {
        let npdu = Npdu::for_destination(&BacnetAddress::local(vec![1, 2, 3, 4, 5, 6]), true);
        let encoded = npdu.encode();
        assert_eq!(encoded, vec![0x01, 0x04]);
        let (decoded, consumed) = Npdu::decode(&encoded).unwrap();
        assert_eq!(consumed, 2);
        assert!(decoded.expecting_reply);
        assert!(decoded.destination.is_none());
    }

    #[test]
    fn global_broadcast_round_trip() {
        let npdu = Npdu::global_broadcast();
        let encoded = npdu.encode();
        let (decoded, consumed) = Npdu::decode(&encoded).unwrap();
        assert_eq!(consumed, encoded.len());
        assert_eq!(
            decoded.destination,
            Some((GLOBAL_BROADCAST_NETWORK, Vec::new()))
        );
        assert_eq!(decoded.hop_count, 255);
    }

    #[test]
    fn routed_source_is_skipped_cleanly() {
        let npdu = Npdu {
            source: Some((12, vec![0x2A])),
            ..Npdu::default()
        };
        let encoded = npdu.encode();
        let (decoded, consumed) = Npdu::decode(&encoded).unwrap();
        assert_eq!(consumed, encoded.len());
        assert_eq!(decoded.source, Some((12, vec![0x2A])));
    }

    #[test]
    fn network_messages_are_flagged() {
        let npdu = Npdu {
            network_message: Some(0x00), // Who-Is-Router-To-Network
            ..Npdu::default()
        };
        let encoded = npdu.encode();
        let (decoded, _) = Npdu::decode(&encoded).unwrap();
        assert!(decoded.is_network_message());
    }

    #[test]
    fn wrong_version_is_rejected() {
        assert!(matches!(
            Npdu::decode(&[0x02, 0x00]),
            Err(TransportError::InvalidFrame("npdu version"))
        ));
    }
}
