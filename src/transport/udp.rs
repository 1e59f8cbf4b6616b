//! BACnet/IP transport (ASHRAE 135 Annex J).
//!
//! UDP on port 47808, with BVLC (BACnet Virtual Link Control) framing.
//! Inbound frames are unwrapped (BVLC, then NPDU) on a dedicated receive
//! thread and handed to the engine's sink as bare APDUs; network-layer
//! messages and BVLC control functions are consumed here and never reach the
//! engine.

use std::net::{Ipv4Addr, SocketAddr, ToSocketAddrs, UdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use bytes::Bytes;
use log::{debug, trace, warn};
use socket2::{Domain, Protocol, Socket, Type};

use crate::transport::npdu::Npdu;
use crate::transport::{BacnetAddress, FrameSink, Result, Transport, TransportError};

/// BACnet/IP well-known port number (0xBAC0)
pub const BACNET_IP_PORT: u16 = 47808;

/// Maximum BVLL frame length
pub const MAX_BVLL_LENGTH: usize = 1497;

/// BVLL header size
pub const BVLL_HEADER_SIZE: usize = 4;

const BVLL_TYPE_BACNET_IP: u8 = 0x81;

/// BVLC function codes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum BvlcFunction {
    Result = 0x00,
    WriteBroadcastDistributionTable = 0x01,
    ReadBroadcastDistributionTable = 0x02,
    ReadBroadcastDistributionTableAck = 0x03,
    ForwardedNpdu = 0x04,
    RegisterForeignDevice = 0x05,
    ReadForeignDeviceTable = 0x06,
    ReadForeignDeviceTableAck = 0x07,
    DeleteForeignDeviceTableEntry = 0x08,
    DistributeBroadcastToNetwork = 0x09,
    OriginalUnicastNpdu = 0x0A,
    OriginalBroadcastNpdu = 0x0B,
    SecureBvll = 0x0C,
}

impl TryFrom<u8> for BvlcFunction {
    type Error = TransportError;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0x00 => Ok(Self::Result),
            0x01 => Ok(Self::WriteBroadcastDistributionTable),
            0x02 => Ok(Self::ReadBroadcastDistributionTable),
            0x03 => Ok(Self::ReadBroadcastDistributionTableAck),
            0x04 => Ok(Self::ForwardedNpdu),
            0x05 => Ok(Self::RegisterForeignDevice),
            0x06 => Ok(Self::ReadForeignDeviceTable),
            0x07 => Ok(Self::ReadForeignDeviceTableAck),
            0x08 => Ok(Self::DeleteForeignDeviceTableEntry),
            0x09 => Ok(Self::DistributeBroadcastToNetwork),
            0x0A => Ok(Self::OriginalUnicastNpdu),
            0x0B => Ok(Self::OriginalBroadcastNpdu),
            0x0C => Ok(Self::SecureBvll),
            _ => Err(TransportError::InvalidFrame("bvlc function")),
        }
    }
}

/// BVLC header
#[derive(Debug, Clone, Copy)]
pub struct BvlcHeader {
    pub function: BvlcFunction,
    pub length: u16,
}

impl BvlcHeader {
    pub fn new(function: BvlcFunction, length: u16) -> Self {
        Self { function, length }
    }

    pub fn encode(&self) -> [u8; BVLL_HEADER_SIZE] {
        [
            BVLL_TYPE_BACNET_IP,
            self.function as u8,
            (self.length >> 8) as u8,
            (self.length & 0xFF) as u8,
        ]
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        if data.len() < BVLL_HEADER_SIZE {
            return Err(TransportError::InvalidFrame("bvlc header too short"));
        }
        if data[0] != BVLL_TYPE_BACNET_IP {
            return Err(TransportError::InvalidFrame("bvlc type"));
        }
        Ok(Self {
            function: BvlcFunction::try_from(data[1])?,
            length: u16::from_be_bytes([data[2], data[3]]),
        })
    }
}

/// BACnet/IP transport over a UDP socket.
pub struct BacnetIpTransport {
    socket: UdpSocket,
    local_addr: SocketAddr,
    broadcast_addr: SocketAddr,
    send_lock: Mutex<()>,
    running: Arc<AtomicBool>,
    receiver: Mutex<Option<thread::JoinHandle<()>>>,
}

impl BacnetIpTransport {
    /// Bind to the given local address (usually `0.0.0.0:47808`).
    pub fn bind<A: ToSocketAddrs>(bind_addr: A) -> Result<Self> {
        let bind_addr = bind_addr
            .to_socket_addrs()?
            .next()
            .ok_or(TransportError::AddressUnsupported)?;
        let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
        socket.set_reuse_address(true)?;
        socket.set_broadcast(true)?;
        socket.bind(&bind_addr.into())?;
        let socket: UdpSocket = socket.into();
        socket.set_read_timeout(Some(Duration::from_millis(200)))?;
        let local_addr = socket.local_addr()?;
        let broadcast_addr = Self::subnet_broadcast(local_addr);
        debug!(
            "bacnet/ip transport bound to {} (broadcast {})",
            local_addr, broadcast_addr
        );
        Ok(Self {
            socket,
            local_addr,
            broadcast_addr,
            send_lock: Mutex::new(()),
            running: Arc::new(AtomicBool::new(false)),
            receiver: Mutex::new(None),
        })
    }

    /// Local bind address of the socket
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Directed broadcast address of the interface we are bound to.
    ///
    /// Derived from the interface netmask; falls back to the limited
    /// broadcast address when the interface cannot be identified.
    fn subnet_broadcast(local: SocketAddr) -> SocketAddr {
        let port = if local.port() == 0 {
            BACNET_IP_PORT
        } else {
            local.port()
        };
        let local_ip = match local {
            SocketAddr::V4(v4) => *v4.ip(),
            SocketAddr::V6(_) => return SocketAddr::new(Ipv4Addr::BROADCAST.into(), port),
        };
        let interfaces = if_addrs::get_if_addrs().unwrap_or_default();
        for interface in interfaces {
            if let if_addrs::IfAddr::V4(ref v4) = interface.addr {
                let matches_bound_ip = v4.ip == local_ip;
                let usable_any = local_ip.is_unspecified() && !interface.is_loopback();
                if matches_bound_ip || usable_any {
                    if let Some(broadcast) = v4.broadcast {
                        return SocketAddr::new(broadcast.into(), port);
                    }
                }
            }
        }
        SocketAddr::new(Ipv4Addr::BROADCAST.into(), port)
    }

    fn receive_loop(socket: UdpSocket, running: Arc<AtomicBool>, sink: FrameSink) {
        let mut buffer = [0u8; MAX_BVLL_LENGTH + 3];
        while running.load(Ordering::Relaxed) {
            let (len, source) = match socket.recv_from(&mut buffer) {
                Ok(received) => received,
                Err(e)
                    if e.kind() == std::io::ErrorKind::WouldBlock
                        || e.kind() == std::io::ErrorKind::TimedOut =>
                {
                    continue;
                }
                Err(e) => {
                    warn!("bacnet/ip receive failed: {}", e);
                    continue;
                }
            };
            if let Err(e) = Self::deliver(&buffer[..len], source, &sink) {
                debug!("dropping frame from {}: {}", source, e);
            }
        }
    }

    fn deliver(frame: &[u8], udp_source: SocketAddr, sink: &FrameSink) -> Result<()> {
        let header = BvlcHeader::decode(frame)?;
        if frame.len() != header.length as usize {
            return Err(TransportError::InvalidFrame("bvlc length mismatch"));
        }
        let (npdu_start, source) = match header.function {
            BvlcFunction::OriginalUnicastNpdu | BvlcFunction::OriginalBroadcastNpdu => {
                (BVLL_HEADER_SIZE, BacnetAddress::from_socket_addr(udp_source)?)
            }
            BvlcFunction::ForwardedNpdu => {
                // Original source rides in six bytes after the header
                if frame.len() < BVLL_HEADER_SIZE + 6 {
                    return Err(TransportError::InvalidFrame("forwarded npdu too short"));
                }
                let mac = frame[BVLL_HEADER_SIZE..BVLL_HEADER_SIZE + 6].to_vec();
                (BVLL_HEADER_SIZE + 6, BacnetAddress::local(mac))
            }
            other => {
                trace!("ignoring bvlc function {:?} from {}", other, udp_source);
                return Ok(());
            }
        };

        let (npdu, consumed) = Npdu::decode(&frame[npdu_start..])?;
        if npdu.is_network_message() {
            trace!(
                "ignoring network-layer message {:?} from {}",
                npdu.network_message,
                udp_source
            );
            return Ok(());
        }
        if let Some((network, mac)) = &npdu.source {
            trace!(
                "frame from {} was routed for {}:{}",
                udp_source,
                network,
                hex::encode(mac)
            );
        }
        let apdu = &frame[npdu_start + consumed..];
        if apdu.is_empty() {
            return Err(TransportError::InvalidFrame("empty apdu"));
        }
        trace!("rx {} bytes from {}: {}", apdu.len(), source, hex::encode(apdu));
        sink(Bytes::copy_from_slice(apdu), source);
        Ok(())
    }
}

impl Transport for BacnetIpTransport {
    fn start(&self, sink: FrameSink) -> Result<()> {
        let mut receiver = self.receiver.lock().expect("receiver lock poisoned");
        if receiver.is_some() {
            return Ok(());
        }
        self.running.store(true, Ordering::Relaxed);
        let socket = self.socket.try_clone()?;
        let running = Arc::clone(&self.running);
        let handle = thread::Builder::new()
            .name("bacnet-ip-rx".into())
            .spawn(move || Self::receive_loop(socket, running, sink))?;
        *receiver = Some(handle);
        Ok(())
    }

    fn send(
        &self,
        apdu: &[u8],
        dest: &BacnetAddress,
        expecting_reply: bool,
        timeout: Duration,
    ) -> Result<usize> {
        let broadcast = dest.is_broadcast();
        let npdu = if dest.network == crate::transport::GLOBAL_BROADCAST_NETWORK {
            Npdu::global_broadcast()
        } else {
            Npdu::for_destination(dest, expecting_reply)
        };
        let npdu_bytes = npdu.encode();

        let total = BVLL_HEADER_SIZE + npdu_bytes.len() + apdu.len();
        if total > MAX_BVLL_LENGTH {
            return Err(TransportError::Oversize {
                len: total,
                max: MAX_BVLL_LENGTH,
            });
        }

        let function = if broadcast {
            BvlcFunction::OriginalBroadcastNpdu
        } else {
            BvlcFunction::OriginalUnicastNpdu
        };
        let mut frame = Vec::with_capacity(total);
        frame.extend_from_slice(&BvlcHeader::new(function, total as u16).encode());
        frame.extend_from_slice(&npdu_bytes);
        frame.extend_from_slice(apdu);

        let target = if broadcast {
            self.broadcast_addr
        } else {
            dest.to_socket_addr()?
        };

        let _guard = self.send_lock.lock().expect("send lock poisoned");
        self.socket.set_write_timeout(Some(timeout))?;
        trace!("tx {} bytes to {}", frame.len(), target);
        let sent = self.socket.send_to(&frame, target).map_err(|e| {
            if e.kind() == std::io::ErrorKind::WouldBlock || e.kind() == std::io::ErrorKind::TimedOut
            {
                TransportError::SendTimeout
            } else {
                TransportError::Io(e)
            }
        })?;
        Ok(sent)
    }

    fn max_apdu_length(&self) -> usize {
        crate::BACNET_MAX_APDU
    }

    fn header_length(&self) -> usize {
        // BVLC plus a locally-addressed NPDU
        BVLL_HEADER_SIZE + 2
    }

    fn broadcast_address(&self) -> BacnetAddress {
        BacnetAddress::global_broadcast()
    }

    fn wait_for_transmits_flushed(&self, _timeout: Duration) -> bool {
        // UDP sends complete synchronously in send()
        true
    }
}

impl Drop for BacnetIpTransport {
    fn drop(&mut self) {
        self.running.store(false, Ordering::Relaxed);
        if let Some(handle) = self.receiver.lock().ok().and_then(|mut r| r.take()) {
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;

    #[test]
    fn bvlc_header_round_trip() {
        let header = BvlcHeader::new(BvlcFunction::OriginalUnicastNpdu, 1024);
        let encoded = header.encode();
        assert_eq!(encoded, [0x81, 0x0A, 0x04, 0x00]);
        let decoded = BvlcHeader::decode(&encoded).unwrap();
        assert_eq!(decoded.function, BvlcFunction::OriginalUnicastNpdu);
        assert_eq!(decoded.length, 1024);
    }

    #[test]
    fn unknown_bvlc_type_is_rejected() {
        assert!(matches!(
            BvlcHeader::decode(&[0x82, 0x0A, 0x00, 0x04]),
            Err(TransportError::InvalidFrame("bvlc type"))
        ));
    }

    #[test]
    fn loopback_send_delivers_apdu_and_source() {
        let a = BacnetIpTransport::bind("127.0.0.1:0").unwrap();
        let b = BacnetIpTransport::bind("127.0.0.1:0").unwrap();

        let (tx, rx) = mpsc::channel();
        b.start(Arc::new(move |apdu: Bytes, source: BacnetAddress| {
            let _ = tx.send((apdu.to_vec(), source));
        }))
        .unwrap();

        let dest = BacnetAddress::from_socket_addr(b.local_addr()).unwrap();
        let apdu = vec![0x10, 0x08]; // unconfirmed Who-Is
        a.send(&apdu, &dest, false, Duration::from_secs(1)).unwrap();

        let (received, source) = rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert_eq!(received, apdu);
        assert_eq!(source.to_socket_addr().unwrap(), a.local_addr());
    }

    #[test]
    fn oversize_frame_is_refused() {
        let a = BacnetIpTransport::bind("127.0.0.1:0").unwrap();
        let dest = BacnetAddress::from_socket_addr(a.local_addr()).unwrap();
        let apdu = vec![0u8; MAX_BVLL_LENGTH];
        assert!(matches!(
            a.send(&apdu, &dest, false, Duration::from_secs(1)),
            Err(TransportError::Oversize { .. })
        ));
    }
}
