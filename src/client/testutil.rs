//! In-memory transports and fixtures for engine tests.

use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use bytes::Bytes;

use crate::client::{BacnetClient, ClientConfig, ClientShared};
use crate::transport::{BacnetAddress, FrameSink, Result, Transport};

/// Transport that records every sent frame and never delivers anything.
pub(crate) struct CaptureTransport {
    sent: Mutex<Vec<Vec<u8>>>,
}

impl CaptureTransport {
    pub fn new() -> Self {
        Self {
            sent: Mutex::new(Vec::new()),
        }
    }

    /// Every APDU sent so far, in order
    pub fn sent_frames(&self) -> Vec<Vec<u8>> {
        self.sent.lock().expect("capture poisoned").clone()
    }

    /// A fixed remote address for tests
    pub fn peer() -> BacnetAddress {
        BacnetAddress::local(vec![10, 0, 0, 2, 0xBA, 0xC0])
    }
}

impl Transport for CaptureTransport {
    fn start(&self, _sink: FrameSink) -> Result<()> {
        Ok(())
    }

    fn send(
        &self,
        apdu: &[u8],
        _dest: &BacnetAddress,
        _expecting_reply: bool,
        _timeout: Duration,
    ) -> Result<usize> {
        self.sent
            .lock()
            .expect("capture poisoned")
            .push(apdu.to_vec());
        Ok(apdu.len())
    }

    fn max_apdu_length(&self) -> usize {
        crate::BACNET_MAX_APDU
    }

    fn header_length(&self) -> usize {
        6
    }

    fn broadcast_address(&self) -> BacnetAddress {
        BacnetAddress::global_broadcast()
    }

    fn wait_for_transmits_flushed(&self, _timeout: Duration) -> bool {
        true
    }
}

/// One end of an in-memory transport pair. Sends deliver synchronously into
/// the peer's sink, so whole request/response exchanges complete on the
/// calling thread.
pub(crate) struct LoopbackTransport {
    addr: BacnetAddress,
    sink: Mutex<Option<FrameSink>>,
    peer: Mutex<Weak<LoopbackTransport>>,
}

impl LoopbackTransport {
    pub fn pair() -> (Arc<Self>, Arc<Self>) {
        let a = Arc::new(Self {
            addr: BacnetAddress::local(vec![10, 0, 0, 1, 0xBA, 0xC0]),
            sink: Mutex::new(None),
            peer: Mutex::new(Weak::new()),
        });
        let b = Arc::new(Self {
            addr: BacnetAddress::local(vec![10, 0, 0, 2, 0xBA, 0xC0]),
            sink: Mutex::new(None),
            peer: Mutex::new(Weak::new()),
        });
        *a.peer.lock().expect("loopback poisoned") = Arc::downgrade(&b);
        *b.peer.lock().expect("loopback poisoned") = Arc::downgrade(&a);
        (a, b)
    }

    pub fn address(&self) -> BacnetAddress {
        self.addr.clone()
    }
}

impl Transport for LoopbackTransport {
    fn start(&self, sink: FrameSink) -> Result<()> {
        *self.sink.lock().expect("loopback poisoned") = Some(sink);
        Ok(())
    }

    fn send(
        &self,
        apdu: &[u8],
        _dest: &BacnetAddress,
        _expecting_reply: bool,
        _timeout: Duration,
    ) -> Result<usize> {
        let peer = self.peer.lock().expect("loopback poisoned").upgrade();
        if let Some(peer) = peer {
            let sink = peer.sink.lock().expect("loopback poisoned").clone();
            if let Some(sink) = sink {
                sink(Bytes::copy_from_slice(apdu), self.addr.clone());
            }
        }
        Ok(apdu.len())
    }

    fn max_apdu_length(&self) -> usize {
        crate::BACNET_MAX_APDU
    }

    fn header_length(&self) -> usize {
        6
    }

    fn broadcast_address(&self) -> BacnetAddress {
        BacnetAddress::global_broadcast()
    }

    fn wait_for_transmits_flushed(&self, _timeout: Duration) -> bool {
        true
    }
}

/// Client on a capture transport.
pub(crate) fn test_client_with_config(
    config: ClientConfig,
) -> (BacnetClient, Arc<CaptureTransport>) {
    let transport = Arc::new(CaptureTransport::new());
    let client = BacnetClient::new(
        Arc::clone(&transport) as Arc<dyn Transport>,
        config,
    )
    .expect("test client construction");
    (client, transport)
}

/// Shared engine state on a capture transport, with timeouts short enough
/// for negative tests.
pub(crate) fn test_shared() -> (Arc<ClientShared>, Arc<CaptureTransport>) {
    let config = ClientConfig {
        timeout: Duration::from_millis(500),
        transmit_timeout: Duration::from_millis(500),
        ..ClientConfig::default()
    };
    let (client, transport) = test_client_with_config(config);
    (Arc::clone(client.shared()), transport)
}

/// Two engines joined back to back: (client, server, server address,
/// client address).
pub(crate) fn loopback_pair(
    config: ClientConfig,
) -> (BacnetClient, BacnetClient, BacnetAddress, BacnetAddress) {
    let _ = env_logger::builder().is_test(true).try_init();
    let (client_end, server_end) = LoopbackTransport::pair();
    let client_addr = client_end.address();
    let server_addr = server_end.address();
    let client = BacnetClient::new(client_end as Arc<dyn Transport>, config.clone())
        .expect("client construction");
    let server =
        BacnetClient::new(server_end as Arc<dyn Transport>, config).expect("server construction");
    (client, server, server_addr, client_addr)
}
