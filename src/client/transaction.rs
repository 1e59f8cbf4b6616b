//! Confirmed-service transaction management.
//!
//! Every confirmed request is correlated with its replies through an invoke
//! id. The [`PendingTable`] owns the id space: allocation walks a wrapping
//! counter and skips ids that still have a live transaction, so at most one
//! transaction per id is outstanding at any time. Reply PDUs are routed to
//! the waiting caller through a per-transaction channel registered in the
//! table; the dispatcher never completes a transaction directly.
//!
//! Matching is by invoke id alone, not by remote address, mirroring the
//! protocol's own 8-bit correlation model: a stale peer replying late onto a
//! reused id can in principle be misattributed. See DESIGN.md.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use log::{debug, warn};

use crate::client::ClientError;
use crate::service::{AbortReason, ErrorClass, ErrorCode, RejectReason};
use crate::transport::{BacnetAddress, Transport};

/// A reply event routed to one pending transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransactionEvent {
    /// Terminal: the request succeeded without payload
    SimpleAck { service_choice: u8 },
    /// Terminal: the request succeeded with a payload
    ComplexAck {
        service_choice: u8,
        service_data: Vec<u8>,
    },
    /// Non-terminal: a segment of the reply arrived; resets the wait
    Segment,
    /// Terminal failures
    Error { class: ErrorClass, code: ErrorCode },
    Abort { reason: AbortReason },
    Reject { reason: RejectReason },
}

/// Successful terminal event of a confirmed request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceAck {
    pub service_choice: u8,
    /// Empty for a simple ack
    pub service_data: Vec<u8>,
    pub simple: bool,
}

/// Registry of outstanding transactions, keyed by invoke id.
pub struct PendingTable {
    entries: Mutex<HashMap<u8, Sender<TransactionEvent>>>,
    next_id: AtomicU8,
}

impl PendingTable {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            next_id: AtomicU8::new(0),
        }
    }

    /// Allocate the next free invoke id and register its event channel.
    pub fn register(&self) -> Result<(u8, Receiver<TransactionEvent>), ClientError> {
        let mut entries = self.entries.lock().expect("pending table poisoned");
        if entries.len() >= 256 {
            return Err(ClientError::InvokeIdExhausted);
        }
        let invoke_id = loop {
            let candidate = self.next_id.fetch_add(1, Ordering::Relaxed);
            if !entries.contains_key(&candidate) {
                break candidate;
            }
        };
        let (tx, rx) = mpsc::channel();
        entries.insert(invoke_id, tx);
        Ok((invoke_id, rx))
    }

    /// Route an event to the transaction with this invoke id. Returns false
    /// when nothing is waiting (stale or unsolicited reply).
    pub fn deliver(&self, invoke_id: u8, event: TransactionEvent) -> bool {
        let mut entries = self.entries.lock().expect("pending table poisoned");
        match entries.get(&invoke_id) {
            Some(sender) => {
                if sender.send(event).is_err() {
                    // Caller stopped waiting but has not dropped yet
                    entries.remove(&invoke_id);
                    false
                } else {
                    true
                }
            }
            None => false,
        }
    }

    pub fn release(&self, invoke_id: u8) {
        self.entries
            .lock()
            .expect("pending table poisoned")
            .remove(&invoke_id);
    }

    #[cfg(test)]
    pub fn is_pending(&self, invoke_id: u8) -> bool {
        self.entries
            .lock()
            .expect("pending table poisoned")
            .contains_key(&invoke_id)
    }
}

impl Default for PendingTable {
    fn default() -> Self {
        Self::new()
    }
}

/// Handle of one in-flight confirmed request.
///
/// Owned exclusively by the calling context. [`wait`](Self::wait) blocks for
/// the terminal event, driving the bounded retry loop; dropping the handle
/// abandons the transaction and unregisters it.
pub struct ConfirmedInvoke {
    pub(crate) transport: Arc<dyn Transport>,
    pub(crate) pending: Arc<PendingTable>,
    pub(crate) address: BacnetAddress,
    pub(crate) invoke_id: u8,
    /// Raw transmit frame; retransmissions resend it byte-identical
    pub(crate) frame: Vec<u8>,
    pub(crate) rx: Receiver<TransactionEvent>,
    pub(crate) timeout: Duration,
    pub(crate) retries: u32,
    pub(crate) transmit_timeout: Duration,
}

impl ConfirmedInvoke {
    /// The invoke id this transaction runs under
    pub fn invoke_id(&self) -> u8 {
        self.invoke_id
    }

    /// Block until the terminal event, retransmitting on timeout until the
    /// retry budget is exhausted.
    ///
    /// Segment-continuation events reset the per-attempt wait without
    /// consuming a retry. Error, abort and reject replies are authoritative
    /// and never retried.
    pub fn wait(self) -> Result<ServiceAck, ClientError> {
        let attempts = self.retries.max(1);
        let mut attempts_left = attempts;
        let mut last_transmit_failure: Option<ClientError> = None;

        loop {
            match self.rx.recv_timeout(self.timeout) {
                Ok(TransactionEvent::Segment) => {
                    // Reply is arriving in segments; keep waiting
                    continue;
                }
                Ok(TransactionEvent::SimpleAck { service_choice }) => {
                    return Ok(ServiceAck {
                        service_choice,
                        service_data: Vec::new(),
                        simple: true,
                    });
                }
                Ok(TransactionEvent::ComplexAck {
                    service_choice,
                    service_data,
                }) => {
                    return Ok(ServiceAck {
                        service_choice,
                        service_data,
                        simple: false,
                    });
                }
                Ok(TransactionEvent::Error { class, code }) => {
                    return Err(ClientError::RemoteError { class, code });
                }
                Ok(TransactionEvent::Abort { reason }) => {
                    return Err(ClientError::RemoteAbort(reason));
                }
                Ok(TransactionEvent::Reject { reason }) => {
                    return Err(ClientError::RemoteReject(reason));
                }
                Err(RecvTimeoutError::Disconnected) => {
                    return Err(ClientError::Timeout { attempts });
                }
                Err(RecvTimeoutError::Timeout) => {
                    attempts_left -= 1;
                    if attempts_left == 0 {
                        return Err(
                            last_transmit_failure.unwrap_or(ClientError::Timeout { attempts })
                        );
                    }
                    debug!(
                        "invoke {} timed out, retransmitting ({} attempts left)",
                        self.invoke_id, attempts_left
                    );
                    match self.transport.send(
                        &self.frame,
                        &self.address,
                        true,
                        self.transmit_timeout,
                    ) {
                        Ok(_) => last_transmit_failure = None,
                        Err(e) => {
                            warn!("retransmit of invoke {} failed: {}", self.invoke_id, e);
                            last_transmit_failure = Some(ClientError::Transmit(e));
                        }
                    }
                }
            }
        }
    }
}

impl Drop for ConfirmedInvoke {
    fn drop(&mut self) {
        self.pending.release(self.invoke_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::testutil::CaptureTransport;
    use std::thread;
    use std::time::Instant;

    fn invoke_with(
        transport: Arc<CaptureTransport>,
        pending: Arc<PendingTable>,
        timeout: Duration,
        retries: u32,
    ) -> ConfirmedInvoke {
        let (invoke_id, rx) = pending.register().unwrap();
        let frame = vec![0x00, 0x05, invoke_id, 0x0C, 0xAA, 0xBB];
        transport
            .send(
                &frame,
                &BacnetAddress::local(vec![1, 2, 3, 4, 0xBA, 0xC0]),
                true,
                timeout,
            )
            .unwrap();
        ConfirmedInvoke {
            transport,
            pending,
            address: BacnetAddress::local(vec![1, 2, 3, 4, 0xBA, 0xC0]),
            invoke_id,
            frame,
            rx,
            timeout,
            retries,
            transmit_timeout: timeout,
        }
    }

    #[test]
    fn allocation_skips_busy_ids() {
        let pending = PendingTable::new();
        let (first, _rx_first) = pending.register().unwrap();
        let (second, _rx_second) = pending.register().unwrap();
        assert_ne!(first, second);

        // Walk the counter all the way around; the busy ids must be skipped
        let mut seen = vec![first, second];
        for _ in 0..254 {
            let (id, rx) = pending.register().unwrap();
            assert!(!seen.contains(&id), "id {} handed out twice", id);
            seen.push(id);
            drop(rx);
        }
        assert!(matches!(
            pending.register(),
            Err(ClientError::InvokeIdExhausted)
        ));
    }

    #[test]
    fn release_frees_the_id() {
        let pending = PendingTable::new();
        let (id, rx) = pending.register().unwrap();
        assert!(pending.is_pending(id));
        drop(rx);
        pending.release(id);
        assert!(!pending.is_pending(id));
    }

    #[test]
    fn deliver_reaches_exactly_the_registered_transaction() {
        let pending = PendingTable::new();
        let (id_a, rx_a) = pending.register().unwrap();
        let (id_b, rx_b) = pending.register().unwrap();

        assert!(pending.deliver(
            id_a,
            TransactionEvent::SimpleAck { service_choice: 15 }
        ));
        assert!(rx_a.try_recv().is_ok());
        assert!(rx_b.try_recv().is_err());

        // Nothing pending under an unused id
        let stray = (0u8..=255)
            .find(|id| *id != id_a && *id != id_b)
            .unwrap();
        assert!(!pending.deliver(stray, TransactionEvent::Segment));
    }

    #[test]
    fn reply_from_any_address_matches_by_invoke_id_only() {
        // The table has no notion of the remote address: this documents the
        // preserved correlation limitation rather than an aspiration.
        let pending = PendingTable::new();
        let (id, rx) = pending.register().unwrap();
        assert!(pending.deliver(
            id,
            TransactionEvent::Abort {
                reason: AbortReason::Other
            }
        ));
        assert_eq!(
            rx.try_recv().unwrap(),
            TransactionEvent::Abort {
                reason: AbortReason::Other
            }
        );
    }

    #[test]
    fn timeout_consumes_the_full_retry_budget() {
        let transport = Arc::new(CaptureTransport::new());
        let pending = Arc::new(PendingTable::new());
        let invoke = invoke_with(
            Arc::clone(&transport),
            Arc::clone(&pending),
            Duration::from_millis(50),
            3,
        );

        let started = Instant::now();
        let result = invoke.wait();
        let elapsed = started.elapsed();

        assert!(matches!(result, Err(ClientError::Timeout { attempts: 3 })));
        // Three attempts of 50ms each, give or take scheduling
        assert!(elapsed >= Duration::from_millis(150));
        // Initial send plus two retransmissions
        assert_eq!(transport.sent_frames().len(), 3);
    }

    #[test]
    fn retransmissions_are_byte_identical() {
        let transport = Arc::new(CaptureTransport::new());
        let pending = Arc::new(PendingTable::new());
        let invoke = invoke_with(
            Arc::clone(&transport),
            Arc::clone(&pending),
            Duration::from_millis(20),
            2,
        );
        let _ = invoke.wait();

        let frames = transport.sent_frames();
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0], frames[1]);
    }

    #[test]
    fn abort_mid_retry_stops_retransmission() {
        let transport = Arc::new(CaptureTransport::new());
        let pending = Arc::new(PendingTable::new());
        let invoke = invoke_with(
            Arc::clone(&transport),
            Arc::clone(&pending),
            Duration::from_millis(200),
            5,
        );
        let id = invoke.invoke_id();

        let deliver_pending = Arc::clone(&pending);
        thread::spawn(move || {
            thread::sleep(Duration::from_millis(30));
            deliver_pending.deliver(
                id,
                TransactionEvent::Abort {
                    reason: AbortReason::SegmentationNotSupported,
                },
            );
        });

        let result = invoke.wait();
        assert!(matches!(
            result,
            Err(ClientError::RemoteAbort(
                AbortReason::SegmentationNotSupported
            ))
        ));
        // No retransmission happened after the abort
        assert_eq!(transport.sent_frames().len(), 1);
    }

    #[test]
    fn segment_events_reset_the_wait_without_consuming_retries() {
        let transport = Arc::new(CaptureTransport::new());
        let pending = Arc::new(PendingTable::new());
        let invoke = invoke_with(
            Arc::clone(&transport),
            Arc::clone(&pending),
            Duration::from_millis(80),
            1,
        );
        let id = invoke.invoke_id();

        // Keep the single attempt alive across several timeouts' worth of
        // wall clock with segment continuations, then complete it.
        let deliver_pending = Arc::clone(&pending);
        thread::spawn(move || {
            for _ in 0..4 {
                thread::sleep(Duration::from_millis(50));
                deliver_pending.deliver(id, TransactionEvent::Segment);
            }
            thread::sleep(Duration::from_millis(50));
            deliver_pending.deliver(
                id,
                TransactionEvent::ComplexAck {
                    service_choice: 12,
                    service_data: vec![1, 2, 3],
                },
            );
        });

        let ack = invoke.wait().unwrap();
        assert!(!ack.simple);
        assert_eq!(ack.service_data, vec![1, 2, 3]);
        assert_eq!(transport.sent_frames().len(), 1);
    }

    #[test]
    fn drop_unregisters_the_transaction() {
        let transport = Arc::new(CaptureTransport::new());
        let pending = Arc::new(PendingTable::new());
        let invoke = invoke_with(
            Arc::clone(&transport),
            Arc::clone(&pending),
            Duration::from_millis(10),
            1,
        );
        let id = invoke.invoke_id();
        assert!(pending.is_pending(id));
        drop(invoke);
        assert!(!pending.is_pending(id));
    }
}
