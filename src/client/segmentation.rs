//! Send-side segmentation: windowed segmented transmission of oversized
//! responses with ack-driven flow control.
//!
//! The first segment goes out on the caller's thread; a background thread
//! then drives the window loop: send a window's worth of segments, wait for
//! the transport to flush, wait for the segment ack, advance or resend. Per
//! BACnet flow control the very first segment travels alone; its ack
//! establishes the peer's actual window size before full windows are used.
//!
//! Both timeout classes terminate the exchange with a warning and no retry:
//! retrying the top-level request is the transaction manager's business, not
//! this layer's.

use std::collections::HashMap;
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use bytes::Bytes;
use log::{debug, warn};

use crate::apdu::{Apdu, MaxApduSize, MaxSegments};
use crate::client::{ClientError, ClientShared};
use crate::service::{ErrorClass, ErrorCode};
use crate::transport::{BacnetAddress, Transport};

/// A segment ack routed to the sender of a segmented response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SegmentAckNotice {
    pub negative: bool,
    pub sequence_number: u8,
    pub actual_window_size: u8,
}

/// Registry of active segmented senders, keyed by invoke id.
///
/// The dispatcher resolves inbound segment acks directly into the matching
/// sender's channel; there is no shared last-ack slot to race on. Waiters
/// still re-check the acked sequence number after waking.
pub struct SegmentAckTable {
    entries: Mutex<HashMap<u8, Sender<SegmentAckNotice>>>,
}

impl SegmentAckTable {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn register(&self, invoke_id: u8) -> Receiver<SegmentAckNotice> {
        let (tx, rx) = mpsc::channel();
        // A leftover sender for this id belongs to an abandoned exchange;
        // replacing it disconnects that waiter, which then terminates.
        self.entries
            .lock()
            .expect("segment ack table poisoned")
            .insert(invoke_id, tx);
        rx
    }

    /// Route an ack; returns false when no sender is waiting under this id.
    pub fn deliver(&self, invoke_id: u8, notice: SegmentAckNotice) -> bool {
        let entries = self.entries.lock().expect("segment ack table poisoned");
        match entries.get(&invoke_id) {
            Some(sender) => sender.send(notice).is_ok(),
            None => false,
        }
    }

    pub fn release(&self, invoke_id: u8) {
        self.entries
            .lock()
            .expect("segment ack table poisoned")
            .remove(&invoke_id);
    }

    /// Whether a sender is currently registered under this invoke id
    pub fn is_registered(&self, invoke_id: u8) -> bool {
        self.entries
            .lock()
            .expect("segment ack table poisoned")
            .contains_key(&invoke_id)
    }
}

impl Default for SegmentAckTable {
    fn default() -> Self {
        Self::new()
    }
}

/// Send-side segmentation context, derived from the peer's negotiation
/// fields in its confirmed request.
#[derive(Debug, Clone)]
pub struct Segmentation {
    /// Peer's declared ceiling on segment count
    pub max_segments: MaxSegments,
    /// Peer's declared per-frame APDU budget
    pub max_apdu: MaxApduSize,
    /// Window size we propose in outbound segments
    pub proposed_window_size: u8,
    /// Sequence number of the next segment to transmit, wraps mod 256
    pub sequence_number: u8,
}

impl Segmentation {
    pub fn new(max_segments: MaxSegments, max_apdu: MaxApduSize, proposed_window_size: u8) -> Self {
        Self {
            max_segments,
            max_apdu,
            proposed_window_size: proposed_window_size.max(1),
            sequence_number: 0,
        }
    }
}

/// Send a complex ack, segmenting when the payload exceeds one frame.
///
/// Returns once the response (or its first segment) is on the wire. A peer
/// that has not advertised segmentation support (`segmentation` is `None`)
/// gets an `abort-apdu-too-long` error instead of segments it cannot absorb,
/// as does a response that would exceed the peer's declared segment count.
pub(crate) fn send_complex_ack(
    shared: &Arc<ClientShared>,
    address: &BacnetAddress,
    invoke_id: u8,
    service_choice: u8,
    segmentation: Option<Segmentation>,
    payload: Vec<u8>,
) -> Result<(), ClientError> {
    let transport = shared.transport();
    let config = shared.config();
    let frame_budget = transport.max_apdu_length();
    let budget = match &segmentation {
        Some(seg) => frame_budget.min(seg.max_apdu.size()),
        None => frame_budget,
    };

    // Unsegmented first: 3 header bytes ahead of the payload
    if 3 + payload.len() <= budget {
        let apdu = Apdu::ComplexAck {
            segmented: false,
            more_follows: false,
            invoke_id,
            sequence_number: None,
            proposed_window_size: None,
            service_choice,
            service_data: payload,
        };
        transport.send(&apdu.encode(), address, false, config.transmit_timeout)?;
        return Ok(());
    }

    let mut seg = match segmentation {
        Some(seg) => seg,
        None => {
            warn!(
                "response of {} bytes to {} needs segmentation the peer did not offer",
                payload.len(),
                address
            );
            reply_apdu_too_long(shared, address, invoke_id, service_choice);
            return Err(ClientError::ApduTooLong);
        }
    };

    // Segmented header is 5 bytes: type/flags, invoke id, sequence, window,
    // service choice
    let per_segment = budget.saturating_sub(5);
    if per_segment == 0 {
        reply_apdu_too_long(shared, address, invoke_id, service_choice);
        return Err(ClientError::ApduTooLong);
    }
    let count = payload.len().div_ceil(per_segment);
    let over_declared_limit = seg
        .max_segments
        .limit()
        .is_some_and(|limit| count as u32 > limit);
    if over_declared_limit || count > 256 {
        warn!(
            "response to {} would need {} segments, more than the exchange allows",
            address, count
        );
        reply_apdu_too_long(shared, address, invoke_id, service_choice);
        return Err(ClientError::ApduTooLong);
    }

    let payload = Bytes::from(payload);
    let mut chunks = Vec::with_capacity(count);
    let mut offset = 0;
    while offset < payload.len() {
        let end = (offset + per_segment).min(payload.len());
        chunks.push(payload.slice(offset..end));
        offset = end;
    }

    let ack_rx = shared.seg_acks().register(invoke_id);

    // First segment travels alone; its ack opens the window
    if let Err(e) = send_segment(
        transport.as_ref(),
        address,
        invoke_id,
        service_choice,
        &seg,
        &chunks,
        0,
        config.transmit_timeout,
    ) {
        shared.seg_acks().release(invoke_id);
        return Err(e);
    }
    seg.sequence_number = seg.sequence_number.wrapping_add(1);

    let shared_bg = Arc::clone(shared);
    let address = address.clone();
    let ack_timeout = config.timeout;
    let transmit_timeout = config.transmit_timeout;
    let spawned = thread::Builder::new()
        .name(format!("bacnet-seg-tx-{invoke_id}"))
        .spawn(move || {
            run_window_loop(
                &shared_bg,
                &address,
                invoke_id,
                service_choice,
                seg,
                chunks,
                ack_rx,
                ack_timeout,
                transmit_timeout,
            );
            shared_bg.seg_acks().release(invoke_id);
        });
    if let Err(e) = spawned {
        shared.seg_acks().release(invoke_id);
        return Err(ClientError::Transmit(e.into()));
    }

    Ok(())
}

#[allow(clippy::too_many_arguments)]
fn run_window_loop(
    shared: &Arc<ClientShared>,
    address: &BacnetAddress,
    invoke_id: u8,
    service_choice: u8,
    mut seg: Segmentation,
    chunks: Vec<Bytes>,
    ack_rx: Receiver<SegmentAckNotice>,
    ack_timeout: Duration,
    transmit_timeout: Duration,
) {
    let transport = shared.transport();
    let mut window = seg.proposed_window_size as usize;
    let mut base = 0usize; // first unacknowledged segment
    let mut next = 1usize; // segment 0 was sent by the caller

    loop {
        if !transport.wait_for_transmits_flushed(transmit_timeout) {
            warn!(
                "transmit flush timed out during segmented response {} to {}",
                invoke_id, address
            );
            return;
        }
        let notice = match ack_rx.recv_timeout(ack_timeout) {
            Ok(notice) => notice,
            Err(_) => {
                warn!(
                    "segment ack timed out during segmented response {} to {}",
                    invoke_id, address
                );
                return;
            }
        };
        if notice.actual_window_size > 0 {
            window = notice.actual_window_size as usize;
        }
        let expected = ((next - 1) % 256) as u8;
        if notice.negative || notice.sequence_number != expected {
            debug!(
                "peer requested retransmission of response {} (acked {}, expected {})",
                invoke_id, notice.sequence_number, expected
            );
            next = base;
        } else {
            base = next;
            if base == chunks.len() {
                debug!(
                    "segmented response {} to {} complete ({} segments)",
                    invoke_id,
                    address,
                    chunks.len()
                );
                return;
            }
        }

        // The window after segment 0 opens only once that segment is acked
        let window_here = if base == 0 { 1 } else { window };
        while next < chunks.len() && next < base + window_here {
            seg.sequence_number = (next % 256) as u8;
            if let Err(e) = send_segment(
                transport.as_ref(),
                address,
                invoke_id,
                service_choice,
                &seg,
                &chunks,
                next,
                transmit_timeout,
            ) {
                warn!(
                    "segment {} of response {} to {} failed to send: {}",
                    next, invoke_id, address, e
                );
                return;
            }
            seg.sequence_number = seg.sequence_number.wrapping_add(1);
            next += 1;
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn send_segment(
    transport: &dyn Transport,
    address: &BacnetAddress,
    invoke_id: u8,
    service_choice: u8,
    seg: &Segmentation,
    chunks: &[Bytes],
    index: usize,
    transmit_timeout: Duration,
) -> Result<(), ClientError> {
    let apdu = Apdu::ComplexAck {
        segmented: true,
        more_follows: index + 1 < chunks.len(),
        invoke_id,
        sequence_number: Some((index % 256) as u8),
        proposed_window_size: Some(seg.proposed_window_size),
        service_choice,
        service_data: chunks[index].to_vec(),
    };
    transport.send(&apdu.encode(), address, false, transmit_timeout)?;
    Ok(())
}

fn reply_apdu_too_long(
    shared: &Arc<ClientShared>,
    address: &BacnetAddress,
    invoke_id: u8,
    service_choice: u8,
) {
    let apdu = Apdu::Error {
        invoke_id,
        service_choice,
        error_class: u16::from(ErrorClass::Services),
        error_code: u16::from(ErrorCode::AbortApduTooLong),
    };
    let config = shared.config();
    if let Err(e) =
        shared
            .transport()
            .send(&apdu.encode(), address, false, config.transmit_timeout)
    {
        warn!("failed to send apdu-too-long error to {}: {}", address, e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::testutil::{test_shared, CaptureTransport};

    fn ack(sequence_number: u8, window: u8) -> SegmentAckNotice {
        SegmentAckNotice {
            negative: false,
            sequence_number,
            actual_window_size: window,
        }
    }

    fn decoded_segments(transport: &CaptureTransport) -> Vec<(u8, bool, Vec<u8>)> {
        transport
            .sent_frames()
            .iter()
            .filter_map(|frame| match Apdu::decode(frame) {
                Ok(Apdu::ComplexAck {
                    segmented: true,
                    more_follows,
                    sequence_number,
                    service_data,
                    ..
                }) => Some((sequence_number.unwrap(), more_follows, service_data)),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn small_response_goes_out_unsegmented() {
        let (shared, transport) = test_shared();
        let addr = CaptureTransport::peer();
        send_complex_ack(&shared, &addr, 1, 12, None, vec![0xAB; 100]).unwrap();
        let frames = transport.sent_frames();
        assert_eq!(frames.len(), 1);
        assert!(matches!(
            Apdu::decode(&frames[0]).unwrap(),
            Apdu::ComplexAck {
                segmented: false,
                ..
            }
        ));
    }

    #[test]
    fn oversize_without_context_yields_apdu_too_long_error() {
        let (shared, transport) = test_shared();
        let addr = CaptureTransport::peer();
        let payload = vec![0u8; transport.max_apdu_length() + 100];
        let result = send_complex_ack(&shared, &addr, 2, 12, None, payload);
        assert!(matches!(result, Err(ClientError::ApduTooLong)));

        let frames = transport.sent_frames();
        assert_eq!(frames.len(), 1);
        match Apdu::decode(&frames[0]).unwrap() {
            Apdu::Error {
                invoke_id,
                error_class,
                error_code,
                ..
            } => {
                assert_eq!(invoke_id, 2);
                assert_eq!(error_class, u16::from(ErrorClass::Services));
                assert_eq!(error_code, u16::from(ErrorCode::AbortApduTooLong));
            }
            other => panic!("expected error pdu, got {other:?}"),
        }
    }

    #[test]
    fn declared_segment_limit_is_validated_before_sending() {
        let (shared, transport) = test_shared();
        let addr = CaptureTransport::peer();
        // Two segments allowed, but the payload needs far more
        let seg = Segmentation::new(MaxSegments::Two, MaxApduSize::Up50, 2);
        let payload = vec![0u8; 500];
        let result = send_complex_ack(&shared, &addr, 3, 12, Some(seg), payload);
        assert!(matches!(result, Err(ClientError::ApduTooLong)));
        // Only the error reply went out, never a segment
        assert_eq!(decoded_segments(&transport).len(), 0);
    }

    #[test]
    fn window_advances_gapless_under_acks() {
        let (shared, transport) = test_shared();
        let addr = CaptureTransport::peer();

        // 5000-byte response, 480-byte frames, window 2: the scenario splits
        // into ceil(5000 / 475) = 11 segments numbered 0..=10.
        let seg = Segmentation::new(MaxSegments::SixtyFour, MaxApduSize::Up480, 2);
        let payload: Vec<u8> = (0..5000u32).map(|i| i as u8).collect();
        send_complex_ack(&shared, &addr, 4, 12, Some(seg), payload.clone()).unwrap();

        // Ack segment 0, then every window boundary, then the final segment
        let acks = shared.seg_acks();
        assert!(wait_for_segments(&transport, 1));
        assert!(acks.deliver(4, ack(0, 2)));
        for boundary in [2u8, 4, 6, 8, 10] {
            assert!(wait_for_segments(&transport, boundary as usize + 1));
            assert!(acks.deliver(4, ack(boundary, 2)));
        }

        // Sender finished: all 11 segments, sequence numbers without gaps
        assert!(wait_for_done(&shared, 4));
        let segments = decoded_segments(&transport);
        assert_eq!(segments.len(), 11);
        for (index, (sequence, more_follows, _)) in segments.iter().enumerate() {
            assert_eq!(*sequence, index as u8);
            assert_eq!(*more_follows, index < 10);
        }
        let reassembled: Vec<u8> = segments
            .iter()
            .flat_map(|(_, _, data)| data.clone())
            .collect();
        assert_eq!(reassembled, payload);
    }

    #[test]
    fn mismatched_ack_resends_the_window_without_advancing() {
        let (shared, transport) = test_shared();
        let addr = CaptureTransport::peer();
        let seg = Segmentation::new(MaxSegments::SixtyFour, MaxApduSize::Up50, 2);
        // 45-byte budget per segment, 100 bytes -> 3 segments
        let payload = vec![0x55u8; 100];
        send_complex_ack(&shared, &addr, 5, 12, Some(seg), payload).unwrap();

        let acks = shared.seg_acks();
        assert!(wait_for_segments(&transport, 1));
        assert!(acks.deliver(5, ack(0, 2)));
        // Segments 1 and 2 go out; answer with a stale ack for 0
        assert!(wait_for_segments(&transport, 3));
        assert!(acks.deliver(5, ack(0, 2)));
        // The window must be resent: segments 1 and 2 again
        assert!(wait_for_segments(&transport, 5));
        assert!(acks.deliver(5, ack(2, 2)));
        assert!(wait_for_done(&shared, 5));

        let sequences: Vec<u8> = decoded_segments(&transport)
            .iter()
            .map(|(sequence, _, _)| *sequence)
            .collect();
        assert_eq!(sequences, vec![0, 1, 2, 1, 2]);
    }

    #[test]
    fn ack_timeout_terminates_the_exchange() {
        let (shared, transport) = test_shared();
        let addr = CaptureTransport::peer();
        let seg = Segmentation::new(MaxSegments::SixtyFour, MaxApduSize::Up50, 1);
        send_complex_ack(&shared, &addr, 6, 12, Some(seg), vec![0u8; 100]).unwrap();

        // Never ack; the background sender must give up on its own
        assert!(wait_for_done(&shared, 6));
        assert_eq!(decoded_segments(&transport).len(), 1);
    }

    fn wait_for_segments(transport: &CaptureTransport, count: usize) -> bool {
        for _ in 0..200 {
            if transport
                .sent_frames()
                .iter()
                .filter(|frame| {
                    matches!(
                        Apdu::decode(frame),
                        Ok(Apdu::ComplexAck {
                            segmented: true,
                            ..
                        })
                    )
                })
                .count()
                >= count
            {
                return true;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        false
    }

    fn wait_for_done(shared: &Arc<ClientShared>, invoke_id: u8) -> bool {
        // The background sender unregisters its ack channel when it stops
        for _ in 0..400 {
            if !shared.seg_acks().is_registered(invoke_id) {
                return true;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        false
    }
}
