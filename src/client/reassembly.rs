//! Receive-side segmentation: reassembly of inbound segment streams.
//!
//! One reassembly slot exists per invoke-id value: a fixed array of 256
//! mutexes owned by the client for its lifetime, so per-id serialization
//! costs no allocation and cannot grow without bound. Segments accumulate in
//! a sequence-keyed map (arrival order is irrelevant); the expected total is
//! unknown until the segment without the more-follows flag arrives. On
//! completion the original unsegmented header is re-synthesized, the payload
//! concatenated in sequence order, and the whole frame fed back through
//! normal PDU-type dispatch.
//!
//! Acks go out per window: every segment whose sequence number is a multiple
//! of the window size, and always the final one. The advertised window is
//! the sender's proposed value unless configuration forces a local one.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use log::{debug, warn};

use crate::apdu::{Apdu, MaxApduSize, MaxSegments};
use crate::client::dispatch;
use crate::client::transaction::TransactionEvent;
use crate::client::ClientShared;
use crate::transport::{BacnetAddress, Transport};

/// Which segmented PDU type a segment belongs to. The confirmed-request
/// variant carries the header fields needed to re-synthesize the original
/// unsegmented header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SegmentKind {
    ConfirmedRequest {
        segmented_response_accepted: bool,
        max_segments: MaxSegments,
        max_response_size: MaxApduSize,
    },
    ComplexAck,
}

/// One inbound segment, as extracted by the dispatcher.
#[derive(Debug, Clone)]
pub(crate) struct InboundSegment {
    pub kind: SegmentKind,
    pub invoke_id: u8,
    pub sequence_number: u8,
    pub proposed_window_size: u8,
    pub more_follows: bool,
    pub service_choice: u8,
    pub data: Vec<u8>,
}

/// In-progress reassembly of one segmented exchange.
#[derive(Debug)]
struct Reassembly {
    kind: SegmentKind,
    service_choice: u8,
    source: BacnetAddress,
    /// Sequence-keyed payloads; map order is reassembly order
    segments: BTreeMap<u8, Vec<u8>>,
    /// Total segment count, known once the final segment has arrived
    expected: Option<u16>,
}

impl Reassembly {
    fn new(segment: &InboundSegment, source: BacnetAddress) -> Self {
        Self {
            kind: segment.kind,
            service_choice: segment.service_choice,
            source,
            segments: BTreeMap::new(),
            expected: None,
        }
    }
}

/// Fixed arena of reassembly slots, one per invoke-id value.
pub struct ReassemblyTable {
    slots: Vec<Mutex<Option<Reassembly>>>,
}

impl ReassemblyTable {
    pub fn new() -> Self {
        Self {
            slots: (0..256).map(|_| Mutex::new(None)).collect(),
        }
    }

    fn slot(&self, invoke_id: u8) -> &Mutex<Option<Reassembly>> {
        &self.slots[invoke_id as usize]
    }

    /// Number of exchanges currently being reassembled
    pub fn active_count(&self) -> usize {
        self.slots
            .iter()
            .filter(|slot| slot.lock().map(|s| s.is_some()).unwrap_or(false))
            .count()
    }
}

impl Default for ReassemblyTable {
    fn default() -> Self {
        Self::new()
    }
}

/// Process one inbound segment: notify the raw observer, keep the pending
/// transaction alive, ack per window, accumulate, and on completion feed the
/// reconstituted frame back through dispatch.
pub(crate) fn receive_segment(
    shared: &Arc<ClientShared>,
    segment: InboundSegment,
    source: BacnetAddress,
) {
    let handlers = shared.handlers_snapshot();
    if let Some(observer) = &handlers.on_segment {
        observer(
            &source,
            segment.invoke_id,
            segment.sequence_number,
            segment.more_follows,
            &segment.data,
        );
    }

    // A segment of a reply keeps the waiting transaction from timing out
    if segment.kind == SegmentKind::ComplexAck {
        shared
            .pending()
            .deliver(segment.invoke_id, TransactionEvent::Segment);
    }

    let config = shared.config();
    let window = config
        .force_window_size
        .unwrap_or(segment.proposed_window_size)
        .max(1);
    if segment.sequence_number % window == 0 || !segment.more_follows {
        let ack = Apdu::SegmentAck {
            negative: false,
            server: matches!(segment.kind, SegmentKind::ConfirmedRequest { .. }),
            invoke_id: segment.invoke_id,
            sequence_number: segment.sequence_number,
            actual_window_size: window,
        };
        if let Err(e) =
            shared
                .transport()
                .send(&ack.encode(), &source, false, config.transmit_timeout)
        {
            warn!(
                "failed to ack segment {} of invoke {} to {}: {}",
                segment.sequence_number, segment.invoke_id, source, e
            );
        }
    }

    if !config.default_segmentation_handling {
        // The observer has the segments; nothing to assemble here
        return;
    }

    let completed = {
        let mut slot = shared
            .reassembly()
            .slot(segment.invoke_id)
            .lock()
            .expect("reassembly slot poisoned");

        let restart = match slot.as_ref() {
            // A second sequence-0 segment means the id was reused for a new
            // exchange; out-of-order arrival of a first segment does not
            Some(state) => segment.sequence_number == 0 && state.segments.contains_key(&0),
            None => true,
        };
        if restart {
            if let Some(stale) = slot.take() {
                debug!(
                    "discarding stale reassembly for invoke {} ({} segments)",
                    segment.invoke_id,
                    stale.segments.len()
                );
            }
            *slot = Some(Reassembly::new(&segment, source.clone()));
        }
        let state = slot.as_mut().expect("slot populated above");

        // Duplicates keep the first payload and must not advance completion
        state
            .segments
            .entry(segment.sequence_number)
            .or_insert(segment.data);
        if !segment.more_follows {
            state.expected = Some(segment.sequence_number as u16 + 1);
        }

        let complete =
            matches!(state.expected, Some(total) if state.segments.len() as u16 == total);
        if complete {
            slot.take()
        } else {
            None
        }
    };

    if let Some(state) = completed {
        debug!(
            "reassembled invoke {} from {} segments",
            segment.invoke_id,
            state.segments.len()
        );
        let data: Vec<u8> = state.segments.into_values().flatten().collect();
        let apdu = match state.kind {
            SegmentKind::ConfirmedRequest {
                segmented_response_accepted,
                max_segments,
                max_response_size,
            } => Apdu::ConfirmedRequest {
                segmented: false,
                more_follows: false,
                segmented_response_accepted,
                max_segments,
                max_response_size,
                invoke_id: segment.invoke_id,
                sequence_number: None,
                proposed_window_size: None,
                service_choice: state.service_choice,
                service_data: data,
            },
            SegmentKind::ComplexAck => Apdu::ComplexAck {
                segmented: false,
                more_follows: false,
                invoke_id: segment.invoke_id,
                sequence_number: None,
                proposed_window_size: None,
                service_choice: state.service_choice,
                service_data: data,
            },
        };
        dispatch::on_frame(shared, &apdu.encode(), state.source);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::testutil::{test_client_with_config, CaptureTransport};
    use crate::client::ClientConfig;
    use proptest::prelude::*;
    use std::sync::mpsc;

    fn segment_frame(invoke_id: u8, sequence: u8, more: bool, window: u8, data: &[u8]) -> Vec<u8> {
        Apdu::ConfirmedRequest {
            segmented: true,
            more_follows: more,
            segmented_response_accepted: true,
            max_segments: MaxSegments::SixtyFour,
            max_response_size: MaxApduSize::Up480,
            invoke_id,
            sequence_number: Some(sequence),
            proposed_window_size: Some(window),
            service_choice: 15, // WriteProperty
            service_data: data.to_vec(),
        }
        .encode()
    }

    /// Client whose raw confirmed handler forwards reconstituted payloads
    fn capture_client(
        config: ClientConfig,
    ) -> (
        crate::client::BacnetClient,
        Arc<CaptureTransport>,
        mpsc::Receiver<Vec<u8>>,
    ) {
        let (client, transport) = test_client_with_config(config);
        let (tx, rx) = mpsc::channel();
        client.set_raw_confirmed_handler(move |_, _, data| {
            let _ = tx.send(data.to_vec());
            Ok(())
        });
        (client, transport, rx)
    }

    fn acks_sent(transport: &CaptureTransport) -> Vec<(u8, u8)> {
        transport
            .sent_frames()
            .iter()
            .filter_map(|frame| match Apdu::decode(frame) {
                Ok(Apdu::SegmentAck {
                    sequence_number,
                    actual_window_size,
                    ..
                }) => Some((sequence_number, actual_window_size)),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn out_of_order_segments_reassemble_in_order() {
        let (client, _transport, rx) = capture_client(ClientConfig::default());
        let source = CaptureTransport::peer();

        for sequence in [2u8, 0, 1] {
            let more = sequence != 2;
            dispatch::on_frame(
                client.shared(),
                &segment_frame(7, sequence, more, 4, &[sequence; 3]),
                source.clone(),
            );
        }

        let payload = rx.try_recv().expect("reassembly should have completed");
        assert_eq!(payload, vec![0, 0, 0, 1, 1, 1, 2, 2, 2]);
        assert_eq!(client.shared().reassembly().active_count(), 0);
    }

    #[test]
    fn duplicate_segment_does_not_complete_early() {
        let (client, _transport, rx) = capture_client(ClientConfig::default());
        let source = CaptureTransport::peer();

        // Three segments expected; a duplicate of 0 must not count as the
        // missing segment 1
        dispatch::on_frame(client.shared(), &segment_frame(9, 0, true, 4, b"aa"), source.clone());
        dispatch::on_frame(client.shared(), &segment_frame(9, 2, false, 4, b"cc"), source.clone());
        dispatch::on_frame(client.shared(), &segment_frame(9, 2, false, 4, b"cc"), source.clone());
        assert!(rx.try_recv().is_err());

        dispatch::on_frame(client.shared(), &segment_frame(9, 1, true, 4, b"bb"), source.clone());
        assert_eq!(rx.try_recv().unwrap(), b"aabbcc".to_vec());
    }

    #[test]
    fn acks_follow_the_window_and_the_final_segment() {
        let (client, transport, _rx) = capture_client(ClientConfig::default());
        let source = CaptureTransport::peer();

        // Six segments, proposed window 4: acks at 0, 4, and the final 5
        for sequence in 0u8..6 {
            let more = sequence != 5;
            dispatch::on_frame(
                client.shared(),
                &segment_frame(11, sequence, more, 4, &[sequence]),
                source.clone(),
            );
        }
        assert_eq!(acks_sent(&transport), vec![(0, 4), (4, 4), (5, 4)]);
    }

    #[test]
    fn forced_window_size_is_advertised_instead() {
        let config = ClientConfig {
            force_window_size: Some(1),
            ..ClientConfig::default()
        };
        let (client, transport, _rx) = capture_client(config);
        let source = CaptureTransport::peer();

        for sequence in 0u8..3 {
            let more = sequence != 2;
            dispatch::on_frame(
                client.shared(),
                &segment_frame(12, sequence, more, 8, &[sequence]),
                source.clone(),
            );
        }
        // Window 1 forces an ack for every segment, advertising 1
        assert_eq!(acks_sent(&transport), vec![(0, 1), (1, 1), (2, 1)]);
    }

    #[test]
    fn sequence_zero_restarts_an_abandoned_exchange() {
        let (client, _transport, rx) = capture_client(ClientConfig::default());
        let source = CaptureTransport::peer();

        // An exchange that never finishes occupies the slot
        dispatch::on_frame(client.shared(), &segment_frame(13, 0, true, 4, b"zz"), source.clone());
        assert_eq!(client.shared().reassembly().active_count(), 1);

        // The id is reused: a fresh sequence 0 replaces the stale state
        dispatch::on_frame(client.shared(), &segment_frame(13, 0, true, 4, b"AA"), source.clone());
        dispatch::on_frame(client.shared(), &segment_frame(13, 1, false, 4, b"BB"), source.clone());
        assert_eq!(rx.try_recv().unwrap(), b"AABB".to_vec());
    }

    #[test]
    fn disabled_default_reassembly_only_feeds_the_observer() {
        let config = ClientConfig {
            default_segmentation_handling: false,
            ..ClientConfig::default()
        };
        let (client, transport) = test_client_with_config(config);
        let (tx, rx) = mpsc::channel();
        client.set_segment_observer(move |_, _, sequence, _, _| {
            let _ = tx.send(sequence);
        });
        let source = CaptureTransport::peer();

        dispatch::on_frame(client.shared(), &segment_frame(14, 0, true, 4, b"xx"), source.clone());
        dispatch::on_frame(client.shared(), &segment_frame(14, 1, false, 4, b"yy"), source.clone());

        assert_eq!(rx.try_recv().unwrap(), 0);
        assert_eq!(rx.try_recv().unwrap(), 1);
        // Nothing was assembled, but acks still went out
        assert_eq!(client.shared().reassembly().active_count(), 0);
        assert_eq!(acks_sent(&transport).len(), 2);
    }

    proptest! {
        #[test]
        fn reassembly_is_order_independent(
            order in Just((0u8..8).collect::<Vec<_>>()).prop_shuffle()
        ) {
            let (client, _transport, rx) = capture_client(ClientConfig::default());
            let source = CaptureTransport::peer();
            for &sequence in &order {
                let more = sequence != 7;
                dispatch::on_frame(
                    client.shared(),
                    &segment_frame(21, sequence, more, 4, &[sequence; 2]),
                    source.clone(),
                );
            }
            let payload = rx.try_recv().expect("all eight segments were delivered");
            let expected: Vec<u8> = (0u8..8).flat_map(|s| [s, s]).collect();
            prop_assert_eq!(payload, expected);
        }
    }
}
