//! PDU-type dispatch.
//!
//! Every inbound APDU passes through [`on_frame`] exactly once: classified by
//! PDU type, stripped of its header, and routed to one handler. Segmented
//! confirmed requests and complex acks divert to the segmentation receiver;
//! reply PDUs route to the pending-transaction table; segment acks route to
//! the active segmented sender.
//!
//! Nothing on this path is allowed to escape as a panic-shaped failure
//! toward the transport thread: malformed confirmed requests are answered
//! with a reject or error so the remote peer never hangs waiting, and every
//! drop is logged.

use std::sync::Arc;

use log::{debug, trace, warn};

use crate::apdu::{Apdu, MaxApduSize, MaxSegments};
use crate::client::reassembly::{self, InboundSegment, SegmentKind};
use crate::client::segmentation::SegmentAckNotice;
use crate::client::transaction::TransactionEvent;
use crate::client::{
    BacnetClient, ClientShared, HandlerResult, RequestContext, SegmentationNegotiation,
};
use crate::service::{
    AbortReason, ConfirmedServiceChoice, CovNotification, ErrorClass, ErrorCode, RejectReason,
    ServiceError, TimeSynchronizationRequest, UnconfirmedServiceChoice, WhoIsRequest,
};
use crate::transport::{BacnetAddress, Transport};

/// Route one inbound APDU. Called from the transport receive thread and from
/// the segmentation receiver with reconstituted frames.
pub(crate) fn on_frame(shared: &Arc<ClientShared>, frame: &[u8], source: BacnetAddress) {
    let apdu = match Apdu::decode(frame) {
        Ok(apdu) => apdu,
        Err(e) => {
            warn!(
                "undecodable apdu from {}: {} ({})",
                source,
                e,
                hex::encode(frame)
            );
            return;
        }
    };
    trace!("dispatching {:?} from {}", apdu.apdu_type(), source);

    match apdu {
        Apdu::ConfirmedRequest {
            segmented: true,
            more_follows,
            segmented_response_accepted,
            max_segments,
            max_response_size,
            invoke_id,
            sequence_number,
            proposed_window_size,
            service_choice,
            service_data,
        } => {
            reassembly::receive_segment(
                shared,
                InboundSegment {
                    kind: SegmentKind::ConfirmedRequest {
                        segmented_response_accepted,
                        max_segments,
                        max_response_size,
                    },
                    invoke_id,
                    sequence_number: sequence_number.unwrap_or(0),
                    proposed_window_size: proposed_window_size.unwrap_or(1),
                    more_follows,
                    service_choice,
                    data: service_data,
                },
                source,
            );
        }

        Apdu::ConfirmedRequest {
            segmented: false,
            segmented_response_accepted,
            max_segments,
            max_response_size,
            invoke_id,
            service_choice,
            service_data,
            ..
        } => {
            handle_confirmed_request(
                shared,
                source,
                invoke_id,
                segmented_response_accepted,
                max_segments,
                max_response_size,
                service_choice,
                &service_data,
            );
        }

        Apdu::UnconfirmedRequest {
            service_choice,
            service_data,
        } => {
            handle_unconfirmed_request(shared, source, service_choice, &service_data);
        }

        Apdu::SimpleAck {
            invoke_id,
            service_choice,
        } => {
            let handlers = shared.handlers_snapshot();
            if let Some(observer) = &handlers.on_simple_ack {
                observer(&source, invoke_id, service_choice);
            }
            if !shared
                .pending()
                .deliver(invoke_id, TransactionEvent::SimpleAck { service_choice })
            {
                debug!("stray simple ack from {} for invoke {}", source, invoke_id);
            }
        }

        Apdu::ComplexAck {
            segmented: true,
            more_follows,
            invoke_id,
            sequence_number,
            proposed_window_size,
            service_choice,
            service_data,
        } => {
            reassembly::receive_segment(
                shared,
                InboundSegment {
                    kind: SegmentKind::ComplexAck,
                    invoke_id,
                    sequence_number: sequence_number.unwrap_or(0),
                    proposed_window_size: proposed_window_size.unwrap_or(1),
                    more_follows,
                    service_choice,
                    data: service_data,
                },
                source,
            );
        }

        Apdu::ComplexAck {
            segmented: false,
            invoke_id,
            service_choice,
            service_data,
            ..
        } => {
            let handlers = shared.handlers_snapshot();
            if let Some(observer) = &handlers.on_complex_ack {
                observer(&source, invoke_id, service_choice, &service_data);
            }
            if !shared.pending().deliver(
                invoke_id,
                TransactionEvent::ComplexAck {
                    service_choice,
                    service_data,
                },
            ) {
                debug!("stray complex ack from {} for invoke {}", source, invoke_id);
            }
        }

        Apdu::SegmentAck {
            negative,
            server: _,
            invoke_id,
            sequence_number,
            actual_window_size,
        } => {
            let handlers = shared.handlers_snapshot();
            if let Some(observer) = &handlers.on_segment_ack {
                observer(&source, invoke_id, sequence_number, actual_window_size, negative);
            }
            if !shared.seg_acks().deliver(
                invoke_id,
                SegmentAckNotice {
                    negative,
                    sequence_number,
                    actual_window_size,
                },
            ) {
                debug!(
                    "stray segment ack from {} for invoke {} (sequence {})",
                    source, invoke_id, sequence_number
                );
            }
        }

        Apdu::Error {
            invoke_id,
            service_choice,
            error_class,
            error_code,
        } => {
            let class = ErrorClass::from(error_class);
            let code = ErrorCode::from(error_code);
            let handlers = shared.handlers_snapshot();
            if let Some(observer) = &handlers.on_error {
                observer(&source, invoke_id, service_choice, class, code);
            }
            if !shared
                .pending()
                .deliver(invoke_id, TransactionEvent::Error { class, code })
            {
                debug!(
                    "stray error from {} for invoke {}: {} / {}",
                    source, invoke_id, class, code
                );
            }
        }

        Apdu::Reject {
            invoke_id,
            reject_reason,
        } => {
            let reason = RejectReason::from_u8(reject_reason);
            let handlers = shared.handlers_snapshot();
            if let Some(observer) = &handlers.on_reject {
                observer(&source, invoke_id, reason);
            }
            if !shared
                .pending()
                .deliver(invoke_id, TransactionEvent::Reject { reason })
            {
                debug!(
                    "stray reject from {} for invoke {}: {:?}",
                    source, invoke_id, reason
                );
            }
        }

        Apdu::Abort {
            server: _,
            invoke_id,
            abort_reason,
        } => {
            let reason = AbortReason::from_u8(abort_reason);
            let handlers = shared.handlers_snapshot();
            if let Some(observer) = &handlers.on_abort {
                observer(&source, invoke_id, reason);
            }
            if !shared
                .pending()
                .deliver(invoke_id, TransactionEvent::Abort { reason })
            {
                debug!(
                    "stray abort from {} for invoke {}: {:?}",
                    source, invoke_id, reason
                );
            }
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn handle_confirmed_request(
    shared: &Arc<ClientShared>,
    source: BacnetAddress,
    invoke_id: u8,
    segmented_response_accepted: bool,
    max_segments: MaxSegments,
    max_response_size: MaxApduSize,
    service_choice: u8,
    data: &[u8],
) {
    let handlers = shared.handlers_snapshot();
    if let Some(observer) = &handlers.on_confirmed_request {
        observer(&source, invoke_id, service_choice, data);
    }

    let choice = match ConfirmedServiceChoice::try_from(service_choice) {
        Ok(choice) => choice,
        Err(_) => {
            warn!(
                "unknown confirmed service {} from {}, rejecting invoke {}",
                service_choice, source, invoke_id
            );
            send_reject(shared, &source, invoke_id, RejectReason::UnrecognizedService);
            return;
        }
    };

    let ctx = RequestContext {
        source: source.clone(),
        invoke_id,
        service_choice: choice,
        segmentation: segmented_response_accepted.then_some(SegmentationNegotiation {
            max_segments,
            max_apdu: max_response_size,
        }),
    };
    let client = BacnetClient::from_shared(Arc::clone(shared));

    macro_rules! typed {
        ($handler:expr, $decode:expr) => {
            if let Some(handler) = &$handler {
                match $decode {
                    Ok(request) => finish(shared, &ctx, handler(&client, &ctx, request)),
                    Err(e) => reply_decode_failure(shared, &ctx, &e),
                }
                return;
            }
        };
    }

    match choice {
        ConfirmedServiceChoice::ReadProperty => {
            typed!(
                handlers.read_property,
                crate::service::ReadPropertyRequest::decode(data)
            );
        }
        ConfirmedServiceChoice::WriteProperty => {
            typed!(
                handlers.write_property,
                crate::service::WritePropertyRequest::decode(data)
            );
        }
        ConfirmedServiceChoice::ReadPropertyMultiple => {
            typed!(
                handlers.read_property_multiple,
                crate::service::ReadPropertyMultipleRequest::decode(data)
            );
        }
        ConfirmedServiceChoice::WritePropertyMultiple => {
            typed!(
                handlers.write_property_multiple,
                crate::service::WritePropertyMultipleRequest::decode(data)
            );
        }
        ConfirmedServiceChoice::AtomicReadFile => {
            typed!(
                handlers.atomic_read_file,
                crate::service::AtomicReadFileRequest::decode(data)
            );
        }
        ConfirmedServiceChoice::AtomicWriteFile => {
            typed!(
                handlers.atomic_write_file,
                crate::service::AtomicWriteFileRequest::decode(data)
            );
        }
        ConfirmedServiceChoice::SubscribeCov => {
            typed!(
                handlers.subscribe_cov,
                crate::service::SubscribeCovRequest::decode(data)
            );
        }
        ConfirmedServiceChoice::SubscribeCovProperty => {
            typed!(
                handlers.subscribe_cov_property,
                crate::service::SubscribeCovPropertyRequest::decode(data)
            );
        }
        ConfirmedServiceChoice::DeviceCommunicationControl => {
            typed!(
                handlers.device_communication_control,
                crate::service::DeviceCommunicationControlRequest::decode(data)
            );
        }
        ConfirmedServiceChoice::ReinitializeDevice => {
            typed!(
                handlers.reinitialize_device,
                crate::service::ReinitializeDeviceRequest::decode(data)
            );
        }
        ConfirmedServiceChoice::CreateObject => {
            typed!(
                handlers.create_object,
                crate::service::CreateObjectRequest::decode(data)
            );
        }
        ConfirmedServiceChoice::DeleteObject => {
            typed!(
                handlers.delete_object,
                crate::service::DeleteObjectRequest::decode(data)
            );
        }
        ConfirmedServiceChoice::AcknowledgeAlarm => {
            typed!(
                handlers.acknowledge_alarm,
                crate::service::AcknowledgeAlarmRequest::decode(data)
            );
        }
        ConfirmedServiceChoice::LifeSafetyOperation => {
            typed!(
                handlers.life_safety_operation,
                crate::service::LifeSafetyOperationRequest::decode(data)
            );
        }
        ConfirmedServiceChoice::GetEventInformation => {
            typed!(
                handlers.get_event_information,
                crate::service::GetEventInformationRequest::decode(data)
            );
        }
        ConfirmedServiceChoice::GetAlarmSummary => {
            typed!(handlers.get_alarm_summary, expect_empty(data));
        }
        ConfirmedServiceChoice::ConfirmedCovNotification => {
            typed!(handlers.cov_notification, CovNotification::decode(data));
        }
        _ => {}
    }

    // No typed handler took it; give the raw fallback a chance
    if let Some(handler) = &handlers.raw_confirmed {
        finish(shared, &ctx, handler(&client, &ctx, data));
        return;
    }

    debug!(
        "no handler for confirmed service {:?} from {}, rejecting invoke {}",
        choice, source, invoke_id
    );
    send_reject(shared, &source, invoke_id, RejectReason::UnrecognizedService);
}

fn expect_empty(data: &[u8]) -> crate::service::Result<()> {
    if data.is_empty() {
        Ok(())
    } else {
        Err(ServiceError::TooManyArguments)
    }
}

/// Convert a handler's outcome into the reply the peer is owed. A handler
/// that returns `Ok` has already sent its ack through the responder API.
fn finish(shared: &Arc<ClientShared>, ctx: &RequestContext, result: HandlerResult) {
    if let Err((class, code)) = result {
        warn!(
            "handler for {:?} from {} failed: {} / {}",
            ctx.service_choice, ctx.source, class, code
        );
        send_error(
            shared,
            &ctx.source,
            ctx.invoke_id,
            ctx.service_choice as u8,
            class,
            code,
        );
    }
}

fn reply_decode_failure(shared: &Arc<ClientShared>, ctx: &RequestContext, error: &ServiceError) {
    warn!(
        "malformed {:?} request from {} (invoke {}): {}",
        ctx.service_choice, ctx.source, ctx.invoke_id, error
    );
    match error.reject_reason() {
        Some(reason) => send_reject(shared, &ctx.source, ctx.invoke_id, reason),
        None => send_error(
            shared,
            &ctx.source,
            ctx.invoke_id,
            ctx.service_choice as u8,
            ErrorClass::Services,
            ErrorCode::AbortOther,
        ),
    }
}

pub(crate) fn send_reject(
    shared: &Arc<ClientShared>,
    address: &BacnetAddress,
    invoke_id: u8,
    reason: RejectReason,
) {
    let apdu = Apdu::Reject {
        invoke_id,
        reject_reason: reason as u8,
    };
    let config = shared.config();
    if let Err(e) =
        shared
            .transport()
            .send(&apdu.encode(), address, false, config.transmit_timeout)
    {
        warn!("failed to send reject to {}: {}", address, e);
    }
}

pub(crate) fn send_error(
    shared: &Arc<ClientShared>,
    address: &BacnetAddress,
    invoke_id: u8,
    service_choice: u8,
    class: ErrorClass,
    code: ErrorCode,
) {
    let apdu = Apdu::Error {
        invoke_id,
        service_choice,
        error_class: u16::from(class),
        error_code: u16::from(code),
    };
    let config = shared.config();
    if let Err(e) =
        shared
            .transport()
            .send(&apdu.encode(), address, false, config.transmit_timeout)
    {
        warn!("failed to send error to {}: {}", address, e);
    }
}

fn handle_unconfirmed_request(
    shared: &Arc<ClientShared>,
    source: BacnetAddress,
    service_choice: u8,
    data: &[u8],
) {
    let handlers = shared.handlers_snapshot();
    if let Some(observer) = &handlers.on_unconfirmed_request {
        observer(&source, service_choice, data);
    }
    let client = BacnetClient::from_shared(Arc::clone(shared));

    let choice = match UnconfirmedServiceChoice::try_from(service_choice) {
        Ok(choice) => choice,
        Err(_) => {
            debug!(
                "unknown unconfirmed service {} from {}",
                service_choice, source
            );
            return;
        }
    };

    // Failures on this path are logged and dropped; unconfirmed requests
    // have no reply channel.
    let outcome: crate::service::Result<()> = (|| {
        match choice {
            UnconfirmedServiceChoice::WhoIs => {
                if let Some(handler) = &handlers.who_is {
                    handler(&client, &source, WhoIsRequest::decode(data)?);
                }
            }
            UnconfirmedServiceChoice::IAm => {
                if let Some(handler) = &handlers.i_am {
                    handler(&client, &source, crate::service::IAmRequest::decode(data)?);
                }
            }
            UnconfirmedServiceChoice::WhoHas => {
                if let Some(handler) = &handlers.who_has {
                    handler(
                        &client,
                        &source,
                        crate::service::WhoHasRequest::decode(data)?,
                    );
                }
            }
            UnconfirmedServiceChoice::IHave => {
                if let Some(handler) = &handlers.i_have {
                    handler(&client, &source, crate::service::IHaveRequest::decode(data)?);
                }
            }
            UnconfirmedServiceChoice::TimeSynchronization => {
                if let Some(handler) = &handlers.time_synchronization {
                    handler(
                        &client,
                        &source,
                        TimeSynchronizationRequest::decode(data)?,
                        false,
                    );
                }
            }
            UnconfirmedServiceChoice::UtcTimeSynchronization => {
                if let Some(handler) = &handlers.time_synchronization {
                    handler(
                        &client,
                        &source,
                        TimeSynchronizationRequest::decode(data)?,
                        true,
                    );
                }
            }
            UnconfirmedServiceChoice::UnconfirmedCovNotification => {
                if let Some(handler) = &handlers.unconfirmed_cov_notification {
                    handler(&client, &source, CovNotification::decode(data)?);
                }
            }
            other => {
                if let Some(handler) = &handlers.raw_unconfirmed {
                    handler(&client, &source, other as u8, data);
                } else {
                    trace!("unhandled unconfirmed service {:?} from {}", other, source);
                }
            }
        }
        Ok(())
    })();

    if let Err(e) = outcome {
        warn!(
            "malformed unconfirmed {:?} from {}: {}",
            choice, source, e
        );
    }
}
