//! The BACnet client/server engine.
//!
//! [`BacnetClient`] binds a [`Transport`] to the four engine components:
//! the PDU dispatcher ([`dispatch`]), the segmentation receiver
//! ([`reassembly`]), the segmentation sender ([`segmentation`]) and the
//! transaction manager ([`transaction`]).
//!
//! The application-facing surface has three parts:
//!
//! - **Begin/End pairs** for confirmed services. `begin_*` encodes and
//!   transmits the request and returns a [`ConfirmedInvoke`]; `end_*` blocks
//!   on it (driving the retry loop) and decodes the typed result.
//! - **Response-side sends** for serving confirmed requests: simple ack,
//!   complex ack (with transparent segmentation), error, reject, abort.
//! - **Event subscriptions**: per-service request handlers plus raw
//!   observers for every PDU type and for individual segments.
//!
//! "Client" follows protocol usage: the same instance serves inbound
//! requests and initiates its own.

use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use bytes::Bytes;
use log::debug;
use thiserror::Error;

use crate::apdu::{Apdu, MaxApduSize, MaxSegments};
use crate::service::{
    self, AbortReason, AcknowledgeAlarmRequest, AtomicReadFileAck, AtomicReadFileRequest,
    AtomicWriteFileAck, AtomicWriteFileRequest, BacnetDateTime, ConfirmedServiceChoice,
    CovNotification, CreateObjectAck, CreateObjectRequest, DeleteObjectRequest,
    DeviceCommunicationControlRequest, ErrorClass, ErrorCode, GetAlarmSummaryAck,
    GetEventInformationAck, GetEventInformationRequest, IAmRequest, IHaveRequest,
    LifeSafetyOperationRequest, ReadPropertyAck, ReadPropertyMultipleAck,
    ReadPropertyMultipleRequest, ReadPropertyRequest, ReinitializeDeviceRequest, RejectReason,
    ServiceError, SubscribeCovPropertyRequest, SubscribeCovRequest, TimeSynchronizationRequest,
    UnconfirmedServiceChoice, WhoHasRequest, WhoIsRequest, WritePropertyMultipleRequest,
    WritePropertyRequest,
};
use crate::transport::{BacnetAddress, Transport, TransportError};

pub(crate) mod dispatch;
pub mod reassembly;
pub mod segmentation;
pub mod transaction;

#[cfg(test)]
pub(crate) mod testutil;

pub use segmentation::Segmentation;
pub use transaction::{ConfirmedInvoke, ServiceAck};

use reassembly::ReassemblyTable;
use segmentation::SegmentAckTable;
use transaction::PendingTable;

/// Result type for client operations
pub type Result<T> = std::result::Result<T, ClientError>;

/// Failure of a confirmed-service call or of the engine configuration.
///
/// Terminal events from the remote peer carry their typed reason; a bare
/// timeout is only ever reported once the retry budget is spent.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("no reply within {attempts} attempts")]
    Timeout { attempts: u32 },

    #[error("remote error: {class} / {code}")]
    RemoteError { class: ErrorClass, code: ErrorCode },

    #[error("remote abort: {0:?}")]
    RemoteAbort(AbortReason),

    #[error("remote reject: {0:?}")]
    RemoteReject(RejectReason),

    #[error("reply decode failed: {0}")]
    Decode(ServiceError),

    #[error("request encode failed: {0}")]
    Encode(ServiceError),

    #[error("transmit failed: {0}")]
    Transmit(#[from] TransportError),

    #[error("response exceeds what the exchange can carry")]
    ApduTooLong,

    #[error("request of {len} bytes exceeds the transport budget of {max}")]
    RequestTooLarge { len: usize, max: usize },

    #[error("all 256 invoke ids are outstanding")]
    InvokeIdExhausted,

    #[error("invalid configuration: {0}")]
    InvalidConfig(&'static str),

    #[error("peer answered with the wrong acknowledgment kind")]
    UnexpectedAck,
}

/// Engine configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Per-attempt wait for a terminal event; also the segment-ack wait
    pub timeout: Duration,
    /// Bound on individual transport sends and transmit flushes
    pub transmit_timeout: Duration,
    /// Total attempts per confirmed request, minimum 1
    pub retries: u32,
    /// Window size proposed in outbound segment streams (1..=127)
    pub proposed_window_size: u8,
    /// When set, advertised in segment acks instead of the sender's proposal
    pub force_window_size: Option<u8>,
    /// Reassemble inbound segment streams in the engine; when off, segments
    /// reach only the raw segment observer
    pub default_segmentation_handling: bool,
    /// Priority-array slot stamped on writes; 0 disables, 1..=16 valid
    pub write_priority: u8,
    /// Vendor identifier announced in I-Am
    pub vendor_id: u16,
    /// Segment count accepted in responses to our requests
    pub max_segments: MaxSegments,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(3),
            transmit_timeout: Duration::from_secs(30),
            retries: 3,
            proposed_window_size: 10,
            force_window_size: None,
            default_segmentation_handling: true,
            write_priority: 0,
            vendor_id: 260,
            max_segments: MaxSegments::SixtyFour,
        }
    }
}

impl ClientConfig {
    fn validate(&self) -> Result<()> {
        if self.write_priority > 16 {
            return Err(ClientError::InvalidConfig("write priority above 16"));
        }
        if self.proposed_window_size == 0 || self.proposed_window_size > 127 {
            return Err(ClientError::InvalidConfig("window size outside 1..=127"));
        }
        if matches!(self.force_window_size, Some(w) if w == 0 || w > 127) {
            return Err(ClientError::InvalidConfig(
                "forced window size outside 1..=127",
            ));
        }
        if self.retries == 0 {
            return Err(ClientError::InvalidConfig("retry count below 1"));
        }
        Ok(())
    }
}

/// Outcome of a confirmed-request handler. `Ok` means the handler sent its
/// own acknowledgment through the responder API; `Err` makes the dispatcher
/// answer with an error PDU of the given class and code.
pub type HandlerResult = std::result::Result<(), (ErrorClass, ErrorCode)>;

pub(crate) type ConfirmedHandler<T> =
    Arc<dyn Fn(&BacnetClient, &RequestContext, T) -> HandlerResult + Send + Sync>;
pub(crate) type RawConfirmedHandler =
    Arc<dyn Fn(&BacnetClient, &RequestContext, &[u8]) -> HandlerResult + Send + Sync>;
pub(crate) type UnconfirmedHandler<T> =
    Arc<dyn Fn(&BacnetClient, &BacnetAddress, T) + Send + Sync>;
pub(crate) type TimeSyncHandler =
    Arc<dyn Fn(&BacnetClient, &BacnetAddress, TimeSynchronizationRequest, bool) + Send + Sync>;
pub(crate) type RawUnconfirmedHandler =
    Arc<dyn Fn(&BacnetClient, &BacnetAddress, u8, &[u8]) + Send + Sync>;

pub(crate) type SegmentObserver = Arc<dyn Fn(&BacnetAddress, u8, u8, bool, &[u8]) + Send + Sync>;
pub(crate) type SimpleAckObserver = Arc<dyn Fn(&BacnetAddress, u8, u8) + Send + Sync>;
pub(crate) type ComplexAckObserver = Arc<dyn Fn(&BacnetAddress, u8, u8, &[u8]) + Send + Sync>;
pub(crate) type ErrorObserver =
    Arc<dyn Fn(&BacnetAddress, u8, u8, ErrorClass, ErrorCode) + Send + Sync>;
pub(crate) type AbortObserver = Arc<dyn Fn(&BacnetAddress, u8, AbortReason) + Send + Sync>;
pub(crate) type RejectObserver = Arc<dyn Fn(&BacnetAddress, u8, RejectReason) + Send + Sync>;
pub(crate) type SegmentAckObserver = Arc<dyn Fn(&BacnetAddress, u8, u8, u8, bool) + Send + Sync>;
pub(crate) type RequestObserver = Arc<dyn Fn(&BacnetAddress, u8, u8, &[u8]) + Send + Sync>;
pub(crate) type UnconfirmedObserver = Arc<dyn Fn(&BacnetAddress, u8, &[u8]) + Send + Sync>;

/// Registered application handlers and observers.
#[derive(Default, Clone)]
pub(crate) struct Handlers {
    pub read_property: Option<ConfirmedHandler<ReadPropertyRequest>>,
    pub write_property: Option<ConfirmedHandler<WritePropertyRequest>>,
    pub read_property_multiple: Option<ConfirmedHandler<ReadPropertyMultipleRequest>>,
    pub write_property_multiple: Option<ConfirmedHandler<WritePropertyMultipleRequest>>,
    pub atomic_read_file: Option<ConfirmedHandler<AtomicReadFileRequest>>,
    pub atomic_write_file: Option<ConfirmedHandler<AtomicWriteFileRequest>>,
    pub subscribe_cov: Option<ConfirmedHandler<SubscribeCovRequest>>,
    pub subscribe_cov_property: Option<ConfirmedHandler<SubscribeCovPropertyRequest>>,
    pub device_communication_control: Option<ConfirmedHandler<DeviceCommunicationControlRequest>>,
    pub reinitialize_device: Option<ConfirmedHandler<ReinitializeDeviceRequest>>,
    pub create_object: Option<ConfirmedHandler<CreateObjectRequest>>,
    pub delete_object: Option<ConfirmedHandler<DeleteObjectRequest>>,
    pub acknowledge_alarm: Option<ConfirmedHandler<AcknowledgeAlarmRequest>>,
    pub life_safety_operation: Option<ConfirmedHandler<LifeSafetyOperationRequest>>,
    pub get_event_information: Option<ConfirmedHandler<GetEventInformationRequest>>,
    pub get_alarm_summary: Option<ConfirmedHandler<()>>,
    pub cov_notification: Option<ConfirmedHandler<CovNotification>>,
    pub raw_confirmed: Option<RawConfirmedHandler>,

    pub who_is: Option<UnconfirmedHandler<WhoIsRequest>>,
    pub i_am: Option<UnconfirmedHandler<IAmRequest>>,
    pub who_has: Option<UnconfirmedHandler<WhoHasRequest>>,
    pub i_have: Option<UnconfirmedHandler<IHaveRequest>>,
    pub time_synchronization: Option<TimeSyncHandler>,
    pub unconfirmed_cov_notification: Option<UnconfirmedHandler<CovNotification>>,
    pub raw_unconfirmed: Option<RawUnconfirmedHandler>,

    pub on_segment: Option<SegmentObserver>,
    pub on_simple_ack: Option<SimpleAckObserver>,
    pub on_complex_ack: Option<ComplexAckObserver>,
    pub on_error: Option<ErrorObserver>,
    pub on_abort: Option<AbortObserver>,
    pub on_reject: Option<RejectObserver>,
    pub on_segment_ack: Option<SegmentAckObserver>,
    pub on_confirmed_request: Option<RequestObserver>,
    pub on_unconfirmed_request: Option<UnconfirmedObserver>,
}

/// Segmentation terms a requester declared for its response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SegmentationNegotiation {
    pub max_segments: MaxSegments,
    pub max_apdu: MaxApduSize,
}

/// Context of one inbound confirmed request, handed to handlers so they can
/// address their reply.
#[derive(Debug, Clone)]
pub struct RequestContext {
    pub source: BacnetAddress,
    pub invoke_id: u8,
    pub service_choice: ConfirmedServiceChoice,
    /// Present when the requester accepts a segmented response
    pub segmentation: Option<SegmentationNegotiation>,
}

/// State shared between the engine components.
pub struct ClientShared {
    transport: Arc<dyn Transport>,
    config: Mutex<ClientConfig>,
    pending: Arc<PendingTable>,
    seg_acks: SegmentAckTable,
    reassembly: ReassemblyTable,
    handlers: Mutex<Handlers>,
}

impl ClientShared {
    pub(crate) fn transport(&self) -> Arc<dyn Transport> {
        Arc::clone(&self.transport)
    }

    pub(crate) fn config(&self) -> ClientConfig {
        self.config.lock().expect("config poisoned").clone()
    }

    pub(crate) fn pending(&self) -> &PendingTable {
        &self.pending
    }

    pub(crate) fn pending_arc(&self) -> Arc<PendingTable> {
        Arc::clone(&self.pending)
    }

    pub(crate) fn seg_acks(&self) -> &SegmentAckTable {
        &self.seg_acks
    }

    pub(crate) fn reassembly(&self) -> &ReassemblyTable {
        &self.reassembly
    }

    pub(crate) fn handlers_snapshot(&self) -> Handlers {
        self.handlers.lock().expect("handlers poisoned").clone()
    }
}

macro_rules! confirmed_handler_setter {
    ($(#[$doc:meta])* $name:ident, $field:ident, $request:ty) => {
        $(#[$doc])*
        pub fn $name<F>(&self, handler: F)
        where
            F: Fn(&BacnetClient, &RequestContext, $request) -> HandlerResult
                + Send
                + Sync
                + 'static,
        {
            self.shared.handlers.lock().expect("handlers poisoned").$field =
                Some(Arc::new(handler));
        }
    };
}

macro_rules! unconfirmed_handler_setter {
    ($(#[$doc:meta])* $name:ident, $field:ident, $request:ty) => {
        $(#[$doc])*
        pub fn $name<F>(&self, handler: F)
        where
            F: Fn(&BacnetClient, &BacnetAddress, $request) + Send + Sync + 'static,
        {
            self.shared.handlers.lock().expect("handlers poisoned").$field =
                Some(Arc::new(handler));
        }
    };
}

macro_rules! observer_setter {
    ($(#[$doc:meta])* $name:ident, $field:ident, ($($arg:ty),+)) => {
        $(#[$doc])*
        pub fn $name<F>(&self, observer: F)
        where
            F: Fn($($arg),+) + Send + Sync + 'static,
        {
            self.shared.handlers.lock().expect("handlers poisoned").$field =
                Some(Arc::new(observer));
        }
    };
}

/// The engine instance. Cheap to clone; clones share all state.
#[derive(Clone)]
pub struct BacnetClient {
    shared: Arc<ClientShared>,
}

impl BacnetClient {
    /// Build an engine on a transport and start receiving.
    pub fn new(transport: Arc<dyn Transport>, config: ClientConfig) -> Result<Self> {
        config.validate()?;
        let shared = Arc::new(ClientShared {
            transport,
            config: Mutex::new(config),
            pending: Arc::new(PendingTable::new()),
            seg_acks: SegmentAckTable::new(),
            reassembly: ReassemblyTable::new(),
            handlers: Mutex::new(Handlers::default()),
        });

        let weak: Weak<ClientShared> = Arc::downgrade(&shared);
        shared
            .transport
            .start(Arc::new(move |frame: Bytes, source: BacnetAddress| {
                if let Some(shared) = weak.upgrade() {
                    dispatch::on_frame(&shared, &frame, source);
                }
            }))?;

        Ok(Self { shared })
    }

    pub(crate) fn from_shared(shared: Arc<ClientShared>) -> Self {
        Self { shared }
    }

    pub(crate) fn shared(&self) -> &Arc<ClientShared> {
        &self.shared
    }

    /// Snapshot of the current configuration
    pub fn config(&self) -> ClientConfig {
        self.shared.config()
    }

    /// Set the priority-array slot stamped on writes. 0 disables priority
    /// commanding; 1..=16 are valid slots.
    pub fn set_write_priority(&self, priority: u8) -> Result<()> {
        if priority > 16 {
            return Err(ClientError::InvalidConfig("write priority above 16"));
        }
        self.shared
            .config
            .lock()
            .expect("config poisoned")
            .write_priority = priority;
        Ok(())
    }

    /// Replace the per-attempt timeout and retry budget.
    pub fn set_retry_policy(&self, timeout: Duration, retries: u32) -> Result<()> {
        if retries == 0 {
            return Err(ClientError::InvalidConfig("retry count below 1"));
        }
        let mut config = self.shared.config.lock().expect("config poisoned");
        config.timeout = timeout;
        config.retries = retries;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Confirmed requests: Begin/End
    // ------------------------------------------------------------------

    /// Encode and transmit a confirmed request, returning the transaction
    /// handle. The terminal event is collected with [`ConfirmedInvoke::wait`]
    /// or one of the typed `end_*` methods.
    pub fn begin_confirmed<F>(
        &self,
        address: &BacnetAddress,
        choice: ConfirmedServiceChoice,
        encode: F,
    ) -> Result<ConfirmedInvoke>
    where
        F: FnOnce(&mut Vec<u8>) -> service::Result<()>,
    {
        let config = self.shared.config();
        let mut payload = Vec::new();
        encode(&mut payload).map_err(ClientError::Encode)?;

        let pending = self.shared.pending_arc();
        let (invoke_id, rx) = pending.register()?;
        let transport = self.shared.transport();
        let apdu = Apdu::ConfirmedRequest {
            segmented: false,
            more_follows: false,
            segmented_response_accepted: true,
            max_segments: config.max_segments,
            max_response_size: MaxApduSize::fitting(transport.max_apdu_length()),
            invoke_id,
            sequence_number: None,
            proposed_window_size: None,
            service_choice: choice as u8,
            service_data: payload,
        };
        let frame = apdu.encode();
        let max = transport.max_apdu_length();
        if frame.len() > max {
            pending.release(invoke_id);
            return Err(ClientError::RequestTooLarge {
                len: frame.len(),
                max,
            });
        }
        if let Err(e) = transport.send(&frame, address, true, config.transmit_timeout) {
            pending.release(invoke_id);
            return Err(ClientError::Transmit(e));
        }
        debug!(
            "sent {:?} to {} as invoke {}",
            choice, address, invoke_id
        );

        Ok(ConfirmedInvoke {
            transport,
            pending,
            address: address.clone(),
            invoke_id,
            frame,
            rx,
            timeout: config.timeout,
            retries: config.retries.max(1),
            transmit_timeout: config.transmit_timeout,
        })
    }

    fn expect_complex(invoke: ConfirmedInvoke) -> Result<Vec<u8>> {
        let ack = invoke.wait()?;
        if ack.simple {
            return Err(ClientError::UnexpectedAck);
        }
        Ok(ack.service_data)
    }

    fn expect_simple(invoke: ConfirmedInvoke) -> Result<()> {
        let ack = invoke.wait()?;
        if !ack.simple {
            return Err(ClientError::UnexpectedAck);
        }
        Ok(())
    }

    pub fn begin_read_property(
        &self,
        address: &BacnetAddress,
        request: &ReadPropertyRequest,
    ) -> Result<ConfirmedInvoke> {
        self.begin_confirmed(address, ConfirmedServiceChoice::ReadProperty, |buffer| {
            request.encode(buffer)
        })
    }

    pub fn end_read_property(&self, invoke: ConfirmedInvoke) -> Result<ReadPropertyAck> {
        let data = Self::expect_complex(invoke)?;
        ReadPropertyAck::decode(&data).map_err(ClientError::Decode)
    }

    /// Begin a write-property request. When the request carries no explicit
    /// priority and a write priority is configured, that slot is stamped on.
    pub fn begin_write_property(
        &self,
        address: &BacnetAddress,
        request: &WritePropertyRequest,
    ) -> Result<ConfirmedInvoke> {
        let mut request = request.clone();
        let configured = self.shared.config().write_priority;
        if request.priority.is_none() && (1..=16).contains(&configured) {
            request.priority = Some(configured);
        }
        self.begin_confirmed(address, ConfirmedServiceChoice::WriteProperty, |buffer| {
            request.encode(buffer)
        })
    }

    pub fn end_write_property(&self, invoke: ConfirmedInvoke) -> Result<()> {
        Self::expect_simple(invoke)
    }

    pub fn begin_read_property_multiple(
        &self,
        address: &BacnetAddress,
        request: &ReadPropertyMultipleRequest,
    ) -> Result<ConfirmedInvoke> {
        self.begin_confirmed(
            address,
            ConfirmedServiceChoice::ReadPropertyMultiple,
            |buffer| request.encode(buffer),
        )
    }

    pub fn end_read_property_multiple(
        &self,
        invoke: ConfirmedInvoke,
    ) -> Result<ReadPropertyMultipleAck> {
        let data = Self::expect_complex(invoke)?;
        ReadPropertyMultipleAck::decode(&data).map_err(ClientError::Decode)
    }

    pub fn begin_write_property_multiple(
        &self,
        address: &BacnetAddress,
        request: &WritePropertyMultipleRequest,
    ) -> Result<ConfirmedInvoke> {
        self.begin_confirmed(
            address,
            ConfirmedServiceChoice::WritePropertyMultiple,
            |buffer| request.encode(buffer),
        )
    }

    pub fn end_write_property_multiple(&self, invoke: ConfirmedInvoke) -> Result<()> {
        Self::expect_simple(invoke)
    }

    pub fn begin_atomic_read_file(
        &self,
        address: &BacnetAddress,
        request: &AtomicReadFileRequest,
    ) -> Result<ConfirmedInvoke> {
        self.begin_confirmed(address, ConfirmedServiceChoice::AtomicReadFile, |buffer| {
            request.encode(buffer)
        })
    }

    pub fn end_atomic_read_file(&self, invoke: ConfirmedInvoke) -> Result<AtomicReadFileAck> {
        let data = Self::expect_complex(invoke)?;
        AtomicReadFileAck::decode(&data).map_err(ClientError::Decode)
    }

    pub fn begin_atomic_write_file(
        &self,
        address: &BacnetAddress,
        request: &AtomicWriteFileRequest,
    ) -> Result<ConfirmedInvoke> {
        self.begin_confirmed(address, ConfirmedServiceChoice::AtomicWriteFile, |buffer| {
            request.encode(buffer)
        })
    }

    pub fn end_atomic_write_file(&self, invoke: ConfirmedInvoke) -> Result<AtomicWriteFileAck> {
        let data = Self::expect_complex(invoke)?;
        AtomicWriteFileAck::decode(&data).map_err(ClientError::Decode)
    }

    pub fn begin_subscribe_cov(
        &self,
        address: &BacnetAddress,
        request: &SubscribeCovRequest,
    ) -> Result<ConfirmedInvoke> {
        self.begin_confirmed(address, ConfirmedServiceChoice::SubscribeCov, |buffer| {
            request.encode(buffer)
        })
    }

    pub fn end_subscribe_cov(&self, invoke: ConfirmedInvoke) -> Result<()> {
        Self::expect_simple(invoke)
    }

    pub fn begin_subscribe_cov_property(
        &self,
        address: &BacnetAddress,
        request: &SubscribeCovPropertyRequest,
    ) -> Result<ConfirmedInvoke> {
        self.begin_confirmed(
            address,
            ConfirmedServiceChoice::SubscribeCovProperty,
            |buffer| request.encode(buffer),
        )
    }

    pub fn end_subscribe_cov_property(&self, invoke: ConfirmedInvoke) -> Result<()> {
        Self::expect_simple(invoke)
    }

    pub fn begin_device_communication_control(
        &self,
        address: &BacnetAddress,
        request: &DeviceCommunicationControlRequest,
    ) -> Result<ConfirmedInvoke> {
        self.begin_confirmed(
            address,
            ConfirmedServiceChoice::DeviceCommunicationControl,
            |buffer| request.encode(buffer),
        )
    }

    pub fn end_device_communication_control(&self, invoke: ConfirmedInvoke) -> Result<()> {
        Self::expect_simple(invoke)
    }

    pub fn begin_reinitialize_device(
        &self,
        address: &BacnetAddress,
        request: &ReinitializeDeviceRequest,
    ) -> Result<ConfirmedInvoke> {
        self.begin_confirmed(
            address,
            ConfirmedServiceChoice::ReinitializeDevice,
            |buffer| request.encode(buffer),
        )
    }

    pub fn end_reinitialize_device(&self, invoke: ConfirmedInvoke) -> Result<()> {
        Self::expect_simple(invoke)
    }

    pub fn begin_create_object(
        &self,
        address: &BacnetAddress,
        request: &CreateObjectRequest,
    ) -> Result<ConfirmedInvoke> {
        self.begin_confirmed(address, ConfirmedServiceChoice::CreateObject, |buffer| {
            request.encode(buffer)
        })
    }

    pub fn end_create_object(&self, invoke: ConfirmedInvoke) -> Result<CreateObjectAck> {
        let data = Self::expect_complex(invoke)?;
        CreateObjectAck::decode(&data).map_err(ClientError::Decode)
    }

    pub fn begin_delete_object(
        &self,
        address: &BacnetAddress,
        request: &DeleteObjectRequest,
    ) -> Result<ConfirmedInvoke> {
        self.begin_confirmed(address, ConfirmedServiceChoice::DeleteObject, |buffer| {
            request.encode(buffer)
        })
    }

    pub fn end_delete_object(&self, invoke: ConfirmedInvoke) -> Result<()> {
        Self::expect_simple(invoke)
    }

    pub fn begin_acknowledge_alarm(
        &self,
        address: &BacnetAddress,
        request: &AcknowledgeAlarmRequest,
    ) -> Result<ConfirmedInvoke> {
        self.begin_confirmed(
            address,
            ConfirmedServiceChoice::AcknowledgeAlarm,
            |buffer| request.encode(buffer),
        )
    }

    pub fn end_acknowledge_alarm(&self, invoke: ConfirmedInvoke) -> Result<()> {
        Self::expect_simple(invoke)
    }

    pub fn begin_life_safety_operation(
        &self,
        address: &BacnetAddress,
        request: &LifeSafetyOperationRequest,
    ) -> Result<ConfirmedInvoke> {
        self.begin_confirmed(
            address,
            ConfirmedServiceChoice::LifeSafetyOperation,
            |buffer| request.encode(buffer),
        )
    }

    pub fn end_life_safety_operation(&self, invoke: ConfirmedInvoke) -> Result<()> {
        Self::expect_simple(invoke)
    }

    pub fn begin_get_event_information(
        &self,
        address: &BacnetAddress,
        request: &GetEventInformationRequest,
    ) -> Result<ConfirmedInvoke> {
        self.begin_confirmed(
            address,
            ConfirmedServiceChoice::GetEventInformation,
            |buffer| request.encode(buffer),
        )
    }

    pub fn end_get_event_information(
        &self,
        invoke: ConfirmedInvoke,
    ) -> Result<GetEventInformationAck> {
        let data = Self::expect_complex(invoke)?;
        GetEventInformationAck::decode(&data).map_err(ClientError::Decode)
    }

    pub fn begin_get_alarm_summary(&self, address: &BacnetAddress) -> Result<ConfirmedInvoke> {
        self.begin_confirmed(address, ConfirmedServiceChoice::GetAlarmSummary, |_| Ok(()))
    }

    pub fn end_get_alarm_summary(&self, invoke: ConfirmedInvoke) -> Result<GetAlarmSummaryAck> {
        let data = Self::expect_complex(invoke)?;
        GetAlarmSummaryAck::decode(&data).map_err(ClientError::Decode)
    }

    /// Send a COV notification that requires acknowledgment.
    pub fn begin_confirmed_cov_notification(
        &self,
        address: &BacnetAddress,
        notification: &CovNotification,
    ) -> Result<ConfirmedInvoke> {
        self.begin_confirmed(
            address,
            ConfirmedServiceChoice::ConfirmedCovNotification,
            |buffer| notification.encode(buffer),
        )
    }

    pub fn end_confirmed_cov_notification(&self, invoke: ConfirmedInvoke) -> Result<()> {
        Self::expect_simple(invoke)
    }

    // ------------------------------------------------------------------
    // Unconfirmed sends
    // ------------------------------------------------------------------

    fn unconfirmed_send<F>(
        &self,
        dest: Option<&BacnetAddress>,
        choice: UnconfirmedServiceChoice,
        encode: F,
    ) -> Result<()>
    where
        F: FnOnce(&mut Vec<u8>) -> service::Result<()>,
    {
        let mut payload = Vec::new();
        encode(&mut payload).map_err(ClientError::Encode)?;
        let apdu = Apdu::UnconfirmedRequest {
            service_choice: choice as u8,
            service_data: payload,
        };
        let transport = self.shared.transport();
        let broadcast = transport.broadcast_address();
        let dest = dest.unwrap_or(&broadcast);
        transport.send(
            &apdu.encode(),
            dest,
            false,
            self.shared.config().transmit_timeout,
        )?;
        Ok(())
    }

    /// Broadcast (or direct) a Who-Is.
    pub fn who_is(&self, request: &WhoIsRequest, dest: Option<&BacnetAddress>) -> Result<()> {
        self.unconfirmed_send(dest, UnconfirmedServiceChoice::WhoIs, |buffer| {
            request.encode(buffer)
        })
    }

    /// Announce this device. Max APDU length comes from the transport and
    /// the vendor id from configuration.
    pub fn i_am(
        &self,
        device_instance: u32,
        segmentation_supported: u32,
        dest: Option<&BacnetAddress>,
    ) -> Result<()> {
        let request = IAmRequest {
            device_id: (8, device_instance), // Device object type
            max_apdu_length_accepted: self.shared.transport().max_apdu_length() as u32,
            segmentation_supported,
            vendor_id: self.shared.config().vendor_id as u32,
        };
        self.unconfirmed_send(dest, UnconfirmedServiceChoice::IAm, |buffer| {
            request.encode(buffer)
        })
    }

    pub fn who_has(&self, request: &WhoHasRequest, dest: Option<&BacnetAddress>) -> Result<()> {
        self.unconfirmed_send(dest, UnconfirmedServiceChoice::WhoHas, |buffer| {
            request.encode(buffer)
        })
    }

    pub fn i_have(&self, request: &IHaveRequest, dest: Option<&BacnetAddress>) -> Result<()> {
        self.unconfirmed_send(dest, UnconfirmedServiceChoice::IHave, |buffer| {
            request.encode(buffer)
        })
    }

    /// Broadcast a time synchronization, UTC or local.
    pub fn time_synchronization(
        &self,
        date_time: &BacnetDateTime,
        utc: bool,
        dest: Option<&BacnetAddress>,
    ) -> Result<()> {
        let choice = if utc {
            UnconfirmedServiceChoice::UtcTimeSynchronization
        } else {
            UnconfirmedServiceChoice::TimeSynchronization
        };
        let request = TimeSynchronizationRequest::new(*date_time);
        self.unconfirmed_send(dest, choice, |buffer| request.encode(buffer))
    }

    pub fn unconfirmed_cov_notification(
        &self,
        notification: &CovNotification,
        dest: Option<&BacnetAddress>,
    ) -> Result<()> {
        self.unconfirmed_send(
            dest,
            UnconfirmedServiceChoice::UnconfirmedCovNotification,
            |buffer| notification.encode(buffer),
        )
    }

    // ------------------------------------------------------------------
    // Response-side sends
    // ------------------------------------------------------------------

    /// Acknowledge a confirmed request that returns no data.
    pub fn simple_ack_response(&self, ctx: &RequestContext) -> Result<()> {
        let apdu = Apdu::SimpleAck {
            invoke_id: ctx.invoke_id,
            service_choice: ctx.service_choice as u8,
        };
        self.shared.transport().send(
            &apdu.encode(),
            &ctx.source,
            false,
            self.shared.config().transmit_timeout,
        )?;
        Ok(())
    }

    /// Send a complex ack, segmenting transparently when the encoded payload
    /// exceeds one frame and the requester negotiated segmentation.
    pub fn complex_ack_response<F>(&self, ctx: &RequestContext, encode: F) -> Result<()>
    where
        F: FnOnce(&mut Vec<u8>) -> service::Result<()>,
    {
        let mut payload = Vec::new();
        encode(&mut payload).map_err(ClientError::Encode)?;
        let config = self.shared.config();
        let segmentation = ctx.segmentation.map(|negotiated| {
            Segmentation::new(
                negotiated.max_segments,
                negotiated.max_apdu,
                config.proposed_window_size,
            )
        });
        segmentation::send_complex_ack(
            &self.shared,
            &ctx.source,
            ctx.invoke_id,
            ctx.service_choice as u8,
            segmentation,
            payload,
        )
    }

    pub fn error_response(
        &self,
        ctx: &RequestContext,
        class: ErrorClass,
        code: ErrorCode,
    ) -> Result<()> {
        dispatch::send_error(
            &self.shared,
            &ctx.source,
            ctx.invoke_id,
            ctx.service_choice as u8,
            class,
            code,
        );
        Ok(())
    }

    pub fn reject_response(
        &self,
        address: &BacnetAddress,
        invoke_id: u8,
        reason: RejectReason,
    ) -> Result<()> {
        dispatch::send_reject(&self.shared, address, invoke_id, reason);
        Ok(())
    }

    pub fn abort_response(
        &self,
        address: &BacnetAddress,
        invoke_id: u8,
        reason: AbortReason,
        server: bool,
    ) -> Result<()> {
        let apdu = Apdu::Abort {
            server,
            invoke_id,
            abort_reason: reason as u8,
        };
        self.shared.transport().send(
            &apdu.encode(),
            address,
            false,
            self.shared.config().transmit_timeout,
        )?;
        Ok(())
    }

    /// Acknowledge one segment explicitly. The engine acks reassembled
    /// streams on its own; this exists for applications that disabled
    /// default reassembly and drive the exchange from the raw observer.
    pub fn segment_ack_response(
        &self,
        address: &BacnetAddress,
        invoke_id: u8,
        sequence_number: u8,
        actual_window_size: u8,
        negative: bool,
        server: bool,
    ) -> Result<()> {
        let apdu = Apdu::SegmentAck {
            negative,
            server,
            invoke_id,
            sequence_number,
            actual_window_size,
        };
        self.shared.transport().send(
            &apdu.encode(),
            address,
            false,
            self.shared.config().transmit_timeout,
        )?;
        Ok(())
    }

    pub fn read_property_ack_response(
        &self,
        ctx: &RequestContext,
        ack: &ReadPropertyAck,
    ) -> Result<()> {
        self.complex_ack_response(ctx, |buffer| ack.encode(buffer))
    }

    pub fn read_property_multiple_ack_response(
        &self,
        ctx: &RequestContext,
        ack: &ReadPropertyMultipleAck,
    ) -> Result<()> {
        self.complex_ack_response(ctx, |buffer| ack.encode(buffer))
    }

    pub fn atomic_read_file_ack_response(
        &self,
        ctx: &RequestContext,
        ack: &AtomicReadFileAck,
    ) -> Result<()> {
        self.complex_ack_response(ctx, |buffer| ack.encode(buffer))
    }

    pub fn atomic_write_file_ack_response(
        &self,
        ctx: &RequestContext,
        ack: &AtomicWriteFileAck,
    ) -> Result<()> {
        self.complex_ack_response(ctx, |buffer| ack.encode(buffer))
    }

    pub fn create_object_ack_response(
        &self,
        ctx: &RequestContext,
        ack: &CreateObjectAck,
    ) -> Result<()> {
        self.complex_ack_response(ctx, |buffer| ack.encode(buffer))
    }

    pub fn get_event_information_ack_response(
        &self,
        ctx: &RequestContext,
        ack: &GetEventInformationAck,
    ) -> Result<()> {
        self.complex_ack_response(ctx, |buffer| ack.encode(buffer))
    }

    pub fn get_alarm_summary_ack_response(
        &self,
        ctx: &RequestContext,
        ack: &GetAlarmSummaryAck,
    ) -> Result<()> {
        self.complex_ack_response(ctx, |buffer| ack.encode(buffer))
    }

    // ------------------------------------------------------------------
    // Event subscriptions
    // ------------------------------------------------------------------

    confirmed_handler_setter!(
        /// Serve ReadProperty requests.
        set_read_property_handler, read_property, ReadPropertyRequest
    );
    confirmed_handler_setter!(
        /// Serve WriteProperty requests.
        set_write_property_handler, write_property, WritePropertyRequest
    );
    confirmed_handler_setter!(
        set_read_property_multiple_handler,
        read_property_multiple,
        ReadPropertyMultipleRequest
    );
    confirmed_handler_setter!(
        set_write_property_multiple_handler,
        write_property_multiple,
        WritePropertyMultipleRequest
    );
    confirmed_handler_setter!(
        set_atomic_read_file_handler,
        atomic_read_file,
        AtomicReadFileRequest
    );
    confirmed_handler_setter!(
        set_atomic_write_file_handler,
        atomic_write_file,
        AtomicWriteFileRequest
    );
    confirmed_handler_setter!(set_subscribe_cov_handler, subscribe_cov, SubscribeCovRequest);
    confirmed_handler_setter!(
        set_subscribe_cov_property_handler,
        subscribe_cov_property,
        SubscribeCovPropertyRequest
    );
    confirmed_handler_setter!(
        set_device_communication_control_handler,
        device_communication_control,
        DeviceCommunicationControlRequest
    );
    confirmed_handler_setter!(
        set_reinitialize_device_handler,
        reinitialize_device,
        ReinitializeDeviceRequest
    );
    confirmed_handler_setter!(set_create_object_handler, create_object, CreateObjectRequest);
    confirmed_handler_setter!(set_delete_object_handler, delete_object, DeleteObjectRequest);
    confirmed_handler_setter!(
        set_acknowledge_alarm_handler,
        acknowledge_alarm,
        AcknowledgeAlarmRequest
    );
    confirmed_handler_setter!(
        set_life_safety_operation_handler,
        life_safety_operation,
        LifeSafetyOperationRequest
    );
    confirmed_handler_setter!(
        set_get_event_information_handler,
        get_event_information,
        GetEventInformationRequest
    );
    confirmed_handler_setter!(
        /// Serve GetAlarmSummary requests (the request has no parameters).
        set_get_alarm_summary_handler, get_alarm_summary, ()
    );
    confirmed_handler_setter!(
        /// Receive COV notifications delivered as a confirmed service. The
        /// handler acknowledges through the responder API like any other
        /// confirmed service.
        set_cov_notification_handler, cov_notification, CovNotification
    );

    /// Fallback for confirmed services without a typed handler.
    pub fn set_raw_confirmed_handler<F>(&self, handler: F)
    where
        F: Fn(&BacnetClient, &RequestContext, &[u8]) -> HandlerResult + Send + Sync + 'static,
    {
        self.shared
            .handlers
            .lock()
            .expect("handlers poisoned")
            .raw_confirmed = Some(Arc::new(handler));
    }

    unconfirmed_handler_setter!(
        /// Observe Who-Is requests; answering with I-Am is the application's
        /// decision.
        set_who_is_handler, who_is, WhoIsRequest
    );
    unconfirmed_handler_setter!(set_i_am_handler, i_am, IAmRequest);
    unconfirmed_handler_setter!(set_who_has_handler, who_has, WhoHasRequest);
    unconfirmed_handler_setter!(set_i_have_handler, i_have, IHaveRequest);
    unconfirmed_handler_setter!(
        set_unconfirmed_cov_notification_handler,
        unconfirmed_cov_notification,
        CovNotification
    );

    /// Observe time synchronization; the flag distinguishes the UTC form.
    pub fn set_time_synchronization_handler<F>(&self, handler: F)
    where
        F: Fn(&BacnetClient, &BacnetAddress, TimeSynchronizationRequest, bool)
            + Send
            + Sync
            + 'static,
    {
        self.shared
            .handlers
            .lock()
            .expect("handlers poisoned")
            .time_synchronization = Some(Arc::new(handler));
    }

    /// Fallback for unconfirmed services without a typed handler.
    pub fn set_raw_unconfirmed_handler<F>(&self, handler: F)
    where
        F: Fn(&BacnetClient, &BacnetAddress, u8, &[u8]) + Send + Sync + 'static,
    {
        self.shared
            .handlers
            .lock()
            .expect("handlers poisoned")
            .raw_unconfirmed = Some(Arc::new(handler));
    }

    observer_setter!(
        /// Observe every inbound segment before reassembly, for out-of-band
        /// streaming: (source, invoke id, sequence, more follows, payload).
        set_segment_observer, on_segment, (&BacnetAddress, u8, u8, bool, &[u8])
    );
    observer_setter!(set_simple_ack_observer, on_simple_ack, (&BacnetAddress, u8, u8));
    observer_setter!(
        set_complex_ack_observer,
        on_complex_ack,
        (&BacnetAddress, u8, u8, &[u8])
    );
    observer_setter!(
        set_error_observer,
        on_error,
        (&BacnetAddress, u8, u8, ErrorClass, ErrorCode)
    );
    observer_setter!(set_abort_observer, on_abort, (&BacnetAddress, u8, AbortReason));
    observer_setter!(set_reject_observer, on_reject, (&BacnetAddress, u8, RejectReason));
    observer_setter!(
        set_segment_ack_observer,
        on_segment_ack,
        (&BacnetAddress, u8, u8, u8, bool)
    );
    observer_setter!(
        set_confirmed_request_observer,
        on_confirmed_request,
        (&BacnetAddress, u8, u8, &[u8])
    );
    observer_setter!(
        set_unconfirmed_request_observer,
        on_unconfirmed_request,
        (&BacnetAddress, u8, &[u8])
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::testutil::{loopback_pair, test_client_with_config, CaptureTransport};
    use crate::encoding;
    use std::sync::mpsc;

    fn short_config() -> ClientConfig {
        ClientConfig {
            timeout: Duration::from_millis(300),
            transmit_timeout: Duration::from_millis(300),
            retries: 2,
            ..ClientConfig::default()
        }
    }

    #[test]
    fn read_property_round_trip_over_loopback() {
        let (client, server, server_addr, _client_addr) = loopback_pair(short_config());

        server.set_read_property_handler(|responder, ctx, request| {
            assert_eq!(request.property_id, 85);
            let mut value = Vec::new();
            encoding::encode_real(&mut value, 20.5);
            let ack = ReadPropertyAck {
                object_id: request.object_id,
                property_id: request.property_id,
                array_index: request.array_index,
                value,
            };
            responder
                .read_property_ack_response(ctx, &ack)
                .map_err(|_| (ErrorClass::Services, ErrorCode::Other))
        });

        let request = ReadPropertyRequest::new((0, 1), 85);
        let invoke = client.begin_read_property(&server_addr, &request).unwrap();
        let ack = client.end_read_property(invoke).unwrap();
        assert_eq!(ack.object_id, (0, 1));
        let (value, _) = encoding::decode_real(&ack.value).unwrap();
        assert_eq!(value, 20.5);
    }

    #[test]
    fn write_property_simple_ack_and_priority_stamping() {
        let (client, server, server_addr, _client_addr) = loopback_pair(short_config());
        client.set_write_priority(8).unwrap();

        let (tx, rx) = mpsc::channel();
        server.set_write_property_handler(move |responder, ctx, request| {
            let _ = tx.send(request.priority);
            responder
                .simple_ack_response(ctx)
                .map_err(|_| (ErrorClass::Services, ErrorCode::Other))
        });

        let mut value = Vec::new();
        encoding::encode_real(&mut value, 1.5);
        let request = WritePropertyRequest::new((1, 2), 85, value);
        let invoke = client.begin_write_property(&server_addr, &request).unwrap();
        client.end_write_property(invoke).unwrap();
        assert_eq!(rx.try_recv().unwrap(), Some(8));
    }

    #[test]
    fn write_priority_validation() {
        let (client, _transport) = test_client_with_config(short_config());
        assert!(matches!(
            client.set_write_priority(17),
            Err(ClientError::InvalidConfig(_))
        ));
        client.set_write_priority(16).unwrap();
        client.set_write_priority(0).unwrap();
    }

    #[test]
    fn malformed_confirmed_request_yields_abort_other_error() {
        let (client, server, server_addr, _client_addr) = loopback_pair(short_config());

        // The server supports WriteProperty, but the payload stops before
        // the closing tag of the value, which no reject reason describes
        server.set_write_property_handler(|responder, ctx, _request| {
            responder
                .simple_ack_response(ctx)
                .map_err(|_| (ErrorClass::Services, ErrorCode::Other))
        });

        let mut value = Vec::new();
        encoding::encode_real(&mut value, 3.5);
        let mut payload = Vec::new();
        WritePropertyRequest::new((0, 1), 85, value)
            .encode(&mut payload)
            .unwrap();
        payload.truncate(payload.len() - 1);
        let invoke = client
            .begin_confirmed(&server_addr, ConfirmedServiceChoice::WriteProperty, |b| {
                b.extend_from_slice(&payload);
                Ok(())
            })
            .unwrap();
        let result = invoke.wait();
        match result {
            Err(ClientError::RemoteError { class, code }) => {
                assert_eq!(class, ErrorClass::Services);
                assert_eq!(code, ErrorCode::AbortOther);
            }
            other => panic!("expected remote error, got {other:?}"),
        }
    }

    #[test]
    fn missing_parameter_yields_reject() {
        let (client, server, server_addr, _client_addr) = loopback_pair(short_config());
        server.set_read_property_handler(|_, _, _| Ok(()));

        // Empty payload: object identifier missing
        let invoke = client
            .begin_confirmed(&server_addr, ConfirmedServiceChoice::ReadProperty, |_| {
                Ok(())
            })
            .unwrap();
        assert!(matches!(
            invoke.wait(),
            Err(ClientError::RemoteReject(
                RejectReason::MissingRequiredParameter
            ))
        ));
    }

    #[test]
    fn unsupported_service_yields_unrecognized_service_reject() {
        let (client, _server, server_addr, _client_addr) = loopback_pair(short_config());
        // No handler registered on the server at all
        let request = DeleteObjectRequest { object_id: (0, 9) };
        let invoke = client.begin_delete_object(&server_addr, &request).unwrap();
        assert!(matches!(
            invoke.wait(),
            Err(ClientError::RemoteReject(RejectReason::UnrecognizedService))
        ));
    }

    #[test]
    fn handler_error_is_relayed_as_error_pdu() {
        let (client, server, server_addr, _client_addr) = loopback_pair(short_config());
        server.set_read_property_handler(|_, _, _| {
            Err((ErrorClass::Object, ErrorCode::UnknownObject))
        });

        let request = ReadPropertyRequest::new((0, 404), 85);
        let invoke = client.begin_read_property(&server_addr, &request).unwrap();
        match client.end_read_property(invoke) {
            Err(ClientError::RemoteError { class, code }) => {
                assert_eq!(class, ErrorClass::Object);
                assert_eq!(code, ErrorCode::UnknownObject);
            }
            other => panic!("expected remote error, got {other:?}"),
        }
    }

    #[test]
    fn segmented_response_reassembles_transparently() {
        let mut config = short_config();
        config.proposed_window_size = 2;
        let (client, server, server_addr, _client_addr) = loopback_pair(config);

        let payload: Vec<u8> = (0..5000u32).map(|i| (i % 251) as u8).collect();
        let served = payload.clone();
        server.set_raw_confirmed_handler(move |responder, ctx, _data| {
            let body = served.clone();
            responder
                .complex_ack_response(ctx, move |buffer| {
                    buffer.extend_from_slice(&body);
                    Ok(())
                })
                .map_err(|_| (ErrorClass::Services, ErrorCode::Other))
        });

        let (seg_tx, seg_rx) = mpsc::channel();
        client.set_segment_observer(move |_, _, sequence, _, _| {
            let _ = seg_tx.send(sequence);
        });

        let invoke = client
            .begin_confirmed(&server_addr, ConfirmedServiceChoice::ReadProperty, |b| {
                ReadPropertyRequest::new((0, 1), 85).encode(b)
            })
            .unwrap();
        let ack = invoke.wait().unwrap();
        assert!(!ack.simple);
        assert_eq!(ack.service_data, payload);

        // The observer saw the raw segments, in order and without gaps
        let mut sequences = Vec::new();
        while let Ok(sequence) = seg_rx.try_recv() {
            sequences.push(sequence);
        }
        let expected: Vec<u8> = (0..sequences.len() as u8).collect();
        assert_eq!(sequences, expected);
        assert!(sequences.len() > 1, "response should have been segmented");
    }

    #[test]
    fn oversize_request_fails_locally() {
        let (client, transport) = test_client_with_config(short_config());
        let dest = CaptureTransport::peer();
        let result = client.begin_confirmed(&dest, ConfirmedServiceChoice::WriteProperty, |b| {
            b.extend_from_slice(&vec![0u8; 4000]);
            Ok(())
        });
        assert!(matches!(result, Err(ClientError::RequestTooLarge { .. })));
        assert!(transport.sent_frames().is_empty());
    }

    #[test]
    fn who_is_i_am_discovery_over_loopback() {
        let (client, server, _server_addr, _client_addr) = loopback_pair(short_config());

        server.set_who_is_handler(|responder, source, request| {
            if request.matches(1234) {
                responder.i_am(1234, 3, Some(source)).unwrap();
            }
        });

        let (tx, rx) = mpsc::channel();
        client.set_i_am_handler(move |_, _, iam| {
            let _ = tx.send(iam);
        });

        client
            .who_is(&WhoIsRequest::for_device(1234), None)
            .unwrap();
        let iam = rx
            .recv_timeout(Duration::from_secs(1))
            .expect("i-am should come back");
        assert_eq!(iam.device_id, (8, 1234));
        assert_eq!(iam.vendor_id, 260);
    }

    #[test]
    fn time_synchronization_event() {
        let (client, server, _server_addr, _client_addr) = loopback_pair(short_config());
        let (tx, rx) = mpsc::channel();
        server.set_time_synchronization_handler(move |_, _, request, utc| {
            let _ = tx.send((request.date_time.date.year, utc));
        });

        let now = BacnetDateTime::now_utc();
        client.time_synchronization(&now, true, None).unwrap();
        let (year, utc) = rx.recv_timeout(Duration::from_secs(1)).unwrap();
        assert_eq!(year, now.date.year);
        assert!(utc);
    }

    #[test]
    fn cov_notification_round_trip() {
        let (client, server, server_addr, _client_addr) = loopback_pair(short_config());
        let (tx, rx) = mpsc::channel();
        server.set_cov_notification_handler(move |responder, ctx, notification| {
            let _ = tx.send(notification.process_id);
            responder
                .simple_ack_response(ctx)
                .map_err(|_| (ErrorClass::Services, ErrorCode::Other))
        });

        let mut value = Vec::new();
        encoding::encode_real(&mut value, 71.6);
        let notification = CovNotification {
            process_id: 9,
            initiating_device: (8, 1),
            monitored_object: (0, 4),
            time_remaining_seconds: 60,
            values: vec![crate::service::PropertyNotification {
                property_id: 85,
                array_index: None,
                value,
            }],
        };
        let invoke = client
            .begin_confirmed_cov_notification(&server_addr, &notification)
            .unwrap();
        client.end_confirmed_cov_notification(invoke).unwrap();
        assert_eq!(rx.try_recv().unwrap(), 9);
    }
}
