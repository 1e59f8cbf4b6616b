//! BACnet service envelopes.
//!
//! This module defines the service choice enumerations, the reject/abort
//! reason codes, the error class/code enumerations, and typed
//! request/acknowledgment envelopes for the confirmed and unconfirmed
//! services the engine exposes.
//!
//! The envelopes stop at the codec boundary: structural fields (object
//! identifiers, property numbers, flags) are decoded, but property *values*
//! are carried as raw application-encoded byte ranges (`Vec<u8>`), delimited
//! with [`crate::encoding::value_extent`] and friends. Turning those bytes
//! into typed values is the job of an external value codec.
//!
//! Decode failures are classified so the dispatcher can answer a malformed
//! confirmed request with the right reject reason, or, where no reject
//! reason applies, with an error of class `Services`/code `AbortOther`.

use std::error::Error as StdError;
use std::fmt;

use crate::encoding::{
    self, decode_bit_string, decode_boolean, decode_context_boolean,
    decode_context_character_string, decode_context_enumerated, decode_context_object_id,
    decode_context_real, decode_context_signed, decode_context_unsigned, decode_enumerated,
    decode_object_identifier, decode_octet_string, decode_signed, decode_unsigned,
    encode_bit_string, encode_boolean, encode_character_string, encode_closing_tag,
    encode_context_boolean, encode_context_character_string, encode_context_enumerated,
    encode_context_object_id, encode_context_real, encode_context_signed, encode_context_unsigned,
    encode_enumerated, encode_object_identifier, encode_octet_string, encode_opening_tag,
    encode_signed, encode_unsigned, peek_context_tag, peek_opening_tag, until_closing_tag,
    EncodingError,
};
use crate::vendor_enum;

/// Result type for service operations
pub type Result<T> = std::result::Result<T, ServiceError>;

/// BACnet object identifier as (object type, instance).
///
/// Kept structural on purpose: object modeling is outside this crate.
pub type ObjectId = (u16, u32);

/// Special array index value meaning "the whole array"
pub const BACNET_ARRAY_ALL: u32 = 0xFFFF_FFFF;

/// Errors raised while encoding or decoding a service payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServiceError {
    /// Service choice octet is not one this engine knows
    UnsupportedServiceChoice(u8),
    /// A required parameter (by name) was absent
    MissingRequiredParameter(&'static str),
    /// Well-formed parameters followed by unexpected trailing data
    TooManyArguments,
    /// Parameters are individually valid but mutually inconsistent
    InconsistentParameters(&'static str),
    /// Tag-level failure from the primitive codec
    Encoding(EncodingError),
}

impl fmt::Display for ServiceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServiceError::UnsupportedServiceChoice(choice) => {
                write!(f, "Unsupported service choice: {}", choice)
            }
            ServiceError::MissingRequiredParameter(name) => {
                write!(f, "Missing required parameter: {}", name)
            }
            ServiceError::TooManyArguments => write!(f, "Too many arguments"),
            ServiceError::InconsistentParameters(msg) => {
                write!(f, "Inconsistent parameters: {}", msg)
            }
            ServiceError::Encoding(e) => write!(f, "Encoding error: {}", e),
        }
    }
}

impl StdError for ServiceError {}

impl From<EncodingError> for ServiceError {
    fn from(e: EncodingError) -> Self {
        ServiceError::Encoding(e)
    }
}

impl ServiceError {
    /// Reject reason to answer a malformed confirmed request with, when the
    /// failure maps onto one. `None` means the dispatcher falls back to an
    /// error reply of class `Services`, code `AbortOther`.
    pub fn reject_reason(&self) -> Option<RejectReason> {
        match self {
            ServiceError::UnsupportedServiceChoice(_) => Some(RejectReason::UnrecognizedService),
            ServiceError::MissingRequiredParameter(_) => {
                Some(RejectReason::MissingRequiredParameter)
            }
            ServiceError::TooManyArguments => Some(RejectReason::TooManyArguments),
            ServiceError::InconsistentParameters(_) => Some(RejectReason::InconsistentParameters),
            ServiceError::Encoding(EncodingError::InvalidTag) => Some(RejectReason::InvalidTag),
            ServiceError::Encoding(EncodingError::ValueOutOfRange) => {
                Some(RejectReason::ParameterOutOfRange)
            }
            ServiceError::Encoding(_) => None,
        }
    }
}

/// Confirmed service choices
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ConfirmedServiceChoice {
    // Alarm and event services
    AcknowledgeAlarm = 0,
    ConfirmedCovNotification = 1,
    ConfirmedEventNotification = 2,
    GetAlarmSummary = 3,
    GetEnrollmentSummary = 4,
    SubscribeCov = 5,
    GetEventInformation = 29,
    LifeSafetyOperation = 27,
    SubscribeCovProperty = 28,

    // File access services
    AtomicReadFile = 6,
    AtomicWriteFile = 7,

    // Object access services
    AddListElement = 8,
    RemoveListElement = 9,
    CreateObject = 10,
    DeleteObject = 11,
    ReadProperty = 12,
    ReadPropertyMultiple = 14,
    WriteProperty = 15,
    WritePropertyMultiple = 16,
    ReadRange = 26,

    // Remote device management services
    DeviceCommunicationControl = 17,
    ConfirmedPrivateTransfer = 18,
    ConfirmedTextMessage = 19,
    ReinitializeDevice = 20,

    // Virtual terminal services
    VtOpen = 21,
    VtClose = 22,
    VtData = 23,
}

impl TryFrom<u8> for ConfirmedServiceChoice {
    type Error = ServiceError;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0 => Ok(Self::AcknowledgeAlarm),
            1 => Ok(Self::ConfirmedCovNotification),
            2 => Ok(Self::ConfirmedEventNotification),
            3 => Ok(Self::GetAlarmSummary),
            4 => Ok(Self::GetEnrollmentSummary),
            5 => Ok(Self::SubscribeCov),
            6 => Ok(Self::AtomicReadFile),
            7 => Ok(Self::AtomicWriteFile),
            8 => Ok(Self::AddListElement),
            9 => Ok(Self::RemoveListElement),
            10 => Ok(Self::CreateObject),
            11 => Ok(Self::DeleteObject),
            12 => Ok(Self::ReadProperty),
            14 => Ok(Self::ReadPropertyMultiple),
            15 => Ok(Self::WriteProperty),
            16 => Ok(Self::WritePropertyMultiple),
            17 => Ok(Self::DeviceCommunicationControl),
            18 => Ok(Self::ConfirmedPrivateTransfer),
            19 => Ok(Self::ConfirmedTextMessage),
            20 => Ok(Self::ReinitializeDevice),
            21 => Ok(Self::VtOpen),
            22 => Ok(Self::VtClose),
            23 => Ok(Self::VtData),
            26 => Ok(Self::ReadRange),
            27 => Ok(Self::LifeSafetyOperation),
            28 => Ok(Self::SubscribeCovProperty),
            29 => Ok(Self::GetEventInformation),
            other => Err(ServiceError::UnsupportedServiceChoice(other)),
        }
    }
}

/// Unconfirmed service choices
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum UnconfirmedServiceChoice {
    IAm = 0,
    IHave = 1,
    UnconfirmedCovNotification = 2,
    UnconfirmedEventNotification = 3,
    UnconfirmedPrivateTransfer = 4,
    UnconfirmedTextMessage = 5,
    TimeSynchronization = 6,
    WhoHas = 7,
    WhoIs = 8,
    UtcTimeSynchronization = 9,
    WriteGroup = 10,
}

impl TryFrom<u8> for UnconfirmedServiceChoice {
    type Error = ServiceError;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0 => Ok(Self::IAm),
            1 => Ok(Self::IHave),
            2 => Ok(Self::UnconfirmedCovNotification),
            3 => Ok(Self::UnconfirmedEventNotification),
            4 => Ok(Self::UnconfirmedPrivateTransfer),
            5 => Ok(Self::UnconfirmedTextMessage),
            6 => Ok(Self::TimeSynchronization),
            7 => Ok(Self::WhoHas),
            8 => Ok(Self::WhoIs),
            9 => Ok(Self::UtcTimeSynchronization),
            10 => Ok(Self::WriteGroup),
            other => Err(ServiceError::UnsupportedServiceChoice(other)),
        }
    }
}

/// Reject reason codes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RejectReason {
    Other = 0,
    BufferOverflow = 1,
    InconsistentParameters = 2,
    InvalidParameterDataType = 3,
    InvalidTag = 4,
    MissingRequiredParameter = 5,
    ParameterOutOfRange = 6,
    TooManyArguments = 7,
    UndefinedEnumeration = 8,
    UnrecognizedService = 9,
}

impl RejectReason {
    /// Classify a raw reason octet; unknown values fold into `Other`.
    pub fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::BufferOverflow,
            2 => Self::InconsistentParameters,
            3 => Self::InvalidParameterDataType,
            4 => Self::InvalidTag,
            5 => Self::MissingRequiredParameter,
            6 => Self::ParameterOutOfRange,
            7 => Self::TooManyArguments,
            8 => Self::UndefinedEnumeration,
            9 => Self::UnrecognizedService,
            _ => Self::Other,
        }
    }
}

/// Abort reason codes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum AbortReason {
    Other = 0,
    BufferOverflow = 1,
    InvalidApduInThisState = 2,
    PreemptedByHigherPriorityTask = 3,
    SegmentationNotSupported = 4,
    SecurityError = 5,
    InsufficientSecurity = 6,
    WindowSizeOutOfRange = 7,
    ApplicationExceededReplyTime = 8,
    OutOfResources = 9,
    TsmTimeout = 10,
    ApduTooLong = 11,
}

impl AbortReason {
    /// Classify a raw reason octet; unknown values fold into `Other`.
    pub fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::BufferOverflow,
            2 => Self::InvalidApduInThisState,
            3 => Self::PreemptedByHigherPriorityTask,
            4 => Self::SegmentationNotSupported,
            5 => Self::SecurityError,
            6 => Self::InsufficientSecurity,
            7 => Self::WindowSizeOutOfRange,
            8 => Self::ApplicationExceededReplyTime,
            9 => Self::OutOfResources,
            10 => Self::TsmTimeout,
            11 => Self::ApduTooLong,
            _ => Self::Other,
        }
    }
}

vendor_enum! {
    /// Error class carried by an error PDU.
    ErrorClass {
        Device = 0,
        Object = 1,
        Property = 2,
        Resources = 3,
        Security = 4,
        Services = 5,
        Vt = 6,
        Communication = 7,
    },
    u16,
    64..=65535
}

vendor_enum! {
    /// Error code carried by an error PDU. Only the codes this engine
    /// produces or inspects are named; everything else classifies as
    /// proprietary or reserved.
    ErrorCode {
        Other = 0,
        DeviceBusy = 3,
        InvalidDataType = 9,
        NoSpaceToWriteProperty = 20,
        Timeout = 30,
        UnknownObject = 31,
        UnknownProperty = 32,
        ValueOutOfRange = 37,
        WriteAccessDenied = 40,
        AbortBufferOverflow = 51,
        AbortInvalidApduInThisState = 52,
        AbortPreemptedByHigherPriorityTask = 53,
        AbortSegmentationNotSupported = 54,
        AbortProprietary = 55,
        AbortOther = 56,
        AbortApduTooLong = 123,
    },
    u16,
    256..=65535
}

// ---------------------------------------------------------------------------
// Object access services
// ---------------------------------------------------------------------------

/// ReadProperty request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadPropertyRequest {
    pub object_id: ObjectId,
    pub property_id: u32,
    pub array_index: Option<u32>,
}

impl ReadPropertyRequest {
    pub fn new(object_id: ObjectId, property_id: u32) -> Self {
        Self {
            object_id,
            property_id,
            array_index: None,
        }
    }

    pub fn with_array_index(mut self, index: u32) -> Self {
        self.array_index = Some(index);
        self
    }

    pub fn encode(&self, buffer: &mut Vec<u8>) -> Result<()> {
        encode_context_object_id(buffer, 0, self.object_id.0, self.object_id.1)?;
        encode_context_unsigned(buffer, 1, self.property_id);
        if let Some(index) = self.array_index {
            encode_context_unsigned(buffer, 2, index);
        }
        Ok(())
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        if !peek_context_tag(data, 0) {
            return Err(ServiceError::MissingRequiredParameter("object-identifier"));
        }
        let (object_id, mut pos) = decode_context_object_id(data, 0)?;
        if !peek_context_tag(&data[pos..], 1) {
            return Err(ServiceError::MissingRequiredParameter("property-identifier"));
        }
        let (property_id, consumed) = decode_context_unsigned(&data[pos..], 1)?;
        pos += consumed;
        let array_index = if peek_context_tag(&data[pos..], 2) {
            let (index, consumed) = decode_context_unsigned(&data[pos..], 2)?;
            pos += consumed;
            Some(index)
        } else {
            None
        };
        if pos != data.len() {
            return Err(ServiceError::TooManyArguments);
        }
        Ok(Self {
            object_id,
            property_id,
            array_index,
        })
    }
}

/// ReadProperty acknowledgment; the property value stays raw.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadPropertyAck {
    pub object_id: ObjectId,
    pub property_id: u32,
    pub array_index: Option<u32>,
    /// Application-encoded value bytes, uninterpreted
    pub value: Vec<u8>,
}

impl ReadPropertyAck {
    pub fn encode(&self, buffer: &mut Vec<u8>) -> Result<()> {
        encode_context_object_id(buffer, 0, self.object_id.0, self.object_id.1)?;
        encode_context_unsigned(buffer, 1, self.property_id);
        if let Some(index) = self.array_index {
            encode_context_unsigned(buffer, 2, index);
        }
        encode_opening_tag(buffer, 3);
        buffer.extend_from_slice(&self.value);
        encode_closing_tag(buffer, 3);
        Ok(())
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        let (object_id, mut pos) = decode_context_object_id(data, 0)?;
        let (property_id, consumed) = decode_context_unsigned(&data[pos..], 1)?;
        pos += consumed;
        let array_index = if peek_context_tag(&data[pos..], 2) {
            let (index, consumed) = decode_context_unsigned(&data[pos..], 2)?;
            pos += consumed;
            Some(index)
        } else {
            None
        };
        if !peek_opening_tag(&data[pos..], 3) {
            return Err(ServiceError::MissingRequiredParameter("property-value"));
        }
        pos += 1;
        let value_len = until_closing_tag(&data[pos..], 3)?;
        let value = data[pos..pos + value_len].to_vec();
        pos += value_len + 1;
        if pos != data.len() {
            return Err(ServiceError::TooManyArguments);
        }
        Ok(Self {
            object_id,
            property_id,
            array_index,
            value,
        })
    }
}

/// WriteProperty request; the value is already application-encoded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WritePropertyRequest {
    pub object_id: ObjectId,
    pub property_id: u32,
    pub array_index: Option<u32>,
    pub value: Vec<u8>,
    /// Priority-array slot 1..=16; `None` writes without priority
    pub priority: Option<u8>,
}

impl WritePropertyRequest {
    pub fn new(object_id: ObjectId, property_id: u32, value: Vec<u8>) -> Self {
        Self {
            object_id,
            property_id,
            array_index: None,
            value,
            priority: None,
        }
    }

    pub fn encode(&self, buffer: &mut Vec<u8>) -> Result<()> {
        encode_context_object_id(buffer, 0, self.object_id.0, self.object_id.1)?;
        encode_context_unsigned(buffer, 1, self.property_id);
        if let Some(index) = self.array_index {
            encode_context_unsigned(buffer, 2, index);
        }
        encode_opening_tag(buffer, 3);
        buffer.extend_from_slice(&self.value);
        encode_closing_tag(buffer, 3);
        if let Some(priority) = self.priority {
            encode_context_unsigned(buffer, 4, priority as u32);
        }
        Ok(())
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        if !peek_context_tag(data, 0) {
            return Err(ServiceError::MissingRequiredParameter("object-identifier"));
        }
        let (object_id, mut pos) = decode_context_object_id(data, 0)?;
        if !peek_context_tag(&data[pos..], 1) {
            return Err(ServiceError::MissingRequiredParameter("property-identifier"));
        }
        let (property_id, consumed) = decode_context_unsigned(&data[pos..], 1)?;
        pos += consumed;
        let array_index = if peek_context_tag(&data[pos..], 2) {
            let (index, consumed) = decode_context_unsigned(&data[pos..], 2)?;
            pos += consumed;
            Some(index)
        } else {
            None
        };
        if !peek_opening_tag(&data[pos..], 3) {
            return Err(ServiceError::MissingRequiredParameter("property-value"));
        }
        pos += 1;
        let value_len = until_closing_tag(&data[pos..], 3)?;
        let value = data[pos..pos + value_len].to_vec();
        pos += value_len + 1;
        let priority = if peek_context_tag(&data[pos..], 4) {
            let (priority, consumed) = decode_context_unsigned(&data[pos..], 4)?;
            pos += consumed;
            if !(1..=16).contains(&priority) {
                return Err(ServiceError::Encoding(EncodingError::ValueOutOfRange));
            }
            Some(priority as u8)
        } else {
            None
        };
        if pos != data.len() {
            return Err(ServiceError::TooManyArguments);
        }
        Ok(Self {
            object_id,
            property_id,
            array_index,
            value,
            priority,
        })
    }
}

/// Reference to one property, optionally one array slot of it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PropertyReference {
    pub property_id: u32,
    pub array_index: Option<u32>,
}

impl PropertyReference {
    pub fn new(property_id: u32) -> Self {
        Self {
            property_id,
            array_index: None,
        }
    }
}

/// One object with the properties to read from it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadAccessSpecification {
    pub object_id: ObjectId,
    pub property_references: Vec<PropertyReference>,
}

/// ReadPropertyMultiple request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadPropertyMultipleRequest {
    pub specifications: Vec<ReadAccessSpecification>,
}

impl ReadPropertyMultipleRequest {
    pub fn encode(&self, buffer: &mut Vec<u8>) -> Result<()> {
        for spec in &self.specifications {
            encode_context_object_id(buffer, 0, spec.object_id.0, spec.object_id.1)?;
            encode_opening_tag(buffer, 1);
            for reference in &spec.property_references {
                encode_context_unsigned(buffer, 0, reference.property_id);
                if let Some(index) = reference.array_index {
                    encode_context_unsigned(buffer, 1, index);
                }
            }
            encode_closing_tag(buffer, 1);
        }
        Ok(())
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        let mut specifications = Vec::new();
        let mut pos = 0;
        while pos < data.len() {
            let (object_id, consumed) = decode_context_object_id(&data[pos..], 0)?;
            pos += consumed;
            if !peek_opening_tag(&data[pos..], 1) {
                return Err(ServiceError::MissingRequiredParameter(
                    "list-of-property-references",
                ));
            }
            pos += 1;
            let mut property_references = Vec::new();
            loop {
                if pos >= data.len() {
                    return Err(ServiceError::Encoding(EncodingError::BufferUnderflow));
                }
                if is_closing(&data[pos..], 1) {
                    pos += 1;
                    break;
                }
                if !peek_context_tag(&data[pos..], 0) {
                    return Err(ServiceError::Encoding(EncodingError::InvalidTag));
                }
                let (property_id, consumed) = decode_context_unsigned(&data[pos..], 0)?;
                pos += consumed;
                let array_index = if peek_context_tag(&data[pos..], 1)
                    && !is_closing(&data[pos..], 1)
                {
                    let (index, consumed) = decode_context_unsigned(&data[pos..], 1)?;
                    pos += consumed;
                    Some(index)
                } else {
                    None
                };
                property_references.push(PropertyReference {
                    property_id,
                    array_index,
                });
            }
            specifications.push(ReadAccessSpecification {
                object_id,
                property_references,
            });
        }
        if specifications.is_empty() {
            return Err(ServiceError::MissingRequiredParameter(
                "read-access-specification",
            ));
        }
        Ok(Self { specifications })
    }
}

fn is_closing(data: &[u8], tag_number: u8) -> bool {
    matches!(
        encoding::decode_tag(data),
        Ok(encoding::Tag {
            number,
            context: true,
            lvt: encoding::TagLvt::Closing,
            ..
        }) if number == tag_number
    )
}

/// Per-property outcome inside a ReadPropertyMultiple ack
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PropertyAccessResult {
    pub property_id: u32,
    pub array_index: Option<u32>,
    /// Raw value bytes on success, error class/code on failure
    pub result: std::result::Result<Vec<u8>, (ErrorClass, ErrorCode)>,
}

/// Per-object results inside a ReadPropertyMultiple ack
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadAccessResult {
    pub object_id: ObjectId,
    pub results: Vec<PropertyAccessResult>,
}

/// ReadPropertyMultiple acknowledgment
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadPropertyMultipleAck {
    pub results: Vec<ReadAccessResult>,
}

impl ReadPropertyMultipleAck {
    pub fn encode(&self, buffer: &mut Vec<u8>) -> Result<()> {
        for access in &self.results {
            encode_context_object_id(buffer, 0, access.object_id.0, access.object_id.1)?;
            encode_opening_tag(buffer, 1);
            for entry in &access.results {
                encode_context_unsigned(buffer, 2, entry.property_id);
                if let Some(index) = entry.array_index {
                    encode_context_unsigned(buffer, 3, index);
                }
                match &entry.result {
                    Ok(value) => {
                        encode_opening_tag(buffer, 4);
                        buffer.extend_from_slice(value);
                        encode_closing_tag(buffer, 4);
                    }
                    Err((class, code)) => {
                        encode_opening_tag(buffer, 5);
                        encode_enumerated(buffer, u16::from(*class) as u32);
                        encode_enumerated(buffer, u16::from(*code) as u32);
                        encode_closing_tag(buffer, 5);
                    }
                }
            }
            encode_closing_tag(buffer, 1);
        }
        Ok(())
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        let mut results = Vec::new();
        let mut pos = 0;
        while pos < data.len() {
            let (object_id, consumed) = decode_context_object_id(&data[pos..], 0)?;
            pos += consumed;
            if !peek_opening_tag(&data[pos..], 1) {
                return Err(ServiceError::MissingRequiredParameter("list-of-results"));
            }
            pos += 1;
            let mut entries = Vec::new();
            while !is_closing(&data[pos..], 1) {
                let (property_id, consumed) = decode_context_unsigned(&data[pos..], 2)?;
                pos += consumed;
                let array_index = if peek_context_tag(&data[pos..], 3) {
                    let (index, consumed) = decode_context_unsigned(&data[pos..], 3)?;
                    pos += consumed;
                    Some(index)
                } else {
                    None
                };
                let result = if peek_opening_tag(&data[pos..], 4) {
                    pos += 1;
                    let value_len = until_closing_tag(&data[pos..], 4)?;
                    let value = data[pos..pos + value_len].to_vec();
                    pos += value_len + 1;
                    Ok(value)
                } else if peek_opening_tag(&data[pos..], 5) {
                    pos += 1;
                    let (class, consumed) = decode_enumerated(&data[pos..])?;
                    pos += consumed;
                    let (code, consumed) = decode_enumerated(&data[pos..])?;
                    pos += consumed;
                    if !is_closing(&data[pos..], 5) {
                        return Err(ServiceError::Encoding(EncodingError::InvalidTag));
                    }
                    pos += 1;
                    Err((
                        ErrorClass::from(class as u16),
                        ErrorCode::from(code as u16),
                    ))
                } else {
                    return Err(ServiceError::MissingRequiredParameter("read-result"));
                };
                entries.push(PropertyAccessResult {
                    property_id,
                    array_index,
                    result,
                });
            }
            pos += 1;
            results.push(ReadAccessResult {
                object_id,
                results: entries,
            });
        }
        Ok(Self { results })
    }
}

/// One property value to write inside a WritePropertyMultiple request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PropertyValueSpec {
    pub property_id: u32,
    pub array_index: Option<u32>,
    pub value: Vec<u8>,
    pub priority: Option<u8>,
}

/// One object with the values to write to it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteAccessSpecification {
    pub object_id: ObjectId,
    pub values: Vec<PropertyValueSpec>,
}

/// WritePropertyMultiple request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WritePropertyMultipleRequest {
    pub specifications: Vec<WriteAccessSpecification>,
}

impl WritePropertyMultipleRequest {
    pub fn encode(&self, buffer: &mut Vec<u8>) -> Result<()> {
        for spec in &self.specifications {
            encode_context_object_id(buffer, 0, spec.object_id.0, spec.object_id.1)?;
            encode_opening_tag(buffer, 1);
            for value in &spec.values {
                encode_context_unsigned(buffer, 0, value.property_id);
                if let Some(index) = value.array_index {
                    encode_context_unsigned(buffer, 1, index);
                }
                encode_opening_tag(buffer, 2);
                buffer.extend_from_slice(&value.value);
                encode_closing_tag(buffer, 2);
                if let Some(priority) = value.priority {
                    encode_context_unsigned(buffer, 3, priority as u32);
                }
            }
            encode_closing_tag(buffer, 1);
        }
        Ok(())
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        let mut specifications = Vec::new();
        let mut pos = 0;
        while pos < data.len() {
            let (object_id, consumed) = decode_context_object_id(&data[pos..], 0)?;
            pos += consumed;
            if !peek_opening_tag(&data[pos..], 1) {
                return Err(ServiceError::MissingRequiredParameter("list-of-properties"));
            }
            pos += 1;
            let mut values = Vec::new();
            while !is_closing(&data[pos..], 1) {
                let (property_id, consumed) = decode_context_unsigned(&data[pos..], 0)?;
                pos += consumed;
                let array_index = if peek_context_tag(&data[pos..], 1)
                    && !is_closing(&data[pos..], 1)
                {
                    let (index, consumed) = decode_context_unsigned(&data[pos..], 1)?;
                    pos += consumed;
                    Some(index)
                } else {
                    None
                };
                if !peek_opening_tag(&data[pos..], 2) {
                    return Err(ServiceError::MissingRequiredParameter("property-value"));
                }
                pos += 1;
                let value_len = until_closing_tag(&data[pos..], 2)?;
                let value = data[pos..pos + value_len].to_vec();
                pos += value_len + 1;
                let priority = if peek_context_tag(&data[pos..], 3) {
                    let (priority, consumed) = decode_context_unsigned(&data[pos..], 3)?;
                    pos += consumed;
                    Some(priority as u8)
                } else {
                    None
                };
                values.push(PropertyValueSpec {
                    property_id,
                    array_index,
                    value,
                    priority,
                });
            }
            pos += 1;
            specifications.push(WriteAccessSpecification { object_id, values });
        }
        if specifications.is_empty() {
            return Err(ServiceError::MissingRequiredParameter(
                "write-access-specification",
            ));
        }
        Ok(Self { specifications })
    }
}

/// CreateObject request; initial values ride as raw list contents
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateObjectRequest {
    pub object_id: ObjectId,
    /// Raw contents of the list-of-initial-values construct, may be empty
    pub initial_values: Vec<u8>,
}

impl CreateObjectRequest {
    pub fn encode(&self, buffer: &mut Vec<u8>) -> Result<()> {
        encode_opening_tag(buffer, 0);
        encode_context_object_id(buffer, 1, self.object_id.0, self.object_id.1)?;
        encode_closing_tag(buffer, 0);
        if !self.initial_values.is_empty() {
            encode_opening_tag(buffer, 1);
            buffer.extend_from_slice(&self.initial_values);
            encode_closing_tag(buffer, 1);
        }
        Ok(())
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        if !peek_opening_tag(data, 0) {
            return Err(ServiceError::MissingRequiredParameter("object-specifier"));
        }
        let mut pos = 1;
        let (object_id, consumed) = decode_context_object_id(&data[pos..], 1)?;
        pos += consumed;
        if !is_closing(&data[pos..], 0) {
            return Err(ServiceError::Encoding(EncodingError::InvalidTag));
        }
        pos += 1;
        let initial_values = if pos < data.len() && peek_opening_tag(&data[pos..], 1) {
            pos += 1;
            let len = until_closing_tag(&data[pos..], 1)?;
            let values = data[pos..pos + len].to_vec();
            pos += len + 1;
            values
        } else {
            Vec::new()
        };
        if pos != data.len() {
            return Err(ServiceError::TooManyArguments);
        }
        Ok(Self {
            object_id,
            initial_values,
        })
    }
}

/// CreateObject acknowledgment: the identifier actually assigned
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateObjectAck {
    pub object_id: ObjectId,
}

impl CreateObjectAck {
    pub fn encode(&self, buffer: &mut Vec<u8>) -> Result<()> {
        encode_object_identifier(buffer, self.object_id.0, self.object_id.1)?;
        Ok(())
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        let (object_id, _) = decode_object_identifier(data)?;
        Ok(Self { object_id })
    }
}

/// DeleteObject request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeleteObjectRequest {
    pub object_id: ObjectId,
}

impl DeleteObjectRequest {
    pub fn encode(&self, buffer: &mut Vec<u8>) -> Result<()> {
        encode_object_identifier(buffer, self.object_id.0, self.object_id.1)?;
        Ok(())
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        if data.is_empty() {
            return Err(ServiceError::MissingRequiredParameter("object-identifier"));
        }
        let (object_id, consumed) = decode_object_identifier(data)?;
        if consumed != data.len() {
            return Err(ServiceError::TooManyArguments);
        }
        Ok(Self { object_id })
    }
}

// ---------------------------------------------------------------------------
// File access services
// ---------------------------------------------------------------------------

/// Stream or record addressing of a file access request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FileAccess {
    /// Byte-oriented: start position and octet count
    Stream { start: i32, count: u32 },
    /// Record-oriented: start record and record count
    Records { start: i32, count: u32 },
}

/// AtomicReadFile request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AtomicReadFileRequest {
    pub file_id: ObjectId,
    pub access: FileAccess,
}

impl AtomicReadFileRequest {
    pub fn encode(&self, buffer: &mut Vec<u8>) -> Result<()> {
        encode_object_identifier(buffer, self.file_id.0, self.file_id.1)?;
        let (tag, start, count) = match self.access {
            FileAccess::Stream { start, count } => (0, start, count),
            FileAccess::Records { start, count } => (1, start, count),
        };
        encode_opening_tag(buffer, tag);
        encode_signed(buffer, start);
        encode_unsigned(buffer, count);
        encode_closing_tag(buffer, tag);
        Ok(())
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        let (file_id, mut pos) = decode_object_identifier(data)?;
        let stream = peek_opening_tag(&data[pos..], 0);
        if !stream && !peek_opening_tag(&data[pos..], 1) {
            return Err(ServiceError::MissingRequiredParameter("access-method"));
        }
        let tag = if stream { 0 } else { 1 };
        pos += 1;
        let (start, consumed) = decode_signed(&data[pos..])?;
        pos += consumed;
        let (count, consumed) = decode_unsigned(&data[pos..])?;
        pos += consumed;
        if !is_closing(&data[pos..], tag) {
            return Err(ServiceError::Encoding(EncodingError::InvalidTag));
        }
        let access = if stream {
            FileAccess::Stream { start, count }
        } else {
            FileAccess::Records { start, count }
        };
        Ok(Self { file_id, access })
    }
}

/// AtomicReadFile acknowledgment
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AtomicReadFileAck {
    pub end_of_file: bool,
    pub start: i32,
    /// Stream access: one chunk. Record access: one element per record.
    pub data: Vec<Vec<u8>>,
    pub record_access: bool,
}

impl AtomicReadFileAck {
    pub fn encode(&self, buffer: &mut Vec<u8>) -> Result<()> {
        encode_boolean(buffer, self.end_of_file);
        let tag = if self.record_access { 1 } else { 0 };
        encode_opening_tag(buffer, tag);
        encode_signed(buffer, self.start);
        if self.record_access {
            encode_unsigned(buffer, self.data.len() as u32);
        }
        for chunk in &self.data {
            encode_octet_string(buffer, chunk);
        }
        encode_closing_tag(buffer, tag);
        Ok(())
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        let (end_of_file, mut pos) = decode_boolean(data)?;
        let record_access = peek_opening_tag(&data[pos..], 1);
        if !record_access && !peek_opening_tag(&data[pos..], 0) {
            return Err(ServiceError::MissingRequiredParameter("access-method"));
        }
        let tag = if record_access { 1 } else { 0 };
        pos += 1;
        let (start, consumed) = decode_signed(&data[pos..])?;
        pos += consumed;
        let mut chunks = Vec::new();
        if record_access {
            let (count, consumed) = decode_unsigned(&data[pos..])?;
            pos += consumed;
            for _ in 0..count {
                let (chunk, consumed) = decode_octet_string(&data[pos..])?;
                pos += consumed;
                chunks.push(chunk);
            }
        } else {
            let (chunk, consumed) = decode_octet_string(&data[pos..])?;
            pos += consumed;
            chunks.push(chunk);
        }
        if !is_closing(&data[pos..], tag) {
            return Err(ServiceError::Encoding(EncodingError::InvalidTag));
        }
        Ok(Self {
            end_of_file,
            start,
            data: chunks,
            record_access,
        })
    }
}

/// AtomicWriteFile request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AtomicWriteFileRequest {
    pub file_id: ObjectId,
    pub start: i32,
    pub data: Vec<Vec<u8>>,
    pub record_access: bool,
}

impl AtomicWriteFileRequest {
    pub fn encode(&self, buffer: &mut Vec<u8>) -> Result<()> {
        encode_object_identifier(buffer, self.file_id.0, self.file_id.1)?;
        let tag = if self.record_access { 1 } else { 0 };
        encode_opening_tag(buffer, tag);
        encode_signed(buffer, self.start);
        if self.record_access {
            encode_unsigned(buffer, self.data.len() as u32);
        }
        for chunk in &self.data {
            encode_octet_string(buffer, chunk);
        }
        encode_closing_tag(buffer, tag);
        Ok(())
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        let (file_id, mut pos) = decode_object_identifier(data)?;
        let record_access = peek_opening_tag(&data[pos..], 1);
        if !record_access && !peek_opening_tag(&data[pos..], 0) {
            return Err(ServiceError::MissingRequiredParameter("access-method"));
        }
        let tag = if record_access { 1 } else { 0 };
        pos += 1;
        let (start, consumed) = decode_signed(&data[pos..])?;
        pos += consumed;
        let mut chunks = Vec::new();
        if record_access {
            let (count, consumed) = decode_unsigned(&data[pos..])?;
            pos += consumed;
            for _ in 0..count {
                let (chunk, consumed) = decode_octet_string(&data[pos..])?;
                pos += consumed;
                chunks.push(chunk);
            }
        } else {
            let (chunk, consumed) = decode_octet_string(&data[pos..])?;
            pos += consumed;
            chunks.push(chunk);
        }
        if !is_closing(&data[pos..], tag) {
            return Err(ServiceError::Encoding(EncodingError::InvalidTag));
        }
        Ok(Self {
            file_id,
            start,
            data: chunks,
            record_access,
        })
    }
}

/// AtomicWriteFile acknowledgment: where the write landed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AtomicWriteFileAck {
    pub start: i32,
    pub record_access: bool,
}

impl AtomicWriteFileAck {
    pub fn encode(&self, buffer: &mut Vec<u8>) -> Result<()> {
        let tag = if self.record_access { 1 } else { 0 };
        encode_context_signed(buffer, tag, self.start);
        Ok(())
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        if peek_context_tag(data, 0) {
            let (start, _) = decode_context_signed(data, 0)?;
            Ok(Self {
                start,
                record_access: false,
            })
        } else if peek_context_tag(data, 1) {
            let (start, _) = decode_context_signed(data, 1)?;
            Ok(Self {
                start,
                record_access: true,
            })
        } else {
            Err(ServiceError::MissingRequiredParameter("file-start"))
        }
    }
}

// ---------------------------------------------------------------------------
// Alarm, event and COV services
// ---------------------------------------------------------------------------

/// SubscribeCOV request; both optionals absent means cancellation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscribeCovRequest {
    pub process_id: u32,
    pub monitored_object: ObjectId,
    pub issue_confirmed: Option<bool>,
    pub lifetime_seconds: Option<u32>,
}

impl SubscribeCovRequest {
    pub fn encode(&self, buffer: &mut Vec<u8>) -> Result<()> {
        encode_context_unsigned(buffer, 0, self.process_id);
        encode_context_object_id(buffer, 1, self.monitored_object.0, self.monitored_object.1)?;
        if let Some(confirmed) = self.issue_confirmed {
            encode_context_boolean(buffer, 2, confirmed);
        }
        if let Some(lifetime) = self.lifetime_seconds {
            encode_context_unsigned(buffer, 3, lifetime);
        }
        Ok(())
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        if !peek_context_tag(data, 0) {
            return Err(ServiceError::MissingRequiredParameter(
                "subscriber-process-identifier",
            ));
        }
        let (process_id, mut pos) = decode_context_unsigned(data, 0)?;
        if !peek_context_tag(&data[pos..], 1) {
            return Err(ServiceError::MissingRequiredParameter(
                "monitored-object-identifier",
            ));
        }
        let (monitored_object, consumed) = decode_context_object_id(&data[pos..], 1)?;
        pos += consumed;
        let issue_confirmed = if peek_context_tag(&data[pos..], 2) {
            let (confirmed, consumed) = decode_context_boolean(&data[pos..], 2)?;
            pos += consumed;
            Some(confirmed)
        } else {
            None
        };
        let lifetime_seconds = if peek_context_tag(&data[pos..], 3) {
            let (lifetime, consumed) = decode_context_unsigned(&data[pos..], 3)?;
            pos += consumed;
            Some(lifetime)
        } else {
            None
        };
        if pos != data.len() {
            return Err(ServiceError::TooManyArguments);
        }
        Ok(Self {
            process_id,
            monitored_object,
            issue_confirmed,
            lifetime_seconds,
        })
    }

    /// A subscription with neither confirmation mode nor lifetime cancels
    pub fn is_cancellation(&self) -> bool {
        self.issue_confirmed.is_none() && self.lifetime_seconds.is_none()
    }
}

/// SubscribeCOVProperty request
#[derive(Debug, Clone, PartialEq)]
pub struct SubscribeCovPropertyRequest {
    pub subscription: SubscribeCovRequest,
    pub monitored_property: PropertyReference,
    pub cov_increment: Option<f32>,
}

impl SubscribeCovPropertyRequest {
    pub fn encode(&self, buffer: &mut Vec<u8>) -> Result<()> {
        self.subscription.encode(buffer)?;
        encode_opening_tag(buffer, 4);
        encode_context_unsigned(buffer, 0, self.monitored_property.property_id);
        if let Some(index) = self.monitored_property.array_index {
            encode_context_unsigned(buffer, 1, index);
        }
        encode_closing_tag(buffer, 4);
        if let Some(increment) = self.cov_increment {
            encode_context_real(buffer, 5, increment);
        }
        Ok(())
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        // The leading fields are the plain SubscribeCOV sequence; find where
        // the monitored-property construct starts.
        let mut pos = 0;
        let (process_id, consumed) = decode_context_unsigned(&data[pos..], 0)?;
        pos += consumed;
        let (monitored_object, consumed) = decode_context_object_id(&data[pos..], 1)?;
        pos += consumed;
        let issue_confirmed = if peek_context_tag(&data[pos..], 2) {
            let (confirmed, consumed) = decode_context_boolean(&data[pos..], 2)?;
            pos += consumed;
            Some(confirmed)
        } else {
            None
        };
        let lifetime_seconds = if peek_context_tag(&data[pos..], 3) {
            let (lifetime, consumed) = decode_context_unsigned(&data[pos..], 3)?;
            pos += consumed;
            Some(lifetime)
        } else {
            None
        };
        if !peek_opening_tag(&data[pos..], 4) {
            return Err(ServiceError::MissingRequiredParameter(
                "monitored-property-identifier",
            ));
        }
        pos += 1;
        let (property_id, consumed) = decode_context_unsigned(&data[pos..], 0)?;
        pos += consumed;
        let array_index = if peek_context_tag(&data[pos..], 1) {
            let (index, consumed) = decode_context_unsigned(&data[pos..], 1)?;
            pos += consumed;
            Some(index)
        } else {
            None
        };
        if !is_closing(&data[pos..], 4) {
            return Err(ServiceError::Encoding(EncodingError::InvalidTag));
        }
        pos += 1;
        let cov_increment = if peek_context_tag(&data[pos..], 5) {
            let (increment, consumed) = decode_context_real(&data[pos..], 5)?;
            pos += consumed;
            Some(increment)
        } else {
            None
        };
        if pos != data.len() {
            return Err(ServiceError::TooManyArguments);
        }
        Ok(Self {
            subscription: SubscribeCovRequest {
                process_id,
                monitored_object,
                issue_confirmed,
                lifetime_seconds,
            },
            monitored_property: PropertyReference {
                property_id,
                array_index,
            },
            cov_increment,
        })
    }
}

/// One changed property inside a COV notification
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PropertyNotification {
    pub property_id: u32,
    pub array_index: Option<u32>,
    /// Raw application-encoded value bytes
    pub value: Vec<u8>,
}

/// COV notification payload, identical for the confirmed and unconfirmed form
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CovNotification {
    pub process_id: u32,
    pub initiating_device: ObjectId,
    pub monitored_object: ObjectId,
    pub time_remaining_seconds: u32,
    pub values: Vec<PropertyNotification>,
}

impl CovNotification {
    pub fn encode(&self, buffer: &mut Vec<u8>) -> Result<()> {
        encode_context_unsigned(buffer, 0, self.process_id);
        encode_context_object_id(buffer, 1, self.initiating_device.0, self.initiating_device.1)?;
        encode_context_object_id(buffer, 2, self.monitored_object.0, self.monitored_object.1)?;
        encode_context_unsigned(buffer, 3, self.time_remaining_seconds);
        encode_opening_tag(buffer, 4);
        for value in &self.values {
            encode_context_unsigned(buffer, 0, value.property_id);
            if let Some(index) = value.array_index {
                encode_context_unsigned(buffer, 1, index);
            }
            encode_opening_tag(buffer, 2);
            buffer.extend_from_slice(&value.value);
            encode_closing_tag(buffer, 2);
        }
        encode_closing_tag(buffer, 4);
        Ok(())
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        let (process_id, mut pos) = decode_context_unsigned(data, 0)?;
        let (initiating_device, consumed) = decode_context_object_id(&data[pos..], 1)?;
        pos += consumed;
        let (monitored_object, consumed) = decode_context_object_id(&data[pos..], 2)?;
        pos += consumed;
        let (time_remaining_seconds, consumed) = decode_context_unsigned(&data[pos..], 3)?;
        pos += consumed;
        if !peek_opening_tag(&data[pos..], 4) {
            return Err(ServiceError::MissingRequiredParameter("list-of-values"));
        }
        pos += 1;
        let mut values = Vec::new();
        while !is_closing(&data[pos..], 4) {
            let (property_id, consumed) = decode_context_unsigned(&data[pos..], 0)?;
            pos += consumed;
            let array_index = if peek_context_tag(&data[pos..], 1) {
                let (index, consumed) = decode_context_unsigned(&data[pos..], 1)?;
                pos += consumed;
                Some(index)
            } else {
                None
            };
            if !peek_opening_tag(&data[pos..], 2) {
                return Err(ServiceError::MissingRequiredParameter("property-value"));
            }
            pos += 1;
            let value_len = until_closing_tag(&data[pos..], 2)?;
            let value = data[pos..pos + value_len].to_vec();
            pos += value_len + 1;
            values.push(PropertyNotification {
                property_id,
                array_index,
                value,
            });
        }
        pos += 1;
        if pos != data.len() {
            return Err(ServiceError::TooManyArguments);
        }
        Ok(Self {
            process_id,
            initiating_device,
            monitored_object,
            time_remaining_seconds,
            values,
        })
    }
}

/// AcknowledgeAlarm request; timestamps stay raw (they are a three-way
/// choice the external codec owns)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AcknowledgeAlarmRequest {
    pub process_id: u32,
    pub event_object: ObjectId,
    pub event_state_acknowledged: u32,
    pub event_timestamp: Vec<u8>,
    pub acknowledgment_source: String,
    pub acknowledgment_timestamp: Vec<u8>,
}

impl AcknowledgeAlarmRequest {
    pub fn encode(&self, buffer: &mut Vec<u8>) -> Result<()> {
        encode_context_unsigned(buffer, 0, self.process_id);
        encode_context_object_id(buffer, 1, self.event_object.0, self.event_object.1)?;
        encode_context_enumerated(buffer, 2, self.event_state_acknowledged);
        encode_opening_tag(buffer, 3);
        buffer.extend_from_slice(&self.event_timestamp);
        encode_closing_tag(buffer, 3);
        encode_context_character_string(buffer, 4, &self.acknowledgment_source);
        encode_opening_tag(buffer, 5);
        buffer.extend_from_slice(&self.acknowledgment_timestamp);
        encode_closing_tag(buffer, 5);
        Ok(())
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        let (process_id, mut pos) = decode_context_unsigned(data, 0)?;
        let (event_object, consumed) = decode_context_object_id(&data[pos..], 1)?;
        pos += consumed;
        let (event_state_acknowledged, consumed) = decode_context_enumerated(&data[pos..], 2)?;
        pos += consumed;
        if !peek_opening_tag(&data[pos..], 3) {
            return Err(ServiceError::MissingRequiredParameter("event-timestamp"));
        }
        pos += 1;
        let len = until_closing_tag(&data[pos..], 3)?;
        let event_timestamp = data[pos..pos + len].to_vec();
        pos += len + 1;
        let (acknowledgment_source, consumed) =
            decode_context_character_string(&data[pos..], 4)?;
        pos += consumed;
        if !peek_opening_tag(&data[pos..], 5) {
            return Err(ServiceError::MissingRequiredParameter(
                "time-of-acknowledgment",
            ));
        }
        pos += 1;
        let len = until_closing_tag(&data[pos..], 5)?;
        let acknowledgment_timestamp = data[pos..pos + len].to_vec();
        pos += len + 1;
        if pos != data.len() {
            return Err(ServiceError::TooManyArguments);
        }
        Ok(Self {
            process_id,
            event_object,
            event_state_acknowledged,
            event_timestamp,
            acknowledgment_source,
            acknowledgment_timestamp,
        })
    }
}

/// LifeSafetyOperation request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LifeSafetyOperationRequest {
    pub process_id: u32,
    pub requesting_source: String,
    pub operation: u32,
    pub object_id: Option<ObjectId>,
}

impl LifeSafetyOperationRequest {
    pub fn encode(&self, buffer: &mut Vec<u8>) -> Result<()> {
        encode_context_unsigned(buffer, 0, self.process_id);
        encode_context_character_string(buffer, 1, &self.requesting_source);
        encode_context_enumerated(buffer, 2, self.operation);
        if let Some(object_id) = self.object_id {
            encode_context_object_id(buffer, 3, object_id.0, object_id.1)?;
        }
        Ok(())
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        let (process_id, mut pos) = decode_context_unsigned(data, 0)?;
        let (requesting_source, consumed) = decode_context_character_string(&data[pos..], 1)?;
        pos += consumed;
        let (operation, consumed) = decode_context_enumerated(&data[pos..], 2)?;
        pos += consumed;
        let object_id = if peek_context_tag(&data[pos..], 3) {
            let (object_id, consumed) = decode_context_object_id(&data[pos..], 3)?;
            pos += consumed;
            Some(object_id)
        } else {
            None
        };
        if pos != data.len() {
            return Err(ServiceError::TooManyArguments);
        }
        Ok(Self {
            process_id,
            requesting_source,
            operation,
            object_id,
        })
    }
}

/// One entry of a GetAlarmSummary acknowledgment
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AlarmSummary {
    pub object_id: ObjectId,
    pub alarm_state: u32,
    /// Acked-transitions bit string as (unused bits, packed bytes)
    pub acked_transitions: (u8, Vec<u8>),
}

/// GetAlarmSummary acknowledgment (the request has no parameters)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GetAlarmSummaryAck {
    pub summaries: Vec<AlarmSummary>,
}

impl GetAlarmSummaryAck {
    pub fn encode(&self, buffer: &mut Vec<u8>) -> Result<()> {
        for summary in &self.summaries {
            encode_object_identifier(buffer, summary.object_id.0, summary.object_id.1)?;
            encode_enumerated(buffer, summary.alarm_state);
            encode_bit_string(
                buffer,
                summary.acked_transitions.0,
                &summary.acked_transitions.1,
            )?;
        }
        Ok(())
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        let mut summaries = Vec::new();
        let mut pos = 0;
        while pos < data.len() {
            let (object_id, consumed) = decode_object_identifier(&data[pos..])?;
            pos += consumed;
            let (alarm_state, consumed) = decode_enumerated(&data[pos..])?;
            pos += consumed;
            let (acked_transitions, consumed) = decode_bit_string(&data[pos..])?;
            pos += consumed;
            summaries.push(AlarmSummary {
                object_id,
                alarm_state,
                acked_transitions,
            });
        }
        Ok(Self { summaries })
    }
}

/// GetEventInformation request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct GetEventInformationRequest {
    /// Resume enumeration after this object, for chunked retrieval
    pub last_received: Option<ObjectId>,
}

impl GetEventInformationRequest {
    pub fn encode(&self, buffer: &mut Vec<u8>) -> Result<()> {
        if let Some(object_id) = self.last_received {
            encode_context_object_id(buffer, 0, object_id.0, object_id.1)?;
        }
        Ok(())
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        if data.is_empty() {
            return Ok(Self {
                last_received: None,
            });
        }
        let (object_id, consumed) = decode_context_object_id(data, 0)?;
        if consumed != data.len() {
            return Err(ServiceError::TooManyArguments);
        }
        Ok(Self {
            last_received: Some(object_id),
        })
    }
}

/// GetEventInformation acknowledgment.
///
/// Event summaries are a deeply nested construct of timestamps and priority
/// arrays; the engine hands the list contents to the external codec raw.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GetEventInformationAck {
    /// Raw contents of the list-of-event-summaries construct
    pub summaries: Vec<u8>,
    pub more_events: bool,
}

impl GetEventInformationAck {
    pub fn encode(&self, buffer: &mut Vec<u8>) -> Result<()> {
        encode_opening_tag(buffer, 0);
        buffer.extend_from_slice(&self.summaries);
        encode_closing_tag(buffer, 0);
        encode_context_boolean(buffer, 1, self.more_events);
        Ok(())
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        if !peek_opening_tag(data, 0) {
            return Err(ServiceError::MissingRequiredParameter(
                "list-of-event-summaries",
            ));
        }
        let mut pos = 1;
        let len = until_closing_tag(&data[pos..], 0)?;
        let summaries = data[pos..pos + len].to_vec();
        pos += len + 1;
        let (more_events, consumed) = decode_context_boolean(&data[pos..], 1)?;
        pos += consumed;
        if pos != data.len() {
            return Err(ServiceError::TooManyArguments);
        }
        Ok(Self {
            summaries,
            more_events,
        })
    }
}

// ---------------------------------------------------------------------------
// Remote device management services
// ---------------------------------------------------------------------------

/// Enable/disable argument of DeviceCommunicationControl
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum EnableDisable {
    Enable = 0,
    Disable = 1,
    DisableInitiation = 2,
}

/// DeviceCommunicationControl request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceCommunicationControlRequest {
    pub time_duration_minutes: Option<u16>,
    pub enable_disable: EnableDisable,
    pub password: Option<String>,
}

impl DeviceCommunicationControlRequest {
    pub fn encode(&self, buffer: &mut Vec<u8>) -> Result<()> {
        if let Some(minutes) = self.time_duration_minutes {
            encode_context_unsigned(buffer, 0, minutes as u32);
        }
        encode_context_enumerated(buffer, 1, self.enable_disable as u32);
        if let Some(password) = &self.password {
            encode_context_character_string(buffer, 2, password);
        }
        Ok(())
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        let mut pos = 0;
        let time_duration_minutes = if peek_context_tag(data, 0) {
            let (minutes, consumed) = decode_context_unsigned(data, 0)?;
            pos += consumed;
            if minutes > u16::MAX as u32 {
                return Err(ServiceError::Encoding(EncodingError::ValueOutOfRange));
            }
            Some(minutes as u16)
        } else {
            None
        };
        if !peek_context_tag(&data[pos..], 1) {
            return Err(ServiceError::MissingRequiredParameter("enable-disable"));
        }
        let (raw, consumed) = decode_context_enumerated(&data[pos..], 1)?;
        pos += consumed;
        let enable_disable = match raw {
            0 => EnableDisable::Enable,
            1 => EnableDisable::Disable,
            2 => EnableDisable::DisableInitiation,
            _ => return Err(ServiceError::Encoding(EncodingError::ValueOutOfRange)),
        };
        let password = if pos < data.len() && peek_context_tag(&data[pos..], 2) {
            let (password, consumed) = decode_context_character_string(&data[pos..], 2)?;
            pos += consumed;
            Some(password)
        } else {
            None
        };
        if pos != data.len() {
            return Err(ServiceError::TooManyArguments);
        }
        Ok(Self {
            time_duration_minutes,
            enable_disable,
            password,
        })
    }
}

/// Reinitialization target state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ReinitializedState {
    ColdStart = 0,
    WarmStart = 1,
    StartBackup = 2,
    EndBackup = 3,
    StartRestore = 4,
    EndRestore = 5,
    AbortRestore = 6,
}

/// ReinitializeDevice request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReinitializeDeviceRequest {
    pub state: ReinitializedState,
    pub password: Option<String>,
}

impl ReinitializeDeviceRequest {
    pub fn encode(&self, buffer: &mut Vec<u8>) -> Result<()> {
        encode_context_enumerated(buffer, 0, self.state as u32);
        if let Some(password) = &self.password {
            encode_context_character_string(buffer, 1, password);
        }
        Ok(())
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        if !peek_context_tag(data, 0) {
            return Err(ServiceError::MissingRequiredParameter(
                "reinitialized-state",
            ));
        }
        let (raw, mut pos) = decode_context_enumerated(data, 0)?;
        let state = match raw {
            0 => ReinitializedState::ColdStart,
            1 => ReinitializedState::WarmStart,
            2 => ReinitializedState::StartBackup,
            3 => ReinitializedState::EndBackup,
            4 => ReinitializedState::StartRestore,
            5 => ReinitializedState::EndRestore,
            6 => ReinitializedState::AbortRestore,
            _ => return Err(ServiceError::Encoding(EncodingError::ValueOutOfRange)),
        };
        let password = if pos < data.len() && peek_context_tag(&data[pos..], 1) {
            let (password, consumed) = decode_context_character_string(&data[pos..], 1)?;
            pos += consumed;
            Some(password)
        } else {
            None
        };
        if pos != data.len() {
            return Err(ServiceError::TooManyArguments);
        }
        Ok(Self { state, password })
    }
}

// ---------------------------------------------------------------------------
// Discovery and time services (unconfirmed)
// ---------------------------------------------------------------------------

/// Who-Is request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct WhoIsRequest {
    pub low_limit: Option<u32>,
    pub high_limit: Option<u32>,
}

impl WhoIsRequest {
    /// Who-Is for all devices
    pub fn new() -> Self {
        Self::default()
    }

    /// Who-Is restricted to one device instance
    pub fn for_device(instance: u32) -> Self {
        Self {
            low_limit: Some(instance),
            high_limit: Some(instance),
        }
    }

    pub fn encode(&self, buffer: &mut Vec<u8>) -> Result<()> {
        match (self.low_limit, self.high_limit) {
            (Some(low), Some(high)) => {
                if low > high {
                    return Err(ServiceError::InconsistentParameters(
                        "low limit above high limit",
                    ));
                }
                encode_context_unsigned(buffer, 0, low);
                encode_context_unsigned(buffer, 1, high);
                Ok(())
            }
            (None, None) => Ok(()),
            _ => Err(ServiceError::InconsistentParameters(
                "range limits must be paired",
            )),
        }
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        if data.is_empty() {
            return Ok(Self::default());
        }
        let (low, mut pos) = decode_context_unsigned(data, 0)?;
        if !peek_context_tag(&data[pos..], 1) {
            return Err(ServiceError::MissingRequiredParameter(
                "device-instance-range-high-limit",
            ));
        }
        let (high, consumed) = decode_context_unsigned(&data[pos..], 1)?;
        pos += consumed;
        if pos != data.len() {
            return Err(ServiceError::TooManyArguments);
        }
        Ok(Self {
            low_limit: Some(low),
            high_limit: Some(high),
        })
    }

    /// Whether a device instance falls inside the requested range
    pub fn matches(&self, instance: u32) -> bool {
        match (self.low_limit, self.high_limit) {
            (Some(low), Some(high)) => (low..=high).contains(&instance),
            _ => true,
        }
    }
}

/// I-Am announcement
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IAmRequest {
    pub device_id: ObjectId,
    pub max_apdu_length_accepted: u32,
    pub segmentation_supported: u32,
    pub vendor_id: u32,
}

impl IAmRequest {
    pub fn encode(&self, buffer: &mut Vec<u8>) -> Result<()> {
        encode_object_identifier(buffer, self.device_id.0, self.device_id.1)?;
        encode_unsigned(buffer, self.max_apdu_length_accepted);
        encode_enumerated(buffer, self.segmentation_supported);
        encode_unsigned(buffer, self.vendor_id);
        Ok(())
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        let (device_id, mut pos) = decode_object_identifier(data)?;
        let (max_apdu_length_accepted, consumed) = decode_unsigned(&data[pos..])?;
        pos += consumed;
        let (segmentation_supported, consumed) = decode_enumerated(&data[pos..])?;
        pos += consumed;
        let (vendor_id, _) = decode_unsigned(&data[pos..])?;
        Ok(Self {
            device_id,
            max_apdu_length_accepted,
            segmentation_supported,
            vendor_id,
        })
    }
}

/// Object named or identified in a Who-Has request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WhoHasObject {
    Identifier(ObjectId),
    Name(String),
}

/// Who-Has request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WhoHasRequest {
    pub low_limit: Option<u32>,
    pub high_limit: Option<u32>,
    pub object: WhoHasObject,
}

impl WhoHasRequest {
    pub fn encode(&self, buffer: &mut Vec<u8>) -> Result<()> {
        if let (Some(low), Some(high)) = (self.low_limit, self.high_limit) {
            encode_context_unsigned(buffer, 0, low);
            encode_context_unsigned(buffer, 1, high);
        }
        match &self.object {
            WhoHasObject::Identifier(object_id) => {
                encode_context_object_id(buffer, 2, object_id.0, object_id.1)?;
            }
            WhoHasObject::Name(name) => {
                encode_context_character_string(buffer, 3, name);
            }
        }
        Ok(())
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        let mut pos = 0;
        let (low_limit, high_limit) = if peek_context_tag(data, 0) {
            let (low, consumed) = decode_context_unsigned(data, 0)?;
            pos += consumed;
            let (high, consumed) = decode_context_unsigned(&data[pos..], 1)?;
            pos += consumed;
            (Some(low), Some(high))
        } else {
            (None, None)
        };
        let object = if peek_context_tag(&data[pos..], 2) {
            let (object_id, consumed) = decode_context_object_id(&data[pos..], 2)?;
            pos += consumed;
            WhoHasObject::Identifier(object_id)
        } else if peek_context_tag(&data[pos..], 3) {
            let (name, consumed) = decode_context_character_string(&data[pos..], 3)?;
            pos += consumed;
            WhoHasObject::Name(name)
        } else {
            return Err(ServiceError::MissingRequiredParameter("object"));
        };
        if pos != data.len() {
            return Err(ServiceError::TooManyArguments);
        }
        Ok(Self {
            low_limit,
            high_limit,
            object,
        })
    }
}

/// I-Have announcement
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IHaveRequest {
    pub device_id: ObjectId,
    pub object_id: ObjectId,
    pub object_name: String,
}

impl IHaveRequest {
    pub fn encode(&self, buffer: &mut Vec<u8>) -> Result<()> {
        encode_object_identifier(buffer, self.device_id.0, self.device_id.1)?;
        encode_object_identifier(buffer, self.object_id.0, self.object_id.1)?;
        encode_character_string(buffer, &self.object_name);
        Ok(())
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        let (device_id, mut pos) = decode_object_identifier(data)?;
        let (object_id, consumed) = decode_object_identifier(&data[pos..])?;
        pos += consumed;
        let (object_name, _) = encoding::decode_character_string(&data[pos..])?;
        Ok(Self {
            device_id,
            object_id,
            object_name,
        })
    }
}

/// BACnet date; 255 in any field means "unspecified"
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BacnetDate {
    pub year: u16,
    pub month: u8,
    pub day: u8,
    pub weekday: u8,
}

/// BACnet time; 255 in any field means "unspecified"
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BacnetTime {
    pub hour: u8,
    pub minute: u8,
    pub second: u8,
    pub hundredths: u8,
}

/// Combined date and time
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BacnetDateTime {
    pub date: BacnetDate,
    pub time: BacnetTime,
}

impl BacnetDateTime {
    /// Current local time
    pub fn now() -> Self {
        use chrono::{Datelike, Local, Timelike};
        let now = Local::now();
        Self::from_parts(
            now.year() as u16,
            now.month() as u8,
            now.day() as u8,
            now.weekday().number_from_monday() as u8,
            now.hour() as u8,
            now.minute() as u8,
            now.second() as u8,
            (now.nanosecond() / 10_000_000) as u8,
        )
    }

    /// Current UTC time
    pub fn now_utc() -> Self {
        use chrono::{Datelike, Timelike, Utc};
        let now = Utc::now();
        Self::from_parts(
            now.year() as u16,
            now.month() as u8,
            now.day() as u8,
            now.weekday().number_from_monday() as u8,
            now.hour() as u8,
            now.minute() as u8,
            now.second() as u8,
            (now.nanosecond() / 10_000_000) as u8,
        )
    }

    #[allow(clippy::too_many_arguments)]
    fn from_parts(
        year: u16,
        month: u8,
        day: u8,
        weekday: u8,
        hour: u8,
        minute: u8,
        second: u8,
        hundredths: u8,
    ) -> Self {
        Self {
            date: BacnetDate {
                year,
                month,
                day,
                weekday,
            },
            time: BacnetTime {
                hour,
                minute,
                second,
                hundredths,
            },
        }
    }

    pub fn encode(&self, buffer: &mut Vec<u8>) -> Result<()> {
        encoding::encode_date(
            buffer,
            self.date.year,
            self.date.month,
            self.date.day,
            self.date.weekday,
        )?;
        encoding::encode_time(
            buffer,
            self.time.hour,
            self.time.minute,
            self.time.second,
            self.time.hundredths,
        );
        Ok(())
    }

    pub fn decode(data: &[u8]) -> Result<(Self, usize)> {
        let ((year, month, day, weekday), mut pos) = encoding::decode_date(data)?;
        let ((hour, minute, second, hundredths), consumed) = encoding::decode_time(&data[pos..])?;
        pos += consumed;
        Ok((
            Self::from_parts(year, month, day, weekday, hour, minute, second, hundredths),
            pos,
        ))
    }
}

/// TimeSynchronization request (local or UTC form, same payload)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeSynchronizationRequest {
    pub date_time: BacnetDateTime,
}

impl TimeSynchronizationRequest {
    pub fn new(date_time: BacnetDateTime) -> Self {
        Self { date_time }
    }

    pub fn encode(&self, buffer: &mut Vec<u8>) -> Result<()> {
        self.date_time.encode(buffer)
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        let (date_time, consumed) = BacnetDateTime::decode(data)?;
        if consumed != data.len() {
            return Err(ServiceError::TooManyArguments);
        }
        Ok(Self { date_time })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encoding::encode_real;

    #[test]
    fn read_property_request_round_trip() {
        let request = ReadPropertyRequest::new((8, 1234), 85).with_array_index(3);
        let mut buffer = Vec::new();
        request.encode(&mut buffer).unwrap();
        assert_eq!(ReadPropertyRequest::decode(&buffer).unwrap(), request);
    }

    #[test]
    fn read_property_decode_classifies_failures() {
        // Empty payload: the object identifier is missing
        assert_eq!(
            ReadPropertyRequest::decode(&[]),
            Err(ServiceError::MissingRequiredParameter("object-identifier"))
        );

        // Valid request with trailing garbage
        let mut buffer = Vec::new();
        ReadPropertyRequest::new((0, 1), 85)
            .encode(&mut buffer)
            .unwrap();
        buffer.push(0x91);
        buffer.push(0x00);
        assert_eq!(
            ReadPropertyRequest::decode(&buffer),
            Err(ServiceError::TooManyArguments)
        );

        // Reject reason mapping used by the dispatcher
        assert_eq!(
            ServiceError::MissingRequiredParameter("x").reject_reason(),
            Some(RejectReason::MissingRequiredParameter)
        );
        assert_eq!(
            ServiceError::Encoding(EncodingError::BufferUnderflow).reject_reason(),
            None
        );
    }

    #[test]
    fn read_property_ack_keeps_value_raw() {
        let mut value = Vec::new();
        encode_real(&mut value, 21.5);
        let ack = ReadPropertyAck {
            object_id: (0, 7),
            property_id: 85,
            array_index: None,
            value: value.clone(),
        };
        let mut buffer = Vec::new();
        ack.encode(&mut buffer).unwrap();
        let decoded = ReadPropertyAck::decode(&buffer).unwrap();
        assert_eq!(decoded.value, value);
    }

    #[test]
    fn write_property_priority_range_enforced() {
        let mut value = Vec::new();
        encode_real(&mut value, 1.0);
        let mut request = WritePropertyRequest::new((1, 2), 85, value);
        request.priority = Some(16);
        let mut buffer = Vec::new();
        request.encode(&mut buffer).unwrap();
        assert_eq!(WritePropertyRequest::decode(&buffer).unwrap(), request);

        // Priority 17 on the wire is out of range
        let last = buffer.len() - 1;
        buffer[last] = 17;
        assert_eq!(
            WritePropertyRequest::decode(&buffer),
            Err(ServiceError::Encoding(EncodingError::ValueOutOfRange))
        );
    }

    #[test]
    fn read_property_multiple_round_trip() {
        let request = ReadPropertyMultipleRequest {
            specifications: vec![ReadAccessSpecification {
                object_id: (8, 99),
                property_references: vec![
                    PropertyReference::new(76),
                    PropertyReference {
                        property_id: 85,
                        array_index: Some(1),
                    },
                ],
            }],
        };
        let mut buffer = Vec::new();
        request.encode(&mut buffer).unwrap();
        assert_eq!(ReadPropertyMultipleRequest::decode(&buffer).unwrap(), request);
    }

    #[test]
    fn rpm_ack_mixes_values_and_errors() {
        let mut value = Vec::new();
        encode_real(&mut value, 3.5);
        let ack = ReadPropertyMultipleAck {
            results: vec![ReadAccessResult {
                object_id: (0, 1),
                results: vec![
                    PropertyAccessResult {
                        property_id: 85,
                        array_index: None,
                        result: Ok(value),
                    },
                    PropertyAccessResult {
                        property_id: 28,
                        array_index: None,
                        result: Err((ErrorClass::Property, ErrorCode::UnknownProperty)),
                    },
                ],
            }],
        };
        let mut buffer = Vec::new();
        ack.encode(&mut buffer).unwrap();
        assert_eq!(ReadPropertyMultipleAck::decode(&buffer).unwrap(), ack);
    }

    #[test]
    fn subscribe_cov_cancellation() {
        let request = SubscribeCovRequest {
            process_id: 18,
            monitored_object: (0, 3),
            issue_confirmed: None,
            lifetime_seconds: None,
        };
        assert!(request.is_cancellation());
        let mut buffer = Vec::new();
        request.encode(&mut buffer).unwrap();
        assert_eq!(SubscribeCovRequest::decode(&buffer).unwrap(), request);
    }

    #[test]
    fn subscribe_cov_property_round_trip() {
        let request = SubscribeCovPropertyRequest {
            subscription: SubscribeCovRequest {
                process_id: 1,
                monitored_object: (0, 5),
                issue_confirmed: Some(false),
                lifetime_seconds: Some(300),
            },
            monitored_property: PropertyReference::new(85),
            cov_increment: Some(0.5),
        };
        let mut buffer = Vec::new();
        request.encode(&mut buffer).unwrap();
        assert_eq!(
            SubscribeCovPropertyRequest::decode(&buffer).unwrap(),
            request
        );
    }

    #[test]
    fn cov_notification_round_trip() {
        let mut value = Vec::new();
        encode_real(&mut value, 68.0);
        let notification = CovNotification {
            process_id: 18,
            initiating_device: (8, 1234),
            monitored_object: (0, 3),
            time_remaining_seconds: 120,
            values: vec![PropertyNotification {
                property_id: 85,
                array_index: None,
                value,
            }],
        };
        let mut buffer = Vec::new();
        notification.encode(&mut buffer).unwrap();
        assert_eq!(CovNotification::decode(&buffer).unwrap(), notification);
    }

    #[test]
    fn atomic_read_file_stream_round_trip() {
        let request = AtomicReadFileRequest {
            file_id: (10, 1),
            access: FileAccess::Stream {
                start: 0,
                count: 1024,
            },
        };
        let mut buffer = Vec::new();
        request.encode(&mut buffer).unwrap();
        assert_eq!(AtomicReadFileRequest::decode(&buffer).unwrap(), request);

        let ack = AtomicReadFileAck {
            end_of_file: true,
            start: 0,
            data: vec![vec![1, 2, 3, 4]],
            record_access: false,
        };
        let mut buffer = Vec::new();
        ack.encode(&mut buffer).unwrap();
        assert_eq!(AtomicReadFileAck::decode(&buffer).unwrap(), ack);
    }

    #[test]
    fn device_communication_control_password() {
        let request = DeviceCommunicationControlRequest {
            time_duration_minutes: Some(60),
            enable_disable: EnableDisable::Disable,
            password: Some("let-me-in".into()),
        };
        let mut buffer = Vec::new();
        request.encode(&mut buffer).unwrap();
        assert_eq!(
            DeviceCommunicationControlRequest::decode(&buffer).unwrap(),
            request
        );
    }

    #[test]
    fn who_is_range_validation() {
        let mut buffer = Vec::new();
        assert_eq!(
            WhoIsRequest {
                low_limit: Some(10),
                high_limit: None,
            }
            .encode(&mut buffer),
            Err(ServiceError::InconsistentParameters(
                "range limits must be paired"
            ))
        );

        let request = WhoIsRequest::for_device(1234);
        buffer.clear();
        request.encode(&mut buffer).unwrap();
        let decoded = WhoIsRequest::decode(&buffer).unwrap();
        assert!(decoded.matches(1234));
        assert!(!decoded.matches(1235));
    }

    #[test]
    fn i_am_round_trip() {
        let request = IAmRequest {
            device_id: (8, 1234),
            max_apdu_length_accepted: 1476,
            segmentation_supported: 0,
            vendor_id: 260,
        };
        let mut buffer = Vec::new();
        request.encode(&mut buffer).unwrap();
        assert_eq!(IAmRequest::decode(&buffer).unwrap(), request);
    }

    #[test]
    fn time_synchronization_carries_current_time() {
        let request = TimeSynchronizationRequest::new(BacnetDateTime::now());
        let mut buffer = Vec::new();
        request.encode(&mut buffer).unwrap();
        let decoded = TimeSynchronizationRequest::decode(&buffer).unwrap();
        assert_eq!(decoded.date_time.date.month, request.date_time.date.month);
        assert_eq!(decoded.date_time.time.minute, request.date_time.time.minute);
    }

    #[test]
    fn error_code_vendor_range() {
        assert_eq!(ErrorCode::from(123u16), ErrorCode::AbortApduTooLong);
        assert!(matches!(ErrorCode::from(300u16), ErrorCode::Proprietary(_)));
        assert!(matches!(ErrorCode::from(200u16), ErrorCode::Reserved(_)));
    }
}
