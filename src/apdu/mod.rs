//! APDU header encoding and decoding.
//!
//! Application Protocol Data Units are the outer frames this engine
//! dispatches on. Eight PDU types exist (ASHRAE 135 clause 21); this module
//! provides the codec for their fixed headers and flag octets. Service
//! payloads ride along as raw bytes; their interpretation belongs to the
//! service envelopes and, for property values, to an external codec.
//!
//! The segmented variants of `ConfirmedRequest` and `ComplexAck` carry a
//! sequence number and a proposed window size between the invoke id and the
//! service choice; the unsegmented variants do not. Reassembly relies on this
//! asymmetry when it re-synthesizes the original unsegmented header from the
//! first segment.

use std::error::Error;
use std::fmt;

use bitflags::bitflags;

/// Result type for APDU operations
pub type Result<T> = std::result::Result<T, ApduError>;

/// Errors that can occur while decoding an APDU header
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApduError {
    /// Frame ended before the fixed header was complete
    Truncated(&'static str),
    /// Upper nibble of the first octet is not a known PDU type
    UnsupportedApduType(u8),
}

impl fmt::Display for ApduError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ApduError::Truncated(what) => write!(f, "Truncated APDU: {}", what),
            ApduError::UnsupportedApduType(raw) => write!(f, "Unsupported APDU type: {}", raw),
        }
    }
}

impl Error for ApduError {}

/// APDU types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ApduType {
    ConfirmedRequest = 0,
    UnconfirmedRequest = 1,
    SimpleAck = 2,
    ComplexAck = 3,
    SegmentAck = 4,
    Error = 5,
    Reject = 6,
    Abort = 7,
}

impl TryFrom<u8> for ApduType {
    type Error = ApduError;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0 => Ok(Self::ConfirmedRequest),
            1 => Ok(Self::UnconfirmedRequest),
            2 => Ok(Self::SimpleAck),
            3 => Ok(Self::ComplexAck),
            4 => Ok(Self::SegmentAck),
            5 => Ok(Self::Error),
            6 => Ok(Self::Reject),
            7 => Ok(Self::Abort),
            other => Err(ApduError::UnsupportedApduType(other)),
        }
    }
}

bitflags! {
    /// Flag bits of the first APDU octet, below the PDU-type nibble.
    ///
    /// Which bits are meaningful depends on the PDU type: SEGMENTED /
    /// MORE_FOLLOWS belong to confirmed requests and complex acks,
    /// SEGMENTED_RESPONSE_ACCEPTED only to confirmed requests, NEGATIVE_ACK
    /// only to segment acks, SERVER to segment acks and aborts.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ApduFlags: u8 {
        const SEGMENTED = 0x08;
        const MORE_FOLLOWS = 0x04;
        const SEGMENTED_RESPONSE_ACCEPTED = 0x02;
        const NEGATIVE_ACK = 0x02;
        const SERVER = 0x01;
    }
}

/// Maximum segments the requester will accept in a response
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum MaxSegments {
    #[default]
    Unspecified = 0,
    Two = 1,
    Four = 2,
    Eight = 3,
    Sixteen = 4,
    ThirtyTwo = 5,
    SixtyFour = 6,
    GreaterThan64 = 7,
}

impl MaxSegments {
    /// Hard segment-count limit, if the encoding expresses one.
    pub fn limit(&self) -> Option<u32> {
        match self {
            MaxSegments::Unspecified | MaxSegments::GreaterThan64 => None,
            MaxSegments::Two => Some(2),
            MaxSegments::Four => Some(4),
            MaxSegments::Eight => Some(8),
            MaxSegments::Sixteen => Some(16),
            MaxSegments::ThirtyTwo => Some(32),
            MaxSegments::SixtyFour => Some(64),
        }
    }

    fn from_bits(bits: u8) -> Self {
        match bits & 0x07 {
            1 => MaxSegments::Two,
            2 => MaxSegments::Four,
            3 => MaxSegments::Eight,
            4 => MaxSegments::Sixteen,
            5 => MaxSegments::ThirtyTwo,
            6 => MaxSegments::SixtyFour,
            7 => MaxSegments::GreaterThan64,
            _ => MaxSegments::Unspecified,
        }
    }
}

/// Maximum APDU size the requester will accept
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum MaxApduSize {
    Up50 = 0,
    Up128 = 1,
    Up206 = 2,
    Up480 = 3,
    Up1024 = 4,
    #[default]
    Up1476 = 5,
}

impl MaxApduSize {
    /// The actual size in bytes
    pub fn size(&self) -> usize {
        match self {
            MaxApduSize::Up50 => 50,
            MaxApduSize::Up128 => 128,
            MaxApduSize::Up206 => 206,
            MaxApduSize::Up480 => 480,
            MaxApduSize::Up1024 => 1024,
            MaxApduSize::Up1476 => 1476,
        }
    }

    /// Largest encodable class that fits within `budget` bytes.
    pub fn fitting(budget: usize) -> Self {
        if budget >= 1476 {
            MaxApduSize::Up1476
        } else if budget >= 1024 {
            MaxApduSize::Up1024
        } else if budget >= 480 {
            MaxApduSize::Up480
        } else if budget >= 206 {
            MaxApduSize::Up206
        } else if budget >= 128 {
            MaxApduSize::Up128
        } else {
            MaxApduSize::Up50
        }
    }

    fn from_bits(bits: u8) -> Self {
        match bits & 0x0F {
            1 => MaxApduSize::Up128,
            2 => MaxApduSize::Up206,
            3 => MaxApduSize::Up480,
            4 => MaxApduSize::Up1024,
            5 => MaxApduSize::Up1476,
            _ => MaxApduSize::Up50,
        }
    }
}

/// Application Protocol Data Unit.
///
/// Service choices are carried as raw `u8` so that a frame with an
/// unrecognized choice still decodes far enough for the dispatcher to send a
/// reject referencing the right invoke id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Apdu {
    /// Confirmed service request
    ConfirmedRequest {
        segmented: bool,
        more_follows: bool,
        segmented_response_accepted: bool,
        max_segments: MaxSegments,
        max_response_size: MaxApduSize,
        invoke_id: u8,
        sequence_number: Option<u8>,
        proposed_window_size: Option<u8>,
        service_choice: u8,
        service_data: Vec<u8>,
    },

    /// Unconfirmed service request
    UnconfirmedRequest {
        service_choice: u8,
        service_data: Vec<u8>,
    },

    /// Simple acknowledgment
    SimpleAck { invoke_id: u8, service_choice: u8 },

    /// Complex acknowledgment
    ComplexAck {
        segmented: bool,
        more_follows: bool,
        invoke_id: u8,
        sequence_number: Option<u8>,
        proposed_window_size: Option<u8>,
        service_choice: u8,
        service_data: Vec<u8>,
    },

    /// Segment acknowledgment
    SegmentAck {
        negative: bool,
        server: bool,
        invoke_id: u8,
        sequence_number: u8,
        actual_window_size: u8,
    },

    /// Error PDU
    Error {
        invoke_id: u8,
        service_choice: u8,
        error_class: u16,
        error_code: u16,
    },

    /// Reject PDU
    Reject { invoke_id: u8, reject_reason: u8 },

    /// Abort PDU
    Abort {
        server: bool,
        invoke_id: u8,
        abort_reason: u8,
    },
}

impl Apdu {
    /// The PDU type of this APDU
    pub fn apdu_type(&self) -> ApduType {
        match self {
            Apdu::ConfirmedRequest { .. } => ApduType::ConfirmedRequest,
            Apdu::UnconfirmedRequest { .. } => ApduType::UnconfirmedRequest,
            Apdu::SimpleAck { .. } => ApduType::SimpleAck,
            Apdu::ComplexAck { .. } => ApduType::ComplexAck,
            Apdu::SegmentAck { .. } => ApduType::SegmentAck,
            Apdu::Error { .. } => ApduType::Error,
            Apdu::Reject { .. } => ApduType::Reject,
            Apdu::Abort { .. } => ApduType::Abort,
        }
    }

    /// The invoke id, for every type that carries one
    pub fn invoke_id(&self) -> Option<u8> {
        match self {
            Apdu::ConfirmedRequest { invoke_id, .. }
            | Apdu::SimpleAck { invoke_id, .. }
            | Apdu::ComplexAck { invoke_id, .. }
            | Apdu::SegmentAck { invoke_id, .. }
            | Apdu::Error { invoke_id, .. }
            | Apdu::Reject { invoke_id, .. }
            | Apdu::Abort { invoke_id, .. } => Some(*invoke_id),
            Apdu::UnconfirmedRequest { .. } => None,
        }
    }

    /// Encode to wire bytes
    pub fn encode(&self) -> Vec<u8> {
        let mut buffer = Vec::with_capacity(self.encoded_header_len() + self.data_len());
        self.encode_into(&mut buffer);
        buffer
    }

    /// Encode, appending to an existing buffer
    pub fn encode_into(&self, buffer: &mut Vec<u8>) {
        match self {
            Apdu::ConfirmedRequest {
                segmented,
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
                let mut flags = ApduFlags::empty();
                flags.set(ApduFlags::SEGMENTED, *segmented);
                flags.set(ApduFlags::MORE_FOLLOWS, *more_follows);
                flags.set(
                    ApduFlags::SEGMENTED_RESPONSE_ACCEPTED,
                    *segmented_response_accepted,
                );
                buffer.push(((ApduType::ConfirmedRequest as u8) << 4) | flags.bits());
                buffer.push(((*max_segments as u8) << 4) | (*max_response_size as u8));
                buffer.push(*invoke_id);
                if *segmented {
                    buffer.push(sequence_number.unwrap_or(0));
                    buffer.push(proposed_window_size.unwrap_or(1));
                }
                buffer.push(*service_choice);
                buffer.extend_from_slice(service_data);
            }

            Apdu::UnconfirmedRequest {
                service_choice,
                service_data,
            } => {
                buffer.push((ApduType::UnconfirmedRequest as u8) << 4);
                buffer.push(*service_choice);
                buffer.extend_from_slice(service_data);
            }

            Apdu::SimpleAck {
                invoke_id,
                service_choice,
            } => {
                buffer.push((ApduType::SimpleAck as u8) << 4);
                buffer.push(*invoke_id);
                buffer.push(*service_choice);
            }

            Apdu::ComplexAck {
                segmented,
                more_follows,
                invoke_id,
                sequence_number,
                proposed_window_size,
                service_choice,
                service_data,
            } => {
                let mut flags = ApduFlags::empty();
                flags.set(ApduFlags::SEGMENTED, *segmented);
                flags.set(ApduFlags::MORE_FOLLOWS, *more_follows);
                buffer.push(((ApduType::ComplexAck as u8) << 4) | flags.bits());
                buffer.push(*invoke_id);
                if *segmented {
                    buffer.push(sequence_number.unwrap_or(0));
                    buffer.push(proposed_window_size.unwrap_or(1));
                }
                buffer.push(*service_choice);
                buffer.extend_from_slice(service_data);
            }

            Apdu::SegmentAck {
                negative,
                server,
                invoke_id,
                sequence_number,
                actual_window_size,
            } => {
                let mut flags = ApduFlags::empty();
                flags.set(ApduFlags::NEGATIVE_ACK, *negative);
                flags.set(ApduFlags::SERVER, *server);
                buffer.push(((ApduType::SegmentAck as u8) << 4) | flags.bits());
                buffer.push(*invoke_id);
                buffer.push(*sequence_number);
                buffer.push(*actual_window_size);
            }

            Apdu::Error {
                invoke_id,
                service_choice,
                error_class,
                error_code,
            } => {
                buffer.push((ApduType::Error as u8) << 4);
                buffer.push(*invoke_id);
                buffer.push(*service_choice);
                // Class and code travel as tagged enumerated values
                crate::encoding::encode_enumerated(buffer, *error_class as u32);
                crate::encoding::encode_enumerated(buffer, *error_code as u32);
            }

            Apdu::Reject {
                invoke_id,
                reject_reason,
            } => {
                buffer.push((ApduType::Reject as u8) << 4);
                buffer.push(*invoke_id);
                buffer.push(*reject_reason);
            }

            Apdu::Abort {
                server,
                invoke_id,
                abort_reason,
            } => {
                let mut flags = ApduFlags::empty();
                flags.set(ApduFlags::SERVER, *server);
                buffer.push(((ApduType::Abort as u8) << 4) | flags.bits());
                buffer.push(*invoke_id);
                buffer.push(*abort_reason);
            }
        }
    }

    fn encoded_header_len(&self) -> usize {
        match self {
            Apdu::ConfirmedRequest { segmented, .. } => 4 + if *segmented { 2 } else { 0 },
            Apdu::UnconfirmedRequest { .. } => 2,
            Apdu::SimpleAck { .. } => 3,
            Apdu::ComplexAck { segmented, .. } => 3 + if *segmented { 2 } else { 0 },
            Apdu::SegmentAck { .. } => 4,
            Apdu::Error { .. } => 7,
            Apdu::Reject { .. } | Apdu::Abort { .. } => 3,
        }
    }

    fn data_len(&self) -> usize {
        match self {
            Apdu::ConfirmedRequest { service_data, .. }
            | Apdu::UnconfirmedRequest { service_data, .. }
            | Apdu::ComplexAck { service_data, .. } => service_data.len(),
            _ => 0,
        }
    }

    /// Decode from wire bytes
    pub fn decode(data: &[u8]) -> Result<Self> {
        let first = *data.first().ok_or(ApduError::Truncated("empty frame"))?;
        let pdu_type = ApduType::try_from(first >> 4)?;
        let flags = ApduFlags::from_bits_truncate(first & 0x0F);

        match pdu_type {
            ApduType::ConfirmedRequest => {
                let segmented = flags.contains(ApduFlags::SEGMENTED);
                let fixed = if segmented { 6 } else { 4 };
                if data.len() < fixed {
                    return Err(ApduError::Truncated("confirmed request header"));
                }
                let max_info = data[1];
                let invoke_id = data[2];
                let (sequence_number, proposed_window_size, choice_at) = if segmented {
                    (Some(data[3]), Some(data[4]), 5)
                } else {
                    (None, None, 3)
                };
                Ok(Apdu::ConfirmedRequest {
                    segmented,
                    more_follows: flags.contains(ApduFlags::MORE_FOLLOWS),
                    segmented_response_accepted: flags
                        .contains(ApduFlags::SEGMENTED_RESPONSE_ACCEPTED),
                    max_segments: MaxSegments::from_bits(max_info >> 4),
                    max_response_size: MaxApduSize::from_bits(max_info),
                    invoke_id,
                    sequence_number,
                    proposed_window_size,
                    service_choice: data[choice_at],
                    service_data: data[choice_at + 1..].to_vec(),
                })
            }

            ApduType::UnconfirmedRequest => {
                if data.len() < 2 {
                    return Err(ApduError::Truncated("unconfirmed request header"));
                }
                Ok(Apdu::UnconfirmedRequest {
                    service_choice: data[1],
                    service_data: data[2..].to_vec(),
                })
            }

            ApduType::SimpleAck => {
                if data.len() < 3 {
                    return Err(ApduError::Truncated("simple ack"));
                }
                Ok(Apdu::SimpleAck {
                    invoke_id: data[1],
                    service_choice: data[2],
                })
            }

            ApduType::ComplexAck => {
                let segmented = flags.contains(ApduFlags::SEGMENTED);
                let fixed = if segmented { 5 } else { 3 };
                if data.len() < fixed {
                    return Err(ApduError::Truncated("complex ack header"));
                }
                let invoke_id = data[1];
                let (sequence_number, proposed_window_size, choice_at) = if segmented {
                    (Some(data[2]), Some(data[3]), 4)
                } else {
                    (None, None, 2)
                };
                Ok(Apdu::ComplexAck {
                    segmented,
                    more_follows: flags.contains(ApduFlags::MORE_FOLLOWS),
                    invoke_id,
                    sequence_number,
                    proposed_window_size,
                    service_choice: data[choice_at],
                    service_data: data[choice_at + 1..].to_vec(),
                })
            }

            ApduType::SegmentAck => {
                if data.len() < 4 {
                    return Err(ApduError::Truncated("segment ack"));
                }
                Ok(Apdu::SegmentAck {
                    negative: flags.contains(ApduFlags::NEGATIVE_ACK),
                    server: flags.contains(ApduFlags::SERVER),
                    invoke_id: data[1],
                    sequence_number: data[2],
                    actual_window_size: data[3],
                })
            }

            ApduType::Error => {
                if data.len() < 5 {
                    return Err(ApduError::Truncated("error pdu"));
                }
                let invoke_id = data[1];
                let service_choice = data[2];
                let mut pos = 3;
                let (error_class, consumed) = crate::encoding::decode_enumerated(&data[pos..])
                    .map_err(|_| ApduError::Truncated("error class"))?;
                pos += consumed;
                let (error_code, _) = crate::encoding::decode_enumerated(&data[pos..])
                    .map_err(|_| ApduError::Truncated("error code"))?;
                Ok(Apdu::Error {
                    invoke_id,
                    service_choice,
                    error_class: error_class as u16,
                    error_code: error_code as u16,
                })
            }

            ApduType::Reject => {
                if data.len() < 3 {
                    return Err(ApduError::Truncated("reject pdu"));
                }
                Ok(Apdu::Reject {
                    invoke_id: data[1],
                    reject_reason: data[2],
                })
            }

            ApduType::Abort => {
                if data.len() < 3 {
                    return Err(ApduError::Truncated("abort pdu"));
                }
                Ok(Apdu::Abort {
                    server: flags.contains(ApduFlags::SERVER),
                    invoke_id: data[1],
                    abort_reason: data[2],
                })
            }
        }
    }
}
