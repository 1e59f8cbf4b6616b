//! BACnet primitive encoding/decoding.
//!
//! This module implements the tagged encoding rules of ASHRAE 135 clause 20
//! for the primitive values the engine itself needs: application and context
//! tags, unsigned/signed integers, enumerations, strings, dates, times and
//! object identifiers. Anything beyond that, meaning the full property-value
//! type system, is the business of an external codec; service envelopes in this
//! crate hand such values around as raw byte ranges, delimited with
//! [`value_extent`] / [`until_closing_tag`].
//!
//! All encode functions append to a `Vec<u8>`; all decode functions take a
//! byte slice and return the decoded value together with the number of bytes
//! consumed.

use std::error::Error;
use std::fmt;

/// Result type for encoding operations
pub type Result<T> = std::result::Result<T, EncodingError>;

/// Errors that can occur during encoding/decoding operations
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EncodingError {
    /// Ran out of input during decoding
    BufferUnderflow,
    /// Tag number or tag class differs from what the grammar requires
    InvalidTag,
    /// Length field is inconsistent with the available data
    InvalidLength,
    /// Structurally valid but semantically unusable encoding
    InvalidFormat(&'static str),
    /// Value cannot be represented in the target range
    ValueOutOfRange,
}

impl fmt::Display for EncodingError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EncodingError::BufferUnderflow => write!(f, "Unexpected end of data"),
            EncodingError::InvalidTag => write!(f, "Invalid tag"),
            EncodingError::InvalidLength => write!(f, "Invalid length"),
            EncodingError::InvalidFormat(msg) => write!(f, "Invalid format: {}", msg),
            EncodingError::ValueOutOfRange => write!(f, "Value out of range"),
        }
    }
}

impl Error for EncodingError {}

/// BACnet application tag numbers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ApplicationTag {
    Null = 0,
    Boolean = 1,
    UnsignedInt = 2,
    SignedInt = 3,
    Real = 4,
    Double = 5,
    OctetString = 6,
    CharacterString = 7,
    BitString = 8,
    Enumerated = 9,
    Date = 10,
    Time = 11,
    ObjectIdentifier = 12,
}

/// Length/value/type field of a decoded tag octet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TagLvt {
    /// Primitive data of the given length follows
    Length(usize),
    /// Application boolean, value carried in the tag octet itself
    Value(u8),
    /// Opening tag of a constructed value
    Opening,
    /// Closing tag of a constructed value
    Closing,
}

/// A decoded tag octet (plus any extension octets).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Tag {
    pub number: u8,
    pub context: bool,
    pub lvt: TagLvt,
    /// Bytes consumed by the tag itself, excluding primitive content
    pub consumed: usize,
}

const UTF8_CHARSET: u8 = 0;

fn encode_tag(buffer: &mut Vec<u8>, number: u8, context: bool, lvt: TagLvt) {
    let mut octet = if number < 15 { number << 4 } else { 0xF0 };
    if context {
        octet |= 0x08;
    }
    let (lvt_bits, length) = match lvt {
        TagLvt::Length(len) if len < 5 => (len as u8, None),
        TagLvt::Length(len) => (5, Some(len)),
        TagLvt::Value(v) => (v & 0x07, None),
        TagLvt::Opening => (6, None),
        TagLvt::Closing => (7, None),
    };
    buffer.push(octet | lvt_bits);
    if number >= 15 {
        buffer.push(number);
    }
    if let Some(len) = length {
        if len < 254 {
            buffer.push(len as u8);
        } else if len <= u16::MAX as usize {
            buffer.push(254);
            buffer.extend_from_slice(&(len as u16).to_be_bytes());
        } else {
            buffer.push(255);
            buffer.extend_from_slice(&(len as u32).to_be_bytes());
        }
    }
}

/// Decode one tag octet with its extensions.
pub fn decode_tag(data: &[u8]) -> Result<Tag> {
    let octet = *data.first().ok_or(EncodingError::BufferUnderflow)?;
    let context = octet & 0x08 != 0;
    let mut pos = 1;
    let number = if octet >> 4 == 0x0F {
        let n = *data.get(pos).ok_or(EncodingError::BufferUnderflow)?;
        pos += 1;
        n
    } else {
        octet >> 4
    };
    let lvt = match octet & 0x07 {
        6 => TagLvt::Opening,
        7 => TagLvt::Closing,
        5 => {
            let first = *data.get(pos).ok_or(EncodingError::BufferUnderflow)?;
            pos += 1;
            let len = match first {
                254 => {
                    let raw = data
                        .get(pos..pos + 2)
                        .ok_or(EncodingError::BufferUnderflow)?;
                    pos += 2;
                    u16::from_be_bytes([raw[0], raw[1]]) as usize
                }
                255 => {
                    let raw = data
                        .get(pos..pos + 4)
                        .ok_or(EncodingError::BufferUnderflow)?;
                    pos += 4;
                    u32::from_be_bytes([raw[0], raw[1], raw[2], raw[3]]) as usize
                }
                n => n as usize,
            };
            TagLvt::Length(len)
        }
        // Application boolean keeps its value in the LVT bits; for every
        // other primitive tag these bits are the content length.
        v if !context && number == ApplicationTag::Boolean as u8 => TagLvt::Value(v),
        v => TagLvt::Length(v as usize),
    };
    Ok(Tag {
        number,
        context,
        lvt,
        consumed: pos,
    })
}

fn expect_primitive(data: &[u8], number: u8, context: bool) -> Result<(usize, usize)> {
    let tag = decode_tag(data)?;
    if tag.number != number || tag.context != context {
        return Err(EncodingError::InvalidTag);
    }
    match tag.lvt {
        TagLvt::Length(len) => {
            if data.len() < tag.consumed + len {
                return Err(EncodingError::InvalidLength);
            }
            Ok((tag.consumed, len))
        }
        _ => Err(EncodingError::InvalidTag),
    }
}

fn unsigned_content(value: u32) -> Vec<u8> {
    let bytes = value.to_be_bytes();
    let skip = bytes.iter().take_while(|&&b| b == 0).count().min(3);
    bytes[skip..].to_vec()
}

fn decode_unsigned_content(content: &[u8]) -> Result<u32> {
    if content.is_empty() || content.len() > 4 {
        return Err(EncodingError::InvalidLength);
    }
    let mut value = 0u32;
    for &byte in content {
        value = (value << 8) | byte as u32;
    }
    Ok(value)
}

pub fn encode_null(buffer: &mut Vec<u8>) {
    encode_tag(buffer, ApplicationTag::Null as u8, false, TagLvt::Length(0));
}

pub fn encode_boolean(buffer: &mut Vec<u8>, value: bool) {
    encode_tag(
        buffer,
        ApplicationTag::Boolean as u8,
        false,
        TagLvt::Value(value as u8),
    );
}

pub fn decode_boolean(data: &[u8]) -> Result<(bool, usize)> {
    let tag = decode_tag(data)?;
    if tag.number != ApplicationTag::Boolean as u8 || tag.context {
        return Err(EncodingError::InvalidTag);
    }
    match tag.lvt {
        TagLvt::Value(v) => Ok((v != 0, tag.consumed)),
        _ => Err(EncodingError::InvalidTag),
    }
}

pub fn encode_unsigned(buffer: &mut Vec<u8>, value: u32) {
    let content = unsigned_content(value);
    encode_tag(
        buffer,
        ApplicationTag::UnsignedInt as u8,
        false,
        TagLvt::Length(content.len()),
    );
    buffer.extend_from_slice(&content);
}

pub fn decode_unsigned(data: &[u8]) -> Result<(u32, usize)> {
    let (consumed, len) = expect_primitive(data, ApplicationTag::UnsignedInt as u8, false)?;
    let value = decode_unsigned_content(&data[consumed..consumed + len])?;
    Ok((value, consumed + len))
}

pub fn encode_signed(buffer: &mut Vec<u8>, value: i32) {
    let bytes = value.to_be_bytes();
    // Shortest form that still preserves the sign bit
    let mut skip = 0;
    while skip < 3 {
        let lead = bytes[skip];
        let next_msb = bytes[skip + 1] & 0x80;
        if (lead == 0x00 && next_msb == 0) || (lead == 0xFF && next_msb != 0) {
            skip += 1;
        } else {
            break;
        }
    }
    let content = &bytes[skip..];
    encode_tag(
        buffer,
        ApplicationTag::SignedInt as u8,
        false,
        TagLvt::Length(content.len()),
    );
    buffer.extend_from_slice(content);
}

pub fn decode_signed(data: &[u8]) -> Result<(i32, usize)> {
    let (consumed, len) = expect_primitive(data, ApplicationTag::SignedInt as u8, false)?;
    let content = &data[consumed..consumed + len];
    if content.is_empty() || content.len() > 4 {
        return Err(EncodingError::InvalidLength);
    }
    let mut value = if content[0] & 0x80 != 0 { -1i32 } else { 0 };
    for &byte in content {
        value = (value << 8) | byte as i32;
    }
    Ok((value, consumed + len))
}

pub fn encode_real(buffer: &mut Vec<u8>, value: f32) {
    encode_tag(buffer, ApplicationTag::Real as u8, false, TagLvt::Length(4));
    buffer.extend_from_slice(&value.to_be_bytes());
}

pub fn decode_real(data: &[u8]) -> Result<(f32, usize)> {
    let (consumed, len) = expect_primitive(data, ApplicationTag::Real as u8, false)?;
    if len != 4 {
        return Err(EncodingError::InvalidLength);
    }
    let raw = &data[consumed..consumed + 4];
    Ok((
        f32::from_be_bytes([raw[0], raw[1], raw[2], raw[3]]),
        consumed + 4,
    ))
}

pub fn encode_enumerated(buffer: &mut Vec<u8>, value: u32) {
    let content = unsigned_content(value);
    encode_tag(
        buffer,
        ApplicationTag::Enumerated as u8,
        false,
        TagLvt::Length(content.len()),
    );
    buffer.extend_from_slice(&content);
}

pub fn decode_enumerated(data: &[u8]) -> Result<(u32, usize)> {
    let (consumed, len) = expect_primitive(data, ApplicationTag::Enumerated as u8, false)?;
    let value = decode_unsigned_content(&data[consumed..consumed + len])?;
    Ok((value, consumed + len))
}

pub fn encode_octet_string(buffer: &mut Vec<u8>, value: &[u8]) {
    encode_tag(
        buffer,
        ApplicationTag::OctetString as u8,
        false,
        TagLvt::Length(value.len()),
    );
    buffer.extend_from_slice(value);
}

pub fn decode_octet_string(data: &[u8]) -> Result<(Vec<u8>, usize)> {
    let (consumed, len) = expect_primitive(data, ApplicationTag::OctetString as u8, false)?;
    Ok((data[consumed..consumed + len].to_vec(), consumed + len))
}

/// Encode a bit string as (number of unused trailing bits, packed bytes).
pub fn encode_bit_string(buffer: &mut Vec<u8>, unused_bits: u8, bits: &[u8]) -> Result<()> {
    if unused_bits > 7 || (bits.is_empty() && unused_bits != 0) {
        return Err(EncodingError::ValueOutOfRange);
    }
    encode_tag(
        buffer,
        ApplicationTag::BitString as u8,
        false,
        TagLvt::Length(bits.len() + 1),
    );
    buffer.push(unused_bits);
    buffer.extend_from_slice(bits);
    Ok(())
}

pub fn decode_bit_string(data: &[u8]) -> Result<((u8, Vec<u8>), usize)> {
    let (consumed, len) = expect_primitive(data, ApplicationTag::BitString as u8, false)?;
    if len == 0 {
        return Err(EncodingError::InvalidLength);
    }
    let unused = data[consumed];
    if unused > 7 {
        return Err(EncodingError::ValueOutOfRange);
    }
    Ok((
        (unused, data[consumed + 1..consumed + len].to_vec()),
        consumed + len,
    ))
}

/// Encode a character string with the UTF-8 character set octet.
pub fn encode_character_string(buffer: &mut Vec<u8>, value: &str) {
    encode_tag(
        buffer,
        ApplicationTag::CharacterString as u8,
        false,
        TagLvt::Length(value.len() + 1),
    );
    buffer.push(UTF8_CHARSET);
    buffer.extend_from_slice(value.as_bytes());
}

pub fn decode_character_string(data: &[u8]) -> Result<(String, usize)> {
    let (consumed, len) = expect_primitive(data, ApplicationTag::CharacterString as u8, false)?;
    if len == 0 {
        return Err(EncodingError::InvalidLength);
    }
    if data[consumed] != UTF8_CHARSET {
        return Err(EncodingError::InvalidFormat("unsupported character set"));
    }
    let text = std::str::from_utf8(&data[consumed + 1..consumed + len])
        .map_err(|_| EncodingError::InvalidFormat("invalid utf-8"))?;
    Ok((text.to_string(), consumed + len))
}

/// Encode a date as (year, month, day, weekday); 255 marks an unspecified field.
pub fn encode_date(buffer: &mut Vec<u8>, year: u16, month: u8, day: u8, weekday: u8) -> Result<()> {
    let year_octet = if year == 0xFF {
        0xFF
    } else {
        u8::try_from(year.checked_sub(1900).ok_or(EncodingError::ValueOutOfRange)?)
            .map_err(|_| EncodingError::ValueOutOfRange)?
    };
    encode_tag(buffer, ApplicationTag::Date as u8, false, TagLvt::Length(4));
    buffer.extend_from_slice(&[year_octet, month, day, weekday]);
    Ok(())
}

pub fn decode_date(data: &[u8]) -> Result<((u16, u8, u8, u8), usize)> {
    let (consumed, len) = expect_primitive(data, ApplicationTag::Date as u8, false)?;
    if len != 4 {
        return Err(EncodingError::InvalidLength);
    }
    let raw = &data[consumed..consumed + 4];
    let year = if raw[0] == 0xFF {
        0xFF
    } else {
        raw[0] as u16 + 1900
    };
    Ok(((year, raw[1], raw[2], raw[3]), consumed + 4))
}

pub fn encode_time(buffer: &mut Vec<u8>, hour: u8, minute: u8, second: u8, hundredths: u8) {
    encode_tag(buffer, ApplicationTag::Time as u8, false, TagLvt::Length(4));
    buffer.extend_from_slice(&[hour, minute, second, hundredths]);
}

pub fn decode_time(data: &[u8]) -> Result<((u8, u8, u8, u8), usize)> {
    let (consumed, len) = expect_primitive(data, ApplicationTag::Time as u8, false)?;
    if len != 4 {
        return Err(EncodingError::InvalidLength);
    }
    let raw = &data[consumed..consumed + 4];
    Ok(((raw[0], raw[1], raw[2], raw[3]), consumed + 4))
}

fn object_id_raw(object_type: u16, instance: u32) -> Result<u32> {
    if object_type > 0x3FF || instance > 0x3FFFFF {
        return Err(EncodingError::ValueOutOfRange);
    }
    Ok(((object_type as u32) << 22) | instance)
}

pub fn encode_object_identifier(
    buffer: &mut Vec<u8>,
    object_type: u16,
    instance: u32,
) -> Result<()> {
    let raw = object_id_raw(object_type, instance)?;
    encode_tag(
        buffer,
        ApplicationTag::ObjectIdentifier as u8,
        false,
        TagLvt::Length(4),
    );
    buffer.extend_from_slice(&raw.to_be_bytes());
    Ok(())
}

pub fn decode_object_identifier(data: &[u8]) -> Result<((u16, u32), usize)> {
    let (consumed, len) = expect_primitive(data, ApplicationTag::ObjectIdentifier as u8, false)?;
    if len != 4 {
        return Err(EncodingError::InvalidLength);
    }
    let raw = u32::from_be_bytes([
        data[consumed],
        data[consumed + 1],
        data[consumed + 2],
        data[consumed + 3],
    ]);
    Ok((((raw >> 22) as u16, raw & 0x3FFFFF), consumed + len))
}

pub fn encode_opening_tag(buffer: &mut Vec<u8>, tag_number: u8) {
    encode_tag(buffer, tag_number, true, TagLvt::Opening);
}

pub fn encode_closing_tag(buffer: &mut Vec<u8>, tag_number: u8) {
    encode_tag(buffer, tag_number, true, TagLvt::Closing);
}

pub fn encode_context_unsigned(buffer: &mut Vec<u8>, tag_number: u8, value: u32) {
    let content = unsigned_content(value);
    encode_tag(buffer, tag_number, true, TagLvt::Length(content.len()));
    buffer.extend_from_slice(&content);
}

pub fn decode_context_unsigned(data: &[u8], tag_number: u8) -> Result<(u32, usize)> {
    let (consumed, len) = expect_primitive(data, tag_number, true)?;
    let value = decode_unsigned_content(&data[consumed..consumed + len])?;
    Ok((value, consumed + len))
}

pub fn encode_context_enumerated(buffer: &mut Vec<u8>, tag_number: u8, value: u32) {
    encode_context_unsigned(buffer, tag_number, value);
}

pub fn decode_context_enumerated(data: &[u8], tag_number: u8) -> Result<(u32, usize)> {
    decode_context_unsigned(data, tag_number)
}

pub fn encode_context_boolean(buffer: &mut Vec<u8>, tag_number: u8, value: bool) {
    encode_tag(buffer, tag_number, true, TagLvt::Length(1));
    buffer.push(value as u8);
}

pub fn decode_context_boolean(data: &[u8], tag_number: u8) -> Result<(bool, usize)> {
    let (consumed, len) = expect_primitive(data, tag_number, true)?;
    if len != 1 {
        return Err(EncodingError::InvalidLength);
    }
    Ok((data[consumed] != 0, consumed + 1))
}

pub fn encode_context_signed(buffer: &mut Vec<u8>, tag_number: u8, value: i32) {
    let mut content = Vec::new();
    encode_signed(&mut content, value);
    // Strip the application tag octet, keep the shortest-form content
    encode_tag(buffer, tag_number, true, TagLvt::Length(content.len() - 1));
    buffer.extend_from_slice(&content[1..]);
}

pub fn decode_context_signed(data: &[u8], tag_number: u8) -> Result<(i32, usize)> {
    let (consumed, len) = expect_primitive(data, tag_number, true)?;
    let content = &data[consumed..consumed + len];
    if content.is_empty() || content.len() > 4 {
        return Err(EncodingError::InvalidLength);
    }
    let mut value = if content[0] & 0x80 != 0 { -1i32 } else { 0 };
    for &byte in content {
        value = (value << 8) | byte as i32;
    }
    Ok((value, consumed + len))
}

pub fn encode_context_real(buffer: &mut Vec<u8>, tag_number: u8, value: f32) {
    encode_tag(buffer, tag_number, true, TagLvt::Length(4));
    buffer.extend_from_slice(&value.to_be_bytes());
}

pub fn decode_context_real(data: &[u8], tag_number: u8) -> Result<(f32, usize)> {
    let (consumed, len) = expect_primitive(data, tag_number, true)?;
    if len != 4 {
        return Err(EncodingError::InvalidLength);
    }
    let raw = &data[consumed..consumed + 4];
    Ok((
        f32::from_be_bytes([raw[0], raw[1], raw[2], raw[3]]),
        consumed + 4,
    ))
}

pub fn encode_context_object_id(
    buffer: &mut Vec<u8>,
    tag_number: u8,
    object_type: u16,
    instance: u32,
) -> Result<()> {
    let raw = object_id_raw(object_type, instance)?;
    encode_tag(buffer, tag_number, true, TagLvt::Length(4));
    buffer.extend_from_slice(&raw.to_be_bytes());
    Ok(())
}

pub fn decode_context_object_id(data: &[u8], tag_number: u8) -> Result<((u16, u32), usize)> {
    let (consumed, len) = expect_primitive(data, tag_number, true)?;
    if len != 4 {
        return Err(EncodingError::InvalidLength);
    }
    let raw = u32::from_be_bytes([
        data[consumed],
        data[consumed + 1],
        data[consumed + 2],
        data[consumed + 3],
    ]);
    Ok((((raw >> 22) as u16, raw & 0x3FFFFF), consumed + len))
}

pub fn encode_context_character_string(buffer: &mut Vec<u8>, tag_number: u8, value: &str) {
    encode_tag(buffer, tag_number, true, TagLvt::Length(value.len() + 1));
    buffer.push(UTF8_CHARSET);
    buffer.extend_from_slice(value.as_bytes());
}

pub fn decode_context_character_string(data: &[u8], tag_number: u8) -> Result<(String, usize)> {
    let (consumed, len) = expect_primitive(data, tag_number, true)?;
    if len == 0 || data[consumed] != UTF8_CHARSET {
        return Err(EncodingError::InvalidFormat("unsupported character set"));
    }
    let text = std::str::from_utf8(&data[consumed + 1..consumed + len])
        .map_err(|_| EncodingError::InvalidFormat("invalid utf-8"))?;
    Ok((text.to_string(), consumed + len))
}

/// Check whether the next tag is an opening tag with the given number.
pub fn peek_opening_tag(data: &[u8], tag_number: u8) -> bool {
    matches!(
        decode_tag(data),
        Ok(Tag {
            number,
            context: true,
            lvt: TagLvt::Opening,
            ..
        }) if number == tag_number
    )
}

/// Check whether the next tag is a context tag with the given number,
/// regardless of its LVT form.
pub fn peek_context_tag(data: &[u8], tag_number: u8) -> bool {
    matches!(
        decode_tag(data),
        Ok(Tag { number, context: true, .. }) if number == tag_number
    )
}

/// Byte extent of exactly one encoded value, primitive or constructed.
///
/// Used to slice opaque property values out of service payloads without
/// interpreting them.
pub fn value_extent(data: &[u8]) -> Result<usize> {
    let mut pos = 0;
    let mut depth = 0u32;
    loop {
        if pos >= data.len() {
            return Err(EncodingError::BufferUnderflow);
        }
        let tag = decode_tag(&data[pos..])?;
        pos += tag.consumed;
        match tag.lvt {
            TagLvt::Opening => depth += 1,
            TagLvt::Closing => {
                depth = depth.checked_sub(1).ok_or(EncodingError::InvalidTag)?;
            }
            TagLvt::Length(len) => {
                if data.len() < pos + len {
                    return Err(EncodingError::InvalidLength);
                }
                pos += len;
            }
            TagLvt::Value(_) => {}
        }
        if depth == 0 {
            return Ok(pos);
        }
    }
}

/// Byte extent of the values preceding the matching closing tag `tag_number`
/// at the current nesting level. The closing tag itself is not included.
pub fn until_closing_tag(data: &[u8], tag_number: u8) -> Result<usize> {
    let mut pos = 0;
    loop {
        if pos >= data.len() {
            return Err(EncodingError::BufferUnderflow);
        }
        let tag = decode_tag(&data[pos..])?;
        if tag.context && tag.number == tag_number && tag.lvt == TagLvt::Closing {
            return Ok(pos);
        }
        pos += value_extent(&data[pos..])?;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unsigned_uses_shortest_content() {
        let mut buffer = Vec::new();
        encode_unsigned(&mut buffer, 0x12);
        assert_eq!(buffer, vec![0x21, 0x12]);

        buffer.clear();
        encode_unsigned(&mut buffer, 0x0123_4567);
        assert_eq!(buffer, vec![0x24, 0x01, 0x23, 0x45, 0x67]);

        let (value, consumed) = decode_unsigned(&buffer).unwrap();
        assert_eq!(value, 0x0123_4567);
        assert_eq!(consumed, buffer.len());
    }

    #[test]
    fn signed_preserves_sign_bit() {
        let mut buffer = Vec::new();
        encode_signed(&mut buffer, -1);
        assert_eq!(buffer, vec![0x31, 0xFF]);

        buffer.clear();
        encode_signed(&mut buffer, 128);
        // 128 needs two octets, otherwise it would read back negative
        assert_eq!(buffer, vec![0x32, 0x00, 0x80]);
        assert_eq!(decode_signed(&buffer).unwrap().0, 128);
    }

    #[test]
    fn object_identifier_known_bytes() {
        // Analog Input instance 42: type 0, instance 42
        let mut buffer = Vec::new();
        encode_object_identifier(&mut buffer, 0, 42).unwrap();
        assert_eq!(buffer, vec![0xC4, 0x00, 0x00, 0x00, 0x2A]);
        let ((object_type, instance), _) = decode_object_identifier(&buffer).unwrap();
        assert_eq!((object_type, instance), (0, 42));

        assert_eq!(
            encode_object_identifier(&mut buffer, 0x400, 0),
            Err(EncodingError::ValueOutOfRange)
        );
    }

    #[test]
    fn character_string_rejects_unknown_charset() {
        let mut buffer = Vec::new();
        encode_character_string(&mut buffer, "pump-7");
        let (text, _) = decode_character_string(&buffer).unwrap();
        assert_eq!(text, "pump-7");

        // Charset 4 (UCS-2) belongs to the external codec
        let foreign = vec![0x74, 0x03, 0x04, 0x00, 0x41];
        assert_eq!(
            decode_character_string(&foreign),
            Err(EncodingError::InvalidFormat("unsupported character set"))
        );
    }

    #[test]
    fn date_year_offset() {
        let mut buffer = Vec::new();
        encode_date(&mut buffer, 2024, 3, 15, 5).unwrap();
        assert_eq!(buffer[1], 124); // 2024 - 1900
        let ((year, month, day, weekday), _) = decode_date(&buffer).unwrap();
        assert_eq!((year, month, day, weekday), (2024, 3, 15, 5));

        assert_eq!(
            encode_date(&mut buffer, 1800, 1, 1, 1),
            Err(EncodingError::ValueOutOfRange)
        );
    }

    #[test]
    fn extended_length_round_trip() {
        let payload = vec![0xAB; 300];
        let mut buffer = Vec::new();
        encode_octet_string(&mut buffer, &payload);
        let (decoded, consumed) = decode_octet_string(&buffer).unwrap();
        assert_eq!(decoded, payload);
        assert_eq!(consumed, buffer.len());
    }

    #[test]
    fn value_extent_walks_constructed_values() {
        let mut buffer = Vec::new();
        encode_opening_tag(&mut buffer, 3);
        encode_real(&mut buffer, 20.5);
        encode_unsigned(&mut buffer, 7);
        encode_closing_tag(&mut buffer, 3);
        let trailing_start = buffer.len();
        encode_boolean(&mut buffer, true);

        assert_eq!(value_extent(&buffer).unwrap(), trailing_start);
        // Inside the construct: two primitive values before the closing tag
        assert_eq!(
            until_closing_tag(&buffer[1..], 3).unwrap(),
            trailing_start - 2
        );
    }

    #[test]
    fn truncated_input_is_underflow_not_panic() {
        let mut buffer = Vec::new();
        encode_unsigned(&mut buffer, 0x1234);
        buffer.truncate(buffer.len() - 1);
        assert_eq!(decode_unsigned(&buffer), Err(EncodingError::InvalidLength));
        assert_eq!(decode_unsigned(&[]), Err(EncodingError::BufferUnderflow));
    }
}
