//! DNS message codec.
//!
//! Names are decoded with support for compression pointers. Pointer
//! chains are bounded: every pointer must point strictly backwards, at
//! most [`MAX_POINTER_JUMPS`] pointers are followed per name and decoded
//! names may not exceed [`MAX_NAME_LENGTH`] bytes. Labels must be UTF-8
//! without dots so a decoded name encodes back to the same bytes. Names
//! are always encoded uncompressed.

use std::net::{Ipv4Addr, Ipv6Addr};

use serde::{Deserialize, Serialize};

use crate::frame::FrameType;
use crate::{Codec, FrameError};

const HEADER_LENGTH: usize = 12;

pub const MAX_POINTER_JUMPS: usize = 32;
pub const MAX_NAME_LENGTH: usize = 255;
pub const MAX_LABEL_LENGTH: usize = 63;

pub const TYPE_A: u16 = 1;
pub const TYPE_NS: u16 = 2;
pub const TYPE_CNAME: u16 = 5;
pub const TYPE_PTR: u16 = 12;
pub const TYPE_MX: u16 = 15;
pub const TYPE_AAAA: u16 = 28;
pub const CLASS_IN: u16 = 1;

/// Header flag word.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct DnsFlags {
    pub response: bool,
    /// 4-bit operation code
    pub opcode: u8,
    pub authoritative: bool,
    pub truncated: bool,
    pub recursion_desired: bool,
    pub recursion_available: bool,
    /// 4-bit response code
    pub response_code: u8,
}

impl DnsFlags {
    pub fn to_u16(self) -> u16 {
        ((self.response as u16) << 15)
            | (((self.opcode & 0x0F) as u16) << 11)
            | ((self.authoritative as u16) << 10)
            | ((self.truncated as u16) << 9)
            | ((self.recursion_desired as u16) << 8)
            | ((self.recursion_available as u16) << 7)
            | (self.response_code & 0x0F) as u16
    }

    pub fn from_u16(value: u16) -> Self {
        Self {
            response: value & 0x8000 != 0,
            opcode: ((value >> 11) & 0x0F) as u8,
            authoritative: value & 0x0400 != 0,
            truncated: value & 0x0200 != 0,
            recursion_desired: value & 0x0100 != 0,
            recursion_available: value & 0x0080 != 0,
            response_code: (value & 0x0F) as u8,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DnsQuestion {
    /// Dotted name without the trailing dot
    pub name: String,
    pub record_type: u16,
    pub class: u16,
}

/// Decoded record data. Names inside record data are decompressed.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum RecordData {
    A(Ipv4Addr),
    Aaaa(Ipv6Addr),
    /// CNAME, NS and PTR targets
    Name(String),
    Mx { preference: u16, exchange: String },
    Raw(#[serde(with = "serde_bytes")] Vec<u8>),
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DnsRecord {
    pub name: String,
    pub record_type: u16,
    pub class: u16,
    pub ttl: u32,
    pub data: RecordData,
}

impl DnsRecord {
    pub fn a(name: impl Into<String>, ttl: u32, address: Ipv4Addr) -> Self {
        Self {
            name: name.into(),
            record_type: TYPE_A,
            class: CLASS_IN,
            ttl,
            data: RecordData::A(address),
        }
    }
}

/// A DNS query or response.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct DnsMessage {
    pub id: u16,
    pub flags: DnsFlags,
    pub questions: Vec<DnsQuestion>,
    pub answers: Vec<DnsRecord>,
    pub authorities: Vec<DnsRecord>,
    pub additionals: Vec<DnsRecord>,
}

impl DnsMessage {
    /// Creates a recursive query for `name`.
    pub fn query(id: u16, name: impl Into<String>, record_type: u16) -> Self {
        Self {
            id,
            flags: DnsFlags {
                recursion_desired: true,
                ..DnsFlags::default()
            },
            questions: vec![DnsQuestion {
                name: name.into(),
                record_type,
                class: CLASS_IN,
            }],
            ..Self::default()
        }
    }

    /// Creates a response to `self` carrying `answers`.
    pub fn answer(&self, answers: Vec<DnsRecord>) -> Self {
        Self {
            id: self.id,
            flags: DnsFlags {
                response: true,
                recursion_desired: self.flags.recursion_desired,
                recursion_available: true,
                ..DnsFlags::default()
            },
            questions: self.questions.clone(),
            answers,
            ..Self::default()
        }
    }
}

/// Cursor over a whole message, used for pointer resolution.
struct Reader<'a> {
    message: &'a [u8],
    position: usize,
}

impl<'a> Reader<'a> {
    fn take(&mut self, count: usize) -> Result<&'a [u8], FrameError> {
        let end = self.position + count;
        FrameError::ensure("dns", self.message, end)?;
        let slice = &self.message[self.position..end];
        self.position = end;
        Ok(slice)
    }

    fn u16(&mut self) -> Result<u16, FrameError> {
        let bytes = self.take(2)?;
        Ok(u16::from_be_bytes([bytes[0], bytes[1]]))
    }

    fn u32(&mut self) -> Result<u32, FrameError> {
        let bytes = self.take(4)?;
        Ok(u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    /// Reads a possibly compressed name starting at the cursor.
    fn name(&mut self) -> Result<String, FrameError> {
        let (name, end) = read_name(self.message, self.position)?;
        self.position = end;
        Ok(name)
    }
}

/// Decodes the name at `start`, returning it and the offset just past it
/// in the original (non-pointer) sequence.
fn read_name(message: &[u8], start: usize) -> Result<(String, usize), FrameError> {
    let mut labels: Vec<String> = Vec::new();
    let mut encoded_length = 1usize;
    let mut position = start;
    let mut end = None;
    let mut jumps = 0usize;

    loop {
        FrameError::ensure("dns name", message, position + 1)?;
        let length = message[position] as usize;
        match length & 0xC0 {
            0x00 if length == 0 => {
                break;
            }
            0x00 => {
                FrameError::ensure("dns name", message, position + 1 + length)?;
                encoded_length += length + 1;
                if encoded_length > MAX_NAME_LENGTH {
                    return Err(FrameError::invalid_length("dns name", "name exceeds 255 bytes"));
                }
                let label = std::str::from_utf8(&message[position + 1..position + 1 + length])
                    .map_err(|_| FrameError::InvalidFieldValue("DNS label is not valid UTF-8".to_string()))?;
                if label.contains('.') {
                    return Err(FrameError::InvalidFieldValue(format!("DNS label '{}' contains a dot", label)));
                }
                labels.push(label.to_string());
                position += 1 + length;
            }
            0xC0 => {
                FrameError::ensure("dns name", message, position + 2)?;
                let target = ((length & 0x3F) << 8) | message[position + 1] as usize;
                if target >= position {
                    return Err(FrameError::CompressionLoop(position));
                }
                jumps += 1;
                if jumps > MAX_POINTER_JUMPS {
                    return Err(FrameError::CompressionLoop(position));
                }
                if end.is_none() {
                    end = Some(position + 2);
                }
                position = target;
            }
            _ => {
                return Err(FrameError::InvalidHeaderFormat(format!(
                    "reserved DNS label type 0x{:02x}",
                    length
                )));
            }
        }
    }

    Ok((labels.join("."), end.unwrap_or(position + 1)))
}

/// Checks that `name` can be encoded without loss.
fn check_name(name: &str) -> Result<(), FrameError> {
    if let Some(label) = name.split('.').find(|label| label.len() > MAX_LABEL_LENGTH) {
        return Err(FrameError::InvalidFieldValue(format!(
            "DNS label of {} bytes exceeds {} in {}",
            label.len(),
            MAX_LABEL_LENGTH,
            name
        )));
    }
    if encoded_name_length(name) > MAX_NAME_LENGTH {
        return Err(FrameError::invalid_length("dns name", format!("{} exceeds 255 bytes", name)));
    }
    Ok(())
}

/// Writes `name` as labels. Labels over 63 bytes cannot be represented;
/// their length byte is capped, which [`DnsMessage::encode`] refuses.
fn write_name(bytes: &mut Vec<u8>, name: &str) {
    for label in name.split('.').filter(|label| !label.is_empty()) {
        let label = &label.as_bytes()[..label.len().min(MAX_LABEL_LENGTH)];
        bytes.push(label.len() as u8);
        bytes.extend_from_slice(label);
    }
    bytes.push(0);
}

fn encoded_name_length(name: &str) -> usize {
    name.split('.')
        .filter(|label| !label.is_empty())
        .map(|label| label.len().min(MAX_LABEL_LENGTH) + 1)
        .sum::<usize>()
        + 1
}

fn data_names(data: &RecordData) -> Option<&str> {
    match data {
        RecordData::Name(name) => Some(name),
        RecordData::Mx { exchange, .. } => Some(exchange),
        _ => None,
    }
}

fn read_question(reader: &mut Reader<'_>) -> Result<DnsQuestion, FrameError> {
    Ok(DnsQuestion {
        name: reader.name()?,
        record_type: reader.u16()?,
        class: reader.u16()?,
    })
}

fn read_record(reader: &mut Reader<'_>) -> Result<DnsRecord, FrameError> {
    let name = reader.name()?;
    let record_type = reader.u16()?;
    let class = reader.u16()?;
    let ttl = reader.u32()?;
    let length = reader.u16()? as usize;
    let data_start = reader.position;
    let raw = reader.take(length)?;

    let data = match (record_type, length) {
        (TYPE_A, 4) => RecordData::A(Ipv4Addr::new(raw[0], raw[1], raw[2], raw[3])),
        (TYPE_AAAA, 16) => {
            let mut octets = [0u8; 16];
            octets.copy_from_slice(raw);
            RecordData::Aaaa(Ipv6Addr::from(octets))
        }
        (TYPE_CNAME | TYPE_NS | TYPE_PTR, _) => RecordData::Name(read_name(reader.message, data_start)?.0),
        (TYPE_MX, n) if n >= 3 => RecordData::Mx {
            preference: u16::from_be_bytes([raw[0], raw[1]]),
            exchange: read_name(reader.message, data_start + 2)?.0,
        },
        _ => RecordData::Raw(raw.to_vec()),
    };

    Ok(DnsRecord {
        name,
        record_type,
        class,
        ttl,
        data,
    })
}

fn record_data_bytes(data: &RecordData) -> Vec<u8> {
    let mut bytes = Vec::new();
    match data {
        RecordData::A(address) => bytes.extend_from_slice(&address.octets()),
        RecordData::Aaaa(address) => bytes.extend_from_slice(&address.octets()),
        RecordData::Name(name) => write_name(&mut bytes, name),
        RecordData::Mx { preference, exchange } => {
            bytes.extend_from_slice(&preference.to_be_bytes());
            write_name(&mut bytes, exchange);
        }
        RecordData::Raw(raw) => bytes.extend_from_slice(raw),
    }
    bytes
}

fn write_record(bytes: &mut Vec<u8>, record: &DnsRecord) {
    write_name(bytes, &record.name);
    bytes.extend_from_slice(&record.record_type.to_be_bytes());
    bytes.extend_from_slice(&record.class.to_be_bytes());
    bytes.extend_from_slice(&record.ttl.to_be_bytes());
    let data = record_data_bytes(&record.data);
    bytes.extend_from_slice(&(data.len() as u16).to_be_bytes());
    bytes.extend_from_slice(&data);
}

impl DnsMessage {
    /// Serializes the message after checking every name is encodable.
    pub fn encode(&self) -> Result<Vec<u8>, FrameError> {
        self.validate()?;
        Ok(self.to_bytes())
    }
}

impl Codec for DnsMessage {
    const FRAME_TYPE: FrameType = FrameType::Dns;

    fn parse(bytes: &[u8]) -> Result<Self, FrameError> {
        FrameError::ensure("dns", bytes, HEADER_LENGTH)?;
        let mut reader = Reader {
            message: bytes,
            position: 0,
        };
        let id = reader.u16()?;
        let flags = DnsFlags::from_u16(reader.u16()?);
        let counts = [reader.u16()?, reader.u16()?, reader.u16()?, reader.u16()?];

        let mut message = DnsMessage {
            id,
            flags,
            ..DnsMessage::default()
        };
        for _ in 0..counts[0] {
            message.questions.push(read_question(&mut reader)?);
        }
        for (count, section) in counts[1..].iter().zip([
            &mut message.answers,
            &mut message.authorities,
            &mut message.additionals,
        ]) {
            for _ in 0..*count {
                section.push(read_record(&mut reader)?);
            }
        }
        Ok(message)
    }

    fn header_length(&self) -> usize {
        HEADER_LENGTH
    }

    fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(self.length());
        bytes.extend_from_slice(&self.id.to_be_bytes());
        bytes.extend_from_slice(&self.flags.to_u16().to_be_bytes());
        for count in [
            self.questions.len(),
            self.answers.len(),
            self.authorities.len(),
            self.additionals.len(),
        ] {
            bytes.extend_from_slice(&(count as u16).to_be_bytes());
        }

        for question in &self.questions {
            write_name(&mut bytes, &question.name);
            bytes.extend_from_slice(&question.record_type.to_be_bytes());
            bytes.extend_from_slice(&question.class.to_be_bytes());
        }
        for record in self.answers.iter().chain(&self.authorities).chain(&self.additionals) {
            write_record(&mut bytes, record);
        }
        bytes
    }

    fn length(&self) -> usize {
        let questions: usize = self
            .questions
            .iter()
            .map(|question| encoded_name_length(&question.name) + 4)
            .sum();
        let records: usize = self
            .answers
            .iter()
            .chain(&self.authorities)
            .chain(&self.additionals)
            .map(|record| encoded_name_length(&record.name) + 10 + record_data_bytes(&record.data).len())
            .sum();
        HEADER_LENGTH + questions + records
    }

    fn validate(&self) -> Result<(), FrameError> {
        let records = self.answers.iter().chain(&self.authorities).chain(&self.additionals);
        let names = self
            .questions
            .iter()
            .map(|question| question.name.as_str())
            .chain(records.flat_map(|record| std::iter::once(record.name.as_str()).chain(data_names(&record.data))));
        for name in names {
            check_name(name)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_query_response_round_trip() {
        let query = DnsMessage::query(0xBEEF, "www.example.com", TYPE_A);
        let bytes = query.to_bytes();
        assert_eq!(bytes.len(), query.length());
        assert_eq!(DnsMessage::parse(&bytes).unwrap(), query);

        let response = query.answer(vec![
            DnsRecord::a("www.example.com", 300, Ipv4Addr::new(93, 184, 216, 34)),
            DnsRecord {
                name: "example.com".into(),
                record_type: TYPE_MX,
                class: CLASS_IN,
                ttl: 60,
                data: RecordData::Mx {
                    preference: 10,
                    exchange: "mail.example.com".into(),
                },
            },
        ]);
        let parsed = DnsMessage::parse(&response.to_bytes()).unwrap();
        assert_eq!(parsed, response);
        assert!(parsed.flags.response);
    }

    #[test]
    fn test_decodes_compression_pointer() {
        let mut bytes = DnsMessage::query(1, "example.com", TYPE_A).to_bytes();
        bytes[7] = 1; // one answer
        // answer name: pointer to the question name at offset 12
        bytes.extend_from_slice(&[0xC0, 12]);
        bytes.extend_from_slice(&[0, 5, 0, 1, 0, 0, 0, 60, 0, 2]);
        bytes.extend_from_slice(&[0xC0, 12]);

        let message = DnsMessage::parse(&bytes).unwrap();
        assert_eq!(message.answers[0].name, "example.com");
        assert_eq!(message.answers[0].data, RecordData::Name("example.com".into()));
    }

    #[test]
    fn test_rejects_pointer_loop() {
        let mut bytes = DnsMessage::query(1, "a", TYPE_A).to_bytes();
        // question name replaced by a pointer to itself
        bytes.truncate(HEADER_LENGTH);
        bytes.extend_from_slice(&[0xC0, 12, 0, 1, 0, 1]);
        assert!(matches!(DnsMessage::parse(&bytes), Err(FrameError::CompressionLoop(12))));
    }

    #[test]
    fn test_truncated_message() {
        let bytes = DnsMessage::query(1, "example.com", TYPE_A).to_bytes();
        assert!(DnsMessage::parse(&bytes[..bytes.len() - 3]).is_err());
        assert!(DnsMessage::parse(&bytes[..5]).is_err());
    }

    #[test]
    fn test_oversized_label_is_rejected() {
        let long = "a".repeat(64);
        let query = DnsMessage::query(1, format!("{}.example.com", long), TYPE_A);
        assert!(matches!(query.validate(), Err(FrameError::InvalidFieldValue(_))));
        assert!(query.encode().is_err());

        let mut response = DnsMessage::query(1, "example.com", TYPE_A);
        response.additionals.push(DnsRecord {
            name: "example.com".into(),
            record_type: TYPE_CNAME,
            class: CLASS_IN,
            ttl: 60,
            data: RecordData::Name(format!("{}.net", long)),
        });
        assert!(response.encode().is_err());

        let fits = DnsMessage::query(1, format!("{}.example.com", &long[..63]), TYPE_A);
        assert_eq!(DnsMessage::parse(&fits.encode().unwrap()).unwrap(), fits);
    }

    #[test]
    fn test_non_utf8_and_dotted_labels_are_rejected() {
        let mut bytes = vec![0, 1, 0, 0, 0, 1, 0, 0, 0, 0, 0, 0];
        bytes.extend_from_slice(&[2, 0xff, 0xfe, 0, 0, 1, 0, 1]);
        assert!(matches!(DnsMessage::parse(&bytes), Err(FrameError::InvalidFieldValue(_))));

        let mut bytes = vec![0, 1, 0, 0, 0, 1, 0, 0, 0, 0, 0, 0];
        bytes.extend_from_slice(&[3, b'a', b'.', b'b', 0, 0, 1, 0, 1]);
        assert!(matches!(DnsMessage::parse(&bytes), Err(FrameError::InvalidFieldValue(_))));
    }
}
