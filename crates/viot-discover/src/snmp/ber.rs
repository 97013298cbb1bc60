//! Minimal BER codec for SNMP v1/v2c messages.
//!
//! Covers exactly what the discovery engine sends and receives: a
//! GetRequest with NULL-valued varbinds, and the matching Response PDU.

use std::net::Ipv4Addr;

use thiserror::Error;

pub const TAG_INTEGER: u8 = 0x02;
pub const TAG_OCTET_STRING: u8 = 0x04;
pub const TAG_NULL: u8 = 0x05;
pub const TAG_OID: u8 = 0x06;
pub const TAG_SEQUENCE: u8 = 0x30;
pub const TAG_IP_ADDRESS: u8 = 0x40;
pub const TAG_COUNTER32: u8 = 0x41;
pub const TAG_GAUGE32: u8 = 0x42;
pub const TAG_TIMETICKS: u8 = 0x43;
pub const TAG_OPAQUE: u8 = 0x44;
pub const TAG_COUNTER64: u8 = 0x46;
pub const TAG_NO_SUCH_OBJECT: u8 = 0x80;
pub const TAG_NO_SUCH_INSTANCE: u8 = 0x81;
pub const TAG_END_OF_MIB_VIEW: u8 = 0x82;

pub const PDU_GET_REQUEST: u8 = 0xA0;
pub const PDU_RESPONSE: u8 = 0xA2;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BerError {
    #[error("message truncated")]
    Truncated,

    #[error("expected tag 0x{expected:02x}, found 0x{found:02x}")]
    UnexpectedTag { expected: u8, found: u8 },

    #[error("unsupported length encoding")]
    Length,

    #[error("integer does not fit in 64 bits")]
    IntegerOverflow,

    #[error("invalid object identifier: {0}")]
    InvalidOid(String),

    #[error("unsupported value tag 0x{0:02x}")]
    UnsupportedTag(u8),
}

/// A varbind value as carried on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SnmpValue {
    Integer(i64),
    OctetString(Vec<u8>),
    Null,
    ObjectId(String),
    IpAddress(Ipv4Addr),
    Counter32(u32),
    Gauge32(u32),
    TimeTicks(u32),
    Opaque(Vec<u8>),
    Counter64(u64),
    NoSuchObject,
    NoSuchInstance,
    EndOfMibView,
}

impl SnmpValue {
    /// Some(reason) when the agent returned no usable value.
    pub fn absence(&self) -> Option<&'static str> {
        match self {
            Self::Null => Some("null"),
            Self::NoSuchObject => Some("noSuchObject"),
            Self::NoSuchInstance => Some("noSuchInstance"),
            Self::EndOfMibView => Some("endOfMibView"),
            _ => None,
        }
    }

    pub fn as_integer(&self) -> Option<i64> {
        match self {
            Self::Integer(v) => Some(*v),
            Self::Counter32(v) | Self::Gauge32(v) | Self::TimeTicks(v) => Some(i64::from(*v)),
            Self::Counter64(v) => i64::try_from(*v).ok(),
            _ => None,
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Integer(_) => "INTEGER",
            Self::OctetString(_) => "OCTET STRING",
            Self::Null => "NULL",
            Self::ObjectId(_) => "OBJECT IDENTIFIER",
            Self::IpAddress(_) => "IpAddress",
            Self::Counter32(_) => "Counter32",
            Self::Gauge32(_) => "Gauge32",
            Self::TimeTicks(_) => "TimeTicks",
            Self::Opaque(_) => "Opaque",
            Self::Counter64(_) => "Counter64",
            Self::NoSuchObject => "noSuchObject",
            Self::NoSuchInstance => "noSuchInstance",
            Self::EndOfMibView => "endOfMibView",
        }
    }
}

/// Decoded SNMP message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub version: i64,
    pub community: Vec<u8>,
    pub pdu_type: u8,
    pub request_id: i32,
    pub error_status: i64,
    pub error_index: i64,
    pub varbinds: Vec<(String, SnmpValue)>,
}

// ── Encoding ──────────────────────────────────────────────────────

/// Encode a GetRequest for `oids` with NULL placeholder values.
pub fn encode_get_request(
    version: i64,
    community: &str,
    request_id: i32,
    oids: &[String],
) -> Result<Vec<u8>, BerError> {
    let varbinds: Vec<(String, SnmpValue)> = oids
        .iter()
        .map(|oid| (oid.clone(), SnmpValue::Null))
        .collect();

    encode_message(&Message {
        version,
        community: community.as_bytes().to_vec(),
        pdu_type: PDU_GET_REQUEST,
        request_id,
        error_status: 0,
        error_index: 0,
        varbinds,
    })
}

pub fn encode_message(message: &Message) -> Result<Vec<u8>, BerError> {
    let mut bind_list = Vec::new();
    for (oid, value) in &message.varbinds {
        let mut bind = encode_oid(oid)?;
        bind.extend(encode_value(value)?);
        bind_list.extend(tlv(TAG_SEQUENCE, &bind));
    }

    let mut pdu = tlv(TAG_INTEGER, &integer_bytes(i64::from(message.request_id)));
    pdu.extend(tlv(TAG_INTEGER, &integer_bytes(message.error_status)));
    pdu.extend(tlv(TAG_INTEGER, &integer_bytes(message.error_index)));
    pdu.extend(tlv(TAG_SEQUENCE, &bind_list));

    let mut body = tlv(TAG_INTEGER, &integer_bytes(message.version));
    body.extend(tlv(TAG_OCTET_STRING, &message.community));
    body.extend(tlv(message.pdu_type, &pdu));

    Ok(tlv(TAG_SEQUENCE, &body))
}

fn encode_value(value: &SnmpValue) -> Result<Vec<u8>, BerError> {
    let encoded = match value {
        SnmpValue::Integer(v) => tlv(TAG_INTEGER, &integer_bytes(*v)),
        SnmpValue::OctetString(bytes) => tlv(TAG_OCTET_STRING, bytes),
        SnmpValue::Null => tlv(TAG_NULL, &[]),
        SnmpValue::ObjectId(oid) => encode_oid(oid)?,
        SnmpValue::IpAddress(ip) => tlv(TAG_IP_ADDRESS, &ip.octets()),
        SnmpValue::Counter32(v) => tlv(TAG_COUNTER32, &unsigned_bytes(u64::from(*v))),
        SnmpValue::Gauge32(v) => tlv(TAG_GAUGE32, &unsigned_bytes(u64::from(*v))),
        SnmpValue::TimeTicks(v) => tlv(TAG_TIMETICKS, &unsigned_bytes(u64::from(*v))),
        SnmpValue::Opaque(bytes) => tlv(TAG_OPAQUE, bytes),
        SnmpValue::Counter64(v) => tlv(TAG_COUNTER64, &unsigned_bytes(*v)),
        SnmpValue::NoSuchObject => tlv(TAG_NO_SUCH_OBJECT, &[]),
        SnmpValue::NoSuchInstance => tlv(TAG_NO_SUCH_INSTANCE, &[]),
        SnmpValue::EndOfMibView => tlv(TAG_END_OF_MIB_VIEW, &[]),
    };
    Ok(encoded)
}

fn tlv(tag: u8, content: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(content.len() + 4);
    out.push(tag);
    encode_length(content.len(), &mut out);
    out.extend_from_slice(content);
    out
}

fn encode_length(len: usize, out: &mut Vec<u8>) {
    if len < 0x80 {
        out.push(len as u8);
        return;
    }
    let bytes = len.to_be_bytes();
    let skip = bytes.iter().take_while(|b| **b == 0).count();
    let significant = &bytes[skip..];
    out.push(0x80 | significant.len() as u8);
    out.extend_from_slice(significant);
}

/// Minimal two's-complement encoding.
fn integer_bytes(value: i64) -> Vec<u8> {
    let bytes = value.to_be_bytes();
    let mut start = 0;
    while start < 7 {
        let (cur, next) = (bytes[start], bytes[start + 1]);
        let redundant = (cur == 0x00 && next & 0x80 == 0) || (cur == 0xFF && next & 0x80 != 0);
        if !redundant {
            break;
        }
        start += 1;
    }
    bytes[start..].to_vec()
}

/// Unsigned application types keep a leading zero when the high bit is set.
fn unsigned_bytes(value: u64) -> Vec<u8> {
    let bytes = value.to_be_bytes();
    let skip = bytes.iter().take(7).take_while(|b| **b == 0).count();
    let mut out = bytes[skip..].to_vec();
    if out[0] & 0x80 != 0 {
        out.insert(0, 0);
    }
    out
}

pub fn encode_oid(oid: &str) -> Result<Vec<u8>, BerError> {
    let arcs = oid
        .trim()
        .trim_start_matches('.')
        .split('.')
        .map(|arc| arc.parse::<u32>())
        .collect::<Result<Vec<u32>, _>>()
        .map_err(|_| BerError::InvalidOid(oid.to_string()))?;

    if arcs.len() < 2 || arcs[0] > 2 || (arcs[0] < 2 && arcs[1] >= 40) {
        return Err(BerError::InvalidOid(oid.to_string()));
    }

    let mut content = Vec::new();
    push_base128(arcs[0] * 40 + arcs[1], &mut content);
    for arc in &arcs[2..] {
        push_base128(*arc, &mut content);
    }

    Ok(tlv(TAG_OID, &content))
}

fn push_base128(mut value: u32, out: &mut Vec<u8>) {
    let mut groups = vec![(value & 0x7F) as u8];
    value >>= 7;
    while value > 0 {
        groups.push(((value & 0x7F) as u8) | 0x80);
        value >>= 7;
    }
    groups.reverse();
    out.extend(groups);
}

// ── Decoding ──────────────────────────────────────────────────────

struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn is_empty(&self) -> bool {
        self.pos >= self.buf.len()
    }

    fn byte(&mut self) -> Result<u8, BerError> {
        let b = *self.buf.get(self.pos).ok_or(BerError::Truncated)?;
        self.pos += 1;
        Ok(b)
    }

    fn length(&mut self) -> Result<usize, BerError> {
        let first = self.byte()?;
        if first & 0x80 == 0 {
            return Ok(usize::from(first));
        }
        let count = usize::from(first & 0x7F);
        if count == 0 || count > 4 {
            return Err(BerError::Length);
        }
        let mut len = 0usize;
        for _ in 0..count {
            len = (len << 8) | usize::from(self.byte()?);
        }
        Ok(len)
    }

    /// Next TLV as (tag, content).
    fn tlv(&mut self) -> Result<(u8, &'a [u8]), BerError> {
        let tag = self.byte()?;
        let len = self.length()?;
        let end = self.pos.checked_add(len).ok_or(BerError::Length)?;
        let content = self.buf.get(self.pos..end).ok_or(BerError::Truncated)?;
        self.pos = end;
        Ok((tag, content))
    }

    fn expect(&mut self, expected: u8) -> Result<&'a [u8], BerError> {
        let (found, content) = self.tlv()?;
        if found != expected {
            return Err(BerError::UnexpectedTag { expected, found });
        }
        Ok(content)
    }
}

pub fn decode_message(buf: &[u8]) -> Result<Message, BerError> {
    let mut outer = Reader::new(buf);
    let mut body = Reader::new(outer.expect(TAG_SEQUENCE)?);

    let version = decode_integer(body.expect(TAG_INTEGER)?)?;
    let community = body.expect(TAG_OCTET_STRING)?.to_vec();
    let (pdu_type, pdu_content) = body.tlv()?;

    let mut pdu = Reader::new(pdu_content);
    let request_id = decode_integer(pdu.expect(TAG_INTEGER)?)?;
    let error_status = decode_integer(pdu.expect(TAG_INTEGER)?)?;
    let error_index = decode_integer(pdu.expect(TAG_INTEGER)?)?;

    let mut binds = Reader::new(pdu.expect(TAG_SEQUENCE)?);
    let mut varbinds = Vec::new();
    while !binds.is_empty() {
        let mut bind = Reader::new(binds.expect(TAG_SEQUENCE)?);
        let oid = decode_oid(bind.expect(TAG_OID)?)?;
        let (tag, content) = bind.tlv()?;
        varbinds.push((oid, decode_value(tag, content)?));
    }

    Ok(Message {
        version,
        community,
        pdu_type,
        // Request ids are 32-bit on the wire.
        request_id: request_id as i32,
        error_status,
        error_index,
        varbinds,
    })
}

fn decode_value(tag: u8, content: &[u8]) -> Result<SnmpValue, BerError> {
    let value = match tag {
        TAG_INTEGER => SnmpValue::Integer(decode_integer(content)?),
        TAG_OCTET_STRING => SnmpValue::OctetString(content.to_vec()),
        TAG_NULL => SnmpValue::Null,
        TAG_OID => SnmpValue::ObjectId(decode_oid(content)?),
        TAG_IP_ADDRESS => {
            let octets: [u8; 4] = content.try_into().map_err(|_| BerError::Length)?;
            SnmpValue::IpAddress(Ipv4Addr::from(octets))
        }
        TAG_COUNTER32 => SnmpValue::Counter32(decode_u32(content)?),
        TAG_GAUGE32 => SnmpValue::Gauge32(decode_u32(content)?),
        TAG_TIMETICKS => SnmpValue::TimeTicks(decode_u32(content)?),
        TAG_OPAQUE => SnmpValue::Opaque(content.to_vec()),
        TAG_COUNTER64 => SnmpValue::Counter64(decode_unsigned(content)?),
        TAG_NO_SUCH_OBJECT => SnmpValue::NoSuchObject,
        TAG_NO_SUCH_INSTANCE => SnmpValue::NoSuchInstance,
        TAG_END_OF_MIB_VIEW => SnmpValue::EndOfMibView,
        other => return Err(BerError::UnsupportedTag(other)),
    };
    Ok(value)
}

fn decode_integer(content: &[u8]) -> Result<i64, BerError> {
    if content.is_empty() {
        return Err(BerError::Truncated);
    }
    if content.len() > 8 {
        return Err(BerError::IntegerOverflow);
    }
    let seed: i64 = if content[0] & 0x80 != 0 { -1 } else { 0 };
    Ok(content
        .iter()
        .fold(seed, |acc, b| (acc << 8) | i64::from(*b)))
}

fn decode_unsigned(content: &[u8]) -> Result<u64, BerError> {
    let significant = match content {
        [0, rest @ ..] if !rest.is_empty() => rest,
        other => other,
    };
    if significant.is_empty() {
        return Err(BerError::Truncated);
    }
    if significant.len() > 8 {
        return Err(BerError::IntegerOverflow);
    }
    Ok(significant
        .iter()
        .fold(0u64, |acc, b| (acc << 8) | u64::from(*b)))
}

fn decode_u32(content: &[u8]) -> Result<u32, BerError> {
    u32::try_from(decode_unsigned(content)?).map_err(|_| BerError::IntegerOverflow)
}

fn decode_oid(content: &[u8]) -> Result<String, BerError> {
    let mut arcs: Vec<u64> = Vec::new();
    let mut acc: u64 = 0;
    for (i, b) in content.iter().enumerate() {
        acc = (acc << 7) | u64::from(b & 0x7F);
        if acc > u64::from(u32::MAX) {
            return Err(BerError::InvalidOid(format!("arc overflow at byte {i}")));
        }
        if b & 0x80 == 0 {
            if arcs.is_empty() {
                let first = (acc / 40).min(2);
                arcs.push(first);
                arcs.push(acc - first * 40);
            } else {
                arcs.push(acc);
            }
            acc = 0;
        }
    }

    if arcs.is_empty() || content.last().is_some_and(|b| b & 0x80 != 0) {
        return Err(BerError::InvalidOid("incomplete encoding".to_string()));
    }

    Ok(arcs
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("."))
}
