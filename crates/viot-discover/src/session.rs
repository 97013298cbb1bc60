//! Protocol session model.
//!
//! A session is a connection description plus an ordered list of named
//! queries. Every query declares the kind of value it expects, and raw
//! protocol values go through [`decode_snmp`] / [`decode_registers`] before
//! anything reads them, so a device returning the wrong type produces a
//! [`DecodeError`] instead of a bogus string.

use std::fmt;
use std::net::Ipv4Addr;

use crate::config::{ModbusMode, RegisterKind, SnmpVersion};
use crate::snmp::ber::SnmpValue;

/// Descriptive attribute fetched by a detail session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Field {
    Model,
    SerialNumber,
    Version,
    SnmpEngineId,
    SysName,
    SysDescr,
    Uptime,
}

impl fmt::Display for Field {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Model => "model",
            Self::SerialNumber => "serial_number",
            Self::Version => "version",
            Self::SnmpEngineId => "snmp_engine_id",
            Self::SysName => "sys_name",
            Self::SysDescr => "sys_descr",
            Self::Uptime => "uptime",
        };
        f.write_str(name)
    }
}

/// Name of a query within its session.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum QueryKey {
    /// Match queries are keyed by the target they classify.
    Target(String),
    Field(Field),
}

/// Expected result type of a query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueKind {
    /// Printable string (OCTET STRING or OBJECT IDENTIFIER).
    Text,
    /// Any integer-family value, rendered in decimal.
    Integer,
    /// Opaque byte block rendered as lowercase hex.
    Hex,
    /// TimeTicks or a `"(<n> <unit>)"` string, normalized to seconds.
    Uptime,
}

/// A typed query result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decoded {
    Text(String),
    Seconds(i64),
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DecodeError {
    #[error("expected {expected:?}, device returned {actual}")]
    UnexpectedType {
        expected: ValueKind,
        actual: &'static str,
    },

    #[error("value not present on device ({0})")]
    Missing(&'static str),
}

// ── SNMP ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnmpConn {
    pub ip: Ipv4Addr,
    pub port: u16,
    pub community: String,
    pub version: SnmpVersion,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnmpQuery {
    pub key: QueryKey,
    pub oid: String,
    pub kind: ValueKind,
}

impl SnmpQuery {
    pub fn field(field: Field, oid: &str, kind: ValueKind) -> Self {
        Self {
            key: QueryKey::Field(field),
            oid: oid.to_string(),
            kind,
        }
    }
}

// ── Modbus ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModbusConn {
    pub ip: Ipv4Addr,
    pub port: u16,
    pub mode: ModbusMode,
    pub slave_id: u8,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModbusQuery {
    pub key: QueryKey,
    pub register: RegisterKind,
    pub address: u16,
    /// Number of 16-bit registers.
    pub length: u16,
    pub kind: ValueKind,
}

impl ModbusQuery {
    pub fn field(field: Field, register: RegisterKind, address: u16, length: u16) -> Self {
        Self {
            key: QueryKey::Field(field),
            register,
            address,
            length,
            kind: ValueKind::Text,
        }
    }

    /// Register block identity, used to reuse reads within one connection.
    pub fn block(&self) -> (RegisterKind, u16, u16) {
        (self.register, self.address, self.length)
    }
}

// ── Decoding ──────────────────────────────────────────────────────

/// Decode an SNMP varbind value according to the query's declared kind.
pub fn decode_snmp(kind: ValueKind, value: &SnmpValue) -> Result<Decoded, DecodeError> {
    if let Some(reason) = value.absence() {
        return Err(DecodeError::Missing(reason));
    }

    match (kind, value) {
        (ValueKind::Text, SnmpValue::OctetString(bytes)) => Ok(Decoded::Text(bytes_to_text(bytes))),
        (ValueKind::Text, SnmpValue::ObjectId(oid)) => Ok(Decoded::Text(oid.clone())),
        (ValueKind::Integer, v) => v
            .as_integer()
            .map(|n| Decoded::Text(n.to_string()))
            .ok_or(DecodeError::UnexpectedType {
                expected: kind,
                actual: v.type_name(),
            }),
        (ValueKind::Hex, SnmpValue::OctetString(bytes)) => Ok(Decoded::Text(to_hex(bytes))),
        (ValueKind::Uptime, SnmpValue::TimeTicks(ticks)) => {
            Ok(Decoded::Seconds(i64::from(*ticks) / 100))
        }
        (ValueKind::Uptime, SnmpValue::OctetString(bytes)) => Ok(Decoded::Seconds(
            normalize_uptime(&String::from_utf8_lossy(bytes)),
        )),
        (_, v) => Err(DecodeError::UnexpectedType {
            expected: kind,
            actual: v.type_name(),
        }),
    }
}

/// Decode raw register bytes (big-endian register order) according to kind.
pub fn decode_registers(kind: ValueKind, bytes: &[u8]) -> Result<Decoded, DecodeError> {
    if bytes.is_empty() {
        return Err(DecodeError::Missing("empty register block"));
    }

    match kind {
        ValueKind::Text => Ok(Decoded::Text(bytes_to_text(bytes))),
        ValueKind::Hex => Ok(Decoded::Text(to_hex(bytes))),
        ValueKind::Uptime => Ok(Decoded::Seconds(normalize_uptime(&bytes_to_text(bytes)))),
        ValueKind::Integer => {
            if bytes.len() > 8 {
                return Err(DecodeError::UnexpectedType {
                    expected: kind,
                    actual: "register block wider than 64 bits",
                });
            }
            let value = bytes.iter().fold(0u64, |acc, b| (acc << 8) | u64::from(*b));
            Ok(Decoded::Text(value.to_string()))
        }
    }
}

/// Normalize a `"(<n> <unit>)"` uptime string to seconds.
///
/// Units are days, hours, minutes, seconds (singular accepted). Anything
/// else, including empty input, yields 0.
pub fn normalize_uptime(raw: &str) -> i64 {
    let trimmed = raw.trim().trim_start_matches('(').trim_end_matches(')');
    let parts: Vec<&str> = trimmed.split_whitespace().collect();
    let [count, unit] = parts.as_slice() else {
        return 0;
    };

    let Ok(count) = count.parse::<i64>() else {
        return 0;
    };
    if count < 0 {
        return 0;
    }

    let factor = match *unit {
        "days" | "day" => 86_400,
        "hours" | "hour" => 3_600,
        "minutes" | "minute" => 60,
        "seconds" | "second" => 1,
        _ => return 0,
    };

    count.saturating_mul(factor)
}

/// Printable text from a device byte block: NULs dropped, whitespace trimmed.
pub fn bytes_to_text(bytes: &[u8]) -> String {
    let cleaned: Vec<u8> = bytes.iter().copied().filter(|b| *b != 0).collect();
    String::from_utf8_lossy(&cleaned).trim().to_string()
}

fn to_hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

/// Attributes collected by a detail session.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DetailFields {
    pub model: String,
    pub serial_number: String,
    pub version: String,
    pub snmp_engine_id: String,
    pub sys_name: String,
    pub sys_descr: String,
    pub uptime_secs: i64,
}

impl DetailFields {
    pub fn set(&mut self, field: Field, value: Decoded) {
        let text = match value {
            Decoded::Seconds(secs) => {
                if field == Field::Uptime {
                    self.uptime_secs = secs;
                    return;
                }
                secs.to_string()
            }
            Decoded::Text(text) => text,
        };

        match field {
            Field::Model => self.model = text,
            Field::SerialNumber => self.serial_number = text,
            Field::Version => self.version = text,
            Field::SnmpEngineId => self.snmp_engine_id = text,
            Field::SysName => self.sys_name = text,
            Field::SysDescr => self.sys_descr = text,
            Field::Uptime => self.uptime_secs = normalize_uptime(&text),
        }
    }
}
