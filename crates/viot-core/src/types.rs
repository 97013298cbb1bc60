//! Core record types for identified devices.
//!
//! A [`ScanInstanceInfo`] is produced once per identified (ip, port[, slave])
//! tuple by the identification engine and consumed by persistence.

use std::fmt;
use std::net::Ipv4Addr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Placeholder written for attributes the device did not report.
pub const UNKNOWN_VALUE: &str = "unknown";

/// Reserved target name for live SNMP hosts that matched no signature.
pub const UNKNOWN_TARGET: &str = "unknown";

// ── Classification ────────────────────────────────────────────────

/// Wire protocol a device was identified over.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Snmp,
    Modbus,
}

impl Protocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Snmp => "snmp",
            Self::Modbus => "modbus",
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Device category used to route records to the PDU or generic device list.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum InstanceType {
    Pdu,
    Switch,
    Ap,
    Gateway,
    #[default]
    #[serde(other)]
    Unknown,
}

impl InstanceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pdu => "pdu",
            Self::Switch => "switch",
            Self::Ap => "ap",
            Self::Gateway => "gateway",
            Self::Unknown => "unknown",
        }
    }

    pub fn is_pdu(&self) -> bool {
        matches!(self, Self::Pdu)
    }
}

impl fmt::Display for InstanceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ── Provenance ────────────────────────────────────────────────────

/// Physical location of an address range.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct Location {
    pub factory: String,
    pub phase: String,
    pub datacenter: String,
    pub room: String,
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}/{}/{}",
            self.factory, self.phase, self.datacenter, self.room
        )
    }
}

/// A responsive address together with the room it was found in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AliveHost {
    pub ip: Ipv4Addr,
    pub location: Location,
}

// ── Identified device ─────────────────────────────────────────────

/// One identified device instance.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ScanInstanceInfo {
    pub target_name: String,
    /// Identity key; empty until [`ScanInstanceInfo::assign_identity_key`] runs.
    #[serde(default)]
    pub ip_key: String,
    pub ip: Ipv4Addr,
    pub port: u16,
    pub slave_id: Option<u8>,
    pub protocol: Protocol,
    pub model: String,
    pub manufacturer: String,
    pub instance_type: InstanceType,
    pub version: String,
    pub serial_number: String,
    pub mac_address: String,
    pub snmp_engine_id: String,
    pub sys_name: String,
    pub sys_descr: String,
    pub uptime_secs: i64,
    pub location: Location,
    pub discovered_at: DateTime<Utc>,
}

impl ScanInstanceInfo {
    /// Deterministic identity: `ip:port` for SNMP, `ip:port:slave` for Modbus.
    pub fn identity_key(&self) -> String {
        match (self.protocol, self.slave_id) {
            (Protocol::Modbus, Some(slave)) => format!("{}:{}:{}", self.ip, self.port, slave),
            (Protocol::Modbus, None) => format!("{}:{}:0", self.ip, self.port),
            (Protocol::Snmp, _) => format!("{}:{}", self.ip, self.port),
        }
    }

    pub fn assign_identity_key(&mut self) {
        self.ip_key = self.identity_key();
    }

    /// True for live hosts that answered SNMP but matched no signature.
    pub fn is_unknown(&self) -> bool {
        self.target_name == UNKNOWN_TARGET
    }
}

/// Replace an empty attribute with [`UNKNOWN_VALUE`].
pub fn or_unknown(value: &str) -> &str {
    if value.trim().is_empty() {
        UNKNOWN_VALUE
    } else {
        value
    }
}
