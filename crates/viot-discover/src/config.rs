//! Configuration for the viot-discover scanner.

use std::path::PathBuf;

use serde::Deserialize;
use viot_core::types::{InstanceType, Location, Protocol};

use crate::error::{DiscoverError, Result};

/// Top-level scanner configuration.
///
/// Loaded from a YAML file (or any format the `config` crate understands)
/// with `VIOT__` environment overrides. `scanner.ip_range_file` and
/// `scanner.target_file` may move the zone and target lists into their own
/// files.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct DiscoverConfig {
    #[serde(default)]
    pub scanner: ScannerSettings,

    #[serde(default)]
    pub snmp: SnmpSettings,

    #[serde(default)]
    pub modbus: ModbusSettings,

    /// Cascade rules: an identified source target triggers a sweep for its
    /// linked targets on the same IP.
    #[serde(default)]
    pub dependencies: Vec<DependencyLink>,

    #[serde(default)]
    pub ip_ranges: Vec<IpRangeZone>,

    /// Device signatures, in matching priority order.
    #[serde(default)]
    pub targets: Vec<TargetConfig>,
}

/// Scan cadence, concurrency bounds, and file locations.
#[derive(Debug, Clone, Deserialize)]
pub struct ScannerSettings {
    /// Default per-room scan interval in seconds.
    #[serde(default = "default_scan_interval")]
    pub scan_interval_secs: u64,

    /// How often the daemon checks which rooms are due.
    #[serde(default = "default_tick")]
    pub tick_secs: u64,

    /// Maximum rooms swept concurrently.
    #[serde(default = "default_max_rooms")]
    pub max_concurrent_rooms: usize,

    /// Maximum per-IP identifications running at once, across all rooms.
    #[serde(default = "default_max_ips")]
    pub max_concurrent_ips: usize,

    #[serde(default = "default_fping_path")]
    pub fping_path: String,

    /// Per-target fping timeout in milliseconds.
    #[serde(default = "default_fping_timeout")]
    pub fping_timeout_ms: u64,

    #[serde(default = "default_fping_retries")]
    pub fping_retries: u32,

    /// Budget for one room's liveness sweep.
    #[serde(default = "default_room_timeout")]
    pub room_timeout_secs: u64,

    /// Budget for one IP's SNMP + Modbus identification.
    #[serde(default = "default_ip_timeout")]
    pub ip_timeout_secs: u64,

    /// Drop alive hosts that fall inside the covering CIDR but outside the
    /// configured start/end range.
    #[serde(default = "default_true")]
    pub strict_range: bool,

    /// Also write SNMP hosts that matched no signature to the device list.
    #[serde(default)]
    pub persist_unknown: bool,

    /// Directory holding pending and registry CSV files.
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// Directory for per-cycle JSON reports.
    #[serde(default = "default_report_dir")]
    pub report_dir: PathBuf,

    /// Kernel neighbor table used for MAC lookups.
    #[serde(default = "default_arp_table")]
    pub arp_table: PathBuf,

    /// Optional separate file holding an `ip_ranges:` list.
    #[serde(default)]
    pub ip_range_file: Option<String>,

    /// Optional separate file holding a `targets:` list.
    #[serde(default)]
    pub target_file: Option<String>,
}

/// SNMP connection defaults.
#[derive(Debug, Clone, Deserialize)]
pub struct SnmpSettings {
    #[serde(default = "default_snmp_port")]
    pub port: u16,

    #[serde(default = "default_community")]
    pub community: String,

    #[serde(default)]
    pub version: SnmpVersion,

    #[serde(default = "default_snmp_timeout")]
    pub timeout_secs: u64,

    #[serde(default = "default_snmp_retries")]
    pub retries: u32,

    /// Retry the reachability probe with v1 when v2c gets no answer.
    #[serde(default = "default_true")]
    pub version_fallback: bool,
}

/// SNMP protocol version. Only community-based versions are supported.
#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq, Eq)]
#[serde(try_from = "u8")]
pub enum SnmpVersion {
    V1,
    #[default]
    V2c,
}

impl SnmpVersion {
    /// Value of the `version` field on the wire.
    pub fn wire_value(&self) -> i64 {
        match self {
            Self::V1 => 0,
            Self::V2c => 1,
        }
    }
}

impl TryFrom<u8> for SnmpVersion {
    type Error = String;

    fn try_from(value: u8) -> std::result::Result<Self, Self::Error> {
        match value {
            1 => Ok(Self::V1),
            2 => Ok(Self::V2c),
            other => Err(format!("unsupported SNMP version {other} (use 1 or 2)")),
        }
    }
}

/// Modbus sweep settings.
#[derive(Debug, Clone, Deserialize)]
pub struct ModbusSettings {
    #[serde(default = "default_modbus_ports", alias = "port")]
    pub ports: Vec<u16>,

    #[serde(default = "default_slave_ids", alias = "slave_id")]
    pub slave_ids: Vec<u8>,

    #[serde(default)]
    pub mode: ModbusMode,

    #[serde(default = "default_modbus_timeout")]
    pub timeout_secs: u64,

    /// Extra connection attempts per (port, slave) pair.
    #[serde(default, alias = "retry")]
    pub retries: u32,
}

/// Modbus transport framing.
#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq, Eq)]
pub enum ModbusMode {
    #[default]
    #[serde(rename = "tcp", alias = "TCP")]
    Tcp,
    #[serde(rename = "rtu_over_tcp", alias = "RTUOverTCP")]
    RtuOverTcp,
}

/// One configured room address range.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct IpRangeZone {
    #[serde(default)]
    pub factory: String,
    #[serde(default)]
    pub phase: String,
    #[serde(default)]
    pub datacenter: String,
    pub room: String,
    #[serde(alias = "start_ip")]
    pub start: String,
    #[serde(alias = "end_ip")]
    pub end: String,
}

impl IpRangeZone {
    pub fn location(&self) -> Location {
        Location {
            factory: self.factory.clone(),
            phase: self.phase.clone(),
            datacenter: self.datacenter.clone(),
            room: self.room.clone(),
        }
    }
}

/// A device signature as written in configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct TargetConfig {
    pub name: String,
    pub protocol: Protocol,
    #[serde(default)]
    pub manufacturer: String,
    #[serde(default)]
    pub model: String,
    #[serde(default)]
    pub instance_type: InstanceType,
    #[serde(default)]
    pub snmp: Option<SnmpMatchConfig>,
    #[serde(default)]
    pub modbus: Option<ModbusMatchConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SnmpMatchConfig {
    pub match_value_contains: String,
    pub match_oid: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ModbusMatchConfig {
    pub match_value_contains: String,
    pub match_register_type: RegisterKind,
    pub match_address: u16,
    pub match_length: u16,
}

/// Modbus register table.
#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum RegisterKind {
    Input,
    Holding,
}

/// Declares that identifying `source_target` justifies probing the same IP
/// over `protocol` for the linked targets.
#[derive(Debug, Clone, Deserialize)]
pub struct DependencyLink {
    #[serde(default = "default_link_protocol")]
    pub protocol: Protocol,
    pub source_target: String,
    #[serde(alias = "linked_target")]
    pub linked_targets: Vec<String>,
}

fn default_scan_interval() -> u64 {
    300
}

fn default_tick() -> u64 {
    30
}

fn default_max_rooms() -> usize {
    4
}

fn default_max_ips() -> usize {
    32
}

fn default_fping_path() -> String {
    "fping".to_string()
}

fn default_fping_timeout() -> u64 {
    500
}

fn default_fping_retries() -> u32 {
    2
}

fn default_room_timeout() -> u64 {
    120
}

fn default_ip_timeout() -> u64 {
    60
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("./data")
}

fn default_report_dir() -> PathBuf {
    PathBuf::from("./reports")
}

fn default_arp_table() -> PathBuf {
    PathBuf::from("/proc/net/arp")
}

fn default_snmp_port() -> u16 {
    161
}

fn default_community() -> String {
    "public".to_string()
}

fn default_snmp_timeout() -> u64 {
    2
}

fn default_snmp_retries() -> u32 {
    1
}

fn default_modbus_ports() -> Vec<u16> {
    vec![502]
}

fn default_slave_ids() -> Vec<u8> {
    vec![1]
}

fn default_modbus_timeout() -> u64 {
    2
}

fn default_link_protocol() -> Protocol {
    Protocol::Modbus
}

fn default_true() -> bool {
    true
}

impl Default for ScannerSettings {
    fn default() -> Self {
        Self {
            scan_interval_secs: default_scan_interval(),
            tick_secs: default_tick(),
            max_concurrent_rooms: default_max_rooms(),
            max_concurrent_ips: default_max_ips(),
            fping_path: default_fping_path(),
            fping_timeout_ms: default_fping_timeout(),
            fping_retries: default_fping_retries(),
            room_timeout_secs: default_room_timeout(),
            ip_timeout_secs: default_ip_timeout(),
            strict_range: true,
            persist_unknown: false,
            data_dir: default_data_dir(),
            report_dir: default_report_dir(),
            arp_table: default_arp_table(),
            ip_range_file: None,
            target_file: None,
        }
    }
}

impl Default for SnmpSettings {
    fn default() -> Self {
        Self {
            port: default_snmp_port(),
            community: default_community(),
            version: SnmpVersion::default(),
            timeout_secs: default_snmp_timeout(),
            retries: default_snmp_retries(),
            version_fallback: true,
        }
    }
}

impl Default for ModbusSettings {
    fn default() -> Self {
        Self {
            ports: default_modbus_ports(),
            slave_ids: default_slave_ids(),
            mode: ModbusMode::default(),
            timeout_secs: default_modbus_timeout(),
            retries: 0,
        }
    }
}

#[derive(Deserialize)]
struct ZoneFile {
    #[serde(default)]
    ip_ranges: Vec<IpRangeZone>,
}

#[derive(Deserialize)]
struct TargetFile {
    #[serde(default)]
    targets: Vec<TargetConfig>,
}

impl DiscoverConfig {
    /// Load the main file plus environment overrides, then append zones and
    /// targets from their optional side files.
    pub fn load(path: &str) -> Result<Self> {
        let cfg = config::Config::builder()
            .add_source(config::File::with_name(path))
            .add_source(
                config::Environment::with_prefix("VIOT")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let mut loaded: DiscoverConfig = cfg.try_deserialize()?;

        if let Some(zone_path) = loaded.scanner.ip_range_file.clone() {
            let zones: ZoneFile = read_side_file(&zone_path)?;
            loaded.ip_ranges.extend(zones.ip_ranges);
        }
        if let Some(target_path) = loaded.scanner.target_file.clone() {
            let targets: TargetFile = read_side_file(&target_path)?;
            loaded.targets.extend(targets.targets);
        }

        loaded.validate()?;
        Ok(loaded)
    }

    /// Reject settings the engine cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.scanner.max_concurrent_rooms == 0 || self.scanner.max_concurrent_ips == 0 {
            return Err(DiscoverError::Config(
                "max_concurrent_rooms and max_concurrent_ips must be at least 1".to_string(),
            ));
        }
        if self.scanner.scan_interval_secs == 0 || self.scanner.tick_secs == 0 {
            return Err(DiscoverError::Config(
                "scan_interval_secs and tick_secs must be at least 1".to_string(),
            ));
        }
        if self.modbus.ports.is_empty() || self.modbus.slave_ids.is_empty() {
            return Err(DiscoverError::Config(
                "modbus.ports and modbus.slave_ids must not be empty".to_string(),
            ));
        }
        for zone in &self.ip_ranges {
            if zone.room.trim().is_empty() {
                return Err(DiscoverError::Config(format!(
                    "ip range {}-{} has no room name",
                    zone.start, zone.end
                )));
            }
        }
        Ok(())
    }
}

fn read_side_file<T: serde::de::DeserializeOwned>(path: &str) -> Result<T> {
    let cfg = config::Config::builder()
        .add_source(config::File::with_name(path))
        .build()?;
    Ok(cfg.try_deserialize()?)
}
