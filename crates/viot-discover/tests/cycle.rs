//! End-to-end discovery cycles against in-memory transports.

use std::fs;
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use ipnet::Ipv4Net;
use viot_core::types::{InstanceType, Protocol};

use viot_discover::arp::MacResolver;
use viot_discover::config::{DiscoverConfig, IpRangeZone, SnmpMatchConfig, TargetConfig};
use viot_discover::library::OID_SYS_DESCR;
use viot_discover::liveness::LivenessProbe;
use viot_discover::modbus::{ModbusClient, ModbusError, ModbusLink};
use viot_discover::persist::PENDING_PDU_FILE;
use viot_discover::scheduler::{ScanScheduler, Transports};
use viot_discover::session::{ModbusConn, SnmpConn};
use viot_discover::snmp::ber::SnmpValue;
use viot_discover::snmp::{SnmpClient, SnmpError};

const PDU_IP: Ipv4Addr = Ipv4Addr::new(10, 1, 1, 1);
const SILENT_IP: Ipv4Addr = Ipv4Addr::new(10, 1, 1, 2);

struct StaticProbe;

#[async_trait]
impl LivenessProbe for StaticProbe {
    async fn sweep(&self, _cidr: Ipv4Net) -> viot_discover::error::Result<Vec<Ipv4Addr>> {
        Ok(vec![PDU_IP, SILENT_IP])
    }
}

/// Only `PDU_IP` runs an agent, and it only knows sysDescr.
struct OneAgent;

#[async_trait]
impl SnmpClient for OneAgent {
    async fn get(
        &self,
        conn: &SnmpConn,
        oids: &[String],
    ) -> Result<Vec<(String, SnmpValue)>, SnmpError> {
        if conn.ip != PDU_IP {
            return Err(SnmpError::Timeout {
                ip: conn.ip,
                attempts: 1,
            });
        }
        Ok(oids
            .iter()
            .map(|oid| {
                let value = if oid == OID_SYS_DESCR {
                    SnmpValue::OctetString(b"Delta PDUE428 rev 2".to_vec())
                } else {
                    SnmpValue::NoSuchObject
                };
                (oid.clone(), value)
            })
            .collect())
    }
}

struct NoGateway;

#[async_trait]
impl ModbusClient for NoGateway {
    async fn connect(&self, conn: &ModbusConn) -> Result<Box<dyn ModbusLink>, ModbusError> {
        Err(ModbusError::Timeout {
            ip: conn.ip,
            port: conn.port,
        })
    }
}

struct NoNeighbors;

#[async_trait]
impl MacResolver for NoNeighbors {
    async fn resolve(&self, _ip: Ipv4Addr) -> std::io::Result<Option<String>> {
        Ok(None)
    }
}

fn config(root: &std::path::Path) -> DiscoverConfig {
    let mut config = DiscoverConfig::default();
    config.scanner.data_dir = root.join("data");
    config.scanner.report_dir = root.join("reports");
    config.scanner.ip_timeout_secs = 5;
    config.ip_ranges = vec![IpRangeZone {
        factory: "F1".to_string(),
        phase: "P1".to_string(),
        datacenter: "DC1".to_string(),
        room: "R101".to_string(),
        start: "10.1.1.1".to_string(),
        end: "10.1.1.2".to_string(),
    }];
    config.targets = vec![TargetConfig {
        name: "PDU-DELTA-PDUE428".to_string(),
        protocol: Protocol::Snmp,
        manufacturer: "Delta".to_string(),
        model: "PDUE428".to_string(),
        instance_type: InstanceType::Pdu,
        snmp: Some(SnmpMatchConfig {
            match_value_contains: "PDUE428".to_string(),
            match_oid: OID_SYS_DESCR.to_string(),
        }),
        modbus: None,
    }];
    config
}

fn scheduler(root: &std::path::Path) -> ScanScheduler {
    let transports = Transports {
        prober: Arc::new(StaticProbe),
        snmp: Arc::new(OneAgent),
        modbus: Arc::new(NoGateway),
        mac: Arc::new(NoNeighbors),
    };
    ScanScheduler::new(config(root), transports).unwrap()
}

#[tokio::test]
async fn cycle_writes_new_devices_once() {
    let dir = tempfile::tempdir().unwrap();
    let scheduler = scheduler(dir.path());

    let first = scheduler.run_cycle(&[]).await.unwrap();

    assert_eq!(first.rooms, vec!["R101"]);
    assert_eq!(first.rooms_scanned, 1);
    assert_eq!(first.alive, 2);
    assert_eq!(first.identified, 1);
    assert_eq!(first.unknown, 0);
    assert_eq!(first.rows_written, 1);
    assert_eq!(first.tallies[0].alive, 2);
    assert_eq!(first.tallies[0].identified, 1);
    assert!(first.errors.is_empty(), "{:?}", first.errors);

    let pending = fs::read_to_string(dir.path().join("data").join(PENDING_PDU_FILE)).unwrap();
    let lines: Vec<&str> = pending.lines().collect();
    assert_eq!(lines.len(), 2);
    assert!(lines[0].starts_with("ip_key,model,ip,protocol"));
    assert!(lines[1].starts_with("10.1.1.1:161,PDUE428,10.1.1.1,snmp,"));

    let second = scheduler.run_cycle(&[]).await.unwrap();
    assert_eq!(second.rows_written, 0);
    assert_eq!(second.duplicates, 1);
    assert_ne!(second.cycle_id, first.cycle_id);

    let pending = fs::read_to_string(dir.path().join("data").join(PENDING_PDU_FILE)).unwrap();
    assert_eq!(pending.lines().count(), 2);
    assert!(first.path_in(&dir.path().join("reports")).exists());
    assert!(second.path_in(&dir.path().join("reports")).exists());
}

#[tokio::test]
async fn room_filter_skips_other_rooms() {
    let dir = tempfile::tempdir().unwrap();
    let scheduler = scheduler(dir.path());

    let report = scheduler.run_cycle(&["R999".to_string()]).await.unwrap();

    assert!(report.rooms.is_empty());
    assert_eq!(report.rooms_scanned, 0);
    assert_eq!(report.rows_written, 0);
    assert!(!dir.path().join("data").join(PENDING_PDU_FILE).exists());
}

#[tokio::test]
async fn schedule_handle_accepts_temporary_intervals() {
    let dir = tempfile::tempdir().unwrap();
    let scheduler = scheduler(dir.path());
    let schedule = scheduler.schedule();
    let now = chrono::Utc::now();

    let mut guard = schedule.lock().unwrap();
    guard
        .set_temporary_interval("R101", Duration::from_secs(30), Duration::from_secs(600), now)
        .unwrap();
    assert_eq!(guard.effective_interval("R101", now), Duration::from_secs(30));
    assert!(guard
        .set_temporary_interval("R999", Duration::from_secs(30), Duration::from_secs(600), now)
        .is_err());
}
