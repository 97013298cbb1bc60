//! Per-IP identification.
//!
//! SNMP first; an identified cascade source then triggers a Modbus sweep of
//! the same address. Records are pushed into a [`ResultSink`] as they are
//! produced so a timed-out run still hands back what it found.

use std::net::Ipv4Addr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use thiserror::Error;
use tracing::{debug, warn};
use viot_core::types::{
    AliveHost, InstanceType, Protocol, ScanInstanceInfo, UNKNOWN_TARGET,
};

use crate::arp::MacResolver;
use crate::config::{ModbusSettings, SnmpSettings};
use crate::library::{SignatureLibrary, TargetSignature};
use crate::modbus::{self, ModbusClient, ModbusMatch};
use crate::session::{DetailFields, SnmpConn};
use crate::snmp::{self, SnmpClient, SnmpIdentification};

/// Per-IP failure. Partial results travel alongside in [`HostOutcome`].
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HostError {
    #[error("identification of {ip} timed out after {after:?}")]
    Timeout { ip: Ipv4Addr, after: Duration },

    #[error("identification of {ip} faulted: {reason}")]
    Fault { ip: Ipv4Addr, reason: String },
}

/// Records collected for one IP, plus the error that cut the run short.
#[derive(Debug, Clone)]
pub struct HostOutcome {
    pub ip: Ipv4Addr,
    pub records: Vec<ScanInstanceInfo>,
    pub error: Option<HostError>,
}

/// Shared append-only buffer for one identification run.
#[derive(Debug, Clone, Default)]
pub struct ResultSink {
    inner: Arc<Mutex<Vec<ScanInstanceInfo>>>,
}

impl ResultSink {
    pub fn push(&self, record: ScanInstanceInfo) {
        let mut guard = self
            .inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        guard.push(record);
    }

    /// Drain everything pushed so far.
    pub fn take(&self) -> Vec<ScanInstanceInfo> {
        let mut guard = self
            .inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        std::mem::take(&mut *guard)
    }
}

/// Runs SNMP identification and dependency cascades for single hosts.
#[derive(Clone)]
pub struct Identifier {
    library: Arc<SignatureLibrary>,
    snmp: Arc<dyn SnmpClient>,
    modbus: Arc<dyn ModbusClient>,
    mac: Arc<dyn MacResolver>,
    snmp_settings: SnmpSettings,
    modbus_settings: ModbusSettings,
}

impl Identifier {
    pub fn new(
        library: Arc<SignatureLibrary>,
        snmp: Arc<dyn SnmpClient>,
        modbus: Arc<dyn ModbusClient>,
        mac: Arc<dyn MacResolver>,
        snmp_settings: SnmpSettings,
        modbus_settings: ModbusSettings,
    ) -> Self {
        Self {
            library,
            snmp,
            modbus,
            mac,
            snmp_settings,
            modbus_settings,
        }
    }

    pub fn library(&self) -> &SignatureLibrary {
        &self.library
    }

    /// Identify `host`, pushing every record into `sink`.
    ///
    /// A host that does not answer SNMP yields nothing and is not an error.
    pub async fn identify(&self, host: &AliveHost, sink: &ResultSink) {
        let conn = SnmpConn {
            ip: host.ip,
            port: self.snmp_settings.port,
            community: self.snmp_settings.community.clone(),
            version: self.snmp_settings.version,
        };

        let found = match snmp::identify(
            self.snmp.as_ref(),
            &self.library,
            conn,
            self.snmp_settings.version_fallback,
        )
        .await
        {
            Ok(found) => found,
            Err(e) => {
                debug!(ip = %host.ip, error = %e, "No SNMP agent, skipping host");
                return;
            }
        };

        let mac = self.resolve_mac(host.ip).await;
        sink.push(snmp_record(host, &found, &mac));

        let Some(source) = found.target else {
            return;
        };
        let Some(linked) = self
            .library
            .dependencies()
            .linked(Protocol::Modbus, &source.name)
        else {
            return;
        };

        let candidates = self.library.modbus_candidates(linked);
        if candidates.is_empty() {
            warn!(
                ip = %host.ip,
                source = %source.name,
                "Cascade source has no Modbus candidates"
            );
            return;
        }

        let matches = modbus::sweep(
            self.modbus.as_ref(),
            host.ip,
            &self.modbus_settings,
            &candidates,
        )
        .await;

        if matches.is_empty() {
            warn!(
                ip = %host.ip,
                source = %source.name,
                candidates = candidates.len(),
                "Modbus cascade identified nothing"
            );
        }

        for found in &matches {
            sink.push(modbus_record(host, found, &mac));
        }
    }

    /// [`Identifier::identify`] raced against `limit`, with panics contained.
    ///
    /// On timeout the task is left to finish on its own; anything it pushes
    /// afterwards is discarded.
    pub async fn identify_bounded(&self, host: AliveHost, limit: Duration) -> HostOutcome {
        let sink = ResultSink::default();
        let ip = host.ip;

        let task = {
            let identifier = self.clone();
            let sink = sink.clone();
            tokio::spawn(async move { identifier.identify(&host, &sink).await })
        };

        let error = match tokio::time::timeout(limit, task).await {
            Ok(Ok(())) => None,
            Ok(Err(join_err)) => Some(HostError::Fault {
                ip,
                reason: join_failure(join_err),
            }),
            Err(_) => Some(HostError::Timeout { ip, after: limit }),
        };

        HostOutcome {
            ip,
            records: sink.take(),
            error,
        }
    }

    async fn resolve_mac(&self, ip: Ipv4Addr) -> String {
        match self.mac.resolve(ip).await {
            Ok(Some(mac)) => mac,
            Ok(None) => {
                debug!(ip = %ip, "No neighbor entry");
                String::new()
            }
            Err(e) => {
                warn!(ip = %ip, error = %e, "MAC lookup failed");
                String::new()
            }
        }
    }
}

pub(crate) fn join_failure(err: tokio::task::JoinError) -> String {
    if !err.is_panic() {
        return "task cancelled".to_string();
    }
    let payload = err.into_panic();
    if let Some(msg) = payload.downcast_ref::<&str>() {
        format!("panic: {msg}")
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        format!("panic: {msg}")
    } else {
        "panic".to_string()
    }
}

fn snmp_record(host: &AliveHost, found: &SnmpIdentification<'_>, mac: &str) -> ScanInstanceInfo {
    let mut record = base_record(host, found.target, &found.detail, mac);
    record.port = found.conn.port;
    record.protocol = Protocol::Snmp;
    record.assign_identity_key();
    record
}

fn modbus_record(host: &AliveHost, found: &ModbusMatch<'_>, mac: &str) -> ScanInstanceInfo {
    let mut record = base_record(host, Some(found.target), &found.detail, mac);
    record.port = found.conn.port;
    record.slave_id = Some(found.conn.slave_id);
    record.protocol = Protocol::Modbus;
    record.assign_identity_key();
    record
}

fn base_record(
    host: &AliveHost,
    target: Option<&TargetSignature>,
    detail: &DetailFields,
    mac: &str,
) -> ScanInstanceInfo {
    let (name, model, manufacturer, instance_type) = match target {
        Some(t) => (
            t.name.clone(),
            t.model.clone(),
            t.manufacturer.clone(),
            t.instance_type,
        ),
        None => (
            UNKNOWN_TARGET.to_string(),
            String::new(),
            String::new(),
            InstanceType::Unknown,
        ),
    };

    ScanInstanceInfo {
        target_name: name,
        ip_key: String::new(),
        ip: host.ip,
        port: 0,
        slave_id: None,
        protocol: Protocol::Snmp,
        // Reported model beats the configured one.
        model: if detail.model.is_empty() {
            model
        } else {
            detail.model.clone()
        },
        manufacturer,
        instance_type,
        version: detail.version.clone(),
        serial_number: detail.serial_number.clone(),
        mac_address: mac.to_string(),
        snmp_engine_id: detail.snmp_engine_id.clone(),
        sys_name: detail.sys_name.clone(),
        sys_descr: detail.sys_descr.clone(),
        uptime_secs: detail.uptime_secs,
        location: host.location.clone(),
        discovered_at: Utc::now(),
    }
}
