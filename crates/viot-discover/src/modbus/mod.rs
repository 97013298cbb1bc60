//! Modbus sweep: ports × slave ids, match-then-detail per pair.
//!
//! Transport sits behind [`ModbusClient`] / [`ModbusLink`];
//! [`tcp::TcpModbusClient`] is the production implementation. Every link
//! opened here is closed before the function that opened it returns.

pub mod frame;
pub mod tcp;

use std::net::Ipv4Addr;

use async_trait::async_trait;
use thiserror::Error;
use tracing::{debug, trace};

use crate::config::{ModbusSettings, RegisterKind};
use crate::library::{TargetProbe, TargetSignature};
use crate::session::{decode_registers, Decoded, DetailFields, ModbusConn, ModbusQuery, QueryKey};
use frame::FrameError;

#[derive(Error, Debug)]
pub enum ModbusError {
    #[error("connection error: {0}")]
    Io(#[from] std::io::Error),

    #[error("no response from {ip}:{port} within timeout")]
    Timeout { ip: Ipv4Addr, port: u16 },

    #[error("frame error: {0}")]
    Frame(#[from] FrameError),
}

impl ModbusError {
    /// A device exception means the pair is alive but the register is not
    /// served; everything else means nothing usable answers at the pair.
    pub fn is_exception(&self) -> bool {
        matches!(self, Self::Frame(FrameError::Exception { .. }))
    }
}

/// An open connection to one (ip, port, slave).
#[async_trait]
pub trait ModbusLink: Send {
    /// Read `quantity` registers; returns the raw big-endian register bytes.
    async fn read_registers(
        &mut self,
        kind: RegisterKind,
        address: u16,
        quantity: u16,
    ) -> Result<Vec<u8>, ModbusError>;

    async fn close(&mut self);
}

#[async_trait]
pub trait ModbusClient: Send + Sync {
    async fn connect(&self, conn: &ModbusConn) -> Result<Box<dyn ModbusLink>, ModbusError>;
}

/// A Modbus target identified at one (port, slave) pair.
#[derive(Debug, Clone)]
pub struct ModbusMatch<'a> {
    pub target: &'a TargetSignature,
    pub conn: ModbusConn,
    pub detail: DetailFields,
}

/// Sweep every configured (port, slave) pair on `ip` for `candidates`.
///
/// At most one target is reported per pair. Only the first candidate with a
/// Modbus rule is compared; later candidates never match on their own.
pub async fn sweep<'a>(
    client: &dyn ModbusClient,
    ip: Ipv4Addr,
    settings: &ModbusSettings,
    candidates: &[&'a TargetSignature],
) -> Vec<ModbusMatch<'a>> {
    let mut found = Vec::new();
    if candidates.is_empty() {
        return found;
    }

    for &port in &settings.ports {
        for &slave_id in &settings.slave_ids {
            let conn = ModbusConn {
                ip,
                port,
                mode: settings.mode,
                slave_id,
            };

            let Some(target) = match_pair(client, &conn, candidates, settings.retries).await else {
                continue;
            };

            let detail = match &target.probe {
                TargetProbe::Modbus { detail, .. } => fetch_detail(client, &conn, detail).await,
                TargetProbe::Snmp { .. } => DetailFields::default(),
            };

            debug!(
                ip = %ip,
                port,
                slave_id,
                target = %target.name,
                "Modbus device identified"
            );
            found.push(ModbusMatch {
                target,
                conn,
                detail,
            });
        }
    }

    found
}

async fn connect(
    client: &dyn ModbusClient,
    conn: &ModbusConn,
    retries: u32,
) -> Result<Box<dyn ModbusLink>, ModbusError> {
    let mut attempt = 0;
    loop {
        match client.connect(conn).await {
            Ok(link) => return Ok(link),
            Err(e) if attempt < retries => {
                trace!(ip = %conn.ip, port = conn.port, attempt, error = %e, "Modbus connect retry");
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

/// Open a match link on the pair, evaluate candidates, close the link.
async fn match_pair<'a>(
    client: &dyn ModbusClient,
    conn: &ModbusConn,
    candidates: &[&'a TargetSignature],
    retries: u32,
) -> Option<&'a TargetSignature> {
    let mut link = match connect(client, conn, retries).await {
        Ok(link) => link,
        Err(e) => {
            trace!(ip = %conn.ip, port = conn.port, slave_id = conn.slave_id, error = %e, "No Modbus endpoint");
            return None;
        }
    };

    let matched = match_on_link(link.as_mut(), conn, candidates).await;
    link.close().await;
    matched
}

async fn match_on_link<'a>(
    link: &mut dyn ModbusLink,
    conn: &ModbusConn,
    candidates: &[&'a TargetSignature],
) -> Option<&'a TargetSignature> {
    // Only the first eligible target's rule is read and compared.
    let (target, matcher) = candidates.iter().find_map(|t| match &t.probe {
        TargetProbe::Modbus { matcher, .. } => Some((*t, matcher)),
        TargetProbe::Snmp { .. } => None,
    })?;

    match link
        .read_registers(matcher.register, matcher.address, matcher.length)
        .await
    {
        Ok(bytes) => usable_text(matcher, &bytes)
            .filter(|text| target.matches(text))
            .map(|_| target),
        Err(e) if e.is_exception() => {
            trace!(ip = %conn.ip, target = %target.name, error = %e, "Match register not served");
            None
        }
        Err(e) => {
            trace!(ip = %conn.ip, port = conn.port, slave_id = conn.slave_id, error = %e, "Modbus pair silent");
            None
        }
    }
}

fn usable_text(query: &ModbusQuery, bytes: &[u8]) -> Option<String> {
    if bytes.iter().all(|b| *b == 0) {
        return None;
    }
    match decode_registers(query.kind, bytes) {
        Ok(Decoded::Text(text)) if !text.is_empty() => Some(text),
        _ => None,
    }
}

/// Read detail registers over a fresh link. Fields that cannot be read
/// stay empty; an I/O failure stops further reads.
pub async fn fetch_detail(
    client: &dyn ModbusClient,
    conn: &ModbusConn,
    queries: &[ModbusQuery],
) -> DetailFields {
    let mut fields = DetailFields::default();
    if queries.is_empty() {
        return fields;
    }

    let mut link = match client.connect(conn).await {
        Ok(link) => link,
        Err(e) => {
            debug!(ip = %conn.ip, port = conn.port, slave_id = conn.slave_id, error = %e, "Modbus detail connect failed");
            return fields;
        }
    };

    for query in queries {
        let QueryKey::Field(field) = query.key else {
            continue;
        };
        match link
            .read_registers(query.register, query.address, query.length)
            .await
        {
            Ok(bytes) => match decode_registers(query.kind, &bytes) {
                Ok(decoded) => fields.set(field, decoded),
                Err(e) => trace!(ip = %conn.ip, field = %field, error = %e, "Detail register skipped"),
            },
            Err(e) if e.is_exception() => {
                trace!(ip = %conn.ip, field = %field, error = %e, "Detail register not served");
            }
            Err(e) => {
                debug!(ip = %conn.ip, field = %field, error = %e, "Modbus detail read failed");
                break;
            }
        }
    }

    link.close().await;
    fields
}
