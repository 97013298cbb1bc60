//! SNMP identification: reachability, match phase, target selection, and
//! detail fetch.
//!
//! Transport sits behind [`SnmpClient`]; [`udp::UdpSnmpClient`] is the
//! production implementation.

pub mod ber;
pub mod udp;

use std::collections::HashMap;
use std::net::Ipv4Addr;

use async_trait::async_trait;
use thiserror::Error;
use tracing::{debug, trace};

use crate::config::SnmpVersion;
use crate::library::{SignatureLibrary, TargetProbe, TargetSignature, OID_SYS_DESCR};
use crate::session::{decode_snmp, Decoded, DetailFields, QueryKey, SnmpConn, SnmpQuery};
use ber::SnmpValue;

#[derive(Error, Debug)]
pub enum SnmpError {
    #[error("no response from {ip} after {attempts} attempt(s)")]
    Timeout { ip: Ipv4Addr, attempts: u32 },

    #[error("agent returned error status {status} at index {index}")]
    ErrorStatus { status: i64, index: i64 },

    #[error("codec error: {0}")]
    Codec(#[from] ber::BerError),

    #[error("socket error: {0}")]
    Io(#[from] std::io::Error),
}

/// Issues SNMP GET requests.
#[async_trait]
pub trait SnmpClient: Send + Sync {
    /// GET every OID in one request. Returns the varbinds in response order.
    async fn get(
        &self,
        conn: &SnmpConn,
        oids: &[String],
    ) -> Result<Vec<(String, SnmpValue)>, SnmpError>;
}

/// Outcome of SNMP identification for one host.
#[derive(Debug, Clone)]
pub struct SnmpIdentification<'a> {
    /// `None` when the host answered but matched no signature.
    pub target: Option<&'a TargetSignature>,
    /// Connection that worked, after version negotiation.
    pub conn: SnmpConn,
    pub detail: DetailFields,
}

/// Identify the SNMP agent behind `conn`.
///
/// Errors only when the host does not answer SNMP at all.
pub async fn identify<'a>(
    client: &dyn SnmpClient,
    library: &'a SignatureLibrary,
    conn: SnmpConn,
    version_fallback: bool,
) -> Result<SnmpIdentification<'a>, SnmpError> {
    let conn = negotiate(client, conn, version_fallback).await?;

    let candidates = match_candidates(client, &conn, library).await;
    let target = select_target(library, &candidates);

    let detail_queries: &[SnmpQuery] = match target.map(|t| &t.probe) {
        Some(TargetProbe::Snmp { detail, .. }) => detail.as_slice(),
        Some(TargetProbe::Modbus { .. }) => &[],
        None => library.unknown_detail(),
    };
    let detail = fetch_detail(client, &conn, detail_queries).await;

    debug!(
        ip = %conn.ip,
        target = target.map(|t| t.name.as_str()).unwrap_or("unknown"),
        "SNMP identification complete"
    );

    Ok(SnmpIdentification {
        target,
        conn,
        detail,
    })
}

/// Probe sysDescr with the configured version, falling back to v1.
pub async fn negotiate(
    client: &dyn SnmpClient,
    conn: SnmpConn,
    version_fallback: bool,
) -> Result<SnmpConn, SnmpError> {
    let probe = [OID_SYS_DESCR.to_string()];
    match client.get(&conn, &probe).await {
        Ok(_) => Ok(conn),
        Err(e) if version_fallback && conn.version == SnmpVersion::V2c => {
            trace!(ip = %conn.ip, error = %e, "v2c probe failed, retrying with v1");
            let v1 = SnmpConn {
                version: SnmpVersion::V1,
                ..conn
            };
            client.get(&v1, &probe).await?;
            Ok(v1)
        }
        Err(e) => Err(e),
    }
}

/// One candidate string per SNMP target, in library order.
///
/// Failed reads and values without any alphanumeric character become "".
/// Targets sharing a match OID share one read.
pub async fn match_candidates(
    client: &dyn SnmpClient,
    conn: &SnmpConn,
    library: &SignatureLibrary,
) -> Vec<String> {
    let mut reads: HashMap<String, String> = HashMap::new();
    let mut candidates = Vec::new();

    for target in library.snmp_targets() {
        let TargetProbe::Snmp { matcher, .. } = &target.probe else {
            continue;
        };

        if let Some(cached) = reads.get(&matcher.oid) {
            candidates.push(cached.clone());
            continue;
        }

        let value = read_text(client, conn, matcher).await;
        reads.insert(matcher.oid.clone(), value.clone());
        candidates.push(value);
    }

    candidates
}

async fn read_text(client: &dyn SnmpClient, conn: &SnmpConn, query: &SnmpQuery) -> String {
    let binds = match client.get(conn, std::slice::from_ref(&query.oid)).await {
        Ok(binds) => binds,
        Err(e) => {
            trace!(ip = %conn.ip, oid = %query.oid, error = %e, "Match read failed");
            return String::new();
        }
    };

    let Some((_, value)) = binds.first() else {
        return String::new();
    };

    match decode_snmp(query.kind, value) {
        Ok(Decoded::Text(text)) if text.chars().any(char::is_alphanumeric) => text,
        Ok(_) => String::new(),
        Err(e) => {
            trace!(ip = %conn.ip, oid = %query.oid, error = %e, "Match value not usable");
            String::new()
        }
    }
}

/// First non-empty candidate containing any signature decides; within it the
/// first target in library order wins.
pub fn select_target<'a>(
    library: &'a SignatureLibrary,
    candidates: &[String],
) -> Option<&'a TargetSignature> {
    candidates
        .iter()
        .filter(|c| !c.is_empty())
        .find_map(|candidate| library.snmp_targets().find(|t| t.matches(candidate)))
}

/// Fetch detail fields in one GET, or per OID when the agent rejects the
/// batch. Fields that fail to read or decode stay empty.
pub async fn fetch_detail(
    client: &dyn SnmpClient,
    conn: &SnmpConn,
    queries: &[SnmpQuery],
) -> DetailFields {
    let mut fields = DetailFields::default();
    if queries.is_empty() {
        return fields;
    }

    let oids: Vec<String> = queries.iter().map(|q| q.oid.clone()).collect();
    let values: HashMap<String, SnmpValue> = match client.get(conn, &oids).await {
        Ok(binds) => index_binds(binds),
        Err(SnmpError::ErrorStatus { status, index }) => {
            debug!(ip = %conn.ip, status, index, "Batch detail GET rejected, fetching per OID");
            let mut collected = HashMap::new();
            for oid in &oids {
                match client.get(conn, std::slice::from_ref(oid)).await {
                    Ok(binds) => collected.extend(index_binds(binds)),
                    Err(e) => trace!(ip = %conn.ip, oid = %oid, error = %e, "Detail OID failed"),
                }
            }
            collected
        }
        Err(e) => {
            debug!(ip = %conn.ip, error = %e, "Detail GET failed");
            return fields;
        }
    };

    for query in queries {
        let QueryKey::Field(field) = query.key else {
            continue;
        };
        let Some(value) = values.get(normalize_oid(&query.oid)) else {
            continue;
        };
        match decode_snmp(query.kind, value) {
            Ok(decoded) => fields.set(field, decoded),
            Err(e) => trace!(ip = %conn.ip, field = %field, error = %e, "Detail value skipped"),
        }
    }

    fields
}

fn index_binds(binds: Vec<(String, SnmpValue)>) -> HashMap<String, SnmpValue> {
    binds
        .into_iter()
        .map(|(oid, value)| (normalize_oid(&oid).to_string(), value))
        .collect()
}

fn normalize_oid(oid: &str) -> &str {
    oid.trim().trim_start_matches('.')
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::library::tests::snmp_target;
    use crate::library::{OID_SYS_NAME, OID_SYS_UPTIME};
    use crate::session::{Field, ValueKind};
    use std::sync::Mutex;

    /// In-memory agent keyed by OID.
    #[derive(Default)]
    pub(crate) struct FakeSnmp {
        pub values: HashMap<String, SnmpValue>,
        pub v2c_silent: bool,
        pub reject_batches: bool,
        pub silent: bool,
        pub requests: Mutex<Vec<(SnmpVersion, Vec<String>)>>,
    }

    impl FakeSnmp {
        pub(crate) fn with(values: &[(&str, SnmpValue)]) -> Self {
            Self {
                values: values
                    .iter()
                    .map(|(oid, v)| (oid.to_string(), v.clone()))
                    .collect(),
                ..Self::default()
            }
        }

        fn request_count(&self) -> usize {
            self.requests.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl SnmpClient for FakeSnmp {
        async fn get(
            &self,
            conn: &SnmpConn,
            oids: &[String],
        ) -> Result<Vec<(String, SnmpValue)>, SnmpError> {
            self.requests
                .lock()
                .unwrap()
                .push((conn.version, oids.to_vec()));

            if self.silent || (self.v2c_silent && conn.version == SnmpVersion::V2c) {
                return Err(SnmpError::Timeout {
                    ip: conn.ip,
                    attempts: 1,
                });
            }
            if self.reject_batches && oids.len() > 1 {
                return Err(SnmpError::ErrorStatus {
                    status: 2,
                    index: 1,
                });
            }

            Ok(oids
                .iter()
                .map(|oid| {
                    let value = self
                        .values
                        .get(oid)
                        .cloned()
                        .unwrap_or(SnmpValue::NoSuchObject);
                    (oid.clone(), value)
                })
                .collect())
        }
    }

    pub(crate) fn conn() -> SnmpConn {
        SnmpConn {
            ip: Ipv4Addr::new(10, 1, 1, 1),
            port: 161,
            community: "public".to_string(),
            version: SnmpVersion::V2c,
        }
    }

    fn text(s: &str) -> SnmpValue {
        SnmpValue::OctetString(s.as_bytes().to_vec())
    }

    #[test]
    fn first_signature_in_library_order_wins() {
        let lib = SignatureLibrary::build(
            &[snmp_target("PDU-A", "A", "PDU"), snmp_target("PDU-B", "B", "PDUX")],
            &[],
        )
        .unwrap();
        let candidates = vec!["PDUX-1000".to_string(), "PDUX-1000".to_string()];
        assert_eq!(select_target(&lib, &candidates).unwrap().name, "PDU-A");

        let reordered = SignatureLibrary::build(
            &[snmp_target("PDU-B", "B", "PDUX"), snmp_target("PDU-A", "A", "PDU")],
            &[],
        )
        .unwrap();
        assert_eq!(select_target(&reordered, &candidates).unwrap().name, "PDU-B");
    }

    #[test]
    fn no_matching_candidate_selects_nothing() {
        let lib = SignatureLibrary::build(&[snmp_target("PDU-A", "A", "PDUE428")], &[]).unwrap();
        assert!(select_target(&lib, &["".to_string(), "Linux host".to_string()]).is_none());
    }

    #[tokio::test]
    async fn identify_matches_and_fetches_detail() {
        let lib = SignatureLibrary::build(
            &[
                snmp_target("PDU-VERTIV-6PS56", "Vertiv", "6PS56"),
                snmp_target("PDU-DELTA-PDUE428", "Delta", "PDUE428"),
            ],
            &[],
        )
        .unwrap();
        let fake = FakeSnmp::with(&[
            (OID_SYS_DESCR, text("Delta PDUE428 rack PDU")),
            ("1.3.6.1.4.1.2254.2.32.1.6.1.3.1", text("PDUE428")),
            ("1.3.6.1.4.1.2254.2.32.1.6.1.4.1", text("SN-0042")),
            ("1.3.6.1.4.1.2254.2.32.1.4.0", text("V1.07")),
            (OID_SYS_UPTIME, SnmpValue::TimeTicks(360_000)),
        ]);

        let found = identify(&fake, &lib, conn(), true).await.unwrap();
        assert_eq!(found.target.unwrap().name, "PDU-DELTA-PDUE428");
        assert_eq!(found.detail.model, "PDUE428");
        assert_eq!(found.detail.serial_number, "SN-0042");
        assert_eq!(found.detail.version, "V1.07");
        assert_eq!(found.detail.uptime_secs, 3_600);
        assert_eq!(found.conn.version, SnmpVersion::V2c);
    }

    #[tokio::test]
    async fn unmatched_host_gets_unknown_detail() {
        let lib = SignatureLibrary::build(&[snmp_target("PDU-A", "A", "PDUE428")], &[]).unwrap();
        let fake = FakeSnmp::with(&[
            (OID_SYS_DESCR, text("Linux build-host 5.15")),
            (OID_SYS_NAME, text("build-host")),
            (OID_SYS_UPTIME, text("(2 days)")),
        ]);

        let found = identify(&fake, &lib, conn(), true).await.unwrap();
        assert!(found.target.is_none());
        assert_eq!(found.detail.sys_name, "build-host");
        assert_eq!(found.detail.sys_descr, "Linux build-host 5.15");
        assert_eq!(found.detail.uptime_secs, 172_800);
    }

    #[tokio::test]
    async fn v2c_silence_falls_back_to_v1() {
        let lib = SignatureLibrary::build(&[snmp_target("PDU-A", "A", "PDUE428")], &[]).unwrap();
        let fake = FakeSnmp {
            v2c_silent: true,
            ..FakeSnmp::with(&[(OID_SYS_DESCR, text("PDUE428"))])
        };

        let found = identify(&fake, &lib, conn(), true).await.unwrap();
        assert_eq!(found.conn.version, SnmpVersion::V1);
        assert_eq!(found.target.unwrap().name, "PDU-A");

        let err = identify(&fake, &lib, conn(), false).await.unwrap_err();
        assert!(matches!(err, SnmpError::Timeout { .. }));
    }

    #[tokio::test]
    async fn silent_host_is_unreachable() {
        let lib = SignatureLibrary::build(&[snmp_target("PDU-A", "A", "PDUE428")], &[]).unwrap();
        let fake = FakeSnmp {
            silent: true,
            ..FakeSnmp::default()
        };
        assert!(identify(&fake, &lib, conn(), true).await.is_err());
    }

    #[tokio::test]
    async fn shared_match_oid_is_read_once() {
        let lib = SignatureLibrary::build(
            &[snmp_target("PDU-A", "A", "AAA"), snmp_target("PDU-B", "B", "BBB")],
            &[],
        )
        .unwrap();
        let fake = FakeSnmp::with(&[(OID_SYS_DESCR, text("--- ..."))]);

        let candidates = match_candidates(&fake, &conn(), &lib).await;
        assert_eq!(candidates, vec![String::new(), String::new()]);
        assert_eq!(fake.request_count(), 1);
    }

    #[tokio::test]
    async fn rejected_batch_falls_back_to_single_gets() {
        let fake = FakeSnmp {
            reject_batches: true,
            ..FakeSnmp::with(&[
                (OID_SYS_NAME, text("sw-core-1")),
                (OID_SYS_UPTIME, SnmpValue::Integer(5)),
            ])
        };
        let queries = vec![
            SnmpQuery::field(Field::SysName, OID_SYS_NAME, ValueKind::Text),
            SnmpQuery::field(Field::Uptime, OID_SYS_UPTIME, ValueKind::Uptime),
        ];

        let fields = fetch_detail(&fake, &conn(), &queries).await;
        assert_eq!(fields.sys_name, "sw-core-1");
        // Integer is not a valid uptime encoding.
        assert_eq!(fields.uptime_secs, 0);
        assert_eq!(fake.request_count(), 3);
    }
}
