//! Target signature library.
//!
//! Built once from configuration. Each target carries its match query, the
//! substring that identifies it, and the detail queries of its model family.
//! Library order is configuration order and decides which target wins when
//! several signatures are present in one value.

use std::collections::{HashMap, HashSet};

use viot_core::types::{InstanceType, Protocol, UNKNOWN_TARGET};

use crate::config::{DependencyLink, DiscoverConfig, RegisterKind, TargetConfig};
use crate::error::{DiscoverError, Result};
use crate::session::{Field, ModbusQuery, QueryKey, SnmpQuery, ValueKind};
use crate::snmp::ber;

pub const OID_SYS_DESCR: &str = "1.3.6.1.2.1.1.1.0";
pub const OID_SYS_UPTIME: &str = "1.3.6.1.2.1.1.3.0";
pub const OID_SYS_NAME: &str = "1.3.6.1.2.1.1.5.0";
pub const OID_ENGINE_ID: &str = "1.3.6.1.6.3.10.2.1.1.0";

const OID_DELTA_MODEL: &str = "1.3.6.1.4.1.2254.2.32.1.6.1.3.1";
const OID_DELTA_SERIAL: &str = "1.3.6.1.4.1.2254.2.32.1.6.1.4.1";
const OID_DELTA_VERSION: &str = "1.3.6.1.4.1.2254.2.32.1.4.0";

const OID_VERTIV_MODEL: &str = "1.3.6.1.4.1.21239.5.2.1.8.0";
const OID_VERTIV_SERIAL: &str = "1.3.6.1.4.1.21239.5.2.1.10.0";
const OID_VERTIV_VERSION: &str = "1.3.6.1.4.1.21239.5.2.1.2.0";

/// Largest register count a single read request may ask for.
pub const MAX_READ_REGISTERS: u16 = 125;

/// How a target is recognized and then described.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TargetProbe {
    Snmp {
        matcher: SnmpQuery,
        detail: Vec<SnmpQuery>,
    },
    Modbus {
        matcher: ModbusQuery,
        detail: Vec<ModbusQuery>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetSignature {
    pub name: String,
    pub manufacturer: String,
    pub model: String,
    pub instance_type: InstanceType,
    /// Substring whose presence in the match value identifies the target.
    pub signature: String,
    pub probe: TargetProbe,
}

impl TargetSignature {
    pub fn protocol(&self) -> Protocol {
        match self.probe {
            TargetProbe::Snmp { .. } => Protocol::Snmp,
            TargetProbe::Modbus { .. } => Protocol::Modbus,
        }
    }

    /// True when `value` carries this target's signature.
    pub fn matches(&self, value: &str) -> bool {
        value.contains(&self.signature)
    }

    fn from_config(target: &TargetConfig) -> Result<Self> {
        let name = target.name.trim();
        if name.is_empty() {
            return Err(DiscoverError::Config("target with empty name".to_string()));
        }
        if name == UNKNOWN_TARGET {
            return Err(DiscoverError::Config(format!(
                "target name '{UNKNOWN_TARGET}' is reserved"
            )));
        }

        let key = QueryKey::Target(name.to_string());
        let (signature, probe) = match target.protocol {
            Protocol::Snmp => {
                let rule = target.snmp.as_ref().ok_or_else(|| {
                    DiscoverError::Config(format!("SNMP target {name} has no snmp match rule"))
                })?;
                ber::encode_oid(&rule.match_oid).map_err(|e| {
                    DiscoverError::Config(format!("target {name}: {e}"))
                })?;
                let matcher = SnmpQuery {
                    key,
                    oid: rule.match_oid.trim().to_string(),
                    kind: ValueKind::Text,
                };
                let probe = TargetProbe::Snmp {
                    matcher,
                    detail: snmp_family(name),
                };
                (rule.match_value_contains.clone(), probe)
            }
            Protocol::Modbus => {
                let rule = target.modbus.as_ref().ok_or_else(|| {
                    DiscoverError::Config(format!("Modbus target {name} has no modbus match rule"))
                })?;
                if rule.match_length == 0 || rule.match_length > MAX_READ_REGISTERS {
                    return Err(DiscoverError::Config(format!(
                        "target {name}: match_length must be 1..={MAX_READ_REGISTERS}"
                    )));
                }
                let matcher = ModbusQuery {
                    key,
                    register: rule.match_register_type,
                    address: rule.match_address,
                    length: rule.match_length,
                    kind: ValueKind::Text,
                };
                let probe = TargetProbe::Modbus {
                    matcher,
                    detail: modbus_family(name),
                };
                (rule.match_value_contains.clone(), probe)
            }
        };

        if signature.trim().is_empty() {
            return Err(DiscoverError::Config(format!(
                "target {name} has an empty match signature"
            )));
        }

        Ok(Self {
            name: name.to_string(),
            manufacturer: target.manufacturer.clone(),
            model: target.model.clone(),
            instance_type: target.instance_type,
            signature,
            probe,
        })
    }
}

/// Source target → linked targets, per cascade protocol.
#[derive(Debug, Clone, Default)]
pub struct DependencyTable {
    links: HashMap<(Protocol, String), Vec<String>>,
}

impl DependencyTable {
    pub fn from_links(links: &[DependencyLink]) -> Self {
        let mut table: HashMap<(Protocol, String), Vec<String>> = HashMap::new();
        for link in links {
            let linked = table
                .entry((link.protocol, link.source_target.trim().to_string()))
                .or_default();
            for target in &link.linked_targets {
                if !linked.contains(target) {
                    linked.push(target.clone());
                }
            }
        }
        Self { links: table }
    }

    /// Linked targets when `source` triggers a cascade over `protocol`.
    pub fn linked(&self, protocol: Protocol, source: &str) -> Option<&[String]> {
        self.links
            .get(&(protocol, source.to_string()))
            .map(Vec::as_slice)
    }

    fn entries(&self) -> impl Iterator<Item = (&Protocol, &String, &Vec<String>)> {
        self.links.iter().map(|((p, s), l)| (p, s, l))
    }
}

/// Ordered, immutable set of target signatures.
#[derive(Debug, Clone)]
pub struct SignatureLibrary {
    targets: Vec<TargetSignature>,
    unknown_detail: Vec<SnmpQuery>,
    dependencies: DependencyTable,
}

impl SignatureLibrary {
    pub fn from_config(config: &DiscoverConfig) -> Result<Self> {
        Self::build(&config.targets, &config.dependencies)
    }

    pub fn build(targets: &[TargetConfig], links: &[DependencyLink]) -> Result<Self> {
        let mut seen = HashSet::new();
        let mut signatures = Vec::with_capacity(targets.len());
        for target in targets {
            let sig = TargetSignature::from_config(target)?;
            if !seen.insert(sig.name.clone()) {
                return Err(DiscoverError::Config(format!(
                    "duplicate target name {}",
                    sig.name
                )));
            }
            signatures.push(sig);
        }

        let library = Self {
            targets: signatures,
            unknown_detail: unknown_family(),
            dependencies: DependencyTable::from_links(links),
        };

        for (protocol, source, linked) in library.dependencies.entries() {
            if library.find(source).is_none() {
                tracing::warn!(source = %source, "Dependency source is not a configured target");
            }
            for name in linked {
                match library.find(name) {
                    Some(t) if t.protocol() == *protocol => {}
                    _ => tracing::warn!(
                        source = %source,
                        linked = %name,
                        protocol = %protocol,
                        "Linked target is not a configured target of the cascade protocol"
                    ),
                }
            }
        }

        Ok(library)
    }

    pub fn len(&self) -> usize {
        self.targets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.targets.is_empty()
    }

    pub fn targets(&self) -> &[TargetSignature] {
        &self.targets
    }

    pub fn find(&self, name: &str) -> Option<&TargetSignature> {
        self.targets.iter().find(|t| t.name == name)
    }

    pub fn snmp_targets(&self) -> impl Iterator<Item = &TargetSignature> {
        self.targets
            .iter()
            .filter(|t| t.protocol() == Protocol::Snmp)
    }

    /// Detail queries for live SNMP hosts that matched nothing.
    pub fn unknown_detail(&self) -> &[SnmpQuery] {
        &self.unknown_detail
    }

    pub fn dependencies(&self) -> &DependencyTable {
        &self.dependencies
    }

    /// Modbus targets sharing a manufacturer with any linked target, in
    /// library order.
    pub fn modbus_candidates(&self, linked: &[String]) -> Vec<&TargetSignature> {
        let manufacturers: HashSet<&str> = linked
            .iter()
            .filter_map(|name| self.find(name))
            .map(|t| t.manufacturer.as_str())
            .collect();

        self.targets
            .iter()
            .filter(|t| t.protocol() == Protocol::Modbus)
            .filter(|t| manufacturers.contains(t.manufacturer.as_str()))
            .collect()
    }
}

// ── Model families ────────────────────────────────────────────────

fn snmp_family(name: &str) -> Vec<SnmpQuery> {
    let vendor = |model: &str, serial: &str, version: &str| {
        vec![
            SnmpQuery::field(Field::Model, model, ValueKind::Text),
            SnmpQuery::field(Field::SerialNumber, serial, ValueKind::Text),
            SnmpQuery::field(Field::Version, version, ValueKind::Text),
            SnmpQuery::field(Field::Uptime, OID_SYS_UPTIME, ValueKind::Uptime),
        ]
    };

    match name {
        "PDU-DELTA-PDUE428" => vendor(OID_DELTA_MODEL, OID_DELTA_SERIAL, OID_DELTA_VERSION),
        "PDU-VERTIV-6PS56" => vendor(OID_VERTIV_MODEL, OID_VERTIV_SERIAL, OID_VERTIV_VERSION),
        "SWITCH-HPE-5130" | "SWITCH-HPE-5945" | "IOT_CLIENT-LIENEO-WCM-421" => vec![
            SnmpQuery::field(Field::SnmpEngineId, OID_ENGINE_ID, ValueKind::Hex),
            SnmpQuery::field(Field::SysDescr, OID_SYS_DESCR, ValueKind::Text),
            SnmpQuery::field(Field::SysName, OID_SYS_NAME, ValueKind::Text),
            SnmpQuery::field(Field::Uptime, OID_SYS_UPTIME, ValueKind::Uptime),
        ],
        _ => Vec::new(),
    }
}

/// Version and uptime have no known registers on these families.
fn modbus_family(name: &str) -> Vec<ModbusQuery> {
    match name {
        "PDU-DELTA-PDU1315" | "PDU-DELTA-PDU4445" => vec![
            ModbusQuery::field(Field::Model, RegisterKind::Input, 1024, 8),
            ModbusQuery::field(Field::SerialNumber, RegisterKind::Holding, 768, 8),
        ],
        _ => Vec::new(),
    }
}

fn unknown_family() -> Vec<SnmpQuery> {
    vec![
        SnmpQuery::field(Field::SysName, OID_SYS_NAME, ValueKind::Text),
        SnmpQuery::field(Field::SysDescr, OID_SYS_DESCR, ValueKind::Text),
        SnmpQuery::field(Field::Uptime, OID_SYS_UPTIME, ValueKind::Uptime),
    ]
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::config::{ModbusMatchConfig, SnmpMatchConfig};

    pub(crate) fn snmp_target(name: &str, manufacturer: &str, contains: &str) -> TargetConfig {
        TargetConfig {
            name: name.to_string(),
            protocol: Protocol::Snmp,
            manufacturer: manufacturer.to_string(),
            model: name.rsplit('-').next().unwrap_or(name).to_string(),
            instance_type: InstanceType::Pdu,
            snmp: Some(SnmpMatchConfig {
                match_value_contains: contains.to_string(),
                match_oid: OID_SYS_DESCR.to_string(),
            }),
            modbus: None,
        }
    }

    pub(crate) fn modbus_target(name: &str, manufacturer: &str, contains: &str) -> TargetConfig {
        TargetConfig {
            name: name.to_string(),
            protocol: Protocol::Modbus,
            manufacturer: manufacturer.to_string(),
            model: name.rsplit('-').next().unwrap_or(name).to_string(),
            instance_type: InstanceType::Pdu,
            snmp: None,
            modbus: Some(ModbusMatchConfig {
                match_value_contains: contains.to_string(),
                match_register_type: RegisterKind::Input,
                match_address: 1024,
                match_length: 8,
            }),
        }
    }

    #[test]
    fn library_preserves_configuration_order() {
        let lib = SignatureLibrary::build(
            &[
                snmp_target("PDU-VERTIV-6PS56", "Vertiv", "6PS56"),
                modbus_target("PDU-DELTA-PDU1315", "Delta", "PDU1315"),
                snmp_target("PDU-DELTA-PDUE428", "Delta", "PDUE428"),
            ],
            &[],
        )
        .unwrap();

        let names: Vec<&str> = lib.targets().iter().map(|t| t.name.as_str()).collect();
        assert_eq!(
            names,
            vec!["PDU-VERTIV-6PS56", "PDU-DELTA-PDU1315", "PDU-DELTA-PDUE428"]
        );
        assert_eq!(lib.snmp_targets().count(), 2);
    }

    #[test]
    fn known_families_get_detail_queries() {
        let lib = SignatureLibrary::build(
            &[
                snmp_target("PDU-DELTA-PDUE428", "Delta", "PDUE428"),
                snmp_target("SWITCH-HPE-5130", "HPE", "5130"),
                snmp_target("PDU-ACME-X1", "Acme", "X1"),
                modbus_target("PDU-DELTA-PDU4445", "Delta", "PDU4445"),
            ],
            &[],
        )
        .unwrap();

        let detail_len = |name: &str| match &lib.find(name).unwrap().probe {
            TargetProbe::Snmp { detail, .. } => detail.len(),
            TargetProbe::Modbus { detail, .. } => detail.len(),
        };
        assert_eq!(detail_len("PDU-DELTA-PDUE428"), 4);
        assert_eq!(detail_len("SWITCH-HPE-5130"), 4);
        assert_eq!(detail_len("PDU-ACME-X1"), 0);
        assert_eq!(detail_len("PDU-DELTA-PDU4445"), 2);
        assert_eq!(lib.unknown_detail().len(), 3);
    }

    #[test]
    fn match_query_is_keyed_by_target_name() {
        let lib =
            SignatureLibrary::build(&[snmp_target("PDU-DELTA-PDUE428", "Delta", "PDUE428")], &[])
                .unwrap();
        let TargetProbe::Snmp { matcher, .. } = &lib.targets()[0].probe else {
            panic!("expected SNMP probe");
        };
        assert_eq!(matcher.key, QueryKey::Target("PDU-DELTA-PDUE428".to_string()));
    }

    #[test]
    fn invalid_targets_are_rejected() {
        let empty = snmp_target("PDU-A", "A", "  ");
        assert!(SignatureLibrary::build(&[empty], &[]).is_err());

        let mut no_rule = snmp_target("PDU-B", "B", "B");
        no_rule.snmp = None;
        assert!(SignatureLibrary::build(&[no_rule], &[]).is_err());

        let reserved = snmp_target(UNKNOWN_TARGET, "X", "X");
        assert!(SignatureLibrary::build(&[reserved], &[]).is_err());

        let dup = vec![snmp_target("PDU-C", "C", "C"), snmp_target("PDU-C", "C", "C")];
        assert!(SignatureLibrary::build(&dup, &[]).is_err());

        let mut wide = modbus_target("PDU-D", "D", "D");
        if let Some(rule) = wide.modbus.as_mut() {
            rule.match_length = 200;
        }
        assert!(SignatureLibrary::build(&[wide], &[]).is_err());
    }

    #[test]
    fn modbus_candidates_follow_linked_manufacturers() {
        let links = vec![DependencyLink {
            protocol: Protocol::Modbus,
            source_target: "IOT_CLIENT-LIENEO-WCM-421".to_string(),
            linked_targets: vec!["PDU-DELTA-PDU1315".to_string()],
        }];
        let lib = SignatureLibrary::build(
            &[
                snmp_target("IOT_CLIENT-LIENEO-WCM-421", "Lieneo", "WCM-421"),
                modbus_target("PDU-ACME-M1", "Acme", "M1"),
                modbus_target("PDU-DELTA-PDU4445", "Delta", "PDU4445"),
                modbus_target("PDU-DELTA-PDU1315", "Delta", "PDU1315"),
            ],
            &links,
        )
        .unwrap();

        let linked = lib
            .dependencies()
            .linked(Protocol::Modbus, "IOT_CLIENT-LIENEO-WCM-421")
            .unwrap();
        let names: Vec<&str> = lib
            .modbus_candidates(linked)
            .iter()
            .map(|t| t.name.as_str())
            .collect();
        assert_eq!(names, vec!["PDU-DELTA-PDU4445", "PDU-DELTA-PDU1315"]);

        assert!(lib
            .dependencies()
            .linked(Protocol::Modbus, "PDU-DELTA-PDU1315")
            .is_none());
    }
}
