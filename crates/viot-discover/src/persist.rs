//! Pending-list persistence.
//!
//! Identified devices are appended to CSV pending lists under the data
//! directory:
//! ```text
//! {data_dir}/
//!   scan_pdu.csv          pending PDUs (appended)
//!   scan_device.csv       pending non-PDU devices (appended)
//!   registry_pdu.csv      registered PDUs (read only)
//!   registry_device.csv   registered devices (read only)
//! ```
//! Existing rows are never rewritten. A device whose identity key already
//! appears in any of the four files is not written again.

use std::collections::HashSet;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use viot_core::types::{or_unknown, ScanInstanceInfo};

pub const PENDING_PDU_FILE: &str = "scan_pdu.csv";
pub const PENDING_DEVICE_FILE: &str = "scan_device.csv";
pub const REGISTRY_PDU_FILE: &str = "registry_pdu.csv";
pub const REGISTRY_DEVICE_FILE: &str = "registry_device.csv";

const KEY_COLUMN: &str = "ip_key";

#[derive(Debug, thiserror::Error)]
pub enum PersistError {
    #[error("IO error on {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("CSV error on {path}: {source}")]
    Csv { path: PathBuf, source: csv::Error },
}

/// One row of a pending or registry list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingRow {
    pub ip_key: String,
    pub model: String,
    pub ip: String,
    pub protocol: String,
    pub version: String,
    pub serial_number: String,
    pub mac_address: String,
    pub instance_type: String,
    pub manufacturer: String,
    pub uptime: i64,
    pub updated_at: String,
}

impl From<&ScanInstanceInfo> for PendingRow {
    fn from(record: &ScanInstanceInfo) -> Self {
        Self {
            ip_key: record.identity_key(),
            model: or_unknown(&record.model).to_string(),
            ip: record.ip.to_string(),
            protocol: record.protocol.to_string(),
            version: or_unknown(&record.version).to_string(),
            serial_number: or_unknown(&record.serial_number).to_string(),
            mac_address: or_unknown(&record.mac_address).to_string(),
            instance_type: record.instance_type.to_string(),
            manufacturer: or_unknown(&record.manufacturer).to_string(),
            uptime: record.uptime_secs,
            updated_at: record.discovered_at.to_rfc3339(),
        }
    }
}

/// Identity keys already pending or registered.
#[derive(Debug, Clone, Default)]
pub struct PendingIndex {
    keys: HashSet<String>,
}

impl PendingIndex {
    pub fn contains(&self, key: &str) -> bool {
        self.keys.contains(key)
    }

    pub fn insert(&mut self, key: String) -> bool {
        self.keys.insert(key)
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}

/// Counts and failures from one persistence pass.
#[derive(Debug, Default)]
pub struct PersistSummary {
    pub pdu_written: usize,
    pub device_written: usize,
    pub duplicates: usize,
    pub unknown_skipped: usize,
    pub errors: Vec<PersistError>,
}

impl PersistSummary {
    pub fn written(&self) -> usize {
        self.pdu_written + self.device_written
    }
}

/// CSV-backed pending lists.
pub struct PendingStore {
    dir: PathBuf,
    persist_unknown: bool,
}

impl PendingStore {
    /// Create a store rooted at `dir`, creating the directory if needed.
    pub fn new(dir: impl Into<PathBuf>, persist_unknown: bool) -> Result<Self, PersistError> {
        let dir = dir.into();
        fs::create_dir_all(&dir).map_err(|source| PersistError::Io {
            path: dir.clone(),
            source,
        })?;
        Ok(Self {
            dir,
            persist_unknown,
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Load identity keys from the pending and registry lists.
    /// Missing files count as empty.
    pub fn load_index(&self) -> Result<PendingIndex, PersistError> {
        let mut index = PendingIndex::default();
        for name in [
            PENDING_PDU_FILE,
            PENDING_DEVICE_FILE,
            REGISTRY_PDU_FILE,
            REGISTRY_DEVICE_FILE,
        ] {
            let path = self.dir.join(name);
            if !path.exists() {
                continue;
            }
            for key in read_keys(&path)? {
                index.insert(key);
            }
        }

        tracing::debug!(keys = index.len(), dir = %self.dir.display(), "Pending index loaded");
        Ok(index)
    }

    /// Dedup `records` against `index` and each other, then append the
    /// survivors to the PDU or device list.
    ///
    /// Keys enter `index` only after their file append succeeded.
    pub fn persist(
        &self,
        index: &mut PendingIndex,
        records: &mut [ScanInstanceInfo],
    ) -> PersistSummary {
        let mut summary = PersistSummary::default();
        let mut batch_keys = HashSet::new();
        let mut pdus = Vec::new();
        let mut devices = Vec::new();

        for record in records.iter_mut() {
            record.assign_identity_key();

            if index.contains(&record.ip_key) || !batch_keys.insert(record.ip_key.clone()) {
                summary.duplicates += 1;
                continue;
            }
            if record.is_unknown() && !self.persist_unknown {
                summary.unknown_skipped += 1;
                continue;
            }

            let row = PendingRow::from(&*record);
            if record.instance_type.is_pdu() {
                pdus.push(row);
            } else {
                devices.push(row);
            }
        }

        for (name, rows) in [(PENDING_PDU_FILE, pdus), (PENDING_DEVICE_FILE, devices)] {
            if rows.is_empty() {
                continue;
            }
            let path = self.dir.join(name);
            match append_rows(&path, &rows) {
                Ok(()) => {
                    if name == PENDING_PDU_FILE {
                        summary.pdu_written += rows.len();
                    } else {
                        summary.device_written += rows.len();
                    }
                    for row in rows {
                        index.insert(row.ip_key);
                    }
                }
                Err(e) => {
                    tracing::error!(error = %e, rows = rows.len(), "Pending list append failed");
                    summary.errors.push(e);
                }
            }
        }

        summary
    }
}

fn read_keys(path: &Path) -> Result<Vec<String>, PersistError> {
    let csv_err = |source| PersistError::Csv {
        path: path.to_path_buf(),
        source,
    };

    let mut reader = csv::ReaderBuilder::new()
        .flexible(true)
        .from_path(path)
        .map_err(csv_err)?;

    let column = reader
        .headers()
        .map_err(csv_err)?
        .iter()
        .position(|h| h.trim() == KEY_COLUMN)
        .unwrap_or(0);

    let mut keys = Vec::new();
    for row in reader.records() {
        let row = row.map_err(csv_err)?;
        if let Some(key) = row.get(column).map(str::trim).filter(|k| !k.is_empty()) {
            keys.push(key.to_string());
        }
    }
    Ok(keys)
}

fn append_rows(path: &Path, rows: &[PendingRow]) -> Result<(), PersistError> {
    let io_err = |source| PersistError::Io {
        path: path.to_path_buf(),
        source,
    };
    let csv_err = |source| PersistError::Csv {
        path: path.to_path_buf(),
        source,
    };

    let mut file = OpenOptions::new()
        .create(true)
        .read(true)
        .append(true)
        .open(path)
        .map_err(io_err)?;
    let len = file.metadata().map_err(io_err)?.len();
    let needs_header = len == 0;

    // A row cut short by a crash must not swallow the first appended row.
    if len > 0 && !ends_with_newline(&mut file).map_err(io_err)? {
        file.write_all(b"\n").map_err(io_err)?;
    }

    let mut writer = csv::WriterBuilder::new()
        .has_headers(needs_header)
        .from_writer(file);
    for row in rows {
        writer.serialize(row).map_err(csv_err)?;
    }
    writer.flush().map_err(io_err)?;

    tracing::info!(path = %path.display(), rows = rows.len(), "Appended to pending list");
    Ok(())
}

fn ends_with_newline(file: &mut File) -> io::Result<bool> {
    let mut last = [0u8; 1];
    file.seek(SeekFrom::End(-1))?;
    file.read_exact(&mut last)?;
    Ok(last[0] == b'\n')
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use std::net::Ipv4Addr;
    use viot_core::types::{InstanceType, Location, Protocol, UNKNOWN_TARGET};

    const HEADER: &str = "ip_key,model,ip,protocol,version,serial_number,mac_address,instance_type,manufacturer,uptime,updated_at";

    fn record(last: u8, instance_type: InstanceType) -> ScanInstanceInfo {
        ScanInstanceInfo {
            target_name: "PDU-DELTA-PDUE428".to_string(),
            ip_key: String::new(),
            ip: Ipv4Addr::new(10, 1, 1, last),
            port: 161,
            slave_id: None,
            protocol: Protocol::Snmp,
            model: "PDUE428".to_string(),
            manufacturer: "Delta".to_string(),
            instance_type,
            version: String::new(),
            serial_number: "SN-1".to_string(),
            mac_address: String::new(),
            snmp_engine_id: String::new(),
            sys_name: String::new(),
            sys_descr: String::new(),
            uptime_secs: 3_600,
            location: Location::default(),
            discovered_at: Utc::now(),
        }
    }

    fn lines(path: &Path) -> Vec<String> {
        fs::read_to_string(path)
            .unwrap()
            .lines()
            .map(str::to_string)
            .collect()
    }

    #[test]
    fn rows_are_classified_and_header_written_once() {
        let dir = tempfile::tempdir().unwrap();
        let store = PendingStore::new(dir.path(), false).unwrap();
        let mut index = store.load_index().unwrap();

        let mut batch = vec![record(1, InstanceType::Pdu), record(2, InstanceType::Switch)];
        let summary = store.persist(&mut index, &mut batch);
        assert_eq!((summary.pdu_written, summary.device_written), (1, 1));

        let mut more = vec![record(3, InstanceType::Pdu)];
        store.persist(&mut index, &mut more);

        let pdu = lines(&dir.path().join(PENDING_PDU_FILE));
        assert_eq!(pdu.len(), 3);
        assert_eq!(pdu[0], HEADER);
        assert!(pdu[1].starts_with("10.1.1.1:161,PDUE428,10.1.1.1,snmp,unknown,SN-1,unknown,pdu,Delta,3600,"));
        assert!(pdu[2].starts_with("10.1.1.3:161,"));

        let device = lines(&dir.path().join(PENDING_DEVICE_FILE));
        assert_eq!(device.len(), 2);
        assert!(device[1].contains(",switch,"));
    }

    #[test]
    fn persisting_twice_writes_nothing_new() {
        let dir = tempfile::tempdir().unwrap();
        let store = PendingStore::new(dir.path(), false).unwrap();

        let mut index = store.load_index().unwrap();
        let mut batch = vec![record(1, InstanceType::Pdu), record(2, InstanceType::Pdu)];
        assert_eq!(store.persist(&mut index, &mut batch).written(), 2);

        // Same index, then a fresh index reloaded from disk.
        assert_eq!(store.persist(&mut index, &mut batch).written(), 0);
        let mut reloaded = store.load_index().unwrap();
        let summary = store.persist(&mut reloaded, &mut batch);
        assert_eq!(summary.written(), 0);
        assert_eq!(summary.duplicates, 2);
        assert_eq!(lines(&dir.path().join(PENDING_PDU_FILE)).len(), 3);
    }

    #[test]
    fn duplicate_keys_in_one_batch_collapse() {
        let dir = tempfile::tempdir().unwrap();
        let store = PendingStore::new(dir.path(), false).unwrap();
        let mut index = PendingIndex::default();

        let mut batch = vec![record(1, InstanceType::Pdu), record(1, InstanceType::Pdu)];
        let summary = store.persist(&mut index, &mut batch);
        assert_eq!(summary.written(), 1);
        assert_eq!(summary.duplicates, 1);
    }

    #[test]
    fn registered_devices_are_excluded() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(
            dir.path().join(REGISTRY_PDU_FILE),
            format!("{HEADER}\n10.1.1.1:161,PDUE428,10.1.1.1,snmp,V1,SN-1,unknown,pdu,Delta,0,2026-01-01T00:00:00+00:00\n"),
        )
        .unwrap();
        let store = PendingStore::new(dir.path(), false).unwrap();
        let mut index = store.load_index().unwrap();
        assert!(index.contains("10.1.1.1:161"));

        let mut batch = vec![record(1, InstanceType::Pdu), record(2, InstanceType::Pdu)];
        let summary = store.persist(&mut index, &mut batch);
        assert_eq!(summary.written(), 1);
        assert!(lines(&dir.path().join(PENDING_PDU_FILE))[1].starts_with("10.1.1.2:161,"));
    }

    #[test]
    fn unknown_hosts_need_opt_in() {
        let dir = tempfile::tempdir().unwrap();
        let mut unknown = record(9, InstanceType::Unknown);
        unknown.target_name = UNKNOWN_TARGET.to_string();

        let store = PendingStore::new(dir.path(), false).unwrap();
        let summary = store.persist(&mut PendingIndex::default(), &mut [unknown.clone()]);
        assert_eq!((summary.written(), summary.unknown_skipped), (0, 1));

        let store = PendingStore::new(dir.path(), true).unwrap();
        let summary = store.persist(&mut PendingIndex::default(), &mut [unknown]);
        assert_eq!(summary.device_written, 1);
    }

    #[test]
    fn failed_append_leaves_keys_unindexed() {
        let dir = tempfile::tempdir().unwrap();
        // A directory where the file should be makes the open fail.
        fs::create_dir(dir.path().join(PENDING_PDU_FILE)).unwrap();
        let store = PendingStore::new(dir.path(), false).unwrap();
        let mut index = PendingIndex::default();

        let summary = store.persist(&mut index, &mut [record(1, InstanceType::Pdu)]);
        assert_eq!(summary.written(), 0);
        assert_eq!(summary.errors.len(), 1);
        assert!(!index.contains("10.1.1.1:161"));
    }

    #[test]
    fn truncated_tail_row_does_not_swallow_next_append() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(PENDING_PDU_FILE);
        fs::write(&path, format!("{HEADER}\n10.1.1.5:161,PDUE4")).unwrap();
        let store = PendingStore::new(dir.path(), false).unwrap();

        let mut index = store.load_index().unwrap();
        let first = store.persist(&mut index, &mut [record(1, InstanceType::Pdu)]);
        assert_eq!(first.pdu_written, 1);

        let mut reloaded = store.load_index().unwrap();
        assert!(reloaded.contains("10.1.1.1:161"));
        let second = store.persist(&mut reloaded, &mut [record(1, InstanceType::Pdu)]);
        assert_eq!((second.written(), second.duplicates), (0, 1));

        let rows = lines(&path);
        assert_eq!(rows.len(), 3);
        assert_eq!(rows[1], "10.1.1.5:161,PDUE4");
        assert!(rows[2].starts_with("10.1.1.1:161,PDUE428,"));
    }
}
