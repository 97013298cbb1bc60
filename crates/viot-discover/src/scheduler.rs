//! Discovery cycle engine.
//!
//! A cycle is sweep → identify → dedup → append → report. The daemon loop
//! ticks at `scanner.tick_secs` and runs one cycle over whichever rooms the
//! [`ScanSchedule`] says are due.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::Utc;
use tokio::time::interval;
use uuid::Uuid;

use crate::arp::MacResolver;
use crate::config::{DiscoverConfig, IpRangeZone};
use crate::coordinator::Coordinator;
use crate::error::Result;
use crate::identify::Identifier;
use crate::library::SignatureLibrary;
use crate::liveness::LivenessProbe;
use crate::modbus::ModbusClient;
use crate::persist::{PendingIndex, PendingStore};
use crate::report::{store_report, CycleReport};
use crate::schedule::ScanSchedule;
use crate::snmp::SnmpClient;

/// Network-facing collaborators of the engine.
#[derive(Clone)]
pub struct Transports {
    pub prober: Arc<dyn LivenessProbe>,
    pub snmp: Arc<dyn SnmpClient>,
    pub modbus: Arc<dyn ModbusClient>,
    pub mac: Arc<dyn MacResolver>,
}

/// State owned by one cycle and dropped with it.
pub struct CycleContext {
    pub cycle_id: Uuid,
    pub index: PendingIndex,
    pub report: CycleReport,
}

impl CycleContext {
    fn new(index: PendingIndex, rooms: Vec<String>) -> Self {
        let cycle_id = Uuid::new_v4();
        Self {
            cycle_id,
            index,
            report: CycleReport::start(cycle_id, rooms),
        }
    }
}

/// The scheduler runs discovery cycles for the configured rooms.
pub struct ScanScheduler {
    config: DiscoverConfig,
    coordinator: Coordinator,
    store: PendingStore,
    schedule: Arc<Mutex<ScanSchedule>>,
}

impl ScanScheduler {
    pub fn new(config: DiscoverConfig, transports: Transports) -> Result<Self> {
        let library = Arc::new(SignatureLibrary::from_config(&config)?);
        tracing::info!(
            targets = library.len(),
            rooms = config.ip_ranges.len(),
            "Signature library built"
        );

        let identifier = Identifier::new(
            library,
            transports.snmp,
            transports.modbus,
            transports.mac,
            config.snmp.clone(),
            config.modbus.clone(),
        );
        let scanner = &config.scanner;
        let coordinator = Coordinator::new(
            transports.prober,
            identifier,
            scanner.max_concurrent_rooms,
            scanner.max_concurrent_ips,
            Duration::from_secs(scanner.room_timeout_secs),
            Duration::from_secs(scanner.ip_timeout_secs),
            scanner.strict_range,
        );
        let store = PendingStore::new(&scanner.data_dir, scanner.persist_unknown)?;
        let schedule = ScanSchedule::new(
            config.ip_ranges.iter().map(|z| z.room.clone()),
            Duration::from_secs(scanner.scan_interval_secs),
        )?;

        Ok(Self {
            config,
            coordinator,
            store,
            schedule: Arc::new(Mutex::new(schedule)),
        })
    }

    /// Shared handle for adjusting room cadence while the daemon runs.
    pub fn schedule(&self) -> Arc<Mutex<ScanSchedule>> {
        self.schedule.clone()
    }

    /// Run one cycle over `rooms`, or over every room when `rooms` is empty.
    pub async fn run_cycle(&self, rooms: &[String]) -> Result<CycleReport> {
        let zones = select_zones(&self.config.ip_ranges, rooms);
        let room_names = room_names(&zones);

        let index = match self.store.load_index() {
            Ok(index) => index,
            Err(e) => {
                let mut report = CycleReport::start(Uuid::new_v4(), room_names);
                report.record_error(&e.to_string());
                report.finish();
                store_report(&report, &self.config.scanner.report_dir);
                return Err(e.into());
            }
        };
        let mut ctx = CycleContext::new(index, room_names);

        tracing::info!(
            cycle_id = %ctx.cycle_id,
            rooms = zones.len(),
            known_keys = ctx.index.len(),
            "Discovery cycle started"
        );

        let outcome = self.coordinator.scan(&zones).await;
        ctx.report.record_scan(&outcome);

        let mut records = outcome.records;
        let summary = self.store.persist(&mut ctx.index, &mut records);
        ctx.report.record_persist(&summary);
        ctx.report.finish();

        let report = ctx.report;
        tracing::info!(
            cycle_id = %report.cycle_id,
            rooms_scanned = report.rooms_scanned,
            alive = report.alive,
            identified = report.identified,
            unknown = report.unknown,
            rows_written = report.rows_written,
            duplicates = report.duplicates,
            room_errors = outcome.room_errors.len(),
            host_errors = outcome.host_errors.len(),
            persist_errors = summary.errors.len(),
            duration_ms = report.duration_ms,
            "Discovery cycle complete"
        );

        store_report(&report, &self.config.scanner.report_dir);
        Ok(report)
    }

    /// Tick forever, scanning due rooms.
    pub async fn run(&self) -> Result<()> {
        let mut ticker = interval(Duration::from_secs(self.config.scanner.tick_secs));
        tracing::info!(
            rooms = self.config.ip_ranges.len(),
            tick_secs = self.config.scanner.tick_secs,
            "Scheduler started"
        );

        loop {
            ticker.tick().await;
            self.run_due(Utc::now()).await;
        }
    }

    async fn run_due(&self, now: chrono::DateTime<Utc>) {
        let due = lock(&self.schedule).due_rooms(now);
        if due.is_empty() {
            return;
        }

        tracing::info!(rooms = ?due, "Scheduled cycle triggered");
        if let Err(e) = self.run_cycle(&due).await {
            tracing::error!(error = %e, "Scheduled cycle failed");
        }

        let mut schedule = lock(&self.schedule);
        for room in &due {
            schedule.mark_scanned(room, now);
        }
        schedule.cleanup_expired(Utc::now());
    }
}

fn lock(schedule: &Mutex<ScanSchedule>) -> MutexGuard<'_, ScanSchedule> {
    schedule
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Zones whose room is in `rooms`; all zones when `rooms` is empty.
pub fn select_zones(zones: &[IpRangeZone], rooms: &[String]) -> Vec<IpRangeZone> {
    if rooms.is_empty() {
        return zones.to_vec();
    }
    for room in rooms {
        if !zones.iter().any(|z| &z.room == room) {
            tracing::warn!(room = %room, "Requested room has no configured ip range");
        }
    }
    zones
        .iter()
        .filter(|z| rooms.contains(&z.room))
        .cloned()
        .collect()
}

fn room_names(zones: &[IpRangeZone]) -> Vec<String> {
    let mut names: Vec<String> = Vec::new();
    for zone in zones {
        if !names.contains(&zone.room) {
            names.push(zone.room.clone());
        }
    }
    names
}
