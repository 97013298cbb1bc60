//! Room scan coordination.
//!
//! Two bounded pools. The room pool covers CIDR computation, the liveness
//! sweep, and aggregation into the shared ip → location map. The IP pool is
//! shared by every room and covers per-IP identification. Each room and each
//! IP runs in its own task under a timeout; panics surface as errors for that
//! room or IP only.

use std::collections::{BTreeMap, HashMap};
use std::net::Ipv4Addr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use viot_core::cidr::AddressRange;
use viot_core::types::{AliveHost, Location, ScanInstanceInfo};
use viot_core::RangeError;

use crate::config::IpRangeZone;
use crate::identify::{join_failure, HostError, HostOutcome, Identifier};
use crate::liveness::LivenessProbe;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RoomError {
    #[error("room {room}: invalid address range: {source}")]
    Range { room: String, source: RangeError },

    #[error("room {room}: liveness sweep failed: {reason}")]
    Sweep { room: String, reason: String },

    #[error("room {room}: no alive hosts in {cidr}")]
    NoAliveHosts { room: String, cidr: String },

    #[error("room {room}: timed out after {after:?}")]
    Timeout { room: String, after: Duration },

    #[error("room {room}: faulted: {reason}")]
    Fault { room: String, reason: String },
}

/// Alive vs identified address counts for one room.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoomTally {
    pub location: Location,
    pub alive: usize,
    pub identified: usize,
}

/// Everything one coordinated pass produced.
#[derive(Debug, Default)]
pub struct CoordinatorOutcome {
    pub records: Vec<ScanInstanceInfo>,
    pub tallies: Vec<RoomTally>,
    pub room_errors: Vec<RoomError>,
    pub host_errors: Vec<HostError>,
}

type AliveMap = Arc<Mutex<HashMap<Ipv4Addr, Location>>>;

pub struct Coordinator {
    prober: Arc<dyn LivenessProbe>,
    identifier: Identifier,
    room_permits: Arc<Semaphore>,
    ip_permits: Arc<Semaphore>,
    room_timeout: Duration,
    ip_timeout: Duration,
    strict_range: bool,
}

impl Coordinator {
    pub fn new(
        prober: Arc<dyn LivenessProbe>,
        identifier: Identifier,
        max_concurrent_rooms: usize,
        max_concurrent_ips: usize,
        room_timeout: Duration,
        ip_timeout: Duration,
        strict_range: bool,
    ) -> Self {
        Self {
            prober,
            identifier,
            room_permits: Arc::new(Semaphore::new(max_concurrent_rooms)),
            ip_permits: Arc::new(Semaphore::new(max_concurrent_ips)),
            room_timeout,
            ip_timeout,
            strict_range,
        }
    }

    /// Sweep every zone, then identify every alive address.
    pub async fn scan(&self, zones: &[IpRangeZone]) -> CoordinatorOutcome {
        let (alive, mut tallies, room_errors) = self.sweep_rooms(zones).await;
        let outcomes = self.identify_hosts(&alive).await;

        let mut records = Vec::new();
        let mut host_errors = Vec::new();
        let mut identified: HashMap<Location, usize> = HashMap::new();

        for outcome in outcomes {
            if !outcome.records.is_empty() {
                if let Some(location) = alive.get(&outcome.ip) {
                    *identified.entry(location.clone()).or_default() += 1;
                }
            }
            records.extend(outcome.records);
            if let Some(e) = outcome.error {
                tracing::warn!(ip = %outcome.ip, error = %e, "Host identification incomplete");
                host_errors.push(e);
            }
        }

        for tally in &mut tallies {
            tally.identified = identified.get(&tally.location).copied().unwrap_or(0);
            tracing::info!(
                room = %tally.location,
                alive = tally.alive,
                identified = tally.identified,
                "Room scan summary"
            );
        }

        CoordinatorOutcome {
            records,
            tallies,
            room_errors,
            host_errors,
        }
    }

    /// Liveness-sweep every zone under the room pool.
    ///
    /// Returns the aggregate ip → location map, one tally per swept room,
    /// and the rooms that failed.
    pub async fn sweep_rooms(
        &self,
        zones: &[IpRangeZone],
    ) -> (HashMap<Ipv4Addr, Location>, Vec<RoomTally>, Vec<RoomError>) {
        let alive: AliveMap = Arc::default();
        let mut handles: Vec<(String, JoinHandle<Result<RoomTally, RoomError>>)> = Vec::new();

        for zone in zones {
            let prober = self.prober.clone();
            let permits = self.room_permits.clone();
            let alive = alive.clone();
            let room = zone.room.clone();
            let zone = zone.clone();
            let limit = self.room_timeout;
            let strict = self.strict_range;

            let handle = tokio::spawn(async move {
                let Ok(_permit) = permits.acquire_owned().await else {
                    return Err(RoomError::Fault {
                        room: zone.room.clone(),
                        reason: "room pool closed".to_string(),
                    });
                };
                match tokio::time::timeout(limit, scan_room(prober, &zone, strict, alive)).await {
                    Ok(result) => result,
                    Err(_) => Err(RoomError::Timeout {
                        room: zone.room.clone(),
                        after: limit,
                    }),
                }
            });
            handles.push((room, handle));
        }

        let mut tallies = Vec::new();
        let mut errors = Vec::new();
        for (room, handle) in handles {
            match handle.await {
                Ok(Ok(tally)) => tallies.push(tally),
                Ok(Err(e)) => {
                    tracing::warn!(room = %room, error = %e, "Room scan failed");
                    errors.push(e);
                }
                Err(join_err) => {
                    let e = RoomError::Fault {
                        room: room.clone(),
                        reason: join_failure(join_err),
                    };
                    tracing::error!(room = %room, error = %e, "Room scan task failed");
                    errors.push(e);
                }
            }
        }

        // Timed-out room tasks are detached; stop reading what they may still add.
        let map = alive
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone();
        (map, tallies, errors)
    }

    /// Identify every alive address under the shared IP pool.
    ///
    /// A permit is acquired before each task is spawned, so at most
    /// `max_concurrent_ips` identifications exist at any time.
    pub async fn identify_hosts(&self, alive: &HashMap<Ipv4Addr, Location>) -> Vec<HostOutcome> {
        let ordered: BTreeMap<&Ipv4Addr, &Location> = alive.iter().collect();
        let mut handles: Vec<(Ipv4Addr, JoinHandle<HostOutcome>)> = Vec::with_capacity(ordered.len());

        for (ip, location) in ordered {
            let permit = match self.ip_permits.clone().acquire_owned().await {
                Ok(permit) => permit,
                Err(e) => {
                    tracing::error!(error = %e, "IP pool closed, stopping identification");
                    break;
                }
            };

            let identifier = self.identifier.clone();
            let host = AliveHost {
                ip: *ip,
                location: location.clone(),
            };
            let limit = self.ip_timeout;
            let handle = tokio::spawn(async move {
                let _permit = permit;
                identifier.identify_bounded(host, limit).await
            });
            handles.push((*ip, handle));
        }

        let mut outcomes = Vec::with_capacity(handles.len());
        for (ip, handle) in handles {
            match handle.await {
                Ok(outcome) => outcomes.push(outcome),
                Err(join_err) => outcomes.push(HostOutcome {
                    ip,
                    records: Vec::new(),
                    error: Some(HostError::Fault {
                        ip,
                        reason: join_failure(join_err),
                    }),
                }),
            }
        }
        outcomes
    }
}

async fn scan_room(
    prober: Arc<dyn LivenessProbe>,
    zone: &IpRangeZone,
    strict: bool,
    alive: AliveMap,
) -> Result<RoomTally, RoomError> {
    let range = AddressRange::parse(&zone.start, &zone.end).map_err(|source| RoomError::Range {
        room: zone.room.clone(),
        source,
    })?;
    let cidr = range.covering_net();

    let hosts = prober
        .sweep(cidr)
        .await
        .map_err(|e| RoomError::Sweep {
            room: zone.room.clone(),
            reason: e.to_string(),
        })?;

    let swept = hosts.len();
    let hosts: Vec<Ipv4Addr> = if strict {
        hosts.into_iter().filter(|ip| range.contains(*ip)).collect()
    } else {
        hosts
    };

    if hosts.is_empty() {
        return Err(RoomError::NoAliveHosts {
            room: zone.room.clone(),
            cidr: cidr.to_string(),
        });
    }

    tracing::debug!(
        room = %zone.room,
        cidr = %cidr,
        swept,
        in_range = hosts.len(),
        "Room sweep complete"
    );

    let location = zone.location();
    {
        let mut map = alive.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        for ip in &hosts {
            if let Some(existing) = map.get(ip) {
                tracing::warn!(ip = %ip, kept = %existing, dropped = %location, "Address claimed by two rooms");
                continue;
            }
            map.insert(*ip, location.clone());
        }
    }

    Ok(RoomTally {
        location,
        alive: hosts.len(),
        identified: 0,
    })
}
