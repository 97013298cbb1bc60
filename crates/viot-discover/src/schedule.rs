//! Per-room scan cadence.
//!
//! Every room runs at the default interval unless a temporary override is
//! active. Overrides carry their own expiry and are dropped by
//! [`ScanSchedule::cleanup_expired`]. All methods take `now` explicitly.

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ScheduleError {
    #[error("unknown room: {0}")]
    UnknownRoom(String),

    #[error("interval must be at least one second")]
    ZeroInterval,

    #[error("duration out of range: {0:?}")]
    OutOfRange(Duration),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Override {
    interval: TimeDelta,
    expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default)]
struct RoomState {
    last_scanned: Option<DateTime<Utc>>,
    temporary: Option<Override>,
}

#[derive(Debug, Clone)]
pub struct ScanSchedule {
    default_interval: TimeDelta,
    rooms: HashMap<String, RoomState>,
}

impl ScanSchedule {
    pub fn new<I, S>(rooms: I, default_interval: Duration) -> Result<Self, ScheduleError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let default_interval = to_delta(default_interval)?;
        Ok(Self {
            default_interval,
            rooms: rooms
                .into_iter()
                .map(|r| (r.into(), RoomState::default()))
                .collect(),
        })
    }

    /// Override a room's interval until `now + duration`.
    pub fn set_temporary_interval(
        &mut self,
        room: &str,
        interval: Duration,
        duration: Duration,
        now: DateTime<Utc>,
    ) -> Result<DateTime<Utc>, ScheduleError> {
        let interval = to_delta(interval)?;
        let lifetime = TimeDelta::from_std(duration).map_err(|_| ScheduleError::OutOfRange(duration))?;
        let expires_at = now
            .checked_add_signed(lifetime)
            .ok_or(ScheduleError::OutOfRange(duration))?;

        let state = self
            .rooms
            .get_mut(room)
            .ok_or_else(|| ScheduleError::UnknownRoom(room.to_string()))?;
        state.temporary = Some(Override {
            interval,
            expires_at,
        });

        tracing::info!(
            room = %room,
            interval_secs = interval.num_seconds(),
            expires_at = %expires_at,
            "Temporary scan interval set"
        );
        Ok(expires_at)
    }

    pub fn clear_temporary_interval(&mut self, room: &str) -> Result<(), ScheduleError> {
        let state = self
            .rooms
            .get_mut(room)
            .ok_or_else(|| ScheduleError::UnknownRoom(room.to_string()))?;
        state.temporary = None;
        Ok(())
    }

    /// Interval in force for `room` at `now`. Unknown rooms get the default.
    pub fn effective_interval(&self, room: &str, now: DateTime<Utc>) -> Duration {
        let delta = self
            .rooms
            .get(room)
            .and_then(|s| s.temporary)
            .filter(|o| o.expires_at > now)
            .map(|o| o.interval)
            .unwrap_or(self.default_interval);
        delta.to_std().unwrap_or(Duration::ZERO)
    }

    /// A room is due when it has never been scanned or its interval elapsed.
    pub fn is_due(&self, room: &str, now: DateTime<Utc>) -> bool {
        let Some(state) = self.rooms.get(room) else {
            return false;
        };
        match state.last_scanned {
            None => true,
            Some(last) => {
                let elapsed = (now - last).to_std().unwrap_or(Duration::ZERO);
                elapsed >= self.effective_interval(room, now)
            }
        }
    }

    /// Due rooms, sorted by name.
    pub fn due_rooms(&self, now: DateTime<Utc>) -> Vec<String> {
        let mut due: Vec<String> = self
            .rooms
            .keys()
            .filter(|room| self.is_due(room, now))
            .cloned()
            .collect();
        due.sort();
        due
    }

    pub fn mark_scanned(&mut self, room: &str, now: DateTime<Utc>) {
        if let Some(state) = self.rooms.get_mut(room) {
            state.last_scanned = Some(now);
        }
    }

    /// Drop expired overrides. Returns how many were removed.
    pub fn cleanup_expired(&mut self, now: DateTime<Utc>) -> usize {
        let mut removed = 0;
        for (room, state) in &mut self.rooms {
            if state.temporary.is_some_and(|o| o.expires_at <= now) {
                state.temporary = None;
                removed += 1;
                tracing::info!(room = %room, "Temporary scan interval expired");
            }
        }
        removed
    }
}

fn to_delta(interval: Duration) -> Result<TimeDelta, ScheduleError> {
    if interval.as_secs() == 0 {
        return Err(ScheduleError::ZeroInterval);
    }
    TimeDelta::from_std(interval).map_err(|_| ScheduleError::OutOfRange(interval))
}
