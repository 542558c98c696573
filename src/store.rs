use std::{fs, path::PathBuf, time::Duration};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize, de::DeserializeOwned};

use crate::{core::mode::OperatingMode, prelude::*};

/// Snapshot of the mode controller, stored on shutdown and faults.
#[must_use]
#[derive(Copy, Clone, Debug, Serialize, Deserialize)]
pub struct ModeSnapshot {
    pub mode: OperatingMode,

    #[serde(with = "chrono::serde::ts_seconds")]
    pub time: DateTime<Utc>,
}

impl ModeSnapshot {
    const FRESHNESS_WINDOW: Duration = Duration::from_secs(60);

    pub fn is_resumable(&self, now: DateTime<Utc>, uptime: Duration) -> bool {
        is_resumable(self.time, now, uptime, Self::FRESHNESS_WINDOW)
    }
}

/// Snapshot of the ramp controller, stored on every state transition.
///
/// `state` stays a raw integer here so that an out-of-range value survives
/// deserialisation and can be rejected explicitly on restore.
#[must_use]
#[derive(Copy, Clone, Debug, Serialize, Deserialize)]
pub struct RampSnapshot {
    pub state: u8,

    #[serde(with = "chrono::serde::ts_seconds")]
    pub state_entry_time: DateTime<Utc>,

    #[serde(with = "chrono::serde::ts_seconds")]
    pub time: DateTime<Utc>,
}

impl RampSnapshot {
    const FRESHNESS_WINDOW: Duration = Duration::from_secs(120);

    pub fn is_resumable(&self, now: DateTime<Utc>, uptime: Duration) -> bool {
        is_resumable(self.time, now, uptime, Self::FRESHNESS_WINDOW)
    }
}

/// A snapshot may only be resumed when it is fresh enough and the system has
/// not rebooted since it was written. The system being up for less time than
/// the snapshot age proves a reboot intervened.
fn is_resumable(
    written_at: DateTime<Utc>,
    now: DateTime<Utc>,
    uptime: Duration,
    window: Duration,
) -> bool {
    let Ok(age) = (now - written_at).to_std() else {
        return false; // future-dated snapshot
    };
    age < window && uptime >= age
}

/// Durable single-snapshot store backed by a JSON file.
///
/// Persistence is a resume hint, not a correctness requirement: a missing,
/// torn or unreadable file is simply discarded.
#[must_use]
pub struct Store {
    path: PathBuf,
}

impl Store {
    pub const fn new(path: PathBuf) -> Self {
        Self { path }
    }

    #[instrument(skip_all, fields(path = %self.path.display()))]
    pub fn write<S: Serialize>(&self, snapshot: &S) -> Result {
        let payload = serde_json::to_vec(snapshot).context("failed to serialise the snapshot")?;
        fs::write(&self.path, payload)
            .with_context(|| format!("failed to write `{}`", self.path.display()))
    }

    #[instrument(skip_all, fields(path = %self.path.display()))]
    pub fn read<S: DeserializeOwned>(&self) -> Option<S> {
        let raw = match fs::read(&self.path) {
            Ok(raw) => raw,
            Err(error) => {
                info!("no usable snapshot: {error}");
                return None;
            }
        };
        match serde_json::from_slice(&raw) {
            Ok(snapshot) => Some(snapshot),
            Err(error) => {
                warn!("discarding an unreadable snapshot: {error}");
                None
            }
        }
    }
}

/// Monotonic system uptime, for the reboot check.
pub fn system_uptime() -> Result<Duration> {
    let raw = fs::read_to_string("/proc/uptime").context("failed to read `/proc/uptime`")?;
    let seconds: f64 = raw
        .split_whitespace()
        .next()
        .context("`/proc/uptime` is empty")?
        .parse()
        .context("failed to parse `/proc/uptime`")?;
    Ok(Duration::from_secs_f64(seconds))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(seconds: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(seconds, 0).unwrap()
    }

    /// The example from the operations handbook: a 30 s old snapshot is
    /// resumable on a system that has been up for 300 s, but not on one that
    /// has only been up for 10 s.
    #[test]
    fn reboot_detection() {
        let snapshot =
            RampSnapshot { state: 4, state_entry_time: at(980), time: at(1000) };
        let now = at(1030);
        assert!(snapshot.is_resumable(now, Duration::from_secs(300)));
        assert!(!snapshot.is_resumable(now, Duration::from_secs(10)));
    }

    #[test]
    fn stale_snapshot_is_rejected() {
        let snapshot = ModeSnapshot { mode: OperatingMode::On, time: at(1000) };
        assert!(!snapshot.is_resumable(at(1100), Duration::from_secs(3600)));
    }

    #[test]
    fn future_dated_snapshot_is_rejected() {
        let snapshot = ModeSnapshot { mode: OperatingMode::On, time: at(2000) };
        assert!(!snapshot.is_resumable(at(1000), Duration::from_secs(3600)));
    }

    #[test]
    fn mode_snapshot_schema_is_stable() {
        let snapshot: ModeSnapshot =
            serde_json::from_str(r#"{"mode": "ChargeOnly", "time": 1700000000}"#).unwrap();
        assert_eq!(snapshot.mode, OperatingMode::ChargeOnly);
        assert_eq!(snapshot.time.timestamp(), 1_700_000_000);
    }

    #[test]
    fn unknown_mode_is_rejected() {
        assert!(serde_json::from_str::<ModeSnapshot>(r#"{"mode": "Auto", "time": 0}"#).is_err());
    }
}
