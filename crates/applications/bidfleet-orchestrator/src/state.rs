//! Persisted fleet state
//!
//! The only state that outlives a cycle: when each host was first seen idle,
//! and which hosts are blacklisted. Everything else is re-read from the
//! marketplace every cycle.
//!
//! The file is rewritten after every cycle by writing a sibling temp file and
//! renaming it over the final path, so a crash mid-write leaves the previous
//! state readable.

use crate::error::{BidderError, Result};
use bidfleet_core::HostId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Per-host bookkeeping that survives restarts
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FleetState {
    /// Hosts currently suspected idle, with the time they were first seen idle.
    /// Absence means never idle or most recently healthy.
    #[serde(default)]
    pub host_active_since: BTreeMap<HostId, DateTime<Utc>>,

    /// Hosts excluded from renting and scheduled for destruction.
    /// Never shrinks during a run.
    #[serde(default)]
    pub host_blacklist: BTreeSet<HostId>,
}

impl FleetState {
    /// Whether `host` is blacklisted
    pub fn is_blacklisted(&self, host: HostId) -> bool {
        self.host_blacklist.contains(&host)
    }

    /// Blacklist `host`; returns true if it was not blacklisted before
    pub fn blacklist(&mut self, host: HostId) -> bool {
        self.host_blacklist.insert(host)
    }

    /// When `host` was first seen idle, if it is currently suspected idle
    pub fn idle_since(&self, host: HostId) -> Option<DateTime<Utc>> {
        self.host_active_since.get(&host).copied()
    }

    /// Start the idle timer for `host` unless it is already running
    pub fn mark_idle_since(&mut self, host: HostId, now: DateTime<Utc>) -> DateTime<Utc> {
        *self.host_active_since.entry(host).or_insert(now)
    }

    /// Stop the idle timer for `host`
    pub fn clear_idle(&mut self, host: HostId) {
        self.host_active_since.remove(&host);
    }
}

/// On-disk home of the [`FleetState`]
#[derive(Debug, Clone)]
pub struct StateStore {
    path: PathBuf,
}

impl StateStore {
    /// Create a store for `path`
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Final state file path
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Sibling path the next save is staged in
    pub fn temp_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_else(|| "bidfleet-state.json".into());
        name.push(".tmp");
        self.path.with_file_name(name)
    }

    /// Load the state; a missing file yields an empty state
    pub fn load(&self) -> Result<FleetState> {
        if !self.path.exists() {
            info!("No state file at {}, starting fresh", self.path.display());
            return Ok(FleetState::default());
        }

        let text = std::fs::read_to_string(&self.path)
            .map_err(|e| BidderError::state(&self.path, e))?;
        let state: FleetState =
            serde_json::from_str(&text).map_err(|e| BidderError::state(&self.path, e))?;

        info!(
            blacklisted = state.host_blacklist.len(),
            idle_timers = state.host_active_since.len(),
            "Loaded fleet state from {}",
            self.path.display()
        );
        Ok(state)
    }

    /// Atomically replace the state file with `state`
    pub fn save(&self, state: &FleetState) -> Result<()> {
        let tmp = self.temp_path();
        let json = serde_json::to_vec_pretty(state)?;

        {
            let mut file = std::fs::File::create(&tmp)
                .map_err(|e| BidderError::state(&tmp, e))?;
            file.write_all(&json)
                .map_err(|e| BidderError::state(&tmp, e))?;
            file.sync_all().map_err(|e| BidderError::state(&tmp, e))?;
        }

        std::fs::rename(&tmp, &self.path).map_err(|e| BidderError::state(&self.path, e))?;
        debug!("Saved fleet state to {}", self.path.display());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use tempfile::TempDir;

    fn ts(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).unwrap()
    }

    fn sample_state() -> FleetState {
        let mut state = FleetState::default();
        state.mark_idle_since(HostId(11), ts(1_700_000_000));
        state.blacklist(HostId(42));
        state
    }

    #[test]
    fn test_mark_idle_keeps_first_timestamp() {
        let mut state = FleetState::default();
        assert_eq!(state.mark_idle_since(HostId(1), ts(100)), ts(100));
        assert_eq!(state.mark_idle_since(HostId(1), ts(200)), ts(100));
        assert_eq!(state.idle_since(HostId(1)), Some(ts(100)));

        state.clear_idle(HostId(1));
        assert_eq!(state.idle_since(HostId(1)), None);
    }

    #[test]
    fn test_blacklist_is_a_set() {
        let mut state = FleetState::default();
        assert!(state.blacklist(HostId(5)));
        assert!(!state.blacklist(HostId(5)));
        assert!(state.is_blacklisted(HostId(5)));
        assert_eq!(state.host_blacklist.len(), 1);
    }

    #[test]
    fn test_load_missing_file_is_empty() {
        let dir = TempDir::new().unwrap();
        let store = StateStore::new(dir.path().join("state.json"));
        assert_eq!(store.load().unwrap(), FleetState::default());
    }

    #[test]
    fn test_save_and_load() {
        let dir = TempDir::new().unwrap();
        let store = StateStore::new(dir.path().join("state.json"));
        let state = sample_state();

        store.save(&state).unwrap();
        assert!(!store.temp_path().exists());
        assert_eq!(store.load().unwrap(), state);
    }

    #[test]
    fn test_file_layout() {
        let dir = TempDir::new().unwrap();
        let store = StateStore::new(dir.path().join("state.json"));
        store.save(&sample_state()).unwrap();

        let raw: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(store.path()).unwrap()).unwrap();
        assert!(raw["host_active_since"]["11"].is_string());
        assert_eq!(raw["host_blacklist"], serde_json::json!([42]));
    }

    #[test]
    fn test_interrupted_write_leaves_previous_state_readable() {
        let dir = TempDir::new().unwrap();
        let store = StateStore::new(dir.path().join("state.json"));
        let state = sample_state();
        store.save(&state).unwrap();

        // A crash mid-write leaves a truncated temp file behind
        std::fs::write(store.temp_path(), b"{\"host_active_since\": {\"1").unwrap();
        assert_eq!(store.load().unwrap(), state);

        // The next save simply replaces it
        let mut next = state.clone();
        next.blacklist(HostId(7));
        store.save(&next).unwrap();
        assert_eq!(store.load().unwrap(), next);
    }

    #[test]
    fn test_corrupt_state_file_is_an_error() {
        let dir = TempDir::new().unwrap();
        let store = StateStore::new(dir.path().join("state.json"));
        std::fs::write(store.path(), b"not json").unwrap();
        assert!(matches!(store.load(), Err(BidderError::State { .. })));
    }

    #[test]
    fn test_missing_fields_default() {
        let dir = TempDir::new().unwrap();
        let store = StateStore::new(dir.path().join("state.json"));
        std::fs::write(store.path(), b"{\"host_blacklist\": [3]}").unwrap();
        let state = store.load().unwrap();
        assert!(state.is_blacklisted(HostId(3)));
        assert!(state.host_active_since.is_empty());
    }
}
