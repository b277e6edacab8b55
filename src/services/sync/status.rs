// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! Per-flow sync status and its aggregation.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use tokio::sync::watch;

/// The two independent sync flows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlowKind {
    /// Schedule push, app to device
    Medication,
    /// Event pull, device to app
    DeviceEvents,
}

impl FlowKind {
    pub const ALL: [FlowKind; 2] = [FlowKind::Medication, FlowKind::DeviceEvents];

    pub fn as_str(&self) -> &'static str {
        match self {
            FlowKind::Medication => "medication",
            FlowKind::DeviceEvents => "device_events",
        }
    }
}

impl fmt::Display for FlowKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncStatus {
    Synced,
    Pending,
    Syncing,
    Offline,
    Error,
}

impl SyncStatus {
    /// Severity rank; the overall status is the flow with the highest rank.
    pub fn rank(&self) -> u8 {
        match self {
            SyncStatus::Synced => 0,
            SyncStatus::Pending => 1,
            SyncStatus::Syncing => 2,
            SyncStatus::Offline => 3,
            SyncStatus::Error => 4,
        }
    }
}

/// Worse of two statuses.
pub fn overall_status(a: SyncStatus, b: SyncStatus) -> SyncStatus {
    if b.rank() > a.rank() {
        b
    } else {
        a
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FlowStatus {
    pub status: SyncStatus,
    pub pending_ops: usize,
    pub last_sync: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

impl Default for FlowStatus {
    fn default() -> Self {
        Self {
            status: SyncStatus::Synced,
            pending_ops: 0,
            last_sync: None,
            last_error: None,
        }
    }
}

/// Process-wide sync status, published to subscribers on every change.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncSnapshot {
    pub overall: SyncStatus,
    pub medication: FlowStatus,
    pub device_events: FlowStatus,
    pub online: bool,
}

impl Default for SyncSnapshot {
    fn default() -> Self {
        Self {
            overall: SyncStatus::Synced,
            medication: FlowStatus::default(),
            device_events: FlowStatus::default(),
            online: true,
        }
    }
}

impl SyncSnapshot {
    pub fn flow(&self, flow: FlowKind) -> &FlowStatus {
        match flow {
            FlowKind::Medication => &self.medication,
            FlowKind::DeviceEvents => &self.device_events,
        }
    }

    fn flow_mut(&mut self, flow: FlowKind) -> &mut FlowStatus {
        match flow {
            FlowKind::Medication => &mut self.medication,
            FlowKind::DeviceEvents => &mut self.device_events,
        }
    }
}

/// Owner of the status state machine.
pub struct SyncStatusTracker {
    tx: watch::Sender<SyncSnapshot>,
}

impl Default for SyncStatusTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl SyncStatusTracker {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(SyncSnapshot::default());
        Self { tx }
    }

    pub fn snapshot(&self) -> SyncSnapshot {
        self.tx.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<SyncSnapshot> {
        self.tx.subscribe()
    }

    fn update(&self, flow: FlowKind, f: impl FnOnce(&mut FlowStatus, bool)) {
        self.tx.send_modify(|snapshot| {
            let online = snapshot.online;
            let before = snapshot.flow(flow).status;
            f(snapshot.flow_mut(flow), online);
            let after = snapshot.flow(flow).status;
            if before != after {
                tracing::debug!(flow = %flow, from = ?before, to = ?after, "Sync status changed");
            }
            snapshot.overall = overall_status(snapshot.medication.status, snapshot.device_events.status);
        });
    }

    /// New work was queued for `flow`.
    pub fn work_queued(&self, flow: FlowKind, pending_ops: usize) {
        self.update(flow, |s, online| {
            s.pending_ops = pending_ops;
            if online && matches!(s.status, SyncStatus::Synced) {
                s.status = SyncStatus::Pending;
            }
        });
    }

    /// A flush of `flow` started.
    pub fn sync_started(&self, flow: FlowKind) {
        self.update(flow, |s, online| {
            if online {
                s.status = SyncStatus::Syncing;
            }
        });
    }

    /// A flush of `flow` finished. `error` is set when entries failed or are
    /// blocked behind a failing entry.
    pub fn sync_finished(&self, flow: FlowKind, pending_ops: usize, error: Option<String>) {
        self.update(flow, |s, online| {
            s.pending_ops = pending_ops;
            if !online {
                s.status = SyncStatus::Offline;
                return;
            }
            match error {
                Some(e) => {
                    s.status = SyncStatus::Error;
                    s.last_error = Some(e);
                }
                None => {
                    s.last_error = None;
                    s.last_sync = Some(Utc::now());
                    s.status = if pending_ops == 0 {
                        SyncStatus::Synced
                    } else {
                        SyncStatus::Pending
                    };
                }
            }
        });
    }

    /// Force a flow into a given status.
    pub fn set_status(&self, flow: FlowKind, status: SyncStatus) {
        self.update(flow, |s, _| s.status = status);
    }

    /// Connectivity changed. Losing it puts every flow offline; regaining it
    /// returns offline flows to pending.
    pub fn set_online(&self, online: bool) {
        self.tx.send_modify(|snapshot| {
            snapshot.online = online;
            for flow in FlowKind::ALL {
                let s = snapshot.flow_mut(flow);
                if !online {
                    s.status = SyncStatus::Offline;
                } else if s.status == SyncStatus::Offline {
                    s.status = SyncStatus::Pending;
                }
            }
            snapshot.overall = overall_status(snapshot.medication.status, snapshot.device_events.status);
        });
        tracing::info!(online, "Sync connectivity changed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn overall_status_takes_the_worse_flow() {
        assert_eq!(overall_status(SyncStatus::Error, SyncStatus::Synced), SyncStatus::Error);
        assert_eq!(overall_status(SyncStatus::Synced, SyncStatus::Error), SyncStatus::Error);
        assert_eq!(overall_status(SyncStatus::Pending, SyncStatus::Syncing), SyncStatus::Syncing);
        assert_eq!(overall_status(SyncStatus::Offline, SyncStatus::Syncing), SyncStatus::Offline);
        assert_eq!(overall_status(SyncStatus::Synced, SyncStatus::Synced), SyncStatus::Synced);
    }

    #[test]
    fn medication_error_dominates_synced_device_flow() {
        let tracker = SyncStatusTracker::new();
        tracker.set_status(FlowKind::Medication, SyncStatus::Error);
        tracker.set_status(FlowKind::DeviceEvents, SyncStatus::Synced);
        assert_eq!(tracker.snapshot().overall, SyncStatus::Error);
    }

    #[test]
    fn flush_cycle_moves_through_states() {
        let tracker = SyncStatusTracker::new();
        tracker.work_queued(FlowKind::Medication, 2);
        assert_eq!(tracker.snapshot().medication.status, SyncStatus::Pending);

        tracker.sync_started(FlowKind::Medication);
        assert_eq!(tracker.snapshot().overall, SyncStatus::Syncing);

        tracker.sync_finished(FlowKind::Medication, 0, None);
        let snapshot = tracker.snapshot();
        assert_eq!(snapshot.medication.status, SyncStatus::Synced);
        assert!(snapshot.medication.last_sync.is_some());
        assert_eq!(snapshot.overall, SyncStatus::Synced);
    }

    #[test]
    fn failed_flush_records_error() {
        let tracker = SyncStatusTracker::new();
        tracker.sync_started(FlowKind::DeviceEvents);
        tracker.sync_finished(FlowKind::DeviceEvents, 1, Some("unavailable".to_string()));
        let snapshot = tracker.snapshot();
        assert_eq!(snapshot.device_events.status, SyncStatus::Error);
        assert_eq!(snapshot.device_events.last_error.as_deref(), Some("unavailable"));
    }

    #[test]
    fn offline_then_reconnect_returns_to_pending() {
        let tracker = SyncStatusTracker::new();
        tracker.set_online(false);
        assert_eq!(tracker.snapshot().overall, SyncStatus::Offline);

        // Queued work while offline does not leave offline
        tracker.work_queued(FlowKind::Medication, 1);
        assert_eq!(tracker.snapshot().medication.status, SyncStatus::Offline);

        tracker.set_online(true);
        let snapshot = tracker.snapshot();
        assert_eq!(snapshot.medication.status, SyncStatus::Pending);
        assert_eq!(snapshot.device_events.status, SyncStatus::Pending);
        assert!(snapshot.online);
    }
}
