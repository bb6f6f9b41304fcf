//! Real-time push of alert events to connected operator sessions.
//!
//! [`NotificationFanout`] keeps a registry of live sessions, each tagged with
//! its role-derived group memberships (`admins`, `police`) and holding an
//! unbounded channel the WebSocket task drains. Broadcasting walks the
//! registry once and delivers to every session belonging to at least one of
//! the target groups, so a session in both groups still receives each event
//! exactly once per broadcast.
//!
//! Delivery is at-most-once per connected session: there is no queueing for
//! sessions that are offline at broadcast time, and no replay on reconnect.
//! Late joiners catch up through the list endpoint.
//!
//! The registry is shared mutable state across all connections; membership
//! changes and broadcasts serialize on one mutex, and sends themselves are
//! non-blocking (unbounded channel), so a broadcast never waits on a slow
//! consumer.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::model::{AlertLocation, AlertStatus, EmergencyAlert, EmergencyType};

/// Logical operator group a session can join.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperatorGroup {
    Admins,
    Police,
}

/// Event pushed over the live channel.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AlertEvent {
    /// Full summary of a newly submitted alert.
    NewAlert {
        alert_id: Uuid,
        location: AlertLocation,
        emergency_type: EmergencyType,
        timestamp: DateTime<Utc>,
        #[serde(skip_serializing_if = "Option::is_none")]
        description: Option<String>,
    },
    /// Status-only follow-up for an already-broadcast alert.
    StatusUpdate { alert_id: Uuid, status: AlertStatus },
}

impl AlertEvent {
    pub fn new_alert(alert: &EmergencyAlert) -> Self {
        AlertEvent::NewAlert {
            alert_id: alert.id,
            location: alert.location.clone(),
            emergency_type: alert.emergency_type,
            timestamp: alert.timestamp,
            description: alert.description.clone(),
        }
    }

    pub fn status_update(alert_id: Uuid, status: AlertStatus) -> Self {
        AlertEvent::StatusUpdate { alert_id, status }
    }
}

struct SessionEntry {
    groups: Vec<OperatorGroup>,
    tx: mpsc::UnboundedSender<AlertEvent>,
}

/// Registry of connected operator sessions, shared by all handlers.
#[derive(Clone)]
pub struct NotificationFanout {
    sessions: Arc<Mutex<HashMap<Uuid, SessionEntry>>>,
}

impl Default for NotificationFanout {
    fn default() -> Self {
        Self::new()
    }
}

impl NotificationFanout {
    pub fn new() -> Self {
        Self {
            sessions: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Register a new session in the given groups.
    ///
    /// Returns the session id and the receiving end the connection task
    /// drains. The session carries no alert state; it exists only until
    /// [`NotificationFanout::deregister`] (or until its receiver is dropped,
    /// after which the next broadcast prunes it).
    pub fn register(
        &self,
        groups: &[OperatorGroup],
    ) -> (Uuid, mpsc::UnboundedReceiver<AlertEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let session_id = Uuid::new_v4();
        let mut sessions = self.sessions.lock().unwrap_or_else(|e| e.into_inner());
        sessions.insert(
            session_id,
            SessionEntry {
                groups: groups.to_vec(),
                tx,
            },
        );
        (session_id, rx)
    }

    /// Remove a session on disconnect. Unknown ids are ignored.
    pub fn deregister(&self, session_id: Uuid) {
        let mut sessions = self.sessions.lock().unwrap_or_else(|e| e.into_inner());
        sessions.remove(&session_id);
    }

    /// Number of currently registered sessions.
    pub fn session_count(&self) -> usize {
        let sessions = self.sessions.lock().unwrap_or_else(|e| e.into_inner());
        sessions.len()
    }

    /// Push a "new alert" event to every admin and police session.
    ///
    /// Returns the number of sessions the event was handed to. Zero
    /// registered sessions is not an error; the caller logs the count.
    pub fn broadcast_new_alert(&self, alert: &EmergencyAlert) -> usize {
        self.broadcast(
            AlertEvent::new_alert(alert),
            &[OperatorGroup::Admins, OperatorGroup::Police],
        )
    }

    /// Push a status-only event to every admin and police session.
    pub fn broadcast_status_update(&self, alert_id: Uuid, status: AlertStatus) -> usize {
        self.broadcast(
            AlertEvent::status_update(alert_id, status),
            &[OperatorGroup::Admins, OperatorGroup::Police],
        )
    }

    fn broadcast(&self, event: AlertEvent, groups: &[OperatorGroup]) -> usize {
        let mut sessions = self.sessions.lock().unwrap_or_else(|e| e.into_inner());
        let mut delivered = 0;
        let mut dead = Vec::new();

        for (id, entry) in sessions.iter() {
            if !entry.groups.iter().any(|g| groups.contains(g)) {
                continue;
            }
            // One send per session regardless of how many groups overlap
            if entry.tx.send(event.clone()).is_ok() {
                delivered += 1;
            } else {
                dead.push(*id);
            }
        }

        for id in dead {
            sessions.remove(&id);
        }

        delivered
    }
}
