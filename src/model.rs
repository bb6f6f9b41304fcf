//! Data models for Beacon.
//!
//! An [`EmergencyAlert`] is the durable record of one emergency report: where
//! it happened, what kind of emergency it is, who reported it (a snapshot,
//! never a live reference), and where it sits in the status lifecycle.
//!
//! Lifecycle rules live on [`AlertStatus`]; everything else here is plain
//! data plus the request/response shapes the HTTP API speaks.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Kind of emergency being reported.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EmergencyType {
    Medical,
    Fire,
    Security,
    NaturalDisaster,
    Other,
}

impl EmergencyType {
    /// Stable string form used in the database and event payloads.
    pub fn as_str(self) -> &'static str {
        match self {
            EmergencyType::Medical => "medical",
            EmergencyType::Fire => "fire",
            EmergencyType::Security => "security",
            EmergencyType::NaturalDisaster => "natural_disaster",
            EmergencyType::Other => "other",
        }
    }

    /// Parse the database string form. Unknown values map to `Other` so a
    /// schema migration can never make historical rows unreadable.
    pub fn from_db(s: &str) -> Self {
        match s {
            "medical" => EmergencyType::Medical,
            "fire" => EmergencyType::Fire,
            "security" => EmergencyType::Security,
            "natural_disaster" => EmergencyType::NaturalDisaster,
            _ => EmergencyType::Other,
        }
    }
}

/// Lifecycle state of an alert.
///
/// The allowed transitions form a small DAG:
///
/// ```text
/// active ──► investigating ──► resolved
///    │              │
///    │              └────────► false_alarm
///    ├────────────────────────► resolved
///    └────────────────────────► false_alarm
/// ```
///
/// `resolved` and `false_alarm` are terminal. Acknowledgement is an
/// orthogonal flag, not a state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertStatus {
    Active,
    Investigating,
    Resolved,
    FalseAlarm,
}

impl AlertStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            AlertStatus::Active => "active",
            AlertStatus::Investigating => "investigating",
            AlertStatus::Resolved => "resolved",
            AlertStatus::FalseAlarm => "false_alarm",
        }
    }

    pub fn from_db(s: &str) -> Self {
        match s {
            "investigating" => AlertStatus::Investigating,
            "resolved" => AlertStatus::Resolved,
            "false_alarm" => AlertStatus::FalseAlarm,
            _ => AlertStatus::Active,
        }
    }

    /// Whether no further status transition is allowed from this state.
    pub fn is_terminal(self) -> bool {
        matches!(self, AlertStatus::Resolved | AlertStatus::FalseAlarm)
    }

    /// Whether moving from `self` to `next` is allowed by the lifecycle.
    pub fn can_transition_to(self, next: AlertStatus) -> bool {
        match self {
            AlertStatus::Active => matches!(
                next,
                AlertStatus::Investigating | AlertStatus::Resolved | AlertStatus::FalseAlarm
            ),
            AlertStatus::Investigating => {
                matches!(next, AlertStatus::Resolved | AlertStatus::FalseAlarm)
            }
            AlertStatus::Resolved | AlertStatus::FalseAlarm => false,
        }
    }
}

/// Geographic coordinates, when the reporting client shared them.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoPoint {
    pub latitude: f64,
    pub longitude: f64,
}

/// Where the emergency is.
///
/// At least one of `location_id` (a known campus location) or `building`
/// (free text) must be present at submission time; `area` and `coordinates`
/// only refine the picture.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AlertLocation {
    /// Identifier of a named campus location, if the reporter picked one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub location_id: Option<String>,

    /// Free-text building name.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub building: Option<String>,

    /// Free-text area within the building ("3rd floor stairwell").
    #[serde(skip_serializing_if = "Option::is_none")]
    pub area: Option<String>,

    /// Device coordinates, if shared.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub coordinates: Option<GeoPoint>,
}

impl AlertLocation {
    /// The submission invariant: a named location or a building name exists.
    pub fn has_reference(&self) -> bool {
        let named = self
            .location_id
            .as_deref()
            .is_some_and(|s| !s.trim().is_empty());
        let building = self
            .building
            .as_deref()
            .is_some_and(|s| !s.trim().is_empty());
        named || building
    }
}

/// Identity snapshot of the reporting user, copied at submission time.
///
/// Later edits to the user's account never alter historical alert records.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReporterIdentity {
    pub user_id: String,
    pub display_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub campus_id: Option<String>,
    pub role: String,
}

/// A single emergency alert with its full lifecycle state.
#[derive(Debug, Clone, Serialize)]
pub struct EmergencyAlert {
    /// Opaque unique identifier, assigned at creation.
    pub id: Uuid,

    /// Creation time (server-assigned, UTC).
    pub timestamp: DateTime<Utc>,

    pub location: AlertLocation,
    pub emergency_type: EmergencyType,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    /// Snapshot of who reported, captured at submission.
    pub reported_by: ReporterIdentity,

    /// True if a valid campus verification token accompanied the submission.
    pub is_verified_device: bool,

    /// Abuse-tracking key only; never used to re-identify a person.
    #[serde(skip_serializing)]
    pub device_fingerprint: String,

    /// Reporter-supplied callback contact, explicitly opt-in.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub contact_info: Option<String>,

    pub status: AlertStatus,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub acknowledged_by: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub acknowledged_at: Option<DateTime<Utc>>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub resolved_by: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resolved_at: Option<DateTime<Utc>>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub admin_notes: Option<String>,
}

/// Validated submission input handed to the store.
///
/// Built by the lifecycle controller from a [`SubmitRequest`] plus the
/// authenticated reporter identity and the derived abuse key.
#[derive(Debug, Clone)]
pub struct AlertDraft {
    pub location: AlertLocation,
    pub emergency_type: EmergencyType,
    pub description: Option<String>,
    pub reported_by: ReporterIdentity,
    pub is_verified_device: bool,
    pub device_fingerprint: String,
    pub contact_info: Option<String>,
}

/// Request body for POST /alerts.
#[derive(Debug, Clone, Deserialize)]
pub struct SubmitRequest {
    #[serde(default)]
    pub location_id: Option<String>,
    #[serde(default)]
    pub building: Option<String>,
    #[serde(default)]
    pub area: Option<String>,
    #[serde(default)]
    pub coordinates: Option<GeoPoint>,

    pub emergency_type: EmergencyType,

    #[serde(default)]
    pub description: Option<String>,

    /// Opt-in callback contact (phone or email).
    #[serde(default)]
    pub contact_info: Option<String>,

    /// Proof-of-campus token; checked against the campus directory oracle.
    #[serde(default)]
    pub campus_token: Option<String>,
}

impl SubmitRequest {
    pub fn location(&self) -> AlertLocation {
        AlertLocation {
            location_id: self.location_id.clone(),
            building: self.building.clone(),
            area: self.area.clone(),
            coordinates: self.coordinates,
        }
    }
}

/// Response body for a successful POST /alerts.
#[derive(Debug, Clone, Serialize)]
pub struct SubmitReceipt {
    pub alert_id: Uuid,
    pub timestamp: DateTime<Utc>,
}

/// Request body for PATCH /alerts/:id.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TransitionRequest {
    #[serde(default)]
    pub status: Option<AlertStatus>,
    #[serde(default)]
    pub acknowledge: Option<bool>,
    #[serde(default)]
    pub admin_notes: Option<String>,
}

impl TransitionRequest {
    pub fn is_empty(&self) -> bool {
        self.status.is_none() && self.acknowledge.is_none() && self.admin_notes.is_none()
    }
}

/// Query parameters for GET /alerts.
#[derive(Debug, Deserialize)]
pub struct ListQuery {
    #[serde(default)]
    pub status: Option<AlertStatus>,

    /// Maximum number of alerts to return (default: 50).
    #[serde(default = "default_list_limit")]
    pub limit: u32,
}

fn default_list_limit() -> u32 {
    50
}

/// Response for GET /alerts.
#[derive(Debug, Serialize)]
pub struct AlertListResponse {
    pub alerts: Vec<EmergencyAlert>,
    pub count: usize,
}

/// One row of the per-status dashboard summary.
#[derive(Debug, Clone, Serialize)]
pub struct StatusCount {
    pub status: AlertStatus,
    pub count: i64,
}

/// Response for GET /alerts/summary.
#[derive(Debug, Serialize)]
pub struct AlertSummaryResponse {
    pub timestamp: DateTime<Utc>,
    pub counts: Vec<StatusCount>,
}

/// Maximum accepted length for the free-text description.
pub const MAX_DESCRIPTION_LEN: usize = 2000;

/// Maximum accepted length for reporter contact info.
pub const MAX_CONTACT_LEN: usize = 200;

/// Maximum accepted length for operator notes.
pub const MAX_NOTES_LEN: usize = 4000;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transition_table_from_active() {
        assert!(AlertStatus::Active.can_transition_to(AlertStatus::Investigating));
        assert!(AlertStatus::Active.can_transition_to(AlertStatus::Resolved));
        assert!(AlertStatus::Active.can_transition_to(AlertStatus::FalseAlarm));
        assert!(!AlertStatus::Active.can_transition_to(AlertStatus::Active));
    }

    #[test]
    fn test_transition_table_from_investigating() {
        assert!(AlertStatus::Investigating.can_transition_to(AlertStatus::Resolved));
        assert!(AlertStatus::Investigating.can_transition_to(AlertStatus::FalseAlarm));
        assert!(!AlertStatus::Investigating.can_transition_to(AlertStatus::Active));
        assert!(!AlertStatus::Investigating.can_transition_to(AlertStatus::Investigating));
    }

    #[test]
    fn test_terminal_states_allow_nothing() {
        for terminal in [AlertStatus::Resolved, AlertStatus::FalseAlarm] {
            assert!(terminal.is_terminal());
            for next in [
                AlertStatus::Active,
                AlertStatus::Investigating,
                AlertStatus::Resolved,
                AlertStatus::FalseAlarm,
            ] {
                assert!(!terminal.can_transition_to(next));
            }
        }
    }

    #[test]
    fn test_location_reference_invariant() {
        let empty = AlertLocation::default();
        assert!(!empty.has_reference());

        let named = AlertLocation {
            location_id: Some("lib-main".to_string()),
            ..Default::default()
        };
        assert!(named.has_reference());

        let building = AlertLocation {
            building: Some("Library".to_string()),
            ..Default::default()
        };
        assert!(building.has_reference());

        // Whitespace-only values do not satisfy the invariant
        let blank = AlertLocation {
            location_id: Some("   ".to_string()),
            building: Some(String::new()),
            ..Default::default()
        };
        assert!(!blank.has_reference());

        // Coordinates alone are not enough
        let coords_only = AlertLocation {
            coordinates: Some(GeoPoint {
                latitude: 40.0,
                longitude: -75.0,
            }),
            ..Default::default()
        };
        assert!(!coords_only.has_reference());
    }

    #[test]
    fn test_status_serde_snake_case() {
        let json = serde_json::to_string(&AlertStatus::FalseAlarm).unwrap();
        assert_eq!(json, r#""false_alarm""#);

        let parsed: AlertStatus = serde_json::from_str(r#""investigating""#).unwrap();
        assert_eq!(parsed, AlertStatus::Investigating);
    }

    #[test]
    fn test_emergency_type_db_round_trip() {
        for ty in [
            EmergencyType::Medical,
            EmergencyType::Fire,
            EmergencyType::Security,
            EmergencyType::NaturalDisaster,
            EmergencyType::Other,
        ] {
            assert_eq!(EmergencyType::from_db(ty.as_str()), ty);
        }
        // Unknown strings degrade to Other rather than failing
        assert_eq!(EmergencyType::from_db("earthquake"), EmergencyType::Other);
    }

    #[test]
    fn test_submit_request_builds_location() {
        let body = r#"{
            "building": "Science Hall",
            "area": "Lab 2",
            "emergency_type": "fire",
            "description": "smoke in the hallway"
        }"#;
        let request: SubmitRequest = serde_json::from_str(body).unwrap();
        let location = request.location();
        assert!(location.has_reference());
        assert_eq!(location.building.as_deref(), Some("Science Hall"));
        assert_eq!(request.emergency_type, EmergencyType::Fire);
        assert!(request.campus_token.is_none());
    }
}
