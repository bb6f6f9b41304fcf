//! Alert lifecycle orchestration.
//!
//! [`AlertService`] owns the intake pipeline (abuse gate, validation,
//! persistence, fan-out, email escalation) and operator-driven transitions.
//! Persistence failures abort the operation; fan-out and email are strictly
//! best-effort: their outcomes are logged here and never surfaced to the
//! reporter or the operator. The caller-visible response for a submission is
//! complete as soon as the record is persisted.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::abuse::AbuseGuard;
use crate::email::EmailEscalation;
use crate::error::AlertError;
use crate::fanout::NotificationFanout;
use crate::model::{
    AlertDraft, EmergencyAlert, ListQuery, MAX_CONTACT_LEN, MAX_DESCRIPTION_LEN, MAX_NOTES_LEN,
    ReporterIdentity, StatusCount, SubmitReceipt, SubmitRequest, TransitionRequest,
};
use crate::storage::Storage;

/// Boolean "is this token known" oracle backed by the campus account system.
///
/// Tokens prove that the submitting device belongs to a verified campus
/// account; they carry no identity of their own.
pub struct CampusDirectory {
    known_tokens: HashSet<String>,
}

impl CampusDirectory {
    pub fn new(tokens: impl IntoIterator<Item = String>) -> Self {
        Self {
            known_tokens: tokens.into_iter().collect(),
        }
    }

    /// Directory that recognizes no tokens.
    pub fn empty() -> Self {
        Self::new([])
    }

    pub fn is_known(&self, token: &str) -> bool {
        self.known_tokens.contains(token)
    }
}

/// Orchestrates alert intake and status transitions.
pub struct AlertService {
    storage: Storage,
    guard: Arc<AbuseGuard>,
    fanout: NotificationFanout,
    email: Arc<EmailEscalation>,
    campus: CampusDirectory,
}

impl AlertService {
    pub fn new(
        storage: Storage,
        guard: Arc<AbuseGuard>,
        fanout: NotificationFanout,
        email: Arc<EmailEscalation>,
        campus: CampusDirectory,
    ) -> Self {
        Self {
            storage,
            guard,
            fanout,
            email,
            campus,
        }
    }

    /// Accept a new emergency alert.
    ///
    /// Pipeline: abuse gate, validation, persistence, then fire-and-forget
    /// fan-out and email. The returned receipt reflects the persisted record;
    /// notification outcomes never affect it.
    pub async fn submit(
        &self,
        request: SubmitRequest,
        reporter: ReporterIdentity,
        caller_key: &str,
    ) -> Result<SubmitReceipt, AlertError> {
        self.guard.admit_alert(caller_key, Utc::now())?;

        let location = request.location();
        if !location.has_reference() {
            return Err(AlertError::validation(
                "location must include a campus location id or a building name",
            ));
        }
        let description = bounded(request.description, MAX_DESCRIPTION_LEN, "description")?;
        let contact_info = bounded(request.contact_info, MAX_CONTACT_LEN, "contact_info")?;

        let is_verified_device = request
            .campus_token
            .as_deref()
            .is_some_and(|token| self.campus.is_known(token));

        let alert = self
            .storage
            .create_alert(AlertDraft {
                location,
                emergency_type: request.emergency_type,
                description,
                reported_by: reporter,
                is_verified_device,
                device_fingerprint: caller_key.to_string(),
                contact_info,
            })
            .await?;

        info!(
            alert_id = %alert.id,
            emergency_type = alert.emergency_type.as_str(),
            verified = alert.is_verified_device,
            "Alert recorded"
        );

        let delivered = self.fanout.broadcast_new_alert(&alert);
        if delivered == 0 {
            debug!(alert_id = %alert.id, "No operator sessions connected for broadcast");
        } else {
            info!(alert_id = %alert.id, delivered, "Alert broadcast to operator sessions");
        }

        let email = Arc::clone(&self.email);
        let escalated = alert.clone();
        tokio::spawn(async move {
            if let Err(e) = email.notify(&escalated).await {
                warn!(alert_id = %escalated.id, error = %e, "Escalation email failed");
            }
        });

        Ok(SubmitReceipt {
            alert_id: alert.id,
            timestamp: alert.timestamp,
        })
    }

    /// Apply an operator-driven change: acknowledgement, notes, status.
    ///
    /// The whole change is validated against the current record before any
    /// write lands, so a rejected request leaves the record untouched.
    /// Acknowledgement is idempotent (first operator wins). A status change
    /// triggers a status-only broadcast after the write lands; broadcast
    /// outcomes are logged and discarded.
    pub async fn transition(
        &self,
        id: Uuid,
        change: TransitionRequest,
        operator_id: &str,
    ) -> Result<EmergencyAlert, AlertError> {
        if change.is_empty() {
            return Err(AlertError::validation(
                "transition must set at least one of status, acknowledge, admin_notes",
            ));
        }

        if let Some(notes) = &change.admin_notes {
            if notes.chars().count() > MAX_NOTES_LEN {
                return Err(AlertError::validation("admin_notes too long"));
            }
        }

        if let Some(status) = change.status {
            let current = self.storage.get_alert(id).await?;
            if status != current.status && !current.status.can_transition_to(status) {
                return Err(AlertError::Validation(format!(
                    "cannot transition from {} to {}",
                    current.status.as_str(),
                    status.as_str()
                )));
            }
        }

        if change.acknowledge == Some(true) {
            let first = self.storage.acknowledge(id, operator_id, Utc::now()).await?;
            if first {
                info!(alert_id = %id, operator = operator_id, "Alert acknowledged");
            } else {
                debug!(alert_id = %id, "Alert already acknowledged");
            }
        }

        if let Some(notes) = &change.admin_notes {
            self.storage.update_notes(id, notes).await?;
        }

        if let Some(status) = change.status {
            let changed = self
                .storage
                .set_status(id, status, operator_id, Utc::now())
                .await?;
            if changed {
                let delivered = self.fanout.broadcast_status_update(id, status);
                info!(
                    alert_id = %id,
                    status = status.as_str(),
                    operator = operator_id,
                    delivered,
                    "Alert status updated"
                );
            }
        }

        self.storage.get_alert(id).await
    }

    pub async fn get(&self, id: Uuid) -> Result<EmergencyAlert, AlertError> {
        self.storage.get_alert(id).await
    }

    pub async fn list(&self, query: &ListQuery) -> Result<Vec<EmergencyAlert>, AlertError> {
        self.storage.list_alerts(query.status, query.limit).await
    }

    pub async fn status_counts(&self) -> Result<Vec<StatusCount>, AlertError> {
        self.storage.status_counts().await
    }
}

fn bounded(
    value: Option<String>,
    max_chars: usize,
    field: &str,
) -> Result<Option<String>, AlertError> {
    match value {
        Some(s) if s.chars().count() > max_chars => Err(AlertError::Validation(format!(
            "{field} exceeds {max_chars} characters"
        ))),
        other => Ok(other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fanout::{AlertEvent, OperatorGroup};
    use crate::model::{AlertStatus, EmergencyType};

    async fn service() -> AlertService {
        let storage = Storage::new("sqlite::memory:").await.unwrap();
        AlertService::new(
            storage,
            Arc::new(AbuseGuard::new()),
            NotificationFanout::new(),
            Arc::new(EmailEscalation::disabled()),
            CampusDirectory::new(["token-ok".to_string()]),
        )
    }

    fn reporter() -> ReporterIdentity {
        ReporterIdentity {
            user_id: "u-1".to_string(),
            display_name: "Reporter".to_string(),
            campus_id: Some("C1".to_string()),
            role: "student".to_string(),
        }
    }

    fn request(building: &str) -> SubmitRequest {
        SubmitRequest {
            location_id: None,
            building: Some(building.to_string()),
            area: None,
            coordinates: None,
            emergency_type: EmergencyType::Fire,
            description: Some("smoke".to_string()),
            contact_info: None,
            campus_token: None,
        }
    }

    #[tokio::test]
    async fn test_submit_creates_active_alert() {
        let service = service().await;

        let receipt = service
            .submit(request("Library"), reporter(), "fp:a")
            .await
            .unwrap();

        let alert = service.get(receipt.alert_id).await.unwrap();
        assert_eq!(alert.status, AlertStatus::Active);
        assert!(alert.acknowledged_at.is_none());
        assert_eq!(alert.device_fingerprint, "fp:a");
        assert!(!alert.is_verified_device);
    }

    #[tokio::test]
    async fn test_submit_fourth_attempt_rate_limited() {
        let service = service().await;

        for i in 0..3 {
            service
                .submit(request(&format!("Building {i}")), reporter(), "fp:same")
                .await
                .unwrap();
        }

        let rejected = service.submit(request("Library"), reporter(), "fp:same").await;
        match rejected {
            Err(AlertError::RateLimited { retry_after_secs }) => {
                assert!(retry_after_secs > 0);
            }
            other => panic!("expected RateLimited, got {other:?}"),
        }

        // Nothing persisted for the rejected attempt
        let all = service
            .list(&ListQuery {
                status: None,
                limit: 50,
            })
            .await
            .unwrap();
        assert_eq!(all.len(), 3);

        // A different caller key is unaffected
        service
            .submit(request("Gym"), reporter(), "fp:other")
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_submit_missing_location_rejected() {
        let service = service().await;

        let mut bad = request("x");
        bad.building = None;

        let result = service.submit(bad, reporter(), "fp:a").await;
        assert!(matches!(result, Err(AlertError::Validation(_))));

        let all = service
            .list(&ListQuery {
                status: None,
                limit: 50,
            })
            .await
            .unwrap();
        assert!(all.is_empty());
    }

    #[tokio::test]
    async fn test_submit_oversized_description_rejected() {
        let service = service().await;

        let mut bad = request("Library");
        bad.description = Some("x".repeat(MAX_DESCRIPTION_LEN + 1));

        let result = service.submit(bad, reporter(), "fp:a").await;
        assert!(matches!(result, Err(AlertError::Validation(_))));
    }

    #[tokio::test]
    async fn test_campus_token_sets_verified_flag() {
        let service = service().await;

        let mut verified = request("Library");
        verified.campus_token = Some("token-ok".to_string());
        let receipt = service.submit(verified, reporter(), "fp:a").await.unwrap();
        assert!(service.get(receipt.alert_id).await.unwrap().is_verified_device);

        let mut unknown = request("Gym");
        unknown.campus_token = Some("token-bogus".to_string());
        let receipt = service.submit(unknown, reporter(), "fp:b").await.unwrap();
        assert!(!service.get(receipt.alert_id).await.unwrap().is_verified_device);
    }

    #[tokio::test]
    async fn test_acknowledge_is_idempotent() {
        let service = service().await;
        let receipt = service
            .submit(request("Library"), reporter(), "fp:a")
            .await
            .unwrap();

        let ack = TransitionRequest {
            acknowledge: Some(true),
            ..Default::default()
        };
        let first = service
            .transition(receipt.alert_id, ack.clone(), "op-1")
            .await
            .unwrap();
        let second = service
            .transition(receipt.alert_id, ack, "op-2")
            .await
            .unwrap();

        assert_eq!(first.acknowledged_by.as_deref(), Some("op-1"));
        assert_eq!(second.acknowledged_by.as_deref(), Some("op-1"));
        assert_eq!(second.acknowledged_at, first.acknowledged_at);
    }

    #[tokio::test]
    async fn test_resolve_sets_resolution_and_excludes_from_active_list() {
        let service = service().await;
        let receipt = service
            .submit(request("Library"), reporter(), "fp:a")
            .await
            .unwrap();

        let resolved = service
            .transition(
                receipt.alert_id,
                TransitionRequest {
                    status: Some(AlertStatus::Resolved),
                    ..Default::default()
                },
                "op-1",
            )
            .await
            .unwrap();
        assert_eq!(resolved.status, AlertStatus::Resolved);
        assert!(resolved.resolved_at.is_some());
        assert_eq!(resolved.resolved_by.as_deref(), Some("op-1"));

        let active = service
            .list(&ListQuery {
                status: Some(AlertStatus::Active),
                limit: 50,
            })
            .await
            .unwrap();
        assert!(active.iter().all(|a| a.id != receipt.alert_id));
    }

    #[tokio::test]
    async fn test_rejected_transition_leaves_record_untouched() {
        let service = service().await;
        let receipt = service
            .submit(request("Library"), reporter(), "fp:a")
            .await
            .unwrap();

        service
            .transition(
                receipt.alert_id,
                TransitionRequest {
                    status: Some(AlertStatus::Resolved),
                    ..Default::default()
                },
                "op-1",
            )
            .await
            .unwrap();

        // An out-of-table status rejects the whole change: the bundled
        // acknowledgement and notes must not land either
        let rejected = service
            .transition(
                receipt.alert_id,
                TransitionRequest {
                    status: Some(AlertStatus::Investigating),
                    acknowledge: Some(true),
                    admin_notes: Some("should not persist".to_string()),
                },
                "op-2",
            )
            .await;
        assert!(matches!(rejected, Err(AlertError::Validation(_))));

        let alert = service.get(receipt.alert_id).await.unwrap();
        assert_eq!(alert.status, AlertStatus::Resolved);
        assert!(alert.acknowledged_by.is_none());
        assert!(alert.acknowledged_at.is_none());
        assert!(alert.admin_notes.is_none());
    }

    #[tokio::test]
    async fn test_transition_unknown_id_is_not_found() {
        let service = service().await;
        let result = service
            .transition(
                Uuid::new_v4(),
                TransitionRequest {
                    status: Some(AlertStatus::Investigating),
                    ..Default::default()
                },
                "op-1",
            )
            .await;
        assert!(matches!(result, Err(AlertError::NotFound)));
    }

    #[tokio::test]
    async fn test_empty_transition_rejected() {
        let service = service().await;
        let receipt = service
            .submit(request("Library"), reporter(), "fp:a")
            .await
            .unwrap();

        let result = service
            .transition(receipt.alert_id, TransitionRequest::default(), "op-1")
            .await;
        assert!(matches!(result, Err(AlertError::Validation(_))));
    }

    #[tokio::test]
    async fn test_events_arrive_in_causal_order() {
        let storage = Storage::new("sqlite::memory:").await.unwrap();
        let fanout = NotificationFanout::new();
        let service = AlertService::new(
            storage,
            Arc::new(AbuseGuard::new()),
            fanout.clone(),
            Arc::new(EmailEscalation::disabled()),
            CampusDirectory::empty(),
        );

        let (_session, mut rx) = fanout.register(&[OperatorGroup::Admins]);

        let receipt = service
            .submit(request("Library"), reporter(), "fp:a")
            .await
            .unwrap();
        service
            .transition(
                receipt.alert_id,
                TransitionRequest {
                    status: Some(AlertStatus::Investigating),
                    ..Default::default()
                },
                "op-1",
            )
            .await
            .unwrap();

        let first = rx.recv().await.unwrap();
        match first {
            AlertEvent::NewAlert { alert_id, .. } => assert_eq!(alert_id, receipt.alert_id),
            other => panic!("expected NewAlert first, got {other:?}"),
        }
        let second = rx.recv().await.unwrap();
        match second {
            AlertEvent::StatusUpdate { alert_id, status } => {
                assert_eq!(alert_id, receipt.alert_id);
                assert_eq!(status, AlertStatus::Investigating);
            }
            other => panic!("expected StatusUpdate second, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_notes_update_via_transition() {
        let service = service().await;
        let receipt = service
            .submit(request("Library"), reporter(), "fp:a")
            .await
            .unwrap();

        let updated = service
            .transition(
                receipt.alert_id,
                TransitionRequest {
                    admin_notes: Some("patrol dispatched".to_string()),
                    ..Default::default()
                },
                "op-1",
            )
            .await
            .unwrap();
        assert_eq!(updated.admin_notes.as_deref(), Some("patrol dispatched"));
    }
}
