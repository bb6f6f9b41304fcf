//! SQLite storage layer for Beacon.
//!
//! The schema is a single `alerts` table holding the full
//! [`EmergencyAlert`](crate::model::EmergencyAlert) record, including the
//! reporter identity snapshot (copied at submission, never a live foreign
//! key). Timestamps are stored as Unix milliseconds so newest-first ordering
//! survives bursts of submissions within the same second.
//!
//! Acknowledgement is written with a single conditional `UPDATE ... WHERE
//! acknowledged_at IS NULL`, so two operators racing to acknowledge cannot
//! both win.

use chrono::{DateTime, Utc};
use sqlx::Row;
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions, SqliteRow};
use uuid::Uuid;

use crate::error::AlertError;
use crate::model::{
    AlertDraft, AlertLocation, AlertStatus, EmergencyAlert, EmergencyType, GeoPoint,
    ReporterIdentity, StatusCount,
};

/// Database connection pool wrapper.
#[derive(Clone)]
pub struct Storage {
    pool: SqlitePool,
}

impl Storage {
    /// Create a new storage instance and initialize the schema.
    ///
    /// # Arguments
    ///
    /// * `database_url` - SQLite connection string (e.g., "sqlite:beacon.db" or "sqlite::memory:")
    pub async fn new(database_url: &str) -> anyhow::Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(database_url)
            .await?;

        let storage = Self { pool };
        storage.initialize_schema().await?;

        Ok(storage)
    }

    /// Create the database schema if it doesn't exist.
    async fn initialize_schema(&self) -> anyhow::Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS alerts (
                id TEXT PRIMARY KEY,
                ts INTEGER NOT NULL,
                location_id TEXT,
                building TEXT,
                area TEXT,
                latitude REAL,
                longitude REAL,
                emergency_type TEXT NOT NULL,
                description TEXT,
                reporter_user_id TEXT NOT NULL,
                reporter_name TEXT NOT NULL,
                reporter_campus_id TEXT,
                reporter_role TEXT NOT NULL,
                is_verified_device INTEGER NOT NULL DEFAULT 0,
                device_fingerprint TEXT NOT NULL,
                contact_info TEXT,
                status TEXT NOT NULL DEFAULT 'active',
                acknowledged_by TEXT,
                acknowledged_at INTEGER,
                resolved_by TEXT,
                resolved_at INTEGER,
                admin_notes TEXT
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        // Index for status-filtered, newest-first listing
        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_alerts_status_ts
            ON alerts(status, ts)
            "#,
        )
        .execute(&self.pool)
        .await?;

        // Index for location-based dashboard aggregation
        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_alerts_location
            ON alerts(location_id, building)
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Persist a new alert, assigning its id and timestamp.
    ///
    /// Fails with [`AlertError::Validation`] when the draft's location lacks
    /// both a named location id and a building name.
    pub async fn create_alert(&self, draft: AlertDraft) -> Result<EmergencyAlert, AlertError> {
        if !draft.location.has_reference() {
            return Err(AlertError::validation(
                "location must include a campus location id or a building name",
            ));
        }

        let alert = EmergencyAlert {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            location: draft.location,
            emergency_type: draft.emergency_type,
            description: draft.description,
            reported_by: draft.reported_by,
            is_verified_device: draft.is_verified_device,
            device_fingerprint: draft.device_fingerprint,
            contact_info: draft.contact_info,
            status: AlertStatus::Active,
            acknowledged_by: None,
            acknowledged_at: None,
            resolved_by: None,
            resolved_at: None,
            admin_notes: None,
        };

        sqlx::query(
            r#"
            INSERT INTO alerts (
                id, ts, location_id, building, area, latitude, longitude,
                emergency_type, description,
                reporter_user_id, reporter_name, reporter_campus_id, reporter_role,
                is_verified_device, device_fingerprint, contact_info, status
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(alert.id.to_string())
        .bind(alert.timestamp.timestamp_millis())
        .bind(&alert.location.location_id)
        .bind(&alert.location.building)
        .bind(&alert.location.area)
        .bind(alert.location.coordinates.map(|c| c.latitude))
        .bind(alert.location.coordinates.map(|c| c.longitude))
        .bind(alert.emergency_type.as_str())
        .bind(&alert.description)
        .bind(&alert.reported_by.user_id)
        .bind(&alert.reported_by.display_name)
        .bind(&alert.reported_by.campus_id)
        .bind(&alert.reported_by.role)
        .bind(i64::from(alert.is_verified_device))
        .bind(&alert.device_fingerprint)
        .bind(&alert.contact_info)
        .bind(alert.status.as_str())
        .execute(&self.pool)
        .await?;

        Ok(alert)
    }

    /// Fetch one alert by id.
    pub async fn get_alert(&self, id: Uuid) -> Result<EmergencyAlert, AlertError> {
        let row = sqlx::query("SELECT * FROM alerts WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?;

        row.map(|r| row_to_alert(&r)).ok_or(AlertError::NotFound)
    }

    /// List alerts newest-first, optionally filtered by status.
    pub async fn list_alerts(
        &self,
        status: Option<AlertStatus>,
        limit: u32,
    ) -> Result<Vec<EmergencyAlert>, AlertError> {
        let rows = match status {
            Some(status) => {
                sqlx::query(
                    r#"
                    SELECT * FROM alerts
                    WHERE status = ?
                    ORDER BY ts DESC, rowid DESC
                    LIMIT ?
                    "#,
                )
                .bind(status.as_str())
                .bind(i64::from(limit))
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query(
                    r#"
                    SELECT * FROM alerts
                    ORDER BY ts DESC, rowid DESC
                    LIMIT ?
                    "#,
                )
                .bind(i64::from(limit))
                .fetch_all(&self.pool)
                .await?
            }
        };

        Ok(rows.iter().map(row_to_alert).collect())
    }

    /// Record the first acknowledgement of an alert.
    ///
    /// A single conditional update: only the first operator to acknowledge
    /// writes `acknowledged_by`/`acknowledged_at`; later calls change nothing
    /// and report `false`.
    pub async fn acknowledge(
        &self,
        id: Uuid,
        operator_id: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, AlertError> {
        let result = sqlx::query(
            r#"
            UPDATE alerts
            SET acknowledged_by = ?, acknowledged_at = ?
            WHERE id = ? AND acknowledged_at IS NULL
            "#,
        )
        .bind(operator_id)
        .bind(now.timestamp_millis())
        .bind(id.to_string())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Apply a status transition.
    ///
    /// Returns `true` when the status actually changed, `false` when the
    /// requested status equals the current one (a no-op, not an error).
    /// An out-of-table transition fails with [`AlertError::Validation`];
    /// an unknown id fails with [`AlertError::NotFound`].
    pub async fn set_status(
        &self,
        id: Uuid,
        next: AlertStatus,
        operator_id: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, AlertError> {
        let current = self.get_alert(id).await?;

        if current.status == next {
            return Ok(false);
        }
        if !current.status.can_transition_to(next) {
            return Err(AlertError::Validation(format!(
                "cannot transition from {} to {}",
                current.status.as_str(),
                next.as_str()
            )));
        }

        if next.is_terminal() {
            sqlx::query(
                r#"
                UPDATE alerts
                SET status = ?, resolved_by = ?, resolved_at = ?
                WHERE id = ?
                "#,
            )
            .bind(next.as_str())
            .bind(operator_id)
            .bind(now.timestamp_millis())
            .bind(id.to_string())
            .execute(&self.pool)
            .await?;
        } else {
            sqlx::query("UPDATE alerts SET status = ? WHERE id = ?")
                .bind(next.as_str())
                .bind(id.to_string())
                .execute(&self.pool)
                .await?;
        }

        Ok(true)
    }

    /// Replace the operator notes on an alert (last write wins).
    pub async fn update_notes(&self, id: Uuid, notes: &str) -> Result<(), AlertError> {
        let result = sqlx::query("UPDATE alerts SET admin_notes = ? WHERE id = ?")
            .bind(notes)
            .bind(id.to_string())
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(AlertError::NotFound);
        }
        Ok(())
    }

    /// Count alerts per status for the dashboard summary.
    pub async fn status_counts(&self) -> Result<Vec<StatusCount>, AlertError> {
        let rows = sqlx::query(
            r#"
            SELECT status, COUNT(*) as total
            FROM alerts
            GROUP BY status
            ORDER BY status
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .iter()
            .map(|r| StatusCount {
                status: AlertStatus::from_db(r.get("status")),
                count: r.get("total"),
            })
            .collect())
    }
}

fn row_to_alert(row: &SqliteRow) -> EmergencyAlert {
    let id: String = row.get("id");
    let ts: i64 = row.get("ts");

    let latitude: Option<f64> = row.get("latitude");
    let longitude: Option<f64> = row.get("longitude");
    let coordinates = match (latitude, longitude) {
        (Some(latitude), Some(longitude)) => Some(GeoPoint {
            latitude,
            longitude,
        }),
        _ => None,
    };

    let emergency_type: String = row.get("emergency_type");
    let status: String = row.get("status");
    let acknowledged_at: Option<i64> = row.get("acknowledged_at");
    let resolved_at: Option<i64> = row.get("resolved_at");

    EmergencyAlert {
        id: Uuid::parse_str(&id).unwrap_or_else(|_| Uuid::nil()),
        timestamp: millis_to_datetime(ts),
        location: AlertLocation {
            location_id: row.get("location_id"),
            building: row.get("building"),
            area: row.get("area"),
            coordinates,
        },
        emergency_type: EmergencyType::from_db(&emergency_type),
        description: row.get("description"),
        reported_by: ReporterIdentity {
            user_id: row.get("reporter_user_id"),
            display_name: row.get("reporter_name"),
            campus_id: row.get("reporter_campus_id"),
            role: row.get("reporter_role"),
        },
        is_verified_device: row.get::<i64, _>("is_verified_device") != 0,
        device_fingerprint: row.get("device_fingerprint"),
        contact_info: row.get("contact_info"),
        status: AlertStatus::from_db(&status),
        acknowledged_by: row.get("acknowledged_by"),
        acknowledged_at: acknowledged_at.map(millis_to_datetime),
        resolved_by: row.get("resolved_by"),
        resolved_at: resolved_at.map(millis_to_datetime),
        admin_notes: row.get("admin_notes"),
    }
}

fn millis_to_datetime(ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap_or(DateTime::UNIX_EPOCH)
}
