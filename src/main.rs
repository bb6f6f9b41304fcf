//! Beacon - campus-safety emergency alert service.
//!
//! # API Endpoints
//!
//! - `POST /alerts` - Submit an emergency alert
//! - `GET /alerts` - List alerts (newest-first, status filter, limit)
//! - `GET /alerts/summary` - Per-status counts
//! - `GET /alerts/:id` - Fetch one alert
//! - `PATCH /alerts/:id` - Operator transition (status, acknowledge, notes)
//! - `GET /ws` - Operator live event channel
//! - `GET /health` - Health check
//!
//! # Configuration (environment)
//!
//! - `BEACON_PORT` - listen port (default 3000)
//! - `BEACON_DATABASE_URL` - SQLite URL (default `sqlite:beacon.db?mode=rwc`)
//! - `BEACON_SMTP_URL` - SMTP transport URL; escalation disabled if unset
//! - `BEACON_SMTP_FROM` - sender mailbox for escalation email
//! - `BEACON_ALERT_RECIPIENTS` - comma-separated operator mailing list
//! - `BEACON_DASHBOARD_URL` - base URL for dashboard deep links in email
//! - `BEACON_CAMPUS_TOKENS` - comma-separated known campus tokens

use std::env;
use std::net::SocketAddr;
use std::sync::Arc;

use lettre::message::Mailbox;
use tokio::net::TcpListener;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use beacon::abuse::AbuseGuard;
use beacon::api::{AppState, router};
use beacon::email::EmailEscalation;
use beacon::fanout::NotificationFanout;
use beacon::lifecycle::{AlertService, CampusDirectory};
use beacon::storage::Storage;

/// Default port if not specified via environment variable.
const DEFAULT_PORT: u16 = 3000;

/// Default database path if not specified via environment variable.
const DEFAULT_DB_PATH: &str = "sqlite:beacon.db?mode=rwc";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing with environment filter
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env().add_directive("beacon=info".parse()?))
        .init();

    // Load configuration from environment
    let port: u16 = env::var("BEACON_PORT")
        .ok()
        .and_then(|p| p.parse().ok())
        .unwrap_or(DEFAULT_PORT);

    let db_url = env::var("BEACON_DATABASE_URL").unwrap_or_else(|_| DEFAULT_DB_PATH.to_string());

    info!(port, db_url = %db_url, "Starting Beacon server");

    // Initialize storage
    let storage = Storage::new(&db_url).await?;
    info!("Database initialized");

    let email = Arc::new(email_from_env()?);
    if email.is_enabled() {
        info!("Email escalation enabled");
    } else {
        warn!("Email escalation disabled (no SMTP transport or recipients configured)");
    }

    let campus = CampusDirectory::new(
        env::var("BEACON_CAMPUS_TOKENS")
            .unwrap_or_default()
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(String::from),
    );

    let fanout = NotificationFanout::new();
    let service = Arc::new(AlertService::new(
        storage,
        Arc::new(AbuseGuard::new()),
        fanout.clone(),
        email,
        campus,
    ));

    let app = router(AppState { service, fanout });

    // Start server
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr).await?;

    info!(%addr, "Beacon is listening");

    axum::serve(listener, app).await?;

    Ok(())
}

/// Build the escalation channel from environment, disabled when incomplete.
fn email_from_env() -> anyhow::Result<EmailEscalation> {
    let Ok(smtp_url) = env::var("BEACON_SMTP_URL") else {
        return Ok(EmailEscalation::disabled());
    };
    let Ok(from) = env::var("BEACON_SMTP_FROM") else {
        warn!("BEACON_SMTP_URL set but BEACON_SMTP_FROM missing; escalation disabled");
        return Ok(EmailEscalation::disabled());
    };

    let sender: Mailbox = from
        .parse()
        .map_err(|e| anyhow::anyhow!("invalid BEACON_SMTP_FROM: {e}"))?;

    let recipients: Vec<Mailbox> = env::var("BEACON_ALERT_RECIPIENTS")
        .unwrap_or_default()
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| {
            s.parse()
                .map_err(|e| anyhow::anyhow!("invalid recipient {s}: {e}"))
        })
        .collect::<anyhow::Result<_>>()?;

    if recipients.is_empty() {
        warn!("No BEACON_ALERT_RECIPIENTS configured; escalation disabled");
        return Ok(EmailEscalation::disabled());
    }

    let dashboard_url = env::var("BEACON_DASHBOARD_URL").ok();
    EmailEscalation::new(&smtp_url, sender, recipients, dashboard_url)
}
