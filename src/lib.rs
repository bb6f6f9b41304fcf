//! Beacon - campus-safety emergency alert service.
//!
//! # Overview
//!
//! Beacon accepts emergency alerts from campus reporters, persists them, and
//! pushes them in near-real-time to connected operator sessions (campus
//! admins and police) over WebSocket, with a best-effort email escalation as
//! a secondary channel. Operators acknowledge alerts and drive them through
//! a small status lifecycle (active, investigating, resolved, false_alarm).
//!
//! Submission is guarded against abuse by a sliding-window rate limiter
//! keyed on an opaque device fingerprint. The fingerprint exists only for
//! rate limiting; it is never used to re-identify a person.
//!
//! # Modules
//!
//! - [`model`]: Alert entity, lifecycle states, request/response types
//! - [`error`]: Error taxonomy and HTTP mapping
//! - [`storage`]: SQLite alert store
//! - [`abuse`]: Rate limiting and caller-key derivation
//! - [`fanout`]: Operator session registry and event broadcast
//! - [`email`]: Best-effort email escalation
//! - [`lifecycle`]: Submission and transition orchestration
//! - [`api`]: HTTP handlers, identity extractors, WebSocket channel

pub mod abuse;
pub mod api;
pub mod email;
pub mod error;
pub mod fanout;
pub mod lifecycle;
pub mod model;
pub mod storage;
