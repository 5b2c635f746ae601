//! # Revloop DB
//!
//! SQLite persistence for the automation engine. One database file holds
//! every tenant; all query paths are scoped through [`TenantCtx`] so
//! cross-tenant access is a type error, not a forgotten WHERE clause.
//!
//! WAL journal mode allows the gateway request path and the executor to
//! share the connection pool-of-one without "database is locked" errors.

pub mod automation;
pub mod directory;
pub mod models;

pub use models::*;

use chrono::{DateTime, SecondsFormat, Utc};
use revloop_core::error::{Result, RevloopError};
use rusqlite::Connection;
use std::path::Path;

/// Capability object proving the caller resolved a real business.
///
/// Constructed only by [`Store::tenant_ctx`]; every tenant-scoped query
/// takes one, so there is no way to run such a query against an unverified
/// or mismatched business id.
#[derive(Debug, Clone)]
pub struct TenantCtx {
    business_id: String,
}

impl TenantCtx {
    pub fn business_id(&self) -> &str {
        &self.business_id
    }
}

/// The persistence store — a single SQLite connection plus schema.
pub struct Store {
    pub(crate) conn: Connection,
}

impl Store {
    /// Open or create the database at the given path.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .map_err(|e| RevloopError::Db(format!("DB open: {e}")))?;

        // WAL for concurrent readers/writers; bounded wait on contention.
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA synchronous = NORMAL;
             PRAGMA busy_timeout = 5000;",
        )
        .map_err(|e| RevloopError::Db(format!("DB pragma: {e}")))?;

        let store = Self { conn };
        store.migrate()?;
        Ok(store)
    }

    /// Run schema migrations.
    fn migrate(&self) -> Result<()> {
        self.conn
            .execute_batch(
                "
            CREATE TABLE IF NOT EXISTS businesses (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                review_link TEXT,
                utc_offset_minutes INTEGER NOT NULL DEFAULT 0,
                quiet_hours_start INTEGER,
                quiet_hours_end INTEGER,
                hourly_send_limit INTEGER NOT NULL DEFAULT 25,
                daily_send_limit INTEGER NOT NULL DEFAULT 100,
                cooldown_days INTEGER NOT NULL DEFAULT 30,
                created_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS customers (
                id TEXT PRIMARY KEY,
                business_id TEXT NOT NULL,
                name TEXT NOT NULL,
                email TEXT,
                phone TEXT,
                external_id TEXT,
                source TEXT,
                email_opt_out INTEGER NOT NULL DEFAULT 0,
                sms_opt_out INTEGER NOT NULL DEFAULT 0,
                suppressed INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                UNIQUE(business_id, external_id, source)
            );

            CREATE TABLE IF NOT EXISTS sequences (
                id TEXT PRIMARY KEY,
                business_id TEXT NOT NULL,
                name TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'draft',
                trigger_event_type TEXT,
                allow_manual_enroll INTEGER NOT NULL DEFAULT 1,
                created_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_sequences_trigger
                ON sequences(business_id, trigger_event_type, status);

            CREATE TABLE IF NOT EXISTS sequence_steps (
                id TEXT PRIMARY KEY,
                business_id TEXT NOT NULL,
                sequence_id TEXT NOT NULL,
                step_index INTEGER NOT NULL,
                kind TEXT NOT NULL,
                wait_ms INTEGER NOT NULL DEFAULT 0,
                message_config TEXT NOT NULL DEFAULT '{}',
                created_at TEXT NOT NULL,
                UNIQUE(sequence_id, step_index)
            );

            CREATE TABLE IF NOT EXISTS sequence_enrollments (
                id TEXT PRIMARY KEY,
                business_id TEXT NOT NULL,
                sequence_id TEXT NOT NULL,
                customer_id TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'active',
                current_step_index INTEGER NOT NULL DEFAULT 0,
                next_run_at TEXT,
                last_event_at TEXT,
                attempts INTEGER NOT NULL DEFAULT 0,
                in_flight INTEGER NOT NULL DEFAULT 0,
                claimed_at TEXT,
                meta TEXT NOT NULL DEFAULT '{}',
                last_error TEXT,
                created_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_enrollments_due
                ON sequence_enrollments(status, next_run_at);
            -- Data-layer backstop for the one-active-enrollment invariant.
            CREATE UNIQUE INDEX IF NOT EXISTS idx_enrollments_one_active
                ON sequence_enrollments(sequence_id, customer_id)
                WHERE status = 'active';

            CREATE TABLE IF NOT EXISTS scheduled_jobs (
                id TEXT PRIMARY KEY,
                business_id TEXT NOT NULL,
                job_type TEXT NOT NULL,
                payload TEXT NOT NULL DEFAULT '{}',
                run_at TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'queued',
                attempts INTEGER NOT NULL DEFAULT 0,
                claimed_at TEXT,
                last_error TEXT,
                created_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_jobs_due
                ON scheduled_jobs(status, run_at);

            CREATE TABLE IF NOT EXISTS automation_templates (
                id TEXT PRIMARY KEY,
                business_id TEXT NOT NULL,
                key TEXT NOT NULL,
                name TEXT NOT NULL,
                channels TEXT NOT NULL DEFAULT '[\"email\"]',
                subject TEXT,
                body TEXT NOT NULL,
                service_type TEXT,
                keywords TEXT NOT NULL DEFAULT '[]',
                is_default INTEGER NOT NULL DEFAULT 0,
                delay_ms INTEGER NOT NULL DEFAULT 0,
                last_used_at TEXT,
                created_at TEXT NOT NULL,
                UNIQUE(business_id, key)
            );

            CREATE TABLE IF NOT EXISTS send_log (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                business_id TEXT NOT NULL,
                customer_id TEXT NOT NULL,
                channel TEXT NOT NULL,
                sent_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_send_log_business
                ON send_log(business_id, channel, sent_at);
            CREATE INDEX IF NOT EXISTS idx_send_log_customer
                ON send_log(business_id, customer_id, sent_at);

            CREATE TABLE IF NOT EXISTS event_log (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                business_id TEXT,
                event_type TEXT NOT NULL,
                details TEXT,
                created_at TEXT NOT NULL
            );
         ",
            )
            .map_err(|e| RevloopError::Db(format!("Migration: {e}")))?;
        Ok(())
    }

    /// Resolve a business id into a tenant capability.
    /// Fails with NotFound for unknown ids — the only way to get a ctx.
    pub fn tenant_ctx(&self, business_id: &str) -> Result<TenantCtx> {
        let exists: bool = self
            .conn
            .query_row(
                "SELECT EXISTS(SELECT 1 FROM businesses WHERE id = ?1)",
                [business_id],
                |row| row.get(0),
            )
            .map_err(|e| RevloopError::Db(format!("Tenant lookup: {e}")))?;
        if exists {
            Ok(TenantCtx {
                business_id: business_id.to_string(),
            })
        } else {
            Err(RevloopError::not_found(format!(
                "business {business_id}"
            )))
        }
    }

    /// Append to the audit trail. Callers `.ok()` this — audit writes must
    /// never fail the primary operation.
    pub fn log_event(
        &self,
        business_id: Option<&str>,
        event_type: &str,
        details: Option<&str>,
    ) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO event_log (business_id, event_type, details, created_at)
                 VALUES (?1, ?2, ?3, ?4)",
                rusqlite::params![business_id, event_type, details, ts(Utc::now())],
            )
            .map_err(|e| RevloopError::Db(format!("Log event: {e}")))?;
        Ok(())
    }
}

/// Fixed-width RFC 3339 so lexicographic TEXT comparison matches
/// chronological order in SQL.
pub(crate) fn ts(t: DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Millis, true)
}

pub(crate) fn parse_ts(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|d| d.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

pub(crate) fn parse_opt_ts(s: Option<String>) -> Option<DateTime<Utc>> {
    s.and_then(|v| DateTime::parse_from_rfc3339(&v).ok())
        .map(|d| d.with_timezone(&Utc))
}

pub(crate) fn new_id() -> String {
    uuid::Uuid::new_v4().to_string()
}
