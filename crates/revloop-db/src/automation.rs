//! Automation queries — sequences, steps, enrollments, scheduled jobs.
//!
//! Claiming discipline: due rows are claimed with an atomic conditional
//! UPDATE ("claim if still queued"), never read-then-write, so concurrent
//! executor passes cannot both pick up the same unit.

use crate::models::*;
use crate::{Store, TenantCtx, new_id, parse_opt_ts, parse_ts, ts};
use chrono::{DateTime, Duration, Utc};
use revloop_core::error::{Result, RevloopError};
use revloop_core::types::{EnrollmentStatus, JobStatus, SequenceStatus, StepKind};
use rusqlite::{OptionalExtension, params};

const SEQUENCE_SELECT: &str = "SELECT id, business_id, name, status, trigger_event_type, allow_manual_enroll, \
     created_at FROM sequences";

fn row_to_sequence(row: &rusqlite::Row) -> rusqlite::Result<Sequence> {
    let status: String = row.get(3)?;
    Ok(Sequence {
        id: row.get(0)?,
        business_id: row.get(1)?,
        name: row.get(2)?,
        status: SequenceStatus::parse(&status).unwrap_or(SequenceStatus::Draft),
        trigger_event_type: row.get(4)?,
        allow_manual_enroll: row.get::<_, i64>(5)? != 0,
        created_at: parse_ts(&row.get::<_, String>(6)?),
    })
}

const STEP_SELECT: &str = "SELECT id, business_id, sequence_id, step_index, kind, wait_ms, message_config, \
     created_at FROM sequence_steps";

fn row_to_step(row: &rusqlite::Row) -> rusqlite::Result<SequenceStep> {
    let kind: String = row.get(4)?;
    let config: String = row.get(6)?;
    Ok(SequenceStep {
        id: row.get(0)?,
        business_id: row.get(1)?,
        sequence_id: row.get(2)?,
        step_index: row.get(3)?,
        kind: StepKind::parse(&kind).unwrap_or(StepKind::Wait),
        wait_ms: row.get(5)?,
        message_config: serde_json::from_str(&config).unwrap_or_default(),
        created_at: parse_ts(&row.get::<_, String>(7)?),
    })
}

const ENROLLMENT_SELECT: &str = "SELECT id, business_id, sequence_id, customer_id, status, current_step_index, \
     next_run_at, last_event_at, attempts, meta, last_error, created_at \
     FROM sequence_enrollments";

fn row_to_enrollment(row: &rusqlite::Row) -> rusqlite::Result<Enrollment> {
    let status: String = row.get(4)?;
    let meta: String = row.get(9)?;
    Ok(Enrollment {
        id: row.get(0)?,
        business_id: row.get(1)?,
        sequence_id: row.get(2)?,
        customer_id: row.get(3)?,
        status: EnrollmentStatus::parse(&status).unwrap_or(EnrollmentStatus::Active),
        current_step_index: row.get(5)?,
        next_run_at: parse_opt_ts(row.get(6)?),
        last_event_at: parse_opt_ts(row.get(7)?),
        attempts: row.get(8)?,
        meta: serde_json::from_str(&meta).unwrap_or_default(),
        last_error: row.get(10)?,
        created_at: parse_ts(&row.get::<_, String>(11)?),
    })
}

const JOB_SELECT: &str = "SELECT id, business_id, job_type, payload, run_at, status, attempts, claimed_at, \
     last_error, created_at FROM scheduled_jobs";

fn row_to_job(row: &rusqlite::Row) -> rusqlite::Result<ScheduledJob> {
    let status: String = row.get(5)?;
    let payload: String = row.get(3)?;
    Ok(ScheduledJob {
        id: row.get(0)?,
        business_id: row.get(1)?,
        job_type: row.get(2)?,
        payload: serde_json::from_str(&payload).unwrap_or_default(),
        run_at: parse_ts(&row.get::<_, String>(4)?),
        status: JobStatus::parse(&status).unwrap_or(JobStatus::Queued),
        attempts: row.get(6)?,
        claimed_at: parse_opt_ts(row.get(7)?),
        last_error: row.get(8)?,
        created_at: parse_ts(&row.get::<_, String>(9)?),
    })
}

impl Store {
    // ─── Sequences & steps ──────────────────────────────────────

    pub fn create_sequence(&self, ctx: &TenantCtx, input: NewSequence) -> Result<Sequence> {
        let id = new_id();
        let now = Utc::now();
        self.conn
            .execute(
                "INSERT INTO sequences
                 (id, business_id, name, status, trigger_event_type, allow_manual_enroll, created_at)
                 VALUES (?1, ?2, ?3, 'draft', ?4, ?5, ?6)",
                params![
                    id,
                    ctx.business_id(),
                    input.name,
                    input.trigger_event_type,
                    input.allow_manual_enroll as i64,
                    ts(now),
                ],
            )
            .map_err(|e| RevloopError::Db(format!("Create sequence: {e}")))?;
        Ok(Sequence {
            id,
            business_id: ctx.business_id().to_string(),
            name: input.name,
            status: SequenceStatus::Draft,
            trigger_event_type: input.trigger_event_type,
            allow_manual_enroll: input.allow_manual_enroll,
            created_at: now,
        })
    }

    pub fn get_sequence(&self, ctx: &TenantCtx, id: &str) -> Result<Option<Sequence>> {
        self.conn
            .query_row(
                &format!("{SEQUENCE_SELECT} WHERE id = ?1 AND business_id = ?2"),
                params![id, ctx.business_id()],
                row_to_sequence,
            )
            .optional()
            .map_err(|e| RevloopError::Db(format!("Get sequence: {e}")))
    }

    pub fn list_sequences(&self, ctx: &TenantCtx) -> Result<Vec<Sequence>> {
        let mut stmt = self
            .conn
            .prepare(&format!(
                "{SEQUENCE_SELECT} WHERE business_id = ?1 ORDER BY created_at"
            ))
            .map_err(|e| RevloopError::Db(format!("List sequences: {e}")))?;
        let rows = stmt
            .query_map([ctx.business_id()], row_to_sequence)
            .map_err(|e| RevloopError::Db(format!("List sequences: {e}")))?;
        Ok(rows.filter_map(|r| r.ok()).collect())
    }

    pub fn set_sequence_status(
        &self,
        ctx: &TenantCtx,
        id: &str,
        status: SequenceStatus,
    ) -> Result<()> {
        let n = self
            .conn
            .execute(
                "UPDATE sequences SET status = ?1 WHERE id = ?2 AND business_id = ?3",
                params![status.as_str(), id, ctx.business_id()],
            )
            .map_err(|e| RevloopError::Db(format!("Set sequence status: {e}")))?;
        if n == 0 {
            return Err(RevloopError::not_found(format!("sequence {id}")));
        }
        Ok(())
    }

    /// Active sequences configured to react to this canonical event type.
    pub fn find_active_by_trigger(
        &self,
        ctx: &TenantCtx,
        event_type: &str,
    ) -> Result<Vec<Sequence>> {
        let mut stmt = self
            .conn
            .prepare(&format!(
                "{SEQUENCE_SELECT} WHERE business_id = ?1 AND trigger_event_type = ?2
                 AND status = 'active' ORDER BY created_at"
            ))
            .map_err(|e| RevloopError::Db(format!("Match sequences: {e}")))?;
        let rows = stmt
            .query_map(params![ctx.business_id(), event_type], row_to_sequence)
            .map_err(|e| RevloopError::Db(format!("Match sequences: {e}")))?;
        Ok(rows.filter_map(|r| r.ok()).collect())
    }

    pub fn add_step(
        &self,
        ctx: &TenantCtx,
        sequence_id: &str,
        input: NewStep,
    ) -> Result<SequenceStep> {
        let id = new_id();
        let now = Utc::now();
        let config = input.message_config.to_string();
        self.conn
            .execute(
                "INSERT INTO sequence_steps
                 (id, business_id, sequence_id, step_index, kind, wait_ms, message_config, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    id,
                    ctx.business_id(),
                    sequence_id,
                    input.step_index,
                    input.kind.as_str(),
                    input.wait_ms,
                    config,
                    ts(now),
                ],
            )
            .map_err(|e| match e {
                rusqlite::Error::SqliteFailure(err, _)
                    if err.code == rusqlite::ErrorCode::ConstraintViolation =>
                {
                    RevloopError::duplicate(format!(
                        "step index {} on sequence {sequence_id}",
                        input.step_index
                    ))
                }
                other => RevloopError::Db(format!("Add step: {other}")),
            })?;
        Ok(SequenceStep {
            id,
            business_id: ctx.business_id().to_string(),
            sequence_id: sequence_id.to_string(),
            step_index: input.step_index,
            kind: input.kind,
            wait_ms: input.wait_ms,
            message_config: input.message_config,
            created_at: now,
        })
    }

    pub fn list_steps(&self, ctx: &TenantCtx, sequence_id: &str) -> Result<Vec<SequenceStep>> {
        let mut stmt = self
            .conn
            .prepare(&format!(
                "{STEP_SELECT} WHERE business_id = ?1 AND sequence_id = ?2 ORDER BY step_index"
            ))
            .map_err(|e| RevloopError::Db(format!("List steps: {e}")))?;
        let rows = stmt
            .query_map(params![ctx.business_id(), sequence_id], row_to_step)
            .map_err(|e| RevloopError::Db(format!("List steps: {e}")))?;
        Ok(rows.filter_map(|r| r.ok()).collect())
    }

    /// First step by ascending index — defines the initial next_run_at.
    pub fn first_step(&self, ctx: &TenantCtx, sequence_id: &str) -> Result<Option<SequenceStep>> {
        self.conn
            .query_row(
                &format!(
                    "{STEP_SELECT} WHERE business_id = ?1 AND sequence_id = ?2
                     ORDER BY step_index ASC LIMIT 1"
                ),
                params![ctx.business_id(), sequence_id],
                row_to_step,
            )
            .optional()
            .map_err(|e| RevloopError::Db(format!("First step: {e}")))
    }

    /// The step at exactly this index, or None if it was deleted.
    pub fn step_at(
        &self,
        ctx: &TenantCtx,
        sequence_id: &str,
        step_index: i64,
    ) -> Result<Option<SequenceStep>> {
        self.conn
            .query_row(
                &format!(
                    "{STEP_SELECT} WHERE business_id = ?1 AND sequence_id = ?2 AND step_index = ?3"
                ),
                params![ctx.business_id(), sequence_id, step_index],
                row_to_step,
            )
            .optional()
            .map_err(|e| RevloopError::Db(format!("Step at: {e}")))
    }

    /// Next step strictly after the given index, ascending.
    pub fn next_step_after(
        &self,
        ctx: &TenantCtx,
        sequence_id: &str,
        step_index: i64,
    ) -> Result<Option<SequenceStep>> {
        self.conn
            .query_row(
                &format!(
                    "{STEP_SELECT} WHERE business_id = ?1 AND sequence_id = ?2 AND step_index > ?3
                     ORDER BY step_index ASC LIMIT 1"
                ),
                params![ctx.business_id(), sequence_id, step_index],
                row_to_step,
            )
            .optional()
            .map_err(|e| RevloopError::Db(format!("Next step: {e}")))
    }

    // ─── Enrollments ──────────────────────────────────────

    /// The dedup lookup: at most one active enrollment per
    /// (sequence, customer).
    pub fn find_active_enrollment(
        &self,
        ctx: &TenantCtx,
        sequence_id: &str,
        customer_id: &str,
    ) -> Result<Option<Enrollment>> {
        self.conn
            .query_row(
                &format!(
                    "{ENROLLMENT_SELECT} WHERE business_id = ?1 AND sequence_id = ?2
                     AND customer_id = ?3 AND status = 'active'"
                ),
                params![ctx.business_id(), sequence_id, customer_id],
                row_to_enrollment,
            )
            .optional()
            .map_err(|e| RevloopError::Db(format!("Find enrollment: {e}")))
    }

    pub fn get_enrollment(&self, ctx: &TenantCtx, id: &str) -> Result<Option<Enrollment>> {
        self.conn
            .query_row(
                &format!("{ENROLLMENT_SELECT} WHERE id = ?1 AND business_id = ?2"),
                params![id, ctx.business_id()],
                row_to_enrollment,
            )
            .optional()
            .map_err(|e| RevloopError::Db(format!("Get enrollment: {e}")))
    }

    pub fn insert_enrollment(
        &self,
        ctx: &TenantCtx,
        sequence_id: &str,
        customer_id: &str,
        current_step_index: i64,
        next_run_at: DateTime<Utc>,
        meta: serde_json::Value,
    ) -> Result<Enrollment> {
        let id = new_id();
        let now = Utc::now();
        self.conn
            .execute(
                "INSERT INTO sequence_enrollments
                 (id, business_id, sequence_id, customer_id, status, current_step_index,
                  next_run_at, meta, created_at)
                 VALUES (?1, ?2, ?3, ?4, 'active', ?5, ?6, ?7, ?8)",
                params![
                    id,
                    ctx.business_id(),
                    sequence_id,
                    customer_id,
                    current_step_index,
                    ts(next_run_at),
                    meta.to_string(),
                    ts(now),
                ],
            )
            .map_err(|e| match e {
                // The partial unique index catches a concurrent duplicate
                // enroll that slipped past the lookup.
                rusqlite::Error::SqliteFailure(err, _)
                    if err.code == rusqlite::ErrorCode::ConstraintViolation =>
                {
                    RevloopError::duplicate(format!(
                        "active enrollment for customer {customer_id} in sequence {sequence_id}"
                    ))
                }
                other => RevloopError::Db(format!("Insert enrollment: {other}")),
            })?;
        Ok(Enrollment {
            id,
            business_id: ctx.business_id().to_string(),
            sequence_id: sequence_id.to_string(),
            customer_id: customer_id.to_string(),
            status: EnrollmentStatus::Active,
            current_step_index,
            next_run_at: Some(next_run_at),
            last_event_at: None,
            attempts: 0,
            meta,
            last_error: None,
            created_at: now,
        })
    }

    /// Advance to the next step: new index + due time, attempt counter reset,
    /// claim released.
    pub fn advance_enrollment(
        &self,
        ctx: &TenantCtx,
        id: &str,
        next_index: i64,
        next_run_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<()> {
        self.conn
            .execute(
                "UPDATE sequence_enrollments
                 SET current_step_index = ?1, next_run_at = ?2, last_event_at = ?3,
                     attempts = 0, in_flight = 0, claimed_at = NULL
                 WHERE id = ?4 AND business_id = ?5 AND status = 'active'",
                params![next_index, ts(next_run_at), ts(now), id, ctx.business_id()],
            )
            .map_err(|e| RevloopError::Db(format!("Advance enrollment: {e}")))?;
        Ok(())
    }

    /// Steps exhausted — the happy-path terminal state.
    pub fn complete_enrollment(&self, ctx: &TenantCtx, id: &str, now: DateTime<Utc>) -> Result<()> {
        self.conn
            .execute(
                "UPDATE sequence_enrollments
                 SET status = 'completed', next_run_at = NULL, last_event_at = ?1,
                     in_flight = 0, claimed_at = NULL
                 WHERE id = ?2 AND business_id = ?3 AND status = 'active'",
                params![ts(now), id, ctx.business_id()],
            )
            .map_err(|e| RevloopError::Db(format!("Complete enrollment: {e}")))?;
        Ok(())
    }

    pub fn fail_enrollment(
        &self,
        ctx: &TenantCtx,
        id: &str,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Result<()> {
        self.conn
            .execute(
                "UPDATE sequence_enrollments
                 SET status = 'failed', next_run_at = NULL, last_event_at = ?1,
                     last_error = ?2, in_flight = 0, claimed_at = NULL
                 WHERE id = ?3 AND business_id = ?4 AND status = 'active'",
                params![ts(now), reason, id, ctx.business_id()],
            )
            .map_err(|e| RevloopError::Db(format!("Fail enrollment: {e}")))?;
        Ok(())
    }

    pub fn cancel_enrollment(&self, ctx: &TenantCtx, id: &str, now: DateTime<Utc>) -> Result<()> {
        let n = self
            .conn
            .execute(
                "UPDATE sequence_enrollments
                 SET status = 'cancelled', next_run_at = NULL, last_event_at = ?1,
                     in_flight = 0, claimed_at = NULL
                 WHERE id = ?2 AND business_id = ?3 AND status = 'active'",
                params![ts(now), id, ctx.business_id()],
            )
            .map_err(|e| RevloopError::Db(format!("Cancel enrollment: {e}")))?;
        if n == 0 {
            return Err(RevloopError::not_found(format!("active enrollment {id}")));
        }
        Ok(())
    }

    /// Push the current step forward (quiet hours, rate limit, transient
    /// retry). `bump_attempts` distinguishes retries from soft vetoes.
    pub fn reschedule_enrollment(
        &self,
        ctx: &TenantCtx,
        id: &str,
        next_run_at: DateTime<Utc>,
        bump_attempts: bool,
        reason: Option<&str>,
    ) -> Result<()> {
        self.conn
            .execute(
                "UPDATE sequence_enrollments
                 SET next_run_at = ?1, attempts = attempts + ?2, last_error = ?3,
                     in_flight = 0, claimed_at = NULL
                 WHERE id = ?4 AND business_id = ?5 AND status = 'active'",
                params![
                    ts(next_run_at),
                    bump_attempts as i64,
                    reason,
                    id,
                    ctx.business_id()
                ],
            )
            .map_err(|e| RevloopError::Db(format!("Reschedule enrollment: {e}")))?;
        Ok(())
    }

    /// Due enrollment steps across all tenants, oldest due first.
    /// The executor resolves a TenantCtx per row before touching anything
    /// tenant-scoped.
    pub fn due_enrollments(&self, now: DateTime<Utc>, limit: u32) -> Result<Vec<Enrollment>> {
        let mut stmt = self
            .conn
            .prepare(&format!(
                "{ENROLLMENT_SELECT} WHERE status = 'active' AND in_flight = 0
                 AND next_run_at IS NOT NULL AND next_run_at <= ?1
                 ORDER BY next_run_at ASC LIMIT ?2"
            ))
            .map_err(|e| RevloopError::Db(format!("Due enrollments: {e}")))?;
        let rows = stmt
            .query_map(params![ts(now), limit], row_to_enrollment)
            .map_err(|e| RevloopError::Db(format!("Due enrollments: {e}")))?;
        Ok(rows.filter_map(|r| r.ok()).collect())
    }

    /// Claim one due enrollment step. Compare-and-swap on in_flight;
    /// false means a concurrent pass got there first.
    pub fn claim_enrollment(&self, id: &str, now: DateTime<Utc>) -> Result<bool> {
        let n = self
            .conn
            .execute(
                "UPDATE sequence_enrollments SET in_flight = 1, claimed_at = ?1
                 WHERE id = ?2 AND status = 'active' AND in_flight = 0",
                params![ts(now), id],
            )
            .map_err(|e| RevloopError::Db(format!("Claim enrollment: {e}")))?;
        Ok(n == 1)
    }

    // ─── Scheduled jobs ──────────────────────────────────────

    pub fn enqueue_job(
        &self,
        ctx: &TenantCtx,
        job_type: &str,
        payload: serde_json::Value,
        run_at: DateTime<Utc>,
    ) -> Result<ScheduledJob> {
        let id = new_id();
        let now = Utc::now();
        self.conn
            .execute(
                "INSERT INTO scheduled_jobs
                 (id, business_id, job_type, payload, run_at, status, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, 'queued', ?6)",
                params![
                    id,
                    ctx.business_id(),
                    job_type,
                    payload.to_string(),
                    ts(run_at),
                    ts(now),
                ],
            )
            .map_err(|e| RevloopError::Db(format!("Enqueue job: {e}")))?;
        Ok(ScheduledJob {
            id,
            business_id: ctx.business_id().to_string(),
            job_type: job_type.to_string(),
            payload,
            run_at,
            status: JobStatus::Queued,
            attempts: 0,
            claimed_at: None,
            last_error: None,
            created_at: now,
        })
    }

    pub fn get_job(&self, ctx: &TenantCtx, id: &str) -> Result<Option<ScheduledJob>> {
        self.conn
            .query_row(
                &format!("{JOB_SELECT} WHERE id = ?1 AND business_id = ?2"),
                params![id, ctx.business_id()],
                row_to_job,
            )
            .optional()
            .map_err(|e| RevloopError::Db(format!("Get job: {e}")))
    }

    /// Due queued jobs across all tenants, oldest due first.
    pub fn due_jobs(&self, now: DateTime<Utc>, limit: u32) -> Result<Vec<ScheduledJob>> {
        let mut stmt = self
            .conn
            .prepare(&format!(
                "{JOB_SELECT} WHERE status = 'queued' AND run_at <= ?1
                 ORDER BY run_at ASC LIMIT ?2"
            ))
            .map_err(|e| RevloopError::Db(format!("Due jobs: {e}")))?;
        let rows = stmt
            .query_map(params![ts(now), limit], row_to_job)
            .map_err(|e| RevloopError::Db(format!("Due jobs: {e}")))?;
        Ok(rows.filter_map(|r| r.ok()).collect())
    }

    /// Claim one due job: queued → processing, only if still queued.
    pub fn claim_job(&self, id: &str, now: DateTime<Utc>) -> Result<bool> {
        let n = self
            .conn
            .execute(
                "UPDATE scheduled_jobs SET status = 'processing', claimed_at = ?1
                 WHERE id = ?2 AND status = 'queued'",
                params![ts(now), id],
            )
            .map_err(|e| RevloopError::Db(format!("Claim job: {e}")))?;
        Ok(n == 1)
    }

    pub fn complete_job(&self, ctx: &TenantCtx, id: &str) -> Result<()> {
        self.conn
            .execute(
                "UPDATE scheduled_jobs SET status = 'completed', claimed_at = NULL
                 WHERE id = ?1 AND business_id = ?2 AND status = 'processing'",
                params![id, ctx.business_id()],
            )
            .map_err(|e| RevloopError::Db(format!("Complete job: {e}")))?;
        Ok(())
    }

    pub fn fail_job(&self, ctx: &TenantCtx, id: &str, reason: &str) -> Result<()> {
        self.conn
            .execute(
                "UPDATE scheduled_jobs SET status = 'failed', last_error = ?1, claimed_at = NULL
                 WHERE id = ?2 AND business_id = ?3 AND status = 'processing'",
                params![reason, id, ctx.business_id()],
            )
            .map_err(|e| RevloopError::Db(format!("Fail job: {e}")))?;
        Ok(())
    }

    /// Transient-retry path: processing → queued with a later run_at.
    /// The only backward status edge in the model.
    pub fn requeue_job(
        &self,
        ctx: &TenantCtx,
        id: &str,
        run_at: DateTime<Utc>,
        reason: Option<&str>,
        bump_attempts: bool,
    ) -> Result<()> {
        self.conn
            .execute(
                "UPDATE scheduled_jobs
                 SET status = 'queued', run_at = ?1, attempts = attempts + ?2,
                     last_error = ?3, claimed_at = NULL
                 WHERE id = ?4 AND business_id = ?5 AND status = 'processing'",
                params![
                    ts(run_at),
                    bump_attempts as i64,
                    reason,
                    id,
                    ctx.business_id()
                ],
            )
            .map_err(|e| RevloopError::Db(format!("Requeue job: {e}")))?;
        Ok(())
    }

    // ─── Orphaned rows ──────────────────────────────────────
    // A due row whose business no longer resolves cannot produce a
    // TenantCtx; these id-only fallbacks let the executor park it as
    // failed instead of re-selecting it forever.

    pub fn fail_orphaned_job(&self, id: &str, reason: &str) -> Result<()> {
        self.conn
            .execute(
                "UPDATE scheduled_jobs SET status = 'failed', last_error = ?1, claimed_at = NULL
                 WHERE id = ?2 AND status = 'processing'",
                params![reason, id],
            )
            .map_err(|e| RevloopError::Db(format!("Fail orphaned job: {e}")))?;
        Ok(())
    }

    pub fn fail_orphaned_enrollment(&self, id: &str, reason: &str) -> Result<()> {
        self.conn
            .execute(
                "UPDATE sequence_enrollments
                 SET status = 'failed', next_run_at = NULL, last_error = ?1,
                     in_flight = 0, claimed_at = NULL
                 WHERE id = ?2 AND status = 'active'",
                params![reason, id],
            )
            .map_err(|e| RevloopError::Db(format!("Fail orphaned enrollment: {e}")))?;
        Ok(())
    }

    // ─── Staleness sweep ──────────────────────────────────────

    /// Reclaim work stuck in flight longer than the visibility timeout —
    /// a crashed executor must not strand its claims forever.
    pub fn sweep_stale(&self, now: DateTime<Utc>, timeout: Duration) -> Result<usize> {
        let cutoff = ts(now - timeout);
        let jobs = self
            .conn
            .execute(
                "UPDATE scheduled_jobs SET status = 'queued', claimed_at = NULL
                 WHERE status = 'processing' AND claimed_at IS NOT NULL AND claimed_at <= ?1",
                params![cutoff],
            )
            .map_err(|e| RevloopError::Db(format!("Sweep jobs: {e}")))?;
        let enrollments = self
            .conn
            .execute(
                "UPDATE sequence_enrollments SET in_flight = 0, claimed_at = NULL
                 WHERE in_flight = 1 AND claimed_at IS NOT NULL AND claimed_at <= ?1",
                params![cutoff],
            )
            .map_err(|e| RevloopError::Db(format!("Sweep enrollments: {e}")))?;
        Ok(jobs + enrollments)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::temp_store;

    fn setup(store: &Store) -> TenantCtx {
        let biz = store
            .create_business(NewBusiness {
                name: "Ace Plumbing".into(),
                review_link: None,
                utc_offset_minutes: 0,
                quiet_hours_start: None,
                quiet_hours_end: None,
                hourly_send_limit: 25,
                daily_send_limit: 100,
                cooldown_days: 30,
            })
            .unwrap();
        store.tenant_ctx(&biz.id).unwrap()
    }

    #[test]
    fn test_step_ordering_and_lookup() {
        let (store, dir) = temp_store("auto-steps");
        let ctx = setup(&store);
        let seq = store
            .create_sequence(
                &ctx,
                NewSequence {
                    name: "Post-job review".into(),
                    trigger_event_type: Some("job_completed".into()),
                    allow_manual_enroll: true,
                },
            )
            .unwrap();
        // Inserted out of order; reads are index-ordered.
        store
            .add_step(
                &ctx,
                &seq.id,
                NewStep {
                    step_index: 1,
                    kind: StepKind::SendSms,
                    wait_ms: 86_400_000,
                    message_config: serde_json::json!({"body": "quick reminder"}),
                },
            )
            .unwrap();
        store
            .add_step(
                &ctx,
                &seq.id,
                NewStep {
                    step_index: 0,
                    kind: StepKind::SendEmail,
                    wait_ms: 0,
                    message_config: serde_json::json!({"subject": "hi", "body": "review us"}),
                },
            )
            .unwrap();

        let first = store.first_step(&ctx, &seq.id).unwrap().unwrap();
        assert_eq!(first.step_index, 0);
        assert_eq!(first.kind, StepKind::SendEmail);

        let next = store.next_step_after(&ctx, &seq.id, 0).unwrap().unwrap();
        assert_eq!(next.step_index, 1);
        assert!(store.next_step_after(&ctx, &seq.id, 1).unwrap().is_none());
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_duplicate_step_index_rejected() {
        let (store, dir) = temp_store("auto-dup-step");
        let ctx = setup(&store);
        let seq = store
            .create_sequence(
                &ctx,
                NewSequence {
                    name: "s".into(),
                    trigger_event_type: None,
                    allow_manual_enroll: true,
                },
            )
            .unwrap();
        let step = NewStep {
            step_index: 0,
            kind: StepKind::Wait,
            wait_ms: 1000,
            message_config: serde_json::json!({}),
        };
        store.add_step(&ctx, &seq.id, step.clone()).unwrap();
        assert!(matches!(
            store.add_step(&ctx, &seq.id, step),
            Err(RevloopError::Duplicate(_))
        ));
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_active_enrollment_unique_index() {
        let (store, dir) = temp_store("auto-unique");
        let ctx = setup(&store);
        let now = Utc::now();
        store
            .insert_enrollment(&ctx, "seq-1", "cust-1", 0, now, serde_json::json!({}))
            .unwrap();
        // Second active row for the same pair is rejected at the data layer.
        assert!(matches!(
            store.insert_enrollment(&ctx, "seq-1", "cust-1", 0, now, serde_json::json!({})),
            Err(RevloopError::Duplicate(_))
        ));
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_cancel_enrollment_only_when_active() {
        let (store, dir) = temp_store("auto-cancel");
        let ctx = setup(&store);
        let now = Utc::now();
        let enr = store
            .insert_enrollment(&ctx, "seq-1", "cust-1", 0, now, serde_json::json!({}))
            .unwrap();

        store.cancel_enrollment(&ctx, &enr.id, now).unwrap();
        let cancelled = store.get_enrollment(&ctx, &enr.id).unwrap().unwrap();
        assert_eq!(cancelled.status, EnrollmentStatus::Cancelled);
        assert!(cancelled.next_run_at.is_none());

        // Cancelled is terminal — a second cancel is a NotFound.
        assert!(store.cancel_enrollment(&ctx, &enr.id, now).is_err());
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_claim_job_is_atomic() {
        let (store, dir) = temp_store("auto-claim");
        let ctx = setup(&store);
        let now = Utc::now();
        let job = store
            .enqueue_job(&ctx, "send_message", serde_json::json!({}), now)
            .unwrap();

        assert!(store.claim_job(&job.id, now).unwrap());
        // A second claim (concurrent pass) must lose.
        assert!(!store.claim_job(&job.id, now).unwrap());

        store.complete_job(&ctx, &job.id).unwrap();
        let done = store.get_job(&ctx, &job.id).unwrap().unwrap();
        assert_eq!(done.status, JobStatus::Completed);
        // Terminal states never move again.
        assert!(!store.claim_job(&job.id, now).unwrap());
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_due_jobs_oldest_first() {
        let (store, dir) = temp_store("auto-due");
        let ctx = setup(&store);
        let now = Utc::now();
        store
            .enqueue_job(&ctx, "b", serde_json::json!({}), now - Duration::minutes(1))
            .unwrap();
        store
            .enqueue_job(&ctx, "a", serde_json::json!({}), now - Duration::minutes(10))
            .unwrap();
        store
            .enqueue_job(&ctx, "future", serde_json::json!({}), now + Duration::hours(1))
            .unwrap();

        let due = store.due_jobs(now, 10).unwrap();
        assert_eq!(due.len(), 2);
        assert_eq!(due[0].job_type, "a");
        assert_eq!(due[1].job_type, "b");
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_sweep_reclaims_stuck_processing() {
        let (store, dir) = temp_store("auto-sweep");
        let ctx = setup(&store);
        let now = Utc::now();
        let job = store
            .enqueue_job(&ctx, "send_message", serde_json::json!({}), now)
            .unwrap();
        // Claimed twenty minutes ago, never finished.
        assert!(store.claim_job(&job.id, now - Duration::minutes(20)).unwrap());

        let swept = store.sweep_stale(now, Duration::minutes(10)).unwrap();
        assert_eq!(swept, 1);
        let reclaimed = store.get_job(&ctx, &job.id).unwrap().unwrap();
        assert_eq!(reclaimed.status, JobStatus::Queued);

        // A fresh claim is not swept.
        assert!(store.claim_job(&job.id, now).unwrap());
        assert_eq!(store.sweep_stale(now, Duration::minutes(10)).unwrap(), 0);
        std::fs::remove_dir_all(&dir).ok();
    }
}
