//! The polling job executor.
//!
//! Invoked on a fixed cadence with no input; scans for due scheduled jobs
//! and due enrollment steps, claims each with an atomic conditional update,
//! gates through the safety rules, performs the send, and advances state.
//! One bad row never aborts the batch.

use crate::safety::{self, Verdict};
use crate::schedule;
use crate::telemetry::Telemetry;
use crate::template::{self, RenderVars};
use chrono::{DateTime, Duration, Utc};
use revloop_core::config::ExecutorConfig;
use revloop_core::error::{Result, RevloopError};
use revloop_core::traits::Outbound;
use revloop_core::types::{ChannelKind, DeliveryError, OutgoingMessage, StepKind};
use revloop_db::{Business, Customer, Enrollment, ScheduledJob, SequenceStep, Store, TenantCtx};
use serde::Serialize;

/// The executor's only observable contract besides the DB mutations.
#[derive(Debug, Default, Clone, Serialize)]
pub struct ExecutorSummary {
    pub processed: u32,
    pub sent: u32,
    pub failed: u32,
    pub rescheduled: u32,
}

enum UnitOutcome {
    Sent,
    /// Advanced without a send (wait steps).
    Advanced,
    Failed,
    Rescheduled,
}

impl ExecutorSummary {
    fn count(&mut self, outcome: UnitOutcome) {
        match outcome {
            UnitOutcome::Sent => self.sent += 1,
            UnitOutcome::Failed => self.failed += 1,
            UnitOutcome::Rescheduled => self.rescheduled += 1,
            UnitOutcome::Advanced => {}
        }
    }
}

/// One executor pass at `now`. Safe to call repeatedly and concurrently:
/// claiming is a compare-and-swap, so overlapping passes split the due work
/// instead of double-sending it. A pass that finds nothing due is a no-op.
pub async fn run_pass(
    store: &Store,
    outbound: &dyn Outbound,
    cfg: &ExecutorConfig,
    telemetry: &Telemetry,
    now: DateTime<Utc>,
) -> Result<ExecutorSummary> {
    let mut summary = ExecutorSummary::default();

    // Visibility timeout: a crashed pass must not strand its claims.
    let reclaimed =
        store.sweep_stale(now, Duration::seconds(cfg.visibility_timeout_secs as i64))?;
    if reclaimed > 0 {
        tracing::warn!("♻️ Reclaimed {reclaimed} stale in-flight unit(s)");
    }

    for job in store.due_jobs(now, cfg.batch_size)? {
        if !store.claim_job(&job.id, now)? {
            // A concurrent pass won the claim.
            continue;
        }
        summary.processed += 1;
        match process_job(store, outbound, cfg, telemetry, &job, now).await {
            Ok(outcome) => summary.count(outcome),
            Err(e) => {
                tracing::error!("Job {} failed: {e}", job.id);
                match store.tenant_ctx(&job.business_id) {
                    Ok(ctx) => store.fail_job(&ctx, &job.id, &e.to_string()).ok(),
                    Err(_) => store.fail_orphaned_job(&job.id, &e.to_string()).ok(),
                };
                summary.failed += 1;
            }
        }
    }

    for enrollment in store.due_enrollments(now, cfg.batch_size)? {
        if !store.claim_enrollment(&enrollment.id, now)? {
            continue;
        }
        summary.processed += 1;
        match process_enrollment_step(store, outbound, cfg, telemetry, &enrollment, now).await {
            Ok(outcome) => summary.count(outcome),
            Err(e) => {
                tracing::error!("Enrollment {} step failed: {e}", enrollment.id);
                match store.tenant_ctx(&enrollment.business_id) {
                    Ok(ctx) => store
                        .fail_enrollment(&ctx, &enrollment.id, &e.to_string(), now)
                        .ok(),
                    Err(_) => store
                        .fail_orphaned_enrollment(&enrollment.id, &e.to_string())
                        .ok(),
                };
                summary.failed += 1;
            }
        }
    }

    if summary.processed > 0 {
        tracing::info!(
            "⚙️ Executor pass: {} processed, {} sent, {} failed, {} rescheduled",
            summary.processed,
            summary.sent,
            summary.failed,
            summary.rescheduled
        );
    }
    Ok(summary)
}

/// A rendered-and-routed send, ready for the safety gate.
struct PreparedSend {
    channel: ChannelKind,
    subject: Option<String>,
    body: String,
    template_id: Option<String>,
}

async fn process_job(
    store: &Store,
    outbound: &dyn Outbound,
    cfg: &ExecutorConfig,
    telemetry: &Telemetry,
    job: &ScheduledJob,
    now: DateTime<Utc>,
) -> Result<UnitOutcome> {
    let ctx = match store.tenant_ctx(&job.business_id) {
        Ok(ctx) => ctx,
        Err(_) => {
            store.fail_orphaned_job(&job.id, "business missing")?;
            return Ok(UnitOutcome::Failed);
        }
    };
    let business = store.get_business(&ctx)?;
    let customer_id = job.payload["customer_id"].as_str().unwrap_or_default();
    let Some(customer) = store.get_customer(&ctx, customer_id)? else {
        store.fail_job(&ctx, &job.id, &format!("customer {customer_id} missing"))?;
        return Ok(UnitOutcome::Failed);
    };

    let prepared = prepare_job_message(store, &ctx, &customer, job)?;

    let counters = store.send_counters(&ctx, &customer.id, prepared.channel, now)?;
    match safety::check_send(&business, &customer, prepared.channel, now, &counters, false) {
        Verdict::Deny(reason) if reason.is_reschedulable() => {
            let at = reason.retry_at(now).unwrap_or(now + Duration::minutes(15));
            tracing::info!("Job {} deferred ({}) until {at}", job.id, reason.as_str());
            store.requeue_job(&ctx, &job.id, at, Some(reason.as_str()), false)?;
            return Ok(UnitOutcome::Rescheduled);
        }
        Verdict::Deny(reason) => {
            store.fail_job(&ctx, &job.id, reason.as_str())?;
            telemetry.emit(
                "send_blocked",
                serde_json::json!({
                    "business_id": ctx.business_id(),
                    "customer_id": customer.id,
                    "job_id": job.id,
                    "reason": reason.as_str(),
                }),
            );
            return Ok(UnitOutcome::Failed);
        }
        Verdict::Allow => {}
    }

    let message = build_message(&business, &customer, &prepared)?;
    match deliver(outbound, &message, cfg).await {
        Ok(()) => {
            store.complete_job(&ctx, &job.id)?;
            store.record_send(&ctx, &customer.id, prepared.channel, now)?;
            if let Some(tid) = &prepared.template_id {
                store.touch_template_used(&ctx, tid, now).ok();
            }
            telemetry.emit(
                "message_sent",
                serde_json::json!({
                    "business_id": ctx.business_id(),
                    "customer_id": customer.id,
                    "channel": prepared.channel.as_str(),
                    "job_id": job.id,
                }),
            );
            Ok(UnitOutcome::Sent)
        }
        Err(e) => {
            let attempt = job.attempts + 1;
            if e.is_transient() && (attempt as u32) < cfg.max_attempts {
                let delay = backoff(cfg, job.attempts as u32);
                tracing::warn!(
                    "Job {} attempt {attempt} failed transiently, retrying in {delay}: {e}",
                    job.id
                );
                store.requeue_job(&ctx, &job.id, now + delay, Some(&e.to_string()), true)?;
                Ok(UnitOutcome::Rescheduled)
            } else {
                store.fail_job(&ctx, &job.id, &e.to_string())?;
                Ok(UnitOutcome::Failed)
            }
        }
    }
}

async fn process_enrollment_step(
    store: &Store,
    outbound: &dyn Outbound,
    cfg: &ExecutorConfig,
    telemetry: &Telemetry,
    enrollment: &Enrollment,
    now: DateTime<Utc>,
) -> Result<UnitOutcome> {
    let ctx = match store.tenant_ctx(&enrollment.business_id) {
        Ok(ctx) => ctx,
        Err(_) => {
            store.fail_orphaned_enrollment(&enrollment.id, "business missing")?;
            return Ok(UnitOutcome::Failed);
        }
    };
    let business = store.get_business(&ctx)?;
    let Some(customer) = store.get_customer(&ctx, &enrollment.customer_id)? else {
        store.fail_enrollment(
            &ctx,
            &enrollment.id,
            &format!("customer {} missing", enrollment.customer_id),
            now,
        )?;
        return Ok(UnitOutcome::Failed);
    };
    let Some(step) =
        store.step_at(&ctx, &enrollment.sequence_id, enrollment.current_step_index)?
    else {
        store.fail_enrollment(
            &ctx,
            &enrollment.id,
            &format!("step {} missing", enrollment.current_step_index),
            now,
        )?;
        return Ok(UnitOutcome::Failed);
    };

    // A wait step's delay was applied when it was scheduled; firing it just
    // advances.
    if step.kind == StepKind::Wait {
        schedule::schedule_next(store, &ctx, enrollment, now)?;
        return Ok(UnitOutcome::Advanced);
    }

    let prepared = prepare_step_message(store, &ctx, &customer, &step)?;
    let continuation = is_continuation(store, &ctx, enrollment)?;
    let counters = store.send_counters(&ctx, &customer.id, prepared.channel, now)?;
    match safety::check_send(
        &business,
        &customer,
        prepared.channel,
        now,
        &counters,
        continuation,
    ) {
        Verdict::Deny(reason) if reason.is_reschedulable() => {
            let at = reason.retry_at(now).unwrap_or(now + Duration::minutes(15));
            tracing::info!(
                "Enrollment {} step {} deferred ({}) until {at}",
                enrollment.id,
                step.step_index,
                reason.as_str()
            );
            store.reschedule_enrollment(&ctx, &enrollment.id, at, false, Some(reason.as_str()))?;
            return Ok(UnitOutcome::Rescheduled);
        }
        Verdict::Deny(reason) => {
            store.fail_enrollment(&ctx, &enrollment.id, reason.as_str(), now)?;
            telemetry.emit(
                "send_blocked",
                serde_json::json!({
                    "business_id": ctx.business_id(),
                    "customer_id": customer.id,
                    "enrollment_id": enrollment.id,
                    "reason": reason.as_str(),
                }),
            );
            return Ok(UnitOutcome::Failed);
        }
        Verdict::Allow => {}
    }

    let message = build_message(&business, &customer, &prepared)?;
    match deliver(outbound, &message, cfg).await {
        Ok(()) => {
            store.record_send(&ctx, &customer.id, prepared.channel, now)?;
            if let Some(tid) = &prepared.template_id {
                store.touch_template_used(&ctx, tid, now).ok();
            }
            schedule::schedule_next(store, &ctx, enrollment, now)?;
            telemetry.emit(
                "step_sent",
                serde_json::json!({
                    "business_id": ctx.business_id(),
                    "customer_id": customer.id,
                    "enrollment_id": enrollment.id,
                    "step_index": step.step_index,
                    "channel": prepared.channel.as_str(),
                }),
            );
            Ok(UnitOutcome::Sent)
        }
        Err(e) => {
            let attempt = enrollment.attempts + 1;
            if e.is_transient() && (attempt as u32) < cfg.max_attempts {
                let delay = backoff(cfg, enrollment.attempts as u32);
                tracing::warn!(
                    "Enrollment {} step {} attempt {attempt} failed transiently, retrying in {delay}: {e}",
                    enrollment.id,
                    step.step_index
                );
                store.reschedule_enrollment(
                    &ctx,
                    &enrollment.id,
                    now + delay,
                    true,
                    Some(&e.to_string()),
                )?;
                Ok(UnitOutcome::Rescheduled)
            } else {
                store.fail_enrollment(&ctx, &enrollment.id, &e.to_string(), now)?;
                telemetry.emit(
                    "step_failed",
                    serde_json::json!({
                        "business_id": ctx.business_id(),
                        "enrollment_id": enrollment.id,
                        "error": e.to_string(),
                    }),
                );
                Ok(UnitOutcome::Failed)
            }
        }
    }
}

/// Resolve a job's payload into channel + content.
fn prepare_job_message(
    store: &Store,
    ctx: &TenantCtx,
    customer: &Customer,
    job: &ScheduledJob,
) -> Result<PreparedSend> {
    match job.job_type.as_str() {
        "send_message" => {
            let channel = job.payload["channel"]
                .as_str()
                .and_then(ChannelKind::parse)
                .ok_or_else(|| RevloopError::config("job payload missing channel"))?;
            if let Some(key) = job.payload["template_key"].as_str() {
                let t = store.get_template_by_key(ctx, key)?.ok_or_else(|| {
                    RevloopError::Template(format!("template '{key}' not found"))
                })?;
                Ok(PreparedSend {
                    channel,
                    subject: t.subject.clone(),
                    body: t.body.clone(),
                    template_id: Some(t.id),
                })
            } else {
                let body = job.payload["body"].as_str().ok_or_else(|| {
                    RevloopError::config("job payload has neither body nor template_key")
                })?;
                Ok(PreparedSend {
                    channel,
                    subject: job.payload["subject"].as_str().map(String::from),
                    body: body.to_string(),
                    template_id: None,
                })
            }
        }
        "review_reminder" => {
            // Prefer email when the customer has one.
            let channel = if customer.contact_for(ChannelKind::Email).is_some() {
                ChannelKind::Email
            } else {
                ChannelKind::Sms
            };
            let templates = store.list_templates(ctx)?;
            let selected = template::select_template(
                &templates,
                channel,
                job.payload["service_type"].as_str(),
                job.payload["note"].as_str(),
            )
            .ok_or_else(|| RevloopError::Template("no matching reminder template".into()))?;
            Ok(PreparedSend {
                channel,
                subject: selected.subject.clone(),
                body: selected.body.clone(),
                template_id: Some(selected.id.clone()),
            })
        }
        other => Err(RevloopError::config(format!("unknown job type '{other}'"))),
    }
}

/// Resolve a sequence step into channel + content. Branch steps pick the
/// channel by contact availability (email preferred) and read the matching
/// per-channel sub-config when present.
fn prepare_step_message(
    store: &Store,
    ctx: &TenantCtx,
    customer: &Customer,
    step: &SequenceStep,
) -> Result<PreparedSend> {
    let (channel, config) = match step.kind {
        StepKind::SendEmail => (ChannelKind::Email, step.message_config.clone()),
        StepKind::SendSms => (ChannelKind::Sms, step.message_config.clone()),
        StepKind::Branch => {
            let channel = if customer.contact_for(ChannelKind::Email).is_some() {
                ChannelKind::Email
            } else {
                ChannelKind::Sms
            };
            let sub = step
                .message_config
                .get(channel.as_str())
                .cloned()
                .unwrap_or_else(|| step.message_config.clone());
            (channel, sub)
        }
        StepKind::Wait => {
            return Err(RevloopError::config("wait step has no message"));
        }
    };

    if let Some(key) = config["template_key"].as_str() {
        let t = store
            .get_template_by_key(ctx, key)?
            .ok_or_else(|| RevloopError::Template(format!("template '{key}' not found")))?;
        return Ok(PreparedSend {
            channel,
            subject: t.subject.clone(),
            body: t.body.clone(),
            template_id: Some(t.id),
        });
    }
    let body = config["body"]
        .as_str()
        .ok_or_else(|| RevloopError::config("step has no message body configured"))?;
    Ok(PreparedSend {
        channel,
        subject: config["subject"].as_str().map(String::from),
        body: body.to_string(),
        template_id: None,
    })
}

/// Steps after the first are sequence continuations — the per-customer
/// cooldown only gates the start of outreach.
fn is_continuation(store: &Store, ctx: &TenantCtx, enrollment: &Enrollment) -> Result<bool> {
    Ok(store
        .first_step(ctx, &enrollment.sequence_id)?
        .map(|first| enrollment.current_step_index > first.step_index)
        .unwrap_or(false))
}

fn build_message(
    business: &Business,
    customer: &Customer,
    prepared: &PreparedSend,
) -> Result<OutgoingMessage> {
    let to = customer
        .contact_for(prepared.channel)
        .ok_or_else(|| RevloopError::config("customer lost contact info mid-pass"))?
        .to_string();
    let vars = RenderVars::new(business, customer);
    Ok(OutgoingMessage {
        channel: prepared.channel,
        to,
        subject: prepared.subject.as_deref().map(|s| template::render(s, &vars)),
        body: template::render(&prepared.body, &vars),
    })
}

/// Bounded-timeout wrapper around the transport; a hung send is a
/// transient failure, not a stalled batch.
async fn deliver(
    outbound: &dyn Outbound,
    message: &OutgoingMessage,
    cfg: &ExecutorConfig,
) -> std::result::Result<(), DeliveryError> {
    let timeout = std::time::Duration::from_secs(cfg.send_timeout_secs);
    match tokio::time::timeout(timeout, outbound.deliver(message)).await {
        Ok(result) => result,
        Err(_) => Err(DeliveryError::Transient("delivery timed out".into())),
    }
}

/// Exponential: base * 2^attempts, capped to keep the shift sane.
fn backoff(cfg: &ExecutorConfig, prior_attempts: u32) -> Duration {
    Duration::seconds((cfg.retry_backoff_secs << prior_attempts.min(6)) as i64)
}
