//! Enrollment management — bind a customer to a sequence exactly once.

use crate::matcher;
use crate::telemetry::Telemetry;
use chrono::{Duration, Utc};
use revloop_core::error::{Result, RevloopError};
use revloop_core::events;
use revloop_core::types::{SequenceStatus, TriggerSource};
use revloop_db::{Enrollment, NewCustomer, Store, TenantCtx};
use serde::Serialize;

/// Result of a single enroll call.
#[derive(Debug)]
pub enum EnrollOutcome {
    Created(Enrollment),
    /// The dedup invariant fired: an active enrollment already exists for
    /// this (sequence, customer) pair. Benign — no new row was created.
    AlreadyActive(Enrollment),
}

impl EnrollOutcome {
    pub fn enrollment(&self) -> &Enrollment {
        match self {
            Self::Created(e) | Self::AlreadyActive(e) => e,
        }
    }

    pub fn is_created(&self) -> bool {
        matches!(self, Self::Created(_))
    }
}

/// Enroll a customer into a sequence.
///
/// Dedup first: an existing active enrollment is returned untouched. A
/// sequence without steps fails with [`RevloopError::NoStepsConfigured`]
/// before any row is written — no dangling enrollments. The first step's
/// wait defines the initial `next_run_at` (wait_ms 0 = next executor pass).
pub fn enroll(
    store: &Store,
    ctx: &TenantCtx,
    sequence_id: &str,
    customer_id: &str,
    trigger_source: TriggerSource,
    telemetry: &Telemetry,
) -> Result<EnrollOutcome> {
    if let Some(existing) = store.find_active_enrollment(ctx, sequence_id, customer_id)? {
        tracing::debug!(
            "Customer {customer_id} already active in sequence {sequence_id}, skipping"
        );
        return Ok(EnrollOutcome::AlreadyActive(existing));
    }

    let first_step = store
        .first_step(ctx, sequence_id)?
        .ok_or_else(|| RevloopError::NoStepsConfigured(sequence_id.to_string()))?;

    let now = Utc::now();
    let next_run_at = now + Duration::milliseconds(first_step.wait_ms);
    let meta = serde_json::json!({
        "trigger_source": trigger_source.as_str(),
        "enrolled_at": now.to_rfc3339(),
    });

    let enrollment = match store.insert_enrollment(
        ctx,
        sequence_id,
        customer_id,
        first_step.step_index,
        next_run_at,
        meta,
    ) {
        Ok(e) => e,
        // Lost a race with a concurrent enroll — the unique index caught it.
        // Same benign outcome as the lookup path.
        Err(RevloopError::Duplicate(_)) => {
            let existing = store
                .find_active_enrollment(ctx, sequence_id, customer_id)?
                .ok_or_else(|| RevloopError::db("duplicate enrollment vanished"))?;
            return Ok(EnrollOutcome::AlreadyActive(existing));
        }
        Err(e) => return Err(e),
    };

    tracing::info!(
        "📬 Enrolled customer {customer_id} in sequence {sequence_id} (first send {next_run_at})"
    );
    store
        .log_event(
            Some(ctx.business_id()),
            "enrollment_created",
            Some(&format!("sequence={sequence_id} customer={customer_id}")),
        )
        .ok();
    telemetry.emit(
        "enrollment_created",
        serde_json::json!({
            "business_id": ctx.business_id(),
            "sequence_id": sequence_id,
            "customer_id": customer_id,
            "trigger_source": trigger_source.as_str(),
        }),
    );

    Ok(EnrollOutcome::Created(enrollment))
}

/// Manual enrollment — gated on the sequence's opt-in flag and status.
pub fn enroll_manual(
    store: &Store,
    ctx: &TenantCtx,
    sequence_id: &str,
    customer_id: &str,
    telemetry: &Telemetry,
) -> Result<EnrollOutcome> {
    let sequence = store
        .get_sequence(ctx, sequence_id)?
        .ok_or_else(|| RevloopError::not_found(format!("sequence {sequence_id}")))?;
    if !sequence.allow_manual_enroll {
        return Err(RevloopError::config(format!(
            "sequence '{}' does not allow manual enrollment",
            sequence.name
        )));
    }
    if sequence.status != SequenceStatus::Active {
        return Err(RevloopError::config(format!(
            "sequence '{}' is {}, not active",
            sequence.name,
            sequence.status.as_str()
        )));
    }
    if store.get_customer(ctx, customer_id)?.is_none() {
        return Err(RevloopError::not_found(format!("customer {customer_id}")));
    }
    enroll(store, ctx, sequence_id, customer_id, TriggerSource::Manual, telemetry)
}

/// Per-sequence outcome inside a trigger report.
#[derive(Debug, Serialize)]
pub struct SequenceEnrollResult {
    pub sequence_id: String,
    pub sequence_name: String,
    /// "created", "already_active", or "error".
    pub outcome: String,
    pub enrollment_id: Option<String>,
    pub error: Option<String>,
}

/// What a trigger event did, sequence by sequence.
#[derive(Debug, Serialize)]
pub struct TriggerReport {
    pub event_type: String,
    pub customer_id: String,
    pub results: Vec<SequenceEnrollResult>,
}

impl TriggerReport {
    pub fn enrolled_count(&self) -> usize {
        self.results.iter().filter(|r| r.outcome == "created").count()
    }
}

/// The trigger processor: normalize the event, resolve (or create) the
/// customer, then enroll once per matched sequence. Failures are isolated
/// per sequence — one bad sequence never aborts the rest — and the report
/// records each outcome for the caller's response body.
pub fn process_trigger_event(
    store: &Store,
    ctx: &TenantCtx,
    raw_event_type: &str,
    customer_data: &NewCustomer,
    telemetry: &Telemetry,
) -> Result<TriggerReport> {
    let event_type = events::normalize(raw_event_type);
    let customer = resolve_customer(store, ctx, customer_data)?;
    let sequences = matcher::find_matching_sequences(store, ctx, &event_type)?;

    let mut results = Vec::with_capacity(sequences.len());
    for sequence in &sequences {
        match enroll(
            store,
            ctx,
            &sequence.id,
            &customer.id,
            TriggerSource::Webhook,
            telemetry,
        ) {
            Ok(outcome) => results.push(SequenceEnrollResult {
                sequence_id: sequence.id.clone(),
                sequence_name: sequence.name.clone(),
                outcome: if outcome.is_created() {
                    "created".into()
                } else {
                    "already_active".into()
                },
                enrollment_id: Some(outcome.enrollment().id.clone()),
                error: None,
            }),
            Err(e) => {
                tracing::warn!(
                    "Enroll failed for sequence {} / customer {}: {e}",
                    sequence.id,
                    customer.id
                );
                results.push(SequenceEnrollResult {
                    sequence_id: sequence.id.clone(),
                    sequence_name: sequence.name.clone(),
                    outcome: "error".into(),
                    enrollment_id: None,
                    error: Some(e.to_string()),
                });
            }
        }
    }

    store
        .log_event(
            Some(ctx.business_id()),
            "trigger_processed",
            Some(&format!(
                "event={event_type} customer={} matched={}",
                customer.id,
                sequences.len()
            )),
        )
        .ok();

    Ok(TriggerReport {
        event_type,
        customer_id: customer.id,
        results,
    })
}

/// Find the customer a trigger payload refers to, or create them.
/// Match order: CRM (source, external_id) pair, then email, then phone.
fn resolve_customer(
    store: &Store,
    ctx: &TenantCtx,
    data: &NewCustomer,
) -> Result<revloop_db::Customer> {
    if data.source.is_some() && data.external_id.is_some() {
        return store.upsert_customer_external(ctx, data.clone());
    }
    if let Some(email) = data.email.as_deref().filter(|e| !e.is_empty())
        && let Some(found) = store.find_customer_by_email(ctx, email)?
    {
        return Ok(found);
    }
    if let Some(phone) = data.phone.as_deref().filter(|p| !p.is_empty())
        && let Some(found) = store.find_customer_by_phone(ctx, phone)?
    {
        return Ok(found);
    }
    let mut input = data.clone();
    if input.name.trim().is_empty() {
        input.name = "Customer".into();
    }
    store.create_customer(ctx, input)
}

#[cfg(test)]
mod tests {
    use super::*;
    use revloop_core::types::{EnrollmentStatus, StepKind};
    use revloop_db::{NewBusiness, NewSequence, NewStep};

    fn temp_store(tag: &str) -> (Store, std::path::PathBuf) {
        let dir = std::env::temp_dir().join(format!("revloop-test-{tag}"));
        std::fs::remove_dir_all(&dir).ok();
        std::fs::create_dir_all(&dir).unwrap();
        (Store::open(&dir.join("test.db")).unwrap(), dir)
    }

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

    fn active_sequence(store: &Store, ctx: &TenantCtx, trigger: &str) -> String {
        let seq = store
            .create_sequence(
                ctx,
                NewSequence {
                    name: format!("seq for {trigger}"),
                    trigger_event_type: Some(trigger.into()),
                    allow_manual_enroll: true,
                },
            )
            .unwrap();
        store
            .add_step(
                ctx,
                &seq.id,
                NewStep {
                    step_index: 0,
                    kind: StepKind::SendEmail,
                    wait_ms: 0,
                    message_config: serde_json::json!({"subject": "hi", "body": "review us"}),
                },
            )
            .unwrap();
        store
            .set_sequence_status(ctx, &seq.id, SequenceStatus::Active)
            .unwrap();
        seq.id
    }

    #[test]
    fn test_enroll_twice_yields_one_active_row() {
        let (store, dir) = temp_store("enroll-dedup");
        let ctx = setup(&store);
        let seq_id = active_sequence(&store, &ctx, "invoice_paid");
        let customer = store
            .create_customer(
                &ctx,
                NewCustomer {
                    name: "Dana Fox".into(),
                    email: Some("dana@example.com".into()),
                    ..Default::default()
                },
            )
            .unwrap();
        let telemetry = Telemetry::disabled();

        let first = enroll(&store, &ctx, &seq_id, &customer.id, TriggerSource::Webhook, &telemetry)
            .unwrap();
        assert!(first.is_created());

        let second = enroll(&store, &ctx, &seq_id, &customer.id, TriggerSource::Webhook, &telemetry)
            .unwrap();
        assert!(!second.is_created());
        assert_eq!(second.enrollment().id, first.enrollment().id);
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_enroll_without_steps_fails_cleanly() {
        let (store, dir) = temp_store("enroll-nosteps");
        let ctx = setup(&store);
        let seq = store
            .create_sequence(
                &ctx,
                NewSequence {
                    name: "empty".into(),
                    trigger_event_type: Some("invoice_paid".into()),
                    allow_manual_enroll: true,
                },
            )
            .unwrap();
        let customer = store
            .create_customer(
                &ctx,
                NewCustomer {
                    name: "Dana Fox".into(),
                    ..Default::default()
                },
            )
            .unwrap();

        let err = enroll(
            &store,
            &ctx,
            &seq.id,
            &customer.id,
            TriggerSource::Manual,
            &Telemetry::disabled(),
        )
        .unwrap_err();
        assert!(matches!(err, RevloopError::NoStepsConfigured(_)));
        // No dangling enrollment row.
        assert!(
            store
                .find_active_enrollment(&ctx, &seq.id, &customer.id)
                .unwrap()
                .is_none()
        );
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_trigger_matches_only_active_sequence() {
        let (store, dir) = temp_store("enroll-trigger");
        let ctx = setup(&store);
        let active_id = active_sequence(&store, &ctx, "invoice_paid");
        // Paused sequence on the same trigger.
        let paused = store
            .create_sequence(
                &ctx,
                NewSequence {
                    name: "paused".into(),
                    trigger_event_type: Some("invoice_paid".into()),
                    allow_manual_enroll: true,
                },
            )
            .unwrap();
        store
            .set_sequence_status(&ctx, &paused.id, SequenceStatus::Paused)
            .unwrap();

        let report = process_trigger_event(
            &store,
            &ctx,
            "invoice.paid",
            &NewCustomer {
                name: "Dana Fox".into(),
                email: Some("dana@example.com".into()),
                ..Default::default()
            },
            &Telemetry::disabled(),
        )
        .unwrap();

        assert_eq!(report.event_type, "invoice_paid");
        assert_eq!(report.enrolled_count(), 1);
        assert_eq!(report.results.len(), 1);
        assert_eq!(report.results[0].sequence_id, active_id);
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_trigger_isolates_per_sequence_failures() {
        let (store, dir) = temp_store("enroll-isolate");
        let ctx = setup(&store);
        // One healthy sequence and one with no steps, same trigger.
        let good = active_sequence(&store, &ctx, "job_completed");
        let broken = store
            .create_sequence(
                &ctx,
                NewSequence {
                    name: "broken".into(),
                    trigger_event_type: Some("job_completed".into()),
                    allow_manual_enroll: true,
                },
            )
            .unwrap();
        store
            .set_sequence_status(&ctx, &broken.id, SequenceStatus::Active)
            .unwrap();

        let report = process_trigger_event(
            &store,
            &ctx,
            "job_completed",
            &NewCustomer {
                name: "Sam Li".into(),
                email: Some("sam@example.com".into()),
                ..Default::default()
            },
            &Telemetry::disabled(),
        )
        .unwrap();

        // The broken sequence reports its error; the good one enrolled.
        assert_eq!(report.results.len(), 2);
        assert_eq!(report.enrolled_count(), 1);
        let good_result = report.results.iter().find(|r| r.sequence_id == good).unwrap();
        assert_eq!(good_result.outcome, "created");
        let broken_result = report
            .results
            .iter()
            .find(|r| r.sequence_id == broken.id)
            .unwrap();
        assert_eq!(broken_result.outcome, "error");
        assert!(broken_result.error.is_some());
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_trigger_reuses_customer_by_email() {
        let (store, dir) = temp_store("enroll-resolve");
        let ctx = setup(&store);
        active_sequence(&store, &ctx, "invoice_paid");
        let existing = store
            .create_customer(
                &ctx,
                NewCustomer {
                    name: "Dana Fox".into(),
                    email: Some("dana@example.com".into()),
                    ..Default::default()
                },
            )
            .unwrap();

        let report = process_trigger_event(
            &store,
            &ctx,
            "invoice.paid",
            &NewCustomer {
                name: "D. Fox".into(),
                email: Some("dana@example.com".into()),
                ..Default::default()
            },
            &Telemetry::disabled(),
        )
        .unwrap();
        assert_eq!(report.customer_id, existing.id);
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_manual_enroll_gating() {
        let (store, dir) = temp_store("enroll-manual");
        let ctx = setup(&store);
        let seq = store
            .create_sequence(
                &ctx,
                NewSequence {
                    name: "no-manual".into(),
                    trigger_event_type: None,
                    allow_manual_enroll: false,
                },
            )
            .unwrap();
        store
            .set_sequence_status(&ctx, &seq.id, SequenceStatus::Active)
            .unwrap();
        let customer = store
            .create_customer(
                &ctx,
                NewCustomer {
                    name: "Dana Fox".into(),
                    ..Default::default()
                },
            )
            .unwrap();

        let err = enroll_manual(&store, &ctx, &seq.id, &customer.id, &Telemetry::disabled())
            .unwrap_err();
        assert!(matches!(err, RevloopError::Config(_)));
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_enrollment_meta_records_provenance() {
        let (store, dir) = temp_store("enroll-meta");
        let ctx = setup(&store);
        let seq_id = active_sequence(&store, &ctx, "invoice_paid");
        let customer = store
            .create_customer(
                &ctx,
                NewCustomer {
                    name: "Dana Fox".into(),
                    ..Default::default()
                },
            )
            .unwrap();

        let outcome = enroll(
            &store,
            &ctx,
            &seq_id,
            &customer.id,
            TriggerSource::Import,
            &Telemetry::disabled(),
        )
        .unwrap();
        let enr = outcome.enrollment();
        assert_eq!(enr.status, EnrollmentStatus::Active);
        assert_eq!(enr.meta["trigger_source"], "import");
        assert!(enr.meta["enrolled_at"].is_string());
        std::fs::remove_dir_all(&dir).ok();
    }
}
