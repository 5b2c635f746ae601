//! Step scheduling — compute and persist an enrollment's next due time.

use chrono::{DateTime, Duration, Utc};
use revloop_core::error::Result;
use revloop_db::{Enrollment, Store, TenantCtx};

/// Advance past the step that just fired.
///
/// Locates the next step by ascending index; if found, the enrollment stays
/// active with `next_run_at = now + wait_ms` and the returned time. If the
/// steps are exhausted the enrollment transitions to `completed` and None
/// is returned — the happy-path terminal state.
///
/// `wait_ms = 0` means "eligible on the next executor pass", never a
/// synchronous dispatch.
pub fn schedule_next(
    store: &Store,
    ctx: &TenantCtx,
    enrollment: &Enrollment,
    now: DateTime<Utc>,
) -> Result<Option<DateTime<Utc>>> {
    match store.next_step_after(ctx, &enrollment.sequence_id, enrollment.current_step_index)? {
        Some(next) => {
            let next_run_at = now + Duration::milliseconds(next.wait_ms);
            store.advance_enrollment(ctx, &enrollment.id, next.step_index, next_run_at, now)?;
            tracing::debug!(
                "Enrollment {} advanced to step {} (due {})",
                enrollment.id,
                next.step_index,
                next_run_at
            );
            Ok(Some(next_run_at))
        }
        None => {
            store.complete_enrollment(ctx, &enrollment.id, now)?;
            tracing::info!("Enrollment {} completed", enrollment.id);
            Ok(None)
        }
    }
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

    #[test]
    fn test_advance_then_complete() {
        let (store, dir) = temp_store("schedule");
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
        let ctx = store.tenant_ctx(&biz.id).unwrap();
        let seq = store
            .create_sequence(
                &ctx,
                NewSequence {
                    name: "two-step".into(),
                    trigger_event_type: Some("job_completed".into()),
                    allow_manual_enroll: true,
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
                    message_config: serde_json::json!({"subject": "hi", "body": "b"}),
                },
            )
            .unwrap();
        store
            .add_step(
                &ctx,
                &seq.id,
                NewStep {
                    step_index: 1,
                    kind: StepKind::SendSms,
                    wait_ms: 86_400_000,
                    message_config: serde_json::json!({"body": "b"}),
                },
            )
            .unwrap();

        let now = Utc::now();
        let enr = store
            .insert_enrollment(&ctx, &seq.id, "cust-1", 0, now, serde_json::json!({}))
            .unwrap();

        // Step 0 fired → advance to the SMS step, one day out.
        let next = schedule_next(&store, &ctx, &enr, now).unwrap().unwrap();
        assert_eq!(next, now + Duration::milliseconds(86_400_000));
        let advanced = store.get_enrollment(&ctx, &enr.id).unwrap().unwrap();
        assert_eq!(advanced.current_step_index, 1);
        assert_eq!(advanced.status, EnrollmentStatus::Active);

        // Step 1 fired → no more steps → completed, next_run_at cleared.
        let done = schedule_next(&store, &ctx, &advanced, now).unwrap();
        assert!(done.is_none());
        let completed = store.get_enrollment(&ctx, &enr.id).unwrap().unwrap();
        assert_eq!(completed.status, EnrollmentStatus::Completed);
        assert!(completed.next_run_at.is_none());
        std::fs::remove_dir_all(&dir).ok();
    }
}
