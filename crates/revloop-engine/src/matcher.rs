//! Sequence matching — which active sequences react to an event.

use revloop_core::error::Result;
use revloop_db::{Sequence, Store, TenantCtx};

/// Active sequences of this business configured against the canonical
/// event type. An empty result is a normal, silent outcome — "no configured
/// automation" must not fail the caller (a webhook endpoint still returns
/// success upstream).
pub fn find_matching_sequences(
    store: &Store,
    ctx: &TenantCtx,
    event_type: &str,
) -> Result<Vec<Sequence>> {
    let matched = store.find_active_by_trigger(ctx, event_type)?;
    if matched.is_empty() {
        tracing::debug!(
            "No active sequences for event '{}' (business {})",
            event_type,
            ctx.business_id()
        );
    }
    Ok(matched)
}

#[cfg(test)]
mod tests {
    use super::*;
    use revloop_core::types::SequenceStatus;
    use revloop_db::{NewBusiness, NewSequence};

    fn temp_store(tag: &str) -> (Store, std::path::PathBuf) {
        let dir = std::env::temp_dir().join(format!("revloop-test-{tag}"));
        std::fs::remove_dir_all(&dir).ok();
        std::fs::create_dir_all(&dir).unwrap();
        (Store::open(&dir.join("test.db")).unwrap(), dir)
    }

    #[test]
    fn test_only_active_sequences_match() {
        let (store, dir) = temp_store("matcher");
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

        let active = store
            .create_sequence(
                &ctx,
                NewSequence {
                    name: "Invoice follow-up".into(),
                    trigger_event_type: Some("invoice_paid".into()),
                    allow_manual_enroll: true,
                },
            )
            .unwrap();
        store
            .set_sequence_status(&ctx, &active.id, SequenceStatus::Active)
            .unwrap();

        // Same trigger, but paused — must not match.
        let paused = store
            .create_sequence(
                &ctx,
                NewSequence {
                    name: "Old invoice follow-up".into(),
                    trigger_event_type: Some("invoice_paid".into()),
                    allow_manual_enroll: true,
                },
            )
            .unwrap();
        store
            .set_sequence_status(&ctx, &paused.id, SequenceStatus::Paused)
            .unwrap();

        let matched = find_matching_sequences(&store, &ctx, "invoice_paid").unwrap();
        assert_eq!(matched.len(), 1);
        assert_eq!(matched[0].id, active.id);

        // Unconfigured event: empty, not an error.
        let none = find_matching_sequences(&store, &ctx, "estimate_accepted").unwrap();
        assert!(none.is_empty());
        std::fs::remove_dir_all(&dir).ok();
    }
}
