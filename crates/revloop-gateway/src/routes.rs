//! API route handlers for the gateway.

use axum::{
    Json,
    extract::{Path, State},
    http::StatusCode,
};
use chrono::{DateTime, Utc};
use revloop_core::error::RevloopError;
use revloop_core::types::SequenceStatus;
use revloop_db::{NewBusiness, NewCustomer, NewSequence, NewStep, NewTemplate};
use revloop_engine::enroll::EnrollOutcome;
use serde::Deserialize;
use std::sync::Arc;

use super::server::AppState;

type ApiResponse = (StatusCode, Json<serde_json::Value>);

/// Map engine errors onto conventional HTTP status codes.
fn error_response(err: &RevloopError) -> ApiResponse {
    let status = match err {
        RevloopError::NotFound(_) => StatusCode::NOT_FOUND,
        RevloopError::Duplicate(_)
        | RevloopError::Config(_)
        | RevloopError::Template(_)
        | RevloopError::NoStepsConfigured(_) => StatusCode::BAD_REQUEST,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (
        status,
        Json(serde_json::json!({"ok": false, "error": err.to_string()})),
    )
}

fn ok(body: serde_json::Value) -> ApiResponse {
    (StatusCode::OK, Json(body))
}

/// Health check endpoint.
pub async fn health_check(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "service": "revloop-gateway",
        "version": env!("CARGO_PKG_VERSION"),
        "uptime_secs": state.start_time.elapsed().as_secs(),
    }))
}

// ─── Trigger ingestion ──────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct ProcessEventBody {
    pub business_id: String,
    pub event_type: String,
    #[serde(default)]
    pub customer_data: NewCustomer,
}

/// `POST /api/v1/triggers/process-event` — normalize, match, enroll.
///
/// Returns 200 once the event is accepted even when individual sequence
/// enrollments failed; partial failures live in the per-sequence results,
/// not in the status code (upstream providers must not retry-storm us).
pub async fn process_event(
    State(state): State<Arc<AppState>>,
    Json(body): Json<ProcessEventBody>,
) -> ApiResponse {
    if body.event_type.trim().is_empty() {
        return error_response(&RevloopError::config("event_type is required"));
    }
    let store = state.store.lock().await;
    let ctx = match store.tenant_ctx(&body.business_id) {
        Ok(ctx) => ctx,
        Err(e) => return error_response(&e),
    };
    match revloop_engine::enroll::process_trigger_event(
        &store,
        &ctx,
        &body.event_type,
        &body.customer_data,
        &state.telemetry,
    ) {
        Ok(report) => ok(serde_json::json!({
            "success": true,
            "event_type": report.event_type,
            "customer_id": report.customer_id,
            "enrolled": report.enrolled_count(),
            "enrollments": report.results,
        })),
        Err(e) => error_response(&e),
    }
}

// ─── Manual enrollment ──────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct ManualEnrollBody {
    pub business_id: String,
    pub sequence_id: String,
    pub customer_id: String,
}

/// `POST /api/v1/sequences/enroll` — 400 when already actively enrolled.
pub async fn manual_enroll(
    State(state): State<Arc<AppState>>,
    Json(body): Json<ManualEnrollBody>,
) -> ApiResponse {
    let store = state.store.lock().await;
    let ctx = match store.tenant_ctx(&body.business_id) {
        Ok(ctx) => ctx,
        Err(e) => return error_response(&e),
    };
    match revloop_engine::enroll::enroll_manual(
        &store,
        &ctx,
        &body.sequence_id,
        &body.customer_id,
        &state.telemetry,
    ) {
        Ok(EnrollOutcome::Created(enrollment)) => ok(serde_json::json!({
            "ok": true,
            "enrollment": enrollment,
            "next_run_at": enrollment.next_run_at,
        })),
        Ok(EnrollOutcome::AlreadyActive(enrollment)) => (
            StatusCode::BAD_REQUEST,
            Json(serde_json::json!({
                "ok": false,
                "error": "customer is already actively enrolled in this sequence",
                "enrollment_id": enrollment.id,
            })),
        ),
        Err(e) => error_response(&e),
    }
}

// ─── Executor ──────────────────────────────────────

/// `POST /_cron/automation-executor` — one pass over due work. Intended
/// for an external scheduler; safe to call repeatedly, a pass with nothing
/// due is a no-op.
pub async fn run_executor(State(state): State<Arc<AppState>>) -> ApiResponse {
    let store = state.store.lock().await;
    match revloop_engine::executor::run_pass(
        &store,
        state.outbound.as_ref(),
        &state.config.executor,
        &state.telemetry,
        Utc::now(),
    )
    .await
    {
        Ok(summary) => ok(serde_json::json!({"ok": true, "summary": summary})),
        Err(e) => error_response(&e),
    }
}

// ─── Directory ──────────────────────────────────────

pub async fn create_business(
    State(state): State<Arc<AppState>>,
    Json(body): Json<NewBusiness>,
) -> ApiResponse {
    let store = state.store.lock().await;
    match store.create_business(body) {
        Ok(business) => ok(serde_json::json!({"ok": true, "business": business})),
        Err(e) => error_response(&e),
    }
}

pub async fn list_businesses(State(state): State<Arc<AppState>>) -> ApiResponse {
    let store = state.store.lock().await;
    match store.list_businesses() {
        Ok(businesses) => ok(serde_json::json!({"ok": true, "businesses": businesses})),
        Err(e) => error_response(&e),
    }
}

pub async fn create_customer(
    State(state): State<Arc<AppState>>,
    Path(business_id): Path<String>,
    Json(body): Json<NewCustomer>,
) -> ApiResponse {
    let store = state.store.lock().await;
    let ctx = match store.tenant_ctx(&business_id) {
        Ok(ctx) => ctx,
        Err(e) => return error_response(&e),
    };
    match store.create_customer(&ctx, body) {
        Ok(customer) => ok(serde_json::json!({"ok": true, "customer": customer})),
        Err(e) => error_response(&e),
    }
}

/// CRM-shaped upsert by (source, external_id).
pub async fn sync_customer(
    State(state): State<Arc<AppState>>,
    Path(business_id): Path<String>,
    Json(body): Json<NewCustomer>,
) -> ApiResponse {
    let store = state.store.lock().await;
    let ctx = match store.tenant_ctx(&business_id) {
        Ok(ctx) => ctx,
        Err(e) => return error_response(&e),
    };
    match store.upsert_customer_external(&ctx, body) {
        Ok(customer) => ok(serde_json::json!({"ok": true, "customer": customer})),
        Err(e) => error_response(&e),
    }
}

#[derive(Debug, Deserialize)]
pub struct ConsentBody {
    /// "email" or "sms"; required with `opted_out`.
    #[serde(default)]
    pub channel: Option<String>,
    #[serde(default)]
    pub opted_out: Option<bool>,
    /// Hard-bounce / suppression-list flag — blocks every channel.
    #[serde(default)]
    pub suppressed: Option<bool>,
}

/// `PUT .../customers/{customer_id}/consent` — opt-outs and suppression.
pub async fn update_consent(
    State(state): State<Arc<AppState>>,
    Path((business_id, customer_id)): Path<(String, String)>,
    Json(body): Json<ConsentBody>,
) -> ApiResponse {
    let store = state.store.lock().await;
    let ctx = match store.tenant_ctx(&business_id) {
        Ok(ctx) => ctx,
        Err(e) => return error_response(&e),
    };
    if store.get_customer(&ctx, &customer_id).ok().flatten().is_none() {
        return error_response(&RevloopError::not_found(format!("customer {customer_id}")));
    }
    if let (Some(channel), Some(opted_out)) = (body.channel.as_deref(), body.opted_out) {
        let Some(channel) = revloop_core::types::ChannelKind::parse(channel) else {
            return error_response(&RevloopError::config(format!("unknown channel '{channel}'")));
        };
        if let Err(e) = store.set_customer_opt_out(&ctx, &customer_id, channel, opted_out) {
            return error_response(&e);
        }
    }
    if body.suppressed == Some(true) {
        if let Err(e) = store.suppress_customer(&ctx, &customer_id) {
            return error_response(&e);
        }
    }
    match store.get_customer(&ctx, &customer_id) {
        Ok(Some(customer)) => ok(serde_json::json!({"ok": true, "customer": customer})),
        Ok(None) => error_response(&RevloopError::not_found(format!("customer {customer_id}"))),
        Err(e) => error_response(&e),
    }
}

/// `POST .../enrollments/{enrollment_id}/cancel` — explicit termination.
pub async fn cancel_enrollment(
    State(state): State<Arc<AppState>>,
    Path((business_id, enrollment_id)): Path<(String, String)>,
) -> ApiResponse {
    let store = state.store.lock().await;
    let ctx = match store.tenant_ctx(&business_id) {
        Ok(ctx) => ctx,
        Err(e) => return error_response(&e),
    };
    match store.cancel_enrollment(&ctx, &enrollment_id, Utc::now()) {
        Ok(()) => ok(serde_json::json!({"ok": true, "status": "cancelled"})),
        Err(e) => error_response(&e),
    }
}

pub async fn create_sequence(
    State(state): State<Arc<AppState>>,
    Path(business_id): Path<String>,
    Json(body): Json<NewSequence>,
) -> ApiResponse {
    let store = state.store.lock().await;
    let ctx = match store.tenant_ctx(&business_id) {
        Ok(ctx) => ctx,
        Err(e) => return error_response(&e),
    };
    match store.create_sequence(&ctx, body) {
        Ok(sequence) => ok(serde_json::json!({"ok": true, "sequence": sequence})),
        Err(e) => error_response(&e),
    }
}

pub async fn list_sequences(
    State(state): State<Arc<AppState>>,
    Path(business_id): Path<String>,
) -> ApiResponse {
    let store = state.store.lock().await;
    let ctx = match store.tenant_ctx(&business_id) {
        Ok(ctx) => ctx,
        Err(e) => return error_response(&e),
    };
    match store.list_sequences(&ctx) {
        Ok(sequences) => ok(serde_json::json!({"ok": true, "sequences": sequences})),
        Err(e) => error_response(&e),
    }
}

pub async fn add_step(
    State(state): State<Arc<AppState>>,
    Path((business_id, sequence_id)): Path<(String, String)>,
    Json(body): Json<NewStep>,
) -> ApiResponse {
    let store = state.store.lock().await;
    let ctx = match store.tenant_ctx(&business_id) {
        Ok(ctx) => ctx,
        Err(e) => return error_response(&e),
    };
    if store.get_sequence(&ctx, &sequence_id).ok().flatten().is_none() {
        return error_response(&RevloopError::not_found(format!("sequence {sequence_id}")));
    }
    match store.add_step(&ctx, &sequence_id, body) {
        Ok(step) => ok(serde_json::json!({"ok": true, "step": step})),
        Err(e) => error_response(&e),
    }
}

pub async fn list_steps(
    State(state): State<Arc<AppState>>,
    Path((business_id, sequence_id)): Path<(String, String)>,
) -> ApiResponse {
    let store = state.store.lock().await;
    let ctx = match store.tenant_ctx(&business_id) {
        Ok(ctx) => ctx,
        Err(e) => return error_response(&e),
    };
    match store.list_steps(&ctx, &sequence_id) {
        Ok(steps) => ok(serde_json::json!({"ok": true, "steps": steps})),
        Err(e) => error_response(&e),
    }
}

#[derive(Debug, Deserialize)]
pub struct SetStatusBody {
    pub status: String,
}

pub async fn set_sequence_status(
    State(state): State<Arc<AppState>>,
    Path((business_id, sequence_id)): Path<(String, String)>,
    Json(body): Json<SetStatusBody>,
) -> ApiResponse {
    let Some(status) = SequenceStatus::parse(&body.status) else {
        return error_response(&RevloopError::config(format!(
            "unknown sequence status '{}'",
            body.status
        )));
    };
    let store = state.store.lock().await;
    let ctx = match store.tenant_ctx(&business_id) {
        Ok(ctx) => ctx,
        Err(e) => return error_response(&e),
    };
    match store.set_sequence_status(&ctx, &sequence_id, status) {
        Ok(()) => ok(serde_json::json!({"ok": true, "status": status.as_str()})),
        Err(e) => error_response(&e),
    }
}

pub async fn create_template(
    State(state): State<Arc<AppState>>,
    Path(business_id): Path<String>,
    Json(body): Json<NewTemplate>,
) -> ApiResponse {
    let store = state.store.lock().await;
    let ctx = match store.tenant_ctx(&business_id) {
        Ok(ctx) => ctx,
        Err(e) => return error_response(&e),
    };
    match store.create_template(&ctx, body) {
        Ok(template) => ok(serde_json::json!({"ok": true, "template": template})),
        Err(e) => error_response(&e),
    }
}

pub async fn list_templates(
    State(state): State<Arc<AppState>>,
    Path(business_id): Path<String>,
) -> ApiResponse {
    let store = state.store.lock().await;
    let ctx = match store.tenant_ctx(&business_id) {
        Ok(ctx) => ctx,
        Err(e) => return error_response(&e),
    };
    match store.list_templates(&ctx) {
        Ok(templates) => ok(serde_json::json!({"ok": true, "templates": templates})),
        Err(e) => error_response(&e),
    }
}

// ─── One-shot jobs ──────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct ScheduleJobBody {
    pub business_id: String,
    pub job_type: String,
    #[serde(default)]
    pub payload: serde_json::Value,
    /// Defaults to "now" — eligible on the next executor pass.
    #[serde(default)]
    pub run_at: Option<DateTime<Utc>>,
}

/// `POST /api/v1/jobs/schedule` — enqueue a one-shot send (e.g. an
/// already-composed review request at time T, or a missed-review reminder).
pub async fn schedule_job(
    State(state): State<Arc<AppState>>,
    Json(body): Json<ScheduleJobBody>,
) -> ApiResponse {
    if !matches!(body.job_type.as_str(), "send_message" | "review_reminder") {
        return error_response(&RevloopError::config(format!(
            "unknown job type '{}'",
            body.job_type
        )));
    }
    let store = state.store.lock().await;
    let ctx = match store.tenant_ctx(&body.business_id) {
        Ok(ctx) => ctx,
        Err(e) => return error_response(&e),
    };
    let run_at = body.run_at.unwrap_or_else(Utc::now);
    match store.enqueue_job(&ctx, &body.job_type, body.payload, run_at) {
        Ok(job) => ok(serde_json::json!({"ok": true, "job": job})),
        Err(e) => error_response(&e),
    }
}
