//! Provider webhooks — accounting platform and field-service CRM events,
//! authenticated by HMAC-SHA256 over the raw body.
//!
//! Whatever the provider, the response is 200 once the event is durably
//! accepted; partial enrollment failures surface in logs, never as an
//! error status that would cause an upstream retry storm.

use axum::{
    Json,
    body::Bytes,
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
};
use hmac::{Hmac, Mac};
use revloop_db::NewCustomer;
use sha2::Sha256;
use std::sync::Arc;

use super::server::AppState;

type HmacSha256 = Hmac<Sha256>;

/// `POST /api/v1/webhooks/{provider}`.
pub async fn provider_webhook(
    State(state): State<Arc<AppState>>,
    Path(provider): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> (StatusCode, Json<serde_json::Value>) {
    let signing_key = if state.config.gateway.webhook_signing_key.is_empty() {
        state.config.gateway.shared_secret.clone()
    } else {
        state.config.gateway.webhook_signing_key.clone()
    };
    if !signing_key.is_empty() {
        let signature = headers
            .get("X-Webhook-Signature")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("");
        if !verify_signature(&signing_key, &body, signature) {
            tracing::warn!("Webhook from '{provider}' rejected: bad signature");
            return (
                StatusCode::UNAUTHORIZED,
                Json(serde_json::json!({"ok": false, "error": "invalid webhook signature"})),
            );
        }
    }

    let payload: serde_json::Value = match serde_json::from_slice(&body) {
        Ok(v) => v,
        Err(e) => {
            return (
                StatusCode::BAD_REQUEST,
                Json(serde_json::json!({"ok": false, "error": format!("malformed JSON: {e}")})),
            );
        }
    };

    let Some(event) = extract_event(&provider, &payload) else {
        return (
            StatusCode::BAD_REQUEST,
            Json(serde_json::json!({
                "ok": false,
                "error": "payload missing event name or business_id",
            })),
        );
    };

    let store = state.store.lock().await;
    let ctx = match store.tenant_ctx(&event.business_id) {
        Ok(ctx) => ctx,
        Err(e) => {
            return (
                StatusCode::NOT_FOUND,
                Json(serde_json::json!({"ok": false, "error": e.to_string()})),
            );
        }
    };

    match revloop_engine::enroll::process_trigger_event(
        &store,
        &ctx,
        &event.event_type,
        &event.customer,
        &state.telemetry,
    ) {
        Ok(report) => {
            tracing::info!(
                "Webhook '{provider}' event '{}' → {} enrollment(s)",
                report.event_type,
                report.enrolled_count()
            );
            (
                StatusCode::OK,
                Json(serde_json::json!({
                    "success": true,
                    "enrolled": report.enrolled_count(),
                })),
            )
        }
        Err(e) => {
            // The event itself was accepted; downstream failure is ours to
            // log, not the provider's to retry.
            tracing::error!("Webhook '{provider}' processing failed: {e}");
            store
                .log_event(
                    Some(ctx.business_id()),
                    "webhook_processing_failed",
                    Some(&e.to_string()),
                )
                .ok();
            (
                StatusCode::OK,
                Json(serde_json::json!({"success": true, "enrolled": 0})),
            )
        }
    }
}

/// A provider event reduced to the trigger processor's inputs.
#[derive(Debug)]
struct ProviderEvent {
    business_id: String,
    event_type: String,
    customer: NewCustomer,
}

/// Map a provider payload to the canonical trigger shape. Each provider
/// nests the event name and customer differently; normalization of the
/// event *name* happens later in the trigger processor.
fn extract_event(provider: &str, payload: &serde_json::Value) -> Option<ProviderEvent> {
    let business_id = payload["business_id"].as_str()?.to_string();
    match provider {
        // Accounting platform: {"event": "invoice.paid", "customer": {...}}
        "accounting" => {
            let event_type = payload["event"].as_str()?.to_string();
            let customer = &payload["customer"];
            Some(ProviderEvent {
                business_id,
                event_type,
                customer: NewCustomer {
                    name: customer["name"].as_str().unwrap_or_default().to_string(),
                    email: customer["email"].as_str().map(String::from),
                    phone: customer["phone"].as_str().map(String::from),
                    external_id: customer["id"].as_str().map(String::from),
                    source: Some("accounting".into()),
                },
            })
        }
        // Field-service CRM: {"event_type": "job.completed", "client": {...}}
        "fieldcrm" => {
            let event_type = payload["event_type"].as_str()?.to_string();
            let client = &payload["client"];
            Some(ProviderEvent {
                business_id,
                event_type,
                customer: NewCustomer {
                    name: client["name"].as_str().unwrap_or_default().to_string(),
                    email: client["email"].as_str().map(String::from),
                    phone: client["phone_number"].as_str().map(String::from),
                    external_id: client["id"].as_str().map(String::from),
                    source: Some("fieldcrm".into()),
                },
            })
        }
        // Generic surface: same shape as /triggers/process-event.
        _ => {
            let event_type = payload["event_type"].as_str()?.to_string();
            let customer = serde_json::from_value(payload["customer_data"].clone()).ok()?;
            Some(ProviderEvent {
                business_id,
                event_type,
                customer,
            })
        }
    }
}

/// Constant-shape comparison of the expected hex HMAC against the header.
fn verify_signature(key: &str, body: &[u8], provided: &str) -> bool {
    let mut mac = match HmacSha256::new_from_slice(key.as_bytes()) {
        Ok(mac) => mac,
        Err(_) => return false,
    };
    mac.update(body);
    let expected = hex_encode(&mac.finalize().into_bytes());
    // Strip an optional "sha256=" prefix (GitHub-style headers).
    let provided = provided.strip_prefix("sha256=").unwrap_or(provided);
    expected.eq_ignore_ascii_case(provided)
}

fn hex_encode(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

/// Compute the signature a caller should send — used by tests and useful
/// for integration debugging.
pub fn sign_payload(key: &str, body: &[u8]) -> String {
    let Ok(mut mac) = HmacSha256::new_from_slice(key.as_bytes()) else {
        return String::new();
    };
    mac.update(body);
    hex_encode(&mac.finalize().into_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_signature_round_trip() {
        let key = "hook-secret";
        let body = br#"{"event":"invoice.paid"}"#;
        let sig = sign_payload(key, body);
        assert!(verify_signature(key, body, &sig));
        assert!(verify_signature(key, body, &format!("sha256={sig}")));
        assert!(verify_signature(key, body, &sig.to_uppercase()));
    }

    #[test]
    fn test_signature_rejects_tampering() {
        let key = "hook-secret";
        let sig = sign_payload(key, b"original");
        assert!(!verify_signature(key, b"tampered", &sig));
        assert!(!verify_signature("wrong-key", b"original", &sig));
        assert!(!verify_signature(key, b"original", ""));
    }

    #[test]
    fn test_extract_accounting_event() {
        let payload = serde_json::json!({
            "business_id": "biz-1",
            "event": "invoice.paid",
            "customer": {
                "id": "qb-77",
                "name": "Dana Fox",
                "email": "dana@example.com",
            },
        });
        let event = extract_event("accounting", &payload).unwrap();
        assert_eq!(event.business_id, "biz-1");
        assert_eq!(event.event_type, "invoice.paid");
        assert_eq!(event.customer.external_id.as_deref(), Some("qb-77"));
        assert_eq!(event.customer.source.as_deref(), Some("accounting"));
    }

    #[test]
    fn test_extract_fieldcrm_event() {
        let payload = serde_json::json!({
            "business_id": "biz-1",
            "event_type": "job.completed",
            "client": {
                "id": "crm-9",
                "name": "Sam Li",
                "phone_number": "+15550100",
            },
        });
        let event = extract_event("fieldcrm", &payload).unwrap();
        assert_eq!(event.event_type, "job.completed");
        assert_eq!(event.customer.phone.as_deref(), Some("+15550100"));
        assert_eq!(event.customer.source.as_deref(), Some("fieldcrm"));
    }

    #[test]
    fn test_extract_rejects_incomplete_payloads() {
        assert!(extract_event("accounting", &serde_json::json!({"event": "x"})).is_none());
        assert!(
            extract_event("fieldcrm", &serde_json::json!({"business_id": "b"})).is_none()
        );
    }
}
