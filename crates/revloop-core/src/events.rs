//! Canonical event vocabulary.
//!
//! External providers all name their events differently — an accounting
//! platform says `invoice.paid`, a field-service CRM says `job.completed`,
//! a CSV import says `customer_created`. Sequences are configured against a
//! small canonical vocabulary, so every inbound event name passes through
//! [`normalize`] before matching.

/// Canonical event type constants. Sequences store one of these (or a
/// literal provider name, see [`normalize`]) in `trigger_event_type`.
pub const INVOICE_PAID: &str = "invoice_paid";
pub const PAYMENT_RECEIVED: &str = "payment_received";
pub const JOB_COMPLETED: &str = "job_completed";
pub const SERVICE_COMPLETED: &str = "service_completed";
pub const APPOINTMENT_COMPLETED: &str = "appointment_completed";
pub const ESTIMATE_ACCEPTED: &str = "estimate_accepted";
pub const CUSTOMER_CREATED: &str = "customer_created";

/// Map a provider-specific event name to its canonical type.
///
/// Total and pure: an unknown name is returned unchanged (lower-cased,
/// separators unified) rather than rejected, so a business can configure a
/// sequence against a literal provider event name when no mapping exists.
pub fn normalize(raw: &str) -> String {
    // Unify `invoice.paid`, `Invoice-Paid`, `INVOICE_PAID` before lookup.
    let folded: String = raw
        .trim()
        .to_lowercase()
        .chars()
        .map(|c| if c == '.' || c == '-' || c == ' ' { '_' } else { c })
        .collect();

    match folded.as_str() {
        "invoice_paid" | "invoice_payment" | "invoice_closed" => INVOICE_PAID.to_string(),
        "payment_received" | "payment_made" | "payment_success" => PAYMENT_RECEIVED.to_string(),
        "job_completed" | "job_closed" | "job_finished" | "work_order_completed" => {
            JOB_COMPLETED.to_string()
        }
        "service_completed" | "visit_completed" | "ticket_resolved" => {
            SERVICE_COMPLETED.to_string()
        }
        "appointment_completed" | "appointment_finished" => APPOINTMENT_COMPLETED.to_string(),
        "estimate_accepted" | "quote_accepted" | "quote_approved" => ESTIMATE_ACCEPTED.to_string(),
        "customer_created" | "customer_added" | "client_created" | "contact_created" => {
            CUSTOMER_CREATED.to_string()
        }
        _ => folded,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_known_mappings() {
        assert_eq!(normalize("invoice.paid"), INVOICE_PAID);
        assert_eq!(normalize("job.completed"), JOB_COMPLETED);
        assert_eq!(normalize("job_completed"), JOB_COMPLETED);
        assert_eq!(normalize("quote_accepted"), ESTIMATE_ACCEPTED);
        assert_eq!(normalize("customer.created"), CUSTOMER_CREATED);
    }

    #[test]
    fn test_case_and_separator_folding() {
        assert_eq!(normalize("INVOICE.PAID"), INVOICE_PAID);
        assert_eq!(normalize("Invoice-Paid"), INVOICE_PAID);
        assert_eq!(normalize("  invoice paid  "), INVOICE_PAID);
    }

    #[test]
    fn test_unknown_passes_through() {
        assert_eq!(normalize("pool.cleaned"), "pool_cleaned");
        assert_eq!(normalize("some_custom_event"), "some_custom_event");
        // Never errors, never panics — an empty name is just an empty type.
        assert_eq!(normalize(""), "");
    }
}
