//! # Revloop Engine
//!
//! The trigger-to-enrollment-to-delivery core. Stateless between
//! invocations — all shared state lives in the [`revloop_db::Store`].
//!
//! ## Architecture
//! ```text
//! trigger event (webhook / API)
//!   → enroll::process_trigger_event
//!       → events::normalize (revloop-core)
//!       → matcher::find_matching_sequences
//!       → enroll::enroll            one per matched sequence, isolated
//!
//! [time passes]
//!
//! executor::run_pass (fixed cadence)
//!   → sweep stale claims
//!   → claim due jobs + enrollment steps (atomic conditional update)
//!   → safety::check_send gate       soft veto → reschedule, hard → fail
//!   → template::render → Outbound
//!   → schedule::schedule_next       advance or complete the enrollment
//! ```

pub mod enroll;
pub mod executor;
pub mod matcher;
pub mod safety;
pub mod schedule;
pub mod telemetry;
pub mod template;

pub use enroll::{EnrollOutcome, SequenceEnrollResult, TriggerReport};
pub use executor::ExecutorSummary;
pub use safety::{DenyReason, Verdict};
pub use telemetry::Telemetry;
