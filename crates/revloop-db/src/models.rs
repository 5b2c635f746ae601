//! Record types for every persisted entity.
//!
//! Every entity except `Business` itself carries a `business_id`; the query
//! layer only accepts a [`crate::TenantCtx`], so a forgotten tenant filter is
//! a compile error rather than a data leak.

use chrono::{DateTime, Utc};
use revloop_core::types::{
    ChannelKind, EnrollmentStatus, JobStatus, SequenceStatus, StepKind,
};
use serde::{Deserialize, Serialize};

/// Tenant boundary — owns sequences, customers, and templates.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Business {
    pub id: String,
    pub name: String,
    /// Public review URL injected into message templates.
    pub review_link: Option<String>,
    /// Offset from UTC in minutes, used for quiet-hours math.
    pub utc_offset_minutes: i32,
    /// Local hour [0,24) at which quiet hours begin. Window may wrap
    /// midnight; None on either end disables the check.
    pub quiet_hours_start: Option<u32>,
    pub quiet_hours_end: Option<u32>,
    pub hourly_send_limit: u32,
    pub daily_send_limit: u32,
    /// Minimum days between review requests to the same customer.
    pub cooldown_days: u32,
    pub created_at: DateTime<Utc>,
}

/// Input for creating a business.
#[derive(Debug, Clone, Deserialize)]
pub struct NewBusiness {
    pub name: String,
    #[serde(default)]
    pub review_link: Option<String>,
    #[serde(default)]
    pub utc_offset_minutes: i32,
    #[serde(default)]
    pub quiet_hours_start: Option<u32>,
    #[serde(default)]
    pub quiet_hours_end: Option<u32>,
    #[serde(default = "default_hourly_limit")]
    pub hourly_send_limit: u32,
    #[serde(default = "default_daily_limit")]
    pub daily_send_limit: u32,
    #[serde(default = "default_cooldown_days")]
    pub cooldown_days: u32,
}

fn default_hourly_limit() -> u32 {
    25
}
fn default_daily_limit() -> u32 {
    100
}
fn default_cooldown_days() -> u32 {
    30
}

/// A contactable person belonging to one business.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Customer {
    pub id: String,
    pub business_id: String,
    pub name: String,
    pub email: Option<String>,
    pub phone: Option<String>,
    /// CRM-originated records carry the upstream id + source pair,
    /// unique per business.
    pub external_id: Option<String>,
    pub source: Option<String>,
    pub email_opt_out: bool,
    pub sms_opt_out: bool,
    /// Hard-bounce / suppression-list flag — blocks all channels.
    pub suppressed: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Customer {
    /// The address to use for a channel, if the customer has one.
    pub fn contact_for(&self, channel: ChannelKind) -> Option<&str> {
        match channel {
            ChannelKind::Email => self.email.as_deref().filter(|s| !s.is_empty()),
            ChannelKind::Sms => self.phone.as_deref().filter(|s| !s.is_empty()),
        }
    }

    pub fn opted_out_of(&self, channel: ChannelKind) -> bool {
        match channel {
            ChannelKind::Email => self.email_opt_out,
            ChannelKind::Sms => self.sms_opt_out,
        }
    }

    /// First word of the stored name, for `{{customer.first_name}}`.
    pub fn first_name(&self) -> &str {
        self.name.split_whitespace().next().unwrap_or(&self.name)
    }
}

/// Input for creating or syncing a customer.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct NewCustomer {
    pub name: String,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub phone: Option<String>,
    #[serde(default)]
    pub external_id: Option<String>,
    #[serde(default)]
    pub source: Option<String>,
}

/// An ordered, named automation owned by a business.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Sequence {
    pub id: String,
    pub business_id: String,
    pub name: String,
    pub status: SequenceStatus,
    /// Canonical event this sequence reacts to; None = manual-only.
    pub trigger_event_type: Option<String>,
    pub allow_manual_enroll: bool,
    pub created_at: DateTime<Utc>,
}

/// Input for creating a sequence.
#[derive(Debug, Clone, Deserialize)]
pub struct NewSequence {
    pub name: String,
    #[serde(default)]
    pub trigger_event_type: Option<String>,
    #[serde(default = "bool_true")]
    pub allow_manual_enroll: bool,
}

fn bool_true() -> bool {
    true
}

/// One action within a sequence.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SequenceStep {
    pub id: String,
    pub business_id: String,
    pub sequence_id: String,
    /// Contiguous and monotonic within the sequence.
    pub step_index: i64,
    pub kind: StepKind,
    /// Delay before this step fires, relative to the previous step
    /// (or enrollment creation for the first step).
    pub wait_ms: i64,
    /// Subject/body (or per-channel sub-configs for branch steps) with
    /// `{{variable}}` placeholders; may reference a template by key.
    pub message_config: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

/// Input for adding a step to a sequence.
#[derive(Debug, Clone, Deserialize)]
pub struct NewStep {
    pub step_index: i64,
    pub kind: StepKind,
    #[serde(default)]
    pub wait_ms: i64,
    #[serde(default = "empty_object")]
    pub message_config: serde_json::Value,
}

fn empty_object() -> serde_json::Value {
    serde_json::json!({})
}

/// Runtime state binding one customer to one sequence.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Enrollment {
    pub id: String,
    pub business_id: String,
    pub sequence_id: String,
    pub customer_id: String,
    pub status: EnrollmentStatus,
    pub current_step_index: i64,
    pub next_run_at: Option<DateTime<Utc>>,
    pub last_event_at: Option<DateTime<Utc>>,
    /// Delivery attempts for the current step.
    pub attempts: i64,
    /// Trigger provenance: trigger_source, enrolled_at.
    pub meta: serde_json::Value,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// A generic one-shot unit of delayed work not tied to a sequence step.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduledJob {
    pub id: String,
    pub business_id: String,
    /// "send_message" or "review_reminder".
    pub job_type: String,
    pub payload: serde_json::Value,
    pub run_at: DateTime<Utc>,
    pub status: JobStatus,
    pub attempts: i64,
    pub claimed_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Business-scoped message content a step or one-shot send draws from.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AutomationTemplate {
    pub id: String,
    pub business_id: String,
    /// Semantic key, unique per business (e.g. "post_job_review").
    pub key: String,
    pub name: String,
    pub channels: Vec<ChannelKind>,
    pub subject: Option<String>,
    pub body: String,
    /// Service-type specificity for ranked selection.
    pub service_type: Option<String>,
    pub keywords: Vec<String>,
    pub is_default: bool,
    pub delay_ms: i64,
    /// Bookkeeping only — the engine never reads it back.
    pub last_used_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

/// Input for creating a template.
#[derive(Debug, Clone, Deserialize)]
pub struct NewTemplate {
    pub key: String,
    pub name: String,
    #[serde(default = "default_channels")]
    pub channels: Vec<ChannelKind>,
    #[serde(default)]
    pub subject: Option<String>,
    pub body: String,
    #[serde(default)]
    pub service_type: Option<String>,
    #[serde(default)]
    pub keywords: Vec<String>,
    #[serde(default)]
    pub is_default: bool,
    #[serde(default)]
    pub delay_ms: i64,
}

fn default_channels() -> Vec<ChannelKind> {
    vec![ChannelKind::Email]
}

/// Trailing send counts feeding the rate-limit and cooldown checks.
#[derive(Debug, Clone, Default)]
pub struct SendCounters {
    /// Sends by this business on this channel in the trailing hour.
    pub hour_count: u32,
    /// Sends by this business on this channel in the trailing day.
    pub day_count: u32,
    /// Most recent send to this specific customer on any channel.
    pub last_to_customer: Option<DateTime<Utc>>,
}
