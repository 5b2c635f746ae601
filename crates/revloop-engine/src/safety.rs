//! Safety rules — guard predicates consulted before any send.
//!
//! All checks must pass; the first failure wins and its reason decides
//! reschedule-vs-fail in the executor (time-based vetoes reschedule,
//! identity/consent vetoes hard-fail).

use chrono::{DateTime, Duration, FixedOffset, NaiveTime, TimeZone, Timelike, Utc};
use revloop_core::types::ChannelKind;
use revloop_db::{Business, Customer, SendCounters};

/// Outcome of the safety gate.
#[derive(Debug, Clone, PartialEq)]
pub enum Verdict {
    Allow,
    Deny(DenyReason),
}

/// Why a send was vetoed.
#[derive(Debug, Clone, PartialEq)]
pub enum DenyReason {
    /// Hard-bounce / suppression list — blocks every channel.
    Suppressed,
    /// Customer opted out of this channel.
    OptedOut,
    /// Customer has no address for this channel.
    NoContactInfo,
    /// Inside the business's configured quiet window.
    QuietHours { resume_at: DateTime<Utc> },
    /// Trailing-hour send budget exhausted.
    HourlyLimit,
    /// Trailing-day send budget exhausted.
    DailyLimit,
    /// This customer was asked for a review too recently.
    CooldownActive { until: DateTime<Utc> },
}

impl DenyReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Suppressed => "suppressed",
            Self::OptedOut => "opted_out",
            Self::NoContactInfo => "no_contact_info",
            Self::QuietHours { .. } => "quiet_hours",
            Self::HourlyLimit => "hourly_limit",
            Self::DailyLimit => "daily_limit",
            Self::CooldownActive { .. } => "cooldown_active",
        }
    }

    /// Time-based vetoes clear on their own — reschedule instead of failing.
    pub fn is_reschedulable(&self) -> bool {
        matches!(
            self,
            Self::QuietHours { .. }
                | Self::HourlyLimit
                | Self::DailyLimit
                | Self::CooldownActive { .. }
        )
    }

    /// When a rescheduled unit should become eligible again.
    pub fn retry_at(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match self {
            Self::QuietHours { resume_at } => Some(*resume_at),
            Self::HourlyLimit => Some(now + Duration::minutes(15)),
            Self::DailyLimit => Some(now + Duration::hours(2)),
            Self::CooldownActive { until } => Some(*until),
            _ => None,
        }
    }
}

/// Run every guard. `continuation` marks a step in an already-running
/// sequence: the per-customer cooldown only gates the *start* of outreach,
/// not later steps of the same enrollment (which would otherwise trip on
/// their own step-one send).
pub fn check_send(
    business: &Business,
    customer: &Customer,
    channel: ChannelKind,
    now: DateTime<Utc>,
    counters: &SendCounters,
    continuation: bool,
) -> Verdict {
    if customer.suppressed {
        return Verdict::Deny(DenyReason::Suppressed);
    }
    if customer.opted_out_of(channel) {
        return Verdict::Deny(DenyReason::OptedOut);
    }
    if customer.contact_for(channel).is_none() {
        return Verdict::Deny(DenyReason::NoContactInfo);
    }
    if let Some(resume_at) = quiet_hours_resume(business, now) {
        return Verdict::Deny(DenyReason::QuietHours { resume_at });
    }
    if counters.hour_count >= business.hourly_send_limit {
        return Verdict::Deny(DenyReason::HourlyLimit);
    }
    if counters.day_count >= business.daily_send_limit {
        return Verdict::Deny(DenyReason::DailyLimit);
    }
    if !continuation
        && let Some(last) = counters.last_to_customer
    {
        let until = last + Duration::days(business.cooldown_days as i64);
        if until > now {
            return Verdict::Deny(DenyReason::CooldownActive { until });
        }
    }
    Verdict::Allow
}

/// If `now` falls inside the business's quiet window, the UTC instant at
/// which the window ends; None when outside or unconfigured. The window is
/// expressed in local wall-clock hours and may wrap midnight (e.g. 21 → 8).
fn quiet_hours_resume(business: &Business, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
    let start = business.quiet_hours_start?;
    let end = business.quiet_hours_end?;
    if start == end || start > 23 || end > 23 {
        return None;
    }
    let offset = FixedOffset::east_opt(business.utc_offset_minutes * 60)?;
    let local = now.with_timezone(&offset);
    let hour = local.hour();
    let in_quiet = if start < end {
        hour >= start && hour < end
    } else {
        hour >= start || hour < end
    };
    if !in_quiet {
        return None;
    }
    // Evening side of a wrapping window resumes tomorrow morning.
    let resume_date = if start > end && hour >= start {
        local.date_naive() + Duration::days(1)
    } else {
        local.date_naive()
    };
    let resume_naive = resume_date.and_time(NaiveTime::from_hms_opt(end, 0, 0)?);
    let resume_local = offset.from_local_datetime(&resume_naive).single()?;
    Some(resume_local.with_timezone(&Utc))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn business(quiet: Option<(u32, u32)>, offset_minutes: i32) -> Business {
        Business {
            id: "b1".into(),
            name: "Ace Plumbing".into(),
            review_link: None,
            utc_offset_minutes: offset_minutes,
            quiet_hours_start: quiet.map(|q| q.0),
            quiet_hours_end: quiet.map(|q| q.1),
            hourly_send_limit: 2,
            daily_send_limit: 5,
            cooldown_days: 30,
            created_at: Utc::now(),
        }
    }

    fn customer(email: Option<&str>, phone: Option<&str>) -> Customer {
        Customer {
            id: "c1".into(),
            business_id: "b1".into(),
            name: "Dana Fox".into(),
            email: email.map(String::from),
            phone: phone.map(String::from),
            external_id: None,
            source: None,
            email_opt_out: false,
            sms_opt_out: false,
            suppressed: false,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn test_no_contact_info_is_hard_deny() {
        let b = business(None, 0);
        let c = customer(None, Some("+15550100"));
        let verdict = check_send(
            &b,
            &c,
            ChannelKind::Email,
            Utc::now(),
            &SendCounters::default(),
            false,
        );
        let Verdict::Deny(reason) = verdict else {
            panic!("expected deny");
        };
        assert_eq!(reason.as_str(), "no_contact_info");
        assert!(!reason.is_reschedulable());
    }

    #[test]
    fn test_opt_out_and_suppression() {
        let b = business(None, 0);
        let mut c = customer(Some("d@example.com"), None);
        c.email_opt_out = true;
        assert_eq!(
            check_send(&b, &c, ChannelKind::Email, Utc::now(), &SendCounters::default(), false),
            Verdict::Deny(DenyReason::OptedOut)
        );
        c.suppressed = true;
        // Suppression wins over everything.
        assert_eq!(
            check_send(&b, &c, ChannelKind::Email, Utc::now(), &SendCounters::default(), false),
            Verdict::Deny(DenyReason::Suppressed)
        );
    }

    #[test]
    fn test_quiet_hours_wrapping_window() {
        // Quiet 21:00 → 08:00 local, business at UTC-5.
        let b = business(Some((21, 8)), -300);
        let c = customer(Some("d@example.com"), None);

        // 03:00 UTC = 22:00 local — inside the evening side.
        let now = Utc.with_ymd_and_hms(2026, 3, 10, 3, 0, 0).unwrap();
        let Verdict::Deny(DenyReason::QuietHours { resume_at }) =
            check_send(&b, &c, ChannelKind::Email, now, &SendCounters::default(), false)
        else {
            panic!("expected quiet-hours deny");
        };
        // Resumes 08:00 local next morning = 13:00 UTC same day.
        assert_eq!(resume_at, Utc.with_ymd_and_hms(2026, 3, 10, 13, 0, 0).unwrap());
        assert!(resume_at > now);

        // 10:00 UTC = 05:00 local — inside the morning side.
        let morning = Utc.with_ymd_and_hms(2026, 3, 10, 10, 0, 0).unwrap();
        assert!(matches!(
            check_send(&b, &c, ChannelKind::Email, morning, &SendCounters::default(), false),
            Verdict::Deny(DenyReason::QuietHours { .. })
        ));

        // 17:00 UTC = 12:00 local — outside.
        let midday = Utc.with_ymd_and_hms(2026, 3, 10, 17, 0, 0).unwrap();
        assert_eq!(
            check_send(&b, &c, ChannelKind::Email, midday, &SendCounters::default(), false),
            Verdict::Allow
        );
    }

    #[test]
    fn test_rate_limits() {
        let b = business(None, 0);
        let c = customer(Some("d@example.com"), None);
        let now = Utc::now();

        let at_hourly = SendCounters {
            hour_count: 2,
            day_count: 2,
            last_to_customer: None,
        };
        let Verdict::Deny(reason) =
            check_send(&b, &c, ChannelKind::Email, now, &at_hourly, false)
        else {
            panic!("expected deny");
        };
        assert_eq!(reason, DenyReason::HourlyLimit);
        assert!(reason.is_reschedulable());
        assert!(reason.retry_at(now).unwrap() > now);

        let at_daily = SendCounters {
            hour_count: 0,
            day_count: 5,
            last_to_customer: None,
        };
        assert_eq!(
            check_send(&b, &c, ChannelKind::Email, now, &at_daily, false),
            Verdict::Deny(DenyReason::DailyLimit)
        );
    }

    #[test]
    fn test_cooldown_skipped_for_sequence_continuation() {
        let b = business(None, 0);
        let c = customer(Some("d@example.com"), None);
        let now = Utc::now();
        let counters = SendCounters {
            hour_count: 0,
            day_count: 1,
            last_to_customer: Some(now - Duration::days(1)),
        };

        // Starting fresh outreach one day after the last request: vetoed.
        assert!(matches!(
            check_send(&b, &c, ChannelKind::Email, now, &counters, false),
            Verdict::Deny(DenyReason::CooldownActive { .. })
        ));
        // The day-two step of an already-running sequence: allowed.
        assert_eq!(
            check_send(&b, &c, ChannelKind::Email, now, &counters, true),
            Verdict::Allow
        );
    }
}
