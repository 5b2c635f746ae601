//! Directory queries — businesses, customers, templates, and the send log.

use crate::models::*;
use crate::{Store, TenantCtx, new_id, parse_opt_ts, parse_ts, ts};
use chrono::{DateTime, Duration, Utc};
use revloop_core::error::{Result, RevloopError};
use revloop_core::types::ChannelKind;
use rusqlite::{OptionalExtension, params};

/// Shared SELECT column list for customer queries.
const CUSTOMER_SELECT: &str = "SELECT id, business_id, name, email, phone, external_id, source, \
     email_opt_out, sms_opt_out, suppressed, created_at, updated_at FROM customers";

fn row_to_customer(row: &rusqlite::Row) -> rusqlite::Result<Customer> {
    Ok(Customer {
        id: row.get(0)?,
        business_id: row.get(1)?,
        name: row.get(2)?,
        email: row.get(3)?,
        phone: row.get(4)?,
        external_id: row.get(5)?,
        source: row.get(6)?,
        email_opt_out: row.get::<_, i64>(7)? != 0,
        sms_opt_out: row.get::<_, i64>(8)? != 0,
        suppressed: row.get::<_, i64>(9)? != 0,
        created_at: parse_ts(&row.get::<_, String>(10)?),
        updated_at: parse_ts(&row.get::<_, String>(11)?),
    })
}

const BUSINESS_SELECT: &str = "SELECT id, name, review_link, utc_offset_minutes, quiet_hours_start, \
     quiet_hours_end, hourly_send_limit, daily_send_limit, cooldown_days, created_at \
     FROM businesses";

fn row_to_business(row: &rusqlite::Row) -> rusqlite::Result<Business> {
    Ok(Business {
        id: row.get(0)?,
        name: row.get(1)?,
        review_link: row.get(2)?,
        utc_offset_minutes: row.get(3)?,
        quiet_hours_start: row.get(4)?,
        quiet_hours_end: row.get(5)?,
        hourly_send_limit: row.get(6)?,
        daily_send_limit: row.get(7)?,
        cooldown_days: row.get(8)?,
        created_at: parse_ts(&row.get::<_, String>(9)?),
    })
}

const TEMPLATE_SELECT: &str = "SELECT id, business_id, key, name, channels, subject, body, service_type, \
     keywords, is_default, delay_ms, last_used_at, created_at FROM automation_templates";

fn row_to_template(row: &rusqlite::Row) -> rusqlite::Result<AutomationTemplate> {
    let channels_json: String = row.get(4)?;
    let keywords_json: String = row.get(8)?;
    Ok(AutomationTemplate {
        id: row.get(0)?,
        business_id: row.get(1)?,
        key: row.get(2)?,
        name: row.get(3)?,
        channels: serde_json::from_str(&channels_json).unwrap_or_default(),
        subject: row.get(5)?,
        body: row.get(6)?,
        service_type: row.get(7)?,
        keywords: serde_json::from_str(&keywords_json).unwrap_or_default(),
        is_default: row.get::<_, i64>(9)? != 0,
        delay_ms: row.get(10)?,
        last_used_at: parse_opt_ts(row.get(11)?),
        created_at: parse_ts(&row.get::<_, String>(12)?),
    })
}

impl Store {
    // ─── Businesses ──────────────────────────────────────

    pub fn create_business(&self, input: NewBusiness) -> Result<Business> {
        let id = new_id();
        let now = Utc::now();
        self.conn
            .execute(
                "INSERT INTO businesses
                 (id, name, review_link, utc_offset_minutes, quiet_hours_start, quiet_hours_end,
                  hourly_send_limit, daily_send_limit, cooldown_days, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                params![
                    id,
                    input.name,
                    input.review_link,
                    input.utc_offset_minutes,
                    input.quiet_hours_start,
                    input.quiet_hours_end,
                    input.hourly_send_limit,
                    input.daily_send_limit,
                    input.cooldown_days,
                    ts(now),
                ],
            )
            .map_err(|e| RevloopError::Db(format!("Create business: {e}")))?;
        Ok(Business {
            id,
            name: input.name,
            review_link: input.review_link,
            utc_offset_minutes: input.utc_offset_minutes,
            quiet_hours_start: input.quiet_hours_start,
            quiet_hours_end: input.quiet_hours_end,
            hourly_send_limit: input.hourly_send_limit,
            daily_send_limit: input.daily_send_limit,
            cooldown_days: input.cooldown_days,
            created_at: now,
        })
    }

    pub fn get_business(&self, ctx: &TenantCtx) -> Result<Business> {
        self.conn
            .query_row(
                &format!("{BUSINESS_SELECT} WHERE id = ?1"),
                [ctx.business_id()],
                row_to_business,
            )
            .map_err(|e| RevloopError::Db(format!("Get business: {e}")))
    }

    pub fn list_businesses(&self) -> Result<Vec<Business>> {
        let mut stmt = self
            .conn
            .prepare(&format!("{BUSINESS_SELECT} ORDER BY created_at"))
            .map_err(|e| RevloopError::Db(format!("List businesses: {e}")))?;
        let rows = stmt
            .query_map([], row_to_business)
            .map_err(|e| RevloopError::Db(format!("List businesses: {e}")))?;
        Ok(rows.filter_map(|r| r.ok()).collect())
    }

    // ─── Customers ──────────────────────────────────────

    pub fn create_customer(&self, ctx: &TenantCtx, input: NewCustomer) -> Result<Customer> {
        let id = new_id();
        let now = Utc::now();
        self.conn
            .execute(
                "INSERT INTO customers
                 (id, business_id, name, email, phone, external_id, source, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?8)",
                params![
                    id,
                    ctx.business_id(),
                    input.name,
                    input.email,
                    input.phone,
                    input.external_id,
                    input.source,
                    ts(now),
                ],
            )
            .map_err(|e| RevloopError::Db(format!("Create customer: {e}")))?;
        self.get_customer(ctx, &id)?
            .ok_or_else(|| RevloopError::db("customer vanished after insert"))
    }

    pub fn get_customer(&self, ctx: &TenantCtx, id: &str) -> Result<Option<Customer>> {
        self.conn
            .query_row(
                &format!("{CUSTOMER_SELECT} WHERE id = ?1 AND business_id = ?2"),
                params![id, ctx.business_id()],
                row_to_customer,
            )
            .optional()
            .map_err(|e| RevloopError::Db(format!("Get customer: {e}")))
    }

    pub fn find_customer_by_external(
        &self,
        ctx: &TenantCtx,
        source: &str,
        external_id: &str,
    ) -> Result<Option<Customer>> {
        self.conn
            .query_row(
                &format!(
                    "{CUSTOMER_SELECT} WHERE business_id = ?1 AND source = ?2 AND external_id = ?3"
                ),
                params![ctx.business_id(), source, external_id],
                row_to_customer,
            )
            .optional()
            .map_err(|e| RevloopError::Db(format!("Find customer: {e}")))
    }

    pub fn find_customer_by_email(
        &self,
        ctx: &TenantCtx,
        email: &str,
    ) -> Result<Option<Customer>> {
        self.conn
            .query_row(
                &format!("{CUSTOMER_SELECT} WHERE business_id = ?1 AND email = ?2"),
                params![ctx.business_id(), email],
                row_to_customer,
            )
            .optional()
            .map_err(|e| RevloopError::Db(format!("Find customer: {e}")))
    }

    pub fn find_customer_by_phone(
        &self,
        ctx: &TenantCtx,
        phone: &str,
    ) -> Result<Option<Customer>> {
        self.conn
            .query_row(
                &format!("{CUSTOMER_SELECT} WHERE business_id = ?1 AND phone = ?2"),
                params![ctx.business_id(), phone],
                row_to_customer,
            )
            .optional()
            .map_err(|e| RevloopError::Db(format!("Find customer: {e}")))
    }

    /// CRM sync: update the record matching (source, external_id) or create
    /// it. Contact fields are refreshed from the upstream system.
    pub fn upsert_customer_external(
        &self,
        ctx: &TenantCtx,
        input: NewCustomer,
    ) -> Result<Customer> {
        let (Some(source), Some(external_id)) = (input.source.clone(), input.external_id.clone())
        else {
            return Err(RevloopError::config(
                "upsert_customer_external requires source and external_id",
            ));
        };
        if let Some(existing) = self.find_customer_by_external(ctx, &source, &external_id)? {
            self.conn
                .execute(
                    "UPDATE customers SET name = ?1, email = ?2, phone = ?3, updated_at = ?4
                     WHERE id = ?5 AND business_id = ?6",
                    params![
                        input.name,
                        input.email.or(existing.email.clone()),
                        input.phone.or(existing.phone.clone()),
                        ts(Utc::now()),
                        existing.id,
                        ctx.business_id(),
                    ],
                )
                .map_err(|e| RevloopError::Db(format!("Sync customer: {e}")))?;
            return self
                .get_customer(ctx, &existing.id)?
                .ok_or_else(|| RevloopError::db("customer vanished during sync"));
        }
        self.create_customer(ctx, input)
    }

    pub fn set_customer_opt_out(
        &self,
        ctx: &TenantCtx,
        id: &str,
        channel: ChannelKind,
        opted_out: bool,
    ) -> Result<()> {
        let column = match channel {
            ChannelKind::Email => "email_opt_out",
            ChannelKind::Sms => "sms_opt_out",
        };
        self.conn
            .execute(
                &format!(
                    "UPDATE customers SET {column} = ?1, updated_at = ?2
                     WHERE id = ?3 AND business_id = ?4"
                ),
                params![opted_out as i64, ts(Utc::now()), id, ctx.business_id()],
            )
            .map_err(|e| RevloopError::Db(format!("Opt-out update: {e}")))?;
        Ok(())
    }

    pub fn suppress_customer(&self, ctx: &TenantCtx, id: &str) -> Result<()> {
        self.conn
            .execute(
                "UPDATE customers SET suppressed = 1, updated_at = ?1
                 WHERE id = ?2 AND business_id = ?3",
                params![ts(Utc::now()), id, ctx.business_id()],
            )
            .map_err(|e| RevloopError::Db(format!("Suppress customer: {e}")))?;
        Ok(())
    }

    // ─── Templates ──────────────────────────────────────

    pub fn create_template(&self, ctx: &TenantCtx, input: NewTemplate) -> Result<AutomationTemplate> {
        let id = new_id();
        let now = Utc::now();
        let channels = serde_json::to_string(&input.channels).unwrap_or_else(|_| "[]".into());
        let keywords = serde_json::to_string(&input.keywords).unwrap_or_else(|_| "[]".into());
        self.conn
            .execute(
                "INSERT INTO automation_templates
                 (id, business_id, key, name, channels, subject, body, service_type,
                  keywords, is_default, delay_ms, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
                params![
                    id,
                    ctx.business_id(),
                    input.key,
                    input.name,
                    channels,
                    input.subject,
                    input.body,
                    input.service_type,
                    keywords,
                    input.is_default as i64,
                    input.delay_ms,
                    ts(now),
                ],
            )
            .map_err(|e| match e {
                rusqlite::Error::SqliteFailure(err, _)
                    if err.code == rusqlite::ErrorCode::ConstraintViolation =>
                {
                    RevloopError::duplicate(format!("template key '{}'", input.key))
                }
                other => RevloopError::Db(format!("Create template: {other}")),
            })?;
        Ok(AutomationTemplate {
            id,
            business_id: ctx.business_id().to_string(),
            key: input.key,
            name: input.name,
            channels: input.channels,
            subject: input.subject,
            body: input.body,
            service_type: input.service_type,
            keywords: input.keywords,
            is_default: input.is_default,
            delay_ms: input.delay_ms,
            last_used_at: None,
            created_at: now,
        })
    }

    pub fn list_templates(&self, ctx: &TenantCtx) -> Result<Vec<AutomationTemplate>> {
        let mut stmt = self
            .conn
            .prepare(&format!(
                "{TEMPLATE_SELECT} WHERE business_id = ?1 ORDER BY key"
            ))
            .map_err(|e| RevloopError::Db(format!("List templates: {e}")))?;
        let rows = stmt
            .query_map([ctx.business_id()], row_to_template)
            .map_err(|e| RevloopError::Db(format!("List templates: {e}")))?;
        Ok(rows.filter_map(|r| r.ok()).collect())
    }

    pub fn get_template_by_key(
        &self,
        ctx: &TenantCtx,
        key: &str,
    ) -> Result<Option<AutomationTemplate>> {
        self.conn
            .query_row(
                &format!("{TEMPLATE_SELECT} WHERE business_id = ?1 AND key = ?2"),
                params![ctx.business_id(), key],
                row_to_template,
            )
            .optional()
            .map_err(|e| RevloopError::Db(format!("Get template: {e}")))
    }

    /// Bookkeeping only; callers `.ok()` this.
    pub fn touch_template_used(&self, ctx: &TenantCtx, id: &str, now: DateTime<Utc>) -> Result<()> {
        self.conn
            .execute(
                "UPDATE automation_templates SET last_used_at = ?1
                 WHERE id = ?2 AND business_id = ?3",
                params![ts(now), id, ctx.business_id()],
            )
            .map_err(|e| RevloopError::Db(format!("Touch template: {e}")))?;
        Ok(())
    }

    // ─── Send log ──────────────────────────────────────

    pub fn record_send(
        &self,
        ctx: &TenantCtx,
        customer_id: &str,
        channel: ChannelKind,
        now: DateTime<Utc>,
    ) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO send_log (business_id, customer_id, channel, sent_at)
                 VALUES (?1, ?2, ?3, ?4)",
                params![ctx.business_id(), customer_id, channel.as_str(), ts(now)],
            )
            .map_err(|e| RevloopError::Db(format!("Record send: {e}")))?;
        Ok(())
    }

    /// Trailing-window counts feeding the rate-limit and cooldown checks.
    pub fn send_counters(
        &self,
        ctx: &TenantCtx,
        customer_id: &str,
        channel: ChannelKind,
        now: DateTime<Utc>,
    ) -> Result<SendCounters> {
        let hour_ago = ts(now - Duration::hours(1));
        let day_ago = ts(now - Duration::days(1));
        let hour_count: u32 = self
            .conn
            .query_row(
                "SELECT COUNT(*) FROM send_log
                 WHERE business_id = ?1 AND channel = ?2 AND sent_at > ?3",
                params![ctx.business_id(), channel.as_str(), hour_ago],
                |row| row.get(0),
            )
            .map_err(|e| RevloopError::Db(format!("Send counters: {e}")))?;
        let day_count: u32 = self
            .conn
            .query_row(
                "SELECT COUNT(*) FROM send_log
                 WHERE business_id = ?1 AND channel = ?2 AND sent_at > ?3",
                params![ctx.business_id(), channel.as_str(), day_ago],
                |row| row.get(0),
            )
            .map_err(|e| RevloopError::Db(format!("Send counters: {e}")))?;
        // Cooldown is per customer across all channels.
        let last: Option<String> = self
            .conn
            .query_row(
                "SELECT MAX(sent_at) FROM send_log
                 WHERE business_id = ?1 AND customer_id = ?2",
                params![ctx.business_id(), customer_id],
                |row| row.get(0),
            )
            .map_err(|e| RevloopError::Db(format!("Send counters: {e}")))?;
        Ok(SendCounters {
            hour_count,
            day_count,
            last_to_customer: parse_opt_ts(last),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::temp_store;

    fn make_business(store: &Store) -> TenantCtx {
        let biz = store
            .create_business(NewBusiness {
                name: "Ace Plumbing".into(),
                review_link: Some("https://g.page/ace/review".into()),
                utc_offset_minutes: -300,
                quiet_hours_start: Some(21),
                quiet_hours_end: Some(8),
                hourly_send_limit: 25,
                daily_send_limit: 100,
                cooldown_days: 30,
            })
            .unwrap();
        store.tenant_ctx(&biz.id).unwrap()
    }

    #[test]
    fn test_customer_crud_is_tenant_scoped() {
        let (store, dir) = temp_store("dir-scope");
        let ctx_a = make_business(&store);
        let ctx_b = make_business(&store);

        let c = store
            .create_customer(
                &ctx_a,
                NewCustomer {
                    name: "Dana Fox".into(),
                    email: Some("dana@example.com".into()),
                    ..Default::default()
                },
            )
            .unwrap();

        assert!(store.get_customer(&ctx_a, &c.id).unwrap().is_some());
        // Same row id through the wrong tenant resolves to nothing.
        assert!(store.get_customer(&ctx_b, &c.id).unwrap().is_none());
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_upsert_by_external_id() {
        let (store, dir) = temp_store("dir-upsert");
        let ctx = make_business(&store);

        let first = store
            .upsert_customer_external(
                &ctx,
                NewCustomer {
                    name: "Sam Li".into(),
                    email: Some("sam@example.com".into()),
                    external_id: Some("crm-42".into()),
                    source: Some("fieldcrm".into()),
                    ..Default::default()
                },
            )
            .unwrap();
        let second = store
            .upsert_customer_external(
                &ctx,
                NewCustomer {
                    name: "Samuel Li".into(),
                    phone: Some("+15550100".into()),
                    external_id: Some("crm-42".into()),
                    source: Some("fieldcrm".into()),
                    ..Default::default()
                },
            )
            .unwrap();

        assert_eq!(first.id, second.id);
        assert_eq!(second.name, "Samuel Li");
        // Existing contact info is kept when the sync omits it.
        assert_eq!(second.email.as_deref(), Some("sam@example.com"));
        assert_eq!(second.phone.as_deref(), Some("+15550100"));
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_send_counters_window() {
        let (store, dir) = temp_store("dir-counters");
        let ctx = make_business(&store);
        let c = store
            .create_customer(
                &ctx,
                NewCustomer {
                    name: "Dana Fox".into(),
                    email: Some("dana@example.com".into()),
                    ..Default::default()
                },
            )
            .unwrap();

        let now = Utc::now();
        store
            .record_send(&ctx, &c.id, ChannelKind::Email, now - Duration::minutes(30))
            .unwrap();
        store
            .record_send(&ctx, &c.id, ChannelKind::Email, now - Duration::hours(5))
            .unwrap();
        store
            .record_send(&ctx, &c.id, ChannelKind::Sms, now - Duration::minutes(10))
            .unwrap();

        let counters = store
            .send_counters(&ctx, &c.id, ChannelKind::Email, now)
            .unwrap();
        assert_eq!(counters.hour_count, 1);
        assert_eq!(counters.day_count, 2);
        // Cooldown tracking spans channels — the SMS ten minutes ago wins.
        let last = counters.last_to_customer.unwrap();
        assert!(now - last < Duration::minutes(11));
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_opt_out_and_suppression_flags() {
        let (store, dir) = temp_store("dir-consent");
        let ctx = make_business(&store);
        let c = store
            .create_customer(
                &ctx,
                NewCustomer {
                    name: "Dana Fox".into(),
                    email: Some("dana@example.com".into()),
                    phone: Some("+15550100".into()),
                    ..Default::default()
                },
            )
            .unwrap();

        store
            .set_customer_opt_out(&ctx, &c.id, ChannelKind::Email, true)
            .unwrap();
        let updated = store.get_customer(&ctx, &c.id).unwrap().unwrap();
        assert!(updated.email_opt_out);
        assert!(!updated.sms_opt_out);
        assert!(updated.opted_out_of(ChannelKind::Email));

        store.suppress_customer(&ctx, &c.id).unwrap();
        let suppressed = store.get_customer(&ctx, &c.id).unwrap().unwrap();
        assert!(suppressed.suppressed);
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_duplicate_template_key_rejected() {
        let (store, dir) = temp_store("dir-template");
        let ctx = make_business(&store);
        let input = NewTemplate {
            key: "post_job_review".into(),
            name: "Post-job review ask".into(),
            channels: vec![ChannelKind::Email],
            subject: Some("How did we do?".into()),
            body: "Hi {{customer.first_name}}, leave us a review: {{review_link}}".into(),
            service_type: None,
            keywords: vec![],
            is_default: true,
            delay_ms: 0,
        };
        store.create_template(&ctx, input.clone()).unwrap();
        assert!(matches!(
            store.create_template(&ctx, input),
            Err(RevloopError::Duplicate(_))
        ));
        std::fs::remove_dir_all(&dir).ok();
    }
}
