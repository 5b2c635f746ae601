//! Template selection and `{{variable}}` rendering.

use revloop_core::types::ChannelKind;
use revloop_db::{AutomationTemplate, Business, Customer};

/// Values available to message templates.
pub struct RenderVars<'a> {
    pub customer_name: &'a str,
    pub customer_first_name: &'a str,
    pub business_name: &'a str,
    pub review_link: &'a str,
}

impl<'a> RenderVars<'a> {
    pub fn new(business: &'a Business, customer: &'a Customer) -> Self {
        Self {
            customer_name: &customer.name,
            customer_first_name: customer.first_name(),
            business_name: &business.name,
            review_link: business.review_link.as_deref().unwrap_or(""),
        }
    }
}

/// Substitute known placeholders. Unknown placeholders are left intact —
/// a typo should be visible in the delivered text, not silently dropped.
pub fn render(template: &str, vars: &RenderVars) -> String {
    template
        .replace("{{customer.name}}", vars.customer_name)
        .replace("{{customer.first_name}}", vars.customer_first_name)
        .replace("{{business.name}}", vars.business_name)
        .replace("{{review_link}}", vars.review_link)
}

/// Pick the best template for a send by explicit specificity ranking:
/// exact service-type match (3) beats a keyword hit (2) beats the default
/// flag (1). Unranked templates never match; ties break on key so selection
/// is deterministic, never insertion-order coincidence.
pub fn select_template<'a>(
    templates: &'a [AutomationTemplate],
    channel: ChannelKind,
    service_type: Option<&str>,
    text_hint: Option<&str>,
) -> Option<&'a AutomationTemplate> {
    let hint = text_hint.map(|h| h.to_lowercase());
    templates
        .iter()
        .filter(|t| t.channels.contains(&channel))
        .filter_map(|t| {
            let score = specificity(t, service_type, hint.as_deref());
            (score > 0).then_some((score, t))
        })
        .max_by(|(sa, ta), (sb, tb)| sa.cmp(sb).then_with(|| tb.key.cmp(&ta.key)))
        .map(|(_, t)| t)
}

fn specificity(
    template: &AutomationTemplate,
    service_type: Option<&str>,
    hint: Option<&str>,
) -> u8 {
    if let (Some(st), Some(tst)) = (service_type, template.service_type.as_deref())
        && st.eq_ignore_ascii_case(tst)
    {
        return 3;
    }
    if let Some(h) = hint
        && template
            .keywords
            .iter()
            .any(|kw| h.contains(&kw.to_lowercase()))
    {
        return 2;
    }
    if template.is_default {
        return 1;
    }
    0
}
